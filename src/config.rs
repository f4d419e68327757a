//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `NOORI__*` 覆盖（双下划线表示嵌套，如 `NOORI__ENGINE__MAX_DEPTH=5`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineSection,
    pub llm: LlmSection,
    /// 启动时注册的子 Agent
    pub agents: Vec<AgentSection>,
}

/// [engine] 段：调度边界
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// 最大委派深度（根任务深度为 0）
    pub max_depth: usize,
    /// 单个任务最多推理轮数
    pub max_rounds: usize,
    /// 终态格式错误时最多重新提示几次
    pub max_format_retries: usize,
    /// 同时执行的工具调用上限
    pub max_concurrent_tools: usize,
    pub tool_timeout_secs: u64,
    pub agent_timeout_secs: u64,
    pub step_timeout_secs: u64,
    /// 根任务上下文中保留的最近对话轮数（0 表示不保留）
    pub history_turns: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_rounds: 20,
            max_format_retries: 2,
            max_concurrent_tools: 3,
            tool_timeout_secs: 30,
            agent_timeout_secs: 300,
            step_timeout_secs: 120,
            history_turns: 10,
        }
    }
}

/// [llm] 段：后端选择
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；没有 API Key 时回退到 mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            base_url: None,
        }
    }
}

/// [[agents]] 项
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system_prompt: String,
}

/// 从 config 目录加载配置，环境变量 NOORI__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 NOORI__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("NOORI")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
