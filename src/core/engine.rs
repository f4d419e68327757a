//! 引擎门面：传输层（REPL、机器人等）唯一需要的入口
//!
//! from_config 根据配置选择 LLM 后端、注册内置工具与 [[agents]]，并构建根 Planner；
//! submit 跑完一轮对话（根任务可见最近几轮已交付的对话），cancel 取消所有在途对话。

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::{AppConfig, EngineSection, LlmSection};
use crate::core::{DispatchLimits, Dispatcher, EngineError, SessionSupervisor};
use crate::llm::{create_deepseek_client, LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::{ConversationMemory, Message};
use crate::react::{DispatchEvent, Planner, ReasoningStep};
use crate::tools::{render_catalog, CapabilityRegistry, EchoTool, Role, Tool};

const ROOT_SYSTEM_PROMPT: &str = "You are Noori, a smart personal assistant.\n\
Be concise but helpful, handle errors gracefully, and only ask questions if absolutely necessary.\n\
Use the capabilities below when they help; otherwise answer directly.";

/// 根据配置与环境变量选择 LLM 后端（DeepSeek / OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    let provider = cfg.provider.to_lowercase();
    let has_deepseek_key = std::env::var("DEEPSEEK_API_KEY").is_ok();
    let has_openai_key = std::env::var("OPENAI_API_KEY").is_ok();

    match provider.as_str() {
        "mock" => {
            tracing::info!("Using Mock LLM");
            Arc::new(MockLlmClient)
        }
        "deepseek" if has_deepseek_key || has_openai_key => {
            tracing::info!("Using DeepSeek LLM ({})", cfg.model);
            Arc::new(create_deepseek_client(
                Some(&cfg.model),
                cfg.base_url.as_deref(),
            ))
        }
        "openai" if has_openai_key => {
            tracing::info!("Using OpenAI LLM ({})", cfg.model);
            Arc::new(OpenAiClient::new(
                cfg.base_url.as_deref(),
                &cfg.model,
                std::env::var("OPENAI_API_KEY").ok().as_deref(),
            ))
        }
        _ => {
            tracing::warn!(
                "No API key set or provider '{}' unknown, using Mock LLM",
                cfg.provider
            );
            Arc::new(MockLlmClient)
        }
    }
}

/// 指令派发引擎
pub struct Engine {
    dispatcher: Dispatcher,
    root: Arc<dyn ReasoningStep>,
    supervisor: SessionSupervisor,
    history: Mutex<ConversationMemory>,
}

impl Engine {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        root: Arc<dyn ReasoningStep>,
        limits: DispatchLimits,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(registry, limits),
            root,
            supervisor: SessionSupervisor::new(),
            history: Mutex::new(ConversationMemory::new(
                EngineSection::default().history_turns,
            )),
        }
    }

    /// 设置根任务可见的最近对话轮数
    pub fn with_history(mut self, turns: usize) -> Self {
        self.history = Mutex::new(ConversationMemory::new(turns));
        self
    }

    /// 订阅调度事件
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<DispatchEvent>) -> Self {
        self.dispatcher = self.dispatcher.with_events(tx);
        self
    }

    /// 按配置组装：内置 echo 工具 + [[agents]]（每个 Agent 的目录中不含自身）+ 根 Planner
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        let llm = create_llm_from_config(&cfg.llm);
        let echo = EchoTool;

        let mut entries: Vec<(String, Role, String)> = vec![(
            echo.name().to_string(),
            Role::Tool,
            echo.description().to_string(),
        )];
        entries.extend(
            cfg.agents
                .iter()
                .map(|a| (a.name.clone(), Role::Agent, a.description.clone())),
        );
        let catalog = |exclude: Option<&str>| {
            render_catalog(
                entries.iter().map(|(n, r, d)| (n.as_str(), *r, d.as_str())),
                exclude,
            )
        };

        let mut builder = CapabilityRegistry::builder();
        builder.register_tool(echo)?;
        for agent in &cfg.agents {
            let prompt = if agent.system_prompt.trim().is_empty() {
                format!("You are {}. {}", agent.name, agent.description)
            } else {
                agent.system_prompt.clone()
            };
            let planner = Planner::new(llm.clone(), prompt)
                .with_catalog(&catalog(Some(agent.name.as_str())));
            builder.register_agent(
                agent.name.clone(),
                agent.description.clone(),
                Arc::new(planner),
            )?;
            tracing::debug!("Registered agent {}", agent.name);
        }
        let registry = Arc::new(builder.build());
        tracing::info!(capabilities = registry.len(), "Capability registry ready");

        let root = Planner::new(llm, ROOT_SYSTEM_PROMPT).with_catalog(&catalog(None));
        Ok(Self::new(
            registry,
            Arc::new(root),
            DispatchLimits::from(&cfg.engine),
        )
        .with_history(cfg.engine.history_turns))
    }

    fn history(&self) -> Result<MutexGuard<'_, ConversationMemory>, EngineError> {
        self.history.lock().map_err(|_| {
            EngineError::DispatcherFault("conversation history lock poisoned".to_string())
        })
    }

    /// 提交一轮用户输入，返回根任务的最终回答；成功交付的回答记入对话历史
    pub async fn submit(&self, input: &str) -> Result<String, EngineError> {
        let turn = uuid::Uuid::new_v4();
        let token = self.supervisor.begin_turn();
        let span = tracing::info_span!("turn", id = %turn);
        let history: Vec<Message> = self.history()?.messages().to_vec();

        let answer = self
            .dispatcher
            .run_turn_after(self.root.as_ref(), &history, input, token)
            .instrument(span)
            .await?;
        self.history()?.record_turn(input, &answer);
        Ok(answer)
    }

    /// 取消所有在途对话；之后提交的对话不受影响
    pub fn cancel(&self) {
        tracing::info!("Cancelling in-flight turns");
        self.supervisor.cancel();
    }

    pub fn shutdown(&self) {
        self.supervisor.shutdown();
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        self.dispatcher.registry()
    }

    /// 任务树中的存活任务数（对话结束后应回到 0）
    pub fn live_tasks(&self) -> Result<usize, EngineError> {
        self.dispatcher.live_tasks()
    }

    /// 对话历史中的消息数
    pub fn history_len(&self) -> Result<usize, EngineError> {
        Ok(self.history()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentSection;

    fn mock_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".to_string();
        cfg
    }

    #[tokio::test]
    async fn test_submit_with_mock() {
        let engine = Engine::from_config(&mock_config()).unwrap();
        let out = engine.submit("hello").await.unwrap();
        assert_eq!(out, "Echo from Mock: hello");
        assert_eq!(engine.live_tasks().unwrap(), 0);
        assert_eq!(engine.history_len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_turn_is_not_remembered() {
        let mut cfg = mock_config();
        cfg.engine.history_turns = 1;
        let engine = Engine::from_config(&cfg).unwrap();
        engine.submit("first").await.unwrap();
        engine.submit("second").await.unwrap();
        assert_eq!(engine.history_len().unwrap(), 2);

        engine.shutdown();
        assert!(engine.submit("third").await.is_err());
        assert_eq!(engine.history_len().unwrap(), 2);
    }

    #[test]
    fn test_agents_are_registered() {
        let mut cfg = mock_config();
        cfg.agents.push(AgentSection {
            name: "planner_agent".to_string(),
            description: "Breaks tasks down".to_string(),
            system_prompt: String::new(),
        });
        let engine = Engine::from_config(&cfg).unwrap();
        assert_eq!(engine.registry().names(), vec!["echo", "planner_agent"]);
        assert_eq!(
            engine.registry().resolve("planner_agent").unwrap().role,
            Role::Agent
        );
    }

    #[test]
    fn test_agent_name_clash_is_rejected() {
        let mut cfg = mock_config();
        cfg.agents.push(AgentSection {
            name: "echo".to_string(),
            description: String::new(),
            system_prompt: String::new(),
        });
        assert!(Engine::from_config(&cfg).is_err());
    }
}
