//! DeepSeek 后端（OpenAI 兼容端点）
//!
//! deepseek-chat 响应快，适合作为子 Agent 的推理步骤；deepseek-reasoner 适合根任务的复杂规划。

use crate::llm::OpenAiClient;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const DEEPSEEK_REASONER: &str = "deepseek-reasoner";

/// 创建 DeepSeek 客户端
///
/// Key 取 `DEEPSEEK_API_KEY`，缺省回退到 `OPENAI_API_KEY`；
/// 模型依次取参数、`DEEPSEEK_MODEL`、deepseek-chat；`base_url` 为空时用官方端点。
pub fn create_deepseek_client(model: Option<&str>, base_url: Option<&str>) -> OpenAiClient {
    let api_key = std::env::var("DEEPSEEK_API_KEY")
        .ok()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());

    let model = model
        .map(String::from)
        .or_else(|| std::env::var("DEEPSEEK_MODEL").ok())
        .unwrap_or_else(|| DEEPSEEK_CHAT.to_string());

    OpenAiClient::new(
        Some(base_url.unwrap_or(DEEPSEEK_BASE_URL)),
        &model,
        api_key.as_deref(),
    )
}
