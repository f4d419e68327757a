//! 推理步骤：Planner
//!
//! 推理步骤对引擎而言是不透明的纯函数 `step(context) -> text`。
//! 默认实现 Planner 持有 LLM 与 system prompt，prompt 中说明指令协议并列出可用的 Agent / Tool；
//! 输出以流式读取，完成标记闭合后不再读取后续分片。

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::llm::LlmClient;
use crate::memory::Message;
use crate::protocol::ResponseAssembler;

/// 推理步骤：根据任务上下文生成一段文本（可能含指令或完成标记）
#[async_trait]
pub trait ReasoningStep: Send + Sync {
    async fn step(&self, context: &[Message]) -> Result<String, String>;
}

/// 指令协议说明，拼在每个 Planner 的 system prompt 之后
pub fn protocol_instructions(catalog: &str) -> String {
    let catalog = if catalog.is_empty() {
        "(none)"
    } else {
        catalog
    };
    format!(
        "## Directives\n\
         To call a tool, write <tool_call: NAME>input</tool_call>.\n\
         To hand a sub-task to another agent, write <delegate_to: NAME>task</delegate_to>.\n\
         You may emit several directives in one reply; they run in parallel and their results come back \
         as <directive_result> blocks in the order you wrote them.\n\
         When you are done, reply with exactly one <final_answer>...</final_answer> block that contains \
         your whole answer, with nothing before or after it and no directives inside it.\n\n\
         ## Available capabilities\n{catalog}"
    )
}

/// Planner：持有 LLM 与 system prompt，每步拼 system + context 后调用 LLM
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
        }
    }

    /// 在 system prompt 后附加指令协议说明与能力目录
    pub fn with_catalog(mut self, catalog: &str) -> Self {
        self.system_prompt = format!(
            "{}\n\n{}",
            self.system_prompt.trim_end(),
            protocol_instructions(catalog)
        );
        self
    }

    pub fn base_system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }
}

#[async_trait]
impl ReasoningStep for Planner {
    async fn step(&self, context: &[Message]) -> Result<String, String> {
        let mut full_messages = Vec::with_capacity(context.len() + 1);
        full_messages.push(Message::system(self.system_prompt.clone()));
        full_messages.extend(context.iter().cloned());

        let mut stream = self.llm.complete_stream(&full_messages).await?;
        let mut assembler = ResponseAssembler::new();
        while let Some(chunk) = stream.next().await {
            if assembler.push(&chunk?) {
                tracing::trace!("final answer closed, stop reading stream");
                break;
            }
        }
        Ok(assembler.into_text())
    }
}
