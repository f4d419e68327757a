//! Echo 工具（测试与离线运行用）

use async_trait::async_trait;

use crate::tools::{InvocationContext, Tool};

/// Echo 工具：返回去掉首尾空白的指令内容，空内容返回 "(empty)"
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Returns its input with surrounding whitespace trimmed, or \"(empty)\" for blank input (for testing)."
    }

    async fn invoke(&self, payload: &str, _ctx: &InvocationContext) -> Result<String, String> {
        let text = payload.trim();
        if text.is_empty() {
            Ok("(empty)".to_string())
        } else {
            Ok(text.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskId;

    fn ctx() -> InvocationContext {
        InvocationContext {
            task_id: TaskId::new(),
            depth: 1,
            target: "echo".to_string(),
        }
    }

    #[tokio::test]
    async fn test_echo_trims_input() {
        assert_eq!(EchoTool.invoke("  hi there \n", &ctx()).await.unwrap(), "hi there");
        assert!(EchoTool.description().contains("trimmed"));
    }

    #[tokio::test]
    async fn test_echo_blank_input() {
        assert_eq!(EchoTool.invoke(" \t ", &ctx()).await.unwrap(), "(empty)");
        assert_eq!(EchoTool.invoke("", &ctx()).await.unwrap(), "(empty)");
    }
}
