//! 错误恢复引擎
//!
//! 终态回复格式错误时不直接失败，而是把违规原因写回上下文让推理步骤重来，
//! 次数受 max_format_retries 限制；其余错误一律终止当前任务。

use crate::core::{EngineError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作（重试提示 / 终止）
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_format_retries: usize,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(2)
    }
}

impl RecoveryEngine {
    pub fn new(max_format_retries: usize) -> Self {
        Self { max_format_retries }
    }

    /// `attempts` 为该任务已进行的格式重试次数
    pub fn handle(&self, err: &EngineError, attempts: usize) -> RecoveryAction {
        match err {
            EngineError::MalformedTerminalResponse(reason) if attempts < self.max_format_retries => {
                RecoveryAction::RetryWithPrompt(format!(
                    "Your previous reply was rejected: {reason}. \
                     Either continue working by emitting directives, or reply with exactly one \
                     <final_answer>...</final_answer> block that contains your whole answer, \
                     with nothing before or after it."
                ))
            }
            _ => RecoveryAction::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MalformedResponse;

    #[test]
    fn test_recovery_malformed_retries() {
        let engine = RecoveryEngine::new(2);
        let err = EngineError::MalformedTerminalResponse(MalformedResponse::NoMarker);
        match engine.handle(&err, 0) {
            RecoveryAction::RetryWithPrompt(msg) => {
                assert!(msg.contains("<final_answer>"));
                assert!(msg.contains("no <final_answer> marker"));
            }
            other => panic!("Expected RetryWithPrompt, got {other:?}"),
        }
        assert!(matches!(
            engine.handle(&err, 1),
            RecoveryAction::RetryWithPrompt(_)
        ));
    }

    #[test]
    fn test_recovery_malformed_budget_exhausted() {
        let engine = RecoveryEngine::new(2);
        let err = EngineError::MalformedTerminalResponse(MalformedResponse::DuplicateMarker(2));
        assert_eq!(engine.handle(&err, 2), RecoveryAction::Abort);
    }

    #[test]
    fn test_recovery_zero_budget() {
        let engine = RecoveryEngine::new(0);
        let err = EngineError::MalformedTerminalResponse(MalformedResponse::NoMarker);
        assert_eq!(engine.handle(&err, 0), RecoveryAction::Abort);
    }

    #[test]
    fn test_recovery_other_errors_abort() {
        let engine = RecoveryEngine::default();
        for err in [
            EngineError::Cancelled,
            EngineError::RoundLimitExceeded(20),
            EngineError::ReasoningStep("boom".to_string()),
            EngineError::DispatcherFault("bad tree".to_string()),
        ] {
            assert_eq!(engine.handle(&err, 0), RecoveryAction::Abort);
        }
    }
}
