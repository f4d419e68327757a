//! 引擎错误类型与恢复动作
//!
//! 两层错误：
//! - DirectiveError：单条指令范围内的错误，作为数据折回父任务上下文，由下一轮推理决定如何处理
//! - EngineError：整轮对话级别的错误，交给传输层（只有 DispatcherFault 是内部簿记错误）

use thiserror::Error;

use crate::protocol::MalformedResponse;
use crate::tools::Role;

/// 指令级错误（可恢复，折回父任务）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectiveError {
    #[error("unknown capability '{0}'")]
    UnknownCapability(String),

    #[error("'{target}' is registered with role {actual}, expected role {expected}")]
    RoleMismatch {
        target: String,
        expected: Role,
        actual: Role,
    },

    #[error("delegation depth {depth} exceeds the maximum of {max}")]
    DepthExceeded { depth: usize, max: usize },

    #[error("'{target}' timed out after {after_ms} ms")]
    Timeout { target: String, after_ms: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("'{target}' failed: {reason}")]
    HandlerFailed { target: String, reason: String },
}

/// 整轮对话错误（返回给传输层）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("malformed terminal response: {0}")]
    MalformedTerminalResponse(#[from] MalformedResponse),

    #[error("turn cancelled")]
    Cancelled,

    #[error("no final answer after {0} reasoning rounds")]
    RoundLimitExceeded(usize),

    #[error("reasoning step failed: {0}")]
    ReasoningStep(String),

    #[error("reasoning step timed out after {0} ms")]
    StepTimeout(u64),

    #[error("dispatcher fault: {0}")]
    DispatcherFault(String),
}

impl EngineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::DispatcherFault(_))
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 将提示注入下一轮，让推理步骤重试（如终态格式错误）
    RetryWithPrompt(String),
    /// 终止当前任务
    Abort,
}
