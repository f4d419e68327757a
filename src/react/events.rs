//! 调度过程事件：用于日志、CLI 与测试观察任务树的变化

use serde::Serialize;

use crate::core::task_scheduler::TaskId;
use crate::core::task_tree::TaskStatus;
use crate::protocol::DirectiveKind;

/// 单步调度事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// 任务开始新一轮推理
    RoundStarted {
        task: TaskId,
        depth: usize,
        round: usize,
    },
    /// 推理输出（预览）
    ReasoningOutput { task: TaskId, preview: String },
    /// 标记解析诊断
    ParseDiagnostic { task: TaskId, message: String },
    /// 指令已派发为子任务
    DirectiveDispatched {
        parent: TaskId,
        child: TaskId,
        target: String,
        kind: DirectiveKind,
    },
    /// 指令未创建子任务（未知目标 / 角色不符）
    DirectiveRejected {
        parent: TaskId,
        target: String,
        reason: String,
    },
    /// 任务到达终态
    TaskFinished {
        task: TaskId,
        parent: Option<TaskId>,
        status: TaskStatus,
    },
    /// 恢复动作（如重新提示格式）
    Recovery {
        task: TaskId,
        action: String,
        detail: String,
    },
}

impl DispatchEvent {
    /// 若为子任务终态事件，返回 (任务, 状态)
    pub fn finished(&self) -> Option<(TaskId, &TaskStatus)> {
        match self {
            DispatchEvent::TaskFinished { task, status, .. } => Some((*task, status)),
            _ => None,
        }
    }
}
