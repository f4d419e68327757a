//! 任务树：运行中的委派图
//!
//! 每轮对话一个根任务，每条派发的指令一个子任务；记录父子关系、深度、状态与上下文。
//! 任务树只由 Dispatcher 持有并修改，所有结构变更都经由这里的操作，非法的状态迁移
//! 或破坏父子不变式都返回 TreeFault（对应 DispatcherFault）。

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::core::task_scheduler::TaskId;
use crate::core::{DirectiveError, EngineError};
use crate::memory::Message;

/// 任务失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    DepthExceeded,
    Timeout,
    Cancelled,
    RoundLimit,
    MalformedTerminalResponse,
    HandlerFailed,
    ReasoningStep,
    DispatcherFault,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::DepthExceeded => "depth exceeded",
            FailureReason::Timeout => "timeout",
            FailureReason::Cancelled => "cancelled",
            FailureReason::RoundLimit => "round limit",
            FailureReason::MalformedTerminalResponse => "malformed terminal response",
            FailureReason::HandlerFailed => "handler failed",
            FailureReason::ReasoningStep => "reasoning step failed",
            FailureReason::DispatcherFault => "dispatcher fault",
        };
        f.write_str(s)
    }
}

impl From<&DirectiveError> for FailureReason {
    fn from(err: &DirectiveError) -> Self {
        match err {
            DirectiveError::DepthExceeded { .. } => FailureReason::DepthExceeded,
            DirectiveError::Timeout { .. } => FailureReason::Timeout,
            DirectiveError::Cancelled => FailureReason::Cancelled,
            DirectiveError::UnknownCapability(_)
            | DirectiveError::RoleMismatch { .. }
            | DirectiveError::HandlerFailed { .. } => FailureReason::HandlerFailed,
        }
    }
}

impl From<&EngineError> for FailureReason {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::MalformedTerminalResponse(_) => FailureReason::MalformedTerminalResponse,
            EngineError::Cancelled => FailureReason::Cancelled,
            EngineError::RoundLimitExceeded(_) => FailureReason::RoundLimit,
            EngineError::ReasoningStep(_) => FailureReason::ReasoningStep,
            EngineError::StepTimeout(_) => FailureReason::Timeout,
            EngineError::DispatcherFault(_) => FailureReason::DispatcherFault,
        }
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum TaskStatus {
    /// 已创建，尚未推理
    Pending,
    /// 推理中
    Running,
    /// 等待本轮子任务全部返回
    AwaitingChildren,
    Completed,
    Failed(FailureReason),
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed(_))
    }

    /// 合法迁移：Pending -> Running | Failed；Running -> AwaitingChildren | Completed | Failed；
    /// AwaitingChildren -> Running | Failed；终态不可再迁移
    fn can_move_to(&self, next: &TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed(_))
                | (Running, AwaitingChildren)
                | (Running, Completed)
                | (Running, Failed(_))
                | (AwaitingChildren, Running)
                | (AwaitingChildren, Failed(_))
        )
    }
}

/// 任务树内部不变式被破坏
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TreeFault(pub String);

impl From<TreeFault> for EngineError {
    fn from(fault: TreeFault) -> Self {
        EngineError::DispatcherFault(fault.0)
    }
}

/// 任务节点
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub parent: Option<TaskId>,
    pub depth: usize,
    pub status: TaskStatus,
    pub context: Vec<Message>,
    pub children: BTreeSet<TaskId>,
    pub result: Option<String>,
    /// 子任务所调用的能力名；根任务为 None
    pub capability: Option<String>,
}

/// 任务树
#[derive(Debug, Default)]
pub struct TaskTree {
    tasks: HashMap<TaskId, Task>,
}

impl TaskTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    fn task(&self, id: TaskId) -> Result<&Task, TreeFault> {
        self.tasks
            .get(&id)
            .ok_or_else(|| TreeFault(format!("{id} is not in the task tree")))
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task, TreeFault> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| TreeFault(format!("{id} is not in the task tree")))
    }

    /// 新建根任务（depth = 0），上下文以用户输入开头
    pub fn create_root(&mut self, seed: Message) -> TaskId {
        self.create_root_after(Vec::new(), seed)
    }

    /// 新建根任务，上下文依次为先前的对话与本轮用户输入
    pub fn create_root_after(&mut self, history: Vec<Message>, seed: Message) -> TaskId {
        let mut context = history;
        context.push(seed);
        let id = TaskId::new();
        self.tasks.insert(
            id,
            Task {
                id,
                parent: None,
                depth: 0,
                status: TaskStatus::Pending,
                context,
                children: BTreeSet::new(),
                result: None,
                capability: None,
            },
        );
        id
    }

    /// 新建子任务：depth = parent.depth + 1，上下文以指令内容开头
    pub fn create_child(
        &mut self,
        parent: TaskId,
        capability: &str,
        seed: Message,
    ) -> Result<TaskId, TreeFault> {
        let parent_task = self.task_mut(parent)?;
        if parent_task.status.is_terminal() {
            return Err(TreeFault(format!(
                "cannot add a child to {parent}: it is {:?}",
                parent_task.status
            )));
        }
        let depth = parent_task.depth + 1;
        let id = TaskId::new();
        parent_task.children.insert(id);
        self.tasks.insert(
            id,
            Task {
                id,
                parent: Some(parent),
                depth,
                status: TaskStatus::Pending,
                context: vec![seed],
                children: BTreeSet::new(),
                result: None,
                capability: Some(capability.to_string()),
            },
        );
        Ok(id)
    }

    pub fn depth(&self, id: TaskId) -> Result<usize, TreeFault> {
        Ok(self.task(id)?.depth)
    }

    pub fn status(&self, id: TaskId) -> Result<TaskStatus, TreeFault> {
        Ok(self.task(id)?.status)
    }

    pub fn parent(&self, id: TaskId) -> Result<Option<TaskId>, TreeFault> {
        Ok(self.task(id)?.parent)
    }

    pub fn transition(&mut self, id: TaskId, next: TaskStatus) -> Result<(), TreeFault> {
        let task = self.task_mut(id)?;
        if !task.status.can_move_to(&next) {
            return Err(TreeFault(format!(
                "illegal transition for {id}: {:?} -> {:?}",
                task.status, next
            )));
        }
        task.status = next;
        Ok(())
    }

    pub fn complete(&mut self, id: TaskId, result: String) -> Result<(), TreeFault> {
        self.transition(id, TaskStatus::Completed)?;
        self.task_mut(id)?.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, id: TaskId, reason: FailureReason) -> Result<(), TreeFault> {
        self.transition(id, TaskStatus::Failed(reason))
    }

    pub fn append(
        &mut self,
        id: TaskId,
        messages: impl IntoIterator<Item = Message>,
    ) -> Result<(), TreeFault> {
        self.task_mut(id)?.context.extend(messages);
        Ok(())
    }

    /// 当前上下文的拷贝（推理步骤在锁外使用）
    pub fn context(&self, id: TaskId) -> Result<Vec<Message>, TreeFault> {
        Ok(self.task(id)?.context.clone())
    }

    /// 将任务自身及所有未结束的后代标记为 Failed(reason)，并移除全部后代；
    /// 返回被标记失败的任务（用于上报事件）。任务本身保留在树中
    pub fn abandon(
        &mut self,
        id: TaskId,
        reason: FailureReason,
    ) -> Result<Vec<(TaskId, Option<TaskId>)>, TreeFault> {
        let mut failed = Vec::new();
        let mut stack = vec![id];
        let mut descendants = Vec::new();
        while let Some(current) = stack.pop() {
            let task = self.task_mut(current)?;
            if !task.status.is_terminal() {
                task.status = TaskStatus::Failed(reason);
                failed.push((current, task.parent));
            }
            stack.extend(task.children.iter().copied());
            if current != id {
                descendants.push(current);
            }
        }
        for d in descendants {
            self.tasks.remove(&d);
        }
        self.task_mut(id)?.children.clear();
        Ok(failed)
    }

    /// 结果交付后丢弃任务（须已处于终态且没有剩余子任务），并从父任务的 children 中摘除
    pub fn remove(&mut self, id: TaskId) -> Result<Task, TreeFault> {
        let task = self.task(id)?;
        if !task.status.is_terminal() {
            return Err(TreeFault(format!(
                "cannot discard {id} while it is {:?}",
                task.status
            )));
        }
        if !task.children.is_empty() {
            return Err(TreeFault(format!(
                "cannot discard {id}: {} children still attached",
                task.children.len()
            )));
        }
        let task = self
            .tasks
            .remove(&id)
            .ok_or_else(|| TreeFault(format!("{id} vanished during removal")))?;
        if let Some(parent) = task.parent {
            if let Some(p) = self.tasks.get_mut(&parent) {
                p.children.remove(&id);
            }
        }
        Ok(task)
    }

    /// 校验全树不变式：子任务深度 = 父深度 + 1，父子双向链接一致
    pub fn check_invariants(&self) -> Result<(), TreeFault> {
        for task in self.tasks.values() {
            match task.parent {
                None if task.depth != 0 => {
                    return Err(TreeFault(format!("root {} has depth {}", task.id, task.depth)))
                }
                Some(parent) => {
                    let p = self.task(parent)?;
                    if task.depth != p.depth + 1 {
                        return Err(TreeFault(format!(
                            "{} has depth {} but its parent {} has depth {}",
                            task.id, task.depth, parent, p.depth
                        )));
                    }
                    if !p.children.contains(&task.id) {
                        return Err(TreeFault(format!(
                            "{parent} does not list its child {}",
                            task.id
                        )));
                    }
                }
                None => {}
            }
            for child in &task.children {
                if self.task(*child)?.parent != Some(task.id) {
                    return Err(TreeFault(format!("{child} does not point back to {}", task.id)));
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn ids(&self) -> Vec<TaskId> {
        self.tasks.keys().copied().collect()
    }

    /// 测试用：直接改写节点深度以制造不一致
    #[cfg(test)]
    pub(crate) fn force_depth(&mut self, id: TaskId, depth: usize) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.depth = depth;
        }
    }
}
