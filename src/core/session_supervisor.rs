//! 会话监管：取消令牌
//!
//! 每轮对话从当前「代」令牌派生一个子令牌，任务树中的每个子任务再从父任务令牌派生，
//! 因此取消会沿树向下传递。cancel() 取消当前代的全部在途对话并换上新令牌，之后提交的
//! 对话不受影响；shutdown() 取消整个会话。

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// 会话级生命周期管理
#[derive(Debug)]
pub struct SessionSupervisor {
    /// 进程/会话退出时触发
    session: CancellationToken,
    /// 当前代的对话令牌（session 的子令牌）
    current: Mutex<CancellationToken>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        let session = CancellationToken::new();
        let current = Mutex::new(session.child_token());
        Self { session, current }
    }

    /// 为新一轮对话派生令牌
    pub fn begin_turn(&self) -> CancellationToken {
        match self.current.lock() {
            Ok(current) => current.child_token(),
            Err(poisoned) => poisoned.into_inner().child_token(),
        }
    }

    /// 取消所有在途对话（用户 Ctrl+C）
    pub fn cancel(&self) {
        let fresh = self.session.child_token();
        let old = match self.current.lock() {
            Ok(mut current) => std::mem::replace(&mut *current, fresh),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), fresh),
        };
        old.cancel();
    }

    /// 关闭会话：取消一切，之后派生的令牌也立即处于取消状态
    pub fn shutdown(&self) {
        self.session.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.session.is_cancelled()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_only_affects_inflight_turns() {
        let supervisor = SessionSupervisor::new();
        let first = supervisor.begin_turn();
        supervisor.cancel();
        assert!(first.is_cancelled());
        let second = supervisor.begin_turn();
        assert!(!second.is_cancelled());
    }

    #[test]
    fn test_cancel_propagates_to_descendants() {
        let supervisor = SessionSupervisor::new();
        let turn = supervisor.begin_turn();
        let child = turn.child_token();
        let grandchild = child.child_token();
        supervisor.cancel();
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn test_shutdown_cancels_everything() {
        let supervisor = SessionSupervisor::new();
        let turn = supervisor.begin_turn();
        supervisor.shutdown();
        assert!(supervisor.is_shutdown());
        assert!(turn.is_cancelled());
        assert!(supervisor.begin_turn().is_cancelled());
    }
}
