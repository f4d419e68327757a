//! 核心层：任务树、调度器、错误与恢复、会话监管、引擎门面

pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod task_scheduler;
pub mod task_tree;

pub use dispatcher::{DispatchLimits, Dispatcher};
pub use engine::{create_llm_from_config, Engine};
pub use error::{DirectiveError, EngineError, RecoveryAction};
pub use orchestrator::{spawn_engine, Command, TurnOutcome};
pub use recovery::RecoveryEngine;
pub use session_supervisor::SessionSupervisor;
pub use task_scheduler::{TaskId, TaskScheduler};
pub use task_tree::{FailureReason, Task, TaskStatus, TaskTree, TreeFault};
