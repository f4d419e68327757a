//! 认知层：推理步骤（Planner）与调度事件

pub mod events;
pub mod planner;

pub use events::DispatchEvent;
pub use planner::{protocol_instructions, Planner, ReasoningStep};
