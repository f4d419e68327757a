//! Noori - 指令派发引擎
//!
//! 推理步骤的输出中可以内嵌指令（`<tool_call: NAME>`、`<delegate_to: NAME>`），
//! 引擎把它们派发给工具或子 Agent，按原文顺序折回结果，直到得到 `<final_answer>`。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务树、调度器、错误与恢复、会话监管、引擎门面与编排器
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: 对话消息与指令结果记录
//! - **observability**: tracing 初始化
//! - **protocol**: 指令词法/语法分析与终态校验
//! - **react**: 推理步骤（Planner）与调度事件
//! - **tools**: 能力注册表、工具执行器与内置工具

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod protocol;
pub mod react;
pub mod tools;

pub use crate::core::{Engine, EngineError};
