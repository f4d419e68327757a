//! 记忆层：任务上下文消息与短期对话记忆

pub mod conversation;

pub use conversation::{ConversationMemory, DirectiveOrigin, Message, Role};
