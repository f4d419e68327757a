//! 任务上下文中的消息
//!
//! 每个任务的 context 是有序的 Message 序列：用户输入、推理输出、系统提示，
//! 以及子任务折回的指令结果（带来源目标、类型与原文位置标签）。
//! ConversationMemory 保留最近 N 轮已交付的对话，作为下一轮根任务上下文的开头。

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::protocol::{DirectiveKind, FINAL_CLOSE, FINAL_OPEN};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 指令结果的来源标签
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectiveOrigin {
    pub target: String,
    pub kind: DirectiveKind,
    /// 指令在父任务推理输出中的字节区间
    pub span: Range<usize>,
    pub ok: bool,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<DirectiveOrigin>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            origin: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            origin: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            origin: None,
        }
    }

    /// 子任务结果折回父任务时使用；内容以 `<directive_result>` 包裹，推理步骤可直接读取
    pub fn directive_result(origin: DirectiveOrigin, body: &str) -> Self {
        let content = format!(
            "<directive_result target=\"{}\" kind=\"{}\" span=\"{}..{}\" status=\"{}\">\n{}\n</directive_result>",
            origin.target,
            origin.kind,
            origin.span.start,
            origin.span.end,
            if origin.ok { "ok" } else { "error" },
            body
        );
        Self {
            role: Role::User,
            content,
            origin: Some(origin),
        }
    }

    pub fn is_directive_result(&self) -> bool {
        self.origin.is_some()
    }
}

/// 短期记忆：最近 N 轮对话（每轮含 user + assistant，故实际保留约 max_turns*2 条消息）
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    messages: Vec<Message>,
    max_turns: usize,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_turns,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
        self.prune();
    }

    /// 记录一轮已交付的对话；回答按完成标记的格式保存，与推理步骤的输出保持一致
    pub fn record_turn(&mut self, input: &str, answer: &str) {
        self.push(Message::user(input));
        self.push(Message::assistant(format!("{FINAL_OPEN}{answer}{FINAL_CLOSE}")));
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// 超出 max_turns*2 时丢弃最旧的消息，保留最近部分
    fn prune(&mut self) {
        let keep = self.max_turns * 2;
        if self.messages.len() > keep {
            self.messages.drain(..self.messages.len() - keep);
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_result_tagging() {
        let origin = DirectiveOrigin {
            target: "email_read".to_string(),
            kind: DirectiveKind::ToolCall,
            span: 0..40,
            ok: true,
        };
        let msg = Message::directive_result(origin, "3 unread");
        assert_eq!(msg.role, Role::User);
        assert!(msg.is_directive_result());
        assert!(msg.content.starts_with(
            "<directive_result target=\"email_read\" kind=\"tool_call\" span=\"0..40\" status=\"ok\">"
        ));
        assert!(msg.content.contains("3 unread"));
    }

    #[test]
    fn test_memory_keeps_last_turns() {
        let mut memory = ConversationMemory::new(2);
        for i in 0..3 {
            memory.record_turn(&format!("q{i}"), &format!("a{i}"));
        }
        assert_eq!(memory.len(), 4);
        assert_eq!(memory.messages()[0].content, "q1");
        assert_eq!(
            memory.messages()[3].content,
            "<final_answer>a2</final_answer>"
        );
        assert_eq!(memory.messages()[3].role, Role::Assistant);
    }

    #[test]
    fn test_memory_with_zero_turns_stays_empty() {
        let mut memory = ConversationMemory::new(0);
        memory.record_turn("q", "a");
        assert!(memory.is_empty());
    }

    #[test]
    fn test_plain_message_serializes_without_origin() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert!(json.get("origin").is_none());
        assert_eq!(json["content"], "hi");
    }
}
