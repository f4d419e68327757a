//! Mock LLM 客户端（用于测试与离线运行，无需 API）
//!
//! - MockLlmClient：取最后一条 User 消息，包在 `<final_answer>` 中回显
//! - ScriptedLlmClient：按脚本返回固定输出，或由闭包根据上下文生成输出；可按字符数切片流式返回

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use crate::llm::{LlmClient, TokenStream};
use crate::memory::{Message, Role};

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(format!("<final_answer>Echo from Mock: {}</final_answer>", last_user))
    }
}

type ScriptFn = dyn Fn(&[Message]) -> String + Send + Sync;

enum Script {
    Queue(Mutex<VecDeque<String>>),
    Func(Box<ScriptFn>),
}

/// 脚本化客户端：测试中驱动多轮推理
pub struct ScriptedLlmClient {
    script: Script,
    calls: AtomicUsize,
    /// 流式返回时每个分片的字符数；None 表示整段一次返回
    chunk_chars: Option<usize>,
    chunks_read: Arc<AtomicUsize>,
}

impl ScriptedLlmClient {
    /// 依次返回给定输出；用尽后返回错误
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Script::Queue(Mutex::new(responses.into_iter().map(Into::into).collect())),
            calls: AtomicUsize::new(0),
            chunk_chars: None,
            chunks_read: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 由闭包根据当前上下文生成输出
    pub fn from_fn(f: impl Fn(&[Message]) -> String + Send + Sync + 'static) -> Self {
        Self {
            script: Script::Func(Box::new(f)),
            calls: AtomicUsize::new(0),
            chunk_chars: None,
            chunks_read: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 流式返回时按 `chars` 个字符切片
    pub fn chunked(mut self, chars: usize) -> Self {
        self.chunk_chars = Some(chars.max(1));
        self
    }

    /// 已被调用次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 调用方已从流中读取的分片数
    pub fn chunks_read(&self) -> usize {
        self.chunks_read.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Queue(queue) => queue
                .lock()
                .map_err(|_| "script lock poisoned".to_string())?
                .pop_front()
                .ok_or_else(|| "script exhausted".to_string()),
            Script::Func(f) => Ok(f(messages)),
        }
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, String> {
        let text = self.complete(messages).await?;
        let chunks: Vec<String> = match self.chunk_chars {
            Some(size) => {
                let chars: Vec<char> = text.chars().collect();
                chars.chunks(size).map(|c| c.iter().collect()).collect()
            }
            None => vec![text],
        };
        let read = self.chunks_read.clone();
        Ok(Box::pin(stream::iter(chunks).map(move |chunk| {
            read.fetch_add(1, Ordering::SeqCst);
            Ok(chunk)
        })))
    }
}
