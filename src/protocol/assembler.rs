//! 终态回复组装与校验
//!
//! 一个任务的最终输出必须恰好包含一个 `<final_answer>` 标记，且标记外没有任何内容
//! （仅空白不计为内容）。标记内部原样作为结果，不做任何改写。

use thiserror::Error;

use crate::protocol::lexer::{FINAL_CLOSE, FINAL_OPEN};
use crate::protocol::parser::{parse, Segment};

/// 标记外内容预览最大字符数
const OUTSIDE_PREVIEW_CHARS: usize = 60;

/// 终态回复不合法的原因（MalformedTerminalResponse）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedResponse {
    #[error("no <final_answer> marker found")]
    NoMarker,

    #[error("{0} <final_answer> markers found, expected exactly one")]
    DuplicateMarker(usize),

    #[error("content outside <final_answer>: {0:?}")]
    ContentOutsideMarker(String),

    #[error("directive inside <final_answer>")]
    DirectiveInsideMarker,

    #[error("nested <final_answer> marker")]
    NestedMarker,
}

/// 校验完整输出并提取最终答案
pub fn validate(text: &str) -> Result<String, MalformedResponse> {
    let mut check = TerminalCheck::default();
    for seg in parse(text) {
        check.observe(text, &seg);
    }
    check.finish()
}

/// 逐片段累积终态校验所需的信息，供 `validate` 与 `ParsedBlock::parse` 共用
#[derive(Debug, Default)]
pub(crate) struct TerminalCheck {
    answer: Option<String>,
    markers: usize,
    outside: String,
    nested: bool,
    directive_inside: bool,
}

impl TerminalCheck {
    pub(crate) fn observe(&mut self, src: &str, seg: &Segment<'_>) {
        match seg {
            Segment::Completion(c) => {
                self.markers += 1;
                self.nested |= c.nested_marker;
                self.directive_inside |= c.directives_inside > 0;
                if self.answer.is_none() {
                    self.answer = Some(c.body.to_string());
                }
            }
            // 仅空白不计为标记外内容
            Segment::Plain { text, .. } => self.outside.push_str(text.trim()),
            Segment::Directive(d) => self.outside.push_str(&src[d.span.clone()]),
        }
    }

    pub(crate) fn finish(self) -> Result<String, MalformedResponse> {
        match (self.markers, self.answer) {
            (0, _) | (_, None) => Err(MalformedResponse::NoMarker),
            (n, _) if n > 1 => Err(MalformedResponse::DuplicateMarker(n)),
            _ if self.nested => Err(MalformedResponse::NestedMarker),
            _ if self.directive_inside => Err(MalformedResponse::DirectiveInsideMarker),
            _ if !self.outside.is_empty() => Err(MalformedResponse::ContentOutsideMarker(
                self.outside.chars().take(OUTSIDE_PREVIEW_CHARS).collect(),
            )),
            (_, Some(body)) => Ok(body),
        }
    }
}

/// 流式组装器：逐段累积推理输出，观察到闭合标记后即可提前结束读取
///
/// 闭合之后的分片不再追加；已收到的文本原样保留，由终态校验整体判断
/// （同一分片中的尾随内容或第二个标记照常报错）。转义的 `\</final_answer>`
/// 以及出现在任何 `<final_answer>` 之前的闭合标记都不算闭合。
#[derive(Debug, Default, Clone)]
pub struct ResponseAssembler {
    buffer: String,
    closed: bool,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一段文本；返回是否已出现 `</final_answer>`
    pub fn push(&mut self, chunk: &str) -> bool {
        if self.closed {
            return true;
        }
        // 闭合标记可能跨分片：从上一段末尾回退一个标记长度开始查找
        let mut at = self.buffer.len().saturating_sub(FINAL_CLOSE.len() - 1);
        while !self.buffer.is_char_boundary(at) {
            at -= 1;
        }
        self.buffer.push_str(chunk);

        while let Some(offset) = self.buffer[at..].find(FINAL_CLOSE) {
            let start = at + offset;
            let escaped = start > 0 && self.buffer.as_bytes()[start - 1] == b'\\';
            if !escaped && self.buffer[..start].contains(FINAL_OPEN) {
                self.closed = true;
                break;
            }
            at = start + 1;
        }
        self.closed
    }

    pub fn marker_closed(&self) -> bool {
        self.closed
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn into_text(self) -> String {
        self.buffer
    }
}
