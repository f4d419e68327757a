//! 指令标记词法分析
//!
//! 从推理文本中识别三类标签：`<tool_call: NAME>` / `<delegate_to: NAME>` 及其闭合标签，
//! 以及完成标记 `<final_answer>` / `</final_answer>`。普通的 `<`（如 `a < b`）不是标签；
//! 以反斜杠转义的 `\<` 永远不会开启标签。

use std::fmt;
use std::ops::Range;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// 完成标记开标签
pub const FINAL_OPEN: &str = "<final_answer>";
/// 完成标记闭标签
pub const FINAL_CLOSE: &str = "</final_answer>";

/// 指令类型：委派给 Agent 或调用 Tool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveKind {
    Delegation,
    ToolCall,
}

impl DirectiveKind {
    /// 标签名（`delegate_to` / `tool_call`）
    pub fn tag(self) -> &'static str {
        match self {
            DirectiveKind::Delegation => "delegate_to",
            DirectiveKind::ToolCall => "tool_call",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "delegate_to" => Some(DirectiveKind::Delegation),
            "tool_call" => Some(DirectiveKind::ToolCall),
            _ => None,
        }
    }
}

impl fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// 识别出的标签种类
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagKind {
    Open { kind: DirectiveKind, target: String },
    Close(DirectiveKind),
    FinalOpen,
    FinalClose,
    /// 以已知标签词开头但语法不合法（缺少目标名、非法字符等）
    Malformed,
}

/// 标签及其在源文本中的字节区间
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub kind: TagKind,
    pub span: Range<usize>,
}

fn open_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^<(tool_call|delegate_to)\s*:\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*>")
            .expect("static regex")
    })
}

fn close_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^</(tool_call|delegate_to|final_answer)\s*>").expect("static regex")
    })
}

fn final_open_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^<final_answer\s*>").expect("static regex"))
}

fn tag_word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^</?(tool_call|delegate_to|final_answer)\b").expect("static regex")
    })
}

/// 标签扫描器：从给定位置起按顺序产出标签，跳过普通文本
#[derive(Debug, Clone)]
pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self::at(src, 0)
    }

    /// 从字节位置 `pos` 开始扫描（`pos` 须位于字符边界）
    pub fn at(src: &'a str, pos: usize) -> Self {
        Self {
            src,
            pos: pos.min(src.len()),
        }
    }

    /// 尝试在 `start`（指向 `<`）处识别标签
    fn recognize(&self, start: usize) -> Option<Tag> {
        let rest = &self.src[start..];

        if let Some(caps) = open_re().captures(rest) {
            let kind = DirectiveKind::from_tag(&caps[1])?;
            let whole = caps.get(0)?;
            return Some(Tag {
                kind: TagKind::Open {
                    kind,
                    target: caps[2].to_string(),
                },
                span: start..start + whole.end(),
            });
        }

        if let Some(caps) = close_re().captures(rest) {
            let whole = caps.get(0)?;
            let kind = match DirectiveKind::from_tag(&caps[1]) {
                Some(k) => TagKind::Close(k),
                None => TagKind::FinalClose,
            };
            return Some(Tag {
                kind,
                span: start..start + whole.end(),
            });
        }

        if let Some(m) = final_open_re().find(rest) {
            return Some(Tag {
                kind: TagKind::FinalOpen,
                span: start..start + m.end(),
            });
        }

        let word = tag_word_re().find(rest)?;
        // 非法标签的范围：到同一行内下一个 `>`（若在下一个 `<` 之前），否则仅覆盖标签词
        let after = &rest[1..];
        let end = match after.find(['<', '>', '\n']) {
            Some(i) if after.as_bytes()[i] == b'>' => start + 1 + i + 1,
            _ => start + word.end(),
        };
        Some(Tag {
            kind: TagKind::Malformed,
            span: start..end,
        })
    }
}

impl Iterator for Lexer<'_> {
    type Item = Tag;

    fn next(&mut self) -> Option<Tag> {
        while self.pos < self.src.len() {
            let offset = self.src[self.pos..].find('<')?;
            let start = self.pos + offset;
            let escaped = start > 0 && self.src.as_bytes()[start - 1] == b'\\';
            if !escaped {
                if let Some(tag) = self.recognize(start) {
                    self.pos = tag.span.end;
                    return Some(tag);
                }
            }
            self.pos = start + 1;
        }
        None
    }
}
