//! 指令解析器
//!
//! 将一段推理输出切分为有序的片段序列（Plain / Directive / Completion），
//! 片段按从左到右覆盖整段文本，不重叠、不遗漏：拼接 `&src[seg.span()]` 即还原原文。
//! 标签只扫描一次，开闭标签的配对通过预先计算的前后索引完成，整段解析是线性的；
//! 片段在迭代时按需产出。

use std::fmt;
use std::ops::Range;

use serde::Serialize;

use crate::protocol::assembler::{MalformedResponse, TerminalCheck};
use crate::protocol::lexer::{DirectiveKind, Lexer, Tag, TagKind};

/// 从文本中解析出的一条指令（不可变，由 Dispatcher 消费）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Directive {
    pub kind: DirectiveKind,
    pub target: String,
    pub payload: String,
    /// 整条指令（含开闭标签）在原文中的字节区间
    pub span: Range<usize>,
}

/// 诊断类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// 已知标签词但语法不合法
    MalformedTag,
    /// 开标签没有对应的闭标签
    Unterminated,
    /// 闭标签前没有对应的开标签
    UnmatchedClose,
    /// 指令内容中出现同类开标签
    NestedSameKind,
}

/// 解析诊断（ParseError）：仅作用于对应片段，片段按原文透传
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseDiagnostic {
    pub kind: DiagnosticKind,
    pub span: Range<usize>,
    pub message: String,
}

impl fmt::Display for ParseDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}..{}", self.message, self.span.start, self.span.end)
    }
}

/// 完成标记片段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionSegment<'a> {
    pub body: &'a str,
    pub span: Range<usize>,
    pub body_span: Range<usize>,
    /// 标记内部又出现了 `<final_answer>`
    pub nested_marker: bool,
    /// 标记内部出现的指令开标签数量
    pub directives_inside: usize,
}

/// 解析片段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    Plain {
        text: &'a str,
        span: Range<usize>,
        diagnostic: Option<ParseDiagnostic>,
    },
    Directive(Directive),
    Completion(CompletionSegment<'a>),
}

impl Segment<'_> {
    pub fn span(&self) -> Range<usize> {
        match self {
            Segment::Plain { span, .. } => span.clone(),
            Segment::Directive(d) => d.span.clone(),
            Segment::Completion(c) => c.span.clone(),
        }
    }

    pub fn diagnostic(&self) -> Option<&ParseDiagnostic> {
        match self {
            Segment::Plain { diagnostic, .. } => diagnostic.as_ref(),
            _ => None,
        }
    }
}

/// 标签槽位：两类指令与完成标记
const DELEGATION: usize = 0;
const TOOL_CALL: usize = 1;
const FINAL: usize = 2;

fn slot_of(kind: DirectiveKind) -> usize {
    match kind {
        DirectiveKind::Delegation => DELEGATION,
        DirectiveKind::ToolCall => TOOL_CALL,
    }
}

/// 标签所属槽位及是否为开标签；非法标签不参与配对
fn slot(tag: &TagKind) -> Option<(usize, bool)> {
    match tag {
        TagKind::Open { kind, .. } => Some((slot_of(*kind), true)),
        TagKind::Close(kind) => Some((slot_of(*kind), false)),
        TagKind::FinalOpen => Some((FINAL, true)),
        TagKind::FinalClose => Some((FINAL, false)),
        TagKind::Malformed => None,
    }
}

/// 第 i 个标签的配对信息（下标均指向标签序列）
#[derive(Debug, Clone, Default)]
struct Links {
    /// 之后最近的各槽位闭标签
    next_close: [Option<usize>; 3],
    /// 之后最近的各槽位开标签
    next_open: [Option<usize>; 3],
    /// 之前最近的各槽位开标签
    prev_open: [Option<usize>; 3],
    /// 之前出现的指令开标签数量
    opens_before: usize,
}

/// 一次正向、一次反向扫描算出全部配对信息，之后每个开标签的配对都是 O(1)
fn link(tags: &[Tag]) -> Vec<Links> {
    let mut links = vec![Links::default(); tags.len()];

    let mut close_seen = [None; 3];
    let mut open_seen = [None; 3];
    for (i, tag) in tags.iter().enumerate().rev() {
        links[i].next_close = close_seen;
        links[i].next_open = open_seen;
        match slot(&tag.kind) {
            Some((s, true)) => open_seen[s] = Some(i),
            Some((s, false)) => close_seen[s] = Some(i),
            None => {}
        }
    }

    let mut open_seen = [None; 3];
    let mut opens = 0;
    for (i, tag) in tags.iter().enumerate() {
        links[i].prev_open = open_seen;
        links[i].opens_before = opens;
        if let Some((s, true)) = slot(&tag.kind) {
            open_seen[s] = Some(i);
            if s != FINAL {
                opens += 1;
            }
        }
    }
    links
}

/// 片段迭代器；不可重启，需要重新解析时再调用一次 [`parse`]
///
/// 标签在创建时一次性扫描完毕，片段在 `next()` 时按需产出。
pub struct Parser<'a> {
    src: &'a str,
    tags: Vec<Tag>,
    links: Vec<Links>,
    /// 下一个待处理标签的下标
    cursor: usize,
    pos: usize,
    pending: Option<Segment<'a>>,
}

/// 解析一段文本
pub fn parse(src: &str) -> Parser<'_> {
    let tags: Vec<Tag> = Lexer::new(src).collect();
    let links = link(&tags);
    Parser {
        src,
        tags,
        links,
        cursor: 0,
        pos: 0,
        pending: None,
    }
}

impl<'a> Parser<'a> {
    fn plain(&self, span: Range<usize>, diagnostic: Option<ParseDiagnostic>) -> Segment<'a> {
        Segment::Plain {
            text: &self.src[span.clone()],
            span,
            diagnostic,
        }
    }

    fn diagnosed(&self, tag: &Tag, kind: DiagnosticKind, message: String) -> Segment<'a> {
        let diagnostic = ParseDiagnostic {
            kind,
            span: tag.span.clone(),
            message,
        };
        self.plain(tag.span.clone(), Some(diagnostic))
    }

    /// 跳过第 i 个标签，从其后继续
    fn skip(&mut self, i: usize) {
        self.cursor = i + 1;
        self.pos = self.tags[i].span.end;
    }

    /// 处理第 i 个标签，返回对应片段并推进游标
    fn segment_at(&mut self, i: usize) -> Segment<'a> {
        let tag = self.tags[i].clone();
        match &tag.kind {
            TagKind::Open { kind, target } => self.directive(i, &tag, *kind, target),
            TagKind::FinalOpen => self.completion(i, &tag),
            TagKind::Close(kind) => {
                self.skip(i);
                self.diagnosed(
                    &tag,
                    DiagnosticKind::UnmatchedClose,
                    format!("closing </{kind}> without an opening tag"),
                )
            }
            TagKind::FinalClose => {
                self.skip(i);
                self.diagnosed(
                    &tag,
                    DiagnosticKind::UnmatchedClose,
                    "closing </final_answer> without an opening tag".to_string(),
                )
            }
            TagKind::Malformed => {
                self.skip(i);
                self.diagnosed(
                    &tag,
                    DiagnosticKind::MalformedTag,
                    format!("malformed tag {:?}", &self.src[tag.span.clone()]),
                )
            }
        }
    }

    fn directive(&mut self, i: usize, open: &Tag, kind: DirectiveKind, target: &str) -> Segment<'a> {
        let s = slot_of(kind);
        let close = self.links[i].next_close[s];
        let nested = self.links[i].next_open[s];

        if nested.is_some_and(|o| close.map_or(true, |c| o < c)) {
            // 同类嵌套：外层开标签作废，从其后继续扫描，内层指令仍可被识别
            self.skip(i);
            return self.diagnosed(
                open,
                DiagnosticKind::NestedSameKind,
                format!("<{kind}: {target}> contains a nested <{kind}> before it is closed"),
            );
        }

        let Some(c) = close else {
            self.skip(i);
            return self.diagnosed(
                open,
                DiagnosticKind::Unterminated,
                format!("<{kind}: {target}> is never closed"),
            );
        };

        let span = open.span.start..self.tags[c].span.end;
        let payload_span = open.span.end..self.tags[c].span.start;
        self.cursor = c + 1;
        self.pos = span.end;

        // 内容中最后一个异类开标签必须在外层闭标签之前闭合，否则整段按原文透传
        let other = 1 - s;
        let unclosed = self.links[c].prev_open[other]
            .filter(|&o| o > i)
            .filter(|&o| !self.links[o].next_close[other].is_some_and(|x| x < c));
        if let Some(o) = unclosed {
            let inner = &self.tags[o];
            let label = &self.src[inner.span.clone()];
            let diagnostic = ParseDiagnostic {
                kind: DiagnosticKind::Unterminated,
                span: inner.span.clone(),
                message: format!("{label} inside <{kind}: {target}> is never closed"),
            };
            return self.plain(span, Some(diagnostic));
        }

        Segment::Directive(Directive {
            kind,
            target: target.to_string(),
            payload: self.src[payload_span].to_string(),
            span,
        })
    }

    fn completion(&mut self, i: usize, open: &Tag) -> Segment<'a> {
        let Some(c) = self.links[i].next_close[FINAL] else {
            self.skip(i);
            return self.diagnosed(
                open,
                DiagnosticKind::Unterminated,
                "<final_answer> is never closed".to_string(),
            );
        };

        let close = &self.tags[c];
        let body_span = open.span.end..close.span.start;
        let span = open.span.start..close.span.end;
        let nested_marker = self.links[i].next_open[FINAL].is_some_and(|o| o < c);
        let directives_inside = self.links[c].opens_before - self.links[i].opens_before;
        self.cursor = c + 1;
        self.pos = span.end;

        Segment::Completion(CompletionSegment {
            body: &self.src[body_span.clone()],
            span,
            body_span,
            nested_marker,
            directives_inside,
        })
    }
}

impl<'a> Iterator for Parser<'a> {
    type Item = Segment<'a>;

    fn next(&mut self) -> Option<Segment<'a>> {
        if let Some(seg) = self.pending.take() {
            return Some(seg);
        }
        if self.pos >= self.src.len() {
            return None;
        }

        let start = self.pos;
        let Some(tag_start) = self.tags.get(self.cursor).map(|t| t.span.start) else {
            self.pos = self.src.len();
            return Some(self.plain(start..self.src.len(), None));
        };
        let seg = self.segment_at(self.cursor);
        if tag_start > start {
            self.pending = Some(seg);
            Some(self.plain(start..tag_start, None))
        } else {
            Some(seg)
        }
    }
}

/// 单段输出的解析汇总：顶层指令、诊断、完成标记数量与终态校验结果
///
/// 每轮推理输出只解析这一次，派发与终态校验共用同一组片段。
#[derive(Debug, Clone)]
pub struct ParsedBlock {
    pub directives: Vec<Directive>,
    pub diagnostics: Vec<ParseDiagnostic>,
    pub completion_markers: usize,
    /// 作为终态回复时的校验结果（仅在没有顶层指令时采用）
    pub terminal: Result<String, MalformedResponse>,
}

impl ParsedBlock {
    pub fn parse(src: &str) -> Self {
        let mut directives = Vec::new();
        let mut diagnostics = Vec::new();
        let mut completion_markers = 0;
        let mut check = TerminalCheck::default();

        for seg in parse(src) {
            check.observe(src, &seg);
            match seg {
                Segment::Directive(d) => directives.push(d),
                Segment::Completion(_) => completion_markers += 1,
                Segment::Plain {
                    diagnostic: Some(d),
                    ..
                } => diagnostics.push(d),
                Segment::Plain { .. } => {}
            }
        }

        ParsedBlock {
            directives,
            diagnostics,
            completion_markers,
            terminal: check.finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rebuild(src: &str) -> String {
        parse(src).map(|s| src[s.span()].to_string()).collect()
    }

    fn assert_covers(src: &str) {
        let mut expected = 0;
        for seg in parse(src) {
            let span = seg.span();
            assert_eq!(span.start, expected, "gap or overlap in {src:?}");
            assert!(span.end > span.start, "empty segment in {src:?}");
            expected = span.end;
        }
        assert_eq!(expected, src.len());
        assert_eq!(rebuild(src), src);
    }

    #[test]
    fn test_parse_mixed_directives_in_order() {
        let src = "<tool_call: email_read>inbox</tool_call> <delegate_to: planner_agent>schedule trip</delegate_to>";
        let block = ParsedBlock::parse(src);
        assert_eq!(block.directives.len(), 2);
        assert_eq!(block.directives[0].kind, DirectiveKind::ToolCall);
        assert_eq!(block.directives[0].target, "email_read");
        assert_eq!(block.directives[0].payload, "inbox");
        assert_eq!(block.directives[1].kind, DirectiveKind::Delegation);
        assert_eq!(block.directives[1].target, "planner_agent");
        assert_eq!(block.directives[1].payload, "schedule trip");
        assert!(block.directives[0].span.end <= block.directives[1].span.start);
        assert!(block.diagnostics.is_empty());
    }

    #[test]
    fn test_parse_round_trip() {
        let samples = [
            "",
            "just text",
            "before <tool_call: a>x</tool_call> between <delegate_to: b>y</delegate_to> after",
            "<final_answer>done</final_answer>",
            "a < b <delegate_to: p>use <tool_call: t>nested other kind</tool_call></delegate_to>",
            "ünïcødé <tool_call: echo>日本語</tool_call>✓",
            "<tool_call: a>x</tool_call><tool_call: b>y</tool_call>",
        ];
        for src in samples {
            assert_covers(src);
        }
    }

    #[test]
    fn test_parse_round_trip_with_diagnostics() {
        let samples = [
            "<tool_call: a>never closed",
            "stray </delegate_to> here",
            "<tool_call>missing name</tool_call>",
            "<tool_call: a> x <tool_call: b>y</tool_call>",
            "<final_answer>open forever",
        ];
        for src in samples {
            assert_covers(src);
        }
    }

    #[test]
    fn test_parse_other_kind_nested_in_payload() {
        let src = "<delegate_to: planner>first <tool_call: email_read>inbox</tool_call> then plan</delegate_to>";
        let block = ParsedBlock::parse(src);
        assert_eq!(block.directives.len(), 1);
        let d = &block.directives[0];
        assert_eq!(d.target, "planner");
        assert_eq!(
            d.payload,
            "first <tool_call: email_read>inbox</tool_call> then plan"
        );
    }

    #[test]
    fn test_parse_same_kind_nesting_is_local_error() {
        let src = "<tool_call: a> x <tool_call: b>y</tool_call>";
        let segs: Vec<Segment> = parse(src).collect();
        let diag = segs[0].diagnostic().expect("outer opener diagnosed");
        assert_eq!(diag.kind, DiagnosticKind::NestedSameKind);
        // 内层指令仍被识别
        let block = ParsedBlock::parse(src);
        assert_eq!(block.directives.len(), 1);
        assert_eq!(block.directives[0].target, "b");
        assert_eq!(block.diagnostics.len(), 1);
    }

    #[test]
    fn test_parse_unterminated_directive_passes_through() {
        let src = "hello <tool_call: a>payload";
        let segs: Vec<Segment> = parse(src).collect();
        assert_eq!(segs.len(), 3);
        match &segs[1] {
            Segment::Plain {
                text, diagnostic, ..
            } => {
                assert_eq!(*text, "<tool_call: a>");
                assert_eq!(diagnostic.as_ref().map(|d| d.kind), Some(DiagnosticKind::Unterminated));
            }
            other => panic!("expected plain, got {other:?}"),
        }
        assert_eq!(segs[2].span(), 20..src.len());
    }

    #[test]
    fn test_parse_unmatched_close_and_malformed() {
        let block = ParsedBlock::parse("x </tool_call> y <delegate_to:>z");
        let kinds: Vec<DiagnosticKind> = block.diagnostics.iter().map(|d| d.kind).collect();
        assert_eq!(
            kinds,
            vec![DiagnosticKind::UnmatchedClose, DiagnosticKind::MalformedTag]
        );
        assert!(block.directives.is_empty());
    }

    #[test]
    fn test_parse_completion_segment() {
        let src = "<final_answer>The answer</final_answer>";
        let segs: Vec<Segment> = parse(src).collect();
        assert_eq!(segs.len(), 1);
        match &segs[0] {
            Segment::Completion(c) => {
                assert_eq!(c.body, "The answer");
                assert!(!c.nested_marker);
                assert_eq!(c.directives_inside, 0);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_directive_inside_completion_is_not_top_level() {
        let src = "<final_answer>done <tool_call: a>x</tool_call></final_answer>";
        let block = ParsedBlock::parse(src);
        assert!(block.directives.is_empty());
        assert_eq!(block.completion_markers, 1);
        match parse(src).next() {
            Some(Segment::Completion(c)) => assert_eq!(c.directives_inside, 1),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_is_lazy() {
        let src = "<tool_call: a>x</tool_call> tail <tool_call: b>never closed";
        let mut parser = parse(src);
        assert!(matches!(parser.next(), Some(Segment::Directive(_))));
        assert_eq!(parser.pos, "<tool_call: a>x</tool_call>".len());
    }

    #[test]
    fn test_parse_unclosed_other_kind_in_payload() {
        let src = "<delegate_to: planner>do <tool_call: email_read>inbox</delegate_to> after";
        let block = ParsedBlock::parse(src);
        assert!(block.directives.is_empty());
        assert_eq!(block.diagnostics.len(), 1);
        let diag = &block.diagnostics[0];
        assert_eq!(diag.kind, DiagnosticKind::Unterminated);
        assert_eq!(&src[diag.span.clone()], "<tool_call: email_read>");
        assert!(diag.message.contains("inside <delegate_to: planner>"));

        let segs: Vec<Segment> = parse(src).collect();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].span(), 0..src.len() - " after".len());
        assert!(segs[0].diagnostic().is_some());
        assert_covers(src);
    }

    #[test]
    fn test_parse_other_kind_closed_before_later_opener() {
        let src = "<delegate_to: p><tool_call: a>x</tool_call> then <tool_call: b>y</delegate_to>";
        let block = ParsedBlock::parse(src);
        assert!(block.directives.is_empty());
        assert_eq!(block.diagnostics[0].kind, DiagnosticKind::Unterminated);
        assert!(block.diagnostics[0].message.starts_with("<tool_call: b>"));
    }

    #[test]
    fn test_parse_terminal_result_shares_segments() {
        let ok = ParsedBlock::parse("<final_answer>done</final_answer>");
        assert_eq!(ok.terminal, Ok("done".to_string()));

        let with_directive = ParsedBlock::parse("<tool_call: a>x</tool_call>");
        assert_eq!(with_directive.directives.len(), 1);
        assert!(matches!(
            with_directive.terminal,
            Err(MalformedResponse::NoMarker)
        ));
    }

    #[test]
    fn test_parse_many_unclosed_markers_is_linear() {
        let src = "<final_answer>".repeat(20_000);
        let started = std::time::Instant::now();
        let block = ParsedBlock::parse(&src);
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        assert_eq!(block.diagnostics.len(), 20_000);
        assert_eq!(block.terminal, Err(MalformedResponse::NoMarker));
    }

    #[test]
    fn test_parse_many_unclosed_directives_is_linear() {
        let src = "<tool_call: a>x <delegate_to: b>y ".repeat(10_000);
        let started = std::time::Instant::now();
        let block = ParsedBlock::parse(&src);
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        assert!(block.directives.is_empty());
        assert_eq!(block.diagnostics.len(), 20_000);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Piece {
            Text(String),
            Call(DirectiveKind, String, String),
        }

        fn piece() -> impl Strategy<Value = Piece> {
            prop_oneof![
                "[a-z0-9 .,!?\n]{1,12}".prop_map(Piece::Text),
                (any::<bool>(), "[a-z_][a-z0-9_]{0,7}", "[a-z ]{0,10}").prop_map(
                    |(delegate, target, payload)| {
                        let kind = if delegate {
                            DirectiveKind::Delegation
                        } else {
                            DirectiveKind::ToolCall
                        };
                        Piece::Call(kind, target, payload)
                    }
                ),
            ]
        }

        proptest! {
            #[test]
            fn well_formed_blocks_round_trip(pieces in prop::collection::vec(piece(), 0..12)) {
                let mut src = String::new();
                let mut expected = Vec::new();
                for p in &pieces {
                    match p {
                        Piece::Text(t) => src.push_str(t),
                        Piece::Call(kind, target, payload) => {
                            src.push_str(&format!("<{kind}: {target}>{payload}</{kind}>"));
                            expected.push((*kind, target.clone(), payload.clone()));
                        }
                    }
                }

                assert_covers(&src);
                let block = ParsedBlock::parse(&src);
                prop_assert!(block.diagnostics.is_empty());
                let got: Vec<_> = block
                    .directives
                    .into_iter()
                    .map(|d| (d.kind, d.target, d.payload))
                    .collect();
                prop_assert_eq!(got, expected);
            }

            #[test]
            fn arbitrary_markup_is_covered_without_gaps(
                parts in prop::collection::vec(
                    prop::sample::select(vec![
                        "<tool_call: a>", "</tool_call>", "<delegate_to: b>", "</delegate_to>",
                        "<final_answer>", "</final_answer>", "<tool_call>", "\\<tool_call: c>",
                        "x", " ", "<", ">", "é", "\n",
                    ]),
                    0..40,
                )
            ) {
                let src = parts.concat();
                assert_covers(&src);
            }
        }
    }
}
