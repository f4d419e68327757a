//! 指令协议：标记词法、片段解析、终态回复校验

pub mod assembler;
pub mod lexer;
pub mod parser;

pub use assembler::{validate, MalformedResponse, ResponseAssembler};
pub use lexer::{DirectiveKind, FINAL_CLOSE, FINAL_OPEN};
pub use parser::{
    parse, CompletionSegment, DiagnosticKind, Directive, ParseDiagnostic, ParsedBlock, Segment,
};
