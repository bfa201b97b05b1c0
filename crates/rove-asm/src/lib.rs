//! Text assembly format for rove programs: lexer, parser and pretty printer.

pub mod lexer;
pub mod parser;
pub mod pretty;
pub mod token;

pub use lexer::Lexer;
pub use parser::{parse, parse_unit, ParseError, ParseResult, Parser, Unit};
pub use pretty::pretty_print;
pub use token::{Span, Token, TokenKind};
