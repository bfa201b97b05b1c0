//! Token types and source spans for the assembly lexer.

use std::fmt;

/// A span in the source text, tracking byte offsets and line/column.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    /// Start byte offset (inclusive).
    pub start: usize,
    /// End byte offset (exclusive).
    pub end: usize,
    /// Line number (1-indexed).
    pub line: u32,
    /// Column number (1-indexed, in characters).
    pub column: u32,
}

impl Span {
    pub fn new(start: usize, end: usize, line: u32, column: u32) -> Self {
        Self {
            start,
            end,
            line,
            column,
        }
    }

    /// Placeholder for errors that have no source position.
    pub fn dummy() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    // === Keywords ===
    Class,
    Extends,
    End,
    Field,
    Method,
    Static,
    Final,
    Synchronized,
    Native,
    Abstract,
    Locals,
    Catch,
    Entry,

    // === Punctuation ===
    Dot,
    Colon,

    // === Literals and names ===
    Integer(i64),
    Float(f64),
    /// Method descriptor such as `(IJ)V`.
    Descriptor(String),
    /// Class, member, label, type or mnemonic name.
    Ident(String),

    // === Trivia ===
    Comment(String),

    Eof,
    Error(String),
}

impl TokenKind {
    pub fn keyword(s: &str) -> Option<TokenKind> {
        Some(match s {
            "class" => TokenKind::Class,
            "extends" => TokenKind::Extends,
            "end" => TokenKind::End,
            "field" => TokenKind::Field,
            "method" => TokenKind::Method,
            "static" => TokenKind::Static,
            "final" => TokenKind::Final,
            "synchronized" => TokenKind::Synchronized,
            "native" => TokenKind::Native,
            "abstract" => TokenKind::Abstract,
            "locals" => TokenKind::Locals,
            "catch" => TokenKind::Catch,
            "entry" => TokenKind::Entry,
            _ => return None,
        })
    }

    pub fn is_trivia(&self) -> bool {
        matches!(self, TokenKind::Comment(_))
    }

    pub fn is_modifier(&self) -> bool {
        matches!(
            self,
            TokenKind::Static
                | TokenKind::Final
                | TokenKind::Synchronized
                | TokenKind::Native
                | TokenKind::Abstract
        )
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Class => write!(f, "class"),
            TokenKind::Extends => write!(f, "extends"),
            TokenKind::End => write!(f, "end"),
            TokenKind::Field => write!(f, "field"),
            TokenKind::Method => write!(f, "method"),
            TokenKind::Static => write!(f, "static"),
            TokenKind::Final => write!(f, "final"),
            TokenKind::Synchronized => write!(f, "synchronized"),
            TokenKind::Native => write!(f, "native"),
            TokenKind::Abstract => write!(f, "abstract"),
            TokenKind::Locals => write!(f, "locals"),
            TokenKind::Catch => write!(f, "catch"),
            TokenKind::Entry => write!(f, "entry"),
            TokenKind::Dot => write!(f, "."),
            TokenKind::Colon => write!(f, ":"),
            TokenKind::Integer(n) => write!(f, "{}", n),
            TokenKind::Float(x) => write!(f, "{:?}", x),
            TokenKind::Descriptor(d) => write!(f, "{}", d),
            TokenKind::Ident(s) => write!(f, "{}", s),
            TokenKind::Comment(s) => write!(f, "// {}", s),
            TokenKind::Eof => write!(f, "EOF"),
            TokenKind::Error(msg) => write!(f, "ERROR: {}", msg),
        }
    }
}

/// A token with its span in the source text.
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self.kind, TokenKind::Eof)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, TokenKind::Error(_))
    }
}
