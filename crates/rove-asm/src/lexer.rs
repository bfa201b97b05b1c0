//! Lexer for the rove assembly format.
//!
//! Line breaks carry no meaning; every mnemonic has a fixed operand shape.

use crate::token::{Span, Token, TokenKind};
use std::str::Chars;

pub struct Lexer<'a> {
    source: &'a str,
    chars: Chars<'a>,
    /// Current byte position.
    pos: usize,
    line: u32,
    column: u32,
    token_start: usize,
    token_start_line: u32,
    token_start_column: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.chars(),
            pos: 0,
            line: 1,
            column: 1,
            token_start: 0,
            token_start_line: 1,
            token_start_column: 1,
        }
    }

    /// Tokenize the entire source, returning all tokens including EOF.
    pub fn tokenize(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token();
            let is_eof = token.is_eof();
            tokens.push(token);
            if is_eof {
                break;
            }
        }
        tokens
    }

    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace();
        self.mark_token_start();

        let Some(c) = self.peek() else {
            return self.make_token(TokenKind::Eof);
        };

        if c == '/' && self.peek_next() == Some('/') {
            return self.lex_comment();
        }
        if c.is_ascii_digit() || (c == '-' && self.peek_next().is_some_and(|n| n.is_ascii_digit()))
        {
            return self.lex_number();
        }
        if c == '(' {
            return self.lex_descriptor();
        }
        if c == '<' {
            return self.lex_special_name();
        }
        if is_ident_start(c) {
            return self.lex_identifier();
        }

        self.advance();
        match c {
            '.' => self.make_token(TokenKind::Dot),
            ':' => self.make_token(TokenKind::Colon),
            other => self.make_token(TokenKind::Error(format!("unexpected character '{other}'"))),
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn mark_token_start(&mut self) {
        self.token_start = self.pos;
        self.token_start_line = self.line;
        self.token_start_column = self.column;
    }

    fn peek(&self) -> Option<char> {
        self.chars.clone().next()
    }

    fn peek_next(&self) -> Option<char> {
        let mut chars = self.chars.clone();
        chars.next();
        chars.next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        Token::new(
            kind,
            Span::new(
                self.token_start,
                self.pos,
                self.token_start_line,
                self.token_start_column,
            ),
        )
    }

    fn token_text(&self) -> &'a str {
        &self.source[self.token_start..self.pos]
    }

    fn lex_comment(&mut self) -> Token {
        self.advance();
        self.advance();
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.advance();
        }
        let text = self.token_text()[2..].trim().to_string();
        self.make_token(TokenKind::Comment(text))
    }

    fn lex_number(&mut self) -> Token {
        if self.peek() == Some('-') {
            self.advance();
        }
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        let is_float = self.peek() == Some('.') && self.peek_next().is_some_and(|c| c.is_ascii_digit());
        if is_float {
            self.advance();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
            return match self.token_text().parse::<f64>() {
                Ok(x) => self.make_token(TokenKind::Float(x)),
                Err(_) => self.make_token(TokenKind::Error("invalid float literal".into())),
            };
        }
        match self.token_text().parse::<i64>() {
            Ok(n) => self.make_token(TokenKind::Integer(n)),
            Err(_) => self.make_token(TokenKind::Error("integer literal out of range".into())),
        }
    }

    /// `(params)ret` with JVM-style type letters.
    fn lex_descriptor(&mut self) -> Token {
        self.advance();
        loop {
            match self.advance() {
                Some(')') => break,
                Some(c) if c == '\n' => {
                    return self.make_token(TokenKind::Error("unterminated descriptor".into()))
                }
                Some(_) => {}
                None => return self.make_token(TokenKind::Error("unterminated descriptor".into())),
            }
        }
        while self.peek() == Some('[') {
            self.advance();
        }
        match self.advance() {
            Some('L') => loop {
                match self.advance() {
                    Some(';') => break,
                    Some(c) if c.is_whitespace() => {
                        return self
                            .make_token(TokenKind::Error("unterminated class descriptor".into()))
                    }
                    Some(_) => {}
                    None => {
                        return self
                            .make_token(TokenKind::Error("unterminated class descriptor".into()))
                    }
                }
            },
            Some(c) if c.is_ascii_uppercase() => {}
            _ => return self.make_token(TokenKind::Error("missing return type".into())),
        }
        let text = self.token_text().to_string();
        self.make_token(TokenKind::Descriptor(text))
    }

    /// `<init>` and `<clinit>`.
    fn lex_special_name(&mut self) -> Token {
        self.advance();
        while self.peek().is_some_and(|c| c.is_ascii_alphanumeric()) {
            self.advance();
        }
        if self.peek() != Some('>') {
            return self.make_token(TokenKind::Error("unterminated special name".into()));
        }
        self.advance();
        let text = self.token_text().to_string();
        self.make_token(TokenKind::Ident(text))
    }

    fn lex_identifier(&mut self) -> Token {
        while self.peek().is_some_and(is_ident_continue) {
            self.advance();
        }
        let text = self.token_text();
        match TokenKind::keyword(text) {
            Some(kw) => self.make_token(kw),
            None => self.make_token(TokenKind::Ident(text.to_string())),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '$' | '[' | ']')
}

impl Iterator for Lexer<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Self::Item> {
        let token = self.next_token();
        if token.is_eof() {
            None
        } else {
            Some(token)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<TokenKind> {
        Lexer::new(source)
            .tokenize()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_empty() {
        assert_eq!(lex(""), vec![TokenKind::Eof]);
    }

    #[test]
    fn test_class_header() {
        assert_eq!(
            lex("class Worker extends Thread"),
            vec![
                TokenKind::Class,
                TokenKind::Ident("Worker".into()),
                TokenKind::Extends,
                TokenKind::Ident("Thread".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            lex("42 -7 1.5 -0.25"),
            vec![
                TokenKind::Integer(42),
                TokenKind::Integer(-7),
                TokenKind::Float(1.5),
                TokenKind::Float(-0.25),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_method_reference() {
        assert_eq!(
            lex("invokevirtual Counter.add(ILCounter;)[J"),
            vec![
                TokenKind::Ident("invokevirtual".into()),
                TokenKind::Ident("Counter".into()),
                TokenKind::Dot,
                TokenKind::Ident("add".into()),
                TokenKind::Descriptor("(ILCounter;)[J".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_special_names_and_arrays() {
        assert_eq!(
            lex("<init> int[] dup_x1"),
            vec![
                TokenKind::Ident("<init>".into()),
                TokenKind::Ident("int[]".into()),
                TokenKind::Ident("dup_x1".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_and_labels() {
        let kinds = lex("loop: // spin\n goto loop");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Ident("loop".into()),
                TokenKind::Colon,
                TokenKind::Comment("spin".into()),
                TokenKind::Ident("goto".into()),
                TokenKind::Ident("loop".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_span_tracking() {
        let tokens = Lexer::new("class A\n  end").tokenize();
        assert_eq!(tokens[2].span.line, 2);
        assert_eq!(tokens[2].span.column, 3);
        assert_eq!(tokens[1].span.start, 6);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(lex("(II")[0], TokenKind::Error(_)));
        assert!(matches!(lex("#")[0], TokenKind::Error(_)));
        assert!(matches!(lex("<init")[0], TokenKind::Error(_)));
    }
}
