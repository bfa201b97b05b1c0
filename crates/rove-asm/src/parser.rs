//! Recursive descent parser producing class definitions and a [`Program`].

use crate::lexer::Lexer;
use crate::token::{Span, Token, TokenKind};
use rove_ir::{
    ArithOp, ClassDef, Cond, Constant, FieldDef, FieldRef, Handler, Insn, InvokeKind, Kind,
    MetadataError, MethodDef, MethodFlags, MethodRef, MethodSig, Program, ProgramBuilder, Type,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unexpected token at {span}: expected {expected}, found {found}")]
    UnexpectedToken {
        expected: String,
        found: String,
        span: Span,
    },
    #[error("unexpected end of file at {span}")]
    UnexpectedEof { span: Span },
    #[error("invalid syntax at {span}: {message}")]
    InvalidSyntax { message: String, span: Span },
    #[error("{source}")]
    Metadata {
        #[source]
        source: MetadataError,
        span: Span,
    },
}

impl ParseError {
    pub fn span(&self) -> Span {
        match self {
            ParseError::UnexpectedToken { span, .. } => *span,
            ParseError::UnexpectedEof { span } => *span,
            ParseError::InvalidSyntax { span, .. } => *span,
            ParseError::Metadata { span, .. } => *span,
        }
    }
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Parsed source before registration.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub classes: Vec<ClassDef>,
    pub entry: Option<String>,
    /// Span of each class name, for attaching registration errors.
    pub class_spans: HashMap<String, Span>,
}

impl Unit {
    /// Register the parsed classes on top of the prelude.
    pub fn into_program(self) -> ParseResult<Program> {
        let mut builder = ProgramBuilder::new();
        for class in &self.classes {
            builder.add_class(class.clone());
        }
        if let Some(entry) = &self.entry {
            builder.entry(entry);
        }
        builder.build().map_err(|source| {
            let span = metadata_class(&source)
                .and_then(|c| self.class_spans.get(c).copied())
                .unwrap_or_default();
            ParseError::Metadata { source, span }
        })
    }
}

fn metadata_class(e: &MetadataError) -> Option<&str> {
    match e {
        MetadataError::DuplicateClass { name } => Some(name),
        MetadataError::DuplicateMember { class, .. }
        | MetadataError::UnknownSuperclass { class, .. }
        | MetadataError::InheritanceCycle { class } => Some(class),
        _ => None,
    }
}

/// Branch or handler operand waiting for its label to be defined.
struct Fixup {
    pc: usize,
    label: String,
    span: Span,
}

struct PendingHandler {
    class: Option<Arc<str>>,
    labels: [(String, Span); 3],
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(source: &str) -> Self {
        let tokens: Vec<_> = Lexer::new(source)
            .tokenize()
            .into_iter()
            .filter(|t| !t.kind.is_trivia())
            .collect();
        Self { tokens, pos: 0 }
    }

    pub fn parse_unit(&mut self) -> ParseResult<Unit> {
        let mut unit = Unit {
            classes: Vec::new(),
            entry: None,
            class_spans: HashMap::new(),
        };
        while !self.is_at_end() {
            match self.peek_kind() {
                TokenKind::Class => {
                    let (class, span) = self.parse_class()?;
                    unit.class_spans.insert(class.name.clone(), span);
                    unit.classes.push(class);
                }
                TokenKind::Entry => {
                    let span = self.current_span();
                    self.advance();
                    let (class, name) = self.parse_qualified()?;
                    if unit.entry.is_some() {
                        return Err(ParseError::InvalidSyntax {
                            message: "duplicate entry declaration".into(),
                            span,
                        });
                    }
                    unit.entry = Some(format!("{class}.{name}"));
                }
                TokenKind::Error(msg) => {
                    return Err(ParseError::InvalidSyntax {
                        message: msg,
                        span: self.current_span(),
                    })
                }
                other => {
                    return Err(ParseError::UnexpectedToken {
                        expected: "'class' or 'entry'".into(),
                        found: other.to_string(),
                        span: self.current_span(),
                    })
                }
            }
        }
        Ok(unit)
    }

    fn parse_class(&mut self) -> ParseResult<(ClassDef, Span)> {
        self.expect(TokenKind::Class)?;
        let span = self.current_span();
        let name = self.parse_ident()?;
        let mut class = ClassDef::new(&name);
        if self.match_token(TokenKind::Extends) {
            class.superclass = Some(self.parse_ident()?);
        }

        loop {
            match self.peek_kind() {
                TokenKind::End => {
                    self.advance();
                    break;
                }
                TokenKind::Eof => {
                    return Err(ParseError::UnexpectedEof {
                        span: self.current_span(),
                    })
                }
                _ => self.parse_member(&mut class)?,
            }
        }
        Ok((class, span))
    }

    fn parse_member(&mut self, class: &mut ClassDef) -> ParseResult<()> {
        let mut flags = MethodFlags::default();
        let mut is_final = false;
        while self.peek_kind().is_modifier() {
            let span = self.current_span();
            let slot = match self.peek_kind() {
                TokenKind::Static => &mut flags.is_static,
                TokenKind::Final => &mut is_final,
                TokenKind::Synchronized => &mut flags.is_synchronized,
                TokenKind::Native => &mut flags.is_native,
                _ => &mut flags.is_abstract,
            };
            if *slot {
                return Err(ParseError::InvalidSyntax {
                    message: "repeated modifier".into(),
                    span,
                });
            }
            *slot = true;
            self.advance();
        }

        let span = self.current_span();
        match self.peek_kind() {
            TokenKind::Field => {
                self.advance();
                if flags.is_synchronized || flags.is_native || flags.is_abstract {
                    return Err(ParseError::InvalidSyntax {
                        message: "invalid modifier on field".into(),
                        span,
                    });
                }
                let name = self.parse_ident()?;
                self.expect(TokenKind::Colon)?;
                let ty_span = self.current_span();
                let ty = Type::from_name(&self.parse_ident()?);
                if ty == Type::Void {
                    return Err(ParseError::InvalidSyntax {
                        message: "field cannot be void".into(),
                        span: ty_span,
                    });
                }
                class.fields.push(FieldDef {
                    name,
                    ty,
                    is_static: flags.is_static,
                    is_final,
                });
                Ok(())
            }
            TokenKind::Method => {
                self.advance();
                if is_final {
                    return Err(ParseError::InvalidSyntax {
                        message: "'final' is only valid on fields".into(),
                        span,
                    });
                }
                let method = self.parse_method(flags)?;
                class.methods.push(method);
                Ok(())
            }
            other => Err(ParseError::UnexpectedToken {
                expected: "'field', 'method' or 'end'".into(),
                found: other.to_string(),
                span,
            }),
        }
    }

    fn parse_method(&mut self, flags: MethodFlags) -> ParseResult<MethodDef> {
        let name = self.parse_ident()?;
        let sig = self.parse_descriptor()?;
        let mut method = MethodDef::new(&name, sig, Vec::new());
        method.flags = flags;
        if self.match_token(TokenKind::Locals) {
            let span = self.current_span();
            let n = self.parse_integer()?;
            method.max_locals = Some(usize::try_from(n).map_err(|_| ParseError::InvalidSyntax {
                message: "locals must be non-negative".into(),
                span,
            })?);
        }
        if flags.is_native || flags.is_abstract {
            return Ok(method);
        }

        let mut labels: HashMap<String, usize> = HashMap::new();
        let mut fixups: Vec<Fixup> = Vec::new();
        let mut handlers: Vec<PendingHandler> = Vec::new();
        loop {
            let span = self.current_span();
            match self.peek_kind() {
                TokenKind::End => {
                    self.advance();
                    break;
                }
                TokenKind::Eof => return Err(ParseError::UnexpectedEof { span }),
                TokenKind::Catch => {
                    self.advance();
                    let class = self.parse_ident()?;
                    let class = (class != "any").then(|| Arc::from(class.as_str()));
                    let mut label = || -> ParseResult<(String, Span)> {
                        let span = self.current_span();
                        Ok((self.parse_ident()?, span))
                    };
                    let labels = [label()?, label()?, label()?];
                    handlers.push(PendingHandler { class, labels });
                }
                TokenKind::Ident(word) if self.peek_ahead_kind(1) == TokenKind::Colon => {
                    self.advance();
                    self.advance();
                    if labels.insert(word.clone(), method.code.len()).is_some() {
                        return Err(ParseError::InvalidSyntax {
                            message: format!("duplicate label '{word}'"),
                            span,
                        });
                    }
                }
                TokenKind::Ident(mnemonic) => {
                    self.advance();
                    let pc = method.code.len();
                    let insn = self.parse_insn(&mnemonic, span, pc, &mut fixups)?;
                    method.code.push(insn);
                }
                other => {
                    return Err(ParseError::UnexpectedToken {
                        expected: "instruction, label, 'catch' or 'end'".into(),
                        found: other.to_string(),
                        span,
                    })
                }
            }
        }

        let resolve = |label: &str, span: Span| -> ParseResult<usize> {
            labels
                .get(label)
                .copied()
                .ok_or_else(|| ParseError::InvalidSyntax {
                    message: format!("undefined label '{label}'"),
                    span,
                })
        };
        for fixup in fixups {
            let target = resolve(&fixup.label, fixup.span)?;
            method.code[fixup.pc].set_branch_target(target);
        }
        for h in handlers {
            let [(start, s0), (end, s1), (target, s2)] = h.labels;
            method.handlers.push(Handler {
                start: resolve(&start, s0)?,
                end: resolve(&end, s1)?,
                target: resolve(&target, s2)?,
                class: h.class,
            });
        }
        Ok(method)
    }

    fn parse_insn(
        &mut self,
        mnemonic: &str,
        span: Span,
        pc: usize,
        fixups: &mut Vec<Fixup>,
    ) -> ParseResult<Insn> {
        let simple = match mnemonic {
            "nop" => Some(Insn::Nop),
            "aconst_null" => Some(Insn::Const(Constant::Null)),
            "lcmp" => Some(Insn::LCmp),
            "pop" => Some(Insn::Pop),
            "pop2" => Some(Insn::Pop2),
            "dup" => Some(Insn::Dup),
            "dup_x1" => Some(Insn::DupX1),
            "swap" => Some(Insn::Swap),
            "arraylength" => Some(Insn::ArrayLength),
            "athrow" => Some(Insn::Throw),
            "monitorenter" => Some(Insn::MonitorEnter),
            "monitorexit" => Some(Insn::MonitorExit),
            "return" => Some(Insn::Return(None)),
            _ => None,
        };
        if let Some(insn) = simple {
            return Ok(insn);
        }

        let mut branch = |this: &mut Self, insn: Insn| -> ParseResult<Insn> {
            let label_span = this.current_span();
            let label = this.parse_ident()?;
            fixups.push(Fixup {
                pc,
                label,
                span: label_span,
            });
            Ok(insn)
        };

        match mnemonic {
            "iconst" => {
                let n = self.parse_integer()?;
                let n = i32::try_from(n).map_err(|_| ParseError::InvalidSyntax {
                    message: format!("{n} does not fit in an int"),
                    span,
                })?;
                return Ok(Insn::Const(Constant::Int(n)));
            }
            "lconst" => return Ok(Insn::Const(Constant::Long(self.parse_integer()?))),
            "fconst" => {
                let x = self.parse_number()? as f32;
                return Ok(Insn::Const(Constant::Float(x.to_bits())));
            }
            "dconst" => {
                let x = self.parse_number()?;
                return Ok(Insn::Const(Constant::Double(x.to_bits())));
            }
            "iinc" => {
                let local = self.parse_local()?;
                let delta = self.parse_integer()?;
                let delta = i32::try_from(delta).map_err(|_| ParseError::InvalidSyntax {
                    message: "increment out of range".into(),
                    span,
                })?;
                return Ok(Insn::Inc(local, delta));
            }
            "ifnull" => return branch(self, Insn::IfNull(0)),
            "ifnonnull" => return branch(self, Insn::IfNonNull(0)),
            "goto" => return branch(self, Insn::Goto(0)),
            "getfield" => return Ok(Insn::GetField(self.parse_field_ref()?)),
            "putfield" => return Ok(Insn::PutField(self.parse_field_ref()?)),
            "getstatic" => return Ok(Insn::GetStatic(self.parse_field_ref()?)),
            "putstatic" => return Ok(Insn::PutStatic(self.parse_field_ref()?)),
            "new" => return Ok(Insn::New(Arc::from(self.parse_ident()?.as_str()))),
            "instanceof" => return Ok(Insn::InstanceOf(Arc::from(self.parse_ident()?.as_str()))),
            "checkcast" => return Ok(Insn::CheckCast(Arc::from(self.parse_ident()?.as_str()))),
            "newarray" => {
                let ty = Type::from_name(&self.parse_ident()?);
                if ty == Type::Void {
                    return Err(ParseError::InvalidSyntax {
                        message: "array of void".into(),
                        span,
                    });
                }
                return Ok(Insn::NewArray(ty));
            }
            "invokestatic" => return self.parse_invoke(InvokeKind::Static),
            "invokevirtual" => return self.parse_invoke(InvokeKind::Virtual),
            "invokeinterface" => return self.parse_invoke(InvokeKind::Interface),
            "invokespecial" => return self.parse_invoke(InvokeKind::Special),
            _ => {}
        }

        if let Some(cond) = mnemonic.strip_prefix("if_icmp").and_then(Cond::from_name) {
            return branch(self, Insn::IfICmp(cond, 0));
        }
        if let Some(cond) = mnemonic.strip_prefix("if_acmp").and_then(Cond::from_name) {
            if !matches!(cond, Cond::Eq | Cond::Ne) {
                return Err(unknown_mnemonic(mnemonic, span));
            }
            return branch(self, Insn::IfACmp(cond, 0));
        }
        if let Some(cond) = mnemonic.strip_prefix("if").and_then(Cond::from_name) {
            return branch(self, Insn::If(cond, 0));
        }

        // Typed families: first letter selects the operand kind.
        let mut chars = mnemonic.chars();
        let Some(kind) = chars.next().and_then(typed_prefix) else {
            return Err(unknown_mnemonic(mnemonic, span));
        };
        let rest = chars.as_str();
        let numeric = kind != Kind::Ref;
        let integral = matches!(kind, Kind::Int | Kind::Long);
        let insn = match rest {
            "load" => Insn::Load(kind, self.parse_local()?),
            "store" => Insn::Store(kind, self.parse_local()?),
            "aload" => Insn::ArrayLoad(kind),
            "astore" => Insn::ArrayStore(kind),
            "return" => Insn::Return(Some(kind)),
            "neg" if numeric => Insn::Neg(kind),
            _ => {
                if let Some(op) = ArithOp::from_name(rest) {
                    if !numeric || (op.is_bitwise() && !integral) {
                        return Err(unknown_mnemonic(mnemonic, span));
                    }
                    Insn::Arith(op, kind)
                } else if let Some(to) = rest
                    .strip_prefix('2')
                    .and_then(|t| t.chars().next())
                    .filter(|_| rest.len() == 2)
                    .and_then(Kind::from_prefix)
                {
                    if !numeric || to == Kind::Ref || to == kind {
                        return Err(unknown_mnemonic(mnemonic, span));
                    }
                    Insn::Convert(kind, to)
                } else {
                    return Err(unknown_mnemonic(mnemonic, span));
                }
            }
        };
        if mnemonic.starts_with(['b', 'c', 's']) && !matches!(insn, Insn::ArrayLoad(_) | Insn::ArrayStore(_))
        {
            return Err(unknown_mnemonic(mnemonic, span));
        }
        Ok(insn)
    }

    fn parse_invoke(&mut self, kind: InvokeKind) -> ParseResult<Insn> {
        let (class, name) = self.parse_qualified()?;
        let sig = self.parse_descriptor()?;
        Ok(Insn::Invoke(kind, MethodRef::new(&class, &name, sig)))
    }

    fn parse_field_ref(&mut self) -> ParseResult<FieldRef> {
        let (class, name) = self.parse_qualified()?;
        Ok(FieldRef::new(&class, &name))
    }

    fn parse_qualified(&mut self) -> ParseResult<(String, String)> {
        let class = self.parse_ident()?;
        self.expect(TokenKind::Dot)?;
        let name = self.parse_ident()?;
        Ok((class, name))
    }

    fn parse_descriptor(&mut self) -> ParseResult<MethodSig> {
        let span = self.current_span();
        match self.peek_kind() {
            TokenKind::Descriptor(d) => {
                self.advance();
                MethodSig::parse(&d).map_err(|e| ParseError::InvalidSyntax {
                    message: e.to_string(),
                    span,
                })
            }
            other => Err(ParseError::UnexpectedToken {
                expected: "method descriptor".into(),
                found: other.to_string(),
                span,
            }),
        }
    }

    fn parse_local(&mut self) -> ParseResult<u16> {
        let span = self.current_span();
        let n = self.parse_integer()?;
        u16::try_from(n).map_err(|_| ParseError::InvalidSyntax {
            message: format!("invalid local index {n}"),
            span,
        })
    }

    fn parse_integer(&mut self) -> ParseResult<i64> {
        match self.peek_kind() {
            TokenKind::Integer(n) => {
                self.advance();
                Ok(n)
            }
            other => Err(ParseError::UnexpectedToken {
                expected: "integer".into(),
                found: other.to_string(),
                span: self.current_span(),
            }),
        }
    }

    fn parse_number(&mut self) -> ParseResult<f64> {
        match self.peek_kind() {
            TokenKind::Integer(n) => {
                self.advance();
                Ok(n as f64)
            }
            TokenKind::Float(x) => {
                self.advance();
                Ok(x)
            }
            other => Err(ParseError::UnexpectedToken {
                expected: "number".into(),
                found: other.to_string(),
                span: self.current_span(),
            }),
        }
    }

    fn parse_ident(&mut self) -> ParseResult<String> {
        let span = self.current_span();
        match self.peek_kind() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            TokenKind::Error(msg) => Err(ParseError::InvalidSyntax { message: msg, span }),
            TokenKind::Eof => Err(ParseError::UnexpectedEof { span }),
            other => Err(ParseError::UnexpectedToken {
                expected: "identifier".into(),
                found: other.to_string(),
                span,
            }),
        }
    }

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .unwrap_or_else(|| self.tokens.last().expect("tokens should have at least EOF"))
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind.clone()
    }

    fn peek_ahead_kind(&self, offset: usize) -> TokenKind {
        self.tokens
            .get(self.pos + offset)
            .map(|t| t.kind.clone())
            .unwrap_or(TokenKind::Eof)
    }

    fn current_span(&self) -> Span {
        self.peek().span
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof)
    }

    fn check(&self, kind: TokenKind) -> bool {
        std::mem::discriminant(&self.peek_kind()) == std::mem::discriminant(&kind)
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn advance(&mut self) {
        if !self.is_at_end() {
            self.pos += 1;
        }
    }

    fn expect(&mut self, kind: TokenKind) -> ParseResult<()> {
        if self.check(kind.clone()) {
            self.advance();
            Ok(())
        } else {
            Err(ParseError::UnexpectedToken {
                expected: kind.to_string(),
                found: self.peek_kind().to_string(),
                span: self.current_span(),
            })
        }
    }
}

/// `b`, `c` and `s` only prefix array element access and map to `int`.
fn typed_prefix(c: char) -> Option<Kind> {
    match c {
        'b' | 'c' | 's' => Some(Kind::Int),
        other => Kind::from_prefix(other),
    }
}

fn unknown_mnemonic(mnemonic: &str, span: Span) -> ParseError {
    ParseError::InvalidSyntax {
        message: format!("unknown instruction '{mnemonic}'"),
        span,
    }
}

/// Parse source text into class definitions without registering them.
pub fn parse_unit(source: &str) -> ParseResult<Unit> {
    Parser::new(source).parse_unit()
}

/// Parse and register source text as a program.
pub fn parse(source: &str) -> ParseResult<Program> {
    parse_unit(source)?.into_program()
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTER: &str = r#"
// shared counter
class Counter
  field value: int
  static field instances: long

  synchronized method inc()V
    aload 0
    dup
    getfield Counter.value
    iconst 1
    iadd
    putfield Counter.value
    return
  end
end

class Main
  static method main()V locals 2
    new Counter
    dup
    invokespecial Counter.<init>()V
    astore 0
    iconst 0
    istore 1
  loop:
    iload 1
    iconst 3
    if_icmpge done
    aload 0
    invokevirtual Counter.inc()V
    iinc 1 1
    goto loop
  done:
    return
  end
end
"#;

    #[test]
    fn test_parse_counter() {
        let unit = parse_unit(COUNTER).unwrap();
        assert_eq!(unit.classes.len(), 2);
        let counter = &unit.classes[0];
        assert_eq!(counter.fields.len(), 2);
        assert!(counter.fields[1].is_static);
        assert!(counter.methods[0].flags.is_synchronized);

        let main = &unit.classes[1].methods[0];
        assert_eq!(main.max_locals, Some(2));
        assert_eq!(main.code[8], Insn::IfICmp(Cond::Ge, 13));
        assert_eq!(main.code[12], Insn::Goto(6));
    }

    #[test]
    fn test_parse_registers_program() {
        let program = parse(COUNTER).unwrap();
        let entry = program.method(program.entry().unwrap());
        assert_eq!(entry.to_string(), "Main.main");
        rove_ir::check_program(&program).unwrap();
    }

    #[test]
    fn test_handlers_and_natives() {
        let src = r#"
class T
  native method peek(I)I
  static method m()V
  start:
    iconst 1
    iconst 0
    idiv
    pop
  stop:
    return
  handler:
    pop
    return
    catch ArithmeticException start stop handler
    catch any start stop handler
  end
end
entry T.m
"#;
        let unit = parse_unit(src).unwrap();
        let m = &unit.classes[0].methods[1];
        assert_eq!(m.handlers.len(), 2);
        assert_eq!(m.handlers[0].start, 0);
        assert_eq!(m.handlers[0].end, 4);
        assert_eq!(m.handlers[0].target, 5);
        assert_eq!(m.handlers[1].class, None);
        assert!(unit.classes[0].methods[0].flags.is_native);
        assert_eq!(unit.entry.as_deref(), Some("T.m"));
    }

    #[test]
    fn test_typed_families() {
        let src = "class T static method m()V lconst 5 l2i i2d d2l lneg pop2 baload castore return end end";
        let unit = parse_unit(src).unwrap();
        let code = &unit.classes[0].methods[0].code;
        assert_eq!(code[0], Insn::Const(Constant::Long(5)));
        assert_eq!(code[1], Insn::Convert(Kind::Long, Kind::Int));
        assert_eq!(code[4], Insn::Neg(Kind::Long));
        assert_eq!(code[5], Insn::Pop2);
        assert_eq!(code[6], Insn::ArrayLoad(Kind::Int));
        assert_eq!(code[7], Insn::ArrayStore(Kind::Int));
        assert!(parse_unit("class T static method m()V bload 0 end end").is_err());
    }

    #[test]
    fn test_errors_carry_spans() {
        let err = parse_unit("class T\n  static method m()V\n    frob\n  end\nend").unwrap_err();
        assert!(err.to_string().contains("unknown instruction 'frob'"));
        assert_eq!(err.span().line, 3);

        let err = parse_unit("class T static method m()V goto nowhere end end").unwrap_err();
        assert!(err.to_string().contains("undefined label"));

        assert!(parse_unit("class T static method m()V fadd fand end end").is_err());
        assert!(parse_unit("class T static method m()V aneg end end").is_err());
        assert!(parse_unit("class T").is_err());
    }

    #[test]
    fn test_metadata_error_points_at_class() {
        let err = parse("class A extends Missing\nend").unwrap_err();
        assert!(matches!(err, ParseError::Metadata { .. }));
        assert_eq!(err.span().line, 1);
        assert_eq!(err.span().column, 7);
    }
}
