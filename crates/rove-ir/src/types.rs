//! Declared types, operand kinds and method signatures.

use crate::error::{MetadataError, MetadataResult};
use std::fmt;
use std::sync::Arc;

/// A declared type of a field, parameter, return value or array element.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    /// Reference to an instance of the named class.
    Ref(Arc<str>),
    /// Array with the given element type.
    Array(Box<Type>),
    /// Only valid as a return type.
    Void,
}

impl Type {
    /// Number of operand-stack / local-variable slots a value of this type occupies.
    pub fn slot_width(&self) -> usize {
        match self {
            Type::Void => 0,
            Type::Long | Type::Double => 2,
            _ => 1,
        }
    }

    /// Operand kind used to carry a value of this type on the stack.
    /// Sub-int primitives are widened to `Int`.
    pub fn kind(&self) -> Option<Kind> {
        match self {
            Type::Boolean | Type::Byte | Type::Char | Type::Short | Type::Int => Some(Kind::Int),
            Type::Long => Some(Kind::Long),
            Type::Float => Some(Kind::Float),
            Type::Double => Some(Kind::Double),
            Type::Ref(_) | Type::Array(_) => Some(Kind::Ref),
            Type::Void => None,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Type::Ref(_) | Type::Array(_))
    }

    pub fn is_primitive(&self) -> bool {
        !self.is_reference() && !matches!(self, Type::Void)
    }

    /// Parse a type keyword as used in field declarations and `newarray`.
    /// Unknown names are class references; a trailing `[]` makes an array.
    pub fn from_name(name: &str) -> Type {
        if let Some(elem) = name.strip_suffix("[]") {
            return Type::Array(Box::new(Type::from_name(elem)));
        }
        match name {
            "boolean" => Type::Boolean,
            "byte" => Type::Byte,
            "char" => Type::Char,
            "short" => Type::Short,
            "int" => Type::Int,
            "long" => Type::Long,
            "float" => Type::Float,
            "double" => Type::Double,
            "void" => Type::Void,
            other => Type::Ref(Arc::from(other)),
        }
    }

    /// Keyword form, inverse of [`Type::from_name`].
    pub fn name(&self) -> String {
        match self {
            Type::Boolean => "boolean".into(),
            Type::Byte => "byte".into(),
            Type::Char => "char".into(),
            Type::Short => "short".into(),
            Type::Int => "int".into(),
            Type::Long => "long".into(),
            Type::Float => "float".into(),
            Type::Double => "double".into(),
            Type::Void => "void".into(),
            Type::Ref(name) => name.to_string(),
            Type::Array(elem) => format!("{}[]", elem.name()),
        }
    }

    /// Descriptor form: `I`, `J`, `Z`, `LCounter;`, `[I`, ...
    pub fn descriptor(&self) -> String {
        let mut out = String::new();
        self.write_descriptor(&mut out);
        out
    }

    fn write_descriptor(&self, out: &mut String) {
        match self {
            Type::Boolean => out.push('Z'),
            Type::Byte => out.push('B'),
            Type::Char => out.push('C'),
            Type::Short => out.push('S'),
            Type::Int => out.push('I'),
            Type::Long => out.push('J'),
            Type::Float => out.push('F'),
            Type::Double => out.push('D'),
            Type::Void => out.push('V'),
            Type::Ref(name) => {
                out.push('L');
                out.push_str(name);
                out.push(';');
            }
            Type::Array(elem) => {
                out.push('[');
                elem.write_descriptor(out);
            }
        }
    }

    /// Parse one type from the front of a descriptor, returning the rest.
    fn parse_descriptor(desc: &str) -> Option<(Type, &str)> {
        let mut chars = desc.chars();
        let c = chars.next()?;
        let rest = chars.as_str();
        let ty = match c {
            'Z' => Type::Boolean,
            'B' => Type::Byte,
            'C' => Type::Char,
            'S' => Type::Short,
            'I' => Type::Int,
            'J' => Type::Long,
            'F' => Type::Float,
            'D' => Type::Double,
            'V' => Type::Void,
            'L' => {
                let end = rest.find(';')?;
                if end == 0 {
                    return None;
                }
                return Some((Type::Ref(Arc::from(&rest[..end])), &rest[end + 1..]));
            }
            '[' => {
                let (elem, rest) = Type::parse_descriptor(rest)?;
                if elem == Type::Void {
                    return None;
                }
                return Some((Type::Array(Box::new(elem)), rest));
            }
            _ => return None,
        };
        Some((ty, rest))
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Operand category of a stack value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Int,
    Long,
    Float,
    Double,
    Ref,
}

impl Kind {
    /// Slots occupied on the operand stack (1 or 2).
    pub fn width(self) -> usize {
        match self {
            Kind::Long | Kind::Double => 2,
            _ => 1,
        }
    }

    /// Mnemonic prefix (`i`, `l`, `f`, `d`, `a`).
    pub fn prefix(self) -> char {
        match self {
            Kind::Int => 'i',
            Kind::Long => 'l',
            Kind::Float => 'f',
            Kind::Double => 'd',
            Kind::Ref => 'a',
        }
    }

    pub fn from_prefix(c: char) -> Option<Kind> {
        match c {
            'i' => Some(Kind::Int),
            'l' => Some(Kind::Long),
            'f' => Some(Kind::Float),
            'd' => Some(Kind::Double),
            'a' => Some(Kind::Ref),
            _ => None,
        }
    }
}

/// Parameter and return types of a method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSig {
    pub params: Vec<Type>,
    pub ret: Type,
}

impl MethodSig {
    pub fn new(params: Vec<Type>, ret: Type) -> Self {
        Self { params, ret }
    }

    /// Parse a `(..)R` descriptor.
    pub fn parse(desc: &str) -> MetadataResult<Self> {
        let invalid = || MetadataError::InvalidDescriptor {
            descriptor: desc.to_string(),
        };
        let mut rest = desc.strip_prefix('(').ok_or_else(invalid)?;
        let mut params = Vec::new();
        while !rest.starts_with(')') {
            let (ty, tail) = Type::parse_descriptor(rest).ok_or_else(invalid)?;
            if ty == Type::Void {
                return Err(invalid());
            }
            params.push(ty);
            rest = tail;
        }
        let (ret, tail) = Type::parse_descriptor(&rest[1..]).ok_or_else(invalid)?;
        if !tail.is_empty() {
            return Err(invalid());
        }
        Ok(Self { params, ret })
    }

    pub fn descriptor(&self) -> String {
        let mut out = String::from("(");
        for p in &self.params {
            p.write_descriptor(&mut out);
        }
        out.push(')');
        self.ret.write_descriptor(&mut out);
        out
    }

    /// Slots taken by the declared parameters (without the receiver).
    pub fn param_slots(&self) -> usize {
        self.params.iter().map(Type::slot_width).sum()
    }

    /// Slots popped by an invocation, including the receiver for instance methods.
    pub fn arg_slots(&self, is_static: bool) -> usize {
        self.param_slots() + usize::from(!is_static)
    }
}

impl fmt::Display for MethodSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.descriptor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_roundtrip() {
        let sig = MethodSig::parse("(IJLCounter;[Z)D").unwrap();
        assert_eq!(
            sig.params,
            vec![
                Type::Int,
                Type::Long,
                Type::Ref(Arc::from("Counter")),
                Type::Array(Box::new(Type::Boolean)),
            ]
        );
        assert_eq!(sig.ret, Type::Double);
        assert_eq!(sig.descriptor(), "(IJLCounter;[Z)D");
    }

    #[test]
    fn test_slot_counts() {
        let sig = MethodSig::parse("(IJD)V").unwrap();
        assert_eq!(sig.param_slots(), 5);
        assert_eq!(sig.arg_slots(false), 6);
        assert_eq!(sig.arg_slots(true), 5);
    }

    #[test]
    fn test_invalid_descriptors() {
        assert!(MethodSig::parse("IJ)V").is_err());
        assert!(MethodSig::parse("(V)V").is_err());
        assert!(MethodSig::parse("(L;)V").is_err());
        assert!(MethodSig::parse("()").is_err());
        assert!(MethodSig::parse("()VV").is_err());
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Type::from_name("int[]"), Type::Array(Box::new(Type::Int)));
        assert_eq!(Type::from_name("Worker").name(), "Worker");
        assert_eq!(Type::from_name("long").slot_width(), 2);
        assert_eq!(Type::Char.kind(), Some(Kind::Int));
    }
}
