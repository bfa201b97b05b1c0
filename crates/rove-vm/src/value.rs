//! Operand values.
//!
//! Floating point values are stored as raw bits so that every value is
//! `Eq + Hash` and two states compare equal exactly when their bits do.

use rove_ir::{Constant, Kind, Type};
use std::fmt;

/// Index of an object slot in the heap. Slots are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(pub u32);

impl ObjRef {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(u32),
    Double(u64),
    Ref(ObjRef),
    #[default]
    Null,
    /// Upper half of a wide value, or an unset local.
    Top,
}

impl Value {
    pub fn float(x: f32) -> Value {
        Value::Float(x.to_bits())
    }

    pub fn double(x: f64) -> Value {
        Value::Double(x.to_bits())
    }

    pub fn bool(b: bool) -> Value {
        Value::Int(i32::from(b))
    }

    pub fn from_constant(c: Constant) -> Value {
        match c {
            Constant::Int(v) => Value::Int(v),
            Constant::Long(v) => Value::Long(v),
            Constant::Float(bits) => Value::Float(bits),
            Constant::Double(bits) => Value::Double(bits),
            Constant::Null => Value::Null,
        }
    }

    /// Initial value of a field or array element of the given type.
    pub fn default_for(ty: &Type) -> Value {
        match ty.kind() {
            Some(Kind::Int) => Value::Int(0),
            Some(Kind::Long) => Value::Long(0),
            Some(Kind::Float) => Value::Float(0),
            Some(Kind::Double) => Value::Double(0),
            Some(Kind::Ref) | None => Value::Null,
        }
    }

    pub fn kind(&self) -> Option<Kind> {
        match self {
            Value::Int(_) => Some(Kind::Int),
            Value::Long(_) => Some(Kind::Long),
            Value::Float(_) => Some(Kind::Float),
            Value::Double(_) => Some(Kind::Double),
            Value::Ref(_) | Value::Null => Some(Kind::Ref),
            Value::Top => None,
        }
    }

    pub fn is_wide(&self) -> bool {
        matches!(self, Value::Long(_) | Value::Double(_))
    }

    pub fn as_int(&self) -> Option<i32> {
        match *self {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match *self {
            Value::Long(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match *self {
            Value::Float(bits) => Some(f32::from_bits(bits)),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match *self {
            Value::Double(bits) => Some(f64::from_bits(bits)),
            _ => None,
        }
    }

    /// `Some(None)` for null, `Some(Some(r))` for an object, `None` for a primitive.
    pub fn as_reference(&self) -> Option<Option<ObjRef>> {
        match *self {
            Value::Ref(r) => Some(Some(r)),
            Value::Null => Some(None),
            _ => None,
        }
    }

    pub fn object(&self) -> Option<ObjRef> {
        match *self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Ref(_) => "reference",
            Value::Null => "null",
            Value::Top => "top",
        }
    }

    /// Narrow an int stored into a sub-int field or array element.
    pub fn narrow_to(self, ty: &Type) -> Value {
        match (self, ty) {
            (Value::Int(v), Type::Boolean) => Value::Int(v & 1),
            (Value::Int(v), Type::Byte) => Value::Int(v as i8 as i32),
            (Value::Int(v), Type::Char) => Value::Int(v as u16 as i32),
            (Value::Int(v), Type::Short) => Value::Int(v as i16 as i32),
            (v, _) => v,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}L"),
            Value::Float(bits) => write!(f, "{:?}f", f32::from_bits(*bits)),
            Value::Double(bits) => write!(f, "{:?}", f64::from_bits(*bits)),
            Value::Ref(r) => write!(f, "{r}"),
            Value::Null => write!(f, "null"),
            Value::Top => write!(f, "_"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_types() {
        assert_eq!(Value::default_for(&Type::Char), Value::Int(0));
        assert_eq!(Value::default_for(&Type::Double), Value::Double(0));
        assert_eq!(
            Value::default_for(&Type::Array(Box::new(Type::Int))),
            Value::Null
        );
    }

    #[test]
    fn test_narrowing() {
        assert_eq!(Value::Int(300).narrow_to(&Type::Byte), Value::Int(44));
        assert_eq!(Value::Int(-1).narrow_to(&Type::Char), Value::Int(65535));
        assert_eq!(Value::Int(3).narrow_to(&Type::Boolean), Value::Int(1));
        assert_eq!(Value::Int(70000).narrow_to(&Type::Int), Value::Int(70000));
    }

    #[test]
    fn test_float_equality_is_bitwise() {
        assert_eq!(Value::float(f32::NAN), Value::float(f32::NAN));
        assert_ne!(Value::double(0.0), Value::double(-0.0));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Long(5).to_string(), "5L");
        assert_eq!(Value::Ref(ObjRef(3)).to_string(), "@3");
        assert_eq!(Value::double(1.0).to_string(), "1.0");
    }
}
