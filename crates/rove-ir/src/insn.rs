//! The stack-based instruction set.
//!
//! Instructions are stateless values: an opcode with its static operands.
//! Branch targets are resolved program counters within the owning method.
//! Field and method operands are symbolic and resolved at execution time.

use crate::program::Program;
use crate::types::{Kind, MethodSig, Type};
use std::fmt;
use std::sync::Arc;

/// A constant pushed by `iconst`, `lconst`, `fconst`, `dconst` or `aconst_null`.
/// Floating point constants are kept as raw bits so instructions are `Eq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Constant {
    Int(i32),
    Long(i64),
    Float(u32),
    Double(u64),
    Null,
}

impl Constant {
    pub fn kind(self) -> Kind {
        match self {
            Constant::Int(_) => Kind::Int,
            Constant::Long(_) => Kind::Long,
            Constant::Float(_) => Kind::Float,
            Constant::Double(_) => Kind::Double,
            Constant::Null => Kind::Ref,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
}

impl ArithOp {
    pub fn name(self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::Div => "div",
            ArithOp::Rem => "rem",
            ArithOp::And => "and",
            ArithOp::Or => "or",
            ArithOp::Xor => "xor",
            ArithOp::Shl => "shl",
            ArithOp::Shr => "shr",
            ArithOp::Ushr => "ushr",
        }
    }

    pub fn from_name(name: &str) -> Option<ArithOp> {
        Some(match name {
            "add" => ArithOp::Add,
            "sub" => ArithOp::Sub,
            "mul" => ArithOp::Mul,
            "div" => ArithOp::Div,
            "rem" => ArithOp::Rem,
            "and" => ArithOp::And,
            "or" => ArithOp::Or,
            "xor" => ArithOp::Xor,
            "shl" => ArithOp::Shl,
            "shr" => ArithOp::Shr,
            "ushr" => ArithOp::Ushr,
            _ => return None,
        })
    }

    /// Shift operators take an `int` shift distance regardless of operand kind.
    pub fn is_shift(self) -> bool {
        matches!(self, ArithOp::Shl | ArithOp::Shr | ArithOp::Ushr)
    }

    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            ArithOp::And | ArithOp::Or | ArithOp::Xor | ArithOp::Shl | ArithOp::Shr | ArithOp::Ushr
        )
    }
}

/// Branch condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl Cond {
    pub fn name(self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Lt => "lt",
            Cond::Ge => "ge",
            Cond::Gt => "gt",
            Cond::Le => "le",
        }
    }

    pub fn from_name(name: &str) -> Option<Cond> {
        Some(match name {
            "eq" => Cond::Eq,
            "ne" => Cond::Ne,
            "lt" => Cond::Lt,
            "ge" => Cond::Ge,
            "gt" => Cond::Gt,
            "le" => Cond::Le,
            _ => return None,
        })
    }

    pub fn holds(self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Cond::Eq => ord == Equal,
            Cond::Ne => ord != Equal,
            Cond::Lt => ord == Less,
            Cond::Ge => ord != Less,
            Cond::Gt => ord == Greater,
            Cond::Le => ord != Greater,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvokeKind {
    Static,
    Virtual,
    Interface,
    Special,
}

impl InvokeKind {
    pub fn name(self) -> &'static str {
        match self {
            InvokeKind::Static => "invokestatic",
            InvokeKind::Virtual => "invokevirtual",
            InvokeKind::Interface => "invokeinterface",
            InvokeKind::Special => "invokespecial",
        }
    }

    pub fn is_static(self) -> bool {
        self == InvokeKind::Static
    }
}

/// Symbolic field reference `Class.name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub class: Arc<str>,
    pub name: Arc<str>,
}

impl FieldRef {
    pub fn new(class: &str, name: &str) -> Self {
        Self {
            class: Arc::from(class),
            name: Arc::from(name),
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class, self.name)
    }
}

/// Symbolic method reference `Class.name(desc)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub class: Arc<str>,
    pub name: Arc<str>,
    pub sig: MethodSig,
}

impl MethodRef {
    pub fn new(class: &str, name: &str, sig: MethodSig) -> Self {
        Self {
            class: Arc::from(class),
            name: Arc::from(name),
            sig,
        }
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class, self.name, self.sig)
    }
}

/// What storage a field instruction targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessTarget {
    /// Field of the popped receiver object.
    Instance,
    /// Static storage of the owning class.
    Static,
}

/// Static operand-stack effect of one instruction, in slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackEffect {
    pub pops: usize,
    pub pushes: usize,
}

impl StackEffect {
    const fn new(pops: usize, pushes: usize) -> Self {
        Self { pops, pushes }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Insn {
    Nop,
    Const(Constant),
    Load(Kind, u16),
    Store(Kind, u16),
    /// `iinc local delta`
    Inc(u16, i32),
    Arith(ArithOp, Kind),
    Neg(Kind),
    Convert(Kind, Kind),
    LCmp,
    Pop,
    Pop2,
    Dup,
    DupX1,
    Swap,
    /// Compare the popped int against zero.
    If(Cond, usize),
    IfICmp(Cond, usize),
    /// Reference comparison, only `Eq` and `Ne` are valid.
    IfACmp(Cond, usize),
    IfNull(usize),
    IfNonNull(usize),
    Goto(usize),
    GetField(FieldRef),
    PutField(FieldRef),
    GetStatic(FieldRef),
    PutStatic(FieldRef),
    New(Arc<str>),
    NewArray(Type),
    ArrayLoad(Kind),
    ArrayStore(Kind),
    ArrayLength,
    InstanceOf(Arc<str>),
    CheckCast(Arc<str>),
    Invoke(InvokeKind, MethodRef),
    /// `None` returns void.
    Return(Option<Kind>),
    Throw,
    MonitorEnter,
    MonitorExit,
}

impl Insn {
    /// True for `getfield` / `getstatic`.
    pub fn is_field_read(&self) -> bool {
        matches!(self, Insn::GetField(_) | Insn::GetStatic(_))
    }

    /// True for `putfield` / `putstatic`.
    pub fn is_field_write(&self) -> bool {
        matches!(self, Insn::PutField(_) | Insn::PutStatic(_))
    }

    /// Storage targeted by a field instruction, `None` for everything else.
    pub fn access_target(&self) -> Option<AccessTarget> {
        match self {
            Insn::GetField(_) | Insn::PutField(_) => Some(AccessTarget::Instance),
            Insn::GetStatic(_) | Insn::PutStatic(_) => Some(AccessTarget::Static),
            _ => None,
        }
    }

    pub fn field_ref(&self) -> Option<&FieldRef> {
        match self {
            Insn::GetField(f) | Insn::PutField(f) | Insn::GetStatic(f) | Insn::PutStatic(f) => {
                Some(f)
            }
            _ => None,
        }
    }

    pub fn is_invoke(&self) -> bool {
        matches!(self, Insn::Invoke(..))
    }

    /// Explicit branch target, if any.
    pub fn branch_target(&self) -> Option<usize> {
        match *self {
            Insn::If(_, t)
            | Insn::IfICmp(_, t)
            | Insn::IfACmp(_, t)
            | Insn::IfNull(t)
            | Insn::IfNonNull(t)
            | Insn::Goto(t) => Some(t),
            _ => None,
        }
    }

    pub fn set_branch_target(&mut self, target: usize) {
        match self {
            Insn::If(_, t)
            | Insn::IfICmp(_, t)
            | Insn::IfACmp(_, t)
            | Insn::IfNull(t)
            | Insn::IfNonNull(t)
            | Insn::Goto(t) => *t = target,
            _ => {}
        }
    }

    /// Whether control can continue at `pc + 1`.
    pub fn falls_through(&self) -> bool {
        !matches!(self, Insn::Goto(_) | Insn::Return(_) | Insn::Throw)
    }

    /// Static stack effect in slots. Field and method operands are looked up
    /// in `program`; `None` means an operand could not be resolved.
    pub fn stack_effect(&self, program: &Program) -> Option<StackEffect> {
        use Insn::*;
        let e = match self {
            Nop | Goto(_) | Inc(..) => StackEffect::new(0, 0),
            Const(c) => StackEffect::new(0, c.kind().width()),
            Load(k, _) => StackEffect::new(0, k.width()),
            Store(k, _) => StackEffect::new(k.width(), 0),
            Arith(op, k) => {
                let rhs = if op.is_shift() { 1 } else { k.width() };
                StackEffect::new(k.width() + rhs, k.width())
            }
            Neg(k) => StackEffect::new(k.width(), k.width()),
            Convert(from, to) => StackEffect::new(from.width(), to.width()),
            LCmp => StackEffect::new(4, 1),
            Pop => StackEffect::new(1, 0),
            Pop2 => StackEffect::new(2, 0),
            Dup => StackEffect::new(1, 2),
            DupX1 => StackEffect::new(2, 3),
            Swap => StackEffect::new(2, 2),
            If(..) | IfNull(_) | IfNonNull(_) => StackEffect::new(1, 0),
            IfICmp(..) | IfACmp(..) => StackEffect::new(2, 0),
            GetField(f) => {
                let ty = program.lookup_instance_field(f)?.ty.clone();
                StackEffect::new(1, ty.slot_width())
            }
            PutField(f) => {
                let ty = program.lookup_instance_field(f)?.ty.clone();
                StackEffect::new(1 + ty.slot_width(), 0)
            }
            GetStatic(f) => {
                let ty = program.lookup_static_field(f)?.ty.clone();
                StackEffect::new(0, ty.slot_width())
            }
            PutStatic(f) => {
                let ty = program.lookup_static_field(f)?.ty.clone();
                StackEffect::new(ty.slot_width(), 0)
            }
            New(_) => StackEffect::new(0, 1),
            NewArray(_) => StackEffect::new(1, 1),
            ArrayLoad(k) => StackEffect::new(2, k.width()),
            ArrayStore(k) => StackEffect::new(2 + k.width(), 0),
            ArrayLength => StackEffect::new(1, 1),
            InstanceOf(_) => StackEffect::new(1, 1),
            CheckCast(_) => StackEffect::new(1, 1),
            Invoke(kind, m) => {
                StackEffect::new(m.sig.arg_slots(kind.is_static()), m.sig.ret.slot_width())
            }
            Return(k) => StackEffect::new(k.map_or(0, Kind::width), 0),
            Throw => StackEffect::new(1, 0),
            MonitorEnter | MonitorExit => StackEffect::new(1, 0),
        };
        Some(e)
    }

    /// Assembly mnemonic without operands.
    pub fn mnemonic(&self) -> String {
        use Insn::*;
        match self {
            Nop => "nop".into(),
            Const(Constant::Null) => "aconst_null".into(),
            Const(c) => format!("{}const", c.kind().prefix()),
            Load(k, _) => format!("{}load", k.prefix()),
            Store(k, _) => format!("{}store", k.prefix()),
            Inc(..) => "iinc".into(),
            Arith(op, k) => format!("{}{}", k.prefix(), op.name()),
            Neg(k) => format!("{}neg", k.prefix()),
            Convert(a, b) => format!("{}2{}", a.prefix(), b.prefix()),
            LCmp => "lcmp".into(),
            Pop => "pop".into(),
            Pop2 => "pop2".into(),
            Dup => "dup".into(),
            DupX1 => "dup_x1".into(),
            Swap => "swap".into(),
            If(c, _) => format!("if{}", c.name()),
            IfICmp(c, _) => format!("if_icmp{}", c.name()),
            IfACmp(c, _) => format!("if_acmp{}", c.name()),
            IfNull(_) => "ifnull".into(),
            IfNonNull(_) => "ifnonnull".into(),
            Goto(_) => "goto".into(),
            GetField(_) => "getfield".into(),
            PutField(_) => "putfield".into(),
            GetStatic(_) => "getstatic".into(),
            PutStatic(_) => "putstatic".into(),
            New(_) => "new".into(),
            NewArray(_) => "newarray".into(),
            ArrayLoad(k) => format!("{}aload", k.prefix()),
            ArrayStore(k) => format!("{}astore", k.prefix()),
            ArrayLength => "arraylength".into(),
            InstanceOf(_) => "instanceof".into(),
            CheckCast(_) => "checkcast".into(),
            Invoke(kind, _) => kind.name().into(),
            Return(None) => "return".into(),
            Return(Some(k)) => format!("{}return", k.prefix()),
            Throw => "athrow".into(),
            MonitorEnter => "monitorenter".into(),
            MonitorExit => "monitorexit".into(),
        }
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Insn::*;
        let m = self.mnemonic();
        match self {
            Const(Constant::Int(v)) => write!(f, "{m} {v}"),
            Const(Constant::Long(v)) => write!(f, "{m} {v}"),
            Const(Constant::Float(bits)) => write!(f, "{m} {:?}", f32::from_bits(*bits)),
            Const(Constant::Double(bits)) => write!(f, "{m} {:?}", f64::from_bits(*bits)),
            Load(_, i) | Store(_, i) => write!(f, "{m} {i}"),
            Inc(i, d) => write!(f, "{m} {i} {d}"),
            If(_, t) | IfICmp(_, t) | IfACmp(_, t) | IfNull(t) | IfNonNull(t) | Goto(t) => {
                write!(f, "{m} @{t}")
            }
            GetField(r) | PutField(r) | GetStatic(r) | PutStatic(r) => write!(f, "{m} {r}"),
            New(c) | InstanceOf(c) | CheckCast(c) => write!(f, "{m} {c}"),
            NewArray(t) => write!(f, "{m} {t}"),
            Invoke(_, r) => write!(f, "{m} {r}"),
            _ => f.write_str(&m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mnemonics() {
        assert_eq!(Insn::Arith(ArithOp::Add, Kind::Int).mnemonic(), "iadd");
        assert_eq!(Insn::Convert(Kind::Int, Kind::Long).mnemonic(), "i2l");
        assert_eq!(Insn::IfICmp(Cond::Ge, 3).mnemonic(), "if_icmpge");
        assert_eq!(Insn::Return(Some(Kind::Ref)).mnemonic(), "areturn");
        assert_eq!(Insn::Const(Constant::Null).mnemonic(), "aconst_null");
    }

    #[test]
    fn test_capabilities() {
        let get = Insn::GetField(FieldRef::new("Counter", "value"));
        assert!(get.is_field_read());
        assert!(!get.is_field_write());
        assert_eq!(get.access_target(), Some(AccessTarget::Instance));
        let put = Insn::PutStatic(FieldRef::new("Main", "count"));
        assert!(put.is_field_write());
        assert_eq!(put.access_target(), Some(AccessTarget::Static));
        assert_eq!(Insn::Nop.access_target(), None);
        assert!(!Insn::Goto(0).falls_through());
        assert!(Insn::If(Cond::Eq, 4).falls_through());
    }

    #[test]
    fn test_cond_holds() {
        use std::cmp::Ordering;
        assert!(Cond::Ge.holds(Ordering::Equal));
        assert!(!Cond::Lt.holds(Ordering::Greater));
        assert!(Cond::Ne.holds(Ordering::Less));
    }

    #[test]
    fn test_display_shows_operands() {
        let insn = Insn::Invoke(
            InvokeKind::Virtual,
            MethodRef::new("Counter", "add", MethodSig::parse("(I)V").unwrap()),
        );
        assert_eq!(insn.to_string(), "invokevirtual Counter.add(I)V");
        assert_eq!(Insn::Goto(7).to_string(), "goto @7");
    }
}
