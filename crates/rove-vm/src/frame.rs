//! Method activations.
//!
//! Wide values occupy two slots on the operand stack and in the locals:
//! the value itself followed by `Value::Top`.

use crate::error::{VmError, VmResult};
use crate::monitor::MonitorTarget;
use crate::value::{ObjRef, Value};
use rove_ir::{ClassId, MethodId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Normal,
    /// Synthetic `<clinit>` activation. Returning does not advance the
    /// caller, whose instruction is executed again.
    ClassInit(ClassId),
    /// Call made on behalf of the given native method.
    RoundTrip(MethodId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StackFrame {
    pub method: MethodId,
    pub pc: usize,
    pub locals: Vec<Value>,
    pub stack: Vec<Value>,
    pub kind: FrameKind,
    /// Monitor taken on entry to a synchronized method.
    pub lock: Option<MonitorTarget>,
}

impl StackFrame {
    pub fn new(method: MethodId, max_locals: usize, kind: FrameKind) -> Self {
        Self {
            method,
            pc: 0,
            locals: vec![Value::Top; max_locals],
            stack: Vec::new(),
            kind,
            lock: None,
        }
    }

    /// Store arguments into the first locals, expanding wide values.
    pub fn with_args(mut self, args: &[Value]) -> Self {
        let mut slot = 0;
        for &arg in args {
            self.set_local(slot, arg);
            slot += if arg.is_wide() { 2 } else { 1 };
        }
        self
    }

    pub fn push(&mut self, v: Value) {
        self.stack.push(v);
        if v.is_wide() {
            self.stack.push(Value::Top);
        }
    }

    pub fn push_slot(&mut self, v: Value) {
        self.stack.push(v);
    }

    pub fn pop_slot(&mut self) -> VmResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| VmError::malformed("operand stack underflow"))
    }

    /// Pop one value, joining the two slots of a wide value.
    pub fn pop(&mut self) -> VmResult<Value> {
        match self.pop_slot()? {
            Value::Top => {
                let v = self.pop_slot()?;
                if !v.is_wide() {
                    return Err(VmError::malformed(format!(
                        "expected wide value below top slot, found {}",
                        v.type_name()
                    )));
                }
                Ok(v)
            }
            v => Ok(v),
        }
    }

    /// Raw slot `depth` positions below the top (0 = top).
    pub fn peek_slot(&self, depth: usize) -> VmResult<Value> {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .map(|i| self.stack[i])
            .ok_or_else(|| VmError::malformed("operand stack underflow"))
    }

    /// Reference in slot `depth` below the top, `None` for null.
    pub fn peek_ref(&self, depth: usize) -> VmResult<Option<ObjRef>> {
        let v = self.peek_slot(depth)?;
        v.as_reference()
            .ok_or_else(|| type_mismatch("reference", &v))
    }

    /// The top `n` slots, bottom first, without popping.
    pub fn top_slots(&self, n: usize) -> VmResult<&[Value]> {
        let start = self
            .stack
            .len()
            .checked_sub(n)
            .ok_or_else(|| VmError::malformed("operand stack underflow"))?;
        Ok(&self.stack[start..])
    }

    pub fn pop_slots(&mut self, n: usize) -> VmResult<Vec<Value>> {
        let start = self
            .stack
            .len()
            .checked_sub(n)
            .ok_or_else(|| VmError::malformed("operand stack underflow"))?;
        Ok(self.stack.split_off(start))
    }

    #[inline]
    pub fn pop_int(&mut self) -> VmResult<i32> {
        let v = self.pop()?;
        v.as_int().ok_or_else(|| type_mismatch("int", &v))
    }

    #[inline]
    pub fn pop_long(&mut self) -> VmResult<i64> {
        let v = self.pop()?;
        v.as_long().ok_or_else(|| type_mismatch("long", &v))
    }

    #[inline]
    pub fn pop_float(&mut self) -> VmResult<f32> {
        let v = self.pop()?;
        v.as_float().ok_or_else(|| type_mismatch("float", &v))
    }

    #[inline]
    pub fn pop_double(&mut self) -> VmResult<f64> {
        let v = self.pop()?;
        v.as_double().ok_or_else(|| type_mismatch("double", &v))
    }

    #[inline]
    pub fn pop_ref(&mut self) -> VmResult<Option<ObjRef>> {
        let v = self.pop()?;
        v.as_reference().ok_or_else(|| type_mismatch("reference", &v))
    }

    pub fn local(&self, index: u16) -> VmResult<Value> {
        self.locals
            .get(index as usize)
            .copied()
            .ok_or_else(|| VmError::malformed(format!("local {index} out of range")))
    }

    pub fn set_local(&mut self, index: usize, v: Value) {
        let needed = index + if v.is_wide() { 2 } else { 1 };
        if self.locals.len() < needed {
            self.locals.resize(needed, Value::Top);
        }
        self.locals[index] = v;
        if v.is_wide() {
            self.locals[index + 1] = Value::Top;
        }
    }

    /// References held by this frame, for garbage collection and hashing.
    pub fn references(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.locals
            .iter()
            .chain(self.stack.iter())
            .filter_map(Value::object)
    }
}

fn type_mismatch(expected: &str, found: &Value) -> VmError {
    VmError::malformed(format!(
        "type mismatch: expected {expected}, found {}",
        found.type_name()
    ))
}
