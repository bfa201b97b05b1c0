//! Instruction semantics.
//!
//! Arithmetic follows Java: integer operations wrap, shift distances are
//! masked, integer division by zero raises `ArithmeticException` and
//! float-to-int conversions saturate. Faults of the program are raised as
//! exceptions in the executing thread; only inconsistencies of the checker
//! itself are returned as [`VmError`].

use crate::choice::{Choice, ChoiceDomain};
use crate::error::{VmError, VmResult};
use crate::frame::{FrameKind, StackFrame};
use crate::heap::{HeapObject, ObjectData};
use crate::kernel::UncaughtException;
use crate::monitor::MonitorTarget;
use crate::native::{NativeEnv, NativeOutcome};
use crate::perturb::Perturbation;
use crate::scheduler::SchedEvent;
use crate::thread::ThreadId;
use crate::value::{ObjRef, Value};
use crate::vm::Vm;
use rove_ir::prelude::{
    ARITHMETIC_EXCEPTION, ARRAY_INDEX_EXCEPTION, CLASS_CAST_EXCEPTION,
    ILLEGAL_MONITOR_STATE_EXCEPTION, NEGATIVE_ARRAY_SIZE_EXCEPTION, NULL_POINTER_EXCEPTION,
    OBJECT, OUT_OF_MEMORY_ERROR,
};
use rove_ir::{ArithOp, ClassId, FieldRef, Insn, InvokeKind, Kind, MethodId, MethodRef, Type};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

/// How the program counter moves after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Next,
    Jump(usize),
    /// The instruction moved the pc itself, or must be executed again.
    Hold,
}

impl Vm {
    pub(crate) fn execute(
        &mut self,
        thread: ThreadId,
        insn: &Insn,
        first_step: bool,
    ) -> VmResult<()> {
        let (method, pc) = {
            let frame = self.frame(thread)?;
            (frame.method, frame.pc)
        };
        let depth = self.kernel.thread(thread).frames.len();
        let flow = self.dispatch(thread, insn, first_step)?;
        match flow {
            Flow::Next => self.frame_mut(thread)?.pc += 1,
            Flow::Jump(target) => self.frame_mut(thread)?.pc = target,
            Flow::Hold => {}
        }
        if self.config.idle_max_backjumps > 0 {
            let next = match flow {
                Flow::Jump(target) => Some(target),
                _ => None,
            };
            self.track_idle(thread, insn, method, depth, pc, next)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, thread: ThreadId, insn: &Insn, first_step: bool) -> VmResult<Flow> {
        match insn {
            Insn::Nop => Ok(Flow::Next),

            // === Constants and locals ===
            Insn::Const(c) => {
                self.frame_mut(thread)?.push(Value::from_constant(*c));
                Ok(Flow::Next)
            }
            Insn::Load(kind, index) => {
                let frame = self.frame_mut(thread)?;
                let v = frame.local(*index)?;
                check_kind(*kind, &v)?;
                frame.push(v);
                Ok(Flow::Next)
            }
            Insn::Store(kind, index) => {
                let frame = self.frame_mut(thread)?;
                let v = frame.pop()?;
                check_kind(*kind, &v)?;
                frame.set_local(*index as usize, v);
                Ok(Flow::Next)
            }
            Insn::Inc(index, delta) => {
                let frame = self.frame_mut(thread)?;
                let v = frame.local(*index)?;
                check_kind(Kind::Int, &v)?;
                let i = v.as_int().unwrap_or_default();
                frame.set_local(*index as usize, Value::Int(i.wrapping_add(*delta)));
                Ok(Flow::Next)
            }

            // === Arithmetic ===
            Insn::Arith(op, kind) => self.arith(thread, *op, *kind),
            Insn::Neg(kind) => {
                let frame = self.frame_mut(thread)?;
                let v = match kind {
                    Kind::Int => Value::Int(frame.pop_int()?.wrapping_neg()),
                    Kind::Long => Value::Long(frame.pop_long()?.wrapping_neg()),
                    Kind::Float => Value::float(-frame.pop_float()?),
                    Kind::Double => Value::double(-frame.pop_double()?),
                    Kind::Ref => return Err(VmError::malformed("negation of a reference")),
                };
                frame.push(v);
                Ok(Flow::Next)
            }
            Insn::Convert(from, to) => {
                let frame = self.frame_mut(thread)?;
                let v = frame.pop()?;
                frame.push(convert(*from, *to, v)?);
                Ok(Flow::Next)
            }
            Insn::LCmp => {
                let frame = self.frame_mut(thread)?;
                let b = frame.pop_long()?;
                let a = frame.pop_long()?;
                frame.push(Value::Int(a.cmp(&b) as i32));
                Ok(Flow::Next)
            }

            // === Operand stack ===
            Insn::Pop => {
                self.frame_mut(thread)?.pop_slot()?;
                Ok(Flow::Next)
            }
            Insn::Pop2 => {
                self.frame_mut(thread)?.pop_slots(2)?;
                Ok(Flow::Next)
            }
            Insn::Dup => {
                let frame = self.frame_mut(thread)?;
                let v = frame.peek_slot(0)?;
                frame.push_slot(v);
                Ok(Flow::Next)
            }
            Insn::DupX1 => {
                let frame = self.frame_mut(thread)?;
                let v1 = frame.pop_slot()?;
                let v2 = frame.pop_slot()?;
                frame.push_slot(v1);
                frame.push_slot(v2);
                frame.push_slot(v1);
                Ok(Flow::Next)
            }
            Insn::Swap => {
                let frame = self.frame_mut(thread)?;
                let v1 = frame.pop_slot()?;
                let v2 = frame.pop_slot()?;
                frame.push_slot(v1);
                frame.push_slot(v2);
                Ok(Flow::Next)
            }

            // === Branches ===
            Insn::If(cond, target) => {
                let v = self.frame_mut(thread)?.pop_int()?;
                Ok(branch(cond.holds(v.cmp(&0)), *target))
            }
            Insn::IfICmp(cond, target) => {
                let frame = self.frame_mut(thread)?;
                let b = frame.pop_int()?;
                let a = frame.pop_int()?;
                Ok(branch(cond.holds(a.cmp(&b)), *target))
            }
            Insn::IfACmp(cond, target) => {
                let frame = self.frame_mut(thread)?;
                let b = frame.pop_ref()?;
                let a = frame.pop_ref()?;
                let ord = if a == b {
                    Ordering::Equal
                } else {
                    Ordering::Less
                };
                Ok(branch(cond.holds(ord), *target))
            }
            Insn::IfNull(target) => {
                let r = self.frame_mut(thread)?.pop_ref()?;
                Ok(branch(r.is_none(), *target))
            }
            Insn::IfNonNull(target) => {
                let r = self.frame_mut(thread)?.pop_ref()?;
                Ok(branch(r.is_some(), *target))
            }
            Insn::Goto(target) => Ok(Flow::Jump(*target)),

            // === Fields ===
            Insn::GetField(f) => self.get_field(thread, f, first_step),
            Insn::PutField(f) => self.put_field(thread, f, first_step),
            Insn::GetStatic(f) => self.get_static(thread, f, first_step),
            Insn::PutStatic(f) => self.put_static(thread, f, first_step),

            // === Objects and arrays ===
            Insn::New(name) => {
                let class = self.class_id(name)?;
                if !self.ensure_initialized(thread, class)? {
                    return Ok(Flow::Hold);
                }
                let obj = self.allocate_object(class);
                self.frame_mut(thread)?.push(Value::Ref(obj));
                Ok(Flow::Next)
            }
            Insn::NewArray(elem) => {
                let len = self.frame_mut(thread)?.pop_int()?;
                if len < 0 {
                    return self.throw_new(thread, NEGATIVE_ARRAY_SIZE_EXCEPTION, Some(len.to_string()));
                }
                if len as usize > self.config.max_array_length {
                    let detail = format!(
                        "array length {len} exceeds the limit of {}",
                        self.config.max_array_length
                    );
                    return self.throw_new(thread, OUT_OF_MEMORY_ERROR, Some(detail));
                }
                let class = self.class_id(OBJECT)?;
                let obj = self
                    .kernel
                    .heap
                    .allocate(HeapObject::new_array(class, elem.clone(), len as usize));
                self.frame_mut(thread)?.push(Value::Ref(obj));
                Ok(Flow::Next)
            }
            Insn::ArrayLoad(kind) => self.array_load(thread, *kind, first_step),
            Insn::ArrayStore(kind) => self.array_store(thread, *kind, first_step),
            Insn::ArrayLength => {
                let Some(arr) = self.frame_mut(thread)?.pop_ref()? else {
                    return self.throw_npe(thread, "arraylength");
                };
                let (_, len) = self.array_info(arr)?;
                self.frame_mut(thread)?.push(Value::Int(len as i32));
                Ok(Flow::Next)
            }
            Insn::InstanceOf(name) => {
                let class = self.class_id(name)?;
                let r = self.frame_mut(thread)?.pop_ref()?;
                let is = match r {
                    Some(r) => self.program.is_subclass(self.object(r)?.class, class),
                    None => false,
                };
                self.frame_mut(thread)?.push(Value::bool(is));
                Ok(Flow::Next)
            }
            Insn::CheckCast(name) => {
                let class = self.class_id(name)?;
                if let Some(r) = self.frame(thread)?.peek_ref(0)? {
                    let actual = self.object(r)?.class;
                    if !self.program.is_subclass(actual, class) {
                        let detail = format!(
                            "{} cannot be cast to {name}",
                            self.program.class(actual).name
                        );
                        return self.throw_new(thread, CLASS_CAST_EXCEPTION, Some(detail));
                    }
                }
                Ok(Flow::Next)
            }

            // === Calls ===
            Insn::Invoke(kind, method) => self.invoke(thread, *kind, method, first_step),
            Insn::Return(kind) => self.return_from(thread, *kind),
            Insn::Throw => {
                let Some(exc) = self.frame_mut(thread)?.pop_ref()? else {
                    return self.throw_npe(thread, "athrow");
                };
                self.raise(thread, exc)?;
                Ok(Flow::Hold)
            }

            // === Monitors ===
            Insn::MonitorEnter => {
                let Some(obj) = self.frame(thread)?.peek_ref(0)? else {
                    return self.throw_npe(thread, "monitorenter");
                };
                if !self.acquire(thread, MonitorTarget::Object(obj), first_step)? {
                    return Ok(Flow::Hold);
                }
                self.frame_mut(thread)?.pop_slot()?;
                Ok(Flow::Next)
            }
            Insn::MonitorExit => {
                let Some(obj) = self.frame_mut(thread)?.pop_ref()? else {
                    return self.throw_npe(thread, "monitorexit");
                };
                match self.release(thread, MonitorTarget::Object(obj)) {
                    Some(did_unblock) => {
                        self.schedule(thread, SchedEvent::LockRelease { did_unblock });
                        Ok(Flow::Next)
                    }
                    None => self.throw_new(
                        thread,
                        ILLEGAL_MONITOR_STATE_EXCEPTION,
                        Some("current thread is not owner (monitorexit)".into()),
                    ),
                }
            }
        }
    }

    // === Helpers ===

    pub(crate) fn frame(&self, thread: ThreadId) -> VmResult<&StackFrame> {
        self.kernel
            .thread(thread)
            .top()
            .ok_or_else(|| VmError::malformed(format!("thread {thread} has no frames")))
    }

    pub(crate) fn frame_mut(&mut self, thread: ThreadId) -> VmResult<&mut StackFrame> {
        self.kernel
            .thread_mut(thread)
            .top_mut()
            .ok_or_else(|| VmError::malformed(format!("thread {thread} has no frames")))
    }

    fn class_id(&self, name: &str) -> VmResult<ClassId> {
        self.program
            .class_id(name)
            .ok_or_else(|| VmError::UnresolvedClass {
                name: name.to_string(),
                location: Default::default(),
            })
    }

    fn object(&self, r: ObjRef) -> VmResult<&HeapObject> {
        self.kernel
            .heap
            .get(r)
            .ok_or_else(|| VmError::malformed(format!("dangling reference {r}")))
    }

    fn allocate_object(&mut self, class: ClassId) -> ObjRef {
        let fields = self
            .program
            .class(class)
            .instance_layout
            .iter()
            .map(|f| Value::default_for(&f.ty))
            .collect();
        self.kernel.heap.allocate(HeapObject::new(class, fields))
    }

    fn array_info(&self, arr: ObjRef) -> VmResult<(&Type, usize)> {
        match &self.object(arr)?.data {
            ObjectData::Array { elem, values } => Ok((elem, values.len())),
            ObjectData::Fields(_) => Err(VmError::malformed(format!("{arr} is not an array"))),
        }
    }

    /// Report an access to shared data. Returns whether a choice point was
    /// registered in front of it.
    fn access_point(
        &mut self,
        thread: ThreadId,
        first_step: bool,
        shared: bool,
        is_write: bool,
        is_final: bool,
    ) -> bool {
        !first_step
            && self.schedule(
                thread,
                SchedEvent::FieldAccess {
                    shared,
                    is_write,
                    is_final,
                },
            )
    }

    // === Field access ===

    fn get_field(&mut self, thread: ThreadId, f: &FieldRef, first_step: bool) -> VmResult<Flow> {
        let program = Arc::clone(&self.program);
        let field = program
            .lookup_instance_field(f)
            .ok_or_else(|| unresolved_field(f))?;
        let Some(obj) = self.frame(thread)?.peek_ref(0)? else {
            return self.throw_npe(thread, &format!("getfield {f}"));
        };
        let shared = self.kernel.is_shared(obj);
        if self.access_point(thread, first_step, shared, false, field.is_final) {
            return Ok(Flow::Hold);
        }
        let value = self
            .object(obj)?
            .values()
            .get(field.slot)
            .copied()
            .ok_or_else(|| unresolved_field(f))?;
        let frame = self.frame_mut(thread)?;
        frame.pop_slot()?;
        frame.push(value);
        Ok(Flow::Next)
    }

    fn put_field(&mut self, thread: ThreadId, f: &FieldRef, first_step: bool) -> VmResult<Flow> {
        let program = Arc::clone(&self.program);
        let field = program
            .lookup_instance_field(f)
            .ok_or_else(|| unresolved_field(f))?;
        let Some(obj) = self.frame(thread)?.peek_ref(field.ty.slot_width())? else {
            return self.throw_npe(thread, &format!("putfield {f}"));
        };
        let shared = self.kernel.is_shared(obj);
        if self.access_point(thread, first_step, shared, true, field.is_final) {
            return Ok(Flow::Hold);
        }
        let frame = self.frame_mut(thread)?;
        let value = frame.pop()?.narrow_to(&field.ty);
        frame.pop_slot()?;
        let slot = self
            .kernel
            .heap
            .get_mut(obj)
            .and_then(|o| o.values_mut().get_mut(field.slot))
            .ok_or_else(|| unresolved_field(f))?;
        *slot = value;
        if shared {
            if let Some(r) = value.object() {
                self.kernel.expose(r);
            }
        }
        Ok(Flow::Next)
    }

    fn get_static(&mut self, thread: ThreadId, f: &FieldRef, first_step: bool) -> VmResult<Flow> {
        let program = Arc::clone(&self.program);
        let field = program
            .lookup_static_field(f)
            .ok_or_else(|| unresolved_field(f))?;
        if !self.ensure_initialized(thread, field.owner)? {
            return Ok(Flow::Hold);
        }
        let shared = self.kernel.live_threads() > 1;
        if self.access_point(thread, first_step, shared, false, field.is_final) {
            return Ok(Flow::Hold);
        }
        let value = self
            .kernel
            .static_area(field.owner)
            .values
            .get(field.slot)
            .copied()
            .ok_or_else(|| unresolved_field(f))?;
        self.frame_mut(thread)?.push(value);
        Ok(Flow::Next)
    }

    fn put_static(&mut self, thread: ThreadId, f: &FieldRef, first_step: bool) -> VmResult<Flow> {
        let program = Arc::clone(&self.program);
        let field = program
            .lookup_static_field(f)
            .ok_or_else(|| unresolved_field(f))?;
        if !self.ensure_initialized(thread, field.owner)? {
            return Ok(Flow::Hold);
        }
        let shared = self.kernel.live_threads() > 1;
        if self.access_point(thread, first_step, shared, true, field.is_final) {
            return Ok(Flow::Hold);
        }
        let value = self.frame_mut(thread)?.pop()?.narrow_to(&field.ty);
        let slot = self
            .kernel
            .static_area_mut(field.owner)
            .values
            .get_mut(field.slot)
            .ok_or_else(|| unresolved_field(f))?;
        *slot = value;
        if let Some(r) = value.object() {
            self.kernel.expose(r);
        }
        Ok(Flow::Next)
    }

    // === Array elements ===

    /// Array and index below `depth` slots, with null and bounds checks.
    /// `Err(flow)` carries the exception that was raised instead.
    fn array_element(
        &mut self,
        thread: ThreadId,
        depth: usize,
        op: &str,
    ) -> VmResult<Result<(ObjRef, usize), Flow>> {
        let frame = self.frame(thread)?;
        let index = frame.peek_slot(depth)?;
        let index = index.as_int().ok_or_else(|| {
            VmError::malformed(format!("type mismatch: expected int, found {}", index.type_name()))
        })?;
        let Some(arr) = frame.peek_ref(depth + 1)? else {
            return self.throw_npe(thread, op).map(Err);
        };
        let (_, len) = self.array_info(arr)?;
        if index < 0 || index as usize >= len {
            let detail = format!("Index {index} out of bounds for length {len}");
            return self
                .throw_new(thread, ARRAY_INDEX_EXCEPTION, Some(detail))
                .map(Err);
        }
        Ok(Ok((arr, index as usize)))
    }

    fn array_load(&mut self, thread: ThreadId, kind: Kind, first_step: bool) -> VmResult<Flow> {
        let (arr, index) = match self.array_element(thread, 0, "array load")? {
            Ok(found) => found,
            Err(flow) => return Ok(flow),
        };
        let shared = self.kernel.is_shared(arr);
        if self.access_point(thread, first_step, shared, false, false) {
            return Ok(Flow::Hold);
        }
        let value = self.object(arr)?.values()[index];
        check_kind(kind, &value)?;
        let frame = self.frame_mut(thread)?;
        frame.pop_slots(2)?;
        frame.push(value);
        Ok(Flow::Next)
    }

    fn array_store(&mut self, thread: ThreadId, kind: Kind, first_step: bool) -> VmResult<Flow> {
        let (arr, index) = match self.array_element(thread, kind.width(), "array store")? {
            Ok(found) => found,
            Err(flow) => return Ok(flow),
        };
        let shared = self.kernel.is_shared(arr);
        if self.access_point(thread, first_step, shared, true, false) {
            return Ok(Flow::Hold);
        }
        let elem = self.array_info(arr)?.0.clone();
        let frame = self.frame_mut(thread)?;
        let value = frame.pop()?;
        frame.pop_slots(2)?;
        if elem.kind() != value.kind() {
            return Err(VmError::malformed(format!(
                "storing {} into {} array",
                value.type_name(),
                elem
            )));
        }
        let value = value.narrow_to(&elem);
        if let Some(o) = self.kernel.heap.get_mut(arr) {
            o.values_mut()[index] = value;
        }
        if shared {
            if let Some(r) = value.object() {
                self.kernel.expose(r);
            }
        }
        Ok(Flow::Next)
    }

    // === Calls ===

    fn invoke(
        &mut self,
        thread: ThreadId,
        kind: InvokeKind,
        mref: &MethodRef,
        first_step: bool,
    ) -> VmResult<Flow> {
        let program = Arc::clone(&self.program);
        let unresolved = || VmError::UnresolvedMethod {
            name: mref.to_string(),
            location: Default::default(),
        };
        let resolved = program.resolve_method(mref).ok_or_else(unresolved)?;
        let arg_slots = mref.sig.arg_slots(kind.is_static());
        let receiver = if kind.is_static() {
            None
        } else {
            match self.frame(thread)?.peek_ref(arg_slots - 1)? {
                Some(r) => Some(r),
                None => return self.throw_npe(thread, &format!("invoke {mref}")),
            }
        };
        let target = match (kind, receiver) {
            (InvokeKind::Virtual | InvokeKind::Interface, Some(r)) => program
                .find_method(self.object(r)?.class, &mref.name, &mref.sig)
                .ok_or_else(unresolved)?,
            _ => resolved,
        };
        let method = program.method(target);
        if method.flags.is_abstract {
            return Err(VmError::unsupported(format!("call to abstract method {method}")));
        }
        if kind.is_static() && !self.ensure_initialized(thread, method.owner)? {
            return Ok(Flow::Hold);
        }
        let injector = Arc::clone(&self.injector);
        if let Some(injection) = injector.on_call(target) {
            return self.throw_new(thread, &injection.exception, injection.detail.clone());
        }
        let lock = method.is_synchronized().then(|| match receiver {
            Some(r) => MonitorTarget::Object(r),
            None => MonitorTarget::Class(method.owner),
        });

        let perturbator = Arc::clone(&self.perturbator);
        if let Some(p) = perturbator.get(target) {
            if !self.perturb_args(thread, p, arg_slots, first_step)? {
                // the lock choice cascades below the new perturbation choice
                if let Some(lock) = lock.filter(|_| !first_step) {
                    let free = self.kernel.monitor(lock).is_some_and(|m| m.is_free());
                    if free {
                        let shared = self.monitor_shared(lock);
                        self.schedule(thread, SchedEvent::LockAcquire { shared });
                    }
                }
                return Ok(Flow::Hold);
            }
        }

        if method.is_native() {
            if lock.is_some() {
                return Err(VmError::unsupported(format!(
                    "synchronized native method {method}"
                )));
            }
            return self.call_native(thread, target, arg_slots, first_step);
        }
        if let Some(lock) = lock {
            if !self.acquire(thread, lock, first_step)? {
                return Ok(Flow::Hold);
            }
        }
        let args = self.frame_mut(thread)?.pop_slots(arg_slots)?;
        let mut callee = StackFrame::new(target, method.max_locals, FrameKind::Normal);
        for (i, v) in args.into_iter().enumerate() {
            callee.set_local(i, v);
        }
        callee.lock = lock;
        self.kernel.thread_mut(thread).frames.push(callee);
        Ok(Flow::Hold)
    }

    /// Apply the chosen valuation to the arguments of a perturbed call.
    /// Returns `false` after registering a new perturbation generator.
    fn perturb_args(
        &mut self,
        thread: ThreadId,
        p: &Perturbation,
        arg_slots: usize,
        first_step: bool,
    ) -> VmResult<bool> {
        let domain = ChoiceDomain::Valuations(Arc::clone(&p.valuations));
        match self.data_choice(thread, first_step, &p.id, domain) {
            Some(Choice::Valuation(values)) => {
                let frame = self.frame_mut(thread)?;
                let start = frame
                    .stack
                    .len()
                    .checked_sub(arg_slots)
                    .ok_or_else(|| VmError::malformed("operand stack underflow"))?;
                p.apply(&mut frame.stack[start..], &values);
                Ok(true)
            }
            Some(other) => Err(VmError::malformed(format!(
                "choice {other} for perturbation {}",
                p.id
            ))),
            None => Ok(false),
        }
    }

    fn call_native(
        &mut self,
        thread: ThreadId,
        native: MethodId,
        arg_slots: usize,
        first_step: bool,
    ) -> VmResult<Flow> {
        let program = Arc::clone(&self.program);
        let method = program.method(native);
        let peer = self
            .natives
            .get(&native)
            .cloned()
            .ok_or_else(|| VmError::MissingNative {
                name: method.full_name(),
                location: Default::default(),
            })?;
        // one value per parameter: drop the upper halves of wide values
        let args: Vec<Value> = self
            .frame(thread)?
            .top_slots(arg_slots)?
            .iter()
            .copied()
            .filter(|v| *v != Value::Top)
            .collect();

        let outcome = {
            let mut env = NativeEnv {
                vm: self,
                thread,
                first_step,
                method: native,
            };
            peer.call(&mut env, &args)?
        };

        match outcome {
            NativeOutcome::Return(value) => {
                let expected = method.sig.ret.kind();
                let matches = match value {
                    Some(v) => expected.is_some() && v.kind() == expected,
                    None => expected.is_none(),
                };
                if !matches {
                    return Err(VmError::malformed(format!(
                        "native {} returned {} for {}",
                        method.full_name(),
                        value.map_or("nothing", |v| v.type_name()),
                        method.sig.ret
                    )));
                }
                let frame = self.frame_mut(thread)?;
                frame.pop_slots(arg_slots)?;
                if let Some(v) = value {
                    frame.push(v);
                }
                Ok(Flow::Next)
            }
            NativeOutcome::Throw { class, detail } => self.throw_new(thread, &class, detail),
            NativeOutcome::Break => Ok(Flow::Hold),
            NativeOutcome::RoundTrip { method: callee, args } => {
                let callee_desc = program.method(callee);
                if callee_desc.is_native() || callee_desc.flags.is_abstract {
                    return Err(VmError::unsupported(format!(
                        "round trip from {} into {callee_desc}",
                        method.full_name()
                    )));
                }
                let frame = StackFrame::new(
                    callee,
                    callee_desc.max_locals,
                    FrameKind::RoundTrip(native),
                )
                .with_args(&args);
                debug!(thread = %thread, native = %method, callee = %callee_desc, "round trip");
                self.kernel.thread_mut(thread).frames.push(frame);
                Ok(Flow::Hold)
            }
        }
    }

    fn return_from(&mut self, thread: ThreadId, kind: Option<Kind>) -> VmResult<Flow> {
        let program = Arc::clone(&self.program);
        let mut frame = self
            .kernel
            .thread_mut(thread)
            .frames
            .pop()
            .ok_or_else(|| VmError::malformed(format!("thread {thread} has no frames")))?;
        let value = match kind {
            Some(kind) => {
                let v = frame.pop()?;
                check_kind(kind, &v)?;
                Some(v)
            }
            None => None,
        };
        if let Some(lock) = frame.lock {
            self.unlock_frame(thread, lock)?;
        }
        match frame.kind {
            FrameKind::Normal => match self.kernel.thread_mut(thread).top_mut() {
                Some(caller) => {
                    if let Some(v) = value {
                        caller.push(v);
                    }
                    caller.pc += 1;
                }
                None => self.terminate(thread),
            },
            FrameKind::ClassInit(class) => self.finish_class_init(class),
            FrameKind::RoundTrip(native) => {
                let native = program.method(native);
                let caller = self.frame_mut(thread)?;
                caller.pop_slots(native.sig.arg_slots(native.is_static()))?;
                if let Some(v) = value {
                    caller.push(v);
                }
                caller.pc += 1;
            }
        }
        Ok(Flow::Hold)
    }

    // === Exceptions ===

    fn throw_npe(&mut self, thread: ThreadId, op: &str) -> VmResult<Flow> {
        self.throw_new(thread, NULL_POINTER_EXCEPTION, Some(format!("{op} on null")))
    }

    /// Allocate an exception of class `class` and raise it in `thread`.
    pub(crate) fn throw_new(
        &mut self,
        thread: ThreadId,
        class: &str,
        detail: Option<String>,
    ) -> VmResult<Flow> {
        let class_id = self.class_id(class)?;
        let exc = self.allocate_object(class_id);
        debug!(thread = %thread, exception = class, detail = ?detail, "exception raised");
        if let Some(o) = self.kernel.heap.get_mut(exc) {
            o.detail = detail.map(Arc::from);
        }
        self.raise(thread, exc)?;
        Ok(Flow::Hold)
    }

    /// Unwind `thread` to the nearest handler for `exc`. Frames popped on
    /// the way release their monitors; an initializer frame leaves its class
    /// initialized. Without a handler the thread terminates.
    pub(crate) fn raise(&mut self, thread: ThreadId, exc: ObjRef) -> VmResult<()> {
        let program = Arc::clone(&self.program);
        let class = self.object(exc)?.class;
        loop {
            let Some((method, pc)) = self.kernel.thread(thread).top().map(|f| (f.method, f.pc))
            else {
                break;
            };
            let handler = program.method(method).handlers.iter().find(|h| {
                h.covers(pc)
                    && h.class.as_deref().map_or(true, |name| {
                        program
                            .class_id(name)
                            .is_some_and(|c| program.is_subclass(class, c))
                    })
            });
            if let Some(h) = handler {
                let frame = self.frame_mut(thread)?;
                frame.pc = h.target;
                frame.stack.clear();
                frame.push(Value::Ref(exc));
                return Ok(());
            }
            let frame = self
                .kernel
                .thread_mut(thread)
                .frames
                .pop()
                .ok_or_else(|| VmError::malformed("unwinding an empty stack"))?;
            if let Some(lock) = frame.lock {
                self.unlock_frame(thread, lock)?;
            }
            if let FrameKind::ClassInit(c) = frame.kind {
                self.finish_class_init(c);
            }
        }

        let detail = self.object(exc)?.detail.clone();
        let name = program.class(class).name.clone();
        debug!(thread = %thread, exception = %name, "uncaught exception");
        self.kernel.uncaught = Some(UncaughtException {
            thread,
            class: name,
            detail,
        });
        self.terminate(thread);
        Ok(())
    }
}

fn branch(taken: bool, target: usize) -> Flow {
    if taken {
        Flow::Jump(target)
    } else {
        Flow::Next
    }
}

fn check_kind(kind: Kind, v: &Value) -> VmResult<()> {
    if v.kind() == Some(kind) {
        Ok(())
    } else {
        Err(VmError::malformed(format!(
            "type mismatch: expected {kind:?}, found {}",
            v.type_name()
        )))
    }
}

fn unresolved_field(f: &FieldRef) -> VmError {
    VmError::UnresolvedField {
        name: f.to_string(),
        location: Default::default(),
    }
}

impl Vm {
    fn arith(&mut self, thread: ThreadId, op: ArithOp, kind: Kind) -> VmResult<Flow> {
        let frame = self.frame_mut(thread)?;
        let result = match kind {
            Kind::Int => {
                let b = frame.pop_int()?;
                let a = frame.pop_int()?;
                int_op(op, a, b).map(Value::Int)
            }
            Kind::Long => {
                let b = if op.is_shift() {
                    i64::from(frame.pop_int()?)
                } else {
                    frame.pop_long()?
                };
                let a = frame.pop_long()?;
                long_op(op, a, b).map(Value::Long)
            }
            Kind::Float => {
                let b = frame.pop_float()?;
                let a = frame.pop_float()?;
                Some(Value::float(float_op(op, a, b)?))
            }
            Kind::Double => {
                let b = frame.pop_double()?;
                let a = frame.pop_double()?;
                Some(Value::double(double_op(op, a, b)?))
            }
            Kind::Ref => return Err(VmError::malformed(format!("{} on references", op.name()))),
        };
        match result {
            Some(v) => {
                frame.push(v);
                Ok(Flow::Next)
            }
            None => self.throw_new(thread, ARITHMETIC_EXCEPTION, Some("/ by zero".into())),
        }
    }
}

/// `None` on division by zero.
fn int_op(op: ArithOp, a: i32, b: i32) -> Option<i32> {
    Some(match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::Div if b == 0 => return None,
        ArithOp::Div => a.wrapping_div(b),
        ArithOp::Rem if b == 0 => return None,
        ArithOp::Rem => a.wrapping_rem(b),
        ArithOp::And => a & b,
        ArithOp::Or => a | b,
        ArithOp::Xor => a ^ b,
        ArithOp::Shl => a.wrapping_shl(b as u32),
        ArithOp::Shr => a.wrapping_shr(b as u32),
        ArithOp::Ushr => (a as u32).wrapping_shr(b as u32) as i32,
    })
}

fn long_op(op: ArithOp, a: i64, b: i64) -> Option<i64> {
    Some(match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::Div if b == 0 => return None,
        ArithOp::Div => a.wrapping_div(b),
        ArithOp::Rem if b == 0 => return None,
        ArithOp::Rem => a.wrapping_rem(b),
        ArithOp::And => a & b,
        ArithOp::Or => a | b,
        ArithOp::Xor => a ^ b,
        ArithOp::Shl => a.wrapping_shl(b as u32),
        ArithOp::Shr => a.wrapping_shr(b as u32),
        ArithOp::Ushr => (a as u64).wrapping_shr(b as u32) as i64,
    })
}

fn float_op(op: ArithOp, a: f32, b: f32) -> VmResult<f32> {
    Ok(match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Rem => a % b,
        _ => return Err(VmError::malformed(format!("{} on floats", op.name()))),
    })
}

fn double_op(op: ArithOp, a: f64, b: f64) -> VmResult<f64> {
    Ok(match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Rem => a % b,
        _ => return Err(VmError::malformed(format!("{} on doubles", op.name()))),
    })
}

fn convert(from: Kind, to: Kind, v: Value) -> VmResult<Value> {
    let mismatch = || {
        VmError::malformed(format!(
            "cannot convert {} as {from:?} to {to:?}",
            v.type_name()
        ))
    };
    let out = match (from, v) {
        (Kind::Int, Value::Int(i)) => match to {
            Kind::Long => Value::Long(i64::from(i)),
            Kind::Float => Value::float(i as f32),
            Kind::Double => Value::double(f64::from(i)),
            _ => return Err(mismatch()),
        },
        (Kind::Long, Value::Long(l)) => match to {
            Kind::Int => Value::Int(l as i32),
            Kind::Float => Value::float(l as f32),
            Kind::Double => Value::double(l as f64),
            _ => return Err(mismatch()),
        },
        (Kind::Float, Value::Float(bits)) => {
            let x = f32::from_bits(bits);
            match to {
                Kind::Int => Value::Int(x as i32),
                Kind::Long => Value::Long(x as i64),
                Kind::Double => Value::double(f64::from(x)),
                _ => return Err(mismatch()),
            }
        }
        (Kind::Double, Value::Double(bits)) => {
            let x = f64::from_bits(bits);
            match to {
                Kind::Int => Value::Int(x as i32),
                Kind::Long => Value::Long(x as i64),
                Kind::Float => Value::float(x as f32),
                _ => return Err(mismatch()),
            }
        }
        _ => return Err(mismatch()),
    };
    Ok(out)
}
