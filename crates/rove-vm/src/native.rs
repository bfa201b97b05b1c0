//! Bridge between bytecode and methods implemented in Rust.
//!
//! A native call is one atomic step of the calling thread. A peer that needs
//! to run bytecode on the same thread returns [`NativeOutcome::RoundTrip`]:
//! the callee runs in a synthetic frame and its return value becomes the
//! native method's result.

use crate::choice::{Choice, ChoiceDomain};
use crate::error::VmResult;
use crate::kernel::KernelState;
use crate::scheduler::SchedEvent;
use crate::thread::ThreadId;
use crate::value::Value;
use crate::vm::Vm;
use rove_ir::{MethodId, Program};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum NativeOutcome {
    /// Pop the arguments, push the result and continue with the next instruction.
    Return(Option<Value>),
    /// Raise an exception of the named class in the calling thread.
    Throw { class: String, detail: Option<String> },
    /// Leave the call in place; it executes again when the thread next runs.
    Break,
    /// Run `method` with `args` on the calling thread first.
    RoundTrip { method: MethodId, args: Vec<Value> },
}

impl NativeOutcome {
    pub fn void() -> Self {
        NativeOutcome::Return(None)
    }

    pub fn value(v: Value) -> Self {
        NativeOutcome::Return(Some(v))
    }

    pub fn throw(class: &str, detail: impl Into<String>) -> Self {
        NativeOutcome::Throw {
            class: class.to_string(),
            detail: Some(detail.into()),
        }
    }
}

/// What a native method can see and do while it runs.
pub struct NativeEnv<'a> {
    pub(crate) vm: &'a mut Vm,
    pub thread: ThreadId,
    /// The call is being executed again after it registered a choice point.
    pub first_step: bool,
    pub method: MethodId,
}

impl NativeEnv<'_> {
    pub fn program(&self) -> &Program {
        self.vm.program()
    }

    pub fn kernel(&self) -> &KernelState {
        self.vm.kernel()
    }

    pub fn kernel_mut(&mut self) -> &mut KernelState {
        self.vm.kernel_mut()
    }

    /// Pick a value from `domain`. Returns `None` after registering a new
    /// generator; the peer should then answer [`NativeOutcome::Break`].
    pub fn data_choice(&mut self, id: &str, domain: ChoiceDomain) -> Option<Choice> {
        self.vm.data_choice(self.thread, self.first_step, id, domain)
    }

    /// Report a scheduling event. Returns whether a choice point was created.
    pub fn schedule(&mut self, event: SchedEvent) -> bool {
        self.vm.schedule(self.thread, event)
    }

    pub fn print(&mut self, text: impl Into<String>) {
        self.vm.print(text.into());
    }
}

/// A native method implementation.
///
/// `args` holds one value per declared parameter, the receiver first for
/// instance methods. Wide values are not split.
pub trait NativePeer: Send + Sync {
    fn call(&self, env: &mut NativeEnv<'_>, args: &[Value]) -> VmResult<NativeOutcome>;
}

impl<F> NativePeer for F
where
    F: Fn(&mut NativeEnv<'_>, &[Value]) -> VmResult<NativeOutcome> + Send + Sync,
{
    fn call(&self, env: &mut NativeEnv<'_>, args: &[Value]) -> VmResult<NativeOutcome> {
        self(env, args)
    }
}

/// Peers by `Class.name(desc)`.
#[derive(Clone, Default)]
pub struct NativeRegistry {
    peers: HashMap<String, Arc<dyn NativePeer>>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the peers for the built-in classes.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::peers::register_builtins(&mut registry);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, peer: impl NativePeer + 'static) {
        self.peers.insert(name.into(), Arc::new(peer));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn NativePeer>> {
        self.peers.get(name)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.peers.keys().map(String::as_str)
    }
}

impl fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("NativeRegistry").field("peers", &names).finish()
    }
}
