//! The per-run virtual machine.
//!
//! A [`Vm`] owns the backtrackable [`KernelState`] and the two generator
//! chains around it: `current`, whose choices the running transition
//! follows, and `next`, collecting the generators the transition registers.
//! Everything else (program, configuration, native peers, perturbations) is
//! shared per run and never changes.

use crate::choice::{CgChain, CgLocation, Choice, ChoiceDomain, ChoiceGenerator};
use crate::config::VmConfig;
use crate::error::{Location, VmError, VmResult};
use crate::frame::{FrameKind, StackFrame};
use crate::idle::IdleTracker;
use crate::inject::Injector;
use crate::kernel::{KernelState, UncaughtException};
use crate::native::{NativePeer, NativeRegistry};
use crate::perturb::Perturbator;
use crate::scheduler::{SchedEvent, Scheduler};
use crate::thread::{ThreadContext, ThreadId};
use crate::value::{ObjRef, Value};
use ahash::AHashMap;
use rove_ir::{check_program, ClassId, Insn, MethodId, Program};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Hooks called while a transition executes.
pub trait ExecObserver {
    fn instruction_executed(&mut self, _vm: &Vm, _thread: ThreadId, _insn: &Insn) {}

    fn choice_generator_registered(&mut self, _vm: &Vm, _cg: &ChoiceGenerator) {}
}

impl ExecObserver for () {}

/// Storage a field or array instruction touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessSite {
    Field { object: ObjRef, slot: usize },
    Static { class: ClassId, slot: usize },
    Element { array: ObjRef, index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldAccess {
    pub thread: ThreadId,
    pub site: AccessSite,
    pub is_write: bool,
    pub shared: bool,
}

#[derive(Clone)]
pub struct Vm {
    pub(crate) program: Arc<Program>,
    pub(crate) config: Arc<VmConfig>,
    pub(crate) scheduler: Scheduler,
    pub(crate) natives: Arc<AHashMap<MethodId, Arc<dyn NativePeer>>>,
    pub(crate) perturbator: Arc<Perturbator>,
    pub(crate) injector: Arc<Injector>,
    pub(crate) kernel: KernelState,
    pub(crate) current: CgChain,
    pub(crate) next: CgChain,
    pub(crate) output: Vec<String>,
    pub(crate) instructions: u64,
    pub(crate) idle: IdleTracker,
}

impl Vm {
    /// A VM with the built-in native peers.
    pub fn new(program: Arc<Program>, config: VmConfig) -> VmResult<Self> {
        Self::with_natives(program, config, NativeRegistry::with_builtins())
    }

    pub fn with_natives(
        program: Arc<Program>,
        config: VmConfig,
        registry: NativeRegistry,
    ) -> VmResult<Self> {
        check_program(&program)?;
        let mut natives: AHashMap<MethodId, Arc<dyn NativePeer>> = AHashMap::new();
        for class in program.classes() {
            for method in class.methods.iter().filter(|m| m.is_native()) {
                if let Some(peer) = registry.get(&method.full_name()) {
                    natives.insert(method.id, Arc::clone(peer));
                }
            }
        }
        let perturbator = Perturbator::new(&program, &config.perturb, config.perturb_seed)?;
        let injector = Injector::new(&program, &config.inject)?;
        debug!(
            natives = natives.len(),
            perturbed = perturbator.len(),
            injected = injector.len(),
            policy = config.policy.name(),
            "vm created"
        );
        Ok(Self {
            kernel: KernelState::new(&program),
            scheduler: config.scheduler(),
            program,
            config: Arc::new(config),
            natives: Arc::new(natives),
            perturbator: Arc::new(perturbator),
            injector: Arc::new(injector),
            current: CgChain::new(),
            next: CgChain::new(),
            output: Vec::new(),
            instructions: 0,
            idle: IdleTracker::default(),
        })
    }

    /// Create the main thread at the entry point and register the root
    /// scheduling point.
    pub fn initialize(&mut self, obs: &mut dyn ExecObserver) -> VmResult<()> {
        let entry = self.program.entry().ok_or(VmError::NoEntryPoint)?;
        let method = self.program.method(entry);
        let owner = method.owner;
        let frame = StackFrame::new(entry, method.max_locals, FrameKind::Normal);
        self.kernel
            .add_thread(ThreadContext::new(ThreadId::MAIN, None, frame));
        self.kernel.exec_thread = Some(ThreadId::MAIN);
        self.ensure_initialized(ThreadId::MAIN, owner)?;
        self.schedule(ThreadId::MAIN, SchedEvent::Root);
        if let Some(root) = self.next.leaf() {
            obs.choice_generator_registered(self, root);
        }
        debug!(entry = %self.program.method(entry), "vm initialized");
        Ok(())
    }

    /// Run one transition: execute the thread picked by the current chain
    /// until a choice point is registered, the thread stops, an exception
    /// escapes or the transition grows too long.
    pub fn execute_transition(&mut self, obs: &mut dyn ExecObserver) -> VmResult<()> {
        self.next = CgChain::new();
        self.idle = IdleTracker::default();
        let thread = self
            .current
            .thread_choice()
            .or(self.kernel.exec_thread)
            .ok_or_else(|| VmError::malformed("no thread to run"))?;
        self.kernel.exec_thread = Some(thread);

        let mut steps = 0usize;
        while self.kernel.thread(thread).is_runnable() {
            let registered = self.next.len();
            self.step(thread, steps == 0, obs)?;
            steps += 1;
            self.instructions += 1;
            for i in registered..self.next.len() {
                if let Some(cg) = self.next.get(i) {
                    obs.choice_generator_registered(self, cg);
                }
            }
            if !self.next.is_empty()
                || self.kernel.uncaught.is_some()
                || self.kernel.ignored
            {
                break;
            }
            if steps >= self.config.max_transition_length {
                debug!(thread = %thread, steps, "transition length limit");
                if self.schedule(thread, SchedEvent::TransitionLimit) {
                    if let Some(cg) = self.next.leaf() {
                        obs.choice_generator_registered(self, cg);
                    }
                }
                break;
            }
        }

        if self.config.gc {
            let freed = self.kernel.collect_garbage();
            if freed > 0 {
                trace!(freed, "collected");
            }
        }
        trace!(thread = %thread, steps, cgs = self.next.len(), "transition");
        Ok(())
    }

    /// Execute the instruction at the top frame of `thread`.
    fn step(
        &mut self,
        thread: ThreadId,
        first_step: bool,
        obs: &mut dyn ExecObserver,
    ) -> VmResult<()> {
        let program = Arc::clone(&self.program);
        let (method_id, pc) = {
            let frame = self
                .kernel
                .thread(thread)
                .top()
                .ok_or_else(|| VmError::malformed(format!("thread {thread} has no frames")))?;
            (frame.method, frame.pc)
        };
        let method = program.method(method_id);
        let location = || Location::new(method.to_string(), pc);
        let insn = method
            .code
            .get(pc)
            .ok_or_else(|| VmError::malformed("pc past the end of the code").at(&location()))?;
        trace!(thread = %thread, method = %method, pc, insn = %insn, "exec");
        let injector = Arc::clone(&self.injector);
        if let Some(injection) = injector.at(method_id, pc) {
            self.throw_new(thread, &injection.exception, injection.detail.clone())
                .map_err(|e| e.at(&location()))?;
            return Ok(());
        }
        self.execute(thread, insn, first_step)
            .map_err(|e| e.at(&location()))?;
        obs.instruction_executed(self, thread, insn);
        Ok(())
    }

    // === Choice points ===

    pub(crate) fn register(&mut self, cg: ChoiceGenerator) {
        debug!(cg = %cg, "choice point");
        self.next.push(cg);
    }

    /// Where `thread` currently is, for generator locations.
    fn cg_location(&self, thread: ThreadId) -> Option<CgLocation> {
        self.kernel.thread(thread).top().map(|f| CgLocation {
            method: f.method,
            pc: f.pc,
        })
    }

    /// Report a scheduling event of `thread`. Returns whether a thread
    /// generator was registered.
    pub(crate) fn schedule(&mut self, thread: ThreadId, event: SchedEvent) -> bool {
        match self.scheduler.choice_for(&event, &self.kernel, thread) {
            Some(cg) => {
                let location = self.cg_location(thread);
                self.register(cg.with_location(location));
                true
            }
            None => false,
        }
    }

    /// The choice made for data generator `id` when re-executing the
    /// instruction that registered it; otherwise register a new generator
    /// and return `None`.
    pub(crate) fn data_choice(
        &mut self,
        thread: ThreadId,
        first_step: bool,
        id: &str,
        domain: ChoiceDomain,
    ) -> Option<Choice> {
        if first_step {
            if let Some(choice) = self.current.choice(id, thread) {
                return Some(choice);
            }
        }
        let location = self.cg_location(thread);
        self.register(ChoiceGenerator::new(id, domain, thread).with_location(location));
        None
    }

    pub(crate) fn print(&mut self, text: String) {
        debug!(output = %text, "program output");
        self.output.push(text);
    }

    // === Chains and state parts ===

    /// Generators registered by the last transition, leaving `next` empty.
    pub fn take_next_chain(&mut self) -> CgChain {
        std::mem::take(&mut self.next)
    }

    pub fn set_current_chain(&mut self, chain: CgChain) {
        self.current = chain;
    }

    /// Replace the whole backtrackable state.
    pub fn restore_parts(&mut self, kernel: KernelState, current: CgChain, next: CgChain) {
        self.kernel = kernel;
        self.current = current;
        self.next = next;
    }

    // === Accessors ===

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn program_arc(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn kernel(&self) -> &KernelState {
        &self.kernel
    }

    pub(crate) fn kernel_mut(&mut self) -> &mut KernelState {
        &mut self.kernel
    }

    pub fn current_chain(&self) -> &CgChain {
        &self.current
    }

    pub fn next_chain(&self) -> &CgChain {
        &self.next
    }

    /// Everything printed by the program so far, across all paths.
    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    /// The field or array element the next instruction of `thread` would
    /// touch. `None` when the instruction is not an access or its operands
    /// would make it throw.
    pub fn pending_access(&self, thread: ThreadId) -> Option<FieldAccess> {
        let context = self.kernel.threads.get(thread.index())?;
        if !context.is_alive() {
            return None;
        }
        let frame = context.top()?;
        let insn = self.program.method(frame.method).code.get(frame.pc)?;
        let (site, is_write, shared) = match insn {
            Insn::GetField(f) | Insn::PutField(f) => {
                let field = self.program.lookup_instance_field(f)?;
                let is_write = matches!(insn, Insn::PutField(_));
                let depth = if is_write { field.ty.slot_width() } else { 0 };
                let object = frame.peek_ref(depth).ok()??;
                let site = AccessSite::Field {
                    object,
                    slot: field.slot,
                };
                (site, is_write, self.kernel.is_shared(object))
            }
            Insn::GetStatic(f) | Insn::PutStatic(f) => {
                let field = self.program.lookup_static_field(f)?;
                let site = AccessSite::Static {
                    class: field.owner,
                    slot: field.slot,
                };
                let is_write = matches!(insn, Insn::PutStatic(_));
                (site, is_write, self.kernel.live_threads() > 1)
            }
            Insn::ArrayLoad(_) | Insn::ArrayStore(_) => {
                let (depth, is_write) = match insn {
                    Insn::ArrayStore(kind) => (kind.width(), true),
                    _ => (0, false),
                };
                let index = frame.peek_slot(depth).ok()?.as_int()?;
                let array = frame.peek_ref(depth + 1).ok()??;
                let index = usize::try_from(index).ok()?;
                let site = AccessSite::Element { array, index };
                (site, is_write, self.kernel.is_shared(array))
            }
            _ => return None,
        };
        Some(FieldAccess {
            thread,
            site,
            is_write,
            shared,
        })
    }

    /// Name of the storage behind `site`: `Class.field`, `Class@ref.field`
    /// or `@ref[index]`.
    pub fn describe_site(&self, site: &AccessSite) -> String {
        match *site {
            AccessSite::Static { class, slot } => {
                let class = self.program.class(class);
                let name = class
                    .static_fields
                    .iter()
                    .find(|f| f.slot == slot)
                    .map_or("?", |f| &*f.name);
                format!("{}.{name}", class.name)
            }
            AccessSite::Field { object, slot } => match self.kernel.heap.get(object) {
                Some(obj) => {
                    let class = self.program.class(obj.class);
                    let name = class
                        .instance_layout
                        .iter()
                        .find(|f| f.slot == slot)
                        .map_or("?", |f| &*f.name);
                    format!("{}{object}.{name}", class.name)
                }
                None => format!("{object}.#{slot}"),
            },
            AccessSite::Element { array, index } => format!("{array}[{index}]"),
        }
    }

    /// Instructions executed by this VM, including re-executions.
    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    pub fn is_end_state(&self) -> bool {
        self.kernel.is_end_state()
    }

    pub fn is_deadlocked(&self) -> bool {
        self.kernel.is_deadlocked()
    }

    pub fn uncaught(&self) -> Option<&UncaughtException> {
        self.kernel.uncaught.as_ref()
    }

    /// Current value of static field `field` of class `class`.
    pub fn static_value(&self, class: &str, field: &str) -> Option<Value> {
        let class = self.program.class_id(class)?;
        let desc = self.program.static_field(class, field)?;
        self.kernel
            .static_area(desc.owner)
            .values
            .get(desc.slot)
            .copied()
    }

    /// `Class.method@pc` of the top frame of `thread`.
    pub fn location(&self, thread: ThreadId) -> Option<Location> {
        let frame = self.kernel.threads.get(thread.index())?.top()?;
        Some(Location::new(
            self.program.method(frame.method).to_string(),
            frame.pc,
        ))
    }
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("config", &self.config)
            .field("threads", &self.kernel.threads.len())
            .field("heap", &self.kernel.heap.live_count())
            .field("current", &self.current.len())
            .field("next", &self.next.len())
            .field("instructions", &self.instructions)
            .finish()
    }
}
