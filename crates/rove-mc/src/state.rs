//! Snapshots of the VM and their fingerprints.
//!
//! A [`Snapshot`] is the exact backtrackable state of a [`Vm`]: the kernel
//! plus the generator chain being followed and the chain registered by the
//! last transition. Restoring a snapshot replaces all of it.
//!
//! State matching does not look at the exact image. A [`StateSerializer`]
//! writes the parts of a snapshot that decide future behavior into a byte
//! buffer, and the [`Fingerprint`] of that buffer is the match key.

use ahash::AHashMap;
use rove_vm::{
    Blocker, CgChain, FrameKind, HeapObject, InitState, KernelState, Monitor, MonitorTarget,
    ObjRef, StackFrame, ThreadContext, ThreadStatus, Value, Vm,
};
use std::fmt;
use std::hash::{BuildHasher, Hasher};
use std::str::FromStr;

const FINGERPRINT_SEEDS: ahash::RandomState = ahash::RandomState::with_seeds(
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
);

/// A fingerprint is a 64-bit hash identifying a state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u64);

impl Fingerprint {
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_u64(v: u64) -> Self {
        Fingerprint(v)
    }

    /// Fingerprint of an arbitrary byte image. Seeds are fixed so the same
    /// image has the same fingerprint in every process.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = FINGERPRINT_SEEDS.build_hasher();
        hasher.write(bytes);
        hasher.write_usize(bytes.len());
        Fingerprint(hasher.finish())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({:016x})", self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(Fingerprint)
    }
}

impl serde::Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// === Snapshot ===

/// Exact backtrackable state of a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub kernel: KernelState,
    /// Chain whose choices the last transition followed.
    pub current: CgChain,
    /// Generators registered by the last transition, not yet advanced.
    pub pending: CgChain,
}

impl Snapshot {
    pub fn capture(vm: &Vm) -> Self {
        Self {
            kernel: vm.kernel().clone(),
            current: vm.current_chain().clone(),
            pending: vm.next_chain().clone(),
        }
    }

    pub fn restore(&self, vm: &mut Vm) {
        vm.restore_parts(
            self.kernel.clone(),
            self.current.clone(),
            self.pending.clone(),
        );
    }

    /// Byte image of everything in the snapshot, objects by heap slot.
    ///
    /// Two snapshots have the same image exactly when they are equal, up to
    /// the visiting order of randomized generators.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new(RefNumbering::Slot);
        enc.heap_by_slot(&self.kernel);
        enc.kernel_rest(&self.kernel);
        enc.exec_thread(&self.kernel);
        enc.chain(&self.current, true);
        enc.chain(&self.pending, true);
        enc.finish()
    }

    pub fn image_fingerprint(&self) -> Fingerprint {
        Fingerprint::of_bytes(&self.to_bytes())
    }
}

// === Serializers ===

/// Canonicalization used for state matching.
pub trait StateSerializer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write the matchable parts of `snapshot` into `out`.
    fn serialize(&self, snapshot: &Snapshot, out: &mut Vec<u8>);

    fn match_key(&self, snapshot: &Snapshot) -> Fingerprint {
        self.match_image(snapshot).0
    }

    /// The match key together with the bytes it was computed from.
    fn match_image(&self, snapshot: &Snapshot) -> (Fingerprint, Vec<u8>) {
        let mut buf = Vec::with_capacity(256);
        self.serialize(snapshot, &mut buf);
        (Fingerprint::of_bytes(&buf), buf)
    }
}

/// Serializes live objects in heap slot order, with references as slot
/// numbers. States that differ only in allocation order do not match.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapOrderSerializer;

impl StateSerializer for HeapOrderSerializer {
    fn name(&self) -> &'static str {
        "heap"
    }

    fn serialize(&self, snapshot: &Snapshot, out: &mut Vec<u8>) {
        let mut enc = Encoder::with_buffer(RefNumbering::Slot, std::mem::take(out));
        enc.heap_by_slot(&snapshot.kernel);
        enc.matchable_rest(snapshot);
        *out = enc.finish();
    }
}

/// Serializes reachable objects in the order a traversal from the roots
/// discovers them, renumbering references accordingly. Heaps that are
/// isomorphic up to allocation order match.
#[derive(Debug, Clone, Copy, Default)]
pub struct CanonicalSerializer;

impl StateSerializer for CanonicalSerializer {
    fn name(&self) -> &'static str {
        "canonical"
    }

    fn serialize(&self, snapshot: &Snapshot, out: &mut Vec<u8>) {
        let kernel = &snapshot.kernel;
        let order = kernel.heap.reachable(kernel.roots());
        let numbers: AHashMap<ObjRef, u32> = order
            .iter()
            .enumerate()
            .map(|(i, &r)| (r, i as u32))
            .collect();
        let mut enc = Encoder::with_buffer(RefNumbering::Canonical(numbers), std::mem::take(out));
        enc.u32(order.len() as u32);
        for r in order {
            if let Some(obj) = kernel.heap.get(r) {
                enc.object(obj);
            }
        }
        enc.matchable_rest(snapshot);
        *out = enc.finish();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializerKind {
    HeapOrder,
    #[default]
    Canonical,
}

impl SerializerKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "heap" | "heap-order" => Some(SerializerKind::HeapOrder),
            "canonical" => Some(SerializerKind::Canonical),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SerializerKind::HeapOrder => "heap",
            SerializerKind::Canonical => "canonical",
        }
    }

    pub fn build(self) -> Box<dyn StateSerializer> {
        match self {
            SerializerKind::HeapOrder => Box::new(HeapOrderSerializer),
            SerializerKind::Canonical => Box::new(CanonicalSerializer),
        }
    }
}

// === Encoding ===

enum RefNumbering {
    Slot,
    Canonical(AHashMap<ObjRef, u32>),
}

struct Encoder {
    out: Vec<u8>,
    refs: RefNumbering,
}

impl Encoder {
    fn new(refs: RefNumbering) -> Self {
        Self::with_buffer(refs, Vec::with_capacity(256))
    }

    fn with_buffer(refs: RefNumbering, out: Vec<u8>) -> Self {
        Self { out, refs }
    }

    fn finish(self) -> Vec<u8> {
        self.out
    }

    fn u8(&mut self, v: u8) {
        self.out.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn str(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.out.extend_from_slice(s.as_bytes());
    }

    fn opt_str(&mut self, s: Option<&str>) {
        match s {
            Some(s) => {
                self.u8(1);
                self.str(s);
            }
            None => self.u8(0),
        }
    }

    fn reference(&mut self, r: ObjRef) {
        let n = match &self.refs {
            RefNumbering::Slot => r.0,
            // unreachable objects never appear in reachable data
            RefNumbering::Canonical(map) => map.get(&r).copied().unwrap_or(u32::MAX),
        };
        self.u32(n);
    }

    fn value(&mut self, v: &Value) {
        match *v {
            Value::Int(x) => {
                self.u8(1);
                self.u32(x as u32);
            }
            Value::Long(x) => {
                self.u8(2);
                self.u64(x as u64);
            }
            Value::Float(bits) => {
                self.u8(3);
                self.u32(bits);
            }
            Value::Double(bits) => {
                self.u8(4);
                self.u64(bits);
            }
            Value::Ref(r) => {
                self.u8(5);
                self.reference(r);
            }
            Value::Null => self.u8(6),
            Value::Top => self.u8(7),
        }
    }

    fn values(&mut self, vs: &[Value]) {
        self.u32(vs.len() as u32);
        for v in vs {
            self.value(v);
        }
    }

    fn thread_id(&mut self, t: rove_vm::ThreadId) {
        self.u32(t.0);
    }

    fn monitor_target(&mut self, target: MonitorTarget) {
        match target {
            MonitorTarget::Object(r) => {
                self.u8(0);
                self.reference(r);
            }
            MonitorTarget::Class(c) => {
                self.u8(1);
                self.u32(c.0);
            }
        }
    }

    fn monitor(&mut self, m: &Monitor) {
        match m.owner {
            Some(t) => {
                self.u8(1);
                self.thread_id(t);
            }
            None => self.u8(0),
        }
        self.u32(m.count);
        self.u32(m.contenders.len() as u32);
        for &t in &m.contenders {
            self.thread_id(t);
        }
        self.u32(m.waiters.len() as u32);
        for &t in &m.waiters {
            self.thread_id(t);
        }
    }

    fn object(&mut self, obj: &HeapObject) {
        self.u32(obj.class.0);
        match &obj.data {
            rove_vm::ObjectData::Fields(fields) => {
                self.u8(0);
                self.values(fields);
            }
            rove_vm::ObjectData::Array { elem, values } => {
                self.u8(1);
                self.str(&elem.to_string());
                self.values(values);
            }
        }
        self.monitor(&obj.monitor);
        self.u8(u8::from(obj.shared));
        match obj.thread {
            Some(t) => {
                self.u8(1);
                self.thread_id(t);
            }
            None => self.u8(0),
        }
        self.opt_str(obj.detail.as_deref());
    }

    fn heap_by_slot(&mut self, kernel: &KernelState) {
        self.u32(kernel.heap.capacity() as u32);
        for (r, obj) in kernel.heap.iter() {
            self.u32(r.0);
            self.object(obj);
        }
        self.u32(u32::MAX);
    }

    fn frame(&mut self, frame: &StackFrame) {
        self.u32(frame.method.class.0);
        self.u32(frame.method.index);
        self.u32(frame.pc as u32);
        self.values(&frame.locals);
        self.values(&frame.stack);
        match frame.kind {
            FrameKind::Normal => self.u8(0),
            FrameKind::ClassInit(c) => {
                self.u8(1);
                self.u32(c.0);
            }
            FrameKind::RoundTrip(m) => {
                self.u8(2);
                self.u32(m.class.0);
                self.u32(m.index);
            }
        }
        match frame.lock {
            Some(target) => {
                self.u8(1);
                self.monitor_target(target);
            }
            None => self.u8(0),
        }
    }

    fn thread(&mut self, t: &ThreadContext) {
        self.thread_id(t.id);
        self.u8(match t.status {
            ThreadStatus::Runnable => 0,
            ThreadStatus::Blocked => 1,
            ThreadStatus::Waiting => 2,
            ThreadStatus::Terminated => 3,
        });
        match t.object {
            Some(r) => {
                self.u8(1);
                self.reference(r);
            }
            None => self.u8(0),
        }
        match t.blocker {
            None => self.u8(0),
            Some(Blocker::Monitor(target)) => {
                self.u8(1);
                self.monitor_target(target);
            }
            Some(Blocker::ClassInit(c)) => {
                self.u8(2);
                self.u32(c.0);
            }
            Some(Blocker::Join(other)) => {
                self.u8(3);
                self.thread_id(other);
            }
            Some(Blocker::Wait {
                obj,
                saved_count,
                notified,
            }) => {
                self.u8(4);
                self.reference(obj);
                self.u32(saved_count);
                self.u8(u8::from(notified));
            }
        }
        // terminated threads keep no frames worth comparing
        if t.status == ThreadStatus::Terminated {
            self.u32(0);
            return;
        }
        self.u32(t.frames.len() as u32);
        for frame in &t.frames {
            self.frame(frame);
        }
    }

    /// Statics, threads and the flags of the kernel.
    fn kernel_rest(&mut self, kernel: &KernelState) {
        self.u32(kernel.statics.len() as u32);
        for area in kernel.statics.iter() {
            self.values(&area.values);
            match area.init {
                InitState::Uninitialized => self.u8(0),
                InitState::InProgress(t) => {
                    self.u8(1);
                    self.thread_id(t);
                }
                InitState::Initialized => self.u8(2),
            }
            self.monitor(&area.monitor);
        }
        self.u32(kernel.threads.len() as u32);
        for t in &kernel.threads {
            self.thread(t);
        }
        match &kernel.uncaught {
            Some(exc) => {
                self.u8(1);
                self.thread_id(exc.thread);
                self.str(&exc.class);
                self.opt_str(exc.detail.as_deref());
            }
            None => self.u8(0),
        }
        self.u8(u8::from(kernel.ignored));
    }

    fn exec_thread(&mut self, kernel: &KernelState) {
        match kernel.exec_thread {
            Some(t) => {
                self.u8(1);
                self.thread_id(t);
            }
            None => self.u8(0),
        }
    }

    fn chain(&mut self, chain: &CgChain, with_cursor: bool) {
        self.u32(chain.len() as u32);
        for cg in chain.iter() {
            self.str(&cg.id);
            self.thread_id(cg.thread);
            self.u32(cg.total() as u32);
            if with_cursor {
                self.u32(cg.choice_index().map_or(u32::MAX, |i| i as u32));
            }
        }
    }

    /// Everything but the heap that decides how the search continues: the
    /// kernel, the pending generators, and the thread that continues after
    /// a data choice.
    fn matchable_rest(&mut self, snapshot: &Snapshot) {
        self.kernel_rest(&snapshot.kernel);
        self.chain(&snapshot.pending, false);
        let has_thread_choice = snapshot
            .pending
            .iter()
            .any(|cg| cg.domain.is_thread_choice());
        if !has_thread_choice {
            self.exec_thread(&snapshot.kernel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rove_vm::VmConfig;
    use std::sync::Arc;

    fn vm(src: &str) -> Vm {
        let program = rove_asm::parse(src).unwrap();
        let mut vm = Vm::new(Arc::new(program), VmConfig::default()).unwrap();
        vm.initialize(&mut ()).unwrap();
        vm
    }

    /// Allocates two objects in an order picked by `Verify.getBoolean`,
    /// keeping only the second one.
    const ALLOC_ORDER: &str = r#"
class Box
  field v: int
end

class T
  static field keep: Box
  static method main()V
    invokestatic Verify.getBoolean()Z
    ifeq other
    new Box
    pop
    new Box
    putstatic T.keep
    return
  other:
    new Box
    putstatic T.keep
    new Box
    pop
    return
  end
end

entry T.main
"#;

    #[test]
    fn test_fingerprint_display() {
        let fp = Fingerprint::from_u64(0xab);
        assert_eq!(fp.to_string(), "00000000000000ab");
        assert_eq!(format!("{fp:?}"), "Fingerprint(00000000000000ab)");
        assert_eq!("00000000000000ab".parse::<Fingerprint>().unwrap(), fp);
    }

    #[test]
    fn test_capture_restore_identity() {
        let mut vm = vm(ALLOC_ORDER);
        let mut chain = vm.take_next_chain();
        assert!(chain.advance());
        vm.set_current_chain(chain);
        let before = Snapshot::capture(&vm);
        let image = before.to_bytes();

        vm.execute_transition(&mut ()).unwrap();
        assert_ne!(Snapshot::capture(&vm), before);

        before.restore(&mut vm);
        let after = Snapshot::capture(&vm);
        assert_eq!(after, before);
        assert_eq!(after.to_bytes(), image);
    }

    fn end_states(vm: &mut Vm) -> Vec<Snapshot> {
        // ROOT, then the boolean choice
        let mut root = vm.take_next_chain();
        assert!(root.advance());
        vm.set_current_chain(root);
        vm.execute_transition(&mut ()).unwrap();
        let kernel = vm.kernel().clone();
        let mut data = vm.take_next_chain();
        let mut ends = Vec::new();
        while data.advance() {
            vm.restore_parts(kernel.clone(), data.clone(), CgChain::new());
            vm.execute_transition(&mut ()).unwrap();
            ends.push(Snapshot::capture(vm));
        }
        ends
    }

    #[test]
    fn test_canonical_serializer_ignores_allocation_order() {
        let mut vm = vm(ALLOC_ORDER);
        let ends = end_states(&mut vm);
        assert_eq!(ends.len(), 2);

        let heap = HeapOrderSerializer;
        let canonical = CanonicalSerializer;
        assert_ne!(heap.match_key(&ends[0]), heap.match_key(&ends[1]));
        assert_eq!(canonical.match_key(&ends[0]), canonical.match_key(&ends[1]));
        // the exact images still differ
        assert_ne!(ends[0].to_bytes(), ends[1].to_bytes());
    }

    #[test]
    fn test_match_key_is_stable() {
        let vm = vm(ALLOC_ORDER);
        let snap = Snapshot::capture(&vm);
        for kind in [SerializerKind::HeapOrder, SerializerKind::Canonical] {
            let s = kind.build();
            assert_eq!(s.match_key(&snap), s.match_key(&snap.clone()));
        }
    }

    #[test]
    fn test_serializer_names() {
        assert_eq!(SerializerKind::from_name("heap"), Some(SerializerKind::HeapOrder));
        assert_eq!(SerializerKind::from_name("canonical"), Some(SerializerKind::Canonical));
        assert_eq!(SerializerKind::from_name("fast"), None);
        assert_eq!(SerializerKind::default().name(), "canonical");
    }
}
