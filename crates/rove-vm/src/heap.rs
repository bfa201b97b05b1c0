//! Persistent object store.
//!
//! The heap is an `im::Vector` of shared object slots, so cloning it for a
//! snapshot is cheap and an update copies only the touched path and object.
//! Slots are never reused: allocation order alone decides object references.

use crate::monitor::Monitor;
use crate::thread::ThreadId;
use crate::value::{ObjRef, Value};
use rove_ir::{ClassId, Type};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectData {
    /// Instance field values indexed by layout slot.
    Fields(Vec<Value>),
    Array { elem: Type, values: Vec<Value> },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HeapObject {
    pub class: ClassId,
    pub data: ObjectData,
    pub monitor: Monitor,
    /// Set once the object is reachable from more than one thread.
    pub shared: bool,
    /// Thread started on this object, for thread objects.
    pub thread: Option<ThreadId>,
    /// Message attached to VM-raised exceptions.
    pub detail: Option<Arc<str>>,
}

impl HeapObject {
    pub fn new(class: ClassId, fields: Vec<Value>) -> Self {
        Self {
            class,
            data: ObjectData::Fields(fields),
            monitor: Monitor::default(),
            shared: false,
            thread: None,
            detail: None,
        }
    }

    pub fn new_array(class: ClassId, elem: Type, len: usize) -> Self {
        let values = vec![Value::default_for(&elem); len];
        Self {
            class,
            data: ObjectData::Array { elem, values },
            monitor: Monitor::default(),
            shared: false,
            thread: None,
            detail: None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self.data, ObjectData::Array { .. })
    }

    pub fn values(&self) -> &[Value] {
        match &self.data {
            ObjectData::Fields(v) => v,
            ObjectData::Array { values, .. } => values,
        }
    }

    pub fn values_mut(&mut self) -> &mut Vec<Value> {
        match &mut self.data {
            ObjectData::Fields(v) => v,
            ObjectData::Array { values, .. } => values,
        }
    }

    /// Objects referenced from this object's fields or elements.
    pub fn references(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.values().iter().filter_map(Value::object)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Heap {
    objects: im::Vector<Option<Arc<HeapObject>>>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, object: HeapObject) -> ObjRef {
        let r = ObjRef(self.objects.len() as u32);
        self.objects.push_back(Some(Arc::new(object)));
        r
    }

    pub fn get(&self, r: ObjRef) -> Option<&HeapObject> {
        self.objects.get(r.index())?.as_deref()
    }

    pub fn get_mut(&mut self, r: ObjRef) -> Option<&mut HeapObject> {
        self.objects.get_mut(r.index())?.as_mut().map(Arc::make_mut)
    }

    /// Number of slots ever allocated, live or freed.
    pub fn capacity(&self) -> usize {
        self.objects.len()
    }

    pub fn live_count(&self) -> usize {
        self.objects.iter().filter(|o| o.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, &HeapObject)> + '_ {
        self.objects
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.as_deref().map(|o| (ObjRef(i as u32), o)))
    }

    /// Objects reachable from `roots`, in discovery order.
    pub fn reachable(&self, roots: impl IntoIterator<Item = ObjRef>) -> Vec<ObjRef> {
        let mut marked = vec![false; self.objects.len()];
        let mut order = Vec::new();
        let mut work: Vec<ObjRef> = Vec::new();
        for root in roots {
            work.push(root);
            while let Some(r) = work.pop() {
                let Some(obj) = self.get(r) else { continue };
                if std::mem::replace(&mut marked[r.index()], true) {
                    continue;
                }
                order.push(r);
                let children: Vec<ObjRef> = obj.references().collect();
                work.extend(children.into_iter().rev());
            }
        }
        order
    }

    /// Free every object not reachable from `roots`. Returns the number freed.
    pub fn gc(&mut self, roots: impl IntoIterator<Item = ObjRef>) -> usize {
        let mut marked = vec![false; self.objects.len()];
        for r in self.reachable(roots) {
            marked[r.index()] = true;
        }
        let dead: Vec<usize> = self
            .objects
            .iter()
            .enumerate()
            .filter(|(i, o)| o.is_some() && !marked[*i])
            .map(|(i, _)| i)
            .collect();
        for &i in &dead {
            self.objects.set(i, None);
        }
        dead.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(fields: Vec<Value>) -> HeapObject {
        HeapObject::new(ClassId(0), fields)
    }

    #[test]
    fn test_allocate_and_update() {
        let mut heap = Heap::new();
        let a = heap.allocate(obj(vec![Value::Int(1)]));
        let snapshot = heap.clone();
        heap.get_mut(a).unwrap().values_mut()[0] = Value::Int(2);
        assert_eq!(heap.get(a).unwrap().values()[0], Value::Int(2));
        assert_eq!(snapshot.get(a).unwrap().values()[0], Value::Int(1));
    }

    #[test]
    fn test_gc_frees_unreachable_without_reuse() {
        let mut heap = Heap::new();
        let a = heap.allocate(obj(vec![Value::Null]));
        let b = heap.allocate(obj(vec![]));
        let c = heap.allocate(obj(vec![]));
        heap.get_mut(a).unwrap().values_mut()[0] = Value::Ref(c);
        assert_eq!(heap.gc([a]), 1);
        assert!(heap.get(b).is_none());
        assert!(heap.get(c).is_some());
        let d = heap.allocate(obj(vec![]));
        assert_eq!(d, ObjRef(3));
        assert_eq!(heap.live_count(), 3);
    }

    #[test]
    fn test_reachable_order_is_depth_first() {
        let mut heap = Heap::new();
        let leaf1 = heap.allocate(obj(vec![]));
        let leaf2 = heap.allocate(obj(vec![]));
        let root = heap.allocate(obj(vec![Value::Ref(leaf2), Value::Ref(leaf1)]));
        assert_eq!(heap.reachable([root]), vec![root, leaf2, leaf1]);
    }
}
