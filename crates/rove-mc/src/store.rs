//! Visited-state storage.

use crate::fpset::SeenSet;
use crate::state::Fingerprint;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::error;

/// What is known about a visited state.
#[derive(Debug, Clone)]
pub struct StateInfo {
    /// Visiting order, starting at 0 for the initial state.
    pub id: usize,
    /// Shallowest depth the state has been reached at.
    pub depth: usize,
    /// Serialized match bytes, when images are kept.
    pub image: Option<Arc<[u8]>>,
}

/// Result of offering a state to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    New(usize),
    /// The id is 0 when the store keeps only fingerprints.
    Seen(usize),
    /// Seen before at a greater depth; explore it again from here.
    Shallower(usize),
}

impl Visit {
    /// Whether the search should expand the state.
    pub fn is_new(self) -> bool {
        !matches!(self, Visit::Seen(_))
    }

    pub fn id(self) -> usize {
        match self {
            Visit::New(id) | Visit::Seen(id) | Visit::Shallower(id) => id,
        }
    }
}

/// Thread-safe visited-state store.
///
/// Keeps a `DashMap` from fingerprint to [`StateInfo`] when images or depths
/// are needed, and only the fingerprints otherwise:
/// - with images, a fingerprint shared by two different images is a hash
///   collision; it is logged once and counted
/// - with `match_depth`, a state reached at a shallower depth than before
///   is reported as [`Visit::Shallower`] so its subtree is searched again
pub struct StateStore {
    states: DashMap<Fingerprint, StateInfo>,
    seen: Option<SeenSet>,
    next_id: AtomicUsize,
    collisions: AtomicUsize,
    full_images: bool,
    match_depth: bool,
}

impl StateStore {
    pub fn new(full_images: bool, match_depth: bool) -> Self {
        let fingerprint_only = !full_images && !match_depth;
        Self {
            states: DashMap::new(),
            seen: fingerprint_only.then(|| SeenSet::new(1 << 16)),
            next_id: AtomicUsize::new(0),
            collisions: AtomicUsize::new(0),
            full_images,
            match_depth,
        }
    }

    /// Record a state reached at `depth`. `image` is only called when the
    /// store keeps images.
    pub fn visit(&self, fp: Fingerprint, depth: usize, image: impl FnOnce() -> Vec<u8>) -> Visit {
        if let Some(seen) = &self.seen {
            return if seen.insert(fp) {
                Visit::New(self.next_id.fetch_add(1, Ordering::Relaxed))
            } else {
                Visit::Seen(0)
            };
        }
        match self.states.entry(fp) {
            Entry::Occupied(mut occupied) => {
                if self.full_images {
                    let stored = occupied.get().image.clone();
                    if stored.as_deref() != Some(image().as_slice()) {
                        let n = self.collisions.fetch_add(1, Ordering::Relaxed);
                        if n == 0 {
                            error!(
                                fingerprint = %fp,
                                "hash collision detected: different states share fingerprint, results may be unsound"
                            );
                        }
                    }
                }
                let info = occupied.get_mut();
                if self.match_depth && depth < info.depth {
                    info.depth = depth;
                    Visit::Shallower(info.id)
                } else {
                    Visit::Seen(info.id)
                }
            }
            Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                vacant.insert(StateInfo {
                    id,
                    depth,
                    image: self.full_images.then(|| Arc::from(image())),
                });
                Visit::New(id)
            }
        }
    }

    #[inline]
    pub fn contains(&self, fp: &Fingerprint) -> bool {
        match &self.seen {
            Some(seen) => seen.contains(*fp),
            None => self.states.contains_key(fp),
        }
    }

    /// `None` in fingerprint-only mode.
    pub fn get(&self, fp: &Fingerprint) -> Option<StateInfo> {
        self.states.get(fp).map(|r| r.value().clone())
    }

    /// Number of distinct states.
    #[inline]
    pub fn len(&self) -> usize {
        match &self.seen {
            Some(seen) => seen.len(),
            None => self.states.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn collisions(&self) -> usize {
        self.collisions.load(Ordering::Relaxed)
    }

    pub fn keeps_images(&self) -> bool {
        self.full_images
    }

    /// Grow the fingerprint table if it is getting full. Call with no
    /// concurrent visits.
    pub fn maybe_grow(&mut self) {
        if let Some(seen) = &mut self.seen {
            if seen.should_grow() {
                seen.grow();
            }
        }
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(false, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(v: u64) -> Fingerprint {
        Fingerprint::from_u64(v)
    }

    #[test]
    fn test_visit_assigns_ids_in_order() {
        for store in [StateStore::new(false, false), StateStore::new(true, false)] {
            assert_eq!(store.visit(fp(10), 0, || vec![1]), Visit::New(0));
            assert_eq!(store.visit(fp(11), 1, || vec![2]), Visit::New(1));
            assert!(!store.visit(fp(10), 3, || vec![1]).is_new());
            assert_eq!(store.len(), 2);
            assert!(store.contains(&fp(11)));
            assert_eq!(store.collisions(), 0);
        }
    }

    #[test]
    fn test_full_images_detect_collisions() {
        let store = StateStore::new(true, false);
        store.visit(fp(1), 0, || vec![1, 2, 3]);
        assert_eq!(store.visit(fp(1), 1, || vec![9]), Visit::Seen(0));
        assert_eq!(store.collisions(), 1);
        let info = store.get(&fp(1)).unwrap();
        assert_eq!(info.image.as_deref(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_images_are_not_built_without_full_images() {
        let store = StateStore::new(false, true);
        store.visit(fp(1), 0, || panic!("image requested"));
        store.visit(fp(1), 0, || panic!("image requested"));
        assert!(store.get(&fp(1)).unwrap().image.is_none());
    }

    #[test]
    fn test_match_depth_revisits_shallower_states() {
        let store = StateStore::new(false, true);
        assert_eq!(store.visit(fp(5), 4, Vec::new), Visit::New(0));
        assert_eq!(store.visit(fp(5), 6, Vec::new), Visit::Seen(0));
        assert_eq!(store.visit(fp(5), 2, Vec::new), Visit::Shallower(0));
        assert_eq!(store.get(&fp(5)).unwrap().depth, 2);
        assert_eq!(store.visit(fp(5), 2, Vec::new), Visit::Seen(0));
    }

    #[test]
    fn test_fingerprint_only_mode_keeps_no_info() {
        let mut store = StateStore::default();
        store.visit(fp(3), 0, Vec::new);
        assert!(store.get(&fp(3)).is_none());
        store.maybe_grow();
        assert!(store.contains(&fp(3)));
    }

    #[test]
    fn test_concurrent_visits() {
        use std::thread;

        let store = Arc::new(StateStore::new(true, false));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..100u64 {
                        let v = t * 1000 + i;
                        store.visit(fp(v), 1, || v.to_le_bytes().to_vec());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len(), 400);
        assert_eq!(store.collisions(), 0);
    }
}
