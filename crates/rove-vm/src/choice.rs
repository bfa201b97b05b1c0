//! Choice generators: the enumerable nondeterminism of a run.
//!
//! A generator owns an ordered finite domain and a cursor. Enumeration is
//! deterministic: advancing a fresh copy of a generator `k + 1` times always
//! yields the same choice. A randomized search only permutes the order in
//! which domain entries are visited; [`ChoiceGenerator::choice_index`] keeps
//! naming the domain entry, so traces replay independently of the order.

use crate::scheduler::SchedulingRelevance;
use crate::thread::ThreadId;
use crate::value::{ObjRef, Value};
use rand::seq::SliceRandom;
use rand::Rng;
use rove_ir::MethodId;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChoiceDomain {
    /// `false`, then `true`.
    Boolean,
    IntSet(Arc<[i32]>),
    /// Inclusive range visited in `step` increments.
    IntRange { lo: i32, hi: i32, step: i32 },
    Threads(Arc<[ThreadId]>),
    Objects(Arc<[ObjRef]>),
    /// Composite: one tuple of argument values per choice.
    Valuations(Arc<Vec<Vec<Value>>>),
}

impl ChoiceDomain {
    pub fn len(&self) -> usize {
        match self {
            ChoiceDomain::Boolean => 2,
            ChoiceDomain::IntSet(v) => v.len(),
            ChoiceDomain::IntRange { lo, hi, step } => {
                if hi < lo || *step <= 0 {
                    0
                } else {
                    ((i64::from(*hi) - i64::from(*lo)) / i64::from(*step) + 1) as usize
                }
            }
            ChoiceDomain::Threads(v) => v.len(),
            ChoiceDomain::Objects(v) => v.len(),
            ChoiceDomain::Valuations(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry `index` of the domain.
    pub fn get(&self, index: usize) -> Option<Choice> {
        if index >= self.len() {
            return None;
        }
        Some(match self {
            ChoiceDomain::Boolean => Choice::Bool(index == 1),
            ChoiceDomain::IntSet(v) => Choice::Int(v[index]),
            ChoiceDomain::IntRange { lo, step, .. } => {
                Choice::Int((i64::from(*lo) + index as i64 * i64::from(*step)) as i32)
            }
            ChoiceDomain::Threads(v) => Choice::Thread(v[index]),
            ChoiceDomain::Objects(v) => Choice::Object(v[index]),
            ChoiceDomain::Valuations(v) => Choice::Valuation(v[index].clone()),
        })
    }

    pub fn is_thread_choice(&self) -> bool {
        matches!(self, ChoiceDomain::Threads(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Choice {
    Bool(bool),
    Int(i32),
    Thread(ThreadId),
    Object(ObjRef),
    Valuation(Vec<Value>),
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Choice::Bool(b) => write!(f, "{b}"),
            Choice::Int(v) => write!(f, "{v}"),
            Choice::Thread(t) => write!(f, "thread {t}"),
            Choice::Object(r) => write!(f, "{r}"),
            Choice::Valuation(vals) => {
                write!(f, "(")?;
                for (i, v) in vals.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Instruction that registered a generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CgLocation {
    pub method: MethodId,
    pub pc: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChoiceGenerator {
    pub id: Arc<str>,
    pub domain: ChoiceDomain,
    /// Position in visiting order; `None` before the first advance.
    cursor: Option<usize>,
    /// Visiting order as a permutation of domain indices.
    order: Option<Arc<[usize]>>,
    /// Thread that was executing when the generator was registered.
    pub thread: ThreadId,
    pub location: Option<CgLocation>,
    /// `Some` for scheduling points.
    pub relevance: Option<SchedulingRelevance>,
}

impl ChoiceGenerator {
    pub fn new(id: impl Into<Arc<str>>, domain: ChoiceDomain, thread: ThreadId) -> Self {
        Self {
            id: id.into(),
            domain,
            cursor: None,
            order: None,
            thread,
            location: None,
            relevance: None,
        }
    }

    pub fn with_location(mut self, location: Option<CgLocation>) -> Self {
        self.location = location;
        self
    }

    pub fn with_relevance(mut self, relevance: SchedulingRelevance) -> Self {
        self.relevance = Some(relevance);
        self
    }

    pub fn total(&self) -> usize {
        self.domain.len()
    }

    pub fn is_started(&self) -> bool {
        self.cursor.is_some()
    }

    pub fn has_more_choices(&self) -> bool {
        match self.cursor {
            None => self.total() > 0,
            Some(c) => c + 1 < self.total(),
        }
    }

    /// Move to the next choice. Returns `false` when exhausted.
    pub fn advance(&mut self) -> bool {
        if !self.has_more_choices() {
            return false;
        }
        self.cursor = Some(self.cursor.map_or(0, |c| c + 1));
        true
    }

    /// Domain index of the current choice.
    pub fn choice_index(&self) -> Option<usize> {
        let c = self.cursor?;
        Some(match &self.order {
            Some(order) => order[c],
            None => c,
        })
    }

    /// Number of choices taken so far, including the current one.
    pub fn processed(&self) -> usize {
        self.cursor.map_or(0, |c| c + 1)
    }

    pub fn next_choice(&self) -> Option<Choice> {
        self.domain.get(self.choice_index()?)
    }

    pub fn reset(&mut self) {
        self.cursor = None;
    }

    /// Position the cursor on domain entry `index`, for replay.
    pub fn select(&mut self, index: usize) -> bool {
        if index >= self.total() {
            return false;
        }
        let position = match &self.order {
            Some(order) => order.iter().position(|&i| i == index),
            None => Some(index),
        };
        self.cursor = position;
        position.is_some()
    }

    /// Visit the domain in a random order.
    pub fn randomize<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let mut order: Vec<usize> = (0..self.total()).collect();
        order.shuffle(rng);
        self.order = Some(order.into());
    }

    pub fn thread_choice(&self) -> Option<ThreadId> {
        match self.next_choice()? {
            Choice::Thread(t) => Some(t),
            _ => None,
        }
    }
}

impl fmt::Display for ChoiceGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", self.id)?;
        match self.next_choice() {
            Some(c) => write!(f, "{c}")?,
            None => write!(f, "-")?,
        }
        write!(f, " {}/{}]", self.processed(), self.total())
    }
}

/// Generators registered by one transition, parent first.
///
/// The chain advances like an odometer: the deepest generator with choices
/// left moves on and every generator after it restarts from its first choice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CgChain {
    cgs: Vec<ChoiceGenerator>,
}

impl CgChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, cg: ChoiceGenerator) {
        self.cgs.push(cg);
    }

    pub fn is_empty(&self) -> bool {
        self.cgs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cgs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChoiceGenerator> {
        self.cgs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ChoiceGenerator> {
        self.cgs.iter_mut()
    }

    pub fn get(&self, i: usize) -> Option<&ChoiceGenerator> {
        self.cgs.get(i)
    }

    pub fn leaf(&self) -> Option<&ChoiceGenerator> {
        self.cgs.last()
    }

    /// Whether the chain has been advanced at least once.
    pub fn is_started(&self) -> bool {
        self.cgs.first().is_some_and(ChoiceGenerator::is_started)
    }

    pub fn has_more_choices(&self) -> bool {
        if !self.is_started() {
            return !self.cgs.is_empty() && self.cgs.iter().all(|cg| cg.total() > 0);
        }
        self.cgs.iter().any(ChoiceGenerator::has_more_choices)
    }

    /// Advance to the next combination. The first call selects the first
    /// choice of every generator. Returns `false` once all combinations
    /// have been taken.
    pub fn advance(&mut self) -> bool {
        if !self.is_started() {
            if !self.has_more_choices() {
                return false;
            }
            for cg in &mut self.cgs {
                cg.advance();
            }
            return true;
        }
        let Some(i) = self.cgs.iter().rposition(ChoiceGenerator::has_more_choices) else {
            return false;
        };
        self.cgs[i].advance();
        for cg in &mut self.cgs[i + 1..] {
            cg.reset();
            cg.advance();
        }
        true
    }

    /// Select one domain index per generator, for replay.
    pub fn select_all(&mut self, indices: &[usize]) -> bool {
        indices.len() == self.cgs.len()
            && self
                .cgs
                .iter_mut()
                .zip(indices)
                .all(|(cg, &i)| cg.select(i))
    }

    /// Current choice of the generator with the given id.
    pub fn choice(&self, id: &str, thread: ThreadId) -> Option<Choice> {
        self.cgs
            .iter()
            .rev()
            .find(|cg| &*cg.id == id && cg.thread == thread)?
            .next_choice()
    }

    /// Thread picked by the last scheduling generator in the chain.
    pub fn thread_choice(&self) -> Option<ThreadId> {
        self.cgs
            .iter()
            .rev()
            .find(|cg| cg.domain.is_thread_choice())?
            .thread_choice()
    }

    /// `(id, domain index)` of every generator, parent first.
    pub fn choices(&self) -> impl Iterator<Item = (&str, Option<usize>)> + '_ {
        self.cgs.iter().map(|cg| (&*cg.id, cg.choice_index()))
    }
}

impl FromIterator<ChoiceGenerator> for CgChain {
    fn from_iter<I: IntoIterator<Item = ChoiceGenerator>>(iter: I) -> Self {
        Self {
            cgs: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn cg(domain: ChoiceDomain) -> ChoiceGenerator {
        ChoiceGenerator::new("test", domain, ThreadId::MAIN)
    }

    #[test]
    fn test_enumeration_is_deterministic() {
        let mut g = cg(ChoiceDomain::IntRange {
            lo: -1,
            hi: 5,
            step: 3,
        });
        let mut seen = Vec::new();
        while g.advance() {
            seen.push(g.next_choice().unwrap());
        }
        assert_eq!(seen, vec![Choice::Int(-1), Choice::Int(2), Choice::Int(5)]);
        assert!(!g.has_more_choices());
        g.reset();
        assert!(g.advance());
        assert_eq!(g.next_choice(), Some(Choice::Int(-1)));
    }

    #[test]
    fn test_empty_domains() {
        let g = cg(ChoiceDomain::IntRange {
            lo: 3,
            hi: 1,
            step: 1,
        });
        assert_eq!(g.total(), 0);
        assert!(!g.has_more_choices());
        let mut chain: CgChain = [cg(ChoiceDomain::Boolean), g].into_iter().collect();
        assert!(!chain.advance());
    }

    #[test]
    fn test_cascade_exhaustion() {
        let mut chain: CgChain = [
            cg(ChoiceDomain::Boolean),
            cg(ChoiceDomain::IntSet(Arc::from(vec![7, 8, 9]))),
        ]
        .into_iter()
        .collect();
        let mut combos = Vec::new();
        while chain.advance() {
            let picks: Vec<_> = chain.iter().map(|g| g.next_choice().unwrap()).collect();
            combos.push(picks);
        }
        assert_eq!(combos.len(), 6);
        assert_eq!(combos[0], vec![Choice::Bool(false), Choice::Int(7)]);
        assert_eq!(combos[2], vec![Choice::Bool(false), Choice::Int(9)]);
        assert_eq!(combos[3], vec![Choice::Bool(true), Choice::Int(7)]);
        assert!(!chain.has_more_choices());
    }

    #[test]
    fn test_randomized_order_keeps_domain_indices() {
        let mut g = cg(ChoiceDomain::IntSet(Arc::from(vec![10, 20, 30, 40])));
        g.randomize(&mut StdRng::seed_from_u64(1));
        let mut indices = Vec::new();
        while g.advance() {
            let i = g.choice_index().unwrap();
            assert_eq!(g.next_choice(), ChoiceDomain::IntSet(Arc::from(vec![10, 20, 30, 40])).get(i));
            indices.push(i);
        }
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3]);

        assert!(g.select(2));
        assert_eq!(g.next_choice(), Some(Choice::Int(30)));
        assert!(!g.select(4));
    }

    #[test]
    fn test_chain_lookup() {
        let mut chain: CgChain = [
            ChoiceGenerator::new(
                "START",
                ChoiceDomain::Threads(Arc::from(vec![ThreadId(0), ThreadId(1)])),
                ThreadId(0),
            ),
            ChoiceGenerator::new("verifyGetBoolean", ChoiceDomain::Boolean, ThreadId(0)),
        ]
        .into_iter()
        .collect();
        assert!(chain.select_all(&[1, 1]));
        assert_eq!(chain.thread_choice(), Some(ThreadId(1)));
        assert_eq!(
            chain.choice("verifyGetBoolean", ThreadId(0)),
            Some(Choice::Bool(true))
        );
        assert_eq!(chain.choice("verifyGetBoolean", ThreadId(1)), None);
        let picks: Vec<_> = chain.choices().collect();
        assert_eq!(picks, vec![("START", Some(1)), ("verifyGetBoolean", Some(1))]);
    }
}
