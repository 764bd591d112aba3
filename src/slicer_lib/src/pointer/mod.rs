//! Pointers, points-to sets and the pointer subgraph the points-to analysis operates on.

use crate::prelude::*;
use std::collections::BTreeSet;

pub mod object;
pub mod offset;
pub mod subgraph;

pub use object::MemoryObject;
pub use offset::Offset;
use subgraph::{PsNodeId, INVALIDATED, NULLPTR, UNKNOWN_MEMORY};

/// A pointer value: a target memory location together with a byte offset into it.
///
/// The target is either an allocation site of the pointer subgraph
/// or one of the three sentinel locations
/// ([`NULLPTR`], [`UNKNOWN_MEMORY`], [`INVALIDATED`]).
/// The sentinels are interned once per subgraph and compared by handle identity.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct Pointer {
    /// The pointed-to allocation site or sentinel location.
    pub target: PsNodeId,
    /// The byte offset into the target.
    pub offset: Offset,
}

impl Pointer {
    /// Create a new pointer.
    pub fn new(target: PsNodeId, offset: Offset) -> Pointer {
        Pointer { target, offset }
    }

    /// The null pointer.
    pub fn null() -> Pointer {
        Pointer::new(NULLPTR, Offset::new(0))
    }

    /// The pointer to unknown memory.
    pub fn unknown() -> Pointer {
        Pointer::new(UNKNOWN_MEMORY, Offset::UNKNOWN)
    }

    /// Returns true if the pointer is the null pointer.
    pub fn is_null(&self) -> bool {
        self.target == NULLPTR
    }

    /// Returns true if the pointer points to unknown memory.
    pub fn is_unknown(&self) -> bool {
        self.target == UNKNOWN_MEMORY
    }

    /// Returns true if the pointer points to invalidated memory.
    pub fn is_invalidated(&self) -> bool {
        self.target == INVALIDATED
    }

    /// Returns true if the pointer is neither null nor unknown.
    pub fn is_valid(&self) -> bool {
        !self.is_null() && !self.is_unknown()
    }
}

/// A set of pointers with set-insert semantics.
///
/// All mutating operations report whether the set changed,
/// which drives the worklist of the points-to analysis.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Default)]
pub struct PointsToSet {
    pointers: BTreeSet<Pointer>,
}

impl PointsToSet {
    /// Create an empty points-to set.
    pub fn new() -> PointsToSet {
        PointsToSet::default()
    }

    /// Insert a pointer. Returns true if the set changed.
    pub fn insert(&mut self, pointer: Pointer) -> bool {
        self.pointers.insert(pointer)
    }

    /// Insert all pointers of another set. Returns true if the set changed.
    pub fn insert_all<'a>(&mut self, pointers: impl IntoIterator<Item = &'a Pointer>) -> bool {
        let mut changed = false;
        for pointer in pointers {
            changed |= self.pointers.insert(*pointer);
        }
        changed
    }

    /// Replace all pointers to the given target by a single pointer
    /// to that target with unknown offset.
    /// Returns true if the set changed.
    pub fn insert_unknown_offset(&mut self, target: PsNodeId) -> bool {
        let mut changed = false;
        let concrete: Vec<Pointer> = self
            .pointers
            .iter()
            .filter(|ptr| ptr.target == target && !ptr.offset.is_unknown())
            .copied()
            .collect();
        for pointer in concrete {
            self.pointers.remove(&pointer);
            changed = true;
        }
        changed |= self.pointers.insert(Pointer::new(target, Offset::UNKNOWN));
        changed
    }

    /// Returns true if the set contains the given pointer.
    pub fn contains(&self, pointer: &Pointer) -> bool {
        self.pointers.contains(pointer)
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.pointers.is_empty()
    }

    /// The number of pointers in the set.
    pub fn len(&self) -> usize {
        self.pointers.len()
    }

    /// Iterate over the pointers in the set.
    pub fn iter(&self) -> impl Iterator<Item = &Pointer> {
        self.pointers.iter()
    }

    /// If the set consists of exactly one pointer, return it.
    pub fn get_if_singleton(&self) -> Option<&Pointer> {
        if self.pointers.len() == 1 {
            self.pointers.iter().next()
        } else {
            None
        }
    }
}

impl<'a> IntoIterator for &'a PointsToSet {
    type Item = &'a Pointer;
    type IntoIter = std::collections::btree_set::Iter<'a, Pointer>;

    fn into_iter(self) -> Self::IntoIter {
        self.pointers.iter()
    }
}
