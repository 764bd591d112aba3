//! The memory objects tracked by the points-to analysis.

use super::subgraph::PsNodeId;
use super::{Offset, Pointer};
use crate::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// A memory object associated one-to-one with an allocation site.
///
/// The object maps byte offsets to the sets of pointers
/// that may be stored at these offsets.
/// Reads at offsets without an explicit entry yield the null pointer
/// if the corresponding allocation is zero-initialized
/// and nothing otherwise.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct MemoryObject {
    /// The allocation site this object belongs to.
    pub alloc: PsNodeId,
    /// Maps offsets to the pointer values possibly stored there.
    points_to: BTreeMap<Offset, BTreeSet<Pointer>>,
}

impl MemoryObject {
    /// Create a new, empty memory object for the given allocation site.
    pub fn new(alloc: PsNodeId) -> MemoryObject {
        MemoryObject {
            alloc,
            points_to: BTreeMap::new(),
        }
    }

    /// Add a pointer value at the given offset.
    /// Returns true if the object changed.
    ///
    /// Entries at concrete offsets are left in place
    /// when a pointer is added at the unknown offset;
    /// loads always additionally read the unknown-offset entry.
    pub fn add_points_to(&mut self, offset: Offset, pointer: Pointer) -> bool {
        self.points_to.entry(offset).or_default().insert(pointer)
    }

    /// Add a set of pointer values at the given offset.
    /// Returns true if the object changed.
    pub fn add_points_to_set(&mut self, offset: Offset, pointers: &BTreeSet<Pointer>) -> bool {
        let entry = self.points_to.entry(offset).or_default();
        let mut changed = false;
        for pointer in pointers {
            changed |= entry.insert(*pointer);
        }
        changed
    }

    /// Get the pointers stored at the given offset,
    /// not including the pointers stored at the unknown offset.
    pub fn pointers_at(&self, offset: Offset) -> Option<&BTreeSet<Pointer>> {
        self.points_to.get(&offset)
    }

    /// Returns true if the object has no entries at all.
    pub fn is_empty(&self) -> bool {
        self.points_to.is_empty()
    }

    /// Iterate over all `(offset, pointer set)` entries of the object.
    pub fn iter(&self) -> impl Iterator<Item = (&Offset, &BTreeSet<Pointer>)> {
        self.points_to.iter()
    }

    /// Iterate over all pointers stored anywhere in the object.
    pub fn all_pointers(&self) -> impl Iterator<Item = &Pointer> {
        self.points_to.values().flatten()
    }
}
