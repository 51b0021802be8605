//! The per-program-point register file.

use std::collections::HashMap as StdHashMap;

use dexopt_ir::program::Reg;
use im::{HashMap, HashSet};

use crate::store::{ValueId, ValueStore};
use crate::tracked::Tracked;

/// Register-to-value map at one program point, plus every value ever seen
/// in this file. Overwriting a register drops it from the map but not from
/// the seen set, so usage records survive the overwrite.
///
/// Clones are cheap regardless of size (shared structure), which the
/// fixpoint driver leans on when it snapshots block inputs and outputs.
#[derive(Clone, Debug, Default)]
pub struct RegisterSet {
    regs: HashMap<Reg, ValueId>,
    seen: HashSet<ValueId>,
}

/// Deep copy of a file's register assignments, detached from the store.
/// The fixpoint compares a block's fresh input against this to decide
/// whether the block needs another visit.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    regs: StdHashMap<Reg, Tracked>,
}

impl RegisterSet {
    pub fn insert(&mut self, reg: Reg, value: ValueId) {
        self.regs.insert(reg, value);
        self.seen.insert(value);
    }

    /// Resets the register to bottom. The old value stays in the seen set.
    pub fn clear(&mut self, reg: Reg) {
        self.regs.remove(&reg);
    }

    #[must_use]
    pub fn get(&self, reg: Reg) -> Option<ValueId> {
        self.regs.get(&reg).copied()
    }

    #[must_use]
    pub fn has_seen(&self, value: ValueId) -> bool {
        self.seen.contains(&value)
    }

    /// Path join with another file. Registers live on both sides combine
    /// their values (possibly promoting); a register live on one side only
    /// meets bottom there.
    pub fn combine_paths(&mut self, other: &Self, store: &mut ValueStore) {
        let mut combined = self.regs.clone();
        for (reg, mine) in &self.regs {
            match other.regs.get(reg) {
                Some(theirs) => {
                    combined.insert(*reg, store.combine_paths(*mine, *theirs));
                }
                None => store.combine_with_bottom(*mine),
            }
        }
        for (reg, theirs) in &other.regs {
            if !self.regs.contains_key(reg) {
                store.combine_with_bottom(*theirs);
                combined.insert(*reg, *theirs);
            }
        }
        let mut seen = self.seen.clone().union(other.seen.clone());
        for value in combined.values() {
            seen.insert(*value);
        }
        self.regs = combined;
        self.seen = seen;
    }

    #[must_use]
    pub fn snapshot(&self, store: &ValueStore) -> Snapshot {
        Snapshot {
            regs: self
                .regs
                .iter()
                .map(|(r, v)| (*r, store.get(*v).clone()))
                .collect(),
        }
    }

    /// The fixpoint test: every register in this file must already be
    /// covered by the earlier snapshot, structurally and in its recorded
    /// uses.
    #[must_use]
    pub fn consistent_with(&self, earlier: &Snapshot, store: &ValueStore) -> bool {
        self.regs.iter().all(|(reg, value)| {
            earlier
                .regs
                .get(reg)
                .is_some_and(|old| store.get(*value).subsumed_by(old))
        })
    }
}
