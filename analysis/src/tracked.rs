//! The tracked-value lattice.
//!
//! A register either holds nothing of interest (bottom, represented by
//! absence from the register file), a value from exactly one construction
//! site ([`ObjectUses`]), or a value from one of several construction sites
//! that met at a join point ([`MergedUses`]). Top is never materialized.

use std::collections::BTreeSet;

use dexopt_ir::cfg::InsnId;
use dexopt_ir::program::ClassId;

use crate::uses::{Flow, PathOps, Uses};

/// A value produced by exactly one construction instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectUses {
    pub insn: InsnId,
    pub class: ClassId,
    /// Whether the construction reaches the current point on every path.
    pub created: Flow,
    pub uses: Uses,
}

impl ObjectUses {
    #[must_use]
    pub fn new(insn: InsnId, class: ClassId) -> Self {
        Self {
            insn,
            class,
            created: Flow::AllPaths,
            uses: Uses::default(),
        }
    }
}

/// A value produced by one of a set of construction instructions. The set
/// is always at least two strong; a collapse to one lifts back to
/// [`ObjectUses`] at creation time. `nullable` records that null has also
/// been observed in the same register.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergedUses {
    pub insns: BTreeSet<InsnId>,
    pub classes: BTreeSet<ClassId>,
    pub nullable: bool,
    pub created: Flow,
    pub uses: Uses,
}

/// One tracked value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Tracked {
    Object(ObjectUses),
    Merged(MergedUses),
}

impl Tracked {
    #[must_use]
    pub fn uses(&self) -> &Uses {
        match self {
            Tracked::Object(o) => &o.uses,
            Tracked::Merged(m) => &m.uses,
        }
    }

    pub fn uses_mut(&mut self) -> &mut Uses {
        match self {
            Tracked::Object(o) => &mut o.uses,
            Tracked::Merged(m) => &mut m.uses,
        }
    }

    #[must_use]
    pub fn created(&self) -> Flow {
        match self {
            Tracked::Object(o) => o.created,
            Tracked::Merged(m) => m.created,
        }
    }

    /// The construction sites this value may stem from.
    #[must_use]
    pub fn insns(&self) -> BTreeSet<InsnId> {
        match self {
            Tracked::Object(o) => [o.insn].into(),
            Tracked::Merged(m) => m.insns.clone(),
        }
    }

    /// Structural convergence test: is `other` at least as general a value
    /// as `self`? An object is consistent with any merged value containing
    /// its construction site; the reverse never holds.
    #[must_use]
    pub fn consistent_with(&self, other: &Tracked) -> bool {
        match (self, other) {
            (Tracked::Object(a), Tracked::Object(b)) => a.insn == b.insn,
            (Tracked::Object(a), Tracked::Merged(m)) => m.insns.contains(&a.insn),
            (Tracked::Merged(_), Tracked::Object(_)) => false,
            (Tracked::Merged(a), Tracked::Merged(b)) => {
                a.insns == b.insns && (!a.nullable || b.nullable)
            }
        }
    }

    /// Convergence test including the usage records: `other` must be at
    /// least as general structurally and already account for every
    /// observation recorded here.
    #[must_use]
    pub fn subsumed_by(&self, other: &Tracked) -> bool {
        self.consistent_with(other)
            && other.created().covers(self.created())
            && self.uses().consistent_with(other.uses())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::test_utils::{arb_merged, arb_object, insn_set};

    #[test]
    fn object_is_consistent_with_covering_merged_only() {
        let object = Tracked::Object(ObjectUses::new(InsnId(3), ClassId(0)));
        let merged = Tracked::Merged(MergedUses {
            insns: [InsnId(3), InsnId(5)].into(),
            classes: [ClassId(0), ClassId(1)].into(),
            nullable: false,
            created: Flow::AllPaths,
            uses: Uses::default(),
        });
        let unrelated = Tracked::Merged(MergedUses {
            insns: [InsnId(4), InsnId(5)].into(),
            classes: [ClassId(1)].into(),
            nullable: false,
            created: Flow::AllPaths,
            uses: Uses::default(),
        });

        assert!(object.consistent_with(&merged));
        assert!(!object.consistent_with(&unrelated));
        assert!(!merged.consistent_with(&object));
    }

    #[test]
    fn nullability_narrows_consistency_one_way() {
        let plain = MergedUses {
            insns: [InsnId(1), InsnId(2)].into(),
            classes: [ClassId(0)].into(),
            nullable: false,
            created: Flow::AllPaths,
            uses: Uses::default(),
        };
        let mut nullable = plain.clone();
        nullable.nullable = true;

        assert!(Tracked::Merged(plain.clone()).consistent_with(&Tracked::Merged(nullable.clone())));
        assert!(!Tracked::Merged(nullable).consistent_with(&Tracked::Merged(plain)));
    }

    proptest! {
        #[test]
        fn consistency_is_reflexive_for_objects(object in arb_object()) {
            let value = Tracked::Object(object);
            prop_assert!(value.consistent_with(&value));
            prop_assert!(value.subsumed_by(&value));
        }

        #[test]
        fn consistency_is_reflexive_for_merged(merged in arb_merged()) {
            let value = Tracked::Merged(merged);
            prop_assert!(value.consistent_with(&value));
            prop_assert!(value.subsumed_by(&value));
        }

        #[test]
        fn merged_values_compare_by_instruction_set(a in arb_merged(), b in arb_merged()) {
            let (left, right) = (Tracked::Merged(a.clone()), Tracked::Merged(b.clone()));
            if a.insns != b.insns {
                prop_assert!(!left.consistent_with(&right));
                prop_assert!(!right.consistent_with(&left));
            }
        }

        #[test]
        fn object_in_set_is_one_directional(insns in insn_set(), object in arb_object()) {
            let mut insns = insns;
            insns.insert(object.insn);
            let merged = Tracked::Merged(MergedUses {
                insns,
                classes: [object.class].into(),
                nullable: false,
                created: Flow::AllPaths,
                uses: Uses::default(),
            });
            let object = Tracked::Object(object);
            prop_assert!(object.consistent_with(&merged));
            prop_assert!(!merged.consistent_with(&object));
        }
    }
}
