//! Per-method arena of tracked values.

use std::collections::{BTreeSet, HashMap};

use derive_more::Display;
use dexopt_ir::cfg::InsnId;
use dexopt_ir::program::ClassId;
use log::trace;

use crate::tracked::{MergedUses, ObjectUses, Tracked};
use crate::uses::{Flow, PathOps, Uses};

/// Stable handle to a tracked value within one method's [`ValueStore`].
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("v{_0}")]
pub struct ValueId(usize);

/// Owns every tracked value created while analysing one method. Values are
/// shared by handle: the same id may sit in several registers at once and
/// keeps accumulating uses wherever it is visible from.
///
/// Merged values are interned by their construction-site set, so two
/// independent promotions of the same set at different program points
/// converge on one shared record. The fixpoint terminates because of this.
#[derive(Debug, Default)]
pub struct ValueStore {
    values: Vec<Tracked>,
    merged_ids: HashMap<BTreeSet<InsnId>, ValueId>,
}

impl ValueStore {
    /// Fresh construction record. Revisiting the same instruction through a
    /// back-edge deliberately allocates a new record.
    pub fn add_init(&mut self, insn: InsnId, class: ClassId) -> ValueId {
        self.push(Tracked::Object(ObjectUses::new(insn, class)))
    }

    fn push(&mut self, value: Tracked) -> ValueId {
        self.values.push(value);
        ValueId(self.values.len() - 1)
    }

    #[must_use]
    pub fn get(&self, id: ValueId) -> &Tracked {
        &self.values[id.0]
    }

    pub fn get_mut(&mut self, id: ValueId) -> &mut Tracked {
        &mut self.values[id.0]
    }

    /// Join against bottom: on the other path the value does not exist, so
    /// an object's construction becomes conditional; a merged value may
    /// additionally have been null there.
    pub fn combine_with_bottom(&mut self, id: ValueId) {
        match &mut self.values[id.0] {
            Tracked::Object(o) => o.created = Flow::Conditional,
            Tracked::Merged(m) => m.nullable = true,
        }
    }

    /// Records that a null comparison tested this value. Only merged values
    /// carry nullability; branch-local refinement stays conservative.
    pub fn mark_nullable(&mut self, id: ValueId) {
        if let Tracked::Merged(m) = &mut self.values[id.0] {
            m.nullable = true;
        }
    }

    /// Consumes the store, handing back every value in creation order.
    #[must_use]
    pub fn into_values(self) -> Vec<Tracked> {
        self.values
    }

    /// Join of two values where paths meet. May promote objects into a
    /// merged value.
    pub fn combine_paths(&mut self, a: ValueId, b: ValueId) -> ValueId {
        if a == b {
            return a;
        }
        let lhs = self.values[a.0].clone();
        let rhs = self.values[b.0].clone();
        match (lhs, rhs) {
            (Tracked::Object(x), Tracked::Object(y)) if x.insn == y.insn => {
                // Two records of the same construction site; fold the newer
                // observations into the resident record.
                let Tracked::Object(dst) = &mut self.values[a.0] else {
                    unreachable!("value changed shape mid-join");
                };
                dst.created = dst.created.join(y.created);
                dst.uses.combine_paths(&y.uses);
                a
            }
            (Tracked::Object(x), Tracked::Object(y)) => {
                trace!("promoting {} and {} into a merged value", x.insn, y.insn);
                let mut uses = x.uses.clone();
                uses.combine_paths(&y.uses);
                self.intern(
                    [x.insn, y.insn].into(),
                    [x.class, y.class].into(),
                    x.created.join(y.created),
                    false,
                    uses,
                )
            }
            (Tracked::Object(x), Tracked::Merged(m))
            | (Tracked::Merged(m), Tracked::Object(x)) => {
                let mut insns = m.insns.clone();
                insns.insert(x.insn);
                let mut classes = m.classes.clone();
                classes.insert(x.class);
                let mut uses = m.uses.clone();
                uses.combine_paths(&x.uses);
                self.intern(insns, classes, m.created.join(x.created), m.nullable, uses)
            }
            (Tracked::Merged(m), Tracked::Merged(n)) => {
                let insns = m.insns.union(&n.insns).copied().collect();
                let classes = m.classes.union(&n.classes).copied().collect();
                let mut uses = m.uses.clone();
                uses.combine_paths(&n.uses);
                self.intern(
                    insns,
                    classes,
                    m.created.join(n.created),
                    m.nullable || n.nullable,
                    uses,
                )
            }
        }
    }

    fn intern(
        &mut self,
        insns: BTreeSet<InsnId>,
        classes: BTreeSet<ClassId>,
        created: Flow,
        nullable: bool,
        uses: Uses,
    ) -> ValueId {
        if let Some(&id) = self.merged_ids.get(&insns) {
            let Tracked::Merged(dst) = &mut self.values[id.0] else {
                unreachable!("interned id does not point at a merged value");
            };
            dst.classes.extend(classes);
            dst.created = dst.created.join(created);
            dst.nullable |= nullable;
            dst.uses.combine_paths(&uses);
            id
        } else {
            let id = self.push(Tracked::Merged(MergedUses {
                insns: insns.clone(),
                classes,
                nullable,
                created,
                uses,
            }));
            self.merged_ids.insert(insns, id);
            id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_two_objects() -> (ValueStore, ValueId, ValueId) {
        let mut store = ValueStore::default();
        let a = store.add_init(InsnId(1), ClassId(0));
        let b = store.add_init(InsnId(2), ClassId(1));
        (store, a, b)
    }

    #[test]
    fn promotion_creates_an_interned_merged_value() {
        let (mut store, a, b) = store_with_two_objects();
        let merged = store.combine_paths(a, b);

        let Tracked::Merged(m) = store.get(merged) else {
            panic!("promotion did not produce a merged value");
        };
        assert_eq!(m.insns, [InsnId(1), InsnId(2)].into());
        assert_eq!(m.classes, [ClassId(0), ClassId(1)].into());
        assert!(m.insns.len() >= 2);

        // A second, independent promotion of the same pair must share the
        // record.
        assert_eq!(store.combine_paths(a, b), merged);
        assert_eq!(store.combine_paths(b, a), merged);
    }

    #[test]
    fn path_joins_are_idempotent() {
        let (mut store, a, b) = store_with_two_objects();
        let merged = store.combine_paths(a, b);
        let once = store.get(merged).clone();
        let again = store.combine_paths(a, b);
        assert_eq!(again, merged);
        assert_eq!(store.get(merged), &once);
    }

    #[test]
    fn same_site_objects_fold_without_promotion() {
        let mut store = ValueStore::default();
        let first = store.add_init(InsnId(7), ClassId(0));
        let second = store.add_init(InsnId(7), ClassId(0));
        store.combine_with_bottom(second);

        let kept = store.combine_paths(first, second);
        assert_eq!(kept, first);
        let Tracked::Object(o) = store.get(kept) else {
            panic!("fold must keep the object shape");
        };
        assert_eq!(o.created, Flow::Conditional);
    }

    #[test]
    fn extending_a_merged_value_interns_the_wider_set() {
        let (mut store, a, b) = store_with_two_objects();
        let merged = store.combine_paths(a, b);
        let c = store.add_init(InsnId(3), ClassId(0));

        let wider = store.combine_paths(merged, c);
        assert_ne!(wider, merged);
        let Tracked::Merged(m) = store.get(wider) else {
            panic!("expected a merged value");
        };
        assert_eq!(m.insns, [InsnId(1), InsnId(2), InsnId(3)].into());

        // The object folded into a merged value it is already part of comes
        // back as that same record.
        assert_eq!(store.combine_paths(wider, c), wider);
        assert_eq!(store.combine_paths(c, wider), wider);
    }

    #[test]
    fn bottom_makes_objects_conditional_and_merged_nullable() {
        let (mut store, a, b) = store_with_two_objects();
        store.combine_with_bottom(a);
        assert_eq!(store.get(a).created(), Flow::Conditional);

        let merged = store.combine_paths(a, b);
        store.combine_with_bottom(merged);
        let Tracked::Merged(m) = store.get(merged) else {
            panic!("expected a merged value");
        };
        assert!(m.nullable);
    }

    #[test]
    fn nullability_marking_ignores_objects() {
        let (mut store, a, _) = store_with_two_objects();
        store.mark_nullable(a);
        assert!(matches!(store.get(a), Tracked::Object(o) if o.created == Flow::AllPaths));
    }
}
