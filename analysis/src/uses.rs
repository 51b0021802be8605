//! Usage records attached to tracked values.
//!
//! Every datum of the analysis supports the same three operations.
//! `combine_paths` joins the observations made on divergent paths that meet
//! again; `merge` composes sequential observations; `consistent_with` asks
//! whether another record is at least as general as this one, which is the
//! convergence test of the fixpoint driver.

use std::collections::{BTreeMap, BTreeSet};

use derive_more::Deref;
use dexopt_ir::cfg::InsnId;
use dexopt_ir::program::{FieldId, MethodRefId, Reg};

/// Whether a fact holds on every path reaching the observation point or
/// only on some of them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Flow {
    #[default]
    AllPaths,
    Conditional,
}

impl Flow {
    /// `Conditional` absorbs.
    #[must_use]
    pub fn join(self, other: Flow) -> Flow {
        if self == Flow::Conditional || other == Flow::Conditional {
            Flow::Conditional
        } else {
            Flow::AllPaths
        }
    }

    /// True when `self` is at least as general as `other`.
    #[must_use]
    pub fn covers(self, other: Flow) -> bool {
        self == Flow::Conditional || other == Flow::AllPaths
    }
}

/// How the writes of one field were fed: from a single register, from
/// several over the course of the method, or from registers that divergent
/// paths disagree about.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WriteSource {
    #[default]
    OneReg,
    MultipleReg,
    Unclear,
}

impl WriteSource {
    #[must_use]
    pub fn covers(self, other: WriteSource) -> bool {
        match self {
            WriteSource::Unclear => true,
            WriteSource::MultipleReg => other != WriteSource::Unclear,
            WriteSource::OneReg => other == WriteSource::OneReg,
        }
    }
}

/// The three-operator discipline shared by every analysis datum.
pub trait PathOps {
    /// Meet across divergent successors of the same predecessor.
    fn combine_paths(&mut self, other: &Self);
    /// Sequential composition of `other` into this record.
    fn merge(&mut self, other: &Self);
    /// Could `other` have arisen from the same execution without widening
    /// this record? Reflexive but not symmetric: `other` must be at least
    /// as general as `self`.
    fn consistent_with(&self, other: &Self) -> bool;
}

/// Writes of one field observed on a tracked value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldWrite {
    /// Store instructions grouped by the register the value came from.
    pub regs: BTreeMap<Reg, BTreeSet<InsnId>>,
    pub flow: Flow,
    pub source: WriteSource,
}

impl FieldWrite {
    fn reclassify(&mut self) {
        if self.source == WriteSource::Unclear {
            return;
        }
        self.source = if self.regs.len() <= 1 {
            WriteSource::OneReg
        } else {
            WriteSource::MultipleReg
        };
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deref)]
pub struct FieldWrites(pub BTreeMap<FieldId, FieldWrite>);

impl FieldWrites {
    /// `flow` is the creation flow of the value being recorded on: a write
    /// observed on a conditionally created value is itself conditional.
    pub fn record(&mut self, field: FieldId, reg: Reg, insn: InsnId, flow: Flow) {
        let write = self.0.entry(field).or_default();
        write.regs.entry(reg).or_default().insert(insn);
        write.flow = write.flow.join(flow);
        write.reclassify();
    }
}

impl PathOps for FieldWrites {
    fn combine_paths(&mut self, other: &Self) {
        for (field, write) in &mut self.0 {
            if !other.0.contains_key(field) {
                write.flow = Flow::Conditional;
            }
        }
        for (field, theirs) in &other.0 {
            match self.0.get_mut(field) {
                None => {
                    let mut write = theirs.clone();
                    write.flow = Flow::Conditional;
                    self.0.insert(*field, write);
                }
                Some(ours) => {
                    // Paths that fed the field from unrelated registers make
                    // the source unclassifiable.
                    let unrelated = !theirs.regs.keys().all(|r| ours.regs.contains_key(r))
                        && !ours.regs.keys().all(|r| theirs.regs.contains_key(r));
                    for (reg, insns) in &theirs.regs {
                        ours.regs.entry(*reg).or_default().extend(insns);
                    }
                    ours.flow = ours.flow.join(theirs.flow);
                    if unrelated || theirs.source == WriteSource::Unclear {
                        ours.source = WriteSource::Unclear;
                    } else {
                        ours.reclassify();
                    }
                }
            }
        }
    }

    fn merge(&mut self, other: &Self) {
        for (field, theirs) in &other.0 {
            match self.0.get_mut(field) {
                None => {
                    self.0.insert(*field, theirs.clone());
                }
                Some(ours) => {
                    for (reg, insns) in &theirs.regs {
                        ours.regs.entry(*reg).or_default().extend(insns);
                    }
                    ours.flow = ours.flow.join(theirs.flow);
                    if theirs.source == WriteSource::Unclear {
                        ours.source = WriteSource::Unclear;
                    } else {
                        ours.reclassify();
                    }
                }
            }
        }
    }

    fn consistent_with(&self, other: &Self) -> bool {
        self.0.iter().all(|(field, ours)| {
            other.0.get(field).is_some_and(|theirs| {
                theirs.flow.covers(ours.flow)
                    && theirs.source.covers(ours.source)
                    && ours.regs.iter().all(|(reg, insns)| {
                        theirs.regs.get(reg).is_some_and(|t| insns.is_subset(t))
                    })
            })
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deref)]
pub struct FieldReads(pub BTreeMap<FieldId, Flow>);

impl FieldReads {
    pub fn record(&mut self, field: FieldId, flow: Flow) {
        let entry = self.0.entry(field).or_default();
        *entry = entry.join(flow);
    }
}

impl PathOps for FieldReads {
    fn combine_paths(&mut self, other: &Self) {
        for (field, flow) in &mut self.0 {
            if !other.0.contains_key(field) {
                *flow = Flow::Conditional;
            }
        }
        for (field, theirs) in &other.0 {
            match self.0.get_mut(field) {
                None => {
                    self.0.insert(*field, Flow::Conditional);
                }
                Some(ours) => *ours = ours.join(*theirs),
            }
        }
    }

    fn merge(&mut self, other: &Self) {
        for (field, theirs) in &other.0 {
            match self.0.get_mut(field) {
                None => {
                    self.0.insert(*field, *theirs);
                }
                Some(ours) => *ours = ours.join(*theirs),
            }
        }
    }

    fn consistent_with(&self, other: &Self) -> bool {
        self.0
            .iter()
            .all(|(field, ours)| other.0.get(field).is_some_and(|theirs| theirs.covers(*ours)))
    }
}

/// Call sites of one method observed on a tracked receiver.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallSites {
    pub flow: Flow,
    /// (call instruction, receiver register) pairs.
    pub sites: BTreeSet<(InsnId, Reg)>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deref)]
pub struct MethodCalls(pub BTreeMap<MethodRefId, CallSites>);

impl MethodCalls {
    pub fn record(&mut self, method: MethodRefId, insn: InsnId, receiver: Reg, flow: Flow) {
        let calls = self.0.entry(method).or_default();
        calls.sites.insert((insn, receiver));
        calls.flow = calls.flow.join(flow);
    }
}

impl PathOps for MethodCalls {
    fn combine_paths(&mut self, other: &Self) {
        for (method, calls) in &mut self.0 {
            if !other.0.contains_key(method) {
                calls.flow = Flow::Conditional;
            }
        }
        for (method, theirs) in &other.0 {
            match self.0.get_mut(method) {
                None => {
                    let mut calls = theirs.clone();
                    calls.flow = Flow::Conditional;
                    self.0.insert(*method, calls);
                }
                Some(ours) => {
                    ours.sites.extend(&theirs.sites);
                    ours.flow = ours.flow.join(theirs.flow);
                }
            }
        }
    }

    fn merge(&mut self, other: &Self) {
        for (method, theirs) in &other.0 {
            match self.0.get_mut(method) {
                None => {
                    self.0.insert(*method, theirs.clone());
                }
                Some(ours) => {
                    ours.sites.extend(&theirs.sites);
                    ours.flow = ours.flow.join(theirs.flow);
                }
            }
        }
    }

    fn consistent_with(&self, other: &Self) -> bool {
        self.0.iter().all(|(method, ours)| {
            other.0.get(method).is_some_and(|theirs| {
                theirs.flow.covers(ours.flow) && ours.sites.is_subset(&theirs.sites)
            })
        })
    }
}

/// Where a tracked value becomes reachable outside its method. The
/// `via_*method_call` sites carry the argument register that leaked.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[allow(clippy::struct_field_names)]
pub struct Escapes {
    pub via_return: BTreeSet<InsnId>,
    pub via_array_write: BTreeSet<InsnId>,
    pub via_field_set: BTreeMap<FieldId, BTreeSet<InsnId>>,
    pub via_vmethod_call: BTreeMap<MethodRefId, BTreeSet<(InsnId, Reg)>>,
    pub via_smethod_call: BTreeMap<MethodRefId, BTreeSet<(InsnId, Reg)>>,
}

impl Escapes {
    pub fn record_field(&mut self, field: FieldId, insn: InsnId) {
        self.via_field_set.entry(field).or_default().insert(insn);
    }

    pub fn record_virtual(&mut self, method: MethodRefId, insn: InsnId, arg: Reg) {
        self.via_vmethod_call
            .entry(method)
            .or_default()
            .insert((insn, arg));
    }

    pub fn record_static(&mut self, method: MethodRefId, insn: InsnId, arg: Reg) {
        self.via_smethod_call
            .entry(method)
            .or_default()
            .insert((insn, arg));
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.via_return.is_empty()
            && self.via_array_write.is_empty()
            && self.via_field_set.is_empty()
            && self.via_vmethod_call.is_empty()
            && self.via_smethod_call.is_empty()
    }

    /// Every instruction recorded in any channel.
    #[must_use]
    pub fn insns(&self) -> BTreeSet<InsnId> {
        let mut all: BTreeSet<InsnId> = self.via_return.iter().copied().collect();
        all.extend(&self.via_array_write);
        all.extend(self.via_field_set.values().flatten());
        all.extend(self.via_vmethod_call.values().flatten().map(|(i, _)| i));
        all.extend(self.via_smethod_call.values().flatten().map(|(i, _)| i));
        all
    }

    fn union(&mut self, other: &Self) {
        self.via_return.extend(&other.via_return);
        self.via_array_write.extend(&other.via_array_write);
        for (field, insns) in &other.via_field_set {
            self.via_field_set.entry(*field).or_default().extend(insns);
        }
        for (method, sites) in &other.via_vmethod_call {
            self.via_vmethod_call
                .entry(*method)
                .or_default()
                .extend(sites);
        }
        for (method, sites) in &other.via_smethod_call {
            self.via_smethod_call
                .entry(*method)
                .or_default()
                .extend(sites);
        }
    }
}

impl PathOps for Escapes {
    // Escapes are pure may-facts; both compositions are set union.
    fn combine_paths(&mut self, other: &Self) {
        self.union(other);
    }

    fn merge(&mut self, other: &Self) {
        self.union(other);
    }

    fn consistent_with(&self, other: &Self) -> bool {
        self.via_return.is_subset(&other.via_return)
            && self.via_array_write.is_subset(&other.via_array_write)
            && self.via_field_set.iter().all(|(field, insns)| {
                other
                    .via_field_set
                    .get(field)
                    .is_some_and(|t| insns.is_subset(t))
            })
            && self.via_vmethod_call.iter().all(|(method, sites)| {
                other
                    .via_vmethod_call
                    .get(method)
                    .is_some_and(|t| sites.is_subset(t))
            })
            && self.via_smethod_call.iter().all(|(method, sites)| {
                other
                    .via_smethod_call
                    .get(method)
                    .is_some_and(|t| sites.is_subset(t))
            })
    }
}

/// The full usage record owned by one tracked value. Escapes into the
/// configured safe call targets are kept apart from real escapes; one
/// instruction never lands in both.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Uses {
    pub fields_set: FieldWrites,
    pub fields_read: FieldReads,
    pub method_calls: MethodCalls,
    pub escapes: Escapes,
    pub safe_escapes: Escapes,
}

impl PathOps for Uses {
    fn combine_paths(&mut self, other: &Self) {
        self.fields_set.combine_paths(&other.fields_set);
        self.fields_read.combine_paths(&other.fields_read);
        self.method_calls.combine_paths(&other.method_calls);
        self.escapes.combine_paths(&other.escapes);
        self.safe_escapes.combine_paths(&other.safe_escapes);
    }

    fn merge(&mut self, other: &Self) {
        self.fields_set.merge(&other.fields_set);
        self.fields_read.merge(&other.fields_read);
        self.method_calls.merge(&other.method_calls);
        self.escapes.merge(&other.escapes);
        self.safe_escapes.merge(&other.safe_escapes);
    }

    fn consistent_with(&self, other: &Self) -> bool {
        self.fields_set.consistent_with(&other.fields_set)
            && self.fields_read.consistent_with(&other.fields_read)
            && self.method_calls.consistent_with(&other.method_calls)
            && self.escapes.consistent_with(&other.escapes)
            && self.safe_escapes.consistent_with(&other.safe_escapes)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    #[test_case(Flow::AllPaths, Flow::AllPaths => Flow::AllPaths)]
    #[test_case(Flow::AllPaths, Flow::Conditional => Flow::Conditional)]
    #[test_case(Flow::Conditional, Flow::AllPaths => Flow::Conditional)]
    #[test_case(Flow::Conditional, Flow::Conditional => Flow::Conditional)]
    fn flow_join(a: Flow, b: Flow) -> Flow {
        a.join(b)
    }

    #[test_case(Flow::Conditional, Flow::AllPaths => true)]
    #[test_case(Flow::Conditional, Flow::Conditional => true)]
    #[test_case(Flow::AllPaths, Flow::AllPaths => true)]
    #[test_case(Flow::AllPaths, Flow::Conditional => false)]
    fn flow_covers(general: Flow, specific: Flow) -> bool {
        general.covers(specific)
    }

    #[test_case(WriteSource::Unclear, WriteSource::OneReg => true)]
    #[test_case(WriteSource::MultipleReg, WriteSource::OneReg => true)]
    #[test_case(WriteSource::MultipleReg, WriteSource::Unclear => false)]
    #[test_case(WriteSource::OneReg, WriteSource::MultipleReg => false)]
    fn write_source_covers(general: WriteSource, specific: WriteSource) -> bool {
        general.covers(specific)
    }

    fn field(n: u32) -> FieldId {
        FieldId(n)
    }

    fn insn(n: u32) -> InsnId {
        InsnId(n)
    }

    #[test]
    fn one_sided_write_turns_conditional() {
        let mut left = FieldWrites::default();
        left.record(field(0), 3, insn(7), Flow::AllPaths);
        let right = FieldWrites::default();

        left.combine_paths(&right);
        assert_eq!(left.0[&field(0)].flow, Flow::Conditional);
        assert_eq!(left.0[&field(0)].source, WriteSource::OneReg);
    }

    #[test]
    fn divergent_write_registers_are_unclear() {
        let mut left = FieldWrites::default();
        left.record(field(0), 3, insn(7), Flow::AllPaths);
        let mut right = FieldWrites::default();
        right.record(field(0), 4, insn(9), Flow::AllPaths);

        left.combine_paths(&right);
        assert_eq!(left.0[&field(0)].source, WriteSource::Unclear);
        assert_eq!(left.0[&field(0)].flow, Flow::AllPaths);

        // Applying the same combination again must not change anything.
        let settled = left.clone();
        left.combine_paths(&right);
        assert_eq!(left, settled);
    }

    #[test]
    fn sequential_writes_from_two_registers_are_multiple_not_unclear() {
        let mut writes = FieldWrites::default();
        writes.record(field(0), 3, insn(7), Flow::AllPaths);
        writes.record(field(0), 4, insn(9), Flow::AllPaths);
        assert_eq!(writes.0[&field(0)].source, WriteSource::MultipleReg);
    }

    #[test]
    fn reads_meet_across_paths() {
        let mut left = FieldReads::default();
        left.record(field(0), Flow::AllPaths);
        left.record(field(1), Flow::AllPaths);
        let mut right = FieldReads::default();
        right.record(field(0), Flow::AllPaths);
        right.record(field(2), Flow::AllPaths);

        left.combine_paths(&right);
        assert_eq!(left.0[&field(0)], Flow::AllPaths);
        assert_eq!(left.0[&field(1)], Flow::Conditional);
        assert_eq!(left.0[&field(2)], Flow::Conditional);
    }

    #[test]
    fn consistency_is_directional() {
        let mut small = FieldReads::default();
        small.record(field(0), Flow::AllPaths);
        let mut large = small.clone();
        large.record(field(1), Flow::AllPaths);

        assert!(small.consistent_with(&large));
        assert!(!large.consistent_with(&small));

        let mut conditional = small.clone();
        conditional.0.insert(field(0), Flow::Conditional);
        assert!(small.consistent_with(&conditional));
        assert!(!conditional.consistent_with(&small));
    }

    #[test]
    fn escape_channels_union_and_compare_by_subset() {
        let mut left = Escapes::default();
        left.via_return.insert(insn(1));
        let mut right = Escapes::default();
        right.record_static(MethodRefId(0), insn(2), 5);

        let small = left.clone();
        left.merge(&right);
        assert!(small.consistent_with(&left));
        assert!(!left.consistent_with(&small));
        assert_eq!(left.insns(), [insn(1), insn(2)].into_iter().collect());
    }

    prop_compose! {
        fn arb_reads()(entries in prop::collection::btree_map(
            (0u32..6).prop_map(FieldId),
            prop_oneof![Just(Flow::AllPaths), Just(Flow::Conditional)],
            0..6,
        )) -> FieldReads {
            FieldReads(entries)
        }
    }

    prop_compose! {
        fn arb_writes()(entries in prop::collection::btree_map(
            (0u32..4).prop_map(FieldId),
            (
                prop::collection::btree_map(
                    0u16..4,
                    prop::collection::btree_set((0u32..8).prop_map(InsnId), 1..3),
                    1..3,
                ),
                prop_oneof![Just(Flow::AllPaths), Just(Flow::Conditional)],
            ),
            0..4,
        )) -> FieldWrites {
            FieldWrites(entries.into_iter().map(|(f, (regs, flow))| {
                let mut write = FieldWrite { regs, flow, source: WriteSource::OneReg };
                write.reclassify();
                (f, write)
            }).collect())
        }
    }

    proptest! {
        #[test]
        fn combine_paths_is_idempotent(mut a in arb_reads(), b in arb_reads()) {
            a.combine_paths(&b);
            let once = a.clone();
            a.combine_paths(&b);
            prop_assert_eq!(once, a);
        }

        #[test]
        fn merge_is_idempotent(mut a in arb_reads(), b in arb_reads()) {
            a.merge(&b);
            let once = a.clone();
            a.merge(&b);
            prop_assert_eq!(once, a);
        }

        #[test]
        fn combined_writes_cover_both_sides(mut a in arb_writes(), b in arb_writes()) {
            let before = a.clone();
            a.combine_paths(&b);
            prop_assert!(before.consistent_with(&a));
            let mut twice = a.clone();
            twice.combine_paths(&b);
            prop_assert_eq!(a, twice);
        }

        #[test]
        fn merged_writes_cover_both_sides(mut a in arb_writes(), b in arb_writes()) {
            let before = a.clone();
            a.merge(&b);
            prop_assert!(before.consistent_with(&a));
            prop_assert!(b.consistent_with(&a));
        }
    }
}
