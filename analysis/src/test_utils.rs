#![cfg(any(feature = "test", test))]
//! Proptest strategies and program scaffolding shared by the test modules.

use std::collections::HashSet;

use dexopt_ir::cfg::{Cfg, InsnId};
use dexopt_ir::program::{ClassId, FieldId, MethodId, MethodRefId, Program};
use dexopt_ir::test_utils::ProgramBuilder;
use proptest::collection::btree_set;
use proptest::prelude::*;

use crate::block::BlockContext;
use crate::driver::{analyze_program, AnalysisConfig};
use crate::fixpoint::{self, MethodSummary};
use crate::init::InitIndex;
use crate::tracked::{MergedUses, ObjectUses};
use crate::uses::{Flow, Uses};

pub fn flow() -> impl Strategy<Value = Flow> {
    prop_oneof![Just(Flow::AllPaths), Just(Flow::Conditional)]
}

pub fn insn_set() -> impl Strategy<Value = std::collections::BTreeSet<InsnId>> {
    btree_set((0u32..32).prop_map(InsnId), 2..6)
}

pub fn arb_object() -> impl Strategy<Value = ObjectUses> {
    ((0u32..32).prop_map(InsnId), (0u32..8).prop_map(ClassId), flow()).prop_map(
        |(insn, class, created)| ObjectUses {
            insn,
            class,
            created,
            uses: Uses::default(),
        },
    )
}

pub fn arb_merged() -> impl Strategy<Value = MergedUses> {
    (
        insn_set(),
        btree_set((0u32..8).prop_map(ClassId), 1..4),
        any::<bool>(),
        flow(),
    )
        .prop_map(|(insns, classes, nullable, created)| MergedUses {
            insns,
            classes,
            nullable,
            created,
            uses: Uses::default(),
        })
}

/// Identities assigned by [`program_fixture`]; fixed by its construction
/// order, so instruction streams can be written against them up front.
#[derive(Clone, Copy, Debug)]
pub struct ProgramIds {
    pub base: ClassId,
    pub conn: ClassId,
    pub sock: ClassId,
    pub util: ClassId,
    pub holder: ClassId,
    pub field_f: FieldId,
    pub poke: MethodRefId,
    pub keep: MethodRefId,
    pub leak: MethodRefId,
    pub run: MethodId,
}

impl ProgramIds {
    fn new() -> Self {
        Self {
            base: ClassId(0),
            conn: ClassId(1),
            sock: ClassId(2),
            util: ClassId(3),
            holder: ClassId(4),
            field_f: FieldId(0),
            poke: MethodRefId(0),
            keep: MethodRefId(1),
            leak: MethodRefId(2),
            run: MethodId(0),
        }
    }
}

/// A five-class program: tracked hierarchy `Base` ← {`Conn`, `Sock`}, an
/// unrelated `Util` with callable `keep`/`leak` targets, and `Holder::run`
/// holding the body under test.
///
/// # Panics
///
/// Panics when the assembled program is malformed.
#[must_use]
pub fn program_fixture(build: impl FnOnce(&ProgramIds) -> Cfg) -> (Program, ProgramIds) {
    let ids = ProgramIds::new();
    let cfg = build(&ids);

    let mut b = ProgramBuilder::default();
    let base = b.class("Base", None);
    let conn = b.class("Conn", Some(base));
    let sock = b.class("Sock", Some(base));
    let util = b.class("Util", None);
    let holder = b.class("Holder", None);
    assert_eq!((base, conn, sock), (ids.base, ids.conn, ids.sock));
    assert_eq!((util, holder), (ids.util, ids.holder));
    assert_eq!(b.field(conn, "f"), ids.field_f);
    assert_eq!(b.method_ref(conn, "poke"), ids.poke);
    assert_eq!(b.method_ref(util, "keep"), ids.keep);
    assert_eq!(b.method_ref(util, "leak"), ids.leak);
    assert_eq!(b.method(holder, "run", Some(cfg)), ids.run);
    (b.build(), ids)
}

/// Runs the full driver over a fixture program with `Base` as the root.
///
/// # Panics
///
/// Panics when the analysis run fails.
#[must_use]
pub fn run_on_program(program: &Program, safe: &[&str], filter: Option<&str>) -> InitIndex {
    let _ = env_logger::try_init();
    let config = AnalysisConfig {
        root: "Base".to_owned(),
        safe_escapes: safe.iter().map(|s| (*s).to_owned()).collect(),
        method_filter: filter.map(ToOwned::to_owned),
        num_threads: 2,
    };
    analyze_program(program, &config).expect("analysis run failed")
}

/// Method-level harness for the fixpoint tests: the fixture identities plus
/// a ready-made tracked set ({`Conn`, `Sock`}) and safe set ({`keep`}).
pub struct Fixture {
    pub conn: ClassId,
    pub sock: ClassId,
    pub field_f: FieldId,
    pub poke: MethodRefId,
    pub keep: MethodRefId,
    pub leak: MethodRefId,
    tracked: HashSet<ClassId>,
    safe: HashSet<MethodRefId>,
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

impl Fixture {
    #[must_use]
    pub fn new() -> Self {
        let ids = ProgramIds::new();
        Self {
            conn: ids.conn,
            sock: ids.sock,
            field_f: ids.field_f,
            poke: ids.poke,
            keep: ids.keep,
            leak: ids.leak,
            tracked: [ids.conn, ids.sock].into_iter().collect(),
            safe: [ids.keep].into_iter().collect(),
        }
    }

    #[must_use]
    pub fn analyze_method(&self, cfg: &Cfg) -> MethodSummary {
        let _ = env_logger::try_init();
        let ctx = BlockContext {
            cfg,
            tracked: &self.tracked,
            safe_targets: &self.safe,
        };
        fixpoint::analyze_method(&ctx, "fixture")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn generated_merged_sets_are_wide_enough(merged in arb_merged()) {
            prop_assert!(merged.insns.len() >= 2);
        }
    }
}
