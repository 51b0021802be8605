use std::collections::HashSet;

use criterion::{criterion_group, criterion_main, Criterion};
use dexopt_analysis::block::BlockContext;
use dexopt_analysis::fixpoint::analyze_method;
use dexopt_ir::cfg::Cfg;
use dexopt_ir::insn::Insn;
use dexopt_ir::program::{ClassId, MethodRefId};
use dexopt_ir::test_utils::CfgBuilder;

/// A chain of diamonds, each constructing into the same register, with a
/// back edge from the last diamond to the first. Every join promotes, and
/// the back edge forces a second fixpoint round.
fn diamond_chain(rounds: u32) -> Cfg {
    let mut b = CfgBuilder::default();
    for i in 0..rounds {
        let base = 4 * i;
        b.block(vec![Insn::IfZero { src: 0 }], &[base + 1, base + 2]);
        b.block(
            vec![Insn::NewInstance { dest: 1, class: ClassId(1) }],
            &[base + 3],
        );
        b.block(
            vec![Insn::NewInstance { dest: 1, class: ClassId(2) }],
            &[base + 3],
        );
        b.block(
            vec![Insn::InvokeVirtual { method: MethodRefId(0), args: vec![1] }],
            &[base + 4],
        );
    }
    b.block(vec![Insn::IfZero { src: 0 }], &[0, 4 * rounds + 1]);
    b.block(vec![Insn::Return { src: Some(1) }], &[]);
    b.build()
}

fn bench_fixpoint(c: &mut Criterion) {
    let tracked: HashSet<ClassId> = [ClassId(1), ClassId(2)].into_iter().collect();
    let safe: HashSet<MethodRefId> = HashSet::new();
    let cfg = diamond_chain(32);
    let ctx = BlockContext {
        cfg: &cfg,
        tracked: &tracked,
        safe_targets: &safe,
    };
    c.bench_function("fixpoint_diamond_chain_32", |b| {
        b.iter(|| analyze_method(&ctx, "bench"));
    });
}

criterion_group!(benches, bench_fixpoint);
criterion_main!(benches);
