//! Iterative fixpoint over a method's CFG.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use dexopt_ir::cfg::{BlockId, Cfg, InsnId};
use log::{trace, warn};

use crate::block::{analyze_block, BlockContext};
use crate::registers::{RegisterSet, Snapshot};
use crate::store::ValueStore;
use crate::tracked::{MergedUses, ObjectUses, Tracked};

/// Everything the analysis of one method produced: finalized construction
/// records keyed by construction instruction, plus the promoted merged
/// values. A loop back-edge that revisits a construction may legitimately
/// leave more than one record on the same instruction.
#[derive(Debug, Default)]
pub struct MethodSummary {
    pub objects: BTreeMap<InsnId, Vec<ObjectUses>>,
    pub merged: Vec<MergedUses>,
}

struct BlockState {
    input: Snapshot,
    output: RegisterSet,
}

/// `consistent_with` is the convergence argument; the cap turns a
/// convergence bug into a diagnostic instead of a hang.
fn visit_cap(cfg: &Cfg) -> usize {
    64 + 32 * cfg.blocks.len()
}

/// Runs the block transfer function over the CFG until every block's input
/// is consistent with the input it was last analysed under.
#[must_use]
pub fn analyze_method(ctx: &BlockContext, label: &str) -> MethodSummary {
    let cfg = ctx.cfg;
    let preds = cfg.predecessors();
    let mut store = ValueStore::default();
    let mut states: HashMap<BlockId, BlockState> = HashMap::new();
    let mut worklist = VecDeque::from([cfg.entry]);
    let mut queued: HashSet<BlockId> = worklist.iter().copied().collect();
    let cap = visit_cap(cfg);
    let mut visits = 0_usize;

    while let Some(block) = worklist.pop_front() {
        queued.remove(&block);
        visits += 1;
        if visits > cap {
            warn!("fixpoint for {label} exceeded {cap} block visits; keeping current records");
            break;
        }

        // in(B): fold of every predecessor's final result. Predecessors
        // without a result yet contribute an empty file, which is what
        // conditionalizes values flowing around a back-edge.
        let mut input = RegisterSet::default();
        let mut seeded = false;
        for pred in &preds[block.0 as usize] {
            let contribution = states
                .get(pred)
                .map_or_else(RegisterSet::default, |state| state.output.clone());
            if seeded {
                input.combine_paths(&contribution, &mut store);
            } else {
                input = contribution;
                seeded = true;
            }
        }

        if let Some(state) = states.get(&block) {
            if input.consistent_with(&state.input, &store) {
                trace!("{label}: {block} already settled");
                continue;
            }
        }

        let snapshot = input.snapshot(&store);
        // The transfer function threads the input file through the block, so
        // `out` already is the sequential composition of in(B) with the
        // block's effects: surviving assignments carry over, cleared
        // registers stay cleared, and the seen set only grows.
        let mut out = input;
        analyze_block(ctx, block, &mut out, &mut store);
        states.insert(
            block,
            BlockState {
                input: snapshot,
                output: out,
            },
        );

        for &succ in &cfg.block(block).succs {
            if queued.insert(succ) {
                worklist.push_back(succ);
            }
        }
    }

    summarize(store)
}

fn summarize(store: ValueStore) -> MethodSummary {
    let mut summary = MethodSummary::default();
    for value in store.into_values() {
        match value {
            Tracked::Object(object) => {
                summary.objects.entry(object.insn).or_default().push(object);
            }
            Tracked::Merged(merged) => summary.merged.push(merged),
        }
    }
    summary
}
