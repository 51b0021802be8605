//! Program-level driver: hierarchy walk, scheduling, reduction.

use std::collections::HashSet;

use anyhow::{anyhow, Result};
use dexopt_ir::program::{ClassId, MethodId, MethodRefId, Program};
use dexopt_queue::{WorkQueue, WorkerState};
use log::debug;

use crate::block::BlockContext;
use crate::fixpoint::analyze_method;
use crate::init::InitIndex;

/// The whole configuration surface of the analysis.
#[derive(Clone, Debug)]
pub struct AnalysisConfig {
    /// Name of the common parent class; instances of its proper descendants
    /// are tracked.
    pub root: String,
    /// `Owner::name` call targets that do not leak their arguments.
    pub safe_escapes: Vec<String>,
    /// When set, only methods with this name are analysed.
    pub method_filter: Option<String>,
    pub num_threads: usize,
}

/// Runs the instance-tracking analysis over every method of the program and
/// reduces the per-method results into one index.
///
/// # Errors
///
/// Fails when the root class does not exist or the thread count is zero.
pub fn analyze_program(program: &Program, config: &AnalysisConfig) -> Result<InitIndex> {
    let root = program
        .class_by_name(&config.root)
        .ok_or_else(|| anyhow!("root class {} not found in program", config.root))?;
    let tracked = program.descendants_of(root);
    let safe_targets: HashSet<MethodRefId> = config
        .safe_escapes
        .iter()
        .filter_map(|target| {
            let resolved = program.resolve_method_ref(target);
            if resolved.is_none() {
                debug!("safe-escape target {target} is not referenced by this program");
            }
            resolved
        })
        .collect();
    debug!(
        "tracking {} descendant(s) of {} across {} method(s)",
        tracked.len(),
        config.root,
        program.methods.len()
    );

    let mapper = move |_: &mut WorkerState<MethodId, ()>, method_id: MethodId| {
        analyze_one(program, &tracked, &safe_targets, method_id)
    };
    let mut queue = WorkQueue::map_reduce(config.num_threads, mapper, InitIndex::absorb)?;
    #[allow(clippy::cast_possible_truncation)]
    for (id, method) in program.methods.iter().enumerate() {
        if method.code.is_none() {
            continue;
        }
        if let Some(filter) = &config.method_filter {
            if &method.name != filter {
                continue;
            }
        }
        queue.add_item(MethodId(id as u32));
    }
    Ok(queue.run_all(InitIndex::default()))
}

fn analyze_one(
    program: &Program,
    tracked: &HashSet<ClassId>,
    safe_targets: &HashSet<MethodRefId>,
    method_id: MethodId,
) -> InitIndex {
    let method = program.method(method_id);
    let Some(cfg) = &method.code else {
        return InitIndex::default();
    };
    let label = format!("{}::{}", program.class(method.owner).name, method.name);
    let ctx = BlockContext {
        cfg,
        tracked,
        safe_targets,
    };
    let summary = analyze_method(&ctx, &label);

    let mut index = InitIndex::default();
    for (_, records) in summary.objects {
        for object in records {
            index.update_object(method.owner, method_id, object);
        }
    }
    for merged in summary.merged {
        index.update_merged(method_id, merged);
    }
    index
}
