//! Single-basic-block transfer function.

use std::collections::HashSet;

use dexopt_ir::cfg::{BlockId, Cfg};
use dexopt_ir::insn::Insn;
use dexopt_ir::program::{ClassId, MethodRefId};
use log::trace;

use crate::registers::RegisterSet;
use crate::store::{ValueId, ValueStore};
use crate::uses::Escapes;

/// Immutable context shared by every block of one method's analysis.
pub struct BlockContext<'a> {
    pub cfg: &'a Cfg,
    /// Classes whose instances are tracked: the proper descendants of the
    /// configured root.
    pub tracked: &'a HashSet<ClassId>,
    /// Call targets known not to leak their arguments.
    pub safe_targets: &'a HashSet<MethodRefId>,
}

/// Runs one block over the register file, updating the usage records of
/// every tracked value the instructions touch. Destination registers are
/// reset before the instruction's own definition takes effect, so an
/// overwritten value survives only through the seen set.
#[allow(clippy::too_many_lines)]
pub fn analyze_block(
    ctx: &BlockContext,
    block: BlockId,
    regs: &mut RegisterSet,
    store: &mut ValueStore,
) {
    for &insn_id in &ctx.cfg.block(block).insns {
        match ctx.cfg.insn(insn_id) {
            Insn::NewInstance { dest, class } => {
                regs.clear(*dest);
                if ctx.tracked.contains(class) {
                    let value = store.add_init(insn_id, *class);
                    regs.insert(*dest, value);
                    trace!("{insn_id}: tracked instance of {class} into v{dest}");
                }
            }
            Insn::Move { dest, src } => {
                let moved = regs.get(*src);
                regs.clear(*dest);
                if let Some(value) = moved {
                    regs.insert(*dest, value);
                }
            }
            Insn::FieldGet { dest, object, field } => {
                if let Some(value) = regs.get(*object) {
                    let created = store.get(value).created();
                    store
                        .get_mut(value)
                        .uses_mut()
                        .fields_read
                        .record(*field, created);
                }
                // Loading a tracked-typed field is not a construction site.
                regs.clear(*dest);
            }
            Insn::FieldPut { src, object, field } => {
                if let Some(value) = regs.get(*src) {
                    let created = store.get(value).created();
                    let uses = store.get_mut(value).uses_mut();
                    uses.fields_set.record(*field, *src, insn_id, created);
                    uses.escapes.record_field(*field, insn_id);
                } else if let Some(value) = regs.get(*object) {
                    let created = store.get(value).created();
                    store
                        .get_mut(value)
                        .uses_mut()
                        .fields_set
                        .record(*field, *src, insn_id, created);
                }
            }
            Insn::InvokeVirtual { method, args } => {
                if let Some(&receiver) = args.first() {
                    if let Some(value) = regs.get(receiver) {
                        let created = store.get(value).created();
                        store
                            .get_mut(value)
                            .uses_mut()
                            .method_calls
                            .record(*method, insn_id, receiver, created);
                    }
                }
                for &arg in args.iter().skip(1) {
                    if let Some(value) = regs.get(arg) {
                        escape_channel(store, value, ctx.safe_targets.contains(method))
                            .record_virtual(*method, insn_id, arg);
                    }
                }
            }
            Insn::InvokeStatic { method, args } => {
                for &arg in args {
                    if let Some(value) = regs.get(arg) {
                        escape_channel(store, value, ctx.safe_targets.contains(method))
                            .record_static(*method, insn_id, arg);
                    }
                }
            }
            Insn::Return { src: Some(src) } => {
                if let Some(value) = regs.get(*src) {
                    store
                        .get_mut(value)
                        .uses_mut()
                        .escapes
                        .via_return
                        .insert(insn_id);
                }
            }
            Insn::ArrayPut { src, .. } => {
                if let Some(value) = regs.get(*src) {
                    store
                        .get_mut(value)
                        .uses_mut()
                        .escapes
                        .via_array_write
                        .insert(insn_id);
                }
            }
            Insn::IfZero { src } => {
                if let Some(value) = regs.get(*src) {
                    store.mark_nullable(value);
                }
            }
            Insn::Return { src: None } => {}
            Insn::Other { dest } => {
                if let Some(dest) = dest {
                    regs.clear(*dest);
                }
            }
        }
    }
}

fn escape_channel(store: &mut ValueStore, value: ValueId, safe: bool) -> &mut Escapes {
    let uses = store.get_mut(value).uses_mut();
    if safe {
        &mut uses.safe_escapes
    } else {
        &mut uses.escapes
    }
}
