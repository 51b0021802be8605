//! Method bodies as basic-block graphs.

use anyhow::{ensure, Result};
use derive_more::Display;
#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};

use crate::insn::Insn;
use crate::program::Program;

/// Basic-block index within one method's [`Cfg`].
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
#[display("b{_0}")]
pub struct BlockId(pub u32);

/// Instruction identity within one method: an index into [`Cfg::insns`].
/// Stable for the lifetime of the method, which is what the analyses key
/// their records on.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
#[display("insn@{_0}")]
pub struct InsnId(pub u32);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct BasicBlock {
    pub insns: Vec<InsnId>,
    pub succs: Vec<BlockId>,
}

/// A control-flow graph over an instruction pool. Blocks reference
/// instructions by [`InsnId`]; an instruction belongs to exactly one block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct Cfg {
    pub insns: Vec<Insn>,
    pub blocks: Vec<BasicBlock>,
    pub entry: BlockId,
}

impl Cfg {
    #[must_use]
    pub fn block(&self, id: BlockId) -> &BasicBlock { &self.blocks[id.0 as usize] }

    #[must_use]
    pub fn insn(&self, id: InsnId) -> &Insn { &self.insns[id.0 as usize] }

    /// Predecessor table, indexed by block.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn predecessors(&self) -> Vec<Vec<BlockId>> {
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for (b, block) in self.blocks.iter().enumerate() {
            for succ in &block.succs {
                preds[succ.0 as usize].push(BlockId(b as u32));
            }
        }
        preds
    }

    pub(crate) fn validate(&self, program: &Program) -> Result<()> {
        ensure!(!self.blocks.is_empty(), "CFG has no blocks");
        ensure!(
            (self.entry.0 as usize) < self.blocks.len(),
            "entry block {} out of range",
            self.entry
        );
        for (b, block) in self.blocks.iter().enumerate() {
            for &i in &block.insns {
                ensure!(
                    (i.0 as usize) < self.insns.len(),
                    "block b{b} references out-of-range {i}"
                );
            }
            for &s in &block.succs {
                ensure!(
                    (s.0 as usize) < self.blocks.len(),
                    "block b{b} has out-of-range successor {s}"
                );
            }
        }
        for insn in &self.insns {
            match insn {
                Insn::NewInstance { class, .. } => ensure!(
                    (class.0 as usize) < program.classes.len(),
                    "new-instance of out-of-range {class}"
                ),
                Insn::FieldGet { field, .. } | Insn::FieldPut { field, .. } => ensure!(
                    (field.0 as usize) < program.fields.len(),
                    "field access through out-of-range {field}"
                ),
                Insn::InvokeVirtual { method, args } => {
                    ensure!(
                        (method.0 as usize) < program.method_refs.len(),
                        "invoke of out-of-range {method}"
                    );
                    ensure!(!args.is_empty(), "invoke-virtual without a receiver");
                }
                Insn::InvokeStatic { method, .. } => ensure!(
                    (method.0 as usize) < program.method_refs.len(),
                    "invoke of out-of-range {method}"
                ),
                _ => {}
            }
        }
        Ok(())
    }
}
