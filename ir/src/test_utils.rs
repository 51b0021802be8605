#![cfg(any(feature = "test", test))]
//! Builders for assembling small programs by hand in tests and benches.

use crate::cfg::{BasicBlock, BlockId, Cfg, InsnId};
use crate::insn::Insn;
use crate::program::{Class, ClassId, FieldId, FieldRef, Method, MethodId, MethodRef,
                     MethodRefId, Program};

#[derive(Debug, Default)]
pub struct ProgramBuilder {
    program: Program,
}

#[allow(clippy::cast_possible_truncation)]
impl ProgramBuilder {
    pub fn class(&mut self, name: &str, superclass: Option<ClassId>) -> ClassId {
        self.program.classes.push(Class {
            name: name.to_owned(),
            superclass,
            methods: Vec::new(),
        });
        ClassId(self.program.classes.len() as u32 - 1)
    }

    pub fn field(&mut self, owner: ClassId, name: &str) -> FieldId {
        self.program.fields.push(FieldRef {
            owner,
            name: name.to_owned(),
        });
        FieldId(self.program.fields.len() as u32 - 1)
    }

    pub fn method_ref(&mut self, owner: ClassId, name: &str) -> MethodRefId {
        self.program.method_refs.push(MethodRef {
            owner,
            name: name.to_owned(),
        });
        MethodRefId(self.program.method_refs.len() as u32 - 1)
    }

    pub fn method(&mut self, owner: ClassId, name: &str, code: Option<Cfg>) -> MethodId {
        self.program.methods.push(Method {
            owner,
            name: name.to_owned(),
            code,
        });
        let id = MethodId(self.program.methods.len() as u32 - 1);
        self.program.classes[owner.0 as usize].methods.push(id);
        id
    }

    /// # Panics
    ///
    /// Panics when the assembled program fails [`Program::validate`].
    #[must_use]
    pub fn build(self) -> Program {
        self.program
            .validate()
            .expect("builder assembled a malformed program");
        self.program
    }

    /// Skips validation, for tests that construct deliberately broken input.
    #[must_use]
    pub fn build_unchecked(self) -> Program { self.program }
}

#[derive(Debug, Default)]
pub struct CfgBuilder {
    cfg: Cfg,
}

#[allow(clippy::cast_possible_truncation)]
impl CfgBuilder {
    /// Appends a block; the first block added is the entry. Successors are
    /// given as raw block indexes, which may be forward references.
    pub fn block(&mut self, insns: Vec<Insn>, succs: &[u32]) -> BlockId {
        let base = self.cfg.insns.len() as u32;
        let ids = (0..insns.len() as u32).map(|i| InsnId(base + i)).collect();
        self.cfg.insns.extend(insns);
        self.cfg.blocks.push(BasicBlock {
            insns: ids,
            succs: succs.iter().copied().map(BlockId).collect(),
        });
        BlockId(self.cfg.blocks.len() as u32 - 1)
    }

    #[must_use]
    pub fn build(self) -> Cfg { self.cfg }
}

/// Single straight-line block.
#[must_use]
pub fn linear(insns: Vec<Insn>) -> Cfg {
    let mut b = CfgBuilder::default();
    b.block(insns, &[]);
    b.build()
}

/// `head -> {left, right} -> tail` diamond.
#[must_use]
pub fn diamond(head: Vec<Insn>, left: Vec<Insn>, right: Vec<Insn>, tail: Vec<Insn>) -> Cfg {
    let mut b = CfgBuilder::default();
    b.block(head, &[1, 2]);
    b.block(left, &[3]);
    b.block(right, &[3]);
    b.block(tail, &[]);
    b.build()
}
