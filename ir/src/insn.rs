//! Instruction categories inspected by the analyses.
//!
//! The source bytecode carries hundreds of opcodes; the analyses only
//! distinguish the categories below and treat everything else as an opaque
//! [`Insn::Other`] that clobbers its destination register.

#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};

use crate::program::{ClassId, FieldId, MethodRefId, Reg};

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub enum Insn {
    /// `new-instance vA, class@C`: fresh instance of `class` into `dest`.
    NewInstance { dest: Reg, class: ClassId },
    /// `move vA, vB`
    Move { dest: Reg, src: Reg },
    /// `iget vA, vB, field@C`: read `object.field` into `dest`.
    FieldGet { dest: Reg, object: Reg, field: FieldId },
    /// `iput vA, vB, field@C`: write `src` into `object.field`.
    FieldPut { src: Reg, object: Reg, field: FieldId },
    /// `invoke-virtual {args}, method@C`: `args[0]` is the receiver.
    InvokeVirtual { method: MethodRefId, args: Vec<Reg> },
    /// `invoke-static {args}, method@C`
    InvokeStatic { method: MethodRefId, args: Vec<Reg> },
    /// `return` (`src: None` for `return-void`)
    Return { src: Option<Reg> },
    /// `aput vA, vB, vC`: store `src` into `array[index]`.
    ArrayPut { src: Reg, array: Reg, index: Reg },
    /// `if-eqz vA`: branch on `src` being null; targets live in the block
    /// successors.
    IfZero { src: Reg },
    /// Any other opcode; `dest` is clobbered if present.
    Other { dest: Option<Reg> },
}

impl Insn {
    /// The register this instruction defines, if any.
    #[must_use]
    pub fn dest(&self) -> Option<Reg> {
        match self {
            Insn::NewInstance { dest, .. }
            | Insn::Move { dest, .. }
            | Insn::FieldGet { dest, .. } => Some(*dest),
            Insn::Other { dest } => *dest,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(Insn::NewInstance { dest: 3, class: ClassId(0) } => Some(3))]
    #[test_case(Insn::Move { dest: 1, src: 2 } => Some(1))]
    #[test_case(Insn::FieldGet { dest: 7, object: 1, field: FieldId(0) } => Some(7))]
    #[test_case(Insn::FieldPut { src: 7, object: 1, field: FieldId(0) } => None)]
    #[test_case(Insn::Return { src: Some(1) } => None)]
    #[test_case(Insn::Other { dest: Some(9) } => Some(9))]
    #[test_case(Insn::Other { dest: None } => None)]
    fn defined_registers(insn: Insn) -> Option<Reg> {
        insn.dest()
    }
}
