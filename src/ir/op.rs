//! P-code operations and their sequence numbers.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::{address::Address, cfg::BlockId, ir::VarnodeId, opcodes::OpCode};

/// Index of an operation within its function's [`crate::ir::IrStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub u32);

impl OpId {
    /// Returns the slab index.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// A sequence number: the instruction address an operation descends from
/// plus a per-function creation counter that makes it unique.
///
/// Sequence numbers order operations globally; within one basic block the
/// order of the op list is authoritative, with sequence numbers strictly
/// increasing along any initial, untransformed run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SeqNum {
    /// Address of the instruction the operation was lifted from.
    pub pc: Address,
    /// Creation counter, unique within the function.
    pub uniq: u32,
}

impl SeqNum {
    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(pc: Address, uniq: u32) -> Self {
        Self { pc, uniq }
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pc, self.uniq)
    }
}

bitflags! {
    /// Boolean properties of a p-code operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFlags: u32 {
        /// Transient traversal mark.
        const MARK = 1 << 0;
        /// The operation starts a basic block.
        const STARTBASIC = 1 << 1;
        /// The operation is a branch.
        const BRANCH = 1 << 2;
        /// The operation is a call.
        const CALL = 1 << 3;
        /// The output was produced indirectly (through an INDIRECT).
        const INDIRECT_SOURCE = 1 << 4;
        /// A warning comment is attached at this operation.
        const WARNING = 1 << 5;
        /// RETURN op standing in for a processor halt.
        const HALT = 1 << 6;
        /// RETURN op standing in for flow into bad data.
        const BADINSTRUCTION = 1 << 7;
        /// RETURN op standing in for an unimplemented instruction.
        const UNIMPLEMENTED = 1 << 8;
        /// RETURN op after a call that never returns.
        const NORETURN = 1 << 9;
        /// Op requires special propagation handling during type recovery.
        const SPECIALPROP = 1 << 10;
        /// INDIRECT whose output is created, not carried through.
        const INDIRECT_CREATION = 1 << 11;
        /// CBRANCH condition is tested with inverted polarity.
        const BOOLEAN_FLIP = 1 << 12;
        /// CBRANCH falls through on a true condition.
        const FALLTHRU_TRUE = 1 << 13;
    }
}

/// One p-code operation.
///
/// Inputs are held in slots; a slot is `None` only transiently between two
/// linkage edits. The owning basic block (`parent`) is `None` exactly when
/// the operation sits on the store's dead list.
#[derive(Debug, Clone)]
pub struct PcodeOp {
    pub(super) opcode: OpCode,
    pub(super) inputs: Vec<Option<VarnodeId>>,
    pub(super) output: Option<VarnodeId>,
    seq: SeqNum,
    pub(super) parent: Option<BlockId>,
    pub(super) order: u32,
    pub(super) flags: OpFlags,
}

impl PcodeOp {
    /// Creates a detached operation. Only the store calls this.
    pub(super) fn new(opcode: OpCode, num_inputs: usize, seq: SeqNum) -> Self {
        let mut flags = OpFlags::empty();
        if opcode.is_branch() {
            flags |= OpFlags::BRANCH;
        }
        if opcode.is_call() {
            flags |= OpFlags::CALL;
        }
        Self {
            opcode,
            inputs: vec![None; num_inputs],
            output: None,
            seq,
            parent: None,
            order: 0,
            flags,
        }
    }

    /// Returns the opcode.
    #[must_use]
    pub const fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// Returns the sequence number.
    #[must_use]
    pub const fn seq(&self) -> SeqNum {
        self.seq
    }

    /// Returns the instruction address the operation descends from.
    #[must_use]
    pub const fn addr(&self) -> Address {
        self.seq.pc
    }

    /// Returns the number of input slots.
    #[must_use]
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Returns the varnode in the given input slot.
    #[must_use]
    pub fn input(&self, slot: usize) -> Option<VarnodeId> {
        self.inputs.get(slot).copied().flatten()
    }

    /// Returns all input slots.
    #[must_use]
    pub fn inputs(&self) -> &[Option<VarnodeId>] {
        &self.inputs
    }

    /// Returns the slot through which the given varnode is read, if any.
    #[must_use]
    pub fn slot_of(&self, vn: VarnodeId) -> Option<usize> {
        self.inputs.iter().position(|&i| i == Some(vn))
    }

    /// Returns the output varnode, if bound.
    #[must_use]
    pub const fn output(&self) -> Option<VarnodeId> {
        self.output
    }

    /// Returns the owning basic block, or `None` if the op is dead.
    #[must_use]
    pub const fn parent(&self) -> Option<BlockId> {
        self.parent
    }

    /// Returns `true` if the op is attached to a basic block.
    #[must_use]
    pub const fn is_alive(&self) -> bool {
        self.parent.is_some()
    }

    /// Returns the position of the op within its block's op list.
    ///
    /// Only meaningful while the op is alive.
    #[must_use]
    pub const fn order(&self) -> u32 {
        self.order
    }

    /// Returns the property flags.
    #[must_use]
    pub const fn flags(&self) -> OpFlags {
        self.flags
    }

    /// Sets a property flag.
    pub fn set_flag(&mut self, flag: OpFlags) {
        self.flags |= flag;
    }

    /// Clears a property flag.
    pub fn clear_flag(&mut self, flag: OpFlags) {
        self.flags &= !flag;
    }

    /// Returns `true` for the phi pseudo-operation.
    #[must_use]
    pub const fn is_phi(&self) -> bool {
        self.opcode.is_phi()
    }

    /// Returns `true` for branch operations.
    #[must_use]
    pub const fn is_branch(&self) -> bool {
        self.flags.contains(OpFlags::BRANCH)
    }

    /// Returns `true` for call operations.
    #[must_use]
    pub const fn is_call(&self) -> bool {
        self.flags.contains(OpFlags::CALL)
    }

    /// Returns `true` if the operation ends its basic block.
    #[must_use]
    pub const fn is_block_terminator(&self) -> bool {
        self.opcode.is_block_terminator()
    }

    /// Returns `true` if the op's only effect is its output value.
    #[must_use]
    pub const fn is_pure(&self) -> bool {
        self.opcode.is_pure()
    }
}

impl fmt::Display for PcodeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(out) = self.output {
            write!(f, "{out} = ")?;
        }
        write!(f, "{}", self.opcode)?;
        for (i, input) in self.inputs.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            match input {
                Some(vn) => write!(f, " {vn}")?,
                None => write!(f, " _")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SpaceId;

    fn seq(offset: u64, uniq: u32) -> SeqNum {
        SeqNum::new(Address::new(SpaceId(4), offset), uniq)
    }

    #[test]
    fn test_seqnum_ordering() {
        assert!(seq(0x100, 5) < seq(0x101, 0));
        assert!(seq(0x100, 1) < seq(0x100, 2));
    }

    #[test]
    fn test_new_op_flags() {
        let branch = PcodeOp::new(OpCode::CBranch, 2, seq(0x100, 0));
        assert!(branch.is_branch());
        assert!(!branch.is_call());

        let call = PcodeOp::new(OpCode::Call, 1, seq(0x104, 1));
        assert!(call.is_call());
        assert!(!call.is_branch());
    }

    #[test]
    fn test_slot_lookup() {
        let mut op = PcodeOp::new(OpCode::IntAdd, 2, seq(0x100, 0));
        op.inputs[0] = Some(VarnodeId(7));
        op.inputs[1] = Some(VarnodeId(9));
        assert_eq!(op.slot_of(VarnodeId(9)), Some(1));
        assert_eq!(op.slot_of(VarnodeId(8)), None);
    }

    #[test]
    fn test_display() {
        let mut op = PcodeOp::new(OpCode::IntAdd, 2, seq(0x100, 0));
        op.inputs[0] = Some(VarnodeId(1));
        op.inputs[1] = Some(VarnodeId(2));
        op.output = Some(VarnodeId(3));
        assert_eq!(format!("{op}"), "v3 = INT_ADD v1, v2");
    }
}
