//! Operation-level edits coordinated across the store and the block graph.

use crate::{
    address::{Address, VarnodeData},
    cfg::BlockId,
    error::invariant_error,
    func::Funcdata,
    ir::{OpFlags, OpId, VarnodeId},
    opcodes::OpCode,
    Result,
};

impl Funcdata {
    // ===== factories =====

    /// Allocates a new detached operation at the given instruction address.
    pub fn new_op(&mut self, opcode: OpCode, num_inputs: usize, pc: Address) -> OpId {
        self.store.new_op(opcode, num_inputs, pc)
    }

    /// Creates a binary operation with a fresh unique output and inserts it
    /// immediately before `follow`.
    ///
    /// # Errors
    ///
    /// Propagates linkage and insertion failures.
    pub fn new_op_before(
        &mut self,
        follow: OpId,
        opcode: OpCode,
        in0: VarnodeId,
        in1: Option<VarnodeId>,
    ) -> Result<OpId> {
        let pc = self.store.op(follow).addr();
        let num_inputs = if in1.is_some() { 2 } else { 1 };
        let op = self.store.new_op(opcode, num_inputs, pc);
        let size = self.store.var(in0).size();
        self.store.new_unique_out(size, op)?;
        self.store.set_input(op, in0, 0)?;
        if let Some(second) = in1 {
            self.store.set_input(op, second, 1)?;
        }
        self.op_insert_before(op, follow)?;
        Ok(op)
    }

    /// Creates an INDIRECT guard shadowing `effect_op` over the storage
    /// range `(addr, size)` and inserts it immediately before the effect.
    ///
    /// The guard reads the previous value of the range in slot 0 and an
    /// annotation naming the effect op in slot 1; its output is a fresh
    /// varnode at the same storage.
    ///
    /// # Errors
    ///
    /// Propagates linkage and insertion failures.
    pub fn new_indirect_op(
        &mut self,
        effect_op: OpId,
        addr: Address,
        size: u32,
    ) -> Result<OpId> {
        let pc = self.store.op(effect_op).addr();
        let indirect = self.store.new_op(OpCode::Indirect, 2, pc);
        let prev = self.store.new_varnode(size, addr);
        self.store.set_input(indirect, prev, 0)?;
        let iop = self.store.new_annotation_iop(effect_op);
        self.store.set_input(indirect, iop, 1)?;
        self.store.new_varnode_out(size, addr, indirect)?;
        self.op_insert_before(indirect, effect_op)?;
        Ok(indirect)
    }

    /// Creates an INDIRECT whose output springs into existence at the
    /// effect, with no carried-through input.
    ///
    /// # Errors
    ///
    /// Propagates linkage and insertion failures.
    pub fn new_indirect_creation(
        &mut self,
        effect_op: OpId,
        addr: Address,
        size: u32,
        possible_out: bool,
    ) -> Result<OpId> {
        let pc = self.store.op(effect_op).addr();
        let indirect = self.store.new_op(OpCode::Indirect, 2, pc);
        let zero = self.store.new_constant(size, 0);
        self.store.set_input(indirect, zero, 0)?;
        let iop = self.store.new_annotation_iop(effect_op);
        self.store.set_input(indirect, iop, 1)?;
        let out = self.store.new_varnode_out(size, addr, indirect)?;
        self.store.op_mut(indirect).set_flag(OpFlags::INDIRECT_CREATION);
        {
            let vn = self.store.var_mut(out);
            vn.set_flag(crate::ir::VarnodeFlags::INDIRECT_CREATION);
            if possible_out {
                vn.set_flag(crate::ir::VarnodeFlags::ADDRFORCE);
            }
        }
        self.op_insert_before(indirect, effect_op)?;
        Ok(indirect)
    }

    /// Converts an existing INDIRECT into an indirect creation by cutting
    /// its carried-through input.
    ///
    /// # Errors
    ///
    /// Propagates linkage failures.
    pub fn truncate_indirect(&mut self, indirect: OpId) -> Result<()> {
        let size = self
            .store
            .op(indirect)
            .output()
            .map(|o| self.store.var(o).size())
            .ok_or_else(|| invariant_error!("INDIRECT {indirect} without output"))?;
        let zero = self.store.new_constant(size, 0);
        self.store.set_input(indirect, zero, 0)?;
        self.store.op_mut(indirect).set_flag(OpFlags::INDIRECT_CREATION);
        Ok(())
    }

    // ===== insertion =====

    fn renumber_block(&mut self, block: BlockId) {
        let ops: Vec<OpId> = self.graph.block(block).ops().to_vec();
        for (order, op) in ops.into_iter().enumerate() {
            self.store
                .set_order(op, u32::try_from(order).unwrap_or(u32::MAX));
        }
    }

    /// Inserts a dead operation into a block at a specific position.
    ///
    /// Ordering rules: phi operations sit before all non-phis; a block
    /// terminator is the last operation.
    ///
    /// # Errors
    ///
    /// Fails if the op is already alive or the position violates ordering.
    pub fn op_insert(&mut self, op: OpId, block: BlockId, pos: usize) -> Result<()> {
        if self.store.op(op).is_alive() {
            return Err(invariant_error!("inserting alive op {op}"));
        }
        let is_phi = self.store.op(op).is_phi();
        let is_term = self.store.op(op).is_block_terminator();
        {
            let blk = self.graph.block(block);
            let num_phis = blk.num_phis() as usize;
            let len = blk.ops().len();
            if pos > len {
                return Err(invariant_error!("insert position {pos} beyond block {block}"));
            }
            if is_phi && pos > num_phis {
                return Err(invariant_error!("phi {op} inserted after non-phi region"));
            }
            if !is_phi && pos < num_phis {
                return Err(invariant_error!("non-phi {op} inserted into phi region"));
            }
            if is_term && pos != len {
                return Err(invariant_error!("terminator {op} not inserted last"));
            }
            if !is_phi {
                if let Some(&last) = blk.ops().last() {
                    if self.store.op(last).is_block_terminator() && pos == len {
                        return Err(invariant_error!(
                            "op {op} inserted after terminator in {block}"
                        ));
                    }
                }
            }
        }
        self.graph.block_mut(block).ops.insert(pos, op);
        if is_phi {
            self.graph.block_mut(block).num_phis += 1;
        }
        self.store.mark_alive(op, block);
        self.renumber_block(block);
        Ok(())
    }

    /// Inserts at the top of a block, after any existing phis (or among
    /// them, for a phi).
    ///
    /// # Errors
    ///
    /// Propagates [`Funcdata::op_insert`] failures.
    pub fn op_insert_begin(&mut self, op: OpId, block: BlockId) -> Result<()> {
        let pos = self.graph.block(block).num_phis() as usize;
        self.op_insert(op, block, pos)
    }

    /// Inserts at the bottom of a block, before any terminator.
    ///
    /// # Errors
    ///
    /// Propagates [`Funcdata::op_insert`] failures.
    pub fn op_insert_end(&mut self, op: OpId, block: BlockId) -> Result<()> {
        let len = self.graph.block(block).ops().len();
        let pos = if self.store.op(op).is_block_terminator() {
            len
        } else {
            match self.graph.block(block).last_op() {
                Some(last) if self.store.op(last).is_block_terminator() => len - 1,
                _ => len,
            }
        };
        self.op_insert(op, block, pos)
    }

    /// Inserts immediately before `follow`, clamped out of the phi region
    /// for non-phi ops.
    ///
    /// # Errors
    ///
    /// Fails if `follow` is dead.
    pub fn op_insert_before(&mut self, op: OpId, follow: OpId) -> Result<()> {
        let block = self
            .store
            .op(follow)
            .parent()
            .ok_or_else(|| invariant_error!("insert before dead op {follow}"))?;
        let mut pos = self
            .graph
            .block(block)
            .ops()
            .iter()
            .position(|&o| o == follow)
            .ok_or_else(|| invariant_error!("op {follow} missing from its block"))?;
        if !self.store.op(op).is_phi() {
            pos = pos.max(self.graph.block(block).num_phis() as usize);
        }
        self.op_insert(op, block, pos)
    }

    /// Inserts immediately after `prev`.
    ///
    /// # Errors
    ///
    /// Fails if `prev` is dead.
    pub fn op_insert_after(&mut self, op: OpId, prev: OpId) -> Result<()> {
        let block = self
            .store
            .op(prev)
            .parent()
            .ok_or_else(|| invariant_error!("insert after dead op {prev}"))?;
        let mut pos = self
            .graph
            .block(block)
            .ops()
            .iter()
            .position(|&o| o == prev)
            .ok_or_else(|| invariant_error!("op {prev} missing from its block"))?
            + 1;
        if !self.store.op(op).is_phi() {
            pos = pos.max(self.graph.block(block).num_phis() as usize);
        }
        self.op_insert(op, block, pos)
    }

    /// Detaches an operation from its block back onto the dead list. Its
    /// data-flow stays intact.
    ///
    /// # Errors
    ///
    /// Fails if the op is already dead.
    pub fn op_uninsert(&mut self, op: OpId) -> Result<()> {
        let block = self
            .store
            .op(op)
            .parent()
            .ok_or_else(|| invariant_error!("uninserting dead op {op}"))?;
        let pos = self
            .graph
            .block(block)
            .ops()
            .iter()
            .position(|&o| o == op)
            .ok_or_else(|| invariant_error!("op {op} missing from its block"))?;
        self.graph.block_mut(block).ops.remove(pos);
        if self.store.op(op).is_phi() {
            self.graph.block_mut(block).num_phis -= 1;
        }
        self.store.mark_dead(op);
        self.renumber_block(block);
        Ok(())
    }

    /// Unsets all data-flow of an operation and detaches it from its block.
    ///
    /// # Errors
    ///
    /// Propagates linkage failures.
    pub fn op_unlink(&mut self, op: OpId) -> Result<()> {
        self.store.unset_output(op)?;
        for slot in 0..self.store.op(op).num_inputs() {
            self.store.unset_input(op, slot)?;
        }
        if self.store.op(op).is_alive() {
            self.op_uninsert(op)?;
        }
        Ok(())
    }

    /// Removes an operation entirely, destroying its output varnode and
    /// orphaned operand constants.
    ///
    /// # Errors
    ///
    /// Fails if the output still has readers.
    pub fn op_destroy(&mut self, op: OpId) -> Result<()> {
        if let Some(out) = self.store.op(op).output() {
            if !self.store.var(out).has_no_descend() {
                return Err(invariant_error!(
                    "destroying op {op} whose output still has readers"
                ));
            }
        }
        if self.store.op(op).is_alive() {
            self.op_uninsert(op)?;
        }
        self.store.destroy_op(op)
    }

    // ===== linkage passthrough =====

    /// Sets an operation's opcode. See [`crate::ir::IrStore::set_opcode`].
    pub fn op_set_opcode(&mut self, op: OpId, opcode: OpCode) {
        self.store.set_opcode(op, opcode);
    }

    /// Sets an input slot. See [`crate::ir::IrStore::set_input`].
    ///
    /// # Errors
    ///
    /// Propagates linkage failures.
    pub fn op_set_input(&mut self, op: OpId, vn: VarnodeId, slot: usize) -> Result<()> {
        self.store.set_input(op, vn, slot)
    }

    /// Removes an input slot. See [`crate::ir::IrStore::remove_input`].
    ///
    /// # Errors
    ///
    /// Propagates linkage failures.
    pub fn op_remove_input(&mut self, op: OpId, slot: usize) -> Result<()> {
        self.store.remove_input(op, slot)
    }

    /// Inserts an input slot. See [`crate::ir::IrStore::insert_input`].
    ///
    /// # Errors
    ///
    /// Propagates linkage failures.
    pub fn op_insert_input(&mut self, op: OpId, vn: VarnodeId, slot: usize) -> Result<()> {
        self.store.insert_input(op, vn, slot)
    }

    /// Creates a constant and wires it into the given slot.
    ///
    /// # Errors
    ///
    /// Propagates linkage failures.
    pub fn op_set_constant_input(
        &mut self,
        op: OpId,
        size: u32,
        value: u64,
        slot: usize,
    ) -> Result<()> {
        let c = self.store.new_constant(size, value);
        self.store.set_input(op, c, slot)
    }

    /// Looks up the storage descriptor of an op's input.
    #[must_use]
    pub fn input_storage(&self, op: OpId, slot: usize) -> Option<VarnodeData> {
        self.store
            .op(op)
            .input(slot)
            .map(|vn| self.store.var(vn).storage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_arch;

    #[test]
    fn test_insert_ordering_enforced() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let block = fd.graph.new_block(None);

        let pc = arch.code_address(0x1000);
        let copy = fd.new_op(OpCode::Copy, 1, pc);
        fd.op_insert(copy, block, 0).unwrap();

        // A phi cannot follow a non-phi
        let phi = fd.new_op(OpCode::MultiEqual, 2, pc);
        assert!(fd.op_insert(phi, block, 1).is_err());
        fd.op_insert(phi, block, 0).unwrap();
        assert_eq!(fd.graph.block(block).num_phis(), 1);

        // A terminator goes last, and nothing goes after it
        let ret = fd.new_op(OpCode::Return, 0, pc);
        assert!(fd.op_insert(ret, block, 1).is_err());
        fd.op_insert(ret, block, 2).unwrap();
        let late = fd.new_op(OpCode::Copy, 1, pc);
        assert!(fd.op_insert(late, block, 3).is_err());

        fd.verify_integrity().unwrap();
    }

    #[test]
    fn test_insert_end_respects_branch() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let block = fd.graph.new_block(None);
        let pc = arch.code_address(0x1000);

        let branch = fd.new_op(OpCode::Branch, 1, pc);
        fd.op_insert_end(branch, block).unwrap();

        let copy = fd.new_op(OpCode::Copy, 1, pc);
        fd.op_insert_end(copy, block).unwrap();

        let ops = fd.graph.block(block).ops().to_vec();
        assert_eq!(ops, vec![copy, branch]);
        assert_eq!(fd.store.op(copy).order(), 0);
        assert_eq!(fd.store.op(branch).order(), 1);
    }

    #[test]
    fn test_uninsert_and_reinsert() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let block = fd.graph.new_block(None);
        let pc = arch.code_address(0x1000);

        let op = fd.new_op(OpCode::Copy, 1, pc);
        fd.op_insert_begin(op, block).unwrap();
        assert!(fd.store.op(op).is_alive());

        fd.op_uninsert(op).unwrap();
        assert!(!fd.store.op(op).is_alive());
        assert!(fd.graph.block(block).is_empty());

        fd.op_insert_begin(op, block).unwrap();
        assert!(fd.store.op(op).is_alive());
    }

    #[test]
    fn test_indirect_op_shape() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let block = fd.graph.new_block(None);
        let pc = arch.code_address(0x1000);

        let call = fd.new_op(OpCode::Call, 1, pc);
        fd.op_insert_end(call, block).unwrap();

        let r0 = arch.register_address(0x0);
        let guard = fd.new_indirect_op(call, r0, 8).unwrap();

        // Guard precedes its effect op
        let ops = fd.graph.block(block).ops().to_vec();
        assert_eq!(ops, vec![guard, call]);

        // Slot 1 is an annotation naming the call
        let ann = fd.store.op(guard).input(1).unwrap();
        assert_eq!(fd.store.annotation_target(ann), Some(call));
        assert!(fd.store.var(ann).is_annotation());

        let out = fd.store.op(guard).output().unwrap();
        assert_eq!(fd.store.var(out).storage().addr, r0);
        fd.verify_integrity().unwrap();
    }

    #[test]
    fn test_indirect_creation() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let block = fd.graph.new_block(None);
        let pc = arch.code_address(0x1000);

        let call = fd.new_op(OpCode::Call, 1, pc);
        fd.op_insert_end(call, block).unwrap();

        let ind = fd
            .new_indirect_creation(call, arch.register_address(0x0), 8, true)
            .unwrap();
        assert!(fd.store.op(ind).flags().contains(OpFlags::INDIRECT_CREATION));
        let out = fd.store.op(ind).output().unwrap();
        assert!(fd
            .store
            .var(out)
            .flags()
            .contains(crate::ir::VarnodeFlags::INDIRECT_CREATION));
    }

    #[test]
    fn test_op_destroy_guards_readers() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let block = fd.graph.new_block(None);
        let pc = arch.code_address(0x1000);

        let producer = fd.new_op(OpCode::Copy, 1, pc);
        let out = fd.store.new_unique_out(4, producer).unwrap();
        fd.op_insert_begin(producer, block).unwrap();

        let consumer = fd.new_op(OpCode::Copy, 1, pc);
        fd.store.set_input(consumer, out, 0).unwrap();
        fd.op_insert_end(consumer, block).unwrap();

        assert!(fd.op_destroy(producer).is_err(), "output still read");

        fd.op_destroy(consumer).unwrap();
        fd.op_destroy(producer).unwrap();
        fd.verify_integrity().unwrap();
    }
}
