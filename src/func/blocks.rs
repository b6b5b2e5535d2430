//! Block-level surgery that keeps phi operands aligned with in-edges.
//!
//! Every edit here pairs a topology change on the block graph with the
//! matching phi-operand slot change, so the invariant "phi slot *i* comes
//! from in-edge *i*" survives branch removal, edge switching, node
//! splitting, and block deletion.

use rustc_hash::FxHashMap;

use crate::{
    address::Address,
    cfg::{BlockId, StructureResult},
    error::invariant_error,
    func::{Funcdata, FunctionFlags},
    ir::{OpId, VarnodeFlags, VarnodeId},
    opcodes::OpCode,
    Result,
};

impl Funcdata {
    /// Returns the leading phi operations of a block.
    fn phis_of(&self, block: BlockId) -> Vec<OpId> {
        self.graph
            .block(block)
            .ops()
            .iter()
            .copied()
            .take_while(|&o| self.store.op(o).is_phi())
            .collect()
    }

    /// Removes phi-operand slot `in_slot` from every phi of `block`.
    fn remove_phi_slots(&mut self, block: BlockId, in_slot: usize) -> Result<()> {
        for phi in self.phis_of(block) {
            self.store.remove_input(phi, in_slot)?;
        }
        Ok(())
    }

    /// Deletes unreachable blocks, destroying their operations.
    ///
    /// The entry block is never deleted. Returns `true` if anything was
    /// removed; a header warning is issued on first removal.
    ///
    /// # Errors
    ///
    /// Propagates linkage failures.
    pub fn remove_unreachable_blocks(&mut self, issue_warning: bool) -> Result<bool> {
        let reachable = self.graph.reachable_set();
        let dead: Vec<BlockId> = self
            .graph
            .iter_blocks()
            .filter(|b| !reachable.contains(b))
            .collect();
        if dead.is_empty() {
            return Ok(false);
        }
        if issue_warning {
            self.warning_header("Removing unreachable code");
        }
        self.set_function_flag(FunctionFlags::BLOCKS_UNREACHABLE);

        // Drop edges first, patching phis of surviving successors
        for &block in &dead {
            while !self.graph.block(block).outs().is_empty() {
                let (to, in_slot) = self.graph.remove_edge(block, 0)?;
                if reachable.contains(&to) {
                    self.remove_phi_slots(to, in_slot)?;
                }
            }
            while !self.graph.block(block).intos().is_empty() {
                let pred = self.graph.block(block).intos()[0];
                let out_slot = self
                    .graph
                    .block(pred)
                    .out_slot_of(block)
                    .ok_or_else(|| invariant_error!("edge bookkeeping broken at {block}"))?;
                self.graph.remove_edge(pred, out_slot)?;
            }
        }

        // Detach and destroy the contained ops; orphaned outputs go with
        // them
        for &block in &dead {
            let ops: Vec<OpId> = self.graph.block(block).ops().to_vec();
            for &op in ops.iter().rev() {
                let out = self.store.op(op).output();
                self.op_unlink(op)?;
                self.store.destroy_op(op)?;
                if let Some(vn) = out {
                    if self.store.var_exists(vn) && self.store.var(vn).has_no_descend() {
                        self.store.destroy_varnode(vn)?;
                    }
                }
            }
            self.graph.block_mut(block).ops.clear();
            self.graph.block_mut(block).num_phis = 0;
            self.graph.delete_block(block)?;
        }
        Ok(true)
    }

    /// Removes a block that only branches unconditionally, rerouting each
    /// in-edge to its lone successor.
    ///
    /// The degenerate self-branching block is an empty infinite loop and
    /// is left alone; returns `false` for it.
    ///
    /// # Errors
    ///
    /// Fails if the block does not match the do-nothing shape.
    pub fn remove_do_nothing_block(&mut self, block: BlockId) -> Result<bool> {
        if block == self.graph.entry() {
            return Ok(false);
        }
        {
            let blk = self.graph.block(block);
            if blk.num_phis() != 0 || blk.ops().len() != 1 || blk.outs().len() != 1 {
                return Err(invariant_error!("{block} is not a do-nothing block"));
            }
        }
        let branch = self.graph.block(block).ops()[0];
        if self.store.op(branch).opcode() != OpCode::Branch {
            return Err(invariant_error!("{block} does not end in a plain branch"));
        }
        let succ = self.graph.block(block).outs()[0];
        if succ == block {
            return Ok(false);
        }

        // Reroute each in-edge to the successor, duplicating the phi
        // operand the successor held for this block's edge
        while !self.graph.block(block).intos().is_empty() {
            let pred = self.graph.block(block).intos()[0];
            let pred_slot = self
                .graph
                .out_slot_for_edge(block, 0, pred)
                .ok_or_else(|| invariant_error!("edge bookkeeping broken at {block}"))?;
            let via_slot = self
                .graph
                .block(succ)
                .in_slot_of(block)
                .ok_or_else(|| invariant_error!("missing edge {block}->{succ}"))?;
            let carried: Vec<(OpId, Option<VarnodeId>)> = self
                .phis_of(succ)
                .into_iter()
                .map(|phi| (phi, self.store.op(phi).input(via_slot)))
                .collect();
            let (_, _, new_slot) = self.graph.switch_edge(pred, pred_slot, succ)?;
            for (phi, value) in carried {
                let value =
                    value.ok_or_else(|| invariant_error!("unset phi slot in {succ}"))?;
                self.store.insert_input(phi, value, new_slot)?;
            }
        }

        let (_, in_slot) = self.graph.remove_edge(block, 0)?;
        self.remove_phi_slots(succ, in_slot)?;
        self.op_unlink(branch)?;
        self.store.destroy_op(branch)?;
        self.graph.block_mut(block).ops.clear();
        self.graph.delete_block(block)?;
        Ok(true)
    }

    /// Removes out-edge `out_slot` of a conditional branch, converting the
    /// branch to unconditional (or removing it when the fall-through
    /// remains).
    ///
    /// # Errors
    ///
    /// Fails if the block does not end in a CBRANCH with two out-edges.
    pub fn remove_branch(&mut self, block: BlockId, out_slot: usize) -> Result<()> {
        let branch = self
            .graph
            .block(block)
            .last_op()
            .ok_or_else(|| invariant_error!("{block} has no operations"))?;
        if self.store.op(branch).opcode() != OpCode::CBranch
            || self.graph.block(block).outs().len() != 2
        {
            return Err(invariant_error!("{block} does not end in a two-way branch"));
        }
        let (to, in_slot) = self.graph.remove_edge(block, out_slot)?;
        self.remove_phi_slots(to, in_slot)?;

        if out_slot == 1 {
            // The taken edge is gone; only fall-through remains
            self.op_unlink(branch)?;
            self.store.destroy_op(branch)?;
        } else {
            // The fall-through is gone; the branch becomes unconditional
            self.store.remove_input(branch, 1)?;
            self.store.set_opcode(branch, OpCode::Branch);
        }
        Ok(())
    }

    /// Inserts a fresh block on out-edge `out_slot` of `block`, ending in
    /// an unconditional branch to the original target.
    ///
    /// # Errors
    ///
    /// Propagates edge and linkage failures.
    pub fn push_branch(&mut self, block: BlockId, out_slot: usize) -> Result<BlockId> {
        let to = self.graph.block(block).outs()[out_slot];
        let in_slot = self
            .graph
            .in_slot_for_edge(block, out_slot, to)
            .ok_or_else(|| invariant_error!("missing edge for slot {out_slot} of {block}"))?;
        let carried: Vec<(OpId, Option<VarnodeId>)> = self
            .phis_of(to)
            .into_iter()
            .map(|phi| (phi, self.store.op(phi).input(in_slot)))
            .collect();

        let new_block = self.graph.new_block(None);
        self.graph.switch_edge(block, out_slot, new_block)?;
        self.remove_phi_slots(to, in_slot)?;

        let target_pc = self
            .graph
            .block(to)
            .range()
            .map_or(self.entry(), |(start, _)| start);
        let branch = self.store.new_op(OpCode::Branch, 1, target_pc);
        let dest = self.store.new_varnode(8, target_pc);
        self.store.var_mut(dest).set_flag(VarnodeFlags::ANNOTATION);
        self.store.set_input(branch, dest, 0)?;
        self.op_insert_end(branch, new_block)?;

        self.graph.add_edge(new_block, to);
        let new_slot = self.graph.block(to).intos().len() - 1;
        for (phi, value) in carried {
            if let Some(value) = value {
                self.store.insert_input(phi, value, new_slot)?;
            }
        }
        Ok(new_block)
    }

    /// Redirects out-edge `out_slot` of `block` to `new_target`, which
    /// must not contain phis yet; phi operands of the old target are
    /// dropped with its in-edge.
    ///
    /// # Errors
    ///
    /// Fails if the new target already has phis.
    pub fn switch_edge(
        &mut self,
        block: BlockId,
        out_slot: usize,
        new_target: BlockId,
    ) -> Result<()> {
        if self.graph.block(new_target).num_phis() != 0 {
            return Err(invariant_error!(
                "cannot switch edge onto {new_target} holding phis"
            ));
        }
        let (old_to, old_in_slot, _) = self.graph.switch_edge(block, out_slot, new_target)?;
        self.remove_phi_slots(old_to, old_in_slot)
    }

    /// Duplicates `block` along in-edge `in_slot`: the predecessor on that
    /// edge gets its own copy of the block so later analyses can
    /// specialize each path.
    ///
    /// Phi operations collapse to COPYs of the operand arriving on the
    /// split edge; successor phis gain an operand for each new edge.
    ///
    /// # Errors
    ///
    /// Propagates linkage failures.
    pub fn node_split(&mut self, block: BlockId, in_slot: usize) -> Result<BlockId> {
        let pred = self.graph.block(block).intos()[in_slot];
        let range = self.graph.block(block).range();
        let clone = self.graph.new_block(range);

        // Clone the op list, rewriting intra-block flow through a map
        let mut mapping: FxHashMap<VarnodeId, VarnodeId> = FxHashMap::default();
        let ops: Vec<OpId> = self.graph.block(block).ops().to_vec();
        for op in ops {
            let src = self.store.op(op);
            if src.is_phi() {
                // The phi picks exactly the split edge's operand
                let operand = src
                    .input(in_slot)
                    .ok_or_else(|| invariant_error!("unset phi slot in {block}"))?;
                let out = src.output().ok_or_else(|| {
                    invariant_error!("phi {op} without output")
                })?;
                let (size, addr) = {
                    let v = self.store.var(out);
                    (v.size(), v.storage().addr)
                };
                let pc = self.store.op(op).addr();
                let copy = self.store.new_op(OpCode::Copy, 1, pc);
                let operand = mapping.get(&operand).copied().unwrap_or(operand);
                self.store.set_input(copy, operand, 0)?;
                let new_out = self.store.new_varnode_out(size, addr, copy)?;
                self.op_insert_end(copy, clone)?;
                mapping.insert(out, new_out);
            } else {
                let dup = self.store.clone_op(op);
                for slot in 0..self.store.op(op).num_inputs() {
                    let Some(input) = self.store.op(op).input(slot) else {
                        continue;
                    };
                    let input = mapping.get(&input).copied().unwrap_or(input);
                    self.store.set_input(dup, input, slot)?;
                }
                if let Some(out) = self.store.op(op).output() {
                    let (size, addr) = {
                        let v = self.store.var(out);
                        (v.size(), v.storage().addr)
                    };
                    let new_out = self.store.new_varnode_out(size, addr, dup)?;
                    mapping.insert(out, new_out);
                }
                self.op_insert_end(dup, clone)?;
            }
        }

        // Move the split in-edge onto the clone
        let pred_slot = self
            .graph
            .out_slot_for_edge(block, in_slot, pred)
            .ok_or_else(|| invariant_error!("edge bookkeeping broken at {block}"))?;
        let (_, removed_slot, _) = self.graph.switch_edge(pred, pred_slot, clone)?;
        self.remove_phi_slots(block, removed_slot)?;

        // Duplicate out-edges; successor phis gain operands mapped through
        // the clone
        let outs: Vec<BlockId> = self.graph.block(block).outs().to_vec();
        for (out_slot, succ) in outs.into_iter().enumerate() {
            let orig_in_slot = self
                .graph
                .in_slot_for_edge(block, out_slot, succ)
                .ok_or_else(|| invariant_error!("missing edge {block}->{succ}"))?;
            let carried: Vec<(OpId, Option<VarnodeId>)> = self
                .phis_of(succ)
                .into_iter()
                .map(|phi| (phi, self.store.op(phi).input(orig_in_slot)))
                .collect();
            self.graph.add_edge(clone, succ);
            let new_slot = self.graph.block(succ).intos().len() - 1;
            for (phi, value) in carried {
                let value =
                    value.ok_or_else(|| invariant_error!("unset phi slot in {succ}"))?;
                let value = mapping.get(&value).copied().unwrap_or(value);
                self.store.insert_input(phi, value, new_slot)?;
            }
        }
        Ok(clone)
    }

    /// Merges `block` with its lone successor when that successor has no
    /// other predecessors and no phis.
    ///
    /// # Errors
    ///
    /// Fails if the shapes do not allow splicing.
    pub fn splice_block(&mut self, block: BlockId) -> Result<()> {
        let succ = {
            let blk = self.graph.block(block);
            if blk.outs().len() != 1 {
                return Err(invariant_error!("{block} has multiple successors"));
            }
            blk.outs()[0]
        };
        if succ == block {
            return Err(invariant_error!("cannot splice {block} into itself"));
        }
        {
            let sblk = self.graph.block(succ);
            if sblk.intos().len() != 1 || sblk.num_phis() != 0 {
                return Err(invariant_error!("{succ} cannot be spliced into {block}"));
            }
        }

        // Drop the connecting edge and any trailing unconditional branch
        self.graph.remove_edge(block, 0)?;
        if let Some(last) = self.graph.block(block).last_op() {
            if self.store.op(last).opcode() == OpCode::Branch {
                self.op_unlink(last)?;
                self.store.destroy_op(last)?;
            }
        }

        // Move the successor's ops over
        let ops: Vec<OpId> = self.graph.block(succ).ops().to_vec();
        for op in ops {
            self.op_uninsert(op)?;
            self.op_insert_end(op, block)?;
        }

        // Transfer out-edges, preserving successor-phi operands
        while !self.graph.block(succ).outs().is_empty() {
            let to = self.graph.block(succ).outs()[0];
            let in_slot = self
                .graph
                .in_slot_for_edge(succ, 0, to)
                .ok_or_else(|| invariant_error!("missing edge {succ}->{to}"))?;
            let carried: Vec<(OpId, Option<VarnodeId>)> = self
                .phis_of(to)
                .into_iter()
                .map(|phi| (phi, self.store.op(phi).input(in_slot)))
                .collect();
            self.graph.remove_edge(succ, 0)?;
            self.remove_phi_slots(to, in_slot)?;
            self.graph.add_edge(block, to);
            let new_slot = self.graph.block(to).intos().len() - 1;
            for (phi, value) in carried {
                if let Some(value) = value {
                    self.store.insert_input(phi, value, new_slot)?;
                }
            }
        }

        // Extend the covered range
        let merged = match (self.graph.block(block).range(), self.graph.block(succ).range()) {
            (Some((a, _)), Some((_, b))) => Some((a, b)),
            (r, None) | (None, r) => r,
        };
        self.graph.block_mut(block).range = merged;
        self.graph.delete_block(succ)?;
        Ok(())
    }

    /// Structures the control flow into a region tree.
    ///
    /// # Errors
    ///
    /// Propagates the structuring iteration cap.
    pub fn structure_control_flow(&mut self) -> Result<StructureResult> {
        let cap = self.limits().max_structure_iterations;
        crate::cfg::structure_blocks(&mut self.graph, cap)
    }

    /// Returns the instruction address a block covers, for diagnostics.
    #[must_use]
    pub fn block_address(&self, block: BlockId) -> Address {
        self.graph
            .block(block)
            .range()
            .map_or(self.entry(), |(start, _)| start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_arch;

    /// Builds a diamond with a phi at the join reading distinct constants.
    fn diamond_with_phi() -> (Funcdata, [BlockId; 4], OpId) {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let b0 = fd.graph.new_block(Some((arch.code_address(0x1000), arch.code_address(0x1004))));
        let b1 = fd.graph.new_block(Some((arch.code_address(0x1004), arch.code_address(0x1008))));
        let b2 = fd.graph.new_block(Some((arch.code_address(0x1008), arch.code_address(0x100c))));
        let b3 = fd.graph.new_block(Some((arch.code_address(0x100c), arch.code_address(0x1010))));
        fd.graph.add_edge(b0, b1);
        fd.graph.add_edge(b0, b2);
        fd.graph.add_edge(b1, b3);
        fd.graph.add_edge(b2, b3);

        let pc = arch.code_address(0x100c);
        let phi = fd.store.new_op(OpCode::MultiEqual, 2, pc);
        let c1 = fd.store.new_constant(4, 1);
        let c2 = fd.store.new_constant(4, 2);
        fd.store.set_input(phi, c1, 0).unwrap();
        fd.store.set_input(phi, c2, 1).unwrap();
        fd.store
            .new_varnode_out(4, arch.register_address(0x10), phi)
            .unwrap();
        fd.op_insert_begin(phi, b3).unwrap();
        (fd, [b0, b1, b2, b3], phi)
    }

    #[test]
    fn test_remove_branch_patches_phi() {
        let (mut fd, [b0, _b1, _b2, b3], phi) = diamond_with_phi();
        let pc = fd.entry();
        let cbranch = fd.store.new_op(OpCode::CBranch, 2, pc);
        let dest = fd.store.new_constant(8, 0x1008);
        let cond = fd.store.new_varnode(1, fd.arch().register_address(0x20));
        fd.store.set_input(cbranch, dest, 0).unwrap();
        fd.store.set_input(cbranch, cond, 1).unwrap();
        fd.op_insert_end(cbranch, b0).unwrap();

        // Removing the taken edge (slot 1, to b2) strands b2; the phi
        // operand goes with the unreachable block
        fd.remove_branch(b0, 1).unwrap();
        assert_eq!(fd.graph.block(b0).outs().len(), 1);
        assert_eq!(fd.store.op(phi).num_inputs(), 2);

        fd.remove_unreachable_blocks(false).unwrap();
        assert_eq!(fd.store.op(phi).num_inputs(), 1);
        assert_eq!(fd.graph.block(b3).intos().len(), 1);
        fd.verify_integrity().unwrap();
    }

    #[test]
    fn test_unreachable_removal_cascades() {
        let (mut fd, [b0, b1, b2, b3], phi) = diamond_with_phi();
        // Cut b0→b2 directly in the graph, stranding b2
        let out_slot = fd.graph.block(b0).out_slot_of(b2).unwrap();
        let (_, in_slot) = fd.graph.remove_edge(b0, out_slot).unwrap();
        assert_eq!(in_slot, 0);

        let removed = fd.remove_unreachable_blocks(true).unwrap();
        assert!(removed);
        assert!(!fd.graph.block_exists(b2));
        assert!(fd.graph.block_exists(b1));
        // The phi lost the operand arriving from b2
        assert_eq!(fd.store.op(phi).num_inputs(), 1);
        assert!(fd.flags().contains(FunctionFlags::BLOCKS_UNREACHABLE));
        assert!(!fd.warnings().is_empty());
        let _ = b3;
        fd.verify_integrity().unwrap();
    }

    #[test]
    fn test_do_nothing_block_removal() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let b0 = fd.graph.new_block(None);
        let mid = fd.graph.new_block(None);
        let b2 = fd.graph.new_block(None);
        fd.graph.add_edge(b0, mid);
        fd.graph.add_edge(mid, b2);

        let pc = arch.code_address(0x1004);
        let branch = fd.store.new_op(OpCode::Branch, 1, pc);
        let dest = fd.store.new_constant(8, 0x1008);
        fd.store.set_input(branch, dest, 0).unwrap();
        fd.op_insert_end(branch, mid).unwrap();

        assert!(fd.remove_do_nothing_block(mid).unwrap());
        assert!(!fd.graph.block_exists(mid));
        assert_eq!(fd.graph.block(b0).outs(), &[b2]);
        assert_eq!(fd.graph.block(b2).intos(), &[b0]);
        fd.verify_integrity().unwrap();
    }

    #[test]
    fn test_do_nothing_self_loop_kept() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let b0 = fd.graph.new_block(None);
        let spin = fd.graph.new_block(None);
        fd.graph.add_edge(b0, spin);
        fd.graph.add_edge(spin, spin);

        let pc = arch.code_address(0x1004);
        let branch = fd.store.new_op(OpCode::Branch, 1, pc);
        let dest = fd.store.new_constant(8, 0x1004);
        fd.store.set_input(branch, dest, 0).unwrap();
        fd.op_insert_end(branch, spin).unwrap();

        assert!(!fd.remove_do_nothing_block(spin).unwrap());
        assert!(fd.graph.block_exists(spin));
    }

    #[test]
    fn test_node_split_clones_ops_and_phis() {
        let (mut fd, [_b0, b1, b2, b3], phi) = diamond_with_phi();
        // Append a reader of the phi inside b3
        let out = fd.store.op(phi).output().unwrap();
        let pc = fd.entry();
        let ret = fd.store.new_op(OpCode::Return, 1, pc);
        fd.store.set_input(ret, out, 0).unwrap();
        fd.op_insert_end(ret, b3).unwrap();

        let clone = fd.node_split(b3, 0).unwrap();

        // Original lost the b1 edge; clone owns it
        assert_eq!(fd.graph.block(b3).intos(), &[b2]);
        assert_eq!(fd.graph.block(clone).intos(), &[b1]);
        // Phi in original shrank; the clone turned it into a COPY
        assert_eq!(fd.store.op(phi).num_inputs(), 1);
        let clone_ops = fd.graph.block(clone).ops().to_vec();
        assert_eq!(clone_ops.len(), 2);
        assert_eq!(fd.store.op(clone_ops[0]).opcode(), OpCode::Copy);
        assert_eq!(fd.store.op(clone_ops[1]).opcode(), OpCode::Return);
        fd.verify_integrity().unwrap();
    }

    #[test]
    fn test_splice_block() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let b0 = fd
            .graph
            .new_block(Some((arch.code_address(0x1000), arch.code_address(0x1004))));
        let b1 = fd
            .graph
            .new_block(Some((arch.code_address(0x1004), arch.code_address(0x1008))));
        let b2 = fd.graph.new_block(None);
        fd.graph.add_edge(b0, b1);
        fd.graph.add_edge(b1, b2);

        let pc = arch.code_address(0x1000);
        let copy = fd.store.new_op(OpCode::Copy, 1, pc);
        let c = fd.store.new_constant(4, 3);
        fd.store.set_input(copy, c, 0).unwrap();
        fd.store.new_unique_out(4, copy).unwrap();
        fd.op_insert_end(copy, b0).unwrap();

        let pc2 = arch.code_address(0x1004);
        let ret = fd.store.new_op(OpCode::Return, 0, pc2);
        fd.op_insert_end(ret, b1).unwrap();

        fd.splice_block(b0).unwrap();
        assert!(!fd.graph.block_exists(b1));
        assert_eq!(fd.graph.block(b0).ops().len(), 2);
        assert_eq!(fd.graph.block(b0).outs(), &[b2]);
        assert_eq!(
            fd.graph.block(b0).range(),
            Some((arch.code_address(0x1000), arch.code_address(0x1008)))
        );
        fd.verify_integrity().unwrap();
    }
}
