//! Varnode-level utilities: wholesale replacement, known-zero masks,
//! type recovery, cast insertion, and dead-code elimination.

use crate::{
    func::{Funcdata, FunctionFlags},
    ir::{size_mask, OpId, VarnodeFlags, VarnodeId},
    opcodes::OpCode,
    types::Metatype,
    Result,
};

/// Fills every bit at and below the highest set bit.
const fn covering_mask(value: u64) -> u64 {
    let mut res = value;
    res |= res >> 1;
    res |= res >> 2;
    res |= res >> 4;
    res |= res >> 8;
    res |= res >> 16;
    res |= res >> 32;
    res
}

impl Funcdata {
    /// Rewrites every read of `vn` to read `replacement` instead.
    ///
    /// # Errors
    ///
    /// Propagates linkage failures.
    pub fn total_replace(&mut self, vn: VarnodeId, replacement: VarnodeId) -> Result<()> {
        let readers: Vec<OpId> = self.store.var(vn).descend().to_vec();
        for reader in readers {
            for slot in 0..self.store.op(reader).num_inputs() {
                if self.store.op(reader).input(slot) == Some(vn) {
                    self.store.set_input(reader, replacement, slot)?;
                }
            }
        }
        Ok(())
    }

    /// Rewrites every read of `vn` to read a fresh constant of the given
    /// value; each reader gets its own constant varnode.
    ///
    /// # Errors
    ///
    /// Propagates linkage failures.
    pub fn total_replace_constant(&mut self, vn: VarnodeId, value: u64) -> Result<()> {
        let size = self.store.var(vn).size();
        let readers: Vec<OpId> = self.store.var(vn).descend().to_vec();
        for reader in readers {
            for slot in 0..self.store.op(reader).num_inputs() {
                if self.store.op(reader).input(slot) == Some(vn) {
                    let c = self.store.new_constant(size, value);
                    self.store.set_input(reader, c, slot)?;
                }
            }
        }
        Ok(())
    }

    /// Transfer function: the non-zero mask an op's output can carry given
    /// its input masks.
    fn nzmask_local(&self, op: OpId) -> u64 {
        let store = &self.store;
        let o = store.op(op);
        let out_size = o
            .output()
            .map_or(8, |out| store.var(out).size());
        let full = size_mask(out_size);
        let in_mask = |slot: usize| -> u64 {
            o.input(slot).map_or(full, |vn| store.var(vn).nzmask())
        };
        let masked = |m: u64| m & full;

        if o.opcode().is_boolean_output() {
            return 1;
        }
        match o.opcode() {
            OpCode::Copy | OpCode::Cast => masked(in_mask(0)),
            OpCode::IntAnd | OpCode::BoolAnd => masked(in_mask(0) & in_mask(1)),
            OpCode::IntOr | OpCode::IntXor | OpCode::BoolOr | OpCode::BoolXor => {
                masked(in_mask(0) | in_mask(1))
            }
            OpCode::IntAdd => {
                // Carries smear upward one extra bit past the widest input
                let m = in_mask(0) | in_mask(1);
                if m == 0 {
                    0
                } else {
                    masked((covering_mask(m) << 1) | 1)
                }
            }
            OpCode::IntSub | OpCode::IntMult => {
                if in_mask(0) == 0 && in_mask(1) == 0 {
                    0
                } else {
                    full
                }
            }
            OpCode::IntZExt => masked(in_mask(0)),
            OpCode::IntSExt => {
                let in_size = o
                    .input(0)
                    .map_or(out_size, |vn| store.var(vn).size());
                let sign = 1u64 << (in_size * 8 - 1).min(63);
                if in_mask(0) & sign != 0 {
                    full
                } else {
                    masked(in_mask(0))
                }
            }
            OpCode::SubPiece => {
                let shift = o
                    .input(1)
                    .and_then(|vn| store.var(vn).constant_value())
                    .unwrap_or(0);
                masked(in_mask(0).checked_shr(shift as u32 * 8).unwrap_or(0))
            }
            OpCode::Piece => {
                let low_size = o
                    .input(1)
                    .map_or(0, |vn| store.var(vn).size());
                masked(
                    in_mask(0)
                        .checked_shl(low_size * 8)
                        .unwrap_or(0)
                        | in_mask(1),
                )
            }
            OpCode::IntLeft => match o.input(1).and_then(|vn| store.var(vn).constant_value()) {
                Some(sa) => masked(in_mask(0).checked_shl(sa as u32).unwrap_or(0)),
                None => full,
            },
            OpCode::IntRight => match o.input(1).and_then(|vn| store.var(vn).constant_value()) {
                Some(sa) => masked(in_mask(0).checked_shr(sa as u32).unwrap_or(0)),
                None => full,
            },
            OpCode::MultiEqual => {
                let mut m = 0;
                for slot in 0..o.num_inputs() {
                    m |= in_mask(slot);
                }
                masked(m)
            }
            OpCode::PopCount => {
                let in_bits = o
                    .input(0)
                    .map_or(64, |vn| u64::from(store.var(vn).size()) * 8);
                masked(covering_mask(in_bits))
            }
            _ => full,
        }
    }

    /// Computes the known-zero masks of all varnodes by forward
    /// propagation to a fixed point.
    ///
    /// Constants know their exact bits; inputs and anything a call can
    /// touch stay conservative.
    pub fn calc_nzmask(&mut self) {
        // Seed: constants carry their value, everything else is unknown
        let ids: Vec<VarnodeId> = self.store.iter_loc().collect();
        for id in ids {
            let vn = self.store.var(id);
            let mask = match vn.constant_value() {
                Some(value) => value,
                None => size_mask(vn.size()),
            };
            self.store.var_mut(id).set_nzmask(mask);
        }

        // Shrink outputs until stable; all transfer functions are monotone
        loop {
            let mut changed = false;
            let ops: Vec<OpId> = self.store.alive_ops().collect();
            for op in ops {
                let Some(out) = self.store.op(op).output() else {
                    continue;
                };
                let new_mask = self.nzmask_local(op) & self.store.var(out).nzmask();
                if new_mask != self.store.var(out).nzmask() {
                    self.store.var_mut(out).set_nzmask(new_mask);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// The metatype an op's output naturally carries.
    fn output_metatype(opcode: OpCode) -> Metatype {
        if opcode.is_boolean_output() {
            Metatype::Bool
        } else if opcode.is_float() {
            Metatype::Float
        } else {
            match opcode {
                OpCode::PtrAdd | OpCode::PtrSub | OpCode::New | OpCode::SegmentOp => {
                    Metatype::Pointer
                }
                OpCode::IntSExt
                | OpCode::IntSDiv
                | OpCode::IntSRem
                | OpCode::IntSRight
                | OpCode::Int2Comp => Metatype::Int,
                _ => Metatype::Unknown,
            }
        }
    }

    /// Assigns data-types to varnodes that have none, propagating what the
    /// operations themselves imply: comparisons yield booleans, float
    /// arithmetic yields floats, signed arithmetic yields signed
    /// integers, LOAD/STORE pointers become pointers.
    ///
    /// Locked types are never recomputed. Returns `true` on the first
    /// pass that assigns anything.
    ///
    /// # Errors
    ///
    /// Never fails today; kept fallible for symmetry with other actions.
    pub fn recover_types(&mut self) -> Result<bool> {
        let mut changed = false;
        let ops: Vec<OpId> = self.store.alive_ops().collect();
        for op in ops {
            let opcode = self.store.op(op).opcode();

            // Pointer operand of LOAD and STORE
            if matches!(opcode, OpCode::Load | OpCode::Store) {
                if let Some(ptr) = self.store.op(op).input(1) {
                    if self.store.var(ptr).datatype().is_none() {
                        let size = self.store.var(ptr).size();
                        let ty = {
                            let mut types = self.arch().types();
                            let unknown = types.base(u64::from(size), Metatype::Unknown);
                            types.pointer_to(unknown)
                        };
                        self.store.var_mut(ptr).set_datatype(ty);
                        changed = true;
                    }
                }
            }

            let Some(out) = self.store.op(op).output() else {
                continue;
            };
            if self.store.var(out).datatype().is_some()
                || self.store.var(out).flags().contains(VarnodeFlags::TYPELOCK)
            {
                continue;
            }
            let meta = Self::output_metatype(opcode);
            let size = self.store.var(out).size();
            let ty = self.arch().types().base(u64::from(size), meta);
            self.store.var_mut(out).set_datatype(ty);
            changed = true;
        }
        let first = !self.flags().contains(FunctionFlags::TYPE_RECOVERY);
        self.set_function_flag(FunctionFlags::TYPE_RECOVERY);
        Ok(changed && first)
    }

    /// Inserts explicit CAST operations where a float operation consumes a
    /// value whose recovered type is not a float, making the conversion
    /// visible to the emitter.
    ///
    /// # Errors
    ///
    /// Propagates linkage failures.
    pub fn insert_casts(&mut self) -> Result<bool> {
        let mut changed = false;
        let ops: Vec<OpId> = self.store.alive_ops().collect();
        for op in ops {
            let opcode = self.store.op(op).opcode();
            if !opcode.is_float()
                || matches!(opcode, OpCode::FloatInt2Float | OpCode::FloatFloat2Float)
            {
                continue;
            }
            for slot in 0..self.store.op(op).num_inputs() {
                let Some(vn) = self.store.op(op).input(slot) else {
                    continue;
                };
                let needs_cast = match self.store.var(vn).datatype() {
                    Some(ty) => {
                        self.arch().types().get(ty).metatype() != Metatype::Float
                    }
                    None => false,
                };
                if !needs_cast {
                    continue;
                }
                let size = self.store.var(vn).size();
                let pc = self.store.op(op).addr();
                let cast = self.store.new_op(OpCode::Cast, 1, pc);
                self.store.set_input(cast, vn, 0)?;
                let out = self.store.new_unique_out(size, cast)?;
                let float_ty = self.arch().types().base(u64::from(size), Metatype::Float);
                self.store.var_mut(out).set_datatype(float_ty);
                self.op_insert_before(cast, op)?;
                self.store.set_input(op, out, slot)?;
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Returns `true` if the op may be deleted once its output is unread.
    fn is_dead_code_candidate(&self, op: OpId) -> bool {
        let o = self.store.op(op);
        if !o.is_pure() && o.opcode() != OpCode::Indirect {
            return false;
        }
        let Some(out) = o.output() else {
            return false;
        };
        let vn = self.store.var(out);
        if !vn.has_no_descend() {
            return false;
        }
        if vn.flags().intersects(
            VarnodeFlags::ADDRFORCE
                | VarnodeFlags::AUTOLIVE
                | VarnodeFlags::PERSIST
                | VarnodeFlags::VOLATILE
                | VarnodeFlags::WRITEMASK,
        ) {
            return false;
        }
        self.heritage
            .dead_removal_allowed(vn.storage().addr.space)
    }

    /// Deletes alive operations whose outputs are unread, iterating until
    /// nothing more falls out. Honors per-space dead-code delays.
    ///
    /// Returns `true` if anything was removed.
    ///
    /// # Errors
    ///
    /// Propagates linkage failures.
    pub fn eliminate_dead_code(&mut self) -> Result<bool> {
        let mut any = false;
        loop {
            let dead: Vec<OpId> = self
                .store
                .alive_ops()
                .filter(|&op| self.is_dead_code_candidate(op))
                .collect();
            if dead.is_empty() {
                break;
            }
            for op in dead {
                if self.store.op_exists(op) && self.is_dead_code_candidate(op) {
                    self.op_destroy(op)?;
                    any = true;
                }
            }
        }
        Ok(any)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_arch;

    #[test]
    fn test_covering_mask() {
        assert_eq!(covering_mask(0), 0);
        assert_eq!(covering_mask(0x10), 0x1f);
        assert_eq!(covering_mask(0x81), 0xff);
    }

    #[test]
    fn test_total_replace_constant_duplicates() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let pc = fd.entry();
        let vn = fd.store.new_varnode(4, arch.register_address(0x10));
        let op1 = fd.store.new_op(OpCode::Copy, 1, pc);
        let op2 = fd.store.new_op(OpCode::Copy, 1, pc);
        fd.store.set_input(op1, vn, 0).unwrap();
        fd.store.set_input(op2, vn, 0).unwrap();

        fd.total_replace_constant(vn, 9).unwrap();
        let c1 = fd.store.op(op1).input(0).unwrap();
        let c2 = fd.store.op(op2).input(0).unwrap();
        assert_ne!(c1, c2);
        assert_eq!(fd.store.var(c1).constant_value(), Some(9));
        assert_eq!(fd.store.var(c2).constant_value(), Some(9));
        assert!(fd.store.var(vn).has_no_descend());
        fd.store.verify_integrity().unwrap();
    }

    #[test]
    fn test_nzmask_through_and() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let block = fd.graph.new_block(None);
        let pc = fd.entry();

        let input = fd.store.new_varnode(4, arch.register_address(0x10));
        let input = fd.store.mark_input(input).unwrap();
        let and = fd.store.new_op(OpCode::IntAnd, 2, pc);
        fd.store.set_input(and, input, 0).unwrap();
        let c = fd.store.new_constant(4, 0xff);
        fd.store.set_input(and, c, 1).unwrap();
        let masked = fd.store.new_unique_out(4, and).unwrap();
        fd.op_insert_end(and, block).unwrap();

        // A following add of two masked bytes stays under 0x1ff
        let add = fd.store.new_op(OpCode::IntAdd, 2, pc);
        fd.store.set_input(add, masked, 0).unwrap();
        fd.store.set_input(add, masked, 1).unwrap();
        let sum = fd.store.new_unique_out(4, add).unwrap();
        fd.op_insert_end(add, block).unwrap();

        fd.calc_nzmask();
        assert_eq!(fd.store.var(masked).nzmask(), 0xff);
        assert_eq!(fd.store.var(sum).nzmask(), 0x1ff);
    }

    #[test]
    fn test_nzmask_boolean_and_zext() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let block = fd.graph.new_block(None);
        let pc = fd.entry();

        let a = fd.store.new_varnode(4, arch.register_address(0x10));
        let a = fd.store.mark_input(a).unwrap();
        let b = fd.store.new_varnode(4, arch.register_address(0x18));
        let b = fd.store.mark_input(b).unwrap();
        let cmp = fd.store.new_op(OpCode::IntLess, 2, pc);
        fd.store.set_input(cmp, a, 0).unwrap();
        fd.store.set_input(cmp, b, 1).unwrap();
        let flag = fd.store.new_unique_out(1, cmp).unwrap();
        fd.op_insert_end(cmp, block).unwrap();

        let zext = fd.store.new_op(OpCode::IntZExt, 1, pc);
        fd.store.set_input(zext, flag, 0).unwrap();
        let wide = fd.store.new_unique_out(8, zext).unwrap();
        fd.op_insert_end(zext, block).unwrap();

        fd.calc_nzmask();
        assert_eq!(fd.store.var(flag).nzmask(), 1);
        assert_eq!(fd.store.var(wide).nzmask(), 1);
    }

    #[test]
    fn test_dead_code_elimination_cascades() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let block = fd.graph.new_block(None);
        let pc = fd.entry();

        // u0 = COPY #1 ; u1 = COPY u0 — both dead once nothing reads u1
        let op0 = fd.store.new_op(OpCode::Copy, 1, pc);
        let c = fd.store.new_constant(4, 1);
        fd.store.set_input(op0, c, 0).unwrap();
        let u0 = fd.store.new_unique_out(4, op0).unwrap();
        fd.op_insert_end(op0, block).unwrap();

        let op1 = fd.store.new_op(OpCode::Copy, 1, pc);
        fd.store.set_input(op1, u0, 0).unwrap();
        fd.store.new_unique_out(4, op1).unwrap();
        fd.op_insert_end(op1, block).unwrap();

        // Unique space has no delay, but nothing was heritaged yet
        assert!(!fd.eliminate_dead_code().unwrap());

        fd.set_function_flag(crate::func::FunctionFlags::BLOCKS_GENERATED);
        fd.op_heritage().unwrap();
        let removed = fd.eliminate_dead_code().unwrap();
        assert!(removed);
        assert_eq!(fd.store.num_alive_ops(), 0);
        fd.verify_integrity().unwrap();
    }

    #[test]
    fn test_self_loop_phi_survives_dce() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let b0 = fd.graph.new_block(None);
        let b1 = fd.graph.new_block(None);
        fd.graph.add_edge(b0, b1);
        fd.graph.add_edge(b1, b1);
        let pc = fd.entry();

        let phi = fd.store.new_op(OpCode::MultiEqual, 2, pc);
        let seed = fd.store.new_constant(4, 0);
        fd.store.set_input(phi, seed, 0).unwrap();
        let out = fd
            .store
            .new_varnode_out(4, arch.register_address(0x10), phi)
            .unwrap();
        // Slot 1 feeds back from itself across the back edge
        fd.store.set_input(phi, out, 1).unwrap();
        fd.op_insert_begin(phi, b1).unwrap();

        fd.set_function_flag(crate::func::FunctionFlags::BLOCKS_GENERATED);
        fd.op_heritage().unwrap();
        fd.eliminate_dead_code().unwrap();
        assert!(fd.store.op_exists(phi), "self-looped phi must survive");
        fd.verify_integrity().unwrap();
    }
}
