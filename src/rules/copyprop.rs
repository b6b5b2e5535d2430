//! Copy propagation and trivial-phi collapse.

use crate::{
    func::Funcdata,
    ir::{OpId, VarnodeFlags, VarnodeId},
    opcodes::OpCode,
    Result,
};

/// Propagates the source of a COPY into every reader of its output.
///
/// The COPY itself stays behind for dead-code elimination. Outputs pinned
/// to their storage (address-forced, volatile, persistent) are left alone.
pub(super) fn rule_copy_propagate(fd: &mut Funcdata, op: OpId) -> Result<bool> {
    let (out, src) = {
        let o = fd.store().op(op);
        let (Some(out), Some(src)) = (o.output(), o.input(0)) else {
            return Ok(false);
        };
        (out, src)
    };
    {
        let out_vn = fd.store().var(out);
        if out_vn.has_no_descend() {
            return Ok(false);
        }
        if out_vn.flags().intersects(
            VarnodeFlags::ADDRFORCE | VarnodeFlags::VOLATILE | VarnodeFlags::PERSIST,
        ) {
            return Ok(false);
        }
    }
    let src_vn = fd.store().var(src);
    if let Some(value) = src_vn.constant_value() {
        fd.total_replace_constant(out, value)?;
        return Ok(true);
    }
    if src_vn.is_free() || src_vn.is_annotation() {
        return Ok(false);
    }
    fd.total_replace(out, src)?;
    Ok(true)
}

/// Collapses a phi whose operands all carry the same value into a COPY.
///
/// Operands referring to the phi's own output across a back edge are
/// ignored for the comparison.
pub(super) fn rule_trivial_phi(fd: &mut Funcdata, op: OpId) -> Result<bool> {
    let out = {
        let Some(out) = fd.store().op(op).output() else {
            return Ok(false);
        };
        out
    };

    // All non-self operands must agree, by identity or by constant value
    let mut unique: Option<VarnodeId> = None;
    for slot in 0..fd.store().op(op).num_inputs() {
        let Some(vn) = fd.store().op(op).input(slot) else {
            return Ok(false);
        };
        if vn == out {
            continue;
        }
        match unique {
            None => unique = Some(vn),
            Some(seen) if seen == vn => {}
            Some(seen) => {
                let a = fd.store().var(seen);
                let b = fd.store().var(vn);
                match (a.constant_value(), b.constant_value()) {
                    (Some(x), Some(y)) if x == y && a.size() == b.size() => {}
                    _ => return Ok(false),
                }
            }
        }
    }
    let Some(survivor) = unique else {
        return Ok(false);
    };

    // The phi must leave the phi region once it becomes a COPY
    let block = fd.store().op(op).parent();
    if block.is_some() {
        fd.op_uninsert(op)?;
    }
    fd.op_set_opcode(op, OpCode::Copy);
    fd.store_mut().set_input(op, survivor, 0)?;
    while fd.store().op(op).num_inputs() > 1 {
        let last = fd.store().op(op).num_inputs() - 1;
        fd.op_remove_input(op, last)?;
    }
    if let Some(block) = block {
        fd.op_insert_begin(op, block)?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_arch;

    #[test]
    fn test_copy_chain_propagates() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let block = fd.graph.new_block(None);
        let pc = fd.entry();

        let x = fd.store.new_varnode(4, arch.register_address(0x10));
        let x = fd.store.mark_input(x).unwrap();
        let copy = fd.store.new_op(OpCode::Copy, 1, pc);
        fd.store.set_input(copy, x, 0).unwrap();
        let mid = fd.store.new_unique_out(4, copy).unwrap();
        fd.op_insert_end(copy, block).unwrap();

        let user = fd.store.new_op(OpCode::IntAdd, 2, pc);
        fd.store.set_input(user, mid, 0).unwrap();
        fd.store.set_input(user, mid, 1).unwrap();
        fd.store.new_unique_out(4, user).unwrap();
        fd.op_insert_end(user, block).unwrap();

        assert!(rule_copy_propagate(&mut fd, copy).unwrap());
        assert_eq!(fd.store.op(user).input(0), Some(x));
        assert_eq!(fd.store.op(user).input(1), Some(x));
        assert!(fd.store.var(mid).has_no_descend());
        fd.verify_integrity().unwrap();
    }

    #[test]
    fn test_copy_of_constant_duplicates_per_reader() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let block = fd.graph.new_block(None);
        let pc = fd.entry();

        let copy = fd.store.new_op(OpCode::Copy, 1, pc);
        let c = fd.store.new_constant(4, 7);
        fd.store.set_input(copy, c, 0).unwrap();
        let out = fd.store.new_unique_out(4, copy).unwrap();
        fd.op_insert_end(copy, block).unwrap();

        let r1 = fd.store.new_op(OpCode::IntNegate, 1, pc);
        fd.store.set_input(r1, out, 0).unwrap();
        fd.store.new_unique_out(4, r1).unwrap();
        fd.op_insert_end(r1, block).unwrap();

        let r2 = fd.store.new_op(OpCode::IntNegate, 1, pc);
        fd.store.set_input(r2, out, 0).unwrap();
        fd.store.new_unique_out(4, r2).unwrap();
        fd.op_insert_end(r2, block).unwrap();

        assert!(rule_copy_propagate(&mut fd, copy).unwrap());
        let c1 = fd.store.op(r1).input(0).unwrap();
        let c2 = fd.store.op(r2).input(0).unwrap();
        assert_ne!(c1, c2);
        assert_eq!(fd.store.var(c1).constant_value(), Some(7));
        assert_eq!(fd.store.var(c2).constant_value(), Some(7));
        fd.verify_integrity().unwrap();
    }

    #[test]
    fn test_trivial_phi_collapse() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let b0 = fd.graph.new_block(None);
        let b1 = fd.graph.new_block(None);
        fd.graph.add_edge(b0, b1);
        fd.graph.add_edge(b0, b1);
        let pc = fd.entry();

        let x = fd.store.new_varnode(4, arch.register_address(0x10));
        let x = fd.store.mark_input(x).unwrap();
        let phi = fd.store.new_op(OpCode::MultiEqual, 2, pc);
        fd.store.set_input(phi, x, 0).unwrap();
        fd.store.set_input(phi, x, 1).unwrap();
        fd.store
            .new_varnode_out(4, arch.register_address(0x10), phi)
            .unwrap();
        fd.op_insert_begin(phi, b1).unwrap();

        assert!(rule_trivial_phi(&mut fd, phi).unwrap());
        assert_eq!(fd.store.op(phi).opcode(), OpCode::Copy);
        assert_eq!(fd.store.op(phi).num_inputs(), 1);
        assert_eq!(fd.graph.block(b1).num_phis(), 0);
        // Still placed inside the block
        assert!(fd.store.op(phi).is_alive());
        fd.verify_integrity().unwrap();
    }

    #[test]
    fn test_self_loop_phi_collapses_to_seed() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let b0 = fd.graph.new_block(None);
        let b1 = fd.graph.new_block(None);
        fd.graph.add_edge(b0, b1);
        fd.graph.add_edge(b1, b1);
        let pc = fd.entry();

        let seed = fd.store.new_varnode(4, arch.register_address(0x18));
        let seed = fd.store.mark_input(seed).unwrap();
        let phi = fd.store.new_op(OpCode::MultiEqual, 2, pc);
        fd.store.set_input(phi, seed, 0).unwrap();
        let out = fd
            .store
            .new_varnode_out(4, arch.register_address(0x10), phi)
            .unwrap();
        fd.store.set_input(phi, out, 1).unwrap();
        fd.op_insert_begin(phi, b1).unwrap();

        // The only non-self operand is the seed; the phi is trivial
        assert!(rule_trivial_phi(&mut fd, phi).unwrap());
        assert_eq!(fd.store.op(phi).opcode(), OpCode::Copy);
        assert_eq!(fd.store.op(phi).input(0), Some(seed));
        fd.verify_integrity().unwrap();
    }

    #[test]
    fn test_nontrivial_phi_kept() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let b0 = fd.graph.new_block(None);
        let b1 = fd.graph.new_block(None);
        fd.graph.add_edge(b0, b1);
        fd.graph.add_edge(b0, b1);
        let pc = fd.entry();

        let phi = fd.store.new_op(OpCode::MultiEqual, 2, pc);
        let c1 = fd.store.new_constant(4, 1);
        let c2 = fd.store.new_constant(4, 2);
        fd.store.set_input(phi, c1, 0).unwrap();
        fd.store.set_input(phi, c2, 1).unwrap();
        fd.store
            .new_varnode_out(4, arch.register_address(0x10), phi)
            .unwrap();
        fd.op_insert_begin(phi, b1).unwrap();

        assert!(!rule_trivial_phi(&mut fd, phi).unwrap());
        assert_eq!(fd.store.op(phi).opcode(), OpCode::MultiEqual);
    }
}
