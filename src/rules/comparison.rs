//! Comparison and branch normalization rules.
//!
//! Every rewrite here preserves the truth value of the comparison on all
//! input valuations of the declared sizes.

use crate::{
    func::Funcdata,
    ir::{size_mask, OpFlags, OpId},
    opcodes::OpCode,
    Result,
};

/// Sign boundary constants for a given byte size.
fn signed_max(size: u32) -> u64 {
    size_mask(size) >> 1
}

fn signed_min(size: u32) -> u64 {
    signed_max(size) + 1
}

/// Normalizes `<=` against a constant into `<` with the constant bumped.
///
/// `x <= #c` becomes `x < #(c+1)` unless `c` is the maximum value;
/// `#c <= x` becomes `#(c-1) < x` unless `c` is the minimum.
pub(super) fn rule_less_equal(fd: &mut Funcdata, op: OpId) -> Result<bool> {
    let (opcode, in0, in1) = {
        let o = fd.store().op(op);
        let (Some(a), Some(b)) = (o.input(0), o.input(1)) else {
            return Ok(false);
        };
        (o.opcode(), a, b)
    };
    let signed = opcode == OpCode::IntSLessEqual;
    let new_opcode = if signed {
        OpCode::IntSLess
    } else {
        OpCode::IntLess
    };

    if let Some(c) = fd.store().var(in1).constant_value() {
        let size = fd.store().var(in1).size();
        let limit = if signed { signed_max(size) } else { size_mask(size) };
        if c == limit {
            return Ok(false);
        }
        let bumped = c.wrapping_add(1) & size_mask(size);
        fd.op_set_constant_input(op, size, bumped, 1)?;
        fd.op_set_opcode(op, new_opcode);
        return Ok(true);
    }
    if let Some(c) = fd.store().var(in0).constant_value() {
        let size = fd.store().var(in0).size();
        let limit = if signed { signed_min(size) } else { 0 };
        if c == limit {
            return Ok(false);
        }
        let bumped = c.wrapping_sub(1) & size_mask(size);
        fd.op_set_constant_input(op, size, bumped, 0)?;
        fd.op_set_opcode(op, new_opcode);
        return Ok(true);
    }
    Ok(false)
}

/// Collapses `BOOL_NEGATE(BOOL_NEGATE(x))` to `COPY x`.
pub(super) fn rule_double_negate(fd: &mut Funcdata, op: OpId) -> Result<bool> {
    let inner = {
        let Some(vn) = fd.store().op(op).input(0) else {
            return Ok(false);
        };
        let Some(def) = fd.store().var(vn).def() else {
            return Ok(false);
        };
        if fd.store().op(def).opcode() != OpCode::BoolNegate {
            return Ok(false);
        }
        def
    };
    let Some(original) = fd.store().op(inner).input(0) else {
        return Ok(false);
    };
    fd.op_set_opcode(op, OpCode::Copy);
    fd.store_mut().set_input(op, original, 0)?;
    Ok(true)
}

/// Absorbs a `BOOL_NEGATE` feeding a conditional branch into the branch's
/// polarity flag.
pub(super) fn rule_branch_negate(fd: &mut Funcdata, op: OpId) -> Result<bool> {
    let negate = {
        let Some(cond) = fd.store().op(op).input(1) else {
            return Ok(false);
        };
        let Some(def) = fd.store().var(cond).def() else {
            return Ok(false);
        };
        if fd.store().op(def).opcode() != OpCode::BoolNegate {
            return Ok(false);
        }
        def
    };
    let Some(original) = fd.store().op(negate).input(0) else {
        return Ok(false);
    };
    fd.store_mut().set_input(op, original, 1)?;
    let flags = fd.store().op(op).flags();
    if flags.contains(OpFlags::BOOLEAN_FLIP) {
        fd.store_mut().op_mut(op).clear_flag(OpFlags::BOOLEAN_FLIP);
    } else {
        fd.store_mut().op_mut(op).set_flag(OpFlags::BOOLEAN_FLIP);
    }
    Ok(true)
}

/// Folds a conditional branch whose condition is constant, deleting the
/// edge that can never be taken.
pub(super) fn rule_constant_branch(fd: &mut Funcdata, op: OpId) -> Result<bool> {
    let (block, taken) = {
        let o = fd.store().op(op);
        let Some(cond) = o.input(1) else {
            return Ok(false);
        };
        let Some(value) = fd.store().var(cond).constant_value() else {
            return Ok(false);
        };
        let Some(block) = o.parent() else {
            return Ok(false);
        };
        let mut taken = value != 0;
        if o.flags().contains(OpFlags::BOOLEAN_FLIP) {
            taken = !taken;
        }
        (block, taken)
    };
    if fd.graph().block(block).outs().len() != 2 {
        return Ok(false);
    }
    // Out-slot 0 is fall-through (condition false), slot 1 is taken
    let dead = if taken { 0 } else { 1 };
    fd.remove_branch(block, dead)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_arch;

    #[test]
    fn test_less_equal_constant_bumped() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let block = fd.graph.new_block(None);
        let pc = fd.entry();
        let x = fd.store.new_varnode(4, arch.register_address(0x10));
        let x = fd.store.mark_input(x).unwrap();
        let op = fd.store.new_op(OpCode::IntLessEqual, 2, pc);
        let five = fd.store.new_constant(4, 5);
        fd.store.set_input(op, x, 0).unwrap();
        fd.store.set_input(op, five, 1).unwrap();
        fd.store.new_unique_out(1, op).unwrap();
        fd.op_insert_end(op, block).unwrap();

        assert!(rule_less_equal(&mut fd, op).unwrap());
        assert_eq!(fd.store.op(op).opcode(), OpCode::IntLess);
        let c = fd.store.op(op).input(1).unwrap();
        assert_eq!(fd.store.var(c).constant_value(), Some(6));
        fd.verify_integrity().unwrap();
    }

    #[test]
    fn test_less_equal_max_untouched() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let block = fd.graph.new_block(None);
        let pc = fd.entry();
        let x = fd.store.new_varnode(4, arch.register_address(0x10));
        let x = fd.store.mark_input(x).unwrap();
        let op = fd.store.new_op(OpCode::IntLessEqual, 2, pc);
        let max = fd.store.new_constant(4, 0xffff_ffff);
        fd.store.set_input(op, x, 0).unwrap();
        fd.store.set_input(op, max, 1).unwrap();
        fd.store.new_unique_out(1, op).unwrap();
        fd.op_insert_end(op, block).unwrap();

        assert!(!rule_less_equal(&mut fd, op).unwrap());
        assert_eq!(fd.store.op(op).opcode(), OpCode::IntLessEqual);
    }

    /// The normalization preserves truth on the boundary values.
    #[test]
    fn test_less_equal_truth_preserved() {
        use crate::rules::eval::fold_binary;
        for x in [0u64, 5, 6, 0xffff_ffff] {
            let before = fold_binary(OpCode::IntLessEqual, 4, 4, x, 5).unwrap();
            let after = fold_binary(OpCode::IntLess, 4, 4, x, 6).unwrap();
            assert_eq!(before, after, "truth changed for x={x}");
        }
    }

    #[test]
    fn test_signed_less_equal() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let block = fd.graph.new_block(None);
        let pc = fd.entry();
        let x = fd.store.new_varnode(4, arch.register_address(0x10));
        let x = fd.store.mark_input(x).unwrap();
        let op = fd.store.new_op(OpCode::IntSLessEqual, 2, pc);
        // -2 as a 4-byte constant
        let c = fd.store.new_constant(4, 0xffff_fffe);
        fd.store.set_input(op, x, 0).unwrap();
        fd.store.set_input(op, c, 1).unwrap();
        fd.store.new_unique_out(1, op).unwrap();
        fd.op_insert_end(op, block).unwrap();

        assert!(rule_less_equal(&mut fd, op).unwrap());
        assert_eq!(fd.store.op(op).opcode(), OpCode::IntSLess);
        let c = fd.store.op(op).input(1).unwrap();
        assert_eq!(fd.store.var(c).constant_value(), Some(0xffff_ffff));
    }

    #[test]
    fn test_branch_negate_flips_polarity() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let block = fd.graph.new_block(None);
        let pc = fd.entry();

        let flag = fd.store.new_varnode(1, arch.register_address(0x20));
        let flag = fd.store.mark_input(flag).unwrap();
        let neg = fd.store.new_op(OpCode::BoolNegate, 1, pc);
        fd.store.set_input(neg, flag, 0).unwrap();
        let negged = fd.store.new_unique_out(1, neg).unwrap();
        fd.op_insert_end(neg, block).unwrap();

        let branch = fd.store.new_op(OpCode::CBranch, 2, pc);
        let dest = fd.store.new_constant(8, 0x2000);
        fd.store.set_input(branch, dest, 0).unwrap();
        fd.store.set_input(branch, negged, 1).unwrap();
        fd.op_insert_end(branch, block).unwrap();

        assert!(rule_branch_negate(&mut fd, branch).unwrap());
        assert_eq!(fd.store.op(branch).input(1), Some(flag));
        assert!(fd.store.op(branch).flags().contains(OpFlags::BOOLEAN_FLIP));
        fd.verify_integrity().unwrap();
    }

    #[test]
    fn test_constant_branch_removes_dead_edge() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let b0 = fd.graph.new_block(None);
        let b1 = fd.graph.new_block(None);
        let b2 = fd.graph.new_block(None);
        fd.graph.add_edge(b0, b1); // fall-through
        fd.graph.add_edge(b0, b2); // taken
        let pc = fd.entry();

        let branch = fd.store.new_op(OpCode::CBranch, 2, pc);
        let dest = fd.store.new_constant(8, 0x2000);
        let cond = fd.store.new_constant(1, 1);
        fd.store.set_input(branch, dest, 0).unwrap();
        fd.store.set_input(branch, cond, 1).unwrap();
        fd.op_insert_end(branch, b0).unwrap();

        // Condition is always true: the fall-through edge dies and the
        // branch becomes unconditional
        assert!(rule_constant_branch(&mut fd, branch).unwrap());
        assert_eq!(fd.graph.block(b0).outs(), &[b2]);
        assert_eq!(fd.store.op(branch).opcode(), OpCode::Branch);
        fd.verify_integrity().unwrap();
    }
}
