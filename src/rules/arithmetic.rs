//! Constant folding and algebraic identity rules.

use crate::{
    func::Funcdata,
    ir::{size_mask, OpId, VarnodeId},
    opcodes::OpCode,
    rules::eval::{fold_binary, fold_unary},
    Result,
};

/// Rewrites an op into `out = COPY #value`.
fn collapse_to_constant(fd: &mut Funcdata, op: OpId, value: u64) -> Result<()> {
    let out_size = fd
        .store()
        .op(op)
        .output()
        .map_or(1, |o| fd.store().var(o).size());
    fd.op_set_opcode(op, OpCode::Copy);
    while fd.store().op(op).num_inputs() > 1 {
        let last = fd.store().op(op).num_inputs() - 1;
        fd.op_remove_input(op, last)?;
    }
    if fd.store().op(op).num_inputs() == 0 {
        let c = fd.store_mut().new_constant(out_size, value & size_mask(out_size));
        fd.store_mut().insert_input(op, c, 0)?;
    } else {
        fd.op_set_constant_input(op, out_size, value & size_mask(out_size), 0)?;
    }
    Ok(())
}

/// Rewrites an op into `out = COPY survivor`.
fn collapse_to_copy(fd: &mut Funcdata, op: OpId, survivor: VarnodeId) -> Result<()> {
    fd.op_set_opcode(op, OpCode::Copy);
    fd.store_mut().set_input(op, survivor, 0)?;
    while fd.store().op(op).num_inputs() > 1 {
        let last = fd.store().op(op).num_inputs() - 1;
        fd.op_remove_input(op, last)?;
    }
    Ok(())
}

/// Folds any one- or two-input operation whose inputs are all constant.
pub(super) fn rule_collapse_constants(fd: &mut Funcdata, op: OpId) -> Result<bool> {
    let (opcode, num_inputs) = {
        let o = fd.store().op(op);
        if o.output().is_none() {
            return Ok(false);
        }
        (o.opcode(), o.num_inputs())
    };
    if matches!(
        opcode,
        OpCode::Copy | OpCode::MultiEqual | OpCode::Indirect | OpCode::Cast | OpCode::Load
    ) || opcode.is_call()
        || opcode.is_branch()
        || opcode.is_float()
    {
        return Ok(false);
    }
    if num_inputs == 0 || num_inputs > 2 {
        return Ok(false);
    }

    let mut values = [0u64; 2];
    let mut sizes = [0u32; 2];
    for slot in 0..num_inputs {
        let Some(vn) = fd.store().op(op).input(slot) else {
            return Ok(false);
        };
        let v = fd.store().var(vn);
        let Some(value) = v.constant_value() else {
            return Ok(false);
        };
        values[slot] = value;
        sizes[slot] = v.size();
    }

    let out_size = fd
        .store()
        .op(op)
        .output()
        .map_or(1, |o| fd.store().var(o).size());
    let result = if num_inputs == 1 {
        fold_unary(opcode, sizes[0], out_size, values[0])
    } else {
        fold_binary(opcode, sizes[0], sizes[1], values[0], values[1])
    };
    let Some(result) = result else {
        return Ok(false);
    };
    collapse_to_constant(fd, op, result)?;
    Ok(true)
}

/// Simplifies algebraic identities: identity elements, absorbing
/// elements, and self-canceling or idempotent pairs.
pub(super) fn rule_algebraic_identity(fd: &mut Funcdata, op: OpId) -> Result<bool> {
    let (opcode, in0, in1) = {
        let o = fd.store().op(op);
        if o.output().is_none() || o.num_inputs() != 2 {
            return Ok(false);
        }
        let (Some(a), Some(b)) = (o.input(0), o.input(1)) else {
            return Ok(false);
        };
        (o.opcode(), a, b)
    };
    let const0 = fd.store().var(in0).constant_value();
    let const1 = fd.store().var(in1).constant_value();
    let in_size = fd.store().var(in0).size();
    let all_ones = size_mask(in_size);
    let same = in0 == in1;

    enum Outcome {
        Const(u64),
        Keep(VarnodeId),
    }
    let outcome = match opcode {
        OpCode::IntAdd | OpCode::IntXor | OpCode::IntOr | OpCode::BoolXor | OpCode::BoolOr => {
            if same && matches!(opcode, OpCode::IntXor | OpCode::BoolXor) {
                Some(Outcome::Const(0))
            } else if same && matches!(opcode, OpCode::IntOr | OpCode::BoolOr) {
                Some(Outcome::Keep(in0))
            } else if const1 == Some(0) {
                Some(Outcome::Keep(in0))
            } else if const0 == Some(0) {
                Some(Outcome::Keep(in1))
            } else if opcode == OpCode::IntOr && const1 == Some(all_ones) {
                Some(Outcome::Const(all_ones))
            } else if opcode == OpCode::IntOr && const0 == Some(all_ones) {
                Some(Outcome::Const(all_ones))
            } else {
                None
            }
        }
        OpCode::IntSub => {
            if same {
                Some(Outcome::Const(0))
            } else if const1 == Some(0) {
                Some(Outcome::Keep(in0))
            } else {
                None
            }
        }
        OpCode::IntAnd | OpCode::BoolAnd => {
            if same {
                Some(Outcome::Keep(in0))
            } else if const1 == Some(0) || const0 == Some(0) {
                Some(Outcome::Const(0))
            } else if const1 == Some(all_ones) {
                Some(Outcome::Keep(in0))
            } else if const0 == Some(all_ones) {
                Some(Outcome::Keep(in1))
            } else {
                None
            }
        }
        OpCode::IntMult => {
            if const1 == Some(0) || const0 == Some(0) {
                Some(Outcome::Const(0))
            } else if const1 == Some(1) {
                Some(Outcome::Keep(in0))
            } else if const0 == Some(1) {
                Some(Outcome::Keep(in1))
            } else {
                None
            }
        }
        OpCode::IntDiv => {
            if const1 == Some(1) {
                Some(Outcome::Keep(in0))
            } else {
                None
            }
        }
        OpCode::IntLeft | OpCode::IntRight | OpCode::IntSRight => {
            if const1 == Some(0) {
                Some(Outcome::Keep(in0))
            } else if const0 == Some(0) {
                Some(Outcome::Const(0))
            } else {
                None
            }
        }
        _ => None,
    };

    match outcome {
        Some(Outcome::Const(value)) => {
            collapse_to_constant(fd, op, value)?;
            Ok(true)
        }
        Some(Outcome::Keep(vn)) => {
            collapse_to_copy(fd, op, vn)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// `SUBPIECE` of a `PIECE` selects one of the concatenated halves.
pub(super) fn rule_subpiece_of_piece(fd: &mut Funcdata, op: OpId) -> Result<bool> {
    let (src, trunc, out_size) = {
        let o = fd.store().op(op);
        let (Some(src), Some(shift)) = (o.input(0), o.input(1)) else {
            return Ok(false);
        };
        let Some(out) = o.output() else {
            return Ok(false);
        };
        let Some(trunc) = fd.store().var(shift).constant_value() else {
            return Ok(false);
        };
        (src, trunc, fd.store().var(out).size())
    };
    let piece = {
        let v = fd.store().var(src);
        let Some(def) = v.def() else {
            return Ok(false);
        };
        if fd.store().op(def).opcode() != OpCode::Piece {
            return Ok(false);
        }
        def
    };
    let (Some(hi), Some(lo)) = (fd.store().op(piece).input(0), fd.store().op(piece).input(1))
    else {
        return Ok(false);
    };
    let lo_size = u64::from(fd.store().var(lo).size());
    let hi_size = fd.store().var(hi).size();

    if trunc == 0 && u64::from(out_size) == lo_size {
        collapse_to_copy(fd, op, lo)?;
        return Ok(true);
    }
    if trunc == lo_size && out_size == hi_size {
        collapse_to_copy(fd, op, hi)?;
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_arch;

    fn setup() -> Funcdata {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        fd.graph.new_block(None);
        fd
    }

    fn block_of(fd: &Funcdata) -> crate::cfg::BlockId {
        fd.graph.iter_blocks().next().unwrap()
    }

    #[test]
    fn test_collapse_binary_constants() {
        let mut fd = setup();
        let block = block_of(&fd);
        let pc = fd.entry();
        let op = fd.store.new_op(OpCode::IntMult, 2, pc);
        let a = fd.store.new_constant(4, 6);
        let b = fd.store.new_constant(4, 7);
        fd.store.set_input(op, a, 0).unwrap();
        fd.store.set_input(op, b, 1).unwrap();
        fd.store.new_unique_out(4, op).unwrap();
        fd.op_insert_end(op, block).unwrap();

        assert!(rule_collapse_constants(&mut fd, op).unwrap());
        assert_eq!(fd.store.op(op).opcode(), OpCode::Copy);
        assert_eq!(fd.store.op(op).num_inputs(), 1);
        let c = fd.store.op(op).input(0).unwrap();
        assert_eq!(fd.store.var(c).constant_value(), Some(42));
        fd.verify_integrity().unwrap();
    }

    #[test]
    fn test_collapse_skips_nonconstant() {
        let mut fd = setup();
        let block = block_of(&fd);
        let pc = fd.entry();
        let op = fd.store.new_op(OpCode::IntAdd, 2, pc);
        let a = fd.store.new_varnode(4, fd.arch().register_address(0x10));
        let b = fd.store.new_constant(4, 7);
        fd.store.set_input(op, a, 0).unwrap();
        fd.store.set_input(op, b, 1).unwrap();
        fd.store.new_unique_out(4, op).unwrap();
        fd.op_insert_end(op, block).unwrap();

        assert!(!rule_collapse_constants(&mut fd, op).unwrap());
        assert_eq!(fd.store.op(op).opcode(), OpCode::IntAdd);
    }

    #[test]
    fn test_xor_self_cancels() {
        let mut fd = setup();
        let block = block_of(&fd);
        let pc = fd.entry();
        let x = fd.store.new_varnode(4, fd.arch().register_address(0x10));
        let x = fd.store.mark_input(x).unwrap();
        let op = fd.store.new_op(OpCode::IntXor, 2, pc);
        fd.store.set_input(op, x, 0).unwrap();
        fd.store.set_input(op, x, 1).unwrap();
        fd.store.new_unique_out(4, op).unwrap();
        fd.op_insert_end(op, block).unwrap();

        assert!(rule_algebraic_identity(&mut fd, op).unwrap());
        assert_eq!(fd.store.op(op).opcode(), OpCode::Copy);
        let c = fd.store.op(op).input(0).unwrap();
        assert_eq!(fd.store.var(c).constant_value(), Some(0));
        assert!(fd.store.var(x).has_no_descend());
        fd.verify_integrity().unwrap();
    }

    #[test]
    fn test_add_zero_identity() {
        let mut fd = setup();
        let block = block_of(&fd);
        let pc = fd.entry();
        let x = fd.store.new_varnode(4, fd.arch().register_address(0x10));
        let x = fd.store.mark_input(x).unwrap();
        let op = fd.store.new_op(OpCode::IntAdd, 2, pc);
        let zero = fd.store.new_constant(4, 0);
        fd.store.set_input(op, x, 0).unwrap();
        fd.store.set_input(op, zero, 1).unwrap();
        fd.store.new_unique_out(4, op).unwrap();
        fd.op_insert_end(op, block).unwrap();

        assert!(rule_algebraic_identity(&mut fd, op).unwrap());
        assert_eq!(fd.store.op(op).opcode(), OpCode::Copy);
        assert_eq!(fd.store.op(op).input(0), Some(x));
        fd.verify_integrity().unwrap();
    }

    #[test]
    fn test_and_all_ones() {
        let mut fd = setup();
        let block = block_of(&fd);
        let pc = fd.entry();
        let x = fd.store.new_varnode(4, fd.arch().register_address(0x10));
        let x = fd.store.mark_input(x).unwrap();
        let op = fd.store.new_op(OpCode::IntAnd, 2, pc);
        let ones = fd.store.new_constant(4, 0xffff_ffff);
        fd.store.set_input(op, x, 0).unwrap();
        fd.store.set_input(op, ones, 1).unwrap();
        fd.store.new_unique_out(4, op).unwrap();
        fd.op_insert_end(op, block).unwrap();

        assert!(rule_algebraic_identity(&mut fd, op).unwrap());
        assert_eq!(fd.store.op(op).input(0), Some(x));
        fd.verify_integrity().unwrap();
    }

    #[test]
    fn test_subpiece_of_piece() {
        let mut fd = setup();
        let block = block_of(&fd);
        let pc = fd.entry();
        let hi = fd.store.new_varnode(4, fd.arch().register_address(0x10));
        let hi = fd.store.mark_input(hi).unwrap();
        let lo = fd.store.new_varnode(4, fd.arch().register_address(0x18));
        let lo = fd.store.mark_input(lo).unwrap();

        let piece = fd.store.new_op(OpCode::Piece, 2, pc);
        fd.store.set_input(piece, hi, 0).unwrap();
        fd.store.set_input(piece, lo, 1).unwrap();
        let whole = fd.store.new_unique_out(8, piece).unwrap();
        fd.op_insert_end(piece, block).unwrap();

        let sub = fd.store.new_op(OpCode::SubPiece, 2, pc);
        fd.store.set_input(sub, whole, 0).unwrap();
        let four = fd.store.new_constant(4, 4);
        fd.store.set_input(sub, four, 1).unwrap();
        fd.store.new_unique_out(4, sub).unwrap();
        fd.op_insert_end(sub, block).unwrap();

        assert!(rule_subpiece_of_piece(&mut fd, sub).unwrap());
        assert_eq!(fd.store.op(sub).opcode(), OpCode::Copy);
        assert_eq!(fd.store.op(sub).input(0), Some(hi));
        fd.verify_integrity().unwrap();
    }
}
