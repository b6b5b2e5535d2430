//! End-to-end rewrite-rule scenarios over SSA form.

mod common;

use relift::{
    func::{FunctionBuilder, Operand},
    rules::{universal_rules, PoolOutcome, RulePool},
    Funcdata, OpCode,
};

fn full_pool() -> RulePool {
    let mut pool = RulePool::new();
    for rule in universal_rules() {
        pool.add_rule(rule);
    }
    pool
}

fn simplify(fd: &mut Funcdata) {
    loop {
        let h = fd.op_heritage().unwrap();
        fd.calc_nzmask();
        let mut pool = full_pool();
        let p = matches!(pool.apply(fd).unwrap(), PoolOutcome::Complete(true));
        let d = fd.eliminate_dead_code().unwrap();
        if !h && !p && !d {
            break;
        }
    }
}

/// Copy-propagation confluence: after the rule pool reaches its fixed
/// point, the add has collapsed to `t3 = COPY #10` and the feeding copies
/// are dead.
#[test]
fn copy_propagation_confluence() {
    let arch = common::arch();
    let t1 = common::reg(&arch, 0x10, 4);
    let t2 = common::reg(&arch, 0x14, 4);
    let t3 = common::reg(&arch, 0x18, 4);

    let mut op1 = None;
    let mut op2 = None;
    let mut op3 = None;
    let mut fd = FunctionBuilder::new(&arch, 0x1000).build_with(|f| {
        f.block(0, |b| {
            op1 = Some(b.copy(t1, Operand::Const(7)));
            op2 = Some(b.copy(t2, Operand::Storage(t1)));
            op3 = Some(b.binop(
                OpCode::IntAdd,
                t3,
                Operand::Storage(t2),
                Operand::Const(3),
            ));
        });
    });
    let (op1, op2, op3) = (op1.unwrap(), op2.unwrap(), op3.unwrap());

    fd.op_heritage().unwrap();
    let mut pool = full_pool();
    assert_eq!(pool.apply(&mut fd).unwrap(), PoolOutcome::Complete(true));
    fd.verify_integrity().unwrap();

    // t3's definition folded to a single COPY of the final constant
    assert_eq!(fd.store().op(op3).opcode(), OpCode::Copy);
    let c = fd.store().op(op3).input(0).unwrap();
    assert_eq!(fd.store().var(c).constant_value(), Some(10));

    // t1 and t2 are dead: nothing reads their outputs any more
    for dead in [op1, op2] {
        let out = fd.store().op(dead).output().unwrap();
        assert!(fd.store().var(out).has_no_descend());
    }

    // Re-applying the pool finds nothing further: the result is confluent
    let mut pool = full_pool();
    assert_eq!(pool.apply(&mut fd).unwrap(), PoolOutcome::Complete(false));
}

/// Less-equal normalization under a conditional branch: the comparison
/// becomes strict with the constant bumped, truth value unchanged.
#[test]
fn less_equal_normalization_feeds_branch() {
    let arch = common::arch();
    let x = common::reg(&arch, 0x10, 4);
    let flag = common::reg(&arch, 0x20, 1);

    let mut fd = FunctionBuilder::new(&arch, 0x1000).build_with(|f| {
        f.block(0, |b| {
            b.binop(
                OpCode::IntLessEqual,
                flag,
                Operand::Storage(x),
                Operand::Const(5),
            );
            b.cbranch(0x2000, Operand::Storage(flag));
        });
        f.block(1, |b| {
            b.ret(None);
        });
        f.block(2, |b| {
            b.ret(None);
        });
        f.edge(0, 1);
        f.edge(0, 2);
    });

    simplify(&mut fd);
    fd.verify_integrity().unwrap();

    assert!(
        fd.store().ops_by_opcode(OpCode::IntLessEqual).next().is_none(),
        "LESSEQUAL must be rewritten"
    );
    let less = fd
        .store()
        .ops_by_opcode(OpCode::IntLess)
        .next()
        .expect("strict comparison survives");
    let bound = fd.store().op(less).input(1).unwrap();
    assert_eq!(fd.store().var(bound).constant_value(), Some(6));

    // The branch condition now reads the strict comparison
    let branch = fd.store().ops_by_opcode(OpCode::CBranch).next().unwrap();
    let cond = fd.store().op(branch).input(1).unwrap();
    assert_eq!(fd.store().var(cond).def(), Some(less));
}

/// Truth preservation of the normalization on boundary values.
#[test]
fn less_equal_truth_table() {
    use relift::rules::fold_binary;
    for x in [0u64, 5, 6, 0xffff_ffff] {
        assert_eq!(
            fold_binary(OpCode::IntLessEqual, 4, 4, x, 5),
            fold_binary(OpCode::IntLess, 4, 4, x, 6),
            "truth value changed for x = {x}"
        );
    }
}

/// A constant branch condition folds the branch and strands the dead arm,
/// which unreachable removal then deletes.
#[test]
fn constant_condition_prunes_arm() {
    let arch = common::arch();
    let r = common::reg(&arch, 0x10, 4);
    let flag = common::reg(&arch, 0x20, 1);

    let mut fd = FunctionBuilder::new(&arch, 0x1000).build_with(|f| {
        f.block(0, |b| {
            b.copy(flag, Operand::Const(1));
            b.cbranch(0x2000, Operand::Storage(flag));
        });
        f.block(1, |b| {
            b.copy(r, Operand::Const(10));
            b.ret(Some(Operand::Storage(r)));
        });
        f.block(2, |b| {
            b.copy(r, Operand::Const(20));
            b.ret(Some(Operand::Storage(r)));
        });
        f.edge(0, 1); // fall-through: condition false
        f.edge(0, 2); // taken: condition true
    });

    simplify(&mut fd);
    fd.remove_unreachable_blocks(false).unwrap();
    fd.verify_integrity().unwrap();

    // Only the taken arm survives, returning its constant
    assert_eq!(fd.graph().num_blocks(), 2);
    let rets: Vec<_> = fd.store().ops_by_opcode(OpCode::Return).collect();
    assert_eq!(rets.len(), 1);
    let value = fd.store().op(rets[0]).input(1).unwrap();
    assert_eq!(fd.store().var(value).constant_value(), Some(20));
}

/// Algebraic identities chain with folding: `(x ^ x) + 42` becomes 42.
#[test]
fn xor_self_then_add_folds() {
    let arch = common::arch();
    let x = common::reg(&arch, 0x10, 4);
    let t = common::reg(&arch, 0x14, 4);
    let out = common::reg(&arch, 0x18, 4);

    let mut fd = FunctionBuilder::new(&arch, 0x1000).build_with(|f| {
        f.block(0, |b| {
            b.binop(OpCode::IntXor, t, Operand::Storage(x), Operand::Storage(x));
            b.binop(OpCode::IntAdd, out, Operand::Storage(t), Operand::Const(42));
            b.ret(Some(Operand::Storage(out)));
        });
    });

    simplify(&mut fd);
    fd.verify_integrity().unwrap();

    let ret = fd.store().ops_by_opcode(OpCode::Return).next().unwrap();
    let value = fd.store().op(ret).input(1).unwrap();
    assert_eq!(fd.store().var(value).constant_value(), Some(42));
    assert!(fd.store().ops_by_opcode(OpCode::IntXor).next().is_none());
    assert!(fd.store().ops_by_opcode(OpCode::IntAdd).next().is_none());
}
