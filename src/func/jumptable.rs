//! Jump-table recovery for indirect branches.
//!
//! A BRANCHIND's target expression is recovered by running a nested,
//! jump-table-restricted decompilation of the same body, simplifying it to
//! SSA, and symbolically evaluating the backward slice of the branch
//! target over enumerated case values. Successful recovery rewires the
//! indirect branch with one edge per case; each failure mode is reported
//! distinctly.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::{
    address::Address,
    error::JumpTableError,
    func::{Funcdata, FunctionFlags},
    ir::{OpFlags, OpId, VarnodeId},
    opcodes::OpCode,
    pipeline::{ActionDatabase, ApplyOutcome},
    rules::{fold_binary, fold_unary},
    translate::Translator,
    Error, Result,
};

/// A recovered jump table: the indirect branch and its case targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JumpTable {
    /// Address of the instruction holding the BRANCHIND.
    pub branch_addr: Address,
    /// Case targets in case-value order.
    pub targets: Vec<Address>,
    /// Case values, parallel to `targets`.
    pub case_values: Vec<u64>,
}

/// Symbolic evaluator over the backward slice of one varnode.
struct SliceEvaluator<'a> {
    fd: &'a Funcdata,
    switch_var: VarnodeId,
    case_value: u64,
    cache: FxHashMap<VarnodeId, u64>,
    depth: usize,
}

const MAX_SLICE_DEPTH: usize = 64;

impl<'a> SliceEvaluator<'a> {
    fn eval(&mut self, vn: VarnodeId) -> std::result::Result<u64, JumpTableError> {
        if vn == self.switch_var {
            return Ok(self.case_value);
        }
        if let Some(&cached) = self.cache.get(&vn) {
            return Ok(cached);
        }
        if self.depth >= MAX_SLICE_DEPTH {
            return Err(JumpTableError::NotConstant);
        }
        let v = self.fd.store().var(vn);
        if let Some(value) = v.constant_value() {
            return Ok(value);
        }
        let Some(def) = v.def() else {
            return Err(JumpTableError::NotConstant);
        };
        self.depth += 1;
        let result = self.eval_op(def, v.size());
        self.depth -= 1;
        let value = result?;
        self.cache.insert(vn, value);
        Ok(value)
    }

    fn eval_op(&mut self, op: OpId, out_size: u32) -> std::result::Result<u64, JumpTableError> {
        let (opcode, num_inputs) = {
            let o = self.fd.store().op(op);
            (o.opcode(), o.num_inputs())
        };
        match opcode {
            OpCode::Load => {
                // Slot 0 names the space, slot 1 computes the pointer
                let ptr_vn = self
                    .fd
                    .store()
                    .op(op)
                    .input(1)
                    .ok_or(JumpTableError::NotConstant)?;
                let ptr = self.eval(ptr_vn)?;
                let image = self
                    .fd
                    .arch()
                    .image()
                    .ok_or(JumpTableError::LoadOutsideReadonly)?;
                let addr = Address::new(self.fd.arch().code_space(), ptr);
                if !image.is_readonly(addr, out_size) {
                    return Err(JumpTableError::LoadOutsideReadonly);
                }
                let mut buf = [0u8; 8];
                let size = out_size.min(8) as usize;
                image
                    .read_bytes(addr, &mut buf[..size])
                    .map_err(|_| JumpTableError::LoadOutsideReadonly)?;
                Ok(u64::from_le_bytes(buf))
            }
            _ => match num_inputs {
                1 => {
                    let vn = self
                        .fd
                        .store()
                        .op(op)
                        .input(0)
                        .ok_or(JumpTableError::NotConstant)?;
                    let in_size = self.fd.store().var(vn).size();
                    let value = self.eval(vn)?;
                    fold_unary(opcode, in_size, out_size, value)
                        .ok_or(JumpTableError::NotConstant)
                }
                2 => {
                    let (vn0, vn1) = {
                        let o = self.fd.store().op(op);
                        match (o.input(0), o.input(1)) {
                            (Some(a), Some(b)) => (a, b),
                            _ => return Err(JumpTableError::NotConstant),
                        }
                    };
                    let s0 = self.fd.store().var(vn0).size();
                    let s1 = self.fd.store().var(vn1).size();
                    let a = self.eval(vn0)?;
                    let b = self.eval(vn1)?;
                    fold_binary(opcode, s0, s1, a, b).ok_or(JumpTableError::NotConstant)
                }
                _ => Err(JumpTableError::NotConstant),
            },
        }
    }
}

/// Finds the unique non-constant leaf of the backward slice: the switch
/// variable.
fn find_switch_var(fd: &Funcdata, root: VarnodeId) -> std::result::Result<VarnodeId, JumpTableError> {
    let mut leaves: Vec<VarnodeId> = Vec::new();
    let mut stack = vec![root];
    let mut seen = FxHashMap::default();
    while let Some(vn) = stack.pop() {
        if seen.insert(vn, ()).is_some() {
            continue;
        }
        let v = fd.store().var(vn);
        if v.is_constant() || v.is_annotation() {
            continue;
        }
        match v.def() {
            None => leaves.push(vn),
            Some(def) => {
                let o = fd.store().op(def);
                match o.opcode() {
                    OpCode::MultiEqual | OpCode::Indirect | OpCode::Call | OpCode::CallInd => {
                        leaves.push(vn);
                    }
                    OpCode::Load => {
                        // The pointer computation continues the slice; the
                        // loaded memory itself is table data
                        if let Some(ptr) = o.input(1) {
                            stack.push(ptr);
                        }
                    }
                    _ => {
                        for slot in 0..o.num_inputs() {
                            if let Some(input) = o.input(slot) {
                                stack.push(input);
                            }
                        }
                    }
                }
            }
        }
    }
    leaves.sort();
    leaves.dedup();
    match leaves.as_slice() {
        [single] => Ok(*single),
        _ => Err(JumpTableError::NoSwitchVariable),
    }
}

/// Looks for a comparison bounding the switch variable: a CBRANCH guard
/// whose condition is `switch_var < #n` (or `<= #n`).
fn find_case_bound(fd: &Funcdata, switch_var: VarnodeId) -> Option<u64> {
    for &reader in fd.store().var(switch_var).descend() {
        let o = fd.store().op(reader);
        let bound = match o.opcode() {
            OpCode::IntLess if o.input(0) == Some(switch_var) => o
                .input(1)
                .and_then(|vn| fd.store().var(vn).constant_value()),
            OpCode::IntLessEqual if o.input(0) == Some(switch_var) => o
                .input(1)
                .and_then(|vn| fd.store().var(vn).constant_value())
                .map(|c| c + 1),
            _ => None,
        };
        if bound.is_some() {
            return bound;
        }
    }
    // The comparison may test a zero-extension of the switch variable
    for &reader in fd.store().var(switch_var).descend() {
        let o = fd.store().op(reader);
        if matches!(o.opcode(), OpCode::IntZExt | OpCode::IntSExt | OpCode::Copy) {
            if let Some(out) = o.output() {
                if let Some(bound) = find_case_bound(fd, out) {
                    return Some(bound);
                }
            }
        }
    }
    None
}

impl Funcdata {
    /// Recovers the jump table feeding the given BRANCHIND of this
    /// function by nested sub-decompilation, recording it on success.
    ///
    /// Returns the case target addresses so flow can continue into them.
    ///
    /// # Errors
    ///
    /// Reports [`JumpTableError`] variants distinctly; fatal analysis
    /// errors propagate.
    pub fn recover_jump_table(
        &mut self,
        translator: &dyn Translator,
        branch_ind: OpId,
    ) -> Result<Vec<Address>> {
        let branch_addr = self.store.op(branch_ind).addr();

        // Nested decompilation restricted to jump-table recovery; it
        // shares the architecture but owns its own analysis state
        let mut sub = Funcdata::new("jumprecover", self.entry(), self.arch().clone());
        sub.set_function_flag(FunctionFlags::JUMPTABLE_RECOVERY);
        for (&addr, &over) in self.flow_overrides() {
            sub.set_flow_override(addr, over);
        }
        sub.follow_flow(translator)?;

        // Simplify the clone with the jump-table root action
        let db = ActionDatabase::with_universal(self.arch());
        let mut action = db.derive_root("jumptable")?;
        loop {
            match action.apply(&mut sub) {
                Ok(ApplyOutcome::Complete { .. }) => break,
                Ok(ApplyOutcome::Break) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(_) => break,
            }
        }

        // Locate the same indirect branch in the clone
        let sub_ind = sub
            .store
            .ops_by_opcode(OpCode::BranchInd)
            .find(|&op| sub.store.op(op).addr() == branch_addr)
            .ok_or(Error::JumpTable(JumpTableError::NoSwitchVariable))?;
        let target_vn = sub
            .store
            .op(sub_ind)
            .input(0)
            .ok_or(Error::JumpTable(JumpTableError::NoSwitchVariable))?;

        let max_cases = self.limits().max_jumptable_cases;
        let (targets, case_values) = if let Some(value) = sub.store.var(target_vn).constant_value()
        {
            // Degenerate single-target table
            (vec![Address::new(self.arch().code_space(), value)], vec![0])
        } else {
            let switch_var = find_switch_var(&sub, target_vn).map_err(Error::JumpTable)?;
            let bound = find_case_bound(&sub, switch_var);
            if let Some(b) = bound {
                if b as usize > max_cases {
                    return Err(Error::JumpTable(JumpTableError::TooManyCases(max_cases)));
                }
            }
            let enumerate = bound.unwrap_or(max_cases as u64 + 1);

            let mut targets = Vec::new();
            let mut case_values = Vec::new();
            for case in 0..enumerate {
                let mut eval = SliceEvaluator {
                    fd: &sub,
                    switch_var,
                    case_value: case,
                    cache: FxHashMap::default(),
                    depth: 0,
                };
                let value = match eval.eval(target_vn) {
                    Ok(v) => v,
                    Err(e) if bound.is_some() => return Err(Error::JumpTable(e)),
                    Err(_) => break,
                };
                let target = Address::new(self.arch().code_space(), value);
                // Enumeration without an explicit bound stops at the
                // first address that does not decode
                if bound.is_none() && translator.instruction_length(target).is_err() {
                    break;
                }
                targets.push(target);
                case_values.push(case);
                if targets.len() > max_cases {
                    return Err(Error::JumpTable(JumpTableError::TooManyCases(max_cases)));
                }
            }
            if targets.is_empty() {
                return Err(Error::JumpTable(JumpTableError::NotConstant));
            }
            (targets, case_values)
        };

        self.store
            .op_mut(branch_ind)
            .set_flag(OpFlags::INDIRECT_SOURCE);
        self.jump_tables.push(JumpTable {
            branch_addr,
            targets: targets.clone(),
            case_values,
        });
        Ok(targets)
    }

    /// Finds the recovered jump table attached to an instruction address.
    #[must_use]
    pub fn find_jump_table(&self, branch_addr: Address) -> Option<&JumpTable> {
        self.jump_tables
            .iter()
            .find(|jt| jt.branch_addr == branch_addr)
    }

    /// Removes the jump table at an instruction address.
    pub fn remove_jump_table(&mut self, branch_addr: Address) {
        self.jump_tables.retain(|jt| jt.branch_addr != branch_addr);
    }
}
