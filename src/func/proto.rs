//! Function prototype recovery: parameter trials and the ancestry
//! realism walk.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::{
    address::VarnodeData,
    func::Funcdata,
    ir::{OpFlags, OpId, VarnodeId},
    opcodes::OpCode,
    types::TypeId,
    Result,
};

/// One recovered formal parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtoParam {
    /// Parameter name.
    pub name: String,
    /// Storage the parameter arrives in.
    pub storage: VarnodeData,
    /// Recovered type, if any.
    pub datatype: Option<TypeId>,
}

/// The recovered prototype of a function.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FuncProto {
    /// Calling-convention model name.
    pub model: String,
    /// Formal parameters in binding order.
    pub params: Vec<ProtoParam>,
    /// Storage of the return value, if one was recovered.
    pub return_storage: Option<VarnodeData>,
    /// Recovered return type.
    pub return_type: Option<TypeId>,
}

/// Classification of a parameter trial after the ancestry walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialVerdict {
    /// The value moves realistically into the storage; keep the trial.
    Accept,
    /// The value is a killed-by-call placeholder or unaffected
    /// pass-through; exclude the trial.
    Reject,
    /// Only conditionally-executed paths supplied evidence; retest after
    /// further simplification.
    RetestConditional,
}

/// A candidate input at a CALL, CALLIND, or RETURN.
#[derive(Debug, Clone)]
pub struct ParamTrial {
    /// The op holding the candidate.
    pub op: OpId,
    /// Input slot of the candidate.
    pub slot: usize,
    /// Storage of the candidate.
    pub storage: VarnodeData,
    /// Outcome of the realism walk.
    pub verdict: TrialVerdict,
}

/// What one ancestry path reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathEvidence {
    /// A solid movement (COPY, LOAD, arithmetic, logic) reached the value.
    Solid,
    /// The path dead-ends in a killed-by-call or speculative creation.
    Kill,
    /// The path dead-ends without evidence either way.
    Fail,
}

/// Bounded depth-first ancestry walk deciding whether a trial varnode
/// holds a realistically moved value.
///
/// On MULTIEQUAL the walk recurses into each predecessor path; one solid
/// path carries the trial, kill-only paths sink it.
pub struct AncestorRealistic {
    marked: FxHashSet<VarnodeId>,
    multi_depth: usize,
    allow_failing_path: bool,
}

/// Recursion bound on phi nesting.
const MAX_MULTI_DEPTH: usize = 16;

impl AncestorRealistic {
    /// Creates a walk; `allow_failing_path` tolerates evidence arriving
    /// only on conditionally executed paths.
    #[must_use]
    pub fn new(allow_failing_path: bool) -> Self {
        Self {
            marked: FxHashSet::default(),
            multi_depth: 0,
            allow_failing_path,
        }
    }

    /// Classifies the input of `op` at `slot`.
    #[must_use]
    pub fn execute(&mut self, fd: &Funcdata, op: OpId, slot: usize) -> TrialVerdict {
        let Some(vn) = fd.store().op(op).input(slot) else {
            return TrialVerdict::Reject;
        };
        match self.walk(fd, vn) {
            PathEvidence::Solid => TrialVerdict::Accept,
            PathEvidence::Kill => TrialVerdict::Reject,
            PathEvidence::Fail => {
                if self.allow_failing_path {
                    TrialVerdict::RetestConditional
                } else {
                    TrialVerdict::Reject
                }
            }
        }
    }

    fn walk(&mut self, fd: &Funcdata, vn: VarnodeId) -> PathEvidence {
        if !self.marked.insert(vn) {
            // Cycle through a loop phi: no independent evidence
            return PathEvidence::Fail;
        }
        let v = fd.store().var(vn);
        if v.is_constant() {
            return PathEvidence::Solid;
        }
        if !v.is_written() {
            if v.is_input() {
                // A pass-through of the caller's own parameter is a
                // legitimate source
                return PathEvidence::Solid;
            }
            return PathEvidence::Fail;
        }
        let def = v.def().expect("written varnode has definer");
        let def_op = fd.store().op(def);
        match def_op.opcode() {
            OpCode::Indirect => {
                if def_op.flags().contains(OpFlags::INDIRECT_CREATION) {
                    // Speculative creation at a call: killed-by-call
                    return PathEvidence::Kill;
                }
                // Value carried through the effect untouched: keep walking
                match def_op.input(0) {
                    Some(prev) => self.walk(fd, prev),
                    None => PathEvidence::Fail,
                }
            }
            OpCode::Call | OpCode::CallInd | OpCode::CallOther => PathEvidence::Kill,
            OpCode::MultiEqual => {
                if self.multi_depth >= MAX_MULTI_DEPTH {
                    return PathEvidence::Fail;
                }
                self.multi_depth += 1;
                let mut saw_solid = false;
                let mut saw_kill = false;
                for s in 0..def_op.num_inputs() {
                    let Some(input) = fd.store().op(def).input(s) else {
                        continue;
                    };
                    match self.walk(fd, input) {
                        PathEvidence::Solid => saw_solid = true,
                        PathEvidence::Kill => saw_kill = true,
                        PathEvidence::Fail => {}
                    }
                }
                self.multi_depth -= 1;
                if saw_solid {
                    PathEvidence::Solid
                } else if saw_kill {
                    PathEvidence::Kill
                } else {
                    PathEvidence::Fail
                }
            }
            // Any computing operation is a solid movement into the storage
            _ => PathEvidence::Solid,
        }
    }
}

impl Funcdata {
    /// Builds the trial list for one call or return op: every input slot
    /// past the destination whose storage the model recognizes.
    fn collect_trials(&self, op: OpId) -> Vec<ParamTrial> {
        let model = self.arch().default_model();
        let o = self.store().op(op);
        let first_slot = usize::from(o.opcode() != OpCode::Return);
        let mut trials = Vec::new();
        for slot in first_slot..o.num_inputs() {
            let Some(vn) = o.input(slot) else { continue };
            let storage = self.store().var(vn).storage();
            let relevant = match o.opcode() {
                OpCode::Return => model
                    .return_location
                    .is_some_and(|loc| loc.overlaps(&storage)),
                _ => model.is_param_location(&storage),
            };
            if relevant {
                trials.push(ParamTrial {
                    op,
                    slot,
                    storage,
                    verdict: TrialVerdict::RetestConditional,
                });
            }
        }
        trials
    }

    /// Runs the realism walk over every call-site and return trial,
    /// excludes the unrealistic ones, and fills in the function's own
    /// prototype from its input varnodes.
    ///
    /// # Errors
    ///
    /// Propagates linkage failures while removing rejected trials.
    pub fn recover_parameters(&mut self) -> Result<bool> {
        let mut changed = false;

        // Call-site and return trials
        let sites: Vec<OpId> = self
            .store
            .ops_by_opcode(OpCode::Call)
            .chain(self.store.ops_by_opcode(OpCode::CallInd))
            .chain(self.store.ops_by_opcode(OpCode::Return))
            .collect();
        for op in sites {
            let mut trials = self.collect_trials(op);
            for trial in &mut trials {
                let mut walk = AncestorRealistic::new(false);
                trial.verdict = walk.execute(self, trial.op, trial.slot);
            }
            // Remove rejected slots from the end so indices stay valid
            for trial in trials.iter().rev() {
                if trial.verdict == TrialVerdict::Reject {
                    self.op_remove_input(trial.op, trial.slot)?;
                    changed = true;
                }
            }
        }

        // The function's own parameters: inputs in model locations, in
        // binding order
        let model = self.arch().default_model().clone();
        let mut params: Vec<ProtoParam> = Vec::new();
        for (index, loc) in model.param_locations.iter().enumerate() {
            let found = self
                .store
                .varnodes_in_space(loc.addr.space)
                .find(|&id| {
                    let v = self.store.var(id);
                    v.is_input() && loc.contains(&v.storage())
                });
            if let Some(id) = found {
                params.push(ProtoParam {
                    name: format!("param_{}", index + 1),
                    storage: self.store.var(id).storage(),
                    datatype: None,
                });
            }
        }
        if self.proto.params.len() != params.len() {
            changed = true;
        }
        self.proto.params = params;
        self.proto.model = model.name.clone();

        // Return value: a surviving RETURN trial fixes the storage
        if self.proto.return_storage.is_none() {
            let returns: Vec<OpId> = self.store.ops_by_opcode(OpCode::Return).collect();
            for ret in returns {
                if self.store.op(ret).num_inputs() >= 2 {
                    if let Some(vn) = self.store.op(ret).input(1) {
                        self.proto.return_storage = Some(self.store.var(vn).storage());
                        changed = true;
                        break;
                    }
                }
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_arch;

    #[test]
    fn test_solid_copy_accepted() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let block = fd.graph.new_block(None);
        let pc = fd.entry();

        // param reg gets a real COPY of a constant, then feeds the call
        let copy = fd.store.new_op(OpCode::Copy, 1, pc);
        let c = fd.store.new_constant(8, 42);
        fd.store.set_input(copy, c, 0).unwrap();
        let arg = fd
            .store
            .new_varnode_out(8, arch.register_address(0x20), copy)
            .unwrap();
        fd.op_insert_end(copy, block).unwrap();

        let call = fd.store.new_op(OpCode::Call, 2, pc);
        let dest = fd.store.new_constant(8, 0x2000);
        fd.store.set_input(call, dest, 0).unwrap();
        fd.store.set_input(call, arg, 1).unwrap();
        fd.op_insert_end(call, block).unwrap();

        let mut walk = AncestorRealistic::new(false);
        assert_eq!(walk.execute(&fd, call, 1), TrialVerdict::Accept);
    }

    #[test]
    fn test_killed_by_call_rejected() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let block = fd.graph.new_block(None);
        let pc = fd.entry();

        // First call clobbers the register through an indirect creation
        let call1 = fd.store.new_op(OpCode::Call, 1, pc);
        let dest1 = fd.store.new_constant(8, 0x2000);
        fd.store.set_input(call1, dest1, 0).unwrap();
        fd.op_insert_end(call1, block).unwrap();
        let ind = fd
            .new_indirect_creation(call1, arch.register_address(0x20), 8, false)
            .unwrap();
        let killed = fd.store.op(ind).output().unwrap();

        // Second call reads the killed value with no intervening move
        let call2 = fd.store.new_op(OpCode::Call, 2, pc);
        let dest2 = fd.store.new_constant(8, 0x3000);
        fd.store.set_input(call2, dest2, 0).unwrap();
        fd.store.set_input(call2, killed, 1).unwrap();
        fd.op_insert_end(call2, block).unwrap();

        let mut walk = AncestorRealistic::new(false);
        assert_eq!(walk.execute(&fd, call2, 1), TrialVerdict::Reject);
    }

    #[test]
    fn test_phi_with_one_solid_path_accepted() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let b0 = fd.graph.new_block(None);
        let b1 = fd.graph.new_block(None);
        fd.graph.add_edge(b0, b1);
        fd.graph.add_edge(b0, b1);
        let pc = fd.entry();

        // One phi operand is killed-by-call, the other a solid add
        let call = fd.store.new_op(OpCode::Call, 1, pc);
        let dest = fd.store.new_constant(8, 0x2000);
        fd.store.set_input(call, dest, 0).unwrap();
        fd.op_insert_end(call, b0).unwrap();
        let ind = fd
            .new_indirect_creation(call, arch.register_address(0x20), 8, false)
            .unwrap();
        let killed = fd.store.op(ind).output().unwrap();

        let add = fd.store.new_op(OpCode::IntAdd, 2, pc);
        let x = fd.store.new_varnode(8, arch.register_address(0x28));
        let x = fd.store.mark_input(x).unwrap();
        let one = fd.store.new_constant(8, 1);
        fd.store.set_input(add, x, 0).unwrap();
        fd.store.set_input(add, one, 1).unwrap();
        let solid = fd.store.new_unique_out(8, add).unwrap();
        fd.op_insert_end(add, b0).unwrap();

        let phi = fd.store.new_op(OpCode::MultiEqual, 2, pc);
        fd.store.set_input(phi, killed, 0).unwrap();
        fd.store.set_input(phi, solid, 1).unwrap();
        let merged = fd
            .store
            .new_varnode_out(8, arch.register_address(0x20), phi)
            .unwrap();
        fd.op_insert_begin(phi, b1).unwrap();

        let call2 = fd.store.new_op(OpCode::Call, 2, pc);
        let dest2 = fd.store.new_constant(8, 0x3000);
        fd.store.set_input(call2, dest2, 0).unwrap();
        fd.store.set_input(call2, merged, 1).unwrap();
        fd.op_insert_end(call2, b1).unwrap();

        let mut walk = AncestorRealistic::new(false);
        assert_eq!(walk.execute(&fd, call2, 1), TrialVerdict::Accept);
    }

    #[test]
    fn test_recover_parameters_excludes_rejected_trial() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let block = fd.graph.new_block(None);
        let pc = fd.entry();

        let call1 = fd.store.new_op(OpCode::Call, 1, pc);
        let dest1 = fd.store.new_constant(8, 0x2000);
        fd.store.set_input(call1, dest1, 0).unwrap();
        fd.op_insert_end(call1, block).unwrap();
        let ind = fd
            .new_indirect_creation(call1, arch.register_address(0x20), 8, false)
            .unwrap();
        let killed = fd.store.op(ind).output().unwrap();

        let call2 = fd.store.new_op(OpCode::Call, 2, pc);
        let dest2 = fd.store.new_constant(8, 0x3000);
        fd.store.set_input(call2, dest2, 0).unwrap();
        fd.store.set_input(call2, killed, 1).unwrap();
        fd.op_insert_end(call2, block).unwrap();

        fd.recover_parameters().unwrap();
        assert_eq!(
            fd.store.op(call2).num_inputs(),
            1,
            "rejected trial removed from the call"
        );
    }

    #[test]
    fn test_own_parameters_from_inputs() {
        let arch = test_arch();
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let _ = fd.graph.new_block(None);

        let p = fd.store.new_varnode(8, arch.register_address(0x20));
        fd.store.mark_input(p).unwrap();

        fd.recover_parameters().unwrap();
        assert_eq!(fd.proto().params.len(), 1);
        assert_eq!(fd.proto().params[0].name, "param_1");
        assert_eq!(
            fd.proto().params[0].storage.addr,
            arch.register_address(0x20)
        );
    }
}
