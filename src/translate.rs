//! The translator boundary: raw p-code intake and flow following.
//!
//! A [`Translator`] decodes one machine instruction at a time into raw
//! p-code operations described by storage descriptors. The core never sees
//! machine bytes; [`Funcdata::follow_flow`] drives the translator from the
//! entry address, follows branch and fall-through flow under override and
//! instruction-count control, materializes dead operations, and finally
//! partitions them into basic blocks.
//!
//! Address-to-byte conversion (space wordsize) happens on the translator's
//! side of this boundary; descriptors arriving here are always in bytes.

use std::collections::{BTreeMap, VecDeque};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    address::{Address, VarnodeData},
    error::Limit,
    func::{Funcdata, FunctionFlags},
    ir::{OpFlags, OpId, VarnodeFlags},
    opcodes::OpCode,
    Error, Result,
};

/// One raw p-code operation as emitted by a translator.
#[derive(Debug, Clone)]
pub struct RawOp {
    /// Operation code.
    pub opcode: OpCode,
    /// Output storage, if the operation produces a value.
    pub output: Option<VarnodeData>,
    /// Input storage descriptors in slot order.
    pub inputs: Vec<VarnodeData>,
}

/// Sink receiving raw operations during instruction translation.
pub trait PcodeEmit {
    /// Receives one raw operation belonging to the instruction at `addr`.
    fn dump(&mut self, addr: Address, op: RawOp);
}

/// Decodes machine instructions into raw p-code.
pub trait Translator: Send + Sync {
    /// Translates the single instruction at `addr`, dumping its operations
    /// into `emit`, and returns the instruction length in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LiftError`] if no instruction decodes at `addr`.
    fn one_instruction(&self, emit: &mut dyn PcodeEmit, addr: Address) -> Result<usize>;

    /// Returns the length of the instruction at `addr` without emitting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LiftError`] if no instruction decodes at `addr`.
    fn instruction_length(&self, addr: Address) -> Result<usize>;
}

/// A pre-lifted instruction for [`ListingTranslator`].
#[derive(Debug, Clone)]
pub struct Listing {
    /// Raw operations of the instruction in emission order.
    pub ops: Vec<RawOp>,
    /// Instruction length in bytes.
    pub length: usize,
}

/// Translator backed by a table of pre-lifted instructions.
///
/// Hosts that lift elsewhere, and tests, register instructions keyed by
/// address; anything unlisted fails to decode.
#[derive(Debug, Default)]
pub struct ListingTranslator {
    listings: FxHashMap<Address, Listing>,
}

impl ListingTranslator {
    /// Creates an empty listing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the instruction at `addr`.
    pub fn add(&mut self, addr: Address, length: usize, ops: Vec<RawOp>) {
        self.listings.insert(addr, Listing { ops, length });
    }
}

impl Translator for ListingTranslator {
    fn one_instruction(&self, emit: &mut dyn PcodeEmit, addr: Address) -> Result<usize> {
        let listing = self.listings.get(&addr).ok_or(Error::LiftError {
            address: addr.offset,
        })?;
        for op in &listing.ops {
            emit.dump(addr, op.clone());
        }
        Ok(listing.length)
    }

    fn instruction_length(&self, addr: Address) -> Result<usize> {
        self.listings
            .get(&addr)
            .map(|l| l.length)
            .ok_or(Error::LiftError {
                address: addr.offset,
            })
    }
}

/// A host-requested change to control flow at a specific address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FlowOverride {
    /// Stop following flow past this instruction.
    DontFollow,
    /// The call at this address never returns; suppress fall-through.
    NoReturn,
    /// Treat the call at this address as a plain branch.
    CallToBranch,
}

/// Flow classification of one lifted instruction.
#[derive(Debug, Clone)]
struct InstrFlow {
    length: usize,
    fall_through: bool,
    targets: Vec<Address>,
    /// Sequence of the trailing BRANCHIND, if one ends this instruction.
    branch_ind: Option<OpId>,
}

/// Collects raw ops for one instruction.
struct InstrSink {
    ops: Vec<(Address, RawOp)>,
}

impl PcodeEmit for InstrSink {
    fn dump(&mut self, addr: Address, op: RawOp) {
        self.ops.push((addr, op));
    }
}

impl Funcdata {
    /// Materializes one raw operation as a dead op with fresh varnodes.
    fn materialize_raw(&mut self, pc: Address, raw: &RawOp) -> Result<OpId> {
        let op = self.store.new_op(raw.opcode, raw.inputs.len(), pc);
        for (slot, data) in raw.inputs.iter().enumerate() {
            let vn = self.store.new_varnode(data.size, data.addr);
            // Branch/call destinations in the code space are annotations,
            // not data-flow
            let is_code_dest = slot == 0
                && data.addr.space == self.arch().code_space()
                && matches!(
                    raw.opcode,
                    OpCode::Branch | OpCode::CBranch | OpCode::Call
                );
            if is_code_dest {
                self.store.var_mut(vn).set_flag(VarnodeFlags::ANNOTATION);
            }
            self.store.set_input(op, vn, slot)?;
        }
        if let Some(out) = raw.output {
            self.store.new_varnode_out(out.size, out.addr, op)?;
        }
        Ok(op)
    }

    /// Lifts one instruction and classifies its flow.
    fn lift_instruction(
        &mut self,
        translator: &dyn Translator,
        pc: Address,
    ) -> Result<InstrFlow> {
        let mut sink = InstrSink { ops: Vec::new() };
        let length = translator.one_instruction(&mut sink, pc)?;

        let over = self.flow_override(pc);
        let mut flow = InstrFlow {
            length,
            fall_through: true,
            targets: Vec::new(),
            branch_ind: None,
        };
        for (addr, raw) in &sink.ops {
            let mut raw = raw.clone();
            if over == Some(FlowOverride::CallToBranch) && raw.opcode == OpCode::Call {
                raw.opcode = OpCode::Branch;
            }
            let op = self.materialize_raw(*addr, &raw)?;
            match raw.opcode {
                OpCode::Branch => {
                    flow.fall_through = false;
                    flow.targets.push(raw.inputs[0].addr);
                }
                OpCode::CBranch => {
                    flow.targets.push(raw.inputs[0].addr);
                }
                OpCode::BranchInd => {
                    flow.fall_through = false;
                    flow.branch_ind = Some(op);
                }
                OpCode::Return => {
                    flow.fall_through = false;
                }
                OpCode::Call | OpCode::CallInd => {
                    if over == Some(FlowOverride::NoReturn) {
                        flow.fall_through = false;
                        self.store.op_mut(op).set_flag(OpFlags::NORETURN);
                    }
                }
                _ => {}
            }
        }
        if over == Some(FlowOverride::DontFollow) {
            flow.fall_through = false;
            flow.targets.clear();
        }
        Ok(flow)
    }

    /// Lifts the function body from its entry address and builds basic
    /// blocks, recovering jump tables for indirect branches on the way.
    ///
    /// # Errors
    ///
    /// Fatal errors abort the function; decode failures truncate flow and
    /// are recorded as warnings.
    pub fn follow_flow(&mut self, translator: &dyn Translator) -> Result<()> {
        let entry = self.entry();
        let max_instructions = self.limits().max_instructions;

        let mut visited: FxHashMap<Address, InstrFlow> = FxHashMap::default();
        let mut worklist: VecDeque<Address> = VecDeque::new();
        let mut block_starts: FxHashSet<Address> = FxHashSet::default();
        let mut branch_inds: Vec<OpId> = Vec::new();

        worklist.push_back(entry);
        block_starts.insert(entry);

        while let Some(pc) = worklist.pop_front() {
            if visited.contains_key(&pc) {
                continue;
            }
            if visited.len() >= max_instructions {
                return Err(Error::LimitExceeded {
                    limit: Limit::Instructions,
                    value: max_instructions,
                });
            }
            let flow = match self.lift_instruction(translator, pc) {
                Ok(flow) => flow,
                Err(Error::LiftError { address }) => {
                    self.warning(
                        &format!("Unable to decode instruction at 0x{address:x}"),
                        pc,
                    );
                    self.set_function_flag(FunctionFlags::UNIMPLEMENTED_PRESENT);
                    // Truncate: an artificial halt ends this path
                    let halt = self.store.new_op(OpCode::Return, 0, pc);
                    self.store.op_mut(halt).set_flag(OpFlags::BADINSTRUCTION);
                    visited.insert(
                        pc,
                        InstrFlow {
                            length: 1,
                            fall_through: false,
                            targets: Vec::new(),
                            branch_ind: None,
                        },
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            for &target in &flow.targets {
                block_starts.insert(target);
                worklist.push_back(target);
            }
            if flow.fall_through {
                worklist.push_back(pc.add_wrap(flow.length as u64));
            }
            if let Some(ind) = flow.branch_ind {
                branch_inds.push(ind);
            }
            visited.insert(pc, flow);
        }

        // Jump-table recovery extends flow into the case targets
        if !self.is_jumptable_recovery() {
            for ind in branch_inds {
                match self.recover_jump_table(translator, ind) {
                    Ok(targets) => {
                        let mut queue: VecDeque<Address> = VecDeque::new();
                        for &t in &targets {
                            block_starts.insert(t);
                            queue.push_back(t);
                        }
                        while let Some(pc) = queue.pop_front() {
                            if visited.contains_key(&pc) {
                                continue;
                            }
                            if visited.len() >= max_instructions {
                                return Err(Error::LimitExceeded {
                                    limit: Limit::Instructions,
                                    value: max_instructions,
                                });
                            }
                            if let Ok(flow) = self.lift_instruction(translator, pc) {
                                for &target in &flow.targets {
                                    block_starts.insert(target);
                                    queue.push_back(target);
                                }
                                if flow.fall_through {
                                    queue.push_back(pc.add_wrap(flow.length as u64));
                                }
                                visited.insert(pc, flow);
                            } else {
                                visited.insert(
                                    pc,
                                    InstrFlow {
                                        length: 1,
                                        fall_through: false,
                                        targets: Vec::new(),
                                        branch_ind: None,
                                    },
                                );
                            }
                        }
                    }
                    Err(Error::JumpTable(reason)) => {
                        let pc = self.store.op(ind).addr();
                        self.warning(
                            &format!("Could not recover jumptable: {reason}"),
                            pc,
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let covered: u64 = visited.values().map(|f| f.length as u64).sum();
        self.set_size(covered);
        self.generate_blocks(&visited, &block_starts)
    }

    /// Partitions lifted operations into basic blocks and wires edges.
    fn generate_blocks(
        &mut self,
        visited: &FxHashMap<Address, InstrFlow>,
        block_starts: &FxHashSet<Address>,
    ) -> Result<()> {
        use crate::cfg::BlockId;

        if visited.is_empty() {
            self.set_function_flag(FunctionFlags::NO_CODE);
            return Ok(());
        }

        // Instruction addresses in program order
        let mut addrs: Vec<Address> = visited.keys().copied().collect();
        addrs.sort();

        // Assign instructions to blocks
        let mut block_of: BTreeMap<Address, usize> = BTreeMap::new();
        let mut leaders: Vec<Address> = Vec::new();
        let mut prev: Option<Address> = None;
        for &addr in &addrs {
            let is_leader = block_starts.contains(&addr)
                || match prev {
                    Some(p) => {
                        let pf = &visited[&p];
                        !pf.fall_through
                            || p.add_wrap(pf.length as u64) != addr
                            || !pf.targets.is_empty()
                    }
                    None => true,
                };
            if is_leader {
                leaders.push(addr);
            }
            block_of.insert(addr, leaders.len() - 1);
            prev = Some(addr);
        }

        // Materialize blocks with their covered ranges
        let mut blocks: Vec<BlockId> = Vec::with_capacity(leaders.len());
        for (i, &leader) in leaders.iter().enumerate() {
            let end = addrs
                .iter()
                .filter(|a| block_of[a] == i)
                .last()
                .map_or(leader, |&a| a.add_wrap(visited[&a].length as u64));
            blocks.push(self.graph.new_block(Some((leader, end))));
        }
        self.graph.set_entry(blocks[block_of[&self.entry()]]);

        // Insert ops in address order
        for &addr in &addrs {
            let block = blocks[block_of[&addr]];
            let ops: Vec<OpId> = self.store.ops_at(addr).collect();
            for op in ops {
                if !self.store.op(op).is_alive() {
                    self.op_insert_end(op, block)?;
                }
            }
        }
        for &leader in &leaders {
            if let Some(first) = self.store.target(leader) {
                self.store.op_mut(first).set_flag(OpFlags::STARTBASIC);
            }
        }

        // Wire edges from each block's trailing flow
        for (i, &leader) in leaders.iter().enumerate() {
            let last_addr = addrs
                .iter()
                .filter(|a| block_of[a] == i)
                .last()
                .copied()
                .unwrap_or(leader);
            let flow = &visited[&last_addr];
            let from = blocks[i];

            let lookup = |target: Address| -> Option<BlockId> {
                block_of.get(&target).map(|&idx| blocks[idx])
            };

            // Fall-through is out-slot 0 for conditional branches
            if flow.fall_through {
                let next = last_addr.add_wrap(flow.length as u64);
                if let Some(to) = lookup(next) {
                    self.graph.add_edge(from, to);
                }
            }
            for &target in &flow.targets {
                if let Some(to) = lookup(target) {
                    self.graph.add_edge(from, to);
                }
            }
            if flow.branch_ind.is_some() {
                let case_targets: Vec<Address> = self
                    .jump_tables
                    .iter()
                    .find(|jt| jt.branch_addr == last_addr)
                    .map(|jt| jt.targets.clone())
                    .unwrap_or_default();
                for target in case_targets {
                    if let Some(to) = lookup(target) {
                        self.graph.add_edge(from, to);
                    }
                }
            }
        }

        self.set_function_flag(FunctionFlags::BLOCKS_GENERATED);
        self.graph.calc_dominators();
        self.graph.calc_loop_depth();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_arch, RawOpBuilder};

    #[test]
    fn test_listing_translator_misses() {
        let translator = ListingTranslator::new();
        let arch = test_arch();
        let addr = arch.code_address(0x1000);
        assert!(matches!(
            translator.instruction_length(addr),
            Err(Error::LiftError { address: 0x1000 })
        ));
    }

    #[test]
    fn test_follow_flow_straight_line() {
        let arch = test_arch();
        let b = RawOpBuilder::new(&arch);
        let mut translator = ListingTranslator::new();
        // 0x1000: r0 = COPY #7 ; 0x1004: RETURN r0
        translator.add(
            arch.code_address(0x1000),
            4,
            vec![b.copy(b.register(0, 8), b.constant(7, 8))],
        );
        translator.add(
            arch.code_address(0x1004),
            4,
            vec![b.ret(b.register(0, 8))],
        );

        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        fd.follow_flow(&translator).unwrap();

        assert_eq!(fd.graph().num_blocks(), 1);
        assert_eq!(fd.store().num_alive_ops(), 2);
        assert_eq!(fd.size(), 8);
        fd.verify_integrity().unwrap();
    }

    #[test]
    fn test_follow_flow_diamond() {
        let arch = test_arch();
        let b = RawOpBuilder::new(&arch);
        let mut translator = ListingTranslator::new();
        // 0x1000: CBRANCH 0x100c, r1
        translator.add(
            arch.code_address(0x1000),
            4,
            vec![b.cbranch(0x100c, b.register(8, 1))],
        );
        // 0x1004: r0 = COPY #1 ; 0x1008: BRANCH 0x1010
        translator.add(
            arch.code_address(0x1004),
            4,
            vec![b.copy(b.register(0, 8), b.constant(1, 8))],
        );
        translator.add(arch.code_address(0x1008), 4, vec![b.branch(0x1010)]);
        // 0x100c: r0 = COPY #2
        translator.add(
            arch.code_address(0x100c),
            4,
            vec![b.copy(b.register(0, 8), b.constant(2, 8))],
        );
        // 0x1010: RETURN r0
        translator.add(
            arch.code_address(0x1010),
            4,
            vec![b.ret(b.register(0, 8))],
        );

        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        fd.follow_flow(&translator).unwrap();

        assert_eq!(fd.graph().num_blocks(), 4);
        let entry = fd.graph().entry();
        assert_eq!(fd.graph().block(entry).outs().len(), 2);
        fd.verify_integrity().unwrap();
    }

    #[test]
    fn test_decode_failure_truncates() {
        let arch = test_arch();
        let b = RawOpBuilder::new(&arch);
        let mut translator = ListingTranslator::new();
        // 0x1000 falls through into nothing
        translator.add(
            arch.code_address(0x1000),
            4,
            vec![b.copy(b.register(0, 8), b.constant(1, 8))],
        );

        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        fd.follow_flow(&translator).unwrap();

        assert!(fd
            .flags()
            .contains(FunctionFlags::UNIMPLEMENTED_PRESENT));
        assert!(!fd.warnings().is_empty());
        fd.verify_integrity().unwrap();
    }

    #[test]
    fn test_noreturn_override_stops_flow() {
        let arch = test_arch();
        let b = RawOpBuilder::new(&arch);
        let mut translator = ListingTranslator::new();
        translator.add(arch.code_address(0x1000), 4, vec![b.call(0x2000)]);
        // Fall-through would decode-fail if followed
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        fd.set_flow_override(arch.code_address(0x1000), FlowOverride::NoReturn);
        fd.follow_flow(&translator).unwrap();

        assert!(!fd
            .flags()
            .contains(FunctionFlags::UNIMPLEMENTED_PRESENT));
        assert_eq!(fd.graph().num_blocks(), 1);
    }

    #[test]
    fn test_instruction_limit() {
        let arch = {
            use crate::program::{Architecture, Limits};
            Architecture::builder()
                .limits(Limits {
                    max_instructions: 2,
                    ..Limits::default()
                })
                .build()
                .unwrap()
        };
        let b = RawOpBuilder::new(&arch);
        let mut translator = ListingTranslator::new();
        for i in 0..4u64 {
            translator.add(
                arch.code_address(0x1000 + i * 4),
                4,
                vec![b.copy(b.register(0, 8), b.constant(i, 8))],
            );
        }
        let mut fd = Funcdata::new("f", arch.code_address(0x1000), arch.clone());
        let err = fd.follow_flow(&translator).unwrap_err();
        assert!(matches!(
            err,
            Error::LimitExceeded {
                limit: Limit::Instructions,
                ..
            }
        ));
    }
}
