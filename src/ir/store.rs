//! The per-function container of varnodes and operations.
//!
//! [`IrStore`] owns every [`Varnode`] and [`PcodeOp`] of one function in
//! typed slabs and keeps them reachable through several orderings at once:
//!
//! - varnodes sorted by storage location, then definition (*loc* index)
//! - varnodes sorted by definition, then storage (*def* index)
//! - operations sorted by sequence number
//! - alive and dead operation lists in creation order
//! - alive operations bucketed per opcode, in creation order
//!
//! The linkage API on this type is the only entry point for mutating
//! data-flow edges. Every edit maintains the reader-list invariant: an
//! operation appears exactly once in the descend list of each varnode it
//! reads, regardless of how many slots read it.

use std::collections::BTreeMap;

use strum::EnumCount;

use crate::{
    address::{Address, SpaceId, VarnodeData},
    error::invariant_error,
    ir::{
        op::{OpFlags, OpId, PcodeOp, SeqNum},
        varnode::{Varnode, VarnodeFlags, VarnodeId},
    },
    cfg::BlockId,
    opcodes::OpCode,
    Result,
};

/// Rank of a varnode's definition within the ordered indexes.
///
/// Inputs sort first, then written varnodes by defining sequence number,
/// then free varnodes.
const RANK_INPUT: u8 = 0;
const RANK_WRITTEN: u8 = 1;
const RANK_FREE: u8 = 2;

const ZERO_SEQ: SeqNum = SeqNum {
    pc: Address {
        space: SpaceId(0),
        offset: 0,
    },
    uniq: 0,
};

/// Key of the loc-ordered varnode index: storage first, definition second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct LocKey {
    addr: Address,
    size: u32,
    rank: u8,
    def_seq: SeqNum,
    create: u32,
}

/// Key of the def-ordered varnode index: definition first, storage second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DefKey {
    rank: u8,
    def_seq: SeqNum,
    addr: Address,
    size: u32,
    create: u32,
}

/// Container and mutation authority for one function's data-flow graph.
pub struct IrStore {
    vars: Vec<Option<Varnode>>,
    ops: Vec<Option<PcodeOp>>,

    loc_index: BTreeMap<LocKey, VarnodeId>,
    def_index: BTreeMap<DefKey, VarnodeId>,

    seq_index: BTreeMap<SeqNum, OpId>,
    alive: BTreeMap<u32, OpId>,
    dead: BTreeMap<u32, OpId>,
    opcode_index: Vec<BTreeMap<u32, OpId>>,

    constant_space: SpaceId,
    unique_space: SpaceId,
    iop_space: SpaceId,

    create_index: u32,
    op_uniq: u32,
    next_unique_offset: u64,
    destroyed_vars: u32,
}

impl IrStore {
    /// Creates an empty store bound to the given analysis-internal spaces.
    #[must_use]
    pub fn new(constant_space: SpaceId, unique_space: SpaceId, iop_space: SpaceId) -> Self {
        Self {
            vars: Vec::new(),
            ops: Vec::new(),
            loc_index: BTreeMap::new(),
            def_index: BTreeMap::new(),
            seq_index: BTreeMap::new(),
            alive: BTreeMap::new(),
            dead: BTreeMap::new(),
            opcode_index: (0..OpCode::COUNT).map(|_| BTreeMap::new()).collect(),
            constant_space,
            unique_space,
            iop_space,
            create_index: 0,
            op_uniq: 0,
            next_unique_offset: 0,
            destroyed_vars: 0,
        }
    }

    // ===== accessors =====

    /// Returns the varnode with the given id.
    ///
    /// # Panics
    ///
    /// Panics if the varnode was destroyed or the id is foreign.
    #[must_use]
    pub fn var(&self, id: VarnodeId) -> &Varnode {
        self.vars[id.index()].as_ref().expect("stale varnode id")
    }

    /// Returns a mutable reference to the varnode with the given id.
    ///
    /// Linkage fields are not reachable through this; only properties,
    /// types, masks, and bindings can be changed.
    pub fn var_mut(&mut self, id: VarnodeId) -> &mut Varnode {
        self.vars[id.index()].as_mut().expect("stale varnode id")
    }

    /// Returns `true` if the id refers to a live (not destroyed) varnode.
    #[must_use]
    pub fn var_exists(&self, id: VarnodeId) -> bool {
        self.vars.get(id.index()).is_some_and(Option::is_some)
    }

    /// Returns the operation with the given id.
    ///
    /// # Panics
    ///
    /// Panics if the operation was destroyed or the id is foreign.
    #[must_use]
    pub fn op(&self, id: OpId) -> &PcodeOp {
        self.ops[id.index()].as_ref().expect("stale op id")
    }

    /// Returns a mutable reference to the operation with the given id.
    pub fn op_mut(&mut self, id: OpId) -> &mut PcodeOp {
        self.ops[id.index()].as_mut().expect("stale op id")
    }

    /// Returns `true` if the id refers to a live (not destroyed) operation.
    #[must_use]
    pub fn op_exists(&self, id: OpId) -> bool {
        self.ops.get(id.index()).is_some_and(Option::is_some)
    }

    /// Returns the number of live varnodes.
    #[must_use]
    pub fn num_varnodes(&self) -> usize {
        self.loc_index.len()
    }

    /// Returns the number of operations, alive and dead.
    #[must_use]
    pub fn num_ops(&self) -> usize {
        self.alive.len() + self.dead.len()
    }

    /// Returns the number of alive operations.
    #[must_use]
    pub fn num_alive_ops(&self) -> usize {
        self.alive.len()
    }

    /// Returns the current varnode creation counter.
    #[must_use]
    pub const fn create_index(&self) -> u32 {
        self.create_index
    }

    /// Returns the constant space id this store allocates constants in.
    #[must_use]
    pub const fn constant_space(&self) -> SpaceId {
        self.constant_space
    }

    /// Returns the iop annotation space id.
    #[must_use]
    pub const fn iop_space(&self) -> SpaceId {
        self.iop_space
    }

    // ===== index maintenance =====

    fn rank_of(vn: &Varnode) -> (u8, SeqNum) {
        if vn.is_input() {
            (RANK_INPUT, ZERO_SEQ)
        } else if vn.is_written() {
            (RANK_WRITTEN, ZERO_SEQ)
        } else {
            (RANK_FREE, ZERO_SEQ)
        }
    }

    fn loc_key(&self, id: VarnodeId) -> LocKey {
        let vn = self.var(id);
        let (rank, mut def_seq) = Self::rank_of(vn);
        if let Some(def) = vn.def() {
            def_seq = self.op(def).seq();
        }
        LocKey {
            addr: vn.storage().addr,
            size: vn.size(),
            rank,
            def_seq,
            create: vn.create_index(),
        }
    }

    fn def_key(&self, id: VarnodeId) -> DefKey {
        let vn = self.var(id);
        let (rank, mut def_seq) = Self::rank_of(vn);
        if let Some(def) = vn.def() {
            def_seq = self.op(def).seq();
        }
        DefKey {
            rank,
            def_seq,
            addr: vn.storage().addr,
            size: vn.size(),
            create: vn.create_index(),
        }
    }

    fn index_var(&mut self, id: VarnodeId) {
        let lk = self.loc_key(id);
        let dk = self.def_key(id);
        self.loc_index.insert(lk, id);
        self.def_index.insert(dk, id);
    }

    fn unindex_var(&mut self, id: VarnodeId) {
        let lk = self.loc_key(id);
        let dk = self.def_key(id);
        self.loc_index.remove(&lk);
        self.def_index.remove(&dk);
    }

    // ===== varnode factories =====

    fn alloc_var(&mut self, storage: VarnodeData, flags: VarnodeFlags) -> VarnodeId {
        let id = VarnodeId(u32::try_from(self.vars.len()).expect("varnode slab overflow"));
        let vn = Varnode::new(storage, self.create_index, flags);
        self.create_index += 1;
        self.vars.push(Some(vn));
        self.index_var(id);
        id
    }

    /// Creates a free varnode with the given storage.
    pub fn new_varnode(&mut self, size: u32, addr: Address) -> VarnodeId {
        let flags = if addr.space == self.constant_space {
            VarnodeFlags::CONSTANT
        } else {
            VarnodeFlags::empty()
        };
        self.alloc_var(VarnodeData::new(addr, size), flags)
    }

    /// Creates a constant varnode whose offset is the value.
    ///
    /// Constants are never shared; each call mints a fresh varnode even for
    /// an identical value.
    pub fn new_constant(&mut self, size: u32, value: u64) -> VarnodeId {
        let masked = value & crate::ir::varnode::size_mask(size);
        self.alloc_var(
            VarnodeData::new(Address::new(self.constant_space, masked), size),
            VarnodeFlags::CONSTANT,
        )
    }

    /// Creates a temporary in the unique space.
    pub fn new_unique(&mut self, size: u32) -> VarnodeId {
        let offset = self.next_unique_offset;
        self.next_unique_offset += 0x10;
        self.new_varnode(size, Address::new(self.unique_space, offset))
    }

    /// Creates a varnode and atomically binds it as the output of `op`.
    ///
    /// # Errors
    ///
    /// Fails if `op` already has an output bound.
    pub fn new_varnode_out(&mut self, size: u32, addr: Address, op: OpId) -> Result<VarnodeId> {
        let vn = self.new_varnode(size, addr);
        self.set_output(op, vn)?;
        Ok(vn)
    }

    /// Creates a unique-space temporary bound as the output of `op`.
    ///
    /// # Errors
    ///
    /// Fails if `op` already has an output bound.
    pub fn new_unique_out(&mut self, size: u32, op: OpId) -> Result<VarnodeId> {
        let vn = self.new_unique(size);
        self.set_output(op, vn)?;
        Ok(vn)
    }

    /// Creates an annotation varnode referencing another operation.
    ///
    /// The varnode lives in the iop space with the referenced op's slab
    /// index as its offset; it carries no data-flow.
    pub fn new_annotation_iop(&mut self, target: OpId) -> VarnodeId {
        self.alloc_var(
            VarnodeData::new(
                Address::new(self.iop_space, u64::from(target.0)),
                8,
            ),
            VarnodeFlags::ANNOTATION,
        )
    }

    /// Resolves an iop annotation varnode back to the operation it names.
    #[must_use]
    pub fn annotation_target(&self, vn: VarnodeId) -> Option<OpId> {
        let v = self.var(vn);
        if v.is_annotation() && v.storage().addr.space == self.iop_space {
            let id = OpId(u32::try_from(v.storage().addr.offset).ok()?);
            self.op_exists(id).then_some(id)
        } else {
            None
        }
    }

    /// Marks a free varnode as a function input.
    ///
    /// # Errors
    ///
    /// Fails if the varnode is written.
    pub fn mark_input(&mut self, id: VarnodeId) -> Result<VarnodeId> {
        if self.var(id).is_written() {
            return Err(invariant_error!("cannot mark written varnode {id} as input"));
        }
        if self.var(id).is_input() {
            return Ok(id);
        }
        self.unindex_var(id);
        self.var_raw_mut(id).flags |= VarnodeFlags::INPUT;
        self.index_var(id);
        Ok(id)
    }

    /// Destroys a varnode that nothing references.
    ///
    /// # Errors
    ///
    /// Fails if the varnode is written, is an input, or still has readers.
    pub fn destroy_varnode(&mut self, id: VarnodeId) -> Result<()> {
        let vn = self.var(id);
        if vn.def().is_some() || vn.is_input() {
            return Err(invariant_error!("destroying non-free varnode {id}"));
        }
        if !vn.has_no_descend() {
            return Err(invariant_error!("destroying varnode {id} with live reads"));
        }
        self.unindex_var(id);
        self.vars[id.index()] = None;
        self.destroyed_vars += 1;
        Ok(())
    }

    fn var_raw_mut(&mut self, id: VarnodeId) -> &mut Varnode {
        self.vars[id.index()].as_mut().expect("stale varnode id")
    }

    fn op_raw_mut(&mut self, id: OpId) -> &mut PcodeOp {
        self.ops[id.index()].as_mut().expect("stale op id")
    }

    // ===== op factories =====

    /// Creates a detached operation with `num_inputs` empty slots at the
    /// given instruction address. The op starts on the dead list.
    pub fn new_op(&mut self, opcode: OpCode, num_inputs: usize, pc: Address) -> OpId {
        let seq = SeqNum::new(pc, self.op_uniq);
        self.op_uniq += 1;
        self.insert_new_op(PcodeOp::new(opcode, num_inputs, seq))
    }

    /// Creates a detached operation with an explicit sequence number.
    ///
    /// Used when restoring persisted state; the internal creation counter is
    /// bumped past the given uniq so later ops stay unique.
    pub fn new_op_seq(&mut self, opcode: OpCode, num_inputs: usize, seq: SeqNum) -> OpId {
        if seq.uniq >= self.op_uniq {
            self.op_uniq = seq.uniq + 1;
        }
        self.insert_new_op(PcodeOp::new(opcode, num_inputs, seq))
    }

    fn insert_new_op(&mut self, op: PcodeOp) -> OpId {
        let id = OpId(u32::try_from(self.ops.len()).expect("op slab overflow"));
        let uniq = op.seq().uniq;
        self.seq_index.insert(op.seq(), id);
        self.dead.insert(uniq, id);
        self.ops.push(Some(op));
        id
    }

    /// Clones an operation: same opcode, flags, and input arity, fresh
    /// sequence number at the same address, no output, detached.
    pub fn clone_op(&mut self, src: OpId) -> OpId {
        let (opcode, ninputs, pc, flags) = {
            let op = self.op(src);
            (op.opcode(), op.num_inputs(), op.addr(), op.flags())
        };
        let id = self.new_op(opcode, ninputs, pc);
        self.op_raw_mut(id).flags = flags;
        id
    }

    /// Destroys a dead operation, unlinking its operands first.
    ///
    /// The output varnode, if free of readers, is destroyed with the op;
    /// input constants orphaned by the unlink are destroyed as well.
    ///
    /// # Errors
    ///
    /// Fails if the op is still attached to a block, or if its output still
    /// has readers.
    pub fn destroy_op(&mut self, id: OpId) -> Result<()> {
        if self.op(id).is_alive() {
            return Err(invariant_error!("destroying op {id} still in a block"));
        }
        if let Some(out) = self.op(id).output() {
            if !self.var(out).has_no_descend() {
                return Err(invariant_error!(
                    "destroying op {id} whose output {out} has live reads"
                ));
            }
            self.unset_output(id)?;
            self.destroy_varnode(out)?;
        }
        for slot in (0..self.op(id).num_inputs()).rev() {
            if self.op(id).input(slot).is_some() {
                self.unset_input(id, slot)?;
            }
        }
        let seq = self.op(id).seq();
        self.seq_index.remove(&seq);
        self.dead.remove(&seq.uniq);
        self.ops[id.index()] = None;
        Ok(())
    }

    // ===== linkage edits =====

    /// Changes the opcode of an operation, rebucketing its rule index entry.
    pub fn set_opcode(&mut self, id: OpId, opcode: OpCode) {
        let (old, uniq, alive) = {
            let op = self.op(id);
            (op.opcode(), op.seq().uniq, op.is_alive())
        };
        if old == opcode {
            return;
        }
        if alive {
            self.opcode_index[old.index()].remove(&uniq);
            self.opcode_index[opcode.index()].insert(uniq, id);
        }
        let op = self.op_raw_mut(id);
        op.opcode = opcode;
        op.clear_flag(OpFlags::BRANCH | OpFlags::CALL);
        if opcode.is_branch() {
            op.set_flag(OpFlags::BRANCH);
        }
        if opcode.is_call() {
            op.set_flag(OpFlags::CALL);
        }
    }

    /// Removes `op` from the descend list of `vn` unless another slot of the
    /// same op still reads it.
    fn remove_reader(&mut self, op: OpId, vn: VarnodeId) -> Result<()> {
        let still_reads = self
            .op(op)
            .inputs()
            .iter()
            .filter(|&&i| i == Some(vn))
            .count()
            > 0;
        if still_reads {
            return Ok(());
        }
        let list = &mut self.var_raw_mut(vn).descend;
        match list.iter().position(|&o| o == op) {
            Some(pos) => {
                list.remove(pos);
                Ok(())
            }
            None => Err(invariant_error!(
                "reader {op} missing from descend list of {vn}"
            )),
        }
    }

    /// Adds `op` to the descend list of `vn` if not already present.
    fn add_reader(&mut self, op: OpId, vn: VarnodeId) {
        let list = &mut self.var_raw_mut(vn).descend;
        if !list.contains(&op) {
            list.push(op);
        }
    }

    /// Drops a constant or annotation varnode that lost its last reader.
    fn reap_constant(&mut self, vn: VarnodeId) -> Result<()> {
        if self.var_exists(vn) {
            let v = self.var(vn);
            if (v.is_constant() || v.is_annotation())
                && v.has_no_descend()
                && v.def().is_none()
                && !v.is_input()
            {
                self.destroy_varnode(vn)?;
            }
        }
        Ok(())
    }

    /// Sets the varnode read through input slot `slot` of `op`.
    ///
    /// A constant varnode that already has a different reader is duplicated
    /// first, preserving the rule that a constant feeds at most one op.
    ///
    /// # Errors
    ///
    /// Fails if a previously occupied slot's reader-list entry cannot be
    /// found.
    pub fn set_input(&mut self, op: OpId, vn: VarnodeId, slot: usize) -> Result<()> {
        let old = self.op(op).input(slot);
        if old == Some(vn) {
            return Ok(());
        }

        // Duplicate a shared constant rather than adding a second reader.
        let vn = {
            let v = self.var(vn);
            if v.is_constant() && v.descend().iter().any(|&o| o != op) {
                let (size, value) = (v.size(), v.storage().addr.offset);
                self.new_constant(size, value)
            } else {
                vn
            }
        };

        if let Some(old_vn) = old {
            self.op_raw_mut(op).inputs[slot] = None;
            self.remove_reader(op, old_vn)?;
            self.reap_constant(old_vn)?;
        }
        self.add_reader(op, vn);
        self.op_raw_mut(op).inputs[slot] = Some(vn);
        Ok(())
    }

    /// Clears input slot `slot` of `op`, leaving the slot empty.
    ///
    /// # Errors
    ///
    /// Fails if the reader-list entry cannot be found.
    pub fn unset_input(&mut self, op: OpId, slot: usize) -> Result<()> {
        let Some(vn) = self.op(op).input(slot) else {
            return Ok(());
        };
        self.op_raw_mut(op).inputs[slot] = None;
        self.remove_reader(op, vn)?;
        self.reap_constant(vn)
    }

    /// Inserts a new input slot at `slot` reading `vn`, shifting later
    /// slots up.
    ///
    /// # Errors
    ///
    /// Fails on reader-list inconsistency.
    pub fn insert_input(&mut self, op: OpId, vn: VarnodeId, slot: usize) -> Result<()> {
        self.op_raw_mut(op).inputs.insert(slot, None);
        self.set_input(op, vn, slot)
    }

    /// Removes input slot `slot` entirely, shifting later slots down.
    ///
    /// # Errors
    ///
    /// Fails on reader-list inconsistency.
    pub fn remove_input(&mut self, op: OpId, slot: usize) -> Result<()> {
        self.unset_input(op, slot)?;
        self.op_raw_mut(op).inputs.remove(slot);
        Ok(())
    }

    /// Replaces the whole input list of `op`.
    ///
    /// # Errors
    ///
    /// Fails on reader-list inconsistency.
    pub fn set_all_inputs(&mut self, op: OpId, inputs: &[VarnodeId]) -> Result<()> {
        for slot in (0..self.op(op).num_inputs()).rev() {
            self.unset_input(op, slot)?;
        }
        self.op_raw_mut(op).inputs.resize(inputs.len(), None);
        for (slot, &vn) in inputs.iter().enumerate() {
            self.set_input(op, vn, slot)?;
        }
        Ok(())
    }

    /// Swaps two input slots of `op`. Reader lists are unaffected.
    pub fn swap_inputs(&mut self, op: OpId, a: usize, b: usize) {
        self.op_raw_mut(op).inputs.swap(a, b);
    }

    /// Binds `vn` as the output of `op`.
    ///
    /// # Errors
    ///
    /// Fails if `op` already has an output, or if `vn` is already written
    /// or is an input.
    pub fn set_output(&mut self, op: OpId, vn: VarnodeId) -> Result<()> {
        if let Some(existing) = self.op(op).output() {
            return Err(invariant_error!(
                "op {op} already has output {existing} bound"
            ));
        }
        {
            let v = self.var(vn);
            if v.def().is_some() {
                return Err(invariant_error!("varnode {vn} is already defined"));
            }
            if v.is_input() {
                return Err(invariant_error!("cannot write input varnode {vn}"));
            }
        }
        self.unindex_var(vn);
        {
            let v = self.var_raw_mut(vn);
            v.def = Some(op);
            v.flags |= VarnodeFlags::WRITTEN;
        }
        self.index_var(vn);
        self.op_raw_mut(op).output = Some(vn);
        Ok(())
    }

    /// Unbinds the output of `op`; the varnode becomes free but survives.
    ///
    /// # Errors
    ///
    /// Never fails today; the `Result` reserves room for stricter checks.
    pub fn unset_output(&mut self, op: OpId) -> Result<()> {
        let Some(vn) = self.op(op).output() else {
            return Ok(());
        };
        self.unindex_var(vn);
        {
            let v = self.var_raw_mut(vn);
            v.def = None;
            v.flags &= !VarnodeFlags::WRITTEN;
        }
        self.index_var(vn);
        self.op_raw_mut(op).output = None;
        Ok(())
    }

    // ===== alive/dead transitions =====

    /// Attaches a dead op to a block. The op list of the block itself is
    /// maintained by the function container.
    pub(crate) fn mark_alive(&mut self, id: OpId, block: BlockId) {
        let uniq = self.op(id).seq().uniq;
        if self.dead.remove(&uniq).is_some() {
            self.alive.insert(uniq, id);
            let opc = self.op(id).opcode();
            self.opcode_index[opc.index()].insert(uniq, id);
        }
        self.op_raw_mut(id).parent = Some(block);
    }

    /// Detaches an op from its block back onto the dead list.
    pub(crate) fn mark_dead(&mut self, id: OpId) {
        let uniq = self.op(id).seq().uniq;
        if self.alive.remove(&uniq).is_some() {
            self.dead.insert(uniq, id);
            let opc = self.op(id).opcode();
            self.opcode_index[opc.index()].remove(&uniq);
        }
        self.op_raw_mut(id).parent = None;
    }

    /// Records the in-block position of an op.
    pub(crate) fn set_order(&mut self, id: OpId, order: u32) {
        self.op_raw_mut(id).order = order;
    }

    // ===== queries =====

    /// Iterates alive operations in creation order.
    pub fn alive_ops(&self) -> impl Iterator<Item = OpId> + '_ {
        self.alive.values().copied()
    }

    /// Iterates dead operations in creation order.
    pub fn dead_ops(&self) -> impl Iterator<Item = OpId> + '_ {
        self.dead.values().copied()
    }

    /// Returns the first alive op with creation counter strictly greater
    /// than `cursor`, for iteration that survives mutation.
    #[must_use]
    pub fn next_alive_after(&self, cursor: Option<u32>) -> Option<(u32, OpId)> {
        let start = cursor.map_or(0, |c| c.saturating_add(1));
        self.alive.range(start..).next().map(|(&k, &v)| (k, v))
    }

    /// Returns the alive op with exactly the given creation counter.
    #[must_use]
    pub fn alive_op_at(&self, key: u32) -> Option<OpId> {
        self.alive.get(&key).copied()
    }

    /// Returns the first alive op with the given opcode past `cursor`.
    #[must_use]
    pub fn next_by_opcode_after(&self, opcode: OpCode, cursor: Option<u32>) -> Option<(u32, OpId)> {
        let start = cursor.map_or(0, |c| c.saturating_add(1));
        self.opcode_index[opcode.index()]
            .range(start..)
            .next()
            .map(|(&k, &v)| (k, v))
    }

    /// Iterates alive operations with the given opcode in creation order.
    pub fn ops_by_opcode(&self, opcode: OpCode) -> impl Iterator<Item = OpId> + '_ {
        self.opcode_index[opcode.index()].values().copied()
    }

    /// Looks up an operation by exact sequence number.
    #[must_use]
    pub fn find_op(&self, seq: SeqNum) -> Option<OpId> {
        self.seq_index.get(&seq).copied()
    }

    /// Iterates all operations lifted from the given instruction address.
    pub fn ops_at(&self, pc: Address) -> impl Iterator<Item = OpId> + '_ {
        let lo = SeqNum::new(pc, 0);
        let hi = SeqNum::new(pc, u32::MAX);
        self.seq_index.range(lo..=hi).map(|(_, &id)| id)
    }

    /// Returns the first alive op at the given instruction address.
    #[must_use]
    pub fn target(&self, pc: Address) -> Option<OpId> {
        self.ops_at(pc).find(|&id| self.op(id).is_alive())
    }

    /// Iterates all varnodes ordered by storage location.
    pub fn iter_loc(&self) -> impl Iterator<Item = VarnodeId> + '_ {
        self.loc_index.values().copied()
    }

    /// Iterates all varnodes ordered by definition.
    pub fn iter_def(&self) -> impl Iterator<Item = VarnodeId> + '_ {
        self.def_index.values().copied()
    }

    /// Iterates varnodes whose storage lies in the given space.
    pub fn varnodes_in_space(&self, space: SpaceId) -> impl Iterator<Item = VarnodeId> + '_ {
        let lo = LocKey {
            addr: Address::new(space, 0),
            size: 0,
            rank: 0,
            def_seq: ZERO_SEQ,
            create: 0,
        };
        self.loc_index
            .range(lo..)
            .take_while(move |(k, _)| k.addr.space == space)
            .map(|(_, &id)| id)
    }

    /// Iterates varnodes whose storage starts within `[addr, addr+size)`.
    pub fn varnodes_starting_in(
        &self,
        addr: Address,
        size: u64,
    ) -> impl Iterator<Item = VarnodeId> + '_ {
        let lo = LocKey {
            addr,
            size: 0,
            rank: 0,
            def_seq: ZERO_SEQ,
            create: 0,
        };
        let end = addr.offset.saturating_add(size);
        self.loc_index
            .range(lo..)
            .take_while(move |(k, _)| k.addr.space == addr.space && k.addr.offset < end)
            .map(|(_, &id)| id)
    }

    /// Finds an input varnode with exactly the given storage.
    #[must_use]
    pub fn find_input(&self, size: u32, addr: Address) -> Option<VarnodeId> {
        self.varnodes_starting_in(addr, 1)
            .find(|&id| {
                let v = self.var(id);
                v.is_input() && v.storage().addr == addr && v.size() == size
            })
    }

    /// Finds an input varnode whose storage fully contains the given range.
    #[must_use]
    pub fn find_covering_input(&self, size: u32, addr: Address) -> Option<VarnodeId> {
        let probe = VarnodeData::new(addr, size);
        self.varnodes_in_space(addr.space).find(|&id| {
            let v = self.var(id);
            v.is_input() && v.storage().contains(&probe)
        })
    }

    // ===== integrity =====

    /// Walks the whole graph checking the §reader-list and output-binding
    /// invariants. Intended for tests and action-boundary assertions.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn verify_integrity(&self) -> Result<()> {
        for (idx, slot) in self.ops.iter().enumerate() {
            let Some(op) = slot else { continue };
            let id = OpId(u32::try_from(idx).unwrap_or(u32::MAX));
            for (s, input) in op.inputs().iter().enumerate() {
                let Some(vn) = input else { continue };
                if !self.var_exists(*vn) {
                    return Err(invariant_error!("op {id} slot {s} reads destroyed varnode"));
                }
                let count = self.var(*vn).descend().iter().filter(|&&o| o == id).count();
                if count != 1 {
                    return Err(invariant_error!(
                        "op {id} appears {count} times in descend of {vn}"
                    ));
                }
            }
            if let Some(out) = op.output() {
                if self.var(out).def() != Some(id) {
                    return Err(invariant_error!("output {out} of {id} not defined by it"));
                }
            }
        }
        for (idx, slot) in self.vars.iter().enumerate() {
            let Some(vn) = slot else { continue };
            let id = VarnodeId(u32::try_from(idx).unwrap_or(u32::MAX));
            if let Some(def) = vn.def() {
                if self.op(def).output() != Some(id) {
                    return Err(invariant_error!("definer of {id} does not output it"));
                }
            }
            for &reader in vn.descend() {
                if !self.op_exists(reader) {
                    return Err(invariant_error!("{id} lists destroyed reader"));
                }
                if self.op(reader).slot_of(id).is_none() {
                    return Err(invariant_error!("{id} lists non-reading op {reader}"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> IrStore {
        IrStore::new(SpaceId(0), SpaceId(1), SpaceId(2))
    }

    fn pc(offset: u64) -> Address {
        Address::new(SpaceId(4), offset)
    }

    fn reg(offset: u64) -> Address {
        Address::new(SpaceId(3), offset)
    }

    #[test]
    fn test_varnode_factories() {
        let mut store = test_store();
        let a = store.new_varnode(4, reg(0x10));
        let c = store.new_constant(4, 0x1234);
        let u = store.new_unique(8);

        assert!(store.var(a).is_free());
        assert!(store.var(c).is_constant());
        assert_eq!(store.var(c).constant_value(), Some(0x1234));
        assert_eq!(store.var(u).size(), 8);
        assert_eq!(store.num_varnodes(), 3);
        assert!(store.var(a).create_index() < store.var(c).create_index());
    }

    #[test]
    fn test_constant_masked_to_size() {
        let mut store = test_store();
        let c = store.new_constant(2, 0x12345);
        assert_eq!(store.var(c).constant_value(), Some(0x2345));
    }

    #[test]
    fn test_set_input_maintains_readers() {
        let mut store = test_store();
        let op = store.new_op(OpCode::IntAdd, 2, pc(0x100));
        let a = store.new_varnode(4, reg(0x10));
        let b = store.new_varnode(4, reg(0x14));

        store.set_input(op, a, 0).unwrap();
        store.set_input(op, b, 1).unwrap();
        assert_eq!(store.var(a).descend(), &[op]);
        assert_eq!(store.var(b).descend(), &[op]);

        // Replacing slot 1 removes the old reader
        let c = store.new_varnode(4, reg(0x18));
        store.set_input(op, c, 1).unwrap();
        assert!(store.var(b).has_no_descend());
        assert_eq!(store.var(c).descend(), &[op]);
        store.verify_integrity().unwrap();
    }

    #[test]
    fn test_same_var_in_two_slots_listed_once() {
        let mut store = test_store();
        let op = store.new_op(OpCode::IntAdd, 2, pc(0x100));
        let a = store.new_varnode(4, reg(0x10));

        store.set_input(op, a, 0).unwrap();
        store.set_input(op, a, 1).unwrap();
        assert_eq!(store.var(a).descend(), &[op]);

        // Unsetting one slot keeps the reader; the other slot still reads it
        store.unset_input(op, 0).unwrap();
        assert_eq!(store.var(a).descend(), &[op]);
        store.unset_input(op, 1).unwrap();
        assert!(store.var(a).has_no_descend());
        store.verify_integrity().unwrap();
    }

    #[test]
    fn test_constant_duplicated_on_sharing() {
        let mut store = test_store();
        let op1 = store.new_op(OpCode::Copy, 1, pc(0x100));
        let op2 = store.new_op(OpCode::Copy, 1, pc(0x104));
        let c = store.new_constant(4, 7);

        store.set_input(op1, c, 0).unwrap();
        store.set_input(op2, c, 0).unwrap();

        let c2 = store.op(op2).input(0).unwrap();
        assert_ne!(c, c2, "second reader must get a duplicate");
        assert_eq!(store.var(c2).constant_value(), Some(7));
        assert_eq!(store.var(c).descend(), &[op1]);
        assert_eq!(store.var(c2).descend(), &[op2]);
        store.verify_integrity().unwrap();
    }

    #[test]
    fn test_orphaned_constant_reaped() {
        let mut store = test_store();
        let op = store.new_op(OpCode::Copy, 1, pc(0x100));
        let c = store.new_constant(4, 7);
        store.set_input(op, c, 0).unwrap();
        store.unset_input(op, 0).unwrap();
        assert!(!store.var_exists(c));
    }

    #[test]
    fn test_output_binding() {
        let mut store = test_store();
        let op = store.new_op(OpCode::Copy, 1, pc(0x100));
        let out = store.new_varnode_out(4, reg(0x10), op).unwrap();

        assert!(store.var(out).is_written());
        assert_eq!(store.var(out).def(), Some(op));
        assert_eq!(store.op(op).output(), Some(out));

        // Double binding is an invariant violation
        let other = store.new_varnode(4, reg(0x14));
        assert!(store.set_output(op, other).is_err());

        store.unset_output(op).unwrap();
        assert!(store.var(out).is_free());
        assert!(store.var_exists(out));
        store.verify_integrity().unwrap();
    }

    #[test]
    fn test_rebinding_written_varnode_rejected() {
        let mut store = test_store();
        let op1 = store.new_op(OpCode::Copy, 1, pc(0x100));
        let op2 = store.new_op(OpCode::Copy, 1, pc(0x104));
        let out = store.new_varnode_out(4, reg(0x10), op1).unwrap();
        assert!(store.set_output(op2, out).is_err());
    }

    #[test]
    fn test_insert_remove_input_slots() {
        let mut store = test_store();
        let call = store.new_op(OpCode::Call, 1, pc(0x100));
        let target = store.new_constant(8, 0x4000);
        store.set_input(call, target, 0).unwrap();

        let arg = store.new_varnode(4, reg(0x10));
        store.insert_input(call, arg, 1).unwrap();
        assert_eq!(store.op(call).num_inputs(), 2);
        assert_eq!(store.op(call).input(1), Some(arg));

        store.remove_input(call, 1).unwrap();
        assert_eq!(store.op(call).num_inputs(), 1);
        assert!(store.var(arg).has_no_descend());
        store.verify_integrity().unwrap();
    }

    #[test]
    fn test_zero_input_call_linkage() {
        let mut store = test_store();
        let call = store.new_op(OpCode::Call, 0, pc(0x100));
        // Linkage edits on a zero-input op touch no reader lists
        store.set_all_inputs(call, &[]).unwrap();
        assert_eq!(store.op(call).num_inputs(), 0);
        store.verify_integrity().unwrap();
    }

    #[test]
    fn test_swap_inputs() {
        let mut store = test_store();
        let op = store.new_op(OpCode::IntSub, 2, pc(0x100));
        let a = store.new_varnode(4, reg(0x10));
        let b = store.new_varnode(4, reg(0x14));
        store.set_input(op, a, 0).unwrap();
        store.set_input(op, b, 1).unwrap();
        store.swap_inputs(op, 0, 1);
        assert_eq!(store.op(op).input(0), Some(b));
        assert_eq!(store.op(op).input(1), Some(a));
        store.verify_integrity().unwrap();
    }

    #[test]
    fn test_set_opcode_rebuckets() {
        let mut store = test_store();
        let op = store.new_op(OpCode::IntAdd, 2, pc(0x100));
        store.mark_alive(op, BlockId(0));
        assert_eq!(store.ops_by_opcode(OpCode::IntAdd).count(), 1);

        store.set_opcode(op, OpCode::IntSub);
        assert_eq!(store.ops_by_opcode(OpCode::IntAdd).count(), 0);
        assert_eq!(store.ops_by_opcode(OpCode::IntSub).count(), 1);
    }

    #[test]
    fn test_destroy_op_rejects_alive() {
        let mut store = test_store();
        let op = store.new_op(OpCode::Copy, 1, pc(0x100));
        store.mark_alive(op, BlockId(0));
        assert!(store.destroy_op(op).is_err());
        store.mark_dead(op);
        store.destroy_op(op).unwrap();
        assert!(!store.op_exists(op));
    }

    #[test]
    fn test_destroy_op_reaps_operands() {
        let mut store = test_store();
        let op = store.new_op(OpCode::IntAdd, 2, pc(0x100));
        let c1 = store.new_constant(4, 1);
        let c2 = store.new_constant(4, 2);
        store.set_input(op, c1, 0).unwrap();
        store.set_input(op, c2, 1).unwrap();
        let out = store.new_unique_out(4, op).unwrap();

        store.destroy_op(op).unwrap();
        assert!(!store.var_exists(c1));
        assert!(!store.var_exists(c2));
        assert!(!store.var_exists(out));
        store.verify_integrity().unwrap();
    }

    #[test]
    fn test_seq_lookup_and_addr_range() {
        let mut store = test_store();
        let op1 = store.new_op(OpCode::Copy, 1, pc(0x100));
        let op2 = store.new_op(OpCode::IntAdd, 2, pc(0x100));
        let op3 = store.new_op(OpCode::Return, 0, pc(0x104));

        let seq = store.op(op2).seq();
        assert_eq!(store.find_op(seq), Some(op2));

        let at_100: Vec<_> = store.ops_at(pc(0x100)).collect();
        assert_eq!(at_100, vec![op1, op2]);

        store.mark_alive(op3, BlockId(0));
        assert_eq!(store.target(pc(0x104)), Some(op3));
        assert_eq!(store.target(pc(0x100)), None);
    }

    #[test]
    fn test_loc_index_space_queries() {
        let mut store = test_store();
        let _r1 = store.new_varnode(4, reg(0x10));
        let _r2 = store.new_varnode(4, reg(0x20));
        let _u = store.new_unique(4);

        assert_eq!(store.varnodes_in_space(SpaceId(3)).count(), 2);
        assert_eq!(store.varnodes_in_space(SpaceId(1)).count(), 1);
        assert_eq!(store.varnodes_starting_in(reg(0x10), 8).count(), 1);
        assert_eq!(store.varnodes_starting_in(reg(0x10), 0x20).count(), 2);
    }

    #[test]
    fn test_input_queries() {
        let mut store = test_store();
        let a = store.new_varnode(4, reg(0x10));
        store.mark_input(a).unwrap();

        assert_eq!(store.find_input(4, reg(0x10)), Some(a));
        assert_eq!(store.find_input(2, reg(0x10)), None);

        let b = store.new_varnode(8, reg(0x20));
        store.mark_input(b).unwrap();
        assert_eq!(store.find_covering_input(4, reg(0x24)), Some(b));
        assert_eq!(store.find_covering_input(4, reg(0x2c)), None);
    }

    #[test]
    fn test_annotation_round_trip() {
        let mut store = test_store();
        let call = store.new_op(OpCode::Call, 1, pc(0x100));
        let ann = store.new_annotation_iop(call);
        assert!(store.var(ann).is_annotation());
        assert_eq!(store.annotation_target(ann), Some(call));
    }

    #[test]
    fn test_clone_op_copies_shape() {
        let mut store = test_store();
        let op = store.new_op(OpCode::CBranch, 2, pc(0x100));
        store.op_mut(op).set_flag(OpFlags::BOOLEAN_FLIP);
        let dup = store.clone_op(op);

        assert_eq!(store.op(dup).opcode(), OpCode::CBranch);
        assert_eq!(store.op(dup).num_inputs(), 2);
        assert!(store.op(dup).flags().contains(OpFlags::BOOLEAN_FLIP));
        assert_ne!(store.op(dup).seq(), store.op(op).seq());
        assert_eq!(store.op(dup).addr(), store.op(op).addr());
        assert!(!store.op(dup).is_alive());
    }
}
