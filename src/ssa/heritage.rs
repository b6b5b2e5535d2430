//! One-pass-at-a-time SSA construction.
//!
//! Each call to [`Heritage::heritage_pass`] links the eligible free
//! varnodes of one pass into the data-flow graph: overlapping accesses are
//! refined to a common partition, INDIRECT guards are inserted at calls and
//! stores, phi operations are placed with the Bilardi–Pingali augmented
//! dominator tree, and reads are renamed to their reaching definitions with
//! the Cytron et al. stack algorithm.
//!
//! Phi placement follows
//! "The Static Single Assignment Form and its Computation",
//! G. Bilardi and K. Pingali, 1999; renaming follows
//! "Efficiently computing static single assignment form and the control
//! dependence graph", Cytron et al., TOPLAS 13(4), 1991.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    address::{Address, SpaceId, SpaceKind, SpaceManager, VarnodeData},
    cfg::BlockId,
    error::Limit,
    func::{Funcdata, FunctionFlags},
    ir::{OpId, VarnodeFlags, VarnodeId},
    opcodes::OpCode,
    ssa::location::{Intersect, LocationMap},
    Error, Result,
};

/// A storage range known to be the concatenation of smaller registers.
///
/// Supplied by the translator for float-extension registers and explicit
/// join records; accesses of the whole are split into the pieces before
/// renaming.
#[derive(Debug, Clone)]
pub struct JoinRecord {
    /// The combined storage.
    pub whole: VarnodeData,
    /// Component storage, least significant first.
    pub pieces: Vec<VarnodeData>,
}

/// Heritage status of one address space.
#[derive(Debug, Clone)]
struct HeritageInfo {
    kind: SpaceKind,
    delay: u32,
    deadcode_delay: u32,
    first_pass: Option<u32>,
}

/// Manager for the construction of SSA form over one function.
pub struct Heritage {
    infolist: Vec<HeritageInfo>,
    global_disjoint: LocationMap,
    pass: u32,
}

/// Augmented dominator tree state, rebuilt once per pass.
struct Adt {
    /// Dom-tree preorder position per block slab index.
    pre: Vec<usize>,
    /// Block per preorder position.
    order: Vec<BlockId>,
    /// Dominator depth per preorder position.
    depth: Vec<u32>,
    /// Dom-tree children per preorder position.
    children: Vec<Vec<BlockId>>,
    /// Boundary-node marker per preorder position.
    boundary: Vec<bool>,
    /// Next boundary ancestor (preorder position) per preorder position.
    zchain: Vec<usize>,
    /// Augmented edges per preorder position.
    augment: Vec<Vec<BlockId>>,
    max_depth: u32,
}

/// Work-list keyed by dominator depth; deepest blocks come out first.
struct DepthQueue {
    stacks: Vec<Vec<BlockId>>,
    cur: Option<usize>,
}

impl DepthQueue {
    fn new(max_depth: u32) -> Self {
        Self {
            stacks: vec![Vec::new(); max_depth as usize + 1],
            cur: None,
        }
    }

    fn insert(&mut self, block: BlockId, depth: u32) {
        let depth = depth as usize;
        self.stacks[depth].push(block);
        if self.cur.map_or(true, |c| depth > c) {
            self.cur = Some(depth);
        }
    }

    fn extract(&mut self) -> Option<BlockId> {
        let mut cur = self.cur?;
        let block = self.stacks[cur].pop()?;
        while self.stacks[cur].is_empty() {
            if cur == 0 {
                self.cur = None;
                return Some(block);
            }
            cur -= 1;
        }
        self.cur = Some(cur);
        Some(block)
    }
}

impl Heritage {
    /// Creates heritage state for the given space configuration.
    #[must_use]
    pub fn new(spaces: &SpaceManager) -> Self {
        let infolist = spaces
            .spaces()
            .iter()
            .map(|s| HeritageInfo {
                kind: s.kind(),
                delay: s.delay(),
                deadcode_delay: s.deadcode_delay(),
                first_pass: None,
            })
            .collect();
        Self {
            infolist,
            global_disjoint: LocationMap::new(),
            pass: 0,
        }
    }

    /// Returns the number of completed passes.
    #[must_use]
    pub const fn pass(&self) -> u32 {
        self.pass
    }

    /// Returns the pass in which `addr` was heritaged, if it has been.
    #[must_use]
    pub fn pass_of(&self, addr: Address) -> Option<u32> {
        self.global_disjoint.find_pass(addr)
    }

    /// Returns `true` if it is safe to remove dead varnodes in the space:
    /// enough passes have elapsed since the space was first heritaged.
    #[must_use]
    pub fn dead_removal_allowed(&self, space: SpaceId) -> bool {
        let info = &self.infolist[space.index()];
        match info.first_pass {
            Some(first) => self.pass.saturating_sub(first) >= info.deadcode_delay,
            None => false,
        }
    }

    /// Overrides the dead-code delay for a space.
    pub fn set_deadcode_delay(&mut self, space: SpaceId, delay: u32) {
        self.infolist[space.index()].deadcode_delay = delay;
    }

    fn heritagable(kind: SpaceKind) -> bool {
        matches!(
            kind,
            SpaceKind::Register | SpaceKind::Ram | SpaceKind::Stack | SpaceKind::Unique
        )
    }

    /// Performs one pass: joins, refinement, guards, phi placement, and
    /// renaming for every space eligible at the current pass count.
    ///
    /// Returns `true` if anything was linked.
    ///
    /// # Errors
    ///
    /// Fails on refinement below byte granularity, pass-count exhaustion,
    /// or a linkage inconsistency.
    pub fn heritage_pass(&mut self, fd: &mut Funcdata) -> Result<bool> {
        if !fd.flags().contains(FunctionFlags::BLOCKS_GENERATED) {
            return Ok(false);
        }
        if self.pass as usize >= fd.limits().max_heritage_passes {
            return Err(Error::LimitExceeded {
                limit: Limit::HeritagePasses,
                value: fd.limits().max_heritage_passes,
            });
        }
        if !fd.graph.dominators_valid() {
            fd.graph.calc_dominators();
            fd.graph.calc_loop_depth();
        }

        self.process_joins(fd)?;
        self.update_write_masks(fd);

        let adt = Adt::build(&fd.graph);
        let mut changed = false;

        let space_ids: Vec<SpaceId> = (0..self.infolist.len())
            .map(|i| SpaceId(i as u8))
            .collect();
        for space in space_ids {
            let info = &self.infolist[space.index()];
            if !Self::heritagable(info.kind) || info.delay > self.pass {
                continue;
            }
            let ranges = self.collect_ranges(fd, space)?;
            if ranges.is_empty() {
                continue;
            }
            if self.infolist[space.index()].first_pass.is_none() {
                self.infolist[space.index()].first_pass = Some(self.pass);
            }
            changed = true;

            let kind = self.infolist[space.index()].kind;
            let mut active: FxHashMap<Address, u32> = FxHashMap::default();
            let mut writes: Vec<VarnodeId> = Vec::new();
            let mut inputs: FxHashMap<Address, VarnodeId> = FxHashMap::default();
            for &(start, size) in &ranges {
                if self.range_is_new(start) {
                    self.guard_range(fd, kind, start, size)?;
                }
                // Reads participate through renaming; only writes and any
                // pre-existing input need recording
                let (w, i) = Self::collect_accesses(fd, start, size);
                active.insert(start, size as u32);
                writes.extend(w);
                if let Some(input) = i {
                    inputs.insert(start, input);
                }
            }

            self.place_phis(fd, &adt, &active, &writes)?;
            Self::rename(fd, &adt, &active, &inputs)?;
        }

        self.pass += 1;
        Ok(changed)
    }

    /// Sets or clears the write-mask protection on varnodes according to
    /// space eligibility at the current pass.
    fn update_write_masks(&self, fd: &mut Funcdata) {
        for (idx, info) in self.infolist.iter().enumerate() {
            if !Self::heritagable(info.kind) {
                continue;
            }
            let space = SpaceId(idx as u8);
            let ids: Vec<VarnodeId> = fd.store.varnodes_in_space(space).collect();
            let masked = info.delay > self.pass;
            for id in ids {
                let vn = fd.store.var_mut(id);
                if masked {
                    vn.set_flag(VarnodeFlags::WRITEMASK);
                } else {
                    vn.clear_flag(VarnodeFlags::WRITEMASK);
                }
            }
        }
    }

    fn range_is_new(&self, start: Address) -> bool {
        self.global_disjoint
            .find(start)
            .is_some_and(|(_, sp)| sp.pass == self.pass)
    }

    /// Registers every access range of the space in the disjoint cover and
    /// returns the ranges that need processing this pass, refined to a
    /// uniform partition.
    fn collect_ranges(
        &mut self,
        fd: &mut Funcdata,
        space: SpaceId,
    ) -> Result<Vec<(Address, u64)>> {
        let ids: Vec<VarnodeId> = fd.store.varnodes_in_space(space).collect();
        let mut candidates: FxHashSet<Address> = FxHashSet::default();
        for id in ids {
            if !fd.store.var_exists(id) {
                continue;
            }
            let vn = fd.store.var(id);
            if vn.is_annotation() || vn.flags().contains(VarnodeFlags::WRITEMASK) {
                continue;
            }
            if vn.is_free() && vn.has_no_descend() {
                continue;
            }
            let storage = vn.storage();
            let needs_link = vn.is_free();
            let (start, _, intersect) =
                self.global_disjoint
                    .add(storage.addr, u64::from(storage.size), self.pass);
            match intersect {
                Intersect::Covered if !needs_link => {}
                _ => {
                    candidates.insert(start);
                }
            }
        }

        // Re-resolve candidate starts against the merged cover and refine
        // each range to a uniform access partition
        let mut result: Vec<(Address, u64)> = Vec::new();
        let mut seen: FxHashSet<Address> = FxHashSet::default();
        for cand in candidates {
            let Some((start, sp)) = self.global_disjoint.find(cand) else {
                continue;
            };
            if !seen.insert(start) {
                continue;
            }
            let pieces = self.refine_range(fd, start, sp.size)?;
            result.extend(pieces);
        }
        result.sort_by_key(|(a, _)| *a);
        Ok(result)
    }

    /// Splits mixed-extent accesses of a range into a common partition.
    ///
    /// Returns the list of uniform sub-ranges; for an already-uniform
    /// range this is the range itself.
    fn refine_range(
        &mut self,
        fd: &mut Funcdata,
        start: Address,
        size: u64,
    ) -> Result<Vec<(Address, u64)>> {
        let end = start.offset + size;
        let ids: Vec<VarnodeId> = fd.store.varnodes_starting_in(start, size).collect();

        let mut bounds: Vec<u64> = vec![start.offset, end];
        for &id in &ids {
            let vn = fd.store.var(id);
            if vn.is_annotation() || vn.flags().contains(VarnodeFlags::WRITEMASK) {
                continue;
            }
            bounds.push(vn.storage().addr.offset);
            bounds.push(vn.storage().addr.offset + u64::from(vn.size()));
        }
        bounds.sort_unstable();
        bounds.dedup();
        bounds.retain(|&b| b <= end);

        if bounds.len() <= 2 {
            return Ok(vec![(start, size)]);
        }

        let pieces: Vec<(Address, u64)> = bounds
            .windows(2)
            .map(|w| (Address::new(start.space, w[0]), w[1] - w[0]))
            .collect();
        for &(pa, ps) in &pieces {
            if ps == 0 {
                return Err(Error::HeritageOverrun {
                    offset: pa.offset,
                    size: ps,
                });
            }
        }

        // Split every access that spans more than one piece
        for id in ids {
            if !fd.store.var_exists(id) {
                continue;
            }
            let (vstart, vend, written, readable) = {
                let vn = fd.store.var(id);
                if vn.is_annotation() || vn.flags().contains(VarnodeFlags::WRITEMASK) {
                    continue;
                }
                let vstart = vn.storage().addr.offset;
                (
                    vstart,
                    vstart + u64::from(vn.size()),
                    vn.is_written(),
                    vn.is_free() && !vn.has_no_descend(),
                )
            };
            let sub: Vec<VarnodeData> = pieces
                .iter()
                .filter(|(pa, _)| pa.offset >= vstart && pa.offset < vend)
                .map(|&(pa, ps)| VarnodeData::new(pa, u32::try_from(ps).unwrap_or(u32::MAX)))
                .collect();
            if sub.len() <= 1 {
                continue;
            }
            if written {
                Self::split_write(fd, id, &sub)?;
            } else if readable {
                Self::split_read(fd, id, &sub)?;
            }
        }

        // The cover now tracks the partition, not the merged blob
        self.global_disjoint.erase(start);
        for &(pa, ps) in &pieces {
            self.global_disjoint.add(pa, ps, self.pass);
        }
        Ok(pieces)
    }

    /// Replaces each read of `vn` with a PIECE concatenation of fresh free
    /// varnodes covering `pieces` (least significant first), then destroys
    /// `vn`.
    fn split_read(fd: &mut Funcdata, vn: VarnodeId, pieces: &[VarnodeData]) -> Result<()> {
        let readers: Vec<OpId> = fd.store.var(vn).descend().to_vec();
        for reader in readers {
            let mut acc: Option<VarnodeId> = None;
            let mut acc_size: u32 = 0;
            for piece in pieces {
                let part = fd.store.new_varnode(piece.size, piece.addr);
                acc = Some(match acc {
                    None => {
                        acc_size = piece.size;
                        part
                    }
                    Some(low) => {
                        let pc = fd.store.op(reader).addr();
                        let concat = fd.store.new_op(OpCode::Piece, 2, pc);
                        fd.store.set_input(concat, part, 0)?;
                        fd.store.set_input(concat, low, 1)?;
                        acc_size += piece.size;
                        let out = fd.store.new_unique_out(acc_size, concat)?;
                        fd.op_insert_before(concat, reader)?;
                        out
                    }
                });
            }
            let Some(whole) = acc else { continue };
            for slot in 0..fd.store.op(reader).num_inputs() {
                if fd.store.op(reader).input(slot) == Some(vn) {
                    fd.store.set_input(reader, whole, slot)?;
                }
            }
        }
        if fd.store.var_exists(vn) && fd.store.var(vn).has_no_descend() {
            fd.store.destroy_varnode(vn)?;
        }
        Ok(())
    }

    /// Retargets the definition of `vn` to a temporary, emits SUBPIECE
    /// writes for every piece, rewires readers to the temporary, and
    /// destroys `vn`.
    fn split_write(fd: &mut Funcdata, vn: VarnodeId, pieces: &[VarnodeData]) -> Result<()> {
        let def = fd
            .store
            .var(vn)
            .def()
            .ok_or_else(|| crate::error::invariant_error!("split_write on unwritten {vn}"))?;
        let size = fd.store.var(vn).size();
        let base = fd.store.var(vn).storage().addr.offset;
        fd.store.unset_output(def)?;
        let whole = fd.store.new_unique_out(size, def)?;

        let pc = fd.store.op(def).addr();
        let mut prev = def;
        for piece in pieces {
            let sub = fd.store.new_op(OpCode::SubPiece, 2, pc);
            fd.store.set_input(sub, whole, 0)?;
            let shift = fd.store.new_constant(4, piece.addr.offset - base);
            fd.store.set_input(sub, shift, 1)?;
            fd.store.new_varnode_out(piece.size, piece.addr, sub)?;
            fd.op_insert_after(sub, prev)?;
            prev = sub;
        }

        let readers: Vec<OpId> = fd.store.var(vn).descend().to_vec();
        for reader in readers {
            for slot in 0..fd.store.op(reader).num_inputs() {
                if fd.store.op(reader).input(slot) == Some(vn) {
                    fd.store.set_input(reader, whole, slot)?;
                }
            }
        }
        if fd.store.var_exists(vn) && fd.store.var(vn).has_no_descend() {
            fd.store.destroy_varnode(vn)?;
        }
        Ok(())
    }

    /// Splits accesses of translator-declared join ranges into their
    /// component registers.
    fn process_joins(&mut self, fd: &mut Funcdata) -> Result<()> {
        let joins: Vec<JoinRecord> = fd.arch().join_records().to_vec();
        for join in joins {
            let ids: Vec<VarnodeId> = fd
                .store
                .varnodes_starting_in(join.whole.addr, u64::from(join.whole.size))
                .collect();
            for id in ids {
                if !fd.store.var_exists(id) {
                    continue;
                }
                let vn = fd.store.var(id);
                if vn.storage() != join.whole || vn.is_annotation() {
                    continue;
                }
                if vn.is_written() {
                    Self::split_write(fd, id, &join.pieces)?;
                } else if vn.is_free() && !vn.has_no_descend() {
                    Self::split_read(fd, id, &join.pieces)?;
                }
            }
        }
        Ok(())
    }

    /// Inserts INDIRECT guards and parameter/return trial reads for a
    /// range being heritaged for the first time.
    fn guard_range(
        &self,
        fd: &mut Funcdata,
        kind: SpaceKind,
        start: Address,
        size: u64,
    ) -> Result<()> {
        let range = VarnodeData::new(start, u32::try_from(size).unwrap_or(u32::MAX));
        let model = fd.arch().default_model().clone();

        let calls: Vec<OpId> = fd
            .store
            .ops_by_opcode(OpCode::Call)
            .chain(fd.store.ops_by_opcode(OpCode::CallInd))
            .collect();
        for call in calls {
            if model.is_killed_by_call(&range) {
                // The call destroys the old value outright; the guard's
                // output springs into existence at the call
                fd.new_indirect_creation(call, start, range.size, true)?;
            }
            if model.is_param_location(&range) {
                let slot = fd.store.op(call).num_inputs();
                let trial = fd.store.new_varnode(range.size, start);
                fd.store.insert_input(call, trial, slot)?;
            }
        }

        if matches!(kind, SpaceKind::Ram | SpaceKind::Stack) {
            let stores: Vec<OpId> = fd.store.ops_by_opcode(OpCode::Store).collect();
            for st in stores {
                fd.new_indirect_op(st, start, range.size)?;
            }
        }

        if let Some(ret_loc) = model.return_location {
            if ret_loc.overlaps(&range) {
                let returns: Vec<OpId> = fd.store.ops_by_opcode(OpCode::Return).collect();
                for ret in returns {
                    if fd.store.op(ret).num_inputs() < 2 {
                        let slot = fd.store.op(ret).num_inputs();
                        let value = fd.store.new_varnode(range.size, start);
                        fd.store.insert_input(ret, value, slot)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Gathers the writes and pre-existing input of a uniform range.
    fn collect_accesses(
        fd: &Funcdata,
        start: Address,
        size: u64,
    ) -> (Vec<VarnodeId>, Option<VarnodeId>) {
        let mut writes = Vec::new();
        let mut input = None;
        for id in fd.store.varnodes_starting_in(start, size) {
            let vn = fd.store.var(id);
            if vn.is_annotation() || vn.flags().contains(VarnodeFlags::WRITEMASK) {
                continue;
            }
            if vn.storage().addr != start || u64::from(vn.size()) != size {
                continue;
            }
            if vn.is_written() {
                writes.push(id);
            } else if vn.is_input() {
                input = Some(id);
            }
        }
        (writes, input)
    }

    /// Places phi operations for the active ranges at the merge blocks
    /// computed over the augmented dominator tree.
    fn place_phis(
        &mut self,
        fd: &mut Funcdata,
        adt: &Adt,
        active: &FxHashMap<Address, u32>,
        writes: &[VarnodeId],
    ) -> Result<()> {
        // Group write sites per range
        let mut sites: FxHashMap<Address, Vec<BlockId>> = FxHashMap::default();
        for &w in writes.iter() {
            let vn = fd.store.var(w);
            let Some(def) = vn.def() else { continue };
            let Some(block) = fd.store.op(def).parent() else {
                continue;
            };
            sites.entry(vn.storage().addr).or_default().push(block);
        }

        let entry = fd.graph.entry();
        let mut ranges: Vec<(Address, u32)> = active.iter().map(|(&a, &s)| (a, s)).collect();
        ranges.sort_by_key(|(a, _)| *a);
        for (addr, size) in ranges {
            let mut blocks = sites.remove(&addr).unwrap_or_default();
            blocks.push(entry);
            let merge = adt.merge_points(&fd.graph, &blocks);
            for block in merge {
                // One phi per range per block; placement may revisit
                let existing = fd.graph.block(block).ops().iter().take_while(|&&o| {
                    fd.store.op(o).is_phi()
                }).any(|&o| {
                    fd.store.op(o).output().is_some_and(|out| {
                        let v = fd.store.var(out);
                        v.storage().addr == addr && v.size() == size
                    })
                });
                if existing {
                    continue;
                }
                let n_in = fd.graph.block(block).intos().len();
                if n_in == 0 {
                    continue;
                }
                let pc = fd
                    .graph
                    .block(block)
                    .range()
                    .map_or(fd.entry(), |(start, _)| start);
                let phi = fd.store.new_op(OpCode::MultiEqual, n_in, pc);
                fd.store.new_varnode_out(size, addr, phi)?;
                fd.op_insert_begin(phi, block)?;
            }
        }
        Ok(())
    }

    /// Renames reads to reaching definitions over the dominator tree.
    fn rename(
        fd: &mut Funcdata,
        adt: &Adt,
        active: &FxHashMap<Address, u32>,
        inputs: &FxHashMap<Address, VarnodeId>,
    ) -> Result<()> {
        let mut stacks: FxHashMap<Address, Vec<VarnodeId>> = FxHashMap::default();
        for (&addr, &vn) in inputs {
            stacks.insert(addr, vec![vn]);
        }
        let entry = fd.graph.entry();
        Self::rename_recurse(fd, adt, active, &mut stacks, entry)
    }

    fn stack_top_or_input(
        fd: &mut Funcdata,
        stacks: &mut FxHashMap<Address, Vec<VarnodeId>>,
        addr: Address,
        size: u32,
    ) -> Result<VarnodeId> {
        let stack = stacks.entry(addr).or_default();
        if let Some(&top) = stack.last() {
            return Ok(top);
        }
        let input = fd.store.new_varnode(size, addr);
        let input = fd.store.mark_input(input)?;
        stack.push(input);
        Ok(input)
    }

    fn rename_recurse(
        fd: &mut Funcdata,
        adt: &Adt,
        active: &FxHashMap<Address, u32>,
        stacks: &mut FxHashMap<Address, Vec<VarnodeId>>,
        block: BlockId,
    ) -> Result<()> {
        let mut writelist: Vec<Address> = Vec::new();

        let ops: Vec<OpId> = fd.graph.block(block).ops().to_vec();
        for op in ops {
            if !fd.store.op(op).is_phi() {
                for slot in 0..fd.store.op(op).num_inputs() {
                    let Some(vn) = fd.store.op(op).input(slot) else {
                        continue;
                    };
                    let v = fd.store.var(vn);
                    if !v.is_free() || v.is_annotation() {
                        continue;
                    }
                    let storage = v.storage();
                    if active.get(&storage.addr) != Some(&storage.size) {
                        continue;
                    }
                    let reaching =
                        Self::stack_top_or_input(fd, stacks, storage.addr, storage.size)?;
                    if reaching == vn {
                        continue;
                    }
                    fd.store.set_input(op, reaching, slot)?;
                    if fd.store.var_exists(vn) && fd.store.var(vn).has_no_descend() {
                        fd.store.destroy_varnode(vn)?;
                    }
                }
            }
            if let Some(out) = fd.store.op(op).output() {
                let storage = fd.store.var(out).storage();
                if active.get(&storage.addr) == Some(&storage.size) {
                    stacks.entry(storage.addr).or_default().push(out);
                    writelist.push(storage.addr);
                }
            }
        }

        // Fill phi operand slots in successors
        let outs: Vec<BlockId> = fd.graph.block(block).outs().to_vec();
        for (out_slot, succ) in outs.into_iter().enumerate() {
            let Some(in_slot) = fd.graph.in_slot_for_edge(block, out_slot, succ) else {
                continue;
            };
            let phis: Vec<OpId> = fd
                .graph
                .block(succ)
                .ops()
                .iter()
                .copied()
                .take_while(|&o| fd.store.op(o).is_phi())
                .collect();
            for phi in phis {
                let Some(out) = fd.store.op(phi).output() else {
                    continue;
                };
                let storage = fd.store.var(out).storage();
                if active.get(&storage.addr) != Some(&storage.size) {
                    continue;
                }
                let reaching =
                    Self::stack_top_or_input(fd, stacks, storage.addr, storage.size)?;
                let old = fd.store.op(phi).input(in_slot);
                fd.store.set_input(phi, reaching, in_slot)?;
                if let Some(old_vn) = old {
                    if old_vn != reaching
                        && fd.store.var_exists(old_vn)
                        && fd.store.var(old_vn).is_free()
                        && fd.store.var(old_vn).has_no_descend()
                    {
                        fd.store.destroy_varnode(old_vn)?;
                    }
                }
            }
        }

        for child in adt.children_of(block) {
            Self::rename_recurse(fd, adt, active, stacks, child)?;
        }

        for addr in writelist {
            if let Some(stack) = stacks.get_mut(&addr) {
                stack.pop();
            }
        }
        Ok(())
    }
}

impl Adt {
    /// Builds the augmented dominator tree over the current dominator
    /// information of the graph.
    fn build(graph: &crate::cfg::BlockGraph) -> Self {
        let slab_len = graph
            .iter_blocks()
            .map(|b| b.index() + 1)
            .max()
            .unwrap_or(0);
        let children_by_block = graph.dom_children();

        // Dominator-tree preorder: parents before children, subtrees
        // contiguous
        let mut order: Vec<BlockId> = Vec::new();
        let mut pre = vec![usize::MAX; slab_len];
        if slab_len > 0 {
            let entry = graph.entry();
            let mut stack = vec![entry];
            while let Some(b) = stack.pop() {
                pre[b.index()] = order.len();
                order.push(b);
                for &c in children_by_block[b.index()].iter().rev() {
                    stack.push(c);
                }
            }
        }
        let n = order.len();
        let depth: Vec<u32> = order.iter().map(|&b| graph.block(b).dom_depth()).collect();
        let children: Vec<Vec<BlockId>> = order
            .iter()
            .map(|&b| children_by_block[b.index()].clone())
            .collect();
        let max_depth = depth.iter().copied().max().unwrap_or(0);

        // Up-edges: in-edges that do not come from the immediate dominator
        let mut b_cnt = vec![0usize; n];
        let mut t_cnt = vec![0usize; n];
        let mut upstart: Vec<BlockId> = Vec::new();
        let mut upend: Vec<BlockId> = Vec::new();
        for (xi, &x) in order.iter().enumerate() {
            for &v in &children_by_block[x.index()] {
                for &u in graph.block(v).intos() {
                    if pre[u.index()] == usize::MAX {
                        continue;
                    }
                    if Some(u) != graph.block(v).dom_parent() {
                        upstart.push(u);
                        upend.push(v);
                        b_cnt[pre[u.index()]] += 1;
                        t_cnt[xi] += 1;
                    }
                }
            }
        }

        // Boundary nodes and the z-chain of boundary ancestors
        let mut a_cnt = vec![0isize; n];
        let mut z_cnt = vec![0isize; n];
        let mut boundary = vec![false; n];
        for i in (0..n).rev() {
            let mut k = 0isize;
            let mut l = 0isize;
            for c in &children[i] {
                k += a_cnt[pre[c.index()]];
                l += z_cnt[pre[c.index()]];
            }
            a_cnt[i] = b_cnt[i] as isize - t_cnt[i] as isize + k;
            z_cnt[i] = 1 + l;
            if children[i].is_empty() || z_cnt[i] > a_cnt[i] + 1 {
                boundary[i] = true;
                z_cnt[i] = 1;
            }
        }
        let mut zchain = vec![usize::MAX; n];
        for i in 1..n {
            let parent = graph
                .block(order[i])
                .dom_parent()
                .expect("non-entry block with dominator");
            let j = pre[parent.index()];
            zchain[i] = if boundary[j] { j } else { zchain[j] };
        }

        // Augmented edges, sorted so ancestors closest to the root come
        // first
        let mut augment: Vec<Vec<BlockId>> = vec![Vec::new(); n];
        for (i, &u) in upstart.iter().enumerate() {
            let v = upend[i];
            let parent = graph
                .block(v)
                .dom_parent()
                .expect("up-edge head with dominator");
            let j = pre[parent.index()];
            let mut k = pre[u.index()];
            while k != usize::MAX && j < k {
                augment[k].push(v);
                k = zchain[k];
            }
        }
        for list in augment.iter_mut() {
            list.sort_by_key(|v| {
                graph
                    .block(*v)
                    .dom_parent()
                    .map_or(0, |p| pre[p.index()])
            });
        }

        Self {
            pre,
            order,
            depth,
            children,
            boundary,
            zchain,
            augment,
            max_depth,
        }
    }

    fn children_of(&self, block: BlockId) -> Vec<BlockId> {
        let i = self.pre[block.index()];
        if i == usize::MAX {
            return Vec::new();
        }
        self.children[i].clone()
    }

    /// Computes the merge points (phi blocks) for a set of definition
    /// blocks, walking the augmented tree from deepest to shallowest.
    fn merge_points(
        &self,
        graph: &crate::cfg::BlockGraph,
        def_blocks: &[BlockId],
    ) -> Vec<BlockId> {
        let n = self.order.len();
        let mut mark = vec![false; n];
        let mut merged = vec![false; n];
        let mut merge: Vec<BlockId> = Vec::new();
        let mut pq = DepthQueue::new(self.max_depth);

        for &bl in def_blocks {
            let i = self.pre[bl.index()];
            if i == usize::MAX || mark[i] {
                continue;
            }
            mark[i] = true;
            pq.insert(bl, self.depth[i]);
        }

        while let Some(q) = pq.extract() {
            self.visit_incr(graph, q, q, &mut mark, &mut merged, &mut merge, &mut pq);
        }
        merge
    }

    #[allow(clippy::too_many_arguments)]
    fn visit_incr(
        &self,
        graph: &crate::cfg::BlockGraph,
        qnode: BlockId,
        vnode: BlockId,
        mark: &mut [bool],
        merged: &mut [bool],
        merge: &mut Vec<BlockId>,
        pq: &mut DepthQueue,
    ) {
        let i = self.pre[vnode.index()];
        let j = self.pre[qnode.index()];
        for &v in &self.augment[i] {
            let idom_pre = graph
                .block(v)
                .dom_parent()
                .map_or(usize::MAX, |p| self.pre[p.index()]);
            if idom_pre < j {
                let k = self.pre[v.index()];
                if !merged[k] {
                    merged[k] = true;
                    merge.push(v);
                }
                if !mark[k] {
                    mark[k] = true;
                    pq.insert(v, self.depth[k]);
                }
            } else {
                break;
            }
        }
        if !self.boundary[i] {
            for &child in &self.children[i] {
                if !mark[self.pre[child.index()]] {
                    self.visit_incr(graph, qnode, child, mark, merged, merge, pq);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::BlockGraph;

    /// Diamond with writes in both arms must merge at the join block.
    #[test]
    fn test_merge_points_diamond() {
        let mut g = BlockGraph::new();
        let b0 = g.new_block(None);
        let b1 = g.new_block(None);
        let b2 = g.new_block(None);
        let b3 = g.new_block(None);
        g.add_edge(b0, b1);
        g.add_edge(b0, b2);
        g.add_edge(b1, b3);
        g.add_edge(b2, b3);
        g.calc_dominators();

        let adt = Adt::build(&g);
        let merge = adt.merge_points(&g, &[b1, b2, b0]);
        assert_eq!(merge, vec![b3]);
    }

    /// Loop header needs a phi for a value written inside the loop.
    #[test]
    fn test_merge_points_loop() {
        let mut g = BlockGraph::new();
        let b0 = g.new_block(None);
        let b1 = g.new_block(None);
        let b2 = g.new_block(None);
        let b3 = g.new_block(None);
        g.add_edge(b0, b1);
        g.add_edge(b1, b2);
        g.add_edge(b2, b1);
        g.add_edge(b1, b3);
        g.calc_dominators();

        let adt = Adt::build(&g);
        let merge = adt.merge_points(&g, &[b2, b0]);
        assert!(merge.contains(&b1), "loop header must merge, got {merge:?}");
        assert!(!merge.contains(&b0));
    }

    /// Straight-line code needs no merges at all.
    #[test]
    fn test_merge_points_linear() {
        let mut g = BlockGraph::new();
        let b0 = g.new_block(None);
        let b1 = g.new_block(None);
        let b2 = g.new_block(None);
        g.add_edge(b0, b1);
        g.add_edge(b1, b2);
        g.calc_dominators();

        let adt = Adt::build(&g);
        assert!(adt.merge_points(&g, &[b0]).is_empty());
        assert!(adt.merge_points(&g, &[b0, b1, b2]).is_empty());
    }

    #[test]
    fn test_depth_queue_order() {
        let mut pq = DepthQueue::new(4);
        pq.insert(BlockId(1), 1);
        pq.insert(BlockId(3), 3);
        pq.insert(BlockId(2), 2);
        assert_eq!(pq.extract(), Some(BlockId(3)));
        assert_eq!(pq.extract(), Some(BlockId(2)));
        assert_eq!(pq.extract(), Some(BlockId(1)));
        assert_eq!(pq.extract(), None);
    }
}
