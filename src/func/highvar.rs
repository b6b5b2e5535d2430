//! High variables: merging SSA varnodes back into source-level variables.
//!
//! After simplification, varnodes related by COPY and MULTIEQUAL are
//! regrouped into [`HighVariable`]s when their life ranges do not
//! interfere. A [`Cover`] tracks the block-relative ranges over which a
//! varnode is live; two varnodes may share a high variable only if their
//! covers are disjoint.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    cfg::BlockId,
    func::{Funcdata, FunctionFlags},
    ir::{OpId, VarnodeId},
    opcodes::OpCode,
    symbols::SymbolId,
    types::TypeId,
    Result,
};

/// The in-block position range `[start, stop]` a value is live over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverRange {
    /// First live op position; 0 means live at block entry.
    pub start: u32,
    /// Last live op position; `u32::MAX` means live through block exit.
    pub stop: u32,
}

impl CoverRange {
    fn intersects(&self, other: &CoverRange) -> bool {
        self.start <= other.stop && other.start <= self.stop
    }

    fn merge(&mut self, other: &CoverRange) {
        self.start = self.start.min(other.start);
        self.stop = self.stop.max(other.stop);
    }
}

/// The set of block sub-ranges over which a variable is live.
#[derive(Debug, Clone, Default)]
pub struct Cover {
    ranges: FxHashMap<BlockId, CoverRange>,
}

impl Cover {
    /// Creates an empty cover.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the cover of a single varnode: from its definition to each
    /// of its readers, filling every block on the paths between them.
    #[must_use]
    pub fn build(fd: &Funcdata, vn: VarnodeId) -> Self {
        let mut cover = Self::new();
        let v = fd.store().var(vn);

        let def_block = v
            .def()
            .and_then(|def| fd.store().op(def).parent().map(|b| (def, b)));
        match def_block {
            Some((def, block)) => {
                cover.ranges.insert(
                    block,
                    CoverRange {
                        start: fd.store().op(def).order(),
                        stop: fd.store().op(def).order(),
                    },
                );
            }
            None => {
                // Inputs are live from function entry
                if v.is_input() {
                    let entry = fd.graph().entry();
                    cover.ranges.insert(entry, CoverRange { start: 0, stop: 0 });
                }
            }
        }

        for &reader in v.descend() {
            cover.add_ref_point(fd, vn, reader);
        }
        cover
    }

    /// Extends the cover to reach the given reading op.
    fn add_ref_point(&mut self, fd: &Funcdata, vn: VarnodeId, reader: OpId) {
        let Some(read_block) = fd.store().op(reader).parent() else {
            return;
        };
        let def_block = fd
            .store()
            .var(vn)
            .def()
            .and_then(|def| fd.store().op(def).parent());

        // A phi reads the value on the incoming edge, i.e. at the exit of
        // the predecessor, not inside its own block
        let (target_blocks, read_order): (Vec<BlockId>, u32) =
            if fd.store().op(reader).is_phi() {
                let slots: Vec<usize> = (0..fd.store().op(reader).num_inputs())
                    .filter(|&s| fd.store().op(reader).input(s) == Some(vn))
                    .collect();
                let preds: Vec<BlockId> = slots
                    .iter()
                    .filter_map(|&s| fd.graph().block(read_block).intos().get(s).copied())
                    .collect();
                (preds, u32::MAX)
            } else {
                (vec![read_block], fd.store().op(reader).order())
            };

        for target in target_blocks {
            // Extend within the reading block
            let range = self
                .ranges
                .entry(target)
                .or_insert(CoverRange { start: u32::MAX, stop: 0 });
            range.merge(&CoverRange {
                start: if Some(target) == def_block { range.start.min(read_order) } else { 0 },
                stop: read_order,
            });

            // Fill intermediate blocks back to the definition
            if Some(target) != def_block {
                let mut stack: Vec<BlockId> = fd.graph().block(target).intos().to_vec();
                let mut seen: FxHashSet<BlockId> = FxHashSet::default();
                seen.insert(target);
                while let Some(block) = stack.pop() {
                    if !seen.insert(block) {
                        continue;
                    }
                    if Some(block) == def_block {
                        // Live from the definition through block exit
                        if let Some(range) = self.ranges.get_mut(&block) {
                            range.stop = u32::MAX;
                        }
                        continue;
                    }
                    let fresh = self
                        .ranges
                        .insert(block, CoverRange { start: 0, stop: u32::MAX })
                        .is_none();
                    if fresh {
                        stack.extend(fd.graph().block(block).intos().iter().copied());
                    }
                }
            }
        }
    }

    /// Returns `true` if the two covers share any position.
    #[must_use]
    pub fn intersects(&self, other: &Cover) -> bool {
        for (block, range) in &self.ranges {
            if let Some(other_range) = other.ranges.get(block) {
                if range.intersects(other_range) {
                    return true;
                }
            }
        }
        false
    }

    /// Absorbs another cover.
    pub fn merge(&mut self, other: &Cover) {
        for (&block, range) in &other.ranges {
            self.ranges
                .entry(block)
                .and_modify(|r| r.merge(range))
                .or_insert(*range);
        }
    }

    /// Returns the per-block ranges.
    #[must_use]
    pub fn ranges(&self) -> &FxHashMap<BlockId, CoverRange> {
        &self.ranges
    }
}

/// A merged group of varnodes representing one source-level variable.
#[derive(Debug, Clone)]
pub struct HighVariable {
    /// Member varnodes.
    pub members: Vec<VarnodeId>,
    /// Combined life range.
    pub cover: Cover,
    /// Recovered type, if any.
    pub datatype: Option<TypeId>,
    /// Bound symbol, if any.
    pub symbol: Option<SymbolId>,
}

/// Union-find state driving varnode merging.
pub struct Merge {
    parent: FxHashMap<VarnodeId, VarnodeId>,
}

impl Merge {
    /// Creates empty merge state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            parent: FxHashMap::default(),
        }
    }

    fn find(&mut self, vn: VarnodeId) -> VarnodeId {
        let mut root = vn;
        while let Some(&p) = self.parent.get(&root) {
            if p == root {
                break;
            }
            root = p;
        }
        // Path compression
        let mut cur = vn;
        while let Some(&p) = self.parent.get(&cur) {
            if p == root {
                break;
            }
            self.parent.insert(cur, root);
            cur = p;
        }
        root
    }

    fn union(&mut self, a: VarnodeId, b: VarnodeId) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent.insert(rb, ra);
        }
    }

    fn reset(&mut self) {
        self.parent.clear();
    }
}

impl Default for Merge {
    fn default() -> Self {
        Self::new()
    }
}

impl Funcdata {
    fn high_eligible(&self, vn: VarnodeId) -> bool {
        let v = self.store.var(vn);
        !v.is_constant() && !v.is_annotation() && !v.is_free()
    }

    /// Groups varnodes into high variables by coalescing across COPY and
    /// MULTIEQUAL relations whose covers do not interfere.
    ///
    /// # Errors
    ///
    /// Never fails today; kept fallible for symmetry with other actions.
    pub fn build_high_variables(&mut self) -> Result<bool> {
        let eligible: Vec<VarnodeId> = self
            .store
            .iter_loc()
            .filter(|&vn| self.high_eligible(vn))
            .collect();

        let mut covers: FxHashMap<VarnodeId, Cover> = FxHashMap::default();
        for &vn in &eligible {
            covers.insert(vn, Cover::build(self, vn));
        }

        let mut merge = std::mem::take(&mut self.merge);
        merge.reset();

        // Coalesce over copies and phis
        let candidates: Vec<(VarnodeId, VarnodeId)> = {
            let mut pairs = Vec::new();
            for op in self
                .store
                .ops_by_opcode(OpCode::Copy)
                .chain(self.store.ops_by_opcode(OpCode::MultiEqual))
            {
                let o = self.store.op(op);
                let Some(out) = o.output() else { continue };
                if !self.high_eligible(out) {
                    continue;
                }
                for slot in 0..o.num_inputs() {
                    let Some(input) = o.input(slot) else { continue };
                    if input != out && self.high_eligible(input) {
                        pairs.push((out, input));
                    }
                }
            }
            pairs
        };

        let mut group_cover: FxHashMap<VarnodeId, Cover> = FxHashMap::default();
        for &vn in &eligible {
            group_cover.insert(vn, covers[&vn].clone());
        }
        for (a, b) in candidates {
            let ra = merge.find(a);
            let rb = merge.find(b);
            if ra == rb {
                continue;
            }
            // Same storage never interferes with itself; different storage
            // merges only on disjoint covers
            let same_storage =
                self.store.var(a).storage().addr == self.store.var(b).storage().addr;
            let disjoint = !group_cover[&ra].intersects(&group_cover[&rb]);
            if same_storage || disjoint {
                let absorbed = group_cover[&rb].clone();
                merge.union(ra, rb);
                let root = merge.find(ra);
                let mut combined = group_cover[&ra].clone();
                combined.merge(&absorbed);
                group_cover.insert(root, combined);
            }
        }

        // Materialize the high variables
        self.highs.clear();
        let mut index_of: FxHashMap<VarnodeId, u32> = FxHashMap::default();
        for &vn in &eligible {
            let root = merge.find(vn);
            let idx = match index_of.get(&root) {
                Some(&idx) => idx,
                None => {
                    let idx = u32::try_from(self.highs.len()).unwrap_or(u32::MAX);
                    index_of.insert(root, idx);
                    self.highs.push(HighVariable {
                        members: Vec::new(),
                        cover: group_cover
                            .get(&root)
                            .cloned()
                            .unwrap_or_default(),
                        datatype: None,
                        symbol: None,
                    });
                    idx
                }
            };
            self.highs[idx as usize].members.push(vn);
            self.store.var_mut(vn).set_high(Some(idx));
            if let Some(ty) = self.store.var(vn).datatype() {
                self.highs[idx as usize].datatype.get_or_insert(ty);
            }
        }

        self.merge = merge;
        let was_on = self.flags().contains(FunctionFlags::HIGH_ON);
        self.set_high_level();
        Ok(!was_on && !self.highs.is_empty())
    }
}
