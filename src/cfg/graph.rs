//! The basic-block graph and its derived dominator/loop information.

use rustc_hash::FxHashSet;

use crate::{
    address::Address,
    cfg::block::{BasicBlock, BlockFlags, BlockId},
    error::invariant_error,
    Result,
};

/// Classification of a control-flow edge relative to a depth-first
/// traversal from the entry block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Edge of the DFS tree itself.
    Tree,
    /// Edge to a proper descendant that is not a tree child.
    Forward,
    /// Edge to an ancestor; identifies loops.
    Back,
    /// Edge between unrelated subtrees.
    Cross,
}

/// Container for the basic blocks of one function.
///
/// Dominator and loop data are recomputed explicitly via
/// [`BlockGraph::calc_dominators`] and [`BlockGraph::calc_loop_depth`]
/// after any topology change; `dominators_valid` tracks staleness.
pub struct BlockGraph {
    blocks: Vec<Option<BasicBlock>>,
    entry: Option<BlockId>,
    dominators_valid: bool,
}

impl BlockGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            entry: None,
            dominators_valid: false,
        }
    }

    // ===== block management =====

    /// Creates a new block covering the given address range.
    pub fn new_block(&mut self, range: Option<(Address, Address)>) -> BlockId {
        let id = BlockId(u32::try_from(self.blocks.len()).expect("block slab overflow"));
        self.blocks.push(Some(BasicBlock::new(range)));
        if self.entry.is_none() {
            self.entry = Some(id);
        }
        self.dominators_valid = false;
        id
    }

    /// Returns the entry block.
    ///
    /// # Panics
    ///
    /// Panics if no block has been created.
    #[must_use]
    pub fn entry(&self) -> BlockId {
        self.entry.expect("graph has no entry block")
    }

    /// Sets the entry block explicitly.
    pub fn set_entry(&mut self, id: BlockId) {
        self.entry = Some(id);
        self.dominators_valid = false;
    }

    /// Returns the block with the given id.
    ///
    /// # Panics
    ///
    /// Panics if the block was deleted or the id is foreign.
    #[must_use]
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        self.blocks[id.index()].as_ref().expect("stale block id")
    }

    /// Returns a mutable reference to the block with the given id.
    pub(crate) fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        self.blocks[id.index()].as_mut().expect("stale block id")
    }

    /// Returns `true` if the id refers to a live block.
    #[must_use]
    pub fn block_exists(&self, id: BlockId) -> bool {
        self.blocks.get(id.index()).is_some_and(Option::is_some)
    }

    /// Iterates live blocks in creation order.
    pub fn iter_blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|_| BlockId(i as u32)))
    }

    /// Returns the number of live blocks.
    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_some()).count()
    }

    /// Deletes a block that has no remaining edges or operations.
    ///
    /// # Errors
    ///
    /// Fails for the entry block or a block still wired into the graph.
    pub fn delete_block(&mut self, id: BlockId) -> Result<()> {
        if Some(id) == self.entry {
            return Err(invariant_error!("deleting the entry block {id}"));
        }
        let block = self.block(id);
        if !block.intos.is_empty() || !block.outs.is_empty() {
            return Err(invariant_error!("deleting wired block {id}"));
        }
        if !block.ops.is_empty() {
            return Err(invariant_error!("deleting non-empty block {id}"));
        }
        self.blocks[id.index()] = None;
        self.dominators_valid = false;
        Ok(())
    }

    // ===== edge management =====

    /// Adds an edge `from → to`; returns the in-slot it occupies in `to`.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) -> usize {
        self.block_mut(from).outs.push(to);
        let block = self.block_mut(to);
        block.intos.push(from);
        self.dominators_valid = false;
        self.block(to).intos.len() - 1
    }

    /// Returns the in-slot of `to` that corresponds to out-slot `out_slot`
    /// of `from`. Parallel edges between the same pair match up in order.
    #[must_use]
    pub fn in_slot_for_edge(&self, from: BlockId, out_slot: usize, to: BlockId) -> Option<usize> {
        let nth = self.block(from).outs[..out_slot]
            .iter()
            .filter(|&&b| b == to)
            .count();
        self.block(to)
            .intos
            .iter()
            .enumerate()
            .filter(|(_, &b)| b == from)
            .nth(nth)
            .map(|(i, _)| i)
    }

    /// Returns the out-slot of `from` that corresponds to in-slot
    /// `in_slot` of `to`; the inverse of [`BlockGraph::in_slot_for_edge`].
    #[must_use]
    pub fn out_slot_for_edge(&self, to: BlockId, in_slot: usize, from: BlockId) -> Option<usize> {
        let nth = self.block(to).intos[..in_slot]
            .iter()
            .filter(|&&b| b == from)
            .count();
        self.block(from)
            .outs
            .iter()
            .enumerate()
            .filter(|(_, &b)| b == to)
            .nth(nth)
            .map(|(i, _)| i)
    }

    /// Removes out-edge `out_slot` of `from`.
    ///
    /// Returns the destination block and the in-slot that was removed from
    /// it, so the caller can delete the matching phi-operand slots.
    ///
    /// # Errors
    ///
    /// Fails if the edge is not present on both sides.
    pub fn remove_edge(&mut self, from: BlockId, out_slot: usize) -> Result<(BlockId, usize)> {
        let to = *self
            .block(from)
            .outs
            .get(out_slot)
            .ok_or_else(|| invariant_error!("no out-slot {out_slot} on {from}"))?;
        let in_slot = self
            .in_slot_for_edge(from, out_slot, to)
            .ok_or_else(|| invariant_error!("edge {from}->{to} missing in-edge"))?;
        self.block_mut(from).outs.remove(out_slot);
        self.block_mut(to).intos.remove(in_slot);
        self.dominators_valid = false;
        Ok((to, in_slot))
    }

    /// Redirects out-edge `out_slot` of `from` to `new_to`.
    ///
    /// Returns `(old_to, removed_in_slot, new_in_slot)` so the caller can
    /// move phi operands between the two destinations.
    ///
    /// # Errors
    ///
    /// Fails if the original edge is inconsistent.
    pub fn switch_edge(
        &mut self,
        from: BlockId,
        out_slot: usize,
        new_to: BlockId,
    ) -> Result<(BlockId, usize, usize)> {
        let (old_to, old_in_slot) = self.remove_edge(from, out_slot)?;
        self.block_mut(from).outs.insert(out_slot, new_to);
        self.block_mut(new_to).intos.push(from);
        let new_in_slot = self.block(new_to).intos.len() - 1;
        self.dominators_valid = false;
        Ok((old_to, old_in_slot, new_in_slot))
    }

    // ===== reachability =====

    /// Returns the set of blocks reachable from the entry.
    #[must_use]
    pub fn reachable_set(&self) -> FxHashSet<BlockId> {
        let mut seen = FxHashSet::default();
        let Some(entry) = self.entry else {
            return seen;
        };
        let mut stack = vec![entry];
        while let Some(b) = stack.pop() {
            if !seen.insert(b) {
                continue;
            }
            for &succ in &self.block(b).outs {
                if !seen.contains(&succ) {
                    stack.push(succ);
                }
            }
        }
        seen
    }

    // ===== dominators =====

    /// Returns `true` if dominator data is current.
    #[must_use]
    pub const fn dominators_valid(&self) -> bool {
        self.dominators_valid
    }

    /// Returns blocks in reverse post-order from the entry.
    #[must_use]
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let Some(entry) = self.entry else {
            return Vec::new();
        };
        let mut postorder = Vec::new();
        let mut seen = FxHashSet::default();
        // Iterative DFS with an explicit state stack
        let mut stack: Vec<(BlockId, usize)> = vec![(entry, 0)];
        seen.insert(entry);
        while let Some(&(block, next)) = stack.last() {
            let outs = &self.block(block).outs;
            if next < outs.len() {
                let succ = outs[next];
                stack.last_mut().expect("non-empty stack").1 += 1;
                if seen.insert(succ) {
                    stack.push((succ, 0));
                }
            } else {
                postorder.push(block);
                stack.pop();
            }
        }
        postorder.reverse();
        postorder
    }

    /// Computes the dominator tree with the standard iterative algorithm,
    /// recording immediate-dominator parent and depth on each block.
    ///
    /// Unreachable blocks keep no dominator information.
    pub fn calc_dominators(&mut self) {
        let rpo = self.reverse_postorder();
        if rpo.is_empty() {
            self.dominators_valid = true;
            return;
        }
        let entry = rpo[0];

        // Postorder number per block, for the intersect walk
        let mut ponum = vec![usize::MAX; self.blocks.len()];
        for (i, &b) in rpo.iter().enumerate() {
            ponum[b.index()] = rpo.len() - 1 - i;
        }

        let mut idom: Vec<Option<BlockId>> = vec![None; self.blocks.len()];
        idom[entry.index()] = Some(entry);

        let intersect = |idom: &[Option<BlockId>], mut a: BlockId, mut b: BlockId| -> BlockId {
            while a != b {
                while ponum[a.index()] < ponum[b.index()] {
                    a = idom[a.index()].expect("processed block without idom");
                }
                while ponum[b.index()] < ponum[a.index()] {
                    b = idom[b.index()].expect("processed block without idom");
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for &pred in &self.block(b).intos {
                    if idom[pred.index()].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(cur) => intersect(&idom, pred, cur),
                    });
                }
                if new_idom.is_some() && idom[b.index()] != new_idom {
                    idom[b.index()] = new_idom;
                    changed = true;
                }
            }
        }

        for id in self.iter_blocks().collect::<Vec<_>>() {
            let parent = if id == entry {
                None
            } else {
                idom[id.index()]
            };
            self.block_mut(id).dom_parent = parent;
        }

        // Depths follow parent pointers; reverse post-order guarantees the
        // parent is finished first.
        for &b in &rpo {
            let depth = match self.block(b).dom_parent {
                Some(p) => self.block(p).dom_depth + 1,
                None => 0,
            };
            self.block_mut(b).dom_depth = depth;
        }

        self.dominators_valid = true;
    }

    /// Returns `true` if `a` dominates `b` (reflexively).
    ///
    /// Requires current dominator data.
    #[must_use]
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.block(cur).dom_parent {
                Some(p) => cur = p,
                None => return false,
            }
        }
    }

    /// Classifies every edge by DFS discovery; back edges identify loops.
    #[must_use]
    pub fn classify_edges(&self) -> Vec<(BlockId, usize, EdgeKind)> {
        let Some(entry) = self.entry else {
            return Vec::new();
        };
        let n = self.blocks.len();
        let mut pre = vec![usize::MAX; n];
        let mut post = vec![usize::MAX; n];
        let mut parent_edge: Vec<Option<(BlockId, usize)>> = vec![None; n];
        let mut counter = 0usize;

        let mut stack: Vec<(BlockId, usize)> = vec![(entry, 0)];
        pre[entry.index()] = counter;
        counter += 1;
        while let Some(&(block, next)) = stack.last() {
            let outs = &self.block(block).outs;
            if next < outs.len() {
                let slot = next;
                let succ = outs[slot];
                stack.last_mut().expect("non-empty stack").1 += 1;
                if pre[succ.index()] == usize::MAX {
                    pre[succ.index()] = counter;
                    counter += 1;
                    parent_edge[succ.index()] = Some((block, slot));
                    stack.push((succ, 0));
                }
            } else {
                post[block.index()] = counter;
                counter += 1;
                stack.pop();
            }
        }

        let mut result = Vec::new();
        for b in self.iter_blocks() {
            if pre[b.index()] == usize::MAX {
                continue;
            }
            for (slot, &succ) in self.block(b).outs.iter().enumerate() {
                let kind = if parent_edge[succ.index()] == Some((b, slot)) {
                    EdgeKind::Tree
                } else if pre[b.index()] >= pre[succ.index()]
                    && post[b.index()] <= post[succ.index()]
                {
                    // Successor is still open above us: ancestor
                    EdgeKind::Back
                } else if pre[b.index()] < pre[succ.index()] {
                    EdgeKind::Forward
                } else {
                    EdgeKind::Cross
                };
                result.push((b, slot, kind));
            }
        }
        result
    }

    /// Detects natural loops via dominator-based back edges and assigns
    /// each block its loop depth; loop headers get
    /// [`BlockFlags::LOOP_HEADER`].
    ///
    /// Requires current dominator data.
    pub fn calc_loop_depth(&mut self) {
        let ids: Vec<BlockId> = self.iter_blocks().collect();
        for &id in &ids {
            let block = self.block_mut(id);
            block.loop_depth = 0;
            block.flags &= !BlockFlags::LOOP_HEADER;
        }

        let mut back_edges = Vec::new();
        for &tail in &ids {
            for &head in &self.block(tail).outs {
                if self.dominates(head, tail) {
                    back_edges.push((tail, head));
                }
            }
        }

        for (tail, head) in back_edges {
            self.block_mut(head).flags |= BlockFlags::LOOP_HEADER;
            // Natural loop body: walk predecessors backwards from the tail
            let mut body = FxHashSet::default();
            body.insert(head);
            let mut stack = vec![tail];
            while let Some(b) = stack.pop() {
                if !body.insert(b) {
                    continue;
                }
                for &pred in &self.block(b).intos {
                    if !body.contains(&pred) {
                        stack.push(pred);
                    }
                }
            }
            for b in body {
                self.block_mut(b).loop_depth += 1;
            }
        }
    }

    /// Returns the dominator-tree children of every block.
    ///
    /// Requires current dominator data.
    #[must_use]
    pub fn dom_children(&self) -> Vec<Vec<BlockId>> {
        let mut children = vec![Vec::new(); self.blocks.len()];
        for b in self.iter_blocks() {
            if let Some(p) = self.block(b).dom_parent {
                children[p.index()].push(b);
            }
        }
        children
    }

    /// Returns the maximum dominator depth over all reachable blocks.
    #[must_use]
    pub fn max_dom_depth(&self) -> u32 {
        self.iter_blocks()
            .map(|b| self.block(b).dom_depth)
            .max()
            .unwrap_or(0)
    }
}

impl Default for BlockGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds the diamond: b0 → {b1, b2} → b3.
    fn diamond() -> (BlockGraph, [BlockId; 4]) {
        let mut g = BlockGraph::new();
        let b0 = g.new_block(None);
        let b1 = g.new_block(None);
        let b2 = g.new_block(None);
        let b3 = g.new_block(None);
        g.add_edge(b0, b1);
        g.add_edge(b0, b2);
        g.add_edge(b1, b3);
        g.add_edge(b2, b3);
        (g, [b0, b1, b2, b3])
    }

    #[test]
    fn test_diamond_dominators() {
        let (mut g, [b0, b1, b2, b3]) = diamond();
        g.calc_dominators();

        assert_eq!(g.block(b0).dom_parent(), None);
        assert_eq!(g.block(b1).dom_parent(), Some(b0));
        assert_eq!(g.block(b2).dom_parent(), Some(b0));
        assert_eq!(g.block(b3).dom_parent(), Some(b0));
        assert!(g.dominates(b0, b3));
        assert!(!g.dominates(b1, b3));
        assert_eq!(g.block(b3).dom_depth(), 1);
    }

    #[test]
    fn test_linear_chain_depths() {
        let mut g = BlockGraph::new();
        let b0 = g.new_block(None);
        let b1 = g.new_block(None);
        let b2 = g.new_block(None);
        g.add_edge(b0, b1);
        g.add_edge(b1, b2);
        g.calc_dominators();

        assert_eq!(g.block(b2).dom_parent(), Some(b1));
        assert_eq!(g.block(b2).dom_depth(), 2);
        assert_eq!(g.max_dom_depth(), 2);
    }

    #[test]
    fn test_loop_detection() {
        // b0 → b1 → b2 → b1 (back), b2 → b3
        let mut g = BlockGraph::new();
        let b0 = g.new_block(None);
        let b1 = g.new_block(None);
        let b2 = g.new_block(None);
        let b3 = g.new_block(None);
        g.add_edge(b0, b1);
        g.add_edge(b1, b2);
        g.add_edge(b2, b1);
        g.add_edge(b2, b3);
        g.calc_dominators();
        g.calc_loop_depth();

        assert!(g.block(b1).flags().contains(BlockFlags::LOOP_HEADER));
        assert_eq!(g.block(b1).loop_depth(), 1);
        assert_eq!(g.block(b2).loop_depth(), 1);
        assert_eq!(g.block(b0).loop_depth(), 0);
        assert_eq!(g.block(b3).loop_depth(), 0);
    }

    #[test]
    fn test_edge_classification() {
        let mut g = BlockGraph::new();
        let b0 = g.new_block(None);
        let b1 = g.new_block(None);
        g.add_edge(b0, b1);
        g.add_edge(b1, b1); // self loop

        let kinds = g.classify_edges();
        assert!(kinds.contains(&(b0, 0, EdgeKind::Tree)));
        assert!(kinds.contains(&(b1, 0, EdgeKind::Back)));
    }

    #[test]
    fn test_remove_edge_reports_in_slot() {
        let (mut g, [b0, b1, _b2, b3]) = diamond();
        // b3's in-edges are [b1, b2]; removing b1→b3 removes in-slot 0
        let (to, in_slot) = g.remove_edge(b1, 0).unwrap();
        assert_eq!(to, b3);
        assert_eq!(in_slot, 0);
        assert_eq!(g.block(b3).intos().len(), 1);

        // Unknown slot errors
        assert!(g.remove_edge(b0, 5).is_err());
    }

    #[test]
    fn test_parallel_edges_matched_in_order() {
        let mut g = BlockGraph::new();
        let a = g.new_block(None);
        let b = g.new_block(None);
        g.add_edge(a, b);
        g.add_edge(a, b);

        assert_eq!(g.in_slot_for_edge(a, 0, b), Some(0));
        assert_eq!(g.in_slot_for_edge(a, 1, b), Some(1));
        let (_, in_slot) = g.remove_edge(a, 0).unwrap();
        assert_eq!(in_slot, 0);
        assert_eq!(g.block(b).intos().len(), 1);
    }

    #[test]
    fn test_switch_edge() {
        let (mut g, [_b0, b1, _b2, b3]) = diamond();
        let b4 = g.new_block(None);
        let (old_to, old_in, new_in) = g.switch_edge(b1, 0, b4).unwrap();
        assert_eq!(old_to, b3);
        assert_eq!(old_in, 0);
        assert_eq!(new_in, 0);
        assert_eq!(g.block(b1).outs(), &[b4]);
        assert_eq!(g.block(b3).intos().len(), 1);
    }

    #[test]
    fn test_reachability() {
        let (mut g, [b0, b1, b2, b3]) = diamond();
        let orphan = g.new_block(None);
        let set = g.reachable_set();
        assert!(set.contains(&b0) && set.contains(&b3));
        assert!(!set.contains(&orphan));
        assert_eq!(set.len(), 4);
        let _ = (b1, b2);
    }

    #[test]
    fn test_delete_block_guards() {
        let (mut g, [b0, b1, _b2, _b3]) = diamond();
        assert!(g.delete_block(b0).is_err(), "entry is protected");
        assert!(g.delete_block(b1).is_err(), "wired block is protected");

        let orphan = g.new_block(None);
        g.delete_block(orphan).unwrap();
        assert!(!g.block_exists(orphan));
    }
}
