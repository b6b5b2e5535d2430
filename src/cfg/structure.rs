//! Bottom-up recovery of structured control flow.
//!
//! The structuring pass repeatedly matches region templates (sequence,
//! if-then, if-then-else, pre-test loop, post-test loop, switch) against a
//! shadow graph of collapsed nodes and folds each match into a single
//! [`FlowBlock`]. When no template applies and more than one node remains,
//! the least-structured edge is labeled as a goto and removed, and matching
//! resumes. The pass terminates when a single region covers the function.

use rustc_hash::FxHashSet;

use crate::{
    cfg::{
        block::{BlockFlags, BlockId},
        graph::BlockGraph,
    },
    error::Limit,
    Error, Result,
};

/// A recovered high-level region over basic blocks.
///
/// The tree references each alive basic block exactly once; goto edges that
/// survived structuring are reported separately in [`StructureResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowBlock {
    /// A single basic block.
    Basic(BlockId),
    /// Regions executed one after another.
    Sequence(Vec<FlowBlock>),
    /// Conditional region with an empty else branch.
    IfThen {
        /// Region ending in the conditional branch.
        cond: Box<FlowBlock>,
        /// Region executed when the branch condition holds.
        body: Box<FlowBlock>,
    },
    /// Conditional region with both branches.
    IfElse {
        /// Region ending in the conditional branch.
        cond: Box<FlowBlock>,
        /// Region for the taken side.
        then_body: Box<FlowBlock>,
        /// Region for the fall-through side.
        else_body: Box<FlowBlock>,
    },
    /// Pre-test loop: condition first, body loops back.
    WhileDo {
        /// Region ending in the loop condition.
        cond: Box<FlowBlock>,
        /// Loop body.
        body: Box<FlowBlock>,
    },
    /// Post-test loop: the body ends in the condition.
    DoWhile {
        /// Loop body including the trailing condition.
        body: Box<FlowBlock>,
    },
    /// Loop with no exit edge.
    InfLoop {
        /// Loop body.
        body: Box<FlowBlock>,
    },
    /// Multi-way branch with one region per case.
    Switch {
        /// Region ending in the indirect branch.
        cond: Box<FlowBlock>,
        /// Case regions in successor order.
        cases: Vec<FlowBlock>,
    },
}

impl FlowBlock {
    /// Collects the basic blocks of this region in pre-order.
    pub fn collect_blocks(&self, out: &mut Vec<BlockId>) {
        match self {
            FlowBlock::Basic(id) => out.push(*id),
            FlowBlock::Sequence(parts) => {
                for p in parts {
                    p.collect_blocks(out);
                }
            }
            FlowBlock::IfThen { cond, body } => {
                cond.collect_blocks(out);
                body.collect_blocks(out);
            }
            FlowBlock::IfElse {
                cond,
                then_body,
                else_body,
            } => {
                cond.collect_blocks(out);
                then_body.collect_blocks(out);
                else_body.collect_blocks(out);
            }
            FlowBlock::WhileDo { cond, body } => {
                cond.collect_blocks(out);
                body.collect_blocks(out);
            }
            FlowBlock::DoWhile { body } | FlowBlock::InfLoop { body } => {
                body.collect_blocks(out);
            }
            FlowBlock::Switch { cond, cases } => {
                cond.collect_blocks(out);
                for c in cases {
                    c.collect_blocks(out);
                }
            }
        }
    }
}

/// Outcome of control-flow structuring.
#[derive(Debug, Clone)]
pub struct StructureResult {
    /// The root region covering the whole function.
    pub root: FlowBlock,
    /// Edges that could not be structured, emitted as gotos.
    pub gotos: Vec<(BlockId, BlockId)>,
    /// Number of collapse iterations performed.
    pub iterations: usize,
}

/// One node of the shadow graph the collapser works on.
struct Node {
    region: FlowBlock,
    succs: Vec<usize>,
    preds: Vec<usize>,
    alive: bool,
    /// The basic block whose branch op terminates this region.
    tail_block: BlockId,
}

struct Collapser {
    nodes: Vec<Node>,
    alive_count: usize,
}

impl Collapser {
    fn from_graph(graph: &BlockGraph) -> Self {
        let mut index_of = vec![usize::MAX; graph.iter_blocks().map(|b| b.index() + 1).max().unwrap_or(0)];
        let mut nodes = Vec::new();
        for b in graph.iter_blocks() {
            index_of[b.index()] = nodes.len();
            nodes.push(Node {
                region: FlowBlock::Basic(b),
                succs: Vec::new(),
                preds: Vec::new(),
                alive: true,
                tail_block: b,
            });
        }
        for b in graph.iter_blocks() {
            let from = index_of[b.index()];
            for &succ in graph.block(b).outs() {
                let to = index_of[succ.index()];
                nodes[from].succs.push(to);
                nodes[to].preds.push(from);
            }
        }
        let alive_count = nodes.len();
        Self { nodes, alive_count }
    }

    fn unlink_edge(&mut self, from: usize, to: usize) {
        if let Some(pos) = self.nodes[from].succs.iter().position(|&s| s == to) {
            self.nodes[from].succs.remove(pos);
        }
        if let Some(pos) = self.nodes[to].preds.iter().position(|&p| p == from) {
            self.nodes[to].preds.remove(pos);
        }
    }

    /// Folds `victim` into `survivor`, transferring the victim's out-edges.
    fn absorb(&mut self, survivor: usize, victim: usize) {
        let succs = std::mem::take(&mut self.nodes[victim].succs);
        for &s in &succs {
            if let Some(pos) = self.nodes[s].preds.iter().position(|&p| p == victim) {
                self.nodes[s].preds[pos] = survivor;
            }
        }
        self.nodes[survivor].succs = succs;
        self.nodes[victim].preds.clear();
        self.nodes[victim].alive = false;
        self.nodes[survivor].tail_block = self.nodes[victim].tail_block;
        self.alive_count -= 1;
    }

    fn take_region(&mut self, idx: usize) -> FlowBlock {
        std::mem::replace(&mut self.nodes[idx].region, FlowBlock::Sequence(Vec::new()))
    }

    fn single_pred(&self, idx: usize) -> Option<usize> {
        (self.nodes[idx].preds.len() == 1).then(|| self.nodes[idx].preds[0])
    }

    /// Collapses `a` followed by `b` into a sequence.
    fn collapse_sequence(&mut self, a: usize, b: usize) {
        self.unlink_edge(a, b);
        let first = self.take_region(a);
        let second = self.take_region(b);
        let parts = match first {
            FlowBlock::Sequence(mut v) => {
                v.push(second);
                v
            }
            other => vec![other, second],
        };
        self.nodes[a].region = FlowBlock::Sequence(parts);
        self.absorb(a, b);
    }

    /// One sweep over the template set. Returns `true` on any collapse.
    fn try_collapse(&mut self) -> bool {
        let n = self.nodes.len();
        for idx in 0..n {
            if !self.nodes[idx].alive {
                continue;
            }

            // Post-test loop: a node branching straight back to itself
            if self.nodes[idx].succs.iter().filter(|&&s| s == idx).count() >= 1 {
                let exits: Vec<usize> = self.nodes[idx]
                    .succs
                    .iter()
                    .copied()
                    .filter(|&s| s != idx)
                    .collect();
                self.unlink_edge(idx, idx);
                let body = self.take_region(idx);
                self.nodes[idx].region = if exits.is_empty() {
                    FlowBlock::InfLoop { body: Box::new(body) }
                } else {
                    FlowBlock::DoWhile { body: Box::new(body) }
                };
                return true;
            }

            let succs = self.nodes[idx].succs.clone();

            // Sequence: unique successor with a unique predecessor
            if succs.len() == 1 {
                let b = succs[0];
                if b != idx && self.single_pred(b) == Some(idx) {
                    self.collapse_sequence(idx, b);
                    return true;
                }
            }

            if succs.len() == 2 {
                let (x, y) = (succs[0], succs[1]);
                if x == y {
                    // Both branch targets equal: degenerate if with no body
                    self.unlink_edge(idx, x);
                    return true;
                }
                for (body, exit) in [(x, y), (y, x)] {
                    if body == idx || !self.nodes[body].alive {
                        continue;
                    }
                    if self.single_pred(body) != Some(idx) {
                        continue;
                    }
                    let body_succs = self.nodes[body].succs.clone();

                    // While-do: body loops straight back to the condition
                    if body_succs == vec![idx] {
                        self.unlink_edge(idx, body);
                        self.unlink_edge(body, idx);
                        let cond = self.take_region(idx);
                        let inner = self.take_region(body);
                        self.nodes[idx].region = FlowBlock::WhileDo {
                            cond: Box::new(cond),
                            body: Box::new(inner),
                        };
                        self.nodes[body].alive = false;
                        self.nodes[body].preds.clear();
                        self.alive_count -= 1;
                        let _ = exit;
                        return true;
                    }

                    // If-then: body rejoins the exit edge
                    if body_succs == vec![exit] {
                        self.unlink_edge(idx, body);
                        self.unlink_edge(body, exit);
                        let cond = self.take_region(idx);
                        let inner = self.take_region(body);
                        self.nodes[idx].region = FlowBlock::IfThen {
                            cond: Box::new(cond),
                            body: Box::new(inner),
                        };
                        self.nodes[body].alive = false;
                        self.nodes[body].preds.clear();
                        self.alive_count -= 1;
                        return true;
                    }

                    // If-then with terminal body (returns, no successors)
                    if body_succs.is_empty() && self.nodes[body].preds.len() == 1 {
                        self.unlink_edge(idx, body);
                        let cond = self.take_region(idx);
                        let inner = self.take_region(body);
                        self.nodes[idx].region = FlowBlock::IfThen {
                            cond: Box::new(cond),
                            body: Box::new(inner),
                        };
                        self.nodes[body].alive = false;
                        self.nodes[body].preds.clear();
                        self.alive_count -= 1;
                        return true;
                    }
                }

                // If-else: both branches rejoin at a common block
                let (bx, by) = (x, y);
                if bx != idx
                    && by != idx
                    && self.single_pred(bx) == Some(idx)
                    && self.single_pred(by) == Some(idx)
                {
                    let sx = self.nodes[bx].succs.clone();
                    let sy = self.nodes[by].succs.clone();
                    let rejoin = match (sx.as_slice(), sy.as_slice()) {
                        ([a], [b]) if a == b && *a != idx => Some(Some(*a)),
                        ([], []) => Some(None),
                        _ => None,
                    };
                    if let Some(exit) = rejoin {
                        self.unlink_edge(idx, bx);
                        self.unlink_edge(idx, by);
                        if let Some(e) = exit {
                            self.unlink_edge(bx, e);
                            self.unlink_edge(by, e);
                        }
                        let cond = self.take_region(idx);
                        let then_body = self.take_region(bx);
                        let else_body = self.take_region(by);
                        self.nodes[idx].region = FlowBlock::IfElse {
                            cond: Box::new(cond),
                            then_body: Box::new(then_body),
                            else_body: Box::new(else_body),
                        };
                        for dead in [bx, by] {
                            self.nodes[dead].alive = false;
                            self.nodes[dead].preds.clear();
                            self.alive_count -= 1;
                        }
                        if let Some(e) = exit {
                            self.nodes[idx].succs = vec![e];
                            self.nodes[e].preds.push(idx);
                        }
                        return true;
                    }
                }
            }

            // Switch: three or more cases each rejoining a common exit
            if succs.len() > 2 {
                let unique: FxHashSet<usize> = succs.iter().copied().collect();
                if unique.len() != succs.len() || unique.contains(&idx) {
                    continue;
                }
                let mut exit: Option<usize> = None;
                let mut ok = true;
                for &case in &succs {
                    if self.single_pred(case) != Some(idx) {
                        ok = false;
                        break;
                    }
                    match self.nodes[case].succs.as_slice() {
                        [] => {}
                        [e] if !unique.contains(e) && *e != idx => match exit {
                            None => exit = Some(*e),
                            Some(prev) if prev == *e => {}
                            Some(_) => {
                                ok = false;
                                break;
                            }
                        },
                        _ => {
                            ok = false;
                            break;
                        }
                    }
                }
                if ok {
                    let mut cases = Vec::with_capacity(succs.len());
                    for &case in &succs {
                        self.unlink_edge(idx, case);
                        if let Some(e) = exit {
                            self.unlink_edge(case, e);
                        }
                        cases.push(self.take_region(case));
                        self.nodes[case].alive = false;
                        self.nodes[case].preds.clear();
                        self.alive_count -= 1;
                    }
                    let cond = self.take_region(idx);
                    self.nodes[idx].region = FlowBlock::Switch {
                        cond: Box::new(cond),
                        cases,
                    };
                    if let Some(e) = exit {
                        self.nodes[idx].succs = vec![e];
                        self.nodes[e].preds.push(idx);
                    }
                    return true;
                }
            }
        }
        false
    }

    /// Picks the edge most likely to be a source-level goto: an edge into
    /// the node with the most predecessors.
    fn pick_goto_edge(&self) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize, usize)> = None;
        for (idx, node) in self.nodes.iter().enumerate() {
            if !node.alive {
                continue;
            }
            for &succ in &node.succs {
                let score = self.nodes[succ].preds.len();
                if best.map_or(true, |(_, _, s)| score > s) {
                    best = Some((idx, succ, score));
                }
            }
        }
        best.map(|(a, b, _)| (a, b))
    }
}

/// Structures the given graph into a region tree.
///
/// # Errors
///
/// Returns [`Error::LimitExceeded`] if the collapse loop runs past
/// `max_iterations`.
pub fn structure_blocks(graph: &mut BlockGraph, max_iterations: usize) -> Result<StructureResult> {
    let mut collapser = Collapser::from_graph(graph);
    let mut gotos = Vec::new();
    let mut iterations = 0usize;

    if collapser.nodes.is_empty() {
        return Ok(StructureResult {
            root: FlowBlock::Sequence(Vec::new()),
            gotos,
            iterations,
        });
    }

    while collapser.alive_count > 1 || !top_is_closed(&collapser) {
        iterations += 1;
        if iterations > max_iterations {
            return Err(Error::LimitExceeded {
                limit: Limit::StructuringIterations,
                value: max_iterations,
            });
        }
        if collapser.try_collapse() {
            continue;
        }
        // Irreducible remnant: label one edge as goto and keep going
        let Some((from, to)) = collapser.pick_goto_edge() else {
            break;
        };
        let from_block = collapser.nodes[from].tail_block;
        let mut targets = Vec::new();
        collapser.nodes[to].region.collect_blocks(&mut targets);
        let to_block = targets.first().copied().unwrap_or(from_block);
        gotos.push((from_block, to_block));
        collapser.unlink_edge(from, to);
    }

    for &(_, target) in &gotos {
        graph.block_mut(target).flags |= BlockFlags::GOTO_TARGET;
    }

    // Whatever nodes survive become the root; normally exactly one
    let mut parts: Vec<FlowBlock> = Vec::new();
    let indices: Vec<usize> = (0..collapser.nodes.len())
        .filter(|&i| collapser.nodes[i].alive)
        .collect();
    for i in indices {
        parts.push(collapser.take_region(i));
    }
    let root = if parts.len() == 1 {
        parts.pop().expect("one part")
    } else {
        FlowBlock::Sequence(parts)
    };

    Ok(StructureResult {
        root,
        gotos,
        iterations,
    })
}

/// Returns `true` when a lone surviving node has no leftover edges.
fn top_is_closed(collapser: &Collapser) -> bool {
    collapser
        .nodes
        .iter()
        .filter(|n| n.alive)
        .all(|n| n.succs.is_empty())
}
