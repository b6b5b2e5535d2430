//! Control-flow graph: basic blocks, dominators, and structuring.
//!
//! The [`BlockGraph`] owns the basic blocks of one function and the edges
//! between them, and derives dominator and loop information on demand.
//! Structural recovery collapses the graph bottom-up into a
//! [`FlowBlock`] region tree for the emitter.
//!
//! Graph edits here are purely topological. Edits that must keep
//! phi-operand slots aligned with in-edge positions (branch removal, edge
//! switching, node splitting) are wrapped by the function container, which
//! owns both the graph and the operations.

mod block;
mod graph;
mod structure;

pub use block::{BasicBlock, BlockFlags, BlockId};
pub use graph::{BlockGraph, EdgeKind};
pub use structure::{structure_blocks, FlowBlock, StructureResult};
