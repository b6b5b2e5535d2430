//! The data-flow intermediate representation.
//!
//! This module owns the two object kinds every other component manipulates:
//! [`Varnode`] (an SSA value with a storage descriptor) and [`PcodeOp`] (one
//! p-code operation). Both live in per-function slabs inside [`IrStore`] and
//! are referenced by lightweight indices, never by pointers, so the
//! variable ↔ operation ↔ block reference cycles of the data-flow graph
//! never become ownership cycles.
//!
//! All mutation of data-flow linkage (input slots, output bindings, reader
//! lists) goes through the [`IrStore`] linkage API; no other path may touch
//! those fields.

mod op;
mod store;
mod varnode;

pub use op::{OpFlags, OpId, PcodeOp, SeqNum};
pub use store::IrStore;
pub use varnode::{Varnode, VarnodeFlags, VarnodeId};

pub(crate) use varnode::size_mask;
