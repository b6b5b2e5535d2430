//! Incremental construction of Static Single Assignment form.
//!
//! SSA is built one address space at a time across multiple *passes*; a
//! space becomes eligible once the pass counter reaches its configured
//! delay. This lets register data-flow settle first and stack locations be
//! discovered and promoted in later passes. [`Heritage`] owns the pass
//! bookkeeping; [`LocationMap`] records which storage ranges have been
//! linked and when.

mod heritage;
mod location;

pub use heritage::{Heritage, JoinRecord};
pub use location::{LocationMap, SizePass};
