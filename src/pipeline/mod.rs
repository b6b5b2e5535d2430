//! The action pipeline: named, grouped units of transformation.
//!
//! An [`Action`] is either a leaf transformation, a pool of rewrite rules,
//! an ordered group, or a restart group that re-runs itself when new
//! symbol or type information invalidates earlier analysis. The
//! [`ActionDatabase`] owns a single *universal* action containing every
//! known sub-action and rule; named root actions are derived from it by
//! group-list filtering, and exactly one root is *current* at a time.

mod action;
mod database;

pub use action::{Action, ActionBody, ActionFlags, ActionStatus, ApplyOutcome, LeafBody};
pub use database::ActionDatabase;
