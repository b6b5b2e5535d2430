// Copyright 2025-2026 the relift contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]
#![allow(dead_code)]

//! # relift
//!
//! A decompilation analysis core: the in-memory engine that takes a
//! function already lifted to architecture-neutral p-code and produces a
//! structured, typed, variable-renamed high-level representation ready for
//! source emission.
//!
//! # Architecture
//!
//! The core is built leaf-first from six tightly coupled components:
//!
//! - **IR store** ([`ir`]) — owns all varnodes and operations of one
//!   function; multi-keyed lookup, creation-ordered iteration, and the
//!   only API allowed to mutate data-flow linkage
//! - **Control-flow graph** ([`cfg`]) — basic blocks, dominator trees,
//!   loop depths, and structured-region recovery
//! - **SSA builder** ([`ssa`]) — incremental heritage: phi placement and
//!   renaming, one address space per pass
//! - **Rule engine** ([`rules`]) — local rewrites indexed per opcode and
//!   applied to fixed point
//! - **Action pipeline** ([`pipeline`]) — ordered groups of actions and
//!   rule pools with repeat, restart, and breakpoint semantics
//! - **Per-function driver** ([`func`], [`program`]) — orchestrates
//!   lifting hand-off, heritage passes, rule passes, parameter recovery,
//!   jump-table recovery, merging, and structuring for one function
//!
//! External collaborators — the instruction translator, the symbol
//! database, the load image — plug in through the traits in
//! [`translate`], [`symbols`], and [`program`].
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relift::{Architecture, Program};
//! use relift::symbols::EmptySymbolSource;
//! use relift::translate::ListingTranslator;
//!
//! let arch = Architecture::builder().build()?;
//! let translator = Arc::new(ListingTranslator::new());
//! let program = Program::new(arch.clone(), translator, Arc::new(EmptySymbolSource));
//! let function = program.decompile_at(arch.code_address(0x1000))?;
//! println!("{} warnings", function.warnings().len());
//! # Ok::<(), relift::Error>(())
//! ```
//!
//! # Concurrency
//!
//! Analysis is single-threaded per function. A host analyzes many
//! functions concurrently by instantiating independent driver tuples; the
//! only shared state is the read-mostly [`Architecture`].

pub mod address;
pub mod cfg;
mod error;
pub mod func;
pub mod ir;
pub mod opcodes;
pub mod pipeline;
pub mod program;
pub mod rules;
pub mod ssa;
pub mod symbols;
pub mod translate;
pub mod types;

pub use error::{Error, JumpTableError, Limit};
pub use func::{Funcdata, FunctionBuilder};
pub use opcodes::OpCode;
pub use program::{Architecture, Program};

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
