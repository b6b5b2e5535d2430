//! Per-function analysis state and its manipulation API.
//!
//! [`Funcdata`] is the container for everything the core knows about one
//! function: the IR store, the block graph, SSA construction state, the
//! recovered prototype, jump tables, high variables, and collected
//! warnings. It is also the coordination point for edits that must touch
//! several components at once — inserting an operation into a block,
//! removing a branch while keeping phi operands aligned, splitting a node.
//!
//! The file split mirrors what the edits touch: operation edits in `ops`,
//! varnode-level utilities in `varnodes`, block-level surgery in `blocks`.

mod blocks;
mod builder;
mod highvar;
mod jumptable;
mod ops;
mod proto;
mod serialize;
mod varnodes;

pub use builder::{BlockCursor, FunctionBuilder, Operand};
pub use highvar::{Cover, CoverRange, HighVariable, Merge};
pub use jumptable::JumpTable;
pub use proto::{AncestorRealistic, FuncProto, ParamTrial, ProtoParam, TrialVerdict};
pub use serialize::{BlockDoc, FunctionDoc, OpDoc, VarDoc};

use std::sync::Arc;

use bitflags::bitflags;
use rustc_hash::FxHashMap;

use crate::{
    address::Address,
    cfg::BlockGraph,
    ir::IrStore,
    program::{Architecture, Limits},
    ssa::Heritage,
    symbols::ScopeLocal,
    translate::FlowOverride,
    Result,
};

bitflags! {
    /// Boolean properties of a function under analysis.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FunctionFlags: u16 {
        /// High variables have been assigned to varnodes.
        const HIGH_ON = 1 << 0;
        /// Basic blocks have been generated.
        const BLOCKS_GENERATED = 1 << 1;
        /// At least one unreachable block was seen.
        const BLOCKS_UNREACHABLE = 1 << 2;
        /// Processing has started.
        const PROC_STARTED = 1 << 3;
        /// Processing has completed.
        const PROC_COMPLETE = 1 << 4;
        /// Data-type recovery has started.
        const TYPE_RECOVERY = 1 << 5;
        /// No code body is available.
        const NO_CODE = 1 << 6;
        /// This instance exists only to recover a jump table.
        const JUMPTABLE_RECOVERY = 1 << 7;
        /// Analysis must restart because of new symbol or type information.
        const RESTART_PENDING = 1 << 8;
        /// The body contains unimplemented instructions.
        const UNIMPLEMENTED_PRESENT = 1 << 9;
        /// Flow ran into bad data.
        const BADDATA_PRESENT = 1 << 10;
    }
}

/// A warning comment collected during analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    /// Warning text.
    pub text: String,
    /// Address the warning attaches to; `None` for the function header.
    pub addr: Option<Address>,
}

/// Container for data structures associated with a single function.
pub struct Funcdata {
    name: String,
    entry: Address,
    size: u64,
    arch: Arc<Architecture>,
    pub(crate) store: IrStore,
    pub(crate) graph: BlockGraph,
    pub(crate) heritage: Heritage,
    pub(crate) merge: Merge,
    pub(crate) proto: FuncProto,
    pub(crate) scope: ScopeLocal,
    pub(crate) jump_tables: Vec<JumpTable>,
    pub(crate) highs: Vec<HighVariable>,
    pub(crate) structure: Option<crate::cfg::StructureResult>,
    flags: FunctionFlags,
    warnings: Vec<Warning>,
    overrides: FxHashMap<Address, FlowOverride>,
    limits: Limits,
    clean_up_index: u32,
    high_level_index: u32,
}

impl Funcdata {
    /// Creates an empty function at the given entry address.
    #[must_use]
    pub fn new(name: &str, entry: Address, arch: Arc<Architecture>) -> Self {
        let spaces = arch.spaces();
        let store = IrStore::new(
            spaces.constant_space(),
            spaces.unique_space(),
            spaces.iop_space(),
        );
        let heritage = Heritage::new(spaces);
        let limits = arch.limits().clone();
        Self {
            name: name.to_string(),
            entry,
            size: 0,
            arch,
            store,
            graph: BlockGraph::new(),
            heritage,
            merge: Merge::new(),
            proto: FuncProto::default(),
            scope: ScopeLocal::new(),
            jump_tables: Vec::new(),
            highs: Vec::new(),
            structure: None,
            flags: FunctionFlags::empty(),
            warnings: Vec::new(),
            overrides: FxHashMap::default(),
            limits,
            clean_up_index: 0,
            high_level_index: 0,
        }
    }

    // ===== identity =====

    /// Returns the function's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the function.
    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    /// Returns the entry point address.
    #[must_use]
    pub const fn entry(&self) -> Address {
        self.entry
    }

    /// Returns the number of bytes of body covered by lifting.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Records the body size.
    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    /// Returns the shared architecture configuration.
    #[must_use]
    pub fn arch(&self) -> &Arc<Architecture> {
        &self.arch
    }

    /// Returns the per-function resource limits.
    #[must_use]
    pub const fn limits(&self) -> &Limits {
        &self.limits
    }

    // ===== component access =====

    /// Returns the IR store.
    #[must_use]
    pub const fn store(&self) -> &IrStore {
        &self.store
    }

    /// Returns a mutable reference to the IR store.
    ///
    /// Linkage edits must still go through the store's own API; this exists
    /// so rules and actions can call it directly.
    pub fn store_mut(&mut self) -> &mut IrStore {
        &mut self.store
    }

    /// Returns the basic-block graph.
    #[must_use]
    pub const fn graph(&self) -> &BlockGraph {
        &self.graph
    }

    /// Returns the recovered prototype.
    #[must_use]
    pub const fn proto(&self) -> &FuncProto {
        &self.proto
    }

    /// Returns a mutable reference to the prototype.
    pub fn proto_mut(&mut self) -> &mut FuncProto {
        &mut self.proto
    }

    /// Returns the function-local scope.
    #[must_use]
    pub const fn scope(&self) -> &ScopeLocal {
        &self.scope
    }

    /// Returns a mutable reference to the local scope.
    pub fn scope_mut(&mut self) -> &mut ScopeLocal {
        &mut self.scope
    }

    /// Returns the recovered jump tables.
    #[must_use]
    pub fn jump_tables(&self) -> &[JumpTable] {
        &self.jump_tables
    }

    /// Returns the high variables, once merging has run.
    #[must_use]
    pub fn high_variables(&self) -> &[HighVariable] {
        &self.highs
    }

    /// Returns the structured-region tree, once structuring has run.
    #[must_use]
    pub fn structure(&self) -> Option<&crate::cfg::StructureResult> {
        self.structure.as_ref()
    }

    // ===== flags =====

    /// Returns the function property flags.
    #[must_use]
    pub const fn flags(&self) -> FunctionFlags {
        self.flags
    }

    /// Sets a property flag.
    pub fn set_function_flag(&mut self, flag: FunctionFlags) {
        self.flags |= flag;
    }

    /// Clears a property flag.
    pub fn clear_function_flag(&mut self, flag: FunctionFlags) {
        self.flags &= !flag;
    }

    /// Returns `true` if processing has started.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.flags.contains(FunctionFlags::PROC_STARTED)
    }

    /// Returns `true` if processing has completed.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.flags.contains(FunctionFlags::PROC_COMPLETE)
    }

    /// Marks the start of processing.
    pub fn start_processing(&mut self) {
        self.flags |= FunctionFlags::PROC_STARTED;
    }

    /// Marks processing as complete.
    pub fn stop_processing(&mut self) {
        self.flags |= FunctionFlags::PROC_COMPLETE;
    }

    /// Returns `true` if an analysis restart has been requested.
    #[must_use]
    pub const fn restart_pending(&self) -> bool {
        self.flags.contains(FunctionFlags::RESTART_PENDING)
    }

    /// Requests or clears an analysis restart.
    pub fn set_restart_pending(&mut self, pending: bool) {
        if pending {
            self.flags |= FunctionFlags::RESTART_PENDING;
        } else {
            self.flags &= !FunctionFlags::RESTART_PENDING;
        }
    }

    /// Returns `true` if this instance only recovers a jump table.
    #[must_use]
    pub const fn is_jumptable_recovery(&self) -> bool {
        self.flags.contains(FunctionFlags::JUMPTABLE_RECOVERY)
    }

    // ===== overrides =====

    /// Installs a flow override at an instruction address.
    pub fn set_flow_override(&mut self, addr: Address, over: FlowOverride) {
        self.overrides.insert(addr, over);
    }

    /// Returns the flow override at an address, if any.
    #[must_use]
    pub fn flow_override(&self, addr: Address) -> Option<FlowOverride> {
        self.overrides.get(&addr).copied()
    }

    /// Returns all installed flow overrides.
    #[must_use]
    pub fn flow_overrides(&self) -> &FxHashMap<Address, FlowOverride> {
        &self.overrides
    }

    // ===== warnings =====

    /// Attaches a warning comment at an address in the body.
    pub fn warning(&mut self, text: &str, addr: Address) {
        self.warnings.push(Warning {
            text: text.to_string(),
            addr: Some(addr),
        });
    }

    /// Attaches a warning comment to the function header.
    pub fn warning_header(&mut self, text: &str) {
        self.warnings.push(Warning {
            text: text.to_string(),
            addr: None,
        });
    }

    /// Returns all collected warnings.
    #[must_use]
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    // ===== phase markers =====

    /// Records the varnode creation index at the start of clean-up.
    pub fn start_clean_up(&mut self) {
        self.clean_up_index = self.store.create_index();
    }

    /// Returns the creation index recorded at the start of clean-up.
    #[must_use]
    pub const fn clean_up_index(&self) -> u32 {
        self.clean_up_index
    }

    /// Records the varnode creation index at the start of high-variable
    /// construction and turns high-variable tracking on.
    pub fn set_high_level(&mut self) {
        self.high_level_index = self.store.create_index();
        self.flags |= FunctionFlags::HIGH_ON;
    }

    /// Returns the creation index recorded when high variables went live.
    #[must_use]
    pub const fn high_level_index(&self) -> u32 {
        self.high_level_index
    }

    // ===== heritage =====

    /// Performs one full heritage pass, linking reads in eligible address
    /// spaces to their writers.
    ///
    /// # Errors
    ///
    /// Propagates refinement failures and invariant violations.
    pub fn op_heritage(&mut self) -> Result<bool> {
        let placeholder = Heritage::new(self.arch.spaces());
        let mut heritage = std::mem::replace(&mut self.heritage, placeholder);
        let result = heritage.heritage_pass(self);
        self.heritage = heritage;
        result
    }

    /// Returns the pass number when the given address was heritaged, or
    /// `None` if it has not been.
    #[must_use]
    pub fn heritage_pass_of(&self, addr: Address) -> Option<u32> {
        self.heritage.pass_of(addr)
    }

    /// Returns the number of heritage passes completed so far.
    #[must_use]
    pub fn num_heritage_passes(&self) -> u32 {
        self.heritage.pass()
    }

    // ===== integrity =====

    /// Verifies store invariants plus block-level ordering rules: phis
    /// lead their blocks and branches close them.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn verify_integrity(&self) -> Result<()> {
        self.store.verify_integrity()?;
        for bid in self.graph.iter_blocks() {
            let block = self.graph.block(bid);
            let mut seen_nonphi = false;
            for (pos, &op_id) in block.ops().iter().enumerate() {
                let op = self.store.op(op_id);
                if op.parent() != Some(bid) {
                    return Err(crate::error::invariant_error!(
                        "op {op_id} listed in {bid} but parented elsewhere"
                    ));
                }
                if op.is_phi() {
                    if seen_nonphi {
                        return Err(crate::error::invariant_error!(
                            "phi {op_id} after non-phi in {bid}"
                        ));
                    }
                } else {
                    seen_nonphi = true;
                }
                if op.is_block_terminator() && pos + 1 != block.ops().len() {
                    return Err(crate::error::invariant_error!(
                        "terminator {op_id} not last in {bid}"
                    ));
                }
            }
        }
        Ok(())
    }
}
