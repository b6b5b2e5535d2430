//! Shared architecture configuration and the multi-function driver.
//!
//! One [`Architecture`] is built at registration time and shared read-only
//! by every function analysis; it carries the address spaces, the type
//! factory, the calling-convention model, per-function resource limits, and
//! named options. [`Program`] pairs an architecture with a translator and a
//! symbol source and drives decompilation of one function at a time — or of
//! many functions concurrently, each on its own
//! store/heritage/pipeline tuple.

use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::{
    address::{Address, SpaceId, SpaceKind, SpaceManager, VarnodeData},
    func::Funcdata,
    pipeline::ActionDatabase,
    ssa::JoinRecord,
    symbols::SymbolSource,
    translate::Translator,
    types::{DataOrganization, TypeFactory},
    Error, Result,
};

/// Configurable per-function resource limits.
///
/// Breaching any of these aborts the function with
/// [`Error::LimitExceeded`].
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum instructions lifted for one function.
    pub max_instructions: usize,
    /// Maximum heritage passes.
    pub max_heritage_passes: usize,
    /// Maximum action-pipeline restarts.
    pub max_restarts: usize,
    /// Maximum repeat iterations of a single action group.
    pub max_group_iterations: usize,
    /// Maximum control-flow structuring iterations.
    pub max_structure_iterations: usize,
    /// Maximum rule-pool fixed-point sweeps.
    pub max_rule_sweeps: usize,
    /// Maximum enumerated jump-table cases.
    pub max_jumptable_cases: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_instructions: 30_000,
            max_heritage_passes: 64,
            max_restarts: 5,
            max_group_iterations: 64,
            max_structure_iterations: 10_000,
            max_rule_sweeps: 256,
            max_jumptable_cases: 1024,
        }
    }
}

/// Named boolean/string options settable through the command surface.
#[derive(Debug, Default, Clone)]
pub struct Options {
    values: FxHashMap<String, String>,
}

impl Options {
    /// Sets an option by name.
    pub fn set(&mut self, name: &str, value: &str) {
        self.values.insert(name.to_string(), value.to_string());
    }

    /// Returns an option's raw string value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Returns an option interpreted as a boolean, or `default` if unset.
    #[must_use]
    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.get(name) {
            Some("true" | "on" | "1") => true,
            Some("false" | "off" | "0") => false,
            _ => default,
        }
    }
}

/// Read access to the program image for constant propagation and
/// jump-table recovery.
pub trait LoadImage: Send + Sync {
    /// Fills `buf` with bytes starting at `addr`.
    ///
    /// # Errors
    ///
    /// Fails if the range is unmapped.
    fn read_bytes(&self, addr: Address, buf: &mut [u8]) -> Result<()>;

    /// Returns `true` if the whole range is mapped read-only.
    fn is_readonly(&self, addr: Address, size: u32) -> bool;
}

/// A simple in-memory image built from sections.
#[derive(Debug, Default)]
pub struct MemoryImage {
    sections: Vec<Section>,
}

#[derive(Debug)]
struct Section {
    start: Address,
    bytes: Vec<u8>,
    readonly: bool,
}

impl MemoryImage {
    /// Creates an empty image.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a section of bytes at the given start address.
    pub fn add_section(&mut self, start: Address, bytes: Vec<u8>, readonly: bool) {
        self.sections.push(Section {
            start,
            bytes,
            readonly,
        });
    }

    fn find(&self, addr: Address, size: usize) -> Option<(&Section, usize)> {
        self.sections.iter().find_map(|s| {
            if s.start.space != addr.space || addr.offset < s.start.offset {
                return None;
            }
            let delta = usize::try_from(addr.offset - s.start.offset).ok()?;
            (delta + size <= s.bytes.len()).then_some((s, delta))
        })
    }
}

impl LoadImage for MemoryImage {
    fn read_bytes(&self, addr: Address, buf: &mut [u8]) -> Result<()> {
        let (section, delta) = self.find(addr, buf.len()).ok_or(Error::BadData {
            address: addr.offset,
        })?;
        buf.copy_from_slice(&section.bytes[delta..delta + buf.len()]);
        Ok(())
    }

    fn is_readonly(&self, addr: Address, size: u32) -> bool {
        self.find(addr, size as usize).is_some_and(|(s, _)| s.readonly)
    }
}

/// The calling-convention model consulted for parameter and return
/// recovery and for call effects.
#[derive(Debug, Clone, Default)]
pub struct ProtoModel {
    /// Model name (e.g. `__stdcall`).
    pub name: String,
    /// Storage ranges a call may clobber; INDIRECT guards are inserted for
    /// these at every call site.
    pub killed_by_call: Vec<VarnodeData>,
    /// Potential parameter storage in binding order.
    pub param_locations: Vec<VarnodeData>,
    /// Storage of the return value, if the model fixes one.
    pub return_location: Option<VarnodeData>,
}

impl ProtoModel {
    /// Returns `true` if the given storage is clobbered by a call under
    /// this model.
    #[must_use]
    pub fn is_killed_by_call(&self, storage: &VarnodeData) -> bool {
        self.killed_by_call.iter().any(|k| k.overlaps(storage))
    }

    /// Returns `true` if the given storage can carry a parameter.
    #[must_use]
    pub fn is_param_location(&self, storage: &VarnodeData) -> bool {
        self.param_locations.iter().any(|p| p.contains(storage))
    }
}

/// Read-mostly configuration shared by all concurrent function analyses.
pub struct Architecture {
    spaces: SpaceManager,
    types: Mutex<TypeFactory>,
    default_model: ProtoModel,
    limits: Limits,
    options: Options,
    image: Option<Arc<dyn LoadImage>>,
    joins: Vec<JoinRecord>,
    code_space: SpaceId,
    register_space: SpaceId,
    stack_space: SpaceId,
}

impl Architecture {
    /// Starts building an architecture.
    #[must_use]
    pub fn builder() -> ArchitectureBuilder {
        ArchitectureBuilder::default()
    }

    /// Returns the address-space manager.
    #[must_use]
    pub const fn spaces(&self) -> &SpaceManager {
        &self.spaces
    }

    /// Locks and returns the type factory.
    ///
    /// # Panics
    ///
    /// Panics if the factory lock was poisoned.
    pub fn types(&self) -> MutexGuard<'_, TypeFactory> {
        self.types.lock().expect("type factory lock poisoned")
    }

    /// Returns the default calling-convention model.
    #[must_use]
    pub const fn default_model(&self) -> &ProtoModel {
        &self.default_model
    }

    /// Returns the per-function limits.
    #[must_use]
    pub const fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Returns the named options.
    #[must_use]
    pub const fn options(&self) -> &Options {
        &self.options
    }

    /// Returns the load image, if one was registered.
    #[must_use]
    pub fn image(&self) -> Option<&Arc<dyn LoadImage>> {
        self.image.as_ref()
    }

    /// Returns the translator-declared join records.
    #[must_use]
    pub fn join_records(&self) -> &[JoinRecord] {
        &self.joins
    }

    /// Returns the space instructions live in.
    #[must_use]
    pub const fn code_space(&self) -> SpaceId {
        self.code_space
    }

    /// Returns the register space.
    #[must_use]
    pub const fn register_space(&self) -> SpaceId {
        self.register_space
    }

    /// Returns the stack space.
    #[must_use]
    pub const fn stack_space(&self) -> SpaceId {
        self.stack_space
    }

    /// Convenience: an address in the code space.
    #[must_use]
    pub const fn code_address(&self, offset: u64) -> Address {
        Address::new(self.code_space, offset)
    }

    /// Convenience: an address in the register space.
    #[must_use]
    pub const fn register_address(&self, offset: u64) -> Address {
        Address::new(self.register_space, offset)
    }

    /// Convenience: an address in the stack space.
    #[must_use]
    pub const fn stack_address(&self, offset: u64) -> Address {
        Address::new(self.stack_space, offset)
    }
}

/// Builder for [`Architecture`].
pub struct ArchitectureBuilder {
    organization: DataOrganization,
    model: ProtoModel,
    limits: Limits,
    options: Options,
    image: Option<Arc<dyn LoadImage>>,
    joins: Vec<JoinRecord>,
    register_delay: u32,
    ram_delay: u32,
    stack_delay: u32,
    stack_deadcode_delay: u32,
}

impl Default for ArchitectureBuilder {
    fn default() -> Self {
        Self {
            organization: DataOrganization::default(),
            model: ProtoModel::default(),
            limits: Limits::default(),
            options: Options::default(),
            image: None,
            joins: Vec::new(),
            register_delay: 0,
            ram_delay: 1,
            stack_delay: 1,
            stack_deadcode_delay: 2,
        }
    }
}

impl ArchitectureBuilder {
    /// Sets the data-organization policy.
    #[must_use]
    pub fn organization(mut self, organization: DataOrganization) -> Self {
        self.organization = organization;
        self
    }

    /// Sets the default calling-convention model.
    #[must_use]
    pub fn model(mut self, model: ProtoModel) -> Self {
        self.model = model;
        self
    }

    /// Sets the per-function limits.
    #[must_use]
    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets named options.
    #[must_use]
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Registers the load image.
    #[must_use]
    pub fn image(mut self, image: Arc<dyn LoadImage>) -> Self {
        self.image = Some(image);
        self
    }

    /// Declares a join record for a concatenated register pair.
    #[must_use]
    pub fn join(mut self, record: JoinRecord) -> Self {
        self.joins.push(record);
        self
    }

    /// Sets how many passes stack heritage is delayed.
    #[must_use]
    pub fn stack_delay(mut self, delay: u32, deadcode_delay: u32) -> Self {
        self.stack_delay = delay;
        self.stack_deadcode_delay = deadcode_delay;
        self
    }

    /// Builds the architecture.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] on inconsistent space configuration.
    pub fn build(self) -> Result<Arc<Architecture>> {
        let mut spaces = SpaceManager::new();
        let register_space = spaces.add_space("register", SpaceKind::Register, 4, self.register_delay)?;
        let code_space = spaces.add_space("ram", SpaceKind::Ram, 8, self.ram_delay)?;
        let stack_space = spaces.add_space("stack", SpaceKind::Stack, 8, self.stack_delay)?;
        spaces
            .space_mut(stack_space)
            .set_deadcode_delay(self.stack_deadcode_delay);
        Ok(Arc::new(Architecture {
            spaces,
            types: Mutex::new(TypeFactory::new(self.organization)),
            default_model: self.model,
            limits: self.limits,
            options: self.options,
            image: self.image,
            joins: self.joins,
            code_space,
            register_space,
            stack_space,
        }))
    }
}

/// Per-function analysis outcome retained by the batch driver.
pub enum AnalysisOutcome {
    /// Analysis ran to terminal completion.
    Complete(Box<Funcdata>),
    /// Analysis aborted with a fatal error class.
    Failed(Error),
}

/// A registered program: architecture + translator + symbols + actions.
pub struct Program {
    arch: Arc<Architecture>,
    translator: Arc<dyn Translator>,
    symbols: Arc<dyn SymbolSource + Send + Sync>,
    actions: ActionDatabase,
    flow_overrides: FxHashMap<Address, crate::translate::FlowOverride>,
    proto_overrides: FxHashMap<Address, crate::func::FuncProto>,
    results: DashMap<Address, AnalysisOutcome>,
}

impl Program {
    /// Registers a program from its collaborators. The action database is
    /// built from the built-in universal action.
    #[must_use]
    pub fn new(
        arch: Arc<Architecture>,
        translator: Arc<dyn Translator>,
        symbols: Arc<dyn SymbolSource + Send + Sync>,
    ) -> Self {
        let actions = ActionDatabase::with_universal(&arch);
        Self {
            arch,
            translator,
            symbols,
            actions,
            flow_overrides: FxHashMap::default(),
            proto_overrides: FxHashMap::default(),
            results: DashMap::new(),
        }
    }

    /// Installs a flow override at an instruction address; it applies to
    /// every function analyzed afterwards.
    pub fn set_flow_override(&mut self, addr: Address, over: crate::translate::FlowOverride) {
        self.flow_overrides.insert(addr, over);
    }

    /// Installs a prototype override for the function at `entry`.
    pub fn set_prototype_override(&mut self, entry: Address, proto: crate::func::FuncProto) {
        self.proto_overrides.insert(entry, proto);
    }

    /// Returns the architecture.
    #[must_use]
    pub fn arch(&self) -> &Arc<Architecture> {
        &self.arch
    }

    /// Returns the action database.
    #[must_use]
    pub const fn actions(&self) -> &ActionDatabase {
        &self.actions
    }

    /// Selects the current root action by name.
    ///
    /// Must not be called while function analyses are in flight; the
    /// current root is configuration.
    ///
    /// # Errors
    ///
    /// Fails if no root action with that name exists.
    pub fn set_current_action(&mut self, name: &str) -> Result<()> {
        self.actions.set_current(name)
    }

    /// Decompiles the function at the given entry address.
    ///
    /// # Errors
    ///
    /// Returns the fatal error class if analysis aborts.
    pub fn decompile_at(&self, entry: Address) -> Result<Funcdata> {
        let name = self
            .symbols
            .find_code_label(entry)
            .unwrap_or_else(|| format!("FUN_{:08x}", entry.offset));
        let mut fd = Funcdata::new(&name, entry, self.arch.clone());
        for (&addr, &over) in &self.flow_overrides {
            fd.set_flow_override(addr, over);
        }
        if let Some(proto) = self.proto_overrides.get(&entry) {
            *fd.proto_mut() = proto.clone();
        }
        fd.start_processing();
        fd.follow_flow(self.translator.as_ref())?;

        let mut action = self.actions.current_for_function()?;
        match action.perform(&mut fd) {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => fd.warning_header(&format!("analysis stopped early: {e}")),
        }
        fd.stop_processing();
        Ok(fd)
    }

    /// Decompiles many functions concurrently, one independent analysis
    /// tuple per function, and retains the outcomes.
    pub fn decompile_all(&self, entries: &[Address]) {
        entries.par_iter().for_each(|&entry| {
            let outcome = match self.decompile_at(entry) {
                Ok(fd) => AnalysisOutcome::Complete(Box::new(fd)),
                Err(e) => AnalysisOutcome::Failed(e),
            };
            self.results.insert(entry, outcome);
        });
    }

    /// Returns the retained outcome for an entry address, if analyzed.
    #[must_use]
    pub fn result_of(&self, entry: Address) -> Option<dashmap::mapref::one::Ref<'_, Address, AnalysisOutcome>> {
        self.results.get(&entry)
    }

    /// Number of retained analysis outcomes.
    #[must_use]
    pub fn result_count(&self) -> usize {
        self.results.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_spaces() {
        let arch = Architecture::builder().build().unwrap();
        let spaces = arch.spaces();
        assert_eq!(spaces.space(arch.register_space()).name(), "register");
        assert_eq!(spaces.space(arch.code_space()).name(), "ram");
        assert_eq!(spaces.space(arch.stack_space()).name(), "stack");
        assert_eq!(spaces.space(arch.register_space()).delay(), 0);
        assert_eq!(spaces.space(arch.stack_space()).delay(), 1);
        assert_eq!(spaces.space(arch.stack_space()).deadcode_delay(), 2);
    }

    #[test]
    fn test_options() {
        let mut options = Options::default();
        options.set("readonly", "on");
        options.set("inline", "false");
        assert!(options.get_bool("readonly", false));
        assert!(!options.get_bool("inline", true));
        assert!(options.get_bool("missing", true));
    }

    #[test]
    fn test_memory_image() {
        let mut image = MemoryImage::new();
        let base = Address::new(SpaceId(4), 0x1000);
        image.add_section(base, vec![1, 2, 3, 4], true);

        let mut buf = [0u8; 2];
        image.read_bytes(Address::new(SpaceId(4), 0x1001), &mut buf).unwrap();
        assert_eq!(buf, [2, 3]);
        assert!(image.is_readonly(base, 4));
        assert!(!image.is_readonly(base, 5));
        assert!(image
            .read_bytes(Address::new(SpaceId(4), 0x2000), &mut buf)
            .is_err());
    }

    #[test]
    fn test_proto_model_queries() {
        let model = ProtoModel {
            name: "default".to_string(),
            killed_by_call: vec![VarnodeData::new(Address::new(SpaceId(3), 0), 8)],
            param_locations: vec![VarnodeData::new(Address::new(SpaceId(3), 0x20), 8)],
            return_location: Some(VarnodeData::new(Address::new(SpaceId(3), 0), 8)),
        };
        assert!(model.is_killed_by_call(&VarnodeData::new(Address::new(SpaceId(3), 4), 4)));
        assert!(!model.is_killed_by_call(&VarnodeData::new(Address::new(SpaceId(3), 0x10), 4)));
        assert!(model.is_param_location(&VarnodeData::new(Address::new(SpaceId(3), 0x20), 4)));
    }
}
