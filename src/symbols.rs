//! Symbol and scope database surface.
//!
//! The core does not own a program-wide symbol table; it consults one
//! through [`SymbolSource`] on every name and property lookup, and it owns
//! exactly one [`ScopeLocal`] per function for recovered locals and
//! parameters. Dynamic symbols, whose storage cannot be named by address,
//! are keyed by a hash of the variable's data-flow fingerprint instead.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::{
    address::{Address, VarnodeData},
    ir::VarnodeFlags,
    types::TypeId,
};

/// Handle to a symbol within one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SymbolId(pub u32);

impl SymbolId {
    /// Returns the index of this symbol within its scope.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Classification of a symbol within its scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolCategory {
    /// A recovered local variable.
    Local,
    /// A formal parameter of the function.
    Parameter,
    /// A named global consulted from the outer database.
    Global,
    /// A label attached to a code address.
    Label,
}

/// A named entity with an optional locked data-type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    /// Symbol name.
    pub name: String,
    /// Recovered or declared type, if known.
    pub datatype: Option<TypeId>,
    /// What kind of symbol this is.
    pub category: SymbolCategory,
    /// `true` if the type must not be recomputed by analysis.
    pub type_locked: bool,
    /// `true` if the name must not be regenerated.
    pub name_locked: bool,
}

/// How a symbol entry identifies its storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStorage {
    /// Fixed storage at a known address range.
    Static(VarnodeData),
    /// Dynamic storage identified by a data-flow hash.
    Dynamic {
        /// Hash of the variable's data-flow fingerprint.
        hash: u64,
        /// Address of the operation anchoring the hash.
        use_addr: Address,
    },
}

/// A (symbol, storage, use-range) triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolEntry {
    /// The symbol this entry maps.
    pub symbol: SymbolId,
    /// Where the symbol's value lives.
    pub storage: EntryStorage,
    /// First address at which the mapping applies; `None` for whole-scope.
    pub use_point: Option<Address>,
}

/// Read-only queries the outer symbol database must answer.
///
/// Implementations are consulted during analysis and must not change
/// underneath it; schema changes route through the restart mechanism.
pub trait SymbolSource {
    /// Looks up boolean storage properties and an optional symbol for the
    /// given range at the given use point.
    fn query_properties(
        &self,
        addr: Address,
        size: u32,
        use_point: Address,
    ) -> (Option<SymbolId>, VarnodeFlags);

    /// Finds the entry address of the function containing `addr`, if known.
    fn find_function(&self, addr: Address) -> Option<Address>;

    /// Finds a code label at exactly `addr`.
    fn find_code_label(&self, addr: Address) -> Option<String>;
}

/// A symbol source with no entries; every lookup misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptySymbolSource;

impl SymbolSource for EmptySymbolSource {
    fn query_properties(
        &self,
        _addr: Address,
        _size: u32,
        _use_point: Address,
    ) -> (Option<SymbolId>, VarnodeFlags) {
        (None, VarnodeFlags::empty())
    }

    fn find_function(&self, _addr: Address) -> Option<Address> {
        None
    }

    fn find_code_label(&self, _addr: Address) -> Option<String> {
        None
    }
}

/// The function-local scope: symbols recovered for locals and parameters.
///
/// Name generation keeps a per-base counter so `local_8`, `local_8_1`, ...
/// stay unique without a global registry.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ScopeLocal {
    symbols: Vec<Symbol>,
    entries: Vec<SymbolEntry>,
    #[serde(skip)]
    used_names: FxHashMap<String, u32>,
}

impl ScopeLocal {
    /// Creates an empty local scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a symbol and returns its handle.
    pub fn add_symbol(&mut self, symbol: Symbol) -> SymbolId {
        let id = SymbolId(u32::try_from(self.symbols.len()).unwrap_or(u32::MAX));
        *self.used_names.entry(symbol.name.clone()).or_insert(0) += 1;
        self.symbols.push(symbol);
        id
    }

    /// Maps a symbol to static storage.
    pub fn add_entry(&mut self, symbol: SymbolId, storage: VarnodeData, use_point: Option<Address>) {
        self.entries.push(SymbolEntry {
            symbol,
            storage: EntryStorage::Static(storage),
            use_point,
        });
    }

    /// Maps a symbol to dynamic storage identified by a hash.
    pub fn add_dynamic_entry(&mut self, symbol: SymbolId, hash: u64, use_addr: Address) {
        self.entries.push(SymbolEntry {
            symbol,
            storage: EntryStorage::Dynamic { hash, use_addr },
        use_point: None,
        });
    }

    /// Returns the symbol for a handle.
    #[must_use]
    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.index()]
    }

    /// Returns a mutable reference to a symbol.
    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.index()]
    }

    /// Iterates all entries of this scope.
    pub fn entries(&self) -> impl Iterator<Item = &SymbolEntry> {
        self.entries.iter()
    }

    /// Returns all symbols of this scope.
    #[must_use]
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Finds the entry whose static storage contains the given range.
    #[must_use]
    pub fn find_covering(&self, storage: &VarnodeData) -> Option<&SymbolEntry> {
        self.entries.iter().find(|e| match &e.storage {
            EntryStorage::Static(s) => s.contains(storage),
            EntryStorage::Dynamic { .. } => false,
        })
    }

    /// Finds the entry with the given dynamic hash.
    #[must_use]
    pub fn find_dynamic(&self, hash: u64) -> Option<&SymbolEntry> {
        self.entries.iter().find(|e| {
            matches!(&e.storage, EntryStorage::Dynamic { hash: h, .. } if *h == hash)
        })
    }

    /// Builds a fresh variable name for storage at `addr`, unique within
    /// this scope.
    pub fn build_variable_name(&mut self, addr: Address, seed: u32) -> String {
        let base = format!("local_{:x}", addr.offset);
        let count = self.used_names.entry(base.clone()).or_insert(0);
        let name = if *count == 0 && seed == 0 {
            base.clone()
        } else {
            format!("{}_{}", base, *count + seed)
        };
        *count += 1;
        name
    }

    /// Rebuilds the name-collision table after deserialization.
    pub fn rebuild_name_index(&mut self) {
        self.used_names.clear();
        let names: Vec<String> = self.symbols.iter().map(|s| s.name.clone()).collect();
        for name in names {
            *self.used_names.entry(name).or_insert(0) += 1;
        }
    }
}
