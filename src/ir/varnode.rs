//! Varnodes: the SSA values of the data-flow graph.

use std::fmt;

use bitflags::bitflags;

use crate::{
    address::VarnodeData,
    ir::OpId,
    symbols::SymbolId,
    types::TypeId,
};

/// Index of a varnode within its function's [`crate::ir::IrStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarnodeId(pub u32);

impl VarnodeId {
    /// Returns the slab index.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VarnodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

bitflags! {
    /// Boolean properties of a varnode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VarnodeFlags: u32 {
        /// The varnode is an input to the function (no defining op).
        const INPUT = 1 << 0;
        /// Storage lies in the constant space; the offset is the value.
        const CONSTANT = 1 << 1;
        /// Storage holds its value beyond the lifetime of the function.
        const PERSIST = 1 << 2;
        /// All varnodes at this storage are considered the same variable.
        const ADDRTIED = 1 << 3;
        /// Storage is in a read-only region of the image.
        const READONLY = 1 << 4;
        /// Encodes a reference (op, space, ...), not a data value.
        const ANNOTATION = 1 << 5;
        /// The varnode is attached to a symbol in some scope.
        const MAPPED = 1 << 6;
        /// The data-type is locked and must not be recomputed.
        const TYPELOCK = 1 << 7;
        /// The name is locked and must not be regenerated.
        const NAMELOCK = 1 << 8;
        /// Created by an INDIRECT with no explicit data-flow source.
        const INDIRECT_CREATION = 1 << 9;
        /// Produced by a COPY with no source-level significance.
        const INCIDENTAL_COPY = 1 << 10;
        /// The varnode holds the base pointer of a virtual space.
        const SPACEBASE = 1 << 11;
        /// The varnode has a defining operation.
        const WRITTEN = 1 << 12;
        /// Storage address is forced and must not be renamed away.
        const ADDRFORCE = 1 << 13;
        /// Storage is volatile; every access is externally visible.
        const VOLATILE = 1 << 14;
        /// The emitter prints this as an expression, not a named variable.
        const IMPLIED = 1 << 15;
        /// The emitter must print this as a named variable.
        const EXPLICIT = 1 << 16;
        /// Transient traversal mark.
        const MARK = 1 << 17;
        /// Protected from dead-code elimination until its space is heritaged.
        const AUTOLIVE = 1 << 18;
        /// Storage lies in a space not yet eligible for heritage; writes are
        /// masked off from the current pass.
        const WRITEMASK = 1 << 19;
    }
}

/// A single SSA value.
///
/// A varnode pairs an immutable storage descriptor with its data-flow
/// linkage: at most one defining operation and an insertion-ordered list of
/// reading operations (the *descend* list). A varnode with neither the
/// [`VarnodeFlags::WRITTEN`] nor the [`VarnodeFlags::INPUT`] property is
/// *free*: it is not yet linked into SSA form.
///
/// Linkage fields are private to the [`crate::ir`] module; they change only
/// through the store's linkage API, which maintains the invariant that every
/// reader appears exactly once in the descend list.
#[derive(Debug, Clone)]
pub struct Varnode {
    storage: VarnodeData,
    create_index: u32,
    pub(super) def: Option<OpId>,
    pub(super) descend: Vec<OpId>,
    pub(super) flags: VarnodeFlags,
    nzmask: u64,
    datatype: Option<TypeId>,
    symbol: Option<SymbolId>,
    high: Option<u32>,
}

impl Varnode {
    /// Creates a detached varnode. Only the store calls this.
    pub(super) fn new(storage: VarnodeData, create_index: u32, flags: VarnodeFlags) -> Self {
        Self {
            storage,
            create_index,
            def: None,
            descend: Vec::new(),
            flags,
            nzmask: size_mask(storage.size),
            datatype: None,
            symbol: None,
            high: None,
        }
    }

    /// Returns the immutable storage descriptor.
    #[must_use]
    pub const fn storage(&self) -> VarnodeData {
        self.storage
    }

    /// Returns the size in bytes.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.storage.size
    }

    /// Returns the creation index, the stable iteration key.
    #[must_use]
    pub const fn create_index(&self) -> u32 {
        self.create_index
    }

    /// Returns the defining operation, if the varnode is written.
    #[must_use]
    pub const fn def(&self) -> Option<OpId> {
        self.def
    }

    /// Returns the reading operations in insertion order.
    ///
    /// An operation reading this varnode through several input slots still
    /// appears only once.
    #[must_use]
    pub fn descend(&self) -> &[OpId] {
        &self.descend
    }

    /// Returns the property flags.
    #[must_use]
    pub const fn flags(&self) -> VarnodeFlags {
        self.flags
    }

    /// Sets a property flag.
    pub fn set_flag(&mut self, flag: VarnodeFlags) {
        self.flags |= flag;
    }

    /// Clears a property flag.
    pub fn clear_flag(&mut self, flag: VarnodeFlags) {
        self.flags &= !flag;
    }

    /// Returns `true` if this is a constant-space varnode.
    #[must_use]
    pub const fn is_constant(&self) -> bool {
        self.flags.contains(VarnodeFlags::CONSTANT)
    }

    /// Returns the constant value, if this is a constant varnode.
    #[must_use]
    pub fn constant_value(&self) -> Option<u64> {
        self.is_constant().then_some(self.storage.addr.offset)
    }

    /// Returns `true` if this varnode is a function input.
    #[must_use]
    pub const fn is_input(&self) -> bool {
        self.flags.contains(VarnodeFlags::INPUT)
    }

    /// Returns `true` if this varnode has a defining operation.
    #[must_use]
    pub const fn is_written(&self) -> bool {
        self.flags.contains(VarnodeFlags::WRITTEN)
    }

    /// Returns `true` if the varnode is not yet linked into SSA form.
    #[must_use]
    pub const fn is_free(&self) -> bool {
        !self.flags.contains(VarnodeFlags::WRITTEN) && !self.flags.contains(VarnodeFlags::INPUT)
    }

    /// Returns `true` if this varnode does not participate in data-flow.
    #[must_use]
    pub const fn is_annotation(&self) -> bool {
        self.flags.contains(VarnodeFlags::ANNOTATION)
    }

    /// Returns `true` if the varnode has no readers.
    #[must_use]
    pub fn has_no_descend(&self) -> bool {
        self.descend.is_empty()
    }

    /// Returns the mask of bits that may be non-zero.
    #[must_use]
    pub const fn nzmask(&self) -> u64 {
        self.nzmask
    }

    /// Sets the known non-zero mask.
    pub fn set_nzmask(&mut self, mask: u64) {
        self.nzmask = mask & size_mask(self.storage.size);
    }

    /// Returns the recovered data-type, if any.
    #[must_use]
    pub const fn datatype(&self) -> Option<TypeId> {
        self.datatype
    }

    /// Sets the recovered data-type.
    pub fn set_datatype(&mut self, ty: TypeId) {
        self.datatype = Some(ty);
    }

    /// Returns the bound symbol, if any.
    #[must_use]
    pub const fn symbol(&self) -> Option<SymbolId> {
        self.symbol
    }

    /// Binds a symbol to this varnode.
    pub fn set_symbol(&mut self, symbol: SymbolId) {
        self.symbol = Some(symbol);
        self.flags |= VarnodeFlags::MAPPED;
    }

    /// Returns the high-variable index, once merging has run.
    #[must_use]
    pub const fn high(&self) -> Option<u32> {
        self.high
    }

    /// Assigns the high-variable index.
    pub fn set_high(&mut self, high: Option<u32>) {
        self.high = high;
    }
}

impl fmt::Display for Varnode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_constant() {
            write!(f, "#0x{:x}:{}", self.storage.addr.offset, self.storage.size)
        } else {
            write!(f, "{}", self.storage)
        }
    }
}

/// Returns the mask covering `size` bytes of value.
#[must_use]
pub(crate) const fn size_mask(size: u32) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}
