//! Address spaces and storage locations.
//!
//! Every value tracked by the analysis lives at an [`Address`]: an address
//! space plus a byte offset within it. Spaces model the distinct storage
//! regions of a machine (registers, RAM, stack, compiler temporaries) as well
//! as two analysis-internal spaces: the *constant* space, whose offsets are
//! the constant values themselves, and the *iop* space, whose offsets encode
//! references to other operations for annotation purposes.
//!
//! All sizes inside the core are bytes. A space's `wordsize` matters only
//! when the translator converts instruction addresses at the boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The role an address space plays in the analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpaceKind {
    /// Offsets are constant values, not storage.
    Constant,
    /// Infinite scratch space for temporaries introduced by lifting.
    Unique,
    /// General purpose and special registers.
    Register,
    /// Main addressable memory of the program image.
    Ram,
    /// Stack relative to the incoming stack pointer.
    Stack,
    /// Offsets encode references to p-code operations (annotation only).
    Iop,
}

/// Identifier of an address space within one [`SpaceManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpaceId(pub u8);

impl SpaceId {
    /// Returns the index of this space within its manager.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

/// A single address space and its heritage configuration.
///
/// The `delay` and `deadcode_delay` fields drive incremental SSA
/// construction: variables in a space become eligible for heritage only once
/// the pass counter reaches `delay`, and dead-code elimination must wait a
/// further `deadcode_delay` passes after the space was first heritaged.
#[derive(Debug, Clone)]
pub struct AddrSpace {
    id: SpaceId,
    name: String,
    kind: SpaceKind,
    wordsize: u32,
    addr_size: u32,
    delay: u32,
    deadcode_delay: u32,
}

impl AddrSpace {
    /// Creates a new address space description.
    #[must_use]
    pub fn new(id: SpaceId, name: &str, kind: SpaceKind, addr_size: u32, delay: u32) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind,
            wordsize: 1,
            addr_size,
            delay,
            deadcode_delay: delay,
        }
    }

    /// Returns the identifier of this space.
    #[must_use]
    pub const fn id(&self) -> SpaceId {
        self.id
    }

    /// Returns the space's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the role of this space.
    #[must_use]
    pub const fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Returns the number of bytes in one addressable unit.
    #[must_use]
    pub const fn wordsize(&self) -> u32 {
        self.wordsize
    }

    /// Returns the size of an address in this space, in bytes.
    #[must_use]
    pub const fn addr_size(&self) -> u32 {
        self.addr_size
    }

    /// Returns how many passes heritage of this space is delayed.
    #[must_use]
    pub const fn delay(&self) -> u32 {
        self.delay
    }

    /// Returns how many passes dead-code elimination is delayed beyond the
    /// first heritage of this space.
    #[must_use]
    pub const fn deadcode_delay(&self) -> u32 {
        self.deadcode_delay
    }

    /// Sets the dead-code elimination delay.
    pub fn set_deadcode_delay(&mut self, delay: u32) {
        self.deadcode_delay = delay;
    }

    /// Sets the wordsize (bytes per addressable unit).
    pub fn set_wordsize(&mut self, wordsize: u32) {
        self.wordsize = wordsize;
    }
}

/// The collection of address spaces for one architecture.
///
/// Spaces are registered once at configuration time and shared read-only by
/// every function analysis. The manager always contains the constant,
/// unique, and iop spaces; register, RAM, and stack spaces are added from
/// the processor description.
#[derive(Debug, Clone)]
pub struct SpaceManager {
    spaces: Vec<AddrSpace>,
    constant: SpaceId,
    unique: SpaceId,
    iop: SpaceId,
}

impl SpaceManager {
    /// Creates a manager holding only the analysis-internal spaces.
    #[must_use]
    pub fn new() -> Self {
        let mut spaces = Vec::new();
        let constant = SpaceId(0);
        spaces.push(AddrSpace::new(constant, "const", SpaceKind::Constant, 8, 0));
        let unique = SpaceId(1);
        spaces.push(AddrSpace::new(unique, "unique", SpaceKind::Unique, 4, 0));
        let iop = SpaceId(2);
        spaces.push(AddrSpace::new(iop, "iop", SpaceKind::Iop, 8, 0));
        Self {
            spaces,
            constant,
            unique,
            iop,
        }
    }

    /// Registers a new space and returns its identifier.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ConfigError`] if a space with the same name
    /// already exists.
    pub fn add_space(
        &mut self,
        name: &str,
        kind: SpaceKind,
        addr_size: u32,
        delay: u32,
    ) -> crate::Result<SpaceId> {
        if self.spaces.iter().any(|s| s.name() == name) {
            return Err(crate::Error::ConfigError(format!(
                "duplicate address space '{name}'"
            )));
        }
        let id = SpaceId(u8::try_from(self.spaces.len()).map_err(|_| {
            crate::Error::ConfigError("more than 255 address spaces".to_string())
        })?);
        self.spaces.push(AddrSpace::new(id, name, kind, addr_size, delay));
        Ok(id)
    }

    /// Returns the space with the given identifier.
    #[must_use]
    pub fn space(&self, id: SpaceId) -> &AddrSpace {
        &self.spaces[id.index()]
    }

    /// Returns a mutable reference to the space with the given identifier.
    pub fn space_mut(&mut self, id: SpaceId) -> &mut AddrSpace {
        &mut self.spaces[id.index()]
    }

    /// Looks up a space by name.
    #[must_use]
    pub fn space_by_name(&self, name: &str) -> Option<&AddrSpace> {
        self.spaces.iter().find(|s| s.name() == name)
    }

    /// Returns the constant space.
    #[must_use]
    pub const fn constant_space(&self) -> SpaceId {
        self.constant
    }

    /// Returns the unique (temporary) space.
    #[must_use]
    pub const fn unique_space(&self) -> SpaceId {
        self.unique
    }

    /// Returns the iop annotation space.
    #[must_use]
    pub const fn iop_space(&self) -> SpaceId {
        self.iop
    }

    /// Returns all registered spaces in registration order.
    #[must_use]
    pub fn spaces(&self) -> &[AddrSpace] {
        &self.spaces
    }

    /// Returns the number of registered spaces.
    #[must_use]
    pub fn space_count(&self) -> usize {
        self.spaces.len()
    }
}

impl Default for SpaceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A location within an address space.
///
/// Addresses order first by space, then by offset, which gives the
/// loc-sorted varnode index its iteration order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Address {
    /// The containing address space.
    pub space: SpaceId,
    /// Byte offset within the space.
    pub offset: u64,
}

impl Address {
    /// Creates a new address.
    #[must_use]
    pub const fn new(space: SpaceId, offset: u64) -> Self {
        Self { space, offset }
    }

    /// Returns the address `delta` bytes further into the same space,
    /// wrapping on overflow.
    #[must_use]
    pub const fn add_wrap(&self, delta: u64) -> Self {
        Self {
            space: self.space,
            offset: self.offset.wrapping_add(delta),
        }
    }

    /// Returns `true` if `self` and `other` are in the same space and the
    /// ranges `[self, self+size)` and `[other, other_size)` overlap.
    #[must_use]
    pub fn overlaps(&self, size: u64, other: &Address, other_size: u64) -> bool {
        self.space == other.space
            && self.offset < other.offset.saturating_add(other_size)
            && other.offset < self.offset.saturating_add(size)
    }

    /// Returns `true` if the range `[self, self+size)` fully contains
    /// `[other, other+other_size)`.
    #[must_use]
    pub fn contains(&self, size: u64, other: &Address, other_size: u64) -> bool {
        self.space == other.space
            && other.offset >= self.offset
            && other.offset.saturating_add(other_size) <= self.offset.saturating_add(size)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}:0x{:x}", self.space.0, self.offset)
    }
}

/// A storage descriptor: an address plus a size in bytes.
///
/// This is the raw form in which the translator describes operands before
/// they are interned as varnodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarnodeData {
    /// Starting address of the storage.
    pub addr: Address,
    /// Size in bytes.
    pub size: u32,
}

impl VarnodeData {
    /// Creates a new storage descriptor.
    #[must_use]
    pub const fn new(addr: Address, size: u32) -> Self {
        Self { addr, size }
    }

    /// Returns `true` if this storage overlaps `other`.
    #[must_use]
    pub fn overlaps(&self, other: &VarnodeData) -> bool {
        self.addr
            .overlaps(u64::from(self.size), &other.addr, u64::from(other.size))
    }

    /// Returns `true` if this storage fully contains `other`.
    #[must_use]
    pub fn contains(&self, other: &VarnodeData) -> bool {
        self.addr
            .contains(u64::from(self.size), &other.addr, u64::from(other.size))
    }
}

impl fmt::Display for VarnodeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_manager_builtins() {
        let mgr = SpaceManager::new();
        assert_eq!(mgr.space(mgr.constant_space()).kind(), SpaceKind::Constant);
        assert_eq!(mgr.space(mgr.unique_space()).kind(), SpaceKind::Unique);
        assert_eq!(mgr.space(mgr.iop_space()).kind(), SpaceKind::Iop);
    }

    #[test]
    fn test_add_space_rejects_duplicates() {
        let mut mgr = SpaceManager::new();
        mgr.add_space("register", SpaceKind::Register, 4, 0).unwrap();
        assert!(mgr.add_space("register", SpaceKind::Register, 4, 0).is_err());
    }

    #[test]
    fn test_space_lookup_by_name() {
        let mut mgr = SpaceManager::new();
        let ram = mgr.add_space("ram", SpaceKind::Ram, 8, 0).unwrap();
        assert_eq!(mgr.space_by_name("ram").unwrap().id(), ram);
        assert!(mgr.space_by_name("rom").is_none());
    }

    #[test]
    fn test_address_ordering() {
        let a = Address::new(SpaceId(1), 0x100);
        let b = Address::new(SpaceId(1), 0x200);
        let c = Address::new(SpaceId(2), 0x0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_overlap_and_containment() {
        let base = Address::new(SpaceId(3), 0x10);
        let inner = Address::new(SpaceId(3), 0x12);
        assert!(base.overlaps(8, &inner, 2));
        assert!(base.contains(8, &inner, 2));
        assert!(!base.contains(8, &inner, 8));

        let other_space = Address::new(SpaceId(4), 0x12);
        assert!(!base.overlaps(8, &other_space, 2));
    }

    #[test]
    fn test_varnode_data_overlap() {
        let a = VarnodeData::new(Address::new(SpaceId(3), 0x10), 4);
        let b = VarnodeData::new(Address::new(SpaceId(3), 0x12), 4);
        let c = VarnodeData::new(Address::new(SpaceId(3), 0x14), 4);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(b.overlaps(&c));
    }
}
