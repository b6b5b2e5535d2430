//! Map of heritaged storage ranges.

use std::collections::BTreeMap;

use crate::address::Address;

/// Extent and pass number of one heritaged range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizePass {
    /// Size of the range in bytes.
    pub size: u64,
    /// Pass in which the range was heritaged.
    pub pass: u32,
}

/// How a newly added range interacted with existing entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intersect {
    /// The range was disjoint from all existing entries.
    New,
    /// The range partially overlapped an existing entry and was merged.
    Partial,
    /// The range was already fully covered by an entry of an earlier pass.
    Covered,
}

/// Disjoint cover of heritaged memory ranges, keyed by start address.
///
/// Adding a range that overlaps existing entries merges them into one
/// entry spanning the union; the entry keeps the *earliest* pass number of
/// its constituents so eligibility queries stay conservative.
#[derive(Debug, Default, Clone)]
pub struct LocationMap {
    map: BTreeMap<Address, SizePass>,
}

impl LocationMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a range as heritaged in the given pass.
    ///
    /// Returns the merged range covering the addition and how the addition
    /// intersected existing entries.
    pub fn add(&mut self, addr: Address, size: u64, pass: u32) -> (Address, u64, Intersect) {
        let mut start = addr;
        let mut end = addr.offset.saturating_add(size);
        let mut earliest = pass;
        let mut intersect = Intersect::New;
        let mut absorbed: Vec<Address> = Vec::new();

        // Re-adding an identical range is not an overlap
        if let Some(&existing) = self.map.get(&addr) {
            if existing.size == size {
                return (
                    addr,
                    size,
                    if existing.pass < pass {
                        Intersect::Covered
                    } else {
                        Intersect::New
                    },
                );
            }
        }

        // An entry starting before us can swallow or overlap the new range
        if let Some((&prev_addr, &prev)) = self
            .map
            .range(..=addr)
            .next_back()
            .filter(|(a, _)| a.space == addr.space)
        {
            let prev_end = prev_addr.offset.saturating_add(prev.size);
            if prev_end > addr.offset {
                if prev_addr.offset <= addr.offset && prev_end >= end && prev.pass < pass {
                    // Fully covered by an earlier pass
                    return (prev_addr, prev.size, Intersect::Covered);
                }
                intersect = if prev_end > addr.offset {
                    Intersect::Partial
                } else {
                    intersect
                };
                start = prev_addr;
                end = end.max(prev_end);
                earliest = earliest.min(prev.pass);
                absorbed.push(prev_addr);
            }
        }

        // Entries starting within the (growing) range merge in
        loop {
            let next = self
                .map
                .range(Address::new(start.space, start.offset)..)
                .find(|(a, _)| a.space == start.space && !absorbed.contains(a))
                .map(|(&a, &sp)| (a, sp));
            match next {
                Some((a, sp)) if a.offset < end => {
                    let a_end = a.offset.saturating_add(sp.size);
                    if a.offset < end && (a.offset > start.offset || a_end != end) {
                        intersect = Intersect::Partial;
                    }
                    end = end.max(a_end);
                    earliest = earliest.min(sp.pass);
                    absorbed.push(a);
                }
                _ => break,
            }
        }

        for a in absorbed {
            self.map.remove(&a);
        }
        let merged_size = end - start.offset;
        self.map.insert(
            start,
            SizePass {
                size: merged_size,
                pass: earliest,
            },
        );
        (start, merged_size, intersect)
    }

    /// Returns the pass in which the range containing `addr` was
    /// heritaged, or `None` if it has not been.
    #[must_use]
    pub fn find_pass(&self, addr: Address) -> Option<u32> {
        self.map
            .range(..=addr)
            .next_back()
            .filter(|(a, sp)| {
                a.space == addr.space && addr.offset < a.offset.saturating_add(sp.size)
            })
            .map(|(_, sp)| sp.pass)
    }

    /// Returns the entry containing `addr`, if any.
    #[must_use]
    pub fn find(&self, addr: Address) -> Option<(Address, SizePass)> {
        self.map
            .range(..=addr)
            .next_back()
            .filter(|(a, sp)| {
                a.space == addr.space && addr.offset < a.offset.saturating_add(sp.size)
            })
            .map(|(&a, &sp)| (a, sp))
    }

    /// Removes the entry starting exactly at `addr`.
    pub fn erase(&mut self, addr: Address) {
        self.map.remove(&addr);
    }

    /// Iterates all entries in address order.
    pub fn iter(&self) -> impl Iterator<Item = (Address, SizePass)> + '_ {
        self.map.iter().map(|(&a, &sp)| (a, sp))
    }

    /// Removes all entries.
    pub fn clear(&mut self) {
        self.map.clear();
    }
}
