//! Buffer ledger and pointer classification
//!
//! The ledger is pure storage: a buffer table keyed by host base address and
//! an alias table keyed by interior address. Aliases hold the owner's base
//! key plus a byte offset rather than any reference into the buffer table,
//! so table growth never invalidates them.
//!
//! Alias discovery is lazy. The first time an unclassified address is
//! queried, the classifier scans all tracked ranges; a hit materializes an
//! alias entry that makes every later query for that address an O(1)
//! lookup. Registered ranges must not overlap - that discipline is the
//! caller's to uphold and classification is undefined if it is broken.

use std::collections::HashMap;
use std::panic::Location;

use crate::backend::DeviceAlloc;
use crate::error::{MemForgeError, MemResult};

/// Classification of an arbitrary address against the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrClass {
    /// The base address of a tracked buffer
    Base,
    /// An address strictly inside a tracked buffer's range
    Alias,
    /// Not tracked at all
    Unknown,
}

/// A registered host allocation with a lazily-mirrored device copy
#[derive(Debug)]
pub struct TrackedBuffer {
    base: usize,
    bytes: usize,
    /// True while the host copy is authoritative; false once the device
    /// copy holds the up-to-date bytes
    pub(crate) host: bool,
    /// Device mirror, absent until first needed
    pub(crate) mirror: Option<DeviceAlloc>,
    /// Every discovered alias address rooted in this buffer, for cascade
    /// removal on erase
    aliases: Vec<usize>,
    site: &'static Location<'static>,
}

impl TrackedBuffer {
    /// Host base address
    pub fn base(&self) -> usize {
        self.base
    }

    /// Registered size in bytes; fixed for the buffer's lifetime
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Whether the host copy currently holds the authoritative bytes
    pub fn is_host_authoritative(&self) -> bool {
        self.host
    }

    /// Whether a device mirror has been allocated
    pub fn has_mirror(&self) -> bool {
        self.mirror.is_some()
    }

    /// Registration call site
    pub fn site(&self) -> &'static Location<'static> {
        self.site
    }

    /// Discovered alias addresses rooted in this buffer
    pub fn aliases(&self) -> &[usize] {
        &self.aliases
    }
}

/// An address strictly inside some tracked buffer
#[derive(Debug, Clone, Copy)]
pub struct AliasEntry {
    /// Base key of the owning buffer
    base: usize,
    /// Byte offset from the owner's base; never zero
    offset: usize,
}

impl AliasEntry {
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// The process ledger: tracked buffers plus discovered aliases
#[derive(Debug, Default)]
pub struct Ledger {
    buffers: HashMap<usize, TrackedBuffer>,
    aliases: HashMap<usize, AliasEntry>,
    discovery_scans: u64,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new buffer
    ///
    /// The base key must be unique; inserting a live key twice is a
    /// consistency violation reported with both registration sites.
    pub fn insert(
        &mut self,
        base: usize,
        bytes: usize,
        site: &'static Location<'static>,
    ) -> MemResult<()> {
        if let Some(existing) = self.buffers.get(&base) {
            return Err(MemForgeError::DoubleRegistration {
                addr: base,
                site,
                registered_at: existing.site,
            });
        }
        self.buffers.insert(
            base,
            TrackedBuffer {
                base,
                bytes,
                host: true,
                mirror: None,
                aliases: Vec::new(),
                site,
            },
        );
        Ok(())
    }

    /// Stop tracking a buffer, removing every alias rooted in it
    ///
    /// Returns the buffer so the caller can release its device mirror.
    pub fn remove(&mut self, base: usize) -> Option<TrackedBuffer> {
        let buffer = self.buffers.remove(&base)?;
        for alias_addr in &buffer.aliases {
            self.aliases.remove(alias_addr);
        }
        Some(buffer)
    }

    /// Lookup by base key
    pub fn get(&self, base: usize) -> Option<&TrackedBuffer> {
        self.buffers.get(&base)
    }

    pub(crate) fn get_mut(&mut self, base: usize) -> Option<&mut TrackedBuffer> {
        self.buffers.get_mut(&base)
    }

    /// Lookup a previously discovered alias
    pub fn alias(&self, addr: usize) -> Option<AliasEntry> {
        self.aliases.get(&addr).copied()
    }

    /// Whether an address is a tracked base
    pub fn contains(&self, base: usize) -> bool {
        self.buffers.contains_key(&base)
    }

    /// Number of tracked buffers
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Number of discovered aliases currently cached
    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }

    /// How many linear discovery scans have run (at most one per distinct
    /// alias address over its owner's lifetime)
    pub fn discovery_scans(&self) -> u64 {
        self.discovery_scans
    }

    /// Iterate over all tracked buffers
    pub fn iter(&self) -> impl Iterator<Item = &TrackedBuffer> {
        self.buffers.values()
    }

    /// Drain all tracked buffers (manager teardown)
    pub(crate) fn drain(&mut self) -> Vec<TrackedBuffer> {
        self.aliases.clear();
        self.buffers.drain().map(|(_, buffer)| buffer).collect()
    }

    /// Classify an address, discovering and caching a new alias if it falls
    /// inside a tracked range
    pub fn classify(&mut self, addr: usize) -> PtrClass {
        if self.buffers.contains_key(&addr) {
            return PtrClass::Base;
        }
        if self.aliases.contains_key(&addr) {
            return PtrClass::Alias;
        }
        // Linear discovery scan. Runs once per distinct alias address
        // because the result is cached below.
        self.discovery_scans += 1;
        let owner = self.buffers.values().find_map(|buffer| {
            let end = buffer.base.checked_add(buffer.bytes)?;
            // A base-exact address was already handled above, so strictly
            // interior only.
            (buffer.base < addr && addr < end).then_some(buffer.base)
        });
        match owner {
            Some(base) => {
                let offset = addr - base;
                tracing::trace!(
                    "discovered alias {:#x} = {:#x} + {}",
                    addr,
                    base,
                    offset
                );
                self.aliases.insert(addr, AliasEntry { base, offset });
                if let Some(buffer) = self.buffers.get_mut(&base) {
                    buffer.aliases.push(addr);
                }
                PtrClass::Alias
            }
            None => PtrClass::Unknown,
        }
    }
}
