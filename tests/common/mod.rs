//! Common fixtures for coherence tests
//!
//! All integration tests run against the host emulation provider, so the
//! full coherence protocol is exercised without an accelerator. Under that
//! provider a resolved device address is an ordinary host address, which
//! lets tests read the mirror directly to verify what was copied.

use memforge::{ExecConfig, MemoryManager, ProviderKind};

/// A heap allocation that backs a tracked buffer for the duration of a test
pub struct HostBlock {
    data: Vec<u8>,
}

impl HostBlock {
    /// Allocate `len` bytes filled with a deterministic pattern
    pub fn new(len: usize) -> Self {
        HostBlock {
            data: (0..len).map(pattern_byte).collect(),
        }
    }

    /// The byte the deterministic pattern puts at index `i`
    pub fn expected(i: usize) -> u8 {
        pattern_byte(i)
    }

    pub fn ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Overwrite every byte
    pub fn fill(&mut self, value: u8) {
        self.data.fill(value);
    }

    /// Whether the whole block still carries the original pattern
    pub fn matches_pattern(&self) -> bool {
        self.data.iter().enumerate().all(|(i, b)| *b == pattern_byte(i))
    }
}

fn pattern_byte(i: usize) -> u8 {
    (i % 251) as u8
}

/// An active manager over the host emulation provider, device disabled
pub fn host_manager() -> MemoryManager {
    MemoryManager::new(ExecConfig::new().with_provider(ProviderKind::HostEmulation))
        .expect("host emulation provider is always available")
}

/// Read `len` bytes behind a resolved device address (valid for the host
/// emulation provider only)
pub fn device_bytes(addr: *const u8, len: usize) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(addr, len) }.to_vec()
}

/// Overwrite `len` bytes behind a resolved device address
pub fn clobber_device(addr: *mut u8, len: usize, value: u8) {
    unsafe {
        std::ptr::write_bytes(addr, value, len);
    }
}
