//! In-memory fakes for the collaborator seams
//!
//! Compiled for unit tests and for dependents that enable the `testing`
//! feature. `FakeMemory` models a handful of mapped regions with raw
//! protection constants, which is enough to exercise probes, guarded reads
//! and the registries without a live host.

use crate::traits::{
    DetourBackend, IdentifierProvider, MemoryAccess, MemoryState, PatternScanner, Protection,
    RegionInfo,
};
use nexus_common::protocol::Section;
use nexus_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

struct FakeRegion {
    base: usize,
    data: Vec<u8>,
    protection: u32,
}

impl FakeRegion {
    fn contains(&self, address: usize, len: usize) -> bool {
        address >= self.base && address + len <= self.base + self.data.len()
    }
}

/// A fake address space made of explicitly mapped regions.
pub struct FakeMemory {
    regions: Mutex<Vec<FakeRegion>>,
    next_base: AtomicUsize,
}

impl FakeMemory {
    pub fn new() -> Self {
        Self {
            regions: Mutex::new(Vec::new()),
            next_base: AtomicUsize::new(0x0100_0000),
        }
    }

    /// Map a zero-filled region at `base` with a raw protection constant
    /// (e.g. 0x04 = read-write, 0x20 = execute-read).
    pub fn map(&self, base: usize, size: usize, protection: u32) {
        self.regions.lock().push(FakeRegion {
            base,
            data: vec![0; size],
            protection,
        });
    }

    /// Seed bytes into a mapped region, ignoring protection.
    ///
    /// Panics on unmapped addresses; this is a test-setup helper.
    pub fn seed(&self, address: usize, bytes: &[u8]) {
        let mut regions = self.regions.lock();
        let region = regions
            .iter_mut()
            .find(|r| r.contains(address, bytes.len()))
            .expect("seed target not mapped");
        let offset = address - region.base;
        region.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Seed one pointer-sized word.
    pub fn seed_word(&self, address: usize, value: usize) {
        self.seed(address, &value.to_le_bytes());
    }
}

impl Default for FakeMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAccess for FakeMemory {
    fn query_region(&self, address: usize) -> Result<RegionInfo> {
        let regions = self.regions.lock();
        let region = regions
            .iter()
            .find(|r| r.contains(address, 1))
            .ok_or(Error::NotCommitted(address))?;
        Ok(RegionInfo {
            base: region.base,
            size: region.data.len(),
            protection: Protection::from_raw(region.protection),
            state: MemoryState::Commit,
        })
    }

    fn read(&self, address: usize, size: usize) -> Result<Vec<u8>> {
        if address == 0 || size == 0 {
            return Err(Error::InvalidArgument("Invalid read parameters".into()));
        }
        let regions = self.regions.lock();
        let region = regions
            .iter()
            .find(|r| r.contains(address, size))
            .ok_or_else(|| Error::not_readable(address, "memory"))?;
        if !Protection::from_raw(region.protection).read {
            return Err(Error::not_readable(address, "memory"));
        }
        let offset = address - region.base;
        Ok(region.data[offset..offset + size].to_vec())
    }

    fn write(&self, address: usize, data: &[u8]) -> Result<()> {
        // The live path flips protection before copying, so any mapped
        // region is writable here.
        let mut regions = self.regions.lock();
        let region = regions
            .iter_mut()
            .find(|r| r.contains(address, data.len()))
            .ok_or(Error::NotCommitted(address))?;
        let offset = address - region.base;
        region.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn allocate(&self, size: usize, protection: u32) -> Result<usize> {
        let span = (size + 0xFFF) & !0xFFF;
        let base = self.next_base.fetch_add(span.max(0x1000), Ordering::SeqCst);
        self.map(base, size, protection);
        Ok(base)
    }

    fn release(&self, address: usize) -> Result<()> {
        let mut regions = self.regions.lock();
        let index = regions
            .iter()
            .position(|r| r.base == address)
            .ok_or_else(|| Error::Internal(format!("Release of unknown region {:#x}", address)))?;
        regions.remove(index);
        Ok(())
    }

    fn protect(&self, address: usize, _size: usize, protection: u32) -> Result<u32> {
        let mut regions = self.regions.lock();
        let region = regions
            .iter_mut()
            .find(|r| r.contains(address, 1))
            .ok_or(Error::NotCommitted(address))?;
        let previous = region.protection;
        region.protection = protection;
        Ok(previous)
    }
}

/// Scanner stub whose answers are fixed at construction.
#[derive(Default)]
pub struct StubScanner {
    pub find: Option<usize>,
    pub assertion: Option<usize>,
    pub in_range: Option<usize>,
    pub function_start: Option<usize>,
    pub near_call: Option<usize>,
    pub section: Option<(usize, usize)>,
}

impl PatternScanner for StubScanner {
    fn find(&self, _pattern: &[u8], _mask: &str, offset: i32, _section: Section) -> Option<usize> {
        self.find.map(|a| a.wrapping_add_signed(offset as isize))
    }

    fn find_assertion(&self, _file: &str, _message: &str, _line: u32, offset: i32) -> Option<usize> {
        self.assertion.map(|a| a.wrapping_add_signed(offset as isize))
    }

    fn find_in_range(
        &self,
        _pattern: &[u8],
        _mask: &str,
        offset: i32,
        _start: usize,
        _end: usize,
    ) -> Option<usize> {
        self.in_range.map(|a| a.wrapping_add_signed(offset as isize))
    }

    fn to_function_start(&self, _address: usize, _scan_back: usize) -> Option<usize> {
        self.function_start
    }

    fn function_from_near_call(&self, _address: usize) -> Option<usize> {
        self.near_call
    }

    fn section_range(&self, _section: Section) -> Option<(usize, usize)> {
        self.section
    }
}

/// Detour backend that records create/enable state instead of patching.
pub struct RecordingDetours {
    state: Mutex<HashMap<usize, bool>>,
    fail_enable: AtomicBool,
}

impl RecordingDetours {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            fail_enable: AtomicBool::new(false),
        }
    }

    /// Make the next `enable` call fail, for rollback tests.
    pub fn fail_next_enable(&self) {
        self.fail_enable.store(true, Ordering::SeqCst);
    }

    pub fn is_created(&self, target: usize) -> bool {
        self.state.lock().contains_key(&target)
    }

    pub fn is_enabled(&self, target: usize) -> bool {
        self.state.lock().get(&target).copied().unwrap_or(false)
    }
}

impl Default for RecordingDetours {
    fn default() -> Self {
        Self::new()
    }
}

impl DetourBackend for RecordingDetours {
    fn create(&self, target: usize, _replacement: usize) -> Result<()> {
        let mut state = self.state.lock();
        if state.contains_key(&target) {
            return Err(Error::Duplicate(format!("Patch at {:#x}", target)));
        }
        state.insert(target, false);
        Ok(())
    }

    fn remove(&self, target: usize) -> Result<()> {
        self.state
            .lock()
            .remove(&target)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("Patch at {:#x}", target)))
    }

    fn enable(&self, target: usize) -> Result<()> {
        if self.fail_enable.swap(false, Ordering::SeqCst) {
            return Err(Error::Internal("Injected enable failure".into()));
        }
        let mut state = self.state.lock();
        let entry = state
            .get_mut(&target)
            .ok_or_else(|| Error::NotFound(format!("Patch at {:#x}", target)))?;
        *entry = true;
        Ok(())
    }

    fn disable(&self, target: usize) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .get_mut(&target)
            .ok_or_else(|| Error::NotFound(format!("Patch at {:#x}", target)))?;
        *entry = false;
        Ok(())
    }
}

/// Identifier provider with a canned answer.
pub struct StubIdentity(pub Option<String>);

impl IdentifierProvider for StubIdentity {
    fn display_name(&self) -> Option<String> {
        self.0.clone()
    }
}
