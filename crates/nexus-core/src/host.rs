//! Live host-memory implementation
//!
//! Direct access to the host's address space: the agent is in-process, so a
//! read is a pointer dereference. Safety comes from probing regions with
//! `VirtualQuery` before touching anything and keeping every dereference
//! inside a structured-exception guard.

use crate::memory::MAX_WRITE_SIZE;
use crate::traits::{MemoryAccess, MemoryState, Protection, RegionInfo};
use nexus_common::{Error, Result};
use windows::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT,
    MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS,
};

/// Run `f` under a structured-exception guard, converting an access
/// violation into a typed error naming the touched address.
pub fn guarded<T>(address: usize, context: &str, f: impl FnMut() -> T) -> Result<T> {
    microseh::try_seh(f).map_err(|_| Error::access_violation(address, context))
}

/// `MemoryAccess` over the host's own address space.
#[derive(Default)]
pub struct HostMemory;

impl HostMemory {
    pub fn new() -> Self {
        Self
    }

    /// Probe that `[address, address + size)` is committed and readable,
    /// walking regions since a range may span several.
    fn probe_readable(&self, address: usize, size: usize) -> Result<()> {
        let end = address
            .checked_add(size)
            .ok_or_else(|| Error::InvalidArgument("Address range overflow".into()))?;
        let mut cursor = address;
        while cursor < end {
            let region = self
                .query_region(cursor)
                .map_err(|_| Error::not_readable(cursor, "memory"))?;
            if region.state != MemoryState::Commit || !region.protection.read {
                return Err(Error::not_readable(cursor, "memory"));
            }
            if region.end() <= cursor {
                return Err(Error::not_readable(cursor, "memory"));
            }
            cursor = region.end();
        }
        Ok(())
    }
}

impl MemoryAccess for HostMemory {
    fn query_region(&self, address: usize) -> Result<RegionInfo> {
        let mut mbi = MEMORY_BASIC_INFORMATION::default();
        let written = unsafe {
            VirtualQuery(
                Some(address as *const _),
                &mut mbi,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            return Err(Error::NotCommitted(address));
        }

        let state = if mbi.State == MEM_COMMIT {
            MemoryState::Commit
        } else if mbi.State == MEM_RESERVE {
            MemoryState::Reserve
        } else {
            MemoryState::Free
        };

        Ok(RegionInfo {
            base: mbi.BaseAddress as usize,
            size: mbi.RegionSize,
            protection: Protection::from_raw(mbi.Protect.0),
            state,
        })
    }

    fn read(&self, address: usize, size: usize) -> Result<Vec<u8>> {
        if address == 0 || size == 0 {
            return Err(Error::InvalidArgument("Invalid read parameters".into()));
        }
        self.probe_readable(address, size)?;

        guarded(address, "memory read", || unsafe {
            std::slice::from_raw_parts(address as *const u8, size).to_vec()
        })
    }

    fn write(&self, address: usize, data: &[u8]) -> Result<()> {
        if address == 0 || data.is_empty() || data.len() > MAX_WRITE_SIZE {
            return Err(Error::InvalidArgument("Invalid write parameters".into()));
        }

        let previous = self.protect(address, data.len(), PAGE_EXECUTE_READWRITE.0)?;

        let result = guarded(address, "memory write", || unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), address as *mut u8, data.len());
        });

        // Restore whatever protection the page had before the copy.
        if let Err(e) = self.protect(address, data.len(), previous) {
            nexus_common::warn!(
                target: "nexus_core::host",
                address = format!("{:#x}", address),
                error = %e,
                "Failed to restore page protection"
            );
        }

        result
    }

    fn allocate(&self, size: usize, protection: u32) -> Result<usize> {
        let address = unsafe {
            VirtualAlloc(
                None,
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_PROTECTION_FLAGS(protection),
            )
        };
        if address.is_null() {
            return Err(Error::Internal(format!(
                "VirtualAlloc failed: {}",
                windows::core::Error::from_win32()
            )));
        }
        Ok(address as usize)
    }

    fn release(&self, address: usize) -> Result<()> {
        unsafe { VirtualFree(address as *mut _, 0, MEM_RELEASE) }.map_err(|e| {
            Error::Internal(format!("VirtualFree failed: {}", e))
        })
    }

    fn protect(&self, address: usize, size: usize, protection: u32) -> Result<u32> {
        let mut previous = PAGE_PROTECTION_FLAGS::default();
        unsafe {
            VirtualProtect(
                address as *mut _,
                size,
                PAGE_PROTECTION_FLAGS(protection),
                &mut previous,
            )
        }
        .map_err(|e| Error::Internal(format!("VirtualProtect failed: {}", e)))?;
        Ok(previous.0)
    }
}
