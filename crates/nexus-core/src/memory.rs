//! Memory operations built on the guarded primitives
//!
//! Pointer-chain walking, typed array reads, batch reads and the registry of
//! bridge-owned allocations. Everything here works against the
//! `MemoryAccess` seam so the logic is host-independent.

use crate::traits::MemoryAccess;
use nexus_common::protocol::{self, MAX_ARRAY_PAYLOAD, MAX_BATCH_ENTRIES};
use nexus_common::{debug, Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Upper bound for a single write through the bridge.
pub const MAX_WRITE_SIZE: usize = 0x10000;
/// Upper bound for a single allocation through the bridge.
pub const MAX_ALLOC_SIZE: usize = 0x100000;

/// Result of a pointer-chain walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainResult {
    pub final_address: usize,
    /// Final value, zero-extended to 64 bits.
    pub value: u64,
}

/// Follow a pointer chain: load a pointer at the current address, add the
/// step's offset, repeat; then read `final_size` bytes at the end.
pub fn follow_pointer_chain(
    memory: &dyn MemoryAccess,
    base: usize,
    offsets: &[i32],
    final_size: u8,
) -> Result<ChainResult> {
    if !matches!(final_size, 1 | 2 | 4 | 8) {
        return Err(Error::InvalidArgument(
            "Invalid final_size (must be 1, 2, 4, or 8)".into(),
        ));
    }

    let mut current = base;
    for (step, offset) in offsets.iter().enumerate() {
        let next = memory
            .read_word(current)
            .map_err(|_| Error::not_readable(current, format!("pointer-chain step {}", step)))?;
        current = next.wrapping_add_signed(*offset as isize);
    }

    let value = memory
        .read_value(current, final_size)
        .map_err(|_| Error::not_readable(current, "pointer-chain final value"))?;

    Ok(ChainResult {
        final_address: current,
        value,
    })
}

/// Result of a typed array read.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayResult {
    pub element_type: u8,
    pub element_size: u32,
    pub data: Vec<u8>,
}

/// Read `count` elements of the given wire type starting at `address`.
pub fn read_array(
    memory: &dyn MemoryAccess,
    address: usize,
    element_type: u8,
    count: u32,
) -> Result<ArrayResult> {
    let element_size = protocol::element_size(element_type)
        .ok_or_else(|| Error::InvalidArgument("Invalid element type".into()))?;

    if address == 0 {
        return Err(Error::InvalidArgument("Invalid address (null)".into()));
    }

    let total = (count as usize)
        .checked_mul(element_size)
        .ok_or_else(|| Error::InvalidArgument("Array too large (overflow)".into()))?;
    if total > MAX_ARRAY_PAYLOAD {
        return Err(Error::InvalidArgument(
            "Array too large (max 2048 bytes)".into(),
        ));
    }

    let data = if total == 0 {
        Vec::new()
    } else {
        memory.read(address, total)?
    };

    Ok(ArrayResult {
        element_type,
        element_size: element_size as u32,
        data,
    })
}

/// Outcome of a batch read: per-entry success bits plus the values.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub success_mask: u32,
    pub values: Vec<u64>,
}

impl BatchOutcome {
    pub fn any_succeeded(&self) -> bool {
        self.success_mask != 0
    }
}

/// Read up to 32 independent `(address, size)` pairs. A failing entry
/// leaves its bit clear and its value zero; the batch itself never fails.
pub fn batch_read(memory: &dyn MemoryAccess, entries: &[(usize, u8)]) -> BatchOutcome {
    let count = entries.len().min(MAX_BATCH_ENTRIES);
    let mut values = vec![0u64; count];
    let mut mask = 0u32;

    for (i, &(address, size)) in entries.iter().take(count).enumerate() {
        if !matches!(size, 1 | 2 | 4 | 8) || address == 0 {
            continue;
        }
        if let Ok(value) = memory.read_value(address, size) {
            values[i] = value;
            mask |= 1 << i;
        }
    }

    BatchOutcome {
        success_mask: mask,
        values,
    }
}

/// One allocation owned by the bridge.
#[derive(Debug, Clone, Copy)]
pub struct AllocationRecord {
    pub size: usize,
    pub protection: u32,
}

/// Registry of bridge-owned allocations, keyed by base address.
///
/// Free rejects addresses the bridge did not allocate, so a controller can
/// never hand the bridge a foreign pointer to release.
#[derive(Default)]
pub struct AllocationRegistry {
    blocks: Mutex<HashMap<usize, AllocationRecord>>,
}

impl AllocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(
        &self,
        memory: &dyn MemoryAccess,
        size: usize,
        protection: u32,
    ) -> Result<usize> {
        if size == 0 || size > MAX_ALLOC_SIZE {
            return Err(Error::InvalidArgument("Invalid allocation size".into()));
        }

        let address = memory.allocate(size, protection)?;
        self.blocks
            .lock()
            .insert(address, AllocationRecord { size, protection });

        debug!(target: "nexus_core::memory", address = format!("{:#x}", address), size, "Allocated block");
        Ok(address)
    }

    pub fn free(&self, memory: &dyn MemoryAccess, address: usize) -> Result<()> {
        if address == 0 {
            return Err(Error::InvalidArgument("Invalid memory address".into()));
        }

        let mut blocks = self.blocks.lock();
        if !blocks.contains_key(&address) {
            return Err(Error::NotFound(format!("Allocation {:#x}", address)));
        }

        memory.release(address)?;
        blocks.remove(&address);
        debug!(target: "nexus_core::memory", address = format!("{:#x}", address), "Freed block");
        Ok(())
    }

    pub fn contains(&self, address: usize) -> bool {
        self.blocks.lock().contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    /// Release every owned block. Used during shutdown teardown.
    pub fn release_all(&self, memory: &dyn MemoryAccess) {
        let mut blocks = self.blocks.lock();
        for (&address, _) in blocks.iter() {
            if let Err(e) = memory.release(address) {
                nexus_common::warn!(target: "nexus_core::memory", address = format!("{:#x}", address), error = %e, "Failed to release block during teardown");
            }
        }
        blocks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMemory;

    const RW: u32 = 0x04;

    #[test]
    fn test_pointer_chain_resolves_value() {
        let memory = FakeMemory::new();
        let base = 0x0040_0000;
        memory.map(base, 64, RW);

        // [base] -> base+8, [base+8] -> base+16, [base+16] holds the value.
        memory.seed_word(base, base + 8);
        memory.seed_word(base + 8, base + 16);
        memory.seed(base + 16, &0x1122_3344u32.to_le_bytes());

        let result = follow_pointer_chain(&memory, base, &[0, 0], 4).unwrap();
        assert_eq!(result.final_address, base + 16);
        assert_eq!(result.value, 0x1122_3344);
    }

    #[test]
    fn test_pointer_chain_error_names_step() {
        let memory = FakeMemory::new();
        let base = 0x0040_0000;
        memory.map(base, 32, RW);
        // Step 0 loads a pointer into unmapped space.
        memory.seed_word(base, 0xDEAD_0000);

        let err = follow_pointer_chain(&memory, base, &[0, 0], 4).unwrap_err();
        assert!(err.to_string().contains("pointer-chain step 1"));
    }

    #[test]
    fn test_pointer_chain_rejects_bad_final_size() {
        let memory = FakeMemory::new();
        let err = follow_pointer_chain(&memory, 0x1000, &[], 3).unwrap_err();
        assert!(err.to_string().contains("final_size"));
    }

    #[test]
    fn test_array_read_roundtrip() {
        let memory = FakeMemory::new();
        let base = 0x0050_0000;
        memory.map(base, 64, RW);
        for i in 0..8u32 {
            memory.seed(base + (i as usize) * 4, &(i * 10).to_le_bytes());
        }

        let result = read_array(&memory, base, protocol::param_type::I32, 8).unwrap();
        assert_eq!(result.element_size, 4);
        assert_eq!(result.data.len(), 32);
        assert_eq!(&result.data[4..8], &10u32.to_le_bytes());
    }

    #[test]
    fn test_array_read_rejects_oversize_and_overflow() {
        let memory = FakeMemory::new();
        let err = read_array(&memory, 0x1000, protocol::param_type::I64, 1024).unwrap_err();
        assert!(err.to_string().contains("2048"));

        let err = read_array(&memory, 0x1000, protocol::param_type::I64, u32::MAX).unwrap_err();
        assert!(err.to_string().contains("overflow"));
    }

    #[test]
    fn test_batch_read_mixed_entries() {
        let memory = FakeMemory::new();
        let base = 0x0060_0000;
        memory.map(base, 16, RW);
        let bytes: Vec<u8> = (0u8..16).collect();
        memory.seed(base, &bytes);

        let outcome = batch_read(
            &memory,
            &[
                (base, 1),
                (base + 2, 2),
                (base + 4, 4),
                (base + 8, 8),
                (0, 4), // null entry fails without aborting the batch
            ],
        );

        assert_eq!(outcome.success_mask, 0b01111);
        assert!(outcome.any_succeeded());
        assert_eq!(outcome.values[0], 0x00);
        assert_eq!(outcome.values[1], 0x0302);
        assert_eq!(outcome.values[2], 0x0706_0504);
        assert_eq!(outcome.values[3], 0x0F0E_0D0C_0B0A_0908);
        assert_eq!(outcome.values[4], 0);
    }

    #[test]
    fn test_batch_read_invalid_size_clears_bit() {
        let memory = FakeMemory::new();
        let base = 0x0060_0000;
        memory.map(base, 16, RW);

        let outcome = batch_read(&memory, &[(base, 3), (base, 4)]);
        assert_eq!(outcome.success_mask, 0b10);
    }

    #[test]
    fn test_allocation_registry_lifecycle() {
        let memory = FakeMemory::new();
        let registry = AllocationRegistry::new();

        let address = registry.allocate(&memory, 64, RW).unwrap();
        assert!(registry.contains(address));
        assert_eq!(registry.len(), 1);

        registry.free(&memory, address).unwrap();
        assert!(registry.is_empty());

        // Double free and foreign pointers are rejected.
        assert!(registry.free(&memory, address).is_err());
        assert!(registry.free(&memory, 0xDEAD_BEEF).is_err());
    }

    #[test]
    fn test_allocation_size_bounds() {
        let memory = FakeMemory::new();
        let registry = AllocationRegistry::new();
        assert!(registry.allocate(&memory, 0, RW).is_err());
        assert!(registry.allocate(&memory, MAX_ALLOC_SIZE + 1, RW).is_err());
    }

    #[test]
    fn test_release_all_empties_registry() {
        let memory = FakeMemory::new();
        let registry = AllocationRegistry::new();
        registry.allocate(&memory, 32, RW).unwrap();
        registry.allocate(&memory, 32, RW).unwrap();
        registry.release_all(&memory);
        assert!(registry.is_empty());
    }
}
