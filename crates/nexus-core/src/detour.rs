//! Detour registry and the default inline-patch engine
//!
//! The registry tracks installed detours by logical name and drives the
//! `DetourBackend` collaborator. Install is transactional: a detour that was
//! created but cannot be enabled is detached again before the error is
//! returned, so the registry never holds a half-installed entry.

use crate::traits::{DetourBackend, MemoryAccess};
use nexus_common::protocol::MAX_NAME_LEN;
use nexus_common::{Error, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct DetourRecord {
    pub target: usize,
    pub enabled: bool,
}

pub struct DetourRegistry {
    backend: Arc<dyn DetourBackend>,
    detours: Mutex<HashMap<String, DetourRecord>>,
}

impl DetourRegistry {
    pub fn new(backend: Arc<dyn DetourBackend>) -> Self {
        Self {
            backend,
            detours: Mutex::new(HashMap::new()),
        }
    }

    /// Install and enable a detour from `target` to `replacement`.
    pub fn install(
        &self,
        memory: &dyn MemoryAccess,
        name: &str,
        target: usize,
        replacement: usize,
    ) -> Result<()> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(Error::InvalidArgument("Invalid detour name".into()));
        }
        if target == 0 || replacement == 0 {
            return Err(Error::InvalidArgument("Invalid detour addresses".into()));
        }

        let mut detours = self.detours.lock();
        if detours.contains_key(name) {
            return Err(Error::Duplicate(format!("Detour '{}'", name)));
        }

        memory.probe_executable(target)?;

        self.backend.create(target, replacement)?;
        if let Err(e) = self.backend.enable(target) {
            // Roll the creation back so a failed install leaves nothing behind.
            if let Err(detach_err) = self.backend.remove(target) {
                warn!(target: "nexus_core::detour", name = %name, error = %detach_err, "Failed to detach after enable failure");
            }
            return Err(e);
        }

        detours.insert(
            name.to_string(),
            DetourRecord {
                target,
                enabled: true,
            },
        );

        debug!(
            target: "nexus_core::detour",
            name = %name,
            from = format!("{:#x}", target),
            to = format!("{:#x}", replacement),
            "Installed detour"
        );
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let mut detours = self.detours.lock();
        let record = detours
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("Detour '{}'", name)))?;

        if let Err(e) = self.backend.disable(record.target) {
            warn!(target: "nexus_core::detour", name = %name, error = %e, "Disable during removal failed");
        }
        if let Err(e) = self.backend.remove(record.target) {
            warn!(target: "nexus_core::detour", name = %name, error = %e, "Detach during removal failed");
        }

        debug!(target: "nexus_core::detour", name = %name, "Removed detour");
        Ok(())
    }

    pub fn enable(&self, name: &str) -> Result<()> {
        let mut detours = self.detours.lock();
        let record = detours
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("Detour '{}'", name)))?;
        self.backend.enable(record.target)?;
        record.enabled = true;
        Ok(())
    }

    pub fn disable(&self, name: &str) -> Result<()> {
        let mut detours = self.detours.lock();
        let record = detours
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("Detour '{}'", name)))?;
        self.backend.disable(record.target)?;
        record.enabled = false;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<DetourRecord> {
        self.detours.lock().get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.detours.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.detours.lock().is_empty()
    }

    /// Detach everything. Used during shutdown teardown.
    pub fn remove_all(&self) {
        let mut detours = self.detours.lock();
        for (name, record) in detours.drain() {
            if let Err(e) = self.backend.disable(record.target) {
                warn!(target: "nexus_core::detour", name = %name, error = %e, "Disable during teardown failed");
            }
            if let Err(e) = self.backend.remove(record.target) {
                warn!(target: "nexus_core::detour", name = %name, error = %e, "Detach during teardown failed");
            }
        }
    }
}

/// Inline 5-byte relative-jump patch engine for x86.
///
/// `create` captures the original prologue bytes, `enable` writes
/// `jmp rel32` to the replacement, `disable` restores the prologue. On a
/// 32-bit address space a rel32 always reaches.
#[cfg(all(windows, target_arch = "x86"))]
pub mod inline {
    use super::*;

    pub const JMP_REL32_LEN: usize = 5;

    /// Encode `jmp rel32` from `from` to `to`.
    pub fn encode_jmp(from: usize, to: usize) -> [u8; JMP_REL32_LEN] {
        let displacement = (to as u32)
            .wrapping_sub(from as u32)
            .wrapping_sub(JMP_REL32_LEN as u32);
        let mut bytes = [0u8; JMP_REL32_LEN];
        bytes[0] = 0xE9;
        bytes[1..5].copy_from_slice(&displacement.to_le_bytes());
        bytes
    }

    struct Patch {
        original: [u8; JMP_REL32_LEN],
        jmp: [u8; JMP_REL32_LEN],
        enabled: bool,
    }

    pub struct InlinePatchBackend {
        memory: Arc<dyn MemoryAccess>,
        patches: Mutex<HashMap<usize, Patch>>,
    }

    impl InlinePatchBackend {
        pub fn new(memory: Arc<dyn MemoryAccess>) -> Self {
            Self {
                memory,
                patches: Mutex::new(HashMap::new()),
            }
        }

        fn flush_icache(address: usize, len: usize) {
            use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
            use windows::Win32::System::Threading::GetCurrentProcess;
            unsafe {
                let _ = FlushInstructionCache(
                    GetCurrentProcess(),
                    Some(address as *const core::ffi::c_void),
                    len,
                );
            }
        }
    }

    impl DetourBackend for InlinePatchBackend {
        fn create(&self, target: usize, replacement: usize) -> Result<()> {
            let mut patches = self.patches.lock();
            if patches.contains_key(&target) {
                return Err(Error::Duplicate(format!("Patch at {:#x}", target)));
            }

            let bytes = self.memory.read(target, JMP_REL32_LEN)?;
            let mut original = [0u8; JMP_REL32_LEN];
            original.copy_from_slice(&bytes);

            patches.insert(
                target,
                Patch {
                    original,
                    jmp: encode_jmp(target, replacement),
                    enabled: false,
                },
            );
            Ok(())
        }

        fn remove(&self, target: usize) -> Result<()> {
            let mut patches = self.patches.lock();
            let patch = patches
                .remove(&target)
                .ok_or_else(|| Error::NotFound(format!("Patch at {:#x}", target)))?;
            if patch.enabled {
                self.memory.write(target, &patch.original)?;
                Self::flush_icache(target, JMP_REL32_LEN);
            }
            Ok(())
        }

        fn enable(&self, target: usize) -> Result<()> {
            let mut patches = self.patches.lock();
            let patch = patches
                .get_mut(&target)
                .ok_or_else(|| Error::NotFound(format!("Patch at {:#x}", target)))?;
            if !patch.enabled {
                self.memory.write(target, &patch.jmp)?;
                Self::flush_icache(target, JMP_REL32_LEN);
                patch.enabled = true;
            }
            Ok(())
        }

        fn disable(&self, target: usize) -> Result<()> {
            let mut patches = self.patches.lock();
            let patch = patches
                .get_mut(&target)
                .ok_or_else(|| Error::NotFound(format!("Patch at {:#x}", target)))?;
            if patch.enabled {
                self.memory.write(target, &patch.original)?;
                Self::flush_icache(target, JMP_REL32_LEN);
                patch.enabled = false;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeMemory, RecordingDetours};

    const RX: u32 = 0x20;

    fn setup() -> (FakeMemory, Arc<RecordingDetours>, DetourRegistry) {
        let memory = FakeMemory::new();
        memory.map(0x0040_1000, 0x1000, RX);
        let backend = Arc::new(RecordingDetours::new());
        let registry = DetourRegistry::new(backend.clone());
        (memory, backend, registry)
    }

    #[test]
    fn test_install_enable_disable_remove() {
        let (memory, backend, registry) = setup();

        registry
            .install(&memory, "frame", 0x0040_1000, 0x0040_1800)
            .unwrap();
        assert!(registry.get("frame").unwrap().enabled);
        assert!(backend.is_enabled(0x0040_1000));

        registry.disable("frame").unwrap();
        assert!(!registry.get("frame").unwrap().enabled);
        assert!(!backend.is_enabled(0x0040_1000));

        registry.enable("frame").unwrap();
        registry.remove("frame").unwrap();
        assert!(registry.is_empty());
        assert!(!backend.is_created(0x0040_1000));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (memory, _backend, registry) = setup();
        registry
            .install(&memory, "frame", 0x0040_1000, 0x0040_1800)
            .unwrap();
        let err = registry
            .install(&memory, "frame", 0x0040_1004, 0x0040_1800)
            .unwrap_err();
        assert_eq!(err.to_string(), "Detour 'frame' already exists");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_non_executable_target_rejected() {
        let (memory, backend, registry) = setup();
        memory.map(0x0050_0000, 0x100, 0x04); // read-write data page
        let err = registry
            .install(&memory, "bad", 0x0050_0000, 0x0040_1800)
            .unwrap_err();
        assert!(err.to_string().contains("not executable"));
        assert!(!backend.is_created(0x0050_0000));
    }

    #[test]
    fn test_enable_failure_rolls_back_creation() {
        let (memory, backend, registry) = setup();
        backend.fail_next_enable();

        assert!(registry
            .install(&memory, "frame", 0x0040_1000, 0x0040_1800)
            .is_err());
        // The created patch was detached again and nothing was recorded.
        assert!(!backend.is_created(0x0040_1000));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_operations_on_missing_name() {
        let (_memory, _backend, registry) = setup();
        assert!(registry.remove("absent").is_err());
        assert!(registry.enable("absent").is_err());
        assert!(registry.disable("absent").is_err());
    }

    #[test]
    fn test_remove_all_detaches_everything() {
        let (memory, backend, registry) = setup();
        registry
            .install(&memory, "a", 0x0040_1000, 0x0040_1800)
            .unwrap();
        registry
            .install(&memory, "b", 0x0040_1010, 0x0040_1900)
            .unwrap();

        registry.remove_all();
        assert!(registry.is_empty());
        assert!(!backend.is_created(0x0040_1000));
        assert!(!backend.is_created(0x0040_1010));
    }
}
