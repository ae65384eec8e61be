//! Registered-function registry
//!
//! Controllers register native call sites by name before calling them.
//! Registration probes that the target lies in executable committed memory;
//! everything else about the signature is trusted as declared.

use crate::traits::MemoryAccess;
use nexus_common::protocol::{CallConvention, MAX_CALL_PARAMS, MAX_NAME_LEN};
use nexus_common::{debug, Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct FunctionRecord {
    pub name: String,
    pub address: usize,
    pub param_count: u8,
    pub convention: CallConvention,
    pub has_return: bool,
}

#[derive(Default)]
pub struct FunctionRegistry {
    functions: Mutex<HashMap<String, FunctionRecord>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or overwrite a function by name.
    pub fn register(&self, memory: &dyn MemoryAccess, record: FunctionRecord) -> Result<()> {
        if record.name.is_empty() || record.name.len() > MAX_NAME_LEN {
            return Err(Error::InvalidArgument("Invalid function name".into()));
        }
        if record.address == 0 {
            return Err(Error::InvalidArgument("Invalid function address".into()));
        }
        if record.param_count as usize > MAX_CALL_PARAMS {
            return Err(Error::InvalidArgument(
                "Too many parameters (max 10)".into(),
            ));
        }

        memory.probe_executable(record.address)?;

        debug!(
            target: "nexus_core::functions",
            name = %record.name,
            address = format!("{:#x}", record.address),
            params = record.param_count,
            convention = %record.convention,
            "Registered function"
        );

        self.functions.lock().insert(record.name.clone(), record);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        match self.functions.lock().remove(name) {
            Some(_) => {
                debug!(target: "nexus_core::functions", name = %name, "Unregistered function");
                Ok(())
            }
            None => Err(Error::NotFound("Function".into())),
        }
    }

    pub fn get(&self, name: &str) -> Option<FunctionRecord> {
        self.functions.lock().get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.functions.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.functions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.lock().is_empty()
    }

    pub fn clear(&self) {
        self.functions.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMemory;

    const RX: u32 = 0x20;
    const RW: u32 = 0x04;

    fn record(name: &str, address: usize) -> FunctionRecord {
        FunctionRecord {
            name: name.to_string(),
            address,
            param_count: 2,
            convention: CallConvention::Cdecl,
            has_return: true,
        }
    }

    #[test]
    fn test_register_list_unregister_roundtrip() {
        let memory = FakeMemory::new();
        memory.map(0x0040_1000, 0x100, RX);
        let registry = FunctionRegistry::new();

        registry.register(&memory, record("add", 0x0040_1000)).unwrap();
        assert_eq!(registry.list(), vec!["add".to_string()]);

        registry.unregister("add").unwrap();
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_register_rejects_non_executable_target() {
        let memory = FakeMemory::new();
        memory.map(0x0040_1000, 0x100, RW);
        let registry = FunctionRegistry::new();

        let err = registry
            .register(&memory, record("data", 0x0040_1000))
            .unwrap_err();
        assert!(err.to_string().contains("not executable"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_rejects_unmapped_target() {
        let memory = FakeMemory::new();
        let registry = FunctionRegistry::new();
        assert!(registry.register(&memory, record("absent", 0x1234)).is_err());
    }

    #[test]
    fn test_duplicate_name_overwrites() {
        let memory = FakeMemory::new();
        memory.map(0x0040_1000, 0x100, RX);
        memory.map(0x0040_2000, 0x100, RX);
        let registry = FunctionRegistry::new();

        registry.register(&memory, record("f", 0x0040_1000)).unwrap();
        registry.register(&memory, record("f", 0x0040_2000)).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("f").unwrap().address, 0x0040_2000);
    }

    #[test]
    fn test_unregister_missing_is_not_found() {
        let registry = FunctionRegistry::new();
        let err = registry.unregister("nope").unwrap_err();
        assert_eq!(err.to_string(), "Function not found");
    }

    #[test]
    fn test_concurrent_register_unregister_distinct_names() {
        use std::sync::Arc;

        let memory = Arc::new(FakeMemory::new());
        memory.map(0x0040_1000, 0x1000, RX);
        let registry = Arc::new(FunctionRegistry::new());

        let mut handles = Vec::new();
        for i in 0..8usize {
            let registry = Arc::clone(&registry);
            let memory = Arc::clone(&memory);
            handles.push(std::thread::spawn(move || {
                let name = format!("func_{}", i);
                registry
                    .register(&*memory, record(&name, 0x0040_1000 + i))
                    .unwrap();
                if i % 2 == 0 {
                    registry.unregister(&name).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut names = registry.list();
        names.sort();
        assert_eq!(names, vec!["func_1", "func_3", "func_5", "func_7"]);
    }
}
