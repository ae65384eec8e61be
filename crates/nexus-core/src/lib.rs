//! Core primitives for the GW-Nexus bridge
//!
//! Everything the dispatcher needs that is not transport: guarded memory
//! access, the resource registries, the call marshaller and the
//! thread-affine pending-call queue. Host-specific code lives behind
//! `cfg(windows)`; the rest works against the seams in [`traits`].

pub mod detour;
pub mod events;
pub mod functions;
pub mod marshal;
pub mod memory;
pub mod pending;
pub mod traits;

#[cfg(windows)]
pub mod host;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use detour::DetourRegistry;
pub use events::EventRings;
pub use functions::{FunctionRecord, FunctionRegistry};
pub use marshal::CallOutcome;
pub use memory::AllocationRegistry;
pub use pending::CallQueue;
pub use traits::{
    DetourBackend, IdentifierProvider, MemoryAccess, MemoryState, PatternScanner, Protection,
    RegionInfo,
};
