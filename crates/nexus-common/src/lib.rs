//! Shared foundation for GW-Nexus
//!
//! Wire protocol codec, error taxonomy, logging and configuration used by
//! both the injected agent and controller-side tooling.

pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod ticks;

pub use config::AgentConfig;
pub use error::{Error, Result};
pub use logging::{init_agent_logging, init_logging, LogConfig};

// Re-export tracing macros so dependents keep a single logging surface.
pub use tracing::{debug, error, info, trace, warn};

/// Version of the bridge, packed `major << 16 | minor << 8 | patch` the way
/// the loader-status operation reports it.
pub const BRIDGE_VERSION_MAJOR: u32 = 1;
pub const BRIDGE_VERSION_MINOR: u32 = 0;
pub const BRIDGE_VERSION_PATCH: u32 = 0;
pub const BRIDGE_VERSION: u32 =
    (BRIDGE_VERSION_MAJOR << 16) | (BRIDGE_VERSION_MINOR << 8) | BRIDGE_VERSION_PATCH;

/// Build-info string reported by loader status, e.g. `v1.0.0 Release`.
pub fn build_info() -> String {
    let build_type = if cfg!(debug_assertions) {
        "Debug"
    } else {
        "Release"
    };
    format!(
        "v{}.{}.{} {}",
        BRIDGE_VERSION_MAJOR, BRIDGE_VERSION_MINOR, BRIDGE_VERSION_PATCH, build_type
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_packing() {
        assert_eq!(BRIDGE_VERSION >> 16, BRIDGE_VERSION_MAJOR);
        assert_eq!((BRIDGE_VERSION >> 8) & 0xFF, BRIDGE_VERSION_MINOR);
        assert_eq!(BRIDGE_VERSION & 0xFF, BRIDGE_VERSION_PATCH);
    }

    #[test]
    fn test_build_info_format() {
        let info = build_info();
        assert!(info.starts_with("v1.0.0"));
    }
}
