//! Endpoint naming
//!
//! Each host process gets its own pipe, named after the host-derived
//! display name when the identifier provider has one, else the process id.
//! Controllers enumerate pipes by the `GwNexus_` prefix.

use nexus_core::IdentifierProvider;

pub const PIPE_PREFIX: &str = "\\\\.\\pipe\\GwNexus_";

/// Derive the endpoint name for this process.
///
/// Spaces in the display name become underscores; non-ASCII survives as
/// UTF-8 since pipe names are just counted strings to the OS.
pub fn derive_pipe_name(identity: &dyn IdentifierProvider) -> String {
    match identity.display_name().filter(|name| !name.is_empty()) {
        Some(name) => {
            let sanitized: String = name
                .chars()
                .map(|c| if c == ' ' { '_' } else { c })
                .collect();
            format!("{}{}", PIPE_PREFIX, sanitized)
        }
        None => format!("{}{}", PIPE_PREFIX, std::process::id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_core::testing::StubIdentity;

    #[test]
    fn test_display_name_spaces_become_underscores() {
        let name = derive_pipe_name(&StubIdentity(Some("Gwen Ashford".to_string())));
        assert_eq!(name, "\\\\.\\pipe\\GwNexus_Gwen_Ashford");
    }

    #[test]
    fn test_non_ascii_name_kept_as_utf8() {
        let name = derive_pipe_name(&StubIdentity(Some("Éowyn".to_string())));
        assert_eq!(name, "\\\\.\\pipe\\GwNexus_Éowyn");
    }

    #[test]
    fn test_missing_identity_falls_back_to_pid() {
        let name = derive_pipe_name(&StubIdentity(None));
        assert_eq!(name, format!("{}{}", PIPE_PREFIX, std::process::id()));
    }

    #[test]
    fn test_empty_identity_falls_back_to_pid() {
        let name = derive_pipe_name(&StubIdentity(Some(String::new())));
        assert!(name.ends_with(&std::process::id().to_string()));
    }
}
