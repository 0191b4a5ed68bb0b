// Protocol version negotiation and N-1 support.
//
// Clients offer a protocol version string (e.g. "tandem-realtime.v1") in
// their hello frame. The hub rejects unsupported versions with an
// UNSUPPORTED_PROTOCOL error before any other message is processed. When
// a new version ships, the previous one stays accepted for at least one
// release cycle.

use crate::error::{ErrorCode, HubError};
use tandem_common::protocol::ws::{CURRENT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};

/// Returns true if the given protocol version string is supported.
pub fn is_supported(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

/// Returns the list of supported protocol versions (newest first).
pub fn supported_versions() -> &'static [&'static str] {
    SUPPORTED_PROTOCOL_VERSIONS
}

/// Validates a client-supplied protocol version. Returns `Ok(())` if
/// supported, or a `HubError` with code `UNSUPPORTED_PROTOCOL` naming the
/// accepted versions if not.
pub fn require_supported(version: &str) -> Result<(), HubError> {
    if is_supported(version) {
        Ok(())
    } else {
        Err(HubError::new(
            ErrorCode::UnsupportedProtocol,
            format!(
                "unsupported protocol version: {version} (supported: {})",
                SUPPORTED_PROTOCOL_VERSIONS.join(", ")
            ),
        ))
    }
}
