//! Tag/manifest version consistency gate.
//!
//! The comparison is string-level on the canonical form: `v1.2.3-dev1` is
//! accepted only when the manifest literally declares `1.2.3-dev1`.

use tracing::{info, warn};

use crate::error::{ReleaseError, Result};
use crate::version::Version;

/// Check that the parsed tag version matches the manifest version exactly.
pub fn validate(parsed: &Version, manifest_version: &str) -> Result<()> {
    let tag_version = parsed.to_string();
    if tag_version == manifest_version {
        info!(event = "version.consistent", version = %tag_version);
        Ok(())
    } else {
        warn!(
            event = "version.mismatch",
            tag_version = %tag_version,
            manifest_version = %manifest_version,
        );
        Err(ReleaseError::VersionMismatch {
            tag_version,
            manifest_version: manifest_version.to_string(),
        })
    }
}
