//! Wire contract between head and satellites.

use sha2::{Digest, Sha256};

/// Shared secret of a satellite, or the admin secret on admin routes.
pub const AUTH_HEADER: &str = "x-authorization";
/// Agent version of the sender.
pub const VERSION_HEADER: &str = "x-nprobe-version";
/// Configuration version, sent by the head on satellite-scoped responses and
/// echoed back by satellites on every submission.
pub const CONFIG_VERSION_HEADER: &str = "x-nprobe-config-version";
/// SHA-256 (lowercase hex) of a submitted report body.
pub const PAYLOAD_HASH_HEADER: &str = "x-nprobe-payload-hash";

/// Version of this build.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// SHA-256 of a request body as lowercase hex.
pub fn payload_hash(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}
