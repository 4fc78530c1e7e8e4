pub mod config;
pub mod csr;
pub mod firmware;
#[cfg(target_os = "macos")]
pub mod firmware_macos;
pub mod logger;
pub mod os_version;
pub mod posture;
pub mod posture_policy;
pub mod recovery;
pub mod runner_cli;
pub mod system_queries;
pub mod version;

pub use os_version::OsVersion;
pub use posture::{PostureDetector, PostureRecord, SecurityCheckResult};

/// Posture of the running host, probed with the platform collaborators and
/// the configuration named by `PATCH_POSTURE_CONFIG`.
pub fn evaluate_host_posture() -> PostureRecord {
    PostureDetector::platform().evaluate_host()
}
