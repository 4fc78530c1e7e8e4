use lazy_static::lazy_static;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Only present when running from the recovery image.
pub const BASE_SYSTEM_PATH: &str = "/System/Library/BaseSystem";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryMarker {
    /// Recovery when the path exists.
    PresentInRecovery(PathBuf),
    /// Recovery when a path shipped only with full installations is missing.
    AbsentInRecovery(PathBuf),
}

impl RecoveryMarker {
    fn indicates_recovery(&self) -> bool {
        match self {
            RecoveryMarker::PresentInRecovery(path) => path.exists(),
            RecoveryMarker::AbsentInRecovery(path) => !path.exists(),
        }
    }

    fn path(&self) -> &Path {
        match self {
            RecoveryMarker::PresentInRecovery(path) | RecoveryMarker::AbsentInRecovery(path) => path,
        }
    }
}

impl Default for RecoveryMarker {
    fn default() -> Self {
        RecoveryMarker::PresentInRecovery(PathBuf::from(BASE_SYSTEM_PATH))
    }
}

/// The environment we booted into cannot change while we run, so the first
/// answer is kept for the lifetime of the probe.
#[derive(Debug)]
pub struct RecoveryProbe {
    marker: RecoveryMarker,
    status: OnceCell<bool>,
}

impl RecoveryProbe {
    pub fn new(marker: RecoveryMarker) -> Self {
        Self {
            marker,
            status: OnceCell::new(),
        }
    }

    pub fn marker(&self) -> &RecoveryMarker {
        &self.marker
    }

    pub fn is_recovery_environment(&self) -> bool {
        *self.status.get_or_init(|| {
            let status = self.marker.indicates_recovery();
            info!(
                "Recovery environment: {} (marker {})",
                status,
                self.marker.path().display()
            );
            status
        })
    }
}

impl Default for RecoveryProbe {
    fn default() -> Self {
        RecoveryProbe::new(RecoveryMarker::default())
    }
}

lazy_static! {
    pub static ref RECOVERY_PROBE: Arc<RecoveryProbe> = Arc::new(RecoveryProbe::default());
}

pub fn is_recovery_environment() -> bool {
    RECOVERY_PROBE.is_recovery_environment()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use std::thread;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("patch_posture_{}_{}", name, std::process::id()))
    }

    #[test]
    fn test_present_marker() {
        let path = scratch_path("present_marker");
        fs::write(&path, b"").unwrap();
        let probe = RecoveryProbe::new(RecoveryMarker::PresentInRecovery(path.clone()));
        assert!(probe.is_recovery_environment());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_absent_marker() {
        let path = scratch_path("absent_marker");
        let _ = fs::remove_file(&path);
        let probe = RecoveryProbe::new(RecoveryMarker::AbsentInRecovery(path));
        assert!(probe.is_recovery_environment());
    }

    #[test]
    fn test_memoized_after_marker_removal() {
        let path = scratch_path("memoized_marker");
        fs::write(&path, b"").unwrap();
        let probe = RecoveryProbe::new(RecoveryMarker::PresentInRecovery(path.clone()));
        assert!(probe.is_recovery_environment());

        fs::remove_file(&path).unwrap();
        assert!(!path.exists());
        assert!(probe.is_recovery_environment());
    }

    #[test]
    fn test_memoized_after_marker_creation() {
        let path = scratch_path("late_marker");
        let _ = fs::remove_file(&path);
        let probe = RecoveryProbe::new(RecoveryMarker::PresentInRecovery(path.clone()));
        assert!(!probe.is_recovery_environment());

        fs::write(&path, b"").unwrap();
        assert!(!probe.is_recovery_environment());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_racing_first_calls_agree() {
        let probe = Arc::new(RecoveryProbe::new(RecoveryMarker::AbsentInRecovery(
            PathBuf::from(env!("CARGO_MANIFEST_DIR")),
        )));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let probe = probe.clone();
                thread::spawn(move || probe.is_recovery_environment())
            })
            .collect();
        for handle in handles {
            assert!(!handle.join().unwrap());
        }
    }

    #[test]
    #[serial]
    fn test_process_wide_probe_is_stable() {
        let first = is_recovery_environment();
        for _ in 0..3 {
            assert_eq!(is_recovery_environment(), first);
        }
    }
}
