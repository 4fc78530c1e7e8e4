use crate::recovery::RecoveryMarker;
use serde::{Deserialize, Serialize};
use std::env::var;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

pub const CONFIG_ENV_VAR: &str = "PATCH_POSTURE_CONFIG";

// HardwareModel values for which Apple Secure Boot is active.
// T2 Macs report their board, everything else reports x86legacy once
// SecureBootModel is enabled.
const SECURE_BOOT_MODELS: [&str; 17] = [
    "j137ap",    // iMacPro1,1
    "j680ap",    // MacBookPro15,1
    "j132ap",    // MacBookPro15,2
    "j174ap",    // Macmini8,1
    "j140kap",   // MacBookAir8,1
    "j780ap",    // MacBookPro15,3
    "j213ap",    // MacBookPro15,4
    "j140aap",   // MacBookAir8,2
    "j152fap",   // MacBookPro16,1
    "j160ap",    // MacPro7,1
    "j230kap",   // MacBookAir9,1
    "j214kap",   // MacBookPro16,2
    "j223ap",    // MacBookPro16,3
    "j215ap",    // MacBookPro16,4
    "j185ap",    // iMac20,1
    "j185fap",   // iMac20,2
    "x86legacy", // non-T2 Macs and VMs
];

// Stock Ironlake and Sandy Bridge drivers
const LEGACY_GRAPHICS_KEXTS: [&str; 2] = [
    "/System/Library/Extensions/AppleIntelHDGraphics.kext",
    "/System/Library/Extensions/AppleIntelHD3000Graphics.kext",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub secure_boot_models: Vec<String>,
    pub legacy_graphics_kexts: Vec<PathBuf>,
    pub recovery_marker: RecoveryMarker,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            secure_boot_models: SECURE_BOOT_MODELS.iter().map(|m| m.to_string()).collect(),
            legacy_graphics_kexts: LEGACY_GRAPHICS_KEXTS.iter().map(PathBuf::from).collect(),
            recovery_marker: RecoveryMarker::default(),
        }
    }
}

impl DetectorConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Loads the file named by `PATCH_POSTURE_CONFIG`, or the built-in
    /// defaults. A broken override falls back to the defaults.
    pub fn from_env() -> Self {
        match var(CONFIG_ENV_VAR) {
            Ok(path) if !path.is_empty() => match Self::from_file(Path::new(&path)) {
                Ok(config) => {
                    info!("Loaded detector configuration from {}", path);
                    config
                }
                Err(e) => {
                    warn!("Ignoring detector configuration {}: {}", path, e);
                    Self::default()
                }
            },
            _ => Self::default(),
        }
    }

    pub fn is_secure_boot_model(&self, model: &str) -> bool {
        self.secure_boot_models.iter().any(|m| m == model)
    }
}
