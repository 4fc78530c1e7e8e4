use crate::runner_cli::CommandRunner;
use crate::version::Version;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};
use tracing::{debug, warn};

/// Supported releases, ordered by Darwin kernel major version.
/// Variants are declared in ascending order so the derived ordering matches
/// the release ladder.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumIter,
)]
#[repr(u32)]
pub enum OsVersion {
    Jaguar = 6,
    Panther = 7,
    Tiger = 8,
    Leopard = 9,
    SnowLeopard = 10,
    Lion = 11,
    MountainLion = 12,
    Mavericks = 13,
    Yosemite = 14,
    ElCapitan = 15,
    Sierra = 16,
    HighSierra = 17,
    Mojave = 18,
    Catalina = 19,
    BigSur = 20,
    Monterey = 21,
    Ventura = 22,
    Sonoma = 23,
    Sequoia = 24,
    Tahoe = 25,
}

impl OsVersion {
    pub const OLDEST: OsVersion = OsVersion::Jaguar;
    pub const NEWEST: OsVersion = OsVersion::Tahoe;

    pub fn darwin_major(self) -> u32 {
        self as u32
    }

    /// Unknown kernels are clamped to the nearest end of the ladder. A kernel
    /// newer than anything we know gets the newest (strictest) release.
    pub fn from_darwin_major(major: u32) -> OsVersion {
        use OsVersion::*;
        match major {
            0..=6 => Jaguar,
            7 => Panther,
            8 => Tiger,
            9 => Leopard,
            10 => SnowLeopard,
            11 => Lion,
            12 => MountainLion,
            13 => Mavericks,
            14 => Yosemite,
            15 => ElCapitan,
            16 => Sierra,
            17 => HighSierra,
            18 => Mojave,
            19 => Catalina,
            20 => BigSur,
            21 => Monterey,
            22 => Ventura,
            23 => Sonoma,
            24 => Sequoia,
            _ => {
                if major > Self::NEWEST.darwin_major() {
                    warn!(
                        "Darwin {} is newer than {}, assuming the newest known release",
                        major,
                        Self::NEWEST
                    );
                }
                Tahoe
            }
        }
    }

    /// Parses a kernel release as printed by `uname -r`.
    pub fn from_kernel_release(release: &str) -> Option<OsVersion> {
        match Version::parse(release) {
            Ok(version) => u32::try_from(version.major)
                .ok()
                .map(OsVersion::from_darwin_major),
            Err(e) => {
                debug!("Unparseable kernel release {:?}: {}", release, e);
                None
            }
        }
    }

    pub fn marketing_version(self) -> String {
        let major = self.darwin_major();
        if major >= 25 {
            // Tahoe jumped straight to 26
            "26".to_string()
        } else if major >= 20 {
            (major - 9).to_string()
        } else {
            format!("10.{}", major - 4)
        }
    }

    /// `csr_get_active_config` and SIP first shipped with El Capitan.
    pub fn has_integrity_protection(self) -> bool {
        self > OsVersion::Yosemite
    }

    /// Big Sur introduced the signed system volume. Code integrity and
    /// FileVault start to matter for root patching from there on.
    pub fn has_sealed_system_volume(self) -> bool {
        self > OsVersion::Catalina
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostOs {
    pub version: OsVersion,
    pub kernel: Version,
    pub build: String,
}

impl HostOs {
    pub fn detect(runner: &dyn CommandRunner) -> Result<HostOs> {
        let release = runner
            .run("uname -r")
            .context("Failed to query the kernel release")?;
        let kernel = Version::parse(&release)
            .with_context(|| format!("Unexpected kernel release {:?}", release.trim()))?;
        let major = u32::try_from(kernel.major)
            .map_err(|_| anyhow!("Kernel major {} out of range", kernel.major))?;
        let version = OsVersion::from_darwin_major(major);

        // The build number is informational only
        let build = match runner.run("sw_vers -buildVersion") {
            Ok(build) => build.trim().to_string(),
            Err(e) => {
                warn!("Failed to query the OS build: {}", e);
                String::new()
            }
        };

        debug!(
            "Detected {} ({}) kernel {} build {:?}",
            version,
            version.marketing_version(),
            kernel,
            build
        );
        Ok(HostOs {
            version,
            kernel,
            build,
        })
    }
}
