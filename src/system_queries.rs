// A failed command or an output we cannot make sense of is inconclusive
// and reported as `None`.

use crate::os_version::OsVersion;
use crate::runner_cli::CommandRunner;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const FILEVAULT_OFF_MARKER: &str = "FileVault is Off";

lazy_static! {
    static ref DEVICE_IDENTIFIER: Regex =
        Regex::new(r"<key>DeviceIdentifier</key>\s*<string>([^<]+)</string>").expect("valid regex");
    static ref APFS_SNAPSHOT: Regex =
        Regex::new(r"<key>APFSSnapshot</key>\s*<(true|false)\s*/>").expect("valid regex");
    static ref APFS_PHYSICAL_STORE: Regex =
        Regex::new(r"<key>APFSPhysicalStore</key>\s*<string>([^<]+)</string>").expect("valid regex");
    // Only listed for booted snapshots
    static ref SNAPSHOT_SEALED: Regex = Regex::new(r"Snapshot Sealed:\s+Yes").expect("valid regex");
}

pub fn filevault_status_text(runner: &dyn CommandRunner) -> Option<String> {
    match runner.run("fdesetup status") {
        Ok(status) => Some(status),
        Err(e) => {
            warn!("FileVault status unavailable: {}", e);
            None
        }
    }
}

/// Whether a kext whose bundle id contains `kext_name` is loaded.
pub fn kext_loaded(runner: &dyn CommandRunner, kext_name: &str, os: OsVersion) -> Option<bool> {
    // kextstat is deprecated from Big Sur on
    let cmd = if os.has_sealed_system_volume() {
        "kmutil showloaded --list-only --variant-suffix release"
    } else {
        "kextstat -l"
    };
    match runner.run(cmd) {
        Ok(listing) => Some(listing.contains(kext_name)),
        Err(e) => {
            warn!("Unable to list loaded kexts: {}", e);
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootVolumeInfo {
    pub device_identifier: String,
    pub is_snapshot: bool,
}

impl RootVolumeInfo {
    /// Volume backing the root snapshot, e.g. `disk1s5` for `disk1s5s1`.
    pub fn root_disk(&self) -> &str {
        root_disk(&self.device_identifier)
    }
}

pub fn root_disk(device_identifier: &str) -> &str {
    // "disk" already accounts for one 's'
    if device_identifier.matches('s').count() > 1 {
        if let Some(pos) = device_identifier.rfind('s') {
            return &device_identifier[..pos];
        }
    }
    device_identifier
}

pub fn parse_root_volume_info(plist: &str) -> Option<RootVolumeInfo> {
    let device_identifier = DEVICE_IDENTIFIER.captures(plist)?.get(1)?.as_str().trim().to_string();
    let is_snapshot = APFS_SNAPSHOT
        .captures(plist)
        .and_then(|caps| caps.get(1))
        .map_or(false, |m| m.as_str() == "true");
    Some(RootVolumeInfo {
        device_identifier,
        is_snapshot,
    })
}

pub fn root_volume_info(runner: &dyn CommandRunner) -> Option<RootVolumeInfo> {
    let plist = match runner.run("diskutil info -plist /") {
        Ok(plist) => plist,
        Err(e) => {
            warn!("Unable to query the root volume: {}", e);
            return None;
        }
    };
    let info = parse_root_volume_info(&plist);
    if info.is_none() {
        warn!("Unexpected diskutil output for the root volume");
    }
    info
}

pub fn root_volume_sealed(runner: &dyn CommandRunner) -> Option<bool> {
    match runner.run("diskutil apfs list") {
        Ok(listing) => Some(SNAPSHOT_SEALED.is_match(&listing)),
        Err(e) => {
            warn!("Unable to list APFS containers: {}", e);
            None
        }
    }
}

/// Physical stores of an APFS volume. Fusion drives report several.
pub fn apfs_physical_stores(runner: &dyn CommandRunner, device: &str) -> Vec<String> {
    let plist = match runner.run(&format!("diskutil info -plist {}", device)) {
        Ok(plist) => plist,
        Err(e) => {
            debug!("No physical store for {}: {}", device, e);
            return Vec::new();
        }
    };
    APFS_PHYSICAL_STORE
        .captures_iter(&plist)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .collect()
}
