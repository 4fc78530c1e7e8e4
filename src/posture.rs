// Each check is independent and degrades to its most protective answer
// when the underlying information is missing. Evaluation never fails.

use crate::config::DetectorConfig;
use crate::csr::{decode_active, read_active_mask, CsrFlag, FlagSet, IntegrityMaskSource};
use crate::firmware::{
    read_rom, read_variable, read_variable_text, FirmwareStore, FirmwareValue,
    APPLE_SECURE_BOOT_NAMESPACE, VENDOR_SETTINGS_NAMESPACE,
};
use crate::os_version::{HostOs, OsVersion};
use crate::posture_policy::policy_for;
use crate::recovery::{RecoveryProbe, RECOVERY_PROBE};
use crate::runner_cli::{CommandRunner, ShellRunner};
use crate::system_queries::{
    filevault_status_text, kext_loaded, root_volume_info, root_volume_sealed, RootVolumeInfo,
    FILEVAULT_OFF_MARKER,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use strum_macros::Display;
use tracing::{debug, info, warn};

pub const VENDOR_SETTINGS_VARIABLE: &str = "OCLP-Settings";
pub const VENDOR_VERSION_VARIABLE: &str = "OCLP-Version";
pub const HARDWARE_MODEL_VARIABLE: &str = "HardwareModel";
pub const BOOT_ARGS_VARIABLE: &str = "boot-args";
pub const ROM_VERSION_PROPERTY: &str = "version";

const ALLOW_AMFI_SETTING: &str = "-allow_amfi";
const ALLOW_FILEVAULT_SETTING: &str = "-allow_fv";
const AMFI_BOOT_ARGS: [&str; 2] = ["amfi_get_out_of_my_way=0x1", "amfi_get_out_of_my_way=1"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum SecurityCheckResult {
    Enabled,
    Disabled,
    NotApplicable,
}

impl SecurityCheckResult {
    pub fn is_enabled(self) -> bool {
        self == SecurityCheckResult::Enabled
    }

    fn from_enabled(enabled: bool) -> Self {
        if enabled {
            SecurityCheckResult::Enabled
        } else {
            SecurityCheckResult::Disabled
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityProtectionStatus {
    pub result: SecurityCheckResult,
    pub raw_mask: u32,
    pub flags: FlagSet,
}

/// Disabled only when every flag the release needs for root patching is set.
pub fn check_integrity_protection(
    os: OsVersion,
    source: &dyn IntegrityMaskSource,
) -> IntegrityProtectionStatus {
    if !os.has_integrity_protection() {
        return IntegrityProtectionStatus {
            result: SecurityCheckResult::NotApplicable,
            raw_mask: 0,
            flags: decode_active(0),
        };
    }

    let raw_mask = read_active_mask(source);
    let flags = decode_active(raw_mask);
    let policy = policy_for(os);
    let result = if policy.is_satisfied_by(&flags) {
        SecurityCheckResult::Disabled
    } else {
        debug!(
            "CSR {:#x} still enforces {:?}",
            raw_mask,
            policy.missing(&flags)
        );
        SecurityCheckResult::Enabled
    };

    IntegrityProtectionStatus {
        result,
        raw_mask,
        flags,
    }
}

pub fn check_secure_boot_model(store: &dyn FirmwareStore, config: &DetectorConfig) -> SecurityCheckResult {
    match read_variable_text(store, Some(APPLE_SECURE_BOOT_NAMESPACE), HARDWARE_MODEL_VARIABLE) {
        Some(model) => {
            let model = model.trim();
            let enabled = config.is_secure_boot_model(model);
            debug!("Secure boot model {:?}, enforced: {}", model, enabled);
            SecurityCheckResult::from_enabled(enabled)
        }
        None => SecurityCheckResult::Disabled,
    }
}

/// `None` when the vendor settings variable does not exist or is empty.
fn vendor_setting_present(store: &dyn FirmwareStore, setting: &str) -> Option<bool> {
    let raw = read_variable(store, Some(VENDOR_SETTINGS_NAMESPACE), VENDOR_SETTINGS_VARIABLE, false)?;
    if raw.is_empty() {
        debug!("Empty vendor settings, ignoring");
        return None;
    }
    // Unreadable settings cannot grant anything
    let settings = read_variable_text(store, Some(VENDOR_SETTINGS_NAMESPACE), VENDOR_SETTINGS_VARIABLE)
        .unwrap_or_default();
    Some(settings.contains(setting))
}

/// AMFI only matters globally from Big Sur on; older releases relax library
/// validation per binary.
pub fn check_code_integrity(os: OsVersion, store: &dyn FirmwareStore) -> SecurityCheckResult {
    if !os.has_sealed_system_volume() {
        return SecurityCheckResult::NotApplicable;
    }

    // The vendor settings take precedence, boot-args are not looked at then
    if let Some(allowed) = vendor_setting_present(store, ALLOW_AMFI_SETTING) {
        return SecurityCheckResult::from_enabled(!allowed);
    }

    match read_variable(store, None, BOOT_ARGS_VARIABLE, false) {
        Some(boot_args) => {
            let relaxed = AMFI_BOOT_ARGS.iter().any(|arg| boot_args.contains(arg));
            SecurityCheckResult::from_enabled(!relaxed)
        }
        None => SecurityCheckResult::Enabled,
    }
}

pub fn filevault_check_skipped(store: &dyn FirmwareStore) -> bool {
    vendor_setting_present(store, ALLOW_FILEVAULT_SETTING).unwrap_or(false)
}

pub fn check_volume_encryption(
    os: OsVersion,
    store: &dyn FirmwareStore,
    runner: &dyn CommandRunner,
) -> SecurityCheckResult {
    if !os.has_sealed_system_volume() || filevault_check_skipped(store) {
        return SecurityCheckResult::NotApplicable;
    }

    match filevault_status_text(runner) {
        Some(status) => SecurityCheckResult::from_enabled(!status.contains(FILEVAULT_OFF_MARKER)),
        // Could be on, we cannot tell
        None => SecurityCheckResult::Enabled,
    }
}

/// Enabled when none of the stock legacy graphics kexts is left, meaning an
/// earlier patcher already went through this installation.
pub fn check_legacy_graphics_patch(kexts: &[PathBuf]) -> SecurityCheckResult {
    // Nothing to look for means no footprint
    if kexts.is_empty() {
        return SecurityCheckResult::Disabled;
    }
    let all_absent = kexts.iter().all(|kext| !kext.exists());
    SecurityCheckResult::from_enabled(all_absent)
}

pub fn bootloader_version(store: &dyn FirmwareStore) -> Option<String> {
    read_variable_text(store, Some(VENDOR_SETTINGS_NAMESPACE), VENDOR_VERSION_VARIABLE)
        .map(|version| version.trim().to_string())
        .filter(|version| !version.is_empty())
}

pub fn rom_version(store: &dyn FirmwareStore) -> Option<String> {
    match read_rom(store, ROM_VERSION_PROPERTY, true)? {
        FirmwareValue::Text(version) => Some(version.trim().to_string()),
        FirmwareValue::Bytes(_) => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostureRecord {
    pub os_version: OsVersion,
    pub integrity_protection: SecurityCheckResult,
    pub secure_boot_model: SecurityCheckResult,
    pub code_integrity: SecurityCheckResult,
    pub volume_encryption: SecurityCheckResult,
    pub legacy_graphics_patch: SecurityCheckResult,
    pub csr_active_config: u32,
    pub disabled_protections: BTreeSet<CsrFlag>,
    pub recovery_environment: bool,
    pub bootloader_version: Option<String>,
    pub rom_version: Option<String>,
}

impl PostureRecord {
    /// Names of the checks standing in the way of root patching. Code
    /// integrity only counts when the patch set needs an AMFI exemption.
    pub fn blocking_checks(&self, requires_code_integrity_exemption: bool) -> Vec<&'static str> {
        let mut blocking = Vec::new();
        if self.integrity_protection.is_enabled() {
            blocking.push("System Integrity Protection");
        }
        if self.secure_boot_model.is_enabled() {
            blocking.push("Secure Boot Model");
        }
        if requires_code_integrity_exemption && self.code_integrity.is_enabled() {
            blocking.push("Apple Mobile File Integrity");
        }
        if self.volume_encryption.is_enabled() {
            blocking.push("FileVault");
        }
        if self.legacy_graphics_patch.is_enabled() {
            blocking.push("Legacy patcher modifications");
        }
        blocking
    }

    pub fn patching_allowed(&self, requires_code_integrity_exemption: bool) -> bool {
        self.blocking_checks(requires_code_integrity_exemption).is_empty()
    }
}

impl fmt::Display for PostureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} ({}), recovery: {}",
            self.os_version,
            self.os_version.marketing_version(),
            self.recovery_environment
        )?;
        writeln!(f, "SIP: {} (csr {:#x})", self.integrity_protection, self.csr_active_config)?;
        writeln!(f, "SecureBootModel: {}", self.secure_boot_model)?;
        writeln!(f, "AMFI: {}", self.code_integrity)?;
        writeln!(f, "FileVault: {}", self.volume_encryption)?;
        write!(f, "Legacy patcher: {}", self.legacy_graphics_patch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootVolumeState {
    pub volume: Option<RootVolumeInfo>,
    pub sealed: Option<bool>,
}

/// Entry point for the patching workflow. Holds the platform collaborators;
/// safe to share between threads.
pub struct PostureDetector {
    firmware: Box<dyn FirmwareStore>,
    mask_source: Box<dyn IntegrityMaskSource>,
    runner: Box<dyn CommandRunner>,
    recovery: Arc<RecoveryProbe>,
    config: DetectorConfig,
}

impl PostureDetector {
    pub fn new(
        config: DetectorConfig,
        firmware: impl FirmwareStore + 'static,
        mask_source: impl IntegrityMaskSource + 'static,
        runner: impl CommandRunner + 'static,
    ) -> Self {
        // Share the process-wide memo unless a different marker was configured
        let recovery = if RECOVERY_PROBE.marker() == &config.recovery_marker {
            RECOVERY_PROBE.clone()
        } else {
            Arc::new(RecoveryProbe::new(config.recovery_marker.clone()))
        };
        Self {
            firmware: Box::new(firmware),
            mask_source: Box::new(mask_source),
            runner: Box::new(runner),
            recovery,
            config,
        }
    }

    /// Detector wired to the running system.
    pub fn platform() -> Self {
        PostureDetector::new(
            DetectorConfig::from_env(),
            crate::firmware::platform_store(),
            crate::csr::platform_mask_source(),
            ShellRunner,
        )
    }

    pub fn with_recovery_probe(mut self, probe: Arc<RecoveryProbe>) -> Self {
        self.recovery = probe;
        self
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn evaluate(&self, os: OsVersion) -> PostureRecord {
        let integrity = check_integrity_protection(os, self.mask_source.as_ref());
        let record = PostureRecord {
            os_version: os,
            integrity_protection: integrity.result,
            secure_boot_model: check_secure_boot_model(self.firmware.as_ref(), &self.config),
            code_integrity: check_code_integrity(os, self.firmware.as_ref()),
            volume_encryption: check_volume_encryption(os, self.firmware.as_ref(), self.runner.as_ref()),
            legacy_graphics_patch: check_legacy_graphics_patch(&self.config.legacy_graphics_kexts),
            csr_active_config: integrity.raw_mask,
            disabled_protections: integrity.flags.enabled(),
            recovery_environment: self.recovery.is_recovery_environment(),
            bootloader_version: bootloader_version(self.firmware.as_ref()),
            rom_version: rom_version(self.firmware.as_ref()),
        };
        info!(
            "Posture for {}: SIP {}, SecureBootModel {}, AMFI {}, FileVault {}, legacy patcher {}",
            os,
            record.integrity_protection,
            record.secure_boot_model,
            record.code_integrity,
            record.volume_encryption,
            record.legacy_graphics_patch
        );
        record
    }

    /// Evaluates against the running OS. An undetectable release is treated
    /// as the newest one, which carries the strictest policy.
    pub fn evaluate_host(&self) -> PostureRecord {
        let os = match HostOs::detect(self.runner.as_ref()) {
            Ok(host) => host.version,
            Err(e) => {
                warn!("Unable to detect the running OS, assuming {}: {:#}", OsVersion::NEWEST, e);
                OsVersion::NEWEST
            }
        };
        self.evaluate(os)
    }

    pub fn kext_loaded(&self, kext_name: &str, os: OsVersion) -> Option<bool> {
        kext_loaded(self.runner.as_ref(), kext_name, os)
    }

    pub fn root_volume_state(&self) -> RootVolumeState {
        RootVolumeState {
            volume: root_volume_info(self.runner.as_ref()),
            sealed: root_volume_sealed(self.runner.as_ref()),
        }
    }
}
