// Variables live either in NVRAM (optionally scoped to a vendor namespace)
// or in the read-only ROM description. A missing variable is a normal
// outcome and is always reported as `None`.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use tracing::trace;

/// Vendor bootloader settings and markers (`OCLP-Settings`, `OCLP-Version`).
pub const VENDOR_SETTINGS_NAMESPACE: &str = "4D1FDA02-38C7-4A6A-9CC6-4BCCA8B30102";
/// Apple secure boot variables (`HardwareModel`).
pub const APPLE_SECURE_BOOT_NAMESPACE: &str = "94B73556-2197-4702-82A8-3E1337DAFBFB";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirmwareValue {
    Bytes(Vec<u8>),
    Text(String),
}

impl FirmwareValue {
    /// Text view of the value. Byte data is decoded lossily, which is good
    /// enough for substring searches in boot arguments.
    pub fn to_text_lossy(&self) -> Cow<'_, str> {
        match self {
            FirmwareValue::Bytes(bytes) => String::from_utf8_lossy(strip_trailing_nul(bytes)),
            FirmwareValue::Text(text) => Cow::Borrowed(text.trim_end_matches('\0')),
        }
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.to_text_lossy().contains(needle)
    }

    /// True for zero length or NUL-only values.
    pub fn is_empty(&self) -> bool {
        match self {
            FirmwareValue::Bytes(bytes) => strip_trailing_nul(bytes).is_empty(),
            FirmwareValue::Text(text) => text.trim_end_matches('\0').is_empty(),
        }
    }
}

/// Backing store for firmware variables.
pub trait FirmwareStore: Send + Sync {
    fn read_nvram(&self, namespace: Option<&str>, name: &str) -> Option<FirmwareValue>;
    fn read_rom(&self, name: &str) -> Option<FirmwareValue>;
}

/// Key used by the registry for namespaced variables: `<GUID>:<name>`.
pub fn variable_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(namespace) => format!("{}:{}", namespace, name),
        None => name.to_string(),
    }
}

fn strip_trailing_nul(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |pos| pos + 1);
    &bytes[..end]
}

/// Strips trailing NUL padding and decodes UTF-8. Malformed data is treated
/// as absent.
pub fn decode_text(bytes: &[u8]) -> Option<String> {
    match std::str::from_utf8(strip_trailing_nul(bytes)) {
        Ok(text) => Some(text.to_string()),
        Err(e) => {
            trace!("Firmware value is not valid UTF-8: {}", e);
            None
        }
    }
}

fn decode_value(value: FirmwareValue, decode_as_text: bool) -> Option<FirmwareValue> {
    match value {
        FirmwareValue::Bytes(bytes) if decode_as_text => decode_text(&bytes).map(FirmwareValue::Text),
        value => Some(value),
    }
}

pub fn read_variable(
    store: &dyn FirmwareStore,
    namespace: Option<&str>,
    name: &str,
    decode_as_text: bool,
) -> Option<FirmwareValue> {
    let value = store.read_nvram(namespace, name);
    trace!(
        "NVRAM {} present: {}",
        variable_key(namespace, name),
        value.is_some()
    );
    value.and_then(|value| decode_value(value, decode_as_text))
}

pub fn read_rom(store: &dyn FirmwareStore, name: &str, decode_as_text: bool) -> Option<FirmwareValue> {
    let value = store.read_rom(name);
    trace!("ROM {} present: {}", name, value.is_some());
    value.and_then(|value| decode_value(value, decode_as_text))
}

/// Convenience wrapper returning the decoded text directly.
pub fn read_variable_text(store: &dyn FirmwareStore, namespace: Option<&str>, name: &str) -> Option<String> {
    match read_variable(store, namespace, name, true)? {
        FirmwareValue::Text(text) => Some(text),
        FirmwareValue::Bytes(_) => None,
    }
}

/// Store used where no firmware access exists (non-Apple hosts).
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableStore;

impl FirmwareStore for UnavailableStore {
    fn read_nvram(&self, _namespace: Option<&str>, _name: &str) -> Option<FirmwareValue> {
        None
    }

    fn read_rom(&self, _name: &str) -> Option<FirmwareValue> {
        None
    }
}

/// In-memory store, filled from captured values for offline evaluation.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StaticFirmwareStore {
    nvram: HashMap<String, FirmwareValue>,
    rom: HashMap<String, FirmwareValue>,
}

impl StaticFirmwareStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nvram(mut self, namespace: Option<&str>, name: &str, value: FirmwareValue) -> Self {
        self.nvram.insert(variable_key(namespace, name), value);
        self
    }

    pub fn with_rom(mut self, name: &str, value: FirmwareValue) -> Self {
        self.rom.insert(name.to_string(), value);
        self
    }
}

impl FirmwareStore for StaticFirmwareStore {
    fn read_nvram(&self, namespace: Option<&str>, name: &str) -> Option<FirmwareValue> {
        self.nvram.get(&variable_key(namespace, name)).cloned()
    }

    fn read_rom(&self, name: &str) -> Option<FirmwareValue> {
        self.rom.get(name).cloned()
    }
}

#[cfg(target_os = "macos")]
pub type PlatformStore = crate::firmware_macos::IoRegistryStore;
#[cfg(not(target_os = "macos"))]
pub type PlatformStore = UnavailableStore;

pub fn platform_store() -> PlatformStore {
    PlatformStore::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(data: &[u8]) -> FirmwareValue {
        FirmwareValue::Bytes(data.to_vec())
    }

    #[test]
    fn test_variable_key() {
        assert_eq!(variable_key(None, "boot-args"), "boot-args");
        assert_eq!(
            variable_key(Some(VENDOR_SETTINGS_NAMESPACE), "OCLP-Settings"),
            "4D1FDA02-38C7-4A6A-9CC6-4BCCA8B30102:OCLP-Settings"
        );
    }

    #[test]
    fn test_decode_text_strips_trailing_nul() {
        assert_eq!(decode_text(b"x86legacy\0\0\0"), Some("x86legacy".to_string()));
        assert_eq!(decode_text(b"\0\0"), Some(String::new()));
        assert_eq!(decode_text(b""), Some(String::new()));
        // Leading NULs are data
        assert_eq!(decode_text(b"\0a"), Some("\0a".to_string()));
    }

    #[test]
    fn test_decode_text_malformed() {
        assert_eq!(decode_text(&[0xff, 0xfe, 0x00]), None);
    }

    #[test]
    fn test_absent_variable() {
        let store = StaticFirmwareStore::new();
        assert_eq!(read_variable(&store, None, "boot-args", false), None);
        assert_eq!(read_variable(&store, None, "boot-args", true), None);
        assert_eq!(read_rom(&store, "version", true), None);
    }

    #[test]
    fn test_namespace_is_part_of_identity() {
        let store = StaticFirmwareStore::new().with_nvram(
            Some(VENDOR_SETTINGS_NAMESPACE),
            "OCLP-Settings",
            bytes(b"-allow_fv"),
        );
        assert!(read_variable(&store, Some(VENDOR_SETTINGS_NAMESPACE), "OCLP-Settings", false).is_some());
        assert!(read_variable(&store, None, "OCLP-Settings", false).is_none());
        assert!(read_variable(&store, Some(APPLE_SECURE_BOOT_NAMESPACE), "OCLP-Settings", false).is_none());
    }

    #[test]
    fn test_raw_and_decoded_reads() {
        let store = StaticFirmwareStore::new().with_nvram(None, "boot-args", bytes(b"-v keepsyms=1\0"));
        assert_eq!(
            read_variable(&store, None, "boot-args", false),
            Some(bytes(b"-v keepsyms=1\0"))
        );
        assert_eq!(
            read_variable(&store, None, "boot-args", true),
            Some(FirmwareValue::Text("-v keepsyms=1".to_string()))
        );
        assert_eq!(
            read_variable_text(&store, None, "boot-args"),
            Some("-v keepsyms=1".to_string())
        );
    }

    #[test]
    fn test_malformed_text_is_absent() {
        let store = StaticFirmwareStore::new().with_nvram(None, "boot-args", bytes(&[0xc3, 0x28]));
        assert!(read_variable(&store, None, "boot-args", false).is_some());
        assert_eq!(read_variable(&store, None, "boot-args", true), None);
        assert_eq!(read_variable_text(&store, None, "boot-args"), None);
    }

    #[test]
    fn test_text_values_pass_through() {
        let store = StaticFirmwareStore::new().with_rom("model", FirmwareValue::Text("iMac12,2".to_string()));
        assert_eq!(
            read_rom(&store, "model", true),
            Some(FirmwareValue::Text("iMac12,2".to_string()))
        );
    }

    #[test]
    fn test_contains_on_bytes() {
        let value = bytes(b"amfi_get_out_of_my_way=0x1 -v\0");
        assert!(value.contains("amfi_get_out_of_my_way=0x1"));
        assert!(!value.contains("-allow_amfi"));
        assert_eq!(value.to_text_lossy(), "amfi_get_out_of_my_way=0x1 -v");
    }

    #[test]
    fn test_unavailable_store() {
        let store = UnavailableStore;
        assert_eq!(read_variable(&store, None, "csr-active-config", false), None);
        assert_eq!(read_rom(&store, "version", false), None);
    }

    #[test]
    fn test_empty_values() {
        assert!(FirmwareValue::Bytes(Vec::new()).is_empty());
        assert!(FirmwareValue::Bytes(vec![0, 0]).is_empty());
        assert!(FirmwareValue::Text("\0".to_string()).is_empty());
        assert!(!FirmwareValue::Bytes(b"-allow_fv\0".to_vec()).is_empty());
        assert!(!FirmwareValue::Text(" ".to_string()).is_empty());
    }
}
