// The active configuration is a packed `u32`. Each set bit relaxes one
// protection. Bits are never renumbered, new meanings are only appended.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};
use tracing::{debug, trace};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    IntoStaticStr,
)]
pub enum CsrFlag {
    #[strum(serialize = "CSR_ALLOW_UNTRUSTED_KEXTS")]
    AllowUntrustedKexts,
    #[strum(serialize = "CSR_ALLOW_UNRESTRICTED_FS")]
    AllowUnrestrictedFs,
    #[strum(serialize = "CSR_ALLOW_TASK_FOR_PID")]
    AllowTaskForPid,
    #[strum(serialize = "CSR_ALLOW_KERNEL_DEBUGGER")]
    AllowKernelDebugger,
    #[strum(serialize = "CSR_ALLOW_APPLE_INTERNAL")]
    AllowAppleInternal,
    #[strum(serialize = "CSR_ALLOW_UNRESTRICTED_DTRACE")]
    AllowUnrestrictedDtrace,
    #[strum(serialize = "CSR_ALLOW_UNRESTRICTED_NVRAM")]
    AllowUnrestrictedNvram,
    #[strum(serialize = "CSR_ALLOW_DEVICE_CONFIGURATION")]
    AllowDeviceConfiguration,
    #[strum(serialize = "CSR_ALLOW_ANY_RECOVERY_OS")]
    AllowAnyRecoveryOs,
    #[strum(serialize = "CSR_ALLOW_UNAPPROVED_KEXTS")]
    AllowUnapprovedKexts,
    #[strum(serialize = "CSR_ALLOW_EXECUTABLE_POLICY_OVERRIDE")]
    AllowExecutablePolicyOverride,
    #[strum(serialize = "CSR_ALLOW_UNAUTHENTICATED_ROOT")]
    AllowUnauthenticatedRoot,
}

/// Bit index for every known flag, as defined by xnu's `csr.h`.
pub const CSR_FLAG_TABLE: [(u32, CsrFlag); 12] = [
    (0, CsrFlag::AllowUntrustedKexts),
    (1, CsrFlag::AllowUnrestrictedFs),
    (2, CsrFlag::AllowTaskForPid),
    (3, CsrFlag::AllowKernelDebugger),
    (4, CsrFlag::AllowAppleInternal),
    (5, CsrFlag::AllowUnrestrictedDtrace),
    (6, CsrFlag::AllowUnrestrictedNvram),
    (7, CsrFlag::AllowDeviceConfiguration),
    (8, CsrFlag::AllowAnyRecoveryOs),
    (9, CsrFlag::AllowUnapprovedKexts),
    (10, CsrFlag::AllowExecutablePolicyOverride),
    (11, CsrFlag::AllowUnauthenticatedRoot),
];

impl CsrFlag {
    pub fn bit(self) -> u32 {
        CSR_FLAG_TABLE
            .iter()
            .find(|(_, flag)| *flag == self)
            .map(|(bit, _)| *bit)
            // Every variant has a table entry
            .unwrap_or_default()
    }

    pub fn mask(self) -> u32 {
        1u32.checked_shl(self.bit()).unwrap_or(0)
    }
}

/// One boolean per flag of the decoding table, all false until decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSet {
    flags: BTreeMap<CsrFlag, bool>,
}

impl FlagSet {
    pub fn new(table: &[(u32, CsrFlag)]) -> Self {
        FlagSet {
            flags: table.iter().map(|(_, flag)| (*flag, false)).collect(),
        }
    }

    // Flags are only ever set during a decode pass, never cleared
    fn set(&mut self, flag: CsrFlag) {
        self.flags.insert(flag, true);
    }

    pub fn is_set(&self, flag: CsrFlag) -> bool {
        self.flags.get(&flag).copied().unwrap_or(false)
    }

    pub fn enabled(&self) -> BTreeSet<CsrFlag> {
        self.flags
            .iter()
            .filter(|(_, set)| **set)
            .map(|(flag, _)| *flag)
            .collect()
    }

    pub fn contains_all(&self, required: &BTreeSet<CsrFlag>) -> bool {
        required.iter().all(|flag| self.is_set(*flag))
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

/// Decodes a raw CSR value. Unknown bits are ignored, table entries with a
/// bit index outside of 32 bits never match.
pub fn decode(raw: u32, table: &[(u32, CsrFlag)]) -> FlagSet {
    let mut flag_set = FlagSet::new(table);
    for (bit, flag) in table {
        let mask = 1u32.checked_shl(*bit).unwrap_or(0);
        if raw & mask != 0 {
            flag_set.set(*flag);
        }
    }
    trace!("Decoded CSR {:#x} into {:?}", raw, flag_set.enabled());
    flag_set
}

pub fn decode_active(raw: u32) -> FlagSet {
    decode(raw, &CSR_FLAG_TABLE)
}

/// Source of the active CSR configuration. `None` means the value cannot be
/// obtained on this platform or release.
pub trait IntegrityMaskSource: Send + Sync {
    fn active_mask(&self) -> Option<u32>;
}

/// No source: integrity protection is assumed fully active.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableMaskSource;

impl IntegrityMaskSource for UnavailableMaskSource {
    fn active_mask(&self) -> Option<u32> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedMaskSource(pub u32);

impl IntegrityMaskSource for FixedMaskSource {
    fn active_mask(&self) -> Option<u32> {
        Some(self.0)
    }
}

/// Missing call means no bit is disabled.
pub fn read_active_mask(source: &dyn IntegrityMaskSource) -> u32 {
    match source.active_mask() {
        Some(mask) => mask,
        None => {
            debug!("CSR configuration unavailable, assuming fully enabled");
            0
        }
    }
}

#[cfg(target_os = "macos")]
mod libsystem {
    use super::IntegrityMaskSource;
    use std::ffi::CString;
    use tracing::{debug, warn};

    const LIBSYSTEM_PATH: &str = "/usr/lib/libSystem.dylib";
    const CSR_GET_ACTIVE_CONFIG: &str = "csr_get_active_config";

    type CsrGetActiveConfig = unsafe extern "C" fn(config: *mut u32) -> libc::c_int;

    /// dlopen handle, closed on drop.
    struct Library(*mut libc::c_void);

    impl Library {
        fn open(path: &str) -> Option<Library> {
            let path = CString::new(path).ok()?;
            let handle = unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_LAZY) };
            if handle.is_null() {
                None
            } else {
                Some(Library(handle))
            }
        }

        fn symbol(&self, name: &str) -> Option<*mut libc::c_void> {
            let name = CString::new(name).ok()?;
            let symbol = unsafe { libc::dlsym(self.0, name.as_ptr()) };
            if symbol.is_null() {
                None
            } else {
                Some(symbol)
            }
        }
    }

    impl Drop for Library {
        fn drop(&mut self) {
            unsafe {
                libc::dlclose(self.0);
            }
        }
    }

    /// Calls `csr_get_active_config` from libSystem. The call only exists
    /// from El Capitan on.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct LibSystemMaskSource;

    impl IntegrityMaskSource for LibSystemMaskSource {
        fn active_mask(&self) -> Option<u32> {
            let library = match Library::open(LIBSYSTEM_PATH) {
                Some(library) => library,
                None => {
                    warn!("Failed to open {}", LIBSYSTEM_PATH);
                    return None;
                }
            };
            let symbol = match library.symbol(CSR_GET_ACTIVE_CONFIG) {
                Some(symbol) => symbol,
                None => {
                    debug!("{} not exported by this release", CSR_GET_ACTIVE_CONFIG);
                    return None;
                }
            };

            let csr_get_active_config: CsrGetActiveConfig = unsafe { std::mem::transmute(symbol) };
            let mut config: u32 = 0;
            let ret = unsafe { csr_get_active_config(&mut config) };
            if ret != 0 {
                warn!("{} returned {}", CSR_GET_ACTIVE_CONFIG, ret);
                return None;
            }
            Some(config)
        }
    }
}

#[cfg(target_os = "macos")]
pub use libsystem::LibSystemMaskSource;

#[cfg(target_os = "macos")]
pub type PlatformMaskSource = LibSystemMaskSource;
#[cfg(not(target_os = "macos"))]
pub type PlatformMaskSource = UnavailableMaskSource;

pub fn platform_mask_source() -> PlatformMaskSource {
    PlatformMaskSource::default()
}
