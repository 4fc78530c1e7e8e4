use crate::csr::{CsrFlag, FlagSet};
use crate::os_version::OsVersion;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// Root patching from El Capitan to Catalina
const UNSEALED_ROOT_PATCH_FLAGS: [CsrFlag; 3] = [
    CsrFlag::AllowUntrustedKexts,
    CsrFlag::AllowUnrestrictedFs,
    CsrFlag::AllowUnapprovedKexts,
];

// Big Sur and newer additionally need the root snapshot seal lifted
const SEALED_ROOT_PATCH_FLAGS: [CsrFlag; 4] = [
    CsrFlag::AllowUntrustedKexts,
    CsrFlag::AllowUnrestrictedFs,
    CsrFlag::AllowUnapprovedKexts,
    CsrFlag::AllowUnauthenticatedRoot,
];

/// Flags that must all be set (protection disabled) before the root volume
/// can be modified on `os`. Releases without integrity protection require
/// nothing; anything from Big Sur on, future releases included, gets the
/// full set.
pub fn required_disabled_bits(os: OsVersion) -> BTreeSet<CsrFlag> {
    if !os.has_integrity_protection() {
        BTreeSet::new()
    } else if os.has_sealed_system_volume() {
        SEALED_ROOT_PATCH_FLAGS.into_iter().collect()
    } else {
        UNSEALED_ROOT_PATCH_FLAGS.into_iter().collect()
    }
}

/// Combined bit mask of the required flags, as written to csr-active-config.
pub fn required_mask(os: OsVersion) -> u32 {
    required_disabled_bits(os)
        .into_iter()
        .fold(0, |mask, flag| mask | flag.mask())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosturePolicy {
    pub os_version: OsVersion,
    pub required_disabled: BTreeSet<CsrFlag>,
}

impl PosturePolicy {
    pub fn is_satisfied_by(&self, flags: &FlagSet) -> bool {
        flags.contains_all(&self.required_disabled)
    }

    /// Required flags that are still enforced.
    pub fn missing(&self, flags: &FlagSet) -> BTreeSet<CsrFlag> {
        self.required_disabled
            .iter()
            .filter(|flag| !flags.is_set(**flag))
            .copied()
            .collect()
    }
}

pub fn policy_for(os: OsVersion) -> PosturePolicy {
    PosturePolicy {
        os_version: os,
        required_disabled: required_disabled_bits(os),
    }
}
