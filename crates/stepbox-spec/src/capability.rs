//! Per-platform capability tables.
//!
//! Optional sandbox features are not assumed to exist everywhere. Spec
//! assembly asks a [`CapabilityRegistry`] before enabling any of them and
//! fails with a named error when the answer is no.

use crate::error::SpecError;
use std::fmt;
use std::str::FromStr;

/// An optional execution feature whose availability varies by platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Running with relaxed privileges (security mode `insecure`).
    Insecure,
    /// Running without the process sandbox.
    NoProcessSandbox,
    /// User/group identity remapping.
    IdentityMapping,
    /// POSIX resource limits.
    ResourceLimits,
    /// Device injection.
    Devices,
    /// Private cgroup v2 namespace.
    CgroupNamespace,
}

impl Capability {
    /// Every capability, in table order.
    pub const ALL: [Capability; 6] = [
        Capability::Insecure,
        Capability::NoProcessSandbox,
        Capability::IdentityMapping,
        Capability::ResourceLimits,
        Capability::Devices,
        Capability::CgroupNamespace,
    ];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Insecure => write!(f, "insecure mode"),
            Capability::NoProcessSandbox => write!(f, "no process sandbox"),
            Capability::IdentityMapping => write!(f, "identity mapping"),
            Capability::ResourceLimits => write!(f, "resource limits"),
            Capability::Devices => write!(f, "device injection"),
            Capability::CgroupNamespace => write!(f, "cgroup namespace"),
        }
    }
}

/// Target platform of the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    /// Linux containers.
    Linux,
    /// Windows containers (HCS).
    Windows,
}

impl Platform {
    /// Platform of the compile target.
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Linux => write!(f, "linux"),
            Platform::Windows => write!(f, "windows"),
        }
    }
}

impl FromStr for Platform {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linux" => Ok(Platform::Linux),
            "windows" => Ok(Platform::Windows),
            other => Err(SpecError::UnknownPlatform(other.to_string())),
        }
    }
}

/// Answers whether an optional feature is available.
///
/// Implementations must be pure: the same question always gets the same
/// answer for the lifetime of the registry.
pub trait CapabilityRegistry {
    /// Platform this registry describes.
    fn platform(&self) -> Platform;

    /// Whether `capability` is supported.
    fn supports(&self, capability: Capability) -> bool;
}

const LINUX_CAPABILITIES: &[(Capability, bool)] = &[
    (Capability::Insecure, true),
    (Capability::NoProcessSandbox, true),
    (Capability::IdentityMapping, true),
    (Capability::ResourceLimits, true),
    (Capability::Devices, true),
    (Capability::CgroupNamespace, true),
];

const WINDOWS_CAPABILITIES: &[(Capability, bool)] = &[
    (Capability::Insecure, false),
    (Capability::NoProcessSandbox, false),
    (Capability::IdentityMapping, false),
    (Capability::ResourceLimits, false),
    (Capability::Devices, false),
    (Capability::CgroupNamespace, false),
];

/// Static capability table for one platform.
#[derive(Debug, Clone, Copy)]
pub struct CapabilityTable {
    platform: Platform,
    entries: &'static [(Capability, bool)],
}

impl CapabilityTable {
    /// Table for the given platform.
    pub fn for_platform(platform: Platform) -> Self {
        let entries = match platform {
            Platform::Linux => LINUX_CAPABILITIES,
            Platform::Windows => WINDOWS_CAPABILITIES,
        };
        Self { platform, entries }
    }

    /// Table for the compile target.
    pub fn current() -> Self {
        Self::for_platform(Platform::current())
    }
}

impl CapabilityRegistry for CapabilityTable {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn supports(&self, capability: Capability) -> bool {
        self.entries
            .iter()
            .find(|(c, _)| *c == capability)
            .map(|(_, supported)| *supported)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linux_supports_everything() {
        let table = CapabilityTable::for_platform(Platform::Linux);
        for capability in Capability::ALL {
            assert!(table.supports(capability), "{capability}");
        }
    }

    #[test]
    fn test_windows_supports_nothing() {
        let table = CapabilityTable::for_platform(Platform::Windows);
        for capability in Capability::ALL {
            assert!(!table.supports(capability), "{capability}");
        }
    }

    #[test]
    fn test_platform_parse() {
        assert_eq!("Linux".parse::<Platform>().unwrap(), Platform::Linux);
        assert_eq!("windows".parse::<Platform>().unwrap(), Platform::Windows);
        assert!("plan9".parse::<Platform>().is_err());
    }

    #[test]
    fn test_current_matches_target() {
        let table = CapabilityTable::current();
        assert_eq!(table.platform(), Platform::current());
    }
}
