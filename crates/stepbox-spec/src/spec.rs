//! ExecutionSpec data model handed to the container runtime.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// How the process command is represented.
///
/// Runtimes format these two differently, so a spec carries exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessArgs {
    /// Literal argument vector.
    Args(Vec<String>),
    /// A single pre-joined command line (shell form).
    CommandLine(String),
}

impl Default for ProcessArgs {
    fn default() -> Self {
        ProcessArgs::Args(Vec::new())
    }
}

impl fmt::Display for ProcessArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessArgs::Args(args) => write!(f, "{}", args.join(" ")),
            ProcessArgs::CommandLine(line) => write!(f, "{line}"),
        }
    }
}

/// Process section of the execution spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    /// Command to run.
    pub args: ProcessArgs,
    /// Environment entries in `KEY=VALUE` form.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Working directory inside the sandbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

/// A mount entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Path inside the sandbox.
    pub destination: PathBuf,
    /// Path (or endpoint) on the host.
    pub source: String,
    /// Mount type; empty when the runtime infers it.
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Mount options such as `ro` and `rbind`.
    #[serde(default)]
    pub options: Vec<String>,
}

impl Mount {
    /// Whether the mount carries the `ro` option.
    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

/// Security mode requested for the step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// Default confinement.
    #[default]
    Sandbox,
    /// Relaxed privileges.
    Insecure,
}

/// Process isolation requested for the step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    /// Process runs inside the process sandbox.
    #[default]
    Sandbox,
    /// Process sandbox is bypassed.
    NoSandbox,
}

/// One contiguous id range mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    /// First id inside the sandbox.
    pub container_id: u32,
    /// First id on the host.
    pub host_id: u32,
    /// Number of ids in the range.
    pub size: u32,
}

/// User and group identity remapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMapping {
    /// UID ranges.
    pub uid_maps: Vec<IdMap>,
    /// GID ranges.
    pub gid_maps: Vec<IdMap>,
}

impl IdentityMapping {
    /// True when no ranges are mapped.
    pub fn is_empty(&self) -> bool {
        self.uid_maps.is_empty() && self.gid_maps.is_empty()
    }
}

/// A requested resource limit, as named by the build definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ulimit {
    /// Limit name, e.g. `nofile`.
    pub name: String,
    /// Soft limit.
    pub soft: u64,
    /// Hard limit.
    pub hard: u64,
}

/// A resource limit in runtime form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rlimit {
    /// Limit kind, e.g. `RLIMIT_NOFILE`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Soft limit.
    pub soft: u64,
    /// Hard limit.
    pub hard: u64,
}

impl From<&Ulimit> for Rlimit {
    fn from(u: &Ulimit) -> Self {
        Self {
            kind: format!("RLIMIT_{}", u.name.to_uppercase()),
            soft: u.soft,
            hard: u.hard,
        }
    }
}

/// A device to inject, by qualified name (`vendor.com/class=name`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRef {
    /// Qualified device name.
    pub name: String,
    /// Missing optional devices are skipped by the runtime.
    #[serde(default)]
    pub optional: bool,
}

/// Security attributes of the execution spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityAttributes {
    pub mode: SecurityMode,
    pub process_mode: ProcessMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_mapping: Option<IdentityMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rlimits: Vec<Rlimit>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceRef>,
    #[serde(default)]
    pub cgroup_namespace: bool,
}

/// Fully assembled description of a sandboxed process.
///
/// Built by [`SpecBuilder`](crate::SpecBuilder); treat it as frozen once
/// `build` returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSpec {
    pub process: Process,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub security: SecurityAttributes,
}

impl ExecutionSpec {
    /// Serialize for handoff to the runtime.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rlimit_from_ulimit() {
        let rlimit = Rlimit::from(&Ulimit {
            name: "nofile".into(),
            soft: 1024,
            hard: 4096,
        });
        assert_eq!(rlimit.kind, "RLIMIT_NOFILE");
        assert_eq!(rlimit.soft, 1024);
        assert_eq!(rlimit.hard, 4096);
    }

    #[test]
    fn test_command_line_serialization() {
        let mut spec = ExecutionSpec::default();
        spec.process.args = ProcessArgs::CommandLine("cmd /S /C dir".into());
        let json = spec.to_json().unwrap();
        assert!(json.contains("\"command_line\": \"cmd /S /C dir\""));
        assert!(!json.contains("identity_mapping"));
    }

    #[test]
    fn test_mount_type_omitted_when_empty() {
        let mount = Mount {
            destination: PathBuf::from("/etc/hosts"),
            source: "/tmp/hosts".into(),
            kind: String::new(),
            options: vec!["ro".into()],
        };
        let json = serde_json::to_string(&mount).unwrap();
        assert!(!json.contains("\"type\""));
        assert!(mount.is_read_only());
    }
}
