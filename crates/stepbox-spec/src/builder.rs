//! Builder that assembles an [`ExecutionSpec`] from a step request.

use crate::capability::CapabilityRegistry;
use crate::error::Result;
use crate::modifier::{
    generate_cgroup_namespace_opts, generate_device_opts, generate_idmap_opts,
    generate_mount_opts, generate_process_mode_opts, generate_rlimit_opts,
    generate_security_opts, with_process_args, with_tracing_socket, SpecOpt,
};
use crate::spec::{DeviceRef, ExecutionSpec, IdentityMapping, ProcessMode, SecurityMode, Ulimit};
use std::path::PathBuf;

/// Fluent builder for execution specs.
///
/// # Example
///
/// ```
/// use stepbox_spec::{CapabilityTable, Platform, ProcessArgs, SpecBuilder};
///
/// let table = CapabilityTable::for_platform(Platform::Linux);
/// let spec = SpecBuilder::new()
///     .command(["make", "-j4"])
///     .env("CI=1")
///     .build(&table)
///     .unwrap();
///
/// assert_eq!(
///     spec.process.args,
///     ProcessArgs::Args(vec!["make".into(), "-j4".into()])
/// );
/// ```
#[derive(Debug, Clone, Default)]
pub struct SpecBuilder {
    command: Vec<String>,
    env: Vec<String>,
    cwd: Option<PathBuf>,
    resolv_conf: Option<PathBuf>,
    hosts_file: Option<PathBuf>,
    security_mode: SecurityMode,
    process_mode: ProcessMode,
    identity_mapping: Option<IdentityMapping>,
    ulimits: Vec<Ulimit>,
    devices: Vec<DeviceRef>,
    tracing_socket: Option<String>,
}

impl SpecBuilder {
    /// Create a builder for a default sandboxed step.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the command tokens. One token means a pre-joined command line.
    pub fn command<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = tokens.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment entry in `KEY=VALUE` form.
    pub fn env(mut self, entry: impl Into<String>) -> Self {
        self.env.push(entry.into());
        self
    }

    /// Set the working directory inside the sandbox.
    pub fn cwd(mut self, path: impl Into<PathBuf>) -> Self {
        self.cwd = Some(path.into());
        self
    }

    /// Host resolv.conf to expose read-only (Linux).
    pub fn resolv_conf(mut self, path: impl Into<PathBuf>) -> Self {
        self.resolv_conf = Some(path.into());
        self
    }

    /// Host hosts file to expose read-only (Linux).
    pub fn hosts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.hosts_file = Some(path.into());
        self
    }

    /// Set the security mode.
    pub fn security_mode(mut self, mode: SecurityMode) -> Self {
        self.security_mode = mode;
        self
    }

    /// Set the process isolation mode.
    pub fn process_mode(mut self, mode: ProcessMode) -> Self {
        self.process_mode = mode;
        self
    }

    /// Set the identity mapping.
    pub fn identity_mapping(mut self, mapping: IdentityMapping) -> Self {
        self.identity_mapping = Some(mapping);
        self
    }

    /// Add a resource limit.
    pub fn ulimit(mut self, name: impl Into<String>, soft: u64, hard: u64) -> Self {
        self.ulimits.push(Ulimit {
            name: name.into(),
            soft,
            hard,
        });
        self
    }

    /// Add a device by qualified name.
    pub fn device(mut self, name: impl Into<String>, optional: bool) -> Self {
        self.devices.push(DeviceRef {
            name: name.into(),
            optional,
        });
        self
    }

    /// Expose the host tracing endpoint inside the sandbox.
    pub fn tracing_socket(mut self, socket: impl Into<String>) -> Self {
        self.tracing_socket = Some(socket.into());
        self
    }

    /// Generate every modifier in pipeline order.
    ///
    /// Fails before anything is applied if any requested capability is
    /// unsupported by `registry`.
    pub fn modifiers<R: CapabilityRegistry + ?Sized>(self, registry: &R) -> Result<Vec<SpecOpt>> {
        let platform = registry.platform();

        let mut opts = vec![with_process_args(self.command)];
        opts.extend(generate_mount_opts(
            platform,
            self.resolv_conf.as_deref(),
            self.hosts_file.as_deref(),
        ));
        opts.extend(generate_security_opts(self.security_mode, registry)?);
        opts.extend(generate_process_mode_opts(self.process_mode, registry)?);
        opts.extend(generate_idmap_opts(self.identity_mapping, registry)?);
        opts.extend(generate_rlimit_opts(&self.ulimits, registry)?);
        opts.extend(generate_device_opts(self.devices, registry)?);
        opts.extend(generate_cgroup_namespace_opts(registry));
        if let Some(socket) = &self.tracing_socket {
            opts.push(with_tracing_socket(platform, socket));
        }

        let env = self.env;
        let cwd = self.cwd;
        opts.push(Box::new(move |spec: &mut ExecutionSpec| {
            spec.process.env.extend(env);
            spec.process.cwd = cwd;
            Ok(())
        }));
        Ok(opts)
    }

    /// Assemble the execution spec.
    ///
    /// Either every modifier applies and a complete spec is returned, or
    /// the first error is returned and the draft is discarded.
    pub fn build<R: CapabilityRegistry + ?Sized>(self, registry: &R) -> Result<ExecutionSpec> {
        let platform = registry.platform();
        let opts = self.modifiers(registry)?;
        let count = opts.len();

        let mut draft = ExecutionSpec::default();
        for apply in opts {
            apply(&mut draft)?;
        }

        tracing::debug!(
            %platform,
            modifiers = count,
            mounts = draft.mounts.len(),
            command = %draft.process.args,
            "Execution spec assembled"
        );
        Ok(draft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Capability, CapabilityTable, Platform};
    use crate::spec::{IdMap, ProcessArgs};
    use std::collections::HashSet;

    /// Registry with an explicit set of enabled capabilities.
    struct Only {
        platform: Platform,
        enabled: HashSet<Capability>,
    }

    impl CapabilityRegistry for Only {
        fn platform(&self) -> Platform {
            self.platform
        }

        fn supports(&self, capability: Capability) -> bool {
            self.enabled.contains(&capability)
        }
    }

    fn full_request() -> SpecBuilder {
        SpecBuilder::new()
            .command(["sh", "-c", "true"])
            .security_mode(SecurityMode::Insecure)
            .process_mode(ProcessMode::NoSandbox)
            .identity_mapping(IdentityMapping {
                uid_maps: vec![IdMap {
                    container_id: 0,
                    host_id: 100000,
                    size: 65536,
                }],
                gid_maps: vec![],
            })
            .ulimit("nofile", 1024, 2048)
            .device("vendor.com/gpu=all", false)
    }

    #[test]
    fn test_each_disabled_capability_fails_the_build() {
        let gated = [
            Capability::Insecure,
            Capability::NoProcessSandbox,
            Capability::IdentityMapping,
            Capability::ResourceLimits,
            Capability::Devices,
        ];
        for disabled in gated {
            let registry = Only {
                platform: Platform::Linux,
                enabled: Capability::ALL
                    .into_iter()
                    .filter(|c| *c != disabled)
                    .collect(),
            };
            let err = full_request()
                .build(&registry)
                .expect_err("build should fail");
            assert_eq!(err.unsupported_capability(), Some(disabled));
            assert!(err.to_string().contains(&disabled.to_string()));
        }
    }

    #[test]
    fn test_full_request_on_linux() {
        let table = CapabilityTable::for_platform(Platform::Linux);
        let spec = full_request().build(&table).unwrap();
        assert_eq!(spec.security.mode, SecurityMode::Insecure);
        assert_eq!(spec.security.process_mode, ProcessMode::NoSandbox);
        assert!(spec.security.identity_mapping.is_some());
        assert_eq!(spec.security.rlimits[0].kind, "RLIMIT_NOFILE");
        assert_eq!(spec.security.devices[0].name, "vendor.com/gpu=all");
        assert!(spec.security.cgroup_namespace);
    }

    #[test]
    fn test_default_request_on_windows_has_no_gated_attributes() {
        let table = CapabilityTable::for_platform(Platform::Windows);
        let spec = SpecBuilder::new()
            .command(["cmd /S /C echo hi"])
            .build(&table)
            .unwrap();
        assert_eq!(spec.security.mode, SecurityMode::Sandbox);
        assert_eq!(spec.security.process_mode, ProcessMode::Sandbox);
        assert!(spec.security.identity_mapping.is_none());
        assert!(spec.security.rlimits.is_empty());
        assert!(spec.security.devices.is_empty());
        assert!(!spec.security.cgroup_namespace);
        assert_eq!(
            spec.process.args,
            ProcessArgs::CommandLine("cmd /S /C echo hi".into())
        );
    }

    #[test]
    fn test_mounts_precede_tracing_mount() {
        let table = CapabilityTable::for_platform(Platform::Linux);
        let spec = SpecBuilder::new()
            .command(["true", "--flag"])
            .hosts_file("/run/stepbox/hosts")
            .tracing_socket("/run/stepbox/otel.sock")
            .env("CI=1")
            .cwd("/work")
            .build(&table)
            .unwrap();
        assert_eq!(spec.mounts.len(), 2);
        assert_eq!(spec.mounts[0].destination, PathBuf::from("/etc/hosts"));
        assert_eq!(
            spec.mounts[1].destination,
            PathBuf::from("/dev/otel-grpc.sock")
        );
        assert_eq!(spec.process.env.len(), 2);
        assert_eq!(spec.process.env[1], "CI=1");
        assert_eq!(spec.process.cwd, Some(PathBuf::from("/work")));
    }
}
