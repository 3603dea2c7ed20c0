//! Spec modifiers.
//!
//! Each `generate_*` function turns one concern of a step request into a
//! list of [`SpecOpt`]s, or fails up front when the concern needs a
//! capability the registry denies. Generating never touches a spec, so a
//! failure here leaves nothing half-built.
//!
//! Ordering matters: mount modifiers must be applied before security and
//! process-mode modifiers, which may add mounts of their own.

use crate::capability::{Capability, CapabilityRegistry, Platform};
use crate::error::{Result, SpecError};
use crate::spec::{
    DeviceRef, ExecutionSpec, IdentityMapping, Mount, ProcessArgs, ProcessMode, Rlimit,
    SecurityMode, Ulimit,
};
use std::path::{Component, Path, PathBuf};

/// A single mutation of a draft spec.
pub type SpecOpt = Box<dyn FnOnce(&mut ExecutionSpec) -> Result<()> + Send>;

/// Canonical tracing socket path on Linux.
const LINUX_TRACING_SOCKET: &str = "/dev/otel-grpc.sock";

/// Canonical tracing pipe path on Windows, in slash form.
const WINDOWS_TRACING_SOCKET: &str = "//./pipe/otel-grpc";

/// Where the self re-exec helper is mounted in Windows sandboxes.
const WINDOWS_USER_INFO_HELPER: &str = "C:\\Windows\\System32\\get-user-info.exe";

/// Env var the traced process reads its exporter endpoint from.
pub const TRACING_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

fn opt<F>(f: F) -> SpecOpt
where
    F: FnOnce(&mut ExecutionSpec) -> Result<()> + Send + 'static,
{
    Box::new(f)
}

fn require<R: CapabilityRegistry + ?Sized>(registry: &R, capability: Capability) -> Result<()> {
    if registry.supports(capability) {
        return Ok(());
    }
    let platform = registry.platform();
    tracing::debug!(%capability, %platform, "Capability not supported");
    Err(SpecError::Unsupported {
        capability,
        platform,
    })
}

/// Set the process command.
///
/// A single token is a pre-joined command line (shell form); anything else
/// is a literal argument vector.
pub fn with_process_args(tokens: Vec<String>) -> SpecOpt {
    opt(move |spec| {
        spec.process.args = if tokens.len() == 1 {
            let mut tokens = tokens;
            ProcessArgs::CommandLine(tokens.remove(0))
        } else {
            ProcessArgs::Args(tokens)
        };
        Ok(())
    })
}

fn ro_bind(source: &Path, destination: &str) -> Mount {
    Mount {
        destination: PathBuf::from(destination),
        source: source.to_string_lossy().into_owned(),
        kind: "bind".into(),
        options: vec!["ro".into(), "rbind".into()],
    }
}

/// Base mounts for auxiliary tooling. Never fails to generate.
///
/// On Windows the running binary is mounted read-only as a helper that the
/// sandbox re-executes to resolve user info; `resolv_conf` and `hosts_file`
/// are ignored there. On Linux they are bind-mounted read-only.
pub fn generate_mount_opts(
    platform: Platform,
    resolv_conf: Option<&Path>,
    hosts_file: Option<&Path>,
) -> Vec<SpecOpt> {
    match platform {
        Platform::Windows => vec![opt(|spec| {
            let exec_path = std::env::current_exe().map_err(SpecError::Executable)?;
            spec.mounts.push(Mount {
                destination: PathBuf::from(WINDOWS_USER_INFO_HELPER),
                source: exec_path.to_string_lossy().into_owned(),
                kind: String::new(),
                options: vec!["ro".into()],
            });
            Ok(())
        })],
        Platform::Linux => {
            let mut opts = Vec::new();
            if let Some(path) = resolv_conf {
                let mount = ro_bind(path, "/etc/resolv.conf");
                opts.push(opt(move |spec| {
                    spec.mounts.push(mount);
                    Ok(())
                }));
            }
            if let Some(path) = hosts_file {
                let mount = ro_bind(path, "/etc/hosts");
                opts.push(opt(move |spec| {
                    spec.mounts.push(mount);
                    Ok(())
                }));
            }
            opts
        }
    }
}

/// Security mode modifiers. Must be applied after the mount modifiers.
pub fn generate_security_opts<R: CapabilityRegistry + ?Sized>(
    mode: SecurityMode,
    registry: &R,
) -> Result<Vec<SpecOpt>> {
    if mode == SecurityMode::Sandbox {
        return Ok(Vec::new());
    }
    require(registry, Capability::Insecure)?;
    Ok(vec![opt(move |spec| {
        spec.security.mode = mode;
        Ok(())
    })])
}

/// Process mode modifiers. Must be applied after the mount modifiers.
pub fn generate_process_mode_opts<R: CapabilityRegistry + ?Sized>(
    mode: ProcessMode,
    registry: &R,
) -> Result<Vec<SpecOpt>> {
    if mode == ProcessMode::Sandbox {
        return Ok(Vec::new());
    }
    require(registry, Capability::NoProcessSandbox)?;
    Ok(vec![opt(move |spec| {
        spec.security.process_mode = mode;
        Ok(())
    })])
}

/// Identity mapping modifiers; a missing or empty mapping is a no-op.
pub fn generate_idmap_opts<R: CapabilityRegistry + ?Sized>(
    mapping: Option<IdentityMapping>,
    registry: &R,
) -> Result<Vec<SpecOpt>> {
    let Some(mapping) = mapping.filter(|m| !m.is_empty()) else {
        return Ok(Vec::new());
    };
    require(registry, Capability::IdentityMapping)?;
    Ok(vec![opt(move |spec| {
        spec.security.identity_mapping = Some(mapping);
        Ok(())
    })])
}

/// Resource limit modifiers; no limits is a no-op.
pub fn generate_rlimit_opts<R: CapabilityRegistry + ?Sized>(
    ulimits: &[Ulimit],
    registry: &R,
) -> Result<Vec<SpecOpt>> {
    if ulimits.is_empty() {
        return Ok(Vec::new());
    }
    require(registry, Capability::ResourceLimits)?;
    let rlimits: Vec<Rlimit> = ulimits.iter().map(Rlimit::from).collect();
    Ok(vec![opt(move |spec| {
        spec.security.rlimits.extend(rlimits);
        Ok(())
    })])
}

/// Device injection modifiers; no devices is a no-op.
pub fn generate_device_opts<R: CapabilityRegistry + ?Sized>(
    devices: Vec<DeviceRef>,
    registry: &R,
) -> Result<Vec<SpecOpt>> {
    if devices.is_empty() {
        return Ok(Vec::new());
    }
    require(registry, Capability::Devices)?;
    Ok(vec![opt(move |spec| {
        spec.security.devices.extend(devices);
        Ok(())
    })])
}

/// Enables a private cgroup namespace where the platform has one.
pub fn generate_cgroup_namespace_opts<R: CapabilityRegistry + ?Sized>(
    registry: &R,
) -> Vec<SpecOpt> {
    if !registry.supports(Capability::CgroupNamespace) {
        return Vec::new();
    }
    vec![opt(|spec| {
        spec.security.cgroup_namespace = true;
        Ok(())
    })]
}

/// Map a generic mount type to what the platform's runtime expects.
///
/// The HCS shim infers the type itself, so on Windows the tag is always
/// empty regardless of input.
pub fn normalize_mount_type(platform: Platform, raw: &str) -> String {
    match platform {
        Platform::Windows => String::new(),
        Platform::Linux => raw.to_string(),
    }
}

fn tracing_socket_path(platform: Platform) -> &'static str {
    match platform {
        Platform::Linux => LINUX_TRACING_SOCKET,
        Platform::Windows => WINDOWS_TRACING_SOCKET,
    }
}

/// Address of the tracing transport as seen from inside the sandbox.
pub fn tracing_socket_uri(platform: Platform) -> String {
    match platform {
        Platform::Linux => format!("unix://{}", tracing_socket_path(platform)),
        Platform::Windows => format!("npipe://{}", tracing_socket_path(platform)),
    }
}

/// Mount exposing the host tracing endpoint `socket` inside the sandbox.
pub fn tracing_socket_mount(platform: Platform, socket: &str) -> Mount {
    match platform {
        Platform::Linux => Mount {
            destination: PathBuf::from(LINUX_TRACING_SOCKET),
            source: socket.to_string(),
            kind: "bind".into(),
            options: vec!["ro".into(), "rbind".into()],
        },
        Platform::Windows => Mount {
            destination: PathBuf::from(WINDOWS_TRACING_SOCKET.replace('/', "\\")),
            source: socket.to_string(),
            kind: String::new(),
            options: vec!["ro".into()],
        },
    }
}

/// Wire the tracing transport into the execution spec: mount plus endpoint env.
pub fn with_tracing_socket(platform: Platform, socket: &str) -> SpecOpt {
    let mount = tracing_socket_mount(platform, socket);
    let endpoint = format!("{}={}", TRACING_ENDPOINT_ENV, tracing_socket_uri(platform));
    opt(move |spec| {
        spec.mounts.push(mount);
        spec.process.env.push(endpoint);
        Ok(())
    })
}

/// Re-root `mount` at `sub_path` inside its source.
///
/// `..` components are clamped at the source root, so the result never
/// points outside the original mount.
pub fn sub_mount(mut mount: Mount, sub_path: &str) -> Mount {
    let root = PathBuf::from(&mount.source);
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(sub_path).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    let resolved = parts.iter().fold(root, |acc, part| acc.join(part));
    mount.source = resolved.to_string_lossy().into_owned();
    mount
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityTable;
    use crate::spec::IdMap;

    fn apply(opts: Vec<SpecOpt>) -> ExecutionSpec {
        let mut spec = ExecutionSpec::default();
        for o in opts {
            o(&mut spec).expect("modifier should apply");
        }
        spec
    }

    #[test]
    fn test_single_token_is_command_line() {
        let spec = apply(vec![with_process_args(vec!["echo hello && ls".into()])]);
        assert_eq!(
            spec.process.args,
            ProcessArgs::CommandLine("echo hello && ls".into())
        );
    }

    #[test]
    fn test_multiple_tokens_are_args() {
        let tokens: Vec<String> = vec!["ls".into(), "-la".into(), "/".into()];
        let spec = apply(vec![with_process_args(tokens.clone())]);
        assert_eq!(spec.process.args, ProcessArgs::Args(tokens));
    }

    #[test]
    fn test_insecure_rejected_on_windows() {
        let table = CapabilityTable::for_platform(Platform::Windows);
        let err = generate_security_opts(SecurityMode::Insecure, &table)
            .err()
            .expect("insecure should be rejected");
        assert_eq!(err.unsupported_capability(), Some(Capability::Insecure));
        assert_eq!(err.to_string(), "no support for insecure mode on windows");
    }

    #[test]
    fn test_sandbox_mode_is_noop_everywhere() {
        let table = CapabilityTable::for_platform(Platform::Windows);
        assert!(generate_security_opts(SecurityMode::Sandbox, &table)
            .unwrap()
            .is_empty());
        assert!(generate_process_mode_opts(ProcessMode::Sandbox, &table)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_each_gated_modifier_names_its_capability() {
        let table = CapabilityTable::for_platform(Platform::Windows);
        let mapping = IdentityMapping {
            uid_maps: vec![IdMap {
                container_id: 0,
                host_id: 100000,
                size: 65536,
            }],
            gid_maps: vec![],
        };
        let ulimits = vec![Ulimit {
            name: "nofile".into(),
            soft: 1024,
            hard: 1024,
        }];
        let devices = vec![DeviceRef {
            name: "vendor.com/gpu=0".into(),
            optional: false,
        }];

        let cases = [
            (
                generate_process_mode_opts(ProcessMode::NoSandbox, &table).err(),
                Capability::NoProcessSandbox,
            ),
            (
                generate_idmap_opts(Some(mapping), &table).err(),
                Capability::IdentityMapping,
            ),
            (
                generate_rlimit_opts(&ulimits, &table).err(),
                Capability::ResourceLimits,
            ),
            (
                generate_device_opts(devices, &table).err(),
                Capability::Devices,
            ),
        ];
        for (err, expected) in cases {
            let err = err.expect("should be rejected");
            assert_eq!(err.unsupported_capability(), Some(expected));
            assert!(err.to_string().contains(&expected.to_string()));
        }
    }

    #[test]
    fn test_empty_requests_are_noops_on_windows() {
        let table = CapabilityTable::for_platform(Platform::Windows);
        assert!(generate_idmap_opts(None, &table).unwrap().is_empty());
        assert!(generate_idmap_opts(Some(IdentityMapping::default()), &table)
            .unwrap()
            .is_empty());
        assert!(generate_rlimit_opts(&[], &table).unwrap().is_empty());
        assert!(generate_device_opts(Vec::new(), &table).unwrap().is_empty());
        assert!(generate_cgroup_namespace_opts(&table).is_empty());
    }

    #[test]
    fn test_linux_rlimits_applied() {
        let table = CapabilityTable::for_platform(Platform::Linux);
        let ulimits = vec![Ulimit {
            name: "nproc".into(),
            soft: 64,
            hard: 128,
        }];
        let spec = apply(generate_rlimit_opts(&ulimits, &table).unwrap());
        assert_eq!(spec.security.rlimits.len(), 1);
        assert_eq!(spec.security.rlimits[0].kind, "RLIMIT_NPROC");
    }

    #[test]
    fn test_linux_mounts_bind_resolv_and_hosts() {
        let spec = apply(generate_mount_opts(
            Platform::Linux,
            Some(Path::new("/run/stepbox/resolv.conf")),
            Some(Path::new("/run/stepbox/hosts")),
        ));
        assert_eq!(spec.mounts.len(), 2);
        assert_eq!(spec.mounts[0].destination, PathBuf::from("/etc/resolv.conf"));
        assert_eq!(spec.mounts[1].destination, PathBuf::from("/etc/hosts"));
        assert!(spec.mounts.iter().all(Mount::is_read_only));
    }

    #[test]
    fn test_windows_mounts_helper_binary() {
        let spec = apply(generate_mount_opts(Platform::Windows, None, None));
        assert_eq!(spec.mounts.len(), 1);
        assert_eq!(
            spec.mounts[0].destination,
            PathBuf::from(WINDOWS_USER_INFO_HELPER)
        );
        assert_eq!(spec.mounts[0].options, vec!["ro".to_string()]);
    }

    #[test]
    fn test_normalize_mount_type() {
        assert_eq!(normalize_mount_type(Platform::Windows, "bind"), "");
        assert_eq!(normalize_mount_type(Platform::Windows, ""), "");
        assert_eq!(normalize_mount_type(Platform::Linux, "bind"), "bind");
    }

    #[test]
    fn test_tracing_socket_addresses() {
        assert_eq!(
            tracing_socket_uri(Platform::Linux),
            "unix:///dev/otel-grpc.sock"
        );
        assert_eq!(
            tracing_socket_uri(Platform::Windows),
            "npipe:////./pipe/otel-grpc"
        );
        let mount = tracing_socket_mount(Platform::Windows, "\\\\.\\pipe\\host-otel");
        assert_eq!(mount.destination, PathBuf::from("\\\\.\\pipe\\otel-grpc"));
        assert!(mount.kind.is_empty());
    }

    #[test]
    fn test_with_tracing_socket_sets_env() {
        let spec = apply(vec![with_tracing_socket(
            Platform::Linux,
            "/run/buildkit/otel.sock",
        )]);
        assert_eq!(spec.mounts[0].source, "/run/buildkit/otel.sock");
        assert_eq!(
            spec.process.env,
            vec!["OTEL_EXPORTER_OTLP_ENDPOINT=unix:///dev/otel-grpc.sock".to_string()]
        );
    }

    #[test]
    fn test_sub_mount_clamps_parent_dirs() {
        let base = Mount {
            destination: PathBuf::from("/src"),
            source: "/var/lib/cache/ctx".into(),
            kind: "bind".into(),
            options: vec![],
        };
        let inner = sub_mount(base.clone(), "app/src");
        assert_eq!(inner.source, "/var/lib/cache/ctx/app/src");

        let escaped = sub_mount(base, "../../etc");
        assert_eq!(escaped.source, "/var/lib/cache/ctx/etc");
    }
}
