//! Running an execution spec directly on the host.

use crate::error::{CoreError, Result};
use std::env;
use std::path::{Path, PathBuf};
use stepbox_spec::{ExecutionSpec, ProcessArgs};
use tokio::process::Command;

/// Render the process part of `spec` into a command for the host.
///
/// An argument vector runs its first element with the rest as arguments. A
/// single command line goes through the platform shell. Environment entries
/// (`KEY=VALUE`) and the working directory are applied on top of the
/// inherited environment.
pub fn host_command(spec: &ExecutionSpec) -> Result<Command> {
    let mut cmd = match &spec.process.args {
        ProcessArgs::Args(args) => {
            let (program, rest) = args.split_first().ok_or(CoreError::EmptyCommand)?;
            let mut cmd = Command::new(program);
            cmd.args(rest);
            cmd
        }
        ProcessArgs::CommandLine(line) => shell_command(line),
    };

    for entry in &spec.process.env {
        match entry.split_once('=') {
            Some((key, value)) => cmd.env(key, value),
            None => cmd.env(entry, ""),
        };
    }
    if let Some(cwd) = &spec.process.cwd {
        cmd.current_dir(cwd);
    }
    Ok(cmd)
}

#[cfg(windows)]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.args(["/S", "/C", line]);
    cmd
}

#[cfg(not(windows))]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", line]);
    cmd
}

/// Find `name` on `PATH`.
///
/// Names containing a path separator are checked as given.
pub fn lookup_binary(name: &str) -> Result<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return if is_executable(candidate) {
            Ok(candidate.to_path_buf())
        } else {
            Err(CoreError::Requirements(name.to_string()))
        };
    }

    let path = env::var_os("PATH").unwrap_or_default();
    env::split_paths(&path)
        .flat_map(|dir| executable_names(name).map(move |n| dir.join(n)))
        .find(|p| is_executable(p))
        .inspect(|p| tracing::debug!(binary = name, path = %p.display(), "Found binary"))
        .ok_or_else(|| CoreError::Requirements(name.to_string()))
}

#[cfg(windows)]
fn executable_names(name: &str) -> impl Iterator<Item = String> {
    [name.to_string(), format!("{name}.exe")].into_iter()
}

#[cfg(not(windows))]
fn executable_names(name: &str) -> impl Iterator<Item = String> {
    std::iter::once(name.to_string())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
