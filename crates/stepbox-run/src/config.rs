//! Configuration for the step runner.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;
use stepbox_core::DEFAULT_GRACE_PERIOD;
use stepbox_spec::{Platform, ProcessMode, SecurityMode};

/// Configuration for one step run.
#[derive(Debug, Clone)]
pub struct StepboxConfig {
    /// Platform whose capability table gates the execution spec (default: host).
    pub platform: Platform,

    /// Grace window between SIGTERM and a forced kill (default: 20s).
    pub grace_period: Duration,

    /// Security mode requested for the step (default: sandbox).
    pub security_mode: SecurityMode,

    /// Process isolation mode (default: sandbox).
    pub process_mode: ProcessMode,

    /// Host tracing socket to expose inside the sandbox.
    pub tracing_socket: Option<String>,

    /// Layer root reclaimed after the step.
    pub layer_root: Option<PathBuf>,

    /// Where to write the assembled spec as JSON.
    pub spec_out: Option<PathBuf>,

    /// Capture stdout/stderr instead of inheriting them (default: false).
    pub capture_output: bool,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("grace period must be greater than zero")]
    ZeroGracePeriod,

    #[error("spec output directory not found: {0}")]
    InvalidSpecOut(PathBuf),
}

impl Default for StepboxConfig {
    fn default() -> Self {
        Self {
            platform: Platform::current(),
            grace_period: DEFAULT_GRACE_PERIOD,
            security_mode: SecurityMode::Sandbox,
            process_mode: ProcessMode::Sandbox,
            tracing_socket: None,
            layer_root: None,
            spec_out: None,
            capture_output: false,
        }
    }
}

impl StepboxConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `STEPBOX_PLATFORM` | host platform (`linux`, `windows`) |
    /// | `STEPBOX_GRACE_PERIOD_SECS` | `20` |
    /// | `STEPBOX_SECURITY` | `sandbox` (`sandbox`, `insecure`) |
    /// | `STEPBOX_PROCESS_MODE` | `sandbox` (`sandbox`, `no-sandbox`) |
    /// | `STEPBOX_TRACING_SOCKET` | unset |
    /// | `STEPBOX_LAYER_ROOT` | unset |
    /// | `STEPBOX_SPEC_OUT` | unset |
    /// | `STEPBOX_CAPTURE_OUTPUT` | `false` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();

        Self {
            platform: lookup("STEPBOX_PLATFORM")
                .and_then(|v| match v.parse() {
                    Ok(platform) => Some(platform),
                    Err(e) => {
                        tracing::warn!(error = %e, "Ignoring STEPBOX_PLATFORM");
                        None
                    }
                })
                .unwrap_or(default.platform),
            grace_period: lookup("STEPBOX_GRACE_PERIOD_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.grace_period),
            security_mode: lookup("STEPBOX_SECURITY")
                .map(|v| parse_security_mode(&v))
                .unwrap_or(default.security_mode),
            process_mode: lookup("STEPBOX_PROCESS_MODE")
                .map(|v| parse_process_mode(&v))
                .unwrap_or(default.process_mode),
            tracing_socket: lookup("STEPBOX_TRACING_SOCKET").filter(|v| !v.is_empty()),
            layer_root: lookup("STEPBOX_LAYER_ROOT")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            spec_out: lookup("STEPBOX_SPEC_OUT")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            capture_output: lookup("STEPBOX_CAPTURE_OUTPUT")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(default.capture_output),
        }
    }

    /// Validate settings that would make the run fail later.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grace_period.is_zero() {
            return Err(ConfigError::ZeroGracePeriod);
        }

        if let Some(parent) = self.spec_out.as_ref().and_then(|p| p.parent()) {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(ConfigError::InvalidSpecOut(parent.to_path_buf()));
            }
        }

        Ok(())
    }

    /// Log warnings for settings that are legal but probably unintended.
    pub fn validate_warn(&self) {
        if self.platform != Platform::current() {
            tracing::warn!(
                platform = %self.platform,
                host = %Platform::current(),
                "Assembling spec for a different platform than the host"
            );
        }

        if let Some(root) = &self.layer_root {
            if !root.exists() {
                tracing::warn!("Layer root not found: {:?}", root);
            }
        }
    }
}

/// Parse a security mode (case-insensitive); unknown values mean sandbox.
fn parse_security_mode(s: &str) -> SecurityMode {
    match s.to_lowercase().as_str() {
        "insecure" => SecurityMode::Insecure,
        _ => SecurityMode::Sandbox,
    }
}

/// Parse a process mode (case-insensitive); unknown values mean sandbox.
fn parse_process_mode(s: &str) -> ProcessMode {
    match s.to_lowercase().as_str() {
        "no-sandbox" | "nosandbox" | "none" => ProcessMode::NoSandbox,
        _ => ProcessMode::Sandbox,
    }
}
