//! # stepbox-spec
//!
//! Assembles the execution spec of a sandboxed build step from composable,
//! platform-gated modifiers.
//!
//! ## Pipeline
//!
//! ```text
//!   SpecBuilder ──▶ modifiers() ──▶ [command, mounts, security, process mode,
//!        │              │             identity map, rlimits, devices, ...]
//!        │              │ asks
//!        │              ▼
//!        │     CapabilityRegistry (per-platform table)
//!        ▼
//!   build() ──▶ ExecutionSpec ──▶ container runtime
//! ```
//!
//! A request for a feature the platform lacks fails the whole build with
//! [`SpecError::Unsupported`], naming the capability. No partial spec is
//! ever returned.

mod builder;
mod capability;
mod error;
pub mod modifier;
mod spec;

pub use builder::SpecBuilder;
pub use capability::{Capability, CapabilityRegistry, CapabilityTable, Platform};
pub use error::{Result, SpecError};
pub use modifier::{normalize_mount_type, sub_mount, tracing_socket_uri, SpecOpt};
pub use spec::{
    DeviceRef, ExecutionSpec, IdMap, IdentityMapping, Mount, Process, ProcessArgs, ProcessMode,
    Rlimit, SecurityAttributes, SecurityMode, Ulimit,
};
