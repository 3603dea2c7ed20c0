//! # stepbox-core
//!
//! Runs one sandboxed build step on the host and reclaims its storage.
//!
//! ## Lifecycle
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    stepbox-core (host)                   │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ExecutionSpec ──▶ host_command() ──▶ tokio Command      │
//! │                                            │             │
//! │                                            ▼             │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │   Supervisor    │────▶│   SupervisedProcess      │    │
//! │  │  - start()      │     │  exit watcher task       │    │
//! │  │  - run()        │     │  stop-race watcher task  │    │
//! │  └─────────────────┘     │  OutputLogs (stdout/err) │    │
//! │                          └──────────────────────────┘    │
//! │                                   │ release()            │
//! │                                   ▼                      │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │  MultiCloser    │────▶│  reclaim_layers()        │    │
//! │  │  (LIFO)         │     │  rm-N desc, then N desc  │    │
//! │  └─────────────────┘     └──────────────────────────┘    │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use stepbox_core::{host_command, reclaim_layers, LocalLayerDriver, OutputLogs, Supervisor};
//! use stepbox_spec::{CapabilityTable, SpecBuilder};
//!
//! # async fn example() -> stepbox_core::Result<()> {
//! let spec = SpecBuilder::new()
//!     .command(["make", "-j4"])
//!     .build(&CapabilityTable::current())?;
//!
//! let mut logs = OutputLogs::new();
//! let process = Supervisor::default().start(host_command(&spec)?, Some(&mut logs))?;
//! process.stopped().await;
//! process.release().await?;
//!
//! reclaim_layers("/var/lib/stepbox/layers".as_ref(), &LocalLayerDriver)?;
//! # Ok(())
//! # }
//! ```

mod closer;
mod config;
mod error;
mod host;
mod layers;
mod output;
mod supervisor;

pub use closer::MultiCloser;
pub use config::{SupervisorConfig, SupervisorConfigBuilder, DEFAULT_GRACE_PERIOD};
pub use error::{CoreError, Result};
pub use host::{host_command, lookup_binary};
pub use layers::{
    force_remove_all, reclaim_layers, DriverError, Layer, LayerDriver, LayerStack,
    LocalLayerDriver, TeardownStep, REMOVAL_PREFIX, SNAPSHOTTER_PLUGIN,
};
pub use output::{LockingWriter, OutputBuffer, OutputLogs};
#[cfg(unix)]
pub use supervisor::wait_socket;
pub use supervisor::{
    Latch, ProcessId, ProcessState, ProcessStats, SupervisedProcess, Supervisor,
};
