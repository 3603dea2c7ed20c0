//! Stepbox step runner entry point.
//!
//! Assembles the execution spec for one build step, runs it on the host
//! under supervision and reclaims the step's layers afterwards.
//!
//! ```text
//! stepbox-run make -j4            # argument vector
//! stepbox-run "make -j4 && ls"    # single token: run as a command line
//! ```
//!
//! Ctrl-C stops the step gracefully (SIGTERM, then kill after the grace
//! period).

mod config;

use anyhow::Context;
use config::StepboxConfig;
use stepbox_core::{
    host_command, reclaim_layers, Latch, LocalLayerDriver, MultiCloser, OutputLogs, Supervisor,
    SupervisorConfig,
};
use stepbox_spec::{CapabilityTable, SpecBuilder};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so the step owns stdout
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("stepbox_run=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = StepboxConfig::from_env();
    tracing::debug!(?config, "Configuration loaded");
    config.validate_warn();
    config.validate()?;

    let tokens: Vec<String> = std::env::args().skip(1).collect();
    if tokens.is_empty() {
        anyhow::bail!("usage: stepbox-run <command> [args...]");
    }

    // Assemble the execution spec against the configured platform
    let registry = CapabilityTable::for_platform(config.platform);
    let mut builder = SpecBuilder::new()
        .command(tokens)
        .security_mode(config.security_mode)
        .process_mode(config.process_mode);
    if let Some(socket) = &config.tracing_socket {
        builder = builder.tracing_socket(socket.clone());
    }
    let spec = builder
        .build(&registry)
        .context("failed to assemble execution spec")?;

    if let Some(path) = &config.spec_out {
        std::fs::write(path, spec.to_json()?)
            .with_context(|| format!("failed to write spec to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Wrote execution spec");
    }

    let mut closer = MultiCloser::new();
    if let Some(root) = config.layer_root.clone() {
        closer.append(move || async move {
            tokio::task::spawn_blocking(move || reclaim_layers(&root, &LocalLayerDriver)).await?
        });
    }

    // Ctrl-C cancels the step
    let cancel = Latch::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                tracing::info!("Received shutdown signal, stopping step...");
                cancel.fire();
            }
        });
    }

    let supervisor = Supervisor::new(
        SupervisorConfig::builder()
            .grace_period(config.grace_period)
            .build()?,
    )
    .with_cancellation(cancel);

    let mut logs = OutputLogs::new();
    let capture = if config.capture_output {
        Some(&mut logs)
    } else {
        None
    };

    let outcome: stepbox_core::Result<()> = async {
        let process = supervisor.start(host_command(&spec)?, capture)?;
        process.stopped().await;
        tracing::info!(
            process_id = %process.id(),
            exit_code = ?process.exit_code(),
            term_signals = process.stats().term_signals(),
            killed = process.stats().killed(),
            "Step finished"
        );
        process.release().await
    }
    .await;

    for (key, buffer) in logs.iter() {
        eprintln!("==> {key}");
        eprint!("{}", buffer.to_string_lossy());
    }

    // Layers are reclaimed even when the step failed
    let closed = closer.close().await;

    outcome.context("step failed")?;
    closed.context("failed to reclaim layers")?;

    tracing::info!("Step complete");
    Ok(())
}
