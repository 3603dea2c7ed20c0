//! Supervisor configuration types.

use crate::error::CoreError;
use std::time::Duration;

/// Time a process gets to exit after SIGTERM before it is killed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(20);

/// Configuration for supervising a process.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Grace window between the termination signal and a forced kill
    /// (default: 20 seconds).
    pub grace_period: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl SupervisorConfig {
    /// Create a new config builder.
    pub fn builder() -> SupervisorConfigBuilder {
        SupervisorConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.grace_period.is_zero() {
            return Err(CoreError::Config("grace_period must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for SupervisorConfig.
#[derive(Debug, Default)]
pub struct SupervisorConfigBuilder {
    config: SupervisorConfig,
}

impl SupervisorConfigBuilder {
    /// Set the grace period.
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.config.grace_period = grace;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<SupervisorConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
