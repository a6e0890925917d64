//! # Bus Configuration
//!
//! Core configuration shared by every adapter: module identity, the RPC
//! timeout window, the flush trade-off, and dead-letter naming. Broker
//! connection settings live with the adapter that needs them
//! (`bus-nats::NatsConfig`, `bus-amqp::AmqpConfig`).

use crate::BusError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Core bus settings, independent of the broker in use.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    /// Module name; derives the default queue/subject names and the
    /// response destination
    pub module_name: String,

    /// Default RPC reply window in milliseconds. Always explicit here so no
    /// magic number leaks into the public contract.
    pub default_rpc_timeout_ms: u64,

    /// Flush the broker client after every publish. Durability-leaning
    /// default; disable to trade confirmation for throughput.
    pub flush_after_publish: bool,

    /// Override for the dead-letter destination name
    pub dead_letter_destination: Option<String>,

    /// Relax exclusivity/durability of auto-provisioned resources so test
    /// runs are repeatable
    pub test_mode: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            module_name: "bus".to_string(),
            default_rpc_timeout_ms: 1_000,
            flush_after_publish: true,
            dead_letter_destination: None,
            test_mode: false,
        }
    }
}

impl BusConfig {
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, BusError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| BusError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&contents)
            .map_err(|e| BusError::Config(format!("Failed to parse config: {e}")))
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), BusError> {
        if self.module_name.is_empty() {
            return Err(BusError::Config("module_name must not be empty".to_string()));
        }

        if self.default_rpc_timeout_ms == 0 {
            return Err(BusError::Config(
                "default_rpc_timeout_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.default_rpc_timeout_ms)
    }

    /// Response destination owned by one transport instance, unique per
    /// instance so concurrent copies of a module never steal replies.
    pub fn response_destination(&self, instance_id: &str) -> String {
        format!("{}-response-{}", self.module_name, instance_id)
    }

    /// Dead-letter destination: the configured override or the module
    /// default.
    pub fn dead_letter_name(&self) -> String {
        self.dead_letter_destination
            .clone()
            .unwrap_or_else(|| format!("{}-failed-messages", self.module_name))
    }
}
