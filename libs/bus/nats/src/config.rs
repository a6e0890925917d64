//! NATS connection settings. Auth is optional and either credential pair
//! style (user + password) or token style, mirroring what the server
//! accepts.

use bus_core::BusError;
use serde::{Deserialize, Serialize};

/// Connection configuration for the subject adapter.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NatsConfig {
    /// Server URLs to connect to; may carry credentials in the URL
    pub servers: Vec<String>,

    /// Optional authentication with `password`
    pub user: Option<String>,

    /// Optional authentication with `user`
    pub password: Option<String>,

    /// Optional token authentication
    pub token: Option<String>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            user: None,
            password: None,
            token: None,
        }
    }
}

impl NatsConfig {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), BusError> {
        if self.servers.is_empty() {
            return Err(BusError::Config(
                "at least one NATS server URL is required".to_string(),
            ));
        }

        if self.user.is_some() != self.password.is_some() {
            return Err(BusError::Config(
                "user and password must be provided together".to_string(),
            ));
        }

        Ok(())
    }
}
