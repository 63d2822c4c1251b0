//! Application configuration.
//!
//! Loaded from a TOML file, overridable from the CLI, validated once at
//! startup. Everything here is immutable for the process lifetime.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use crate::error::ControllerError;
use crate::util::absolutize;

/// Environment variable consulted when `cloud_credentials_file` is unset
pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Root directory for all controller state
    pub data_dir: PathBuf,

    /// Service-account credentials for the cloud provider.
    /// Falls back to $GOOGLE_APPLICATION_CREDENTIALS when unset.
    #[serde(default)]
    pub cloud_credentials_file: Option<PathBuf>,

    /// Seconds to wait after bootstrap before the first reconciliation tick
    #[serde(default = "default_initial_delay")]
    pub initial_delay: u64,

    /// Seconds between reconciliation ticks
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    /// HTTP bind address for the node-facing API
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Config overlay applied to every node, between the user overlay and
    /// the built-in skeleton
    #[serde(default = "default_global_config")]
    pub node_config_global: Value,
}

fn default_initial_delay() -> u64 {
    600
}

fn default_check_interval() -> u64 {
    120
}

fn default_listen_addr() -> SocketAddr {
    ([0, 0, 0, 0], 8080).into()
}

fn default_global_config() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cloud_credentials_file: None,
            initial_delay: default_initial_delay(),
            check_interval: default_check_interval(),
            listen_addr: default_listen_addr(),
            node_config_global: default_global_config(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ControllerError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| ControllerError::ConfigInvalid(e.to_string()))
    }

    /// Validate and normalize: absolute `data_dir`, resolved credentials
    /// file. Fatal at process start on any violation.
    pub fn validate(&mut self) -> Result<(), ControllerError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ControllerError::ConfigInvalid(
                "data_dir must not be empty".to_string(),
            ));
        }
        self.data_dir = absolutize(&self.data_dir);

        let credentials = match self.cloud_credentials_file.take() {
            Some(path) => path,
            None => std::env::var_os(CREDENTIALS_ENV)
                .map(PathBuf::from)
                .ok_or_else(|| {
                    ControllerError::ConfigInvalid(format!(
                        "cloud_credentials_file is unset and ${CREDENTIALS_ENV} is empty"
                    ))
                })?,
        };
        let credentials = absolutize(&credentials);
        if !credentials.is_file() {
            return Err(ControllerError::ConfigInvalid(format!(
                "cloud credentials file {} does not exist",
                credentials.display()
            )));
        }
        self.cloud_credentials_file = Some(credentials);

        if !self.node_config_global.is_object() {
            return Err(ControllerError::ConfigInvalid(
                "node_config_global must be a table".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolved credentials path; only meaningful after `validate()`
    pub fn credentials_file(&self) -> &Path {
        self.cloud_credentials_file
            .as_deref()
            .unwrap_or_else(|| Path::new(""))
    }

    pub fn nodes_data_dir(&self) -> PathBuf {
        self.data_dir.join("nodes")
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.data_dir.join("templates")
    }
}
