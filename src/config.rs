//! Link configuration
//!
//! Every field has a default matching a device reached over USB networking,
//! so `LinkConfig::default()` is enough for the common case. Configurations
//! can also be loaded from YAML:
//!
//! ```rust
//! use belawatch::LinkConfig;
//!
//! let yaml = "ip: bela.local\nstreaming_buffers_queue_length: 64\n";
//! let config = LinkConfig::from_yaml_str(yaml).unwrap();
//! assert_eq!(config.control_url(), "ws://bela.local:5555/gui_control");
//! assert_eq!(config.port, 5555);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, WatcherError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Device address. Use `bela.local` when networking over mDNS.
    pub ip: String,
    pub port: u16,
    /// Data endpoint path
    pub data_add: String,
    /// Control endpoint path
    pub control_add: String,
    pub connect_timeout_ms: u64,
    /// Bound on list-query round trips
    pub response_timeout_ms: u64,
    /// Per-variable queue capacity for streaming sessions
    pub streaming_buffers_queue_length: usize,
    /// Per-variable queue capacity for monitor sessions
    pub monitor_queue_length: usize,
    pub schedule_poll_interval_ms: u64,
    pub block_callback_timeout_ms: u64,
    /// Parent directory of the device's project folders
    pub remote_projects_dir: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ip: "192.168.7.2".into(),
            port: 5555,
            data_add: "gui_data".into(),
            control_add: "gui_control".into(),
            connect_timeout_ms: 5000,
            response_timeout_ms: 5000,
            streaming_buffers_queue_length: 1000,
            monitor_queue_length: 2000,
            schedule_poll_interval_ms: 100,
            block_callback_timeout_ms: 1000,
            remote_projects_dir: "/root/Bela/projects".into(),
        }
    }
}

impl LinkConfig {
    pub fn new(ip: impl Into<String>) -> Self {
        Self { ip: ip.into(), ..Self::default() }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)
            .map_err(|e| WatcherError::Config { details: format!("invalid YAML: {e}") })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| WatcherError::Config {
            details: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |details: &str| Err(WatcherError::Config { details: details.to_string() });
        if self.ip.trim().is_empty() {
            return invalid("ip must not be empty");
        }
        if self.port == 0 {
            return invalid("port must be non-zero");
        }
        if self.data_add.is_empty() || self.control_add.is_empty() {
            return invalid("endpoint names must not be empty");
        }
        if self.streaming_buffers_queue_length == 0 || self.monitor_queue_length == 0 {
            return invalid("queue lengths must be at least 1");
        }
        if self.connect_timeout_ms == 0
            || self.response_timeout_ms == 0
            || self.schedule_poll_interval_ms == 0
            || self.block_callback_timeout_ms == 0
        {
            return invalid("timeouts and intervals must be non-zero");
        }
        Ok(())
    }

    /// Endpoint identity used for mode-slot bookkeeping.
    pub fn endpoint(&self) -> String {
        self.control_url()
    }

    pub fn control_url(&self) -> String {
        format!("ws://{}:{}/{}", self.ip, self.port, self.control_add)
    }

    pub fn data_url(&self) -> String {
        format!("ws://{}:{}/{}", self.ip, self.port, self.data_add)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn schedule_poll_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_poll_interval_ms)
    }

    pub fn block_callback_timeout(&self) -> Duration {
        Duration::from_millis(self.block_callback_timeout_ms)
    }

    /// Absolute path of a file inside the connected project's folder.
    pub fn remote_project_path(&self, project: &str, file: &str) -> String {
        format!("{}/{}/{}", self.remote_projects_dir.trim_end_matches('/'), project, file)
    }
}
