//! Control-channel JSON messages

use serde::{Deserialize, Serialize};

use crate::types::{TimestampMode, VarType, VariableDescriptor};
use crate::{Result, WatcherError};

/// A request envelope: `{"watcher": [<command>, ...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatcherRequest {
    pub watcher: Vec<WatcherCommand>,
}

impl WatcherRequest {
    pub fn new(commands: impl IntoIterator<Item = WatcherCommand>) -> Self {
        Self { watcher: commands.into_iter().collect() }
    }

    pub fn single(command: WatcherCommand) -> Self {
        Self { watcher: vec![command] }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|source| WatcherError::Serialization {
            context: "watcher request".into(),
            source,
        })
    }
}

/// One watcher command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum WatcherCommand {
    List,
    Watch {
        watchers: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamps: Option<Vec<u64>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        durations: Option<Vec<u64>>,
    },
    Unwatch {
        watchers: Vec<String>,
    },
    /// A period of 0 stops monitoring that variable.
    Monitor {
        watchers: Vec<String>,
        periods: Vec<u32>,
    },
    Log {
        watchers: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamps: Option<Vec<u64>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        durations: Option<Vec<u64>>,
    },
    Unlog {
        watchers: Vec<String>,
    },
}

impl WatcherCommand {
    pub fn watch(watchers: Vec<String>) -> Self {
        WatcherCommand::Watch { watchers, timestamps: None, durations: None }
    }

    pub fn watch_scheduled(
        watchers: Vec<String>,
        timestamps: Vec<u64>,
        durations: Vec<u64>,
    ) -> Self {
        WatcherCommand::Watch { watchers, timestamps: Some(timestamps), durations: Some(durations) }
    }

    pub fn log(watchers: Vec<String>, timestamps: Vec<u64>, durations: Vec<u64>) -> Self {
        WatcherCommand::Log { watchers, timestamps: Some(timestamps), durations: Some(durations) }
    }

    /// Monitor command with every period set to 0.
    pub fn unmonitor(watchers: Vec<String>) -> Self {
        let periods = vec![0; watchers.len()];
        WatcherCommand::Monitor { watchers, periods }
    }
}

/// Connection handshake events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ConnectionEvent {
    /// Sent by the device when the control channel opens
    Connection {
        #[serde(rename = "projectName")]
        project_name: String,
    },
    /// The host's acknowledgement
    ConnectionReply,
}

/// One variable entry of a list response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VarType,
    pub timestamp_mode: TimestampMode,
    #[serde(default)]
    pub watched: bool,
    #[serde(default)]
    pub controlled: bool,
    #[serde(default)]
    pub logged: bool,
    /// Monitoring period in milliseconds, 0 when not monitored
    #[serde(default)]
    pub monitor: u32,
    #[serde(default)]
    pub log_file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl WatcherEntry {
    pub fn descriptor(&self) -> VariableDescriptor {
        VariableDescriptor {
            monitor: self.monitor,
            ..VariableDescriptor::new(&self.name, self.var_type, self.timestamp_mode)
        }
    }
}

/// Response to a `list` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub sample_rate: f64,
    /// Device clock at the time of the query, in audio frames
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub watchers: Vec<WatcherEntry>,
}

impl ListResponse {
    pub fn entry(&self, name: &str) -> Option<&WatcherEntry> {
        self.watchers.iter().find(|w| w.name == name)
    }
}

/// Response to a `log` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogResponse {
    pub log_file_name: String,
}

/// A classified inbound control message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Connection { project_name: String },
    List(ListResponse),
    Log(LogResponse),
    /// Anything else the device sends (acknowledgements, control values)
    Other(serde_json::Value),
}

/// Parse and classify one control-channel text message.
pub fn parse_control_message(text: &str) -> Result<ControlMessage> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|source| WatcherError::Serialization {
            context: "control message".into(),
            source,
        })?;

    if value.get("event").and_then(|e| e.as_str()) == Some("connection") {
        let event: ConnectionEvent = from_value(value, "connection event")?;
        if let ConnectionEvent::Connection { project_name } = event {
            return Ok(ControlMessage::Connection { project_name });
        }
        return Err(WatcherError::protocol("Control message", "unexpected connection event"));
    }

    let watcher = value.get("watcher").filter(|w| w.is_object());
    match watcher {
        Some(w) if w.get("sampleRate").is_some() => {
            Ok(ControlMessage::List(from_value(w.clone(), "list response")?))
        }
        Some(w) if w.get("logFileName").is_some() => {
            Ok(ControlMessage::Log(from_value(w.clone(), "log response")?))
        }
        _ => Ok(ControlMessage::Other(value)),
    }
}

fn from_value<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
    context: &str,
) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|source| WatcherError::Serialization { context: context.into(), source })
}
