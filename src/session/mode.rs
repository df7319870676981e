//! Session mode

use serde::Serialize;

/// What the current session is doing.
///
/// `Off` is both the initial and the terminal state of every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamingMode {
    #[default]
    Off,
    /// Until explicitly stopped
    Forever,
    /// Until every requested variable has delivered its quota
    NValues,
    /// Device-scheduled start and duration per variable
    Schedule,
    /// One monitor sample per variable, then stop
    Peek,
}

impl StreamingMode {
    pub fn is_active(self) -> bool {
        self != StreamingMode::Off
    }
}

impl std::fmt::Display for StreamingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            StreamingMode::Off => "OFF",
            StreamingMode::Forever => "FOREVER",
            StreamingMode::NValues => "N_VALUES",
            StreamingMode::Schedule => "SCHEDULE",
            StreamingMode::Peek => "PEEK",
        };
        f.write_str(text)
    }
}
