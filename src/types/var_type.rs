//! Watcher variable type definitions

use serde::{Deserialize, Serialize};

use crate::{Result, WatcherError};

/// Element type of a watcher variable.
///
/// Decoded once from the single-character tag the device uses (`i`, `j`,
/// `f`, `d`, `c`) and carried as data from then on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarType {
    /// 32-bit signed integer (`i`)
    #[serde(rename = "i")]
    Int32,
    /// 32-bit unsigned integer (`j`), decoded as a signed 32-bit integer
    #[serde(rename = "j")]
    UInt32AsInt32,
    /// 32-bit float (`f`)
    #[serde(rename = "f")]
    Float32,
    /// 64-bit float (`d`)
    #[serde(rename = "d")]
    Float64,
    /// Character (`c`), framed in 8-byte lanes on the data channel
    #[serde(rename = "c")]
    Char8,
}

/// How element timestamps are carried in a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TimestampMode {
    /// Element `i` happened at `ref_timestamp + i`.
    Dense,
    /// Each element carries its own offset from `ref_timestamp`.
    Sparse,
}

impl TryFrom<u8> for TimestampMode {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(TimestampMode::Dense),
            1 => Ok(TimestampMode::Sparse),
            other => Err(format!("unknown timestamp mode {other}")),
        }
    }
}

impl From<TimestampMode> for u8 {
    fn from(mode: TimestampMode) -> Self {
        match mode {
            TimestampMode::Dense => 0,
            TimestampMode::Sparse => 1,
        }
    }
}

impl std::fmt::Display for TimestampMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimestampMode::Dense => f.write_str("dense"),
            TimestampMode::Sparse => f.write_str("sparse"),
        }
    }
}

/// Size in bytes of the `uint64` reference timestamp that leads every body.
pub const TIMESTAMP_SIZE: usize = 8;

/// Size in bytes of one sparse relative timestamp.
pub const REL_TIMESTAMP_SIZE: usize = 4;

impl VarType {
    /// All supported types.
    pub const ALL: [VarType; 5] = [
        VarType::Int32,
        VarType::UInt32AsInt32,
        VarType::Float32,
        VarType::Float64,
        VarType::Char8,
    ];

    /// Decode a wire type tag.
    pub fn from_tag(tag: char) -> Result<Self> {
        match tag {
            'i' => Ok(VarType::Int32),
            'j' => Ok(VarType::UInt32AsInt32),
            'f' => Ok(VarType::Float32),
            'd' => Ok(VarType::Float64),
            'c' => Ok(VarType::Char8),
            other => Err(WatcherError::UnsupportedType { tag: other }),
        }
    }

    /// The wire type tag.
    pub const fn tag(self) -> char {
        match self {
            VarType::Int32 => 'i',
            VarType::UInt32AsInt32 => 'j',
            VarType::Float32 => 'f',
            VarType::Float64 => 'd',
            VarType::Char8 => 'c',
        }
    }

    /// Width in bytes of one element inside a data-channel or log-file body.
    ///
    /// `c` shares the 8-byte width of `d`; the device frames both identically.
    pub const fn byte_width(self) -> usize {
        match self {
            VarType::Int32 | VarType::UInt32AsInt32 | VarType::Float32 => 4,
            VarType::Float64 | VarType::Char8 => 8,
        }
    }

    /// Width in bytes of one element in a host-to-device send buffer.
    pub const fn packed_width(self) -> usize {
        match self {
            VarType::Char8 => 1,
            other => other.byte_width(),
        }
    }

    /// Number of elements in one buffer of this type.
    ///
    /// Fixed by the device's frame allocation.
    pub const fn data_length(self, mode: TimestampMode) -> usize {
        match (mode, self.byte_width()) {
            (TimestampMode::Dense, 4) => 1024,
            (TimestampMode::Dense, _) => 512,
            (TimestampMode::Sparse, 4) => 512,
            (TimestampMode::Sparse, _) => 341,
        }
    }

    /// Exact number of meaningful bytes in a streamed body.
    pub const fn body_size(self, mode: TimestampMode) -> usize {
        let n = self.data_length(mode);
        match mode {
            TimestampMode::Dense => TIMESTAMP_SIZE + n * self.byte_width(),
            TimestampMode::Sparse => {
                TIMESTAMP_SIZE + n * self.byte_width() + n * REL_TIMESTAMP_SIZE
            }
        }
    }

    /// Size of one buffer as stored in an on-device log file, padding included.
    pub const fn buffer_size(self, mode: TimestampMode) -> usize {
        match (mode, self.byte_width()) {
            (TimestampMode::Sparse, 8) => self.body_size(mode) + 4,
            _ => self.body_size(mode),
        }
    }
}

impl std::fmt::Display for VarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn data_length_table() {
        use TimestampMode::*;
        for ty in [VarType::Int32, VarType::UInt32AsInt32, VarType::Float32] {
            assert_eq!(ty.data_length(Dense), 1024);
            assert_eq!(ty.data_length(Sparse), 512);
        }
        for ty in [VarType::Float64, VarType::Char8] {
            assert_eq!(ty.data_length(Dense), 512);
            assert_eq!(ty.data_length(Sparse), 341);
        }
    }

    #[test]
    fn log_buffers_are_all_4104_bytes() {
        for ty in VarType::ALL {
            assert_eq!(ty.buffer_size(TimestampMode::Dense), 4104, "{ty:?} dense");
            assert_eq!(ty.buffer_size(TimestampMode::Sparse), 4104, "{ty:?} sparse");
        }
        assert_eq!(VarType::Float64.body_size(TimestampMode::Sparse), 4100);
    }

    #[test]
    fn unsupported_tag_is_rejected() {
        assert!(matches!(VarType::from_tag('x'), Err(WatcherError::UnsupportedType { tag: 'x' })));
    }

    #[test]
    fn serde_uses_wire_tags() {
        let json = serde_json::to_string(&VarType::UInt32AsInt32).unwrap();
        assert_eq!(json, "\"j\"");
        let back: VarType = serde_json::from_str("\"d\"").unwrap();
        assert_eq!(back, VarType::Float64);

        let mode: TimestampMode = serde_json::from_str("1").unwrap();
        assert_eq!(mode, TimestampMode::Sparse);
        assert!(serde_json::from_str::<TimestampMode>("7").is_err());
    }

    proptest! {
        #[test]
        fn tags_round_trip(ty in prop::sample::select(VarType::ALL.to_vec())) {
            prop_assert_eq!(VarType::from_tag(ty.tag()).unwrap(), ty);
            prop_assert!(ty.byte_width() == 4 || ty.byte_width() == 8);
        }
    }
}
