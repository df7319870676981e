//! Decoded buffer types

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::TimestampMode;

/// A single element value.
///
/// Deserialisation picks the first matching numeric representation, so values
/// read back from a saved file come back as `Int` or `Double`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i32),
    Double(f64),
    Float(f32),
    Char(u8),
}

impl Value {
    /// Numeric view of the value.
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::Int(v) => v as f64,
            Value::Double(v) => v,
            Value::Float(v) => v as f64,
            Value::Char(v) => v as f64,
        }
    }
}

/// The data elements of one buffer, stored in their native width.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Samples {
    Int32(Vec<i32>),
    Float64(Vec<f64>),
    Float32(Vec<f32>),
    Char(Vec<u8>),
}

impl Samples {
    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Samples::Int32(v) => v.len(),
            Samples::Float64(v) => v.len(),
            Samples::Float32(v) => v.len(),
            Samples::Char(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `index`.
    pub fn get(&self, index: usize) -> Option<Value> {
        match self {
            Samples::Int32(v) => v.get(index).copied().map(Value::Int),
            Samples::Float64(v) => v.get(index).copied().map(Value::Double),
            Samples::Float32(v) => v.get(index).copied().map(Value::Float),
            Samples::Char(v) => v.get(index).copied().map(Value::Char),
        }
    }

    /// All elements widened to `f64`.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            Samples::Int32(v) => v.iter().map(|&x| x as f64).collect(),
            Samples::Float64(v) => v.clone(),
            Samples::Float32(v) => v.iter().map(|&x| x as f64).collect(),
            Samples::Char(v) => v.iter().map(|&x| x as f64).collect(),
        }
    }
}

/// A buffer streamed with dense timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseBuffer {
    pub ref_timestamp: u64,
    pub data: Samples,
}

/// A buffer streamed with sparse timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseBuffer {
    pub ref_timestamp: u64,
    pub data: Samples,
    pub rel_timestamps: Vec<u32>,
}

/// One periodic sample of a monitored variable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonitorSample {
    pub timestamp: u64,
    pub value: Value,
}

/// A decoded data-channel body.
///
/// Serialises to the JSON shape used for saved data lines:
/// `{"ref_timestamp", "data"[, "rel_timestamps"]}` or `{"timestamp", "value"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParsedBuffer {
    Sparse(SparseBuffer),
    Dense(DenseBuffer),
    Monitor(MonitorSample),
}

impl ParsedBuffer {
    /// Reference timestamp (or sample timestamp for monitor samples).
    pub fn ref_timestamp(&self) -> u64 {
        match self {
            ParsedBuffer::Sparse(b) => b.ref_timestamp,
            ParsedBuffer::Dense(b) => b.ref_timestamp,
            ParsedBuffer::Monitor(s) => s.timestamp,
        }
    }

    /// Data elements, if this is a bulk buffer.
    pub fn samples(&self) -> Option<&Samples> {
        match self {
            ParsedBuffer::Sparse(b) => Some(&b.data),
            ParsedBuffer::Dense(b) => Some(&b.data),
            ParsedBuffer::Monitor(_) => None,
        }
    }

    /// The monitor sample, if this is one.
    pub fn as_monitor(&self) -> Option<&MonitorSample> {
        match self {
            ParsedBuffer::Monitor(s) => Some(s),
            _ => None,
        }
    }

    /// Number of values carried.
    pub fn len(&self) -> usize {
        self.samples().map_or(1, Samples::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Timestamp mode implied by the layout, if any.
    pub fn timestamp_mode(&self) -> Option<TimestampMode> {
        match self {
            ParsedBuffer::Sparse(_) => Some(TimestampMode::Sparse),
            ParsedBuffer::Dense(_) => Some(TimestampMode::Dense),
            ParsedBuffer::Monitor(_) => None,
        }
    }

    /// Absolute timestamp of every element.
    pub fn absolute_timestamps(&self) -> Vec<u64> {
        match self {
            ParsedBuffer::Dense(b) => {
                (0..b.data.len() as u64).map(|i| b.ref_timestamp + i).collect()
            }
            ParsedBuffer::Sparse(b) => {
                b.rel_timestamps.iter().map(|&rel| b.ref_timestamp + rel as u64).collect()
            }
            ParsedBuffer::Monitor(s) => vec![s.timestamp],
        }
    }

    /// Values widened to `f64`.
    pub fn values_f64(&self) -> Vec<f64> {
        match self {
            ParsedBuffer::Monitor(s) => vec![s.value.as_f64()],
            other => other.samples().map(Samples::to_f64_vec).unwrap_or_default(),
        }
    }
}

/// A decoded buffer tagged with the variable it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferEvent {
    pub name: String,
    pub buffer: Arc<ParsedBuffer>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_json_shape() {
        let buffer = ParsedBuffer::Dense(DenseBuffer {
            ref_timestamp: 10,
            data: Samples::Int32(vec![1, 2, 3]),
        });
        let json = serde_json::to_string(&buffer).unwrap();
        assert_eq!(json, r#"{"ref_timestamp":10,"data":[1,2,3]}"#);

        let back: ParsedBuffer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, buffer);
    }

    #[test]
    fn sparse_and_monitor_shapes_are_distinguished() {
        let sparse: ParsedBuffer =
            serde_json::from_str(r#"{"ref_timestamp":5,"data":[0.5,1.5],"rel_timestamps":[0,7]}"#)
                .unwrap();
        assert_eq!(sparse.timestamp_mode(), Some(TimestampMode::Sparse));
        assert_eq!(sparse.absolute_timestamps(), vec![5, 12]);

        let sample: ParsedBuffer = serde_json::from_str(r#"{"timestamp":99,"value":3}"#).unwrap();
        assert_eq!(sample.as_monitor().map(|s| s.value), Some(Value::Int(3)));
        assert_eq!(sample.len(), 1);
    }

    #[test]
    fn dense_timestamps_are_implicit() {
        let buffer = ParsedBuffer::Dense(DenseBuffer {
            ref_timestamp: 1000,
            data: Samples::Float32(vec![0.0; 4]),
        });
        assert_eq!(buffer.absolute_timestamps(), vec![1000, 1001, 1002, 1003]);
    }

    #[test]
    fn events_serialize_with_their_variable() {
        let event = BufferEvent {
            name: "gain".into(),
            buffer: Arc::new(ParsedBuffer::Monitor(MonitorSample {
                timestamp: 7,
                value: Value::Int(2),
            })),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"name":"gain","buffer":{"timestamp":7,"value":2}}"#);
    }
}
