//! Buffer body layouts

use super::read_u64_le;
use crate::types::{
    ConnectionMode, DenseBuffer, MonitorSample, ParsedBuffer, REL_TIMESTAMP_SIZE, Samples,
    SparseBuffer, TIMESTAMP_SIZE, TimestampMode, Value, VarType,
};
use crate::{Result, WatcherError};

/// Decode a data-channel (or log-file) body.
///
/// On the STREAM, LOG and WATCH slots the body is a full buffer of
/// `var_type.data_length(timestamp_mode)` elements; any bytes past the exact
/// layout size are padding and are ignored. On the MONITOR slot the body is a
/// single `uint64 timestamp || value` sample.
pub fn decode_buffer_body(
    bytes: &[u8],
    var_type: VarType,
    timestamp_mode: TimestampMode,
    mode: ConnectionMode,
) -> Result<ParsedBuffer> {
    if mode.carries_samples() {
        return decode_monitor_sample(bytes, var_type);
    }

    let expected = var_type.body_size(timestamp_mode);
    if bytes.len() < expected {
        return Err(WatcherError::protocol(
            "Buffer body",
            format!(
                "truncated {timestamp_mode} '{var_type}' body: need {expected} bytes, got {}",
                bytes.len()
            ),
        ));
    }
    let body = &bytes[..expected];

    let n = var_type.data_length(timestamp_mode);
    let data_end = TIMESTAMP_SIZE + n * var_type.byte_width();
    let ref_timestamp = read_u64_le(body, 0)?;
    let data = decode_samples(&body[TIMESTAMP_SIZE..data_end], var_type);

    Ok(match timestamp_mode {
        TimestampMode::Dense => ParsedBuffer::Dense(DenseBuffer { ref_timestamp, data }),
        TimestampMode::Sparse => {
            let rel_timestamps = body[data_end..]
                .chunks_exact(REL_TIMESTAMP_SIZE)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            ParsedBuffer::Sparse(SparseBuffer { ref_timestamp, data, rel_timestamps })
        }
    })
}

fn decode_monitor_sample(bytes: &[u8], var_type: VarType) -> Result<ParsedBuffer> {
    let needed = TIMESTAMP_SIZE + var_type.byte_width();
    if bytes.len() < needed {
        return Err(WatcherError::protocol(
            "Monitor body",
            format!("need at least {needed} bytes for a '{var_type}' sample, got {}", bytes.len()),
        ));
    }
    let timestamp = read_u64_le(bytes, 0)?;
    let value = decode_samples(&bytes[TIMESTAMP_SIZE..needed], var_type)
        .get(0)
        .ok_or_else(|| WatcherError::protocol("Monitor body", "empty sample"))?;
    Ok(ParsedBuffer::Monitor(MonitorSample { timestamp, value }))
}

fn decode_samples(bytes: &[u8], var_type: VarType) -> Samples {
    let lanes = bytes.chunks_exact(var_type.byte_width());
    match var_type {
        VarType::Int32 | VarType::UInt32AsInt32 => {
            Samples::Int32(lanes.map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect())
        }
        VarType::Float32 => {
            Samples::Float32(lanes.map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect())
        }
        VarType::Float64 => Samples::Float64(
            lanes
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        ),
        // the character sits in the low byte of its 8-byte lane
        VarType::Char8 => Samples::Char(lanes.map(|c| c[0]).collect()),
    }
}

/// Encode a buffer in the layout [`decode_buffer_body`] reads.
///
/// Used by tests and device simulators. Bulk buffers are written with exactly
/// as many elements as they carry.
pub fn encode_buffer_body(buffer: &ParsedBuffer, var_type: VarType) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(TIMESTAMP_SIZE + buffer.len() * (var_type.byte_width() + 4));
    out.extend_from_slice(&buffer.ref_timestamp().to_le_bytes());
    match buffer {
        ParsedBuffer::Dense(b) => encode_samples(&mut out, &b.data, var_type)?,
        ParsedBuffer::Sparse(b) => {
            encode_samples(&mut out, &b.data, var_type)?;
            for rel in &b.rel_timestamps {
                out.extend_from_slice(&rel.to_le_bytes());
            }
        }
        ParsedBuffer::Monitor(s) => encode_value(&mut out, s.value, var_type)?,
    }
    Ok(out)
}

fn encode_samples(out: &mut Vec<u8>, samples: &Samples, var_type: VarType) -> Result<()> {
    (0..samples.len())
        .filter_map(|i| samples.get(i))
        .try_for_each(|v| encode_value(out, v, var_type))
}

fn encode_value(out: &mut Vec<u8>, value: Value, var_type: VarType) -> Result<()> {
    match (var_type, value) {
        (VarType::Int32 | VarType::UInt32AsInt32, Value::Int(v)) => {
            out.extend_from_slice(&v.to_le_bytes())
        }
        (VarType::Float32, Value::Float(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (VarType::Float64, Value::Double(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (VarType::Char8, Value::Char(v)) => {
            let mut lane = [0u8; 8];
            lane[0] = v;
            out.extend_from_slice(&lane);
        }
        (ty, v) => {
            return Err(WatcherError::invalid_argument(format!(
                "value {v:?} cannot be encoded as '{ty}'"
            )));
        }
    }
    Ok(())
}
