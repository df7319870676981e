//! Host-to-device send buffers

use super::read_u32_le;
use crate::types::{Samples, VarType};
use crate::{Result, WatcherError};

/// `<u32 id><4-byte type tag><u32 length><4 bytes padding>`
pub const OUTBOUND_HEADER_SIZE: usize = 16;

/// A typed buffer pushed from the host to the device.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundBuffer {
    pub id: u32,
    pub var_type: VarType,
    pub values: Samples,
}

/// Pack an outbound buffer.
///
/// Exactly `length` values are packed; `values` must carry at least that
/// many elements of the matching representation. Characters are packed one
/// byte each.
pub fn encode_outbound_buffer(
    id: u32,
    var_type: VarType,
    length: u32,
    values: &Samples,
) -> Result<Vec<u8>> {
    let n = length as usize;
    if values.len() < n {
        return Err(WatcherError::invalid_argument(format!(
            "outbound buffer {id} declares {n} values but only {} were given",
            values.len()
        )));
    }

    let mut out = Vec::with_capacity(OUTBOUND_HEADER_SIZE + n * var_type.packed_width());
    out.extend_from_slice(&id.to_le_bytes());
    let mut tag = [0u8; 4];
    tag[0] = var_type.tag() as u8;
    out.extend_from_slice(&tag);
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);

    match (var_type, values) {
        (VarType::Int32 | VarType::UInt32AsInt32, Samples::Int32(v)) => {
            v[..n].iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes()))
        }
        (VarType::Float32, Samples::Float32(v)) => {
            v[..n].iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes()))
        }
        (VarType::Float64, Samples::Float64(v)) => {
            v[..n].iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes()))
        }
        (VarType::Char8, Samples::Char(v)) => out.extend_from_slice(&v[..n]),
        // widen from whatever the caller had to hand
        (ty, other) => {
            let widened = other.to_f64_vec();
            for &x in &widened[..n] {
                match ty {
                    VarType::Int32 | VarType::UInt32AsInt32 => {
                        out.extend_from_slice(&(x as i32).to_le_bytes())
                    }
                    VarType::Float32 => out.extend_from_slice(&(x as f32).to_le_bytes()),
                    VarType::Float64 => out.extend_from_slice(&x.to_le_bytes()),
                    VarType::Char8 => out.push(x as u8),
                }
            }
        }
    }
    Ok(out)
}

/// Unpack a buffer produced by [`encode_outbound_buffer`].
pub fn decode_outbound_buffer(bytes: &[u8]) -> Result<OutboundBuffer> {
    let id = read_u32_le(bytes, 0)?;
    let tag = bytes
        .get(4..8)
        .and_then(|t| t.iter().find(|b| **b != 0 && **b != b' '))
        .map(|&b| b as char)
        .ok_or_else(|| WatcherError::protocol("Outbound buffer", "missing type tag"))?;
    let var_type = VarType::from_tag(tag)?;
    let n = read_u32_le(bytes, 8)? as usize;

    let width = var_type.packed_width();
    let payload = bytes.get(OUTBOUND_HEADER_SIZE..OUTBOUND_HEADER_SIZE + n * width).ok_or_else(|| {
        let got = bytes.len().saturating_sub(OUTBOUND_HEADER_SIZE);
        WatcherError::protocol(
            "Outbound buffer",
            format!("need {} payload bytes for {n} values, got {got}", n * width),
        )
    })?;

    let lanes = payload.chunks_exact(width);
    let values = match var_type {
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
        VarType::Char8 => Samples::Char(payload.to_vec()),
    };
    Ok(OutboundBuffer { id, var_type, values })
}
