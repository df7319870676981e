//! Arbitrary data-channel traffic never wedges the demultiplexer

use std::sync::Arc;

use belawatch::codec::{encode_buffer_body, encode_buffer_header};
use belawatch::demux::{FrameDemultiplexer, ParseState};
use belawatch::{
    ConnectionMode, DenseBuffer, ParsedBuffer, Samples, TimestampMode, VarType, VariableDescriptor,
};
use proptest::prelude::*;

fn vars() -> Arc<[VariableDescriptor]> {
    vec![
        VariableDescriptor::new("pitch", VarType::Float32, TimestampMode::Dense),
        VariableDescriptor::new("note", VarType::Int32, TimestampMode::Sparse),
    ]
    .into()
}

fn valid_pair(ref_timestamp: u64) -> (Vec<u8>, Vec<u8>) {
    let n = VarType::Float32.data_length(TimestampMode::Dense);
    let data = Samples::Float32(vec![0.25; n]);
    let buffer = ParsedBuffer::Dense(DenseBuffer { ref_timestamp, data });
    let body = encode_buffer_body(&buffer, VarType::Float32).unwrap();
    (encode_buffer_header(0, VarType::Float32), body)
}

proptest! {
    #[test]
    fn garbage_then_a_valid_pair_still_decodes(
        garbage in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..16),
        ref_timestamp in any::<u64>(),
    ) {
        let mut demux = FrameDemultiplexer::new(vars(), ConnectionMode::Stream);
        for message in &garbage {
            let _ = demux.push(message);
        }

        let (header, body) = valid_pair(ref_timestamp);
        prop_assert!(demux.push(&header).unwrap().is_none());
        let out = demux.push(&body).unwrap().unwrap();
        prop_assert_eq!(out.name, "pitch");
        prop_assert_eq!(out.buffer.ref_timestamp(), ref_timestamp);
        prop_assert_eq!(demux.state(), ParseState::ExpectHeader);
    }

    #[test]
    fn faults_always_reset_to_expect_header(
        message in prop::collection::vec(any::<u8>(), 0..4200),
    ) {
        let mut demux = FrameDemultiplexer::new(vars(), ConnectionMode::Stream);
        demux.push(&encode_buffer_header(1, VarType::Int32)).unwrap();
        if demux.push(&message).is_err() {
            prop_assert_eq!(demux.state(), ParseState::ExpectHeader);
        }
    }
}
