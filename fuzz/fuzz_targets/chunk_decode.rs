//! Fuzz target for chunk decoding
//!
//! The codec must never panic, and anything it accepts must re-encode to the
//! same bytes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use strand_core::{ChunkCodec, Decoded, SequenceWidth};

fuzz_target!(|data: &[u8]| {
    for width in [SequenceWidth::One, SequenceWidth::Two, SequenceWidth::Three] {
        let codec = ChunkCodec::new(width);
        match codec.decode(data.to_vec()) {
            Decoded::Chunk(chunk) => {
                let encoded = codec.encode(&chunk).expect("decoded chunk re-encodes");
                assert_eq!(encoded, data);
            }
            Decoded::PassThrough(bytes) => assert_eq!(bytes, data),
        }
    }
});
