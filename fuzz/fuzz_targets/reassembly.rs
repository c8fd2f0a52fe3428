//! Fuzz target for chunk reassembly
//!
//! Any sequence of chunks must leave the buffer within its bounds.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use std::time::Instant;
use strand_core::{Chunk, ChunkConfig, ChunkReassemblyBuffer};

#[derive(Debug, Arbitrary)]
struct Input {
    last: bool,
    id: u8,
    field: u16,
    payload: Vec<u8>,
}

fuzz_target!(|inputs: Vec<Input>| {
    let config = ChunkConfig {
        max_content_length: 4096,
        max_chunks: 64,
        ..ChunkConfig::default()
    };
    let mut buffer = ChunkReassemblyBuffer::new(&config);
    let now = Instant::now();
    for input in inputs {
        let field = u32::from(input.field);
        let chunk = if input.last {
            Chunk::Last { id: input.id, total: field, payload: input.payload }
        } else {
            Chunk::Content { id: input.id, seq: field, payload: input.payload }
        };
        if buffer.push(chunk, now).is_err() {
            assert!(buffer.is_empty());
        }
        assert!(buffer.buffered_bytes() <= config.max_content_length);
    }
});
