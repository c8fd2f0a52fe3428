//! Property-based tests for strand
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Chunking Properties
// ============================================================================

mod chunk_properties {
    use super::*;
    use std::time::{Duration, Instant};
    use strand_core::chunk::assemble;
    use strand_core::{
        Chunk, ChunkCodec, ChunkConfig, ChunkReassemblyBuffer, ChunkSplitter, Decoded, Error,
        SequenceWidth,
    };

    fn width(bytes: u8) -> SequenceWidth {
        SequenceWidth::from_bytes(bytes).unwrap()
    }

    proptest! {
        /// Any permutation of a message's chunks reassembles the original payload
        #[test]
        fn reassembly_in_any_order(
            payload in prop::collection::vec(any::<u8>(), 1..8192),
            chunk_payload in 16usize..512,
            seed in any::<u64>(),
        ) {
            let config = ChunkConfig {
                max_chunk_payload: chunk_payload,
                ..ChunkConfig::default()
            };
            let codec = ChunkCodec::new(config.sequence_width);
            let mut records = ChunkSplitter::new(&config).split(&payload).unwrap();

            // Deterministic shuffle from the seed
            let mut state = seed | 1;
            for i in (1..records.len()).rev() {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let j = (state % (i as u64 + 1)) as usize;
                records.swap(i, j);
            }

            let mut buffer = ChunkReassemblyBuffer::new(&config);
            let now = Instant::now();
            let mut emitted = None;
            for record in records {
                match codec.decode(record) {
                    Decoded::Chunk(chunk) => {
                        prop_assert!(emitted.is_none(), "emitted before the last record");
                        emitted = buffer.push(chunk, now).unwrap();
                    }
                    Decoded::PassThrough(bytes) => emitted = Some(vec![Chunk::Last {
                        id: 0,
                        total: 0,
                        payload: bytes,
                    }]),
                }
            }

            let chunks = emitted.expect("message completed");
            let (last, content) = chunks.split_last().unwrap();
            prop_assert!(last.is_last());
            for (i, chunk) in content.iter().enumerate() {
                let in_place = matches!(chunk, Chunk::Content { seq, .. } if *seq == i as u32);
                prop_assert!(in_place, "chunk {} out of place", i);
            }
            prop_assert_eq!(assemble(chunks), payload);
            prop_assert!(buffer.is_empty());
        }

        /// Decoding an encoded chunk yields the same chunk for every width
        #[test]
        fn codec_preserves_fields(
            id in any::<u8>(),
            seq in 0u32..255,
            last in any::<bool>(),
            width_bytes in 1u8..=3,
            payload in prop::collection::vec(any::<u8>(), 0..256),
        ) {
            let codec = ChunkCodec::new(width(width_bytes));
            let chunk = if last {
                Chunk::Last { id, total: seq, payload }
            } else {
                Chunk::Content { id, seq, payload }
            };
            let encoded = codec.encode(&chunk).unwrap();
            prop_assert_eq!(encoded.len(), codec.header_len() + chunk.payload().len());
            prop_assert_eq!(codec.decode(encoded), Decoded::Chunk(chunk));
        }

        /// Buffers without a chunk magic always pass through untouched
        #[test]
        fn unknown_magic_passes_through(
            bytes in prop::collection::vec(any::<u8>(), 0..64)
                .prop_filter("not a chunk", |b| !ChunkCodec::is_chunk(b)),
        ) {
            let codec = ChunkCodec::default();
            prop_assert_eq!(codec.decode(bytes.clone()), Decoded::PassThrough(bytes));
        }

        /// Exceeding the content length fails and leaves the buffer reusable
        #[test]
        fn content_bound_enforced(
            chunk_len in 100usize..400,
            count in 3u32..10,
        ) {
            let config = ChunkConfig {
                max_content_length: chunk_len * 2,
                max_chunk_payload: chunk_len,
                timeout: Duration::from_secs(5),
                ..ChunkConfig::default()
            };
            let mut buffer = ChunkReassemblyBuffer::new(&config);
            let now = Instant::now();

            let mut failure = None;
            for seq in 0..count {
                let chunk = Chunk::Content { id: 1, seq, payload: vec![0; chunk_len] };
                if let Err(e) = buffer.push(chunk, now) {
                    failure = Some(e);
                    break;
                }
            }
            prop_assert!(matches!(failure, Some(Error::FrameTooLarge(_))));
            prop_assert!(buffer.is_empty());
            prop_assert_eq!(buffer.next_deadline(), None);

            let fresh = buffer
                .push(Chunk::Last { id: 1, total: 0, payload: vec![7] }, now)
                .unwrap();
            prop_assert_eq!(fresh.map(assemble), Some(vec![7]));
        }

        /// Discarding any number of times is harmless
        #[test]
        fn discard_is_idempotent(times in 1usize..5, buffered in 0u32..4) {
            let config = ChunkConfig::default();
            let mut buffer = ChunkReassemblyBuffer::new(&config);
            let now = Instant::now();
            for seq in 0..buffered {
                buffer.push(Chunk::Content { id: 9, seq, payload: vec![1] }, now).unwrap();
            }
            for _ in 0..times {
                buffer.discard();
                prop_assert!(buffer.is_empty());
                prop_assert_eq!(buffer.buffered_bytes(), 0);
            }
            prop_assert!(!buffer.poll_timeout(now + Duration::from_secs(3600)));
        }
    }
}

// ============================================================================
// Reliable Connection Properties
// ============================================================================

mod connection_properties {
    use super::*;
    use std::time::{Duration, Instant};
    use strand_core::{
        ConnectionConfig, ConnectionEvent, ConnectionState, ReliableConnection, Role, Segment,
    };

    /// Move segments between the two ends, dropping those `lose` selects
    fn run(
        a: &mut ReliableConnection,
        b: &mut ReliableConnection,
        now: &mut Instant,
        mut lose: impl FnMut() -> bool,
        rounds: usize,
    ) -> Vec<Vec<u8>> {
        let mut delivered = Vec::new();
        for _ in 0..rounds {
            let mut moved = false;
            while let Some(segment) = a.poll_transmit() {
                moved = true;
                if !lose() {
                    b.handle_segment(Segment::decode(&segment.encode()).unwrap(), *now);
                }
            }
            while let Some(segment) = b.poll_transmit() {
                moved = true;
                if !lose() {
                    a.handle_segment(Segment::decode(&segment.encode()).unwrap(), *now);
                }
            }
            while let Some(record) = b.read() {
                delivered.push(record);
            }
            if !moved {
                let deadline = [a.next_deadline(), b.next_deadline()]
                    .into_iter()
                    .flatten()
                    .min();
                match deadline {
                    Some(deadline) => {
                        *now = deadline.max(*now);
                        a.poll_timeout(*now);
                        b.poll_timeout(*now);
                    }
                    None => break,
                }
            }
        }
        delivered
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Records arrive whole, in order and without gaps despite loss
        #[test]
        fn records_delivered_in_order(
            records in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..3000), 1..8),
            loss_pattern in prop::collection::vec(any::<bool>(), 32),
        ) {
            let config = ConnectionConfig {
                user_timeout: Duration::from_secs(3600),
                data_retries: 64,
                syn_retries: 64,
                ..ConnectionConfig::default()
            };
            let mut now = Instant::now();
            let mut a = ReliableConnection::new(Role::Active, config.clone());
            let mut b = ReliableConnection::new(Role::Passive, config);
            a.open(now);
            b.open(now);
            for record in &records {
                a.write(record.clone(), now).unwrap();
            }

            // Lose segments following the pattern, then nothing.
            let mut step = 0;
            let lose = move || {
                step += 1;
                loss_pattern.get(step - 1).copied().unwrap_or(false)
            };
            let delivered = run(&mut a, &mut b, &mut now, lose, 10_000);
            prop_assert_eq!(delivered, records);
            prop_assert_eq!(a.state(), ConnectionState::Established);
            prop_assert!(!a.has_pending_data());
        }

        /// An unanswered handshake fails exactly once, after a bounded number of SYNs
        #[test]
        fn handshake_failure_is_bounded(syn_retries in 0u32..8) {
            let config = ConnectionConfig {
                syn_retries,
                ..ConnectionConfig::default()
            };
            let mut now = Instant::now();
            let mut a = ReliableConnection::new(Role::Active, config);
            a.open(now);

            let mut syns = 0;
            let mut failures = 0;
            for _ in 0..1000 {
                while a.poll_transmit().is_some() {
                    syns += 1;
                }
                while let Some(event) = a.poll_event() {
                    if matches!(event, ConnectionEvent::Failed(_)) {
                        failures += 1;
                    }
                }
                match a.next_deadline() {
                    Some(deadline) => {
                        now = deadline.max(now);
                        a.poll_timeout(now);
                    }
                    None => break,
                }
            }
            prop_assert_eq!(failures, 1);
            prop_assert_eq!(syns, syn_retries + 1);
            prop_assert!(a.is_closed());
        }
    }
}

// ============================================================================
// Path Event Filter Properties
// ============================================================================

mod filter_properties {
    use super::*;
    use strand_crypto::PeerAddress;
    use strand_discovery::{DuplicatePathEventFilter, PathEvent, PathId};

    fn event(peer: u8, variant: u8) -> PathEvent {
        let peer = PeerAddress::from_bytes([peer; 32]);
        match variant % 3 {
            0 => PathEvent::PeerAdded {
                peer,
                path: PathId::Direct,
                endpoint: None,
            },
            1 => PathEvent::PeerRemoved {
                peer,
                path: PathId::Direct,
            },
            _ => PathEvent::SuperPeerAdded {
                peer,
                path: PathId::Relay,
                endpoint: None,
            },
        }
    }

    proptest! {
        /// An event is emitted exactly when it differs from the previous one for its peer
        #[test]
        fn emits_only_on_change(
            sequence in prop::collection::vec((0u8..3, 0u8..3), 0..64),
        ) {
            let filter = DuplicatePathEventFilter::new();
            let mut last: std::collections::HashMap<u8, PathEvent> = Default::default();
            for (peer, variant) in sequence {
                let event = event(peer, variant);
                let expected = last.get(&peer) != Some(&event);
                prop_assert_eq!(filter.should_emit(&event), expected);
                last.insert(peer, event);
            }
        }

        /// Repeating one event emits it once
        #[test]
        fn repeats_collapse(times in 1usize..20, variant in 0u8..3) {
            let filter = DuplicatePathEventFilter::new();
            let emitted = (0..times)
                .filter(|_| filter.should_emit(&event(1, variant)))
                .count();
            prop_assert_eq!(emitted, 1);
        }
    }
}
