//! Fuzz target for segment parsing and handling
//!
//! Arbitrary bytes fed to a listening and an established connection must
//! never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::time::Instant;
use strand_core::{ConnectionConfig, ReliableConnection, Role, Segment};

fuzz_target!(|data: &[u8]| {
    let Some(segment) = Segment::decode(data) else {
        return;
    };
    assert_eq!(Segment::decode(&segment.encode()), Some(segment.clone()));

    let now = Instant::now();
    let mut passive = ReliableConnection::new(Role::Passive, ConnectionConfig::default());
    passive.open(now);
    passive.handle_segment(segment.clone(), now);
    while passive.poll_transmit().is_some() {}

    let mut active = ReliableConnection::new(Role::Active, ConnectionConfig::default());
    active.open(now);
    active.handle_segment(segment, now);
    while active.poll_transmit().is_some() {}
    while active.poll_event().is_some() {}
});
