//! Test fixtures

mod overlay;

pub use overlay::{OverlayFixture, PendingNode, quiet_config, wait_for_event};
