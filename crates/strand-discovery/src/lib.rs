//! # strand Discovery
//!
//! Path and peer bookkeeping for the strand overlay.
//!
//! This crate provides:
//! - [`path`]: path identifiers, path metadata and path lifecycle events
//! - [`registry::PathRegistry`]: the concurrent per-peer path table used to
//!   pick the transport for every outbound send
//! - [`filter::DuplicatePathEventFilter`]: suppression of repeated identical
//!   path events per peer
//! - [`guard::SuperPeerTimeoutGuard`]: fails node startup when no super peer
//!   confirms registration in time
//! - [`intra::IntraProcessHub`]: explicit process-wide registry for nodes that
//!   share one process
//! - [`portmap`]: NAT port mapping strategies and the cycler that tries them
//!   in order
//!
//! ## Path selection
//!
//! ```text
//!   outbound send
//!        │
//!        ▼
//! ┌──────────────────┐  best path (lowest priority,   ┌───────────────┐
//! │   PathRegistry   │─────────────────────────────▶│ direct / intra │
//! │   (DashMap)      │  ties: most recently seen)     └───────────────┘
//! └────────┬─────────┘
//!          │ no path for peer
//!          ▼
//! ┌──────────────────┐
//! │ default route via│
//! │ super peer       │
//! └──────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod filter;
pub mod guard;
pub mod intra;
pub mod path;
pub mod portmap;
pub mod registry;

pub use error::DiscoveryError;
pub use filter::DuplicatePathEventFilter;
pub use guard::{GuardCanceller, SuperPeerTimeoutGuard};
pub use intra::{HubEvent, HubMembership, IntraDatagram, IntraProcessHub};
pub use path::{Path, PathEvent, PathId};
pub use portmap::{
    MappingLease, NatPmpMapping, PcpMapping, PortMapError, PortMapper, PortMapping,
};
pub use registry::{PathRegistry, RegistryStats, Route};
