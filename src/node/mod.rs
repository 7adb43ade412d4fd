//! # Node Module
//!
//! Client for the pool of external audio-processing backend nodes.
//!
//! The nodes do the actual decoding and streaming; this module only controls
//! and queries them:
//!
//! ### [`protocol`] - Wire Types
//! - Load-result and stats payloads, filter bodies, pushed events
//! - Query source detection (direct URL, `platform:` prefix, bare search)
//!
//! ### [`transport`] - Transport Seam
//! - `NodeTransport` trait: connect/resume, search, stats, player updates
//! - REST implementation over `reqwest`, mockable in tests
//!
//! ### [`client`] - Pool Management
//! - Partial-failure tolerant connect (at least one node must come up)
//! - Load/region based selection with an active-node overload switch
//! - 30s health polling with unhealthy marking and bounded reconnects

pub mod client;
pub mod protocol;
pub mod transport;

pub use client::{ManagedNode, NodeClient, NodeStats};
pub use protocol::{FilterPayload, LoadResult, NodeEvent, PlayerOp, WireEndReason};
pub use transport::{NodeTransport, RestTransport};
