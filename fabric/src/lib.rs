//! Shared-memory dataflow fabric.
//!
//! Independent processes exchange samples through named *nodes*: one
//! POSIX shared-memory region per node, holding a control block and a
//! single payload slot. A node has exactly one writer ([`Sink`]) and any
//! number of readers ([`Source`]). The writer publishes a sample, every
//! attached reader observes it exactly once, and the slot returns to the
//! writer only after all readers have acknowledged.
//!
//! # Naming
//!
//! A node address `addr` (an ASCII string chosen on the command line) maps
//! to the shm object `/addr_node`. The control block sits at the start of
//! the region behind a small header; the payload slot begins at the first
//! 64-byte boundary past it. These offsets and the [`NODE_SUFFIX`] are
//! stable so unrelated processes on the same host interoperate.

use thiserror::Error;

pub mod component;
pub mod frame;
pub mod node;
pub mod record;
pub mod shm;
pub mod sink;
pub mod source;
pub mod sync;

pub use node::{NodeState, PayloadDescriptor, PayloadKind, PixelFormat};
pub use shm::ShmSafe;
pub use sink::Sink;
pub use source::Source;

/// Value stored in the region header once initialization is complete.
pub const MAGIC_VALUE: u32 = 0x51e4_0d17;

/// Suffix appended to a node address to form its shm object name.
pub const NODE_SUFFIX: &str = "_node";

/// Shm object name backing the node at `address`.
pub fn region_name(address: &str) -> String {
    format!("/{address}{NODE_SUFFIX}")
}

#[derive(Debug, Error)]
pub enum Error {
    /// A live sink is already bound to the node.
    #[error("address '{0}' already has a bound sink")]
    AddressInUse(String),

    #[error("no node exists at address '{0}'")]
    NotFound(String),

    #[error("timed out waiting for the node at address '{0}'")]
    Timeout(String),

    #[error("shared memory allocation failed for '{0}'")]
    AllocFailed(String, #[source] rustix::io::Errno),

    /// A peer died while holding the node lock. The node is now poisoned.
    #[error("a peer died while holding the node lock")]
    PeerDied,

    /// The node was marked unusable by an earlier peer death.
    #[error("node is poisoned")]
    Poisoned,

    /// The writer departed; no further samples will be published.
    #[error("end of stream")]
    EndOfStream,

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
}
