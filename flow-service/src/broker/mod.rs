//! Broker seam.
//!
//! The scheduler never talks to a broker transport directly. It declares the
//! [`Topology`] through [`Broker::ensure_declared`] and hands outbound
//! messages to [`Broker::publish`]. Two local implementations ship here:
//!
//! - [`InMemoryBroker`] records declarations and published messages (tests,
//!   embedding)
//! - [`JsonLinesBroker`] writes each published message as one JSON line to an
//!   async writer (the `studyflow process` command)

pub mod memory;
pub mod stream;
pub mod topology;

use async_trait::async_trait;

use crate::scheduler::messages::OutboundMessage;

pub use memory::InMemoryBroker;
pub use stream::JsonLinesBroker;
pub use topology::{EventSource, ExchangeDeclaration, QueueDeclaration, Topology};

/// Errors raised by broker implementations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// A declaration disagrees with what the broker already holds.
    #[error("{kind} '{name}' already declared with different settings: {detail}")]
    Conflict {
        kind: &'static str,
        name: String,
        detail: String,
    },

    /// The topology itself is unusable.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Publish to an exchange that was never declared.
    #[error("exchange '{0}' is not declared")]
    UndeclaredExchange(String),

    /// Message priority above what the target queue accepts.
    #[error("priority {priority} exceeds queue maximum {max}")]
    PriorityOutOfRange { priority: u8, max: u8 },

    /// Transport I/O failure.
    #[error("broker i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("broker lock poisoned")]
    LockPoisoned,
}

impl BrokerError {
    /// Whether redelivering the inbound message may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Io(_) | BrokerError::LockPoisoned)
    }
}

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Message broker as seen by the scheduler.
///
/// Implementations must be `Send + Sync`; several scheduler tasks may share
/// one broker handle.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare every exchange and queue of `topology`.
    ///
    /// Safe to call any number of times from any number of replicas.
    /// Implementations must consult the broker's own state, not a local
    /// "already declared" flag, and must fail with
    /// [`BrokerError::Conflict`] when an existing declaration differs.
    async fn ensure_declared(&self, topology: &Topology) -> BrokerResult<()>;

    /// Publish one message.
    async fn publish(&self, message: &OutboundMessage) -> BrokerResult<()>;
}
