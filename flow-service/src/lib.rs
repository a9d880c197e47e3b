// Study Flow Scheduler Library
// Flow validation, durable per-study state, and idempotent job dispatch

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod flow;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use error::{ServiceError, ServiceResult};

// Re-export flow types
pub use flow::{
    Flow, FlowGraph, FlowParser, FlowValidator, GraphError, GraphErrorKind, LoadError, Model,
    ParseError, ParseErrorKind, ValidatedFlow,
};

// Re-export store types
pub use store::{FlowInstance, FlowStatus, JobInstance, JobStatus, SqliteStore, Store, StoreError};

// Re-export scheduler types
pub use broker::{Broker, BrokerError, InMemoryBroker, JsonLinesBroker, Topology};
pub use config::SchedulerConfig;
pub use dispatch::{Claim, DispatchGuard};
pub use scheduler::{
    Delivery, InboundMessage, OutboundMessage, Scheduler, SchedulerEvent, SchedulerService,
};
