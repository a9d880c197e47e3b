// Scheduler Module
// Message shapes, progress events, the dispatch engine and its broker binding

pub mod engine;
pub mod events;
pub mod messages;
pub mod service;

pub use engine::{Admission, ResultOutcome, Scheduler};
pub use events::{progress_channel, EventSender, ProgressReceiver, ProgressSender, SchedulerEvent};
pub use messages::{
    FlowArrived, FlowFinished, InboundMessage, JobDispatch, JobResult, Outbound,
    OutboundMessage, QueueClass, ResultStatus,
};
pub use service::{Delivery, SchedulerService};
