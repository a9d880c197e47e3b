// Scheduler Events
// Progress reporting for flow admission, dispatch and completion

use crate::scheduler::messages::QueueClass;
use crate::store::JobStatus;

use tokio::sync::mpsc;

/// Sender for scheduler progress events
pub type ProgressSender = mpsc::UnboundedSender<SchedulerEvent>;

/// Receiver for scheduler progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<SchedulerEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted while the scheduler handles messages
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// A new flow instance was created with one job per model
    FlowAdmitted {
        flow_instance_id: String,
        flow_name: String,
        jobs: usize,
    },

    /// A flow-arrived message for an existing instance was absorbed
    FlowDuplicate { flow_instance_id: String },

    /// The flow failed structural validation; nothing was stored
    FlowRejected {
        flow_instance_id: String,
        rule: Option<u8>,
        reason: String,
    },

    /// A job was claimed and its dispatch message produced
    JobDispatched {
        flow_instance_id: String,
        job_id: i64,
        model_name: String,
        queue: QueueClass,
        priority: u8,
    },

    /// A job-result moved a job to a terminal status
    JobCompleted {
        flow_instance_id: String,
        job_id: i64,
        model_name: String,
        status: JobStatus,
    },

    /// The destination port was bound and flow-finished produced
    FlowFinished {
        flow_instance_id: String,
        flow_name: String,
    },

    /// A message was acknowledged without effect
    MessageIgnored { reason: String },
}

impl SchedulerEvent {
    pub fn flow_admitted(id: impl Into<String>, flow_name: impl Into<String>, jobs: usize) -> Self {
        Self::FlowAdmitted {
            flow_instance_id: id.into(),
            flow_name: flow_name.into(),
            jobs,
        }
    }

    pub fn flow_rejected(id: impl Into<String>, rule: Option<u8>, reason: impl Into<String>) -> Self {
        Self::FlowRejected {
            flow_instance_id: id.into(),
            rule,
            reason: reason.into(),
        }
    }

    pub fn flow_finished(id: impl Into<String>, flow_name: impl Into<String>) -> Self {
        Self::FlowFinished {
            flow_instance_id: id.into(),
            flow_name: flow_name.into(),
        }
    }

    pub fn ignored(reason: impl Into<String>) -> Self {
        Self::MessageIgnored {
            reason: reason.into(),
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: SchedulerEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: SchedulerEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: SchedulerEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(SchedulerEvent::flow_admitted("study-1", "chest-ct", 3));
        tx.send_event(SchedulerEvent::flow_finished("study-1", "chest-ct"));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, SchedulerEvent::FlowAdmitted { jobs: 3, .. }));

        let second = rx.recv().await.unwrap();
        assert_eq!(second, SchedulerEvent::flow_finished("study-1", "chest-ct"));
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (tx, rx) = progress_channel();
        drop(rx);
        // Should not panic
        tx.send_event(SchedulerEvent::ignored("closed"));
    }

    #[test]
    fn test_optional_sender() {
        let sender: Option<ProgressSender> = None;
        sender.send_event(SchedulerEvent::ignored("no listener"));
    }
}
