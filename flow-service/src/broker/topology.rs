// Broker Topology
// Exchange, routing key and queue names shared by every scheduler replica

use crate::scheduler::messages::QueueClass;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Which inbound stream a message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    FlowArrived,
    JobResult,
}

/// A topic exchange to declare
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: String,
}

/// A durable queue bound to one routing key of one exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDeclaration {
    pub name: String,
    pub exchange: String,
    pub routing_key: String,
    /// Set for priority queues
    pub max_priority: Option<u8>,
}

/// Names used on the broker. Loaded from config; every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topology {
    /// Exchange carrying flow-arrived and flow-finished
    pub flows_exchange: String,
    /// Exchange carrying job-dispatch and job-result
    pub jobs_exchange: String,
    pub flow_arrived_key: String,
    pub flow_finished_key: String,
    pub job_result_key: String,
    pub dispatch_cpu_key: String,
    pub dispatch_gpu_key: String,
    /// Highest priority the dispatch queues accept
    pub max_priority: u8,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            flows_exchange: "flows".to_string(),
            jobs_exchange: "jobs".to_string(),
            flow_arrived_key: "flow.arrived".to_string(),
            flow_finished_key: "flow.finished".to_string(),
            job_result_key: "job.result".to_string(),
            dispatch_cpu_key: "job.dispatch.cpu".to_string(),
            dispatch_gpu_key: "job.dispatch.gpu".to_string(),
            max_priority: 5,
        }
    }
}

impl Topology {
    /// Map an inbound (exchange, routing key) pair to the stream it belongs to
    pub fn classify(&self, exchange: &str, routing_key: &str) -> Option<EventSource> {
        if exchange == self.flows_exchange && routing_key == self.flow_arrived_key {
            Some(EventSource::FlowArrived)
        } else if exchange == self.jobs_exchange && routing_key == self.job_result_key {
            Some(EventSource::JobResult)
        } else {
            None
        }
    }

    pub fn dispatch_key(&self, class: QueueClass) -> &str {
        match class {
            QueueClass::Cpu => &self.dispatch_cpu_key,
            QueueClass::Gpu => &self.dispatch_gpu_key,
        }
    }

    pub fn exchanges(&self) -> Vec<ExchangeDeclaration> {
        [&self.flows_exchange, &self.jobs_exchange]
            .into_iter()
            .map(|name| ExchangeDeclaration {
                name: name.clone(),
                kind: "topic".to_string(),
            })
            .collect()
    }

    /// One queue per routing key, named after the key. Dispatch queues are
    /// priority queues.
    pub fn queues(&self) -> Vec<QueueDeclaration> {
        let queue = |exchange: &str, key: &str, max_priority: Option<u8>| QueueDeclaration {
            name: key.to_string(),
            exchange: exchange.to_string(),
            routing_key: key.to_string(),
            max_priority,
        };

        vec![
            queue(&self.flows_exchange, &self.flow_arrived_key, None),
            queue(&self.flows_exchange, &self.flow_finished_key, None),
            queue(&self.jobs_exchange, &self.job_result_key, None),
            queue(&self.jobs_exchange, &self.dispatch_cpu_key, Some(self.max_priority)),
            queue(&self.jobs_exchange, &self.dispatch_gpu_key, Some(self.max_priority)),
        ]
    }

    /// Check the names are usable: non-empty, exchanges distinct and each
    /// routing key used once
    pub fn validate(&self) -> Result<(), String> {
        let names = [
            ("flows_exchange", &self.flows_exchange),
            ("jobs_exchange", &self.jobs_exchange),
            ("flow_arrived_key", &self.flow_arrived_key),
            ("flow_finished_key", &self.flow_finished_key),
            ("job_result_key", &self.job_result_key),
            ("dispatch_cpu_key", &self.dispatch_cpu_key),
            ("dispatch_gpu_key", &self.dispatch_gpu_key),
        ];
        if let Some((field, _)) = names.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(format!("topology.{} must not be empty", field));
        }

        if self.flows_exchange == self.jobs_exchange {
            return Err("topology exchanges must be distinct".to_string());
        }

        let mut seen = BTreeSet::new();
        for (field, key) in &names[2..] {
            if !seen.insert(key.as_str()) {
                return Err(format!("topology.{} reuses routing key '{}'", field, key));
            }
        }

        if self.max_priority == 0 {
            return Err("topology.max_priority must be at least 1".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let topology = Topology::default();
        assert_eq!(
            topology.classify("flows", "flow.arrived"),
            Some(EventSource::FlowArrived)
        );
        assert_eq!(
            topology.classify("jobs", "job.result"),
            Some(EventSource::JobResult)
        );
        assert_eq!(topology.classify("jobs", "flow.arrived"), None);
        assert_eq!(topology.classify("audit", "job.result"), None);
    }

    #[test]
    fn test_dispatch_queues_are_priority_queues() {
        let topology = Topology::default();
        let queues = topology.queues();
        assert_eq!(queues.len(), 5);

        let gpu = queues
            .iter()
            .find(|q| q.routing_key == topology.dispatch_key(QueueClass::Gpu))
            .unwrap();
        assert_eq!(gpu.exchange, "jobs");
        assert_eq!(gpu.max_priority, Some(5));
    }

    #[test]
    fn test_validate_rejects_reused_key() {
        let topology = Topology {
            dispatch_gpu_key: "job.dispatch.cpu".to_string(),
            ..Topology::default()
        };
        let err = topology.validate().unwrap_err();
        assert!(err.contains("dispatch_gpu_key"));
    }

    #[test]
    fn test_validate_default() {
        assert!(Topology::default().validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let topology: Topology = serde_yaml::from_str("jobs_exchange: work\n").unwrap();
        assert_eq!(topology.jobs_exchange, "work");
        assert_eq!(topology.flows_exchange, "flows");
    }
}
