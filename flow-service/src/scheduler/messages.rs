// Scheduler Messages
// Wire shapes of the inbound and outbound broker messages

use crate::flow::models::{deserialize_versioned, Flow, Model};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A message as delivered by the broker: where it came from plus its JSON body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Value,
}

impl InboundMessage {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>, body: Value) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body,
        }
    }
}

/// `flow-arrived`: the matcher selected a flow for an incoming study
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowArrived {
    /// Flow instance id; duplicate deliveries share it
    pub uid: String,

    /// Flow definition of any supported schema
    #[serde(deserialize_with = "deserialize_versioned")]
    pub flow: Flow,

    /// Blob holding the arriving study, bound to `src`
    pub src_uid: String,

    #[serde(default)]
    pub sender: Option<String>,

    #[serde(default)]
    pub priority: Option<u8>,
}

/// Status reported by the executor for one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Fail,
    Error,
}

impl ResultStatus {
    pub fn is_success(self) -> bool {
        matches!(self, ResultStatus::Success)
    }
}

/// `job-result`: the executor finished (or gave up on) a dispatched job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// Job row id from the dispatch message
    pub correlation_id: i64,

    /// Output ports written by the job: port -> blob uid
    #[serde(default)]
    pub output_mount_mapping: BTreeMap<String, String>,

    pub status: ResultStatus,
}

/// Worker pool a job is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueClass {
    Cpu,
    Gpu,
}

impl QueueClass {
    pub fn for_model(model: &Model) -> Self {
        if model.gpu {
            QueueClass::Gpu
        } else {
            QueueClass::Cpu
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueClass::Cpu => "cpu",
            QueueClass::Gpu => "gpu",
        }
    }
}

/// `job-dispatch`: run one model with the given inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDispatch {
    pub correlation_id: i64,
    pub flow_instance_id: String,
    pub model: Model,
    /// Bound input ports of the model: port -> blob uid
    pub input_mount_mapping: BTreeMap<String, String>,
}

/// `flow-finished`: the destination port of a flow instance is bound
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowFinished {
    pub uid: String,
    pub flow: Flow,
    pub mount_mapping: BTreeMap<String, String>,
}

/// Body of an outbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outbound {
    JobDispatch(JobDispatch),
    FlowFinished(FlowFinished),
}

/// A message ready for publishing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    /// Broker priority, 0 to the topology's max priority
    pub priority: u8,
    pub body: Outbound,
}

impl OutboundMessage {
    pub fn as_job_dispatch(&self) -> Option<&JobDispatch> {
        match &self.body {
            Outbound::JobDispatch(d) => Some(d),
            Outbound::FlowFinished(_) => None,
        }
    }

    pub fn as_flow_finished(&self) -> Option<&FlowFinished> {
        match &self.body {
            Outbound::FlowFinished(f) => Some(f),
            Outbound::JobDispatch(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flow_arrived_accepts_legacy_flow() {
        let body = json!({
            "uid": "study-1",
            "flow": {"name": "old", "models": [{"name": "m", "inputs": ["src"], "outputs": ["dst"]}]},
            "src_uid": "blob-1",
            "sender": "CT01",
            "priority": 2
        });

        let arrived: FlowArrived = serde_json::from_value(body).unwrap();
        assert_eq!(arrived.flow.schema, 2);
        assert!(arrived.flow.models[0].produces("dst"));
        assert_eq!(arrived.priority, Some(2));
    }

    #[test]
    fn test_flow_arrived_rejects_unknown_schema() {
        let body = json!({"uid": "u", "flow": {"schema": 9, "name": "x"}, "src_uid": "b"});
        let err = serde_json::from_value::<FlowArrived>(body).unwrap_err();
        assert!(err.to_string().contains("unsupported flow schema version 9"));
    }

    #[test]
    fn test_job_result_statuses() {
        for (raw, status) in [
            ("success", ResultStatus::Success),
            ("fail", ResultStatus::Fail),
            ("error", ResultStatus::Error),
        ] {
            let result: JobResult =
                serde_json::from_value(json!({"correlation_id": 7, "status": raw})).unwrap();
            assert_eq!(result.status, status);
            assert!(result.output_mount_mapping.is_empty());
        }
    }

    #[test]
    fn test_outbound_body_is_flat() {
        let msg = OutboundMessage {
            exchange: "flows".to_string(),
            routing_key: "flow.finished".to_string(),
            priority: 0,
            body: Outbound::FlowFinished(FlowFinished {
                uid: "study-1".to_string(),
                flow: serde_json::from_value(json!({"name": "f"})).unwrap(),
                mount_mapping: BTreeMap::from([("dst".to_string(), "b".to_string())]),
            }),
        };

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["body"]["uid"], "study-1");
        assert_eq!(value["body"]["mount_mapping"]["dst"], "b");
        assert!(msg.as_job_dispatch().is_none());
    }
}
