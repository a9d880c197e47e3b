// JSON Lines Broker
// Publishes outbound messages as newline-delimited JSON on any async writer

use super::{Broker, BrokerError, BrokerResult, Topology};
use crate::scheduler::messages::OutboundMessage;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Broker that writes each published message as one JSON line.
///
/// There is nothing to declare on a byte stream, so `ensure_declared` only
/// checks the topology is usable.
pub struct JsonLinesBroker<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesBroker<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonLinesBroker<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl<W> Broker for JsonLinesBroker<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn ensure_declared(&self, topology: &Topology) -> BrokerResult<()> {
        topology.validate().map_err(BrokerError::InvalidTopology)
    }

    async fn publish(&self, message: &OutboundMessage) -> BrokerResult<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::models::Model;
    use crate::scheduler::messages::{JobDispatch, Outbound};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_publish_writes_one_line_per_message() {
        let broker = JsonLinesBroker::new(Vec::new());
        let topology = Topology::default();
        broker.ensure_declared(&topology).await.unwrap();

        let model: Model =
            serde_json::from_value(serde_json::json!({"name": "seg", "gpu": true})).unwrap();
        let msg = OutboundMessage {
            exchange: topology.jobs_exchange.clone(),
            routing_key: topology.dispatch_gpu_key.clone(),
            priority: 3,
            body: Outbound::JobDispatch(JobDispatch {
                correlation_id: 1,
                flow_instance_id: "study-1".to_string(),
                model,
                input_mount_mapping: BTreeMap::from([("src".to_string(), "b0".to_string())]),
            }),
        };
        broker.publish(&msg).await.unwrap();
        broker.publish(&msg).await.unwrap();

        let output = String::from_utf8(broker.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);

        let decoded: OutboundMessage = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_invalid_topology_rejected() {
        let broker = JsonLinesBroker::new(Vec::new());
        let topology = Topology {
            jobs_exchange: "flows".to_string(),
            ..Topology::default()
        };
        let err = broker.ensure_declared(&topology).await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidTopology(_)));
    }
}
