//! In-memory broker for tests and embedding.
//!
//! Holds declarations and published messages behind one `RwLock`. Routing
//! follows topic-exchange rules restricted to exact key matches, which is all
//! the scheduler topology uses.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tracing::debug;

use super::{Broker, BrokerError, BrokerResult, ExchangeDeclaration, QueueDeclaration, Topology};
use crate::scheduler::messages::OutboundMessage;

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: BTreeMap<String, ExchangeDeclaration>,
    queues: BTreeMap<String, QueueDeclaration>,
    /// Messages per queue, in publish order
    routed: BTreeMap<String, Vec<OutboundMessage>>,
    published: Vec<OutboundMessage>,
}

fn poison_err<T>(_: PoisonError<T>) -> BrokerError {
    BrokerError::LockPoisoned
}

#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: RwLock<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published so far, in order
    pub fn published(&self) -> BrokerResult<Vec<OutboundMessage>> {
        Ok(self.state.read().map_err(poison_err)?.published.clone())
    }

    /// Drain the published log, leaving queues untouched
    pub fn take_published(&self) -> BrokerResult<Vec<OutboundMessage>> {
        let mut state = self.state.write().map_err(poison_err)?;
        Ok(std::mem::take(&mut state.published))
    }

    /// Messages routed to one queue
    pub fn queue(&self, name: &str) -> BrokerResult<Vec<OutboundMessage>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.routed.get(name).cloned().unwrap_or_default())
    }

    pub fn declared_queues(&self) -> BrokerResult<Vec<QueueDeclaration>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.queues.values().cloned().collect())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn ensure_declared(&self, topology: &Topology) -> BrokerResult<()> {
        topology.validate().map_err(BrokerError::InvalidTopology)?;

        let mut state = self.state.write().map_err(poison_err)?;

        for exchange in topology.exchanges() {
            match state.exchanges.get(&exchange.name) {
                Some(existing) if existing.kind != exchange.kind => {
                    return Err(BrokerError::Conflict {
                        kind: "exchange",
                        name: exchange.name,
                        detail: format!("kind {} vs {}", existing.kind, exchange.kind),
                    });
                }
                Some(_) => {}
                None => {
                    debug!(exchange = %exchange.name, "declared exchange");
                    state.exchanges.insert(exchange.name.clone(), exchange);
                }
            }
        }

        for queue in topology.queues() {
            match state.queues.get(&queue.name) {
                Some(existing) if existing != &queue => {
                    return Err(BrokerError::Conflict {
                        kind: "queue",
                        name: queue.name.clone(),
                        detail: format!(
                            "bound to {}/{} max priority {:?}, requested {}/{} max priority {:?}",
                            existing.exchange,
                            existing.routing_key,
                            existing.max_priority,
                            queue.exchange,
                            queue.routing_key,
                            queue.max_priority
                        ),
                    });
                }
                Some(_) => {}
                None => {
                    debug!(queue = %queue.name, "declared queue");
                    state.queues.insert(queue.name.clone(), queue);
                }
            }
        }

        Ok(())
    }

    async fn publish(&self, message: &OutboundMessage) -> BrokerResult<()> {
        let mut state = self.state.write().map_err(poison_err)?;

        if !state.exchanges.contains_key(&message.exchange) {
            return Err(BrokerError::UndeclaredExchange(message.exchange.clone()));
        }

        let targets: Vec<QueueDeclaration> = state
            .queues
            .values()
            .filter(|q| q.exchange == message.exchange && q.routing_key == message.routing_key)
            .cloned()
            .collect();

        for queue in &targets {
            if let Some(max) = queue.max_priority {
                if message.priority > max {
                    return Err(BrokerError::PriorityOutOfRange {
                        priority: message.priority,
                        max,
                    });
                }
            }
        }

        for queue in targets {
            state
                .routed
                .entry(queue.name)
                .or_default()
                .push(message.clone());
        }
        state.published.push(message.clone());
        Ok(())
    }
}
