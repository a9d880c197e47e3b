// Scheduler Service
// Binds the engine to a broker: declare topology, handle, publish

use crate::broker::Broker;
use crate::error::ServiceResult;
use crate::scheduler::engine::Scheduler;
use crate::scheduler::messages::{InboundMessage, OutboundMessage};

use tracing::{error, info, warn};

/// How an inbound message was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handled; this many messages were published
    Acked { published: usize },
    /// Failed in a way redelivery cannot fix; acknowledged and discarded
    Dropped,
}

/// Scheduler engine plus the broker it publishes to.
///
/// Transient failures are returned to the caller, which should leave the
/// inbound message unacknowledged so the broker redelivers it. The dispatch
/// guard absorbs the duplicates that redelivery produces.
pub struct SchedulerService<B> {
    scheduler: Scheduler,
    broker: B,
}

impl<B: Broker> SchedulerService<B> {
    pub fn new(scheduler: Scheduler, broker: B) -> Self {
        Self { scheduler, broker }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Declare the topology and resume from stored state.
    ///
    /// The dispatch pass run here picks up work left runnable by a previous
    /// process, e.g. results recorded just before a crash. Returns the number
    /// of messages published.
    pub async fn start(&self) -> ServiceResult<usize> {
        let topology = &self.scheduler.config().topology;
        self.broker.ensure_declared(topology).await?;
        info!(
            flows_exchange = %topology.flows_exchange,
            jobs_exchange = %topology.jobs_exchange,
            "topology declared"
        );

        let mut outbound = Vec::new();
        let pass = self.scheduler.dispatch_pass(&mut outbound);
        let published = self.publish_all(&outbound).await;
        pass?;
        let published = published?;
        if published > 0 {
            info!(published, "resumed pending work");
        }
        Ok(published)
    }

    /// Handle one inbound message and publish the result.
    ///
    /// Messages committed before a failure are published before the error
    /// is returned. Their jobs are already claimed, so redelivery of the
    /// inbound message would never produce them again.
    pub async fn process(&self, msg: &InboundMessage) -> ServiceResult<Delivery> {
        let mut outbound = Vec::new();
        let handled = self.scheduler.handle(msg, &mut outbound);
        let published = self.publish_all(&outbound).await;

        match handled {
            Ok(()) => Ok(Delivery::Acked {
                published: published?,
            }),
            Err(e) if !e.is_transient() => {
                warn!(error = %e, routing_key = %msg.routing_key, "dropping message");
                published?;
                Ok(Delivery::Dropped)
            }
            Err(e) => {
                error!(error = %e, routing_key = %msg.routing_key, "message will be redelivered");
                Err(e)
            }
        }
    }

    /// Publish every message, continuing past failures. Returns the number
    /// published, or the first failure once every message was attempted.
    async fn publish_all(&self, outbound: &[OutboundMessage]) -> ServiceResult<usize> {
        let mut published = 0;
        let mut first_error = None;
        for message in outbound {
            match self.broker.publish(message).await {
                Ok(()) => published += 1,
                Err(e) => {
                    error!(
                        error = %e,
                        exchange = %message.exchange,
                        routing_key = %message.routing_key,
                        "publish failed"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(published),
        }
    }
}
