// Scheduler Engine
// Reactive control loop: ingest one message, persist it, re-run the dispatch pass

use crate::broker::EventSource;
use crate::config::SchedulerConfig;
use crate::dispatch::DispatchGuard;
use crate::error::{ServiceError, ServiceResult};
use crate::flow::models::DESTINATION_PORT;
use crate::flow::{FlowValidator, GraphError};
use crate::scheduler::events::{EventSender, ProgressSender, SchedulerEvent};
use crate::scheduler::messages::{
    FlowArrived, FlowFinished, InboundMessage, JobDispatch, JobResult, Outbound,
    OutboundMessage, QueueClass,
};
use crate::store::{
    FlowInstance, JobInstance, JobStatus, NewFlowInstance, NewJobInstance, Store,
    StoreError,
};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What `admit_flow` did with a flow-arrived message
#[derive(Debug, Clone)]
pub enum Admission {
    /// New instance with this many jobs
    Created { flow_instance_id: String, jobs: usize },
    /// Instance already existed; nothing written
    Duplicate { flow_instance_id: String },
    /// Flow failed validation; nothing written
    Rejected {
        flow_instance_id: String,
        error: GraphError,
    },
}

/// What `record_result` did with a job-result message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOutcome {
    /// The job moved to this terminal status
    Applied(JobStatus),
    /// The job was already past DISPATCHED; its status stays as shown
    Unchanged(JobStatus),
    /// No job has this correlation id
    UnknownJob,
}

/// The scheduler core.
///
/// Holds no state between calls besides the store, so any number of
/// instances (in one process or many) may share a database.
pub struct Scheduler {
    store: Arc<dyn Store>,
    guard: DispatchGuard,
    config: SchedulerConfig,
    events: Option<ProgressSender>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, config: SchedulerConfig) -> Self {
        Self {
            guard: DispatchGuard::new(store.clone()),
            store,
            config,
            events: None,
        }
    }

    /// Report progress on `sender` in addition to tracing
    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Handle one inbound message, appending everything to publish to
    /// `outbound`.
    ///
    /// Messages from an unknown exchange or routing key are ignored without
    /// touching the store. Otherwise the body is ingested and a full dispatch
    /// pass follows. On error `outbound` still holds the messages whose state
    /// change was committed before the failure; they must be published even
    /// though the inbound message will be redelivered.
    #[instrument(skip_all, fields(exchange = %msg.exchange, routing_key = %msg.routing_key))]
    pub fn handle(
        &self,
        msg: &InboundMessage,
        outbound: &mut Vec<OutboundMessage>,
    ) -> ServiceResult<()> {
        match self
            .config
            .topology
            .classify(&msg.exchange, &msg.routing_key)
        {
            Some(EventSource::FlowArrived) => {
                let arrived: FlowArrived = serde_json::from_value(msg.body.clone())
                    .map_err(|e| ServiceError::decode("flow-arrived", e))?;
                self.admit_flow(arrived)?;
            }
            Some(EventSource::JobResult) => {
                let result: JobResult = serde_json::from_value(msg.body.clone())
                    .map_err(|e| ServiceError::decode("job-result", e))?;
                self.record_result(&result)?;
            }
            None => {
                warn!("message from unknown source ignored");
                self.events.send_event(SchedulerEvent::ignored(format!(
                    "unknown source {}/{}",
                    msg.exchange, msg.routing_key
                )));
                return Ok(());
            }
        }

        self.dispatch_pass(outbound)
    }

    /// Validate the flow and create its instance, keyed by `uid`.
    ///
    /// Models whose only input is `src` get the flow's declared priority;
    /// every other model, including one without inputs, gets the reschedule
    /// priority.
    pub fn admit_flow(&self, arrived: FlowArrived) -> ServiceResult<Admission> {
        let FlowArrived {
            uid,
            flow,
            src_uid,
            sender,
            priority,
        } = arrived;

        let validated = match FlowValidator::validate(flow) {
            Ok(v) => v,
            Err(error) => {
                warn!(flow_instance = %uid, rule = ?error.rule(), %error, "flow rejected");
                self.events.send_event(SchedulerEvent::flow_rejected(
                    uid.clone(),
                    error.rule(),
                    error.message.clone(),
                ));
                return Ok(Admission::Rejected {
                    flow_instance_id: uid,
                    error,
                });
            }
        };

        let declared = validated.flow().priority;
        let jobs: Vec<NewJobInstance> = validated
            .flow()
            .models
            .iter()
            .enumerate()
            .map(|(index, model)| NewJobInstance {
                model_index: index,
                model_name: model.name.clone(),
                input_ports: model.input_port_names().into_iter().map(String::from).collect(),
                output_ports: model.output_port_names().into_iter().map(String::from).collect(),
                priority: if model.reads_only_source() {
                    declared
                } else {
                    self.config.reschedule_priority
                },
                gpu: model.gpu,
            })
            .collect();
        let job_count = jobs.len();

        let (instance, created) = self.store.create_flow_instance(&NewFlowInstance {
            id: uid.clone(),
            flow: validated.into_flow(),
            src_uid,
            sender,
            arrival_priority: priority,
            jobs,
        })?;

        if created {
            info!(flow_instance = %uid, flow = %instance.flow.name, jobs = job_count, "flow admitted");
            self.events.send_event(SchedulerEvent::flow_admitted(
                uid.clone(),
                instance.flow.name.clone(),
                job_count,
            ));
            Ok(Admission::Created {
                flow_instance_id: uid,
                jobs: job_count,
            })
        } else {
            debug!(flow_instance = %uid, "duplicate flow-arrived ignored");
            self.events.send_event(SchedulerEvent::FlowDuplicate {
                flow_instance_id: uid.clone(),
            });
            Ok(Admission::Duplicate {
                flow_instance_id: uid,
            })
        }
    }

    /// Apply a job-result.
    ///
    /// On success the job's declared output ports are bound first, then the
    /// job moves DISPATCHED -> SUCCESS. Fail and error move it to FAIL.
    /// Status only ever advances, so a late or duplicate result for a job in
    /// a terminal status changes nothing.
    pub fn record_result(&self, result: &JobResult) -> ServiceResult<ResultOutcome> {
        let Some(job) = self.store.get_job_by_id(result.correlation_id)? else {
            warn!(correlation_id = result.correlation_id, "result for unknown job ignored");
            self.events.send_event(SchedulerEvent::ignored(format!(
                "unknown correlation id {}",
                result.correlation_id
            )));
            return Ok(ResultOutcome::UnknownJob);
        };

        if result.status.is_success() {
            // Mappings are only taken from jobs that actually ran. A duplicate
            // success for a SUCCESS job re-inserts and is absorbed by the
            // uniqueness constraint.
            if matches!(job.status, JobStatus::Dispatched | JobStatus::Success) {
                self.bind_outputs(&job, &result.output_mount_mapping)?;
            }
        }

        let target = if result.status.is_success() {
            JobStatus::Success
        } else {
            JobStatus::Fail
        };

        if self
            .store
            .update_job_status(job.id, JobStatus::Dispatched, target)?
        {
            info!(
                flow_instance = %job.flow_instance_id,
                job_id = job.id,
                model = %job.model_name,
                status = %target,
                "job completed"
            );
            self.events.send_event(SchedulerEvent::JobCompleted {
                flow_instance_id: job.flow_instance_id.clone(),
                job_id: job.id,
                model_name: job.model_name.clone(),
                status: target,
            });
            return Ok(ResultOutcome::Applied(target));
        }

        let current = self
            .store
            .get_job_by_id(job.id)?
            .map(|j| j.status)
            .unwrap_or(job.status);
        debug!(
            job_id = job.id,
            status = %current,
            reported = ?result.status,
            "job status unchanged"
        );
        Ok(ResultOutcome::Unchanged(current))
    }

    fn bind_outputs(
        &self,
        job: &JobInstance,
        outputs: &BTreeMap<String, String>,
    ) -> ServiceResult<()> {
        for (port, blob_uid) in outputs {
            if !job.output_ports.iter().any(|p| p == port) {
                warn!(
                    job_id = job.id,
                    port = %port,
                    "result binds a port the model does not declare; ignored"
                );
                continue;
            }
            self.store
                .insert_mount_mapping(&job.flow_instance_id, port, blob_uid)?;
        }
        Ok(())
    }

    /// Dispatch every runnable job and finish every flow whose `dst` is bound.
    ///
    /// A job is runnable when all its input ports are bound and none of its
    /// output ports is. Readiness is checked before the guard is claimed: a
    /// claim is permanent, so claiming a job that cannot run yet would block
    /// it forever.
    ///
    /// Each message is appended to `outbound` right after the write that
    /// commits to it, and everything the message needs is read before that
    /// write. An error part way through leaves every committed message in
    /// `outbound`.
    pub fn dispatch_pass(&self, outbound: &mut Vec<OutboundMessage>) -> ServiceResult<()> {
        let mut mappings: HashMap<String, BTreeMap<String, String>> = HashMap::new();
        let mut flows: HashMap<String, FlowInstance> = HashMap::new();

        for job in self.store.get_runnable_candidates()? {
            if !mappings.contains_key(&job.flow_instance_id) {
                let mapping = self.store.mount_mapping(&job.flow_instance_id)?;
                mappings.insert(job.flow_instance_id.clone(), mapping);
            }
            let mapping = &mappings[&job.flow_instance_id];

            if !inputs_ready(&job, mapping) || outputs_present(&job, mapping) {
                continue;
            }

            let (message, queue) = self.dispatch_message(&job, mapping, &mut flows)?;

            if !self.guard.claim(&job)?.is_claimed() {
                continue;
            }

            info!(
                flow_instance = %job.flow_instance_id,
                job_id = job.id,
                model = %job.model_name,
                ?queue,
                priority = job.priority,
                "job dispatched"
            );
            self.events.send_event(SchedulerEvent::JobDispatched {
                flow_instance_id: job.flow_instance_id.clone(),
                job_id: job.id,
                model_name: job.model_name.clone(),
                queue,
                priority: job.priority,
            });
            outbound.push(message);
        }

        for flow in self.store.non_terminal_flows()? {
            // The mapping is read first; dst must already be in it, so the
            // message never lacks the binding that finished the flow
            let mount_mapping = self.store.mount_mapping(&flow.id)?;
            if !mount_mapping.contains_key(DESTINATION_PORT) {
                continue;
            }
            if !self.store.finish_flow(&flow.id)? {
                continue;
            }

            info!(flow_instance = %flow.id, flow = %flow.flow.name, "flow finished");
            self.events
                .send_event(SchedulerEvent::flow_finished(flow.id.clone(), flow.flow.name.clone()));

            let topology = &self.config.topology;
            outbound.push(OutboundMessage {
                exchange: topology.flows_exchange.clone(),
                routing_key: topology.flow_finished_key.clone(),
                priority: flow.flow.priority,
                body: Outbound::FlowFinished(FlowFinished {
                    uid: flow.id,
                    flow: flow.flow,
                    mount_mapping,
                }),
            });
        }

        Ok(())
    }

    /// Build the job-dispatch message for `job`, loading its flow once per pass
    fn dispatch_message(
        &self,
        job: &JobInstance,
        mapping: &BTreeMap<String, String>,
        flows: &mut HashMap<String, FlowInstance>,
    ) -> ServiceResult<(OutboundMessage, QueueClass)> {
        if !flows.contains_key(&job.flow_instance_id) {
            let flow = self
                .store
                .get_flow_by_id(&job.flow_instance_id)?
                .ok_or_else(|| {
                    StoreError::CorruptRow(format!(
                        "job {} references missing flow instance '{}'",
                        job.id, job.flow_instance_id
                    ))
                })?;
            flows.insert(job.flow_instance_id.clone(), flow);
        }
        let model = flows[&job.flow_instance_id]
            .flow
            .model(job.model_index)
            .cloned()
            .ok_or_else(|| {
                StoreError::CorruptRow(format!(
                    "job {} references model {} beyond the flow",
                    job.id, job.model_index
                ))
            })?;

        let queue = QueueClass::for_model(&model);
        let input_mount_mapping = job
            .input_ports
            .iter()
            .filter_map(|p| mapping.get(p).map(|b| (p.clone(), b.clone())))
            .collect();

        let topology = &self.config.topology;
        let message = OutboundMessage {
            exchange: topology.jobs_exchange.clone(),
            routing_key: topology.dispatch_key(queue).to_string(),
            priority: job.priority,
            body: Outbound::JobDispatch(JobDispatch {
                correlation_id: job.id,
                flow_instance_id: job.flow_instance_id.clone(),
                model,
                input_mount_mapping,
            }),
        };
        Ok((message, queue))
    }
}

/// Every input port is bound. `src` is bound at creation, so root jobs are
/// ready immediately; a job without inputs is always ready.
fn inputs_ready(job: &JobInstance, mapping: &BTreeMap<String, String>) -> bool {
    job.input_ports.iter().all(|p| mapping.contains_key(p))
}

/// Some output port is already bound, so running the job again would be
/// redundant
fn outputs_present(job: &JobInstance, mapping: &BTreeMap<String, String>) -> bool {
    job.output_ports.iter().any(|p| mapping.contains_key(p))
}
