// Dispatch Guard
// Turns at-least-once message delivery into at-most-once execution attempts

use crate::store::{JobInstance, Store, StoreResult};

use std::sync::Arc;
use tracing::debug;

/// Outcome of a claim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This caller owns the attempt and must dispatch
    Claimed,
    /// Another pass (possibly in another process) already owns it
    AlreadyClaimed,
}

impl Claim {
    pub fn is_claimed(self) -> bool {
        matches!(self, Claim::Claimed)
    }
}

/// Write-once claim tokens keyed by (flow instance, model index).
///
/// The store's uniqueness constraint is the only serialization point, so any
/// number of scheduler processes sharing one database see exactly one winner.
/// Winning a claim also moves the job to DISPATCHED in the same transaction.
/// A claim records that the model was attempted; it says nothing about
/// whether the resulting dispatch message was published.
#[derive(Clone)]
pub struct DispatchGuard {
    store: Arc<dyn Store>,
}

impl DispatchGuard {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Try to claim `job` for dispatch
    pub fn claim(&self, job: &JobInstance) -> StoreResult<Claim> {
        if self.store.claim_job(job)? {
            Ok(Claim::Claimed)
        } else {
            debug!(
                flow_instance = %job.flow_instance_id,
                model_index = job.model_index,
                job_id = job.id,
                "dispatch guard already claimed"
            );
            Ok(Claim::AlreadyClaimed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::models::{Flow, CURRENT_SCHEMA};
    use crate::store::{JobStatus, NewFlowInstance, NewJobInstance, SqliteStore};

    fn store_with_jobs(id: &str, jobs: usize) -> Arc<dyn Store> {
        let store = SqliteStore::in_memory().unwrap();
        store
            .create_flow_instance(&NewFlowInstance {
                id: id.to_string(),
                flow: Flow {
                    schema: CURRENT_SCHEMA,
                    name: "fan-out".to_string(),
                    version: String::new(),
                    priority: 0,
                    models: Vec::new(),
                    triggers: serde_json::Value::Null,
                    destinations: Vec::new(),
                },
                src_uid: "blob".to_string(),
                sender: None,
                arrival_priority: None,
                jobs: (0..jobs)
                    .map(|i| NewJobInstance {
                        model_index: i,
                        model_name: format!("m{}", i),
                        input_ports: vec!["src".to_string()],
                        output_ports: vec![format!("out{}", i)],
                        priority: 0,
                        gpu: false,
                    })
                    .collect(),
            })
            .unwrap();
        Arc::new(store)
    }

    fn job(store: &Arc<dyn Store>, index: usize) -> JobInstance {
        store.jobs_for_flow("f1").unwrap().remove(index)
    }

    #[test]
    fn test_first_claim_wins() {
        let store = store_with_jobs("f1", 2);
        let guard = DispatchGuard::new(store.clone());

        assert_eq!(guard.claim(&job(&store, 0)).unwrap(), Claim::Claimed);
        assert_eq!(guard.claim(&job(&store, 0)).unwrap(), Claim::AlreadyClaimed);
        assert!(guard.claim(&job(&store, 1)).unwrap().is_claimed());
        assert_eq!(job(&store, 0).status, JobStatus::Dispatched);
    }

    #[test]
    fn test_guards_sharing_a_store_agree() {
        let store = store_with_jobs("f1", 3);
        let a = DispatchGuard::new(store.clone());
        let b = DispatchGuard::new(store.clone());
        let target = job(&store, 2);

        assert!(a.claim(&target).unwrap().is_claimed());
        assert!(!b.claim(&target).unwrap().is_claimed());
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let store = store_with_jobs("f1", 1);
        let guard = DispatchGuard::new(store.clone());
        let target = job(&store, 0);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = guard.clone();
                let target = target.clone();
                std::thread::spawn(move || guard.claim(&target).unwrap())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|c| c.is_claimed())
            .count();
        assert_eq!(winners, 1);
        assert_eq!(job(&store, 0).retries, 1);
    }
}
