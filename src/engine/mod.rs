mod agent;
mod error;
mod ledger;
mod mutations;
mod plan;
mod policy;
mod queries;

pub use agent::{validate_definition, GreedyReservationAgent, PlanView, ReservationAgent};
pub use error::EngineError;
pub use ledger::StepFunction;
pub use plan::{Plan, PlanSnapshot, StepOutcome};
pub use policy::{CapacityOverTimePolicy, SharingPolicy};

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::RwLockWriteGuard;

use crate::auth::AccessControl;
use crate::clock::Clock;
use crate::cluster::ClusterResources;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::registry::{PlanRegistry, SharedPlan};

/// Metric label for calls whose reservation could not be traced to a queue.
const UNKNOWN_QUEUE: &str = "unknown";

/// Totals from one pass of the plan follower.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepSummary {
    pub plans: usize,
    pub activated: usize,
    pub expired: usize,
}

/// Front door for all reservation traffic. Owns one plan per queue and
/// serializes mutations per plan; different queues proceed in parallel.
pub struct ReservationSystem {
    pub(super) registry: PlanRegistry,
    pub(super) cluster: Arc<dyn ClusterResources>,
    pub(super) access: AccessControl,
    pub(super) clock: Arc<dyn Clock>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: reservation id → queue name
    pub(super) reservation_to_queue: DashMap<ReservationId, String>,
}

impl ReservationSystem {
    pub fn new(
        cluster: Arc<dyn ClusterResources>,
        access: AccessControl,
        clock: Arc<dyn Clock>,
        notify: Arc<NotifyHub>,
    ) -> Self {
        Self {
            registry: PlanRegistry::new(),
            cluster,
            access,
            clock,
            notify,
            reservation_to_queue: DashMap::new(),
        }
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    pub fn access(&self) -> AccessControl {
        self.access
    }

    pub fn registry(&self) -> &PlanRegistry {
        &self.registry
    }

    pub(super) fn plan(&self, queue: &str) -> Result<SharedPlan, EngineError> {
        self.registry
            .get(queue)
            .ok_or_else(|| EngineError::QueueNotFound(queue.to_string()))
    }

    /// Write-lock `plan`, provided it is still the one registered for
    /// `queue`. A reload or restore may have retired it while the caller
    /// waited for the cluster or the lock.
    pub(super) async fn lock_live<'a>(
        &self,
        queue: &str,
        plan: &'a SharedPlan,
    ) -> Result<RwLockWriteGuard<'a, Plan>, EngineError> {
        let guard = plan.write().await;
        match self.registry.get(queue) {
            Some(live) if Arc::ptr_eq(&live, plan) => Ok(guard),
            _ => Err(EngineError::QueueNotFound(queue.to_string())),
        }
    }

    /// Find the queue and plan holding `id`.
    pub(super) fn resolve(&self, id: &ReservationId) -> Result<(String, SharedPlan), EngineError> {
        let queue = self
            .reservation_to_queue
            .get(id)
            .map(|q| q.value().clone())
            .ok_or(EngineError::NotFound(*id))?;
        let plan = self.registry.get(&queue).ok_or(EngineError::NotFound(*id))?;
        Ok((queue, plan))
    }

    fn record<T>(&self, op: &'static str, queue: &str, result: &Result<T, EngineError>, started: Instant) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        metrics::counter!(
            crate::observability::RESERVATIONS_TOTAL,
            "queue" => queue.to_string(),
            "op" => op,
            "outcome" => outcome
        )
        .increment(1);
        metrics::histogram!(crate::observability::ADMISSION_DURATION_SECONDS, "op" => op)
            .record(started.elapsed().as_secs_f64());
    }

    fn publish_count(&self, queue: &str, count: usize) {
        metrics::gauge!(crate::observability::RESERVATIONS_ACTIVE, "queue" => queue.to_string())
            .set(count as f64);
    }
}
