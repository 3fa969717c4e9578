use std::collections::HashMap;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::limits::*;
use crate::model::*;
use crate::registry::{ReloadOutcome, SharedPlan};

use super::agent::{validate_definition, PlanView};
use super::plan::{Plan, PlanSnapshot};
use super::{EngineError, ReservationSystem, StepSummary, UNKNOWN_QUEUE};

impl ReservationSystem {
    /// Place `definition` on `queue`'s plan under a fresh id owned by `user`.
    pub async fn submit(
        &self,
        queue: &str,
        user: &str,
        definition: ReservationDefinition,
    ) -> Result<ReservationId, EngineError> {
        self.submit_with_id(ReservationId::new(), queue, user, definition)
            .await
    }

    /// Like [`ReservationSystem::submit`], with a caller-chosen id. The id must
    /// not be live on any plan.
    pub async fn submit_with_id(
        &self,
        id: ReservationId,
        queue: &str,
        user: &str,
        definition: ReservationDefinition,
    ) -> Result<ReservationId, EngineError> {
        let started = Instant::now();
        let result = self.admit(id, queue, user, definition).await;
        self.record("submit", queue, &result, started);
        result.map(|()| id)
    }

    async fn admit(
        &self,
        id: ReservationId,
        queue: &str,
        user: &str,
        definition: ReservationDefinition,
    ) -> Result<(), EngineError> {
        if user.is_empty() {
            return Err(EngineError::OwnerInformationCorrupted(id));
        }
        if user.len() > MAX_USER_LEN {
            return Err(EngineError::LimitExceeded("user name too long"));
        }
        let now = self.clock.now();
        validate_definition(&definition, now)?;
        let plan = self.plan(queue)?;

        // Claim the id before any placement work so a concurrent submit of
        // the same id on another queue cannot also commit.
        match self.reservation_to_queue.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                slot.insert(queue.to_string());
            }
        }
        let result = self.place_new(id, &plan, queue, user, definition, now).await;
        if result.is_err() {
            self.reservation_to_queue.remove(&id);
        }
        result
    }

    async fn place_new(
        &self,
        id: ReservationId,
        plan: &SharedPlan,
        queue: &str,
        user: &str,
        definition: ReservationDefinition,
        now: Ms,
    ) -> Result<(), EngineError> {
        let cluster = self.cluster.cluster_resource(now).await;
        let mut guard = self.lock_live(queue, plan).await?;
        guard.policy().check_window(definition.arrival, now)?;
        let allocations = {
            let view = PlanView::new(&guard, cluster, None);
            guard.agent().create_allocation(&definition, view, now)?
        };
        let allocation = ReservationAllocation::new(id, user, definition, allocations, now);
        let span = allocation.span();
        guard.add_reservation(allocation, now)?;
        let count = guard.len();
        drop(guard);

        self.publish_count(queue, count);
        info!(%id, queue, user, start = span.start, end = span.end, "reservation admitted");
        self.notify.send(&PlanEvent::Admitted {
            id,
            queue: queue.to_string(),
            span,
        });
        Ok(())
    }

    /// Re-place reservation `id` from a new definition. The old allocation is
    /// treated as free while searching and stays in force if the update fails.
    pub async fn update(
        &self,
        id: ReservationId,
        user: &str,
        definition: ReservationDefinition,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        match self.resolve(&id) {
            Ok((queue, plan)) => {
                let result = self.replace(id, &plan, &queue, user, definition).await;
                self.record("update", &queue, &result, started);
                result
            }
            Err(e) => {
                let result: Result<(), EngineError> = Err(e);
                self.record("update", UNKNOWN_QUEUE, &result, started);
                result
            }
        }
    }

    async fn replace(
        &self,
        id: ReservationId,
        plan: &SharedPlan,
        queue: &str,
        user: &str,
        definition: ReservationDefinition,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        let cluster = self.cluster.cluster_resource(now).await;
        let mut guard = self.lock_live(queue, plan).await?;
        let owner = guard
            .get(&id)
            .ok_or(EngineError::NotFound(id))?
            .owner
            .clone();
        self.access.authorize(user, id, &owner)?;
        validate_definition(&definition, now)?;
        guard.policy().check_window(definition.arrival, now)?;

        let allocations = {
            let view = PlanView::new(&guard, cluster, Some(&id));
            guard.agent().create_allocation(&definition, view, now)?
        };
        let allocation = ReservationAllocation::new(id, owner, definition, allocations, now);
        let span = allocation.span();
        guard.update_reservation(allocation, now)?;
        drop(guard);

        info!(%id, queue, user, start = span.start, end = span.end, "reservation updated");
        self.notify.send(&PlanEvent::Updated {
            id,
            queue: queue.to_string(),
            span,
        });
        Ok(())
    }

    pub async fn delete(&self, id: ReservationId, user: &str) -> Result<(), EngineError> {
        let started = Instant::now();
        match self.resolve(&id) {
            Ok((queue, plan)) => {
                let result = self.remove(id, &plan, &queue, user).await;
                self.record("delete", &queue, &result, started);
                result
            }
            Err(e) => {
                let result: Result<(), EngineError> = Err(e);
                self.record("delete", UNKNOWN_QUEUE, &result, started);
                result
            }
        }
    }

    async fn remove(
        &self,
        id: ReservationId,
        plan: &SharedPlan,
        queue: &str,
        user: &str,
    ) -> Result<(), EngineError> {
        let mut guard = self.lock_live(queue, plan).await?;
        let current = guard.get(&id).ok_or(EngineError::NotFound(id))?;
        self.access.authorize(user, id, &current.owner)?;
        guard.delete_reservation(&id)?;
        let count = guard.len();
        drop(guard);

        self.reservation_to_queue.remove(&id);
        self.publish_count(queue, count);
        info!(%id, queue, user, "reservation deleted");
        self.notify.send(&PlanEvent::Deleted {
            id,
            queue: queue.to_string(),
        });
        Ok(())
    }

    /// One pass of the plan follower: every plan archives reservations that
    /// have ended and activates those that have begun.
    pub async fn synchronize_plans(&self) -> StepSummary {
        let started = Instant::now();
        let now = self.clock.now();
        let mut summary = StepSummary::default();

        for (queue, plan) in self.registry.plans() {
            let mut guard = plan.write().await;
            let outcome = guard.advance(now);
            let count = guard.len();
            drop(guard);

            for id in &outcome.activated {
                debug!(%id, queue = %queue, "reservation active");
                self.notify.send(&PlanEvent::Activated {
                    id: *id,
                    queue: queue.clone(),
                });
            }
            for expired in &outcome.expired {
                self.reservation_to_queue.remove(&expired.id);
                info!(id = %expired.id, queue = %queue, end = expired.end, "reservation expired");
                self.notify.send(&PlanEvent::Expired {
                    id: expired.id,
                    queue: queue.clone(),
                });
            }
            if !outcome.expired.is_empty() {
                metrics::counter!(
                    crate::observability::RESERVATIONS_EXPIRED_TOTAL,
                    "queue" => queue.clone()
                )
                .increment(outcome.expired.len() as u64);
            }
            self.publish_count(&queue, count);

            summary.plans += 1;
            summary.activated += outcome.activated.len();
            summary.expired += outcome.expired.len();
        }

        metrics::histogram!(crate::observability::FOLLOWER_STEP_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        summary
    }

    /// Apply a new set of queue configs. Reservations on dropped queues are
    /// reported as deleted.
    pub async fn reinitialize(&self, configs: &[QueueConfig]) -> Result<ReloadOutcome, EngineError> {
        let now = self.clock.now();
        let outcome = self.registry.reinitialize(configs, now).await?;

        for (queue, ids) in &outcome.removed {
            for id in ids {
                self.reservation_to_queue.remove(id);
                self.notify.send(&PlanEvent::Deleted {
                    id: *id,
                    queue: queue.clone(),
                });
            }
            self.notify.remove(queue);
            self.publish_count(queue, 0);
            warn!(queue = %queue, dropped = ids.len(), "plan removed by reload");
        }
        info!(
            added = outcome.added.len(),
            updated = outcome.updated.len(),
            refused = outcome.refused.len(),
            removed = outcome.removed.len(),
            "plans reinitialized"
        );
        Ok(outcome)
    }

    /// Replace every plan with the contents of `snapshots`. Nothing changes
    /// unless all of them load.
    pub async fn restore(&self, snapshots: Vec<PlanSnapshot>) -> Result<(), EngineError> {
        let mut plans: Vec<Plan> = Vec::with_capacity(snapshots.len());
        let mut owners: HashMap<ReservationId, String> = HashMap::new();
        for snapshot in snapshots {
            let plan = Plan::from_snapshot(snapshot)?;
            if plans.iter().any(|p| p.queue() == plan.queue()) {
                return Err(EngineError::InvalidQueueConfig {
                    queue: plan.queue().to_string(),
                    reason: "duplicate queue name",
                });
            }
            for r in plan.reservations() {
                if owners.insert(r.id, plan.queue().to_string()).is_some() {
                    return Err(EngineError::DuplicateId(r.id));
                }
            }
            plans.push(plan);
        }
        if plans.len() > MAX_QUEUES {
            return Err(EngineError::LimitExceeded("too many queues"));
        }

        let counts: Vec<(String, usize)> = plans.iter().map(|p| (p.queue().to_string(), p.len())).collect();
        self.registry.replace_all(plans);
        self.reservation_to_queue.clear();
        for (id, queue) in owners {
            self.reservation_to_queue.insert(id, queue);
        }
        for (queue, count) in &counts {
            self.publish_count(queue, *count);
        }
        info!(plans = counts.len(), reservations = self.reservation_to_queue.len(), "plans restored");
        Ok(())
    }

    pub async fn snapshot(&self) -> Vec<PlanSnapshot> {
        let mut out = Vec::new();
        for (_, plan) in self.registry.plans() {
            out.push(plan.read().await.snapshot());
        }
        out
    }
}
