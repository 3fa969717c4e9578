use crate::model::*;

use super::{EngineError, ReservationSystem};

fn window(start: Ms, end: Ms) -> Result<ReservationInterval, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidDefinition("query window is empty"));
    }
    Ok(ReservationInterval::new(start, end))
}

fn by_start(mut reservations: Vec<ReservationAllocation>) -> Vec<ReservationAllocation> {
    reservations.sort_by_key(|r| (r.start, r.end, r.id));
    reservations
}

impl ReservationSystem {
    /// Queue currently holding `id`, if it is live.
    pub fn queue_of(&self, id: &ReservationId) -> Option<String> {
        self.reservation_to_queue.get(id).map(|q| q.value().clone())
    }

    pub async fn get_reservation(&self, id: ReservationId) -> Result<ReservationAllocation, EngineError> {
        let (_, plan) = self.resolve(&id)?;
        let guard = plan.read().await;
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Component-wise peak of committed resources on `queue` over `[start, end)`.
    pub async fn total_allocation_between(
        &self,
        queue: &str,
        start: Ms,
        end: Ms,
    ) -> Result<ResourceVector, EngineError> {
        let span = window(start, end)?;
        let plan = self.plan(queue)?;
        let guard = plan.read().await;
        Ok(guard.total_allocation_between(span))
    }

    pub async fn allocation_at(&self, queue: &str, t: Ms) -> Result<ResourceVector, EngineError> {
        let plan = self.plan(queue)?;
        let guard = plan.read().await;
        Ok(guard.allocation_at(t))
    }

    pub async fn reservations_active_at(
        &self,
        queue: &str,
        t: Ms,
    ) -> Result<Vec<ReservationAllocation>, EngineError> {
        let plan = self.plan(queue)?;
        let guard = plan.read().await;
        Ok(by_start(
            guard.reservations_active_at(t).into_iter().cloned().collect(),
        ))
    }

    pub async fn reservations_overlapping(
        &self,
        queue: &str,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<ReservationAllocation>, EngineError> {
        let span = window(start, end)?;
        let plan = self.plan(queue)?;
        let guard = plan.read().await;
        Ok(by_start(
            guard.reservations_overlapping(span).into_iter().cloned().collect(),
        ))
    }

    pub async fn earliest_start(&self, queue: &str) -> Result<Option<Ms>, EngineError> {
        let plan = self.plan(queue)?;
        let guard = plan.read().await;
        Ok(guard.earliest_start())
    }

    pub async fn last_end(&self, queue: &str) -> Result<Option<Ms>, EngineError> {
        let plan = self.plan(queue)?;
        let guard = plan.read().await;
        Ok(guard.last_end())
    }

    pub async fn plan_info(&self, queue: &str) -> Result<PlanInfo, EngineError> {
        let plan = self.plan(queue)?;
        let guard = plan.read().await;
        Ok(guard.info())
    }

    /// Summary of every plan, sorted by queue.
    pub async fn list_plans(&self) -> Vec<PlanInfo> {
        let mut out = Vec::new();
        for (_, plan) in self.registry.plans() {
            out.push(plan.read().await.info());
        }
        out
    }
}
