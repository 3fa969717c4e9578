use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::QueueConfig;
use crate::limits::*;
use crate::model::*;

use super::agent::ReservationAgent;
use super::ledger::StepFunction;
use super::policy::SharingPolicy;
use super::EngineError;

/// What one follower step changed on a plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    pub activated: Vec<ReservationId>,
    pub expired: Vec<ReservationAllocation>,
}

/// Serializable image of a plan: its settings and live reservations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub config: QueueConfig,
    pub last_step: Ms,
    pub reservations: Vec<ReservationAllocation>,
}

/// Time-indexed ledger of committed reservations for one queue.
///
/// Every mutation validates before it touches state, so a rejected call leaves
/// the plan exactly as it was.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    queue: String,
    capacity: ResourceVector,
    policy: SharingPolicy,
    agent: ReservationAgent,
    reservations: HashMap<ReservationId, ReservationAllocation>,
    /// Overall span → ids, ordered by start then end.
    by_interval: BTreeMap<ReservationInterval, BTreeSet<ReservationId>>,
    /// Sum of every reservation's allocations.
    aggregate: StepFunction,
    last_step: Ms,
}

impl Plan {
    pub fn new(
        queue: impl Into<String>,
        capacity: ResourceVector,
        policy: SharingPolicy,
        agent: ReservationAgent,
    ) -> Self {
        Self {
            queue: queue.into(),
            capacity,
            policy,
            agent,
            reservations: HashMap::new(),
            by_interval: BTreeMap::new(),
            aggregate: StepFunction::new(),
            last_step: Ms::MIN,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(
            config.name.clone(),
            config.capacity,
            SharingPolicy::from_config(config),
            ReservationAgent::default(),
        )
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn capacity(&self) -> ResourceVector {
        self.capacity
    }

    pub fn policy(&self) -> &SharingPolicy {
        &self.policy
    }

    pub fn agent(&self) -> &ReservationAgent {
        &self.agent
    }

    pub fn aggregate(&self) -> &StepFunction {
        &self.aggregate
    }

    pub fn last_step(&self) -> Ms {
        self.last_step
    }

    pub fn len(&self) -> usize {
        self.reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }

    pub fn contains(&self, id: &ReservationId) -> bool {
        self.reservations.contains_key(id)
    }

    pub fn get(&self, id: &ReservationId) -> Option<&ReservationAllocation> {
        self.reservations.get(id)
    }

    pub fn reservations(&self) -> impl Iterator<Item = &ReservationAllocation> {
        self.reservations.values()
    }

    pub fn config(&self) -> QueueConfig {
        let SharingPolicy::CapacityOverTime(p) = &self.policy;
        QueueConfig {
            name: self.queue.clone(),
            capacity: self.capacity,
            reservation_window: p.reservation_window,
            instantaneous_max_capacity: p.instantaneous_max_capacity,
            average_capacity: p.average_capacity,
        }
    }

    pub fn info(&self) -> PlanInfo {
        let config = self.config();
        PlanInfo {
            queue: config.name,
            capacity: config.capacity,
            reservation_window: config.reservation_window,
            instantaneous_max_capacity: config.instantaneous_max_capacity,
            average_capacity: config.average_capacity,
            reservations: self.len(),
            last_step: self.last_step,
        }
    }

    // ── Mutations ────────────────────────────────────────────

    pub fn add_reservation(
        &mut self,
        allocation: ReservationAllocation,
        now: Ms,
    ) -> Result<(), EngineError> {
        if self.reservations.contains_key(&allocation.id) {
            return Err(EngineError::DuplicateId(allocation.id));
        }
        if self.reservations.len() >= MAX_RESERVATIONS_PER_PLAN {
            return Err(EngineError::LimitExceeded("too many reservations in plan"));
        }
        validate_shape(&allocation)?;
        self.check_capacity(&allocation, None)?;
        self.policy.validate(self, &allocation, None, now)?;
        self.attach(allocation);
        Ok(())
    }

    /// Replace the allocation stored under `allocation.id`. The old allocation
    /// does not count against the new one.
    pub fn update_reservation(
        &mut self,
        allocation: ReservationAllocation,
        now: Ms,
    ) -> Result<ReservationAllocation, EngineError> {
        let old = self
            .reservations
            .get(&allocation.id)
            .ok_or(EngineError::NotFound(allocation.id))?;
        validate_shape(&allocation)?;
        self.check_capacity(&allocation, Some(old))?;
        self.policy.validate(self, &allocation, Some(old), now)?;

        let previous = self
            .detach(&allocation.id)
            .ok_or(EngineError::NotFound(allocation.id))?;
        self.attach(allocation);
        Ok(previous)
    }

    pub fn delete_reservation(
        &mut self,
        id: &ReservationId,
    ) -> Result<ReservationAllocation, EngineError> {
        let mut removed = self.detach(id).ok_or(EngineError::NotFound(*id))?;
        removed.state = ReservationState::Deleted;
        Ok(removed)
    }

    /// Remove every reservation whose end is at or before `now`. Idempotent.
    pub fn archive_expired(&mut self, now: Ms) -> Vec<ReservationAllocation> {
        let upper = ReservationInterval {
            start: now,
            end: Ms::MIN,
        };
        let expired: Vec<ReservationId> = self
            .by_interval
            .range(..upper)
            .filter(|(span, _)| span.end <= now)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        expired
            .iter()
            .filter_map(|id| self.detach(id))
            .map(|mut r| {
                r.state = ReservationState::Expired;
                r
            })
            .collect()
    }

    /// Mark admitted reservations whose span has begun as active.
    pub fn activate_started(&mut self, now: Ms) -> Vec<ReservationId> {
        let upper = ReservationInterval {
            start: now,
            end: Ms::MAX,
        };
        let started: Vec<ReservationId> = self
            .by_interval
            .range(..=upper)
            .filter(|(span, _)| span.end > now)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        let mut activated = Vec::new();
        for id in started {
            if let Some(r) = self.reservations.get_mut(&id)
                && r.state == ReservationState::Admitted
            {
                r.state = ReservationState::Active;
                activated.push(id);
            }
        }
        activated
    }

    /// One follower step: archive what has ended, activate what has begun.
    pub fn advance(&mut self, now: Ms) -> StepOutcome {
        let expired = self.archive_expired(now);
        let activated = self.activate_started(now);
        self.last_step = self.last_step.max(now);
        StepOutcome { activated, expired }
    }

    /// Apply new settings. A capacity below what is already committed from
    /// `now` on is refused and nothing changes.
    pub fn reconfigure(&mut self, config: &QueueConfig, now: Ms) -> Result<(), EngineError> {
        config.validate()?;
        if let (Some(first), Some(last)) = (self.aggregate.first_change(), self.aggregate.last_change()) {
            let from = first.max(now);
            if from < last {
                let horizon = ReservationInterval::new(from, last);
                if let Some((segment, used)) = self
                    .aggregate
                    .segments(horizon)
                    .into_iter()
                    .find(|(_, used)| !used.fits_in(&config.capacity))
                {
                    return Err(EngineError::CapacityExceeded {
                        at: segment.start,
                        required: used,
                        capacity: config.capacity,
                    });
                }
            }
        }
        self.capacity = config.capacity;
        self.policy = SharingPolicy::from_config(config);
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────

    /// Component-wise peak of committed usage over `[start, end)`.
    pub fn total_allocation_between(&self, span: ReservationInterval) -> ResourceVector {
        self.aggregate.peak_between(span)
    }

    pub fn allocation_at(&self, t: Ms) -> ResourceVector {
        self.aggregate.value_at(t)
    }

    pub fn reservations_active_at(&self, t: Ms) -> Vec<&ReservationAllocation> {
        let upper = ReservationInterval {
            start: t,
            end: Ms::MAX,
        };
        self.by_interval
            .range(..=upper)
            .filter(|(span, _)| span.end > t)
            .flat_map(|(_, ids)| ids.iter())
            .filter_map(|id| self.reservations.get(id))
            .collect()
    }

    pub fn reservations_overlapping(&self, window: ReservationInterval) -> Vec<&ReservationAllocation> {
        let upper = ReservationInterval {
            start: window.end,
            end: Ms::MIN,
        };
        self.by_interval
            .range(..upper)
            .filter(|(span, _)| span.end > window.start)
            .flat_map(|(_, ids)| ids.iter())
            .filter_map(|id| self.reservations.get(id))
            .collect()
    }

    pub fn earliest_start(&self) -> Option<Ms> {
        self.by_interval.keys().next().map(|span| span.start)
    }

    pub fn last_end(&self) -> Option<Ms> {
        self.aggregate.last_change()
    }

    // ── Snapshots ────────────────────────────────────────────

    pub fn snapshot(&self) -> PlanSnapshot {
        let mut reservations: Vec<ReservationAllocation> = self.reservations.values().cloned().collect();
        reservations.sort_by_key(|r| (r.start, r.end, r.id));
        PlanSnapshot {
            config: self.config(),
            last_step: self.last_step,
            reservations,
        }
    }

    /// Rebuild a plan from a snapshot. Reservations are checked against plan
    /// capacity only; the sharing policy judged them when they were admitted.
    pub fn from_snapshot(snapshot: PlanSnapshot) -> Result<Plan, EngineError> {
        snapshot.config.validate()?;
        let mut plan = Plan::from_config(&snapshot.config);
        plan.last_step = snapshot.last_step;
        for allocation in snapshot.reservations {
            if plan.contains(&allocation.id) {
                return Err(EngineError::DuplicateId(allocation.id));
            }
            validate_shape(&allocation)?;
            plan.check_capacity(&allocation, None)?;
            plan.attach(allocation);
        }
        Ok(plan)
    }

    // ── Internals ────────────────────────────────────────────

    fn check_capacity(
        &self,
        candidate: &ReservationAllocation,
        replacing: Option<&ReservationAllocation>,
    ) -> Result<(), EngineError> {
        let plus = StepFunction::from_allocation(candidate);
        let minus = replacing.map(StepFunction::from_allocation);
        for (segment, used) in self.aggregate.overlay(&plus, minus.as_ref(), candidate.span()) {
            if plus.value_at(segment.start).is_zero() {
                continue;
            }
            if !used.fits_in(&self.capacity) {
                return Err(EngineError::CapacityExceeded {
                    at: segment.start,
                    required: used,
                    capacity: self.capacity,
                });
            }
        }
        Ok(())
    }

    fn attach(&mut self, allocation: ReservationAllocation) {
        for (interval, resources) in &allocation.allocations {
            self.aggregate.add(*interval, *resources);
        }
        self.by_interval
            .entry(allocation.span())
            .or_default()
            .insert(allocation.id);
        self.reservations.insert(allocation.id, allocation);
    }

    fn detach(&mut self, id: &ReservationId) -> Option<ReservationAllocation> {
        let allocation = self.reservations.remove(id)?;
        let span = allocation.span();
        if let Some(ids) = self.by_interval.get_mut(&span) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_interval.remove(&span);
            }
        }
        for (interval, resources) in &allocation.allocations {
            self.aggregate.remove(*interval, *resources);
        }
        Some(allocation)
    }
}

fn validate_shape(allocation: &ReservationAllocation) -> Result<(), EngineError> {
    if allocation.owner.is_empty() {
        return Err(EngineError::OwnerInformationCorrupted(allocation.id));
    }
    if allocation.allocations.is_empty() {
        return Err(EngineError::InvalidDefinition("allocation is empty"));
    }
    let mut start = Ms::MAX;
    let mut end = Ms::MIN;
    for (interval, resources) in &allocation.allocations {
        if interval.start >= interval.end {
            return Err(EngineError::InvalidDefinition("allocation interval is empty"));
        }
        if resources.is_zero() {
            return Err(EngineError::InvalidDefinition("allocation grants nothing"));
        }
        start = start.min(interval.start);
        end = end.max(interval.end);
    }
    if start != allocation.start || end != allocation.end {
        return Err(EngineError::InvalidDefinition("allocation span mismatch"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: Ms = 1_000 * HOUR_MS;

    fn gb(n: u64) -> ResourceVector {
        ResourceVector::new(1024 * n, n)
    }

    fn plan() -> Plan {
        Plan::from_config(&QueueConfig::new("dedicated", gb(8)))
    }

    fn allocation(pieces: &[(Ms, Ms, u64)]) -> ReservationAllocation {
        let def = ReservationDefinition::new(
            NOW,
            NOW + 24 * HOUR_MS,
            Interpreter::All,
            vec![ReservationRequest::new(gb(1), 1, 1, HOUR_MS)],
        );
        let map = pieces
            .iter()
            .map(|&(s, e, n)| (ReservationInterval::new(s, e), gb(n)))
            .collect();
        ReservationAllocation::new(ReservationId::new(), "alice", def, map, NOW)
    }

    #[test]
    fn add_and_query() {
        let mut p = plan();
        let a = allocation(&[(NOW, NOW + HOUR_MS, 4)]);
        let id = a.id;
        p.add_reservation(a, NOW).unwrap();

        assert!(p.contains(&id));
        assert_eq!(p.len(), 1);
        assert_eq!(p.total_allocation_between(ReservationInterval::new(NOW, NOW + HOUR_MS)), gb(4));
        assert_eq!(p.allocation_at(NOW + HOUR_MS), ResourceVector::ZERO);
        assert_eq!(p.earliest_start(), Some(NOW));
        assert_eq!(p.last_end(), Some(NOW + HOUR_MS));
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut p = plan();
        let a = allocation(&[(NOW, NOW + HOUR_MS, 1)]);
        p.add_reservation(a.clone(), NOW).unwrap();
        assert_eq!(p.add_reservation(a.clone(), NOW), Err(EngineError::DuplicateId(a.id)));
    }

    #[test]
    fn capacity_exceeded_leaves_plan_untouched() {
        let mut p = plan();
        p.add_reservation(allocation(&[(NOW, NOW + HOUR_MS, 6)]), NOW).unwrap();
        let before = p.clone();

        let err = p
            .add_reservation(allocation(&[(NOW + HOUR_MS / 2, NOW + 2 * HOUR_MS, 3)]), NOW)
            .unwrap_err();
        assert!(matches!(err, EngineError::CapacityExceeded { at, .. } if at == NOW + HOUR_MS / 2));
        assert_eq!(p, before);
    }

    #[test]
    fn update_replaces_atomically() {
        let mut p = plan();
        let a = allocation(&[(NOW, NOW + HOUR_MS, 8)]);
        let id = a.id;
        p.add_reservation(a, NOW).unwrap();

        // Would not fit next to the original, but replaces it
        let mut b = allocation(&[(NOW, NOW + 2 * HOUR_MS, 8)]);
        b.id = id;
        let previous = p.update_reservation(b, NOW).unwrap();
        assert_eq!(previous.end, NOW + HOUR_MS);
        assert_eq!(p.len(), 1);
        assert_eq!(p.allocation_at(NOW + HOUR_MS), gb(8));
    }

    #[test]
    fn failed_update_keeps_original() {
        let mut p = plan();
        let a = allocation(&[(NOW, NOW + HOUR_MS, 2)]);
        let id = a.id;
        p.add_reservation(a, NOW).unwrap();
        p.add_reservation(allocation(&[(NOW + HOUR_MS, NOW + 2 * HOUR_MS, 7)]), NOW)
            .unwrap();
        let before = p.clone();

        let mut b = allocation(&[(NOW, NOW + 2 * HOUR_MS, 2)]);
        b.id = id;
        assert!(p.update_reservation(b, NOW).is_err());
        assert_eq!(p, before);
    }

    #[test]
    fn update_and_delete_unknown() {
        let mut p = plan();
        let a = allocation(&[(NOW, NOW + HOUR_MS, 1)]);
        let id = a.id;
        assert_eq!(p.update_reservation(a, NOW), Err(EngineError::NotFound(id)));
        assert_eq!(p.delete_reservation(&id), Err(EngineError::NotFound(id)));
    }

    #[test]
    fn add_then_delete_restores_plan() {
        let mut p = plan();
        p.add_reservation(allocation(&[(NOW, NOW + HOUR_MS, 2)]), NOW).unwrap();
        let before = p.clone();

        let a = allocation(&[(NOW, NOW + HOUR_MS / 2, 3), (NOW + HOUR_MS, NOW + 3 * HOUR_MS, 1)]);
        let id = a.id;
        p.add_reservation(a, NOW).unwrap();
        let removed = p.delete_reservation(&id).unwrap();
        assert_eq!(removed.state, ReservationState::Deleted);
        assert_eq!(p, before);
    }

    #[test]
    fn archive_is_idempotent() {
        let mut p = plan();
        let short = allocation(&[(NOW, NOW + HOUR_MS, 1)]);
        let long = allocation(&[(NOW, NOW + 3 * HOUR_MS, 1)]);
        let (short_id, long_id) = (short.id, long.id);
        p.add_reservation(short, NOW).unwrap();
        p.add_reservation(long, NOW).unwrap();

        let expired = p.archive_expired(NOW + HOUR_MS);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, short_id);
        assert_eq!(expired[0].state, ReservationState::Expired);
        let after_first = p.clone();

        assert!(p.archive_expired(NOW + HOUR_MS).is_empty());
        assert_eq!(p, after_first);
        assert!(p.contains(&long_id));
        assert_eq!(p.allocation_at(NOW + HOUR_MS), gb(1));
    }

    #[test]
    fn advance_activates_then_expires() {
        let mut p = plan();
        let a = allocation(&[(NOW + HOUR_MS, NOW + 2 * HOUR_MS, 1)]);
        let id = a.id;
        p.add_reservation(a, NOW).unwrap();

        let outcome = p.advance(NOW);
        assert!(outcome.activated.is_empty());
        assert_eq!(p.last_step(), NOW);

        let outcome = p.advance(NOW + HOUR_MS);
        assert_eq!(outcome.activated, vec![id]);
        assert_eq!(p.get(&id).unwrap().state, ReservationState::Active);

        // Already active: not reported twice
        assert!(p.advance(NOW + HOUR_MS + 1).activated.is_empty());

        let outcome = p.advance(NOW + 2 * HOUR_MS);
        assert_eq!(outcome.expired.len(), 1);
        assert!(p.is_empty());
    }

    #[test]
    fn interval_queries() {
        let mut p = plan();
        let a = allocation(&[(NOW, NOW + HOUR_MS, 1)]);
        let b = allocation(&[(NOW + 2 * HOUR_MS, NOW + 3 * HOUR_MS, 1)]);
        let (a_id, b_id) = (a.id, b.id);
        p.add_reservation(a, NOW).unwrap();
        p.add_reservation(b, NOW).unwrap();

        let active: Vec<_> = p.reservations_active_at(NOW + 10).iter().map(|r| r.id).collect();
        assert_eq!(active, vec![a_id]);
        assert!(p.reservations_active_at(NOW + HOUR_MS).is_empty());

        let window = ReservationInterval::new(NOW + HOUR_MS / 2, NOW + 2 * HOUR_MS + 1);
        let mut overlapping: Vec<_> = p.reservations_overlapping(window).iter().map(|r| r.id).collect();
        overlapping.sort();
        let mut expected = vec![a_id, b_id];
        expected.sort();
        assert_eq!(overlapping, expected);

        let gap = ReservationInterval::new(NOW + HOUR_MS, NOW + 2 * HOUR_MS);
        assert!(p.reservations_overlapping(gap).is_empty());
    }

    #[test]
    fn reconfigure_refuses_shrink_below_commitments() {
        let mut p = plan();
        p.add_reservation(allocation(&[(NOW, NOW + HOUR_MS, 6)]), NOW).unwrap();

        let smaller = QueueConfig::new("dedicated", gb(4));
        assert!(matches!(
            p.reconfigure(&smaller, NOW),
            Err(EngineError::CapacityExceeded { .. })
        ));
        assert_eq!(p.capacity(), gb(8));

        // Once the commitment is in the past, shrinking is fine
        p.reconfigure(&smaller, NOW + HOUR_MS).unwrap();
        assert_eq!(p.capacity(), gb(4));

        // Policy fractions apply to future admissions only
        let tighter = QueueConfig::new("dedicated", gb(16)).with_average(0.25);
        p.reconfigure(&tighter, NOW).unwrap();
        assert_eq!(p.config().average_capacity, 0.25);
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn snapshot_round_trip() {
        let mut p = plan();
        p.add_reservation(allocation(&[(NOW, NOW + HOUR_MS, 2)]), NOW).unwrap();
        p.add_reservation(allocation(&[(NOW + HOUR_MS, NOW + 2 * HOUR_MS, 5)]), NOW)
            .unwrap();
        p.advance(NOW);

        let restored = Plan::from_snapshot(p.snapshot()).unwrap();
        assert_eq!(restored, p);
    }

    #[test]
    fn restore_checks_capacity() {
        let mut snap = plan().snapshot();
        snap.reservations.push(allocation(&[(NOW, NOW + HOUR_MS, 5)]));
        snap.reservations.push(allocation(&[(NOW, NOW + HOUR_MS, 5)]));
        assert!(matches!(
            Plan::from_snapshot(snap),
            Err(EngineError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn malformed_allocations_rejected() {
        let mut p = plan();
        let mut empty = allocation(&[(NOW, NOW + HOUR_MS, 1)]);
        empty.allocations.clear();
        assert!(matches!(
            p.add_reservation(empty, NOW),
            Err(EngineError::InvalidDefinition(_))
        ));

        let mut orphan = allocation(&[(NOW, NOW + HOUR_MS, 1)]);
        orphan.owner.clear();
        assert!(matches!(
            p.add_reservation(orphan, NOW),
            Err(EngineError::OwnerInformationCorrupted(_))
        ));
        assert!(p.is_empty());
    }
}
