use crate::config::QueueConfig;
use crate::model::*;

use super::ledger::StepFunction;
use super::plan::Plan;
use super::EngineError;

/// Slack for float comparisons against configured fractions.
const SHARE_EPSILON: f64 = 1e-9;

/// Admission rules applied on top of raw plan capacity.
#[derive(Debug, Clone, PartialEq)]
pub enum SharingPolicy {
    CapacityOverTime(CapacityOverTimePolicy),
}

impl SharingPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        SharingPolicy::CapacityOverTime(CapacityOverTimePolicy {
            reservation_window: config.reservation_window,
            instantaneous_max_capacity: config.instantaneous_max_capacity,
            average_capacity: config.average_capacity,
        })
    }

    pub fn reservation_window(&self) -> Ms {
        match self {
            SharingPolicy::CapacityOverTime(p) => p.reservation_window,
        }
    }

    pub fn check_window(&self, arrival: Ms, now: Ms) -> Result<(), EngineError> {
        match self {
            SharingPolicy::CapacityOverTime(p) => p.check_window(arrival, now),
        }
    }

    /// Decide whether `candidate` may be committed to `plan`.
    /// `replacing` is the allocation it supersedes on update.
    pub fn validate(
        &self,
        plan: &Plan,
        candidate: &ReservationAllocation,
        replacing: Option<&ReservationAllocation>,
        now: Ms,
    ) -> Result<(), EngineError> {
        match self {
            SharingPolicy::CapacityOverTime(p) => p.validate(plan, candidate, replacing, now),
        }
    }
}

/// Bounds a queue's share of its plan both at every instant and averaged
/// over the reservation window starting now.
#[derive(Debug, Clone, PartialEq)]
pub struct CapacityOverTimePolicy {
    pub reservation_window: Ms,
    pub instantaneous_max_capacity: f64,
    pub average_capacity: f64,
}

impl CapacityOverTimePolicy {
    fn check_window(&self, arrival: Ms, now: Ms) -> Result<(), EngineError> {
        let latest = now.saturating_add(self.reservation_window);
        if arrival > latest {
            return Err(EngineError::OutOfWindow { arrival, latest });
        }
        Ok(())
    }

    fn validate(
        &self,
        plan: &Plan,
        candidate: &ReservationAllocation,
        replacing: Option<&ReservationAllocation>,
        now: Ms,
    ) -> Result<(), EngineError> {
        self.check_window(candidate.definition.arrival, now)?;

        let capacity = plan.capacity();
        let ledger = plan.aggregate();
        let plus = StepFunction::from_allocation(candidate);
        let minus = replacing.map(StepFunction::from_allocation);

        for (segment, post) in ledger.overlay(&plus, minus.as_ref(), candidate.span()) {
            if plus.value_at(segment.start).is_zero() {
                continue;
            }
            if post.exceeds_fraction(&capacity, self.instantaneous_max_capacity) {
                return Err(EngineError::InstantaneousCapacityExceeded {
                    at: segment.start,
                    share: post.dominant_share(&capacity),
                    limit: self.instantaneous_max_capacity,
                });
            }
        }

        let window = ReservationInterval::new(now, now.saturating_add(self.reservation_window));
        if !candidate.span().overlaps(&window) {
            return Ok(());
        }
        let length = window.duration_ms() as f64;
        let before = ledger.share_integral(window, &capacity) / length;
        let after = ledger
            .overlay(&plus, minus.as_ref(), window)
            .iter()
            .map(|(i, v)| v.dominant_share(&capacity) * i.duration_ms() as f64)
            .sum::<f64>()
            / length;
        // A change that does not raise the average is never the one to break it.
        if after > self.average_capacity + SHARE_EPSILON && after > before + SHARE_EPSILON {
            return Err(EngineError::AverageCapacityExceeded {
                average: after,
                limit: self.average_capacity,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    const NOW: Ms = 1_000 * HOUR_MS;

    fn plan(config: QueueConfig) -> Plan {
        Plan::from_config(&config)
    }

    fn allocation(start: Ms, end: Ms, resources: ResourceVector) -> ReservationAllocation {
        let def = ReservationDefinition::new(
            start,
            end,
            Interpreter::All,
            vec![ReservationRequest::new(resources, 1, 1, end - start)],
        );
        let mut map = BTreeMap::new();
        map.insert(ReservationInterval::new(start, end), resources);
        ReservationAllocation::new(ReservationId::new(), "u", def, map, NOW)
    }

    fn cfg() -> QueueConfig {
        QueueConfig::new("q", ResourceVector::new(8192, 8))
    }

    #[test]
    fn arrival_beyond_window_is_rejected() {
        let p = plan(cfg().with_window(HOUR_MS));
        let a = allocation(NOW + 2 * HOUR_MS, NOW + 3 * HOUR_MS, ResourceVector::new(1024, 1));
        assert!(matches!(
            p.policy().validate(&p, &a, None, NOW),
            Err(EngineError::OutOfWindow { .. })
        ));
        let b = allocation(NOW + HOUR_MS, NOW + 2 * HOUR_MS, ResourceVector::new(1024, 1));
        assert!(p.policy().validate(&p, &b, None, NOW).is_ok());
    }

    #[test]
    fn instantaneous_limit_is_per_dimension() {
        let p = plan(cfg().with_instantaneous_max(0.5));
        let at_limit = allocation(NOW, NOW + HOUR_MS, ResourceVector::new(4096, 1));
        assert!(p.policy().validate(&p, &at_limit, None, NOW).is_ok());

        let over_memory = allocation(NOW, NOW + HOUR_MS, ResourceVector::new(4097, 1));
        assert!(matches!(
            p.policy().validate(&p, &over_memory, None, NOW),
            Err(EngineError::InstantaneousCapacityExceeded { at, .. }) if at == NOW
        ));

        let over_vcores = allocation(NOW, NOW + HOUR_MS, ResourceVector::new(1024, 5));
        assert!(p.policy().validate(&p, &over_vcores, None, NOW).is_err());
    }

    #[test]
    fn instantaneous_limit_counts_existing_load() {
        let mut p = plan(cfg().with_instantaneous_max(0.5));
        p.add_reservation(allocation(NOW, NOW + HOUR_MS, ResourceVector::new(3072, 3)), NOW)
            .unwrap();
        let more = allocation(NOW + HOUR_MS / 2, NOW + 2 * HOUR_MS, ResourceVector::new(2048, 2));
        assert!(matches!(
            p.policy().validate(&p, &more, None, NOW),
            Err(EngineError::InstantaneousCapacityExceeded { at, .. }) if at == NOW + HOUR_MS / 2
        ));
    }

    #[test]
    fn average_limit_over_window() {
        let p = plan(cfg().with_window(10 * HOUR_MS).with_average(0.1));
        // full plan for 2h of a 10h window: average 0.2
        let big = allocation(NOW, NOW + 2 * HOUR_MS, ResourceVector::new(8192, 8));
        assert!(matches!(
            p.policy().validate(&p, &big, None, NOW),
            Err(EngineError::AverageCapacityExceeded { .. })
        ));
        // full plan for 1h: average 0.1, exactly at the limit
        let ok = allocation(NOW, NOW + HOUR_MS, ResourceVector::new(8192, 8));
        assert!(p.policy().validate(&p, &ok, None, NOW).is_ok());
    }

    #[test]
    fn replacing_allocation_is_excluded() {
        let mut p = plan(cfg().with_instantaneous_max(0.5));
        let old = allocation(NOW, NOW + HOUR_MS, ResourceVector::new(4096, 4));
        p.add_reservation(old.clone(), NOW).unwrap();

        let mut moved = allocation(NOW, NOW + HOUR_MS, ResourceVector::new(4096, 4));
        moved.id = old.id;
        // Counted twice without exclusion
        assert!(p.policy().validate(&p, &moved, None, NOW).is_err());
        assert!(p.policy().validate(&p, &moved, Some(&old), NOW).is_ok());
    }
}
