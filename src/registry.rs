use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::warn;

use crate::config::QueueConfig;
use crate::engine::{EngineError, Plan};
use crate::limits::*;
use crate::model::*;

pub type SharedPlan = Arc<RwLock<Plan>>;

/// What a reload changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReloadOutcome {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    /// Queues whose new settings were refused. They keep their old ones.
    pub refused: Vec<(String, EngineError)>,
    /// Dropped queues with the reservations they held.
    pub removed: Vec<(String, Vec<ReservationId>)>,
}

/// Queue name → plan. Each plan carries its own lock, so work on different
/// queues never contends.
pub struct PlanRegistry {
    plans: DashMap<String, SharedPlan>,
}

impl Default for PlanRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanRegistry {
    pub fn new() -> Self {
        Self {
            plans: DashMap::new(),
        }
    }

    pub fn get(&self, queue: &str) -> Option<SharedPlan> {
        self.plans.get(queue).map(|p| p.value().clone())
    }

    pub fn contains(&self, queue: &str) -> bool {
        self.plans.contains_key(queue)
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Queue names, sorted.
    pub fn queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plans.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Every plan, sorted by queue name.
    pub fn plans(&self) -> Vec<(String, SharedPlan)> {
        let mut plans: Vec<(String, SharedPlan)> = self
            .plans
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        plans.sort_by(|a, b| a.0.cmp(&b.0));
        plans
    }

    /// Swap in a complete set of plans, returning the ones replaced.
    pub fn replace_all(&self, plans: Vec<Plan>) -> Vec<(String, SharedPlan)> {
        let previous = self.plans();
        self.plans.clear();
        for plan in plans {
            self.plans
                .insert(plan.queue().to_string(), Arc::new(RwLock::new(plan)));
        }
        metrics::gauge!(crate::observability::PLANS_ACTIVE).set(self.plans.len() as f64);
        previous
    }

    /// Bring the set of plans in line with `configs`: create new queues,
    /// resize existing ones, drop the rest. All configs are validated before
    /// anything changes.
    pub async fn reinitialize(
        &self,
        configs: &[QueueConfig],
        now: Ms,
    ) -> Result<ReloadOutcome, EngineError> {
        if configs.len() > MAX_QUEUES {
            return Err(EngineError::LimitExceeded("too many queues"));
        }
        let mut seen: HashSet<&str> = HashSet::new();
        for config in configs {
            config.validate()?;
            if !seen.insert(config.name.as_str()) {
                return Err(EngineError::InvalidQueueConfig {
                    queue: config.name.clone(),
                    reason: "duplicate queue name",
                });
            }
        }

        let mut outcome = ReloadOutcome::default();
        for config in configs {
            match self.get(&config.name) {
                Some(plan) => {
                    let mut guard = plan.write().await;
                    if guard.config() == *config {
                        continue;
                    }
                    match guard.reconfigure(config, now) {
                        Ok(()) => outcome.updated.push(config.name.clone()),
                        Err(e) => {
                            warn!(queue = %config.name, "refusing new plan settings: {e}");
                            outcome.refused.push((config.name.clone(), e));
                        }
                    }
                }
                None => {
                    self.plans.insert(
                        config.name.clone(),
                        Arc::new(RwLock::new(Plan::from_config(config))),
                    );
                    outcome.added.push(config.name.clone());
                }
            }
        }

        let stale: Vec<String> = self
            .queues()
            .into_iter()
            .filter(|q| !seen.contains(q.as_str()))
            .collect();
        for queue in stale {
            if let Some((_, plan)) = self.plans.remove(&queue) {
                let guard = plan.read().await;
                let ids = guard.reservations().map(|r| r.id).collect();
                outcome.removed.push((queue, ids));
            }
        }

        metrics::gauge!(crate::observability::PLANS_ACTIVE).set(self.plans.len() as f64);
        Ok(outcome)
    }
}
