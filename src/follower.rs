use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::engine::ReservationSystem;

/// Background task that keeps every plan in step with the clock: expired
/// reservations are archived and started ones marked active.
pub async fn run_plan_follower(system: Arc<ReservationSystem>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let summary = system.synchronize_plans().await;
        if summary.activated > 0 || summary.expired > 0 {
            info!(
                plans = summary.plans,
                activated = summary.activated,
                expired = summary.expired,
                "plan follower step"
            );
        } else {
            debug!(plans = summary.plans, "plan follower step");
        }
    }
}
