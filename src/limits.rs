use crate::model::{HOUR_MS, Ms};

pub const MAX_QUEUES: usize = 1024;
pub const MAX_QUEUE_NAME_LEN: usize = 256;
pub const MAX_USER_LEN: usize = 256;
pub const MAX_NAME_LEN: usize = 1024;
pub const MAX_RESERVATIONS_PER_PLAN: usize = 100_000;
pub const MAX_REQUESTS_PER_DEFINITION: usize = 64;
pub const MAX_PARALLELISM: u32 = 1_000_000;

/// Upper bound on start times the greedy agent will try per request.
pub const MAX_CANDIDATE_STARTS: usize = 4096;

/// Furthest a deadline may lie from now.
pub const MAX_HORIZON_MS: Ms = 400 * 24 * HOUR_MS;

/// Longest accepted line on the JSON wire.
pub const MAX_LINE_LEN: usize = 1 << 20;

/// Largest single plan frame in a snapshot file.
pub const MAX_SNAPSHOT_FRAME_LEN: usize = 256 << 20;
