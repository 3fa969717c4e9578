use crate::model::{Ms, ReservationId, ResourceVector};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    DuplicateId(ReservationId),
    NotFound(ReservationId),
    QueueNotFound(String),
    /// No placement satisfies the definition. Carries the index of the first
    /// request that could not be placed, if a single one is to blame.
    Infeasible { request: Option<usize> },
    OutOfWindow { arrival: Ms, latest: Ms },
    InstantaneousCapacityExceeded { at: Ms, share: f64, limit: f64 },
    AverageCapacityExceeded { average: f64, limit: f64 },
    AccessDenied { user: String, id: ReservationId },
    OwnerInformationCorrupted(ReservationId),
    CapacityExceeded {
        at: Ms,
        required: ResourceVector,
        capacity: ResourceVector,
    },
    InvalidDefinition(&'static str),
    InvalidQueueConfig { queue: String, reason: &'static str },
    LimitExceeded(&'static str),
}

impl EngineError {
    /// Stable short code for clients and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::DuplicateId(_) => "duplicate_id",
            EngineError::NotFound(_) => "not_found",
            EngineError::QueueNotFound(_) => "queue_not_found",
            EngineError::Infeasible { .. } => "infeasible",
            EngineError::OutOfWindow { .. } => "out_of_window",
            EngineError::InstantaneousCapacityExceeded { .. } => "instantaneous_capacity_exceeded",
            EngineError::AverageCapacityExceeded { .. } => "average_capacity_exceeded",
            EngineError::AccessDenied { .. } => "access_denied",
            EngineError::OwnerInformationCorrupted(_) => "owner_information_corrupted",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::InvalidDefinition(_) => "invalid_definition",
            EngineError::InvalidQueueConfig { .. } => "invalid_queue_config",
            EngineError::LimitExceeded(_) => "limit_exceeded",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::DuplicateId(id) => write!(f, "reservation already exists: {id}"),
            EngineError::NotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::QueueNotFound(q) => write!(f, "no plan for queue: {q}"),
            EngineError::Infeasible { request: Some(i) } => {
                write!(f, "no feasible placement for request {i}")
            }
            EngineError::Infeasible { request: None } => write!(f, "no feasible placement"),
            EngineError::OutOfWindow { arrival, latest } => {
                write!(f, "arrival {arrival} is beyond the reservation window (latest {latest})")
            }
            EngineError::InstantaneousCapacityExceeded { at, share, limit } => write!(
                f,
                "instantaneous capacity exceeded at {at}: share {share:.4} > limit {limit:.4}"
            ),
            EngineError::AverageCapacityExceeded { average, limit } => write!(
                f,
                "average capacity exceeded: {average:.4} > limit {limit:.4}"
            ),
            EngineError::AccessDenied { user, id } => {
                write!(f, "user {user} may not modify {id}")
            }
            EngineError::OwnerInformationCorrupted(id) => {
                write!(f, "owner information of {id} is corrupted")
            }
            EngineError::CapacityExceeded {
                at,
                required,
                capacity,
            } => write!(f, "plan capacity {capacity} exceeded at {at}: {required} required"),
            EngineError::InvalidDefinition(msg) => write!(f, "invalid definition: {msg}"),
            EngineError::InvalidQueueConfig { queue, reason } => {
                write!(f, "invalid configuration for queue {queue}: {reason}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}
