use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;

// ── Identity ─────────────────────────────────────────────────────

/// Opaque reservation identifier. Immutable once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(pub Ulid);

impl ReservationId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reservation_{}", self.0)
    }
}

impl FromStr for ReservationId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("reservation_").unwrap_or(s);
        Ulid::from_string(raw).map(Self)
    }
}

// ── Time ─────────────────────────────────────────────────────────

/// Half-open interval `[start, end)`, ordered by `start` then `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReservationInterval {
    pub start: Ms,
    pub end: Ms,
}

impl ReservationInterval {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "interval start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &ReservationInterval) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains(&self, other: &ReservationInterval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersection(&self, other: &ReservationInterval) -> Option<ReservationInterval> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(ReservationInterval { start, end })
    }
}

impl fmt::Display for ReservationInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ── Resources ────────────────────────────────────────────────────

/// Non-negative multi-dimensional resource quantity.
///
/// Subtraction below zero is a programming error and panics; ledger code only
/// ever subtracts what it previously added. Use [`ResourceVector::saturating_sub`]
/// for headroom arithmetic against external ceilings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceVector {
    pub memory: u64,
    pub vcores: u64,
}

impl ResourceVector {
    pub const ZERO: ResourceVector = ResourceVector { memory: 0, vcores: 0 };

    pub const fn new(memory: u64, vcores: u64) -> Self {
        Self { memory, vcores }
    }

    pub fn is_zero(&self) -> bool {
        self.memory == 0 && self.vcores == 0
    }

    /// Component-wise `self <= other`.
    pub fn fits_in(&self, other: &ResourceVector) -> bool {
        self.memory <= other.memory && self.vcores <= other.vcores
    }

    pub fn scale(&self, n: u64) -> ResourceVector {
        ResourceVector {
            memory: self.memory.saturating_mul(n),
            vcores: self.vcores.saturating_mul(n),
        }
    }

    pub fn saturating_sub(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            memory: self.memory.saturating_sub(other.memory),
            vcores: self.vcores.saturating_sub(other.vcores),
        }
    }

    pub fn component_max(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            memory: self.memory.max(other.memory),
            vcores: self.vcores.max(other.vcores),
        }
    }

    pub fn component_min(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            memory: self.memory.min(other.memory),
            vcores: self.vcores.min(other.vcores),
        }
    }

    /// How many whole copies of `self` fit inside `available`.
    /// A zero vector fits without bound.
    pub fn units_within(&self, available: &ResourceVector) -> u64 {
        let per_dim = |need: u64, have: u64| if need == 0 { u64::MAX } else { have / need };
        per_dim(self.memory, available.memory).min(per_dim(self.vcores, available.vcores))
    }

    /// Largest per-dimension ratio of `self` to `total`.
    pub fn dominant_share(&self, total: &ResourceVector) -> f64 {
        let ratio = |used: u64, cap: u64| match (used, cap) {
            (0, _) => 0.0,
            (_, 0) => f64::INFINITY,
            (u, c) => u as f64 / c as f64,
        };
        ratio(self.memory, total.memory).max(ratio(self.vcores, total.vcores))
    }

    /// True if any component exceeds `fraction` of the matching component of `total`.
    pub fn exceeds_fraction(&self, total: &ResourceVector, fraction: f64) -> bool {
        self.memory as f64 > total.memory as f64 * fraction
            || self.vcores as f64 > total.vcores as f64 * fraction
    }
}

impl Add for ResourceVector {
    type Output = ResourceVector;

    fn add(self, rhs: ResourceVector) -> ResourceVector {
        ResourceVector {
            memory: self.memory + rhs.memory,
            vcores: self.vcores + rhs.vcores,
        }
    }
}

impl AddAssign for ResourceVector {
    fn add_assign(&mut self, rhs: ResourceVector) {
        *self = *self + rhs;
    }
}

impl Sub for ResourceVector {
    type Output = ResourceVector;

    fn sub(self, rhs: ResourceVector) -> ResourceVector {
        match (
            self.memory.checked_sub(rhs.memory),
            self.vcores.checked_sub(rhs.vcores),
        ) {
            (Some(memory), Some(vcores)) => ResourceVector { memory, vcores },
            _ => panic!("resource underflow: {self} - {rhs}"),
        }
    }
}

impl SubAssign for ResourceVector {
    fn sub_assign(&mut self, rhs: ResourceVector) {
        *self = *self - rhs;
    }
}

impl fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<memory:{}, vcores:{}>", self.memory, self.vcores)
    }
}

// ── Requests ─────────────────────────────────────────────────────

/// One resource ask: `gang..=parallelism` concurrent copies of `capability`
/// running for `duration`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub capability: ResourceVector,
    pub parallelism: u32,
    pub gang: u32,
    pub duration: Ms,
    /// Rigid requests need `parallelism` copies at every instant. Elastic ones
    /// need at least `gang` and take whole gangs up to `parallelism` as capacity allows.
    #[serde(default)]
    pub elastic: bool,
}

impl ReservationRequest {
    pub fn new(capability: ResourceVector, parallelism: u32, gang: u32, duration: Ms) -> Self {
        Self {
            capability,
            parallelism,
            gang,
            duration,
            elastic: false,
        }
    }

    pub fn elastic(mut self) -> Self {
        self.elastic = true;
        self
    }

    /// Resources needed to run every copy at once.
    pub fn full_demand(&self) -> ResourceVector {
        self.capability.scale(self.parallelism as u64)
    }
}

/// How the requests of one definition combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Interpreter {
    /// Every request is placed, independently.
    All,
    /// Exactly one request is placed: the first that fits.
    Any,
    /// Requests run in sequence; gaps allowed.
    Order,
    /// Requests run back to back.
    OrderNoGap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationDefinition {
    pub arrival: Ms,
    pub deadline: Ms,
    pub requests: Vec<ReservationRequest>,
    pub interpreter: Interpreter,
    #[serde(default)]
    pub name: Option<String>,
}

impl ReservationDefinition {
    pub fn new(
        arrival: Ms,
        deadline: Ms,
        interpreter: Interpreter,
        requests: Vec<ReservationRequest>,
    ) -> Self {
        Self {
            arrival,
            deadline,
            requests,
            interpreter,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

// ── Committed allocations ────────────────────────────────────────

/// Lifecycle of a reservation. A plan stores only `Admitted` and `Active`;
/// allocations handed back on removal carry `Expired` or `Deleted`. A
/// rejected submission never becomes an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Admitted,
    Active,
    Expired,
    Deleted,
}

/// The committed result of a submission: resources granted per interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationAllocation {
    pub id: ReservationId,
    pub owner: String,
    pub definition: ReservationDefinition,
    #[serde(with = "interval_map")]
    pub allocations: BTreeMap<ReservationInterval, ResourceVector>,
    /// Earliest start across `allocations`.
    pub start: Ms,
    /// Latest end across `allocations`.
    pub end: Ms,
    pub accepted_at: Ms,
    pub state: ReservationState,
}

impl ReservationAllocation {
    /// Build an allocation in state `Admitted`. `allocations` must be non-empty.
    pub fn new(
        id: ReservationId,
        owner: impl Into<String>,
        definition: ReservationDefinition,
        allocations: BTreeMap<ReservationInterval, ResourceVector>,
        accepted_at: Ms,
    ) -> Self {
        let start = allocations.keys().map(|i| i.start).min().unwrap_or(accepted_at);
        let end = allocations.keys().map(|i| i.end).max().unwrap_or(accepted_at);
        Self {
            id,
            owner: owner.into(),
            definition,
            allocations,
            start,
            end,
            accepted_at,
            state: ReservationState::Admitted,
        }
    }

    pub fn span(&self) -> ReservationInterval {
        ReservationInterval {
            start: self.start,
            end: self.end,
        }
    }

    /// Resources held at instant `t`.
    pub fn resources_at(&self, t: Ms) -> ResourceVector {
        self.allocations
            .range(..=ReservationInterval { start: t, end: Ms::MAX })
            .filter(|(interval, _)| interval.contains_instant(t))
            .fold(ResourceVector::ZERO, |acc, (_, r)| acc + *r)
    }

    /// Peak resources held at any instant.
    pub fn peak(&self) -> ResourceVector {
        self.allocations
            .keys()
            .map(|i| self.resources_at(i.start))
            .fold(ResourceVector::ZERO, |acc, r| acc.component_max(&r))
    }
}

/// Serialize interval-keyed maps as a list of pairs so JSON can carry them.
mod interval_map {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::{ReservationInterval, ResourceVector};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<ReservationInterval, ResourceVector>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<ReservationInterval, ResourceVector>, D::Error> {
        let pairs: Vec<(ReservationInterval, ResourceVector)> = Vec::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

/// Lifecycle notifications, broadcast per queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlanEvent {
    Admitted {
        id: ReservationId,
        queue: String,
        span: ReservationInterval,
    },
    Updated {
        id: ReservationId,
        queue: String,
        span: ReservationInterval,
    },
    Activated {
        id: ReservationId,
        queue: String,
    },
    Expired {
        id: ReservationId,
        queue: String,
    },
    Deleted {
        id: ReservationId,
        queue: String,
    },
}

impl PlanEvent {
    pub fn id(&self) -> ReservationId {
        match self {
            PlanEvent::Admitted { id, .. }
            | PlanEvent::Updated { id, .. }
            | PlanEvent::Activated { id, .. }
            | PlanEvent::Expired { id, .. }
            | PlanEvent::Deleted { id, .. } => *id,
        }
    }

    pub fn queue(&self) -> &str {
        match self {
            PlanEvent::Admitted { queue, .. }
            | PlanEvent::Updated { queue, .. }
            | PlanEvent::Activated { queue, .. }
            | PlanEvent::Expired { queue, .. }
            | PlanEvent::Deleted { queue, .. } => queue,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanInfo {
    pub queue: String,
    pub capacity: ResourceVector,
    pub reservation_window: Ms,
    pub instantaneous_max_capacity: f64,
    pub average_capacity: f64,
    pub reservations: usize,
    pub last_step: Ms,
}
