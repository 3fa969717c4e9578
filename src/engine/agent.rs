use std::collections::BTreeMap;

use crate::limits::*;
use crate::model::*;

use super::ledger::StepFunction;
use super::plan::Plan;
use super::EngineError;

/// Placement strategy used to turn a definition into concrete allocations.
#[derive(Debug, Clone, PartialEq)]
pub enum ReservationAgent {
    Greedy(GreedyReservationAgent),
}

impl Default for ReservationAgent {
    fn default() -> Self {
        ReservationAgent::Greedy(GreedyReservationAgent::default())
    }
}

impl ReservationAgent {
    pub fn create_allocation(
        &self,
        definition: &ReservationDefinition,
        view: PlanView<'_>,
        now: Ms,
    ) -> Result<BTreeMap<ReservationInterval, ResourceVector>, EngineError> {
        match self {
            ReservationAgent::Greedy(agent) => agent.create_allocation(definition, view, now),
        }
    }
}

/// The agent's picture of a plan: committed usage, without the reservation
/// being replaced, plus its own tentative placements, under a ceiling.
pub struct PlanView<'a> {
    ledger: &'a StepFunction,
    replacing: Option<StepFunction>,
    tentative: StepFunction,
    ceiling: ResourceVector,
}

impl<'a> PlanView<'a> {
    /// `cluster` caps the plan's own capacity; `replacing` names a reservation
    /// whose resources are treated as free.
    pub fn new(plan: &'a Plan, cluster: ResourceVector, replacing: Option<&ReservationId>) -> Self {
        Self {
            ledger: plan.aggregate(),
            replacing: replacing
                .and_then(|id| plan.get(id))
                .map(StepFunction::from_allocation),
            tentative: StepFunction::new(),
            ceiling: plan.capacity().component_min(&cluster),
        }
    }

    pub fn ceiling(&self) -> ResourceVector {
        self.ceiling
    }

    /// Free resources over `span`, one entry per constant piece.
    pub fn free_segments(&self, span: ReservationInterval) -> Vec<(ReservationInterval, ResourceVector)> {
        self.ledger
            .overlay(&self.tentative, self.replacing.as_ref(), span)
            .into_iter()
            .map(|(segment, used)| (segment, self.ceiling.saturating_sub(&used)))
            .collect()
    }

    pub fn free_at(&self, t: Ms) -> ResourceVector {
        let mut used = self.ledger.value_at(t) + self.tentative.value_at(t);
        if let Some(r) = &self.replacing {
            used -= r.value_at(t);
        }
        self.ceiling.saturating_sub(&used)
    }

    /// Times strictly inside `span` where free resources may change.
    fn change_points(&self, span: ReservationInterval) -> Vec<Ms> {
        let mut points: Vec<Ms> = self
            .ledger
            .breakpoints_within(span)
            .chain(self.tentative.breakpoints_within(span))
            .collect();
        if let Some(r) = &self.replacing {
            points.extend(r.breakpoints_within(span));
        }
        points
    }

    fn commit(&mut self, pieces: &[(ReservationInterval, ResourceVector)]) {
        for (interval, resources) in pieces {
            self.tentative.add(*interval, *resources);
        }
    }

    fn checkpoint(&self) -> StepFunction {
        self.tentative.clone()
    }

    fn rollback(&mut self, checkpoint: StepFunction) {
        self.tentative = checkpoint;
    }

    fn into_allocations(self) -> BTreeMap<ReservationInterval, ResourceVector> {
        self.tentative.to_allocations()
    }
}

/// One request placed at a concrete start.
#[derive(Debug, Clone, PartialEq)]
struct Placement {
    end: Ms,
    pieces: Vec<(ReservationInterval, ResourceVector)>,
}

/// Places each request at the earliest start that fits.
#[derive(Debug, Clone, PartialEq)]
pub struct GreedyReservationAgent {
    max_candidates: usize,
}

impl Default for GreedyReservationAgent {
    fn default() -> Self {
        Self::new(MAX_CANDIDATE_STARTS)
    }
}

impl GreedyReservationAgent {
    pub fn new(max_candidates: usize) -> Self {
        Self { max_candidates }
    }

    pub fn create_allocation(
        &self,
        definition: &ReservationDefinition,
        mut view: PlanView<'_>,
        now: Ms,
    ) -> Result<BTreeMap<ReservationInterval, ResourceVector>, EngineError> {
        let earliest = definition.arrival.max(now);
        let deadline = definition.deadline;
        let requests = &definition.requests;

        match definition.interpreter {
            Interpreter::All => {
                for (i, request) in requests.iter().enumerate() {
                    let placement = self
                        .place(request, &view, earliest, deadline)
                        .ok_or(EngineError::Infeasible { request: Some(i) })?;
                    view.commit(&placement.pieces);
                }
            }
            Interpreter::Any => {
                let placement = requests
                    .iter()
                    .find_map(|request| self.place(request, &view, earliest, deadline))
                    .ok_or(EngineError::Infeasible { request: None })?;
                view.commit(&placement.pieces);
            }
            Interpreter::Order => {
                let mut cursor = earliest;
                for (i, request) in requests.iter().enumerate() {
                    let placement = self
                        .place(request, &view, cursor, deadline)
                        .ok_or(EngineError::Infeasible { request: Some(i) })?;
                    cursor = placement.end;
                    view.commit(&placement.pieces);
                }
            }
            Interpreter::OrderNoGap => self.place_chain(requests, &mut view, earliest, deadline)?,
        }

        let allocations = view.into_allocations();
        if allocations.is_empty() {
            return Err(EngineError::Infeasible { request: None });
        }
        Ok(allocations)
    }

    /// Earliest placement of `request` inside `[earliest, deadline]`.
    fn place(
        &self,
        request: &ReservationRequest,
        view: &PlanView<'_>,
        earliest: Ms,
        deadline: Ms,
    ) -> Option<Placement> {
        let latest_start = deadline.checked_sub(request.duration)?;
        if latest_start < earliest {
            return None;
        }
        self.candidate_starts(view, earliest, latest_start, &[0])
            .into_iter()
            .find_map(|start| fit_at(request, view, start))
    }

    /// Place `requests` back to back, retrying the head at successive starts.
    fn place_chain(
        &self,
        requests: &[ReservationRequest],
        view: &mut PlanView<'_>,
        earliest: Ms,
        deadline: Ms,
    ) -> Result<(), EngineError> {
        let mut offsets = Vec::with_capacity(requests.len());
        let mut total: Ms = 0;
        for request in requests {
            offsets.push(total);
            total = total.saturating_add(request.duration);
        }
        let latest_head = deadline.saturating_sub(total);
        if latest_head < earliest {
            return Err(EngineError::Infeasible { request: None });
        }

        for start in self.candidate_starts(view, earliest, latest_head, &offsets) {
            let checkpoint = view.checkpoint();
            if try_chain(requests, view, start) {
                return Ok(());
            }
            view.rollback(checkpoint);
        }
        Err(EngineError::Infeasible { request: None })
    }

    /// Starts worth trying in `[earliest, latest]`: the bounds, plus every
    /// start that lines a request (at its offset into the chain) up with a
    /// change in free resources. Capped at `max_candidates`.
    fn candidate_starts(&self, view: &PlanView<'_>, earliest: Ms, latest: Ms, offsets: &[Ms]) -> Vec<Ms> {
        let mut starts = vec![earliest, latest];
        for &offset in offsets {
            let lo = earliest.saturating_add(offset);
            let hi = latest.saturating_add(offset);
            if lo < hi {
                starts.extend(
                    view.change_points(ReservationInterval::new(lo, hi))
                        .into_iter()
                        .map(|t| t - offset),
                );
            }
        }
        starts.sort_unstable();
        starts.dedup();
        starts.truncate(self.max_candidates);
        starts
    }
}

fn try_chain(requests: &[ReservationRequest], view: &mut PlanView<'_>, start: Ms) -> bool {
    let mut cursor = start;
    for request in requests {
        match fit_at(request, view, cursor) {
            Some(placement) => {
                view.commit(&placement.pieces);
                cursor = placement.end;
            }
            None => return false,
        }
    }
    true
}

/// Try to run `request` over `[start, start + duration)`.
fn fit_at(request: &ReservationRequest, view: &PlanView<'_>, start: Ms) -> Option<Placement> {
    let span = ReservationInterval::new(start, start.checked_add(request.duration)?);
    let parallelism = request.parallelism as u64;
    let gang = request.gang as u64;
    let mut pieces: Vec<(ReservationInterval, ResourceVector)> = Vec::new();

    for (segment, free) in view.free_segments(span) {
        let fit = request.capability.units_within(&free);
        let units = if request.elastic {
            let u = fit.min(parallelism);
            u - u % gang
        } else if fit >= parallelism {
            parallelism
        } else {
            0
        };
        let needed = if request.elastic { gang } else { parallelism };
        if units == 0 || units < needed {
            return None;
        }
        let granted = request.capability.scale(units);
        if let Some((prev, r)) = pieces.last_mut()
            && *r == granted
            && prev.end == segment.start
        {
            prev.end = segment.end;
            continue;
        }
        pieces.push((segment, granted));
    }

    Some(Placement {
        end: span.end,
        pieces,
    })
}

/// Reject definitions no agent could meaningfully place.
pub fn validate_definition(definition: &ReservationDefinition, now: Ms) -> Result<(), EngineError> {
    if definition.requests.is_empty() {
        return Err(EngineError::InvalidDefinition("no resource requests"));
    }
    if definition.requests.len() > MAX_REQUESTS_PER_DEFINITION {
        return Err(EngineError::LimitExceeded("too many requests in definition"));
    }
    if definition.deadline <= definition.arrival {
        return Err(EngineError::InvalidDefinition("deadline must be after arrival"));
    }
    if definition.deadline <= now {
        return Err(EngineError::InvalidDefinition("deadline has already passed"));
    }
    if definition.deadline.saturating_sub(now) > MAX_HORIZON_MS {
        return Err(EngineError::LimitExceeded("deadline too far in the future"));
    }
    if let Some(name) = &definition.name
        && name.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("reservation name too long"));
    }
    for request in &definition.requests {
        if request.duration <= 0 {
            return Err(EngineError::InvalidDefinition("request duration must be positive"));
        }
        if request.parallelism == 0 {
            return Err(EngineError::InvalidDefinition("parallelism must be at least 1"));
        }
        if request.parallelism > MAX_PARALLELISM {
            return Err(EngineError::LimitExceeded("parallelism too large"));
        }
        if request.gang == 0 || request.gang > request.parallelism {
            return Err(EngineError::InvalidDefinition("gang must be between 1 and parallelism"));
        }
        if request.capability.is_zero() {
            return Err(EngineError::InvalidDefinition("request capability is zero"));
        }
    }
    Ok(())
}
