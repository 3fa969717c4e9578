use std::collections::BTreeMap;
use std::ops::Bound::Excluded;

use crate::model::*;

/// Piecewise-constant resource usage over time.
///
/// Key `t` holds the value in effect on `[t, next key)`. Usage is zero before
/// the first key and from the last key on. Adjacent equal values are always
/// coalesced, so two functions describing the same usage compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepFunction {
    steps: BTreeMap<Ms, ResourceVector>,
}

impl StepFunction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_allocation(allocation: &ReservationAllocation) -> Self {
        let mut f = Self::new();
        for (interval, resources) in &allocation.allocations {
            f.add(*interval, *resources);
        }
        f
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of stored change points.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn value_at(&self, t: Ms) -> ResourceVector {
        self.steps
            .range(..=t)
            .next_back()
            .map(|(_, v)| *v)
            .unwrap_or(ResourceVector::ZERO)
    }

    pub fn add(&mut self, span: ReservationInterval, delta: ResourceVector) {
        if delta.is_zero() {
            return;
        }
        self.split_at(span.start);
        self.split_at(span.end);
        for (_, v) in self.steps.range_mut(span.start..span.end) {
            *v += delta;
        }
        self.coalesce(span);
    }

    /// Subtract `delta` over `span`. Panics if usage would go negative.
    pub fn remove(&mut self, span: ReservationInterval, delta: ResourceVector) {
        if delta.is_zero() {
            return;
        }
        self.split_at(span.start);
        self.split_at(span.end);
        for (_, v) in self.steps.range_mut(span.start..span.end) {
            *v -= delta;
        }
        self.coalesce(span);
    }

    fn split_at(&mut self, t: Ms) {
        if !self.steps.contains_key(&t) {
            let v = self.value_at(t);
            self.steps.insert(t, v);
        }
    }

    /// Drop keys in `[span.start, span.end]` that repeat their predecessor's value.
    fn coalesce(&mut self, span: ReservationInterval) {
        let mut prev = self
            .steps
            .range(..span.start)
            .next_back()
            .map(|(_, v)| *v)
            .unwrap_or(ResourceVector::ZERO);
        let keys: Vec<Ms> = self.steps.range(span.start..=span.end).map(|(k, _)| *k).collect();
        for k in keys {
            let v = self.steps[&k];
            if v == prev {
                self.steps.remove(&k);
            } else {
                prev = v;
            }
        }
    }

    /// Component-wise maximum over `span`.
    pub fn peak_between(&self, span: ReservationInterval) -> ResourceVector {
        self.breakpoints_within(span)
            .map(|t| self.steps[&t])
            .fold(self.value_at(span.start), |acc, v| acc.component_max(&v))
    }

    /// Change points strictly inside `span`.
    pub fn breakpoints_within(&self, span: ReservationInterval) -> impl Iterator<Item = Ms> + '_ {
        self.steps
            .range((Excluded(span.start), Excluded(span.end)))
            .map(|(k, _)| *k)
    }

    /// Constant pieces covering `span` exactly, zero pieces included.
    pub fn segments(&self, span: ReservationInterval) -> Vec<(ReservationInterval, ResourceVector)> {
        let mut out = Vec::new();
        let mut cursor = span.start;
        let mut value = self.value_at(span.start);
        for (&t, &v) in self.steps.range((Excluded(span.start), Excluded(span.end))) {
            out.push((ReservationInterval::new(cursor, t), value));
            cursor = t;
            value = v;
        }
        out.push((ReservationInterval::new(cursor, span.end), value));
        out
    }

    /// The non-zero pieces of the whole function.
    pub fn to_allocations(&self) -> BTreeMap<ReservationInterval, ResourceVector> {
        let mut out = BTreeMap::new();
        let mut iter = self.steps.iter().peekable();
        while let Some((&t, &v)) = iter.next() {
            if let Some(&(&next, _)) = iter.peek()
                && !v.is_zero()
            {
                out.insert(ReservationInterval::new(t, next), v);
            }
        }
        out
    }

    pub fn first_change(&self) -> Option<Ms> {
        self.steps.keys().next().copied()
    }

    pub fn last_change(&self) -> Option<Ms> {
        self.steps.keys().next_back().copied()
    }

    /// Integral of the dominant share against `total` over `span`, in share·ms.
    pub fn share_integral(&self, span: ReservationInterval, total: &ResourceVector) -> f64 {
        self.segments(span)
            .iter()
            .map(|(i, v)| v.dominant_share(total) * i.duration_ms() as f64)
            .sum()
    }

    /// Pointwise `self + plus - minus` over `span`, cut at every change of any operand.
    ///
    /// `minus` must be dominated by `self + plus`; in practice it is a
    /// reservation already recorded in `self`.
    pub fn overlay(
        &self,
        plus: &StepFunction,
        minus: Option<&StepFunction>,
        span: ReservationInterval,
    ) -> Vec<(ReservationInterval, ResourceVector)> {
        let mut cuts: Vec<Ms> = self
            .breakpoints_within(span)
            .chain(plus.breakpoints_within(span))
            .collect();
        if let Some(m) = minus {
            cuts.extend(m.breakpoints_within(span));
        }
        cuts.push(span.start);
        cuts.push(span.end);
        cuts.sort_unstable();
        cuts.dedup();

        cuts.windows(2)
            .map(|w| {
                let mut v = self.value_at(w[0]) + plus.value_at(w[0]);
                if let Some(m) = minus {
                    v -= m.value_at(w[0]);
                }
                (ReservationInterval::new(w[0], w[1]), v)
            })
            .collect()
    }
}
