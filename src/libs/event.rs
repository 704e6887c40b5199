use crate::libs::region::{Point, Region};

/// Differential call of one condition against another.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffCall {
    pub log2_fold: f64,
    pub p: f64,
}

/// Per-condition view of a binding event.
#[derive(Debug, Clone, PartialEq)]
pub struct CondCall {
    pub found: bool,
    pub signal: f64,
    /// Expected reads under the null, after control scaling
    pub control: f64,
    pub fold: f64,
    pub p: f64,
    pub q: f64,
    /// Fold change reached the configured minimum
    pub enriched: bool,
    /// Indexed by the other condition; `None` against itself or when untested
    pub diff: Vec<Option<DiffCall>>,
}

impl CondCall {
    pub fn new(found: bool, num_conditions: usize) -> Self {
        Self {
            found,
            signal: 0.0,
            control: 0.0,
            fold: 0.0,
            p: 1.0,
            q: 1.0,
            enriched: false,
            diff: vec![None; num_conditions],
        }
    }
}

/// A called binding event.
///
/// The point and containing region are fixed at creation; the per-condition
/// statistics are filled in by post-processing.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingEvent {
    point: Point,
    region: Option<Region>,
    /// Reads assigned per replicate
    pub rep_signal: Vec<f64>,
    /// Raw control reads per replicate around the event
    pub rep_control: Vec<f64>,
    pub conds: Vec<CondCall>,
}

impl BindingEvent {
    pub fn new(
        point: Point,
        region: Option<Region>,
        rep_signal: Vec<f64>,
        rep_control: Vec<f64>,
        found: Vec<bool>,
    ) -> Self {
        let n = found.len();
        Self {
            point,
            region,
            rep_signal,
            rep_control,
            conds: found.into_iter().map(|f| CondCall::new(f, n)).collect(),
        }
    }

    pub fn point(&self) -> &Point {
        &self.point
    }

    pub fn containing_region(&self) -> Option<&Region> {
        self.region.as_ref()
    }

    pub fn is_found_in(&self, cond: usize) -> bool {
        self.conds[cond].found
    }

    /// Significance of signal over control in `cond`; lower is stronger.
    pub fn q_value(&self, cond: usize) -> f64 {
        self.conds[cond].q
    }

    /// Found in `cond` and significant at `q_thres`.
    pub fn passes(&self, cond: usize, q_thres: f64) -> bool {
        self.is_found_in(cond) && self.q_value(cond) <= q_thres
    }

    /// Significantly stronger in `cond` than in `other`.
    pub fn is_diff_enriched(&self, cond: usize, other: usize, q_thres: f64, diff_p: f64) -> bool {
        if !self.passes(cond, q_thres) {
            return false;
        }
        match self.conds[cond].diff.get(other).copied().flatten() {
            Some(d) => d.p <= diff_p && d.log2_fold > 0.0,
            None => false,
        }
    }
}

/// Events of `cond` passing the q-value threshold.
pub fn count_in_condition(events: &[BindingEvent], cond: usize, q_thres: f64) -> usize {
    events.iter().filter(|e| e.passes(cond, q_thres)).count()
}

pub fn count_diff(
    events: &[BindingEvent],
    cond: usize,
    other: usize,
    q_thres: f64,
    diff_p: f64,
) -> usize {
    events
        .iter()
        .filter(|e| e.is_diff_enriched(cond, other, q_thres, diff_p))
        .count()
}
