use crate::libs::design::Experiment;
use crate::libs::event::BindingEvent;
use statrs::distribution::{DiscreteCDF, Poisson};

/// Scores every event's enrichment over control, in place.
pub trait SignificanceTester {
    fn test(&self, exp: &Experiment, events: &mut [BindingEvent]) -> anyhow::Result<()>;
}

/// Poisson test of pooled condition signal against the larger of scaled
/// control and genome-wide background.
pub struct EnrichmentSignificance {
    min_fold: f64,
    mappable_len: f64,
    model_width: i64,
}

impl EnrichmentSignificance {
    pub fn new(min_fold: f64, mappable_len: f64, model_width: i64) -> Self {
        Self {
            min_fold,
            mappable_len,
            model_width,
        }
    }
}

/// `P(X >= k)` for `X ~ Poisson(lambda)`.
pub fn poisson_upper_tail(k: u64, lambda: f64) -> f64 {
    if k == 0 {
        return 1.0;
    }
    match Poisson::new(lambda) {
        Ok(p) => p.sf(k - 1),
        // zero expectation: any read at all is infinitely unlikely
        Err(_) => 0.0,
    }
}

/// Benjamini-Hochberg adjusted p-values, in input order.
///
/// ```
/// use bindem::libs::significance::benjamini_hochberg;
/// let q = benjamini_hochberg(&[0.01, 0.04, 0.03]);
/// assert!((q[0] - 0.03).abs() < 1e-12);
/// assert!((q[1] - 0.04).abs() < 1e-12);
/// assert!((q[2] - 0.04).abs() < 1e-12);
/// ```
pub fn benjamini_hochberg(p: &[f64]) -> Vec<f64> {
    let n = p.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| p[a].total_cmp(&p[b]));

    let mut q = vec![1.0; n];
    let mut running = 1.0f64;
    for (rank, &i) in order.iter().enumerate().rev() {
        let adjusted = p[i] * n as f64 / (rank + 1) as f64;
        running = running.min(adjusted);
        q[i] = running.min(1.0);
    }
    q
}

impl SignificanceTester for EnrichmentSignificance {
    fn test(&self, exp: &Experiment, events: &mut [BindingEvent]) -> anyhow::Result<()> {
        for (c, cond) in exp.conditions.iter().enumerate() {
            let background = exp.condition_signal_total(c) as f64 * self.model_width as f64
                / self.mappable_len;

            for event in events.iter_mut() {
                let signal: f64 = cond.replicates.iter().map(|&r| event.rep_signal[r]).sum();
                let control: f64 = cond
                    .replicates
                    .iter()
                    .filter(|&&r| exp.replicates[r].has_control())
                    .map(|&r| event.rep_control[r] * exp.replicates[r].control_scaling)
                    .sum();
                let expected = control.max(background);
                let fold = if expected > 0.0 {
                    signal / expected
                } else if signal > 0.0 {
                    f64::INFINITY
                } else {
                    0.0
                };

                let call = &mut event.conds[c];
                call.signal = signal;
                call.control = expected;
                call.fold = fold;
                call.enriched = fold >= self.min_fold;
                call.p = if call.enriched {
                    poisson_upper_tail(signal.round() as u64, expected)
                } else {
                    1.0
                };
            }

            let ps: Vec<f64> = events.iter().map(|e| e.conds[c].p).collect();
            for (event, q) in events.iter_mut().zip(benjamini_hochberg(&ps)) {
                let call = &mut event.conds[c];
                call.q = if call.enriched { q } else { 1.0 };
            }
        }
        Ok(())
    }
}
