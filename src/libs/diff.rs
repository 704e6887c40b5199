//! Differential enrichment between conditions.
//!
//! Per-replicate event counts round-trip through the counts file, so the
//! tests here consume exactly what was written out.

use crate::libs::design::Experiment;
use crate::libs::event::{BindingEvent, DiffCall};
use crate::libs::io::{create_writer, open_reader};
use statrs::distribution::{Binomial, Discrete, DiscreteCDF};
use std::io::{BufRead, Write};
use std::path::Path;

/// Events by replicates count matrix, tested against one reference condition.
#[derive(Debug, Clone)]
pub struct CountsDataset {
    /// `cond:rep` column labels
    pub labels: Vec<String>,
    /// Condition of each column
    pub conditions: Vec<usize>,
    pub num_conditions: usize,
    /// Row names, the event points
    pub names: Vec<String>,
    pub counts: Vec<Vec<f64>>,
    pub norm_factors: Vec<f64>,
    pub reference: usize,
    /// Per row, the call of the reference against every condition
    pub results: Vec<Vec<Option<DiffCall>>>,
}

impl CountsDataset {
    pub fn from_events(exp: &Experiment, events: &[BindingEvent], reference: usize) -> Self {
        let n_rep = exp.replicates.len();
        Self {
            labels: (0..n_rep).map(|r| exp.replicate_label(r)).collect(),
            conditions: exp.replicates.iter().map(|r| r.condition).collect(),
            num_conditions: exp.num_conditions(),
            names: events.iter().map(|e| e.point().to_string()).collect(),
            counts: events.iter().map(|e| e.rep_signal.clone()).collect(),
            norm_factors: vec![1.0; n_rep],
            reference,
            results: vec![],
        }
    }

    /// Loads a counts file; columns are matched to replicates by label.
    pub fn read(path: &Path, exp: &Experiment, reference: usize) -> anyhow::Result<Self> {
        let reader = open_reader(&path.to_string_lossy())?;
        let mut lines = reader.lines();

        let header = match lines.next() {
            Some(line) => line?,
            None => anyhow::bail!("Empty counts file {}", path.display()),
        };
        let labels: Vec<String> = header
            .trim_start_matches('#')
            .split('\t')
            .skip(1)
            .map(|s| s.to_string())
            .collect();
        let mut conditions = vec![];
        for label in &labels {
            let r = (0..exp.replicates.len())
                .find(|&r| &exp.replicate_label(r) == label)
                .ok_or_else(|| anyhow::anyhow!("Unknown replicate {} in {}", label, path.display()))?;
            conditions.push(exp.replicates[r].condition);
        }

        let mut names = vec![];
        let mut counts = vec![];
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != labels.len() + 1 {
                anyhow::bail!("Expected {} columns: {}", labels.len() + 1, line);
            }
            names.push(fields[0].to_string());
            counts.push(
                fields[1..]
                    .iter()
                    .map(|f| f.parse::<f64>())
                    .collect::<Result<Vec<_>, _>>()?,
            );
        }

        Ok(Self {
            norm_factors: vec![1.0; labels.len()],
            labels,
            conditions,
            num_conditions: exp.num_conditions(),
            names,
            counts,
            reference,
            results: vec![],
        })
    }

    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        let mut writer = create_writer(&path.to_string_lossy())?;
        writeln!(writer, "#Point\t{}", self.labels.join("\t"))?;
        for (name, row) in self.names.iter().zip(&self.counts) {
            let row: Vec<String> = row.iter().map(|v| format!("{:.2}", v)).collect();
            writeln!(writer, "{}\t{}", name, row.join("\t"))?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Column sums.
    pub fn lib_sizes(&self) -> Vec<f64> {
        let mut sizes = vec![0.0; self.labels.len()];
        for row in &self.counts {
            for (s, v) in sizes.iter_mut().zip(row) {
                *s += v;
            }
        }
        sizes
    }

    /// One replicate's counts, scaled to the mean effective library size.
    pub fn normalized(&self, k: usize) -> Vec<f64> {
        let eff = self.effective_lib_sizes();
        let mean_lib = eff.iter().sum::<f64>() / eff.len().max(1) as f64;
        self.counts
            .iter()
            .map(|row| if eff[k] > 0.0 { row[k] * mean_lib / eff[k] } else { 0.0 })
            .collect()
    }

    /// Normalised counts of a condition's columns, summed per row.
    pub fn pooled(&self, cond: usize) -> Vec<f64> {
        let eff = self.effective_lib_sizes();
        let mean_lib = eff.iter().sum::<f64>() / eff.len().max(1) as f64;
        self.counts
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .filter(|(k, _)| self.conditions[*k] == cond)
                    .map(|(k, v)| if eff[k] > 0.0 { v * mean_lib / eff[k] } else { 0.0 })
                    .sum()
            })
            .collect()
    }

    pub fn effective_lib_sizes(&self) -> Vec<f64> {
        self.lib_sizes()
            .iter()
            .zip(&self.norm_factors)
            .map(|(l, f)| l * f)
            .collect()
    }

    /// Writes the reference condition's calls into the events.
    pub fn update_events(&self, events: &mut [BindingEvent]) -> anyhow::Result<()> {
        if self.results.len() != events.len() {
            anyhow::bail!(
                "Differential results cover {} events, expected {}",
                self.results.len(),
                events.len()
            );
        }
        for ((event, name), calls) in events.iter_mut().zip(&self.names).zip(&self.results) {
            if &event.point().to_string() != name {
                anyhow::bail!("Counts row {} does not match event {}", name, event.point());
            }
            event.conds[self.reference].diff = calls.clone();
        }
        Ok(())
    }
}

pub trait Normalizer {
    fn normalize(&self, data: CountsDataset) -> CountsDataset;
}

/// Trimmed mean of M-values.
pub struct TmmNormalization {
    m_trim: f64,
    a_trim: f64,
}

impl Default for TmmNormalization {
    fn default() -> Self {
        Self::new(0.3, 0.05)
    }
}

impl TmmNormalization {
    pub fn new(m_trim: f64, a_trim: f64) -> Self {
        Self { m_trim, a_trim }
    }

    /// The column whose upper quartile is closest to the mean upper quartile.
    fn reference_column(data: &CountsDataset, libs: &[f64]) -> usize {
        let uq: Vec<f64> = (0..libs.len())
            .map(|k| {
                let mut col: Vec<f64> = data
                    .counts
                    .iter()
                    .map(|row| if libs[k] > 0.0 { row[k] / libs[k] } else { 0.0 })
                    .collect();
                col.sort_by(|a, b| a.total_cmp(b));
                col.get((col.len() as f64 * 0.75) as usize)
                    .copied()
                    .unwrap_or(0.0)
            })
            .collect();
        let mean = uq.iter().sum::<f64>() / uq.len().max(1) as f64;
        (0..uq.len())
            .min_by(|&a, &b| (uq[a] - mean).abs().total_cmp(&(uq[b] - mean).abs()))
            .unwrap_or(0)
    }

    fn factor(&self, data: &CountsDataset, k: usize, r: usize, libs: &[f64]) -> f64 {
        let (nk, nr) = (libs[k], libs[r]);
        if k == r || nk <= 0.0 || nr <= 0.0 {
            return 1.0;
        }
        // (M, A, weight) for rows with reads in both columns
        let mut rows: Vec<(f64, f64, f64)> = data
            .counts
            .iter()
            .filter(|row| row[k] > 0.0 && row[r] > 0.0)
            .map(|row| {
                let (yk, yr) = (row[k] / nk, row[r] / nr);
                let m = (yk / yr).log2();
                let a = 0.5 * (yk * yr).log2();
                let var = (nk - row[k]) / (nk * row[k]) + (nr - row[r]) / (nr * row[r]);
                (m, a, var)
            })
            .filter(|(m, a, _)| m.is_finite() && a.is_finite())
            .collect();
        if rows.is_empty() {
            return 1.0;
        }

        let n = rows.len();
        let keep_between = |lo_frac: f64, sorted_vals: &mut Vec<f64>| -> (f64, f64) {
            sorted_vals.sort_by(|a, b| a.total_cmp(b));
            let lo = (n as f64 * lo_frac).floor() as usize;
            let hi = n - lo;
            if lo >= hi {
                return (f64::NEG_INFINITY, f64::INFINITY);
            }
            (sorted_vals[lo], sorted_vals[hi - 1])
        };
        let (m_lo, m_hi) = keep_between(self.m_trim, &mut rows.iter().map(|x| x.0).collect());
        let (a_lo, a_hi) = keep_between(self.a_trim, &mut rows.iter().map(|x| x.1).collect());
        rows.retain(|(m, a, _)| *m >= m_lo && *m <= m_hi && *a >= a_lo && *a <= a_hi);

        let (num, den) = rows
            .iter()
            .filter(|(_, _, v)| *v > 0.0)
            .fold((0.0, 0.0), |(num, den), (m, _, v)| (num + m / v, den + 1.0 / v));
        if den > 0.0 {
            2f64.powf(num / den)
        } else {
            1.0
        }
    }
}

impl Normalizer for TmmNormalization {
    fn normalize(&self, mut data: CountsDataset) -> CountsDataset {
        let libs = data.lib_sizes();
        if libs.is_empty() {
            return data;
        }
        let r = Self::reference_column(&data, &libs);
        let mut factors: Vec<f64> = (0..libs.len())
            .map(|k| self.factor(&data, k, r, &libs))
            .collect();

        // scale to a geometric mean of one
        let log_mean = factors.iter().map(|f| f.ln()).sum::<f64>() / factors.len() as f64;
        for f in factors.iter_mut() {
            *f /= log_mean.exp();
        }
        data.norm_factors = factors;
        data
    }
}

pub trait DiffTester {
    fn test(&self, data: CountsDataset) -> anyhow::Result<CountsDataset>;
}

/// Exact test on pooled counts: given the total of two conditions, the
/// reference count is binomial with the reference's share of the
/// normalised library size.
pub struct ExactDiffTester;

/// Two-sided p: the mass of all outcomes no more likely than `k`.
///
/// The pmf is unimodal, so the opposite tail starts at the first outcome
/// past the mode that is no more likely than `k`. Both tails come from the
/// cdf, found by bisection, instead of summing every outcome.
pub fn binomial_two_sided(k: u64, n: u64, p: f64) -> f64 {
    if n == 0 {
        return 1.0;
    }
    let p = p.clamp(0.0, 1.0);
    let binom = match Binomial::new(p, n) {
        Ok(b) => b,
        Err(_) => return 1.0,
    };
    let mode = (((n + 1) as f64 * p).floor() as u64).min(n);
    let observed = binom.pmf(k);
    let threshold = observed * (1.0 + 1e-7);
    if binom.pmf(mode) <= threshold {
        return 1.0;
    }

    let total = if k < mode {
        // first x in (mode, n] with pmf(x) <= threshold; pmf falls there
        let (mut lo, mut hi) = (mode + 1, n + 1);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if binom.pmf(mid) <= threshold {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        let upper = if lo > n { 0.0 } else { binom.sf(lo - 1) };
        binom.cdf(k) + upper
    } else {
        // one past the last x in [0, mode) with pmf(x) <= threshold; pmf rises there
        let (mut lo, mut hi) = (0, mode);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if binom.pmf(mid) <= threshold {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let lower = if lo == 0 { 0.0 } else { binom.cdf(lo - 1) };
        binom.sf(k - 1) + lower
    };
    total.min(1.0)
}

impl DiffTester for ExactDiffTester {
    fn test(&self, mut data: CountsDataset) -> anyhow::Result<CountsDataset> {
        let eff = data.effective_lib_sizes();
        let lib_of = |cond: usize| -> f64 {
            (0..eff.len())
                .filter(|&k| data.conditions[k] == cond)
                .map(|k| eff[k])
                .sum()
        };
        let count_of = |row: &[f64], cond: usize| -> f64 {
            row.iter()
                .enumerate()
                .filter(|(k, _)| data.conditions[*k] == cond)
                .map(|(_, v)| v)
                .sum()
        };

        let reference = data.reference;
        let lib_ref = lib_of(reference);
        let mut results = Vec::with_capacity(data.counts.len());
        for row in &data.counts {
            let x = count_of(row, reference);
            let calls: Vec<Option<DiffCall>> = (0..data.num_conditions)
                .map(|o| {
                    let lib_other = lib_of(o);
                    if o == reference || lib_ref <= 0.0 || lib_other <= 0.0 {
                        return None;
                    }
                    let y = count_of(row, o);
                    let share = lib_ref / (lib_ref + lib_other);
                    let (xk, yk) = (x.round() as u64, y.round() as u64);
                    Some(DiffCall {
                        log2_fold: ((x + 0.5) / lib_ref / ((y + 0.5) / lib_other)).log2(),
                        p: binomial_two_sided(xk, xk + yk, share),
                    })
                })
                .collect();
            results.push(calls);
        }
        data.results = results;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::design::{ReadHits, ReplicateSpec, Strand};
    use crate::libs::region::Point;
    use approx::assert_relative_eq;

    fn experiment() -> Experiment {
        let spec = |cond: &str, rep: &str| ReplicateSpec {
            condition: cond.to_string(),
            name: rep.to_string(),
            signal: ReadHits::from_hits(vec![("chr1", 10, Strand::Plus)]),
            control: None,
        };
        Experiment::new(
            None,
            vec![spec("dex", "rep1"), spec("dex", "rep2"), spec("etoh", "rep1")],
        )
        .unwrap()
    }

    fn events(rows: &[[f64; 3]]) -> Vec<BindingEvent> {
        rows.iter()
            .enumerate()
            .map(|(i, row)| {
                BindingEvent::new(
                    Point::new("chr1", 1000 * (i as i64 + 1)),
                    None,
                    row.to_vec(),
                    vec![0.0; 3],
                    vec![true, true],
                )
            })
            .collect()
    }

    #[test]
    fn test_counts_file_round_trip() {
        let exp = experiment();
        let evs = events(&[[10.0, 12.0, 3.0], [5.5, 4.0, 6.0]]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.replicates.counts");
        CountsDataset::from_events(&exp, &evs, 0).write(&path).unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("#Point\tdex:rep1\tdex:rep2\tetoh:rep1\n"));

        let data = CountsDataset::read(&path, &exp, 1).unwrap();
        assert_eq!(data.conditions, vec![0, 0, 1]);
        assert_eq!(data.names, vec!["chr1:1000", "chr1:2000"]);
        assert_relative_eq!(data.counts[1][0], 5.5);
        assert_eq!(data.reference, 1);
        assert_eq!(data.lib_sizes(), vec![15.5, 16.0, 9.0]);
        // mean library 13.5
        let scaled = data.normalized(2);
        assert_relative_eq!(scaled[0], 4.5);
        assert_relative_eq!(scaled[1], 9.0);

        assert!(CountsDataset::read(&dir.path().join("missing"), &exp, 0).is_err());
    }

    #[test]
    fn test_tmm_equal_libraries() {
        let exp = experiment();
        let evs = events(&[
            [10.0, 10.0, 10.0],
            [20.0, 20.0, 20.0],
            [30.0, 30.0, 30.0],
            [40.0, 40.0, 40.0],
        ]);
        let data = TmmNormalization::default().normalize(CountsDataset::from_events(&exp, &evs, 0));
        for f in &data.norm_factors {
            assert_relative_eq!(*f, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_tmm_composition_bias() {
        let exp = experiment();
        // one dominant event in the last column inflates its library
        let mut rows = vec![];
        for i in 1..=20 {
            let v = 10.0 * i as f64;
            rows.push([v, v, v]);
        }
        rows.push([10.0, 10.0, 2000.0]);
        let data = TmmNormalization::default().normalize(CountsDataset::from_events(
            &exp,
            &events(&rows),
            0,
        ));
        assert!(data.norm_factors[2] < data.norm_factors[0]);
    }

    #[test]
    fn test_binomial_two_sided() {
        assert_relative_eq!(binomial_two_sided(5, 10, 0.5), 1.0, epsilon = 1e-9);
        assert!(binomial_two_sided(10, 10, 0.5) < 0.01);
        assert_eq!(binomial_two_sided(0, 0, 0.5), 1.0);
    }

    /// Brute-force sum over every outcome.
    fn two_sided_by_sum(k: u64, n: u64, p: f64) -> f64 {
        let binom = Binomial::new(p, n).unwrap();
        let observed = binom.pmf(k);
        (0..=n)
            .map(|x| binom.pmf(x))
            .filter(|&px| px <= observed * (1.0 + 1e-7))
            .sum::<f64>()
            .min(1.0)
    }

    #[test]
    fn test_binomial_two_sided_tails() {
        for &(n, p) in &[(10, 0.5), (37, 0.3), (200, 0.05), (150, 0.8), (60, 0.999)] {
            for k in 0..=n {
                assert_relative_eq!(
                    binomial_two_sided(k, n, p),
                    two_sided_by_sum(k, n, p),
                    epsilon = 1e-9,
                    max_relative = 1e-6
                );
            }
        }
        // deep counts stay cheap and sane
        let pv = binomial_two_sided(52_000, 100_000, 0.5);
        assert!(pv > 0.0 && pv < 1e-9);
        assert_relative_eq!(binomial_two_sided(50_000, 100_000, 0.5), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_exact_test_and_update() {
        let exp = experiment();
        let mut evs = events(&[
            [50.0, 50.0, 2.0],
            [10.0, 10.0, 10.0],
            [20.0, 20.0, 20.0],
            [30.0, 30.0, 30.0],
        ]);
        let data = CountsDataset::from_events(&exp, &evs, 0);
        let data = TmmNormalization::default().normalize(data);
        let data = ExactDiffTester.test(data).unwrap();
        data.update_events(&mut evs).unwrap();

        let call = evs[0].conds[0].diff[1].unwrap();
        assert!(call.log2_fold > 0.0);
        assert!(call.p < 0.01);
        assert!(evs[0].conds[0].diff[0].is_none());
        // the other direction was not tested with this reference
        assert!(evs[0].conds[1].diff[0].is_none());

        let mut short = evs[..2].to_vec();
        assert!(data.update_events(&mut short).is_err());
    }
}
