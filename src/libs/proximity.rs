//! Distance distributions between called events, and from events to motifs.

use crate::libs::config::MOTIF_MIN_SCORE_FRACTION;
use crate::libs::event::BindingEvent;
use crate::libs::motif::{MotifScanner, WeightMatrix};
use indexmap::IndexMap;
use rayon::prelude::*;

/// Sorted event locations per chromosome.
pub type ChromLocations = IndexMap<String, Vec<i64>>;

/// Fixed-range histogram over `[0, window)` with `window / 5` bins.
///
/// Values outside the range still count as samples but land in no bin.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    window: i64,
    counts: Vec<usize>,
    samples: usize,
}

impl Histogram {
    pub fn new(window: i64) -> Self {
        let bins = (window / 5).max(1) as usize;
        Self {
            window,
            counts: vec![0; bins],
            samples: 0,
        }
    }

    pub fn bin_width(&self) -> f64 {
        self.window as f64 / self.counts.len() as f64
    }

    pub fn add(&mut self, value: i64) {
        self.samples += 1;
        if value >= 0 && value < self.window {
            let bin = (value as f64 / self.bin_width()) as usize;
            let last = self.counts.len() - 1;
            self.counts[bin.min(last)] += 1;
        }
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// `bin_start\tcount` lines.
    pub fn to_text(&self) -> String {
        let width = self.bin_width();
        self.counts
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{}\t{}\n", i as f64 * width, c))
            .collect()
    }
}

/// For each location of a sorted list, the distance to the nearest other
/// one. A lone location yields nothing.
///
/// ```
/// use bindem::libs::proximity::nearest_within;
/// assert_eq!(nearest_within(&[10, 15, 100]), vec![5, 5, 85]);
/// assert!(nearest_within(&[10]).is_empty());
/// ```
pub fn nearest_within(sorted: &[i64]) -> Vec<i64> {
    if sorted.len() < 2 {
        return vec![];
    }
    (0..sorted.len())
        .map(|i| {
            let left = if i > 0 { sorted[i] - sorted[i - 1] } else { i64::MAX };
            let right = if i + 1 < sorted.len() {
                sorted[i + 1] - sorted[i]
            } else {
                i64::MAX
            };
            left.min(right)
        })
        .collect()
}

/// For each location in `from`, the distance to the nearest location in the
/// sorted `to`. Nothing when `to` is empty.
///
/// ```
/// use bindem::libs::proximity::nearest_across;
/// assert_eq!(nearest_across(&[10, 1000], &[11]), vec![1, 989]);
/// assert_eq!(nearest_across(&[11], &[10, 1000]), vec![1]);
/// ```
pub fn nearest_across(from: &[i64], to: &[i64]) -> Vec<i64> {
    if to.is_empty() {
        return vec![];
    }
    from.iter()
        .map(|&x| {
            let i = to.partition_point(|&y| y < x);
            let right = to.get(i).map(|&y| y - x).unwrap_or(i64::MAX);
            let left = if i > 0 { x - to[i - 1] } else { i64::MAX };
            left.min(right)
        })
        .collect()
}

/// One histogram per condition of distances to the nearest event of the
/// same condition on the same chromosome.
pub fn intra_condition_histograms(
    groups: &[(String, ChromLocations)],
    window: i64,
) -> Vec<(String, Histogram)> {
    groups
        .par_iter()
        .map(|(name, by_chrom)| {
            let mut histo = Histogram::new(window);
            for locs in by_chrom.values() {
                for d in nearest_within(locs) {
                    histo.add(d);
                }
            }
            (name.clone(), histo)
        })
        .collect()
}

/// One histogram per ordered pair of distinct conditions `(A, B)`, of the
/// distance from each event of A to the nearest event of B.
pub fn inter_condition_histograms(
    groups: &[(String, ChromLocations)],
    window: i64,
) -> Vec<(String, Histogram)> {
    if groups.len() < 2 {
        return vec![];
    }
    let pairs: Vec<(usize, usize)> = (0..groups.len())
        .flat_map(|a| (0..groups.len()).filter(move |&b| b != a).map(move |b| (a, b)))
        .collect();
    pairs
        .par_iter()
        .map(|&(a, b)| {
            let mut histo = Histogram::new(window);
            for (chrom, locs) in &groups[a].1 {
                if let Some(other) = groups[b].1.get(chrom) {
                    for d in nearest_across(locs, other) {
                        histo.add(d);
                    }
                }
            }
            (format!("{} vs {}", groups[a].0, groups[b].0), histo)
        })
        .collect()
}

/// Text file body: a title line, then one `#Condition:` section per histogram.
pub fn render_sections(title: &str, sections: &[(String, Histogram)]) -> String {
    let mut out = format!("#{}\n\n", title);
    for (name, histo) in sections {
        out += &format!("#Condition: {}\n", name);
        out += &histo.to_text();
        out += "\n";
    }
    out
}

/// Proximity analytics over a finished event set.
pub struct ProximityHistogram<'a> {
    names: Vec<String>,
    events: &'a [BindingEvent],
    q_thres: f64,
}

impl<'a> ProximityHistogram<'a> {
    /// `names` are the condition names, in condition order.
    pub fn new(names: Vec<String>, events: &'a [BindingEvent], q_thres: f64) -> Self {
        Self {
            names,
            events,
            q_thres,
        }
    }

    /// Locations of events found in `cond` at `q_thres`, grouped by
    /// chromosome and sorted.
    pub fn events_by_chromosome(&self, cond: usize, q_thres: f64) -> ChromLocations {
        let mut by_chrom: ChromLocations = IndexMap::new();
        for event in self.events.iter().filter(|e| e.passes(cond, q_thres)) {
            by_chrom
                .entry(event.point().chrom.clone())
                .or_default()
                .push(event.point().pos);
        }
        for locs in by_chrom.values_mut() {
            locs.sort_unstable();
        }
        by_chrom
    }

    fn groups(&self) -> Vec<(String, ChromLocations)> {
        (0..self.names.len())
            .map(|c| (self.names[c].clone(), self.events_by_chromosome(c, self.q_thres)))
            .collect()
    }

    pub fn intra_condition_distances(&self, window: i64) -> Vec<(String, Histogram)> {
        intra_condition_histograms(&self.groups(), window)
    }

    pub fn inter_condition_distances(&self, window: i64) -> Vec<(String, Histogram)> {
        inter_condition_histograms(&self.groups(), window)
    }

    /// Distances from the events of `cond` to their closest motif hit.
    ///
    /// Only events whose containing region reaches more than `window` past
    /// them on both sides are scanned. Events with no hit in their region
    /// add no sample.
    pub fn peak_to_motif_distances(
        &self,
        cond: usize,
        window: i64,
        scanner: &dyn MotifScanner,
        motif: &WeightMatrix,
    ) -> anyhow::Result<Histogram> {
        let threshold = motif.max_score() * MOTIF_MIN_SCORE_FRACTION;
        let usable: Vec<&BindingEvent> = self
            .events
            .iter()
            .filter(|e| e.passes(cond, self.q_thres))
            .filter(|e| match e.containing_region() {
                Some(r) => e.point().pos - r.start > window && r.end - e.point().pos > window,
                None => false,
            })
            .collect();

        let distances: Vec<Option<i64>> = usable
            .par_iter()
            .map(|e| -> anyhow::Result<Option<i64>> {
                // filtered on the region above
                let region = match e.containing_region() {
                    Some(r) => r,
                    None => return Ok(None),
                };
                let scores = scanner.scan(region, motif)?;
                let index = e.point().pos - region.start;
                Ok(scores
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| **s >= threshold)
                    .map(|(x, _)| (x as i64 - index).abs())
                    .min())
            })
            .collect::<anyhow::Result<_>>()?;

        let mut histo = Histogram::new(window);
        for d in distances.into_iter().flatten() {
            histo.add(d);
        }
        Ok(histo)
    }

    /// Peak-to-motif histograms for every condition that has a motif.
    pub fn peak_to_motif_all(
        &self,
        window: i64,
        scanner: &dyn MotifScanner,
        motifs: &[Option<&WeightMatrix>],
    ) -> anyhow::Result<Vec<(String, Histogram)>> {
        let mut sections = vec![];
        for (c, name) in self.names.iter().enumerate() {
            if let Some(Some(motif)) = motifs.get(c) {
                let histo = self.peak_to_motif_distances(c, window, scanner, motif)?;
                sections.push((name.clone(), histo));
            }
        }
        Ok(sections)
    }
}
