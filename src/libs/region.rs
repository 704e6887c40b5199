use crate::libs::config::Config;
use crate::libs::design::Experiment;
use crate::libs::io::open_reader;
use indexmap::IndexMap;
use lazy_static::lazy_static;
use rayon::prelude::*;
use regex::Regex;
use statrs::distribution::{DiscreteCDF, Poisson};
use std::fmt;
use std::io::BufRead;
use std::str::FromStr;

/// Sliding step of the potential region scanner
pub const POTREG_BIN_STEP: i64 = 100;

lazy_static! {
    static ref RE_REGION: Regex = Regex::new(r"^([^\s:]+):(\d+)(?:-(\d+))?$").unwrap();
}

/// A single genomic coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Point {
    pub chrom: String,
    pub pos: i64,
}

impl Point {
    pub fn new(chrom: &str, pos: i64) -> Self {
        Self {
            chrom: chrom.to_string(),
            pos,
        }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chrom, self.pos)
    }
}

impl FromStr for Point {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = RE_REGION
            .captures(s.trim())
            .ok_or_else(|| anyhow::anyhow!("Not a point: {}", s))?;
        if caps.get(3).is_some() {
            anyhow::bail!("Expected a point but got a region: {}", s);
        }
        Ok(Point::new(&caps[1], caps[2].parse()?))
    }
}

/// A closed genomic interval, `start..=end`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Region {
    pub chrom: String,
    pub start: i64,
    pub end: i64,
}

impl Region {
    pub fn new(chrom: &str, start: i64, end: i64) -> Self {
        Self {
            chrom: chrom.to_string(),
            start,
            end,
        }
    }

    pub fn width(&self) -> i64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, pos: i64) -> bool {
        pos >= self.start && pos <= self.end
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.chrom == other.chrom && self.start <= other.end && other.start <= self.end
    }

    pub fn midpoint(&self) -> Point {
        Point::new(&self.chrom, (self.start + self.end) / 2)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.chrom, self.start, self.end)
    }
}

impl FromStr for Region {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = RE_REGION
            .captures(s.trim())
            .ok_or_else(|| anyhow::anyhow!("Not a region: {}", s))?;
        let start: i64 = caps[2].parse()?;
        let end: i64 = match caps.get(3) {
            Some(m) => m.as_str().parse()?,
            None => start,
        };
        if end < start {
            anyhow::bail!("Region end before start: {}", s);
        }
        Ok(Region::new(&caps[1], start, end))
    }
}

/// Reads regions from the first column of a file; `#` lines are comments.
pub fn read_regions(infile: &str) -> anyhow::Result<Vec<Region>> {
    let reader = open_reader(infile)?;
    let mut regions = vec![];
    for line in reader.lines() {
        let line = line?;
        let field = match line.split_whitespace().next() {
            Some(f) if !f.starts_with('#') => f,
            _ => continue,
        };
        regions.push(Region::from_str(field)?);
    }
    Ok(regions)
}

/// Chromosome names and lengths, in a fixed order.
#[derive(Debug, Clone, Default)]
pub struct Genome {
    sizes: IndexMap<String, i64>,
}

impl Genome {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a `<chr> <length>` sizes file.
    pub fn from_sizes(infile: &str) -> Self {
        let mut genome = Genome::new();
        for (chrom, len) in intspan::read_sizes(infile) {
            genome.insert(&chrom, len as i64);
        }
        genome
    }

    /// Adds a chromosome, or grows an existing one.
    pub fn insert(&mut self, chrom: &str, len: i64) {
        let entry = self.sizes.entry(chrom.to_string()).or_insert(0);
        if len > *entry {
            *entry = len;
        }
    }

    pub fn chroms(&self) -> impl Iterator<Item = &str> {
        self.sizes.keys().map(|s| s.as_str())
    }

    pub fn len_of(&self, chrom: &str) -> Option<i64> {
        self.sizes.get(chrom).copied()
    }

    pub fn total_len(&self) -> i64 {
        self.sizes.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

/// Smallest count whose Poisson upper tail falls below `10^log10_thres`.
pub fn poisson_min_count(lambda: f64, log10_thres: f64) -> u64 {
    if lambda <= 0.0 {
        return 1;
    }
    let poisson = match Poisson::new(lambda) {
        Ok(p) => p,
        Err(_) => return 1,
    };
    // P(X >= k) = sf(k - 1)
    let mut k = lambda.floor() as u64 + 1;
    while poisson.sf(k - 1).log10() >= log10_thres {
        k += 1;
    }
    k
}

/// Poisson upper tail `P(X >= k)` on a log10 scale.
pub fn poisson_log10_tail(k: u64, lambda: f64) -> f64 {
    if k == 0 {
        return 0.0;
    }
    match Poisson::new(lambda) {
        Ok(p) => p.sf(k - 1).log10(),
        Err(_) => f64::NEG_INFINITY,
    }
}

/// Finds candidate intervals that plausibly hold binding activity.
pub struct PotentialRegionFilter<'a> {
    config: &'a Config,
    experiment: &'a Experiment,
    window: i64,
}

impl<'a> PotentialRegionFilter<'a> {
    /// `window` is the binding model's influence width.
    pub fn new(config: &'a Config, experiment: &'a Experiment, window: i64) -> Self {
        Self {
            config,
            experiment,
            window: window.max(POTREG_BIN_STEP),
        }
    }

    pub fn execute(&self) -> anyhow::Result<Vec<Region>> {
        let regions = match &self.config.potential_regions {
            Some(path) => {
                let mut regions = read_regions(path)?;
                regions.sort();
                merge_regions(regions)
            }
            None => self.scan(),
        };

        Ok(regions
            .into_iter()
            .filter(|r| !self.config.exclude.iter().any(|ex| ex.overlaps(r)))
            .collect())
    }

    fn scan(&self) -> Vec<Region> {
        let exp = self.experiment;
        let mappable = exp.mappable_len(self.config.mappability);

        // Per-condition background mean in one window, and the count a window
        // needs before the control has to be consulted at all
        let backgrounds: Vec<f64> = exp
            .conditions
            .iter()
            .enumerate()
            .map(|(c, _)| exp.condition_signal_total(c) as f64 * self.window as f64 / mappable)
            .collect();
        let floors: Vec<u64> = backgrounds
            .iter()
            .map(|&bg| poisson_min_count(bg, self.config.pr_log_conf))
            .collect();

        let chroms: Vec<(String, i64)> = exp
            .genome
            .chroms()
            .map(|c| (c.to_string(), exp.genome.len_of(c).unwrap_or(0)))
            .collect();

        let mut regions: Vec<Region> = chroms
            .par_iter()
            .flat_map_iter(|(chrom, len)| {
                let mut windows = vec![];
                let mut start = 0;
                while start < *len {
                    let end = (start + self.window).min(*len) - 1;
                    if self.window_passes(chrom, start, end, &backgrounds, &floors) {
                        windows.push(Region::new(chrom, start, end));
                    }
                    start += POTREG_BIN_STEP;
                }
                merge_regions(windows)
            })
            .collect();

        regions.sort_by(|a, b| {
            let ia = exp.genome.chroms().position(|c| c == a.chrom);
            let ib = exp.genome.chroms().position(|c| c == b.chrom);
            ia.cmp(&ib).then(a.start.cmp(&b.start))
        });
        regions
    }

    fn window_passes(
        &self,
        chrom: &str,
        start: i64,
        end: i64,
        backgrounds: &[f64],
        floors: &[u64],
    ) -> bool {
        let exp = self.experiment;
        for (c, cond) in exp.conditions.iter().enumerate() {
            let mut signal = 0u64;
            let mut control = 0.0;
            for &r in &cond.replicates {
                let rep = &exp.replicates[r];
                signal += rep.signal.count_in(chrom, start, end) as u64;
                if let Some(ctrl) = &rep.control {
                    control += ctrl.count_in(chrom, start, end) as f64 * rep.control_scaling;
                }
            }
            if signal < floors[c] {
                continue;
            }
            let lambda = backgrounds[c].max(control);
            if poisson_log10_tail(signal, lambda) < self.config.pr_log_conf {
                return true;
            }
        }
        false
    }
}

/// Merges sorted regions that overlap or touch.
pub fn merge_regions(regions: Vec<Region>) -> Vec<Region> {
    let mut merged: Vec<Region> = Vec::with_capacity(regions.len());
    for region in regions {
        match merged.last_mut() {
            Some(last) if last.chrom == region.chrom && region.start <= last.end + 1 => {
                if region.end > last.end {
                    last.end = region.end;
                }
            }
            _ => merged.push(region),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_parse() {
        let r = Region::from_str("chr1:100-200").unwrap();
        assert_eq!(r, Region::new("chr1", 100, 200));
        assert_eq!(r.width(), 101);
        assert_eq!(r.to_string(), "chr1:100-200");

        let p = Point::from_str("chrX:42").unwrap();
        assert_eq!(p, Point::new("chrX", 42));
        assert!(Point::from_str("chrX:42-50").is_err());
        assert!(Region::from_str("chr1:200-100").is_err());
    }

    #[test]
    fn test_merge_regions() {
        let regions = vec![
            Region::new("chr1", 0, 99),
            Region::new("chr1", 100, 199),
            Region::new("chr1", 150, 300),
            Region::new("chr1", 500, 600),
            Region::new("chr2", 0, 10),
        ];
        let merged = merge_regions(regions);
        assert_eq!(
            merged,
            vec![
                Region::new("chr1", 0, 300),
                Region::new("chr1", 500, 600),
                Region::new("chr2", 0, 10),
            ]
        );
    }

    #[test]
    fn test_poisson_min_count() {
        let k = poisson_min_count(2.0, -6.0);
        assert!(poisson_log10_tail(k, 2.0) < -6.0);
        assert!(poisson_log10_tail(k - 1, 2.0) >= -6.0);
    }

    #[test]
    fn test_genome_keeps_order() {
        let mut g = Genome::new();
        g.insert("chr2", 100);
        g.insert("chr1", 50);
        g.insert("chr2", 80);
        assert_eq!(g.chroms().collect::<Vec<_>>(), vec!["chr2", "chr1"]);
        assert_eq!(g.len_of("chr2"), Some(100));
        assert_eq!(g.total_len(), 150);
    }
}
