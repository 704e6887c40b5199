use crate::libs::error::DesignError;
use crate::libs::region::Genome;
use indexmap::IndexMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strand {
    Plus,
    Minus,
}

/// Read 5' positions per chromosome, split by strand and kept sorted.
#[derive(Debug, Clone, Default)]
pub struct ReadHits {
    plus: IndexMap<String, Vec<i64>>,
    minus: IndexMap<String, Vec<i64>>,
    total: usize,
}

impl ReadHits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds hits from `(chrom, 5' position, strand)` triples.
    pub fn from_hits<'s, I>(hits: I) -> Self
    where
        I: IntoIterator<Item = (&'s str, i64, Strand)>,
    {
        let mut rh = ReadHits::new();
        for (chrom, pos, strand) in hits {
            rh.push(chrom, pos, strand);
        }
        rh.finish();
        rh
    }

    /// Loads a BED file (plain or gzipped); a missing strand column means `+`.
    pub fn from_bed(infile: &str) -> Result<Self, DesignError> {
        if infile != "stdin" && !Path::new(infile).is_file() {
            return Err(DesignError::Io {
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
                path: PathBuf::from(infile),
            });
        }

        let mut rh = ReadHits::new();
        let reader = intspan::reader(infile);
        for (i, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| DesignError::Io {
                source: e,
                path: PathBuf::from(infile),
            })?;
            if line.is_empty()
                || line.starts_with('#')
                || line.starts_with("track")
                || line.starts_with("browser")
            {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            let parse_err = |message: &str| DesignError::Parse {
                path: PathBuf::from(infile),
                line: i + 1,
                message: message.to_string(),
            };
            if fields.len() < 3 {
                return Err(parse_err("expected at least 3 columns"));
            }
            let start: i64 = fields[1].parse().map_err(|_| parse_err("bad start"))?;
            let end: i64 = fields[2].parse().map_err(|_| parse_err("bad end"))?;
            let strand = match fields.get(5) {
                Some(&"-") => Strand::Minus,
                _ => Strand::Plus,
            };
            let five_prime = match strand {
                Strand::Plus => start,
                Strand::Minus => end - 1,
            };
            rh.push(fields[0], five_prime, strand);
        }
        rh.finish();
        Ok(rh)
    }

    fn push(&mut self, chrom: &str, pos: i64, strand: Strand) {
        let map = match strand {
            Strand::Plus => &mut self.plus,
            Strand::Minus => &mut self.minus,
        };
        map.entry(chrom.to_string()).or_default().push(pos);
        self.total += 1;
    }

    fn finish(&mut self) {
        for v in self.plus.values_mut().chain(self.minus.values_mut()) {
            v.sort_unstable();
        }
    }

    /// Appends all hits of `other`.
    pub fn merge(&mut self, other: ReadHits) {
        for (chrom, v) in other.plus {
            self.plus.entry(chrom).or_default().extend(v);
        }
        for (chrom, v) in other.minus {
            self.minus.entry(chrom).or_default().extend(v);
        }
        self.total += other.total;
        self.finish();
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Hits on one strand with 5' end in `start..=end`.
    pub fn strand_in(&self, chrom: &str, start: i64, end: i64, strand: Strand) -> &[i64] {
        let map = match strand {
            Strand::Plus => &self.plus,
            Strand::Minus => &self.minus,
        };
        match map.get(chrom) {
            Some(v) => {
                let lo = v.partition_point(|&p| p < start);
                let hi = v.partition_point(|&p| p <= end);
                &v[lo..hi]
            }
            None => &[],
        }
    }

    pub fn count_in(&self, chrom: &str, start: i64, end: i64) -> usize {
        self.strand_in(chrom, start, end, Strand::Plus).len()
            + self.strand_in(chrom, start, end, Strand::Minus).len()
    }

    /// Largest 5' position seen per chromosome.
    pub fn extents(&self) -> IndexMap<String, i64> {
        let mut extents: IndexMap<String, i64> = IndexMap::new();
        for (chrom, v) in self.plus.iter().chain(self.minus.iter()) {
            if let Some(&last) = v.last() {
                let e = extents.entry(chrom.clone()).or_insert(0);
                *e = (*e).max(last);
            }
        }
        extents
    }
}

/// One experimental unit: signal hits and an optional control.
#[derive(Debug, Clone)]
pub struct Replicate {
    pub name: String,
    pub condition: usize,
    pub signal: ReadHits,
    pub control: Option<ReadHits>,
    /// Multiplier that brings control counts to the signal's depth
    pub control_scaling: f64,
}

impl Replicate {
    pub fn has_control(&self) -> bool {
        self.control.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub name: String,
    pub replicates: Vec<usize>,
}

/// The full design: genome, conditions, and replicates.
#[derive(Debug, Clone)]
pub struct Experiment {
    pub genome: Genome,
    pub conditions: Vec<Condition>,
    pub replicates: Vec<Replicate>,
}

/// One replicate before conditions are indexed.
pub struct ReplicateSpec {
    pub condition: String,
    pub name: String,
    pub signal: ReadHits,
    pub control: Option<ReadHits>,
}

impl Experiment {
    /// Groups replicates into conditions in first-seen order.
    ///
    /// With no `genome`, chromosome sizes are inferred from the hits.
    pub fn new(genome: Option<Genome>, specs: Vec<ReplicateSpec>) -> Result<Self, DesignError> {
        if specs.is_empty() {
            return Err(DesignError::Empty);
        }

        let genome = genome.unwrap_or_else(|| {
            let mut g = Genome::new();
            for spec in &specs {
                let ctrl = spec.control.iter();
                for hits in std::iter::once(&spec.signal).chain(ctrl) {
                    for (chrom, max) in hits.extents() {
                        g.insert(&chrom, max + 1);
                    }
                }
            }
            g
        });

        let mut conditions: Vec<Condition> = vec![];
        let mut replicates = vec![];
        for spec in specs {
            let c = match conditions.iter().position(|c| c.name == spec.condition) {
                Some(c) => c,
                None => {
                    conditions.push(Condition {
                        name: spec.condition.clone(),
                        replicates: vec![],
                    });
                    conditions.len() - 1
                }
            };
            let control_scaling = match &spec.control {
                Some(ctrl) if ctrl.total() > 0 => spec.signal.total() as f64 / ctrl.total() as f64,
                _ => 1.0,
            };
            conditions[c].replicates.push(replicates.len());
            replicates.push(Replicate {
                name: spec.name,
                condition: c,
                signal: spec.signal,
                control: spec.control,
                control_scaling,
            });
        }

        Ok(Self {
            genome,
            conditions,
            replicates,
        })
    }

    /// Loads a tab-separated design file:
    ///
    /// ```text
    /// path    signal|control    condition    replicate
    /// ```
    ///
    /// A control whose replicate name matches no signal replicate is shared by
    /// every replicate of its condition.
    pub fn from_design(infile: &str, genome: Option<Genome>) -> Result<Self, DesignError> {
        let reader = intspan::reader(infile);

        // (condition, replicate) => signal hits, in order of appearance
        let mut signals: IndexMap<(String, String), ReadHits> = IndexMap::new();
        let mut controls: Vec<(String, String, ReadHits)> = vec![];

        for (i, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| DesignError::Io {
                source: e,
                path: PathBuf::from(infile),
            })?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                return Err(DesignError::Parse {
                    path: PathBuf::from(infile),
                    line: i + 1,
                    message: "expected `path type condition [replicate]`".to_string(),
                });
            }
            let cond = fields[2].to_string();
            let rep = fields.get(3).unwrap_or(&"rep1").to_string();
            let hits = ReadHits::from_bed(fields[0])?;
            match fields[1].to_lowercase().as_str() {
                "signal" => signals.entry((cond, rep)).or_default().merge(hits),
                "control" => controls.push((cond, rep, hits)),
                other => {
                    return Err(DesignError::Parse {
                        path: PathBuf::from(infile),
                        line: i + 1,
                        message: format!("unknown experiment type `{}`", other),
                    })
                }
            }
        }

        for (cond, _, _) in &controls {
            if !signals.keys().any(|(c, _)| c == cond) {
                return Err(DesignError::NoSignal(cond.clone()));
            }
        }

        let signal_keys: Vec<(String, String)> = signals.keys().cloned().collect();
        let mut specs = vec![];
        for ((cond, rep), signal) in signals {
            let mut control: Option<ReadHits> = None;
            for (c_cond, c_rep, hits) in &controls {
                if c_cond != &cond {
                    continue;
                }
                let own = c_rep == &rep;
                let shared = !signal_keys.iter().any(|(c, r)| c == c_cond && r == c_rep);
                if own || shared {
                    control.get_or_insert_with(ReadHits::new).merge(hits.clone());
                }
            }
            specs.push(ReplicateSpec {
                condition: cond,
                name: rep,
                signal,
                control,
            });
        }

        Experiment::new(genome, specs)
    }

    /// `condition:replicate`
    pub fn replicate_label(&self, r: usize) -> String {
        let rep = &self.replicates[r];
        format!("{}:{}", self.conditions[rep.condition].name, rep.name)
    }

    pub fn condition_signal_total(&self, c: usize) -> usize {
        self.conditions[c]
            .replicates
            .iter()
            .map(|&r| self.replicates[r].signal.total())
            .sum()
    }

    pub fn mappable_len(&self, mappability: f64) -> f64 {
        (self.genome.total_len() as f64 * mappability).max(1.0)
    }

    pub fn num_conditions(&self) -> usize {
        self.conditions.len()
    }
}
