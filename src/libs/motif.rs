use crate::libs::io::open_reader;
use crate::libs::region::Region;
use indexmap::IndexMap;
use std::io::BufRead;

const BASES: [u8; 4] = [b'A', b'C', b'G', b'T'];

fn base_index(b: u8) -> Option<usize> {
    match b {
        b'A' | b'a' => Some(0),
        b'C' | b'c' => Some(1),
        b'G' | b'g' => Some(2),
        b'T' | b't' => Some(3),
        _ => None,
    }
}

/// Position weight matrix of log2 odds against a uniform background.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightMatrix {
    pub name: String,
    rows: Vec<[f64; 4]>,
}

impl WeightMatrix {
    /// Builds log-odds rows from per-position `A C G T` frequencies or counts.
    pub fn from_frequencies(name: &str, freqs: &[[f64; 4]]) -> anyhow::Result<Self> {
        if freqs.is_empty() {
            anyhow::bail!("Motif {} has no positions", name);
        }
        let pseudo = 0.01;
        let mut rows = Vec::with_capacity(freqs.len());
        for f in freqs {
            let total: f64 = f.iter().sum();
            if total <= 0.0 || f.iter().any(|v| *v < 0.0) {
                anyhow::bail!("Motif {} has an empty or negative column", name);
            }
            let mut row = [0.0; 4];
            for (i, v) in f.iter().enumerate() {
                let p = (v / total + pseudo) / (1.0 + 4.0 * pseudo);
                row[i] = (p / 0.25).log2();
            }
            rows.push(row);
        }
        Ok(Self {
            name: name.to_string(),
            rows,
        })
    }

    /// Reads a frequency matrix.
    ///
    /// Each data line has four numbers for `A C G T`, optionally preceded by a
    /// position index and followed by a consensus letter. A `>name` or
    /// `DE name` line names the motif.
    pub fn from_file(infile: &str) -> anyhow::Result<Self> {
        let reader = open_reader(infile)?;
        let mut name = intspan::basename(infile).unwrap_or_else(|_| "motif".to_string());
        let mut freqs = vec![];
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("XX") {
                continue;
            }
            if let Some(rest) = line.strip_prefix('>').or_else(|| line.strip_prefix("DE ")) {
                if let Some(n) = rest.split_whitespace().next() {
                    name = n.to_string();
                }
                continue;
            }
            let nums: Vec<f64> = line
                .split_whitespace()
                .filter_map(|t| t.parse::<f64>().ok())
                .collect();
            let row = match nums.len() {
                4 => [nums[0], nums[1], nums[2], nums[3]],
                5 => [nums[1], nums[2], nums[3], nums[4]],
                _ => continue,
            };
            freqs.push(row);
        }
        Self::from_frequencies(&name, &freqs)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn max_score(&self) -> f64 {
        self.rows
            .iter()
            .map(|r| r.iter().cloned().fold(f64::NEG_INFINITY, f64::max))
            .sum()
    }

    pub fn consensus(&self) -> String {
        self.rows
            .iter()
            .map(|r| {
                let (best, _) = r
                    .iter()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |acc, (i, v)| if *v > acc.1 { (i, *v) } else { acc });
                BASES[best] as char
            })
            .collect()
    }

    /// Best of forward and reverse-complement scores for the window at `start`.
    ///
    /// Ambiguous bases score as background.
    pub fn score_at(&self, seq: &[u8], start: usize) -> Option<f64> {
        let window = seq.get(start..start + self.len())?;
        let mut fwd = 0.0;
        let mut rev = 0.0;
        let n = self.len();
        for (j, &b) in window.iter().enumerate() {
            if let Some(i) = base_index(b) {
                fwd += self.rows[j][i];
                // complement of base i is 3 - i, read from the other end
                rev += self.rows[n - 1 - j][3 - i];
            }
        }
        Some(fwd.max(rev))
    }

    /// Frequency-style listing: one row per position with consensus letter.
    pub fn to_listing(&self) -> String {
        let mut out = String::new();
        let consensus = self.consensus();
        for (i, (row, c)) in self.rows.iter().zip(consensus.chars()).enumerate() {
            let odds: Vec<f64> = row.iter().map(|s| 0.25 * 2f64.powf(*s)).collect();
            let total: f64 = odds.iter().sum();
            out += &format!(
                "{}\t{:.3}\t{:.3}\t{:.3}\t{:.3}\t{}\n",
                i,
                odds[0] / total,
                odds[1] / total,
                odds[2] / total,
                odds[3] / total,
                c
            );
        }
        out
    }
}

/// Scores every base of a region with a motif.
pub trait MotifScanner: Sync {
    /// One score per base of `region`, for the motif window centred there.
    /// Positions where the window does not fit score negative infinity.
    fn scan(&self, region: &Region, motif: &WeightMatrix) -> anyhow::Result<Vec<f64>>;
}

/// Scanner over genome sequences held in memory.
pub struct FastaMotifScanner {
    seqs: IndexMap<String, Vec<u8>>,
}

impl FastaMotifScanner {
    pub fn from_fasta(infile: &str) -> anyhow::Result<Self> {
        let reader = open_reader(infile)?;
        let mut fa_in = noodles_fasta::io::Reader::new(reader);

        let mut seqs = IndexMap::new();
        for result in fa_in.records() {
            let record = result?;
            let name = String::from_utf8(record.name().into())?;
            let seq: &[u8] = record.sequence().as_ref();
            seqs.insert(name, seq.to_vec());
        }
        Ok(Self { seqs })
    }

    pub fn from_seqs(seqs: IndexMap<String, Vec<u8>>) -> Self {
        Self { seqs }
    }
}

impl MotifScanner for FastaMotifScanner {
    fn scan(&self, region: &Region, motif: &WeightMatrix) -> anyhow::Result<Vec<f64>> {
        let seq = self
            .seqs
            .get(&region.chrom)
            .ok_or_else(|| anyhow::anyhow!("No sequence for {}", region.chrom))?;
        let half = (motif.len() / 2) as i64;
        let scores = (region.start..=region.end)
            .map(|x| {
                let start = x - half;
                if start < 0 {
                    return f64::NEG_INFINITY;
                }
                motif
                    .score_at(seq, start as usize)
                    .unwrap_or(f64::NEG_INFINITY)
            })
            .collect();
        Ok(scores)
    }
}
