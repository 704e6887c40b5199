use crate::libs::io::open_reader;
use std::io::BufRead;

/// Knots of the default ChIP-seq read distribution.
///
/// Offsets are relative to the binding event, measured for `+` strand 5' ends;
/// `-` strand reads use the mirrored offset.
const DEFAULT_CHIPSEQ: [(i64, f64); 14] = [
    (-300, 0.0),
    (-250, 0.05),
    (-200, 0.2),
    (-150, 0.5),
    (-100, 0.85),
    (-75, 1.0),
    (-50, 0.9),
    (-25, 0.6),
    (0, 0.35),
    (25, 0.15),
    (50, 0.05),
    (100, 0.02),
    (150, 0.01),
    (300, 0.0),
];

/// Empirical read density around a binding event, over offsets `min..=max`.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingModel {
    min: i64,
    probs: Vec<f64>,
}

impl BindingModel {
    /// Linearly interpolates between `(offset, density)` knots and normalises.
    pub fn from_points(points: &[(i64, f64)]) -> anyhow::Result<Self> {
        let mut points = points.to_vec();
        points.sort_by_key(|p| p.0);
        points.dedup_by_key(|p| p.0);
        if points.len() < 2 {
            anyhow::bail!("A binding model needs at least two points");
        }
        if points.iter().any(|p| p.1 < 0.0 || !p.1.is_finite()) {
            anyhow::bail!("Binding model densities must be finite and non-negative");
        }

        let min = points[0].0;
        let max = points[points.len() - 1].0;
        let mut probs = Vec::with_capacity((max - min + 1) as usize);
        for pair in points.windows(2) {
            let (x0, y0) = pair[0];
            let (x1, y1) = pair[1];
            for x in x0..x1 {
                let t = (x - x0) as f64 / (x1 - x0) as f64;
                probs.push(y0 + t * (y1 - y0));
            }
        }
        probs.push(points[points.len() - 1].1);

        Self::from_profile(min, probs)
    }

    /// Normalises a raw profile starting at offset `min`.
    pub fn from_profile(min: i64, mut probs: Vec<f64>) -> anyhow::Result<Self> {
        let total: f64 = probs.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            anyhow::bail!("Binding model profile has no mass");
        }
        for p in probs.iter_mut() {
            *p /= total;
        }
        Ok(Self { min, probs })
    }

    pub fn default_chipseq() -> Self {
        Self::from_points(&DEFAULT_CHIPSEQ).expect("default knots are valid")
    }

    /// Reads `offset value` lines.
    pub fn from_file(infile: &str) -> anyhow::Result<Self> {
        let reader = open_reader(infile)?;
        let mut points = vec![];
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 2 {
                anyhow::bail!("Expected `offset value` in {}: {}", infile, line);
            }
            points.push((fields[0].parse::<i64>()?, fields[1].parse::<f64>()?));
        }
        Self::from_points(&points)
    }

    pub fn min(&self) -> i64 {
        self.min
    }

    pub fn max(&self) -> i64 {
        self.min + self.probs.len() as i64 - 1
    }

    pub fn width(&self) -> i64 {
        self.probs.len() as i64
    }

    pub fn probs(&self) -> &[f64] {
        &self.probs
    }

    /// Density at `offset`; zero outside the model's range.
    pub fn prob(&self, offset: i64) -> f64 {
        if offset < self.min {
            return 0.0;
        }
        self.probs
            .get((offset - self.min) as usize)
            .copied()
            .unwrap_or(0.0)
    }

    /// Convolves with a truncated Gaussian kernel and renormalises.
    pub fn smooth_gaussian(&self, sigma: f64) -> Self {
        if sigma <= 0.0 {
            return self.clone();
        }
        let radius = (3.0 * sigma).ceil() as i64;
        let kernel: Vec<f64> = (-radius..=radius)
            .map(|d| (-(d * d) as f64 / (2.0 * sigma * sigma)).exp())
            .collect();

        let n = self.probs.len() as i64;
        let mut smoothed = vec![0.0; self.probs.len()];
        for (i, out) in smoothed.iter_mut().enumerate() {
            let mut acc = 0.0;
            let mut norm = 0.0;
            for (k, w) in kernel.iter().enumerate() {
                let j = i as i64 + k as i64 - radius;
                if j >= 0 && j < n {
                    acc += w * self.probs[j as usize];
                    norm += w;
                }
            }
            *out = acc / norm;
        }

        Self::from_profile(self.min, smoothed).unwrap_or_else(|_| self.clone())
    }

    /// `log10` of the Kullback-Leibler divergence `KL(self || other)`.
    ///
    /// Identical models give negative infinity.
    pub fn log_kl(&self, other: &BindingModel) -> f64 {
        let lo = self.min.min(other.min);
        let hi = self.max().max(other.max());
        let mut kl = 0.0;
        for x in lo..=hi {
            let p = self.prob(x);
            if p <= 0.0 {
                continue;
            }
            let q = other.prob(x).max(1e-12);
            kl += p * (p / q).ln();
        }
        kl.max(0.0).log10()
    }

    /// `(offset, density)` pairs for plotting.
    pub fn series(&self) -> Vec<(f64, f64)> {
        self.probs
            .iter()
            .enumerate()
            .map(|(i, p)| ((self.min + i as i64) as f64, *p))
            .collect()
    }

    /// Tab-separated `offset\tdensity` lines.
    pub fn to_tsv(&self) -> String {
        let mut out = String::new();
        for (i, p) in self.probs.iter().enumerate() {
            out += &format!("{}\t{:.6e}\n", self.min + i as i64, p);
        }
        out
    }
}
