use crate::libs::config::*;
use crate::libs::design::{Experiment, Strand};
use crate::libs::engine::{
    EmEngine, EngineSnapshot, FinalAssignment, ModelState, MotifPrior, NoiseModel,
};
use crate::libs::error::EngineError;
use crate::libs::event::BindingEvent;
use crate::libs::ledger::BindingModelLedger;
use crate::libs::model::BindingModel;
use crate::libs::motif::{MotifScanner, WeightMatrix};
use crate::libs::region::{Point, Region};
use itertools::Itertools;
use log::debug;
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Identical reads collapsed into one weighted entry.
#[derive(Debug, Clone, Copy)]
struct ReadBin {
    pos: i64,
    strand: Strand,
    /// Replicate slot within the condition
    slot: usize,
    weight: f64,
}

impl ReadBin {
    fn offset(&self, mu: i64) -> i64 {
        match self.strand {
            Strand::Plus => self.pos - mu,
            Strand::Minus => mu - self.pos,
        }
    }
}

struct EmParams<'m> {
    models: Vec<&'m BindingModel>,
    alpha: f64,
    noise_pi: f64,
    noise_density: f64,
    move_positions: bool,
    max_iter: usize,
    bounds: (i64, i64),
}

/// Surviving components of one region in one condition.
#[derive(Debug, Default)]
struct Fit {
    positions: Vec<i64>,
    /// Reads per component, split by replicate slot
    rep_reads: Vec<Vec<f64>>,
    noise_reads: f64,
    resp: Vec<Vec<f64>>,
}

impl Fit {
    fn reads(&self, j: usize) -> f64 {
        self.rep_reads[j].iter().sum()
    }
}

/// One round's contribution of a region to a condition's updates.
#[derive(Debug, Default)]
struct RegionCond {
    positions: Vec<i64>,
    reads: Vec<f64>,
    noise_reads: f64,
    qualifying: usize,
    /// Offset profiles of qualifying components, per replicate slot
    hists: Vec<Vec<f64>>,
}

/// Sparse-prior mixture EM over potential regions.
///
/// Every region is fitted independently per condition, so rounds run
/// in parallel over regions.
pub struct MixtureEngine<'a> {
    config: &'a Config,
    experiment: &'a Experiment,
    regions: Vec<Region>,
    scanner: Option<&'a dyn MotifScanner>,
    motifs: Vec<Option<WeightMatrix>>,
    /// Surviving positions per region and condition after the last round
    active: Vec<Vec<Vec<i64>>>,
    round: usize,
}

impl<'a> MixtureEngine<'a> {
    pub fn new(config: &'a Config, experiment: &'a Experiment, regions: Vec<Region>) -> Self {
        let n = experiment.num_conditions();
        Self {
            config,
            experiment,
            regions,
            scanner: None,
            motifs: vec![None; n],
            active: vec![],
            round: 0,
        }
    }

    /// Enables motif offset estimation with one matrix per condition.
    pub fn with_motifs(
        mut self,
        scanner: &'a dyn MotifScanner,
        motifs: Vec<Option<WeightMatrix>>,
    ) -> Self {
        self.scanner = Some(scanner);
        self.motifs = motifs;
        self
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Genome-wide noise rates and the alphas they imply.
    pub fn initial_state(&self, models: &BindingModelLedger) -> ModelState {
        let exp = self.experiment;
        let mappable = exp.mappable_len(self.config.mappability);
        let per_base: Vec<f64> = (0..exp.num_conditions())
            .map(|c| exp.condition_signal_total(c) as f64 / mappable)
            .collect();
        let alphas = if self.config.fixed_alpha > 0.0 {
            vec![self.config.fixed_alpha; per_base.len()]
        } else {
            per_base
                .iter()
                .map(|&n| self.estimate_alpha(n, models.max_width()))
                .collect()
        };
        ModelState {
            alphas,
            motifs: vec![None; per_base.len()],
            noise: NoiseModel { per_base },
        }
    }

    fn estimate_alpha(&self, noise_per_base: f64, width: i64) -> f64 {
        self.config.alpha_scale * (noise_per_base * width as f64).sqrt().max(1.0)
    }

    /// Reach of the widest model on either side of a position.
    fn extension(models: &BindingModelLedger) -> i64 {
        (0..models.num_replicates())
            .map(|r| {
                let m = models.latest(r);
                m.min().abs().max(m.max().abs())
            })
            .max()
            .unwrap_or(0)
    }

    fn collect_reads(&self, cond: usize, region: &Region, ext: i64) -> Vec<ReadBin> {
        let exp = self.experiment;
        let mut bins = vec![];
        for (slot, &r) in exp.conditions[cond].replicates.iter().enumerate() {
            let hits = &exp.replicates[r].signal;
            for strand in [Strand::Plus, Strand::Minus] {
                let positions =
                    hits.strand_in(&region.chrom, region.start - ext, region.end + ext, strand);
                for (count, &pos) in positions.iter().dedup_with_count() {
                    bins.push(ReadBin {
                        pos,
                        strand,
                        slot,
                        weight: count as f64,
                    });
                }
            }
        }
        bins
    }

    fn grid(region: &Region) -> Vec<i64> {
        (region.start..=region.end)
            .step_by(INIT_COMPONENT_SPACING as usize)
            .collect()
    }

    /// Last round's survivors with flanking candidates on both sides.
    fn candidates(&self, ri: usize, cond: usize, region: &Region) -> Vec<i64> {
        let flank = self.config.flanking_spacing;
        let mut positions: Vec<i64> = self.active[ri][cond]
            .iter()
            .flat_map(|&p| [p - flank, p, p + flank])
            .filter(|&p| region.contains(p))
            .collect();
        positions.sort_unstable();
        positions.dedup();
        positions
    }

    #[allow(clippy::too_many_arguments)]
    fn fit_region(
        &self,
        region: &Region,
        cond: usize,
        positions: Vec<i64>,
        models: &BindingModelLedger,
        state: &ModelState,
        ext: i64,
        move_positions: bool,
        max_iter: usize,
    ) -> (Vec<ReadBin>, Fit) {
        let reads = self.collect_reads(cond, region, ext);
        let total: f64 = reads.iter().map(|r| r.weight).sum();
        let span = (region.width() + 2 * ext) as f64;
        let expected_noise = state.noise.per_base[cond] * span;
        let params = EmParams {
            models: self.experiment.conditions[cond]
                .replicates
                .iter()
                .map(|&r| models.latest(r))
                .collect(),
            alpha: state.alphas[cond],
            noise_pi: if total > 0.0 { expected_noise / total } else { 1.0 },
            noise_density: 1.0 / span,
            move_positions,
            max_iter,
            bounds: (region.start, region.end),
        };
        let fit = fit_mixture(&reads, positions, &params);
        (reads, fit)
    }

    /// Offset profiles of components strong enough to shape a model.
    fn region_profiles(
        &self,
        reads: &[ReadBin],
        fit: &Fit,
        models: &[&BindingModel],
        alpha: f64,
    ) -> (usize, Vec<Vec<f64>>) {
        let mut hists: Vec<Vec<f64>> = models
            .iter()
            .map(|m| vec![0.0; m.width() as usize])
            .collect();
        let width = models.iter().map(|m| m.width()).max().unwrap_or(0);
        let min_reads = self.config.min_component_read_factor * alpha;

        let mut qualifying = 0;
        for (j, &mu) in fit.positions.iter().enumerate() {
            if fit.reads(j) < min_reads {
                continue;
            }
            let joint = fit
                .positions
                .iter()
                .enumerate()
                .any(|(k, &other)| k != j && (other - mu).abs() < width);
            if joint && !self.config.include_joint_events {
                continue;
            }
            qualifying += 1;
            for (i, read) in reads.iter().enumerate() {
                let r = fit.resp[j][i];
                if r <= 0.0 {
                    continue;
                }
                let model = models[read.slot];
                let offset = read.offset(mu);
                if offset >= model.min() && offset <= model.max() {
                    hists[read.slot][(offset - model.min()) as usize] += r;
                }
            }
        }
        (qualifying, hists)
    }

    fn update_motifs(
        &self,
        strongest: &[Vec<(usize, i64, f64)>],
    ) -> Result<Vec<Option<MotifPrior>>, EngineError> {
        let n = self.experiment.num_conditions();
        let scanner = match self.scanner {
            Some(s) => s,
            None => return Ok(vec![None; n]),
        };

        let mut priors = Vec::with_capacity(n);
        for (c, comps) in strongest.iter().enumerate() {
            let matrix = match self.motifs.get(c).and_then(|m| m.as_ref()) {
                Some(m) => m,
                None => {
                    priors.push(None);
                    continue;
                }
            };
            let threshold = matrix.max_score() * MOTIF_MIN_SCORE_FRACTION;

            let mut offsets = vec![];
            for &(ri, pos, _) in comps.iter().take(MOTIF_FINDING_TOPSEQS) {
                let window = Region::new(
                    &self.regions[ri].chrom,
                    pos - EM_MU_UPDATE_WIN,
                    pos + EM_MU_UPDATE_WIN,
                );
                let scores = scanner
                    .scan(&window, matrix)
                    .map_err(|e| EngineError::update("motif", e.to_string()))?;
                let best = scores
                    .iter()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |acc, (i, v)| if *v > acc.1 { (i, *v) } else { acc });
                if best.1 >= threshold {
                    offsets.push(window.start + best.0 as i64 - pos);
                }
            }

            if offsets.is_empty() {
                priors.push(None);
            } else {
                offsets.sort_unstable();
                priors.push(Some(MotifPrior {
                    matrix: matrix.clone(),
                    offset: offsets[offsets.len() / 2],
                }));
            }
        }
        Ok(priors)
    }
}

impl EmEngine for MixtureEngine<'_> {
    fn train_round(
        &mut self,
        seed_from_prior: bool,
        models: &BindingModelLedger,
        state: &ModelState,
    ) -> Result<EngineSnapshot, EngineError> {
        let exp = self.experiment;
        let n_cond = exp.num_conditions();
        if state.alphas.len() != n_cond || state.noise.per_base.len() != n_cond {
            return Err(EngineError::Training {
                round: self.round,
                message: "model state does not match the conditions".to_string(),
            });
        }

        let seed = seed_from_prior || self.active.len() != self.regions.len();
        let ext = Self::extension(models);

        let fits: Vec<Vec<RegionCond>> = self
            .regions
            .par_iter()
            .enumerate()
            .map(|(ri, region)| {
                (0..n_cond)
                    .map(|c| {
                        let positions = if seed {
                            Self::grid(region)
                        } else {
                            self.candidates(ri, c, region)
                        };
                        let (reads, fit) =
                            self.fit_region(region, c, positions, models, state, ext, true, MAX_EM_ITER);
                        let slot_models: Vec<&BindingModel> = exp.conditions[c]
                            .replicates
                            .iter()
                            .map(|&r| models.latest(r))
                            .collect();
                        let (qualifying, hists) =
                            self.region_profiles(&reads, &fit, &slot_models, state.alphas[c]);
                        RegionCond {
                            reads: (0..fit.positions.len()).map(|j| fit.reads(j)).collect(),
                            positions: fit.positions,
                            noise_reads: fit.noise_reads,
                            qualifying,
                            hists,
                        }
                    })
                    .collect()
            })
            .collect();

        // Aggregate per condition
        let mut qualifying = vec![0usize; n_cond];
        let mut noise_reads = vec![0.0; n_cond];
        let mut hists: Vec<Vec<Vec<f64>>> = exp
            .conditions
            .iter()
            .map(|cond| {
                cond.replicates
                    .iter()
                    .map(|&r| vec![0.0; models.latest(r).width() as usize])
                    .collect()
            })
            .collect();
        let mut strongest: Vec<Vec<(usize, i64, f64)>> = vec![vec![]; n_cond];
        let mut active_components = 0;
        for (ri, per_cond) in fits.iter().enumerate() {
            for (c, rc) in per_cond.iter().enumerate() {
                qualifying[c] += rc.qualifying;
                noise_reads[c] += rc.noise_reads;
                active_components += rc.positions.len();
                for (slot, h) in rc.hists.iter().enumerate() {
                    for (acc, v) in hists[c][slot].iter_mut().zip(h) {
                        *acc += v;
                    }
                }
                for (&pos, &reads) in rc.positions.iter().zip(&rc.reads) {
                    strongest[c].push((ri, pos, reads));
                }
            }
        }
        for comps in strongest.iter_mut() {
            comps.sort_by(|a, b| b.2.total_cmp(&a.2));
        }
        self.active = fits
            .into_iter()
            .map(|per_cond| per_cond.into_iter().map(|rc| rc.positions).collect())
            .collect();

        // Binding models
        let mut binding_models = Vec::with_capacity(exp.replicates.len());
        let mut rep_signal = vec![f64::NAN; exp.replicates.len()];
        for (r, rep) in exp.replicates.iter().enumerate() {
            let c = rep.condition;
            let current = models.latest(r);
            if !self.config.update_models || qualifying[c] < self.config.min_components_for_update {
                binding_models.push(Ok(current.clone()));
                continue;
            }
            let slot = exp.conditions[c]
                .replicates
                .iter()
                .position(|&x| x == r)
                .unwrap_or(0);
            match BindingModel::from_profile(current.min(), hists[c][slot].clone()) {
                Ok(m) => {
                    let m = if self.config.smooth_models {
                        m.smooth_gaussian(self.config.gauss_smooth)
                    } else {
                        m
                    };
                    rep_signal[r] = m.log_kl(current);
                    binding_models.push(Ok(m));
                }
                Err(e) => binding_models.push(Err(EngineError::update(
                    "binding model",
                    format!("{}: {}", exp.replicate_label(r), e),
                ))),
            }
        }
        let convergence: Vec<f64> = exp
            .conditions
            .iter()
            .map(|cond| {
                cond.replicates
                    .iter()
                    .fold(f64::NAN, |acc, &r| acc.max(rep_signal[r]))
            })
            .collect();

        // Noise and alpha
        let span: i64 = self.regions.iter().map(|r| r.width()).sum();
        let noise = if span > 0 {
            Ok(NoiseModel {
                per_base: noise_reads.iter().map(|n| n / span as f64).collect(),
            })
        } else {
            Err(EngineError::update("noise", "no potential regions to estimate from"))
        };
        let alphas = if !self.config.update_alpha {
            Ok(state.alphas.clone())
        } else {
            let per_base = match &noise {
                Ok(n) => &n.per_base,
                Err(_) => &state.noise.per_base,
            };
            let alphas: Vec<f64> = per_base
                .iter()
                .map(|&n| self.estimate_alpha(n, models.max_width()))
                .collect();
            if alphas.iter().all(|a| a.is_finite()) {
                Ok(alphas)
            } else {
                Err(EngineError::update("alpha", "non-finite noise estimate"))
            }
        };

        let motifs = self.update_motifs(&strongest);

        debug!(
            "EM round {}: {} components over {} regions, qualifying {:?}",
            self.round,
            active_components,
            self.regions.len(),
            qualifying
        );
        self.round += 1;

        Ok(EngineSnapshot {
            binding_models,
            convergence,
            alphas,
            motifs,
            noise,
            active_components,
        })
    }

    fn run_final_assignment(
        &mut self,
        models: &BindingModelLedger,
        state: &ModelState,
    ) -> Result<FinalAssignment, EngineError> {
        let exp = self.experiment;
        if self.active.len() != self.regions.len() {
            return Err(EngineError::Assignment(
                "no training round has been run".to_string(),
            ));
        }
        let n_cond = exp.num_conditions();
        let n_rep = exp.replicates.len();
        let ext = Self::extension(models);

        let events: Vec<BindingEvent> = self
            .regions
            .par_iter()
            .enumerate()
            .flat_map_iter(|(ri, region)| {
                let mut union: Vec<i64> = self.active[ri].iter().flatten().copied().collect();
                union.sort_unstable();
                union.dedup();

                // position => (per-replicate reads, per-condition found)
                let mut calls: BTreeMap<i64, (Vec<f64>, Vec<bool>)> = BTreeMap::new();
                if !union.is_empty() {
                    for c in 0..n_cond {
                        let (_, fit) = self.fit_region(
                            region,
                            c,
                            union.clone(),
                            models,
                            state,
                            ext,
                            false,
                            ML_ITER,
                        );
                        for (j, &pos) in fit.positions.iter().enumerate() {
                            let entry = calls
                                .entry(pos)
                                .or_insert_with(|| (vec![0.0; n_rep], vec![false; n_cond]));
                            for (slot, &r) in exp.conditions[c].replicates.iter().enumerate() {
                                entry.0[r] = fit.rep_reads[j][slot];
                            }
                            entry.1[c] = fit.reads(j) > 0.0;
                        }
                    }
                }

                calls
                    .into_iter()
                    .filter(|(_, (_, found))| found.iter().any(|f| *f))
                    .map(|(pos, (rep_signal, found))| {
                        let rep_control = exp
                            .replicates
                            .iter()
                            .enumerate()
                            .map(|(r, rep)| match &rep.control {
                                Some(ctrl) => {
                                    let half = models.latest(r).width() / 2;
                                    ctrl.count_in(&region.chrom, pos - half, pos + half) as f64
                                }
                                None => 0.0,
                            })
                            .collect();
                        BindingEvent::new(
                            Point::new(&region.chrom, pos),
                            Some(region.clone()),
                            rep_signal,
                            rep_control,
                            found,
                        )
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        let signal_fractions = exp
            .replicates
            .iter()
            .enumerate()
            .map(|(r, rep)| {
                let total = rep.signal.total() as f64;
                if total > 0.0 {
                    events.iter().map(|e| e.rep_signal[r]).sum::<f64>() / total
                } else {
                    0.0
                }
            })
            .collect();

        Ok(FinalAssignment {
            events,
            signal_fractions,
        })
    }
}

fn e_step(
    reads: &[ReadBin],
    positions: &[i64],
    pis: &[f64],
    noise_pi: f64,
    p: &EmParams,
    noise_resp: &mut [f64],
) -> Vec<Vec<f64>> {
    let mut resp = vec![vec![0.0; reads.len()]; positions.len()];
    for (i, read) in reads.iter().enumerate() {
        let model = p.models[read.slot];
        let noise = noise_pi * p.noise_density;
        let mut denom = noise;
        for (j, &mu) in positions.iter().enumerate() {
            let l = pis[j] * model.prob(read.offset(mu));
            resp[j][i] = l;
            denom += l;
        }
        if denom <= 0.0 {
            noise_resp[i] = read.weight;
            continue;
        }
        for row in resp.iter_mut() {
            row[i] *= read.weight / denom;
        }
        noise_resp[i] = read.weight * noise / denom;
    }
    resp
}

/// Position within the update window maximising the component's
/// weighted log likelihood.
fn best_position(reads: &[ReadBin], resp: &[f64], current: i64, p: &EmParams) -> i64 {
    let support: Vec<(&ReadBin, f64)> = reads
        .iter()
        .zip(resp)
        .filter(|(_, r)| **r > 1e-9)
        .map(|(read, r)| (read, *r))
        .collect();
    if support.is_empty() {
        return current;
    }
    let log_lik = |mu: i64| -> f64 {
        support
            .iter()
            .map(|(read, r)| r * p.models[read.slot].prob(read.offset(mu)).max(1e-12).ln())
            .sum()
    };

    let lo = (current - EM_MU_UPDATE_WIN).max(p.bounds.0);
    let hi = (current + EM_MU_UPDATE_WIN).min(p.bounds.1);
    let mut best = current;
    let mut best_ll = log_lik(current);
    for mu in lo..=hi {
        let ll = log_lik(mu);
        if ll > best_ll + 1e-12 {
            best = mu;
            best_ll = ll;
        }
    }
    best
}

fn fit_mixture(reads: &[ReadBin], mut positions: Vec<i64>, p: &EmParams) -> Fit {
    let total: f64 = reads.iter().map(|r| r.weight).sum();
    if reads.is_empty() || positions.is_empty() || total <= 0.0 {
        return Fit {
            noise_reads: total,
            ..Default::default()
        };
    }

    let mut noise_pi = p.noise_pi.clamp(NOISE_EMISSION_MIN, NOISE_EMISSION_MAX);
    let mut pis = vec![(1.0 - noise_pi) / positions.len() as f64; positions.len()];
    let mut noise_resp = vec![0.0; reads.len()];

    for _ in 0..p.max_iter {
        let resp = e_step(reads, &positions, &pis, noise_pi, p, &mut noise_resp);

        // M step; the sparse prior subtracts alpha from every component
        let mut new_pis: Vec<f64> = resp
            .iter()
            .map(|row| (row.iter().sum::<f64>() - p.alpha).max(0.0))
            .collect();
        let mut new_noise: f64 = noise_resp.iter().sum();
        let norm = new_pis.iter().sum::<f64>() + new_noise;
        if norm > 0.0 {
            new_pis.iter_mut().for_each(|v| *v /= norm);
            new_noise /= norm;
        } else {
            new_noise = 1.0;
        }
        let delta = pis
            .iter()
            .zip(&new_pis)
            .map(|(a, b)| (a - b).abs())
            .fold((noise_pi - new_noise).abs(), f64::max);

        let keep: Vec<usize> = (0..positions.len()).filter(|&j| new_pis[j] > 0.0).collect();
        let mut changed = keep.len() != positions.len();
        let mut comps: Vec<(i64, f64)> = keep.iter().map(|&j| (positions[j], new_pis[j])).collect();
        noise_pi = new_noise;

        if p.move_positions {
            for (k, &j) in keep.iter().enumerate() {
                let best = best_position(reads, &resp[j], comps[k].0, p);
                if best != comps[k].0 {
                    comps[k].0 = best;
                    changed = true;
                }
            }
            comps.sort_by_key(|c| c.0);
            let before = comps.len();
            comps = comps
                .into_iter()
                .coalesce(|a, b| if a.0 == b.0 { Ok((a.0, a.1 + b.1)) } else { Err((a, b)) })
                .collect();
            changed |= comps.len() != before;
        }

        positions = comps.iter().map(|c| c.0).collect();
        pis = comps.iter().map(|c| c.1).collect();
        if positions.is_empty() || (!changed && delta < EM_CONVERGENCE) {
            break;
        }
    }

    let resp = e_step(reads, &positions, &pis, noise_pi, p, &mut noise_resp);
    let n_slots = p.models.len();
    let rep_reads = resp
        .iter()
        .map(|row| {
            let mut per_slot = vec![0.0; n_slots];
            for (read, r) in reads.iter().zip(row) {
                per_slot[read.slot] += r;
            }
            per_slot
        })
        .collect();

    Fit {
        positions,
        rep_reads,
        noise_reads: noise_resp.iter().sum(),
        resp,
    }
}
