//! The EM engine seam.
//!
//! The refinement loop talks to its engine only through [`EmEngine`]. Each
//! training round hands back one [`EngineSnapshot`] with everything the
//! controller needs, so no engine internals are polled between rounds.

pub mod mixture;

use crate::libs::error::EngineError;
use crate::libs::event::BindingEvent;
use crate::libs::ledger::BindingModelLedger;
use crate::libs::model::BindingModel;
use crate::libs::motif::WeightMatrix;

pub use mixture::MixtureEngine;

/// A condition's motif with its offset from the binding position.
#[derive(Debug, Clone, PartialEq)]
pub struct MotifPrior {
    pub matrix: WeightMatrix,
    pub offset: i64,
}

/// Background read rate per base, one value per condition.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseModel {
    pub per_base: Vec<f64>,
}

/// Condition-level state owned by the controller during refinement.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelState {
    pub alphas: Vec<f64>,
    pub motifs: Vec<Option<MotifPrior>>,
    pub noise: NoiseModel,
}

impl ModelState {
    pub fn motif(&self, cond: usize) -> Option<&WeightMatrix> {
        self.motifs
            .get(cond)
            .and_then(|m| m.as_ref())
            .map(|m| &m.matrix)
    }
}

/// Everything one training round produced.
///
/// Each update is a separate `Result`: one failing sub-step must not block
/// the others.
#[derive(Debug)]
pub struct EngineSnapshot {
    /// Indexed by replicate
    pub binding_models: Vec<Result<BindingModel, EngineError>>,
    /// One convergence signal per condition
    pub convergence: Vec<f64>,
    pub alphas: Result<Vec<f64>, EngineError>,
    pub motifs: Result<Vec<Option<MotifPrior>>, EngineError>,
    pub noise: Result<NoiseModel, EngineError>,
    pub active_components: usize,
}

/// Output of the deterministic ML assignment.
#[derive(Debug, Clone)]
pub struct FinalAssignment {
    pub events: Vec<BindingEvent>,
    /// Fraction of each replicate's reads assigned to binding events
    pub signal_fractions: Vec<f64>,
}

pub trait EmEngine {
    /// Runs one EM training round and blocks until it is done.
    ///
    /// `seed_from_prior` asks the engine to rebuild its component
    /// configuration from scratch; otherwise it starts from the previous
    /// round's survivors plus flanking candidates.
    fn train_round(
        &mut self,
        seed_from_prior: bool,
        models: &BindingModelLedger,
        state: &ModelState,
    ) -> Result<EngineSnapshot, EngineError>;

    /// ML read assignment with the last accepted models; no model updates.
    fn run_final_assignment(
        &mut self,
        models: &BindingModelLedger,
        state: &ModelState,
    ) -> Result<FinalAssignment, EngineError>;
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::libs::region::Point;

    /// Engine that replays scripted convergence signals and fixed events.
    pub struct ScriptedEngine {
        /// Per-round signals; rounds past the end repeat the last entry
        pub signals: Vec<Vec<f64>>,
        pub num_replicates: usize,
        pub num_conditions: usize,
        pub fail_training_at: Option<usize>,
        pub fail_alpha: bool,
        pub fail_motif: bool,
        pub fail_noise: bool,
        pub fail_final: bool,
        pub final_events: Vec<BindingEvent>,
        pub signal_fractions: Vec<f64>,
        /// `seed_from_prior` of every training call, in order
        pub seed_flags: Vec<bool>,
        pub final_calls: usize,
    }

    impl ScriptedEngine {
        pub fn new(signals: Vec<Vec<f64>>, num_replicates: usize, num_conditions: usize) -> Self {
            Self {
                signals,
                num_replicates,
                num_conditions,
                fail_training_at: None,
                fail_alpha: false,
                fail_motif: false,
                fail_noise: false,
                fail_final: false,
                final_events: vec![],
                signal_fractions: vec![0.0; num_replicates],
                seed_flags: vec![],
                final_calls: 0,
            }
        }

        pub fn rounds_run(&self) -> usize {
            self.seed_flags.len()
        }

        /// One event per point, found in every condition.
        pub fn with_events(mut self, points: &[(&str, i64)]) -> Self {
            self.final_events = points
                .iter()
                .map(|(chrom, pos)| {
                    BindingEvent::new(
                        Point::new(chrom, *pos),
                        None,
                        vec![1.0; self.num_replicates],
                        vec![0.0; self.num_replicates],
                        vec![true; self.num_conditions],
                    )
                })
                .collect();
            self
        }
    }

    impl EmEngine for ScriptedEngine {
        fn train_round(
            &mut self,
            seed_from_prior: bool,
            models: &BindingModelLedger,
            state: &ModelState,
        ) -> Result<EngineSnapshot, EngineError> {
            let round = self.seed_flags.len();
            self.seed_flags.push(seed_from_prior);
            if self.fail_training_at == Some(round) {
                return Err(EngineError::Training {
                    round,
                    message: "scripted failure".to_string(),
                });
            }

            let convergence = self
                .signals
                .get(round)
                .or_else(|| self.signals.last())
                .cloned()
                .unwrap_or_default();
            let binding_models = (0..self.num_replicates)
                .map(|r| {
                    let prev = models.latest(r);
                    Ok(BindingModel::from_profile(prev.min() + 1, prev.probs().to_vec())
                        .expect("shifted copy of a valid model"))
                })
                .collect();
            let alphas = if self.fail_alpha {
                Err(EngineError::update("alpha", "scripted failure"))
            } else {
                Ok(state.alphas.iter().map(|a| a + 1.0).collect())
            };
            let motifs = if self.fail_motif {
                Err(EngineError::update("motif", "scripted failure"))
            } else {
                Ok(state.motifs.clone())
            };
            let noise = if self.fail_noise {
                Err(EngineError::update("noise", "scripted failure"))
            } else {
                Ok(NoiseModel {
                    per_base: state.noise.per_base.iter().map(|n| n * 0.5).collect(),
                })
            };

            Ok(EngineSnapshot {
                binding_models,
                convergence,
                alphas,
                motifs,
                noise,
                active_components: self.final_events.len(),
            })
        }

        fn run_final_assignment(
            &mut self,
            _models: &BindingModelLedger,
            _state: &ModelState,
        ) -> Result<FinalAssignment, EngineError> {
            self.final_calls += 1;
            if self.fail_final {
                return Err(EngineError::Assignment("scripted failure".to_string()));
            }
            Ok(FinalAssignment {
                events: self.final_events.clone(),
                signal_fractions: self.signal_fractions.clone(),
            })
        }
    }
}
