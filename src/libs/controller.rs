use crate::libs::config::Config;
use crate::libs::engine::{EmEngine, EngineSnapshot, ModelState};
use crate::libs::error::EngineError;
use crate::libs::event::BindingEvent;
use crate::libs::io::write_file;
use crate::libs::ledger::BindingModelLedger;
use crate::libs::output::OutputLayout;
use crate::libs::plot::{Plotter, Series};
use log::{debug, info, warn};

/// Every condition's signal must fall below this for the models to count
/// as settled.
pub const CONVERGENCE_THRESHOLD: f64 = -5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    RoundExecute,
    ModelUpdate,
    ConvergenceCheck,
    Finalize,
    Done,
}

/// Termination rule, checked after `round` rounds have completed.
///
/// ```
/// use bindem::libs::controller::is_converged;
/// assert!(is_converged(4, 0, 3, &[0.0]));
/// assert!(!is_converged(1, 2, 3, &[-9.0]));
/// assert!(is_converged(1, 0, 3, &[-9.0, f64::NAN]));
/// assert!(!is_converged(1, 0, 3, &[-9.0, -3.0]));
/// assert!(!is_converged(3, 0, 3, &[]));
/// ```
pub fn is_converged(round: usize, min_rounds: usize, max_rounds: usize, signals: &[f64]) -> bool {
    if round > max_rounds {
        return true;
    }
    if round < min_rounds {
        return false;
    }
    // No conditions: only the round bounds can end the loop
    if signals.is_empty() {
        return false;
    }
    signals
        .iter()
        .all(|s| s.is_nan() || *s < CONVERGENCE_THRESHOLD)
}

/// Where per-round snapshots and model history plots go.
pub struct Diagnostics<'a> {
    pub layout: &'a OutputLayout,
    pub plotter: &'a dyn Plotter,
    /// File-name tag per replicate
    pub tags: Vec<String>,
}

#[derive(Debug)]
pub struct RefinementOutcome {
    pub events: Vec<BindingEvent>,
    pub signal_fractions: Vec<f64>,
    pub ledger: BindingModelLedger,
    pub state: ModelState,
    /// Training rounds executed
    pub rounds: usize,
}

/// Drives an [`EmEngine`] through training rounds until the binding models
/// settle, then runs the final assignment. Single use: [`run`] consumes it.
///
/// [`run`]: RefinementController::run
pub struct RefinementController<'a> {
    config: &'a Config,
    engine: &'a mut dyn EmEngine,
    ledger: BindingModelLedger,
    state: ModelState,
    labels: Vec<String>,
    diagnostics: Option<Diagnostics<'a>>,
    round: usize,
    phase: Phase,
}

impl<'a> RefinementController<'a> {
    /// `ledger` holds the seed model of every replicate; `labels` name the
    /// replicates in log messages.
    pub fn new(
        config: &'a Config,
        engine: &'a mut dyn EmEngine,
        ledger: BindingModelLedger,
        state: ModelState,
        labels: Vec<String>,
    ) -> Self {
        Self {
            config,
            engine,
            ledger,
            state,
            labels,
            diagnostics: None,
            round: 0,
            phase: Phase::Init,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Diagnostics<'a>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    fn enter(&mut self, phase: Phase) {
        debug!("Round {}: {:?} -> {:?}", self.round, self.phase, phase);
        self.phase = phase;
    }

    fn label(&self, r: usize) -> String {
        self.labels
            .get(r)
            .cloned()
            .unwrap_or_else(|| format!("replicate {}", r))
    }

    pub fn run(mut self) -> Result<RefinementOutcome, EngineError> {
        let mut converged = false;
        while !converged {
            self.enter(Phase::RoundExecute);
            info!("==> Round {}", self.round);
            let snapshot = self
                .engine
                .train_round(self.round == 0, &self.ledger, &self.state)?;
            debug!("{} active components", snapshot.active_components);

            self.enter(Phase::ModelUpdate);
            let signals = self.apply_updates(snapshot);

            self.round += 1;
            self.enter(Phase::ConvergenceCheck);
            converged = is_converged(
                self.round,
                self.config.min_rounds,
                self.config.max_rounds,
                &signals,
            );
            debug!("Convergence signals {:?}, converged: {}", signals, converged);
        }

        self.enter(Phase::Finalize);
        self.plot_model_histories();
        info!("==> ML read assignment");
        let assignment = self
            .engine
            .run_final_assignment(&self.ledger, &self.state)?;
        info!(
            "{} binding events after {} rounds",
            assignment.events.len(),
            self.round
        );

        self.enter(Phase::Done);
        Ok(RefinementOutcome {
            events: assignment.events,
            signal_fractions: assignment.signal_fractions,
            ledger: self.ledger,
            state: self.state,
            rounds: self.round,
        })
    }

    /// Applies one snapshot. A failed sub-update keeps the previous value;
    /// the ledger still grows by one model per replicate.
    fn apply_updates(&mut self, snapshot: EngineSnapshot) -> Vec<f64> {
        let EngineSnapshot {
            binding_models,
            convergence,
            alphas,
            motifs,
            noise,
            ..
        } = snapshot;
        let n_cond = self.state.alphas.len();

        let mut models = binding_models.into_iter();
        for r in 0..self.ledger.num_replicates() {
            let model = match models.next() {
                Some(Ok(m)) => m,
                Some(Err(e)) => {
                    warn!("{}: {}; keeping the previous model", self.label(r), e);
                    self.ledger.latest(r).clone()
                }
                None => {
                    warn!("No model update for {}; keeping the previous model", self.label(r));
                    self.ledger.latest(r).clone()
                }
            };
            self.write_read_distrib(r, &model.to_tsv());
            self.ledger.record(r, model);
        }

        match alphas {
            Ok(a) if a.len() == n_cond => {
                debug!("Alphas {:?}", a);
                self.state.alphas = a;
            }
            Ok(a) => warn!("Expected {} alphas, got {}; keeping the previous ones", n_cond, a.len()),
            Err(e) => warn!("{}; keeping the previous alphas", e),
        }
        match motifs {
            Ok(m) if m.len() == n_cond => self.state.motifs = m,
            Ok(m) => warn!("Expected {} motifs, got {}; keeping the previous ones", n_cond, m.len()),
            Err(e) => warn!("{}; keeping the previous motifs", e),
        }
        match noise {
            Ok(n) if n.per_base.len() == n_cond => self.state.noise = n,
            Ok(_) => warn!("Noise model does not match the conditions; keeping the previous one"),
            Err(e) => warn!("{}; keeping the previous noise model", e),
        }

        convergence
    }

    fn write_read_distrib(&self, r: usize, content: &str) {
        if let Some(d) = &self.diagnostics {
            let tag = d.tags.get(r).cloned().unwrap_or_else(|| r.to_string());
            let path = d.layout.read_distrib(self.round, &tag);
            if let Err(e) = write_file(&path, content) {
                warn!("Skipping {}: {}", path.display(), e);
            }
        }
    }

    fn plot_model_histories(&self) {
        let d = match &self.diagnostics {
            Some(d) => d,
            None => return,
        };
        for r in 0..self.ledger.num_replicates() {
            let series: Vec<Series> = self
                .ledger
                .history(r)
                .enumerate()
                .map(|(i, m)| Series {
                    name: format!("t{}", i),
                    points: m.series(),
                })
                .collect();
            let tag = d.tags.get(r).cloned().unwrap_or_else(|| r.to_string());
            let path = d.layout.model_history_image(&tag);
            if let Err(e) = d.plotter.line_plot(
                &path,
                &self.label(r),
                "Relative position",
                "Density",
                &series,
            ) {
                warn!("Skipping {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::engine::testing::ScriptedEngine;
    use crate::libs::engine::NoiseModel;
    use crate::libs::model::BindingModel;
    use crate::libs::plot::SvgPlotter;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn seeds(n: usize) -> BindingModelLedger {
        BindingModelLedger::new(
            (0..n)
                .map(|_| BindingModel::from_profile(0, vec![1.0, 2.0, 1.0]).unwrap())
                .collect(),
        )
    }

    fn state(n_cond: usize) -> ModelState {
        ModelState {
            alphas: vec![1.0; n_cond],
            motifs: vec![None; n_cond],
            noise: NoiseModel {
                per_base: vec![0.1; n_cond],
            },
        }
    }

    fn bounds(min_rounds: usize, max_rounds: usize) -> Config {
        Config {
            min_rounds,
            max_rounds,
            ..Config::default()
        }
    }

    fn run(
        config: &Config,
        engine: &mut ScriptedEngine,
        n_cond: usize,
    ) -> Result<RefinementOutcome, EngineError> {
        let n_rep = engine.num_replicates;
        RefinementController::new(config, engine, seeds(n_rep), state(n_cond), vec![]).run()
    }

    #[test]
    fn test_stops_at_first_settled_round() {
        let config = bounds(0, 5);
        let mut engine = ScriptedEngine::new(vec![vec![-2.0], vec![-6.0], vec![-6.0]], 1, 1);
        let outcome = run(&config, &mut engine, 1).unwrap();
        assert_eq!(outcome.rounds, 2);
        assert_eq!(engine.rounds_run(), 2);
        assert_eq!(engine.seed_flags, vec![true, false]);
        assert_eq!(engine.final_calls, 1);
    }

    #[test]
    fn test_one_unsettled_condition_forces_continue() {
        let config = bounds(0, 5);
        let mut engine = ScriptedEngine::new(
            vec![vec![-6.0, -3.0], vec![-6.0, -3.0], vec![-9.0, f64::NAN]],
            2,
            2,
        );
        let outcome = run(&config, &mut engine, 2).unwrap();
        assert_eq!(outcome.rounds, 3);
    }

    #[test]
    fn test_all_nan_stops_after_min_rounds() {
        let config = bounds(2, 5);
        let mut engine = ScriptedEngine::new(vec![vec![f64::NAN, f64::NAN]], 2, 2);
        let outcome = run(&config, &mut engine, 2).unwrap();
        assert_eq!(outcome.rounds, 2);
    }

    #[test]
    fn test_never_settling_stops_after_max_plus_one() {
        let config = bounds(0, 3);
        let mut engine = ScriptedEngine::new(vec![vec![0.0]], 1, 1);
        let outcome = run(&config, &mut engine, 1).unwrap();
        assert_eq!(outcome.rounds, 4);
        assert_eq!(outcome.ledger.history_len(0), 5);
    }

    #[test]
    fn test_empty_condition_set() {
        let config = bounds(3, 5);
        let mut engine = ScriptedEngine::new(vec![], 0, 0);
        let outcome = run(&config, &mut engine, 0).unwrap();
        assert_eq!(outcome.rounds, 6);

        let config = bounds(0, 2);
        let mut engine = ScriptedEngine::new(vec![], 0, 0);
        assert_eq!(run(&config, &mut engine, 0).unwrap().rounds, 3);
    }

    #[test]
    fn test_round_bounds_hold_for_random_signals() {
        let mut rng = SmallRng::seed_from_u64(42);
        let palette = [-12.0, -6.0, -5.0, -3.0, 0.0, 2.0, f64::NAN];

        for _ in 0..200 {
            let max_rounds = rng.gen_range(0..6);
            let min_rounds = rng.gen_range(0..=max_rounds + 1);
            let n_cond = rng.gen_range(1..4);
            let n_rep = rng.gen_range(1..4);
            let signals: Vec<Vec<f64>> = (0..max_rounds + 1)
                .map(|_| {
                    (0..n_cond)
                        .map(|_| palette[rng.gen_range(0..palette.len())])
                        .collect()
                })
                .collect();

            let expected = (1..=max_rounds + 1)
                .find(|&k| {
                    k > max_rounds
                        || (k >= min_rounds
                            && signals[k - 1].iter().all(|s| s.is_nan() || *s < -5.0))
                })
                .unwrap();

            let config = bounds(min_rounds, max_rounds);
            let mut engine = ScriptedEngine::new(signals.clone(), n_rep, n_cond);
            let outcome = run(&config, &mut engine, n_cond).unwrap();

            assert!(outcome.rounds >= min_rounds, "{:?}", signals);
            assert!(outcome.rounds <= max_rounds + 1, "{:?}", signals);
            assert_eq!(outcome.rounds, expected, "{:?}", signals);
            for r in 0..n_rep {
                assert_eq!(outcome.ledger.history_len(r), outcome.rounds + 1);
            }
        }
    }

    #[test]
    fn test_failed_updates_keep_previous_values() {
        let config = bounds(0, 0);
        let mut engine = ScriptedEngine::new(vec![vec![-9.0]], 2, 1);
        engine.fail_alpha = true;
        engine.fail_noise = true;
        let outcome = run(&config, &mut engine, 1).unwrap();
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.state.alphas, vec![1.0]);
        assert_eq!(outcome.state.noise.per_base, vec![0.1]);
        // the model update itself went through
        assert_eq!(outcome.ledger.latest(0).min(), 1);

        let mut engine = ScriptedEngine::new(vec![vec![-9.0]], 1, 1);
        engine.fail_motif = true;
        let outcome = run(&config, &mut engine, 1).unwrap();
        assert_eq!(outcome.state.alphas, vec![2.0]);
        assert_eq!(outcome.state.noise.per_base, vec![0.05]);
    }

    #[test]
    fn test_engine_failures_abort() {
        let config = bounds(0, 5);
        let mut engine = ScriptedEngine::new(vec![vec![0.0]], 1, 1);
        engine.fail_training_at = Some(1);
        let err = run(&config, &mut engine, 1).unwrap_err();
        assert!(matches!(err, EngineError::Training { round: 1, .. }));
        assert_eq!(engine.final_calls, 0);

        let mut engine = ScriptedEngine::new(vec![vec![-9.0]], 1, 1);
        engine.fail_final = true;
        let err = run(&config, &mut engine, 1).unwrap_err();
        assert!(matches!(err, EngineError::Assignment(_)));
    }

    #[test]
    fn test_diagnostics_written() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path(), "run");
        layout.prepare().unwrap();
        let plotter = SvgPlotter::default();

        let config = bounds(0, 5);
        let mut engine = ScriptedEngine::new(vec![vec![0.0], vec![-9.0]], 1, 1);
        let controller = RefinementController::new(
            &config,
            &mut engine,
            seeds(1),
            state(1),
            vec!["dex:rep1".to_string()],
        )
        .with_diagnostics(Diagnostics {
            layout: &layout,
            plotter: &plotter,
            tags: vec!["dex-rep1".to_string()],
        });
        let outcome = controller.run().unwrap();
        assert_eq!(outcome.rounds, 2);

        assert!(layout.read_distrib(0, "dex-rep1").is_file());
        assert!(layout.read_distrib(1, "dex-rep1").is_file());
        assert!(!layout.read_distrib(2, "dex-rep1").exists());
        assert!(layout.model_history_image("dex-rep1").is_file());
    }
}
