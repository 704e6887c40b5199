use crate::libs::config::Config;
use crate::libs::design::Experiment;
use crate::libs::diff::{CountsDataset, DiffTester, Normalizer};
use crate::libs::engine::ModelState;
use crate::libs::event::BindingEvent;
use crate::libs::io::write_file;
use crate::libs::motif::{MotifScanner, WeightMatrix};
use crate::libs::output::{write_diff_events, write_events, write_motifs, HistoKind, OutputLayout};
use crate::libs::plot::Plotter;
use crate::libs::proximity::{render_sections, ProximityHistogram};
use crate::libs::report::{write_report, ReportData};
use crate::libs::significance::SignificanceTester;
use log::{info, warn};
use std::path::{Path, PathBuf};

/// External collaborators of post-processing.
pub struct Collaborators<'a> {
    pub significance: &'a dyn SignificanceTester,
    pub normalizer: &'a dyn Normalizer,
    pub diff_tester: &'a dyn DiffTester,
    pub plotter: &'a dyn Plotter,
    pub scanner: Option<&'a dyn MotifScanner>,
}

/// What post-processing produced, and which steps it had to skip.
#[derive(Debug, Default)]
pub struct Artifacts {
    pub files: Vec<PathBuf>,
    pub diff_ran: bool,
    pub skipped: Vec<String>,
}

impl Artifacts {
    fn skip(&mut self, step: &str, err: anyhow::Error) {
        warn!("Skipping {}: {}", step, err);
        self.skipped.push(step.to_string());
    }

    fn record(&mut self, step: &str, result: anyhow::Result<PathBuf>) {
        match result {
            Ok(path) => self.files.push(path),
            Err(e) => self.skip(step, e),
        }
    }
}

/// Turns a finished event set into significance calls, differential calls,
/// event files, histograms and a report.
///
/// Every step runs even when an earlier one failed; a failed step is logged
/// and listed in [`Artifacts::skipped`].
pub struct PostProcessingPipeline<'a> {
    config: &'a Config,
    experiment: &'a Experiment,
    layout: &'a OutputLayout,
    collab: Collaborators<'a>,
    args: String,
}

impl<'a> PostProcessingPipeline<'a> {
    pub fn new(
        config: &'a Config,
        experiment: &'a Experiment,
        layout: &'a OutputLayout,
        collab: Collaborators<'a>,
    ) -> Self {
        Self {
            config,
            experiment,
            layout,
            collab,
            args: String::new(),
        }
    }

    /// Command line shown in the report.
    pub fn with_args(mut self, args: &str) -> Self {
        self.args = args.to_string();
        self
    }

    pub fn run(
        &self,
        events: &mut [BindingEvent],
        state: &ModelState,
        signal_fractions: &[f64],
    ) -> Artifacts {
        let exp = self.experiment;
        let config = self.config;
        let layout = self.layout;
        let mut art = Artifacts::default();

        // 1. enrichment over control
        info!("==> Enrichment significance");
        if let Err(e) = self.collab.significance.test(exp, events) {
            art.skip("enrichment significance", e);
        }

        // 2. counts, consumed by the differential tests
        let counts = layout.counts_file();
        art.record(
            "replicate counts",
            CountsDataset::from_events(exp, events, 0)
                .write(&counts)
                .map(|_| counts.clone()),
        );

        // 3. differential enrichment
        if exp.num_conditions() > 1 && config.run_diff_tests {
            info!("==> Differential enrichment");
            if counts.is_file() {
                match self.differential(events, &counts) {
                    Ok(data) => {
                        art.diff_ran = true;
                        self.pair_plots(events, &data, &mut art);
                        self.replicate_plots(&data, &mut art);
                    }
                    Err(e) => art.skip("differential enrichment", e),
                }
            } else {
                art.skip(
                    "differential enrichment",
                    anyhow::anyhow!("no counts file at {}", counts.display()),
                );
            }
        }

        // 4. event files
        info!("==> Writing events");
        for (c, cond) in exp.conditions.iter().enumerate() {
            let path = layout.events_file(&cond.name, config.events_txt);
            art.record(
                "events file",
                write_events(&path, exp, events, c, config.q_min, art.diff_ran).map(|n| {
                    info!("{}: {} events", cond.name, n);
                    path.clone()
                }),
            );
        }
        if art.diff_ran {
            for (a, ca) in exp.conditions.iter().enumerate() {
                for (b, cb) in exp.conditions.iter().enumerate() {
                    if a == b {
                        continue;
                    }
                    let path = layout.diff_events_file(&ca.name, &cb.name, config.events_txt);
                    art.record(
                        "differential events file",
                        write_diff_events(&path, events, a, b, config.q_min, config.diff_p)
                            .map(|_| path.clone()),
                    );
                }
            }
        }
        if config.find_motifs {
            let path = layout.motifs_file(config.events_txt);
            art.record(
                "motif list",
                write_motifs(&path, exp, state).map(|_| path.clone()),
            );
        }

        // 5. proximity histograms and the report
        info!("==> Events post-analysis");
        self.histograms(events, state, &mut art);
        let report = ReportData {
            config,
            layout,
            experiment: exp,
            events,
            state,
            signal_fractions,
            diff_ran: art.diff_ran,
            args: self.args.clone(),
        };
        art.record("report", write_report(&report));

        art
    }

    /// Tests every condition in turn as the reference. Returns the
    /// normalised counts for plotting.
    fn differential(
        &self,
        events: &mut [BindingEvent],
        counts: &Path,
    ) -> anyhow::Result<CountsDataset> {
        let mut normalized = None;
        for reference in 0..self.experiment.num_conditions() {
            let data = CountsDataset::read(counts, self.experiment, reference)?;
            let data = self.collab.normalizer.normalize(data);
            let data = self.collab.diff_tester.test(data)?;
            data.update_events(events)?;
            if normalized.is_none() {
                normalized = Some(data);
            }
        }
        normalized.ok_or_else(|| anyhow::anyhow!("no conditions to test"))
    }

    /// XY and MA plots for every ordered condition pair. Failures only warn.
    fn pair_plots(&self, events: &[BindingEvent], data: &CountsDataset, art: &mut Artifacts) {
        let exp = self.experiment;
        let pooled: Vec<Vec<f64>> = (0..exp.num_conditions()).map(|c| data.pooled(c)).collect();

        for (a, ca) in exp.conditions.iter().enumerate() {
            for (b, cb) in exp.conditions.iter().enumerate() {
                if a == b {
                    continue;
                }
                let mut xy = vec![];
                let mut ma = vec![];
                let mut xy_diff = vec![];
                let mut ma_diff = vec![];
                for (i, event) in events.iter().enumerate() {
                    let la = (pooled[a][i] + 1.0).log2();
                    let lb = (pooled[b][i] + 1.0).log2();
                    let diff = event.is_diff_enriched(a, b, self.config.q_min, self.config.diff_p)
                        || event.is_diff_enriched(b, a, self.config.q_min, self.config.diff_p);
                    let (xy_to, ma_to) = if diff {
                        (&mut xy_diff, &mut ma_diff)
                    } else {
                        (&mut xy, &mut ma)
                    };
                    xy_to.push((la, lb));
                    ma_to.push(((la + lb) / 2.0, la - lb));
                }

                let title = format!("{} vs {}", ca.name, cb.name);
                let path = self.layout.pair_image(&ca.name, &cb.name, "XY");
                let x_desc = format!("log2 {}", ca.name);
                let y_desc = format!("log2 {}", cb.name);
                art.record(
                    "XY plot",
                    self.collab
                        .plotter
                        .scatter_plot(&path, &title, &x_desc, &y_desc, &xy, &xy_diff)
                        .map(|_| path.clone()),
                );
                let path = self.layout.pair_image(&ca.name, &cb.name, "MA");
                art.record(
                    "MA plot",
                    self.collab
                        .plotter
                        .scatter_plot(&path, &title, "A", "M", &ma, &ma_diff)
                        .map(|_| path.clone()),
                );
            }
        }
    }

    /// XY plots for every pair of replicates within a condition.
    fn replicate_plots(&self, data: &CountsDataset, art: &mut Artifacts) {
        let exp = self.experiment;
        // counts columns follow the file header, not the design order
        let columns: Vec<Option<Vec<f64>>> = (0..exp.replicates.len())
            .map(|r| {
                let label = exp.replicate_label(r);
                data.labels.iter().position(|l| *l == label).map(|k| {
                    data.normalized(k).iter().map(|v| (v + 1.0).log2()).collect()
                })
            })
            .collect();

        for cond in &exp.conditions {
            for (i, &ra) in cond.replicates.iter().enumerate() {
                for &rb in &cond.replicates[i + 1..] {
                    let (name_a, name_b) = (&exp.replicates[ra].name, &exp.replicates[rb].name);
                    let (Some(xs), Some(ys)) = (&columns[ra], &columns[rb]) else {
                        art.skip(
                            "replicate XY plot",
                            anyhow::anyhow!("no counts for {} {} or {}", cond.name, name_a, name_b),
                        );
                        continue;
                    };
                    let points: Vec<(f64, f64)> =
                        xs.iter().copied().zip(ys.iter().copied()).collect();
                    let path = self.layout.replicate_pair_image(&cond.name, name_a, name_b);
                    let title = format!("{}: {} vs {}", cond.name, name_a, name_b);
                    art.record(
                        "replicate XY plot",
                        self.collab
                            .plotter
                            .scatter_plot(
                                &path,
                                &title,
                                &format!("log2 {}", name_a),
                                &format!("log2 {}", name_b),
                                &points,
                                &[],
                            )
                            .map(|_| path.clone()),
                    );
                }
            }
        }
    }

    fn histograms(&self, events: &[BindingEvent], state: &ModelState, art: &mut Artifacts) {
        let exp = self.experiment;
        let window = self.config.histo_window;
        let names: Vec<String> = exp.conditions.iter().map(|c| c.name.clone()).collect();
        let prox = ProximityHistogram::new(names, events, self.config.q_min);

        if self.config.find_motifs {
            if let Some(scanner) = self.collab.scanner {
                let motifs: Vec<Option<&WeightMatrix>> =
                    (0..exp.num_conditions()).map(|c| state.motif(c)).collect();
                let path = self.layout.histo_file(HistoKind::PeaksToMotifs);
                let result = prox
                    .peak_to_motif_all(window, scanner, &motifs)
                    .and_then(|sections| {
                        write_file(
                            &path,
                            &render_sections("Peaks to closest motifs distance histograms", &sections),
                        )
                    })
                    .map(|_| path.clone());
                art.record("peak-motif histograms", result);
            }
        }

        let path = self.layout.histo_file(HistoKind::IntraCondition);
        let sections = prox.intra_condition_distances(window);
        art.record(
            "intra-condition histograms",
            write_file(
                &path,
                &render_sections("Peaks to other peaks in same condition distance histograms", &sections),
            )
            .map(|_| path.clone()),
        );

        if exp.num_conditions() > 1 {
            let path = self.layout.histo_file(HistoKind::InterCondition);
            let sections = prox.inter_condition_distances(window);
            art.record(
                "inter-condition histograms",
                write_file(
                    &path,
                    &render_sections("Peaks to peaks in other conditions distance histograms", &sections),
                )
                .map(|_| path.clone()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::controller::RefinementController;
    use crate::libs::design::{ReadHits, ReplicateSpec, Strand};
    use crate::libs::diff::{ExactDiffTester, TmmNormalization};
    use crate::libs::engine::testing::ScriptedEngine;
    use crate::libs::engine::NoiseModel;
    use crate::libs::ledger::BindingModelLedger;
    use crate::libs::model::BindingModel;
    use crate::libs::plot::SvgPlotter;
    use crate::libs::region::{Genome, Region};
    use crate::libs::significance::EnrichmentSignificance;

    /// Reads piled up around 1000, 5000 and 9000 on one chromosome.
    fn pileups(offset: i64) -> ReadHits {
        let mut hits = vec![];
        for centre in [1000, 5000, 9000] {
            for i in 0..10 {
                hits.push(("chr1", centre - 75 + i + offset, Strand::Plus));
                hits.push(("chr1", centre + 75 - i + offset, Strand::Minus));
            }
        }
        ReadHits::from_hits(hits)
    }

    fn experiment(conditions: &[&str]) -> Experiment {
        let mut genome = Genome::new();
        genome.insert("chr1", 1_000_000);
        let mut specs = vec![];
        for cond in conditions {
            for rep in ["rep1", "rep2"] {
                specs.push(ReplicateSpec {
                    condition: cond.to_string(),
                    name: rep.to_string(),
                    signal: pileups(0),
                    control: Some(pileups(50)),
                });
            }
        }
        Experiment::new(Some(genome), specs).unwrap()
    }

    fn state(n_cond: usize) -> ModelState {
        ModelState {
            alphas: vec![1.0; n_cond],
            motifs: vec![None; n_cond],
            noise: NoiseModel {
                per_base: vec![0.0; n_cond],
            },
        }
    }

    struct FailingSignificance;

    impl SignificanceTester for FailingSignificance {
        fn test(&self, _: &Experiment, _: &mut [BindingEvent]) -> anyhow::Result<()> {
            anyhow::bail!("tester unavailable")
        }
    }

    #[test]
    fn test_scripted_end_to_end() {
        let exp = experiment(&["dex"]);
        let regions = [
            Region::new("chr1", 700, 1300),
            Region::new("chr1", 4700, 5300),
            Region::new("chr1", 8700, 9300),
        ];
        let config = Config {
            max_rounds: 0,
            min_fold: 1.5,
            q_min: 0.5,
            ..Config::default()
        };

        let mut engine = ScriptedEngine::new(vec![vec![-9.0]], 2, 1).with_events(&[
            ("chr1", 1000),
            ("chr1", 5000),
            ("chr1", 9000),
        ]);
        // combined control 20 (scaling 1), so signals 30, 29 and 60 give
        // folds 1.5, 1.45 and 3
        for (event, (s1, s2)) in engine
            .final_events
            .iter_mut()
            .zip([(15.0, 15.0), (14.0, 15.0), (30.0, 30.0)])
        {
            event.rep_signal = vec![s1, s2];
            event.rep_control = vec![10.0, 10.0];
        }
        let n_events = engine.final_events.len();

        let ledger =
            BindingModelLedger::new(vec![BindingModel::default_chipseq(); 2]);
        let outcome =
            RefinementController::new(&config, &mut engine, ledger, state(1), vec![])
                .run()
                .unwrap();
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.events.len(), n_events);
        for (event, region) in outcome.events.iter().zip(&regions) {
            assert!(region.contains(event.point().pos));
        }

        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path(), "run");
        layout.prepare().unwrap();
        let significance = EnrichmentSignificance::new(
            config.min_fold,
            exp.mappable_len(config.mappability),
            600,
        );
        let plotter = SvgPlotter::default();
        let collab = Collaborators {
            significance: &significance,
            normalizer: &TmmNormalization::default(),
            diff_tester: &ExactDiffTester,
            plotter: &plotter,
            scanner: None,
        };
        let pipeline = PostProcessingPipeline::new(&config, &exp, &layout, collab);
        let mut events = outcome.events;
        let art = pipeline.run(&mut events, &outcome.state, &outcome.signal_fractions);

        assert!(events[0].conds[0].enriched, "fold exactly at the minimum passes");
        assert!(!events[1].conds[0].enriched);
        assert!(events[2].conds[0].enriched);
        assert!(art.skipped.is_empty(), "{:?}", art.skipped);
        assert!(!art.diff_ran);

        let body = std::fs::read_to_string(layout.events_file("dex", false)).unwrap();
        let points: Vec<&str> = body
            .lines()
            .skip(1)
            .map(|l| l.split('\t').next().unwrap())
            .collect();
        assert_eq!(points, vec!["chr1:1000", "chr1:9000"]);
        assert!(layout.counts_file().is_file());
        assert!(layout.report_file().is_file());
        assert!(layout.histo_file(HistoKind::IntraCondition).is_file());
    }

    #[test]
    fn test_differential_needs_two_conditions() {
        let exp = experiment(&["dex"]);
        let config = Config {
            run_diff_tests: true,
            ..Config::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path(), "run");
        layout.prepare().unwrap();

        let significance = EnrichmentSignificance::new(1.5, 1e6, 600);
        let plotter = SvgPlotter::default();
        let collab = Collaborators {
            significance: &significance,
            normalizer: &TmmNormalization::default(),
            diff_tester: &ExactDiffTester,
            plotter: &plotter,
            scanner: None,
        };
        let mut events = ScriptedEngine::new(vec![], 2, 1)
            .with_events(&[("chr1", 1000)])
            .final_events;
        let art = PostProcessingPipeline::new(&config, &exp, &layout, collab).run(
            &mut events,
            &state(1),
            &[0.5, 0.5],
        );

        assert!(!art.diff_ran);
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().all(|n| !n.contains(".diff.events")));
        assert!(std::fs::read_dir(layout.images_dir())
            .unwrap()
            .all(|e| !e.unwrap().file_name().to_string_lossy().contains("_vs_")));
        assert!(!layout.histo_file(HistoKind::InterCondition).exists());
    }

    #[test]
    fn test_two_conditions_and_degraded_steps() {
        let exp = experiment(&["dex", "etoh"]);
        let config = Config::default();
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path(), "run");
        layout.prepare().unwrap();
        let plotter = SvgPlotter::default();

        let mut events = ScriptedEngine::new(vec![], 4, 2)
            .with_events(&[("chr1", 1000), ("chr1", 5000)])
            .final_events;
        events[0].rep_signal = vec![40.0, 40.0, 2.0, 2.0];

        let collab = Collaborators {
            significance: &FailingSignificance,
            normalizer: &TmmNormalization::default(),
            diff_tester: &ExactDiffTester,
            plotter: &plotter,
            scanner: None,
        };
        let art = PostProcessingPipeline::new(&config, &exp, &layout, collab).run(
            &mut events,
            &state(2),
            &[0.5; 4],
        );

        assert_eq!(art.skipped, vec!["enrichment significance".to_string()]);
        assert!(art.diff_ran);
        assert!(events[0].conds[0].diff[1].is_some());
        assert!(events[0].conds[1].diff[0].is_some());
        assert!(layout.diff_events_file("dex", "etoh", false).is_file());
        assert!(layout.diff_events_file("etoh", "dex", false).is_file());
        assert!(layout.pair_image("dex", "etoh", "XY").is_file());
        assert!(layout.pair_image("etoh", "dex", "MA").is_file());
        assert!(layout.replicate_pair_image("dex", "rep1", "rep2").is_file());
        assert!(layout.replicate_pair_image("etoh", "rep1", "rep2").is_file());
        assert!(!layout.replicate_pair_image("dex", "rep2", "rep1").exists());
        assert!(layout.histo_file(HistoKind::InterCondition).is_file());
        // later steps still ran
        assert!(layout.events_file("etoh", false).is_file());
        assert!(layout.report_file().is_file());
        let html = std::fs::read_to_string(layout.report_file()).unwrap();
        assert!(html.contains("images/run_etoh_rep1_vs_rep2.XY.svg"));
    }
}
