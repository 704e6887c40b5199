use bindem::libs::config::{ArgSource, Config};
use bindem::libs::controller::{Diagnostics, RefinementController};
use bindem::libs::diff::{ExactDiffTester, TmmNormalization};
use bindem::libs::engine::MixtureEngine;
use bindem::libs::ledger::BindingModelLedger;
use bindem::libs::motif::{FastaMotifScanner, MotifScanner};
use bindem::libs::output::{write_regions, OutputLayout};
use bindem::libs::pipeline::{Collaborators, PostProcessingPipeline};
use bindem::libs::plot::SvgPlotter;
use bindem::libs::region::PotentialRegionFilter;
use bindem::libs::significance::EnrichmentSignificance;
use clap::*;
use log::{info, warn};

pub fn make_subcommand() -> Command {
    let cmd = Command::new("run")
        .about("Detect binding events across conditions")
        .after_help(
            r###"
Finds potential regions, refines per-replicate read distributions with
rounds of EM, assigns reads to events and tests them.

Design file, one read file per line (BED or BED.gz, 5' ends are used):
    path    signal|control    condition    [replicate]

A control whose replicate matches no signal replicate is shared by the
whole condition.

Outputs under --outdir:
    <base>_<cond>.events                  events per condition
    <base>_<A>_gt_<B>.diff.events         differentially enriched events
    <base>.replicates.counts              per-replicate counts
    <base>.motifs                         motif priors (with --motif)
    bindem_<base>_results.html            report
    intermediate-results/, images/        per-round snapshots and plots

Examples:
1. Default run:
   bindem run design.tsv --sizes genome.sizes -o out

2. Motif priors from genome sequence:
   bindem run design.tsv --seq genome.fa --motif dex=gr.txt -o out

3. Settings from a file, one override:
   bindem run design.tsv --config settings.txt --rounds 5

"###,
        )
        .arg(
            Arg::new("seq")
                .long("seq")
                .num_args(1)
                .help("Genome FASTA; required for motif scanning"),
        );
    super::config_args(super::input_args(cmd))
}

// command implementation
pub fn execute(args: &ArgMatches) -> anyhow::Result<()> {
    //----------------------------
    // Args
    //----------------------------
    let mut config = Config::from_args(args)?;
    let motif_specs = ArgSource::new(args)?.many("motif");
    let opt_seq = args.get_one::<String>("seq");
    if config.find_motifs && opt_seq.is_none() {
        warn!("--motif given without --seq; motif scanning is disabled");
        config = Config {
            find_motifs: false,
            ..config
        };
    }
    let config = config;

    rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads)
        .build_global()?;

    //----------------------------
    // Inputs
    //----------------------------
    info!("==> Loading experiment");
    let experiment = super::load_experiment(args)?;
    for (r, rep) in experiment.replicates.iter().enumerate() {
        info!(
            "{}: {} reads, control {}",
            experiment.replicate_label(r),
            rep.signal.total(),
            rep.control
                .as_ref()
                .map(|c| c.total().to_string())
                .unwrap_or_else(|| "none".to_string())
        );
    }
    let seed_model = super::load_model(args)?;

    let names: Vec<String> = experiment.conditions.iter().map(|c| c.name.clone()).collect();
    let (scanner, motifs) = match (config.find_motifs, opt_seq) {
        (true, Some(seq)) => (
            Some(FastaMotifScanner::from_fasta(seq)?),
            super::load_motifs(&motif_specs, &names)?,
        ),
        _ => (None, vec![]),
    };

    let layout = OutputLayout::new(&config.outdir, &config.out_base);
    layout.prepare()?;

    //----------------------------
    // Potential regions
    //----------------------------
    info!("==> Potential regions");
    let regions =
        PotentialRegionFilter::new(&config, &experiment, seed_model.width()).execute()?;
    if regions.is_empty() {
        anyhow::bail!("No potential regions found; nothing to refine");
    }
    info!("{} potential regions", regions.len());
    write_regions(&layout.potential_regions().to_string_lossy(), &regions)?;

    //----------------------------
    // Refinement
    //----------------------------
    let mut engine = MixtureEngine::new(&config, &experiment, regions);
    if let Some(scanner) = scanner.as_ref() {
        engine = engine.with_motifs(scanner, motifs);
    }
    let ledger = BindingModelLedger::new(vec![seed_model; experiment.replicates.len()]);
    let state = engine.initial_state(&ledger);

    let n_rep = experiment.replicates.len();
    let labels = (0..n_rep).map(|r| experiment.replicate_label(r)).collect();
    let tags = (0..n_rep)
        .map(|r| OutputLayout::replicate_tag(&experiment, r))
        .collect();
    let plotter = SvgPlotter::default();

    let outcome = RefinementController::new(&config, &mut engine, ledger, state, labels)
        .with_diagnostics(Diagnostics {
            layout: &layout,
            plotter: &plotter,
            tags,
        })
        .run()?;

    //----------------------------
    // Post-processing
    //----------------------------
    let significance = EnrichmentSignificance::new(
        config.min_fold,
        experiment.mappable_len(config.mappability),
        outcome.ledger.max_width(),
    );
    let normalizer = TmmNormalization::default();
    let collab = Collaborators {
        significance: &significance,
        normalizer: &normalizer,
        diff_tester: &ExactDiffTester,
        plotter: &plotter,
        scanner: scanner.as_ref().map(|s| s as &dyn MotifScanner),
    };
    let cmdline = std::env::args().collect::<Vec<_>>().join(" ");

    let mut events = outcome.events;
    let artifacts = PostProcessingPipeline::new(&config, &experiment, &layout, collab)
        .with_args(&cmdline)
        .run(&mut events, &outcome.state, &outcome.signal_fractions);

    if !artifacts.skipped.is_empty() {
        warn!("Skipped steps: {}", artifacts.skipped.join(", "));
    }
    info!(
        "{} files written to {}",
        artifacts.files.len(),
        layout.root().display()
    );

    Ok(())
}
