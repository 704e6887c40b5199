//! Subcommand modules for the `bindem` binary.

pub mod histo;
pub mod regions;
pub mod run;

use bindem::libs::design::Experiment;
use bindem::libs::model::BindingModel;
use bindem::libs::motif::WeightMatrix;
use bindem::libs::region::Genome;
use clap::*;
use std::path::Path;

/// Inputs shared by `run` and `regions`.
pub fn input_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("design")
            .required(true)
            .num_args(1)
            .index(1)
            .help("Design file: `path signal|control condition [replicate]` per line"),
    )
    .arg(
        Arg::new("sizes")
            .long("sizes")
            .num_args(1)
            .help("Chromosome sizes; inferred from the reads when omitted"),
    )
    .arg(
        Arg::new("model")
            .long("model")
            .num_args(1)
            .help("Initial read distribution, two columns: offset value"),
    )
}

/// Every setting `Config::from_args` reads.
pub fn config_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("config")
            .long("config")
            .num_args(1)
            .help("Settings file with `name value` lines; the command line wins"),
    )
    .arg(
        Arg::new("outdir")
            .long("outdir")
            .short('o')
            .num_args(1)
            .default_value("bindem_out")
            .help("Output directory; its name prefixes every file"),
    )
    .arg(
        Arg::new("parallel")
            .long("parallel")
            .short('p')
            .num_args(1)
            .default_value("1")
            .value_parser(value_parser!(usize))
            .help("Number of threads"),
    )
    .arg(
        Arg::new("rounds")
            .long("rounds")
            .num_args(1)
            .default_value("3")
            .value_parser(value_parser!(usize))
            .help("Maximum number of refinement rounds"),
    )
    .arg(
        Arg::new("min_rounds")
            .long("min-rounds")
            .num_args(1)
            .default_value("0")
            .value_parser(value_parser!(usize))
            .help("Minimum number of refinement rounds"),
    )
    .arg(
        Arg::new("no_model_update")
            .long("no-model-update")
            .action(ArgAction::SetTrue)
            .help("Keep the initial read distributions"),
    )
    .arg(
        Arg::new("min_model_update_events")
            .long("min-model-update-events")
            .num_args(1)
            .default_value("500")
            .value_parser(value_parser!(usize))
            .help("Strong events needed to re-estimate a read distribution"),
    )
    .arg(
        Arg::new("no_model_smoothing")
            .long("no-model-smoothing")
            .action(ArgAction::SetTrue)
            .help("Do not smooth re-estimated read distributions"),
    )
    .arg(
        Arg::new("gauss_smooth")
            .long("gauss-smooth")
            .num_args(1)
            .default_value("2")
            .value_parser(value_parser!(f64))
            .help("Gaussian smoothing sigma"),
    )
    .arg(
        Arg::new("joint_in_model")
            .long("joint-in-model")
            .action(ArgAction::SetTrue)
            .help("Let closely spaced events contribute to model updates"),
    )
    .arg(
        Arg::new("alpha_scale")
            .long("alpha-scale")
            .num_args(1)
            .default_value("1.0")
            .value_parser(value_parser!(f64))
            .help("Scale of the sparse prior weight"),
    )
    .arg(
        Arg::new("fixed_alpha")
            .long("fixed-alpha")
            .num_args(1)
            .default_value("0")
            .value_parser(value_parser!(f64))
            .help("Use this alpha instead of estimating it; 0 disables"),
    )
    .arg(
        Arg::new("update_alpha")
            .long("update-alpha")
            .action(ArgAction::SetTrue)
            .help("Re-estimate alpha every round even when fixed"),
    )
    .arg(
        Arg::new("motif")
            .long("motif")
            .num_args(1)
            .action(ArgAction::Append)
            .help("Frequency matrix, as `condition=file` or a bare file for all conditions"),
    )
    .arg(
        Arg::new("pr_log_conf")
            .long("pr-log-conf")
            .visible_alias("prlogconf")
            .num_args(1)
            .default_value("-6")
            .allow_negative_numbers(true)
            .value_parser(value_parser!(f64))
            .help("log10 Poisson threshold for potential regions"),
    )
    .arg(
        Arg::new("exclude")
            .long("exclude")
            .num_args(1)
            .help("Regions to leave out of the analysis"),
    )
    .arg(
        Arg::new("potential_regions")
            .long("potential-regions")
            .num_args(1)
            .help("Use these regions instead of scanning"),
    )
    .arg(
        Arg::new("q")
            .long("q")
            .num_args(1)
            .default_value("0.001")
            .value_parser(value_parser!(f64))
            .help("Q-value threshold for reported events"),
    )
    .arg(
        Arg::new("min_fold")
            .long("min-fold")
            .num_args(1)
            .default_value("1.5")
            .value_parser(value_parser!(f64))
            .help("Minimum fold over control"),
    )
    .arg(
        Arg::new("no_diff_tests")
            .long("no-diff-tests")
            .action(ArgAction::SetTrue)
            .help("Skip differential enrichment between conditions"),
    )
    .arg(
        Arg::new("diff_p")
            .long("diff-p")
            .num_args(1)
            .default_value("0.01")
            .value_parser(value_parser!(f64))
            .help("P-value threshold for differential enrichment"),
    )
    .arg(
        Arg::new("events_txt")
            .long("events-txt")
            .action(ArgAction::SetTrue)
            .help("Add a .txt suffix to events files"),
    )
    .arg(
        Arg::new("mappability")
            .long("mappability")
            .num_args(1)
            .default_value("0.8")
            .value_parser(value_parser!(f64))
            .help("Mappable fraction of the genome"),
    )
    .arg(
        Arg::new("histo_window")
            .long("histo-window")
            .num_args(1)
            .default_value("400")
            .value_parser(value_parser!(i64))
            .help("Window of the proximity histograms"),
    )
}

pub fn load_experiment(args: &ArgMatches) -> anyhow::Result<Experiment> {
    let design = args.get_one::<String>("design").unwrap();
    if !Path::new(design).is_file() {
        anyhow::bail!("Design file {} does not exist", design);
    }
    let genome = match args.get_one::<String>("sizes") {
        Some(sizes) => {
            if !Path::new(sizes).is_file() {
                anyhow::bail!("Sizes file {} does not exist", sizes);
            }
            Some(Genome::from_sizes(sizes))
        }
        None => None,
    };
    Ok(Experiment::from_design(design, genome)?)
}

pub fn load_model(args: &ArgMatches) -> anyhow::Result<BindingModel> {
    match args.get_one::<String>("model") {
        Some(file) => BindingModel::from_file(file),
        None => Ok(BindingModel::default_chipseq()),
    }
}

/// Resolves `--motif` values to one optional matrix per condition.
///
/// A bare file fills every condition not named explicitly.
pub fn load_motifs(specs: &[String], names: &[String]) -> anyhow::Result<Vec<Option<WeightMatrix>>> {
    let mut named = vec![None; names.len()];
    let mut fallback = None;
    for spec in specs {
        match spec.split_once('=') {
            Some((cond, file)) => {
                let c = names
                    .iter()
                    .position(|x| x == cond)
                    .ok_or_else(|| anyhow::anyhow!("--motif names unknown condition {}", cond))?;
                named[c] = Some(WeightMatrix::from_file(file)?);
            }
            None => fallback = Some(WeightMatrix::from_file(spec)?),
        }
    }
    Ok(named
        .into_iter()
        .map(|m| m.or_else(|| fallback.clone()))
        .collect())
}
