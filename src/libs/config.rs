use crate::libs::io::open_reader;
use crate::libs::region::{read_regions, Region};
use clap::parser::ValueSource;
use clap::ArgMatches;
use indexmap::IndexMap;
use std::fmt::Display;
use std::io::BufRead;
use std::path::PathBuf;
use std::str::FromStr;

/// Initial spacing of binding components in a potential region
pub const INIT_COMPONENT_SPACING: i64 = 30;
/// Upper bound on EM iterations per region
pub const MAX_EM_ITER: usize = 2000;
/// Iterations of the final ML assignment
pub const ML_ITER: usize = 100;
/// Half window for re-optimising a component position
pub const EM_MU_UPDATE_WIN: i64 = 50;
/// Weight change below which EM counts as converged
pub const EM_CONVERGENCE: f64 = 1e-8;
/// Bounds on the initial noise component weight in a region
pub const NOISE_EMISSION_MIN: f64 = 0.01;
pub const NOISE_EMISSION_MAX: f64 = 0.95;
/// Components analysed when estimating motif offsets
pub const MOTIF_FINDING_TOPSEQS: usize = 500;
/// A motif hit scores at least this fraction of the matrix maximum
pub const MOTIF_MIN_SCORE_FRACTION: f64 = 0.6;

/// Run settings. Built once, then only read.
#[derive(Debug, Clone)]
pub struct Config {
    pub outdir: PathBuf,
    pub out_base: String,
    pub threads: usize,
    pub verbose: bool,

    // Model refinement
    pub max_rounds: usize,
    pub min_rounds: usize,
    pub update_models: bool,
    pub min_components_for_update: usize,
    /// Components need this many times alpha in reads to shape a model update
    pub min_component_read_factor: f64,
    pub smooth_models: bool,
    pub gauss_smooth: f64,
    pub include_joint_events: bool,
    /// Spacing of flanking components added around survivors after round 0
    pub flanking_spacing: i64,
    pub alpha_scale: f64,
    pub fixed_alpha: f64,
    pub update_alpha: bool,
    pub find_motifs: bool,

    // Potential regions
    pub pr_log_conf: f64,
    pub exclude: Vec<Region>,
    pub potential_regions: Option<String>,

    // Reporting events
    pub q_min: f64,
    pub min_fold: f64,
    pub run_diff_tests: bool,
    pub diff_p: f64,
    pub events_txt: bool,
    pub mappability: f64,
    pub histo_window: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            outdir: PathBuf::from("bindem_out"),
            out_base: "bindem_out".to_string(),
            threads: 1,
            verbose: false,
            max_rounds: 3,
            min_rounds: 0,
            update_models: true,
            min_components_for_update: 500,
            min_component_read_factor: 3.0,
            smooth_models: true,
            gauss_smooth: 2.0,
            include_joint_events: false,
            flanking_spacing: 20,
            alpha_scale: 1.0,
            fixed_alpha: 0.0,
            update_alpha: true,
            find_motifs: false,
            pr_log_conf: -6.0,
            exclude: vec![],
            potential_regions: None,
            q_min: 0.001,
            min_fold: 1.5,
            run_diff_tests: true,
            diff_p: 0.01,
            events_txt: false,
            mappability: 0.8,
            histo_window: 400,
        }
    }
}

impl Config {
    /// Resolves settings from the command line, then `--config`, then defaults.
    pub fn from_args(args: &ArgMatches) -> anyhow::Result<Self> {
        let src = ArgSource::new(args)?;

        let outdir = PathBuf::from(src.value::<String>("outdir")?);
        let out_base = outdir
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "bindem".to_string());

        let exclude = match src.opt_string("exclude") {
            Some(path) => read_regions(&path)?,
            None => vec![],
        };

        let fixed_alpha = src.value::<f64>("fixed_alpha")?;
        // A fixed alpha is only re-estimated when asked to
        let update_alpha = fixed_alpha <= 0.0 || src.flag("update_alpha")?;

        let config = Config {
            outdir,
            out_base,
            threads: src.value::<usize>("parallel")?.max(1),
            verbose: src.flag("verbose")?,
            max_rounds: src.value("rounds")?,
            min_rounds: src.value("min_rounds")?,
            update_models: !src.flag("no_model_update")?,
            min_components_for_update: src.value("min_model_update_events")?,
            smooth_models: !src.flag("no_model_smoothing")?,
            gauss_smooth: src.value("gauss_smooth")?,
            include_joint_events: src.flag("joint_in_model")?,
            alpha_scale: src.value("alpha_scale")?,
            fixed_alpha,
            update_alpha,
            find_motifs: !src.many("motif").is_empty(),
            pr_log_conf: src.value("pr_log_conf")?,
            exclude,
            potential_regions: src.opt_string("potential_regions"),
            q_min: src.value("q")?,
            min_fold: src.value("min_fold")?,
            run_diff_tests: !src.flag("no_diff_tests")?,
            diff_p: src.value("diff_p")?,
            events_txt: src.flag("events_txt")?,
            mappability: src.value("mappability")?,
            histo_window: src.value("histo_window")?,
            ..Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_rounds > self.max_rounds + 1 {
            anyhow::bail!(
                "--min-rounds ({}) cannot exceed --rounds + 1 ({})",
                self.min_rounds,
                self.max_rounds + 1
            );
        }
        if !(self.mappability > 0.0 && self.mappability <= 1.0) {
            anyhow::bail!("--mappability must be in (0, 1]");
        }
        if self.histo_window < 5 {
            anyhow::bail!("--histo-window must be at least 5");
        }
        Ok(())
    }
}

/// Reads a `name value` settings file. A bare `name` is a flag.
pub fn read_config_file(infile: &str) -> anyhow::Result<IndexMap<String, Option<String>>> {
    let reader = open_reader(infile)?;
    let mut entries = IndexMap::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut words = line.split_whitespace();
        let key = match words.next() {
            Some(k) => k.trim_start_matches("--").replace('_', "-"),
            None => continue,
        };
        let rest = words.collect::<Vec<_>>().join(" ");
        entries.insert(key, if rest.is_empty() { None } else { Some(rest) });
    }
    Ok(entries)
}

/// Layered lookup: explicit command line > config file > clap default.
pub struct ArgSource<'a> {
    args: &'a ArgMatches,
    file: IndexMap<String, Option<String>>,
}

impl<'a> ArgSource<'a> {
    pub fn new(args: &'a ArgMatches) -> anyhow::Result<Self> {
        let file = match args.try_get_one::<String>("config").ok().flatten() {
            Some(path) => read_config_file(path)?,
            None => IndexMap::new(),
        };
        Ok(Self { args, file })
    }

    fn key(id: &str) -> String {
        id.replace('_', "-")
    }

    fn from_command_line(&self, id: &str) -> bool {
        self.args.value_source(id) == Some(ValueSource::CommandLine)
    }

    pub fn value<T>(&self, id: &str) -> anyhow::Result<T>
    where
        T: FromStr + Clone + Send + Sync + 'static,
        T::Err: Display,
    {
        if !self.from_command_line(id) {
            if let Some(Some(raw)) = self.file.get(&Self::key(id)) {
                return raw
                    .parse::<T>()
                    .map_err(|e| anyhow::anyhow!("Invalid config value for {}: {} ({})", id, raw, e));
            }
        }
        self.args
            .get_one::<T>(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Missing value for --{}", Self::key(id)))
    }

    pub fn opt_string(&self, id: &str) -> Option<String> {
        if self.from_command_line(id) {
            return self.args.get_one::<String>(id).cloned();
        }
        match self.file.get(&Self::key(id)) {
            Some(Some(raw)) => Some(raw.clone()),
            _ => self.args.get_one::<String>(id).cloned(),
        }
    }

    pub fn many(&self, id: &str) -> Vec<String> {
        let mut values: Vec<String> = self
            .args
            .get_many::<String>(id)
            .map(|v| v.cloned().collect())
            .unwrap_or_default();
        if values.is_empty() {
            if let Some(Some(raw)) = self.file.get(&Self::key(id)) {
                values = raw.split_whitespace().map(|s| s.to_string()).collect();
            }
        }
        values
    }

    pub fn flag(&self, id: &str) -> anyhow::Result<bool> {
        if self.args.get_flag(id) {
            return Ok(true);
        }
        match self.file.get(&Self::key(id)) {
            None => Ok(false),
            Some(None) => Ok(true),
            Some(Some(raw)) => match raw.to_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(true),
                "false" | "no" | "0" => Ok(false),
                _ => anyhow::bail!("Invalid flag value for {}: {}", id, raw),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::{value_parser, Arg, ArgAction, Command};

    fn command() -> Command {
        Command::new("t")
            .arg(Arg::new("config").long("config").num_args(1))
            .arg(
                Arg::new("rounds")
                    .long("rounds")
                    .value_parser(value_parser!(usize))
                    .default_value("3"),
            )
            .arg(
                Arg::new("min_fold")
                    .long("min-fold")
                    .value_parser(value_parser!(f64))
                    .default_value("1.5"),
            )
            .arg(
                Arg::new("no_diff_tests")
                    .long("no-diff-tests")
                    .action(ArgAction::SetTrue),
            )
    }

    #[test]
    fn test_layered_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.txt");
        std::fs::write(&path, "# settings\n--rounds 7\nmin_fold 2.5\nno-diff-tests\n").unwrap();
        let path = path.to_str().unwrap();

        let args = command()
            .try_get_matches_from(["t", "--config", path, "--min-fold", "1.8"])
            .unwrap();
        let src = ArgSource::new(&args).unwrap();
        assert_eq!(src.value::<usize>("rounds").unwrap(), 7);
        assert_eq!(src.value::<f64>("min_fold").unwrap(), 1.8);
        assert!(src.flag("no_diff_tests").unwrap());

        let args = command().try_get_matches_from(["t"]).unwrap();
        let src = ArgSource::new(&args).unwrap();
        assert_eq!(src.value::<usize>("rounds").unwrap(), 3);
        assert!(!src.flag("no_diff_tests").unwrap());
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());
        config.min_rounds = 9;
        assert!(config.validate().is_err());
    }
}
