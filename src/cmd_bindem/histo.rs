use bindem::libs::event::BindingEvent;
use bindem::libs::io::{create_writer, open_reader};
use bindem::libs::motif::{FastaMotifScanner, WeightMatrix};
use bindem::libs::proximity::{render_sections, ProximityHistogram};
use bindem::libs::region::{Point, Region};
use clap::*;
use log::{info, warn};
use std::io::{BufRead, Write};
use std::path::Path;

pub fn make_subcommand() -> Command {
    Command::new("histo")
        .about("Proximity histograms from events files")
        .after_help(
            r###"
Each input is an events file, optionally prefixed with its condition name
as `cond=path`; otherwise the file stem names the condition. Only the
first column (`chr:pos`) is read, and every listed event is used.

Histograms, each with window/5 bins over [0, window):
* nearest other event of the same condition
* nearest event of each other condition (2+ inputs)
* nearest motif hit scoring at least 0.6 x max (--seq and --motif)

Examples:
1. Two conditions:
   bindem histo dex=out_dex.events etoh=out_etoh.events

2. Distances to a motif, wider window:
   bindem histo out_dex.events --seq genome.fa --motif gr.txt --window 1000

"###,
        )
        .arg(
            Arg::new("infiles")
                .required(true)
                .num_args(1..)
                .index(1)
                .help("Events files, as `cond=path` or `path`"),
        )
        .arg(
            Arg::new("window")
                .long("window")
                .num_args(1)
                .default_value("400")
                .value_parser(value_parser!(i64))
                .help("Histogram window"),
        )
        .arg(
            Arg::new("seq")
                .long("seq")
                .num_args(1)
                .help("Genome FASTA, for peak-to-motif distances"),
        )
        .arg(
            Arg::new("motif")
                .long("motif")
                .num_args(1)
                .action(ArgAction::Append)
                .help("Frequency matrix, as `condition=file` or a bare file for all conditions"),
        )
        .arg(
            Arg::new("outfile")
                .long("outfile")
                .short('o')
                .num_args(1)
                .default_value("stdout")
                .help("Output filename. [stdout] for screen"),
        )
}

/// `cond=path`, or a path whose stem names the condition.
fn split_input(spec: &str) -> (String, String) {
    match spec.split_once('=') {
        Some((cond, path)) => (cond.to_string(), path.to_string()),
        None => {
            let stem = Path::new(spec)
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| spec.to_string());
            (stem, spec.to_string())
        }
    }
}

/// Events of one file, found only in `cond`. Regions reach just past
/// `window` on both sides so every event is scanned for motifs.
fn read_events(
    path: &str,
    cond: usize,
    num_conditions: usize,
    window: i64,
) -> anyhow::Result<Vec<BindingEvent>> {
    let mut events = vec![];
    for line in open_reader(path)?.lines() {
        let line = line?;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let field = line.split('\t').next().unwrap_or_default();
        let point: Point = field.parse()?;
        let region = Region::new(&point.chrom, point.pos - window - 1, point.pos + window + 1);

        let mut found = vec![false; num_conditions];
        found[cond] = true;
        let mut event = BindingEvent::new(point, Some(region), vec![], vec![], found);
        event.conds[cond].q = 0.0;
        events.push(event);
    }
    Ok(events)
}

// command implementation
pub fn execute(args: &ArgMatches) -> anyhow::Result<()> {
    //----------------------------
    // Args
    //----------------------------
    let inputs: Vec<(String, String)> = args
        .get_many::<String>("infiles")
        .unwrap()
        .map(|s| split_input(s))
        .collect();
    let window = *args.get_one::<i64>("window").unwrap();
    if window < 5 {
        anyhow::bail!("--window must be at least 5");
    }
    let outfile = args.get_one::<String>("outfile").unwrap();
    let motif_specs: Vec<String> = args
        .get_many::<String>("motif")
        .map(|v| v.cloned().collect())
        .unwrap_or_default();

    //----------------------------
    // Events
    //----------------------------
    let names: Vec<String> = inputs.iter().map(|(n, _)| n.clone()).collect();
    let mut events = vec![];
    for (c, (name, path)) in inputs.iter().enumerate() {
        let loaded = read_events(path, c, names.len(), window)?;
        info!("{}: {} events", name, loaded.len());
        events.extend(loaded);
    }
    let prox = ProximityHistogram::new(names.clone(), &events, 0.0);

    //----------------------------
    // Output
    //----------------------------
    let mut writer = create_writer(outfile)?;
    let intra = prox.intra_condition_distances(window);
    write!(
        writer,
        "{}",
        render_sections("Peaks to other peaks in same condition distance histograms", &intra)
    )?;

    if names.len() > 1 {
        let inter = prox.inter_condition_distances(window);
        write!(
            writer,
            "{}",
            render_sections("Peaks to peaks in other conditions distance histograms", &inter)
        )?;
    }

    match args.get_one::<String>("seq") {
        Some(seq) if !motif_specs.is_empty() => {
            let scanner = FastaMotifScanner::from_fasta(seq)?;
            let motifs = super::load_motifs(&motif_specs, &names)?;
            let refs: Vec<Option<&WeightMatrix>> = motifs.iter().map(|m| m.as_ref()).collect();
            let sections = prox.peak_to_motif_all(window, &scanner, &refs)?;
            write!(
                writer,
                "{}",
                render_sections("Peaks to closest motifs distance histograms", &sections)
            )?;
        }
        Some(_) => warn!("--seq given without --motif; no peak-to-motif histograms"),
        None if !motif_specs.is_empty() => {
            warn!("--motif given without --seq; no peak-to-motif histograms")
        }
        None => {}
    }
    writer.flush()?;

    Ok(())
}
