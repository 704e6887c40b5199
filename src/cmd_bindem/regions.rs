use bindem::libs::config::Config;
use bindem::libs::output::write_regions;
use bindem::libs::region::PotentialRegionFilter;
use clap::*;
use log::info;

pub fn make_subcommand() -> Command {
    let cmd = Command::new("regions")
        .about("Scan for potential binding regions")
        .after_help(
            r###"
Slides a window as wide as the read distribution in 100 bp steps and keeps
the windows whose pooled signal, in any condition, is unlikely under the
larger of the genome background and the scaled control. Kept windows are
merged; --exclude regions are dropped.

Output is one `chr:start-end` region per line.

Examples:
1. Scan with the default threshold:
   bindem regions design.tsv --sizes genome.sizes

2. Stricter threshold, into a file:
   bindem regions design.tsv --pr-log-conf -8 --outfile regions.txt

"###,
        )
        .arg(
            Arg::new("outfile")
                .long("outfile")
                .num_args(1)
                .default_value("stdout")
                .help("Output filename. [stdout] for screen"),
        );
    super::config_args(super::input_args(cmd))
}

// command implementation
pub fn execute(args: &ArgMatches) -> anyhow::Result<()> {
    //----------------------------
    // Args
    //----------------------------
    let config = Config::from_args(args)?;
    let outfile = args.get_one::<String>("outfile").unwrap();

    rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads)
        .build_global()?;

    //----------------------------
    // Ops
    //----------------------------
    let experiment = super::load_experiment(args)?;
    let model = super::load_model(args)?;
    let regions = PotentialRegionFilter::new(&config, &experiment, model.width()).execute()?;
    info!("{} potential regions", regions.len());

    //----------------------------
    // Output
    //----------------------------
    write_regions(outfile, &regions)?;

    Ok(())
}
