extern crate clap;
use clap::*;

mod cmd_bindem;

fn main() -> anyhow::Result<()> {
    let app = Command::new("bindem")
        .version(crate_version!())
        .author(crate_authors!())
        .about("`bindem` - Binding event detection with iterative EM model refinement")
        .propagate_version(true)
        .arg_required_else_help(true)
        .color(ColorChoice::Auto)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Log per-round details (debug level)"),
        )
        .subcommand(cmd_bindem::run::make_subcommand())
        .subcommand(cmd_bindem::regions::make_subcommand())
        .subcommand(cmd_bindem::histo::make_subcommand())
        .after_help(
            r###"Subcommands:

* run     - Detect binding events: potential regions, EM refinement, post-processing
* regions - Scan for potential regions only
* histo   - Proximity histograms from existing events files

Logging goes to stderr; set RUST_LOG to override the level.

"###,
        );

    let matches = app.get_matches();

    let level = if matches.get_flag("verbose") {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();

    match matches.subcommand() {
        Some(("run", sub_matches)) => cmd_bindem::run::execute(sub_matches),
        Some(("regions", sub_matches)) => cmd_bindem::regions::execute(sub_matches),
        Some(("histo", sub_matches)) => cmd_bindem::histo::execute(sub_matches),
        _ => unreachable!(),
    }?;

    Ok(())
}
