use crate::libs::config::Config;
use crate::libs::design::Experiment;
use crate::libs::engine::ModelState;
use crate::libs::event::{count_diff, count_in_condition, BindingEvent};
use crate::libs::io::write_file;
use crate::libs::output::{HistoKind, OutputLayout};
use std::path::{Path, PathBuf};

const STYLE: &str = "table, th, td {border-color: #600; border-style: solid;} \
table {border-width: 0 0 1px 1px; border-spacing: 0; border-collapse: collapse;} \
th, td {margin: 0; padding: 4px; border-width: 1px 1px 0 0;}";

/// What the report summarises.
pub struct ReportData<'a> {
    pub config: &'a Config,
    pub layout: &'a OutputLayout,
    pub experiment: &'a Experiment,
    pub events: &'a [BindingEvent],
    pub state: &'a ModelState,
    pub signal_fractions: &'a [f64],
    pub diff_ran: bool,
    /// Command line, shown verbatim
    pub args: String,
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&#39;")
}

/// A link to `path`, or `missing` when the file was never written.
fn link(layout: &OutputLayout, path: &Path, text: &str, missing: &str) -> String {
    if path.exists() {
        format!("<a href='{}'>{}</a>", layout.relative(path), escape(text))
    } else {
        missing.to_string()
    }
}

fn image(layout: &OutputLayout, path: &Path, height: u32) -> String {
    if path.exists() {
        let rel = layout.relative(path);
        format!("<a href='{}'><img src='{}' height='{}'></a>", rel, rel, height)
    } else {
        "NA".to_string()
    }
}

/// Header row followed by a condition-by-condition matrix.
fn pair_matrix(exp: &Experiment, mut cell: impl FnMut(usize, usize) -> String) -> String {
    let mut out = String::from("\t<table>\n\t\t<tr><th>Diff</th>");
    for cond in &exp.conditions {
        out += &format!("<th>{}</th>", escape(&cond.name));
    }
    out += "</tr>\n";
    for (a, cond) in exp.conditions.iter().enumerate() {
        out += &format!("\t\t<tr><td>{}</td>", escape(&cond.name));
        for b in 0..exp.num_conditions() {
            let content = if a == b { "-".to_string() } else { cell(a, b) };
            out += &format!("<td>{}</td>", content);
        }
        out += "</tr>\n";
    }
    out += "\t</table>\n";
    out
}

/// Replicate against replicate scatterplots, one row per condition.
fn replicate_plots(exp: &Experiment, layout: &OutputLayout) -> String {
    let mut out = String::from("\t<h2>Replicate scatterplots</h2>\n\t<table>\n");
    for cond in &exp.conditions {
        let mut row = String::new();
        for (i, &ra) in cond.replicates.iter().enumerate() {
            for &rb in &cond.replicates[i + 1..] {
                let path = layout.replicate_pair_image(
                    &cond.name,
                    &exp.replicates[ra].name,
                    &exp.replicates[rb].name,
                );
                row += &format!("<td>{}</td>", image(layout, &path, 200));
            }
        }
        if !row.is_empty() {
            out += &format!("\t\t<tr><td>{}</td>{}</tr>\n", escape(&cond.name), row);
        }
    }
    out += "\t</table>\n";
    out
}

pub fn render(d: &ReportData) -> String {
    let exp = d.experiment;
    let layout = d.layout;
    let config = d.config;
    let base = escape(layout.base());
    let mut out = String::new();

    out += &format!(
        "<html>\n\t<head><title>bindem results ({})</title></head>\n\t<style type='text/css'>{}</style>\n\t<body>\n\t<h1>bindem results ({})</h1>\n",
        base, STYLE, base
    );
    out += &format!(
        "\t<p>bindem version {} run completed on: {} with arguments:\n{}\n</p>\n",
        crate::VERSION,
        chrono::Local::now().format("%Y/%m/%d %H:%M:%S"),
        escape(&d.args)
    );

    // Binding events
    out += "\t<h2>Binding events</h2>\n\t<table>\n\t\t<tr><th>Condition</th><th>Events</th><th>File</th>";
    if config.find_motifs {
        out += "<th>Positional Prior Motif</th><th>Motif Relative Offset</th>";
    }
    out += "</tr>\n";
    for (c, cond) in exp.conditions.iter().enumerate() {
        let path = layout.events_file(&cond.name, config.events_txt);
        let name = layout.relative(&path);
        out += &format!(
            "\t\t<tr><td>{}</td><td>{}</td><td>{}</td>",
            escape(&cond.name),
            count_in_condition(d.events, c, config.q_min),
            link(layout, &path, &name, "NA")
        );
        if config.find_motifs {
            match d.state.motifs.get(c).and_then(|m| m.as_ref()) {
                Some(prior) => {
                    out += &format!(
                        "<td>{} ({})</td><td>{}</td>",
                        escape(&prior.matrix.name),
                        prior.matrix.consensus(),
                        prior.offset
                    );
                }
                None => out += "<td>No motif found</td><td>NA</td>",
            }
        }
        out += "</tr>\n";
    }
    out += "\t</table>\n";

    // Input data
    out += "\t<h2>Input data</h2>\n\t<table>\n\t\t<tr><th>Replicate</th><th>ReadCount</th><th>CtrlScaling</th><th>SignalFraction</th><th>ReadDistributionModel</th></tr>\n";
    for (r, rep) in exp.replicates.iter().enumerate() {
        let scaling = if rep.has_control() {
            format!("{:.3}", rep.control_scaling)
        } else {
            "NA".to_string()
        };
        let fraction = d
            .signal_fractions
            .get(r)
            .map(|f| format!("{:.3}", f))
            .unwrap_or_else(|| "NA".to_string());
        let img = layout.model_history_image(&OutputLayout::replicate_tag(exp, r));
        out += &format!(
            "\t\t<tr><td>{} {}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            escape(&exp.conditions[rep.condition].name),
            escape(&rep.name),
            rep.signal.total(),
            scaling,
            fraction,
            image(layout, &img, 300)
        );
    }
    out += "\t</table>\n";

    if d.diff_ran {
        out += "\t<h2>Differentially enriched events</h2>\n\t<p>Counts of events significantly enriched in the row condition with respect to the column condition.</p>\n";
        out += &pair_matrix(exp, |a, b| {
            let path = layout.diff_events_file(
                &exp.conditions[a].name,
                &exp.conditions[b].name,
                config.events_txt,
            );
            let n = count_diff(d.events, a, b, config.q_min, config.diff_p).to_string();
            link(layout, &path, &n, &n)
        });
        for (title, kind) in [
            ("Differential enrichment scatterplots", "XY"),
            ("Differential enrichment MA plots", "MA"),
        ] {
            out += &format!("\t<h2>{}</h2>\n", title);
            out += &pair_matrix(exp, |a, b| {
                let path = layout.pair_image(&exp.conditions[a].name, &exp.conditions[b].name, kind);
                image(layout, &path, 200)
            });
        }
        out += &replicate_plots(exp, layout);
    }

    // Miscellaneous files
    out += "\t<h2>Miscellaneous files</h2>\n";
    let mut misc: Vec<(PathBuf, &str)> = vec![];
    if config.find_motifs {
        misc.push((layout.motifs_file(config.events_txt), "Positional prior motifs"));
    }
    misc.push((
        layout.counts_file(),
        "Replicate read counts per event",
    ));
    misc.push((
        layout.histo_file(HistoKind::IntraCondition),
        "Peak-peak distance histograms (same condition)",
    ));
    if exp.num_conditions() > 1 {
        misc.push((
            layout.histo_file(HistoKind::InterCondition),
            "Peak-peak distance histograms (between conditions)",
        ));
    }
    if config.find_motifs {
        misc.push((
            layout.histo_file(HistoKind::PeaksToMotifs),
            "Peak-motif distance histograms",
        ));
    }
    for (path, text) in misc {
        if path.exists() {
            out += &format!("\t<p>{}</p>\n", link(layout, &path, text, ""));
        }
    }

    out += "\t</body>\n</html>\n";
    out
}

pub fn write_report(d: &ReportData) -> anyhow::Result<PathBuf> {
    let path = d.layout.report_file();
    write_file(&path, &render(d))?;
    Ok(path)
}
