use crate::libs::design::Experiment;
use crate::libs::engine::ModelState;
use crate::libs::event::BindingEvent;
use crate::libs::io::{create_writer, write_file};
use crate::libs::region::Region;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Where every artifact of a run lives.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
    base: String,
}

/// The three proximity histogram files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoKind {
    PeaksToMotifs,
    IntraCondition,
    InterCondition,
}

impl OutputLayout {
    pub fn new(root: &Path, base: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            base: base.to_string(),
        }
    }

    /// Creates the output directory and its `intermediate-results/` and
    /// `images/` subdirectories.
    pub fn prepare(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(self.intermediate_dir())?;
        std::fs::create_dir_all(self.images_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn intermediate_dir(&self) -> PathBuf {
        self.root.join("intermediate-results")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    /// `cond-rep`, safe for file names
    pub fn replicate_tag(exp: &Experiment, r: usize) -> String {
        let rep = &exp.replicates[r];
        format!("{}-{}", exp.conditions[rep.condition].name, rep.name)
    }

    pub fn read_distrib(&self, round: usize, tag: &str) -> PathBuf {
        self.intermediate_dir()
            .join(format!("{}_t{}_ReadDistrib_{}.txt", self.base, round, tag))
    }

    pub fn model_history_image(&self, tag: &str) -> PathBuf {
        self.images_dir()
            .join(format!("{}_{}_Read_Distributions.svg", self.base, tag))
    }

    pub fn potential_regions(&self) -> PathBuf {
        self.intermediate_dir()
            .join(format!("{}.potential.regions", self.base))
    }

    pub fn counts_file(&self) -> PathBuf {
        self.root.join(format!("{}.replicates.counts", self.base))
    }

    fn with_txt(name: String, txt: bool) -> String {
        if txt {
            format!("{}.txt", name)
        } else {
            name
        }
    }

    pub fn events_file(&self, cond: &str, txt: bool) -> PathBuf {
        self.root
            .join(Self::with_txt(format!("{}_{}.events", self.base, cond), txt))
    }

    pub fn diff_events_file(&self, a: &str, b: &str, txt: bool) -> PathBuf {
        self.root.join(Self::with_txt(
            format!("{}_{}_gt_{}.diff.events", self.base, a, b),
            txt,
        ))
    }

    pub fn motifs_file(&self, txt: bool) -> PathBuf {
        self.root
            .join(Self::with_txt(format!("{}.motifs", self.base), txt))
    }

    pub fn histo_file(&self, kind: HistoKind) -> PathBuf {
        let suffix = match kind {
            HistoKind::PeaksToMotifs => "peaks2motifs",
            HistoKind::IntraCondition => "intraCondPeakDistances",
            HistoKind::InterCondition => "interCondPeakDistances",
        };
        self.intermediate_dir()
            .join(format!("{}.{}.histo.txt", self.base, suffix))
    }

    /// `kind` is `XY` or `MA`.
    pub fn pair_image(&self, a: &str, b: &str, kind: &str) -> PathBuf {
        self.images_dir()
            .join(format!("{}_{}_vs_{}.{}.svg", self.base, a, b, kind))
    }

    /// Two replicates of one condition against each other.
    pub fn replicate_pair_image(&self, cond: &str, rep_a: &str, rep_b: &str) -> PathBuf {
        self.images_dir().join(format!(
            "{}_{}_{}_vs_{}.XY.svg",
            self.base, cond, rep_a, rep_b
        ))
    }

    pub fn report_file(&self) -> PathBuf {
        self.root.join(format!("bindem_{}_results.html", self.base))
    }

    /// `path` relative to the output root, for links in the report.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

fn fmt_sci(v: f64) -> String {
    format!("{:.3e}", v)
}

/// Writes the events passing `q_thres` in `cond`.
///
/// Every condition gets signal, control, fold and Q columns; differential
/// columns against each other condition follow when `with_diff` is set.
pub fn write_events(
    path: &Path,
    exp: &Experiment,
    events: &[BindingEvent],
    cond: usize,
    q_thres: f64,
    with_diff: bool,
) -> anyhow::Result<usize> {
    let mut writer = create_writer(&path.to_string_lossy())?;

    let mut header = vec!["#Point".to_string()];
    for c in &exp.conditions {
        header.push(format!("{}_Sig", c.name));
        header.push(format!("{}_Ctrl", c.name));
        header.push(format!("{}_log2Fold", c.name));
        header.push(format!("{}_Q", c.name));
    }
    if with_diff {
        for (o, other) in exp.conditions.iter().enumerate() {
            if o != cond {
                let name = &exp.conditions[cond].name;
                header.push(format!("{}_vs_{}_log2Fold", name, other.name));
                header.push(format!("{}_vs_{}_P", name, other.name));
            }
        }
    }
    writeln!(writer, "{}", header.join("\t"))?;

    let mut count = 0;
    for event in events.iter().filter(|e| e.passes(cond, q_thres)) {
        let mut fields = vec![event.point().to_string()];
        for call in &event.conds {
            fields.push(format!("{:.1}", call.signal));
            fields.push(format!("{:.1}", call.control));
            fields.push(format!("{:.3}", call.fold.log2()));
            fields.push(fmt_sci(call.q));
        }
        if with_diff {
            for (o, diff) in event.conds[cond].diff.iter().enumerate() {
                if o == cond {
                    continue;
                }
                match diff {
                    Some(d) => {
                        fields.push(format!("{:.3}", d.log2_fold));
                        fields.push(fmt_sci(d.p));
                    }
                    None => {
                        fields.push("NA".to_string());
                        fields.push("NA".to_string());
                    }
                }
            }
        }
        writeln!(writer, "{}", fields.join("\t"))?;
        count += 1;
    }
    writer.flush()?;
    Ok(count)
}

/// Events significantly stronger in `a` than in `b`.
pub fn write_diff_events(
    path: &Path,
    events: &[BindingEvent],
    a: usize,
    b: usize,
    q_thres: f64,
    diff_p: f64,
) -> anyhow::Result<usize> {
    let mut writer = create_writer(&path.to_string_lossy())?;
    writeln!(writer, "#Point\tlog2Fold\tP\tQ")?;

    let mut count = 0;
    for event in events
        .iter()
        .filter(|e| e.is_diff_enriched(a, b, q_thres, diff_p))
    {
        if let Some(d) = event.conds[a].diff[b] {
            writeln!(
                writer,
                "{}\t{:.3}\t{}\t{}",
                event.point(),
                d.log2_fold,
                fmt_sci(d.p),
                fmt_sci(event.q_value(a))
            )?;
            count += 1;
        }
    }
    writer.flush()?;
    Ok(count)
}

/// Each condition's motif with its offset, then the matrix listing.
pub fn write_motifs(path: &Path, exp: &Experiment, state: &ModelState) -> anyhow::Result<()> {
    let mut out = String::new();
    for (c, cond) in exp.conditions.iter().enumerate() {
        match state.motifs.get(c).and_then(|m| m.as_ref()) {
            Some(prior) => {
                out += &format!(
                    "#{}\t{}\t{}\toffset={}\n",
                    cond.name,
                    prior.matrix.name,
                    prior.matrix.consensus(),
                    prior.offset
                );
                out += &prior.matrix.to_listing();
            }
            None => out += &format!("#{}\tNone\n", cond.name),
        }
    }
    write_file(path, &out)
}

pub fn write_regions(output: &str, regions: &[Region]) -> anyhow::Result<()> {
    let mut writer = create_writer(output)?;
    for region in regions {
        writeln!(writer, "{}", region)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::design::{ReadHits, ReplicateSpec, Strand};
    use crate::libs::event::DiffCall;
    use crate::libs::region::Point;

    fn two_conditions() -> Experiment {
        let spec = |cond: &str| ReplicateSpec {
            condition: cond.to_string(),
            name: "rep1".to_string(),
            signal: ReadHits::from_hits(vec![("chr1", 10, Strand::Plus)]),
            control: None,
        };
        Experiment::new(None, vec![spec("dex"), spec("etoh")]).unwrap()
    }

    #[test]
    fn test_layout_names() {
        let layout = OutputLayout::new(Path::new("out/run1"), "run1");
        assert_eq!(
            layout.events_file("dex", true),
            PathBuf::from("out/run1/run1_dex.events.txt")
        );
        assert_eq!(
            layout.diff_events_file("dex", "etoh", false),
            PathBuf::from("out/run1/run1_dex_gt_etoh.diff.events")
        );
        assert_eq!(
            layout.relative(&layout.histo_file(HistoKind::IntraCondition)),
            "intermediate-results/run1.intraCondPeakDistances.histo.txt"
        );
        assert_eq!(
            layout.relative(&layout.read_distrib(2, "dex-rep1")),
            "intermediate-results/run1_t2_ReadDistrib_dex-rep1.txt"
        );
        assert_eq!(
            layout.relative(&layout.replicate_pair_image("dex", "rep1", "rep2")),
            "images/run1_dex_rep1_vs_rep2.XY.svg"
        );
        assert_eq!(
            OutputLayout::replicate_tag(&two_conditions(), 1),
            "etoh-rep1"
        );
    }

    #[test]
    fn test_write_events_gated() {
        let exp = two_conditions();
        let mut strong = BindingEvent::new(
            Point::new("chr1", 100),
            None,
            vec![20.0, 5.0],
            vec![0.0, 0.0],
            vec![true, true],
        );
        strong.conds[0].q = 1e-5;
        strong.conds[0].fold = 4.0;
        strong.conds[0].diff[1] = Some(DiffCall {
            log2_fold: 2.0,
            p: 1e-4,
        });
        let weak = BindingEvent::new(
            Point::new("chr1", 900),
            None,
            vec![2.0, 2.0],
            vec![0.0, 0.0],
            vec![true, true],
        );
        let events = vec![strong, weak];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dex.events");
        let n = write_events(&path, &exp, &events, 0, 0.001, true).unwrap();
        assert_eq!(n, 1);
        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("#Point\tdex_Sig"));
        assert!(lines[0].ends_with("dex_vs_etoh_log2Fold\tdex_vs_etoh_P"));
        assert!(lines[1].starts_with("chr1:100\t"));

        let path = dir.path().join("diff.events");
        assert_eq!(write_diff_events(&path, &events, 0, 1, 0.001, 0.01).unwrap(), 1);
        assert_eq!(write_diff_events(&path, &events, 1, 0, 0.001, 0.01).unwrap(), 0);
    }
}
