use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

/// Reads piled up around each centre, on both strands, over a sparse
/// uniform background.
fn bed(dir: &Path, name: &str, centres: &[i64]) -> PathBuf {
    let mut body = String::new();
    for &c in centres {
        for i in 0..30 {
            let plus = c - 80 + i % 10;
            body += &format!("chr1\t{}\t{}\tr\t0\t+\n", plus, plus + 36);
            let minus = c + 80 - i % 10;
            body += &format!("chr1\t{}\t{}\tr\t0\t-\n", minus - 36, minus);
        }
    }
    for x in (500..100_000).step_by(1000) {
        body += &format!("chr1\t{}\t{}\tr\t0\t+\n", x, x + 36);
    }
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path
}

fn setup(dir: &Path, conditions: &[(&str, &[i64])]) -> (PathBuf, PathBuf) {
    let mut design = String::new();
    for (cond, centres) in conditions {
        for rep in ["rep1", "rep2"] {
            let file = bed(dir, &format!("{}_{}.bed", cond, rep), centres);
            design += &format!("{}\tsignal\t{}\t{}\n", file.display(), cond, rep);
        }
    }
    let design_file = dir.join("design.tsv");
    fs::write(&design_file, design).unwrap();
    let sizes = dir.join("genome.sizes");
    fs::write(&sizes, "chr1\t100000\n").unwrap();
    (design_file, sizes)
}

#[test]
fn command_run_one_condition() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (design, sizes) = setup(dir.path(), &[("dex", &[20_000, 60_000])]);
    let out = dir.path().join("out");

    let mut cmd = cargo_bin_cmd!("bindem");
    cmd.arg("run")
        .arg(&design)
        .arg("--sizes")
        .arg(&sizes)
        .arg("-o")
        .arg(&out)
        .assert()
        .success();

    let events = fs::read_to_string(out.join("out_dex.events"))?;
    assert!(events.starts_with("#Point\tdex_Sig\tdex_Ctrl\tdex_log2Fold\tdex_Q\n"));
    let points: Vec<i64> = events
        .lines()
        .skip(1)
        .map(|l| l.split('\t').next().unwrap())
        .map(|p| p.split(':').nth(1).unwrap().parse().unwrap())
        .collect();
    assert!(points.iter().any(|p| (p - 20_000).abs() < 100));
    assert!(points.iter().any(|p| (p - 60_000).abs() < 100));

    assert!(out.join("out.replicates.counts").is_file());
    assert!(out.join("bindem_out_results.html").is_file());
    assert!(out
        .join("intermediate-results/out.potential.regions")
        .is_file());
    assert!(out
        .join("intermediate-results/out.intraCondPeakDistances.histo.txt")
        .is_file());
    assert!(out
        .join("images/out_dex-rep1_Read_Distributions.svg")
        .is_file());
    // one condition: no differential artifacts
    assert!(!out.join("intermediate-results/out.interCondPeakDistances.histo.txt").exists());
    for entry in fs::read_dir(&out)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        assert!(!name.ends_with(".diff.events"), "{}", name);
    }

    Ok(())
}

#[test]
fn command_run_two_conditions() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (design, sizes) = setup(
        dir.path(),
        &[("dex", &[20_000, 60_000]), ("etoh", &[20_000])],
    );
    let out = dir.path().join("gr");

    let mut cmd = cargo_bin_cmd!("bindem");
    cmd.arg("run")
        .arg(&design)
        .arg("--sizes")
        .arg(&sizes)
        .arg("--rounds")
        .arg("1")
        .arg("-o")
        .arg(&out)
        .assert()
        .success();

    assert!(out.join("gr_dex.events").is_file());
    assert!(out.join("gr_etoh.events").is_file());
    assert!(out.join("gr_dex_gt_etoh.diff.events").is_file());
    assert!(out.join("gr_etoh_gt_dex.diff.events").is_file());
    assert!(out.join("images/gr_dex_vs_etoh.XY.svg").is_file());
    assert!(out.join("images/gr_dex_rep1_vs_rep2.XY.svg").is_file());
    assert!(out
        .join("intermediate-results/gr.interCondPeakDistances.histo.txt")
        .is_file());

    let report = fs::read_to_string(out.join("bindem_gr_results.html"))?;
    assert!(report.contains("Differentially enriched events"));

    Ok(())
}

#[test]
fn command_run_no_diff_tests() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (design, sizes) = setup(
        dir.path(),
        &[("dex", &[20_000]), ("etoh", &[20_000])],
    );
    let out = dir.path().join("nodiff");

    let mut cmd = cargo_bin_cmd!("bindem");
    cmd.arg("run")
        .arg(&design)
        .arg("--sizes")
        .arg(&sizes)
        .arg("--no-diff-tests")
        .arg("--events-txt")
        .arg("-o")
        .arg(&out)
        .assert()
        .success();

    assert!(out.join("nodiff_dex.events.txt").is_file());
    assert!(!out.join("nodiff_dex_gt_etoh.diff.events.txt").exists());

    Ok(())
}

#[test]
fn command_run_no_regions() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    // isolated reads never reach the threshold
    let mut body = String::new();
    for x in (1000..100_000).step_by(5000) {
        body += &format!("chr1\t{}\t{}\tr\t0\t+\n", x, x + 36);
    }
    let reads = dir.path().join("sparse.bed");
    fs::write(&reads, body)?;
    let design = dir.path().join("design.tsv");
    fs::write(&design, format!("{}\tsignal\tdex\trep1\n", reads.display()))?;
    let sizes = dir.path().join("genome.sizes");
    fs::write(&sizes, "chr1\t100000\n")?;
    let out = dir.path().join("empty");

    let mut cmd = cargo_bin_cmd!("bindem");
    cmd.arg("run")
        .arg(&design)
        .arg("--sizes")
        .arg(&sizes)
        .arg("-o")
        .arg(&out)
        .assert()
        .failure()
        .stderr(predicate::str::contains("No potential regions"));

    assert!(!out.join("empty_dex.events").exists());

    Ok(())
}

#[test]
fn command_run_config_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (design, sizes) = setup(dir.path(), &[("dex", &[20_000])]);
    let settings = dir.path().join("settings.txt");
    // rounds must not exceed min-rounds - 1
    fs::write(&settings, "# settings\n--min-rounds 4\nrounds 1\n")?;

    let mut cmd = cargo_bin_cmd!("bindem");
    cmd.arg("run")
        .arg(&design)
        .arg("--sizes")
        .arg(&sizes)
        .arg("--config")
        .arg(&settings)
        .arg("-o")
        .arg(dir.path().join("cfg"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("--min-rounds (4)"));

    // the command line wins over the file
    let mut cmd = cargo_bin_cmd!("bindem");
    cmd.arg("run")
        .arg(&design)
        .arg("--sizes")
        .arg(&sizes)
        .arg("--config")
        .arg(&settings)
        .arg("--min-rounds")
        .arg("1")
        .arg("-o")
        .arg(dir.path().join("cfg"))
        .assert()
        .success();

    Ok(())
}

#[test]
fn command_run_missing_design() -> anyhow::Result<()> {
    let mut cmd = cargo_bin_cmd!("bindem");
    cmd.arg("run")
        .arg("tests/no_such_design.tsv")
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));

    Ok(())
}
