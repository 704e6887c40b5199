//! Diagnostic figures, written as SVG so no system fonts are needed.

use plotters::prelude::*;
use std::path::Path;

/// A named line of `(x, y)` points.
#[derive(Debug, Clone)]
pub struct Series {
    pub name: String,
    pub points: Vec<(f64, f64)>,
}

/// Writes image artifacts from in-memory series. Callers treat failures as
/// non-fatal.
pub trait Plotter {
    fn line_plot(
        &self,
        path: &Path,
        title: &str,
        x_desc: &str,
        y_desc: &str,
        series: &[Series],
    ) -> anyhow::Result<()>;

    /// Scatter of `points`, with `highlight` drawn on top in another colour.
    fn scatter_plot(
        &self,
        path: &Path,
        title: &str,
        x_desc: &str,
        y_desc: &str,
        points: &[(f64, f64)],
        highlight: &[(f64, f64)],
    ) -> anyhow::Result<()>;
}

pub struct SvgPlotter {
    size: (u32, u32),
}

impl Default for SvgPlotter {
    fn default() -> Self {
        Self { size: (800, 500) }
    }
}

/// Data range padded so a flat series still gets a usable axis.
fn bounds<'p>(points: impl Iterator<Item = &'p (f64, f64)>) -> ((f64, f64), (f64, f64)) {
    let (mut x0, mut x1, mut y0, mut y1) = (
        f64::INFINITY,
        f64::NEG_INFINITY,
        f64::INFINITY,
        f64::NEG_INFINITY,
    );
    for (x, y) in points.filter(|(x, y)| x.is_finite() && y.is_finite()) {
        x0 = x0.min(*x);
        x1 = x1.max(*x);
        y0 = y0.min(*y);
        y1 = y1.max(*y);
    }
    if x0 > x1 {
        return ((0.0, 1.0), (0.0, 1.0));
    }
    let pad = |lo: f64, hi: f64| {
        let d = if hi > lo { (hi - lo) * 0.05 } else { 1.0 };
        (lo - d, hi + d)
    };
    (pad(x0, x1), pad(y0, y1))
}

impl Plotter for SvgPlotter {
    fn line_plot(
        &self,
        path: &Path,
        title: &str,
        x_desc: &str,
        y_desc: &str,
        series: &[Series],
    ) -> anyhow::Result<()> {
        let root = SVGBackend::new(path, self.size).into_drawing_area();
        root.fill(&WHITE)?;

        let ((x0, x1), (y0, y1)) = bounds(series.iter().flat_map(|s| s.points.iter()));
        let mut chart = ChartBuilder::on(&root)
            .caption(title, ("sans-serif", 20))
            .margin(20)
            .x_label_area_size(40)
            .y_label_area_size(60)
            .build_cartesian_2d(x0..x1, y0..y1)?;
        chart
            .configure_mesh()
            .x_desc(x_desc)
            .y_desc(y_desc)
            .draw()?;

        for (i, s) in series.iter().enumerate() {
            let color = Palette99::pick(i).to_rgba();
            chart
                .draw_series(LineSeries::new(s.points.iter().copied(), color))?
                .label(s.name.as_str())
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
        }
        if series.len() > 1 {
            chart
                .configure_series_labels()
                .background_style(WHITE.mix(0.8))
                .border_style(BLACK)
                .draw()?;
        }

        root.present()?;
        Ok(())
    }

    fn scatter_plot(
        &self,
        path: &Path,
        title: &str,
        x_desc: &str,
        y_desc: &str,
        points: &[(f64, f64)],
        highlight: &[(f64, f64)],
    ) -> anyhow::Result<()> {
        let root = SVGBackend::new(path, self.size).into_drawing_area();
        root.fill(&WHITE)?;

        let ((x0, x1), (y0, y1)) = bounds(points.iter().chain(highlight.iter()));
        let mut chart = ChartBuilder::on(&root)
            .caption(title, ("sans-serif", 20))
            .margin(20)
            .x_label_area_size(40)
            .y_label_area_size(60)
            .build_cartesian_2d(x0..x1, y0..y1)?;
        chart
            .configure_mesh()
            .x_desc(x_desc)
            .y_desc(y_desc)
            .draw()?;

        let finite = |p: &&(f64, f64)| p.0.is_finite() && p.1.is_finite();
        chart.draw_series(
            points
                .iter()
                .filter(finite)
                .map(|&(x, y)| Circle::new((x, y), 2, BLUE.mix(0.5).filled())),
        )?;
        chart.draw_series(
            highlight
                .iter()
                .filter(finite)
                .map(|&(x, y)| Circle::new((x, y), 2, RED.filled())),
        )?;

        root.present()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        let pts = [(1.0, 2.0), (3.0, f64::NAN), (5.0, 4.0)];
        let ((x0, x1), (y0, y1)) = bounds(pts.iter());
        assert!(x0 < 1.0 && x1 > 5.0);
        assert!(y0 < 2.0 && y1 > 4.0);

        let ((x0, x1), _) = bounds([(2.0, 2.0)].iter());
        assert_eq!((x0, x1), (1.0, 3.0));

        assert_eq!(bounds([].iter()), ((0.0, 1.0), (0.0, 1.0)));
    }

    #[test]
    fn test_svg_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.svg");
        let plotter = SvgPlotter::default();
        plotter
            .line_plot(
                &path,
                "dex:rep1",
                "offset",
                "density",
                &[Series {
                    name: "t0".to_string(),
                    points: vec![(-10.0, 0.1), (0.0, 0.5), (10.0, 0.1)],
                }],
            )
            .unwrap();
        let svg = std::fs::read_to_string(&path).unwrap();
        assert!(svg.contains("<svg"));

        let path = dir.path().join("xy.svg");
        plotter
            .scatter_plot(&path, "A vs B", "A", "B", &[(1.0, 1.0), (2.0, 3.0)], &[(4.0, 1.0)])
            .unwrap();
        assert!(path.is_file());
    }
}
