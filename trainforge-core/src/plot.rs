//! Loss against learning rate, rendered to PNG for learning-rate search runs.

use crate::error::{ExecutorError, Result};
use plotters::prelude::*;
use std::path::Path;

const WIDTH: u32 = 800;
const HEIGHT: u32 = 600;
const CURVE: RGBColor = RGBColor(31, 119, 180);
const MARKER: RGBColor = RGBColor(214, 39, 40);

/// Options for [`render_lr_plot`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlotOptions {
    /// Points dropped from the start of the series.
    pub skip_start: usize,
    /// Points dropped from the end of the series.
    pub skip_end: usize,
    /// Log-scale the learning-rate axis.
    pub log_lr: bool,
    /// Learning rate to mark with a vertical line.
    pub suggested_lr: Option<f64>,
}

impl Default for PlotOptions {
    fn default() -> Self {
        Self {
            skip_start: 0,
            skip_end: 2,
            log_lr: true,
            suggested_lr: None,
        }
    }
}

fn plot_error(e: impl std::fmt::Display) -> ExecutorError {
    ExecutorError::plot(e.to_string())
}

fn bounds(values: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
    values
        .filter(|v| v.is_finite())
        .fold(None, |acc, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
        .map(|(lo, hi)| if lo == hi { (lo - 0.5, hi + 0.5) } else { (lo, hi) })
}

fn axis_x(lr: f64, options: &PlotOptions) -> f64 {
    if options.log_lr { lr.log10() } else { lr }
}

/// Finite `(x, loss)` points left after skipping, x log-scaled if requested.
fn curve_points(lrs: &[f64], losses: &[f64], options: &PlotOptions) -> Vec<(f64, f64)> {
    let n = lrs.len().min(losses.len());
    let end = n.saturating_sub(options.skip_end);
    let start = options.skip_start.min(end);
    (start..end)
        .map(|i| (axis_x(lrs[i], options), losses[i]))
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .collect()
}

/// Axis position of the suggestion when it falls inside the plotted range.
fn marker_x(points: &[(f64, f64)], options: &PlotOptions) -> Option<f64> {
    let (lo, hi) = bounds(points.iter().map(|p| p.0))?;
    options
        .suggested_lr
        .map(|lr| axis_x(lr, options))
        .filter(|x| x.is_finite() && (lo..=hi).contains(x))
}

/// Draw loss against learning rate into a PNG at `path`.
///
/// The image is rendered next to `path` and renamed into place. With fewer
/// than two finite points left after skipping, only the empty grid is drawn.
pub fn render_lr_plot(
    path: &Path,
    lrs: &[f64],
    losses: &[f64],
    options: &PlotOptions,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let points = curve_points(lrs, losses, options);
    let tmp = path.with_extension("tmp.png");
    draw(&tmp, &points, marker_x(&points, options))?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn draw(path: &Path, points: &[(f64, f64)], marker: Option<f64>) -> Result<()> {
    let root = BitMapBackend::new(path, (WIDTH, HEIGHT)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_error)?;

    let (x_lo, x_hi) = bounds(points.iter().map(|p| p.0)).unwrap_or((0.0, 1.0));
    let (y_lo, y_hi) = bounds(points.iter().map(|p| p.1)).unwrap_or((0.0, 1.0));
    let mut chart = ChartBuilder::on(&root)
        .margin(24)
        .build_cartesian_2d(x_lo..x_hi, y_lo..y_hi)
        .map_err(plot_error)?;
    chart.configure_mesh().draw().map_err(plot_error)?;

    if points.len() >= 2 {
        chart
            .draw_series(LineSeries::new(points.iter().copied(), CURVE.stroke_width(2)))
            .map_err(plot_error)?;
    }
    if let Some(x) = marker {
        chart
            .draw_series(std::iter::once(PathElement::new(
                vec![(x, y_lo), (x, y_hi)],
                MARKER.stroke_width(2),
            )))
            .map_err(plot_error)?;
    }
    root.present().map_err(plot_error)?;
    Ok(())
}
