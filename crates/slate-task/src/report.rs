//! PNG rendering for the figure model. Single figures render at 1100x700;
//! report pages stack panels vertically at 1100x1400.

use anyhow::{bail, Result};
use plotters::coord::Shift;
use plotters::prelude::*;
use slate_lib::plot::{BarSeries, Figure, HeatmapSeries, Series};
use std::path::Path;

pub const FIGURE_SIZE: (u32, u32) = (1100, 700);
pub const PAGE_SIZE: (u32, u32) = (1100, 1400);

pub fn render_figure(path: &Path, figure: &Figure) -> Result<()> {
    let root = BitMapBackend::new(path, FIGURE_SIZE).into_drawing_area();
    root.fill(&WHITE)?;
    draw_on(&root, figure)?;
    root.present()?;
    Ok(())
}

/// Render stacked panels, one per figure, top to bottom.
pub fn render_page(path: &Path, figures: &[Figure]) -> Result<()> {
    if figures.is_empty() {
        bail!("a report page needs at least one panel");
    }
    let root = BitMapBackend::new(path, PAGE_SIZE).into_drawing_area();
    root.fill(&WHITE)?;
    let panels = root.split_evenly((figures.len(), 1));
    for (panel, figure) in panels.iter().zip(figures) {
        draw_on(panel, figure)?;
    }
    root.present()?;
    Ok(())
}

fn draw_on(area: &DrawingArea<BitMapBackend, Shift>, figure: &Figure) -> Result<()> {
    match figure.series.first() {
        None => Ok(()),
        Some(Series::Line(_)) => draw_lines(area, figure),
        Some(Series::Bars(_)) => draw_bars(area, figure),
        Some(Series::Heatmap(_)) => draw_heatmap(area, figure),
    }
}

fn rgb(color: slate_lib::plot::Color) -> RGBColor {
    let (r, g, b) = color.rgb();
    RGBColor(r, g, b)
}

fn finite_range(values: impl Iterator<Item = f64>, fallback: (f64, f64)) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for value in values.filter(|v| v.is_finite()) {
        min = min.min(value);
        max = max.max(value);
    }
    if min > max {
        return fallback;
    }
    if min == max {
        return (min - 0.5, max + 0.5);
    }
    (min, max)
}

fn draw_lines(area: &DrawingArea<BitMapBackend, Shift>, figure: &Figure) -> Result<()> {
    let lines: Vec<_> = figure
        .series
        .iter()
        .filter_map(|series| match series {
            Series::Line(line) => Some(line),
            _ => None,
        })
        .collect();
    let (x_min, x_max) = finite_range(
        lines.iter().flat_map(|l| l.points.iter().map(|p| p[0])),
        (0.0, 1.0),
    );
    let (y_min, y_max) = finite_range(
        lines.iter().flat_map(|l| l.points.iter().map(|p| p[1])),
        (0.0, 1.0),
    );
    let mut chart = ChartBuilder::on(area)
        .margin(10)
        .caption(
            figure.title.clone().unwrap_or_default(),
            ("sans-serif", 24),
        )
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(x_min..x_max, y_min..y_max)?;
    chart
        .configure_mesh()
        .x_desc(figure.x.label.clone().unwrap_or_default())
        .y_desc(figure.y.label.clone().unwrap_or_default())
        .draw()?;
    for line in &lines {
        let color = rgb(line.style.color);
        chart
            .draw_series(LineSeries::new(
                line.points
                    .iter()
                    .filter(|p| p[0].is_finite() && p[1].is_finite())
                    .map(|p| (p[0], p[1])),
                &color,
            ))?
            .label(line.name.clone())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], color));
    }
    if lines.len() > 1 {
        chart
            .configure_series_labels()
            .border_style(BLACK)
            .background_style(WHITE.mix(0.8))
            .draw()?;
    }
    Ok(())
}

fn draw_bars(area: &DrawingArea<BitMapBackend, Shift>, figure: &Figure) -> Result<()> {
    let bars: &BarSeries = match figure.series.first() {
        Some(Series::Bars(bars)) => bars,
        _ => bail!("bar panel without a bar series"),
    };
    let n = bars.values.len();
    if n == 0 || bars.labels.len() != n {
        bail!("bar series needs matching labels and values");
    }
    let (low, high) = finite_range(bars.values.iter().copied(), (0.0, 1.0));
    let y_min = low.min(0.0);
    let y_max = if high > 0.0 { high * 1.1 } else { 1.0 };
    let labels = bars.labels.clone();
    let mut chart = ChartBuilder::on(area)
        .margin(10)
        .caption(
            figure.title.clone().unwrap_or_default(),
            ("sans-serif", 24),
        )
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(-0.5..(n as f64 - 0.5), y_min..y_max)?;
    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_labels(n)
        .x_label_formatter(&|x| {
            let index = x.round();
            if index >= 0.0 && (index as usize) < labels.len() && (x - index).abs() < 0.25 {
                labels[index as usize].clone()
            } else {
                String::new()
            }
        })
        .x_desc(figure.x.label.clone().unwrap_or_default())
        .y_desc(figure.y.label.clone().unwrap_or_default())
        .draw()?;
    let color = rgb(bars.color);
    chart.draw_series(bars.values.iter().enumerate().map(|(index, value)| {
        let value = if value.is_finite() { *value } else { 0.0 };
        Rectangle::new(
            [(index as f64 - 0.35, 0.0), (index as f64 + 0.35, value)],
            color.filled(),
        )
    }))?;
    Ok(())
}

fn draw_heatmap(area: &DrawingArea<BitMapBackend, Shift>, figure: &Figure) -> Result<()> {
    let map: &HeatmapSeries = match figure.series.first() {
        Some(Series::Heatmap(map)) => map,
        _ => bail!("heatmap panel without a heatmap series"),
    };
    let n_rows = map.values.len();
    let n_cols = map.values.first().map_or(0, |row| row.len());
    if n_rows == 0 || n_cols == 0 {
        bail!("heatmap series is empty");
    }
    let (low, high) = finite_range(
        map.values.iter().flat_map(|row| row.iter().copied()),
        (0.0, 1.0),
    );
    let span = (high - low).max(1e-12);
    let x_labels = map.x_labels.clone();
    let y_labels = map.y_labels.clone();
    let mut chart = ChartBuilder::on(area)
        .margin(10)
        .caption(
            figure.title.clone().unwrap_or_default(),
            ("sans-serif", 24),
        )
        .x_label_area_size(60)
        .y_label_area_size(120)
        .build_cartesian_2d(0.0..n_cols as f64, 0.0..n_rows as f64)?;
    chart
        .configure_mesh()
        .disable_x_mesh()
        .disable_y_mesh()
        .x_labels(n_cols)
        .y_labels(n_rows)
        .x_label_formatter(&|x| index_label(&x_labels, *x))
        .y_label_formatter(&|y| index_label(&y_labels, *y))
        .draw()?;
    chart.draw_series(map.values.iter().enumerate().flat_map(|(row, cells)| {
        cells.iter().enumerate().map(move |(col, value)| {
            let color = if value.is_finite() {
                let t = ((value - low) / span).clamp(0.0, 1.0);
                lerp_color((255, 255, 255), (31, 119, 180), t)
            } else {
                RGBColor(230, 230, 230)
            };
            Rectangle::new(
                [(col as f64, row as f64), (col as f64 + 1.0, row as f64 + 1.0)],
                color.filled(),
            )
        })
    }))?;
    Ok(())
}

fn index_label(labels: &[String], position: f64) -> String {
    // Ticks land on cell boundaries; label the cell to the right of each.
    let index = position.floor();
    if index >= 0.0 && (index as usize) < labels.len() && (position - index).abs() < 0.25 {
        labels[index as usize].clone()
    } else {
        String::new()
    }
}

fn lerp_color(from: (u8, u8, u8), to: (u8, u8, u8), t: f64) -> RGBColor {
    let channel = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * t).round() as u8;
    RGBColor(
        channel(from.0, to.0),
        channel(from.1, to.1),
        channel(from.2, to.2),
    )
}
