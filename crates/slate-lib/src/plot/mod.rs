//! Backend-independent figure model. Steps build figures; rendering to PNG
//! happens in the task layer.

use crate::spectral::Psd;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Axis {
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Style {
    pub width: f32,
    pub dash: Option<[f32; 2]>,
    pub color: Color,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct Color(pub u32);

impl Color {
    pub fn rgb(self) -> (u8, u8, u8) {
        (
            ((self.0 >> 16) & 0xFF) as u8,
            ((self.0 >> 8) & 0xFF) as u8,
            (self.0 & 0xFF) as u8,
        )
    }
}

/// Line colors cycled by the overlay builders.
pub const PALETTE: [Color; 8] = [
    Color(0x1F77B4),
    Color(0xFF7F0E),
    Color(0x2CA02C),
    Color(0xD62728),
    Color(0x9467BD),
    Color(0x8C564B),
    Color(0xE377C2),
    Color(0x7F7F7F),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineSeries {
    pub name: String,
    pub points: Vec<[f64; 2]>,
    pub style: Style,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarSeries {
    pub labels: Vec<String>,
    pub values: Vec<f64>,
    pub color: Color,
}

/// Row-major grid of values with labelled axes. `values[row][col]` maps to
/// `y_labels[row]` and `x_labels[col]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeatmapSeries {
    pub x_labels: Vec<String>,
    pub y_labels: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Series {
    Line(LineSeries),
    Bars(BarSeries),
    Heatmap(HeatmapSeries),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Figure {
    pub title: Option<String>,
    pub x: Axis,
    pub y: Axis,
    pub series: Vec<Series>,
}

impl Figure {
    pub fn new(title: impl Into<Option<String>>) -> Self {
        Self {
            title: title.into(),
            x: Axis { label: None },
            y: Axis { label: None },
            series: Vec::new(),
        }
    }

    pub fn with_labels(mut self, x: &str, y: &str) -> Self {
        self.x.label = Some(x.to_string());
        self.y.label = Some(y.to_string());
        self
    }

    pub fn add_series(&mut self, series: Series) {
        self.series.push(series);
    }
}

pub trait PlotBackend {
    fn draw(&mut self, fig: &Figure) -> anyhow::Result<()>;
}

pub fn decimate_points(points: &[[f64; 2]], max_points: usize) -> Vec<[f64; 2]> {
    if points.len() <= max_points {
        return points.to_vec();
    }
    let bucket_size = points.len() as f64 / max_points as f64;
    let mut result = Vec::with_capacity(max_points);
    for i in 0..max_points {
        let start = (i as f64 * bucket_size).floor() as usize;
        if start >= points.len() {
            break;
        }
        result.push(points[start]);
    }
    result
}

fn db(power: f64) -> f64 {
    10.0 * power.max(1e-20).log10()
}

fn psd_points(psd: &Psd, max_points: usize) -> Vec<[f64; 2]> {
    let points: Vec<[f64; 2]> = psd
        .freqs
        .iter()
        .zip(&psd.power)
        .map(|(f, p)| [*f, db(*p)])
        .collect();
    decimate_points(&points, max_points)
}

/// Single spectrum on dB axes.
pub fn psd_figure(title: &str, name: &str, psd: &Psd) -> Figure {
    let mut fig = Figure::new(Some(title.to_string()))
        .with_labels("Frequency (Hz)", "Power (dB \u{b5}V\u{b2}/Hz)");
    fig.add_series(Series::Line(LineSeries {
        name: name.to_string(),
        points: psd_points(psd, 2048),
        style: Style {
            width: 1.4,
            dash: None,
            color: PALETTE[0],
        },
    }));
    fig
}

/// Several spectra on shared dB axes, palette colors cycling per trace.
pub fn psd_overlay_figure(title: &str, spectra: &[(String, Psd)]) -> Figure {
    let mut fig = Figure::new(Some(title.to_string()))
        .with_labels("Frequency (Hz)", "Power (dB \u{b5}V\u{b2}/Hz)");
    for (index, (name, psd)) in spectra.iter().enumerate() {
        fig.add_series(Series::Line(LineSeries {
            name: name.clone(),
            points: psd_points(psd, 2048),
            style: Style {
                width: 1.2,
                dash: None,
                color: PALETTE[index % PALETTE.len()],
            },
        }));
    }
    fig
}

/// Band powers as one bar per band.
pub fn band_power_figure(title: &str, bands: &[(String, f64)]) -> Figure {
    let mut fig =
        Figure::new(Some(title.to_string())).with_labels("Band", "Power (\u{b5}V\u{b2})");
    fig.add_series(Series::Bars(BarSeries {
        labels: bands.iter().map(|(name, _)| name.clone()).collect(),
        values: bands.iter().map(|(_, value)| *value).collect(),
        color: PALETTE[0],
    }));
    fig
}

/// Labelled matrix rendered as colored cells.
pub fn heatmap_figure(
    title: &str,
    x_labels: Vec<String>,
    y_labels: Vec<String>,
    values: Vec<Vec<f64>>,
) -> Figure {
    let mut fig = Figure::new(Some(title.to_string()));
    fig.add_series(Series::Heatmap(HeatmapSeries {
        x_labels,
        y_labels,
        values,
    }));
    fig
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimation_keeps_short_traces_intact() {
        let points: Vec<[f64; 2]> = (0..100).map(|i| [i as f64, 0.0]).collect();
        assert_eq!(decimate_points(&points, 200).len(), 100);
        let thinned = decimate_points(&points, 10);
        assert_eq!(thinned.len(), 10);
        assert_eq!(thinned[0], [0.0, 0.0]);
    }

    #[test]
    fn psd_figure_plots_decibels() {
        let psd = Psd {
            freqs: vec![1.0, 2.0, 3.0],
            power: vec![1.0, 10.0, 100.0],
        };
        let fig = psd_figure("psd", "Cz", &psd);
        assert_eq!(fig.series.len(), 1);
        match &fig.series[0] {
            Series::Line(line) => {
                assert_eq!(line.points[0][1], 0.0);
                assert!((line.points[1][1] - 10.0).abs() < 1e-12);
                assert!((line.points[2][1] - 20.0).abs() < 1e-12);
            }
            other => panic!("unexpected series {other:?}"),
        }
        assert_eq!(fig.x.label.as_deref(), Some("Frequency (Hz)"));
    }

    #[test]
    fn overlay_cycles_the_palette() {
        let psd = Psd {
            freqs: vec![1.0],
            power: vec![1.0],
        };
        let spectra: Vec<(String, Psd)> = (0..10)
            .map(|i| (format!("roi{i}"), psd.clone()))
            .collect();
        let fig = psd_overlay_figure("overlay", &spectra);
        assert_eq!(fig.series.len(), 10);
        let color_of = |series: &Series| match series {
            Series::Line(line) => line.style.color.0,
            _ => unreachable!(),
        };
        assert_eq!(color_of(&fig.series[0]), color_of(&fig.series[8]));
        assert_ne!(color_of(&fig.series[0]), color_of(&fig.series[1]));
    }

    #[test]
    fn color_unpacks_to_rgb() {
        assert_eq!(Color(0x1F77B4).rgb(), (0x1F, 0x77, 0xB4));
    }
}
