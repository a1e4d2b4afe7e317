//! Per-iteration latency scatter plots
//!
//! [`Plotter`] is the plotting capability the reporter depends on; the
//! shipped [`SvgPlotter`] renders a self-contained SVG document through a
//! minijinja template.

use std::fs;
use std::path::{Path, PathBuf};

use minijinja::{context, AutoEscape, Environment};
use serde::Serialize;
use txcost_core::ServerInfo;

use crate::matrix::ConfigurationEntry;
use crate::metrics::DurationSample;
use crate::report::ArtifactError;

/// Y axis label of latency plots
pub const LATENCY_AXIS_LABEL: &str = "milliseconds";

/// X axis label of latency plots
pub const ITERATION_AXIS_LABEL: &str = "iteration";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisKind {
    X,
    Y,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Axis {
    pub label: Option<String>,
    pub lower_bound: Option<f64>,
}

/// A scatter plot ready to be saved
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Figure {
    pub title: String,
    pub x: Axis,
    pub y: Axis,
    pub points: Vec<(f64, f64)>,
}

impl Figure {
    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
    }

    pub fn set_axis_label(&mut self, axis: AxisKind, label: impl Into<String>) {
        self.axis_mut(axis).label = Some(label.into());
    }

    /// Pin the lower end of the y axis
    pub fn set_y_lower_bound(&mut self, bound: f64) {
        self.y.lower_bound = Some(bound);
    }

    fn axis_mut(&mut self, axis: AxisKind) -> &mut Axis {
        match axis {
            AxisKind::X => &mut self.x,
            AxisKind::Y => &mut self.y,
        }
    }
}

/// Plotting capability
pub trait Plotter {
    /// Build a scatter figure from paired coordinates
    fn scatter(&self, xs: &[f64], ys: &[f64]) -> Figure;

    /// Persist `figure` at `path`
    fn save(&self, figure: &Figure, path: &Path) -> Result<(), ArtifactError>;
}

const WIDTH: f64 = 800.0;
const HEIGHT: f64 = 480.0;
const MARGIN_LEFT: f64 = 70.0;
const MARGIN_RIGHT: f64 = 20.0;
const MARGIN_TOP: f64 = 40.0;
const MARGIN_BOTTOM: f64 = 50.0;
const Y_TICKS: usize = 5;

#[derive(Debug, Serialize)]
struct Point {
    cx: f64,
    cy: f64,
}

#[derive(Debug, Serialize)]
struct Tick {
    position: f64,
    label: String,
}

/// Renders figures as SVG documents
#[derive(Debug, Clone, Copy, Default)]
pub struct SvgPlotter;

impl SvgPlotter {
    pub fn new() -> Self {
        Self
    }

    /// Render `figure` to an SVG document
    pub fn render(&self, figure: &Figure) -> Result<String, ArtifactError> {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::Html);
        env.add_template("scatter.svg", SCATTER_TEMPLATE)?;
        let template = env.get_template("scatter.svg")?;

        let (x_min, x_max) = bounds(figure.points.iter().map(|p| p.0), figure.x.lower_bound);
        let (y_min, y_max) = bounds(figure.points.iter().map(|p| p.1), figure.y.lower_bound);
        let plot_width = WIDTH - MARGIN_LEFT - MARGIN_RIGHT;
        let plot_height = HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;
        let to_x = |x: f64| MARGIN_LEFT + (x - x_min) / (x_max - x_min) * plot_width;
        let to_y = |y: f64| MARGIN_TOP + plot_height - (y - y_min) / (y_max - y_min) * plot_height;

        let points: Vec<Point> = figure
            .points
            .iter()
            .map(|(x, y)| Point {
                cx: to_x(*x),
                cy: to_y(*y),
            })
            .collect();
        let y_ticks: Vec<Tick> = (0..=Y_TICKS)
            .map(|i| {
                let value = y_min + (y_max - y_min) * i as f64 / Y_TICKS as f64;
                Tick {
                    position: to_y(value),
                    label: format!("{:.2}", value),
                }
            })
            .collect();
        let x_ticks: Vec<Tick> = [x_min, (x_min + x_max) / 2.0, x_max]
            .into_iter()
            .map(|value| Tick {
                position: to_x(value),
                label: format!("{}", value.round()),
            })
            .collect();

        let svg = template.render(context! {
            width => WIDTH,
            height => HEIGHT,
            left => MARGIN_LEFT,
            right => WIDTH - MARGIN_RIGHT,
            top => MARGIN_TOP,
            bottom => HEIGHT - MARGIN_BOTTOM,
            center_x => MARGIN_LEFT + plot_width / 2.0,
            center_y => MARGIN_TOP + plot_height / 2.0,
            title => figure.title,
            x_label => figure.x.label,
            y_label => figure.y.label,
            points => points,
            x_ticks => x_ticks,
            y_ticks => y_ticks,
        })?;
        Ok(svg)
    }
}

impl Plotter for SvgPlotter {
    fn scatter(&self, xs: &[f64], ys: &[f64]) -> Figure {
        Figure {
            points: xs.iter().copied().zip(ys.iter().copied()).collect(),
            ..Default::default()
        }
    }

    fn save(&self, figure: &Figure, path: &Path) -> Result<(), ArtifactError> {
        let svg = self.render(figure)?;
        fs::write(path, svg)?;
        Ok(())
    }
}

/// Axis range covering `values`, starting at `lower` when pinned
fn bounds(values: impl Iterator<Item = f64>, lower: Option<f64>) -> (f64, f64) {
    let (min, max) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    let (min, max) = if min.is_finite() { (min, max) } else { (0.0, 1.0) };
    let min = lower.unwrap_or(min);
    let max = if max > min { max } else { min + 1.0 };
    (min, max)
}

/// Saves one latency scatter plot per configuration run
#[derive(Debug, Clone, Default)]
pub struct GraphReporter<P = SvgPlotter> {
    plotter: P,
}

impl<P: Plotter> GraphReporter<P> {
    pub fn new(plotter: P) -> Self {
        Self { plotter }
    }

    /// Plot iteration number against latency in milliseconds and save it at `path`
    pub fn plot(
        &self,
        samples: &[DurationSample],
        title: &str,
        path: &Path,
    ) -> Result<(), ArtifactError> {
        let xs: Vec<f64> = samples.iter().map(|s| s.iteration as f64).collect();
        let ys: Vec<f64> = samples.iter().map(DurationSample::millis).collect();

        let mut figure = self.plotter.scatter(&xs, &ys);
        figure.set_title(title);
        figure.set_axis_label(AxisKind::X, ITERATION_AXIS_LABEL);
        figure.set_axis_label(AxisKind::Y, LATENCY_AXIS_LABEL);
        figure.set_y_lower_bound(0.0);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.plotter.save(&figure, path)
    }
}

/// Plot title: workload, configuration and server version
pub fn plot_title(entry: &ConfigurationEntry, server: &ServerInfo) -> String {
    format!("{}, {}", entry.description(), server.version)
}

/// `<workload>-<concerns>-<server version>-<timestamp>.svg` under `dir`
pub fn artifact_path(
    dir: &Path,
    entry: &ConfigurationEntry,
    server: &ServerInfo,
    timestamp: &str,
) -> PathBuf {
    let concerns = match entry.transaction_options() {
        Some(options) => format!("{} txn {}", entry.concerns(), options),
        None => entry.concerns().to_string(),
    };
    let name = format!(
        "{}-{}-{}-{}",
        sanitize(entry.workload().name()),
        sanitize(&concerns),
        sanitize(&server.version),
        sanitize(timestamp)
    );
    dir.join(format!("{}.svg", name))
}

/// Keep `[A-Za-z0-9._]`, collapse every other run of characters into `_`
fn sanitize(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for c in part.chars() {
        if c.is_ascii_alphanumeric() || c == '.' {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

const SCATTER_TEMPLATE: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="{{ width }}" height="{{ height }}" viewBox="0 0 {{ width }} {{ height }}">
  <rect width="100%" height="100%" fill="white"/>
  <text x="{{ center_x }}" y="{{ top / 2 + 5 }}" text-anchor="middle" font-family="sans-serif" font-size="14">{{ title }}</text>
  <line x1="{{ left }}" y1="{{ bottom }}" x2="{{ right }}" y2="{{ bottom }}" stroke="black"/>
  <line x1="{{ left }}" y1="{{ top }}" x2="{{ left }}" y2="{{ bottom }}" stroke="black"/>
{%- for tick in y_ticks %}
  <line x1="{{ left - 4 }}" y1="{{ tick.position|round(2) }}" x2="{{ right }}" y2="{{ tick.position|round(2) }}" stroke="#e0e0e0"/>
  <text x="{{ left - 8 }}" y="{{ (tick.position + 4)|round(2) }}" text-anchor="end" font-family="sans-serif" font-size="10">{{ tick.label }}</text>
{%- endfor %}
{%- for tick in x_ticks %}
  <text x="{{ tick.position|round(2) }}" y="{{ bottom + 16 }}" text-anchor="middle" font-family="sans-serif" font-size="10">{{ tick.label }}</text>
{%- endfor %}
{%- if x_label %}
  <text x="{{ center_x }}" y="{{ height - 10 }}" text-anchor="middle" font-family="sans-serif" font-size="12">{{ x_label }}</text>
{%- endif %}
{%- if y_label %}
  <text x="16" y="{{ center_y }}" text-anchor="middle" font-family="sans-serif" font-size="12" transform="rotate(-90 16 {{ center_y }})">{{ y_label }}</text>
{%- endif %}
{%- for point in points %}
  <circle cx="{{ point.cx|round(2) }}" cy="{{ point.cy|round(2) }}" r="2" fill="#1f77b4"/>
{%- endfor %}
</svg>
"##;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::SampleOutcome;
    use crate::workload::Workload;
    use std::time::Duration;
    use txcost_core::{ConcernSet, ReadConcern, ReadPreference, WriteConcern};

    fn server() -> ServerInfo {
        ServerInfo {
            version: "4.0.0-sim".to_string(),
            storage_engine: "inMemory".to_string(),
        }
    }

    fn samples() -> Vec<DurationSample> {
        [3, 5, 4]
            .iter()
            .enumerate()
            .map(|(i, ms)| {
                DurationSample::new(i as u64 + 1, Duration::from_millis(*ms), SampleOutcome::Ok)
            })
            .collect()
    }

    #[test]
    fn test_y_axis_pinned_at_zero() {
        let (min, max) = bounds([3.0, 5.0, 4.0].into_iter(), Some(0.0));
        assert_eq!(min, 0.0);
        assert_eq!(max, 5.0);

        let (min, max) = bounds(std::iter::empty(), None);
        assert!(max > min);
    }

    #[test]
    fn test_render_contains_points_and_labels() {
        let plotter = SvgPlotter::new();
        let mut figure = plotter.scatter(&[1.0, 2.0, 3.0], &[3.0, 5.0, 4.0]);
        figure.set_title("read_modify_write, w=1 <fast>");
        figure.set_axis_label(AxisKind::Y, LATENCY_AXIS_LABEL);
        figure.set_y_lower_bound(0.0);

        let svg = plotter.render(&figure).unwrap();

        assert!(svg.starts_with("<svg"));
        assert_eq!(svg.matches("<circle").count(), 3);
        assert!(svg.contains("milliseconds"));
        assert!(svg.contains("&lt;fast&gt;"));
        assert!(svg.contains(">0.00<"));
    }

    #[test]
    fn test_plot_writes_file_without_touching_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plots").join("run.svg");
        let samples = samples();
        let before = samples.clone();

        GraphReporter::new(SvgPlotter::new())
            .plot(&samples, "title", &path)
            .unwrap();

        assert_eq!(samples, before);
        let svg = fs::read_to_string(&path).unwrap();
        assert_eq!(svg.matches("<circle").count(), 3);
    }

    #[test]
    fn test_plot_reports_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        // a regular file cannot act as a parent directory
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "").unwrap();

        let err = GraphReporter::new(SvgPlotter::new())
            .plot(&samples(), "title", &blocker.join("run.svg"))
            .unwrap_err();
        assert!(matches!(err, ArtifactError::Io(_)));
    }

    #[test]
    fn test_artifact_path_is_sanitized() {
        let entry = ConfigurationEntry::new(
            Workload::ReadModifyWrite,
            ConcernSet::new()
                .with_write(WriteConcern::majority())
                .with_read(ReadConcern::Majority)
                .with_preference(ReadPreference::Secondary),
        )
        .unwrap();

        let path = artifact_path(Path::new("out"), &entry, &server(), "20181108-120000.123");

        assert_eq!(
            path,
            Path::new("out").join(
                "read_modify_write-w_majority_rc_majority_rp_secondary-4.0.0_sim-20181108_120000.123.svg"
            )
        );
    }

    #[test]
    fn test_artifact_path_distinguishes_transaction_options() {
        let concerns = ConcernSet::new().with_write(WriteConcern::majority());
        let plain = ConfigurationEntry::new(
            Workload::ReadModifyWriteTransaction {
                options: ConcernSet::new(),
            },
            concerns,
        )
        .unwrap();
        let with_options = ConfigurationEntry::new(
            Workload::ReadModifyWriteTransaction { options: concerns },
            concerns,
        )
        .unwrap();

        assert_ne!(
            artifact_path(Path::new("."), &plain, &server(), "t"),
            artifact_path(Path::new("."), &with_options, &server(), "t")
        );
    }
}
