// Rollmap: defects plotted in physical roll coordinates.
//
// The whole defect log is mapped to (along-roll, cross-web) centimeters and
// cut into fixed-width along-roll windows, one scatter image per window. The
// output is derived state and is regenerated from scratch on every call.

use crate::config::PipelineConfig;
use crate::pipeline::codec::write_image_atomic;
use crate::pipeline::geometry::RollGeometry;
use crate::pipeline::store::DefectStore;
use crate::pipeline::types::DefectClass;
use anyhow::{Context, Result};
use opencv::core::{Mat, Point, Rect, Scalar, CV_8UC3};
use opencv::imgproc::{self, FONT_HERSHEY_SIMPLEX, LINE_8, LINE_AA};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const CANVAS_WIDTH: i32 = 870;
const CANVAS_HEIGHT: i32 = 300;
const PLOT_LEFT: i32 = 62;
const PLOT_RIGHT: i32 = 14;
const PLOT_TOP: i32 = 12;
const PLOT_BOTTOM: i32 = 48;
const X_TICK_CM: f64 = 10.0;
const Y_TICK_CM: f64 = 5.0;
const POINT_RADIUS: i32 = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RollmapPoint {
    pub x_cm: f64,
    pub y_cm: f64,
    pub class: DefectClass,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollmapWindow {
    pub window_index: u32,
    pub points: Vec<RollmapPoint>,
}

#[derive(Deserialize)]
struct RollmapEntry {
    frame_pos: u64,
    class: DefectClass,
    pos_x: u32,
    pos_y: u32,
}

/// Cut a sequence of along-roll positions into consecutive windows of `width`.
///
/// Window `k` ends at `(k + 1) * width` (inclusive). A value past the current
/// window's end closes it and advances the bound by `width` until the value
/// fits; windows skipped that way hold no values and are not emitted. Values
/// are never moved back into an earlier window. Returns `(window_index, count)`
/// per emitted window, in input order.
pub fn split_by_limit(values: &[f64], width: f64) -> Vec<(u32, usize)> {
    let mut windows: Vec<(u32, usize)> = Vec::new();
    let mut index = 0u32;
    let mut limit = width;

    for &value in values {
        while value > limit {
            index += 1;
            limit += width;
        }
        match windows.last_mut() {
            Some((last, count)) if *last == index => *count += 1,
            _ => windows.push((index, 1)),
        }
    }

    windows
}

/// Re-slice `items` into consecutive runs of the given lengths.
pub fn split_into_structure<T: Clone>(items: &[T], counts: &[usize]) -> Vec<Vec<T>> {
    let mut out = Vec::with_capacity(counts.len());
    let mut start = 0;
    for &len in counts {
        let end = (start + len).min(items.len());
        out.push(items[start..end].to_vec());
        start = end;
    }
    out
}

/// Map logged defects to the roll and partition them into windows.
pub fn build_windows(
    positions: &[(u64, u32, u32, DefectClass)],
    geometry: &RollGeometry,
    window_width_cm: f64,
) -> Vec<RollmapWindow> {
    let mut x_cm = Vec::with_capacity(positions.len());
    let mut y_cm = Vec::with_capacity(positions.len());
    let mut classes = Vec::with_capacity(positions.len());
    for &(frame_pos, pos_x, pos_y, class) in positions {
        let p = geometry.to_physical(frame_pos, pos_x, pos_y);
        x_cm.push(p.x_cm);
        y_cm.push(p.y_cm);
        classes.push(class);
    }

    let structure = split_by_limit(&x_cm, window_width_cm);
    let counts: Vec<usize> = structure.iter().map(|(_, n)| *n).collect();

    let xs = split_into_structure(&x_cm, &counts);
    let ys = split_into_structure(&y_cm, &counts);
    let cs = split_into_structure(&classes, &counts);

    structure
        .iter()
        .zip(xs.into_iter().zip(ys).zip(cs))
        .map(|(&(window_index, _), ((xs, ys), cs))| RollmapWindow {
            window_index,
            points: xs
                .into_iter()
                .zip(ys)
                .zip(cs)
                .map(|((x_cm, y_cm), class)| RollmapPoint { x_cm, y_cm, class })
                .collect(),
        })
        .collect()
}

pub fn window_file_name(window_index: u32) -> String {
    format!("rollmap_plot_{window_index}.jpg")
}

/// Renders rollmap windows for a session.
pub struct RollmapGenerator {
    geometry: RollGeometry,
    window_width_cm: f64,
    margin_cm: f64,
    y_range: (f64, f64),
}

impl RollmapGenerator {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            geometry: config.geometry(),
            window_width_cm: config.window_width_cm,
            margin_cm: config.window_margin_cm,
            y_range: (config.cross_web_min_cm, config.cross_web_max_cm),
        }
    }

    pub fn windows(&self, store: &DefectStore) -> Result<Vec<RollmapWindow>> {
        let entries: Vec<RollmapEntry> = store.read_entries()?;
        let positions: Vec<_> = entries
            .iter()
            .map(|e| (e.frame_pos, e.pos_x, e.pos_y, e.class))
            .collect();
        Ok(build_windows(&positions, &self.geometry, self.window_width_cm))
    }

    /// Rebuild every window image from the full log. Returns the written paths.
    pub fn regenerate(&self, store: &DefectStore, out_dir: &Path) -> Result<Vec<PathBuf>> {
        let windows = self.windows(store)?;
        if windows.is_empty() {
            tracing::debug!("No defects logged yet, skipping rollmap");
            return Ok(Vec::new());
        }

        fs::create_dir_all(out_dir)?;
        let mut written = Vec::with_capacity(windows.len());
        for window in &windows {
            let canvas = self.render(window)?;
            let path = out_dir.join(window_file_name(window.window_index));
            write_image_atomic(&path, &canvas)
                .with_context(|| format!("Failed to save rollmap window {}", window.window_index))?;
            written.push(path);
        }

        tracing::debug!("Rendered {} rollmap windows", written.len());
        Ok(written)
    }

    /// Draw one window as a scatter plot.
    pub fn render(&self, window: &RollmapWindow) -> Result<Mat> {
        let mut canvas = Mat::new_rows_cols_with_default(
            CANVAS_HEIGHT,
            CANVAS_WIDTH,
            CV_8UC3,
            Scalar::all(255.0),
        )?;

        let x_min = self.window_width_cm * window.window_index as f64 - self.margin_cm;
        let x_max = self.window_width_cm * (window.window_index as f64 + 1.0);
        let (y_min, y_max) = self.y_range;
        let plot = Rect::new(
            PLOT_LEFT,
            PLOT_TOP,
            CANVAS_WIDTH - PLOT_LEFT - PLOT_RIGHT,
            CANVAS_HEIGHT - PLOT_TOP - PLOT_BOTTOM,
        );

        let to_px = |x: f64, y: f64| -> Point {
            let px = plot.x as f64 + (x - x_min) / (x_max - x_min) * plot.width as f64;
            let py = (plot.y + plot.height) as f64
                - (y - y_min) / (y_max - y_min) * plot.height as f64;
            Point::new(px.round() as i32, py.round() as i32)
        };

        let grid_color = Scalar::new(220.0, 220.0, 220.0, 0.0);
        let text_color = Scalar::all(40.0);

        // Grid and tick labels
        let mut tick = (x_min / X_TICK_CM).ceil() * X_TICK_CM;
        while tick <= x_max {
            let p = to_px(tick, y_min);
            imgproc::line(
                &mut canvas,
                Point::new(p.x, plot.y),
                Point::new(p.x, plot.y + plot.height),
                grid_color,
                1,
                LINE_8,
                0,
            )?;
            put_label(
                &mut canvas,
                &format!("{tick:.0}"),
                Point::new(p.x - 8, plot.y + plot.height + 16),
                text_color,
            )?;
            tick += X_TICK_CM;
        }
        let mut tick = (y_min / Y_TICK_CM).ceil() * Y_TICK_CM;
        while tick <= y_max {
            let p = to_px(x_min, tick);
            imgproc::line(
                &mut canvas,
                Point::new(plot.x, p.y),
                Point::new(plot.x + plot.width, p.y),
                grid_color,
                1,
                LINE_8,
                0,
            )?;
            put_label(
                &mut canvas,
                &format!("{tick:.0}"),
                Point::new(plot.x - 26, p.y + 4),
                text_color,
            )?;
            tick += Y_TICK_CM;
        }

        imgproc::rectangle(&mut canvas, plot, text_color, 1, LINE_8, 0)?;
        put_label(
            &mut canvas,
            "Vertical position (cm)",
            Point::new(plot.x + plot.width / 2 - 80, CANVAS_HEIGHT - 8),
            text_color,
        )?;
        put_label(
            &mut canvas,
            "Horizontal position (cm)",
            Point::new(4, PLOT_TOP - 2),
            text_color,
        )?;

        // Points outside the plot area are clipped, as in a regular scatter plot.
        for point in &window.points {
            let p = to_px(point.x_cm, point.y_cm);
            if !plot.contains(p) {
                continue;
            }
            imgproc::circle(
                &mut canvas,
                p,
                POINT_RADIUS,
                point.class.color(),
                imgproc::FILLED,
                LINE_8,
                0,
            )?;
        }

        Ok(canvas)
    }
}

fn put_label(canvas: &mut Mat, text: &str, origin: Point, color: Scalar) -> Result<()> {
    imgproc::put_text(canvas, text, origin, FONT_HERSHEY_SIMPLEX, 0.4, color, 1, LINE_AA, false)?;
    Ok(())
}
