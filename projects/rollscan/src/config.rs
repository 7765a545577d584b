use crate::pipeline::geometry::RollGeometry;
use crate::pipeline::two_pass::Thresholds;
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Pipeline tuning, fixed for the lifetime of the process.
///
/// Defaults describe the reference line: 60 fps footage of a web moving
/// 5 px per frame through a 600 px tall view, sampled every 119 frames so
/// consecutive samples abut, and a 512 px normalized frame height covering
/// 15 cm of fabric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Source frames between two retained samples
    pub frame_skip: u64,
    /// Side of a square classification tile, in normalized pixels
    pub patch_size: u32,
    pub normalized_width: u32,
    pub normalized_height: u32,
    /// τ1
    pub primary_threshold: f32,
    /// τ2
    pub neighbor_threshold: f32,
    /// Along-roll width of one rollmap window
    pub window_width_cm: f64,
    /// Lead-in shown left of each rollmap window
    pub window_margin_cm: f64,
    /// Physical height covered by one frame
    pub frame_height_cm: f64,
    /// Pixel height that `frame_height_cm` refers to
    pub frame_height_px: u32,
    /// Fixed cross-web range of the rollmap plots
    pub cross_web_min_cm: f64,
    pub cross_web_max_cm: f64,
    /// Configured line speed reported in summaries (not measured)
    pub speed: f64,
    pub camera_id: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_skip: 119,
            patch_size: 64,
            normalized_width: 768,
            normalized_height: 512,
            primary_threshold: 0.999,
            neighbor_threshold: 0.5,
            window_width_cm: 80.0,
            window_margin_cm: 5.0,
            frame_height_cm: 15.0,
            frame_height_px: 512,
            cross_web_min_cm: -2.0,
            cross_web_max_cm: 24.0,
            speed: 13.0,
            camera_id: "Cam_0".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file, or use defaults when no file is given.
    /// Fields missing from the file keep their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read pipeline config {:?}", path))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("Invalid pipeline config {:?}", path))?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.frame_skip > 0, "frame_skip must be positive");
        ensure!(self.patch_size > 0, "patch_size must be positive");
        ensure!(
            self.normalized_width >= self.patch_size && self.normalized_height >= self.patch_size,
            "normalized resolution {}x{} is smaller than one patch",
            self.normalized_width,
            self.normalized_height
        );
        ensure!(
            (0.0..=1.0).contains(&self.primary_threshold)
                && (0.0..=1.0).contains(&self.neighbor_threshold),
            "thresholds must lie in [0, 1]"
        );
        ensure!(
            self.neighbor_threshold <= self.primary_threshold,
            "neighbor threshold {} exceeds primary threshold {}",
            self.neighbor_threshold,
            self.primary_threshold
        );
        ensure!(self.window_width_cm > 0.0, "window_width_cm must be positive");
        ensure!(self.window_margin_cm >= 0.0, "window_margin_cm cannot be negative");
        ensure!(
            self.frame_height_cm > 0.0 && self.frame_height_px > 0,
            "frame height must be positive"
        );
        ensure!(
            self.cross_web_max_cm > self.cross_web_min_cm,
            "cross-web range is empty"
        );
        Ok(())
    }

    /// Ordinal of a sampled frame along the roll.
    pub fn frame_pos(&self, frame_index: u64) -> u64 {
        frame_index / self.frame_skip
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            primary: self.primary_threshold,
            neighbor: self.neighbor_threshold,
        }
    }

    pub fn geometry(&self) -> RollGeometry {
        RollGeometry::new(self.frame_height_cm, self.frame_height_px)
    }
}
