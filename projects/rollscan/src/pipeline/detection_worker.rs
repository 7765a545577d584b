use crate::artifacts::DefectRecord;
use crate::config::PipelineConfig;
use crate::pipeline::annotate::{annotate_frame, publish};
use crate::pipeline::classifier::DefectClassifier;
use crate::pipeline::codec::encode_jpeg_base64;
use crate::pipeline::geometry::PatchGrid;
use crate::pipeline::orchestrator::PollWorker;
use crate::pipeline::rollmap::RollmapGenerator;
use crate::pipeline::slicing::generate_patches;
use crate::pipeline::two_pass::{FrameDefects, TwoPassDetector};
use crate::pipeline::types::{FrameFile, Patch};
use crate::session::{current_session, list_frames, SessionContext, SessionWatch};
use anyhow::{anyhow, Context, Result};
use opencv::core::{self, Mat, Size, Vector};
use opencv::imgcodecs::{imread, IMREAD_COLOR};
use opencv::imgproc::{cvt_color_def, resize, COLOR_BGR2GRAY, INTER_LINEAR};
use opencv::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Grayscale, replicate to three channels, resize to the canonical resolution.
pub fn normalize_frame(image: &Mat, width: u32, height: u32) -> Result<Mat> {
    let mut gray = Mat::default();
    cvt_color_def(image, &mut gray, COLOR_BGR2GRAY)?;

    let mut channels = Vector::<Mat>::new();
    for _ in 0..3 {
        channels.push(gray.try_clone()?);
    }
    let mut merged = Mat::default();
    core::merge(&channels, &mut merged)?;

    let mut resized = Mat::default();
    resize(
        &merged,
        &mut resized,
        Size::new(width as i32, height as i32),
        0.0,
        0.0,
        INTER_LINEAR,
    )?;
    Ok(resized)
}

/// Turn a frame's accepted defects into log records.
pub fn build_records(
    config: &PipelineConfig,
    frame_index: u64,
    grid: &PatchGrid,
    patches: &[Patch],
    found: &FrameDefects,
    time: i64,
) -> Result<Vec<DefectRecord>> {
    let frame_pos = config.frame_pos(frame_index);
    found
        .defects
        .iter()
        .map(|d| {
            let patch = grid
                .index_of(d.cell)
                .and_then(|i| patches.get(i))
                .ok_or_else(|| anyhow!("No patch for cell {:?}", d.cell))?;
            Ok(DefectRecord {
                frame_pos,
                frame_index,
                camera_id: config.camera_id.clone(),
                class: d.class,
                confidence: d.confidence,
                pos_x: d.coords.x1 as u32,
                pos_y: d.coords.y1 as u32,
                capture_unix_time: time,
                thumbnail: encode_jpeg_base64(&patch.image)?,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameOutcome {
    pub frame_index: u64,
    pub patches: usize,
    pub defects: usize,
    /// Records were already in the log from an interrupted earlier run
    pub replayed: bool,
    pub elapsed: Duration,
}

/// Detects, records, annotates and retires one queued frame per cycle.
pub struct DetectionWorker {
    session: SessionWatch,
    config: Arc<PipelineConfig>,
    classifier: Box<dyn DefectClassifier>,
    detector: TwoPassDetector,
    rollmap: RollmapGenerator,
}

impl DetectionWorker {
    pub fn new(
        session: SessionWatch,
        config: Arc<PipelineConfig>,
        classifier: Box<dyn DefectClassifier>,
    ) -> Self {
        Self {
            session,
            detector: TwoPassDetector::new(config.thresholds()),
            rollmap: RollmapGenerator::new(&config),
            config,
            classifier,
        }
    }

    /// Process one frame. On any error before the log append the frame is
    /// left in place for a later cycle.
    ///
    /// A frame whose index is not above the last logged one is treated as a
    /// replay and is not appended again. This relies on the extractor filling
    /// a session from a single video, so indices only grow.
    pub fn process_frame(
        &mut self,
        ctx: &SessionContext,
        frame: &FrameFile,
    ) -> Result<FrameOutcome> {
        let start = Instant::now();
        let path = frame
            .path
            .to_str()
            .ok_or_else(|| anyhow!("Non UTF-8 frame path: {:?}", frame.path))?;
        let image = imread(path, IMREAD_COLOR)?;
        if image.empty() {
            return Err(anyhow!("Frame {} is not readable yet", frame.index));
        }

        let normalized = normalize_frame(
            &image,
            self.config.normalized_width,
            self.config.normalized_height,
        )?;
        let (grid, patches) = generate_patches(&normalized, self.config.patch_size)?;

        let found = self
            .detector
            .detect(self.classifier.as_mut(), &grid, &patches)
            .with_context(|| format!("Classification failed for frame {}", frame.index))?;
        tracing::debug!(
            "Frame {}: {} primary, {} neighbor defects from {} neighbor batches",
            frame.index,
            found.primary_count,
            found.neighbor_count(),
            found.neighbor_batches
        );

        let time = chrono::Utc::now().timestamp();
        let records = build_records(&self.config, frame.index, &grid, &patches, &found, time)?;

        let store = ctx.store();
        let replayed = store
            .last_frame_index()?
            .is_some_and(|last| last >= frame.index);
        if !replayed {
            store.append(&records)?;
        }

        if !records.is_empty() {
            if let Err(e) = self.rollmap.regenerate(&store, &ctx.rollmaps_dir) {
                tracing::error!(
                    "Failed to regenerate rollmap for session {}: {:#}",
                    ctx.id,
                    e
                );
            }
        }

        let annotated = annotate_frame(&normalized, &found.defects)?;
        publish(&annotated, frame, &ctx.ready_dir)?;

        Ok(FrameOutcome {
            frame_index: frame.index,
            patches: patches.len(),
            defects: records.len(),
            replayed,
            elapsed: start.elapsed(),
        })
    }
}

impl PollWorker for DetectionWorker {
    fn name(&self) -> &'static str {
        "detector"
    }

    fn poll(&mut self) -> Result<()> {
        let Some(ctx) = current_session(&self.session) else {
            return Ok(());
        };
        let Some(frame) = list_frames(&ctx.frames_dir)?.into_iter().next() else {
            return Ok(());
        };

        let outcome = self.process_frame(&ctx, &frame)?;
        if outcome.replayed {
            tracing::warn!(
                "Frame {} was already in the defect log, finished without appending {} records",
                outcome.frame_index,
                outcome.defects
            );
        }
        tracing::info!(
            "Processed frame {}: {} patches, {} defects, ratio {:.4}, {:.0} ms",
            outcome.frame_index,
            outcome.patches,
            outcome.defects,
            outcome.defects as f64 / outcome.patches.max(1) as f64,
            outcome.elapsed.as_secs_f64() * 1000.0
        );
        Ok(())
    }
}
