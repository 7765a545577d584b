// Frame extractor: samples uploaded videos into the session's frame queue

use crate::artifacts::ExtractionRecord;
use crate::config::PipelineConfig;
use crate::pipeline::codec::write_image_atomic;
use crate::pipeline::orchestrator::PollWorker;
use crate::pipeline::types::FrameFile;
use crate::session::{current_session, list_videos, SessionContext, SessionWatch};
use crate::video::opencv_reader::OpencvReader;
use crate::video::VideoReader;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use opencv::core::Mat;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

pub type ReaderFactory = Box<dyn Fn(&Path) -> Result<Box<dyn VideoReader>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleStats {
    pub decoded: u64,
    pub sampled: u64,
}

/// Decode `reader` to the end and hand every `frame_skip`-th frame to `sink`,
/// starting with frame 0.
pub fn sample_frames<R: VideoReader + ?Sized>(
    reader: &mut R,
    frame_skip: u64,
    mut sink: impl FnMut(u64, &Mat) -> Result<()>,
) -> Result<SampleStats> {
    if frame_skip == 0 {
        bail!("frame_skip must be positive");
    }

    let mut stats = SampleStats::default();
    while let Some(frame) = reader.next_frame()? {
        let index = stats.decoded;
        if index % frame_skip == 0 {
            sink(index, &frame)?;
            stats.sampled += 1;
        }
        stats.decoded += 1;
    }
    Ok(stats)
}

pub struct FrameExtractor {
    session: SessionWatch,
    config: Arc<PipelineConfig>,
    open: ReaderFactory,
}

impl FrameExtractor {
    pub fn new(session: SessionWatch, config: Arc<PipelineConfig>) -> Self {
        Self::with_reader(
            session,
            config,
            Box::new(|path: &Path| -> Result<Box<dyn VideoReader>> {
                Ok(Box::new(OpencvReader::new(path)?))
            }),
        )
    }

    pub fn with_reader(
        session: SessionWatch,
        config: Arc<PipelineConfig>,
        open: ReaderFactory,
    ) -> Self {
        Self {
            session,
            config,
            open,
        }
    }

    /// Sample one video into `frames/`. The video is removed only when every
    /// sampled frame was written.
    ///
    /// Frame indices restart at 0 for each video while the defect log only
    /// accepts growing indices, so a session takes a single video. Once one
    /// has been extracted any further video is refused and left in place.
    pub fn extract_video(&self, ctx: &SessionContext, video: &Path) -> Result<SampleStats> {
        let marker = ctx.extraction_record();
        if marker.exists() {
            bail!(
                "Session {} already holds an extracted video, refusing {:?}",
                ctx.id,
                video
            );
        }

        let start = Instant::now();
        let mut reader =
            (self.open)(video).with_context(|| format!("Failed to open video {:?}", video))?;
        fs::create_dir_all(&ctx.frames_dir)?;
        tracing::debug!(
            "Sampling {:?}: {} frames reported at {:.2} fps, keeping 1 in {}",
            video,
            reader.frame_count()?,
            reader.source_fps()?,
            self.config.frame_skip
        );

        let stats = sample_frames(reader.as_mut(), self.config.frame_skip, |index, frame| {
            write_image_atomic(&ctx.frames_dir.join(FrameFile::file_name(index)), frame)
        })
        .with_context(|| format!("Failed to extract frames from {:?}", video))?;

        if stats.decoded == 0 {
            bail!("No frames could be decoded from {:?}", video);
        }

        drop(reader);
        fs::remove_file(video)
            .with_context(|| format!("Failed to remove extracted video {:?}", video))?;

        let record = ExtractionRecord {
            video: video
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            decoded: stats.decoded,
            sampled: stats.sampled,
            extracted_at: Utc::now(),
        };
        fs::write(&marker, serde_json::to_string_pretty(&record)?)
            .with_context(|| format!("Failed to write {:?}", marker))?;

        tracing::info!(
            "Extracted {} of {} frames from {:?} in {:.2}s",
            stats.sampled,
            stats.decoded,
            video.file_name().unwrap_or_default(),
            start.elapsed().as_secs_f64()
        );
        Ok(stats)
    }
}

impl PollWorker for FrameExtractor {
    fn name(&self) -> &'static str {
        "extractor"
    }

    fn poll(&mut self) -> Result<()> {
        let Some(ctx) = current_session(&self.session) else {
            return Ok(());
        };
        let Some(video) = list_videos(&ctx.root).into_iter().next() else {
            return Ok(());
        };
        self.extract_video(&ctx, &video)?;
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};

    /// Produces `total` small solid frames.
    pub struct SyntheticReader {
        pub total: u64,
        pub emitted: u64,
    }

    impl SyntheticReader {
        pub fn new(total: u64) -> Self {
            Self { total, emitted: 0 }
        }
    }

    impl VideoReader for SyntheticReader {
        fn frame_count(&self) -> Result<usize> {
            Ok(self.total as usize)
        }

        fn source_fps(&self) -> Result<f64> {
            Ok(60.0)
        }

        fn next_frame(&mut self) -> Result<Option<Mat>> {
            if self.emitted == self.total {
                return Ok(None);
            }
            self.emitted += 1;
            let shade = (self.emitted % 256) as f64;
            Ok(Some(Mat::new_rows_cols_with_default(
                16,
                24,
                CV_8UC3,
                Scalar::all(shade),
            )?))
        }
    }
}
