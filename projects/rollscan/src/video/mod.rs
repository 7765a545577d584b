pub mod opencv_reader;

use anyhow::Result;
use opencv::core::Mat;

/// Sequential frame source.
pub trait VideoReader: Send {
    /// Frame count reported by the container. May be an estimate.
    fn frame_count(&self) -> Result<usize>;
    fn source_fps(&self) -> Result<f64>;
    /// Decode the next frame, `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Mat>>;
}
