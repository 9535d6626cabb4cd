mod image_dir;

pub use image_dir::ImageDirSource;

use crate::error::Result;
use image::RgbImage;

/// Probed properties of a bound video.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoProperties {
    pub frame_count: usize,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

/// Trait for decoded-frame providers
pub trait FrameSource: Send + Sync {
    /// Read the decoded frame at `index`
    ///
    /// # Returns
    /// * `Ok(Some(frame))` - the RGB frame at that index
    /// * `Ok(None)` - past the end of the stream, or the frame could not be
    ///   decoded (a gap); callers decide whether a gap is tolerable
    fn read_frame(&self, index: usize) -> Result<Option<RgbImage>>;

    /// Get the properties probed when the source was opened
    fn properties(&self) -> VideoProperties;
}
