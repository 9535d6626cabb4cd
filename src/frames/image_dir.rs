use super::{FrameSource, VideoProperties};
use crate::error::{Error, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};

const DEFAULT_FPS: f64 = 30.0;

/// Frame source backed by a directory of numbered image files.
///
/// The upstream layer extracts videos into per-frame images; the frame index
/// is the position of the file in lexicographic order, so zero-padded names
/// (`frame_00042.png`) decode to the index the annotation UI shows.
#[derive(Debug)]
pub struct ImageDirSource {
    frames: Vec<PathBuf>,
    props: VideoProperties,
}

impl ImageDirSource {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::open_with_fps(dir, DEFAULT_FPS)
    }

    /// Open a frame directory, probing dimensions from the first frame.
    ///
    /// Image sequences carry no timing metadata, so the caller supplies the
    /// source fps when it matters for reporting.
    pub fn open_with_fps<P: AsRef<Path>>(dir: P, fps: f64) -> Result<Self> {
        let dir = dir.as_ref();
        tracing::info!("Opening frame directory at {}", dir.display());

        let entries = std::fs::read_dir(dir).map_err(|e| Error::VideoUnreadable {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut frames: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("png" | "jpg" | "jpeg" | "bmp")
                )
            })
            .collect();
        frames.sort();

        if frames.is_empty() {
            return Err(Error::VideoUnreadable {
                path: dir.to_path_buf(),
                reason: "no frame images found".into(),
            });
        }

        // Probe geometry from the first frame
        let first = image::open(&frames[0])
            .map_err(|e| Error::VideoUnreadable {
                path: frames[0].clone(),
                reason: e.to_string(),
            })?
            .to_rgb8();
        let (width, height) = first.dimensions();

        let props = VideoProperties {
            frame_count: frames.len(),
            fps,
            width,
            height,
        };

        tracing::info!(
            "Frame directory opened: {} frames at {}x{}",
            props.frame_count,
            width,
            height
        );

        Ok(Self { frames, props })
    }
}

impl FrameSource for ImageDirSource {
    fn read_frame(&self, index: usize) -> Result<Option<RgbImage>> {
        let Some(path) = self.frames.get(index) else {
            return Ok(None);
        };

        match image::open(path) {
            Ok(img) => Ok(Some(img.to_rgb8())),
            Err(e) => {
                tracing::warn!("Failed to decode frame {} at {}: {}", index, path.display(), e);
                Ok(None)
            }
        }
    }

    fn properties(&self) -> VideoProperties {
        self.props
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn write_frame(dir: &Path, name: &str, w: u32, h: u32) {
        let img = RgbImage::from_pixel(w, h, Rgb([10, 20, 30]));
        img.save(dir.join(name)).unwrap();
    }

    #[test]
    fn open_probes_properties() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path(), "frame_00000.png", 8, 6);
        write_frame(dir.path(), "frame_00001.png", 8, 6);

        let source = ImageDirSource::open(dir.path()).unwrap();
        let props = source.properties();
        assert_eq!(props.frame_count, 2);
        assert_eq!((props.width, props.height), (8, 6));
    }

    #[test]
    fn read_past_end_is_none() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path(), "frame_00000.png", 4, 4);

        let source = ImageDirSource::open(dir.path()).unwrap();
        assert!(source.read_frame(0).unwrap().is_some());
        assert!(source.read_frame(1).unwrap().is_none());
    }

    #[test]
    fn open_empty_dir_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let err = ImageDirSource::open(dir.path()).unwrap_err();
        assert!(matches!(err, Error::VideoUnreadable { .. }));
    }
}
