//! Per-object pixel-intensity histograms over stored masks.
//!
//! For every frame with a recorded mask set, the decoded frame is fetched at
//! the same index and each object's masked pixels are counted into 256 exact
//! integer bins per channel. Frame decodes are independent, so they run in
//! parallel; a frame that fails to decode is skipped and enumerated rather
//! than aborting the whole computation.

use std::collections::BTreeMap;
use std::path::Path;

use image::RgbImage;
use ndarray::Array3;
use rayon::prelude::*;
use serde_json::json;

use crate::frames::{FrameSource, ImageDirSource};
use crate::masks::{FrameMasks, MaskBuffer};

pub const BINS: usize = 256;

/// Histograms for one frame: `[channels, objects, 256]` counts, channels in
/// the order R, G, B (or the single luminance channel).
#[derive(Debug, Clone, PartialEq)]
pub struct FrameHistograms {
    pub object_ids: Vec<u32>,
    pub counts: Array3<u32>,
}

/// Analytics result over a mask collection.
///
/// `bin_edges` is `None` exactly when the frame source could not be opened at
/// all; that empty signature distinguishes total failure from a partial
/// success, which instead enumerates its gaps in `skipped_frames`.
#[derive(Debug, Default)]
pub struct HistogramResult {
    pub histograms: BTreeMap<usize, FrameHistograms>,
    pub bin_edges: Option<Vec<u16>>,
    pub skipped_frames: Vec<usize>,
}

impl HistogramResult {
    /// The empty result returned when the frame source cannot be opened.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_total_failure(&self) -> bool {
        self.bin_edges.is_none()
    }

    /// Nested-array JSON shape for the upstream layer:
    /// `histograms[frame][channel][object][bin]` plus the shared bin edges.
    pub fn to_json(&self) -> serde_json::Value {
        let histograms: serde_json::Map<String, serde_json::Value> = self
            .histograms
            .iter()
            .map(|(frame, frame_histograms)| {
                let nested: Vec<Vec<Vec<u32>>> = frame_histograms
                    .counts
                    .outer_iter()
                    .map(|channel| {
                        channel
                            .outer_iter()
                            .map(|object| object.to_vec())
                            .collect()
                    })
                    .collect();
                (frame.to_string(), json!(nested))
            })
            .collect();

        json!({
            "histograms": histograms,
            "bin_edges": self.bin_edges,
            "skipped_frames": self.skipped_frames,
        })
    }
}

fn bin_edges() -> Vec<u16> {
    (0..=BINS as u16).collect()
}

/// Luminance of one RGB pixel, the same BT.601 weighting the rest of the
/// pipeline uses for color conversion.
fn luminance(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).clamp(0.0, 255.0) as u8
}

/// Compute histograms for every mask-bearing frame readable from `source`.
pub fn compute(buffer: &MaskBuffer, source: &dyn FrameSource, monochrome: bool) -> HistogramResult {
    let frames: Vec<(usize, &FrameMasks)> = buffer.frames().collect();

    tracing::debug!(
        "Computing histograms for {} frames (monochrome={})",
        frames.len(),
        monochrome
    );

    let per_frame: Vec<(usize, Option<FrameHistograms>)> = frames
        .par_iter()
        .map(|&(frame_index, masks)| {
            let frame = match source.read_frame(frame_index) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::warn!("Skipping frame {}: not decodable from source", frame_index);
                    return (frame_index, None);
                }
                Err(e) => {
                    tracing::warn!("Skipping frame {}: {}", frame_index, e);
                    return (frame_index, None);
                }
            };
            match frame_histograms(&frame, masks, monochrome) {
                Some(histograms) => (frame_index, Some(histograms)),
                None => {
                    tracing::warn!(
                        "Skipping frame {}: decoded frame does not match mask geometry",
                        frame_index
                    );
                    (frame_index, None)
                }
            }
        })
        .collect();

    let mut result = HistogramResult {
        histograms: BTreeMap::new(),
        bin_edges: Some(bin_edges()),
        skipped_frames: Vec::new(),
    };
    for (frame_index, histograms) in per_frame {
        match histograms {
            Some(h) => {
                result.histograms.insert(frame_index, h);
            }
            None => result.skipped_frames.push(frame_index),
        }
    }

    tracing::debug!(
        "Computed histograms for {} frames, {} skipped",
        result.histograms.len(),
        result.skipped_frames.len()
    );

    result
}

/// Compute histograms, opening the frame source from a path.
///
/// A source that cannot be opened at all yields the explicitly empty result
/// rather than an error, so callers can always inspect a `HistogramResult`.
pub fn compute_from_path(buffer: &MaskBuffer, video_path: &Path, monochrome: bool) -> HistogramResult {
    match ImageDirSource::open(video_path) {
        Ok(source) => compute(buffer, &source, monochrome),
        Err(e) => {
            tracing::error!("Failed to open frame source at {}: {}", video_path.display(), e);
            HistogramResult::empty()
        }
    }
}

/// Histograms for one frame, or None when frame and mask geometry disagree.
fn frame_histograms(frame: &RgbImage, masks: &FrameMasks, monochrome: bool) -> Option<FrameHistograms> {
    let (width, height) = frame.dimensions();
    let planes = masks.planes();
    let (objects, mask_height, mask_width) = planes.dim();

    if (mask_width as u32, mask_height as u32) != (width, height) {
        return None;
    }

    let channels = if monochrome { 1 } else { 3 };
    let mut counts = Array3::<u32>::zeros((channels, objects, BINS));

    for (object, plane) in planes.outer_iter().enumerate() {
        for y in 0..height as usize {
            for x in 0..width as usize {
                if plane[[y, x]] != 1 {
                    continue;
                }
                let pixel = frame.get_pixel(x as u32, y as u32);
                if monochrome {
                    let value = luminance(pixel[0], pixel[1], pixel[2]);
                    counts[[0, object, value as usize]] += 1;
                } else {
                    for channel in 0..3 {
                        counts[[channel, object, pixel[channel] as usize]] += 1;
                    }
                }
            }
        }
    }

    Some(FrameHistograms {
        object_ids: masks.object_ids().to_vec(),
        counts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::memory::MemorySource;
    use image::Rgb;
    use ndarray::Array3 as Raw;

    /// Buffer with one frame, one object, a 2x2 mask with `set` pixels on.
    fn small_buffer(set: &[(usize, usize)]) -> MaskBuffer {
        let mut raw = Raw::from_elem((1, 2, 2), -1.0f32);
        for &(y, x) in set {
            raw[[0, y, x]] = 1.0;
        }
        let mut buffer = MaskBuffer::new(2, 2);
        buffer.accept(0, &[1], &raw).unwrap();
        buffer
    }

    struct SingleFrame {
        frame: RgbImage,
    }

    impl FrameSource for SingleFrame {
        fn read_frame(&self, index: usize) -> crate::error::Result<Option<RgbImage>> {
            Ok((index == 0).then(|| self.frame.clone()))
        }

        fn properties(&self) -> crate::frames::VideoProperties {
            crate::frames::VideoProperties {
                frame_count: 1,
                fps: 30.0,
                width: self.frame.width(),
                height: self.frame.height(),
            }
        }
    }

    #[test]
    fn channel_count_follows_monochrome_flag() {
        let buffer = small_buffer(&[(0, 0)]);
        let source = SingleFrame {
            frame: RgbImage::from_pixel(2, 2, Rgb([10, 20, 30])),
        };

        let color = compute(&buffer, &source, false);
        assert_eq!(color.histograms[&0].counts.dim().0, 3);

        let mono = compute(&buffer, &source, true);
        assert_eq!(mono.histograms[&0].counts.dim().0, 1);
    }

    #[test]
    fn bin_sums_equal_masked_pixel_counts() {
        let buffer = small_buffer(&[(0, 0), (1, 1), (1, 0)]);
        let source = SingleFrame {
            frame: RgbImage::from_pixel(2, 2, Rgb([7, 99, 201])),
        };

        let result = compute(&buffer, &source, false);
        let counts = &result.histograms[&0].counts;
        for channel in 0..3 {
            let sum: u32 = (0..BINS).map(|bin| counts[[channel, 0, bin]]).sum();
            assert_eq!(sum, 3);
        }
        // All three masked pixels share one intensity per channel
        assert_eq!(counts[[0, 0, 7]], 3);
        assert_eq!(counts[[1, 0, 99]], 3);
        assert_eq!(counts[[2, 0, 201]], 3);
    }

    #[test]
    fn empty_mask_yields_all_zero_rows() {
        let buffer = small_buffer(&[]);
        let source = SingleFrame {
            frame: RgbImage::from_pixel(2, 2, Rgb([50, 50, 50])),
        };

        let result = compute(&buffer, &source, false);
        let counts = &result.histograms[&0].counts;
        assert!(counts.iter().all(|&c| c == 0));
    }

    #[test]
    fn monochrome_uses_luminance() {
        let buffer = small_buffer(&[(0, 0)]);
        let source = SingleFrame {
            frame: RgbImage::from_pixel(2, 2, Rgb([255, 0, 0])),
        };

        let result = compute(&buffer, &source, true);
        let counts = &result.histograms[&0].counts;
        // 0.299 * 255 = 76.2
        assert_eq!(counts[[0, 0, 76]], 1);
    }

    #[test]
    fn decode_gap_yields_partial_result() {
        let mut source = MemorySource::new(10, 2, 2);
        source.missing.insert(7);

        let mut buffer = MaskBuffer::new(2, 2);
        for frame in 0..10 {
            buffer
                .accept(frame, &[1], &Raw::from_elem((1, 2, 2), 1.0f32))
                .unwrap();
        }

        let result = compute(&buffer, &source, false);
        assert!(!result.is_total_failure());
        assert_eq!(result.skipped_frames, vec![7]);
        assert_eq!(result.histograms.len(), 9);
        assert!(!result.histograms.contains_key(&7));
        for frame in (0..7).chain(8..10) {
            assert!(result.histograms.contains_key(&frame));
        }
    }

    #[test]
    fn unopenable_source_is_the_empty_signature() {
        let buffer = MaskBuffer::new(2, 2);
        let result = compute_from_path(&buffer, Path::new("/nonexistent/frames"), false);
        assert!(result.is_total_failure());
        assert!(result.histograms.is_empty());
        assert!(result.bin_edges.is_none());
    }

    #[test]
    fn bin_edges_are_the_257_levels() {
        let edges = bin_edges();
        assert_eq!(edges.len(), 257);
        assert_eq!(edges[0], 0);
        assert_eq!(edges[256], 256);
    }

    #[test]
    fn json_export_nests_frame_channel_object_bin() {
        let buffer = small_buffer(&[(0, 0)]);
        let source = SingleFrame {
            frame: RgbImage::from_pixel(2, 2, Rgb([1, 2, 3])),
        };

        let value = compute(&buffer, &source, false).to_json();
        let nested = &value["histograms"]["0"];
        assert_eq!(nested.as_array().unwrap().len(), 3);
        assert_eq!(nested[0].as_array().unwrap().len(), 1);
        assert_eq!(nested[0][0].as_array().unwrap().len(), BINS);
    }
}
