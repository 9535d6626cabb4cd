mod onnx;
mod preprocess;

pub use onnx::OnnxEngine;
pub use preprocess::Preprocessor;

use std::path::Path;

use ndarray::Array3;

use crate::error::Result;
use crate::prompts::PromptGroup;

/// Memory offload options passed when binding a video, for long videos that
/// would not fit engine state in device memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryOffload {
    pub video_to_cpu: bool,
    pub state_to_cpu: bool,
}

/// One engine inference result: raw per-object mask planes for one frame.
///
/// Values are signed scores; strictly positive means the pixel belongs to the
/// object. Quantization to {0,1} happens in the mask buffer.
#[derive(Debug, Clone)]
pub struct FramePrediction {
    pub frame_index: usize,
    /// Ascending object ids, one per plane.
    pub object_ids: Vec<u32>,
    /// `[objects, height, width]` at video resolution.
    pub masks: Array3<f32>,
}

/// Trait for promptable video segmentation engines
///
/// An engine holds one bound video and one internal inference state at a
/// time. Propagation is a stateful cursor: `begin_propagation` positions it,
/// `next_prediction` steps it, and a new propagation always starts a fresh
/// stream. Allows swapping the ONNX backend for a scripted engine in tests.
pub trait SegmentationEngine: Send {
    /// Bind a video to this engine, initializing its inference state
    ///
    /// Call this once per session, and again only after `reset`.
    fn bind(&mut self, video_path: &Path, offload: MemoryOffload) -> Result<()>;

    /// Submit the complete point set for one (frame, object) pair
    ///
    /// Replace semantics: any points previously submitted for this pair are
    /// discarded. Returns the resulting masks for every tracked object on
    /// that frame.
    fn submit_points(&mut self, group: &PromptGroup) -> Result<FramePrediction>;

    /// Start a sequential mask-inference stream at `start_frame`
    ///
    /// The stream covers at most `max_frames` frames when given, otherwise it
    /// runs to the end of the video.
    fn begin_propagation(&mut self, start_frame: usize, max_frames: Option<usize>) -> Result<()>;

    /// Step the propagation cursor
    ///
    /// # Returns
    /// * `Ok(Some(prediction))` - the next frame, in strictly increasing order
    /// * `Ok(None)` - the stream is exhausted
    fn next_prediction(&mut self) -> Result<Option<FramePrediction>>;

    /// Drop an in-flight propagation cursor without touching prompt state
    ///
    /// Call this when a stream is abandoned before exhaustion so the next
    /// `begin_propagation` starts clean.
    fn abort_propagation(&mut self);

    /// Reset internal inference state
    ///
    /// Discards accumulated prompts, memory and any cursor while keeping the
    /// video binding.
    fn reset(&mut self) -> Result<()>;

    /// Whether a video is currently bound
    fn is_bound(&self) -> bool;
}

#[cfg(test)]
pub(crate) use stub::{test_stub, StubEngine};

#[cfg(test)]
mod stub {
    use super::*;
    use std::collections::BTreeSet;

    /// Scripted engine for unit tests: masks are all-foreground planes.
    #[derive(Default)]
    pub(crate) struct StubEngine {
        pub frame_count: usize,
        pub width: u32,
        pub height: u32,
        pub bound: bool,
        pub objects: BTreeSet<u32>,
        cursor: Option<(usize, usize)>,
    }

    pub(crate) fn test_stub() -> StubEngine {
        StubEngine::default()
    }

    impl StubEngine {
        pub fn with_video(frame_count: usize, width: u32, height: u32) -> Self {
            Self {
                frame_count,
                width,
                height,
                ..Self::default()
            }
        }

        fn prediction(&self, frame_index: usize) -> FramePrediction {
            let ids: Vec<u32> = self.objects.iter().copied().collect();
            let masks = Array3::from_elem(
                (ids.len(), self.height as usize, self.width as usize),
                1.0,
            );
            FramePrediction {
                frame_index,
                object_ids: ids,
                masks,
            }
        }
    }

    impl SegmentationEngine for StubEngine {
        fn bind(&mut self, _video_path: &Path, _offload: MemoryOffload) -> Result<()> {
            self.bound = true;
            Ok(())
        }

        fn submit_points(&mut self, group: &PromptGroup) -> Result<FramePrediction> {
            self.objects.insert(group.object_id);
            Ok(self.prediction(group.frame_index))
        }

        fn begin_propagation(&mut self, start_frame: usize, max_frames: Option<usize>) -> Result<()> {
            let end = match max_frames {
                Some(max) => (start_frame + max).min(self.frame_count),
                None => self.frame_count,
            };
            self.cursor = Some((start_frame, end));
            Ok(())
        }

        fn next_prediction(&mut self) -> Result<Option<FramePrediction>> {
            let Some((next, end)) = self.cursor else {
                return Ok(None);
            };
            if next >= end {
                self.cursor = None;
                return Ok(None);
            }
            self.cursor = Some((next + 1, end));
            Ok(Some(self.prediction(next)))
        }

        fn abort_propagation(&mut self) {
            self.cursor = None;
        }

        fn reset(&mut self) -> Result<()> {
            self.objects.clear();
            self.cursor = None;
            Ok(())
        }

        fn is_bound(&self) -> bool {
            self.bound
        }
    }
}
