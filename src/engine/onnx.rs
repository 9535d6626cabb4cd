use super::preprocess::Preprocessor;
use super::{FramePrediction, MemoryOffload, SegmentationEngine};
use crate::error::{Error, Result};
use crate::frames::{FrameSource, ImageDirSource, VideoProperties};
use crate::prompts::PromptGroup;
use ndarray::{Array3, Array4, IxDyn};
use ort::{GraphOptimizationLevel, Session};
use std::collections::BTreeMap;
use std::path::Path;

/// Channel count of the spatial memory tensor.
const MEMORY_CHANNELS: usize = 64;

#[derive(Clone, Copy)]
struct Cursor {
    next: usize,
    end: usize,
}

/// Promptable segmentation engine backed by a single ONNX graph
///
/// The graph takes a frame, the prompt point tensors and a spatial memory
/// bank, and emits the object's mask scores plus the updated memory. One
/// memory bank is carried per tracked object, so temporal consistency is
/// maintained across frames during propagation.
pub struct OnnxEngine {
    session: Session,
    preprocessor: Preprocessor,
    model_width: u32,
    model_height: u32,

    source: Option<Box<dyn FrameSource>>,
    props: Option<VideoProperties>,

    // Per-object memory banks, updated after each inference and fed back in
    // the next frame. Keyed ascending so plane order is deterministic.
    memories: BTreeMap<u32, Array4<f32>>,

    cursor: Option<Cursor>,

    // Downsample ratio for the memory bank
    downsample_ratio: f32,
}

impl OnnxEngine {
    /// Create an engine from an ONNX file
    ///
    /// # Default Configuration
    /// - Input size: 1024x1024
    /// - Downsample ratio: 0.25 (memory banks are 1/4 of input resolution)
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!("Loading segmentation model from {}", path.display());

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(path)
            .map_err(|e| Error::Engine(format!("failed to load model from {}: {e}", path.display())))?;

        tracing::info!("Segmentation model loaded successfully");

        let model_width = 1024;
        let model_height = 1024;
        let preprocessor = Preprocessor::new(model_width, model_height);

        Ok(Self {
            session,
            preprocessor,
            model_width,
            model_height,
            source: None,
            props: None,
            memories: BTreeMap::new(),
            cursor: None,
            downsample_ratio: 0.25,
        })
    }

    fn zero_memory(&self) -> Array4<f32> {
        let h = (self.model_height as f32 * self.downsample_ratio) as usize;
        let w = (self.model_width as f32 * self.downsample_ratio) as usize;

        tracing::debug!("Initializing memory bank at {}x{}", w, h);

        Array4::zeros((1, MEMORY_CHANNELS, h, w))
    }

    fn props(&self) -> Result<VideoProperties> {
        self.props.ok_or(Error::SessionNotInitialized)
    }

    fn read_bound_frame(&self, index: usize) -> Result<image::RgbImage> {
        let source = self.source.as_ref().ok_or(Error::SessionNotInitialized)?;
        source
            .read_frame(index)?
            .ok_or_else(|| Error::Engine(format!("frame {index} unavailable from bound video")))
    }

    /// Run one inference step for one object on an already-preprocessed frame,
    /// returning its mask plane at video resolution.
    fn infer_object(
        &mut self,
        frame_tensor: &Array4<f32>,
        object_id: u32,
        group: Option<&PromptGroup>,
        props: VideoProperties,
    ) -> Result<Vec<f32>> {
        let (coords, labels) = self
            .preprocessor
            .encode_points(group, props.width, props.height);

        let memory = match self.memories.remove(&object_id) {
            Some(memory) => memory,
            None => self.zero_memory(),
        };

        let _infer_span = tracing::debug_span!("inference", object_id).entered();
        let outputs = self.session.run(ort::inputs![
            frame_tensor.view(),
            coords.view(),
            labels.view(),
            memory.view()
        ]?)?;

        // Outputs: mask scores [1, 1, h, w], updated memory [1, C, h', w']
        let scores = outputs[0]
            .try_extract_tensor::<f32>()?
            .view()
            .to_owned()
            .into_dimensionality::<IxDyn>()?;
        let updated = outputs[1]
            .try_extract_tensor::<f32>()?
            .view()
            .to_owned()
            .into_dimensionality()?;
        drop(outputs);

        self.memories.insert(object_id, updated);

        let shape = scores.shape().to_vec();
        let (plane_height, plane_width) = (shape[shape.len() - 2], shape[shape.len() - 1]);
        let flat: Vec<f32> = scores.iter().copied().collect();

        Preprocessor::upscale_plane(
            &flat,
            plane_width as u32,
            plane_height as u32,
            props.width,
            props.height,
        )
    }

    /// Infer every tracked object on one frame and stack the planes.
    fn predict_frame(
        &mut self,
        frame_index: usize,
        prompted: Option<&PromptGroup>,
        props: VideoProperties,
    ) -> Result<FramePrediction> {
        let frame = self.read_bound_frame(frame_index)?;
        let frame_tensor = self.preprocessor.preprocess(&frame)?;

        let ids: Vec<u32> = self.memories.keys().copied().collect();
        let mut planes = Vec::with_capacity(ids.len() * (props.width * props.height) as usize);
        for &id in &ids {
            let group = prompted.filter(|g| g.object_id == id);
            planes.extend(self.infer_object(&frame_tensor, id, group, props)?);
        }

        let masks = Array3::from_shape_vec(
            (ids.len(), props.height as usize, props.width as usize),
            planes,
        )?;

        Ok(FramePrediction {
            frame_index,
            object_ids: ids,
            masks,
        })
    }
}

impl SegmentationEngine for OnnxEngine {
    fn bind(&mut self, video_path: &Path, offload: MemoryOffload) -> Result<()> {
        let source = ImageDirSource::open(video_path)?;
        let props = source.properties();

        tracing::info!(
            "Engine bound to {} ({} frames at {}x{}), offload: video_to_cpu={}, state_to_cpu={}",
            video_path.display(),
            props.frame_count,
            props.width,
            props.height,
            offload.video_to_cpu,
            offload.state_to_cpu
        );

        self.source = Some(Box::new(source));
        self.props = Some(props);
        self.memories.clear();
        self.cursor = None;
        Ok(())
    }

    fn submit_points(&mut self, group: &PromptGroup) -> Result<FramePrediction> {
        let _span = tracing::debug_span!("submit_points").entered();
        let props = self.props()?;

        // Register the object before predicting so its plane is included
        if !self.memories.contains_key(&group.object_id) {
            let memory = self.zero_memory();
            self.memories.insert(group.object_id, memory);
        }

        self.predict_frame(group.frame_index, Some(group), props)
    }

    fn begin_propagation(&mut self, start_frame: usize, max_frames: Option<usize>) -> Result<()> {
        let props = self.props()?;

        if self.memories.is_empty() {
            return Err(Error::Engine("no prompts submitted before propagation".into()));
        }

        let end = match max_frames {
            Some(max) => (start_frame + max).min(props.frame_count),
            None => props.frame_count,
        };
        if start_frame >= end {
            tracing::warn!(
                "Propagation start {} is past the last frame {}; stream will be empty",
                start_frame,
                props.frame_count
            );
        }

        tracing::debug!("Starting propagation stream over frames {}..{}", start_frame, end);
        self.cursor = Some(Cursor {
            next: start_frame,
            end,
        });
        Ok(())
    }

    fn next_prediction(&mut self) -> Result<Option<FramePrediction>> {
        let props = self.props()?;
        let Some(cursor) = self.cursor else {
            return Ok(None);
        };
        if cursor.next >= cursor.end {
            self.cursor = None;
            return Ok(None);
        }

        let index = cursor.next;
        let prediction = self.predict_frame(index, None, props)?;

        self.cursor = if index + 1 >= cursor.end {
            None
        } else {
            Some(Cursor {
                next: index + 1,
                end: cursor.end,
            })
        };

        Ok(Some(prediction))
    }

    fn abort_propagation(&mut self) {
        if self.cursor.take().is_some() {
            tracing::debug!("Propagation cursor dropped before exhaustion");
        }
    }

    fn reset(&mut self) -> Result<()> {
        tracing::info!("Resetting engine state");
        self.memories.clear();
        self.cursor = None;
        Ok(())
    }

    fn is_bound(&self) -> bool {
        self.source.is_some()
    }
}
