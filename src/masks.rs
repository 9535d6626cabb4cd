//! Canonical store of per-frame, per-object binary masks.

use std::collections::BTreeMap;

use image::GrayImage;
use ndarray::{Array3, ArrayView2, ArrayView3, Axis};

use crate::error::{Error, Result};

/// The masks of every tracked object on one frame.
///
/// Planes are stored `[objects, height, width]` with values in {0, 1}, in the
/// order of `object_ids`.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMasks {
    object_ids: Vec<u32>,
    planes: Array3<u8>,
}

impl FrameMasks {
    pub fn object_ids(&self) -> &[u32] {
        &self.object_ids
    }

    pub fn planes(&self) -> ArrayView3<u8> {
        self.planes.view()
    }

    /// Binary raster for one object, or None if the object is not tracked on
    /// this frame.
    pub fn plane(&self, object_id: u32) -> Option<ArrayView2<u8>> {
        let position = self.object_ids.iter().position(|&id| id == object_id)?;
        Some(self.planes.index_axis(Axis(0), position))
    }

    /// Count of set pixels for one object.
    pub fn set_pixels(&self, object_id: u32) -> Option<usize> {
        let plane = self.plane(object_id)?;
        Some(plane.iter().filter(|&&v| v == 1).count())
    }

    /// Render one object's mask as a grayscale image for quick visual checks.
    pub fn render_object(&self, object_id: u32) -> Option<GrayImage> {
        let plane = self.plane(object_id)?;
        let (height, width) = (plane.nrows() as u32, plane.ncols() as u32);
        Some(GrayImage::from_fn(width, height, |x, y| {
            let value = plane[[y as usize, x as usize]];
            image::Luma([if value == 1 { 255 } else { 0 }])
        }))
    }
}

/// In-memory mask store for one session.
///
/// A frame's entry is replaced wholesale on every write; masks from different
/// propagations are never merged in place.
#[derive(Debug)]
pub struct MaskBuffer {
    width: u32,
    height: u32,
    frames: BTreeMap<usize, FrameMasks>,
}

impl MaskBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frames: BTreeMap::new(),
        }
    }

    /// Validate, quantize and store a raw mask tensor for one frame
    ///
    /// `raw` is `[objects, height, width]` signed scores; a strictly positive
    /// value marks the pixel as belonging to the object. The plane count must
    /// match `object_ids` and the spatial dimensions must match the video.
    pub fn accept(&mut self, frame_index: usize, object_ids: &[u32], raw: &Array3<f32>) -> Result<()> {
        let (objects, height, width) = raw.dim();

        if objects != object_ids.len() {
            return Err(Error::MaskShape(format!(
                "tensor has {} planes but {} objects are tracked",
                objects,
                object_ids.len()
            )));
        }
        if (width as u32, height as u32) != (self.width, self.height) {
            return Err(Error::MaskShape(format!(
                "tensor is {}x{} but the video is {}x{}",
                width, height, self.width, self.height
            )));
        }

        let quantized = raw.mapv(|v| u8::from(v > 0.0));

        tracing::debug!(
            "Storing masks for frame {} ({} objects)",
            frame_index,
            objects
        );

        self.frames.insert(
            frame_index,
            FrameMasks {
                object_ids: object_ids.to_vec(),
                planes: quantized,
            },
        );
        Ok(())
    }

    pub fn get(&self, frame_index: usize) -> Option<&FrameMasks> {
        self.frames.get(&frame_index)
    }

    /// Iterate stored frames in ascending frame order.
    pub fn frames(&self) -> impl Iterator<Item = (usize, &FrameMasks)> {
        self.frames.iter().map(|(&index, masks)| (index, masks))
    }

    pub fn frame_indices(&self) -> Vec<usize> {
        self.frames.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Drop every stored frame. Used by session reset.
    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn raw_tensor(objects: usize, height: usize, width: usize, fill: f32) -> Array3<f32> {
        Array3::from_elem((objects, height, width), fill)
    }

    #[test]
    fn accept_quantizes_strictly_above_zero() {
        let mut buffer = MaskBuffer::new(3, 1);
        let raw = Array3::from_shape_vec((1, 1, 3), vec![-1.0, 0.0, 0.5]).unwrap();

        buffer.accept(0, &[1], &raw).unwrap();
        let plane = buffer.get(0).unwrap().plane(1).unwrap();
        assert_eq!(plane.iter().copied().collect::<Vec<_>>(), vec![0, 0, 1]);
    }

    #[test]
    fn accept_replaces_wholesale() {
        let mut buffer = MaskBuffer::new(2, 2);

        buffer.accept(4, &[1, 2], &raw_tensor(2, 2, 2, 1.0)).unwrap();
        assert_eq!(buffer.get(4).unwrap().object_ids(), &[1, 2]);

        // Re-propagation with a different object set replaces the frame entry
        buffer.accept(4, &[3], &raw_tensor(1, 2, 2, -1.0)).unwrap();
        let masks = buffer.get(4).unwrap();
        assert_eq!(masks.object_ids(), &[3]);
        assert_eq!(masks.set_pixels(3), Some(0));
        assert!(masks.plane(1).is_none());
    }

    #[test]
    fn accept_rejects_shape_mismatches() {
        let mut buffer = MaskBuffer::new(4, 4);

        let err = buffer.accept(0, &[1, 2], &raw_tensor(1, 4, 4, 1.0)).unwrap_err();
        assert!(matches!(err, Error::MaskShape(_)));

        let err = buffer.accept(0, &[1], &raw_tensor(1, 2, 2, 1.0)).unwrap_err();
        assert!(matches!(err, Error::MaskShape(_)));

        assert!(buffer.is_empty());
    }

    #[test]
    fn clear_empties_every_frame() {
        let mut buffer = MaskBuffer::new(2, 2);
        buffer.accept(0, &[1], &raw_tensor(1, 2, 2, 1.0)).unwrap();
        buffer.accept(1, &[1], &raw_tensor(1, 2, 2, 1.0)).unwrap();

        buffer.clear();
        assert!(buffer.get(0).is_none());
        assert!(buffer.get(1).is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn render_object_maps_membership_to_white() {
        let mut buffer = MaskBuffer::new(2, 1);
        let raw = Array3::from_shape_vec((1, 1, 2), vec![1.0, -1.0]).unwrap();
        buffer.accept(0, &[5], &raw).unwrap();

        let img = buffer.get(0).unwrap().render_object(5).unwrap();
        assert_eq!(img.get_pixel(0, 0)[0], 255);
        assert_eq!(img.get_pixel(1, 0)[0], 0);
    }
}
