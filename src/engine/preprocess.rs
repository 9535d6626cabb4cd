use crate::error::Result;
use crate::prompts::PromptGroup;
use image::{imageops, GrayImage, RgbImage};
use ndarray::{Array2, Array3, Array4};

/// Padding entry for point tensors when an object has no new points: the
/// decoder ignores coordinates carrying this label.
pub const PAD_LABEL: f32 = -1.0;

/// Preprocessor for converting frames and prompts into model tensors
pub struct Preprocessor {
    target_width: u32,
    target_height: u32,
}

impl Preprocessor {
    pub fn new(target_width: u32, target_height: u32) -> Self {
        Self {
            target_width,
            target_height,
        }
    }

    /// Preprocess an RGB frame into a normalized NCHW tensor
    ///
    /// Steps:
    /// 1. Resize to model dimensions
    /// 2. Convert to float and normalize to [0, 1]
    /// 3. Transpose from HWC to NCHW format
    ///
    /// Returns: Array4<f32> with shape [1, 3, height, width]
    pub fn preprocess(&self, frame: &RgbImage) -> Result<Array4<f32>> {
        let _span = tracing::debug_span!("preprocess").entered();

        let resized = if frame.dimensions() != (self.target_width, self.target_height) {
            imageops::resize(
                frame,
                self.target_width,
                self.target_height,
                imageops::FilterType::Lanczos3,
            )
        } else {
            frame.clone()
        };

        let (width, height) = resized.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

        for y in 0..height {
            for x in 0..width {
                let pixel = resized.get_pixel(x, y);

                tensor[[0, 0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
                tensor[[0, 1, y as usize, x as usize]] = pixel[1] as f32 / 255.0;
                tensor[[0, 2, y as usize, x as usize]] = pixel[2] as f32 / 255.0;
            }
        }

        Ok(tensor)
    }

    /// Encode a prompt group into coordinate and label tensors
    ///
    /// Pixel coordinates are scaled from video space into model space. An
    /// empty group encodes as a single padding point so the tensors keep a
    /// non-zero point axis.
    ///
    /// Returns: coordinates [1, n, 2] and labels [1, n]
    pub fn encode_points(
        &self,
        group: Option<&PromptGroup>,
        video_width: u32,
        video_height: u32,
    ) -> (Array3<f32>, Array2<f32>) {
        let scale_x = self.target_width as f32 / video_width as f32;
        let scale_y = self.target_height as f32 / video_height as f32;

        let points = group.map(|g| g.points.as_slice()).unwrap_or(&[]);
        if points.is_empty() {
            let mut coords = Array3::<f32>::zeros((1, 1, 2));
            coords[[0, 0, 0]] = 0.0;
            coords[[0, 0, 1]] = 0.0;
            let labels = Array2::<f32>::from_elem((1, 1), PAD_LABEL);
            return (coords, labels);
        }

        let mut coords = Array3::<f32>::zeros((1, points.len(), 2));
        let mut labels = Array2::<f32>::zeros((1, points.len()));
        for (i, point) in points.iter().enumerate() {
            coords[[0, i, 0]] = point.x * scale_x;
            coords[[0, i, 1]] = point.y * scale_y;
            labels[[0, i]] = point.label.to_wire() as f32;
        }

        (coords, labels)
    }

    /// Upscale one low-resolution mask plane to video resolution
    ///
    /// The plane carries signed scores; it is binarized at zero first, then
    /// resized with nearest-neighbor so the mask edge stays crisp and no
    /// interpolated halo flips the sign. Output values are exactly 0.0 or 1.0.
    pub fn upscale_plane(
        plane: &[f32],
        plane_width: u32,
        plane_height: u32,
        target_width: u32,
        target_height: u32,
    ) -> Result<Vec<f32>> {
        let _span = tracing::debug_span!("postprocess").entered();

        if plane_width == target_width && plane_height == target_height {
            return Ok(plane.iter().map(|&v| if v > 0.0 { 1.0 } else { 0.0 }).collect());
        }

        let gray_image = GrayImage::from_fn(plane_width, plane_height, |x, y| {
            let idx = (y * plane_width + x) as usize;
            image::Luma([if plane[idx] > 0.0 { 255u8 } else { 0u8 }])
        });

        let resized = imageops::resize(
            &gray_image,
            target_width,
            target_height,
            imageops::FilterType::Nearest,
        );

        Ok(resized
            .pixels()
            .map(|p| if p[0] > 0 { 1.0 } else { 0.0 })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::{PromptLabel, PromptPoint};
    use image::Rgb;

    #[test]
    fn preprocess_normalizes_and_transposes() {
        let mut frame = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
        frame.put_pixel(1, 2, Rgb([255, 128, 0]));

        let pre = Preprocessor::new(4, 4);
        let tensor = pre.preprocess(&frame).unwrap();

        assert_eq!(tensor.dim(), (1, 3, 4, 4));
        assert_eq!(tensor[[0, 0, 2, 1]], 1.0);
        assert!((tensor[[0, 1, 2, 1]] - 128.0 / 255.0).abs() < 1e-6);
        assert_eq!(tensor[[0, 2, 2, 1]], 0.0);
    }

    #[test]
    fn encode_points_scales_into_model_space() {
        let group = PromptGroup {
            frame_index: 0,
            object_id: 1,
            points: vec![PromptPoint {
                frame_index: 0,
                object_id: 1,
                x: 50.0,
                y: 25.0,
                label: PromptLabel::Foreground,
                seq: 0,
            }],
        };

        let pre = Preprocessor::new(1024, 1024);
        let (coords, labels) = pre.encode_points(Some(&group), 100, 100);

        assert_eq!(coords.dim(), (1, 1, 2));
        assert_eq!(coords[[0, 0, 0]], 512.0);
        assert_eq!(coords[[0, 0, 1]], 256.0);
        assert_eq!(labels[[0, 0]], 1.0);
    }

    #[test]
    fn encode_points_pads_empty_groups() {
        let pre = Preprocessor::new(1024, 1024);
        let (coords, labels) = pre.encode_points(None, 100, 100);
        assert_eq!(coords.dim(), (1, 1, 2));
        assert_eq!(labels[[0, 0]], PAD_LABEL);
    }

    #[test]
    fn upscale_binarizes_at_zero() {
        let plane = vec![-2.0, 0.0, 0.5, 3.0];
        let out = Preprocessor::upscale_plane(&plane, 2, 2, 2, 2).unwrap();
        assert_eq!(out, vec![0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn upscale_resizes_to_target() {
        let plane = vec![1.0, -1.0, 1.0, -1.0];
        let out = Preprocessor::upscale_plane(&plane, 2, 2, 4, 4).unwrap();
        assert_eq!(out.len(), 16);
        assert!(out.iter().all(|&v| v == 0.0 || v == 1.0));
    }
}
