//! ArcFace-style face embedder via ONNX Runtime.
//!
//! The detected box is clipped to the frame, cropped, resized to 112x112 and
//! fed to the model. The output vector is L2-normalized.

use crate::types::{Embedding, FaceBox};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;

/// Largest embedding the recognizer will hand out.
pub const MAX_EMBEDDING_DIM: usize = 1024;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("embedder model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face box does not overlap the frame")]
    EmptyCrop,
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    FrameSize { expected: usize, actual: usize },
    #[error("model produced a {0}-dimensional embedding, accepted range is 1..=1024")]
    BadDimension(usize),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Memory layout of the embedder's input tensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `[1, 3, 112, 112]`
    Nchw,
    /// `[1, 112, 112, 3]`, as exported by the stock `arcface.onnx`.
    #[default]
    Nhwc,
}

/// Pixel rectangle inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Crop {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

/// Face embedder backed by an ONNX model.
pub struct FaceRecognizer {
    session: Session,
    layout: TensorLayout,
}

impl FaceRecognizer {
    /// Load the embedder model from `model_path`.
    pub fn load(model_path: &Path, layout: TensorLayout) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            ?layout,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded embedder model"
        );

        Ok(Self { session, layout })
    }

    /// Embed the face inside `face` in a grayscale frame.
    pub fn embed(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &FaceBox,
    ) -> Result<Embedding, RecognizerError> {
        let expected = width as usize * height as usize;
        let gray = GrayImage::from_raw(width, height, frame.get(..expected).unwrap_or(frame).to_vec())
            .ok_or(RecognizerError::FrameSize {
                expected,
                actual: frame.len(),
            })?;

        let crop = clip_to_frame(face, width, height).ok_or(RecognizerError::EmptyCrop)?;
        let face_img = imageops::crop_imm(&gray, crop.x, crop.y, crop.width, crop.height).to_image();
        let resized = imageops::resize(
            &face_img,
            ARCFACE_INPUT_SIZE,
            ARCFACE_INPUT_SIZE,
            FilterType::Triangle,
        );

        let input = to_tensor(&resized, self.layout);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.is_empty() || raw.len() > MAX_EMBEDDING_DIM {
            return Err(RecognizerError::BadDimension(raw.len()));
        }

        Ok(Embedding::new(l2_normalize(raw)))
    }
}

/// Intersect `face` with the frame bounds. `None` when nothing is left.
fn clip_to_frame(face: &FaceBox, width: u32, height: u32) -> Option<Crop> {
    let x0 = i64::from(face.x).clamp(0, i64::from(width));
    let y0 = i64::from(face.y).clamp(0, i64::from(height));
    let x1 = (i64::from(face.x) + i64::from(face.w)).clamp(0, i64::from(width));
    let y1 = (i64::from(face.y) + i64::from(face.h)).clamp(0, i64::from(height));

    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(Crop {
        x: x0 as u32,
        y: y0 as u32,
        width: (x1 - x0) as u32,
        height: (y1 - y0) as u32,
    })
}

/// Normalize pixels to [-1, 1] and replicate gray into three channels.
fn to_tensor(face: &GrayImage, layout: TensorLayout) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE as usize;
    let mut tensor = match layout {
        TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, size, size)),
        TensorLayout::Nhwc => Array4::<f32>::zeros((1, size, size, 3)),
    };

    for (x, y, pixel) in face.enumerate_pixels() {
        let value = (f32::from(pixel.0[0]) - ARCFACE_MEAN) / ARCFACE_STD;
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            match layout {
                TensorLayout::Nchw => tensor[[0, c, y, x]] = value,
                TensorLayout::Nhwc => tensor[[0, y, x, c]] = value,
            }
        }
    }

    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|v| v / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: i32, y: i32, w: i32, h: i32) -> FaceBox {
        FaceBox { x, y, w, h, score: 0.9 }
    }

    #[test]
    fn test_clip_inside_frame() {
        let crop = clip_to_frame(&face(10, 20, 30, 40), 640, 480).unwrap();
        assert_eq!(crop, Crop { x: 10, y: 20, width: 30, height: 40 });
    }

    #[test]
    fn test_clip_overhanging_box() {
        let crop = clip_to_frame(&face(-10, 460, 50, 50), 640, 480).unwrap();
        assert_eq!(crop, Crop { x: 0, y: 460, width: 40, height: 20 });
    }

    #[test]
    fn test_clip_outside_frame() {
        assert_eq!(clip_to_frame(&face(700, 10, 50, 50), 640, 480), None);
        assert_eq!(clip_to_frame(&face(10, 10, 0, 50), 640, 480), None);
        assert_eq!(clip_to_frame(&face(-60, -60, 50, 50), 640, 480), None);
    }

    #[test]
    fn test_tensor_layouts() {
        let img = GrayImage::from_pixel(ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, image::Luma([255]));
        let size = ARCFACE_INPUT_SIZE as usize;

        let nchw = to_tensor(&img, TensorLayout::Nchw);
        assert_eq!(nchw.shape(), &[1, 3, size, size]);
        let nhwc = to_tensor(&img, TensorLayout::Nhwc);
        assert_eq!(nhwc.shape(), &[1, size, size, 3]);

        assert!(nchw.iter().all(|&v| (v - 1.0).abs() < 1e-6));
        assert!(nhwc.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_default_layout_is_nhwc() {
        assert_eq!(TensorLayout::default(), TensorLayout::Nhwc);
        let img = GrayImage::from_pixel(ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, image::Luma([0]));
        let size = ARCFACE_INPUT_SIZE as usize;
        assert_eq!(to_tensor(&img, TensorLayout::default()).shape(), &[1, size, size, 3]);
    }

    #[test]
    fn test_tensor_channels_identical() {
        let img = GrayImage::from_fn(ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, |x, y| {
            image::Luma([((x * 7 + y * 3) % 256) as u8])
        });
        let tensor = to_tensor(&img, TensorLayout::Nchw);
        let expected = (f32::from(img.get_pixel(5, 9).0[0]) - ARCFACE_MEAN) / ARCFACE_STD;
        for c in 0..3 {
            assert_eq!(tensor[[0, c, 9, 5]], expected);
        }
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
