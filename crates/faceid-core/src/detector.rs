//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes the grayscale frame into the model input, decodes the three
//! anchor-free stride heads, suppresses overlaps and reports the single most
//! confident face.

use crate::types::FaceBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Detections at or below this confidence are never reported.
pub const DETECTION_FLOOR: f32 = 0.5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    FrameSize { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Raw detection in frame coordinates, before rounding to a [`FaceBox`].
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &Candidate) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    fn to_face_box(self) -> FaceBox {
        FaceBox {
            x: self.x1.round() as i32,
            y: self.y1.round() as i32,
            w: (self.x2 - self.x1).round() as i32,
            h: (self.y2 - self.y1).round() as i32,
            score: self.score,
        }
    }
}

/// Scale and padding applied when fitting the frame into the model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: usize,
    pad_y: usize,
}

impl Letterbox {
    fn fit(width: usize, height: usize) -> (Self, usize, usize) {
        let scale = (SCRFD_INPUT_SIZE as f32 / width as f32)
            .min(SCRFD_INPUT_SIZE as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as usize).clamp(1, SCRFD_INPUT_SIZE);
        let new_h = ((height as f32 * scale).round() as usize).clamp(1, SCRFD_INPUT_SIZE);
        let letterbox = Self {
            scale,
            pad_x: (SCRFD_INPUT_SIZE - new_w) / 2,
            pad_y: (SCRFD_INPUT_SIZE - new_h) / 2,
        };
        (letterbox, new_w, new_h)
    }

    /// Map a point from model input space back to the original frame.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputs = (usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    stride_outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from `model_path`.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs score and bbox outputs for 3 strides, model has {}",
                output_names.len()
            )));
        }

        let stride_outputs = map_outputs(&output_names);
        tracing::debug!(?stride_outputs, "SCRFD output mapping");

        Ok(Self {
            session,
            stride_outputs,
        })
    }

    /// Most confident face above [`DETECTION_FLOOR`] with a non-empty box.
    pub fn detect_best(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<FaceBox>, DetectorError> {
        let candidates = self.detect(frame, width, height)?;
        Ok(pick_best(&candidates))
    }

    fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Candidate>, DetectorError> {
        let (input, letterbox) = preprocess(frame, width, height)?;

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx)) in SCRFD_STRIDES.iter().zip(&self.stride_outputs) {
            let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("scores stride {stride}: {e}"))
            })?;
            let (_, bboxes) = outputs[bbox_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}"))
            })?;
            candidates.extend(decode_stride(scores, bboxes, stride, &letterbox));
        }

        Ok(suppress(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Letterbox a grayscale frame into a normalized `1x3xNxN` tensor.
fn preprocess(frame: &[u8], width: u32, height: u32) -> Result<(Array4<f32>, Letterbox), DetectorError> {
    let expected = width as usize * height as usize;
    let gray = GrayImage::from_raw(width, height, frame.get(..expected).unwrap_or(frame).to_vec())
        .filter(|_| expected > 0)
        .ok_or(DetectorError::FrameSize {
            expected,
            actual: frame.len(),
        })?;

    let (letterbox, new_w, new_h) = Letterbox::fit(width as usize, height as usize);
    let resized = imageops::resize(&gray, new_w as u32, new_h as u32, FilterType::Triangle);

    // Padding is the mean, so it normalizes to zero.
    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let value = (f32::from(pixel.0[0]) - SCRFD_MEAN) / SCRFD_STD;
        let (tx, ty) = (x as usize + letterbox.pad_x, y as usize + letterbox.pad_y);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = value;
        }
    }

    Ok((tensor, letterbox))
}

/// Locate score/bbox tensors for each stride.
///
/// Exports either name them `score_8`, `bbox_16`, ... or use opaque numeric
/// names in the standard order `[scores 8/16/32, bboxes 8/16/32, kps ...]`.
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(found) => [found[0], found[1], found[2]],
        None => {
            tracing::info!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Decode all anchors of one stride whose score clears the floor.
fn decode_stride(scores: &[f32], bboxes: &[f32], stride: usize, letterbox: &Letterbox) -> Vec<Candidate> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let anchors = grid_w * (SCRFD_INPUT_SIZE / stride) * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors.min(scores.len()))
        .filter(|&idx| scores[idx] > DETECTION_FLOOR)
        .filter_map(|idx| {
            let offsets = bboxes.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid_w) as f32 * step;
            let cy = (cell / grid_w) as f32 * step;

            let (x1, y1) = letterbox.unmap(cx - offsets[0] * step, cy - offsets[1] * step);
            let (x2, y2) = letterbox.unmap(cx + offsets[2] * step, cy + offsets[3] * step);
            Some(Candidate {
                x1,
                y1,
                x2,
                y2,
                score: scores[idx],
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; result is sorted by descending score.
fn suppress(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn pick_best(sorted: &[Candidate]) -> Option<FaceBox> {
    let best = sorted.first()?;
    if best.score <= DETECTION_FLOOR {
        return None;
    }
    Some(best.to_face_box()).filter(FaceBox::has_area)
}
