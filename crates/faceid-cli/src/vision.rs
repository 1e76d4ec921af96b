//! Default capture collaborator: V4L2 frames, SCRFD detection, ONNX embedding.

use crate::config::Config;
use faceid_core::detector::DetectorError;
use faceid_core::recognizer::RecognizerError;
use faceid_core::{Embedding, FaceBox, FaceDetector, FaceRecognizer, FaceSource};
use faceid_hw::{Camera, Frame, FrameStream};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("no current frame")]
    NoFrame,
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Both ONNX models, loaded once per session.
pub struct Models {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl Models {
    pub fn load(config: &Config) -> anyhow::Result<Self> {
        let detector = FaceDetector::load(&config.detector_model)?;
        let recognizer = FaceRecognizer::load(&config.embedder_model, config.embedder_layout)?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

/// Camera stream plus models, holding the most recently read frame.
pub struct Vision<'cam> {
    stream: FrameStream<'cam>,
    models: Models,
    frame: Option<Frame>,
}

impl<'cam> Vision<'cam> {
    pub fn new(camera: &'cam Camera, models: Models) -> anyhow::Result<Self> {
        Ok(Self {
            stream: camera.stream()?,
            models,
            frame: None,
        })
    }
}

impl FaceSource for Vision<'_> {
    type Error = VisionError;

    fn read_frame(&mut self) -> bool {
        match self.stream.next_frame() {
            Ok(frame) => {
                tracing::trace!(seq = frame.sequence, "frame captured");
                self.frame = Some(frame);
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "frame capture failed");
                self.frame = None;
                false
            }
        }
    }

    fn detect_best_face(&mut self) -> Result<Option<FaceBox>, VisionError> {
        let frame = self.frame.as_ref().ok_or(VisionError::NoFrame)?;
        let face = self
            .models
            .detector
            .detect_best(&frame.data, frame.width, frame.height)?;
        Ok(face)
    }

    fn embed_face(&mut self, face: &FaceBox) -> Result<Embedding, VisionError> {
        let frame = self.frame.as_ref().ok_or(VisionError::NoFrame)?;
        let embedding = self
            .models
            .recognizer
            .embed(&frame.data, frame.width, frame.height, face)?;
        Ok(embedding)
    }
}
