//! Enrollment and lock sessions.
//!
//! Both sessions are synchronous per-frame loops over a [`FaceSource`]: one
//! frame is read, detected, embedded, reported and key-polled before the next
//! one is requested. Detection and embedding failures never leave the loop;
//! they only cost the frame they happened on.

use crate::capture::{is_cancel_key, FaceSource, Feedback};
use crate::store::{self, StoreError};
use crate::types::{Embedding, FaceBox};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// `last_distance` value meaning "no comparison yet".
pub const NO_DISTANCE: f32 = 999.0;

/// How long each iteration waits for a cancel key.
pub const KEY_POLL_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("could not enroll: no embedding captured")]
    NoEmbeddingCaptured,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("embedding has {actual} dimensions, expected {expected}")]
pub struct DimensionMismatch {
    pub expected: usize,
    pub actual: usize,
}

/// Running element-wise sum of the embeddings captured during enrollment.
///
/// The first embedding fixes the dimension; later ones must match it.
#[derive(Debug, Default)]
pub struct Accumulator {
    sum: Option<Vec<f64>>,
    captured: usize,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn captured(&self) -> usize {
        self.captured
    }

    /// Dimension fixed by the first accepted embedding.
    pub fn dim(&self) -> Option<usize> {
        self.sum.as_ref().map(Vec::len)
    }

    /// Add `embedding` to the running sum. Empty embeddings and embeddings
    /// whose dimension differs from the first one are rejected untouched.
    pub fn add(&mut self, embedding: &Embedding) -> Result<(), DimensionMismatch> {
        let expected = self.dim().unwrap_or(embedding.dim());
        if embedding.dim() == 0 || embedding.dim() != expected {
            return Err(DimensionMismatch {
                expected,
                actual: embedding.dim(),
            });
        }

        let sum = self.sum.get_or_insert_with(|| vec![0.0; expected]);
        for (acc, &v) in sum.iter_mut().zip(&embedding.values) {
            *acc += f64::from(v);
        }
        self.captured += 1;
        Ok(())
    }

    /// Element-wise mean of everything added so far.
    pub fn mean(&self) -> Option<Embedding> {
        let sum = self.sum.as_ref()?;
        let n = self.captured as f64;
        Some(Embedding::new(sum.iter().map(|s| (s / n) as f32).collect()))
    }
}

/// Parameters of an enrollment run.
#[derive(Debug, Clone)]
pub struct EnrollSettings {
    /// Number of embeddings to average.
    pub target_frames: usize,
    /// Where the averaged reference is written.
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnrollOutcome {
    /// Reference saved; `frames` embeddings went into the mean.
    Enrolled { embedding: Embedding, frames: usize },
    /// Cancel key pressed. Nothing was written.
    Cancelled,
}

/// Capture embeddings until `target_frames` are collected, then persist their
/// mean to `settings.output`.
///
/// If capture runs out early the embeddings collected so far are still
/// averaged and saved. Zero embeddings is an error and writes nothing. A
/// target of zero is treated as one.
pub fn enroll<S, F>(
    source: &mut S,
    feedback: &mut F,
    settings: &EnrollSettings,
) -> Result<EnrollOutcome, SessionError>
where
    S: FaceSource,
    F: Feedback,
{
    let target = settings.target_frames.max(1);
    let mut acc = Accumulator::new();

    tracing::info!(target, "enrollment started");

    loop {
        if !source.read_frame() {
            tracing::warn!(
                captured = acc.captured(),
                target,
                "capture ended before the enrollment target was reached"
            );
            break;
        }

        let face = detect(source);
        if let Some(face) = &face {
            match source.embed_face(face) {
                Ok(embedding) => match acc.add(&embedding) {
                    Ok(()) => tracing::debug!(captured = acc.captured(), target, "embedding captured"),
                    Err(err) => tracing::debug!(%err, "embedding rejected"),
                },
                Err(err) => tracing::debug!(%err, "embedding failed"),
            }
        }

        feedback.show_enroll_progress(face.as_ref(), acc.captured(), target);

        if feedback.poll_key(KEY_POLL_TIMEOUT).is_some_and(is_cancel_key) {
            tracing::info!(captured = acc.captured(), "enrollment cancelled");
            return Ok(EnrollOutcome::Cancelled);
        }

        if acc.captured() >= target {
            break;
        }
    }

    let embedding = acc.mean().ok_or(SessionError::NoEmbeddingCaptured)?;
    store::save(&settings.output, &embedding)?;

    tracing::info!(
        path = %settings.output.display(),
        frames = acc.captured(),
        dim = embedding.dim(),
        "enrollment saved"
    );

    Ok(EnrollOutcome::Enrolled {
        embedding,
        frames: acc.captured(),
    })
}

/// What one lock frame produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// No face in the frame.
    NoFace,
    /// A face was found but could not be compared (embedding failure or
    /// dimension mismatch).
    Rejected,
    /// Cosine distance between the live embedding and the reference.
    Distance(f32),
}

/// Consecutive-match streak that decides an unlock.
#[derive(Debug, Clone)]
pub struct LockState {
    threshold: f32,
    required: usize,
    consecutive: usize,
    last_distance: f32,
}

impl LockState {
    /// `required` is at least one; a streak is never satisfied without a match.
    pub fn new(threshold: f32, required: usize) -> Self {
        Self {
            threshold,
            required: required.max(1),
            consecutive: 0,
            last_distance: NO_DISTANCE,
        }
    }

    /// Fold one frame into the streak. Returns `true` once unlocked.
    pub fn observe(&mut self, observation: Observation) -> bool {
        match observation {
            Observation::Distance(d) => {
                self.last_distance = d;
                if d <= self.threshold {
                    self.consecutive += 1;
                } else {
                    self.consecutive = 0;
                }
            }
            Observation::Rejected => self.consecutive = 0,
            Observation::NoFace => {
                self.consecutive = 0;
                self.last_distance = NO_DISTANCE;
            }
        }
        self.is_unlocked()
    }

    pub fn is_unlocked(&self) -> bool {
        self.consecutive >= self.required
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn consecutive(&self) -> usize {
        self.consecutive
    }

    pub fn last_distance(&self) -> f32 {
        self.last_distance
    }
}

/// Parameters of a lock run.
#[derive(Debug, Clone, Copy)]
pub struct LockSettings {
    /// Consecutive matching frames needed to unlock.
    pub required_consecutive: usize,
    /// Maximum cosine distance that counts as a match (inclusive).
    pub match_threshold: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LockOutcome {
    Unlocked { frames: usize, last_distance: f32 },
    Cancelled,
    /// Capture ran out before the streak completed.
    CaptureEnded { frames: usize },
}

/// Compare live embeddings against `reference` until enough consecutive
/// frames match.
pub fn lock<S, F>(
    source: &mut S,
    feedback: &mut F,
    reference: &Embedding,
    settings: &LockSettings,
) -> LockOutcome
where
    S: FaceSource,
    F: Feedback,
{
    let mut state = LockState::new(settings.match_threshold, settings.required_consecutive);
    let required = state.required();
    let mut frames = 0usize;

    tracing::info!(
        dim = reference.dim(),
        threshold = settings.match_threshold,
        required,
        "lock started"
    );

    loop {
        if !source.read_frame() {
            tracing::warn!(frames, "capture ended while locked");
            return LockOutcome::CaptureEnded { frames };
        }
        frames += 1;

        let face = detect(source);
        let observation = match &face {
            None => Observation::NoFace,
            Some(face) => compare(source, face, reference),
        };
        state.observe(observation);

        feedback.show_lock_progress(
            face.as_ref(),
            state.consecutive(),
            required,
            state.last_distance(),
        );

        if feedback.poll_key(KEY_POLL_TIMEOUT).is_some_and(is_cancel_key) {
            tracing::info!(frames, "lock cancelled");
            return LockOutcome::Cancelled;
        }

        if state.is_unlocked() {
            tracing::info!(frames, distance = state.last_distance(), "unlocked");
            return LockOutcome::Unlocked {
                frames,
                last_distance: state.last_distance(),
            };
        }
    }
}

fn detect<S: FaceSource>(source: &mut S) -> Option<FaceBox> {
    match source.detect_best_face() {
        Ok(face) => face,
        Err(err) => {
            tracing::debug!(%err, "detection failed");
            None
        }
    }
}

fn compare<S: FaceSource>(source: &mut S, face: &FaceBox, reference: &Embedding) -> Observation {
    let live = match source.embed_face(face) {
        Ok(live) => live,
        Err(err) => {
            tracing::debug!(%err, "embedding failed");
            return Observation::Rejected;
        }
    };

    match live.distance(reference) {
        Some(d) => Observation::Distance(d),
        None => {
            tracing::debug!(
                live = live.dim(),
                reference = reference.dim(),
                "embedding dimension does not match the reference"
            );
            Observation::Rejected
        }
    }
}
