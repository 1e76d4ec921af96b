//! Collaborator seams consumed by the enrollment and lock sessions.

use crate::types::{Embedding, FaceBox};
use std::time::Duration;

/// Supplies frames, face detections and embeddings on demand.
///
/// Errors returned from detection or embedding are per-frame failures: the
/// sessions log them and move on to the next frame.
pub trait FaceSource {
    type Error: std::fmt::Display;

    /// Advance to the next frame. Returns `false` once capture is exhausted.
    fn read_frame(&mut self) -> bool;

    /// Highest-confidence face in the current frame, if any clears the
    /// detector's confidence floor.
    fn detect_best_face(&mut self) -> Result<Option<FaceBox>, Self::Error>;

    /// Embedding of the face inside `face` in the current frame.
    fn embed_face(&mut self, face: &FaceBox) -> Result<Embedding, Self::Error>;
}

/// Presents session progress and reports key presses.
///
/// Nothing returned here affects session logic except the polled key.
pub trait Feedback {
    fn show_enroll_progress(&mut self, face: Option<&FaceBox>, captured: usize, target: usize);

    fn show_lock_progress(
        &mut self,
        face: Option<&FaceBox>,
        streak: usize,
        required: usize,
        last_distance: f32,
    );

    /// Wait at most `timeout` for a key press.
    fn poll_key(&mut self, timeout: Duration) -> Option<char>;
}

/// Keys that abort a running session.
pub fn is_cancel_key(key: char) -> bool {
    matches!(key, 'q' | 'Q')
}
