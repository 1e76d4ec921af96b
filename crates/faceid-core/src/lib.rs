//! faceid-core — Single-identity face enrollment and unlock.
//!
//! Holds the reference embedding store, the cosine distance metric, the
//! enrollment and lock session loops, and the ONNX detector/embedder that
//! back the default capture collaborator.

pub mod capture;
pub mod detector;
pub mod recognizer;
pub mod session;
pub mod store;
pub mod types;

pub use capture::{FaceSource, Feedback};
pub use detector::FaceDetector;
pub use recognizer::{FaceRecognizer, TensorLayout};
pub use session::{EnrollOutcome, EnrollSettings, LockOutcome, LockSettings, SessionError};
pub use store::StoreError;
pub use types::{cosine_distance, Embedding, FaceBox};
