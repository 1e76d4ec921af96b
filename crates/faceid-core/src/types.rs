/// Guards the cosine denominator against zero-norm vectors.
const COSINE_EPSILON: f64 = 1e-12;

/// Bounding box of a detected face, in integer pixel coordinates of the frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    /// Detection confidence, conventionally in [0, 1].
    pub score: f32,
}

impl FaceBox {
    /// True when the box covers at least one pixel.
    pub fn has_area(&self) -> bool {
        self.w > 0 && self.h > 0
    }
}

/// Face embedding vector produced by the embedder model.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Number of dimensions.
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine distance to `other`, or `None` when the dimensions differ.
    pub fn distance(&self, other: &Embedding) -> Option<f32> {
        if self.dim() != other.dim() {
            return None;
        }
        Some(cosine_distance(&self.values, &other.values))
    }
}

/// Cosine distance `1 - cos(a, b)` between two equal-length vectors.
///
/// Accumulates in `f64` so high-dimensional inputs don't drift. The result is
/// nominally in [0, 2] and is not clamped; lower means more similar. A zero
/// vector on either side yields a distance of 1.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "cosine distance needs equal lengths");

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt() + COSINE_EPSILON;
    (1.0 - dot / denom) as f32
}
