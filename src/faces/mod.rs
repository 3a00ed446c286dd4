//! Face detection and embedding.
//!
//! The ingestion pipeline only sees the [`FaceEmbedder`] trait, so the ONNX
//! models can be swapped for a fake in tests.

pub mod detector;

use anyhow::Result;

use crate::db::BoundingBox;

pub use detector::OnnxFaceEmbedder;

/// A face found in an image, with its embedding.
///
/// A face whose embedding could not be computed carries a zero vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub embedding: Vec<f32>,
    pub bbox: BoundingBox,
}

pub trait FaceEmbedder: Send + Sync {
    /// Find every face in the encoded image and embed it.
    fn detect_and_embed(&self, image: &[u8]) -> Result<Vec<Detection>>;

    /// Length of the embeddings this embedder produces.
    fn dimension(&self) -> usize;
}
