//! Flat nearest-neighbour index that hands out identity ids.
//!
//! The identity id of a face is the row ordinal of the embedding that first
//! represented it. Rows are only ever appended, never reordered or removed,
//! so every id stored in the database stays valid for the life of the index.

mod storage;

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::db::IdentityId;

/// Dimension of the embeddings the index is created with by default.
pub const DEFAULT_DIMENSION: usize = 128;

/// Squared euclidean distance below which an embedding reuses an identity.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.24;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("index file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("embedding dimension mismatch: index holds {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding value at position {position} is not finite")]
    NonFinite { position: usize },
}

pub struct EmbeddingIndex {
    path: PathBuf,
    dimension: usize,
    threshold: f32,
    /// Row-major vectors; row `i` occupies `data[i * dimension..(i + 1) * dimension]`.
    data: Vec<f32>,
}

impl EmbeddingIndex {
    /// Empty in-memory index that will persist to `path`.
    pub fn new(path: impl Into<PathBuf>, dimension: usize) -> Self {
        Self {
            path: path.into(),
            dimension: dimension.max(1),
            threshold: DEFAULT_MATCH_THRESHOLD,
            data: Vec::new(),
        }
    }

    /// Load the index at `path`, or start empty if it is missing or unreadable.
    ///
    /// A readable index of a different dimension is an error: replacing it
    /// would orphan every identity id already stored in the database.
    pub fn load_or_create(path: impl Into<PathBuf>, dimension: usize) -> Result<Self, IndexError> {
        let path = path.into();
        let mut index = Self::new(path.clone(), dimension);

        if !path.exists() {
            tracing::info!(path = %path.display(), dimension, "Created new embedding index");
            return Ok(index);
        }

        match storage::read(&path) {
            Ok((stored_dimension, data)) => {
                if stored_dimension != index.dimension {
                    return Err(IndexError::DimensionMismatch {
                        expected: stored_dimension,
                        actual: index.dimension,
                    });
                }
                index.data = data;
                tracing::info!(path = %path.display(), rows = index.len(), "Loaded embedding index");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not read embedding index, starting empty");
            }
        }

        Ok(index)
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Number of stored vectors, which is also the next identity id.
    pub fn len(&self) -> usize {
        self.data.len() / self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Closest stored row and its squared distance. Ties go to the lowest row.
    ///
    /// Rows whose distance is NaN never match.
    pub fn nearest(&self, embedding: &[f32]) -> Option<(usize, f32)> {
        self.data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(row, stored)| (row, squared_distance(stored, embedding)))
            .filter(|(_, distance)| !distance.is_nan())
            .fold(None, |best, (row, distance)| match best {
                Some((_, best_distance)) if distance >= best_distance => best,
                _ => Some((row, distance)),
            })
    }

    /// Map an embedding to an identity, minting a new one if nothing is close.
    pub fn resolve(&mut self, embedding: &[f32]) -> Result<IdentityId, IndexError> {
        if embedding.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        if let Some(position) = embedding.iter().position(|v| !v.is_finite()) {
            return Err(IndexError::NonFinite { position });
        }

        if let Some((row, distance)) = self.nearest(embedding) {
            if distance < self.threshold {
                tracing::debug!(identity = row, distance, "Matched existing identity");
                return Ok(row as IdentityId);
            }
        }

        let new_id = self.len();
        self.data.extend_from_slice(embedding);
        tracing::debug!(identity = new_id, "Added new identity");
        Ok(new_id as IdentityId)
    }

    /// Write every vector to disk, replacing the previous file atomically.
    pub fn persist(&self) -> Result<(), IndexError> {
        storage::write(&self.path, self.dimension, &self.data)?;
        tracing::debug!(path = %self.path.display(), rows = self.len(), "Saved embedding index");
        Ok(())
    }
}

/// Squared euclidean distance between two equal-length vectors.
pub fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}
