//! Speaker embeddings and the averaged voiceprint built at enrollment.

use crate::error::{Result, ShieldError};
use crate::identity::AccountId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed-length speaker embedding. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmbeddingVector(Vec<f32>);

impl EmbeddingVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    /// Cosine similarity; zero when either vector has no energy or the
    /// dimensions differ.
    pub fn cosine_similarity(&self, other: &EmbeddingVector) -> f32 {
        if self.dimension() != other.dimension() {
            return 0.0;
        }
        let dot: f32 = self.0.iter().zip(&other.0).map(|(a, b)| a * b).sum();
        let norm_a = self.0.iter().map(|v| v * v).sum::<f32>().sqrt();
        let norm_b = other.0.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a * norm_b)
    }
}

/// Element-wise mean of equal-length embeddings.
///
/// The first vector fixes the dimension; any other length fails with
/// `EmbeddingDimensionMismatch` naming the 1-based position of the offender.
pub fn average(embeddings: &[EmbeddingVector]) -> Result<EmbeddingVector> {
    let first = embeddings.first().ok_or(ShieldError::NoEmbeddings)?;
    let dimension = first.dimension();
    if dimension == 0 {
        return Err(ShieldError::NoEmbeddings);
    }

    for (index, embedding) in embeddings.iter().enumerate() {
        if embedding.dimension() != dimension {
            return Err(ShieldError::EmbeddingDimensionMismatch {
                round: index + 1,
                expected: dimension,
                actual: embedding.dimension(),
            });
        }
    }

    // Each component is summed in ascending value order, so the rounding
    // is the same whatever order the rounds arrive in.
    let count = embeddings.len() as f64;
    let mut column = Vec::with_capacity(embeddings.len());
    let mut means = Vec::with_capacity(dimension);
    for component in 0..dimension {
        column.clear();
        column.extend(embeddings.iter().map(|e| e.0[component] as f64));
        column.sort_by(f64::total_cmp);
        let sum: f64 = column.iter().sum();
        means.push((sum / count) as f32);
    }
    Ok(EmbeddingVector(means))
}

/// The enrolled voiceprint of one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoicePrint {
    pub account_id: AccountId,
    pub embedding: EmbeddingVector,
    pub created_at: DateTime<Utc>,
}

impl VoicePrint {
    pub fn new(account_id: AccountId, embedding: EmbeddingVector, created_at: DateTime<Utc>) -> Self {
        Self {
            account_id,
            embedding,
            created_at,
        }
    }

    pub fn dimension(&self) -> usize {
        self.embedding.dimension()
    }
}
