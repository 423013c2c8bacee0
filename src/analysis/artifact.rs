//! Serializable study-pass artifact.
//!
//! A host that stretches the same material repeatedly can run the study pass
//! once, save the resulting curves, and feed them back later instead of
//! re-studying. The artifact records enough configuration to reject reuse
//! against a mismatched stretcher.

use crate::error::StretchError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Onset/stretch curves and accounting captured by a completed study pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyArtifact {
    /// Sample rate the study ran at.
    pub sample_rate: u32,
    /// Channel count of the studied material.
    pub channels: usize,
    /// Analysis window size in samples.
    pub window_size: usize,
    /// Analysis hop in samples.
    pub input_increment: usize,
    /// Exact input duration in samples (prefill removed).
    pub input_duration: u64,
    /// Phase-reset (percussive onset) curve, one value per chunk.
    #[serde(default)]
    pub phase_reset_df: Vec<f32>,
    /// Stretch-weight curve, one value per chunk.
    #[serde(default)]
    pub stretch_df: Vec<f32>,
}

/// Writes a study artifact as JSON.
pub fn write_study_json(path: &Path, artifact: &StudyArtifact) -> Result<(), StretchError> {
    let json = serde_json::to_string_pretty(artifact).map_err(|e| {
        StretchError::InvalidArtifact(format!("failed to serialize study artifact: {}", e))
    })?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Reads a study artifact from JSON.
pub fn read_study_json(path: &Path) -> Result<StudyArtifact, StretchError> {
    let data = std::fs::read_to_string(path)?;
    serde_json::from_str(&data).map_err(|e| {
        StretchError::InvalidArtifact(format!(
            "failed to parse study artifact from {}: {}",
            path.display(),
            e
        ))
    })
}
