//! Trained model artifact and its on-disk store.
//!
//! One training run produces one artifact: the fitted scaler, the forest,
//! and the per-state baselines. The three are only valid together, so they
//! persist together behind a single version byte.

use crate::baseline::BaselineTable;
use crate::features::{FEATURE_DIM, FeatureVector};
use crate::forest::IsolationForest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

/// Bump on any incompatible artifact layout change.
pub const MODEL_VERSION: u32 = 1;

/// Reported model family, fixed for this engine.
pub const MODEL_TYPE: &str = "IsolationForest";

/// Per-dimension standardization fit on the training batch. The forest is
/// scored on standardized vectors; persisting the scaler with the forest is
/// what keeps serving consistent with training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    means: [f64; FEATURE_DIM],
    stds: [f64; FEATURE_DIM],
}

impl StandardScaler {
    /// Fit means and population standard deviations. Dimensions with no
    /// spread scale by 1.0 so constants pass through unchanged.
    pub fn fit(samples: &[FeatureVector]) -> Self {
        let n = samples.len().max(1) as f64;
        let mut means = [0.0; FEATURE_DIM];
        let mut stds = [0.0; FEATURE_DIM];

        for sample in samples {
            for (dim, value) in sample.iter().enumerate() {
                means[dim] += value;
            }
        }
        for mean in &mut means {
            *mean /= n;
        }

        for sample in samples {
            for (dim, value) in sample.iter().enumerate() {
                let delta = value - means[dim];
                stds[dim] += delta * delta;
            }
        }
        for std in &mut stds {
            *std = (*std / n).sqrt();
            if *std <= f64::EPSILON {
                *std = 1.0;
            }
        }

        Self { means, stds }
    }

    pub fn transform(&self, features: &FeatureVector) -> FeatureVector {
        let mut out = [0.0; FEATURE_DIM];
        for dim in 0..FEATURE_DIM {
            out[dim] = (features[dim] - self.means[dim]) / self.stds[dim];
        }
        out
    }

    pub fn transform_all(&self, samples: &[FeatureVector]) -> Vec<FeatureVector> {
        samples.iter().map(|s| self.transform(s)).collect()
    }
}

/// Everything one training run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub version: u32,
    pub trained_at: DateTime<Utc>,
    pub training_samples: usize,
    pub scaler: StandardScaler,
    pub forest: IsolationForest,
    pub baselines: BaselineTable,
}

impl ModelArtifact {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ModelStoreError> {
        bincode::serialize(self).map_err(|e| ModelStoreError::SerializationFailed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModelStoreError> {
        let artifact: ModelArtifact = bincode::deserialize(bytes)
            .map_err(|e| ModelStoreError::DeserializationFailed(e.to_string()))?;

        // Exact match only: an older layout is as unreadable as a newer
        // one once the feature set or baseline shape changes.
        if artifact.version != MODEL_VERSION {
            return Err(ModelStoreError::VersionMismatch {
                found: artifact.version,
                expected: MODEL_VERSION,
            });
        }

        Ok(artifact)
    }
}

/// Errors from persisting or restoring an artifact.
#[derive(Debug, Clone)]
pub enum ModelStoreError {
    SerializationFailed(String),
    DeserializationFailed(String),
    VersionMismatch { found: u32, expected: u32 },
    Io(String),
}

impl std::fmt::Display for ModelStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationFailed(e) => write!(f, "Serialization failed: {}", e),
            Self::DeserializationFailed(e) => write!(f, "Deserialization failed: {}", e),
            Self::VersionMismatch { found, expected } => write!(
                f,
                "Model version mismatch: found {}, expected {}",
                found, expected
            ),
            Self::Io(e) => write!(f, "Model store I/O failed: {}", e),
        }
    }
}

impl std::error::Error for ModelStoreError {}

/// File-backed artifact store. A missing file means "not trained yet", not
/// an error; anything else unreadable is.
#[derive(Debug, Clone)]
pub struct ModelStore {
    path: PathBuf,
}

impl ModelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<ModelArtifact>, ModelStoreError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => ModelArtifact::from_bytes(&bytes).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ModelStoreError::Io(e.to_string())),
        }
    }

    /// Write via temp-then-rename so a crash mid-write never leaves a
    /// truncated artifact behind.
    pub fn save(&self, artifact: &ModelArtifact) -> Result<(), ModelStoreError> {
        let bytes = artifact.to_bytes()?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| ModelStoreError::Io(e.to_string()))?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &bytes).map_err(|e| ModelStoreError::Io(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| ModelStoreError::Io(e.to_string()))?;
        Ok(())
    }
}
