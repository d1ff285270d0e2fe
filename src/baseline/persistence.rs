//! On-disk model blobs
//!
//! The database row is the index and carries the serving coefficients; the
//! blob is the audit/export record. Layout:
//! `MODEL_DIR/<machine>/<energy_source>/v<version>.json`.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Serialized form of a trained baseline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelBlob {
    pub machine_id: String,
    pub energy_source: String,
    pub model_version: i32,
    /// Ordered feature keys; `coefficients[i]` belongs to `features[i]`.
    pub features: Vec<String>,
    pub intercept: f64,
    pub coefficients: Vec<f64>,
    pub r_squared: f64,
    pub rmse: f64,
    pub mae: f64,
    pub residual_std: f64,
    pub training_samples: usize,
    pub trained_at: DateTime<Utc>,
}

/// Path a blob will be written to.
pub fn blob_path(model_dir: &Path, machine_id: &str, energy_source: &str, version: i32) -> PathBuf {
    model_dir
        .join(sanitize(machine_id))
        .join(sanitize(energy_source))
        .join(format!("v{version}.json"))
}

/// Keep ids filesystem-safe without losing uniqueness for sane inputs.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Write a blob, creating parent directories as needed. Returns the path.
pub fn write_blob(model_dir: &Path, blob: &ModelBlob) -> Result<PathBuf, CoreError> {
    let path = blob_path(
        model_dir,
        &blob.machine_id,
        &blob.energy_source,
        blob.model_version,
    );
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(blob)?;
    fs::write(&path, json)?;
    Ok(path)
}

/// Load a blob back from disk.
pub fn load_blob(path: &Path) -> Result<ModelBlob, CoreError> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_blob() -> ModelBlob {
        ModelBlob {
            machine_id: "Compressor-1".into(),
            energy_source: "electricity".into(),
            model_version: 3,
            features: vec!["total_production_count".into(), "avg_outdoor_temp_c".into()],
            intercept: 12.5,
            coefficients: vec![0.042, -0.8],
            r_squared: 0.91,
            rmse: 2.1,
            mae: 1.6,
            residual_std: 2.2,
            training_samples: 408,
            trained_at: Utc::now(),
        }
    }

    #[test]
    fn blob_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let blob = sample_blob();

        let path = write_blob(dir.path(), &blob).unwrap();
        assert!(path.ends_with("Compressor-1/electricity/v3.json"));

        let loaded = load_blob(&path).unwrap();
        assert_eq!(loaded, blob);
    }

    #[test]
    fn versions_live_side_by_side() {
        let dir = tempfile::tempdir().unwrap();
        let mut blob = sample_blob();
        let p3 = write_blob(dir.path(), &blob).unwrap();
        blob.model_version = 4;
        let p4 = write_blob(dir.path(), &blob).unwrap();
        assert_ne!(p3, p4);
        assert!(p3.exists() && p4.exists());
    }

    #[test]
    fn hostile_ids_cannot_escape_the_model_dir() {
        let path = blob_path(Path::new("/models"), "../../etc", "pass/wd", 1);
        assert!(path.starts_with("/models"));
        assert!(!path.to_string_lossy().contains(".."));
    }

    #[test]
    fn missing_blob_is_an_error() {
        assert!(load_blob(Path::new("/nonexistent/v1.json")).is_err());
    }
}
