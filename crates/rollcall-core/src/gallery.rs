//! Trained embedding gallery, persisted as a flat JSON file.
//!
//! The training pass rebuilds this file from scratch on every run; the
//! recognition loop loads it once and matches probe embeddings against its
//! entries in memory.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed gallery file: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One trained embedding with its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledFace {
    pub user_id: String,
    /// File name of the registration image this embedding came from.
    pub source: String,
    pub trained_at: String,
    pub embedding: Embedding,
}

/// The full set of trained embeddings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gallery {
    /// Embedding model that produced every entry in this file.
    pub model_version: String,
    pub trained_at: String,
    pub faces: Vec<EnrolledFace>,
}

impl Gallery {
    pub fn new(model_version: &str, trained_at: &str) -> Self {
        Self {
            model_version: model_version.to_string(),
            trained_at: trained_at.to_string(),
            faces: Vec::new(),
        }
    }

    /// Load a gallery. `Ok(None)` when the file does not exist yet — a fresh
    /// install that has never trained is not an error.
    pub fn load(path: &Path) -> Result<Option<Self>, GalleryError> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn save(&self, path: &Path) -> Result<(), GalleryError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    /// Number of distinct users with at least one trained embedding.
    pub fn user_count(&self) -> usize {
        let mut ids: Vec<&str> = self.faces.iter().map(|f| f.user_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Gallery {
        let mut g = Gallery::new("w600k_r50", "2026-08-06T09:00:00");
        for (user, vals) in [
            ("1001", vec![1.0, 0.0]),
            ("1001", vec![0.9, 0.1]),
            ("1002", vec![0.0, 1.0]),
        ] {
            g.faces.push(EnrolledFace {
                user_id: user.to_string(),
                source: format!("{user}_001.jpg"),
                trained_at: g.trained_at.clone(),
                embedding: Embedding { values: vals, model_version: Some("w600k_r50".into()) },
            });
        }
        g
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encodings").join("gallery.json");

        let g = sample();
        g.save(&path).unwrap();

        let loaded = Gallery::load(&path).unwrap().unwrap();
        assert_eq!(loaded.model_version, "w600k_r50");
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.faces[0].user_id, "1001");
        assert_eq!(loaded.faces[0].embedding.values, vec![1.0, 0.0]);
    }

    #[test]
    fn load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Gallery::load(&dir.path().join("nope.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn load_malformed_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(Gallery::load(&path), Err(GalleryError::Malformed(_))));
    }

    #[test]
    fn user_count_dedupes() {
        let g = sample();
        assert_eq!(g.len(), 3);
        assert_eq!(g.user_count(), 2);
    }

    #[test]
    fn empty_gallery() {
        let g = Gallery::new("w600k_r50", "");
        assert!(g.is_empty());
        assert_eq!(g.user_count(), 0);
    }
}
