use serde::{Deserialize, Serialize};

use crate::gallery::EnrolledFace;

/// Bounding box for a detected face, in source-frame pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Integer pixel rectangle grown by `margin` (fraction of the box size on
    /// each side) and clamped to the frame. Used to crop registration images.
    ///
    /// Returns `(x, y, width, height)`; width/height are at least 1.
    pub fn pixel_rect(&self, frame_w: u32, frame_h: u32, margin: f32) -> (u32, u32, u32, u32) {
        let mx = self.width * margin;
        let my = self.height * margin;

        let x0 = (self.x - mx).max(0.0);
        let y0 = (self.y - my).max(0.0);
        let x1 = (self.x + self.width + mx).min(frame_w as f32);
        let y1 = (self.y + self.height + my).min(frame_h as f32);

        let x = (x0.floor() as u32).min(frame_w.saturating_sub(1));
        let y = (y0.floor() as u32).min(frame_h.saturating_sub(1));
        let w = ((x1 - x0).ceil().max(1.0) as u32).min(frame_w.saturating_sub(x).max(1));
        let h = ((y1 - y0).ceil().max(1.0) as u32).min(frame_h.saturating_sub(y).max(1));
        (x, y, w, h)
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Euclidean distance. Lower = more similar.
    pub fn distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Outcome of matching one probe embedding against the enrolled gallery.
#[derive(Debug, Clone)]
pub struct FaceMatch {
    /// Matched user, or `None` when the best similarity is under the threshold.
    pub user_id: Option<String>,
    /// Cosine similarity of the best gallery entry, 0.0 for an empty gallery.
    pub similarity: f32,
}

impl FaceMatch {
    pub fn is_known(&self) -> bool {
        self.user_id.is_some()
    }
}

/// Strategy for assigning an identity to a probe embedding.
pub trait Matcher {
    fn best_match(&self, probe: &Embedding, gallery: &[EnrolledFace], threshold: f32) -> FaceMatch;
}

/// Cosine-similarity nearest-entry matcher.
///
/// Scans the entire gallery and keeps the single best entry; the match is
/// accepted only when that best similarity reaches the threshold. A face that
/// resembles nobody strongly enough stays unknown — there is no forced
/// assignment.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match(&self, probe: &Embedding, gallery: &[EnrolledFace], threshold: f32) -> FaceMatch {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best: Option<&EnrolledFace> = None;

        for face in gallery {
            let sim = probe.similarity(&face.embedding);
            if sim > best_sim {
                best_sim = sim;
                best = Some(face);
            }
        }

        match best {
            Some(face) if best_sim >= threshold => FaceMatch {
                user_id: Some(face.user_id.clone()),
                similarity: best_sim,
            },
            Some(_) => FaceMatch {
                user_id: None,
                similarity: best_sim,
            },
            None => FaceMatch {
                user_id: None,
                similarity: 0.0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enrolled(user_id: &str, values: Vec<f32>) -> EnrolledFace {
        EnrolledFace {
            user_id: user_id.to_string(),
            source: format!("{user_id}_001.jpg"),
            trained_at: String::new(),
            embedding: Embedding { values, model_version: None },
        }
    }

    #[test]
    fn similarity_identical() {
        let a = Embedding { values: vec![1.0, 0.0, 0.0], model_version: None };
        let b = Embedding { values: vec![1.0, 0.0, 0.0], model_version: None };
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn similarity_orthogonal() {
        let a = Embedding { values: vec![1.0, 0.0], model_version: None };
        let b = Embedding { values: vec![0.0, 1.0], model_version: None };
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn similarity_zero_vector() {
        let a = Embedding { values: vec![0.0, 0.0], model_version: None };
        let b = Embedding { values: vec![1.0, 0.0], model_version: None };
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn distance_known_value() {
        let a = Embedding { values: vec![0.0, 0.0], model_version: None };
        let b = Embedding { values: vec![3.0, 4.0], model_version: None };
        assert!((a.distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn matcher_picks_nearest_user() {
        let probe = Embedding { values: vec![1.0, 0.0, 0.0], model_version: None };
        let gallery = vec![
            enrolled("1001", vec![0.0, 1.0, 0.0]),
            enrolled("1002", vec![0.9, 0.1, 0.0]),
            enrolled("1003", vec![0.0, 0.0, 1.0]),
        ];

        let m = CosineMatcher.best_match(&probe, &gallery, 0.4);
        assert_eq!(m.user_id.as_deref(), Some("1002"));
        assert!(m.similarity > 0.9);
    }

    #[test]
    fn matcher_below_threshold_is_unknown() {
        let probe = Embedding { values: vec![1.0, 0.0, 0.0], model_version: None };
        let gallery = vec![enrolled("1001", vec![0.0, 1.0, 0.0])];

        let m = CosineMatcher.best_match(&probe, &gallery, 0.4);
        assert!(!m.is_known());
        // Best similarity is still reported for diagnostics.
        assert!(m.similarity.abs() < 1e-6);
    }

    #[test]
    fn matcher_empty_gallery() {
        let probe = Embedding { values: vec![1.0, 0.0], model_version: None };
        let m = CosineMatcher.best_match(&probe, &[], 0.4);
        assert!(!m.is_known());
        assert_eq!(m.similarity, 0.0);
    }

    #[test]
    fn matcher_best_entry_wins_across_users() {
        // Two images of the same person plus a decoy: the strongest single
        // entry decides the identity.
        let probe = Embedding { values: vec![1.0, 0.0], model_version: None };
        let gallery = vec![
            enrolled("2001", vec![0.7, 0.7]),
            enrolled("2002", vec![0.99, 0.05]),
            enrolled("2002", vec![0.5, 0.8]),
        ];

        let m = CosineMatcher.best_match(&probe, &gallery, 0.4);
        assert_eq!(m.user_id.as_deref(), Some("2002"));
    }

    #[test]
    fn pixel_rect_clamps_to_frame() {
        let face = BoundingBox {
            x: -10.0,
            y: 5.0,
            width: 100.0,
            height: 100.0,
            confidence: 0.9,
            landmarks: None,
        };
        let (x, y, w, h) = face.pixel_rect(80, 60, 0.0);
        assert_eq!(x, 0);
        assert_eq!(y, 5);
        assert!(x + w <= 80);
        assert!(y + h <= 60);
    }

    #[test]
    fn pixel_rect_applies_margin() {
        let face = BoundingBox {
            x: 100.0,
            y: 100.0,
            width: 50.0,
            height: 50.0,
            confidence: 0.9,
            landmarks: None,
        };
        let (x, y, w, h) = face.pixel_rect(640, 480, 0.2);
        assert_eq!(x, 90);
        assert_eq!(y, 90);
        assert_eq!(w, 70);
        assert_eq!(h, 70);
    }
}
