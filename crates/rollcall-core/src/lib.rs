//! rollcall-core — Face identification engine for attendance tracking.
//!
//! Detection uses SCRFD, embedding extraction uses ArcFace, both pre-trained
//! ONNX models running on CPU via ONNX Runtime. Matching is a full-gallery
//! cosine-similarity scan; the gallery itself is a flat JSON file produced by
//! the training pass.

pub mod alignment;
pub mod detector;
pub mod gallery;
pub mod recognizer;
pub mod types;

pub use detector::FaceDetector;
pub use gallery::{EnrolledFace, Gallery};
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, CosineMatcher, Embedding, FaceMatch, Matcher};
