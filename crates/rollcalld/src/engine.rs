//! Camera/inference engine.
//!
//! A dedicated OS thread owns the camera, both ONNX sessions, and the
//! in-memory gallery; async callers talk to it through an mpsc request
//! channel with oneshot replies. Startup is fail-fast: a missing camera or
//! model stops the daemon before it claims the bus name.

use chrono::Local;
use image::imageops;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use rollcall_core::recognizer::EMBED_MODEL_VERSION;
use rollcall_core::types::BoundingBox;
use rollcall_core::{CosineMatcher, EnrolledFace, FaceDetector, FaceRecognizer, Gallery, Matcher};
use rollcall_hw::Camera;

use crate::config::Config;

/// Raw captures attempted per requested registration image before giving up.
const CAPTURE_ATTEMPTS_PER_IMAGE: usize = 6;
/// Margin added around a detection when cropping a registration image.
const CROP_MARGIN: f32 = 0.2;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] rollcall_hw::CameraError),
    #[error("detector error: {0}")]
    Detector(#[from] rollcall_core::detector::DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] rollcall_core::recognizer::RecognizerError),
    #[error("gallery error: {0}")]
    Gallery(#[from] rollcall_core::gallery::GalleryError),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Result of a registration capture run.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureOutcome {
    pub saved: usize,
    pub attempts: usize,
    pub dark_skipped: usize,
}

/// Result of a training run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainOutcome {
    pub users_scanned: usize,
    pub images_used: usize,
    pub images_skipped: usize,
    pub gallery_path: String,
}

/// One face seen during a recognition pass.
#[derive(Debug, Clone)]
pub struct Sighting {
    /// Identified user, or `None` for an unknown face.
    pub user_id: Option<String>,
    pub similarity: f32,
    pub bbox: BoundingBox,
}

/// Engine counters surfaced by the daemon status call.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub gallery_faces: usize,
    pub gallery_users: usize,
    pub camera_width: u32,
    pub camera_height: u32,
}

enum EngineRequest {
    Capture {
        user_id: String,
        count: usize,
        reply: oneshot::Sender<Result<CaptureOutcome, EngineError>>,
    },
    Train {
        reply: oneshot::Sender<Result<TrainOutcome, EngineError>>,
    },
    Recognize {
        threshold: f32,
        reply: oneshot::Sender<Result<Vec<Sighting>, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    pub async fn capture(&self, user_id: String, count: usize) -> Result<CaptureOutcome, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Capture { user_id, count, reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn train(&self) -> Result<TrainOutcome, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Train { reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn recognize(&self, threshold: f32) -> Result<Vec<Sighting>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Recognize { threshold, reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

struct Engine {
    camera: Camera,
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    gallery: Gallery,
    images_dir: PathBuf,
    gallery_path: PathBuf,
}

/// Spawn the engine on a dedicated OS thread.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let camera = Camera::open(&config.camera_device)?;
    tracing::info!(
        device = %config.camera_device,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );

    let detector = FaceDetector::load(&config.scrfd_model_path())?;
    let recognizer = FaceRecognizer::load(&config.arcface_model_path())?;

    let gallery_path = config.gallery_path();
    let gallery = match Gallery::load(&gallery_path)? {
        Some(g) if g.model_version == EMBED_MODEL_VERSION => {
            tracing::info!(faces = g.len(), users = g.user_count(), "gallery loaded");
            g
        }
        Some(g) => {
            tracing::warn!(
                found = %g.model_version,
                expected = EMBED_MODEL_VERSION,
                "gallery was trained with a different model; retrain before recognition"
            );
            Gallery::new(EMBED_MODEL_VERSION, "")
        }
        None => {
            tracing::info!("no gallery yet; train after registering users");
            Gallery::new(EMBED_MODEL_VERSION, "")
        }
    };

    if config.warmup_frames > 0 {
        tracing::info!(count = config.warmup_frames, "discarding warmup frames");
        for _ in 0..config.warmup_frames {
            let _ = camera.frame();
        }
    }

    let mut engine = Engine {
        camera,
        detector,
        recognizer,
        gallery,
        images_dir: config.images_dir(),
        gallery_path,
    };

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Capture { user_id, count, reply } => {
                        let _ = reply.send(engine.run_capture(&user_id, count));
                    }
                    EngineRequest::Train { reply } => {
                        let _ = reply.send(engine.run_train());
                    }
                    EngineRequest::Recognize { threshold, reply } => {
                        let _ = reply.send(engine.run_recognize(threshold));
                    }
                    EngineRequest::Status { reply } => {
                        let _ = reply.send(engine.status());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    Ok(EngineHandle { tx })
}

impl Engine {
    /// Capture registration images for one user.
    ///
    /// A frame is saved only when it contains exactly one face — multi-face
    /// and faceless frames would poison the training set. The face region is
    /// cropped with a margin and written as `<user_id>_NNN.jpg`.
    fn run_capture(&mut self, user_id: &str, count: usize) -> Result<CaptureOutcome, EngineError> {
        let dir = self.images_dir.join(user_id);
        std::fs::create_dir_all(&dir)?;

        let mut saved = 0usize;
        let mut attempts = 0usize;
        let mut dark_skipped = 0usize;

        while saved < count && attempts < count * CAPTURE_ATTEMPTS_PER_IMAGE {
            attempts += 1;

            let frame = self.camera.frame()?;
            if frame.is_dark {
                dark_skipped += 1;
                continue;
            }
            let Some(img) = frame.into_image() else {
                continue;
            };

            let faces = self.detector.detect(&img)?;
            if faces.len() != 1 {
                tracing::debug!(faces = faces.len(), "skipping frame without exactly one face");
                continue;
            }

            let (x, y, w, h) = faces[0].pixel_rect(img.width(), img.height(), CROP_MARGIN);
            let crop = imageops::crop_imm(&img, x, y, w, h).to_image();

            let path = dir.join(format!("{user_id}_{:03}.jpg", saved + 1));
            crop.save(&path)?;
            saved += 1;
            tracing::debug!(path = %path.display(), "saved registration image");
        }

        tracing::info!(user_id, saved, attempts, dark_skipped, "capture finished");
        Ok(CaptureOutcome { saved, attempts, dark_skipped })
    }

    /// Rebuild the gallery from every user's registration images.
    ///
    /// Images that do not contain exactly one detectable face are skipped and
    /// counted; the gallery file is replaced wholesale on success.
    fn run_train(&mut self) -> Result<TrainOutcome, EngineError> {
        let trained_at = Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        let mut gallery = Gallery::new(EMBED_MODEL_VERSION, &trained_at);
        let mut users_scanned = 0usize;
        let mut images_skipped = 0usize;

        let entries = match std::fs::read_dir(&self.images_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Nothing registered yet — an empty gallery is still valid.
                self.gallery = gallery;
                self.gallery.save(&self.gallery_path)?;
                return Ok(TrainOutcome {
                    users_scanned: 0,
                    images_used: 0,
                    images_skipped: 0,
                    gallery_path: self.gallery_path.to_string_lossy().into_owned(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let user_id = entry.file_name().to_string_lossy().into_owned();
            users_scanned += 1;

            let mut images: Vec<PathBuf> = std::fs::read_dir(entry.path())?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("jpg") | Some("jpeg") | Some("png")
                    )
                })
                .collect();
            images.sort();

            for path in images {
                match self.embed_image(&path) {
                    Ok(Some(embedding)) => {
                        let source = path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        gallery.faces.push(EnrolledFace {
                            user_id: user_id.clone(),
                            source,
                            trained_at: trained_at.clone(),
                            embedding,
                        });
                    }
                    Ok(None) => {
                        images_skipped += 1;
                        tracing::debug!(path = %path.display(), "skipped: not exactly one face");
                    }
                    Err(e) => {
                        images_skipped += 1;
                        tracing::warn!(path = %path.display(), error = %e, "skipped unreadable image");
                    }
                }
            }
        }

        gallery.save(&self.gallery_path)?;
        let images_used = gallery.len();
        tracing::info!(
            users = users_scanned,
            used = images_used,
            skipped = images_skipped,
            "training complete"
        );
        self.gallery = gallery;

        Ok(TrainOutcome {
            users_scanned,
            images_used,
            images_skipped,
            gallery_path: self.gallery_path.to_string_lossy().into_owned(),
        })
    }

    /// Embed the single face in a registration image, `None` when the image
    /// does not contain exactly one face.
    fn embed_image(
        &mut self,
        path: &std::path::Path,
    ) -> Result<Option<rollcall_core::Embedding>, EngineError> {
        let img = image::open(path)?.to_luma8();
        let faces = self.detector.detect(&img)?;
        if faces.len() != 1 {
            return Ok(None);
        }
        match self.recognizer.embed(&img, &faces[0]) {
            Ok(embedding) => Ok(Some(embedding)),
            Err(rollcall_core::recognizer::RecognizerError::MissingLandmarks) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// One recognition pass: capture a frame, identify every face in it.
    ///
    /// A dark frame yields an empty result rather than an error — the session
    /// loop keeps polling.
    fn run_recognize(&mut self, threshold: f32) -> Result<Vec<Sighting>, EngineError> {
        let (mut frames, dark_skipped) = self.camera.frames(1)?;
        let Some(frame) = frames.pop() else {
            tracing::debug!(dark_skipped, "no usable frame this pass");
            return Ok(Vec::new());
        };
        let Some(img) = frame.into_image() else {
            return Ok(Vec::new());
        };

        let faces = self.detector.detect(&img)?;
        let matcher = CosineMatcher;
        let mut sightings = Vec::with_capacity(faces.len());

        for face in faces {
            let embedding = match self.recognizer.embed(&img, &face) {
                Ok(e) => e,
                Err(rollcall_core::recognizer::RecognizerError::MissingLandmarks) => continue,
                Err(e) => return Err(e.into()),
            };
            let m = matcher.best_match(&embedding, &self.gallery.faces, threshold);
            sightings.push(Sighting {
                user_id: m.user_id,
                similarity: m.similarity,
                bbox: face,
            });
        }

        Ok(sightings)
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            gallery_faces: self.gallery.len(),
            gallery_users: self.gallery.user_count(),
            camera_width: self.camera.width,
            camera_height: self.camera.height,
        }
    }
}
