//! D-Bus interface for the rollcall attendance daemon.
//!
//! Bus name: io.rollcall.Attendance1
//! Object path: /io/rollcall/Attendance1
//!
//! Structured results cross the bus as JSON strings; the AttendanceMarked
//! signal streams live marks to watching clients.

use chrono::Local;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use zbus::interface;
use zbus::object_server::SignalEmitter;

use rollcall_store::AttendanceStore;

use crate::config::Config;
use crate::engine::{EngineHandle, Sighting};

pub struct AttendanceService {
    config: Arc<Config>,
    engine: EngineHandle,
    store: AttendanceStore,
    session_active: Arc<AtomicBool>,
}

impl AttendanceService {
    pub fn new(config: Arc<Config>, engine: EngineHandle, store: AttendanceStore) -> Self {
        Self {
            config,
            engine,
            store,
            session_active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A non-positive threshold from a client means "use the configured default".
    fn resolve_threshold(&self, threshold: f64) -> f32 {
        if threshold > 0.0 {
            threshold as f32
        } else {
            self.config.similarity_threshold
        }
    }

    /// Identify faces in matched sightings and mark attendance for them.
    ///
    /// Returns the JSON rows for the client: known faces carry their name and
    /// whether this pass marked them (false = already marked today).
    fn mark_sightings(&self, sightings: &[Sighting]) -> Result<Vec<serde_json::Value>, String> {
        let mut rows = Vec::with_capacity(sightings.len());
        for s in sightings {
            let row = match &s.user_id {
                Some(user_id) => {
                    let name = self
                        .store
                        .user_name(user_id)
                        .map_err(|e| e.to_string())?
                        .unwrap_or_else(|| "?".to_string());
                    let now = Local::now();
                    let date = now.format("%Y-%m-%d").to_string();
                    let time = now.format("%H:%M:%S").to_string();
                    let marked = self
                        .store
                        .mark_attendance_at(user_id, &name, &date, &time)
                        .map_err(|e| e.to_string())?;
                    serde_json::json!({
                        "user_id": user_id,
                        "name": name,
                        "similarity": s.similarity,
                        "marked": marked,
                        "box": &s.bbox,
                    })
                }
                None => serde_json::json!({
                    "user_id": null,
                    "name": null,
                    "similarity": s.similarity,
                    "marked": null,
                    "box": &s.bbox,
                }),
            };
            rows.push(row);
        }
        Ok(rows)
    }
}

#[interface(name = "io.rollcall.Attendance1")]
impl AttendanceService {
    /// Register (or rename) a user. Returns true when the user is new.
    async fn register_user(&self, user_id: &str, name: &str) -> zbus::fdo::Result<bool> {
        if user_id.trim().is_empty() || name.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs(
                "user_id and name must be non-empty".into(),
            ));
        }
        tracing::info!(user_id, name, "register requested");
        self.store
            .upsert_user(user_id, name)
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Registered users as a JSON array, newest first.
    async fn list_users(&self) -> zbus::fdo::Result<String> {
        let users = self.store.users().map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&users).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Capture registration images for a user. Returns JSON capture stats.
    ///
    /// The user must already be registered; the count is clamped to the
    /// 10–60 range.
    async fn capture_images(&self, user_id: &str, count: u32) -> zbus::fdo::Result<String> {
        let known = self
            .store
            .user_name(user_id)
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
            .is_some();
        if !known {
            return Err(zbus::fdo::Error::Failed(format!(
                "unknown user '{user_id}' — register first"
            )));
        }

        let count = count.clamp(10, 60) as usize;
        tracing::info!(user_id, count, "capture requested");
        let outcome = self
            .engine
            .capture(user_id.to_string(), count)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&outcome).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Rebuild the embedding gallery from all registration images.
    /// Returns JSON training stats.
    async fn train(&self) -> zbus::fdo::Result<String> {
        tracing::info!("training requested");
        let outcome = self
            .engine
            .train()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&outcome).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// One recognition pass: detect, identify, and mark attendance.
    ///
    /// Returns a JSON array with one row per face seen. Pass 0 to use the
    /// configured similarity threshold.
    async fn recognize_once(&self, threshold: f64) -> zbus::fdo::Result<String> {
        let threshold = self.resolve_threshold(threshold);
        let sightings = self
            .engine
            .recognize(threshold)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        let rows = self.mark_sightings(&sightings).map_err(zbus::fdo::Error::Failed)?;
        serde_json::to_string(&rows).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Start the live attendance session loop.
    ///
    /// Returns false when a session is already running. Each newly marked
    /// user is announced with an AttendanceMarked signal.
    async fn start_session(
        &self,
        threshold: f64,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<bool> {
        if self.session_active.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let threshold = self.resolve_threshold(threshold);
        tracing::info!(threshold, "attendance session started");

        let engine = self.engine.clone();
        let store = self.store.clone();
        let active = self.session_active.clone();
        let emitter = emitter.to_owned();
        let poll = Duration::from_millis(self.config.session_poll_ms);
        let cooldown = Duration::from_millis(self.config.mark_cooldown_ms);

        tokio::spawn(async move {
            run_session(engine, store, active, emitter, threshold, poll, cooldown).await;
        });

        Ok(true)
    }

    /// Stop the live attendance session. Returns false when none is running.
    async fn stop_session(&self) -> zbus::fdo::Result<bool> {
        let was_active = self.session_active.swap(false, Ordering::SeqCst);
        if was_active {
            tracing::info!("attendance session stopped");
        }
        Ok(was_active)
    }

    /// Attendance events as a JSON array; empty date means all dates.
    async fn report(&self, date: &str) -> zbus::fdo::Result<String> {
        let filter = if date.is_empty() { None } else { Some(date) };
        let events = self
            .store
            .attendance(filter)
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&events).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Export attendance events to CSV; empty date means all dates, empty
    /// path picks a default under the reports directory. Returns the path
    /// written.
    async fn export_csv(&self, date: &str, path: &str) -> zbus::fdo::Result<String> {
        let filter = if date.is_empty() { None } else { Some(date) };
        let out = if path.is_empty() {
            let stem = if date.is_empty() { "all" } else { date };
            self.config.reports_dir().join(format!("attendance_{stem}.csv"))
        } else {
            std::path::PathBuf::from(path)
        };

        self.store
            .export_csv(&out, filter)
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        Ok(out.to_string_lossy().into_owned())
    }

    /// Daemon status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let engine = self
            .engine
            .status()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        let users = self
            .store
            .user_count()
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": {
                "device": self.config.camera_device,
                "width": engine.camera_width,
                "height": engine.camera_height,
            },
            "gallery_faces": engine.gallery_faces,
            "gallery_users": engine.gallery_users,
            "registered_users": users,
            "session_active": self.session_active.load(Ordering::SeqCst),
            "similarity_threshold": self.config.similarity_threshold,
        })
        .to_string())
    }

    /// Emitted once per newly marked user during a live session.
    #[zbus(signal)]
    async fn attendance_marked(
        emitter: &SignalEmitter<'_>,
        user_id: &str,
        name: &str,
        date: &str,
        time: &str,
    ) -> zbus::Result<()>;
}

/// The live session loop: poll recognition, mark matches, emit signals.
///
/// Per-user cooldown keeps one person standing in frame from hammering the
/// store every pass; the once-per-day rule itself lives in the store.
async fn run_session(
    engine: EngineHandle,
    store: AttendanceStore,
    active: Arc<AtomicBool>,
    emitter: SignalEmitter<'static>,
    threshold: f32,
    poll: Duration,
    cooldown: Duration,
) {
    let mut last_attempt: HashMap<String, Instant> = HashMap::new();

    while active.load(Ordering::SeqCst) {
        tokio::time::sleep(poll).await;

        let sightings = match engine.recognize(threshold).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "recognition pass failed; session continues");
                continue;
            }
        };

        for s in sightings {
            let Some(user_id) = s.user_id else {
                continue;
            };

            if let Some(at) = last_attempt.get(&user_id) {
                if at.elapsed() < cooldown {
                    continue;
                }
            }
            last_attempt.insert(user_id.clone(), Instant::now());

            let name = match store.user_name(&user_id) {
                Ok(Some(name)) => name,
                Ok(None) => {
                    // Trained but since deleted from the store.
                    tracing::warn!(user_id, "recognized user is not registered");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "user lookup failed");
                    continue;
                }
            };

            let now = Local::now();
            let date = now.format("%Y-%m-%d").to_string();
            let time = now.format("%H:%M:%S").to_string();

            match store.mark_attendance_at(&user_id, &name, &date, &time) {
                Ok(true) => {
                    tracing::info!(user_id, name, similarity = s.similarity, "attendance marked");
                    if let Err(e) =
                        AttendanceService::attendance_marked(&emitter, &user_id, &name, &date, &time)
                            .await
                    {
                        tracing::warn!(error = %e, "failed to emit AttendanceMarked");
                    }
                }
                Ok(false) => {
                    tracing::debug!(user_id, "already marked today");
                }
                Err(e) => {
                    tracing::warn!(error = %e, user_id, "marking failed");
                }
            }
        }
    }

    tracing::info!("session loop exited");
}
