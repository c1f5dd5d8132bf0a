//! SQLite-backed attendance store.
//!
//! Two tables: registered users and attendance events. An event is unique per
//! (user, date) — marking the same person twice on one day is a signaled
//! no-op, not an error. Reports are date-filtered reads with CSV export.

use chrono::Local;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("poisoned database lock")]
    PoisonedLock,
}

/// A registered user.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub user_id: String,
    pub name: String,
    pub created_at: String,
}

/// One attendance event.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceEvent {
    pub user_id: String,
    pub name: String,
    pub date: String,
    pub time: String,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS attendance (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    att_date TEXT NOT NULL,
    att_time TEXT NOT NULL,
    UNIQUE(user_id, att_date)
);
";

/// Clone-safe handle to the attendance database.
#[derive(Clone)]
pub struct AttendanceStore {
    conn: Arc<Mutex<Connection>>,
}

impl AttendanceStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(path = %path.display(), "attendance database ready");
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::PoisonedLock)
    }

    /// Insert or replace a user. Returns true when the user is new.
    pub fn upsert_user(&self, user_id: &str, name: &str) -> Result<bool, StoreError> {
        let conn = self.lock_conn()?;
        let existed: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM users WHERE user_id = ?1",
                params![user_id.trim()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)?;

        conn.execute(
            "INSERT OR REPLACE INTO users (user_id, name, created_at) VALUES (?1, ?2, ?3)",
            params![
                user_id.trim(),
                name.trim(),
                Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
            ],
        )?;
        Ok(!existed)
    }

    /// All registered users, newest first.
    pub fn users(&self) -> Result<Vec<User>, StoreError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare("SELECT user_id, name, created_at FROM users ORDER BY created_at DESC")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(User {
                    user_id: row.get(0)?,
                    name: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Display name for a user, if registered.
    pub fn user_name(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock_conn()?;
        match conn.query_row(
            "SELECT name FROM users WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        ) {
            Ok(name) => Ok(Some(name)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn user_count(&self) -> Result<usize, StoreError> {
        let conn = self.lock_conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Mark attendance for today, local clock.
    ///
    /// Returns true when marked now, false when the user was already marked
    /// today.
    pub fn mark_attendance(&self, user_id: &str, name: &str) -> Result<bool, StoreError> {
        let now = Local::now();
        self.mark_attendance_at(
            user_id,
            name,
            &now.format("%Y-%m-%d").to_string(),
            &now.format("%H:%M:%S").to_string(),
        )
    }

    /// Mark attendance for an explicit date/time.
    ///
    /// The UNIQUE(user_id, att_date) constraint enforces once-per-day; the
    /// conflict surfaces as `Ok(false)`.
    pub fn mark_attendance_at(
        &self,
        user_id: &str,
        name: &str,
        date: &str,
        time: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.lock_conn()?;
        let result = conn.execute(
            "INSERT INTO attendance (user_id, name, att_date, att_time) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, name, date, time],
        );
        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Attendance events, optionally filtered to one date, newest first.
    pub fn attendance(&self, date: Option<&str>) -> Result<Vec<AttendanceEvent>, StoreError> {
        let conn = self.lock_conn()?;
        let map = |row: &rusqlite::Row<'_>| {
            Ok(AttendanceEvent {
                user_id: row.get(0)?,
                name: row.get(1)?,
                date: row.get(2)?,
                time: row.get(3)?,
            })
        };

        let rows = match date {
            Some(d) => {
                let mut stmt = conn.prepare(
                    "SELECT user_id, name, att_date, att_time FROM attendance \
                     WHERE att_date = ?1 ORDER BY att_time DESC",
                )?;
                let rows = stmt.query_map(params![d], map)?.collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT user_id, name, att_date, att_time FROM attendance \
                     ORDER BY att_date DESC, att_time DESC",
                )?;
                let rows = stmt.query_map([], map)?.collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(rows)
    }

    /// Export attendance events to a CSV file. Returns the row count.
    pub fn export_csv(&self, path: &Path, date: Option<&str>) -> Result<usize, StoreError> {
        let events = self.attendance(date)?;

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "user_id,name,date,time")?;
        for e in &events {
            writeln!(
                file,
                "{},{},{},{}",
                csv_field(&e.user_id),
                csv_field(&e.name),
                csv_field(&e.date),
                csv_field(&e.time)
            )?;
        }

        tracing::info!(path = %path.display(), rows = events.len(), "exported attendance CSV");
        Ok(events.len())
    }
}

/// Quote a CSV field when it contains a delimiter, quote, or newline.
fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, AttendanceStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = AttendanceStore::open(&dir.path().join("attendance.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn upsert_user_reports_new_vs_replaced() {
        let (_dir, store) = open_temp();
        assert!(store.upsert_user("1001", "Sai Manoj").unwrap());
        assert!(!store.upsert_user("1001", "Sai M.").unwrap());

        let users = store.users().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].name, "Sai M.");
    }

    #[test]
    fn upsert_user_trims_whitespace() {
        let (_dir, store) = open_temp();
        store.upsert_user(" 1001 ", "  Ada  ").unwrap();
        let users = store.users().unwrap();
        assert_eq!(users[0].user_id, "1001");
        assert_eq!(users[0].name, "Ada");
    }

    #[test]
    fn user_name_lookup() {
        let (_dir, store) = open_temp();
        store.upsert_user("1001", "Ada").unwrap();
        assert_eq!(store.user_name("1001").unwrap().as_deref(), Some("Ada"));
        assert!(store.user_name("9999").unwrap().is_none());
    }

    #[test]
    fn mark_attendance_once_per_day() {
        let (_dir, store) = open_temp();
        store.upsert_user("1001", "Ada").unwrap();

        assert!(store.mark_attendance_at("1001", "Ada", "2026-08-06", "09:00:00").unwrap());
        // Second mark on the same day is refused, not an error.
        assert!(!store.mark_attendance_at("1001", "Ada", "2026-08-06", "09:05:00").unwrap());
        // A new day marks again.
        assert!(store.mark_attendance_at("1001", "Ada", "2026-08-07", "08:55:00").unwrap());

        assert_eq!(store.attendance(None).unwrap().len(), 2);
    }

    #[test]
    fn attendance_filters_by_date() {
        let (_dir, store) = open_temp();
        store.mark_attendance_at("1001", "Ada", "2026-08-06", "09:00:00").unwrap();
        store.mark_attendance_at("1002", "Grace", "2026-08-06", "09:12:00").unwrap();
        store.mark_attendance_at("1001", "Ada", "2026-08-07", "08:50:00").unwrap();

        let day = store.attendance(Some("2026-08-06")).unwrap();
        assert_eq!(day.len(), 2);
        // Newest first within the day.
        assert_eq!(day[0].user_id, "1002");
        assert_eq!(day[1].user_id, "1001");

        assert!(store.attendance(Some("2026-01-01")).unwrap().is_empty());
        assert_eq!(store.attendance(None).unwrap().len(), 3);
    }

    #[test]
    fn mark_attendance_uses_today() {
        let (_dir, store) = open_temp();
        assert!(store.mark_attendance("1001", "Ada").unwrap());
        let today = Local::now().format("%Y-%m-%d").to_string();
        let rows = store.attendance(Some(&today)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, "1001");
    }

    #[test]
    fn export_csv_writes_rows() {
        let (dir, store) = open_temp();
        store.mark_attendance_at("1001", "Ada", "2026-08-06", "09:00:00").unwrap();
        store.mark_attendance_at("1002", "Lovelace, Grace", "2026-08-06", "09:12:00").unwrap();

        let out = dir.path().join("reports").join("attendance_2026-08-06.csv");
        let rows = store.export_csv(&out, Some("2026-08-06")).unwrap();
        assert_eq!(rows, 2);

        let content = std::fs::read_to_string(&out).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("user_id,name,date,time"));
        // Comma-bearing name is quoted.
        assert!(content.contains("\"Lovelace, Grace\""));
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn export_csv_empty_filter() {
        let (dir, store) = open_temp();
        let out = dir.path().join("empty.csv");
        let rows = store.export_csv(&out, Some("1999-01-01")).unwrap();
        assert_eq!(rows, 0);
        assert_eq!(std::fs::read_to_string(&out).unwrap().lines().count(), 1);
    }

    #[test]
    fn csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn user_count() {
        let (_dir, store) = open_temp();
        assert_eq!(store.user_count().unwrap(), 0);
        store.upsert_user("1001", "Ada").unwrap();
        store.upsert_user("1002", "Grace").unwrap();
        assert_eq!(store.user_count().unwrap(), 2);
    }
}
