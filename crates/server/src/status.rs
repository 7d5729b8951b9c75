use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Serialize)]
struct ServerStatus {
    mode: ServerMode,
    active_sessions: usize,
    #[serde(serialize_with = "serialize_iso")]
    started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_iso")]
    updated_at: DateTime<Utc>,
}

/// Serialize as ISO 8601 with millisecond precision.
fn serialize_iso<S: serde::Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
}

/// Operational status, persisted to a JSON file atomically on every change.
///
/// Share via `Arc<StatusTracker>` — immutable fields live outside the mutex.
pub struct StatusTracker {
    started_at: DateTime<Utc>,
    path: PathBuf,
    state: Mutex<MutableState>,
}

struct MutableState {
    mode: ServerMode,
    active_sessions: usize,
}

impl StatusTracker {
    pub fn new(path: PathBuf) -> Self {
        Self {
            started_at: Utc::now(),
            path,
            state: Mutex::new(MutableState {
                mode: ServerMode::Running,
                active_sessions: 0,
            }),
        }
    }

    pub async fn set_mode(&self, mode: ServerMode) {
        let mut state = self.state.lock().await;
        state.mode = mode;
        self.write_status(&state).await;
    }

    pub async fn session_started(&self) {
        let mut state = self.state.lock().await;
        state.active_sessions += 1;
        self.write_status(&state).await;
    }

    pub async fn session_ended(&self) {
        let mut state = self.state.lock().await;
        state.active_sessions = state.active_sessions.saturating_sub(1);
        self.write_status(&state).await;
    }

    /// Write the initial status file.
    pub async fn write_initial(&self) {
        let state = self.state.lock().await;
        self.write_status(&state).await;
    }

    pub async fn active_sessions(&self) -> usize {
        self.state.lock().await.active_sessions
    }

    /// Atomic write: temp file in the same directory, then rename.
    async fn write_status(&self, state: &MutableState) {
        let status = ServerStatus {
            mode: state.mode,
            active_sessions: state.active_sessions,
            started_at: self.started_at,
            updated_at: Utc::now(),
        };

        let json = match serde_json::to_string_pretty(&status) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize status");
                return;
            }
        };

        let tmp = self.path.with_extension("json.tmp");
        if let Err(e) = tokio::fs::write(&tmp, json).await {
            warn!(error = %e, "failed to write status file");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            warn!(error = %e, "failed to move status file into place");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_follow_session_lifecycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = StatusTracker::new(dir.path().join("status.json"));

        tracker.session_started().await;
        tracker.session_started().await;
        assert_eq!(tracker.active_sessions().await, 2);

        tracker.session_ended().await;
        assert_eq!(tracker.active_sessions().await, 1);

        // Never goes negative.
        tracker.session_ended().await;
        tracker.session_ended().await;
        assert_eq!(tracker.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn status_file_is_written_and_valid_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone());

        tracker.write_initial().await;
        tracker.set_mode(ServerMode::Stopping).await;

        let content = tokio::fs::read_to_string(&path).await.expect("read");
        let parsed: serde_json::Value = serde_json::from_str(&content).expect("json");
        assert_eq!(parsed["mode"], "stopping");
        assert_eq!(parsed["active_sessions"], 0);
        assert!(parsed["started_at"].as_str().expect("ts").ends_with('Z'));

        // No temp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }
}
