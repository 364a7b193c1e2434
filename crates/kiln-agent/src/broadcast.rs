use std::sync::Mutex;

use chrono::{DateTime, Utc};
use kiln_process::{DownloadProgress, ServerId, ServerStatus, UpdateProgress};

/// Outbound event port toward connected clients. Delivery is fire-and-forget.
pub trait BroadcastSink: Send + Sync {
    fn emit_status(&self, server: &ServerId, status: ServerStatus);
    fn emit_log(&self, server: &ServerId, line: &str, timestamp: DateTime<Utc>);
    fn emit_download_progress(&self, server: &ServerId, progress: &DownloadProgress);
    fn emit_update_progress(&self, server: &ServerId, progress: &UpdateProgress);
}

/// Writes every event to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingBroadcast;

impl BroadcastSink for TracingBroadcast {
    fn emit_status(&self, server: &ServerId, status: ServerStatus) {
        tracing::info!(target: "kiln::events", server = %server, %status, "status");
    }

    fn emit_log(&self, server: &ServerId, line: &str, timestamp: DateTime<Utc>) {
        tracing::info!(target: "kiln::console", server = %server, ts = %timestamp.to_rfc3339(), "{line}");
    }

    fn emit_download_progress(&self, server: &ServerId, progress: &DownloadProgress) {
        tracing::info!(
            target: "kiln::events",
            server = %server,
            status = ?progress.status,
            auth_url = progress.auth_url.as_deref().unwrap_or(""),
            "download: {}",
            progress.message
        );
    }

    fn emit_update_progress(&self, server: &ServerId, progress: &UpdateProgress) {
        tracing::info!(
            target: "kiln::events",
            server = %server,
            status = ?progress.status,
            "update: {}",
            progress.message
        );
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedEvent {
    Status(ServerId, ServerStatus),
    Log(ServerId, String),
    Download(ServerId, DownloadProgress),
    Update(ServerId, UpdateProgress),
}

/// Keeps every event in memory. Used by tests and embedders that poll.
#[derive(Debug, Default)]
pub struct RecordingBroadcast {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingBroadcast {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn push(&self, ev: RecordedEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(ev);
    }
}

impl BroadcastSink for RecordingBroadcast {
    fn emit_status(&self, server: &ServerId, status: ServerStatus) {
        self.push(RecordedEvent::Status(server.clone(), status));
    }

    fn emit_log(&self, server: &ServerId, line: &str, _timestamp: DateTime<Utc>) {
        self.push(RecordedEvent::Log(server.clone(), line.to_string()));
    }

    fn emit_download_progress(&self, server: &ServerId, progress: &DownloadProgress) {
        self.push(RecordedEvent::Download(server.clone(), progress.clone()));
    }

    fn emit_update_progress(&self, server: &ServerId, progress: &UpdateProgress) {
        self.push(RecordedEvent::Update(server.clone(), progress.clone()));
    }
}
