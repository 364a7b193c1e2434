use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use kiln_process::{LogEntry, ServerStatus};
use tokio::{
    io::{AsyncWriteExt, BufWriter},
    sync::{broadcast, mpsc},
};

use crate::{ansi::strip_ansi, config::ConsoleLogConfig};

/// Everything an adapter publishes. Logs and status changes share one channel so a
/// subscriber sees a status transition only after the lines that led to it.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    Log(LogEntry),
    Status(ServerStatus),
}

#[derive(Debug)]
struct Ring {
    capacity: usize,
    entries: VecDeque<LogEntry>,
}

impl Ring {
    fn push(&mut self, entry: LogEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }
}

/// Bounded buffer of sanitized console lines plus the live fan-out point.
#[derive(Clone)]
pub struct LogSink {
    ring: Arc<Mutex<Ring>>,
    events: broadcast::Sender<AdapterEvent>,
    file_tx: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

impl LogSink {
    pub fn new(capacity: usize, events: broadcast::Sender<AdapterEvent>) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Arc::new(Mutex::new(Ring {
                capacity,
                entries: VecDeque::with_capacity(capacity.min(4096)),
            })),
            events,
            file_tx: Arc::new(Mutex::new(None)),
        }
    }

    /// Sanitizes one raw output line and records it. Lines left with no characters at all
    /// once escape codes are removed are dropped; indentation-only lines are kept since
    /// some servers print them as spacers.
    pub fn append(&self, raw: &str) -> Option<LogEntry> {
        let line = strip_ansi(raw.trim_end_matches(['\r', '\n']));
        if line.is_empty() {
            return None;
        }
        let entry = LogEntry::now(line);
        self.push(entry.clone());
        Some(entry)
    }

    /// Records a supervisor-originated line (`[kiln] ...`).
    pub fn note(&self, message: impl AsRef<str>) {
        self.append(&format!("[kiln] {}", message.as_ref()));
    }

    fn push(&self, entry: LogEntry) {
        self.ring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        if let Some(tx) = self.file_tx.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            let _ = tx.send(entry.line.clone());
        }
        // No receivers is fine: delivery is fire-and-forget.
        let _ = self.events.send(AdapterEvent::Log(entry));
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.entries.iter().cloned().collect()
    }

    /// The most recent `limit` entries, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<LogEntry> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let start = ring.entries.len().saturating_sub(limit);
        ring.entries.iter().skip(start).cloned().collect()
    }

    pub fn clear(&self) {
        self.ring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .clear();
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).capacity
    }

    /// Live lines from now on. No backlog is replayed; read it with [`LogSink::snapshot`].
    pub fn subscribe(&self) -> LogSubscription {
        LogSubscription {
            rx: self.events.subscribe(),
        }
    }

    /// Mirrors every future line into a size-rotated file. Replaces any previous mirror.
    pub fn mirror_to_file(&self, path: PathBuf, limits: &ConsoleLogConfig) {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(ConsoleFile::new(path, limits).run(rx));
        *self.file_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
    }
}

pub struct LogSubscription {
    rx: broadcast::Receiver<AdapterEvent>,
}

impl LogSubscription {
    /// Next live line; `None` once the adapter is gone.
    pub async fn recv(&mut self) -> Option<LogEntry> {
        loop {
            match self.rx.recv().await {
                Ok(AdapterEvent::Log(entry)) => return Some(entry),
                Ok(AdapterEvent::Status(_)) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "log subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// `console.log` capped at `max_bytes`, with `console.log.1` (newest) up to
/// `console.log.<max_files>` kept as backups. Opened lazily, so a failed open is retried on
/// the next line instead of disabling the mirror.
struct ConsoleFile {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    len: u64,
    out: Option<BufWriter<tokio::fs::File>>,
}

impl ConsoleFile {
    fn new(path: PathBuf, limits: &ConsoleLogConfig) -> Self {
        Self {
            path,
            max_bytes: limits.max_bytes,
            max_files: limits.max_files,
            len: 0,
            out: None,
        }
    }

    /// Drains `rx` until every sender is gone, flushing whenever the queue runs dry.
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(first) = rx.recv().await {
            let mut next = Some(first);
            while let Some(line) = next {
                if let Err(err) = self.push(&line).await {
                    tracing::warn!(path = %self.path.display(), error = %err, "console log write failed");
                    self.out = None;
                }
                next = rx.try_recv().ok();
            }
            if let Err(err) = self.flush().await {
                tracing::warn!(path = %self.path.display(), error = %err, "console log flush failed");
                self.out = None;
            }
        }
        let _ = self.flush().await;
    }

    async fn push(&mut self, line: &str) -> std::io::Result<()> {
        let incoming = line.len() as u64 + 1;
        if self.max_bytes > 0 && self.current_len().await? + incoming > self.max_bytes {
            self.flush().await?;
            self.out = None;
            shift_backups(&self.path, self.max_files).await?;
            self.len = 0;
        }

        let mut out = match self.out.take() {
            Some(out) => out,
            None => {
                if let Some(parent) = self.path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await?;
                BufWriter::new(file)
            }
        };
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        self.out = Some(out);
        self.len += incoming;
        Ok(())
    }

    /// Bytes already in the live file. Read from disk only before the first open.
    async fn current_len(&mut self) -> std::io::Result<u64> {
        if self.out.is_none() {
            self.len = match tokio::fs::metadata(&self.path).await {
                Ok(meta) => meta.len(),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
                Err(err) => return Err(err),
            };
        }
        Ok(self.len)
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self.out.as_mut() {
            Some(out) => out.flush().await,
            None => Ok(()),
        }
    }
}

fn numbered(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

async fn rename_if_present(from: &Path, to: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Moves `path` to `path.1`, each `path.n` to `path.n+1`, and discards what falls past `keep`.
async fn shift_backups(path: &Path, keep: usize) -> std::io::Result<()> {
    if keep == 0 {
        return match tokio::fs::remove_file(path).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        };
    }
    let _ = tokio::fs::remove_file(numbered(path, keep)).await;
    for n in (1..keep).rev() {
        rename_if_present(&numbered(path, n), &numbered(path, n + 1)).await?;
    }
    rename_if_present(path, &numbered(path, 1)).await
}
