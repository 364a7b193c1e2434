//! Authenticated payload download: fetch a vendor downloader tool, run it until the user
//! completes the device login, then unpack the archive it produced into the server root.

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use kiln_process::{DownloadProgress, DownloadStatus, ServerId};
use regex::Regex;
use tokio::sync::watch;

use crate::{
    ansi::strip_ansi,
    config::{AgentConfig, DownloadConfig},
    error::{Result, SupervisorError},
    fetch::{download_file_atomic, extract_zip_until, make_executable},
    process_handle::{LaunchSpec, ProcessHandle},
};

const TOOL_ARCHIVE: &str = "downloader.zip";
const TOOL_DIR: &str = "tool";
const TAIL_LINES: usize = 20;
const SPAWN_ATTEMPTS: u32 = 3;

pub type ProgressFn = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// `archive` is the file name the tool produced; `files` were extracted.
    Completed { archive: String, files: usize },
    Aborted,
}

/// Removes the run's abort handle when the run ends, however it ends.
struct ActiveEntry<'a> {
    active: &'a Mutex<HashMap<ServerId, watch::Sender<bool>>>,
    id: ServerId,
}

impl Drop for ActiveEntry<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

pub struct DownloadOrchestrator {
    config: Arc<AgentConfig>,
    auth_re: Regex,
    archive_re: Regex,
    active: Mutex<HashMap<ServerId, watch::Sender<bool>>>,
}

impl DownloadOrchestrator {
    pub fn new(config: Arc<AgentConfig>) -> Result<Self> {
        let DownloadConfig {
            auth_url_pattern,
            archive_pattern,
            ..
        } = &config.download;
        let auth_re = Regex::new(auth_url_pattern)
            .map_err(|e| SupervisorError::Config(format!("auth url pattern: {e}")))?;
        let archive_re = Regex::new(archive_pattern)
            .map_err(|e| SupervisorError::Config(format!("archive pattern: {e}")))?;
        Ok(Self {
            config,
            auth_re,
            archive_re,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_active(&self, id: &ServerId) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    /// Kills the downloader of `id`, if one is running. The run then finishes as
    /// [`DownloadOutcome::Aborted`].
    pub fn abort(&self, id: &ServerId) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.get(id) {
            Some(tx) => {
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Runs the whole workflow for `id`, extracting the payload into `target_dir`.
    ///
    /// Every stage reports progress before it starts. The scratch directory is removed on
    /// every path out, then the final `completed`, `aborted` or `error` progress is sent.
    pub async fn run(
        &self,
        id: &ServerId,
        target_dir: &Path,
        on_progress: ProgressFn,
    ) -> Result<DownloadOutcome> {
        let (abort_tx, abort_rx) = watch::channel(false);
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.contains_key(id) {
                return Err(SupervisorError::ConflictingOperation(format!(
                    "a download is already running for {id}"
                )));
            }
            active.insert(id.clone(), abort_tx);
        }
        let _entry = ActiveEntry {
            active: &self.active,
            id: id.clone(),
        };

        let safe_id: String = id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let scratch = self
            .config
            .scratch_root()
            .join(format!("download-{safe_id}-{}", uuid::Uuid::new_v4()));
        tracing::info!(server = %id, scratch = %scratch.display(), "download started");

        let result = self
            .stages(&scratch, target_dir, abort_rx, on_progress.clone())
            .await;

        on_progress(DownloadProgress::new(
            DownloadStatus::CleaningUp,
            "removing temporary files",
        ));
        if let Err(err) = tokio::fs::remove_dir_all(&scratch).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(server = %id, error = %err, "scratch dir not removed");
        }

        match &result {
            Ok(DownloadOutcome::Completed { archive, files }) => {
                tracing::info!(server = %id, %archive, files, "download finished");
                on_progress(DownloadProgress::new(
                    DownloadStatus::Completed,
                    format!("extracted {files} files from {archive}"),
                ));
            }
            Ok(DownloadOutcome::Aborted) => {
                tracing::info!(server = %id, "download aborted");
                on_progress(DownloadProgress::new(DownloadStatus::Aborted, "download aborted"));
            }
            Err(err) => {
                tracing::warn!(server = %id, error = %err, "download failed");
                on_progress(DownloadProgress::new(DownloadStatus::Error, err.to_string()));
            }
        }
        result
    }

    async fn stages(
        &self,
        scratch: &Path,
        target_dir: &Path,
        mut abort: watch::Receiver<bool>,
        on_progress: ProgressFn,
    ) -> Result<DownloadOutcome> {
        let cfg = &self.config.download;
        tokio::fs::create_dir_all(scratch).await?;

        on_progress(DownloadProgress::new(
            DownloadStatus::FetchingTool,
            format!("downloading {}", cfg.tool_url),
        ));
        let tool_zip = scratch.join(TOOL_ARCHIVE);
        let progress = on_progress.clone();
        let fetch = download_file_atomic(&cfg.tool_url, &tool_zip, None, move |done, total, speed| {
            progress(DownloadProgress::new(
                DownloadStatus::FetchingTool,
                format!(
                    "{:.1}/{:.1} MiB ({:.1} MiB/s)",
                    mib(done),
                    mib(total),
                    mib(speed)
                ),
            ));
        });
        let Some(fetched) = until_aborted(&mut abort, fetch).await else {
            return Ok(DownloadOutcome::Aborted);
        };
        fetched?;

        on_progress(DownloadProgress::new(
            DownloadStatus::ExtractingTool,
            "unpacking downloader",
        ));
        let tool_dir = scratch.join(TOOL_DIR);
        if extract_unless_aborted(&mut abort, tool_zip.clone(), tool_dir.clone())
            .await?
            .is_none()
        {
            return Ok(DownloadOutcome::Aborted);
        }

        let binary = find_file(&tool_dir, &cfg.tool_binary, 4).ok_or_else(|| {
            SupervisorError::DownloadFailure(format!(
                "{} not found in the downloader archive",
                cfg.tool_binary
            ))
        })?;
        make_executable(&binary)?;

        on_progress(DownloadProgress::new(
            DownloadStatus::Preparing,
            format!("starting {}", cfg.tool_binary),
        ));
        let scan = Arc::new(OutputScan::new(
            self.auth_re.clone(),
            self.archive_re.clone(),
            on_progress.clone(),
        ));
        let mut spec = LaunchSpec::new(
            binary.display().to_string(),
            cfg.tool_args.clone(),
            scratch.to_path_buf(),
        );
        spec.stdin = false;
        let handle = spawn_tool(&spec, scan.clone()).await?;
        on_progress(DownloadProgress::new(
            DownloadStatus::Running,
            "downloader running",
        ));

        let Some(outcome) = until_aborted(&mut abort, handle.wait()).await else {
            handle.signal(crate::process_handle::Signal::Kill);
            handle.wait().await;
            return Ok(DownloadOutcome::Aborted);
        };
        if *abort.borrow() {
            return Ok(DownloadOutcome::Aborted);
        }
        if outcome.code != Some(0) {
            return Err(SupervisorError::DownloadFailure(format!(
                "downloader exited (code {:?}, signal {:?}): {}",
                outcome.code,
                outcome.signal,
                scan.tail().join(" | ")
            )));
        }

        let archive = scan
            .archive_name()
            .map(|name| scratch.join(name))
            .filter(|p| p.is_file())
            .or_else(|| newest_zip(scratch, &[tool_zip.as_path()]))
            .ok_or_else(|| {
                SupervisorError::DownloadFailure(
                    "downloader finished but produced no archive".to_string(),
                )
            })?;
        let archive_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if *abort.borrow() {
            return Ok(DownloadOutcome::Aborted);
        }
        on_progress(DownloadProgress::new(
            DownloadStatus::ExtractingPayload,
            format!("extracting {archive_name}"),
        ));
        let Some(files) =
            extract_unless_aborted(&mut abort, archive, target_dir.to_path_buf()).await?
        else {
            return Ok(DownloadOutcome::Aborted);
        };

        Ok(DownloadOutcome::Completed {
            archive: archive_name,
            files,
        })
    }
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Runs `fut` unless the abort flag is raised first.
async fn until_aborted<F: std::future::Future>(
    abort: &mut watch::Receiver<bool>,
    fut: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = wait_abort(abort) => None,
        out = fut => Some(out),
    }
}

/// Unpacks `zip` on the blocking pool. On abort the extraction is told to stop and is
/// awaited, so nothing lands in `dest` after this returns `None`.
async fn extract_unless_aborted(
    abort: &mut watch::Receiver<bool>,
    zip: PathBuf,
    dest: PathBuf,
) -> Result<Option<usize>> {
    let stop = Arc::new(AtomicBool::new(false));
    let mut task = {
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || extract_zip_until(&zip, &dest, &stop))
    };
    let Some(joined) = until_aborted(abort, &mut task).await else {
        stop.store(true, Ordering::SeqCst);
        let _ = task.await;
        return Ok(None);
    };
    let files = joined.map_err(|e| anyhow::anyhow!("extract task failed: {e}"))??;
    Ok(Some(files))
}

async fn wait_abort(abort: &mut watch::Receiver<bool>) {
    if abort.wait_for(|a| *a).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Freshly extracted executables can still be held open for writing by a concurrent
/// fork elsewhere in the process; retry the spawn briefly on ETXTBSY.
async fn spawn_tool(spec: &LaunchSpec, scan: Arc<OutputScan>) -> Result<ProcessHandle> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let scan = scan.clone();
        match ProcessHandle::spawn(spec, move |_, line| scan.observe(&line)) {
            Ok(handle) => return Ok(handle),
            Err(err) if is_text_busy(&err) && attempt < SPAWN_ATTEMPTS => {
                tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
            }
            Err(err) => return Err(SupervisorError::spawn(&err, &spec.exec)),
        }
    }
}

#[cfg(unix)]
fn is_text_busy(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::ETXTBSY)
}

#[cfg(not(unix))]
fn is_text_busy(_err: &std::io::Error) -> bool {
    false
}

/// Watches the downloader's combined output for the login URL and the archive name.
struct OutputScan {
    auth_re: Regex,
    archive_re: Regex,
    on_progress: ProgressFn,
    auth_sent: AtomicBool,
    archive: Mutex<Option<String>>,
    tail: Mutex<VecDeque<String>>,
}

impl OutputScan {
    fn new(auth_re: Regex, archive_re: Regex, on_progress: ProgressFn) -> Self {
        Self {
            auth_re,
            archive_re,
            on_progress,
            auth_sent: AtomicBool::new(false),
            archive: Mutex::new(None),
            tail: Mutex::new(VecDeque::with_capacity(TAIL_LINES)),
        }
    }

    fn observe(&self, raw: &str) {
        let line = strip_ansi(raw);
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        {
            let mut tail = self.tail.lock().unwrap_or_else(|e| e.into_inner());
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.to_string());
        }

        if let Some(m) = self.auth_re.find(line)
            && !self.auth_sent.swap(true, Ordering::SeqCst)
        {
            (self.on_progress)(DownloadProgress::auth_required(m.as_str()));
            return;
        }

        if let Some(caps) = self.archive_re.captures(line) {
            let name = caps
                .get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().to_string());
            if let Some(name) = name {
                *self.archive.lock().unwrap_or_else(|e| e.into_inner()) = Some(name);
            }
        }

        (self.on_progress)(DownloadProgress::new(DownloadStatus::Running, line));
    }

    fn archive_name(&self) -> Option<String> {
        self.archive.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn tail(&self) -> Vec<String> {
        self.tail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

fn find_file(root: &Path, name: &str, max_depth: usize) -> Option<PathBuf> {
    fn walk(cur: &Path, name: &str, depth: usize, max_depth: usize) -> Option<PathBuf> {
        let entries = std::fs::read_dir(cur).ok()?;
        let mut dirs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            } else if path.file_name().is_some_and(|n| n == name) {
                return Some(path);
            }
        }
        if depth >= max_depth {
            return None;
        }
        dirs.sort();
        dirs.into_iter()
            .find_map(|d| walk(&d, name, depth + 1, max_depth))
    }
    walk(root, name, 0, max_depth)
}

/// Most recently modified `*.zip` directly in `dir`, skipping `exclude`.
fn newest_zip(dir: &Path, exclude: &[&Path]) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
                && !exclude.contains(&p.as_path())
        })
        .filter_map(|p| {
            let modified = std::fs::metadata(&p).and_then(|m| m.modified()).ok()?;
            Some((modified, p))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, p)| p)
}
