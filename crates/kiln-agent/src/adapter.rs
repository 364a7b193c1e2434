use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use kiln_process::{
    ConfigPatch, GameConfig, InstallConfig, InstallResult, LogEntry, ServerId, ServerStatus,
    UpdateChannel,
};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast, watch};

use crate::{
    config::AgentConfig,
    error::{Result, SupervisorError},
    log_sink::{AdapterEvent, LogSink, LogSubscription},
    minecraft::write_atomic,
    process_handle::{ExitOutcome, LaunchSpec, ProcessHandle, wait_exit},
    shutdown::{ShutdownStep, escalate},
};

const EVENT_CAPACITY: usize = 1024;
const RUN_FILE: &str = "run.json";

/// The artifact an update replaces, and where new versions come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateTarget {
    pub channel: UpdateChannel,
    pub artifact: PathBuf,
}

/// Game-specific behavior behind a [`ServerAdapter`].
#[async_trait]
pub trait GameVariant: Send + Sync {
    fn game_type(&self) -> &'static str;

    /// Directory that holds everything belonging to this server.
    fn root_dir(&self) -> &Path;

    /// Files and directories that must exist before a start is attempted.
    fn required_artifacts(&self) -> Vec<PathBuf>;

    fn launch_spec(&self) -> Result<LaunchSpec>;

    /// Console command that asks the server to shut down cleanly.
    fn stop_command(&self) -> &str {
        "stop"
    }

    async fn install(&self, config: &InstallConfig) -> Result<InstallResult>;

    async fn read_config(&self) -> Result<GameConfig>;

    async fn write_config(&self, patch: &ConfigPatch) -> Result<GameConfig>;

    /// `None` when the variant cannot be updated in place.
    fn update_target(&self) -> Option<UpdateTarget> {
        None
    }
}

#[derive(Debug)]
struct State {
    status: ServerStatus,
    process: Option<Arc<ProcessHandle>>,
    stop_requested: bool,
    /// Bumped on every spawn so a late exit from an older run cannot settle a newer one.
    run_id: u64,
    /// Set once the registry dropped this adapter; it never starts again.
    retired: bool,
}

struct Shared {
    id: ServerId,
    state: Mutex<State>,
    events: broadcast::Sender<AdapterEvent>,
    logs: LogSink,
}

impl Shared {
    fn set_status(&self, st: &mut State, status: ServerStatus) {
        if st.status == status {
            return;
        }
        tracing::info!(server = %self.id, from = %st.status, to = %status, "status changed");
        st.status = status;
        let _ = self.events.send(AdapterEvent::Status(status));
    }

    /// Detaches the process of `run_id` and moves to the status its exit implies. A no-op
    /// when that run was already settled. Returns the status after settling.
    async fn settle(&self, run_id: u64, outcome: ExitOutcome) -> ServerStatus {
        let mut st = self.state.lock().await;
        if st.run_id != run_id || st.process.is_none() {
            return st.status;
        }
        st.process = None;

        let next = if st.stop_requested || outcome.is_clean() {
            ServerStatus::Stopped
        } else {
            ServerStatus::Crashed
        };
        self.logs.note(format!(
            "process exited (code {}, signal {})",
            fmt_opt(outcome.code),
            fmt_opt(outcome.signal)
        ));
        self.set_status(&mut st, next);
        next
    }
}

fn fmt_opt(v: Option<i32>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string())
}

/// Holds the adapter's updating flag; released on drop.
#[derive(Debug)]
pub struct UpdateGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for UpdateGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// What was launched, kept in `<root>/run.json` so an operator can see how the current
/// process was started.
#[derive(Serialize)]
struct RunRecord<'a> {
    server_id: String,
    game_type: &'static str,
    started_at: chrono::DateTime<chrono::Utc>,
    agent_version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    exec: &'a str,
    args: &'a [String],
    cwd: &'a Path,
    env: &'a BTreeMap<String, String>,
}

impl<'a> RunRecord<'a> {
    fn new(id: &ServerId, game_type: &'static str, spec: &'a LaunchSpec, pid: Option<u32>) -> Self {
        Self {
            server_id: id.to_string(),
            game_type,
            started_at: chrono::Utc::now(),
            agent_version: env!("CARGO_PKG_VERSION"),
            pid,
            exec: &spec.exec,
            args: &spec.args,
            cwd: &spec.cwd,
            env: &spec.env,
        }
    }

    async fn save(&self, root: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self).map_err(anyhow::Error::from)?;
        write_atomic(&root.join(RUN_FILE), &data).await
    }
}

/// Races the process exit against the probation window. The exit is polled first, so an
/// exit that is already published when the deadline fires still counts as early.
async fn probation(
    exit: watch::Receiver<Option<ExitOutcome>>,
    window: Duration,
) -> Option<ExitOutcome> {
    tokio::select! {
        biased;
        outcome = wait_exit(exit) => Some(outcome),
        _ = tokio::time::sleep(window) => None,
    }
}

/// One logical server: owns at most one live process, its console buffer and its status.
pub struct ServerAdapter {
    shared: Arc<Shared>,
    variant: Box<dyn GameVariant>,
    config: Arc<AgentConfig>,
    updating: Arc<AtomicBool>,
}

impl ServerAdapter {
    pub fn new(id: ServerId, variant: Box<dyn GameVariant>, config: Arc<AgentConfig>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let logs = LogSink::new(config.log_max_lines, events.clone());
        if config.console_log.enabled {
            logs.mirror_to_file(
                variant.root_dir().join("logs").join("console.log"),
                &config.console_log,
            );
        }
        Self {
            shared: Arc::new(Shared {
                id,
                state: Mutex::new(State {
                    status: ServerStatus::Stopped,
                    process: None,
                    stop_requested: false,
                    run_id: 0,
                    retired: false,
                }),
                events,
                logs,
            }),
            variant,
            config,
            updating: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &ServerId {
        &self.shared.id
    }

    pub fn game_type(&self) -> &'static str {
        self.variant.game_type()
    }

    pub fn root_dir(&self) -> &Path {
        self.variant.root_dir()
    }

    pub fn update_target(&self) -> Option<UpdateTarget> {
        self.variant.update_target()
    }

    pub async fn status(&self) -> ServerStatus {
        self.shared.state.lock().await.status
    }

    pub async fn has_process(&self) -> bool {
        self.shared.state.lock().await.process.is_some()
    }

    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::SeqCst)
    }

    /// Log and status events, in emission order.
    pub fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.shared.events.subscribe()
    }

    pub fn subscribe_logs(&self) -> LogSubscription {
        self.shared.logs.subscribe()
    }

    pub fn logs(&self, limit: Option<usize>) -> Vec<LogEntry> {
        match limit {
            Some(n) => self.shared.logs.tail(n),
            None => self.shared.logs.snapshot(),
        }
    }

    /// Starts the process and waits out the probation window.
    ///
    /// Succeeds once the process survived probation. An exit during probation fails the
    /// call with the cause and leaves the adapter `crashed`; later exits only show up as
    /// status events.
    pub async fn start(&self) -> Result<()> {
        let shared = &self.shared;
        let mut st = shared.state.lock().await;
        if st.retired {
            return Err(SupervisorError::UnknownServer(shared.id.to_string()));
        }
        if st.status.is_active() || st.process.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }
        if self.is_updating() {
            return Err(SupervisorError::UpdateInProgress);
        }

        if let Some(path) = self
            .variant
            .required_artifacts()
            .into_iter()
            .find(|p| !p.exists())
        {
            shared.logs.note(format!("missing required file: {}", path.display()));
            shared.set_status(&mut st, ServerStatus::Crashed);
            return Err(SupervisorError::MissingArtifact { path });
        }

        let spec = match self.variant.launch_spec() {
            Ok(spec) => spec,
            Err(err) => {
                shared.set_status(&mut st, ServerStatus::Crashed);
                return Err(err);
            }
        };

        shared.logs.clear();
        st.run_id += 1;
        st.stop_requested = false;
        let run_id = st.run_id;
        shared.set_status(&mut st, ServerStatus::Starting);
        shared.logs.note("start requested");
        shared.logs.note(format!(
            "exec: {} (cwd {})",
            spec.display(),
            spec.cwd.display()
        ));

        let sink = shared.logs.clone();
        let handle = match ProcessHandle::spawn(&spec, move |_, line| {
            sink.append(&line);
        }) {
            Ok(h) => Arc::new(h),
            Err(err) => {
                let err = SupervisorError::spawn(&err, &spec.exec);
                shared.logs.note(format!("spawn failed: {err}"));
                shared.set_status(&mut st, ServerStatus::Crashed);
                return Err(err);
            }
        };
        st.process = Some(handle.clone());
        drop(st);

        tracing::info!(server = %shared.id, pid = ?handle.pid(), exec = %spec.exec, "process spawned");
        let run = RunRecord::new(&shared.id, self.variant.game_type(), &spec, handle.pid());
        if let Err(err) = run.save(self.variant.root_dir()).await {
            tracing::debug!(server = %shared.id, error = %err, "run.json not written");
        }

        let early_exit = probation(handle.exit_watch(), self.config.probation).await;

        if let Some(outcome) = early_exit {
            let mut st = shared.state.lock().await;
            let ours = st.run_id == run_id && st.process.is_some();
            if !ours || st.stop_requested {
                drop(st);
                shared.settle(run_id, outcome).await;
                return Err(SupervisorError::StoppedDuringStartup);
            }
            st.process = None;
            shared.logs.note(format!(
                "process exited during startup (code {}, signal {})",
                fmt_opt(outcome.code),
                fmt_opt(outcome.signal)
            ));
            shared.set_status(&mut st, ServerStatus::Crashed);
            return Err(SupervisorError::UnexpectedExit {
                code: outcome.code,
                signal: outcome.signal,
            });
        }

        let stopping = {
            let mut st = shared.state.lock().await;
            if st.run_id == run_id && st.status == ServerStatus::Starting {
                shared.set_status(&mut st, ServerStatus::Running);
                false
            } else {
                true
            }
        };

        let monitor = self.shared.clone();
        let watched = handle.clone();
        tokio::spawn(async move {
            let outcome = watched.wait().await;
            monitor.settle(run_id, outcome).await;
        });

        if stopping {
            return Err(SupervisorError::StoppedDuringStartup);
        }
        Ok(())
    }

    /// Runs the shutdown escalation and returns once the exit was observed and the status
    /// settled. A no-op when no process is attached.
    pub async fn stop(&self, timeout: Option<Duration>) -> Result<ServerStatus> {
        let shared = &self.shared;
        let timeout = timeout.unwrap_or(self.config.stop_timeout);

        let (handle, run_id, already_stopping) = {
            let mut st = shared.state.lock().await;
            let Some(handle) = st.process.clone() else {
                return Ok(st.status);
            };
            let already = st.stop_requested;
            st.stop_requested = true;
            shared.set_status(&mut st, ServerStatus::Stopping);
            (handle, st.run_id, already)
        };

        let outcome = if already_stopping {
            handle.wait().await
        } else {
            shared.logs.note("stop requested");
            let logs = shared.logs.clone();
            let stop_command = self.variant.stop_command().to_string();
            escalate(handle.as_ref(), &stop_command, timeout, |step| match step {
                ShutdownStep::StopCommandSent => logs.note(format!("sent `{stop_command}`")),
                ShutdownStep::StopCommandSkipped => logs.note("stdin closed, skipping stop command"),
                ShutdownStep::Terminate => logs.note("sent SIGTERM"),
                ShutdownStep::Kill => logs.note("stop timed out, sent SIGKILL"),
            })
            .await
        };

        Ok(shared.settle(run_id, outcome).await)
    }

    /// Writes one console line. Returns `false` when no process is attached or its stdin
    /// is closed.
    pub async fn send_command(&self, text: &str) -> bool {
        let handle = self.shared.state.lock().await.process.clone();
        match handle {
            Some(h) => h.write_line(text).await,
            None => false,
        }
    }

    /// Takes the updating flag. Refused while a process is attached or another holder
    /// exists. `start()` fails for as long as the guard lives.
    pub async fn begin_update(&self) -> Result<UpdateGuard> {
        let st = self.shared.state.lock().await;
        if st.retired {
            return Err(SupervisorError::UnknownServer(self.shared.id.to_string()));
        }
        if st.process.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }
        if self
            .updating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SupervisorError::UpdateInProgress);
        }
        Ok(UpdateGuard {
            flag: self.updating.clone(),
        })
    }

    /// Marks an idle adapter as retired so no later `start()` or update can attach a
    /// process to it. Refused while a process is attached or an update holds the flag.
    pub async fn retire(&self) -> Result<()> {
        let mut st = self.shared.state.lock().await;
        if st.process.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }
        if self.is_updating() {
            return Err(SupervisorError::UpdateInProgress);
        }
        st.retired = true;
        Ok(())
    }

    /// Variant-specific install. Variant failures come back as a failed [`InstallResult`];
    /// the `Err` side is reserved for refusals (running, updating, wrong path).
    pub async fn install(&self, config: &InstallConfig) -> Result<InstallResult> {
        let root = self.variant.root_dir().to_path_buf();
        if !config.install_path.as_os_str().is_empty() && config.install_path != root {
            return Err(SupervisorError::Config(format!(
                "install path {} does not match server root {}",
                config.install_path.display(),
                root.display()
            )));
        }

        let _guard = self.begin_update().await?;
        self.shared.logs.note(format!("installing {}", self.variant.game_type()));
        match self.variant.install(config).await {
            Ok(result) => {
                tracing::info!(server = %self.shared.id, version = ?result.version, "install finished");
                Ok(result)
            }
            Err(err) => {
                tracing::warn!(server = %self.shared.id, error = %err, "install failed");
                self.shared.logs.note(format!("install failed: {err}"));
                Ok(InstallResult::failed(root, err.to_string()))
            }
        }
    }

    pub async fn get_config(&self) -> Result<GameConfig> {
        self.variant.read_config().await
    }

    pub async fn update_config(&self, patch: &ConfigPatch) -> Result<GameConfig> {
        self.variant.write_config(patch).await
    }

    /// Appends a supervisor line to this server's console.
    pub fn note(&self, message: impl AsRef<str>) {
        self.shared.logs.note(message);
    }
}
