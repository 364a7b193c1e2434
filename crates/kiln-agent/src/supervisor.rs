use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use kiln_process::{
    ConfigPatch, DownloadProgress, GameConfig, InstallConfig, InstallResult, LogEntry, ServerId, ServerRecord,
    ServerStatus,
};
use tokio::sync::broadcast::error::RecvError;

use crate::{
    adapter::ServerAdapter,
    broadcast::BroadcastSink,
    config::AgentConfig,
    download::{DownloadOrchestrator, DownloadOutcome},
    error::{Result, SupervisorError},
    factory::AdapterFactory,
    log_sink::AdapterEvent,
    update::UpdateOrchestrator,
};

/// Entry in a busy set; removed on drop so an error path can never leave it behind.
struct Busy<'a> {
    set: &'a Mutex<HashSet<ServerId>>,
    id: ServerId,
}

impl<'a> Busy<'a> {
    fn claim(set: &'a Mutex<HashSet<ServerId>>, id: &ServerId) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.insert(id.clone()) {
            return None;
        }
        Some(Self {
            set,
            id: id.clone(),
        })
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// Registry of adapters keyed by server identity. Adapters are built lazily from the
/// record the control plane hands in; there is at most one per identity.
pub struct Supervisor {
    config: Arc<AgentConfig>,
    factory: AdapterFactory,
    sink: Arc<dyn BroadcastSink>,
    adapters: Mutex<HashMap<ServerId, Arc<ServerAdapter>>>,
    downloads: DownloadOrchestrator,
    updates: UpdateOrchestrator,
    active_downloads: Mutex<HashSet<ServerId>>,
    active_updates: Mutex<HashSet<ServerId>>,
}

impl Supervisor {
    pub fn new(config: AgentConfig, sink: Arc<dyn BroadcastSink>) -> Result<Self> {
        Self::with_factory(config, AdapterFactory::default(), sink)
    }

    pub fn with_factory(
        config: AgentConfig,
        factory: AdapterFactory,
        sink: Arc<dyn BroadcastSink>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        Ok(Self {
            downloads: DownloadOrchestrator::new(config.clone())?,
            updates: UpdateOrchestrator::new(config.clone()),
            config,
            factory,
            sink,
            adapters: Mutex::new(HashMap::new()),
            active_downloads: Mutex::new(HashSet::new()),
            active_updates: Mutex::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// The adapter for `record.id`, created on first use.
    pub fn adapter(&self, record: &ServerRecord) -> Result<Arc<ServerAdapter>> {
        let mut adapters = self.adapters.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = adapters.get(&record.id) {
            return Ok(existing.clone());
        }

        let adapter = Arc::new(self.factory.create(record.clone(), self.config.clone())?);
        self.spawn_relay(&adapter);
        adapters.insert(record.id.clone(), adapter.clone());
        tracing::debug!(server = %record.id, game = %record.game_type, "adapter created");
        Ok(adapter)
    }

    /// Only adapters that already exist; never creates one.
    pub fn get(&self, id: &ServerId) -> Option<Arc<ServerAdapter>> {
        self.adapters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Forwards the adapter's events to the sink until the adapter is dropped.
    fn spawn_relay(&self, adapter: &ServerAdapter) {
        let mut rx = adapter.subscribe();
        let sink = self.sink.clone();
        let id = adapter.id().clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(AdapterEvent::Log(entry)) => sink.emit_log(&id, &entry.line, entry.timestamp),
                    Ok(AdapterEvent::Status(status)) => sink.emit_status(&id, status),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(server = %id, skipped, "event relay lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    pub async fn install(&self, record: &ServerRecord, config: &InstallConfig) -> Result<InstallResult> {
        self.adapter(record)?.install(config).await
    }

    pub async fn start(&self, record: &ServerRecord) -> Result<()> {
        self.adapter(record)?.start().await
    }

    /// Stops the server if it is running. Unknown identities have nothing to stop.
    pub async fn stop(&self, id: &ServerId, timeout: Option<Duration>) -> Result<ServerStatus> {
        match self.get(id) {
            Some(adapter) => adapter.stop(timeout).await,
            None => Ok(ServerStatus::Stopped),
        }
    }

    pub async fn send_command(&self, id: &ServerId, text: &str) -> bool {
        match self.get(id) {
            Some(adapter) => adapter.send_command(text).await,
            None => false,
        }
    }

    /// Identities without an adapter have no process under this agent, so they report
    /// `stopped`.
    pub async fn status(&self, id: &ServerId) -> ServerStatus {
        match self.get(id) {
            Some(adapter) => adapter.status().await,
            None => ServerStatus::Stopped,
        }
    }

    pub async fn statuses(&self) -> Vec<(ServerId, ServerStatus)> {
        let adapters: Vec<Arc<ServerAdapter>> = self
            .adapters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut out = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            out.push((adapter.id().clone(), adapter.status().await));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn logs(&self, id: &ServerId, limit: Option<usize>) -> Vec<LogEntry> {
        self.get(id).map(|a| a.logs(limit)).unwrap_or_default()
    }

    pub async fn get_config(&self, record: &ServerRecord) -> Result<GameConfig> {
        self.adapter(record)?.get_config().await
    }

    pub async fn update_config(&self, record: &ServerRecord, patch: &ConfigPatch) -> Result<GameConfig> {
        self.adapter(record)?.update_config(patch).await
    }

    /// Runs the authenticated payload download into the server root. One per server.
    pub async fn download(&self, record: &ServerRecord) -> Result<DownloadOutcome> {
        let Some(_busy) = Busy::claim(&self.active_downloads, &record.id) else {
            return Err(SupervisorError::ConflictingOperation(format!(
                "a download is already running for {}",
                record.id
            )));
        };
        let adapter = self.adapter(record)?;
        let _lock = adapter.begin_update().await?;

        let sink = self.sink.clone();
        let id = record.id.clone();
        self.downloads
            .run(
                &record.id,
                adapter.root_dir(),
                Arc::new(move |p: DownloadProgress| sink.emit_download_progress(&id, &p)),
            )
            .await
    }

    pub fn abort_download(&self, id: &ServerId) -> bool {
        self.downloads.abort(id)
    }

    /// Replaces the launch artifact with `version` (`None` for the latest).
    pub async fn update(&self, record: &ServerRecord, version: Option<&str>) -> Result<String> {
        let Some(_busy) = Busy::claim(&self.active_updates, &record.id) else {
            return Err(SupervisorError::UpdateInProgress);
        };
        let adapter = self.adapter(record)?;
        let sink = self.sink.clone();
        let id = record.id.clone();
        self.updates
            .update(&adapter, version, move |p| sink.emit_update_progress(&id, &p))
            .await
    }

    /// Forgets an idle adapter, e.g. to roll back a failed install. Returns whether one
    /// existed. The adapter is retired under its own state lock first, so a racing
    /// `start()` either wins (and the removal is refused) or fails.
    pub async fn remove(&self, id: &ServerId) -> Result<bool> {
        let Some(adapter) = self.get(id) else {
            return Ok(false);
        };
        if self
            .active_updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
        {
            return Err(SupervisorError::UpdateInProgress);
        }
        if self
            .active_downloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
        {
            return Err(SupervisorError::ConflictingOperation(format!(
                "a download is running for {id}"
            )));
        }
        adapter.retire().await?;

        let removed = {
            let mut adapters = self.adapters.lock().unwrap_or_else(|e| e.into_inner());
            match adapters.get(id) {
                Some(current) if Arc::ptr_eq(current, &adapter) => adapters.remove(id).is_some(),
                _ => false,
            }
        };
        tracing::debug!(server = %id, removed, "adapter removed");
        Ok(removed)
    }

    /// Stops every attached process concurrently.
    pub async fn shutdown_all(&self, timeout: Option<Duration>) {
        let adapters: Vec<Arc<ServerAdapter>> = self
            .adapters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let stops = adapters.iter().map(|a| async move {
            if let Err(err) = a.stop(timeout).await {
                tracing::warn!(server = %a.id(), error = %err, "stop during shutdown failed");
            }
        });
        futures_util::future::join_all(stops).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::{Path, PathBuf};

    use async_trait::async_trait;
    use kiln_process::UpdateChannel;

    use super::*;
    use crate::{
        adapter::GameVariant,
        broadcast::{RecordedEvent, RecordingBroadcast},
        process_handle::LaunchSpec,
    };

    struct ShellServer {
        root: PathBuf,
    }

    #[async_trait]
    impl GameVariant for ShellServer {
        fn game_type(&self) -> &'static str {
            "shell"
        }

        fn root_dir(&self) -> &Path {
            &self.root
        }

        fn required_artifacts(&self) -> Vec<PathBuf> {
            vec![self.root.join("run.sh")]
        }

        fn launch_spec(&self) -> Result<LaunchSpec> {
            Ok(LaunchSpec::new("sh", vec!["run.sh".to_string()], self.root.clone()))
        }

        async fn install(&self, _config: &InstallConfig) -> Result<InstallResult> {
            std::fs::write(
                self.root.join("run.sh"),
                "echo hello\nwhile read l; do [ \"$l\" = stop ] && exit 0; echo \"$l\"; done\n",
            )?;
            Ok(InstallResult::installed(self.root.clone(), None))
        }

        async fn read_config(&self) -> Result<GameConfig> {
            Ok(GameConfig::default())
        }

        async fn write_config(&self, _patch: &ConfigPatch) -> Result<GameConfig> {
            Ok(GameConfig::default())
        }
    }

    fn supervisor() -> (Supervisor, Arc<RecordingBroadcast>) {
        let mut config = AgentConfig::default();
        config.probation = Duration::from_millis(200);
        config.console_log.enabled = false;
        let mut factory = AdapterFactory::default();
        factory.register("shell", |record, _| Box::new(ShellServer { root: record.root_dir }));
        let sink = Arc::new(RecordingBroadcast::default());
        let sup = Supervisor::with_factory(config, factory, sink.clone()).unwrap();
        (sup, sink)
    }

    fn record(id: &str, root: &Path) -> ServerRecord {
        ServerRecord {
            id: ServerId::from(id),
            game_type: "shell".to_string(),
            root_dir: root.to_path_buf(),
            port: 25565,
            memory_mb: 1024,
            channel: UpdateChannel::Official,
        }
    }

    fn install_config(root: &Path) -> InstallConfig {
        InstallConfig {
            name: "s".to_string(),
            port: 25565,
            max_players: 10,
            version: None,
            install_path: root.to_path_buf(),
            memory_mb: 1024,
            accept_eula: true,
        }
    }

    #[tokio::test]
    async fn one_adapter_per_identity() {
        let (sup, _) = supervisor();
        let dir = tempfile::tempdir().unwrap();
        let rec = record("a", dir.path());
        let first = sup.adapter(&rec).unwrap();
        let second = sup.adapter(&rec).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(sup.statuses().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_ids_are_quietly_idle() {
        let (sup, _) = supervisor();
        let id = ServerId::from("ghost");
        assert_eq!(sup.status(&id).await, ServerStatus::Stopped);
        assert_eq!(sup.stop(&id, None).await.unwrap(), ServerStatus::Stopped);
        assert!(!sup.send_command(&id, "list").await);
        assert!(sup.logs(&id, None).is_empty());
        assert!(!sup.abort_download(&id));
        assert!(!sup.remove(&id).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_game_type_is_reported() {
        let (sup, _) = supervisor();
        let dir = tempfile::tempdir().unwrap();
        let mut rec = record("a", dir.path());
        rec.game_type = "factorio".to_string();
        assert_eq!(sup.start(&rec).await.unwrap_err().code(), "not_found");
    }

    #[tokio::test]
    async fn events_are_relayed_in_order() {
        let (sup, sink) = supervisor();
        let dir = tempfile::tempdir().unwrap();
        let rec = record("a", dir.path());

        assert!(sup.install(&rec, &install_config(dir.path())).await.unwrap().success);
        sup.start(&rec).await.unwrap();
        assert!(sup.send_command(&rec.id, "ping").await);
        assert_eq!(
            sup.stop(&rec.id, Some(Duration::from_secs(5))).await.unwrap(),
            ServerStatus::Stopped
        );

        // The relay runs on its own task; give it a moment to drain.
        for _ in 0..100 {
            if sink
                .events()
                .contains(&RecordedEvent::Status(rec.id.clone(), ServerStatus::Stopped))
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let statuses: Vec<ServerStatus> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                RecordedEvent::Status(_, s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                ServerStatus::Starting,
                ServerStatus::Running,
                ServerStatus::Stopping,
                ServerStatus::Stopped
            ]
        );
        assert!(sink
            .events()
            .contains(&RecordedEvent::Log(rec.id.clone(), "ping".to_string())));
        assert!(sup.logs(&rec.id, Some(500)).iter().any(|e| e.line == "hello"));
    }

    #[tokio::test]
    async fn remove_only_idle_adapters() {
        let (sup, _) = supervisor();
        let dir = tempfile::tempdir().unwrap();
        let rec = record("a", dir.path());
        sup.install(&rec, &install_config(dir.path())).await.unwrap();
        sup.start(&rec).await.unwrap();

        assert!(matches!(sup.remove(&rec.id).await, Err(SupervisorError::AlreadyRunning)));
        sup.stop(&rec.id, Some(Duration::from_secs(5))).await.unwrap();
        let old = sup.get(&rec.id).unwrap();
        assert!(sup.remove(&rec.id).await.unwrap());
        assert!(sup.get(&rec.id).is_none());
        // A caller still holding the removed adapter cannot bring it back.
        assert_eq!(old.start().await.unwrap_err().code(), "not_found");

        // Rebuilt lazily on next use.
        let again = sup.adapter(&rec).unwrap();
        assert_eq!(again.status().await, ServerStatus::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_start_and_remove_never_orphan_a_process() {
        let (sup, _) = supervisor();
        let sup = Arc::new(sup);
        let dir = tempfile::tempdir().unwrap();

        for i in 0..10 {
            let root = dir.path().join(format!("r{i}"));
            std::fs::create_dir_all(&root).unwrap();
            let rec = record(&format!("r{i}"), &root);
            sup.install(&rec, &install_config(&root)).await.unwrap();

            let start = {
                let (sup, rec) = (sup.clone(), rec.clone());
                tokio::spawn(async move { sup.start(&rec).await })
            };
            let remove = {
                let (sup, id) = (sup.clone(), rec.id.clone());
                tokio::spawn(async move { sup.remove(&id).await })
            };
            let started = start.await.unwrap().is_ok();
            let _ = remove.await.unwrap();

            // A live process is always reachable through the registry.
            let registered = match sup.get(&rec.id) {
                Some(a) => a.has_process().await,
                None => false,
            };
            assert_eq!(started, registered, "round {i}");
            if started {
                sup.stop(&rec.id, Some(Duration::from_secs(5))).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn busy_sets_reject_duplicates_and_clear_on_error() {
        let (sup, _) = supervisor();
        let dir = tempfile::tempdir().unwrap();
        let rec = record("a", dir.path());

        {
            let _held = Busy::claim(&sup.active_updates, &rec.id).unwrap();
            assert!(matches!(
                sup.update(&rec, None).await,
                Err(SupervisorError::UpdateInProgress)
            ));
        }
        // Shell servers have no update channel; the busy entry is released anyway.
        assert_eq!(sup.update(&rec, None).await.unwrap_err().code(), "unsupported");
        assert!(sup.active_updates.lock().unwrap().is_empty());

        {
            let _held = Busy::claim(&sup.active_downloads, &rec.id).unwrap();
            assert!(matches!(
                sup.download(&rec).await,
                Err(SupervisorError::ConflictingOperation(_))
            ));
        }
        assert!(sup.active_downloads.lock().unwrap().is_empty());
    }
}
