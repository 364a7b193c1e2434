use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use kiln_process::{ConfigPatch, GameConfig, InstallConfig, InstallResult, ServerRecord};
use serde_json::{Map, Value};

use crate::{
    adapter::GameVariant,
    config::AgentConfig,
    error::{Result, SupervisorError},
    jvm,
    minecraft::write_atomic,
    process_handle::LaunchSpec,
};

pub const SERVER_DIR: &str = "Server";
pub const SERVER_JAR: &str = "HytaleServer.jar";
pub const ASSETS: &str = "Assets.zip";
const AOT_CACHE: &str = "HytaleServer.aot";
const CONFIG_FILE: &str = "config.json";

const KEY_NAME: &str = "ServerName";
const KEY_MOTD: &str = "MOTD";
const KEY_MAX_PLAYERS: &str = "MaxPlayers";
const KEY_PASSWORD: &str = "Password";

/// Bundled-asset variant. The payload (server jar plus the asset archive) comes from the
/// authenticated download workflow; install only prepares the layout and config.
///
/// ```text
/// <root>/Assets.zip
/// <root>/Server/HytaleServer.jar
/// <root>/Server/config.json
/// ```
pub struct HytaleServer {
    record: ServerRecord,
    config: Arc<AgentConfig>,
}

impl HytaleServer {
    pub fn new(record: ServerRecord, config: Arc<AgentConfig>) -> Self {
        Self { record, config }
    }

    fn server_dir(&self) -> PathBuf {
        self.record.root_dir.join(SERVER_DIR)
    }

    fn config_path(&self) -> PathBuf {
        self.server_dir().join(CONFIG_FILE)
    }

    async fn load(&self) -> Result<Map<String, Value>> {
        let path = self.config_path();
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(err) => return Err(err.into()),
        };
        let doc: Value = serde_json::from_str(&text)
            .with_context(|| format!("parse {}", path.display()))?;
        match doc {
            Value::Object(map) => Ok(map),
            _ => Err(SupervisorError::Config(format!(
                "{} is not a JSON object",
                path.display()
            ))),
        }
    }

    async fn save(&self, doc: &Map<String, Value>) -> Result<()> {
        let data = serde_json::to_vec_pretty(doc).context("serialize config.json")?;
        write_atomic(&self.config_path(), &data).await
    }

    fn to_canonical(&self, doc: &Map<String, Value>) -> GameConfig {
        let string = |k: &str| doc.get(k).and_then(Value::as_str).map(str::to_string);
        let mut cfg = GameConfig {
            server_name: string(KEY_NAME),
            motd: string(KEY_MOTD),
            max_players: doc
                .get(KEY_MAX_PLAYERS)
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok()),
            password: string(KEY_PASSWORD).filter(|p| !p.is_empty()),
            // The bind port is a launch argument, not part of config.json.
            port: Some(self.record.port),
            extra: Default::default(),
        };
        for (k, v) in doc {
            if ![KEY_NAME, KEY_MOTD, KEY_MAX_PLAYERS, KEY_PASSWORD].contains(&k.as_str()) {
                cfg.extra.insert(k.clone(), v.clone());
            }
        }
        cfg
    }
}

/// `patch.port` is ignored: the port is owned by the server record.
fn apply_patch(doc: &mut Map<String, Value>, patch: &ConfigPatch) {
    if let Some(name) = &patch.server_name {
        doc.insert(KEY_NAME.to_string(), Value::String(name.clone()));
    }
    if let Some(motd) = &patch.motd {
        doc.insert(KEY_MOTD.to_string(), Value::String(motd.clone()));
    }
    if let Some(n) = patch.max_players {
        doc.insert(KEY_MAX_PLAYERS.to_string(), Value::from(n));
    }
    if let Some(password) = &patch.password {
        doc.insert(KEY_PASSWORD.to_string(), Value::String(password.clone()));
    }
    for (k, v) in &patch.extra {
        doc.insert(k.clone(), v.clone());
    }
}

#[async_trait]
impl GameVariant for HytaleServer {
    fn game_type(&self) -> &'static str {
        "hytale"
    }

    fn root_dir(&self) -> &Path {
        &self.record.root_dir
    }

    fn required_artifacts(&self) -> Vec<PathBuf> {
        let server = self.server_dir();
        vec![
            server.clone(),
            server.join(SERVER_JAR),
            self.record.root_dir.join(ASSETS),
        ]
    }

    fn launch_spec(&self) -> Result<LaunchSpec> {
        let cwd = self.server_dir();
        let mut args = jvm::server_flags(self.record.memory_mb, &cwd, Some(AOT_CACHE));
        args.extend([
            "-jar".to_string(),
            SERVER_JAR.to_string(),
            "--assets".to_string(),
            format!("../{ASSETS}"),
            "--bind".to_string(),
            format!("0.0.0.0:{}", self.record.port),
        ]);
        Ok(LaunchSpec::new(self.config.java_bin.clone(), args, cwd))
    }

    async fn install(&self, config: &InstallConfig) -> Result<InstallResult> {
        tokio::fs::create_dir_all(self.server_dir()).await?;

        let mut doc = self.load().await?;
        apply_patch(
            &mut doc,
            &ConfigPatch {
                server_name: Some(config.name.clone()),
                max_players: Some(config.max_players),
                ..ConfigPatch::default()
            },
        );
        self.save(&doc).await?;

        if config.port != self.record.port {
            tracing::warn!(
                server = %self.record.id,
                requested = config.port,
                bound = self.record.port,
                "install port differs from the server record; the record wins"
            );
        }

        Ok(InstallResult::installed(
            self.record.root_dir.clone(),
            config.version.clone(),
        ))
    }

    async fn read_config(&self) -> Result<GameConfig> {
        Ok(self.to_canonical(&self.load().await?))
    }

    async fn write_config(&self, patch: &ConfigPatch) -> Result<GameConfig> {
        let mut doc = self.load().await?;
        apply_patch(&mut doc, patch);
        self.save(&doc).await?;
        Ok(self.to_canonical(&doc))
    }
}

#[cfg(test)]
mod tests {
    use kiln_process::{ServerId, UpdateChannel};

    use super::*;

    fn server(root: &Path) -> HytaleServer {
        let record = ServerRecord {
            id: ServerId::from("hy-1"),
            game_type: "hytale".to_string(),
            root_dir: root.to_path_buf(),
            port: 5520,
            memory_mb: 16 * 1024,
            channel: UpdateChannel::Official,
        };
        HytaleServer::new(record, Arc::new(AgentConfig::default()))
    }

    #[test]
    fn launch_spec_binds_the_record_port() {
        let dir = tempfile::tempdir().unwrap();
        let hy = server(dir.path());
        let spec = hy.launch_spec().unwrap();
        assert_eq!(spec.cwd, dir.path().join("Server"));
        let tail = &spec.args[spec.args.len() - 6..];
        assert_eq!(
            tail,
            &["-jar", "HytaleServer.jar", "--assets", "../Assets.zip", "--bind", "0.0.0.0:5520"]
        );
        assert!(spec.args.contains(&"-XX:G1HeapRegionSize=16M".to_string()));
        assert!(!spec.args.iter().any(|a| a.starts_with("-XX:AOTCache")));
    }

    #[test]
    fn aot_cache_is_used_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Server")).unwrap();
        std::fs::write(dir.path().join("Server/HytaleServer.aot"), b"").unwrap();
        let spec = server(dir.path()).launch_spec().unwrap();
        assert!(spec.args.contains(&"-XX:AOTCache=HytaleServer.aot".to_string()));
    }

    #[tokio::test]
    async fn install_writes_config_and_keeps_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Server")).unwrap();
        std::fs::write(
            dir.path().join("Server/config.json"),
            r#"{"Version":3,"MaxViewRadius":12,"ServerName":"old"}"#,
        )
        .unwrap();
        let hy = server(dir.path());

        let res = hy
            .install(&InstallConfig {
                name: "Orbis".to_string(),
                port: 5520,
                max_players: 20,
                version: None,
                install_path: dir.path().to_path_buf(),
                memory_mb: 4096,
                accept_eula: false,
            })
            .await
            .unwrap();
        assert!(res.success);

        let cfg = hy.read_config().await.unwrap();
        assert_eq!(cfg.server_name.as_deref(), Some("Orbis"));
        assert_eq!(cfg.max_players, Some(20));
        assert_eq!(cfg.port, Some(5520));
        assert_eq!(cfg.extra.get("MaxViewRadius"), Some(&serde_json::json!(12)));
        assert_eq!(cfg.extra.get("Version"), Some(&serde_json::json!(3)));
    }

    #[tokio::test]
    async fn missing_payload_is_reported_by_required_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let hy = server(dir.path());
        let missing: Vec<PathBuf> = hy
            .required_artifacts()
            .into_iter()
            .filter(|p| !p.exists())
            .collect();
        assert_eq!(missing.len(), 3);
    }

    #[tokio::test]
    async fn port_patch_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let hy = server(dir.path());
        let cfg = hy
            .write_config(&ConfigPatch {
                port: Some(1),
                motd: Some("hello".to_string()),
                password: Some("secret".to_string()),
                ..ConfigPatch::default()
            })
            .await
            .unwrap();
        assert_eq!(cfg.port, Some(5520));
        assert_eq!(cfg.motd.as_deref(), Some("hello"));
        assert_eq!(cfg.password.as_deref(), Some("secret"));

        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("Server/config.json")).unwrap())
                .unwrap();
        assert!(raw.get("port").is_none());
    }
}
