use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use kiln_process::{
    ConfigPatch, GameConfig, InstallConfig, InstallResult, ServerRecord, UpdateChannel,
};

use crate::{
    adapter::{GameVariant, UpdateTarget},
    config::AgentConfig,
    error::{Result, SupervisorError},
    fetch::download_file_atomic,
    jvm,
    process_handle::LaunchSpec,
    properties::Properties,
    versions,
};

const SERVER_JAR: &str = "server.jar";
const PROPERTIES: &str = "server.properties";
const EULA: &str = "eula.txt";

const KEY_MOTD: &str = "motd";
const KEY_MAX_PLAYERS: &str = "max-players";
const KEY_PORT: &str = "server-port";

/// Downloaded-jar variant: vanilla releases (`minecraft`) or Paper builds (`paper`).
/// Everything lives directly in the server root.
pub struct MinecraftServer {
    record: ServerRecord,
    channel: UpdateChannel,
    config: Arc<AgentConfig>,
}

impl MinecraftServer {
    pub fn new(record: ServerRecord, channel: UpdateChannel, config: Arc<AgentConfig>) -> Self {
        Self {
            record,
            channel,
            config,
        }
    }

    fn jar_path(&self) -> PathBuf {
        self.record.root_dir.join(SERVER_JAR)
    }

    fn properties_path(&self) -> PathBuf {
        self.record.root_dir.join(PROPERTIES)
    }

    async fn load_properties(&self) -> Result<Properties> {
        match tokio::fs::read_to_string(self.properties_path()).await {
            Ok(text) => Ok(Properties::parse(&text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Properties::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_properties(&self, props: &Properties) -> Result<()> {
        write_atomic(&self.properties_path(), props.render().as_bytes()).await
    }
}

fn validate_install(config: &InstallConfig) -> Result<()> {
    if !config.accept_eula {
        return Err(SupervisorError::Config(
            "the Minecraft EULA must be accepted (accept_eula)".to_string(),
        ));
    }
    if !(512..=65536).contains(&config.memory_mb) {
        return Err(SupervisorError::Config(
            "memory_mb must be between 512 and 65536".to_string(),
        ));
    }
    if config.port == 0 {
        return Err(SupervisorError::Config("port must be non-zero".to_string()));
    }
    Ok(())
}

pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, data).await?;
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    Ok(())
}

fn value_to_property(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn to_canonical(props: &Properties) -> GameConfig {
    let mut cfg = GameConfig {
        motd: props.get(KEY_MOTD).map(str::to_string),
        max_players: props.get(KEY_MAX_PLAYERS).and_then(|v| v.trim().parse().ok()),
        port: props.get(KEY_PORT).and_then(|v| v.trim().parse().ok()),
        ..GameConfig::default()
    };
    for (k, v) in props.entries() {
        if ![KEY_MOTD, KEY_MAX_PLAYERS, KEY_PORT].contains(&k) {
            cfg.extra
                .insert(k.to_string(), serde_json::Value::String(v.to_string()));
        }
    }
    cfg
}

/// `server_name` and `password` have no server.properties counterpart and are ignored.
fn apply_patch(props: &mut Properties, patch: &ConfigPatch) {
    if let Some(motd) = &patch.motd {
        props.set(KEY_MOTD, motd.as_str());
    }
    if let Some(n) = patch.max_players {
        props.set(KEY_MAX_PLAYERS, n.to_string());
    }
    if let Some(port) = patch.port {
        props.set(KEY_PORT, port.to_string());
    }
    for (k, v) in &patch.extra {
        props.set(k, value_to_property(v));
    }
}

#[async_trait]
impl GameVariant for MinecraftServer {
    fn game_type(&self) -> &'static str {
        match self.channel {
            UpdateChannel::Official => "minecraft",
            UpdateChannel::Community => "paper",
        }
    }

    fn root_dir(&self) -> &Path {
        &self.record.root_dir
    }

    fn required_artifacts(&self) -> Vec<PathBuf> {
        vec![self.record.root_dir.clone(), self.jar_path()]
    }

    fn launch_spec(&self) -> Result<LaunchSpec> {
        let cwd = self.record.root_dir.clone();
        let mut args = jvm::server_flags(self.record.memory_mb, &cwd, None);
        args.extend([
            "-jar".to_string(),
            SERVER_JAR.to_string(),
            "nogui".to_string(),
        ]);
        Ok(LaunchSpec::new(self.config.java_bin.clone(), args, cwd))
    }

    async fn install(&self, config: &InstallConfig) -> Result<InstallResult> {
        validate_install(config)?;
        let root = &self.record.root_dir;
        tokio::fs::create_dir_all(root).await?;

        let resolved =
            versions::resolve(self.channel, config.version.as_deref(), &self.config.indices)
                .await?;
        tracing::info!(
            server = %self.record.id,
            version = %resolved.version,
            url = %resolved.url,
            "downloading server jar"
        );
        download_file_atomic(
            &resolved.url,
            &self.jar_path(),
            resolved.checksum.as_ref(),
            |_, _, _| {},
        )
        .await?;

        write_atomic(&root.join(EULA), b"eula=true\n").await?;

        let mut props = self.load_properties().await?;
        apply_patch(
            &mut props,
            &ConfigPatch {
                motd: Some(config.name.clone()),
                max_players: Some(config.max_players),
                port: Some(config.port),
                ..ConfigPatch::default()
            },
        );
        self.save_properties(&props).await?;

        Ok(InstallResult::installed(root.clone(), Some(resolved.version)))
    }

    async fn read_config(&self) -> Result<GameConfig> {
        Ok(to_canonical(&self.load_properties().await?))
    }

    async fn write_config(&self, patch: &ConfigPatch) -> Result<GameConfig> {
        let mut props = self.load_properties().await?;
        apply_patch(&mut props, patch);
        self.save_properties(&props).await?;
        Ok(to_canonical(&props))
    }

    fn update_target(&self) -> Option<UpdateTarget> {
        Some(UpdateTarget {
            channel: self.channel,
            artifact: self.jar_path(),
        })
    }
}

#[cfg(test)]
mod tests {
    use kiln_process::ServerId;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    fn server(root: &Path, config: AgentConfig) -> MinecraftServer {
        let record = ServerRecord {
            id: ServerId::from("mc-1"),
            game_type: "minecraft".to_string(),
            root_dir: root.to_path_buf(),
            port: 25565,
            memory_mb: 4096,
            channel: UpdateChannel::Official,
        };
        MinecraftServer::new(record, UpdateChannel::Official, Arc::new(config))
    }

    fn install_config(root: &Path) -> InstallConfig {
        InstallConfig {
            name: "Survival".to_string(),
            port: 25565,
            max_players: 20,
            version: None,
            install_path: root.to_path_buf(),
            memory_mb: 4096,
            accept_eula: true,
        }
    }

    #[test]
    fn launch_spec_runs_the_jar_headless() {
        let dir = tempfile::tempdir().unwrap();
        let mc = server(dir.path(), AgentConfig::default());
        let spec = mc.launch_spec().unwrap();
        assert_eq!(spec.exec, "java");
        assert_eq!(spec.cwd, dir.path());
        assert_eq!(&spec.args[..2], &["-Xms4096M", "-Xmx4096M"]);
        assert_eq!(&spec.args[spec.args.len() - 3..], &["-jar", "server.jar", "nogui"]);
        assert!(spec.args.contains(&"-XX:+UseG1GC".to_string()));
    }

    #[tokio::test]
    async fn install_downloads_jar_and_writes_config() {
        let index = MockServer::start().await;
        let jar = b"fake server jar".to_vec();
        let sha1 = {
            use sha1::Digest;
            hex::encode(sha1::Sha1::digest(&jar))
        };
        Mock::given(method("GET"))
            .and(path("/manifest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "latest": { "release": "1.21.4" },
                "versions": [{ "id": "1.21.4", "url": format!("{}/v/1.21.4.json", index.uri()) }]
            })))
            .mount(&index)
            .await;
        Mock::given(method("GET"))
            .and(path("/v/1.21.4.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "downloads": { "server": { "sha1": sha1, "size": jar.len(), "url": format!("{}/server.jar", index.uri()) } }
            })))
            .mount(&index)
            .await;
        Mock::given(method("GET"))
            .and(path("/server.jar"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(jar.clone()))
            .mount(&index)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.indices.mojang_manifest_url = format!("{}/manifest.json", index.uri());
        let mc = server(dir.path(), config);

        let res = mc.install(&install_config(dir.path())).await.unwrap();
        assert!(res.success);
        assert_eq!(res.version.as_deref(), Some("1.21.4"));
        assert_eq!(std::fs::read(dir.path().join("server.jar")).unwrap(), jar);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("eula.txt")).unwrap(),
            "eula=true\n"
        );

        let cfg = mc.read_config().await.unwrap();
        assert_eq!(cfg.max_players, Some(20));
        assert_eq!(cfg.port, Some(25565));
        assert_eq!(cfg.motd.as_deref(), Some("Survival"));
    }

    #[tokio::test]
    async fn install_requires_eula() {
        let dir = tempfile::tempdir().unwrap();
        let mc = server(dir.path(), AgentConfig::default());
        let mut cfg = install_config(dir.path());
        cfg.accept_eula = false;
        let err = mc.install(&cfg).await.unwrap_err();
        assert!(err.to_string().contains("EULA"));
        assert!(!dir.path().join("eula.txt").exists());
    }

    #[tokio::test]
    async fn config_patch_keeps_comments_and_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("server.properties"),
            "#Minecraft server properties\nmotd=Old\nview-distance=10\nmax-players=20\n",
        )
        .unwrap();
        let mc = server(dir.path(), AgentConfig::default());

        let patch = ConfigPatch {
            max_players: Some(50),
            server_name: Some("ignored".to_string()),
            extra: [("pvp".to_string(), serde_json::Value::Bool(false))].into(),
            ..ConfigPatch::default()
        };
        let cfg = mc.write_config(&patch).await.unwrap();
        assert_eq!(cfg.max_players, Some(50));
        assert_eq!(cfg.server_name, None);
        assert_eq!(cfg.extra.get("view-distance"), Some(&serde_json::json!("10")));

        let text = std::fs::read_to_string(dir.path().join("server.properties")).unwrap();
        assert_eq!(
            text,
            "#Minecraft server properties\nmotd=Old\nview-distance=10\nmax-players=50\npvp=false\n"
        );
    }

    #[test]
    fn paper_servers_update_from_the_community_channel() {
        let dir = tempfile::tempdir().unwrap();
        let mut mc = server(dir.path(), AgentConfig::default());
        mc.channel = UpdateChannel::Community;
        assert_eq!(mc.game_type(), "paper");
        let target = mc.update_target().unwrap();
        assert_eq!(target.channel, UpdateChannel::Community);
        assert_eq!(target.artifact, dir.path().join("server.jar"));
    }
}
