use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use kiln_agent::{
    AgentConfig, Supervisor, SupervisorError, TracingBroadcast, error_payload,
};
use kiln_process::{InstallConfig, ServerId, ServerRecord, UpdateChannel};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const USAGE: &str = "commands:
  register <id> <game_type> <root_dir> <port> [memory_mb] [official|community]
  install <id> <name> <max_players> [version] [--eula]
  start <id> | stop <id> [timeout_secs] | cmd <id> <text...>
  status [id] | logs <id> [limit]
  update <id> [version] | download <id> | abort <id> | remove <id>
  quit";

fn init_tracing() -> anyhow::Result<Option<WorkerGuard>> {
    let file = match std::env::var("KILN_LOG_DIR").ok().filter(|v| !v.trim().is_empty()) {
        Some(dir) => {
            std::fs::create_dir_all(&dir).with_context(|| format!("create log dir {dir}"))?;
            let appender = tracing_appender::rolling::daily(&dir, "kiln-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            Some((fmt::layer().with_writer(writer).with_ansi(false), guard))
        }
        None => None,
    };
    let (file_layer, guard) = match file {
        Some((layer, guard)) => (Some(layer), Some(guard)),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .with(file_layer)
        .init();
    Ok(guard)
}

fn parse_channel(raw: Option<&str>) -> anyhow::Result<UpdateChannel> {
    match raw {
        None | Some("official") => Ok(UpdateChannel::Official),
        Some("community") => Ok(UpdateChannel::Community),
        Some(other) => anyhow::bail!("unknown channel `{other}`"),
    }
}

fn report(err: &SupervisorError) {
    println!("{}", error_payload::encode(err));
}

/// Records this session knows about. The registry itself only needs them to build
/// adapters on first use.
#[derive(Default)]
struct Records(HashMap<ServerId, ServerRecord>);

impl Records {
    fn get(&self, id: &str) -> anyhow::Result<ServerRecord> {
        self.0
            .get(&ServerId::from(id))
            .cloned()
            .with_context(|| format!("server `{id}` is not registered"))
    }
}

async fn handle(sup: &Arc<Supervisor>, records: &mut Records, line: &str) -> anyhow::Result<bool> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some((&verb, args)) = parts.split_first() else {
        return Ok(true);
    };

    match (verb, args) {
        ("quit" | "exit", _) => return Ok(false),
        ("help", _) => println!("{USAGE}"),
        ("register", [id, game_type, root, port, rest @ ..]) => {
            let record = ServerRecord {
                id: ServerId::from(*id),
                game_type: game_type.to_string(),
                root_dir: PathBuf::from(root),
                port: port.parse().context("port")?,
                memory_mb: match rest.first() {
                    Some(mb) => mb.parse().context("memory_mb")?,
                    None => 2048,
                },
                channel: parse_channel(rest.get(1).copied())?,
            };
            records.0.insert(record.id.clone(), record);
            println!("ok");
        }
        ("install", [id, name, max_players, rest @ ..]) => {
            let record = records.get(id)?;
            let accept_eula = rest.contains(&"--eula");
            let version = rest.iter().find(|a| !a.starts_with("--")).map(|v| v.to_string());
            let config = InstallConfig {
                name: name.to_string(),
                port: record.port,
                max_players: max_players.parse().context("max_players")?,
                version,
                install_path: record.root_dir.clone(),
                memory_mb: record.memory_mb,
                accept_eula,
            };
            match sup.install(&record, &config).await {
                Ok(result) => println!("{}", serde_json::to_string(&result)?),
                Err(err) => report(&err),
            }
        }
        ("start", [id]) => {
            let record = records.get(id)?;
            let sup = sup.clone();
            tokio::spawn(async move {
                match sup.start(&record).await {
                    Ok(()) => println!("started {}", record.id),
                    Err(err) => report(&err),
                }
            });
        }
        ("stop", [id, rest @ ..]) => {
            let timeout = match rest.first() {
                Some(secs) => Some(Duration::from_secs(secs.parse().context("timeout_secs")?)),
                None => None,
            };
            let sup = sup.clone();
            let id = ServerId::from(*id);
            tokio::spawn(async move {
                match sup.stop(&id, timeout).await {
                    Ok(status) => println!("{id}: {status}"),
                    Err(err) => report(&err),
                }
            });
        }
        ("cmd", [id, text @ ..]) if !text.is_empty() => {
            let sent = sup.send_command(&ServerId::from(*id), &text.join(" ")).await;
            println!("{}", if sent { "sent" } else { "not running" });
        }
        ("status", []) => {
            for (id, status) in sup.statuses().await {
                println!("{id}: {status}");
            }
        }
        ("status", [id]) => println!("{id}: {}", sup.status(&ServerId::from(*id)).await),
        ("logs", [id, rest @ ..]) => {
            let limit = match rest.first() {
                Some(n) => Some(n.parse().context("limit")?),
                None => None,
            };
            for entry in sup.logs(&ServerId::from(*id), limit) {
                println!("{} {}", entry.timestamp.to_rfc3339(), entry.line);
            }
        }
        ("update", [id, rest @ ..]) => {
            let record = records.get(id)?;
            let version = rest.first().map(|v| v.to_string());
            let sup = sup.clone();
            tokio::spawn(async move {
                match sup.update(&record, version.as_deref()).await {
                    Ok(v) => println!("{}: updated to {v}", record.id),
                    Err(err) => report(&err),
                }
            });
        }
        ("download", [id]) => {
            let record = records.get(id)?;
            let sup = sup.clone();
            tokio::spawn(async move {
                match sup.download(&record).await {
                    Ok(outcome) => println!("{}: {outcome:?}", record.id),
                    Err(err) => report(&err),
                }
            });
        }
        ("abort", [id]) => {
            let aborted = sup.abort_download(&ServerId::from(*id));
            println!("{}", if aborted { "aborting" } else { "no download running" });
        }
        ("remove", [id]) => match sup.remove(&ServerId::from(*id)).await {
            Ok(removed) => {
                records.0.remove(&ServerId::from(*id));
                println!("{}", if removed { "removed" } else { "unknown" });
            }
            Err(err) => report(&err),
        },
        _ => println!("{USAGE}"),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing()?;

    let config = AgentConfig::from_env();
    tracing::info!(
        data_root = %config.data_root.display(),
        java = %config.java_bin,
        "kiln-agent ready"
    );
    let sup = Arc::new(Supervisor::new(config, Arc::new(TracingBroadcast))?);
    let mut records = Records::default();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("read stdin")? else { break };
                match handle(&sup, &mut records, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => println!("error: {err:#}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                break;
            }
        }
    }

    let stop_timeout = sup.config().stop_timeout;
    sup.shutdown_all(Some(stop_timeout)).await;
    tracing::info!("kiln-agent stopped");
    Ok(())
}
