use std::sync::Arc;

use kiln_process::{UpdateProgress, UpdateStatus};

use crate::{
    adapter::ServerAdapter,
    config::AgentConfig,
    error::{Result, SupervisorError},
    fetch::download_file_atomic,
    versions,
};

/// Replaces a server's launch artifact with another version, atomically.
pub struct UpdateOrchestrator {
    config: Arc<AgentConfig>,
}

impl UpdateOrchestrator {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        Self { config }
    }

    /// Resolves `version` (`None` or `latest` for the newest) on the adapter's channel and
    /// swaps it in. The adapter cannot start until this returns. Returns the version now
    /// installed.
    pub async fn update<F>(
        &self,
        adapter: &ServerAdapter,
        version: Option<&str>,
        on_progress: F,
    ) -> Result<String>
    where
        F: Fn(UpdateProgress) + Send + Sync,
    {
        let target = adapter.update_target().ok_or_else(|| {
            SupervisorError::Unsupported(format!("{} servers cannot be updated", adapter.game_type()))
        })?;
        let _guard = adapter.begin_update().await?;

        let result = async {
            on_progress(UpdateProgress::new(
                UpdateStatus::Checking,
                format!(
                    "resolving {} ({:?} channel)",
                    version.unwrap_or("latest"),
                    target.channel
                ),
            ));
            let resolved = versions::resolve(target.channel, version, &self.config.indices).await?;

            on_progress(UpdateProgress::new(
                UpdateStatus::Downloading,
                format!("downloading {}", resolved.version),
            ));
            download_file_atomic(
                &resolved.url,
                &target.artifact,
                resolved.checksum.as_ref(),
                |done, total, _| {
                    if total > 0 {
                        on_progress(UpdateProgress::new(
                            UpdateStatus::Downloading,
                            format!("{}% of {}", done * 100 / total, resolved.version),
                        ));
                    }
                },
            )
            .await?;
            Ok::<_, SupervisorError>(resolved.version)
        }
        .await;

        match &result {
            Ok(v) => {
                tracing::info!(server = %adapter.id(), version = %v, "update finished");
                adapter.note(format!("updated to {v}"));
                on_progress(UpdateProgress::new(UpdateStatus::Completed, format!("updated to {v}")));
            }
            Err(err) => {
                tracing::warn!(server = %adapter.id(), error = %err, "update failed");
                on_progress(UpdateProgress::new(UpdateStatus::Error, err.to_string()));
            }
        }
        result
    }
}
