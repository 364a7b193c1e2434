use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;

/// Failures surfaced to callers of awaited supervisor operations.
///
/// Errors that happen after the caller was already satisfied (a crash long after start,
/// for example) never show up here; they are observable only through the event stream.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("an update is in progress for this server")]
    UpdateInProgress,

    #[error("required file is missing: {}", path.display())]
    MissingArtifact { path: PathBuf },

    #[error("failed to spawn server process: {reason}")]
    ProcessSpawnFailure { reason: String, hint: Option<String> },

    #[error("process exited during startup (code {code:?}, signal {signal:?})")]
    UnexpectedExit { code: Option<i32>, signal: Option<i32> },

    #[error("server was stopped before it finished starting")]
    StoppedDuringStartup,

    #[error("download failed: {0}")]
    DownloadFailure(String),

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("operation already in progress: {0}")]
    ConflictingOperation(String),

    #[error("unknown version: {0}")]
    UnknownVersion(String),

    #[error("unknown game type: {0}")]
    UnknownGameType(String),

    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SupervisorError {
    /// Stable machine-readable code for the transport layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyRunning | Self::UpdateInProgress | Self::ConflictingOperation(_) => {
                "conflict"
            }
            Self::MissingArtifact { .. } => "missing_artifact",
            Self::ProcessSpawnFailure { .. } => "spawn_failed",
            Self::UnexpectedExit { .. } => "unexpected_exit",
            Self::StoppedDuringStartup => "stopped",
            Self::DownloadFailure(_) => "download_failed",
            Self::CorruptArchive(_) => "corrupt_archive",
            Self::UnknownVersion(_) | Self::Config(_) => "invalid_param",
            Self::UnknownGameType(_) | Self::UnknownServer(_) => "not_found",
            Self::Unsupported(_) => "unsupported",
            Self::Io(_) | Self::Other(_) => "internal",
        }
    }

    pub fn hint(&self) -> Option<String> {
        match self {
            Self::ProcessSpawnFailure { hint, .. } => hint.clone(),
            Self::MissingArtifact { .. } => {
                Some("Install the server (or run the download) before starting it.".to_string())
            }
            Self::UpdateInProgress => Some("Wait for the running update to finish.".to_string()),
            Self::AlreadyRunning => Some("Stop the server first.".to_string()),
            Self::DownloadFailure(_) => {
                Some("Check network connectivity to the download endpoints, then retry.".to_string())
            }
            _ => None,
        }
    }

    /// Maps an I/O error from `Command::spawn` to an actionable failure.
    pub fn spawn(err: &std::io::Error, exec: &str) -> Self {
        let hint = if err.kind() == std::io::ErrorKind::NotFound {
            Some(format!(
                "`{exec}` was not found. Install a Java runtime or point KILN_JAVA_BIN at one."
            ))
        } else if err.kind() == std::io::ErrorKind::PermissionDenied {
            Some(format!("`{exec}` is not executable by the agent user."))
        } else {
            None
        };
        Self::ProcessSpawnFailure {
            reason: format!("{exec}: {err}"),
            hint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_share_a_code() {
        assert_eq!(SupervisorError::AlreadyRunning.code(), "conflict");
        assert_eq!(SupervisorError::UpdateInProgress.code(), "conflict");
        assert_eq!(
            SupervisorError::ConflictingOperation("download".into()).code(),
            "conflict"
        );
    }

    #[test]
    fn missing_java_gets_a_hint() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let err = SupervisorError::spawn(&io, "java");
        assert_eq!(err.code(), "spawn_failed");
        assert!(err.hint().unwrap().contains("KILN_JAVA_BIN"));
    }

    #[test]
    fn anyhow_converts_to_internal() {
        let err: SupervisorError = anyhow::anyhow!("boom").into();
        assert_eq!(err.code(), "internal");
        assert_eq!(err.to_string(), "boom");
    }
}
