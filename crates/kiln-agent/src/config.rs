use std::{path::PathBuf, time::Duration};

const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;
const DEFAULT_PROBATION_MS: u64 = 2500;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 30_000;

const MOJANG_MANIFEST_URL: &str = "https://piston-meta.mojang.com/mc/game/version_manifest_v2.json";
const PAPER_API_URL: &str = "https://api.papermc.io";
const DOWNLOADER_URL: &str = "https://downloader.hytale.com/hytale-downloader.zip";

#[cfg(target_os = "windows")]
const DOWNLOADER_BINARY: &str = "hytale-downloader-windows-amd64.exe";
#[cfg(not(target_os = "windows"))]
const DOWNLOADER_BINARY: &str = "hytale-downloader-linux-amd64";

#[derive(Debug, Clone)]
pub struct ConsoleLogConfig {
    pub enabled: bool,
    pub max_bytes: u64,
    pub max_files: usize,
}

/// Remote version indices used by installers and the update orchestrator.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub mojang_manifest_url: String,
    pub paper_api_url: String,
    pub paper_project: String,
}

/// Bootstrap tool used by the authenticated download workflow.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub tool_url: String,
    pub tool_binary: String,
    pub tool_args: Vec<String>,
    pub auth_url_pattern: String,
    pub archive_pattern: String,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    pub java_bin: String,
    pub log_max_lines: usize,
    pub probation: Duration,
    pub stop_timeout: Duration,
    pub console_log: ConsoleLogConfig,
    pub indices: IndexConfig,
    pub download: DownloadConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Out-of-range numbers are clamped,
    /// unparsable ones fall back to the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let u64_of = |key: &str| string(key).and_then(|v| v.parse::<u64>().ok());
        let usize_of = |key: &str| string(key).and_then(|v| v.parse::<usize>().ok());

        let data_root = resolve_data_root(string("KILN_DATA_ROOT").unwrap_or_else(|| "./data".to_string()));

        let console_log = ConsoleLogConfig {
            enabled: string("KILN_CONSOLE_LOG").is_none_or(|v| v != "0" && v != "false"),
            max_bytes: u64_of("KILN_LOG_FILE_MAX_BYTES")
                .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
                .unwrap_or(DEFAULT_LOG_FILE_MAX_BYTES),
            max_files: usize_of("KILN_LOG_FILE_MAX_FILES")
                .map(|v| v.clamp(1, 20))
                .unwrap_or(DEFAULT_LOG_FILE_MAX_FILES),
        };

        let tool_args = string("KILN_DOWNLOADER_ARGS")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        Self {
            data_root,
            java_bin: string("KILN_JAVA_BIN").unwrap_or_else(|| "java".to_string()),
            log_max_lines: usize_of("KILN_LOG_MAX_LINES")
                .map(|v| v.clamp(100, 50_000))
                .unwrap_or(DEFAULT_LOG_MAX_LINES),
            probation: Duration::from_millis(
                u64_of("KILN_PROBATION_MS")
                    .map(|v| v.clamp(500, 60_000))
                    .unwrap_or(DEFAULT_PROBATION_MS),
            ),
            stop_timeout: Duration::from_millis(
                u64_of("KILN_STOP_TIMEOUT_MS")
                    .map(|v| v.clamp(1000, 10 * 60 * 1000))
                    .unwrap_or(DEFAULT_STOP_TIMEOUT_MS),
            ),
            console_log,
            indices: IndexConfig {
                mojang_manifest_url: string("KILN_MINECRAFT_MANIFEST_URL")
                    .unwrap_or_else(|| MOJANG_MANIFEST_URL.to_string()),
                paper_api_url: string("KILN_PAPER_API_URL")
                    .unwrap_or_else(|| PAPER_API_URL.to_string()),
                paper_project: string("KILN_PAPER_PROJECT").unwrap_or_else(|| "paper".to_string()),
            },
            download: DownloadConfig {
                tool_url: string("KILN_DOWNLOADER_URL").unwrap_or_else(|| DOWNLOADER_URL.to_string()),
                tool_binary: string("KILN_DOWNLOADER_BINARY")
                    .unwrap_or_else(|| DOWNLOADER_BINARY.to_string()),
                tool_args,
                auth_url_pattern: string("KILN_DOWNLOADER_AUTH_PATTERN").unwrap_or_else(|| {
                    r"https?://\S*(?:oauth|device|verify|activate)\S*".to_string()
                }),
                archive_pattern: string("KILN_DOWNLOADER_ARCHIVE_PATTERN").unwrap_or_else(|| {
                    r"(?i)(?:saved|downloaded|wrote|output)\b.*?([\w.\-/]+\.zip)".to_string()
                }),
            },
        }
    }

    /// Scratch space for download workflows.
    pub fn scratch_root(&self) -> PathBuf {
        self.data_root.join("tmp")
    }
}

fn resolve_data_root(raw: String) -> PathBuf {
    let p = PathBuf::from(raw);
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // Best-effort canonicalization: the directory may not exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}
