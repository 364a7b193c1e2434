use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use futures_util::StreamExt;
use sha1::Digest;
use tokio::io::AsyncWriteExt;

use crate::error::{Result, SupervisorError};

/// Digest published by a version index for the artifact it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checksum {
    Sha1(String),
    Sha256(String),
}

enum Hasher {
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
}

impl Hasher {
    fn for_checksum(expected: &Checksum) -> Self {
        match expected {
            Checksum::Sha1(_) => Self::Sha1(sha1::Sha1::new()),
            Checksum::Sha256(_) => Self::Sha256(sha2::Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    fn finish(self) -> String {
        match self {
            Self::Sha1(h) => hex::encode(h.finalize()),
            Self::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadReport {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed_bytes_per_sec: u64,
}

pub fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .user_agent("kiln-agent")
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(15 * 60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    })
}

pub fn unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

fn download_chunk_threshold(total_bytes: u64) -> u64 {
    if total_bytes >= 2 * 1024 * 1024 * 1024 {
        8 * 1024 * 1024
    } else if total_bytes >= 512 * 1024 * 1024 {
        4 * 1024 * 1024
    } else {
        1024 * 1024
    }
}

/// Sibling temp path: `<dest>.<unix_ms>.tmp`.
pub fn temp_path_for(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    dest.with_file_name(format!("{name}.{}.tmp", unix_ms()))
}

/// Streams `url` into a sibling temp file, verifies `expected` when given, then renames the
/// temp file over `dest`. On any failure the temp file is removed and `dest` is untouched.
///
/// `on_progress(downloaded, total, bytes_per_sec)` is throttled to roughly one call per
/// chunk threshold or 300ms, plus a final call.
pub async fn download_file_atomic<F>(
    url: &str,
    dest: &Path,
    expected: Option<&Checksum>,
    on_progress: F,
) -> Result<DownloadReport>
where
    F: FnMut(u64, u64, u64) + Send,
{
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = temp_path_for(dest);

    match stream_to(url, &tmp, expected, on_progress).await {
        Ok(report) => {
            if let Err(err) = tokio::fs::rename(&tmp, dest).await {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(err.into());
            }
            Ok(report)
        }
        Err(err) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(SupervisorError::DownloadFailure(format!("{err:#}")))
        }
    }
}

async fn stream_to<F>(
    url: &str,
    tmp: &Path,
    expected: Option<&Checksum>,
    mut on_progress: F,
) -> anyhow::Result<DownloadReport>
where
    F: FnMut(u64, u64, u64) + Send,
{
    let resp = http_client()
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?
        .error_for_status()
        .with_context(|| format!("GET {url} (status)"))?;

    let total_bytes = resp.content_length().unwrap_or(0);
    let threshold = download_chunk_threshold(total_bytes.max(1));
    let mut hasher = expected.map(Hasher::for_checksum);
    let mut file = tokio::fs::File::create(tmp)
        .await
        .with_context(|| format!("create {}", tmp.display()))?;
    let mut stream = resp.bytes_stream();

    let started_at = std::time::Instant::now();
    let mut last_emit_bytes = 0u64;
    let mut last_emit_at = started_at;
    let mut downloaded_bytes = 0u64;
    let speed = |downloaded: u64, at: std::time::Instant| {
        let elapsed = at.duration_since(started_at).as_secs_f64();
        if elapsed > 0.0 {
            (downloaded as f64 / elapsed).round() as u64
        } else {
            0
        }
    };

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("read response body chunk")?;
        file.write_all(&chunk).await.context("write temp file")?;
        if let Some(h) = hasher.as_mut() {
            h.update(&chunk);
        }
        downloaded_bytes = downloaded_bytes.saturating_add(chunk.len() as u64);

        let now = std::time::Instant::now();
        if downloaded_bytes.saturating_sub(last_emit_bytes) >= threshold
            || now.duration_since(last_emit_at) >= Duration::from_millis(300)
        {
            on_progress(
                downloaded_bytes,
                total_bytes.max(downloaded_bytes),
                speed(downloaded_bytes, now),
            );
            last_emit_bytes = downloaded_bytes;
            last_emit_at = now;
        }
    }
    file.flush().await?;
    file.sync_all().await.ok();
    drop(file);

    if total_bytes > 0 && downloaded_bytes != total_bytes {
        anyhow::bail!("short read from {url}: got {downloaded_bytes} of {total_bytes} bytes");
    }

    if let (Some(expected), Some(hasher)) = (expected, hasher) {
        let got = hasher.finish();
        let want = match expected {
            Checksum::Sha1(v) | Checksum::Sha256(v) => v,
        };
        if !got.eq_ignore_ascii_case(want) {
            anyhow::bail!("checksum mismatch for {url}: expected {want}, got {got}");
        }
    }

    let report = DownloadReport {
        downloaded_bytes,
        total_bytes: total_bytes.max(downloaded_bytes),
        speed_bytes_per_sec: speed(downloaded_bytes, std::time::Instant::now()),
    };
    on_progress(
        report.downloaded_bytes,
        report.total_bytes,
        report.speed_bytes_per_sec,
    );
    Ok(report)
}

/// Extracts every entry of `zip_path` below `dest`. Entries whose names would escape `dest`
/// are skipped. Returns the number of files written.
pub fn extract_zip(zip_path: &Path, dest: &Path) -> Result<usize> {
    extract_zip_until(zip_path, dest, &AtomicBool::new(false))
}

/// Like [`extract_zip`], but checks `stop` before every entry and returns early once it is
/// set. Nothing is written after the early return.
pub fn extract_zip_until(zip_path: &Path, dest: &Path, stop: &AtomicBool) -> Result<usize> {
    let f = fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(f)
        .map_err(|e| SupervisorError::CorruptArchive(format!("{}: {e}", zip_path.display())))?;
    fs::create_dir_all(dest)?;

    let mut written = 0usize;
    for i in 0..archive.len() {
        if stop.load(Ordering::SeqCst) {
            tracing::debug!(zip = %zip_path.display(), written, "extraction stopped");
            break;
        }
        let mut file = archive
            .by_index(i)
            .map_err(|e| SupervisorError::CorruptArchive(format!("entry {i}: {e}")))?;
        let Some(rel) = file.enclosed_name() else {
            tracing::warn!(entry = file.name(), "skipping zip entry outside the target dir");
            continue;
        };
        let out_path = dest.join(rel);

        if file.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = fs::File::create(&out_path)?;
        std::io::copy(&mut file, &mut out)
            .map_err(|e| SupervisorError::CorruptArchive(format!("{}: {e}", out_path.display())))?;
        written += 1;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = file.unix_mode().map(|m| m & 0o777).filter(|m| *m != 0) {
                fs::set_permissions(&out_path, fs::Permissions::from_mode(mode))?;
            }
        }
    }
    Ok(written)
}

#[cfg(unix)]
pub fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    fn leftover_temps(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".tmp"))
            .collect()
    }

    #[tokio::test]
    async fn download_verifies_and_renames() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/server.jar"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jar-bytes".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("server.jar");
        let sha = hex::encode(sha2::Sha256::digest(b"jar-bytes"));
        let mut calls = 0;
        let report = download_file_atomic(
            &format!("{}/server.jar", server.uri()),
            &dest,
            Some(&Checksum::Sha256(sha)),
            |_, _, _| calls += 1,
        )
        .await
        .unwrap();

        assert_eq!(report.downloaded_bytes, 9);
        assert!(calls >= 1);
        assert_eq!(fs::read(&dest).unwrap(), b"jar-bytes");
        assert!(leftover_temps(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn checksum_mismatch_keeps_the_live_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/server.jar"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("server.jar");
        fs::write(&dest, b"old").unwrap();

        let err = download_file_atomic(
            &format!("{}/server.jar", server.uri()),
            &dest,
            Some(&Checksum::Sha1("00".repeat(20))),
            |_, _, _| {},
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SupervisorError::DownloadFailure(ref m) if m.contains("checksum")));
        assert_eq!(fs::read(&dest).unwrap(), b"old");
        assert!(leftover_temps(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn http_error_is_a_download_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("server.jar");
        let err = download_file_atomic(&format!("{}/missing", server.uri()), &dest, None, |_, _, _| {})
            .await
            .unwrap_err();
        assert_eq!(err.code(), "download_failed");
        assert!(!dest.exists());
        assert!(leftover_temps(dir.path()).is_empty());
    }

    /// Serves one response that promises more bytes than it sends, then hangs up.
    fn truncating_server(body: &'static [u8], claimed_len: usize) -> String {
        use std::io::{BufRead, BufReader};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(conn.try_clone().unwrap());
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 && line != "\r\n" {
                line.clear();
            }
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {claimed_len}\r\n\r\n");
            conn.write_all(head.as_bytes()).unwrap();
            conn.write_all(body).unwrap();
            conn.flush().unwrap();
        });
        format!("http://{addr}/server.jar")
    }

    #[tokio::test]
    async fn interrupted_transfer_keeps_the_live_file() {
        let url = truncating_server(b"only part", 4096);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("server.jar");
        fs::write(&dest, b"old").unwrap();

        let err = download_file_atomic(&url, &dest, None, |_, _, _| {})
            .await
            .unwrap_err();
        assert_eq!(err.code(), "download_failed");
        assert_eq!(fs::read(&dest).unwrap(), b"old");
        assert!(leftover_temps(dir.path()).is_empty());
    }

    #[test]
    fn stop_flag_halts_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("payload.zip");
        {
            let f = fs::File::create(&zip_path).unwrap();
            let mut zip = zip::ZipWriter::new(f);
            let opts = zip::write::SimpleFileOptions::default();
            for i in 0..5 {
                zip.start_file(format!("f{i}.txt"), opts).unwrap();
                zip.write_all(b"x").unwrap();
            }
            zip.finish().unwrap();
        }

        let out = dir.path().join("out");
        let stop = AtomicBool::new(true);
        assert_eq!(extract_zip_until(&zip_path, &out, &stop).unwrap(), 0);
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
    }

    #[test]
    fn temp_path_sits_next_to_the_artifact() {
        let tmp = temp_path_for(Path::new("/srv/a/server.jar"));
        assert_eq!(tmp.parent().unwrap(), Path::new("/srv/a"));
        let name = tmp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("server.jar."));
        assert!(name.ends_with(".tmp"));
    }

    #[test]
    fn extracts_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("payload.zip");
        {
            let f = fs::File::create(&zip_path).unwrap();
            let mut zip = zip::ZipWriter::new(f);
            let opts = zip::write::SimpleFileOptions::default();
            zip.start_file("Server/HytaleServer.jar", opts).unwrap();
            zip.write_all(b"jar").unwrap();
            zip.start_file("Assets.zip", opts).unwrap();
            zip.write_all(b"assets").unwrap();
            zip.finish().unwrap();
        }

        let out = dir.path().join("out");
        assert_eq!(extract_zip(&zip_path, &out).unwrap(), 2);
        assert_eq!(fs::read(out.join("Server/HytaleServer.jar")).unwrap(), b"jar");
        assert_eq!(fs::read(out.join("Assets.zip")).unwrap(), b"assets");
    }

    #[test]
    fn garbage_is_a_corrupt_archive() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("bad.zip");
        fs::write(&zip_path, b"definitely not a zip").unwrap();
        let err = extract_zip(&zip_path, &dir.path().join("out")).unwrap_err();
        assert_eq!(err.code(), "corrupt_archive");
    }
}
