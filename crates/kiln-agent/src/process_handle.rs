use std::{
    collections::BTreeMap,
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{ChildStdin, Command},
    sync::{oneshot, watch},
    task::JoinHandle,
};

/// How long the exit notification waits for the output readers to hit EOF. Grandchildren
/// that inherited the pipes can hold them open past the exit of the direct child.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[cfg(unix)]
const SIGTERM: i32 = libc::SIGTERM;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LaunchSpec {
    pub exec: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Pipe stdin so console commands can be written; otherwise stdin is `/dev/null`.
    pub stdin: bool,
}

impl LaunchSpec {
    pub fn new(exec: impl Into<String>, args: Vec<String>, cwd: PathBuf) -> Self {
        Self {
            exec: exec.into(),
            args,
            cwd,
            env: BTreeMap::new(),
            stdin: true,
        }
    }

    pub fn display(&self) -> String {
        format!("{} {}", self.exec, self.args.join(" "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    /// Exit code 0, or terminated by SIGTERM.
    pub fn is_clean(&self) -> bool {
        self.code == Some(0) || (cfg!(unix) && self.signal == Some(SIGTERM))
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the agent dies, take the child with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// One spawned OS process: stdin writer, signal delivery, and a one-shot exit notification.
///
/// The `Child` lives in a background wait task. The exit notification is published only
/// after both output readers drained, so every line the process printed has been handed to
/// the line callback by the time anyone observes the exit.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessHandle {
    /// Spawns the process. `on_line` receives each raw output line (lossy UTF-8, without the
    /// trailing newline) in the order it was read from its stream.
    pub fn spawn<F>(spec: &LaunchSpec, on_line: F) -> std::io::Result<Self>
    where
        F: Fn(StreamKind, String) + Send + Sync + 'static,
    {
        let mut cmd = Command::new(&spec.exec);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(if spec.stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            // Own session so signals can target the whole process group.
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();

        let on_line = Arc::new(on_line);
        let mut readers = Vec::<JoinHandle<()>>::new();
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, StreamKind::Stdout, on_line.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, StreamKind::Stderr, on_line.clone()));
        }
        let stdin = child.stdin.take();

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let res = tokio::select! {
                res = child.wait() => res,
                // Explicit kill request, or the handle was dropped.
                _ = &mut kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let drain = async {
                for reader in readers {
                    let _ = reader.await;
                }
            };
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, drain).await.is_err() {
                tracing::debug!(?pid, "output pipes still open after exit");
            }

            let outcome = match res {
                Ok(status) => ExitOutcome::from(status),
                Err(err) => {
                    tracing::warn!(?pid, error = %err, "waiting for child failed");
                    ExitOutcome::default()
                }
            };
            let _ = exit_tx.send(Some(outcome));
        });

        Ok(Self {
            pid,
            stdin: tokio::sync::Mutex::new(stdin),
            exit_rx,
            kill_tx: Mutex::new(Some(kill_tx)),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub async fn is_writable(&self) -> bool {
        self.exited().is_none() && self.stdin.lock().await.is_some()
    }

    /// Writes `line` plus a newline to stdin. Returns whether the pipe accepted it; a broken
    /// pipe closes stdin for good.
    pub async fn write_line(&self, line: &str) -> bool {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return false;
        };
        let mut data = line.trim_end_matches(['\r', '\n']).to_string();
        data.push('\n');
        let res = async {
            stdin.write_all(data.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        match res {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(pid = ?self.pid, error = %err, "stdin closed");
                *guard = None;
                false
            }
        }
    }

    /// Delivers a signal to the process group. On non-unix targets only [`Signal::Kill`]
    /// has an effect.
    pub fn signal(&self, signal: Signal) -> bool {
        if self.exited().is_some() {
            return false;
        }

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                let sig = match signal {
                    Signal::Terminate => libc::SIGTERM,
                    Signal::Kill => libc::SIGKILL,
                };
                let pid = pid as i32;
                if unsafe { libc::kill(-pid, sig) } == 0 || unsafe { libc::kill(pid, sig) } == 0 {
                    return true;
                }
            }
        }

        match signal {
            Signal::Kill => self.force_kill(),
            Signal::Terminate => false,
        }
    }

    fn force_kill(&self) -> bool {
        match self.kill_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn exited(&self) -> Option<ExitOutcome> {
        *self.exit_rx.borrow()
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitOutcome>> {
        self.exit_rx.clone()
    }

    pub async fn wait(&self) -> ExitOutcome {
        wait_exit(self.exit_rx.clone()).await
    }
}

/// Resolves once an exit has been published.
pub async fn wait_exit(mut rx: watch::Receiver<Option<ExitOutcome>>) -> ExitOutcome {
    match rx.wait_for(|o| o.is_some()).await {
        Ok(v) => (*v).unwrap_or_default(),
        // Sender gone without a value: the wait task itself died.
        Err(_) => ExitOutcome::default(),
    }
}

fn spawn_reader<R, F>(stream: R, kind: StreamKind, on_line: Arc<F>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: Fn(StreamKind, String) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::<u8>::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    on_line(kind, line.trim_end_matches(['\r', '\n']).to_string());
                }
                Err(err) => {
                    tracing::debug!(?kind, error = %err, "output stream read failed");
                    break;
                }
            }
        }
    })
}
