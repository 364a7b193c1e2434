use std::time::Duration;

use async_trait::async_trait;
use tokio::{
    sync::watch,
    time::{Instant, sleep_until},
};

use crate::process_handle::{ExitOutcome, ProcessHandle, Signal, wait_exit};

/// What the escalation needs from a process.
#[async_trait]
pub trait Terminable: Send + Sync {
    async fn write_line(&self, line: &str) -> bool;
    fn signal(&self, signal: Signal) -> bool;
    fn exit_watch(&self) -> watch::Receiver<Option<ExitOutcome>>;
}

#[async_trait]
impl Terminable for ProcessHandle {
    async fn write_line(&self, line: &str) -> bool {
        ProcessHandle::write_line(self, line).await
    }

    fn signal(&self, signal: Signal) -> bool {
        ProcessHandle::signal(self, signal)
    }

    fn exit_watch(&self) -> watch::Receiver<Option<ExitOutcome>> {
        ProcessHandle::exit_watch(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    StopCommandSent,
    StopCommandSkipped,
    Terminate,
    Kill,
}

/// Stop command, then SIGTERM at half the timeout (immediately when stdin is not
/// writable), then SIGKILL at the full timeout. Resolves once, when the exit is observed;
/// the pending step timers are dropped with it.
pub async fn escalate<T, F>(target: &T, stop_command: &str, timeout: Duration, on_step: F) -> ExitOutcome
where
    T: Terminable + ?Sized,
    F: Fn(ShutdownStep),
{
    let exit = target.exit_watch();
    if let Some(outcome) = *exit.borrow() {
        return outcome;
    }

    let started = Instant::now();
    let half = timeout / 2;
    let wrote = tokio::time::timeout(half, target.write_line(stop_command))
        .await
        .unwrap_or(false);
    on_step(if wrote {
        ShutdownStep::StopCommandSent
    } else {
        ShutdownStep::StopCommandSkipped
    });

    let term_at = if wrote { started + half } else { Instant::now() };
    let term = sleep_until(term_at);
    let kill = sleep_until(started + timeout);
    let exited = wait_exit(exit);
    tokio::pin!(term, kill, exited);

    let mut term_sent = false;
    let mut kill_sent = false;
    loop {
        tokio::select! {
            biased;
            outcome = &mut exited => return outcome,
            _ = &mut term, if !term_sent => {
                term_sent = true;
                if target.signal(Signal::Terminate) {
                    on_step(ShutdownStep::Terminate);
                }
            }
            _ = &mut kill, if !kill_sent => {
                kill_sent = true;
                if target.signal(Signal::Kill) {
                    on_step(ShutdownStep::Kill);
                }
            }
        }
    }
}
