use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Cooperative stop flag observed by every worker loop at least once per
/// iteration.
#[derive(Clone)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Suspends until `stop()` is called, or returns immediately if it
    /// already has been.
    pub async fn wait_for_stop(&self) {
        loop {
            if self.is_stopped() {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Stands in for a reference to the OS process running the worker
/// runtime. This runtime models a worker as a reader task and an
/// inference task sharing one stop signal rather than a forked OS process;
/// `is_alive` / `terminate` preserve the same observable contract the
/// orchestrator and watchdog depend on.
pub struct WorkerProcessHandle {
    stop: StopSignal,
    reader: JoinHandle<()>,
    inference: JoinHandle<()>,
}

impl WorkerProcessHandle {
    pub fn new(stop: StopSignal, reader: JoinHandle<()>, inference: JoinHandle<()>) -> Self {
        Self {
            stop,
            reader,
            inference,
        }
    }

    /// Alive only while both tasks are still running; either one exiting
    /// means the worker process has exited.
    pub fn is_alive(&self) -> bool {
        !self.reader.is_finished() && !self.inference.is_finished()
    }

    pub fn signal_stop(&self) {
        self.stop.stop();
    }

    /// Graceful signal, wait up to `graceful`, then abort whatever
    /// remains. The handle is consumed either way, so a process that
    /// refuses to die still gets dropped.
    pub async fn terminate(mut self, graceful: Duration) {
        self.stop.stop();
        let joined = tokio::time::timeout(graceful, async {
            let _ = (&mut self.reader).await;
            let _ = (&mut self.inference).await;
        })
        .await;
        if joined.is_err() {
            self.reader.abort();
            self.inference.abort();
        }
    }
}
