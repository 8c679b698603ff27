//! Single-writer execution for one session.
//!
//! Every mutation of a session's state runs as a job on one worker task.
//! Deferred callbacks (immediate, delayed, repeating) are queued as jobs
//! when they fire, never run inline, and check their cancel flag only when
//! their turn comes.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info_span, Instrument};
use varsync_core::SessionId;

use crate::error::EngineError;
use crate::session::SessionState;

type Job = Box<dyn FnOnce(&mut SessionState) + Send>;

/// Cancel flag for a deferred callback.
#[derive(Clone, Debug, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Cloneable submission side of a [`SessionExecutor`].
#[derive(Clone)]
pub struct ExecutorHandle {
    tx: mpsc::UnboundedSender<Job>,
    shutdown: CancellationToken,
    timers: CancellationToken,
}

impl ExecutorHandle {
    fn submit(&self, job: Job) -> Result<(), EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ExecutorClosed);
        }
        self.tx.send(job).map_err(|_| EngineError::ExecutorClosed)
    }

    /// Run `f` on the worker and wait for its result. A panic inside `f` is
    /// reported as [`EngineError::BackendFault`]; the worker keeps running.
    pub async fn execute<F, R>(&self, f: F) -> Result<R, EngineError>
    where
        F: FnOnce(&mut SessionState) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(Box::new(move |state| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(state))).map_err(|payload| {
                let reason = panic_message(payload);
                error!(%reason, "session job panicked");
                reason
            });
            let _ = tx.send(outcome);
        }))?;
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(msg)) => Err(EngineError::BackendFault(msg)),
            Err(_) => Err(EngineError::ExecutorClosed),
        }
    }

    /// Queue `f` behind whatever is already waiting.
    pub fn set_immediate<F>(&self, f: F) -> TimerHandle
    where
        F: FnOnce(&mut SessionState) + Send + 'static,
    {
        let handle = TimerHandle::new();
        let _ = self.submit(self.guarded(handle.clone(), f, true));
        handle
    }

    /// Queue `f` once `delay` has elapsed.
    pub fn set_timeout<F>(&self, delay: Duration, f: F) -> TimerHandle
    where
        F: FnOnce(&mut SessionState) + Send + 'static,
    {
        self.defer(delay, f, true)
    }

    /// Queue `f` every `period` until cancelled.
    pub fn set_interval<F>(&self, period: Duration, f: F) -> TimerHandle
    where
        F: FnMut(&mut SessionState) + Send + 'static,
    {
        let handle = TimerHandle::new();
        let flag = handle.clone();
        let exec = self.clone();
        let callback = Arc::new(Mutex::new(f));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = exec.timers.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if flag.is_cancelled() {
                    break;
                }
                let callback = Arc::clone(&callback);
                let job = exec.guarded(
                    flag.clone(),
                    move |state| {
                        let mut callback = callback.lock();
                        (*callback)(state);
                    },
                    true,
                );
                if exec.submit(job).is_err() {
                    break;
                }
            }
        });
        handle
    }

    /// Internal deferral that does not trigger a refresh afterwards.
    pub(crate) fn defer_quiet<F>(&self, delay: Duration, f: F) -> TimerHandle
    where
        F: FnOnce(&mut SessionState) + Send + 'static,
    {
        self.defer(delay, f, false)
    }

    fn defer<F>(&self, delay: Duration, f: F, refresh: bool) -> TimerHandle
    where
        F: FnOnce(&mut SessionState) + Send + 'static,
    {
        let handle = TimerHandle::new();
        let job = self.guarded(handle.clone(), f, refresh);
        let exec = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = exec.timers.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = exec.submit(job);
                }
            }
        });
        handle
    }

    /// Wrap a callback so the cancel flags are read when the job runs.
    fn guarded<F>(&self, handle: TimerHandle, f: F, refresh: bool) -> Job
    where
        F: FnOnce(&mut SessionState) + Send + 'static,
    {
        let timers = self.timers.clone();
        Box::new(move |state| {
            if handle.is_cancelled() || timers.is_cancelled() {
                return;
            }
            f(state);
            if refresh {
                state.schedule_refresh();
            }
        })
    }

    /// Stop every pending and repeating callback.
    pub fn cancel_timers(&self) {
        self.timers.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.tx.is_closed()
    }

    /// A handle whose jobs go nowhere, for driving state directly.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        Self {
            tx,
            timers: shutdown.child_token(),
            shutdown,
        }
    }
}

/// Owns the worker task for one session.
pub struct SessionExecutor {
    handle: ExecutorHandle,
    worker: Option<JoinHandle<()>>,
}

impl SessionExecutor {
    /// Build the session state around a fresh handle and start its worker.
    pub fn spawn<F>(session_id: &SessionId, build: F) -> Self
    where
        F: FnOnce(ExecutorHandle) -> SessionState,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = ExecutorHandle {
            tx,
            timers: shutdown.child_token(),
            shutdown: shutdown.clone(),
        };
        let state = build(handle.clone());
        let span = info_span!("session", session_id = %session_id);
        let worker = tokio::spawn(run(state, rx, shutdown).instrument(span));
        Self {
            handle,
            worker: Some(worker),
        }
    }

    pub fn handle(&self) -> &ExecutorHandle {
        &self.handle
    }

    pub async fn execute<F, R>(&self, f: F) -> Result<R, EngineError>
    where
        F: FnOnce(&mut SessionState) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.execute(f).await
    }

    /// Stop the worker. Jobs still queued are dropped and their callers see
    /// [`EngineError::ExecutorClosed`].
    pub async fn shutdown(&mut self) {
        self.handle.cancel_timers();
        self.handle.shutdown.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl Drop for SessionExecutor {
    fn drop(&mut self) {
        self.handle.shutdown.cancel();
    }
}

async fn run(mut state: SessionState, mut rx: mpsc::UnboundedReceiver<Job>, shutdown: CancellationToken) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job(&mut state))) {
            error!(reason = %panic_message(payload), "deferred callback panicked");
        }
        state.flush_outbound();
    }
    rx.close();
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
