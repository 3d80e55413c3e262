//! Execution confinement lane.
//!
//! One OS thread owns the engine and the session state. Every operation is a
//! boxed closure queued on an unbounded channel and run to completion, in
//! submission order, on that thread. Nothing else ever touches the engine.
//!
//! ```text
//! ┌──────────────┐   Job (FnOnce)    ┌────────────────────────┐
//! │ async callers│ ─────────────────>│ lane thread            │
//! │ (any thread) │ <─ oneshot / mpsc │  owns: Rc<Engine>,     │
//! └──────────────┘                   │        SessionState    │
//!                                    └────────────────────────┘
//! ```

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::engine::NativeEngine;
use crate::session::state::SessionState;
use crate::session::SessionError;

/// Name of the lane thread; native calls only ever happen on it.
pub const LANE_THREAD_NAME: &str = "llm-session-lane";

type Job<E> = Box<dyn FnOnce(&mut LaneCore<E>) + Send>;

/// State owned by the lane thread.
pub(crate) struct LaneCore<E: NativeEngine> {
    pub(crate) engine: Rc<E>,
    pub(crate) state: SessionState<E>,
    backend_ready: bool,
}

impl<E: NativeEngine> LaneCore<E> {
    fn new(engine: E) -> Self {
        Self {
            engine: Rc::new(engine),
            state: SessionState::Unloaded,
            backend_ready: false,
        }
    }

    /// One-time native setup, run by the first operation that needs the
    /// engine. A failed init is retried by the next such operation.
    pub(crate) fn ensure_backend(&mut self) -> Result<(), SessionError> {
        if self.backend_ready {
            return Ok(());
        }
        self.engine.install_log_sink();
        self.engine.init_backend()?;
        self.backend_ready = true;
        info!(engine = %self.engine.engine_info(), "Native backend initialized");
        Ok(())
    }

    fn shutdown(&mut self) {
        self.state.unload();
        if self.backend_ready {
            self.engine.shutdown_backend();
            self.backend_ready = false;
            debug!("Native backend shut down");
        }
    }
}

/// Run `op`, turning a panic into [`SessionError::Panicked`].
pub(crate) fn guarded<R>(op: impl FnOnce() -> Result<R, SessionError>) -> Result<R, SessionError> {
    panic::catch_unwind(AssertUnwindSafe(op))
        .unwrap_or_else(|payload| Err(SessionError::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Joins the lane thread when the last handle goes away.
struct LaneWorker {
    thread: Option<thread::JoinHandle<()>>,
}

impl Drop for LaneWorker {
    fn drop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        // A job holding the last handle would otherwise join itself.
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            error!("Session lane thread panicked during shutdown");
        }
    }
}

pub(crate) struct Lane<E: NativeEngine> {
    // Declared before `worker`: the sender must close before the join.
    jobs: mpsc::UnboundedSender<Job<E>>,
    _worker: LaneWorker,
}

impl<E: NativeEngine> Lane<E> {
    pub(crate) fn spawn(engine: E) -> Result<Self, SessionError> {
        let (jobs, rx) = mpsc::unbounded_channel::<Job<E>>();

        let thread = thread::Builder::new()
            .name(LANE_THREAD_NAME.into())
            .spawn(move || run_lane(engine, rx))
            .map_err(SessionError::LaneSpawn)?;

        Ok(Self {
            jobs,
            _worker: LaneWorker {
                thread: Some(thread),
            },
        })
    }

    /// Queue `op` without waiting for it.
    pub(crate) fn dispatch<F>(&self, op: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut LaneCore<E>) + Send + 'static,
    {
        self.jobs
            .send(Box::new(op))
            .map_err(|_| SessionError::LaneClosed)
    }

    /// Queue `op` now and return a future resolving to its result.
    ///
    /// The job is enqueued before this returns, so submission order is call
    /// order even if the futures are polled in a different order.
    pub(crate) fn submit<R, F>(&self, op: F) -> impl Future<Output = Result<R, SessionError>> + Send + 'static
    where
        R: Send + 'static,
        F: FnOnce(&mut LaneCore<E>) -> Result<R, SessionError> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let queued = self.dispatch(move |core| {
            let result = guarded(|| op(core));
            // The caller may have stopped waiting.
            let _ = reply_tx.send(result);
        });

        async move {
            queued?;
            reply_rx.await.map_err(|_| SessionError::LaneClosed)?
        }
    }
}

fn run_lane<E: NativeEngine>(engine: E, mut jobs: mpsc::UnboundedReceiver<Job<E>>) {
    let mut core = LaneCore::new(engine);
    debug!("Session lane started");

    while let Some(job) = jobs.blocking_recv() {
        // Jobs report their own panics; this only keeps the loop alive.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job(&mut core))) {
            error!(panic = %panic_message(payload.as_ref()), "Session lane job panicked");
        }
    }

    core.shutdown();
    debug!("Session lane stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_catches_panic() {
        let result: Result<(), SessionError> = guarded(|| panic!("boom"));
        match result {
            Err(SessionError::Panicked(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_guarded_passes_through() {
        assert_eq!(guarded(|| Ok(5)).unwrap(), 5);
    }
}
