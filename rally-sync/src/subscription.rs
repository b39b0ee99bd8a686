//! Cancellable handle for a background listener task.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use tokio::task::AbortHandle;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Liveness of one listener, shared between its task and its handles.
///
/// Callbacks run under the delivery gate, and stopping takes the same gate,
/// so once [`Liveness::stop`] returns no callback of this listener is
/// running or will run. A callback that stops its own listener (directly or
/// by replacing it) does not wait on itself.
#[derive(Debug, Default)]
pub(crate) struct Liveness {
    alive: AtomicBool,
    gate: Mutex<()>,
    delivering: Mutex<Option<ThreadId>>,
}

impl Liveness {
    fn new(alive: bool) -> Self {
        Self {
            alive: AtomicBool::new(alive),
            ..Self::default()
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Run `f` if the listener is still live.
    pub(crate) fn deliver<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let _gate = lock(&self.gate);
        if !self.is_alive() {
            return None;
        }
        *lock(&self.delivering) = Some(thread::current().id());
        let result = f();
        *lock(&self.delivering) = None;
        Some(result)
    }

    /// Mark the listener finished and run `f`, at most once over its life.
    pub(crate) fn finish<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let _gate = lock(&self.gate);
        if !self.alive.swap(false, Ordering::SeqCst) {
            return None;
        }
        *lock(&self.delivering) = Some(thread::current().id());
        let result = f();
        *lock(&self.delivering) = None;
        Some(result)
    }

    /// Stop delivering. Waits for a callback running on another thread.
    pub(crate) fn stop(&self) {
        let reentrant = *lock(&self.delivering) == Some(thread::current().id());
        if reentrant {
            self.alive.store(false, Ordering::SeqCst);
            return;
        }
        let _gate = lock(&self.gate);
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Handle to a live listener (match subscription, count watch, mirror).
///
/// Cloning shares the same listener. [`Subscription::unsubscribe`] stops the
/// listener's callbacks and aborts the task, which also cancels any retry
/// timer it is sleeping on. Once `unsubscribe` returns no callback of this
/// listener fires. Dropping the handle does not cancel.
#[derive(Clone)]
pub struct Subscription {
    liveness: Arc<Liveness>,
    abort: Arc<Mutex<Option<AbortHandle>>>,
}

impl Subscription {
    /// Spawn `make(liveness)` on the tokio runtime. The task must invoke
    /// caller callbacks through [`Liveness::deliver`] or [`Liveness::finish`].
    pub(crate) fn spawn<F, Fut>(make: F) -> Self
    where
        F: FnOnce(Arc<Liveness>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let liveness = Arc::new(Liveness::new(true));
        let handle = tokio::spawn(make(liveness.clone()));
        Self {
            liveness,
            abort: Arc::new(Mutex::new(Some(handle.abort_handle()))),
        }
    }

    /// A handle that was never live, for paths that fail before spawning.
    pub fn inert() -> Self {
        Self {
            liveness: Arc::new(Liveness::new(false)),
            abort: Arc::new(Mutex::new(None)),
        }
    }

    /// Stop the listener. Idempotent.
    pub fn unsubscribe(&self) {
        self.liveness.stop();
        let handle = lock(&self.abort).take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Whether the listener can still deliver callbacks. Turns false after
    /// `unsubscribe` and after the listener reaches a terminal state.
    pub fn is_active(&self) -> bool {
        self.liveness.is_alive()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
