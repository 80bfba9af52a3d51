//! Infrastructure hooks handed to the IPC transport.
//!
//! The event thread does not know the transport's wire format; it only
//! lends it the ability to watch fds and schedule one-shot timers on the
//! owning loop. At loop startup the thread registers an [`Infra`] hook
//! table here under its thread id, tagged sync or async, and the transport
//! fetches it with [`infra_for`].
//!
//! The hooks resolve the owning loop through a thread-local, so they must
//! be invoked from the owning thread; the watch tokens they return are
//! likewise thread-confined.

use crate::event::{Io, Timer};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::sync::Arc;

/// How the transport should initialize for a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcMode {
    /// Request/response on the caller's schedule.
    Sync,
    /// Event-driven on the owning loop.
    Async,
}

/// Token for an active fd watch; return it to [`Infra::fd_unwatch`].
pub struct FdWatch {
    io: Io,
}

impl FdWatch {
    pub(crate) fn new(io: Io) -> Self {
        Self { io }
    }

    pub(crate) fn io(&self) -> &Io {
        &self.io
    }

    /// The watched fd.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.io.fd()
    }
}

/// Token for a pending one-shot timer; return it to [`Infra::timer_del`].
pub struct TimerWatch {
    timer: Timer,
}

impl TimerWatch {
    pub(crate) fn new(timer: Timer) -> Self {
        Self { timer }
    }

    pub(crate) fn timer(&self) -> &Timer {
        &self.timer
    }
}

/// Handler invoked when a watched fd becomes readable.
pub type IpcIoCb = Box<dyn FnMut(RawFd)>;
/// Handler invoked when a one-shot timer elapses.
pub type IpcTimerCb = Box<dyn FnMut()>;

/// Watcher hooks lent to the transport by an event thread.
pub struct Infra {
    /// Watches `fd` for readability on the owning loop.
    pub fd_watch: Box<dyn Fn(RawFd, IpcIoCb) -> FdWatch + Send + Sync>,
    /// Stops an fd watch.
    pub fd_unwatch: Box<dyn Fn(FdWatch) + Send + Sync>,
    /// Schedules a one-shot timer `after` seconds out.
    pub timer_add: Box<dyn Fn(f64, IpcTimerCb) -> TimerWatch + Send + Sync>,
    /// Cancels a pending one-shot timer.
    pub timer_del: Box<dyn Fn(TimerWatch) + Send + Sync>,
}

static INFRAS: Mutex<BTreeMap<u32, (IpcMode, Arc<Infra>)>> = Mutex::new(BTreeMap::new());

/// Registers `infra` for `thread_id` with synchronous initialization.
pub fn init_sync(thread_id: u32, infra: Infra) {
    INFRAS
        .lock()
        .insert(thread_id, (IpcMode::Sync, Arc::new(infra)));
}

/// Registers `infra` for `thread_id` with asynchronous initialization.
pub fn init_async(thread_id: u32, infra: Infra) {
    INFRAS
        .lock()
        .insert(thread_id, (IpcMode::Async, Arc::new(infra)));
}

/// Hands the transport the hooks registered for `thread_id`.
#[must_use]
pub fn infra_for(thread_id: u32) -> Option<Arc<Infra>> {
    INFRAS.lock().get(&thread_id).map(|(_, infra)| Arc::clone(infra))
}

/// The initialization mode registered for `thread_id`.
#[must_use]
pub fn mode_for(thread_id: u32) -> Option<IpcMode> {
    INFRAS.lock().get(&thread_id).map(|(mode, _)| *mode)
}

/// Drops the registration for `thread_id`.
pub fn deregister(thread_id: u32) {
    INFRAS.lock().remove(&thread_id);
}
