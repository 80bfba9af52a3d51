//! Thread base: the lifecycle plumbing shared by managed OS threads.
//!
//! Carries the name/id/role identity, the `ready`/`running` flags the
//! supervisor polls, a heartbeat counter punched by long-running loops, and
//! the suspend/resume protocol: any thread may request a suspension with a
//! hook to run at the parking point; the owning loop honors it by calling
//! [`ThreadBase::check_and_suspend`] between iterations.

use crate::error::{Error, ErrorKind, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

/// Scheduling role of a managed thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadRole {
    /// Control-plane work; no latency guarantees.
    #[default]
    Control,
    /// Data-plane work; expected to stay hot.
    Data,
}

/// Hook invoked at the parking point of a suspension.
pub type SuspendHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct SuspendInner {
    requested: bool,
    suspended: bool,
    hook: Option<SuspendHook>,
}

/// Lifecycle state shared between a managed thread and its callers.
pub struct ThreadBase {
    name: String,
    id: u32,
    role: ThreadRole,
    cores_mask: u64,
    ready: AtomicBool,
    running: AtomicBool,
    heartbeat: AtomicU64,
    suspend: Mutex<SuspendInner>,
    suspend_cv: Condvar,
}

impl ThreadBase {
    /// Creates the base state for a thread named `name` with the given id.
    #[must_use]
    pub fn new(name: impl Into<String>, id: u32, role: ThreadRole, cores_mask: u64) -> Self {
        Self {
            name: name.into(),
            id,
            role,
            cores_mask,
            ready: AtomicBool::new(false),
            running: AtomicBool::new(false),
            heartbeat: AtomicU64::new(0),
            suspend: Mutex::new(SuspendInner::default()),
            suspend_cv: Condvar::new(),
        }
    }

    /// Thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Thread id.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Scheduling role.
    #[must_use]
    pub const fn role(&self) -> ThreadRole {
        self.role
    }

    /// Core affinity mask recorded at creation.
    #[must_use]
    pub const fn cores_mask(&self) -> u64 {
        self.cores_mask
    }

    /// Marks the thread ready (fully initialized).
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// True once the thread finished initialization.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Marks the thread running / stopped.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// True while the thread is expected to keep looping.
    #[must_use]
    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Records liveness for the external supervisor.
    pub fn punch_heartbeat(&self) {
        self.heartbeat.fetch_add(1, Ordering::AcqRel);
    }

    /// Heartbeats punched so far.
    #[must_use]
    pub fn heartbeats(&self) -> u64 {
        self.heartbeat.load(Ordering::Acquire)
    }

    /// Requests a suspension, running `hook` at the parking point.
    ///
    /// Callable from any thread. Fails with [`ErrorKind::SuspendPending`] if
    /// a request is already outstanding.
    pub fn suspend_req(&self, hook: impl FnOnce() + Send + 'static) -> Result<()> {
        let mut state = self.suspend.lock();
        if state.requested {
            return Err(Error::new(ErrorKind::SuspendPending)
                .with_context(format!("thread {}", self.name)));
        }
        state.requested = true;
        state.hook = Some(Box::new(hook));
        Ok(())
    }

    /// Wakes a suspended thread, or cancels a pending request.
    pub fn resume_req(&self) {
        let mut state = self.suspend.lock();
        state.requested = false;
        self.suspend_cv.notify_all();
    }

    /// True while the thread is parked in [`Self::check_and_suspend`].
    #[must_use]
    pub fn suspended(&self) -> bool {
        self.suspend.lock().suspended
    }

    /// True once a suspension has been requested and not yet resumed.
    #[must_use]
    pub fn suspend_requested(&self) -> bool {
        self.suspend.lock().requested
    }

    /// Honors a pending suspend request: runs the hook, then parks until
    /// [`Self::resume_req`]. Called by the owning loop between iterations;
    /// returns immediately when nothing is pending.
    pub fn check_and_suspend(&self) {
        let mut state = self.suspend.lock();
        if !state.requested {
            return;
        }
        let hook = state.hook.take();
        state.suspended = true;
        drop(state);

        if let Some(hook) = hook {
            hook();
        }

        let mut state = self.suspend.lock();
        while state.requested {
            self.suspend_cv.wait(&mut state);
        }
        state.suspended = false;
    }

    /// Spawns a named OS thread.
    pub fn spawn(
        &self,
        entry: impl FnOnce() + Send + 'static,
    ) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(entry)
            .map_err(|err| {
                Error::new(ErrorKind::Spawn)
                    .with_context(format!("thread {}", self.name))
                    .with_source(err)
            })
    }
}

impl std::fmt::Debug for ThreadBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadBase")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("ready", &self.ready())
            .field("running", &self.running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn flags_and_heartbeat() {
        let base = ThreadBase::new("t", 1, ThreadRole::Control, 0);
        assert!(!base.ready());
        assert!(!base.running());
        base.set_ready(true);
        base.set_running(true);
        assert!(base.ready());
        assert!(base.running());
        base.punch_heartbeat();
        base.punch_heartbeat();
        assert_eq!(base.heartbeats(), 2);
    }

    #[test]
    fn suspend_resume_roundtrip() {
        let base = Arc::new(ThreadBase::new("s", 2, ThreadRole::Control, 0));
        let hook_ran = Arc::new(AtomicBool::new(false));

        let worker = {
            let base = Arc::clone(&base);
            std::thread::spawn(move || {
                // The loop owner polls for suspension between iterations.
                for _ in 0..200 {
                    base.check_and_suspend();
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };

        let hook_flag = Arc::clone(&hook_ran);
        base.suspend_req(move || hook_flag.store(true, Ordering::SeqCst))
            .expect("first request");
        // A second request while pending is rejected.
        assert!(base.suspend_req(|| {}).is_err());

        // Wait for the worker to park.
        let mut parked = false;
        for _ in 0..500 {
            if base.suspended() {
                parked = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(parked, "worker should park");
        assert!(hook_ran.load(Ordering::SeqCst), "hook runs at the parking point");

        base.resume_req();
        worker.join().expect("worker exits");
        assert!(!base.suspended());
    }
}
