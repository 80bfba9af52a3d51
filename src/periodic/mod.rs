//! Periodic driver: feeds timer-fd ticks to the process-global wheel.
//!
//! A dedicated OS thread creates the global [`TimerWheel`], arms a kernel
//! timer fd at the wheel's slice interval, and converts each wakeup into
//! wheel advances. Missed wakeups are paid back in batches of at most
//! [`BATCH_SLICE_SIZE`] slices, punching the thread heartbeat between
//! batches so the supervisor keeps seeing the thread alive.
//!
//! Every other thread talks to the wheel through the thin forwards below
//! ([`timer_schedule`], [`timer_delete`], ...), which degrade to safe
//! defaults until the driver has published the wheel.

mod timerfd;

pub use timerfd::TimerFd;

use crate::error::Result;
use crate::thread::{ThreadBase, ThreadRole};
use crate::twheel::{
    TimerCallback, TimerCtx, TimerHandle, TimerWheel, DEFAULT_SLICE_INTERVAL_MS,
    DEFAULT_WHEEL_DURATION_MS,
};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::error;

/// Maximum slices charged to one `tick` call while paying back misses.
pub const BATCH_SLICE_SIZE: u64 = 10;

static G_TWHEEL: OnceLock<Arc<TimerWheel>> = OnceLock::new();
static RUNNING: AtomicBool = AtomicBool::new(false);
static READY: AtomicBool = AtomicBool::new(false);

/// The process-global wheel, once the driver has created it.
#[must_use]
pub fn global_wheel() -> Option<Arc<TimerWheel>> {
    G_TWHEEL.get().map(Arc::clone)
}

/// True while the driver loop is alive.
#[must_use]
pub fn is_running() -> bool {
    RUNNING.load(Ordering::Acquire)
}

/// True once the driver finished initialization.
#[must_use]
pub fn is_ready() -> bool {
    READY.load(Ordering::Acquire)
}

/// Drives `wheel` through `missed` elapsed slices in capped batches,
/// invoking `heartbeat` after each batch.
pub(crate) fn drive_batches(wheel: &TimerWheel, mut missed: u64, mut heartbeat: impl FnMut()) {
    while missed > 0 {
        let batch = missed.min(BATCH_SLICE_SIZE);
        wheel.tick(batch * wheel.slice_interval_ms());
        heartbeat();
        missed -= batch;
    }
}

/// The periodic driver thread.
pub struct PeriodicDriver {
    base: Arc<ThreadBase>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PeriodicDriver {
    /// Spawns the driver: creates (or adopts) the global wheel, arms the
    /// timer fd at the slice interval, and starts ticking.
    pub fn spawn() -> Result<Self> {
        let base = Arc::new(ThreadBase::new("periodic", 0, ThreadRole::Control, 0));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_base = Arc::clone(&base);
        let thread_stop = Arc::clone(&stop);
        let handle = base.spawn(move || run_driver(&thread_base, &thread_stop))?;

        Ok(Self {
            base,
            stop,
            join: Some(handle),
        })
    }

    /// The driver's thread base (flags, heartbeat).
    #[must_use]
    pub fn base(&self) -> &ThreadBase {
        &self.base
    }

    /// Stops the loop at the next wakeup and joins the thread.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PeriodicDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_driver(base: &ThreadBase, stop: &AtomicBool) {
    let wheel = match init_global_wheel() {
        Ok(wheel) => wheel,
        Err(err) => {
            error!(error = %err, "periodic thread failed to create timer wheel");
            return;
        }
    };

    let mut tfd = match TimerFd::new(Duration::from_millis(wheel.slice_interval_ms())) {
        Ok(tfd) => tfd,
        Err(err) => {
            error!(error = %err, "periodic thread failed to initialize timer fd");
            return;
        }
    };

    RUNNING.store(true, Ordering::Release);
    READY.store(true, Ordering::Release);
    base.set_ready(true);
    base.set_running(true);

    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        match tfd.wait() {
            Ok(missed) => {
                drive_batches(&wheel, missed, || base.punch_heartbeat());
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                error!(error = %err, "periodic thread failed to wait on timer");
                break;
            }
        }
    }

    RUNNING.store(false, Ordering::Release);
    base.set_running(false);
    error!("periodic thread exiting");
}

fn init_global_wheel() -> std::result::Result<Arc<TimerWheel>, crate::twheel::TimerWheelConfigError> {
    if let Some(wheel) = G_TWHEEL.get() {
        return Ok(Arc::clone(wheel));
    }
    let wheel = Arc::new(TimerWheel::new(
        DEFAULT_SLICE_INTERVAL_MS,
        DEFAULT_WHEEL_DURATION_MS,
        true,
    )?);
    // A racing initializer is fine; adopt whichever wheel landed first.
    let _ = G_TWHEEL.set(wheel);
    Ok(Arc::clone(G_TWHEEL.get().expect("global wheel just initialized")))
}

/// Schedules a callback on the global wheel; `None` until the driver is up
/// or when the entry pool is exhausted.
pub fn timer_schedule(
    timer_id: u32,
    timeout_ms: u64,
    ctx: Option<TimerCtx>,
    cb: TimerCallback,
    periodic: bool,
    initial_delay_ms: u64,
) -> Option<TimerHandle> {
    G_TWHEEL
        .get()?
        .add_timer(timer_id, timeout_ms, ctx, cb, periodic, initial_delay_ms)
}

/// Deletes a scheduled timer, returning its context.
pub fn timer_delete(handle: TimerHandle) -> Option<TimerCtx> {
    G_TWHEEL.get()?.del_timer(handle)
}

/// Reschedules a timer on the global wheel.
pub fn timer_update(
    handle: TimerHandle,
    timeout_ms: u64,
    periodic: bool,
    ctx: Option<TimerCtx>,
) -> Option<TimerHandle> {
    G_TWHEEL.get()?.upd_timer(handle, timeout_ms, periodic, ctx)
}

/// Replaces a timer's stored context.
pub fn timer_update_ctx(handle: TimerHandle, ctx: Option<TimerCtx>) -> Option<TimerHandle> {
    G_TWHEEL.get()?.upd_timer_ctx(handle, ctx)
}

/// Milliseconds until `handle` fires; 0 when the driver is down or the
/// handle is stale.
#[must_use]
pub fn get_timeout_remaining(handle: TimerHandle) -> u64 {
    G_TWHEEL
        .get()
        .map_or(0, |wheel| wheel.get_timeout_remaining(handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn batches_are_capped_with_heartbeats_between() {
        init_test("batches_are_capped_with_heartbeats_between");
        let wheel = TimerWheel::new(100, 10_000, true).unwrap();
        let mut batches: Vec<u32> = Vec::new();
        let mut last_slice = wheel.curr_slice();

        drive_batches(&wheel, 25, || {
            let now = wheel.curr_slice();
            batches.push((now + wheel.num_slices() - last_slice) % wheel.num_slices());
            last_slice = now;
        });

        // 25 missed slices are paid back as 10 + 10 + 5, a heartbeat after
        // each batch.
        assert_eq!(batches, vec![10, 10, 5]);
        crate::test_complete!("batches_are_capped_with_heartbeats_between");
    }

    #[test]
    fn forwards_are_safe_before_the_driver_runs() {
        init_test("forwards_are_safe_before_the_driver_runs");
        // The global wheel may or may not exist depending on test order;
        // either way the forwards must not panic on a bogus handle path.
        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        let cb: TimerCallback = Arc::new(move |_h, _id, _ctx| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        if let Some(handle) = timer_schedule(1, 60_000, None, cb, false, 0) {
            assert!(get_timeout_remaining(handle) > 0);
            let _ = timer_delete(handle);
        }
        crate::test_complete!("forwards_are_safe_before_the_driver_runs");
    }
}
