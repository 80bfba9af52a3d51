//! Cooperative single-threaded readiness loop.
//!
//! The loop multiplexes three watcher kinds over a kernel poller:
//!
//! - [`Io`]: fd readiness (read/write interest)
//! - [`Timer`]: monotonic one-shot or repeating timers
//! - [`Prepare`]: hooks run before each blocking poll
//!
//! plus an async wake: any thread may call `notify()` on the loop's shared
//! poller, and the loop runs its wake hook each iteration. That is where
//! the owning event thread drains its inbox and observes stop/suspend.
//!
//! # Thread confinement
//!
//! Watcher handles are `!Send`, and the start/stop/again entry points
//! resolve the owning loop through a thread-local. Manipulating watchers
//! from any other thread is a contract violation and panics.
//!
//! # Callback budget
//!
//! Every dispatch samples thread CPU time around the callback and emits a
//! warning when it exceeds [`MAX_CALLBACK_DURATION`]. Callbacks must not
//! block; a blocked callback stalls every other watcher on the loop.

use polling::{Event as PollEvent, Events, Poller};
use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Budget for a single callback dispatch.
pub const MAX_CALLBACK_DURATION: Duration = Duration::from_millis(250);

/// Readiness interest for an [`Io`] watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// No readiness.
    pub const NONE: Self = Self(0);
    /// Readable readiness.
    pub const READ: Self = Self(1);
    /// Writable readiness.
    pub const WRITE: Self = Self(2);

    /// Read and write combined.
    #[must_use]
    pub const fn both() -> Self {
        Self(3)
    }

    /// Union of two interests.
    #[must_use]
    pub const fn add(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// True if read interest is present.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & 1 != 0
    }

    /// True if write interest is present.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & 2 != 0
    }

    /// True if no interest is present.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Thread CPU time consumed so far, for the callback budget.
fn thread_cpu_time() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime only writes into the timespec we hand it.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc == 0 {
        Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
    } else {
        Duration::ZERO
    }
}

/// Runs a callback under the CPU budget, warning on overrun.
pub(crate) fn dispatch_budgeted(kind: &'static str, key: u64, f: impl FnOnce()) {
    let start = thread_cpu_time();
    f();
    let spent = thread_cpu_time().saturating_sub(start);
    if spent > MAX_CALLBACK_DURATION {
        warn!(
            kind,
            key,
            spent_ms = spent.as_millis() as u64,
            "callback exceeded its cpu budget"
        );
    }
}

fn wall_now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn to_poll_event(key: usize, interest: Interest) -> PollEvent {
    match (interest.is_readable(), interest.is_writable()) {
        (true, true) => PollEvent::all(key),
        (true, false) => PollEvent::readable(key),
        (false, true) => PollEvent::writable(key),
        (false, false) => PollEvent::none(key),
    }
}

// === watchers ===

type IoCb = Box<dyn FnMut(&Io, RawFd, Interest)>;

struct IoInner {
    fd: RawFd,
    interest: Cell<Interest>,
    key: Cell<Option<usize>>,
    cb: RefCell<Option<IoCb>>,
}

/// An fd readiness watcher.
#[derive(Clone)]
pub struct Io {
    inner: Rc<IoInner>,
}

impl Io {
    /// Creates a watcher for `fd` with the given interest. The watcher is
    /// inert until [`io_start`].
    pub fn new(fd: RawFd, interest: Interest, cb: impl FnMut(&Io, RawFd, Interest) + 'static) -> Self {
        Self {
            inner: Rc::new(IoInner {
                fd,
                interest: Cell::new(interest),
                key: Cell::new(None),
                cb: RefCell::new(Some(Box::new(cb))),
            }),
        }
    }

    /// The watched fd.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    /// True while started on a loop.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.key.get().is_some()
    }
}

type TimerCb = Box<dyn FnMut(&Timer)>;

struct TimerInner {
    after: Cell<f64>,
    repeat: Cell<f64>,
    /// Sequence of the live arm; 0 while inactive. Heap entries with a
    /// different sequence are stale and discarded lazily.
    armed: Cell<u64>,
    cb: RefCell<Option<TimerCb>>,
}

/// A monotonic loop timer (seconds, libev-style `after`/`repeat`).
#[derive(Clone)]
pub struct Timer {
    inner: Rc<TimerInner>,
}

impl Timer {
    /// Creates a timer firing after `after` seconds, then every `repeat`
    /// seconds if non-zero. Inert until [`timer_start`].
    pub fn new(after: f64, repeat: f64, cb: impl FnMut(&Timer) + 'static) -> Self {
        Self {
            inner: Rc::new(TimerInner {
                after: Cell::new(after),
                repeat: Cell::new(repeat),
                armed: Cell::new(0),
                cb: RefCell::new(Some(Box::new(cb))),
            }),
        }
    }

    /// True while armed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.armed.get() != 0
    }

    /// The repeat interval in seconds.
    #[must_use]
    pub fn repeat(&self) -> f64 {
        self.inner.repeat.get()
    }
}

type PrepareCb = Box<dyn FnMut(&Prepare)>;

struct PrepareInner {
    active: Cell<bool>,
    cb: RefCell<Option<PrepareCb>>,
}

/// A hook run before each blocking poll.
#[derive(Clone)]
pub struct Prepare {
    inner: Rc<PrepareInner>,
}

impl Prepare {
    /// Creates a prepare hook. Inert until [`prepare_start`].
    pub fn new(cb: impl FnMut(&Prepare) + 'static) -> Self {
        Self {
            inner: Rc::new(PrepareInner {
                active: Cell::new(false),
                cb: RefCell::new(Some(Box::new(cb))),
            }),
        }
    }

    /// True while started on a loop.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.get()
    }
}

// === heap ===

struct TimerDeadline {
    when: Instant,
    seq: u64,
    watcher: Rc<TimerInner>,
}

impl PartialEq for TimerDeadline {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for TimerDeadline {}

impl PartialOrd for TimerDeadline {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerDeadline {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed for a min-heap (earliest deadline first).
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// === the loop ===

pub(crate) struct LoopInner {
    poller: Arc<Poller>,
    ios: RefCell<HashMap<usize, Rc<IoInner>>>,
    next_key: Cell<usize>,
    timers: RefCell<BinaryHeap<TimerDeadline>>,
    next_seq: Cell<u64>,
    prepares: RefCell<Vec<Rc<PrepareInner>>>,
    wake_hook: RefCell<Option<Box<dyn FnMut(&EvLoop)>>>,
    break_requested: Cell<bool>,
    now_instant: Cell<Instant>,
    now_wall: Cell<f64>,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<LoopInner>>> = const { RefCell::new(None) };
}

fn with_current<R>(f: impl FnOnce(&Rc<LoopInner>) -> R) -> R {
    CURRENT.with(|current| {
        let current = current.borrow();
        let inner = current
            .as_ref()
            .expect("watchers can only be manipulated from the owning event thread");
        f(inner)
    })
}

/// Restores the previously-current loop on drop.
pub struct CurrentGuard {
    prev: Option<Rc<LoopInner>>,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| {
            *current.borrow_mut() = self.prev.take();
        });
    }
}

/// A cooperative single-threaded event loop.
pub struct EvLoop {
    inner: Rc<LoopInner>,
}

impl EvLoop {
    /// Creates a loop with its own poller.
    pub fn new() -> io::Result<Self> {
        Ok(Self::with_poller(Arc::new(Poller::new()?)))
    }

    /// Creates a loop around a poller shared for cross-thread wakes.
    #[must_use]
    pub fn with_poller(poller: Arc<Poller>) -> Self {
        Self {
            inner: Rc::new(LoopInner {
                poller,
                ios: RefCell::new(HashMap::new()),
                next_key: Cell::new(1),
                timers: RefCell::new(BinaryHeap::new()),
                next_seq: Cell::new(1),
                prepares: RefCell::new(Vec::new()),
                wake_hook: RefCell::new(None),
                break_requested: Cell::new(false),
                now_instant: Cell::new(Instant::now()),
                now_wall: Cell::new(wall_now_seconds()),
            }),
        }
    }

    /// The shared poller; `notify()` on it wakes the loop from any thread.
    #[must_use]
    pub fn poller(&self) -> &Arc<Poller> {
        &self.inner.poller
    }

    /// Installs this loop as the thread's current loop for the lifetime of
    /// the returned guard. Watcher entry points resolve through it.
    #[must_use]
    pub fn make_current(&self) -> CurrentGuard {
        CURRENT.with(|current| {
            let prev = current.borrow_mut().replace(Rc::clone(&self.inner));
            CurrentGuard { prev }
        })
    }

    /// Installs the per-iteration wake hook (inbox drain, stop/suspend).
    pub fn set_wake_hook(&self, hook: impl FnMut(&EvLoop) + 'static) {
        *self.inner.wake_hook.borrow_mut() = Some(Box::new(hook));
    }

    /// Requests the loop to exit after the current iteration.
    pub fn break_loop(&self) {
        self.inner.break_requested.set(true);
    }

    /// Cached wall timestamp of the current iteration, epoch seconds.
    #[must_use]
    pub fn now_seconds(&self) -> f64 {
        self.inner.now_wall.get()
    }

    /// Runs until [`Self::break_loop`]. Must be called with this loop
    /// current (see [`Self::make_current`]).
    pub fn run(&self) {
        let inner = &self.inner;
        inner.break_requested.set(false);
        self.refresh_now();
        let mut events = Events::new();

        loop {
            self.run_prepares();
            if inner.break_requested.get() {
                break;
            }

            let timeout = self.next_timeout();
            events.clear();
            if let Err(err) = inner.poller.wait(&mut events, timeout) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(error = %err, "poller wait failed, leaving loop");
                break;
            }
            self.refresh_now();

            // Async wake: inbox drain and stop/suspend observation.
            let hook = inner.wake_hook.borrow_mut().take();
            if let Some(mut hook) = hook {
                hook(self);
                let mut slot = inner.wake_hook.borrow_mut();
                if slot.is_none() {
                    *slot = Some(hook);
                }
            }
            if inner.break_requested.get() {
                break;
            }

            self.dispatch_timers();
            for ev in events.iter() {
                self.dispatch_io(&ev);
            }
            if inner.break_requested.get() {
                break;
            }
        }
    }

    fn refresh_now(&self) {
        self.inner.now_instant.set(Instant::now());
        self.inner.now_wall.set(wall_now_seconds());
    }

    fn run_prepares(&self) {
        let prepares: Vec<Rc<PrepareInner>> = self
            .inner
            .prepares
            .borrow()
            .iter()
            .filter(|p| p.active.get())
            .map(Rc::clone)
            .collect();
        for p in prepares {
            let taken = p.cb.borrow_mut().take();
            if let Some(mut cb) = taken {
                let handle = Prepare {
                    inner: Rc::clone(&p),
                };
                dispatch_budgeted("prepare_callback", 0, || cb(&handle));
                let mut slot = p.cb.borrow_mut();
                if slot.is_none() {
                    *slot = Some(cb);
                }
            }
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        let mut heap = self.inner.timers.borrow_mut();
        loop {
            let (stale, when) = match heap.peek() {
                None => return None,
                Some(top) => (top.watcher.armed.get() != top.seq, top.when),
            };
            if stale {
                heap.pop();
                continue;
            }
            return Some(when.saturating_duration_since(Instant::now()));
        }
    }

    fn dispatch_timers(&self) {
        let now = self.inner.now_instant.get();
        loop {
            let entry = {
                let mut heap = self.inner.timers.borrow_mut();
                let (stale, due) = match heap.peek() {
                    None => break,
                    Some(top) => (
                        top.watcher.armed.get() != top.seq,
                        top.when <= now,
                    ),
                };
                if stale {
                    heap.pop();
                    continue;
                }
                if !due {
                    break;
                }
                heap.pop().expect("peeked entry must pop")
            };

            let watcher = entry.watcher;
            let repeat = watcher.repeat.get();
            if repeat > 0.0 {
                // Re-arm before the callback so `again` inside it wins.
                self.arm_timer(&watcher, now + Duration::from_secs_f64(repeat));
            } else {
                watcher.armed.set(0);
            }

            let taken = watcher.cb.borrow_mut().take();
            if let Some(mut cb) = taken {
                let handle = Timer {
                    inner: Rc::clone(&watcher),
                };
                dispatch_budgeted("timer_callback", 0, || cb(&handle));
                let mut slot = watcher.cb.borrow_mut();
                if slot.is_none() {
                    *slot = Some(cb);
                }
            }
        }
    }

    fn arm_timer(&self, watcher: &Rc<TimerInner>, when: Instant) {
        let seq = self.inner.next_seq.get();
        self.inner.next_seq.set(seq + 1);
        watcher.armed.set(seq);
        self.inner.timers.borrow_mut().push(TimerDeadline {
            when,
            seq,
            watcher: Rc::clone(watcher),
        });
    }

    fn dispatch_io(&self, ev: &PollEvent) {
        let watcher = self.inner.ios.borrow().get(&ev.key).map(Rc::clone);
        let Some(watcher) = watcher else { return };

        // Notifications are oneshot: re-arm while still registered so the
        // watcher behaves level-triggered until stopped.
        if watcher.key.get() == Some(ev.key) {
            // SAFETY: the fd is open while the watcher is started; stopping
            // removes it from the poller before the caller closes the fd.
            let bfd = unsafe { BorrowedFd::borrow_raw(watcher.fd) };
            if let Err(err) = self
                .inner
                .poller
                .modify(bfd, to_poll_event(ev.key, watcher.interest.get()))
            {
                warn!(fd = watcher.fd, error = %err, "failed to re-arm io watcher");
            }
        }

        let mut got = Interest::NONE;
        if ev.readable {
            got = got.add(Interest::READ);
        }
        if ev.writable {
            got = got.add(Interest::WRITE);
        }

        let taken = watcher.cb.borrow_mut().take();
        if let Some(mut cb) = taken {
            let handle = Io {
                inner: Rc::clone(&watcher),
            };
            let fd = watcher.fd;
            dispatch_budgeted("io_callback", fd as u64, || cb(&handle, fd, got));
            let mut slot = watcher.cb.borrow_mut();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }
}

impl std::fmt::Debug for EvLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvLoop")
            .field("ios", &self.inner.ios.borrow().len())
            .field("timers", &self.inner.timers.borrow().len())
            .field("prepares", &self.inner.prepares.borrow().len())
            .finish_non_exhaustive()
    }
}

// === thread-confined watcher entry points ===

/// Starts an io watcher on the current thread's loop.
pub fn io_start(io: &Io) {
    with_current(|inner| {
        if io.inner.key.get().is_some() {
            return;
        }
        let key = inner.next_key.get();
        inner.next_key.set(key + 1);
        io.inner.key.set(Some(key));
        inner.ios.borrow_mut().insert(key, Rc::clone(&io.inner));
        // SAFETY: the caller keeps the fd open while the watcher is started;
        // io_stop removes it from the poller before the fd may be closed.
        if let Err(err) =
            unsafe { inner.poller.add(io.inner.fd, to_poll_event(key, io.inner.interest.get())) }
        {
            warn!(fd = io.inner.fd, error = %err, "failed to register io watcher");
            inner.ios.borrow_mut().remove(&key);
            io.inner.key.set(None);
        }
    });
}

/// Stops an io watcher on the current thread's loop.
pub fn io_stop(io: &Io) {
    with_current(|inner| {
        if let Some(key) = io.inner.key.take() {
            inner.ios.borrow_mut().remove(&key);
            // SAFETY: the fd is still open; the caller closes it only after
            // stopping the watcher.
            let bfd = unsafe { BorrowedFd::borrow_raw(io.inner.fd) };
            if let Err(err) = inner.poller.delete(bfd) {
                warn!(fd = io.inner.fd, error = %err, "failed to deregister io watcher");
            }
        }
    });
}

/// Starts a loop timer on the current thread's loop.
pub fn timer_start(timer: &Timer) {
    with_current(|inner| {
        let after = timer.inner.after.get().max(0.0);
        let when = Instant::now() + Duration::from_secs_f64(after);
        let loop_handle = EvLoop {
            inner: Rc::clone(inner),
        };
        loop_handle.arm_timer(&timer.inner, when);
    });
}

/// Stops a loop timer on the current thread's loop.
pub fn timer_stop(timer: &Timer) {
    with_current(|_| {
        timer.inner.armed.set(0);
    });
}

/// Re-initializes `after`/`repeat`; takes effect on the next start.
pub fn timer_set(timer: &Timer, after: f64, repeat: f64) {
    timer.inner.after.set(after);
    timer.inner.repeat.set(repeat);
}

/// Restarts the timer relative to now: re-arms at `repeat` seconds if
/// repeating, otherwise stops it.
pub fn timer_again(timer: &Timer) {
    with_current(|inner| {
        let repeat = timer.inner.repeat.get();
        if repeat > 0.0 {
            let when = Instant::now() + Duration::from_secs_f64(repeat);
            let loop_handle = EvLoop {
                inner: Rc::clone(inner),
            };
            loop_handle.arm_timer(&timer.inner, when);
        } else {
            timer.inner.armed.set(0);
        }
    });
}

/// Starts a prepare hook on the current thread's loop.
pub fn prepare_start(prepare: &Prepare) {
    with_current(|inner| {
        if !prepare.inner.active.get() {
            prepare.inner.active.set(true);
            inner.prepares.borrow_mut().push(Rc::clone(&prepare.inner));
        }
    });
}

/// Stops a prepare hook on the current thread's loop.
pub fn prepare_stop(prepare: &Prepare) {
    with_current(|inner| {
        prepare.inner.active.set(false);
        inner
            .prepares
            .borrow_mut()
            .retain(|p| !Rc::ptr_eq(p, &prepare.inner));
    });
}

/// The loop's cached wall timestamp when called from inside an event
/// thread, else a fresh sample. Epoch seconds.
#[must_use]
pub fn timestamp_now() -> f64 {
    CURRENT.with(|current| current.borrow().as_ref().map(|inner| inner.now_wall.get()))
        .unwrap_or_else(wall_now_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn interest_flags() {
        init_test("interest_flags");
        let both = Interest::READ.add(Interest::WRITE);
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(Interest::NONE.is_empty());
        assert_eq!(both, Interest::both());
        crate::test_complete!("interest_flags");
    }

    #[test]
    fn oneshot_timer_fires_and_breaks() {
        init_test("oneshot_timer_fires_and_breaks");
        let evloop = EvLoop::new().expect("loop");
        let _guard = evloop.make_current();
        let fired = Rc::new(Cell::new(0u32));

        let fired_in_cb = Rc::clone(&fired);
        let timer = Timer::new(0.01, 0.0, move |_t| {
            fired_in_cb.set(fired_in_cb.get() + 1);
        });
        timer_start(&timer);
        assert!(timer.is_active());

        // Break shortly after the timer is due.
        let breaker = Timer::new(0.05, 0.0, |_t| {
            with_current(|inner| inner.break_requested.set(true));
        });
        timer_start(&breaker);

        evloop.run();
        assert_eq!(fired.get(), 1);
        assert!(!timer.is_active());
        crate::test_complete!("oneshot_timer_fires_and_breaks");
    }

    #[test]
    fn repeating_timer_and_again() {
        init_test("repeating_timer_and_again");
        let evloop = EvLoop::new().expect("loop");
        let _guard = evloop.make_current();
        let fired = Rc::new(Cell::new(0u32));

        let fired_in_cb = Rc::clone(&fired);
        let ticker = Timer::new(0.005, 0.005, move |t| {
            let n = fired_in_cb.get() + 1;
            fired_in_cb.set(n);
            if n >= 3 {
                timer_stop(t);
                with_current(|inner| inner.break_requested.set(true));
            }
        });
        timer_start(&ticker);
        evloop.run();
        assert_eq!(fired.get(), 3);
        assert!(!ticker.is_active());

        // `again` restarts a repeating timer relative to now.
        timer_again(&ticker);
        assert!(ticker.is_active());
        timer_stop(&ticker);
        assert!(!ticker.is_active());
        crate::test_complete!("repeating_timer_and_again");
    }

    #[test]
    fn prepare_runs_before_each_block() {
        init_test("prepare_runs_before_each_block");
        let evloop = EvLoop::new().expect("loop");
        let _guard = evloop.make_current();
        let prepares = Rc::new(Cell::new(0u32));

        let seen = Rc::clone(&prepares);
        let prepare = Prepare::new(move |_p| {
            seen.set(seen.get() + 1);
        });
        prepare_start(&prepare);
        assert!(prepare.is_active());

        let breaker = Timer::new(0.02, 0.0, |_t| {
            with_current(|inner| inner.break_requested.set(true));
        });
        timer_start(&breaker);
        evloop.run();
        assert!(prepares.get() >= 1);

        prepare_stop(&prepare);
        assert!(!prepare.is_active());
        crate::test_complete!("prepare_runs_before_each_block");
    }

    #[test]
    fn io_watcher_sees_readable() {
        init_test("io_watcher_sees_readable");
        let evloop = EvLoop::new().expect("loop");
        let _guard = evloop.make_current();
        let (mut tx, rx) = UnixStream::pair().expect("socketpair");
        rx.set_nonblocking(true).expect("nonblocking");

        let got = Rc::new(Cell::new(Interest::NONE));
        let got_in_cb = Rc::clone(&got);
        let io = Io::new(rx.as_raw_fd(), Interest::READ, move |io, _fd, revents| {
            got_in_cb.set(revents);
            io_stop(io);
            with_current(|inner| inner.break_requested.set(true));
        });
        io_start(&io);
        assert!(io.is_active());

        tx.write_all(b"x").expect("write");
        evloop.run();

        assert!(got.get().is_readable());
        assert!(!io.is_active());
        crate::test_complete!("io_watcher_sees_readable");
    }

    #[test]
    fn notify_wakes_and_runs_hook() {
        init_test("notify_wakes_and_runs_hook");
        let evloop = EvLoop::new().expect("loop");
        let _guard = evloop.make_current();
        let poller = Arc::clone(evloop.poller());

        let hooks = Rc::new(Cell::new(0u32));
        let hooks_in_cb = Rc::clone(&hooks);
        evloop.set_wake_hook(move |evloop| {
            hooks_in_cb.set(hooks_in_cb.get() + 1);
            evloop.break_loop();
        });

        let notifier = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            poller.notify().expect("notify");
        });

        evloop.run();
        notifier.join().expect("notifier");
        assert!(hooks.get() >= 1);
        crate::test_complete!("notify_wakes_and_runs_hook");
    }

    #[test]
    fn timestamp_inside_and_outside() {
        init_test("timestamp_inside_and_outside");
        let outside = timestamp_now();
        assert!(outside > 0.0);

        let evloop = EvLoop::new().expect("loop");
        let _guard = evloop.make_current();
        let inside = timestamp_now();
        assert!(inside > 0.0);
        // Cached value tracks the loop iteration, not each call.
        assert_eq!(timestamp_now(), inside);
        crate::test_complete!("timestamp_inside_and_outside");
    }
}
