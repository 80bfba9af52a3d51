//! Event threads: managed OS threads running a readiness loop.
//!
//! Lifecycle: build (registers the instance in the global thread table) →
//! `start` (spawns the OS thread, which installs the IPC hooks, runs the
//! user init, publishes UP, and loops) → `suspend_req`/`resume` as needed →
//! `stop` (wakes the loop, runs the user exit, publishes DOWN).
//!
//! Cross-thread input arrives exclusively through the inbox: user messages
//! via [`message_send`], liveness notifications via the up/down registry.
//! Everything else (watcher manipulation, subscriptions) must happen on
//! the owning thread.

use super::eloop::{dispatch_budgeted, io_start, io_stop, timer_start, timer_stop, EvLoop, Interest, Io, Timer};
use super::inbox::{Envelope, Inbox, Payload, UpDownStatus};
use super::updown::registry;
use crate::error::{Error, ErrorKind, Result};
use crate::ipc::{self, FdWatch, Infra, TimerWatch};
use crate::thread::{ThreadBase, ThreadRole};
use parking_lot::Mutex;
use polling::Poller;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Highest allowed event-thread id.
pub const MAX_THREAD_ID: u32 = 255;

/// Opaque per-thread user context handed to the callbacks.
pub type UserCtx = Arc<dyn std::any::Any + Send + Sync>;

/// User hook run on the loop thread before the first iteration.
pub type LoopInitFn = Box<dyn FnOnce(Option<&UserCtx>) + Send>;
/// User hook run on the loop thread after the last iteration.
pub type LoopExitFn = Box<dyn FnOnce(Option<&UserCtx>) + Send>;
/// Handler for [`message_send`] payloads.
pub type MessageCb = Box<dyn Fn(Payload, Option<&UserCtx>) + Send + Sync>;
/// Handler for thread-up notifications: receives the peer's id.
pub type UpDownCb = Arc<dyn Fn(u32) + Send + Sync>;

static THREAD_TABLE: Mutex<BTreeMap<u32, Arc<EventThreadInner>>> = Mutex::new(BTreeMap::new());

pub(crate) fn table_get(thread_id: u32) -> Option<Arc<EventThreadInner>> {
    THREAD_TABLE.lock().get(&thread_id).map(Arc::clone)
}

thread_local! {
    static CURRENT_THREAD: RefCell<Option<Arc<EventThreadInner>>> =
        const { RefCell::new(None) };
}

fn with_current_thread<R>(f: impl FnOnce(&Arc<EventThreadInner>) -> R) -> R {
    CURRENT_THREAD.with(|current| {
        let current = current.borrow();
        let inner = current
            .as_ref()
            .expect("must be called from an event thread");
        f(inner)
    })
}

pub(crate) struct EventThreadInner {
    base: ThreadBase,
    poller: Arc<Poller>,
    inbox: Inbox,
    sync_ipc: bool,
    stop: Mutex<bool>,
    init_fn: Mutex<Option<LoopInitFn>>,
    exit_fn: Mutex<Option<LoopExitFn>>,
    message_cb: Option<MessageCb>,
    user_ctx: Mutex<Option<UserCtx>>,
    updown_cbs: Mutex<BTreeMap<u32, UpDownCb>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl EventThreadInner {
    /// Enqueues an UP notification and wakes the loop. Called by the
    /// up/down registry from arbitrary threads.
    pub(crate) fn notify_thread_up(&self, target: u32) {
        self.inbox.push(Envelope::UpDown {
            thread_id: target,
            status: UpDownStatus::Up,
        });
        let _ = self.poller.notify();
    }

    fn enqueue_user(&self, payload: Payload) {
        self.inbox.push(Envelope::User(payload));
        let _ = self.poller.notify();
    }

    /// Drains the inbox on the owning thread.
    fn process_inbox(&self) {
        while let Some(envelope) = self.inbox.pop() {
            match envelope {
                Envelope::User(payload) => {
                    let cb = self
                        .message_cb
                        .as_ref()
                        .expect("user message delivered to a thread without a message callback");
                    let ctx = self.user_ctx.lock().clone();
                    dispatch_budgeted("message_callback", u64::from(self.base.id()), || {
                        cb(payload, ctx.as_ref());
                    });
                }
                Envelope::UpDown { thread_id, status } => {
                    if status != UpDownStatus::Up {
                        continue;
                    }
                    let cb = self.updown_cbs.lock().get(&thread_id).map(Arc::clone);
                    match cb {
                        Some(cb) => {
                            dispatch_budgeted("updown_callback", u64::from(thread_id), || {
                                cb(thread_id);
                            });
                        }
                        None => {
                            warn!(thread_id, "up-notification without a registered callback");
                        }
                    }
                }
            }
        }
    }

    fn stopped(&self) -> bool {
        *self.stop.lock()
    }

    /// The loop body run on the spawned OS thread.
    fn run(self: Arc<Self>) {
        CURRENT_THREAD.with(|current| {
            *current.borrow_mut() = Some(Arc::clone(&self));
        });

        let evloop = EvLoop::with_poller(Arc::clone(&self.poller));
        let _loop_guard = evloop.make_current();

        // Hand the IPC transport its watcher hooks before anything runs.
        let infra = infra_hooks();
        if self.sync_ipc {
            ipc::init_sync(self.base.id(), infra);
        } else {
            ipc::init_async(self.base.id(), infra);
        }

        {
            let me = Arc::clone(&self);
            evloop.set_wake_hook(move |evloop| {
                let stop = me.stop.lock();
                if *stop || me.base.suspend_requested() {
                    evloop.break_loop();
                    return;
                }
                drop(stop);
                me.process_inbox();
            });
        }

        if let Some(init_fn) = self.init_fn.lock().take() {
            let ctx = self.user_ctx.lock().clone();
            init_fn(ctx.as_ref());
        }
        self.base.set_ready(true);
        registry().up(self.base.id());
        debug!(thread = self.base.name(), id = self.base.id(), "event thread up");

        while !self.stopped() {
            evloop.run();
            self.base.check_and_suspend();
        }

        if let Some(exit_fn) = self.exit_fn.lock().take() {
            let ctx = self.user_ctx.lock().clone();
            exit_fn(ctx.as_ref());
        }
        registry().down(self.base.id());
        debug!(thread = self.base.name(), id = self.base.id(), "event thread down");

        CURRENT_THREAD.with(|current| {
            current.borrow_mut().take();
        });
    }
}

/// Builder for an [`EventThread`].
pub struct EventThreadBuilder {
    name: String,
    thread_id: u32,
    role: ThreadRole,
    cores_mask: u64,
    sync_ipc: bool,
    init_fn: Option<LoopInitFn>,
    exit_fn: Option<LoopExitFn>,
    message_cb: Option<MessageCb>,
}

impl EventThreadBuilder {
    /// Starts a builder for a thread named `name` at table slot `thread_id`.
    #[must_use]
    pub fn new(name: impl Into<String>, thread_id: u32) -> Self {
        Self {
            name: name.into(),
            thread_id,
            role: ThreadRole::Control,
            cores_mask: 0,
            sync_ipc: false,
            init_fn: None,
            exit_fn: None,
            message_cb: None,
        }
    }

    /// Sets the scheduling role.
    #[must_use]
    pub fn role(mut self, role: ThreadRole) -> Self {
        self.role = role;
        self
    }

    /// Sets the core affinity mask recorded on the thread base.
    #[must_use]
    pub fn cores_mask(mut self, mask: u64) -> Self {
        self.cores_mask = mask;
        self
    }

    /// Selects synchronous IPC initialization.
    #[must_use]
    pub fn sync_ipc(mut self, sync: bool) -> Self {
        self.sync_ipc = sync;
        self
    }

    /// Hook run on the loop thread before the first iteration.
    #[must_use]
    pub fn init_fn(mut self, f: impl FnOnce(Option<&UserCtx>) + Send + 'static) -> Self {
        self.init_fn = Some(Box::new(f));
        self
    }

    /// Hook run on the loop thread after the last iteration.
    #[must_use]
    pub fn exit_fn(mut self, f: impl FnOnce(Option<&UserCtx>) + Send + 'static) -> Self {
        self.exit_fn = Some(Box::new(f));
        self
    }

    /// Handler for [`message_send`] payloads.
    #[must_use]
    pub fn message_cb(
        mut self,
        f: impl Fn(Payload, Option<&UserCtx>) + Send + Sync + 'static,
    ) -> Self {
        self.message_cb = Some(Box::new(f));
        self
    }

    /// Registers the thread in the global table.
    ///
    /// Fails when the id is out of range or already taken; each id is
    /// registered exactly once.
    pub fn build(self) -> Result<EventThread> {
        if self.thread_id > MAX_THREAD_ID {
            return Err(Error::new(ErrorKind::ThreadIdOutOfRange)
                .with_context(format!("id {}", self.thread_id)));
        }
        let poller = Poller::new().map_err(Error::io)?;
        let inner = Arc::new(EventThreadInner {
            base: ThreadBase::new(self.name, self.thread_id, self.role, self.cores_mask),
            poller: Arc::new(poller),
            inbox: Inbox::new(),
            sync_ipc: self.sync_ipc,
            stop: Mutex::new(false),
            init_fn: Mutex::new(self.init_fn),
            exit_fn: Mutex::new(self.exit_fn),
            message_cb: self.message_cb,
            user_ctx: Mutex::new(None),
            updown_cbs: Mutex::new(BTreeMap::new()),
            join: Mutex::new(None),
        });

        let mut table = THREAD_TABLE.lock();
        if table.contains_key(&self.thread_id) {
            return Err(Error::new(ErrorKind::ThreadIdInUse)
                .with_context(format!("id {}", self.thread_id)));
        }
        table.insert(self.thread_id, Arc::clone(&inner));
        drop(table);

        Ok(EventThread { inner })
    }
}

/// A managed event-loop thread.
pub struct EventThread {
    inner: Arc<EventThreadInner>,
}

impl EventThread {
    /// Spawns the OS thread and enters the loop with `user_ctx` bound.
    pub fn start(&self, user_ctx: Option<UserCtx>) -> Result<()> {
        let mut join = self.inner.join.lock();
        if join.is_some() {
            return Err(Error::new(ErrorKind::AlreadyStarted)
                .with_context(self.inner.base.name().to_string()));
        }
        *self.inner.user_ctx.lock() = user_ctx;
        self.inner.base.set_running(true);
        let me = Arc::clone(&self.inner);
        let handle = self.inner.base.spawn(move || me.run())?;
        *join = Some(handle);
        Ok(())
    }

    /// Requests the loop to stop and wakes it. Callable from any thread; a
    /// suspended thread is resumed so it can observe the stop.
    pub fn stop(&self) -> Result<()> {
        {
            let mut stop = self.inner.stop.lock();
            *stop = true;
        }
        self.inner.base.set_running(false);
        if self.inner.base.suspended() {
            self.inner.base.resume_req();
        } else {
            self.inner.poller.notify().map_err(Error::io)?;
        }
        Ok(())
    }

    /// Requests a suspension and wakes the loop so it parks promptly.
    pub fn suspend_req(&self, hook: impl FnOnce() + Send + 'static) -> Result<()> {
        self.inner.base.suspend_req(hook)?;
        self.inner.poller.notify().map_err(Error::io)?;
        Ok(())
    }

    /// Resumes a suspended thread.
    pub fn resume_req(&self) {
        self.inner.base.resume_req();
    }

    /// Waits for the OS thread to exit and removes the table entry.
    pub fn join(&self) -> Result<()> {
        let handle = self
            .inner
            .join
            .lock()
            .take()
            .ok_or_else(|| Error::new(ErrorKind::NotStarted))?;
        handle
            .join()
            .map_err(|_| Error::new(ErrorKind::Internal).with_context("loop thread panicked"))?;
        THREAD_TABLE.lock().remove(&self.inner.base.id());
        Ok(())
    }

    /// Thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.base.name()
    }

    /// Thread id.
    #[must_use]
    pub fn thread_id(&self) -> u32 {
        self.inner.base.id()
    }

    /// True once the loop thread finished initialization.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.inner.base.ready()
    }

    /// True while the thread is parked in a suspension.
    #[must_use]
    pub fn suspended(&self) -> bool {
        self.inner.base.suspended()
    }
}

impl std::fmt::Debug for EventThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventThread")
            .field("name", &self.inner.base.name())
            .field("id", &self.inner.base.id())
            .field("ready", &self.inner.base.ready())
            .finish_non_exhaustive()
    }
}

/// Sends an opaque payload to thread `thread_id`'s message callback.
///
/// Callable from any thread; never blocks on the consumer. Messages from
/// one producer are delivered in send order.
pub fn message_send(thread_id: u32, payload: Payload) -> Result<()> {
    if thread_id > MAX_THREAD_ID {
        return Err(Error::new(ErrorKind::ThreadIdOutOfRange)
            .with_context(format!("id {thread_id}")));
    }
    let thread = table_get(thread_id)
        .ok_or_else(|| Error::new(ErrorKind::ThreadNotFound).with_context(format!("id {thread_id}")))?;
    thread.enqueue_user(payload);
    Ok(())
}

/// Subscribes the calling event thread to `target`'s UP transitions.
///
/// Must run on the subscriber's own loop thread. If the target is already
/// up, the callback fires once immediately (through the inbox). Each target
/// may be subscribed at most once per thread.
pub fn updown_up_subscribe(target: u32, cb: impl Fn(u32) + Send + Sync + 'static) {
    assert!(target <= MAX_THREAD_ID);
    with_current_thread(|inner| {
        let mut cbs = inner.updown_cbs.lock();
        assert!(
            !cbs.contains_key(&target),
            "thread {target} is already subscribed"
        );
        cbs.insert(target, Arc::new(cb));
        drop(cbs);
        registry().subscribe(inner.base.id(), target);
    });
}

/// Builds the watcher hooks handed to the IPC transport. The hooks resolve
/// the owning loop through the thread-local, so the transport must call
/// them from this thread.
fn infra_hooks() -> Infra {
    Infra {
        fd_watch: Box::new(|fd, mut cb| {
            let io = Io::new(fd, Interest::READ, move |_io, fd, _revents| cb(fd));
            io_start(&io);
            FdWatch::new(io)
        }),
        fd_unwatch: Box::new(|watch| {
            io_stop(watch.io());
        }),
        timer_add: Box::new(|after, mut cb| {
            let timer = Timer::new(after, 0.0, move |_t| cb());
            timer_start(&timer);
            TimerWatch::new(timer)
        }),
        timer_del: Box::new(|watch| {
            timer_stop(watch.timer());
        }),
    }
}
