//! Event threads and their cooperative readiness loop.
//!
//! One [`EventThread`] owns one OS thread running one [`EvLoop`] iteration
//! at a time; all watcher manipulation happens on that thread. Cross-thread
//! input flows through the lock-free inbox ([`message_send`]) and the
//! process-wide up/down registry ([`updown_up_subscribe`]).
//!
//! # Lifecycle
//!
//! ```text
//! build → start → [init_fn, UP] → run ⇄ suspend → stop → [exit_fn, DOWN]
//! ```
//!
//! # Watchers
//!
//! - [`Io`]: fd readiness, [`io_start`]/[`io_stop`]
//! - [`Timer`]: monotonic loop timers, [`timer_start`]/[`timer_stop`]/
//!   [`timer_again`]/[`timer_set`]
//! - [`Prepare`]: pre-poll hooks, [`prepare_start`]/[`prepare_stop`]

mod eloop;
mod inbox;
mod thread;
mod updown;

pub use eloop::{
    io_start, io_stop, prepare_start, prepare_stop, timer_again, timer_set, timer_start,
    timer_stop, timestamp_now, EvLoop, Interest, Io, Prepare, Timer, MAX_CALLBACK_DURATION,
};
pub use inbox::{Payload, UpDownStatus};
pub use thread::{
    message_send, updown_up_subscribe, EventThread, EventThreadBuilder, LoopExitFn, LoopInitFn,
    MessageCb, UpDownCb, UserCtx, MAX_THREAD_ID,
};
