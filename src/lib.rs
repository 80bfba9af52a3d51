//! Evwheel: the timing and event-dispatch core of a NIC SDK runtime.
//!
//! # Overview
//!
//! Evwheel provides the two cooperating primitives every other subsystem of
//! the SDK builds on:
//!
//! - A hashed **timer wheel** ([`twheel`]) that schedules large numbers of
//!   one-shot and periodic callbacks at a fixed, coarse granularity,
//!   independent of how many timers are outstanding.
//! - An **event thread** ([`event`]) that multiplexes fd readiness, monotonic
//!   timers, and inter-thread message delivery, and that participates in a
//!   process-wide thread up/down notification fabric.
//!
//! A dedicated **periodic driver** ([`periodic`]) converts kernel timer-fd
//! ticks into wheel advances for the process-global wheel.
//!
//! # Core Guarantees
//!
//! - **Stale handles are safe**: timer handles carry a generation; any
//!   operation on a handle whose slot has been reclaimed is a no-op.
//! - **Delay-delete epoch**: a deleted timer entry stays addressable for
//!   ~2 seconds before its memory returns to the slab, so deletion never
//!   races an in-flight firing.
//! - **Per-slice locking**: wheel mutations serialize only through the lock
//!   of the slice that owns the entry; callbacks run with the lock released.
//! - **Lock-free inboxes**: cross-thread messages never block the producer,
//!   and per-producer ordering is preserved.
//!
//! # Module Structure
//!
//! - [`slab`]: fixed-size object pool feeding the wheel's entries
//! - [`twheel`]: the hashed timer wheel
//! - [`periodic`]: timer-fd driver thread and the process-wide timer API
//! - [`event`]: event loop, event threads, inbox, up/down registry
//! - [`thread`]: thread base (flags, heartbeat, suspend/resume, spawn)
//! - [`ipc`]: infrastructure hooks handed to the IPC transport
//! - [`error`]: error types
//! - [`test_utils`]: tracing-based test helpers

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]

pub mod error;
pub mod event;
pub mod ipc;
pub mod periodic;
pub mod slab;
pub mod test_utils;
pub mod thread;
pub mod twheel;

pub use error::{Error, ErrorKind, Result};
pub use slab::{Slab, SlabConfigError, SlabHandle};
pub use twheel::{
    TimerCallback, TimerCtx, TimerHandle, TimerWheel, TimerWheelConfigError,
    DEFAULT_SLICE_INTERVAL_MS, DEFAULT_WHEEL_DURATION_MS, DELAY_DELETE_MS,
};
