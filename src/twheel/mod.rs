//! Hashed timer wheel with coarse slices and delay-delete reclamation.
//!
//! The wheel covers a fixed duration `D` with `N = D/g` slices of width `g`
//! milliseconds. Timers longer than `D` carry a spin counter and ride the
//! ring multiple times. Deleted entries are parked in a slice ~2 seconds
//! ahead instead of being freed immediately, which keeps their memory
//! addressable across any firing that was already in flight.
//!
//! Driving the wheel is the caller's job: call [`TimerWheel::tick`] with the
//! elapsed milliseconds, ideally once per slice interval. The periodic
//! driver ([`crate::periodic`]) does this for the process-global wheel.

mod wheel;

pub use wheel::{
    TimerCallback, TimerCtx, TimerHandle, TimerWheel, TimerWheelConfigError,
    DEFAULT_SLICE_INTERVAL_MS, DEFAULT_WHEEL_DURATION_MS, DELAY_DELETE_MS,
};
