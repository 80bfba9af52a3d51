//! Kernel monotonic periodic timer fd.
//!
//! Thin wrapper over Linux `timerfd_create(CLOCK_MONOTONIC)`: arm once with
//! a fixed period, then block on 8-byte reads that report how many periods
//! elapsed since the previous read. Interrupted reads surface as
//! `ErrorKind::Interrupted` for the caller to retry.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;
use tracing::trace;

/// A periodic monotonic timer fd.
pub struct TimerFd {
    file: File,
    period: Duration,
    missed_wakeups: u64,
}

impl TimerFd {
    /// Creates and arms a timer fd expiring every `period`.
    pub fn new(period: Duration) -> io::Result<Self> {
        // SAFETY: timerfd_create takes no pointers; the fd is owned below.
        let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by timerfd_create and is not shared.
        let file = unsafe { File::from_raw_fd(fd) };

        let spec = libc::timespec {
            tv_sec: period.as_secs() as libc::time_t,
            tv_nsec: period.subsec_nanos() as libc::c_long,
        };
        let itspec = libc::itimerspec {
            it_interval: spec,
            it_value: spec,
        };
        // SAFETY: the fd is valid and the itimerspec pointer outlives the call.
        let rc = unsafe { libc::timerfd_settime(file.as_raw_fd(), 0, &itspec, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            file,
            period,
            missed_wakeups: 0,
        })
    }

    /// Blocks until the next expiration and returns the number of periods
    /// elapsed since the last read (≥ 1, more after missed wakeups).
    pub fn wait(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        let n = self.file.read(&mut buf)?;
        if n != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short read on timer fd",
            ));
        }
        let missed = u64::from_ne_bytes(buf);
        if missed > 1 {
            trace!(missed, "periodic driver missed wakeups");
        }
        self.missed_wakeups += missed;
        Ok(missed)
    }

    /// The armed period.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Cumulative expirations observed across all reads.
    #[must_use]
    pub fn missed_wakeups(&self) -> u64 {
        self.missed_wakeups
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl std::fmt::Debug for TimerFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerFd")
            .field("fd", &self.file.as_raw_fd())
            .field("period", &self.period)
            .field("missed_wakeups", &self.missed_wakeups)
            .finish()
    }
}
