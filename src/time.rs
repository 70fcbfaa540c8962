//! Monotonic high-resolution time.
//!
//! The counter is anchored to a process-global epoch taken on first use, so
//! values are only meaningful relative to each other. The resolution is
//! probed from the operating system once; a resolution of zero means the
//! clock could not be trusted and time-budgeted task processing degrades to
//! single-task steps.

use std::sync::OnceLock;
use std::time::Instant;

pub(crate) const NANOS_PER_SEC: u64 = 1_000_000_000;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Nanoseconds elapsed on the monotonic clock since the process epoch.
pub fn counter() -> u64 {
    let elapsed = epoch().elapsed();
    elapsed
        .as_secs()
        .saturating_mul(NANOS_PER_SEC)
        .saturating_add(u64::from(elapsed.subsec_nanos()))
}

/// Resolution of the monotonic clock in nanoseconds.
pub fn resolution() -> u64 {
    static RESOLUTION: OnceLock<u64> = OnceLock::new();
    *RESOLUTION.get_or_init(probe_resolution)
}

#[cfg(unix)]
fn probe_resolution() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    match syscall!(clock_getres(libc::CLOCK_MONOTONIC, &mut ts)) {
        Ok(_) => (ts.tv_sec as u64).saturating_mul(NANOS_PER_SEC) + ts.tv_nsec as u64,
        Err(err) => {
            log::warn!("could not determine clock resolution: {}", err);
            0
        }
    }
}

#[cfg(windows)]
fn probe_resolution() -> u64 {
    use windows_sys::Win32::System::Performance::QueryPerformanceFrequency;

    let mut freq = 0i64;
    // The counter itself comes from `Instant`; the frequency only bounds
    // how finely time budgets can be sliced.
    if unsafe { QueryPerformanceFrequency(&mut freq) } == 0 || freq <= 0 {
        log::warn!("could not determine performance counter frequency");
        return 0;
    }
    (NANOS_PER_SEC / freq as u64).max(1)
}

#[cfg(not(any(unix, windows)))]
fn probe_resolution() -> u64 {
    1
}

#[cfg(test)]
mod tests {
    use super::{counter, resolution};

    #[test]
    fn counter_is_monotonic() {
        let a = counter();
        let b = counter();
        assert!(b >= a);
    }

    #[test]
    fn resolution_is_probed_once() {
        assert_eq!(resolution(), resolution());
    }
}
