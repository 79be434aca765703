//! Time values derived from the Posix `clock_gettime` function.
//!
//! Functions returning seconds come back as `f64`; functions with names
//! followed by "64" return a 64-bit number of nanoseconds.
//!
//! - [`time()`] - wall clock time in seconds
//! - [`monotonic()`] - monotonic time in seconds
//! - [`monotonic64()`] - monotonic time in nanoseconds
//!
//! The scheduler and the timer layer keep all their deadlines on the
//! monotonic clock.

use std::mem::MaybeUninit;

#[inline]
fn gettime(clock: libc::clockid_t) -> libc::timespec {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    // CLOCK_MONOTONIC / CLOCK_REALTIME cannot fail with a valid pointer
    let rc = unsafe { libc::clock_gettime(clock, ts.as_mut_ptr()) };
    debug_assert_eq!(rc, 0);
    unsafe { ts.assume_init() }
}

/// The wall clock time in seconds, derived from `CLOCK_REALTIME`.
#[inline(always)]
pub fn time() -> f64 {
    let ts = gettime(libc::CLOCK_REALTIME);
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9
}

/// The monotonic time in seconds, derived from `CLOCK_MONOTONIC`.
///
/// Not affected by wall clock adjustments; the right clock for measuring
/// elapsed time and arming deadlines.
#[inline(always)]
pub fn monotonic() -> f64 {
    let ts = gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9
}

/// See: [`monotonic()`]
#[inline(always)]
pub fn monotonic64() -> u64 {
    let ts = gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_does_not_go_backwards() {
        let a = monotonic();
        let b = monotonic();
        assert!(b >= a);

        let a64 = monotonic64();
        let b64 = monotonic64();
        assert!(b64 >= a64);
    }
}
