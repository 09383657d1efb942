//! Monotonic timing for the sampler loop and per-thread CPU clocks.

#![allow(unsafe_code)]

use crate::domain::Microseconds;

/// Current monotonic time in microseconds.
///
/// Uses `CLOCK_BOOTTIME` so time spent suspended still advances the wall
/// metric, matching what a wall-clock profile should attribute.
#[must_use]
pub fn monotonic_us() -> Microseconds {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: ts is a valid, writable timespec.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_BOOTTIME, &mut ts) };
    if rc != 0 {
        return 0;
    }
    ts_to_us(&ts)
}

/// CPU clock id of the given pthread, if the kernel exposes one.
#[must_use]
pub fn thread_cpu_clock(thread: libc::pthread_t) -> Option<libc::clockid_t> {
    let mut clock: libc::clockid_t = 0;
    // SAFETY: clock is a valid out-pointer; an invalid thread handle makes
    // pthread_getcpuclockid return an error rather than fault.
    let rc = unsafe { libc::pthread_getcpuclockid(thread, &mut clock) };
    (rc == 0).then_some(clock)
}

/// Read a CPU-time clock in microseconds.
#[must_use]
pub fn clock_us(clock: libc::clockid_t) -> Option<Microseconds> {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: ts is a valid, writable timespec.
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    (rc == 0).then(|| ts_to_us(&ts))
}

/// Yield the CPU between ticks of the busy-wait loop.
pub fn yield_now() {
    // SAFETY: sched_yield has no preconditions.
    unsafe {
        libc::sched_yield();
    }
}

fn ts_to_us(ts: &libc::timespec) -> Microseconds {
    #[allow(clippy::cast_sign_loss)]
    {
        (ts.tv_sec as u64) * 1_000_000 + (ts.tv_nsec as u64) / 1_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_advances() {
        let a = monotonic_us();
        let b = monotonic_us();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn test_own_thread_cpu_clock() {
        // SAFETY: pthread_self has no preconditions.
        let clock = thread_cpu_clock(unsafe { libc::pthread_self() });
        let clock = clock.expect("own thread must expose a CPU clock");
        // Burn a little CPU so the reading is non-trivially comparable.
        let before = clock_us(clock).unwrap();
        let mut acc = 0u64;
        for i in 0..100_000u64 {
            acc = acc.wrapping_add(i * i);
        }
        std::hint::black_box(acc);
        let after = clock_us(clock).unwrap();
        assert!(after >= before);
    }
}
