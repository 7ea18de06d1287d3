//! Monotonic clock helpers
//!
//! All timestamps in the crate are `CLOCK_MONOTONIC` nanoseconds stored as
//! `i64`, the same domain the kernel uses for fence signal times.

pub const NSEC_PER_MSEC: i64 = 1_000_000;
pub const NSEC_PER_SEC: i64 = 1_000_000_000;

/// Current monotonic time in nanoseconds
pub fn monotonic_now() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out pointer and CLOCK_MONOTONIC always exists
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as i64 * NSEC_PER_SEC + ts.tv_nsec as i64
}

/// Sleep until an absolute monotonic deadline, resuming after signals
pub fn sleep_until(deadline_ns: i64) {
    let ts = libc::timespec {
        tv_sec: (deadline_ns / NSEC_PER_SEC) as libc::time_t,
        tv_nsec: (deadline_ns % NSEC_PER_SEC) as libc::c_long,
    };
    loop {
        // SAFETY: ts outlives the call; remain may be null with TIMER_ABSTIME
        let err = unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                &ts,
                std::ptr::null_mut(),
            )
        };
        if err != libc::EINTR {
            break;
        }
    }
}

pub fn ns_to_ms(ns: i64) -> i64 {
    ns / NSEC_PER_MSEC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_advances() {
        let a = monotonic_now();
        let b = monotonic_now();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn test_sleep_until_reaches_deadline() {
        let deadline = monotonic_now() + 2 * NSEC_PER_MSEC;
        sleep_until(deadline);
        assert!(monotonic_now() >= deadline);
    }

    #[test]
    fn test_sleep_until_past_deadline_returns() {
        let start = monotonic_now();
        sleep_until(start - NSEC_PER_SEC);
        assert!(monotonic_now() - start < NSEC_PER_SEC);
    }
}
