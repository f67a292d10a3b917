//! Monotonic-clock helpers: a single "now" reading shared across a `select`
//! call, and conversion to the millisecond timeouts `libc::poll` expects.

use std::time::{Duration, Instant};

/// A point in time on the process's monotonic clock, used for both
/// `TimeoutEvent` (relative, converted to an absolute deadline at
/// construction) and `DeadlineEvent` (already absolute).
pub type Moment = Instant;

/// The current moment, per the monotonic clock.
pub fn now() -> Moment {
    Instant::now()
}

/// Convert a deadline relative to `now` into the millisecond timeout
/// `libc::poll` expects, clamping to `libc::c_int::MAX` and rounding a
/// sub-millisecond remainder up rather than down so a timeout never fires
/// early.
pub fn millis_until(deadline: Moment, now: Moment) -> libc::c_int {
    if deadline <= now {
        return 0;
    }

    let remaining = deadline - now;
    duration_to_millis(remaining)
}

fn duration_to_millis(duration: Duration) -> libc::c_int {
    let millis = duration.as_millis();
    let rounded_up = if duration.subsec_nanos() % 1_000_000 != 0 {
        millis + 1
    } else {
        millis
    };

    if rounded_up > libc::c_int::MAX as u128 {
        libc::c_int::MAX
    } else {
        rounded_up as libc::c_int
    }
}

/// The smallest of several millisecond timeouts, where `-1` (poll's "block
/// forever") loses to any finite value.
pub(crate) fn min_poll_timeout(timeouts: impl Iterator<Item = libc::c_int>) -> libc::c_int {
    timeouts.fold(-1, |acc, t| {
        if acc < 0 {
            t
        } else if t < 0 {
            acc
        } else {
            acc.min(t)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_deadline_has_zero_timeout() {
        let now = Instant::now();
        let past = now - Duration::from_millis(5);
        assert_eq!(millis_until(past, now), 0);
    }

    #[test]
    fn sub_millisecond_remainder_rounds_up() {
        let now = Instant::now();
        let deadline = now + Duration::from_micros(1500);
        assert_eq!(millis_until(deadline, now), 2);
    }

    #[test]
    fn min_poll_timeout_prefers_finite_over_block_forever() {
        assert_eq!(min_poll_timeout([-1, 50, -1].into_iter()), 50);
        assert_eq!(min_poll_timeout([-1, -1].into_iter()), -1);
        assert_eq!(min_poll_timeout([30, 10, 20].into_iter()), 10);
    }
}
