//! Relative timeout and absolute deadline selectable events.
//!
//! Both just emit an expiration time point through `IoDescriptor` and
//! report `fulfilled` unconditionally once the selector calls `fulfill`.

use std::time::{Duration, Instant};

use crate::descriptor::IoDescriptor;
use crate::error::Error;
use crate::event::SelectEvent;
use crate::time::now;

/// An event that becomes fulfillable `duration` after it's handed to
/// `select` (the deadline is computed once, at `file()` time, not at
/// construction).
pub struct TimeoutEvent {
    duration: Duration,
}

/// Build a timeout event for `duration`.
pub fn timeout(duration: Duration) -> TimeoutEvent {
    TimeoutEvent { duration }
}

impl SelectEvent for TimeoutEvent {
    fn file(&mut self) -> Result<IoDescriptor, Error> {
        Ok(IoDescriptor::idle().with_expiration(now() + self.duration))
    }

    fn fulfill(&mut self, _descriptor: &IoDescriptor) -> Result<IoDescriptor, Error> {
        Ok(IoDescriptor::already_fulfilled())
    }

    fn cancel(&mut self, _descriptor: &IoDescriptor) -> Result<(), Error> {
        Ok(())
    }
}

/// An event that becomes fulfillable at a fixed absolute moment. A
/// `when` already in the past behaves like `timeout(Duration::ZERO)`: it
/// expires immediately.
pub struct DeadlineEvent {
    when: Instant,
}

/// Build a deadline event for the absolute moment `when`.
pub fn deadline(when: Instant) -> DeadlineEvent {
    DeadlineEvent { when }
}

impl SelectEvent for DeadlineEvent {
    fn file(&mut self) -> Result<IoDescriptor, Error> {
        Ok(IoDescriptor::idle().with_expiration(self.when))
    }

    fn fulfill(&mut self, _descriptor: &IoDescriptor) -> Result<IoDescriptor, Error> {
        Ok(IoDescriptor::already_fulfilled())
    }

    fn cancel(&mut self, _descriptor: &IoDescriptor) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{select, select_array};
    use std::collections::HashMap;

    #[test]
    fn timeout_of_zero_fulfills_immediately() {
        let events: Vec<Box<dyn SelectEvent>> = vec![Box::new(timeout(Duration::from_millis(0)))];
        assert_eq!(select(events).unwrap(), 0);
    }

    #[test]
    fn deadline_in_the_past_fulfills_immediately() {
        let past = now() - Duration::from_secs(1);
        let events: Vec<Box<dyn SelectEvent>> = vec![Box::new(deadline(past))];
        assert_eq!(select(events).unwrap(), 0);
    }

    #[test]
    fn two_identical_deadlines_are_roughly_equiprobable() {
        let mut counts: HashMap<usize, u32> = HashMap::new();
        let trials = 200;

        for _ in 0..trials {
            let t = now();
            let events: [Box<dyn SelectEvent>; 2] = [Box::new(deadline(t)), Box::new(deadline(t))];
            let winner = select_array(events).unwrap();
            *counts.entry(winner).or_insert(0) += 1;
        }

        let zero = *counts.get(&0).unwrap_or(&0) as f64;
        let fraction = zero / trials as f64;
        assert!((fraction - 0.5).abs() < 0.25, "fraction was {fraction}");
    }
}
