// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounded spin loop support.

use std::time::Duration;
use thiserror::Error;

/// A source of blocking delays.
///
/// Polling loops sleep through this trait so that tests can run them without
/// waiting on the wall clock.
pub trait Sleep: Send + Sync {
    /// Blocks the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Sleeps on the calling thread.
#[derive(Debug, Default, Copy, Clone)]
pub struct ThreadSleep;

impl Sleep for ThreadSleep {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// The retry budget of a [`Backoff`] ran out.
#[derive(Debug, Error)]
#[error("retry budget of {budget} exhausted")]
pub struct BudgetExhausted {
    /// The number of retries the loop was allowed.
    pub budget: u32,
}

/// An object to pace a spin loop that waits on a device.
///
/// This is useful when waiting for some condition (such as a device register
/// changing states) that can only be polled and does not have an
/// interrupt-based notification. The loop checks its condition, then calls
/// [`Backoff::back_off`], which sleeps for one interval. After `budget + 1`
/// sleeps the next call fails instead of sleeping.
pub struct Backoff<'a> {
    remaining: i64,
    budget: u32,
    interval: Duration,
    sleep: &'a dyn Sleep,
}

impl<'a> Backoff<'a> {
    /// Returns a new backoff object, usable for the lifetime of one spin loop.
    pub fn new(sleep: &'a dyn Sleep, interval: Duration, budget: u32) -> Self {
        Self {
            remaining: budget.into(),
            budget,
            interval,
            sleep,
        }
    }

    /// Sleeps for one interval, or fails if the budget is exhausted.
    pub fn back_off(&mut self) -> Result<(), BudgetExhausted> {
        if self.remaining < 0 {
            return Err(BudgetExhausted {
                budget: self.budget,
            });
        }
        self.sleep.sleep(self.interval);
        self.remaining -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::InstantSleep;
    use test_log::test;

    #[test]
    fn budget_allows_one_extra_sleep() {
        let sleep = InstantSleep::new();
        let mut backoff = Backoff::new(&sleep, Duration::from_millis(500), 1);
        backoff.back_off().unwrap();
        backoff.back_off().unwrap();
        let err = backoff.back_off().unwrap_err();
        assert_eq!(err.budget, 1);
        assert_eq!(sleep.count(), 2);
        assert_eq!(sleep.total(), Duration::from_secs(1));
    }

    #[test]
    fn zero_budget() {
        let sleep = InstantSleep::new();
        let mut backoff = Backoff::new(&sleep, Duration::from_millis(10), 0);
        backoff.back_off().unwrap();
        assert!(backoff.back_off().is_err());
        assert_eq!(sleep.count(), 1);
    }
}
