//! Time and call budget helpers shared by the host controller.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Return the remaining time until `deadline`, or `None` once it has passed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return None;
    }
    Some(remaining)
}

/// Rejected reservation against a [`CallBudget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sub-query budget exceeded: {current} + {requested} > {ceiling}")]
pub struct BudgetExceeded {
    pub current: usize,
    pub requested: usize,
    pub ceiling: usize,
}

/// Session-wide ceiling on reasoning backend calls.
///
/// The counter only moves through [`CallBudget::check_and_increment`], which
/// checks and reserves under a single lock. A rejected reservation never
/// changes the counter.
#[derive(Debug)]
pub struct CallBudget {
    ceiling: usize,
    used: Mutex<usize>,
}

impl CallBudget {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            used: Mutex::new(0),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn used(&self) -> usize {
        *self.used.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `requested` calls; returns the new total.
    pub fn check_and_increment(&self, requested: usize) -> Result<usize, BudgetExceeded> {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        let next = used.saturating_add(requested);
        if next > self.ceiling {
            return Err(BudgetExceeded {
                current: *used,
                requested,
                ceiling: self.ceiling,
            });
        }
        *used = next;
        Ok(next)
    }

    /// Start a fresh session budget.
    pub fn reset(&self) {
        *self.used.lock().unwrap_or_else(PoisonError::into_inner) = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn remaining_budget_is_none_after_deadline() {
        assert!(remaining_budget(Instant::now()).is_none());
        let later = Instant::now() + Duration::from_secs(60);
        assert!(remaining_budget(later).expect("remaining") > Duration::from_secs(50));
    }

    #[test]
    fn rejected_reservation_leaves_counter_untouched() {
        let budget = CallBudget::new(10);
        budget.check_and_increment(4).expect("first reservation");

        let err = budget
            .check_and_increment(10 - 4 + 1)
            .expect_err("second reservation must fail");
        assert_eq!(
            err,
            BudgetExceeded {
                current: 4,
                requested: 7,
                ceiling: 10
            }
        );
        assert_eq!(err.to_string(), "sub-query budget exceeded: 4 + 7 > 10");
        assert_eq!(budget.used(), 4);
    }

    #[test]
    fn reservation_up_to_ceiling_succeeds() {
        let budget = CallBudget::new(3);
        assert_eq!(budget.check_and_increment(3).expect("fits"), 3);
        assert!(budget.check_and_increment(1).is_err());
        budget.reset();
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn concurrent_reservations_never_overshoot() {
        let budget = Arc::new(CallBudget::new(50));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let budget = Arc::clone(&budget);
                thread::spawn(move || {
                    (0..20)
                        .filter(|_| budget.check_and_increment(1).is_ok())
                        .count()
                })
            })
            .collect();
        let granted: usize = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .sum();
        assert_eq!(granted, 50);
        assert_eq!(budget.used(), 50);
    }
}
