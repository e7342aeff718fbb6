//! Process-memory daily quota bucket for platform B (spec.md §3, §4.6
//! "Quota discipline"). Never survives a restart — a restart gifts the
//! worker the full remaining-day budget, an accepted limitation per spec.md
//! §3.

use chrono::{NaiveDate, Utc};
use std::sync::Mutex;

struct Bucket {
    date: NaiveDate,
    used: u32,
}

pub struct QuotaBucket {
    ceiling: u32,
    inner: Mutex<Bucket>,
}

impl QuotaBucket {
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            inner: Mutex::new(Bucket {
                date: Utc::now().date_naive(),
                used: 0,
            }),
        }
    }

    /// Atomically checks whether `cost` units remain in today's budget and,
    /// if so, consumes them. Resets `used` to 0 the first time a new UTC
    /// date is observed (spec.md §8 scenario 6).
    pub fn check_and_consume(&self, cost: u32) -> bool {
        let mut b = self.inner.lock().expect("quota bucket mutex poisoned");
        Self::roll_to_today(&mut b);
        if b.used.saturating_add(cost) > self.ceiling {
            return false;
        }
        b.used += cost;
        true
    }

    /// Read-only variant of `check_and_consume`: true if `cost` units would
    /// currently fit, without spending them. Used for the `add_track`
    /// up-front quota gate (spec.md §4.6 step 1), which must not debit the
    /// bucket for an item that goes on to fail search resolution before
    /// ever reaching the actual mutating call (step 3's consumption).
    pub fn would_fit(&self, cost: u32) -> bool {
        let mut b = self.inner.lock().expect("quota bucket mutex poisoned");
        Self::roll_to_today(&mut b);
        b.used.saturating_add(cost) <= self.ceiling
    }

    fn roll_to_today(b: &mut Bucket) {
        let today = Utc::now().date_naive();
        if b.date != today {
            b.date = today;
            b.used = 0;
        }
    }

    pub fn used(&self) -> u32 {
        self.inner.lock().expect("quota bucket mutex poisoned").used
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    #[cfg(test)]
    fn set_state_for_test(&self, date: NaiveDate, used: u32) {
        let mut b = self.inner.lock().expect("quota bucket mutex poisoned");
        b.date = date;
        b.used = used;
    }
}
