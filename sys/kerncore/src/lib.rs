// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduling decision logic, in a form that can be compiled and tested on
//! any machine.
//!
//! The kernel proper wraps these routines around its task table; keeping them
//! here, free of hardware and kernel-state dependencies, means the trickiest
//! parts of scheduling (fairness, importance ordering, hint combination,
//! waiter release order) get exhaustive host-side tests.

// Allow std-y things to be used in test. Note that this attribute is a bit of a
// trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]
#![forbid(clippy::wildcard_imports)]

/// Describes types that carry a scheduling priority.
///
/// Priority values are small integers where numerically lower values are more
/// important. The kernel's task control block implements this; tests use toy
/// types.
pub trait Prioritized {
    /// This item's priority value. Lower is more important.
    fn priority_value(&self) -> u8;
}

/// Checks whether priority value `a` beats priority value `b`.
///
/// Spelled out as a function so call sites read as a question rather than a
/// bare `<` whose direction the reader has to remember.
#[inline(always)]
pub fn more_important(a: u8, b: u8) -> bool {
    a < b
}

/// Scheduling consequence of an operation, indicating whether a context
/// switch is required.
///
/// Every operation that can wake or block a task produces one of these, and
/// callers must do something with it (hence `must_use`): either act on it or
/// fold it into a larger decision with `combine`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextTask {
    /// It's fine to keep running whatever task we were just running.
    Same,
    /// We need to switch tasks, but this routine has not concluded which one
    /// should now run. The scheduler needs to figure it out.
    Other,
    /// We need to switch tasks, and we already know which one should run next.
    /// This is an optimization available when an operation wakes exactly one
    /// more important task.
    Specific(usize),
}

impl NextTask {
    pub fn combine(self, other: Self) -> Self {
        use NextTask::*; // shorthand for patterns

        match (self, other) {
            // If both agree, our job is easy.
            (x, y) if x == y => x,
            // Specific task recommendations that *don't* agree get downgraded
            // to Other.
            (Specific(_), Specific(_)) => Other,
            // If only *one* is specific, it wins.
            (Specific(x), _) | (_, Specific(x)) => Specific(x),
            // Otherwise, if either suggestion says switch, switch.
            (Other, _) | (_, Other) => Other,
            // All we have left is...
            (Same, Same) => Same,
        }
    }
}

/// Scans a table to find a prioritized candidate.
///
/// Scans `items` for the next entry, after `previous`, that satisfies `pred`.
/// If more than one entry satisfies `pred`, returns the most important one.
/// If multiple entries with the same priority satisfy `pred`, prefers the
/// first one in order after `previous`, mod `items.len()`. Finally, if no
/// entries satisfy `pred`, returns `None`.
///
/// Whew.
///
/// This is generally the right way to search the task table: starting the
/// scan just past the outgoing task is what makes equal-priority scheduling
/// round-robin, while the importance comparison keeps it strict-priority.
///
/// On success, the return value is the entry's index in the table, and a
/// direct reference to the entry.
pub fn priority_scan<T: Prioritized>(
    previous: usize,
    items: &[T],
    pred: impl Fn(&T) -> bool,
) -> Option<(usize, &T)> {
    let mut pos = previous;
    let mut choice: Option<(usize, &T)> = None;
    for _step_no in 0..items.len() {
        pos = pos.wrapping_add(1);
        if pos >= items.len() {
            pos = 0;
        }
        let t = &items[pos];
        if !pred(t) {
            continue;
        }

        if let Some((_, best)) = choice {
            if !more_important(t.priority_value(), best.priority_value()) {
                continue;
            }
        }

        choice = Some((pos, t));
    }

    choice
}

/// Chooses which blocked waiter an object should release.
///
/// `pred` marks the entries that are waiting on the object in question;
/// `stamp` gives each waiter's arrival order (a monotonically increasing
/// value assigned when the wait began). The released waiter is the most
/// important one, and among equally important waiters, the one that has been
/// waiting longest. That is: priority-ordered across priority levels, FIFO
/// within one.
pub fn select_waiter<T: Prioritized>(
    items: &[T],
    pred: impl Fn(&T) -> bool,
    stamp: impl Fn(&T) -> u64,
) -> Option<usize> {
    let mut choice: Option<(usize, u8, u64)> = None;
    for (index, t) in items.iter().enumerate() {
        if !pred(t) {
            continue;
        }
        let (prio, arrived) = (t.priority_value(), stamp(t));
        let better = match choice {
            None => true,
            Some((_, best_prio, best_arrived)) => {
                more_important(prio, best_prio)
                    || (prio == best_prio && arrived < best_arrived)
            }
        };
        if better {
            choice = Some((index, prio, arrived));
        }
    }
    choice.map(|(index, _, _)| index)
}
