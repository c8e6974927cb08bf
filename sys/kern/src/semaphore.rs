// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphores. A binary semaphore is just the `max == 1` case.
//!
//! Gives hand off to a waiter directly instead of bumping the count and
//! letting the waiter decrement it later; the count is therefore nonzero
//! only while nobody is waiting, and a give can never be double-counted
//! against a single wake.

use abi::ObjectId;

use crate::task::{ArchState, Task};

#[derive(Debug)]
pub struct Semaphore {
    count: u32,
    max: u32,
}

/// What a [`give`] did.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Give {
    /// The count went straight to the most important waiter, which is now
    /// runnable.
    Transferred,
    /// Nobody was waiting; the counter grew.
    Counted,
    /// The counter was already at its maximum. Nothing changed; callers
    /// surface this as a would-block code.
    Full,
}

impl Semaphore {
    pub fn new(max: u32, initial: u32) -> Self {
        uassert!(max >= 1);
        uassert!(initial <= max);
        Self {
            count: initial,
            max,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Takes one count if any is available. Returns `false` when the caller
    /// would have to wait.
    pub fn try_take(&mut self) -> bool {
        if self.count > 0 {
            self.count -= 1;
            true
        } else {
            false
        }
    }
}

/// Releases one count of the semaphore at `oid`.
///
/// If a task is blocked taking it, the count goes straight to the most
/// important waiter (ties in arrival order) and never becomes observable in
/// the counter. Otherwise the counter grows; a counter already at its
/// maximum refuses the give, so counts are never silently dropped.
pub fn give(
    sem: &mut Semaphore,
    oid: ObjectId,
    tasks: &mut [Task],
) -> Give {
    if let Some(wi) = kerncore::select_waiter(
        tasks,
        |t| t.state().is_awaiting_semaphore(oid),
        |t| t.wait_seq(),
    ) {
        tasks[wi].save_mut().set_success_response(0);
        tasks[wi].make_runnable();
        return Give::Transferred;
    }

    if sem.count < sem.max {
        sem.count += 1;
        Give::Counted
    } else {
        Give::Full
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::{Priority, SchedState};

    fn waiter(oid: ObjectId, priority: u8, seq: u64) -> Task {
        let mut t = Task::VACANT;
        t.set_base_priority(Priority(priority));
        t.set_effective_priority(Priority(priority));
        t.block(seq, SchedState::InSemTake(oid), None);
        t
    }

    #[test]
    fn counts_cap_at_max() {
        let mut sem = Semaphore::new(1, 0);
        let mut tasks: [Task; 0] = [];
        let oid = ObjectId(0);

        assert_eq!(give(&mut sem, oid, &mut tasks), Give::Counted);
        assert_eq!(give(&mut sem, oid, &mut tasks), Give::Full);
        assert_eq!(sem.count(), 1);

        assert!(sem.try_take());
        assert!(!sem.try_take());
    }

    #[test]
    fn gives_hand_off_to_the_best_waiter() {
        let oid = ObjectId(0);
        let mut sem = Semaphore::new(4, 0);
        let mut tasks = [waiter(oid, 5, 1), waiter(oid, 2, 2)];

        let outcome = give(&mut sem, oid, &mut tasks);
        assert_eq!(outcome, Give::Transferred);
        // Count handed straight to the more important waiter.
        assert_eq!(sem.count(), 0);
        assert!(tasks[1].is_runnable());
        assert!(!tasks[0].is_runnable());
    }

    #[test]
    fn equal_priorities_release_in_arrival_order() {
        let oid = ObjectId(0);
        let mut sem = Semaphore::new(4, 0);
        let mut tasks = [waiter(oid, 3, 9), waiter(oid, 3, 4)];

        let _ = give(&mut sem, oid, &mut tasks);
        assert!(tasks[1].is_runnable());
        assert!(!tasks[0].is_runnable());
    }
}
