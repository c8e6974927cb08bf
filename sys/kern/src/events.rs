// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event groups: a 32-bit flag word tasks can wait on, for any-of or
//! all-of a mask.
//!
//! Posting bits evaluates every waiter against the flag word *after* the
//! post but *before* any clearing, so two tasks satisfied by the same bit
//! both wake, and both observe the same value. Clear-on-exit masks from
//! satisfied waiters accumulate during the pass and are applied once at the
//! end.

use abi::{ObjectId, SchedState, TaskState};

use crate::task::{ArchState, NextTask, Task};

#[derive(Debug)]
pub struct EventGroup {
    bits: u32,
}

impl EventGroup {
    pub fn new() -> Self {
        Self { bits: 0 }
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Clears `mask` out of the flag word, returning the value from before
    /// the clear.
    pub fn clear_bits(&mut self, mask: u32) -> u32 {
        let prior = self.bits;
        self.bits &= !mask;
        prior
    }
}

/// Whether a waiter with the given `mask`/`wait_all` combination is
/// satisfied by flag word `bits`.
pub fn satisfied(bits: u32, mask: u32, wait_all: bool) -> bool {
    if wait_all {
        bits & mask == mask
    } else {
        bits & mask != 0
    }
}

/// ORs `bits` into the group at `oid` and wakes every waiter the result
/// satisfies. Each woken task receives the flag word as it stood after the
/// post, then the accumulated clear-on-exit masks are applied.
pub fn set_bits(
    eg: &mut EventGroup,
    oid: ObjectId,
    bits: u32,
    tasks: &mut [Task],
) -> NextTask {
    eg.bits |= bits;
    let visible = eg.bits;

    let mut clears = 0;
    let mut sched_hint = NextTask::Same;
    for task in tasks.iter_mut() {
        let TaskState::Healthy(SchedState::InEventWait {
            object,
            mask,
            wait_all,
            clear_on_exit,
        }) = *task.state()
        else {
            continue;
        };
        if object != oid || !satisfied(visible, mask, wait_all) {
            continue;
        }

        task.save_mut().set_success_response(u64::from(visible));
        task.make_runnable();
        if clear_on_exit {
            clears |= mask;
        }
        sched_hint = sched_hint.combine(NextTask::Other);
    }

    eg.bits &= !clears;
    sched_hint
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::Priority;

    fn waiter(
        oid: ObjectId,
        mask: u32,
        wait_all: bool,
        clear_on_exit: bool,
        seq: u64,
    ) -> Task {
        let mut t = Task::VACANT;
        t.set_base_priority(Priority(4));
        t.set_effective_priority(Priority(4));
        t.block(
            seq,
            SchedState::InEventWait {
                object: oid,
                mask,
                wait_all,
                clear_on_exit,
            },
            None,
        );
        t
    }

    #[test]
    fn any_wakes_on_partial_mask_but_all_waits_for_the_rest() {
        let oid = ObjectId(0);
        let mut eg = EventGroup::new();
        let mut tasks = [
            waiter(oid, 0b11, true, false, 1),
            waiter(oid, 0b10, false, false, 2),
        ];

        assert_eq!(set_bits(&mut eg, oid, 0b10, &mut tasks), NextTask::Other);
        assert!(!tasks[0].is_runnable());
        assert!(tasks[1].is_runnable());

        assert_eq!(set_bits(&mut eg, oid, 0b01, &mut tasks), NextTask::Other);
        assert!(tasks[0].is_runnable());
        assert_eq!(tasks[0].save().ret1_value(), 0b11);
    }

    #[test]
    fn all_satisfied_waiters_wake_before_any_clearing() {
        let oid = ObjectId(0);
        let mut eg = EventGroup::new();
        let mut tasks = [
            waiter(oid, 0b01, false, true, 1),
            waiter(oid, 0b01, false, false, 2),
        ];

        let _ = set_bits(&mut eg, oid, 0b01, &mut tasks);
        // Both observe the pre-clear value, even though the first waiter
        // asked for the bit to be cleared.
        assert!(tasks[0].is_runnable());
        assert!(tasks[1].is_runnable());
        assert_eq!(tasks[0].save().ret1_value(), 0b01);
        assert_eq!(tasks[1].save().ret1_value(), 0b01);
        assert_eq!(eg.bits(), 0);
    }

    #[test]
    fn posts_to_other_groups_leave_waiters_alone() {
        let oid = ObjectId(0);
        let other = ObjectId(1);
        let mut eg = EventGroup::new();
        let mut tasks = [waiter(oid, 0b1, false, false, 1)];

        assert_eq!(set_bits(&mut eg, other, 0b1, &mut tasks), NextTask::Same);
        assert!(!tasks[0].is_runnable());
    }

    #[test]
    fn clearing_reports_the_prior_value() {
        let mut eg = EventGroup::new();
        let mut no_tasks: [Task; 0] = [];
        let _ = set_bits(&mut eg, ObjectId(0), 0b1010, &mut no_tasks);
        assert_eq!(eg.clear_bits(0b0010), 0b1010);
        assert_eq!(eg.bits(), 0b1000);
    }
}
