// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mutexes with optional priority inheritance.
//!
//! A mutex names its owner by task table index and supports recursive
//! acquisition by the owner. When an inheriting mutex is contended, the
//! owner's effective priority is raised to match the most important blocked
//! task; release recomputes the owner's priority from scratch (base plus the
//! waiters of every inheriting mutex it still holds), so elevation never
//! outlives its cause by more than one unlock. A waiter that gives up
//! waiting leaves the owner's elevation in place until that next unlock.
//!
//! Ownership release is by priority, not arrival order: the mutex passes
//! directly to the most important waiter, with arrival order breaking ties.

use abi::{ObjectId, UsageError};

use crate::err::UserError;
use crate::objects::{self, Object, ObjectSlot};
use crate::task::{ArchState, Task};

#[derive(Copy, Clone, Debug)]
pub struct Mutex {
    /// Task table index of the holder.
    owner: Option<usize>,
    /// Recursive acquisition depth; nonzero exactly when `owner` is set.
    depth: u32,
    /// Whether contention elevates the owner.
    inherit: bool,
}

impl Mutex {
    pub fn new(inherit: bool) -> Self {
        Self {
            owner: None,
            depth: 0,
            inherit,
        }
    }

    pub fn owner(&self) -> Option<usize> {
        self.owner
    }

    pub fn inherits(&self) -> bool {
        self.inherit
    }

    /// Attempts to take the mutex for the task at index `caller`. Returns
    /// `false` only if some other task holds it; locking a mutex you already
    /// hold just deepens the recursion.
    pub fn try_lock(&mut self, caller: usize) -> bool {
        match self.owner {
            None => {
                self.owner = Some(caller);
                self.depth = 1;
                true
            }
            Some(o) if o == caller => {
                self.depth += 1;
                true
            }
            Some(_) => false,
        }
    }
}

/// What `unlock` did, so the caller can patch up priorities and scheduling
/// afterwards.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Unlock {
    /// The caller still owns the mutex at a shallower recursion depth.
    StillHeld,
    /// The mutex is free; nobody was waiting.
    Released,
    /// Ownership passed to the waiting task at this index, which has been
    /// woken with success.
    Transferred(usize),
}

/// Releases one level of `m`, held as object `oid` by the task at index
/// `caller`.
///
/// Unlocking a mutex you don't hold is a `NotOwner` usage fault, not a
/// silent corruption of someone else's critical section.
pub fn unlock(
    m: &mut Mutex,
    oid: ObjectId,
    caller: usize,
    tasks: &mut [Task],
) -> Result<Unlock, UserError> {
    if m.owner != Some(caller) {
        return Err(UsageError::NotOwner.into());
    }

    m.depth -= 1;
    if m.depth > 0 {
        return Ok(Unlock::StillHeld);
    }

    if let Some(wi) = kerncore::select_waiter(
        tasks,
        |t| t.state().is_awaiting_mutex(oid),
        |t| t.wait_seq(),
    ) {
        m.owner = Some(wi);
        m.depth = 1;
        tasks[wi].save_mut().set_success_response(0);
        tasks[wi].make_runnable();
        Ok(Unlock::Transferred(wi))
    } else {
        m.owner = None;
        Ok(Unlock::Released)
    }
}

/// Releases `m` completely on behalf of a departing owner, collapsing any
/// recursion. Transfer rules are the same as [`unlock`]; there is no owner
/// check because the owner is being deleted, not asking.
pub fn release_for_delete(
    m: &mut Mutex,
    oid: ObjectId,
    tasks: &mut [Task],
) -> Unlock {
    if m.owner.is_none() {
        return Unlock::Released;
    }

    if let Some(wi) = kerncore::select_waiter(
        tasks,
        |t| t.state().is_awaiting_mutex(oid),
        |t| t.wait_seq(),
    ) {
        m.owner = Some(wi);
        m.depth = 1;
        tasks[wi].save_mut().set_success_response(0);
        tasks[wi].make_runnable();
        Unlock::Transferred(wi)
    } else {
        m.owner = None;
        m.depth = 0;
        Unlock::Released
    }
}

/// Applies priority inheritance when the task at `caller` blocks on the
/// contended mutex `m`: if `m` inherits and the blocked task is more
/// important than the owner currently is, the owner is raised to match.
///
/// The raise uses the blocked task's *effective* priority, so a task that
/// was itself elevated passes that elevation along.
pub fn inherit_on_block(m: &Mutex, caller: usize, tasks: &mut [Task]) {
    if !m.inherit {
        return;
    }
    let Some(owner) = m.owner else {
        return;
    };

    let wanted = tasks[caller].priority();
    if wanted.is_more_important_than(tasks[owner].priority()) {
        tasks[owner].set_effective_priority(wanted);
    }
}

/// Recomputes the effective priority of the task at `owner` from scratch:
/// its base priority, raised to the most important task still waiting on
/// any inheriting mutex it holds.
///
/// Call this after an unlock changes the waiter picture -- for the task
/// that released (which may now deflate back toward its base) and for a
/// task that just received ownership by transfer (which may immediately
/// inherit from waiters left behind on its other mutexes).
pub fn rederive_priority(
    objects: &[ObjectSlot],
    tasks: &mut [Task],
    owner: usize,
) {
    let mut best = tasks[owner].base_priority();
    for (i, slot) in objects.iter().enumerate() {
        let Object::Mutex(m) = slot.object() else {
            continue;
        };
        if !m.inherit || m.owner != Some(owner) {
            continue;
        }
        let oid = objects::current_object_id(objects, i);
        for waiter in tasks.iter() {
            if waiter.state().is_awaiting_mutex(oid)
                && waiter.priority().is_more_important_than(best)
            {
                best = waiter.priority();
            }
        }
    }
    tasks[owner].set_effective_priority(best);
}

/// Counts the mutexes currently held by the task at `owner`, for status
/// reporting.
pub fn held_count(objects: &[ObjectSlot], owner: usize) -> u8 {
    let n = objects
        .iter()
        .filter(|slot| {
            matches!(slot.object(), Object::Mutex(m) if m.owner == Some(owner))
        })
        .count();
    n.min(u8::MAX as usize) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::{Priority, SchedState};

    fn ready(priority: u8) -> Task {
        let mut t = Task::VACANT;
        t.set_base_priority(Priority(priority));
        t.set_effective_priority(Priority(priority));
        t.make_runnable();
        t
    }

    fn blocked_on(t: &mut Task, oid: ObjectId, seq: u64) {
        t.block(seq, SchedState::InMutexLock(oid), None);
    }

    #[test]
    fn recursion_and_owner_checks() {
        let mut tasks = [ready(3), ready(3)];
        let oid = ObjectId(0);
        let mut m = Mutex::new(false);

        assert!(m.try_lock(0));
        assert!(m.try_lock(0));
        assert!(!m.try_lock(1));

        assert!(matches!(
            unlock(&mut m, oid, 1, &mut tasks),
            Err(UserError::Unrecoverable(_))
        ));
        assert_eq!(unlock(&mut m, oid, 0, &mut tasks).unwrap(), Unlock::StillHeld);
        assert_eq!(unlock(&mut m, oid, 0, &mut tasks).unwrap(), Unlock::Released);
        assert!(m.try_lock(1));
    }

    #[test]
    fn contention_raises_owner_and_release_restores_exact_base() {
        let mut objects = [ObjectSlot::VACANT];
        objects[0].fill(Object::Mutex(Mutex::new(true)));
        let oid = objects::current_object_id(&objects, 0);

        let mut tasks = [ready(6), ready(2)];

        let mut m = *objects[0].object().mutex().unwrap();
        assert!(m.try_lock(0));
        assert!(!m.try_lock(1));
        blocked_on(&mut tasks[1], oid, 1);
        inherit_on_block(&m, 1, &mut tasks);
        *objects[0].object_mut().mutex_mut().unwrap() = m;

        assert_eq!(tasks[0].priority(), Priority(2));
        assert_eq!(tasks[0].base_priority(), Priority(6));

        let mut m = *objects[0].object().mutex().unwrap();
        let outcome = unlock(&mut m, oid, 0, &mut tasks).unwrap();
        *objects[0].object_mut().mutex_mut().unwrap() = m;
        assert_eq!(outcome, Unlock::Transferred(1));
        assert!(tasks[1].is_runnable());

        rederive_priority(&objects, &mut tasks, 0);
        assert_eq!(tasks[0].priority(), Priority(6));
    }

    #[test]
    fn release_keeps_elevation_owed_to_other_held_mutexes() {
        let mut objects = [ObjectSlot::VACANT, ObjectSlot::VACANT];
        objects[0].fill(Object::Mutex(Mutex::new(true)));
        objects[1].fill(Object::Mutex(Mutex::new(true)));
        let oid_a = objects::current_object_id(&objects, 0);
        let oid_b = objects::current_object_id(&objects, 1);

        let mut tasks = [ready(6), ready(2)];

        // Task 0 holds both; task 1 blocks on B.
        for i in 0..2 {
            let mut m = *objects[i].object().mutex().unwrap();
            assert!(m.try_lock(0));
            *objects[i].object_mut().mutex_mut().unwrap() = m;
        }
        assert_eq!(held_count(&objects, 0), 2);
        blocked_on(&mut tasks[1], oid_b, 1);
        inherit_on_block(objects[1].object().mutex().unwrap(), 1, &mut tasks);
        assert_eq!(tasks[0].priority(), Priority(2));

        // Releasing A changes nothing: the elevation is owed to B's waiter.
        let mut m = *objects[0].object().mutex().unwrap();
        assert_eq!(unlock(&mut m, oid_a, 0, &mut tasks).unwrap(), Unlock::Released);
        *objects[0].object_mut().mutex_mut().unwrap() = m;
        rederive_priority(&objects, &mut tasks, 0);
        assert_eq!(tasks[0].priority(), Priority(2));
        assert_eq!(held_count(&objects, 0), 1);

        // Releasing B hands off and deflates the old owner to its base.
        let mut m = *objects[1].object().mutex().unwrap();
        assert_eq!(
            unlock(&mut m, oid_b, 0, &mut tasks).unwrap(),
            Unlock::Transferred(1)
        );
        *objects[1].object_mut().mutex_mut().unwrap() = m;
        rederive_priority(&objects, &mut tasks, 0);
        rederive_priority(&objects, &mut tasks, 1);
        assert_eq!(tasks[0].priority(), Priority(6));
        assert_eq!(tasks[1].priority(), Priority(2));
        assert_eq!(held_count(&objects, 0), 0);
    }

    #[test]
    fn transfer_prefers_priority_then_arrival() {
        let oid = ObjectId(0);
        let mut m = Mutex::new(false);
        assert!(m.try_lock(3));

        let mut tasks = [ready(4), ready(4), ready(5), ready(6)];
        blocked_on(&mut tasks[0], oid, 9);
        blocked_on(&mut tasks[1], oid, 3);
        blocked_on(&mut tasks[2], oid, 1);

        assert_eq!(
            unlock(&mut m, oid, 3, &mut tasks).unwrap(),
            Unlock::Transferred(1)
        );
        assert_eq!(m.owner(), Some(1));
    }
}
