// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel object: all mutable kernel state, in one place, under one
//! `&mut`.
//!
//! Everything the kernel knows -- the task table, the object table, the
//! arena they allocate from, the clock, and the identity of the current
//! task -- lives in a single `Kernel` value borrowed from caller-provided
//! [`KernelStorage`]. There are no `static` tables and no global clock to
//! keep in sync with anything; holding `&mut Kernel` *is* the proof that
//! you are the only one mutating kernel state, which on this single-core
//! kernel means running with interrupts masked.

use abi::{
    FaultInfo, ObjectId, Priority, TaskFlags, TaskId, TaskStatus, UsageError,
};

use crate::arena::{Arena, GRAIN};
use crate::err::UserError;
use crate::events::EventGroup;
use crate::mutex::Mutex;
use crate::objects::{self, Object, ObjectSlot};
use crate::queue::Queue;
use crate::semaphore::Semaphore;
use crate::task::{self, ArchState, NextTask, Task, MIN_STACK_SIZE};
use crate::time::Timestamp;
use crate::trace::{Event, Trace};

/// Priority of the idle task. User tasks must be strictly more important;
/// this is the one level the scheduler can always find something to run at.
pub const IDLE_PRIORITY: Priority = Priority(255);

/// Pattern painted across freshly carved stacks so that never-written words
/// are recognizable from a debugger.
const STACK_FILL: u32 = 0xbadd_cafe;

/// Backing storage for a kernel, sized by const generics so each board
/// image picks its own limits at compile time.
///
/// The arena array leads the struct and inherits the 16-byte type
/// alignment; task stacks are carved out of it and handed to the hardware
/// as stack pointers, which must be 16-byte aligned.
#[repr(C, align(16))]
pub struct KernelStorage<
    const TASKS: usize,
    const OBJECTS: usize,
    const ARENA: usize,
> {
    arena: [u8; ARENA],
    tasks: [Task; TASKS],
    objects: [ObjectSlot; OBJECTS],
}

impl<const TASKS: usize, const OBJECTS: usize, const ARENA: usize>
    KernelStorage<TASKS, OBJECTS, ARENA>
{
    pub const fn new() -> Self {
        Self {
            arena: [0; ARENA],
            tasks: [Task::VACANT; TASKS],
            objects: [ObjectSlot::VACANT; OBJECTS],
        }
    }
}

impl<const TASKS: usize, const OBJECTS: usize, const ARENA: usize> Default
    for KernelStorage<TASKS, OBJECTS, ARENA>
{
    fn default() -> Self {
        Self::new()
    }
}

/// A live kernel, borrowing its storage.
pub struct Kernel<'s> {
    pub(crate) tasks: &'s mut [Task],
    pub(crate) objects: &'s mut [ObjectSlot],
    pub(crate) arena: Arena<'s>,
    pub(crate) now: Timestamp,
    pub(crate) current: usize,
    pub(crate) trace: Trace,
    /// Source of arrival stamps for blocking waits; see [`Kernel::stamp`].
    next_wait_seq: u64,
}

impl<'s> Kernel<'s> {
    /// Wraps `storage` in a live kernel. Both tables start empty; callers
    /// populate them through the `create_*` operations before starting the
    /// first task.
    pub fn new<const TASKS: usize, const OBJECTS: usize, const ARENA: usize>(
        storage: &'s mut KernelStorage<TASKS, OBJECTS, ARENA>,
    ) -> Self {
        // Handles pack a 10-bit slot index; a larger table would alias
        // handles past the generation check.
        uassert!(TASKS <= TaskId::INDEX_MASK as usize + 1);
        uassert!(OBJECTS <= ObjectId::INDEX_MASK as usize + 1);
        let KernelStorage {
            arena,
            tasks,
            objects,
        } = storage;
        Self {
            tasks,
            objects,
            arena: Arena::new(arena),
            now: Timestamp::from(0),
            current: 0,
            trace: Trace::new(),
            next_wait_seq: 0,
        }
    }

    /// Current kernel time, in ticks since startup.
    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Table index of the task that owns the CPU.
    pub fn current(&self) -> usize {
        self.current
    }

    /// Handle for the task that owns the CPU.
    pub fn current_id(&self) -> TaskId {
        task::current_id(self.tasks, self.current)
    }

    pub fn task(&self, index: usize) -> &Task {
        &self.tasks[index]
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    /// Issues the next arrival stamp. Stamps order equal-priority waiters,
    /// so every entry into a blocking wait burns one.
    pub(crate) fn stamp(&mut self) -> u64 {
        let s = self.next_wait_seq;
        self.next_wait_seq += 1;
        s
    }

    /// Creates a task and returns its handle.
    ///
    /// Fails with `EXHAUSTED` when the task table or the arena is full, and
    /// with a usage fault for nonsense arguments; in either case no kernel
    /// state has changed.
    pub fn create_task(
        &mut self,
        name: &[u8],
        priority: Priority,
        stack_size: usize,
        entry: u64,
        argument: u64,
        flags: TaskFlags,
    ) -> Result<TaskId, UserError> {
        if !priority.is_more_important_than(IDLE_PRIORITY) {
            // The least important level belongs to the idle task alone.
            return Err(UsageError::BadArgument.into());
        }
        self.create_task_inner(name, priority, stack_size, entry, argument, flags)
    }

    /// Creates the idle task. Exactly one must exist before the first task
    /// starts, and its entry point must never block or exit.
    pub fn create_idle_task(
        &mut self,
        stack_size: usize,
        entry: u64,
    ) -> Result<TaskId, UserError> {
        self.create_task_inner(
            b"idle",
            IDLE_PRIORITY,
            stack_size,
            entry,
            0,
            TaskFlags::empty(),
        )
    }

    fn create_task_inner(
        &mut self,
        name: &[u8],
        priority: Priority,
        stack_size: usize,
        entry: u64,
        argument: u64,
        flags: TaskFlags,
    ) -> Result<TaskId, UserError> {
        if flags.intersects(TaskFlags::RESERVED)
            || stack_size < MIN_STACK_SIZE
            || entry == 0
        {
            return Err(UsageError::BadArgument.into());
        }

        let Some(index) = self.tasks.iter().position(Task::is_vacant) else {
            return Err(UserError::Recoverable(abi::EXHAUSTED, NextTask::Same));
        };
        let Some(stack) = self.arena.carve(stack_size) else {
            self.trace.record(Event::OutOfMemory);
            return Err(UserError::Recoverable(abi::EXHAUSTED, NextTask::Same));
        };

        for word in self.arena.bytes_mut(stack).chunks_exact_mut(4) {
            word.copy_from_slice(&STACK_FILL.to_le_bytes());
        }

        let stack_base = self.arena.addr_of(stack) as u64;
        self.tasks[index]
            .activate(name, priority, flags, stack, stack_base, entry, argument);
        self.trace.record(Event::TaskCreated(index as u16));
        Ok(task::current_id(self.tasks, index))
    }

    fn vacant_object_slot(&self) -> Result<usize, UserError> {
        self.objects
            .iter()
            .position(ObjectSlot::is_vacant)
            .ok_or(UserError::Recoverable(abi::EXHAUSTED, NextTask::Same))
    }

    fn install_object(&mut self, index: usize, object: Object) -> ObjectId {
        self.objects[index].fill(object);
        self.trace.record(Event::ObjectCreated(index as u16));
        objects::current_object_id(self.objects, index)
    }

    /// Creates a queue of `capacity` items of `item_size` bytes each, with
    /// the ring carved from the arena.
    pub fn create_queue(
        &mut self,
        capacity: usize,
        item_size: usize,
    ) -> Result<ObjectId, UserError> {
        if capacity == 0 || item_size == 0 {
            return Err(UsageError::BadArgument.into());
        }
        let bytes = capacity
            .checked_mul(item_size)
            .ok_or(UserError::from(UsageError::BadArgument))?;

        let index = self.vacant_object_slot()?;
        let Some(ring) = self.arena.carve(bytes) else {
            self.trace.record(Event::OutOfMemory);
            return Err(UserError::Recoverable(abi::EXHAUSTED, NextTask::Same));
        };
        Ok(self.install_object(
            index,
            Object::Queue(Queue::new(ring, capacity, item_size)),
        ))
    }

    /// Creates a counting semaphore; `max == 1` makes it binary.
    pub fn create_semaphore(
        &mut self,
        max: u32,
        initial: u32,
    ) -> Result<ObjectId, UserError> {
        if max == 0 || initial > max {
            return Err(UsageError::BadArgument.into());
        }
        let index = self.vacant_object_slot()?;
        Ok(self.install_object(
            index,
            Object::Semaphore(Semaphore::new(max, initial)),
        ))
    }

    /// Creates a mutex, with or without priority inheritance.
    pub fn create_mutex(&mut self, inherit: bool) -> Result<ObjectId, UserError> {
        let index = self.vacant_object_slot()?;
        Ok(self.install_object(index, Object::Mutex(Mutex::new(inherit))))
    }

    /// Creates an event group with all bits clear.
    pub fn create_event_group(&mut self) -> Result<ObjectId, UserError> {
        let index = self.vacant_object_slot()?;
        Ok(self.install_object(index, Object::EventGroup(EventGroup::new())))
    }

    /// Deletes the object in slot `index`, returning its memory to the
    /// arena and waking every task blocked on it with a dead code.
    pub(crate) fn delete_object(&mut self, index: usize) -> NextTask {
        let oid = objects::current_object_id(self.objects, index);
        let departed = self.objects[index].vacate();
        if let Object::Queue(q) = &departed {
            self.arena.retire(q.ring());
        }

        // The dead code carries the generation as the kicked waiters will
        // now find it.
        let code = abi::dead_response_code(self.objects[index].generation());
        let mut hint = NextTask::Same;
        for t in self.tasks.iter_mut() {
            if t.state().is_awaiting_object(oid) {
                t.save_mut().set_error_response(code);
                t.make_runnable();
                hint = hint.combine(NextTask::Other);
            }
        }
        self.trace.record(Event::ObjectDeleted(index as u16));
        hint
    }

    /// Advances the clock by one tick: runtime accounting for the current
    /// task, timed-wait expiry, and the round-robin rotation among
    /// runnable peers of the current priority.
    pub fn tick(&mut self) -> NextTask {
        self.now = self.now.succ();
        self.tasks[self.current].count_runtime_tick();

        let mut hint =
            task::process_timers(self.tasks, &mut self.trace, self.now);
        if self.runnable_peer_exists() {
            // One tick, one slice.
            hint = hint.combine(NextTask::Other);
        }
        hint
    }

    fn runnable_peer_exists(&self) -> bool {
        let cur = &self.tasks[self.current];
        if !cur.is_runnable() {
            return false;
        }
        self.tasks.iter().enumerate().any(|(i, t)| {
            i != self.current && t.is_runnable() && t.priority() == cur.priority()
        })
    }

    /// Picks the task to run next, given the scheduling hint accumulated
    /// since the last switch, and makes it current.
    ///
    /// A `Specific` hint is treated as `Other` and takes the full priority
    /// scan: a directed wake must not jump past a more important runnable
    /// task.
    pub fn schedule(&mut self, hint: NextTask) -> TaskId {
        if hint != NextTask::Same {
            let next = task::select(self.current, self.tasks);
            if next != self.current {
                self.trace.record(Event::SwitchTo(next as u16));
            }
            self.current = next;
        }

        if self.tasks[self.current].priority() == IDLE_PRIORITY {
            self.reap_defunct();
        }

        task::current_id(self.tasks, self.current)
    }

    /// Reclaims tasks that deleted themselves. Deferred to the moment the
    /// scheduler reaches idle, so a departing task's stack remains valid
    /// until it is off the CPU for good.
    fn reap_defunct(&mut self) {
        for index in 0..self.tasks.len() {
            if self.tasks[index].is_defunct() {
                self.reap_one(index);
            }
        }
    }

    /// Vacates the task slot at `index`, returning its stack to the arena.
    pub(crate) fn reap_one(&mut self, index: usize) {
        if let Some(stack) = self.tasks[index].vacate() {
            self.arena.retire(stack);
        }
        self.trace.record(Event::TaskGone(index as u16));
    }

    /// Filters a wake hint against the running task: the CPU changes hands
    /// only when the wake has left a strictly more important task runnable,
    /// or when the current task can no longer run at all. Rotation among
    /// equal-priority tasks belongs to the tick and to explicit yields,
    /// never to wakes.
    pub fn preemption_hint(&self, hint: NextTask) -> NextTask {
        if hint == NextTask::Same {
            return NextTask::Same;
        }
        let cur = &self.tasks[self.current];
        if !cur.is_runnable() {
            return NextTask::Other;
        }
        let outranked = self.tasks.iter().any(|t| {
            t.is_runnable() && t.priority().is_more_important_than(cur.priority())
        });
        if outranked {
            NextTask::Other
        } else {
            NextTask::Same
        }
    }

    /// Bookkeeping against the current task on each kernel entry: samples
    /// the stack pointer for the high-water mark, and halts if the pointer
    /// has left its stack. Stacks are carved from the kernel arena with no
    /// guard between extents, so an overflow has potentially corrupted
    /// neighboring state and is treated as kernel-fatal rather than a task
    /// fault.
    pub fn check_current_stack(&mut self) {
        #[cfg(feature = "stack-watermark")]
        self.tasks[self.current].update_stack_watermark();

        if let Some(sp) = self.tasks[self.current].stack_violation() {
            panic!("task {} stack overflow: sp={:#x}", self.current, sp);
        }
    }

    /// Forces a fault against the task at `index`.
    pub fn force_fault(&mut self, index: usize, fault: FaultInfo) -> NextTask {
        task::force_fault(self.tasks, &mut self.trace, index, fault)
    }

    /// Whether an idle task has been created yet. Checked before the first
    /// task is allowed to start.
    pub fn has_idle_task(&self) -> bool {
        self.tasks
            .iter()
            .any(|t| !t.is_vacant() && t.priority() == IDLE_PRIORITY)
    }

    /// Snapshot of a task's public status for the task-info operation.
    pub fn task_status(&self, index: usize) -> TaskStatus {
        let t = &self.tasks[index];
        TaskStatus {
            runtime_ticks: t.runtime_ticks(),
            stack_size: t.stack().map_or(0, |s| s.size() as u32),
            stack_high_water: t.stack_high_water(),
            name: *t.name(),
            base_priority: t.base_priority().0,
            priority: t.priority().0,
            state: t.state().status_code(),
            held_mutexes: crate::mutex::held_count(self.objects, index),
            reserved_zero: 0,
        }
    }
}

// The arena insists on this; new() would fail its alignment check otherwise.
static_assertions::const_assert!(core::mem::align_of::<KernelStorage<1, 1, 16>>() >= GRAIN);

#[cfg(test)]
mod tests {
    use super::*;
    use abi::SchedState;

    const ENTRY: u64 = 0x2000;

    fn kernel_with_idle(
        storage: &mut KernelStorage<4, 2, 8192>,
    ) -> Kernel<'_> {
        let mut k = Kernel::new(storage);
        k.create_idle_task(MIN_STACK_SIZE, ENTRY).unwrap();
        k
    }

    fn spawn(k: &mut Kernel<'_>, name: &[u8], priority: u8) -> usize {
        k.create_task(
            name,
            Priority(priority),
            MIN_STACK_SIZE,
            ENTRY,
            0,
            TaskFlags::empty(),
        )
        .unwrap()
        .index()
    }

    #[test]
    fn creation_failures_leave_state_unchanged() {
        let mut storage = KernelStorage::new();
        let mut k = kernel_with_idle(&mut storage);
        spawn(&mut k, b"a", 1);
        spawn(&mut k, b"b", 1);
        spawn(&mut k, b"c", 1);
        let before = k.arena.remaining();

        // Table full: recoverable exhaustion, no arena movement.
        let r = k.create_task(
            b"d",
            Priority(1),
            MIN_STACK_SIZE,
            ENTRY,
            0,
            TaskFlags::empty(),
        );
        assert!(matches!(r, Err(UserError::Recoverable(abi::EXHAUSTED, _))));
        assert_eq!(k.arena.remaining(), before);
    }

    #[test]
    fn creation_validates_arguments() {
        let mut storage = KernelStorage::new();
        let mut k = kernel_with_idle(&mut storage);

        // Claiming the idle priority level.
        let r = k.create_task(
            b"x",
            IDLE_PRIORITY,
            MIN_STACK_SIZE,
            ENTRY,
            0,
            TaskFlags::empty(),
        );
        assert!(matches!(r, Err(UserError::Unrecoverable(_))));

        // Stack below the floor.
        let r = k.create_task(
            b"x",
            Priority(3),
            MIN_STACK_SIZE - 1,
            ENTRY,
            0,
            TaskFlags::empty(),
        );
        assert!(matches!(r, Err(UserError::Unrecoverable(_))));

        // Unknown flag bits.
        let r = k.create_task(
            b"x",
            Priority(3),
            MIN_STACK_SIZE,
            ENTRY,
            0,
            TaskFlags::from_bits_retain(1 << 7),
        );
        assert!(matches!(r, Err(UserError::Unrecoverable(_))));
    }

    #[test]
    fn queue_creation_validates_dimensions() {
        let mut storage = KernelStorage::new();
        let mut k = kernel_with_idle(&mut storage);

        assert!(matches!(
            k.create_queue(0, 4),
            Err(UserError::Unrecoverable(_))
        ));
        assert!(matches!(
            k.create_queue(4, 0),
            Err(UserError::Unrecoverable(_))
        ));
        assert!(matches!(
            k.create_queue(usize::MAX, 2),
            Err(UserError::Unrecoverable(_))
        ));
        // Doesn't fit the arena: recoverable.
        assert!(matches!(
            k.create_queue(1, 1 << 20),
            Err(UserError::Recoverable(abi::EXHAUSTED, _))
        ));
    }

    #[test]
    fn tick_wakes_expired_sleepers() {
        let mut storage = KernelStorage::new();
        let mut k = kernel_with_idle(&mut storage);
        let i = spawn(&mut k, b"sleepy", 2);
        let deadline = k.now().plus_ticks(2);
        k.tasks[i].block(0, SchedState::InSleep, Some(deadline));

        assert_eq!(k.tick(), NextTask::Same);
        assert!(!k.tasks[i].is_runnable());
        assert_eq!(k.tick(), NextTask::Other);
        assert!(k.tasks[i].is_runnable());
    }

    #[test]
    fn equal_priority_peers_rotate_tick_by_tick() {
        let mut storage = KernelStorage::new();
        let mut k = kernel_with_idle(&mut storage);
        let a = spawn(&mut k, b"a", 2);
        let b = spawn(&mut k, b"b", 2);

        k.schedule(NextTask::Other);
        let first = k.current();
        assert!(first == a || first == b);

        let hint = k.tick();
        assert_eq!(hint, NextTask::Other);
        k.schedule(hint);
        let second = k.current();
        assert_ne!(second, first);

        let hint = k.tick();
        k.schedule(hint);
        assert_eq!(k.current(), first);
    }

    #[test]
    fn self_deleted_tasks_are_reclaimed_when_the_system_idles() {
        let mut storage = KernelStorage::new();
        let mut k = kernel_with_idle(&mut storage);
        let before = k.arena.remaining();
        let doomed = k
            .create_task(
                b"doomed",
                Priority(2),
                MIN_STACK_SIZE,
                ENTRY,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
        let di = doomed.index();

        k.schedule(NextTask::Other);
        assert_eq!(k.current(), di);
        k.tasks[di].set_healthy_state(SchedState::Defunct);

        // The stack stays carved until the scheduler actually reaches idle.
        assert!(k.arena.remaining() < before);
        k.schedule(NextTask::Other);
        assert!(k.tasks[di].is_vacant());
        assert_eq!(k.arena.remaining(), before);

        // The departed handle is now stale.
        assert!(matches!(
            task::check_task_id_against_table(k.tasks, doomed),
            Err(UserError::Recoverable(..))
        ));
    }

    #[test]
    fn deleting_an_object_kicks_waiters_with_a_dead_code() {
        let mut storage = KernelStorage::new();
        let mut k = kernel_with_idle(&mut storage);
        let w = spawn(&mut k, b"waiter", 2);
        let sem = k.create_semaphore(1, 0).unwrap();
        let si = sem.index();
        k.tasks[w].block(0, SchedState::InSemTake(sem), None);

        assert_eq!(k.delete_object(si), NextTask::Other);
        assert!(k.tasks[w].is_runnable());
        let expected = abi::dead_response_code(k.objects[si].generation());
        assert_eq!(k.tasks[w].save().ret0_value(), u64::from(expected));
        assert!(matches!(
            objects::check_object_id(k.objects, sem),
            Err(UserError::Recoverable(..))
        ));
    }

    #[test]
    fn status_reports_priorities_and_held_mutexes() {
        let mut storage = KernelStorage::new();
        let mut k = kernel_with_idle(&mut storage);
        let ti = spawn(&mut k, b"holder", 3);
        let m = k.create_mutex(true).unwrap();
        let mi = m.index();

        let mut mx = *k.objects[mi].object().mutex().unwrap();
        assert!(mx.try_lock(ti));
        *k.objects[mi].object_mut().mutex_mut().unwrap() = mx;

        let st = k.task_status(ti);
        assert_eq!(st.base_priority, 3);
        assert_eq!(st.priority, 3);
        assert_eq!(st.held_mutexes, 1);
        assert_eq!(st.stack_size, MIN_STACK_SIZE as u32);
        assert_eq!(&st.name[..6], b"holder");
    }

    #[test]
    #[should_panic]
    fn storage_wider_than_the_handle_index_is_refused() {
        // ObjectId packs a 10-bit index; 1025 slots cannot all be named.
        let mut storage = KernelStorage::<4, 1025, 64>::new();
        let _ = Kernel::new(&mut storage);
    }
}
