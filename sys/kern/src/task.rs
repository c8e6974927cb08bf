// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks.

use abi::{
    FaultInfo, Generation, Priority, SchedState, TaskFlags, TaskId, TaskState,
    UsageError, NAME_LEN, TIMEOUT,
};

use crate::arena::Extent;
use crate::err::UserError;
use crate::time::Timestamp;
use crate::trace::{Event, Trace};
use crate::umem::USlice;

pub use kerncore::NextTask;

/// Smallest stack we will accept at task creation. Anything tighter cannot
/// even take an interrupt plus a few call frames on this architecture.
pub const MIN_STACK_SIZE: usize = 512;

/// Internal representation of a task.
///
/// The fields of this struct are private to this module so that we can
/// maintain some task invariants. These mostly have to do with keeping the
/// blocking state, the wake deadline, and the arrival stamp consistent with
/// one another across state changes.
#[repr(C)] // so location of SavedState is predictable
#[derive(Debug)]
pub struct Task {
    /// Saved machine state of the user program.
    save: crate::arch::SavedState,
    // NOTE: it is critical that the above field appear first!
    /// Priority the scheduler actually uses. Matches `base_priority` except
    /// while the task holds a mutex that a more important task is waiting
    /// for.
    priority: Priority,
    /// Priority assigned at creation or by the last explicit change.
    base_priority: Priority,
    /// State used to make status and scheduling decisions.
    state: TaskState,
    /// Moment at which the current timed wait gives up, in kernel time. If
    /// `None`, the task waits forever (or isn't waiting).
    deadline: Option<Timestamp>,
    /// Arrival stamp of the wait the task is currently blocked on. Orders
    /// wakeups among equal-priority waiters.
    wait_seq: u64,
    /// Notification counter.
    notifications: u32,
    /// Occupancy count for this slot. We increment this whenever the slot is
    /// vacated, so stale `TaskId`s stop working the moment their task dies.
    /// The low bits of this become the task's generation number.
    generation: u32,
    /// Behavior flags fixed at creation.
    flags: TaskFlags,
    /// Stack memory within the kernel arena. `Some` exactly while the slot
    /// is occupied.
    stack: Option<Extent>,
    /// Address of the lowest valid stack byte, cached so the overflow check
    /// doesn't need the arena.
    stack_base: u64,
    /// Number of timer ticks during which this task was current.
    runtime_ticks: u64,
    /// Name given at creation, zero-padded.
    name: [u8; NAME_LEN],

    /// Lowest stack pointer value observed on any kernel entry, or
    /// `u64::MAX` if the task has not yet trapped in.
    ///
    /// This field is completely missing if the feature is disabled to make
    /// that clear to debug tools.
    #[cfg(feature = "stack-watermark")]
    stack_low: u64,
}

impl Task {
    /// An unoccupied slot, used to build the initial task table.
    pub const VACANT: Self = Task {
        save: crate::arch::SavedState::DEFAULT,
        priority: Priority(0),
        base_priority: Priority(0),
        state: TaskState::Healthy(SchedState::Stopped),
        deadline: None,
        wait_seq: 0,
        notifications: 0,
        generation: 0,
        flags: TaskFlags::empty(),
        stack: None,
        stack_base: 0,
        runtime_ticks: 0,
        name: [0; NAME_LEN],
        #[cfg(feature = "stack-watermark")]
        stack_low: u64::MAX,
    };

    /// Populates this (vacant) slot with a fresh task and builds its initial
    /// machine state, so that dispatching it is indistinguishable from
    /// resuming a task that has run before.
    ///
    /// `stack` and `stack_base` describe memory the caller has already carved
    /// for this task. The generation is deliberately left alone; it advances
    /// when slots are vacated, not when they fill.
    pub(crate) fn activate(
        &mut self,
        name: &[u8],
        priority: Priority,
        flags: TaskFlags,
        stack: Extent,
        stack_base: u64,
        entry: u64,
        argument: u64,
    ) {
        uassert!(self.is_vacant());

        self.save = crate::arch::SavedState::default();
        self.priority = priority;
        self.base_priority = priority;
        self.state = TaskState::Healthy(SchedState::Runnable);
        self.deadline = None;
        self.wait_seq = 0;
        self.notifications = 0;
        self.flags = flags;
        self.stack_base = stack_base;
        self.stack = Some(stack);
        self.runtime_ticks = 0;
        self.name = [0; NAME_LEN];
        let n = usize::min(name.len(), NAME_LEN);
        self.name[..n].copy_from_slice(&name[..n]);
        #[cfg(feature = "stack-watermark")]
        {
            self.stack_low = u64::MAX;
        }

        crate::arch::reinitialize(self, entry, argument);
    }

    /// Empties this slot back out, advancing the generation so that any
    /// `TaskId` referring to the departed task turns into a dead code.
    ///
    /// Returns the stack extent so the caller can hand it back to the arena.
    pub(crate) fn vacate(&mut self) -> Option<Extent> {
        self.generation = self.generation.wrapping_add(1);
        self.state = TaskState::Healthy(SchedState::Stopped);
        self.deadline = None;
        self.notifications = 0;
        self.name = [0; NAME_LEN];
        self.stack_base = 0;
        self.stack.take()
    }

    /// Checks if this slot holds no task at all.
    pub fn is_vacant(&self) -> bool {
        matches!(self.state, TaskState::Healthy(SchedState::Stopped))
    }

    /// Checks if this task has self-deleted and awaits reclamation.
    pub fn is_defunct(&self) -> bool {
        matches!(self.state, TaskState::Healthy(SchedState::Defunct))
    }

    /// Checks if this task is in a potentially schedulable state.
    pub fn is_runnable(&self) -> bool {
        matches!(self.state, TaskState::Healthy(SchedState::Runnable))
    }

    /// Increments the notification counter, and if the task is currently
    /// blocked waiting for notifications, delivers immediately.
    ///
    /// Returns `true` if the task was woken (indicating that a context
    /// switch may be necessary), `false` otherwise.
    ///
    /// This would return a `NextTask` but that would require the task to
    /// know its own table index, which it does not.
    #[must_use]
    pub fn give_notification(&mut self) -> bool {
        self.notifications = self.notifications.saturating_add(1);

        if let TaskState::Healthy(SchedState::InNotifyWait { clear_on_exit }) =
            self.state
        {
            let value = self.consume_notifications(clear_on_exit);
            self.save.set_success_response(u64::from(value));
            self.make_runnable();
            return true;
        }
        false
    }

    /// Takes the notification counter per the clear policy, returning the
    /// value it held beforehand.
    pub(crate) fn consume_notifications(&mut self, clear_on_exit: bool) -> u32 {
        let value = self.notifications;
        self.notifications = if clear_on_exit {
            0
        } else {
            value.saturating_sub(1)
        };
        value
    }

    /// Current notification counter, without consuming anything.
    pub fn notifications(&self) -> u32 {
        self.notifications
    }

    /// Puts this task into a blocked state, recording the arrival stamp that
    /// orders it among equal-priority waiters and the deadline at which the
    /// wait gives up (`None` to wait forever).
    pub(crate) fn block(
        &mut self,
        seq: u64,
        state: SchedState,
        deadline: Option<Timestamp>,
    ) {
        self.wait_seq = seq;
        self.deadline = deadline;
        self.set_healthy_state(state);
    }

    /// Returns this task to the runnable state, cancelling any pending
    /// deadline. Writing the syscall result that explains the wakeup is the
    /// caller's job.
    pub(crate) fn make_runnable(&mut self) {
        self.deadline = None;
        self.set_healthy_state(SchedState::Runnable);
    }

    /// Wake deadline for the current timed wait, if one is armed.
    pub fn deadline(&self) -> Option<Timestamp> {
        self.deadline
    }

    pub(crate) fn clear_deadline(&mut self) {
        self.deadline = None;
    }

    /// Arrival stamp of the wait this task is blocked on. Only meaningful
    /// while the task is in a blocked state.
    pub fn wait_seq(&self) -> u64 {
        self.wait_seq
    }

    /// Returns this task's current generation number.
    pub fn generation(&self) -> Generation {
        const MASK: u8 = ((1u32 << (16 - TaskId::INDEX_BITS)) - 1) as u8;
        Generation::from(self.generation as u8 & MASK)
    }

    /// Returns the priority the scheduler uses for this task. This is the
    /// inherited priority while priority inheritance is in effect.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Returns the priority this task was given at creation or by the last
    /// explicit change.
    pub fn base_priority(&self) -> Priority {
        self.base_priority
    }

    /// Adjusts the scheduler-visible priority, leaving the base alone. Used
    /// by priority inheritance.
    pub(crate) fn set_effective_priority(&mut self, p: Priority) {
        self.priority = p;
    }

    /// Rewrites the base priority. The caller is responsible for re-deriving
    /// the effective priority afterwards.
    pub(crate) fn set_base_priority(&mut self, p: Priority) {
        self.base_priority = p;
    }

    /// Behavior flags fixed at creation.
    pub fn flags(&self) -> TaskFlags {
        self.flags
    }

    /// Stack extent, present while the slot is occupied.
    pub fn stack(&self) -> Option<Extent> {
        self.stack
    }

    /// Address of the lowest valid stack byte.
    pub fn stack_base(&self) -> u64 {
        self.stack_base
    }

    /// Address one past the highest valid stack byte, which is also the
    /// initial stack pointer.
    pub fn stack_top(&self) -> u64 {
        match self.stack {
            Some(e) => self.stack_base + e.size() as u64,
            None => 0,
        }
    }

    /// Checks the saved stack pointer against the stack extent, returning
    /// the offending pointer if it has wandered out. Called when the task
    /// traps into the kernel, so overflow is caught before the task is
    /// dispatched again.
    pub fn stack_violation(&self) -> Option<u64> {
        if self.stack.is_none() {
            return None;
        }
        let sp = self.save.stack_pointer();
        if sp < self.stack_base || sp > self.stack_top() {
            Some(sp)
        } else {
            None
        }
    }

    /// Updates the task's stack watermark stats, if enabled.
    ///
    /// If not enabled, this does nothing, so it should be safe to call
    /// freely without checking for the feature.
    pub fn update_stack_watermark(&mut self) {
        #[cfg(feature = "stack-watermark")]
        {
            self.stack_low =
                u64::min(self.stack_low, self.save.stack_pointer());
        }
    }

    /// Deepest stack use observed so far, in bytes. Zero if the task has not
    /// run, or if watermark tracking is compiled out.
    pub fn stack_high_water(&self) -> u32 {
        #[cfg(feature = "stack-watermark")]
        {
            if self.stack_low != u64::MAX {
                return self.stack_top().saturating_sub(self.stack_low) as u32;
            }
        }
        0
    }

    /// Ticks during which this task was current.
    pub fn runtime_ticks(&self) -> u64 {
        self.runtime_ticks
    }

    pub(crate) fn count_runtime_tick(&mut self) {
        self.runtime_ticks = self.runtime_ticks.wrapping_add(1);
    }

    /// Name given at creation, zero-padded.
    pub fn name(&self) -> &[u8; NAME_LEN] {
        &self.name
    }

    /// Returns a reference to this task's current state, for inspection.
    pub fn state(&self) -> &TaskState {
        &self.state
    }

    /// Alters this task's state from one healthy state to another.
    ///
    /// To deliver a fault, use `force_fault` instead. Faulted tasks stay
    /// faulted; there are invariants to uphold when a task starts running,
    /// and `activate` is the only place that upholds them.
    ///
    /// # Panics
    ///
    /// If you attempt to use this to bring a task out of fault state.
    pub fn set_healthy_state(&mut self, s: SchedState) {
        let last = core::mem::replace(&mut self.state, TaskState::Healthy(s));
        if let TaskState::Faulted { .. } = last {
            panic!();
        }
    }

    /// Returns a reference to the saved machine state for the task.
    pub fn save(&self) -> &crate::arch::SavedState {
        &self.save
    }

    /// Returns a mutable reference to the saved machine state for the task.
    pub fn save_mut(&mut self) -> &mut crate::arch::SavedState {
        &mut self.save
    }
}

impl kerncore::Prioritized for Task {
    fn priority_value(&self) -> u8 {
        self.priority.0
    }
}

/// Interface that must be implemented by the `arch::SavedState` type. This
/// gives architecture-independent access to task state for the rest of the
/// kernel.
///
/// Architectures need to implement the `argX` and `retX` functions plus
/// `syscall_descriptor` and `stack_pointer`, and the rest of the trait (such
/// as the argument proxy types) will just work.
pub trait ArchState: Default {
    /// Reads the saved user stack pointer.
    fn stack_pointer(&self) -> u64;

    /// Reads syscall argument register 0.
    fn arg0(&self) -> u64;
    /// Reads syscall argument register 1.
    fn arg1(&self) -> u64;
    /// Reads syscall argument register 2.
    fn arg2(&self) -> u64;
    /// Reads syscall argument register 3.
    fn arg3(&self) -> u64;
    /// Reads syscall argument register 4.
    fn arg4(&self) -> u64;
    /// Reads syscall argument register 5.
    fn arg5(&self) -> u64;
    /// Reads syscall argument register 6.
    fn arg6(&self) -> u64;

    /// Reads the syscall descriptor (number).
    fn syscall_descriptor(&self) -> u32;

    /// Writes syscall return register 0.
    fn ret0(&mut self, _: u64);
    /// Writes syscall return register 1.
    fn ret1(&mut self, _: u64);
    /// Writes syscall return register 2.
    fn ret2(&mut self, _: u64);

    /// Interprets arguments as for the task creation syscall.
    ///
    /// This is inlined because it's called from several places, and most of
    /// those places only use _part_ of its result -- so inlining it lets
    /// most of its code be eliminated and makes text smaller.
    #[inline(always)]
    fn as_task_create_args(&self) -> TaskCreateArgs {
        TaskCreateArgs {
            entry: self.arg0(),
            name: USlice::from_raw(self.arg1() as usize, self.arg2() as usize),
            stack_size: self.arg3() as usize,
            priority: self.arg4(),
            argument: self.arg5(),
            flags: self.arg6(),
        }
    }

    /// Interprets arguments as for the queue creation syscall.
    fn as_queue_create_args(&self) -> QueueCreateArgs {
        QueueCreateArgs {
            capacity: self.arg0() as usize,
            item_size: self.arg1() as usize,
        }
    }

    /// Interprets arguments as for the queue send/receive/peek syscalls.
    ///
    /// The buffer length is not carried here; it is fixed by the queue's
    /// item size, which the caller looks up first.
    #[inline(always)]
    fn as_queue_transfer_args(&self) -> QueueTransferArgs {
        QueueTransferArgs {
            object: abi::ObjectId(self.arg0() as u16),
            buffer_base: self.arg1() as usize,
            timeout: self.arg2() as u32,
        }
    }

    /// Interprets arguments as for the semaphore creation syscall.
    fn as_sem_create_args(&self) -> SemCreateArgs {
        SemCreateArgs {
            max: self.arg0() as u32,
            initial: self.arg1() as u32,
        }
    }

    /// Interprets arguments as for syscalls that name an object and a
    /// timeout and nothing else (semaphore take, mutex lock).
    #[inline(always)]
    fn as_object_wait_args(&self) -> ObjectWaitArgs {
        ObjectWaitArgs {
            object: abi::ObjectId(self.arg0() as u16),
            timeout: self.arg1() as u32,
        }
    }

    /// Interprets arguments as for the event wait syscall.
    fn as_event_wait_args(&self) -> EventWaitArgs {
        EventWaitArgs {
            object: abi::ObjectId(self.arg0() as u16),
            bits: self.arg1() as u32,
            mode: self.arg2() as u32,
            timeout: self.arg3() as u32,
        }
    }

    /// Interprets arguments as for the event set/clear syscalls.
    fn as_event_bits_args(&self) -> EventBitsArgs {
        EventBitsArgs {
            object: abi::ObjectId(self.arg0() as u16),
            bits: self.arg1() as u32,
        }
    }

    /// Interprets arguments as for the notification take syscall.
    fn as_notify_take_args(&self) -> NotifyTakeArgs {
        NotifyTakeArgs {
            clear_all: self.arg0() != 0,
            timeout: self.arg1() as u32,
        }
    }

    /// Interprets arguments as for the priority set syscall.
    fn as_priority_set_args(&self) -> PrioritySetArgs {
        PrioritySetArgs {
            task: TaskId(self.arg0() as u16),
            priority: self.arg1(),
        }
    }

    /// Interprets arguments as for the task status query syscall.
    fn as_task_info_args(&self) -> TaskInfoArgs {
        TaskInfoArgs {
            task: TaskId(self.arg0() as u16),
            buffer: USlice::from_raw(self.arg1() as usize, 1),
        }
    }

    /// Sets a recoverable error code using the generic ABI.
    fn set_error_response(&mut self, resp: u32) {
        self.ret0(u64::from(resp));
        self.ret1(0);
    }

    /// Sets the success code plus the single result value most syscalls
    /// produce (a created id, a counter, a set of event bits...).
    fn set_success_response(&mut self, value: u64) {
        self.ret0(0);
        self.ret1(value);
    }
}

/// Decoded arguments for the task creation syscall.
///
/// `priority` and `flags` are left raw here and validated at the point of
/// use, so that the error can say which one was bad.
#[derive(Clone, Debug)]
pub struct TaskCreateArgs {
    pub entry: u64,
    pub name: Result<USlice<u8>, UsageError>,
    pub stack_size: usize,
    pub priority: u64,
    pub argument: u64,
    pub flags: u64,
}

/// Decoded arguments for the queue creation syscall.
#[derive(Clone, Debug)]
pub struct QueueCreateArgs {
    pub capacity: usize,
    pub item_size: usize,
}

/// Decoded arguments for the queue send/receive/peek syscalls.
#[derive(Clone, Debug)]
pub struct QueueTransferArgs {
    pub object: abi::ObjectId,
    pub buffer_base: usize,
    pub timeout: u32,
}

/// Decoded arguments for the semaphore creation syscall.
#[derive(Clone, Debug)]
pub struct SemCreateArgs {
    pub max: u32,
    pub initial: u32,
}

/// Decoded arguments for object-plus-timeout syscalls.
#[derive(Clone, Debug)]
pub struct ObjectWaitArgs {
    pub object: abi::ObjectId,
    pub timeout: u32,
}

/// Decoded arguments for the event wait syscall.
#[derive(Clone, Debug)]
pub struct EventWaitArgs {
    pub object: abi::ObjectId,
    pub bits: u32,
    pub mode: u32,
    pub timeout: u32,
}

/// Decoded arguments for the event set/clear syscalls.
#[derive(Clone, Debug)]
pub struct EventBitsArgs {
    pub object: abi::ObjectId,
    pub bits: u32,
}

/// Decoded arguments for the notification take syscall.
#[derive(Clone, Debug)]
pub struct NotifyTakeArgs {
    pub clear_all: bool,
    pub timeout: u32,
}

/// Decoded arguments for the priority set syscall.
#[derive(Clone, Debug)]
pub struct PrioritySetArgs {
    pub task: TaskId,
    pub priority: u64,
}

/// Decoded arguments for the task status query syscall.
#[derive(Clone, Debug)]
pub struct TaskInfoArgs {
    pub task: TaskId,
    pub buffer: Result<USlice<abi::TaskStatus>, UsageError>,
}

/// Scans all tasks and handles any with expired deadlines: sleeps complete
/// successfully, blocking waits report a timeout, and anything else just has
/// the stale deadline dropped.
///
/// The returned hint is `Other` if any task woke, since it might be more
/// important than whatever is current.
pub fn process_timers(
    tasks: &mut [Task],
    trace: &mut Trace,
    current_time: Timestamp,
) -> NextTask {
    let mut sched_hint = NextTask::Same;
    for (index, task) in tasks.iter_mut().enumerate() {
        let Some(deadline) = task.deadline() else {
            continue;
        };
        if deadline > current_time {
            continue;
        }
        let state = *task.state();
        let hint = if state == TaskState::Healthy(SchedState::InSleep) {
            task.save_mut().set_success_response(0);
            task.make_runnable();
            NextTask::Other
        } else if state.is_in_timed_wait() {
            task.save_mut().set_error_response(TIMEOUT);
            task.make_runnable();
            trace.record(Event::Timeout(index as u16));
            NextTask::Other
        } else {
            // A deadline on a task that isn't waiting is stale; suspend and
            // deletion paths are supposed to clear it, so grumble.
            klog!("stale deadline on task {}", index);
            task.clear_deadline();
            NextTask::Same
        };
        sched_hint = sched_hint.combine(hint);
    }
    sched_hint
}

/// Checks a user-provided `TaskId` against the task table.
///
/// On success, returns the table index it names. Names that parse but refer
/// to a departed task (stale generation, or a slot that is simply vacant)
/// produce the recoverable dead code carrying the current generation, so the
/// caller can learn about the death.
pub fn check_task_id_against_table(
    tasks: &[Task],
    id: TaskId,
) -> Result<usize, UserError> {
    let index = id.index();
    if index >= tasks.len() {
        return Err(FaultInfo::SyscallUsage(UsageError::TaskOutOfRange).into());
    }

    let task = &tasks[index];
    if task.is_vacant() || task.generation() != id.generation() {
        return Err(UserError::Recoverable(
            abi::dead_response_code(task.generation()),
            NextTask::Same,
        ));
    }

    Ok(index)
}

/// Selects the next task to run after `previous`, which is the most
/// important runnable task, rotating among its equals.
///
/// # Panics
///
/// If no task is runnable. The idle task exists precisely so that this
/// cannot happen; reaching the panic means the task table is corrupt.
pub fn select(previous: usize, tasks: &[Task]) -> usize {
    match kerncore::priority_scan(previous, tasks, |t| t.is_runnable()) {
        Some((index, _)) => index,
        None => panic!(),
    }
}

/// Forces the task at `index` into a faulted state, recording the state it
/// was in when the fault hit. A faulted task never runs again.
///
/// Returns a `NextTask` under the assumption that, if you're hitting tasks
/// with faults, at least one of them is probably the current task; this
/// makes it harder to forget to request rescheduling. If you're faulting
/// some other task you can explicitly ignore the result.
pub fn force_fault(
    tasks: &mut [Task],
    trace: &mut Trace,
    index: usize,
    fault: FaultInfo,
) -> NextTask {
    klog!("task {} fault: {:?}", index, fault);
    trace.record(Event::Fault(index as u16));

    let task = &mut tasks[index];
    task.clear_deadline();
    task.state = match task.state {
        TaskState::Healthy(sched) => TaskState::Faulted {
            original_state: sched,
            fault,
        },
        TaskState::Faulted { original_state, .. } => {
            // Double fault - fault while faulted
            // Original fault information is lost
            TaskState::Faulted {
                fault,
                original_state,
            }
        }
    };
    NextTask::Other
}

/// Produces a current `TaskId` (i.e. one with the correct generation) for
/// `tasks[index]`.
pub fn current_id(tasks: &[Task], index: usize) -> TaskId {
    TaskId::for_index_and_gen(index, tasks[index].generation())
}
