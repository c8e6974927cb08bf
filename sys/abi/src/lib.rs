// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel interface definitions, shared between the kernel, interrupt glue,
//! and debug tooling.

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Names a particular incarnation of a task.
///
/// A `TaskId` combines two fields, a task table index and a generation
/// number. The generation number begins counting at zero and wraps on
/// overflow. Critically, the generation number of a task slot is incremented
/// when the task occupying it is deleted, so a handle held across a
/// delete/create cycle stops working instead of silently naming an unrelated
/// task. Attempts to use an outdated generation return a dead code carrying
/// the new generation (see `dead_response_code`).
///
/// The task index is in the lower `TaskId::INDEX_BITS` bits, while the
/// generation is in the remaining top bits.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct TaskId(pub u16);

impl TaskId {
    /// The all-ones `TaskId` is reserved to mean "the calling task itself."
    /// Passing it to operations that take a target task (delete, suspend,
    /// priority changes) applies them to the caller.
    pub const SELF: Self = Self(!0);

    /// Number of bits in a `TaskId` used to represent the table index, rather
    /// than the generation number.
    pub const INDEX_BITS: u32 = 10;

    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u16 = (1 << Self::INDEX_BITS) - 1;

    /// Fabricates a `TaskId` for a known index and generation number.
    pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        TaskId(
            (index as u16 & Self::INDEX_MASK)
                | (gen.0 as u16) << Self::INDEX_BITS,
        )
    }

    /// Extracts the index part of this ID.
    pub fn index(&self) -> usize {
        usize::from(self.0 & Self::INDEX_MASK)
    }

    /// Extracts the generation part of this ID.
    pub fn generation(&self) -> Generation {
        Generation((self.0 >> Self::INDEX_BITS) as u8)
    }

    pub fn next_generation(self) -> Self {
        Self::for_index_and_gen(self.index(), self.generation().next())
    }
}

/// Names a particular incarnation of a synchronization object (queue,
/// semaphore, mutex, or event group).
///
/// Uses the same index+generation packing as `TaskId`, for the same reason:
/// a handle to a deleted object must fail visibly, not alias whatever object
/// gets created in the slot next.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct ObjectId(pub u16);

impl ObjectId {
    /// Number of index bits; matches `TaskId` so tooling can treat handles
    /// uniformly.
    pub const INDEX_BITS: u32 = 10;

    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u16 = (1 << Self::INDEX_BITS) - 1;

    /// Fabricates an `ObjectId` for a known index and generation number.
    pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        ObjectId(
            (index as u16 & Self::INDEX_MASK)
                | (gen.0 as u16) << Self::INDEX_BITS,
        )
    }

    /// Extracts the index part of this ID.
    pub fn index(&self) -> usize {
        usize::from(self.0 & Self::INDEX_MASK)
    }

    /// Extracts the generation part of this ID.
    pub fn generation(&self) -> Generation {
        Generation((self.0 >> Self::INDEX_BITS) as u8)
    }
}

/// Length of the fixed name field carried by each task, in bytes. Longer
/// names are silently truncated at creation.
pub const NAME_LEN: usize = 16;

/// Type used to track generation numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Generation(u8);

impl Generation {
    pub const ZERO: Self = Self(0);

    pub fn next(self) -> Self {
        const MASK: u16 = 0xFFFF << TaskId::INDEX_BITS >> TaskId::INDEX_BITS;
        Generation(self.0.wrapping_add(1) & MASK as u8)
    }
}

impl From<u8> for Generation {
    fn from(x: u8) -> Self {
        Self(x)
    }
}

/// Indicates priority of a task.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so Priority 0 is the most likely to be
/// scheduled, followed by 1, and so forth. An application's idle task should
/// carry the numerically largest priority it uses, so that it only runs when
/// nothing else can.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means numerically
/// greater / less important, or more important / numerically smaller.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
    Unaligned,
    Default,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

bitflags::bitflags! {
    /// Collection of boolean flags controlling task behavior, fixed at
    /// creation.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct TaskFlags: u32 {
        /// Task uses floating point / SIMD. The kernel keeps a full FP
        /// context for it; tasks without this flag trap on their first FP
        /// instruction.
        const USES_FPU = 1 << 0;

        const RESERVED = !1;
    }
}

/// Newtype wrapper for an interrupt index, as understood by the interrupt
/// controller (a GIC INTID on the supported SoCs).
#[derive(
    Copy, Clone, Debug, Serialize, Deserialize, Hash, Eq, PartialEq, Ord,
    PartialOrd,
)]
#[repr(transparent)]
pub struct InterruptNum(pub u32);

pub const FIRST_DEAD_CODE: u32 = 0xffff_ff00;

/// Response code returned by the kernel if an operation names a task or
/// object that has been deleted (its slot's generation has moved on).
///
/// This always has the top 24 bits set to 1, with the current `generation`
/// of the slot in the bottom 8 bits.
pub const fn dead_response_code(new_generation: Generation) -> u32 {
    FIRST_DEAD_CODE | new_generation.0 as u32
}

/// Utility for checking whether a code indicates a deleted peer, and
/// extracting the slot's current generation if it does.
pub const fn extract_new_generation(code: u32) -> Option<Generation> {
    if (code & FIRST_DEAD_CODE) == FIRST_DEAD_CODE {
        Some(Generation(code as u8))
    } else {
        None
    }
}

/// Response code for a wait whose tick budget ran out before the condition
/// was satisfied. Also produced when a wait is cancelled by suspension.
pub const TIMEOUT: u32 = 1;

/// Response code for a zero-budget operation that would have had to block.
pub const WOULD_BLOCK: u32 = 2;

/// Response code for a create operation that failed because a fixed resource
/// (task slots, object slots, arena bytes) is exhausted. Kernel state is
/// unchanged.
pub const EXHAUSTED: u32 = 3;

/// Response code for a misuse that has no task to fault, such as an
/// interrupt handler naming the wrong kind of object. Task-context syscalls
/// report these cases as faults instead.
pub const INVALID: u32 = 4;

/// Tick budget value meaning "wait forever." Any smaller value is a relative
/// tick count after which the operation completes with `TIMEOUT`.
pub const WAIT_FOREVER: u32 = !0;

/// Event wait mode bit: the wait completes only when every bit in the mask
/// is set, rather than any one of them.
pub const EVENT_WAIT_ALL: u32 = 1;

/// Event wait mode bit: the awaited mask is cleared from the group when the
/// wait completes.
pub const EVENT_CLEAR_ON_EXIT: u32 = 1 << 1;

/// State used to make scheduling decisions.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum TaskState {
    /// Task is healthy and can be scheduled subject to the `SchedState`
    /// requirements.
    Healthy(SchedState),
    /// Task has been stopped by a fault and must not be scheduled without
    /// intervention.
    Faulted {
        /// Information about the fault.
        fault: FaultInfo,
        /// Record of the previous healthy state at the time the fault was
        /// taken.
        original_state: SchedState,
    },
}

impl TaskState {
    /// Checks if a task in this state could be given the CPU.
    pub fn is_runnable(&self) -> bool {
        self == &TaskState::Healthy(SchedState::Runnable)
    }

    /// Checks if a task in this state is blocked waiting for space in queue
    /// `q`.
    pub fn is_awaiting_queue_space(&self, q: ObjectId) -> bool {
        self == &TaskState::Healthy(SchedState::InQueueSend(q))
    }

    /// Checks if a task in this state is blocked waiting for data in queue
    /// `q` (whether consuming or peeking).
    pub fn is_awaiting_queue_data(&self, q: ObjectId) -> bool {
        matches!(
            self,
            TaskState::Healthy(SchedState::InQueueRecv { object, .. })
                if *object == q
        )
    }

    /// Checks if a task in this state is blocked taking semaphore `s`.
    pub fn is_awaiting_semaphore(&self, s: ObjectId) -> bool {
        self == &TaskState::Healthy(SchedState::InSemTake(s))
    }

    /// Checks if a task in this state is blocked locking mutex `m`.
    pub fn is_awaiting_mutex(&self, m: ObjectId) -> bool {
        self == &TaskState::Healthy(SchedState::InMutexLock(m))
    }

    /// Checks if a task in this state can be unblocked by a notification.
    pub fn can_accept_notification(&self) -> bool {
        matches!(self, TaskState::Healthy(SchedState::InNotifyWait { .. }))
    }

    /// Checks if a task in this state is blocked on event group `e`.
    pub fn is_awaiting_events(&self, e: ObjectId) -> bool {
        matches!(
            self,
            TaskState::Healthy(SchedState::InEventWait { object, .. })
                if *object == e
        )
    }

    /// Checks if a task in this state is blocked on the object `o`, whatever
    /// its kind. Used to kick waiters when an object is deleted.
    pub fn is_awaiting_object(&self, o: ObjectId) -> bool {
        self.is_awaiting_queue_space(o)
            || self.is_awaiting_queue_data(o)
            || self.is_awaiting_semaphore(o)
            || self.is_awaiting_mutex(o)
            || self.is_awaiting_events(o)
    }

    /// Checks if a task in this state is blocked in any wait that a timeout
    /// can complete.
    pub fn is_in_timed_wait(&self) -> bool {
        matches!(
            self,
            TaskState::Healthy(
                SchedState::InSleep
                    | SchedState::InQueueSend(_)
                    | SchedState::InQueueRecv { .. }
                    | SchedState::InSemTake(_)
                    | SchedState::InMutexLock(_)
                    | SchedState::InNotifyWait { .. }
                    | SchedState::InEventWait { .. }
            )
        )
    }

    /// Encodes this state as a small integer for the `TaskStatus` dump
    /// record. Faulted states all map to 255.
    pub fn status_code(&self) -> u8 {
        match self {
            TaskState::Healthy(s) => match s {
                SchedState::Stopped => 0,
                SchedState::Runnable => 1,
                SchedState::InSleep => 2,
                SchedState::InQueueSend(_) => 3,
                SchedState::InQueueRecv { .. } => 4,
                SchedState::InSemTake(_) => 5,
                SchedState::InMutexLock(_) => 6,
                SchedState::InNotifyWait { .. } => 7,
                SchedState::InEventWait { .. } => 8,
                SchedState::Suspended => 9,
                SchedState::Defunct => 10,
            },
            TaskState::Faulted { .. } => 255,
        }
    }
}

impl Default for TaskState {
    fn default() -> Self {
        TaskState::Healthy(SchedState::Stopped)
    }
}

/// Scheduler parameters for a healthy task.
///
/// A task is in exactly one of these states at any time; entering a wait
/// records the awaited object right here, so there is no separate wait-list
/// membership to keep consistent.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum SchedState {
    /// This slot is vacant: never created, or deleted and reclaimed.
    Stopped,
    /// This task could be scheduled on the CPU. The running task is the
    /// runnable task currently chosen by the scheduler; there is no separate
    /// running state.
    Runnable,
    /// This task is sleeping until its deadline (relative or absolute delay).
    InSleep,
    /// This task is blocked waiting for space in the given queue.
    InQueueSend(ObjectId),
    /// This task is blocked waiting for data in the given queue. `peek`
    /// records whether the receive should leave the item in place.
    InQueueRecv { object: ObjectId, peek: bool },
    /// This task is blocked taking the given semaphore.
    InSemTake(ObjectId),
    /// This task is blocked locking the given mutex.
    InMutexLock(ObjectId),
    /// This task is blocked waiting for its notification counter to become
    /// nonzero. `clear_on_exit` records whether the wake consumes the whole
    /// counter or a single count.
    InNotifyWait { clear_on_exit: bool },
    /// This task is blocked waiting for bits in the given event group.
    InEventWait {
        object: ObjectId,
        mask: u32,
        wait_all: bool,
        clear_on_exit: bool,
    },
    /// This task has been explicitly suspended and will not run, time out,
    /// or be woken by objects until resumed.
    Suspended,
    /// This task deleted itself and awaits idle-time reclamation.
    Defunct,
}

impl From<SchedState> for TaskState {
    fn from(s: SchedState) -> Self {
        Self::Healthy(s)
    }
}

/// A record describing a fault taken by a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum FaultInfo {
    /// The task has violated memory access rules, either by touching memory
    /// the hardware rejected (`source` `User`) or by passing the kernel a
    /// reference to it (`source` `Kernel`).
    MemoryAccess {
        /// Problematic address, when the fault syndrome provides one.
        address: Option<u64>,
        /// Origin of the fault.
        source: FaultSource,
    },
    /// Execution of an illegal or trapped instruction. This includes FP/SIMD
    /// use by a task created without `TaskFlags::USES_FPU`.
    IllegalInstruction,
    /// Other invalid operation, with the raw exception syndrome for
    /// diagnosis.
    InvalidOperation(u64),
    /// Arguments passed to a syscall were invalid.
    SyscallUsage(UsageError),
    /// A task has explicitly aborted itself with a panic.
    Panic,
    /// A task's entry function returned. Entry functions must not return;
    /// the initial frame's return address lands here.
    EntryReturned,
}

impl From<UsageError> for FaultInfo {
    fn from(e: UsageError) -> Self {
        Self::SyscallUsage(e)
    }
}

/// A kernel-defined fault, arising from how a user task behaved.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum UsageError {
    /// A program used an undefined syscall number.
    BadSyscallNumber,
    /// A program specified a slice as a syscall argument, but the slice is
    /// patently invalid: it would wrap around the end of the address space,
    /// or its length doesn't match the object's item size. Neither of these
    /// conditions is ever legal, so this represents a malfunction in the
    /// caller.
    InvalidSlice,
    /// A program named a task ID that will never be valid, as it's out of
    /// range for the task table.
    TaskOutOfRange,
    /// A program named an object ID that will never be valid, as it's out of
    /// range for the object table.
    ObjectOutOfRange,
    /// A program named a live object of the wrong kind, e.g. passed a
    /// semaphore handle to a queue operation.
    WrongObjectKind,
    /// A program named a valid task, but attempted an operation on it that
    /// is forbidden, such as resuming a task that is not suspended.
    IllegalTask,
    /// A program attempted to unlock a mutex it does not own.
    NotOwner,
    /// A scalar argument was out of range: zero-capacity queue, zero item
    /// size, zero-length stack, and the like.
    BadArgument,
}

/// Origin of a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum FaultSource {
    /// User code did something that was intercepted by the processor.
    User,
    /// User code asked the kernel to do something bad on its behalf.
    Kernel,
}

/// Task status record filled in by the `TaskInfo` syscall, for debuggers and
/// supervisory tasks.
#[derive(
    Copy, Clone, Debug, Default, IntoBytes, FromBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct TaskStatus {
    /// Ticks during which this task was the running task.
    pub runtime_ticks: u64,
    /// Size of the task's stack carve, in bytes.
    pub stack_size: u32,
    /// Highest observed stack use, in bytes, sampled from the stack pointer
    /// at kernel entries. Zero if the kernel was built without
    /// `stack-watermark`.
    pub stack_high_water: u32,
    /// Task name, NUL-padded.
    pub name: [u8; NAME_LEN],
    /// Base (assigned) priority.
    pub base_priority: u8,
    /// Effective priority, differing from base only under priority
    /// inheritance.
    pub priority: u8,
    /// Encoded scheduling state; see `TaskState::status_code`.
    pub state: u8,
    /// Number of mutexes this task currently owns.
    pub held_mutexes: u8,
    /// Reserved word, must be zero.
    pub reserved_zero: u32,
}

/// Enumeration of syscall numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysnum {
    TaskCreate = 0,
    TaskDelete = 1,
    Sleep = 2,
    SleepUntil = 3,
    Yield = 4,
    PriorityGet = 5,
    PrioritySet = 6,
    Suspend = 7,
    Resume = 8,
    QueueCreate = 9,
    QueueSend = 10,
    QueueRecv = 11,
    QueuePeek = 12,
    SemCreate = 13,
    SemTake = 14,
    SemGive = 15,
    MutexCreate = 16,
    MutexLock = 17,
    MutexUnlock = 18,
    NotifyGive = 19,
    NotifyTake = 20,
    EventCreate = 21,
    EventWait = 22,
    EventSet = 23,
    EventClear = 24,
    GetTicks = 25,
    TaskInfo = 26,
    Reap = 27,
    ObjectDelete = 28,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't currently depend on
/// `num-traits` and this seems okay.
impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::TaskCreate),
            1 => Ok(Self::TaskDelete),
            2 => Ok(Self::Sleep),
            3 => Ok(Self::SleepUntil),
            4 => Ok(Self::Yield),
            5 => Ok(Self::PriorityGet),
            6 => Ok(Self::PrioritySet),
            7 => Ok(Self::Suspend),
            8 => Ok(Self::Resume),
            9 => Ok(Self::QueueCreate),
            10 => Ok(Self::QueueSend),
            11 => Ok(Self::QueueRecv),
            12 => Ok(Self::QueuePeek),
            13 => Ok(Self::SemCreate),
            14 => Ok(Self::SemTake),
            15 => Ok(Self::SemGive),
            16 => Ok(Self::MutexCreate),
            17 => Ok(Self::MutexLock),
            18 => Ok(Self::MutexUnlock),
            19 => Ok(Self::NotifyGive),
            20 => Ok(Self::NotifyTake),
            21 => Ok(Self::EventCreate),
            22 => Ok(Self::EventWait),
            23 => Ok(Self::EventSet),
            24 => Ok(Self::EventClear),
            25 => Ok(Self::GetTicks),
            26 => Ok(Self::TaskInfo),
            27 => Ok(Self::Reap),
            28 => Ok(Self::ObjectDelete),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_packing_round_trips() {
        for index in [0_usize, 1, 17, 1023] {
            for gen in [0_u8, 1, 63] {
                let id =
                    TaskId::for_index_and_gen(index, Generation::from(gen));
                assert_eq!(id.index(), index);
                assert_eq!(id.generation(), Generation::from(gen));
            }
        }
    }

    #[test]
    fn generation_wraps_within_field() {
        let mut gen = Generation::ZERO;
        for _ in 0..63 {
            gen = gen.next();
        }
        assert_eq!(gen.next(), Generation::ZERO);
    }

    #[test]
    fn dead_codes_round_trip_generation() {
        let gen = Generation::from(9);
        let code = dead_response_code(gen);
        assert_eq!(extract_new_generation(code), Some(gen));
        assert_eq!(extract_new_generation(TIMEOUT), None);
        assert_eq!(extract_new_generation(0), None);
    }

    #[test]
    fn importance_is_numerically_inverted() {
        assert!(Priority(0).is_more_important_than(Priority(1)));
        assert!(!Priority(1).is_more_important_than(Priority(1)));
        assert!(!Priority(2).is_more_important_than(Priority(1)));
    }

    #[test]
    fn task_status_has_no_padding() {
        assert_eq!(core::mem::size_of::<TaskStatus>(), 40);
    }
}
