// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Syscall implementations.
//!
//! Architecture code calls [`handle_syscall`] with interrupts masked, after
//! saving the current task's context and pulling the syscall descriptor out
//! of it. Every operation here has the same shape: decode arguments from
//! the caller's saved registers, act on the kernel tables, and either write
//! results back into saved state or leave the caller blocked with the wait
//! recorded in its scheduling state. The returned hint goes to
//! [`Kernel::schedule`]; nothing in this module switches contexts itself.
//!
//! Two rules keep the hints honest. First, a wake hands over the CPU only
//! when it made a *strictly more important* task runnable -- rotation among
//! equals happens on the tick and on explicit yields, never as a side
//! effect of someone else's wake. Second, saved registers are only ever
//! written for tasks that are parked in a syscall; a task suspended from
//! plain user code keeps its registers untouched.
//!
//! The `*_from_isr` entry points at the bottom are for interrupt handlers.
//! They never block, and they report errors as bare response codes because
//! there is no caller to fault.

use core::convert::TryFrom;

use abi::{
    FaultInfo, ObjectId, Priority, SchedState, Sysnum, TaskFlags, TaskId,
    TaskState, UsageError,
};

use crate::err::UserError;
use crate::events;
use crate::kernel::{Kernel, IDLE_PRIORITY};
use crate::mutex::{self, Unlock};
use crate::objects::{self, Object};
use crate::queue;
use crate::semaphore::{self, Give};
use crate::task::{self, ArchState, NextTask};
use crate::time::Timestamp;
use crate::umem::{self, USlice};

/// Dispatches the syscall `sysnum` on behalf of the current task.
pub fn handle_syscall(kernel: &mut Kernel<'_>, sysnum: u32) -> NextTask {
    let result = match Sysnum::try_from(sysnum) {
        Ok(s) => dispatch(kernel, s),
        Err(_) => {
            Err(FaultInfo::SyscallUsage(UsageError::BadSyscallNumber).into())
        }
    };

    match result {
        Ok(hint) => hint,
        Err(UserError::Recoverable(code, hint)) => {
            let caller = kernel.current;
            kernel.tasks[caller].save_mut().set_error_response(code);
            hint
        }
        Err(UserError::Unrecoverable(fault)) => {
            kernel.force_fault(kernel.current, fault)
        }
    }
}

fn dispatch(k: &mut Kernel<'_>, sysnum: Sysnum) -> Result<NextTask, UserError> {
    match sysnum {
        Sysnum::TaskCreate => task_create(k),
        Sysnum::TaskDelete => task_delete(k),
        Sysnum::Sleep => sleep(k),
        Sysnum::SleepUntil => sleep_until(k),
        Sysnum::Yield => yield_cpu(k),
        Sysnum::PriorityGet => priority_get(k),
        Sysnum::PrioritySet => priority_set(k),
        Sysnum::Suspend => suspend(k),
        Sysnum::Resume => resume(k),
        Sysnum::QueueCreate => queue_create(k),
        Sysnum::QueueSend => queue_send(k),
        Sysnum::QueueRecv => queue_recv(k),
        Sysnum::QueuePeek => queue_peek(k),
        Sysnum::SemCreate => sem_create(k),
        Sysnum::SemTake => sem_take(k),
        Sysnum::SemGive => sem_give(k),
        Sysnum::MutexCreate => mutex_create(k),
        Sysnum::MutexLock => mutex_lock(k),
        Sysnum::MutexUnlock => mutex_unlock(k),
        Sysnum::NotifyGive => notify_give(k),
        Sysnum::NotifyTake => notify_take(k),
        Sysnum::EventCreate => event_create(k),
        Sysnum::EventWait => event_wait(k),
        Sysnum::EventSet => event_set(k),
        Sysnum::EventClear => event_clear(k),
        Sysnum::GetTicks => get_ticks(k),
        Sysnum::TaskInfo => task_info(k),
        Sysnum::Reap => reap(k),
        Sysnum::ObjectDelete => object_delete(k),
    }
}

/// Resolves a user-provided task handle, honoring the `SELF` shorthand.
fn resolve_task_id(k: &Kernel<'_>, id: TaskId) -> Result<usize, UserError> {
    if id == TaskId::SELF {
        Ok(k.current)
    } else {
        task::check_task_id_against_table(k.tasks, id)
    }
}

/// Blocks the current task in `state` until it is woken, or until `timeout`
/// ticks pass. Callers deal with `timeout == 0` before coming here.
fn block_current(
    k: &mut Kernel<'_>,
    state: SchedState,
    timeout: u32,
) -> NextTask {
    let deadline = if timeout == abi::WAIT_FOREVER {
        None
    } else {
        Some(k.now.plus_ticks(timeout))
    };
    let seq = k.stamp();
    let caller = k.current;
    k.tasks[caller].block(seq, state, deadline);
    NextTask::Other
}

fn task_create(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let args = k.tasks[caller].save().as_task_create_args();

    let name_slice = args.name?;
    let mut name = [0; abi::NAME_LEN];
    // Safety: the slice passed structural checks, and in the flat address
    // space that is the whole readability story.
    let used = unsafe { umem::copy_from_task(&name_slice, &mut name) };

    let priority =
        u8::try_from(args.priority).map_err(|_| UsageError::BadArgument)?;
    let flags = u32::try_from(args.flags)
        .ok()
        .and_then(TaskFlags::from_bits)
        .ok_or(UsageError::BadArgument)?;

    let id = k.create_task(
        &name[..used],
        Priority(priority),
        args.stack_size,
        args.entry,
        args.argument,
        flags,
    )?;
    k.tasks[caller].save_mut().set_success_response(u64::from(id.0));
    Ok(k.preemption_hint(NextTask::Other))
}

/// Force-releases every mutex held by the task at `owner`, on its way out
/// of the system. Each mutex transfers to its best waiter or goes free.
fn release_held_mutexes(k: &mut Kernel<'_>, owner: usize) -> NextTask {
    let mut hint = NextTask::Same;
    for oi in 0..k.objects.len() {
        let mut m = match k.objects[oi].object() {
            Object::Mutex(m) if m.owner() == Some(owner) => *m,
            _ => continue,
        };
        let oid = objects::current_object_id(k.objects, oi);
        let outcome = mutex::release_for_delete(&mut m, oid, k.tasks);
        if let Object::Mutex(slot) = k.objects[oi].object_mut() {
            *slot = m;
        }
        if let Unlock::Transferred(wi) = outcome {
            mutex::rederive_priority(k.objects, k.tasks, wi);
            hint = hint.combine(NextTask::Other);
        }
    }
    hint
}

fn task_delete(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let id = TaskId(k.tasks[caller].save().arg0() as u16);
    let target = resolve_task_id(k, id)?;

    if k.tasks[target].priority() == IDLE_PRIORITY {
        return Err(UsageError::IllegalTask.into());
    }

    // Held mutexes leave with their owner rather than dangling behind it.
    let wake_hint = release_held_mutexes(k, target);

    if target == caller {
        // Self-delete: this stack is in use right now, so reclamation
        // waits until the scheduler reaches idle.
        k.tasks[caller].set_healthy_state(SchedState::Defunct);
        return Ok(NextTask::Other);
    }

    k.reap_one(target);
    k.tasks[caller].save_mut().set_success_response(0);
    Ok(k.preemption_hint(wake_hint))
}

fn sleep(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let ticks = k.tasks[caller].save().arg0() as u32;
    if ticks == 0 {
        // Sleeping for zero ticks is just a yield.
        k.tasks[caller].save_mut().set_success_response(0);
        return Ok(NextTask::Other);
    }
    Ok(block_current(k, SchedState::InSleep, ticks))
}

fn sleep_until(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let target = Timestamp::from(k.tasks[caller].save().arg0());
    if target <= k.now {
        // Already there; this is not an error.
        k.tasks[caller].save_mut().set_success_response(0);
        return Ok(NextTask::Same);
    }
    let seq = k.stamp();
    k.tasks[caller].block(seq, SchedState::InSleep, Some(target));
    Ok(NextTask::Other)
}

fn yield_cpu(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    k.tasks[caller].save_mut().set_success_response(0);
    // The scheduler's wrapping scan does the actual rotation.
    Ok(NextTask::Other)
}

fn priority_get(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let id = TaskId(k.tasks[caller].save().arg0() as u16);
    let target = resolve_task_id(k, id)?;
    let p = k.tasks[target].priority();
    k.tasks[caller].save_mut().set_success_response(u64::from(p.0));
    Ok(NextTask::Same)
}

fn priority_set(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let args = k.tasks[caller].save().as_priority_set_args();
    let target = resolve_task_id(k, args.task)?;

    let p = u8::try_from(args.priority).map_err(|_| UsageError::BadArgument)?;
    let p = Priority(p);
    if !p.is_more_important_than(IDLE_PRIORITY) {
        return Err(UsageError::BadArgument.into());
    }
    if k.tasks[target].priority() == IDLE_PRIORITY {
        return Err(UsageError::IllegalTask.into());
    }

    k.tasks[target].set_base_priority(p);
    // Effective priority follows the base, except where inheritance still
    // pins it up.
    mutex::rederive_priority(k.objects, k.tasks, target);

    k.tasks[caller].save_mut().set_success_response(0);
    Ok(k.preemption_hint(NextTask::Other))
}

fn suspend(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let id = TaskId(k.tasks[caller].save().arg0() as u16);
    let target = resolve_task_id(k, id)?;

    if k.tasks[target].priority() == IDLE_PRIORITY {
        return Err(UsageError::IllegalTask.into());
    }

    let state = *k.tasks[target].state();
    match state {
        TaskState::Healthy(SchedState::Suspended) => {
            // Already suspended; nothing to do.
        }
        TaskState::Healthy(SchedState::Runnable) if target == caller => {
            // Park ourselves. Our success result goes in now, because we
            // won't pass this way again until someone resumes us.
            k.tasks[caller].save_mut().set_success_response(0);
            k.tasks[caller].set_healthy_state(SchedState::Suspended);
            return Ok(NextTask::Other);
        }
        TaskState::Healthy(SchedState::Runnable) => {
            // Preempted somewhere in user code; registers are not ours to
            // touch.
            k.tasks[target].set_healthy_state(SchedState::Suspended);
        }
        TaskState::Healthy(_) if state.is_in_timed_wait() => {
            // Cancel the wait. The task will report a timeout whenever it
            // next runs, which is as close as a cancelled wait can honestly
            // get.
            k.tasks[target].save_mut().set_error_response(abi::TIMEOUT);
            k.tasks[target].clear_deadline();
            k.tasks[target].set_healthy_state(SchedState::Suspended);
        }
        _ => return Err(UsageError::IllegalTask.into()),
    }

    k.tasks[caller].save_mut().set_success_response(0);
    Ok(NextTask::Same)
}

fn resume(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let id = TaskId(k.tasks[caller].save().arg0() as u16);
    let target = resolve_task_id(k, id)?;

    if *k.tasks[target].state() != TaskState::Healthy(SchedState::Suspended) {
        return Err(UsageError::IllegalTask.into());
    }
    // Deliberately no register writes here: if the wait was cancelled at
    // suspend time its result is already in place, and a task suspended
    // from plain user code has no syscall to return from.
    k.tasks[target].make_runnable();

    k.tasks[caller].save_mut().set_success_response(0);
    Ok(k.preemption_hint(NextTask::Specific(target)))
}

fn queue_create(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let args = k.tasks[caller].save().as_queue_create_args();
    let id = k.create_queue(args.capacity, args.item_size)?;
    k.tasks[caller].save_mut().set_success_response(u64::from(id.0));
    Ok(NextTask::Same)
}

fn queue_send(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let args = k.tasks[caller].save().as_queue_transfer_args();
    let qi = objects::check_object_id(k.objects, args.object)?;
    let item_size = k.objects[qi].object().queue()?.item_size();
    let buf = USlice::<u8>::from_raw(args.buffer_base, item_size)?;

    let q = k.objects[qi].object_mut().queue_mut()?;
    if q.is_full() {
        if args.timeout == 0 {
            return Err(UserError::Recoverable(
                abi::WOULD_BLOCK,
                NextTask::Same,
            ));
        }
        return Ok(block_current(
            k,
            SchedState::InQueueSend(args.object),
            args.timeout,
        ));
    }

    // Safety: flat address space; the slice passed structural checks.
    unsafe {
        umem::copy_from_task(&buf, q.push_slot(&mut k.arena));
    }
    // The new item may complete a blocked receiver.
    let hint =
        queue::settle(q, args.object, k.tasks, &mut k.trace, &mut k.arena);
    k.tasks[caller].save_mut().set_success_response(0);
    Ok(k.preemption_hint(hint))
}

fn queue_recv(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let args = k.tasks[caller].save().as_queue_transfer_args();
    let qi = objects::check_object_id(k.objects, args.object)?;
    let item_size = k.objects[qi].object().queue()?.item_size();
    let mut buf = USlice::<u8>::from_raw(args.buffer_base, item_size)?;

    let q = k.objects[qi].object_mut().queue_mut()?;
    if q.is_empty() {
        if args.timeout == 0 {
            return Err(UserError::Recoverable(
                abi::WOULD_BLOCK,
                NextTask::Same,
            ));
        }
        return Ok(block_current(
            k,
            SchedState::InQueueRecv {
                object: args.object,
                peek: false,
            },
            args.timeout,
        ));
    }

    // Safety: flat address space; the slice passed structural checks.
    unsafe {
        umem::copy_to_task(q.take_slot(&k.arena), &mut buf);
    }
    // The freed slot may admit a blocked sender.
    let hint =
        queue::settle(q, args.object, k.tasks, &mut k.trace, &mut k.arena);
    k.tasks[caller].save_mut().set_success_response(0);
    Ok(k.preemption_hint(hint))
}

fn queue_peek(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let args = k.tasks[caller].save().as_queue_transfer_args();
    let qi = objects::check_object_id(k.objects, args.object)?;
    let q = k.objects[qi].object().queue()?;
    let mut buf = USlice::<u8>::from_raw(args.buffer_base, q.item_size())?;

    if q.is_empty() {
        if args.timeout == 0 {
            return Err(UserError::Recoverable(
                abi::WOULD_BLOCK,
                NextTask::Same,
            ));
        }
        return Ok(block_current(
            k,
            SchedState::InQueueRecv {
                object: args.object,
                peek: true,
            },
            args.timeout,
        ));
    }

    // Safety: flat address space; the slice passed structural checks.
    unsafe {
        umem::copy_to_task(q.peek_slot(&k.arena), &mut buf);
    }
    k.tasks[caller].save_mut().set_success_response(0);
    Ok(NextTask::Same)
}

fn sem_create(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let args = k.tasks[caller].save().as_sem_create_args();
    let id = k.create_semaphore(args.max, args.initial)?;
    k.tasks[caller].save_mut().set_success_response(u64::from(id.0));
    Ok(NextTask::Same)
}

fn sem_take(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let args = k.tasks[caller].save().as_object_wait_args();
    let si = objects::check_object_id(k.objects, args.object)?;

    let sem = k.objects[si].object_mut().semaphore_mut()?;
    if sem.try_take() {
        k.tasks[caller].save_mut().set_success_response(0);
        return Ok(NextTask::Same);
    }
    if args.timeout == 0 {
        return Err(UserError::Recoverable(abi::WOULD_BLOCK, NextTask::Same));
    }
    Ok(block_current(
        k,
        SchedState::InSemTake(args.object),
        args.timeout,
    ))
}

fn sem_give(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let args = k.tasks[caller].save().as_object_wait_args();
    let si = objects::check_object_id(k.objects, args.object)?;

    let sem = k.objects[si].object_mut().semaphore_mut()?;
    let hint = match semaphore::give(sem, args.object, k.tasks) {
        Give::Transferred => k.preemption_hint(NextTask::Other),
        Give::Counted => NextTask::Same,
        Give::Full => {
            return Err(UserError::Recoverable(
                abi::WOULD_BLOCK,
                NextTask::Same,
            ));
        }
    };
    k.tasks[caller].save_mut().set_success_response(0);
    Ok(hint)
}

fn mutex_create(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let inherit = k.tasks[caller].save().arg0() != 0;
    let id = k.create_mutex(inherit)?;
    k.tasks[caller].save_mut().set_success_response(u64::from(id.0));
    Ok(NextTask::Same)
}

fn mutex_lock(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let args = k.tasks[caller].save().as_object_wait_args();
    let mi = objects::check_object_id(k.objects, args.object)?;

    let mut m = *k.objects[mi].object().mutex()?;
    if m.try_lock(caller) {
        *k.objects[mi].object_mut().mutex_mut()? = m;
        k.tasks[caller].save_mut().set_success_response(0);
        return Ok(NextTask::Same);
    }
    if args.timeout == 0 {
        return Err(UserError::Recoverable(abi::WOULD_BLOCK, NextTask::Same));
    }

    let hint =
        block_current(k, SchedState::InMutexLock(args.object), args.timeout);
    mutex::inherit_on_block(&m, caller, k.tasks);
    Ok(hint)
}

fn mutex_unlock(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let args = k.tasks[caller].save().as_object_wait_args();
    let mi = objects::check_object_id(k.objects, args.object)?;

    let mut m = *k.objects[mi].object().mutex()?;
    let outcome = mutex::unlock(&mut m, args.object, caller, k.tasks)?;
    *k.objects[mi].object_mut().mutex_mut()? = m;

    if outcome != Unlock::StillHeld {
        // The waiter picture changed: the old owner may deflate toward its
        // base, and a new owner may immediately inherit from waiters left
        // behind on its other mutexes.
        mutex::rederive_priority(k.objects, k.tasks, caller);
    }
    if let Unlock::Transferred(wi) = outcome {
        mutex::rederive_priority(k.objects, k.tasks, wi);
    }

    k.tasks[caller].save_mut().set_success_response(0);
    let hint = match outcome {
        Unlock::StillHeld => NextTask::Same,
        _ => k.preemption_hint(NextTask::Other),
    };
    Ok(hint)
}

fn notify_give(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let id = TaskId(k.tasks[caller].save().arg0() as u16);
    let target = resolve_task_id(k, id)?;

    let woke = k.tasks[target].give_notification();
    k.tasks[caller].save_mut().set_success_response(0);
    if woke {
        Ok(k.preemption_hint(NextTask::Specific(target)))
    } else {
        Ok(NextTask::Same)
    }
}

fn notify_take(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let args = k.tasks[caller].save().as_notify_take_args();

    if k.tasks[caller].notifications() > 0 {
        let value = k.tasks[caller].consume_notifications(args.clear_all);
        k.tasks[caller].save_mut().set_success_response(u64::from(value));
        return Ok(NextTask::Same);
    }
    if args.timeout == 0 {
        return Err(UserError::Recoverable(abi::WOULD_BLOCK, NextTask::Same));
    }
    Ok(block_current(
        k,
        SchedState::InNotifyWait {
            clear_on_exit: args.clear_all,
        },
        args.timeout,
    ))
}

fn event_create(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let id = k.create_event_group()?;
    k.tasks[caller].save_mut().set_success_response(u64::from(id.0));
    Ok(NextTask::Same)
}

fn event_wait(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let args = k.tasks[caller].save().as_event_wait_args();
    let ei = objects::check_object_id(k.objects, args.object)?;

    let known = abi::EVENT_WAIT_ALL | abi::EVENT_CLEAR_ON_EXIT;
    if args.bits == 0 || args.mode & !known != 0 {
        return Err(UsageError::BadArgument.into());
    }
    let wait_all = args.mode & abi::EVENT_WAIT_ALL != 0;
    let clear_on_exit = args.mode & abi::EVENT_CLEAR_ON_EXIT != 0;

    let eg = k.objects[ei].object_mut().event_group_mut()?;
    let current_bits = eg.bits();
    if events::satisfied(current_bits, args.bits, wait_all) {
        if clear_on_exit {
            eg.clear_bits(args.bits);
        }
        k.tasks[caller]
            .save_mut()
            .set_success_response(u64::from(current_bits));
        return Ok(NextTask::Same);
    }
    if args.timeout == 0 {
        return Err(UserError::Recoverable(abi::WOULD_BLOCK, NextTask::Same));
    }
    Ok(block_current(
        k,
        SchedState::InEventWait {
            object: args.object,
            mask: args.bits,
            wait_all,
            clear_on_exit,
        },
        args.timeout,
    ))
}

fn event_set(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let args = k.tasks[caller].save().as_event_bits_args();
    let ei = objects::check_object_id(k.objects, args.object)?;

    let eg = k.objects[ei].object_mut().event_group_mut()?;
    let hint = events::set_bits(eg, args.object, args.bits, k.tasks);
    let after = eg.bits();
    k.tasks[caller].save_mut().set_success_response(u64::from(after));
    Ok(k.preemption_hint(hint))
}

fn event_clear(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let args = k.tasks[caller].save().as_event_bits_args();
    let ei = objects::check_object_id(k.objects, args.object)?;
    let prior = k.objects[ei]
        .object_mut()
        .event_group_mut()?
        .clear_bits(args.bits);
    k.tasks[caller].save_mut().set_success_response(u64::from(prior));
    Ok(NextTask::Same)
}

fn get_ticks(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let now = u64::from(k.now);
    k.tasks[caller].save_mut().set_success_response(now);
    Ok(NextTask::Same)
}

fn task_info(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let args = k.tasks[caller].save().as_task_info_args();
    let target = resolve_task_id(k, args.task)?;
    let mut buf = args.buffer?;

    let status = k.task_status(target);
    // Safety: flat address space; the slice passed structural checks.
    let dest = unsafe { buf.assume_writable() };
    dest[0] = status;

    k.tasks[caller].save_mut().set_success_response(0);
    Ok(NextTask::Same)
}

fn reap(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let id = TaskId(k.tasks[caller].save().arg0() as u16);
    let target = resolve_task_id(k, id)?;

    if !k.tasks[target].is_defunct() {
        return Err(UsageError::IllegalTask.into());
    }
    k.reap_one(target);
    k.tasks[caller].save_mut().set_success_response(0);
    Ok(NextTask::Same)
}

fn object_delete(k: &mut Kernel<'_>) -> Result<NextTask, UserError> {
    let caller = k.current;
    let id = ObjectId(k.tasks[caller].save().arg0() as u16);
    let oi = objects::check_object_id(k.objects, id)?;

    // Deleting a held mutex leaves its owner's elevation without a cause;
    // note the owner so we can re-derive after the object is gone.
    let held_by = match k.objects[oi].object() {
        Object::Mutex(m) => m.owner(),
        _ => None,
    };

    let hint = k.delete_object(oi);
    if let Some(owner) = held_by {
        mutex::rederive_priority(k.objects, k.tasks, owner);
    }

    k.tasks[caller].save_mut().set_success_response(0);
    Ok(k.preemption_hint(hint))
}

/// Converts an internal error into the bare response code used by the
/// interrupt-context entry points, which have no task to fault.
fn isr_code(e: UserError) -> u32 {
    match e {
        UserError::Recoverable(code, _) => code,
        UserError::Unrecoverable(_) => abi::INVALID,
    }
}

/// Sends exactly one item to a queue from interrupt context.
///
/// Never blocks: a full queue reports `WOULD_BLOCK`. `Ok(true)` means the
/// send woke a task that outranks the interrupted one, and the interrupt
/// exit path should go through the scheduler.
pub fn queue_send_from_isr(
    k: &mut Kernel<'_>,
    object: ObjectId,
    data: &[u8],
) -> Result<bool, u32> {
    let qi = objects::check_object_id(k.objects, object).map_err(isr_code)?;
    let q = k.objects[qi].object_mut().queue_mut().map_err(isr_code)?;
    if data.len() != q.item_size() {
        return Err(abi::INVALID);
    }
    if q.is_full() {
        return Err(abi::WOULD_BLOCK);
    }

    q.push_slot(&mut k.arena).copy_from_slice(data);
    let hint = queue::settle(q, object, k.tasks, &mut k.trace, &mut k.arena);
    Ok(k.preemption_hint(hint) != NextTask::Same)
}

/// Receives one item from a queue into `out` from interrupt context. Never
/// blocks: an empty queue reports `WOULD_BLOCK`.
pub fn queue_recv_from_isr(
    k: &mut Kernel<'_>,
    object: ObjectId,
    out: &mut [u8],
) -> Result<bool, u32> {
    let qi = objects::check_object_id(k.objects, object).map_err(isr_code)?;
    let q = k.objects[qi].object_mut().queue_mut().map_err(isr_code)?;
    if out.len() != q.item_size() {
        return Err(abi::INVALID);
    }
    if q.is_empty() {
        return Err(abi::WOULD_BLOCK);
    }

    out.copy_from_slice(q.take_slot(&k.arena));
    let hint = queue::settle(q, object, k.tasks, &mut k.trace, &mut k.arena);
    Ok(k.preemption_hint(hint) != NextTask::Same)
}

/// Gives a semaphore from interrupt context. A semaphore already at its
/// maximum reports `WOULD_BLOCK`, like a full queue.
pub fn sem_give_from_isr(
    k: &mut Kernel<'_>,
    object: ObjectId,
) -> Result<bool, u32> {
    let si = objects::check_object_id(k.objects, object).map_err(isr_code)?;
    let sem = k.objects[si]
        .object_mut()
        .semaphore_mut()
        .map_err(isr_code)?;
    let hint = match semaphore::give(sem, object, k.tasks) {
        Give::Transferred => NextTask::Other,
        Give::Counted => NextTask::Same,
        Give::Full => return Err(abi::WOULD_BLOCK),
    };
    Ok(k.preemption_hint(hint) != NextTask::Same)
}

/// Posts a notification to a task from interrupt context.
pub fn notify_give_from_isr(
    k: &mut Kernel<'_>,
    id: TaskId,
) -> Result<bool, u32> {
    if id == TaskId::SELF {
        // There is no self in an interrupt handler.
        return Err(abi::INVALID);
    }
    let target =
        task::check_task_id_against_table(k.tasks, id).map_err(isr_code)?;
    let woke = k.tasks[target].give_notification();
    if !woke {
        return Ok(false);
    }
    Ok(k.preemption_hint(NextTask::Specific(target)) != NextTask::Same)
}

/// Sets event bits from interrupt context.
pub fn event_set_from_isr(
    k: &mut Kernel<'_>,
    object: ObjectId,
    bits: u32,
) -> Result<bool, u32> {
    let ei = objects::check_object_id(k.objects, object).map_err(isr_code)?;
    let eg = k.objects[ei]
        .object_mut()
        .event_group_mut()
        .map_err(isr_code)?;
    let hint = events::set_bits(eg, object, bits, k.tasks);
    Ok(k.preemption_hint(hint) != NextTask::Same)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelStorage;
    use crate::task::MIN_STACK_SIZE;

    const ENTRY: u64 = 0x2000;
    const FOREVER: u64 = abi::WAIT_FOREVER as u64;

    fn boot(storage: &mut KernelStorage<8, 4, 16384>) -> Kernel<'_> {
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

    /// Runs a syscall as if `caller` had just trapped in with `args`.
    fn syscall(
        k: &mut Kernel<'_>,
        caller: usize,
        nr: Sysnum,
        args: &[u64],
    ) -> NextTask {
        k.current = caller;
        k.tasks[caller].save_mut().set_args(args);
        handle_syscall(k, nr as u32)
    }

    fn ret0(k: &Kernel<'_>, i: usize) -> u64 {
        k.tasks[i].save().ret0_value()
    }

    fn ret1(k: &Kernel<'_>, i: usize) -> u64 {
        k.tasks[i].save().ret1_value()
    }

    fn run_ticks(k: &mut Kernel<'_>, n: u32) {
        for _ in 0..n {
            let hint = k.tick();
            k.schedule(hint);
        }
    }

    fn id_of(k: &Kernel<'_>, i: usize) -> u64 {
        u64::from(task::current_id(k.tasks, i).0)
    }

    #[test]
    fn more_important_tasks_always_run_first() {
        let mut storage = KernelStorage::new();
        let mut k = boot(&mut storage);
        let hi = spawn(&mut k, b"hi", 2);
        let lo = spawn(&mut k, b"lo", 4);

        k.schedule(NextTask::Other);
        assert_eq!(k.current(), hi);
        run_ticks(&mut k, 5);
        assert_eq!(k.current(), hi);

        // Only when the important task blocks does the other run.
        let hint = syscall(&mut k, hi, Sysnum::Sleep, &[3]);
        k.schedule(hint);
        assert_eq!(k.current(), lo);

        // And its wake takes the CPU back immediately.
        run_ticks(&mut k, 3);
        assert_eq!(k.current(), hi);
        assert_eq!(ret0(&k, hi), 0);
    }

    #[test]
    fn semaphore_wakes_follow_priority_then_arrival() {
        let mut storage = KernelStorage::new();
        let mut k = boot(&mut storage);
        let giver = spawn(&mut k, b"giver", 1);
        let a = spawn(&mut k, b"a", 3);
        let b = spawn(&mut k, b"b", 3);
        let c = spawn(&mut k, b"c", 5);
        let sem = k.create_semaphore(4, 0).unwrap();
        let s = u64::from(sem.0);

        for &t in &[a, b, c] {
            let hint = syscall(&mut k, t, Sysnum::SemTake, &[s, FOREVER]);
            assert_eq!(hint, NextTask::Other);
        }

        // Wakes go by priority, then by arrival among equals -- and none of
        // them preempts the more important giver.
        let h = syscall(&mut k, giver, Sysnum::SemGive, &[s]);
        assert_eq!(h, NextTask::Same);
        assert!(k.tasks[a].is_runnable());
        assert!(!k.tasks[b].is_runnable());

        let _ = syscall(&mut k, giver, Sysnum::SemGive, &[s]);
        assert!(k.tasks[b].is_runnable());
        assert!(!k.tasks[c].is_runnable());

        let _ = syscall(&mut k, giver, Sysnum::SemGive, &[s]);
        assert!(k.tasks[c].is_runnable());

        // Every wake was a direct handoff; nothing banked in the counter.
        let h = syscall(&mut k, giver, Sysnum::SemTake, &[s, 0]);
        assert_eq!(h, NextTask::Same);
        assert_eq!(ret0(&k, giver), u64::from(abi::WOULD_BLOCK));
    }

    #[test]
    fn giving_a_full_semaphore_reports_would_block() {
        let mut storage = KernelStorage::new();
        let mut k = boot(&mut storage);
        let t = spawn(&mut k, b"t", 3);
        let sem = k.create_semaphore(1, 1).unwrap();
        let s = u64::from(sem.0);

        // Nobody waiting and the count already at max: the give fails
        // rather than vanishing.
        let hint = syscall(&mut k, t, Sysnum::SemGive, &[s]);
        assert_eq!(hint, NextTask::Same);
        assert_eq!(ret0(&k, t), u64::from(abi::WOULD_BLOCK));
        assert_eq!(sem_give_from_isr(&mut k, sem), Err(abi::WOULD_BLOCK));

        // Draining one count makes room for exactly one more give.
        let _ = syscall(&mut k, t, Sysnum::SemTake, &[s, 0]);
        assert_eq!(ret0(&k, t), 0);
        let _ = syscall(&mut k, t, Sysnum::SemGive, &[s]);
        assert_eq!(ret0(&k, t), 0);
        let _ = syscall(&mut k, t, Sysnum::SemGive, &[s]);
        assert_eq!(ret0(&k, t), u64::from(abi::WOULD_BLOCK));
    }

    #[test]
    fn timed_waits_do_not_expire_early() {
        let mut storage = KernelStorage::new();
        let mut k = boot(&mut storage);
        let t = spawn(&mut k, b"t", 2);
        let sem = k.create_semaphore(1, 0).unwrap();

        let hint = syscall(&mut k, t, Sysnum::SemTake, &[u64::from(sem.0), 3]);
        assert_eq!(hint, NextTask::Other);
        k.schedule(hint);

        for _ in 0..2 {
            let h = k.tick();
            k.schedule(h);
            assert!(!k.tasks[t].is_runnable());
        }
        let h = k.tick();
        assert!(k.tasks[t].is_runnable());
        assert_eq!(ret0(&k, t), u64::from(abi::TIMEOUT));
        k.schedule(h);
        assert_eq!(k.current(), t);
    }

    #[test]
    fn priority_swap_reverses_runtime_accumulation() {
        let mut storage = KernelStorage::new();
        let mut k = boot(&mut storage);
        let a = spawn(&mut k, b"a", 2);
        let b = spawn(&mut k, b"b", 4);

        k.schedule(NextTask::Other);
        run_ticks(&mut k, 5);
        assert_eq!(k.tasks[a].runtime_ticks(), 5);
        assert_eq!(k.tasks[b].runtime_ticks(), 0);

        // Swap the order: b becomes the important one.
        let b_id = id_of(&k, b);
        let h = syscall(&mut k, a, Sysnum::PrioritySet, &[b_id, 1]);
        assert_eq!(h, NextTask::Other);
        k.schedule(h);
        assert_eq!(k.current(), b);

        run_ticks(&mut k, 5);
        assert_eq!(k.tasks[a].runtime_ticks(), 5);
        assert_eq!(k.tasks[b].runtime_ticks(), 5);
    }

    #[test]
    fn inheritance_ends_at_exactly_the_base_priority() {
        let mut storage = KernelStorage::new();
        let mut k = boot(&mut storage);
        let owner = spawn(&mut k, b"owner", 6);
        let contender = spawn(&mut k, b"cont", 2);
        let mx = k.create_mutex(true).unwrap();
        let m = u64::from(mx.0);

        let h = syscall(&mut k, owner, Sysnum::MutexLock, &[m, FOREVER]);
        assert_eq!(h, NextTask::Same);
        assert_eq!(ret0(&k, owner), 0);

        let h = syscall(&mut k, contender, Sysnum::MutexLock, &[m, FOREVER]);
        assert_eq!(h, NextTask::Other);
        assert_eq!(k.tasks[owner].priority(), Priority(2));
        assert_eq!(k.tasks[owner].base_priority(), Priority(6));

        let h = syscall(&mut k, owner, Sysnum::MutexUnlock, &[m]);
        assert_eq!(k.tasks[owner].priority(), Priority(6));
        assert!(k.tasks[contender].is_runnable());
        assert_eq!(ret0(&k, contender), 0);
        // The woken contender outranks the deflated old owner.
        assert_eq!(h, NextTask::Other);
    }

    #[test]
    fn full_queues_stay_fifo_and_refuse_or_block_politely() {
        let mut storage = KernelStorage::new();
        let mut k = boot(&mut storage);
        let producer = spawn(&mut k, b"prod", 3);
        let consumer = spawn(&mut k, b"cons", 3);
        let qid = k.create_queue(2, 4).unwrap();
        let q = u64::from(qid.0);

        let m1 = 0x1111_1111u32.to_le_bytes();
        let m2 = 0x2222_2222u32.to_le_bytes();
        let m3 = 0x3333_3333u32.to_le_bytes();

        let _ = syscall(
            &mut k,
            producer,
            Sysnum::QueueSend,
            &[q, m1.as_ptr() as u64, 0],
        );
        assert_eq!(ret0(&k, producer), 0);
        let _ = syscall(
            &mut k,
            producer,
            Sysnum::QueueSend,
            &[q, m2.as_ptr() as u64, 0],
        );
        assert_eq!(ret0(&k, producer), 0);

        // Full, zero budget: refused.
        let h = syscall(
            &mut k,
            producer,
            Sysnum::QueueSend,
            &[q, m3.as_ptr() as u64, 0],
        );
        assert_eq!(h, NextTask::Same);
        assert_eq!(ret0(&k, producer), u64::from(abi::WOULD_BLOCK));

        // Full, with budget: blocked.
        let h = syscall(
            &mut k,
            producer,
            Sysnum::QueueSend,
            &[q, m3.as_ptr() as u64, FOREVER],
        );
        assert_eq!(h, NextTask::Other);
        assert!(k.tasks[producer].state().is_awaiting_queue_space(qid));

        // Draining preserves arrival order, including the blocked sender's
        // item admitted mid-drain.
        let mut buf = [0u8; 4];
        let _ = syscall(
            &mut k,
            consumer,
            Sysnum::QueueRecv,
            &[q, buf.as_mut_ptr() as u64, 0],
        );
        assert_eq!(buf, m1);
        assert!(k.tasks[producer].is_runnable());
        assert_eq!(ret0(&k, producer), 0);

        let _ = syscall(
            &mut k,
            consumer,
            Sysnum::QueueRecv,
            &[q, buf.as_mut_ptr() as u64, 0],
        );
        assert_eq!(buf, m2);
        let _ = syscall(
            &mut k,
            consumer,
            Sysnum::QueueRecv,
            &[q, buf.as_mut_ptr() as u64, 0],
        );
        assert_eq!(buf, m3);

        let h = syscall(
            &mut k,
            consumer,
            Sysnum::QueueRecv,
            &[q, buf.as_mut_ptr() as u64, 0],
        );
        assert_eq!(h, NextTask::Same);
        assert_eq!(ret0(&k, consumer), u64::from(abi::WOULD_BLOCK));
    }

    #[test]
    fn deleting_a_suspended_task_leaves_the_ready_rotation_alone() {
        let mut storage = KernelStorage::new();
        let mut k = boot(&mut storage);
        let a = spawn(&mut k, b"a", 3);
        spawn(&mut k, b"b", 3);
        spawn(&mut k, b"c", 3);
        let victim = spawn(&mut k, b"victim", 2);
        let victim_id = id_of(&k, victim);

        let h = syscall(&mut k, a, Sysnum::Suspend, &[victim_id]);
        assert_eq!(h, NextTask::Same);

        k.schedule(NextTask::Other);
        let mut order = [0usize; 3];
        for slot in &mut order {
            *slot = k.current();
            let h = k.tick();
            k.schedule(h);
        }

        // Delete the suspended task mid-rotation...
        let cur = k.current();
        let h = syscall(&mut k, cur, Sysnum::TaskDelete, &[victim_id]);
        assert_eq!(h, NextTask::Same);
        assert_eq!(ret0(&k, cur), 0);
        assert!(k.tasks[victim].is_vacant());

        // ...and the rotation carries on in the same relative order.
        for expected in order {
            assert_eq!(k.current(), expected);
            let h = k.tick();
            k.schedule(h);
        }
    }

    #[test]
    fn suspension_is_immune_to_timeouts_and_survives_to_resume() {
        let mut storage = KernelStorage::new();
        let mut k = boot(&mut storage);
        let t = spawn(&mut k, b"t", 2);
        let monitor = spawn(&mut k, b"mon", 4);
        let t_id = id_of(&k, t);
        let sem = k.create_semaphore(1, 0).unwrap();

        // t blocks with a deadline, then is suspended before it fires. The
        // wait dies with a timeout result, written at suspension time.
        let _ = syscall(&mut k, t, Sysnum::SemTake, &[u64::from(sem.0), 2]);
        let _ = syscall(&mut k, monitor, Sysnum::Suspend, &[t_id]);
        assert_eq!(
            *k.tasks[t].state(),
            TaskState::Healthy(SchedState::Suspended)
        );
        assert_eq!(ret0(&k, t), u64::from(abi::TIMEOUT));
        assert_eq!(k.tasks[t].deadline(), None);

        // Ticks roll past the old deadline without touching it.
        run_ticks(&mut k, 5);
        assert_eq!(
            *k.tasks[t].state(),
            TaskState::Healthy(SchedState::Suspended)
        );

        // Resume delivers it back runnable; it outranks the monitor.
        let h = syscall(&mut k, monitor, Sysnum::Resume, &[t_id]);
        assert!(k.tasks[t].is_runnable());
        assert_eq!(h, NextTask::Other);

        // Resuming a task that is not suspended is a usage fault.
        let h = syscall(&mut k, monitor, Sysnum::Resume, &[t_id]);
        assert_eq!(h, NextTask::Other);
        assert!(matches!(
            k.tasks[monitor].state(),
            TaskState::Faulted {
                fault: FaultInfo::SyscallUsage(UsageError::IllegalTask),
                ..
            }
        ));
    }

    #[test]
    fn event_waits_wake_together_and_clear_after() {
        let mut storage = KernelStorage::new();
        let mut k = boot(&mut storage);
        let waiter_any = spawn(&mut k, b"any", 3);
        let waiter_all = spawn(&mut k, b"all", 3);
        let poster = spawn(&mut k, b"post", 2);
        let eg = k.create_event_group().unwrap();
        let e = u64::from(eg.0);

        let _ = syscall(
            &mut k,
            waiter_any,
            Sysnum::EventWait,
            &[e, 0b01, u64::from(abi::EVENT_CLEAR_ON_EXIT), FOREVER],
        );
        let _ = syscall(
            &mut k,
            waiter_all,
            Sysnum::EventWait,
            &[e, 0b11, u64::from(abi::EVENT_WAIT_ALL), FOREVER],
        );

        let h = syscall(&mut k, poster, Sysnum::EventSet, &[e, 0b01]);
        assert_eq!(h, NextTask::Same);
        assert!(k.tasks[waiter_any].is_runnable());
        assert!(!k.tasks[waiter_all].is_runnable());
        assert_eq!(ret1(&k, waiter_any), 0b01);
        // The any-waiter's clear-on-exit consumed bit 0 after the pass.
        assert_eq!(ret1(&k, poster), 0);

        let _ = syscall(&mut k, poster, Sysnum::EventSet, &[e, 0b11]);
        assert!(k.tasks[waiter_all].is_runnable());
        assert_eq!(ret1(&k, waiter_all), 0b11);

        // Bits that are already up satisfy a wait without blocking.
        let h = syscall(&mut k, poster, Sysnum::EventWait, &[e, 0b10, 0, 0]);
        assert_eq!(h, NextTask::Same);
        assert_eq!(ret1(&k, poster), 0b11);
    }

    #[test]
    fn notifications_count_and_deliver_pre_consume_values() {
        let mut storage = KernelStorage::new();
        let mut k = boot(&mut storage);
        let t = spawn(&mut k, b"t", 3);
        let g = spawn(&mut k, b"g", 2);
        let t_id = id_of(&k, t);

        let _ = syscall(&mut k, g, Sysnum::NotifyGive, &[t_id]);
        let _ = syscall(&mut k, g, Sysnum::NotifyGive, &[t_id]);

        // Decrement-mode take returns the pre-consume count.
        let _ = syscall(&mut k, t, Sysnum::NotifyTake, &[0, 0]);
        assert_eq!(ret1(&k, t), 2);
        assert_eq!(k.tasks[t].notifications(), 1);

        // Clear-mode take empties the counter.
        let _ = syscall(&mut k, t, Sysnum::NotifyTake, &[1, 0]);
        assert_eq!(ret1(&k, t), 1);
        assert_eq!(k.tasks[t].notifications(), 0);

        // Empty counter: zero budget refuses, a budget blocks until a give.
        let h = syscall(&mut k, t, Sysnum::NotifyTake, &[0, 0]);
        assert_eq!(h, NextTask::Same);
        assert_eq!(ret0(&k, t), u64::from(abi::WOULD_BLOCK));

        let h = syscall(&mut k, t, Sysnum::NotifyTake, &[0, FOREVER]);
        assert_eq!(h, NextTask::Other);
        let _ = syscall(&mut k, g, Sysnum::NotifyGive, &[t_id]);
        assert!(k.tasks[t].is_runnable());
        assert_eq!(ret1(&k, t), 1);
        assert_eq!(k.tasks[t].notifications(), 0);
    }

    #[test]
    fn unknown_syscall_numbers_fault_the_caller() {
        let mut storage = KernelStorage::new();
        let mut k = boot(&mut storage);
        let t = spawn(&mut k, b"t", 3);

        k.current = t;
        let h = handle_syscall(&mut k, 0xffff);
        assert_eq!(h, NextTask::Other);
        assert!(matches!(
            k.tasks[t].state(),
            TaskState::Faulted {
                fault: FaultInfo::SyscallUsage(UsageError::BadSyscallNumber),
                ..
            }
        ));
    }

    #[test]
    fn stale_object_handles_surface_as_dead_codes() {
        let mut storage = KernelStorage::new();
        let mut k = boot(&mut storage);
        let t = spawn(&mut k, b"t", 3);
        let sem = k.create_semaphore(1, 1).unwrap();

        k.current = t;
        let _ = k.delete_object(sem.index());
        // The slot is reused by a fresh object; the old handle still
        // refuses, with a dead code naming the new generation.
        let again = k.create_semaphore(1, 1).unwrap();
        assert_eq!(again.index(), sem.index());

        let h = syscall(&mut k, t, Sysnum::SemTake, &[u64::from(sem.0), 0]);
        assert_eq!(h, NextTask::Same);
        assert_eq!(
            ret0(&k, t) & 0xffff_ff00,
            u64::from(abi::FIRST_DEAD_CODE)
        );

        let _ = syscall(&mut k, t, Sysnum::SemTake, &[u64::from(again.0), 0]);
        assert_eq!(ret0(&k, t), 0);
    }

    #[test]
    fn task_info_writes_the_status_record() {
        let mut storage = KernelStorage::new();
        let mut k = boot(&mut storage);
        let t = spawn(&mut k, b"worker", 3);
        k.schedule(NextTask::Other);
        run_ticks(&mut k, 2);

        let mut status = abi::TaskStatus::default();
        let t_id = id_of(&k, t);
        let _ = syscall(
            &mut k,
            t,
            Sysnum::TaskInfo,
            &[t_id, &mut status as *mut _ as u64],
        );
        assert_eq!(ret0(&k, t), 0);
        assert_eq!(status.runtime_ticks, 2);
        assert_eq!(status.priority, 3);
        assert_eq!(status.base_priority, 3);
        assert_eq!(&status.name[..6], b"worker");
        assert_eq!(
            status.state,
            TaskState::Healthy(SchedState::Runnable).status_code()
        );
    }

    #[test]
    fn interrupt_context_wakes_report_preemption_exactly() {
        let mut storage = KernelStorage::new();
        let mut k = boot(&mut storage);
        let lo = spawn(&mut k, b"lo", 5);
        let hi = spawn(&mut k, b"hi", 2);
        let sem = k.create_semaphore(1, 0).unwrap();

        // hi blocks on the semaphore; lo is left running.
        let _ =
            syscall(&mut k, hi, Sysnum::SemTake, &[u64::from(sem.0), FOREVER]);
        k.current = lo;

        // A give from interrupt context wakes hi, which outranks lo.
        assert_eq!(sem_give_from_isr(&mut k, sem), Ok(true));
        assert!(k.tasks[hi].is_runnable());

        // A second give banks the count; nobody woken, no switch needed.
        assert_eq!(sem_give_from_isr(&mut k, sem), Ok(false));

        // Queue sends refuse rather than block.
        let q = k.create_queue(1, 2).unwrap();
        assert_eq!(queue_send_from_isr(&mut k, q, &[1, 2]), Ok(false));
        assert_eq!(
            queue_send_from_isr(&mut k, q, &[3, 4]),
            Err(abi::WOULD_BLOCK)
        );
        // Wrong item size is a misuse code, not a fault.
        assert_eq!(queue_send_from_isr(&mut k, q, &[0]), Err(abi::INVALID));

        // And the item that did land reads back out.
        let mut buf = [0u8; 2];
        assert_eq!(queue_recv_from_isr(&mut k, q, &mut buf), Ok(false));
        assert_eq!(buf, [1, 2]);
    }

    #[test]
    fn sleep_zero_yields_and_rotates_among_equals() {
        let mut storage = KernelStorage::new();
        let mut k = boot(&mut storage);
        let a = spawn(&mut k, b"a", 3);
        let b = spawn(&mut k, b"b", 3);

        k.schedule(NextTask::Other);
        let first = k.current();
        assert!(first == a || first == b);

        let h = syscall(&mut k, first, Sysnum::Sleep, &[0]);
        assert_eq!(h, NextTask::Other);
        assert_eq!(ret0(&k, first), 0);
        k.schedule(h);
        assert_ne!(k.current(), first);

        let second = k.current();
        let h = syscall(&mut k, second, Sysnum::Yield, &[]);
        k.schedule(h);
        assert_eq!(k.current(), first);
    }

    #[test]
    fn sleep_until_the_past_returns_immediately() {
        let mut storage = KernelStorage::new();
        let mut k = boot(&mut storage);
        let t = spawn(&mut k, b"t", 3);
        k.schedule(NextTask::Other);
        run_ticks(&mut k, 4);

        let h = syscall(&mut k, t, Sysnum::SleepUntil, &[2]);
        assert_eq!(h, NextTask::Same);
        assert_eq!(ret0(&k, t), 0);

        // The exact current tick does not block either.
        let now = u64::from(k.now());
        let h = syscall(&mut k, t, Sysnum::SleepUntil, &[now]);
        assert_eq!(h, NextTask::Same);

        // A future tick blocks with an absolute deadline.
        let h = syscall(&mut k, t, Sysnum::SleepUntil, &[now + 3]);
        assert_eq!(h, NextTask::Other);
        assert_eq!(k.tasks[t].deadline(), Some(Timestamp::from(now + 3)));
    }

    #[test]
    fn deleting_a_task_frees_its_mutexes_to_the_next_waiter() {
        let mut storage = KernelStorage::new();
        let mut k = boot(&mut storage);
        let owner = spawn(&mut k, b"owner", 4);
        let waiter = spawn(&mut k, b"waiter", 3);
        let killer = spawn(&mut k, b"killer", 1);
        let owner_id = id_of(&k, owner);
        let mx = k.create_mutex(true).unwrap();
        let m = u64::from(mx.0);

        let _ = syscall(&mut k, owner, Sysnum::MutexLock, &[m, FOREVER]);
        let _ = syscall(&mut k, waiter, Sysnum::MutexLock, &[m, FOREVER]);
        assert!(!k.tasks[waiter].is_runnable());

        let _ = syscall(&mut k, killer, Sysnum::TaskDelete, &[owner_id]);
        assert!(k.tasks[owner].is_vacant());
        assert!(k.tasks[waiter].is_runnable());
        assert_eq!(ret0(&k, waiter), 0);

        // The waiter really owns it: a second lock recurses instead of
        // blocking.
        let h = syscall(&mut k, waiter, Sysnum::MutexLock, &[m, 0]);
        assert_eq!(h, NextTask::Same);
        assert_eq!(ret0(&k, waiter), 0);
    }
}
