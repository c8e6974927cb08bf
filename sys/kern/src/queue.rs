// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message queues: fixed rings of fixed-size items.
//!
//! All data moves through the ring, even when a task is waiting on the other
//! side -- a send while a receiver is blocked still lands in the ring, and
//! the receiver is completed out of it. That keeps exactly one ordering
//! authority (ring order) and spares us a separate direct-handoff path.
//!
//! The ring itself lives in the kernel arena; the `Queue` records where.

use abi::{FaultInfo, ObjectId, SchedState, TaskState};

use crate::arena::{Arena, Extent};
use crate::task::{self, ArchState, NextTask, Task};
use crate::trace::Trace;
use crate::umem::{copy_from_task, copy_to_task, USlice};

/// Queue bookkeeping. The item bytes are in the arena extent, not here.
#[derive(Debug)]
pub struct Queue {
    ring: Extent,
    capacity: usize,
    item_size: usize,
    /// Ring index of the oldest item.
    head: usize,
    /// Number of items currently stored.
    len: usize,
}

impl Queue {
    /// Wraps `ring`, which must hold at least `capacity * item_size` bytes;
    /// the creation syscall carves it that way.
    pub fn new(ring: Extent, capacity: usize, item_size: usize) -> Self {
        uassert!(capacity != 0);
        uassert!(item_size != 0);
        uassert!(capacity * item_size <= ring.size());
        Self {
            ring,
            capacity,
            item_size,
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    /// The backing extent, for returning to the arena on deletion.
    pub fn ring(&self) -> Extent {
        self.ring
    }

    /// Claims the next free slot and returns its bytes for the caller to
    /// fill. Call only when not full.
    pub(crate) fn push_slot<'a>(
        &mut self,
        arena: &'a mut Arena<'_>,
    ) -> &'a mut [u8] {
        uassert!(!self.is_full());
        let tail = (self.head + self.len) % self.capacity;
        self.len += 1;
        &mut arena.bytes_mut(self.ring)[tail * self.item_size..][..self.item_size]
    }

    /// Consumes the oldest item, returning its bytes. Call only when not
    /// empty.
    pub(crate) fn take_slot<'a>(&mut self, arena: &'a Arena<'_>) -> &'a [u8] {
        uassert!(!self.is_empty());
        let head = self.head;
        self.head = (self.head + 1) % self.capacity;
        self.len -= 1;
        &arena.bytes(self.ring)[head * self.item_size..][..self.item_size]
    }

    /// The oldest item's bytes, left in place. Call only when not empty.
    pub(crate) fn peek_slot<'a>(&self, arena: &'a Arena<'_>) -> &'a [u8] {
        uassert!(!self.is_empty());
        &arena.bytes(self.ring)[self.head * self.item_size..][..self.item_size]
    }
}

/// Reads the buffer pointer out of a blocked task's saved queue-transfer
/// arguments. The send/receive syscalls validated this slice before
/// blocking, so failure here means the saved state was corrupted -- the
/// caller turns that into a fault rather than trusting it.
fn transfer_buffer(
    task: &Task,
    item_size: usize,
) -> Result<USlice<u8>, FaultInfo> {
    let args = task.save().as_queue_transfer_args();
    USlice::from_raw(args.buffer_base, item_size).map_err(FaultInfo::from)
}

/// Runs the queue to quiescence: completes blocked receivers while items are
/// available and blocked senders while space is, until neither makes
/// progress.
///
/// Waiters are completed most-important-first, ties in arrival order. Peek
/// waiters are completed without consuming, so several can observe the same
/// item before a consumer takes it.
///
/// Call this after anything that changes the ring or the waiter population.
pub fn settle(
    queue: &mut Queue,
    oid: ObjectId,
    tasks: &mut [Task],
    trace: &mut Trace,
    arena: &mut Arena<'_>,
) -> NextTask {
    let mut hint = NextTask::Same;
    loop {
        let mut progressed = false;

        // Receivers first: draining makes room for the senders below.
        while !queue.is_empty() {
            let Some(ri) = kerncore::select_waiter(
                tasks,
                |t| t.state().is_awaiting_queue_data(oid),
                |t| t.wait_seq(),
            ) else {
                break;
            };
            let peek = matches!(
                tasks[ri].state(),
                TaskState::Healthy(SchedState::InQueueRecv {
                    peek: true,
                    ..
                })
            );
            match transfer_buffer(&tasks[ri], queue.item_size()) {
                Ok(mut dst) => {
                    let src = if peek {
                        queue.peek_slot(arena)
                    } else {
                        queue.take_slot(arena)
                    };
                    // Safety: the receiver alleged this buffer when it made
                    // its syscall; writing it on the task's behalf is the
                    // contract of that syscall.
                    unsafe {
                        copy_to_task(src, &mut dst);
                    }
                    tasks[ri].save_mut().set_success_response(0);
                    tasks[ri].make_runnable();
                    hint = hint.combine(NextTask::Other);
                }
                Err(e) => {
                    hint = hint.combine(task::force_fault(
                        tasks, trace, ri, e,
                    ));
                }
            }
            progressed = true;
        }

        // Now admit blocked senders while there's room.
        while !queue.is_full() {
            let Some(si) = kerncore::select_waiter(
                tasks,
                |t| t.state().is_awaiting_queue_space(oid),
                |t| t.wait_seq(),
            ) else {
                break;
            };
            match transfer_buffer(&tasks[si], queue.item_size()) {
                Ok(src) => {
                    let slot = queue.push_slot(arena);
                    // Safety: as above, reading on the sender's behalf.
                    unsafe {
                        copy_from_task(&src, slot);
                    }
                    tasks[si].save_mut().set_success_response(0);
                    tasks[si].make_runnable();
                    hint = hint.combine(NextTask::Other);
                }
                Err(e) => {
                    hint = hint.combine(task::force_fault(
                        tasks, trace, si, e,
                    ));
                }
            }
            progressed = true;
        }

        if !progressed {
            break;
        }
    }
    hint
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::Priority;

    fn arena_with(mem: &mut [u8]) -> Arena<'_> {
        Arena::new(mem)
    }

    #[repr(align(16))]
    struct Mem([u8; 256]);

    #[test]
    fn ring_preserves_insertion_order_across_wrap() {
        let mut mem = Mem([0; 256]);
        let mut arena = arena_with(&mut mem.0);
        let ring = arena.carve(4 * 8).unwrap();
        let mut q = Queue::new(ring, 4, 8);

        for round in 0u8..3 {
            for i in 0..4u8 {
                q.push_slot(&mut arena).fill(round * 10 + i);
            }
            assert!(q.is_full());
            for i in 0..4u8 {
                let got = q.take_slot(&arena)[0];
                assert_eq!(got, round * 10 + i);
            }
            assert!(q.is_empty());
        }
    }

    #[test]
    fn peeking_does_not_consume() {
        let mut mem = Mem([0; 256]);
        let mut arena = arena_with(&mut mem.0);
        let ring = arena.carve(2 * 4).unwrap();
        let mut q = Queue::new(ring, 2, 4);

        q.push_slot(&mut arena).fill(7);
        assert_eq!(q.peek_slot(&arena)[0], 7);
        assert_eq!(q.peek_slot(&arena)[0], 7);
        assert_eq!(q.len(), 1);
        assert_eq!(q.take_slot(&arena)[0], 7);
        assert!(q.is_empty());
    }

    #[test]
    fn settle_completes_a_blocked_receiver_from_the_ring() {
        let mut mem = Mem([0; 256]);
        let mut arena = arena_with(&mut mem.0);
        let ring = arena.carve(2 * 4).unwrap();
        let mut q = Queue::new(ring, 2, 4);
        let mut trace = Trace::new();
        let oid = ObjectId(0);

        let mut buf = [0u8; 4];
        let mut tasks = [Task::VACANT];
        tasks[0].set_base_priority(Priority(1));
        tasks[0].set_effective_priority(Priority(1));
        tasks[0].save_mut().set_args(&[
            u64::from(oid.0),
            buf.as_mut_ptr() as u64,
            0,
        ]);
        tasks[0].block(
            1,
            SchedState::InQueueRecv {
                object: oid,
                peek: false,
            },
            None,
        );

        // Nothing to deliver yet.
        let hint = settle(&mut q, oid, &mut tasks, &mut trace, &mut arena);
        assert_eq!(hint, NextTask::Same);
        assert!(!tasks[0].is_runnable());

        q.push_slot(&mut arena).copy_from_slice(&[9, 8, 7, 6]);
        let hint = settle(&mut q, oid, &mut tasks, &mut trace, &mut arena);
        assert_eq!(hint, NextTask::Other);
        assert!(tasks[0].is_runnable());
        assert!(q.is_empty());
        assert_eq!(buf, [9, 8, 7, 6]);
    }

    #[test]
    fn settle_admits_the_most_important_blocked_sender() {
        let mut mem = Mem([0; 256]);
        let mut arena = arena_with(&mut mem.0);
        let ring = arena.carve(4).unwrap();
        let mut q = Queue::new(ring, 1, 4);
        let mut trace = Trace::new();
        let oid = ObjectId(0);

        // Fill the ring so both senders must wait.
        q.push_slot(&mut arena).copy_from_slice(&[1, 1, 1, 1]);

        let lo = [2u8; 4];
        let hi = [3u8; 4];
        let mut tasks = [Task::VACANT, Task::VACANT];
        for (i, (buf, prio, seq)) in
            [(&lo, 5, 1), (&hi, 2, 2)].iter().enumerate()
        {
            tasks[i].set_base_priority(Priority(*prio));
            tasks[i].set_effective_priority(Priority(*prio));
            tasks[i].save_mut().set_args(&[
                u64::from(oid.0),
                buf.as_ptr() as u64,
                0,
            ]);
            tasks[i].block(*seq, SchedState::InQueueSend(oid), None);
        }

        // Consume the blocking item; settle should admit the later-arrived
        // but more important sender.
        let _ = q.take_slot(&arena);
        let hint = settle(&mut q, oid, &mut tasks, &mut trace, &mut arena);
        assert_eq!(hint, NextTask::Other);
        assert!(tasks[1].is_runnable());
        assert!(!tasks[0].is_runnable());
        assert_eq!(q.peek_slot(&arena), &[3, 3, 3, 3]);
    }
}
