// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lightweight kernel event trace.
//!
//! A fixed ring of recent scheduling events, cheap enough to leave on in
//! production images and read out with a debugger. Consecutive identical
//! events collapse into one entry with a repeat count, so a task bouncing on
//! a timeout doesn't evict everything else.
//!
//! The ring lives inside the kernel state rather than in a `static`, so there
//! is exactly one and it needs no synchronization of its own.

/// Ring depth. Each entry is small; 32 covers enough history to reconstruct
/// scheduling trouble in practice.
const TRACE_DEPTH: usize = 32;

/// Things worth remembering. Task and object references are recorded by table
/// index; pair the trace with the table itself to recover identities.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Slot has never been written.
    None,
    /// The scheduler dispatched the task at this index.
    SwitchTo(u16),
    /// A timed wait expired before being satisfied.
    Timeout(u16),
    /// A task was forced into the faulted state.
    Fault(u16),
    /// A task slot was (re)populated.
    TaskCreated(u16),
    /// A task left the live set, by exit or deletion.
    TaskGone(u16),
    /// An object slot was (re)populated.
    ObjectCreated(u16),
    /// An object was deleted and its waiters kicked.
    ObjectDeleted(u16),
    /// An allocation failed for lack of arena memory.
    OutOfMemory,
}

/// One ring slot: an event and how many times in a row it happened.
#[derive(Copy, Clone, Debug)]
pub struct TraceEntry {
    pub event: Event,
    pub count: u16,
}

pub struct Trace {
    entries: [TraceEntry; TRACE_DEPTH],
    next: usize,
}

impl Trace {
    pub const fn new() -> Self {
        Self {
            entries: [TraceEntry {
                event: Event::None,
                count: 0,
            }; TRACE_DEPTH],
            next: 0,
        }
    }

    /// Records `event`, collapsing immediate repeats.
    pub fn record(&mut self, event: Event) {
        let prev = self.next.checked_sub(1).unwrap_or(TRACE_DEPTH - 1);
        let slot = &mut self.entries[prev];
        if slot.count != 0 && slot.count < u16::MAX && slot.event == event {
            slot.count += 1;
        } else {
            self.entries[self.next] = TraceEntry { event, count: 1 };
            self.next = (self.next + 1) % TRACE_DEPTH;
        }
    }

    /// The most recently recorded entry, if anything has been recorded.
    pub fn latest(&self) -> Option<TraceEntry> {
        let prev = self.next.checked_sub(1).unwrap_or(TRACE_DEPTH - 1);
        let slot = self.entries[prev];
        if slot.count != 0 {
            Some(slot)
        } else {
            None
        }
    }

    /// Raw ring contents, unwritten slots included. Mostly for debuggers and
    /// tests; entry order is ring order, not time order.
    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}
