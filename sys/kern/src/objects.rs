// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The object table: runtime-created synchronization objects, named by
//! generation-checked handles.
//!
//! Objects live in a fixed table of slots, exactly like tasks. A slot's
//! generation advances when the object in it is deleted, so an `ObjectId`
//! held across delete/create cycles fails with a dead code instead of
//! quietly operating on a stranger.

use abi::{FaultInfo, Generation, ObjectId, UsageError};

use crate::err::UserError;
use crate::events::EventGroup;
use crate::mutex::Mutex;
use crate::queue::Queue;
use crate::semaphore::Semaphore;
use crate::task::NextTask;

/// One slot of the object table.
#[derive(Debug)]
pub struct ObjectSlot {
    /// Occupancy count; advances on deletion. Low bits become the
    /// generation checked against handles.
    generation: u32,
    object: Object,
}

/// The object stored in a slot, if any.
#[derive(Debug)]
pub enum Object {
    Vacant,
    Queue(Queue),
    Semaphore(Semaphore),
    Mutex(Mutex),
    EventGroup(EventGroup),
}

impl ObjectSlot {
    /// An unoccupied slot, used to build the initial object table.
    pub const VACANT: Self = ObjectSlot {
        generation: 0,
        object: Object::Vacant,
    };

    pub fn is_vacant(&self) -> bool {
        matches!(self.object, Object::Vacant)
    }

    /// Returns this slot's current generation number.
    pub fn generation(&self) -> Generation {
        const MASK: u8 = ((1u32 << (16 - ObjectId::INDEX_BITS)) - 1) as u8;
        Generation::from(self.generation as u8 & MASK)
    }

    /// Populates this (vacant) slot.
    pub(crate) fn fill(&mut self, object: Object) {
        uassert!(self.is_vacant());
        self.object = object;
    }

    /// Empties this slot back out, advancing the generation so handles to
    /// the departed object turn into dead codes. Returns the object so the
    /// caller can release whatever memory it held.
    pub(crate) fn vacate(&mut self) -> Object {
        self.generation = self.generation.wrapping_add(1);
        core::mem::replace(&mut self.object, Object::Vacant)
    }

    pub fn object(&self) -> &Object {
        &self.object
    }

    pub fn object_mut(&mut self) -> &mut Object {
        &mut self.object
    }
}

impl Object {
    /// Views this object as a queue, or reports that the caller passed the
    /// wrong kind of handle.
    pub fn queue(&self) -> Result<&Queue, UserError> {
        match self {
            Object::Queue(q) => Ok(q),
            _ => Err(wrong_kind()),
        }
    }

    pub fn queue_mut(&mut self) -> Result<&mut Queue, UserError> {
        match self {
            Object::Queue(q) => Ok(q),
            _ => Err(wrong_kind()),
        }
    }

    pub fn semaphore_mut(&mut self) -> Result<&mut Semaphore, UserError> {
        match self {
            Object::Semaphore(s) => Ok(s),
            _ => Err(wrong_kind()),
        }
    }

    pub fn mutex(&self) -> Result<&Mutex, UserError> {
        match self {
            Object::Mutex(m) => Ok(m),
            _ => Err(wrong_kind()),
        }
    }

    pub fn mutex_mut(&mut self) -> Result<&mut Mutex, UserError> {
        match self {
            Object::Mutex(m) => Ok(m),
            _ => Err(wrong_kind()),
        }
    }

    pub fn event_group_mut(&mut self) -> Result<&mut EventGroup, UserError> {
        match self {
            Object::EventGroup(e) => Ok(e),
            _ => Err(wrong_kind()),
        }
    }
}

fn wrong_kind() -> UserError {
    FaultInfo::SyscallUsage(UsageError::WrongObjectKind).into()
}

/// Checks a user-provided `ObjectId` against the object table.
///
/// On success, returns the table index it names. Handles that parse but
/// refer to a deleted object produce the recoverable dead code carrying the
/// slot's current generation.
pub fn check_object_id(
    objects: &[ObjectSlot],
    id: ObjectId,
) -> Result<usize, UserError> {
    let index = id.index();
    if index >= objects.len() {
        return Err(
            FaultInfo::SyscallUsage(UsageError::ObjectOutOfRange).into()
        );
    }

    let slot = &objects[index];
    if slot.is_vacant() || slot.generation() != id.generation() {
        return Err(UserError::Recoverable(
            abi::dead_response_code(slot.generation()),
            NextTask::Same,
        ));
    }

    Ok(index)
}

/// Produces a current `ObjectId` (i.e. one with the correct generation) for
/// `objects[index]`.
pub fn current_object_id(objects: &[ObjectSlot], index: usize) -> ObjectId {
    ObjectId::for_index_and_gen(index, objects[index].generation())
}
