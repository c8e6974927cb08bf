// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, you can obtain one at https://mozilla.org/MPL/2.0/.

//! A small real-time kernel: priority-scheduled tasks over a family of
//! blocking primitives (queues, semaphores, mutexes, event groups), with
//! timeouts counted in kernel ticks.
//!
//! # Design principles
//!
//! 1. The kernel is event-driven. It runs only on kernel entry -- a
//!    syscall, a fault, or an interrupt -- decides, and resumes some task.
//!    It has no thread of its own; when nothing is runnable, the idle task
//!    runs in user context.
//!
//! 2. All mutable kernel state lives in one object, [`kernel::Kernel`],
//!    borrowed exclusively for the duration of each entry. There is no
//!    fine-grained locking; entries are serialized by the architecture
//!    layer keeping interrupts masked while in the kernel.
//!
//! 3. Storage is fixed at startup. Task control blocks, kernel objects,
//!    and stacks come out of [`kernel::KernelStorage`], sized by const
//!    generics in the board's main; after `start_kernel` nothing grows.
//!
//! 4. Scheduling is strict priority with round-robin rotation among
//!    equals. The only thing that moves a priority is a mutex lending the
//!    holder its most important waiter's priority.
//!
//! 5. Machine dependence is confined to [`arch`]. Each backend exports the
//!    same names, including a hosted pseudo-architecture so the kernel's
//!    logic runs under ordinary `cargo test`.

#![cfg_attr(target_os = "none", no_std)]

// `arch` must come first, as it defines macros used by the rest of the
// modules.
#[macro_use]
pub mod arch;

pub mod arena;
pub mod err;
pub mod events;
pub mod fail;
pub mod kernel;
pub mod mutex;
pub mod objects;
pub mod queue;
pub mod semaphore;
pub mod startup;
pub mod syscalls;
pub mod task;
pub mod time;
pub mod trace;
pub mod umem;
