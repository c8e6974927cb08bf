// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, you can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup and the single point of entry to kernel state.
//!
//! The boot path looks like this: board code (running wherever the loader
//! left it, with translation set up and a flat view of memory shared with
//! the tasks-to-be) hands [`start_kernel`] its static storage, the board
//! description, the tick rate, and a closure that creates the initial
//! tasks. `start_kernel` publishes the kernel and dispatches the most
//! important task; it does not return.
//!
//! After that, every kernel entry borrows the kernel through
//! [`with_kernel`]. The borrow is dynamically checked: entries are
//! supposed to be serialized by the architecture layer, so finding the
//! kernel already borrowed means that guarantee broke, and we treat it as
//! fatal rather than hand out aliasing `&mut`s.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;
use crate::kernel::{Kernel, KernelStorage};
use crate::task::NextTask;

struct KernelCell(UnsafeCell<Option<Kernel<'static>>>);

// Safety: access to the contents is serialized by KERNEL_IN_USE.
unsafe impl Sync for KernelCell {}

static KERNEL: KernelCell = KernelCell(UnsafeCell::new(None));
static KERNEL_IN_USE: AtomicBool = AtomicBool::new(false);

/// Grants `body` exclusive access to the kernel.
///
/// Panics if the kernel is already borrowed -- kernel entries must not
/// nest -- or if `start_kernel` hasn't run yet.
pub fn with_kernel<R>(body: impl FnOnce(&mut Kernel<'static>) -> R) -> R {
    if KERNEL_IN_USE.swap(true, Ordering::Acquire) {
        panic!("reentrant kernel entry");
    }
    // Safety: the flag above gives us exclusivity, and the cell is written
    // only by start_kernel, before any entry can occur.
    let slot = unsafe { &mut *KERNEL.0.get() };
    let result = match slot {
        Some(kernel) => body(kernel),
        None => panic!("kernel not started"),
    };
    KERNEL_IN_USE.store(false, Ordering::Release);
    result
}

/// Brings the kernel to life and hands the CPU to the first task. Call
/// once, from the board's boot path.
///
/// `init` runs against the fresh kernel to create the initial tasks; it
/// must create at least an idle task, or startup panics. `tick_hz` is the
/// kernel tick rate the architecture layer programs into its timer.
pub fn start_kernel<
    const TASKS: usize,
    const OBJECTS: usize,
    const ARENA: usize,
>(
    storage: &'static mut KernelStorage<TASKS, OBJECTS, ARENA>,
    board: arch::BoardConfig,
    tick_hz: u32,
    init: impl FnOnce(&mut Kernel<'static>),
) -> ! {
    klog!("kernel startup");
    let mut kernel = Kernel::new(storage);
    init(&mut kernel);
    // The scheduler needs somewhere to land when nothing else is runnable.
    uassert!(kernel.has_idle_task());

    // Publish the kernel.
    // Safety: nothing can be borrowing the cell yet; interrupt-driven
    // entries can't happen before start_first_task.
    unsafe {
        *KERNEL.0.get() = Some(kernel);
    }

    // Pick the first task and aim the dispatch machinery at it.
    with_kernel(|k| {
        k.schedule(NextTask::Other);
        let first = k.current();
        // Safety: the reference points into the kernel's static storage.
        unsafe { arch::set_current_task(&k.tasks[first]) };
    });

    arch::start_first_task(&board, tick_hz)
}
