// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pseudo-architecture for running kernel code in a hosted process.
//!
//! This backend exists for the test suite. Scheduling, objects, and syscall
//! dispatch all run on the host, with the syscall register convention
//! modeled as plain arrays: tests poke arguments into a task's save area,
//! call the dispatch path directly, and read responses back out. Nothing
//! here can actually enter user mode.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::task;

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

macro_rules! klog {
    ($s:expr) => { println!($s) };
    ($s:expr, $($tt:tt)*) => { println!($s, $($tt)*) };
}

/// Stand-in for a task's saved register file.
///
/// On hardware, syscall arguments travel in callee-saved registers so that
/// they land in the task control block on kernel entry; here they are just
/// arrays with the same access pattern.
#[derive(Debug)]
pub struct SavedState {
    args: [u64; 7],
    rets: [u64; 3],
    descriptor: u32,
    pc: u64,
    sp: u64,
}

impl SavedState {
    pub const DEFAULT: Self = SavedState {
        args: [0; 7],
        rets: [0; 3],
        descriptor: 0,
        pc: 0,
        sp: 0,
    };

    /// Loads the argument registers, as user code about to trap would.
    pub fn set_args(&mut self, args: &[u64]) {
        uassert!(args.len() <= self.args.len());
        self.args = [0; 7];
        self.args[..args.len()].copy_from_slice(args);
    }

    /// Reads back response register 0, the error/success discriminator.
    pub fn ret0_value(&self) -> u64 {
        self.rets[0]
    }

    /// Reads back response register 1, the value most syscalls produce.
    pub fn ret1_value(&self) -> u64 {
        self.rets[1]
    }
}

impl Default for SavedState {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl task::ArchState for SavedState {
    fn stack_pointer(&self) -> u64 {
        self.sp
    }

    fn arg0(&self) -> u64 {
        self.args[0]
    }
    fn arg1(&self) -> u64 {
        self.args[1]
    }
    fn arg2(&self) -> u64 {
        self.args[2]
    }
    fn arg3(&self) -> u64 {
        self.args[3]
    }
    fn arg4(&self) -> u64 {
        self.args[4]
    }
    fn arg5(&self) -> u64 {
        self.args[5]
    }
    fn arg6(&self) -> u64 {
        self.args[6]
    }

    fn syscall_descriptor(&self) -> u32 {
        self.descriptor
    }

    fn ret0(&mut self, v: u64) {
        self.rets[0] = v;
    }
    fn ret1(&mut self, v: u64) {
        self.rets[1] = v;
    }
    fn ret2(&mut self, v: u64) {
        self.rets[2] = v;
    }
}

/// Board description. The host has no interrupt controller to locate, so
/// this is empty; it exists so `start_kernel` has a uniform signature.
#[derive(Clone, Debug, Default)]
pub struct BoardConfig {}

/// An entry in the interrupt dispatch table. Unused on the host beyond type
/// checking of application init code.
pub struct IrqEntry {
    pub intid: abi::InterruptNum,
    pub priority: u8,
    pub handler: fn(&mut crate::kernel::Kernel<'_>, abi::InterruptNum) -> bool,
}

static PENDING_SWITCH: AtomicBool = AtomicBool::new(false);
static CRIT_DEPTH: AtomicU32 = AtomicU32::new(0);

/// Resets the saved state of `task` so that, were it ever resumed, it would
/// begin fresh at `entry`. There is no frame to build on this backend; the
/// register file is reset and the stack pointer parked at the top of the
/// task's stack.
pub fn reinitialize(task: &mut task::Task, entry: u64, argument: u64) {
    let sp = task.stack_top();
    let save = task.save_mut();
    *save = SavedState::DEFAULT;
    save.sp = sp;
    save.pc = entry;
    save.args[0] = argument;
}

/// Records the current task. The host keeps no current-task pointer, so
/// this does nothing; it exists for signature parity with hardware.
///
/// # Safety
///
/// Trivially safe here; `unsafe` for parity with the hardware backend.
pub unsafe fn set_current_task(_task: &task::Task) {}

pub fn install_irq_table(_table: &'static [IrqEntry]) {}

pub fn pend_context_switch() {
    PENDING_SWITCH.store(true, Ordering::Relaxed);
}

/// Consumes and returns the pending-switch flag. Tests use this to observe
/// that a wake path requested rescheduling.
pub fn take_pending_switch() -> bool {
    PENDING_SWITCH.swap(false, Ordering::Relaxed)
}

pub fn enter_critical() {
    CRIT_DEPTH.fetch_add(1, Ordering::Relaxed);
}

pub fn exit_critical() {
    let d = CRIT_DEPTH.fetch_sub(1, Ordering::Relaxed);
    uassert!(d > 0);
}

pub fn start_first_task(_board: &BoardConfig, _tick_hz: u32) -> ! {
    panic!("can't enter userland on the host");
}
