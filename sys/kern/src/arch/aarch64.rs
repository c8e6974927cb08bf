// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, you can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for AArch64 (ARMv8-A, EL1 kernel / EL0 tasks).
//!
//! # Exception model
//!
//! The kernel runs at EL1 with `SPSel = 1` and keeps IRQs masked for the
//! whole of every kernel entry; tasks run at EL0t with everything unmasked.
//! Taking an exception to EL1 masks IRQs automatically, and we never unmask
//! them before `eret`, so kernel code is effectively one big critical
//! section and needs no internal locking.
//!
//! All entries from EL0 funnel through two trampolines (synchronous and
//! IRQ) that save the interrupted task's state and call into Rust. Both
//! return through `resume_current_task`, which reloads whatever task
//! `CURRENT_TASK_PTR` names at that point -- which may not be the task that
//! was interrupted.
//!
//! # Where registers live
//!
//! Saved state for a task is split in two, mirroring what the hardware
//! does for us and what it doesn't:
//!
//! - The *volatile* registers (`x0`-`x18`, `x30`) go into a 160-byte frame
//!   pushed onto the task's own stack, below its saved stack pointer.
//! - The *callee-saved* registers (`x19`-`x29`), the frame base, and the
//!   `ELR`/`SPSR`/`ESR` system registers go into the save area at the start
//!   of the task control block, where Rust can reach them through
//!   [`SavedState`].
//!
//! This split is why the syscall ABI passes arguments in `x19`-`x25` and
//! returns results in `x19`-`x21`: those are the registers that land in the
//! TCB on every entry, so the kernel can read and write them without
//! touching user memory. The syscall number travels in the `SVC` immediate,
//! which the CPU deposits in `ESR_EL1`.
//!
//! A freshly created task gets a hand-built frame laid out exactly as the
//! entry path would have pushed it, so first dispatch and resumption after
//! preemption are the same code path.
//!
//! # Interrupts and time
//!
//! Interrupt routing uses a GICv3 in affinity-routing mode, all interrupts
//! in Group 1, on a single PE. The kernel tick comes from the EL1 physical
//! timer (PPI 30), reloaded once per expiry from a divisor computed out of
//! `CNTFRQ_EL0` at startup.
//!
//! Handlers for driver interrupts come from a table installed before the
//! first task runs; see [`install_irq_table`]. An interrupt with no table
//! entry is a configuration error and panics.
//!
//! # Memory
//!
//! The kernel assumes the loader has set up a flat mapping shared by
//! kernel and tasks. There is no per-task memory protection; stack overrun
//! is detected by limit checks at kernel entry rather than by faulting.

use core::arch::{asm, global_asm};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use aarch64_cpu::asm::barrier;
use aarch64_cpu::registers::{
    CNTFRQ_EL0, CNTP_CTL_EL0, CNTP_CVAL_EL0, CNTP_TVAL_EL0, CPACR_EL1,
    ELR_EL1, ESR_EL1, FAR_EL1, VBAR_EL1,
};
#[cfg(feature = "fpu-context")]
use abi::TaskFlags;
use abi::{FaultInfo, FaultSource, InterruptNum};
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::kernel::Kernel;
use crate::startup::with_kernel;
use crate::syscalls;
use crate::task::{self, ArchState, NextTask};
use crate::umem::USlice;

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

/// Kernel debug output. Expands to nothing unless the `klog-semihosting`
/// feature routes it to the debugger console.
#[cfg(feature = "klog-semihosting")]
macro_rules! klog {
    ($s:expr) => {
        $crate::arch::klog_write(format_args!($s))
    };
    ($s:expr, $($tt:tt)*) => {
        $crate::arch::klog_write(format_args!($s, $($tt)*))
    };
}

#[cfg(not(feature = "klog-semihosting"))]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

/// Size of the register frame the entry trampolines push onto the user
/// stack: `x0`-`x18` plus `x30`.
const FRAME_SIZE: usize = 20 * 8;

/// `SPSR_EL1` value for task execution: EL0t, all interrupts and aborts
/// unmasked.
const SPSR_EL0T: u64 = 0;

/// Link register value planted in a fresh task so that returning from its
/// entry point traps. The address is in no mapped code region and is not
/// 4-aligned, so the fetch faults immediately and the fault handler can
/// recognize it.
const ENTRY_RETURN_SENTINEL: u64 = 0x1;

/// IRQ mask bit in `DAIF`/`SPSR`.
const DAIF_I: u64 = 1 << 7;

/// GIC INTID of the EL1 physical timer's private interrupt.
const TIMER_INTID: u32 = 30;

/// GIC priority assigned to the tick. The kernel never nests interrupts,
/// so this is about arbitration between pending interrupts only.
const TIMER_PRIORITY: u8 = 0x80;

// Exception class values from ESR_EL1.EC that we tell apart.
const EC_UNKNOWN: u64 = 0b000000;
const EC_FP_ACCESS: u64 = 0b000111;
const EC_ILLEGAL_STATE: u64 = 0b001110;
const EC_SVC64: u64 = 0b010101;
const EC_IABORT_LOW: u64 = 0b100000;
const EC_PC_ALIGN: u64 = 0b100010;
const EC_DABORT_LOW: u64 = 0b100100;
const EC_BRK64: u64 = 0b111100;

/// Register state stored directly in the task control block.
///
/// NOTE: the field layout through `esr` is known to the assembly
/// trampolines below; keep it in sync with the hardcoded offsets there.
/// The `const_assert` items after the type pin the layout down.
#[derive(Debug)]
#[repr(C)]
pub struct SavedState {
    // Callee-saved registers, in order. `x19`-`x25` carry syscall
    // arguments; `x19`-`x21` carry syscall results.
    x19: u64,
    x20: u64,
    x21: u64,
    x22: u64,
    x23: u64,
    x24: u64,
    x25: u64,
    x26: u64,
    x27: u64,
    x28: u64,
    x29: u64,
    /// Base of the register frame on the task stack. The task's `SP_EL0` is
    /// this plus `FRAME_SIZE`.
    psp: u64,
    /// Program counter at which the task resumes.
    elr: u64,
    /// Saved processor state for resumption.
    spsr: u64,
    /// Syndrome recorded at the task's last synchronous entry.
    esr: u64,
    /// FP/SIMD state, saved and restored only for tasks created with
    /// `USES_FPU`.
    #[cfg(feature = "fpu-context")]
    fpu: FpuState,
}

static_assertions::const_assert_eq!(core::mem::offset_of!(SavedState, x19), 0);
static_assertions::const_assert_eq!(core::mem::offset_of!(SavedState, x29), 80);
static_assertions::const_assert_eq!(core::mem::offset_of!(SavedState, psp), 88);
static_assertions::const_assert_eq!(core::mem::offset_of!(SavedState, elr), 96);
static_assertions::const_assert_eq!(core::mem::offset_of!(SavedState, spsr), 104);
static_assertions::const_assert_eq!(core::mem::offset_of!(SavedState, esr), 112);

impl SavedState {
    pub const DEFAULT: Self = Self {
        x19: 0,
        x20: 0,
        x21: 0,
        x22: 0,
        x23: 0,
        x24: 0,
        x25: 0,
        x26: 0,
        x27: 0,
        x28: 0,
        x29: 0,
        psp: 0,
        elr: 0,
        spsr: 0,
        esr: 0,
        #[cfg(feature = "fpu-context")]
        fpu: FpuState::DEFAULT,
    };
}

impl Default for SavedState {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl ArchState for SavedState {
    fn stack_pointer(&self) -> u64 {
        // The frame base, not SP_EL0: the frame is task stack usage too,
        // and this is the honest low-water sample.
        self.psp
    }

    fn arg0(&self) -> u64 {
        self.x19
    }
    fn arg1(&self) -> u64 {
        self.x20
    }
    fn arg2(&self) -> u64 {
        self.x21
    }
    fn arg3(&self) -> u64 {
        self.x22
    }
    fn arg4(&self) -> u64 {
        self.x23
    }
    fn arg5(&self) -> u64 {
        self.x24
    }
    fn arg6(&self) -> u64 {
        self.x25
    }

    fn syscall_descriptor(&self) -> u32 {
        // Low 16 bits of the syndrome are the SVC immediate.
        (self.esr & 0xFFFF) as u32
    }

    fn ret0(&mut self, x: u64) {
        self.x19 = x;
    }
    fn ret1(&mut self, x: u64) {
        self.x20 = x;
    }
    fn ret2(&mut self, x: u64) {
        self.x21 = x;
    }
}

/// FP/SIMD register state: `V0`-`V31` plus control and status.
#[cfg(feature = "fpu-context")]
#[derive(Debug)]
#[repr(C, align(16))]
pub struct FpuState {
    v: [u64; 64],
    fpcr: u64,
    fpsr: u64,
}

#[cfg(feature = "fpu-context")]
impl FpuState {
    pub const DEFAULT: Self = Self {
        v: [0; 64],
        fpcr: 0,
        fpsr: 0,
    };
}

/// The register frame pushed onto the task stack at kernel entry, and
/// hand-built onto a fresh stack by `reinitialize`.
#[derive(Debug, Default, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ExceptionFrame {
    /// `x0` through `x18`.
    gpr: [u64; 19],
    x30: u64,
}

static_assertions::const_assert_eq!(
    core::mem::size_of::<ExceptionFrame>(),
    FRAME_SIZE
);

/// Hardware addresses the kernel needs from the board: the GIC register
/// blocks. Everything else is discovered or architectural.
#[derive(Clone, Debug)]
pub struct BoardConfig {
    /// Base address of the GIC distributor.
    pub gicd_base: usize,
    /// Base address of this core's redistributor frames.
    pub gicr_base: usize,
}

/// One entry in the interrupt dispatch table.
///
/// The handler runs with the kernel borrowed and interrupts masked. It
/// returns `true` if it made a task runnable that may need to preempt the
/// interrupted one.
pub struct IrqEntry {
    pub intid: InterruptNum,
    /// GIC priority byte; lower values win arbitration.
    pub priority: u8,
    pub handler: fn(&mut Kernel<'_>, InterruptNum) -> bool,
}

/// Pointer to the task currently running at EL0. The assembly trampolines
/// save into and restore out of whatever this names, so it must only be
/// changed from inside a kernel entry, between save and restore.
#[no_mangle]
static CURRENT_TASK_PTR: AtomicPtr<task::Task> =
    AtomicPtr::new(core::ptr::null_mut());

static IRQ_TABLE_BASE: AtomicPtr<IrqEntry> =
    AtomicPtr::new(core::ptr::null_mut());
static IRQ_TABLE_LEN: AtomicUsize = AtomicUsize::new(0);

/// Set when a wake path during interrupt handling wants a reschedule before
/// returning to EL0; consumed once at the outermost interrupt exit.
static PENDING_SWITCH: AtomicBool = AtomicBool::new(false);

/// Nesting depth of interrupt handling. On this port interrupts do not
/// nest in hardware, but the counter keeps the "defer the switch to the
/// outermost exit" logic explicit and lets handlers ask where they are.
static IRQ_DEPTH: AtomicU32 = AtomicU32::new(0);

static CRIT_DEPTH: AtomicU32 = AtomicU32::new(0);
static CRIT_WAS_MASKED: AtomicBool = AtomicBool::new(false);

/// Timer reload value for one kernel tick, in counter cycles.
static TICK_DIVISOR: AtomicU32 = AtomicU32::new(0);

/// Sets up `task`'s save area and stack so that dispatching it enters
/// `entry` with `argument` in `x0`, exactly as if it had been preempted
/// there.
pub fn reinitialize(task: &mut task::Task, entry: u64, argument: u64) {
    *task.save_mut() = SavedState::default();

    // The arena hands out 16-aligned extents, which is also what AAPCS64
    // demands of a stack.
    let stack_top = task.stack_top();
    uassert!(stack_top & 0xF == 0);

    let frame_base = stack_top - FRAME_SIZE as u64;
    let mut frame_slice: USlice<ExceptionFrame> =
        match USlice::from_raw(frame_base as usize, 1) {
            Ok(s) => s,
            Err(_) => panic!(),
        };
    // Safety: the frame lies within the task's stack extent, which the
    // kernel owns and which meets the minimum stack size.
    let frame = &mut unsafe { frame_slice.assume_writable() }[0];
    *frame = ExceptionFrame::default();
    frame.gpr[0] = argument;
    frame.x30 = ENTRY_RETURN_SENTINEL;

    let save = task.save_mut();
    save.psp = frame_base;
    save.elr = entry;
    save.spsr = SPSR_EL0T;
}

/// Records the current task in the location the entry trampolines read.
///
/// # Safety
///
/// This records a pointer that aliases `task`, which the next kernel entry
/// will turn into `&mut`. Call it only on a task that lives in the kernel's
/// task table, and only between state save and state restore.
pub unsafe fn set_current_task(task: &task::Task) {
    CURRENT_TASK_PTR.store(task as *const _ as *mut _, Ordering::Relaxed);
}

/// Installs the interrupt dispatch table. Must happen before the first
/// task is dispatched; the table is never changed afterwards.
pub fn install_irq_table(table: &'static [IrqEntry]) {
    uassert!(CURRENT_TASK_PTR.load(Ordering::Relaxed).is_null());
    IRQ_TABLE_BASE.store(table.as_ptr() as *mut _, Ordering::Relaxed);
    IRQ_TABLE_LEN.store(table.len(), Ordering::Relaxed);
}

fn irq_table() -> &'static [IrqEntry] {
    let base = IRQ_TABLE_BASE.load(Ordering::Relaxed);
    if base.is_null() {
        return &[];
    }
    let len = IRQ_TABLE_LEN.load(Ordering::Relaxed);
    // Safety: installed once from a &'static slice before interrupts were
    // enabled, never mutated after.
    unsafe { core::slice::from_raw_parts(base, len) }
}

/// Requests a context switch at the end of interrupt handling.
pub fn pend_context_switch() {
    PENDING_SWITCH.store(true, Ordering::Relaxed);
}

/// Consumes a pending switch request, returning whether one was pending.
pub fn take_pending_switch() -> bool {
    PENDING_SWITCH.swap(false, Ordering::Relaxed)
}

/// Enters a critical section by masking IRQs. Nests; the mask state
/// observed at the outermost enter is restored by the matching exit.
pub fn enter_critical() {
    let daif: u64;
    // Safety: reads processor state only.
    unsafe {
        asm!("mrs {}, DAIF", out(reg) daif, options(nomem, nostack));
    }
    let was_masked = daif & DAIF_I != 0;
    // Safety: masking interrupts cannot violate memory safety.
    unsafe {
        asm!("msr DAIFSet, #2", options(nomem, nostack));
    }
    if CRIT_DEPTH.fetch_add(1, Ordering::Relaxed) == 0 {
        CRIT_WAS_MASKED.store(was_masked, Ordering::Relaxed);
    }
}

/// Leaves a critical section entered with `enter_critical`.
pub fn exit_critical() {
    let depth = CRIT_DEPTH.fetch_sub(1, Ordering::Relaxed);
    uassert!(depth > 0);
    if depth == 1 && !CRIT_WAS_MASKED.load(Ordering::Relaxed) {
        // Safety: unmasking restores the state observed at the outermost
        // enter.
        unsafe {
            asm!("msr DAIFClr, #2", options(nomem, nostack));
        }
    }
}

/// Hands the CPU to the task named by `CURRENT_TASK_PTR`, after bringing up
/// exception vectors, the interrupt controller, and the tick timer.
///
/// `startup::start_kernel` is responsible for having scheduled a task and
/// recorded it before calling this.
pub fn start_first_task(board: &BoardConfig, tick_hz: u32) -> ! {
    uassert!(!CURRENT_TASK_PTR.load(Ordering::Relaxed).is_null());

    extern "C" {
        static exception_vectors: u8;
    }
    // Safety: taking the address of an assembly label; never dereferenced.
    let vbar = unsafe { core::ptr::addr_of!(exception_vectors) } as u64;
    uassert!(vbar & 0x7FF == 0);
    VBAR_EL1.set(vbar);
    barrier::isb(barrier::SY);

    gic::init(board);
    gic::enable(InterruptNum(TIMER_INTID), TIMER_PRIORITY);
    for entry in irq_table() {
        gic::enable(entry.intid, entry.priority);
    }

    // Program the tick. The divisor stays fixed for the life of the
    // kernel; the timer ISR steps the compare register by it on every
    // expiry. TVAL here just seats the first deadline one period out.
    let freq = CNTFRQ_EL0.get();
    uassert!(tick_hz > 0);
    uassert!(u64::from(tick_hz) <= freq);
    let divisor = (freq / u64::from(tick_hz)) as u32;
    TICK_DIVISOR.store(divisor, Ordering::Relaxed);
    CNTP_TVAL_EL0.set(u64::from(divisor));
    CNTP_CTL_EL0.write(CNTP_CTL_EL0::ENABLE::SET + CNTP_CTL_EL0::IMASK::CLEAR);

    // FP disposition for the first task. Without FP support compiled in,
    // every task traps on FP use.
    #[cfg(feature = "fpu-context")]
    with_kernel(|k| fpu_restore_current(k));
    #[cfg(not(feature = "fpu-context"))]
    CPACR_EL1.modify(CPACR_EL1::FPEN.val(FPEN_TRAP_EL0));

    klog!("starting first task");

    // Safety: the current task pointer names a task whose save area
    // describes a resumable frame; this does not return.
    unsafe { resume_current_task() }
}

// CPACR_EL1.FPEN encodings. Spelled numerically so the intent is visible
// next to the architecture manual.
const FPEN_TRAP_EL0: u64 = 0b01;
#[cfg(feature = "fpu-context")]
const FPEN_TRAP_NOTHING: u64 = 0b11;

extern "C" {
    /// Restores the task named by `CURRENT_TASK_PTR` and `eret`s to it.
    fn resume_current_task() -> !;
}

#[cfg(feature = "fpu-context")]
extern "C" {
    fn fpu_save(state: *mut FpuState);
    fn fpu_restore(state: *const FpuState);
}

/// Captures the interrupted task's FP state, if it owns any. Must run
/// before scheduling moves `current`.
#[cfg(feature = "fpu-context")]
fn fpu_save_current(k: &mut Kernel<'_>) {
    let cur = k.current();
    let t = &mut k.tasks[cur];
    if t.flags().contains(TaskFlags::USES_FPU) {
        // Safety: exclusive borrow of the save area; the helper writes only
        // the pointed-to block.
        unsafe { fpu_save(&mut t.save_mut().fpu) };
    }
}

#[cfg(not(feature = "fpu-context"))]
fn fpu_save_current(_k: &mut Kernel<'_>) {}

/// Loads the about-to-run task's FP state and sets the FP trap to match
/// its entitlement.
#[cfg(feature = "fpu-context")]
fn fpu_restore_current(k: &Kernel<'_>) {
    let t = &k.tasks[k.current()];
    if t.flags().contains(TaskFlags::USES_FPU) {
        CPACR_EL1.modify(CPACR_EL1::FPEN.val(FPEN_TRAP_NOTHING));
        // Safety: reads only the pointed-to block.
        unsafe { fpu_restore(&t.save().fpu) };
    } else {
        CPACR_EL1.modify(CPACR_EL1::FPEN.val(FPEN_TRAP_EL0));
    }
}

#[cfg(not(feature = "fpu-context"))]
fn fpu_restore_current(_k: &Kernel<'_>) {}

/// Common tail of every kernel entry: settle FP ownership, let the
/// scheduler act on `hint`, and aim the restore path at the winner.
fn finish_kernel_entry(k: &mut Kernel<'_>, hint: NextTask) {
    fpu_save_current(k);
    k.schedule(hint);
    let next = k.current();
    // Safety: the reference points into the kernel's task table, which
    // outlives this entry.
    unsafe { set_current_task(&k.tasks[next]) };
    fpu_restore_current(k);
}

/// Rust side of the synchronous exception trampoline. The task's state is
/// already saved; decide whether this was a syscall or a fault and finish
/// the entry.
#[no_mangle]
unsafe extern "C" fn lower_el_sync_entry() {
    with_kernel(|k| {
        let cur = k.current();
        let esr = k.tasks[cur].save().esr;
        k.check_current_stack();
        let ec = (esr >> 26) & 0x3F;
        let hint = if ec == EC_SVC64 {
            let sysnum = (esr & 0xFFFF) as u32;
            syscalls::handle_syscall(k, sysnum)
        } else {
            let fault = task_fault_from_esr(k, esr);
            k.force_fault(cur, fault)
        };
        finish_kernel_entry(k, hint);
    });
}

/// Maps a syndrome taken from EL0 onto the fault the task gets charged
/// with.
fn task_fault_from_esr(k: &Kernel<'_>, esr: u64) -> FaultInfo {
    let ec = (esr >> 26) & 0x3F;
    match ec {
        // FP trap: either no FP support compiled in, or the task was not
        // created with USES_FPU.
        EC_FP_ACCESS => FaultInfo::IllegalInstruction,
        EC_UNKNOWN | EC_ILLEGAL_STATE => FaultInfo::IllegalInstruction,
        EC_IABORT_LOW | EC_PC_ALIGN => {
            let pc = k.tasks[k.current()].save().elr;
            if pc == ENTRY_RETURN_SENTINEL {
                // The task returned from its entry point into the planted
                // link register.
                FaultInfo::EntryReturned
            } else {
                FaultInfo::MemoryAccess {
                    address: Some(pc),
                    source: FaultSource::User,
                }
            }
        }
        EC_DABORT_LOW => FaultInfo::MemoryAccess {
            address: Some(FAR_EL1.get()),
            source: FaultSource::User,
        },
        EC_BRK64 => FaultInfo::Panic,
        _ => FaultInfo::InvalidOperation(esr),
    }
}

/// Rust side of the IRQ trampoline: acknowledge, dispatch, and -- at the
/// outermost exit -- act on any pended switch before resuming EL0.
#[no_mangle]
unsafe extern "C" fn lower_el_irq_entry() {
    let depth = IRQ_DEPTH.fetch_add(1, Ordering::Relaxed);
    if depth == 0 {
        // Charge stack usage to the interrupted task exactly once.
        with_kernel(|k| k.check_current_stack());
    }

    let intid = gic::ack();
    match intid {
        1020..=1023 => {
            // Spurious; nothing to end.
        }
        TIMER_INTID => {
            timer_isr();
            gic::eoi(intid);
        }
        n => {
            dispatch_irq(n);
            gic::eoi(intid);
        }
    }

    let prev = IRQ_DEPTH.fetch_sub(1, Ordering::Relaxed);
    uassert!(prev > 0);
    if prev == 1 {
        let hint = if take_pending_switch() {
            NextTask::Other
        } else {
            NextTask::Same
        };
        with_kernel(|k| finish_kernel_entry(k, hint));
    }
}

fn timer_isr() {
    // Step the compare value by one period. Deadlines stay on the grid
    // fixed at startup: interrupt latency delays delivery of a tick but
    // never shifts the next one, and a late tick makes the following
    // period shorter instead of stretching the epoch.
    let divisor = u64::from(TICK_DIVISOR.load(Ordering::Relaxed));
    CNTP_CVAL_EL0.set(CNTP_CVAL_EL0.get() + divisor);
    let hint = with_kernel(|k| k.tick());
    if hint != NextTask::Same {
        pend_context_switch();
    }
}

fn dispatch_irq(intid: u32) {
    match irq_table().iter().find(|e| e.intid.0 == intid) {
        Some(entry) => {
            let woke = with_kernel(|k| (entry.handler)(k, entry.intid));
            if woke {
                pend_context_switch();
            }
        }
        None => panic!("unhandled IRQ {intid}"),
    }
}

/// Terminal handler for exceptions that should not happen: anything taken
/// at EL1, FIQs, SErrors, AArch32. `vector` is the index of the vector
/// table entry that fired.
#[no_mangle]
unsafe extern "C" fn el1_exception_entry(vector: u64) -> ! {
    crate::fail::die(format_args!(
        "kernel exception: vector={} esr={:#x} elr={:#x} far={:#x}",
        vector,
        ESR_EL1.get(),
        ELR_EL1.get(),
        FAR_EL1.get(),
    ));
}

// Exception vectors and the save/restore trampolines.
//
// The save macro stashes the volatile registers in a frame on the *task*
// stack (without moving SP_EL0; the frame base is recorded in the TCB
// instead) and the callee-saved registers plus ELR/SPSR/ESR in the TCB
// addressed by CURRENT_TASK_PTR. The TCB offsets are those pinned by the
// const_asserts on SavedState; the save area is the TCB's first field.
global_asm! {"
    .macro save_el0_context
    stp x0, x1, [sp, #-16]!
    mrs x0, sp_el0
    sub x0, x0, #160
    stp x2, x3, [x0, #16]
    stp x4, x5, [x0, #32]
    stp x6, x7, [x0, #48]
    stp x8, x9, [x0, #64]
    stp x10, x11, [x0, #80]
    stp x12, x13, [x0, #96]
    stp x14, x15, [x0, #112]
    stp x16, x17, [x0, #128]
    stp x18, x30, [x0, #144]
    ldp x2, x3, [sp], #16
    stp x2, x3, [x0, #0]
    adrp x1, CURRENT_TASK_PTR
    ldr x1, [x1, :lo12:CURRENT_TASK_PTR]
    stp x19, x20, [x1, #0]
    stp x21, x22, [x1, #16]
    stp x23, x24, [x1, #32]
    stp x25, x26, [x1, #48]
    stp x27, x28, [x1, #64]
    mrs x2, elr_el1
    mrs x3, spsr_el1
    stp x29, x0, [x1, #80]
    stp x2, x3, [x1, #96]
    mrs x2, esr_el1
    str x2, [x1, #112]
    .endm

    .section .text.exception_vectors
    .balign 0x800
    .globl exception_vectors
exception_vectors:
    /* Current EL with SP_EL0: the kernel always runs with SPSel = 1. */
    mov x0, #0
    b el1_exception_entry
    .balign 0x80
    mov x0, #1
    b el1_exception_entry
    .balign 0x80
    mov x0, #2
    b el1_exception_entry
    .balign 0x80
    mov x0, #3
    b el1_exception_entry

    /* Current EL with SP_EL1: a fault in the kernel itself. */
    .balign 0x80
    mov x0, #4
    b el1_exception_entry
    .balign 0x80
    mov x0, #5
    b el1_exception_entry
    .balign 0x80
    mov x0, #6
    b el1_exception_entry
    .balign 0x80
    mov x0, #7
    b el1_exception_entry

    /* Lower EL, AArch64: the task entry paths. */
    .balign 0x80
    save_el0_context
    bl lower_el_sync_entry
    b resume_current_task
    .balign 0x80
    save_el0_context
    bl lower_el_irq_entry
    b resume_current_task
    .balign 0x80
    mov x0, #10
    b el1_exception_entry
    .balign 0x80
    mov x0, #11
    b el1_exception_entry

    /* Lower EL, AArch32: never created. */
    .balign 0x80
    mov x0, #12
    b el1_exception_entry
    .balign 0x80
    mov x0, #13
    b el1_exception_entry
    .balign 0x80
    mov x0, #14
    b el1_exception_entry
    .balign 0x80
    mov x0, #15
    b el1_exception_entry

    .section .text.resume_current_task
    .globl resume_current_task
    .type resume_current_task,function
resume_current_task:
    adrp x0, CURRENT_TASK_PTR
    ldr x0, [x0, :lo12:CURRENT_TASK_PTR]
    ldp x19, x20, [x0, #0]
    ldp x21, x22, [x0, #16]
    ldp x23, x24, [x0, #32]
    ldp x25, x26, [x0, #48]
    ldp x27, x28, [x0, #64]
    ldp x29, x1, [x0, #80]
    ldp x2, x3, [x0, #96]
    msr elr_el1, x2
    msr spsr_el1, x3
    add x2, x1, #160
    msr sp_el0, x2
    ldp x2, x3, [x1, #16]
    ldp x4, x5, [x1, #32]
    ldp x6, x7, [x1, #48]
    ldp x8, x9, [x1, #64]
    ldp x10, x11, [x1, #80]
    ldp x12, x13, [x1, #96]
    ldp x14, x15, [x1, #112]
    ldp x16, x17, [x1, #128]
    ldp x18, x30, [x1, #144]
    ldp x0, x1, [x1, #0]
    eret
"}

// FP/SIMD bulk save and restore. These live in assembly so the kernel
// itself can stay soft-float; the target directive scopes FP instruction
// availability to just these routines.
#[cfg(feature = "fpu-context")]
global_asm! {"
    .arch armv8-a+fp+simd

    .section .text.fpu_save
    .globl fpu_save
    .type fpu_save,function
fpu_save:
    stp q0, q1, [x0, #0]
    stp q2, q3, [x0, #32]
    stp q4, q5, [x0, #64]
    stp q6, q7, [x0, #96]
    stp q8, q9, [x0, #128]
    stp q10, q11, [x0, #160]
    stp q12, q13, [x0, #192]
    stp q14, q15, [x0, #224]
    stp q16, q17, [x0, #256]
    stp q18, q19, [x0, #288]
    stp q20, q21, [x0, #320]
    stp q22, q23, [x0, #352]
    stp q24, q25, [x0, #384]
    stp q26, q27, [x0, #416]
    stp q28, q29, [x0, #448]
    stp q30, q31, [x0, #480]
    mrs x1, fpcr
    mrs x2, fpsr
    stp x1, x2, [x0, #512]
    ret

    .section .text.fpu_restore
    .globl fpu_restore
    .type fpu_restore,function
fpu_restore:
    ldp x1, x2, [x0, #512]
    msr fpcr, x1
    msr fpsr, x2
    ldp q0, q1, [x0, #0]
    ldp q2, q3, [x0, #32]
    ldp q4, q5, [x0, #64]
    ldp q6, q7, [x0, #96]
    ldp q8, q9, [x0, #128]
    ldp q10, q11, [x0, #160]
    ldp q12, q13, [x0, #192]
    ldp q14, q15, [x0, #224]
    ldp q16, q17, [x0, #256]
    ldp q18, q19, [x0, #288]
    ldp q20, q21, [x0, #320]
    ldp q22, q23, [x0, #352]
    ldp q24, q25, [x0, #384]
    ldp q26, q27, [x0, #416]
    ldp q28, q29, [x0, #448]
    ldp q30, q31, [x0, #480]
    ret
"}

#[cfg(feature = "fpu-context")]
static_assertions::const_assert_eq!(
    core::mem::offset_of!(FpuState, fpcr),
    512
);

/// Writes a line to the debugger console over the semihosting interface.
#[cfg(feature = "klog-semihosting")]
pub fn klog_write(args: core::fmt::Arguments<'_>) {
    use core::fmt::Write;

    struct SemihostOut;

    impl Write for SemihostOut {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            // SYS_WRITE0 wants a NUL-terminated buffer; chunk through a
            // small one on the stack.
            let mut buf = [0u8; 64];
            for chunk in s.as_bytes().chunks(buf.len() - 1) {
                buf[..chunk.len()].copy_from_slice(chunk);
                buf[chunk.len()] = 0;
                // Safety: the debugger reads the buffer; no kernel state
                // is touched.
                unsafe {
                    asm!(
                        "hlt #0xf000",
                        inout("x0") 0x04u64 => _,
                        in("x1") buf.as_ptr(),
                        options(nostack),
                    );
                }
            }
            Ok(())
        }
    }

    SemihostOut.write_fmt(args).ok();
    SemihostOut.write_str("\n").ok();
}

/// Minimal GICv3 driver: one distributor, one redistributor, affinity
/// routing on, everything in Group 1, single PE.
mod gic {
    use core::arch::asm;
    use core::sync::atomic::{AtomicUsize, Ordering};

    use abi::InterruptNum;
    use tock_registers::interfaces::{Readable, Writeable};
    use tock_registers::register_structs;
    use tock_registers::registers::{ReadOnly, ReadWrite};

    use super::BoardConfig;

    register_structs! {
        /// Distributor register block.
        pub GicdRegisters {
            (0x0000 => ctlr: ReadWrite<u32>),
            (0x0004 => typer: ReadOnly<u32>),
            (0x0008 => iidr: ReadOnly<u32>),
            (0x000c => _reserved0),
            (0x0080 => igroupr: [ReadWrite<u32>; 32]),
            (0x0100 => isenabler: [ReadWrite<u32>; 32]),
            (0x0180 => icenabler: [ReadWrite<u32>; 32]),
            (0x0200 => ispendr: [ReadWrite<u32>; 32]),
            (0x0280 => icpendr: [ReadWrite<u32>; 32]),
            (0x0300 => isactiver: [ReadWrite<u32>; 32]),
            (0x0380 => icactiver: [ReadWrite<u32>; 32]),
            (0x0400 => ipriorityr: [ReadWrite<u8>; 1024]),
            (0x0800 => _reserved1),
            (0x6100 => irouter: [ReadWrite<u64>; 988]),
            (0x7fe0 => @END),
        }
    }

    register_structs! {
        /// Redistributor control frame (RD_base).
        pub GicrRdRegisters {
            (0x0000 => ctlr: ReadWrite<u32>),
            (0x0004 => iidr: ReadOnly<u32>),
            (0x0008 => typer: ReadOnly<u64>),
            (0x0010 => statusr: ReadWrite<u32>),
            (0x0014 => waker: ReadWrite<u32>),
            (0x0018 => @END),
        }
    }

    register_structs! {
        /// Redistributor SGI/PPI frame (SGI_base), one 64 KiB page above
        /// RD_base.
        pub GicrSgiRegisters {
            (0x0000 => _reserved0),
            (0x0080 => igroupr0: ReadWrite<u32>),
            (0x0084 => _reserved1),
            (0x0100 => isenabler0: ReadWrite<u32>),
            (0x0104 => _reserved2),
            (0x0180 => icenabler0: ReadWrite<u32>),
            (0x0184 => _reserved3),
            (0x0400 => ipriorityr: [ReadWrite<u8>; 32]),
            (0x0420 => @END),
        }
    }

    const GICD_CTLR_ENABLE_GRP1: u32 = 1 << 1;
    const GICD_CTLR_ARE: u32 = 1 << 4;
    const GICR_WAKER_PROCESSOR_SLEEP: u32 = 1 << 1;
    const GICR_WAKER_CHILDREN_ASLEEP: u32 = 1 << 2;
    const SGI_FRAME_OFFSET: usize = 0x10000;

    static GICD_BASE: AtomicUsize = AtomicUsize::new(0);
    static GICR_BASE: AtomicUsize = AtomicUsize::new(0);

    fn gicd() -> &'static GicdRegisters {
        let base = GICD_BASE.load(Ordering::Relaxed);
        uassert!(base != 0);
        // Safety: recorded from the board config at init; the register
        // block is there for the life of the kernel.
        unsafe { &*(base as *const GicdRegisters) }
    }

    fn gicr_rd() -> &'static GicrRdRegisters {
        let base = GICR_BASE.load(Ordering::Relaxed);
        uassert!(base != 0);
        // Safety: as for gicd.
        unsafe { &*(base as *const GicrRdRegisters) }
    }

    fn gicr_sgi() -> &'static GicrSgiRegisters {
        let base = GICR_BASE.load(Ordering::Relaxed);
        uassert!(base != 0);
        // Safety: as for gicd.
        unsafe { &*((base + SGI_FRAME_OFFSET) as *const GicrSgiRegisters) }
    }

    /// Brings up the distributor, this core's redistributor, and the CPU
    /// interface. Interrupts remain masked at the CPU until `eret` drops
    /// to EL0.
    pub fn init(board: &BoardConfig) {
        GICD_BASE.store(board.gicd_base, Ordering::Relaxed);
        GICR_BASE.store(board.gicr_base, Ordering::Relaxed);

        let d = gicd();
        d.ctlr.set(GICD_CTLR_ARE | GICD_CTLR_ENABLE_GRP1);
        for r in &d.igroupr {
            r.set(!0);
        }

        // Wake the redistributor and wait for it to come out of sleep.
        gicr_rd().waker_clear_sleep();
        gicr_sgi().igroupr0.set(!0);

        // CPU interface: system register access on, no priority filtering,
        // Group 1 delivery enabled.
        icc_sre_write(0b111);
        isb();
        icc_pmr_write(0xFF);
        icc_igrpen1_write(1);
        isb();
    }

    impl GicrRdRegisters {
        fn waker_clear_sleep(&self) {
            self.waker
                .set(self.waker.get() & !GICR_WAKER_PROCESSOR_SLEEP);
            while self.waker.get() & GICR_WAKER_CHILDREN_ASLEEP != 0 {}
        }
    }

    /// Enables `intid` at `priority`, routing it to this PE.
    pub fn enable(intid: InterruptNum, priority: u8) {
        let n = intid.0 as usize;
        uassert!(n < 1020);
        if n < 32 {
            let sgi = gicr_sgi();
            sgi.ipriorityr[n].set(priority);
            sgi.isenabler0.set(1 << n);
        } else {
            let d = gicd();
            d.ipriorityr[n].set(priority);
            // Affinity 0.0.0.0: the one PE we run on.
            d.irouter[n - 32].set(0);
            d.isenabler[n / 32].set(1 << (n % 32));
        }
    }

    /// Acknowledges the highest-priority pending Group 1 interrupt,
    /// returning its INTID. 1020-1023 are spurious.
    pub fn ack() -> u32 {
        let value: u64;
        // ICC_IAR1_EL1. Reading it activates the interrupt it returns,
        // which is the point.
        // Safety: touches interrupt controller state only.
        unsafe {
            asm!(
                "mrs {}, S3_0_C12_C12_0",
                out(reg) value,
                options(nomem, nostack)
            );
        }
        (value & 0xFF_FFFF) as u32
    }

    /// Signals end of interrupt for `intid`.
    pub fn eoi(intid: u32) {
        // ICC_EOIR1_EL1.
        // Safety: touches interrupt controller state only.
        unsafe {
            asm!(
                "msr S3_0_C12_C12_1, {}",
                in(reg) u64::from(intid),
                options(nomem, nostack)
            );
        }
    }

    // The remaining ICC system registers, by instruction encoding; LLVM
    // accepts the S-form regardless of target features.

    /// ICC_SRE_EL1.
    fn icc_sre_write(value: u64) {
        // Safety: touches interrupt controller state only.
        unsafe {
            asm!(
                "msr S3_0_C12_C12_5, {}",
                in(reg) value,
                options(nomem, nostack)
            );
        }
    }

    /// ICC_PMR_EL1.
    fn icc_pmr_write(value: u64) {
        // Safety: touches interrupt controller state only.
        unsafe {
            asm!(
                "msr S3_0_C4_C6_0, {}",
                in(reg) value,
                options(nomem, nostack)
            );
        }
    }

    /// ICC_IGRPEN1_EL1.
    fn icc_igrpen1_write(value: u64) {
        // Safety: touches interrupt controller state only.
        unsafe {
            asm!(
                "msr S3_0_C12_C12_7, {}",
                in(reg) value,
                options(nomem, nostack)
            );
        }
    }

    fn isb() {
        aarch64_cpu::asm::barrier::isb(aarch64_cpu::asm::barrier::SY);
    }
}
