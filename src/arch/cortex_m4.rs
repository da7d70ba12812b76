//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor:
//! context switching via PendSV, the SysTick scheduler clock, PRIMASK
//! interrupt masking and first-run stack frames.
//!
//! ## Context switch mechanism
//!
//! The Cortex-M4 uses a split-stack model: MSP for the kernel and
//! interrupt handlers, PSP for tasks in Thread mode. On exception entry
//! the hardware stacks R0–R3, R12, LR, PC and xPSR onto the process
//! stack; the PendSV handler saves and restores R4–R11 around the
//! scheduler's pick, completing the full context.
//!
//! ## Interrupt priorities
//!
//! SysTick and PendSV both run at the lowest priority (0xFF) so a context
//! switch never preempts an application ISR.

use core::arch::asm;

use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::register::primask;

use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::task::TaskEntry;

// ---------------------------------------------------------------------------
// Interrupt mask
// ---------------------------------------------------------------------------

/// Mask interrupts.
///
/// # Returns
/// The previous PRIMASK state (1 = already masked), for
/// `restore_interrupts`. Nested critical sections compose by
/// save/restore.
pub fn disable_interrupts() -> u32 {
    let saved = if primask::read().is_active() { 0 } else { 1 };
    cortex_m::interrupt::disable();
    saved
}

/// Restore the PRIMASK state saved by `disable_interrupts`.
pub fn restore_interrupts(saved: u32) {
    if saved != 0 {
        // Safety: only re-enables what disable_interrupts turned off.
        unsafe { cortex_m::interrupt::enable() };
    }
}

/// Whether interrupts are currently masked.
pub fn interrupts_masked() -> bool {
    !primask::read().is_active()
}

// ---------------------------------------------------------------------------
// ISR context
// ---------------------------------------------------------------------------

/// Whether the caller runs in handler mode (IPSR != 0).
pub fn in_isr() -> bool {
    let ipsr: u32;
    unsafe { asm!("mrs {}, IPSR", out(reg) ipsr) };
    ipsr != 0
}

/// Handler-mode context is tracked by the hardware; nothing to do.
pub fn enter_isr() {}

/// Handler-mode context is tracked by the hardware; nothing to do.
pub fn exit_isr() {}

// ---------------------------------------------------------------------------
// Context switching
// ---------------------------------------------------------------------------

const ICSR: *mut u32 = 0xE000_ED04 as *mut u32;
const PENDSVSET: u32 = 1 << 28;
const PENDSVCLR: u32 = 1 << 27;

/// Pend a PendSV exception: the deferred context switch. It fires at the
/// lowest priority, once no other ISR is active.
#[inline]
pub fn request_context_switch() {
    unsafe { core::ptr::write_volatile(ICSR, PENDSVSET) };
}

/// Consume a pending context-switch request.
pub fn take_context_switch_request() -> bool {
    let pending = unsafe { core::ptr::read_volatile(ICSR) } & PENDSVSET != 0;
    if pending {
        unsafe { core::ptr::write_volatile(ICSR, PENDSVCLR) };
    }
    pending
}

/// Sleep until the next interrupt.
#[inline]
pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

/// Lay the first-run frame at `top`: the hardware-stacked R0–R3, R12, LR,
/// PC, xPSR (with the task parameter in R0 and the entry point in PC),
/// then the software-saved R4–R11 below it.
///
/// # Returns
/// The new top-of-stack word index.
pub fn init_stack(stack: &mut [usize], top: usize, entry: TaskEntry, parameter: usize) -> usize {
    let mut sp = top;

    // Hardware-stacked frame, highest address first.
    sp -= 1;
    stack[sp] = 0x0100_0000; // xPSR, Thumb bit set
    sp -= 1;
    stack[sp] = entry as usize; // PC
    sp -= 1;
    stack[sp] = task_exit_trap as usize; // LR
    sp -= 5; // R12, R3, R2, R1
    stack[sp] = parameter; // R0
    for word in stack[sp + 1..sp + 5].iter_mut() {
        *word = 0;
    }

    // Software-saved context (R4-R11).
    sp -= 8;
    for word in stack[sp..sp + 8].iter_mut() {
        *word = 0;
    }
    sp
}

/// Landing pad for a task entry that returns. Entries never return by
/// type, so reaching this is a corrupted stack.
extern "C" fn task_exit_trap() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

/// Escalation point of the context-switch watermark check.
pub fn stack_overflow_hook(_task_name: &str) -> ! {
    cortex_m::interrupt::disable();
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_HZ` from the processor clock.
pub fn configure_systick(syst: &mut cortex_m::peripheral::SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Set PendSV and SysTick to the lowest interrupt priority so context
/// switches never preempt application ISRs.
pub fn set_interrupt_priorities() {
    // System Handler Priority Register 3: PendSV [23:16], SysTick [31:24].
    const SHPR3: *mut u32 = 0xE000_ED20 as *mut u32;
    unsafe {
        let value = core::ptr::read_volatile(SHPR3) | (0xFF << 16) | (0xFF << 24);
        core::ptr::write_volatile(SHPR3, value);
    }
}

// ---------------------------------------------------------------------------
// First task launch
// ---------------------------------------------------------------------------

/// Switch Thread mode onto the PSP and branch into the first task.
/// Called once from `kernel::start`; never returns.
///
/// # Safety
/// `psp` must point at a frame laid by `init_stack`.
pub unsafe fn start_first_task(psp: *const usize) -> ! {
    asm!(
        "adds r0, #32",       // skip the software-saved R4-R11
        "msr psp, r0",
        "movs r0, #2",        // CONTROL.SPSEL = 1: Thread mode on PSP
        "msr control, r0",
        "isb",
        "pop {{r0-r3, r12}}", // hand-unstack the hardware frame
        "pop {{r4}}",         // LR (discarded; entries never return)
        "pop {{r5}}",         // PC
        "pop {{r6}}",         // xPSR (set by the core on the branch)
        "cpsie i",
        "bx r5",
        in("r0") psp,
        options(noreturn)
    );
}

// ---------------------------------------------------------------------------
// Exception handlers
// ---------------------------------------------------------------------------

/// Save the outgoing task's PSP. Called from the PendSV prologue.
#[no_mangle]
unsafe extern "C" fn save_task_context(psp: *mut usize) {
    let scheduler = &mut *crate::kernel::SCHEDULER_PTR;
    if let Some(current) = scheduler.current_task {
        if let Some(task) = scheduler.tasks[current].as_mut() {
            let base = task.stack.as_ptr() as usize;
            task.top_of_stack = (psp as usize - base) / core::mem::size_of::<usize>();
        }
    }
}

/// Run the picker and return the incoming task's PSP. Called from PendSV.
#[no_mangle]
unsafe extern "C" fn pick_task_context() -> *mut usize {
    let scheduler = &mut *crate::kernel::SCHEDULER_PTR;
    let next = scheduler.switch_context();
    let task = scheduler.tasks[next].as_mut().expect("picked a dead task");
    task.stack.as_mut_ptr().add(task.top_of_stack)
}

/// PendSV exception: the context switch itself.
///
/// # Safety
/// Naked handler; follows the Cortex-M4 exception entry/exit convention.
#[no_mangle]
#[naked]
pub unsafe extern "C" fn PendSV() {
    asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",  // save software context onto task stack
        "bl {save}",              // record the outgoing PSP
        "bl {pick}",              // returns the incoming PSP in r0
        "ldmia r0!, {{r4-r11}}",  // restore software context
        "msr psp, r0",
        "ldr r0, =0xFFFFFFFD",    // EXC_RETURN: Thread mode, PSP
        "bx r0",
        save = sym save_task_context,
        pick = sym pick_task_context,
        options(noreturn)
    );
}

/// SysTick exception: drive the kernel clock and pend a switch when the
/// tick handler asks for one.
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    let scheduler = &mut *crate::kernel::SCHEDULER_PTR;
    if scheduler.tick() {
        request_context_switch();
    }
}
