//! # Hosted Simulation Port
//!
//! A port layer with no hardware underneath it, used on every target that
//! is not bare-metal ARM — most importantly the host running the test
//! suite. Interrupt masking is a nesting counter, ISR context is a flag
//! the caller toggles, and a context-switch request is latched for the
//! simulation loop (or a test) to consume. Stack frames are synthetic but
//! real enough that stack re-initialisation and the overflow watermark
//! behave as they do on hardware.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::task::TaskEntry;

static MASK_DEPTH: AtomicU32 = AtomicU32::new(0);
static ISR_DEPTH: AtomicU32 = AtomicU32::new(0);
static SWITCH_REQUESTED: AtomicBool = AtomicBool::new(false);

// ---------------------------------------------------------------------------
// Interrupt mask
// ---------------------------------------------------------------------------

/// Mask "interrupts".
///
/// # Returns
/// The previous mask state, to be handed back to `restore_interrupts`.
/// Nested sections compose by save/restore, like PRIMASK on the real port.
pub fn disable_interrupts() -> u32 {
    MASK_DEPTH.fetch_add(1, Ordering::SeqCst)
}

/// Undo one `disable_interrupts`.
pub fn restore_interrupts(_saved: u32) {
    let previous = MASK_DEPTH.fetch_sub(1, Ordering::SeqCst);
    debug_assert!(previous > 0, "unbalanced interrupt mask");
}

/// Whether the simulated mask is currently raised.
pub fn interrupts_masked() -> bool {
    MASK_DEPTH.load(Ordering::SeqCst) > 0
}

// ---------------------------------------------------------------------------
// ISR context
// ---------------------------------------------------------------------------

/// Mark the start of simulated ISR processing. Nests, so concurrent test
/// threads compose the way nested hardware interrupts would.
pub fn enter_isr() {
    ISR_DEPTH.fetch_add(1, Ordering::SeqCst);
}

/// Mark the end of simulated ISR processing.
pub fn exit_isr() {
    let previous = ISR_DEPTH.fetch_sub(1, Ordering::SeqCst);
    debug_assert!(previous > 0, "unbalanced ISR markers");
}

/// Whether the caller is in simulated ISR context.
pub fn in_isr() -> bool {
    ISR_DEPTH.load(Ordering::SeqCst) > 0
}

// ---------------------------------------------------------------------------
// Context switching
// ---------------------------------------------------------------------------

/// Latch a context-switch request. The real port pends PendSV here; the
/// simulation records the request for the driving loop to act on.
pub fn request_context_switch() {
    SWITCH_REQUESTED.store(true, Ordering::SeqCst);
}

/// Consume a latched context-switch request.
pub fn take_context_switch_request() -> bool {
    SWITCH_REQUESTED.swap(false, Ordering::SeqCst)
}

/// Nothing to wait on in simulation.
pub fn wait_for_interrupt() {}

/// Lay a synthetic first-run frame at `top`, mirroring the shape of the
/// Cortex-M exception frame: a status word, the entry point, and the
/// parameter where the hardware frame carries R0.
///
/// # Returns
/// The new top-of-stack word index.
pub fn init_stack(stack: &mut [usize], top: usize, entry: TaskEntry, parameter: usize) -> usize {
    let mut sp = top;
    sp -= 1;
    stack[sp] = 0x0100_0000; // status word
    sp -= 1;
    stack[sp] = entry as usize; // resume point
    sp -= 1;
    stack[sp] = parameter; // R0 slot
    sp
}

/// Escalation point of the context-switch watermark check. In simulation a
/// corrupted stack is a failed test.
pub fn stack_overflow_hook(task_name: &str) -> ! {
    panic!("stack overflow in task {task_name}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_nesting_balances() {
        let outer = disable_interrupts();
        let inner = disable_interrupts();
        assert!(interrupts_masked());
        restore_interrupts(inner);
        assert!(interrupts_masked());
        restore_interrupts(outer);
    }

    #[test]
    fn test_init_stack_lays_resume_frame() {
        extern "C" fn entry(_: usize) -> ! {
            loop {}
        }
        let mut stack = [0usize; 16];
        let sp = init_stack(&mut stack, 14, entry, 0x1234);
        assert_eq!(sp, 11);
        assert_eq!(stack[11], 0x1234);
        assert_eq!(stack[12], entry as usize);
    }
}
