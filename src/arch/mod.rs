//! # Architecture Abstraction Layer
//!
//! The hardware boundary the scheduler core calls through: interrupt
//! masking, context-switch requests, first-run stack frames and the
//! stack-overflow escalation hook.
//!
//! Two ports implement the surface: the Cortex-M4 port on bare-metal ARM
//! builds, and a hosted simulation port everywhere else (host builds and
//! the test suite). The active port's functions are re-exported here so
//! the core is port-agnostic.

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use cortex_m4::{
    disable_interrupts, enter_isr, exit_isr, in_isr, init_stack, interrupts_masked,
    request_context_switch, restore_interrupts, stack_overflow_hook,
    take_context_switch_request, wait_for_interrupt,
};

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub mod hosted;
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub use hosted::{
    disable_interrupts, enter_isr, exit_isr, in_isr, init_stack, interrupts_masked,
    request_context_switch, restore_interrupts, stack_overflow_hook,
    take_context_switch_request, wait_for_interrupt,
};
