//! # RMOS Configuration
//!
//! Compile-time constants governing the scheduler and system behavior.
//! All kernel bookkeeping is fixed-size; the only dynamic allocations are
//! task stacks.

/// The kernel tick type. 32 bits wide, and it wraps: the delayed-task
/// machinery keeps a second, "overflow" list for wake times scheduled past
/// the wrap point and swaps the two lists when the counter rolls over.
pub type Tick = u32;

/// Block time meaning "wait forever". A task that blocks with this timeout
/// (where indefinite blocking is permitted) is parked on the suspended list
/// rather than the delayed list, so no timing event can wake it.
pub const MAX_DELAY: Tick = Tick::MAX;

/// Maximum number of tasks the system can manage simultaneously.
/// This bounds the TCB arena; slots are recycled when tasks are deleted.
pub const MAX_TASKS: usize = 16;

/// Number of distinct priority levels. Priorities passed in by the
/// application are clamped to `0..MAX_PRIORITIES`.
pub const MAX_PRIORITIES: u8 = 8;

/// Priority of the idle task. The picker falls back to it when no periodic
/// release is due and the aperiodic server cannot run.
pub const IDLE_PRIORITY: u8 = 0;

/// Priority class of aperiodic tasks served by the deferrable server.
pub const APERIODIC_PRIORITY: u8 = 1;

/// Priority class of rate-monotonic periodic tasks. Within this class the
/// picker orders by period, not by list position.
pub const PERIODIC_PRIORITY: u8 = 2;

/// Maximum length of a task name, including the NUL terminator. Longer
/// names are clamped on creation.
pub const MAX_TASK_NAME_LEN: usize = 16;

/// Number of slots in the deferrable server's refill ring. When the ring is
/// full a newly posted refill is dropped; see `server.rs`.
pub const MAX_REFILLS: usize = 3;

/// Maximum number of entries in one batch admission request.
pub const MAX_BATCH: usize = 8;

/// Number of event lists that can be claimed by IPC-layer objects
/// (mutexes, queues) built on the blocking primitives.
pub const EVENT_LISTS: usize = 4;

/// Stack depth, in words, of the idle task created by `start_scheduler`.
pub const IDLE_STACK_DEPTH: usize = 64;

/// Word written over a fresh stack so the overflow check can recognise
/// untouched memory. The classic 0xA5 debug fill, widened to a word.
pub const STACK_FILL: usize = 0xA5A5_A5A5_A5A5_A5A5_u64 as usize;

/// Number of words at the low end of a stack inspected by the overflow
/// check on every context switch.
pub const STACK_WATERMARK_WORDS: usize = 8;

/// Top-of-stack alignment, in words. The Cortex-M AAPCS requires 8-byte
/// alignment; on the hosted port a word is already pointer-sized.
pub const STACK_ALIGN_WORDS: usize = 2;

/// Whether the kernel preempts the running task when a higher-priority
/// task becomes ready.
pub const USE_PREEMPTION: bool = true;

/// Whether tasks of equal priority share the processor round-robin, one
/// tick at a time.
pub const USE_TIME_SLICING: bool = true;

/// SysTick frequency in Hz. Determines tick granularity on the Cortex-M4
/// port; the hosted port drives ticks explicitly.
pub const TICK_HZ: u32 = 1000;

/// System clock frequency in Hz (STM32F4 at 16 MHz HSI by default).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;
