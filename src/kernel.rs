//! # Kernel
//!
//! Top-level kernel initialization and the public API.
//!
//! The kernel owns the single global [`Scheduler`] instance and wraps
//! every entry point in a critical section. The ISR-safe variants use the
//! same save/restore interrupt mask, so they compose with whatever mask
//! state the interrupt arrived with.
//!
//! ## Startup sequence
//!
//! ```text
//! reset / main()
//!   ├─► kernel::init()             ← construct the scheduler
//!   ├─► kernel::create_periodic()  ← register tasks (×N), or
//!   ├─► kernel::admit_batch()      ← rate-monotonic batch admission
//!   ├─► kernel::init_server()      ← deferrable-server budget
//!   └─► kernel::start()            ← idle task + tick source + dispatch
//! ```

use core::mem::MaybeUninit;
use core::ptr;

use crate::admission;
use crate::arch;
use crate::config::Tick;
use crate::error::KernelError;
use crate::scheduler::Scheduler;
use crate::sync;
use crate::task::{NotifyAction, TaskEntry, TaskId};

// ---------------------------------------------------------------------------
// Global scheduler instance
// ---------------------------------------------------------------------------

/// Global scheduler storage. `MaybeUninit` because the scheduler's
/// constructor is not `const`; written exactly once by `init()`.
static mut SCHEDULER: MaybeUninit<Scheduler> = MaybeUninit::uninit();

/// Raw pointer to the global scheduler. Used by the arch layer (PendSV,
/// SysTick handlers), which cannot easily hold references.
///
/// # Safety
/// Set once during `init()`; every access after that goes through a
/// critical section or runs in ISR context where interrupts serialise.
#[no_mangle]
pub static mut SCHEDULER_PTR: *mut Scheduler = ptr::null_mut();

/// Initialize the kernel. Must be called exactly once, before any other
/// kernel function.
pub fn init() {
    unsafe {
        let slot = ptr::addr_of_mut!(SCHEDULER).cast::<Scheduler>();
        slot.write(Scheduler::new());
        SCHEDULER_PTR = slot;
    }
}

// ---------------------------------------------------------------------------
// Task lifecycle
// ---------------------------------------------------------------------------

/// Create a task.
///
/// # Returns
/// The new task's handle, or `OutOfMemory` with no state changed.
pub fn create_task(
    entry: TaskEntry,
    name: &str,
    stack_depth: usize,
    parameter: usize,
    priority: u8,
) -> Result<TaskId, KernelError> {
    sync::critical_section(|| unsafe {
        (*SCHEDULER_PTR).create_task(entry, name, stack_depth, parameter, priority)
    })
}

/// Create a task with a periodic record: first release at `arrival`,
/// releases every `period`, `duration` ticks of budget per release.
#[allow(clippy::too_many_arguments)]
pub fn create_periodic(
    entry: TaskEntry,
    name: &str,
    stack_depth: usize,
    parameter: usize,
    priority: u8,
    arrival: Tick,
    period: Tick,
    duration: Tick,
) -> Result<TaskId, KernelError> {
    sync::critical_section(|| unsafe {
        (*SCHEDULER_PTR).create_periodic(
            entry, name, stack_depth, parameter, priority, arrival, period, duration,
        )
    })
}

/// Delete a task; `None` deletes the caller (deferred to the idle task).
pub fn delete(handle: Option<TaskId>) {
    sync::critical_section(|| unsafe { (*SCHEDULER_PTR).delete_task(handle) })
}

/// Logical restart of the calling periodic task.
pub fn delete_logical() {
    sync::critical_section(|| unsafe { (*SCHEDULER_PTR).delete_logical() })
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Delay the calling task for `ticks` ticks.
pub fn delay(ticks: Tick) {
    sync::critical_section(|| unsafe { (*SCHEDULER_PTR).delay(ticks) })
}

/// Drift-free periodic delay; see [`Scheduler::delay_until`].
pub fn delay_until(previous_wake: &mut Tick, increment: Tick) -> bool {
    sync::critical_section(|| unsafe { (*SCHEDULER_PTR).delay_until(previous_wake, increment) })
}

/// Current tick count.
pub fn get_tick_count() -> Tick {
    sync::critical_section(|| unsafe { (*SCHEDULER_PTR).get_tick_count() })
}

/// Current tick count, callable from ISR context.
pub fn get_tick_count_from_isr() -> Tick {
    let saved = arch::disable_interrupts();
    let count = unsafe { (*SCHEDULER_PTR).get_tick_count() };
    arch::restore_interrupts(saved);
    count
}

// ---------------------------------------------------------------------------
// Suspension
// ---------------------------------------------------------------------------

/// Park a task off the timeline; `None` suspends the caller.
pub fn suspend(handle: Option<TaskId>) {
    sync::critical_section(|| unsafe { (*SCHEDULER_PTR).suspend_task(handle) })
}

/// Return a suspended task to the ready lists.
pub fn resume(handle: TaskId) {
    sync::critical_section(|| unsafe { (*SCHEDULER_PTR).resume_task(handle) })
}

/// ISR-safe resume.
///
/// # Returns
/// Whether the ISR should request a context switch on exit.
pub fn resume_from_isr(handle: TaskId) -> bool {
    let saved = arch::disable_interrupts();
    let yield_required = unsafe { (*SCHEDULER_PTR).resume_task_from_isr(handle) };
    arch::restore_interrupts(saved);
    yield_required
}

/// Suspend the scheduler: ticks defer, ISR wakes divert to the
/// pending-ready list. Nestable.
pub fn suspend_all() {
    sync::critical_section(|| unsafe { (*SCHEDULER_PTR).suspend_all() })
}

/// Undo one `suspend_all`; on the last, drain deferred work and yield if
/// needed.
pub fn resume_all() -> bool {
    sync::critical_section(|| unsafe { (*SCHEDULER_PTR).resume_all() })
}

// ---------------------------------------------------------------------------
// Priorities and identity
// ---------------------------------------------------------------------------

/// The calling task's handle.
pub fn get_current_task() -> Option<TaskId> {
    sync::critical_section(|| unsafe { (*SCHEDULER_PTR).current_task })
}

/// Effective priority of a task; `None` queries the caller.
pub fn get_priority(handle: Option<TaskId>) -> u8 {
    sync::critical_section(|| unsafe { (*SCHEDULER_PTR).get_priority(handle) })
}

/// Change a task's base priority (clamped to the valid range).
pub fn set_priority(handle: Option<TaskId>, new_priority: u8) {
    sync::critical_section(|| unsafe { (*SCHEDULER_PTR).set_priority(handle, new_priority) })
}

/// Name of a task, copied out (the TCB may be reclaimed at any time);
/// `None` queries the caller.
pub fn task_name(handle: Option<TaskId>) -> arrayvec::ArrayString<{ crate::config::MAX_TASK_NAME_LEN }> {
    sync::critical_section(|| unsafe {
        let mut name = arrayvec::ArrayString::new();
        let _ = name.try_push_str((*SCHEDULER_PTR).task_name(handle));
        name
    })
}

/// Voluntarily hand over the processor.
pub fn yield_now() {
    arch::request_context_switch();
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Take the caller's notification value; see [`Scheduler::notify_take`].
pub fn notify_take(clear_on_exit: bool, ticks_to_wait: Tick) -> u32 {
    sync::critical_section(|| unsafe { (*SCHEDULER_PTR).notify_take(clear_on_exit, ticks_to_wait) })
}

/// Wait for a notification; see [`Scheduler::notify_wait`].
pub fn notify_wait(clear_on_entry: u32, clear_on_exit: u32, ticks_to_wait: Tick) -> (bool, u32) {
    sync::critical_section(|| unsafe {
        (*SCHEDULER_PTR).notify_wait(clear_on_entry, clear_on_exit, ticks_to_wait)
    })
}

/// Notify a task.
pub fn notify(target: TaskId, value: u32, action: NotifyAction) -> Result<(), ()> {
    sync::critical_section(|| unsafe { (*SCHEDULER_PTR).notify(target, value, action) })
}

/// ISR-safe notify.
///
/// # Returns
/// `(result, higher_priority_woken)`.
pub fn notify_from_isr(target: TaskId, value: u32, action: NotifyAction) -> (Result<(), ()>, bool) {
    let saved = arch::disable_interrupts();
    let result = unsafe { (*SCHEDULER_PTR).notify_from_isr(target, value, action) };
    arch::restore_interrupts(saved);
    result
}

/// ISR-safe notification "give" (increment).
pub fn notify_give_from_isr(target: TaskId) -> bool {
    let saved = arch::disable_interrupts();
    let woken = unsafe { (*SCHEDULER_PTR).notify_give_from_isr(target) };
    arch::restore_interrupts(saved);
    woken
}

// ---------------------------------------------------------------------------
// Server and admission
// ---------------------------------------------------------------------------

/// Configure the deferrable server's budget.
pub fn init_server(capacity: Tick, period: Tick) {
    sync::critical_section(|| unsafe { (*SCHEDULER_PTR).server.init(capacity, period) })
}

/// Admit a batch specification line (see `admission.rs` for the format):
/// all entries or none, under the rate-monotonic feasibility test.
/// Created tasks run `entry`.
pub fn admit_batch(spec: &str, entry: TaskEntry) -> Result<(), KernelError> {
    sync::critical_section(|| unsafe {
        let now = (*SCHEDULER_PTR).get_tick_count();
        let requests = admission::parse_batch(spec, now)?;
        (*SCHEDULER_PTR).admit_batch(&requests, entry)
    })
}

// ---------------------------------------------------------------------------
// Scheduler start / stop
// ---------------------------------------------------------------------------

/// The idle task: reclaims self-deleted tasks, then waits for the next
/// interrupt.
extern "C" fn idle_entry(_: usize) -> ! {
    loop {
        sync::critical_section(|| unsafe {
            (*SCHEDULER_PTR).reclaim_terminated();
        });
        arch::wait_for_interrupt();
    }
}

/// Start the scheduler on Cortex-M4: SysTick on, handler priorities set,
/// idle task created, first task launched. **Does not return.** On an
/// allocation failure during startup the processor parks with interrupts
/// off.
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub fn start(mut core_peripherals: cortex_m::Peripherals) -> ! {
    use crate::arch::cortex_m4;

    cortex_m4::configure_systick(&mut core_peripherals.SYST);
    cortex_m4::set_interrupt_priorities();

    let first_sp = sync::critical_section(|| unsafe {
        let scheduler = &mut *SCHEDULER_PTR;
        if scheduler.start_scheduler(idle_entry).is_err() {
            return None;
        }
        let first = scheduler.switch_context();
        let task = scheduler.tasks[first].as_mut().expect("picked a dead task");
        Some(task.stack.as_ptr().wrapping_add(task.top_of_stack))
    });

    match first_sp {
        Some(sp) => unsafe { cortex_m4::start_first_task(sp) },
        None => {
            // Startup allocation failed; report by parking, as the port
            // has nowhere to return to.
            cortex_m::interrupt::disable();
            loop {
                cortex_m::asm::wfi();
            }
        }
    }
}

/// Start the scheduler on the hosted port: create the idle task and make
/// the first dispatch. The simulation (or test) drives ticks afterwards.
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub fn start() -> Result<(), KernelError> {
    sync::critical_section(|| unsafe {
        (*SCHEDULER_PTR).start_scheduler(idle_entry)?;
        (*SCHEDULER_PTR).switch_context();
        Ok(())
    })
}

/// Stop the scheduler: interrupts off, control back to the port layer.
pub fn end_scheduler() {
    sync::critical_section(|| unsafe { (*SCHEDULER_PTR).end_scheduler() })
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PERIODIC_PRIORITY;

    extern "C" fn noop(_: usize) -> ! {
        loop {}
    }

    // One test drives the whole global surface: the kernel instance is a
    // process-wide singleton, so splitting this up would race under the
    // parallel test harness.
    #[test]
    fn test_global_api_round_trip() {
        init();
        init_server(2, 5);

        let a = create_periodic(noop, "A", 64, 0, PERIODIC_PRIORITY, 0, 4, 1).unwrap();
        assert_eq!(task_name(Some(a)).as_str(), "A");
        assert_eq!(get_priority(Some(a)), PERIODIC_PRIORITY);

        admit_batch("periodic-B-0-6-2", noop).unwrap();
        assert_eq!(
            admit_batch("periodic-C-0-3-2-periodic-D-0-5-3", noop),
            Err(crate::error::KernelError::NotSchedulable)
        );

        start().unwrap();
        assert_eq!(get_current_task(), Some(a), "A has the shortest period");

        // clock plumbing
        let before = get_tick_count();
        unsafe {
            (*SCHEDULER_PTR).tick();
        }
        assert_eq!(get_tick_count(), before + 1);
        assert_eq!(get_tick_count_from_isr(), before + 1);

        // notifications through the global surface
        notify(a, 0b1010, NotifyAction::SetBits).unwrap();
        assert_eq!(notify_take(true, 0), 0b1010);

        suspend_all();
        assert!(!resume_all());

        end_scheduler();
    }
}
