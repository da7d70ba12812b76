//! # Task Lifecycle
//!
//! Creation, deletion and logical restart of tasks, plus the idle task's
//! reclamation duty.
//!
//! A task is created by allocating its stack (the one dynamic allocation),
//! claiming a TCB arena slot, laying the initial context frame through the
//! port layer and linking the task into the ready list at its priority.
//!
//! Deletion is synchronous when the target is not running: unlink, free,
//! recompute the next unblock time. A task deleting *itself* cannot free
//! the stack it is executing on, so it parks on the terminating list and
//! requests a switch; the idle task frees it later. A periodic task's
//! *logical restart* frees nothing: it bumps the cycle counter, records
//! the TCB in the restart slot and yields — the picker re-initialises the
//! stack image before dispatching it again.

use alloc::boxed::Box;
use alloc::vec::Vec;

use log::debug;

use crate::arch;
use crate::config::{
    Tick, IDLE_PRIORITY, IDLE_STACK_DEPTH, MAX_DELAY, MAX_PRIORITIES, STACK_FILL,
    STACK_WATERMARK_WORDS, USE_PREEMPTION,
};
use crate::error::KernelError;
use crate::list::{self, ItemRef};
use crate::scheduler::Scheduler;
use crate::task::{TaskControlBlock, TaskEntry, TaskId};

/// Allocate a stack of `depth` words, primed with the fill pattern.
/// Fails soft: allocation failure surfaces as `None`, never an abort.
fn allocate_stack(depth: usize) -> Option<Box<[usize]>> {
    let mut words = Vec::new();
    words.try_reserve_exact(depth).ok()?;
    words.resize(depth, STACK_FILL);
    Some(words.into_boxed_slice())
}

impl Scheduler {
    // -- creation -----------------------------------------------------------

    /// Create a task outside the periodic record-keeping (its arrival is
    /// "now" and it has no period or duration).
    pub fn create_task(
        &mut self,
        entry: TaskEntry,
        name: &str,
        stack_depth: usize,
        parameter: usize,
        priority: u8,
    ) -> Result<TaskId, KernelError> {
        let arrival = self.tick_count;
        self.create_periodic(entry, name, stack_depth, parameter, priority, arrival, 0, 0)
    }

    /// Create a task carrying a periodic record: first release at
    /// `arrival`, releases every `period`, budget of `duration` ticks per
    /// release.
    ///
    /// # Returns
    /// The new task's handle, or `OutOfMemory` when the stack cannot be
    /// allocated or the arena is full (nothing is created in that case).
    #[allow(clippy::too_many_arguments)]
    pub fn create_periodic(
        &mut self,
        entry: TaskEntry,
        name: &str,
        stack_depth: usize,
        parameter: usize,
        priority: u8,
        arrival: Tick,
        period: Tick,
        duration: Tick,
    ) -> Result<TaskId, KernelError> {
        debug_assert!(stack_depth >= STACK_WATERMARK_WORDS);
        let stack = allocate_stack(stack_depth).ok_or(KernelError::OutOfMemory)?;
        let slot = self
            .tasks
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernelError::OutOfMemory)?;

        let mut tcb =
            TaskControlBlock::new(entry, name, parameter, priority, stack, arrival, period, duration);
        let top = tcb.initial_top_of_stack();
        tcb.top_of_stack = arch::init_stack(&mut tcb.stack, top, entry, parameter);
        let priority = tcb.priority; // clamped by the TCB
        self.tasks[slot] = Some(tcb);

        self.lists.init_item(ItemRef::state(slot));
        self.lists.init_item(ItemRef::event(slot));
        // Event lists sort by inverted priority: low key, high priority.
        self.lists.set_key(
            ItemRef::event(slot),
            MAX_PRIORITIES as Tick - priority as Tick,
        );

        self.live_tasks += 1;
        if self.current_task.is_none() {
            self.current_task = Some(slot);
        }
        self.add_task_to_ready_list(slot);
        debug!("created {} at priority {}", self.tcb(slot).name(), priority);

        if self.scheduler_running && USE_PREEMPTION && priority > self.current_priority() {
            arch::request_context_switch();
        }
        Ok(slot)
    }

    // -- deletion -----------------------------------------------------------

    /// Delete a task (the current one when `handle` is `None`).
    ///
    /// Another task is torn down immediately. The running task defers to
    /// the terminating list — it cannot free the stack it stands on — and
    /// the idle task reclaims it.
    pub fn delete_task(&mut self, handle: Option<TaskId>) {
        let id = handle.or(self.current_task).expect("no task to delete");

        self.unlink_state_item(id);
        if self.lists.is_linked(ItemRef::event(id)) {
            self.lists.remove(ItemRef::event(id));
        }
        self.task_number = self.task_number.wrapping_add(1);

        if Some(id) == self.current_task {
            debug!("{} deferring self-delete", self.tcb(id).name());
            self.lists.insert_end(list::TERMINATING, ItemRef::state(id));
            arch::request_context_switch();
        } else {
            debug!("deleted {}", self.tcb(id).name());
            self.live_tasks -= 1;
            self.tasks[id] = None;
            // The freed task may have owned the cached unblock time.
            self.reset_next_unblock();
        }
    }

    /// Logical restart of the current (periodic) task: count the completed
    /// cycle, record the TCB for stack re-initialisation at the next
    /// context switch, and yield. Nothing is unlinked or freed.
    pub fn delete_logical(&mut self) {
        let id = self.current_task.expect("no running task");
        let t = self.tcb_mut(id);
        t.cycle += 1;
        t.executed = 0;
        self.restart_pending = Some(id);
        arch::request_context_switch();
    }

    /// Free every task parked on the terminating list. The idle task's
    /// main duty; hosted tests call it directly.
    ///
    /// # Returns
    /// How many tasks were reclaimed.
    pub fn reclaim_terminated(&mut self) -> usize {
        let mut reclaimed = 0;
        while let Some(id) = self.lists.head_owner(list::TERMINATING) {
            debug_assert!(Some(id) != self.current_task);
            self.lists.remove(ItemRef::state(id));
            debug!("reclaimed {}", self.tcb(id).name());
            self.live_tasks -= 1;
            self.tasks[id] = None;
            reclaimed += 1;
        }
        reclaimed
    }

    // -- scheduler lifecycle ------------------------------------------------

    /// Create the idle task and mark the scheduler runnable. The port
    /// layer starts the first task after this returns.
    pub fn start_scheduler(&mut self, idle_entry: TaskEntry) -> Result<(), KernelError> {
        let idle = self.create_task(idle_entry, "IDLE", IDLE_STACK_DEPTH, 0, IDLE_PRIORITY)?;
        self.idle_task = Some(idle);
        self.next_unblock = MAX_DELAY;
        self.scheduler_running = true;
        debug!("scheduler running");
        Ok(())
    }

    /// Stop scheduling: interrupts off, control back to the port layer.
    pub fn end_scheduler(&mut self) {
        let _ = arch::disable_interrupts();
        self.scheduler_running = false;
    }

    // -- queries ------------------------------------------------------------

    /// Name of a task (the current one when `handle` is `None`).
    pub fn task_name(&self, handle: Option<TaskId>) -> &str {
        let id = handle.or(self.current_task).expect("no task");
        self.tcb(id).name()
    }

    /// Number of live tasks, the idle task and terminating tasks included.
    #[inline]
    pub fn live_task_count(&self) -> u32 {
        self.live_tasks
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MAX_TASKS, PERIODIC_PRIORITY};
    use crate::scheduler::tests::{noop, periodic, started};
    use crate::task::TaskState;

    #[test]
    fn test_arena_exhaustion_reports_out_of_memory() {
        let mut s = Scheduler::new();
        for i in 0..MAX_TASKS {
            s.create_task(noop, "filler", 32, i, 1).unwrap();
        }
        assert_eq!(
            s.create_task(noop, "overflow", 32, 0, 1),
            Err(KernelError::OutOfMemory)
        );
        assert_eq!(s.live_task_count(), MAX_TASKS as u32);
    }

    #[test]
    fn test_first_task_becomes_current() {
        let mut s = Scheduler::new();
        let a = s.create_task(noop, "a", 64, 0, 1).unwrap();
        assert_eq!(s.current_task, Some(a));
        assert_eq!(s.task_state(a), TaskState::Running);
        // stack primed with the fill pattern below the context frame
        assert!(s.tcb(a).stack[..STACK_WATERMARK_WORDS]
            .iter()
            .all(|&w| w == STACK_FILL));
    }

    #[test]
    fn test_synchronous_delete_frees_slot_for_reuse() {
        let mut s = started();
        let a = periodic(&mut s, "A", 0, 4, 1);
        s.switch_context();
        let b = s.create_task(noop, "b", 64, 0, 1).unwrap();

        let stamp = s.task_number;
        s.delete_task(Some(b));
        assert_eq!(s.task_number, stamp + 1);
        assert!(s.tasks[b].is_none());

        // the slot is recycled by the next creation
        let c = s.create_task(noop, "c", 64, 0, 1).unwrap();
        assert_eq!(c, b);
        let _ = a;
    }

    #[test]
    fn test_self_delete_defers_to_idle_reclaim() {
        let mut s = started();
        let a = periodic(&mut s, "A", 0, 4, 1);
        assert_eq!(s.switch_context(), a);

        let live = s.live_task_count();
        s.delete_task(None);
        assert!(s.tasks[a].is_some(), "stack must survive until reclaim");
        assert_eq!(s.live_task_count(), live);

        // the idle task runs and reclaims
        assert_eq!(s.switch_context(), s.idle_task.unwrap());
        assert_eq!(s.task_state(a), TaskState::Terminated);
        assert_eq!(s.reclaim_terminated(), 1);
        assert!(s.tasks[a].is_none());
        assert_eq!(s.live_task_count(), live - 1);
    }

    #[test]
    fn test_logical_restart_reinitialises_stack_at_next_switch() {
        let mut s = started();
        let a = periodic(&mut s, "A", 0, 4, 1);
        assert_eq!(s.switch_context(), a);

        s.delete_logical();
        assert_eq!(s.tcb(a).cycle, 1);
        assert_eq!(s.restart_pending, Some(a));

        // scribble the saved top; the picker must lay a fresh frame
        s.tcb_mut(a).top_of_stack = 0;
        s.switch_context();
        assert_eq!(s.restart_pending, None);
        let top = s.tcb(a).top_of_stack;
        assert!(top > 0 && top < s.tcb(a).stack_depth);
    }

    #[test]
    fn test_restarted_task_waits_for_its_next_release() {
        let mut s = started();
        let a = periodic(&mut s, "A", 0, 4, 1000);
        assert_eq!(s.switch_context(), a);

        s.delete_logical(); // next release at tick 4
        s.tick();
        assert_eq!(s.switch_context(), s.idle_task.unwrap());
        for _ in 0..3 {
            s.tick();
        }
        assert_eq!(s.switch_context(), a);
    }

    #[test]
    fn test_create_at_higher_priority_requests_preemption() {
        let mut s = started();
        periodic(&mut s, "A", 0, 4, 1000);
        s.switch_context();
        let _ = arch::take_context_switch_request();

        s.create_task(noop, "hi", 64, 0, PERIODIC_PRIORITY + 1).unwrap();
        assert!(arch::take_context_switch_request());
    }
}
