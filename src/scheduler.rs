//! # Scheduler
//!
//! The kernel-state aggregate and the time-driven state machine: ready,
//! delayed, suspended and pending-ready task sets, the tick handler, the
//! task picker and the scheduler-suspension protocol.
//!
//! ## Scheduling model
//!
//! Single processor, preemptive, priority-based. Two priority levels have
//! reserved meaning: the *periodic class* is dispatched rate-monotonically
//! (smallest period first, among tasks whose release has arrived) and the
//! *aperiodic class* is overlaid on top of it through a deferrable server —
//! the aperiodic head runs whenever the server's period beats the best
//! periodic candidate and capacity remains. Everything else falls through
//! to the idle task.
//!
//! ## Tick pipeline
//!
//! On every timer interrupt, [`Scheduler::tick`]:
//! 1. defers entirely (pending-tick counter) if the scheduler is suspended;
//! 2. advances the tick counter, swapping the delayed lists on wrap;
//! 3. charges the elapsed tick to the task that ran through it (and to the
//!    server's capacity if that task is aperiodic);
//! 4. promotes delayed tasks whose wake tick has arrived;
//! 5. applies time slicing within the running task's priority;
//! 6. applies due capacity refills and due lazy aperiodic admissions;
//! 7. reports whether a context switch is required.
//!
//! All mutation of shared state happens inside a critical section (the
//! public API in `kernel.rs` masks interrupts around these methods) or
//! while the scheduler is suspended.

use log::trace;

use crate::arch;
use crate::config::{
    Tick, APERIODIC_PRIORITY, IDLE_PRIORITY, MAX_BATCH, MAX_DELAY, MAX_PRIORITIES, MAX_TASKS,
    PERIODIC_PRIORITY, STACK_FILL, STACK_WATERMARK_WORDS, USE_PREEMPTION, USE_TIME_SLICING,
};
use crate::list::{self, ItemRef, ListId, ListRegistry};
use crate::server::DeferrableServer;
use crate::task::{NotifyState, TaskControlBlock, TaskId, TaskState};

/// A lazily admitted aperiodic entry, waiting for its arrival tick.
/// Recorded by batch admission; materialised by the tick handler.
pub struct PendingAdmission {
    pub name: arrayvec::ArrayString<{ crate::config::MAX_TASK_NAME_LEN }>,
    pub entry: crate::task::TaskEntry,
    pub arrival: Tick,
    pub period: Tick,
    pub duration: Tick,
}

// ---------------------------------------------------------------------------
// Scheduler state
// ---------------------------------------------------------------------------

/// The central kernel state. Owns the TCB arena, every kernel list, the
/// clock, and the deferrable-server state. Stored as a single global in
/// `kernel.rs`; unit tests construct their own instance and drive it
/// directly.
pub struct Scheduler {
    /// TCB arena. A task's handle is its slot index; slots are recycled.
    pub tasks: [Option<TaskControlBlock>; MAX_TASKS],

    /// Every kernel list and every task list item.
    pub lists: ListRegistry,

    /// The running task. `None` only before the first task is created.
    pub current_task: Option<TaskId>,

    /// The idle task, created by `start_scheduler`.
    pub idle_task: Option<TaskId>,

    /// Monotonic (modulo 2^32) tick counter.
    pub tick_count: Tick,

    /// Cached wake tick of the head of the active delayed list, or
    /// `MAX_DELAY` when that list is empty.
    pub next_unblock: Tick,

    /// Times the tick counter has wrapped (and the delayed lists swapped).
    pub num_overflows: u32,

    /// Highest priority with a non-empty ready list. A hint, not a truth:
    /// readers repair it by scanning downward.
    pub top_ready_priority: u8,

    /// Set by `start_scheduler`, cleared by `end_scheduler`.
    pub scheduler_running: bool,

    /// Scheduler-suspension nesting depth.
    pub scheduler_suspended: u32,

    /// Ticks that arrived while the scheduler was suspended, replayed by
    /// `resume_all`.
    pub pended_ticks: u32,

    /// A yield was requested while it could not be honoured; acted on at
    /// the next opportunity.
    pub yield_pending: bool,

    /// Number of live tasks (created and not yet reclaimed).
    pub live_tasks: u32,

    /// Monotonic stamp bumped on every deletion.
    pub task_number: u32,

    /// The active delayed list (wake ticks at or after the current tick).
    pub delayed_list: ListId,
    /// The overflow delayed list (wake ticks past the counter wrap).
    pub overflow_list: ListId,

    /// A periodic task that logically restarted; the picker re-initialises
    /// its stack before the next dispatch.
    pub restart_pending: Option<TaskId>,

    /// Deferrable-server capacity, period and refill ring.
    pub server: DeferrableServer,

    /// Aperiodic batch entries not yet created (see `admission.rs`).
    pub pending_admissions: [Option<PendingAdmission>; MAX_BATCH],
}

impl Scheduler {
    /// A scheduler with no tasks, the clock at zero and an idle server.
    pub fn new() -> Self {
        Self {
            tasks: core::array::from_fn(|_| None),
            lists: ListRegistry::new(),
            current_task: None,
            idle_task: None,
            tick_count: 0,
            next_unblock: MAX_DELAY,
            num_overflows: 0,
            top_ready_priority: IDLE_PRIORITY,
            scheduler_running: false,
            scheduler_suspended: 0,
            pended_ticks: 0,
            yield_pending: false,
            live_tasks: 0,
            task_number: 0,
            delayed_list: list::DELAYED_A,
            overflow_list: list::DELAYED_B,
            restart_pending: None,
            server: DeferrableServer::new(),
            pending_admissions: core::array::from_fn(|_| None),
        }
    }

    // -- arena access -------------------------------------------------------

    /// The TCB behind a handle. Asserts on a vacated slot.
    #[inline]
    pub fn tcb(&self, id: TaskId) -> &TaskControlBlock {
        self.tasks[id].as_ref().expect("stale task handle")
    }

    #[inline]
    pub(crate) fn tcb_mut(&mut self, id: TaskId) -> &mut TaskControlBlock {
        self.tasks[id].as_mut().expect("stale task handle")
    }

    /// Effective priority of the running task (idle priority when none).
    #[inline]
    pub fn current_priority(&self) -> u8 {
        match self.current_task {
            Some(id) => self.tcb(id).priority,
            None => IDLE_PRIORITY,
        }
    }

    /// Current tick count.
    #[inline]
    pub fn get_tick_count(&self) -> Tick {
        self.tick_count
    }

    /// Lifecycle state of a task, derived from the list holding its state
    /// item.
    pub fn task_state(&self, id: TaskId) -> TaskState {
        if Some(id) == self.current_task {
            return TaskState::Running;
        }
        match self.lists.container(ItemRef::state(id)) {
            Some(l) if l < MAX_PRIORITIES as usize => TaskState::Ready,
            Some(l) if l == self.delayed_list || l == self.overflow_list => TaskState::Delayed,
            Some(list::SUSPENDED) => TaskState::Suspended,
            Some(list::TERMINATING) => TaskState::Terminated,
            _ => unreachable!("task is not on a state list"),
        }
    }

    // -- ready set ----------------------------------------------------------

    /// Link a task's state item at the tail of the ready list for its
    /// priority and raise the top-priority hint.
    pub(crate) fn add_task_to_ready_list(&mut self, id: TaskId) {
        let priority = self.tcb(id).priority;
        if priority > self.top_ready_priority {
            self.top_ready_priority = priority;
        }
        self.lists.insert_end(list::ready_list(priority), ItemRef::state(id));
    }

    /// Unlink a task's state item from whatever state list holds it,
    /// dropping the ready-priority hint if a ready list just emptied.
    pub(crate) fn unlink_state_item(&mut self, id: TaskId) {
        let r = ItemRef::state(id);
        let container = self.lists.container(r);
        let remaining = self.lists.remove(r);
        if let Some(l) = container {
            if l < MAX_PRIORITIES as usize && remaining == 0 && self.top_ready_priority as usize == l
            {
                self.repair_ready_hint();
            }
        }
    }

    fn repair_ready_hint(&mut self) {
        let mut p = self.top_ready_priority;
        while p > 0 && self.lists.is_empty(list::ready_list(p)) {
            p -= 1;
        }
        self.top_ready_priority = p;
    }

    /// Highest priority with a ready task, repairing a stale hint by
    /// scanning downward.
    pub fn highest_ready_priority(&mut self) -> u8 {
        self.repair_ready_hint();
        self.top_ready_priority
    }

    // -- delayed set --------------------------------------------------------

    /// Recompute `next_unblock` from the head of the active delayed list.
    pub(crate) fn reset_next_unblock(&mut self) {
        self.next_unblock = match self.lists.head(self.delayed_list) {
            Some(head) => self.lists.key(head),
            None => MAX_DELAY,
        };
    }

    // -- tick handler -------------------------------------------------------

    /// Process one timer tick.
    ///
    /// # Returns
    /// Whether the port layer should perform a context switch on exit from
    /// the tick interrupt.
    pub fn tick(&mut self) -> bool {
        if self.scheduler_suspended != 0 {
            // Timer-driven unblocks must not touch the ready lists while
            // suspended; the tick is replayed by resume_all.
            self.pended_ticks += 1;
            return false;
        }

        let mut switch_required = false;
        let now = self.tick_count.wrapping_add(1);
        self.tick_count = now;

        if now == 0 {
            // The counter wrapped: every wake time in the active list has
            // expired by now, so it must be empty. The overflow list
            // becomes the active list.
            debug_assert!(self.lists.is_empty(self.delayed_list));
            core::mem::swap(&mut self.delayed_list, &mut self.overflow_list);
            self.num_overflows += 1;
            self.reset_next_unblock();
        }

        // Charge the elapsed tick to the task that ran through it. An
        // aperiodic task executes on the server's budget; the refill posted
        // at its first dispatch repays the budget one server period later.
        if let Some(cur) = self.current_task {
            if Some(cur) != self.idle_task {
                if let Some(t) = self.tasks[cur].as_mut() {
                    t.executed = t.executed.wrapping_add(1);
                    if t.priority == APERIODIC_PRIORITY {
                        self.server.consume_one();
                    }
                }
            }
        }

        // Promote delayed tasks whose wake tick has arrived.
        if now >= self.next_unblock {
            loop {
                let head = match self.lists.head(self.delayed_list) {
                    Some(head) => head,
                    None => {
                        self.next_unblock = MAX_DELAY;
                        break;
                    }
                };
                let wake = self.lists.key(head);
                if now < wake {
                    self.next_unblock = wake;
                    break;
                }
                let id = head.task;
                self.lists.remove(head);
                if self.lists.is_linked(ItemRef::event(id)) {
                    self.lists.remove(ItemRef::event(id));
                }
                self.add_task_to_ready_list(id);
                trace!("tick {}: unblocked {}", now, self.tcb(id).name());
                if USE_PREEMPTION && self.tcb(id).priority >= self.current_priority() {
                    switch_required = true;
                }
            }
        }

        // Time slicing among tasks of the running task's priority.
        if USE_PREEMPTION && USE_TIME_SLICING {
            let priority = self.current_priority();
            if self.lists.len(list::ready_list(priority)) > 1 {
                switch_required = true;
            }
        }

        // A periodic release coming due is a dispatch point for the
        // rate-monotonic picker even though no list changed.
        for r in self.lists.iter(list::ready_list(PERIODIC_PRIORITY)) {
            let t = self.tcb(r.task);
            let release = t
                .arrival
                .wrapping_add((t.cycle as Tick).wrapping_mul(t.period));
            if release == now {
                switch_required = true;
                break;
            }
        }

        // Apply capacity refills that fire at this tick. Restored capacity
        // can make the aperiodic head eligible again.
        if self.server.apply_due(now) && !self.lists.is_empty(list::ready_list(APERIODIC_PRIORITY))
        {
            switch_required = true;
        }

        // Materialise batch-admitted aperiodic tasks whose arrival came due.
        if self.admit_due_aperiodics(now) {
            switch_required = true;
        }

        if USE_PREEMPTION && self.yield_pending {
            switch_required = true;
        }
        switch_required
    }

    // -- task picker --------------------------------------------------------

    /// Select the next task to run and make it current.
    ///
    /// Rate-monotonic dispatch with a deferrable-server overlay: among
    /// ready periodic tasks whose release has arrived, the smallest period
    /// wins (ties resolve in scan order, which rotates round-robin); the
    /// head of the aperiodic ready list displaces that choice when the
    /// server period is shorter and capacity remains; otherwise the idle
    /// task runs.
    ///
    /// Must not be called before `start_scheduler`.
    pub fn switch_context(&mut self) -> TaskId {
        if self.scheduler_suspended != 0 {
            // No switch while suspended; latch the request instead.
            self.yield_pending = true;
            return self
                .current_task
                .or(self.idle_task)
                .expect("scheduler not started");
        }
        self.yield_pending = false;

        if let Some(cur) = self.current_task {
            self.check_stack_watermark(cur);
        }

        let now = self.tick_count;
        let periodic = list::ready_list(PERIODIC_PRIORITY);

        let mut min_period = Tick::MAX;
        let mut choice: Option<ItemRef> = None;
        for r in self.lists.iter_round(periodic) {
            let t = self.tcb(r.task);
            if t.period < min_period && t.release_due(now) {
                min_period = t.period;
                choice = Some(r);
            }
        }
        if let Some(r) = choice {
            // Park the cursor on the winner so equal-period peers take
            // turns on successive dispatches.
            self.lists.set_cursor(periodic, r);
        }
        let mut next = choice.map(|r| r.task);

        // Deferrable-server overlay: the aperiodic head runs when the
        // server period beats the best periodic candidate and budget
        // remains.
        let aperiodic = list::ready_list(APERIODIC_PRIORITY);
        if let Some(head) = self.lists.head_owner(aperiodic) {
            if self.tcb(head).arrival <= now
                && self.server.period < min_period
                && self.server.capacity > 0
            {
                if self.tcb(head).cycle == 0 {
                    // First dispatch: schedule the repayment of this job's
                    // budget one server period from now.
                    let duration = self.tcb(head).duration;
                    self.tcb_mut(head).cycle = 1;
                    self.server
                        .post_refill(now.wrapping_add(self.server.period), duration);
                }
                next = Some(head);
            }
        }

        let next = next.unwrap_or_else(|| self.idle_task.expect("scheduler not started"));

        // A logically restarted task gets a fresh stack image before it can
        // be dispatched again.
        if let Some(id) = self.restart_pending.take() {
            let t = self.tasks[id].as_mut().expect("stale task handle");
            let top = t.initial_top_of_stack();
            t.top_of_stack = arch::init_stack(&mut t.stack, top, t.entry, t.parameter);
        }

        if Some(next) != self.current_task {
            trace!("tick {}: switch to {}", now, self.tcb(next).name());
        }
        self.current_task = Some(next);
        next
    }

    /// Fill-pattern watermark check run on the outgoing task at each
    /// context switch. Escalation is the port's decision.
    fn check_stack_watermark(&self, id: TaskId) {
        let t = self.tcb(id);
        let guard = STACK_WATERMARK_WORDS.min(t.stack_depth);
        if t.stack[..guard].iter().any(|&w| w != STACK_FILL) {
            arch::stack_overflow_hook(t.name());
        }
    }

    // -- scheduler suspension -----------------------------------------------

    /// Suspend the scheduler. Nestable; tick processing is deferred and
    /// ISR-driven unblocks divert to the pending-ready list until the
    /// matching `resume_all`.
    pub fn suspend_all(&mut self) {
        self.scheduler_suspended += 1;
    }

    /// Undo one `suspend_all`. When the nesting reaches zero: drain the
    /// pending-ready list, replay deferred ticks, and yield if anything
    /// that surfaced outranks the running task.
    ///
    /// # Returns
    /// Whether a context switch was requested here.
    pub fn resume_all(&mut self) -> bool {
        debug_assert!(
            self.scheduler_suspended > 0,
            "resume_all without matching suspend_all"
        );
        let mut already_yielded = false;

        self.scheduler_suspended -= 1;
        if self.scheduler_suspended == 0 && self.live_tasks > 0 {
            // Tasks readied from ISRs while we were suspended parked on the
            // pending-ready list; move them home in FIFO order.
            let mut moved = false;
            while let Some(id) = self.lists.head_owner(list::PENDING_READY) {
                self.lists.remove(ItemRef::event(id));
                self.unlink_state_item(id);
                self.add_task_to_ready_list(id);
                moved = true;
                if self.tcb(id).priority >= self.current_priority() {
                    self.yield_pending = true;
                }
            }
            if moved {
                self.reset_next_unblock();
            }

            while self.pended_ticks > 0 {
                if self.tick() {
                    self.yield_pending = true;
                }
                self.pended_ticks -= 1;
            }

            if self.yield_pending && USE_PREEMPTION {
                already_yielded = true;
                arch::request_context_switch();
            }
        }
        already_yielded
    }

    // -- suspend / resume of tasks ------------------------------------------

    /// Park a task (the current one when `handle` is `None`) on the
    /// suspended list, off the timeline.
    pub fn suspend_task(&mut self, handle: Option<TaskId>) {
        let id = handle.or(self.current_task).expect("no task to suspend");
        trace!("suspend {}", self.tcb(id).name());

        self.unlink_state_item(id);
        if self.lists.is_linked(ItemRef::event(id)) {
            self.lists.remove(ItemRef::event(id));
        }
        self.lists.insert_end(list::SUSPENDED, ItemRef::state(id));

        // A task blocked for a notification that gets suspended was not
        // notified.
        if self.tcb(id).notify_state == NotifyState::Waiting {
            self.tcb_mut(id).notify_state = NotifyState::NotWaiting;
        }

        if self.scheduler_running {
            // The suspended task may have owned the cached unblock time.
            self.reset_next_unblock();
        }

        if Some(id) == self.current_task {
            if self.scheduler_running {
                debug_assert!(self.scheduler_suspended == 0);
                arch::request_context_switch();
            } else if self.lists.len(list::SUSPENDED) as u32 == self.live_tasks {
                self.current_task = None;
            } else {
                self.switch_context();
            }
        }
    }

    fn task_is_suspended(&self, id: TaskId) -> bool {
        // On the suspended list, and not already readied through the
        // pending-ready list or still waiting on an event.
        self.lists.contains(list::SUSPENDED, ItemRef::state(id))
            && !self.lists.is_linked(ItemRef::event(id))
    }

    /// Return a suspended task to the ready lists.
    pub fn resume_task(&mut self, id: TaskId) {
        if Some(id) == self.current_task || !self.task_is_suspended(id) {
            return;
        }
        self.lists.remove(ItemRef::state(id));
        self.add_task_to_ready_list(id);
        if USE_PREEMPTION && self.tcb(id).priority >= self.current_priority() {
            arch::request_context_switch();
        }
    }

    /// ISR-safe resume.
    ///
    /// # Returns
    /// Whether the woken task outranks the running one, so the ISR should
    /// request a context switch on exit.
    pub fn resume_task_from_isr(&mut self, id: TaskId) -> bool {
        debug_assert!(arch::in_isr(), "ISR-only entry point");
        let mut yield_required = false;
        if self.task_is_suspended(id) {
            if self.scheduler_suspended == 0 {
                if self.tcb(id).priority >= self.current_priority() {
                    yield_required = true;
                    self.yield_pending = true;
                }
                self.lists.remove(ItemRef::state(id));
                self.add_task_to_ready_list(id);
            } else {
                // The ready lists are off limits; hand off through the
                // pending-ready list instead.
                self.lists
                    .insert_end(list::PENDING_READY, ItemRef::event(id));
            }
        }
        yield_required
    }

    // -- priorities ---------------------------------------------------------

    /// Effective priority of a task (the current one when `None`).
    pub fn get_priority(&self, handle: Option<TaskId>) -> u8 {
        let id = handle.or(self.current_task).expect("no task");
        self.tcb(id).priority
    }

    /// Change a task's base priority, honouring an inherited boost: while
    /// boosted, the base changes but the effective priority only ever
    /// rises.
    pub fn set_priority(&mut self, handle: Option<TaskId>, new_priority: u8) {
        let new_priority = new_priority.min(MAX_PRIORITIES - 1);
        let id = handle.or(self.current_task).expect("no task");

        let base_on_entry = self.tcb(id).base_priority;
        let effective_on_entry = self.tcb(id).priority;
        let current_priority = self.current_priority();

        let yield_required = if new_priority > base_on_entry {
            // Raising another task above (or to) the running task's level
            // warrants a switch; raising the running task never does.
            Some(id) != self.current_task && new_priority >= current_priority
        } else {
            // Lowering the running task can expose a better candidate.
            Some(id) == self.current_task && new_priority < base_on_entry
        };

        {
            let t = self.tasks[id].as_mut().expect("stale task handle");
            if t.priority == t.base_priority || new_priority > t.priority {
                t.priority = new_priority;
            }
            t.base_priority = new_priority;
        }
        let effective = self.tcb(id).priority;

        if (self.lists.key(ItemRef::event(id)) & list::EVENT_VALUE_IN_USE) == 0 {
            self.lists.set_key(
                ItemRef::event(id),
                MAX_PRIORITIES as Tick - effective as Tick,
            );
        }

        if effective != effective_on_entry
            && self
                .lists
                .contains(list::ready_list(effective_on_entry), ItemRef::state(id))
        {
            self.unlink_state_item(id);
            self.add_task_to_ready_list(id);
        }

        if yield_required && USE_PREEMPTION {
            arch::request_context_switch();
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
