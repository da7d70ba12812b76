//! # Task Control Block
//!
//! The per-task state record. A TCB lives in a fixed arena slot inside the
//! scheduler and is addressed by its slot index ([`TaskId`]), which doubles
//! as the public task handle. Once a task is linked into the kernel lists,
//! its TCB is mutated only through scheduler-owned operations.
//!
//! ## State machine
//!
//! A task's lifecycle state is not stored here: the task is linked into
//! exactly one *state list* at all times (a ready list, one of the two
//! delayed lists, the suspended list or the terminating list), and that
//! list is the truth. [`TaskState`] is the derived view the scheduler
//! reports to callers.

use alloc::boxed::Box;

use crate::config::{
    Tick, MAX_PRIORITIES, MAX_TASK_NAME_LEN, PERIODIC_PRIORITY, STACK_ALIGN_WORDS,
};

// ---------------------------------------------------------------------------
// Handles and entry points
// ---------------------------------------------------------------------------

/// Task handle: the index of the task's arena slot. Slots are recycled
/// after deletion; the kernel asserts on use of a vacated handle.
pub type TaskId = usize;

/// A task entry function. Receives the parameter word passed at creation
/// and never returns; a task that is done deletes or restarts itself.
pub type TaskEntry = extern "C" fn(usize) -> !;

// ---------------------------------------------------------------------------
// Derived task state
// ---------------------------------------------------------------------------

/// Lifecycle state of a task, derived from the list containing its state
/// item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Currently executing on the processor.
    Running,
    /// On a ready list, waiting to be picked.
    Ready,
    /// On a delayed list, waiting for a wake tick or timeout.
    Delayed,
    /// Off the timeline: explicitly suspended or blocked indefinitely.
    Suspended,
    /// Self-deleted; awaiting reclamation by the idle task.
    Terminated,
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// State of a task's notification slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyState {
    /// No notification pending and nobody waiting.
    NotWaiting,
    /// The task is blocked waiting for a notification.
    Waiting,
    /// A notification arrived and has not been consumed yet.
    Received,
}

/// What a notification does to the target's 32-bit notification value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAction {
    /// Wake the target without touching the value.
    NoAction,
    /// OR the sent value into the target's value.
    SetBits,
    /// Increment the value; the sent value is ignored.
    Increment,
    /// Overwrite the value unconditionally.
    SetValueWithOverwrite,
    /// Overwrite only if no notification is pending; otherwise the send
    /// fails.
    SetValueWithoutOverwrite,
}

// ---------------------------------------------------------------------------
// Task control block
// ---------------------------------------------------------------------------

/// The task control block.
///
/// The stack is the task's only heap allocation: a boxed slice of words,
/// filled with the debug pattern at creation. `top_of_stack` is a word
/// index into it, updated by the port layer on every context switch (the
/// stack grows downward, from `stack_depth` toward 0).
pub struct TaskControlBlock {
    name: [u8; MAX_TASK_NAME_LEN],

    /// Entry function, kept for logical restarts of periodic tasks.
    pub entry: TaskEntry,
    /// Parameter word handed to `entry`.
    pub parameter: usize,

    /// Stack memory, `stack_depth` words.
    pub stack: Box<[usize]>,
    pub stack_depth: usize,
    /// Saved top of stack, as a word index into `stack`.
    pub top_of_stack: usize,

    /// Effective priority; equals `base_priority` except while boosted by
    /// priority inheritance.
    pub priority: u8,
    /// Priority assigned at creation or by `set_priority`.
    pub base_priority: u8,
    /// Mutexes currently held; inheritance fully unwinds only when this
    /// returns to zero.
    pub mutexes_held: u32,

    /// First release tick of a periodic or aperiodic task.
    pub arrival: Tick,
    /// Release period; the rate-monotonic sort key of the periodic class.
    pub period: Tick,
    /// Worst-case execution budget per release, in ticks.
    pub duration: Tick,
    /// Completed-cycle counter; release `n` is due at
    /// `arrival + n * period`.
    pub cycle: u32,
    /// Ticks of processor time consumed in the current cycle.
    pub executed: Tick,

    /// Notification slot value.
    pub notified_value: u32,
    pub notify_state: NotifyState,
}

impl TaskControlBlock {
    /// Build a TCB around an already-allocated stack.
    ///
    /// Clamps the priority into `0..MAX_PRIORITIES` and copies the name,
    /// truncating to the name buffer and always NUL-terminating. The
    /// initial top of stack is the highest aligned word; the port layer
    /// lays the first context frame below it.
    pub fn new(
        entry: TaskEntry,
        name: &str,
        parameter: usize,
        priority: u8,
        stack: Box<[usize]>,
        arrival: Tick,
        period: Tick,
        duration: Tick,
    ) -> Self {
        let stack_depth = stack.len();
        let top_of_stack = (stack_depth - 1) & !(STACK_ALIGN_WORDS - 1);
        let priority = priority.min(MAX_PRIORITIES - 1);

        let mut name_buf = [0u8; MAX_TASK_NAME_LEN];
        for (dst, src) in name_buf[..MAX_TASK_NAME_LEN - 1]
            .iter_mut()
            .zip(name.bytes())
        {
            *dst = src;
        }

        Self {
            name: name_buf,
            entry,
            parameter,
            stack,
            stack_depth,
            top_of_stack,
            priority,
            base_priority: priority,
            arrival,
            period,
            duration,
            cycle: 0,
            executed: 0,
            mutexes_held: 0,
            notified_value: 0,
            notify_state: NotifyState::NotWaiting,
        }
    }

    /// Highest aligned word of the stack; where the port layer lays a
    /// fresh context frame on creation and on logical restart.
    #[inline]
    pub fn initial_top_of_stack(&self) -> usize {
        (self.stack_depth - 1) & !(STACK_ALIGN_WORDS - 1)
    }

    /// The task name, up to the first NUL.
    pub fn name(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_TASK_NAME_LEN - 1);
        core::str::from_utf8(&self.name[..end]).unwrap_or("?")
    }

    /// Whether this task belongs to the rate-monotonic periodic class.
    #[inline]
    pub fn is_periodic(&self) -> bool {
        self.priority == PERIODIC_PRIORITY
    }

    /// Whether the task's next release has arrived: release `cycle` is due
    /// at `arrival + cycle * period`. Arithmetic wraps with the tick
    /// counter.
    #[inline]
    pub fn release_due(&self, now: Tick) -> bool {
        self.arrival
            .wrapping_add((self.cycle as Tick).wrapping_mul(self.period))
            <= now
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
