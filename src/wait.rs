//! # Blocking Primitives
//!
//! Event-list blocking, timed delays and the priority-inheritance protocol.
//!
//! An *event list* is a priority-ordered queue of waiters owned by an
//! IPC-layer object (a mutex, a queue). Blocking a task means linking its
//! event item into the event list and moving its state item from the ready
//! set onto a delayed list (finite timeout) or the suspended list
//! (indefinite wait). Event-list keys are inverted priorities —
//! `MAX_PRIORITIES - priority` — so the head of a sorted event list is
//! always the highest-priority waiter.
//!
//! The calling conventions mirror the split the port enforces:
//! `place_on_*` run with the scheduler suspended, `remove_from_event_list`
//! runs inside a critical section (possibly an ISR's).

use log::trace;

use crate::arch;
use crate::config::{Tick, MAX_DELAY, MAX_PRIORITIES};
use crate::list::{self, ItemRef, ListId, EVENT_VALUE_IN_USE};
use crate::scheduler::Scheduler;
use crate::task::TaskId;

// ---------------------------------------------------------------------------
// Timeout bookkeeping
// ---------------------------------------------------------------------------

/// A snapshot of the clock taken when a wait began, used to tell "woken by
/// the event" from "woken by timeout expiry" across tick-counter wraps.
#[derive(Debug, Clone, Copy)]
pub struct TimeOut {
    overflow_count: u32,
    entering_tick: Tick,
}

impl Scheduler {
    /// Capture the wait-start snapshot for a subsequent
    /// [`check_for_timeout`](Self::check_for_timeout).
    pub fn set_timeout_state(&self, timeout: &mut TimeOut) {
        timeout.overflow_count = self.num_overflows;
        timeout.entering_tick = self.tick_count;
    }

    /// Update a wait's remaining time.
    ///
    /// # Returns
    /// `true` if the timeout has expired; otherwise `ticks_to_wait` is
    /// reduced by the time already spent and the snapshot is re-armed.
    pub fn check_for_timeout(&self, timeout: &mut TimeOut, ticks_to_wait: &mut Tick) -> bool {
        if *ticks_to_wait == MAX_DELAY {
            // Indefinite waits never expire.
            return false;
        }
        let now = self.tick_count;
        let elapsed = now.wrapping_sub(timeout.entering_tick);
        let wrapped = self.num_overflows != timeout.overflow_count && now >= timeout.entering_tick;
        if wrapped || elapsed >= *ticks_to_wait {
            *ticks_to_wait = 0;
            return true;
        }
        *ticks_to_wait -= elapsed;
        self.set_timeout_state(timeout);
        false
    }
}

impl TimeOut {
    /// A zeroed snapshot; arm it with
    /// [`Scheduler::set_timeout_state`] before use.
    pub const fn new() -> Self {
        Self { overflow_count: 0, entering_tick: 0 }
    }
}

// ---------------------------------------------------------------------------
// Event-list blocking
// ---------------------------------------------------------------------------

impl Scheduler {
    /// Block the current task on `event_list`, ordered by priority, for at
    /// most `ticks_to_wait` ticks (`MAX_DELAY` blocks indefinitely).
    ///
    /// Must be called with the scheduler suspended.
    pub fn place_on_event_list(&mut self, event_list: ListId, ticks_to_wait: Tick) {
        debug_assert!(self.scheduler_suspended != 0);
        let current = self.current_task.expect("no running task");
        // The event key already encodes the inverted priority.
        self.lists
            .insert_ordered(event_list, ItemRef::event(current));
        self.add_current_to_delayed_list(ticks_to_wait, true);
    }

    /// Block the current task at the tail of `event_list`, carrying
    /// `item_value` in its event key. Used by event-group-style callers
    /// that repurpose the key; the value-in-use marker protects it from
    /// priority updates.
    pub fn place_on_unordered_event_list(
        &mut self,
        event_list: ListId,
        item_value: Tick,
        ticks_to_wait: Tick,
    ) {
        debug_assert!(self.scheduler_suspended != 0);
        let current = self.current_task.expect("no running task");
        self.lists
            .set_key(ItemRef::event(current), item_value | EVENT_VALUE_IN_USE);
        self.lists.insert_end(event_list, ItemRef::event(current));
        self.add_current_to_delayed_list(ticks_to_wait, true);
    }

    /// Kernel-internal variant: tail insertion (the caller knows it is the
    /// only waiter) and an explicit indefinite-wait flag.
    pub fn place_on_event_list_restricted(
        &mut self,
        event_list: ListId,
        mut ticks_to_wait: Tick,
        wait_indefinitely: bool,
    ) {
        debug_assert!(self.scheduler_suspended != 0);
        let current = self.current_task.expect("no running task");
        self.lists.insert_end(event_list, ItemRef::event(current));
        if wait_indefinitely {
            ticks_to_wait = MAX_DELAY;
        }
        self.add_current_to_delayed_list(ticks_to_wait, wait_indefinitely);
    }

    /// Wake the highest-priority waiter of a non-empty event list.
    ///
    /// Called from a critical section (task or ISR context). While the
    /// scheduler is suspended the waiter is handed off through the
    /// pending-ready list instead of the ready set.
    ///
    /// # Returns
    /// `true` if the woken task outranks the running one, in which case
    /// the caller should request a context switch.
    pub fn remove_from_event_list(&mut self, event_list: ListId) -> bool {
        let woken = self
            .lists
            .head_owner(event_list)
            .expect("event list is empty");
        self.lists.remove(ItemRef::event(woken));
        trace!("unblocked {} from event list", self.tcb(woken).name());

        if self.scheduler_suspended == 0 {
            self.unlink_state_item(woken);
            self.add_task_to_ready_list(woken);
        } else {
            self.lists
                .insert_end(list::PENDING_READY, ItemRef::event(woken));
        }

        if self.tcb(woken).priority > self.current_priority() {
            self.yield_pending = true;
            true
        } else {
            false
        }
    }

    /// Move the current task from the ready set onto the delayed machinery:
    /// the overflow list when the wake tick wraps, the suspended list for
    /// an indefinite wait, the active delayed list otherwise.
    pub(crate) fn add_current_to_delayed_list(
        &mut self,
        ticks_to_wait: Tick,
        can_block_indefinitely: bool,
    ) {
        let current = self.current_task.expect("no running task");
        let now = self.tick_count;

        self.unlink_state_item(current);

        if ticks_to_wait == MAX_DELAY && can_block_indefinitely {
            // Park off the timeline so no timing event can wake it.
            self.lists
                .insert_end(list::SUSPENDED, ItemRef::state(current));
            return;
        }

        let wake = now.wrapping_add(ticks_to_wait);
        self.lists.set_key(ItemRef::state(current), wake);
        if wake < now {
            self.lists
                .insert_ordered(self.overflow_list, ItemRef::state(current));
        } else {
            self.lists
                .insert_ordered(self.delayed_list, ItemRef::state(current));
            if wake < self.next_unblock {
                self.next_unblock = wake;
            }
        }
    }

    // -- delays -------------------------------------------------------------

    /// Delay the current task for `ticks` ticks. A zero delay is just a
    /// yield.
    pub fn delay(&mut self, ticks: Tick) {
        let mut already_yielded = false;
        if ticks > 0 {
            debug_assert!(self.scheduler_suspended == 0);
            self.suspend_all();
            self.add_current_to_delayed_list(ticks, false);
            already_yielded = self.resume_all();
        }
        if !already_yielded {
            arch::request_context_switch();
        }
    }

    /// Delay until `*previous_wake + increment`, for drift-free periodic
    /// loops. Handles a wrapped tick counter and a wrapped target: the task
    /// delays iff neither has wrapped since the last call, or both have and
    /// the target is still ahead of the clock.
    ///
    /// # Returns
    /// Whether the task actually delayed (false when the target had
    /// already passed).
    pub fn delay_until(&mut self, previous_wake: &mut Tick, increment: Tick) -> bool {
        debug_assert!(increment > 0);
        debug_assert!(self.scheduler_suspended == 0);

        self.suspend_all();
        let now = self.tick_count;
        let wake = previous_wake.wrapping_add(increment);

        let should_delay = if now < *previous_wake {
            // The clock wrapped since the last wake.
            wake < *previous_wake && wake > now
        } else {
            wake < *previous_wake || wake > now
        };

        *previous_wake = wake;
        if should_delay {
            self.add_current_to_delayed_list(wake.wrapping_sub(now), false);
        }
        let already_yielded = self.resume_all();

        if !already_yielded {
            arch::request_context_switch();
        }
        should_delay
    }
}

// ---------------------------------------------------------------------------
// Priority inheritance
// ---------------------------------------------------------------------------

impl Scheduler {
    /// Boost a mutex holder to the current task's priority before the
    /// current task blocks on that mutex.
    ///
    /// # Returns
    /// Whether inheritance is (or already was) in effect for this holder.
    pub fn priority_inherit(&mut self, holder: TaskId) -> bool {
        let current_priority = self.current_priority();
        let holder_priority = self.tcb(holder).priority;

        if holder_priority < current_priority {
            // Re-key the event item unless the key carries a caller value.
            if (self.lists.key(ItemRef::event(holder)) & EVENT_VALUE_IN_USE) == 0 {
                self.lists.set_key(
                    ItemRef::event(holder),
                    MAX_PRIORITIES as Tick - current_priority as Tick,
                );
            }

            if self
                .lists
                .contains(list::ready_list(holder_priority), ItemRef::state(holder))
            {
                self.unlink_state_item(holder);
                self.tcb_mut(holder).priority = current_priority;
                self.add_task_to_ready_list(holder);
            } else {
                self.tcb_mut(holder).priority = current_priority;
            }
            trace!(
                "{} inherits priority {}",
                self.tcb(holder).name(),
                current_priority
            );
            true
        } else {
            // Already boosted past us by an earlier waiter.
            self.tcb(holder).base_priority < current_priority
        }
    }

    /// Give-back path: drop the holder's mutex count and, when the last
    /// mutex goes and a boost is in effect, restore the base priority.
    ///
    /// The holder must be the running task.
    ///
    /// # Returns
    /// Whether the caller should request a context switch.
    pub fn priority_disinherit(&mut self, holder: TaskId) -> bool {
        debug_assert!(Some(holder) == self.current_task);
        debug_assert!(self.tcb(holder).mutexes_held > 0);
        self.tcb_mut(holder).mutexes_held -= 1;

        let t = self.tcb(holder);
        if t.priority == t.base_priority || t.mutexes_held != 0 {
            // No boost, or another held mutex may still be the cause of one.
            return false;
        }

        let base = self.tcb(holder).base_priority;
        self.unlink_state_item(holder);
        self.tcb_mut(holder).priority = base;
        // The holder is running, so its event key cannot be carrying a
        // caller value.
        self.lists.set_key(
            ItemRef::event(holder),
            MAX_PRIORITIES as Tick - base as Tick,
        );
        self.add_task_to_ready_list(holder);
        trace!("{} disinherits to {}", self.tcb(holder).name(), base);
        true
    }

    /// Partial unwind used when a would-be acquirer's wait times out:
    /// lower the holder to the highest remaining waiter's priority (but
    /// never below its base), iff exactly one mutex is still held.
    ///
    /// The holder is never the running task here.
    pub fn disinherit_after_timeout(&mut self, holder: TaskId, waiter_priority: u8) {
        debug_assert!(self.tcb(holder).mutexes_held > 0);
        let base = self.tcb(holder).base_priority;
        let priority_to_use = base.max(waiter_priority);

        if self.tcb(holder).priority == priority_to_use
            || self.tcb(holder).mutexes_held != 1
        {
            return;
        }
        debug_assert!(Some(holder) != self.current_task);

        let priority_on_entry = self.tcb(holder).priority;
        self.tcb_mut(holder).priority = priority_to_use;

        if (self.lists.key(ItemRef::event(holder)) & EVENT_VALUE_IN_USE) == 0 {
            self.lists.set_key(
                ItemRef::event(holder),
                MAX_PRIORITIES as Tick - priority_to_use as Tick,
            );
        }

        if self
            .lists
            .contains(list::ready_list(priority_on_entry), ItemRef::state(holder))
        {
            self.unlink_state_item(holder);
            self.add_task_to_ready_list(holder);
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::{noop, periodic, started};
    use crate::task::TaskState;

    /// The skeleton of a priority-inheritance mutex, carrying just enough
    /// state to exercise the kernel primitives the way the IPC layer would.
    struct Mutex {
        holder: Option<TaskId>,
        waiters: ListId,
    }

    impl Mutex {
        fn new(s: &mut Scheduler) -> Self {
            Self { holder: None, waiters: s.lists.alloc_event_list().unwrap() }
        }

        fn take(&mut self, s: &mut Scheduler) {
            let current = s.current_task.unwrap();
            match self.holder {
                None => {
                    self.holder = Some(current);
                    s.tcb_mut(current).mutexes_held += 1;
                }
                Some(holder) => {
                    s.priority_inherit(holder);
                    s.suspend_all();
                    s.place_on_event_list(self.waiters, 100);
                    s.resume_all();
                }
            }
        }

        fn give(&mut self, s: &mut Scheduler) -> bool {
            let holder = self.holder.take().unwrap();
            let mut yield_required = s.priority_disinherit(holder);
            if !s.lists.is_empty(self.waiters) {
                yield_required |= s.remove_from_event_list(self.waiters);
            }
            yield_required
        }
    }

    fn plain_task(s: &mut Scheduler, name: &str, priority: u8) -> TaskId {
        s.create_task(noop, name, 64, 0, priority).unwrap()
    }

    #[test]
    fn test_priority_inheritance_boosts_and_restores() {
        // H (prio 3) takes a mutex held by L (prio 1); M (prio 2) must
        // not outrank L until L releases.
        let mut s = started();
        let l = plain_task(&mut s, "L", 1);
        let m = plain_task(&mut s, "M", 2);
        let h = plain_task(&mut s, "H", 3);
        let mut mutex = Mutex::new(&mut s);

        s.current_task = Some(l);
        mutex.take(&mut s);
        assert_eq!(mutex.holder, Some(l));

        s.current_task = Some(h);
        mutex.take(&mut s); // blocks H, boosts L
        s.current_task = Some(l); // the boosted holder runs
        assert_eq!(s.tcb(l).priority, 3);
        assert_eq!(s.tcb(l).base_priority, 1);
        assert!(s.lists.contains(list::ready_list(3), ItemRef::state(l)));
        assert_eq!(s.task_state(h), TaskState::Delayed);
        // M no longer outranks the boosted holder.
        assert!(s.tcb(m).priority < s.tcb(l).priority);

        let yield_required = mutex.give(&mut s);
        assert!(yield_required);
        assert_eq!(s.tcb(l).priority, 1, "boost must unwind on release");
        assert_eq!(s.tcb(l).mutexes_held, 0);
        // H is runnable again.
        assert_eq!(s.task_state(h), TaskState::Ready);
    }

    #[test]
    fn test_event_list_wakes_highest_priority_waiter() {
        let mut s = started();
        let lo = plain_task(&mut s, "lo", 1);
        let hi = plain_task(&mut s, "hi", 4);
        let event = s.lists.alloc_event_list().unwrap();

        s.current_task = Some(lo);
        s.suspend_all();
        s.place_on_event_list(event, 50);
        s.resume_all();

        s.current_task = Some(hi);
        s.suspend_all();
        s.place_on_event_list(event, 50);
        s.resume_all();

        // Sorted by inverted priority: the high-priority waiter heads the
        // list even though it arrived second.
        assert_eq!(s.lists.head_owner(event), Some(hi));

        s.current_task = Some(s.idle_task.unwrap());
        assert!(s.remove_from_event_list(event));
        assert_eq!(s.task_state(hi), TaskState::Ready);
        assert_eq!(s.task_state(lo), TaskState::Delayed);
    }

    #[test]
    fn test_indefinite_block_parks_on_suspended_list() {
        let mut s = started();
        let t = plain_task(&mut s, "t", 1);
        let event = s.lists.alloc_event_list().unwrap();

        s.current_task = Some(t);
        s.suspend_all();
        s.place_on_event_list(event, MAX_DELAY);
        s.resume_all();

        assert!(s.lists.contains(list::SUSPENDED, ItemRef::state(t)));
        // No wake tick was scheduled for it.
        assert_eq!(s.next_unblock, MAX_DELAY);
    }

    #[test]
    fn test_restricted_wait_can_block_indefinitely() {
        let mut s = started();
        let t = plain_task(&mut s, "t", 1);
        let event = s.lists.alloc_event_list().unwrap();

        s.current_task = Some(t);
        s.suspend_all();
        s.place_on_event_list_restricted(event, 10, true);
        s.resume_all();

        // the indefinite flag overrides the finite timeout
        assert!(s.lists.contains(list::SUSPENDED, ItemRef::state(t)));
        assert_eq!(s.lists.head_owner(event), Some(t));
    }

    #[test]
    fn test_blocked_task_times_out_and_wakes() {
        let mut s = started();
        let a = periodic(&mut s, "A", 0, 4, 1000);
        s.switch_context();
        let event = s.lists.alloc_event_list().unwrap();

        s.suspend_all();
        s.place_on_event_list(event, 3);
        s.resume_all();
        assert_eq!(s.switch_context(), s.idle_task.unwrap());
        assert_eq!(s.task_state(a), TaskState::Delayed);
        assert!(s.lists.contains(event, ItemRef::event(a)));

        s.tick();
        s.tick();
        assert_eq!(s.task_state(a), TaskState::Delayed);
        s.tick();
        // timeout expiry unlinks from the event list too
        assert_eq!(s.task_state(a), TaskState::Ready);
        assert!(!s.lists.is_linked(ItemRef::event(a)));
    }

    #[test]
    fn test_disinherit_after_timeout_partial_unwind() {
        let mut s = started();
        let l = plain_task(&mut s, "L", 1);
        let h = plain_task(&mut s, "H", 5);

        s.current_task = Some(h);
        s.tcb_mut(l).mutexes_held = 1;
        s.priority_inherit(l);
        assert_eq!(s.tcb(l).priority, 5);

        // H gave up waiting; a priority-3 waiter remains.
        s.current_task = Some(s.idle_task.unwrap());
        s.disinherit_after_timeout(l, 3);
        assert_eq!(s.tcb(l).priority, 3);
        assert_eq!(s.tcb(l).base_priority, 1);
        assert!(s.lists.contains(list::ready_list(3), ItemRef::state(l)));

        // With no waiters left the floor is the base priority.
        s.disinherit_after_timeout(l, 0);
        assert_eq!(s.tcb(l).priority, 1);
    }

    #[test]
    fn test_disinherit_keeps_boost_while_other_mutexes_held() {
        let mut s = started();
        let l = plain_task(&mut s, "L", 1);
        let h = plain_task(&mut s, "H", 5);

        s.current_task = Some(h);
        s.tcb_mut(l).mutexes_held = 2;
        s.priority_inherit(l);

        s.current_task = Some(l);
        assert!(!s.priority_disinherit(l));
        assert_eq!(s.tcb(l).priority, 5, "boost persists until the last give");
        assert!(s.priority_disinherit(l));
        assert_eq!(s.tcb(l).priority, 1);
    }

    #[test]
    fn test_delay_until_wrap_cases() {
        let mut s = started();
        periodic(&mut s, "A", 0, 4, 1000);
        s.switch_context();

        // Target already passed: no delay, but the reference advances.
        s.tick_count = 10;
        let mut wake = 2;
        assert!(!s.delay_until(&mut wake, 5));
        assert_eq!(wake, 7);

        // Normal case.
        let mut wake = s.tick_count;
        assert!(s.delay_until(&mut wake, 5));
        assert_eq!(wake, 15);
    }

    #[test]
    fn test_unordered_event_list_carries_value() {
        let mut s = started();
        let t = plain_task(&mut s, "t", 2);
        let event = s.lists.alloc_event_list().unwrap();

        s.current_task = Some(t);
        s.suspend_all();
        s.place_on_unordered_event_list(event, 0x42, 10);
        s.resume_all();

        let key = s.lists.key(ItemRef::event(t));
        assert_eq!(key & !EVENT_VALUE_IN_USE, 0x42);
        assert!((key & EVENT_VALUE_IN_USE) != 0);

        // While the value is live, an inheritance boost must not clobber it.
        let h = plain_task(&mut s, "h", 5);
        s.current_task = Some(h);
        s.tcb_mut(t).mutexes_held = 1;
        s.priority_inherit(t);
        assert_eq!(s.lists.key(ItemRef::event(t)) & !EVENT_VALUE_IN_USE, 0x42);
    }

    #[test]
    fn test_check_for_timeout_counts_down() {
        let mut s = started();
        let mut timeout = TimeOut::new();
        let mut remaining: Tick = 10;

        s.set_timeout_state(&mut timeout);
        s.tick_count += 4;
        assert!(!s.check_for_timeout(&mut timeout, &mut remaining));
        assert_eq!(remaining, 6);

        s.tick_count += 6;
        assert!(s.check_for_timeout(&mut timeout, &mut remaining));
        assert_eq!(remaining, 0);

        let mut forever = MAX_DELAY;
        assert!(!s.check_for_timeout(&mut timeout, &mut forever));
    }
}
