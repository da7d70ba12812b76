//! # Task Notifications
//!
//! Each task carries one lightweight notification slot: a 32-bit value and
//! a three-state flag. Notifying a task can set bits, increment a count or
//! overwrite the value, and wakes the task if it is blocked on the slot.
//! The slot outlives timeouts: a waiter that times out observes state
//! `NotWaiting` with the value untouched, which is how callers tell
//! "notified" from "timed out".
//!
//! The blocking calls park the waiter on the delayed machinery directly —
//! no event list is involved, so the ISR-safe senders need only the
//! pending-ready handoff when the scheduler is suspended.

use log::trace;

use crate::arch;
use crate::config::{Tick, USE_PREEMPTION};
use crate::list::{self, ItemRef};
use crate::scheduler::Scheduler;
use crate::task::{NotifyAction, NotifyState, TaskId};

impl Scheduler {
    // -- waiting ------------------------------------------------------------

    /// Take the notification value, waiting up to `ticks_to_wait` for it to
    /// become non-zero. With `clear_on_exit` the value resets to zero on
    /// return, otherwise it decrements — the counting-semaphore idiom.
    ///
    /// # Returns
    /// The value observed after the wait (zero on timeout).
    pub fn notify_take(&mut self, clear_on_exit: bool, ticks_to_wait: Tick) -> u32 {
        let current = self.current_task.expect("no running task");

        if self.tcb(current).notified_value == 0 {
            self.tcb_mut(current).notify_state = NotifyState::Waiting;
            if ticks_to_wait > 0 {
                self.add_current_to_delayed_list(ticks_to_wait, true);
                arch::request_context_switch();
            }
        }

        // Runs again once the task is woken (or immediately if the value
        // was already pending).
        let value = self.tcb(current).notified_value;
        if value != 0 {
            self.tcb_mut(current).notified_value =
                if clear_on_exit { 0 } else { value - 1 };
        }
        self.tcb_mut(current).notify_state = NotifyState::NotWaiting;
        value
    }

    /// Wait for any notification, clearing `clear_on_entry` bits before the
    /// wait and `clear_on_exit` bits after a successful one.
    ///
    /// # Returns
    /// `(notified, value)` — whether a notification arrived before the
    /// timeout, and the slot value as observed on exit.
    pub fn notify_wait(
        &mut self,
        clear_on_entry: u32,
        clear_on_exit: u32,
        ticks_to_wait: Tick,
    ) -> (bool, u32) {
        let current = self.current_task.expect("no running task");

        if self.tcb(current).notify_state != NotifyState::Received {
            let t = self.tcb_mut(current);
            t.notified_value &= !clear_on_entry;
            t.notify_state = NotifyState::Waiting;
            if ticks_to_wait > 0 {
                self.add_current_to_delayed_list(ticks_to_wait, true);
                arch::request_context_switch();
            }
        }

        let value = self.tcb(current).notified_value;
        let notified = self.tcb(current).notify_state == NotifyState::Received;
        if notified {
            self.tcb_mut(current).notified_value = value & !clear_on_exit;
        }
        self.tcb_mut(current).notify_state = NotifyState::NotWaiting;
        (notified, value)
    }

    // -- sending ------------------------------------------------------------

    /// Notify a task, applying `action` to its notification value and
    /// waking it if it was blocked on the slot.
    ///
    /// # Returns
    /// `Err(())` only for `SetValueWithoutOverwrite` against an unconsumed
    /// notification.
    pub fn notify(&mut self, target: TaskId, value: u32, action: NotifyAction) -> Result<(), ()> {
        let previous_state = self.apply_notification(target, value, action)?;

        if previous_state == NotifyState::Waiting {
            // The waiter sits on the delayed (or suspended) list with its
            // event item unlinked.
            debug_assert!(!self.lists.is_linked(ItemRef::event(target)));
            self.unlink_state_item(target);
            self.add_task_to_ready_list(target);
            if USE_PREEMPTION && self.tcb(target).priority > self.current_priority() {
                self.yield_pending = true;
                arch::request_context_switch();
            }
        }
        Ok(())
    }

    /// ISR-safe [`notify`](Self::notify). While the scheduler is suspended
    /// the woken task diverts to the pending-ready list.
    ///
    /// # Returns
    /// `(result, higher_priority_woken)`; the ISR should request a context
    /// switch on exit when the flag is set.
    pub fn notify_from_isr(
        &mut self,
        target: TaskId,
        value: u32,
        action: NotifyAction,
    ) -> (Result<(), ()>, bool) {
        debug_assert!(arch::in_isr(), "ISR-only entry point");
        let previous_state = match self.apply_notification(target, value, action) {
            Ok(state) => state,
            Err(()) => return (Err(()), false),
        };

        let mut higher_priority_woken = false;
        if previous_state == NotifyState::Waiting {
            debug_assert!(!self.lists.is_linked(ItemRef::event(target)));
            if self.scheduler_suspended == 0 {
                self.unlink_state_item(target);
                self.add_task_to_ready_list(target);
            } else {
                self.lists
                    .insert_end(list::PENDING_READY, ItemRef::event(target));
            }
            if self.tcb(target).priority > self.current_priority() {
                higher_priority_woken = true;
                self.yield_pending = true;
            }
        }
        (Ok(()), higher_priority_woken)
    }

    /// ISR-safe "give": increment the target's notification value. The
    /// light-weight binary/counting semaphore path.
    ///
    /// # Returns
    /// Whether a higher-priority task was woken.
    pub fn notify_give_from_isr(&mut self, target: TaskId) -> bool {
        self.notify_from_isr(target, 0, NotifyAction::Increment).1
    }

    fn apply_notification(
        &mut self,
        target: TaskId,
        value: u32,
        action: NotifyAction,
    ) -> Result<NotifyState, ()> {
        let t = self.tcb_mut(target);
        let previous_state = t.notify_state;
        t.notify_state = NotifyState::Received;

        match action {
            NotifyAction::NoAction => {}
            NotifyAction::SetBits => t.notified_value |= value,
            NotifyAction::Increment => t.notified_value = t.notified_value.wrapping_add(1),
            NotifyAction::SetValueWithOverwrite => t.notified_value = value,
            NotifyAction::SetValueWithoutOverwrite => {
                if previous_state == NotifyState::Received {
                    // Undo the state change; the pending value stands.
                    t.notify_state = previous_state;
                    return Err(());
                }
                t.notified_value = value;
            }
        }
        trace!("notify {}: state {:?}", self.tcb(target).name(), previous_state);
        Ok(previous_state)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch;
    use crate::config::APERIODIC_PRIORITY;
    use crate::scheduler::tests::{noop, periodic, started};
    use crate::task::TaskState;

    #[test]
    fn test_take_pending_value_without_blocking() {
        let mut s = started();
        let t = periodic(&mut s, "A", 0, 4, 100);
        s.switch_context();

        s.notify(t, 0, NotifyAction::Increment).unwrap();
        s.notify(t, 0, NotifyAction::Increment).unwrap();

        assert_eq!(s.notify_take(false, 10), 2);
        assert_eq!(s.tcb(t).notified_value, 1, "take without clear decrements");
        assert_eq!(s.notify_take(true, 10), 1);
        assert_eq!(s.tcb(t).notified_value, 0, "take with clear zeroes");
        assert_eq!(s.task_state(t), TaskState::Running, "never blocked");
    }

    #[test]
    fn test_take_blocks_until_notified() {
        let mut s = started();
        let t = periodic(&mut s, "A", 0, 4, 100);
        s.switch_context();

        // No value pending: the call parks the task and returns zero for
        // this simulated pass.
        assert_eq!(s.notify_take(true, 50), 0);
        assert_eq!(s.switch_context(), s.idle_task.unwrap());
        assert_eq!(s.task_state(t), TaskState::Delayed);
        assert_eq!(s.tcb(t).notify_state, NotifyState::NotWaiting);
    }

    #[test]
    fn test_notify_wakes_blocked_waiter() {
        let mut s = started();
        let a = periodic(&mut s, "A", 0, 4, 100);
        let b = periodic(&mut s, "B", 0, 6, 100);
        s.switch_context(); // A runs

        // Make B a blocked waiter.
        s.current_task = Some(b);
        s.tcb_mut(b).notify_state = NotifyState::Waiting;
        s.add_current_to_delayed_list(50, true);
        s.current_task = Some(a);

        s.notify(b, 0xff, NotifyAction::SetBits).unwrap();
        assert_eq!(s.task_state(b), TaskState::Ready);
        assert_eq!(s.tcb(b).notified_value, 0xff);
        assert_eq!(s.tcb(b).notify_state, NotifyState::Received);
    }

    #[test]
    fn test_set_without_overwrite_fails_on_pending() {
        let mut s = started();
        let t = periodic(&mut s, "A", 0, 4, 100);
        s.switch_context();

        assert!(s.notify(t, 1, NotifyAction::SetValueWithoutOverwrite).is_ok());
        assert!(s.notify(t, 2, NotifyAction::SetValueWithoutOverwrite).is_err());
        assert_eq!(s.tcb(t).notified_value, 1);
        // Overwrite always wins.
        assert!(s.notify(t, 3, NotifyAction::SetValueWithOverwrite).is_ok());
        assert_eq!(s.tcb(t).notified_value, 3);
    }

    #[test]
    fn test_notify_wait_clears_entry_and_exit_bits() {
        let mut s = started();
        let t = periodic(&mut s, "A", 0, 4, 100);
        s.switch_context();

        s.notify(t, 0b1111, NotifyAction::SetBits).unwrap();
        let (notified, value) = s.notify_wait(0, 0b0011, 10);
        assert!(notified);
        assert_eq!(value, 0b1111);
        assert_eq!(s.tcb(t).notified_value, 0b1100);
    }

    #[test]
    fn test_give_from_isr_increments_like_a_semaphore() {
        let mut s = started();
        let t = periodic(&mut s, "A", 0, 4, 100);
        s.switch_context();

        arch::enter_isr();
        // the running task needs no wake, so no switch is requested
        assert!(!s.notify_give_from_isr(t));
        assert!(!s.notify_give_from_isr(t));
        arch::exit_isr();

        assert_eq!(s.tcb(t).notified_value, 2);
        assert_eq!(s.tcb(t).notify_state, NotifyState::Received);
    }

    #[test]
    fn test_isr_notify_while_suspended_goes_through_pending_ready() {
        // An ISR notification during scheduler suspension must not touch
        // the ready lists; the waiter preempts only after resume.
        let mut s = started();
        s.server.init(10, 6);
        let a = s
            .create_periodic(noop, "A", 64, 0, APERIODIC_PRIORITY, 0, 0, 1000)
            .unwrap();
        let t = periodic(&mut s, "T", 0, 4, 1000);
        s.switch_context(); // T wins: its period beats the server's
        assert_eq!(s.current_task, Some(t));

        // T blocks waiting for a notification; the aperiodic job runs on
        // the server's budget while T waits.
        s.tcb_mut(t).notify_state = NotifyState::Waiting;
        s.add_current_to_delayed_list(100, true);
        assert_eq!(s.switch_context(), a);

        s.suspend_all();
        arch::enter_isr();
        let (result, higher_woken) = s.notify_from_isr(t, 0, NotifyAction::Increment);
        arch::exit_isr();
        result.unwrap();
        assert!(higher_woken, "the periodic waiter outranks the server job");

        // Not ready yet: only the pending-ready list saw the wake.
        assert_eq!(s.task_state(t), TaskState::Delayed);
        assert!(s.lists.contains(list::PENDING_READY, ItemRef::event(t)));

        assert!(s.resume_all());
        assert_eq!(s.task_state(t), TaskState::Ready);
        assert_eq!(s.switch_context(), t, "woken waiter preempts on resume");
    }
}
