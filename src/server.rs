//! # Deferrable Server
//!
//! Budget accounting for aperiodic work. The server holds `capacity` ticks
//! of execution budget per `period`; the picker dispatches the head of the
//! aperiodic ready list only while capacity remains and the server period
//! beats the best periodic candidate.
//!
//! What makes the server *deferrable* rather than polling: capacity
//! consumed at tick `t` is repaid at `t + period` — the tick it was
//! consumed plus one server period — not at the next period boundary. A
//! repayment is a [`Refill`] posted into a small ring when an aperiodic
//! job is first dispatched; the tick handler applies refills as their fire
//! tick comes due.

use log::{debug, warn};

use crate::config::{Tick, MAX_REFILLS};

/// One scheduled capacity repayment.
#[derive(Debug, Clone, Copy)]
pub struct Refill {
    /// Tick at which the refill is applied.
    pub fire_tick: Tick,
    /// Budget returned; zero marks a free slot.
    pub amount: Tick,
}

/// Capacity, period and the pending-refill ring.
pub struct DeferrableServer {
    /// Budget remaining in the current window, in ticks.
    pub capacity: Tick,
    /// Budget ceiling; refills never push `capacity` above this.
    pub initial_capacity: Tick,
    /// Replenishment period, in ticks. Also the server's rate-monotonic
    /// stand-in when competing against periodic candidates.
    pub period: Tick,
    /// Pending repayments. A full ring drops further refills.
    pub refills: [Refill; MAX_REFILLS],
}

impl DeferrableServer {
    /// A server with the default budget (5 ticks per 10).
    pub fn new() -> Self {
        Self {
            capacity: 5,
            initial_capacity: 5,
            period: 10,
            refills: [Refill { fire_tick: 0, amount: 0 }; MAX_REFILLS],
        }
    }

    /// Reconfigure capacity and period, discarding pending refills.
    pub fn init(&mut self, capacity: Tick, period: Tick) {
        self.capacity = capacity;
        self.initial_capacity = capacity;
        self.period = period;
        self.refills = [Refill { fire_tick: 0, amount: 0 }; MAX_REFILLS];
        debug!("server capacity {} period {}", capacity, period);
    }

    /// Consume one tick of budget; saturates at zero (the picker stops
    /// dispatching on the same tick the budget runs out).
    #[inline]
    pub fn consume_one(&mut self) {
        self.capacity = self.capacity.saturating_sub(1);
    }

    /// Schedule a repayment of `amount` ticks at `fire_tick`. On a full
    /// ring the refill is dropped — a known limitation of the fixed ring.
    pub fn post_refill(&mut self, fire_tick: Tick, amount: Tick) {
        if amount == 0 {
            return;
        }
        for slot in self.refills.iter_mut() {
            if slot.amount == 0 {
                *slot = Refill { fire_tick, amount };
                return;
            }
        }
        warn!("refill ring full; dropping refill of {} at {}", amount, fire_tick);
    }

    /// Apply every pending refill whose fire tick is `now`, clamping the
    /// capacity at its initial value.
    ///
    /// # Returns
    /// Whether any refill was applied.
    pub fn apply_due(&mut self, now: Tick) -> bool {
        let mut applied = false;
        for slot in self.refills.iter_mut() {
            if slot.amount != 0 && slot.fire_tick == now {
                self.capacity = self
                    .capacity
                    .saturating_add(slot.amount)
                    .min(self.initial_capacity);
                debug!("refilled {} at tick {}", slot.amount, now);
                slot.amount = 0;
                applied = true;
            }
        }
        applied
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refill_repays_at_consumption_plus_period() {
        // Budget consumed from tick t0 comes back at t0 + period.
        let mut server = DeferrableServer::new();
        server.init(2, 5);

        // dispatch at tick 3: repayment scheduled for tick 8
        server.post_refill(3 + server.period, 2);
        server.consume_one();
        server.consume_one();
        assert_eq!(server.capacity, 0);

        for now in 4..8 {
            assert!(!server.apply_due(now));
            assert_eq!(server.capacity, 0);
        }
        assert!(server.apply_due(8));
        assert_eq!(server.capacity, 2);
    }

    #[test]
    fn test_capacity_clamps_at_initial() {
        let mut server = DeferrableServer::new();
        server.init(2, 5);
        // a refill carrying a full job duration cannot overfill the budget
        server.post_refill(10, 100);
        server.apply_due(10);
        assert_eq!(server.capacity, 2);
    }

    #[test]
    fn test_consume_saturates_at_zero() {
        let mut server = DeferrableServer::new();
        server.init(1, 5);
        server.consume_one();
        server.consume_one();
        assert_eq!(server.capacity, 0);
    }

    #[test]
    fn test_full_ring_drops_refill() {
        let mut server = DeferrableServer::new();
        server.init(3, 5);
        for i in 0..MAX_REFILLS as Tick {
            server.post_refill(10 + i, 1);
        }
        // the ring is full; this one is silently dropped
        server.post_refill(99, 1);
        assert!(server.refills.iter().all(|r| r.fire_tick != 99));

        // applying a due refill frees its slot for reuse
        server.capacity = 0;
        assert!(server.apply_due(10));
        server.post_refill(99, 1);
        assert!(server.refills.iter().any(|r| r.fire_tick == 99));
    }

    #[test]
    fn test_pending_refills_bound_capacity() {
        // Capacity never exceeds initial + the sum of pending refills
        // (with the clamp, never even exceeds initial).
        let mut server = DeferrableServer::new();
        server.init(4, 7);
        server.post_refill(5, 3);
        server.consume_one();
        server.apply_due(5);
        assert!(server.capacity <= server.initial_capacity);
    }
}
