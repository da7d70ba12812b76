//! # Admission Controller
//!
//! Batch admission of periodic task sets under the rate-monotonic
//! feasibility test, plus lazy creation of admitted aperiodic entries.
//!
//! A batch is a dash-separated line of five-field entries:
//!
//! ```text
//! periodic-A-0-4-1-periodic-B-0-6-2-aperiodic-X-1-0-3
//! └ type ┘ name arrival period duration ...
//! ```
//!
//! Values are base-10 unsigned; arrivals are relative to the tick at which
//! the line is parsed. The whole batch is tested against the Liu–Layland
//! bound `B(n) = n(2^(1/n) - 1)`: if the periodic utilisation exceeds it,
//! the batch is rejected and nothing is created. Otherwise periodic entries
//! become tasks immediately, and aperiodic entries are recorded for the
//! tick handler to create at their arrival tick.

use arrayvec::{ArrayString, ArrayVec};
use log::{debug, warn};

use crate::config::{Tick, APERIODIC_PRIORITY, MAX_BATCH, MAX_TASK_NAME_LEN, PERIODIC_PRIORITY};
use crate::error::KernelError;
use crate::scheduler::{PendingAdmission, Scheduler};
use crate::task::TaskEntry;

/// Stack depth, in words, of tasks created through batch admission.
const ADMITTED_STACK_DEPTH: usize = 128;

/// The Liu–Layland bound `B(n) = n(2^(1/n) - 1)` for batch sizes up to
/// `MAX_BATCH`, precomputed because `core` has no `powf`. `B(0)` is a
/// placeholder; empty batches never reach the test.
const LIU_LAYLAND_BOUND: [f64; MAX_BATCH + 1] = [
    0.0,
    1.0,
    0.8284271247461903,
    0.7797631496846196,
    0.7568284600108841,
    0.7434917749851756,
    0.7347722898562381,
    0.7286265957166843,
    0.7240618613220616,
];

// ---------------------------------------------------------------------------
// Batch specification
// ---------------------------------------------------------------------------

/// Class of a batch entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Periodic,
    Aperiodic,
}

/// One parsed batch entry. Arrival is absolute (the relative value in the
/// line, offset by the tick at parse time).
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub kind: TaskKind,
    pub name: ArrayString<MAX_TASK_NAME_LEN>,
    pub arrival: Tick,
    pub period: Tick,
    pub duration: Tick,
}

/// Parse a batch line into task requests. At most `MAX_BATCH` entries are
/// taken; extra entries are ignored.
pub fn parse_batch(
    spec: &str,
    now: Tick,
) -> Result<ArrayVec<TaskRequest, MAX_BATCH>, KernelError> {
    let mut requests = ArrayVec::new();
    let mut fields = spec.split('-');

    loop {
        let kind = match fields.next() {
            None | Some("") => break,
            Some("periodic") => TaskKind::Periodic,
            Some("aperiodic") => TaskKind::Aperiodic,
            Some(_) => return Err(KernelError::BadBatchLine),
        };
        if requests.is_full() {
            break;
        }

        let name_field = fields.next().ok_or(KernelError::BadBatchLine)?;
        let mut name = ArrayString::new();
        for ch in name_field.chars() {
            if name.try_push(ch).is_err() {
                break;
            }
        }

        let mut number = || -> Result<Tick, KernelError> {
            fields
                .next()
                .ok_or(KernelError::BadBatchLine)?
                .parse::<Tick>()
                .map_err(|_| KernelError::BadBatchLine)
        };
        let arrival = now.wrapping_add(number()?);
        let period = number()?;
        let duration = number()?;

        requests.push(TaskRequest { kind, name, arrival, period, duration });
    }

    if requests.is_empty() {
        return Err(KernelError::BadBatchLine);
    }
    Ok(requests)
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

impl Scheduler {
    /// Admit a batch: all entries or none.
    ///
    /// The utilisation of the periodic entries is tested against the
    /// Liu–Layland bound for the batch size. On success, periodic entries
    /// are created at `PERIODIC_PRIORITY` running `entry`; aperiodic
    /// entries are recorded and created by the tick handler once their
    /// arrival tick comes due.
    pub fn admit_batch(
        &mut self,
        requests: &[TaskRequest],
        entry: TaskEntry,
    ) -> Result<(), KernelError> {
        if requests.is_empty() || requests.len() > MAX_BATCH {
            return Err(KernelError::BadBatchLine);
        }

        let mut utilisation = 0.0f64;
        for request in requests.iter().filter(|r| r.kind == TaskKind::Periodic) {
            // A zero period yields infinite utilisation and a rejection.
            utilisation += request.duration as f64 / request.period as f64;
        }
        let bound = LIU_LAYLAND_BOUND[requests.len()];
        if utilisation > bound {
            debug!("batch rejected: U {} exceeds bound {}", utilisation, bound);
            return Err(KernelError::NotSchedulable);
        }

        for request in requests {
            match request.kind {
                TaskKind::Periodic => {
                    self.create_periodic(
                        entry,
                        &request.name,
                        ADMITTED_STACK_DEPTH,
                        0,
                        PERIODIC_PRIORITY,
                        request.arrival,
                        request.period,
                        request.duration,
                    )?;
                }
                TaskKind::Aperiodic => self.record_pending_admission(request, entry),
            }
        }
        Ok(())
    }

    fn record_pending_admission(&mut self, request: &TaskRequest, entry: TaskEntry) {
        for slot in self.pending_admissions.iter_mut() {
            if slot.is_none() {
                *slot = Some(PendingAdmission {
                    name: request.name,
                    entry,
                    arrival: request.arrival,
                    period: request.period,
                    duration: request.duration,
                });
                return;
            }
        }
        warn!("pending-admission table full; dropping {}", request.name);
    }

    /// The tick handler's admission pass: create every recorded aperiodic
    /// entry whose arrival tick has come due.
    ///
    /// # Returns
    /// Whether a created task warrants a context switch.
    pub(crate) fn admit_due_aperiodics(&mut self, now: Tick) -> bool {
        let mut switch_required = false;
        for i in 0..MAX_BATCH {
            let due = matches!(&self.pending_admissions[i], Some(p) if p.arrival <= now);
            if !due {
                continue;
            }
            let pending = self.pending_admissions[i].take().expect("slot checked above");
            match self.create_periodic(
                pending.entry,
                &pending.name,
                ADMITTED_STACK_DEPTH,
                0,
                APERIODIC_PRIORITY,
                pending.arrival,
                pending.period,
                pending.duration,
            ) {
                Ok(id) => {
                    debug!("tick {}: created {}", now, self.tcb(id).name());
                    if self.tcb(id).priority >= self.current_priority() {
                        switch_required = true;
                    }
                }
                Err(e) => warn!("deferred creation of {} failed: {}", pending.name, e),
            }
        }
        switch_required
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
