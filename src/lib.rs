//! # RMOS — Rate-Monotonic Operating System
//!
//! A small preemptive real-time kernel for a single processor: a fixed set
//! of periodic tasks scheduled under rate-monotonic priority, plus a
//! *deferrable server* that services sporadic aperiodic jobs from a
//! bounded capacity budget repaid one server period after consumption.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   Application Tasks                     │
//! ├─────────────────────────────────────────────────────────┤
//! │                Kernel API (kernel.rs)                   │
//! │   init() · create_periodic() · admit_batch() · start()  │
//! ├──────────────┬─────────────────────┬────────────────────┤
//! │  Scheduler   │  Admission / Server │  Blocking          │
//! │ scheduler.rs │  admission.rs       │  wait.rs notify.rs │
//! │ ─ tick()     │  ─ Liu-Layland test │  ─ event lists     │
//! │ ─ picker     │  ─ refill ring      │  ─ delays          │
//! │ ─ suspend    │  server.rs          │  ─ inheritance     │
//! ├──────────────┴─────────────────────┴────────────────────┤
//! │        Task Model (task.rs) · Lists (list.rs)           │
//! │     TCB arena · state/event items · cursor rotation     │
//! ├─────────────────────────────────────────────────────────┤
//! │       Arch Port (arch/cortex_m4.rs, arch/hosted.rs)     │
//! │   PendSV · SysTick · PRIMASK · stack frames · hooks     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Scheduling model
//!
//! Three priority levels carry reserved meaning: level 2 is the *periodic
//! class*, dispatched rate-monotonically among released tasks; level 1 is
//! the *aperiodic class*, run out of the deferrable server's budget when
//! the server period beats every released periodic task; level 0 is the
//! idle task. Batch admission applies the Liu–Layland feasibility test
//! `U ≤ n(2^(1/n) − 1)` before any task of a batch is created.
//!
//! ## Memory model
//!
//! - **TCB arena**: a fixed array of recycled slots; handles are indices,
//!   list links are `(task, item)` addresses — no pointers to chase or
//!   dangle.
//! - **Task stacks**: the only dynamic allocation (`alloc`, fallible).
//! - **Kernel lists**: one fixed registry, interrupt-masked or
//!   scheduler-suspended on every mutation path.
//!
//! The crate is `no_std`; the test suite runs on the hosted simulation
//! port with `std`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod admission;
pub mod arch;
pub mod config;
pub mod error;
pub mod kernel;
pub mod lifecycle;
pub mod list;
pub mod notify;
pub mod scheduler;
pub mod server;
pub mod sync;
pub mod task;
pub mod wait;
