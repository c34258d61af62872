//! Assignment worker: pops ride ids and binds them to drivers.
//!
//! Runs embedded in the server or standalone via `ridenow worker`. Delivery
//! from the queue is at-least-once; the processed set and the conditional
//! status update together make handling idempotent.

mod assignment;

pub use assignment::{
    AssignmentOutcome, AssignmentWorker, WorkerSettings, WorkerStats, WorkerStatsSnapshot,
};
