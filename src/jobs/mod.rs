//! Job tracking: dispatched tasks and the callers waiting on them.
//!
//! - `state`: `Job` record and its status state machine
//! - `registry`: session-scoped store with fan-out completion waiters

pub mod registry;
pub mod state;

pub use registry::{JobOutcome, JobRegistry};
pub use state::{Job, JobStatus, NewJob};
