//! Worker pool: named worker processes the task protocol dispatches to.
//!
//! - `profile`: static profiles and runtime instances
//! - `pool`: spawn coalescing, port assignment, teardown
//! - `process`: `WorkerSpawner` that launches child processes

pub mod pool;
pub mod process;
pub mod profile;

pub use pool::{EnsureOptions, WorkerPool, WorkerSpawner};
pub use process::ProcessSpawner;
pub use profile::{
    SpawnOptions, WorkerInstance, WorkerProfile, WorkerStatus, load_profiles, parse_profiles,
};
