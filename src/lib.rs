//! Agent Tasks: orchestration core for dispatched and background agent work.

pub mod background;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod jobs;
pub mod orchestrator;
pub mod protocol;
pub mod workers;

pub use orchestrator::{Collaborators, Orchestrator};
