//! Task protocol: the boundary API callers use to start and track tasks.
//!
//! - `types`: request and response payloads
//! - `attachments`: attachment path validation
//! - `service`: `TaskService` and the dispatcher it drives

pub mod attachments;
pub mod service;
pub mod types;

pub use attachments::{InvalidAttachment, resolve_attachment, resolve_attachments};
pub use service::{DispatchInput, DispatchOutput, TaskDispatcher, TaskService, TaskServiceDeps};
pub use types::{ListFormat, ListView, TaskKind, TaskResponse, TaskStartRequest};
