//! Background tasks: work delegated to external sessions and reconciled
//! by polling.
//!
//! - `session`: the session API the poller queries
//! - `task`: `BackgroundTask` record and status
//! - `notify`: terminal-transition notifications and sinks
//! - `manager`: launch, poll, event routing, cleanup

pub mod manager;
pub mod notify;
pub mod session;
pub mod task;

pub use manager::{BackgroundManager, SessionEvent};
pub use notify::{NotificationSink, TaskNotification};
pub use session::{
    CreateSessionRequest, MessageRole, PromptRequest, SessionApi, SessionInfo, SessionMessage,
    SessionStatus, SessionTodo, TodoStatus,
};
pub use task::{BackgroundStatus, BackgroundTask, LaunchInput};
