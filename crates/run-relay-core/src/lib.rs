//! Core building blocks for relaying agent runs to remote observers.
//!
//! This crate provides:
//! - `RunEvent` / `Frame` - Typed events and the frames pushed to observers
//! - `Session` - Append-only event log plus replay-then-live fan-out
//! - `RunRequest` - Validated run input
//! - `RunExecutor` and its notice channel

pub mod event;
pub mod request;
pub mod session;
pub mod traits;

pub use event::{EventKind, Frame, RunEvent};
pub use request::{RawRunRequest, RunRequest, ValidationError};
pub use session::{Attached, ObserverId, Session};
pub use traits::{
    ConfirmationRequest, ExecutorError, ExecutorNotice, NoticeSender, RunExecutor, RunState,
    SessionId,
};
