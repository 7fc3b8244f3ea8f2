//! Agent process executor for relayed runs.
//!
//! Provides:
//! - `CommandExecutor` - `RunExecutor` over a child process speaking JSON lines
//! - Command building utilities
//! - Approval handler trait for confirmation requests

pub mod approvals;
pub mod command;
pub mod process;
pub mod protocol;

pub use approvals::{ApprovalError, ApprovalHandler, ApprovalResult, AutoApproveHandler};
pub use command::{CommandBuildError, CommandBuilder, CommandParts};
pub use process::CommandExecutor;
