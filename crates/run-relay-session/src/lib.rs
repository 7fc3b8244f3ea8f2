//! Session registry, run orchestration, and admission control.
//!
//! Provides:
//! - `SessionRegistry` - Process-wide session map with reclaim and keep-alive
//! - `RunOrchestrator` - Drive executors into session events or buffered results
//! - `AdmissionController` - Multi-session and single-flight admission

pub mod admission;
pub mod orchestrator;
pub mod registry;

pub use admission::{AdmissionController, AdmissionPermit, AdmissionPolicy};
pub use orchestrator::{BufferedRun, RunOrchestrator, StartError};
pub use registry::{AttachError, RegistryClosed, SessionRegistry, Subscription};
