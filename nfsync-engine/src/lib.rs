//! # nfsync-engine
//!
//! Run orchestration and ledger-gated upload dispatch.
//!
//! Build an [`Engine`] with [`pipeline::build_engine`] and call
//! [`Engine::run`], or claim the run slot with [`Engine::try_begin`] and
//! hand the permit to [`Engine::execute`] on a worker thread.

pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod state;

pub use dispatcher::{DispatchOptions, DispatchOutcome, UploadDispatcher};
pub use engine::{Engine, RunOutcome, RunReport, RunRequest};
pub use error::SyncError;
pub use state::{ProcessingState, RunPermit, SharedState};
