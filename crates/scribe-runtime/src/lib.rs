//! # scribe-runtime
//!
//! The decode side of the server:
//!
//! - [`DecodeExecutor`]: FIFO work queue drained by `decoder_thread_num`
//!   named threads, kept alive by a [`WorkGuard`]
//! - [`Session`]: per-client state machine with a strand that decodes its
//!   chunks strictly in order, one at a time
//! - [`SessionRegistry`]: every live session, for shutdown draining

#![deny(unsafe_code)]

pub mod executor;
pub mod registry;
pub mod session;

pub use executor::{DecodeExecutor, DecodeQueue, ExecutorError, Job, ShutdownReport, WorkGuard};
pub use registry::{Admission, SessionRegistry};
pub use session::{DrainReason, ErrorCode, Outbound, Session, SessionState};
