//! # scribe-core
//!
//! Foundation types shared by every scribe crate:
//!
//! - **Audio**: [`AudioChunk`] (one unit of decode work) and [`ChunkBuffer`],
//!   which cuts a PCM16 byte stream into fixed-length chunks
//! - **Branded IDs**: [`SessionId`] as a newtype for type safety
//! - **Logging**: [`logging::init_subscriber`] for the global `tracing` subscriber

#![deny(unsafe_code)]

pub mod audio;
pub mod ids;
pub mod logging;

pub use audio::{AudioChunk, AudioError, ChunkBuffer};
pub use ids::SessionId;
