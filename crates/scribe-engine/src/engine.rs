//! The engine boundary: what the decode pool needs from a recognizer.

use scribe_core::AudioChunk;

use crate::types::{DecodeContext, DecodeOutput, EngineError};

/// A recognizer instance. One instance decodes one chunk at a time.
///
/// Instances are not shared: the [`EnginePool`](crate::EnginePool) hands each
/// one to a single decode worker for the duration of a chunk.
pub trait AsrEngine: Send {
    /// Decode `chunk`, reading and updating the session's streaming state.
    fn decode(
        &mut self,
        ctx: &mut DecodeContext,
        chunk: &AudioChunk,
    ) -> Result<DecodeOutput, EngineError>;
}

/// Builds engine instances at startup.
pub trait EngineFactory: Send + Sync {
    /// Create the engine with pool slot `index`.
    fn create(&self, index: usize) -> Result<Box<dyn AsrEngine>, EngineError>;
}

impl<F> EngineFactory for F
where
    F: Fn(usize) -> Result<Box<dyn AsrEngine>, EngineError> + Send + Sync,
{
    fn create(&self, index: usize) -> Result<Box<dyn AsrEngine>, EngineError> {
        self(index)
    }
}
