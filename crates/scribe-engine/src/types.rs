//! Core types shared by every engine implementation.

/// Errors raised by engine construction or inference.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Model files missing or unreadable.
    #[error("model not available: {0}")]
    ModelNotAvailable(String),

    /// Session creation or inference failure.
    #[error("inference error: {0}")]
    Inference(String),

    /// Audio the engine cannot process.
    #[error("invalid audio: {0}")]
    InvalidAudio(String),

    /// No engine implementation compiled into this build.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The engine panicked while decoding.
    #[error("engine panicked: {0}")]
    Panicked(String),
}

/// Extension trait to reduce `.map_err()` boilerplate when wrapping errors into [`EngineError`].
pub trait ResultExt<T> {
    /// Wrap the error as [`EngineError::Inference`] with `context` prefix.
    fn inference(self, context: &str) -> Result<T, EngineError>;
    /// Wrap the error as [`EngineError::ModelNotAvailable`] with `context` prefix.
    fn model(self, context: &str) -> Result<T, EngineError>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for Result<T, E> {
    fn inference(self, context: &str) -> Result<T, EngineError> {
        self.map_err(|e| EngineError::Inference(format!("{context}: {e}")))
    }
    fn model(self, context: &str) -> Result<T, EngineError> {
        self.map_err(|e| EngineError::ModelNotAvailable(format!("{context}: {e}")))
    }
}

/// Streaming state of one session, lent to whichever engine decodes its next chunk.
#[derive(Debug, Default, Clone)]
pub struct DecodeContext {
    /// Text recognized so far, across all decoded chunks.
    pub transcript: String,
    /// Number of chunks already decoded.
    pub chunks_decoded: u64,
    /// Audio left over by the previous chunk (partial analysis frame).
    pub carry: Vec<f32>,
}

impl DecodeContext {
    /// Fold one chunk's output into the running transcript.
    ///
    /// A space is inserted between two alphanumeric Latin fragments; CJK
    /// text is concatenated as is.
    pub fn record(&mut self, output: &DecodeOutput) {
        self.chunks_decoded += 1;
        let text = output.text.trim();
        if text.is_empty() {
            return;
        }
        let needs_space = matches!(
            (self.transcript.chars().last(), text.chars().next()),
            (Some(a), Some(b)) if a.is_ascii_alphanumeric() && b.is_ascii_alphanumeric()
        );
        if needs_space {
            self.transcript.push(' ');
        }
        self.transcript.push_str(text);
    }
}

/// Result of decoding one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeOutput {
    /// Text recognized in this chunk.
    pub text: String,
    /// The chunk closed the stream.
    pub is_final: bool,
}
