//! Recognition engine boundary for the scribe ASR server.
//!
//! The decode pool only sees [`AsrEngine`] trait objects handed out by an
//! [`EnginePool`]. Concrete engines are built through an [`EngineFactory`];
//! [`default_factory`] returns the ONNX Paraformer factory when the crate
//! is built with the `ort` feature.
//!
//! ```text
//! ModelSettings → ModelPaths::resolve → EngineFactory
//!   → EnginePool::initialize(model_thread_num) → checkout → EngineLease
//! ```

#![deny(unsafe_code)]

pub mod decode;
pub mod engine;
pub mod frontend;
pub mod model;
#[cfg(feature = "ort")]
pub mod onnx;
pub mod pool;
pub mod types;

use scribe_settings::ScribeSettings;
use tracing::debug;

pub use engine::{AsrEngine, EngineFactory};
pub use model::ModelPaths;
pub use pool::{EngineLease, EnginePool};
pub use types::{DecodeContext, DecodeOutput, EngineError, ResultExt};

/// Build the engine factory for this build's inference backend.
///
/// Model files are resolved first, so a missing artifact is reported as
/// [`EngineError::ModelNotAvailable`] regardless of backend.
pub fn default_factory(settings: &ScribeSettings) -> Result<Box<dyn EngineFactory>, EngineError> {
    let paths = ModelPaths::resolve(&settings.models)?;
    debug!(model = %paths.model.display(), "building engine factory");

    #[cfg(feature = "ort")]
    {
        let factory = onnx::OnnxEngineFactory::new(
            paths,
            settings.models.intra_op_threads,
            settings.stream.sample_rate,
        )?;
        Ok(Box::new(factory))
    }

    #[cfg(not(feature = "ort"))]
    {
        drop(paths);
        Err(EngineError::Unsupported(
            "no inference backend compiled in; rebuild scribe-engine with `--features ort`".into(),
        ))
    }
}
