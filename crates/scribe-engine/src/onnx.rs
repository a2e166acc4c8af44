//! Paraformer engine on ONNX Runtime.
//!
//! ```text
//! samples (+ carry) → fbank [T, 80] → LFR [T', 560] → CMVN
//! → model.onnx (speech, speech_lengths) → logits [1, L, V], token_num
//! → greedy argmax → tokens → text
//! ```
//!
//! ONNX tensor shapes use `i64` dimensions while Rust indexing needs `usize`.
//! These casts are safe because tensor dimensions are always small positive values.
#![allow(
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation
)]

use std::sync::Arc;

use ndarray::ArrayView2;
use ort::session::Session;
use ort::value::Tensor;
use scribe_core::AudioChunk;
use tracing::{debug, info, warn};

use crate::decode;
use crate::engine::{AsrEngine, EngineFactory};
use crate::frontend::{Cmvn, FEATURE_DIM, Fbank, Frontend, split_with_carry};
use crate::model::{ModelPaths, load_tokens};
use crate::types::{DecodeContext, DecodeOutput, EngineError, ResultExt};

/// Builds one ONNX session per pool slot, sharing tokens and CMVN.
pub struct OnnxEngineFactory {
    paths: ModelPaths,
    intra_threads: usize,
    sample_rate: u32,
    tokens: Arc<Vec<String>>,
    cmvn: Cmvn,
}

impl OnnxEngineFactory {
    /// Load the shared artifacts (tokens, CMVN) from resolved paths.
    pub fn new(
        paths: ModelPaths,
        intra_threads: usize,
        sample_rate: u32,
    ) -> Result<Self, EngineError> {
        let tokens = load_tokens(&paths.tokens)?;
        let cmvn = Cmvn::from_file(&paths.cmvn)?;
        if cmvn.dim() != FEATURE_DIM {
            return Err(EngineError::ModelNotAvailable(format!(
                "am.mvn dimension {} does not match feature dimension {FEATURE_DIM}",
                cmvn.dim()
            )));
        }
        if let Some(vad) = &paths.vad {
            warn!(path = %vad.display(), "vad model resolved but not applied by the paraformer engine");
        }
        if let Some(punc) = &paths.punc {
            warn!(path = %punc.display(), "punctuation model resolved but not applied by the paraformer engine");
        }
        info!(
            model = %paths.model.display(),
            vocab = tokens.len(),
            "paraformer artifacts loaded"
        );
        Ok(Self {
            paths,
            intra_threads,
            sample_rate,
            tokens: Arc::new(tokens),
            cmvn,
        })
    }
}

impl EngineFactory for OnnxEngineFactory {
    fn create(&self, index: usize) -> Result<Box<dyn AsrEngine>, EngineError> {
        let session = Session::builder()
            .model("session builder")?
            .with_intra_threads(self.intra_threads)
            .model("set threads")?
            .commit_from_file(&self.paths.model)
            .model("load model")?;
        debug!(engine = index, "onnx session loaded");
        Ok(Box::new(ParaformerEngine {
            session,
            frontend: Frontend::new(Fbank::new(self.sample_rate), self.cmvn.clone()),
            tokens: Arc::clone(&self.tokens),
        }))
    }
}

/// One Paraformer session with its own frontend.
pub struct ParaformerEngine {
    session: Session,
    frontend: Frontend,
    tokens: Arc<Vec<String>>,
}

impl ParaformerEngine {
    fn run(&mut self, features: &[Vec<f32>]) -> Result<String, EngineError> {
        let frames = features.len();
        let flat: Vec<f32> = features.iter().flatten().copied().collect();
        let speech = Tensor::from_array(([1i64, frames as i64, FEATURE_DIM as i64], flat))
            .inference("speech tensor")?;
        let speech_lengths =
            Tensor::from_array(([1i64], vec![frames as i32])).inference("speech_lengths tensor")?;

        let outputs = self
            .session
            .run(ort::inputs![
                "speech" => speech,
                "speech_lengths" => speech_lengths,
            ])
            .inference("paraformer run")?;

        let (shape, logits) = outputs["logits"]
            .try_extract_tensor::<f32>()
            .inference("extract logits")?;
        if shape.len() != 3 {
            return Err(EngineError::Inference(format!(
                "logits rank {} (expected 3)",
                shape.len()
            )));
        }
        let (len, vocab) = (shape[1] as usize, shape[2] as usize);

        let token_num = match outputs["token_num"].try_extract_tensor::<i32>() {
            Ok((_, n)) => n.first().map_or(0, |v| *v as usize),
            Err(_) => {
                let (_, n) = outputs["token_num"]
                    .try_extract_tensor::<i64>()
                    .inference("extract token_num")?;
                n.first().map_or(0, |v| *v as usize)
            }
        };

        let view = ArrayView2::from_shape((len, vocab), logits).inference("reshape logits")?;
        let ids: Vec<usize> = view
            .rows()
            .into_iter()
            .take(token_num.min(len))
            .map(|row| row.as_slice().map_or(0, decode::argmax))
            .collect();
        Ok(decode::ids_to_text(&ids, &self.tokens))
    }
}

impl AsrEngine for ParaformerEngine {
    fn decode(
        &mut self,
        ctx: &mut DecodeContext,
        chunk: &AudioChunk,
    ) -> Result<DecodeOutput, EngineError> {
        let (audio, tail) = split_with_carry(&ctx.carry, &chunk.samples, chunk.is_final);
        ctx.carry = tail;

        let features = self.frontend.features(&audio);
        if features.is_empty() {
            return Ok(DecodeOutput {
                text: String::new(),
                is_final: chunk.is_final,
            });
        }

        let text = self.run(&features)?;
        debug!(seq = chunk.seq, frames = features.len(), chars = text.len(), "chunk decoded");
        Ok(DecodeOutput {
            text,
            is_final: chunk.is_final,
        })
    }
}
