//! Model directory layout and path resolution.
//!
//! A recognition model directory contains:
//!
//! ```text
//! model.onnx | model_quant.onnx   acoustic model (quantize selects)
//! am.mvn                          CMVN statistics
//! tokens.json | tokens.txt        token list, index = model output id
//! ```
//!
//! VAD and punctuation directories follow the same `model[_quant].onnx`
//! naming.

use std::path::{Path, PathBuf};

use scribe_settings::ModelSettings;
use tracing::debug;

use crate::types::{EngineError, ResultExt};

const MODEL_FILE: &str = "model.onnx";
const MODEL_QUANT_FILE: &str = "model_quant.onnx";
const CMVN_FILE: &str = "am.mvn";
const TOKENS_JSON: &str = "tokens.json";
const TOKENS_TXT: &str = "tokens.txt";

/// Resolved, existence-checked model files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    /// Acoustic model (`model.onnx` or `model_quant.onnx`).
    pub model: PathBuf,
    /// CMVN statistics (`am.mvn`).
    pub cmvn: PathBuf,
    /// Token list (`tokens.json`, else `tokens.txt`).
    pub tokens: PathBuf,
    /// Voice-activity-detection model, when configured.
    pub vad: Option<PathBuf>,
    /// Punctuation model, when configured.
    pub punc: Option<PathBuf>,
}

impl ModelPaths {
    /// Resolve every configured model file, failing on the first missing one.
    pub fn resolve(settings: &ModelSettings) -> Result<Self, EngineError> {
        let dir = settings.model_dir.as_deref().ok_or_else(|| {
            EngineError::ModelNotAvailable("no model directory configured".into())
        })?;
        require_dir(dir)?;

        let model = require_file(dir, onnx_name(settings.use_quantized()))?;
        let cmvn = require_file(dir, CMVN_FILE)?;
        let tokens = match require_file(dir, TOKENS_JSON) {
            Ok(path) => path,
            Err(_) => require_file(dir, TOKENS_TXT)?,
        };

        let vad = optional_model(settings.vad_dir.as_deref(), settings.vad_quantized())?;
        let punc = optional_model(settings.punc_dir.as_deref(), settings.punc_quantized())?;

        let paths = Self {
            model,
            cmvn,
            tokens,
            vad,
            punc,
        };
        debug!(?paths, "model paths resolved");
        Ok(paths)
    }
}

fn onnx_name(quantize: bool) -> &'static str {
    if quantize { MODEL_QUANT_FILE } else { MODEL_FILE }
}

fn require_dir(dir: &Path) -> Result<(), EngineError> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(EngineError::ModelNotAvailable(format!(
            "model directory not found: {}",
            dir.display()
        )))
    }
}

fn require_file(dir: &Path, name: &str) -> Result<PathBuf, EngineError> {
    let path = dir.join(name);
    if path.is_file() {
        Ok(path)
    } else {
        Err(EngineError::ModelNotAvailable(format!(
            "missing {}",
            path.display()
        )))
    }
}

fn optional_model(dir: Option<&Path>, quantize: bool) -> Result<Option<PathBuf>, EngineError> {
    dir.map(|dir| {
        require_dir(dir)?;
        require_file(dir, onnx_name(quantize))
    })
    .transpose()
}

/// Load the token list: a JSON array of strings, or one token per line
/// (first whitespace-separated field) for `.txt` files.
pub fn load_tokens(path: &Path) -> Result<Vec<String>, EngineError> {
    let content = std::fs::read_to_string(path).model(&format!("read {}", path.display()))?;
    let is_json = path.extension().is_some_and(|ext| ext == "json");
    let tokens: Vec<String> = if is_json {
        serde_json::from_str(&content).model("parse tokens.json")?
    } else {
        content
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect()
    };
    if tokens.is_empty() {
        return Err(EngineError::ModelNotAvailable(format!(
            "empty token list: {}",
            path.display()
        )));
    }
    Ok(tokens)
}
