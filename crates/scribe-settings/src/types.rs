//! Settings types.
//!
//! Every struct uses `#[serde(default)]` so a settings file only needs the
//! keys it overrides.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Option-map key for the primary model directory.
pub const MODEL_DIR: &str = "model-dir";
/// Option-map key for the primary model quantization selector.
pub const QUANTIZE: &str = "quantize";
/// Option-map key for the VAD model directory.
pub const VAD_DIR: &str = "vad-dir";
/// Option-map key for the VAD quantization selector.
pub const VAD_QUANT: &str = "vad-quant";
/// Option-map key for the punctuation model directory.
pub const PUNC_DIR: &str = "punc-dir";
/// Option-map key for the punctuation quantization selector.
pub const PUNC_QUANT: &str = "punc-quant";

/// Smallest accepted streaming chunk.
pub const MIN_CHUNK_MS: u32 = 10;
/// Largest accepted streaming chunk.
pub const MAX_CHUNK_MS: u32 = 10_000;

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScribeSettings {
    /// Model locations and quantization selectors.
    pub models: ModelSettings,
    /// Listener and transport settings.
    pub server: ServerSettings,
    /// Pool sizes.
    pub threads: ThreadSettings,
    /// Streaming audio geometry.
    pub stream: StreamSettings,
    /// Diagnostics.
    pub logging: LoggingSettings,
}

impl ScribeSettings {
    /// Check every invariant the service relies on at startup.
    pub fn validate(&self) -> Result<()> {
        match &self.models.model_dir {
            None => {
                return Err(SettingsError::InvalidValue(format!(
                    "{MODEL_DIR} is required"
                )));
            }
            Some(dir) if dir.as_os_str().is_empty() => {
                return Err(SettingsError::InvalidValue(format!(
                    "{MODEL_DIR} must not be empty"
                )));
            }
            Some(_) => {}
        }
        if self.models.intra_op_threads == 0 {
            return Err(SettingsError::InvalidValue(
                "intraOpThreads must be at least 1".into(),
            ));
        }

        for (name, value) in [
            ("io_thread_num", self.threads.io_thread_num),
            ("decoder_thread_num", self.threads.decoder_thread_num),
            ("model_thread_num", self.threads.model_thread_num),
        ] {
            if value == 0 {
                return Err(SettingsError::InvalidValue(format!(
                    "{name} must be at least 1"
                )));
            }
        }

        let _ = self.listen_addr()?;

        if !(MIN_CHUNK_MS..=MAX_CHUNK_MS).contains(&self.stream.chunk_ms) {
            return Err(SettingsError::InvalidValue(format!(
                "chunk_ms must be within {MIN_CHUNK_MS}..={MAX_CHUNK_MS}, got {}",
                self.stream.chunk_ms
            )));
        }
        if self.stream.sample_rate == 0 {
            return Err(SettingsError::InvalidValue(
                "sample_rate must be positive".into(),
            ));
        }
        if self.server.max_message_size == 0 {
            return Err(SettingsError::InvalidValue(
                "maxMessageSize must be positive".into(),
            ));
        }
        Ok(())
    }

    /// The socket address to bind.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.server.listen_ip.parse().map_err(|_| {
            SettingsError::InvalidValue(format!(
                "listen_ip is not an IP address: {}",
                self.server.listen_ip
            ))
        })?;
        Ok(SocketAddr::new(ip, self.server.port))
    }
}

/// Model locations and quantization selectors.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelSettings {
    /// Directory holding the recognition model artifacts (required).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_dir: Option<PathBuf>,
    /// Load `model_quant.onnx` instead of `model.onnx`. Unset means `false`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantize: Option<bool>,
    /// Voice-activity-detection model directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vad_dir: Option<PathBuf>,
    /// Quantization selector for the VAD model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vad_quant: Option<bool>,
    /// Punctuation-restoration model directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub punc_dir: Option<PathBuf>,
    /// Quantization selector for the punctuation model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub punc_quant: Option<bool>,
    /// Intra-op threads per engine instance.
    pub intra_op_threads: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_dir: None,
            quantize: None,
            vad_dir: None,
            vad_quant: None,
            punc_dir: None,
            punc_quant: None,
            intra_op_threads: 1,
        }
    }
}

impl ModelSettings {
    /// Name → value mapping of the model options set by some layer, in
    /// flag order. Unset options are left out.
    pub fn option_map(&self) -> Vec<(&'static str, String)> {
        let dir = |key, value: &Option<PathBuf>| {
            value.as_ref().map(|v| (key, v.display().to_string()))
        };
        let flag = |key, value: Option<bool>| value.map(|v| (key, v.to_string()));
        [
            dir(MODEL_DIR, &self.model_dir),
            flag(QUANTIZE, self.quantize),
            dir(VAD_DIR, &self.vad_dir),
            flag(VAD_QUANT, self.vad_quant),
            dir(PUNC_DIR, &self.punc_dir),
            flag(PUNC_QUANT, self.punc_quant),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Whether the quantized recognition model is selected.
    pub fn use_quantized(&self) -> bool {
        self.quantize.unwrap_or(false)
    }

    /// Whether the quantized VAD model is selected.
    pub fn vad_quantized(&self) -> bool {
        self.vad_quant.unwrap_or(false)
    }

    /// Whether the quantized punctuation model is selected.
    pub fn punc_quantized(&self) -> bool {
        self.punc_quant.unwrap_or(false)
    }
}

/// Listener and transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub listen_ip: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Largest accepted WebSocket message in bytes.
    pub max_message_size: usize,
    /// Interval between server Ping frames, in seconds.
    pub ping_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            port: 8889,
            max_message_size: 4 * 1024 * 1024,
            ping_interval_secs: 30,
        }
    }
}

/// The three independent concurrency knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThreadSettings {
    /// Threads running the network event loop.
    pub io_thread_num: usize,
    /// Threads executing decode tasks.
    pub decoder_thread_num: usize,
    /// Engine instances (bounds concurrent inference).
    pub model_thread_num: usize,
}

impl Default for ThreadSettings {
    fn default() -> Self {
        Self {
            io_thread_num: 8,
            decoder_thread_num: 8,
            model_thread_num: 1,
        }
    }
}

/// Streaming audio geometry.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// Sample rate of incoming PCM16 audio.
    pub sample_rate: u32,
    /// Audio per decode chunk, in milliseconds.
    pub chunk_ms: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            chunk_ms: 600,
        }
    }
}

/// Diagnostics settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
