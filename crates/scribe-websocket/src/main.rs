//! # scribe-websocket
//!
//! Streaming speech-recognition server binary: resolves settings from
//! defaults, the settings file, `SCRIBE_*` variables and flags, loads the
//! engines, and serves until SIGINT/SIGTERM.
//!
//! Exits `0` after a graceful shutdown and `1` when startup fails.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use scribe_server::AsrService;
use scribe_settings::{ScribeSettings, load_settings_from_path, parse_bool, settings_path};
use tracing::{error, info};

/// Streaming ASR WebSocket server.
#[derive(Parser, Debug)]
#[command(name = "scribe-websocket", about = "Streaming ASR WebSocket server", version)]
struct Cli {
    /// Directory containing the recognition model (required).
    #[arg(long = "model-dir")]
    model_dir: Option<PathBuf>,

    /// Load the quantized model artifact (true/false).
    #[arg(long, value_parser = bool_string)]
    quantize: Option<bool>,

    /// Voice-activity-detection model directory.
    #[arg(long = "vad-dir")]
    vad_dir: Option<PathBuf>,

    /// Load the quantized VAD model (true/false).
    #[arg(long = "vad-quant", value_parser = bool_string)]
    vad_quant: Option<bool>,

    /// Punctuation model directory.
    #[arg(long = "punc-dir")]
    punc_dir: Option<PathBuf>,

    /// Load the quantized punctuation model (true/false).
    #[arg(long = "punc-quant", value_parser = bool_string)]
    punc_quant: Option<bool>,

    /// Address to bind [default: 0.0.0.0].
    #[arg(long = "listen_ip")]
    listen_ip: Option<String>,

    /// Port to bind [default: 8889].
    #[arg(long)]
    port: Option<u16>,

    /// Threads serving network I/O [default: 8].
    #[arg(long = "io_thread_num")]
    io_thread_num: Option<usize>,

    /// Threads running decode tasks [default: 8].
    #[arg(long = "decoder_thread_num")]
    decoder_thread_num: Option<usize>,

    /// Engine instances [default: 1].
    #[arg(long = "model_thread_num")]
    model_thread_num: Option<usize>,

    /// Settings file [default: ~/.scribe/settings.json].
    #[arg(long)]
    config: Option<PathBuf>,

    /// Streaming chunk length in milliseconds.
    #[arg(long = "chunk-ms")]
    chunk_ms: Option<u32>,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long = "log-level")]
    log_level: Option<String>,
}

fn bool_string(s: &str) -> Result<bool, String> {
    parse_bool(s).ok_or_else(|| format!("expected true or false, got `{s}`"))
}

impl Cli {
    /// Layer flags over file and environment settings.
    fn apply(self, settings: &mut ScribeSettings) {
        let models = &mut settings.models;
        if let Some(dir) = self.model_dir {
            models.model_dir = Some(dir);
        }
        models.quantize = self.quantize.or(models.quantize);
        if let Some(dir) = self.vad_dir {
            models.vad_dir = Some(dir);
        }
        models.vad_quant = self.vad_quant.or(models.vad_quant);
        if let Some(dir) = self.punc_dir {
            models.punc_dir = Some(dir);
        }
        models.punc_quant = self.punc_quant.or(models.punc_quant);
        if let Some(ip) = self.listen_ip {
            settings.server.listen_ip = ip;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(n) = self.io_thread_num {
            settings.threads.io_thread_num = n;
        }
        if let Some(n) = self.decoder_thread_num {
            settings.threads.decoder_thread_num = n;
        }
        if let Some(n) = self.model_thread_num {
            settings.threads.model_thread_num = n;
        }
        if let Some(ms) = self.chunk_ms {
            settings.stream.chunk_ms = ms;
        }
        if let Some(level) = self.log_level {
            settings.logging.level = level;
        }
    }
}

/// Defaults, then the settings file and environment, then flags.
fn resolve_settings(mut cli: Cli) -> Result<ScribeSettings> {
    let path = cli.config.take().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    Ok(settings)
}

fn run(cli: Cli) -> Result<()> {
    let settings = resolve_settings(cli)?;
    scribe_core::logging::init_subscriber(&settings.logging.level);
    settings.validate().context("invalid configuration")?;

    for (key, value) in settings.models.option_map() {
        info!("{key} : {value}");
    }

    let factory = scribe_engine::default_factory(&settings)
        .context("failed to initialise the recognition engine")?;
    let service =
        AsrService::start(settings, factory.as_ref()).context("failed to start the service")?;
    info!(
        "asr model init finished. listen on port: {}",
        service.local_addr().port()
    );

    let report = service
        .run_until_signal()
        .context("server stopped with an error")?;
    info!(
        discarded = report.discarded,
        workers = report.workers_joined,
        "shutdown complete"
    );
    Ok(())
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "startup failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("scribe-websocket").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn no_flags_leave_settings_alone() {
        let mut settings = ScribeSettings::default();
        parse(&[]).apply(&mut settings);
        assert_eq!(settings.server.port, 8889);
        assert_eq!(settings.threads.io_thread_num, 8);
        assert!(settings.models.model_dir.is_none());
    }

    #[test]
    fn original_flag_spellings() {
        let cli = parse(&[
            "--model-dir",
            "/models/asr",
            "--quantize",
            "true",
            "--vad-dir",
            "/models/vad",
            "--vad-quant",
            "false",
            "--punc-dir",
            "/models/punc",
            "--punc-quant",
            "1",
            "--listen_ip",
            "127.0.0.1",
            "--port",
            "10095",
            "--io_thread_num",
            "2",
            "--decoder_thread_num",
            "4",
            "--model_thread_num",
            "3",
        ]);
        let mut settings = ScribeSettings::default();
        cli.apply(&mut settings);

        assert_eq!(settings.models.model_dir, Some(PathBuf::from("/models/asr")));
        assert_eq!(settings.models.quantize, Some(true));
        assert_eq!(settings.models.vad_quant, Some(false));
        assert_eq!(settings.models.punc_quant, Some(true));
        assert_eq!(settings.server.listen_ip, "127.0.0.1");
        assert_eq!(settings.server.port, 10095);
        assert_eq!(settings.threads.io_thread_num, 2);
        assert_eq!(settings.threads.decoder_thread_num, 4);
        assert_eq!(settings.threads.model_thread_num, 3);
        settings.validate().unwrap();
    }

    #[test]
    fn bool_strings_accept_common_spellings() {
        assert!(parse(&["--quantize", "YES"]).quantize.unwrap());
        assert!(!parse(&["--quantize", "off"]).quantize.unwrap());
    }

    #[test]
    fn invalid_bool_string_is_rejected() {
        let err = Cli::try_parse_from(["scribe-websocket", "--quantize", "maybe"]).unwrap_err();
        assert!(err.to_string().contains("maybe"));
    }

    #[test]
    fn extra_flags() {
        let cli = parse(&["--chunk-ms", "300", "--log-level", "debug"]);
        let mut settings = ScribeSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.stream.chunk_ms, 300);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn flags_override_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 9000}, "threads": {"decoderThreadNum": 5}}"#,
        )
        .unwrap();

        let cli = parse(&["--config", path.to_str().unwrap(), "--port", "9100"]);
        let settings = resolve_settings(cli).unwrap();
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.threads.decoder_thread_num, 5);
    }

    #[test]
    fn broken_settings_file_is_a_startup_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ nope").unwrap();
        let cli = parse(&["--config", path.to_str().unwrap()]);
        let err = resolve_settings(cli).unwrap_err();
        assert!(format!("{err:#}").contains("failed to load settings"));
    }

    #[test]
    fn missing_model_dir_fails_before_serving() {
        let dir = tempfile::tempdir().unwrap();
        let cli = parse(&[
            "--config",
            dir.path().join("absent.json").to_str().unwrap(),
            "--port",
            "0",
        ]);
        let err = run(cli).unwrap_err();
        assert!(format!("{err:#}").contains("model-dir"));
    }

    #[test]
    fn only_passed_quant_flags_reach_the_option_map() {
        let cli = parse(&["--model-dir", "/models/asr", "--punc-quant", "false"]);
        let mut settings = ScribeSettings::default();
        cli.apply(&mut settings);
        let keys: Vec<_> = settings
            .models
            .option_map()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, ["model-dir", "punc-quant"]);
    }
}
