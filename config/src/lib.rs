//! Configuration snapshot for the bridge engine.
//!
//! One TOML document describes the AI providers, the assembled
//! STT/LLM/TTS pipelines, diagnostics capture, platform recording and
//! engine tuning. Every cross reference is checked at load time so a
//! malformed name can never surface in the middle of a call.

use parking_lot::RwLock;
use serde::Deserialize;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can't read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("can't parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("default_provider `{0}` is not a configured provider")]
    UnknownDefaultProvider(String),

    #[error("default_provider `{0}` is not a monolithic provider")]
    DefaultProviderNotMonolithic(String),

    #[error("active_pipeline `{0}` is not a configured pipeline")]
    UnknownActivePipeline(String),

    #[error("pipeline `{pipeline}` references unknown {role} provider `{name}`")]
    UnknownPipelineRef {
        pipeline: String,
        role: String,
        name: String,
    },

    #[error("pipeline `{pipeline}` {role} provider `{name}` is not a pipeline component")]
    NotAComponent {
        pipeline: String,
        role: String,
        name: String,
    },

    #[error("diagnostics enabled without an output_directory")]
    MissingTapDirectory,

    #[error("provider `{0}` can't be resolved")]
    Unresolved(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[strum(serialize = "monolithic")]
    Monolithic,
    #[strum(serialize = "pipeline_component")]
    PipelineComponent,
}

/// One configured AI endpoint. Read-only for the lifetime of a call.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
}

/// One named STT -> LLM -> TTS composition.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub stt: String,
    pub llm: String,
    pub tts: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DiagnosticsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Where tap files go. There is no built-in fallback: when capture
    /// is enabled this must be set, and it is used exactly as given.
    pub output_directory: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub retain: bool,
    /// Optional sweep deleting retained tap directories older than this.
    pub max_age_secs: Option<u64>,
    #[serde(default = "default_max_open_taps")]
    pub max_open_taps: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RecordingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_recording_format")]
    pub format: String,
    #[serde(default = "default_recording_max_secs")]
    pub max_duration_secs: u64,
    /// On a name collision: true overwrites, false fails the start.
    /// A failed start is logged and the call carries on unrecorded.
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Hang the call up when provider setup fails.
    #[strum(serialize = "terminate")]
    Terminate,
    /// Keep the call alive with no AI audio.
    #[default]
    #[strum(serialize = "continue")]
    Continue,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_frame_ms")]
    pub frame_ms: usize,
    #[serde(default = "default_channel_rate")]
    pub channel_rate: u32,
    #[serde(default = "default_provider_rate")]
    pub provider_rate: u32,
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f64,
    #[serde(default = "default_jitter_min_depth")]
    pub jitter_min_depth: usize,
    #[serde(default = "default_jitter_max_depth")]
    pub jitter_max_depth: usize,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
    #[serde(default)]
    pub on_provider_failure: FailurePolicy,
    #[serde(default = "default_reload_secs")]
    pub reload_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub pipelines: HashMap<String, PipelineConfig>,
    pub default_provider: Option<String>,
    pub active_pipeline: Option<String>,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_true() -> bool {
    true
}

fn default_max_open_taps() -> usize {
    512
}

fn default_recording_format() -> String {
    "wav".to_string()
}

fn default_recording_max_secs() -> u64 {
    3600
}

fn default_listen() -> String {
    "127.0.0.1:8088".to_string()
}

fn default_frame_ms() -> usize {
    20
}

fn default_channel_rate() -> u32 {
    8000
}

fn default_provider_rate() -> u32 {
    16000
}

fn default_vad_threshold() -> f64 {
    0.6
}

fn default_jitter_min_depth() -> usize {
    2
}

fn default_jitter_max_depth() -> usize {
    10
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_connect_backoff_ms() -> u64 {
    250
}

fn default_reload_secs() -> u64 {
    30
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every provider and pipeline reference. Runs once per load
    /// so call setup never trips over a dangling name.
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(name) = &self.default_provider {
            match self.providers.get(name) {
                None => {
                    return Err(ConfigError::UnknownDefaultProvider(name.clone()))
                }
                Some(p) if p.kind != ProviderKind::Monolithic => {
                    return Err(ConfigError::DefaultProviderNotMonolithic(
                        name.clone(),
                    ))
                }
                Some(_) => {}
            }
        }

        if let Some(name) = &self.active_pipeline {
            if !self.pipelines.contains_key(name) {
                return Err(ConfigError::UnknownActivePipeline(name.clone()));
            }
        }

        for (pipeline, p) in &self.pipelines {
            for (role, name) in
                [("stt", &p.stt), ("llm", &p.llm), ("tts", &p.tts)]
            {
                match self.providers.get(name) {
                    None => {
                        return Err(ConfigError::UnknownPipelineRef {
                            pipeline: pipeline.clone(),
                            role: role.to_string(),
                            name: name.clone(),
                        })
                    }
                    Some(p) if p.kind != ProviderKind::PipelineComponent => {
                        return Err(ConfigError::NotAComponent {
                            pipeline: pipeline.clone(),
                            role: role.to_string(),
                            name: name.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }
        }

        if self.diagnostics.enabled && self.diagnostics.output_directory.is_none()
        {
            return Err(ConfigError::MissingTapDirectory);
        }

        Ok(())
    }
}

/// Shared, atomically swappable configuration snapshot. Readers clone an
/// `Arc` out; a reload replaces the whole snapshot in one store so a call
/// never observes a half-applied document.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<Config>>>,
    path: Option<Arc<PathBuf>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
            path: None,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Config::load(&path)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
            path: Some(Arc::new(path.as_ref().to_path_buf())),
        })
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.inner.read().clone()
    }

    pub fn replace(&self, config: Config) {
        *self.inner.write() = Arc::new(config);
    }

    /// Re-read the document on an interval. A document that fails to
    /// load or validate leaves the previous snapshot in place.
    pub fn spawn_reload(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            let Some(path) = handle.path.clone() else {
                return;
            };
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match Config::load(path.as_ref()) {
                    Ok(config) => {
                        handle.replace(config);
                        info!("configuration reloaded");
                    }
                    Err(err) => {
                        warn!(%err, "configuration reload failed, keeping previous snapshot");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        default_provider = "deepgram"
        active_pipeline = "local"

        [providers.deepgram]
        kind = "monolithic"

        [providers.whisper]
        kind = "pipeline_component"

        [providers.llama]
        kind = "pipeline_component"

        [providers.piper]
        kind = "pipeline_component"

        [pipelines.local]
        stt = "whisper"
        llm = "llama"
        tts = "piper"

        [diagnostics]
        enabled = true
        output_directory = "/tmp/taps"
        retain = true

        [recording]
        enabled = true
        max_duration_secs = 120
        overwrite = true
    "#;

    #[test]
    fn parses_complete_document() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.default_provider.as_deref(), Some("deepgram"));
        assert_eq!(
            config.providers["deepgram"].kind,
            ProviderKind::Monolithic
        );
        assert_eq!(config.pipelines["local"].stt, "whisper");
        assert_eq!(
            config.diagnostics.output_directory.as_deref(),
            Some(Path::new("/tmp/taps"))
        );
        assert!(config.recording.overwrite);
        assert_eq!(config.engine.frame_ms, 20);
        assert_eq!(config.engine.on_provider_failure, FailurePolicy::Continue);
    }

    #[test]
    fn rejects_unknown_default_provider() {
        let err = Config::parse(r#"default_provider = "ghost""#).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDefaultProvider(name) if name == "ghost"));
    }

    #[test]
    fn rejects_pipeline_with_unknown_member() {
        let err = Config::parse(
            r#"
            [providers.whisper]
            kind = "pipeline_component"

            [pipelines.local]
            stt = "whisper"
            llm = "ghost"
            tts = "whisper"
        "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownPipelineRef { role, name, .. }
                if role == "llm" && name == "ghost"
        ));
    }

    #[test]
    fn rejects_pipeline_member_of_wrong_kind() {
        let err = Config::parse(
            r#"
            [providers.deepgram]
            kind = "monolithic"

            [providers.whisper]
            kind = "pipeline_component"

            [pipelines.local]
            stt = "whisper"
            llm = "deepgram"
            tts = "whisper"
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::NotAComponent { .. }));
    }

    #[test]
    fn rejects_diagnostics_without_directory() {
        let err = Config::parse(
            r#"
            [diagnostics]
            enabled = true
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingTapDirectory));
    }

    #[test]
    fn handle_swaps_snapshots_atomically() {
        let handle = ConfigHandle::new(Config::parse(SAMPLE).unwrap());
        let before = handle.snapshot();
        handle.replace(Config::default());
        let after = handle.snapshot();
        assert_eq!(before.default_provider.as_deref(), Some("deepgram"));
        assert!(after.default_provider.is_none());
    }
}
