//! Per-call provider resolution.
//!
//! Resolution happens exactly once, when a session connects, and the
//! outcome is a closed variant the rest of the engine matches on. No
//! stage downstream ever inspects a provider object to learn its shape.

use aria_config::{Config, ConfigError, ProviderKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no provider or pipeline configured")]
    NoRoute,
}

/// The execution path resolved for one call, immutable from the moment
/// the session connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedPath {
    Monolithic(String),
    Pipeline {
        name: String,
        stt: String,
        llm: String,
        tts: String,
    },
}

impl ResolvedPath {
    /// Label for events and metrics: the provider name, or the
    /// pipeline name for assembled paths.
    pub fn label(&self) -> &str {
        match self {
            ResolvedPath::Monolithic(name) => name,
            ResolvedPath::Pipeline { name, .. } => name,
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            ResolvedPath::Monolithic(_) => "monolithic",
            ResolvedPath::Pipeline { .. } => "pipeline",
        }
    }
}

fn resolve_pipeline(
    config: &Config,
    name: &str,
) -> Result<ResolvedPath, RouteError> {
    let pipeline = config
        .pipelines
        .get(name)
        .ok_or_else(|| ConfigError::Unresolved(name.to_string()))?;
    Ok(ResolvedPath::Pipeline {
        name: name.to_string(),
        stt: pipeline.stt.clone(),
        llm: pipeline.llm.clone(),
        tts: pipeline.tts.clone(),
    })
}

/// First match wins: per-call override, configured default provider,
/// configured active pipeline. Nothing configured rejects the call.
pub fn resolve(
    config: &Config,
    override_name: Option<&str>,
) -> Result<ResolvedPath, RouteError> {
    if let Some(name) = override_name {
        if let Some(provider) = config.providers.get(name) {
            return match provider.kind {
                ProviderKind::Monolithic => {
                    Ok(ResolvedPath::Monolithic(name.to_string()))
                }
                // a lone component can't take a call
                ProviderKind::PipelineComponent => {
                    Err(ConfigError::Unresolved(name.to_string()).into())
                }
            };
        }
        return resolve_pipeline(config, name);
    }

    if let Some(name) = &config.default_provider {
        if !config.providers.contains_key(name) {
            return Err(ConfigError::Unresolved(name.clone()).into());
        }
        return Ok(ResolvedPath::Monolithic(name.clone()));
    }

    if let Some(name) = &config.active_pipeline {
        return resolve_pipeline(config, name);
    }

    Err(RouteError::NoRoute)
}
