//! Platform recording control.
//!
//! The engine never writes recording media itself: it issues start and
//! stop commands against the telephony control plane and keeps at most
//! one job per call. A command that fails is a warning, never a reason
//! to touch the audio path.

use crate::error::{RecordingError, TransportError};
use aria_config::RecordingConfig;
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use strum_macros::{Display, EnumString};
use tracing::{info, warn};
use uuid::Uuid;

/// Start command payload for the control plane's recording primitive.
#[derive(Debug, Clone)]
pub struct RecordingRequest {
    pub call_id: String,
    pub name: String,
    pub format: String,
    pub max_duration: Duration,
    /// On a name collision: overwrite, or fail the start. Never skip
    /// silently.
    pub overwrite: bool,
}

/// Commands the engine issues back to the telephony control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn start_recording(
        &self,
        request: &RecordingRequest,
    ) -> Result<(), RecordingError>;

    async fn stop_recording(&self, call_id: &str) -> Result<(), RecordingError>;

    async fn hangup(&self, call_id: &str) -> Result<(), TransportError>;
}

/// Stand-in control plane for local runs: commands are logged and
/// acknowledged.
#[derive(Default)]
pub struct LogOnlyControlPlane;

#[async_trait]
impl ControlPlane for LogOnlyControlPlane {
    async fn start_recording(
        &self,
        request: &RecordingRequest,
    ) -> Result<(), RecordingError> {
        info!(
            call = %request.call_id,
            name = %request.name,
            format = %request.format,
            "start recording (log-only control plane)"
        );
        Ok(())
    }

    async fn stop_recording(&self, call_id: &str) -> Result<(), RecordingError> {
        info!(call = call_id, "stop recording (log-only control plane)");
        Ok(())
    }

    async fn hangup(&self, call_id: &str) -> Result<(), TransportError> {
        info!(call = call_id, "hangup (log-only control plane)");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum RecordingStatus {
    #[strum(serialize = "started")]
    Started,
    #[strum(serialize = "stopped")]
    Stopped,
}

/// One platform recording, at most one per call.
#[derive(Debug, Clone)]
pub struct RecordingJob {
    pub call_id: String,
    pub name: String,
    pub status: RecordingStatus,
}

#[derive(Clone)]
pub struct RecordingController {
    control: Arc<dyn ControlPlane>,
}

impl RecordingController {
    pub fn new(control: Arc<dyn ControlPlane>) -> Self {
        Self { control }
    }

    /// Issue the start command if recording is enabled. A failed start
    /// is logged and the call continues unrecorded.
    pub async fn start(
        &self,
        call_id: &str,
        config: &RecordingConfig,
    ) -> Option<RecordingJob> {
        if !config.enabled {
            return None;
        }
        let request = RecordingRequest {
            call_id: call_id.to_string(),
            name: format!("{}-{}", call_id, Uuid::new_v4()),
            format: config.format.clone(),
            max_duration: Duration::from_secs(config.max_duration_secs),
            overwrite: config.overwrite,
        };
        match self.control.start_recording(&request).await {
            Ok(()) => Some(RecordingJob {
                call_id: request.call_id,
                name: request.name,
                status: RecordingStatus::Started,
            }),
            Err(err) => {
                warn!(call = call_id, %err, "recording start failed, call continues");
                None
            }
        }
    }

    pub async fn stop(&self, job: &mut RecordingJob) {
        if job.status != RecordingStatus::Started {
            return;
        }
        match self.control.stop_recording(&job.call_id).await {
            Ok(()) => job.status = RecordingStatus::Stopped,
            Err(err) => {
                warn!(call = %job.call_id, %err, "recording stop failed");
            }
        }
    }
}
