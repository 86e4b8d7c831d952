//! Per-call lifecycle milestones, broadcast to observers and streamed
//! over `/events` for the activity dashboard. The engine itself never
//! reads these back: session state lives in the session manager, the
//! event stream is observability only.

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum_macros::{Display, EnumString};
use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
pub enum CallEventKind {
    #[strum(serialize = "arrival")]
    Arrival,
    #[strum(serialize = "provider_resolved")]
    ProviderResolved,
    #[strum(serialize = "pipeline_assigned")]
    PipelineAssigned,
    #[strum(serialize = "media_established")]
    MediaEstablished,
    #[strum(serialize = "ended")]
    Ended,
    #[strum(serialize = "error")]
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallEvent {
    pub call_id: String,
    pub kind: CallEventKind,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CallEvent {
    pub fn new(call_id: impl Into<String>, kind: CallEventKind) -> Self {
        Self {
            call_id: call_id.into(),
            kind,
            at: Utc::now(),
            provider: None,
            pipeline: None,
            detail: None,
        }
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.pipeline = Some(pipeline.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CallEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.sender.subscribe()
    }

    /// Log and broadcast. Succeeds whether or not anyone is listening.
    pub fn emit(&self, event: CallEvent) {
        info!(
            call = %event.call_id,
            kind = %event.kind,
            provider = event.provider.as_deref().unwrap_or(""),
            pipeline = event.pipeline.as_deref().unwrap_or(""),
            "call event"
        );
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(CallEvent::new("C1", CallEventKind::Arrival));
        bus.emit(
            CallEvent::new("C1", CallEventKind::ProviderResolved)
                .provider("deepgram"),
        );
        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, CallEventKind::Arrival);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.provider.as_deref(), Some("deepgram"));
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        EventBus::default().emit(CallEvent::new("C1", CallEventKind::Ended));
    }

    #[test]
    fn events_serialize_compactly() {
        let event = CallEvent::new("C1", CallEventKind::PipelineAssigned)
            .pipeline("local");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "pipeline_assigned");
        assert_eq!(json["pipeline"], "local");
        assert!(json.get("provider").is_none());
    }
}
