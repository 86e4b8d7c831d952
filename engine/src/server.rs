//! Engine assembly and the HTTP surface: control-plane event ingress,
//! metrics exposition, the lifecycle event stream and health probes.

use crate::events::EventBus;
use crate::provider::{LoopbackConnector, ProviderConnector};
use crate::recording::{ControlPlane, LogOnlyControlPlane};
use crate::session::{CallControlEvent, SessionManager};
use anyhow::Result;
use aria_config::ConfigHandle;
use aria_tap::{TapManager, TapSettings};
use aria_telemetry::Metrics;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use std::{sync::Arc, time::Duration};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Clone)]
struct AppState {
    manager: SessionManager,
    metrics: Metrics,
    events: EventBus,
}

pub struct Engine {
    config: ConfigHandle,
    manager: SessionManager,
    metrics: Metrics,
    events: EventBus,
    taps: Arc<TapManager>,
}

impl Engine {
    /// Engine with the in-tree collaborators: a loopback provider and a
    /// log-only control plane.
    pub fn new(config: ConfigHandle) -> Engine {
        Self::with_collaborators(
            config,
            Arc::new(LogOnlyControlPlane),
            Arc::new(LoopbackConnector),
        )
    }

    pub fn with_collaborators(
        config: ConfigHandle,
        control: Arc<dyn ControlPlane>,
        connector: Arc<dyn ProviderConnector>,
    ) -> Engine {
        let snapshot = config.snapshot();
        let metrics = Metrics::new();
        let events = EventBus::default();
        // load-time validation guarantees a directory whenever capture
        // is enabled; a disabled manager never touches the path
        let taps = Arc::new(TapManager::new(TapSettings {
            enabled: snapshot.diagnostics.enabled,
            output_directory: snapshot
                .diagnostics
                .output_directory
                .clone()
                .unwrap_or_default(),
            retain: snapshot.diagnostics.retain,
            max_age: snapshot.diagnostics.max_age_secs.map(Duration::from_secs),
            max_open_taps: snapshot.diagnostics.max_open_taps,
        }));
        let manager = SessionManager::new(
            config.clone(),
            taps.clone(),
            metrics.clone(),
            events.clone(),
            control,
            connector,
        );
        Engine {
            config,
            manager,
            metrics,
            events,
            taps,
        }
    }

    pub fn manager(&self) -> SessionManager {
        self.manager.clone()
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.clone()
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            manager: self.manager.clone(),
            metrics: self.metrics.clone(),
            events: self.events.clone(),
        };
        Router::new()
            .route("/call/event", post(call_event))
            .route("/metrics", get(metrics_text))
            .route("/events", get(event_stream))
            .route("/healthz", get(healthz))
            .route("/readyz", get(readyz))
            .with_state(state)
    }

    pub async fn run(self) -> Result<()> {
        let snapshot = self.config.snapshot();
        self.config
            .spawn_reload(Duration::from_secs(snapshot.engine.reload_secs));
        if snapshot.diagnostics.max_age_secs.is_some() {
            self.taps.spawn_sweeper(SWEEP_INTERVAL);
        }

        let listener =
            tokio::net::TcpListener::bind(&snapshot.engine.listen).await?;
        info!(listen = %snapshot.engine.listen, "engine listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;

        info!("shutting down, tearing down active calls");
        self.manager.shutdown_all().await;
        Ok(())
    }
}

async fn call_event(
    State(state): State<AppState>,
    Json(event): Json<CallControlEvent>,
) -> StatusCode {
    state.manager.handle_event(event).await;
    StatusCode::ACCEPTED
}

async fn metrics_text(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(
        |result| async move {
            match result {
                Ok(event) => match Event::default().json_data(&event) {
                    Ok(sse) => Some(Ok(sse)),
                    Err(err) => {
                        warn!(%err, "event serialization failed");
                        None
                    }
                },
                // a lagged subscriber skips, it doesn't disconnect
                Err(_) => None,
            }
        },
    );
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ready",
        "active_calls": state.manager.active_calls(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aria_config::Config;

    fn engine() -> Engine {
        let config = ConfigHandle::new(
            Config::parse(
                r#"
                default_provider = "deepgram"

                [providers.deepgram]
                kind = "monolithic"
            "#,
            )
            .unwrap(),
        );
        Engine::new(config)
    }

    fn state(engine: &Engine) -> AppState {
        AppState {
            manager: engine.manager(),
            metrics: engine.metrics(),
            events: engine.events(),
        }
    }

    #[tokio::test]
    async fn call_event_ingress_creates_a_session() {
        let engine = engine();
        let status = call_event(
            State(state(&engine)),
            Json(CallControlEvent::Arrival {
                call_id: "C1".to_string(),
                provider: None,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(engine.manager().active_calls(), 1);
        engine.manager().teardown("C1").await;
    }

    #[tokio::test]
    async fn metrics_route_renders_text() {
        let engine = engine();
        engine.metrics().gauge("aria_active_calls", &[]).set(0);
        let response = metrics_text(State(state(&engine))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("aria_active_calls"));
    }

    #[tokio::test]
    async fn readiness_reports_active_calls() {
        let engine = engine();
        let Json(body) = readyz(State(state(&engine))).await;
        assert_eq!(body["status"], "ready");
        assert_eq!(body["active_calls"], 0);
    }

    #[tokio::test]
    async fn control_event_json_shape() {
        let event: CallControlEvent = serde_json::from_str(
            r#"{"type": "arrival", "call_id": "C1", "provider": "deepgram"}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            CallControlEvent::Arrival { call_id, provider }
                if call_id == "C1" && provider.as_deref() == Some("deepgram")
        ));
        let event: CallControlEvent =
            serde_json::from_str(r#"{"type": "end", "call_id": "C1"}"#).unwrap();
        assert!(matches!(event, CallControlEvent::End { .. }));
    }
}
