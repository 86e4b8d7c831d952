//! Per-call lifecycle.
//!
//! One session per call_id, one pipeline per session, transitions
//! driven only by control-plane events. The registry is owned by the
//! manager and injected everywhere else; there is no process-wide
//! session table.

use crate::events::{CallEvent, CallEventKind, EventBus};
use crate::provider::{connect_with_retry, ProviderConnector, ProviderStream};
use crate::recording::{ControlPlane, RecordingController, RecordingJob};
use crate::router::{self, ResolvedPath};
use aria_config::{Config, ConfigHandle, FailurePolicy};
use aria_media::{AudioPipeline, FrameSink, PipelineSettings, StreamFrame};
use aria_tap::TapManager;
use aria_telemetry::{Gauge, Metrics};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use strum_macros::{Display, EnumString};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum CallState {
    #[strum(serialize = "arriving")]
    Arriving,
    #[strum(serialize = "connected")]
    Connected,
    #[strum(serialize = "processing")]
    Processing,
    #[strum(serialize = "ended")]
    Ended,
    #[strum(serialize = "error")]
    Error,
}

impl CallState {
    /// `error` absorbs every non-terminal state; `ended` is reachable
    /// from anywhere but never left.
    pub fn can_go(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Arriving, Connected)
                | (Connected, Processing)
                | (Arriving, Ended)
                | (Connected, Ended)
                | (Processing, Ended)
                | (Error, Ended)
                | (Arriving, Error)
                | (Connected, Error)
                | (Processing, Error)
        )
    }
}

/// Events consumed from the telephony control plane.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallControlEvent {
    Arrival {
        call_id: String,
        #[serde(default)]
        provider: Option<String>,
    },
    MediaEstablished {
        call_id: String,
    },
    End {
        call_id: String,
    },
}

struct CallSession {
    state: CallState,
    started_at: DateTime<Utc>,
    resolved: Option<ResolvedPath>,
    ingest: Option<async_channel::Sender<StreamFrame>>,
    egress: Option<async_channel::Receiver<StreamFrame>>,
    pipeline: Option<AudioPipeline>,
    provider: Option<Arc<dyn ProviderStream>>,
    tasks: Vec<JoinHandle<()>>,
    recording: Option<RecordingJob>,
}

impl CallSession {
    fn new() -> Self {
        Self {
            state: CallState::Arriving,
            started_at: Utc::now(),
            resolved: None,
            ingest: None,
            egress: None,
            pipeline: None,
            provider: None,
            tasks: Vec::new(),
            recording: None,
        }
    }

    fn transition(&mut self, call_id: &str, next: CallState) -> bool {
        if self.state.can_go(next) {
            debug!(call = call_id, from = %self.state, to = %next, "state transition");
            self.state = next;
            true
        } else {
            warn!(
                call = call_id,
                from = %self.state,
                to = %next,
                "invalid state transition dropped"
            );
            false
        }
    }
}

struct Inner {
    config: ConfigHandle,
    sessions: Mutex<HashMap<String, CallSession>>,
    taps: Arc<TapManager>,
    metrics: Metrics,
    events: EventBus,
    control: Arc<dyn ControlPlane>,
    connector: Arc<dyn ProviderConnector>,
    recordings: RecordingController,
    active_calls: Gauge,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        config: ConfigHandle,
        taps: Arc<TapManager>,
        metrics: Metrics,
        events: EventBus,
        control: Arc<dyn ControlPlane>,
        connector: Arc<dyn ProviderConnector>,
    ) -> SessionManager {
        let active_calls = metrics.gauge("aria_active_calls", &[]);
        let recordings = RecordingController::new(control.clone());
        SessionManager {
            inner: Arc::new(Inner {
                config,
                sessions: Mutex::new(HashMap::new()),
                taps,
                metrics,
                events,
                control,
                connector,
                recordings,
                active_calls,
            }),
        }
    }

    pub async fn handle_event(&self, event: CallControlEvent) {
        match event {
            CallControlEvent::Arrival { call_id, provider } => {
                self.on_arrival(call_id, provider).await;
            }
            CallControlEvent::MediaEstablished { call_id } => {
                self.on_media_established(&call_id);
            }
            CallControlEvent::End { call_id } => {
                self.teardown(&call_id).await;
            }
        }
    }

    pub fn active_calls(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn state(&self, call_id: &str) -> Option<CallState> {
        self.inner.sessions.lock().get(call_id).map(|s| s.state)
    }

    pub fn resolved_path(&self, call_id: &str) -> Option<ResolvedPath> {
        self.inner
            .sessions
            .lock()
            .get(call_id)
            .and_then(|s| s.resolved.clone())
    }

    /// Caller audio from the telephony transport. Returns false when
    /// the call is unknown or its media isn't up yet.
    pub fn ingest_frame(&self, call_id: &str, frame: StreamFrame) -> bool {
        let sessions = self.inner.sessions.lock();
        match sessions.get(call_id).and_then(|s| s.ingest.as_ref()) {
            Some(tx) => tx.try_send(frame).is_ok(),
            None => false,
        }
    }

    /// Agent audio toward the telephony transport.
    pub fn egress_stream(
        &self,
        call_id: &str,
    ) -> Option<async_channel::Receiver<StreamFrame>> {
        self.inner
            .sessions
            .lock()
            .get(call_id)
            .and_then(|s| s.egress.clone())
    }

    async fn on_arrival(&self, call_id: String, provider: Option<String>) {
        {
            let mut sessions = self.inner.sessions.lock();
            if sessions.contains_key(&call_id) {
                debug!(call = %call_id, "duplicate arrival ignored");
                return;
            }
            sessions.insert(call_id.clone(), CallSession::new());
        }
        self.inner.active_calls.add(1);
        self.inner
            .events
            .emit(CallEvent::new(&call_id, CallEventKind::Arrival));

        let manager = self.clone();
        tokio::spawn(async move {
            manager.setup_call(call_id, provider).await;
        });
    }

    async fn setup_call(&self, call_id: String, override_provider: Option<String>) {
        let snapshot = self.inner.config.snapshot();

        let path =
            match router::resolve(&snapshot, override_provider.as_deref()) {
                Ok(path) => path,
                Err(err) => {
                    warn!(call = %call_id, %err, "provider resolution failed, rejecting call");
                    self.mark_error(&call_id, &err.to_string());
                    if let Err(err) = self.inner.control.hangup(&call_id).await {
                        warn!(call = %call_id, %err, "hangup failed");
                    }
                    self.teardown(&call_id).await;
                    return;
                }
            };

        match &path {
            ResolvedPath::Monolithic(name) => {
                self.inner.events.emit(
                    CallEvent::new(&call_id, CallEventKind::ProviderResolved)
                        .provider(name.clone()),
                );
            }
            ResolvedPath::Pipeline {
                name,
                stt,
                llm,
                tts,
            } => {
                self.inner.events.emit(
                    CallEvent::new(&call_id, CallEventKind::ProviderResolved)
                        .pipeline(name.clone()),
                );
                self.inner.events.emit(
                    CallEvent::new(&call_id, CallEventKind::PipelineAssigned)
                        .pipeline(name.clone())
                        .detail(format!("{} -> {} -> {}", stt, llm, tts)),
                );
            }
        }

        let provider = match connect_with_retry(
            self.inner.connector.as_ref(),
            &path,
            snapshot.engine.connect_attempts,
            Duration::from_millis(snapshot.engine.connect_backoff_ms),
        )
        .await
        {
            Ok(provider) => Some(provider),
            Err(err) => {
                warn!(call = %call_id, %err, "provider connect failed");
                self.mark_error(&call_id, &err.to_string());
                match snapshot.engine.on_provider_failure {
                    FailurePolicy::Terminate => {
                        if let Err(err) =
                            self.inner.control.hangup(&call_id).await
                        {
                            warn!(call = %call_id, %err, "hangup failed");
                        }
                        self.teardown(&call_id).await;
                        return;
                    }
                    // degraded: the call keeps running with no AI audio
                    FailurePolicy::Continue => None,
                }
            }
        };

        self.attach_media(&call_id, path, provider, &snapshot).await;
    }

    async fn attach_media(
        &self,
        call_id: &str,
        path: ResolvedPath,
        provider: Option<Arc<dyn ProviderStream>>,
        snapshot: &Config,
    ) {
        let settings = PipelineSettings {
            frame_ms: snapshot.engine.frame_ms,
            channel_rate: snapshot.engine.channel_rate,
            provider_rate: snapshot.engine.provider_rate,
            vad_threshold: snapshot.engine.vad_threshold,
            jitter_min_depth: snapshot.engine.jitter_min_depth,
            jitter_max_depth: snapshot.engine.jitter_max_depth,
        };
        let sink: Option<Arc<dyn FrameSink>> = if self.inner.taps.enabled() {
            Some(self.inner.taps.clone())
        } else {
            None
        };
        let turn_latency = self.inner.metrics.histogram(
            "aria_turn_response_seconds",
            &[("call", call_id), ("path", path.kind_label())],
        );

        let pipeline = match AudioPipeline::start(
            call_id,
            &settings,
            &self.inner.metrics,
            sink,
            turn_latency,
        )
        .await
        {
            Ok(pipeline) => pipeline,
            Err(err) => {
                warn!(call = %call_id, %err, "pipeline start failed");
                self.mark_error(&call_id, &err.to_string());
                return;
            }
        };

        let mut tasks = Vec::new();
        if let Some(provider) = provider.clone() {
            let last_sent: Arc<Mutex<Option<Instant>>> =
                Arc::new(Mutex::new(None));
            let response_latency = match &path {
                ResolvedPath::Pipeline { name, .. } => {
                    Some(self.inner.metrics.histogram(
                        "aria_stt_tts_seconds",
                        &[("call", call_id), ("pipeline", name.as_str())],
                    ))
                }
                ResolvedPath::Monolithic(_) => None,
            };

            {
                let provider = provider.clone();
                let out = pipeline.provider_audio_out();
                let last_sent = last_sent.clone();
                let call = call_id.to_string();
                tasks.push(tokio::spawn(async move {
                    while let Ok(frame) = out.recv().await {
                        if !frame.is_silent() {
                            *last_sent.lock() = Some(Instant::now());
                        }
                        if let Err(err) = provider.send_audio(frame).await {
                            debug!(call = %call, %err, "provider dispatch ended");
                            break;
                        }
                    }
                }));
            }

            {
                let provider = provider.clone();
                let into = pipeline.provider_audio_in();
                tasks.push(tokio::spawn(async move {
                    while let Some(frame) = provider.recv_audio().await {
                        if let Some(hist) = &response_latency {
                            if let Some(at) = last_sent.lock().take() {
                                hist.observe_duration(at.elapsed());
                            }
                        }
                        if into.send(frame).await.is_err() {
                            break;
                        }
                    }
                }));
            }

            {
                let provider = provider.clone();
                let barge = pipeline.barge_events();
                tasks.push(tokio::spawn(async move {
                    while barge.recv().await.is_ok() {
                        provider.cancel().await;
                    }
                }));
            }
        }

        let ingest = pipeline.ingest();
        let egress = pipeline.egress();
        let mut pipeline = Some(pipeline);
        let mut tasks = Some(tasks);

        let installed = {
            let mut sessions = self.inner.sessions.lock();
            match sessions.get_mut(call_id) {
                Some(session) => {
                    session.ingest = Some(ingest);
                    session.egress = Some(egress);
                    session.resolved = Some(path.clone());
                    session.provider = provider.clone();
                    session.pipeline = pipeline.take();
                    session.tasks = tasks.take().unwrap_or_default();
                    if provider.is_some() {
                        session.transition(call_id, CallState::Connected);
                    }
                    true
                }
                None => false,
            }
        };

        if !installed {
            // the call ended while setup was still in flight
            debug!(call = call_id, "call gone before media attach, cleaning up");
            if let Some(tasks) = tasks.take() {
                for task in tasks {
                    task.abort();
                }
            }
            if let Some(provider) = provider {
                provider.close();
            }
            if let Some(pipeline) = pipeline.take() {
                pipeline.shutdown().await;
            }
            return;
        }

        if let Some(job) = self
            .inner
            .recordings
            .start(call_id, &snapshot.recording)
            .await
        {
            let parked = {
                let mut sessions = self.inner.sessions.lock();
                match sessions.get_mut(call_id) {
                    Some(session) => {
                        session.recording = Some(job);
                        None
                    }
                    None => Some(job),
                }
            };
            if let Some(mut job) = parked {
                self.inner.recordings.stop(&mut job).await;
            }
        }
    }

    fn mark_error(&self, call_id: &str, detail: &str) {
        let known = {
            let mut sessions = self.inner.sessions.lock();
            match sessions.get_mut(call_id) {
                Some(session) => session.transition(call_id, CallState::Error),
                None => false,
            }
        };
        if known {
            self.inner.events.emit(
                CallEvent::new(call_id, CallEventKind::Error).detail(detail),
            );
        }
    }

    fn on_media_established(&self, call_id: &str) {
        let ok = {
            let mut sessions = self.inner.sessions.lock();
            match sessions.get_mut(call_id) {
                Some(session) => {
                    session.transition(call_id, CallState::Processing)
                }
                None => {
                    warn!(call = call_id, "media event for unknown call dropped");
                    return;
                }
            }
        };
        if ok {
            self.inner
                .events
                .emit(CallEvent::new(call_id, CallEventKind::MediaEstablished));
        }
    }

    /// Ordered, unconditional, idempotent: cancel the call's provider
    /// work, drain and stop its pipeline, flush and close its taps,
    /// stop recording, release the record. A second invocation finds no
    /// session and does nothing.
    pub async fn teardown(&self, call_id: &str) {
        let session = self.inner.sessions.lock().remove(call_id);
        let Some(mut session) = session else {
            debug!(call = call_id, "teardown for unknown call ignored");
            return;
        };

        for task in session.tasks.drain(..) {
            task.abort();
        }
        if let Some(provider) = session.provider.take() {
            provider.close();
        }

        if let Some(pipeline) = session.pipeline.take() {
            pipeline.shutdown().await;
        }

        self.inner.taps.finish_call(call_id).await;

        if let Some(mut job) = session.recording.take() {
            self.inner.recordings.stop(&mut job).await;
        }

        self.inner.active_calls.sub(1);
        self.inner.metrics.drop_series("call", call_id);

        let seconds = (Utc::now() - session.started_at).num_seconds();
        self.inner.events.emit(
            CallEvent::new(call_id, CallEventKind::Ended)
                .detail(format!("duration={}s", seconds)),
        );
    }

    pub async fn shutdown_all(&self) {
        let call_ids: Vec<String> =
            self.inner.sessions.lock().keys().cloned().collect();
        for call_id in call_ids {
            self.teardown(&call_id).await;
        }
    }
}
