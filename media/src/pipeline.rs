//! Per-call streaming audio pipeline.
//!
//! Caller path: ingest -> resample to provider rate -> VAD -> jitter
//! buffer -> dispatch. Agent path: provider -> playback jitter buffer ->
//! resample to channel rate -> egress. Both run on a frame-period
//! ticker; every hop is a `try_send`/`try_recv` so neither direction
//! can block the other, a provider, or the disk.

use crate::frame::{StreamDirection, StreamFrame};
use crate::jitter::{JitterBuffer, JitterReadKind};
use crate::resampler::Resampler;
use crate::vad::Vad;
use anyhow::Result;
use aria_telemetry::{Counter, Gauge, Histogram, Metrics};
use async_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

/// Observer for processed frames, fed off the time-critical path.
/// Implementations must not block.
pub trait FrameSink: Send + Sync {
    fn accept(
        &self,
        call_id: &str,
        direction: StreamDirection,
        frame: &StreamFrame,
    );
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub frame_ms: usize,
    pub channel_rate: u32,
    pub provider_rate: u32,
    pub vad_threshold: f64,
    pub jitter_min_depth: usize,
    pub jitter_max_depth: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            frame_ms: 20,
            channel_rate: 8000,
            provider_rate: 16000,
            vad_threshold: 0.6,
            jitter_min_depth: 2,
            jitter_max_depth: 10,
        }
    }
}

/// Shared playback state. `playing` tracks whether agent audio is
/// currently going out; `gated` is the barge-in interrupt.
#[derive(Default)]
pub struct PlaybackGate {
    playing: AtomicBool,
    gated: AtomicBool,
}

impl PlaybackGate {
    pub fn engage(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.gated.store(false, Ordering::SeqCst);
    }

    pub fn is_gated(&self) -> bool {
        self.gated.load(Ordering::SeqCst)
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::SeqCst);
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

struct PathMetrics {
    frames: Counter,
    underflow: Counter,
    overflow: Counter,
    late: Counter,
    jitter_depth: Gauge,
    rms: Gauge,
    dc_offset: Gauge,
    clip_ratio_millis: Gauge,
}

impl PathMetrics {
    fn new(metrics: &Metrics, call_id: &str, direction: StreamDirection) -> Self {
        let direction = direction.to_string();
        let labels = [("call", call_id), ("direction", direction.as_str())];
        Self {
            frames: metrics.counter("aria_frames_total", &labels),
            underflow: metrics.counter("aria_jitter_underflow_total", &labels),
            overflow: metrics.counter("aria_jitter_overflow_total", &labels),
            late: metrics.counter("aria_frames_late_total", &labels),
            jitter_depth: metrics.gauge("aria_jitter_depth", &labels),
            rms: metrics.gauge("aria_audio_rms", &labels),
            dc_offset: metrics.gauge("aria_audio_dc_offset", &labels),
            clip_ratio_millis: metrics
                .gauge("aria_audio_clip_ratio_millis", &labels),
        }
    }

    fn observe(&self, frame: &StreamFrame) {
        self.rms.set(frame.rms() as i64);
        self.dc_offset.set(frame.dc_offset() as i64);
        self.clip_ratio_millis
            .set((frame.clip_ratio() * 1000.0) as i64);
    }
}

struct CallerPath {
    call_id: String,
    ingest_rx: Receiver<StreamFrame>,
    provider_tx: Sender<StreamFrame>,
    resampler: Option<Resampler>,
    vad: Vad,
    jitter: JitterBuffer,
    gate: Arc<PlaybackGate>,
    barge_tx: Sender<()>,
    sink: Option<Arc<dyn FrameSink>>,
    metrics: PathMetrics,
    barge_ins: Counter,
    turn_clock: Arc<Mutex<Option<Instant>>>,
    provider_rate: u32,
    frame_len: usize,
    budget: Duration,
}

impl CallerPath {
    /// One frame period of work. Returns false once the ingest side is
    /// closed and the jitter buffer has been drained.
    fn tick(&mut self) -> bool {
        let started = Instant::now();

        loop {
            match self.ingest_rx.try_recv() {
                Ok(frame) => {
                    let pcm = match self.resampler.as_mut() {
                        Some(resampler) => resampler.convert(&frame.pcm),
                        None => frame.pcm,
                    };
                    let frame = StreamFrame::new(pcm, self.provider_rate);
                    let decision = self.vad.detect(&frame);

                    if decision.speech
                        && self.gate.is_playing()
                        && !self.gate.is_gated()
                    {
                        self.gate.engage();
                        self.barge_ins.inc();
                        let _ = self.barge_tx.try_send(());
                    }
                    if decision.utterance_end {
                        *self.turn_clock.lock() = Some(Instant::now());
                        self.gate.release();
                    }

                    self.metrics.observe(&frame);
                    if let Some(sink) = &self.sink {
                        sink.accept(
                            &self.call_id,
                            StreamDirection::Inbound,
                            &frame,
                        );
                    }
                    if !self.jitter.push(frame.pcm) {
                        self.metrics.overflow.inc();
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => {
                    self.flush();
                    return false;
                }
            }
        }

        let read = self.jitter.pop();
        if read.kind == JitterReadKind::Underflow {
            self.metrics.underflow.inc();
        }
        self.metrics.jitter_depth.set(self.jitter.len() as i64);

        let pcm = if started.elapsed() > self.budget {
            self.metrics.late.inc();
            vec![0; self.frame_len]
        } else {
            read.pcm
        };

        self.metrics.frames.inc();
        let _ = self
            .provider_tx
            .try_send(StreamFrame::new(pcm, self.provider_rate));
        true
    }

    fn flush(&mut self) {
        let remaining = self.jitter.drain();
        if !remaining.is_empty() {
            debug!(
                call = %self.call_id,
                frames = remaining.len(),
                "draining jitter buffer at teardown"
            );
        }
        for pcm in remaining {
            let _ = self
                .provider_tx
                .try_send(StreamFrame::new(pcm, self.provider_rate));
        }
        self.provider_tx.close();
    }
}

struct PlaybackPath {
    call_id: String,
    provider_rx: Receiver<StreamFrame>,
    egress_tx: Sender<StreamFrame>,
    resampler: Option<Resampler>,
    jitter: JitterBuffer,
    gate: Arc<PlaybackGate>,
    sink: Option<Arc<dyn FrameSink>>,
    metrics: PathMetrics,
    turn_clock: Arc<Mutex<Option<Instant>>>,
    turn_latency: Histogram,
    channel_rate: u32,
    frame_len: usize,
    budget: Duration,
}

impl PlaybackPath {
    fn tick(&mut self) -> bool {
        let started = Instant::now();
        let mut closed = false;

        loop {
            match self.provider_rx.try_recv() {
                Ok(frame) => {
                    // while gated the interrupted agent audio is discarded
                    if self.gate.is_gated() {
                        continue;
                    }
                    if !self.jitter.push(frame.pcm) {
                        self.metrics.overflow.inc();
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => {
                    closed = true;
                    break;
                }
            }
        }

        if self.gate.is_gated() {
            self.jitter.clear();
        }

        let read = self.jitter.pop();
        if read.kind == JitterReadKind::Underflow {
            self.metrics.underflow.inc();
        }
        self.metrics.jitter_depth.set(self.jitter.len() as i64);
        self.gate.set_playing(read.kind == JitterReadKind::Frame);

        if read.kind == JitterReadKind::Frame {
            if let Some(turn_started) = self.turn_clock.lock().take() {
                self.turn_latency.observe_duration(turn_started.elapsed());
            }
        }

        let pcm = match self.resampler.as_mut() {
            Some(resampler) => resampler.convert(&read.pcm),
            None => read.pcm,
        };
        let pcm = if started.elapsed() > self.budget {
            self.metrics.late.inc();
            vec![0; self.frame_len]
        } else {
            pcm
        };

        let frame = StreamFrame::new(pcm, self.channel_rate);
        self.metrics.observe(&frame);
        if let Some(sink) = &self.sink {
            sink.accept(&self.call_id, StreamDirection::Outbound, &frame);
        }
        self.metrics.frames.inc();
        let _ = self.egress_tx.try_send(frame);

        if closed && self.jitter.is_empty() {
            self.egress_tx.close();
            return false;
        }
        true
    }
}

/// The per-call pipeline: two ticker-driven tasks plus the channel ends
/// the session wires to the telephony transport and the provider.
pub struct AudioPipeline {
    ingest_tx: Sender<StreamFrame>,
    provider_in_tx: Sender<StreamFrame>,
    provider_out_rx: Receiver<StreamFrame>,
    egress_rx: Receiver<StreamFrame>,
    barge_rx: Receiver<()>,
    gate: Arc<PlaybackGate>,
    tasks: Vec<JoinHandle<()>>,
}

impl AudioPipeline {
    pub async fn start(
        call_id: &str,
        settings: &PipelineSettings,
        metrics: &Metrics,
        sink: Option<Arc<dyn FrameSink>>,
        turn_latency: Histogram,
    ) -> Result<AudioPipeline> {
        let (ingest_tx, ingest_rx) = async_channel::bounded(64);
        let (provider_out_tx, provider_out_rx) = async_channel::bounded(64);
        let (provider_in_tx, provider_in_rx) = async_channel::bounded(256);
        let (egress_tx, egress_rx) = async_channel::bounded(64);
        let (barge_tx, barge_rx) = async_channel::bounded(4);

        let gate = Arc::new(PlaybackGate::default());
        let turn_clock = Arc::new(Mutex::new(None));
        let budget = Duration::from_millis(settings.frame_ms as u64);

        let up = if settings.channel_rate != settings.provider_rate {
            Some(
                Resampler::new(settings.channel_rate, settings.provider_rate)
                    .await?,
            )
        } else {
            None
        };
        let down = if settings.channel_rate != settings.provider_rate {
            Some(
                Resampler::new(settings.provider_rate, settings.channel_rate)
                    .await?,
            )
        } else {
            None
        };

        let mut caller = CallerPath {
            call_id: call_id.to_string(),
            ingest_rx,
            provider_tx: provider_out_tx,
            resampler: up,
            vad: Vad::new(settings.vad_threshold),
            jitter: JitterBuffer::new(
                settings.jitter_min_depth,
                settings.jitter_max_depth,
                StreamFrame::samples_per_frame(
                    settings.provider_rate,
                    settings.frame_ms,
                ),
            ),
            gate: gate.clone(),
            barge_tx,
            sink: sink.clone(),
            metrics: PathMetrics::new(metrics, call_id, StreamDirection::Inbound),
            barge_ins: metrics
                .counter("aria_barge_in_total", &[("call", call_id)]),
            turn_clock: turn_clock.clone(),
            provider_rate: settings.provider_rate,
            frame_len: StreamFrame::samples_per_frame(
                settings.provider_rate,
                settings.frame_ms,
            ),
            budget,
        };

        let mut playback = PlaybackPath {
            call_id: call_id.to_string(),
            provider_rx: provider_in_rx,
            egress_tx,
            resampler: down,
            jitter: JitterBuffer::new(
                settings.jitter_min_depth,
                settings.jitter_max_depth,
                StreamFrame::samples_per_frame(
                    settings.provider_rate,
                    settings.frame_ms,
                ),
            ),
            gate: gate.clone(),
            sink,
            metrics: PathMetrics::new(
                metrics,
                call_id,
                StreamDirection::Outbound,
            ),
            turn_clock,
            turn_latency,
            channel_rate: settings.channel_rate,
            frame_len: StreamFrame::samples_per_frame(
                settings.channel_rate,
                settings.frame_ms,
            ),
            budget,
        };

        let period = Duration::from_millis(settings.frame_ms as u64);
        let tasks = vec![
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    if !caller.tick() {
                        break;
                    }
                }
            }),
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    if !playback.tick() {
                        break;
                    }
                }
            }),
        ];

        Ok(AudioPipeline {
            ingest_tx,
            provider_in_tx,
            provider_out_rx,
            egress_rx,
            barge_rx,
            gate,
            tasks,
        })
    }

    /// Caller audio from the telephony channel goes in here.
    pub fn ingest(&self) -> Sender<StreamFrame> {
        self.ingest_tx.clone()
    }

    /// Agent audio from the provider goes in here.
    pub fn provider_audio_in(&self) -> Sender<StreamFrame> {
        self.provider_in_tx.clone()
    }

    /// Caller audio, resampled and jitter-smoothed, for the provider.
    pub fn provider_audio_out(&self) -> Receiver<StreamFrame> {
        self.provider_out_rx.clone()
    }

    /// Agent audio at channel rate, for the telephony transport.
    pub fn egress(&self) -> Receiver<StreamFrame> {
        self.egress_rx.clone()
    }

    /// Fires when caller speech interrupts active playback.
    pub fn barge_events(&self) -> Receiver<()> {
        self.barge_rx.clone()
    }

    pub fn gate(&self) -> Arc<PlaybackGate> {
        self.gate.clone()
    }

    /// Close both directions and wait for the paths to drain and exit.
    pub async fn shutdown(mut self) {
        self.ingest_tx.close();
        self.provider_in_tx.close();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud_pcm(len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| if i % 2 == 0 { 20_000 } else { -20_000 })
            .collect()
    }

    fn caller_path(
        metrics: &Metrics,
    ) -> (CallerPath, Sender<StreamFrame>, Receiver<StreamFrame>, Receiver<()>)
    {
        let (ingest_tx, ingest_rx) = async_channel::bounded(64);
        let (provider_tx, provider_rx) = async_channel::bounded(64);
        let (barge_tx, barge_rx) = async_channel::bounded(4);
        let path = CallerPath {
            call_id: "C1".to_string(),
            ingest_rx,
            provider_tx,
            resampler: None,
            vad: Vad::new(0.6),
            jitter: JitterBuffer::new(1, 10, 320),
            gate: Arc::new(PlaybackGate::default()),
            barge_tx,
            sink: None,
            metrics: PathMetrics::new(metrics, "C1", StreamDirection::Inbound),
            barge_ins: metrics.counter("aria_barge_in_total", &[("call", "C1")]),
            turn_clock: Arc::new(Mutex::new(None)),
            provider_rate: 16000,
            frame_len: 320,
            budget: Duration::from_millis(20),
        };
        (path, ingest_tx, provider_rx, barge_rx)
    }

    fn playback_path(
        metrics: &Metrics,
    ) -> (PlaybackPath, Sender<StreamFrame>, Receiver<StreamFrame>) {
        let (provider_tx, provider_rx) = async_channel::bounded(64);
        let (egress_tx, egress_rx) = async_channel::bounded(64);
        let path = PlaybackPath {
            call_id: "C1".to_string(),
            provider_rx,
            egress_tx,
            resampler: None,
            jitter: JitterBuffer::new(1, 10, 320),
            gate: Arc::new(PlaybackGate::default()),
            sink: None,
            metrics: PathMetrics::new(metrics, "C1", StreamDirection::Outbound),
            turn_clock: Arc::new(Mutex::new(None)),
            turn_latency: metrics.histogram("aria_turn_response_seconds", &[]),
            channel_rate: 16000,
            frame_len: 320,
            budget: Duration::from_millis(20),
        };
        (path, provider_tx, egress_rx)
    }

    #[test]
    fn caller_frames_reach_provider() {
        let metrics = Metrics::new();
        let (mut path, ingest_tx, provider_rx, _barge) = caller_path(&metrics);
        ingest_tx
            .try_send(StreamFrame::new(loud_pcm(320), 16000))
            .unwrap();
        assert!(path.tick());
        let frame = provider_rx.try_recv().unwrap();
        assert_eq!(frame.pcm, loud_pcm(320));
        assert_eq!(path.metrics.frames.get(), 1);
    }

    #[test]
    fn barge_in_gates_within_one_tick() {
        let metrics = Metrics::new();
        let (mut path, ingest_tx, _provider_rx, barge_rx) = caller_path(&metrics);
        path.gate.set_playing(true);

        ingest_tx
            .try_send(StreamFrame::new(loud_pcm(320), 16000))
            .unwrap();
        path.tick();

        assert!(path.gate.is_gated());
        assert_eq!(path.barge_ins.get(), 1);
        assert!(barge_rx.try_recv().is_ok());

        // the rest of the same utterance doesn't count again
        ingest_tx
            .try_send(StreamFrame::new(loud_pcm(320), 16000))
            .unwrap();
        path.tick();
        assert_eq!(path.barge_ins.get(), 1);
    }

    #[test]
    fn over_budget_tick_substitutes_silence() {
        let metrics = Metrics::new();
        let (mut path, ingest_tx, provider_rx, _barge) = caller_path(&metrics);
        path.budget = Duration::from_millis(0);
        ingest_tx
            .try_send(StreamFrame::new(loud_pcm(320), 16000))
            .unwrap();
        path.tick();
        let frame = provider_rx.try_recv().unwrap();
        assert!(frame.is_silent());
        assert_eq!(path.metrics.late.get(), 1);
    }

    #[test]
    fn closed_ingest_drains_jitter_then_stops() {
        let metrics = Metrics::new();
        let (mut path, ingest_tx, provider_rx, _barge) = caller_path(&metrics);
        for _ in 0..3 {
            ingest_tx
                .try_send(StreamFrame::new(loud_pcm(320), 16000))
                .unwrap();
        }
        assert!(path.tick());
        ingest_tx.close();
        assert!(!path.tick());
        // one dispatched frame plus the drained remainder
        let mut delivered = 0;
        while provider_rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 3);
        assert!(provider_rx.is_closed());
    }

    #[test]
    fn playback_emits_buffered_agent_audio() {
        let metrics = Metrics::new();
        let (mut path, provider_tx, egress_rx) = playback_path(&metrics);
        provider_tx
            .try_send(StreamFrame::new(loud_pcm(320), 16000))
            .unwrap();
        path.tick();
        let frame = egress_rx.try_recv().unwrap();
        assert_eq!(frame.pcm, loud_pcm(320));
        assert!(path.gate.is_playing());
    }

    #[test]
    fn gated_playback_substitutes_silence_and_clears_buffer() {
        let metrics = Metrics::new();
        let (mut path, provider_tx, egress_rx) = playback_path(&metrics);
        for _ in 0..3 {
            provider_tx
                .try_send(StreamFrame::new(loud_pcm(320), 16000))
                .unwrap();
        }
        path.tick();
        assert!(!egress_rx.try_recv().unwrap().is_silent());

        path.gate.engage();
        path.tick();
        assert!(egress_rx.try_recv().unwrap().is_silent());
        assert!(path.jitter.is_empty());
        assert!(!path.gate.is_playing());
    }

    #[test]
    fn playback_underflow_counts_once_per_gap() {
        let metrics = Metrics::new();
        let (mut path, provider_tx, egress_rx) = playback_path(&metrics);
        provider_tx
            .try_send(StreamFrame::new(loud_pcm(320), 16000))
            .unwrap();
        path.tick();
        for _ in 0..5 {
            path.tick();
        }
        assert_eq!(path.metrics.underflow.get(), 1);
        // silence kept flowing the whole gap
        let mut emitted = 0;
        while egress_rx.try_recv().is_ok() {
            emitted += 1;
        }
        assert_eq!(emitted, 6);
    }

    #[test]
    fn turn_latency_observed_on_first_agent_frame() {
        let metrics = Metrics::new();
        let (mut path, provider_tx, _egress_rx) = playback_path(&metrics);
        *path.turn_clock.lock() = Some(Instant::now());
        provider_tx
            .try_send(StreamFrame::new(loud_pcm(320), 16000))
            .unwrap();
        path.tick();
        assert_eq!(path.turn_latency.count(), 1);
        // consumed: later frames don't observe again
        provider_tx
            .try_send(StreamFrame::new(loud_pcm(320), 16000))
            .unwrap();
        path.tick();
        assert_eq!(path.turn_latency.count(), 1);
    }

    #[tokio::test]
    async fn pipeline_shutdown_closes_both_directions() {
        let metrics = Metrics::new();
        let pipeline = AudioPipeline::start(
            "C1",
            &PipelineSettings::default(),
            &metrics,
            None,
            metrics.histogram("aria_turn_response_seconds", &[]),
        )
        .await
        .unwrap();
        let provider_out = pipeline.provider_audio_out();
        let egress = pipeline.egress();
        pipeline.shutdown().await;
        assert!(provider_out.is_closed());
        assert!(egress.is_closed());
    }
}
