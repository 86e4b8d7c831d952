//! The provider seam: a stream of agent audio in exchange for caller
//! audio, behind a trait so monolithic services and assembled pipelines
//! wire up the same way once resolved.

use crate::error::TransportError;
use crate::router::ResolvedPath;
use aria_media::StreamFrame;
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::warn;

/// One live conversation with an AI voice service.
#[async_trait]
pub trait ProviderStream: Send + Sync {
    /// Caller audio toward the service. Must not block on a slow
    /// provider; dropping the frame is acceptable.
    async fn send_audio(&self, frame: StreamFrame) -> Result<(), TransportError>;

    /// Next agent audio frame, `None` once the stream is finished.
    async fn recv_audio(&self) -> Option<StreamFrame>;

    /// Barge-in: abandon any in-flight synthesis.
    async fn cancel(&self);

    fn close(&self);
}

impl std::fmt::Debug for dyn ProviderStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProviderStream")
    }
}

/// Builds a `ProviderStream` for a resolved path.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    async fn connect(
        &self,
        path: &ResolvedPath,
    ) -> Result<Arc<dyn ProviderStream>, TransportError>;
}

/// Bounded, backoff-spaced connect. The backoff grows linearly with the
/// attempt number; exhaustion reports the last failure.
pub async fn connect_with_retry(
    connector: &dyn ProviderConnector,
    path: &ResolvedPath,
    attempts: u32,
    backoff: Duration,
) -> Result<Arc<dyn ProviderStream>, TransportError> {
    let attempts = attempts.max(1);
    let mut last = String::new();
    for attempt in 1..=attempts {
        match connector.connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                warn!(
                    path = path.label(),
                    attempt,
                    %err,
                    "provider connect attempt failed"
                );
                last = err.to_string();
                if attempt < attempts {
                    tokio::time::sleep(backoff * attempt).await;
                }
            }
        }
    }
    Err(TransportError::ConnectExhausted {
        attempts,
        reason: last,
    })
}

/// In-process echo provider: agent audio is the caller audio played
/// back. Used by tests and for running the engine with no external AI
/// service attached.
pub struct LoopbackProvider {
    tx: async_channel::Sender<StreamFrame>,
    rx: async_channel::Receiver<StreamFrame>,
}

impl Default for LoopbackProvider {
    fn default() -> Self {
        let (tx, rx) = async_channel::bounded(256);
        Self { tx, rx }
    }
}

#[async_trait]
impl ProviderStream for LoopbackProvider {
    async fn send_audio(&self, frame: StreamFrame) -> Result<(), TransportError> {
        if self.tx.is_closed() {
            return Err(TransportError::StreamClosed("loopback".to_string()));
        }
        // full queue drops the frame rather than stalling the caller path
        let _ = self.tx.try_send(frame);
        Ok(())
    }

    async fn recv_audio(&self) -> Option<StreamFrame> {
        self.rx.recv().await.ok()
    }

    async fn cancel(&self) {
        while self.rx.try_recv().is_ok() {}
    }

    fn close(&self) {
        self.tx.close();
    }
}

#[derive(Default)]
pub struct LoopbackConnector;

#[async_trait]
impl ProviderConnector for LoopbackConnector {
    async fn connect(
        &self,
        _path: &ResolvedPath,
    ) -> Result<Arc<dyn ProviderStream>, TransportError> {
        Ok(Arc::new(LoopbackProvider::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyConnector {
        failures: AtomicU32,
    }

    #[async_trait]
    impl ProviderConnector for FlakyConnector {
        async fn connect(
            &self,
            path: &ResolvedPath,
        ) -> Result<Arc<dyn ProviderStream>, TransportError> {
            if self.failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(TransportError::ConnectRefused(
                    path.label().to_string(),
                ));
            }
            Ok(Arc::new(LoopbackProvider::default()))
        }
    }

    fn path() -> ResolvedPath {
        ResolvedPath::Monolithic("deepgram".to_string())
    }

    #[tokio::test]
    async fn loopback_echoes_audio() {
        let provider = LoopbackProvider::default();
        provider
            .send_audio(StreamFrame::new(vec![7; 320], 16000))
            .await
            .unwrap();
        let frame = provider.recv_audio().await.unwrap();
        assert_eq!(frame.pcm, vec![7; 320]);
    }

    #[tokio::test]
    async fn cancel_discards_pending_synthesis() {
        let provider = LoopbackProvider::default();
        for _ in 0..4 {
            provider
                .send_audio(StreamFrame::new(vec![7; 320], 16000))
                .await
                .unwrap();
        }
        provider.cancel().await;
        provider.close();
        assert!(provider.recv_audio().await.is_none());
    }

    #[tokio::test]
    async fn retry_succeeds_within_the_budget() {
        let connector = FlakyConnector {
            failures: AtomicU32::new(2),
        };
        let stream = connect_with_retry(
            &connector,
            &path(),
            3,
            Duration::from_millis(1),
        )
        .await;
        assert!(stream.is_ok());
    }

    #[tokio::test]
    async fn retry_exhaustion_reports_the_last_failure() {
        let connector = FlakyConnector {
            failures: AtomicU32::new(10),
        };
        let err = connect_with_retry(
            &connector,
            &path(),
            2,
            Duration::from_millis(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            TransportError::ConnectExhausted { attempts: 2, .. }
        ));
    }
}
