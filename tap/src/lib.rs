//! Diagnostic audio capture ("taps").
//!
//! One raw PCM16-LE file per call and direction, written by a
//! background task per tap so the frame path never touches the disk.
//! Closing a tap and reclaiming its storage are separate operations:
//! retention decides whether `reclaim_call` runs, never whether handles
//! get closed.

use aria_media::{FrameSink, StreamDirection, StreamFrame};
use async_channel::Sender;
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    path::PathBuf,
    time::Duration,
};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, sync::oneshot};
use tracing::{debug, info, warn};

// flush to disk in chunks, not per frame
const WRITE_CHUNK: usize = 8192;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum TapError {
    #[error("tap capture is at capacity ({0} open handles)")]
    AtCapacity(usize),

    #[error("tap io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct TapSettings {
    pub enabled: bool,
    /// Used exactly as configured. There is no fallback directory.
    pub output_directory: PathBuf,
    pub retain: bool,
    pub max_age: Option<Duration>,
    pub max_open_taps: usize,
}

enum WriterMessage {
    Pcm(Vec<u8>),
    Close(oneshot::Sender<()>),
}

struct TapHandle {
    sender: Sender<WriterMessage>,
}

/// Guarded table of open taps, keyed by (call_id, direction).
pub struct TapManager {
    settings: TapSettings,
    table: Mutex<HashMap<(String, StreamDirection), TapHandle>>,
}

impl TapManager {
    pub fn new(settings: TapSettings) -> Self {
        Self {
            settings,
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn open_taps(&self) -> usize {
        self.table.lock().len()
    }

    fn call_directory(&self, call_id: &str) -> PathBuf {
        self.settings.output_directory.join(call_id)
    }

    /// Queue one frame of PCM for the given tap, opening it on first
    /// use. Errors never propagate to the caller: a full queue or a
    /// failed open costs captured audio, not call audio.
    pub fn write(&self, call_id: &str, direction: StreamDirection, pcm: &[i16]) {
        if !self.settings.enabled || pcm.is_empty() {
            return;
        }

        let mut bytes = vec![0u8; pcm.len() * 2];
        LittleEndian::write_i16_into(pcm, &mut bytes);

        let sender = {
            let mut table = self.table.lock();
            let key = (call_id.to_string(), direction);
            if !table.contains_key(&key) {
                if table.len() >= self.settings.max_open_taps {
                    warn!(
                        call = call_id,
                        %direction,
                        "{}",
                        TapError::AtCapacity(self.settings.max_open_taps)
                    );
                    return;
                }
                let path =
                    self.call_directory(call_id).join(direction.to_string());
                let (sender, receiver) = async_channel::bounded(256);
                tokio::spawn(run_writer(path, receiver));
                table.insert(key.clone(), TapHandle { sender });
            }
            table[&key].sender.clone()
        };

        if sender.try_send(WriterMessage::Pcm(bytes)).is_err() {
            debug!(call = call_id, %direction, "tap writer backlogged, frame dropped");
        }
    }

    /// Flush and close every tap for the call. Unconditional: runs the
    /// same whether or not retention will later reclaim the files.
    pub async fn close_call(&self, call_id: &str) {
        let handles: Vec<TapHandle> = {
            let mut table = self.table.lock();
            let keys: Vec<_> = table
                .keys()
                .filter(|(call, _)| call == call_id)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| table.remove(&key))
                .collect()
        };

        for handle in handles {
            let (ack_tx, ack_rx) = oneshot::channel();
            if handle.sender.send(WriterMessage::Close(ack_tx)).await.is_ok() {
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, ack_rx).await;
            }
        }
    }

    /// Delete the call's tap directory. Separate from `close_call` so
    /// retention can keep files while handles still get closed.
    pub async fn reclaim_call(&self, call_id: &str) {
        let dir = self.call_directory(call_id);
        if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(call = call_id, %err, "tap reclaim failed");
            }
        }
    }

    /// Call-end path: close handles, then reclaim only when retention
    /// is off.
    pub async fn finish_call(&self, call_id: &str) {
        self.close_call(call_id).await;
        if !self.settings.retain {
            self.reclaim_call(call_id).await;
        }
    }

    /// Delete retained tap directories older than the configured age.
    /// No-op unless `max_age` is set.
    pub async fn sweep_expired(&self) {
        let Some(max_age) = self.settings.max_age else {
            return;
        };
        let Ok(mut entries) =
            tokio::fs::read_dir(&self.settings.output_directory).await
        else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_dir() {
                continue;
            }
            let expired = meta
                .modified()
                .ok()
                .and_then(|at| at.elapsed().ok())
                .map(|age| age > max_age)
                .unwrap_or(false);
            if expired {
                info!(path = %entry.path().display(), "sweeping expired tap directory");
                if let Err(err) = tokio::fs::remove_dir_all(entry.path()).await {
                    warn!(%err, "tap sweep failed");
                }
            }
        }
    }

    /// Periodic sweep driver for retained taps.
    pub fn spawn_sweeper(
        self: &std::sync::Arc<Self>,
        every: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.sweep_expired().await;
            }
        })
    }
}

impl FrameSink for TapManager {
    fn accept(
        &self,
        call_id: &str,
        direction: StreamDirection,
        frame: &StreamFrame,
    ) {
        self.write(call_id, direction, &frame.pcm);
    }
}

async fn run_writer(
    path: PathBuf,
    receiver: async_channel::Receiver<WriterMessage>,
) {
    let file = async {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await
    }
    .await;

    let mut file = match file {
        Ok(file) => file,
        Err(err) => {
            warn!(path = %path.display(), %err, "can't open tap file");
            // keep draining so close acks still arrive
            while let Ok(msg) = receiver.recv().await {
                if let WriterMessage::Close(ack) = msg {
                    let _ = ack.send(());
                    return;
                }
            }
            return;
        }
    };

    let mut buffer: Vec<u8> = Vec::with_capacity(WRITE_CHUNK * 2);
    loop {
        match receiver.recv().await {
            Ok(WriterMessage::Pcm(bytes)) => {
                buffer.extend_from_slice(&bytes);
                if buffer.len() >= WRITE_CHUNK {
                    if let Err(err) = file.write_all(&buffer).await {
                        warn!(path = %path.display(), %err, "tap write failed");
                    }
                    buffer.clear();
                }
            }
            Ok(WriterMessage::Close(ack)) => {
                if !buffer.is_empty() {
                    if let Err(err) = file.write_all(&buffer).await {
                        warn!(path = %path.display(), %err, "tap write failed");
                    }
                }
                let _ = file.flush().await;
                let _ = ack.send(());
                return;
            }
            Err(_) => {
                if !buffer.is_empty() {
                    let _ = file.write_all(&buffer).await;
                }
                let _ = file.flush().await;
                return;
            }
        }
    }
}
