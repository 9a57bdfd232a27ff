//! Call recording.
//!
//! A [`RecordingSession`] lives inside the peer session that started it.
//! Encoded chunks flow from the [`ChunkRecorder`] over a channel; stopping
//! drains them into a single [`RecordingSegment`], which is handed to the
//! [`SegmentUploader`] exactly once. Upload problems never reach call state.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{info, warn};
use pccore::backoff::Backoff;
use pccore::types::events::{Event, RecordingError};
use pccore::types::{CoreEventBus, RecordingSegment};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::media::AudioStream;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecorderError {
    #[error("recorder unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),
}

/// Encodes audio tracks into chunks.
#[async_trait]
pub trait ChunkRecorder: Send + Sync {
    async fn start(
        &self,
        call_id: &str,
        tracks: Vec<Arc<dyn AudioStream>>,
        chunks: mpsc::UnboundedSender<Bytes>,
    ) -> Result<Box<dyn ActiveRecording>, RecorderError>;
}

#[async_trait]
pub trait ActiveRecording: Send + Sync {
    fn mime_type(&self) -> &str;

    /// Flushes and stops; every chunk is on the channel once this returns.
    async fn stop(&self) -> Result<(), RecorderError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    /// Worth retrying.
    #[error("transient upload failure: {0}")]
    Transient(String),

    #[error("upload rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait SegmentUploader: Send + Sync {
    async fn upload(&self, segment: &RecordingSegment) -> Result<UploadReceipt, UploadError>;
}

/// Retries transient failures with exponential backoff up to `max_attempts`.
pub struct RetryingUploader<U> {
    inner: U,
    max_attempts: u32,
    backoff: Backoff,
}

impl<U> RetryingUploader<U> {
    pub fn new(inner: U, max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

#[async_trait]
impl<U: SegmentUploader> SegmentUploader for RetryingUploader<U> {
    async fn upload(&self, segment: &RecordingSegment) -> Result<UploadReceipt, UploadError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.upload(segment).await {
                Ok(receipt) => return Ok(receipt),
                Err(UploadError::Transient(e)) if attempt < self.max_attempts => {
                    let delay = self.backoff.delay(attempt - 1);
                    warn!(
                        target: "Call/Recording",
                        "Upload of {} failed (attempt {attempt}/{}): {e}; retrying in {delay:?}",
                        segment.call_id, self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// An in-progress recording owned by one session.
pub struct RecordingSession {
    call_id: String,
    started_at: DateTime<Utc>,
    recorder: Box<dyn ActiveRecording>,
    chunks: mpsc::UnboundedReceiver<Bytes>,
}

impl RecordingSession {
    pub async fn start(
        recorder: &dyn ChunkRecorder,
        call_id: &str,
        tracks: Vec<Arc<dyn AudioStream>>,
    ) -> Result<Self, RecorderError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let active = recorder.start(call_id, tracks, tx).await?;
        info!(target: "Call/Recording", "Recording started for {call_id}");
        Ok(Self {
            call_id: call_id.to_string(),
            started_at: Utc::now(),
            recorder: active,
            chunks: rx,
        })
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Stops the recorder and concatenates everything it produced.
    pub async fn finish(mut self) -> RecordingSegment {
        if let Err(e) = self.recorder.stop().await {
            warn!(target: "Call/Recording", "Recorder stop failed for {}: {e}", self.call_id);
        }
        self.chunks.close();
        let mut chunks = Vec::new();
        while let Some(chunk) = self.chunks.recv().await {
            chunks.push(chunk);
        }
        let segment = RecordingSegment::from_chunks(
            self.call_id,
            self.recorder.mime_type(),
            &chunks,
            self.started_at,
            Utc::now(),
        );
        info!(
            target: "Call/Recording",
            "Recording finished for {}: {} bytes, {:.1}s",
            segment.call_id, segment.size_bytes, segment.duration_seconds
        );
        segment
    }
}

/// Hands `segment` to the uploader in the background. Failure is reported
/// as a [`RecordingError`] event only.
pub fn spawn_upload(
    uploader: Arc<dyn SegmentUploader>,
    segment: RecordingSegment,
    events: CoreEventBus,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match uploader.upload(&segment).await {
            Ok(receipt) => {
                info!(
                    target: "Call/Recording",
                    "Uploaded recording {} as {}", segment.call_id, receipt.id
                );
            }
            Err(e) => {
                warn!(target: "Call/Recording", "Giving up on recording {}: {e}", segment.call_id);
                events.dispatch(&Event::RecordingError(RecordingError {
                    call_id: segment.call_id.clone(),
                    message: e.to_string(),
                }));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Flaky {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl SegmentUploader for Flaky {
        async fn upload(&self, _segment: &RecordingSegment) -> Result<UploadReceipt, UploadError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_on {
                Ok(UploadReceipt { id: format!("r{n}") })
            } else {
                Err(UploadError::Transient("503".into()))
            }
        }
    }

    fn segment() -> RecordingSegment {
        let now = Utc::now();
        RecordingSegment::from_chunks("call-1", "audio/ogg", &[Bytes::from_static(b"x")], now, now)
    }

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_millis(100), Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let uploader = RetryingUploader::new(
            Flaky {
                calls: AtomicU32::new(0),
                succeed_on: 3,
            },
            3,
            backoff(),
        );
        let receipt = uploader.upload(&segment()).await.unwrap();
        assert_eq!(receipt.id, "r3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_at_ceiling() {
        let uploader = RetryingUploader::new(
            Flaky {
                calls: AtomicU32::new(0),
                succeed_on: u32::MAX,
            },
            3,
            backoff(),
        );
        assert!(uploader.upload(&segment()).await.is_err());
        assert_eq!(uploader.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_emits_error_event() {
        let bus = CoreEventBus::new();
        let errors = Arc::new(AtomicU32::new(0));
        let e = errors.clone();
        bus.add_handler(Arc::new(move |event: &Event| {
            if matches!(event, Event::RecordingError(_)) {
                e.fetch_add(1, Ordering::SeqCst);
            }
        }));
        let uploader = Arc::new(RetryingUploader::new(
            Flaky {
                calls: AtomicU32::new(0),
                succeed_on: u32::MAX,
            },
            2,
            backoff(),
        ));
        spawn_upload(uploader, segment(), bus).await.unwrap();
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }
}
