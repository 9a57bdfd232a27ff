//! Local audio capture seam.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// A 20 ms Opus packet that decodes to silence.
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];

/// Media acquisition failures; each cause is distinguishable so the caller
/// can explain it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("no audio input device")]
    NoDevice,

    #[error("audio input device is busy")]
    DeviceBusy,

    #[error("{0}")]
    Other(String),
}

/// One encoded Opus frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub data: Bytes,
    pub duration: Duration,
}

impl AudioFrame {
    pub fn new(data: impl Into<Bytes>, duration: Duration) -> Self {
        Self {
            data: data.into(),
            duration,
        }
    }

    pub fn silence(duration: Duration) -> Self {
        Self::new(Bytes::from_static(OPUS_SILENCE), duration)
    }

    pub fn is_silence(&self) -> bool {
        self.data.as_ref() == OPUS_SILENCE
    }
}

/// A live audio track.
#[async_trait]
pub trait AudioStream: Send + Sync {
    fn id(&self) -> &str;

    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;

    /// Releases the underlying device. Idempotent.
    fn stop(&self);

    fn is_stopped(&self) -> bool;

    /// Waits for the next captured frame. `None` once capture has ended;
    /// streams that are only observed, never sent, yield nothing.
    async fn next_frame(&self) -> Option<AudioFrame> {
        None
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire_audio(&self) -> Result<Arc<dyn AudioStream>, MediaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_keeps_frame_duration() {
        let frame = AudioFrame::silence(Duration::from_millis(20));
        assert!(frame.is_silence());
        assert_eq!(frame.duration, Duration::from_millis(20));
        assert!(!AudioFrame::new(vec![0x78, 0x01], Duration::from_millis(20)).is_silence());
    }
}
