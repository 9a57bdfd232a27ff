use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One finished recording, handed to the upload collaborator exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingSegment {
    pub call_id: String,
    #[serde(skip)]
    pub blob: Bytes,
    pub mime_type: String,
    pub duration_seconds: f64,
    pub size_bytes: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl RecordingSegment {
    /// Concatenates buffered chunks into a single segment.
    pub fn from_chunks(
        call_id: impl Into<String>,
        mime_type: impl Into<String>,
        chunks: &[Bytes],
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        let size_bytes = chunks.iter().map(Bytes::len).sum();
        let mut blob = Vec::with_capacity(size_bytes);
        for chunk in chunks {
            blob.extend_from_slice(chunk);
        }
        let duration_ms = ended_at
            .signed_duration_since(started_at)
            .num_milliseconds()
            .max(0);
        Self {
            call_id: call_id.into(),
            blob: Bytes::from(blob),
            mime_type: mime_type.into(),
            duration_seconds: duration_ms as f64 / 1000.0,
            size_bytes,
            started_at,
            ended_at,
        }
    }
}
