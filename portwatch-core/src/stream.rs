use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

/// A validated stream identifier: `^[A-Za-z0-9_-]{1,64}$`.
pub type StreamId = String;

fn stream_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid stream id regex"))
}

/// Immutable, validated description of a stream source. Constructed by the
/// API layer and owned by the orchestrator for the lifetime of the stream
/// entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    stream_id: StreamId,
    source_url: String,
    /// Whether a finite file source should restart at EOF.
    #[serde(rename = "loop")]
    pub loop_playback: bool,
}

impl StreamConfig {
    /// Validates `stream_id` against the grammar and rejects an empty
    /// `source_url`.
    pub fn new(
        stream_id: impl Into<String>,
        source_url: impl Into<String>,
        loop_playback: bool,
    ) -> Result<Self, OrchestratorError> {
        let stream_id = stream_id.into();
        let source_url = source_url.into();

        if !stream_id_pattern().is_match(&stream_id) {
            return Err(OrchestratorError::ValidationError(format!(
                "stream_id '{stream_id}' must match ^[A-Za-z0-9_-]{{1,64}}$"
            )));
        }
        if source_url.trim().is_empty() {
            return Err(OrchestratorError::ValidationError(
                "source_url must not be empty".to_string(),
            ));
        }

        Ok(Self {
            stream_id,
            source_url,
            loop_playback,
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// A remote source is one the reader thread reconnects to rather than
    /// seeking/looping locally.
    pub fn is_remote(&self) -> bool {
        let url = self.source_url.to_ascii_lowercase();
        url.starts_with("rtsp://") || url.starts_with("http://") || url.starts_with("https://")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_stream_id() {
        assert!(StreamConfig::new("cam-1", "rtsp://host/live", true).is_ok());
    }

    #[test]
    fn rejects_stream_id_with_invalid_characters() {
        let err = StreamConfig::new("bad..id", "rtsp://host/live", false).unwrap_err();
        assert!(matches!(err, OrchestratorError::ValidationError(_)));
    }

    #[test]
    fn rejects_empty_source_url() {
        let err = StreamConfig::new("cam-1", "", false).unwrap_err();
        assert!(matches!(err, OrchestratorError::ValidationError(_)));
    }

    #[test]
    fn rejects_stream_id_over_64_chars() {
        let long_id = "a".repeat(65);
        assert!(StreamConfig::new(long_id, "rtsp://host/live", false).is_err());
    }

    #[test]
    fn classifies_remote_vs_local_sources() {
        let remote = StreamConfig::new("cam-1", "rtsp://host/live", false).unwrap();
        let local = StreamConfig::new("cam-2", "/var/media/clip.mp4", true).unwrap();
        assert!(remote.is_remote());
        assert!(!local.is_remote());
    }
}
