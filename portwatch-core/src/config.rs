use std::collections::HashSet;
use std::time::Duration;

/// Environment-configured knobs for the orchestrator and worker runtime,
/// concentrated in one struct rather than scattered `env::var` reads.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Hard cap on concurrent worker processes.
    pub max_workers: usize,
    /// Initial backoff before the first restart attempt after a crash.
    pub initial_backoff: Duration,
    /// Upper bound backoff reaches after repeated restart failures.
    pub max_backoff: Duration,
    /// Watchdog tick period.
    pub watchdog_period: Duration,
    /// Stop + drop config for streams with no heartbeat for this long.
    /// Zero disables the idle timeout.
    pub idle_timeout: Duration,
    /// Stop (but retain config for hot-restart) streams with zero viewers
    /// for this long. Zero disables the no-viewer timeout.
    pub no_viewer_timeout: Duration,
    /// Stream ids exempt from both idle and no-viewer timeouts.
    pub protected_stream_ids: HashSet<String>,
    /// Capacity of the frame -> media publisher queue.
    pub frame_queue_size: usize,
    /// Capacity of the detections -> API `detection_out` queue.
    pub detection_queue_size: usize,
    /// Max frames a local-file reader may grab-without-decode per
    /// iteration to catch back up to wall clock.
    pub max_catchup_skip: u32,
    /// Ordered codec fallback list for the media publisher (hardware first,
    /// software last).
    pub codec_preference: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: 16,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            watchdog_period: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(300),
            no_viewer_timeout: Duration::from_secs(15),
            protected_stream_ids: HashSet::new(),
            frame_queue_size: 4,
            detection_queue_size: 16,
            max_catchup_skip: 5,
            codec_preference: vec![
                "h264_vaapi".to_string(),
                "h264_nvenc".to_string(),
                "libx264".to_string(),
            ],
        }
    }
}

impl OrchestratorConfig {
    pub fn is_protected(&self, stream_id: &str) -> bool {
        self.protected_stream_ids.contains(stream_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_bounds_are_sane() {
        let config = OrchestratorConfig::default();
        assert!(config.initial_backoff <= config.max_backoff);
    }

    #[test]
    fn protected_set_membership() {
        let mut config = OrchestratorConfig::default();
        config.protected_stream_ids.insert("harbor-cam".to_string());
        assert!(config.is_protected("harbor-cam"));
        assert!(!config.is_protected("cam-1"));
    }
}
