//! Decoder boundary. The decoder itself is an opaque collaborator; this
//! module defines the seam the worker reader thread talks to and a
//! synthetic implementation usable in tests without ffmpeg, the way
//! `ferrex-core`'s `ffmpeg` cargo feature gates its own hardware decoder
//! behind a swappable boundary.

use std::sync::Arc;

use async_trait::async_trait;

/// A single decoded frame. The payload is opaque to everything above the
/// decoder boundary; only its presentation timestamp is inspected.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Arc<[u8]>,
    /// Presentation timestamp reported by the decoder, in milliseconds,
    /// when the container provides one.
    pub pts_ms: Option<f64>,
}

impl Frame {
    pub fn new(data: Arc<[u8]>, pts_ms: Option<f64>) -> Self {
        Self { data, pts_ms }
    }
}

/// Result of one `next_frame` call.
#[derive(Debug)]
pub enum DecodeOutcome {
    Frame(Frame),
    /// End of stream reached (finite local source only).
    Eof,
}

/// The decoder boundary itself. A `FrameSource` owns one open decode
/// session; reconnects/reopen go through `FrameSourceFactory` instead,
/// since opening a *new* session requires `Self: Sized`, which isn't
/// object-safe alongside the rest of this trait.
#[async_trait]
pub trait FrameSource: Send {
    /// Decoder-reported frame rate, used to derive per-frame timestamps
    /// when the container doesn't supply its own PTS.
    fn probe_fps(&self) -> f64;

    /// Decoder-reported frame dimensions, published once in the `ready`
    /// event.
    fn probe_dimensions(&self) -> (u32, u32);

    /// Local (file) sources are looped/seeked; remote sources are
    /// reconnected.
    fn is_local(&self) -> bool;

    async fn next_frame(&mut self) -> anyhow::Result<DecodeOutcome>;

    /// Rewind a local source to its first frame (used by the loop policy).
    async fn seek_start(&mut self) -> anyhow::Result<()>;

    /// Advances past one frame without decoding it, for the local-file
    /// catch-up policy. Implementations with a cheaper "grab" primitive
    /// should override this; the default simply decodes and discards.
    async fn skip_frame(&mut self) -> anyhow::Result<DecodeOutcome> {
        self.next_frame().await
    }
}

/// Opens fresh `FrameSource` sessions for a given stream. Held by the
/// worker runtime so a reader that hits a read error can reopen without
/// the orchestrator being involved.
#[async_trait]
pub trait FrameSourceFactory: Send + Sync {
    async fn open(&self, source_url: &str) -> anyhow::Result<Box<dyn FrameSource>>;
}

/// Deterministic `FrameSource` for tests: produces empty-payload frames at
/// a fixed rate, optionally ending after `frame_count` frames (simulating
/// a finite local file), and can be told to fail exactly once at a given
/// frame index to exercise the reader's reconnect/backoff path.
pub struct SyntheticFrameSource {
    fps: f64,
    local: bool,
    frame_count: Option<u64>,
    fail_at: Option<u64>,
    index: u64,
    failed_once: bool,
    dimensions: (u32, u32),
}

impl SyntheticFrameSource {
    pub fn new(fps: f64, local: bool, frame_count: Option<u64>) -> Self {
        Self {
            fps,
            local,
            frame_count,
            fail_at: None,
            index: 0,
            failed_once: false,
            dimensions: (1920, 1080),
        }
    }

    pub fn with_failure_at(mut self, frame_index: u64) -> Self {
        self.fail_at = Some(frame_index);
        self
    }
}

#[async_trait]
impl FrameSource for SyntheticFrameSource {
    fn probe_fps(&self) -> f64 {
        self.fps
    }

    fn probe_dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    fn is_local(&self) -> bool {
        self.local
    }

    async fn next_frame(&mut self) -> anyhow::Result<DecodeOutcome> {
        if let Some(fail_at) = self.fail_at {
            if !self.failed_once && self.index == fail_at {
                self.failed_once = true;
                anyhow::bail!("synthetic decode error at frame {fail_at}");
            }
        }
        if let Some(count) = self.frame_count {
            if self.index >= count {
                return Ok(DecodeOutcome::Eof);
            }
        }
        self.index += 1;
        Ok(DecodeOutcome::Frame(Frame::new(Arc::from([]), None)))
    }

    async fn seek_start(&mut self) -> anyhow::Result<()> {
        self.index = 0;
        Ok(())
    }
}

/// Factory pairing for `SyntheticFrameSource`. Every `open` call yields an
/// independent source with the same parameters, mirroring a real decoder
/// being reopened against the same URL after a reconnect.
pub struct SyntheticFrameSourceFactory {
    pub fps: f64,
    pub local: bool,
    pub frame_count: Option<u64>,
}

#[async_trait]
impl FrameSourceFactory for SyntheticFrameSourceFactory {
    async fn open(&self, _source_url: &str) -> anyhow::Result<Box<dyn FrameSource>> {
        Ok(Box::new(SyntheticFrameSource::new(
            self.fps,
            self.local,
            self.frame_count,
        )))
    }
}
