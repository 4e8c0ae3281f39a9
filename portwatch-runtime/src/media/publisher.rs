use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::warn;

use crate::frame::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    Copy,
    Transcode,
}

#[derive(Debug)]
pub enum EncoderExit {
    Closed,
    Crashed(Option<i32>),
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("encoder binary not found")]
    NotFound,
    #[error("encoder failed to start: {0}")]
    Other(#[from] anyhow::Error),
}

/// One running encoder subprocess. `feed` pushes a frame's bytes in;
/// `poll_exit` is polled by the worker's publisher-watch loop to learn
/// about crashes without blocking the frame-feeding path.
#[async_trait]
pub trait EncoderProcess: Send {
    async fn feed(&mut self, frame: &Frame) -> anyhow::Result<()>;

    /// Non-blocking exit check, polled periodically by the publisher's
    /// health watcher so a crash can be detected without holding the
    /// publisher's process slot locked indefinitely.
    fn poll_exit(&mut self) -> Option<EncoderExit>;

    async fn kill(&mut self);
}

/// Spawns encoder subprocesses for a given codec/mode. `spawn(copy)` is
/// tried first when eligible; `codec` is meaningless in `Copy` mode.
#[async_trait]
pub trait EncoderLauncher: Send + Sync {
    async fn spawn(
        &self,
        stream_id: &str,
        codec: &str,
        mode: PublishMode,
    ) -> Result<Box<dyn EncoderProcess>, SpawnError>;
}

struct Slot {
    process: Box<dyn EncoderProcess>,
    codec: String,
    crash_restarts: u32,
}

/// Forwards decoded frames to an external RTSP sink under a stream path
/// equal to the stream id. Owns exactly one live encoder subprocess at a
/// time and walks the ordered codec fallback chain on spawn/runtime
/// failure.
pub struct MediaPublisher {
    stream_id: String,
    codec_preference: Vec<String>,
    launcher: Arc<dyn EncoderLauncher>,
    slot: Mutex<Option<Slot>>,
    disabled: AtomicBool,
}

impl MediaPublisher {
    pub fn new(
        stream_id: impl Into<String>,
        codec_preference: Vec<String>,
        launcher: Arc<dyn EncoderLauncher>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            codec_preference,
            launcher,
            slot: Mutex::new(None),
            disabled: AtomicBool::new(false),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    fn disable(&self) {
        self.disabled.store(true, Ordering::Relaxed);
    }

    /// Attempts `spawn(copy)` first when `copy_eligible`, then walks the
    /// codec preference list until one succeeds or all are exhausted.
    /// Idempotent: a no-op if an encoder is already running.
    pub async fn start(&self, copy_eligible: bool) -> anyhow::Result<()> {
        if self.is_disabled() {
            anyhow::bail!("media publisher for '{}' is permanently disabled", self.stream_id);
        }
        let mut guard = self.slot.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        if copy_eligible {
            match self.launcher.spawn(&self.stream_id, "copy", PublishMode::Copy).await {
                Ok(process) => {
                    *guard = Some(Slot {
                        process,
                        codec: "copy".to_string(),
                        crash_restarts: 0,
                    });
                    return Ok(());
                }
                Err(SpawnError::NotFound) => {
                    warn!(stream_id = %self.stream_id, "encoder binary not found for copy mode");
                    self.disable();
                    anyhow::bail!("encoder binary not found");
                }
                Err(SpawnError::Other(error)) => {
                    warn!(stream_id = %self.stream_id, %error, "copy-mode spawn failed, falling back to transcode");
                }
            }
        }

        for codec in &self.codec_preference {
            match self.launcher.spawn(&self.stream_id, codec, PublishMode::Transcode).await {
                Ok(process) => {
                    *guard = Some(Slot {
                        process,
                        codec: codec.clone(),
                        crash_restarts: 0,
                    });
                    return Ok(());
                }
                Err(SpawnError::NotFound) => {
                    warn!(stream_id = %self.stream_id, codec, "encoder binary not found, trying next codec");
                }
                Err(SpawnError::Other(error)) => {
                    warn!(stream_id = %self.stream_id, codec, %error, "encoder spawn failed, trying next codec");
                }
            }
        }

        self.disable();
        anyhow::bail!("codec fallback chain exhausted for stream '{}'", self.stream_id)
    }

    pub async fn feed(&self, frame: &Frame) {
        let mut guard = self.slot.lock().await;
        if let Some(slot) = guard.as_mut() {
            if let Err(error) = slot.process.feed(frame).await {
                warn!(stream_id = %self.stream_id, %error, "frame feed to encoder failed");
            }
        }
    }

    /// Polls the running encoder for an unexpected exit and, if found,
    /// applies the crash policy. Meant to be called periodically by the
    /// worker's publisher-watch loop.
    pub async fn check_health(&self) {
        let crashed = {
            let mut guard = self.slot.lock().await;
            match guard.as_mut() {
                Some(slot) => slot.process.poll_exit().is_some(),
                None => false,
            }
        };
        if crashed {
            self.handle_crash().await;
        }
    }

    /// Applies the runtime crash policy: one in-place restart on the same
    /// codec, then advance to the next codec in the preference list, then
    /// permanently disable. Called by the worker once it observes the
    /// running encoder exited unexpectedly.
    pub async fn handle_crash(&self) {
        let mut guard = self.slot.lock().await;
        let Some(slot) = guard.take() else {
            return;
        };
        let crashed_codec = slot.codec;
        let restarts = slot.crash_restarts;
        drop(slot.process);

        if crashed_codec != "copy" && restarts < 1 {
            if let Ok(process) = self
                .launcher
                .spawn(&self.stream_id, &crashed_codec, PublishMode::Transcode)
                .await
            {
                *guard = Some(Slot {
                    process,
                    codec: crashed_codec,
                    crash_restarts: restarts + 1,
                });
                return;
            }
        }

        let remaining = self
            .codec_preference
            .iter()
            .skip_while(|c| *c != &crashed_codec)
            .skip(1);
        for codec in remaining {
            if let Ok(process) = self
                .launcher
                .spawn(&self.stream_id, codec, PublishMode::Transcode)
                .await
            {
                *guard = Some(Slot {
                    process,
                    codec: codec.clone(),
                    crash_restarts: 0,
                });
                return;
            }
        }

        warn!(stream_id = %self.stream_id, "codec fallback chain exhausted after crash, disabling publisher");
        self.disable();
    }

    /// Idempotent: a second `close()` finds nothing running and no-ops.
    pub async fn close(&self) {
        let mut guard = self.slot.lock().await;
        if let Some(mut slot) = guard.take() {
            slot.process.kill().await;
        }
    }
}

struct FfmpegProcess {
    child: tokio::process::Child,
    stdin: tokio::process::ChildStdin,
}

#[async_trait]
impl EncoderProcess for FfmpegProcess {
    async fn feed(&mut self, frame: &Frame) -> anyhow::Result<()> {
        self.stdin.write_all(&frame.data).await?;
        Ok(())
    }

    fn poll_exit(&mut self) -> Option<EncoderExit> {
        match self.child.try_wait() {
            Ok(Some(status)) if status.success() => Some(EncoderExit::Closed),
            Ok(Some(status)) => Some(EncoderExit::Crashed(status.code())),
            Ok(None) => None,
            Err(_) => Some(EncoderExit::Crashed(None)),
        }
    }

    async fn kill(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// Spawns a real ffmpeg subprocess reading raw frames on stdin and pushing
/// an RTSP stream out under `{sink_base_url}/{stream_id}`, grounded on
/// `build_ffmpeg_command`/`run_ffmpeg_command`.
pub struct FfmpegEncoderLauncher {
    pub ffmpeg_path: String,
    pub sink_base_url: String,
}

#[async_trait]
impl EncoderLauncher for FfmpegEncoderLauncher {
    async fn spawn(
        &self,
        stream_id: &str,
        codec: &str,
        mode: PublishMode,
    ) -> Result<Box<dyn EncoderProcess>, SpawnError> {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-f", "rawvideo", "-i", "pipe:0"]);
        match mode {
            PublishMode::Copy => {
                cmd.args(["-c", "copy"]);
            }
            PublishMode::Transcode => {
                cmd.args(["-c:v", codec]);
            }
        }
        cmd.args(["-f", "rtsp", &format!("{}/{}", self.sink_base_url, stream_id)]);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::null());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(SpawnError::NotFound);
            }
            Err(error) => return Err(SpawnError::Other(error.into())),
        };
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other(anyhow::anyhow!("encoder child missing stdin")))?;
        Ok(Box::new(FfmpegProcess { child, stdin }))
    }
}
