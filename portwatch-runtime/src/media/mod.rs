//! Media publisher: forwards decoded frames to an external RTSP sink under
//! a stream path equal to the stream id. Grounded on `ferrex-server`'s
//! transcoding worker (`run_ffmpeg_command`, `build_ffmpeg_command`,
//! `handle_job_failure`), repurposed from batch-job HLS segment production
//! to a long-lived forwarding subprocess.

mod publisher;

pub use publisher::{
    EncoderExit, EncoderLauncher, EncoderProcess, FfmpegEncoderLauncher, MediaPublisher,
    PublishMode, SpawnError,
};
