//! Wire payloads published on the event bus channel `detections:{stream_id}`.
//! UTF-8 JSON, one object per publish, tagged by `type`.

use serde::{Deserialize, Serialize};

/// `{"type":"ready","width":int,"height":int,"fps":float}`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReadyPayload {
    #[serde(rename = "type")]
    pub kind: ReadyKind,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyKind {
    Ready,
}

impl ReadyPayload {
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        Self {
            kind: ReadyKind::Ready,
            width,
            height,
            fps,
        }
    }
}

/// `{"type":"frame_meta","frame_index":int,"timestamp_ms":float,"frame_sent_at_ms":float,"fps":float}`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameMetaPayload {
    #[serde(rename = "type")]
    pub kind: FrameMetaKind,
    pub frame_index: u64,
    pub timestamp_ms: f64,
    pub frame_sent_at_ms: f64,
    pub fps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameMetaKind {
    FrameMeta,
}

impl FrameMetaPayload {
    pub fn new(frame_index: u64, timestamp_ms: f64, frame_sent_at_ms: f64, fps: f64) -> Self {
        Self {
            kind: FrameMetaKind::FrameMeta,
            frame_index,
            timestamp_ms,
            frame_sent_at_ms,
            fps,
        }
    }
}

/// A single detected bounding box. `x,y` are the box center; `width,height`
/// are extents; coordinates are in the published frame's pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub confidence: f64,
    pub class_id: Option<u32>,
    pub track_id: Option<u64>,
}

/// `class_name` lives alongside `class_id`/`track_id` in the `detection`
/// object on the wire; kept as a dedicated field for the detector's label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedVessel {
    pub detection: DetectionWithLabel,
    /// Always `null` — the fused-vessel record is populated by a collaborator
    /// outside this core's scope.
    pub vessel: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionWithLabel {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub confidence: f64,
    pub class_id: Option<u32>,
    pub class_name: String,
    pub track_id: Option<u64>,
}

impl DetectedVessel {
    pub fn new(detection: Detection, class_name: impl Into<String>) -> Self {
        Self {
            detection: DetectionWithLabel {
                x: detection.x,
                y: detection.y,
                width: detection.width,
                height: detection.height,
                confidence: detection.confidence,
                class_id: detection.class_id,
                class_name: class_name.into(),
                track_id: detection.track_id,
            },
            vessel: None,
        }
    }
}

/// `{"type":"detections", ...}` — the per-frame inference result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionPayload {
    #[serde(rename = "type")]
    pub kind: DetectionKind,
    pub frame_index: u64,
    pub timestamp_ms: f64,
    pub frame_sent_at_ms: f64,
    pub fps: f64,
    pub inference_fps: f64,
    pub vessels: Vec<DetectedVessel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionKind {
    Detections,
}

impl DetectionPayload {
    pub fn new(
        frame_index: u64,
        timestamp_ms: f64,
        frame_sent_at_ms: f64,
        fps: f64,
        inference_fps: f64,
        vessels: Vec<DetectedVessel>,
    ) -> Self {
        Self {
            kind: DetectionKind::Detections,
            frame_index,
            timestamp_ms,
            frame_sent_at_ms,
            fps,
            inference_fps,
            vessels,
        }
    }
}

/// An event-bus message: either a typed payload or the terminal sentinel
/// that unblocks any consumer waiting on a `detection_out` queue.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    Ready(ReadyPayload),
    FrameMeta(FrameMetaPayload),
    Detections(DetectionPayload),
    /// Terminal sentinel — the worker is exiting.
    Terminal,
}

impl BusMessage {
    /// Serializes to the channel's wire format. The terminal sentinel has no
    /// wire representation; it only ever travels on in-process queues.
    pub fn to_json(&self) -> Option<String> {
        match self {
            BusMessage::Ready(p) => serde_json::to_string(p).ok(),
            BusMessage::FrameMeta(p) => serde_json::to_string(p).ok(),
            BusMessage::Detections(p) => serde_json::to_string(p).ok(),
            BusMessage::Terminal => None,
        }
    }
}
