//! JSON messages sent to viewers over the WebSocket, and the control
//! surface's status reply.

use serde::{Deserialize, Serialize};

use crate::pose::{HandKeypoints, Keypoint};

/// Keypoint row on the wire: integer pixels and a float score.
pub type WireKeypoint = (i64, i64, f64);

/// One outgoing stream message. `type` is one of `kpts`, `frame`,
/// `frame_kpts`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Kpts {
        kpts: Vec<WireKeypoint>,
        #[serde(rename = "W")]
        width: u32,
        #[serde(rename = "H")]
        height: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hands: Option<Vec<HandKeypoints>>,
    },
    Frame {
        frame: String,
        #[serde(rename = "frameSeq")]
        frame_seq: u64,
        #[serde(rename = "W")]
        width: u32,
        #[serde(rename = "H")]
        height: u32,
    },
    FrameKpts {
        frame: String,
        #[serde(rename = "frameSeq")]
        frame_seq: u64,
        kpts: Vec<WireKeypoint>,
        #[serde(rename = "W")]
        width: u32,
        #[serde(rename = "H")]
        height: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hands: Option<Vec<HandKeypoints>>,
    },
}

/// Stabilized keypoints of the selected subject plus the detection size.
#[derive(Debug, Clone, PartialEq)]
pub struct KeypointsPart {
    pub keypoints: Vec<Keypoint>,
    pub width: u32,
    pub height: u32,
    pub hands: Option<Vec<HandKeypoints>>,
}

/// Encoded frame text and its cache sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct FramePart {
    pub frame: String,
    pub seq: u64,
    pub width: u32,
    pub height: u32,
}

pub fn to_wire(kp: &Keypoint) -> WireKeypoint {
    // `as` truncates toward zero and maps NaN to 0
    (kp.x as i64, kp.y as i64, kp.confidence)
}

/// Non-finite hand values would serialize as `null`; they become 0.
fn scrub_hands(mut hands: Vec<HandKeypoints>) -> Vec<HandKeypoints> {
    for row in hands.iter_mut().flatten() {
        for v in row.iter_mut() {
            if !v.is_finite() {
                *v = 0.0;
            }
        }
    }
    hands
}

impl StreamMessage {
    /// Picks the message kind from what is available this cycle. The
    /// detection size wins over the frame size when both are present.
    pub fn from_parts(kpts: Option<KeypointsPart>, frame: Option<FramePart>) -> Option<Self> {
        match (kpts, frame) {
            (None, None) => None,
            (Some(k), None) => Some(Self::Kpts {
                kpts: k.keypoints.iter().map(to_wire).collect(),
                width: k.width,
                height: k.height,
                hands: k.hands.map(scrub_hands),
            }),
            (None, Some(f)) => Some(Self::Frame {
                frame: f.frame,
                frame_seq: f.seq,
                width: f.width,
                height: f.height,
            }),
            (Some(k), Some(f)) => Some(Self::FrameKpts {
                frame: f.frame,
                frame_seq: f.seq,
                kpts: k.keypoints.iter().map(to_wire).collect(),
                width: k.width,
                height: k.height,
                hands: k.hands.map(scrub_hands),
            }),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Kpts { .. } => "kpts",
            Self::Frame { .. } => "frame",
            Self::FrameKpts { .. } => "frame_kpts",
        }
    }
}

/// Reply of the recording control endpoints.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RecordingStatus {
    pub status: String,
    pub is_recording: bool,
    pub seq_id: Option<String>,
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
