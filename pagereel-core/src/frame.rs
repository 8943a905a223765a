//! Shared media types: coded frames, codecs and track metadata.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Codec families the pipeline can encode and decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
    Av1,
}

impl VideoCodec {
    /// Parse from a user-facing name or sample-entry fourcc.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "h264" | "avc" | "avc1" | "avc3" => Some(Self::H264),
            "av1" | "av01" => Some(Self::Av1),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::H264 => "H.264",
            Self::Av1 => "AV1",
        }
    }
}

/// Result of classifying a track's sample entry.
///
/// `Unknown` means a video track exists but its codec is not one we handle
/// (HEVC lands here too). A missing video track is an error, not `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectedCodec {
    H264,
    Av1,
    Unknown { fourcc: [u8; 4] },
}

impl DetectedCodec {
    pub fn from_fourcc(fourcc: &[u8; 4]) -> Self {
        match fourcc {
            b"avc1" | b"avc3" => Self::H264,
            b"av01" => Self::Av1,
            // hvc1/hev1 are recognised but unsupported
            _ => Self::Unknown { fourcc: *fourcc },
        }
    }

    pub fn supported(&self) -> Option<VideoCodec> {
        match self {
            Self::H264 => Some(VideoCodec::H264),
            Self::Av1 => Some(VideoCodec::Av1),
            Self::Unknown { .. } => None,
        }
    }
}

impl From<VideoCodec> for DetectedCodec {
    fn from(codec: VideoCodec) -> Self {
        match codec {
            VideoCodec::H264 => Self::H264,
            VideoCodec::Av1 => Self::Av1,
        }
    }
}

/// Unit of [`CodedFrame::timestamp`], fixed for a whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimestampUnit {
    #[default]
    Millis,
    Micros,
}

impl TimestampUnit {
    pub fn per_second(&self) -> u64 {
        match self {
            Self::Millis => 1_000,
            Self::Micros => 1_000_000,
        }
    }
}

/// A single coded video frame.
///
/// H.264 payloads are Annex-B when they leave an encoder and AVCC once they
/// are bound for the container. Frames are never mutated; conversions build a
/// new frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodedFrame {
    pub data: Bytes,
    pub timestamp: u64,
    pub duration: Option<u64>,
    pub is_keyframe: bool,
}

impl CodedFrame {
    pub fn new(data: impl Into<Bytes>, timestamp: u64, is_keyframe: bool) -> Self {
        Self {
            data: data.into(),
            timestamp,
            duration: None,
            is_keyframe,
        }
    }

    pub fn with_duration(mut self, duration: u64) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// Out-of-band decoder parameters, stored once per container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderConfigRecord {
    /// Raw SPS/PPS NAL payloads (no start codes, no length prefixes).
    Avc { sps: Vec<u8>, pps: Vec<u8> },
    /// Sequence header OBU including its header. Empty when the stream
    /// carried none.
    Av1 { sequence_header: Vec<u8> },
}

/// Per-session track description, fixed when the session begins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub codec: DetectedCodec,
    pub width: u32,
    pub height: u32,
    pub timescale: u32,
    pub track_id: u32,
}
