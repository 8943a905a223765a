//! Error types for the container and codec layer.
//!
//! Structural failures always abort the whole operation. Per-sample decode
//! failures never surface here: the decoder adapter drops the sample instead.

use crate::frame::{DetectedCodec, VideoCodec};
use thiserror::Error;

/// Malformed NAL/OBU structure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BitstreamError {
    #[error("no SPS NAL unit found in bitstream")]
    MissingSps,
    #[error("no PPS NAL unit found in bitstream")]
    MissingPps,
    #[error("OBU at offset {offset} has the forbidden bit set")]
    ForbiddenBit { offset: usize },
    #[error("OBU header at offset {offset} is truncated")]
    TruncatedObuHeader { offset: usize },
    #[error("LEB128 value at offset {offset} runs past the end of the buffer")]
    TruncatedLeb128 { offset: usize },
    #[error("OBU at offset {offset} declares {declared} bytes but only {available} remain")]
    ObuOverrun {
        offset: usize,
        declared: u64,
        available: usize,
    },
}

/// Failures of the fragmented MP4 builder.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("no frames were added before finalize")]
    NoFrames,
    #[error("missing decoder configuration: {0}")]
    MissingConfig(#[source] BitstreamError),
    #[error("frame timestamp {current} is earlier than the previous frame at {previous}")]
    TimestampRegression { previous: u64, current: u64 },
    #[error("invalid track geometry: {0}")]
    InvalidGeometry(String),
    #[error("box '{kind}' is {size} bytes, larger than a 32-bit box size allows")]
    BoxTooLarge { kind: String, size: usize },
}

/// Failures while reading an ISO-BMFF file.
#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("malformed container: {reason}")]
    ContainerFormat { reason: String },
    #[error("no video track (handler 'vide') in container")]
    NoVideoTrack,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DemuxError {
    pub(crate) fn format(reason: impl Into<String>) -> Self {
        Self::ContainerFormat {
            reason: reason.into(),
        }
    }
}

/// Capability exhaustion during backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("no decoder available for {codec:?} (tried: {tried:?})")]
    NoDecoderAvailable {
        codec: VideoCodec,
        tried: Vec<String>,
    },
    #[error("no encoder available for {codec:?} (tried: {tried:?})")]
    NoEncoderAvailable {
        codec: VideoCodec,
        tried: Vec<String>,
    },
}

/// Errors surfaced through the [`VideoEncoder`](crate::encode::VideoEncoder) port.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("encoder used before begin()")]
    NotStarted,
    #[error("frame is {actual:?} but the session was opened at {expected:?}")]
    FrameSize {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("encoder backend failed: {0}")]
    Backend(String),
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Selection(#[from] BackendError),
}

/// Errors surfaced through the [`VideoDecoder`](crate::decode::VideoDecoder) port.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("decoder backend failed: {0}")]
    Backend(String),
    #[error("decoder is closed")]
    Closed,
    #[error("{expected:?} decoder cannot read a {found:?} track")]
    CodecMismatch {
        expected: VideoCodec,
        found: DetectedCodec,
    },
    #[error(transparent)]
    Demux(#[from] DemuxError),
    #[error(transparent)]
    Selection(#[from] BackendError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
