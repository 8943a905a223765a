//! # pagereel core
//!
//! Container and bitstream layer of the page-load video recorder.
//!
//! Coded frames go through [`mp4_mux::Mp4Muxer`] to become a fragmented MP4;
//! [`mp4_demux::Mp4Demuxer`] reads fragmented or progressive MP4 back into
//! timed samples. [`backend::BackendSelector`] picks an encoder/decoder that
//! works on the current host.

// ============================================================================
// Bitstreams
// ============================================================================
pub mod av1_utils;
pub mod h264_utils;

// ============================================================================
// Containers
// ============================================================================
pub mod codec_detect;
pub mod mp4_box;
pub mod mp4_demux;
pub mod mp4_mux;

// ============================================================================
// Codec ports and backends
// ============================================================================
pub mod backend;
pub mod decode;
pub mod encode;
pub mod probe;

// ============================================================================
// Shared types
// ============================================================================
pub mod error;
pub mod frame;

pub use backend::{Backend, BackendSelector, SelectionResult, SelectorConfig};
pub use codec_detect::detect_codec;
pub use error::{BackendError, BitstreamError, DecodeError, DemuxError, EncodeError, MuxError};
pub use frame::{CodedFrame, DecoderConfigRecord, DetectedCodec, TimestampUnit, Track, VideoCodec};
pub use mp4_demux::{ContainerDocument, Mp4Demuxer};
pub use mp4_mux::{Mp4Muxer, MuxerConfig};
