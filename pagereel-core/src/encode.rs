//! Encoder port.
//!
//! [`VideoEncoder`] is what the recording pipeline talks to: RGBA frames in,
//! a finished MP4 out of [`VideoEncoder::end`]. Pixel compression itself
//! sits behind the narrower [`FrameEncoder`] trait; [`Mp4Encoder`] glues one
//! to the muxer.

use bytes::Bytes;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::EncodeError;
use crate::frame::{CodedFrame, TimestampUnit, VideoCodec};
use crate::mp4_mux::{Mp4Muxer, MuxerConfig};

/// Highest (worst) quantizer-style quality value.
pub const MAX_QUALITY: u8 = 63;

/// Rate control knobs passed to [`VideoEncoder::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderOptions {
    /// Target bits per second; `None` lets the backend choose.
    pub bitrate: Option<u32>,
    /// 0 (best) ..= 63 (smallest).
    pub quality: u8,
}

impl EncoderOptions {
    pub fn new(bitrate: Option<u32>, quality: u8) -> Self {
        Self {
            bitrate,
            quality: quality.min(MAX_QUALITY),
        }
    }
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self::new(None, 30)
    }
}

/// Frame-by-frame video encoder producing a complete MP4 file.
pub trait VideoEncoder: Send {
    fn codec(&self) -> VideoCodec;

    fn begin(
        &mut self,
        width: u32,
        height: u32,
        fps: f64,
        options: &EncoderOptions,
    ) -> Result<(), EncodeError>;

    fn encode_frame(&mut self, image: &RgbaImage, timestamp_ms: u64) -> Result<(), EncodeError>;

    /// Flush the codec and return the finished file.
    fn end(&mut self) -> Result<Bytes, EncodeError>;
}

/// Pixel codec collaborator: turns images into coded frames.
///
/// H.264 output is Annex-B with SPS/PPS in the first keyframe; AV1 output is
/// low-overhead OBUs with a sequence header in the first keyframe.
pub trait FrameEncoder: Send {
    fn codec(&self) -> VideoCodec;

    fn configure(
        &mut self,
        width: u32,
        height: u32,
        fps: f64,
        options: &EncoderOptions,
    ) -> Result<(), EncodeError>;

    /// May return zero or more frames; encoders with lookahead lag behind.
    fn encode(&mut self, image: &RgbaImage, timestamp_ms: u64) -> Result<Vec<CodedFrame>, EncodeError>;

    /// Drain frames still held by the codec.
    fn flush(&mut self) -> Result<Vec<CodedFrame>, EncodeError>;
}

impl<T: FrameEncoder + ?Sized> FrameEncoder for Box<T> {
    fn codec(&self) -> VideoCodec {
        (**self).codec()
    }

    fn configure(
        &mut self,
        width: u32,
        height: u32,
        fps: f64,
        options: &EncoderOptions,
    ) -> Result<(), EncodeError> {
        (**self).configure(width, height, fps, options)
    }

    fn encode(&mut self, image: &RgbaImage, timestamp_ms: u64) -> Result<Vec<CodedFrame>, EncodeError> {
        (**self).encode(image, timestamp_ms)
    }

    fn flush(&mut self) -> Result<Vec<CodedFrame>, EncodeError> {
        (**self).flush()
    }
}

/// [`VideoEncoder`] that muxes a [`FrameEncoder`]'s output into fragmented MP4.
pub struct Mp4Encoder<E> {
    inner: E,
    session: Option<Session>,
}

struct Session {
    muxer: Mp4Muxer,
    width: u32,
    height: u32,
}

impl<E: FrameEncoder> Mp4Encoder<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            session: None,
        }
    }

    pub fn into_inner(self) -> E {
        self.inner
    }
}

impl<E: FrameEncoder> VideoEncoder for Mp4Encoder<E> {
    fn codec(&self) -> VideoCodec {
        self.inner.codec()
    }

    fn begin(
        &mut self,
        width: u32,
        height: u32,
        fps: f64,
        options: &EncoderOptions,
    ) -> Result<(), EncodeError> {
        let muxer = Mp4Muxer::begin(MuxerConfig {
            codec: self.inner.codec(),
            width,
            height,
            fps,
            timestamp_unit: TimestampUnit::Millis,
        })?;
        self.inner.configure(width, height, fps, options)?;
        debug!(
            codec = self.inner.codec().name(),
            width,
            height,
            fps,
            bitrate = ?options.bitrate,
            quality = options.quality,
            "encoder session opened"
        );
        self.session = Some(Session {
            muxer,
            width,
            height,
        });
        Ok(())
    }

    fn encode_frame(&mut self, image: &RgbaImage, timestamp_ms: u64) -> Result<(), EncodeError> {
        let session = self.session.as_mut().ok_or(EncodeError::NotStarted)?;
        if image.dimensions() != (session.width, session.height) {
            return Err(EncodeError::FrameSize {
                expected: (session.width, session.height),
                actual: image.dimensions(),
            });
        }
        for frame in self.inner.encode(image, timestamp_ms)? {
            session.muxer.add_frame(frame)?;
        }
        trace!(timestamp_ms, "frame encoded");
        Ok(())
    }

    fn end(&mut self) -> Result<Bytes, EncodeError> {
        let mut session = self.session.take().ok_or(EncodeError::NotStarted)?;
        for frame in self.inner.flush()? {
            session.muxer.add_frame(frame)?;
        }
        Ok(session.muxer.finalize()?)
    }
}
