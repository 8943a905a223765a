//! Decoder port.
//!
//! [`Mp4Decoder`] demuxes a file and feeds each coded sample to a
//! [`FrameDecoder`]. A sample the frame decoder rejects is dropped and
//! reading continues; only container problems fail the whole read.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use image::RgbaImage;
use tracing::debug;

use crate::error::DecodeError;
use crate::frame::{CodedFrame, Track, VideoCodec};
use crate::mp4_demux::{ContainerDocument, Mp4Demuxer};

/// One decoded picture.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub image: RgbaImage,
    pub timestamp_ms: u64,
}

/// Reads a whole video into decoded frames.
pub trait VideoDecoder: Send {
    fn codec(&self) -> VideoCodec;

    fn read_frames_from(&mut self, reader: &mut dyn Read) -> Result<Vec<DecodedFrame>, DecodeError>;

    fn read_frames(&mut self, path: &Path) -> Result<Vec<DecodedFrame>, DecodeError> {
        let mut reader = BufReader::new(File::open(path)?);
        self.read_frames_from(&mut reader)
    }

    /// Release backend resources. Later reads fail with [`DecodeError::Closed`].
    fn close(&mut self);
}

/// Pixel codec collaborator: one coded sample in, at most one image out.
pub trait FrameDecoder: Send {
    fn codec(&self) -> VideoCodec;

    /// `Ok(None)` means the codec needs more input before producing a picture.
    fn decode(&mut self, frame: &CodedFrame, track: &Track) -> Result<Option<RgbaImage>, DecodeError>;

    fn close(&mut self) {}
}

impl<T: FrameDecoder + ?Sized> FrameDecoder for Box<T> {
    fn codec(&self) -> VideoCodec {
        (**self).codec()
    }

    fn decode(&mut self, frame: &CodedFrame, track: &Track) -> Result<Option<RgbaImage>, DecodeError> {
        (**self).decode(frame, track)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// [`VideoDecoder`] over MP4 input.
pub struct Mp4Decoder<D> {
    inner: D,
    closed: bool,
    dropped: usize,
}

impl<D: FrameDecoder> Mp4Decoder<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            closed: false,
            dropped: 0,
        }
    }

    /// Samples dropped by the most recent read.
    pub fn dropped_samples(&self) -> usize {
        self.dropped
    }

    /// Decode an already demuxed document.
    pub fn decode_document(&mut self, doc: &ContainerDocument) -> Result<Vec<DecodedFrame>, DecodeError> {
        if self.closed {
            return Err(DecodeError::Closed);
        }
        let expected = self.inner.codec();
        if doc.track.codec.supported() != Some(expected) {
            return Err(DecodeError::CodecMismatch {
                expected,
                found: doc.track.codec,
            });
        }

        self.dropped = 0;
        let mut frames = Vec::with_capacity(doc.samples.len());
        for (index, sample) in doc.samples.iter().enumerate() {
            match self.inner.decode(sample, &doc.track) {
                Ok(Some(image)) => frames.push(DecodedFrame {
                    image,
                    timestamp_ms: sample.timestamp,
                }),
                Ok(None) => {}
                Err(e) => {
                    self.dropped += 1;
                    debug!(
                        index,
                        timestamp_ms = sample.timestamp,
                        error = %e,
                        "dropping undecodable sample"
                    );
                }
            }
        }
        Ok(frames)
    }
}

impl<D: FrameDecoder> VideoDecoder for Mp4Decoder<D> {
    fn codec(&self) -> VideoCodec {
        self.inner.codec()
    }

    fn read_frames_from(&mut self, reader: &mut dyn Read) -> Result<Vec<DecodedFrame>, DecodeError> {
        if self.closed {
            return Err(DecodeError::Closed);
        }
        let doc = Mp4Demuxer::read_from(reader)?;
        self.decode_document(&doc)
    }

    fn close(&mut self) {
        if !self.closed {
            self.inner.close();
            self.closed = true;
        }
    }
}
