//! Fragmented MP4 muxer
//!
//! Output layout: `ftyp`, an init `moov` with `mvex`, then a single
//! `moof` + `mdat` holding every sample. The file plays back without a
//! trailing index.
//!
//! ```text
//! ftyp
//! moov
//!   mvhd
//!   trak (tkhd, mdia (mdhd, hdlr, minf (vmhd, dinf, stbl)))
//!   mvex (mehd, trex)
//! moof
//!   mfhd
//!   traf (tfhd, tfdt, trun)
//! mdat
//! ```

use bytes::{BufMut, Bytes};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::av1_utils::extract_av1_sequence_header;
use crate::error::MuxError;
use crate::frame::{CodedFrame, DecoderConfigRecord, TimestampUnit, Track, VideoCodec};
use crate::h264_utils::{annexb_to_avcc, extract_parameter_sets};
use crate::mp4_box::{kind, BoxWriter, FourCC};

/// Track id written into every output file.
pub const TRACK_ID: u32 = 1;

/// `trun` flags: data-offset, sample-duration, sample-size and sample-flags present.
const TRUN_FLAGS: u32 = 0x000701;
/// `tfhd` flag: default-base-is-moof.
const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x020000;

/// depends_on = 2 (no other sample)
pub const SYNC_SAMPLE_FLAGS: u32 = 0x0200_0000;
/// depends_on = 1, is_non_sync_sample = 1
pub const NON_SYNC_SAMPLE_FLAGS: u32 = 0x0101_0000;

const UNITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

/// Session parameters fixed at [`Mp4Muxer::begin`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuxerConfig {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    #[serde(default)]
    pub timestamp_unit: TimestampUnit,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            width: 1280,
            height: 720,
            fps: 30.0,
            timestamp_unit: TimestampUnit::Millis,
        }
    }
}

/// Builder that accumulates coded frames and serializes them on
/// [`finalize`](Mp4Muxer::finalize).
///
/// Frames must arrive in non-decreasing timestamp order; nothing is reordered.
#[derive(Debug)]
pub struct Mp4Muxer {
    config: MuxerConfig,
    timescale: u32,
    frames: Vec<CodedFrame>,
}

/// One sample as it lands in the `trun`.
struct SampleEntry {
    duration: u32,
    flags: u32,
    payload: Bytes,
}

impl Mp4Muxer {
    /// Open a muxing session.
    pub fn begin(config: MuxerConfig) -> Result<Self, MuxError> {
        for (name, value) in [("width", config.width), ("height", config.height)] {
            if value == 0 || value > u32::from(u16::MAX) {
                return Err(MuxError::InvalidGeometry(format!(
                    "{name} must be within 1..=65535, got {value}"
                )));
            }
        }
        if !config.fps.is_finite() || config.fps <= 0.0 {
            return Err(MuxError::InvalidGeometry(format!(
                "fps must be a positive number, got {}",
                config.fps
            )));
        }
        let timescale = (config.fps * 1000.0).round();
        if timescale < 1.0 || timescale > f64::from(u32::MAX) {
            return Err(MuxError::InvalidGeometry(format!(
                "fps {} gives an unusable timescale",
                config.fps
            )));
        }

        debug!(
            codec = config.codec.name(),
            width = config.width,
            height = config.height,
            fps = config.fps,
            timescale,
            "mp4 muxer session started"
        );

        Ok(Self {
            timescale: timescale as u32,
            config,
            frames: Vec::new(),
        })
    }

    pub fn config(&self) -> &MuxerConfig {
        &self.config
    }

    pub fn track(&self) -> Track {
        Track {
            codec: self.config.codec.into(),
            width: self.config.width,
            height: self.config.height,
            timescale: self.timescale,
            track_id: TRACK_ID,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Nominal sample duration in timescale ticks.
    pub fn nominal_duration(&self) -> u32 {
        ((f64::from(self.timescale) / self.config.fps).round() as u32).max(1)
    }

    pub fn add_frame(&mut self, frame: CodedFrame) -> Result<(), MuxError> {
        if let Some(previous) = self.frames.last() {
            if frame.timestamp < previous.timestamp {
                return Err(MuxError::TimestampRegression {
                    previous: previous.timestamp,
                    current: frame.timestamp,
                });
            }
        }
        trace!(
            timestamp = frame.timestamp,
            size = frame.data.len(),
            keyframe = frame.is_keyframe,
            "frame queued"
        );
        self.frames.push(frame);
        Ok(())
    }

    /// Serialize the session into a complete fragmented MP4 file.
    ///
    /// Either the whole file comes back or an error; never a partial buffer.
    pub fn finalize(self) -> Result<Bytes, MuxError> {
        if self.frames.is_empty() {
            return Err(MuxError::NoFrames);
        }

        let config = self.decoder_config()?;
        let samples = self.build_samples();
        let total_duration: u64 = samples.iter().map(|s| u64::from(s.duration)).sum();
        let base_decode_time = self.to_ticks(self.frames[0].timestamp);
        let payload_size: usize = samples.iter().map(|s| s.payload.len()).sum();

        let mut w = BoxWriter::with_capacity(payload_size + 1024 + samples.len() * 12);
        self.write_ftyp(&mut w)?;
        self.write_moov(&mut w, &config, total_duration)?;
        write_fragment(&mut w, &samples, base_decode_time)?;

        debug!(
            samples = samples.len(),
            bytes = w.len(),
            duration_ticks = total_duration,
            "mp4 finalized"
        );
        Ok(w.freeze())
    }

    fn decoder_config(&self) -> Result<DecoderConfigRecord, MuxError> {
        let first_key = self.frames.iter().find(|f| f.is_keyframe);
        match self.config.codec {
            VideoCodec::H264 => {
                let data = first_key.map(|f| &f.data[..]).unwrap_or(&[]);
                let (sps, pps) = extract_parameter_sets(data).map_err(MuxError::MissingConfig)?;
                Ok(DecoderConfigRecord::Avc {
                    sps: sps.to_vec(),
                    pps: pps.to_vec(),
                })
            }
            VideoCodec::Av1 => {
                let sequence_header = first_key
                    .and_then(|f| extract_av1_sequence_header(&f.data))
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default();
                if sequence_header.is_empty() {
                    debug!("no AV1 sequence header in first keyframe; av1C carries no config OBUs");
                }
                Ok(DecoderConfigRecord::Av1 { sequence_header })
            }
        }
    }

    fn to_ticks(&self, timestamp: u64) -> u64 {
        let per_second = u128::from(self.config.timestamp_unit.per_second());
        let ticks = (u128::from(timestamp) * u128::from(self.timescale) + per_second / 2) / per_second;
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    fn build_samples(&self) -> Vec<SampleEntry> {
        let nominal = self.nominal_duration();
        let mut samples = Vec::with_capacity(self.frames.len());

        for (i, frame) in self.frames.iter().enumerate() {
            let duration = match self.frames.get(i + 1) {
                Some(next) => {
                    let delta = self.to_ticks(next.timestamp) - self.to_ticks(frame.timestamp);
                    u32::try_from(delta).unwrap_or(u32::MAX)
                }
                None => nominal,
            };
            let duration = if duration == 0 { nominal } else { duration };

            let payload = match self.config.codec {
                VideoCodec::H264 => Bytes::from(annexb_to_avcc(&frame.data)),
                VideoCodec::Av1 => frame.data.clone(),
            };

            samples.push(SampleEntry {
                duration,
                flags: if frame.is_keyframe {
                    SYNC_SAMPLE_FLAGS
                } else {
                    NON_SYNC_SAMPLE_FLAGS
                },
                payload,
            });
        }
        samples
    }

    fn write_ftyp(&self, w: &mut BoxWriter) -> Result<(), MuxError> {
        let codec_brand: FourCC = match self.config.codec {
            VideoCodec::H264 => *b"avc1",
            VideoCodec::Av1 => *b"av01",
        };
        let start = w.begin(kind::FTYP);
        w.put_slice(b"isom");
        w.put_u32(0x200);
        for brand in [*b"isom", *b"iso2", codec_brand, *b"mp41"] {
            w.put_slice(&brand);
        }
        w.end(start)
    }

    fn write_moov(
        &self,
        w: &mut BoxWriter,
        config: &DecoderConfigRecord,
        total_duration: u64,
    ) -> Result<(), MuxError> {
        let moov = w.begin(kind::MOOV);

        // mvhd
        let mvhd = w.begin_full(kind::MVHD, 0, 0);
        w.put_u32(0); // creation_time
        w.put_u32(0); // modification_time
        w.put_u32(self.timescale);
        w.put_u32(0); // duration lives in mehd
        w.put_u32(0x0001_0000); // rate 1.0
        w.put_u16(0x0100); // volume 1.0
        w.put_zeros(10);
        put_matrix(w);
        w.put_zeros(24); // pre_defined
        w.put_u32(TRACK_ID + 1); // next_track_ID
        w.end(mvhd)?;

        self.write_trak(w, config)?;

        // mvex
        let mvex = w.begin(kind::MVEX);
        let mehd = w.begin_full(kind::MEHD, 1, 0);
        w.put_u64(total_duration);
        w.end(mehd)?;
        let trex = w.begin_full(kind::TREX, 0, 0);
        w.put_u32(TRACK_ID);
        w.put_u32(1); // default_sample_description_index
        w.put_u32(self.nominal_duration());
        w.put_u32(0); // default_sample_size
        w.put_u32(NON_SYNC_SAMPLE_FLAGS);
        w.end(trex)?;
        w.end(mvex)?;

        w.end(moov)
    }

    fn write_trak(&self, w: &mut BoxWriter, config: &DecoderConfigRecord) -> Result<(), MuxError> {
        let trak = w.begin(kind::TRAK);

        // tkhd: enabled | in_movie
        let tkhd = w.begin_full(kind::TKHD, 0, 0x000003);
        w.put_u32(0); // creation_time
        w.put_u32(0); // modification_time
        w.put_u32(TRACK_ID);
        w.put_u32(0); // reserved
        w.put_u32(0); // duration
        w.put_zeros(8);
        w.put_u16(0); // layer
        w.put_u16(0); // alternate_group
        w.put_u16(0); // volume (video)
        w.put_u16(0);
        put_matrix(w);
        w.put_u32(self.config.width << 16);
        w.put_u32(self.config.height << 16);
        w.end(tkhd)?;

        let mdia = w.begin(kind::MDIA);

        let mdhd = w.begin_full(kind::MDHD, 0, 0);
        w.put_u32(0);
        w.put_u32(0);
        w.put_u32(self.timescale);
        w.put_u32(0);
        w.put_u16(0x55C4); // 'und'
        w.put_u16(0);
        w.end(mdhd)?;

        let hdlr = w.begin_full(kind::HDLR, 0, 0);
        w.put_u32(0); // pre_defined
        w.put_slice(&kind::VIDE);
        w.put_zeros(12);
        w.put_slice(b"VideoHandler\0");
        w.end(hdlr)?;

        let minf = w.begin(kind::MINF);

        let vmhd = w.begin_full(kind::VMHD, 0, 0x000001);
        w.put_zeros(8); // graphicsmode + opcolor
        w.end(vmhd)?;

        let dinf = w.begin(kind::DINF);
        let dref = w.begin_full(kind::DREF, 0, 0);
        w.put_u32(1);
        let url = w.begin_full(kind::URL, 0, 0x000001); // self-contained
        w.end(url)?;
        w.end(dref)?;
        w.end(dinf)?;

        let stbl = w.begin(kind::STBL);
        let stsd = w.begin_full(kind::STSD, 0, 0);
        w.put_u32(1);
        self.write_sample_entry(w, config)?;
        w.end(stsd)?;

        // Samples live in fragments; the progressive tables stay empty.
        for table in [kind::STTS, kind::STSC, kind::STCO] {
            let b = w.begin_full(table, 0, 0);
            w.put_u32(0);
            w.end(b)?;
        }
        let stsz = w.begin_full(kind::STSZ, 0, 0);
        w.put_u32(0); // sample_size
        w.put_u32(0); // sample_count
        w.end(stsz)?;
        w.end(stbl)?;

        w.end(minf)?;
        w.end(mdia)?;
        w.end(trak)
    }

    fn write_sample_entry(
        &self,
        w: &mut BoxWriter,
        config: &DecoderConfigRecord,
    ) -> Result<(), MuxError> {
        let entry_kind = match config {
            DecoderConfigRecord::Avc { .. } => kind::AVC1,
            DecoderConfigRecord::Av1 { .. } => kind::AV01,
        };
        let entry = w.begin(entry_kind);
        w.put_zeros(6);
        w.put_u16(1); // data_reference_index
        w.put_zeros(16); // pre_defined + reserved
        w.put_u16(self.config.width as u16);
        w.put_u16(self.config.height as u16);
        w.put_u32(0x0048_0000); // 72 dpi
        w.put_u32(0x0048_0000);
        w.put_u32(0);
        w.put_u16(1); // frame_count
        w.put_zeros(32); // compressorname
        w.put_u16(0x0018); // depth
        w.put_u16(0xFFFF); // pre_defined = -1

        match config {
            DecoderConfigRecord::Avc { sps, pps } => write_avcc(w, sps, pps)?,
            DecoderConfigRecord::Av1 { sequence_header } => write_av1c(w, sequence_header)?,
        }
        w.end(entry)
    }
}

fn put_matrix(w: &mut BoxWriter) {
    for v in UNITY_MATRIX {
        w.put_u32(v);
    }
}

fn put_u16_prefixed(w: &mut BoxWriter, kind: FourCC, nal: &[u8]) -> Result<(), MuxError> {
    let len = u16::try_from(nal.len()).map_err(|_| MuxError::BoxTooLarge {
        kind: crate::mp4_box::fourcc_str(&kind),
        size: nal.len(),
    })?;
    w.put_u16(len);
    w.put_slice(nal);
    Ok(())
}

fn write_avcc(w: &mut BoxWriter, sps: &[u8], pps: &[u8]) -> Result<(), MuxError> {
    let avcc = w.begin(kind::AVCC);
    w.put_u8(1); // configurationVersion
    w.put_u8(sps.get(1).copied().unwrap_or(0x42)); // profile_idc
    w.put_u8(sps.get(2).copied().unwrap_or(0x00)); // constraint flags
    w.put_u8(sps.get(3).copied().unwrap_or(0x1E)); // level_idc
    w.put_u8(0xFF); // 4-byte NAL lengths
    w.put_u8(0xE1); // one SPS
    put_u16_prefixed(w, kind::AVCC, sps)?;
    w.put_u8(1); // one PPS
    put_u16_prefixed(w, kind::AVCC, pps)?;
    w.end(avcc)
}

fn write_av1c(w: &mut BoxWriter, sequence_header: &[u8]) -> Result<(), MuxError> {
    let av1c = w.begin(kind::AV1C);
    w.put_u8(0x81); // marker + version 1
    w.put_u8(0x08); // seq_profile 0, seq_level_idx_0 8
    w.put_u8(0x0C); // 8-bit, 4:2:0 (subsampling_x/y set)
    w.put_u8(0x00); // no initial_presentation_delay
    w.put_slice(sequence_header);
    w.end(av1c)
}

fn write_fragment(
    w: &mut BoxWriter,
    samples: &[SampleEntry],
    base_decode_time: u64,
) -> Result<(), MuxError> {
    let moof = w.begin(kind::MOOF);

    let mfhd = w.begin_full(kind::MFHD, 0, 0);
    w.put_u32(1); // sequence_number
    w.end(mfhd)?;

    let traf = w.begin(kind::TRAF);

    let tfhd = w.begin_full(kind::TFHD, 0, TFHD_DEFAULT_BASE_IS_MOOF);
    w.put_u32(TRACK_ID);
    w.end(tfhd)?;

    let tfdt = w.begin_full(kind::TFDT, 1, 0);
    w.put_u64(base_decode_time);
    w.end(tfdt)?;

    let trun = w.begin_full(kind::TRUN, 0, TRUN_FLAGS);
    w.put_u32(samples.len() as u32);
    let data_offset_pos = w.len();
    w.put_u32(0); // patched once moof is closed
    for sample in samples {
        w.put_u32(sample.duration);
        w.put_u32(sample.payload.len() as u32);
        w.put_u32(sample.flags);
    }
    w.end(trun)?;

    w.end(traf)?;
    w.end(moof)?;

    // Relative to the moof start; payload begins after the 8-byte mdat header.
    let moof_size = w.len() - moof;
    let data_offset = u32::try_from(moof_size + 8).map_err(|_| MuxError::BoxTooLarge {
        kind: "moof".into(),
        size: moof_size,
    })?;
    w.patch_u32(data_offset_pos, data_offset);
    trace!(moof_size, data_offset, "fragment header written");

    let mdat = w.begin(kind::MDAT);
    for sample in samples {
        w.put_slice(&sample.payload);
    }
    w.end(mdat)
}
