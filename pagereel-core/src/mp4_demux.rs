// MP4 DEMUXER - fragmented and progressive ISO BMFF
//
// One video track in, timed coded samples out.
//
// ════════════════════════════════════════════════════════════════════════════
//
//   moov ── trak (handler 'vide') ── stsd ── avc1/avc3/av01 (+ avcC/av1C)
//                                  └─ stbl ── stts/stsc/stsz/stco/stss   (progressive)
//        └─ mvex ── trex                                                 (fragmented)
//   moof ── traf ── tfhd/tfdt/trun                                       (fragmented)
//
// Progressive samples are emitted first, then fragment samples in file order.
// Decode time keeps accumulating across both.
//
// ════════════════════════════════════════════════════════════════════════════

mod fragment;
mod sample_table;

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use bytes::Bytes;
use serde::Serialize;
use tracing::debug;

use crate::error::DemuxError;
use crate::frame::{CodedFrame, DecoderConfigRecord, DetectedCodec, Track};
use crate::h264_utils::{avcc_to_annexb_sized, AvcDecoderConfig};
use crate::mp4_box::{self, kind, BoxIter, Mp4Box};

use fragment::{FragmentReader, TrackDefaults};
use sample_table::SampleTable;

/// A sample located in the file, timing still in track ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RawSample {
    offset: u64,
    size: u32,
    decode_time: u64,
    duration: u32,
    is_sync: bool,
}

/// Bytes in a visual sample entry before its child boxes.
const VISUAL_SAMPLE_ENTRY_LEN: usize = 78;

/// Result of demuxing one file.
#[derive(Debug, Clone)]
pub struct ContainerDocument {
    pub track: Track,
    /// Decoder configuration from `avcC`/`av1C`, when present.
    pub config: Option<DecoderConfigRecord>,
    /// Samples in decode order. Timestamps and durations are milliseconds.
    /// H.264 payloads are Annex-B, with SPS/PPS in front of every keyframe.
    pub samples: Vec<CodedFrame>,
    pub fragmented: bool,
}

/// Serializable overview of a [`ContainerDocument`].
#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub track: Track,
    pub fragmented: bool,
    pub sample_count: usize,
    pub keyframe_count: usize,
    pub duration_ms: u64,
    pub total_bytes: usize,
}

impl ContainerDocument {
    /// End of the last sample, in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.samples
            .last()
            .map(|s| s.timestamp + s.duration.unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn keyframe_count(&self) -> usize {
        self.samples.iter().filter(|s| s.is_keyframe).count()
    }

    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            track: self.track.clone(),
            fragmented: self.fragmented,
            sample_count: self.samples.len(),
            keyframe_count: self.keyframe_count(),
            duration_ms: self.duration_ms(),
            total_bytes: self.samples.iter().map(|s| s.data.len()).sum(),
        }
    }
}

/// Stateless MP4 reader.
pub struct Mp4Demuxer;

impl Mp4Demuxer {
    pub fn parse(data: &[u8]) -> Result<ContainerDocument, DemuxError> {
        Self::parse_bytes(Bytes::copy_from_slice(data))
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<ContainerDocument, DemuxError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Self::parse_bytes(Bytes::from(data))
    }

    pub fn open(path: impl AsRef<Path>) -> Result<ContainerDocument, DemuxError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "opening mp4");
        Self::read_from(BufReader::new(File::open(path)?))
    }

    /// Parse a whole file held in memory. AV1 samples share `data`'s storage.
    pub fn parse_bytes(data: Bytes) -> Result<ContainerDocument, DemuxError> {
        let file_len = data.len() as u64;

        let mut moov = None;
        let mut moofs = Vec::new();
        for item in BoxIter::new(&data, 0) {
            let b = item?;
            match b.kind {
                kind::MOOV if moov.is_none() => moov = Some(b),
                kind::MOOF => moofs.push(b),
                _ => {}
            }
        }
        let moov = moov.ok_or_else(|| DemuxError::format("no moov box"))?;
        let trak = mp4_box::find_video_trak(&moov)?.ok_or(DemuxError::NoVideoTrack)?;

        let info = TrackInfo::parse(&trak)?;
        let stbl = trak
            .descend(&[kind::MDIA, kind::MINF, kind::STBL])?
            .ok_or_else(|| DemuxError::format("video track has no stbl"))?;

        let mut raw = SampleTable::parse(&stbl, file_len)?.resolve()?;
        let progressive_count = raw.len();

        if !moofs.is_empty() {
            let trex = TrackDefaults::from_moov(&moov, info.track.track_id)?;
            let start_time = match raw.last() {
                Some(s) => s
                    .decode_time
                    .checked_add(u64::from(s.duration))
                    .ok_or_else(|| DemuxError::format("progressive decode time overflows"))?,
                None => 0,
            };
            let mut reader = FragmentReader::new(info.track.track_id, trex, file_len, start_time);
            for moof in &moofs {
                reader.read_moof(moof, &mut raw)?;
            }
        }

        debug!(
            codec = ?info.track.codec,
            progressive = progressive_count,
            fragmented = raw.len() - progressive_count,
            moofs = moofs.len(),
            "mp4 sample layout resolved"
        );

        let samples = info.build_frames(&data, &raw)?;
        Ok(ContainerDocument {
            track: info.track,
            config: info.config,
            samples,
            fragmented: !moofs.is_empty(),
        })
    }
}

/// Everything the sample builder needs about the video track.
struct TrackInfo {
    track: Track,
    config: Option<DecoderConfigRecord>,
    avc: Option<AvcDecoderConfig>,
}

impl TrackInfo {
    fn parse(trak: &Mp4Box<'_>) -> Result<Self, DemuxError> {
        let track_id = match trak.child(kind::TKHD)? {
            Some(tkhd) => {
                let (version, _, mut r) = tkhd.full_box()?;
                r.skip(if version == 1 { 16 } else { 8 })?;
                r.u32()?
            }
            None => return Err(DemuxError::format("video track has no tkhd")),
        };

        let mdhd = trak
            .descend(&[kind::MDIA, kind::MDHD])?
            .ok_or_else(|| DemuxError::format("video track has no mdhd"))?;
        let (version, _, mut r) = mdhd.full_box()?;
        r.skip(if version == 1 { 16 } else { 8 })?;
        let timescale = r.u32()?;
        if timescale == 0 {
            return Err(DemuxError::format("mdhd timescale is zero"));
        }

        let stsd = trak
            .descend(&[kind::MDIA, kind::MINF, kind::STBL, kind::STSD])?
            .ok_or_else(|| DemuxError::format("video track has no stsd"))?;
        let entry = mp4_box::first_sample_entry(&stsd)?;
        let codec = DetectedCodec::from_fourcc(&entry.kind);

        let mut r = entry.reader();
        r.skip(24)?;
        let width = u32::from(r.u16()?);
        let height = u32::from(r.u16()?);

        let mut config = None;
        let mut avc = None;
        if entry.payload.len() > VISUAL_SAMPLE_ENTRY_LEN {
            let children = BoxIter::new(
                &entry.payload[VISUAL_SAMPLE_ENTRY_LEN..],
                entry.payload_offset + VISUAL_SAMPLE_ENTRY_LEN as u64,
            );
            for item in children {
                let b = item?;
                match (codec, b.kind) {
                    (DetectedCodec::H264, kind::AVCC) => {
                        let parsed = AvcDecoderConfig::parse(b.payload)
                            .ok_or_else(|| DemuxError::format("malformed avcC record"))?;
                        if let (Some(sps), Some(pps)) = (parsed.sps.first(), parsed.pps.first()) {
                            config = Some(DecoderConfigRecord::Avc {
                                sps: sps.clone(),
                                pps: pps.clone(),
                            });
                        }
                        avc = Some(parsed);
                    }
                    (DetectedCodec::Av1, kind::AV1C) => {
                        config = Some(DecoderConfigRecord::Av1 {
                            sequence_header: b.payload.get(4..).unwrap_or_default().to_vec(),
                        });
                    }
                    _ => {}
                }
            }
        }

        if codec == DetectedCodec::H264 && avc.is_none() {
            debug!("H.264 track without avcC; assuming 4-byte NAL lengths and in-band parameter sets");
        }

        Ok(Self {
            track: Track {
                codec,
                width,
                height,
                timescale,
                track_id,
            },
            config,
            avc,
        })
    }

    fn to_ms(&self, ticks: u64) -> u64 {
        let ms = u128::from(ticks) * 1000 / u128::from(self.track.timescale);
        u64::try_from(ms).unwrap_or(u64::MAX)
    }

    fn build_frames(&self, data: &Bytes, raw: &[RawSample]) -> Result<Vec<CodedFrame>, DemuxError> {
        let (nal_length_size, parameter_sets) = match &self.avc {
            Some(avc) => (avc.nal_length_size, avc.to_annexb()),
            None => (4, Vec::new()),
        };

        let mut frames = Vec::with_capacity(raw.len());
        for (index, sample) in raw.iter().enumerate() {
            let end = sample
                .offset
                .checked_add(u64::from(sample.size))
                .filter(|&end| end <= data.len() as u64)
                .ok_or_else(|| {
                    DemuxError::format(format!(
                        "sample {index} at offset {} ({} bytes) lies outside the file",
                        sample.offset, sample.size
                    ))
                })?;
            let payload = data.slice(sample.offset as usize..end as usize);

            let payload = match self.track.codec {
                DetectedCodec::H264 => {
                    let annexb = avcc_to_annexb_sized(&payload, nal_length_size);
                    if sample.is_sync && !parameter_sets.is_empty() {
                        let mut with_config = Vec::with_capacity(parameter_sets.len() + annexb.len());
                        with_config.extend_from_slice(&parameter_sets);
                        with_config.extend_from_slice(&annexb);
                        Bytes::from(with_config)
                    } else {
                        Bytes::from(annexb)
                    }
                }
                _ => payload,
            };

            frames.push(
                CodedFrame::new(payload, self.to_ms(sample.decode_time), sample.is_sync)
                    .with_duration(self.to_ms(u64::from(sample.duration))),
            );
        }
        Ok(frames)
    }
}
