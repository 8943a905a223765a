//! Codec detection from container metadata.
//!
//! Only `moov` is inspected; sample data is never touched. For files the
//! reader walks top-level box headers and seeks past everything else, so a
//! large `mdat` is never loaded.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::debug;

use crate::error::DemuxError;
use crate::frame::DetectedCodec;
use crate::mp4_box::{self, kind, BoxIter, Mp4Box};

/// Classify the video track of an in-memory MP4.
pub fn detect_codec(data: &[u8]) -> Result<DetectedCodec, DemuxError> {
    let moov = mp4_box::find_box(BoxIter::new(data, 0), kind::MOOV)?
        .ok_or_else(|| DemuxError::format("no moov box"))?;
    detect_in_moov(&moov)
}

/// Classify the video track of an MP4 file on disk.
pub fn detect_codec_in_file(path: impl AsRef<Path>) -> Result<DetectedCodec, DemuxError> {
    detect_codec_from_reader(BufReader::new(File::open(path)?))
}

/// Classify from any seekable source, reading only the `moov` box.
pub fn detect_codec_from_reader<R: Read + Seek>(mut reader: R) -> Result<DetectedCodec, DemuxError> {
    let moov = read_moov(&mut reader)?;
    let moov_box = mp4_box::find_box(BoxIter::new(&moov, 0), kind::MOOV)?
        .ok_or_else(|| DemuxError::format("no moov box"))?;
    detect_in_moov(&moov_box)
}

fn detect_in_moov(moov: &Mp4Box<'_>) -> Result<DetectedCodec, DemuxError> {
    let trak = mp4_box::find_video_trak(moov)?.ok_or(DemuxError::NoVideoTrack)?;
    let stsd = trak
        .descend(&[kind::MDIA, kind::MINF, kind::STBL, kind::STSD])?
        .ok_or_else(|| DemuxError::format("video track has no stsd"))?;
    let entry = mp4_box::first_sample_entry(&stsd)?;
    let codec = DetectedCodec::from_fourcc(&entry.kind);
    debug!(
        fourcc = %mp4_box::fourcc_str(&entry.kind),
        ?codec,
        "codec detected"
    );
    Ok(codec)
}

/// Seek through top-level boxes and return the whole `moov` box, header included.
fn read_moov<R: Read + Seek>(reader: &mut R) -> Result<Vec<u8>, DemuxError> {
    let file_len = reader.seek(SeekFrom::End(0))?;
    let mut pos = reader.seek(SeekFrom::Start(0))?;

    while pos + 8 <= file_len {
        let mut header = [0u8; 16];
        reader.read_exact(&mut header[..8])?;
        let size32 = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let box_kind = [header[4], header[5], header[6], header[7]];

        let (size, header_len) = match size32 {
            0 => (file_len - pos, 8u64),
            1 => {
                reader.read_exact(&mut header[8..16])?;
                let mut large = [0u8; 8];
                large.copy_from_slice(&header[8..16]);
                (u64::from_be_bytes(large), 16u64)
            }
            n => (u64::from(n), 8u64),
        };
        if size < header_len || size > file_len - pos {
            return Err(DemuxError::format(format!(
                "box '{}' at offset {pos} has invalid size {size}",
                mp4_box::fourcc_str(&box_kind)
            )));
        }

        if box_kind == kind::MOOV {
            let size = usize::try_from(size)
                .map_err(|_| DemuxError::format("moov box too large to load"))?;
            let mut moov = vec![0u8; size];
            moov[..header_len as usize].copy_from_slice(&header[..header_len as usize]);
            reader.read_exact(&mut moov[header_len as usize..])?;
            return Ok(moov);
        }

        pos = reader.seek(SeekFrom::Start(pos + size))?;
    }

    Err(DemuxError::format("no moov box"))
}
