//! Movie fragment (`moof`) parsing.

use tracing::trace;

use crate::error::DemuxError;
use crate::mp4_box::{kind, Mp4Box};

use super::RawSample;

mod tfhd_flags {
    pub const BASE_DATA_OFFSET: u32 = 0x000001;
    pub const SAMPLE_DESCRIPTION_INDEX: u32 = 0x000002;
    pub const DEFAULT_DURATION: u32 = 0x000008;
    pub const DEFAULT_SIZE: u32 = 0x000010;
    pub const DEFAULT_FLAGS: u32 = 0x000020;
    pub const DEFAULT_BASE_IS_MOOF: u32 = 0x020000;
}

mod trun_flags {
    pub const DATA_OFFSET: u32 = 0x000001;
    pub const FIRST_SAMPLE_FLAGS: u32 = 0x000004;
    pub const DURATION: u32 = 0x000100;
    pub const SIZE: u32 = 0x000200;
    pub const FLAGS: u32 = 0x000400;
    pub const COMPOSITION_OFFSET: u32 = 0x000800;
}

/// is_non_sync_sample bit of the sample flags word
const NON_SYNC_BIT: u32 = 0x0001_0000;

/// Per-track defaults from `mvex/trex`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct TrackDefaults {
    pub duration: u32,
    pub size: u32,
    pub flags: u32,
}

impl TrackDefaults {
    /// Read the `trex` for `track_id`; a missing `mvex`/`trex` yields zeros.
    pub(super) fn from_moov(moov: &Mp4Box<'_>, track_id: u32) -> Result<Self, DemuxError> {
        let Some(mvex) = moov.child(kind::MVEX)? else {
            return Ok(Self::default());
        };
        for item in mvex.children() {
            let b = item?;
            if b.kind != kind::TREX {
                continue;
            }
            let (_, _, mut r) = b.full_box()?;
            if r.u32()? != track_id {
                continue;
            }
            r.skip(4)?; // default_sample_description_index
            return Ok(Self {
                duration: r.u32()?,
                size: r.u32()?,
                flags: r.u32()?,
            });
        }
        Ok(Self::default())
    }
}

/// `tfhd` with `trex` fallbacks already applied.
#[derive(Debug)]
struct FragmentHeader {
    track_id: u32,
    base_data_offset: Option<u64>,
    default_base_is_moof: bool,
    defaults: TrackDefaults,
}

fn read_tfhd(tfhd: &Mp4Box<'_>, trex: TrackDefaults) -> Result<FragmentHeader, DemuxError> {
    let (_, flags, mut r) = tfhd.full_box()?;
    let track_id = r.u32()?;

    let base_data_offset = if flags & tfhd_flags::BASE_DATA_OFFSET != 0 {
        Some(r.u64()?)
    } else {
        None
    };
    if flags & tfhd_flags::SAMPLE_DESCRIPTION_INDEX != 0 {
        r.skip(4)?;
    }

    let mut defaults = trex;
    if flags & tfhd_flags::DEFAULT_DURATION != 0 {
        defaults.duration = r.u32()?;
    }
    if flags & tfhd_flags::DEFAULT_SIZE != 0 {
        defaults.size = r.u32()?;
    }
    if flags & tfhd_flags::DEFAULT_FLAGS != 0 {
        defaults.flags = r.u32()?;
    }

    Ok(FragmentHeader {
        track_id,
        base_data_offset,
        default_base_is_moof: flags & tfhd_flags::DEFAULT_BASE_IS_MOOF != 0,
        defaults,
    })
}

/// Position within one `traf` while its runs are read.
#[derive(Debug, Clone, Copy)]
struct RunCursor {
    data: u64,
    decode_time: u64,
}

/// Walks the `moof` boxes of one track, carrying decode time across fragments.
#[derive(Debug)]
pub(super) struct FragmentReader {
    track_id: u32,
    trex: TrackDefaults,
    file_len: u64,
    next_decode_time: u64,
}

impl FragmentReader {
    pub(super) fn new(track_id: u32, trex: TrackDefaults, file_len: u64, start_time: u64) -> Self {
        Self {
            track_id,
            trex,
            file_len,
            next_decode_time: start_time,
        }
    }

    /// Append the samples of `moof` that belong to this track.
    pub(super) fn read_moof(
        &mut self,
        moof: &Mp4Box<'_>,
        out: &mut Vec<RawSample>,
    ) -> Result<(), DemuxError> {
        // without an explicit base, a traf's data follows the previous traf's
        let mut data_end = moof.offset;
        for item in moof.children() {
            let traf = item?;
            if traf.kind != kind::TRAF {
                continue;
            }
            data_end = self.read_traf(moof, &traf, data_end, out)?;
        }
        Ok(())
    }

    /// Returns the end of the data this traf describes.
    fn read_traf(
        &mut self,
        moof: &Mp4Box<'_>,
        traf: &Mp4Box<'_>,
        previous_end: u64,
        out: &mut Vec<RawSample>,
    ) -> Result<u64, DemuxError> {
        let Some(tfhd) = traf.child(kind::TFHD)? else {
            return Err(DemuxError::format(format!(
                "traf at offset {} has no tfhd",
                traf.offset
            )));
        };
        let header = read_tfhd(&tfhd, self.trex)?;
        let base = match header.base_data_offset {
            Some(offset) => offset,
            None if header.default_base_is_moof => moof.offset,
            None => previous_end,
        };

        if header.track_id != self.track_id {
            // other tracks' runs are still walked so the next traf's base is known
            let mut cursor = RunCursor {
                data: base,
                decode_time: 0,
            };
            let mut skipped = Vec::new();
            for item in traf.children() {
                let trun = item?;
                if trun.kind == kind::TRUN {
                    self.read_trun(&trun, &header, base, &mut cursor, &mut skipped)?;
                }
            }
            trace!(
                track_id = header.track_id,
                samples = skipped.len(),
                "skipping fragment for other track"
            );
            return Ok(cursor.data);
        }

        if let Some(tfdt) = traf.child(kind::TFDT)? {
            let (version, _, mut r) = tfdt.full_box()?;
            self.next_decode_time = if version == 1 {
                r.u64()?
            } else {
                u64::from(r.u32()?)
            };
        }

        let mut cursor = RunCursor {
            data: base,
            decode_time: self.next_decode_time,
        };
        let before = out.len();
        for item in traf.children() {
            let trun = item?;
            if trun.kind == kind::TRUN {
                self.read_trun(&trun, &header, base, &mut cursor, out)?;
            }
        }
        self.next_decode_time = cursor.decode_time;

        trace!(
            moof_offset = moof.offset,
            samples = out.len() - before,
            "track fragment read"
        );
        Ok(cursor.data)
    }

    fn read_trun(
        &self,
        trun: &Mp4Box<'_>,
        header: &FragmentHeader,
        base: u64,
        cursor: &mut RunCursor,
        out: &mut Vec<RawSample>,
    ) -> Result<(), DemuxError> {
        let (_, flags, mut r) = trun.full_box()?;
        let sample_count = r.u32()?;

        if flags & trun_flags::DATA_OFFSET != 0 {
            let offset = i64::from(r.i32()?);
            cursor.data = base.checked_add_signed(offset).ok_or_else(|| {
                DemuxError::format(format!("trun data offset {offset} points outside the file"))
            })?;
        }
        let first_sample_flags = if flags & trun_flags::FIRST_SAMPLE_FLAGS != 0 {
            Some(r.u32()?)
        } else {
            None
        };

        let per_sample_fields = [
            trun_flags::DURATION,
            trun_flags::SIZE,
            trun_flags::FLAGS,
            trun_flags::COMPOSITION_OFFSET,
        ]
        .iter()
        .filter(|&&f| flags & f != 0)
        .count();

        if per_sample_fields == 0 {
            let declared = u64::from(sample_count) * u64::from(header.defaults.size);
            if sample_count > 0 && (header.defaults.size == 0 || declared > self.file_len) {
                return Err(DemuxError::format(format!(
                    "trun declares {sample_count} samples without usable sizes"
                )));
            }
        }

        out.reserve(if per_sample_fields == 0 {
            (sample_count as usize).min(4096)
        } else {
            r.capacity_for(sample_count, per_sample_fields * 4)
        });

        for i in 0..sample_count {
            let duration = if flags & trun_flags::DURATION != 0 {
                r.u32()?
            } else {
                header.defaults.duration
            };
            let size = if flags & trun_flags::SIZE != 0 {
                r.u32()?
            } else {
                header.defaults.size
            };
            let sample_flags = if flags & trun_flags::FLAGS != 0 {
                r.u32()?
            } else if i == 0 {
                first_sample_flags.unwrap_or(header.defaults.flags)
            } else {
                header.defaults.flags
            };
            if flags & trun_flags::COMPOSITION_OFFSET != 0 {
                r.skip(4)?;
            }

            out.push(RawSample {
                offset: cursor.data,
                size,
                decode_time: cursor.decode_time,
                duration,
                is_sync: sample_flags & NON_SYNC_BIT == 0,
            });
            cursor.data = cursor.data.checked_add(u64::from(size)).ok_or_else(|| {
                DemuxError::format(format!(
                    "trun sample {i} at offset {} overflows the file offset range",
                    cursor.data
                ))
            })?;
            cursor.decode_time = cursor
                .decode_time
                .checked_add(u64::from(duration))
                .ok_or_else(|| {
                    DemuxError::format(format!(
                        "trun sample {i} decode time {} overflows",
                        cursor.decode_time
                    ))
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mp4_box::{BoxIter, BoxWriter};
    use bytes::BufMut;

    struct Traf<'a> {
        track_id: u32,
        tfhd_flags: u32,
        tfhd_fields: &'a [u32],
        tfdt: Option<u64>,
        trun_flags: u32,
        trun_fields: &'a [u32],
    }

    fn moof(trafs: &[Traf<'_>]) -> Vec<u8> {
        let mut w = BoxWriter::default();
        let moof = w.begin(kind::MOOF);
        for t in trafs {
            let traf = w.begin(kind::TRAF);
            let tfhd = w.begin_full(kind::TFHD, 0, t.tfhd_flags);
            w.put_u32(t.track_id);
            for &f in t.tfhd_fields {
                w.put_u32(f);
            }
            w.end(tfhd).unwrap();
            if let Some(time) = t.tfdt {
                match u32::try_from(time) {
                    Ok(time) => {
                        let tfdt = w.begin_full(kind::TFDT, 0, 0);
                        w.put_u32(time);
                        w.end(tfdt).unwrap();
                    }
                    Err(_) => {
                        let tfdt = w.begin_full(kind::TFDT, 1, 0);
                        w.put_u64(time);
                        w.end(tfdt).unwrap();
                    }
                }
            }
            let trun = w.begin_full(kind::TRUN, 0, t.trun_flags);
            for &f in t.trun_fields {
                w.put_u32(f);
            }
            w.end(trun).unwrap();
            w.end(traf).unwrap();
        }
        w.end(moof).unwrap();
        w.freeze().to_vec()
    }

    fn moof_with(tfhd_flags: u32, tfhd_fields: &[u32], trun_flags: u32, trun_fields: &[u32]) -> Vec<u8> {
        moof(&[Traf {
            track_id: 1,
            tfhd_flags,
            tfhd_fields,
            tfdt: Some(9_000),
            trun_flags,
            trun_fields,
        }])
    }

    fn read_result(data: &[u8], trex: TrackDefaults) -> Result<Vec<RawSample>, DemuxError> {
        let moof = BoxIter::new(data, 0).next().unwrap().unwrap();
        let mut reader = FragmentReader::new(1, trex, 1 << 20, 0);
        let mut out = Vec::new();
        reader.read_moof(&moof, &mut out)?;
        Ok(out)
    }

    fn read(data: &[u8], trex: TrackDefaults) -> Vec<RawSample> {
        read_result(data, trex).unwrap()
    }

    #[test]
    fn test_explicit_sample_fields() {
        // count, data_offset, then (duration, size, flags) x2
        let data = moof_with(
            0x020000,
            &[],
            0x000701,
            &[2, 200, 1000, 10, 0x0200_0000, 1000, 20, 0x0101_0000],
        );
        let samples = read(&data, TrackDefaults::default());
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].offset, 200);
        assert_eq!(samples[1].offset, 210);
        assert_eq!(samples[0].decode_time, 9_000);
        assert_eq!(samples[1].decode_time, 10_000);
        assert!(samples[0].is_sync);
        assert!(!samples[1].is_sync);
    }

    #[test]
    fn test_tfhd_defaults_and_first_sample_flags() {
        // tfhd: default duration, size, flags
        let data = moof_with(
            0x000038,
            &[512, 40, 0x0101_0000],
            0x000005,
            &[3, 100, 0x0200_0000],
        );
        let samples = read(&data, TrackDefaults::default());
        let sync: Vec<bool> = samples.iter().map(|s| s.is_sync).collect();
        assert_eq!(sync, vec![true, false, false]);
        assert_eq!(samples[2].offset, 180);
        assert_eq!(samples[2].decode_time, 9_000 + 1024);
    }

    #[test]
    fn test_trex_defaults_apply() {
        let trex = TrackDefaults {
            duration: 3_000,
            size: 8,
            flags: 0,
        };
        let data = moof_with(0x020000, &[], 0x000001, &[2, 64]);
        let samples = read(&data, trex);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].offset, 72);
        assert_eq!(samples[1].decode_time, 12_000);
        assert!(samples.iter().all(|s| s.is_sync));
    }

    #[test]
    fn test_other_track_skipped() {
        let data = moof_with(0x020000, &[], 0x000301, &[1, 0, 100, 4]);
        let moof = BoxIter::new(&data, 0).next().unwrap().unwrap();
        let mut reader = FragmentReader::new(7, TrackDefaults::default(), 1 << 20, 0);
        let mut out = Vec::new();
        reader.read_moof(&moof, &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_sizeless_samples_rejected() {
        let data = moof_with(0x020000, &[], 0x000000, &[1_000_000]);
        let moof = BoxIter::new(&data, 0).next().unwrap().unwrap();
        let mut reader = FragmentReader::new(1, TrackDefaults::default(), 1 << 20, 0);
        assert!(reader.read_moof(&moof, &mut Vec::new()).is_err());
    }

    #[test]
    fn test_base_data_offset_overflow_is_format_error() {
        let base = u64::MAX - 4;
        let data = moof_with(
            0x000001,
            &[(base >> 32) as u32, base as u32],
            0x000300,
            &[2, 100, 10, 100, 10],
        );
        let err = read_result(&data, TrackDefaults::default()).unwrap_err();
        assert!(matches!(err, DemuxError::ContainerFormat { .. }));
    }

    #[test]
    fn test_decode_time_overflow_is_format_error() {
        let data = moof(&[Traf {
            track_id: 1,
            tfhd_flags: 0x020000,
            tfhd_fields: &[],
            tfdt: Some(u64::MAX - 50),
            trun_flags: 0x000300,
            trun_fields: &[2, 100, 10, 100, 10],
        }]);
        let err = read_result(&data, TrackDefaults::default()).unwrap_err();
        assert!(matches!(err, DemuxError::ContainerFormat { .. }));
    }

    #[test]
    fn test_traf_without_base_follows_previous_traf() {
        // track 2 owns 30 bytes from the moof start, track 1's data follows
        let data = moof(&[
            Traf {
                track_id: 2,
                tfhd_flags: 0,
                tfhd_fields: &[],
                tfdt: None,
                trun_flags: 0x000201,
                trun_fields: &[2, 8, 10, 20],
            },
            Traf {
                track_id: 1,
                tfhd_flags: 0,
                tfhd_fields: &[],
                tfdt: Some(0),
                trun_flags: 0x000300,
                trun_fields: &[2, 500, 4, 500, 6],
            },
        ]);
        let samples = read(&data, TrackDefaults::default());
        let offsets: Vec<u64> = samples.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![38, 42]);
    }

    #[test]
    fn test_default_base_is_moof_restarts_each_traf() {
        let data = moof(&[
            Traf {
                track_id: 2,
                tfhd_flags: 0x020000,
                tfhd_fields: &[],
                tfdt: None,
                trun_flags: 0x000201,
                trun_fields: &[1, 8, 10],
            },
            Traf {
                track_id: 1,
                tfhd_flags: 0x020000,
                tfhd_fields: &[],
                tfdt: None,
                trun_flags: 0x000201,
                trun_fields: &[1, 18, 4],
            },
        ]);
        assert_eq!(read(&data, TrackDefaults::default())[0].offset, 18);
    }

    #[test]
    fn test_missing_tfdt_continues_clock() {
        let first = moof_with(0x020000, &[], 0x000301, &[2, 0, 1000, 4, 1000, 4]);
        let second = moof(&[Traf {
            track_id: 1,
            tfhd_flags: 0x020000,
            tfhd_fields: &[],
            tfdt: None,
            trun_flags: 0x000301,
            trun_fields: &[1, 0, 1000, 4],
        }]);
        let mut reader = FragmentReader::new(1, TrackDefaults::default(), 1 << 20, 0);
        let mut out = Vec::new();
        for data in [&first, &second] {
            let moof = BoxIter::new(data, 0).next().unwrap().unwrap();
            reader.read_moof(&moof, &mut out).unwrap();
        }
        let times: Vec<u64> = out.iter().map(|s| s.decode_time).collect();
        assert_eq!(times, vec![9_000, 10_000, 11_000]);
    }
}
