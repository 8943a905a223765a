//! ISO BMFF box primitives shared by the muxer, demuxer and codec detector.
//!
//! Reading works over an in-memory buffer: [`BoxIter`] walks sibling boxes
//! lazily and [`ByteReader`] does bounds-checked big-endian reads. Writing
//! goes through [`BoxWriter`], which back-patches box sizes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::ops::{Deref, DerefMut};

use crate::error::{DemuxError, MuxError};

pub type FourCC = [u8; 4];

/// Box types used by this crate
pub mod kind {
    use super::FourCC;

    pub const FTYP: FourCC = *b"ftyp";
    pub const MOOV: FourCC = *b"moov";
    pub const MVHD: FourCC = *b"mvhd";
    pub const MVEX: FourCC = *b"mvex";
    pub const MEHD: FourCC = *b"mehd";
    pub const TREX: FourCC = *b"trex";
    pub const TRAK: FourCC = *b"trak";
    pub const TKHD: FourCC = *b"tkhd";
    pub const MDIA: FourCC = *b"mdia";
    pub const MDHD: FourCC = *b"mdhd";
    pub const HDLR: FourCC = *b"hdlr";
    pub const MINF: FourCC = *b"minf";
    pub const VMHD: FourCC = *b"vmhd";
    pub const DINF: FourCC = *b"dinf";
    pub const DREF: FourCC = *b"dref";
    pub const URL: FourCC = *b"url ";
    pub const STBL: FourCC = *b"stbl";
    pub const STSD: FourCC = *b"stsd";
    pub const STTS: FourCC = *b"stts";
    pub const STSC: FourCC = *b"stsc";
    pub const STSZ: FourCC = *b"stsz";
    pub const STCO: FourCC = *b"stco";
    pub const CO64: FourCC = *b"co64";
    pub const STSS: FourCC = *b"stss";
    pub const MOOF: FourCC = *b"moof";
    pub const MFHD: FourCC = *b"mfhd";
    pub const TRAF: FourCC = *b"traf";
    pub const TFHD: FourCC = *b"tfhd";
    pub const TFDT: FourCC = *b"tfdt";
    pub const TRUN: FourCC = *b"trun";
    pub const MDAT: FourCC = *b"mdat";

    pub const AVC1: FourCC = *b"avc1";
    pub const AVC3: FourCC = *b"avc3";
    pub const AVCC: FourCC = *b"avcC";
    pub const AV01: FourCC = *b"av01";
    pub const AV1C: FourCC = *b"av1C";

    pub const VIDE: FourCC = *b"vide";
}

/// Render a fourcc for messages, replacing non-printable bytes.
pub fn fourcc_str(cc: &FourCC) -> String {
    cc.iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
        .collect()
}

// ============================================================================
// Reading
// ============================================================================

/// One box located inside a buffer.
#[derive(Debug, Clone, Copy)]
pub struct Mp4Box<'a> {
    pub kind: FourCC,
    /// Absolute offset of the box header in the file.
    pub offset: u64,
    /// Absolute offset of the first payload byte.
    pub payload_offset: u64,
    pub payload: &'a [u8],
}

impl<'a> Mp4Box<'a> {
    pub fn children(&self) -> BoxIter<'a> {
        BoxIter::new(self.payload, self.payload_offset)
    }

    /// First direct child of the given type.
    pub fn child(&self, kind: FourCC) -> Result<Option<Mp4Box<'a>>, DemuxError> {
        find_box(self.children(), kind)
    }

    /// Walk a path of nested boxes, e.g. `[MDIA, MINF, STBL]`.
    pub fn descend(&self, path: &[FourCC]) -> Result<Option<Mp4Box<'a>>, DemuxError> {
        let mut current = *self;
        for &kind in path {
            match current.child(kind)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    pub fn reader(&self) -> ByteReader<'a> {
        ByteReader::new(self.payload, self.kind)
    }

    /// Split a full box payload into (version, flags, remaining reader).
    pub fn full_box(&self) -> Result<(u8, u32, ByteReader<'a>), DemuxError> {
        let mut reader = self.reader();
        let word = reader.u32()?;
        Ok(((word >> 24) as u8, word & 0x00FF_FFFF, reader))
    }
}

pub fn find_box<'a>(
    iter: BoxIter<'a>,
    kind: FourCC,
) -> Result<Option<Mp4Box<'a>>, DemuxError> {
    for item in iter {
        let b = item?;
        if b.kind == kind {
            return Ok(Some(b));
        }
    }
    Ok(None)
}

/// Lazy iterator over sibling boxes.
///
/// A size-0 box extends to the end of the enclosing range. The first
/// malformed header is reported once and ends the iteration.
#[derive(Debug, Clone)]
pub struct BoxIter<'a> {
    data: &'a [u8],
    base: u64,
    pos: usize,
    failed: bool,
}

impl<'a> BoxIter<'a> {
    /// `base` is the absolute file offset of `data[0]`.
    pub fn new(data: &'a [u8], base: u64) -> Self {
        Self {
            data,
            base,
            pos: 0,
            failed: false,
        }
    }

    fn parse_next(&self) -> Result<(Mp4Box<'a>, usize), DemuxError> {
        let rest = &self.data[self.pos..];
        let offset = self.base + self.pos as u64;
        if rest.len() < 8 {
            return Err(DemuxError::format(format!(
                "truncated box header at offset {offset}"
            )));
        }

        let mut cursor = rest;
        let size32 = cursor.get_u32();
        let mut kind = [0u8; 4];
        cursor.copy_to_slice(&mut kind);

        let (size, header_len) = match size32 {
            0 => (rest.len() as u64, 8usize),
            1 => {
                if cursor.remaining() < 8 {
                    return Err(DemuxError::format(format!(
                        "truncated 64-bit size for '{}' at offset {offset}",
                        fourcc_str(&kind)
                    )));
                }
                (cursor.get_u64(), 16usize)
            }
            n => (u64::from(n), 8usize),
        };

        if size < header_len as u64 {
            return Err(DemuxError::format(format!(
                "box '{}' at offset {offset} has invalid size {size}",
                fourcc_str(&kind)
            )));
        }
        if size > rest.len() as u64 {
            return Err(DemuxError::format(format!(
                "box '{}' at offset {offset} declares {size} bytes but only {} remain",
                fourcc_str(&kind),
                rest.len()
            )));
        }

        let size = size as usize;
        Ok((
            Mp4Box {
                kind,
                offset,
                payload_offset: offset + header_len as u64,
                payload: &rest[header_len..size],
            },
            size,
        ))
    }
}

impl<'a> Iterator for BoxIter<'a> {
    type Item = Result<Mp4Box<'a>, DemuxError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.data.len() {
            return None;
        }
        match self.parse_next() {
            Ok((b, size)) => {
                self.pos += size;
                Some(Ok(b))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Bounds-checked big-endian reader over a box payload.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    kind: FourCC,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8], kind: FourCC) -> Self {
        Self { buf, kind }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn ensure(&self, n: usize) -> Result<(), DemuxError> {
        if self.buf.len() < n {
            return Err(DemuxError::format(format!(
                "'{}' payload truncated: needed {n} bytes, {} left",
                fourcc_str(&self.kind),
                self.buf.len()
            )));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, DemuxError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16, DemuxError> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn u32(&mut self) -> Result<u32, DemuxError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn i32(&mut self) -> Result<i32, DemuxError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn u64(&mut self) -> Result<u64, DemuxError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn fourcc(&mut self) -> Result<FourCC, DemuxError> {
        self.ensure(4)?;
        let mut cc = [0u8; 4];
        self.buf.copy_to_slice(&mut cc);
        Ok(cc)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), DemuxError> {
        self.ensure(n)?;
        self.buf.advance(n);
        Ok(())
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], DemuxError> {
        self.ensure(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    /// Capacity hint for `count` entries of `entry_size` bytes that never
    /// exceeds what the payload can actually hold.
    pub fn capacity_for(&self, count: u32, entry_size: usize) -> usize {
        (count as usize).min(self.buf.len() / entry_size.max(1))
    }
}

// ============================================================================
// Shared navigation
// ============================================================================

/// Handler type of a `trak` (from `mdia/hdlr`).
pub fn handler_type(trak: &Mp4Box<'_>) -> Result<Option<FourCC>, DemuxError> {
    let Some(hdlr) = trak.descend(&[kind::MDIA, kind::HDLR])? else {
        return Ok(None);
    };
    let (_, _, mut r) = hdlr.full_box()?;
    r.skip(4)?; // pre_defined
    Ok(Some(r.fourcc()?))
}

/// First `trak` of `moov` whose handler is `vide`.
pub fn find_video_trak<'a>(moov: &Mp4Box<'a>) -> Result<Option<Mp4Box<'a>>, DemuxError> {
    for item in moov.children() {
        let b = item?;
        if b.kind == kind::TRAK && handler_type(&b)? == Some(kind::VIDE) {
            return Ok(Some(b));
        }
    }
    Ok(None)
}

/// First sample entry inside `stsd`.
pub fn first_sample_entry<'a>(stsd: &Mp4Box<'a>) -> Result<Mp4Box<'a>, DemuxError> {
    let (_, _, mut r) = stsd.full_box()?;
    let entry_count = r.u32()?;
    if entry_count == 0 {
        return Err(DemuxError::format("stsd has no sample entries"));
    }
    let entries_offset = stsd.payload_offset + 8;
    BoxIter::new(r.bytes(r.remaining())?, entries_offset)
        .next()
        .unwrap_or_else(|| Err(DemuxError::format("stsd entry list is empty")))
}

// ============================================================================
// Writing
// ============================================================================

/// Byte buffer that knows how to open and close boxes.
///
/// Derefs to [`BytesMut`], so `BufMut` methods write payload fields directly.
#[derive(Debug, Default)]
pub struct BoxWriter {
    buf: BytesMut,
}

impl BoxWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Open a plain box; returns its start position for [`BoxWriter::end`].
    pub fn begin(&mut self, kind: FourCC) -> usize {
        let start = self.buf.len();
        self.buf.put_u32(0);
        self.buf.put_slice(&kind);
        start
    }

    /// Open a full box (version + 24-bit flags).
    pub fn begin_full(&mut self, kind: FourCC, version: u8, flags: u32) -> usize {
        let start = self.begin(kind);
        self.buf.put_u32((u32::from(version) << 24) | (flags & 0x00FF_FFFF));
        start
    }

    /// Close the box opened at `start`, writing its final size.
    pub fn end(&mut self, start: usize) -> Result<(), MuxError> {
        let size = self.buf.len() - start;
        let size32 = u32::try_from(size).map_err(|_| MuxError::BoxTooLarge {
            kind: fourcc_str(&self.kind_at(start)),
            size,
        })?;
        self.patch_u32(start, size32);
        Ok(())
    }

    pub fn patch_u32(&mut self, pos: usize, value: u32) {
        self.buf[pos..pos + 4].copy_from_slice(&value.to_be_bytes());
    }

    pub fn put_zeros(&mut self, n: usize) {
        self.buf.put_bytes(0, n);
    }

    fn kind_at(&self, start: usize) -> FourCC {
        let mut cc = [0u8; 4];
        cc.copy_from_slice(&self.buf[start + 4..start + 8]);
        cc
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

impl Deref for BoxWriter {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for BoxWriter {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_basic_box_header() {
        let data = b"\x00\x00\x00\x0cfree\xAA\xBB\xCC\xDD";
        let b = BoxIter::new(data, 100).next().unwrap().unwrap();
        assert_eq!(b.kind, *b"free");
        assert_eq!(b.offset, 100);
        assert_eq!(b.payload_offset, 108);
        assert_eq!(b.payload, &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn test_parses_extended_box_header() {
        let mut data = b"\x00\x00\x00\x01mdat\x00\x00\x00\x00\x00\x00\x00\x12".to_vec();
        data.extend_from_slice(&[1, 2]);
        let b = BoxIter::new(&data, 0).next().unwrap().unwrap();
        assert_eq!(b.kind, kind::MDAT);
        assert_eq!(b.payload, &[1, 2]);
    }

    #[test]
    fn test_zero_sized_box_extends_to_end() {
        let data = b"\x00\x00\x00\x00mdat\x01\x02\x03";
        let b = BoxIter::new(data, 0).next().unwrap().unwrap();
        assert_eq!(b.payload, &[1, 2, 3]);
    }

    #[test]
    fn test_rejects_too_small_box() {
        let data = b"\x00\x00\x00\x07free";
        let err = BoxIter::new(data, 0).next().unwrap().unwrap_err();
        assert!(err.to_string().contains("invalid size"));
    }

    #[test]
    fn test_rejects_box_overrunning_parent() {
        let data = b"\x00\x00\x00\x20moov\x00\x00";
        let mut iter = BoxIter::new(data, 0);
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_reader_reports_truncation() {
        let mut r = ByteReader::new(&[0, 1, 2], kind::STTS);
        assert_eq!(r.u16().unwrap(), 1);
        let err = r.u32().unwrap_err();
        assert!(err.to_string().contains("stts"));
    }

    #[test]
    fn test_writer_patches_nested_sizes() {
        let mut w = BoxWriter::default();
        let outer = w.begin(kind::MOOV);
        let inner = w.begin_full(kind::MVHD, 1, 0x000003);
        w.put_u32(7);
        w.end(inner).unwrap();
        w.end(outer).unwrap();
        let bytes = w.freeze();

        assert_eq!(&bytes[0..8], b"\x00\x00\x00\x18moov");
        assert_eq!(&bytes[8..16], b"\x00\x00\x00\x10mvhd");
        assert_eq!(&bytes[16..20], &[1, 0, 0, 3]);

        let moov = BoxIter::new(&bytes, 0).next().unwrap().unwrap();
        let mvhd = moov.child(kind::MVHD).unwrap().unwrap();
        let (version, flags, mut r) = mvhd.full_box().unwrap();
        assert_eq!((version, flags), (1, 3));
        assert_eq!(r.u32().unwrap(), 7);
    }
}
