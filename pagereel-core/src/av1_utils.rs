//! AV1 OBU utilities
//!
//! AV1 has no start codes: a temporal unit is a run of OBUs, each with a
//! 1-2 byte header and (usually) a LEB128 size. The only thing the container
//! needs from the stream is the sequence header OBU for `av1C`.

use std::ops::Range;

use crate::error::BitstreamError;

/// AV1 OBU type constants.
pub mod obu_type {
    pub const SEQUENCE_HEADER: u8 = 1;
    pub const TEMPORAL_DELIMITER: u8 = 2;
    pub const FRAME_HEADER: u8 = 3;
    pub const TILE_GROUP: u8 = 4;
    pub const METADATA: u8 = 5;
    pub const FRAME: u8 = 6;
    pub const PADDING: u8 = 15;
}

/// LEB128 values longer than this are cut off.
const MAX_LEB128_BYTES: usize = 8;

/// Decode a LEB128 integer starting at `offset`.
///
/// Returns the value and the offset just past it, or `None` if the buffer
/// ends before the last byte. At most eight bytes are consumed.
pub fn decode_leb128(buf: &[u8], offset: usize) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for i in 0..MAX_LEB128_BYTES {
        let byte = *buf.get(offset + i)?;
        value |= u64::from(byte & 0x7F) << (i * 7);
        if byte & 0x80 == 0 {
            return Some((value, offset + i + 1));
        }
    }
    Some((value, offset + MAX_LEB128_BYTES))
}

/// One parsed OBU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Obu {
    pub obu_type: u8,
    pub has_extension: bool,
    pub has_size: bool,
    /// Whole OBU, header included.
    pub span: Range<usize>,
    /// Payload only.
    pub payload: Range<usize>,
}

/// Lazy iterator over the OBUs of a buffer.
///
/// Yields an error for the first malformed OBU and then stops.
#[derive(Debug, Clone)]
pub struct ObuIter<'a> {
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> ObuIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            failed: false,
        }
    }

    fn parse_at(&self, start: usize) -> Result<Obu, BitstreamError> {
        let header = self.data[start];
        if header & 0x80 != 0 {
            return Err(BitstreamError::ForbiddenBit { offset: start });
        }
        let obu_type = (header >> 3) & 0x0F;
        let has_extension = header & 0x04 != 0;
        let has_size = header & 0x02 != 0;

        let mut cursor = start + 1;
        if has_extension {
            if cursor >= self.data.len() {
                return Err(BitstreamError::TruncatedObuHeader { offset: start });
            }
            cursor += 1;
        }

        let end = if has_size {
            let (size, payload_start) = decode_leb128(self.data, cursor)
                .ok_or(BitstreamError::TruncatedLeb128 { offset: cursor })?;
            cursor = payload_start;
            let available = self.data.len() - cursor;
            if size > available as u64 {
                return Err(BitstreamError::ObuOverrun {
                    offset: start,
                    declared: size,
                    available,
                });
            }
            cursor + size as usize
        } else {
            self.data.len()
        };

        Ok(Obu {
            obu_type,
            has_extension,
            has_size,
            span: start..end,
            payload: cursor..end,
        })
    }
}

impl<'a> Iterator for ObuIter<'a> {
    type Item = Result<Obu, BitstreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }
        match self.parse_at(self.offset) {
            Ok(obu) => {
                self.offset = obu.span.end;
                Some(Ok(obu))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Return the first sequence header OBU, header included.
///
/// `None` when the stream has no sequence header before its first malformed
/// OBU (or at all). That is not an error here; callers decide.
pub fn extract_av1_sequence_header(data: &[u8]) -> Option<&[u8]> {
    ObuIter::new(data)
        .map_while(Result::ok)
        .find(|obu| obu.obu_type == obu_type::SEQUENCE_HEADER)
        .map(|obu| &data[obu.span])
}

/// Treat a temporal unit carrying a sequence header as a random access point.
pub fn is_av1_keyframe(data: &[u8]) -> bool {
    extract_av1_sequence_header(data).is_some()
}

/// Cut a low-overhead OBU stream into temporal units at each temporal
/// delimiter. A stream without delimiters comes back as a single unit.
pub fn split_av1_temporal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut unit_start = 0;

    for obu in ObuIter::new(data).map_while(Result::ok) {
        if obu.obu_type == obu_type::TEMPORAL_DELIMITER && obu.span.start > unit_start {
            units.push(&data[unit_start..obu.span.start]);
            unit_start = obu.span.start;
        }
    }
    if unit_start < data.len() {
        units.push(&data[unit_start..]);
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_leb128() {
        assert_eq!(decode_leb128(&[0x03], 0), Some((3, 1)));
        assert_eq!(decode_leb128(&[0xFF, 0x96, 0x80, 0x80, 0x00], 1), Some((22, 5)));
        assert_eq!(decode_leb128(&[0xE5, 0x8E, 0x26], 0), Some((624_485, 3)));
        assert_eq!(decode_leb128(&[0x80, 0x80], 0), None);
    }

    #[test]
    fn test_decode_leb128_caps_at_eight_bytes() {
        let buf = [0xFF; 12];
        let (_, next) = decode_leb128(&buf, 0).expect("capped value");
        assert_eq!(next, 8);
    }

    #[test]
    fn test_sequence_header_full_slice() {
        // type=1, has_size=1, size=3
        let data = [0x0A, 0x03, 0xAA, 0xBB, 0xCC];
        assert_eq!(extract_av1_sequence_header(&data), Some(&data[..]));
    }

    #[test]
    fn test_sequence_header_after_other_obus() {
        let data = [
            0x12, 0x00, // temporal delimiter, size 0
            0x0A, 0x02, 0x01, 0x02, // sequence header, size 2
            0x32, 0x01, 0xFF, // frame, size 1
        ];
        assert_eq!(extract_av1_sequence_header(&data), Some(&data[2..6]));
    }

    #[test]
    fn test_no_sequence_header() {
        let data = [0x12, 0x00, 0x32, 0x02, 0xAA, 0xBB];
        assert_eq!(extract_av1_sequence_header(&data), None);
    }

    #[test]
    fn test_extension_header_is_consumed() {
        // sequence header with extension byte, size 1
        let data = [0x0E, 0x10, 0x01, 0x7F];
        let obu = ObuIter::new(&data).next().unwrap().unwrap();
        assert!(obu.has_extension);
        assert_eq!(obu.payload, 3..4);
        assert_eq!(extract_av1_sequence_header(&data), Some(&data[..]));
    }

    #[test]
    fn test_sizeless_obu_consumes_rest() {
        let data = [0x30, 0xAA, 0xBB, 0xCC];
        let obus: Vec<_> = ObuIter::new(&data).collect::<Result<_, _>>().unwrap();
        assert_eq!(obus.len(), 1);
        assert_eq!(obus[0].obu_type, obu_type::FRAME);
        assert_eq!(obus[0].span, 0..4);
    }

    #[test]
    fn test_forbidden_bit_stops_iteration() {
        let data = [0x12, 0x00, 0x8A, 0x01, 0x00];
        let results: Vec<_> = ObuIter::new(&data).collect();
        assert_eq!(results.len(), 2);
        assert_eq!(
            results[1],
            Err(BitstreamError::ForbiddenBit { offset: 2 })
        );
    }

    #[test]
    fn test_overrun_is_reported() {
        let data = [0x0A, 0x09, 0xAA];
        let err = ObuIter::new(&data).next().unwrap().unwrap_err();
        assert!(matches!(err, BitstreamError::ObuOverrun { declared: 9, .. }));
        assert_eq!(extract_av1_sequence_header(&data), None);
    }

    #[test]
    fn test_split_temporal_units() {
        let data = [
            0x12, 0x00, 0x0A, 0x01, 0x00, 0x32, 0x01, 0x11, // TU 1: TD, SH, frame
            0x12, 0x00, 0x32, 0x01, 0x22, // TU 2: TD, frame
        ];
        let units = split_av1_temporal_units(&data);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], &data[..8]);
        assert!(is_av1_keyframe(units[0]));
        assert!(!is_av1_keyframe(units[1]));
    }
}
