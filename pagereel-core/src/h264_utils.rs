//! H.264 NAL unit utilities
//!
//! Handles conversion between Annex B (start code) and AVCC (length-prefixed) formats.
//! Encoders hand us Annex B, MP4 samples are AVCC, and the SPS/PPS travel
//! out-of-band in the `avcC` box rather than inside samples.

use std::ops::Range;

use crate::error::BitstreamError;

/// Annex B start code (4-byte version)
pub const ANNEX_B_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// H.264 NAL unit type constants.
pub mod nal_type {
    pub const NON_IDR_SLICE: u8 = 1;
    pub const IDR_SLICE: u8 = 5;
    pub const SEI: u8 = 6;
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
    pub const AUD: u8 = 9;
}

#[inline]
pub fn nal_unit_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1F)
}

// ============================================================================
// Annex B scanning
// ============================================================================

/// Location of one NAL unit inside an Annex B buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalSpan {
    /// Offset of the start code that introduces this unit.
    pub prefix_start: usize,
    /// NAL bytes, start code excluded.
    pub payload: Range<usize>,
}

/// Find the next Annex B start code at or after `from`.
///
/// Returns `(position, length)`; the 4-byte form is checked first so a
/// `00 00 00 01` is never reported as a 3-byte code one byte late.
pub fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    if data.len() < 3 || from >= data.len() {
        return None;
    }

    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if i + 4 <= data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

/// Lazy iterator over the NAL units of an Annex B buffer.
///
/// A clone continues from the same position independently, so cloning a
/// fresh iterator gives a second full pass.
#[derive(Debug, Clone)]
pub struct AnnexBNalIter<'a> {
    data: &'a [u8],
    next_code: Option<(usize, usize)>,
}

impl<'a> AnnexBNalIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            next_code: find_start_code(data, 0),
        }
    }

    /// Same iteration, yielding the NAL bytes instead of spans.
    pub fn units(self) -> impl Iterator<Item = &'a [u8]> + Clone {
        let data = self.data;
        self.map(move |span| &data[span.payload])
    }
}

impl<'a> Iterator for AnnexBNalIter<'a> {
    type Item = NalSpan;

    fn next(&mut self) -> Option<Self::Item> {
        let (code_pos, code_len) = self.next_code?;
        let start = code_pos + code_len;
        self.next_code = find_start_code(self.data, start);
        let end = self.next_code.map_or(self.data.len(), |(pos, _)| pos);

        Some(NalSpan {
            prefix_start: code_pos,
            payload: start..end,
        })
    }
}

// ============================================================================
// AVCC scanning
// ============================================================================

/// Lazy iterator over length-prefixed NAL units.
///
/// Stops silently at the first length that would overrun the buffer.
#[derive(Debug, Clone)]
pub struct AvccNalIter<'a> {
    data: &'a [u8],
    offset: usize,
    length_size: usize,
}

impl<'a> AvccNalIter<'a> {
    pub fn new(data: &'a [u8], length_size: usize) -> Self {
        Self {
            data,
            offset: 0,
            length_size,
        }
    }
}

impl<'a> Iterator for AvccNalIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.length_size == 0 || self.length_size > 4 {
            return None;
        }
        let len_end = self.offset.checked_add(self.length_size)?;
        if len_end > self.data.len() {
            return None;
        }
        let nal_len = read_be_uint(&self.data[self.offset..len_end]);
        let nal_end = len_end.checked_add(nal_len)?;
        if nal_end > self.data.len() {
            self.offset = self.data.len();
            return None;
        }
        self.offset = nal_end;
        Some(&self.data[len_end..nal_end])
    }
}

// ============================================================================
// Format conversion
// ============================================================================

/// Convert Annex B NAL units to AVCC sample format
///
/// Annex B: [0x00 0x00 0x00 0x01][NAL][0x00 0x00 0x01][NAL]...
/// AVCC:    [4-byte length][NAL][4-byte length][NAL]...
///
/// SPS and PPS units are dropped: they belong in the `avcC` record, never in
/// a sample. Input without any start code is returned unchanged.
pub fn annexb_to_avcc(data: &[u8]) -> Vec<u8> {
    let mut units = AnnexBNalIter::new(data).units().peekable();
    if units.peek().is_none() {
        return data.to_vec();
    }

    let mut result = Vec::with_capacity(data.len() + 16);
    for nal in units {
        match nal_unit_type(nal) {
            None | Some(nal_type::SPS) | Some(nal_type::PPS) => continue,
            Some(_) => {}
        }
        result.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        result.extend_from_slice(nal);
    }
    result
}

/// Convert AVCC sample data (4-byte lengths) to Annex B.
pub fn avcc_to_annexb(data: &[u8]) -> Vec<u8> {
    avcc_to_annexb_sized(data, 4)
}

/// Convert AVCC format NAL units to Annex B format
///
/// `nal_length_size` comes from the `avcC` record (1, 2 or 4). A declared
/// length that runs past the buffer ends the output early.
pub fn avcc_to_annexb_sized(data: &[u8], nal_length_size: usize) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len() + 64);
    for nal in AvccNalIter::new(data, nal_length_size) {
        if nal.is_empty() {
            continue;
        }
        result.extend_from_slice(&ANNEX_B_START_CODE);
        result.extend_from_slice(nal);
    }
    result
}

// ============================================================================
// Parameter sets
// ============================================================================

/// Find the first SPS and first PPS in an Annex B buffer.
pub fn extract_parameter_sets(data: &[u8]) -> Result<(&[u8], &[u8]), BitstreamError> {
    let mut sps = None;
    let mut pps = None;

    for nal in AnnexBNalIter::new(data).units() {
        match nal_unit_type(nal) {
            Some(nal_type::SPS) if sps.is_none() => sps = Some(nal),
            Some(nal_type::PPS) if pps.is_none() => pps = Some(nal),
            _ => {}
        }
        if sps.is_some() && pps.is_some() {
            break;
        }
    }

    match (sps, pps) {
        (Some(sps), Some(pps)) => Ok((sps, pps)),
        (None, _) => Err(BitstreamError::MissingSps),
        (Some(_), None) => Err(BitstreamError::MissingPps),
    }
}

/// Parsed `avcC` (AVCDecoderConfigurationRecord) payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcDecoderConfig {
    pub profile_idc: u8,
    pub profile_compatibility: u8,
    pub level_idc: u8,
    pub nal_length_size: usize,
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
}

impl AvcDecoderConfig {
    /// Parse an `avcC` payload (box header already stripped).
    ///
    /// Layout:
    /// [0]: version (always 1)
    /// [1]: profile
    /// [2]: profile compat
    /// [3]: level
    /// [4]: 0xFC | (nal_length_size - 1)
    /// [5]: 0xE0 | num_sps
    /// Then SPS entries, PPS count, PPS entries
    pub fn parse(extradata: &[u8]) -> Option<Self> {
        if extradata.len() < 7 || extradata[0] != 1 {
            return None;
        }

        let nal_length_size = ((extradata[4] & 0x03) + 1) as usize;
        let num_sps = (extradata[5] & 0x1F) as usize;
        let mut offset = 6;

        let mut sps = Vec::with_capacity(num_sps);
        for _ in 0..num_sps {
            let (nal, next) = read_u16_prefixed(extradata, offset)?;
            sps.push(nal.to_vec());
            offset = next;
        }

        let mut pps = Vec::new();
        if offset < extradata.len() {
            let num_pps = extradata[offset] as usize;
            offset += 1;
            for _ in 0..num_pps {
                let (nal, next) = read_u16_prefixed(extradata, offset)?;
                pps.push(nal.to_vec());
                offset = next;
            }
        }

        Some(Self {
            profile_idc: extradata[1],
            profile_compatibility: extradata[2],
            level_idc: extradata[3],
            nal_length_size,
            sps,
            pps,
        })
    }

    /// SPS then PPS, each behind a 4-byte start code, ready to prepend to a
    /// keyframe.
    pub fn to_annexb(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in self.sps.iter().chain(self.pps.iter()) {
            out.extend_from_slice(&ANNEX_B_START_CODE);
            out.extend_from_slice(nal);
        }
        out
    }
}

// ============================================================================
// Frame helpers
// ============================================================================

/// True when the access unit carries an IDR slice.
pub fn is_h264_keyframe(annexb: &[u8]) -> bool {
    AnnexBNalIter::new(annexb)
        .units()
        .any(|nal| nal_unit_type(nal) == Some(nal_type::IDR_SLICE))
}

/// Cut an Annex B elementary stream into access units.
///
/// A new unit starts at an AUD, at a parameter set or SEI that follows a
/// slice, or at a slice whose `first_mb_in_slice` is zero once the current
/// unit already holds a slice.
pub fn split_h264_access_units(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut unit_start: Option<usize> = None;
    let mut has_slice = false;

    for span in AnnexBNalIter::new(data) {
        let nal = &data[span.payload.clone()];
        let Some(kind) = nal_unit_type(nal) else {
            continue;
        };

        let is_slice = kind == nal_type::NON_IDR_SLICE || kind == nal_type::IDR_SLICE;
        let boundary = match kind {
            nal_type::AUD => true,
            nal_type::SPS | nal_type::PPS | nal_type::SEI => has_slice,
            // ue(v) first_mb_in_slice == 0 encodes as a leading 1 bit
            _ if is_slice => has_slice && nal.get(1).is_some_and(|b| b & 0x80 != 0),
            _ => false,
        };

        if boundary {
            if let Some(start) = unit_start {
                units.push(&data[start..span.prefix_start]);
            }
            unit_start = None;
            has_slice = false;
        }
        unit_start.get_or_insert(span.prefix_start);
        has_slice |= is_slice;
    }

    if let Some(start) = unit_start {
        units.push(&data[start..]);
    }
    units
}

fn read_u16_prefixed(data: &[u8], offset: usize) -> Option<(&[u8], usize)> {
    let len_bytes = data.get(offset..offset + 2)?;
    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    let start = offset + 2;
    let nal = data.get(start..start + len)?;
    Some((nal, start + len))
}

/// Read big-endian unsigned integer of variable size (1-4 bytes)
fn read_be_uint(data: &[u8]) -> usize {
    data.iter().fold(0usize, |val, &b| (val << 8) | b as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: [u8; 4] = [0x67, 0x42, 0x00, 0x1e];
    const PPS: [u8; 3] = [0x68, 0xce, 0x38];

    fn annexb(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&ANNEX_B_START_CODE);
            out.extend_from_slice(nal);
        }
        out
    }

    #[test]
    fn test_find_start_code_prefers_four_byte_form() {
        assert_eq!(find_start_code(&[0, 0, 0, 1, 0x67], 0), Some((0, 4)));
        assert_eq!(find_start_code(&[0, 0, 1, 0x67], 0), Some((0, 3)));
        assert_eq!(find_start_code(&[0xAB, 0, 0, 0, 1], 0), Some((1, 4)));
        assert_eq!(find_start_code(&[0, 0, 2, 0x67], 0), None);
    }

    #[test]
    fn test_nal_iter_mixed_start_codes() {
        let data = [0, 0, 0, 1, 0x67, 0x42, 0, 0, 1, 0x68, 0xCE];
        let nals: Vec<_> = AnnexBNalIter::new(&data).units().collect();
        assert_eq!(nals, vec![&[0x67, 0x42][..], &[0x68, 0xCE][..]]);
    }

    #[test]
    fn test_nal_iter_is_restartable() {
        let data = annexb(&[&SPS, &PPS]);
        let iter = AnnexBNalIter::new(&data);
        let first: Vec<_> = iter.clone().collect();
        let second: Vec<_> = iter.collect();
        assert_eq!(first, second);
        assert_eq!(first[1].prefix_start, 8);
    }

    #[test]
    fn test_annexb_to_avcc_drops_parameter_sets() {
        let idr = [0x65, 0x88, 0x84];
        let avcc = annexb_to_avcc(&annexb(&[&SPS, &PPS, &idr]));
        assert_eq!(avcc, vec![0, 0, 0, 3, 0x65, 0x88, 0x84]);
    }

    #[test]
    fn test_annexb_to_avcc_passthrough_without_start_codes() {
        let raw = [0x65, 0x88, 0x84, 0x00];
        assert_eq!(annexb_to_avcc(&raw), raw.to_vec());
    }

    #[test]
    fn test_avcc_to_annexb() {
        // 4-byte length prefix: length=5, NAL data = [0x67, 0x42, 0x00, 0x1e, 0x9a]
        let avcc = vec![0x00, 0x00, 0x00, 0x05, 0x67, 0x42, 0x00, 0x1e, 0x9a];
        let annexb = avcc_to_annexb(&avcc);

        assert_eq!(&annexb[0..4], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&annexb[4..], &[0x67, 0x42, 0x00, 0x1e, 0x9a]);
    }

    #[test]
    fn test_avcc_to_annexb_short_length_fields() {
        let one = [2, 0x41, 0x9a, 1, 0x06];
        assert_eq!(
            avcc_to_annexb_sized(&one, 1),
            vec![0, 0, 0, 1, 0x41, 0x9a, 0, 0, 0, 1, 0x06]
        );

        let two = [0, 3, 0x65, 0x88, 0x80, 0, 1, 0x06];
        assert_eq!(
            avcc_to_annexb_sized(&two, 2),
            vec![0, 0, 0, 1, 0x65, 0x88, 0x80, 0, 0, 0, 1, 0x06]
        );
    }

    #[test]
    fn test_avcc_to_annexb_stops_on_overrun() {
        let avcc = [0, 0, 0, 2, 0x41, 0x9a, 0, 0, 0, 9, 0x41];
        assert_eq!(avcc_to_annexb(&avcc), vec![0, 0, 0, 1, 0x41, 0x9a]);
    }

    #[test]
    fn test_round_trip_modulo_parameter_sets() {
        let slice_a = [0x65, 0x88, 0x80, 0x10];
        let slice_b = [0x41, 0x9a, 0x02];
        let original = annexb(&[&SPS, &PPS, &slice_a, &slice_b]);
        let back = avcc_to_annexb(&annexb_to_avcc(&original));
        assert_eq!(back, annexb(&[&slice_a, &slice_b]));
    }

    #[test]
    fn test_extract_parameter_sets() {
        let data = annexb(&[&[0x09, 0x10], &SPS, &PPS, &[0x68, 0xff]]);
        let (sps, pps) = extract_parameter_sets(&data).expect("parameter sets");
        assert_eq!(sps, &SPS);
        assert_eq!(pps, &PPS);
    }

    #[test]
    fn test_extract_parameter_sets_missing_pps() {
        let data = annexb(&[&SPS, &[0x65, 0x88]]);
        assert_eq!(
            extract_parameter_sets(&data),
            Err(BitstreamError::MissingPps)
        );
        assert_eq!(
            extract_parameter_sets(&[]),
            Err(BitstreamError::MissingSps)
        );
    }

    #[test]
    fn test_parse_avcc_record() {
        let mut record = vec![1, 0x42, 0x00, 0x1e, 0xff, 0xe1];
        record.extend_from_slice(&(SPS.len() as u16).to_be_bytes());
        record.extend_from_slice(&SPS);
        record.push(1);
        record.extend_from_slice(&(PPS.len() as u16).to_be_bytes());
        record.extend_from_slice(&PPS);

        let config = AvcDecoderConfig::parse(&record).expect("avcC");
        assert_eq!(config.nal_length_size, 4);
        assert_eq!(config.sps, vec![SPS.to_vec()]);
        assert_eq!(config.pps, vec![PPS.to_vec()]);
        assert_eq!(config.to_annexb(), annexb(&[&SPS, &PPS]));
    }

    #[test]
    fn test_split_access_units() {
        let idr = [0x65, 0x88, 0x80];
        let p1 = [0x41, 0x9a, 0x01];
        let p2 = [0x41, 0x9a, 0x02];
        let stream = annexb(&[&SPS, &PPS, &idr, &p1, &p2]);

        let units = split_h264_access_units(&stream);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0], &annexb(&[&SPS, &PPS, &idr])[..]);
        assert!(is_h264_keyframe(units[0]));
        assert!(!is_h264_keyframe(units[1]));
        assert_eq!(units[2], &annexb(&[&p2])[..]);
    }
}
