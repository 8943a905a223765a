//! Progressive (non-fragmented) MP4 input, built box by box.

use bytes::BufMut;
use pagereel_core::mp4_box::{kind, BoxWriter, FourCC};
use pagereel_core::{DecoderConfigRecord, DemuxError, DetectedCodec, Mp4Demuxer};

const SPS: &[u8] = &[0x67, 0x42, 0xC0, 0x1E, 0x95];
const PPS: &[u8] = &[0x68, 0xCE, 0x06];

/// Sample payloads (AVCC, 4-byte lengths), laid out two per chunk.
fn samples() -> Vec<Vec<u8>> {
    vec![
        vec![0, 0, 0, 2, 0x65, 0x10],
        vec![0, 0, 0, 2, 0x41, 0x11],
        vec![0, 0, 0, 2, 0x41, 0x12],
        vec![0, 0, 0, 2, 0x65, 0x13],
        vec![0, 0, 0, 2, 0x41, 0x14],
    ]
}

struct Layout {
    handler: FourCC,
    with_stss: bool,
    use_co64: bool,
}

fn full_table(w: &mut BoxWriter, table: FourCC, entries: &[u32]) {
    let b = w.begin_full(table, 0, 0);
    for &e in entries {
        w.put_u32(e);
    }
    w.end(b).unwrap();
}

/// ftyp, mdat, then moov at the end (the layout most encoders write).
fn build(layout: &Layout) -> Vec<u8> {
    let samples = samples();
    let mut w = BoxWriter::default();

    let ftyp = w.begin(kind::FTYP);
    w.put_slice(b"isom");
    w.put_u32(0x200);
    w.put_slice(b"isomavc1");
    w.end(ftyp).unwrap();

    // chunk 1: samples 0-1, chunk 2: samples 2-3, chunk 3: sample 4
    let mdat = w.begin(kind::MDAT);
    let mut chunk_offsets = Vec::new();
    for (i, sample) in samples.iter().enumerate() {
        if i % 2 == 0 {
            chunk_offsets.push(w.len() as u64);
        }
        w.put_slice(sample);
    }
    w.end(mdat).unwrap();

    let moov = w.begin(kind::MOOV);
    let mvhd = w.begin_full(kind::MVHD, 0, 0);
    w.put_zeros(96);
    w.end(mvhd).unwrap();

    let trak = w.begin(kind::TRAK);
    let tkhd = w.begin_full(kind::TKHD, 0, 3);
    w.put_u32(0);
    w.put_u32(0);
    w.put_u32(2); // track_ID
    w.put_zeros(68);
    w.end(tkhd).unwrap();

    let mdia = w.begin(kind::MDIA);
    let mdhd = w.begin_full(kind::MDHD, 0, 0);
    w.put_u32(0);
    w.put_u32(0);
    w.put_u32(90_000);
    w.put_u32(0);
    w.put_u32(0);
    w.end(mdhd).unwrap();

    let hdlr = w.begin_full(kind::HDLR, 0, 0);
    w.put_u32(0);
    w.put_slice(&layout.handler);
    w.put_zeros(13);
    w.end(hdlr).unwrap();

    let minf = w.begin(kind::MINF);
    let stbl = w.begin(kind::STBL);

    let stsd = w.begin_full(kind::STSD, 0, 0);
    w.put_u32(1);
    let avc1 = w.begin(kind::AVC1);
    w.put_zeros(6);
    w.put_u16(1);
    w.put_zeros(16);
    w.put_u16(176);
    w.put_u16(144);
    w.put_zeros(50);
    let avcc = w.begin(kind::AVCC);
    w.put_slice(&[1, 0x42, 0xC0, 0x1E, 0xFF, 0xE1]);
    w.put_u16(SPS.len() as u16);
    w.put_slice(SPS);
    w.put_u8(1);
    w.put_u16(PPS.len() as u16);
    w.put_slice(PPS);
    w.end(avcc).unwrap();
    w.end(avc1).unwrap();
    w.end(stsd).unwrap();

    // 3000 ticks per sample at 90 kHz = 33 ms
    full_table(&mut w, kind::STTS, &[1, 5, 3000]);
    full_table(&mut w, kind::STSC, &[2, 1, 2, 1, 3, 1, 1]);
    let sizes: Vec<u32> = samples.iter().map(|s| s.len() as u32).collect();
    let mut stsz = vec![0, sizes.len() as u32];
    stsz.extend(sizes);
    full_table(&mut w, kind::STSZ, &stsz);

    if layout.use_co64 {
        let co64 = w.begin_full(kind::CO64, 0, 0);
        w.put_u32(chunk_offsets.len() as u32);
        for &o in &chunk_offsets {
            w.put_u64(o);
        }
        w.end(co64).unwrap();
    } else {
        let mut stco = vec![chunk_offsets.len() as u32];
        stco.extend(chunk_offsets.iter().map(|&o| o as u32));
        full_table(&mut w, kind::STCO, &stco);
    }

    if layout.with_stss {
        full_table(&mut w, kind::STSS, &[2, 1, 4]);
    }

    w.end(stbl).unwrap();
    w.end(minf).unwrap();
    w.end(mdia).unwrap();
    w.end(trak).unwrap();
    w.end(moov).unwrap();
    w.freeze().to_vec()
}

fn video(with_stss: bool, use_co64: bool) -> Vec<u8> {
    build(&Layout {
        handler: kind::VIDE,
        with_stss,
        use_co64,
    })
}

#[test]
fn test_progressive_samples_resolve_in_decode_order() {
    let doc = Mp4Demuxer::parse(&video(true, false)).unwrap();

    assert!(!doc.fragmented);
    assert_eq!(doc.track.codec, DetectedCodec::H264);
    assert_eq!(doc.track.track_id, 2);
    assert_eq!((doc.track.width, doc.track.height), (176, 144));
    assert_eq!(doc.samples.len(), 5);

    let ts: Vec<u64> = doc.samples.iter().map(|s| s.timestamp).collect();
    assert_eq!(ts, vec![0, 33, 66, 100, 133]);

    let keys: Vec<bool> = doc.samples.iter().map(|s| s.is_keyframe).collect();
    assert_eq!(keys, vec![true, false, false, true, false]);

    // keyframes get SPS/PPS, deltas only their own NAL
    let mut expected_key = vec![0, 0, 0, 1];
    expected_key.extend_from_slice(SPS);
    expected_key.extend_from_slice(&[0, 0, 0, 1]);
    expected_key.extend_from_slice(PPS);
    expected_key.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x10]);
    assert_eq!(&doc.samples[0].data[..], &expected_key[..]);
    assert_eq!(&doc.samples[4].data[..], &[0, 0, 0, 1, 0x41, 0x14]);

    assert!(matches!(doc.config, Some(DecoderConfigRecord::Avc { .. })));
}

#[test]
fn test_missing_stss_marks_every_sample_sync() {
    let doc = Mp4Demuxer::parse(&video(false, false)).unwrap();
    assert_eq!(doc.keyframe_count(), 5);
}

#[test]
fn test_co64_offsets_are_honoured() {
    let narrow = Mp4Demuxer::parse(&video(true, false)).unwrap();
    let wide = Mp4Demuxer::parse(&video(true, true)).unwrap();
    let a: Vec<_> = narrow.samples.iter().map(|s| s.data.clone()).collect();
    let b: Vec<_> = wide.samples.iter().map(|s| s.data.clone()).collect();
    assert_eq!(a, b);
}

#[test]
fn test_non_video_track_is_reported() {
    let data = build(&Layout {
        handler: *b"soun",
        with_stss: true,
        use_co64: false,
    });
    assert!(matches!(Mp4Demuxer::parse(&data), Err(DemuxError::NoVideoTrack)));
}

#[test]
fn test_read_from_matches_parse() {
    let data = video(true, false);
    let from_reader = Mp4Demuxer::read_from(std::io::Cursor::new(data.clone())).unwrap();
    let from_slice = Mp4Demuxer::parse(&data).unwrap();
    assert_eq!(from_reader.samples, from_slice.samples);
}
