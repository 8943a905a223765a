//! # pagereel
//!
//! Operator tool around pagereel-core: inspect MP4 recordings, remux raw
//! elementary streams, and report which codec backends this host offers.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

use pagereel_core::av1_utils::{is_av1_keyframe, split_av1_temporal_units};
use pagereel_core::codec_detect::detect_codec_in_file;
use pagereel_core::h264_utils::{is_h264_keyframe, split_h264_access_units};
use pagereel_core::probe::{ProbeConfig, SystemProbe};
use pagereel_core::{
    BackendSelector, CodedFrame, Mp4Demuxer, Mp4Muxer, MuxerConfig, SelectorConfig,
    TimestampUnit, VideoCodec,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pagereel=info".parse()?),
        )
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("probe") => run_probe(&args[2..]),
        Some("remux") => run_remux(&parse_remux_args(&args[2..])?),
        Some("backends") => run_backends(&parse_backends_args(&args[2..])?),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            Err(anyhow!("Unknown command: {}", other))
        }
    }
}

fn print_usage() {
    eprintln!(
        "\nUsage:\n  \
         pagereel probe <file.mp4>\n  \
         pagereel remux --input <stream> --output <file.mp4> --codec h264|av1 \
         --width <w> --height <h> --fps <f> [--frame-ms <n>]\n  \
         pagereel backends [--no-fallback] [--ffmpeg <path>]\n"
    );
}

// ============================================================================
// probe
// ============================================================================

fn run_probe(args: &[String]) -> Result<()> {
    let path = args
        .first()
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("Missing file for probe"))?;

    let codec = detect_codec_in_file(&path)
        .with_context(|| format!("detecting codec of {}", path.display()))?;
    let doc = Mp4Demuxer::open(&path).with_context(|| format!("demuxing {}", path.display()))?;
    info!(path = %path.display(), samples = doc.samples.len(), "probed");

    let report = json!({
        "path": path,
        "codec": codec,
        "summary": doc.summary(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ============================================================================
// remux
// ============================================================================

#[derive(Debug)]
struct RemuxOptions {
    input: PathBuf,
    output: PathBuf,
    codec: VideoCodec,
    width: u32,
    height: u32,
    fps: f64,
    frame_ms: Option<u64>,
}

fn value_of<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("Missing value for {}", flag))
}

fn parse_number<T: std::str::FromStr>(value: &str, flag: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| anyhow!("Invalid value {} for {}: {}", value, flag, e))
}

fn parse_remux_args(args: &[String]) -> Result<RemuxOptions> {
    let mut input: Option<PathBuf> = None;
    let mut output: Option<PathBuf> = None;
    let mut codec: Option<VideoCodec> = None;
    let mut width: Option<u32> = None;
    let mut height: Option<u32> = None;
    let mut fps: f64 = 30.0;
    let mut frame_ms: Option<u64> = None;

    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--input" | "-i" => {
                input = Some(PathBuf::from(value_of(args, i, flag)?));
                i += 2;
            }
            "--output" | "-o" => {
                output = Some(PathBuf::from(value_of(args, i, flag)?));
                i += 2;
            }
            "--codec" | "-c" => {
                let value = value_of(args, i, flag)?;
                codec = Some(
                    VideoCodec::from_name(value)
                        .ok_or_else(|| anyhow!("Unsupported codec {}", value))?,
                );
                i += 2;
            }
            "--width" => {
                width = Some(parse_number(value_of(args, i, flag)?, flag)?);
                i += 2;
            }
            "--height" => {
                height = Some(parse_number(value_of(args, i, flag)?, flag)?);
                i += 2;
            }
            "--fps" => {
                fps = parse_number(value_of(args, i, flag)?, flag)?;
                i += 2;
            }
            "--frame-ms" => {
                frame_ms = Some(parse_number(value_of(args, i, flag)?, flag)?);
                i += 2;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => bail!("Unexpected argument for remux: {}", other),
        }
    }

    Ok(RemuxOptions {
        input: input.ok_or_else(|| anyhow!("Missing required --input"))?,
        output: output.ok_or_else(|| anyhow!("Missing required --output"))?,
        codec: codec.ok_or_else(|| anyhow!("Missing required --codec"))?,
        width: width.ok_or_else(|| anyhow!("Missing required --width"))?,
        height: height.ok_or_else(|| anyhow!("Missing required --height"))?,
        fps,
        frame_ms,
    })
}

/// Cut an elementary stream into timestamped coded frames.
fn split_stream(data: &[u8], codec: VideoCodec, frame_ms: u64) -> Vec<CodedFrame> {
    let units = match codec {
        VideoCodec::H264 => split_h264_access_units(data),
        VideoCodec::Av1 => split_av1_temporal_units(data),
    };
    units
        .into_iter()
        .enumerate()
        .map(|(i, unit)| {
            let keyframe = match codec {
                VideoCodec::H264 => is_h264_keyframe(unit),
                VideoCodec::Av1 => is_av1_keyframe(unit),
            };
            CodedFrame::new(unit.to_vec(), i as u64 * frame_ms, keyframe)
        })
        .collect()
}

fn run_remux(opts: &RemuxOptions) -> Result<()> {
    let data = std::fs::read(&opts.input)
        .with_context(|| format!("reading {}", opts.input.display()))?;
    let frame_ms = opts
        .frame_ms
        .unwrap_or_else(|| (1000.0 / opts.fps).round().max(1.0) as u64);

    let frames = split_stream(&data, opts.codec, frame_ms);
    let keyframes = frames.iter().filter(|f| f.is_keyframe).count();
    info!(
        input = %opts.input.display(),
        frames = frames.len(),
        keyframes,
        "elementary stream split"
    );

    let mut muxer = Mp4Muxer::begin(MuxerConfig {
        codec: opts.codec,
        width: opts.width,
        height: opts.height,
        fps: opts.fps,
        timestamp_unit: TimestampUnit::Millis,
    })?;
    let frame_count = frames.len();
    for frame in frames {
        muxer.add_frame(frame)?;
    }
    let mp4 = muxer.finalize().context("finalizing mp4")?;
    write_output(&opts.output, &mp4)?;

    let report = json!({
        "output": opts.output,
        "codec": opts.codec,
        "frames": frame_count,
        "keyframes": keyframes,
        "bytes": mp4.len(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn write_output(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))
}

// ============================================================================
// backends
// ============================================================================

#[derive(Debug, Default)]
struct BackendsOptions {
    allow_fallback: bool,
    ffmpeg: Option<PathBuf>,
}

fn parse_backends_args(args: &[String]) -> Result<BackendsOptions> {
    let mut opts = BackendsOptions {
        allow_fallback: SelectorConfig::default().allow_fallback,
        ffmpeg: None,
    };

    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--no-fallback" => {
                opts.allow_fallback = false;
                i += 1;
            }
            "--ffmpeg" => {
                opts.ffmpeg = Some(PathBuf::from(value_of(args, i, flag)?));
                i += 2;
            }
            other => bail!("Unexpected argument for backends: {}", other),
        }
    }
    Ok(opts)
}

fn run_backends(opts: &BackendsOptions) -> Result<()> {
    let mut config = ProbeConfig::from_env();
    if let Some(path) = &opts.ffmpeg {
        config.ffmpeg_path = Some(path.clone());
    }

    let selector = BackendSelector::new(
        SystemProbe::new(config),
        SelectorConfig {
            allow_fallback: opts.allow_fallback,
        },
    );

    let mut codecs = Vec::new();
    for codec in [VideoCodec::H264, VideoCodec::Av1] {
        let encoder = match selector.select_encoder(codec) {
            Ok(result) => json!(result),
            Err(e) => json!({ "error": e.to_string() }),
        };
        let decoder = match selector.select_decoder(codec) {
            Ok(result) => json!(result),
            Err(e) => json!({ "error": e.to_string() }),
        };
        codecs.push(json!({
            "codec": codec,
            "encoder": encoder,
            "decoder": decoder,
        }));
    }

    let probe = selector.probe();
    let report = json!({
        "native_library": probe.native_library(),
        "ffmpeg": probe.ffmpeg_executable(),
        "allow_fallback": opts.allow_fallback,
        "codecs": codecs,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parses_remux_flags() {
        let opts = parse_remux_args(&args(&[
            "--input", "in.h264", "--output", "out.mp4", "--codec", "h264", "--width", "640",
            "--height", "360", "--fps", "25", "--frame-ms", "40",
        ]))
        .unwrap();
        assert_eq!(opts.codec, VideoCodec::H264);
        assert_eq!((opts.width, opts.height), (640, 360));
        assert_eq!(opts.fps, 25.0);
        assert_eq!(opts.frame_ms, Some(40));
    }

    #[test]
    fn test_remux_requires_codec() {
        let err = parse_remux_args(&args(&[
            "--input", "a", "--output", "b", "--width", "1", "--height", "1",
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("--codec"));
    }

    #[test]
    fn test_remux_rejects_bad_number() {
        assert!(parse_remux_args(&args(&["--width", "wide"])).is_err());
    }

    #[test]
    fn test_parses_backends_flags() {
        let opts = parse_backends_args(&args(&["--no-fallback"])).unwrap();
        assert!(!opts.allow_fallback);
        assert!(parse_backends_args(&args(&[])).unwrap().allow_fallback);
    }

    #[test]
    fn test_splits_av1_stream_into_timed_frames() {
        let stream = [
            0x12, 0x00, 0x0A, 0x01, 0x00, 0x32, 0x01, 0x11, // TD, SH, frame
            0x12, 0x00, 0x32, 0x01, 0x22, // TD, frame
        ];
        let frames = split_stream(&stream, VideoCodec::Av1, 40);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_keyframe);
        assert!(!frames[1].is_keyframe);
        assert_eq!(frames[1].timestamp, 40);
    }
}
