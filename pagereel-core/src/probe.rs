//! Host capability probing.
//!
//! Native codecs are detected by loading their shared library; the external
//! encoder by finding `ffmpeg` on `PATH`. Nothing is spawned. Each answer is
//! computed once per [`SystemProbe`].

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::CapabilityProbe;
use crate::frame::VideoCodec;

/// Environment variable pinning the external-process executable.
pub const FFMPEG_ENV: &str = "PAGEREEL_FFMPEG";

#[cfg(target_os = "windows")]
const DEFAULT_NATIVE_LIBRARIES: &[&str] = &["openh264-2.4.1-win64.dll", "openh264.dll", "mfplat.dll"];
#[cfg(target_os = "macos")]
const DEFAULT_NATIVE_LIBRARIES: &[&str] = &[
    "/System/Library/Frameworks/VideoToolbox.framework/VideoToolbox",
    "libopenh264.7.dylib",
];
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const DEFAULT_NATIVE_LIBRARIES: &[&str] = &["libopenh264.so.7", "libopenh264.so.6", "libopenh264.so"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Use this executable instead of searching `PATH`.
    pub ffmpeg_path: Option<PathBuf>,
    /// Library names or paths tried in order for the native H.264 codec.
    pub native_libraries: Vec<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            native_libraries: DEFAULT_NATIVE_LIBRARIES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ProbeConfig {
    /// Defaults, with `PAGEREEL_FFMPEG` honoured when set.
    pub fn from_env() -> Self {
        Self {
            ffmpeg_path: env::var_os(FFMPEG_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            ..Self::default()
        }
    }
}

/// [`CapabilityProbe`] for the machine we are running on.
#[derive(Debug, Default)]
pub struct SystemProbe {
    config: ProbeConfig,
    native: OnceCell<Option<String>>,
    ffmpeg: OnceCell<Option<PathBuf>>,
}

impl SystemProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            config,
            native: OnceCell::new(),
            ffmpeg: OnceCell::new(),
        }
    }

    /// First native codec library that loads.
    pub fn native_library(&self) -> Option<&str> {
        self.native
            .get_or_init(|| {
                self.config
                    .native_libraries
                    .iter()
                    .find(|name| try_load(name))
                    .cloned()
            })
            .as_deref()
    }

    /// Resolved external encoder executable.
    pub fn ffmpeg_executable(&self) -> Option<&Path> {
        self.ffmpeg
            .get_or_init(|| match &self.config.ffmpeg_path {
                Some(path) => path.is_file().then(|| path.clone()),
                None => find_on_path("ffmpeg", env::var_os("PATH")),
            })
            .as_deref()
    }
}

impl CapabilityProbe for SystemProbe {
    fn is_native_available(&self, codec: VideoCodec) -> bool {
        match codec {
            VideoCodec::H264 => self.native_library().is_some(),
            // AV1 is always served by the bundled library
            VideoCodec::Av1 => false,
        }
    }

    fn is_external_process_available(&self, _codec: VideoCodec) -> bool {
        self.ffmpeg_executable().is_some()
    }
}

fn try_load(name: &str) -> bool {
    // SAFETY: only codec libraries named in the probe config are loaded.
    let loaded = unsafe { libloading::Library::new(name) };
    match loaded {
        Ok(_) => {
            debug!(library = name, "native codec library loaded");
            true
        }
        Err(e) => {
            debug!(library = name, error = %e, "native codec library unavailable");
            false
        }
    }
}

/// Search a `PATH`-style list for an executable named `program`.
fn find_on_path(program: &str, path_var: Option<OsString>) -> Option<PathBuf> {
    let file_name = if cfg!(windows) {
        format!("{program}.exe")
    } else {
        program.to_string()
    };
    let found = env::split_paths(&path_var?)
        .map(|dir| dir.join(&file_name))
        .find(|candidate| candidate.is_file());
    debug!(program, found = ?found, "searched PATH");
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_finds_program_in_path_list() {
        let dir = tempfile::tempdir().unwrap();
        let name = if cfg!(windows) { "ffmpeg.exe" } else { "ffmpeg" };
        fs::write(dir.path().join(name), b"").unwrap();

        let empty = tempfile::tempdir().unwrap();
        let path_var = env::join_paths([empty.path(), dir.path()]).unwrap();
        assert_eq!(
            find_on_path("ffmpeg", Some(path_var)),
            Some(dir.path().join(name))
        );
    }

    #[test]
    fn test_missing_program_is_none() {
        let empty = tempfile::tempdir().unwrap();
        let path_var = env::join_paths([empty.path()]).unwrap();
        assert_eq!(find_on_path("ffmpeg", Some(path_var)), None);
        assert_eq!(find_on_path("ffmpeg", None), None);
    }

    #[test]
    fn test_configured_ffmpeg_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("my-ffmpeg");
        let probe = SystemProbe::new(ProbeConfig {
            ffmpeg_path: Some(exe.clone()),
            native_libraries: Vec::new(),
        });
        assert!(!probe.is_external_process_available(VideoCodec::H264));

        fs::write(&exe, b"").unwrap();
        let probe = SystemProbe::new(ProbeConfig {
            ffmpeg_path: Some(exe.clone()),
            native_libraries: Vec::new(),
        });
        assert_eq!(probe.ffmpeg_executable(), Some(exe.as_path()));
    }

    #[test]
    fn test_unloadable_native_library_is_unavailable() {
        let probe = SystemProbe::new(ProbeConfig {
            ffmpeg_path: None,
            native_libraries: vec!["libpagereel-does-not-exist.so".into()],
        });
        assert!(!probe.is_native_available(VideoCodec::H264));
        assert!(!probe.is_native_available(VideoCodec::Av1));
    }
}
