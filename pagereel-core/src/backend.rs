// BACKEND SELECTION - runtime capability strategy
//
// Every host gets a working video path:
//
//   decode AV1   → bundled library
//   decode H.264 → native → external process → error (never redecoded as AV1)
//   encode AV1   → bundled library
//   encode H.264 → native → external process → AV1 library (if fallback allowed)
//
// The selector only calls capability predicates. It does no I/O of its own,
// never retries, and reports every substitution in the SelectionResult.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::decode::VideoDecoder;
use crate::encode::VideoEncoder;
use crate::error::{BackendError, DecodeError, EncodeError};
use crate::frame::VideoCodec;

/// Where a codec implementation lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Backend {
    /// Platform codec API loaded at runtime
    Native,
    /// Codec driven through an external executable
    ExternalProcess,
    /// Statically linked codec, always present
    Library,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::ExternalProcess => "external-process",
            Self::Library => "library",
        }
    }
}

/// Outcome of one selection. `requested_codec` is kept even when a
/// different codec was substituted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionResult {
    pub requested_codec: VideoCodec,
    pub selected_codec: VideoCodec,
    pub selected_backend: Backend,
    pub fallback_occurred: bool,
}

/// Host capability predicates, per codec family.
pub trait CapabilityProbe {
    fn is_native_available(&self, codec: VideoCodec) -> bool;
    fn is_external_process_available(&self, codec: VideoCodec) -> bool;
}

/// A probe that can also construct the backends it reports.
pub trait BackendProvider: CapabilityProbe {
    fn encoder(&self, backend: Backend, codec: VideoCodec) -> Result<Box<dyn VideoEncoder>, EncodeError>;
    fn decoder(&self, backend: Backend, codec: VideoCodec) -> Result<Box<dyn VideoDecoder>, DecodeError>;
}

/// Receives the selector's fallback warning.
pub trait WarningSink: Send + Sync {
    fn warn(&self, message: &str, result: &SelectionResult);
}

/// Default sink: `tracing::warn!` with structured fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWarnings;

impl WarningSink for TracingWarnings {
    fn warn(&self, message: &str, result: &SelectionResult) {
        warn!(
            requested = result.requested_codec.name(),
            selected = result.selected_codec.name(),
            backend = result.selected_backend.name(),
            "{message}"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Substitute AV1 when no H.264 encoder exists.
    pub allow_fallback: bool,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            allow_fallback: true,
        }
    }
}

pub struct BackendSelector<P> {
    probe: P,
    config: SelectorConfig,
    warnings: Box<dyn WarningSink>,
}

impl<P: CapabilityProbe> BackendSelector<P> {
    pub fn new(probe: P, config: SelectorConfig) -> Self {
        Self {
            probe,
            config,
            warnings: Box::new(TracingWarnings),
        }
    }

    pub fn with_warnings(mut self, sink: impl WarningSink + 'static) -> Self {
        self.warnings = Box::new(sink);
        self
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// First host backend for `codec`, plus the names of those that were probed and missing.
    fn host_backend(&self, codec: VideoCodec) -> (Option<Backend>, Vec<String>) {
        let mut tried = Vec::new();
        for backend in [Backend::Native, Backend::ExternalProcess] {
            let available = match backend {
                Backend::Native => self.probe.is_native_available(codec),
                _ => self.probe.is_external_process_available(codec),
            };
            debug!(codec = codec.name(), backend = backend.name(), available, "probed backend");
            if available {
                return (Some(backend), tried);
            }
            tried.push(backend.name().to_string());
        }
        (None, tried)
    }

    pub fn select_decoder(&self, codec: VideoCodec) -> Result<SelectionResult, BackendError> {
        let backend = match codec {
            VideoCodec::Av1 => Backend::Library,
            VideoCodec::H264 => match self.host_backend(codec) {
                (Some(backend), _) => backend,
                (None, tried) => return Err(BackendError::NoDecoderAvailable { codec, tried }),
            },
        };
        Ok(SelectionResult {
            requested_codec: codec,
            selected_codec: codec,
            selected_backend: backend,
            fallback_occurred: false,
        })
    }

    pub fn select_encoder(&self, codec: VideoCodec) -> Result<SelectionResult, BackendError> {
        if codec == VideoCodec::Av1 {
            return Ok(SelectionResult {
                requested_codec: codec,
                selected_codec: codec,
                selected_backend: Backend::Library,
                fallback_occurred: false,
            });
        }

        match self.host_backend(codec) {
            (Some(backend), _) => Ok(SelectionResult {
                requested_codec: codec,
                selected_codec: codec,
                selected_backend: backend,
                fallback_occurred: false,
            }),
            (None, tried) if self.config.allow_fallback => {
                let result = SelectionResult {
                    requested_codec: codec,
                    selected_codec: VideoCodec::Av1,
                    selected_backend: Backend::Library,
                    fallback_occurred: true,
                };
                self.warnings.warn(
                    &format!(
                        "no {} encoder available (tried: {}), falling back to AV1",
                        codec.name(),
                        tried.join(", ")
                    ),
                    &result,
                );
                Ok(result)
            }
            (None, tried) => Err(BackendError::NoEncoderAvailable { codec, tried }),
        }
    }
}

impl<P: BackendProvider> BackendSelector<P> {
    pub fn create_encoder(
        &self,
        codec: VideoCodec,
    ) -> Result<(Box<dyn VideoEncoder>, SelectionResult), EncodeError> {
        let selection = self.select_encoder(codec)?;
        let encoder = self
            .probe
            .encoder(selection.selected_backend, selection.selected_codec)?;
        Ok((encoder, selection))
    }

    pub fn create_decoder(
        &self,
        codec: VideoCodec,
    ) -> Result<(Box<dyn VideoDecoder>, SelectionResult), DecodeError> {
        let selection = self.select_decoder(codec)?;
        let decoder = self
            .probe
            .decoder(selection.selected_backend, selection.selected_codec)?;
        Ok((decoder, selection))
    }
}
