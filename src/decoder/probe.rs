//! Decoder backend probing
//!
//! Candidates are plain data: an ordered list per (codec family, preference).
//! The probe walks the list, skips backends that are not compiled into the
//! engine or whose device another session holds, negotiates hwaccel where the
//! backend advertises it, and keeps the first backend that opens.

use super::engine::{CodecEngine, ContextSettings, EngineError, HwBinding};
use super::hwaccel::{self, Negotiated};
use super::registry::{self, DeviceClaim};
use super::{CodecFamily, DecoderError, Preference};

/// How a backend reaches the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Vendor decoder that owns its device and outputs plain frames
    Vendor,
    /// Reference software decoder
    Reference,
    /// Engine's own decoder, software or hwaccel through a device context
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub name: &'static str,
    pub kind: BackendKind,
}

const fn vendor(name: &'static str) -> Candidate {
    Candidate {
        name,
        kind: BackendKind::Vendor,
    }
}

const fn reference(name: &'static str) -> Candidate {
    Candidate {
        name,
        kind: BackendKind::Reference,
    }
}

const fn generic(name: &'static str) -> Candidate {
    Candidate {
        name,
        kind: BackendKind::Generic,
    }
}

const H264_SOFTWARE: &[Candidate] = &[
    vendor("h264_nvv4l2"),  // Tegra
    vendor("h264_nvmpi"),   // Tegra
    vendor("h264_omx"),     // VisionFive
    vendor("h264_v4l2m2m"), // Stateful V4L2
    generic("h264"),        // Software and hwaccel
];

const H264_ACCELERATED: &[Candidate] = &[generic("h264")];

const HEVC_SOFTWARE: &[Candidate] = &[
    vendor("hevc_nvv4l2"),
    vendor("hevc_nvmpi"),
    vendor("hevc_omx"),
    vendor("hevc_v4l2m2m"),
    generic("hevc"),
];

const HEVC_ACCELERATED: &[Candidate] = &[generic("hevc")];

const AV1_SOFTWARE: &[Candidate] = &[reference("libdav1d"), generic("av1")];

const AV1_ACCELERATED: &[Candidate] = &[generic("av1")];

/// Ordered candidate list for a family and preference
pub fn candidates(family: CodecFamily, preference: Preference) -> &'static [Candidate] {
    match (family, preference) {
        (CodecFamily::H264, Preference::Software) => H264_SOFTWARE,
        (CodecFamily::H264, Preference::Accelerated) => H264_ACCELERATED,
        (CodecFamily::H265, Preference::Software) => HEVC_SOFTWARE,
        (CodecFamily::H265, Preference::Accelerated) => HEVC_ACCELERATED,
        (CodecFamily::Av1, Preference::Software) => AV1_SOFTWARE,
        (CodecFamily::Av1, Preference::Accelerated) => AV1_ACCELERATED,
    }
}

/// Backend that opened, with its context and optional hwaccel device
pub struct Selected<E: CodecEngine> {
    pub candidate: Candidate,
    pub context: E::Context,
    pub accel: Option<Negotiated<E::Device>>,
    /// Exclusive claim on a vendor backend
    pub backend_claim: Option<DeviceClaim>,
}

/// Open the highest priority candidate that is available.
///
/// Unavailable backends and vendor backends held by another session are
/// skipped, open failures move on to the next candidate. Running out of
/// candidates is `NoDecoder`; an allocation failure stops the walk.
pub fn select_decoder<E: CodecEngine>(
    engine: &E,
    family: CodecFamily,
    preference: Preference,
    settings: &ContextSettings,
) -> Result<Selected<E>, DecoderError> {
    for candidate in candidates(family, preference) {
        // Skip this decoder if it isn't compiled into the engine
        let Some(decoder) = engine.find_decoder(candidate.name) else {
            log::debug!("Decoder not available: {}", candidate.name);
            continue;
        };
        log::info!("Trying decoder {}", candidate.name);

        // Vendor backends own their device, one session at a time
        let backend_claim = if candidate.kind == BackendKind::Vendor {
            match registry::claim(registry::backend_key(engine.device_scope(), candidate.name)) {
                Ok(claim) => Some(claim),
                Err(e) => {
                    log::warn!("Skipping decoder {}: {}", candidate.name, e);
                    continue;
                }
            }
        } else {
            None
        };

        let configs = engine.hw_configs(&decoder);
        let accel = if configs.is_empty() {
            None
        } else {
            hwaccel::negotiate(engine, &decoder, candidate.name, &configs)
        };

        let binding = accel.as_ref().map(|n| HwBinding {
            device: &n.device,
            selector: n.selector,
        });

        match engine.open(&decoder, settings, binding) {
            Ok(context) => {
                return Ok(Selected {
                    candidate: *candidate,
                    context,
                    accel,
                    backend_claim,
                });
            }
            Err(EngineError::OutOfMemory(e)) => {
                log::error!("Couldn't allocate context for {}: {}", candidate.name, e);
                return Err(DecoderError::Allocation(EngineError::OutOfMemory(e)));
            }
            Err(e) => {
                log::warn!("Couldn't open codec {}: {}", candidate.name, e);
            }
        }
    }

    log::error!("Couldn't find decoder for {} ({:?})", family, preference);
    Err(DecoderError::NoDecoder(family))
}
