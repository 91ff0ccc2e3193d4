// Video decoder module
// Backend probing with hwaccel negotiation and software fallback
//
// Decoder priority (per codec family, see probe.rs):
// 1. Vendor backends exposed as plain software decoders (Tegra, OMX, V4L2 M2M)
// 2. Reference software decoder (AV1 only)
// 3. Generic decoder, hardware accelerated through a device context when possible

pub mod engine;
pub mod hwaccel;
pub mod packet;
pub mod probe;
pub mod registry;
pub mod ring;
pub mod session;
pub mod transfer;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

#[cfg(test)]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use engine::{
    CodecEngine, DecodeContext, DecodeFlags, DeviceType, EngineError, FrameBuffer, HwConfig,
    HwConfigMethods, PixelFormat,
};
pub use packet::PacketBuffer;
pub use session::{DecodeSession, DecodeStats};

#[derive(Error, Debug)]
pub enum DecoderError {
    #[error("Video format not supported: {0:#06x}")]
    UnsupportedFormat(u32),
    #[error("Invalid decoder configuration: {0}")]
    InvalidConfig(String),
    #[error("Couldn't find a usable {0} decoder")]
    NoDecoder(CodecFamily),
    #[error("Allocation failed: {0}")]
    Allocation(EngineError),
    #[error("Device {0} is already in use by another decode session")]
    DeviceBusy(String),
    #[error("Packet of {len} bytes needs {required} bytes of trailing padding, buffer holds {available}")]
    InsufficientPadding {
        len: usize,
        available: usize,
        required: usize,
    },
    #[error("Decode failed: {0}")]
    Submit(EngineError),
    #[error("Receive failed: {0}")]
    Receive(EngineError),
    #[error("Error transferring the data to system memory: {0}")]
    Transfer(EngineError),
}

/// Compressed video codec a session decodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecFamily {
    H264,
    H265,
    Av1,
}

impl fmt::Display for CodecFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CodecFamily::H264 => "H.264",
            CodecFamily::H265 => "H.265",
            CodecFamily::Av1 => "AV1",
        })
    }
}

bitflags::bitflags! {
    /// Negotiated stream format as announced by the host
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct VideoFormat: u32 {
        const H264 = 0x0001;
        const H265 = 0x0100;
        const H265_MAIN10 = 0x0200;
        const AV1_MAIN8 = 0x1000;
        const AV1_MAIN10 = 0x2000;

        const MASK_H264 = 0x000F;
        const MASK_H265 = 0x0F00;
        const MASK_AV1 = 0xF000;
    }
}

impl VideoFormat {
    /// Resolve the codec family. H.264 wins over H.265, which wins over AV1.
    pub fn family(&self) -> Result<CodecFamily, DecoderError> {
        if self.intersects(VideoFormat::MASK_H264) {
            Ok(CodecFamily::H264)
        } else if self.intersects(VideoFormat::MASK_H265) {
            Ok(CodecFamily::H265)
        } else if self.intersects(VideoFormat::MASK_AV1) {
            Ok(CodecFamily::Av1)
        } else {
            Err(DecoderError::UnsupportedFormat(self.bits()))
        }
    }
}

impl From<CodecFamily> for VideoFormat {
    fn from(family: CodecFamily) -> Self {
        match family {
            CodecFamily::H264 => VideoFormat::H264,
            CodecFamily::H265 => VideoFormat::H265,
            CodecFamily::Av1 => VideoFormat::AV1_MAIN8,
        }
    }
}

bitflags::bitflags! {
    /// Performance options requested by the caller
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PerfFlags: u32 {
        const SLICE_THREADING = 0x04;
        const HARDWARE_ACCELERATION = 0x08;
    }
}

/// Whether accelerated decoding was requested.
///
/// `Software` still lets the generic backend negotiate a device context, but
/// frames are always handed out CPU visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Preference {
    Software,
    Accelerated,
}

impl From<PerfFlags> for Preference {
    fn from(flags: PerfFlags) -> Self {
        if flags.contains(PerfFlags::HARDWARE_ACCELERATION) {
            Preference::Accelerated
        } else {
            Preference::Software
        }
    }
}

/// Decoder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub video_format: VideoFormat,
    pub width: u32,
    pub height: u32,
    pub perf_flags: PerfFlags,
    /// Number of frame ring slots
    pub buffer_count: usize,
    /// Slice threads, only used with `PerfFlags::SLICE_THREADING`
    pub thread_count: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            video_format: VideoFormat::H264,
            width: 1920,
            height: 1080,
            perf_flags: PerfFlags::HARDWARE_ACCELERATION,
            buffer_count: 2,
            thread_count: 1,
        }
    }
}

impl DecoderConfig {
    pub fn validate(&self) -> Result<(), DecoderError> {
        if self.width == 0 || self.height == 0 {
            return Err(DecoderError::InvalidConfig(format!(
                "dimensions must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        // Dimensions and thread count end up in C ints
        if i32::try_from(self.width).is_err() || i32::try_from(self.height).is_err() {
            return Err(DecoderError::InvalidConfig(format!(
                "dimensions out of range, got {}x{}",
                self.width, self.height
            )));
        }
        if i32::try_from(self.thread_count).is_err() {
            return Err(DecoderError::InvalidConfig(format!(
                "thread count out of range, got {}",
                self.thread_count
            )));
        }
        if self.buffer_count == 0 {
            return Err(DecoderError::InvalidConfig(
                "at least one frame buffer is required".to_string(),
            ));
        }
        if self.perf_flags.contains(PerfFlags::SLICE_THREADING) && self.thread_count == 0 {
            return Err(DecoderError::InvalidConfig(
                "slice threading needs a non-zero thread count".to_string(),
            ));
        }
        Ok(())
    }

    pub fn preference(&self) -> Preference {
        Preference::from(self.perf_flags)
    }
}

/// Where a decoded frame's pixels live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMemory {
    /// Planes are readable from the CPU
    Host,
    /// Accelerator surface, only usable by a renderer that imports it
    Device,
}

/// Which buffer a decoded frame was handed out from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    Ring,
    Staging,
}

/// Decoded frame ready for presentation.
///
/// Borrows the session, so it has to be consumed or copied before the next
/// `get_frame` call.
#[derive(Debug)]
pub struct DecodedFrame<'a, F> {
    frame: &'a F,
    slot: usize,
    source: FrameSource,
}

impl<'a, F: FrameBuffer> DecodedFrame<'a, F> {
    pub(crate) fn new(frame: &'a F, slot: usize, source: FrameSource) -> Self {
        Self { frame, slot, source }
    }

    pub fn width(&self) -> u32 {
        self.frame.width()
    }

    pub fn height(&self) -> u32 {
        self.frame.height()
    }

    pub fn format(&self) -> PixelFormat {
        self.frame.format()
    }

    pub fn memory(&self) -> FrameMemory {
        if self.frame.format().is_hardware() {
            FrameMemory::Device
        } else {
            FrameMemory::Host
        }
    }

    /// Check if frame is in CPU memory
    pub fn is_cpu(&self) -> bool {
        self.memory() == FrameMemory::Host
    }

    /// Ring slot the frame was decoded into (also set for staged frames)
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn source(&self) -> FrameSource {
        self.source
    }

    /// Number of planes, zero for accelerator surfaces
    pub fn planes(&self) -> usize {
        if self.is_cpu() { self.frame.planes() } else { 0 }
    }

    pub fn stride(&self, plane: usize) -> Option<usize> {
        (plane < self.planes()).then(|| self.frame.stride(plane))
    }

    /// Get CPU data of one plane if available
    pub fn plane(&self, plane: usize) -> Option<&'a [u8]> {
        (plane < self.planes()).then(|| self.frame.data(plane))
    }

    /// Engine-native frame, for renderers that import device surfaces
    pub fn native(&self) -> &'a F {
        self.frame
    }
}

/// Create a decode session on the FFmpeg engine
#[cfg(feature = "ffmpeg")]
pub fn create_session(
    config: &DecoderConfig,
) -> Result<DecodeSession<ffmpeg::FfmpegEngine>, DecoderError> {
    let session = DecodeSession::init(ffmpeg::FfmpegEngine::new(), config)?;
    log::info!(
        "Using FFmpeg decoder {} ({:?}, hwaccel: {})",
        session.decoder_name(),
        session.backend_kind(),
        session
            .hw_device()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    Ok(session)
}
