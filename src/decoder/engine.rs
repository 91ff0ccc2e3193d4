//! Codec engine seam
//!
//! The probe, the hwaccel negotiator, the frame ring and the transfer path are
//! written against these traits. `ffmpeg::FfmpegEngine` is the production
//! implementation.

use super::hwaccel::FormatSelector;
use std::fmt;
use thiserror::Error;

/// Error reported by the underlying codec engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Output is not available in this state, more input is needed
    #[error("Resource temporarily unavailable")]
    Again,
    #[error("End of file")]
    Eof,
    #[error("Out of memory: {0}")]
    OutOfMemory(String),
    #[error("Not supported: {0}")]
    Unsupported(String),
    #[error("{message} ({code})")]
    Backend { code: i32, message: String },
}

impl EngineError {
    /// Expected steady-state conditions of the receive side, not failures
    pub fn is_no_frame(&self) -> bool {
        matches!(self, EngineError::Again | EngineError::Eof)
    }
}

/// Pixel layout of a decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Yuv420p,
    Yuvj420p,
    Yuv420p10,
    Nv12,
    P010,
    Vaapi,
    Cuda,
    Vdpau,
    Qsv,
    D3d11,
    Dxva2,
    VideoToolbox,
    Vulkan,
    DrmPrime,
    MediaCodec,
    /// Engine format without a name here, carries the raw engine value
    Other(i32),
}

impl PixelFormat {
    /// Accelerator surface formats, their planes are not host readable
    pub fn is_hardware(&self) -> bool {
        matches!(
            self,
            PixelFormat::Vaapi
                | PixelFormat::Cuda
                | PixelFormat::Vdpau
                | PixelFormat::Qsv
                | PixelFormat::D3d11
                | PixelFormat::Dxva2
                | PixelFormat::VideoToolbox
                | PixelFormat::Vulkan
                | PixelFormat::DrmPrime
                | PixelFormat::MediaCodec
        )
    }
}

/// Hardware device family an acceleration context is created for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Vdpau,
    Cuda,
    Vaapi,
    Dxva2,
    Qsv,
    VideoToolbox,
    D3d11va,
    Drm,
    OpenCl,
    MediaCodec,
    Vulkan,
    Other(i32),
}

impl DeviceType {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceType::Vdpau => "vdpau",
            DeviceType::Cuda => "cuda",
            DeviceType::Vaapi => "vaapi",
            DeviceType::Dxva2 => "dxva2",
            DeviceType::Qsv => "qsv",
            DeviceType::VideoToolbox => "videotoolbox",
            DeviceType::D3d11va => "d3d11va",
            DeviceType::Drm => "drm",
            DeviceType::OpenCl => "opencl",
            DeviceType::MediaCodec => "mediacodec",
            DeviceType::Vulkan => "vulkan",
            DeviceType::Other(_) => "unknown",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Other(raw) => write!(f, "unknown({})", raw),
            known => f.write_str(known.name()),
        }
    }
}

bitflags::bitflags! {
    /// How a hardware configuration has to be set up
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HwConfigMethods: u32 {
        /// Needs a device context supplied by the caller
        const HW_DEVICE_CTX = 0x01;
        const HW_FRAMES_CTX = 0x02;
        const INTERNAL = 0x04;
        const AD_HOC = 0x08;
    }
}

/// One hardware configuration advertised by a decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwConfig {
    /// Position in the decoder's own list, used to look the config up again
    pub index: usize,
    pub device_type: DeviceType,
    pub pix_fmt: PixelFormat,
    pub methods: HwConfigMethods,
}

impl HwConfig {
    pub fn needs_device_context(&self) -> bool {
        self.methods.contains(HwConfigMethods::HW_DEVICE_CTX)
    }
}

bitflags::bitflags! {
    /// Codec context behavior switches
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DecodeFlags: u32 {
        /// Output frames as soon as possible, no reordering delay
        const LOW_DELAY = 0x01;
        /// Output corrupt frames instead of dropping them
        const OUTPUT_CORRUPT = 0x02;
        /// Output frames even when references are missing
        const SHOW_ALL = 0x04;
        /// Fail on bitstream errors so the caller can request a key frame
        const EXPLODE = 0x08;
    }
}

/// Codec context settings applied before the decoder is opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSettings {
    pub width: u32,
    pub height: u32,
    pub flags: DecodeFlags,
    /// `Some(n)` for slice threading over n threads, `None` for one thread
    pub slice_threads: Option<usize>,
}

/// Device context and format strategy handed to `CodecEngine::open`
pub struct HwBinding<'a, D> {
    pub device: &'a D,
    pub selector: FormatSelector,
}

/// Decoded picture storage
pub trait FrameBuffer {
    fn format(&self) -> PixelFormat;
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn planes(&self) -> usize;
    fn stride(&self, plane: usize) -> usize;
    /// Host data of one plane. Only meaningful for host formats.
    fn data(&self, plane: usize) -> &[u8];
}

/// An opened decoder
pub trait DecodeContext {
    type Frame: FrameBuffer;

    /// Submit one access unit. `data` is followed in memory by the engine's
    /// input padding.
    fn send_packet(&mut self, data: &[u8]) -> Result<(), EngineError>;

    /// Receive one decoded frame into `frame`, `EngineError::Again` if none is ready
    fn receive_frame(&mut self, frame: &mut Self::Frame) -> Result<(), EngineError>;

    /// Drop frames and references buffered inside the decoder
    fn flush(&mut self);
}

/// The codec library a decode session runs on
pub trait CodecEngine {
    /// Bytes that must follow every submitted packet
    const INPUT_PADDING: usize;

    type Decoder;
    type Device;
    type Frame: FrameBuffer;
    type Context: DecodeContext<Frame = Self::Frame>;

    /// Namespace for device claims, see `registry`
    fn device_scope(&self) -> &str;

    /// Look a decoder up by name, `None` when it is not compiled in
    fn find_decoder(&self, name: &str) -> Option<Self::Decoder>;

    /// Hardware configurations in the order the decoder reports them
    fn hw_configs(&self, decoder: &Self::Decoder) -> Vec<HwConfig>;

    fn create_device(
        &self,
        decoder: &Self::Decoder,
        config: &HwConfig,
    ) -> Result<Self::Device, EngineError>;

    /// Allocate a codec context, apply `settings` and the optional hwaccel
    /// binding, and open it
    fn open(
        &self,
        decoder: &Self::Decoder,
        settings: &ContextSettings,
        hwaccel: Option<HwBinding<'_, Self::Device>>,
    ) -> Result<Self::Context, EngineError>;

    fn alloc_frame(&self) -> Result<Self::Frame, EngineError>;

    /// Download an accelerator frame into the host frame `staging`
    fn transfer(&self, staging: &mut Self::Frame, frame: &Self::Frame) -> Result<(), EngineError>;
}
