//! FFmpeg codec engine
//!
//! Decoders are looked up by name through libavcodec. Hardware acceleration
//! uses the hwdevice API: the device context is attached to the codec context
//! and a `get_format` callback steers libavcodec to the negotiated surface
//! format. Accelerator frames are downloaded with `av_hwframe_transfer_data`.

use super::engine::{
    CodecEngine, ContextSettings, DecodeContext, DecodeFlags, DeviceType, EngineError,
    FrameBuffer, HwBinding, HwConfig, HwConfigMethods, PixelFormat,
};
use super::hwaccel::FormatSelector;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use ffmpeg_next::frame::Video as VideoFrame;
use ffmpeg_next::{Codec, Packet};
use std::ptr;
use std::sync::Once;

static FFMPEG_INIT: Once = Once::new();

/// Initialize FFmpeg (call once)
fn init_ffmpeg() {
    FFMPEG_INIT.call_once(|| {
        if let Err(e) = ffmpeg::init() {
            log::error!("Failed to initialize FFmpeg: {}", e);
        }
        // Verbose library logging in debug builds only
        if cfg!(debug_assertions) {
            ffmpeg::log::set_level(ffmpeg::log::Level::Info);
        } else {
            ffmpeg::log::set_level(ffmpeg::log::Level::Error);
        }
    });
}

fn engine_error(e: ffmpeg::Error) -> EngineError {
    match e {
        ffmpeg::Error::Eof => EngineError::Eof,
        ffmpeg::Error::Other { errno } if errno == ffmpeg::util::error::EAGAIN => {
            EngineError::Again
        }
        ffmpeg::Error::Other { errno } if errno == ffmpeg::util::error::ENOMEM => {
            EngineError::OutOfMemory(e.to_string())
        }
        e => EngineError::Backend {
            code: i32::from(e),
            message: e.to_string(),
        },
    }
}

fn pixel_format(raw: ffi::AVPixelFormat) -> PixelFormat {
    use ffi::AVPixelFormat::*;
    match raw {
        AV_PIX_FMT_YUV420P => PixelFormat::Yuv420p,
        AV_PIX_FMT_YUVJ420P => PixelFormat::Yuvj420p,
        AV_PIX_FMT_YUV420P10LE => PixelFormat::Yuv420p10,
        AV_PIX_FMT_NV12 => PixelFormat::Nv12,
        AV_PIX_FMT_P010LE => PixelFormat::P010,
        AV_PIX_FMT_VAAPI => PixelFormat::Vaapi,
        AV_PIX_FMT_CUDA => PixelFormat::Cuda,
        AV_PIX_FMT_VDPAU => PixelFormat::Vdpau,
        AV_PIX_FMT_QSV => PixelFormat::Qsv,
        AV_PIX_FMT_D3D11 => PixelFormat::D3d11,
        AV_PIX_FMT_DXVA2_VLD => PixelFormat::Dxva2,
        AV_PIX_FMT_VIDEOTOOLBOX => PixelFormat::VideoToolbox,
        AV_PIX_FMT_VULKAN => PixelFormat::Vulkan,
        AV_PIX_FMT_DRM_PRIME => PixelFormat::DrmPrime,
        AV_PIX_FMT_MEDIACODEC => PixelFormat::MediaCodec,
        other => PixelFormat::Other(other as i32),
    }
}

fn device_type(raw: ffi::AVHWDeviceType) -> DeviceType {
    use ffi::AVHWDeviceType::*;
    match raw {
        AV_HWDEVICE_TYPE_VDPAU => DeviceType::Vdpau,
        AV_HWDEVICE_TYPE_CUDA => DeviceType::Cuda,
        AV_HWDEVICE_TYPE_VAAPI => DeviceType::Vaapi,
        AV_HWDEVICE_TYPE_DXVA2 => DeviceType::Dxva2,
        AV_HWDEVICE_TYPE_QSV => DeviceType::Qsv,
        AV_HWDEVICE_TYPE_VIDEOTOOLBOX => DeviceType::VideoToolbox,
        AV_HWDEVICE_TYPE_D3D11VA => DeviceType::D3d11va,
        AV_HWDEVICE_TYPE_DRM => DeviceType::Drm,
        AV_HWDEVICE_TYPE_OPENCL => DeviceType::OpenCl,
        AV_HWDEVICE_TYPE_MEDIACODEC => DeviceType::MediaCodec,
        AV_HWDEVICE_TYPE_VULKAN => DeviceType::Vulkan,
        other => DeviceType::Other(other as i32),
    }
}

/// Convert to a C int field, out-of-range values are unsupported
fn to_c_int<T>(value: T, what: &str) -> Result<i32, EngineError>
where
    T: Copy + std::fmt::Display + TryInto<i32>,
{
    value
        .try_into()
        .map_err(|_| EngineError::Unsupported(format!("{} {} out of range", what, value)))
}

/// Raw hw config `index` of `codec`, null past the end of the list
fn raw_hw_config(codec: &Codec, index: usize) -> *const ffi::AVCodecHWConfig {
    let Ok(index) = i32::try_from(index) else {
        return ptr::null();
    };
    unsafe { ffi::avcodec_get_hw_config(codec.as_ptr(), index) }
}

/// Reference to an `AVHWDeviceContext`
pub struct HwDevice {
    ptr: *mut ffi::AVBufferRef,
}

impl Drop for HwDevice {
    fn drop(&mut self) {
        unsafe {
            ffi::av_buffer_unref(&mut self.ptr);
        }
    }
}

// The device context is reference counted and thread safe in libavutil
unsafe impl Send for HwDevice {}

/// Opened libavcodec decoder
pub struct FfmpegContext {
    decoder: ffmpeg::decoder::Video,
    // Read by `get_format` through the codec context's opaque pointer,
    // must outlive `decoder`
    _selector: Option<Box<FormatSelector>>,
}

impl DecodeContext for FfmpegContext {
    type Frame = VideoFrame;

    fn send_packet(&mut self, data: &[u8]) -> Result<(), EngineError> {
        let packet = Packet::borrow(data);
        self.decoder.send_packet(&packet).map_err(engine_error)
    }

    fn receive_frame(&mut self, frame: &mut VideoFrame) -> Result<(), EngineError> {
        self.decoder.receive_frame(frame).map_err(engine_error)
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

impl FrameBuffer for VideoFrame {
    fn format(&self) -> PixelFormat {
        pixel_format(VideoFrame::format(self).into())
    }

    fn width(&self) -> u32 {
        VideoFrame::width(self)
    }

    fn height(&self) -> u32 {
        VideoFrame::height(self)
    }

    fn planes(&self) -> usize {
        VideoFrame::planes(self)
    }

    fn stride(&self, plane: usize) -> usize {
        VideoFrame::stride(self, plane)
    }

    fn data(&self, plane: usize) -> &[u8] {
        VideoFrame::data(self, plane)
    }
}

/// Pick the negotiated hw surface format out of the formats libavcodec offers
unsafe extern "C" fn get_format(
    ctx: *mut ffi::AVCodecContext,
    fmts: *const ffi::AVPixelFormat,
) -> ffi::AVPixelFormat {
    unsafe {
        let selector = (*ctx).opaque as *const FormatSelector;
        if selector.is_null() || fmts.is_null() {
            return ffi::AVPixelFormat::AV_PIX_FMT_NONE;
        }

        let mut raw = Vec::new();
        let mut p = fmts;
        while *p != ffi::AVPixelFormat::AV_PIX_FMT_NONE {
            raw.push(*p);
            p = p.add(1);
        }

        let offered: Vec<PixelFormat> = raw.iter().map(|f| pixel_format(*f)).collect();
        match (*selector).select(&offered) {
            Some(chosen) => raw
                .into_iter()
                .find(|f| pixel_format(*f) == chosen)
                .unwrap_or(ffi::AVPixelFormat::AV_PIX_FMT_NONE),
            None => ffi::AVPixelFormat::AV_PIX_FMT_NONE,
        }
    }
}

/// Codec engine on top of libavcodec
pub struct FfmpegEngine {
    _private: (),
}

impl FfmpegEngine {
    pub fn new() -> Self {
        init_ffmpeg();
        Self { _private: () }
    }
}

impl Default for FfmpegEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecEngine for FfmpegEngine {
    const INPUT_PADDING: usize = ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;

    type Decoder = Codec;
    type Device = HwDevice;
    type Frame = VideoFrame;
    type Context = FfmpegContext;

    fn device_scope(&self) -> &str {
        "ffmpeg"
    }

    fn find_decoder(&self, name: &str) -> Option<Codec> {
        ffmpeg::decoder::find_by_name(name)
    }

    fn hw_configs(&self, decoder: &Codec) -> Vec<HwConfig> {
        let mut configs = Vec::new();
        for index in 0.. {
            let config = raw_hw_config(decoder, index);
            if config.is_null() {
                break;
            }
            let config = unsafe { &*config };
            configs.push(HwConfig {
                index,
                device_type: device_type(config.device_type),
                pix_fmt: pixel_format(config.pix_fmt),
                // AV_CODEC_HW_CONFIG_METHOD_* share our bit values
                methods: HwConfigMethods::from_bits_truncate(config.methods as u32),
            });
        }
        configs
    }

    fn create_device(&self, decoder: &Codec, config: &HwConfig) -> Result<HwDevice, EngineError> {
        let raw = raw_hw_config(decoder, config.index);
        if raw.is_null() {
            return Err(EngineError::Unsupported(format!(
                "no hw config {} on {}",
                config.index,
                decoder.name()
            )));
        }

        let mut device = HwDevice {
            ptr: ptr::null_mut(),
        };
        let ret = unsafe {
            ffi::av_hwdevice_ctx_create(
                &mut device.ptr,
                (*raw).device_type,
                ptr::null(),
                ptr::null_mut(),
                0,
            )
        };
        if ret < 0 {
            return Err(engine_error(ffmpeg::Error::from(ret)));
        }
        Ok(device)
    }

    fn open(
        &self,
        decoder: &Codec,
        settings: &ContextSettings,
        hwaccel: Option<HwBinding<'_, HwDevice>>,
    ) -> Result<FfmpegContext, EngineError> {
        let width = to_c_int(settings.width, "width")?;
        let height = to_c_int(settings.height, "height")?;
        let threads = settings
            .slice_threads
            .map(|n| to_c_int(n, "thread count"))
            .transpose()?;

        let selector = hwaccel.as_ref().map(|binding| Box::new(binding.selector));
        let mut context = ffmpeg::codec::Context::new_with_codec(*decoder);

        unsafe {
            let raw = context.as_mut_ptr();
            if raw.is_null() {
                return Err(EngineError::OutOfMemory("codec context".to_string()));
            }

            if settings.flags.contains(DecodeFlags::LOW_DELAY) {
                (*raw).flags |= ffi::AV_CODEC_FLAG_LOW_DELAY as i32;
            }
            if settings.flags.contains(DecodeFlags::OUTPUT_CORRUPT) {
                (*raw).flags |= ffi::AV_CODEC_FLAG_OUTPUT_CORRUPT as i32;
            }
            if settings.flags.contains(DecodeFlags::SHOW_ALL) {
                (*raw).flags2 |= ffi::AV_CODEC_FLAG2_SHOW_ALL as i32;
            }
            if settings.flags.contains(DecodeFlags::EXPLODE) {
                (*raw).err_recognition = ffi::AV_EF_EXPLODE as i32;
            }

            if let Some(threads) = threads {
                (*raw).thread_type = ffi::FF_THREAD_SLICE as i32;
                (*raw).thread_count = threads;
            } else {
                (*raw).thread_count = 1;
            }

            (*raw).width = width;
            (*raw).height = height;

            match (&hwaccel, &selector) {
                (Some(binding), Some(selector)) => {
                    (*raw).opaque = selector.as_ref() as *const FormatSelector as *mut _;
                    (*raw).get_format = Some(get_format);
                    (*raw).hw_device_ctx = ffi::av_buffer_ref(binding.device.ptr);
                    if (*raw).hw_device_ctx.is_null() {
                        return Err(EngineError::OutOfMemory(
                            "hw device context reference".to_string(),
                        ));
                    }
                }
                _ => {
                    (*raw).pix_fmt = ffi::AVPixelFormat::AV_PIX_FMT_YUV420P;
                }
            }
        }

        let decoder = context
            .decoder()
            .open_as(*decoder)
            .and_then(|opened| opened.video())
            .map_err(engine_error)?;

        Ok(FfmpegContext {
            decoder,
            _selector: selector,
        })
    }

    fn alloc_frame(&self) -> Result<VideoFrame, EngineError> {
        unsafe {
            let ptr = ffi::av_frame_alloc();
            if ptr.is_null() {
                return Err(EngineError::OutOfMemory("frame".to_string()));
            }
            Ok(VideoFrame::wrap(ptr))
        }
    }

    fn transfer(&self, staging: &mut VideoFrame, frame: &VideoFrame) -> Result<(), EngineError> {
        unsafe {
            let dst = staging.as_mut_ptr();
            let src = frame.as_ptr();

            // Reallocate the host buffers when the stream changes size
            if (*dst).width != (*src).width || (*dst).height != (*src).height {
                ffi::av_frame_unref(dst);
            }

            let ret = ffi::av_hwframe_transfer_data(dst, src, 0);
            if ret < 0 {
                return Err(engine_error(ffmpeg::Error::from(ret)));
            }
            let ret = ffi::av_frame_copy_props(dst, src);
            if ret < 0 {
                return Err(engine_error(ffmpeg::Error::from(ret)));
            }
        }
        Ok(())
    }
}
