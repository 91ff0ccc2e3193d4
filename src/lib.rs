// GameStream decoder - Low latency video decoding for game streaming clients
// Main library entry point

pub mod decoder;

pub use decoder::{
    CodecFamily, DecodeSession, DecodeStats, DecodedFrame, DecoderConfig, DecoderError,
    FrameMemory, FrameSource, PacketBuffer, PerfFlags, Preference, VideoFormat,
};

#[cfg(feature = "ffmpeg")]
pub use decoder::create_session;
