//! Decode session
//!
//! Owns the opened codec context, the frame ring, the staging frame and the
//! hwaccel device. `init` is the only way to get a session; dropping it (or
//! calling `destroy`) releases everything exactly once.
//!
//! Packets must be submitted in bitstream order. `decode` and `get_frame`
//! take `&mut self`, so concurrent use needs outside synchronization.

use super::engine::{CodecEngine, ContextSettings, DecodeContext, DecodeFlags, DeviceType, PixelFormat};
use super::hwaccel::Negotiated;
use super::probe::{self, BackendKind};
use super::registry::DeviceClaim;
use super::ring::FrameRing;
use super::transfer::TransferPath;
use super::{
    CodecFamily, DecodedFrame, DecoderConfig, DecoderError, FrameSource, PerfFlags, Preference,
};

/// Per-session counters, informational only
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    pub packets_submitted: u64,
    pub submit_errors: u64,
    pub frames_decoded: u64,
    pub receive_errors: u64,
    pub transfers: u64,
    pub transfer_errors: u64,
}

/// A live decoder.
///
/// Field order is the teardown order: staging frame, device context and its
/// claims, codec context, frame slots.
pub struct DecodeSession<E: CodecEngine> {
    transfer: TransferPath<E::Frame>,
    device: Option<(DeviceType, E::Device)>,
    claims: Vec<DeviceClaim>,
    context: E::Context,
    ring: FrameRing<E::Frame>,
    engine: E,
    family: CodecFamily,
    preference: Preference,
    decoder_name: &'static str,
    backend_kind: BackendKind,
    stats: DecodeStats,
}

impl<E: CodecEngine> DecodeSession<E> {
    /// Probe and open a decoder for `config`. Must be called before any
    /// other decoding function.
    ///
    /// On failure everything acquired so far has been released.
    pub fn init(engine: E, config: &DecoderConfig) -> Result<Self, DecoderError> {
        config.validate()?;
        let family = config.video_format.family()?;
        let preference = config.preference();

        let settings = ContextSettings {
            width: config.width,
            height: config.height,
            // Low delay decoding. Display corrupt frames and frames missing
            // references, report decoding errors to allow us to request a key frame.
            flags: DecodeFlags::LOW_DELAY
                | DecodeFlags::OUTPUT_CORRUPT
                | DecodeFlags::SHOW_ALL
                | DecodeFlags::EXPLODE,
            slice_threads: config
                .perf_flags
                .contains(PerfFlags::SLICE_THREADING)
                .then_some(config.thread_count),
        };

        let selected = probe::select_decoder(&engine, family, preference, &settings)?;
        let candidate = selected.candidate;

        let mut claims: Vec<DeviceClaim> = selected.backend_claim.into_iter().collect();
        let (transfer, device) = match selected.accel {
            Some(Negotiated {
                device,
                device_type,
                selector,
                claim,
            }) => {
                claims.push(claim);
                let staging = engine.alloc_frame().map_err(|e| {
                    log::error!("Couldn't allocate staging frame: {}", e);
                    DecoderError::Allocation(e)
                })?;
                (
                    TransferPath::accelerated(selector.target(), staging),
                    Some((device_type, device)),
                )
            }
            None => (TransferPath::software(), None),
        };

        let ring = FrameRing::allocate(config.buffer_count, || engine.alloc_frame()).map_err(|e| {
            log::error!("Couldn't allocate frames: {}", e);
            DecoderError::Allocation(e)
        })?;

        log::info!(
            "Decoder {} ready: {} {}x{}, {} buffers, {}",
            candidate.name,
            family,
            config.width,
            config.height,
            config.buffer_count,
            match settings.slice_threads {
                Some(n) => format!("{} slice threads", n),
                None => "single threaded".to_string(),
            }
        );

        Ok(Self {
            transfer,
            device,
            claims,
            context: selected.context,
            ring,
            engine,
            family,
            preference,
            decoder_name: candidate.name,
            backend_kind: candidate.kind,
            stats: DecodeStats::default(),
        })
    }

    /// Submit one access unit, `buf[..len]`.
    ///
    /// `buf` must extend at least `E::INPUT_PADDING` bytes past `len`. A
    /// failed submit leaves the session usable.
    pub fn decode(&mut self, buf: &[u8], len: usize) -> Result<(), DecoderError> {
        let required = len.saturating_add(E::INPUT_PADDING);
        if buf.len() < required {
            return Err(DecoderError::InsufficientPadding {
                len,
                available: buf.len().saturating_sub(len),
                required: E::INPUT_PADDING,
            });
        }

        self.stats.packets_submitted += 1;
        if let Err(e) = self.context.send_packet(&buf[..len]) {
            self.stats.submit_errors += 1;
            log::warn!("Decode failed - {}", e);
            return Err(DecoderError::Submit(e));
        }
        Ok(())
    }

    /// Submit the access unit held by a `PacketBuffer`
    pub fn decode_packet(&mut self, packet: &super::PacketBuffer) -> Result<(), DecoderError> {
        self.decode(packet.padded(), packet.len())
    }

    /// Receive one decoded frame if the decoder has one.
    ///
    /// `Ok(None)` when the decoder needs more input. With `cpu_visible`, or
    /// on a software-preference session, accelerator frames are downloaded
    /// into the staging frame. The frame is dropped on receive or transfer
    /// errors; the next key frame recovers.
    pub fn get_frame(
        &mut self,
        cpu_visible: bool,
    ) -> Result<Option<DecodedFrame<'_, E::Frame>>, DecoderError> {
        let (_, target) = self.ring.acquire_next_slot();
        match self.context.receive_frame(target) {
            Ok(()) => {}
            Err(e) if e.is_no_frame() => return Ok(None),
            Err(e) => {
                self.stats.receive_errors += 1;
                log::warn!("Receive failed - {}", e);
                return Err(DecoderError::Receive(e));
            }
        }
        let (slot, frame) = self.ring.advance();
        self.stats.frames_decoded += 1;

        if self.preference == Preference::Software || cpu_visible {
            return match self.transfer.resolve(&self.engine, frame) {
                Ok((frame, source)) => {
                    if source == FrameSource::Staging {
                        self.stats.transfers += 1;
                    }
                    Ok(Some(DecodedFrame::new(frame, slot, source)))
                }
                Err(e) => {
                    self.stats.transfer_errors += 1;
                    log::error!("Error transferring the data to system memory: {}", e);
                    Err(DecoderError::Transfer(e))
                }
            };
        }

        Ok(Some(DecodedFrame::new(frame, slot, FrameSource::Ring)))
    }

    /// Drop frames buffered inside the decoder, e.g. after requesting a key frame.
    /// Ring slots keep their contents.
    pub fn reset(&mut self) {
        log::debug!("Flushing decoder {}", self.decoder_name);
        self.context.flush();
    }

    /// Release all decoder resources. Dropping the session does the same.
    pub fn destroy(self) {
        log::info!("Destroying decoder {}", self.decoder_name);
    }

    pub fn decoder_name(&self) -> &'static str {
        self.decoder_name
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend_kind
    }

    pub fn family(&self) -> CodecFamily {
        self.family
    }

    pub fn preference(&self) -> Preference {
        self.preference
    }

    /// Device type of the hwaccel context, `None` in pure software mode
    pub fn hw_device(&self) -> Option<DeviceType> {
        self.device.as_ref().map(|(device_type, _)| *device_type)
    }

    /// Negotiated accelerator surface format
    pub fn hw_pixel_format(&self) -> Option<PixelFormat> {
        self.transfer.hw_format()
    }

    pub fn ring_capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn current_slot(&self) -> Option<usize> {
        self.ring.current_index()
    }

    pub fn next_slot(&self) -> usize {
        self.ring.next_index()
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }
}

impl<E: CodecEngine> Drop for DecodeSession<E> {
    fn drop(&mut self) {
        // Fields drop in declaration order afterwards; the staging frame
        // goes first explicitly so it never outlives the device.
        self.transfer.release();
        self.device = None;
        self.claims.clear();
    }
}
