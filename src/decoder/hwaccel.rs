// Hardware acceleration negotiation
// Picks the first advertised device type we can claim and open a device for

use super::engine::{CodecEngine, DeviceType, HwConfig, PixelFormat};
use super::registry::{self, DeviceClaim};

/// Pixel format strategy bound to a codec context at negotiation time.
///
/// The engine offers its candidate formats during the first decode and the
/// selector answers with the negotiated surface format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatSelector {
    target: PixelFormat,
}

impl FormatSelector {
    pub fn new(target: PixelFormat) -> Self {
        Self { target }
    }

    pub fn target(&self) -> PixelFormat {
        self.target
    }

    /// `None` means no usable format was offered
    pub fn select(&self, offered: &[PixelFormat]) -> Option<PixelFormat> {
        if offered.contains(&self.target) {
            Some(self.target)
        } else {
            log::error!(
                "Failed to get HW surface format {:?}, decoder offered {:?}",
                self.target,
                offered
            );
            None
        }
    }
}

/// Result of a successful negotiation
#[derive(Debug)]
pub struct Negotiated<D> {
    pub device: D,
    pub device_type: DeviceType,
    pub selector: FormatSelector,
    /// Exclusive claim on the device type, released after `device`
    pub claim: DeviceClaim,
}

impl<D> Negotiated<D> {
    pub fn pix_fmt(&self) -> PixelFormat {
        self.selector.target()
    }
}

/// Create a device context for the first config that takes one.
///
/// A device type held by another session is skipped before anything is
/// created. Busy devices and creation failures move on to the next config;
/// `None` means the decoder runs with a software pixel format.
pub fn negotiate<E: CodecEngine>(
    engine: &E,
    decoder: &E::Decoder,
    decoder_name: &str,
    configs: &[HwConfig],
) -> Option<Negotiated<E::Device>> {
    for config in configs.iter().filter(|c| c.needs_device_context()) {
        let key = registry::device_key(engine.device_scope(), config.device_type.name());
        let claim = match registry::claim(key) {
            Ok(claim) => claim,
            Err(e) => {
                log::warn!(
                    "Skipping hwaccel type {} for {}: {}",
                    config.device_type,
                    decoder_name,
                    e
                );
                continue;
            }
        };
        log::info!("Using hwaccel type {}", config.device_type);

        match engine.create_device(decoder, config) {
            Ok(device) => {
                return Some(Negotiated {
                    device,
                    device_type: config.device_type,
                    selector: FormatSelector::new(config.pix_fmt),
                    claim,
                });
            }
            Err(e) => {
                log::warn!(
                    "Failed to create {} device for {}: {}",
                    config.device_type,
                    decoder_name,
                    e
                );
            }
        }
    }

    log::warn!(
        "Decoder {} does not support any of the available hwaccel methods",
        decoder_name
    );
    None
}
