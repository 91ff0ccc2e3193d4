// GPU -> CPU frame transfer
// Frames in the negotiated accelerator format are downloaded into one reusable staging frame

use super::FrameSource;
use super::engine::{CodecEngine, EngineError, FrameBuffer, PixelFormat};

/// Staging state of a session. Software sessions carry nothing.
#[derive(Debug)]
pub struct TransferPath<F> {
    accel: Option<Staging<F>>,
}

#[derive(Debug)]
struct Staging<F> {
    hw_format: PixelFormat,
    frame: F,
}

impl<F: FrameBuffer> TransferPath<F> {
    /// Frames are always host accessible, nothing to transfer
    pub fn software() -> Self {
        Self { accel: None }
    }

    pub fn accelerated(hw_format: PixelFormat, staging: F) -> Self {
        Self {
            accel: Some(Staging {
                hw_format,
                frame: staging,
            }),
        }
    }

    pub fn hw_format(&self) -> Option<PixelFormat> {
        self.accel.as_ref().map(|s| s.hw_format)
    }

    pub fn has_staging(&self) -> bool {
        self.accel.is_some()
    }

    /// True if `frame` is in the negotiated accelerator format
    pub fn needs_transfer(&self, frame: &F) -> bool {
        self.hw_format() == Some(frame.format())
    }

    /// Return a host-readable version of `frame`, downloading it into the
    /// staging frame when it sits in accelerator memory
    pub fn resolve<'a, E>(
        &'a mut self,
        engine: &E,
        frame: &'a F,
    ) -> Result<(&'a F, FrameSource), EngineError>
    where
        E: CodecEngine<Frame = F>,
    {
        match self.accel.as_mut() {
            Some(staging) if staging.hw_format == frame.format() => {
                engine.transfer(&mut staging.frame, frame)?;
                Ok((&staging.frame, FrameSource::Staging))
            }
            _ => Ok((frame, FrameSource::Ring)),
        }
    }

    /// Drop the staging frame
    pub fn release(&mut self) {
        self.accel = None;
    }
}
