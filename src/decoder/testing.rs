//! Scripted codec engine for unit tests.
//!
//! Decoders, device failures and allocation limits are set up front. Every
//! context, device and frame carries a token so tests can check for leaks and
//! teardown order through an `EngineProbe`.
//!
//! Packet conventions: a payload starting with `0xFF` is rejected on submit,
//! one starting with `0xEE` fails on receive.

use super::engine::{
    CodecEngine, ContextSettings, DecodeContext, DeviceType, EngineError, FrameBuffer, HwBinding,
    HwConfig, HwConfigMethods, PixelFormat,
};
use super::hwaccel::FormatSelector;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_SCOPE: AtomicUsize = AtomicUsize::new(0);

#[derive(Default)]
struct Ledger {
    live: HashMap<&'static str, usize>,
    released: Vec<&'static str>,
    open_attempts: Vec<String>,
    device_attempts: Vec<DeviceType>,
    submitted: Vec<Vec<u8>>,
    last_settings: Option<ContextSettings>,
    last_bound: Option<bool>,
    failing_devices: HashSet<DeviceType>,
    fail_transfer: bool,
    fail_context_alloc: bool,
    frame_budget: Option<usize>,
}

type Shared = Rc<RefCell<Ledger>>;

/// Counts one live resource of `kind` until dropped
#[derive(Debug)]
struct Token {
    kind: &'static str,
    ledger: Shared,
}

impl Token {
    fn new(kind: &'static str, ledger: &Shared) -> Self {
        *ledger.borrow_mut().live.entry(kind).or_default() += 1;
        Self {
            kind,
            ledger: ledger.clone(),
        }
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        let mut ledger = self.ledger.borrow_mut();
        if let Some(count) = ledger.live.get_mut(self.kind) {
            *count -= 1;
        }
        ledger.released.push(self.kind);
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").field("live", &self.live).finish()
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedDecoder {
    name: String,
    opens: bool,
    hw_configs: Vec<HwConfig>,
}

pub struct ScriptedEngine {
    scope: String,
    decoders: Vec<ScriptedDecoder>,
    ledger: Shared,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        let id = NEXT_SCOPE.fetch_add(1, Ordering::Relaxed);
        Self {
            scope: format!("scripted-{}", id),
            decoders: Vec::new(),
            ledger: Shared::default(),
        }
    }

    /// Share device claims with another engine
    pub fn with_scope(mut self, scope: &str) -> Self {
        self.scope = scope.to_string();
        self
    }

    /// Software-only decoder that opens
    pub fn with_decoder(self, name: &str) -> Self {
        self.with_hw_configs(name, Vec::new())
    }

    /// Decoder that is compiled in but fails to open
    pub fn with_broken_decoder(self, name: &str) -> Self {
        self.with_broken_hw_decoder(name, &[])
    }

    /// Decoder advertising device-context hwaccel configs
    pub fn with_hw_decoder(self, name: &str, configs: &[(DeviceType, PixelFormat)]) -> Self {
        self.with_hw_configs(name, device_configs(configs))
    }

    pub fn with_broken_hw_decoder(mut self, name: &str, configs: &[(DeviceType, PixelFormat)]) -> Self {
        self.decoders.push(ScriptedDecoder {
            name: name.to_string(),
            opens: false,
            hw_configs: device_configs(configs),
        });
        self
    }

    pub fn with_hw_configs(mut self, name: &str, hw_configs: Vec<HwConfig>) -> Self {
        self.decoders.push(ScriptedDecoder {
            name: name.to_string(),
            opens: true,
            hw_configs,
        });
        self
    }

    pub fn with_failing_device(self, device_type: DeviceType) -> Self {
        self.ledger.borrow_mut().failing_devices.insert(device_type);
        self
    }

    /// Inspection handle that stays valid after the engine moved into a session
    pub fn probe(&self) -> EngineProbe {
        EngineProbe {
            scope: self.scope.clone(),
            ledger: self.ledger.clone(),
        }
    }
}

fn device_configs(configs: &[(DeviceType, PixelFormat)]) -> Vec<HwConfig> {
    configs
        .iter()
        .enumerate()
        .map(|(index, &(device_type, pix_fmt))| HwConfig {
            index,
            device_type,
            pix_fmt,
            methods: HwConfigMethods::HW_DEVICE_CTX,
        })
        .collect()
}

pub struct EngineProbe {
    scope: String,
    ledger: Shared,
}

impl EngineProbe {
    pub fn scope(&self) -> String {
        self.scope.clone()
    }

    pub fn live(&self, kind: &str) -> usize {
        self.ledger.borrow().live.get(kind).copied().unwrap_or(0)
    }

    pub fn live_total(&self) -> usize {
        self.ledger.borrow().live.values().sum()
    }

    pub fn released(&self) -> Vec<&'static str> {
        self.ledger.borrow().released.clone()
    }

    pub fn clear_released(&self) {
        self.ledger.borrow_mut().released.clear();
    }

    pub fn open_attempts(&self) -> Vec<String> {
        self.ledger.borrow().open_attempts.clone()
    }

    pub fn device_attempts(&self) -> Vec<DeviceType> {
        self.ledger.borrow().device_attempts.clone()
    }

    pub fn submitted(&self) -> Vec<Vec<u8>> {
        self.ledger.borrow().submitted.clone()
    }

    pub fn last_settings(&self) -> Option<ContextSettings> {
        self.ledger.borrow().last_settings.clone()
    }

    /// Whether the last opened context got a device binding
    pub fn last_settings_bound_device(&self) -> Option<bool> {
        self.ledger.borrow().last_bound
    }

    pub fn set_transfer_failure(&self, fail: bool) {
        self.ledger.borrow_mut().fail_transfer = fail;
    }

    pub fn set_context_alloc_failure(&self, fail: bool) {
        self.ledger.borrow_mut().fail_context_alloc = fail;
    }

    /// Number of frame allocations that still succeed, `None` for unlimited
    pub fn set_frame_alloc_budget(&self, budget: Option<usize>) {
        self.ledger.borrow_mut().frame_budget = budget;
    }
}

#[derive(Debug)]
pub struct ScriptedDevice {
    _token: Token,
}

#[derive(Debug)]
pub struct ScriptedFrame {
    format: PixelFormat,
    width: u32,
    height: u32,
    planes: Vec<Vec<u8>>,
    strides: Vec<usize>,
    sequence: u64,
    _token: Option<Token>,
}

impl ScriptedFrame {
    fn empty(token: Option<Token>) -> Self {
        Self {
            format: PixelFormat::Yuv420p,
            width: 0,
            height: 0,
            planes: Vec::new(),
            strides: Vec::new(),
            sequence: 0,
            _token: token,
        }
    }

    /// Untracked host frame with filled planes
    pub fn host(format: PixelFormat, width: u32, height: u32, sequence: u64) -> Self {
        assert!(!format.is_hardware(), "{:?} is an accelerator format", format);
        Self::untracked(format, width, height, sequence)
    }

    /// Untracked accelerator frame, no host planes
    pub fn device(format: PixelFormat, width: u32, height: u32, sequence: u64) -> Self {
        assert!(format.is_hardware(), "{:?} is not an accelerator format", format);
        Self::untracked(format, width, height, sequence)
    }

    fn untracked(format: PixelFormat, width: u32, height: u32, sequence: u64) -> Self {
        let mut frame = Self::empty(None);
        frame.fill(format, width, height, sequence);
        frame
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn fill(&mut self, format: PixelFormat, width: u32, height: u32, sequence: u64) {
        self.format = format;
        self.width = width;
        self.height = height;
        self.sequence = sequence;
        if format.is_hardware() {
            self.planes.clear();
            self.strides.clear();
            return;
        }

        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let value = (sequence % 256) as u8;
        self.strides = vec![w, cw, cw];
        self.planes = vec![vec![value; w * h], vec![128; cw * ch], vec![128; cw * ch]];
    }
}

impl FrameBuffer for ScriptedFrame {
    fn format(&self) -> PixelFormat {
        self.format
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn planes(&self) -> usize {
        self.planes.len()
    }

    fn stride(&self, plane: usize) -> usize {
        self.strides[plane]
    }

    fn data(&self, plane: usize) -> &[u8] {
        &self.planes[plane]
    }
}

pub struct ScriptedContext {
    pending: VecDeque<Vec<u8>>,
    selector: Option<FormatSelector>,
    output_format: Option<PixelFormat>,
    width: u32,
    height: u32,
    produced: u64,
    ledger: Shared,
    _token: Token,
}

impl ScriptedContext {
    /// Mirrors the engine asking for a surface format on the first frame
    fn output_format(&mut self) -> PixelFormat {
        if let Some(format) = self.output_format {
            return format;
        }
        let format = match &self.selector {
            Some(selector) => selector
                .select(&[selector.target(), PixelFormat::Yuv420p])
                .unwrap_or(PixelFormat::Yuv420p),
            None => PixelFormat::Yuv420p,
        };
        self.output_format = Some(format);
        format
    }
}

impl DecodeContext for ScriptedContext {
    type Frame = ScriptedFrame;

    fn send_packet(&mut self, data: &[u8]) -> Result<(), EngineError> {
        self.ledger.borrow_mut().submitted.push(data.to_vec());
        if data.first() == Some(&0xFF) {
            return Err(EngineError::Backend {
                code: -1094995529,
                message: "Invalid data found when processing input".to_string(),
            });
        }
        self.pending.push_back(data.to_vec());
        Ok(())
    }

    fn receive_frame(&mut self, frame: &mut ScriptedFrame) -> Result<(), EngineError> {
        let Some(packet) = self.pending.pop_front() else {
            return Err(EngineError::Again);
        };
        if packet.first() == Some(&0xEE) {
            return Err(EngineError::Backend {
                code: -1094995529,
                message: "Invalid data found when processing input".to_string(),
            });
        }

        self.produced += 1;
        let format = self.output_format();
        frame.fill(format, self.width, self.height, self.produced);
        Ok(())
    }

    fn flush(&mut self) {
        self.pending.clear();
    }
}

impl CodecEngine for ScriptedEngine {
    const INPUT_PADDING: usize = 64;

    type Decoder = ScriptedDecoder;
    type Device = ScriptedDevice;
    type Frame = ScriptedFrame;
    type Context = ScriptedContext;

    fn device_scope(&self) -> &str {
        &self.scope
    }

    fn find_decoder(&self, name: &str) -> Option<ScriptedDecoder> {
        self.decoders.iter().find(|d| d.name == name).cloned()
    }

    fn hw_configs(&self, decoder: &ScriptedDecoder) -> Vec<HwConfig> {
        decoder.hw_configs.clone()
    }

    fn create_device(
        &self,
        _decoder: &ScriptedDecoder,
        config: &HwConfig,
    ) -> Result<ScriptedDevice, EngineError> {
        let failing = {
            let mut ledger = self.ledger.borrow_mut();
            ledger.device_attempts.push(config.device_type);
            ledger.failing_devices.contains(&config.device_type)
        };
        if failing {
            return Err(EngineError::Backend {
                code: -5,
                message: "Input/output error".to_string(),
            });
        }
        Ok(ScriptedDevice {
            _token: Token::new("device", &self.ledger),
        })
    }

    fn open(
        &self,
        decoder: &ScriptedDecoder,
        settings: &ContextSettings,
        hwaccel: Option<HwBinding<'_, ScriptedDevice>>,
    ) -> Result<ScriptedContext, EngineError> {
        {
            let mut ledger = self.ledger.borrow_mut();
            if ledger.fail_context_alloc {
                return Err(EngineError::OutOfMemory("codec context".to_string()));
            }
            ledger.open_attempts.push(decoder.name.clone());
            if !decoder.opens {
                return Err(EngineError::Backend {
                    code: -22,
                    message: "Invalid argument".to_string(),
                });
            }
            ledger.last_settings = Some(settings.clone());
            ledger.last_bound = Some(hwaccel.is_some());
        }

        Ok(ScriptedContext {
            pending: VecDeque::new(),
            selector: hwaccel.map(|binding| binding.selector),
            output_format: None,
            width: settings.width,
            height: settings.height,
            produced: 0,
            ledger: self.ledger.clone(),
            _token: Token::new("context", &self.ledger),
        })
    }

    fn alloc_frame(&self) -> Result<ScriptedFrame, EngineError> {
        {
            let mut ledger = self.ledger.borrow_mut();
            match ledger.frame_budget {
                Some(0) => return Err(EngineError::OutOfMemory("frame".to_string())),
                Some(left) => ledger.frame_budget = Some(left - 1),
                None => {}
            }
        }
        Ok(ScriptedFrame::empty(Some(Token::new("frame", &self.ledger))))
    }

    fn transfer(&self, staging: &mut ScriptedFrame, frame: &ScriptedFrame) -> Result<(), EngineError> {
        if self.ledger.borrow().fail_transfer {
            return Err(EngineError::Backend {
                code: -5,
                message: "Input/output error".to_string(),
            });
        }
        if !frame.format.is_hardware() {
            return Err(EngineError::Unsupported(format!(
                "{:?} is not an accelerator format",
                frame.format
            )));
        }
        staging.fill(PixelFormat::Yuv420p, frame.width, frame.height, frame.sequence);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_constructors_match_memory_kind() {
        let host = ScriptedFrame::host(PixelFormat::Yuv420p, 4, 2, 1);
        assert_eq!(host.planes(), 3);
        assert_eq!(host.data(0).len(), 8);

        let device = ScriptedFrame::device(PixelFormat::Vaapi, 4, 2, 1);
        assert_eq!(device.planes(), 0);
        assert_eq!(device.width(), 4);
    }

    #[test]
    #[should_panic(expected = "not an accelerator format")]
    fn test_device_frame_needs_hw_format() {
        ScriptedFrame::device(PixelFormat::Nv12, 4, 2, 1);
    }

    #[test]
    #[should_panic(expected = "is an accelerator format")]
    fn test_host_frame_rejects_hw_format() {
        ScriptedFrame::host(PixelFormat::Cuda, 4, 2, 1);
    }
}
