// Exclusive device registry
// At most one live decode session per vendor backend or hwaccel device

use super::DecoderError;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashSet;

/// Global set of claimed device keys
static CLAIMED: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Held by a session for as long as it uses the device. Dropping it frees the key.
#[derive(Debug)]
pub struct DeviceClaim {
    key: String,
}

impl DeviceClaim {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        CLAIMED.lock().remove(&self.key);
        log::debug!("Released device {}", self.key);
    }
}

/// Claim `key`, failing with `DeviceBusy` if another session holds it
pub fn claim(key: impl Into<String>) -> Result<DeviceClaim, DecoderError> {
    let key = key.into();
    let mut claimed = CLAIMED.lock();
    if !claimed.insert(key.clone()) {
        return Err(DecoderError::DeviceBusy(key));
    }
    log::debug!("Claimed device {}", key);
    Ok(DeviceClaim { key })
}

pub fn is_claimed(key: &str) -> bool {
    CLAIMED.lock().contains(key)
}

/// Key for a vendor backend that owns its device directly
pub fn backend_key(scope: &str, backend: &str) -> String {
    format!("{}/backend:{}", scope, backend)
}

/// Key for a hwaccel device context
pub fn device_key(scope: &str, device: &str) -> String {
    format!("{}/device:{}", scope, device)
}
