//! Parameter store with NVS persistence
//!
//! Parameters live in the ESP32 Non-Volatile Storage under one namespace, one
//! key per parameter id. Text parameters are stored as strings and integer
//! parameters as `i32`; an integer that was written as a string by older
//! firmware is still accepted on read.

use std::sync::Mutex;

use esp_idf_svc::nvs::{EspNvs, EspNvsPartition, NvsDefault};
use log::{info, warn};
use modbus_cloud_bridge::config::{ConfigSource, ParamId, ParamKind, ParamStore};
use modbus_cloud_bridge::error::ConfigError;

/// NVS namespace for device parameters
const NVS_NAMESPACE: &str = "device_param";

/// Longest text value any parameter accepts, plus the terminator
const MAX_TEXT_LEN: usize = 129;

/// Parameter store backed by NVS.
pub struct NvsParams {
    nvs: Mutex<EspNvs<NvsDefault>>,
}

impl NvsParams {
    pub fn open(partition: EspNvsPartition<NvsDefault>) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)?;
        info!("Parameter store opened (namespace {})", NVS_NAMESPACE);
        Ok(Self { nvs: Mutex::new(nvs) })
    }

    /// Logs every parameter and its current value (passwords masked).
    pub fn dump(&self) {
        for id in ParamId::ALL {
            match self.get_string(id) {
                Ok(_) if id == ParamId::WifiPassword => info!("  {}: ********", id),
                Ok(value) => info!("  {}: {}", id, value),
                Err(_) => info!("  {}: <default>", id),
            }
        }
    }

    fn lock(&self, id: ParamId) -> Result<std::sync::MutexGuard<'_, EspNvs<NvsDefault>>, ConfigError> {
        self.nvs.lock().map_err(|_| storage(id, "lock poisoned"))
    }

    fn read_text(&self, id: ParamId) -> Result<Option<String>, ConfigError> {
        let nvs = self.lock(id)?;
        let mut buf = [0u8; MAX_TEXT_LEN];
        match nvs.get_str(id.spec().key, &mut buf) {
            Ok(value) => Ok(value.map(str::to_string)),
            Err(e) => {
                warn!("Failed to read NVS key {}: {}", id.spec().key, e);
                Err(storage(id, e))
            }
        }
    }

    fn read_int(&self, id: ParamId) -> Result<Option<i32>, ConfigError> {
        let nvs = self.lock(id)?;
        match nvs.get_i32(id.spec().key) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!("Failed to read NVS key {}: {}", id.spec().key, e);
                Err(storage(id, e))
            }
        }
    }
}

fn storage(id: ParamId, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Storage { id: id.code(), reason: reason.to_string() }
}

impl ConfigSource for NvsParams {
    fn get_string(&self, id: ParamId) -> Result<String, ConfigError> {
        match id.spec().kind {
            ParamKind::Text { .. } => self.read_text(id)?.ok_or(ConfigError::Missing(id.code())),
            ParamKind::Int { .. } => self.get_int(id).map(|v| v.to_string()),
        }
    }

    fn get_int(&self, id: ParamId) -> Result<i32, ConfigError> {
        // Integers written as text by older firmware have an i32 type mismatch
        if let Ok(Some(value)) = self.read_int(id) {
            return Ok(value);
        }
        let text = self.read_text(id)?.ok_or(ConfigError::Missing(id.code()))?;
        text.trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { id: id.code(), value: text })
    }
}

impl ParamStore for NvsParams {
    fn set_string(&self, id: ParamId, value: &str) -> Result<(), ConfigError> {
        id.spec().validate_text(value)?;
        self.lock(id)?.set_str(id.spec().key, value).map_err(|e| storage(id, e))?;
        info!("Parameter {} saved", id);
        Ok(())
    }

    fn set_int(&self, id: ParamId, value: i32) -> Result<(), ConfigError> {
        id.spec().validate_int(value)?;
        let mut nvs = self.lock(id)?;
        // Drop any string-typed entry left under the same key first
        let _ = nvs.remove(id.spec().key);
        nvs.set_i32(id.spec().key, value).map_err(|e| storage(id, e))?;
        info!("Parameter {} saved", id);
        Ok(())
    }
}
