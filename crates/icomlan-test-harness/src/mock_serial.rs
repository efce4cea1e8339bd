//! Recording serial bridge.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};

use icomlan_core::error::{Error, Result};
use icomlan_core::serial::SerialBridge;

#[derive(Default)]
struct SerialRecord {
    inits: Vec<String>,
    deinits: usize,
    fail_init: bool,
}

/// A [`SerialBridge`] that only records calls.
///
/// Clones share the same record.
#[derive(Clone, Default)]
pub struct RecordingSerialBridge {
    record: Arc<Mutex<SerialRecord>>,
}

impl RecordingSerialBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `init()` fail.
    pub fn fail_init(&self) {
        self.lock().fail_init = true;
    }

    /// Number of `init()` calls.
    pub fn inits(&self) -> usize {
        self.lock().inits.len()
    }

    /// Device names passed to `init()`.
    pub fn device_names(&self) -> Vec<String> {
        self.lock().inits.clone()
    }

    /// Number of `deinit()` calls.
    pub fn deinits(&self) -> usize {
        self.lock().deinits
    }

    fn lock(&self) -> MutexGuard<'_, SerialRecord> {
        self.record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SerialBridge for RecordingSerialBridge {
    async fn init(&mut self, device_name: &str) -> Result<()> {
        let mut record = self.lock();
        record.inits.push(device_name.to_string());
        if record.fail_init {
            return Err(Error::Transport("serial bridge unavailable".into()));
        }
        Ok(())
    }

    async fn deinit(&mut self) {
        self.lock().deinits += 1;
    }
}
