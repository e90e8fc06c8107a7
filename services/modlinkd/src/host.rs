//! Value sinks: where polled and written values go

use std::collections::HashMap;

use modlink_proto::Value;
use parking_lot::Mutex;
use tracing::info;

/// Receives value updates. Fire-and-forget: a sink logs its own failures.
pub trait ValueSink: Send + Sync {
    fn set_value(&self, id: &str, value: &Value, ack: bool);
}

/// Logs every update
#[derive(Debug, Default)]
pub struct LoggingSink;

impl ValueSink for LoggingSink {
    fn set_value(&self, id: &str, value: &Value, ack: bool) {
        info!("[VALUE] {} = {} (ack={})", id, value, ack);
    }
}

/// Keeps the latest value per id plus the full update history
#[derive(Debug, Default)]
pub struct MemorySink {
    values: Mutex<HashMap<String, Value>>,
    history: Mutex<Vec<(String, Value)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.values.lock().get(id).cloned()
    }

    /// Every update in arrival order
    pub fn history(&self) -> Vec<(String, Value)> {
        self.history.lock().clone()
    }

    /// Updates of one id in arrival order
    pub fn history_of(&self, id: &str) -> Vec<Value> {
        self.history
            .lock()
            .iter()
            .filter(|(k, _)| k == id)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.values.lock().clear();
        self.history.lock().clear();
    }
}

impl ValueSink for MemorySink {
    fn set_value(&self, id: &str, value: &Value, _ack: bool) {
        self.values.lock().insert(id.to_string(), value.clone());
        self.history.lock().push((id.to_string(), value.clone()));
    }
}
