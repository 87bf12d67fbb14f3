// Execution history sink

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// One machine's run of one execution, as handed to history
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub execution_id: String,
    pub machine_id: String,
    pub machine_name: String,
    pub script_path: String,
    pub success: bool,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Where finished worker runs are recorded. Persistent stores live outside
/// this crate and plug in here.
pub trait HistorySink: Send + Sync {
    fn record(&self, entry: HistoryEntry);
}

#[derive(Debug, Default)]
pub struct MemoryHistory {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.lock().clone()
    }

    pub fn for_execution(&self, id: &str) -> Vec<HistoryEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.execution_id == id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl HistorySink for MemoryHistory {
    fn record(&self, entry: HistoryEntry) {
        self.entries.lock().push(entry);
    }
}
