// Execution tracker - per-execution lifecycle and result aggregation

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::output::errors::PorterError;

/// Wall-clock nanoseconds, bumped past `last` so callers sharing it never
/// see the same value twice
pub(crate) fn monotonic_nanos(last: &AtomicI64) -> i64 {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    match last.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| Some(now.max(prev + 1))) {
        Ok(prev) | Err(prev) => now.max(prev + 1),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one machine reported back
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub machine_id: String,
    pub machine_name: String,
    pub script_path: String,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Snapshot of a tracked execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub script_path: String,
    pub args: Vec<String>,
    pub machine_ids: Vec<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    /// Set once the execution is finalized; results are frozen from then on
    pub finished_at: Option<DateTime<Utc>>,
    pub results: Vec<ExecutionResult>,
}

impl ExecutionRecord {
    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }
}

/// All executions, each behind its own lock. Records are kept for the life
/// of the tracker.
#[derive(Debug, Default)]
pub struct ExecutionTracker {
    executions: DashMap<String, Arc<Mutex<ExecutionRecord>>>,
    last_nanos: AtomicI64,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh `exec-<nanos>` id, unique within this tracker
    pub fn next_id(&self) -> String {
        format!("exec-{}", monotonic_nanos(&self.last_nanos))
    }

    pub fn create(
        &self,
        id: &str,
        script_path: &str,
        args: &[String],
        machine_ids: &[String],
    ) -> Result<ExecutionRecord, PorterError> {
        let record = ExecutionRecord {
            id: id.to_string(),
            script_path: script_path.to_string(),
            args: args.to_vec(),
            machine_ids: machine_ids.to_vec(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            results: Vec::new(),
        };

        match self.executions.entry(id.to_string()) {
            Entry::Occupied(_) => Err(PorterError::action(
                "create_execution",
                format!("execution {} already exists", id),
            )),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(record.clone())));
                info!(id, script = script_path, machines = machine_ids.len(), "execution created");
                Ok(record)
            }
        }
    }

    fn entry(&self, id: &str) -> Result<Arc<Mutex<ExecutionRecord>>, PorterError> {
        self.executions
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| PorterError::NotFound {
                kind: "execution".to_string(),
                id: id.to_string(),
            })
    }

    pub fn get(&self, id: &str) -> Option<ExecutionRecord> {
        self.executions.get(id).map(|e| e.value().lock().clone())
    }

    /// Newest first
    pub fn list(&self) -> Vec<ExecutionRecord> {
        let mut records: Vec<_> = self
            .executions
            .iter()
            .map(|e| e.value().lock().clone())
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        records
    }

    pub fn list_running(&self) -> Vec<ExecutionRecord> {
        self.list()
            .into_iter()
            .filter(|r| r.status == ExecutionStatus::Running)
            .collect()
    }

    /// Append a machine's result. Accepted until the execution is finished,
    /// so workers of a cancelled execution still report in.
    pub fn add_result(&self, id: &str, result: ExecutionResult) -> Result<(), PorterError> {
        let entry = self.entry(id)?;
        let mut record = entry.lock();
        if record.finished_at.is_some() {
            return Err(PorterError::InvalidTransition {
                id: id.to_string(),
                from: record.status.to_string(),
                to: "result appended".to_string(),
            });
        }
        debug!(id, machine = %result.machine_id, success = result.success, "result recorded");
        record.results.push(result);
        Ok(())
    }

    /// Only `running -> terminal` moves are legal; re-asserting the current
    /// status is a no-op. Completed and failed freeze the record.
    pub fn set_status(&self, id: &str, status: ExecutionStatus) -> Result<(), PorterError> {
        let entry = self.entry(id)?;
        let mut record = entry.lock();
        if record.status == status {
            return Ok(());
        }
        if record.status.is_terminal() || status == ExecutionStatus::Running {
            return Err(PorterError::InvalidTransition {
                id: id.to_string(),
                from: record.status.to_string(),
                to: status.to_string(),
            });
        }
        record.status = status;
        if status != ExecutionStatus::Cancelled {
            record.finished_at = Some(Utc::now());
        }
        info!(id, %status, "execution status changed");
        Ok(())
    }

    /// Mark a running execution cancelled. Returns the machines that should
    /// receive the stop sentinel.
    pub fn cancel(&self, id: &str) -> Result<Vec<String>, PorterError> {
        self.set_status(id, ExecutionStatus::Cancelled)?;
        let entry = self.entry(id)?;
        let record = entry.lock();
        Ok(record.machine_ids.clone())
    }

    /// Settle the final status once every worker has joined: cancelled
    /// stays cancelled, any failed result makes it failed, otherwise
    /// completed.
    pub fn finish(&self, id: &str) -> Result<ExecutionStatus, PorterError> {
        let entry = self.entry(id)?;
        let mut record = entry.lock();
        if record.finished_at.is_some() {
            return Ok(record.status);
        }
        if record.status == ExecutionStatus::Running {
            record.status = if record.results.iter().any(|r| !r.success) {
                ExecutionStatus::Failed
            } else {
                ExecutionStatus::Completed
            };
        }
        record.finished_at = Some(Utc::now());
        info!(
            id,
            status = %record.status,
            results = record.results.len(),
            failed = record.failed_count(),
            "execution finished"
        );
        Ok(record.status)
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn result(machine: &str, success: bool) -> ExecutionResult {
        let now = Utc::now();
        ExecutionResult {
            machine_id: machine.to_string(),
            machine_name: machine.to_string(),
            script_path: "deploy/build.sh".to_string(),
            success,
            output: String::new(),
            error: (!success).then(|| "boom".to_string()),
            started_at: now,
            finished_at: now,
        }
    }

    fn machines(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_ids_are_unique() {
        let tracker = ExecutionTracker::new();
        let a = tracker.next_id();
        let b = tracker.next_id();
        assert!(a.starts_with("exec-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_create_and_get() {
        let tracker = ExecutionTracker::new();
        tracker
            .create("exec-1", "build.sh", &[], &machines(&["m1", "m2"]))
            .unwrap();

        let record = tracker.get("exec-1").unwrap();
        assert_eq!(record.status, ExecutionStatus::Running);
        assert_eq!(record.machine_ids, machines(&["m1", "m2"]));
        assert!(tracker.get("exec-2").is_none());
        assert!(tracker.create("exec-1", "x", &[], &[]).is_err());
    }

    #[test]
    fn test_finish_aggregates_results() {
        let tracker = ExecutionTracker::new();
        tracker.create("ok", "s", &[], &machines(&["m1"])).unwrap();
        tracker.create("bad", "s", &[], &machines(&["m1", "m2"])).unwrap();

        tracker.add_result("ok", result("m1", true)).unwrap();
        tracker.add_result("bad", result("m1", true)).unwrap();
        tracker.add_result("bad", result("m2", false)).unwrap();

        assert_eq!(tracker.finish("ok").unwrap(), ExecutionStatus::Completed);
        assert_eq!(tracker.finish("bad").unwrap(), ExecutionStatus::Failed);

        // Frozen after finishing
        assert!(tracker.add_result("ok", result("m9", true)).is_err());
        assert_eq!(tracker.get("ok").unwrap().results.len(), 1);
    }

    #[test]
    fn test_cancel_is_immediately_visible_and_sticky() {
        let tracker = ExecutionTracker::new();
        tracker.create("e", "s", &[], &machines(&["m1", "m2"])).unwrap();

        let targets = tracker.cancel("e").unwrap();
        assert_eq!(targets, machines(&["m1", "m2"]));
        assert_eq!(tracker.get("e").unwrap().status, ExecutionStatus::Cancelled);

        // Workers still report in, and a failure does not override the cancel
        tracker.add_result("e", result("m1", false)).unwrap();
        assert_eq!(tracker.finish("e").unwrap(), ExecutionStatus::Cancelled);
        assert_eq!(tracker.get("e").unwrap().results.len(), 1);
    }

    #[test]
    fn test_status_is_monotonic() {
        let tracker = ExecutionTracker::new();
        tracker.create("e", "s", &[], &[]).unwrap();

        tracker.set_status("e", ExecutionStatus::Completed).unwrap();
        tracker.set_status("e", ExecutionStatus::Completed).unwrap();
        assert!(matches!(
            tracker.set_status("e", ExecutionStatus::Running),
            Err(PorterError::InvalidTransition { .. })
        ));
        assert!(tracker.set_status("e", ExecutionStatus::Failed).is_err());
        assert!(tracker.cancel("e").is_err());
        assert_eq!(tracker.get("e").unwrap().status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_list_running() {
        let tracker = ExecutionTracker::new();
        tracker.create("a", "s", &[], &[]).unwrap();
        tracker.create("b", "s", &[], &[]).unwrap();
        tracker.finish("a").unwrap();

        let running: Vec<_> = tracker.list_running().into_iter().map(|r| r.id).collect();
        assert_eq!(running, vec!["b".to_string()]);
        assert_eq!(tracker.list().len(), 2);
    }

    #[test]
    fn test_unknown_execution() {
        let tracker = ExecutionTracker::new();
        assert!(matches!(
            tracker.add_result("nope", result("m1", true)),
            Err(PorterError::NotFound { .. })
        ));
        assert!(tracker.cancel("nope").is_err());
    }

    #[test]
    fn test_concurrent_results() {
        let tracker = Arc::new(ExecutionTracker::new());
        let ids: Vec<String> = (0..16).map(|i| format!("m{}", i)).collect();
        tracker.create("e", "s", &[], &ids).unwrap();

        let handles: Vec<_> = ids
            .iter()
            .cloned()
            .map(|m| {
                let tracker = tracker.clone();
                std::thread::spawn(move || tracker.add_result("e", result(&m, true)))
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }

        assert_eq!(tracker.get("e").unwrap().results.len(), 16);
    }
}
