// Progress events emitted during execution

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::executor::streaming::OutputLine;

/// Status of a task as it moves through the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Ok,
    Changed,
    Skipped,
    Failed,
    Retrying,
}

impl TaskStatus {
    /// Terminal statuses close a task's event sequence
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Ok | TaskStatus::Changed | TaskStatus::Skipped | TaskStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Ok => "ok",
            TaskStatus::Changed => "changed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
        }
    }
}

/// Per-task progress snapshot
#[derive(Debug, Clone, Serialize)]
pub struct TaskProgress {
    pub host: String,
    /// Zero-based position in the task list
    pub index: usize,
    pub total: usize,
    /// Task name after variable expansion
    pub name: String,
    pub action: String,
    pub status: TaskStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Set on terminal events only
    #[serde(with = "duration_ms")]
    pub duration: Option<Duration>,
}

/// Workflow-level progress for one host's task list
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowProgress {
    pub host: String,
    pub workflow: String,
    pub total: usize,
    pub completed: usize,
    pub current_task: String,
    pub percent: f64,
    #[serde(with = "duration_ms")]
    pub elapsed: Option<Duration>,
}

/// Events emitted during execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    Task(TaskProgress),
    Workflow(WorkflowProgress),
    /// One line of remote output from a streaming task
    Output { host: String, line: OutputLine },
}

/// Event emitter for sending execution events
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<ExecutionEvent>,
}

impl EventEmitter {
    /// Create a new event emitter with the given channel
    pub fn new(tx: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
        EventEmitter { tx }
    }

    pub fn task(&self, progress: TaskProgress) {
        let _ = self.tx.send(ExecutionEvent::Task(progress));
    }

    pub fn workflow(&self, progress: WorkflowProgress) {
        let _ = self.tx.send(ExecutionEvent::Workflow(progress));
    }

    pub fn output(&self, host: String, line: OutputLine) {
        let _ = self.tx.send(ExecutionEvent::Output { host, line });
    }
}

/// Create a new event channel
pub fn create_event_channel() -> (EventEmitter, mpsc::UnboundedReceiver<ExecutionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventEmitter::new(tx), rx)
}

/// Render a `█`/`░` bar for a percentage in `0..=100`
pub fn progress_bar(percent: f64, width: usize) -> String {
    let clamped = if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    };
    let filled = ((clamped / 100.0) * width as f64).round() as usize;
    let filled = filled.min(width);

    let mut bar = "█".repeat(filled);
    bar.push_str(&"░".repeat(width - filled));
    bar
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }
}
