// Task runner - executes a task list against one connection

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::streaming::{stop_pair, LineSink, OutputLine, StreamKind};
use super::Connection;
use crate::modules::{dispatch, shell_quote, ActionContext, ActionOutput};
use crate::output::errors::PorterError;
use crate::output::events::{EventEmitter, TaskProgress, TaskStatus, WorkflowProgress};
use crate::task::{Task, VarBag};

/// How long a timed-out command gets after SIGINT before its session closes
const TIMEOUT_GRACE: Duration = Duration::from_secs(2);

/// Knobs for one executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Report every task as ok without touching the target
    pub dry_run: bool,
    /// Sleep between attempts when a task sets no delay
    pub default_delay: Duration,
    /// Timeout for wait-* tasks that set none
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            dry_run: false,
            default_delay: Duration::from_secs(2),
            wait_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Outcome counters for a run. With loops, every iteration counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub total: usize,
    pub ok: usize,
    pub changed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Stats {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Fixed facts about the task iteration being reported on
struct TaskRun {
    index: usize,
    total: usize,
    name: String,
    action: String,
    max_attempts: u32,
    started_at: DateTime<Utc>,
    clock: Instant,
}

/// Runs task lists sequentially against a single host
pub struct Executor {
    conn: Arc<dyn Connection>,
    config: ExecutorConfig,
    events: Option<EventEmitter>,
    line_sink: Option<LineSink>,
}

impl Executor {
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Executor {
            conn,
            config: ExecutorConfig::default(),
            events: None,
            line_sink: None,
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    /// Receive every line streamed by run/capture and friends
    pub fn with_line_sink(mut self, sink: LineSink) -> Self {
        self.line_sink = Some(sink);
        self
    }

    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.config.dry_run = enabled;
        self
    }

    pub fn host(&self) -> &str {
        self.conn.host_name()
    }

    /// Run `tasks` in order. Stops at the first failure that is not
    /// ignored and returns it wrapped with the task name.
    pub async fn run(
        &self,
        workflow: &str,
        tasks: &[Task],
        vars: &mut VarBag,
    ) -> Result<Stats, PorterError> {
        let mut stats = Stats {
            total: tasks.len(),
            ..Default::default()
        };
        let clock = Instant::now();
        info!(host = %self.host(), workflow, tasks = tasks.len(), "starting task list");

        for (index, task) in tasks.iter().enumerate() {
            let result = if task.loop_items.is_empty() {
                self.run_iteration(index, tasks.len(), task, vars, &mut stats)
                    .await
            } else {
                let mut result = Ok(());
                for item in &task.loop_items {
                    vars.set_item(item.clone());
                    result = self
                        .run_iteration(index, tasks.len(), task, vars, &mut stats)
                        .await;
                    if result.is_err() {
                        break;
                    }
                }
                vars.clear_item();
                result
            };

            self.emit_workflow(workflow, tasks.len(), index + 1, &vars.expand(&task.name), clock);

            if let Err(e) = result {
                warn!(host = %self.host(), workflow, error = %e.plain_message(), "task list aborted");
                return Err(e);
            }
        }

        info!(
            host = %self.host(),
            workflow,
            ok = stats.ok,
            changed = stats.changed,
            skipped = stats.skipped,
            failed = stats.failed,
            "task list finished"
        );
        Ok(stats)
    }

    /// One pass over a task, or one loop iteration of it
    async fn run_iteration(
        &self,
        index: usize,
        total: usize,
        task: &Task,
        vars: &mut VarBag,
        stats: &mut Stats,
    ) -> Result<(), PorterError> {
        let run = TaskRun {
            index,
            total,
            name: vars.expand(&task.name),
            action: task.action.to_string(),
            max_attempts: task.max_attempts(),
            started_at: Utc::now(),
            clock: Instant::now(),
        };

        if let Some(ref cond) = task.when {
            if !cond.eval(vars) {
                debug!(host = %self.host(), task = %run.name, "condition false, skipping");
                stats.skipped += 1;
                self.emit(&run, TaskStatus::Skipped, 0, None);
                return Ok(());
            }
        }

        self.emit(&run, TaskStatus::Running, 1, None);

        if self.config.dry_run {
            stats.ok += 1;
            self.emit(&run, TaskStatus::Ok, 1, None);
            return Ok(());
        }

        let resolved = resolve(task, vars);

        if let Some(ref path) = resolved.creates {
            match self.path_exists(path).await {
                Ok(true) => {
                    debug!(host = %self.host(), task = %run.name, path, "creates target present, skipping");
                    stats.skipped += 1;
                    self.emit(&run, TaskStatus::Skipped, 1, None);
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => return self.fail(&run, task, 1, e, vars, stats),
            }
        }

        let mut attempt = 1;
        loop {
            match self.attempt(&resolved).await {
                Ok(out) => {
                    if let Some(ref var) = resolved.register {
                        vars.set(var.clone(), out.output);
                    }
                    stats.ok += 1;
                    stats.changed += 1;
                    self.emit(&run, TaskStatus::Changed, attempt, None);
                    return Ok(());
                }
                Err(e) if attempt < run.max_attempts => {
                    debug!(
                        host = %self.host(),
                        task = %run.name,
                        attempt,
                        error = %e.plain_message(),
                        "attempt failed, retrying"
                    );
                    self.emit(&run, TaskStatus::Retrying, attempt, Some(e.plain_message()));
                    tokio::time::sleep(task.delay.unwrap_or(self.config.default_delay)).await;
                    attempt += 1;
                    self.emit(&run, TaskStatus::Running, attempt, None);
                }
                Err(e) => return self.fail(&run, task, attempt, e, vars, stats),
            }
        }
    }

    /// Terminal handling for a task whose attempts are spent
    fn fail(
        &self,
        run: &TaskRun,
        task: &Task,
        attempt: u32,
        error: PorterError,
        vars: &mut VarBag,
        stats: &mut Stats,
    ) -> Result<(), PorterError> {
        if let (Some(var), Some(output)) = (task.register.as_ref(), error.output()) {
            vars.set(vars.expand(var), output.to_string());
        }

        if task.ignore {
            debug!(host = %self.host(), task = %run.name, "failure ignored");
            stats.ok += 1;
            self.emit(run, TaskStatus::Ok, attempt, Some(error.plain_message()));
            return Ok(());
        }

        stats.failed += 1;
        self.emit(run, TaskStatus::Failed, attempt, Some(error.plain_message()));
        Err(PorterError::TaskFailed {
            task: run.name.clone(),
            host: self.host().to_string(),
            source: Box::new(error),
        })
    }

    async fn attempt(&self, task: &Task) -> Result<ActionOutput, PorterError> {
        let ctx = ActionContext::new(self.conn.as_ref(), task)
            .with_sink(self.sink())
            .with_wait(self.config.wait_timeout, self.config.poll_interval);

        let Some(limit) = task.timeout.filter(|t| !t.is_zero() && !task.action.is_wait()) else {
            return dispatch(&ctx).await;
        };

        let (stop, token) = stop_pair(TIMEOUT_GRACE);
        let ctx = ctx.with_stop(token);
        let work = dispatch(&ctx);
        tokio::pin!(work);

        match tokio::time::timeout(limit, &mut work).await {
            Ok(result) => result,
            Err(_) => {
                // Interrupt the remote command and let it wind down, so the
                // connection is free again for the next task
                stop.stop();
                if tokio::time::timeout(TIMEOUT_GRACE * 2, &mut work).await.is_err() {
                    warn!(host = %self.host(), task = %task.name, "timed out action did not wind down");
                }
                Err(PorterError::Timeout {
                    operation: task.name.clone(),
                    duration_secs: limit.as_secs(),
                })
            }
        }
    }

    async fn path_exists(&self, path: &str) -> Result<bool, PorterError> {
        Ok(self
            .conn
            .exec(&format!("test -e {}", shell_quote(path)))
            .await?
            .success())
    }

    /// Line sink for actions: the caller's sink plus output events
    fn sink(&self) -> Option<LineSink> {
        let events = self.events.clone();
        let user = self.line_sink.clone();
        if events.is_none() && user.is_none() {
            return None;
        }
        let host = self.host().to_string();

        Some(Arc::new(move |line: OutputLine| {
            if let Some(ref events) = events {
                if line.kind != StreamKind::Exit {
                    events.output(host.clone(), line.clone());
                }
            }
            if let Some(ref user) = user {
                user(line);
            }
        }))
    }

    fn emit(&self, run: &TaskRun, status: TaskStatus, attempt: u32, error: Option<String>) {
        let Some(ref events) = self.events else {
            return;
        };
        events.task(TaskProgress {
            host: self.host().to_string(),
            index: run.index,
            total: run.total,
            name: run.name.clone(),
            action: run.action.clone(),
            status,
            attempt,
            max_attempts: run.max_attempts,
            error,
            started_at: run.started_at,
            duration: status.is_terminal().then(|| run.clock.elapsed()),
        });
    }

    fn emit_workflow(
        &self,
        workflow: &str,
        total: usize,
        completed: usize,
        current: &str,
        clock: Instant,
    ) {
        let Some(ref events) = self.events else {
            return;
        };
        let percent = if total == 0 {
            100.0
        } else {
            completed as f64 * 100.0 / total as f64
        };
        events.workflow(WorkflowProgress {
            host: self.host().to_string(),
            workflow: workflow.to_string(),
            total,
            completed,
            current_task: current.to_string(),
            percent,
            elapsed: Some(clock.elapsed()),
        });
    }
}

/// Copy of the task with every template field expanded against `vars`
fn resolve(task: &Task, vars: &VarBag) -> Task {
    let mut resolved = task.clone();
    resolved.name = vars.expand(&task.name);
    resolved.src = vars.expand(&task.src);
    resolved.dest = vars.expand(&task.dest);
    resolved.body = vars.expand(&task.body);
    resolved.mode = vars.expand(&task.mode);
    resolved.user = vars.expand(&task.user);
    resolved.creates = task.creates.as_deref().map(|c| vars.expand(c));
    resolved.register = task.register.as_deref().map(|r| vars.expand(r));
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LocalConnection;
    use crate::output::events::{create_event_channel, ExecutionEvent};
    use crate::task::{capture, if_equals, if_true, noop, run, tasks};
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn executor() -> (Executor, UnboundedReceiver<ExecutionEvent>) {
        let (emitter, rx) = create_event_channel();
        let exec = Executor::new(Arc::new(LocalConnection::new("localhost"))).with_events(emitter);
        (exec, rx)
    }

    fn statuses(rx: &mut UnboundedReceiver<ExecutionEvent>) -> Vec<TaskStatus> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ExecutionEvent::Task(p) = event {
                out.push(p.status);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_healthy_run_is_changed() {
        let (exec, mut rx) = executor();
        let list = tasks([run("true").retry(2)]);

        let stats = exec.run("deploy", &list, &mut VarBag::new()).await.unwrap();

        assert_eq!(
            stats,
            Stats {
                total: 1,
                ok: 1,
                changed: 1,
                ..Default::default()
            }
        );
        assert_eq!(
            statuses(&mut rx),
            vec![TaskStatus::Running, TaskStatus::Changed]
        );
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let (exec, mut rx) = executor();
        let list = tasks([run("false").retry(2).delay(Duration::from_millis(10))]);

        let err = exec
            .run("deploy", &list, &mut VarBag::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PorterError::TaskFailed { ref task, .. } if task == "run false"));
        assert_eq!(
            statuses(&mut rx),
            vec![
                TaskStatus::Running,
                TaskStatus::Retrying,
                TaskStatus::Running,
                TaskStatus::Retrying,
                TaskStatus::Running,
                TaskStatus::Failed,
            ]
        );
    }

    #[tokio::test]
    async fn test_retry_bound_counts_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("attempts");
        let (exec, _rx) = executor();
        let cmd = format!("echo x >> {}; false", counter.display());
        let list = tasks([run(cmd).retry(3).delay(Duration::from_millis(1))]);

        let _ = exec.run("count", &list, &mut VarBag::new()).await;

        let lines = std::fs::read_to_string(&counter).unwrap().lines().count();
        assert_eq!(lines, 4);
    }

    #[tokio::test]
    async fn test_ignored_failure_continues() {
        let (exec, _rx) = executor();
        let list = tasks([run("false").ignore(), run("true")]);

        let stats = exec.run("deploy", &list, &mut VarBag::new()).await.unwrap();

        assert_eq!(stats.total, 2);
        assert_eq!(stats.ok, 2);
        assert_eq!(stats.changed, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("second-ran");
        let (exec, _rx) = executor();
        let list = tasks([
            run("false"),
            run(format!("touch {}", marker.display())),
        ]);

        assert!(exec.run("deploy", &list, &mut VarBag::new()).await.is_err());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_creates_hit_skips_action() {
        let existing = tempfile::NamedTempFile::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let (exec, mut rx) = executor();
        let list = tasks([run(format!("touch {}", marker.display()))
            .creates(existing.path().to_str().unwrap())]);

        let stats = exec.run("deploy", &list, &mut VarBag::new()).await.unwrap();

        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.ok, 0);
        assert!(!marker.exists());
        assert_eq!(
            statuses(&mut rx),
            vec![TaskStatus::Running, TaskStatus::Skipped]
        );
    }

    #[tokio::test]
    async fn test_capture_registers_combined_output() {
        let (exec, _rx) = executor();
        let lines = Arc::new(parking_lot::Mutex::new(Vec::<OutputLine>::new()));
        let exec = exec.with_line_sink({
            let lines = lines.clone();
            Arc::new(move |l| lines.lock().push(l))
        });
        let list = tasks([capture("printf a; printf b 1>&2").register("o")]);
        let mut vars = VarBag::new();

        exec.run("capture", &list, &mut vars).await.unwrap();

        let o = vars.get("o").unwrap();
        assert!(o == "a\nb" || o == "b\na", "unexpected capture {:?}", o);

        let lines = lines.lock();
        let only = |kind: StreamKind| -> String {
            lines
                .iter()
                .filter(|l| l.kind == kind)
                .map(|l| l.text.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        };
        assert_eq!(only(StreamKind::Stdout), "a");
        assert_eq!(only(StreamKind::Stderr), "b");
    }

    #[tokio::test]
    async fn test_condition_false_emits_single_skip() {
        let (exec, mut rx) = executor();
        let list = tasks([run("true").when(if_true("deploy_enabled"))]);
        let mut vars = VarBag::new();
        vars.set_bool("deploy_enabled", false);

        let stats = exec.run("deploy", &list, &mut vars).await.unwrap();

        assert_eq!(stats.skipped, 1);
        assert_eq!(statuses(&mut rx), vec![TaskStatus::Skipped]);
    }

    #[tokio::test]
    async fn test_loop_runs_items_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log");
        let (exec, _rx) = executor();
        let list = tasks([run(format!("echo {{{{item}}}} >> {}", log.display()))
            .name("append {{item}}")
            .loop_over(["a", "b", "c"])]);
        let mut vars = VarBag::new();

        let stats = exec.run("loop", &list, &mut vars).await.unwrap();

        assert_eq!(std::fs::read_to_string(&log).unwrap(), "a\nb\nc\n");
        assert_eq!(stats.ok, 3);
        assert_eq!(stats.changed, 3);
        assert_eq!(vars.item(), "");
    }

    #[tokio::test]
    async fn test_loop_condition_per_iteration() {
        let (exec, _rx) = executor();
        let list = tasks([noop("only b")
            .loop_over(["a", "b"])
            .when(if_equals("target", "b"))]);
        let mut vars = VarBag::new();
        vars.set("target", "b");

        // Condition does not reference the item, so both iterations run
        let stats = exec.run("loop", &list, &mut vars).await.unwrap();
        assert_eq!(stats.ok, 2);

        vars.set("target", "c");
        let stats = exec.run("loop", &list, &mut vars).await.unwrap();
        assert_eq!(stats.skipped, 2);
    }

    #[tokio::test]
    async fn test_loop_failure_aborts_without_ignore() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log");
        let (exec, _rx) = executor();
        let cmd = format!(
            "echo {{{{item}}}} >> {}; test {{{{item}}}} != b",
            log.display()
        );
        let list = tasks([run(cmd).loop_over(["a", "b", "c"])]);
        let mut vars = VarBag::new();

        assert!(exec.run("loop", &list, &mut vars).await.is_err());
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "a\nb\n");
        assert_eq!(vars.item(), "");
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let (exec, mut rx) = executor();
        let exec = exec.dry_run(true);
        let list = tasks([run(format!("touch {}", marker.display()))]);

        let stats = exec.run("dry", &list, &mut VarBag::new()).await.unwrap();

        assert_eq!(stats.ok, 1);
        assert_eq!(stats.changed, 0);
        assert!(!marker.exists());
        assert_eq!(statuses(&mut rx), vec![TaskStatus::Running, TaskStatus::Ok]);
    }

    #[tokio::test]
    async fn test_variables_expand_in_name_and_body() {
        let (emitter, mut rx) = create_event_channel();
        let exec = Executor::new(Arc::new(LocalConnection::new("localhost"))).with_events(emitter);
        let list = tasks([capture("echo {{greeting}}")
            .name("say {{greeting}}")
            .register("said")]);
        let mut vars = VarBag::new();
        vars.set("greeting", "hello");

        exec.run("vars", &list, &mut vars).await.unwrap();

        assert_eq!(vars.get("said"), Some("hello"));
        let mut names = Vec::new();
        let mut workflow = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                ExecutionEvent::Task(p) => names.push(p.name),
                ExecutionEvent::Workflow(w) => workflow = Some(w),
                ExecutionEvent::Output { .. } => {}
            }
        }
        assert!(names.iter().all(|n| n == "say hello"));
        let workflow = workflow.unwrap();
        assert_eq!(workflow.completed, 1);
        assert_eq!(workflow.percent, 100.0);
    }

    #[tokio::test]
    async fn test_terminal_event_has_duration() {
        let (exec, mut rx) = executor();
        let list = tasks([run("true")]);
        exec.run("d", &list, &mut VarBag::new()).await.unwrap();

        let mut terminal = Vec::new();
        while let Ok(ExecutionEvent::Task(p)) = rx.try_recv() {
            if p.status.is_terminal() {
                terminal.push(p);
            }
        }
        assert_eq!(terminal.len(), 1);
        assert!(terminal[0].duration.is_some());
    }

    #[tokio::test]
    async fn test_action_timeout() {
        let (exec, _rx) = executor();
        let list = tasks([run("sleep 5").timeout(Duration::from_millis(100))]);

        let started = std::time::Instant::now();
        let err = exec
            .run("slow", &list, &mut VarBag::new())
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(4));
        match err {
            PorterError::TaskFailed { source, .. } => {
                assert!(matches!(*source, PorterError::Timeout { .. }))
            }
            other => panic!("unexpected error: {}", other.plain_message()),
        }
    }

    #[tokio::test]
    async fn test_timeout_interrupts_running_command() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("interrupted");
        let (exec, _rx) = executor();
        let cmd = format!(
            "trap 'touch {}; exit 130' INT; while true; do sleep 0.05; done",
            marker.display()
        );
        let list = tasks([
            run(cmd).timeout(Duration::from_millis(200)).ignore(),
            run("true"),
        ]);

        let started = std::time::Instant::now();
        let stats = exec.run("hung", &list, &mut VarBag::new()).await.unwrap();

        // The command saw SIGINT before the next task started
        assert!(marker.exists());
        assert_eq!(stats.ok, 2);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_loop_condition_sees_earlier_iterations() {
        let (exec, mut rx) = executor();
        let list = tasks([capture("echo {{item}}")
            .register("last")
            .when(!if_equals("last", "a"))
            .loop_over(["a", "b", "c"])]);
        let mut vars = VarBag::new();

        let stats = exec.run("loop", &list, &mut vars).await.unwrap();

        assert_eq!(stats.ok, 1);
        assert_eq!(stats.skipped, 2);
        assert_eq!(vars.get("last"), Some("a"));
        assert_eq!(
            statuses(&mut rx),
            vec![
                TaskStatus::Running,
                TaskStatus::Changed,
                TaskStatus::Skipped,
                TaskStatus::Skipped,
            ]
        );
    }
}
