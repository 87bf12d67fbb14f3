// Orchestrator - fans executions out across machines and tracks them

pub mod history;
pub mod tracker;

pub use history::{HistoryEntry, HistorySink, MemoryHistory};
pub use tracker::{ExecutionRecord, ExecutionResult, ExecutionStatus, ExecutionTracker};

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::executor::{Connection, Connector, Executor, ExecutorConfig};
use crate::guard::{CommandGuard, RateLimiter};
use crate::inventory::{Host, MachineStore};
use crate::modules::{shell_quote, split_exit_code, wrap_command, wrap_with_exit_code};
use crate::output::errors::PorterError;
use crate::output::events::EventEmitter;
use crate::task::{capture, rm, run, upload, Task, VarBag};
use crate::transfer::{self, UploadOptions, UploadReport};
use tracker::monotonic_nanos;

const OUTPUT_VAR: &str = "script_output";

/// Remote layout and sentinel used for script executions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySettings {
    pub temp_root: String,
    pub sentinel_path: String,
    pub interpreter: String,
}

impl Default for DeploySettings {
    fn default() -> Self {
        DeploySettings {
            temp_root: "/tmp".to_string(),
            sentinel_path: "/tmp/.build_stop".to_string(),
            interpreter: "bash".to_string(),
        }
    }
}

/// Run a script on a set of machines
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteRequest {
    pub machine_ids: Vec<String>,
    pub script_path: String,
    #[serde(default)]
    pub flags: Vec<String>,
}

/// One ad-hoc command on one machine
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandRequest {
    pub machine_id: String,
    pub command: String,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub skip_validate: bool,
    #[serde(default)]
    pub sudo: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub machine_id: String,
    pub machine_name: String,
    pub command: String,
    pub output: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Where one script lands on a target
#[derive(Debug, Clone)]
struct DeployLayout {
    root: String,
    script_dir: PathBuf,
    remote_dir: String,
    lib_dir: Option<PathBuf>,
    script_name: String,
}

impl DeployLayout {
    /// `<temp_root>/idx-deploy-<nanos>/<script dir name>/`, plus a sibling
    /// `lib/` when the script's directory has one next to it
    fn new(settings: &DeploySettings, script: &Path, nanos: i64) -> Result<Self, PorterError> {
        let script = std::fs::canonicalize(script).map_err(|e| PorterError::Io {
            message: format!("Cannot read script: {}", e),
            path: Some(script.to_path_buf()),
        })?;
        let script_name = script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PorterError::Io {
                message: "Script path has no file name".to_string(),
                path: Some(script.clone()),
            })?;
        let script_dir = script
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        let dir_base = script_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "script".to_string());

        let lib_dir = script_dir
            .parent()
            .map(|p| p.join("lib"))
            .filter(|lib| lib.is_dir() && *lib != script_dir);

        let root = format!(
            "{}/idx-deploy-{}",
            settings.temp_root.trim_end_matches('/'),
            nanos
        );
        Ok(DeployLayout {
            remote_dir: format!("{}/{}", root, dir_base),
            root,
            script_dir,
            lib_dir,
            script_name,
        })
    }

    /// setup -> upload -> execute; cleanup runs separately so it happens
    /// even when a step fails
    fn tasks(&self, interpreter: &str, args: &[String]) -> Vec<Task> {
        let mut list: Vec<Task> = vec![
            run(format!("mkdir -p {}", shell_quote(&self.remote_dir)))
                .name("Create deploy directory")
                .build(),
            upload(self.script_dir.to_string_lossy(), self.remote_dir.clone())
                .recursive()
                .name("Upload script directory")
                .build(),
        ];
        if let Some(lib) = &self.lib_dir {
            list.push(
                upload(lib.to_string_lossy(), format!("{}/lib", self.root))
                    .recursive()
                    .name("Upload shared lib")
                    .build(),
            );
        }

        let args: String = args.iter().map(|a| format!(" {}", shell_quote(a))).collect();
        list.push(
            capture(format!(
                "cd {} && {} {}{}",
                shell_quote(&self.remote_dir),
                interpreter,
                shell_quote(&self.script_name),
                args
            ))
            .name(format!("Run {}", self.script_name))
            .register(OUTPUT_VAR)
            .build(),
        );
        list
    }

    fn cleanup(&self) -> Vec<Task> {
        vec![rm(self.root.clone())
            .recursive()
            .ignore()
            .name("Remove deploy directory")
            .build()]
    }
}

/// Wires machines, connections, guards and the tracker together
#[derive(Clone)]
pub struct Orchestrator {
    connector: Arc<dyn Connector>,
    machines: Arc<dyn MachineStore>,
    tracker: Arc<ExecutionTracker>,
    limiter: Arc<RateLimiter>,
    guard: Arc<CommandGuard>,
    history: Arc<dyn HistorySink>,
    executor: ExecutorConfig,
    deploy: DeploySettings,
    events: Option<EventEmitter>,
    deploy_nanos: Arc<AtomicI64>,
}

impl Orchestrator {
    pub fn new(connector: Arc<dyn Connector>, machines: Arc<dyn MachineStore>) -> Self {
        Orchestrator {
            connector,
            machines,
            tracker: Arc::new(ExecutionTracker::new()),
            limiter: Arc::new(RateLimiter::default()),
            guard: Arc::new(CommandGuard::default()),
            history: Arc::new(MemoryHistory::new()),
            executor: ExecutorConfig::default(),
            deploy: DeploySettings::default(),
            events: None,
            deploy_nanos: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<ExecutionTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Arc::new(limiter);
        self
    }

    pub fn with_guard(mut self, guard: CommandGuard) -> Self {
        self.guard = Arc::new(guard);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = history;
        self
    }

    pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    pub fn with_deploy(mut self, deploy: DeploySettings) -> Self {
        self.deploy = deploy;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn tracker(&self) -> &ExecutionTracker {
        &self.tracker
    }

    pub fn guard(&self) -> &CommandGuard {
        &self.guard
    }

    /// Run a script on every requested machine and wait for all of them
    pub async fn execute(&self, req: &ExecuteRequest) -> Result<ExecutionRecord, PorterError> {
        let (record, hosts) = self.begin(req)?;
        self.fan_out(&record.id, &req.script_path, &req.flags, hosts)
            .await;
        self.tracker.get(&record.id).ok_or_else(|| PorterError::NotFound {
            kind: "execution".to_string(),
            id: record.id.clone(),
        })
    }

    /// Like [`execute`](Self::execute), but returns the running record at
    /// once and finishes in the background
    pub fn execute_async(&self, req: &ExecuteRequest) -> Result<ExecutionRecord, PorterError> {
        let (record, hosts) = self.begin(req)?;
        let this = self.clone();
        let id = record.id.clone();
        let script = req.script_path.clone();
        let flags = req.flags.clone();
        tokio::spawn(async move {
            this.fan_out(&id, &script, &flags, hosts).await;
        });
        Ok(record)
    }

    fn begin(&self, req: &ExecuteRequest) -> Result<(ExecutionRecord, Vec<Host>), PorterError> {
        if req.machine_ids.is_empty() {
            return Err(PorterError::action("execute", "no machines selected"));
        }
        let script = Path::new(&req.script_path);
        if !script.is_file() {
            return Err(PorterError::Io {
                message: "Script not found".to_string(),
                path: Some(script.to_path_buf()),
            });
        }
        let hosts = self.machines.resolve(&req.machine_ids)?;

        let id = self.tracker.next_id();
        let record = self
            .tracker
            .create(&id, &req.script_path, &req.flags, &req.machine_ids)?;
        Ok((record, hosts))
    }

    async fn fan_out(&self, id: &str, script: &str, args: &[String], hosts: Vec<Host>) {
        info!(id, script, machines = hosts.len(), "fanning out execution");
        let workers = hosts
            .iter()
            .map(|host| self.worker(id, host, script, args));
        join_all(workers).await;

        if let Err(e) = self.tracker.finish(id) {
            warn!(id, error = %e.plain_message(), "could not finalize execution");
        }
    }

    /// One machine: deploy, run, clean up, then report to tracker and history
    async fn worker(&self, id: &str, host: &Host, script: &str, args: &[String]) {
        let started_at = Utc::now();
        let (output, outcome) = self.deploy_and_run(host, Path::new(script), args).await;
        let finished_at = Utc::now();

        let error = outcome.err().map(|e| e.plain_message());
        if let Some(ref reason) = error {
            warn!(id, host = %host.name, error = %reason, "script failed");
        } else {
            info!(id, host = %host.name, "script completed");
        }

        let result = ExecutionResult {
            machine_id: host.id.clone(),
            machine_name: host.name.clone(),
            script_path: script.to_string(),
            success: error.is_none(),
            output,
            error: error.clone(),
            started_at,
            finished_at,
        };
        if let Err(e) = self.tracker.add_result(id, result) {
            warn!(id, host = %host.name, error = %e.plain_message(), "result dropped");
        }
        self.history.record(HistoryEntry {
            execution_id: id.to_string(),
            machine_id: host.id.clone(),
            machine_name: host.name.clone(),
            script_path: script.to_string(),
            success: error.is_none(),
            error,
            started_at,
            finished_at,
        });
    }

    async fn deploy_and_run(
        &self,
        host: &Host,
        script: &Path,
        args: &[String],
    ) -> (String, Result<(), PorterError>) {
        let conn = match self.connector.connect(host).await {
            Ok(conn) => conn,
            Err(e) => return (String::new(), Err(e)),
        };
        let layout = match DeployLayout::new(&self.deploy, script, monotonic_nanos(&self.deploy_nanos)) {
            Ok(layout) => layout,
            Err(e) => return (String::new(), Err(e)),
        };
        debug!(host = %host.name, root = %layout.root, "deploying script");

        let executor = self.executor_for(conn);
        let mut vars = VarBag::new();
        let outcome = executor
            .run(
                &layout.script_name,
                &layout.tasks(&self.deploy.interpreter, args),
                &mut vars,
            )
            .await;

        let mut cleanup_vars = VarBag::new();
        if let Err(e) = executor
            .run("cleanup", &layout.cleanup(), &mut cleanup_vars)
            .await
        {
            warn!(host = %host.name, error = %e.plain_message(), "cleanup failed");
        }

        let output = vars
            .get(OUTPUT_VAR)
            .map(str::to_string)
            .or_else(|| {
                outcome
                    .as_ref()
                    .err()
                    .and_then(|e| e.output())
                    .map(str::to_string)
            })
            .unwrap_or_default();

        let outcome = match outcome {
            Ok(stats) if stats.success() => Ok(()),
            Ok(stats) => Err(PorterError::action(
                "execute",
                format!("{} task(s) failed", stats.failed),
            )),
            Err(e) => Err(e),
        };
        (output, outcome)
    }

    fn executor_for(&self, conn: Arc<dyn Connection>) -> Executor {
        let executor = Executor::new(conn).with_config(self.executor.clone());
        match &self.events {
            Some(events) => executor.with_events(events.clone()),
            None => executor,
        }
    }

    /// Ad-hoc command: rate limit, then validation and the danger
    /// interlock, then one captured run with the exit-code trailer
    pub async fn run_command(&self, req: &CommandRequest) -> Result<CommandOutput, PorterError> {
        if !self.limiter.allow(&req.machine_id) {
            return Err(PorterError::RateLimited {
                key: req.machine_id.clone(),
            });
        }
        let command = self
            .guard
            .check(&req.command, req.confirmed, req.skip_validate)?;

        let host = self.machine(&req.machine_id)?;
        let conn = self.connector.connect(&host).await?;
        info!(host = %host.name, command = %command, "running ad-hoc command");

        let result = conn
            .exec(&wrap_with_exit_code(&wrap_command(&command, req.sudo, "")))
            .await?;
        let (output, code) = split_exit_code(&result.stdout);

        Ok(CommandOutput {
            machine_id: host.id,
            machine_name: host.name,
            command,
            output,
            stderr: result.stderr,
            exit_code: code.unwrap_or(result.exit_code),
        })
    }

    /// Upload one file to one machine (rsync when possible, SCP/SFTP
    /// otherwise) with permissions, owner and verification
    pub async fn upload_file(
        &self,
        machine_id: &str,
        local: &Path,
        remote: &str,
        opts: &UploadOptions,
    ) -> Result<UploadReport, PorterError> {
        let host = self.machine(machine_id)?;
        let conn = self.connector.connect(&host).await?;
        transfer::upload_file(conn, local, remote, opts).await
    }

    /// Flip the execution to cancelled and drop the stop sentinel on each
    /// of its machines. Every target in `machine_ids` is signalled, not
    /// only those that already reported a result: the ones still running
    /// are the ones that need to see the sentinel. Delivery runs in the
    /// background; failures are only logged and in-flight sessions are
    /// left to wind down on their own.
    pub fn cancel(&self, id: &str) -> Result<ExecutionRecord, PorterError> {
        let machine_ids = self.tracker.cancel(id)?;
        info!(id, machines = machine_ids.len(), "execution cancelled");

        for machine_id in machine_ids {
            let Some(host) = self.machines.get(&machine_id) else {
                warn!(id, machine = %machine_id, "cannot signal unknown machine");
                continue;
            };
            let connector = self.connector.clone();
            let sentinel = self.deploy.sentinel_path.clone();
            tokio::spawn(async move {
                if let Err(e) = signal_stop(connector.as_ref(), &host, &sentinel).await {
                    warn!(host = %host.name, error = %e.plain_message(), "stop sentinel not delivered");
                }
            });
        }

        self.tracker.get(id).ok_or_else(|| PorterError::NotFound {
            kind: "execution".to_string(),
            id: id.to_string(),
        })
    }

    fn machine(&self, id: &str) -> Result<Host, PorterError> {
        self.machines.get(id).ok_or_else(|| PorterError::NotFound {
            kind: "machine".to_string(),
            id: id.to_string(),
        })
    }
}

/// Create the sentinel with sudo, falling back to the login user
async fn signal_stop(
    connector: &dyn Connector,
    host: &Host,
    sentinel: &str,
) -> Result<(), PorterError> {
    let conn = connector.connect(host).await?;
    let path = shell_quote(sentinel);
    let cmd = format!("sudo -n touch {p} 2>/dev/null || touch {p}", p = path);
    let result = conn.exec(&cmd).await?;
    if !result.success() {
        return Err(PorterError::RemoteNonZero {
            host: host.name.clone(),
            command: cmd,
            exit_code: result.exit_code,
            output: result.stderr,
        });
    }
    debug!(host = %host.name, sentinel, "stop sentinel written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{LocalConnection, LocalConnector};
    use crate::inventory::Inventory;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Local execution for every host except the ones listed, which fail
    /// to connect
    struct FlakyConnector {
        unreachable: Vec<String>,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self, host: &Host) -> Result<Arc<dyn Connection>, PorterError> {
            if self.unreachable.contains(&host.id) {
                return Err(PorterError::Ssh {
                    host: host.name.clone(),
                    message: "Connection refused".to_string(),
                    suggestion: None,
                });
            }
            Ok(Arc::new(LocalConnection::new(host.name.clone())))
        }
    }

    fn inventory(ids: &[&str]) -> Arc<Inventory> {
        let mut inv = Inventory::new();
        for id in ids {
            inv.add_host(Host::new(*id, format!("host-{}", id)).local());
        }
        Arc::new(inv)
    }

    fn script(dir: &TempDir, body: &str) -> String {
        let app = dir.path().join("app");
        std::fs::create_dir_all(&app).unwrap();
        let path = app.join("run.sh");
        std::fs::write(&path, body).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn deploy(dir: &TempDir) -> DeploySettings {
        let root = dir.path().join("remote");
        std::fs::create_dir_all(&root).unwrap();
        DeploySettings {
            temp_root: root.to_string_lossy().into_owned(),
            sentinel_path: dir.path().join(".build_stop").to_string_lossy().into_owned(),
            interpreter: "sh".to_string(),
        }
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    async fn wait_finished(orch: &Orchestrator, id: &str) -> ExecutionRecord {
        tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                let record = orch.tracker().get(id).unwrap();
                if record.finished_at.is_some() {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_async_execution_with_one_failing_host() {
        let dir = TempDir::new().unwrap();
        let history = Arc::new(MemoryHistory::new());
        let orch = Orchestrator::new(
            Arc::new(FlakyConnector {
                unreachable: ids(&["m2"]),
            }),
            inventory(&["m1", "m2", "m3"]),
        )
        .with_history(history.clone())
        .with_deploy(deploy(&dir));

        let req = ExecuteRequest {
            machine_ids: ids(&["m1", "m2", "m3"]),
            script_path: script(&dir, "echo \"hello $1\"\n"),
            flags: vec!["fleet".to_string()],
        };
        let started = orch.execute_async(&req).unwrap();
        assert_eq!(started.status, ExecutionStatus::Running);
        assert!(started.id.starts_with("exec-"));

        let record = wait_finished(&orch, &started.id).await;
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.results.len(), 3);
        assert_eq!(history.for_execution(&started.id).len(), 3);

        let failed: Vec<_> = record.results.iter().filter(|r| !r.success).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].machine_id, "m2");
        assert!(failed[0].error.as_deref().unwrap().contains("Connection refused"));

        for ok in record.results.iter().filter(|r| r.success) {
            assert_eq!(ok.output.trim(), "hello fleet");
        }
    }

    #[tokio::test]
    async fn test_sync_execution_cleans_up() {
        let dir = TempDir::new().unwrap();
        let settings = deploy(&dir);
        let orch = Orchestrator::new(Arc::new(LocalConnector), inventory(&["m1", "m2"]))
            .with_deploy(settings.clone());

        let req = ExecuteRequest {
            machine_ids: ids(&["m1", "m2"]),
            script_path: script(&dir, "pwd\n"),
            flags: vec![],
        };
        let record = orch.execute(&req).await.unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.results.len(), 2);
        for result in &record.results {
            assert!(result.output.contains("/idx-deploy-"));
            assert!(result.output.trim_end().ends_with("/app"));
        }
        // Deploy directories are gone
        let leftovers = std::fs::read_dir(&settings.temp_root).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_script_failure_is_reported_with_output() {
        let dir = TempDir::new().unwrap();
        let orch = Orchestrator::new(Arc::new(LocalConnector), inventory(&["m1"]))
            .with_deploy(deploy(&dir));

        let req = ExecuteRequest {
            machine_ids: ids(&["m1"]),
            script_path: script(&dir, "echo building\nexit 4\n"),
            flags: vec![],
        };
        let record = orch.execute(&req).await.unwrap();

        assert_eq!(record.status, ExecutionStatus::Failed);
        let result = &record.results[0];
        assert!(!result.success);
        assert!(result.output.contains("building"));
        assert!(result.error.as_deref().unwrap().starts_with("Run run.sh"));
    }

    #[tokio::test]
    async fn test_lib_sibling_is_deployed() {
        let dir = TempDir::new().unwrap();
        let lib = dir.path().join("lib");
        std::fs::create_dir_all(&lib).unwrap();
        std::fs::write(lib.join("common.sh"), "greet() { echo \"from lib\"; }\n").unwrap();

        let orch = Orchestrator::new(Arc::new(LocalConnector), inventory(&["m1"]))
            .with_deploy(deploy(&dir));
        let req = ExecuteRequest {
            machine_ids: ids(&["m1"]),
            script_path: script(&dir, ". ../lib/common.sh\ngreet\n"),
            flags: vec![],
        };
        let record = orch.execute(&req).await.unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.results[0].output.trim(), "from lib");
    }

    #[tokio::test]
    async fn test_execute_rejects_bad_requests() {
        let dir = TempDir::new().unwrap();
        let orch = Orchestrator::new(Arc::new(LocalConnector), inventory(&["m1"]));

        let missing_script = ExecuteRequest {
            machine_ids: ids(&["m1"]),
            script_path: "/nonexistent/run.sh".to_string(),
            flags: vec![],
        };
        assert!(matches!(
            orch.execute(&missing_script).await,
            Err(PorterError::Io { .. })
        ));

        let unknown_machine = ExecuteRequest {
            machine_ids: ids(&["ghost"]),
            script_path: script(&dir, "true\n"),
            flags: vec![],
        };
        assert!(matches!(
            orch.execute(&unknown_machine).await,
            Err(PorterError::NotFound { .. })
        ));
        assert!(orch.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_marks_and_signals() {
        let dir = TempDir::new().unwrap();
        let settings = deploy(&dir);
        let orch = Orchestrator::new(Arc::new(LocalConnector), inventory(&["m1"]))
            .with_deploy(settings.clone());

        let id = orch.tracker().next_id();
        orch.tracker()
            .create(&id, "run.sh", &[], &ids(&["m1"]))
            .unwrap();

        let record = orch.cancel(&id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert_eq!(orch.tracker().list_running().len(), 0);

        let sentinel = PathBuf::from(&settings.sentinel_path);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !sentinel.exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert!(orch.cancel("exec-0").is_err());
    }

    #[tokio::test]
    async fn test_cancel_survives_unreachable_machine() {
        let orch = Orchestrator::new(
            Arc::new(FlakyConnector {
                unreachable: ids(&["m1"]),
            }),
            inventory(&["m1"]),
        );
        let id = orch.tracker().next_id();
        orch.tracker().create(&id, "run.sh", &[], &ids(&["m1"])).unwrap();

        assert_eq!(orch.cancel(&id).unwrap().status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_run_command_exit_code_trailer() {
        let orch = Orchestrator::new(Arc::new(LocalConnector), inventory(&["m1"]));

        let out = orch
            .run_command(&CommandRequest {
                machine_id: "m1".to_string(),
                command: "echo hi && false".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(out.output.trim(), "hi");
        assert_eq!(out.exit_code, 1);
        assert!(!out.output.contains("EXIT_CODE"));
    }

    #[tokio::test]
    async fn test_run_command_interlock() {
        let orch = Orchestrator::new(Arc::new(LocalConnector), inventory(&["m1"]));

        let dangerous = CommandRequest {
            machine_id: "m1".to_string(),
            command: "rm -rf /nonexistent-porter-dir".to_string(),
            ..Default::default()
        };
        let err = orch.run_command(&dangerous).await.unwrap_err();
        assert!(err.requires_confirm());

        let confirmed = CommandRequest {
            confirmed: true,
            ..dangerous
        };
        assert_eq!(orch.run_command(&confirmed).await.unwrap().exit_code, 0);

        let injected = CommandRequest {
            machine_id: "m1".to_string(),
            command: "ls\nreboot".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            orch.run_command(&injected).await,
            Err(PorterError::ValidationRejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_command_rate_limited_per_machine() {
        let orch = Orchestrator::new(Arc::new(LocalConnector), inventory(&["m1", "m2"]))
            .with_rate_limiter(RateLimiter::new(2, Duration::from_secs(60)));

        let req = |machine: &str| CommandRequest {
            machine_id: machine.to_string(),
            command: "true".to_string(),
            ..Default::default()
        };
        assert!(orch.run_command(&req("m1")).await.is_ok());
        assert!(orch.run_command(&req("m1")).await.is_ok());

        let err = orch.run_command(&req("m1")).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert!(orch.run_command(&req("m2")).await.is_ok());
    }

    #[tokio::test]
    async fn test_upload_file_to_machine() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("payload.bin");
        std::fs::write(&local, b"payload").unwrap();
        let remote = dir.path().join("out/nested/payload.bin");

        let orch = Orchestrator::new(Arc::new(LocalConnector), inventory(&["m1"]));
        let report = orch
            .upload_file(
                "m1",
                &local,
                &remote.to_string_lossy(),
                &UploadOptions {
                    create_dirs: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(report.bytes, 7);
        assert_eq!(std::fs::read(&remote).unwrap(), b"payload");
    }

    #[test]
    fn test_deploy_layout() {
        let dir = TempDir::new().unwrap();
        let path = script(&dir, "true\n");
        let layout = DeployLayout::new(&DeploySettings::default(), Path::new(&path), 42).unwrap();

        assert_eq!(layout.root, "/tmp/idx-deploy-42");
        assert_eq!(layout.remote_dir, "/tmp/idx-deploy-42/app");
        assert_eq!(layout.script_name, "run.sh");
        assert!(layout.lib_dir.is_none());

        let tasks = layout.tasks("bash", &["--fast".to_string()]);
        assert_eq!(tasks.len(), 3);
        assert_eq!(
            tasks[2].body,
            "cd '/tmp/idx-deploy-42/app' && bash 'run.sh' '--fast'"
        );
        assert_eq!(tasks[2].register.as_deref(), Some(OUTPUT_VAR));
    }
}
