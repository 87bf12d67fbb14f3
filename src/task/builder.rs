// Task record and fluent builder

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::condition::Condition;

/// Desired state for the `service` action (systemctl verbs)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Start,
    Stop,
    Restart,
    Reload,
    Enable,
    Disable,
    Status,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Start => "start",
            ServiceState::Stop => "stop",
            ServiceState::Restart => "restart",
            ServiceState::Reload => "reload",
            ServiceState::Enable => "enable",
            ServiceState::Disable => "disable",
            ServiceState::Status => "status",
        }
    }
}

/// Desired state for the `docker` and `compose` actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Up,
    Down,
    Start,
    Stop,
    Restart,
    Pull,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Up => "up",
            ContainerState::Down => "down",
            ContainerState::Start => "start",
            ContainerState::Stop => "stop",
            ContainerState::Restart => "restart",
            ContainerState::Pull => "pull",
        }
    }
}

/// Desired state for the `package` action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageState {
    Present,
    Absent,
    Latest,
}

impl PackageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageState::Present => "present",
            PackageState::Absent => "absent",
            PackageState::Latest => "latest",
        }
    }
}

/// What a task does. Closed set; sub-states ride on the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Scaffolding for loop/condition-only tasks
    Noop,
    Upload,
    Download,
    Run,
    Capture,
    Chmod,
    Chown,
    Rm,
    Copy,
    Symlink,
    Service(ServiceState),
    Docker(ContainerState),
    Compose(ContainerState),
    Package(PackageState),
    Rsync,
    WaitPort,
    WaitHttp,
    WaitFile,
    WibuGenerate,
    WibuApply,
    WibuInfo,
    WibuList,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Noop => "noop",
            Action::Upload => "upload",
            Action::Download => "download",
            Action::Run => "run",
            Action::Capture => "capture",
            Action::Chmod => "chmod",
            Action::Chown => "chown",
            Action::Rm => "rm",
            Action::Copy => "copy",
            Action::Symlink => "symlink",
            Action::Service(_) => "service",
            Action::Docker(_) => "docker",
            Action::Compose(_) => "compose",
            Action::Package(_) => "package",
            Action::Rsync => "rsync",
            Action::WaitPort => "wait-port",
            Action::WaitHttp => "wait-http",
            Action::WaitFile => "wait-file",
            Action::WibuGenerate => "wibu_generate",
            Action::WibuApply => "wibu_apply",
            Action::WibuInfo => "wibu_info",
            Action::WibuList => "wibu_list",
        }
    }

    /// Sub-state for service/docker/compose/package actions
    pub fn state(&self) -> Option<&'static str> {
        match self {
            Action::Service(s) => Some(s.as_str()),
            Action::Docker(s) | Action::Compose(s) => Some(s.as_str()),
            Action::Package(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn is_wait(&self) -> bool {
        matches!(self, Action::WaitPort | Action::WaitHttp | Action::WaitFile)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state() {
            Some(state) => write!(f, "{}:{}", self.as_str(), state),
            None => write!(f, "{}", self.as_str()),
        }
    }
}

/// A declarative unit of work. Built once through [`TaskBuilder`] and not
/// mutated after it is placed in a task list.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub name: String,
    pub action: Action,
    pub src: String,
    pub dest: String,
    pub body: String,
    /// Octal mode for chmod / uploads
    pub mode: String,
    /// Owner for chown / uploads, run-as user for commands
    pub user: String,
    pub sudo: bool,
    pub recursive: bool,
    /// rsync: push from the controller instead of running on the target
    pub local: bool,
    /// rsync: keep partially transferred files for resume
    pub partial: bool,
    /// rsync: install rsync on the target when missing
    pub ensure: bool,
    pub when: Option<Condition>,
    pub loop_items: Vec<String>,
    pub ignore: bool,
    pub retry: u32,
    pub delay: Option<Duration>,
    pub timeout: Option<Duration>,
    pub register: Option<String>,
    pub creates: Option<String>,
}

impl Task {
    fn new(action: Action) -> Self {
        Task {
            name: String::new(),
            action,
            src: String::new(),
            dest: String::new(),
            body: String::new(),
            mode: String::new(),
            user: String::new(),
            sudo: false,
            recursive: false,
            local: false,
            partial: false,
            ensure: false,
            when: None,
            loop_items: Vec::new(),
            ignore: false,
            retry: 0,
            delay: None,
            timeout: None,
            register: None,
            creates: None,
        }
    }

    /// Sub-state of the action, if it has one
    pub fn state(&self) -> Option<&'static str> {
        self.action.state()
    }

    /// Total attempts the executor may make: `1 + retry`
    pub fn max_attempts(&self) -> u32 {
        self.retry.saturating_add(1)
    }

    fn default_name(&self) -> String {
        let target = [&self.body, &self.src, &self.dest]
            .into_iter()
            .find(|s| !s.is_empty())
            .cloned()
            .unwrap_or_default();

        if target.is_empty() {
            self.action.to_string()
        } else {
            format!("{} {}", self.action, target)
        }
    }
}

/// Fluent wrapper that emits one [`Task`] on [`TaskBuilder::build`]
#[derive(Debug, Clone)]
#[must_use]
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(action: Action) -> Self {
        TaskBuilder {
            task: Task::new(action),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.task.name = name.into();
        self
    }

    pub fn src(mut self, src: impl Into<String>) -> Self {
        self.task.src = src.into();
        self
    }

    pub fn dest(mut self, dest: impl Into<String>) -> Self {
        self.task.dest = dest.into();
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.task.body = body.into();
        self
    }

    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.task.mode = mode.into();
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.task.user = user.into();
        self
    }

    pub fn owner(self, owner: impl Into<String>) -> Self {
        self.user(owner)
    }

    pub fn sudo(mut self) -> Self {
        self.task.sudo = true;
        self
    }

    pub fn recursive(mut self) -> Self {
        self.task.recursive = true;
        self
    }

    pub fn local(mut self) -> Self {
        self.task.local = true;
        self
    }

    pub fn partial(mut self) -> Self {
        self.task.partial = true;
        self
    }

    pub fn ensure(mut self) -> Self {
        self.task.ensure = true;
        self
    }

    pub fn when(mut self, cond: Condition) -> Self {
        self.task.when = Some(cond);
        self
    }

    pub fn loop_over<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task.loop_items = items.into_iter().map(Into::into).collect();
        self
    }

    pub fn ignore(mut self) -> Self {
        self.task.ignore = true;
        self
    }

    pub fn retry(mut self, retries: u32) -> Self {
        self.task.retry = retries;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.task.delay = Some(delay);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.task.timeout = Some(timeout);
        self
    }

    pub fn register(mut self, var: impl Into<String>) -> Self {
        self.task.register = Some(var.into());
        self
    }

    pub fn creates(mut self, path: impl Into<String>) -> Self {
        self.task.creates = Some(path.into());
        self
    }

    fn with_service_state(mut self, service: ServiceState, container: Option<ContainerState>) -> Self {
        self.task.action = match (self.task.action, container) {
            (Action::Service(_), _) => Action::Service(service),
            (Action::Docker(_), Some(c)) => Action::Docker(c),
            (Action::Compose(_), Some(c)) => Action::Compose(c),
            (other, _) => other,
        };
        self
    }

    pub fn start(self) -> Self {
        self.with_service_state(ServiceState::Start, Some(ContainerState::Start))
    }

    pub fn stop(self) -> Self {
        self.with_service_state(ServiceState::Stop, Some(ContainerState::Stop))
    }

    pub fn restart(self) -> Self {
        self.with_service_state(ServiceState::Restart, Some(ContainerState::Restart))
    }

    pub fn reload(self) -> Self {
        self.with_service_state(ServiceState::Reload, None)
    }

    pub fn enable(self) -> Self {
        self.with_service_state(ServiceState::Enable, None)
    }

    pub fn disable(self) -> Self {
        self.with_service_state(ServiceState::Disable, None)
    }

    pub fn status(self) -> Self {
        self.with_service_state(ServiceState::Status, None)
    }

    pub fn up(mut self) -> Self {
        self.task.action = match self.task.action {
            Action::Docker(_) => Action::Docker(ContainerState::Up),
            Action::Compose(_) => Action::Compose(ContainerState::Up),
            other => other,
        };
        self
    }

    pub fn down(mut self) -> Self {
        self.task.action = match self.task.action {
            Action::Docker(_) => Action::Docker(ContainerState::Down),
            Action::Compose(_) => Action::Compose(ContainerState::Down),
            other => other,
        };
        self
    }

    pub fn pull(mut self) -> Self {
        self.task.action = match self.task.action {
            Action::Docker(_) => Action::Docker(ContainerState::Pull),
            Action::Compose(_) => Action::Compose(ContainerState::Pull),
            other => other,
        };
        self
    }

    fn with_package_state(mut self, state: PackageState) -> Self {
        if let Action::Package(_) = self.task.action {
            self.task.action = Action::Package(state);
        }
        self
    }

    pub fn present(self) -> Self {
        self.with_package_state(PackageState::Present)
    }

    pub fn absent(self) -> Self {
        self.with_package_state(PackageState::Absent)
    }

    pub fn latest(self) -> Self {
        self.with_package_state(PackageState::Latest)
    }

    pub fn build(self) -> Task {
        let mut task = self.task;
        if task.name.is_empty() {
            task.name = task.default_name();
        }
        task
    }
}

impl From<TaskBuilder> for Task {
    fn from(builder: TaskBuilder) -> Self {
        builder.build()
    }
}

/// Collect builders (or finished tasks) into an ordered task list
pub fn tasks<I, T>(items: I) -> Vec<Task>
where
    I: IntoIterator<Item = T>,
    T: Into<Task>,
{
    items.into_iter().map(Into::into).collect()
}

pub fn noop(name: impl Into<String>) -> TaskBuilder {
    TaskBuilder::new(Action::Noop).name(name)
}

/// Upload a local file (or directory, with `.recursive()`) to the target
pub fn upload(local: impl Into<String>, remote: impl Into<String>) -> TaskBuilder {
    TaskBuilder::new(Action::Upload).src(local).dest(remote)
}

/// Download a remote file (or directory, with `.recursive()`) to the controller
pub fn download(remote: impl Into<String>, local: impl Into<String>) -> TaskBuilder {
    TaskBuilder::new(Action::Download).src(remote).dest(local)
}

pub fn run(cmd: impl Into<String>) -> TaskBuilder {
    TaskBuilder::new(Action::Run).body(cmd)
}

/// Like [`run`], but the combined output lands in the registered variable
pub fn capture(cmd: impl Into<String>) -> TaskBuilder {
    TaskBuilder::new(Action::Capture).body(cmd)
}

pub fn chmod(path: impl Into<String>) -> TaskBuilder {
    TaskBuilder::new(Action::Chmod).dest(path)
}

pub fn chown(path: impl Into<String>, owner: impl Into<String>) -> TaskBuilder {
    TaskBuilder::new(Action::Chown).dest(path).user(owner)
}

pub fn rm(path: impl Into<String>) -> TaskBuilder {
    TaskBuilder::new(Action::Rm).dest(path)
}

/// Copy on the target host
pub fn copy(src: impl Into<String>, dest: impl Into<String>) -> TaskBuilder {
    TaskBuilder::new(Action::Copy).src(src).dest(dest)
}

pub fn symlink(target: impl Into<String>, link: impl Into<String>) -> TaskBuilder {
    TaskBuilder::new(Action::Symlink).src(target).dest(link)
}

pub fn svc(name: impl Into<String>) -> TaskBuilder {
    TaskBuilder::new(Action::Service(ServiceState::Start)).body(name)
}

pub fn docker(container: impl Into<String>) -> TaskBuilder {
    TaskBuilder::new(Action::Docker(ContainerState::Up)).body(container)
}

/// docker compose in the given project directory
pub fn compose(dir: impl Into<String>) -> TaskBuilder {
    TaskBuilder::new(Action::Compose(ContainerState::Up)).dest(dir)
}

pub fn package(name: impl Into<String>) -> TaskBuilder {
    TaskBuilder::new(Action::Package(PackageState::Present)).body(name)
}

pub fn rsync(local: impl Into<String>, remote: impl Into<String>) -> TaskBuilder {
    TaskBuilder::new(Action::Rsync).src(local).dest(remote)
}

pub fn wait_port(host: impl Into<String>, port: u16) -> TaskBuilder {
    TaskBuilder::new(Action::WaitPort)
        .src(host)
        .body(port.to_string())
}

pub fn wait_http(url: impl Into<String>) -> TaskBuilder {
    TaskBuilder::new(Action::WaitHttp).body(url)
}

pub fn wait_file(path: impl Into<String>) -> TaskBuilder {
    TaskBuilder::new(Action::WaitFile).dest(path)
}

/// Write a CodeMeter license request (context file) for a container serial
pub fn wibu_generate(serial: impl Into<String>, remote_file: impl Into<String>) -> TaskBuilder {
    TaskBuilder::new(Action::WibuGenerate)
        .body(serial)
        .dest(remote_file)
}

/// Import a local license update file into CodeMeter on the target
pub fn wibu_apply(local_update: impl Into<String>) -> TaskBuilder {
    TaskBuilder::new(Action::WibuApply).src(local_update)
}

pub fn wibu_info(serial: impl Into<String>) -> TaskBuilder {
    TaskBuilder::new(Action::WibuInfo).body(serial)
}

pub fn wibu_list() -> TaskBuilder {
    TaskBuilder::new(Action::WibuList)
}
