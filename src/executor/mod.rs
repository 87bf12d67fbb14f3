// Executor module - connections, streaming and the task runner

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::inventory::Host;
use crate::output::errors::PorterError;

pub mod local;
pub mod runner;
pub mod ssh;
pub mod streaming;

pub use local::LocalConnection;
pub use runner::{Executor, ExecutorConfig, Stats};
pub use ssh::{ConnectionPool, SshConnection};
pub use streaming::{
    run_streaming, run_streaming_until, stop_pair, LineSink, LineSplitter, OutputLine, StopHandle, StopToken,
    StreamKind, StreamOutcome,
};

/// Result of executing a command
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Where an SSH-backed connection points, for tools like rsync that open
/// their own transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    pub user: String,
    pub address: String,
    pub port: u16,
    pub private_key: Option<String>,
}

impl SshEndpoint {
    /// `user@address`, the remote half of an rsync/scp destination
    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }

    /// The `-e` argument for rsync
    pub fn rsync_shell(&self) -> String {
        let mut shell = format!(
            "ssh -p {} -o BatchMode=yes -o StrictHostKeyChecking=accept-new",
            self.port
        );
        if let Some(ref key) = self.private_key {
            shell.push_str(&format!(" -i {}", key));
        }
        shell
    }
}

/// Common trait for all connection types (SSH, local, etc.)
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a command and return the result
    async fn exec(&self, cmd: &str) -> Result<CommandResult, PorterError>;

    /// Execute a command, delivering each stdout/stderr line to `sink` as it
    /// arrives. Returns the exit code; a non-zero exit is not an error.
    /// When `stop` fires the remote process is interrupted and the call
    /// returns once output has drained.
    async fn exec_streaming(
        &self,
        cmd: &str,
        sink: LineSink,
        stop: Option<StopToken>,
    ) -> Result<i32, PorterError>;

    /// Copy a local file to the target
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), PorterError>;

    /// Copy a file from the target to the controller
    async fn download(&self, remote: &str, local: &Path) -> Result<(), PorterError>;

    /// Write content to a file on the target
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), PorterError>;

    /// Get the host name for this connection
    fn host_name(&self) -> &str;

    /// SSH coordinates, when the connection is SSH-backed
    fn ssh_endpoint(&self) -> Option<SshEndpoint> {
        None
    }

    fn is_local(&self) -> bool {
        false
    }
}

/// Opens connections to machines
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &Host) -> Result<Arc<dyn Connection>, PorterError>;
}

/// Connector that runs everything on the controller, whatever the host
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalConnector;

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, host: &Host) -> Result<Arc<dyn Connection>, PorterError> {
        Ok(Arc::new(LocalConnection::new(host.name.clone())))
    }
}
