// SSH connection management with pooling

use async_trait::async_trait;
use std::fs::File;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use ssh2::{Channel, KeyboardInteractivePrompt, Session};
use tracing::{debug, warn};

use super::streaming::{LineSink, LineSplitter, OutputLine, StopToken};
use super::{CommandResult, Connection, Connector, LocalConnection, SshEndpoint};
use crate::inventory::Host;
use crate::modules::shell_quote;
use crate::output::errors::PorterError;

/// Prefix of the line a wrapped command prints before anything else, so an
/// interrupt can be aimed at the remote process.
const PID_MARKER: &str = "__porter_pid:";

type Idle = Arc<DashMap<String, Vec<Arc<PooledConnection>>>>;

/// SSH connection pool for reusing connections
#[derive(Clone)]
pub struct ConnectionPool {
    connections: Idle,
    max_per_host: usize,
    connect_timeout: Duration,
    command_timeout: Duration,
    default_user: Option<String>,
    private_key_path: Option<String>,
    password: Option<String>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        ConnectionPool {
            connections: Arc::new(DashMap::new()),
            max_per_host: 5,
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(300),
            default_user: None,
            private_key_path: None,
            password: None,
        }
    }

    pub fn with_max_per_host(mut self, max: usize) -> Self {
        self.max_per_host = max;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_default_user(mut self, user: String) -> Self {
        self.default_user = Some(user);
        self
    }

    pub fn with_private_key(mut self, path: String) -> Self {
        self.private_key_path = Some(path);
        self
    }

    pub fn with_password(mut self, password: String) -> Self {
        self.password = Some(password);
        self
    }

    /// Number of idle sessions pooled for a target
    pub fn idle_count(&self, host: &Host) -> usize {
        self.connections
            .get(&host.ssh_target())
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// Get a connection to a host (from pool or create new). Blocking.
    pub fn get(&self, host: &Host) -> Result<SshConnection, PorterError> {
        let key = host.ssh_target();

        if let Some(mut conns) = self.connections.get_mut(&key) {
            while let Some(conn) = conns.pop() {
                if conn.is_valid() {
                    debug!(target = %key, "reusing pooled SSH session");
                    return Ok(self.wrap(conn, key));
                }
            }
        }

        let conn = self.connect_blocking(host)?;
        Ok(self.wrap(Arc::new(conn), key))
    }

    fn wrap(&self, conn: Arc<PooledConnection>, key: String) -> SshConnection {
        SshConnection {
            inner: conn,
            pool: self.connections.clone(),
            key,
            max_per_host: self.max_per_host,
        }
    }

    fn resolve_user(&self, host: &Host) -> String {
        if host.user.is_empty() {
            self.default_user
                .clone()
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "root".to_string())
        } else {
            host.user.clone()
        }
    }

    /// Create a new SSH connection
    fn connect_blocking(&self, host: &Host) -> Result<PooledConnection, PorterError> {
        let address = format!("{}:{}", host.address, host.port);

        let socket = address
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| PorterError::Ssh {
                host: host.name.clone(),
                message: format!("Cannot resolve address {}", address),
                suggestion: Some("Check the host address format".to_string()),
            })?;

        let tcp = TcpStream::connect_timeout(&socket, self.connect_timeout).map_err(|e| {
            PorterError::Ssh {
                host: host.name.clone(),
                message: format!("Connection failed: {}", e),
                suggestion: ssh_connection_suggestion(&e),
            }
        })?;

        let mut session = Session::new().map_err(|e| PorterError::Ssh {
            host: host.name.clone(),
            message: format!("Failed to create SSH session: {}", e),
            suggestion: None,
        })?;

        session.set_tcp_stream(tcp);
        session.set_timeout(self.connect_timeout.as_millis() as u32);

        session.handshake().map_err(|e| PorterError::Ssh {
            host: host.name.clone(),
            message: format!("SSH handshake failed: {}", e),
            suggestion: Some("Check SSH service is running on the target".to_string()),
        })?;

        let user = self.resolve_user(host);
        let private_key = host
            .private_key
            .clone()
            .or_else(|| self.private_key_path.clone());
        let password = host.password.clone().or_else(|| self.password.clone());

        // Agent first, then key files, then password / keyboard-interactive
        let mut authenticated = false;

        if let Ok(mut agent) = session.agent() {
            if agent.connect().is_ok() {
                agent.list_identities().ok();
                for identity in agent.identities().unwrap_or_default() {
                    if agent.userauth(&user, &identity).is_ok() {
                        authenticated = true;
                        break;
                    }
                }
            }
        }

        if !authenticated {
            let key_paths = private_key
                .iter()
                .map(PathBuf::from)
                .chain(
                    [
                        dirs::home_dir().map(|h| h.join(".ssh/id_ed25519")),
                        dirs::home_dir().map(|h| h.join(".ssh/id_rsa")),
                    ]
                    .into_iter()
                    .flatten(),
                )
                .collect::<Vec<_>>();

            for key_path in key_paths {
                if key_path.exists()
                    && session
                        .userauth_pubkey_file(&user, None, &key_path, None)
                        .is_ok()
                {
                    authenticated = true;
                    break;
                }
            }
        }

        if !authenticated {
            if let Some(ref password) = password {
                if session.userauth_password(&user, password).is_ok() {
                    authenticated = true;
                } else {
                    // Some PAM setups only offer keyboard-interactive
                    let mut prompter = PasswordPrompter(password.clone());
                    if session
                        .userauth_keyboard_interactive(&user, &mut prompter)
                        .is_ok()
                    {
                        authenticated = true;
                    }
                }
            }
        }

        if !authenticated {
            return Err(PorterError::Ssh {
                host: host.name.clone(),
                message: "Authentication failed".to_string(),
                suggestion: Some(
                    "Ensure SSH key is added to agent, set private_key, or use --ask-pass for password auth".to_string(),
                ),
            });
        }

        session.set_timeout(self.command_timeout.as_millis() as u32);

        Ok(PooledConnection {
            session,
            host_name: host.name.clone(),
            endpoint: SshEndpoint {
                user,
                address: host.address.clone(),
                port: host.port,
                private_key,
            },
            busy: Mutex::new(()),
        })
    }

    /// Close all connections
    pub fn close_all(&self) {
        self.connections.clear();
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for ConnectionPool {
    async fn connect(&self, host: &Host) -> Result<Arc<dyn Connection>, PorterError> {
        if host.is_local() {
            return Ok(Arc::new(LocalConnection::new(host.name.clone())));
        }

        let pool = self.clone();
        let target = host.clone();
        let conn = tokio::task::spawn_blocking(move || pool.get(&target))
            .await
            .map_err(|e| PorterError::Ssh {
                host: host.name.clone(),
                message: format!("Connect worker failed: {}", e),
                suggestion: None,
            })??;

        Ok(Arc::new(conn))
    }
}

/// A pooled SSH connection
pub struct PooledConnection {
    session: Session,
    host_name: String,
    endpoint: SshEndpoint,
    /// Streaming flips the session to non-blocking mode; operations take
    /// turns so they never observe each other's mode.
    busy: Mutex<()>,
}

impl PooledConnection {
    /// Check if the connection is still valid
    pub fn is_valid(&self) -> bool {
        self.session.authenticated()
    }

    fn ssh_error(&self, what: &str, e: impl std::fmt::Display) -> PorterError {
        let text = e.to_string();
        let broken = text.contains("timeout")
            || text.contains("Connection")
            || text.contains("Broken pipe");

        PorterError::Ssh {
            host: self.host_name.clone(),
            message: format!(
                "{}{}: {}",
                what,
                if broken { " (connection error)" } else { "" },
                text
            ),
            suggestion: if broken {
                Some("Connection will be discarded due to error".to_string())
            } else {
                None
            },
        }
    }

    fn open_channel(&self) -> Result<Channel, PorterError> {
        self.session
            .channel_session()
            .map_err(|e| self.ssh_error("Failed to open channel", e))
    }

    /// Execute a command on this connection
    pub fn exec(&self, command: &str) -> Result<CommandResult, PorterError> {
        let _turn = self.busy.lock();
        let mut channel = self.open_channel()?;

        channel
            .exec(command)
            .map_err(|e| self.ssh_error("Failed to execute command", e))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        channel.read_to_string(&mut stdout).ok();
        channel.stderr().read_to_string(&mut stderr).ok();

        channel.wait_close().ok();
        let exit_code = channel.exit_status().unwrap_or(-1);

        Ok(CommandResult {
            stdout,
            stderr,
            exit_code,
        })
    }

    /// Execute a command with line-oriented streaming output. With a stop
    /// token the command is wrapped so its PID is known and can be sent
    /// SIGINT over a second channel.
    pub fn exec_streaming(
        &self,
        command: &str,
        sink: &LineSink,
        stop: Option<&StopToken>,
    ) -> Result<i32, PorterError> {
        let _turn = self.busy.lock();
        let mut channel = self.open_channel()?;

        let wrapped;
        let command = if stop.is_some() {
            wrapped = format!(
                "printf '{}%s\\n' $$; exec sh -c {}",
                PID_MARKER,
                shell_quote(command)
            );
            wrapped.as_str()
        } else {
            command
        };

        channel
            .exec(command)
            .map_err(|e| self.ssh_error("Failed to execute command", e))?;

        self.session.set_blocking(false);

        let mut out_lines = LineSplitter::new();
        let mut err_lines = LineSplitter::new();
        let mut remote_pid: Option<String> = None;
        let mut stop_deadline: Option<Instant> = None;
        let mut buf = [0u8; 4096];

        let deliver_stdout = |line: String, pid: &mut Option<String>| {
            if pid.is_none() && stop.is_some() {
                if let Some(rest) = line.strip_prefix(PID_MARKER) {
                    *pid = Some(rest.trim().to_string());
                    return;
                }
            }
            sink(OutputLine::stdout(line));
        };

        loop {
            let mut activity = false;

            match channel.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    for line in out_lines.push(&buf[..n]) {
                        deliver_stdout(line, &mut remote_pid);
                    }
                    activity = true;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }

            match channel.stderr().read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    for line in err_lines.push(&buf[..n]) {
                        sink(OutputLine::stderr(line));
                    }
                    activity = true;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }

            if channel.eof() {
                break;
            }

            if let Some(token) = stop {
                match stop_deadline {
                    None if token.is_stopped() => {
                        self.interrupt(remote_pid.as_deref());
                        stop_deadline = Some(Instant::now() + token.grace());
                    }
                    Some(deadline) if Instant::now() >= deadline => {
                        debug!(host = %self.host_name, "grace period over, closing channel");
                        channel.close().ok();
                        break;
                    }
                    _ => {}
                }
            }

            if !activity {
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        self.session.set_blocking(true);

        for line in out_lines.finish() {
            deliver_stdout(line, &mut remote_pid);
        }
        for line in err_lines.finish() {
            sink(OutputLine::stderr(line));
        }

        channel.wait_close().ok();
        Ok(channel.exit_status().unwrap_or(-1))
    }

    /// Best-effort SIGINT to the remote process over a fresh channel
    fn interrupt(&self, pid: Option<&str>) {
        let Some(pid) = pid else {
            warn!(host = %self.host_name, "stop requested before remote PID was known");
            return;
        };

        self.session.set_blocking(true);
        let sent = self.open_channel().and_then(|mut ch| {
            ch.exec(&format!("kill -INT {} 2>/dev/null", pid))
                .map_err(|e| self.ssh_error("Failed to send interrupt", e))?;
            ch.wait_close().ok();
            Ok(())
        });
        self.session.set_blocking(false);

        if let Err(e) = sent {
            warn!(host = %self.host_name, error = %e.plain_message(), "interrupt not delivered");
        }
    }

    /// Upload a file, SCP first with an SFTP fallback
    pub fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<(), PorterError> {
        let _turn = self.busy.lock();
        match self.scp_upload(local_path, remote_path) {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(host = %self.host_name, error = %e.plain_message(), "scp failed, falling back to sftp");
                self.sftp_upload(local_path, remote_path)
            }
        }
    }

    fn open_local(local_path: &Path) -> Result<File, PorterError> {
        File::open(local_path).map_err(|e| PorterError::Io {
            message: format!("Failed to read local file: {}", e),
            path: Some(local_path.to_path_buf()),
        })
    }

    fn scp_upload(&self, local_path: &Path, remote_path: &str) -> Result<(), PorterError> {
        let mut file = Self::open_local(local_path)?;
        let size = file
            .metadata()
            .map_err(|e| PorterError::Io {
                message: format!("Failed to stat local file: {}", e),
                path: Some(local_path.to_path_buf()),
            })?
            .len();

        let mut channel = self
            .session
            .scp_send(Path::new(remote_path), 0o644, size, None)
            .map_err(|e| self.ssh_error("Failed to start SCP", e))?;

        std::io::copy(&mut file, &mut channel)
            .map_err(|e| self.ssh_error("Failed to write SCP stream", e))?;

        channel.send_eof().ok();
        channel.wait_eof().ok();
        channel.close().ok();
        channel.wait_close().ok();
        Ok(())
    }

    fn sftp_upload(&self, local_path: &Path, remote_path: &str) -> Result<(), PorterError> {
        let mut file = Self::open_local(local_path)?;
        let sftp = self
            .session
            .sftp()
            .map_err(|e| self.ssh_error("Failed to open SFTP", e))?;

        let mut remote_file = sftp
            .create(Path::new(remote_path))
            .map_err(|e| self.ssh_error("Failed to create remote file", e))?;

        std::io::copy(&mut file, &mut remote_file)
            .map_err(|e| self.ssh_error("Failed to write remote file", e))?;

        Ok(())
    }

    /// Download a remote file via SFTP
    pub fn download_file(&self, remote_path: &str, local_path: &Path) -> Result<(), PorterError> {
        let _turn = self.busy.lock();
        let sftp = self
            .session
            .sftp()
            .map_err(|e| self.ssh_error("Failed to open SFTP", e))?;

        let mut remote_file = sftp
            .open(Path::new(remote_path))
            .map_err(|e| self.ssh_error("Failed to open remote file", e))?;

        let mut local_file = File::create(local_path).map_err(|e| PorterError::Io {
            message: format!("Failed to create local file: {}", e),
            path: Some(local_path.to_path_buf()),
        })?;

        std::io::copy(&mut remote_file, &mut local_file)
            .map_err(|e| self.ssh_error("Failed to read remote file", e))?;

        Ok(())
    }

    /// Write content to a remote file
    pub fn write_file(&self, remote_path: &str, content: &[u8]) -> Result<(), PorterError> {
        let _turn = self.busy.lock();
        let sftp = self
            .session
            .sftp()
            .map_err(|e| self.ssh_error("Failed to open SFTP", e))?;

        let mut remote_file = sftp
            .create(Path::new(remote_path))
            .map_err(|e| self.ssh_error("Failed to create remote file", e))?;

        remote_file
            .write_all(content)
            .map_err(|e| self.ssh_error("Failed to write remote file", e))?;

        Ok(())
    }
}

/// Handle to a pooled session; the session goes back to the pool on drop
pub struct SshConnection {
    inner: Arc<PooledConnection>,
    pool: Idle,
    key: String,
    max_per_host: usize,
}

impl SshConnection {
    /// Run a blocking libssh2 operation off the async runtime
    async fn blocking<T, F>(&self, op: F) -> Result<T, PorterError>
    where
        T: Send + 'static,
        F: FnOnce(&PooledConnection) -> Result<T, PorterError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| PorterError::Ssh {
                host: self.inner.host_name.clone(),
                message: format!("SSH worker failed: {}", e),
                suggestion: None,
            })?
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        // Only the last handle returns the session
        if Arc::strong_count(&self.inner) != 1 || !self.inner.is_valid() {
            return;
        }
        let mut conns = self.pool.entry(self.key.clone()).or_default();
        if conns.len() < self.max_per_host {
            conns.push(self.inner.clone());
        }
    }
}

#[async_trait]
impl Connection for SshConnection {
    async fn exec(&self, cmd: &str) -> Result<CommandResult, PorterError> {
        let cmd = cmd.to_string();
        self.blocking(move |conn| conn.exec(&cmd)).await
    }

    async fn exec_streaming(
        &self,
        cmd: &str,
        sink: LineSink,
        stop: Option<StopToken>,
    ) -> Result<i32, PorterError> {
        let cmd = cmd.to_string();
        self.blocking(move |conn| conn.exec_streaming(&cmd, &sink, stop.as_ref()))
            .await
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), PorterError> {
        let local = local.to_path_buf();
        let remote = remote.to_string();
        self.blocking(move |conn| conn.upload_file(&local, &remote))
            .await
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<(), PorterError> {
        let local = local.to_path_buf();
        let remote = remote.to_string();
        self.blocking(move |conn| conn.download_file(&remote, &local))
            .await
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), PorterError> {
        let path = path.to_string();
        let content = content.to_vec();
        self.blocking(move |conn| conn.write_file(&path, &content))
            .await
    }

    fn host_name(&self) -> &str {
        self.inner.host_name.as_str()
    }

    fn ssh_endpoint(&self) -> Option<SshEndpoint> {
        Some(self.inner.endpoint.clone())
    }
}

fn ssh_connection_suggestion(e: &std::io::Error) -> Option<String> {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => {
            Some("Ensure SSH service is running on the target host".to_string())
        }
        std::io::ErrorKind::TimedOut => {
            Some("Check network connectivity and firewall rules".to_string())
        }
        std::io::ErrorKind::PermissionDenied => {
            Some("Check SSH key permissions and authentication".to_string())
        }
        _ => None,
    }
}

/// Simple home directory lookup
mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
}

/// Helper for keyboard-interactive authentication
struct PasswordPrompter(String);

impl KeyboardInteractivePrompt for PasswordPrompter {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.0.clone()).collect()
    }
}
