// Human-readable error messages for Porter

use std::fmt;
use std::io::IsTerminal;
use std::path::PathBuf;

use colored::*;

/// Initialize color output based on TTY detection and NO_COLOR environment variable
fn should_use_colors() -> bool {
    // Check NO_COLOR environment variable first (https://no-color.org/)
    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }

    // Errors are typically written to stderr
    std::io::stderr().is_terminal()
}

/// All error types in Porter
#[derive(Debug, Clone)]
pub enum PorterError {
    /// I/O errors on the controller side
    Io {
        message: String,
        path: Option<PathBuf>,
    },

    /// SSH transport errors (connect, session, channel, SFTP)
    Ssh {
        host: String,
        message: String,
        suggestion: Option<String>,
    },

    /// A remote command exited non-zero
    RemoteNonZero {
        host: String,
        command: String,
        exit_code: i32,
        output: String,
    },

    /// A wait-* task or other bounded operation ran out of time
    Timeout {
        operation: String,
        duration_secs: u64,
    },

    /// Task parameters are unusable (missing path, unknown state, ...)
    Action {
        action: String,
        message: String,
    },

    /// A task failed after all attempts
    TaskFailed {
        task: String,
        host: String,
        source: Box<PorterError>,
    },

    /// File transfer failure at some stage of a strategy
    Transfer {
        stage: String,
        message: String,
    },

    /// Command failed structural validation
    ValidationRejected { command: String, reason: String },

    /// Command matched a dangerous pattern and was not confirmed
    DangerousUnconfirmed { command: String, pattern: String },

    /// Ad-hoc command denied by the per-host rate limiter
    RateLimited { key: String },

    /// Unknown execution, machine, ...
    NotFound { kind: String, id: String },

    /// Illegal execution status transition
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    /// Configuration errors
    Config {
        message: String,
        suggestion: Option<String>,
    },
}

impl std::error::Error for PorterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PorterError::TaskFailed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl PorterError {
    /// Short, uncolored, single-line reason for JSON envelopes and records
    pub fn plain_message(&self) -> String {
        match self {
            PorterError::Io { message, .. } => message.clone(),
            PorterError::Ssh { host, message, .. } => format!("{}: {}", host, message),
            PorterError::RemoteNonZero { exit_code, .. } => {
                format!("command exited with code {}", exit_code)
            }
            PorterError::Timeout {
                operation,
                duration_secs,
            } => format!("{} timed out after {}s", operation, duration_secs),
            PorterError::Action { action, message } => format!("{}: {}", action, message),
            PorterError::TaskFailed { task, source, .. } => {
                format!("{}: {}", task, source.plain_message())
            }
            PorterError::Transfer { stage, message } => format!("{}: {}", stage, message),
            PorterError::ValidationRejected { reason, .. } => {
                format!("command rejected: {}", reason)
            }
            PorterError::DangerousUnconfirmed { pattern, .. } => format!(
                "dangerous command (matches '{}') requires confirmation",
                pattern
            ),
            PorterError::RateLimited { key } => format!("rate limit exceeded for {}", key),
            PorterError::NotFound { kind, id } => format!("{} not found: {}", kind, id),
            PorterError::InvalidTransition { id, from, to } => {
                format!("execution {}: cannot move from {} to {}", id, from, to)
            }
            PorterError::Config { message, .. } => message.clone(),
        }
    }

    /// Output captured by the failing command, if any
    pub fn output(&self) -> Option<&str> {
        match self {
            PorterError::RemoteNonZero { output, .. } => Some(output),
            PorterError::TaskFailed { source, .. } => source.output(),
            _ => None,
        }
    }

    /// Whether the error came from the transport rather than the remote command
    pub fn is_transport(&self) -> bool {
        match self {
            PorterError::Ssh { .. } => true,
            PorterError::TaskFailed { source, .. } => source.is_transport(),
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, PorterError::RateLimited { .. })
    }

    pub fn requires_confirm(&self) -> bool {
        matches!(self, PorterError::DangerousUnconfirmed { .. })
    }

    pub(crate) fn action(action: impl Into<String>, message: impl Into<String>) -> Self {
        PorterError::Action {
            action: action.into(),
            message: message.into(),
        }
    }

    pub(crate) fn transfer(stage: impl Into<String>, message: impl fmt::Display) -> Self {
        PorterError::Transfer {
            stage: stage.into(),
            message: message.to_string(),
        }
    }
}

impl fmt::Display for PorterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !should_use_colors() {
            colored::control::set_override(false);
        }

        match self {
            PorterError::Io { message, path } => {
                writeln!(f, "{}: {}", "I/O ERROR".red().bold(), message)?;
                if let Some(path) = path {
                    writeln!(f, "  {} {}", "Path:".dimmed(), path.display())?;
                }
                Ok(())
            }

            PorterError::Ssh {
                host,
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "SSH ERROR".red().bold(), message)?;
                writeln!(f, "  {} {}", "Host:".dimmed(), host)?;

                if let Some(suggestion) = suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }

                Ok(())
            }

            PorterError::RemoteNonZero {
                host,
                command,
                exit_code,
                output,
            } => {
                writeln!(
                    f,
                    "{}: command exited with code {}",
                    "REMOTE ERROR".red().bold(),
                    exit_code
                )?;
                writeln!(f, "  {} {}", "Host:".dimmed(), host)?;
                writeln!(f, "  {} {}", "Command:".dimmed(), command)?;

                if !output.is_empty() {
                    writeln!(f)?;
                    writeln!(f, "  {}:", "output".dimmed())?;
                    // Tail of the output is usually where the failure is
                    let lines: Vec<&str> = output.lines().collect();
                    let start = lines.len().saturating_sub(10);
                    for line in &lines[start..] {
                        writeln!(f, "    {}", line)?;
                    }
                }

                Ok(())
            }

            PorterError::Timeout {
                operation,
                duration_secs,
            } => {
                writeln!(
                    f,
                    "{}: {} timed out after {}s",
                    "TIMEOUT".red().bold(),
                    operation,
                    duration_secs
                )
            }

            PorterError::Action { action, message } => {
                writeln!(f, "{}: {}", "ACTION ERROR".red().bold(), message)?;
                writeln!(f, "  {} {}", "Action:".dimmed(), action)
            }

            PorterError::TaskFailed { task, host, source } => {
                writeln!(f, "{}: {}", "TASK FAILED".red().bold(), task)?;
                writeln!(f, "  {} {}", "Host:".dimmed(), host)?;
                writeln!(f)?;
                write!(f, "{}", source)
            }

            PorterError::Transfer { stage, message } => {
                writeln!(f, "{}: {}", "TRANSFER ERROR".red().bold(), message)?;
                writeln!(f, "  {} {}", "Stage:".dimmed(), stage)
            }

            PorterError::ValidationRejected { command, reason } => {
                writeln!(f, "{}: {}", "REJECTED".red().bold(), reason)?;
                writeln!(f, "  {} {}", "Command:".dimmed(), command)
            }

            PorterError::DangerousUnconfirmed { command, pattern } => {
                writeln!(
                    f,
                    "{}: command looks destructive",
                    "CONFIRMATION REQUIRED".yellow().bold()
                )?;
                writeln!(f, "  {} {}", "Command:".dimmed(), command)?;
                writeln!(f, "  {} {}", "Matched:".dimmed(), pattern)?;
                writeln!(f)?;
                writeln!(
                    f,
                    "{}: re-run with --confirm if this is intended",
                    "Hint".yellow().bold()
                )
            }

            PorterError::RateLimited { key } => {
                writeln!(f, "{}: too many commands for {}", "RATE LIMITED".red().bold(), key)
            }

            PorterError::NotFound { kind, id } => {
                writeln!(f, "{}: {} '{}'", "NOT FOUND".red().bold(), kind, id)
            }

            PorterError::InvalidTransition { id, from, to } => {
                writeln!(
                    f,
                    "{}: execution {} cannot move from {} to {}",
                    "STATE ERROR".red().bold(),
                    id,
                    from,
                    to
                )
            }

            PorterError::Config {
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "CONFIG ERROR".red().bold(), message)?;

                if let Some(suggestion) = suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }

                Ok(())
            }
        }
    }
}

/// Suggest common fixes for errors
pub fn suggest_fix(error: &PorterError) -> Option<String> {
    match error {
        PorterError::Ssh { message, .. } => {
            let message = message.to_lowercase();
            if message.contains("connection refused") {
                Some("Ensure SSH service is running on the target host".to_string())
            } else if message.contains("timeout") {
                Some("Check network connectivity and firewall rules".to_string())
            } else if message.contains("authentication") {
                Some("Verify SSH key or password is correct".to_string())
            } else {
                None
            }
        }

        PorterError::RemoteNonZero { output, .. } => {
            let output = output.to_lowercase();
            if output.contains("permission denied") {
                Some("Try running the task with sudo".to_string())
            } else if output.contains("command not found") {
                Some("Install the missing tool on the target host".to_string())
            } else {
                None
            }
        }

        PorterError::TaskFailed { source, .. } => suggest_fix(source),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_failed_display() {
        let err = PorterError::TaskFailed {
            task: "restart nginx".to_string(),
            host: "web-1".to_string(),
            source: Box::new(PorterError::RemoteNonZero {
                host: "web-1".to_string(),
                command: "systemctl restart nginx".to_string(),
                exit_code: 5,
                output: "Unit nginx.service not found.".to_string(),
            }),
        };

        let output = format!("{}", err);
        let clean_output = console::strip_ansi_codes(&output);

        assert!(clean_output.contains("restart nginx"));
        assert!(clean_output.contains("code 5"));
        assert!(clean_output.contains("Unit nginx.service not found."));
    }

    #[test]
    fn test_plain_message_wraps_task_name() {
        let err = PorterError::TaskFailed {
            task: "probe".to_string(),
            host: "h".to_string(),
            source: Box::new(PorterError::Timeout {
                operation: "wait-port 10.0.0.1:5432".to_string(),
                duration_secs: 30,
            }),
        };

        assert_eq!(
            err.plain_message(),
            "probe: wait-port 10.0.0.1:5432 timed out after 30s"
        );
        assert!(!err.is_transport());
    }

    #[test]
    fn test_output_reaches_through_task_failure() {
        let err = PorterError::TaskFailed {
            task: "build".to_string(),
            host: "h".to_string(),
            source: Box::new(PorterError::RemoteNonZero {
                host: "h".to_string(),
                command: "make".to_string(),
                exit_code: 2,
                output: "make: *** No targets.".to_string(),
            }),
        };

        assert_eq!(err.output(), Some("make: *** No targets."));
    }

    #[test]
    fn test_suggest_fix_permission_denied() {
        let err = PorterError::RemoteNonZero {
            host: "h".to_string(),
            command: "touch /etc/x".to_string(),
            exit_code: 1,
            output: "touch: cannot touch '/etc/x': Permission denied".to_string(),
        };

        assert!(suggest_fix(&err).unwrap().contains("sudo"));
    }
}
