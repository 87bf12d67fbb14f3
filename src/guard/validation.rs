// Structural validation and danger classification for ad-hoc commands

use once_cell::sync::Lazy;
use regex::Regex;

use crate::output::errors::PorterError;

pub const DEFAULT_MAX_COMMAND_LENGTH: usize = 4096;

// :(){ :|:& };: and renamed variants
static FORK_BOMB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\S+)\s*\(\s*\)\s*\{[^}]*\|\s*\S+\s*&[^}]*\}\s*;").unwrap());

static DANGEROUS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("rm -rf", r"\brm\s+(-[a-zA-Z]*[rR][a-zA-Z]*f|-[a-zA-Z]*f[a-zA-Z]*[rR]|-[rR]\s+-f|-f\s+-[rR])\b"),
        ("rm --recursive", r"\brm\s+.*--recursive"),
        ("dd", r"\bdd\s+.*\b(if|of)="),
        ("mkfs", r"\bmkfs(\.\w+)?\b"),
        ("wipefs", r"\bwipefs\b"),
        ("fdisk", r"\b(s?fdisk|parted)\b"),
        ("shutdown", r"\bshutdown\b"),
        ("reboot", r"\breboot\b"),
        ("halt", r"\b(halt|poweroff)\b"),
        ("init", r"\b(init|telinit)\s+[06]\b"),
        ("raw device write", r">\s*/dev/(sd|hd|nvme|vd|xvd)[a-z0-9]*"),
        ("chmod -R 777 /", r"\bchmod\s+-R\s+0?777\s+/(\s|$)"),
        ("chown -R /", r"\bchown\s+-R\s+\S+\s+/(\s|$)"),
        ("kill init", r"\bkill\s+-9\s+(1|-1)\b"),
        ("killall", r"\bkillall\b"),
        ("stop sshd", r"\bsystemctl\s+(stop|disable|mask)\s+sshd?\b"),
        ("pipe to shell", r"\b(curl|wget)\b[^|]*\|\s*(sudo\s+)?(ba|z)?sh\b"),
        ("move to /dev/null", r"\bmv\s+.*\s/dev/null\b"),
    ]
    .into_iter()
    .map(|(label, pattern)| (label, Regex::new(pattern).unwrap()))
    .collect()
});

/// Reject shapes that have no business in a one-line ad-hoc command and
/// return the normalized (trimmed) form.
pub fn validate(command: &str) -> Result<String, PorterError> {
    validate_with_limit(command, DEFAULT_MAX_COMMAND_LENGTH)
}

fn validate_with_limit(command: &str, max_len: usize) -> Result<String, PorterError> {
    let reject = |reason: &str| PorterError::ValidationRejected {
        command: command.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(reject("empty command"));
    }
    if trimmed.len() > max_len {
        return Err(reject(&format!("longer than {} bytes", max_len)));
    }
    if trimmed.contains('\0') {
        return Err(reject("contains a NUL byte"));
    }
    if trimmed.contains('\n') || trimmed.contains('\r') {
        return Err(reject("contains a line break"));
    }
    if FORK_BOMB.is_match(trimmed) {
        return Err(reject("fork bomb"));
    }

    Ok(trimmed.to_string())
}

/// Label of the first builtin heuristic the command matches
pub fn is_dangerous(command: &str) -> Option<&'static str> {
    DANGEROUS
        .iter()
        .find(|(_, re)| re.is_match(command))
        .map(|(label, _)| *label)
}

/// Validation plus the dangerous-command interlock, with caller-supplied
/// patterns appended to the builtin set.
#[derive(Debug, Clone)]
pub struct CommandGuard {
    extra: Vec<Regex>,
    max_len: usize,
}

impl Default for CommandGuard {
    fn default() -> Self {
        CommandGuard {
            extra: Vec::new(),
            max_len: DEFAULT_MAX_COMMAND_LENGTH,
        }
    }
}

impl CommandGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_patterns<I, S>(mut self, patterns: I) -> Result<Self, PorterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let re = Regex::new(pattern).map_err(|e| PorterError::Config {
                message: format!("invalid dangerous pattern '{}': {}", pattern, e),
                suggestion: Some("Patterns use Rust regex syntax".to_string()),
            })?;
            self.extra.push(re);
        }
        Ok(self)
    }

    pub fn with_max_length(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn validate(&self, command: &str) -> Result<String, PorterError> {
        validate_with_limit(command, self.max_len)
    }

    /// The matched pattern, builtin label or extra regex source
    pub fn is_dangerous(&self, command: &str) -> Option<String> {
        if let Some(label) = is_dangerous(command) {
            return Some(label.to_string());
        }
        self.extra
            .iter()
            .find(|re| re.is_match(command))
            .map(|re| re.as_str().to_string())
    }

    /// Admit a command for execution. `skip_validate` bypasses both stages;
    /// otherwise a dangerous command needs `confirmed`.
    pub fn check(
        &self,
        command: &str,
        confirmed: bool,
        skip_validate: bool,
    ) -> Result<String, PorterError> {
        if skip_validate {
            return Ok(command.to_string());
        }

        let normalized = self.validate(command)?;
        if !confirmed {
            if let Some(pattern) = self.is_dangerous(&normalized) {
                return Err(PorterError::DangerousUnconfirmed {
                    command: normalized,
                    pattern,
                });
            }
        }
        Ok(normalized)
    }
}
