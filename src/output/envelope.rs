// JSON envelopes for callers of the orchestration layer

use serde::Serialize;

use super::errors::PorterError;
use crate::orchestrator::CommandOutput;

/// `success: false` plus a short reason. The interlock flags are only
/// present when they apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub rate_limited: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub requires_confirm: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl From<&PorterError> for ErrorEnvelope {
    fn from(err: &PorterError) -> Self {
        ErrorEnvelope {
            success: false,
            error: err.plain_message(),
            rate_limited: err.is_rate_limited(),
            requires_confirm: err.requires_confirm(),
            pattern: match err {
                PorterError::DangerousUnconfirmed { pattern, .. } => Some(pattern.clone()),
                _ => None,
            },
        }
    }
}

/// Response to an ad-hoc command
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CommandResponse {
    Done {
        success: bool,
        machine_id: String,
        output: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        stderr: String,
        exit_code: i32,
    },
    Error(ErrorEnvelope),
}

impl CommandResponse {
    pub fn success(&self) -> bool {
        match self {
            CommandResponse::Done { success, .. } => *success,
            CommandResponse::Error(_) => false,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"success":false,"error":"unserializable response: {}"}}"#, e)
        })
    }
}

impl From<Result<CommandOutput, PorterError>> for CommandResponse {
    fn from(result: Result<CommandOutput, PorterError>) -> Self {
        match result {
            Ok(out) => CommandResponse::Done {
                success: out.exit_code == 0,
                machine_id: out.machine_id,
                output: out.output,
                stderr: out.stderr,
                exit_code: out.exit_code,
            },
            Err(e) => CommandResponse::Error(ErrorEnvelope::from(&e)),
        }
    }
}
