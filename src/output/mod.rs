// Output module for Porter

pub mod envelope;
pub mod errors;
pub mod events;
pub mod terminal;

pub use envelope::{CommandResponse, ErrorEnvelope};
pub use errors::*;
pub use events::*;
pub use terminal::TerminalOutput;

/// Output format for Porter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable text output with colors
    #[default]
    Text,
    /// Machine-readable JSON output
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("unknown output format '{}'", other)),
        }
    }
}
