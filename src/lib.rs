// Porter - fleet task execution over SSH
//
// A small task DSL, a per-host executor with retry/condition/loop/register
// semantics, log following, and tracked fan-out across machines.

pub mod config;
pub mod executor;
pub mod guard;
pub mod inventory;
pub mod logstream;
pub mod modules;
pub mod orchestrator;
pub mod output;
pub mod task;
pub mod transfer;

pub use config::PorterConfig;
pub use executor::{Connection, Connector, Executor, ExecutorConfig, Stats};
pub use inventory::{Host, Inventory, MachineStore};
pub use orchestrator::{ExecutionRecord, ExecutionStatus, Orchestrator};
pub use output::{PorterError, TerminalOutput};
pub use task::{Task, TaskBuilder, VarBag};

/// Version of the Porter tool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::executor::{Connection, Executor, LocalConnection};
    pub use crate::inventory::Host;
    pub use crate::output::PorterError;
    pub use crate::task::*;
}
