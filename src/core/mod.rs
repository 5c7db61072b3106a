// Public modules
pub mod config;
pub mod context;
pub mod defaults;
pub mod deploy;
pub mod error;
pub mod executor;
pub mod operation;
pub mod ssh;
pub mod stage;

// Re-export common types for convenience
pub use context::ExecutionContext;
pub use error::{Error, ErrorCode, Result};
pub use executor::{OperationOutcome, RunReport, RunStatus, SessionResult};
pub use operation::Operation;
pub use stage::{HostRef, StageDefinition, StageRegistry};
