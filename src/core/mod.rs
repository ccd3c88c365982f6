//! Core plumbing for Maaflow.
//!
//! Configuration, process invocation and execution handles used by the
//! engine and workflow layers.

mod config;
mod handle;
mod invoker;
mod notify;

pub use config::{Config, EngineConfig, LoggingConfig, WorkflowConfig};
pub use handle::{ExecutionHandle, ProcessEvent, ProcessExit, TERMINATION_GRACE};
pub use invoker::{InvokeError, ProcessInvoker, ProcessOutput, DEFAULT_TIMEOUT};
pub use notify::send_notification;
