pub mod error;
pub mod log;
pub mod process;
pub mod prompt;
pub mod ring;

pub use error::{InputError, StartError, StopError};
pub use log::{Channel, LogEntry, ParseChannelError};
pub use process::{LaunchSpec, ManagedProcess, ProcessId, ProcessState};
pub use prompt::{classify, route_line, LineKind, PromptKind};
pub use ring::LogRing;
