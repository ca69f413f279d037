//! Guest serial console: buffering, pattern waits and command execution

pub mod buffer;
pub mod runner;
pub mod session;

pub use buffer::{ConsoleBuffer, Cursor};
pub use runner::CommandRunner;
pub use session::{ConsoleSession, ConsoleTransport, Match, Pattern, SessionOptions, SessionState};
