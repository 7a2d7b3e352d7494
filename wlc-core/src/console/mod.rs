//! Line console shared by the emulator and firmware front-ends.

pub mod commands;
pub mod grammar;
pub mod status;

pub use commands::{CommandError, ConsoleReply, ConsoleTarget, HelpEntry, execute};
pub use grammar::{AuthAction, Command, LimitCommand, ParseError, parse};
pub use status::{SessionStatus, StatusFormatter};
