//! Async session runtime for the receive-side charging engine.
//!
//! `wlc-core` holds the state machines; this crate gives them a clock, shares
//! the per-session state between tasks and runs the periodic loops:
//!
//! - the control loop, which drives the stage sequencer and the
//!   authentication handshake;
//! - the protection monitor, which maps battery temperature onto the thermal
//!   power-limit source;
//! - the alarm monitors, which classify power loss (and, in reverse charging,
//!   elapsed time and battery temperature) and send the merged alarm.
//!
//! Every loop stops through a [`TaskControl`] and signals when it has drained,
//! so a session can be torn down without leaving a task mid-cycle.

#![cfg_attr(target_os = "none", no_std)]

pub mod auth;
pub mod control;
pub mod monitor;
pub mod session;

pub use auth::AuthService;
pub use control::ControlLoop;
pub use monitor::{AlarmTask, ProtectionTask, TaskControl, TxAlarmTask};
pub use session::{RuntimeInstant, SessionMutex, SharedSession};
