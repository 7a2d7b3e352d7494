//! Console dispatcher.
//!
//! Parsed commands are applied to a [`ConsoleTarget`], which the emulator and
//! the firmware console implement over their own session plumbing.

use core::fmt;

use crate::limits::{PowerLimitSource, SourceSet};
use crate::stage::ChargeStage;

use super::grammar::{self, AuthAction, Command, LimitCommand};
use super::status::SessionStatus;

/// One entry of the `help` catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HelpEntry {
    pub name: &'static str,
    pub usage: &'static str,
    pub summary: &'static str,
}

pub static HELP: [HelpEntry; 10] = [
    HelpEntry {
        name: "status",
        usage: "status",
        summary: "show stage, set-point, limits and alarm",
    },
    HelpEntry {
        name: "stage",
        usage: "stage",
        summary: "show the current charging stage",
    },
    HelpEntry {
        name: "limit",
        usage: "limit set|clear <source> | limit reset",
        summary: "assert or release a power-limit source",
    },
    HelpEntry {
        name: "temp",
        usage: "temp <deci-C>",
        summary: "set the simulated battery temperature",
    },
    HelpEntry {
        name: "loss",
        usage: "loss <mW>",
        summary: "set the simulated coil power loss",
    },
    HelpEntry {
        name: "auth",
        usage: "auth approve|reject|hang|offline",
        summary: "choose how the verifier answers",
    },
    HelpEntry {
        name: "tick",
        usage: "tick [n]",
        summary: "advance the session by n control periods",
    },
    HelpEntry {
        name: "connect",
        usage: "connect",
        summary: "place the receiver on the transmitter",
    },
    HelpEntry {
        name: "disconnect",
        usage: "disconnect",
        summary: "remove the receiver and reset the session",
    },
    HelpEntry {
        name: "help",
        usage: "help [topic]",
        summary: "list commands or describe one",
    },
];

/// Session surface the console drives.
pub trait ConsoleTarget {
    fn status(&self) -> SessionStatus;

    fn stage(&self) -> ChargeStage {
        self.status().stage
    }

    /// Asserts or releases `source`. Returns `true` when the set changed.
    fn set_limit(&mut self, source: PowerLimitSource, asserted: bool) -> bool;

    /// Clears resettable sources and returns the ones cleared.
    fn reset_limits(&mut self) -> SourceSet;

    fn set_battery_temp(&mut self, temp_dc: i16);

    fn set_power_loss(&mut self, loss_mw: u32);

    fn set_auth_behaviour(&mut self, action: AuthAction);

    /// Advances the session by `periods` control periods.
    fn tick(&mut self, periods: u16);

    fn connect(&mut self);

    fn disconnect(&mut self);
}

/// Successful command results.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsoleReply {
    Status(SessionStatus),
    Stage(ChargeStage),
    Limit {
        source: PowerLimitSource,
        asserted: bool,
        changed: bool,
    },
    LimitsReset(SourceSet),
    Temp(i16),
    Loss(u32),
    Auth(AuthAction),
    Ticked { periods: u16, stage: ChargeStage },
    Connected(ChargeStage),
    Disconnected,
    Help(&'static [HelpEntry]),
}

impl fmt::Display for ConsoleReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsoleReply::Status(status) => write!(f, "{status}"),
            ConsoleReply::Stage(stage) | ConsoleReply::Connected(stage) => {
                write!(f, "stage {stage}")
            }
            ConsoleReply::Limit {
                source,
                asserted,
                changed,
            } => {
                let verb = if *asserted { "set" } else { "cleared" };
                if *changed {
                    write!(f, "limit {source} {verb}")
                } else {
                    write!(f, "limit {source} unchanged")
                }
            }
            ConsoleReply::LimitsReset(cleared) => {
                write!(f, "limits reset ({} cleared)", cleared.len())
            }
            ConsoleReply::Temp(temp) => write!(f, "battery temp {temp} dC"),
            ConsoleReply::Loss(loss) => write!(f, "power loss {loss} mW"),
            ConsoleReply::Auth(action) => write!(f, "verifier will {}", action.label()),
            ConsoleReply::Ticked { periods, stage } => {
                write!(f, "advanced {periods} periods, stage {stage}")
            }
            ConsoleReply::Disconnected => f.write_str("disconnected"),
            ConsoleReply::Help(entries) => {
                for (index, entry) in entries.iter().enumerate() {
                    if index > 0 {
                        f.write_str("\n")?;
                    }
                    write!(f, "{:<40} {}", entry.usage, entry.summary)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandError<'a> {
    Parse(grammar::ParseError<'a>),
    UnknownTopic(&'a str),
    InvalidArgument(&'static str),
}

impl<'a> From<grammar::ParseError<'a>> for CommandError<'a> {
    fn from(error: grammar::ParseError<'a>) -> Self {
        Self::Parse(error)
    }
}

impl fmt::Display for CommandError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Parse(error) => write!(f, "{error}"),
            CommandError::UnknownTopic(topic) => write!(f, "no help for `{topic}`"),
            CommandError::InvalidArgument(reason) => f.write_str(reason),
        }
    }
}

/// Parses `line` and applies it to `target`.
pub fn execute<'a, T: ConsoleTarget>(
    target: &mut T,
    line: &'a str,
) -> Result<ConsoleReply, CommandError<'a>> {
    let command = grammar::parse(line)?;
    dispatch(target, command)
}

/// Applies an already parsed command.
pub fn dispatch<'a, T: ConsoleTarget>(
    target: &mut T,
    command: Command<'a>,
) -> Result<ConsoleReply, CommandError<'a>> {
    match command {
        Command::Status => Ok(ConsoleReply::Status(target.status())),
        Command::Stage => Ok(ConsoleReply::Stage(target.stage())),
        Command::Limit(LimitCommand::Set(source)) => Ok(ConsoleReply::Limit {
            source,
            asserted: true,
            changed: target.set_limit(source, true),
        }),
        Command::Limit(LimitCommand::Clear(source)) => Ok(ConsoleReply::Limit {
            source,
            asserted: false,
            changed: target.set_limit(source, false),
        }),
        Command::Limit(LimitCommand::Reset) => Ok(ConsoleReply::LimitsReset(target.reset_limits())),
        Command::Temp(temp) => {
            target.set_battery_temp(temp);
            Ok(ConsoleReply::Temp(temp))
        }
        Command::Loss(loss) => {
            target.set_power_loss(loss);
            Ok(ConsoleReply::Loss(loss))
        }
        Command::Auth(action) => {
            target.set_auth_behaviour(action);
            Ok(ConsoleReply::Auth(action))
        }
        Command::Tick(count) => {
            let periods = count.unwrap_or(1);
            if periods == 0 {
                return Err(CommandError::InvalidArgument("tick count must be at least 1"));
            }
            target.tick(periods);
            Ok(ConsoleReply::Ticked {
                periods,
                stage: target.stage(),
            })
        }
        Command::Connect => {
            target.connect();
            Ok(ConsoleReply::Connected(target.stage()))
        }
        Command::Disconnect => {
            target.disconnect();
            Ok(ConsoleReply::Disconnected)
        }
        Command::Help(None) => Ok(ConsoleReply::Help(&HELP)),
        Command::Help(Some(topic)) => HELP
            .iter()
            .position(|entry| entry.name.eq_ignore_ascii_case(topic))
            .map(|index| ConsoleReply::Help(&HELP[index..=index]))
            .ok_or(CommandError::UnknownTopic(topic)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingTarget {
        status: Option<SessionStatus>,
        limits: SourceSet,
        temp: Option<i16>,
        loss: Option<u32>,
        auth: Option<AuthAction>,
        ticks: u32,
        connected: bool,
    }

    impl ConsoleTarget for RecordingTarget {
        fn status(&self) -> SessionStatus {
            SessionStatus {
                limits: self.limits,
                stage: if self.connected {
                    ChargeStage::Handshake
                } else {
                    ChargeStage::Default
                },
                ..self.status.unwrap_or(SessionStatus::idle())
            }
        }

        fn set_limit(&mut self, source: PowerLimitSource, asserted: bool) -> bool {
            if asserted {
                self.limits.insert(source)
            } else {
                self.limits.remove(source)
            }
        }

        fn reset_limits(&mut self) -> SourceSet {
            let cleared = self.limits;
            self.limits = SourceSet::empty();
            cleared
        }

        fn set_battery_temp(&mut self, temp_dc: i16) {
            self.temp = Some(temp_dc);
        }

        fn set_power_loss(&mut self, loss_mw: u32) {
            self.loss = Some(loss_mw);
        }

        fn set_auth_behaviour(&mut self, action: AuthAction) {
            self.auth = Some(action);
        }

        fn tick(&mut self, periods: u16) {
            self.ticks += u32::from(periods);
        }

        fn connect(&mut self) {
            self.connected = true;
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }
    }

    #[test]
    fn limit_commands_report_changes() {
        let mut target = RecordingTarget::default();
        let reply = execute(&mut target, "limit set otg").expect("command should run");
        assert_eq!(
            reply,
            ConsoleReply::Limit {
                source: PowerLimitSource::Otg,
                asserted: true,
                changed: true,
            }
        );
        let reply = execute(&mut target, "limit set otg").expect("command should run");
        assert!(matches!(reply, ConsoleReply::Limit { changed: false, .. }));
        assert!(target.status().limits.contains(PowerLimitSource::Otg));
    }

    #[test]
    fn setters_reach_the_target() {
        let mut target = RecordingTarget::default();
        execute(&mut target, "temp 430").expect("temp");
        execute(&mut target, "loss 2500").expect("loss");
        execute(&mut target, "auth hang").expect("auth");
        execute(&mut target, "tick 4").expect("tick");
        execute(&mut target, "tick").expect("tick");
        assert_eq!(target.temp, Some(430));
        assert_eq!(target.loss, Some(2_500));
        assert_eq!(target.auth, Some(AuthAction::Hang));
        assert_eq!(target.ticks, 5);
    }

    #[test]
    fn zero_tick_is_rejected() {
        let mut target = RecordingTarget::default();
        assert!(matches!(
            execute(&mut target, "tick 0"),
            Err(CommandError::InvalidArgument(_))
        ));
        assert_eq!(target.ticks, 0);
    }

    #[test]
    fn connect_reports_new_stage() {
        let mut target = RecordingTarget::default();
        assert_eq!(
            execute(&mut target, "connect").expect("connect"),
            ConsoleReply::Connected(ChargeStage::Handshake)
        );
        assert_eq!(
            execute(&mut target, "disconnect").expect("disconnect"),
            ConsoleReply::Disconnected
        );
        assert_eq!(target.stage(), ChargeStage::Default);
    }

    #[test]
    fn help_topics_resolve_case_insensitively() {
        let mut target = RecordingTarget::default();
        match execute(&mut target, "help LIMIT").expect("help") {
            ConsoleReply::Help(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].name, "limit");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(
            execute(&mut target, "help warp"),
            Err(CommandError::UnknownTopic("warp"))
        );
    }
}
