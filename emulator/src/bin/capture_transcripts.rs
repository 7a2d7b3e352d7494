use std::io;

#[allow(dead_code)]
#[path = "../sim.rs"]
mod sim;

#[allow(dead_code)]
#[path = "../session.rs"]
mod session;

use session::{Session, TranscriptProfile};

const CHARGE: &[&str] = &[
    "help",
    "connect",
    "tick",
    "status",
    "limit set otg",
    "tick 2",
    "status",
    "limit clear otg",
    "tick 2",
    "disconnect",
    "status",
];

const THERMAL: &[&str] = &[
    "connect",
    "tick 3",
    "temp 440",
    "tick 6",
    "status",
    "loss 2500",
    "tick 12",
    "status",
    "temp 380",
    "loss 0",
    "tick 12",
    "status",
];

const AUTH: &[&str] = &[
    "auth offline",
    "connect",
    "tick",
    "status",
    "auth approve",
    "tick 4",
    "status",
    "disconnect",
    "auth hang",
    "connect",
    "tick",
    "status",
];

fn main() -> io::Result<()> {
    record_profile(TranscriptProfile::Charge, CHARGE)?;
    record_profile(TranscriptProfile::Thermal, THERMAL)?;
    record_profile(TranscriptProfile::Auth, AUTH)?;
    Ok(())
}

fn record_profile(profile: TranscriptProfile, script: &[&str]) -> io::Result<()> {
    let mut session = Session::new(profile)?;
    for line in script {
        let _ = session.handle_command(line)?;
    }
    Ok(())
}
