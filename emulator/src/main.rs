mod session;
mod sim;

use std::env;
use std::io::{self, BufRead, Write};
use std::process;

use session::{Session, TranscriptProfile};

fn main() -> io::Result<()> {
    let profile = parse_profile().unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("Usage: wlc-emulator [--profile <charge|thermal|auth>]");
        process::exit(2);
    });

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    let mut session = Session::new(profile)?;
    let mut line = String::new();

    writeln!(
        writer,
        "Wireless charge emulator ready. Type `connect` to start, `help` for commands, `exit` to quit."
    )?;

    loop {
        line.clear();
        write!(writer, "> ")?;
        writer.flush()?;

        if reader.read_line(&mut line)? == 0 {
            writeln!(writer)?;
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.eq_ignore_ascii_case("exit") || trimmed.eq_ignore_ascii_case("quit") {
            writeln!(writer, "Session closed.")?;
            break;
        }

        for response in session.handle_command(trimmed)? {
            writeln!(writer, "{response}")?;
        }
    }

    Ok(())
}

fn parse_profile() -> Result<TranscriptProfile, String> {
    let mut args = env::args().skip(1);
    match args.next() {
        Some(arg) if arg == "--profile" => args
            .next()
            .ok_or_else(|| "Expected value after --profile".to_string())
            .and_then(|value| TranscriptProfile::from_tag(&value)),
        Some(arg) => match arg.strip_prefix("--profile=") {
            Some(value) => TranscriptProfile::from_tag(value),
            None => TranscriptProfile::from_tag(&arg),
        },
        None => Ok(TranscriptProfile::Charge),
    }
}
