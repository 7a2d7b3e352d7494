use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant as HostInstant};

use wlc_core::console::{CommandError, ConsoleReply, StatusFormatter, execute};

use crate::sim::Emulator;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TranscriptProfile {
    Charge,
    Thermal,
    Auth,
}

impl TranscriptProfile {
    pub fn log_path(self) -> &'static str {
        match self {
            TranscriptProfile::Charge => "transcripts/emulator-charge.log",
            TranscriptProfile::Thermal => "transcripts/emulator-thermal.log",
            TranscriptProfile::Auth => "transcripts/emulator-auth.log",
        }
    }

    pub fn header(self) -> &'static str {
        match self {
            TranscriptProfile::Charge => "Wireless charge emulator session transcript",
            TranscriptProfile::Thermal => "Wireless charge emulator thermal transcript",
            TranscriptProfile::Auth => "Wireless charge emulator authentication transcript",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, String> {
        if tag.eq_ignore_ascii_case("charge") {
            Ok(Self::Charge)
        } else if tag.eq_ignore_ascii_case("thermal") {
            Ok(Self::Thermal)
        } else if tag.eq_ignore_ascii_case("auth") {
            Ok(Self::Auth)
        } else {
            Err(format!("Unknown transcript profile `{tag}`"))
        }
    }
}

/// Console front-end over one [`Emulator`], mirrored into a transcript.
pub struct Session {
    emulator: Emulator,
    transcript: TranscriptLogger,
    started_at: HostInstant,
}

impl Session {
    pub fn new(profile: TranscriptProfile) -> io::Result<Self> {
        Ok(Self {
            emulator: Emulator::new(),
            transcript: TranscriptLogger::new(profile)?,
            started_at: HostInstant::now(),
        })
    }

    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<String>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        let elapsed = self.started_at.elapsed();
        self.transcript
            .append_line(elapsed, TranscriptRole::Host, trimmed)?;

        let mut lines = match execute(&mut self.emulator, trimmed) {
            Ok(ConsoleReply::Status(status)) => StatusFormatter::new(&status).lines(),
            Ok(reply) => reply.to_string().lines().map(str::to_owned).collect(),
            Err(CommandError::Parse(err)) => vec![format!("ERR syntax {err}")],
            Err(err) => vec![format!("ERR {err}")],
        };
        for record in self.emulator.take_alarm_frames() {
            lines.push(format!(
                "alarm -> {record} (t={}ms)",
                self.emulator.clock_ms()
            ));
        }

        self.record_output(elapsed, &lines)?;
        Ok(lines)
    }

    fn record_output(&mut self, elapsed: Duration, lines: &[String]) -> io::Result<()> {
        for line in lines {
            self.transcript
                .append_line(elapsed, TranscriptRole::Emulator, line)?;
        }
        Ok(())
    }
}

struct TranscriptLogger {
    writer: BufWriter<std::fs::File>,
}

impl TranscriptLogger {
    fn new(profile: TranscriptProfile) -> io::Result<Self> {
        let path = Path::new(profile.log_path());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut logger = Self {
            writer: BufWriter::new(file),
        };
        writeln!(logger.writer, "# {}", profile.header())?;
        writeln!(logger.writer, "# Host timestamps in ms; `tick` advances simulated time")?;
        writeln!(logger.writer)?;
        logger.writer.flush()?;
        Ok(logger)
    }

    fn append_line(
        &mut self,
        elapsed: Duration,
        role: TranscriptRole,
        line: &str,
    ) -> io::Result<()> {
        writeln!(
            self.writer,
            "[+{:>6} ms] {} {}",
            elapsed.as_millis(),
            role.prefix(),
            line
        )?;
        self.writer.flush()
    }
}

enum TranscriptRole {
    Host,
    Emulator,
}

impl TranscriptRole {
    fn prefix(&self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Emulator => "EMU <",
        }
    }
}
