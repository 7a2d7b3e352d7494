//! Session snapshot rendered by the `status` command.

use core::fmt::{self, Write as _};

use crate::alarm::AlarmRecord;
use crate::limits::{PowerCeiling, SourceSet};
use crate::modes::{AuthLevel, CableType, IconClass, ModeId};
use crate::stage::ChargeStage;

/// Point-in-time view of one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionStatus {
    pub stage: ChargeStage,
    pub mode: Option<ModeId>,
    pub mode_name: Option<&'static str>,
    /// Charging indicator the UI should show.
    pub icon: IconClass,
    pub setpoint: Option<PowerCeiling>,
    pub ceiling: PowerCeiling,
    pub limits: SourceSet,
    pub alarm: AlarmRecord,
    pub cable: CableType,
    pub auth: AuthLevel,
    pub battery_temp_dc: Option<i16>,
}

impl SessionStatus {
    /// Snapshot of a session that has not started.
    #[must_use]
    pub const fn idle() -> Self {
        Self {
            stage: ChargeStage::Default,
            mode: None,
            mode_name: None,
            icon: IconClass::Normal,
            setpoint: None,
            ceiling: PowerCeiling::UNCONSTRAINED,
            limits: SourceSet::empty(),
            alarm: AlarmRecord::CLEAR,
            cable: CableType::Unknown,
            auth: AuthLevel::Unverified,
            battery_temp_dc: None,
        }
    }
}

/// Renders a [`SessionStatus`] as console lines.
#[derive(Clone, Copy, Debug)]
pub struct StatusFormatter<'a> {
    status: &'a SessionStatus,
}

impl<'a> StatusFormatter<'a> {
    #[must_use]
    pub const fn new(status: &'a SessionStatus) -> Self {
        Self { status }
    }

    /// `stage regulation mode=15w icon=super-fast cable=high-power auth=verified`
    pub fn write_stage_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        write!(writer, "stage {} mode=", self.status.stage)?;
        match (self.status.mode, self.status.mode_name) {
            (Some(_), Some(name)) => writer.write_str(name)?,
            (Some(id), None) => write!(writer, "#{id}")?,
            (None, _) => writer.write_str("none")?,
        }
        write!(
            writer,
            " icon={} cable={} auth={}",
            self.status.icon.label(),
            self.status.cable.label(),
            self.status.auth.label()
        )
    }

    /// `power setpoint=9000/9900mV/1600mA ceiling=unconstrained limits=otg,thermal`
    pub fn write_power_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        writer.write_str("power setpoint=")?;
        match self.status.setpoint {
            Some(setpoint) => write_ceiling(writer, setpoint)?,
            None => writer.write_str("none")?,
        }
        writer.write_str(" ceiling=")?;
        write_ceiling(writer, self.status.ceiling)?;
        writer.write_str(" limits=")?;
        if self.status.limits.is_empty() {
            writer.write_str("none")
        } else {
            for (index, source) in self.status.limits.iter().enumerate() {
                if index > 0 {
                    writer.write_char(',')?;
                }
                writer.write_str(source.label())?;
            }
            Ok(())
        }
    }

    /// `alarm clear battery=25.0C`
    pub fn write_alarm_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        write!(writer, "alarm {} battery=", self.status.alarm)?;
        match self.status.battery_temp_dc {
            Some(temp) => write_deci_celsius(writer, temp),
            None => writer.write_str("unknown"),
        }
    }
}

#[cfg(feature = "alloc")]
impl StatusFormatter<'_> {
    /// Renders the three status lines into owned strings.
    #[must_use]
    pub fn lines(&self) -> alloc::vec::Vec<alloc::string::String> {
        let writers: [fn(&Self, &mut alloc::string::String) -> fmt::Result; 3] = [
            Self::write_stage_line,
            Self::write_power_line,
            Self::write_alarm_line,
        ];
        writers
            .iter()
            .map(|write| {
                let mut line = alloc::string::String::new();
                // Writing into a String cannot fail.
                let _ = write(self, &mut line);
                line
            })
            .collect()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formatter = StatusFormatter::new(self);
        formatter.write_stage_line(f)?;
        f.write_char('\n')?;
        formatter.write_power_line(f)?;
        f.write_char('\n')?;
        formatter.write_alarm_line(f)
    }
}

fn write_ceiling<W: fmt::Write>(writer: &mut W, ceiling: PowerCeiling) -> fmt::Result {
    if ceiling.is_unconstrained() {
        writer.write_str("unconstrained")
    } else {
        write!(
            writer,
            "{}/{}mV/{}mA",
            ceiling.vtx_mv, ceiling.vrx_mv, ceiling.irx_ma
        )
    }
}

fn write_deci_celsius<W: fmt::Write>(writer: &mut W, temp_dc: i16) -> fmt::Result {
    let sign = if temp_dc < 0 { "-" } else { "" };
    let magnitude = temp_dc.unsigned_abs();
    write!(writer, "{sign}{}.{}C", magnitude / 10, magnitude % 10)
}
