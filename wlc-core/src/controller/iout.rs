//! Output-current shaping applied on every regulation tick.
//!
//! The negotiated set-point gives the most current a mode may draw. Three
//! rules narrow it further, in order: the band table keyed by the averaged
//! output current, a step-down while the rectifier voltage sags, and the cap
//! derived from the last alarm the transmitter sent us.

use core::time::Duration;

use heapless::Vec;

use crate::alarm::AlarmRecord;

/// Upper bound on configured current bands.
pub const MAX_IOUT_BANDS: usize = 8;

/// Current limit used while the averaged output current sits in
/// `[iavg_min_ma, iavg_max_ma)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IoutBand {
    pub iavg_min_ma: u32,
    pub iavg_max_ma: u32,
    pub iout_set_ma: u32,
}

impl IoutBand {
    pub const fn new(iavg_min_ma: u32, iavg_max_ma: u32, iout_set_ma: u32) -> Self {
        Self {
            iavg_min_ma,
            iavg_max_ma,
            iout_set_ma,
        }
    }

    pub const fn contains(self, iavg_ma: u32) -> bool {
        iavg_ma >= self.iavg_min_ma && iavg_ma < self.iavg_max_ma
    }
}

/// Reference bands: the limit opens up as the load starts drawing.
pub const DEFAULT_IOUT_BANDS: [IoutBand; 3] = [
    IoutBand::new(0, 500, 1_000),
    IoutBand::new(500, 900, 1_300),
    IoutBand::new(900, u32::MAX, 2_000),
];

/// Step-down applied while the rectifier voltage stays below the mode's floor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LowVrectConfig {
    /// Consecutive low ticks before the first step.
    pub trip_count: u8,
    pub step_ma: u32,
    /// The step never goes below this.
    pub floor_ma: u32,
    /// How long the reduced current is held once the voltage recovers.
    pub restore: Duration,
}

impl LowVrectConfig {
    pub const fn new() -> Self {
        Self {
            trip_count: 3,
            step_ma: 100,
            floor_ma: 300,
            restore: Duration::from_secs(10),
        }
    }
}

impl Default for LowVrectConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Readings and targets for one tick.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IoutTick {
    /// Current of the negotiated set-point.
    pub max_ma: u32,
    /// Current the output stage runs at now, if anything was applied.
    pub applied_ma: Option<u32>,
    pub iavg_ma: u32,
    pub vrect_mv: u32,
    pub vrect_min_mv: u32,
    pub vrx_mv: u32,
    pub tx_alarm: AlarmRecord,
}

#[derive(Clone, Debug)]
pub struct IoutRegulator {
    bands: Vec<IoutBand, MAX_IOUT_BANDS>,
    low_vrect: LowVrectConfig,
    restore_ticks: Option<u32>,
    low_count: u8,
    restore_left: u32,
}

impl IoutRegulator {
    /// `interval` is the regulation period; the restore hold is counted in
    /// ticks of it. A zero interval disables the low-voltage step-down.
    pub fn new(bands: &[IoutBand], low_vrect: LowVrectConfig, interval: Duration) -> Self {
        let restore_ticks = low_vrect
            .restore
            .as_millis()
            .checked_div(interval.as_millis())
            .map(|ticks| u32::try_from(ticks).unwrap_or(u32::MAX));
        Self {
            bands: bands.iter().take(MAX_IOUT_BANDS).copied().collect(),
            low_vrect,
            restore_ticks,
            low_count: 0,
            restore_left: 0,
        }
    }

    pub fn bands(&self) -> &[IoutBand] {
        &self.bands
    }

    /// Returns `true` while a low-voltage step-down is in force or held.
    pub fn stepped_down(&self) -> bool {
        self.restore_left > 0
    }

    pub fn reset(&mut self) {
        self.low_count = 0;
        self.restore_left = 0;
    }

    /// Current limit for this tick, never above `tick.max_ma`.
    pub fn limit(&mut self, tick: &IoutTick) -> u32 {
        let mut limit = self
            .bands
            .iter()
            .find(|band| band.contains(tick.iavg_ma))
            .map_or(tick.max_ma, |band| band.iout_set_ma);

        if let Some(restore_ticks) = self.restore_ticks {
            let applied = tick.applied_ma.unwrap_or(tick.max_ma);
            if tick.vrect_mv < tick.vrect_min_mv {
                self.low_count = self.low_count.saturating_add(1);
                if self.low_count >= self.low_vrect.trip_count {
                    self.low_count = self.low_vrect.trip_count;
                    limit = applied
                        .saturating_sub(self.low_vrect.step_ma)
                        .max(self.low_vrect.floor_ma);
                    self.restore_left = restore_ticks;
                } else if self.restore_left > 0 {
                    limit = applied;
                }
            } else if self.restore_left > 0 {
                self.low_count = 0;
                self.restore_left -= 1;
                limit = applied;
            } else {
                self.low_count = 0;
            }
        }

        if let Some(cap) = tx_alarm_ilim(&tick.tx_alarm, tick.vrx_mv) {
            limit = limit.min(cap);
        }
        limit.min(tick.max_ma)
    }
}

/// Current the receiver may draw at `vrx_mv` under a transmitter alarm.
///
/// `None` when the alarm is clear or carries no power limit.
pub fn tx_alarm_ilim(alarm: &AlarmRecord, vrx_mv: u32) -> Option<u32> {
    if alarm.is_clear() || alarm.plim_mw == 0 || vrx_mv == 0 {
        return None;
    }
    let ilim = u64::from(alarm.plim_mw) * 1_000 / u64::from(vrx_mv);
    Some(u32::try_from(ilim).unwrap_or(u32::MAX))
}
