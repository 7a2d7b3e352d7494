//! Session configuration: timing, retry budgets and the tables a device
//! profile loads at connect time.

use core::time::Duration;

use heapless::Vec;

use crate::accessory::RetryLimits;
use crate::alarm::fod::{DEFAULT_FOD_ROWS, MAX_FOD_ROWS};
use crate::alarm::thermal::{DEFAULT_RX_THERMAL_BANDS, DEFAULT_TX_BATTERY_BANDS, MAX_THERMAL_BANDS};
use crate::alarm::time::{DEFAULT_TIME_ROWS, MAX_TIME_ROWS};
use crate::alarm::{FodRow, ThermalBand, TimeAlarmRow};
use crate::controller::iout::{DEFAULT_IOUT_BANDS, IoutBand, LowVrectConfig, MAX_IOUT_BANDS};
use crate::limits::{LimitTable, default_limit_table};
use crate::modes::{ModeTable, default_mode_table};

/// Timing and thresholds used by the stage sequencer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SequencerConfig {
    /// Delay before retrying a discovery stage.
    pub stage_retry: Duration,
    /// Period of the regulation tick.
    pub regulation_interval: Duration,
    /// Allowed Vout shortfall below the set-point.
    pub vout_low_margin_mv: u32,
    /// Allowed Vout excess above the set-point.
    pub vout_high_margin_mv: u32,
    /// Consecutive out-of-range ticks before the voltage source is asserted.
    pub vout_err_limit: u8,
    /// Consecutive failed boost confirmations before the boost source is asserted.
    pub boost_err_limit: u8,
    pub low_vrect: LowVrectConfig,
    pub retries: RetryLimits,
}

impl SequencerConfig {
    pub const fn new() -> Self {
        Self {
            stage_retry: Duration::from_millis(100),
            regulation_interval: Duration::from_millis(300),
            vout_low_margin_mv: 500,
            vout_high_margin_mv: 1_000,
            vout_err_limit: 3,
            boost_err_limit: 5,
            low_vrect: LowVrectConfig::new(),
            retries: RetryLimits::new(3, 3, 3),
        }
    }

    #[must_use]
    pub const fn with_regulation_interval(mut self, interval: Duration) -> Self {
        self.regulation_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_low_vrect(mut self, low_vrect: LowVrectConfig) -> Self {
        self.low_vrect = low_vrect;
        self
    }

    #[must_use]
    pub const fn with_retries(mut self, retries: RetryLimits) -> Self {
        self.retries = retries;
        self
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-session timing shared by the runtime tasks.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SessionConfig {
    pub sequencer: SequencerConfig,
    /// Longest wait for a verifier verdict.
    pub auth_timeout: Duration,
    pub thermal_interval: Duration,
    /// Default foreign-object poll period when no row asks for another.
    pub alarm_interval: Duration,
    /// Time a new foreign-object row must persist before it is adopted.
    pub fod_debounce: Duration,
}

impl SessionConfig {
    pub const fn new() -> Self {
        Self {
            sequencer: SequencerConfig::new(),
            auth_timeout: Duration::from_millis(1_000),
            thermal_interval: Duration::from_millis(300),
            alarm_interval: Duration::from_millis(300),
            fod_debounce: Duration::from_millis(900),
        }
    }

    #[must_use]
    pub const fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_sequencer(mut self, sequencer: SequencerConfig) -> Self {
        self.sequencer = sequencer;
        self
    }

    #[must_use]
    pub const fn with_intervals(mut self, thermal: Duration, alarm: Duration) -> Self {
        self.thermal_interval = thermal;
        self.alarm_interval = alarm;
        self
    }

    #[must_use]
    pub const fn with_fod_debounce(mut self, debounce: Duration) -> Self {
        self.fod_debounce = debounce;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub type ThermalBands = Vec<ThermalBand, MAX_THERMAL_BANDS>;
pub type FodRows = Vec<FodRow, MAX_FOD_ROWS>;
pub type TimeRows = Vec<TimeAlarmRow, MAX_TIME_ROWS>;
pub type IoutBands = Vec<IoutBand, MAX_IOUT_BANDS>;

/// Everything a device variant contributes to a session.
#[derive(Clone, Debug)]
pub struct DeviceProfile {
    pub modes: ModeTable,
    pub limits: LimitTable,
    /// Battery bands watched by the receive-side protection monitor.
    pub rx_thermal_bands: ThermalBands,
    /// Battery bands that raise reverse-charging alarms.
    pub tx_battery_bands: ThermalBands,
    pub fod_rows: FodRows,
    pub time_rows: TimeRows,
    /// Output-current bands applied during regulation.
    pub iout_bands: IoutBands,
    pub session: SessionConfig,
}

impl DeviceProfile {
    #[must_use]
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }
}

impl Default for DeviceProfile {
    fn default() -> Self {
        default_profile()
    }
}

pub fn default_thermal_bands() -> ThermalBands {
    collect_rows(&DEFAULT_RX_THERMAL_BANDS)
}

pub fn default_tx_battery_bands() -> ThermalBands {
    collect_rows(&DEFAULT_TX_BATTERY_BANDS)
}

pub fn default_fod_rows() -> FodRows {
    collect_rows(&DEFAULT_FOD_ROWS)
}

pub fn default_time_rows() -> TimeRows {
    collect_rows(&DEFAULT_TIME_ROWS)
}

pub fn default_iout_bands() -> IoutBands {
    collect_rows(&DEFAULT_IOUT_BANDS)
}

/// Reference profile built from the default tables.
pub fn default_profile() -> DeviceProfile {
    DeviceProfile {
        modes: default_mode_table(),
        limits: default_limit_table(),
        rx_thermal_bands: default_thermal_bands(),
        tx_battery_bands: default_tx_battery_bands(),
        fod_rows: default_fod_rows(),
        time_rows: default_time_rows(),
        iout_bands: default_iout_bands(),
        session: SessionConfig::new(),
    }
}

fn collect_rows<T: Copy, const N: usize>(rows: &[T]) -> Vec<T, N> {
    rows.iter().take(N).copied().collect()
}
