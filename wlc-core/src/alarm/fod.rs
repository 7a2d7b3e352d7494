//! Foreign-object classification over power-loss readings.

use core::time::Duration;

use heapless::Vec;

use super::{AlarmRecord, AlarmSource};
use crate::hal::LossSample;
use crate::telemetry::TelemetryInstant;

/// Upper bound on configured condition rows.
pub const MAX_FOD_ROWS: usize = 8;

/// One classification condition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FodRow {
    pub loss_source: u8,
    pub scene: Option<u8>,
    pub accessory: Option<u8>,
    pub low_mw: u32,
    pub high_mw: u32,
    /// Poll delay adopted after this row's alarm is delivered.
    pub repoll: Duration,
    pub alarm: AlarmRecord,
}

impl FodRow {
    pub const fn new(
        loss_source: u8,
        low_mw: u32,
        high_mw: u32,
        repoll: Duration,
        alarm: AlarmRecord,
    ) -> Self {
        Self {
            loss_source,
            scene: None,
            accessory: None,
            low_mw,
            high_mw,
            repoll,
            alarm,
        }
    }

    #[must_use]
    pub const fn for_scene(mut self, scene: u8) -> Self {
        self.scene = Some(scene);
        self
    }

    #[must_use]
    pub const fn for_accessory(mut self, accessory: u8) -> Self {
        self.accessory = Some(accessory);
        self
    }

    /// Returns `true` when `sample` falls inside this row.
    pub fn matches(&self, sample: &LossSample) -> bool {
        self.loss_source == sample.source
            && self.scene.is_none_or(|scene| scene == sample.scene)
            && self.accessory.is_none_or(|accessory| accessory == sample.accessory)
            && (self.low_mw..self.high_mw).contains(&sample.ploss_mw)
    }
}

/// Classification result for one sample.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FodVerdict {
    /// Record in force after this sample.
    pub record: AlarmRecord,
    /// Set when a row was confirmed by this sample; carries its re-poll delay.
    pub confirmed_repoll: Option<Duration>,
}

/// Debounced foreign-object classifier.
#[derive(Clone, Debug)]
pub struct FodMonitor<I> {
    rows: Vec<FodRow, MAX_FOD_ROWS>,
    debounce: Duration,
    candidate: Option<(usize, I)>,
    confirmed: Option<usize>,
    record: AlarmRecord,
}

impl<I> FodMonitor<I>
where
    I: TelemetryInstant,
{
    pub fn new(rows: &[FodRow], debounce: Duration) -> Self {
        let mut table = Vec::new();
        for row in rows.iter().take(MAX_FOD_ROWS) {
            // `take` bounds the iterator to the table capacity.
            let _ = table.push(*row);
        }
        Self {
            rows: table,
            debounce,
            candidate: None,
            confirmed: None,
            record: AlarmRecord::CLEAR,
        }
    }

    /// Record currently in force.
    pub fn record(&self) -> AlarmRecord {
        self.record
    }

    /// Returns to the initial, unalarmed state.
    pub fn reset(&mut self) {
        self.candidate = None;
        self.confirmed = None;
        self.record = AlarmRecord::CLEAR;
    }

    /// Classifies `sample` taken at `now`.
    ///
    /// No match, or more than one match, leaves the record untouched. A new
    /// row must persist for the debounce window before it is confirmed.
    pub fn classify(&mut self, sample: &LossSample, now: I) -> FodVerdict {
        let Some(row) = self.unique_match(sample) else {
            self.candidate = None;
            return self.hold();
        };

        if self.confirmed == Some(row) {
            self.candidate = None;
            return self.hold();
        }

        let since = match self.candidate {
            Some((pending, since)) if pending == row => since,
            _ => {
                self.candidate = Some((row, now));
                now
            }
        };

        if now.saturating_duration_since(since) < self.debounce {
            return self.hold();
        }

        self.candidate = None;
        self.confirmed = Some(row);
        self.record = self.rows[row].alarm;
        FodVerdict {
            record: self.record,
            confirmed_repoll: Some(self.rows[row].repoll),
        }
    }

    fn unique_match(&self, sample: &LossSample) -> Option<usize> {
        let mut matches = self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.matches(sample))
            .map(|(index, _)| index);
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(first)
    }

    fn hold(&self) -> FodVerdict {
        FodVerdict {
            record: self.record,
            confirmed_repoll: None,
        }
    }
}

/// Reference rows: normal loss clears, moderate loss limits, heavy loss cuts power.
pub const DEFAULT_FOD_ROWS: [FodRow; 3] = [
    FodRow::new(0, 0, 2_000, Duration::from_millis(300), AlarmRecord::CLEAR),
    FodRow::new(
        0,
        2_000,
        4_000,
        Duration::from_secs(2),
        AlarmRecord::new(AlarmSource::Fod, 7_500, 9_000),
    ),
    FodRow::new(
        0,
        4_000,
        u32::MAX,
        Duration::from_secs(5),
        AlarmRecord::new(AlarmSource::Fod, 2_500, 5_000),
    ),
];
