//! Temperature band classification with hysteresis.
//!
//! Bands are ordered from cool to hot. Entering a band happens as soon as the
//! reading reaches its lower bound; leaving it toward a cooler band requires
//! the reading to fall `back_dc` below that bound.

use heapless::Vec;

use super::{AlarmRecord, AlarmSource};

/// Upper bound on configured bands.
pub const MAX_THERMAL_BANDS: usize = 4;

/// One temperature band in tenths of a degree C, `[low_dc, high_dc)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ThermalBand {
    pub low_dc: i16,
    pub high_dc: i16,
    pub back_dc: i16,
    pub alarm: AlarmRecord,
}

impl ThermalBand {
    pub const fn new(low_dc: i16, high_dc: i16, back_dc: i16, alarm: AlarmRecord) -> Self {
        Self {
            low_dc,
            high_dc,
            back_dc,
            alarm,
        }
    }

    pub const fn contains(&self, temp_dc: i16) -> bool {
        temp_dc >= self.low_dc && temp_dc < self.high_dc
    }

    /// Lowest reading that still keeps an active band selected.
    pub const fn release_dc(&self) -> i16 {
        self.low_dc.saturating_sub(self.back_dc)
    }
}

/// Outcome of one classification.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BandReading {
    pub band: Option<usize>,
    pub changed: bool,
}

/// Stateful band tracker.
#[derive(Clone, Debug)]
pub struct ThermalClassifier {
    bands: Vec<ThermalBand, MAX_THERMAL_BANDS>,
    current: Option<usize>,
    primed: bool,
}

impl ThermalClassifier {
    pub fn new(bands: &[ThermalBand]) -> Self {
        let mut table = Vec::new();
        for band in bands.iter().take(MAX_THERMAL_BANDS) {
            // `take` bounds the iterator to the table capacity.
            let _ = table.push(*band);
        }
        Self {
            bands: table,
            current: None,
            primed: false,
        }
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Alarm for the current band, or [`AlarmRecord::CLEAR`] outside every band.
    pub fn record(&self) -> AlarmRecord {
        self.current
            .and_then(|index| self.bands.get(index))
            .map_or(AlarmRecord::CLEAR, |band| band.alarm)
    }

    /// Forgets history so the next sample is treated as the first.
    pub fn reset(&mut self) {
        self.current = None;
        self.primed = false;
    }

    /// Classifies `temp_dc`.
    ///
    /// The first sample after creation or [`reset`](Self::reset) selects the
    /// containing band directly, without hysteresis.
    pub fn classify(&mut self, temp_dc: i16) -> BandReading {
        let next = if self.primed {
            self.next_band(temp_dc)
        } else {
            self.primed = true;
            self.containing(temp_dc)
        };

        let changed = next != self.current;
        self.current = next;
        BandReading {
            band: next,
            changed,
        }
    }

    fn next_band(&self, temp_dc: i16) -> Option<usize> {
        let Some(index) = self.current else {
            return self.containing(temp_dc);
        };
        let Some(band) = self.bands.get(index) else {
            return self.containing(temp_dc);
        };

        if temp_dc >= band.high_dc {
            self.containing(temp_dc)
        } else if temp_dc >= band.release_dc() {
            Some(index)
        } else {
            self.containing(temp_dc)
        }
    }

    fn containing(&self, temp_dc: i16) -> Option<usize> {
        self.bands.iter().position(|band| band.contains(temp_dc))
    }
}

/// Reference battery bands for reverse charging.
pub const DEFAULT_TX_BATTERY_BANDS: [ThermalBand; 2] = [
    ThermalBand::new(
        400,
        450,
        20,
        AlarmRecord::new(AlarmSource::Temperature, 5_000, 9_000),
    ),
    ThermalBand::new(
        450,
        i16::MAX,
        20,
        AlarmRecord::new(AlarmSource::Temperature, 2_500, 5_000),
    ),
];

/// Reference receive-side battery band; being inside it asserts the thermal
/// power limit.
pub const DEFAULT_RX_THERMAL_BANDS: [ThermalBand; 1] = [ThermalBand::new(
    430,
    i16::MAX,
    30,
    AlarmRecord::new(AlarmSource::Temperature, 10_000, 9_000),
)];
