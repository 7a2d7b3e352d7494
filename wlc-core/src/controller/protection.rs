//! Receive-side battery protection: thermal bands drive the thermal limit.

use crate::alarm::{AlarmRecord, ThermalBand, ThermalClassifier};
use crate::limits::{PowerLimitArbitrator, PowerLimitSource};

/// Result of one protection sample.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ProtectionVerdict {
    /// Alarm of the band in force, clear when no band applies.
    pub record: AlarmRecord,
    /// The band changed on this sample.
    pub band_changed: bool,
    /// The thermal limit was asserted or released on this sample.
    pub limit_changed: bool,
}

#[derive(Clone, Debug)]
pub struct ProtectionMonitor {
    classifier: ThermalClassifier,
}

impl ProtectionMonitor {
    pub fn new(bands: &[ThermalBand]) -> Self {
        Self {
            classifier: ThermalClassifier::new(bands),
        }
    }

    pub fn reset(&mut self) {
        self.classifier.reset();
    }

    pub fn record(&self) -> AlarmRecord {
        self.classifier.record()
    }

    /// Classifies `battery_temp_dc` and mirrors the band onto the thermal source.
    pub fn check(
        &mut self,
        battery_temp_dc: i16,
        limits: &mut PowerLimitArbitrator,
    ) -> ProtectionVerdict {
        let reading = self.classifier.classify(battery_temp_dc);
        let record = self.classifier.record();
        let limit_changed = if record.is_clear() {
            limits.clear_source(PowerLimitSource::Thermal)
        } else {
            limits.set_source(PowerLimitSource::Thermal)
        };
        ProtectionVerdict {
            record,
            band_changed: reading.changed,
            limit_changed,
        }
    }
}
