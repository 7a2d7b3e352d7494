//! Charging stage catalog and the lock-free tracker every component reads.
//!
//! The tracker is written by the stage sequencer and read by monitors, the
//! console, and UI collaborators. A single `AtomicU8` with sequentially
//! consistent ordering guarantees readers never observe a torn value.

use core::fmt;

use portable_atomic::{AtomicU8, Ordering};

/// Phases of an RX charging session, in the order the sequencer walks them.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
pub enum ChargeStage {
    #[default]
    Default,
    Handshake,
    CapabilityQuery,
    CableDetect,
    Authenticate,
    FirmwareUpdate,
    Charging,
    Regulation,
    RegulationDc,
}

/// Number of defined stages.
pub const STAGE_COUNT: usize = 9;

/// Every stage in sequencing order.
pub const ALL_STAGES: [ChargeStage; STAGE_COUNT] = [
    ChargeStage::Default,
    ChargeStage::Handshake,
    ChargeStage::CapabilityQuery,
    ChargeStage::CableDetect,
    ChargeStage::Authenticate,
    ChargeStage::FirmwareUpdate,
    ChargeStage::Charging,
    ChargeStage::Regulation,
    ChargeStage::RegulationDc,
];

impl ChargeStage {
    /// Deterministic index used for the atomic encoding.
    pub const fn as_index(self) -> u8 {
        match self {
            ChargeStage::Default => 0,
            ChargeStage::Handshake => 1,
            ChargeStage::CapabilityQuery => 2,
            ChargeStage::CableDetect => 3,
            ChargeStage::Authenticate => 4,
            ChargeStage::FirmwareUpdate => 5,
            ChargeStage::Charging => 6,
            ChargeStage::Regulation => 7,
            ChargeStage::RegulationDc => 8,
        }
    }

    /// Attempts to construct a [`ChargeStage`] from a raw index.
    pub const fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(ChargeStage::Default),
            1 => Some(ChargeStage::Handshake),
            2 => Some(ChargeStage::CapabilityQuery),
            3 => Some(ChargeStage::CableDetect),
            4 => Some(ChargeStage::Authenticate),
            5 => Some(ChargeStage::FirmwareUpdate),
            6 => Some(ChargeStage::Charging),
            7 => Some(ChargeStage::Regulation),
            8 => Some(ChargeStage::RegulationDc),
            _ => None,
        }
    }

    /// Short label used by logs and the console.
    pub const fn label(self) -> &'static str {
        match self {
            ChargeStage::Default => "default",
            ChargeStage::Handshake => "handshake",
            ChargeStage::CapabilityQuery => "capability-query",
            ChargeStage::CableDetect => "cable-detect",
            ChargeStage::Authenticate => "authenticate",
            ChargeStage::FirmwareUpdate => "firmware-update",
            ChargeStage::Charging => "charging",
            ChargeStage::Regulation => "regulation",
            ChargeStage::RegulationDc => "regulation-dc",
        }
    }

    /// Returns `true` once power delivery has started.
    pub const fn is_charging(self) -> bool {
        matches!(
            self,
            ChargeStage::Charging | ChargeStage::Regulation | ChargeStage::RegulationDc
        )
    }
}

impl fmt::Display for ChargeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Process-visible record of the current stage for one session.
#[derive(Debug)]
pub struct StageTracker {
    current: AtomicU8,
}

impl StageTracker {
    /// Creates a tracker parked at [`ChargeStage::Default`].
    pub const fn new() -> Self {
        Self {
            current: AtomicU8::new(ChargeStage::Default.as_index()),
        }
    }

    /// Records `stage` as the current stage.
    pub fn set_stage(&self, stage: ChargeStage) {
        self.current.store(stage.as_index(), Ordering::SeqCst);
    }

    /// Records a raw stage index. Values outside the catalog are ignored.
    ///
    /// Returns `true` when the value was accepted.
    pub fn set_raw(&self, raw: u8) -> bool {
        match ChargeStage::from_index(raw) {
            Some(stage) => {
                self.set_stage(stage);
                true
            }
            None => false,
        }
    }

    /// Returns the last recorded stage.
    pub fn stage(&self) -> ChargeStage {
        // Only `set_stage` writes, so the stored index is always valid.
        ChargeStage::from_index(self.current.load(Ordering::SeqCst)).unwrap_or_default()
    }

    /// Returns to [`ChargeStage::Default`], as on disconnect.
    pub fn reset(&self) {
        self.set_stage(ChargeStage::Default);
    }
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}
