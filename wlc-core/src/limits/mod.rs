//! Power-limit arbitration.
//!
//! Independent monitors assert and clear limiting causes. The arbitrator folds
//! the ceilings of every asserted cause into one conservative
//! (TX voltage, RX voltage, RX current) triple that the negotiator must honor.

use core::fmt;

use heapless::Vec;

/// Causes that may restrict delivered power.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PowerLimitSource {
    Otg,
    Rpp,
    Thermal,
    Fan,
    VoutErr,
    TxAlarm,
    TxBoostErr,
    Keyboard,
    Other,
}

/// Number of defined limit sources.
pub const SOURCE_COUNT: usize = 9;

/// Every limit source in index order.
pub const ALL_SOURCES: [PowerLimitSource; SOURCE_COUNT] = [
    PowerLimitSource::Otg,
    PowerLimitSource::Rpp,
    PowerLimitSource::Thermal,
    PowerLimitSource::Fan,
    PowerLimitSource::VoutErr,
    PowerLimitSource::TxAlarm,
    PowerLimitSource::TxBoostErr,
    PowerLimitSource::Keyboard,
    PowerLimitSource::Other,
];

impl PowerLimitSource {
    /// Deterministic bit index for [`SourceSet`].
    pub const fn as_index(self) -> u8 {
        match self {
            PowerLimitSource::Otg => 0,
            PowerLimitSource::Rpp => 1,
            PowerLimitSource::Thermal => 2,
            PowerLimitSource::Fan => 3,
            PowerLimitSource::VoutErr => 4,
            PowerLimitSource::TxAlarm => 5,
            PowerLimitSource::TxBoostErr => 6,
            PowerLimitSource::Keyboard => 7,
            PowerLimitSource::Other => 8,
        }
    }

    /// Attempts to construct a [`PowerLimitSource`] from a raw index.
    pub const fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(PowerLimitSource::Otg),
            1 => Some(PowerLimitSource::Rpp),
            2 => Some(PowerLimitSource::Thermal),
            3 => Some(PowerLimitSource::Fan),
            4 => Some(PowerLimitSource::VoutErr),
            5 => Some(PowerLimitSource::TxAlarm),
            6 => Some(PowerLimitSource::TxBoostErr),
            7 => Some(PowerLimitSource::Keyboard),
            8 => Some(PowerLimitSource::Other),
            _ => None,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            PowerLimitSource::Otg => "otg",
            PowerLimitSource::Rpp => "rpp",
            PowerLimitSource::Thermal => "thermal",
            PowerLimitSource::Fan => "fan",
            PowerLimitSource::VoutErr => "vout-err",
            PowerLimitSource::TxAlarm => "tx-alarm",
            PowerLimitSource::TxBoostErr => "tx-boost-err",
            PowerLimitSource::Keyboard => "keyboard",
            PowerLimitSource::Other => "other",
        }
    }

    /// Case-insensitive lookup by label.
    pub fn from_label(label: &str) -> Option<Self> {
        ALL_SOURCES
            .iter()
            .copied()
            .find(|source| source.label().eq_ignore_ascii_case(label))
    }

    const fn bit(self) -> u16 {
        1 << self.as_index()
    }
}

impl fmt::Display for PowerLimitSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Voltage/current triple used both as a ceiling and as a set-point.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PowerCeiling {
    pub vtx_mv: u32,
    pub vrx_mv: u32,
    pub irx_ma: u32,
}

impl PowerCeiling {
    /// Ceiling that constrains nothing.
    pub const UNCONSTRAINED: Self = Self::new(u32::MAX, u32::MAX, u32::MAX);

    pub const fn new(vtx_mv: u32, vrx_mv: u32, irx_ma: u32) -> Self {
        Self {
            vtx_mv,
            vrx_mv,
            irx_ma,
        }
    }

    /// Element-wise minimum of `self` and `other`.
    #[must_use]
    pub const fn clamp_to(self, other: Self) -> Self {
        Self {
            vtx_mv: min_u32(self.vtx_mv, other.vtx_mv),
            vrx_mv: min_u32(self.vrx_mv, other.vrx_mv),
            irx_ma: min_u32(self.irx_ma, other.irx_ma),
        }
    }

    /// Returns `true` when every field of `self` fits within `limit`.
    pub const fn fits_within(self, limit: Self) -> bool {
        self.vtx_mv <= limit.vtx_mv && self.vrx_mv <= limit.vrx_mv && self.irx_ma <= limit.irx_ma
    }

    /// Returns `true` when no field is constrained.
    pub const fn is_unconstrained(self) -> bool {
        self.vtx_mv == u32::MAX && self.vrx_mv == u32::MAX && self.irx_ma == u32::MAX
    }
}

const fn min_u32(a: u32, b: u32) -> u32 {
    if a < b { a } else { b }
}

/// Compact bitset of asserted limit sources.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct SourceSet(u16);

impl SourceSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bitmask, one bit per [`PowerLimitSource::as_index`].
    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, source: PowerLimitSource) -> bool {
        self.0 & source.bit() != 0
    }

    /// Adds `source`, returning `true` when the set changed.
    pub fn insert(&mut self, source: PowerLimitSource) -> bool {
        let before = self.0;
        self.0 |= source.bit();
        before != self.0
    }

    /// Removes `source`, returning `true` when the set changed.
    pub fn remove(&mut self, source: PowerLimitSource) -> bool {
        let before = self.0;
        self.0 &= !source.bit();
        before != self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterates the asserted sources in index order.
    pub fn iter(self) -> impl Iterator<Item = PowerLimitSource> {
        ALL_SOURCES
            .into_iter()
            .filter(move |source| self.contains(*source))
    }
}

/// Configured ceiling and persistence policy for one source.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LimitEntry {
    pub source: PowerLimitSource,
    pub ceiling: PowerCeiling,
    /// Cleared when a recharge cycle begins.
    pub need_reset: bool,
}

impl LimitEntry {
    pub const fn new(source: PowerLimitSource, ceiling: PowerCeiling, need_reset: bool) -> Self {
        Self {
            source,
            ceiling,
            need_reset,
        }
    }
}

/// Errors raised while populating a [`LimitTable`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LimitTableError {
    RegistryFull,
}

impl fmt::Display for LimitTableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Per-source ceiling table loaded once per session.
#[derive(Clone, Debug, Default)]
pub struct LimitTable {
    entries: Vec<LimitEntry, SOURCE_COUNT>,
}

impl LimitTable {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registers (or replaces) the entry for `entry.source`.
    pub fn register(&mut self, entry: LimitEntry) -> Result<(), LimitTableError> {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|existing| existing.source == entry.source)
        {
            *existing = entry;
            Ok(())
        } else {
            self.entries
                .push(entry)
                .map_err(|_| LimitTableError::RegistryFull)
        }
    }

    pub fn get(&self, source: PowerLimitSource) -> Option<&LimitEntry> {
        self.entries.iter().find(|entry| entry.source == source)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> core::slice::Iter<'_, LimitEntry> {
        self.entries.iter()
    }
}

/// Built-in source table used when the device description supplies none.
pub const DEFAULT_LIMITS: [LimitEntry; 8] = [
    LimitEntry::new(
        PowerLimitSource::Otg,
        PowerCeiling::new(5000, 5500, 1000),
        false,
    ),
    LimitEntry::new(
        PowerLimitSource::Rpp,
        PowerCeiling::new(12000, 12000, 1300),
        true,
    ),
    LimitEntry::new(
        PowerLimitSource::Thermal,
        PowerCeiling::new(9000, 9900, 1250),
        true,
    ),
    LimitEntry::new(
        PowerLimitSource::Fan,
        PowerCeiling::new(9000, 9900, 1250),
        true,
    ),
    LimitEntry::new(
        PowerLimitSource::VoutErr,
        PowerCeiling::new(9000, 9900, 1250),
        true,
    ),
    LimitEntry::new(
        PowerLimitSource::TxAlarm,
        PowerCeiling::new(9000, 9900, 1100),
        true,
    ),
    LimitEntry::new(
        PowerLimitSource::TxBoostErr,
        PowerCeiling::new(5000, 5500, 1000),
        true,
    ),
    LimitEntry::new(
        PowerLimitSource::Keyboard,
        PowerCeiling::new(5000, 5500, 1000),
        false,
    ),
];

/// Builds a [`LimitTable`] from [`DEFAULT_LIMITS`].
pub fn default_limit_table() -> LimitTable {
    let mut table = LimitTable::new();
    for entry in DEFAULT_LIMITS {
        // DEFAULT_LIMITS is shorter than the table capacity.
        let _ = table.register(entry);
    }
    table
}

/// Tracks asserted sources and folds their ceilings.
///
/// Without a loaded table every mutation is a no-op and every query returns
/// the candidate unchanged.
#[derive(Clone, Debug, Default)]
pub struct PowerLimitArbitrator {
    table: Option<LimitTable>,
    active: SourceSet,
}

impl PowerLimitArbitrator {
    /// Creates an arbitrator with no table loaded.
    pub const fn new() -> Self {
        Self {
            table: None,
            active: SourceSet::empty(),
        }
    }

    /// Creates an arbitrator backed by `table`.
    pub const fn with_table(table: LimitTable) -> Self {
        Self {
            table: Some(table),
            active: SourceSet::empty(),
        }
    }

    /// Installs `table`, keeping the asserted set.
    pub fn load_table(&mut self, table: LimitTable) {
        self.table = Some(table);
    }

    /// Drops the table and every asserted source.
    pub fn unload_table(&mut self) {
        self.table = None;
        self.active = SourceSet::empty();
    }

    pub fn has_table(&self) -> bool {
        self.table.is_some()
    }

    pub fn table(&self) -> Option<&LimitTable> {
        self.table.as_ref()
    }

    /// Asserts `source`. Returns `true` when the asserted set changed.
    pub fn set_source(&mut self, source: PowerLimitSource) -> bool {
        if self.table.is_none() {
            return false;
        }
        self.active.insert(source)
    }

    /// Clears `source`. Returns `true` when the asserted set changed.
    pub fn clear_source(&mut self, source: PowerLimitSource) -> bool {
        if self.table.is_none() {
            return false;
        }
        self.active.remove(source)
    }

    /// Asserts a source by raw index, ignoring ids outside the catalog.
    pub fn set_raw(&mut self, raw: u8) -> bool {
        PowerLimitSource::from_index(raw).is_some_and(|source| self.set_source(source))
    }

    /// Clears a source by raw index, ignoring ids outside the catalog.
    pub fn clear_raw(&mut self, raw: u8) -> bool {
        PowerLimitSource::from_index(raw).is_some_and(|source| self.clear_source(source))
    }

    pub fn is_set(&self, source: PowerLimitSource) -> bool {
        self.active.contains(source)
    }

    pub fn active(&self) -> SourceSet {
        self.active
    }

    /// Clears every asserted source whose entry is flagged `need_reset`.
    ///
    /// Sources without an entry are treated as persistent. Returns the set of
    /// sources that were cleared.
    pub fn reset(&mut self) -> SourceSet {
        let Some(table) = self.table.as_ref() else {
            return SourceSet::empty();
        };

        let mut cleared = SourceSet::empty();
        for source in self.active.iter() {
            if table.get(source).is_some_and(|entry| entry.need_reset) {
                cleared.insert(source);
            }
        }
        for source in cleared.iter() {
            self.active.remove(source);
        }
        cleared
    }

    /// Clamps `candidate` to the ceilings of every asserted source.
    pub fn update_ceiling(&self, candidate: PowerCeiling) -> PowerCeiling {
        let Some(table) = self.table.as_ref() else {
            return candidate;
        };

        self.active
            .iter()
            .filter_map(|source| table.get(source))
            .fold(candidate, |acc, entry| acc.clamp_to(entry.ceiling))
    }

    /// Effective ceiling with no candidate constraint.
    pub fn ceiling(&self) -> PowerCeiling {
        self.update_ceiling(PowerCeiling::UNCONSTRAINED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arbitrator() -> PowerLimitArbitrator {
        PowerLimitArbitrator::with_table(default_limit_table())
    }

    #[test]
    fn set_and_clear_are_idempotent() {
        let mut arb = arbitrator();
        assert!(arb.set_source(PowerLimitSource::Fan));
        assert!(!arb.set_source(PowerLimitSource::Fan));
        assert_eq!(arb.active().len(), 1);

        assert!(arb.clear_source(PowerLimitSource::Fan));
        assert!(!arb.clear_source(PowerLimitSource::Fan));
        assert!(arb.active().is_empty());
    }

    #[test]
    fn raw_ids_outside_catalog_are_rejected() {
        let mut arb = arbitrator();
        assert!(!arb.set_raw(200));
        assert!(arb.active().is_empty());
        assert!(arb.set_raw(PowerLimitSource::Thermal.as_index()));
        assert!(arb.is_set(PowerLimitSource::Thermal));
    }

    #[test]
    fn unconstrained_when_nothing_asserted() {
        let arb = arbitrator();
        assert!(arb.ceiling().is_unconstrained());
    }

    #[test]
    fn reset_only_clears_resettable_sources() {
        let mut arb = arbitrator();
        arb.set_source(PowerLimitSource::Otg);
        arb.set_source(PowerLimitSource::Thermal);
        arb.set_source(PowerLimitSource::Other);

        let cleared = arb.reset();

        assert!(cleared.contains(PowerLimitSource::Thermal));
        assert!(arb.is_set(PowerLimitSource::Otg));
        assert!(arb.is_set(PowerLimitSource::Other), "no entry means persistent");
        assert!(!arb.is_set(PowerLimitSource::Thermal));
    }

    #[test]
    fn missing_table_is_permissive() {
        let mut arb = PowerLimitArbitrator::new();
        assert!(!arb.set_source(PowerLimitSource::Otg));
        let candidate = PowerCeiling::new(9000, 9000, 1200);
        assert_eq!(arb.update_ceiling(candidate), candidate);
        assert!(arb.reset().is_empty());
    }

    #[test]
    fn candidate_clamped_per_field() {
        let mut arb = arbitrator();
        arb.set_source(PowerLimitSource::Thermal);
        let clamped = arb.update_ceiling(PowerCeiling::new(12000, 9000, 2000));
        assert_eq!(clamped, PowerCeiling::new(9000, 9000, 1250));
    }

    #[test]
    fn labels_resolve_case_insensitively() {
        assert_eq!(
            PowerLimitSource::from_label("Thermal"),
            Some(PowerLimitSource::Thermal)
        );
        assert_eq!(PowerLimitSource::from_label("bogus"), None);
    }
}
