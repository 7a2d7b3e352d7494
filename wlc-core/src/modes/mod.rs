//! Ranked power modes and the negotiator that picks among them.
//!
//! Modes are stored in increasing power order, so a mode's identifier is also
//! its rank. Selection scans from the top down and returns the first mode whose
//! gates pass. Gates are layered: the quick judge checks what the transmitter
//! and product can physically deliver, the normal judge adds cable and
//! authentication requirements, and the final judge adds live conditions
//! (arbitrated ceiling, battery temperature, mode timeout).

use core::fmt;
use core::time::Duration;

use heapless::Vec;

use crate::accessory::AccessoryCaps;
use crate::limits::PowerCeiling;

/// Rank of a mode within its table.
pub type ModeId = u8;

/// Upper bound on configured modes.
pub const MAX_MODES: usize = 8;

/// Transmitter voltage that requires explicit 12 V support.
pub const TWELVE_VOLT_MV: u32 = 12_000;

/// Cable classification reported by the transmitter.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum CableType {
    #[default]
    Unknown,
    Standard,
    HighPower,
}

impl CableType {
    pub const fn label(self) -> &'static str {
        match self {
            CableType::Unknown => "unknown",
            CableType::Standard => "standard",
            CableType::HighPower => "high-power",
        }
    }
}

/// Authentication state relevant to mode gating.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
pub enum AuthLevel {
    #[default]
    Unverified,
    Verified,
}

impl AuthLevel {
    pub const fn label(self) -> &'static str {
        match self {
            AuthLevel::Unverified => "unverified",
            AuthLevel::Verified => "verified",
        }
    }
}

/// Charging indicator class shown by UI collaborators.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
pub enum IconClass {
    #[default]
    Normal,
    Fast,
    SuperFast,
}

impl IconClass {
    pub const fn label(self) -> &'static str {
        match self {
            IconClass::Normal => "normal",
            IconClass::Fast => "fast",
            IconClass::SuperFast => "super-fast",
        }
    }

    pub const fn as_index(self) -> u8 {
        match self {
            IconClass::Normal => 0,
            IconClass::Fast => 1,
            IconClass::SuperFast => 2,
        }
    }

    pub const fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(IconClass::Normal),
            1 => Some(IconClass::Fast),
            2 => Some(IconClass::SuperFast),
            _ => None,
        }
    }
}

impl fmt::Display for IconClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Battery temperature window in tenths of a degree C, `[min, max)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct TempWindow {
    pub min_dc: Option<i16>,
    pub max_dc: Option<i16>,
}

impl TempWindow {
    pub const ANY: Self = Self {
        min_dc: None,
        max_dc: None,
    };

    /// Window that only bounds the upper end.
    pub const fn below(max_dc: i16) -> Self {
        Self {
            min_dc: None,
            max_dc: Some(max_dc),
        }
    }

    pub const fn contains(self, temp_dc: i16) -> bool {
        let above_min = match self.min_dc {
            Some(min) => temp_dc >= min,
            None => true,
        };
        let below_max = match self.max_dc {
            Some(max) => temp_dc < max,
            None => true,
        };
        above_min && below_max
    }
}

/// One ranked operating point.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PowerMode {
    pub id: ModeId,
    pub name: &'static str,
    pub vtx_min_mv: u32,
    pub itx_min_ma: u32,
    pub target: PowerCeiling,
    pub vrect_min_mv: u32,
    pub battery_temp: TempWindow,
    pub cable: Option<CableType>,
    pub auth: Option<AuthLevel>,
    pub icon: IconClass,
    /// Longest time the mode may stay selected outside the charging stage.
    pub timeout: Option<Duration>,
    /// Highest mode regulation may step to from this one.
    pub successor: Option<ModeId>,
    /// Hands regulation to the direct-charge path.
    pub direct_charge: bool,
}

impl PowerMode {
    pub const fn new(
        id: ModeId,
        name: &'static str,
        vtx_min_mv: u32,
        itx_min_ma: u32,
        target: PowerCeiling,
    ) -> Self {
        Self {
            id,
            name,
            vtx_min_mv,
            itx_min_ma,
            target,
            vrect_min_mv: 0,
            battery_temp: TempWindow::ANY,
            cable: None,
            auth: None,
            icon: IconClass::Normal,
            timeout: None,
            successor: None,
            direct_charge: false,
        }
    }

    #[must_use]
    pub const fn with_vrect_min(mut self, vrect_min_mv: u32) -> Self {
        self.vrect_min_mv = vrect_min_mv;
        self
    }

    #[must_use]
    pub const fn with_battery_temp(mut self, window: TempWindow) -> Self {
        self.battery_temp = window;
        self
    }

    #[must_use]
    pub const fn with_cable(mut self, cable: CableType) -> Self {
        self.cable = Some(cable);
        self
    }

    #[must_use]
    pub const fn with_auth(mut self, auth: AuthLevel) -> Self {
        self.auth = Some(auth);
        self
    }

    #[must_use]
    pub const fn with_icon(mut self, icon: IconClass) -> Self {
        self.icon = icon;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn with_successor(mut self, successor: ModeId) -> Self {
        self.successor = Some(successor);
        self
    }

    #[must_use]
    pub const fn direct_charge(mut self) -> Self {
        self.direct_charge = true;
        self
    }

    /// Rank key: delivered power in milliwatts at the target point.
    pub fn power_mw(&self) -> u64 {
        u64::from(self.target.vrx_mv) * u64::from(self.target.irx_ma) / 1000
    }

    /// Returns `true` when both modes share gates and operating point.
    fn same_rank_as(&self, other: &PowerMode) -> bool {
        self.vtx_min_mv == other.vtx_min_mv
            && self.itx_min_ma == other.itx_min_ma
            && self.target == other.target
            && self.vrect_min_mv == other.vrect_min_mv
            && self.battery_temp == other.battery_temp
            && self.cable == other.cable
            && self.auth == other.auth
            && self.direct_charge == other.direct_charge
    }
}

/// Product-level maxima independent of the coupled transmitter.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ProductLimits {
    pub max: PowerCeiling,
    /// Highest voltage the charger input tolerates after the charge pump.
    pub charger_vin_max_mv: u32,
}

impl ProductLimits {
    pub const fn new(max: PowerCeiling, charger_vin_max_mv: u32) -> Self {
        Self {
            max,
            charger_vin_max_mv,
        }
    }
}

/// Direction the negotiator may move relative to the current mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum Direction {
    #[default]
    Forward,
    /// Explicit downgrade path, used once the current mode became ineligible.
    Downgrade,
}

/// Inputs to one negotiation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ModeQuery {
    pub caps: AccessoryCaps,
    pub battery_temp_dc: i16,
    pub cable: CableType,
    pub auth: AuthLevel,
    pub current: Option<ModeId>,
    pub ceiling: PowerCeiling,
    pub cp_ratio: u8,
    pub direction: Direction,
    /// Caps the forward scan at the current mode's successor.
    pub successor_only: bool,
    /// The current mode outlived its timeout.
    pub current_expired: bool,
}

impl ModeQuery {
    pub const fn new(caps: AccessoryCaps) -> Self {
        Self {
            caps,
            battery_temp_dc: 250,
            cable: CableType::Unknown,
            auth: AuthLevel::Unverified,
            current: None,
            ceiling: PowerCeiling::UNCONSTRAINED,
            cp_ratio: 1,
            direction: Direction::Forward,
            successor_only: false,
            current_expired: false,
        }
    }

    #[must_use]
    pub const fn with_battery_temp(mut self, temp_dc: i16) -> Self {
        self.battery_temp_dc = temp_dc;
        self
    }

    #[must_use]
    pub const fn with_cable(mut self, cable: CableType) -> Self {
        self.cable = cable;
        self
    }

    #[must_use]
    pub const fn with_auth(mut self, auth: AuthLevel) -> Self {
        self.auth = auth;
        self
    }

    #[must_use]
    pub const fn with_current(mut self, current: Option<ModeId>) -> Self {
        self.current = current;
        self
    }

    #[must_use]
    pub const fn with_ceiling(mut self, ceiling: PowerCeiling) -> Self {
        self.ceiling = ceiling;
        self
    }

    #[must_use]
    pub const fn with_cp_ratio(mut self, cp_ratio: u8) -> Self {
        self.cp_ratio = cp_ratio;
        self
    }

    #[must_use]
    pub const fn downgrade(mut self) -> Self {
        self.direction = Direction::Downgrade;
        self
    }

    #[must_use]
    pub const fn successor_only(mut self) -> Self {
        self.successor_only = true;
        self
    }

    #[must_use]
    pub const fn current_expired(mut self, expired: bool) -> Self {
        self.current_expired = expired;
        self
    }
}

/// Negotiation result.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Selection {
    Mode { id: ModeId, setpoint: PowerCeiling },
    /// Nothing qualifies. Hold the present mode or fall back to the base mode.
    NoEligibleMode,
}

impl Selection {
    pub const fn mode_id(self) -> Option<ModeId> {
        match self {
            Selection::Mode { id, .. } => Some(id),
            Selection::NoEligibleMode => None,
        }
    }
}

/// Gate depth applied by [`ModeTable::passes`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Judge {
    Quick,
    Normal,
    Final,
}

/// Errors raised while populating a [`ModeTable`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ModeTableError {
    RegistryFull,
    /// The mode's id does not match its position in the table.
    IdMismatch { expected: ModeId, found: ModeId },
    /// The mode delivers less power than the one ranked below it.
    OutOfOrder { id: ModeId },
}

impl fmt::Display for ModeTableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Immutable per-session mode table plus product maxima.
#[derive(Clone, Debug)]
pub struct ModeTable {
    modes: Vec<PowerMode, MAX_MODES>,
    product: ProductLimits,
}

impl ModeTable {
    pub const fn new(product: ProductLimits) -> Self {
        Self {
            modes: Vec::new(),
            product,
        }
    }

    /// Appends `mode` as the next-higher rank.
    pub fn register(&mut self, mode: PowerMode) -> Result<(), ModeTableError> {
        let expected = ModeId::try_from(self.modes.len()).map_err(|_| ModeTableError::RegistryFull)?;
        if mode.id != expected {
            return Err(ModeTableError::IdMismatch {
                expected,
                found: mode.id,
            });
        }
        if self
            .modes
            .last()
            .is_some_and(|previous| previous.power_mw() > mode.power_mw())
        {
            return Err(ModeTableError::OutOfOrder { id: mode.id });
        }
        self.modes
            .push(mode)
            .map_err(|_| ModeTableError::RegistryFull)
    }

    pub fn get(&self, id: ModeId) -> Option<&PowerMode> {
        self.modes.get(usize::from(id))
    }

    pub fn product(&self) -> ProductLimits {
        self.product
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    pub fn iter(&self) -> core::slice::Iter<'_, PowerMode> {
        self.modes.iter()
    }

    /// Returns `true` when `mode` clears every gate up to `judge`.
    pub fn passes(&self, mode: &PowerMode, query: &ModeQuery, judge: Judge) -> bool {
        if !self.quick_judge(mode, query) {
            return false;
        }
        if judge >= Judge::Normal && !normal_judge(mode, query) {
            return false;
        }
        if judge >= Judge::Final && !self.final_judge(mode, query) {
            return false;
        }
        true
    }

    /// Returns `true` when mode `id` exists and clears every gate.
    pub fn is_eligible(&self, id: ModeId, query: &ModeQuery) -> bool {
        self.get(id)
            .is_some_and(|mode| self.passes(mode, query, Judge::Final))
    }

    /// Picks the operating point for `query`.
    pub fn select_mode(&self, query: &ModeQuery) -> Selection {
        let Some(top) = self.modes.len().checked_sub(1) else {
            return Selection::NoEligibleMode;
        };

        match (query.direction, query.current) {
            (Direction::Forward, Some(current)) => {
                let current = usize::from(current).min(top);
                let upper = if query.successor_only {
                    self.modes[current]
                        .successor
                        .map_or(top, |successor| usize::from(successor).min(top))
                        .max(current)
                } else {
                    top
                };
                self.scan(query, current, upper)
                    .map_or(Selection::NoEligibleMode, |index| {
                        self.selection_for(index, query)
                    })
            }
            (Direction::Forward, None) | (Direction::Downgrade, None) => self
                .scan(query, 0, top)
                .map_or(Selection::NoEligibleMode, |index| {
                    self.selection_for(index, query)
                }),
            (Direction::Downgrade, Some(current)) => {
                let current = usize::from(current).min(top + 1);
                match current.checked_sub(1) {
                    Some(upper) => self
                        .scan(query, 0, upper)
                        .map_or(Selection::NoEligibleMode, |index| {
                            self.selection_for(index, query)
                        }),
                    None => Selection::NoEligibleMode,
                }
            }
        }
    }

    /// Icon class of the best mode the transmitter and cable could reach.
    pub fn icon_class(&self, query: &ModeQuery) -> IconClass {
        self.modes
            .iter()
            .rev()
            .find(|mode| self.passes(mode, query, Judge::Normal))
            .map_or(IconClass::Normal, |mode| mode.icon)
    }

    /// Set-point for the lowest-ranked mode, clamped to `ceiling`.
    pub fn base_setpoint(&self, ceiling: PowerCeiling) -> Option<PowerCeiling> {
        self.modes
            .first()
            .map(|mode| self.clamp_setpoint(mode.target, ceiling))
    }

    fn scan(&self, query: &ModeQuery, lower: usize, upper: usize) -> Option<usize> {
        let found = (lower..=upper)
            .rev()
            .find(|&index| self.passes(&self.modes[index], query, Judge::Final))?;

        // Among identically configured neighbours, the earlier entry wins.
        let mut chosen = found;
        while chosen > lower {
            let below = &self.modes[chosen - 1];
            if below.same_rank_as(&self.modes[found]) && self.passes(below, query, Judge::Final) {
                chosen -= 1;
            } else {
                break;
            }
        }
        Some(chosen)
    }

    fn selection_for(&self, index: usize, query: &ModeQuery) -> Selection {
        let mode = &self.modes[index];
        Selection::Mode {
            id: mode.id,
            setpoint: self.clamp_setpoint(mode.target, query.ceiling),
        }
    }

    fn clamp_setpoint(&self, target: PowerCeiling, ceiling: PowerCeiling) -> PowerCeiling {
        target.clamp_to(ceiling).clamp_to(self.product.max)
    }

    fn quick_judge(&self, mode: &PowerMode, query: &ModeQuery) -> bool {
        let caps = query.caps;
        if caps.vmax_mv < mode.vtx_min_mv {
            return false;
        }
        if !mode.target.fits_within(self.product.max) {
            return false;
        }
        let available = u64::from(caps.vmax_mv) * u64::from(caps.imax_ma);
        let required = u64::from(mode.vtx_min_mv) * u64::from(mode.itx_min_ma);
        available >= required
    }

    fn final_judge(&self, mode: &PowerMode, query: &ModeQuery) -> bool {
        if mode.target.vtx_mv >= TWELVE_VOLT_MV && !query.caps.support_12v {
            return false;
        }
        if query.ceiling.vtx_mv < mode.target.vtx_mv || query.ceiling.vrx_mv < mode.target.vrx_mv {
            return false;
        }
        let Some(charger_vin) = mode.target.vtx_mv.checked_div(u32::from(query.cp_ratio)) else {
            return false;
        };
        if charger_vin > self.product.charger_vin_max_mv {
            return false;
        }
        if !mode.battery_temp.contains(query.battery_temp_dc) {
            return false;
        }
        !(query.current_expired && query.current == Some(mode.id))
    }
}

fn normal_judge(mode: &PowerMode, query: &ModeQuery) -> bool {
    if let Some(cable) = mode.cable {
        if cable != query.cable {
            return false;
        }
    }
    match mode.auth {
        Some(required) => query.auth >= required,
        None => true,
    }
}

/// Product maxima of the reference design.
pub const DEFAULT_PRODUCT: ProductLimits =
    ProductLimits::new(PowerCeiling::new(15_000, 15_000, 2_000), 10_000);

/// Reference mode ladder: 5 W base, 10 W fast, 15 W cable-gated, 27 W direct charge.
pub const DEFAULT_MODES: [PowerMode; 4] = [
    PowerMode::new(0, "5w", 5_000, 1_000, PowerCeiling::new(5_000, 5_500, 1_000))
        .with_vrect_min(4_500),
    PowerMode::new(1, "10w", 9_000, 1_250, PowerCeiling::new(9_000, 9_900, 1_100))
        .with_vrect_min(8_500)
        .with_battery_temp(TempWindow::below(450))
        .with_icon(IconClass::Fast)
        .with_successor(2),
    PowerMode::new(2, "15w", 9_000, 2_000, PowerCeiling::new(9_000, 9_900, 1_600))
        .with_vrect_min(8_500)
        .with_battery_temp(TempWindow::below(420))
        .with_cable(CableType::HighPower)
        .with_auth(AuthLevel::Verified)
        .with_icon(IconClass::SuperFast)
        .with_successor(3),
    PowerMode::new(3, "27w-dc", 15_000, 2_000, PowerCeiling::new(15_000, 15_000, 1_800))
        .with_vrect_min(14_000)
        .with_battery_temp(TempWindow::below(400))
        .with_cable(CableType::HighPower)
        .with_auth(AuthLevel::Verified)
        .with_icon(IconClass::SuperFast)
        .with_timeout(Duration::from_secs(60))
        .direct_charge(),
];

/// Builds a [`ModeTable`] from [`DEFAULT_MODES`].
pub fn default_mode_table() -> ModeTable {
    let mut table = ModeTable::new(DEFAULT_PRODUCT);
    for mode in DEFAULT_MODES {
        // DEFAULT_MODES is ranked and shorter than MAX_MODES.
        let _ = table.register(mode);
    }
    table
}
