use core::time::Duration;

use wlc_core::accessory::{AccessoryCaps, AdapterType};
use wlc_core::limits::PowerCeiling;
use wlc_core::modes::{
    AuthLevel, CableType, ModeQuery, ModeTable, PowerMode, ProductLimits, Selection,
    default_mode_table,
};

fn ladder() -> ModeTable {
    let mut table = ModeTable::new(ProductLimits::new(
        PowerCeiling::new(12_000, 12_000, 2_000),
        12_000,
    ));
    for mode in [
        PowerMode::new(0, "5w", 5_000, 1_000, PowerCeiling::new(5_000, 5_500, 1_000)),
        PowerMode::new(1, "10w", 9_000, 1_100, PowerCeiling::new(9_000, 9_900, 1_100)),
        PowerMode::new(2, "15w", 9_000, 1_700, PowerCeiling::new(9_000, 9_900, 1_700)),
    ] {
        table.register(mode).expect("ladder is ranked");
    }
    table
}

fn capable() -> AccessoryCaps {
    AccessoryCaps::new(AdapterType::Pd, 9_000, 2_000)
}

#[test]
fn moves_forward_from_ten_to_fifteen_watts() {
    let table = ladder();
    let query = ModeQuery::new(capable()).with_current(Some(1));

    assert_eq!(table.select_mode(&query).mode_id(), Some(2));
}

#[test]
fn forward_selection_never_drops_below_current() {
    let table = ladder();
    // Only the base mode passes for a weak DCP; without the downgrade signal it is out of reach.
    let weak = AccessoryCaps::new(AdapterType::Dcp, 5_000, 1_000);
    assert_eq!(table.select_mode(&ModeQuery::new(weak)).mode_id(), Some(0));

    let query = ModeQuery::new(weak).with_current(Some(1));
    assert_eq!(table.select_mode(&query), Selection::NoEligibleMode);
    assert_eq!(table.select_mode(&query.downgrade()).mode_id(), Some(0));
}

#[test]
fn forward_selection_reports_no_mode_for_zero_ratio() {
    let table = ladder();
    let query = ModeQuery::new(capable()).with_current(Some(1)).with_cp_ratio(0);
    assert!(!table.is_eligible(1, &query));
    assert_eq!(table.select_mode(&query), Selection::NoEligibleMode);
}

#[test]
fn downgrade_signal_allows_lower_modes() {
    let table = ladder();
    let query = ModeQuery::new(capable())
        .with_current(Some(2))
        .with_ceiling(PowerCeiling::new(5_000, 5_500, 1_000))
        .downgrade();

    match table.select_mode(&query) {
        Selection::Mode { id, setpoint } => {
            assert_eq!(id, 0);
            assert_eq!(setpoint, PowerCeiling::new(5_000, 5_500, 1_000));
        }
        other => panic!("unexpected selection: {other:?}"),
    }
}

#[test]
fn identical_entries_resolve_to_the_earlier_one() {
    let mut table = ModeTable::new(ProductLimits::new(
        PowerCeiling::new(12_000, 12_000, 2_000),
        12_000,
    ));
    let target = PowerCeiling::new(9_000, 9_900, 1_100);
    table
        .register(PowerMode::new(0, "a", 9_000, 1_100, target))
        .expect("first");
    table
        .register(PowerMode::new(1, "b", 9_000, 1_100, target))
        .expect("second");

    let query = ModeQuery::new(capable());
    assert_eq!(table.select_mode(&query).mode_id(), Some(0));
}

#[test]
fn zero_charge_pump_ratio_makes_every_mode_ineligible() {
    let table = ladder();
    let query = ModeQuery::new(capable()).with_cp_ratio(0);

    assert_eq!(table.select_mode(&query), Selection::NoEligibleMode);
}

#[test]
fn empty_table_has_no_eligible_mode() {
    let table = ModeTable::new(ProductLimits::new(PowerCeiling::UNCONSTRAINED, u32::MAX));
    assert_eq!(
        table.select_mode(&ModeQuery::new(capable())),
        Selection::NoEligibleMode
    );
}

#[test]
fn default_ladder_respects_cable_and_auth_gates() {
    let table = default_mode_table();
    let caps = AccessoryCaps::new(AdapterType::Pd, 9_000, 2_000);

    let plain = ModeQuery::new(caps);
    assert_eq!(table.select_mode(&plain).mode_id(), Some(1));

    let gated = ModeQuery::new(caps)
        .with_cable(CableType::HighPower)
        .with_auth(AuthLevel::Verified);
    assert_eq!(table.select_mode(&gated).mode_id(), Some(2));

    let hot = gated.with_battery_temp(430);
    assert_eq!(table.select_mode(&hot).mode_id(), Some(1));
}

#[test]
fn expired_direct_charge_mode_is_left() {
    let table = default_mode_table();
    let caps = AccessoryCaps::new(AdapterType::Pd, 15_000, 2_000).with_12v(true);
    let query = ModeQuery::new(caps)
        .with_cable(CableType::HighPower)
        .with_auth(AuthLevel::Verified)
        .with_cp_ratio(2);
    assert_eq!(table.select_mode(&query).mode_id(), Some(3));

    let mode = table.get(3).expect("direct-charge mode");
    assert_eq!(mode.timeout, Some(Duration::from_secs(60)));

    let expired = query.with_current(Some(3)).current_expired(true);
    assert!(!table.is_eligible(3, &expired));
    assert_eq!(table.select_mode(&expired.downgrade()).mode_id(), Some(2));
}
