use super::*;

use crate::accessory::{AccessoryCaps, AdapterType, TX_ID_EXPECTED};
use crate::alarm::{AlarmFrame, AlarmSource};
use crate::auth::{HASH_LEN, NONCE_LEN};
use crate::hal::HalError;
use crate::limits::default_limit_table;
use crate::modes::{CableType, default_mode_table};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct MockInstant(u64);

impl TelemetryInstant for MockInstant {
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

struct MockHardware {
    tx_id: Result<u16, HalError>,
    caps: AccessoryCaps,
    sample: TelemetrySample,
    applied: heapless::Vec<PowerCeiling, 16>,
    enabled: bool,
    tx_alarm: Option<AlarmFrame>,
}

impl MockHardware {
    fn new() -> Self {
        Self {
            tx_id: Ok(TX_ID_EXPECTED),
            caps: AccessoryCaps::new(AdapterType::Pd, 9_000, 2_000)
                .with_cable_detect(true)
                .with_auth(true),
            sample: TelemetrySample {
                vrect_mv: 9_200,
                vout_mv: 9_900,
                iout_ma: 1_200,
                ic_temp_dc: 400,
                battery_temp_dc: 250,
            },
            applied: heapless::Vec::new(),
            enabled: false,
            tx_alarm: None,
        }
    }
}

impl TelemetrySource for MockHardware {
    fn sample(&mut self) -> Result<TelemetrySample, HalError> {
        Ok(self.sample)
    }
}

impl PowerOutput for MockHardware {
    fn apply_setpoint(&mut self, setpoint: PowerCeiling) -> Result<(), HalError> {
        self.applied.push(setpoint).map_err(|_| HalError::Unavailable)
    }

    fn set_output_enabled(&mut self, enabled: bool) -> Result<(), HalError> {
        self.enabled = enabled;
        Ok(())
    }
}

impl AccessoryLink for MockHardware {
    fn tx_id(&mut self) -> Result<u16, HalError> {
        self.tx_id
    }

    fn capabilities(&mut self) -> Result<AccessoryCaps, HalError> {
        Ok(self.caps)
    }

    fn cable_type(&mut self) -> Result<CableType, HalError> {
        Ok(CableType::HighPower)
    }

    fn challenge(&mut self, nonce: &[u8; NONCE_LEN]) -> Result<[u8; HASH_LEN], HalError> {
        Ok(*nonce)
    }

    fn take_tx_alarm(&mut self) -> Result<Option<AlarmFrame>, HalError> {
        Ok(self.tx_alarm.take())
    }
}

struct Rig {
    stages: StageTracker,
    limits: PowerLimitArbitrator,
    hw: MockHardware,
    sequencer: ChargeSequencer<MockInstant>,
    now: u64,
}

impl Rig {
    fn new() -> Self {
        Self {
            stages: StageTracker::new(),
            limits: PowerLimitArbitrator::with_table(default_limit_table()),
            hw: MockHardware::new(),
            sequencer: ChargeSequencer::new(SequencerConfig::new(), default_mode_table()),
            now: 0,
        }
    }

    fn start(&mut self) {
        self.sequencer.start(&self.stages, MockInstant(self.now));
    }

    fn step(&mut self) -> StepOutcome {
        self.now += 100;
        self.sequencer.step(
            &self.stages,
            &mut self.limits,
            &mut self.hw,
            MockInstant(self.now),
        )
    }

    fn authenticate(&mut self, outcome: AuthOutcome) -> StepOutcome {
        self.sequencer
            .finish_authentication(&self.stages, outcome, MockInstant(self.now))
    }

    /// Runs the full handshake with a verified accessory.
    fn regulate_verified(&mut self) {
        self.start();
        self.settle();
        self.authenticate(AuthOutcome::Verified);
        self.settle();
        assert_eq!(self.sequencer.current_mode(), Some(2));
    }

    fn recorded(&self, wanted: TelemetryEventKind) -> bool {
        self.sequencer
            .telemetry()
            .oldest_first()
            .any(|record| record.event == wanted)
    }

    /// Steps until the sequencer asks for something other than a zero delay.
    fn settle(&mut self) -> StepOutcome {
        for _ in 0..16 {
            match self.step() {
                StepOutcome::Continue(delay) if delay.is_zero() => {}
                other => return other,
            }
        }
        panic!("sequencer did not settle");
    }
}

#[test]
fn walks_every_stage_to_regulation() {
    let mut rig = Rig::new();
    rig.start();
    assert_eq!(rig.stages.stage(), ChargeStage::Handshake);

    assert_eq!(rig.settle(), StepOutcome::Authenticate);
    assert_eq!(rig.stages.stage(), ChargeStage::Authenticate);
    assert_eq!(rig.sequencer.accessory().cable(), CableType::HighPower);

    assert_eq!(
        rig.authenticate(AuthOutcome::Verified),
        StepOutcome::Continue(Duration::ZERO)
    );
    assert_eq!(rig.stages.stage(), ChargeStage::FirmwareUpdate);

    let outcome = rig.settle();
    assert_eq!(
        outcome,
        StepOutcome::Continue(SequencerConfig::new().regulation_interval)
    );
    assert_eq!(rig.stages.stage(), ChargeStage::Regulation);
    assert_eq!(rig.sequencer.current_mode(), Some(2));
    assert_eq!(
        rig.hw.applied.last().copied(),
        Some(PowerCeiling::new(9_000, 9_900, 1_600))
    );
    assert!(rig.hw.enabled);

    let stages: heapless::Vec<ChargeStage, 16> = rig
        .sequencer
        .telemetry()
        .oldest_first()
        .filter_map(|record| match record.event {
            TelemetryEventKind::StageEntered(stage) => Some(stage),
            _ => None,
        })
        .collect();
    assert_eq!(
        stages.as_slice(),
        &[
            ChargeStage::Handshake,
            ChargeStage::CapabilityQuery,
            ChargeStage::CableDetect,
            ChargeStage::Authenticate,
            ChargeStage::FirmwareUpdate,
            ChargeStage::Charging,
            ChargeStage::Regulation,
        ]
    );
}

#[test]
fn otg_mid_charge_lowers_next_setpoint() {
    let mut rig = Rig::new();
    rig.start();
    rig.settle();
    rig.authenticate(AuthOutcome::Verified);
    rig.settle();
    let pushes = rig.hw.applied.len();

    rig.limits.set_source(PowerLimitSource::Otg);
    rig.step();

    assert_eq!(rig.hw.applied.len(), pushes + 1);
    assert_eq!(
        rig.hw.applied.last().copied(),
        Some(PowerCeiling::new(5_000, 5_500, 1_000))
    );
    assert_eq!(rig.sequencer.current_mode(), Some(0));
}

#[test]
fn unverified_session_stays_below_gated_modes() {
    let mut rig = Rig::new();
    rig.start();
    rig.settle();
    for _ in 0..3 {
        rig.authenticate(AuthOutcome::Rejected);
    }
    assert_eq!(rig.stages.stage(), ChargeStage::FirmwareUpdate);
    rig.settle();
    assert_eq!(rig.sequencer.current_mode(), Some(1));
}

#[test]
fn rejected_auth_retries_before_giving_up() {
    let mut rig = Rig::new();
    rig.start();
    rig.settle();
    assert_eq!(
        rig.authenticate(AuthOutcome::Rejected),
        StepOutcome::Continue(SequencerConfig::new().stage_retry)
    );
    assert_eq!(rig.stages.stage(), ChargeStage::Authenticate);
    assert_eq!(rig.step(), StepOutcome::Authenticate);
}

#[test]
fn service_recovery_triggers_one_recheck() {
    let mut rig = Rig::new();
    rig.start();
    rig.settle();
    rig.authenticate(AuthOutcome::ServiceNotReady);
    rig.settle();
    assert!(rig.sequencer.accessory().need_recheck());
    assert_eq!(rig.sequencer.current_mode(), Some(1));

    rig.sequencer.on_service_ready(true);
    assert_eq!(rig.step(), StepOutcome::Authenticate);
    assert_eq!(rig.stages.stage(), ChargeStage::Authenticate);

    rig.authenticate(AuthOutcome::Verified);
    rig.settle();
    assert_eq!(rig.stages.stage(), ChargeStage::Regulation);
    assert_eq!(rig.sequencer.current_mode(), Some(2));
}

#[test]
fn missing_tx_id_falls_back_to_base_mode() {
    let mut rig = Rig::new();
    rig.hw.tx_id = Err(HalError::Timeout);
    rig.start();

    let retry = SequencerConfig::new().stage_retry;
    assert_eq!(rig.step(), StepOutcome::Continue(retry));
    assert_eq!(rig.step(), StepOutcome::Continue(retry));
    rig.settle();
    assert_eq!(rig.stages.stage(), ChargeStage::Regulation);
    assert_eq!(rig.sequencer.current_mode(), Some(0));
}

#[test]
fn vout_out_of_range_asserts_source_after_limit() {
    let mut rig = Rig::new();
    rig.start();
    rig.settle();
    rig.authenticate(AuthOutcome::Verified);
    rig.settle();

    rig.hw.sample.vout_mv = 7_000;
    rig.step();
    rig.step();
    assert!(!rig.limits.is_set(PowerLimitSource::VoutErr));
    rig.step();
    assert!(rig.limits.is_set(PowerLimitSource::VoutErr));
}

#[test]
fn disconnect_resets_stage_and_resettable_sources() {
    let mut rig = Rig::new();
    rig.start();
    rig.settle();
    rig.limits.set_source(PowerLimitSource::Otg);
    rig.limits.set_source(PowerLimitSource::Thermal);

    rig.sequencer
        .disconnect(&rig.stages, &mut rig.limits, &mut rig.hw, MockInstant(rig.now));

    assert_eq!(rig.stages.stage(), ChargeStage::Default);
    assert!(rig.limits.is_set(PowerLimitSource::Otg));
    assert!(!rig.limits.is_set(PowerLimitSource::Thermal));
    assert!(!rig.hw.enabled);
    assert_eq!(rig.sequencer.current_mode(), None);
    assert_eq!(rig.step(), StepOutcome::Idle);
}

#[test]
fn boost_shortfall_asserts_tx_boost_err() {
    let mut rig = Rig::new();
    rig.regulate_verified();

    rig.hw.sample.vrect_mv = 8_000;
    for _ in 0..4 {
        rig.step();
    }
    assert!(!rig.limits.is_set(PowerLimitSource::TxBoostErr));
    assert_eq!(rig.sequencer.current_mode(), Some(2));

    rig.step();
    assert!(rig.limits.is_set(PowerLimitSource::TxBoostErr));
    assert_eq!(rig.sequencer.current_mode(), Some(0));
    assert_eq!(
        rig.hw.applied.last().copied(),
        Some(PowerCeiling::new(5_000, 5_500, 1_000))
    );
}

#[test]
fn boost_recovery_restarts_the_count() {
    let mut rig = Rig::new();
    rig.regulate_verified();

    rig.hw.sample.vrect_mv = 8_000;
    for _ in 0..4 {
        rig.step();
    }
    rig.hw.sample.vrect_mv = 9_200;
    rig.step();
    rig.hw.sample.vrect_mv = 8_000;
    for _ in 0..4 {
        rig.step();
    }
    assert!(!rig.limits.is_set(PowerLimitSource::TxBoostErr));
    assert_eq!(rig.sequencer.current_mode(), Some(2));
}

#[test]
fn sagging_rectifier_steps_current_down() {
    let mut rig = Rig::new();
    rig.regulate_verified();

    rig.hw.sample.vrect_mv = 8_000;
    for _ in 0..3 {
        rig.step();
    }
    assert_eq!(
        rig.hw.applied.last().copied(),
        Some(PowerCeiling::new(9_000, 9_900, 1_500))
    );
    assert!(rig.sequencer.iout().stepped_down());

    rig.hw.sample.vrect_mv = 9_200;
    rig.step();
    assert_eq!(rig.sequencer.setpoint().map(|setpoint| setpoint.irx_ma), Some(1_500));
}

#[test]
fn light_load_holds_the_lowest_current_band() {
    let mut rig = Rig::new();
    rig.regulate_verified();

    rig.hw.sample.iout_ma = 300;
    rig.step();
    assert_eq!(
        rig.hw.applied.last().copied(),
        Some(PowerCeiling::new(9_000, 9_900, 1_000))
    );
}

#[test]
fn transmitter_alarm_asserts_source_and_caps_current() {
    let mut rig = Rig::new();
    rig.regulate_verified();

    rig.hw.tx_alarm = Some(AlarmRecord::new(AlarmSource::PowerLimit, 7_500, 9_000).encode());
    rig.step();

    assert!(rig.limits.is_set(PowerLimitSource::TxAlarm));
    assert_eq!(rig.sequencer.tx_alarm().plim_mw, 7_500);
    assert_eq!(rig.sequencer.current_mode(), Some(2));
    // 7.5 W at 9.9 V, below the 1.1 A source ceiling.
    assert_eq!(
        rig.hw.applied.last().copied(),
        Some(PowerCeiling::new(9_000, 9_900, 757))
    );
    assert!(rig.recorded(TelemetryEventKind::TxAlarmReceived));

    rig.hw.tx_alarm = Some(AlarmRecord::CLEAR.encode());
    rig.step();
    assert!(!rig.limits.is_set(PowerLimitSource::TxAlarm));
    assert!(rig.sequencer.tx_alarm().is_clear());
    assert_eq!(
        rig.hw.applied.last().copied(),
        Some(PowerCeiling::new(9_000, 9_900, 1_600))
    );
}

#[test]
fn icon_tracks_the_best_reachable_mode() {
    let mut rig = Rig::new();
    rig.regulate_verified();
    assert_eq!(rig.sequencer.icon(), IconClass::SuperFast);
    assert!(rig.recorded(TelemetryEventKind::IconChanged(IconClass::SuperFast)));

    rig.sequencer
        .disconnect(&rig.stages, &mut rig.limits, &mut rig.hw, MockInstant(rig.now));
    assert_eq!(rig.sequencer.icon(), IconClass::Normal);
}

#[test]
fn unverified_session_shows_fast_icon() {
    let mut rig = Rig::new();
    rig.start();
    rig.settle();
    for _ in 0..3 {
        rig.authenticate(AuthOutcome::Rejected);
    }
    rig.settle();
    assert_eq!(rig.sequencer.icon(), IconClass::Fast);
}
