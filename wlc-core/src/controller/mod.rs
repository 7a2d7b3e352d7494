//! Stage sequencer that walks a receive session from handshake to regulation.
//!
//! The sequencer is a synchronous state machine. The runtime calls
//! [`ChargeSequencer::step`] whenever the previous step's delay elapses and
//! runs the authentication handshake itself when asked to. Every decision is
//! published through the shared [`StageTracker`] so monitors and the console
//! observe the same stage.

pub mod iout;
pub mod protection;

pub use iout::{IoutBand, IoutRegulator, IoutTick, LowVrectConfig};
pub use protection::{ProtectionMonitor, ProtectionVerdict};

use core::time::Duration;

use crate::accessory::{AccessoryTracker, AuthDecision, CapabilityOutcome, HandshakeOutcome};
use crate::alarm::AlarmRecord;
use crate::auth::AuthOutcome;
use crate::config::SequencerConfig;
use crate::hal::{AccessoryLink, PowerOutput, TelemetrySample, TelemetrySource};
use crate::limits::{PowerCeiling, PowerLimitArbitrator, PowerLimitSource};
use crate::modes::{IconClass, ModeId, ModeQuery, ModeTable, Selection};
use crate::stage::{ChargeStage, StageTracker};
use crate::telemetry::{TelemetryEventKind, TelemetryInstant, TelemetryPayload, TelemetryRecorder};

/// What the runtime should do after a step.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StepOutcome {
    /// Call [`ChargeSequencer::step`] again after the delay.
    Continue(Duration),
    /// Run the authentication handshake, then report it through
    /// [`ChargeSequencer::finish_authentication`].
    Authenticate,
    /// Nothing left to sequence until the next session starts.
    Idle,
}

/// Hardware seams the sequencer drives.
pub trait ChargeHardware: TelemetrySource + PowerOutput + AccessoryLink {}

impl<T> ChargeHardware for T where T: TelemetrySource + PowerOutput + AccessoryLink {}

/// Receive-side stage sequencer.
pub struct ChargeSequencer<I>
where
    I: TelemetryInstant,
{
    config: SequencerConfig,
    modes: ModeTable,
    accessory: AccessoryTracker,
    current_mode: Option<ModeId>,
    mode_since: Option<I>,
    setpoint: Option<PowerCeiling>,
    last_sample: Option<TelemetrySample>,
    vout_errs: u8,
    boost_errs: u8,
    iout: IoutRegulator,
    tx_alarm: AlarmRecord,
    icon: IconClass,
    service_ready: bool,
    recheck_armed: bool,
    telemetry: TelemetryRecorder<I>,
}

impl<I> ChargeSequencer<I>
where
    I: TelemetryInstant,
{
    pub fn new(config: SequencerConfig, modes: ModeTable) -> Self {
        Self {
            config,
            modes,
            accessory: AccessoryTracker::new(config.retries),
            current_mode: None,
            mode_since: None,
            setpoint: None,
            last_sample: None,
            vout_errs: 0,
            boost_errs: 0,
            iout: IoutRegulator::new(
                &iout::DEFAULT_IOUT_BANDS,
                config.low_vrect,
                config.regulation_interval,
            ),
            tx_alarm: AlarmRecord::CLEAR,
            icon: IconClass::Normal,
            service_ready: false,
            recheck_armed: false,
            telemetry: TelemetryRecorder::new(),
        }
    }

    /// Replaces the output-current bands used during regulation.
    #[must_use]
    pub fn with_iout_bands(mut self, bands: &[IoutBand]) -> Self {
        self.iout = IoutRegulator::new(bands, self.config.low_vrect, self.config.regulation_interval);
        self
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    pub fn modes(&self) -> &ModeTable {
        &self.modes
    }

    pub fn accessory(&self) -> &AccessoryTracker {
        &self.accessory
    }

    pub fn current_mode(&self) -> Option<ModeId> {
        self.current_mode
    }

    /// Last set-point accepted by the output stage.
    pub fn setpoint(&self) -> Option<PowerCeiling> {
        self.setpoint
    }

    pub fn last_sample(&self) -> Option<TelemetrySample> {
        self.last_sample
    }

    /// Charging indicator pushed on the last regulation tick.
    pub fn icon(&self) -> IconClass {
        self.icon
    }

    /// Last alarm received from the transmitter this session.
    pub fn tx_alarm(&self) -> AlarmRecord {
        self.tx_alarm
    }

    pub fn iout(&self) -> &IoutRegulator {
        &self.iout
    }

    pub fn telemetry(&self) -> &TelemetryRecorder<I> {
        &self.telemetry
    }

    pub fn service_ready(&self) -> bool {
        self.service_ready
    }

    /// Starts a session: forgets the previous one and enters the handshake.
    pub fn start(&mut self, stages: &StageTracker, now: I) {
        self.clear_session();
        self.enter(stages, ChargeStage::Handshake, now);
    }

    /// Records the verifier's readiness. A rising edge arms one re-check.
    pub fn on_service_ready(&mut self, ready: bool) {
        if ready && !self.service_ready {
            self.recheck_armed = true;
        }
        self.service_ready = ready;
    }

    /// Ends the session: back to `Default`, resettable sources cleared.
    pub fn disconnect<H: PowerOutput>(
        &mut self,
        stages: &StageTracker,
        limits: &mut PowerLimitArbitrator,
        hw: &mut H,
        now: I,
    ) {
        let _ = hw.set_output_enabled(false);
        for source in limits.reset().iter() {
            self.telemetry.record_limit(source, false, now);
        }
        self.clear_session();
        stages.reset();
        self.telemetry.record_disconnect(now);
    }

    /// Applies the result of a handshake requested by [`StepOutcome::Authenticate`].
    pub fn finish_authentication(
        &mut self,
        stages: &StageTracker,
        outcome: AuthOutcome,
        now: I,
    ) -> StepOutcome {
        self.telemetry.record_auth(outcome, now);
        if stages.stage() != ChargeStage::Authenticate {
            return StepOutcome::Continue(Duration::ZERO);
        }

        match self.accessory.on_auth(outcome) {
            AuthDecision::Retry => StepOutcome::Continue(self.config.stage_retry),
            AuthDecision::Proceed => {
                self.enter(stages, ChargeStage::FirmwareUpdate, now);
                StepOutcome::Continue(Duration::ZERO)
            }
        }
    }

    /// Runs the action of the current stage.
    pub fn step<H: ChargeHardware>(
        &mut self,
        stages: &StageTracker,
        limits: &mut PowerLimitArbitrator,
        hw: &mut H,
        now: I,
    ) -> StepOutcome {
        match stages.stage() {
            ChargeStage::Default | ChargeStage::RegulationDc => StepOutcome::Idle,
            ChargeStage::Handshake => match self.accessory.on_handshake(hw.tx_id()) {
                HandshakeOutcome::Identified(_) => {
                    self.enter(stages, ChargeStage::CapabilityQuery, now);
                    StepOutcome::Continue(Duration::ZERO)
                }
                HandshakeOutcome::Unsupported => {
                    self.enter(stages, ChargeStage::Charging, now);
                    StepOutcome::Continue(Duration::ZERO)
                }
                HandshakeOutcome::Retry => StepOutcome::Continue(self.config.stage_retry),
            },
            ChargeStage::CapabilityQuery => {
                match self.accessory.on_capabilities(hw.capabilities()) {
                    CapabilityOutcome::Reported(_) | CapabilityOutcome::Defaulted(_) => {
                        self.enter(stages, ChargeStage::CableDetect, now);
                        StepOutcome::Continue(Duration::ZERO)
                    }
                    CapabilityOutcome::Retry => StepOutcome::Continue(self.config.stage_retry),
                }
            }
            ChargeStage::CableDetect => {
                if self.accessory.caps().supports_cable_detect {
                    self.accessory.on_cable(hw.cable_type());
                }
                self.enter(stages, ChargeStage::Authenticate, now);
                StepOutcome::Continue(Duration::ZERO)
            }
            ChargeStage::Authenticate => {
                if self.accessory.caps().supports_auth && !self.accessory.auth_exhausted() {
                    StepOutcome::Authenticate
                } else {
                    self.enter(stages, ChargeStage::FirmwareUpdate, now);
                    StepOutcome::Continue(Duration::ZERO)
                }
            }
            ChargeStage::FirmwareUpdate => {
                self.enter(stages, ChargeStage::Charging, now);
                StepOutcome::Continue(Duration::ZERO)
            }
            ChargeStage::Charging => self.begin_charging(stages, limits, hw, now),
            ChargeStage::Regulation => self.regulate(stages, limits, hw, now),
        }
    }

    fn begin_charging<H: ChargeHardware>(
        &mut self,
        stages: &StageTracker,
        limits: &mut PowerLimitArbitrator,
        hw: &mut H,
        now: I,
    ) -> StepOutcome {
        let sample = hw.sample().ok();
        if let Some(sample) = sample {
            self.last_sample = Some(sample);
        }
        let query = self.query(limits, hw, now);
        self.update_icon(&query, now);
        let selection = self.negotiate(&query);
        let _ = hw.set_output_enabled(true);
        self.apply(selection, limits.ceiling(), hw, now);

        if self.in_direct_charge() {
            self.enter(stages, ChargeStage::RegulationDc, now);
            return StepOutcome::Idle;
        }
        self.enter(stages, ChargeStage::Regulation, now);
        StepOutcome::Continue(self.config.regulation_interval)
    }

    fn regulate<H: ChargeHardware>(
        &mut self,
        stages: &StageTracker,
        limits: &mut PowerLimitArbitrator,
        hw: &mut H,
        now: I,
    ) -> StepOutcome {
        let interval = self.config.regulation_interval;
        let Ok(sample) = hw.sample() else {
            self.telemetry
                .record(TelemetryEventKind::SampleMissed, TelemetryPayload::none(), now);
            return StepOutcome::Continue(interval);
        };
        self.last_sample = Some(sample);

        self.check_vout(&sample, limits, now);
        self.check_boost(&sample, limits, now);
        self.poll_tx_alarm(limits, hw, now);

        if self.accessory.need_recheck() && self.recheck_armed && self.service_ready {
            self.recheck_armed = false;
            self.enter(stages, ChargeStage::Authenticate, now);
            return StepOutcome::Authenticate;
        }

        let query = self.query(limits, hw, now);
        self.update_icon(&query, now);
        let selection = self.negotiate(&query.successor_only());
        let selection = self.shape_current(selection, &sample);
        self.apply(selection, limits.ceiling(), hw, now);

        if self.in_direct_charge() {
            self.enter(stages, ChargeStage::RegulationDc, now);
            return StepOutcome::Idle;
        }
        StepOutcome::Continue(interval)
    }

    fn query<H: ChargeHardware>(&self, limits: &PowerLimitArbitrator, hw: &mut H, now: I) -> ModeQuery {
        let mut query = ModeQuery::new(self.accessory.caps())
            .with_cable(self.accessory.cable())
            .with_auth(self.accessory.auth_level())
            .with_current(self.current_mode)
            .with_ceiling(limits.ceiling())
            .with_cp_ratio(hw.cp_ratio())
            .current_expired(self.current_expired(now));
        if let Some(sample) = self.last_sample {
            query = query.with_battery_temp(sample.battery_temp_dc);
        }
        query
    }

    /// Narrows the selected set-point's current for this tick.
    fn shape_current(&mut self, selection: Selection, sample: &TelemetrySample) -> Selection {
        let Selection::Mode { id, mut setpoint } = selection else {
            self.iout.reset();
            return selection;
        };
        if self.current_mode != Some(id) {
            self.iout.reset();
        }

        let vrect_min_mv = self.modes.get(id).map_or(0, |mode| mode.vrect_min_mv);
        setpoint.irx_ma = self.iout.limit(&IoutTick {
            max_ma: setpoint.irx_ma,
            applied_ma: self.setpoint.map(|applied| applied.irx_ma),
            iavg_ma: sample.iout_ma,
            vrect_mv: sample.vrect_mv,
            vrect_min_mv,
            vrx_mv: setpoint.vrx_mv,
            tx_alarm: self.tx_alarm,
        });
        Selection::Mode { id, setpoint }
    }

    /// Mirrors a newly received transmitter alarm onto its limit source.
    fn poll_tx_alarm<H: AccessoryLink>(
        &mut self,
        limits: &mut PowerLimitArbitrator,
        hw: &mut H,
        now: I,
    ) {
        let Ok(Some(frame)) = hw.take_tx_alarm() else {
            return;
        };
        let record = AlarmRecord::decode(&frame);
        self.tx_alarm = record;
        self.telemetry.record_tx_alarm(record, now);
        if record.is_clear() {
            if limits.clear_source(PowerLimitSource::TxAlarm) {
                self.telemetry
                    .record_limit(PowerLimitSource::TxAlarm, false, now);
            }
        } else {
            self.assert_limit(limits, PowerLimitSource::TxAlarm, now);
        }
    }

    fn update_icon(&mut self, query: &ModeQuery, now: I) {
        let icon = self.modes.icon_class(query);
        if icon != self.icon {
            self.icon = icon;
            self.telemetry.record_icon(icon, now);
        }
    }

    /// Forward from an eligible current mode, downgrade from an ineligible one.
    fn negotiate(&self, query: &ModeQuery) -> Selection {
        match self.current_mode {
            Some(current) if !self.modes.is_eligible(current, query) => {
                self.modes.select_mode(&query.downgrade())
            }
            _ => self.modes.select_mode(query),
        }
    }

    fn current_expired(&self, now: I) -> bool {
        let timeout = self
            .current_mode
            .and_then(|id| self.modes.get(id))
            .and_then(|mode| mode.timeout);
        match (timeout, self.mode_since) {
            (Some(timeout), Some(since)) => now.saturating_duration_since(since) >= timeout,
            _ => false,
        }
    }

    fn apply<H: PowerOutput>(
        &mut self,
        selection: Selection,
        ceiling: PowerCeiling,
        hw: &mut H,
        now: I,
    ) {
        let (mode, setpoint) = match selection {
            Selection::Mode { id, setpoint } => (Some(id), setpoint),
            Selection::NoEligibleMode => {
                // Fall back to the base mode, clamped to the ceiling.
                let Some(setpoint) = self.modes.base_setpoint(ceiling) else {
                    return;
                };
                (self.modes.get(0).map(|mode| mode.id), setpoint)
            }
        };

        if mode != self.current_mode {
            self.current_mode = mode;
            self.mode_since = Some(now);
            self.vout_errs = 0;
            self.boost_errs = 0;
            if let Some(id) = mode {
                self.telemetry.record_mode(id, setpoint, now);
            }
        }

        if self.setpoint != Some(setpoint) {
            match hw.apply_setpoint(setpoint) {
                Ok(()) => {
                    self.setpoint = Some(setpoint);
                    self.telemetry.record_setpoint(setpoint, now);
                }
                // Left unset so the next tick pushes it again.
                Err(_) => self.setpoint = None,
            }
        }
    }

    fn check_vout(&mut self, sample: &TelemetrySample, limits: &mut PowerLimitArbitrator, now: I) {
        let Some(setpoint) = self.setpoint else {
            return;
        };
        let low = setpoint.vrx_mv.saturating_sub(self.config.vout_low_margin_mv);
        let high = setpoint.vrx_mv.saturating_add(self.config.vout_high_margin_mv);
        if (low..=high).contains(&sample.vout_mv) {
            self.vout_errs = 0;
            return;
        }
        self.vout_errs = self.vout_errs.saturating_add(1);
        if self.vout_errs >= self.config.vout_err_limit {
            self.assert_limit(limits, PowerLimitSource::VoutErr, now);
        }
    }

    fn check_boost(&mut self, sample: &TelemetrySample, limits: &mut PowerLimitArbitrator, now: I) {
        let vrect_min = self
            .current_mode
            .and_then(|id| self.modes.get(id))
            .map_or(0, |mode| mode.vrect_min_mv);
        if sample.vrect_mv >= vrect_min {
            self.boost_errs = 0;
            return;
        }
        self.boost_errs = self.boost_errs.saturating_add(1);
        if self.boost_errs >= self.config.boost_err_limit {
            self.assert_limit(limits, PowerLimitSource::TxBoostErr, now);
        }
    }

    fn assert_limit(&mut self, limits: &mut PowerLimitArbitrator, source: PowerLimitSource, now: I) {
        if limits.set_source(source) {
            self.telemetry.record_limit(source, true, now);
        }
    }

    fn in_direct_charge(&self) -> bool {
        self.current_mode
            .and_then(|id| self.modes.get(id))
            .is_some_and(|mode| mode.direct_charge)
    }

    fn enter(&mut self, stages: &StageTracker, stage: ChargeStage, now: I) {
        if stages.stage() != stage {
            stages.set_stage(stage);
            self.telemetry.record_stage(stage, now);
        }
    }

    fn clear_session(&mut self) {
        self.accessory.reset();
        self.current_mode = None;
        self.mode_since = None;
        self.setpoint = None;
        self.last_sample = None;
        self.vout_errs = 0;
        self.boost_errs = 0;
        self.iout.reset();
        self.tx_alarm = AlarmRecord::CLEAR;
        self.icon = IconClass::Normal;
        self.recheck_armed = false;
    }
}

#[cfg(test)]
mod tests;
