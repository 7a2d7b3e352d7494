//! Simulated receiver driven one control period at a time.

use std::cell::RefCell;
use std::rc::Rc;

use embassy_futures::block_on;
use wlc_core::accessory::{AccessoryCaps, AdapterType, TX_ID_EXPECTED};
use wlc_core::alarm::{AlarmFrame, AlarmRecord};
use wlc_core::auth::{AuthRequest, AuthVerdict, HASH_LEN, NONCE_LEN};
use wlc_core::config::{DeviceProfile, default_profile};
use wlc_core::console::{AuthAction, ConsoleTarget, SessionStatus};
use wlc_core::controller::StepOutcome;
use wlc_core::hal::{
    AccessoryLink, AlarmLink, HalError, LossSample, PowerOutput, RemoteVerifier,
    TelemetrySample, TelemetrySource, XorShiftNonce,
};
use wlc_core::limits::{PowerCeiling, PowerLimitSource, SourceSet};
use wlc_core::modes::CableType;
use wlc_runtime::{AlarmTask, AuthService, ControlLoop, ProtectionTask, RuntimeInstant, SharedSession};

/// Simulated time that one `tick` advances.
pub const TICK_MS: u64 = 100;
const MAX_STEPS_PER_TICK: usize = 16;
const NONCE_SEED: u32 = 0x5eed_1234;

/// Physical state of the simulated coil and battery.
#[derive(Debug)]
struct Plant {
    coupled: bool,
    battery_temp_dc: i16,
    ploss_mw: u32,
    verifier: AuthAction,
    output: Option<PowerCeiling>,
    enabled: bool,
    frames: Vec<AlarmRecord>,
}

impl Plant {
    fn new() -> Self {
        Self {
            coupled: false,
            battery_temp_dc: 250,
            ploss_mw: 0,
            verifier: AuthAction::Approve,
            output: None,
            enabled: false,
            frames: Vec::new(),
        }
    }
}

/// Cheap handle onto the plant; every simulated peripheral shares one.
#[derive(Clone, Debug)]
pub struct SimCoil(Rc<RefCell<Plant>>);

impl SimCoil {
    fn new() -> Self {
        Self(Rc::new(RefCell::new(Plant::new())))
    }

    fn coupled(&self) -> Result<(), HalError> {
        if self.0.borrow().coupled {
            Ok(())
        } else {
            Err(HalError::Unavailable)
        }
    }
}

impl TelemetrySource for SimCoil {
    fn sample(&mut self) -> Result<TelemetrySample, HalError> {
        self.coupled()?;
        let plant = self.0.borrow();
        let (vout_mv, iout_ma) = match plant.output {
            Some(setpoint) if plant.enabled => (setpoint.vrx_mv, setpoint.irx_ma.min(1_500)),
            _ => (0, 0),
        };
        Ok(TelemetrySample {
            vrect_mv: vout_mv + 300,
            vout_mv,
            iout_ma,
            ic_temp_dc: 350,
            battery_temp_dc: plant.battery_temp_dc,
        })
    }

    fn power_loss(&mut self) -> Result<LossSample, HalError> {
        self.coupled()?;
        Ok(LossSample {
            ploss_mw: self.0.borrow().ploss_mw,
            ..LossSample::default()
        })
    }
}

impl PowerOutput for SimCoil {
    fn apply_setpoint(&mut self, setpoint: PowerCeiling) -> Result<(), HalError> {
        self.0.borrow_mut().output = Some(setpoint);
        Ok(())
    }

    fn set_output_enabled(&mut self, enabled: bool) -> Result<(), HalError> {
        self.0.borrow_mut().enabled = enabled;
        Ok(())
    }
}

impl AccessoryLink for SimCoil {
    fn tx_id(&mut self) -> Result<u16, HalError> {
        self.coupled()?;
        Ok(TX_ID_EXPECTED)
    }

    fn capabilities(&mut self) -> Result<AccessoryCaps, HalError> {
        self.coupled()?;
        Ok(AccessoryCaps::new(AdapterType::Pd, 9_000, 2_000)
            .with_cable_detect(true)
            .with_auth(true))
    }

    fn cable_type(&mut self) -> Result<CableType, HalError> {
        self.coupled()?;
        Ok(CableType::HighPower)
    }

    fn challenge(&mut self, nonce: &[u8; NONCE_LEN]) -> Result<[u8; HASH_LEN], HalError> {
        self.coupled()?;
        Ok(nonce.map(|byte| byte ^ 0x5a))
    }
}

impl AlarmLink for SimCoil {
    fn send_alarm(&mut self, frame: &AlarmFrame) -> Result<(), HalError> {
        self.coupled()?;
        self.0.borrow_mut().frames.push(AlarmRecord::decode(frame));
        Ok(())
    }
}

/// Answers submissions according to the configured [`AuthAction`].
pub struct SimVerifier {
    auth: &'static AuthService,
    coil: SimCoil,
}

impl RemoteVerifier for SimVerifier {
    fn submit(&mut self, request: &AuthRequest) -> Result<(), HalError> {
        match self.coil.0.borrow().verifier {
            AuthAction::Approve => self.auth.complete(AuthVerdict::new(request.id, true)),
            AuthAction::Reject => self.auth.complete(AuthVerdict::new(request.id, false)),
            AuthAction::Hang => {}
            AuthAction::Offline => return Err(HalError::Unavailable),
        }
        Ok(())
    }
}

type SimControl = ControlLoop<'static, SimCoil, SimVerifier, XorShiftNonce>;

/// One receiver with its control loop and monitors on a simulated clock.
pub struct Emulator {
    shared: &'static SharedSession,
    coil: SimCoil,
    control: SimControl,
    protection: ProtectionTask<'static, SimCoil>,
    fod: AlarmTask<'static, SimCoil>,
    clock_ms: u64,
    thermal_interval_ms: u64,
    next_step_ms: Option<u64>,
    next_protection_ms: u64,
    next_fod_ms: u64,
    connected: bool,
}

impl Emulator {
    pub fn new() -> Self {
        Self::with_profile(&default_profile())
    }

    /// Builds a receiver from `profile`.
    ///
    /// The shared session and the authentication service live for the rest
    /// of the process.
    pub fn with_profile(profile: &DeviceProfile) -> Self {
        let shared: &'static SharedSession =
            Box::leak(Box::new(SharedSession::with_limit_table(profile.limits.clone())));
        let auth: &'static AuthService =
            Box::leak(Box::new(AuthService::from_config(&profile.session)));
        shared.set_service_ready(true);

        let coil = SimCoil::new();
        let verifier = SimVerifier {
            auth,
            coil: coil.clone(),
        };
        let control = ControlLoop::from_profile(
            shared,
            auth,
            profile,
            coil.clone(),
            verifier,
            XorShiftNonce::new(NONCE_SEED),
        );
        let session = profile.session;
        let protection = ProtectionTask::new(
            shared,
            &profile.rx_thermal_bands,
            coil.clone(),
            session.thermal_interval,
        );
        let fod = AlarmTask::new(
            shared,
            &profile.fod_rows,
            session.fod_debounce,
            coil.clone(),
            session.alarm_interval,
        );

        Self {
            shared,
            coil,
            control,
            protection,
            fod,
            clock_ms: 0,
            thermal_interval_ms: millis(session.thermal_interval),
            next_step_ms: None,
            next_protection_ms: 0,
            next_fod_ms: 0,
            connected: false,
        }
    }

    pub fn clock_ms(&self) -> u64 {
        self.clock_ms
    }

    /// Alarm records delivered since the last call.
    pub fn take_alarm_frames(&mut self) -> Vec<AlarmRecord> {
        std::mem::take(&mut self.coil.0.borrow_mut().frames)
    }

    fn now(&self) -> RuntimeInstant {
        RuntimeInstant::from_millis(self.clock_ms)
    }

    fn advance_period(&mut self) {
        self.clock_ms += TICK_MS;
        if !self.connected {
            return;
        }

        self.run_control();

        let now = self.now();
        let mut link = self.coil.clone();
        if self.clock_ms >= self.next_protection_ms {
            let _ = self.protection.poll_once(&mut link);
            self.next_protection_ms = self.clock_ms + self.thermal_interval_ms;
        }
        if self.clock_ms >= self.next_fod_ms {
            let delay = self.fod.poll_once(&mut link, now);
            self.next_fod_ms = self.clock_ms + delay.as_millis();
        }
    }

    fn run_control(&mut self) {
        for _ in 0..MAX_STEPS_PER_TICK {
            let Some(due) = self.next_step_ms else {
                return;
            };
            if due > self.clock_ms {
                return;
            }

            let outcome = match self.control.step(self.now()) {
                StepOutcome::Authenticate => block_on(self.control.authenticate()),
                other => other,
            };
            self.next_step_ms = match outcome {
                StepOutcome::Continue(delay) => Some(self.clock_ms + millis(delay)),
                StepOutcome::Authenticate => Some(self.clock_ms),
                StepOutcome::Idle => None,
            };
        }
    }
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleTarget for Emulator {
    fn status(&self) -> SessionStatus {
        let sequencer = self.control.sequencer();
        let mode = sequencer.current_mode();
        SessionStatus {
            stage: self.shared.stage(),
            mode,
            mode_name: mode
                .and_then(|id| sequencer.modes().get(id))
                .map(|mode| mode.name),
            icon: sequencer.icon(),
            setpoint: sequencer.setpoint(),
            ceiling: self.shared.ceiling(),
            limits: self.shared.active_sources(),
            alarm: self.shared.alarm(),
            cable: sequencer.accessory().cable(),
            auth: sequencer.accessory().auth_level(),
            battery_temp_dc: sequencer.last_sample().map(|sample| sample.battery_temp_dc),
        }
    }

    fn set_limit(&mut self, source: PowerLimitSource, asserted: bool) -> bool {
        self.shared.with_limits(|limits| {
            if asserted {
                limits.set_source(source)
            } else {
                limits.clear_source(source)
            }
        })
    }

    fn reset_limits(&mut self) -> SourceSet {
        self.shared.with_limits(|limits| limits.reset())
    }

    fn set_battery_temp(&mut self, temp_dc: i16) {
        self.coil.0.borrow_mut().battery_temp_dc = temp_dc;
    }

    fn set_power_loss(&mut self, loss_mw: u32) {
        self.coil.0.borrow_mut().ploss_mw = loss_mw;
    }

    fn set_auth_behaviour(&mut self, action: AuthAction) {
        self.coil.0.borrow_mut().verifier = action;
        self.shared
            .set_service_ready(!matches!(action, AuthAction::Offline));
    }

    fn tick(&mut self, periods: u16) {
        for _ in 0..periods {
            self.advance_period();
        }
    }

    fn connect(&mut self) {
        if self.connected {
            return;
        }
        self.coil.0.borrow_mut().coupled = true;
        self.protection.reset();
        self.fod.reset();
        self.control.connect(self.now());
        self.connected = true;
        self.next_step_ms = Some(self.clock_ms);
        self.next_protection_ms = self.clock_ms;
        self.next_fod_ms = self.clock_ms;
    }

    fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.control.disconnect(self.now());
        self.coil.0.borrow_mut().coupled = false;
        self.connected = false;
        self.next_step_ms = None;
    }
}

fn millis(duration: core::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wlc_core::alarm::AlarmSource;
    use wlc_core::console::{ConsoleReply, execute};
    use wlc_core::modes::{AuthLevel, IconClass};
    use wlc_core::stage::ChargeStage;

    fn run(emulator: &mut Emulator, line: &str) -> ConsoleReply {
        execute(emulator, line).expect("command accepted")
    }

    #[test]
    fn connect_and_tick_reach_verified_regulation() {
        let mut emulator = Emulator::new();
        assert_eq!(run(&mut emulator, "connect"), ConsoleReply::Connected(ChargeStage::Handshake));

        run(&mut emulator, "tick");
        let status = emulator.status();
        assert_eq!(status.stage, ChargeStage::Regulation);
        assert_eq!(status.mode_name, Some("15w"));
        assert_eq!(status.auth, AuthLevel::Verified);
        assert_eq!(status.icon, IconClass::SuperFast);
        assert_eq!(status.setpoint, Some(PowerCeiling::new(9_000, 9_900, 1_600)));
    }

    #[test]
    fn hot_battery_limits_power_through_protection() {
        let mut emulator = Emulator::new();
        run(&mut emulator, "connect");
        run(&mut emulator, "tick 3");

        run(&mut emulator, "temp 440");
        run(&mut emulator, "tick 6");
        let status = emulator.status();
        assert!(status.limits.contains(PowerLimitSource::Thermal));
        assert_eq!(status.mode_name, Some("10w"));
        assert!(!status.alarm.is_clear());
        assert!(
            emulator
                .take_alarm_frames()
                .iter()
                .any(|record| record.sources.contains(AlarmSource::Temperature))
        );

        run(&mut emulator, "temp 380");
        run(&mut emulator, "tick 6");
        let status = emulator.status();
        assert!(!status.limits.contains(PowerLimitSource::Thermal));
        assert_eq!(status.mode_name, Some("15w"));
    }

    #[test]
    fn sustained_power_loss_raises_fod_alarm_after_debounce() {
        let mut emulator = Emulator::new();
        run(&mut emulator, "connect");
        run(&mut emulator, "tick 3");
        let _ = emulator.take_alarm_frames();

        run(&mut emulator, "loss 2500");
        run(&mut emulator, "tick 3");
        assert!(emulator.take_alarm_frames().is_empty());

        run(&mut emulator, "tick 10");
        let frames = emulator.take_alarm_frames();
        let last = frames.last().expect("fod alarm delivered");
        assert!(last.sources.contains(AlarmSource::Fod));
        assert_eq!(last.plim_mw, 7_500);
    }

    #[test]
    fn offline_verifier_caps_mode_until_service_returns() {
        let mut emulator = Emulator::new();
        run(&mut emulator, "auth offline");
        run(&mut emulator, "connect");
        run(&mut emulator, "tick");
        let status = emulator.status();
        assert_eq!(status.stage, ChargeStage::Regulation);
        assert_eq!(status.auth, AuthLevel::Unverified);
        assert_eq!(status.mode_name, Some("10w"));

        run(&mut emulator, "auth approve");
        run(&mut emulator, "tick 6");
        let status = emulator.status();
        assert_eq!(status.auth, AuthLevel::Verified);
        assert_eq!(status.mode_name, Some("15w"));
    }

    #[test]
    fn disconnect_keeps_persistent_limits_only() {
        let mut emulator = Emulator::new();
        run(&mut emulator, "connect");
        run(&mut emulator, "limit set otg");
        run(&mut emulator, "limit set fan");
        run(&mut emulator, "tick 2");
        assert_eq!(
            emulator.status().setpoint,
            Some(PowerCeiling::new(5_000, 5_500, 1_000))
        );

        assert_eq!(run(&mut emulator, "disconnect"), ConsoleReply::Disconnected);
        let status = emulator.status();
        assert_eq!(status.stage, ChargeStage::Default);
        assert!(status.limits.contains(PowerLimitSource::Otg));
        assert!(!status.limits.contains(PowerLimitSource::Fan));
    }
}
