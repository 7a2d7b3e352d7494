//! Control loop that drives the stage sequencer against real time.

use wlc_core::auth::{AuthError, AuthOutcome, NONCE_LEN};
use wlc_core::config::DeviceProfile;
use wlc_core::controller::{ChargeHardware, ChargeSequencer, StepOutcome};
use wlc_core::hal::{NonceSource, RemoteVerifier};
use wlc_core::stage::ChargeStage;

use crate::auth::AuthService;
use crate::monitor::TaskControl;
use crate::session::{RuntimeInstant, SharedSession, to_embassy};

/// Owns the sequencer and the hardware it drives for one receiver.
pub struct ControlLoop<'a, H, V, N>
where
    H: ChargeHardware,
    V: RemoteVerifier,
    N: NonceSource,
{
    shared: &'a SharedSession,
    auth: &'a AuthService,
    sequencer: ChargeSequencer<RuntimeInstant>,
    hw: H,
    verifier: V,
    nonces: N,
}

impl<'a, H, V, N> ControlLoop<'a, H, V, N>
where
    H: ChargeHardware,
    V: RemoteVerifier,
    N: NonceSource,
{
    pub fn new(
        shared: &'a SharedSession,
        auth: &'a AuthService,
        sequencer: ChargeSequencer<RuntimeInstant>,
        hw: H,
        verifier: V,
        nonces: N,
    ) -> Self {
        Self {
            shared,
            auth,
            sequencer,
            hw,
            verifier,
            nonces,
        }
    }

    pub fn from_profile(
        shared: &'a SharedSession,
        auth: &'a AuthService,
        profile: &DeviceProfile,
        hw: H,
        verifier: V,
        nonces: N,
    ) -> Self {
        let sequencer = ChargeSequencer::new(profile.session.sequencer, profile.modes.clone())
            .with_iout_bands(&profile.iout_bands);
        Self::new(shared, auth, sequencer, hw, verifier, nonces)
    }

    pub fn sequencer(&self) -> &ChargeSequencer<RuntimeInstant> {
        &self.sequencer
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    /// Starts a session at the handshake stage.
    pub fn connect(&mut self, now: RuntimeInstant) {
        self.sequencer.start(self.shared.stages(), now);
        log_stage(ChargeStage::Handshake);
    }

    /// Tears the session down and forgets its alarm history.
    pub fn disconnect(&mut self, now: RuntimeInstant) {
        let shared = self.shared;
        let sequencer = &mut self.sequencer;
        let hw = &mut self.hw;
        shared.with_limits_detached(|limits| sequencer.disconnect(shared.stages(), limits, hw, now));
        shared.reset_alarms();
        log_stage(ChargeStage::Default);
    }

    /// Runs one synchronous sequencer step.
    ///
    /// The step works on a detached copy of the arbitrator so no lock is held
    /// across the hardware calls it makes.
    pub fn step(&mut self, now: RuntimeInstant) -> StepOutcome {
        let shared = self.shared;
        self.sequencer.on_service_ready(shared.service_ready());

        let before = shared.stage();
        let sequencer = &mut self.sequencer;
        let hw = &mut self.hw;
        let outcome =
            shared.with_limits_detached(|limits| sequencer.step(shared.stages(), limits, hw, now));

        let after = shared.stage();
        if after != before {
            log_stage(after);
        }
        outcome
    }

    /// Challenges the transmitter and waits for the verifier's verdict.
    pub async fn authenticate(&mut self) -> StepOutcome {
        let mut nonce = [0u8; NONCE_LEN];
        self.nonces.fill_nonce(&mut nonce);

        let outcome = match self.hw.challenge(&nonce) {
            Ok(hash) => {
                match self
                    .auth
                    .authenticate(self.shared, &mut self.verifier, &nonce, &hash)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(AuthError::Busy) => {
                        return StepOutcome::Continue(self.sequencer.config().stage_retry);
                    }
                }
            }
            Err(_) => AuthOutcome::LinkFailed,
        };

        let now = RuntimeInstant::now();
        self.sequencer
            .finish_authentication(self.shared.stages(), outcome, now)
    }

    /// Steps once and runs the handshake if the sequencer asks for it.
    pub async fn advance(&mut self) -> StepOutcome {
        match self.step(RuntimeInstant::now()) {
            StepOutcome::Authenticate => self.authenticate().await,
            other => other,
        }
    }

    /// Runs a whole session until `control` requests a stop.
    pub async fn run(&mut self, control: &TaskControl) {
        self.connect(RuntimeInstant::now());
        loop {
            match self.advance().await {
                StepOutcome::Continue(delay) => {
                    if control.sleep(to_embassy(delay)).await {
                        break;
                    }
                }
                StepOutcome::Authenticate => {}
                StepOutcome::Idle => {
                    control.wait_stop().await;
                    break;
                }
            }
        }
        self.disconnect(RuntimeInstant::now());
        control.finish();
    }
}

#[cfg(target_os = "none")]
fn log_stage(stage: ChargeStage) {
    defmt::info!("control: stage {}", stage.label());
}

#[cfg(not(target_os = "none"))]
fn log_stage(stage: ChargeStage) {
    println!("control: stage {stage}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;
    use embassy_futures::join::join;
    use embassy_time::Timer;
    use wlc_core::accessory::{AccessoryCaps, AdapterType, TX_ID_EXPECTED};
    use wlc_core::auth::{AuthRequest, AuthState, AuthVerdict, HASH_LEN};
    use wlc_core::config::default_profile;
    use wlc_core::hal::{
        AccessoryLink, HalError, PowerOutput, TelemetrySample, TelemetrySource, XorShiftNonce,
    };
    use wlc_core::limits::{PowerCeiling, PowerLimitSource};
    use wlc_core::modes::CableType;

    struct Receiver {
        battery_temp_dc: i16,
        setpoint: Option<PowerCeiling>,
        enabled: bool,
    }

    impl Receiver {
        fn new() -> Self {
            Self {
                battery_temp_dc: 250,
                setpoint: None,
                enabled: false,
            }
        }
    }

    impl TelemetrySource for Receiver {
        fn sample(&mut self) -> Result<TelemetrySample, HalError> {
            Ok(TelemetrySample {
                vrect_mv: 9_200,
                vout_mv: 9_900,
                iout_ma: 1_100,
                ic_temp_dc: 380,
                battery_temp_dc: self.battery_temp_dc,
            })
        }
    }

    impl PowerOutput for Receiver {
        fn apply_setpoint(&mut self, setpoint: PowerCeiling) -> Result<(), HalError> {
            self.setpoint = Some(setpoint);
            Ok(())
        }

        fn set_output_enabled(&mut self, enabled: bool) -> Result<(), HalError> {
            self.enabled = enabled;
            Ok(())
        }
    }

    impl AccessoryLink for Receiver {
        fn tx_id(&mut self) -> Result<u16, HalError> {
            Ok(TX_ID_EXPECTED)
        }

        fn capabilities(&mut self) -> Result<AccessoryCaps, HalError> {
            Ok(AccessoryCaps::new(AdapterType::Pd, 9_000, 2_000)
                .with_cable_detect(true)
                .with_auth(true))
        }

        fn cable_type(&mut self) -> Result<CableType, HalError> {
            Ok(CableType::HighPower)
        }

        fn challenge(&mut self, nonce: &[u8; NONCE_LEN]) -> Result<[u8; HASH_LEN], HalError> {
            let mut hash = *nonce;
            hash.reverse();
            Ok(hash)
        }
    }

    #[derive(Default)]
    struct Verifier {
        last: Option<AuthRequest>,
    }

    impl RemoteVerifier for Verifier {
        fn submit(&mut self, request: &AuthRequest) -> Result<(), HalError> {
            self.last = Some(*request);
            Ok(())
        }
    }

    type Loop<'a> = ControlLoop<'a, Receiver, Verifier, XorShiftNonce>;

    fn control_loop<'a>(shared: &'a SharedSession, auth: &'a AuthService) -> Loop<'a> {
        ControlLoop::from_profile(
            shared,
            auth,
            &default_profile(),
            Receiver::new(),
            Verifier::default(),
            XorShiftNonce::new(0x5eed),
        )
    }

    async fn advance_until(control: &mut Loop<'_>, stage: ChargeStage) {
        for _ in 0..16 {
            if control.shared.stage() == stage {
                return;
            }
            let _ = control.advance().await;
        }
        panic!("never reached {stage}");
    }

    async fn approve_when_waiting(auth: &AuthService, request_id: u32) {
        while auth.state() != AuthState::WaitingForService {
            Timer::after_millis(1).await;
        }
        auth.complete(AuthVerdict::new(request_id, true));
    }

    #[test]
    fn verified_session_reaches_regulation() {
        let profile = default_profile();
        let shared = SharedSession::with_limit_table(profile.limits);
        shared.set_service_ready(true);
        let auth = AuthService::from_config(&profile.session);
        let mut control = control_loop(&shared, &auth);

        control.connect(RuntimeInstant::now());
        block_on(join(
            advance_until(&mut control, ChargeStage::Regulation),
            approve_when_waiting(&auth, 1),
        ));

        assert_eq!(auth.last_outcome(), Some(AuthOutcome::Verified));
        assert_eq!(control.sequencer().current_mode(), Some(2));
        assert_eq!(
            control.hardware().setpoint,
            Some(PowerCeiling::new(9_000, 9_900, 1_600))
        );
        assert!(control.hardware().enabled);
        let digest = control.verifier.last.expect("request submitted").digest;
        assert_eq!(digest[NONCE_LEN], digest[NONCE_LEN - 1]);
    }

    #[test]
    fn service_recovery_rechecks_authentication() {
        let profile = default_profile();
        let shared = SharedSession::with_limit_table(profile.limits);
        let auth = AuthService::from_config(&profile.session);
        let mut control = control_loop(&shared, &auth);

        control.connect(RuntimeInstant::now());
        block_on(advance_until(&mut control, ChargeStage::Regulation));
        assert_eq!(auth.last_outcome(), Some(AuthOutcome::ServiceNotReady));
        assert!(control.verifier.last.is_none());
        assert_eq!(control.sequencer().current_mode(), Some(1));

        shared.set_service_ready(true);
        let (outcome, ()) = block_on(join(control.advance(), approve_when_waiting(&auth, 2)));
        assert_eq!(outcome, StepOutcome::Continue(core::time::Duration::ZERO));

        block_on(advance_until(&mut control, ChargeStage::Regulation));
        assert_eq!(control.sequencer().current_mode(), Some(2));
    }

    #[test]
    fn disconnect_clears_session_but_keeps_persistent_limits() {
        let profile = default_profile();
        let shared = SharedSession::with_limit_table(profile.limits);
        let auth = AuthService::from_config(&profile.session);
        let mut control = control_loop(&shared, &auth);

        control.connect(RuntimeInstant::now());
        shared.with_limits(|limits| {
            limits.set_source(PowerLimitSource::Otg);
            limits.set_source(PowerLimitSource::Thermal);
        });
        block_on(advance_until(&mut control, ChargeStage::Regulation));
        assert_eq!(
            control.hardware().setpoint,
            Some(PowerCeiling::new(5_000, 5_500, 1_000))
        );

        control.disconnect(RuntimeInstant::now());
        assert_eq!(shared.stage(), ChargeStage::Default);
        assert!(!control.hardware().enabled);
        let active = shared.active_sources();
        assert!(active.contains(PowerLimitSource::Otg));
        assert!(!active.contains(PowerLimitSource::Thermal));
    }

    #[test]
    fn run_stops_and_disconnects_on_request() {
        let profile = default_profile();
        let shared = SharedSession::with_limit_table(profile.limits);
        let auth = AuthService::from_config(&profile.session);
        let mut control = control_loop(&shared, &auth);
        let task = TaskControl::new();

        block_on(join(control.run(&task), async {
            Timer::after_millis(20).await;
            task.shutdown().await;
        }));

        assert_eq!(shared.stage(), ChargeStage::Default);
        assert!(!control.hardware().enabled);
    }
}
