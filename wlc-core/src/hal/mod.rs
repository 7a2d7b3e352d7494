//! Hardware seams consumed by the charging engine.
//!
//! Each IC variant implements these traits once and the session holds the
//! implementation for its lifetime. Register-level access stays behind the
//! trait boundary. The `Noop*` types let host builds and tests run without
//! hardware.

use core::fmt;

use crate::accessory::AccessoryCaps;
use crate::alarm::AlarmFrame;
use crate::auth::{AuthRequest, HASH_LEN, NONCE_LEN};
use crate::limits::PowerCeiling;
use crate::modes::CableType;

/// Failures reported by hardware collaborators.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HalError {
    /// The device did not answer or the bus is down.
    Unavailable,
    /// The peer rejected or failed to acknowledge the request.
    Nack,
    /// The operation exceeded its hardware deadline.
    Timeout,
    /// The variant does not implement this operation.
    Unsupported,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Instantaneous RX-side readings. Temperatures are tenths of a degree C.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct TelemetrySample {
    pub vrect_mv: u32,
    pub vout_mv: u32,
    pub iout_ma: u32,
    pub ic_temp_dc: i16,
    pub battery_temp_dc: i16,
}

/// Power-loss reading used by foreign-object classification.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct LossSample {
    pub ploss_mw: u32,
    /// Identifier of the estimator that produced `ploss_mw`.
    pub source: u8,
    /// Usage scene reported by the device description collaborator.
    pub scene: u8,
    /// Accessory class currently coupled to the coil.
    pub accessory: u8,
}

/// Read path of the analog front end.
pub trait TelemetrySource {
    fn sample(&mut self) -> Result<TelemetrySample, HalError>;

    fn power_loss(&mut self) -> Result<LossSample, HalError> {
        Err(HalError::Unsupported)
    }

    /// Charge-pump conversion ratio between rectifier output and charger input.
    fn cp_ratio(&mut self) -> u8 {
        1
    }
}

/// Write path for negotiated set-points.
pub trait PowerOutput {
    fn apply_setpoint(&mut self, setpoint: PowerCeiling) -> Result<(), HalError>;

    fn set_output_enabled(&mut self, enabled: bool) -> Result<(), HalError>;
}

/// In-band messaging with the transmitter.
pub trait AccessoryLink {
    fn tx_id(&mut self) -> Result<u16, HalError>;

    fn capabilities(&mut self) -> Result<AccessoryCaps, HalError>;

    fn cable_type(&mut self) -> Result<CableType, HalError>;

    /// Sends `nonce` as a challenge and returns the transmitter's hash.
    fn challenge(&mut self, nonce: &[u8; NONCE_LEN]) -> Result<[u8; HASH_LEN], HalError>;

    /// Alarm frame the transmitter sent since the last call, if any.
    fn take_tx_alarm(&mut self) -> Result<Option<AlarmFrame>, HalError> {
        Ok(None)
    }
}

/// Transport for encoded alarm frames.
pub trait AlarmLink {
    fn send_alarm(&mut self, frame: &AlarmFrame) -> Result<(), HalError>;
}

/// Remote verification service. Verdicts arrive asynchronously.
pub trait RemoteVerifier {
    fn submit(&mut self, request: &AuthRequest) -> Result<(), HalError>;
}

/// Randomness for authentication challenges.
pub trait NonceSource {
    fn fill_nonce(&mut self, nonce: &mut [u8; NONCE_LEN]);
}

/// Telemetry source that never has data.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopTelemetry;

impl TelemetrySource for NoopTelemetry {
    fn sample(&mut self) -> Result<TelemetrySample, HalError> {
        Err(HalError::Unavailable)
    }
}

/// Output stage that accepts and discards every set-point.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopPowerOutput;

impl PowerOutput for NoopPowerOutput {
    fn apply_setpoint(&mut self, _setpoint: PowerCeiling) -> Result<(), HalError> {
        Ok(())
    }

    fn set_output_enabled(&mut self, _enabled: bool) -> Result<(), HalError> {
        Ok(())
    }
}

/// Link to a transmitter that never answers.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopAccessoryLink;

impl AccessoryLink for NoopAccessoryLink {
    fn tx_id(&mut self) -> Result<u16, HalError> {
        Err(HalError::Unavailable)
    }

    fn capabilities(&mut self) -> Result<AccessoryCaps, HalError> {
        Err(HalError::Unavailable)
    }

    fn cable_type(&mut self) -> Result<CableType, HalError> {
        Err(HalError::Unavailable)
    }

    fn challenge(&mut self, _nonce: &[u8; NONCE_LEN]) -> Result<[u8; HASH_LEN], HalError> {
        Err(HalError::Unavailable)
    }
}

/// Alarm link that drops every frame.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopAlarmLink;

impl AlarmLink for NoopAlarmLink {
    fn send_alarm(&mut self, _frame: &AlarmFrame) -> Result<(), HalError> {
        Ok(())
    }
}

/// Verifier that is never reachable.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopVerifier;

impl RemoteVerifier for NoopVerifier {
    fn submit(&mut self, _request: &AuthRequest) -> Result<(), HalError> {
        Err(HalError::Unavailable)
    }
}

/// Deterministic xorshift nonce generator for targets without a TRNG.
#[derive(Copy, Clone, Debug)]
pub struct XorShiftNonce {
    state: u32,
}

impl XorShiftNonce {
    /// Seeds the generator. A zero seed is replaced by a fixed constant.
    pub const fn new(seed: u32) -> Self {
        Self {
            state: if seed == 0 { 0x9E37_79B9 } else { seed },
        }
    }

    fn next_word(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }
}

impl NonceSource for XorShiftNonce {
    fn fill_nonce(&mut self, nonce: &mut [u8; NONCE_LEN]) {
        for chunk in nonce.chunks_mut(4) {
            let word = self.next_word().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }
}
