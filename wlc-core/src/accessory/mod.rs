//! Transmitter identification, capability discovery, and retry bookkeeping.
//!
//! The sequencer feeds link results into [`AccessoryTracker`], which decides
//! whether to retry, fall back to default capabilities, or move on.

use core::fmt;

use crate::auth::AuthOutcome;
use crate::hal::HalError;
use crate::modes::{AuthLevel, CableType};

/// Identifier reported by transmitters that speak the extended protocol.
pub const TX_ID_EXPECTED: u16 = 0x8866;

/// Adapter powering the transmitter, as reported during capability discovery.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AdapterType {
    Unknown,
    Sdp,
    Cdp,
    NonStandard,
    Dcp,
    Fcp,
    Scp,
    Pd,
    Qc,
    OtgA,
}

impl AdapterType {
    pub const fn label(self) -> &'static str {
        match self {
            AdapterType::Unknown => "unknown",
            AdapterType::Sdp => "sdp",
            AdapterType::Cdp => "cdp",
            AdapterType::NonStandard => "non-std",
            AdapterType::Dcp => "dcp",
            AdapterType::Fcp => "fcp",
            AdapterType::Scp => "scp",
            AdapterType::Pd => "pd",
            AdapterType::Qc => "qc",
            AdapterType::OtgA => "otg-a",
        }
    }
}

impl fmt::Display for AdapterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What the transmitter can deliver and which optional exchanges it supports.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AccessoryCaps {
    pub adapter: AdapterType,
    pub vmax_mv: u32,
    pub imax_ma: u32,
    pub support_12v: bool,
    pub supports_cable_detect: bool,
    pub supports_auth: bool,
}

impl AccessoryCaps {
    pub const fn new(adapter: AdapterType, vmax_mv: u32, imax_ma: u32) -> Self {
        Self {
            adapter,
            vmax_mv,
            imax_ma,
            support_12v: false,
            supports_cable_detect: false,
            supports_auth: false,
        }
    }

    #[must_use]
    pub const fn with_12v(mut self, supported: bool) -> Self {
        self.support_12v = supported;
        self
    }

    #[must_use]
    pub const fn with_cable_detect(mut self, supported: bool) -> Self {
        self.supports_cable_detect = supported;
        self
    }

    #[must_use]
    pub const fn with_auth(mut self, supported: bool) -> Self {
        self.supports_auth = supported;
        self
    }

    /// Nameplate power in milliwatts.
    pub fn power_mw(self) -> u64 {
        u64::from(self.vmax_mv) * u64::from(self.imax_ma) / 1000
    }
}

/// Capabilities assumed for an unidentified transmitter.
pub const BASE_CAPS: AccessoryCaps = AccessoryCaps::new(AdapterType::Unknown, 5000, 1000);

/// Conservative capabilities keyed by adapter type, used when discovery
/// reports an adapter but no usable limits.
pub const fn default_caps_for(adapter: AdapterType) -> AccessoryCaps {
    match adapter {
        AdapterType::Sdp | AdapterType::OtgA => AccessoryCaps::new(adapter, 5000, 475),
        AdapterType::Fcp => AccessoryCaps::new(adapter, 9000, 2000),
        AdapterType::Cdp
        | AdapterType::NonStandard
        | AdapterType::Dcp
        | AdapterType::Scp
        | AdapterType::Pd
        | AdapterType::Qc => AccessoryCaps::new(adapter, 5000, 1000),
        AdapterType::Unknown => BASE_CAPS,
    }
}

/// Per-session attempt budgets.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RetryLimits {
    pub handshake: u8,
    pub capability: u8,
    pub auth: u8,
}

impl RetryLimits {
    pub const fn new(handshake: u8, capability: u8, auth: u8) -> Self {
        Self {
            handshake,
            capability,
            auth,
        }
    }
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self::new(3, 3, 3)
    }
}

/// Result of feeding one TX id read into the tracker.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HandshakeOutcome {
    Identified(u16),
    /// Wrong id or attempts exhausted; the session continues on base caps.
    Unsupported,
    Retry,
}

/// Result of feeding one capability read into the tracker.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CapabilityOutcome {
    Reported(AccessoryCaps),
    /// Discovery failed or reported nothing usable; table defaults apply.
    Defaulted(AccessoryCaps),
    Retry,
}

/// What the sequencer should do after an authentication attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AuthDecision {
    Proceed,
    Retry,
}

/// Counters and discovered facts for the coupled transmitter.
#[derive(Clone, Debug)]
pub struct AccessoryTracker {
    limits: RetryLimits,
    handshake_attempts: u8,
    capability_attempts: u8,
    auth_attempts: u8,
    tx_id: Option<u16>,
    caps: AccessoryCaps,
    cable: CableType,
    authenticated: bool,
    need_recheck: bool,
}

impl AccessoryTracker {
    pub const fn new(limits: RetryLimits) -> Self {
        Self {
            limits,
            handshake_attempts: 0,
            capability_attempts: 0,
            auth_attempts: 0,
            tx_id: None,
            caps: BASE_CAPS,
            cable: CableType::Unknown,
            authenticated: false,
            need_recheck: false,
        }
    }

    /// Clears every counter and discovered fact.
    pub fn reset(&mut self) {
        *self = Self::new(self.limits);
    }

    pub fn caps(&self) -> AccessoryCaps {
        self.caps
    }

    pub fn tx_id(&self) -> Option<u16> {
        self.tx_id
    }

    pub fn cable(&self) -> CableType {
        self.cable
    }

    pub fn auth_level(&self) -> AuthLevel {
        if self.authenticated {
            AuthLevel::Verified
        } else {
            AuthLevel::Unverified
        }
    }

    /// Returns `true` when an earlier attempt could not reach the service.
    pub fn need_recheck(&self) -> bool {
        self.need_recheck
    }

    pub fn auth_attempts(&self) -> u8 {
        self.auth_attempts
    }

    /// Returns `true` once the authentication budget is spent.
    pub fn auth_exhausted(&self) -> bool {
        self.auth_attempts >= self.limits.auth
    }

    pub fn on_handshake(&mut self, result: Result<u16, HalError>) -> HandshakeOutcome {
        match result {
            Ok(id) if id == TX_ID_EXPECTED => {
                self.tx_id = Some(id);
                HandshakeOutcome::Identified(id)
            }
            Ok(id) => {
                self.tx_id = Some(id);
                self.caps = BASE_CAPS;
                HandshakeOutcome::Unsupported
            }
            Err(_) => {
                self.handshake_attempts = self.handshake_attempts.saturating_add(1);
                if self.handshake_attempts >= self.limits.handshake {
                    self.caps = BASE_CAPS;
                    HandshakeOutcome::Unsupported
                } else {
                    HandshakeOutcome::Retry
                }
            }
        }
    }

    pub fn on_capabilities(&mut self, result: Result<AccessoryCaps, HalError>) -> CapabilityOutcome {
        match result {
            Ok(caps) if caps.vmax_mv > 0 && caps.imax_ma > 0 => {
                self.caps = caps;
                CapabilityOutcome::Reported(caps)
            }
            Ok(caps) => {
                let defaults = default_caps_for(caps.adapter)
                    .with_12v(caps.support_12v)
                    .with_cable_detect(caps.supports_cable_detect)
                    .with_auth(caps.supports_auth);
                self.caps = defaults;
                CapabilityOutcome::Defaulted(defaults)
            }
            Err(_) => {
                self.capability_attempts = self.capability_attempts.saturating_add(1);
                if self.capability_attempts >= self.limits.capability {
                    self.caps = BASE_CAPS;
                    CapabilityOutcome::Defaulted(BASE_CAPS)
                } else {
                    CapabilityOutcome::Retry
                }
            }
        }
    }

    /// Records the cable type. A failed read leaves the cable unknown.
    pub fn on_cable(&mut self, result: Result<CableType, HalError>) -> CableType {
        self.cable = result.unwrap_or(CableType::Unknown);
        self.cable
    }

    pub fn on_auth(&mut self, outcome: AuthOutcome) -> AuthDecision {
        match outcome {
            AuthOutcome::Verified => {
                self.authenticated = true;
                self.need_recheck = false;
                AuthDecision::Proceed
            }
            AuthOutcome::Rejected | AuthOutcome::LinkFailed => {
                self.authenticated = false;
                self.auth_attempts = self.auth_attempts.saturating_add(1);
                if self.auth_exhausted() {
                    AuthDecision::Proceed
                } else {
                    AuthDecision::Retry
                }
            }
            AuthOutcome::ServiceNotReady | AuthOutcome::Unresponsive => {
                self.need_recheck = true;
                AuthDecision::Proceed
            }
        }
    }
}

impl Default for AccessoryTracker {
    fn default() -> Self {
        Self::new(RetryLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_retries_until_budget_then_falls_back() {
        let mut tracker = AccessoryTracker::new(RetryLimits::new(2, 2, 2));
        assert_eq!(
            tracker.on_handshake(Err(HalError::Timeout)),
            HandshakeOutcome::Retry
        );
        assert_eq!(
            tracker.on_handshake(Err(HalError::Timeout)),
            HandshakeOutcome::Unsupported
        );
        assert_eq!(tracker.caps(), BASE_CAPS);
    }

    #[test]
    fn wrong_tx_id_is_unsupported() {
        let mut tracker = AccessoryTracker::default();
        assert_eq!(tracker.on_handshake(Ok(0x1234)), HandshakeOutcome::Unsupported);
        assert_eq!(tracker.tx_id(), Some(0x1234));
    }

    #[test]
    fn empty_capabilities_use_adapter_defaults() {
        let mut tracker = AccessoryTracker::default();
        let reported = AccessoryCaps::new(AdapterType::Fcp, 0, 0).with_auth(true);
        match tracker.on_capabilities(Ok(reported)) {
            CapabilityOutcome::Defaulted(caps) => {
                assert_eq!(caps.vmax_mv, 9000);
                assert_eq!(caps.imax_ma, 2000);
                assert!(caps.supports_auth);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn rejected_auth_consumes_budget() {
        let mut tracker = AccessoryTracker::new(RetryLimits::new(3, 3, 2));
        assert_eq!(tracker.on_auth(AuthOutcome::Rejected), AuthDecision::Retry);
        assert_eq!(tracker.on_auth(AuthOutcome::Rejected), AuthDecision::Proceed);
        assert!(tracker.auth_exhausted());
        assert_eq!(tracker.auth_level(), AuthLevel::Unverified);
    }

    #[test]
    fn unreachable_service_requests_recheck_without_spending_budget() {
        let mut tracker = AccessoryTracker::default();
        assert_eq!(tracker.on_auth(AuthOutcome::Unresponsive), AuthDecision::Proceed);
        assert!(tracker.need_recheck());
        assert_eq!(tracker.auth_attempts(), 0);

        assert_eq!(tracker.on_auth(AuthOutcome::Verified), AuthDecision::Proceed);
        assert!(!tracker.need_recheck());
        assert_eq!(tracker.auth_level(), AuthLevel::Verified);
    }

    #[test]
    fn reset_clears_counters_but_keeps_limits() {
        let mut tracker = AccessoryTracker::new(RetryLimits::new(1, 1, 1));
        let _ = tracker.on_auth(AuthOutcome::Rejected);
        tracker.reset();
        assert_eq!(tracker.auth_attempts(), 0);
        assert_eq!(
            tracker.on_handshake(Err(HalError::Nack)),
            HandshakeOutcome::Unsupported
        );
    }
}
