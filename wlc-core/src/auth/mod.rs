//! Challenge/response bookkeeping for transmitter authentication.
//!
//! The session here is synchronous: it owns the digest, hands out request
//! ids and classifies completions. Waiting on the remote verifier with a
//! deadline is the runtime's job.

use core::fmt;

/// Length of the locally generated challenge.
pub const NONCE_LEN: usize = 8;
/// Length of the hash returned by the transmitter.
pub const HASH_LEN: usize = 8;
/// Length of the combined digest forwarded to the verifier.
pub const DIGEST_LEN: usize = NONCE_LEN + HASH_LEN;

pub type RequestId = u32;

/// Digest submitted to the remote verifier.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AuthRequest {
    pub id: RequestId,
    pub digest: [u8; DIGEST_LEN],
}

/// Verdict published by the remote verifier.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AuthVerdict {
    pub request_id: RequestId,
    pub approved: bool,
}

impl AuthVerdict {
    pub const fn new(request_id: RequestId, approved: bool) -> Self {
        Self {
            request_id,
            approved,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum AuthState {
    #[default]
    Idle,
    Requested,
    WaitingForService,
    Succeeded,
    Failed,
    ServiceUnavailable,
}

impl AuthState {
    /// Returns `true` while an attempt is outstanding.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, AuthState::Requested | AuthState::WaitingForService)
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Classified result of one authentication attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AuthOutcome {
    Verified,
    /// The verifier answered and refused the digest.
    Rejected,
    /// The verifier was never observed ready; nothing was waited on.
    ServiceNotReady,
    /// The verifier was ready but no verdict arrived before the deadline.
    Unresponsive,
    /// The transmitter or verifier transport failed before a verdict.
    LinkFailed,
}

impl AuthOutcome {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            AuthOutcome::Verified => "verified",
            AuthOutcome::Rejected => "rejected",
            AuthOutcome::ServiceNotReady => "service-not-ready",
            AuthOutcome::Unresponsive => "unresponsive",
            AuthOutcome::LinkFailed => "link-failed",
        }
    }
}

impl fmt::Display for AuthOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AuthError {
    /// Another attempt is still outstanding.
    Busy,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Combines the nonce and the transmitter hash into the submitted digest.
#[must_use]
pub fn compose_digest(nonce: &[u8; NONCE_LEN], hash: &[u8; HASH_LEN]) -> [u8; DIGEST_LEN] {
    let mut digest = [0u8; DIGEST_LEN];
    digest[..NONCE_LEN].copy_from_slice(nonce);
    digest[NONCE_LEN..].copy_from_slice(hash);
    digest
}

/// Single-attempt authentication state owned by one handshake at a time.
#[derive(Clone, Debug)]
pub struct AuthSession {
    state: AuthState,
    active: Option<RequestId>,
    next_id: RequestId,
    digest: [u8; DIGEST_LEN],
    result: Option<AuthOutcome>,
}

impl AuthSession {
    pub const fn new() -> Self {
        Self {
            state: AuthState::Idle,
            active: None,
            next_id: 1,
            digest: [0; DIGEST_LEN],
            result: None,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Request id of the outstanding attempt, if any.
    pub fn active(&self) -> Option<RequestId> {
        self.active
    }

    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// Outcome of the last finished attempt.
    pub fn result(&self) -> Option<AuthOutcome> {
        self.result
    }

    /// Starts an attempt and returns the request to submit.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Busy`] while a previous attempt is still in flight.
    pub fn begin(
        &mut self,
        nonce: &[u8; NONCE_LEN],
        hash: &[u8; HASH_LEN],
    ) -> Result<AuthRequest, AuthError> {
        if self.state.is_in_flight() {
            return Err(AuthError::Busy);
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.digest = compose_digest(nonce, hash);
        self.active = Some(id);
        self.result = None;
        self.state = AuthState::Requested;

        Ok(AuthRequest {
            id,
            digest: self.digest,
        })
    }

    /// Marks the request as handed to the verifier.
    pub fn mark_waiting(&mut self) {
        if self.state == AuthState::Requested {
            self.state = AuthState::WaitingForService;
        }
    }

    /// Returns `true` when `verdict` answers the outstanding attempt.
    pub fn accepts(&self, verdict: &AuthVerdict) -> bool {
        self.state.is_in_flight() && self.active == Some(verdict.request_id)
    }

    /// Applies a verdict. Verdicts for other request ids are ignored.
    pub fn complete(&mut self, verdict: AuthVerdict) -> Option<AuthOutcome> {
        if !self.accepts(&verdict) {
            return None;
        }

        let outcome = if verdict.approved {
            self.state = AuthState::Succeeded;
            AuthOutcome::Verified
        } else {
            self.state = AuthState::Failed;
            AuthOutcome::Rejected
        };
        Some(self.settle(outcome))
    }

    /// Ends the outstanding attempt because the deadline elapsed.
    pub fn expire(&mut self) -> AuthOutcome {
        self.state = AuthState::ServiceUnavailable;
        self.settle(AuthOutcome::Unresponsive)
    }

    /// Ends the attempt without waiting because the verifier is not ready.
    pub fn fail_fast(&mut self) -> AuthOutcome {
        self.state = AuthState::ServiceUnavailable;
        self.settle(AuthOutcome::ServiceNotReady)
    }

    /// Ends the attempt after a transport failure.
    pub fn abort(&mut self) -> AuthOutcome {
        self.state = AuthState::Failed;
        self.settle(AuthOutcome::LinkFailed)
    }

    /// Returns the session to idle once the result has been consumed.
    pub fn finish(&mut self) -> Option<AuthOutcome> {
        self.state = AuthState::Idle;
        self.active = None;
        self.digest = [0; DIGEST_LEN];
        self.result
    }

    fn settle(&mut self, outcome: AuthOutcome) -> AuthOutcome {
        self.active = None;
        self.result = Some(outcome);
        outcome
    }
}

impl Default for AuthSession {
    fn default() -> Self {
        Self::new()
    }
}
