//! Authentication handshake with a bounded wait on the remote verifier.
//!
//! The verifier answers out of band through [`AuthService::complete`]. A
//! verdict may arrive at any time, including after the waiter gave up; the
//! request id it carries decides whether it still counts.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, with_timeout};
use wlc_core::auth::{
    AuthError, AuthOutcome, AuthSession, AuthState, AuthVerdict, HASH_LEN, NONCE_LEN, RequestId,
};
use wlc_core::config::SessionConfig;
use wlc_core::hal::RemoteVerifier;

use crate::session::{SessionMutex, SharedSession, to_embassy};

pub struct AuthService {
    session: Mutex<SessionMutex, RefCell<AuthSession>>,
    verdict: Signal<SessionMutex, AuthVerdict>,
    timeout: Duration,
}

impl AuthService {
    pub const fn new(timeout: Duration) -> Self {
        Self {
            session: Mutex::new(RefCell::new(AuthSession::new())),
            verdict: Signal::new(),
            timeout,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(to_embassy(config.auth_timeout))
    }

    pub fn state(&self) -> AuthState {
        self.session.lock(|cell| cell.borrow().state())
    }

    /// Outcome of the most recent finished attempt.
    pub fn last_outcome(&self) -> Option<AuthOutcome> {
        self.session.lock(|cell| cell.borrow().result())
    }

    /// Publishes a verdict from the verifier.
    ///
    /// Verdicts that do not answer the attempt in flight are dropped before
    /// they reach the signal, so they cannot overwrite a matching one.
    pub fn complete(&self, verdict: AuthVerdict) {
        let active = self.session.lock(|cell| {
            let session = cell.borrow();
            if session.accepts(&verdict) {
                Ok(())
            } else {
                Err(session.active())
            }
        });
        match active {
            Ok(()) => self.verdict.signal(verdict),
            Err(expected) => log_stale_verdict(verdict.request_id, expected),
        }
    }

    /// Runs one attempt.
    ///
    /// Fails fast with [`AuthOutcome::ServiceNotReady`] when the verifier has
    /// not reported ready, and yields [`AuthOutcome::Unresponsive`] when no
    /// matching verdict arrives within the timeout.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Busy`] while another attempt is outstanding.
    pub async fn authenticate<V: RemoteVerifier>(
        &self,
        shared: &SharedSession,
        verifier: &mut V,
        nonce: &[u8; NONCE_LEN],
        hash: &[u8; HASH_LEN],
    ) -> Result<AuthOutcome, AuthError> {
        let request = self
            .session
            .lock(|cell| cell.borrow_mut().begin(nonce, hash))
            .inspect_err(|_| log_auth_busy())?;
        self.verdict.reset();

        let outcome = if !shared.service_ready() {
            self.settle(AuthSession::fail_fast)
        } else if verifier.submit(&request).is_err() {
            self.settle(AuthSession::abort)
        } else {
            self.session.lock(|cell| cell.borrow_mut().mark_waiting());
            match with_timeout(self.timeout, self.wait_for(request.id)).await {
                Ok(outcome) => outcome,
                Err(_) => self.settle(AuthSession::expire),
            }
        };

        self.session.lock(|cell| {
            let _ = cell.borrow_mut().finish();
        });
        log_auth_outcome(request.id, outcome);
        Ok(outcome)
    }

    async fn wait_for(&self, id: RequestId) -> AuthOutcome {
        loop {
            let verdict = self.verdict.wait().await;
            if let Some(outcome) = self.session.lock(|cell| cell.borrow_mut().complete(verdict)) {
                return outcome;
            }
            log_stale_verdict(verdict.request_id, Some(id));
        }
    }

    fn settle(&self, end: impl FnOnce(&mut AuthSession) -> AuthOutcome) -> AuthOutcome {
        self.session.lock(|cell| end(&mut *cell.borrow_mut()))
    }
}

#[cfg(target_os = "none")]
fn log_auth_outcome(request: RequestId, outcome: AuthOutcome) {
    match outcome {
        AuthOutcome::Verified => defmt::info!("auth: request {=u32} verified", request),
        other => defmt::warn!("auth: request {=u32} {}", request, other.label()),
    }
}

#[cfg(not(target_os = "none"))]
fn log_auth_outcome(request: RequestId, outcome: AuthOutcome) {
    println!("auth: request {request} {outcome}");
}

#[cfg(target_os = "none")]
fn log_auth_busy() {
    defmt::warn!("auth: attempt rejected, another one is in flight");
}

#[cfg(not(target_os = "none"))]
fn log_auth_busy() {}

#[cfg(target_os = "none")]
fn log_stale_verdict(received: RequestId, expected: Option<RequestId>) {
    defmt::info!(
        "auth: dropped verdict for request {=u32}, waiting on {}",
        received,
        expected
    );
}

#[cfg(not(target_os = "none"))]
fn log_stale_verdict(_: RequestId, _: Option<RequestId>) {}
