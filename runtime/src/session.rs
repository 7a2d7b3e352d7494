//! Per-session state shared by the runtime tasks.

use core::cell::RefCell;

#[cfg(not(target_os = "none"))]
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(target_os = "none")]
use embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Instant};
use portable_atomic::{AtomicBool, Ordering};
use wlc_core::alarm::{AlarmBoard, AlarmChannel, AlarmRecord, TransmitOutcome, send_frame};
use wlc_core::hal::AlarmLink;
use wlc_core::limits::{LimitTable, PowerCeiling, PowerLimitArbitrator, SourceSet};
use wlc_core::stage::{ChargeStage, StageTracker};
use wlc_core::telemetry::TelemetryInstant;

#[cfg(target_os = "none")]
pub type SessionMutex = ThreadModeRawMutex;
#[cfg(not(target_os = "none"))]
pub type SessionMutex = NoopRawMutex;

/// Embassy instant wrapped for the core state machines.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct RuntimeInstant(Instant);

impl RuntimeInstant {
    pub fn now() -> Self {
        Self(Instant::now())
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(Instant::from_millis(millis))
    }

    pub const fn into_embassy(self) -> Instant {
        self.0
    }

    pub const fn as_millis(self) -> u64 {
        self.0.as_millis()
    }
}

impl From<Instant> for RuntimeInstant {
    fn from(value: Instant) -> Self {
        Self(value)
    }
}

impl TelemetryInstant for RuntimeInstant {
    fn saturating_duration_since(&self, earlier: Self) -> core::time::Duration {
        core::time::Duration::from_micros(self.0.saturating_duration_since(earlier.0).as_micros())
    }
}

/// Converts a core duration, saturating at the embassy tick range.
pub fn to_embassy(duration: core::time::Duration) -> Duration {
    let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
    Duration::from_micros(micros)
}

/// State every task of one receive session touches.
///
/// The stage lives in an atomic; the arbitrator and the alarm board sit
/// behind blocking mutexes and are only held for synchronous updates.
/// Hardware I/O never happens while either lock is held.
pub struct SharedSession {
    stages: StageTracker,
    limits: Mutex<SessionMutex, RefCell<PowerLimitArbitrator>>,
    alarms: Mutex<SessionMutex, RefCell<AlarmBoard>>,
    service_ready: AtomicBool,
}

impl SharedSession {
    /// Creates a session with no limit table; every query is permissive.
    pub const fn new() -> Self {
        Self::with_arbitrator(PowerLimitArbitrator::new())
    }

    pub const fn with_limit_table(table: LimitTable) -> Self {
        Self::with_arbitrator(PowerLimitArbitrator::with_table(table))
    }

    const fn with_arbitrator(arbitrator: PowerLimitArbitrator) -> Self {
        Self {
            stages: StageTracker::new(),
            limits: Mutex::new(RefCell::new(arbitrator)),
            alarms: Mutex::new(RefCell::new(AlarmBoard::new())),
            service_ready: AtomicBool::new(false),
        }
    }

    pub fn stages(&self) -> &StageTracker {
        &self.stages
    }

    pub fn stage(&self) -> ChargeStage {
        self.stages.stage()
    }

    /// Runs `f` with exclusive access to the arbitrator.
    pub fn with_limits<R>(&self, f: impl FnOnce(&mut PowerLimitArbitrator) -> R) -> R {
        self.limits.lock(|cell| f(&mut *cell.borrow_mut()))
    }

    /// Runs `f` on a copy of the arbitrator with the lock released, then
    /// applies the sources it set or cleared to the shared one.
    ///
    /// Sources changed by other tasks while `f` ran are kept.
    pub fn with_limits_detached<R>(&self, f: impl FnOnce(&mut PowerLimitArbitrator) -> R) -> R {
        let mut local = self.with_limits(|limits| limits.clone());
        let before = local.active();
        let result = f(&mut local);
        let after = local.active();

        self.with_limits(|limits| {
            for source in before.iter().filter(|source| !after.contains(*source)) {
                limits.clear_source(source);
            }
            for source in after.iter().filter(|source| !before.contains(*source)) {
                limits.set_source(source);
            }
        });
        result
    }

    pub fn ceiling(&self) -> PowerCeiling {
        self.with_limits(|limits| limits.ceiling())
    }

    pub fn active_sources(&self) -> SourceSet {
        self.with_limits(|limits| limits.active())
    }

    /// Replaces one monitor's record and sends the merged alarm.
    pub fn post_alarm<L: AlarmLink>(
        &self,
        link: &mut L,
        channel: AlarmChannel,
        record: AlarmRecord,
    ) -> TransmitOutcome {
        self.post_alarms(link, &[(channel, record)])
    }

    /// Replaces several monitors' records and sends the merged alarm once.
    ///
    /// The frame is encoded under the lock and sent outside it.
    pub fn post_alarms<L: AlarmLink>(
        &self,
        link: &mut L,
        updates: &[(AlarmChannel, AlarmRecord)],
    ) -> TransmitOutcome {
        let pending = self.with_alarms(|board| {
            for (channel, record) in updates {
                board.update(*channel, *record);
            }
            board.pending()
        });
        let Some(frame) = pending else {
            return TransmitOutcome::Suppressed;
        };

        let outcome = send_frame(link, &frame);
        if matches!(outcome, TransmitOutcome::Sent { .. }) {
            self.with_alarms(|board| board.confirm(frame));
        }
        outcome
    }

    /// Runs `f` with exclusive access to the alarm board.
    pub fn with_alarms<R>(&self, f: impl FnOnce(&mut AlarmBoard) -> R) -> R {
        self.alarms.lock(|cell| f(&mut *cell.borrow_mut()))
    }

    /// Merged record across every monitor.
    pub fn alarm(&self) -> AlarmRecord {
        self.with_alarms(|board| board.merged())
    }

    /// Last record that actually reached the transmitter.
    pub fn last_sent_alarm(&self) -> AlarmRecord {
        self.with_alarms(|board| board.transmitter().last_sent())
    }

    /// Records verifier readiness. Returns the previous value.
    pub fn set_service_ready(&self, ready: bool) -> bool {
        self.service_ready.swap(ready, Ordering::SeqCst)
    }

    pub fn service_ready(&self) -> bool {
        self.service_ready.load(Ordering::SeqCst)
    }

    /// Forgets per-session alarm history.
    pub fn reset_alarms(&self) {
        self.with_alarms(AlarmBoard::reset);
    }
}

impl Default for SharedSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wlc_core::alarm::{AlarmFrame, AlarmSource};
    use wlc_core::hal::HalError;
    use wlc_core::limits::{PowerLimitSource, default_limit_table};

    #[derive(Default)]
    struct CountingLink {
        sent: usize,
    }

    impl AlarmLink for CountingLink {
        fn send_alarm(&mut self, _frame: &AlarmFrame) -> Result<(), HalError> {
            self.sent += 1;
            Ok(())
        }
    }

    #[test]
    fn limits_are_shared_through_the_session() {
        let session = SharedSession::with_limit_table(default_limit_table());
        session.with_limits(|limits| limits.set_source(PowerLimitSource::Otg));

        assert!(session.active_sources().contains(PowerLimitSource::Otg));
        assert_eq!(session.ceiling(), PowerCeiling::new(5_000, 5_500, 1_000));
    }

    #[test]
    fn alarm_posts_are_deduplicated_across_monitors() {
        let session = SharedSession::new();
        let mut link = CountingLink::default();
        let record = AlarmRecord::new(AlarmSource::Fod, 7_500, 9_000);

        session.post_alarm(&mut link, AlarmChannel::Fod, record);
        session.post_alarm(&mut link, AlarmChannel::Thermal, AlarmRecord::CLEAR);
        session.post_alarm(&mut link, AlarmChannel::Fod, record);

        assert_eq!(link.sent, 1);
        assert_eq!(session.last_sent_alarm(), record);

        session.reset_alarms();
        assert!(session.alarm().is_clear());
        assert!(session.last_sent_alarm().is_clear());
    }

    #[test]
    fn detached_limits_release_the_lock_and_merge_changes() {
        let session = SharedSession::with_limit_table(default_limit_table());
        session.with_limits(|limits| limits.set_source(PowerLimitSource::Thermal));

        let ceiling = session.with_limits_detached(|limits| {
            // Another task touches the shared arbitrator meanwhile.
            session.with_limits(|shared| shared.set_source(PowerLimitSource::Otg));
            limits.clear_source(PowerLimitSource::Thermal);
            limits.set_source(PowerLimitSource::TxBoostErr);
            session.ceiling()
        });

        assert_eq!(ceiling, PowerCeiling::new(5_000, 5_500, 1_000));
        let active = session.active_sources();
        assert!(active.contains(PowerLimitSource::Otg));
        assert!(active.contains(PowerLimitSource::TxBoostErr));
        assert!(!active.contains(PowerLimitSource::Thermal));
    }

    struct ReentrantLink<'a> {
        session: &'a SharedSession,
        seen: Option<AlarmRecord>,
    }

    impl AlarmLink for ReentrantLink<'_> {
        fn send_alarm(&mut self, _frame: &AlarmFrame) -> Result<(), HalError> {
            self.seen = Some(self.session.alarm());
            Ok(())
        }
    }

    #[test]
    fn alarm_is_sent_with_the_board_unlocked() {
        let session = SharedSession::new();
        let mut link = ReentrantLink {
            session: &session,
            seen: None,
        };
        let hot = AlarmRecord::new(AlarmSource::Temperature, 5_000, 9_900);

        let outcome = session.post_alarms(
            &mut link,
            &[(AlarmChannel::Thermal, hot), (AlarmChannel::Fod, AlarmRecord::CLEAR)],
        );

        assert_eq!(outcome, TransmitOutcome::Sent { attempts: 1 });
        assert_eq!(link.seen, Some(hot));
        assert_eq!(session.last_sent_alarm(), hot);
    }

    #[test]
    fn failed_alarm_is_retried_on_next_post() {
        struct Dead;

        impl AlarmLink for Dead {
            fn send_alarm(&mut self, _frame: &AlarmFrame) -> Result<(), HalError> {
                Err(HalError::Nack)
            }
        }

        let session = SharedSession::new();
        let hot = AlarmRecord::new(AlarmSource::Temperature, 5_000, 9_900);
        assert_eq!(
            session.post_alarm(&mut Dead, AlarmChannel::Thermal, hot),
            TransmitOutcome::Failed(HalError::Nack)
        );
        assert!(session.last_sent_alarm().is_clear());

        let mut link = CountingLink::default();
        session.post_alarm(&mut link, AlarmChannel::Thermal, hot);
        assert_eq!(link.sent, 1);
    }

    #[test]
    fn service_ready_reports_previous_value() {
        let session = SharedSession::new();
        assert!(!session.set_service_ready(true));
        assert!(session.set_service_ready(false));
        assert!(!session.service_ready());
    }

    #[test]
    fn instant_durations_saturate() {
        let early = RuntimeInstant::from_millis(10);
        let late = RuntimeInstant::from_millis(250);
        assert_eq!(
            late.saturating_duration_since(early),
            core::time::Duration::from_millis(240)
        );
        assert_eq!(early.saturating_duration_since(late), core::time::Duration::ZERO);
    }
}
