//! Periodic monitor tasks and their stop/drain handshake.

use embassy_futures::select::{Either, select};
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};
use wlc_core::alarm::{
    AlarmChannel, AlarmRecord, FodMonitor, FodRow, ThermalBand, TimeAlarmRow, TransmitOutcome,
    TxAlarmGenerator,
};
use wlc_core::controller::{ProtectionMonitor, ProtectionVerdict};
use wlc_core::hal::{AlarmLink, TelemetrySource};

use crate::session::{RuntimeInstant, SessionMutex, SharedSession, to_embassy};

/// Stop request and drain acknowledgement for one task.
///
/// [`shutdown`](Self::shutdown) only returns once the task has left its loop,
/// so no cycle is half-applied when the session is torn down.
pub struct TaskControl {
    stop: Signal<SessionMutex, ()>,
    done: Signal<SessionMutex, ()>,
}

impl TaskControl {
    pub const fn new() -> Self {
        Self {
            stop: Signal::new(),
            done: Signal::new(),
        }
    }

    /// Requests a stop and waits for the task to drain.
    pub async fn shutdown(&self) {
        self.stop.signal(());
        self.done.wait().await;
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.signaled()
    }

    /// Clears both signals before the task is started again.
    pub fn rearm(&self) {
        self.stop.reset();
        self.done.reset();
    }

    /// Sleeps for `interval`. Returns `true` when a stop arrived instead.
    pub async fn sleep(&self, interval: Duration) -> bool {
        matches!(
            select(self.stop.wait(), Timer::after(interval)).await,
            Either::First(())
        )
    }

    /// Parks until a stop arrives.
    pub async fn wait_stop(&self) {
        self.stop.wait().await;
    }

    /// Acknowledges that the task left its loop.
    pub fn finish(&self) {
        self.done.signal(());
    }
}

impl Default for TaskControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive-side protection: battery temperature drives the thermal limit.
pub struct ProtectionTask<'a, S> {
    session: &'a SharedSession,
    monitor: ProtectionMonitor,
    sensors: S,
    interval: Duration,
}

impl<'a, S> ProtectionTask<'a, S>
where
    S: TelemetrySource,
{
    pub fn new(
        session: &'a SharedSession,
        bands: &[ThermalBand],
        sensors: S,
        interval: core::time::Duration,
    ) -> Self {
        Self {
            session,
            monitor: ProtectionMonitor::new(bands),
            sensors,
            interval: to_embassy(interval),
        }
    }

    pub fn sensors_mut(&mut self) -> &mut S {
        &mut self.sensors
    }

    /// Forgets the band history so the next sample is treated as the first.
    pub fn reset(&mut self) {
        self.monitor.reset();
    }

    /// Runs one cycle. A failed read skips the cycle and returns `None`.
    pub fn poll_once<L: AlarmLink>(&mut self, link: &mut L) -> Option<ProtectionVerdict> {
        let Ok(sample) = self.sensors.sample() else {
            log_sample_skipped("protection");
            return None;
        };

        let verdict = self
            .session
            .with_limits(|limits| self.monitor.check(sample.battery_temp_dc, limits));
        if verdict.band_changed {
            log_thermal_band(sample.battery_temp_dc, !verdict.record.is_clear());
        }
        let outcome = self
            .session
            .post_alarm(link, AlarmChannel::Thermal, verdict.record);
        log_transmit("thermal", &verdict.record, outcome);
        Some(verdict)
    }

    /// Polls every interval until `control` requests a stop.
    pub async fn run<L: AlarmLink>(&mut self, link: &mut L, control: &TaskControl) {
        loop {
            let _ = self.poll_once(link);
            if control.sleep(self.interval).await {
                break;
            }
        }
        control.finish();
    }
}

/// Receive-side foreign-object monitor.
pub struct AlarmTask<'a, S> {
    session: &'a SharedSession,
    fod: FodMonitor<RuntimeInstant>,
    sensors: S,
    interval: Duration,
}

impl<'a, S> AlarmTask<'a, S>
where
    S: TelemetrySource,
{
    pub fn new(
        session: &'a SharedSession,
        rows: &[FodRow],
        debounce: core::time::Duration,
        sensors: S,
        interval: core::time::Duration,
    ) -> Self {
        Self {
            session,
            fod: FodMonitor::new(rows, debounce),
            sensors,
            interval: to_embassy(interval),
        }
    }

    pub fn sensors_mut(&mut self) -> &mut S {
        &mut self.sensors
    }

    pub fn record(&self) -> AlarmRecord {
        self.fod.record()
    }

    pub fn reset(&mut self) {
        self.fod.reset();
    }

    /// Runs one cycle and returns the delay before the next one.
    ///
    /// The confirmed row's re-poll delay applies only to the cycle that put
    /// its alarm on the wire; every other cycle uses the default interval.
    pub fn poll_once<L: AlarmLink>(&mut self, link: &mut L, now: RuntimeInstant) -> Duration {
        let Ok(sample) = self.sensors.power_loss() else {
            log_sample_skipped("fod");
            return self.interval;
        };

        let verdict = self.fod.classify(&sample, now);
        let outcome = self
            .session
            .post_alarm(link, AlarmChannel::Fod, verdict.record);
        log_transmit("fod", &verdict.record, outcome);
        next_delay(verdict.confirmed_repoll, outcome, self.interval)
    }

    pub async fn run<L: AlarmLink>(&mut self, link: &mut L, control: &TaskControl) {
        loop {
            let delay = self.poll_once(link, RuntimeInstant::now());
            if control.sleep(delay).await {
                break;
            }
        }
        control.finish();
    }
}

/// Reverse-charging alarm monitor: elapsed time, battery temperature and
/// foreign objects, merged into one alarm.
pub struct TxAlarmTask<'a, S> {
    session: &'a SharedSession,
    generator: TxAlarmGenerator<RuntimeInstant>,
    sensors: S,
    interval: Duration,
}

impl<'a, S> TxAlarmTask<'a, S>
where
    S: TelemetrySource,
{
    pub fn new(
        session: &'a SharedSession,
        fod_rows: &[FodRow],
        fod_debounce: core::time::Duration,
        battery_bands: &[ThermalBand],
        time_rows: &[TimeAlarmRow],
        sensors: S,
        interval: core::time::Duration,
    ) -> Self {
        Self {
            session,
            generator: TxAlarmGenerator::new(fod_rows, fod_debounce, battery_bands, time_rows),
            sensors,
            interval: to_embassy(interval),
        }
    }

    pub fn sensors_mut(&mut self) -> &mut S {
        &mut self.sensors
    }

    /// Marks the start of power transfer.
    pub fn start(&mut self, now: RuntimeInstant) {
        self.generator.start(now);
    }

    pub fn reset(&mut self) {
        self.generator.reset();
    }

    /// Evaluates every generator and sends the merged alarm.
    ///
    /// Failed reads keep the previous record of the affected generator.
    pub fn poll_once<L: AlarmLink>(&mut self, link: &mut L, now: RuntimeInstant) -> Duration {
        let loss = self.sensors.power_loss().ok();
        let battery = self
            .sensors
            .sample()
            .ok()
            .map(|sample| sample.battery_temp_dc);
        if loss.is_none() && battery.is_none() {
            log_sample_skipped("tx-alarm");
        }

        let evaluation = self.generator.evaluate(loss.as_ref(), battery, now);
        let outcome = self.session.post_alarms(
            link,
            &[
                (AlarmChannel::Fod, evaluation.fod),
                (AlarmChannel::Thermal, evaluation.battery),
                (AlarmChannel::Time, evaluation.time),
            ],
        );
        log_transmit("tx-alarm", &evaluation.record, outcome);
        next_delay(evaluation.repoll, outcome, self.interval)
    }

    pub async fn run<L: AlarmLink>(&mut self, link: &mut L, control: &TaskControl) {
        self.start(RuntimeInstant::now());
        loop {
            let delay = self.poll_once(link, RuntimeInstant::now());
            if control.sleep(delay).await {
                break;
            }
        }
        control.finish();
    }
}

/// A row's re-poll delay only follows the cycle that delivered its alarm.
fn next_delay(
    repoll: Option<core::time::Duration>,
    outcome: TransmitOutcome,
    interval: Duration,
) -> Duration {
    match (repoll, outcome) {
        (Some(repoll), TransmitOutcome::Sent { .. }) => to_embassy(repoll),
        _ => interval,
    }
}

#[cfg(target_os = "none")]
fn log_sample_skipped(monitor: &'static str) {
    defmt::warn!("monitor:{} read failed, skipping cycle", monitor);
}

#[cfg(not(target_os = "none"))]
fn log_sample_skipped(_: &'static str) {}

#[cfg(target_os = "none")]
fn log_thermal_band(temp_dc: i16, limited: bool) {
    if limited {
        defmt::warn!("protection: battery {=i16} dC, thermal limit asserted", temp_dc);
    } else {
        defmt::info!("protection: battery {=i16} dC, thermal limit released", temp_dc);
    }
}

#[cfg(not(target_os = "none"))]
fn log_thermal_band(temp_dc: i16, limited: bool) {
    let state = if limited { "asserted" } else { "released" };
    println!("protection: battery {temp_dc} dC, thermal limit {state}");
}

#[cfg(target_os = "none")]
fn log_transmit(monitor: &'static str, record: &AlarmRecord, outcome: TransmitOutcome) {
    match outcome {
        TransmitOutcome::Sent { attempts } => defmt::info!(
            "alarm:{} sent sources={=u8:#x} plim={=u32}mW vlim={=u32}mV attempts={=u8}",
            monitor,
            record.sources.bits(),
            record.plim_mw,
            record.vlim_mv,
            attempts
        ),
        TransmitOutcome::Suppressed => {}
        TransmitOutcome::Failed(_) => defmt::error!(
            "alarm:{} send failed sources={=u8:#x}",
            monitor,
            record.sources.bits()
        ),
    }
}

#[cfg(not(target_os = "none"))]
fn log_transmit(monitor: &'static str, record: &AlarmRecord, outcome: TransmitOutcome) {
    match outcome {
        TransmitOutcome::Sent { attempts } => {
            println!("alarm:{monitor} sent {record} attempts={attempts}");
        }
        TransmitOutcome::Suppressed => {}
        TransmitOutcome::Failed(error) => {
            println!("alarm:{monitor} send failed {record} ({error})");
        }
    }
}
