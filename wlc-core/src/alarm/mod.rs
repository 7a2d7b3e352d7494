//! Alarm records, their wire encoding, and the de-duplicating transmitter.
//!
//! Every alarm generator (foreign-object, battery temperature, elapsed time)
//! produces an [`AlarmRecord`]. Records are merged into the most restrictive
//! combination and sent through one [`AlarmTransmitter`], which suppresses
//! frames identical to the last one delivered.

pub mod fod;
pub mod thermal;
pub mod time;

use core::fmt;
use core::time::Duration;

use crate::hal::{AlarmLink, HalError, LossSample};
use crate::telemetry::TelemetryInstant;

pub use fod::{FodMonitor, FodRow, FodVerdict};
pub use thermal::{ThermalBand, ThermalClassifier};
pub use time::{TimeAlarm, TimeAlarmRow};

/// Encoded alarm length in bytes.
pub const ALARM_FRAME_LEN: usize = 4;

/// Power-limit quantization step.
pub const PLIM_STEP_MW: u32 = 500;

/// Voltage-limit quantization step.
pub const VLIM_STEP_MV: u32 = 100;

/// Attempts made per transmission before giving up until the next change.
pub const SEND_ATTEMPTS: u8 = 3;

/// Wire representation: source bitmask, power limit, voltage limit, reserved.
pub type AlarmFrame = [u8; ALARM_FRAME_LEN];

/// Reasons an alarm may be raised.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AlarmSource {
    Temperature,
    PowerLimit,
    Fan,
    Fod,
    Time,
    QValue,
}

impl AlarmSource {
    pub const fn bit(self) -> u8 {
        match self {
            AlarmSource::Temperature => 1 << 0,
            AlarmSource::PowerLimit => 1 << 1,
            AlarmSource::Fan => 1 << 2,
            AlarmSource::Fod => 1 << 3,
            AlarmSource::Time => 1 << 4,
            AlarmSource::QValue => 1 << 5,
        }
    }
}

/// Bitmask of [`AlarmSource`] values.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct AlarmSources(u8);

impl AlarmSources {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn single(source: AlarmSource) -> Self {
        Self(source.bit())
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, source: AlarmSource) -> bool {
        self.0 & source.bit() != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Limits a transmitter asks the receiver to respect.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct AlarmRecord {
    pub sources: AlarmSources,
    pub plim_mw: u32,
    pub vlim_mv: u32,
}

impl AlarmRecord {
    /// The "no alarm" record.
    pub const CLEAR: Self = Self {
        sources: AlarmSources::empty(),
        plim_mw: 0,
        vlim_mv: 0,
    };

    pub const fn new(source: AlarmSource, plim_mw: u32, vlim_mv: u32) -> Self {
        Self {
            sources: AlarmSources::single(source),
            plim_mw,
            vlim_mv,
        }
    }

    pub const fn is_clear(&self) -> bool {
        self.sources.is_empty()
    }

    /// Combines two records, keeping every source and the tighter limits.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        match (self.is_clear(), other.is_clear()) {
            (true, _) => other,
            (false, true) => self,
            (false, false) => Self {
                sources: self.sources.union(other.sources),
                plim_mw: self.plim_mw.min(other.plim_mw),
                vlim_mv: self.vlim_mv.min(other.vlim_mv),
            },
        }
    }

    /// Encodes the record. Limits are floor-quantized and saturate at one byte.
    pub fn encode(&self) -> AlarmFrame {
        [
            self.sources.bits(),
            quantize(self.plim_mw, PLIM_STEP_MW),
            quantize(self.vlim_mv, VLIM_STEP_MV),
            0,
        ]
    }

    /// Decodes a frame produced by [`AlarmRecord::encode`].
    pub fn decode(frame: &AlarmFrame) -> Self {
        Self {
            sources: AlarmSources::from_bits(frame[0]),
            plim_mw: u32::from(frame[1]) * PLIM_STEP_MW,
            vlim_mv: u32::from(frame[2]) * VLIM_STEP_MV,
        }
    }
}

fn quantize(value: u32, step: u32) -> u8 {
    u8::try_from(value / step).unwrap_or(u8::MAX)
}

impl fmt::Display for AlarmRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clear() {
            f.write_str("clear")
        } else {
            write!(
                f,
                "src={:#04x} plim={}mW vlim={}mV",
                self.sources.bits(),
                self.plim_mw,
                self.vlim_mv
            )
        }
    }
}

/// Result of one transmission request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransmitOutcome {
    Sent { attempts: u8 },
    /// Identical to the last delivered frame.
    Suppressed,
    Failed(HalError),
}

/// De-duplicating alarm sender shared by every alarm generator.
#[derive(Clone, Debug)]
pub struct AlarmTransmitter {
    last_sent: AlarmFrame,
    delivered: u32,
}

impl AlarmTransmitter {
    pub const fn new() -> Self {
        Self {
            last_sent: [0; ALARM_FRAME_LEN],
            delivered: 0,
        }
    }

    /// Sends `record` unless it encodes to the last delivered frame.
    ///
    /// A failed send leaves the last delivered frame untouched so the next
    /// call tries again.
    pub fn transmit<L: AlarmLink>(&mut self, link: &mut L, record: &AlarmRecord) -> TransmitOutcome {
        let Some(frame) = self.pending(record) else {
            return TransmitOutcome::Suppressed;
        };
        let outcome = send_frame(link, &frame);
        if matches!(outcome, TransmitOutcome::Sent { .. }) {
            self.confirm(frame);
        }
        outcome
    }

    /// Frame `record` would put on the wire, or `None` when it matches the
    /// last delivered one.
    pub fn pending(&self, record: &AlarmRecord) -> Option<AlarmFrame> {
        let frame = record.encode();
        (frame != self.last_sent).then_some(frame)
    }

    /// Marks `frame` as delivered.
    pub fn confirm(&mut self, frame: AlarmFrame) {
        self.last_sent = frame;
        self.delivered = self.delivered.wrapping_add(1);
    }

    /// Record most recently delivered to the link.
    pub fn last_sent(&self) -> AlarmRecord {
        AlarmRecord::decode(&self.last_sent)
    }

    /// Number of frames delivered since creation or reset.
    pub fn delivered(&self) -> u32 {
        self.delivered
    }

    /// Forgets delivery history, as at session start.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for AlarmTransmitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Puts `frame` on the link, retrying up to [`SEND_ATTEMPTS`] times.
pub fn send_frame<L: AlarmLink>(link: &mut L, frame: &AlarmFrame) -> TransmitOutcome {
    let mut last_error = HalError::Unavailable;
    for attempt in 1..=SEND_ATTEMPTS {
        match link.send_alarm(frame) {
            Ok(()) => return TransmitOutcome::Sent { attempts: attempt },
            Err(error) => last_error = error,
        }
    }
    TransmitOutcome::Failed(last_error)
}

/// Monitor slots feeding the shared transmitter.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AlarmChannel {
    Fod,
    Thermal,
    Time,
}

impl AlarmChannel {
    const COUNT: usize = 3;

    const fn as_index(self) -> usize {
        match self {
            AlarmChannel::Fod => 0,
            AlarmChannel::Thermal => 1,
            AlarmChannel::Time => 2,
        }
    }
}

/// Latest record per monitor, merged and sent through one transmitter.
#[derive(Clone, Debug, Default)]
pub struct AlarmBoard {
    records: [AlarmRecord; AlarmChannel::COUNT],
    transmitter: AlarmTransmitter,
}

impl AlarmBoard {
    pub const fn new() -> Self {
        Self {
            records: [AlarmRecord::CLEAR; AlarmChannel::COUNT],
            transmitter: AlarmTransmitter::new(),
        }
    }

    /// Replaces the record of `channel` and transmits the merged result.
    pub fn post<L: AlarmLink>(
        &mut self,
        link: &mut L,
        channel: AlarmChannel,
        record: AlarmRecord,
    ) -> TransmitOutcome {
        self.update(channel, record);
        self.flush(link)
    }

    /// Replaces the record of `channel` without sending anything.
    pub fn update(&mut self, channel: AlarmChannel, record: AlarmRecord) {
        self.records[channel.as_index()] = record;
    }

    /// Transmits the merged record of every channel.
    pub fn flush<L: AlarmLink>(&mut self, link: &mut L) -> TransmitOutcome {
        let merged = self.merged();
        self.transmitter.transmit(link, &merged)
    }

    /// Frame the merged record would put on the wire, if it differs from
    /// the last delivered one.
    pub fn pending(&self) -> Option<AlarmFrame> {
        self.transmitter.pending(&self.merged())
    }

    /// Marks `frame` as delivered.
    pub fn confirm(&mut self, frame: AlarmFrame) {
        self.transmitter.confirm(frame);
    }

    pub fn record(&self, channel: AlarmChannel) -> AlarmRecord {
        self.records[channel.as_index()]
    }

    pub fn merged(&self) -> AlarmRecord {
        self.records
            .iter()
            .fold(AlarmRecord::CLEAR, |acc, record| acc.merge(*record))
    }

    pub fn transmitter(&self) -> &AlarmTransmitter {
        &self.transmitter
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Merged result of one reverse-charging alarm evaluation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TxAlarmEvaluation {
    pub record: AlarmRecord,
    pub fod: AlarmRecord,
    pub battery: AlarmRecord,
    pub time: AlarmRecord,
    /// Re-poll delay of a foreign-object row confirmed by this evaluation.
    pub repoll: Option<Duration>,
}

/// Combines the time, battery-temperature, and foreign-object generators.
#[derive(Clone, Debug)]
pub struct TxAlarmGenerator<I> {
    fod: FodMonitor<I>,
    battery: ThermalClassifier,
    time: TimeAlarm,
    started_at: Option<I>,
}

impl<I> TxAlarmGenerator<I>
where
    I: TelemetryInstant,
{
    pub fn new(
        fod_rows: &[FodRow],
        fod_debounce: Duration,
        battery_bands: &[ThermalBand],
        time_rows: &[TimeAlarmRow],
    ) -> Self {
        Self {
            fod: FodMonitor::new(fod_rows, fod_debounce),
            battery: ThermalClassifier::new(battery_bands),
            time: TimeAlarm::new(time_rows),
            started_at: None,
        }
    }

    /// Marks the start of power transfer. Elapsed-time rows count from here.
    pub fn start(&mut self, now: I) {
        self.started_at = Some(now);
    }

    /// Clears every generator for a new session.
    pub fn reset(&mut self) {
        self.fod.reset();
        self.battery.reset();
        self.started_at = None;
    }

    /// Evaluates every generator. `None` readings keep that generator's
    /// previous record.
    pub fn evaluate(
        &mut self,
        loss: Option<&LossSample>,
        battery_temp_dc: Option<i16>,
        now: I,
    ) -> TxAlarmEvaluation {
        let repoll = loss.and_then(|sample| self.fod.classify(sample, now).confirmed_repoll);
        if let Some(temp) = battery_temp_dc {
            let _ = self.battery.classify(temp);
        }
        let elapsed = self
            .started_at
            .map_or(Duration::ZERO, |start| now.saturating_duration_since(start));

        let fod = self.fod.record();
        let battery = self.battery.record();
        let time = self.time.classify(elapsed);
        TxAlarmEvaluation {
            record: fod.merge(battery).merge(time),
            fod,
            battery,
            time,
            repoll,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapless::Vec;

    #[derive(Default)]
    struct RecordingLink {
        frames: Vec<AlarmFrame, 8>,
        failures_left: u8,
    }

    impl AlarmLink for RecordingLink {
        fn send_alarm(&mut self, frame: &AlarmFrame) -> Result<(), HalError> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(HalError::Nack);
            }
            self.frames.push(*frame).map_err(|_| HalError::Unavailable)
        }
    }

    #[test]
    fn identical_record_is_sent_once() {
        let mut link = RecordingLink::default();
        let mut tx = AlarmTransmitter::new();
        let record = AlarmRecord::new(AlarmSource::Fod, 5_000, 9_000);

        assert_eq!(
            tx.transmit(&mut link, &record),
            TransmitOutcome::Sent { attempts: 1 }
        );
        assert_eq!(tx.transmit(&mut link, &record), TransmitOutcome::Suppressed);
        assert_eq!(link.frames.len(), 1);
    }

    #[test]
    fn clear_before_any_alarm_is_suppressed() {
        let mut link = RecordingLink::default();
        let mut tx = AlarmTransmitter::new();
        assert_eq!(
            tx.transmit(&mut link, &AlarmRecord::CLEAR),
            TransmitOutcome::Suppressed
        );
    }

    #[test]
    fn retries_then_reports_failure() {
        let mut link = RecordingLink {
            failures_left: 2,
            ..RecordingLink::default()
        };
        let mut tx = AlarmTransmitter::new();
        let record = AlarmRecord::new(AlarmSource::Temperature, 2_500, 5_000);
        assert_eq!(
            tx.transmit(&mut link, &record),
            TransmitOutcome::Sent { attempts: 3 }
        );

        link.failures_left = SEND_ATTEMPTS;
        let next = AlarmRecord::new(AlarmSource::Temperature, 1_000, 5_000);
        assert_eq!(
            tx.transmit(&mut link, &next),
            TransmitOutcome::Failed(HalError::Nack)
        );
        assert_eq!(tx.last_sent(), record);
    }

    #[test]
    fn merge_keeps_most_restrictive_limits() {
        let fod = AlarmRecord::new(AlarmSource::Fod, 7_500, 9_000);
        let temp = AlarmRecord::new(AlarmSource::Temperature, 10_000, 5_000);
        let merged = fod.merge(temp).merge(AlarmRecord::CLEAR);

        assert!(merged.sources.contains(AlarmSource::Fod));
        assert!(merged.sources.contains(AlarmSource::Temperature));
        assert_eq!(merged.plim_mw, 7_500);
        assert_eq!(merged.vlim_mv, 5_000);
    }

    #[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
    struct Secs(u64);

    impl TelemetryInstant for Secs {
        fn saturating_duration_since(&self, earlier: Self) -> Duration {
            Duration::from_secs(self.0.saturating_sub(earlier.0))
        }
    }

    #[test]
    fn generator_merges_every_source() {
        let mut generator = TxAlarmGenerator::new(
            &fod::DEFAULT_FOD_ROWS,
            Duration::ZERO,
            &thermal::DEFAULT_TX_BATTERY_BANDS,
            &time::DEFAULT_TIME_ROWS,
        );
        generator.start(Secs(0));

        let quiet = generator.evaluate(Some(&LossSample::default()), Some(250), Secs(1));
        assert!(quiet.record.is_clear());

        let heavy = LossSample {
            ploss_mw: 3_000,
            ..LossSample::default()
        };
        let busy = generator.evaluate(Some(&heavy), Some(420), Secs(4_000));
        assert!(busy.record.sources.contains(AlarmSource::Fod));
        assert!(busy.record.sources.contains(AlarmSource::Temperature));
        assert!(busy.record.sources.contains(AlarmSource::Time));
        assert_eq!(busy.record.plim_mw, 5_000);
        assert_eq!(busy.repoll, Some(Duration::from_secs(2)));

        let missing = generator.evaluate(None, None, Secs(4_001));
        assert_eq!(missing.record, busy.record);
        assert_eq!(missing.repoll, None);
    }

    #[test]
    fn encoding_floors_and_saturates() {
        let record = AlarmRecord::new(AlarmSource::PowerLimit, 1_499, 40_000);
        let frame = record.encode();
        assert_eq!(frame, [AlarmSource::PowerLimit.bit(), 2, u8::MAX, 0]);
        assert_eq!(AlarmRecord::decode(&frame).plim_mw, 1_000);
    }

    #[test]
    fn board_merges_channels_before_sending() {
        let mut link = RecordingLink::default();
        let mut board = AlarmBoard::new();
        let fod = AlarmRecord::new(AlarmSource::Fod, 7_500, 9_000);
        let hot = AlarmRecord::new(AlarmSource::Temperature, 5_000, 9_900);

        board.post(&mut link, AlarmChannel::Fod, fod);
        board.post(&mut link, AlarmChannel::Thermal, hot);
        let merged = board.merged();
        assert!(merged.sources.contains(AlarmSource::Fod));
        assert!(merged.sources.contains(AlarmSource::Temperature));
        assert_eq!(merged.plim_mw, 5_000);
        assert_eq!(merged.vlim_mv, 9_000);
        assert_eq!(link.frames.len(), 2);

        // Re-posting the same thermal record changes nothing on the wire.
        assert_eq!(
            board.post(&mut link, AlarmChannel::Thermal, hot),
            TransmitOutcome::Suppressed
        );
        assert_eq!(link.frames.len(), 2);
    }

    #[test]
    fn pending_frame_is_only_remembered_once_confirmed() {
        let mut board = AlarmBoard::new();
        assert_eq!(board.pending(), None);

        let fod = AlarmRecord::new(AlarmSource::Fod, 7_500, 9_000);
        board.update(AlarmChannel::Fod, fod);
        let frame = board.pending().expect("new record differs");
        assert_eq!(frame, fod.encode());
        assert_eq!(board.pending(), Some(frame));

        board.confirm(frame);
        assert_eq!(board.pending(), None);
        assert_eq!(board.transmitter().last_sent(), fod);
        assert_eq!(board.transmitter().delivered(), 1);
    }
}
