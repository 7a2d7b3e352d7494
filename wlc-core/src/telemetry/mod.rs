//! Telemetry event catalog and the in-memory history ring.
//!
//! Events carry compact numeric codes so they can be mirrored over any
//! diagnostics channel. Payloads keep the extra detail the console and
//! transcript tooling print, while staying `no_std` compatible.

#![cfg_attr(not(test), allow(dead_code))]

use core::{fmt, time::Duration};

use heapless::{HistoryBuf, OldestOrdered};

use crate::alarm::AlarmRecord;
use crate::auth::AuthOutcome;
use crate::limits::{PowerCeiling, PowerLimitSource};
use crate::modes::{IconClass, ModeId};
use crate::stage::ChargeStage;

/// Identifier assigned to each recorded event.
pub type EventId = u32;

/// Discriminated telemetry events.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TelemetryEventKind {
    StageEntered(ChargeStage),
    LimitAsserted(PowerLimitSource),
    LimitCleared(PowerLimitSource),
    ModeSelected(ModeId),
    SetpointApplied,
    AuthCompleted,
    TxAlarmReceived,
    IconChanged(IconClass),
    SampleMissed,
    Disconnected,
    Custom(u16),
}

impl fmt::Display for TelemetryEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryEventKind::StageEntered(stage) => write!(f, "stage-entered {stage}"),
            TelemetryEventKind::LimitAsserted(source) => write!(f, "limit-asserted {source}"),
            TelemetryEventKind::LimitCleared(source) => write!(f, "limit-cleared {source}"),
            TelemetryEventKind::ModeSelected(id) => write!(f, "mode-selected {id}"),
            TelemetryEventKind::SetpointApplied => f.write_str("setpoint-applied"),
            TelemetryEventKind::AuthCompleted => f.write_str("auth-completed"),
            TelemetryEventKind::TxAlarmReceived => f.write_str("tx-alarm-received"),
            TelemetryEventKind::IconChanged(icon) => write!(f, "icon-changed {icon}"),
            TelemetryEventKind::SampleMissed => f.write_str("sample-missed"),
            TelemetryEventKind::Disconnected => f.write_str("disconnected"),
            TelemetryEventKind::Custom(code) => write!(f, "custom({code})"),
        }
    }
}

impl TelemetryEventKind {
    const STAGE_BASE: u16 = 0x0000;
    const LIMIT_ASSERT_BASE: u16 = 0x0010;
    const LIMIT_CLEAR_BASE: u16 = 0x0020;
    const MODE_BASE: u16 = 0x0030;
    const SETPOINT_CODE: u16 = 0x0040;
    const AUTH_CODE: u16 = 0x0041;
    const ALARM_CODE: u16 = 0x0042;
    const SAMPLE_MISSED_CODE: u16 = 0x0043;
    const DISCONNECTED_CODE: u16 = 0x0044;
    const ICON_BASE: u16 = 0x0050;
    const ICON_SPAN: u16 = 0x0010;
    const MODE_SPAN: u16 = 0x0010;

    /// Encodes the event into a compact transport-friendly discriminant.
    #[must_use]
    pub const fn to_raw(self) -> u16 {
        match self {
            TelemetryEventKind::StageEntered(stage) => Self::STAGE_BASE + stage.as_index() as u16,
            TelemetryEventKind::LimitAsserted(source) => {
                Self::LIMIT_ASSERT_BASE + source.as_index() as u16
            }
            TelemetryEventKind::LimitCleared(source) => {
                Self::LIMIT_CLEAR_BASE + source.as_index() as u16
            }
            TelemetryEventKind::ModeSelected(id) => Self::MODE_BASE + id as u16,
            TelemetryEventKind::SetpointApplied => Self::SETPOINT_CODE,
            TelemetryEventKind::AuthCompleted => Self::AUTH_CODE,
            TelemetryEventKind::TxAlarmReceived => Self::ALARM_CODE,
            TelemetryEventKind::IconChanged(icon) => Self::ICON_BASE + icon.as_index() as u16,
            TelemetryEventKind::SampleMissed => Self::SAMPLE_MISSED_CODE,
            TelemetryEventKind::Disconnected => Self::DISCONNECTED_CODE,
            TelemetryEventKind::Custom(code) => code,
        }
    }

    /// Decodes a raw discriminant, falling back to [`TelemetryEventKind::Custom`].
    #[must_use]
    pub fn from_raw(code: u16) -> Self {
        match code {
            Self::SETPOINT_CODE => TelemetryEventKind::SetpointApplied,
            Self::AUTH_CODE => TelemetryEventKind::AuthCompleted,
            Self::ALARM_CODE => TelemetryEventKind::TxAlarmReceived,
            Self::SAMPLE_MISSED_CODE => TelemetryEventKind::SampleMissed,
            Self::DISCONNECTED_CODE => TelemetryEventKind::Disconnected,
            value if (Self::STAGE_BASE..Self::LIMIT_ASSERT_BASE).contains(&value) => {
                offset_u8(value - Self::STAGE_BASE)
                    .and_then(ChargeStage::from_index)
                    .map_or(TelemetryEventKind::Custom(value), |stage| {
                        TelemetryEventKind::StageEntered(stage)
                    })
            }
            value if (Self::LIMIT_ASSERT_BASE..Self::LIMIT_CLEAR_BASE).contains(&value) => {
                offset_u8(value - Self::LIMIT_ASSERT_BASE)
                    .and_then(PowerLimitSource::from_index)
                    .map_or(TelemetryEventKind::Custom(value), |source| {
                        TelemetryEventKind::LimitAsserted(source)
                    })
            }
            value if (Self::LIMIT_CLEAR_BASE..Self::MODE_BASE).contains(&value) => {
                offset_u8(value - Self::LIMIT_CLEAR_BASE)
                    .and_then(PowerLimitSource::from_index)
                    .map_or(TelemetryEventKind::Custom(value), |source| {
                        TelemetryEventKind::LimitCleared(source)
                    })
            }
            value if (Self::MODE_BASE..Self::MODE_BASE + Self::MODE_SPAN).contains(&value) => {
                offset_u8(value - Self::MODE_BASE).map_or(TelemetryEventKind::Custom(value), |id| {
                    TelemetryEventKind::ModeSelected(id)
                })
            }
            value if (Self::ICON_BASE..Self::ICON_BASE + Self::ICON_SPAN).contains(&value) => {
                offset_u8(value - Self::ICON_BASE)
                    .and_then(IconClass::from_index)
                    .map_or(TelemetryEventKind::Custom(value), |icon| {
                        TelemetryEventKind::IconChanged(icon)
                    })
            }
            other => TelemetryEventKind::Custom(other),
        }
    }
}

fn offset_u8(offset: u16) -> Option<u8> {
    u8::try_from(offset).ok()
}

/// Payloads carried alongside telemetry events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TelemetryPayload {
    None,
    Stage(StageTelemetry),
    Setpoint(PowerCeiling),
    Auth(AuthOutcome),
    Alarm(AlarmRecord),
}

impl TelemetryPayload {
    #[must_use]
    pub const fn none() -> Self {
        TelemetryPayload::None
    }
}

/// Stage transition payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StageTelemetry {
    pub from: ChargeStage,
    pub dwell: Option<Duration>,
}

/// Total number of telemetry entries retained in memory.
pub const TELEMETRY_RING_CAPACITY: usize = 64;

/// Trait implemented by monotonic instant wrappers used for telemetry tracking.
pub trait TelemetryInstant: Copy {
    /// Returns the saturating duration from `earlier` to `self`.
    fn saturating_duration_since(&self, earlier: Self) -> Duration;
}

/// Telemetry record stored in the ring buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TelemetryRecord<TInstant>
where
    TInstant: Copy,
{
    pub id: EventId,
    pub timestamp: TInstant,
    pub event: TelemetryEventKind,
    pub details: TelemetryPayload,
}

/// Telemetry ring buffer type alias.
pub type TelemetryRing<TInstant, const CAPACITY: usize = TELEMETRY_RING_CAPACITY> =
    HistoryBuf<TelemetryRecord<TInstant>, CAPACITY>;

/// Records telemetry events into a fixed-size ring buffer.
pub struct TelemetryRecorder<TInstant, const CAPACITY: usize = TELEMETRY_RING_CAPACITY>
where
    TInstant: Copy,
{
    ring: TelemetryRing<TInstant, CAPACITY>,
    last_stage: Option<(ChargeStage, TInstant)>,
    next_event_id: EventId,
}

impl<TInstant, const CAPACITY: usize> TelemetryRecorder<TInstant, CAPACITY>
where
    TInstant: Copy + TelemetryInstant,
{
    /// Creates a new telemetry recorder with an empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            last_stage: None,
            next_event_id: 0,
        }
    }

    /// Returns an iterator over the recorded telemetry in chronological order.
    pub fn oldest_first(&self) -> OldestOrdered<'_, TelemetryRecord<TInstant>> {
        self.ring.oldest_ordered()
    }

    /// Returns the most recent telemetry record, if available.
    pub fn latest(&self) -> Option<&TelemetryRecord<TInstant>> {
        self.ring.recent()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Records a stage transition with the dwell time of the previous stage.
    pub fn record_stage(&mut self, stage: ChargeStage, timestamp: TInstant) -> EventId {
        let (from, dwell) = match self.last_stage {
            Some((previous, entered)) => (
                previous,
                Some(timestamp.saturating_duration_since(entered)),
            ),
            None => (ChargeStage::Default, None),
        };
        self.last_stage = Some((stage, timestamp));

        self.record(
            TelemetryEventKind::StageEntered(stage),
            TelemetryPayload::Stage(StageTelemetry { from, dwell }),
            timestamp,
        )
    }

    pub fn record_limit(
        &mut self,
        source: PowerLimitSource,
        asserted: bool,
        timestamp: TInstant,
    ) -> EventId {
        let event = if asserted {
            TelemetryEventKind::LimitAsserted(source)
        } else {
            TelemetryEventKind::LimitCleared(source)
        };
        self.record(event, TelemetryPayload::none(), timestamp)
    }

    pub fn record_mode(
        &mut self,
        id: ModeId,
        setpoint: PowerCeiling,
        timestamp: TInstant,
    ) -> EventId {
        self.record(
            TelemetryEventKind::ModeSelected(id),
            TelemetryPayload::Setpoint(setpoint),
            timestamp,
        )
    }

    pub fn record_setpoint(&mut self, setpoint: PowerCeiling, timestamp: TInstant) -> EventId {
        self.record(
            TelemetryEventKind::SetpointApplied,
            TelemetryPayload::Setpoint(setpoint),
            timestamp,
        )
    }

    pub fn record_auth(&mut self, outcome: AuthOutcome, timestamp: TInstant) -> EventId {
        self.record(
            TelemetryEventKind::AuthCompleted,
            TelemetryPayload::Auth(outcome),
            timestamp,
        )
    }

    /// Records an alarm frame received from the transmitter.
    pub fn record_tx_alarm(&mut self, record: AlarmRecord, timestamp: TInstant) -> EventId {
        self.record(
            TelemetryEventKind::TxAlarmReceived,
            TelemetryPayload::Alarm(record),
            timestamp,
        )
    }

    pub fn record_icon(&mut self, icon: IconClass, timestamp: TInstant) -> EventId {
        self.record(
            TelemetryEventKind::IconChanged(icon),
            TelemetryPayload::none(),
            timestamp,
        )
    }

    /// Records a disconnect and forgets the stage dwell baseline.
    pub fn record_disconnect(&mut self, timestamp: TInstant) -> EventId {
        self.last_stage = None;
        self.record(
            TelemetryEventKind::Disconnected,
            TelemetryPayload::none(),
            timestamp,
        )
    }

    /// Records an arbitrary telemetry event with the supplied payload.
    pub fn record(
        &mut self,
        event: TelemetryEventKind,
        payload: TelemetryPayload,
        timestamp: TInstant,
    ) -> EventId {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);

        self.ring.write(TelemetryRecord {
            id,
            timestamp,
            event,
            details: payload,
        });

        id
    }
}

impl<TInstant, const CAPACITY: usize> Default for TelemetryRecorder<TInstant, CAPACITY>
where
    TInstant: Copy + TelemetryInstant,
{
    fn default() -> Self {
        Self::new()
    }
}
