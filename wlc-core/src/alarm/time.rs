//! Elapsed-time alarm rows for reverse charging sessions.

use core::time::Duration;

use heapless::Vec;

use super::{AlarmRecord, AlarmSource};

/// Upper bound on configured time rows.
pub const MAX_TIME_ROWS: usize = 4;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TimeAlarmRow {
    pub after: Duration,
    pub alarm: AlarmRecord,
}

impl TimeAlarmRow {
    pub const fn new(after: Duration, alarm: AlarmRecord) -> Self {
        Self { after, alarm }
    }
}

/// Selects the latest row whose threshold has elapsed.
#[derive(Clone, Debug)]
pub struct TimeAlarm {
    rows: Vec<TimeAlarmRow, MAX_TIME_ROWS>,
}

impl TimeAlarm {
    pub fn new(rows: &[TimeAlarmRow]) -> Self {
        let mut table = Vec::new();
        for row in rows.iter().take(MAX_TIME_ROWS) {
            // `take` bounds the iterator to the table capacity.
            let _ = table.push(*row);
        }
        Self { rows: table }
    }

    pub fn classify(&self, elapsed: Duration) -> AlarmRecord {
        self.rows
            .iter()
            .filter(|row| elapsed >= row.after)
            .max_by_key(|row| row.after)
            .map_or(AlarmRecord::CLEAR, |row| row.alarm)
    }
}

/// Reference rows: limit after one hour, tighten after two.
pub const DEFAULT_TIME_ROWS: [TimeAlarmRow; 2] = [
    TimeAlarmRow::new(
        Duration::from_secs(3_600),
        AlarmRecord::new(AlarmSource::Time, 7_500, 9_000),
    ),
    TimeAlarmRow::new(
        Duration::from_secs(7_200),
        AlarmRecord::new(AlarmSource::Time, 5_000, 9_000),
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_latest_elapsed_row() {
        let alarm = TimeAlarm::new(&DEFAULT_TIME_ROWS);
        assert!(alarm.classify(Duration::from_secs(10)).is_clear());
        assert_eq!(
            alarm.classify(Duration::from_secs(5_000)),
            DEFAULT_TIME_ROWS[0].alarm
        );
        assert_eq!(
            alarm.classify(Duration::from_secs(9_000)),
            DEFAULT_TIME_ROWS[1].alarm
        );
    }
}
