use super::reading::{coerce_number, coerce_text, Reading};
use super::{local_today, Today};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Maximum number of points kept in the realtime series
pub const SERIES_CAPACITY: usize = 300;

/// One `(timestamp, value)` sample; timestamp in ms since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub timestamp: i64,
    pub value: f64,
}

/// Input accepted as a sample value. Floats are taken as they are, so a
/// non-finite float is dropped rather than passing through JSON `null`.
pub trait SampleValue {
    fn to_sample(&self) -> f64;
}

impl SampleValue for f64 {
    fn to_sample(&self) -> f64 {
        *self
    }
}

impl SampleValue for &str {
    fn to_sample(&self) -> f64 {
        coerce_text(self)
    }
}

impl SampleValue for String {
    fn to_sample(&self) -> f64 {
        coerce_text(self)
    }
}

impl SampleValue for Value {
    fn to_sample(&self) -> f64 {
        coerce_number(self)
    }
}

impl SampleValue for &Value {
    fn to_sample(&self) -> f64 {
        coerce_number(self)
    }
}

/// Bounded, arrival-ordered buffer of recent samples plus the latest reading.
///
/// Everything is cleared when the calendar day changes; the check runs before
/// every mutation.
pub struct SeriesBuffer {
    points: VecDeque<SeriesPoint>,
    latest: Option<Reading>,
    last_saved_date: Option<NaiveDate>,
    today: Today,
}

impl SeriesBuffer {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(local_today))
    }

    pub fn with_clock(today: Today) -> Self {
        Self {
            points: VecDeque::with_capacity(SERIES_CAPACITY),
            latest: None,
            last_saved_date: None,
            today,
        }
    }

    /// Clear points and the latest reading if the stored day is not today.
    pub fn check_daily_reset(&mut self) {
        let today = (self.today)();
        if self.last_saved_date != Some(today) {
            debug!(
                previous = ?self.last_saved_date,
                today = %today,
                dropped = self.points.len(),
                "daily rollover of realtime series"
            );
            self.points.clear();
            self.latest = None;
            self.last_saved_date = Some(today);
        }
    }

    /// Append a sample. Values that do not coerce to a finite number are
    /// dropped silently; returns whether the point was kept.
    pub fn push_point<V: SampleValue>(&mut self, timestamp: i64, value: V) -> bool {
        self.check_daily_reset();

        let value = value.to_sample();
        if !value.is_finite() {
            return false;
        }

        self.points.push_back(SeriesPoint { timestamp, value });
        while self.points.len() > SERIES_CAPACITY {
            self.points.pop_front();
        }
        true
    }

    pub fn save_realtime(&mut self, reading: Reading) {
        self.check_daily_reset();
        self.latest = Some(reading);
    }

    /// Drop everything and stamp today, so the next mutation does not roll over again.
    pub fn clear(&mut self) {
        self.points.clear();
        self.latest = None;
        self.last_saved_date = Some((self.today)());
    }

    /// Replace the contents with previously persisted state, keeping the most
    /// recent points if there are more than fit.
    pub fn restore(
        &mut self,
        points: Vec<SeriesPoint>,
        latest: Option<Reading>,
        last_saved_date: Option<NaiveDate>,
    ) {
        let skip = points.len().saturating_sub(SERIES_CAPACITY);
        self.points = points
            .into_iter()
            .skip(skip)
            .filter(|p| p.value.is_finite())
            .collect();
        self.latest = latest;
        self.last_saved_date = last_saved_date;
    }

    pub fn points(&self) -> impl Iterator<Item = &SeriesPoint> + '_ {
        self.points.iter()
    }

    pub fn to_vec(&self) -> Vec<SeriesPoint> {
        self.points.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn latest(&self) -> Option<&Reading> {
        self.latest.as_ref()
    }

    pub fn last_saved_date(&self) -> Option<NaiveDate> {
        self.last_saved_date
    }
}

impl Default for SeriesBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SeriesBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeriesBuffer")
            .field("len", &self.points.len())
            .field("latest", &self.latest.is_some())
            .field("last_saved_date", &self.last_saved_date)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::normalize;
    use serde_json::json;
    use std::sync::Mutex;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    fn fixed_clock(start: NaiveDate) -> (Arc<Mutex<NaiveDate>>, Today) {
        let current = Arc::new(Mutex::new(start));
        let handle = current.clone();
        let clock: Today = Arc::new(move || *handle.lock().unwrap());
        (current, clock)
    }

    #[test]
    fn test_push_point_appends_in_arrival_order() {
        let (_, clock) = fixed_clock(day(1));
        let mut series = SeriesBuffer::with_clock(clock);

        assert!(series.push_point(1_000, 1.5));
        assert!(series.push_point(2_000, "2.5"));

        assert_eq!(
            series.to_vec(),
            vec![
                SeriesPoint { timestamp: 1_000, value: 1.5 },
                SeriesPoint { timestamp: 2_000, value: 2.5 },
            ]
        );
    }

    #[test]
    fn test_non_numeric_value_is_dropped() {
        let (_, clock) = fixed_clock(day(1));
        let mut series = SeriesBuffer::with_clock(clock);
        series.push_point(500, 3.0);

        assert!(!series.push_point(1_000, "abc"));
        assert!(!series.push_point(1_000, json!({ "v": 1 })));
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn test_non_finite_floats_are_dropped_not_zeroed() {
        let (_, clock) = fixed_clock(day(1));
        let mut series = SeriesBuffer::with_clock(clock);

        assert!(!series.push_point(1_000, f64::NAN));
        assert!(!series.push_point(2_000, f64::INFINITY));
        assert!(!series.push_point(3_000, f64::NEG_INFINITY));

        assert!(series.is_empty());
        assert!(series.push_point(4_000, 0.0));
        assert_eq!(series.to_vec(), vec![SeriesPoint { timestamp: 4_000, value: 0.0 }]);
    }

    #[test]
    fn test_json_values_are_coerced() {
        let (_, clock) = fixed_clock(day(1));
        let mut series = SeriesBuffer::with_clock(clock);

        assert!(series.push_point(1, json!("7.25")));
        assert!(series.push_point(2, &json!(3)));
        assert!(series.push_point(3, String::from(" 4 ")));

        let values: Vec<f64> = series.points().map(|p| p.value).collect();
        assert_eq!(values, vec![7.25, 3.0, 4.0]);
    }

    #[test]
    fn test_capacity_keeps_most_recent_points() {
        let (_, clock) = fixed_clock(day(1));
        let mut series = SeriesBuffer::with_clock(clock);

        for i in 0..(SERIES_CAPACITY as i64 + 45) {
            series.push_point(i, i as f64);
        }

        assert_eq!(series.len(), SERIES_CAPACITY);
        let points = series.to_vec();
        assert_eq!(points[0].timestamp, 45);
        assert_eq!(points[SERIES_CAPACITY - 1].timestamp, SERIES_CAPACITY as i64 + 44);
        assert!(points.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_first_push_of_new_day_clears_previous_points() {
        let (current, clock) = fixed_clock(day(1));
        let mut series = SeriesBuffer::with_clock(clock);
        series.push_point(1, 1.0);
        series.push_point(2, 2.0);
        series.save_realtime(normalize(&json!({ "power_w": 2 })).unwrap());

        *current.lock().unwrap() = day(2);
        series.push_point(3, 3.0);

        assert_eq!(series.to_vec(), vec![SeriesPoint { timestamp: 3, value: 3.0 }]);
        assert!(series.latest().is_none());
        assert_eq!(series.last_saved_date(), Some(day(2)));
    }

    #[test]
    fn test_save_realtime_rolls_over_first() {
        let (current, clock) = fixed_clock(day(1));
        let mut series = SeriesBuffer::with_clock(clock);
        series.push_point(1, 1.0);

        *current.lock().unwrap() = day(2);
        series.save_realtime(normalize(&json!({ "power_w": 9 })).unwrap());

        assert!(series.is_empty());
        assert_eq!(series.latest().map(|r| r.power_w), Some(9.0));
    }

    #[test]
    fn test_clear_stamps_today() {
        let (_, clock) = fixed_clock(day(4));
        let mut series = SeriesBuffer::with_clock(clock);
        series.push_point(1, 1.0);

        series.clear();

        assert!(series.is_empty());
        assert!(series.latest().is_none());
        assert_eq!(series.last_saved_date(), Some(day(4)));
    }

    #[test]
    fn test_restore_trims_and_keeps_stale_date() {
        let (_, clock) = fixed_clock(day(2));
        let mut series = SeriesBuffer::with_clock(clock);
        let points: Vec<_> = (0..310)
            .map(|i| SeriesPoint { timestamp: i, value: 1.0 })
            .collect();

        series.restore(points, None, Some(day(1)));
        assert_eq!(series.len(), SERIES_CAPACITY);
        assert_eq!(series.to_vec()[0].timestamp, 10);

        // stale day: next mutation rolls over
        series.push_point(999, 1.0);
        assert_eq!(series.len(), 1);
    }
}
