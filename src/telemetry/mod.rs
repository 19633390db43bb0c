//! Telemetry data model: normalized readings and the bounded realtime series.

pub mod reading;
pub mod series;

pub use reading::{normalize, Reading, TOTAL_KEY};
pub use series::{SampleValue, SeriesBuffer, SeriesPoint, SERIES_CAPACITY};

use chrono::NaiveDate;
use std::sync::Arc;

/// Source of the current calendar day, injectable so rollover can be tested.
pub type Today = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

/// Current calendar day in local time.
pub fn local_today() -> NaiveDate {
    chrono::Local::now().date_naive()
}
