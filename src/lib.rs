pub mod alert;
pub mod api;
pub mod config;
pub mod error;
pub mod persist;
pub mod telemetry;
pub mod trend;
pub mod ws;

// Re-export commonly used items
pub use alert::{AlertNotifier, AlertResetPolicy, AlertSink, LogNotifier};
pub use api::TrendClient;
pub use config::Config;
pub use error::{AppError, Result};
pub use persist::{JsonFileStore, NoopStore, Snapshot, SnapshotStore};
pub use telemetry::{normalize, Reading, SeriesBuffer, SeriesPoint};
pub use trend::{TrendCache, TrendKind};
pub use ws::{ConnectionManager, ConnectionState, MonitorEvent};
