pub mod connection;
pub mod protocol;

pub use connection::{ConnectionManager, ConnectionState, MonitorEvent};
pub use protocol::{endpoint_url, validate_target_id, InboundFrame, OutboundFrame};
