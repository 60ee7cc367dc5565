//! Database record structures matching table schemas.

pub mod delivery_logs;
pub mod destinations;
pub mod download_links;
pub mod health;
pub mod queue;
pub mod secrets;
