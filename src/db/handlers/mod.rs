//! Repository implementations for database access.
//!
//! Each repository wraps a borrowed SQLx connection or transaction and provides
//! strongly-typed operations over one entity family from [`crate::db::models`].
//!
//! # Common Pattern
//!
//! ```ignore
//! use delivery_core::db::handlers::Destinations;
//!
//! async fn example(pool: &sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!     let mut destinations = Destinations::new(&mut tx);
//!     let dest = destinations.create(&request).await?;
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

pub mod delivery_logs;
pub mod destinations;
pub mod download_links;
pub mod health;
pub mod queue;
pub mod secrets;

pub use delivery_logs::DeliveryLogs;
pub use destinations::Destinations;
pub use download_links::DownloadLinks;
pub use health::Health;
pub use queue::Queue;
pub use secrets::Secrets;
