//! # delivery-core: multi-protocol audit-event delivery
//!
//! A durable delivery subsystem for fanning out audit events to operator-configured
//! destinations: authenticated webhooks, email (SMTP or a hosted API provider), SFTP
//! upload, cloud object storage, and time-limited download links.
//!
//! ## Architecture
//!
//! Every delivery goes through a durable Postgres-backed queue (see [`db::models::queue`]);
//! there is no synchronous delivery path. A pool of [`queue_processor::QueueProcessor`]
//! workers claims ready rows, consults the [`health`] circuit breaker, dispatches to the
//! [`handlers`] implementation matching the destination's kind, and feeds the outcome back
//! through the [`retry`] manager.
//!
//! Webhook signing secrets are managed by [`secrets::SecretManager`] and are encrypted at
//! rest; plaintext is only ever held in memory for the duration of a single HMAC sign or
//! verify call. Email and SFTP destination bodies may be rendered from operator-supplied
//! templates via [`template::process_template`].
//!
//! [`facade::DeliveryService`] is the entry point most callers embed: it owns the
//! connection pool and every collaborator above, and exposes destination CRUD, validation,
//! health queries, and a `start`/`stop` lifecycle.
//!
//! ## Configuration
//!
//! See the [`config`] module: a YAML file merged with `DELIVERY_`-prefixed environment
//! variable overrides (see [`config::Config::load`]).

pub mod config;
pub mod db;
pub mod download;
pub mod errors;
pub mod facade;
pub mod handlers;
pub mod health;
pub mod queue_processor;
pub mod retry;
pub mod secrets;
pub mod telemetry;
pub mod template;
pub mod types;

pub use config::Config;
pub use errors::{Error, Result};
pub use facade::DeliveryService;

/// Embedded SQL migrations, applied via [`sqlx::migrate::Migrator::run`].
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
