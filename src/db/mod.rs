//! Database layer for data persistence and access.
//!
//! This module implements the data access layer using SQLx with PostgreSQL.
//! It follows the Repository pattern to provide clean abstractions over database operations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐
//! │  Queue       │  (queue processor, facade)
//! │  Processor   │
//! └──────┬──────┘
//!        │
//!        ↓
//! ┌─────────────┐
//! │ Repositories│  (db::handlers - business logic & queries)
//! └──────┬──────┘
//!        │
//!        ↓
//! ┌─────────────┐
//! │   Models    │  (db::models - database records)
//! └──────┬──────┘
//!        │
//!        ↓
//! ┌─────────────┐
//! │  PostgreSQL │
//! └─────────────┘
//! ```
//!
//! # Repository Pattern
//!
//! The [`handlers`] module provides repository structs for each persisted entity
//! family (destinations, queue items, delivery logs, health, secrets, download
//! links). Repositories encapsulate all database access for their entity.
//!
//! ## Example Usage
//!
//! ```ignore
//! use delivery_core::db::handlers::Destinations;
//!
//! async fn example(pool: &sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!     let mut destinations = Destinations::new(&mut tx);
//!     let dest = destinations.get_by_id(id).await?;
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Transactions
//!
//! Repositories work with SQLx transactions to ensure ACID properties. Create
//! repositories from a transaction for writes; the pool directly is fine for
//! read-only operations.
//!
//! # Migrations
//!
//! Database migrations are managed by SQLx and located in the `migrations/`
//! directory. [`crate::migrator`] provides access to the migrator.

pub mod errors;
pub mod handlers;
pub mod models;
pub mod pool;
