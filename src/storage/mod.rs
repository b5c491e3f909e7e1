//! Storage backends for alarm records and measurements
//!
//! The engine talks to storage through two traits, [`AlarmRepository`] and
//! [`MeasurementStore`], so the backend can be swapped without touching the
//! evaluation path.
//!
//! ## Backends
//!
//! - **SQLite** (default, feature `storage-sqlite`): embedded database with
//!   WAL mode and migrations
//! - **In-Memory**: no persistence, for tests or running without a database
//!
//! ## Usage
//!
//! ```no_run
//! use telemetry_alarms::storage::sqlite::SqliteBackend;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::new("./alarms.db").await?;
//!     backend.close().await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
#[cfg(feature = "storage-sqlite")]
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{AlarmRepository, HISTORY_PAGE, MeasurementStore};
pub use error::{StorageError, StorageResult};
