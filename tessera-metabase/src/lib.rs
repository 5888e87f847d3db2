//! Tessera Metabase
//!
//! Object and segment metadata for the durability services.
//!
//! - [`MetabaseStore`]: point lookups, compare-and-swap piece updates,
//!   keyset scans and atomic object deletion
//! - [`MemoryMetabase`] and [`PostgresMetabase`] implementations
//! - [`MetabaseGc`]: cursor-paged deletion of expired and zombie objects
//! - [`GcChore`]: runs the collector on an interval
//!
//! # Usage
//!
//! ```ignore
//! use tessera_metabase::{DeleteExpiredObjects, MemoryMetabase, MetabaseGc};
//!
//! let store = Arc::new(MemoryMetabase::new());
//! let gc = MetabaseGc::new(store);
//! let report = gc
//!     .delete_expired_objects(DeleteExpiredObjects {
//!         expired_before: Utc::now(),
//!         as_of_system_time: None,
//!         batch_size: 100,
//!     })
//!     .await?;
//! ```

pub mod chore;
pub mod error;
pub mod gc;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use chore::{ChoreRun, GcChore, GcConfig};
pub use error::{MetabaseError, Result};
pub use gc::{
    clamp_batch_size, DeleteExpiredObjects, DeleteZombieObjects, GcPass, GcReport, MetabaseGc,
    UnitFailure, DELETE_BATCH_SIZE_LIMIT,
};
pub use memory::MemoryMetabase;
pub use models::*;
pub use postgres::{DbConfig, Dialect, PostgresMetabase};
pub use store::{MetabaseStore, ScanFilter, ScanQuery};
