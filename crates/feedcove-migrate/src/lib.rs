//! Sequential schema upgrades for the Feedcove store.
//!
//! Feedcove keeps all client state in a single store stamped with a schema
//! version. This crate carries the full shipped history of upgrade steps
//! and a driver that walks a store from its stored version to
//! [`steps::CURRENT_VERSION`], one version at a time, in order.
//!
//! The history spans two storage representations:
//!
//! - **Object-graph era** (versions 2..=24) - the store is a list of typed
//!   records that once lived in a Python pickle. Steps mutate the record
//!   list in memory and report which records they touched.
//! - **Relational era** (versions 25..) - the store is a SQLite database.
//!   Steps run SQL, each wrapped in its own transaction together with the
//!   version bump, so a crash can lose at most the step in flight.
//!
//! # Components
//!
//! - **Driver** ([`driver`]) - validates the version range up front, then
//!   applies steps sequentially.
//! - **Steps** ([`steps`]) - the numbered history, split by era.
//! - **Rewrite** ([`rewrite`]) - the copy-rename-swap primitive for column
//!   changes SQLite's `ALTER TABLE` cannot express.
//! - **Legacy values** ([`legacy`]) - a narrow parser for the Python-2
//!   `repr()` strings the pickle conversion left embedded in columns.
//! - **Id pool** ([`idpool`]) - allocates object ids above everything in
//!   use, for steps that must mint rows.
//!
//! # Example
//!
//! ```rust,ignore
//! use feedcove_migrate::prelude::*;
//!
//! let registry = default_registry();
//! let stored = schema_version(&mut conn).await?.unwrap_or(FIRST_SQL_VERSION);
//! upgrade_database(
//!     &pool,
//!     &registry,
//!     stored,
//!     CURRENT_VERSION,
//!     &StepContext::plain(),
//!     &mut LogProgress,
//! )
//! .await?;
//! ```

pub mod context;
pub mod driver;
pub mod error;
pub mod globals;
pub mod idpool;
pub mod legacy;
pub mod progress;
pub mod record;
pub mod rewrite;
pub mod steps;
pub mod value;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::context::StepContext;
    pub use crate::driver::{
        upgrade_database, upgrade_object_store, Step, StepRegistry,
    };
    pub use crate::error::{MigrateError, Result};
    pub use crate::globals::{schema_version, set_schema_version};
    pub use crate::progress::{LogProgress, NullProgress, ProgressObserver};
    pub use crate::record::{ChangedSet, ObjectStore, Record};
    pub use crate::steps::{
        default_registry, CURRENT_VERSION, FIRST_SQL_VERSION, FIRST_VERSION, LAST_OBJECT_VERSION,
    };
    pub use crate::value::Value;
}
