//! Error types for the store upgrade engine.

use crate::legacy::LegacyValueError;

/// Errors that can occur while upgrading a store.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// The store was written by a newer build than this one.
    ///
    /// Nothing has been mutated when this is returned; the caller is
    /// expected to tell the user the file was made by a newer version of
    /// the application.
    #[error("store is at version {0}, which is newer than this build understands")]
    StoreTooNew(u32),

    /// A version inside the upgrade range has no registered step.
    ///
    /// This is a packaging defect, not a data problem.
    #[error("no upgrade step registered for version {0}")]
    MissingStep(u32),

    /// The step registered for a version operates on the other store
    /// representation (object-graph vs. relational).
    #[error("step for version {version} does not apply to a {store} store")]
    StepStoreMismatch {
        /// The offending version number.
        version: u32,
        /// The representation the driver was given.
        store: &'static str,
    },

    /// A legacy-encoded value could not be decoded.
    ///
    /// Steps that tolerate row-scoped corruption catch this at the point
    /// of use; anything that reaches the driver is fatal.
    #[error("failed to decode legacy value: {0}")]
    LegacyValue(#[from] LegacyValueError),

    /// Database error during an upgrade step.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The store is in a shape the engine cannot work with.
    #[error("invalid store state: {0}")]
    InvalidState(String),
}

/// Result type for upgrade operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
