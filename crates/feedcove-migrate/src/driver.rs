//! The version driver: sequential, gapless application of upgrade steps.
//!
//! Every store, however old, must pass through every structural assumption
//! later steps depend on, so versions are applied in strictly ascending
//! order with no skips. The registry is an explicit map built at startup
//! and injected here; a version without a registered step is a packaging
//! defect and fails the whole upgrade before anything is mutated.

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::context::StepContext;
use crate::error::{MigrateError, Result};
use crate::globals::set_schema_version;
use crate::progress::ProgressObserver;
use crate::record::{ChangedSet, ObjectStore};

/// An object-graph era step: mutates the record list in place and reports
/// the records it changed.
pub type ObjectStepFn = fn(&mut ObjectStore, &StepContext) -> Result<ChangedSet>;

/// A relational era step: runs SQL against the live cursor. The driver
/// wraps each invocation in its own transaction.
pub type SqlStepFn =
    for<'c> fn(&'c mut SqliteConnection, &'c StepContext) -> BoxFuture<'c, Result<()>>;

/// One registered upgrade step.
#[derive(Clone, Copy)]
pub enum Step {
    /// Operates on the legacy object-graph store.
    Object(ObjectStepFn),
    /// Operates on the relational store.
    Relational(SqlStepFn),
    /// Reuses another version's step body verbatim. Used when the same
    /// structural fix had to ship twice.
    AliasOf(u32),
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Object(_) => f.write_str("Step::Object(..)"),
            Step::Relational(_) => f.write_str("Step::Relational(..)"),
            Step::AliasOf(v) => write!(f, "Step::AliasOf({v})"),
        }
    }
}

/// Explicit ordered mapping from version number to upgrade step.
#[derive(Debug, Default)]
pub struct StepRegistry {
    steps: BTreeMap<u32, Step>,
}

impl StepRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an object-graph step for `version`.
    pub fn object(&mut self, version: u32, step: ObjectStepFn) {
        self.steps.insert(version, Step::Object(step));
    }

    /// Registers a relational step for `version`.
    pub fn relational(&mut self, version: u32, step: SqlStepFn) {
        self.steps.insert(version, Step::Relational(step));
    }

    /// Registers `version` as an alias of `target`'s step.
    pub fn alias(&mut self, version: u32, target: u32) {
        self.steps.insert(version, Step::AliasOf(target));
    }

    /// Highest version this registry can upgrade to.
    #[must_use]
    pub fn highest_version(&self) -> Option<u32> {
        self.steps.keys().next_back().copied()
    }

    /// Resolves the step for `version`, following aliases.
    pub fn resolve(&self, version: u32) -> Result<&Step> {
        let mut v = version;
        for _ in 0..=self.steps.len() {
            match self.steps.get(&v) {
                None => return Err(MigrateError::MissingStep(version)),
                Some(Step::AliasOf(target)) => v = *target,
                Some(step) => return Ok(step),
            }
        }
        Err(MigrateError::InvalidState(format!(
            "alias cycle while resolving step for version {version}"
        )))
    }

    /// Resolves every version in `(stored, target]` up front, so a
    /// registration gap fails before any mutation.
    fn resolve_range(&self, stored: u32, target: u32) -> Result<Vec<(u32, &Step)>> {
        (stored + 1..=target)
            .map(|v| Ok((v, self.resolve(v)?)))
            .collect()
    }
}

fn check_versions(stored_version: u32, target_version: u32) -> Result<()> {
    if stored_version > target_version {
        return Err(MigrateError::StoreTooNew(stored_version));
    }
    Ok(())
}

/// Upgrades a legacy object-graph store from `stored_version` to
/// `target_version`, returning the union of every step's changed set.
///
/// There is no transaction boundary in this era; the caller persists the
/// mutated list only after the whole upgrade succeeds.
pub fn upgrade_object_store(
    store: &mut ObjectStore,
    registry: &StepRegistry,
    stored_version: u32,
    target_version: u32,
    context: &StepContext,
    progress: &mut dyn ProgressObserver,
) -> Result<ChangedSet> {
    check_versions(stored_version, target_version)?;
    let steps = registry.resolve_range(stored_version, target_version)?;
    for (version, step) in &steps {
        if !matches!(step, Step::Object(_)) {
            return Err(MigrateError::StepStoreMismatch {
                version: *version,
                store: "object-graph",
            });
        }
    }

    info!(
        from = stored_version,
        to = target_version,
        records = store.len(),
        "upgrading object-graph store"
    );

    let mut changed = ChangedSet::new();
    for (version, step) in steps {
        let Step::Object(step) = step else { unreachable!() };
        debug!(version, "applying object-graph step");
        changed.extend(step(store, context)?);
        progress.step_complete(stored_version, version, target_version);
    }
    Ok(changed)
}

/// Upgrades a relational store from `stored_version` to `target_version`.
///
/// Each version's step runs in its own transaction together with the
/// version-number bump, so a crash or raised error mid-step leaves the
/// database at the previous version. Errors from a step always propagate;
/// the driver never swallows them.
pub async fn upgrade_database(
    pool: &SqlitePool,
    registry: &StepRegistry,
    stored_version: u32,
    target_version: u32,
    context: &StepContext,
    progress: &mut dyn ProgressObserver,
) -> Result<()> {
    check_versions(stored_version, target_version)?;
    let steps = registry.resolve_range(stored_version, target_version)?;
    for (version, step) in &steps {
        if !matches!(step, Step::Relational(_)) {
            return Err(MigrateError::StepStoreMismatch {
                version: *version,
                store: "relational",
            });
        }
    }

    info!(
        from = stored_version,
        to = target_version,
        "upgrading relational store"
    );

    for (version, step) in steps {
        let Step::Relational(step) = step else { unreachable!() };
        debug!(version, "applying relational step");

        let mut tx = pool.begin().await?;
        step(&mut tx, context).await?;
        set_schema_version(&mut tx, version).await?;
        tx.commit().await?;

        progress.step_complete(stored_version, version, target_version);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::globals::{ensure_variables_table, schema_version};
    use crate::progress::NullProgress;
    use crate::record::Record;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .expect("Failed to create in-memory SQLite pool")
    }

    /// Records every notification it receives.
    #[derive(Default)]
    struct RecordingProgress {
        calls: Vec<(u32, u32, u32)>,
    }

    impl ProgressObserver for RecordingProgress {
        fn step_complete(&mut self, start: u32, current: u32, target: u32) {
            self.calls.push((start, current, target));
        }
    }

    fn mark(store: &mut ObjectStore, version: i64) -> Result<ChangedSet> {
        let id = store.max_id() + 1;
        let mut record = Record::new("applied", id);
        record.set("version", version);
        store.push(record);
        Ok(ChangedSet::from([id]))
    }

    fn step_two(store: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
        mark(store, 2)
    }
    fn step_three(store: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
        mark(store, 3)
    }
    fn step_four(store: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
        mark(store, 4)
    }
    fn failing_step(_: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
        Err(MigrateError::InvalidState("broken".into()))
    }

    fn sql_mark<'c>(
        conn: &'c mut SqliteConnection,
        _: &'c StepContext,
    ) -> BoxFuture<'c, Result<()>> {
        Box::pin(async move {
            sqlx::query("INSERT INTO applied (note) VALUES ('x')")
                .execute(&mut *conn)
                .await?;
            Ok(())
        })
    }

    fn sql_fail<'c>(
        conn: &'c mut SqliteConnection,
        _: &'c StepContext,
    ) -> BoxFuture<'c, Result<()>> {
        Box::pin(async move {
            sqlx::query("INSERT INTO applied (note) VALUES ('doomed')")
                .execute(&mut *conn)
                .await?;
            Err(MigrateError::InvalidState("broken".into()))
        })
    }

    fn object_registry() -> StepRegistry {
        let mut registry = StepRegistry::new();
        registry.object(2, step_two);
        registry.object(3, step_three);
        registry.object(4, step_four);
        registry.alias(5, 3);
        registry
    }

    fn applied_versions(store: &ObjectStore) -> Vec<i64> {
        store
            .of_type("applied")
            .filter_map(|r| r.get("version").and_then(crate::value::Value::as_int))
            .collect()
    }

    #[test]
    fn test_applies_each_version_once_in_order() {
        let mut store = ObjectStore::new();
        let mut progress = RecordingProgress::default();
        let changed = upgrade_object_store(
            &mut store,
            &object_registry(),
            1,
            4,
            &StepContext::plain(),
            &mut progress,
        )
        .unwrap();

        assert_eq!(applied_versions(&store), vec![2, 3, 4]);
        assert_eq!(changed, ChangedSet::from([1, 2, 3]));
        assert_eq!(progress.calls, vec![(1, 2, 4), (1, 3, 4), (1, 4, 4)]);
    }

    #[test]
    fn test_alias_reuses_step_body() {
        let mut store = ObjectStore::new();
        upgrade_object_store(
            &mut store,
            &object_registry(),
            4,
            5,
            &StepContext::plain(),
            &mut NullProgress,
        )
        .unwrap();
        assert_eq!(applied_versions(&store), vec![3]);
    }

    #[test]
    fn test_equal_versions_is_a_no_op() {
        let mut store = ObjectStore::new();
        let changed = upgrade_object_store(
            &mut store,
            &object_registry(),
            4,
            4,
            &StepContext::plain(),
            &mut NullProgress,
        )
        .unwrap();
        assert!(changed.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_too_new_store_is_untouched() {
        let mut store = ObjectStore::new();
        store.push(Record::new("feed", 1));
        let before = store.clone();

        let err = upgrade_object_store(
            &mut store,
            &object_registry(),
            9,
            4,
            &StepContext::plain(),
            &mut NullProgress,
        )
        .unwrap_err();
        assert!(matches!(err, MigrateError::StoreTooNew(9)));
        assert_eq!(store, before);
    }

    #[test]
    fn test_missing_step_fails_before_mutation() {
        let mut registry = object_registry();
        registry.alias(7, 2); // gap at 6
        let mut store = ObjectStore::new();

        let err = upgrade_object_store(
            &mut store,
            &registry,
            1,
            7,
            &StepContext::plain(),
            &mut NullProgress,
        )
        .unwrap_err();
        assert!(matches!(err, MigrateError::MissingStep(6)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_relational_step_rejected_for_object_store() {
        let mut registry = object_registry();
        registry.relational(6, sql_mark);
        let mut store = ObjectStore::new();

        let err = upgrade_object_store(
            &mut store,
            &registry,
            1,
            6,
            &StepContext::plain(),
            &mut NullProgress,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            MigrateError::StepStoreMismatch { version: 6, .. }
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_step_failure_propagates() {
        let mut registry = object_registry();
        registry.object(6, failing_step);
        let mut store = ObjectStore::new();

        let err = upgrade_object_store(
            &mut store,
            &registry,
            1,
            6,
            &StepContext::plain(),
            &mut NullProgress,
        )
        .unwrap_err();
        assert!(matches!(err, MigrateError::InvalidState(_)));
        // Steps before the failure have run (version 5 aliases version 3,
        // so 3's body runs twice); this era has no rollback.
        assert_eq!(applied_versions(&store), vec![2, 3, 4, 3]);
    }

    #[test]
    fn test_alias_cycle_is_reported() {
        let mut registry = StepRegistry::new();
        registry.alias(2, 3);
        registry.alias(3, 2);
        assert!(matches!(
            registry.resolve(2),
            Err(MigrateError::InvalidState(_))
        ));
    }

    fn sql_registry() -> StepRegistry {
        let mut registry = StepRegistry::new();
        registry.relational(26, sql_mark);
        registry.relational(27, sql_mark);
        registry.alias(28, 26);
        registry
    }

    async fn setup_relational(pool: &SqlitePool, version: u32) {
        let mut conn = pool.acquire().await.unwrap();
        ensure_variables_table(&mut conn).await.unwrap();
        crate::globals::set_schema_version(&mut conn, version)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE applied (note text)")
            .execute(&mut *conn)
            .await
            .unwrap();
    }

    async fn applied_count(pool: &SqlitePool) -> i64 {
        let mut conn = pool.acquire().await.unwrap();
        sqlx::query_scalar("SELECT COUNT(*) FROM applied")
            .fetch_one(&mut *conn)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_relational_upgrade_bumps_version_per_step() {
        let pool = create_test_pool().await;
        setup_relational(&pool, 25).await;
        let mut progress = RecordingProgress::default();

        upgrade_database(
            &pool,
            &sql_registry(),
            25,
            28,
            &StepContext::plain(),
            &mut progress,
        )
        .await
        .unwrap();

        assert_eq!(applied_count(&pool).await, 3);
        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(schema_version(&mut conn).await.unwrap(), Some(28));
        assert_eq!(progress.calls, vec![(25, 26, 28), (25, 27, 28), (25, 28, 28)]);
    }

    #[tokio::test]
    async fn test_failed_step_rolls_back_its_transaction() {
        let pool = create_test_pool().await;
        setup_relational(&pool, 25).await;
        let mut registry = sql_registry();
        registry.relational(27, sql_fail);

        let err = upgrade_database(
            &pool,
            &registry,
            25,
            28,
            &StepContext::plain(),
            &mut NullProgress,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MigrateError::InvalidState(_)));

        // Version 26 committed; the doomed insert from 27 did not.
        assert_eq!(applied_count(&pool).await, 1);
        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(schema_version(&mut conn).await.unwrap(), Some(26));
    }

    #[tokio::test]
    async fn test_relational_too_new_leaves_database_alone() {
        let pool = create_test_pool().await;
        setup_relational(&pool, 30).await;

        let err = upgrade_database(
            &pool,
            &sql_registry(),
            30,
            28,
            &StepContext::plain(),
            &mut NullProgress,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MigrateError::StoreTooNew(30)));
        assert_eq!(applied_count(&pool).await, 0);
        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(schema_version(&mut conn).await.unwrap(), Some(30));
    }
}
