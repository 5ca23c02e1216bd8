//! The reserved globals table.
//!
//! Scalar application globals, including the schema version, live in
//! `feedcove_variables` rather than in an object table. Values are stored
//! as text; the version is plain decimal digits.

use sqlx::sqlite::SqliteConnection;

use crate::error::{MigrateError, Result};

/// Name of the reserved globals table.
pub const VARIABLES_TABLE: &str = "feedcove_variables";

const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Creates the globals table if it does not exist yet.
pub async fn ensure_variables_table(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS feedcove_variables (\
         name text PRIMARY KEY, serialized_value text)",
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Reads the stored schema version, or `None` if the store has never
/// recorded one.
pub async fn schema_version(conn: &mut SqliteConnection) -> Result<Option<u32>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT serialized_value FROM feedcove_variables WHERE name = ?")
            .bind(SCHEMA_VERSION_KEY)
            .fetch_optional(&mut *conn)
            .await?;
    match row {
        None => Ok(None),
        Some((text,)) => text
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| MigrateError::InvalidState(format!("unreadable schema version {text:?}"))),
    }
}

/// Records the schema version.
pub async fn set_schema_version(conn: &mut SqliteConnection, version: u32) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO feedcove_variables (name, serialized_value) VALUES (?, ?)",
    )
    .bind(SCHEMA_VERSION_KEY)
    .bind(version.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Deletes a global by name. Missing names are not an error.
pub async fn remove_variable(conn: &mut SqliteConnection, name: &str) -> Result<()> {
    sqlx::query("DELETE FROM feedcove_variables WHERE name = ?")
        .bind(name)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

    async fn create_test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .expect("Failed to create in-memory SQLite pool")
    }

    #[tokio::test]
    async fn test_version_round_trip() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        ensure_variables_table(&mut conn).await.unwrap();

        assert_eq!(schema_version(&mut conn).await.unwrap(), None);
        set_schema_version(&mut conn, 31).await.unwrap();
        assert_eq!(schema_version(&mut conn).await.unwrap(), Some(31));
        set_schema_version(&mut conn, 32).await.unwrap();
        assert_eq!(schema_version(&mut conn).await.unwrap(), Some(32));
    }

    #[tokio::test]
    async fn test_garbage_version_is_an_error() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        ensure_variables_table(&mut conn).await.unwrap();
        sqlx::query("INSERT INTO feedcove_variables VALUES ('schema_version', 'soon')")
            .execute(&mut *conn)
            .await
            .unwrap();

        assert!(matches!(
            schema_version(&mut conn).await,
            Err(MigrateError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_variable_is_tolerant() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        ensure_variables_table(&mut conn).await.unwrap();
        remove_variable(&mut conn, "never_existed").await.unwrap();
    }
}
