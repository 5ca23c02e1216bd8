//! The column-rewrite primitive.
//!
//! SQLite has limited `ALTER TABLE` support, so shape changes use the table
//! recreation strategy: rename the table aside, create the new shape, copy
//! rows column-by-column, drop the old table, re-create the indexes.
//!
//! Every statement issued here must run inside one caller-provided
//! transaction; the primitive performs no commit or rollback of its own.
//! The driver supplies that transaction per upgrade step, so a failure
//! anywhere leaves the table in its pre-call state.

use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use tracing::{debug, warn};

use crate::error::Result;

/// One column as reported by the catalog.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Declared type, verbatim from the schema.
    pub type_decl: String,
    /// Whether the column is part of the primary key.
    pub primary_key: bool,
}

/// Quotes an identifier for inclusion in SQL text.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("\"{name}\"")
}

/// Reads a table's column list from the catalog.
pub async fn table_columns(conn: &mut SqliteConnection, table: &str) -> Result<Vec<ColumnInfo>> {
    let sql = format!("PRAGMA table_info({})", quote_identifier(table));
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    Ok(rows
        .iter()
        .map(|row| ColumnInfo {
            name: row.get("name"),
            type_decl: row.get("type"),
            primary_key: row.get::<i64, _>("pk") != 0,
        })
        .collect())
}

/// Returns whether `table` has a column named `column`.
pub async fn table_has_column(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
) -> Result<bool> {
    Ok(table_columns(conn, table)
        .await?
        .iter()
        .any(|c| c.name == column))
}

/// Returns whether a table exists.
pub async fn table_exists(conn: &mut SqliteConnection, table: &str) -> Result<bool> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(row.is_some())
}

/// Reads a table's named indexes as (name, creation statement) pairs.
///
/// Auto-indexes (implicit UNIQUE/PK indexes) carry no SQL and are skipped;
/// SQLite re-creates those itself.
pub async fn table_indexes(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Vec<(String, String)>> {
    let rows = sqlx::query(
        "SELECT name, sql FROM sqlite_master \
         WHERE type = 'index' AND tbl_name = ? AND sql IS NOT NULL",
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get("name"), row.get("sql")))
        .collect())
}

/// Lists the column names an index covers. Expression terms report no
/// column name and are ignored.
async fn index_columns(conn: &mut SqliteConnection, index: &str) -> Result<Vec<String>> {
    let sql = format!("PRAGMA index_info({})", quote_identifier(index));
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    Ok(rows
        .iter()
        .filter_map(|row| row.get::<Option<String>, _>("name"))
        .collect())
}

/// Rebuilds `table` with columns in `delete_columns` dropped, remaining
/// columns renamed per `rename_columns` (old name, new name) and retyped per
/// `retype_columns` (new name, new declared type).
///
/// The `id` column is always re-declared as the primary key. Callers must
/// not delete or rename `id`. Indexes covering a deleted column are
/// dropped along with it. Surviving index creation statements are re-run
/// verbatim, so an index referencing a renamed column must be dropped and
/// re-created by the calling step itself.
pub async fn rewrite_table(
    conn: &mut SqliteConnection,
    table: &str,
    delete_columns: &[&str],
    rename_columns: &[(&str, &str)],
    retype_columns: &[(&str, &str)],
) -> Result<()> {
    let columns = table_columns(conn, table).await?;
    let mut indexes = Vec::new();
    for (name, sql) in table_indexes(conn, table).await? {
        let covers_deleted = index_columns(conn, &name)
            .await?
            .iter()
            .any(|column| delete_columns.contains(&column.as_str()));
        if covers_deleted {
            warn!(table, index = %name, "dropping index on deleted column");
        } else {
            indexes.push((name, sql));
        }
    }

    let mut definitions = Vec::new();
    let mut old_names = Vec::new();
    let mut new_names = Vec::new();
    for column in &columns {
        if delete_columns.contains(&column.name.as_str()) {
            continue;
        }
        let new_name = rename_columns
            .iter()
            .find(|(old, _)| *old == column.name)
            .map_or_else(|| column.name.clone(), |(_, new)| (*new).to_string());
        let type_decl = retype_columns
            .iter()
            .find(|(name, _)| *name == new_name)
            .map_or_else(|| column.type_decl.clone(), |(_, ty)| (*ty).to_string());

        let mut definition = format!("{} {}", quote_identifier(&new_name), type_decl);
        if new_name == "id" {
            definition.push_str(" PRIMARY KEY");
        }
        definitions.push(definition);
        old_names.push(quote_identifier(&column.name));
        new_names.push(quote_identifier(&new_name));
    }

    debug!(table, columns = definitions.len(), "rebuilding table");

    let aside = format!("old_{table}");
    let statements = [
        format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_identifier(table),
            quote_identifier(&aside)
        ),
        format!(
            "CREATE TABLE {} ({})",
            quote_identifier(table),
            definitions.join(", ")
        ),
        format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            quote_identifier(table),
            new_names.join(", "),
            old_names.join(", "),
            quote_identifier(&aside)
        ),
        format!("DROP TABLE {}", quote_identifier(&aside)),
    ];
    for sql in &statements {
        debug!(sql = %sql, "executing rewrite statement");
        sqlx::query(sql).execute(&mut *conn).await?;
    }

    for (name, sql) in &indexes {
        debug!(index = %name, "re-creating index");
        sqlx::query(sql).execute(&mut *conn).await?;
    }

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

    async fn create_sample_table(conn: &mut SqliteConnection) {
        for sql in [
            "CREATE TABLE item (id integer PRIMARY KEY, title text, seen integer, size integer)",
            "CREATE INDEX item_seen ON item (seen)",
            "INSERT INTO item VALUES (1, 'first', 0, 100)",
            "INSERT INTO item VALUES (2, 'second', 1, 250)",
            "INSERT INTO item VALUES (3, 'third', 1, NULL)",
        ] {
            sqlx::query(sql).execute(&mut *conn).await.unwrap();
        }
    }

    async fn all_rows(conn: &mut SqliteConnection, sql: &str) -> Vec<(i64, String)> {
        sqlx::query_as(sql).fetch_all(&mut *conn).await.unwrap()
    }

    #[tokio::test]
    async fn test_rewrite_noop_round_trip() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        create_sample_table(&mut conn).await;

        rewrite_table(&mut conn, "item", &[], &[], &[]).await.unwrap();

        let names: Vec<String> = table_columns(&mut conn, "item")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["id", "title", "seen", "size"]);

        let rows = all_rows(&mut conn, "SELECT id, title FROM item ORDER BY id").await;
        assert_eq!(
            rows,
            vec![
                (1, "first".to_string()),
                (2, "second".to_string()),
                (3, "third".to_string()),
            ]
        );

        let indexes = table_indexes(&mut conn, "item").await.unwrap();
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].0, "item_seen");
    }

    #[tokio::test]
    async fn test_rewrite_delete_column() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        create_sample_table(&mut conn).await;

        rewrite_table(&mut conn, "item", &["seen"], &[], &[]).await.unwrap();

        assert!(!table_has_column(&mut conn, "item", "seen").await.unwrap());
        let rows = all_rows(&mut conn, "SELECT id, title FROM item ORDER BY id").await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1], (2, "second".to_string()));
        // The index on the deleted column goes with it.
        assert!(table_indexes(&mut conn, "item").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rewrite_rename_preserves_values_and_other_indexes() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        create_sample_table(&mut conn).await;

        // `item_seen` does not reference the renamed column, so it survives
        // and still answers lookups.
        rewrite_table(&mut conn, "item", &[], &[("size", "enclosure_size")], &[])
            .await
            .unwrap();

        let sizes: Vec<(i64, Option<i64>)> =
            sqlx::query_as("SELECT id, enclosure_size FROM item ORDER BY id")
                .fetch_all(&mut *conn)
                .await
                .unwrap();
        assert_eq!(sizes, vec![(1, Some(100)), (2, Some(250)), (3, None)]);

        let hits: Vec<(i64,)> = sqlx::query_as("SELECT id FROM item WHERE seen = 0")
            .fetch_all(&mut *conn)
            .await
            .unwrap();
        assert_eq!(hits, vec![(1,)]);
        assert_eq!(table_indexes(&mut conn, "item").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rewrite_retype_column() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        sqlx::query("CREATE TABLE d (id integer PRIMARY KEY, total_size text)")
            .execute(&mut *conn)
            .await
            .unwrap();
        sqlx::query("INSERT INTO d VALUES (1, '1024')")
            .execute(&mut *conn)
            .await
            .unwrap();

        rewrite_table(&mut conn, "d", &[], &[], &[("total_size", "integer")])
            .await
            .unwrap();

        let columns = table_columns(&mut conn, "d").await.unwrap();
        // The catalog may report the declared type in canonical case.
        assert!(columns[1].type_decl.eq_ignore_ascii_case("integer"));
        let size: (i64,) = sqlx::query_as("SELECT total_size FROM d")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(size.0, 1024);
    }

    #[tokio::test]
    async fn test_id_redeclared_as_primary_key() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        create_sample_table(&mut conn).await;

        rewrite_table(&mut conn, "item", &["title"], &[], &[]).await.unwrap();

        let id = table_columns(&mut conn, "item")
            .await
            .unwrap()
            .into_iter()
            .find(|c| c.name == "id")
            .unwrap();
        assert!(id.primary_key);
    }
}
