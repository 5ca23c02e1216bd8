//! Fresh-id allocation for steps that materialize new top-level entities.
//!
//! Object ids are unique across every object table at once, not just within
//! one table; several steps move rows between tables and rely on that. The
//! pool is seeded from a scan of all object tables and is only valid as of
//! that scan: a step must not interleave other id-assigning writes while
//! drawing from it.

use sqlx::sqlite::SqliteConnection;

use crate::error::Result;
use crate::globals::VARIABLES_TABLE;
use crate::rewrite::table_has_column;

/// A counter of ids guaranteed unused as of the seeding scan.
#[derive(Debug)]
pub struct IdPool {
    next_id: i64,
}

impl IdPool {
    /// Creates a pool that starts handing out ids at `start`.
    #[must_use]
    pub fn new(start: i64) -> Self {
        Self { next_id: start }
    }

    /// Draws the next unused id.
    pub fn next(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Lists every object table: all tables except the reserved globals table
/// and SQLite internals, filtered to those that carry an `id` column.
pub async fn object_tables(conn: &mut SqliteConnection) -> Result<Vec<String>> {
    let names: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name <> ? \
         ORDER BY rowid",
    )
    .bind(VARIABLES_TABLE)
    .fetch_all(&mut *conn)
    .await?;

    let mut tables = Vec::new();
    for (name,) in names {
        if table_has_column(conn, &name, "id").await? {
            tables.push(name);
        }
    }
    Ok(tables)
}

/// Scans every object table for the highest id in use and returns a pool
/// seeded just past it.
pub async fn allocate_starting_id(conn: &mut SqliteConnection) -> Result<IdPool> {
    let mut highest = 0;
    for table in object_tables(conn).await? {
        let sql = format!(
            "SELECT MAX(id) FROM {}",
            crate::rewrite::quote_identifier(&table)
        );
        let max: Option<i64> = sqlx::query_scalar(&sql).fetch_one(&mut *conn).await?;
        highest = highest.max(max.unwrap_or(0));
    }
    Ok(IdPool::new(highest + 1))
}
