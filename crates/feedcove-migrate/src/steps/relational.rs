//! Relational era upgrade steps (versions 25 through 42).
//!
//! Each step runs inside the transaction the driver opened for it, so a
//! raised error rolls the whole version back. Steps return boxed futures
//! rather than being `async fn` so they coerce to the registry's function
//! pointer type.
//!
//! Failure policy matches the object era: structural problems raise and
//! abort the version; a single undecodable row is logged and skipped.

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, info, warn};

use crate::context::StepContext;
use crate::error::Result;
use crate::globals::remove_variable;
use crate::idpool::{allocate_starting_id, object_tables};
use crate::legacy::decode_legacy_value;
use crate::rewrite::{quote_identifier, rewrite_table, table_exists};
use crate::value::Value;

/// Foreign-key columns the engine knows about, as
/// (table, column, referenced table).
const FOREIGN_KEYS: &[(&str, &str, &str)] = &[
    ("feed", "feed_impl_id", "feed_impl"),
    ("item", "feed_id", "feed"),
    ("downloader", "item_id", "item"),
    ("playlist", "folder_id", "folder"),
    ("playlist_item_map", "playlist_id", "playlist"),
    ("playlist_item_map", "item_id", "item"),
];

async fn execute_all(conn: &mut SqliteConnection, statements: &[&str]) -> Result<()> {
    for sql in statements {
        sqlx::query(sql).execute(&mut *conn).await?;
    }
    Ok(())
}

/// v25: first version after the pickle-to-SQLite conversion. The
/// conversion itself belongs to the storage layer; this version only marks
/// the switch.
pub fn storage_switch_marker<'c>(
    _conn: &'c mut SqliteConnection,
    _context: &'c StepContext,
) -> BoxFuture<'c, Result<()>> {
    Box::pin(async { Ok(()) })
}

/// v26: remember partial playback position across restarts.
pub fn item_resume_time<'c>(
    conn: &'c mut SqliteConnection,
    _context: &'c StepContext,
) -> BoxFuture<'c, Result<()>> {
    Box::pin(async move {
        sqlx::query("ALTER TABLE item ADD COLUMN resume_time integer DEFAULT 0")
            .execute(&mut *conn)
            .await?;
        Ok(())
    })
}

/// v27: the conversion stored `seen` as the text 'True'/'False'; normalize
/// the values and retype the column.
pub fn item_seen_integer<'c>(
    conn: &'c mut SqliteConnection,
    _context: &'c StepContext,
) -> BoxFuture<'c, Result<()>> {
    Box::pin(async move {
        execute_all(
            conn,
            &[
                "UPDATE item SET seen = 1 WHERE seen IN ('True', 'true', '1', 1)",
                // IS NOT rather than NOT IN so NULLs collapse to 0 too.
                "UPDATE item SET seen = 0 WHERE seen IS NOT 1",
            ],
        )
        .await?;
        rewrite_table(&mut *conn, "item", &[], &[], &[("seen", "integer")]).await?;
        Ok(())
    })
}

/// v28: `downloaded_time` was a repr-encoded datetime blob; decode it to
/// epoch seconds. Rows that fail to decode lose the timestamp but nothing
/// else.
pub fn item_downloaded_time_epoch<'c>(
    conn: &'c mut SqliteConnection,
    _context: &'c StepContext,
) -> BoxFuture<'c, Result<()>> {
    Box::pin(async move {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, downloaded_time FROM item WHERE downloaded_time IS NOT NULL",
        )
        .fetch_all(&mut *conn)
        .await?;

        rewrite_table(&mut *conn, "item", &[], &[], &[("downloaded_time", "real")]).await?;

        for (item_id, text) in rows {
            let epoch = match decode_legacy_value(&text) {
                Ok(Value::DateTime(dt)) => Some(dt.and_utc().timestamp() as f64),
                Ok(Value::None) => None,
                Ok(other) => {
                    warn!(item = item_id, ?other, "unexpected downloaded_time shape");
                    None
                }
                Err(err) => {
                    warn!(item = item_id, %err, "undecodable downloaded_time, clearing");
                    None
                }
            };
            sqlx::query("UPDATE item SET downloaded_time = ? WHERE id = ?")
                .bind(epoch)
                .bind(item_id)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    })
}

/// v29: playlist membership lived in a repr-encoded id list on the
/// playlist row. Normalize it into a mapping table that preserves
/// positions, then drop the column.
pub fn playlist_item_map<'c>(
    conn: &'c mut SqliteConnection,
    _context: &'c StepContext,
) -> BoxFuture<'c, Result<()>> {
    Box::pin(async move {
        sqlx::query(
            "CREATE TABLE playlist_item_map (\
             playlist_id integer, item_id integer, position integer)",
        )
        .execute(&mut *conn)
        .await?;

        let rows: Vec<(i64, Option<String>)> =
            sqlx::query_as("SELECT id, item_ids FROM playlist")
                .fetch_all(&mut *conn)
                .await?;

        for (playlist_id, text) in rows {
            let Some(text) = text else { continue };
            let items = match decode_legacy_value(&text) {
                Ok(Value::List(items)) => items,
                Ok(other) => {
                    warn!(playlist = playlist_id, ?other, "item_ids is not a list, skipping");
                    continue;
                }
                Err(err) => {
                    warn!(playlist = playlist_id, %err, "undecodable item_ids, skipping");
                    continue;
                }
            };
            for (position, value) in items.iter().enumerate() {
                let Some(item_id) = value.as_int() else {
                    warn!(playlist = playlist_id, entry = ?value, "non-integer playlist entry");
                    continue;
                };
                sqlx::query(
                    "INSERT INTO playlist_item_map (playlist_id, item_id, position) \
                     VALUES (?, ?, ?)",
                )
                .bind(playlist_id)
                .bind(item_id)
                .bind(position as i64)
                .execute(&mut *conn)
                .await?;
            }
        }

        rewrite_table(&mut *conn, "playlist", &["item_ids"], &[], &[]).await?;
        Ok(())
    })
}

/// v30: drop playlist entries whose item was deleted before v29 could know
/// about it.
pub fn purge_stale_playlist_entries<'c>(
    conn: &'c mut SqliteConnection,
    _context: &'c StepContext,
) -> BoxFuture<'c, Result<()>> {
    Box::pin(async move {
        let result = sqlx::query(
            "DELETE FROM playlist_item_map WHERE item_id NOT IN (SELECT id FROM item)",
        )
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() > 0 {
            info!(rows = result.rows_affected(), "dropped stale playlist entries");
        }
        Ok(())
    })
}

/// v31: repair stores where two rows in different object tables share an
/// id. The first row (in table creation order, then id order) keeps the
/// id; every later one gets a fresh id from the allocator and the known
/// foreign-key columns are rewritten to follow it.
pub fn repair_duplicate_ids<'c>(
    conn: &'c mut SqliteConnection,
    _context: &'c StepContext,
) -> BoxFuture<'c, Result<()>> {
    Box::pin(async move {
        let tables = object_tables(&mut *conn).await?;

        let mut keeper: BTreeMap<i64, String> = BTreeMap::new();
        let mut duplicates: Vec<(String, i64, i64)> = Vec::new();
        for table in &tables {
            let sql = format!(
                "SELECT rowid, id FROM {} ORDER BY id",
                quote_identifier(table)
            );
            let rows: Vec<(i64, i64)> = sqlx::query_as(&sql).fetch_all(&mut *conn).await?;
            for (rowid, id) in rows {
                if keeper.contains_key(&id) {
                    duplicates.push((table.clone(), rowid, id));
                } else {
                    keeper.insert(id, table.clone());
                }
            }
        }
        if duplicates.is_empty() {
            return Ok(());
        }

        let mut ids = allocate_starting_id(&mut *conn).await?;
        for (table, rowid, old_id) in duplicates {
            let new_id = ids.next();
            warn!(table = %table, old_id, new_id, "reassigning duplicated id");
            let sql = format!(
                "UPDATE {} SET id = ? WHERE rowid = ?",
                quote_identifier(&table)
            );
            sqlx::query(&sql)
                .bind(new_id)
                .bind(rowid)
                .execute(&mut *conn)
                .await?;

            for (source, column, target) in FOREIGN_KEYS {
                if *target != table {
                    continue;
                }
                // References to the keeper stay put; only rewrite when the
                // keeper lives in a different table than this FK targets.
                if keeper.get(&old_id).is_some_and(|t| t == target) {
                    continue;
                }
                if !table_exists(&mut *conn, source).await? {
                    continue;
                }
                let sql = format!(
                    "UPDATE {} SET {} = ? WHERE {} = ?",
                    quote_identifier(source),
                    quote_identifier(column),
                    quote_identifier(column)
                );
                let result = sqlx::query(&sql)
                    .bind(new_id)
                    .bind(old_id)
                    .execute(&mut *conn)
                    .await?;
                if result.rows_affected() > 0 {
                    debug!(
                        source,
                        column,
                        old_id,
                        new_id,
                        rows = result.rows_affected(),
                        "rewrote foreign keys"
                    );
                }
            }
        }
        Ok(())
    })
}

/// v32: fold the short-lived `site` table into `guide` behind a `kind`
/// discriminator. Safe without id translation because ids are unique
/// across all object tables.
pub fn merge_sites_into_guides<'c>(
    conn: &'c mut SqliteConnection,
    _context: &'c StepContext,
) -> BoxFuture<'c, Result<()>> {
    Box::pin(async move {
        sqlx::query("ALTER TABLE guide ADD COLUMN kind text DEFAULT 'guide'")
            .execute(&mut *conn)
            .await?;
        if table_exists(&mut *conn, "site").await? {
            execute_all(
                conn,
                &[
                    "INSERT INTO guide (id, url, allowed_urls, default_guide, kind) \
                     SELECT id, url, allowed_urls, 0, 'site' FROM site",
                    "DROP TABLE site",
                ],
            )
            .await?;
            info!("merged site rows into guide");
        }
        Ok(())
    })
}

/// v33: play counts used to live in a per-feed `item_stats` dict keyed by
/// item id; move them onto the item rows.
///
/// Some stores have items with no entry in their feed's stats dict. It is
/// not clear how that happened, but it predates this step; such items keep
/// the default count and are skipped.
pub fn item_play_counts<'c>(
    conn: &'c mut SqliteConnection,
    _context: &'c StepContext,
) -> BoxFuture<'c, Result<()>> {
    Box::pin(async move {
        sqlx::query("ALTER TABLE item ADD COLUMN play_count integer DEFAULT 0")
            .execute(&mut *conn)
            .await?;

        let feeds: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, item_stats FROM feed WHERE item_stats IS NOT NULL")
                .fetch_all(&mut *conn)
                .await?;

        for (feed_id, text) in feeds {
            let stats = match decode_legacy_value(&text) {
                Ok(stats @ Value::Map(_)) => stats,
                Ok(other) => {
                    warn!(feed = feed_id, ?other, "item_stats is not a dict, skipping feed");
                    continue;
                }
                Err(err) => {
                    warn!(feed = feed_id, %err, "undecodable item_stats, skipping feed");
                    continue;
                }
            };

            let item_ids: Vec<(i64,)> =
                sqlx::query_as("SELECT id FROM item WHERE feed_id = ?")
                    .bind(feed_id)
                    .fetch_all(&mut *conn)
                    .await?;
            for (item_id,) in item_ids {
                let Some(entry) = stats.get_int_key(item_id) else {
                    debug!(feed = feed_id, item = item_id, "item missing from stats dict");
                    continue;
                };
                let Some(count) = entry.as_list().and_then(<[Value]>::first).and_then(Value::as_int)
                else {
                    warn!(feed = feed_id, item = item_id, entry = ?entry, "malformed stats entry");
                    continue;
                };
                sqlx::query("UPDATE item SET play_count = ? WHERE id = ?")
                    .bind(count)
                    .bind(item_id)
                    .execute(&mut *conn)
                    .await?;
            }
        }
        Ok(())
    })
}

/// v34: drop the migrated `item_stats` column and rename `available_count`
/// to `unwatched_count`.
///
/// The rewrite re-creates saved index statements verbatim, so the index on
/// the renamed column has to be dropped here and re-created against the
/// new name.
pub fn feed_unwatched_count<'c>(
    conn: &'c mut SqliteConnection,
    _context: &'c StepContext,
) -> BoxFuture<'c, Result<()>> {
    Box::pin(async move {
        sqlx::query("DROP INDEX IF EXISTS feed_available_count")
            .execute(&mut *conn)
            .await?;
        rewrite_table(
            &mut *conn,
            "feed",
            &["item_stats"],
            &[("available_count", "unwatched_count")],
            &[],
        )
        .await?;
        sqlx::query("CREATE INDEX feed_unwatched_count ON feed (unwatched_count)")
            .execute(&mut *conn)
            .await?;
        Ok(())
    })
}

/// v35: downloader byte counters were text (including the literal 'None');
/// make them real integers.
pub fn downloader_sizes_integer<'c>(
    conn: &'c mut SqliteConnection,
    _context: &'c StepContext,
) -> BoxFuture<'c, Result<()>> {
    Box::pin(async move {
        execute_all(
            conn,
            &[
                "UPDATE downloader SET total_size = NULL WHERE total_size IN ('None', '')",
                "UPDATE downloader SET current_size = NULL WHERE current_size IN ('None', '')",
            ],
        )
        .await?;
        rewrite_table(
            &mut *conn,
            "downloader",
            &[],
            &[],
            &[("total_size", "integer"), ("current_size", "integer")],
        )
        .await?;
        Ok(())
    })
}

/// v36: themed builds point default guide rows at the theme's guide. A
/// plain build bumps the version without touching data.
pub fn themed_guide_rows<'c>(
    conn: &'c mut SqliteConnection,
    context: &'c StepContext,
) -> BoxFuture<'c, Result<()>> {
    Box::pin(async move {
        let Some(theme) = context.theme() else {
            return Ok(());
        };
        let url = format!("https://guide.feedcove.org/themes/{theme}");
        let result = sqlx::query("UPDATE guide SET url = ? WHERE default_guide = 1")
            .bind(&url)
            .execute(&mut *conn)
            .await?;
        info!(theme, rows = result.rows_affected(), "retargeted default guide");
        Ok(())
    })
}

/// v37 (and v41 by alias): a retry bug could leave several downloaders for
/// one item; keep the oldest.
pub fn dedup_downloaders<'c>(
    conn: &'c mut SqliteConnection,
    _context: &'c StepContext,
) -> BoxFuture<'c, Result<()>> {
    Box::pin(async move {
        let result = sqlx::query(
            "DELETE FROM downloader WHERE id NOT IN \
             (SELECT MIN(id) FROM downloader GROUP BY item_id)",
        )
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() > 0 {
            info!(rows = result.rows_affected(), "deleted duplicate downloaders");
        }
        Ok(())
    })
}

/// v38: enforce one entry per playlist position. Exact duplicates (same
/// playlist, same position) keep the earliest row.
pub fn playlist_position_index<'c>(
    conn: &'c mut SqliteConnection,
    _context: &'c StepContext,
) -> BoxFuture<'c, Result<()>> {
    Box::pin(async move {
        execute_all(
            conn,
            &[
                "DELETE FROM playlist_item_map WHERE rowid NOT IN \
                 (SELECT MIN(rowid) FROM playlist_item_map GROUP BY playlist_id, position)",
                "CREATE UNIQUE INDEX IF NOT EXISTS playlist_item_map_position \
                 ON playlist_item_map (playlist_id, position)",
            ],
        )
        .await
    })
}

/// v39: thumbnails switched on-disk format; nothing stored changes.
pub fn thumbnail_format_marker<'c>(
    _conn: &'c mut SqliteConnection,
    _context: &'c StepContext,
) -> BoxFuture<'c, Result<()>> {
    Box::pin(async { Ok(()) })
}

/// v40: explode the repr-encoded per-feed `settings` dict into discrete
/// columns and drop the blob.
pub fn feed_settings_columns<'c>(
    conn: &'c mut SqliteConnection,
    _context: &'c StepContext,
) -> BoxFuture<'c, Result<()>> {
    Box::pin(async move {
        execute_all(
            conn,
            &[
                "ALTER TABLE feed ADD COLUMN auto_download_mode text",
                "ALTER TABLE feed ADD COLUMN max_new integer",
            ],
        )
        .await?;

        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, settings FROM feed WHERE settings IS NOT NULL")
                .fetch_all(&mut *conn)
                .await?;
        for (feed_id, text) in rows {
            let settings = match decode_legacy_value(&text) {
                Ok(settings) => settings,
                Err(err) => {
                    warn!(feed = feed_id, %err, "undecodable feed settings, using defaults");
                    continue;
                }
            };
            let mode = settings
                .get("auto_download_mode")
                .and_then(Value::as_str)
                .map(str::to_string);
            let max_new = settings.get("max_new").and_then(Value::as_int);
            sqlx::query("UPDATE feed SET auto_download_mode = ?, max_new = ? WHERE id = ?")
                .bind(mode)
                .bind(max_new)
                .bind(feed_id)
                .execute(&mut *conn)
                .await?;
        }

        rewrite_table(&mut *conn, "feed", &["settings"], &[], &[]).await?;
        Ok(())
    })
}

/// v42: drop globals no current code reads.
pub fn drop_retired_variables<'c>(
    conn: &'c mut SqliteConnection,
    _context: &'c StepContext,
) -> BoxFuture<'c, Result<()>> {
    Box::pin(async move {
        for name in ["pickled_theme", "last_vacuum", "frontend_state"] {
            remove_variable(&mut *conn, name).await?;
        }
        Ok(())
    })
}
