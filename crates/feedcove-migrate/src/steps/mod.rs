//! The migration history: every schema version Feedcove has ever shipped.
//!
//! Versions 2 through [`LAST_OBJECT_VERSION`] operate on the pickled
//! object-graph store; versions [`FIRST_SQL_VERSION`] and up operate on
//! the SQLite store. New steps are appended here and
//! [`CURRENT_VERSION`] is bumped alongside them.

use crate::driver::StepRegistry;

pub mod object;
pub mod relational;

/// The oldest version a step exists for. Stores older than this predate
/// versioning entirely and cannot be opened.
pub const FIRST_VERSION: u32 = 2;

/// The last version stored as a pickled object graph.
pub const LAST_OBJECT_VERSION: u32 = 24;

/// The first version stored in SQLite.
pub const FIRST_SQL_VERSION: u32 = 25;

/// The schema version this build writes.
pub const CURRENT_VERSION: u32 = 42;

/// Builds the registry holding the full shipped migration history.
#[must_use]
pub fn default_registry() -> StepRegistry {
    let mut registry = StepRegistry::new();

    registry.object(2, object::feed_auto_download_flag);
    registry.object(3, object::item_watched_time);
    registry.object(4, object::drop_cached_thumbnails);
    registry.object(5, object::feed_available_count);
    // v6 shipped a second copy of the v5 fix after a bad release undid it.
    registry.alias(6, 5);
    registry.object(7, object::promote_feed_impl);
    registry.object(8, object::purge_orphaned_items);
    registry.object(9, object::downloader_state_names);
    registry.object(10, object::merge_folder_kinds);
    registry.object(11, object::item_expire_time);
    registry.object(12, object::icon_cache_relocated);
    registry.object(13, object::reassign_duplicate_ids);
    registry.object(14, object::themed_guide_url);
    registry.object(15, object::item_seen_bool);
    registry.object(16, object::purge_orphaned_feed_impls);
    registry.object(17, object::item_title_from_enclosure);
    registry.object(18, object::dedup_settings_records);
    registry.object(19, object::support_directory_moved);
    registry.object(20, object::item_size_field);
    registry.alias(21, 20);
    registry.object(22, object::playlist_item_ids_ints);
    registry.object(23, object::feed_orig_url);
    registry.object(24, object::relational_switch_marker);

    registry.relational(25, relational::storage_switch_marker);
    registry.relational(26, relational::item_resume_time);
    registry.relational(27, relational::item_seen_integer);
    registry.relational(28, relational::item_downloaded_time_epoch);
    registry.relational(29, relational::playlist_item_map);
    registry.relational(30, relational::purge_stale_playlist_entries);
    registry.relational(31, relational::repair_duplicate_ids);
    registry.relational(32, relational::merge_sites_into_guides);
    registry.relational(33, relational::item_play_counts);
    registry.relational(34, relational::feed_unwatched_count);
    registry.relational(35, relational::downloader_sizes_integer);
    registry.relational(36, relational::themed_guide_rows);
    registry.relational(37, relational::dedup_downloaders);
    registry.relational(38, relational::playlist_position_index);
    registry.relational(39, relational::thumbnail_format_marker);
    registry.relational(40, relational::feed_settings_columns);
    registry.alias(41, 37);
    registry.relational(42, relational::drop_retired_variables);

    registry
}
