//! Object-graph era upgrade steps (versions 2 through 24).
//!
//! These operate on the pickled record list that predates the relational
//! store. Field names here are the historical camelCase ones the old
//! writers used; they are renamed to their modern forms during the
//! relational conversion, outside this engine.
//!
//! Failure policy: a structurally impossible store fails the step (and the
//! upgrade); a single malformed record is logged and skipped so one bad
//! row cannot strand everyone else's data.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Duration;
use tracing::{info, warn};

use crate::context::StepContext;
use crate::error::Result;
use crate::record::{ChangedSet, ObjectStore, Record};
use crate::value::Value;

fn is_item(record: &Record) -> bool {
    record.type_tag == "item" || record.type_tag == "file-item"
}

/// v2: the integer `autoDownload` flag on feeds becomes the boolean
/// `autoDownloadable`.
pub fn feed_auto_download_flag(store: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
    let mut changed = ChangedSet::new();
    for feed in store.of_type_mut("feed") {
        let old = feed.remove("autoDownload");
        if old.is_none() && feed.has("autoDownloadable") {
            continue;
        }
        if !feed.has("autoDownloadable") {
            let enabled = old.as_ref().is_some_and(Value::truthy);
            feed.set("autoDownloadable", enabled);
        }
        // Removing the legacy field alone is a change worth persisting.
        changed.extend(feed.id());
    }
    Ok(changed)
}

/// v3: introduce `watchedTime` on items. Items already marked seen inherit
/// their `downloadedTime`; everything else starts unwatched.
pub fn item_watched_time(store: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
    let mut changed = ChangedSet::new();
    for item in store.iter_mut().filter(|r| is_item(r)) {
        if item.has("watchedTime") {
            continue;
        }
        let watched = if item.get("seen").is_some_and(Value::truthy) {
            item.get("downloadedTime").cloned().unwrap_or(Value::None)
        } else {
            Value::None
        };
        item.set("watchedTime", watched);
        changed.extend(item.id());
    }
    Ok(changed)
}

/// v4: thumbnails are cached by path convention now; the stored path field
/// is dead weight.
pub fn drop_cached_thumbnails(store: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
    let mut changed = ChangedSet::new();
    for record in store
        .iter_mut()
        .filter(|r| r.type_tag == "feed" || is_item(r))
    {
        if record.remove("cachedThumbnailPath").is_some() {
            changed.extend(record.id());
        }
    }
    Ok(changed)
}

/// v5 (and v6 by alias): rename feed `unviewedCount` to `availableCount`.
/// v6 re-ran this after a release briefly shipped a writer that still
/// produced the old name.
pub fn feed_available_count(store: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
    let mut changed = ChangedSet::new();
    for feed in store.of_type_mut("feed") {
        if feed.rename_field("unviewedCount", "availableCount") {
            changed.extend(feed.id());
        }
    }
    Ok(changed)
}

/// v7: promote the `feedImpl` map embedded in each feed into a standalone
/// `feed-impl` record with its own id, leaving a `feed_impl_id` reference
/// behind.
pub fn promote_feed_impl(store: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
    let mut changed = ChangedSet::new();
    let mut next_id = store.max_id() + 1;
    let mut promoted = Vec::new();

    for feed in store.of_type_mut("feed") {
        let Some(feed_id) = feed.id() else {
            warn!("feed record without id, skipping feedImpl promotion");
            continue;
        };
        let pairs = match feed.remove("feedImpl") {
            None => continue,
            Some(Value::Map(pairs)) => pairs,
            Some(other) => {
                warn!(feed = feed_id, ?other, "feedImpl is not a map, discarding");
                continue;
            }
        };

        let mut impl_record = Record::new("feed-impl", next_id);
        for (key, value) in pairs {
            match key {
                Value::Text(name) => {
                    impl_record.fields.insert(name, value);
                }
                other => warn!(feed = feed_id, key = ?other, "non-string feedImpl key"),
            }
        }
        impl_record.set("id", next_id);
        impl_record.set("feed_id", feed_id);
        feed.set("feed_impl_id", next_id);

        changed.insert(feed_id);
        changed.insert(next_id);
        promoted.push(impl_record);
        next_id += 1;
    }

    for record in promoted {
        store.push(record);
    }
    Ok(changed)
}

/// v8: delete items whose feed no longer exists, and the downloaders that
/// pointed at those items.
pub fn purge_orphaned_items(store: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
    let feed_ids: BTreeSet<i64> = store.of_type("feed").filter_map(Record::id).collect();

    let mut removed_items = BTreeSet::new();
    store.retain(|record| {
        if !is_item(record) {
            return true;
        }
        if record
            .get("feed_id")
            .and_then(Value::as_int)
            .is_some_and(|id| feed_ids.contains(&id))
        {
            return true;
        }
        removed_items.extend(record.id());
        false
    });

    let mut removed_downloaders = 0usize;
    store.retain(|record| {
        if record.type_tag != "downloader" {
            return true;
        }
        let orphaned = record
            .get("item_id")
            .and_then(Value::as_int)
            .is_some_and(|id| removed_items.contains(&id));
        if orphaned {
            removed_downloaders += 1;
        }
        !orphaned
    });

    if !removed_items.is_empty() {
        info!(
            items = removed_items.len(),
            downloaders = removed_downloaders,
            "deleted records orphaned by missing feeds"
        );
    }
    Ok(ChangedSet::new())
}

const STATE_NAMES: [(i64, &str); 5] = [
    (0, "pending"),
    (1, "downloading"),
    (2, "finished"),
    (3, "failed"),
    (4, "stopped"),
];

/// v9: downloader `state` was an integer enum; map it to the string names
/// the frontend uses. Unknown integers are corrupt single records, not a
/// store-wide problem, so they default to "stopped".
pub fn downloader_state_names(store: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
    let mut changed = ChangedSet::new();
    for downloader in store.of_type_mut("downloader") {
        let Some(code) = downloader.get("state").and_then(Value::as_int) else {
            continue;
        };
        let name = match STATE_NAMES.iter().find(|(c, _)| *c == code) {
            Some((_, name)) => *name,
            None => {
                warn!(
                    downloader = downloader.id(),
                    state = code,
                    "unknown legacy download state, defaulting to stopped"
                );
                "stopped"
            }
        };
        downloader.set("state", name);
        changed.extend(downloader.id());
    }
    Ok(changed)
}

/// v10: collapse the parallel `channel-folder` and `playlist-folder` kinds
/// into one `folder` kind with a discriminator field.
pub fn merge_folder_kinds(store: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
    let mut changed = ChangedSet::new();
    for record in store.iter_mut() {
        let kind = match record.type_tag.as_str() {
            "channel-folder" => "channel",
            "playlist-folder" => "playlist",
            _ => continue,
        };
        record.set("kind", kind);
        record.type_tag = "folder".to_string();
        changed.extend(record.id());
    }
    Ok(changed)
}

/// v11: introduce `expireTime` on items, inferred from the owning feed's
/// `expireDays` when there is no direct record of it.
pub fn item_expire_time(store: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
    let expire_days: BTreeMap<i64, i64> = store
        .of_type("feed")
        .filter_map(|feed| {
            let days = feed.get("expireDays").and_then(Value::as_int)?;
            Some((feed.id()?, days))
        })
        .collect();

    let mut changed = ChangedSet::new();
    for item in store.iter_mut().filter(|r| is_item(r)) {
        if item.has("expireTime") {
            continue;
        }
        let days = item
            .get("feed_id")
            .and_then(Value::as_int)
            .and_then(|id| expire_days.get(&id).copied());
        let expires = match (days, item.get("downloadedTime")) {
            (Some(days), Some(Value::DateTime(downloaded))) => {
                match Duration::try_days(days).and_then(|span| downloaded.checked_add_signed(span))
                {
                    Some(expires) => Value::DateTime(expires),
                    None => {
                        warn!(item = item.id(), days, "expire time out of range, clearing");
                        Value::None
                    }
                }
            }
            _ => Value::None,
        };
        item.set("expireTime", expires);
        changed.extend(item.id());
    }
    Ok(changed)
}

/// v12: the icon cache moved to a new on-disk location. No stored data
/// changes; the version marks that the move happened.
pub fn icon_cache_relocated(_: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
    Ok(ChangedSet::new())
}

/// v13: repair stores where a crash during id assignment left two records
/// with the same id. The first occurrence keeps the id.
pub fn reassign_duplicate_ids(store: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
    let mut seen = BTreeSet::new();
    let mut next_id = store.max_id() + 1;
    let mut changed = ChangedSet::new();
    for record in store.iter_mut() {
        let Some(id) = record.id() else { continue };
        if !seen.insert(id) {
            warn!(id, tag = %record.type_tag, "reassigning duplicated record id");
            record.set("id", next_id);
            changed.insert(next_id);
            next_id += 1;
        }
    }
    Ok(changed)
}

/// v14: themed builds replaced the default guide with the theme's own.
/// Plain builds leave the data untouched and just bump the version.
pub fn themed_guide_url(store: &mut ObjectStore, context: &StepContext) -> Result<ChangedSet> {
    let Some(theme) = context.theme() else {
        return Ok(ChangedSet::new());
    };
    let url = format!("https://guide.feedcove.org/themes/{theme}");
    let mut changed = ChangedSet::new();
    for guide in store.of_type_mut("guide") {
        if guide.get("default_guide").is_some_and(Value::truthy) {
            guide.set("url", url.as_str());
            changed.extend(guide.id());
        }
    }
    Ok(changed)
}

/// v15: `seen` was written as 0/1 by old releases; normalize to booleans.
pub fn item_seen_bool(store: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
    let mut changed = ChangedSet::new();
    for item in store.iter_mut().filter(|r| is_item(r)) {
        let Some(code) = item.get("seen").and_then(Value::as_int) else {
            continue;
        };
        item.set("seen", code != 0);
        changed.extend(item.id());
    }
    Ok(changed)
}

/// v16: drop `feed-impl` records no feed references anymore.
pub fn purge_orphaned_feed_impls(store: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
    let referenced: BTreeSet<i64> = store
        .of_type("feed")
        .filter_map(|feed| feed.get("feed_impl_id").and_then(Value::as_int))
        .collect();
    let mut removed = 0usize;
    store.retain(|record| {
        if record.type_tag != "feed-impl" {
            return true;
        }
        let keep = record.id().is_some_and(|id| referenced.contains(&id));
        if !keep {
            removed += 1;
        }
        keep
    });
    if removed > 0 {
        info!(removed, "deleted unreferenced feed-impl records");
    }
    Ok(ChangedSet::new())
}

fn filename_from_url(url: &str) -> Option<&str> {
    let path = url.split('?').next()?;
    let name = path.rsplit('/').next()?;
    (!name.is_empty()).then_some(name)
}

/// v17: items that never carried a title fall back to the first
/// enclosure's filename.
pub fn item_title_from_enclosure(store: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
    let mut changed = ChangedSet::new();
    for item in store.iter_mut().filter(|r| is_item(r)) {
        if !item.get("title").map_or(true, Value::is_none) {
            continue;
        }
        let title = item
            .get("enclosures")
            .and_then(Value::as_list)
            .and_then(<[Value]>::first)
            .and_then(|enclosure| enclosure.get("url"))
            .and_then(Value::as_str)
            .and_then(filename_from_url)
            .map(str::to_string);
        if let Some(title) = title {
            item.set("title", title);
            changed.extend(item.id());
        }
    }
    Ok(changed)
}

/// v18: a save/load race could duplicate the singleton settings record;
/// keep the first one.
pub fn dedup_settings_records(store: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
    let mut seen = false;
    store.retain(|record| {
        if record.type_tag != "settings" {
            return true;
        }
        if seen {
            return false;
        }
        seen = true;
        true
    });
    Ok(ChangedSet::new())
}

/// v19: the support directory moved. Data untouched.
pub fn support_directory_moved(_: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
    Ok(ChangedSet::new())
}

/// v20 (and v21 by alias): rename item `enclosureSize` to `size`.
pub fn item_size_field(store: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
    let mut changed = ChangedSet::new();
    for item in store.iter_mut().filter(|r| is_item(r)) {
        if item.rename_field("enclosureSize", "size") {
            changed.extend(item.id());
        }
    }
    Ok(changed)
}

/// v22: playlist `item_ids` sometimes accumulated junk entries from a bad
/// drag-and-drop path; keep only the integers.
pub fn playlist_item_ids_ints(store: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
    let mut changed = ChangedSet::new();
    for playlist in store.of_type_mut("playlist") {
        let cleaned = playlist.get("item_ids").and_then(Value::as_list).map(|items| {
            let kept: Vec<Value> = items
                .iter()
                .filter(|v| v.as_int().is_some())
                .cloned()
                .collect();
            (items.len(), kept)
        });
        if let Some((before, kept)) = cleaned {
            if kept.len() != before {
                warn!(
                    playlist = playlist.id(),
                    dropped = before - kept.len(),
                    "dropping non-integer playlist entries"
                );
                playlist.set("item_ids", Value::List(kept));
                changed.extend(playlist.id());
            }
        }
    }
    Ok(changed)
}

/// v23: remember the URL the user originally subscribed to, before
/// redirects start rewriting `url`.
pub fn feed_orig_url(store: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
    let mut changed = ChangedSet::new();
    for feed in store.of_type_mut("feed") {
        if feed.has("origURL") {
            continue;
        }
        let url = feed.get("url").cloned().unwrap_or(Value::None);
        feed.set("origURL", url);
        changed.extend(feed.id());
    }
    Ok(changed)
}

/// v24: last object-graph version. The relational conversion that follows
/// is performed by the storage layer, not by an upgrade step.
pub fn relational_switch_marker(_: &mut ObjectStore, _: &StepContext) -> Result<ChangedSet> {
    Ok(ChangedSet::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn plain() -> StepContext {
        StepContext::plain()
    }

    fn sample_datetime() -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2006, 6, 5)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_auto_download_flag_removal_is_reported() {
        let mut store = ObjectStore::new();
        let mut both = Record::new("feed", 1);
        both.set("autoDownload", 0i64);
        both.set("autoDownloadable", true);
        store.push(both);
        let mut done = Record::new("feed", 2);
        done.set("autoDownloadable", false);
        store.push(done);
        let mut legacy = Record::new("feed", 3);
        legacy.set("autoDownload", 1i64);
        store.push(legacy);

        let changed = feed_auto_download_flag(&mut store, &plain()).unwrap();
        // Feed 1 lost its legacy field and must be re-persisted even
        // though the boolean already existed; feed 2 is untouched.
        assert_eq!(changed, ChangedSet::from([1, 3]));

        let feeds: Vec<&Record> = store.of_type("feed").collect();
        assert!(!feeds[0].has("autoDownload"));
        assert_eq!(feeds[0].get("autoDownloadable"), Some(&Value::Bool(true)));
        assert_eq!(feeds[2].get("autoDownloadable"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_watched_time_inherits_downloaded_time_when_seen() {
        let mut store = ObjectStore::new();
        let mut seen_item = Record::new("item", 1);
        seen_item.set("seen", true);
        seen_item.set("downloadedTime", sample_datetime());
        store.push(seen_item);
        let mut unseen_item = Record::new("item", 2);
        unseen_item.set("seen", false);
        unseen_item.set("downloadedTime", sample_datetime());
        store.push(unseen_item);

        let changed = item_watched_time(&mut store, &plain()).unwrap();
        assert_eq!(changed, ChangedSet::from([1, 2]));

        let records: Vec<&Record> = store.of_type("item").collect();
        assert_eq!(
            records[0].get("watchedTime"),
            Some(&Value::DateTime(sample_datetime()))
        );
        assert_eq!(records[1].get("watchedTime"), Some(&Value::None));
    }

    #[test]
    fn test_promote_feed_impl_allocates_fresh_id() {
        let mut store = ObjectStore::new();
        let mut feed = Record::new("feed", 3);
        feed.set(
            "feedImpl",
            Value::Map(vec![(
                Value::Text("etag".into()),
                Value::Text("abc".into()),
            )]),
        );
        store.push(feed);
        store.push(Record::new("item", 9));

        let changed = promote_feed_impl(&mut store, &plain()).unwrap();
        assert_eq!(changed, ChangedSet::from([3, 10]));

        let feed = store.of_type("feed").next().unwrap();
        assert!(!feed.has("feedImpl"));
        assert_eq!(feed.get("feed_impl_id"), Some(&Value::Int(10)));

        let promoted = store.of_type("feed-impl").next().unwrap();
        assert_eq!(promoted.id(), Some(10));
        assert_eq!(promoted.get("feed_id"), Some(&Value::Int(3)));
        assert_eq!(promoted.get("etag").and_then(Value::as_str), Some("abc"));
    }

    #[test]
    fn test_expire_time_tolerates_out_of_range_expire_days() {
        let mut store = ObjectStore::new();
        let mut feed = Record::new("feed", 1);
        feed.set("expireDays", i64::MAX);
        store.push(feed);
        let mut sane_feed = Record::new("feed", 2);
        sane_feed.set("expireDays", 30i64);
        store.push(sane_feed);
        for (id, feed_id) in [(3i64, 1i64), (4, 2)] {
            let mut item = Record::new("item", id);
            item.set("feed_id", feed_id);
            item.set("downloadedTime", sample_datetime());
            store.push(item);
        }

        let changed = item_expire_time(&mut store, &plain()).unwrap();
        assert_eq!(changed, ChangedSet::from([3, 4]));

        let items: Vec<&Record> = store.of_type("item").collect();
        // The corrupt feed's item loses its expire time instead of
        // aborting the upgrade.
        assert_eq!(items[0].get("expireTime"), Some(&Value::None));
        assert_eq!(
            items[1].get("expireTime"),
            Some(&Value::DateTime(sample_datetime() + Duration::days(30)))
        );
    }

    #[test]
    fn test_purge_orphaned_items_cascades_to_downloaders() {
        let mut store = ObjectStore::new();
        store.push(Record::new("feed", 1));
        let mut kept = Record::new("item", 2);
        kept.set("feed_id", 1i64);
        store.push(kept);
        let mut orphan = Record::new("item", 3);
        orphan.set("feed_id", 99i64);
        store.push(orphan);
        let mut downloader = Record::new("downloader", 4);
        downloader.set("item_id", 3i64);
        store.push(downloader);

        purge_orphaned_items(&mut store, &plain()).unwrap();
        assert_eq!(store.of_type("item").count(), 1);
        assert_eq!(store.of_type("downloader").count(), 0);
        assert_eq!(store.of_type("feed").count(), 1);
    }

    #[test]
    fn test_unknown_download_state_defaults_to_stopped() {
        let mut store = ObjectStore::new();
        let mut downloader = Record::new("downloader", 1);
        downloader.set("state", 2i64);
        store.push(downloader);
        let mut corrupt = Record::new("downloader", 2);
        corrupt.set("state", 77i64);
        store.push(corrupt);

        downloader_state_names(&mut store, &plain()).unwrap();
        let states: Vec<&str> = store
            .of_type("downloader")
            .filter_map(|r| r.get("state").and_then(Value::as_str))
            .collect();
        assert_eq!(states, vec!["finished", "stopped"]);
    }

    #[test]
    fn test_merge_folder_kinds() {
        let mut store = ObjectStore::new();
        store.push(Record::new("channel-folder", 1));
        store.push(Record::new("playlist-folder", 2));

        merge_folder_kinds(&mut store, &plain()).unwrap();
        let kinds: Vec<&str> = store
            .of_type("folder")
            .filter_map(|r| r.get("kind").and_then(Value::as_str))
            .collect();
        assert_eq!(kinds, vec!["channel", "playlist"]);
    }

    #[test]
    fn test_reassign_duplicate_ids_keeps_first() {
        let mut store = ObjectStore::new();
        store.push(Record::new("feed", 7));
        store.push(Record::new("item", 7));
        store.push(Record::new("item", 9));

        let changed = reassign_duplicate_ids(&mut store, &plain()).unwrap();
        assert_eq!(changed, ChangedSet::from([10]));
        assert_eq!(store.of_type("feed").next().unwrap().id(), Some(7));
        let item_ids: Vec<i64> = store.of_type("item").filter_map(Record::id).collect();
        assert_eq!(item_ids, vec![10, 9]);
    }

    #[test]
    fn test_themed_guide_url_is_plain_build_no_op() {
        let mut store = ObjectStore::new();
        let mut guide = Record::new("guide", 1);
        guide.set("url", "https://guide.feedcove.org/");
        guide.set("default_guide", true);
        store.push(guide);

        let changed = themed_guide_url(&mut store, &plain()).unwrap();
        assert!(changed.is_empty());

        let changed = themed_guide_url(&mut store, &StepContext::themed("sunset")).unwrap();
        assert_eq!(changed, ChangedSet::from([1]));
        assert_eq!(
            store.of_type("guide").next().unwrap().get("url"),
            Some(&Value::Text("https://guide.feedcove.org/themes/sunset".into()))
        );
    }

    #[test]
    fn test_title_falls_back_to_enclosure_filename() {
        let mut store = ObjectStore::new();
        let mut item = Record::new("item", 1);
        item.set("title", Value::None);
        item.set(
            "enclosures",
            Value::List(vec![Value::Map(vec![(
                Value::Text("url".into()),
                Value::Text("http://example.com/media/episode-4.mp3?auth=1".into()),
            )])]),
        );
        store.push(item);

        item_title_from_enclosure(&mut store, &plain()).unwrap();
        assert_eq!(
            store.of_type("item").next().unwrap().get("title"),
            Some(&Value::Text("episode-4.mp3".into()))
        );
    }

    #[test]
    fn test_playlist_junk_entries_are_dropped() {
        let mut store = ObjectStore::new();
        let mut playlist = Record::new("playlist", 1);
        playlist.set(
            "item_ids",
            Value::List(vec![
                Value::Int(10),
                Value::Text("oops".into()),
                Value::Int(20),
            ]),
        );
        store.push(playlist);

        let changed = playlist_item_ids_ints(&mut store, &plain()).unwrap();
        assert_eq!(changed, ChangedSet::from([1]));
        assert_eq!(
            store.of_type("playlist").next().unwrap().get("item_ids"),
            Some(&Value::List(vec![Value::Int(10), Value::Int(20)]))
        );
    }
}
