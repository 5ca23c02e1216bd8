//! The object-graph era store: an ordered list of generic records.
//!
//! Before the switch to relational storage, the whole application state was
//! persisted as a pickled list of records. A record is a type tag (the
//! entity kind) plus an open field bag; upgrade steps mutate the bag
//! directly. The list is only written back to disk by the caller after the
//! entire upgrade succeeds, so no transaction boundary exists here.

use std::collections::{BTreeMap, BTreeSet};

use crate::value::Value;

/// The subset of record ids a step reports as modified.
///
/// The caller uses this to know which records must be re-persisted.
pub type ChangedSet = BTreeSet<i64>;

/// One generic persisted record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// The entity kind, e.g. `"feed"` or `"item"`.
    pub type_tag: String,
    /// Field name to value. `id` lives here like any other field.
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    /// Creates a record with the given tag and id.
    #[must_use]
    pub fn new(type_tag: impl Into<String>, id: i64) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), Value::Int(id));
        Self {
            type_tag: type_tag.into(),
            fields,
        }
    }

    /// Returns the record's id, if it has a well-formed one.
    #[must_use]
    pub fn id(&self) -> Option<i64> {
        self.fields.get("id").and_then(Value::as_int)
    }

    /// Returns a field value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns whether a field is present.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Sets a field value.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.fields.insert(name.to_string(), value.into());
    }

    /// Removes a field, returning its old value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// Moves a field from `old` to `new`. Does nothing if `old` is absent
    /// or `new` already exists; returns whether a move happened.
    pub fn rename_field(&mut self, old: &str, new: &str) -> bool {
        if self.fields.contains_key(new) {
            return false;
        }
        match self.fields.remove(old) {
            Some(value) => {
                self.fields.insert(new.to_string(), value);
                true
            }
            None => false,
        }
    }
}

/// The ordered, mutable record list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectStore {
    records: Vec<Record>,
}

impl ObjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing record list.
    #[must_use]
    pub fn from_records(records: Vec<Record>) -> Self {
        Self { records }
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates all records mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Record> {
        self.records.iter_mut()
    }

    /// Iterates records with the given type tag.
    pub fn of_type<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Record> {
        self.records.iter().filter(move |r| r.type_tag == tag)
    }

    /// Iterates records with the given type tag, mutably.
    pub fn of_type_mut<'a>(&'a mut self, tag: &'a str) -> impl Iterator<Item = &'a mut Record> {
        self.records.iter_mut().filter(move |r| r.type_tag == tag)
    }

    /// Appends a record.
    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    /// Keeps only records satisfying the predicate.
    pub fn retain(&mut self, f: impl FnMut(&Record) -> bool) {
        self.records.retain(f);
    }

    /// The highest id currently in use, or 0 for an empty store.
    #[must_use]
    pub fn max_id(&self) -> i64 {
        self.records.iter().filter_map(Record::id).max().unwrap_or(0)
    }

    /// Consumes the store, returning the record list.
    #[must_use]
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_field_access() {
        let mut record = Record::new("item", 3);
        assert_eq!(record.id(), Some(3));

        record.set("title", "hello");
        assert_eq!(record.get("title").and_then(Value::as_str), Some("hello"));

        assert!(record.rename_field("title", "name"));
        assert!(!record.has("title"));
        assert_eq!(record.get("name").and_then(Value::as_str), Some("hello"));

        // Renaming onto an existing field is refused.
        record.set("title", "other");
        assert!(!record.rename_field("title", "name"));
        assert_eq!(record.get("name").and_then(Value::as_str), Some("hello"));
    }

    #[test]
    fn test_store_max_id() {
        let mut store = ObjectStore::new();
        assert_eq!(store.max_id(), 0);
        store.push(Record::new("feed", 4));
        store.push(Record::new("item", 11));
        store.push(Record::new("item", 2));
        assert_eq!(store.max_id(), 11);
    }

    #[test]
    fn test_of_type_filters_by_tag() {
        let mut store = ObjectStore::new();
        store.push(Record::new("feed", 1));
        store.push(Record::new("item", 2));
        store.push(Record::new("item", 3));
        assert_eq!(store.of_type("item").count(), 2);
        assert_eq!(store.of_type("feed").count(), 1);
        assert_eq!(store.of_type("guide").count(), 0);
    }
}
