//! Ordered, grouped projections over one collection
//!
//! A mapping filters a collection's documents, sorts each group with a
//! comparator (ties broken by key) and optionally reverses the display
//! order. Mappings are brought up to date explicitly with
//! [`OrderedViewIndex::update`]; between updates they keep answering from the
//! snapshot they were last updated against.

mod changes;

pub use changes::{RowChange, RowMove, RowPosition, SectionChange, ViewChanges};

pub(crate) use changes::{diff, Layout};

use crate::document::Document;
use crate::notifier::{ChangeNotifier, ChangeSet};
use crate::store::{ObjectStore, Reader, Snapshot};
use crate::{Error, Result};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Document handed to a mapping's comparator
#[derive(Debug, Clone, Copy)]
pub struct ViewItem<'a> {
    /// Document key
    pub key: &'a str,
    /// Stored document
    pub document: &'a Document,
}

type GroupFn = Arc<dyn Fn(&str, &Document) -> Option<String> + Send + Sync>;
type FilterFn = Arc<dyn Fn(&str, &Document) -> bool + Send + Sync>;
type SortFn = Arc<dyn Fn(&ViewItem<'_>, &ViewItem<'_>) -> Ordering + Send + Sync>;

/// Which groups a mapping exposes
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GroupSelection {
    /// Every non-empty group, ordered by name
    #[default]
    All,
    /// Only these groups, in this order
    Only(Vec<String>),
}

impl GroupSelection {
    fn admits(&self, group: &str) -> bool {
        match self {
            GroupSelection::All => true,
            GroupSelection::Only(groups) => groups.iter().any(|g| g == group),
        }
    }
}

/// Grouping, filtering and ordering rule for one mapping
#[derive(Clone)]
pub struct MappingDefinition {
    collection: String,
    group_by: GroupFn,
    filter: Option<FilterFn>,
    sort_by: SortFn,
    reversed: bool,
    groups: GroupSelection,
}

impl MappingDefinition {
    /// Mapping over `collection`.
    ///
    /// `group_by` returns `None` for documents that belong to no group.
    /// `sort_by` orders documents within a group, ascending.
    pub fn new<G, S>(collection: impl Into<String>, group_by: G, sort_by: S) -> Self
    where
        G: Fn(&str, &Document) -> Option<String> + Send + Sync + 'static,
        S: Fn(&ViewItem<'_>, &ViewItem<'_>) -> Ordering + Send + Sync + 'static,
    {
        Self {
            collection: collection.into(),
            group_by: Arc::new(group_by),
            filter: None,
            sort_by: Arc::new(sort_by),
            reversed: false,
            groups: GroupSelection::All,
        }
    }

    /// Keep only documents for which `filter` returns true
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str, &Document) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Flip the display order without changing the comparator
    pub fn reversed(mut self, reversed: bool) -> Self {
        self.reversed = reversed;
        self
    }

    /// Restrict and order the exposed groups
    pub fn groups(mut self, groups: GroupSelection) -> Self {
        self.groups = groups;
        self
    }

    /// Collection this mapping projects
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Group of a document, or `None` when the mapping excludes it
    fn classify(&self, key: &str, document: &Document) -> Option<String> {
        let group = (self.group_by)(key, document)?;
        if let Some(filter) = &self.filter {
            if !filter(key, document) {
                return None;
            }
        }
        self.groups.admits(&group).then_some(group)
    }

    fn compare(&self, a: &Entry, b: &Entry) -> Ordering {
        let left = ViewItem {
            key: &a.key,
            document: &a.document,
        };
        let right = ViewItem {
            key: &b.key,
            document: &b.document,
        };
        (self.sort_by)(&left, &right).then_with(|| a.key.cmp(&b.key))
    }
}

impl fmt::Debug for MappingDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingDefinition")
            .field("collection", &self.collection)
            .field("filtered", &self.filter.is_some())
            .field("reversed", &self.reversed)
            .field("groups", &self.groups)
            .finish()
    }
}

/// Handle to a declared mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MappingHandle(u64);

struct Entry {
    key: String,
    document: Arc<Document>,
}

struct Mapping {
    definition: MappingDefinition,
    seq: Option<u64>,
    groups: BTreeMap<String, Vec<Entry>>,
    members: HashMap<String, String>,
}

impl Mapping {
    fn new(definition: MappingDefinition) -> Self {
        Self {
            definition,
            seq: None,
            groups: BTreeMap::new(),
            members: HashMap::new(),
        }
    }

    fn insert(&mut self, key: String, document: Arc<Document>, group: String) {
        let entry = Entry { key, document };
        let entries = self.groups.entry(group.clone()).or_default();
        let at = entries
            .binary_search_by(|probe| self.definition.compare(probe, &entry))
            .unwrap_or_else(|at| at);
        self.members.insert(entry.key.clone(), group);
        entries.insert(at, entry);
    }

    fn remove(&mut self, key: &str) {
        let Some(group) = self.members.remove(key) else {
            return;
        };
        if let Some(entries) = self.groups.get_mut(&group) {
            entries.retain(|e| e.key != key);
            if entries.is_empty() {
                self.groups.remove(&group);
            }
        }
    }

    /// Non-empty groups in display order
    fn visible_groups(&self) -> Vec<&str> {
        match &self.definition.groups {
            GroupSelection::All => self.groups.keys().map(String::as_str).collect(),
            GroupSelection::Only(order) => order
                .iter()
                .filter(|g| self.groups.contains_key(g.as_str()))
                .map(String::as_str)
                .collect(),
        }
    }

    fn display_index(&self, len: usize, stored: usize) -> usize {
        if self.definition.reversed {
            len - 1 - stored
        } else {
            stored
        }
    }

    fn entry_at(&self, group: &str, row: usize) -> Option<&Entry> {
        let entries = self.groups.get(group)?;
        if row >= entries.len() {
            return None;
        }
        entries.get(self.display_index(entries.len(), row))
    }

    fn position_of(&self, key: &str) -> Option<RowPosition> {
        let group = self.members.get(key)?;
        let entries = self.groups.get(group)?;
        let stored = entries.iter().position(|e| e.key == key)?;
        let section = self.visible_groups().iter().position(|g| *g == group.as_str())?;
        Some(RowPosition {
            group: group.clone(),
            section,
            row: self.display_index(entries.len(), stored),
        })
    }
}

/// Registry of mappings kept up to date against store snapshots.
///
/// Owned by one consumer; declare mappings, `update` them against a
/// snapshot, then query positions.
pub struct OrderedViewIndex {
    notifier: ChangeNotifier,
    mappings: HashMap<MappingHandle, Mapping>,
    next_handle: u64,
}

impl OrderedViewIndex {
    /// Index over `store`'s change stream
    pub fn new(store: &ObjectStore) -> Self {
        Self {
            notifier: store.notifier().clone(),
            mappings: HashMap::new(),
            next_handle: 0,
        }
    }

    /// Register a mapping. It is stale until the first
    /// [`update`](Self::update).
    pub fn declare_mapping(&mut self, definition: MappingDefinition) -> MappingHandle {
        let handle = MappingHandle(self.next_handle);
        self.next_handle += 1;
        tracing::debug!("Declared mapping {:?} over '{}'", handle, definition.collection);
        self.mappings.insert(handle, Mapping::new(definition));
        handle
    }

    /// Forget a mapping
    pub fn remove_mapping(&mut self, handle: MappingHandle) -> bool {
        self.mappings.remove(&handle).is_some()
    }

    fn mapping(&self, handle: MappingHandle) -> Result<&Mapping> {
        self.mappings
            .get(&handle)
            .ok_or_else(|| Error::NotFound(format!("mapping {:?}", handle)))
    }

    fn mapping_mut(&mut self, handle: MappingHandle) -> Result<&mut Mapping> {
        self.mappings
            .get_mut(&handle)
            .ok_or_else(|| Error::NotFound(format!("mapping {:?}", handle)))
    }

    fn ready(&self, handle: MappingHandle) -> Result<&Mapping> {
        let mapping = self.mapping(handle)?;
        if mapping.seq.is_none() {
            return Err(Error::Validation(format!(
                "mapping {:?} has not been updated",
                handle
            )));
        }
        Ok(mapping)
    }

    /// Collection a mapping projects
    pub fn collection(&self, handle: MappingHandle) -> Result<&str> {
        Ok(self.mapping(handle)?.definition.collection())
    }

    /// Commit the mapping was last updated to, `None` before the first update
    pub fn seq(&self, handle: MappingHandle) -> Result<Option<u64>> {
        Ok(self.mapping(handle)?.seq)
    }

    /// Bring a mapping up to `snapshot`.
    ///
    /// Applies only the documents named in the change sets since the last
    /// update when the change log still covers them; otherwise rebuilds
    /// the mapping from the whole collection.
    pub fn update(&mut self, handle: MappingHandle, snapshot: &Snapshot) -> Result<()> {
        let target = snapshot.seq();
        let current = self.seq(handle)?;
        match current {
            Some(seq) if seq == target => Ok(()),
            Some(seq) if seq < target => match self.notifier.changes_between(seq, target) {
                Some(sets) => self.apply(handle, &sets, snapshot),
                None => self.rebuild(handle, snapshot),
            },
            _ => self.rebuild(handle, snapshot),
        }
    }

    /// Recompute a mapping from every document of its collection
    pub(crate) fn rebuild(&mut self, handle: MappingHandle, snapshot: &Snapshot) -> Result<()> {
        let definition = self.mapping(handle)?.definition.clone();

        let mut groups: BTreeMap<String, Vec<Entry>> = BTreeMap::new();
        let mut members = HashMap::new();
        snapshot.for_each_document(definition.collection(), |key, document| {
            if let Some(group) = definition.classify(key, &document) {
                members.insert(key.to_string(), group.clone());
                groups.entry(group).or_default().push(Entry {
                    key: key.to_string(),
                    document: Arc::new(document),
                });
            }
        })?;
        for entries in groups.values_mut() {
            entries.sort_by(|a, b| definition.compare(a, b));
        }

        tracing::debug!(
            "Rebuilt mapping {:?}: {} items in {} groups at commit {}",
            handle,
            members.len(),
            groups.len(),
            snapshot.seq()
        );
        let mapping = self.mapping_mut(handle)?;
        mapping.groups = groups;
        mapping.members = members;
        mapping.seq = Some(snapshot.seq());
        Ok(())
    }

    /// Re-place only the documents the change sets name
    pub(crate) fn apply(
        &mut self,
        handle: MappingHandle,
        sets: &[Arc<ChangeSet>],
        snapshot: &Snapshot,
    ) -> Result<()> {
        let mapping = self.mapping_mut(handle)?;
        let collection = mapping.definition.collection.clone();

        let mut seen = std::collections::HashSet::new();
        for change in sets.iter().flat_map(|set| set.changes.iter()) {
            if change.collection != collection || !seen.insert(change.key.as_str()) {
                continue;
            }
            mapping.remove(&change.key);
            if let Some(document) = snapshot.get_document(&change.key, &collection)? {
                if let Some(group) = mapping.definition.classify(&change.key, &document) {
                    mapping.insert(change.key.clone(), Arc::new(document), group);
                }
            }
        }
        mapping.seq = Some(snapshot.seq());
        Ok(())
    }

    /// Mark a mapping current without touching its contents
    pub(crate) fn fast_forward(&mut self, handle: MappingHandle, seq: u64) -> Result<()> {
        self.mapping_mut(handle)?.seq = Some(seq);
        Ok(())
    }

    pub(crate) fn layout(&self, handle: MappingHandle, keys: &[&str]) -> Result<Layout> {
        let mapping = self.ready(handle)?;
        Ok(Layout {
            sections: mapping.visible_groups().into_iter().map(str::to_string).collect(),
            rows: keys
                .iter()
                .map(|key| (key.to_string(), mapping.position_of(key)))
                .collect(),
        })
    }

    /// Visible groups in display order
    pub fn groups(&self, handle: MappingHandle) -> Result<Vec<String>> {
        Ok(self
            .ready(handle)?
            .visible_groups()
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    /// Number of items in `group` (0 for an absent group)
    pub fn item_count(&self, handle: MappingHandle, group: &str) -> Result<usize> {
        let mapping = self.ready(handle)?;
        Ok(mapping.groups.get(group).map_or(0, Vec::len))
    }

    /// Total number of items across all visible groups
    pub fn total_count(&self, handle: MappingHandle) -> Result<usize> {
        let mapping = self.ready(handle)?;
        Ok(mapping
            .visible_groups()
            .iter()
            .map(|g| mapping.groups.get(*g).map_or(0, Vec::len))
            .sum())
    }

    /// Key at `row` of `group`, in display order
    pub fn item(&self, handle: MappingHandle, group: &str, row: usize) -> Result<Option<String>> {
        Ok(self.ready(handle)?.entry_at(group, row).map(|e| e.key.clone()))
    }

    /// Document at `row` of `group`, as of the last update
    pub fn item_document(&self, handle: MappingHandle, group: &str, row: usize) -> Result<Option<Arc<Document>>> {
        Ok(self
            .ready(handle)?
            .entry_at(group, row)
            .map(|e| e.document.clone()))
    }

    /// Keys of `group` in display order
    pub fn items(&self, handle: MappingHandle, group: &str) -> Result<Vec<String>> {
        let mapping = self.ready(handle)?;
        let count = mapping.groups.get(group).map_or(0, Vec::len);
        Ok((0..count)
            .filter_map(|row| mapping.entry_at(group, row).map(|e| e.key.clone()))
            .collect())
    }

    /// Where `key` currently sits, if the mapping includes it
    pub fn position_of(&self, handle: MappingHandle, key: &str) -> Result<Option<RowPosition>> {
        Ok(self.ready(handle)?.position_of(key))
    }
}

impl fmt::Debug for OrderedViewIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedViewIndex")
            .field("mappings", &self.mappings.len())
            .finish()
    }
}
