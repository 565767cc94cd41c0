//! Identity registry for workspace files.
//!
//! Every file the cache talks about is represented by exactly one
//! [`P4ClientFileMapping`] that links its depot path to its local path.
//! Callers hold a [`MappingId`] instead of the mapping itself, so when a
//! later server answer fills in or corrects a path, every holder sees it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::types::FilePath;

/// Handle for a mapping inside a [`FileMappingRepo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MappingId(u64);

/// Link between a depot path and a local path. Either side may be unknown.
#[derive(Debug, Clone)]
pub struct P4ClientFileMapping {
    depot_path: Option<String>,
    local_path: Option<FilePath>,
}

impl P4ClientFileMapping {
    pub fn new(depot_path: Option<String>, local_path: Option<FilePath>) -> Self {
        Self {
            depot_path,
            local_path,
        }
    }

    pub fn depot_path(&self) -> Option<&str> {
        self.depot_path.as_deref()
    }

    pub fn local_path(&self) -> Option<&FilePath> {
        self.local_path.as_ref()
    }
}

/// Depot paths are compared when both sides have one, local paths
/// otherwise. Two mappings with neither are never equal.
impl PartialEq for P4ClientFileMapping {
    fn eq(&self, other: &Self) -> bool {
        match (&self.depot_path, &other.depot_path) {
            (Some(a), Some(b)) => a == b,
            _ => match (&self.local_path, &other.local_path) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl fmt::Display for P4ClientFileMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.depot_path, &self.local_path) {
            (Some(depot), Some(local)) => write!(f, "{} <-> {}", depot, local),
            (Some(depot), None) => write!(f, "{} <-> ?", depot),
            (None, Some(local)) => write!(f, "? <-> {}", local),
            (None, None) => f.write_str("? <-> ?"),
        }
    }
}

/// Registry that hands out one mapping per distinct file.
#[derive(Debug, Clone)]
pub struct FileMappingRepo {
    case_insensitive: bool,
    next_id: u64,
    mappings: BTreeMap<MappingId, P4ClientFileMapping>,
    by_depot: HashMap<String, MappingId>,
    by_local: HashMap<FilePath, MappingId>,
    /// Mappings folded into another one; lookups follow these to the survivor.
    merged: HashMap<MappingId, MappingId>,
}

impl FileMappingRepo {
    /// Create an empty repo. `case_insensitive` reflects the server, and
    /// controls how depot paths are compared.
    pub fn new(case_insensitive: bool) -> Self {
        Self {
            case_insensitive,
            next_id: 1,
            mappings: BTreeMap::new(),
            by_depot: HashMap::new(),
            by_local: HashMap::new(),
            merged: HashMap::new(),
        }
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    fn depot_key(&self, depot_path: &str) -> String {
        if self.case_insensitive {
            depot_path.to_lowercase()
        } else {
            depot_path.to_string()
        }
    }

    fn allocate(&mut self, mapping: P4ClientFileMapping) -> MappingId {
        let id = MappingId(self.next_id);
        self.next_id += 1;
        trace!(id = id.0, mapping = %mapping, "mapping created");
        self.mappings.insert(id, mapping);
        id
    }

    /// Follow merges to the mapping that currently represents `id`.
    pub fn resolve(&self, id: MappingId) -> MappingId {
        let mut current = id;
        while let Some(&next) = self.merged.get(&current) {
            current = next;
        }
        current
    }

    pub fn get(&self, id: MappingId) -> Option<&P4ClientFileMapping> {
        self.mappings.get(&self.resolve(id))
    }

    /// Mapping for a depot path, created if needed.
    ///
    /// When `local` is given it becomes the mapping's local path. A mapping
    /// previously created for that local path alone is adopted rather than
    /// duplicated.
    pub fn get_by_depot_location(&mut self, depot_path: &str, local: Option<&FilePath>) -> MappingId {
        let key = self.depot_key(depot_path);
        if let Some(&id) = self.by_depot.get(&key) {
            if let Some(local) = local {
                self.relink_local(id, local);
            }
            return id;
        }

        if let Some(local) = local
            && let Some(&existing) = self.by_local.get(local)
            && self
                .mappings
                .get(&existing)
                .is_some_and(|m| m.depot_path.is_none())
        {
            if let Some(mapping) = self.mappings.get_mut(&existing) {
                mapping.depot_path = Some(depot_path.to_string());
            }
            debug!(id = existing.0, depot = %depot_path, "local mapping linked to depot path");
            self.by_depot.insert(key, existing);
            return existing;
        }

        let id = self.allocate(P4ClientFileMapping::new(Some(depot_path.to_string()), None));
        self.by_depot.insert(key, id);
        if let Some(local) = local {
            self.relink_local(id, local);
        }
        id
    }

    /// Mapping for a local path, created without a depot path if needed.
    pub fn get_by_location(&mut self, local: &FilePath) -> MappingId {
        if let Some(&id) = self.by_local.get(local) {
            return id;
        }
        let id = self.allocate(P4ClientFileMapping::new(None, Some(local.clone())));
        self.by_local.insert(local.clone(), id);
        id
    }

    /// Lookup without creating.
    pub fn find_by_depot(&self, depot_path: &str) -> Option<MappingId> {
        self.by_depot.get(&self.depot_key(depot_path)).copied()
    }

    /// Lookup without creating.
    pub fn find_by_location(&self, local: &FilePath) -> Option<MappingId> {
        self.by_local.get(local).copied()
    }

    /// Re-create a mapping from persisted paths. Returns `None` when both
    /// paths are missing.
    pub fn restore(&mut self, depot_path: Option<&str>, local: Option<&FilePath>) -> Option<MappingId> {
        match (depot_path, local) {
            (Some(depot), local) => Some(self.get_by_depot_location(depot, local)),
            (None, Some(local)) => Some(self.get_by_location(local)),
            (None, None) => None,
        }
    }

    fn relink_local(&mut self, id: MappingId, local: &FilePath) {
        let current = self.mappings.get(&id).and_then(|m| m.local_path.clone());
        if let Some(&owner) = self.by_local.get(local)
            && owner != id
        {
            let owner_has_depot = self
                .mappings
                .get(&owner)
                .is_some_and(|m| m.depot_path.is_some());
            if owner_has_depot {
                // The local file now belongs to another depot path.
                if let Some(mapping) = self.mappings.get_mut(&owner) {
                    mapping.local_path = None;
                }
            } else {
                self.mappings.remove(&owner);
                self.merged.insert(owner, id);
                debug!(from = owner.0, into = id.0, "local-only mapping merged");
            }
        }
        if let Some(old) = current
            && self.by_local.get(&old) == Some(&id)
        {
            self.by_local.remove(&old);
        }
        self.by_local.insert(local.clone(), id);
        if let Some(mapping) = self.mappings.get_mut(&id) {
            mapping.local_path = Some(local.clone());
        }
    }

    /// View over every live mapping. Each call to [`AllFiles::iter`]
    /// starts a fresh pass.
    pub fn all_files(&self) -> AllFiles<'_> {
        AllFiles { repo: self }
    }

    /// Drop every mapping whose id is not in `live`. Returns the number removed.
    pub fn retain_referenced(&mut self, live: &HashSet<MappingId>) -> usize {
        let keep: HashSet<MappingId> = live.iter().map(|&id| self.resolve(id)).collect();
        let before = self.mappings.len();
        self.mappings.retain(|id, _| keep.contains(id));
        let mappings = &self.mappings;
        self.by_depot.retain(|_, id| mappings.contains_key(id));
        self.by_local.retain(|_, id| mappings.contains_key(id));

        // Keep an alias only if it still reaches a live mapping.
        let targets: HashMap<MappingId, MappingId> = self
            .merged
            .keys()
            .map(|&from| (from, self.resolve(from)))
            .collect();
        self.merged
            .retain(|from, _| targets.get(from).is_some_and(|to| mappings.contains_key(to)));

        let removed = before - self.mappings.len();
        if removed > 0 {
            debug!(removed, remaining = self.mappings.len(), "unreferenced mappings pruned");
        }
        removed
    }
}

/// Restartable view over the mappings in a repo.
#[derive(Debug, Clone, Copy)]
pub struct AllFiles<'a> {
    repo: &'a FileMappingRepo,
}

impl<'a> AllFiles<'a> {
    pub fn iter(&self) -> impl Iterator<Item = (MappingId, &'a P4ClientFileMapping)> + 'a {
        self.repo.mappings.iter().map(|(&id, mapping)| (id, mapping))
    }

    pub fn len(&self) -> usize {
        self.repo.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repo.mappings.is_empty()
    }
}

impl<'a> IntoIterator for &AllFiles<'a> {
    type Item = (MappingId, &'a P4ClientFileMapping);
    type IntoIter = Box<dyn Iterator<Item = Self::Item> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}
