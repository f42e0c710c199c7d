//! Container-scoped security filtering for search.
//!
//! Documents carry the id of the container they belong to, and optionally
//! the id of a finer-grained securable resource. A search is scoped to the
//! set of containers the identity may read under the search root; hits
//! outside that set never reach the caller.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use crate::index::HitFilter;
use crate::models::StoredFields;

/// Who is searching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            groups: Vec::new(),
        }
    }

    pub fn guest() -> Self {
        Self::new("guest")
    }
}

/// A multi-tenant scoping unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    /// Non-searchable containers are skipped when walking a subtree.
    #[serde(default = "default_true")]
    pub searchable: bool,
    #[serde(default)]
    pub workbook: bool,
}

fn default_true() -> bool {
    true
}

pub trait ContainerDirectory: Send + Sync {
    fn container(&self, id: &str) -> Option<Container>;

    fn children(&self, id: &str) -> Vec<Container>;

    /// `id` itself followed by every container below it, breadth first.
    fn subtree(&self, id: &str) -> Vec<Container> {
        let mut out = Vec::new();
        let Some(root) = self.container(id) else {
            return out;
        };
        // A misconfigured parent chain can loop back on itself.
        let mut seen = HashSet::from([root.id.clone()]);
        let mut queue = VecDeque::from([root]);
        while let Some(c) = queue.pop_front() {
            for child in self.children(&c.id) {
                if seen.insert(child.id.clone()) {
                    queue.push_back(child);
                }
            }
            out.push(c);
        }
        out
    }
}

pub trait SecurityPolicy: Send + Sync {
    fn can_read(&self, identity: &Identity, container_id: &str) -> bool;

    fn can_read_resource(&self, identity: &Identity, resource_id: &str) -> bool;
}

/// Containers whose documents `identity` may see for this search.
///
/// Recursive scope walks the subtree under `root`, skipping workbooks and
/// non-searchable containers; the current container is added back when it
/// is itself a workbook or flagged searchable. Non-recursive scope is just
/// `root`.
pub fn search_containers(
    directory: &dyn ContainerDirectory,
    policy: &dyn SecurityPolicy,
    identity: &Identity,
    root: &str,
    current: Option<&str>,
    recursive: bool,
) -> HashSet<String> {
    let mut ids = HashSet::new();
    if !recursive {
        if policy.can_read(identity, root) {
            ids.insert(root.to_string());
        }
        return ids;
    }

    for c in directory.subtree(root) {
        if c.workbook || !c.searchable {
            continue;
        }
        if policy.can_read(identity, &c.id) {
            ids.insert(c.id);
        }
    }

    if let Some(current) = current.and_then(|id| directory.container(id)) {
        if (current.workbook || current.searchable) && policy.can_read(identity, &current.id) {
            ids.insert(current.id);
        }
    }
    ids
}

/// Accepts only documents in an allowed container whose securable resource,
/// if any, is readable. Resource decisions are cached for the filter's
/// lifetime, i.e. one query.
pub struct SecurityFilter {
    containers: HashSet<String>,
    identity: Identity,
    policy: Arc<dyn SecurityPolicy>,
    resource_cache: Mutex<HashMap<String, bool>>,
}

impl SecurityFilter {
    pub fn new(
        containers: HashSet<String>,
        identity: Identity,
        policy: Arc<dyn SecurityPolicy>,
    ) -> Self {
        Self {
            containers,
            identity,
            policy,
            resource_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn containers(&self) -> &HashSet<String> {
        &self.containers
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

impl HitFilter for SecurityFilter {
    fn accept(&self, stored: &StoredFields) -> bool {
        if !self.containers.contains(&stored.container) {
            return false;
        }
        let Some(resource_id) = stored.resource_id.as_deref() else {
            return true;
        };
        if resource_id == stored.container {
            return true;
        }
        let mut cache = self.resource_cache.lock().unwrap();
        *cache
            .entry(resource_id.to_string())
            .or_insert_with(|| self.policy.can_read_resource(&self.identity, resource_id))
    }
}

/// A securable resource below container level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Securable {
    pub id: String,
    pub container: String,
    #[serde(default)]
    pub readers: Vec<String>,
}

struct DirectoryState {
    containers: HashMap<String, Container>,
    children: HashMap<String, Vec<String>>,
    readers: HashMap<String, HashSet<String>>,
    securables: HashMap<String, Securable>,
}

/// In-process container tree and access lists, used when the host
/// application does not plug in its own.
///
/// A reader entry matches an identity name, one of its groups, or `*`.
pub struct StaticDirectory {
    state: RwLock<DirectoryState>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(DirectoryState {
                containers: HashMap::new(),
                children: HashMap::new(),
                readers: HashMap::new(),
                securables: HashMap::new(),
            }),
        }
    }

    pub fn add_container(&self, container: Container, readers: &[String]) {
        let mut state = self.state.write().unwrap();
        if let Some(parent) = &container.parent {
            let siblings = state.children.entry(parent.clone()).or_default();
            if !siblings.contains(&container.id) {
                siblings.push(container.id.clone());
            }
        }
        state
            .readers
            .insert(container.id.clone(), readers.iter().cloned().collect());
        state.containers.insert(container.id.clone(), container);
    }

    pub fn add_securable(&self, securable: Securable) {
        let mut state = self.state.write().unwrap();
        state.securables.insert(securable.id.clone(), securable);
    }

    pub fn grant(&self, container_id: &str, reader: &str) {
        let mut state = self.state.write().unwrap();
        state
            .readers
            .entry(container_id.to_string())
            .or_default()
            .insert(reader.to_string());
    }

    pub fn revoke(&self, container_id: &str, reader: &str) {
        let mut state = self.state.write().unwrap();
        if let Some(readers) = state.readers.get_mut(container_id) {
            readers.remove(reader);
        }
    }
}

impl Default for StaticDirectory {
    fn default() -> Self {
        Self::new()
    }
}

fn reader_matches<'a>(mut readers: impl Iterator<Item = &'a String>, identity: &Identity) -> bool {
    readers.any(|r| r == "*" || *r == identity.name || identity.groups.contains(r))
}

impl ContainerDirectory for StaticDirectory {
    fn container(&self, id: &str) -> Option<Container> {
        self.state.read().unwrap().containers.get(id).cloned()
    }

    fn children(&self, id: &str) -> Vec<Container> {
        let state = self.state.read().unwrap();
        state
            .children
            .get(id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|c| state.containers.get(c).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl SecurityPolicy for StaticDirectory {
    fn can_read(&self, identity: &Identity, container_id: &str) -> bool {
        let state = self.state.read().unwrap();
        state
            .readers
            .get(container_id)
            .is_some_and(|readers| reader_matches(readers.iter(), identity))
    }

    fn can_read_resource(&self, identity: &Identity, resource_id: &str) -> bool {
        let state = self.state.read().unwrap();
        state
            .securables
            .get(resource_id)
            .is_some_and(|s| reader_matches(s.readers.iter(), identity))
    }
}
