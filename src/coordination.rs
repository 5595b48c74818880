//! Coordination service client seam.
//!
//! The coordination engine talks to a ZooKeeper-style hierarchical store
//! through the narrow [`CoordinationClient`] trait: path creation,
//! ephemeral nodes, child listings with one-shot change watches, and plain
//! data reads and writes. A production deployment implements the trait over
//! a real client; [`InMemoryCoordination`] is a complete in-process
//! implementation with session semantics, suitable for testing and
//! development.
//!
//! Paths are slash-separated and relative to the store root, for example
//! `consumers/my-group/ids`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors reported by the coordination service.
#[derive(Error, Debug)]
pub enum CoordinationError {
    /// Create failed because the node already exists. For ownership nodes
    /// this is the "claimed by another instance" condition.
    #[error("node already exists: {path}")]
    NodeExists { path: String },

    /// The addressed node does not exist.
    #[error("node not found: {path}")]
    NotFound { path: String },

    /// The session backing this client's ephemeral nodes expired.
    #[error("coordination session expired")]
    SessionExpired,

    /// The connection to the coordination service was lost.
    #[error("connection to coordination service lost")]
    ConnectionLoss,

    /// Any other service-side failure (permissions, malformed data).
    #[error("coordination service error: {0}")]
    Other(String),
}

impl CoordinationError {
    /// Transient errors trigger a rebalance or re-registration; the rest
    /// are fatal for the group.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoordinationError::SessionExpired | CoordinationError::ConnectionLoss
        )
    }
}

/// One-shot notification that the children of a watched path changed.
///
/// Mirrors ZooKeeper watch semantics: a watch fires at most once and must
/// be re-installed to observe further changes.
pub type ChangeWatch = oneshot::Receiver<()>;

/// Narrow client interface over a strongly-consistent hierarchical store
/// with ephemeral nodes and change notifications.
///
/// `create_ephemeral` and `set_data` create missing intermediate persistent
/// nodes, so callers never need to build parent chains by hand.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Create a persistent node (and any missing parents) if absent.
    async fn ensure_path(&self, path: &str) -> Result<(), CoordinationError>;

    /// Atomically create an ephemeral node bound to this client's session.
    /// Fails with [`CoordinationError::NodeExists`] if the node is held.
    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<(), CoordinationError>;

    /// Delete a childless node.
    async fn delete(&self, path: &str) -> Result<(), CoordinationError>;

    /// Whether a node exists.
    async fn exists(&self, path: &str) -> Result<bool, CoordinationError>;

    /// Direct child names of a node, sorted.
    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError>;

    /// Direct child names plus a one-shot watch that fires on the next
    /// child creation or deletion under the path.
    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, ChangeWatch), CoordinationError>;

    /// Node content, or `None` if the node does not exist.
    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, CoordinationError>;

    /// Write node content, creating the node (persistent) if absent.
    async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), CoordinationError>;
}

struct Node {
    data: Vec<u8>,
    /// Session id for ephemeral nodes, `None` for persistent ones.
    owner: Option<u64>,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<String, Vec<oneshot::Sender<()>>>,
    next_session: u64,
}

impl Tree {
    fn fire_watches(&mut self, path: &str) {
        if let Some(senders) = self.watches.remove(path) {
            for sender in senders {
                let _ = sender.send(());
            }
        }
    }

    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{path}/");
        self.nodes
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(key, _)| key.starts_with(&prefix))
    }

    /// Create missing ancestors of `path` as persistent nodes, firing the
    /// relevant child watches.
    fn create_parents(&mut self, path: &str) {
        let mut ancestor = String::new();
        let Some((parents, _leaf)) = path.rsplit_once('/') else {
            return;
        };
        for segment in parents.split('/') {
            if !ancestor.is_empty() {
                ancestor.push('/');
            }
            ancestor.push_str(segment);
            if !self.nodes.contains_key(&ancestor) {
                self.nodes.insert(
                    ancestor.clone(),
                    Node {
                        data: Vec::new(),
                        owner: None,
                    },
                );
                self.fire_watches(parent_of(&ancestor));
            }
        }
    }

    fn remove_node(&mut self, path: &str) {
        self.nodes.remove(path);
        self.fire_watches(parent_of(path));
        // A watch on the deleted node itself also fires, as the watched
        // children list no longer exists.
        self.fire_watches(path);
    }
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

/// In-process coordination store with session-scoped ephemeral nodes.
///
/// [`session`](InMemoryCoordination::session) hands out independent client
/// handles sharing the same tree, so several consumer instances can
/// coordinate within one process. [`expire_session`] simulates a session
/// loss: every ephemeral node of that session vanishes and the affected
/// watches fire, exactly as a real store would behave.
///
/// [`expire_session`]: InMemoryCoordination::expire_session
#[derive(Clone, Default)]
pub struct InMemoryCoordination {
    tree: Arc<Mutex<Tree>>,
}

impl InMemoryCoordination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session against the shared tree.
    pub fn session(&self) -> InMemorySession {
        let mut tree = self.tree.lock();
        tree.next_session += 1;
        InMemorySession {
            tree: Arc::clone(&self.tree),
            id: tree.next_session,
        }
    }

    /// Expire a session: delete all its ephemeral nodes and fire the
    /// watches observing them.
    pub fn expire_session(&self, session_id: u64) {
        let mut tree = self.tree.lock();
        let ephemerals: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in ephemerals {
            tree.remove_node(&path);
        }
    }
}

/// A client handle bound to one session of an [`InMemoryCoordination`] tree.
/// Clones share the session; ephemeral nodes created through any clone
/// belong to the same session.
#[derive(Clone)]
pub struct InMemorySession {
    tree: Arc<Mutex<Tree>>,
    id: u64,
}

impl InMemorySession {
    /// The session id, usable with [`InMemoryCoordination::expire_session`].
    pub fn session_id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl CoordinationClient for InMemorySession {
    async fn ensure_path(&self, path: &str) -> Result<(), CoordinationError> {
        let path = normalize(path);
        if path.is_empty() {
            return Ok(());
        }
        let mut tree = self.tree.lock();
        tree.create_parents(&path);
        if !tree.nodes.contains_key(&path) {
            tree.nodes.insert(
                path.clone(),
                Node {
                    data: Vec::new(),
                    owner: None,
                },
            );
            tree.fire_watches(parent_of(&path));
        }
        Ok(())
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<(), CoordinationError> {
        let path = normalize(path);
        let mut tree = self.tree.lock();
        if tree.nodes.contains_key(&path) {
            return Err(CoordinationError::NodeExists { path });
        }
        tree.create_parents(&path);
        tree.nodes.insert(
            path.clone(),
            Node {
                data: data.to_vec(),
                owner: Some(self.id),
            },
        );
        tree.fire_watches(parent_of(&path));
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), CoordinationError> {
        let path = normalize(path);
        let mut tree = self.tree.lock();
        if !tree.nodes.contains_key(&path) {
            return Err(CoordinationError::NotFound { path });
        }
        if tree.has_children(&path) {
            return Err(CoordinationError::Other(format!(
                "node has children: {path}"
            )));
        }
        tree.remove_node(&path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, CoordinationError> {
        let path = normalize(path);
        Ok(self.tree.lock().nodes.contains_key(&path))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        let path = normalize(path);
        let tree = self.tree.lock();
        if !path.is_empty() && !tree.nodes.contains_key(&path) {
            return Err(CoordinationError::NotFound { path });
        }
        Ok(tree.child_names(&path))
    }

    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, ChangeWatch), CoordinationError> {
        let path = normalize(path);
        let mut tree = self.tree.lock();
        if !path.is_empty() && !tree.nodes.contains_key(&path) {
            return Err(CoordinationError::NotFound { path });
        }
        let names = tree.child_names(&path);
        let (sender, receiver) = oneshot::channel();
        tree.watches.entry(path).or_default().push(sender);
        Ok((names, receiver))
    }

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
        let path = normalize(path);
        Ok(self.tree.lock().nodes.get(&path).map(|n| n.data.clone()))
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), CoordinationError> {
        let path = normalize(path);
        let mut tree = self.tree.lock();
        match tree.nodes.get_mut(&path) {
            Some(node) => {
                node.data = data.to_vec();
            }
            None => {
                tree.create_parents(&path);
                tree.nodes.insert(
                    path.clone(),
                    Node {
                        data: data.to_vec(),
                        owner: None,
                    },
                );
                tree.fire_watches(parent_of(&path));
            }
        }
        Ok(())
    }
}
