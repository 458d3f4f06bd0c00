//! Block-join role cache.

use std::collections::{HashMap, HashSet};

use tokio::sync::Mutex;

/// Which side of a block a document sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockRole {
    Parent,
    Child,
}

/// Ids known to be block-join parents or children, filled in one query per
/// role on first lookup and dropped after every load or drop.
#[derive(Debug, Default)]
pub struct ExistenceCache {
    roles: Mutex<HashMap<BlockRole, HashSet<String>>>,
}

impl ExistenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` until the role has been filled.
    pub async fn lookup(&self, role: BlockRole, id: &str) -> Option<bool> {
        self.roles.lock().await.get(&role).map(|ids| ids.contains(id))
    }

    /// Replace the cached ids of `role` and answer `id` against them.
    pub async fn fill<I>(&self, role: BlockRole, ids: I, id: &str) -> bool
    where
        I: IntoIterator<Item = String>,
    {
        let ids: HashSet<String> = ids.into_iter().collect();
        let found = ids.contains(id);
        self.roles.lock().await.insert(role, ids);
        found
    }

    pub async fn is_filled(&self, role: BlockRole) -> bool {
        self.roles.lock().await.contains_key(&role)
    }

    pub async fn clear(&self) {
        self.roles.lock().await.clear();
    }
}
