//! Live route table
//!
//! Maps a path to the handler currently bound to it. Readers take a snapshot
//! of the whole map, clone the entry they need and drop the snapshot before
//! running the handler, so a request never holds anything that blocks a
//! swap. The entry `Arc` a request holds keeps the old handler (and its
//! library) alive until that request finishes.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::http::Method;

use super::handler::LoadedHandler;

/// The binding of one path to its current handler
#[derive(Debug)]
pub struct RouteEntry {
    pub path: String,
    pub methods: Vec<Method>,
    pub handler: Arc<LoadedHandler>,
    /// 1 when first installed, +1 on every replacement
    pub revision: u64,
}

impl RouteEntry {
    pub fn module(&self) -> &str {
        self.handler.module()
    }

    pub fn allows(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }

    /// Value for an `Allow` header
    pub fn allow_header(&self) -> String {
        self.methods
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Outcome of installing a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Publication {
    Installed { path: String },
    Replaced { path: String, previous_module: String, revision: u64 },
}

/// Path -> route entry, swapped atomically on every change
pub struct RouteTable {
    routes: ArcSwap<HashMap<String, Arc<RouteEntry>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Entry currently bound to `path`
    pub fn lookup(&self, path: &str) -> Option<Arc<RouteEntry>> {
        self.routes.load().get(path).cloned()
    }

    /// Bind the handler's path to it, replacing whatever was bound before.
    pub fn install(&self, handler: Arc<LoadedHandler>) -> Publication {
        let path = handler.path().to_string();
        let mut publication = None;

        self.routes.rcu(|current| {
            let mut next = HashMap::<String, Arc<RouteEntry>>::clone(current);
            let (revision, outcome) = match current.get(&path) {
                Some(previous) => (
                    previous.revision + 1,
                    Publication::Replaced {
                        path: path.clone(),
                        previous_module: previous.module().to_string(),
                        revision: previous.revision + 1,
                    },
                ),
                None => (1, Publication::Installed { path: path.clone() }),
            };
            next.insert(
                path.clone(),
                Arc::new(RouteEntry {
                    path: path.clone(),
                    methods: handler.methods().to_vec(),
                    handler: Arc::clone(&handler),
                    revision,
                }),
            );
            publication = Some(outcome);
            next
        });

        publication.unwrap_or(Publication::Installed { path })
    }

    /// Installed paths, sorted
    #[cfg(test)]
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.routes.load().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.routes.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
