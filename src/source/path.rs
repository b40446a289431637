//! Logical path reconstruction from parent links.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{NodeInfo, RemoteEntry, SourceClient};

pub struct PathResolver {
    source: Arc<dyn SourceClient>,
    nodes: DashMap<String, NodeInfo>,
}

impl PathResolver {
    pub fn new(source: Arc<dyn SourceClient>) -> Self {
        PathResolver {
            source,
            nodes: DashMap::new(),
        }
    }

    /// Seeds the node cache from a listed entry so later walks need no lookup.
    pub fn remember(&self, entry: &RemoteEntry) {
        self.nodes.insert(entry.entry_id.clone(), NodeInfo::from(entry));
    }

    async fn lookup(&self, entry_id: &str) -> Option<NodeInfo> {
        if let Some(node) = self.nodes.get(entry_id) {
            return Some(node.clone());
        }
        match self.source.node_info(entry_id).await {
            Ok(node) => {
                self.nodes.insert(entry_id.to_string(), node.clone());
                Some(node)
            }
            Err(e) => {
                warn!(entry_id, error = %e, "Ancestor lookup failed, using partial path");
                None
            }
        }
    }

    /// Builds `ancestor/.../leaf_name` by walking parent links upward.
    ///
    /// The walk stops at the first node seen twice or the first failed lookup,
    /// so it terminates on cyclic parent graphs and never fails outright.
    pub async fn resolve_path(&self, entry_id: &str, leaf_name: &str) -> String {
        let mut segments = vec![sanitize_segment(leaf_name)];
        let mut visited = HashSet::new();
        visited.insert(entry_id.to_string());

        let mut parent = self.lookup(entry_id).await.and_then(|node| node.parent_id);
        while let Some(current) = parent {
            if !visited.insert(current.clone()) {
                debug!(entry_id, cycle_at = %current, "Parent cycle detected");
                break;
            }
            let Some(node) = self.lookup(&current).await else {
                break;
            };
            segments.push(sanitize_segment(&node.name));
            parent = node.parent_id;
        }

        segments.reverse();
        segments.join("/")
    }
}

/// A `/` inside a name would otherwise introduce an extra path level.
pub(crate) fn sanitize_segment(name: &str) -> String {
    name.replace('/', "_")
}
