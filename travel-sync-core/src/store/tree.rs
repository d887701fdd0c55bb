//! Arena-backed versioned tree.
//!
//! Nodes live in a single `Vec` and refer to children and watchers by id,
//! so there are no parent/child ownership cycles. Nodes are never freed:
//! a delete clears the value and bumps the version, leaving the node as a
//! tombstone that later merges can still compare against.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::watch::WatcherId;
use crate::key::{Key, VALUE_KEY};

pub(crate) type NodeId = usize;

pub(crate) const ROOT: NodeId = 0;

#[derive(Debug, Clone, Default)]
pub(crate) struct Node {
    pub value: Option<String>,
    /// `None` until the first local mutation; ranks below every version.
    pub version: Option<u64>,
    pub children: BTreeMap<String, NodeId>,
    pub watchers: Vec<WatcherId>,
}

impl Node {
    pub fn advance_version(&mut self) {
        self.version = Some(match self.version {
            None => 0,
            Some(v) => v + 1,
        });
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Tree {
    nodes: Vec<Node>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn child(&self, id: NodeId, segment: &str) -> Option<NodeId> {
        self.nodes[id].children.get(segment).copied()
    }

    pub fn child_or_create(&mut self, id: NodeId, segment: &str) -> NodeId {
        if let Some(child) = self.child(id, segment) {
            return child;
        }
        let child = self.nodes.len();
        self.nodes.push(Node::default());
        self.nodes[id].children.insert(segment.to_string(), child);
        child
    }

    /// Walks `key` without creating anything.
    pub fn resolve(&self, key: &[String]) -> Option<NodeId> {
        key.iter()
            .try_fold(ROOT, |node, segment| self.child(node, segment))
    }

    /// Walks `key`, creating missing nodes.
    ///
    /// Returns the target along with the watchers of every strict ancestor.
    pub fn resolve_or_create(&mut self, key: &[String]) -> (NodeId, Vec<WatcherId>) {
        let mut node = ROOT;
        let mut parent_watchers = Vec::new();
        for segment in key {
            parent_watchers.extend_from_slice(&self.nodes[node].watchers);
            node = self.child_or_create(node, segment);
        }
        (node, parent_watchers)
    }

    /// Watchers of the strict ancestors of an existing path.
    pub fn ancestor_watchers(&self, key: &[String]) -> Vec<WatcherId> {
        let mut watchers = Vec::new();
        let mut node = ROOT;
        for segment in key {
            watchers.extend_from_slice(&self.nodes[node].watchers);
            match self.child(node, segment) {
                Some(child) => node = child,
                None => break,
            }
        }
        watchers
    }

    /// Builds the nested snapshot of a subtree.
    ///
    /// A leaf becomes a string; a node with children becomes an object, with
    /// its own value (if any) under `"_"`. Empty subtrees yield `None`.
    pub fn extract(&self, id: NodeId) -> Option<Value> {
        let node = &self.nodes[id];
        let mut data = node.value.clone().map(Value::String);

        for (segment, &child) in &node.children {
            let Some(child_data) = self.extract(child) else {
                continue;
            };
            let mut map = match data.take() {
                None => Map::new(),
                Some(Value::Object(map)) => map,
                Some(leaf) => {
                    let mut map = Map::new();
                    map.insert(VALUE_KEY.to_string(), leaf);
                    map
                }
            };
            map.insert(segment.clone(), child_data);
            data = Some(Value::Object(map));
        }

        data
    }

    /// Every value in a subtree with its fully qualified key, depth first.
    pub fn entries(&self, id: NodeId, prefix: &[String]) -> Vec<(Key, String)> {
        let mut out = Vec::new();
        let mut key = prefix.to_vec();
        self.collect_entries(id, &mut key, &mut out);
        out
    }

    fn collect_entries(&self, id: NodeId, key: &mut Key, out: &mut Vec<(Key, String)>) {
        let node = &self.nodes[id];
        if let Some(value) = &node.value {
            out.push((key.clone(), value.clone()));
        }
        for (segment, &child) in &node.children {
            key.push(segment.clone());
            self.collect_entries(child, key, out);
            key.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::key;
    use serde_json::json;

    fn set(tree: &mut Tree, path: &[&str], value: &str) {
        let (id, _) = tree.resolve_or_create(&key(path));
        let node = tree.node_mut(id);
        node.value = Some(value.to_string());
        node.advance_version();
    }

    #[test]
    fn test_resolve_does_not_create() {
        let tree = Tree::new();
        assert!(tree.resolve(&key(&["a", "b"])).is_none());
        assert_eq!(tree.resolve(&[]), Some(ROOT));
    }

    #[test]
    fn test_advance_version_from_uninitialized() {
        let mut node = Node::default();
        assert_eq!(node.version, None);
        node.advance_version();
        assert_eq!(node.version, Some(0));
        node.advance_version();
        assert_eq!(node.version, Some(1));
    }

    #[test]
    fn test_extract_leaf_and_mixed_nodes() {
        let mut tree = Tree::new();
        set(&mut tree, &["trips", "t1", "destinations"], "[\"d1\"]");
        set(&mut tree, &["trips", "t1", "destinations", "d1", "place"], "{}");
        set(&mut tree, &["trips", "t1", "owner"], "alice");

        let data = tree.extract(ROOT).unwrap();
        assert_eq!(
            data,
            json!({
                "trips": {
                    "t1": {
                        "destinations": { "_": "[\"d1\"]", "d1": { "place": "{}" } },
                        "owner": "alice"
                    }
                }
            })
        );
    }

    #[test]
    fn test_extract_skips_empty_subtrees() {
        let mut tree = Tree::new();
        tree.resolve_or_create(&key(&["empty", "branch"]));
        assert!(tree.extract(ROOT).is_none());
    }

    #[test]
    fn test_entries_are_fully_qualified() {
        let mut tree = Tree::new();
        set(&mut tree, &["m", "a"], "1");
        set(&mut tree, &["m", "b"], "2");
        let id = tree.resolve(&key(&["m"])).unwrap();
        let entries = tree.entries(id, &key(&["m"]));
        assert_eq!(
            entries,
            vec![
                (key(&["m", "a"]), "1".to_string()),
                (key(&["m", "b"]), "2".to_string())
            ]
        );
    }
}
