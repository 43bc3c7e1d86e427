//! The node arena: insertion-ordered storage keyed by name.
//!
//! The graph is the sole owner of every node. Iteration order is the
//! insertion order, so exports and diffs are reproducible run to run.

use std::collections::HashMap;

use crate::error::{ModelError, Result};
use crate::node::Node;

#[derive(Debug, Clone, Default)]
pub(crate) struct NodeRegistry {
    nodes: Vec<Node>,
    // name -> position in `nodes`
    index: HashMap<String, usize>,
}

impl NodeRegistry {
    pub fn new() -> NodeRegistry {
        NodeRegistry::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.index.get(name).copied().map(move |i| &mut self.nodes[i])
    }

    /// Inserts a node, replacing any node of the same name in place (the
    /// replacement keeps the original's position). Returns the replaced
    /// node, if any.
    pub fn insert(&mut self, node: Node) -> Option<Node> {
        let name = node.name().to_string();
        match self.index.get(&name) {
            Some(&i) => Some(std::mem::replace(&mut self.nodes[i], node)),
            None => {
                self.index.insert(name, self.nodes.len());
                self.nodes.push(node);
                None
            }
        }
    }

    /// Removes a node by name. Positions of later nodes shift down by one.
    pub fn remove(&mut self, name: &str) -> Result<Node> {
        let i = self
            .index
            .remove(name)
            .ok_or_else(|| ModelError::Node(format!("node '{name}' not found")))?;
        let node = self.nodes.remove(i);
        for position in self.index.values_mut() {
            if *position > i {
                *position -= 1;
            }
        }
        Ok(node)
    }

    /// Node names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(Node::name)
    }

    /// Nodes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.iter_mut()
    }

    /// Renames a node in place, keeping its position. The caller is
    /// responsible for rewriting references held by other nodes.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        if self.contains(new) {
            return Err(ModelError::Node(format!(
                "cannot rename '{old}': node '{new}' already exists"
            )));
        }
        let i = self
            .index
            .remove(old)
            .ok_or_else(|| ModelError::Node(format!("node '{old}' not found")))?;
        self.nodes[i].set_name(new);
        self.index.insert(new.to_string(), i);
        Ok(())
    }
}
