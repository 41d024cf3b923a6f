//! Bindings between tree nodes and the editor's test items
//!
//! The UI keeps opaque item handles for the nodes it shows. Both directions
//! are explicit tables whose entries die exactly when the tree drops the
//! node, never later.

use std::collections::HashMap;

use crate::model::NodeId;

/// Opaque identity of a UI-side test item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemId(pub String);

impl From<&str> for ItemId {
    fn from(s: &str) -> ItemId {
        ItemId(s.to_string())
    }
}

#[derive(Debug, Default)]
pub struct ItemBindings {
    by_node: HashMap<NodeId, ItemId>,
    by_item: HashMap<ItemId, NodeId>,
}

impl ItemBindings {
    pub fn new() -> ItemBindings {
        ItemBindings::default()
    }

    pub fn bind(&mut self, node: NodeId, item: ItemId) {
        if let Some(old) = self.by_node.insert(node, item.clone()) {
            self.by_item.remove(&old);
        }
        self.by_item.insert(item, node);
    }

    pub fn item_for(&self, node: NodeId) -> Option<&ItemId> {
        self.by_node.get(&node)
    }

    pub fn node_for(&self, item: &ItemId) -> Option<NodeId> {
        self.by_item.get(item).copied()
    }

    /// Drop bindings for nodes the tree just removed.
    pub fn purge(&mut self, removed: &[NodeId]) {
        for node in removed {
            if let Some(item) = self.by_node.remove(node) {
                self.by_item.remove(&item);
            }
        }
    }

    pub fn clear(&mut self) {
        self.by_node.clear();
        self.by_item.clear();
    }
}
