//! Data nodes and entity routing.

use relmap_core::{DataNode, Error, Result, Schema};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A schema plus the data nodes its entities are stored in.
///
/// Entities are served by the first node unless routed elsewhere. A route
/// registered for a root entity covers its sub-entities.
pub struct DataDomain {
    schema: Arc<Schema>,
    nodes: Vec<Box<dyn DataNode>>,
    routes: HashMap<String, usize>,
}

impl fmt::Debug for DataDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataDomain")
            .field("nodes", &self.nodes.iter().map(|n| n.name()).collect::<Vec<_>>())
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

impl DataDomain {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            nodes: Vec::new(),
            routes: HashMap::new(),
        }
    }

    /// Add a node. The first one added serves all unrouted entities.
    #[must_use]
    pub fn with_node(mut self, node: Box<dyn DataNode>) -> Self {
        self.add_node(node);
        self
    }

    /// Add a node, returning its index.
    pub fn add_node(&mut self, node: Box<dyn DataNode>) -> usize {
        tracing::debug!(node = %node.name(), index = self.nodes.len(), "Adding data node");
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Serve `entity` from the node at `index`.
    pub fn route(&mut self, entity: &str, index: usize) -> Result<()> {
        self.schema.entity(entity)?;
        if index >= self.nodes.len() {
            return Err(Error::Custom(format!(
                "no data node at index {index}, {} configured",
                self.nodes.len()
            )));
        }
        self.routes.insert(entity.to_string(), index);
        Ok(())
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Index of the node serving `entity`.
    pub fn node_index(&self, entity: &str) -> Result<usize> {
        if self.nodes.is_empty() {
            return Err(Error::Custom("data domain has no data nodes".to_string()));
        }
        if let Some(&index) = self.routes.get(entity) {
            return Ok(index);
        }
        let root = self.schema.root_entity(entity)?;
        Ok(self.routes.get(&root.name).copied().unwrap_or(0))
    }

    /// Node serving `entity`.
    pub fn node_mut(&mut self, entity: &str) -> Result<&mut dyn DataNode> {
        let index = self.node_index(entity)?;
        Ok(self.nodes[index].as_mut())
    }

    /// Mutable access to every node, in index order.
    pub fn nodes_mut(&mut self) -> impl Iterator<Item = (usize, &mut (dyn DataNode + 'static))> {
        self.nodes.iter_mut().map(|n| n.as_mut()).enumerate()
    }
}
