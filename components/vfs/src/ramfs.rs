//! In-memory filesystem
//!
//! Directory tree kept in an arena: nodes live in a `Vec` and refer to
//! each other by index, with the parent link as `Option<usize>`. Freed
//! indices are recycled through a free list so node ids handed to the
//! VFS stay small.

use log::trace;

use crate::{FileSystem, NodeId, Result, VfsError};

enum NodeKind {
    File { data: Vec<u8> },
    Dir { children: Vec<(String, NodeId)> },
}

struct Node {
    parent: Option<NodeId>,
    kind: NodeKind,
}

/// RAM-backed filesystem.
pub struct RamFs {
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl RamFs {
    /// An empty filesystem with just a root directory (node 0).
    pub fn new() -> Self {
        Self {
            nodes: vec![Some(Node {
                parent: None,
                kind: NodeKind::Dir {
                    children: Vec::new(),
                },
            })],
            free: Vec::new(),
        }
    }

    const ROOT: NodeId = 0;

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id)
            .and_then(Option::as_ref)
            .ok_or(VfsError::BadDescriptor { fd: id })
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or(VfsError::BadDescriptor { fd: id })
    }

    fn insert(&mut self, node: Node) -> NodeId {
        if let Some(id) = self.free.pop() {
            self.nodes[id] = Some(node);
            id
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    /// Walk `path` from the root. Empty paths name the root.
    fn walk(&self, path: &str) -> Result<NodeId> {
        let mut current = Self::ROOT;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let node = self.node(current)?;
            let children = match &node.kind {
                NodeKind::Dir { children } => children,
                NodeKind::File { .. } => {
                    return Err(VfsError::NotADirectory {
                        path: path.to_string(),
                    })
                }
            };
            current = children
                .iter()
                .find(|(name, _)| name == component)
                .map(|(_, id)| *id)
                .ok_or(VfsError::NotFound {
                    path: path.to_string(),
                })?;
        }
        Ok(current)
    }

    /// Split `path` into its parent directory node and final component.
    fn walk_parent<'p>(&self, path: &'p str) -> Result<(NodeId, &'p str)> {
        let mut components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let name = components.pop().ok_or(VfsError::InvalidArgument)?;
        let parent_path = components.join("/");
        let parent = self.walk(&parent_path)?;
        if !matches!(self.node(parent)?.kind, NodeKind::Dir { .. }) {
            return Err(VfsError::NotADirectory {
                path: path.to_string(),
            });
        }
        Ok((parent, name))
    }

    fn attach(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> Result<NodeId> {
        {
            let node = self.node(parent)?;
            if let NodeKind::Dir { children } = &node.kind {
                if children.iter().any(|(n, _)| n == name) {
                    return Err(VfsError::AlreadyExists {
                        path: name.to_string(),
                    });
                }
            }
        }
        let id = self.insert(Node {
            parent: Some(parent),
            kind,
        });
        if let NodeKind::Dir { children } = &mut self.node_mut(parent)?.kind {
            children.push((name.to_string(), id));
        }
        trace!("attached {:?} as node {}", name, id);
        Ok(id)
    }
}

impl FileSystem for RamFs {
    fn lookup(&self, path: &str) -> Result<NodeId> {
        self.walk(path)
    }

    fn create_file(&mut self, path: &str) -> Result<NodeId> {
        let (parent, name) = self.walk_parent(path)?;
        self.attach(parent, name, NodeKind::File { data: Vec::new() })
    }

    fn create_dir(&mut self, path: &str) -> Result<NodeId> {
        let (parent, name) = self.walk_parent(path)?;
        self.attach(
            parent,
            name,
            NodeKind::Dir {
                children: Vec::new(),
            },
        )
    }

    fn remove(&mut self, path: &str) -> Result<()> {
        let id = self.walk(path)?;
        if id == Self::ROOT {
            return Err(VfsError::InvalidArgument);
        }
        if let NodeKind::Dir { children } = &self.node(id)?.kind {
            if !children.is_empty() {
                return Err(VfsError::NotEmpty {
                    path: path.to_string(),
                });
            }
        }
        let parent = self.node(id)?.parent.ok_or(VfsError::InvalidArgument)?;
        if let NodeKind::Dir { children } = &mut self.node_mut(parent)?.kind {
            children.retain(|(_, child)| *child != id);
        }
        self.nodes[id] = None;
        self.free.push(id);
        Ok(())
    }

    fn is_dir(&self, node: NodeId) -> Result<bool> {
        Ok(matches!(self.node(node)?.kind, NodeKind::Dir { .. }))
    }

    fn size(&self, node: NodeId) -> Result<u64> {
        match &self.node(node)?.kind {
            NodeKind::File { data } => Ok(data.len() as u64),
            NodeKind::Dir { .. } => Err(VfsError::IsADirectory {
                path: format!("node {}", node),
            }),
        }
    }

    fn read_at(&self, node: NodeId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match &self.node(node)?.kind {
            NodeKind::File { data } => {
                let offset = offset as usize;
                if offset >= data.len() {
                    return Ok(0);
                }
                let n = buf.len().min(data.len() - offset);
                buf[..n].copy_from_slice(&data[offset..offset + n]);
                Ok(n)
            }
            NodeKind::Dir { .. } => Err(VfsError::IsADirectory {
                path: format!("node {}", node),
            }),
        }
    }

    fn write_at(&mut self, node: NodeId, offset: u64, new_data: &[u8]) -> Result<usize> {
        match &mut self.node_mut(node)?.kind {
            NodeKind::File { data } => {
                let offset = offset as usize;
                let end = offset + new_data.len();
                if end > data.len() {
                    data.resize(end, 0);
                }
                data[offset..end].copy_from_slice(new_data);
                Ok(new_data.len())
            }
            NodeKind::Dir { .. } => Err(VfsError::IsADirectory {
                path: format!("node {}", node),
            }),
        }
    }

    fn truncate(&mut self, node: NodeId) -> Result<()> {
        match &mut self.node_mut(node)?.kind {
            NodeKind::File { data } => {
                data.clear();
                Ok(())
            }
            NodeKind::Dir { .. } => Err(VfsError::IsADirectory {
                path: format!("node {}", node),
            }),
        }
    }

    fn read_dir(&self, node: NodeId) -> Result<Vec<String>> {
        match &self.node(node)?.kind {
            NodeKind::Dir { children } => Ok(children.iter().map(|(name, _)| name.clone()).collect()),
            NodeKind::File { .. } => Err(VfsError::NotADirectory {
                path: format!("node {}", node),
            }),
        }
    }
}
