//! The compiled access plan.

use std::collections::BTreeSet;

use indexmap::IndexMap;

use crate::buffer::{Role, RoleKind};
use crate::compiler::extension::ExtensionSet;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::schema::{Kind, Node, NodeId, Packing, Schema};

/// Handle into a `Generator` arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenId(pub(crate) usize);

impl GenId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A resolved buffer name and the reader cache index it is memoized in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub name: String,
    pub cache: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerTarget {
    /// Input node still waiting for the finalize pass.
    Pending(NodeId),
    /// Back-reference into the same compiled tree.
    Internal(GenId),
    /// Root of a separately compiled subtree.
    External(GenId),
}

#[derive(Debug, Clone)]
pub enum GenKind {
    Primitive { dtype: DType, dims: Vec<usize>, data: Slot },
    List { starts: Slot, stops: Slot, content: GenId },
    Union { tags: Slot, offsets: Slot, possibilities: Vec<GenId> },
    Record { fields: IndexMap<String, GenId> },
    Tuple { types: Vec<GenId> },
    Pointer { positions: Slot, target: PointerTarget },
}

#[derive(Debug, Clone)]
pub struct GenNode {
    pub kind: GenKind,
    pub mask: Option<Slot>,
    /// Prefix this node's default names were derived from.
    pub prefix: String,
    pub namespace: String,
    pub name: Option<String>,
    pub doc: Option<String>,
    pub packing: Option<Packing>,
    /// First matching extension in the set the generator was built with.
    pub extension: Option<usize>,
    /// Input node this was compiled from.
    pub origin: NodeId,
}

impl GenNode {
    pub fn nullable(&self) -> bool {
        self.mask.is_some()
    }

    /// Every slot with its role, mask first.
    pub fn slots(&self) -> Vec<(RoleKind, &Slot)> {
        let mut out = Vec::new();
        if let Some(mask) = &self.mask {
            out.push((RoleKind::Mask, mask));
        }
        match &self.kind {
            GenKind::Primitive { data, .. } => out.push((RoleKind::Data, data)),
            GenKind::List { starts, stops, .. } => {
                out.push((RoleKind::Starts, starts));
                out.push((RoleKind::Stops, stops));
            }
            GenKind::Union { tags, offsets, .. } => {
                out.push((RoleKind::Tags, tags));
                out.push((RoleKind::Offsets, offsets));
            }
            GenKind::Record { .. } | GenKind::Tuple { .. } => {}
            GenKind::Pointer { positions, .. } => out.push((RoleKind::Positions, positions)),
        }
        out
    }
}

/// Immutable result of one compilation.
#[derive(Debug, Clone)]
pub struct Generator {
    pub(crate) nodes: Vec<GenNode>,
    pub(crate) root: GenId,
    pub(crate) cache_len: usize,
    pub(crate) prefix: String,
    pub(crate) delimiter: String,
    pub(crate) extensions: ExtensionSet,
    pub(crate) schema: Schema,
}

impl Generator {
    pub fn root(&self) -> GenId {
        self.root
    }

    pub fn node(&self, id: GenId) -> &GenNode {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = GenId> + '_ {
        (0..self.nodes.len()).map(GenId)
    }

    /// Number of reader cache slots allocated across every compiled subtree.
    pub fn cache_len(&self) -> usize {
        self.cache_len
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    pub fn extensions(&self) -> &ExtensionSet {
        &self.extensions
    }

    /// The schema this was compiled from.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn target(&self, id: GenId) -> Result<GenId> {
        match &self.node(id).kind {
            GenKind::Pointer { target: PointerTarget::Internal(t) | PointerTarget::External(t), .. } => Ok(*t),
            GenKind::Pointer { target: PointerTarget::Pending(_), .. } => {
                Err(Error::malformed("pointer target was never resolved"))
            }
            _ => Err(Error::shape("not a pointer")),
        }
    }

    pub fn pointer_target(&self, id: GenId) -> Option<PointerTarget> {
        match &self.node(id).kind {
            GenKind::Pointer { target, .. } => Some(*target),
            _ => None,
        }
    }

    pub fn roles(&self, id: GenId) -> Vec<Role> {
        let node = self.node(id);
        node.slots()
            .into_iter()
            .map(|(kind, slot)| Role::new(kind, slot.name.clone(), node.namespace.clone()))
            .collect()
    }

    /// Namespaces referenced by any compiled node, the default one excluded.
    pub fn namespaces(&self) -> BTreeSet<String> {
        self.nodes
            .iter()
            .filter(|n| !n.namespace.is_empty())
            .map(|n| n.namespace.clone())
            .collect()
    }

    /// A schema with every buffer name explicit. Its `NodeId(i)` is the
    /// counterpart of `GenId(i)`.
    pub fn named_schema(&self) -> Result<Schema> {
        let mut out = Schema::new();
        for g in &self.nodes {
            let kind = match &g.kind {
                GenKind::Primitive { dtype, dims, data } => Kind::Primitive {
                    dtype: *dtype,
                    dims: dims.clone(),
                    data: Some(data.name.clone()),
                },
                GenKind::List { starts, stops, content } => Kind::List {
                    content: NodeId(content.0),
                    starts: Some(starts.name.clone()),
                    stops: Some(stops.name.clone()),
                },
                GenKind::Union { tags, offsets, possibilities } => Kind::Union {
                    possibilities: possibilities.iter().map(|p| NodeId(p.0)).collect(),
                    tags: Some(tags.name.clone()),
                    offsets: Some(offsets.name.clone()),
                },
                GenKind::Record { fields } => Kind::Record {
                    fields: fields.iter().map(|(k, v)| (k.clone(), NodeId(v.0))).collect(),
                },
                GenKind::Tuple { types } => Kind::Tuple { types: types.iter().map(|t| NodeId(t.0)).collect() },
                GenKind::Pointer { positions, target } => Kind::Pointer {
                    target: match target {
                        PointerTarget::Internal(t) | PointerTarget::External(t) => Some(NodeId(t.0)),
                        PointerTarget::Pending(_) => {
                            return Err(Error::malformed("pointer target was never resolved"));
                        }
                    },
                    positions: Some(positions.name.clone()),
                },
            };
            out.push_node(Node {
                kind,
                nullable: g.nullable(),
                mask: g.mask.as_ref().map(|m| m.name.clone()),
                packing: g.packing.clone(),
                name: g.name.clone(),
                doc: g.doc.clone(),
                namespace: g.namespace.clone(),
            });
        }
        out.set_root(NodeId(self.root.0))?;
        Ok(out)
    }
}
