//! Schema type system: an arena of typed nodes addressed by `NodeId`.
//!
//! Six closed kinds describe how flat buffers compose into logical values.
//! Sharing is two parents holding the same `NodeId`; cycles can only form
//! through a `Pointer` whose target is one of its ancestors. Every recursive
//! walk over a schema (equality, containment, serialization, compilation)
//! carries a visited set and treats a repeat visit as a base case.
pub mod naming;
pub mod json;
pub mod compare;
pub mod path;
pub mod show;

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::buffer::RoleKind;
use crate::dtype::DType;
use crate::error::{Error, Result};

pub use naming::{check_delimiter, is_identifier};

// ————————————————————————————————————————————————————————————————————————————
// TYPES
// ————————————————————————————————————————————————————————————————————————————

/// Handle into a `Schema` arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Opaque on-disk transform descriptor, carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Packing(pub serde_json::Value);

#[derive(Debug, Clone, PartialEq)]
pub enum Kind {
    Primitive { dtype: DType, dims: Vec<usize>, data: Option<String> },
    List { content: NodeId, starts: Option<String>, stops: Option<String> },
    Union { possibilities: Vec<NodeId>, tags: Option<String>, offsets: Option<String> },
    Record { fields: IndexMap<String, NodeId> },
    Tuple { types: Vec<NodeId> },
    /// `target` may stay unset while a schema is under construction.
    Pointer { target: Option<NodeId>, positions: Option<String> },
}

impl Kind {
    pub fn name(&self) -> &'static str {
        match self {
            Kind::Primitive { .. } => "primitive",
            Kind::List { .. } => "list",
            Kind::Union { .. } => "union",
            Kind::Record { .. } => "record",
            Kind::Tuple { .. } => "tuple",
            Kind::Pointer { .. } => "pointer",
        }
    }

    /// Direct children, pointer target included.
    pub fn children(&self) -> Vec<NodeId> {
        match self {
            Kind::Primitive { .. } => Vec::new(),
            Kind::List { content, .. } => vec![*content],
            Kind::Union { possibilities, .. } => possibilities.clone(),
            Kind::Record { fields } => fields.values().copied().collect(),
            Kind::Tuple { types } => types.clone(),
            Kind::Pointer { target, .. } => target.iter().copied().collect(),
        }
    }

    fn children_mut(&mut self) -> Vec<&mut NodeId> {
        match self {
            Kind::Primitive { .. } => Vec::new(),
            Kind::List { content, .. } => vec![content],
            Kind::Union { possibilities, .. } => possibilities.iter_mut().collect(),
            Kind::Record { fields } => fields.values_mut().collect(),
            Kind::Tuple { types } => types.iter_mut().collect(),
            Kind::Pointer { target, .. } => target.iter_mut().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub(crate) kind: Kind,
    pub(crate) nullable: bool,
    pub(crate) mask: Option<String>,
    pub(crate) packing: Option<Packing>,
    pub(crate) name: Option<String>,
    pub(crate) doc: Option<String>,
    /// Empty for buffers of the caller's own source.
    pub(crate) namespace: String,
}

impl Node {
    fn new(kind: Kind) -> Self {
        Node {
            kind,
            nullable: false,
            mask: None,
            packing: None,
            name: None,
            doc: None,
            namespace: String::new(),
        }
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }
    pub fn nullable(&self) -> bool {
        self.nullable
    }
    pub fn mask(&self) -> Option<&str> {
        self.mask.as_deref()
    }
    pub fn packing(&self) -> Option<&Packing> {
        self.packing.as_ref()
    }
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_list(&self) -> bool {
        matches!(self.kind, Kind::List { .. })
    }
    pub fn is_record(&self) -> bool {
        matches!(self.kind, Kind::Record { .. })
    }
    pub fn is_pointer(&self) -> bool {
        matches!(self.kind, Kind::Pointer { .. })
    }

    /// Buffer roles of this node, kind roles first and the mask last.
    pub fn roles(&self) -> Vec<(RoleKind, Option<&str>)> {
        let mut out = match &self.kind {
            Kind::Primitive { data, .. } => vec![(RoleKind::Data, data.as_deref())],
            Kind::List { starts, stops, .. } => vec![
                (RoleKind::Starts, starts.as_deref()),
                (RoleKind::Stops, stops.as_deref()),
            ],
            Kind::Union { tags, offsets, .. } => vec![
                (RoleKind::Tags, tags.as_deref()),
                (RoleKind::Offsets, offsets.as_deref()),
            ],
            Kind::Record { .. } | Kind::Tuple { .. } => Vec::new(),
            Kind::Pointer { positions, .. } => vec![(RoleKind::Positions, positions.as_deref())],
        };
        if self.nullable {
            out.push((RoleKind::Mask, self.mask.as_deref()));
        }
        out
    }
}

/// Arena of nodes with a designated root.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    nodes: Vec<Node>,
    root: Option<NodeId>,
}

// ————————————————————————————————————————————————————————————————————————————
// CONSTRUCTION
// ————————————————————————————————————————————————————————————————————————————

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, kind: Kind) -> NodeId {
        self.nodes.push(Node::new(kind));
        NodeId(self.nodes.len() - 1)
    }

    pub(crate) fn push_node(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub fn primitive(&mut self, dtype: DType) -> NodeId {
        self.push(Kind::Primitive { dtype, dims: Vec::new(), data: None })
    }

    pub fn primitive_with_dims(&mut self, dtype: DType, dims: Vec<usize>) -> NodeId {
        self.push(Kind::Primitive { dtype, dims, data: None })
    }

    pub fn list(&mut self, content: NodeId) -> NodeId {
        self.push(Kind::List { content, starts: None, stops: None })
    }

    pub fn union(&mut self, possibilities: Vec<NodeId>) -> NodeId {
        self.push(Kind::Union { possibilities, tags: None, offsets: None })
    }

    /// Field names must be identifiers. An empty record is allowed here
    /// but rejected by the compiler.
    pub fn record<I, S>(&mut self, fields: I) -> Result<NodeId>
    where
        I: IntoIterator<Item = (S, NodeId)>,
        S: Into<String>,
    {
        let mut map = IndexMap::new();
        for (name, id) in fields {
            let name = name.into();
            if !is_identifier(&name) {
                return Err(Error::invalid(format!("record field name {name:?} is not an identifier")));
            }
            map.insert(name, id);
        }
        Ok(self.push(Kind::Record { fields: map }))
    }

    pub fn tuple(&mut self, types: Vec<NodeId>) -> NodeId {
        self.push(Kind::Tuple { types })
    }

    pub fn pointer(&mut self, target: Option<NodeId>) -> NodeId {
        self.push(Kind::Pointer { target, positions: None })
    }

    pub fn set_root(&mut self, id: NodeId) -> Result<()> {
        self.check(id)?;
        self.root = Some(id);
        Ok(())
    }

    pub fn root(&self) -> Result<NodeId> {
        self.root.ok_or_else(|| Error::malformed("schema has no root"))
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId)
    }

    fn check(&self, id: NodeId) -> Result<()> {
        if id.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(Error::OutOfBounds { index: id.0, len: self.nodes.len() })
        }
    }
}

// ————————————————————————————————————————————————————————————————————————————
// PROPERTY SETTERS
// ————————————————————————————————————————————————————————————————————————————

impl Schema {
    pub fn set_nullable(&mut self, id: NodeId, nullable: bool) {
        self.node_mut(id).nullable = nullable;
    }

    pub fn set_name(&mut self, id: NodeId, name: Option<&str>) -> Result<()> {
        if let Some(name) = name {
            if !is_identifier(name) {
                return Err(Error::invalid(format!("name {name:?} is not an identifier")));
            }
        }
        self.node_mut(id).name = name.map(str::to_string);
        Ok(())
    }

    pub fn set_doc(&mut self, id: NodeId, doc: Option<String>) {
        self.node_mut(id).doc = doc;
    }

    pub fn set_packing(&mut self, id: NodeId, packing: Option<Packing>) {
        self.node_mut(id).packing = packing;
    }

    pub fn set_namespace(&mut self, id: NodeId, namespace: impl Into<String>) {
        self.node_mut(id).namespace = namespace.into();
    }

    /// Sets (or clears) the buffer name of one role.
    pub fn set_role(&mut self, id: NodeId, role: RoleKind, name: Option<String>) -> Result<()> {
        let node = self.node_mut(id);
        let slot = match (role, &mut node.kind) {
            (RoleKind::Mask, _) => &mut node.mask,
            (RoleKind::Data, Kind::Primitive { data, .. }) => data,
            (RoleKind::Starts, Kind::List { starts, .. }) => starts,
            (RoleKind::Stops, Kind::List { stops, .. }) => stops,
            (RoleKind::Tags, Kind::Union { tags, .. }) => tags,
            (RoleKind::Offsets, Kind::Union { offsets, .. }) => offsets,
            (RoleKind::Positions, Kind::Pointer { positions, .. }) => positions,
            (role, kind) => {
                return Err(Error::invalid(format!("a {} node has no {role:?} buffer", kind.name())));
            }
        };
        *slot = name;
        Ok(())
    }

    pub fn set_dims(&mut self, id: NodeId, new_dims: Vec<usize>) -> Result<()> {
        match &mut self.node_mut(id).kind {
            Kind::Primitive { dims, .. } => {
                *dims = new_dims;
                Ok(())
            }
            other => Err(Error::invalid(format!("dims set on a {} node", other.name()))),
        }
    }

    /// A pointer may not target itself; it would never resolve to a value.
    pub fn set_target(&mut self, id: NodeId, new_target: Option<NodeId>) -> Result<()> {
        if new_target == Some(id) {
            return Err(Error::invalid("pointer may not point directly at itself"));
        }
        if let Some(t) = new_target {
            self.check(t)?;
        }
        match &mut self.node_mut(id).kind {
            Kind::Pointer { target, .. } => {
                *target = new_target;
                Ok(())
            }
            other => Err(Error::invalid(format!("target set on a {} node", other.name()))),
        }
    }

    /// A list may not contain itself, directly or through other lists.
    pub fn set_content(&mut self, id: NodeId, child: NodeId) -> Result<()> {
        self.check(child)?;
        if self.node(id).is_list() && self.lists_reach(child, id) {
            return Err(Error::invalid("list may not contain itself"));
        }
        match &mut self.node_mut(id).kind {
            Kind::List { content, .. } => {
                *content = child;
                Ok(())
            }
            other => Err(Error::invalid(format!("content set on a {} node", other.name()))),
        }
    }

    /// Adds or replaces a record field.
    pub fn insert_field(&mut self, id: NodeId, name: &str, child: NodeId) -> Result<()> {
        if !is_identifier(name) {
            return Err(Error::invalid(format!("record field name {name:?} is not an identifier")));
        }
        self.check(child)?;
        match &mut self.node_mut(id).kind {
            Kind::Record { fields } => {
                fields.insert(name.to_string(), child);
                Ok(())
            }
            other => Err(Error::shape(format!("cannot add field {name:?} to a {}", other.name()))),
        }
    }

    pub fn remove_field(&mut self, id: NodeId, name: &str) -> Result<NodeId> {
        match &mut self.node_mut(id).kind {
            Kind::Record { fields } => fields
                .shift_remove(name)
                .ok_or_else(|| Error::shape(format!("record has no field {name:?}"))),
            other => Err(Error::shape(format!("cannot remove field {name:?} from a {}", other.name()))),
        }
    }

    /// Renames a field in place, keeping its position.
    pub fn rename_field(&mut self, id: NodeId, old: &str, new: &str) -> Result<()> {
        if !is_identifier(new) {
            return Err(Error::invalid(format!("record field name {new:?} is not an identifier")));
        }
        match &mut self.node_mut(id).kind {
            Kind::Record { fields } => {
                if old != new && fields.contains_key(new) {
                    return Err(Error::shape(format!("record already has a field named {new:?}")));
                }
                let Some(index) = fields.get_index_of(old) else {
                    return Err(Error::shape(format!("record has no field {old:?}")));
                };
                let renamed: IndexMap<String, NodeId> = fields
                    .drain(..)
                    .enumerate()
                    .map(|(i, (k, v))| if i == index { (new.to_string(), v) } else { (k, v) })
                    .collect();
                *fields = renamed;
                Ok(())
            }
            other => Err(Error::shape(format!("cannot rename a field of a {}", other.name()))),
        }
    }

    pub fn remove_type(&mut self, id: NodeId, index: usize) -> Result<NodeId> {
        match &mut self.node_mut(id).kind {
            Kind::Tuple { types } if index < types.len() => Ok(types.remove(index)),
            Kind::Tuple { types } => Err(Error::OutOfBounds { index, len: types.len() }),
            other => Err(Error::shape(format!("cannot remove a member of a {}", other.name()))),
        }
    }

    pub fn field(&self, id: NodeId, name: &str) -> Option<NodeId> {
        match &self.node(id).kind {
            Kind::Record { fields } => fields.get(name).copied(),
            _ => None,
        }
    }

    /// Name of the first field of `record` holding `child`.
    pub fn field_name_of(&self, record: NodeId, child: NodeId) -> Option<String> {
        match &self.node(record).kind {
            Kind::Record { fields } => fields.iter().find(|(_, v)| **v == child).map(|(k, _)| k.clone()),
            _ => None,
        }
    }
}

// ————————————————————————————————————————————————————————————————————————————
// GRAPH HELPERS
// ————————————————————————————————————————————————————————————————————————————

impl Schema {
    /// Every node reachable from `from`, in depth-first preorder.
    pub fn reachable(&self, from: NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            order.push(id);
            let children = self.node(id).kind.children();
            stack.extend(children.into_iter().rev());
        }
        order
    }

    /// Whether following list contents from `from` arrives at `to`.
    pub(crate) fn lists_reach(&self, from: NodeId, to: NodeId) -> bool {
        let mut seen = HashSet::new();
        let mut at = from;
        while at != to {
            if !seen.insert(at) {
                return false;
            }
            match &self.node(at).kind {
                Kind::List { content, .. } => at = *content,
                _ => return false,
            }
        }
        true
    }

    /// Shallow copy: a new node with the same kind and metadata.
    pub fn duplicate(&mut self, id: NodeId) -> NodeId {
        let node = self.node(id).clone();
        self.push_node(node)
    }

    /// Deep-copies the subgraph of `other` at `id` into this arena,
    /// preserving its sharing and cycles. Returns the copy of `id`.
    pub fn graft(&mut self, other: &Schema, id: NodeId) -> NodeId {
        let order = other.reachable(id);
        let base = self.nodes.len();
        let remap: HashMap<NodeId, NodeId> =
            order.iter().enumerate().map(|(k, old)| (*old, NodeId(base + k))).collect();
        for old in &order {
            let mut node = other.node(*old).clone();
            for child in node.kind.children_mut() {
                *child = remap[&*child];
            }
            self.nodes.push(node);
        }
        remap[&id]
    }

    /// A copy holding only the nodes reachable from `id`, rooted there.
    pub fn subtree(&self, id: NodeId) -> Schema {
        let mut out = Schema::new();
        let root = out.graft(self, id);
        out.root = Some(root);
        out
    }

    /// Drops nodes no longer reachable from the root.
    pub fn compact(&self) -> Result<Schema> {
        Ok(self.subtree(self.root()?))
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_validate_eagerly() {
        let mut s = Schema::new();
        let x = s.primitive(DType::Float64);
        let p = s.pointer(None);
        assert!(s.set_name(x, Some("_hidden")).is_err());
        assert!(s.set_name(x, Some("pt")).is_ok());
        assert!(matches!(s.set_target(p, Some(p)), Err(Error::InvalidProperty(_))));
        assert!(s.set_role(x, RoleKind::Starts, Some("a".into())).is_err());
        assert!(s.set_role(x, RoleKind::Data, Some("a".into())).is_ok());
        assert!(s.record([("1x", x)]).is_err());
    }

    #[test]
    fn rename_field_keeps_position() {
        let mut s = Schema::new();
        let a = s.primitive(DType::Int32);
        let b = s.primitive(DType::Int32);
        let r = s.record([("a", a), ("b", b)]).unwrap();
        s.rename_field(r, "a", "z").unwrap();
        let Kind::Record { fields } = s.node(r).kind() else { panic!() };
        assert_eq!(fields.keys().collect::<Vec<_>>(), ["z", "b"]);
        assert!(s.rename_field(r, "z", "b").is_err());
    }

    #[test]
    fn graft_preserves_cycles_and_sharing() {
        let mut s = Schema::new();
        let x = s.primitive(DType::Float64);
        let p = s.pointer(None);
        let r = s.record([("x", x), ("y", x), ("next", p)]).unwrap();
        s.set_target(p, Some(r)).unwrap();
        let _garbage = s.primitive(DType::Bool);
        s.set_root(r).unwrap();

        let c = s.compact().unwrap();
        assert_eq!(c.len(), 3);
        let root = c.root().unwrap();
        assert_eq!(c.field(root, "x"), c.field(root, "y"));
        let next = c.field(root, "next").unwrap();
        assert_eq!(c.node(next).kind(), &Kind::Pointer { target: Some(root), positions: None });
    }

    #[test]
    fn lists_cannot_contain_themselves() {
        let mut s = Schema::new();
        let x = s.primitive(DType::Int32);
        let inner = s.list(x);
        let outer = s.list(inner);
        assert!(matches!(s.set_content(inner, inner), Err(Error::InvalidProperty(_))));
        assert!(matches!(s.set_content(inner, outer), Err(Error::InvalidProperty(_))));

        let record = s.record([("xs", outer)]).unwrap();
        let p = s.pointer(Some(record));
        s.set_content(inner, p).unwrap();
    }
}
