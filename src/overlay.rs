//! Layered buffer source: an untouched old source plus a private,
//! namespaced, in-memory layer for buffers an operation introduces.
//!
//! Operations never write into the caller's source. They wrap it in an
//! `Overlay`, `put` new buffers for the roles of the schema nodes they
//! rewrite, and publish the overlay as the source of the new `Data`.
//! Chained operations nest overlays; `collect` flattens such a chain back
//! into one schema and one name → buffer map.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::buffer::{Buffer, BufferSink, BufferSource, MemorySource, Role, RoleKind};
use crate::compiler::{ExtensionSet, compile};
use crate::error::{Error, Result};
use crate::schema::{Kind, NodeId, Schema};

pub struct Overlay {
    old: Arc<dyn BufferSource>,
    namespace: String,
    new: MemorySource,
    counter: usize,
}

impl Overlay {
    /// Picks a namespace used neither by `old` nor by anything in `avoid`
    /// (typically the namespaces of the schema being edited).
    pub fn new(old: Arc<dyn BufferSource>, avoid: &BTreeSet<String>) -> Self {
        let taken = old.namespaces();
        let namespace = (0..)
            .map(|i| format!("namespace-{i}"))
            .find(|ns| !taken.contains(ns) && !avoid.contains(ns))
            .unwrap_or_default();
        debug!("overlay opened with namespace {:?}", namespace);
        Overlay { old, namespace, new: MemorySource::new(), counter: 0 }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn old(&self) -> &Arc<dyn BufferSource> {
        &self.old
    }

    /// Buffers written into this layer alone.
    pub fn local(&self) -> &MemorySource {
        &self.new
    }

    pub fn fresh_name(&mut self) -> String {
        loop {
            let name = format!("array-{}", self.counter);
            self.counter += 1;
            if !self.new.contains(&name) {
                return name;
            }
        }
    }

    /// Binds `buffers` to the roles of `node`, kind roles first and the mask
    /// last, and points the node at them.
    pub fn put(&mut self, schema: &mut Schema, node: NodeId, buffers: Vec<Buffer>) -> Result<()> {
        let roles: Vec<RoleKind> = schema.node(node).roles().into_iter().map(|(kind, _)| kind).collect();
        if roles.len() != buffers.len() {
            return Err(Error::Cardinality(format!(
                "a {} node needs {} buffers, got {}",
                schema.node(node).kind().name(),
                roles.len(),
                buffers.len()
            )));
        }
        for (role, buffer) in roles.into_iter().zip(buffers) {
            let name = self.fresh_name();
            schema.set_role(node, role, Some(name.clone()))?;
            self.new.insert(name, buffer);
        }
        schema.set_namespace(node, self.namespace.clone());
        Ok(())
    }
}

impl BufferSource for Overlay {
    fn get(&self, name: &str) -> Result<Arc<Buffer>> {
        self.old.get(name)
    }

    fn get_in(&self, namespace: &str, name: &str) -> Result<Arc<Buffer>> {
        if namespace == self.namespace {
            self.new.get(name).map_err(|_| Error::MissingBuffer {
                name: name.to_string(),
                namespace: namespace.to_string(),
            })
        } else {
            self.old.get_in(namespace, name)
        }
    }

    fn get_all(&self, roles: &[Role]) -> Result<IndexMap<Role, Arc<Buffer>>> {
        let (mine, theirs): (Vec<Role>, Vec<Role>) = roles.iter().cloned().partition(|r| r.namespace == self.namespace);
        let mut found = self.old.get_all(&theirs)?;
        for role in mine {
            let buffer = self.get_in(&role.namespace, &role.name)?;
            found.insert(role, buffer);
        }
        roles
            .iter()
            .map(|r| {
                found
                    .get(r)
                    .map(|b| (r.clone(), b.clone()))
                    .ok_or_else(|| Error::MissingBuffer { name: r.name.clone(), namespace: r.namespace.clone() })
            })
            .collect()
    }

    fn namespaces(&self) -> BTreeSet<String> {
        let mut out = self.old.namespaces();
        out.insert(self.namespace.clone());
        out
    }

    fn as_overlay(&self) -> Option<&Overlay> {
        Some(self)
    }

    fn close(&self) {
        self.old.close();
    }
}

impl BufferSink for Overlay {
    fn put(&mut self, name: &str, buffer: Arc<Buffer>) -> Result<()> {
        self.new.put(name, buffer)
    }
}

// ------------------------------- Collect ---------------------------------- //

fn gather(source: &dyn BufferSource, out: &mut HashMap<(String, String), Arc<Buffer>>) {
    if let Some(overlay) = source.as_overlay() {
        gather(overlay.old.as_ref(), out);
        for (name, buffer) in overlay.new.iter() {
            out.insert((overlay.namespace.clone(), name.clone()), buffer.clone());
        }
    }
}

/// The role whose presence in an overlay marks a node as rewritten.
fn primary_role(schema: &Schema, id: NodeId) -> Option<String> {
    let node = schema.node(id);
    match node.kind() {
        Kind::Record { .. } | Kind::Tuple { .. } => node.mask().map(str::to_string),
        _ => node.roles().first().and_then(|(_, name)| name.map(str::to_string)),
    }
}

/// Flattens every overlay layer under `source` into one namespace.
///
/// Returns a schema whose nodes that were rewritten by some overlay now live
/// in `namespace` under names derived from `(prefix, delimiter)`, and the
/// buffers for exactly those names. Nodes still backed by the original
/// source keep their names.
pub fn collect(
    schema: &Schema,
    source: &dyn BufferSource,
    namespace: &str,
    prefix: &str,
    delimiter: &str,
) -> Result<(Schema, IndexMap<String, Arc<Buffer>>)> {
    let mut layered = HashMap::new();
    gather(source, &mut layered);

    let mut schema = schema.clone();
    let mut old_names: HashMap<NodeId, (String, Vec<(RoleKind, String)>)> = HashMap::new();
    for id in schema.reachable(schema.root()?) {
        let Some(primary) = primary_role(&schema, id) else { continue };
        let ns = schema.node(id).namespace().to_string();
        if !layered.contains_key(&(ns.clone(), primary)) {
            continue;
        }
        let roles: Vec<(RoleKind, String)> = schema
            .node(id)
            .roles()
            .into_iter()
            .filter_map(|(kind, name)| name.map(|n| (kind, n.to_string())))
            .collect();
        for (kind, _) in &roles {
            schema.set_role(id, *kind, None)?;
        }
        schema.set_namespace(id, namespace);
        old_names.insert(id, (ns, roles));
    }

    let generator = compile(&schema, prefix, delimiter, &ExtensionSet::none())?;
    let mut buffers = IndexMap::new();
    for gid in generator.ids() {
        let node = generator.node(gid);
        let Some((old_ns, roles)) = old_names.get(&node.origin) else { continue };
        for (kind, slot) in node.slots() {
            let Some((_, old)) = roles.iter().find(|(k, _)| *k == kind) else { continue };
            let key = (old_ns.clone(), old.clone());
            let buffer = layered
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::MissingBuffer { name: key.1.clone(), namespace: key.0.clone() })?;
            buffers.insert(slot.name.clone(), buffer);
        }
    }
    debug!("collected {} overlay buffers into namespace {:?}", buffers.len(), namespace);
    Ok((generator.named_schema()?, buffers))
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    fn base() -> Arc<dyn BufferSource> {
        Arc::new(MemorySource::new().with("x", Buffer::Int32(vec![1, 2, 3])))
    }

    #[test]
    fn namespaces_avoid_collisions() {
        let avoid: BTreeSet<String> = ["namespace-0".to_string()].into();
        let first = Overlay::new(base(), &avoid);
        assert_eq!(first.namespace(), "namespace-1");
        let second = Overlay::new(Arc::new(first), &BTreeSet::new());
        assert_eq!(second.namespace(), "namespace-0");
        let third = Overlay::new(Arc::new(second), &BTreeSet::new());
        assert_eq!(third.namespace(), "namespace-2");
    }

    #[test]
    fn put_rewrites_roles_and_routes_lookups() {
        let mut s = Schema::new();
        let x = s.primitive(DType::Float64);
        s.set_nullable(x, true);
        s.set_root(x).unwrap();

        let mut overlay = Overlay::new(base(), &BTreeSet::new());
        let err = overlay.put(&mut s, x, vec![Buffer::Float64(vec![1.0])]).unwrap_err();
        assert!(matches!(err, Error::Cardinality(_)));

        overlay
            .put(&mut s, x, vec![Buffer::Float64(vec![1.0]), Buffer::Int32(vec![0])])
            .unwrap();
        let node = s.node(x);
        assert_eq!(node.namespace(), "namespace-0");
        assert_eq!(node.mask(), Some("array-1"));
        let Kind::Primitive { data, .. } = node.kind() else { panic!() };
        assert_eq!(data.as_deref(), Some("array-0"));

        assert!(overlay.get_in("namespace-0", "array-0").is_ok());
        assert!(overlay.get_in("", "x").is_ok());
        assert!(overlay.get_in("namespace-0", "x").is_err());

        let roles = vec![
            Role::new(RoleKind::Mask, "array-1", "namespace-0"),
            Role::new(RoleKind::Data, "x", ""),
        ];
        let all = overlay.get_all(&roles).unwrap();
        assert_eq!(all.keys().cloned().collect::<Vec<_>>(), roles);
    }

    #[test]
    fn collect_flattens_nested_layers() {
        let mut s = Schema::new();
        let a = s.primitive(DType::Int32);
        s.set_role(a, RoleKind::Data, Some("x".into())).unwrap();
        let b = s.primitive(DType::Float32);
        let c = s.primitive(DType::Int64);
        let rec = s.record([("a", a), ("b", b), ("c", c)]).unwrap();
        s.set_root(rec).unwrap();

        let mut first = Overlay::new(base(), &BTreeSet::new());
        first.put(&mut s, b, vec![Buffer::Float32(vec![0.5])]).unwrap();
        let mut second = Overlay::new(Arc::new(first), &BTreeSet::new());
        second.put(&mut s, c, vec![Buffer::Int64(vec![9])]).unwrap();

        let (named, buffers) = collect(&s, &second, "baked", "out", "-").unwrap();
        let keys: Vec<&str> = buffers.keys().map(String::as_str).collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&"out-Fb-Df4") && keys.contains(&"out-Fc-Di8"));
        assert_eq!(*buffers["out-Fc-Di8"], Buffer::Int64(vec![9]));

        let root = named.root().unwrap();
        let a = named.field(root, "a").unwrap();
        assert_eq!(named.node(a).namespace(), "");
        let Kind::Primitive { data, .. } = named.node(a).kind() else { panic!() };
        assert_eq!(data.as_deref(), Some("x"));
        assert_eq!(named.node(named.field(root, "b").unwrap()).namespace(), "baked");
    }
}
