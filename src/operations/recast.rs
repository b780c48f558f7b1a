//! Schema-only edits. Every recasting returns data over the receiver's own
//! source; no buffer is read or written.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::buffer::RoleKind;
use crate::error::{Error, Result};
use crate::operations::{Data, chain, descend, last_component};
use crate::schema::{Kind, NodeId, Schema};

impl Data {
    /// Renames the record field at `at`.
    pub fn fieldname(&self, at: &str, name: &str) -> Result<Data> {
        debug!("fieldname {:?} -> {:?}", at, name);
        let mut schema = self.named()?;
        let nodes = chain(&schema, at)?;
        let (Some(parent), Some(old)) = (nodes.get(1), last_component(at)) else {
            return Err(Error::shape(format!("fieldname: {at:?} has no parent record")));
        };
        if !schema.node(*parent).is_record() {
            return Err(Error::shape(format!("fieldname: {at:?} is not a record field")));
        }
        schema.rename_field(*parent, old, name)?;
        self.recast(schema)
    }

    /// Names the record at `at`, looking through lists.
    pub fn recordname(&self, at: &str, name: &str) -> Result<Data> {
        debug!("recordname {:?} -> {:?}", at, name);
        let mut schema = self.named()?;
        let mut nodes = chain(&schema, at)?;
        descend(&schema, &mut nodes)?;
        if !schema.node(nodes[0]).is_record() {
            return Err(Error::shape(format!("recordname: {at:?} is not a record")));
        }
        schema.set_name(nodes[0], Some(name))?;
        self.recast(schema)
    }

    /// Keeps only the node at `at`, still wrapped in every list on the way
    /// down to it.
    pub fn project(&self, at: &str) -> Result<Data> {
        debug!("project {:?}", at);
        let schema = self.named()?;
        let path = schema.resolve(at)?;
        let Some((target, above)) = path.split_last() else {
            return Err(Error::Cardinality(format!("project: {at:?} selects nothing")));
        };
        for id in above {
            let node = schema.node(*id);
            if !node.is_list() && node.nullable() {
                return Err(Error::unsupported(format!(
                    "project: {at:?} passes through a nullable {}, whose mask would be lost",
                    node.kind().name()
                )));
            }
        }

        let mut out = Schema::new();
        let mut inner = out.graft(&schema, *target);
        for id in above.iter().rev().filter(|id| schema.node(**id).is_list()) {
            let list = out.push_node(schema.node(*id).clone());
            out.set_content(list, inner)?;
            inner = list;
        }
        out.set_root(inner)?;
        self.recast(out)
    }

    /// Keeps only the fields on the way to some path matching one of
    /// `paths` (glob patterns per component), and everything below them.
    pub fn keep<S: AsRef<str>>(&self, paths: &[S]) -> Result<Data> {
        debug!("keep {} paths", paths.len());
        let mut schema = self.named()?;
        let mut wanted = HashSet::new();
        let mut on_path = HashSet::new();
        for path in paths {
            for found in schema.matches(path.as_ref())? {
                on_path.extend(found.iter().copied());
                wanted.extend(found.last().copied());
            }
        }
        if wanted.is_empty() {
            return Err(Error::Cardinality("keep: no path matched".into()));
        }
        let root = schema.root()?;
        let mut memo = HashMap::new();
        if !prune(&mut schema, root, &wanted, &on_path, &mut memo)? {
            return Err(Error::Cardinality("keep: nothing left".into()));
        }
        self.recast(schema)
    }

    /// Removes every field matching one of `paths`. Records left empty are
    /// removed from their own parents in turn.
    pub fn drop<S: AsRef<str>>(&self, paths: &[S]) -> Result<Data> {
        debug!("drop {} paths", paths.len());
        let mut schema = self.named()?;
        let mut found = Vec::new();
        for path in paths {
            for mut nodes in schema.matches(path.as_ref())? {
                nodes.reverse();
                found.push(nodes);
            }
        }
        for nodes in found {
            remove_upward(&mut schema, &nodes)?;
        }
        self.recast(schema)
    }

    /// Lifts each field matching `paths` out of a `Record → List → Record`
    /// nesting into the outer record, as a list of its own over the same
    /// starts and stops.
    pub fn split<S: AsRef<str>>(&self, paths: &[S]) -> Result<Data> {
        debug!("split {} paths", paths.len());
        let mut schema = self.named()?;
        let mut found = Vec::new();
        for path in paths {
            for mut nodes in schema.matches(path.as_ref())? {
                nodes.reverse();
                found.push(nodes);
            }
        }
        let mut count = 0;
        for nodes in found {
            let [field, inner, list, outer, ..] = nodes[..] else { continue };
            if !(schema.node(inner).is_record() && schema.node(list).is_list() && schema.node(outer).is_record()) {
                continue;
            }
            let Some(name) = schema.field_name_of(inner, field) else { continue };
            let Some(list_name) = schema.field_name_of(outer, list) else { continue };
            if schema.field(outer, &name).is_some() {
                return Err(Error::shape(format!("split: outer record already has a field {name:?}")));
            }

            schema.remove_field(inner, &name)?;
            let lifted = schema.duplicate(list);
            schema.set_content(lifted, field)?;
            schema.insert_field(outer, &name, lifted)?;
            if matches!(schema.node(inner).kind(), Kind::Record { fields } if fields.is_empty()) {
                schema.remove_field(outer, &list_name)?;
            }
            count += 1;
        }
        if count == 0 {
            return Err(Error::Cardinality("split: no path matched a record inside a list".into()));
        }
        self.recast(schema)
    }

    /// Gathers the sibling lists matching `paths` into the records of the
    /// list at `container`, which is created as `List(Record{})` if it does
    /// not resolve. Every list must read the same starts and stops buffers.
    pub fn merge<S: AsRef<str>>(&self, container: &str, paths: &[S]) -> Result<Data> {
        debug!("merge {} paths into {:?}", paths.len(), container);
        let mut schema = self.named()?;
        let (target, record, mut constructed) = match chain(&schema, container) {
            Ok(nodes) => {
                let target = nodes[0];
                let Kind::List { content, .. } = schema.node(target).kind() else {
                    return Err(Error::shape(format!("merge: container {container:?} is not a list")));
                };
                let content = *content;
                if !schema.node(content).is_record() {
                    return Err(Error::shape(format!("merge: container {container:?} is not a list of records")));
                }
                (target, content, false)
            }
            Err(_) => {
                let (parent_path, name) = match container.rsplit_once('/') {
                    Some((parent, name)) => (parent, name),
                    None => ("", container),
                };
                let mut parent = chain(&schema, parent_path)?;
                descend(&schema, &mut parent)?;
                if !schema.node(parent[0]).is_record() {
                    return Err(Error::shape(format!("merge: {parent_path:?} is not a record")));
                }
                let record = schema.record(Vec::<(String, NodeId)>::new())?;
                let list = schema.list(record);
                schema.insert_field(parent[0], name, list)?;
                (list, record, true)
            }
        };

        let mut found = Vec::new();
        for path in paths {
            for mut nodes in schema.matches(path.as_ref())? {
                nodes.reverse();
                found.push(nodes);
            }
        }
        let mut count = 0;
        for nodes in found {
            let [list, parent, ..] = nodes[..] else { continue };
            if list == target {
                continue;
            }
            let Kind::List { content, .. } = schema.node(list).kind() else {
                return Err(Error::shape("merge: every merged path must be a list"));
            };
            let content = *content;
            if schema.node(list).nullable() {
                return Err(Error::unsupported("merge: nullable lists cannot be merged"));
            }
            let Some(name) = schema.field_name_of(parent, list) else { continue };
            if schema.field(record, &name).is_some() {
                return Err(Error::shape(format!("merge: the container already has a field {name:?}")));
            }

            if constructed {
                let (starts, stops) = list_names(&schema, list);
                let namespace = schema.node(list).namespace().to_string();
                schema.set_role(target, RoleKind::Starts, starts)?;
                schema.set_role(target, RoleKind::Stops, stops)?;
                schema.set_namespace(target, namespace);
                constructed = false;
            } else if list_names(&schema, list) != list_names(&schema, target)
                || schema.node(list).namespace() != schema.node(target).namespace()
            {
                return Err(Error::shape(format!(
                    "merge: list {name:?} does not share starts and stops with the container"
                )));
            }

            schema.insert_field(record, &name, content)?;
            schema.remove_field(parent, &name)?;
            count += 1;
        }
        if count == 0 {
            return Err(Error::Cardinality("merge: no list matched".into()));
        }
        self.recast(schema)
    }
}

fn list_names(schema: &Schema, list: NodeId) -> (Option<String>, Option<String>) {
    match schema.node(list).kind() {
        Kind::List { starts, stops, .. } => (starts.clone(), stops.clone()),
        _ => (None, None),
    }
}

/// Drops fields that lead to nothing wanted. Returns whether `id` itself
/// survives.
fn prune(
    schema: &mut Schema,
    id: NodeId,
    wanted: &HashSet<NodeId>,
    on_path: &HashSet<NodeId>,
    memo: &mut HashMap<NodeId, bool>,
) -> Result<bool> {
    if wanted.contains(&id) {
        return Ok(true);
    }
    if !on_path.contains(&id) {
        return Ok(false);
    }
    if let Some(done) = memo.get(&id) {
        return Ok(*done);
    }
    memo.insert(id, true);
    let keeps = match schema.node(id).kind().clone() {
        Kind::Record { fields } => {
            for (name, child) in fields {
                if !prune(schema, child, wanted, on_path, memo)? {
                    schema.remove_field(id, &name)?;
                }
            }
            matches!(schema.node(id).kind(), Kind::Record { fields } if !fields.is_empty())
        }
        Kind::List { content, .. } => prune(schema, content, wanted, on_path, memo)?,
        // Tuple members are positional, so a tuple is kept whole.
        _ => true,
    };
    memo.insert(id, keeps);
    Ok(keeps)
}

/// Removes `nodes[0]` from its record and climbs past lists while that
/// leaves records empty. `nodes` is innermost first.
fn remove_upward(schema: &mut Schema, nodes: &[NodeId]) -> Result<()> {
    let mut child = 0;
    loop {
        let mut parent = child + 1;
        while parent < nodes.len() && schema.node(nodes[parent]).is_list() {
            parent += 1;
        }
        let Some(&record) = nodes.get(parent) else {
            return Err(Error::Cardinality("drop: nothing left".into()));
        };
        let holder = nodes[parent - 1];
        match schema.node(record).kind() {
            Kind::Record { .. } => {}
            other => return Err(Error::shape(format!("drop: cannot remove a member of a {}", other.name()))),
        }
        // Already removed through another matching path.
        let Some(name) = schema.field_name_of(record, holder) else { return Ok(()) };
        schema.remove_field(record, &name)?;
        if !matches!(schema.node(record).kind(), Kind::Record { fields } if fields.is_empty()) {
            return Ok(());
        }
        child = parent;
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::tests::{all_pt, events};

    fn field_names(schema: &Schema, at: &str) -> Vec<String> {
        let mut nodes = chain(schema, at).unwrap();
        descend(schema, &mut nodes).unwrap();
        match schema.node(nodes[0]).kind() {
            Kind::Record { fields } => fields.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    #[test]
    fn renames_fields_and_records() {
        let data = events().fieldname("muons/pt", "pt2").unwrap();
        assert_eq!(field_names(data.schema(), "muons"), ["pt2", "q"]);
        let pts = data
            .read(|root| root.as_list()?.get(2)?.field("muons")?.as_list()?.get(1)?.field("pt2")?.as_f64())
            .unwrap();
        assert_eq!(pts, 50.0);

        let data = data.recordname("muons", "Muon").unwrap();
        let name = data.read(|root| Ok(root.as_list()?.get(0)?.field("muons")?.as_list()?.get(0)?.as_record()?.name().map(str::to_string))).unwrap();
        assert_eq!(name.as_deref(), Some("Muon"));
        assert!(matches!(events().fieldname("", "x"), Err(Error::Shape(_))));
    }

    #[test]
    fn project_keeps_lists_on_the_way() {
        let data = events().project("muons/pt").unwrap();
        let values = data
            .read(|root| {
                root.as_list()?
                    .iter()
                    .map(|inner| inner?.as_list()?.iter().map(|x| x?.as_f64()).collect::<Result<Vec<_>>>())
                    .collect::<Result<Vec<_>>>()
            })
            .unwrap();
        assert_eq!(values, vec![vec![10.0, 20.0, 30.0], vec![], vec![40.0, 50.0]]);
    }

    #[test]
    fn keep_is_idempotent() {
        let once = events().keep(&["muons/p*"]).unwrap();
        assert_eq!(field_names(once.schema(), ""), ["muons"]);
        assert_eq!(field_names(once.schema(), "muons"), ["pt"]);
        let twice = once.keep(&["muons/p*"]).unwrap();
        assert_eq!(once.schema(), twice.schema());
        assert_eq!(all_pt(&twice), all_pt(&events()));
        assert!(matches!(events().keep(&["nothing"]), Err(Error::Cardinality(_))));
    }

    #[test]
    fn drop_cascades_through_empty_records() {
        let data = events().drop(&["muons/pt", "muons/q"]).unwrap();
        assert_eq!(field_names(data.schema(), ""), ["x"]);
        let again = data.drop(&["muons/*"]).unwrap();
        assert_eq!(again.schema(), data.schema());
        assert!(matches!(events().drop(&["*"]), Err(Error::Cardinality(_))));
    }

    #[test]
    fn split_and_merge_are_inverse() {
        let original = events();
        let split = original.split(&["muons/pt"]).unwrap();
        assert_eq!(field_names(split.schema(), ""), ["x", "muons", "pt"]);
        assert_eq!(field_names(split.schema(), "muons"), ["q"]);

        let merged = split.merge("muons", &["pt"]).unwrap();
        assert_eq!(merged.schema(), &original.named().unwrap());
        assert_eq!(all_pt(&merged), all_pt(&original));

        let whole = original.split(&["muons/*"]).unwrap();
        assert_eq!(field_names(whole.schema(), ""), ["x", "pt", "q"]);
        let rebuilt = whole.merge("tracks", &["pt", "q"]).unwrap();
        assert_eq!(field_names(rebuilt.schema(), "tracks"), ["pt", "q"]);
        assert!(matches!(original.split(&["x"]), Err(Error::Cardinality(_))));
    }

    #[test]
    fn merge_refuses_to_replace_a_field() {
        let split = events().split(&["muons/pt"]).unwrap().fieldname("muons/q", "pt").unwrap();
        assert_eq!(field_names(split.schema(), "muons"), ["pt"]);
        let err = split.merge("muons", &["pt"]).unwrap_err();
        assert!(matches!(err, Error::Shape(_)));
    }
}
