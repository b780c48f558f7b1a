//! JSON form of a schema.
//!
//! A node visited more than once gets a label `#N`: the first occurrence is
//! written in full (with `"label": "#N"`), later ones as the bare string.
//! Reading is two-phase: nodes are built with placeholders for labels, and
//! every placeholder is resolved once the whole tree exists.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::path_de;
use crate::schema::{Kind, Node, NodeId, Packing, Schema, is_identifier};

// ————————————————————————————————————————————————————————————————————————————
// WIRE TYPES
// ————————————————————————————————————————————————————————————————————————————

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NodeJson {
    /// A dtype name, or a `#N` back-reference.
    Name(String),
    Object(Box<NodeObject>),
}

#[derive(Debug, Deserialize)]
struct NodeObject {
    #[serde(rename = "type")]
    kind: Option<String>,
    dtype: Option<String>,
    dims: Option<Vec<usize>>,
    data: Option<String>,
    content: Option<NodeJson>,
    starts: Option<String>,
    stops: Option<String>,
    possibilities: Option<Vec<NodeJson>>,
    tags: Option<String>,
    offsets: Option<String>,
    fields: Option<FieldsJson>,
    types: Option<Vec<NodeJson>>,
    target: Option<NodeJson>,
    positions: Option<String>,
    #[serde(default)]
    nullable: Option<bool>,
    mask: Option<String>,
    packing: Option<Value>,
    name: Option<String>,
    doc: Option<String>,
    label: Option<String>,
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FieldsJson {
    Pairs(Vec<(String, NodeJson)>),
    Map(IndexMap<String, NodeJson>),
}

const LABEL_MARK: char = '#';

// ————————————————————————————————————————————————————————————————————————————
// WRITING
// ————————————————————————————————————————————————————————————————————————————

impl Schema {
    /// Nodes reachable more than once from the root, in discovery order.
    pub fn labels(&self) -> Result<Vec<NodeId>> {
        let mut seen = HashSet::new();
        let mut labels = Vec::new();
        self.collect_labels(self.root()?, &mut seen, &mut labels);
        Ok(labels)
    }

    fn collect_labels(&self, id: NodeId, seen: &mut HashSet<NodeId>, labels: &mut Vec<NodeId>) {
        if !seen.insert(id) {
            if !labels.contains(&id) {
                labels.push(id);
            }
            return;
        }
        for child in self.node(id).kind.children() {
            self.collect_labels(child, seen, labels);
        }
    }

    /// `explicit` writes every property, defaults included.
    pub fn to_json(&self, explicit: bool) -> Result<Value> {
        let labels = self.labels()?;
        let mut shown = HashSet::new();
        Ok(self.emit(self.root()?, explicit, &labels, &mut shown))
    }

    pub fn to_json_string(&self, explicit: bool) -> Result<String> {
        Ok(serde_json::to_string(&self.to_json(explicit)?)?)
    }

    fn emit(&self, id: NodeId, explicit: bool, labels: &[NodeId], shown: &mut HashSet<NodeId>) -> Value {
        let label = labels.iter().position(|l| *l == id).map(|i| format!("{LABEL_MARK}{i}"));
        if let Some(label) = &label {
            if shown.contains(&id) {
                return Value::String(label.clone());
            }
        }
        shown.insert(id);

        let node = self.node(id);
        let opt = |s: &Option<String>| s.clone().map(Value::String).unwrap_or(Value::Null);

        if let Kind::Primitive { dtype, dims, data } = &node.kind {
            let bare = dims.is_empty()
                && data.is_none()
                && label.is_none()
                && is_bare(node);
            if bare && !explicit {
                return Value::String(dtype.name().to_string());
            }
        }

        let mut out = Map::new();
        out.insert("type".into(), Value::String(node.kind.name().into()));
        match &node.kind {
            Kind::Primitive { dtype, dims, data } => {
                out.insert("dtype".into(), Value::String(dtype.name().into()));
                if explicit || !dims.is_empty() {
                    out.insert("dims".into(), json!(dims));
                }
                if explicit || data.is_some() {
                    out.insert("data".into(), opt(data));
                }
            }
            Kind::List { content, starts, stops } => {
                out.insert("content".into(), self.emit(*content, explicit, labels, shown));
                if explicit || starts.is_some() {
                    out.insert("starts".into(), opt(starts));
                }
                if explicit || stops.is_some() {
                    out.insert("stops".into(), opt(stops));
                }
            }
            Kind::Union { possibilities, tags, offsets } => {
                let ps = possibilities.iter().map(|p| self.emit(*p, explicit, labels, shown)).collect();
                out.insert("possibilities".into(), Value::Array(ps));
                if explicit || tags.is_some() {
                    out.insert("tags".into(), opt(tags));
                }
                if explicit || offsets.is_some() {
                    out.insert("offsets".into(), opt(offsets));
                }
            }
            Kind::Record { fields } => {
                let fs = fields
                    .iter()
                    .map(|(n, f)| json!([n, self.emit(*f, explicit, labels, shown)]))
                    .collect();
                out.insert("fields".into(), Value::Array(fs));
            }
            Kind::Tuple { types } => {
                let ts = types.iter().map(|t| self.emit(*t, explicit, labels, shown)).collect();
                out.insert("types".into(), Value::Array(ts));
            }
            Kind::Pointer { target, positions } => {
                let t = match target {
                    Some(t) => self.emit(*t, explicit, labels, shown),
                    None => Value::Null,
                };
                out.insert("target".into(), t);
                if explicit || positions.is_some() {
                    out.insert("positions".into(), opt(positions));
                }
            }
        }

        if explicit || node.nullable {
            out.insert("nullable".into(), Value::Bool(node.nullable));
        }
        if explicit || node.mask.is_some() {
            out.insert("mask".into(), opt(&node.mask));
        }
        if explicit || node.packing.is_some() {
            out.insert("packing".into(), node.packing.as_ref().map(|p| p.0.clone()).unwrap_or(Value::Null));
        }
        if explicit || node.name.is_some() {
            out.insert("name".into(), opt(&node.name));
        }
        if explicit || node.doc.is_some() {
            out.insert("doc".into(), opt(&node.doc));
        }
        if explicit || !node.namespace.is_empty() {
            out.insert("namespace".into(), Value::String(node.namespace.clone()));
        }
        if explicit || label.is_some() {
            out.insert("label".into(), opt(&label));
        }
        Value::Object(out)
    }
}

fn is_bare(node: &Node) -> bool {
    !node.nullable
        && node.mask.is_none()
        && node.packing.is_none()
        && node.name.is_none()
        && node.doc.is_none()
        && node.namespace.is_empty()
}

// ————————————————————————————————————————————————————————————————————————————
// READING
// ————————————————————————————————————————————————————————————————————————————

impl Schema {
    pub fn from_json(value: &Value) -> Result<Schema> {
        let json: NodeJson = path_de::from_value_with_path(value)?;
        Builder::default().finish(&json)
    }

    pub fn from_json_str(src: &str) -> Result<Schema> {
        let json: NodeJson = path_de::from_str_with_path(src)?;
        Builder::default().finish(&json)
    }
}

const PLACEHOLDER: NodeId = NodeId(usize::MAX);

enum Slot {
    Content,
    Possibility(usize),
    Field(String),
    Type(usize),
    Target,
}

struct Fixup {
    node: NodeId,
    slot: Slot,
    label: String,
    path: String,
}

#[derive(Default)]
struct Builder {
    schema: Schema,
    labels: HashMap<String, NodeId>,
    fixups: Vec<Fixup>,
}

/// Children waiting for their parent to exist before they can be fixed up.
type Waiting = Vec<(Slot, String, String)>;

impl Builder {
    fn finish(mut self, json: &NodeJson) -> Result<Schema> {
        let root = match json {
            NodeJson::Name(s) if s.starts_with(LABEL_MARK) => {
                return Err(Error::malformed(format!("unresolved label: {s:?}")));
            }
            _ => self.build(json, "$")?,
        };
        for fixup in std::mem::take(&mut self.fixups) {
            let Some(&target) = self.labels.get(&fixup.label) else {
                return Err(Error::malformed(format!(
                    "unresolved label {:?} at {}",
                    fixup.label, fixup.path
                )));
            };
            let node = self.schema.node_mut(fixup.node);
            match (&mut node.kind, fixup.slot) {
                (Kind::List { content, .. }, Slot::Content) => *content = target,
                (Kind::Union { possibilities, .. }, Slot::Possibility(i)) => possibilities[i] = target,
                (Kind::Record { fields }, Slot::Field(name)) => {
                    fields.insert(name, target);
                }
                (Kind::Tuple { types }, Slot::Type(i)) => types[i] = target,
                (Kind::Pointer { target: t, .. }, Slot::Target) => {
                    if target == fixup.node {
                        return Err(Error::invalid("pointer may not point directly at itself"));
                    }
                    *t = Some(target);
                }
                _ => return Err(Error::malformed(format!("label slot mismatch at {}", fixup.path))),
            }
        }
        for id in self.schema.ids() {
            if let Kind::List { content, .. } = self.schema.node(id).kind() {
                if self.schema.lists_reach(*content, id) {
                    return Err(Error::malformed("a list contains itself"));
                }
            }
        }
        self.schema.set_root(root)?;
        Ok(self.schema)
    }

    /// Builds `json` unless it is a back-reference, which is queued instead.
    fn child(&mut self, json: &NodeJson, path: String, slot: Slot, waiting: &mut Waiting) -> Result<NodeId> {
        match json {
            NodeJson::Name(s) if s.starts_with(LABEL_MARK) => {
                waiting.push((slot, s.clone(), path));
                Ok(PLACEHOLDER)
            }
            _ => self.build(json, &path),
        }
    }

    fn build(&mut self, json: &NodeJson, path: &str) -> Result<NodeId> {
        let obj = match json {
            NodeJson::Name(dtype) => {
                let dtype: DType = dtype.parse()?;
                return Ok(self.schema.primitive(dtype));
            }
            NodeJson::Object(obj) => obj,
        };
        let missing = |kind: &str, key: &str| Error::malformed(format!("{kind} at {path} is missing '{key}'"));
        let mut waiting = Waiting::new();

        let kind = match obj.kind.as_deref().unwrap_or("primitive") {
            "primitive" => {
                let dtype = obj.dtype.as_deref().ok_or_else(|| missing("primitive", "dtype"))?;
                Kind::Primitive {
                    dtype: dtype.parse()?,
                    dims: obj.dims.clone().unwrap_or_default(),
                    data: obj.data.clone(),
                }
            }
            "list" => {
                let content = obj.content.as_ref().ok_or_else(|| missing("list", "content"))?;
                Kind::List {
                    content: self.child(content, format!("{path}.content"), Slot::Content, &mut waiting)?,
                    starts: obj.starts.clone(),
                    stops: obj.stops.clone(),
                }
            }
            "union" => {
                let ps = obj.possibilities.as_ref().ok_or_else(|| missing("union", "possibilities"))?;
                let mut possibilities = Vec::with_capacity(ps.len());
                for (i, p) in ps.iter().enumerate() {
                    let path = format!("{path}.possibilities[{i}]");
                    possibilities.push(self.child(p, path, Slot::Possibility(i), &mut waiting)?);
                }
                Kind::Union { possibilities, tags: obj.tags.clone(), offsets: obj.offsets.clone() }
            }
            "record" => {
                let fs = obj.fields.as_ref().ok_or_else(|| missing("record", "fields"))?;
                let pairs: Vec<(&String, &NodeJson)> = match fs {
                    FieldsJson::Pairs(pairs) => pairs.iter().map(|(n, x)| (n, x)).collect(),
                    FieldsJson::Map(map) => {
                        let mut sorted: Vec<_> = map.iter().collect();
                        sorted.sort_by(|a, b| a.0.cmp(b.0));
                        sorted
                    }
                };
                let mut fields = IndexMap::new();
                for (name, f) in pairs {
                    if !is_identifier(name) {
                        return Err(Error::invalid(format!("field name {name:?} at {path} is not an identifier")));
                    }
                    let child = self.child(f, format!("{path}.fields.{name}"), Slot::Field(name.clone()), &mut waiting)?;
                    fields.insert(name.clone(), child);
                }
                Kind::Record { fields }
            }
            "tuple" => {
                let ts = obj.types.as_ref().ok_or_else(|| missing("tuple", "types"))?;
                let mut types = Vec::with_capacity(ts.len());
                for (i, t) in ts.iter().enumerate() {
                    types.push(self.child(t, format!("{path}.types[{i}]"), Slot::Type(i), &mut waiting)?);
                }
                Kind::Tuple { types }
            }
            "pointer" => {
                let target = match &obj.target {
                    Some(t) => Some(self.child(t, format!("{path}.target"), Slot::Target, &mut waiting)?),
                    None => None,
                };
                Kind::Pointer { target, positions: obj.positions.clone() }
            }
            other => {
                return Err(Error::malformed(format!("unrecognized type {other:?} at {path}")));
            }
        };

        if let Some(name) = &obj.name {
            if !is_identifier(name) {
                return Err(Error::invalid(format!("name {name:?} at {path} is not an identifier")));
            }
        }
        let id = self.schema.push_node(Node {
            kind,
            nullable: obj.nullable.unwrap_or(false),
            mask: obj.mask.clone(),
            packing: obj.packing.clone().filter(|p| !p.is_null()).map(Packing),
            name: obj.name.clone(),
            doc: obj.doc.clone(),
            namespace: obj.namespace.clone().unwrap_or_default(),
        });
        for (slot, label, path) in waiting {
            self.fixups.push(Fixup { node: id, slot, label, path });
        }
        if let Some(label) = &obj.label {
            if self.labels.insert(label.clone(), id).is_some() {
                return Err(Error::malformed(format!("label {label:?} at {path} is defined twice")));
            }
        }
        Ok(id)
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;

    fn cyclic() -> Schema {
        let mut s = Schema::new();
        let x = s.primitive(DType::Float64);
        let next = s.pointer(None);
        let node = s.record([("x", x), ("y", x), ("next", next)]).unwrap();
        s.set_target(next, Some(node)).unwrap();
        s.set_nullable(next, true);
        let root = s.list(node);
        s.set_root(root).unwrap();
        s
    }

    #[test]
    fn bare_primitives_collapse_to_dtype_names() {
        let mut s = Schema::new();
        let x = s.primitive(DType::Int32);
        let root = s.list(x);
        s.set_root(root).unwrap();
        assert_eq!(s.to_json(false).unwrap(), json!({"type": "list", "content": "int32"}));
    }

    #[test]
    fn shared_and_cyclic_nodes_get_labels() {
        let s = cyclic();
        let out = s.to_json(false).unwrap();
        assert_eq!(out, json!({
            "type": "list",
            "content": {
                "type": "record",
                "fields": [
                    ["x", {"type": "primitive", "dtype": "float64", "label": "#0"}],
                    ["y", "#0"],
                    ["next", {"type": "pointer", "target": "#1", "nullable": true}],
                ],
                "label": "#1",
            },
        }));
        assert!(Schema::from_json(&out).unwrap() == s);
    }

    #[test]
    fn explicit_mode_round_trips() {
        let s = cyclic();
        let out = s.to_json(true).unwrap();
        assert_eq!(out["content"]["fields"][2][1]["positions"], Value::Null);
        assert!(Schema::from_json(&out).unwrap() == s);
    }

    #[test]
    fn record_fields_accept_objects_in_sorted_order() {
        let s = Schema::from_json(&json!({
            "type": "record",
            "fields": {"b": "bool", "a": {"dtype": "f8", "nullable": true}},
            "name": "Point",
        }))
        .unwrap();
        let root = s.root().unwrap();
        let Kind::Record { fields } = s.node(root).kind() else { panic!() };
        assert_eq!(fields.keys().collect::<Vec<_>>(), ["a", "b"]);
        assert!(s.node(fields["a"]).nullable());
        assert_eq!(s.node(root).name(), Some("Point"));
    }

    #[test]
    fn unresolved_labels_are_malformed() {
        let err = Schema::from_json(&json!({"type": "list", "content": "#3"})).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)), "{err}");
        assert!(Schema::from_json(&json!("#0")).is_err());
    }

    #[test]
    fn errors_carry_the_node_path() {
        let err = Schema::from_json_str(r#"{"type": "list", "content": {"type": "primitive"}}"#).unwrap_err();
        assert!(err.to_string().contains("$.content"), "{err}");
        let err = Schema::from_json(&json!({"type": "set", "content": "int8"})).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn labels_are_defined_once() {
        let err = Schema::from_json(&json!({
            "type": "tuple",
            "types": [{"dtype": "int8", "label": "#0"}, {"dtype": "int16", "label": "#0"}],
        }))
        .unwrap_err();
        assert!(matches!(err, Error::Malformed(_)), "{err}");
    }

    #[test]
    fn self_nested_lists_are_malformed() {
        let err = Schema::from_json(&json!({"type": "list", "content": "#0", "label": "#0"})).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)), "{err}");
        let err = Schema::from_json(&json!({
            "type": "list",
            "content": {"type": "list", "content": "#0"},
            "label": "#0",
        }))
        .unwrap_err();
        assert!(matches!(err, Error::Malformed(_)), "{err}");
    }

    #[test]
    fn pointers_may_not_target_themselves() {
        let err = Schema::from_json(&json!({"type": "pointer", "target": "#0", "label": "#0"})).unwrap_err();
        assert!(matches!(err, Error::InvalidProperty(_)));
    }
}
