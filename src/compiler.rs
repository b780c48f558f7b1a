//! Schema → generator compilation.
//!
//! One pass walks the schema from the root, resolving buffer names and
//! handing out reader cache slots. A node reached along two paths is
//! compiled twice, once per prefix. Pointers only record their target
//! during that pass; `finalize` links each of them afterwards, either back
//! into the tree (internal) or to a freshly compiled subtree rooted at the
//! pointer's external prefix.
pub mod extension;
pub mod generator;

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::schema::naming::Scope;
use crate::schema::{Kind, NodeId, Schema, check_delimiter};

pub use extension::{ByteString, Extension, ExtensionSet, Utf8String};
pub use generator::{GenId, GenKind, GenNode, Generator, PointerTarget, Slot};

pub const DEFAULT_PREFIX: &str = "object";
pub const DEFAULT_DELIMITER: &str = "-";

pub fn compile(schema: &Schema, prefix: &str, delimiter: &str, extensions: &ExtensionSet) -> Result<Generator> {
    check_delimiter(delimiter)?;
    let root = schema.root()?;
    let mut compiler = Compiler { schema, delimiter, extensions, nodes: Vec::new(), cache_len: 0 };
    let mut memos = Vec::new();
    let root = compiler.compile_rooted(root, prefix.to_string(), &mut memos)?;
    debug!(
        "compiled schema at prefix {:?}: {} generator nodes, {} cache slots",
        prefix,
        compiler.nodes.len(),
        compiler.cache_len
    );
    Ok(Generator {
        nodes: compiler.nodes,
        root,
        cache_len: compiler.cache_len,
        prefix: prefix.to_string(),
        delimiter: delimiter.to_string(),
        extensions: extensions.clone(),
        schema: schema.clone(),
    })
}

type Memo = HashMap<NodeId, GenId>;

struct Compiler<'s> {
    schema: &'s Schema,
    delimiter: &'s str,
    extensions: &'s ExtensionSet,
    nodes: Vec<GenNode>,
    cache_len: usize,
}

impl Compiler<'_> {
    fn slot(&mut self, name: String) -> Slot {
        let cache = self.cache_len;
        self.cache_len += 1;
        Slot { name, cache }
    }

    /// Compiles the tree under `root` with a memo of its own, then links its
    /// pointers. `memos` holds the memos of the enclosing trees.
    fn compile_rooted(&mut self, root: NodeId, prefix: String, memos: &mut Vec<Memo>) -> Result<GenId> {
        let mut memo = Memo::new();
        let mut nesting = HashSet::new();
        let mut pointers = Vec::new();
        let out = self.compile_node(root, prefix, &mut memo, &mut nesting, &mut pointers)?;
        memos.push(memo);
        for pointer in pointers {
            self.finalize(pointer, memos)?;
        }
        memos.pop();
        Ok(out)
    }

    fn compile_node(
        &mut self,
        id: NodeId,
        prefix: String,
        memo: &mut Memo,
        nesting: &mut HashSet<NodeId>,
        pointers: &mut Vec<GenId>,
    ) -> Result<GenId> {
        if nesting.contains(&id) {
            return Err(Error::malformed("a type may not be defined in terms of itself"));
        }
        let schema = self.schema;
        let node = schema.node(id);
        let scope = Scope { node, prefix: &prefix, delimiter: self.delimiter };
        let mask = node.nullable().then(|| scope.mask());
        let mask = mask.map(|m| self.slot(m));

        nesting.insert(id);
        let kind = match node.kind() {
            Kind::Primitive { dtype, dims, .. } => {
                let data = self.slot(scope.data());
                GenKind::Primitive { dtype: *dtype, dims: dims.clone(), data }
            }
            Kind::List { content, .. } => {
                let starts = self.slot(scope.starts());
                let stops = self.slot(scope.stops());
                let content = self.compile_node(*content, scope.content(), memo, nesting, pointers)?;
                GenKind::List { starts, stops, content }
            }
            Kind::Union { possibilities, .. } => {
                let tags = self.slot(scope.tags());
                let offsets = self.slot(scope.offsets());
                let mut compiled = Vec::with_capacity(possibilities.len());
                for (i, p) in possibilities.iter().enumerate() {
                    compiled.push(self.compile_node(*p, scope.possibility(i), memo, nesting, pointers)?);
                }
                GenKind::Union { tags, offsets, possibilities: compiled }
            }
            Kind::Record { fields } => {
                if fields.is_empty() {
                    return Err(Error::malformed("record has no fields"));
                }
                let mut names: Vec<&String> = fields.keys().collect();
                names.sort();
                let mut compiled = HashMap::with_capacity(names.len());
                for name in names {
                    let child = self.compile_node(fields[name], scope.field(name), memo, nesting, pointers)?;
                    compiled.insert(name.as_str(), child);
                }
                // Slots follow sorted names; the record keeps its declared order.
                let fields: IndexMap<String, GenId> =
                    fields.keys().filter_map(|k| compiled.get(k.as_str()).map(|c| (k.clone(), *c))).collect();
                GenKind::Record { fields }
            }
            Kind::Tuple { types } => {
                if types.is_empty() {
                    return Err(Error::malformed("tuple has no types"));
                }
                let mut compiled = Vec::with_capacity(types.len());
                for (i, t) in types.iter().enumerate() {
                    compiled.push(self.compile_node(*t, scope.field(&i.to_string()), memo, nesting, pointers)?);
                }
                GenKind::Tuple { types: compiled }
            }
            Kind::Pointer { target, .. } => {
                let Some(target) = target else {
                    return Err(Error::malformed("pointer target must be set before compiling"));
                };
                let positions = self.slot(scope.positions());
                GenKind::Pointer { positions, target: PointerTarget::Pending(*target) }
            }
        };
        nesting.remove(&id);

        let gid = GenId(self.nodes.len());
        self.nodes.push(GenNode {
            kind,
            mask,
            prefix,
            namespace: node.namespace().to_string(),
            name: node.name().map(str::to_string),
            doc: node.doc().map(str::to_string),
            packing: node.packing().cloned(),
            extension: self.extensions.find(self.schema, id),
            origin: id,
        });
        if node.is_pointer() {
            pointers.push(gid);
        }
        memo.insert(id, gid);
        Ok(gid)
    }

    fn finalize(&mut self, pointer: GenId, memos: &mut Vec<Memo>) -> Result<()> {
        let GenKind::Pointer { target: PointerTarget::Pending(target), .. } = self.nodes[pointer.0].kind else {
            return Ok(());
        };
        let current = memos.last().and_then(|m| m.get(&target)).copied();
        let resolved = if let Some(linked) = current {
            let explicit = matches!(
                self.schema.node(self.nodes[pointer.0].origin).kind(),
                Kind::Pointer { positions: Some(_), .. }
            );
            let suffix = format!("{}{}", self.delimiter, self.nodes[linked.0].prefix);
            if let GenKind::Pointer { positions, .. } = &mut self.nodes[pointer.0].kind {
                if !explicit {
                    positions.name.push_str(&suffix);
                }
            }
            PointerTarget::Internal(linked)
        } else if let Some(enclosing) = memos.iter().rev().skip(1).find_map(|m| m.get(&target)).copied() {
            PointerTarget::External(enclosing)
        } else {
            let schema = self.schema;
            let node = schema.node(self.nodes[pointer.0].origin);
            let external = Scope { node, prefix: &self.nodes[pointer.0].prefix, delimiter: self.delimiter }.external();
            PointerTarget::External(self.compile_rooted(target, external, memos)?)
        };
        if let GenKind::Pointer { target, .. } = &mut self.nodes[pointer.0].kind {
            *target = resolved;
        }
        Ok(())
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    fn compile_default(s: &Schema) -> Result<Generator> {
        compile(s, DEFAULT_PREFIX, DEFAULT_DELIMITER, &ExtensionSet::common())
    }

    fn slot_names(g: &Generator, id: GenId) -> Vec<String> {
        g.node(id).slots().into_iter().map(|(_, s)| s.name.clone()).collect()
    }

    #[test]
    fn derives_names_and_allocates_mask_first() {
        let mut s = Schema::new();
        let x = s.primitive(DType::Float64);
        s.set_nullable(x, true);
        let rec = s.record([("x", x)]).unwrap();
        let root = s.list(rec);
        s.set_root(root).unwrap();

        let g = compile_default(&s).unwrap();
        let root = g.root();
        assert_eq!(slot_names(&g, root), ["object-B", "object-E"]);
        let GenKind::List { content, .. } = &g.node(root).kind else { panic!() };
        let GenKind::Record { fields } = &g.node(*content).kind else { panic!() };
        let x = g.node(fields["x"]);
        assert_eq!(x.mask.as_ref().map(|m| m.cache), Some(2));
        assert_eq!(slot_names(&g, fields["x"]), ["object-L-Fx-M", "object-L-Fx-Df8"]);
        assert_eq!(g.cache_len(), 4);
    }

    #[test]
    fn shared_nodes_compile_once_per_path() {
        let mut s = Schema::new();
        let x = s.primitive(DType::Int32);
        let rec = s.record([("b", x), ("a", x)]).unwrap();
        s.set_root(rec).unwrap();
        let g = compile_default(&s).unwrap();
        let GenKind::Record { fields } = &g.node(g.root()).kind else { panic!() };
        assert_eq!(fields.keys().collect::<Vec<_>>(), ["b", "a"]);
        let GenKind::Primitive { data, .. } = &g.node(fields["a"]).kind else { panic!() };
        assert_eq!(data.cache, 0);
        assert_ne!(fields["a"], fields["b"]);
        assert_eq!(slot_names(&g, fields["b"]), ["object-Fb-Di4"]);
    }

    #[test]
    fn pointers_link_internally_or_compile_externally() {
        let mut s = Schema::new();
        let x = s.primitive(DType::Float32);
        let next = s.pointer(None);
        let node = s.record([("x", x), ("next", next)]).unwrap();
        s.set_target(next, Some(node)).unwrap();
        let outside = s.primitive(DType::Int64);
        let away = s.pointer(Some(outside));
        let top = s.record([("head", node), ("away", away)]).unwrap();
        s.set_root(top).unwrap();

        let g = compile_default(&s).unwrap();
        let GenKind::Record { fields } = &g.node(g.root()).kind else { panic!() };
        let GenKind::Record { fields: head } = &g.node(fields["head"]).kind else { panic!() };
        let GenKind::Pointer { positions, target } = &g.node(head["next"]).kind else { panic!() };
        assert_eq!(*target, PointerTarget::Internal(fields["head"]));
        assert_eq!(positions.name, "object-Fhead-Fnext-P-object-Fhead");

        let GenKind::Pointer { positions, target } = &g.node(fields["away"]).kind else { panic!() };
        assert_eq!(positions.name, "object-Faway-P");
        let PointerTarget::External(ext) = target else { panic!() };
        assert_eq!(slot_names(&g, *ext), ["object-Faway-X-Di8"]);
        assert_eq!(g.cache_len(), 4);
    }

    #[test]
    fn external_cycles_terminate() {
        let mut s = Schema::new();
        let a_back = s.pointer(None);
        let x = s.primitive(DType::Bool);
        let b = s.record([("x", x), ("back", a_back)]).unwrap();
        let to_b = s.pointer(Some(b));
        let a = s.record([("to_b", to_b)]).unwrap();
        s.set_target(a_back, Some(a)).unwrap();
        s.set_root(a).unwrap();

        let g = compile_default(&s).unwrap();
        let GenKind::Record { fields } = &g.node(g.root()).kind else { panic!() };
        let Some(PointerTarget::External(b)) = g.pointer_target(fields["to_b"]) else { panic!() };
        assert_eq!(g.node(b).prefix, "object-Fto_b-X");
        let GenKind::Record { fields: inner } = &g.node(b).kind else { panic!() };
        assert_eq!(g.pointer_target(inner["back"]), Some(PointerTarget::External(g.root())));

        let mut expected = s.clone();
        expected.defaultnames(DEFAULT_PREFIX, DEFAULT_DELIMITER).unwrap();
        assert!(g.named_schema().unwrap() == expected);
    }

    #[test]
    fn rejects_self_nesting_and_empty_records() {
        let mut s = Schema::new();
        let x = s.primitive(DType::Int8);
        let list = s.list(x);
        s.set_content(list, list).unwrap();
        s.set_root(list).unwrap();
        assert!(matches!(compile_default(&s), Err(Error::Malformed(_))));

        let mut s = Schema::new();
        let empty = s.record(Vec::<(String, NodeId)>::new()).unwrap();
        s.set_root(empty).unwrap();
        assert!(compile_default(&s).is_err());
        assert!(compile(&s, "object", "x", &ExtensionSet::none()).is_err());
    }
}
