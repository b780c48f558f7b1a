use std::collections::HashSet;
use std::fmt::{self, Write};

use crate::schema::{Kind, Node, NodeId, Schema};

const INDENT: &str = "  ";

impl Schema {
    /// Indented outline of the schema. Labeled nodes print as `#N` after
    /// their first appearance.
    pub fn show(&self) -> String {
        let mut out = String::new();
        let Ok(root) = self.root() else {
            return "<empty schema>".to_string();
        };
        let labels = self.labels().unwrap_or_default();
        let mut shown = HashSet::new();
        self.show_node(root, 0, &labels, &mut shown, &mut out);
        out
    }

    fn show_node(&self, id: NodeId, depth: usize, labels: &[NodeId], shown: &mut HashSet<NodeId>, out: &mut String) {
        let label = labels.iter().position(|l| *l == id);
        if let Some(i) = label {
            if !shown.insert(id) {
                let _ = writeln!(out, "#{i}");
                return;
            }
        }
        let node = self.node(id);
        let _ = write!(out, "{}", header(node));
        if let Some(i) = label {
            let _ = write!(out, " #{i}");
        }
        out.push('\n');

        let pad = INDENT.repeat(depth + 1);
        let mut child = |name: String, c: NodeId, out: &mut String| {
            let _ = write!(out, "{pad}{name}: ");
            self.show_node(c, depth + 1, labels, shown, out);
        };
        match &node.kind {
            Kind::Primitive { .. } => {}
            Kind::List { content, .. } => child("content".into(), *content, out),
            Kind::Union { possibilities, .. } => {
                for (i, p) in possibilities.iter().enumerate() {
                    child(format!("[{i}]"), *p, out);
                }
            }
            Kind::Record { fields } => {
                for (name, f) in fields {
                    child(name.clone(), *f, out);
                }
            }
            Kind::Tuple { types } => {
                for (i, t) in types.iter().enumerate() {
                    child(i.to_string(), *t, out);
                }
            }
            Kind::Pointer { target: Some(t), .. } => child("target".into(), *t, out),
            Kind::Pointer { target: None, .. } => {
                let _ = writeln!(out, "{pad}target: <unset>");
            }
        }
    }
}

fn header(node: &Node) -> String {
    let mut h = match &node.kind {
        Kind::Primitive { dtype, dims, .. } if dims.is_empty() => dtype.to_string(),
        Kind::Primitive { dtype, dims, .. } => format!("{dtype}{dims:?}"),
        other => other.name().to_string(),
    };
    if node.nullable {
        h.push('?');
    }
    if let Some(name) = &node.name {
        let _ = write!(h, " ({name})");
    }
    if !node.namespace.is_empty() {
        let _ = write!(h, " in {:?}", node.namespace);
    }
    h
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.show().trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    #[test]
    fn prints_cycles_once() {
        let mut s = Schema::new();
        let x = s.primitive(DType::Int64);
        let next = s.pointer(None);
        let node = s.record([("x", x), ("next", next)]).unwrap();
        s.set_name(node, Some("Node")).unwrap();
        s.set_target(next, Some(node)).unwrap();
        s.set_nullable(next, true);
        let root = s.list(node);
        s.set_root(root).unwrap();

        assert_eq!(
            s.to_string(),
            "list\n  content: record (Node) #0\n    x: int64\n    next: pointer?\n      target: #0"
        );
    }
}
