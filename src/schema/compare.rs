//! Structural equality between schemas and containment of concrete values.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::dtype::DType;
use crate::schema::{Kind, NodeId, Schema};

// -------------------------------- Equality -------------------------------- //

impl Schema {
    /// Compares node `a` of `self` with node `b` of `other`.
    ///
    /// Docs and namespaces are not compared. Record fields compare as a set
    /// of names. Once two nodes have been paired they are assumed equal, so
    /// cycles terminate.
    pub fn equals(&self, a: NodeId, other: &Schema, b: NodeId) -> bool {
        let mut memo = HashMap::new();
        self.equals_at(a, other, b, &mut memo)
    }

    fn equals_at(&self, a: NodeId, other: &Schema, b: NodeId, memo: &mut HashMap<NodeId, NodeId>) -> bool {
        if let Some(paired) = memo.get(&a) {
            return *paired == b;
        }
        memo.insert(a, b);

        let (x, y) = (self.node(a), other.node(b));
        if x.nullable != y.nullable || x.mask != y.mask || x.packing != y.packing || x.name != y.name {
            return false;
        }
        match (&x.kind, &y.kind) {
            (
                Kind::Primitive { dtype: d1, dims: s1, data: n1 },
                Kind::Primitive { dtype: d2, dims: s2, data: n2 },
            ) => d1 == d2 && s1 == s2 && n1 == n2,
            (
                Kind::List { content: c1, starts: b1, stops: e1 },
                Kind::List { content: c2, starts: b2, stops: e2 },
            ) => b1 == b2 && e1 == e2 && self.equals_at(*c1, other, *c2, memo),
            (
                Kind::Union { possibilities: p1, tags: t1, offsets: o1 },
                Kind::Union { possibilities: p2, tags: t2, offsets: o2 },
            ) => {
                t1 == t2
                    && o1 == o2
                    && p1.len() == p2.len()
                    && p1.iter().zip(p2).all(|(u, v)| self.equals_at(*u, other, *v, memo))
            }
            (Kind::Record { fields: f1 }, Kind::Record { fields: f2 }) => {
                f1.len() == f2.len()
                    && f1.iter().all(|(name, u)| match f2.get(name) {
                        Some(v) => self.equals_at(*u, other, *v, memo),
                        None => false,
                    })
            }
            (Kind::Tuple { types: t1 }, Kind::Tuple { types: t2 }) => {
                t1.len() == t2.len() && t1.iter().zip(t2).all(|(u, v)| self.equals_at(*u, other, *v, memo))
            }
            (
                Kind::Pointer { target: g1, positions: p1 },
                Kind::Pointer { target: g2, positions: p2 },
            ) => {
                p1 == p2
                    && match (g1, g2) {
                        (Some(u), Some(v)) => self.equals_at(*u, other, *v, memo),
                        (None, None) => true,
                        _ => false,
                    }
            }
            _ => false,
        }
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Schema) -> bool {
        match (self.root, other.root) {
            (Some(a), Some(b)) => self.equals(a, other, b),
            (None, None) => true,
            _ => false,
        }
    }
}

// ------------------------------- Containment ------------------------------ //

impl Schema {
    /// Does `value` conform to the schema at its root?
    pub fn contains(&self, value: &Value) -> bool {
        match self.root {
            Some(root) => self.contains_at(root, value),
            None => false,
        }
    }

    pub fn contains_at(&self, id: NodeId, value: &Value) -> bool {
        let mut memo = HashSet::new();
        self.conforms(id, value, &mut memo)
    }

    fn conforms(&self, id: NodeId, value: &Value, memo: &mut HashSet<(*const Value, NodeId)>) -> bool {
        let node = self.node(id);
        if value.is_null() {
            return match &node.kind {
                Kind::Union { possibilities, .. } => {
                    node.nullable || possibilities.iter().any(|p| self.node(*p).nullable)
                }
                _ => node.nullable,
            };
        }
        match &node.kind {
            Kind::Primitive { dtype, dims, .. } => conforms_block(*dtype, dims, value),
            Kind::List { content, .. } => match value {
                Value::Array(items) => items.iter().all(|item| {
                    let mut memo = memo.clone();
                    self.conforms(*content, item, &mut memo)
                }),
                _ => false,
            },
            Kind::Union { possibilities, .. } => possibilities.iter().any(|p| self.conforms(*p, value, memo)),
            Kind::Record { fields } => match value {
                Value::Object(map) => fields.iter().all(|(name, f)| match map.get(name) {
                    Some(v) => self.conforms(*f, v, memo),
                    None => false,
                }),
                _ => false,
            },
            Kind::Tuple { types } => match value {
                Value::Array(items) => {
                    items.len() == types.len()
                        && types.iter().zip(items).all(|(t, v)| self.conforms(*t, v, memo))
                }
                _ => false,
            },
            Kind::Pointer { target, .. } => {
                let Some(target) = target else { return false };
                // a repeat of the same (value, target) pair made no progress
                if !memo.insert((value as *const Value, *target)) {
                    return false;
                }
                self.conforms(*target, value, memo)
            }
        }
    }
}

fn conforms_block(dtype: DType, dims: &[usize], value: &Value) -> bool {
    match dims.split_first() {
        Some((n, rest)) => match value {
            Value::Array(items) => items.len() == *n && items.iter().all(|v| conforms_block(dtype, rest, v)),
            _ => false,
        },
        None => conforms_scalar(dtype, value),
    }
}

fn conforms_scalar(dtype: DType, value: &Value) -> bool {
    match (dtype, value) {
        (DType::Bool, Value::Bool(_)) => true,
        (d, Value::Number(_)) if d.is_float() => true,
        (d, Value::Number(n)) => {
            let Some((lo, hi)) = d.int_range() else { return false };
            let v = match (n.as_i64(), n.as_u64()) {
                (Some(i), _) => i as i128,
                (None, Some(u)) => u as i128,
                _ => return false,
            };
            lo <= v && v <= hi
        }
        _ => false,
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linked_list() -> Schema {
        let mut s = Schema::new();
        let label = s.primitive(DType::Int32);
        let next = s.pointer(None);
        let node = s.record([("label", label), ("next", next)]).unwrap();
        s.set_target(next, Some(node)).unwrap();
        s.set_nullable(next, true);
        s.set_root(node).unwrap();
        s
    }

    #[test]
    fn equality_terminates_on_self_reference() {
        let a = linked_list();
        let b = linked_list();
        assert!(a == a);
        assert!(a == b && b == a);

        let mut c = linked_list();
        let root = c.root().unwrap();
        let next = c.field(root, "next").unwrap();
        c.set_nullable(next, false);
        assert!(a != c);
    }

    #[test]
    fn record_field_order_is_not_significant() {
        let mut a = Schema::new();
        let (x, y) = (a.primitive(DType::Int8), a.primitive(DType::Bool));
        let r = a.record([("x", x), ("y", y)]).unwrap();
        a.set_root(r).unwrap();

        let mut b = Schema::new();
        let (y, x) = (b.primitive(DType::Bool), b.primitive(DType::Int8));
        let r = b.record([("y", y), ("x", x)]).unwrap();
        b.set_root(r).unwrap();
        assert!(a == b);

        b.set_doc(r, Some("ignored".into()));
        assert!(a == b);
        b.set_name(r, Some("Named")).unwrap();
        assert!(a != b);
    }

    #[test]
    fn containment_checks_ranges_and_nesting() {
        let s = linked_list();
        assert!(s.contains(&json!({"label": 1, "next": {"label": 2, "next": null}})));
        assert!(!s.contains(&json!({"label": 1.5, "next": null})));
        assert!(!s.contains(&json!({"label": 1})));
        assert!(!s.contains(&json!({"label": 4294967296i64, "next": null})));

        let mut m = Schema::new();
        let block = m.primitive_with_dims(DType::Float32, vec![2]);
        let root = m.list(block);
        m.set_root(root).unwrap();
        assert!(m.contains(&json!([[1, 2.5], [0, 0]])));
        assert!(!m.contains(&json!([[1, 2, 3]])));
        assert!(!m.contains(&json!(null)));
    }

    #[test]
    fn union_nulls_and_pointer_loops() {
        let mut s = Schema::new();
        let i = s.primitive(DType::UInt8);
        s.set_nullable(i, true);
        let p = s.pointer(None);
        let u = s.union(vec![p, i]);
        s.set_target(p, Some(u)).unwrap();
        s.set_root(u).unwrap();
        assert!(s.contains(&json!(null)));
        assert!(s.contains(&json!(200)));
        assert!(!s.contains(&json!(-1)));
        assert!(!s.contains(&json!("text")));
    }
}
