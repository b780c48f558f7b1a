//! Default buffer names derived from a `(prefix, delimiter)` pair.
//!
//! Every role appends a one-letter code to the node's scope, so a delimiter
//! that cannot appear in identifiers or integers keeps derived names
//! unambiguous:
//!
//! | code | meaning |
//! |---|---|
//! | `N<name>` | named node scope |
//! | `M` | mask |
//! | `D<dtype><delim dim>*` | primitive data |
//! | `B` / `E` / `L` | list starts / stops / content scope |
//! | `T` / `O` / `U<i>` | union tags / offsets / possibility scope |
//! | `F<name>` / `F<i>` | record / tuple field scope |
//! | `P` / `X` | pointer positions / external target scope |

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};
use crate::schema::{Kind, Node, NodeId, Schema};

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("identifier pattern"));

static BAD_DELIMITER: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9_]").expect("delimiter pattern"));

pub fn is_identifier(s: &str) -> bool {
    IDENTIFIER.is_match(s)
}

pub fn check_delimiter(delimiter: &str) -> Result<()> {
    if delimiter.is_empty() || BAD_DELIMITER.is_match(delimiter) {
        return Err(Error::invalid(format!(
            "delimiter {delimiter:?} must be non-empty and must not contain /{}/",
            BAD_DELIMITER.as_str()
        )));
    }
    Ok(())
}

// ------------------------------- Derivation ------------------------------- //

/// Name derivation for one node at one prefix.
pub(crate) struct Scope<'a> {
    pub node: &'a Node,
    pub prefix: &'a str,
    pub delimiter: &'a str,
}

impl Scope<'_> {
    fn base(&self) -> String {
        match &self.node.name {
            Some(name) => format!("{}{}N{}", self.prefix, self.delimiter, name),
            None => self.prefix.to_string(),
        }
    }

    fn code(&self, code: &str) -> String {
        format!("{}{}{}", self.base(), self.delimiter, code)
    }

    fn explicit_or(&self, name: &Option<String>, code: &str) -> String {
        name.clone().unwrap_or_else(|| self.code(code))
    }

    pub fn mask(&self) -> String {
        self.explicit_or(&self.node.mask, "M")
    }

    pub fn data(&self) -> String {
        match &self.node.kind {
            Kind::Primitive { data: Some(d), .. } => d.clone(),
            Kind::Primitive { dtype, dims, .. } => {
                let mut out = self.code(&format!("D{}", dtype.code()));
                for d in dims {
                    out.push_str(self.delimiter);
                    out.push_str(&d.to_string());
                }
                out
            }
            _ => self.code("D"),
        }
    }

    pub fn starts(&self) -> String {
        match &self.node.kind {
            Kind::List { starts, .. } => self.explicit_or(starts, "B"),
            _ => self.code("B"),
        }
    }

    pub fn stops(&self) -> String {
        match &self.node.kind {
            Kind::List { stops, .. } => self.explicit_or(stops, "E"),
            _ => self.code("E"),
        }
    }

    pub fn content(&self) -> String {
        self.code("L")
    }

    pub fn tags(&self) -> String {
        match &self.node.kind {
            Kind::Union { tags, .. } => self.explicit_or(tags, "T"),
            _ => self.code("T"),
        }
    }

    pub fn offsets(&self) -> String {
        match &self.node.kind {
            Kind::Union { offsets, .. } => self.explicit_or(offsets, "O"),
            _ => self.code("O"),
        }
    }

    pub fn possibility(&self, i: usize) -> String {
        self.code(&format!("U{i}"))
    }

    pub fn field(&self, name: &str) -> String {
        self.code(&format!("F{name}"))
    }

    pub fn positions(&self) -> String {
        match &self.node.kind {
            Kind::Pointer { positions, .. } => self.explicit_or(positions, "P"),
            _ => self.code("P"),
        }
    }

    pub fn external(&self) -> String {
        self.code("X")
    }
}

// ------------------------------ Write-back -------------------------------- //

impl Schema {
    /// Writes every derived buffer name into the schema itself, so that it
    /// no longer depends on the prefix and delimiter it is compiled with.
    pub fn defaultnames(&mut self, prefix: &str, delimiter: &str) -> Result<()> {
        check_delimiter(delimiter)?;
        let root = self.root()?;
        let mut in_progress = HashSet::new();
        self.defaultnames_at(root, prefix, delimiter, &mut in_progress)
    }

    fn defaultnames_at(
        &mut self,
        root: NodeId,
        prefix: &str,
        delimiter: &str,
        in_progress: &mut HashSet<NodeId>,
    ) -> Result<()> {
        in_progress.insert(root);
        let mut memo = HashMap::new();
        let mut pointers = Vec::new();
        let mut nesting = HashSet::new();
        self.name_node(root, prefix.to_string(), delimiter, &mut memo, &mut pointers, &mut nesting)?;

        for pointer in pointers {
            let own = memo[&pointer].clone();
            let (target, positions) = match &self.node(pointer).kind {
                Kind::Pointer { target: Some(t), positions } => (*t, positions.clone()),
                _ => return Err(Error::malformed("pointer target must be set before naming")),
            };
            let scope = Scope { node: self.node(pointer), prefix: &own, delimiter };
            let base = scope.positions();
            let external = scope.external();
            if let Some(target_prefix) = memo.get(&target) {
                let name = match positions {
                    Some(explicit) => explicit,
                    None => format!("{base}{delimiter}{target_prefix}"),
                };
                self.set_positions(pointer, name);
            } else {
                self.set_positions(pointer, base);
                if !in_progress.contains(&target) {
                    self.defaultnames_at(target, &external, delimiter, in_progress)?;
                }
            }
        }
        Ok(())
    }

    fn set_positions(&mut self, id: NodeId, name: String) {
        if let Kind::Pointer { positions, .. } = &mut self.node_mut(id).kind {
            *positions = Some(name);
        }
    }

    fn name_node(
        &mut self,
        id: NodeId,
        prefix: String,
        delimiter: &str,
        memo: &mut HashMap<NodeId, String>,
        pointers: &mut Vec<NodeId>,
        nesting: &mut HashSet<NodeId>,
    ) -> Result<()> {
        if nesting.contains(&id) {
            return Err(Error::malformed("a type may not be defined in terms of itself"));
        }
        let scope = Scope { node: self.node(id), prefix: &prefix, delimiter };
        let mask = self.node(id).nullable.then(|| scope.mask());
        let mut children: Vec<(NodeId, String)> = Vec::new();
        let mut kind = self.node(id).kind.clone();
        match &mut kind {
            Kind::Primitive { data, .. } => *data = Some(scope.data()),
            Kind::List { content, starts, stops } => {
                *starts = Some(scope.starts());
                *stops = Some(scope.stops());
                children.push((*content, scope.content()));
            }
            Kind::Union { possibilities, tags, offsets } => {
                *tags = Some(scope.tags());
                *offsets = Some(scope.offsets());
                for (i, p) in possibilities.iter().enumerate() {
                    children.push((*p, scope.possibility(i)));
                }
            }
            Kind::Record { fields } => {
                for (name, f) in fields.iter() {
                    children.push((*f, scope.field(name)));
                }
            }
            Kind::Tuple { types } => {
                for (i, t) in types.iter().enumerate() {
                    children.push((*t, scope.field(&i.to_string())));
                }
            }
            Kind::Pointer { .. } => pointers.push(id),
        }
        let node = self.node_mut(id);
        node.kind = kind;
        if mask.is_some() {
            node.mask = mask;
        }

        if !self.node(id).is_pointer() {
            nesting.insert(id);
            for (child, child_prefix) in children {
                self.name_node(child, child_prefix, delimiter, memo, pointers, nesting)?;
            }
            nesting.remove(&id);
        }
        memo.insert(id, prefix);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    #[test]
    fn delimiters_may_not_look_like_names() {
        assert!(check_delimiter("-").is_ok());
        assert!(check_delimiter("::").is_ok());
        assert!(check_delimiter("").is_err());
        assert!(check_delimiter("_").is_err());
        assert!(check_delimiter("-1").is_err());
    }

    #[test]
    fn writes_derived_names_back() {
        let mut s = Schema::new();
        let x = s.primitive(DType::Float64);
        let rec = s.record([("x", x)]).unwrap();
        s.set_nullable(rec, true);
        let ptr = s.pointer(Some(rec));
        let inner = s.list(ptr);
        let top = s.record([("items", rec), ("refs", inner)]).unwrap();
        let root = s.list(top);
        s.set_root(root).unwrap();
        s.defaultnames("object", "-").unwrap();

        assert_eq!(s.node(root).kind(), &Kind::List {
            content: top,
            starts: Some("object-B".into()),
            stops: Some("object-E".into()),
        });
        assert_eq!(s.node(rec).mask(), Some("object-L-Fitems-M"));
        let Kind::Primitive { data, .. } = s.node(x).kind() else { panic!() };
        assert_eq!(data.as_deref(), Some("object-L-Fitems-Fx-Df8"));
        let Kind::Pointer { positions, .. } = s.node(ptr).kind() else { panic!() };
        assert_eq!(positions.as_deref(), Some("object-L-Frefs-L-P-object-L-Fitems"));
    }
}
