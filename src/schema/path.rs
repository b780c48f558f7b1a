//! `/`-separated paths into a schema.
//!
//! Lists are descended transparently before a component is matched, so
//! `tracks/hits` names the `hits` field of the records inside `tracks`
//! whether `tracks` is a record or a list of records. A component names a
//! record field or a tuple index.

use glob::Pattern;

use crate::error::{Error, Result};
use crate::schema::{Kind, NodeId, Schema};

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

impl Schema {
    /// The chain of nodes from the root to the node at `path`, including
    /// every list passed through on the way.
    pub fn resolve(&self, path: &str) -> Result<Vec<NodeId>> {
        let mut chain = vec![self.root()?];
        for component in components(path) {
            self.descend_lists(&mut chain)?;
            let here = chain[chain.len() - 1];
            let next = match &self.node(here).kind {
                Kind::Record { fields } => fields.get(component).copied(),
                Kind::Tuple { types } => component.parse::<usize>().ok().and_then(|i| types.get(i).copied()),
                _ => None,
            };
            match next {
                Some(id) => chain.push(id),
                None => {
                    return Err(Error::shape(format!(
                        "path {path:?}: no field {component:?} in a {}",
                        self.node(here).kind.name()
                    )));
                }
            }
        }
        Ok(chain)
    }

    /// Every chain whose components match `pattern` component-wise as
    /// glob patterns.
    pub fn matches(&self, pattern: &str) -> Result<Vec<Vec<NodeId>>> {
        let patterns = components(pattern)
            .map(|c| Pattern::new(c).map_err(|e| Error::invalid(format!("bad path pattern {c:?}: {e}"))))
            .collect::<Result<Vec<_>>>()?;
        let mut out = Vec::new();
        self.match_from(vec![self.root()?], &patterns, &mut out)?;
        Ok(out)
    }

    fn match_from(&self, mut chain: Vec<NodeId>, patterns: &[Pattern], out: &mut Vec<Vec<NodeId>>) -> Result<()> {
        let Some((first, rest)) = patterns.split_first() else {
            out.push(chain);
            return Ok(());
        };
        self.descend_lists(&mut chain)?;
        let here = chain[chain.len() - 1];
        let candidates: Vec<(String, NodeId)> = match &self.node(here).kind {
            Kind::Record { fields } => fields.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            Kind::Tuple { types } => types.iter().enumerate().map(|(i, t)| (i.to_string(), *t)).collect(),
            _ => Vec::new(),
        };
        for (name, id) in candidates {
            if first.matches(&name) {
                let mut next = chain.clone();
                next.push(id);
                self.match_from(next, rest, out)?;
            }
        }
        Ok(())
    }

    fn descend_lists(&self, chain: &mut Vec<NodeId>) -> Result<()> {
        let first = chain.len();
        while let Kind::List { content, .. } = &self.node(chain[chain.len() - 1]).kind {
            if chain[first - 1..].contains(content) {
                return Err(Error::shape("a list contains itself"));
            }
            chain.push(*content);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    fn events() -> Schema {
        let mut s = Schema::new();
        let px = s.primitive(DType::Float32);
        let py = s.primitive(DType::Float32);
        let muon = s.record([("px", px), ("py", py)]).unwrap();
        let muons = s.list(muon);
        let met = s.primitive(DType::Float64);
        let pair = s.tuple(vec![met, met]);
        let event = s.record([("muons", muons), ("met", met), ("pair", pair)]).unwrap();
        let root = s.list(event);
        s.set_root(root).unwrap();
        s
    }

    #[test]
    fn resolve_passes_through_lists() {
        let s = events();
        let chain = s.resolve("muons/px").unwrap();
        let kinds: Vec<&str> = chain.iter().map(|id| s.node(*id).kind().name()).collect();
        assert_eq!(kinds, ["list", "record", "list", "record", "primitive"]);
        assert_eq!(s.resolve("").unwrap(), vec![s.root().unwrap()]);
        assert_eq!(s.resolve("//pair/1/").unwrap().len(), 4);
        assert!(matches!(s.resolve("muons/pz"), Err(Error::Shape(_))));
    }

    #[test]
    fn matches_globs_each_component() {
        let s = events();
        let hits = s.matches("muons/p*").unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(s.matches("m*").unwrap().len(), 2);
        assert!(s.matches("nothing").unwrap().is_empty());
        assert!(s.matches("[").is_err());
    }

    #[test]
    fn self_nested_lists_stop_the_walk() {
        let mut s = Schema::new();
        let x = s.primitive(DType::Int8);
        let l = s.list(x);
        let r = s.record([("a", l)]).unwrap();
        s.set_root(r).unwrap();
        // Built behind the setters' back, as a foreign arena could be.
        s.node_mut(l).kind = Kind::List { content: l, starts: None, stops: None };
        assert!(matches!(s.resolve("a/b"), Err(Error::Shape(_))));
        assert!(matches!(s.matches("a/*"), Err(Error::Shape(_))));
        assert_eq!(s.resolve("a").unwrap(), vec![r, l]);
    }
}
