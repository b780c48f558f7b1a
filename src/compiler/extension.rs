//! Per-node runtime overrides chosen at compile time.
//!
//! An extension set is an ordered list; the first extension whose
//! `matches` accepts a node is recorded on its generator node and gets to
//! `decorate` every value read from it.

use std::fmt::Debug;
use std::sync::Arc;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::proxy::Datum;
use crate::schema::{Kind, NodeId, Schema};

pub trait Extension: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn matches(&self, schema: &Schema, node: NodeId) -> bool;

    /// Replaces the generic value read for a matched node.
    fn decorate<'a>(&self, datum: Datum<'a>) -> Result<Datum<'a>>;
}

/// List of non-nullable `uint8` carrying the given type name.
fn is_named_byte_list(schema: &Schema, node: NodeId, name: &str) -> bool {
    let node = schema.node(node);
    let Kind::List { content, .. } = node.kind() else {
        return false;
    };
    let content = schema.node(*content);
    node.name() == Some(name)
        && !content.nullable()
        && matches!(content.kind(), Kind::Primitive { dtype: DType::UInt8, dims, .. } if dims.is_empty())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8String;

impl Extension for Utf8String {
    fn name(&self) -> &str {
        "UTF8String"
    }

    fn matches(&self, schema: &Schema, node: NodeId) -> bool {
        is_named_byte_list(schema, node, self.name())
    }

    fn decorate<'a>(&self, datum: Datum<'a>) -> Result<Datum<'a>> {
        match datum {
            Datum::List(list) => {
                let bytes = list.bytes()?;
                String::from_utf8(bytes)
                    .map(Datum::Str)
                    .map_err(|e| Error::malformed(format!("invalid UTF-8 in string: {e}")))
            }
            other => Ok(other),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ByteString;

impl Extension for ByteString {
    fn name(&self) -> &str {
        "ByteString"
    }

    fn matches(&self, schema: &Schema, node: NodeId) -> bool {
        is_named_byte_list(schema, node, self.name())
    }

    fn decorate<'a>(&self, datum: Datum<'a>) -> Result<Datum<'a>> {
        match datum {
            Datum::List(list) => Ok(Datum::Bytes(list.bytes()?)),
            other => Ok(other),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtensionSet(Vec<Arc<dyn Extension>>);

impl ExtensionSet {
    pub fn none() -> Self {
        ExtensionSet(Vec::new())
    }

    /// Strings and byte strings.
    pub fn common() -> Self {
        ExtensionSet(vec![Arc::new(Utf8String), Arc::new(ByteString)])
    }

    /// Appends `ext`; earlier entries keep priority.
    pub fn with(mut self, ext: impl Extension + 'static) -> Self {
        self.0.push(Arc::new(ext));
        self
    }

    /// Built-in extensions by name, in the given order.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut out = ExtensionSet::none();
        for name in names {
            out = match name.as_ref() {
                "UTF8String" => out.with(Utf8String),
                "ByteString" => out.with(ByteString),
                other => return Err(Error::unsupported(format!("unknown extension {other:?}"))),
            };
        }
        Ok(out)
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|e| e.name().to_string()).collect()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<dyn Extension>> {
        self.0.get(index)
    }

    /// Index of the first extension accepting `node`.
    pub fn find(&self, schema: &Schema, node: NodeId) -> Option<usize> {
        self.0.iter().position(|e| e.matches(schema, node))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_match_wins_and_names_round_trip() {
        let mut s = Schema::new();
        let byte = s.primitive(DType::UInt8);
        let text = s.list(byte);
        s.set_name(text, Some("UTF8String")).unwrap();
        let raw = s.list(byte);
        s.set_name(raw, Some("ByteString")).unwrap();

        let set = ExtensionSet::common();
        assert_eq!(set.find(&s, text), Some(0));
        assert_eq!(set.find(&s, raw), Some(1));
        assert_eq!(set.find(&s, byte), None);

        let again = ExtensionSet::from_names(set.names().as_slice()).unwrap();
        assert_eq!(again.names(), ["UTF8String", "ByteString"]);
        assert!(ExtensionSet::from_names(&["Complex"][..]).is_err());
    }
}
