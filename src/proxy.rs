//! Element access over a compiled generator and a buffer source.
//!
//! A `Reader` resolves `(generator node, index)` pairs into `Datum`s,
//! fetching each buffer at most once per reader. Lists, records and tuples
//! come back as lightweight proxies that read further on demand.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::buffer::{Buffer, BufferSource, RoleKind};
use crate::compiler::{GenId, GenKind, Generator, Slot};
use crate::dtype::Scalar;
use crate::error::{Error, Result};

/// Mask value marking an absent element.
pub const MASKED: i32 = -1;

// ————————————————————————————————————————————————————————————————————————————
// READER
// ————————————————————————————————————————————————————————————————————————————

pub struct Reader<'a> {
    generator: &'a Generator,
    source: &'a dyn BufferSource,
    cache: RefCell<Vec<Option<Arc<Buffer>>>>,
}

impl<'a> Reader<'a> {
    pub fn new(generator: &'a Generator, source: &'a dyn BufferSource) -> Self {
        Reader { generator, source, cache: RefCell::new(vec![None; generator.cache_len()]) }
    }

    pub fn generator(&self) -> &'a Generator {
        self.generator
    }

    fn fetch(&self, slot: &Slot, namespace: &str) -> Result<Arc<Buffer>> {
        if let Some(Some(hit)) = self.cache.borrow().get(slot.cache) {
            return Ok(hit.clone());
        }
        let buffer = self.source.get_in(namespace, &slot.name)?;
        trace!("fetched {:?} in namespace {:?}: {} elements", slot.name, namespace, buffer.len());
        if let Some(entry) = self.cache.borrow_mut().get_mut(slot.cache) {
            *entry = Some(buffer.clone());
        }
        Ok(buffer)
    }

    /// The buffer backing one role of a generator node.
    pub fn buffer(&self, gid: GenId, role: RoleKind) -> Result<Arc<Buffer>> {
        let node = self.generator.node(gid);
        let slot = node
            .slots()
            .into_iter()
            .find(|(kind, _)| *kind == role)
            .map(|(_, slot)| slot)
            .ok_or_else(|| Error::shape(format!("generator node has no {role:?} buffer")))?;
        self.fetch(slot, &node.namespace)
    }

    /// Value of element `index` of the node `gid`.
    pub fn get(&self, gid: GenId, index: usize) -> Result<Datum<'_>> {
        let node = self.generator.node(gid);
        let ns = node.namespace.as_str();
        let mut index = index;
        if let Some(mask) = &node.mask {
            let at = self.fetch(mask, ns)?.index(index)?;
            if at < 0 {
                return Ok(Datum::Null);
            }
            index = at as usize;
        }

        let datum = match &node.kind {
            GenKind::Primitive { dims, data, .. } => {
                let buffer = self.fetch(data, ns)?;
                if dims.is_empty() {
                    Datum::Scalar(buffer.scalar(index)?)
                } else {
                    let width: usize = dims.iter().product();
                    let values = (index * width..(index + 1) * width)
                        .map(|i| buffer.scalar(i))
                        .collect::<Result<Vec<_>>>()?;
                    Datum::Block { values, dims: dims.clone() }
                }
            }
            GenKind::List { starts, stops, content } => {
                let start = self.fetch(starts, ns)?.index(index)?;
                let stop = self.fetch(stops, ns)?.index(index)?;
                if start < 0 || stop < start {
                    return Err(Error::malformed(format!("list slot {index} has bounds [{start}, {stop})")));
                }
                Datum::List(ListProxy { reader: self, content: *content, start: start as usize, stop: stop as usize })
            }
            GenKind::Union { tags, offsets, possibilities } => {
                let tag = self.fetch(tags, ns)?.index(index)?;
                let offset = self.fetch(offsets, ns)?.index(index)?;
                let Some(possibility) = usize::try_from(tag).ok().and_then(|t| possibilities.get(t)) else {
                    return Err(Error::OutOfBounds { index: tag.max(0) as usize, len: possibilities.len() });
                };
                let offset = usize::try_from(offset)
                    .map_err(|_| Error::malformed(format!("union slot {index} has offset {offset}")))?;
                self.get(*possibility, offset)?
            }
            GenKind::Record { .. } => Datum::Record(RecordProxy { reader: self, gid, index }),
            GenKind::Tuple { .. } => Datum::Tuple(TupleProxy { reader: self, gid, index }),
            GenKind::Pointer { positions, .. } => {
                let position = self.fetch(positions, ns)?.index(index)?;
                let target = self.generator.target(gid)?;
                let position = usize::try_from(position)
                    .map_err(|_| Error::malformed(format!("pointer slot {index} has position {position}")))?;
                self.get(target, position)?
            }
        };

        match node.extension.and_then(|i| self.generator.extensions().get(i)) {
            Some(ext) => ext.decorate(datum),
            None => Ok(datum),
        }
    }
}

// ————————————————————————————————————————————————————————————————————————————
// VALUES
// ————————————————————————————————————————————————————————————————————————————

#[derive(Debug, Clone)]
pub enum Datum<'r> {
    Null,
    Scalar(Scalar),
    /// Primitive with fixed extra dimensions, row-major.
    Block { values: Vec<Scalar>, dims: Vec<usize> },
    Str(String),
    Bytes(Vec<u8>),
    List(ListProxy<'r>),
    Record(RecordProxy<'r>),
    Tuple(TupleProxy<'r>),
}

impl<'r> Datum<'r> {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    fn kind(&self) -> &'static str {
        match self {
            Datum::Null => "null",
            Datum::Scalar(_) => "scalar",
            Datum::Block { .. } => "block",
            Datum::Str(_) => "string",
            Datum::Bytes(_) => "bytes",
            Datum::List(_) => "list",
            Datum::Record(_) => "record",
            Datum::Tuple(_) => "tuple",
        }
    }

    fn expected(&self, what: &str) -> Error {
        Error::shape(format!("expected {what}, found {}", self.kind()))
    }

    pub fn as_scalar(&self) -> Result<Scalar> {
        match self {
            Datum::Scalar(s) => Ok(*s),
            other => Err(other.expected("a scalar")),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        self.as_scalar().map(Scalar::as_f64)
    }

    pub fn as_i64(&self) -> Result<i64> {
        self.as_scalar().map(Scalar::as_i64)
    }

    pub fn as_bool(&self) -> Result<bool> {
        self.as_scalar().map(Scalar::as_bool)
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Datum::Str(s) => Ok(s),
            other => Err(other.expected("a string")),
        }
    }

    pub fn as_list(&self) -> Result<&ListProxy<'r>> {
        match self {
            Datum::List(l) => Ok(l),
            other => Err(other.expected("a list")),
        }
    }

    pub fn as_record(&self) -> Result<&RecordProxy<'r>> {
        match self {
            Datum::Record(r) => Ok(r),
            other => Err(other.expected("a record")),
        }
    }

    pub fn as_tuple(&self) -> Result<&TupleProxy<'r>> {
        match self {
            Datum::Tuple(t) => Ok(t),
            other => Err(other.expected("a tuple")),
        }
    }

    /// Shorthand for `as_record()?.field(name)`.
    pub fn field(&self, name: &str) -> Result<Datum<'r>> {
        self.as_record()?.field(name)
    }
}

// ————————————————————————————————————————————————————————————————————————————
// PROXIES
// ————————————————————————————————————————————————————————————————————————————

#[derive(Clone, Copy)]
pub struct ListProxy<'r> {
    reader: &'r Reader<'r>,
    content: GenId,
    start: usize,
    stop: usize,
}

impl<'r> ListProxy<'r> {
    pub fn len(&self) -> usize {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.stop == self.start
    }

    /// Absolute index range into the content.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.stop
    }

    pub fn content(&self) -> GenId {
        self.content
    }

    pub fn get(&self, i: usize) -> Result<Datum<'r>> {
        if i >= self.len() {
            return Err(Error::OutOfBounds { index: i, len: self.len() });
        }
        self.reader.get(self.content, self.start + i)
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<Datum<'r>>> + use<'r> {
        let this = *self;
        (0..this.len()).map(move |i| this.get(i))
    }

    /// Raw bytes of a list of non-nullable `uint8`.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        let node = self.reader.generator.node(self.content);
        match &node.kind {
            GenKind::Primitive { dims, data, .. } if node.mask.is_none() && dims.is_empty() => {
                let buffer = self.reader.fetch(data, &node.namespace)?;
                match &*buffer {
                    Buffer::UInt8(v) => v
                        .get(self.range())
                        .map(<[u8]>::to_vec)
                        .ok_or(Error::OutOfBounds { index: self.stop, len: v.len() }),
                    other => Err(Error::shape(format!("expected uint8 content, found {}", other.dtype()))),
                }
            }
            _ => Err(Error::shape("byte content must be a non-nullable primitive")),
        }
    }
}

impl fmt::Debug for ListProxy<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListProxy")
            .field("content", &self.content)
            .field("start", &self.start)
            .field("stop", &self.stop)
            .finish()
    }
}

#[derive(Clone, Copy)]
pub struct RecordProxy<'r> {
    reader: &'r Reader<'r>,
    gid: GenId,
    index: usize,
}

impl<'r> RecordProxy<'r> {
    pub fn name(&self) -> Option<&'r str> {
        self.reader.generator.node(self.gid).name.as_deref()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn fields(&self) -> Vec<&'r str> {
        match &self.reader.generator.node(self.gid).kind {
            GenKind::Record { fields } => fields.keys().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Result<Datum<'r>> {
        let child = match &self.reader.generator.node(self.gid).kind {
            GenKind::Record { fields } => fields.get(name).copied(),
            _ => None,
        };
        match child {
            Some(child) => self.reader.get(child, self.index),
            None => Err(Error::shape(format!("record has no field {name:?}"))),
        }
    }
}

impl fmt::Debug for RecordProxy<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordProxy")
            .field("name", &self.name())
            .field("fields", &self.fields())
            .field("index", &self.index)
            .finish()
    }
}

#[derive(Clone, Copy)]
pub struct TupleProxy<'r> {
    reader: &'r Reader<'r>,
    gid: GenId,
    index: usize,
}

impl<'r> TupleProxy<'r> {
    fn types(&self) -> &'r [GenId] {
        match &self.reader.generator.node(self.gid).kind {
            GenKind::Tuple { types } => types,
            _ => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.types().len()
    }

    pub fn is_empty(&self) -> bool {
        self.types().is_empty()
    }

    pub fn get(&self, i: usize) -> Result<Datum<'r>> {
        let types = self.types();
        match types.get(i) {
            Some(child) => self.reader.get(*child, self.index),
            None => Err(Error::OutOfBounds { index: i, len: types.len() }),
        }
    }
}

impl fmt::Debug for TupleProxy<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TupleProxy").field("len", &self.len()).field("index", &self.index).finish()
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MemorySource;
    use crate::compiler::{ExtensionSet, compile};
    use crate::dtype::DType;
    use crate::schema::Schema;

    #[test]
    fn reads_lists_of_records_with_masks() {
        let mut s = Schema::new();
        let x = s.primitive(DType::Float64);
        s.set_nullable(x, true);
        let name = s.primitive(DType::UInt8);
        let text = s.list(name);
        s.set_name(text, Some("UTF8String")).unwrap();
        let rec = s.record([("x", x), ("label", text)]).unwrap();
        let root = s.list(rec);
        s.set_root(root).unwrap();
        let g = compile(&s, "object", "-", &ExtensionSet::common()).unwrap();

        let src = MemorySource::new()
            .with("object-B", Buffer::Int64(vec![0]))
            .with("object-E", Buffer::Int64(vec![2]))
            .with("object-L-Fx-M", Buffer::Int32(vec![MASKED, 0]))
            .with("object-L-Fx-Df8", Buffer::Float64(vec![2.5]))
            .with("object-L-Flabel-B", Buffer::Int64(vec![0, 2]))
            .with("object-L-Flabel-E", Buffer::Int64(vec![2, 5]))
            .with("object-L-Flabel-L-Du1", Buffer::UInt8(b"hithe".to_vec()));
        let reader = Reader::new(&g, &src);
        let top = reader.get(g.root(), 0).unwrap();
        let list = top.as_list().unwrap();
        assert_eq!(list.len(), 2);

        let first = list.get(0).unwrap();
        assert!(first.field("x").unwrap().is_null());
        assert_eq!(first.field("label").unwrap().as_str().unwrap(), "hi");
        let second = list.get(1).unwrap();
        assert_eq!(second.field("x").unwrap().as_f64().unwrap(), 2.5);
        assert_eq!(second.field("label").unwrap().as_str().unwrap(), "the");
        assert!(matches!(list.get(2), Err(Error::OutOfBounds { .. })));
    }

    #[test]
    fn follows_unions_and_pointers() {
        let mut s = Schema::new();
        let i = s.primitive(DType::Int32);
        let f = s.primitive(DType::Float32);
        let u = s.union(vec![i, f]);
        let p = s.pointer(Some(u));
        let pair = s.tuple(vec![u, p]);
        let root = s.list(pair);
        s.set_root(root).unwrap();
        let g = compile(&s, "t", "-", &ExtensionSet::none()).unwrap();

        let src = MemorySource::new()
            .with("t-B", Buffer::Int32(vec![0]))
            .with("t-E", Buffer::Int32(vec![2]))
            .with("t-L-F0-T", Buffer::Int8(vec![1, 0]))
            .with("t-L-F0-O", Buffer::Int32(vec![0, 0]))
            .with("t-L-F0-U0-Di4", Buffer::Int32(vec![7]))
            .with("t-L-F0-U1-Df4", Buffer::Float32(vec![0.5]))
            .with("t-L-F1-P-t-L-F0", Buffer::Int32(vec![1, 1]));
        let reader = Reader::new(&g, &src);
        let top = reader.get(g.root(), 0).unwrap();
        let rows: Vec<Datum> = top.as_list().unwrap().iter().collect::<Result<_>>().unwrap();
        let first = rows[0].as_tuple().unwrap();
        assert_eq!(first.get(0).unwrap().as_f64().unwrap(), 0.5);
        assert_eq!(first.get(1).unwrap().as_i64().unwrap(), 7);
        assert_eq!(rows[1].as_tuple().unwrap().get(0).unwrap().as_i64().unwrap(), 7);
    }

    #[test]
    fn negative_pointer_positions_are_malformed() {
        let mut s = Schema::new();
        let x = s.primitive(DType::Int32);
        let p = s.pointer(Some(x));
        let pair = s.tuple(vec![x, p]);
        let root = s.list(pair);
        s.set_root(root).unwrap();
        let g = compile(&s, "t", "-", &ExtensionSet::none()).unwrap();

        let src = MemorySource::new()
            .with("t-B", Buffer::Int32(vec![0]))
            .with("t-E", Buffer::Int32(vec![1]))
            .with("t-L-F0-Di4", Buffer::Int32(vec![7]))
            .with("t-L-F1-P-t-L-F0", Buffer::Int32(vec![-1]));
        let reader = Reader::new(&g, &src);
        let top = reader.get(g.root(), 0).unwrap();
        let row = top.as_list().unwrap().get(0).unwrap();
        let row = row.as_tuple().unwrap();
        assert_eq!(row.get(0).unwrap().as_i64().unwrap(), 7);
        assert!(matches!(row.get(1), Err(Error::Malformed(_))));
    }

    #[test]
    fn missing_buffers_surface_their_names() {
        let mut s = Schema::new();
        let x = s.primitive(DType::Bool);
        let root = s.list(x);
        s.set_root(root).unwrap();
        let g = compile(&s, "object", "-", &ExtensionSet::none()).unwrap();
        let src = MemorySource::new();
        let reader = Reader::new(&g, &src);
        let err = reader.get(g.root(), 0).unwrap_err();
        assert!(matches!(err, Error::MissingBuffer { ref name, .. } if name == "object-B"));
    }
}
