//! The operation algebra over `(schema, buffer source)` pairs.
//!
//! A `Data` binds a schema to a source and compiles it lazily. Every
//! operation works on the compiled, fully named form of the schema, so the
//! schema it returns refers to the very buffers the receiver reads, plus
//! whatever new buffers the operation put into a fresh `Overlay`.
//!
//! - recastings (`recast`) edit the schema only.
//! - transformations (`transform`) derive new buffers.
//! - actions (`action`) return plain results.
pub mod action;
pub mod combine;
pub mod kernel;
pub mod recast;
pub mod transform;
mod view;

use std::fmt;
use std::sync::Arc;

use once_cell::unsync::OnceCell;

use crate::buffer::{Buffer, BufferSource, RoleKind};
use crate::compiler::{DEFAULT_DELIMITER, DEFAULT_PREFIX, ExtensionSet, GenId, Generator, compile};
use crate::error::{Error, Result};
use crate::overlay::{self, Overlay};
use crate::proxy::{Datum, Reader};
use crate::schema::{Kind, NodeId, Schema};

pub use action::{Column, Row, Table};
pub use combine::{Deferred, MapCombiner, Pending, ReduceCombiner};
pub use kernel::{DynCallback, DynFold, FoldKernel, Interpreted, Kernel, Specialized};

pub struct Data {
    schema: Schema,
    source: Arc<dyn BufferSource>,
    prefix: String,
    delimiter: String,
    extensions: ExtensionSet,
    whence: usize,
    generator: OnceCell<Generator>,
}

impl Data {
    pub fn new(schema: Schema, source: Arc<dyn BufferSource>) -> Self {
        Data {
            schema,
            source,
            prefix: DEFAULT_PREFIX.to_string(),
            delimiter: DEFAULT_DELIMITER.to_string(),
            extensions: ExtensionSet::common(),
            whence: 0,
            generator: OnceCell::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self.generator = OnceCell::new();
        self
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self.generator = OnceCell::new();
        self
    }

    pub fn with_extensions(mut self, extensions: ExtensionSet) -> Self {
        self.extensions = extensions;
        self.generator = OnceCell::new();
        self
    }

    /// The same data viewed at element `whence` of the root; anything but
    /// 0 is a non-root view.
    pub fn at(&self, whence: usize) -> Data {
        Data { whence, ..self.derive(self.schema.clone(), self.source.clone()) }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn source(&self) -> &Arc<dyn BufferSource> {
        &self.source
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    pub fn extensions(&self) -> &ExtensionSet {
        &self.extensions
    }

    pub fn whence(&self) -> usize {
        self.whence
    }

    pub fn is_root(&self) -> bool {
        self.whence == 0
    }

    /// Compiled once per `Data`, on first use.
    pub fn generator(&self) -> Result<&Generator> {
        self.generator
            .get_or_try_init(|| compile(&self.schema, &self.prefix, &self.delimiter, &self.extensions))
    }

    /// Hands the value this view points at to `f`.
    pub fn read<T>(&self, f: impl FnOnce(Datum<'_>) -> Result<T>) -> Result<T> {
        let generator = self.generator()?;
        let reader = Reader::new(generator, self.source.as_ref());
        f(reader.get(generator.root(), self.whence)?)
    }

    /// Flattens the overlays stacked up by previous operations into one
    /// schema and one buffer map under `namespace`.
    pub fn collect(&self, namespace: &str) -> Result<(Schema, indexmap::IndexMap<String, Arc<Buffer>>)> {
        overlay::collect(&self.schema, self.source.as_ref(), namespace, &self.prefix, &self.delimiter)
    }

    // ------------------------------- Helpers ---------------------------------- //

    fn derive(&self, schema: Schema, source: Arc<dyn BufferSource>) -> Data {
        Data {
            schema,
            source,
            prefix: self.prefix.clone(),
            delimiter: self.delimiter.clone(),
            extensions: self.extensions.clone(),
            whence: self.whence,
            generator: OnceCell::new(),
        }
    }

    fn require_root(&self, op: &'static str) -> Result<()> {
        if self.is_root() { Ok(()) } else { Err(Error::NotRoot(op)) }
    }

    /// The compiled schema with every buffer name explicit; node `i` reads
    /// through generator node `i`.
    fn named(&self) -> Result<Schema> {
        self.generator()?.named_schema()
    }

    fn overlay(&self) -> Result<Overlay> {
        Ok(Overlay::new(self.source.clone(), &self.generator()?.namespaces()))
    }

    fn reader(&self) -> Result<Reader<'_>> {
        Ok(Reader::new(self.generator()?, self.source.as_ref()))
    }

    /// Publishes an edited schema together with the overlay holding its new
    /// buffers.
    fn finish(&self, schema: Schema, overlay: Overlay) -> Result<Data> {
        Ok(self.derive(schema.compact()?, Arc::new(overlay)))
    }

    fn recast(&self, schema: Schema) -> Result<Data> {
        Ok(self.derive(schema.compact()?, self.source.clone()))
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Data")
            .field("schema", &self.schema)
            .field("prefix", &self.prefix)
            .field("delimiter", &self.delimiter)
            .field("extensions", &self.extensions.names())
            .field("whence", &self.whence)
            .finish()
    }
}

/// The chain `resolve(path)` returns, innermost node first.
fn chain(schema: &Schema, path: &str) -> Result<Vec<NodeId>> {
    let mut nodes = schema.resolve(path)?;
    nodes.reverse();
    Ok(nodes)
}

/// Pushes list contents onto an innermost-first chain until it ends in a
/// non-list.
fn descend(schema: &Schema, nodes: &mut Vec<NodeId>) -> Result<()> {
    let mut passed = vec![nodes[0]];
    while let Kind::List { content, .. } = schema.node(nodes[0]).kind() {
        if passed.contains(content) {
            return Err(Error::shape("a list contains itself"));
        }
        passed.push(*content);
        nodes.insert(0, *content);
    }
    Ok(())
}

/// Starts and stops of the list at `list` in the named schema.
fn bounds(reader: &Reader<'_>, list: NodeId) -> Result<(Vec<i64>, Vec<i64>)> {
    let gid = GenId(list.index());
    let starts = reader.buffer(gid, RoleKind::Starts)?.to_indexes()?;
    let stops = reader.buffer(gid, RoleKind::Stops)?.to_indexes()?;
    if starts.len() != stops.len() {
        return Err(Error::malformed(format!(
            "list has {} starts but {} stops",
            starts.len(),
            stops.len()
        )));
    }
    if let Some(k) = starts.iter().zip(&stops).position(|(start, stop)| *start < 0 || stop < start) {
        return Err(Error::malformed(format!("list slot {k} has bounds [{}, {})", starts[k], stops[k])));
    }
    Ok((starts, stops))
}

fn last_component(path: &str) -> Option<&str> {
    path.split('/').filter(|c| !c.is_empty()).last()
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::buffer::MemorySource;
    use crate::dtype::DType;

    /// `List(Record{x: float64, muons: List(Record{pt: float32, q: int8})})`
    /// over three events holding 3, 0 and 2 muons.
    pub(crate) fn events() -> Data {
        let mut s = Schema::new();
        let pt = s.primitive(DType::Float32);
        let q = s.primitive(DType::Int8);
        let muon = s.record([("pt", pt), ("q", q)]).unwrap();
        let muons = s.list(muon);
        let x = s.primitive(DType::Float64);
        let event = s.record([("x", x), ("muons", muons)]).unwrap();
        let root = s.list(event);
        s.set_root(root).unwrap();

        let source = MemorySource::new()
            .with("object-B", Buffer::Int64(vec![0]))
            .with("object-E", Buffer::Int64(vec![3]))
            .with("object-L-Fx-Df8", Buffer::Float64(vec![1.5, 2.5, 3.5]))
            .with("object-L-Fmuons-B", Buffer::Int64(vec![0, 3, 3]))
            .with("object-L-Fmuons-E", Buffer::Int64(vec![3, 3, 5]))
            .with("object-L-Fmuons-L-Fpt-Df4", Buffer::Float32(vec![10.0, 20.0, 30.0, 40.0, 50.0]))
            .with("object-L-Fmuons-L-Fq-Di1", Buffer::Int8(vec![1, -1, 1, -1, -1]));
        Data::new(s, Arc::new(source))
    }

    /// Every `pt` of every event, in order.
    pub(crate) fn all_pt(data: &Data) -> Vec<Vec<f64>> {
        data.read(|root| {
            root.as_list()?
                .iter()
                .map(|event| {
                    event?
                        .field("muons")?
                        .as_list()?
                        .iter()
                        .map(|m| m?.field("pt")?.as_f64())
                        .collect::<Result<Vec<_>>>()
                })
                .collect()
        })
        .unwrap()
    }

    #[test]
    fn reads_through_the_lazy_generator() {
        let data = events();
        assert_eq!(all_pt(&data), vec![vec![10.0, 20.0, 30.0], vec![], vec![40.0, 50.0]]);
        let first = data.generator().unwrap() as *const Generator;
        let again = data.generator().unwrap() as *const Generator;
        assert_eq!(first, again);
    }

    #[test]
    fn non_root_views_are_rejected() {
        let data = events().at(1);
        assert!(!data.is_root());
        assert!(matches!(data.flatten("muons"), Err(Error::NotRoot("flatten"))));
    }

    #[test]
    fn collect_bakes_operation_buffers() {
        let data = events().index("i", "muons").unwrap();
        let (schema, buffers) = data.collect("baked").unwrap();
        assert_eq!(buffers.len(), 1);
        let (_, index) = buffers.first().unwrap();
        assert_eq!(**index, Buffer::Int64(vec![0, 1, 2, 0, 1]));
        assert!(schema.ids().any(|id| schema.node(id).namespace() == "baked"));
    }
}
