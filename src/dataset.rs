//! Datasets: a schema plus everything needed to find its buffers.
//!
//! The JSON envelope is the persisted configuration of a dataset: naming
//! prefix and delimiter, extension names, an optional partitioning of the
//! root list into separately stored chunks, packing and free metadata.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::buffer::{Buffer, BufferSource};
use crate::compiler::{DEFAULT_DELIMITER, DEFAULT_PREFIX, ExtensionSet};
use crate::error::{Error, Result};
use crate::operations::Data;
use crate::path_de::{from_str_with_path, from_value_with_path};
use crate::schema::{Kind, Packing, Schema, check_delimiter};

// ————————————————————————————————————————————————————————————————————————————
// PARTITIONING
// ————————————————————————————————————————————————————————————————————————————

/// One column's entry in an explicit partition table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PartitionEntry {
    Name(String),
    Lookup(i64),
}

/// Where one column of one partition is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayId {
    Name(String),
    Lookup(i64),
    /// Resolved by whatever `lookup` names, outside this crate.
    External { lookup: String, column: String, partition: usize },
}

/// How the root list is cut into partitions and how a partition's
/// buffers are named.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PartitioningJson", into = "PartitioningJson")]
pub enum Partitioning {
    Explicit { offsets: Vec<i64>, partitions: Vec<IndexMap<String, PartitionEntry>> },
    /// `<partition><delimiter><column>`
    Prefix { offsets: Vec<i64>, delimiter: String },
    /// `<column><delimiter>part<partition>`
    Suffix { offsets: Vec<i64>, delimiter: String },
    External { lookup: String },
}

impl Partitioning {
    pub fn prefix(offsets: Vec<i64>) -> Result<Self> {
        Self::validated(Partitioning::Prefix { offsets, delimiter: DEFAULT_DELIMITER.to_string() })
    }

    pub fn suffix(offsets: Vec<i64>) -> Result<Self> {
        Self::validated(Partitioning::Suffix { offsets, delimiter: DEFAULT_DELIMITER.to_string() })
    }

    pub fn explicit(offsets: Vec<i64>, partitions: Vec<IndexMap<String, PartitionEntry>>) -> Result<Self> {
        Self::validated(Partitioning::Explicit { offsets, partitions })
    }

    fn validated(self) -> Result<Self> {
        if let Some(offsets) = self.offsets() {
            let mut last = 0;
            for x in offsets {
                if *x < last {
                    return Err(Error::invalid("partition offsets must be non-negative and non-decreasing"));
                }
                last = *x;
            }
        }
        if let Partitioning::Prefix { delimiter, .. } | Partitioning::Suffix { delimiter, .. } = &self {
            check_delimiter(delimiter)?;
        }
        Ok(self)
    }

    pub fn offsets(&self) -> Option<&[i64]> {
        match self {
            Partitioning::Explicit { offsets, .. }
            | Partitioning::Prefix { offsets, .. }
            | Partitioning::Suffix { offsets, .. } => Some(offsets),
            Partitioning::External { .. } => None,
        }
    }

    pub fn num_partitions(&self) -> Option<usize> {
        self.offsets().map(|o| o.len().saturating_sub(1))
    }

    pub fn array_id(&self, column: &str, partition: usize) -> Result<ArrayId> {
        let in_range = |n: usize| {
            if partition < n { Ok(()) } else { Err(Error::OutOfBounds { index: partition, len: n }) }
        };
        match self {
            Partitioning::Explicit { partitions, .. } => {
                in_range(partitions.len())?;
                match partitions[partition].get(column) {
                    Some(PartitionEntry::Name(name)) => Ok(ArrayId::Name(name.clone())),
                    Some(PartitionEntry::Lookup(key)) => Ok(ArrayId::Lookup(*key)),
                    None => Err(Error::shape(format!("partition {partition} has no column {column:?}"))),
                }
            }
            Partitioning::Prefix { delimiter, .. } => {
                in_range(self.num_partitions().unwrap_or(0))?;
                Ok(ArrayId::Name(format!("{partition}{delimiter}{column}")))
            }
            Partitioning::Suffix { delimiter, .. } => {
                in_range(self.num_partitions().unwrap_or(0))?;
                Ok(ArrayId::Name(format!("{column}{delimiter}part{partition}")))
            }
            Partitioning::External { lookup } => Ok(ArrayId::External {
                lookup: lookup.clone(),
                column: column.to_string(),
                partition,
            }),
        }
    }

    /// The partition holding root element `index` (negative counts from
    /// the end), and where `column` is stored for it.
    pub fn array_at(&self, column: &str, index: i64) -> Result<ArrayId> {
        let offsets = self
            .offsets()
            .ok_or_else(|| Error::unsupported("external partitionings have no offsets"))?;
        let total = offsets.last().copied().unwrap_or(0);
        let normal = if index < 0 { index + total } else { index };
        if !(0..total).contains(&normal) {
            return Err(Error::OutOfBounds { index: index.unsigned_abs() as usize, len: total as usize });
        }
        let partition = offsets.partition_point(|o| *o <= normal) - 1;
        self.array_id(column, partition)
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        from_value_with_path(value)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum AffixArgs {
    Delimited(Vec<i64>, String),
    Plain((Vec<i64>,)),
}

impl AffixArgs {
    fn new(offsets: Vec<i64>, delimiter: String) -> Self {
        if delimiter == DEFAULT_DELIMITER {
            AffixArgs::Plain((offsets,))
        } else {
            AffixArgs::Delimited(offsets, delimiter)
        }
    }

    fn split(self) -> (Vec<i64>, String) {
        match self {
            AffixArgs::Delimited(offsets, delimiter) => (offsets, delimiter),
            AffixArgs::Plain((offsets,)) => (offsets, DEFAULT_DELIMITER.to_string()),
        }
    }
}

/// `{"<Kind>Partitioning": [args...]}`
#[derive(Serialize, Deserialize)]
enum PartitioningJson {
    ExplicitPartitioning(Vec<i64>, Vec<IndexMap<String, PartitionEntry>>),
    PrefixPartitioning(AffixArgs),
    SuffixPartitioning(AffixArgs),
    ExternalPartitioning((String,)),
}

impl TryFrom<PartitioningJson> for Partitioning {
    type Error = Error;

    fn try_from(json: PartitioningJson) -> Result<Self> {
        let out = match json {
            PartitioningJson::ExplicitPartitioning(offsets, partitions) => Partitioning::Explicit { offsets, partitions },
            PartitioningJson::PrefixPartitioning(args) => {
                let (offsets, delimiter) = args.split();
                Partitioning::Prefix { offsets, delimiter }
            }
            PartitioningJson::SuffixPartitioning(args) => {
                let (offsets, delimiter) = args.split();
                Partitioning::Suffix { offsets, delimiter }
            }
            PartitioningJson::ExternalPartitioning((lookup,)) => Partitioning::External { lookup },
        };
        out.validated()
    }
}

impl From<Partitioning> for PartitioningJson {
    fn from(p: Partitioning) -> Self {
        match p {
            Partitioning::Explicit { offsets, partitions } => PartitioningJson::ExplicitPartitioning(offsets, partitions),
            Partitioning::Prefix { offsets, delimiter } => {
                PartitioningJson::PrefixPartitioning(AffixArgs::new(offsets, delimiter))
            }
            Partitioning::Suffix { offsets, delimiter } => {
                PartitioningJson::SuffixPartitioning(AffixArgs::new(offsets, delimiter))
            }
            Partitioning::External { lookup } => PartitioningJson::ExternalPartitioning((lookup,)),
        }
    }
}

// ————————————————————————————————————————————————————————————————————————————
// DATASET
// ————————————————————————————————————————————————————————————————————————————

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    schema: Schema,
    prefix: Option<String>,
    delimiter: Option<String>,
    extension: Option<Vec<String>>,
    partitioning: Option<Partitioning>,
    packing: Option<Packing>,
    name: Option<String>,
    doc: Option<String>,
    metadata: Option<IndexMap<String, Value>>,
}

impl Dataset {
    pub fn new(schema: Schema) -> Self {
        Dataset {
            schema,
            prefix: None,
            delimiter: None,
            extension: None,
            partitioning: None,
            packing: None,
            name: None,
            doc: None,
            metadata: None,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn set_schema(&mut self, schema: Schema) -> Result<()> {
        if self.partitioning.is_some() {
            require_partitionable(&schema)?;
        }
        self.schema = schema;
        Ok(())
    }

    pub fn prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or(DEFAULT_PREFIX)
    }

    pub fn set_prefix(&mut self, prefix: Option<String>) {
        self.prefix = prefix;
    }

    pub fn delimiter(&self) -> &str {
        self.delimiter.as_deref().unwrap_or(DEFAULT_DELIMITER)
    }

    pub fn set_delimiter(&mut self, delimiter: Option<String>) -> Result<()> {
        if let Some(d) = &delimiter {
            check_delimiter(d)?;
        }
        self.delimiter = delimiter;
        Ok(())
    }

    pub fn extension(&self) -> Option<&[String]> {
        self.extension.as_deref()
    }

    pub fn set_extension(&mut self, names: Option<Vec<String>>) -> Result<()> {
        if let Some(names) = &names {
            ExtensionSet::from_names(names)?;
        }
        self.extension = names;
        Ok(())
    }

    /// The named extensions, or the common set when none are named.
    pub fn extensions(&self) -> Result<ExtensionSet> {
        match &self.extension {
            Some(names) => ExtensionSet::from_names(names),
            None => Ok(ExtensionSet::common()),
        }
    }

    pub fn partitioning(&self) -> Option<&Partitioning> {
        self.partitioning.as_ref()
    }

    pub fn set_partitioning(&mut self, partitioning: Option<Partitioning>) -> Result<()> {
        if partitioning.is_some() {
            require_partitionable(&self.schema)?;
        }
        self.partitioning = partitioning;
        Ok(())
    }

    pub fn packing(&self) -> Option<&Packing> {
        self.packing.as_ref()
    }

    pub fn set_packing(&mut self, packing: Option<Packing>) {
        self.packing = packing;
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    pub fn set_doc(&mut self, doc: Option<String>) {
        self.doc = doc;
    }

    pub fn metadata(&self) -> Option<&IndexMap<String, Value>> {
        self.metadata.as_ref()
    }

    pub fn metadata_mut(&mut self) -> &mut IndexMap<String, Value> {
        self.metadata.get_or_insert_with(IndexMap::new)
    }

    /// The whole dataset over `source`.
    pub fn data(&self, source: Arc<dyn BufferSource>) -> Result<Data> {
        Ok(Data::new(self.schema.clone(), source)
            .with_prefix(self.prefix())
            .with_delimiter(self.delimiter())
            .with_extensions(self.extensions()?))
    }

    /// One partition over `source`, which stores every partition's buffers
    /// under the names the partitioning gives them.
    pub fn partition(&self, partition: usize, source: Arc<dyn BufferSource>) -> Result<Data> {
        let partitioning = self
            .partitioning
            .clone()
            .ok_or_else(|| Error::Cardinality("dataset is not partitioned".into()))?;
        if let Some(n) = partitioning.num_partitions() {
            if partition >= n {
                return Err(Error::OutOfBounds { index: partition, len: n });
            }
        }
        debug!("opening partition {} of dataset {:?}", partition, self.name);
        self.data(Arc::new(PartitionSource { partitioning, partition, inner: source }))
    }

    // ------------------------------- JSON ------------------------------------- //

    pub fn to_json(&self, explicit: bool) -> Result<Value> {
        let json = DatasetJson {
            schema: self.schema.to_json(explicit)?,
            prefix: self.prefix.clone(),
            delimiter: self.delimiter.clone(),
            extension: self.extension.clone().map(OneOrMany::Many),
            partitioning: self.partitioning.clone(),
            packing: self.packing.clone(),
            name: self.name.clone(),
            doc: self.doc.clone(),
            metadata: self.metadata.clone(),
        };
        let mut out = serde_json::to_value(json)?;
        if explicit {
            if let Value::Object(map) = &mut out {
                for key in ["prefix", "delimiter", "extension", "partitioning", "packing", "name", "doc", "metadata"] {
                    map.entry(key).or_insert(Value::Null);
                }
            }
        }
        Ok(out)
    }

    pub fn to_json_string(&self, explicit: bool) -> Result<String> {
        Ok(serde_json::to_string(&self.to_json(explicit)?)?)
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        Self::from_envelope(from_value_with_path(value)?)
    }

    pub fn from_json_str(src: &str) -> Result<Self> {
        Self::from_envelope(from_str_with_path(src)?)
    }

    fn from_envelope(json: DatasetJson) -> Result<Self> {
        let schema = Schema::from_json(&json.schema)
            .map_err(|e| Error::malformed(format!("in dataset schema: {e}")))?;
        let mut out = Dataset::new(schema);
        out.set_prefix(json.prefix);
        out.set_delimiter(json.delimiter)?;
        out.set_extension(json.extension.map(OneOrMany::into_vec))?;
        out.set_partitioning(json.partitioning)?;
        out.packing = json.packing;
        out.name = json.name;
        out.doc = json.doc;
        out.metadata = json.metadata;
        Ok(out)
    }
}

fn require_partitionable(schema: &Schema) -> Result<()> {
    let root = schema.node(schema.root()?);
    if matches!(root.kind(), Kind::List { .. }) && !root.nullable() {
        Ok(())
    } else {
        Err(Error::invalid("partitionings can only be used on data whose schema is a non-nullable list"))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct DatasetJson {
    schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delimiter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extension: Option<OneOrMany>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    partitioning: Option<Partitioning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    packing: Option<Packing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    doc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<IndexMap<String, Value>>,
}

// ————————————————————————————————————————————————————————————————————————————
// PARTITION SOURCE
// ————————————————————————————————————————————————————————————————————————————

/// Reads one partition's buffers out of a source holding all of them.
struct PartitionSource {
    partitioning: Partitioning,
    partition: usize,
    inner: Arc<dyn BufferSource>,
}

impl BufferSource for PartitionSource {
    fn get(&self, name: &str) -> Result<Arc<Buffer>> {
        match self.partitioning.array_id(name, self.partition)? {
            ArrayId::Name(stored) => self.inner.get(&stored),
            ArrayId::Lookup(key) => self.inner.get(&key.to_string()),
            ArrayId::External { lookup, .. } => {
                Err(Error::unsupported(format!("partition lookups through {lookup:?}")))
            }
        }
    }

    fn close(&self) {
        self.inner.close();
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::buffer::MemorySource;
    use crate::dtype::DType;

    fn list_of_floats() -> Schema {
        let mut s = Schema::new();
        let x = s.primitive(DType::Float64);
        let root = s.list(x);
        s.set_root(root).unwrap();
        s
    }

    #[test]
    fn array_ids_per_scheme() {
        let prefix = Partitioning::prefix(vec![0, 3, 5]).unwrap();
        assert_eq!(prefix.array_id("object-B", 1).unwrap(), ArrayId::Name("1-object-B".into()));
        assert!(matches!(prefix.array_id("object-B", 2), Err(Error::OutOfBounds { .. })));
        assert_eq!(prefix.array_at("c", 4).unwrap(), ArrayId::Name("1-c".into()));
        assert_eq!(prefix.array_at("c", -5).unwrap(), ArrayId::Name("0-c".into()));
        assert!(prefix.array_at("c", 5).is_err());

        let suffix = Partitioning::suffix(vec![0, 2]).unwrap();
        assert_eq!(suffix.array_id("c", 0).unwrap(), ArrayId::Name("c-part0".into()));

        let explicit = Partitioning::explicit(
            vec![0, 1],
            vec![[("c".to_string(), PartitionEntry::Lookup(7))].into_iter().collect()],
        )
        .unwrap();
        assert_eq!(explicit.array_id("c", 0).unwrap(), ArrayId::Lookup(7));
        assert!(matches!(explicit.array_id("d", 0), Err(Error::Shape(_))));
        assert!(Partitioning::prefix(vec![0, 3, 2]).is_err());
    }

    #[test]
    fn partitioning_json_form() {
        let suffix = Partitioning::Suffix { offsets: vec![0, 4], delimiter: "_".into() };
        assert_eq!(suffix.to_json().unwrap(), json!({"SuffixPartitioning": [[0, 4], "_"]}));
        let prefix = Partitioning::prefix(vec![0, 4]).unwrap();
        assert_eq!(prefix.to_json().unwrap(), json!({"PrefixPartitioning": [[0, 4]]}));
        let external = json!({"ExternalPartitioning": ["catalog"]});
        assert_eq!(Partitioning::from_json(&external).unwrap(), Partitioning::External { lookup: "catalog".into() });
        let bad = json!({"PrefixPartitioning": [[3, 1]]});
        assert!(Partitioning::from_json(&bad).is_err());
    }

    #[test]
    fn envelope_round_trips() {
        let src = json!({
            "schema": {"type": "list", "content": "float64"},
            "prefix": "events",
            "extension": "UTF8String",
            "partitioning": {"PrefixPartitioning": [[0, 2, 3]]},
            "name": "run7",
            "metadata": {"year": 2017}
        });
        let dataset = Dataset::from_json(&src).unwrap();
        assert_eq!(dataset.prefix(), "events");
        assert_eq!(dataset.delimiter(), "-");
        assert_eq!(dataset.name(), Some("run7"));
        assert_eq!(dataset.extensions().unwrap().names(), ["UTF8String"]);
        let again = Dataset::from_json_str(&dataset.to_json_string(false).unwrap()).unwrap();
        assert_eq!(again, dataset);
        assert_eq!(dataset.to_json(true).unwrap()["doc"], Value::Null);
    }

    #[test]
    fn partitioning_needs_a_plain_list_root() {
        let mut s = Schema::new();
        let x = s.primitive(DType::Float64);
        s.set_root(x).unwrap();
        let mut dataset = Dataset::new(s);
        let err = dataset.set_partitioning(Some(Partitioning::prefix(vec![0, 1]).unwrap())).unwrap_err();
        assert!(matches!(err, Error::InvalidProperty(_)));

        let mut nullable = list_of_floats();
        let root = nullable.root().unwrap();
        nullable.set_nullable(root, true);
        let mut dataset = Dataset::new(list_of_floats());
        dataset.set_partitioning(Some(Partitioning::prefix(vec![0, 1]).unwrap())).unwrap();
        assert!(dataset.set_schema(nullable).is_err());
    }

    #[test]
    fn partitions_read_their_own_buffers() {
        let mut dataset = Dataset::new(list_of_floats());
        dataset.set_partitioning(Some(Partitioning::suffix(vec![0, 2, 3]).unwrap())).unwrap();
        let source = MemorySource::new()
            .with("object-B-part0", Buffer::Int64(vec![0]))
            .with("object-E-part0", Buffer::Int64(vec![2]))
            .with("object-L-Df8-part0", Buffer::Float64(vec![1.0, 2.0]))
            .with("object-B-part1", Buffer::Int64(vec![0]))
            .with("object-E-part1", Buffer::Int64(vec![1]))
            .with("object-L-Df8-part1", Buffer::Float64(vec![3.0]));
        let source: Arc<dyn BufferSource> = Arc::new(source);

        let read = |p: usize| {
            dataset
                .partition(p, source.clone())
                .unwrap()
                .read(|root| root.as_list()?.iter().map(|x| x?.as_f64()).collect::<Result<Vec<_>>>())
                .unwrap()
        };
        assert_eq!(read(0), [1.0, 2.0]);
        assert_eq!(read(1), [3.0]);
        assert!(dataset.partition(2, source.clone()).is_err());
    }
}
