//! Object views over columnar data.
//!
//! A `Schema` says how flat buffers compose into lists, records, tuples,
//! unions and pointers. The compiler turns it into a `Generator` that reads
//! values lazily from a `BufferSource`; operations on `Data` derive new
//! schemas and layer new buffers over the old ones without copying them.

pub mod adapter;
pub mod buffer;
pub mod compiler;
pub mod dataset;
pub mod dtype;
pub mod error;
pub mod operations;
pub mod overlay;
pub mod path_de;
pub mod proxy;
pub mod schema;

pub use buffer::{Buffer, BufferSink, BufferSource, MemorySource, Role, RoleKind};
pub use compiler::{ExtensionSet, Generator, compile};
pub use dataset::{ArrayId, Dataset, PartitionEntry, Partitioning};
pub use dtype::{DType, Scalar};
pub use error::{Error, Result};
pub use operations::{Data, Deferred, MapCombiner, Pending, ReduceCombiner, Table};
pub use overlay::Overlay;
pub use proxy::{Datum, Reader};
pub use schema::{Kind, Node, NodeId, Packing, Schema};
