//! Flat typed buffers and the name → buffer source contract.

use std::collections::BTreeSet;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::dtype::{DType, Scalar};
use crate::error::{Error, Result};
use crate::overlay::Overlay;

// ————————————————————————————————————————————————————————————————————————————
// BUFFERS
// ————————————————————————————————————————————————————————————————————————————

/// Contiguous storage of one primitive type.
#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    Bool(Vec<bool>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

macro_rules! each_buffer {
    ($buf:expr, $v:ident => $body:expr) => {
        match $buf {
            Buffer::Bool($v) => $body,
            Buffer::Int8($v) => $body,
            Buffer::Int16($v) => $body,
            Buffer::Int32($v) => $body,
            Buffer::Int64($v) => $body,
            Buffer::UInt8($v) => $body,
            Buffer::UInt16($v) => $body,
            Buffer::UInt32($v) => $body,
            Buffer::UInt64($v) => $body,
            Buffer::Float32($v) => $body,
            Buffer::Float64($v) => $body,
        }
    };
}

impl Buffer {
    pub fn empty(dtype: DType) -> Self {
        Self::with_capacity(dtype, 0)
    }

    pub fn with_capacity(dtype: DType, n: usize) -> Self {
        match dtype {
            DType::Bool => Buffer::Bool(Vec::with_capacity(n)),
            DType::Int8 => Buffer::Int8(Vec::with_capacity(n)),
            DType::Int16 => Buffer::Int16(Vec::with_capacity(n)),
            DType::Int32 => Buffer::Int32(Vec::with_capacity(n)),
            DType::Int64 => Buffer::Int64(Vec::with_capacity(n)),
            DType::UInt8 => Buffer::UInt8(Vec::with_capacity(n)),
            DType::UInt16 => Buffer::UInt16(Vec::with_capacity(n)),
            DType::UInt32 => Buffer::UInt32(Vec::with_capacity(n)),
            DType::UInt64 => Buffer::UInt64(Vec::with_capacity(n)),
            DType::Float32 => Buffer::Float32(Vec::with_capacity(n)),
            DType::Float64 => Buffer::Float64(Vec::with_capacity(n)),
        }
    }

    /// `n` zero (or `false`) elements.
    pub fn zeros(dtype: DType, n: usize) -> Self {
        let mut out = Self::with_capacity(dtype, n);
        for _ in 0..n {
            out.push(Scalar::Int(0));
        }
        out
    }

    pub fn dtype(&self) -> DType {
        match self {
            Buffer::Bool(_) => DType::Bool,
            Buffer::Int8(_) => DType::Int8,
            Buffer::Int16(_) => DType::Int16,
            Buffer::Int32(_) => DType::Int32,
            Buffer::Int64(_) => DType::Int64,
            Buffer::UInt8(_) => DType::UInt8,
            Buffer::UInt16(_) => DType::UInt16,
            Buffer::UInt32(_) => DType::UInt32,
            Buffer::UInt64(_) => DType::UInt64,
            Buffer::Float32(_) => DType::Float32,
            Buffer::Float64(_) => DType::Float64,
        }
    }

    pub fn len(&self) -> usize {
        each_buffer!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn scalar(&self, i: usize) -> Result<Scalar> {
        let len = self.len();
        let oob = || Error::OutOfBounds { index: i, len };
        Ok(match self {
            Buffer::Bool(v) => Scalar::Bool(*v.get(i).ok_or_else(oob)?),
            Buffer::Int8(v) => Scalar::Int(*v.get(i).ok_or_else(oob)? as i64),
            Buffer::Int16(v) => Scalar::Int(*v.get(i).ok_or_else(oob)? as i64),
            Buffer::Int32(v) => Scalar::Int(*v.get(i).ok_or_else(oob)? as i64),
            Buffer::Int64(v) => Scalar::Int(*v.get(i).ok_or_else(oob)?),
            Buffer::UInt8(v) => Scalar::UInt(*v.get(i).ok_or_else(oob)? as u64),
            Buffer::UInt16(v) => Scalar::UInt(*v.get(i).ok_or_else(oob)? as u64),
            Buffer::UInt32(v) => Scalar::UInt(*v.get(i).ok_or_else(oob)? as u64),
            Buffer::UInt64(v) => Scalar::UInt(*v.get(i).ok_or_else(oob)?),
            Buffer::Float32(v) => Scalar::float(*v.get(i).ok_or_else(oob)? as f64),
            Buffer::Float64(v) => Scalar::float(*v.get(i).ok_or_else(oob)?),
        })
    }

    /// Element `i` read as an index or offset.
    pub fn index(&self, i: usize) -> Result<i64> {
        if self.dtype().is_float() {
            return Err(Error::shape(format!("{} buffer cannot hold indexes", self.dtype())));
        }
        Ok(self.scalar(i)?.as_i64())
    }

    pub fn to_indexes(&self) -> Result<Vec<i64>> {
        (0..self.len()).map(|i| self.index(i)).collect()
    }

    /// Appends `s`, casting it to this buffer's dtype.
    pub fn push(&mut self, s: Scalar) {
        match self {
            Buffer::Bool(v) => v.push(s.as_bool()),
            Buffer::Int8(v) => v.push(s.as_i64() as i8),
            Buffer::Int16(v) => v.push(s.as_i64() as i16),
            Buffer::Int32(v) => v.push(s.as_i64() as i32),
            Buffer::Int64(v) => v.push(s.as_i64()),
            Buffer::UInt8(v) => v.push(s.as_i64() as u8),
            Buffer::UInt16(v) => v.push(s.as_i64() as u16),
            Buffer::UInt32(v) => v.push(s.as_i64() as u32),
            Buffer::UInt64(v) => v.push(match s {
                Scalar::UInt(u) => u,
                other => other.as_i64() as u64,
            }),
            Buffer::Float32(v) => v.push(s.as_f64() as f32),
            Buffer::Float64(v) => v.push(s.as_f64()),
        }
    }

    pub fn truncate(&mut self, n: usize) {
        each_buffer!(self, v => v.truncate(n))
    }

    /// Gathers `self[indexes[i]]` into a new buffer of the same dtype.
    pub fn take(&self, indexes: &[i64]) -> Result<Buffer> {
        let len = self.len();
        let mut out = Buffer::with_capacity(self.dtype(), indexes.len());
        for &i in indexes {
            if i < 0 || i as usize >= len {
                return Err(Error::OutOfBounds { index: i.max(0) as usize, len });
            }
            out.push(self.scalar(i as usize)?);
        }
        Ok(out)
    }

    /// Joins buffers of one dtype end to end.
    pub fn concat(parts: &[Buffer]) -> Result<Buffer> {
        let Some(first) = parts.first() else {
            return Err(Error::Cardinality("nothing to concatenate".into()));
        };
        let dtype = first.dtype();
        let total = parts.iter().map(Buffer::len).sum();
        let mut out = Buffer::with_capacity(dtype, total);
        for part in parts {
            if part.dtype() != dtype {
                return Err(Error::shape(format!(
                    "cannot concatenate {} with {}",
                    dtype,
                    part.dtype()
                )));
            }
            for i in 0..part.len() {
                out.push(part.scalar(i)?);
            }
        }
        Ok(out)
    }
}

// ————————————————————————————————————————————————————————————————————————————
// ROLES
// ————————————————————————————————————————————————————————————————————————————

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoleKind {
    Data,
    Mask,
    Starts,
    Stops,
    Tags,
    Offsets,
    Positions,
}

/// A buffer slot some schema node needs, qualified by its namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Role {
    pub name: String,
    pub namespace: String,
    pub kind: RoleKind,
}

impl Role {
    pub fn new(kind: RoleKind, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Role { name: name.into(), namespace: namespace.into(), kind }
    }
}

// ————————————————————————————————————————————————————————————————————————————
// SOURCES
// ————————————————————————————————————————————————————————————————————————————

/// Read side of a columnar dataset.
pub trait BufferSource {
    fn get(&self, name: &str) -> Result<Arc<Buffer>>;

    /// Namespace-qualified lookup. Plain sources have a single, unnamed
    /// namespace and ignore it.
    fn get_in(&self, namespace: &str, name: &str) -> Result<Arc<Buffer>> {
        let _ = namespace;
        self.get(name)
    }

    fn get_all(&self, roles: &[Role]) -> Result<IndexMap<Role, Arc<Buffer>>> {
        roles
            .iter()
            .map(|r| Ok((r.clone(), self.get_in(&r.namespace, &r.name)?)))
            .collect()
    }

    /// Namespaces already in use, so layered sources can avoid them.
    fn namespaces(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn as_overlay(&self) -> Option<&Overlay> {
        None
    }

    fn close(&self) {}
}

/// Write side, for sources that accept new buffers.
pub trait BufferSink {
    fn put(&mut self, name: &str, buffer: Arc<Buffer>) -> Result<()>;

    fn put_all(&mut self, buffers: IndexMap<String, Arc<Buffer>>) -> Result<()> {
        for (name, buffer) in buffers {
            self.put(&name, buffer)?;
        }
        Ok(())
    }
}

/// In-memory source; also the private store inside every `Overlay`.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    buffers: IndexMap<String, Arc<Buffer>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, buffer: Buffer) -> &mut Self {
        self.buffers.insert(name.into(), Arc::new(buffer));
        self
    }

    pub fn with(mut self, name: impl Into<String>, buffer: Buffer) -> Self {
        self.insert(name, buffer);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.buffers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<Buffer>)> {
        self.buffers.iter()
    }
}

impl BufferSource for MemorySource {
    fn get(&self, name: &str) -> Result<Arc<Buffer>> {
        self.buffers.get(name).cloned().ok_or_else(|| Error::MissingBuffer {
            name: name.to_string(),
            namespace: String::new(),
        })
    }
}

impl BufferSink for MemorySource {
    fn put(&mut self, name: &str, buffer: Arc<Buffer>) -> Result<()> {
        self.buffers.insert(name.to_string(), buffer);
        Ok(())
    }
}

impl FromIterator<(String, Buffer)> for MemorySource {
    fn from_iter<I: IntoIterator<Item = (String, Buffer)>>(iter: I) -> Self {
        MemorySource {
            buffers: iter.into_iter().map(|(n, b)| (n, Arc::new(b))).collect(),
        }
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_casts_to_the_buffer_dtype() {
        let mut b = Buffer::empty(DType::Int32);
        b.push(Scalar::float(2.7));
        b.push(Scalar::Bool(true));
        assert_eq!(b, Buffer::Int32(vec![2, 1]));
    }

    #[test]
    fn take_gathers_and_checks_bounds() {
        let b = Buffer::Float64(vec![1.5, 2.5, 3.5]);
        assert_eq!(b.take(&[2, 0]).unwrap(), Buffer::Float64(vec![3.5, 1.5]));
        assert!(matches!(b.take(&[3]), Err(Error::OutOfBounds { len: 3, .. })));
    }

    #[test]
    fn concat_rejects_mixed_dtypes() {
        let a = Buffer::Int64(vec![1]);
        let b = Buffer::Int64(vec![2, 3]);
        assert_eq!(Buffer::concat(&[a.clone(), b]).unwrap(), Buffer::Int64(vec![1, 2, 3]));
        assert!(Buffer::concat(&[a, Buffer::Float64(vec![1.0])]).is_err());
    }

    #[test]
    fn memory_source_reports_missing_names() {
        let src = MemorySource::new().with("x", Buffer::UInt8(vec![1]));
        assert!(src.get("x").is_ok());
        assert!(matches!(src.get("y"), Err(Error::MissingBuffer { .. })));
    }
}
