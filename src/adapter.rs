//! Contract for external column readers.
//!
//! Concrete file formats live outside the core. A reader hands back one
//! column of one row group at a time; this module fixes the shape of that
//! result, assembles it from decoded pages, and rejects what the core does
//! not understand.

use tracing::debug;

use crate::buffer::Buffer;
use crate::error::{Error, Result};

pub const MAGIC: &[u8; 4] = b"PAR1";

/// Rejects files whose leading or trailing four bytes are not the magic
/// number.
pub fn check_magic(header: &[u8], footer: &[u8]) -> Result<()> {
    if header != MAGIC {
        return Err(Error::malformed(format!("not a columnar file: header magic is {header:?}")));
    }
    if footer != MAGIC {
        return Err(Error::malformed(format!("not a columnar file: footer magic is {footer:?}")));
    }
    Ok(())
}

/// Compression of a column's pages, by its on-disk code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Uncompressed,
    Snappy,
    Gzip,
    Lzo,
    Brotli,
    Lz4,
    Zstd,
}

impl Codec {
    pub fn from_code(code: i32) -> Result<Self> {
        Ok(match code {
            0 => Codec::Uncompressed,
            1 => Codec::Snappy,
            2 => Codec::Gzip,
            3 => Codec::Lzo,
            4 => Codec::Brotli,
            5 => Codec::Lz4,
            6 => Codec::Zstd,
            other => return Err(Error::malformed(format!("unrecognized codec {other}"))),
        })
    }

    /// Only uncompressed pages are read in-process; readers decompress the
    /// rest before handing pages over.
    pub fn decompress(self, page: Vec<u8>, uncompressed_size: usize) -> Result<Vec<u8>> {
        match self {
            Codec::Uncompressed if page.len() == uncompressed_size => Ok(page),
            Codec::Uncompressed => Err(Error::malformed(format!(
                "uncompressed page holds {} bytes, header says {}",
                page.len(),
                uncompressed_size
            ))),
            other => Err(Error::unsupported(format!("{other:?} decompression"))),
        }
    }
}

/// Value encodings the core can take decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Plain,
    PlainDictionary,
    Rle,
    BitPacked,
    DeltaBinaryPacked,
    DeltaLengthByteArray,
    DeltaByteArray,
    RleDictionary,
}

impl Encoding {
    pub fn from_code(code: i32) -> Result<Self> {
        Ok(match code {
            0 => Encoding::Plain,
            2 => Encoding::PlainDictionary,
            3 => Encoding::Rle,
            4 => Encoding::BitPacked,
            5 => Encoding::DeltaBinaryPacked,
            6 => Encoding::DeltaLengthByteArray,
            7 => Encoding::DeltaByteArray,
            8 => Encoding::RleDictionary,
            other => return Err(Error::malformed(format!("unrecognized encoding {other}"))),
        })
    }

    pub fn check_supported(self) -> Result<()> {
        match self {
            Encoding::Plain | Encoding::PlainDictionary | Encoding::Rle | Encoding::RleDictionary => Ok(()),
            other => Err(Error::unsupported(format!("{other:?} encoding"))),
        }
    }
}

/// One decoded page, in file order.
#[derive(Debug, Clone, PartialEq)]
pub enum Page {
    Data {
        definition_levels: Option<Vec<i32>>,
        repetition_levels: Option<Vec<i32>>,
        values: Option<Buffer>,
    },
    Dictionary(Buffer),
    Index,
    DataV2,
}

/// A whole column of one row group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnChunk {
    pub dictionary: Option<Buffer>,
    pub definition_levels: Option<Vec<i32>>,
    pub repetition_levels: Option<Vec<i32>>,
    pub values: Option<Buffer>,
}

impl ColumnChunk {
    /// Joins a column's pages. Data pages concatenate; the last dictionary
    /// page wins.
    pub fn from_pages(pages: impl IntoIterator<Item = Page>) -> Result<Self> {
        let mut dictionary = None;
        let mut definition = Vec::new();
        let mut repetition = Vec::new();
        let mut values = Vec::new();
        for page in pages {
            match page {
                Page::Data { definition_levels, repetition_levels, values: v } => {
                    definition.extend(definition_levels);
                    repetition.extend(repetition_levels);
                    values.extend(v);
                }
                Page::Dictionary(d) => dictionary = Some(d),
                Page::Index => return Err(Error::unsupported("index pages")),
                Page::DataV2 => return Err(Error::unsupported("version 2 data pages")),
            }
        }
        let join = |segments: Vec<Vec<i32>>| (!segments.is_empty()).then(|| segments.concat());
        Ok(ColumnChunk {
            dictionary,
            definition_levels: join(definition),
            repetition_levels: join(repetition),
            values: if values.is_empty() { None } else { Some(Buffer::concat(&values)?) },
        })
    }

    /// Values with any dictionary applied.
    pub fn decoded(&self) -> Result<Option<Buffer>> {
        match (&self.dictionary, &self.values) {
            (_, None) => Ok(None),
            (None, Some(values)) => Ok(Some(values.clone())),
            (Some(dictionary), Some(indexes)) => Ok(Some(dictionary.take(&indexes.to_indexes()?)?)),
        }
    }
}

/// Reads columns out of row groups of some external file.
pub trait ColumnReader {
    fn num_row_groups(&self) -> usize;

    /// The column at `path` (field names from the root) in `row_group`.
    fn column(&self, row_group: usize, path: &[&str]) -> Result<ColumnChunk>;

    /// The column across every row group, end to end.
    fn column_all(&self, path: &[&str]) -> Result<Vec<ColumnChunk>> {
        debug!("reading column {:?} from {} row groups", path, self.num_row_groups());
        (0..self.num_row_groups()).map(|g| self.column(g, path)).collect()
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn magic_numbers() {
        assert!(check_magic(b"PAR1", b"PAR1").is_ok());
        assert!(matches!(check_magic(b"PAR1", b"PAR0"), Err(Error::Malformed(_))));
        assert!(matches!(check_magic(b"\x89PNG", b"PAR1"), Err(Error::Malformed(_))));
    }

    #[test]
    fn codecs_and_encodings() {
        assert_eq!(Codec::from_code(0).unwrap().decompress(vec![1, 2], 2).unwrap(), [1, 2]);
        assert!(matches!(Codec::from_code(1).unwrap().decompress(vec![1], 4), Err(Error::Unsupported(_))));
        assert!(matches!(Codec::from_code(9), Err(Error::Malformed(_))));
        assert!(Encoding::from_code(2).unwrap().check_supported().is_ok());
        assert!(matches!(Encoding::from_code(5).unwrap().check_supported(), Err(Error::Unsupported(_))));
    }

    #[test]
    fn pages_assemble_into_a_chunk() {
        let chunk = ColumnChunk::from_pages([
            Page::Dictionary(Buffer::Float64(vec![0.5, 1.5])),
            Page::Data { definition_levels: Some(vec![1, 0]), repetition_levels: None, values: Some(Buffer::Int32(vec![1])) },
            Page::Data { definition_levels: Some(vec![1]), repetition_levels: None, values: Some(Buffer::Int32(vec![0])) },
        ])
        .unwrap();
        assert_eq!(chunk.definition_levels, Some(vec![1, 0, 1]));
        assert_eq!(chunk.repetition_levels, None);
        assert_eq!(chunk.decoded().unwrap(), Some(Buffer::Float64(vec![1.5, 0.5])));
        assert!(ColumnChunk::from_pages([Page::DataV2]).is_err());
    }

    struct Groups(Vec<HashMap<String, ColumnChunk>>);

    impl ColumnReader for Groups {
        fn num_row_groups(&self) -> usize {
            self.0.len()
        }

        fn column(&self, row_group: usize, path: &[&str]) -> Result<ColumnChunk> {
            let group = self.0.get(row_group).ok_or(Error::OutOfBounds { index: row_group, len: self.0.len() })?;
            group
                .get(&path.join("."))
                .cloned()
                .ok_or_else(|| Error::malformed(format!("column {path:?} not found")))
        }
    }

    #[test]
    fn readers_walk_every_row_group() {
        let chunk = |xs: Vec<i64>| ColumnChunk { values: Some(Buffer::Int64(xs)), ..Default::default() };
        let reader = Groups(vec![
            [("a.b".to_string(), chunk(vec![1, 2]))].into_iter().collect(),
            [("a.b".to_string(), chunk(vec![3]))].into_iter().collect(),
        ]);
        let all = reader.column_all(&["a", "b"]).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].values, Some(Buffer::Int64(vec![3])));
        assert!(reader.column(0, &["c"]).is_err());
    }
}
