//! Scratch views over one list's elements.

use std::ops::Range;

use crate::buffer::Buffer;
use crate::compiler::{Generator, compile};
use crate::error::{Error, Result};
use crate::operations::Data;
use crate::overlay::Overlay;
use crate::proxy::{Datum, Reader};
use crate::schema::{Kind, NodeId, Schema};

/// The content of the list at `list` seen through a new single-slot list
/// spanning `[lo, hi)`, compiled on its own so elements are read through
/// the ordinary proxies. The original list keeps its own starts and stops,
/// so pointers from the content back to it still read every slot.
pub(crate) struct View {
    generator: Generator,
    source: Overlay,
    lo: usize,
    hi: usize,
}

impl View {
    pub(crate) fn new(data: &Data, schema: &Schema, list: NodeId, window: Range<usize>) -> Result<View> {
        let mut scratch = schema.subtree(list);
        let Kind::List { content, .. } = scratch.node(scratch.root()?).kind() else {
            return Err(Error::shape("views are taken over lists"));
        };
        let content = *content;
        let root = scratch.list(content);
        scratch.set_root(root)?;
        let mut source = data.overlay()?;
        source.put(
            &mut scratch,
            root,
            vec![Buffer::Int64(vec![window.start as i64]), Buffer::Int64(vec![window.end as i64])],
        )?;
        let generator = compile(&scratch, &data.prefix, &data.delimiter, &data.extensions)?;
        Ok(View { generator, source, lo: window.start, hi: window.end })
    }

    /// Window covering every slot: `[min(starts), max(stops))`.
    pub(crate) fn covering(starts: &[i64], stops: &[i64]) -> Range<usize> {
        let lo = starts.iter().copied().min().unwrap_or(0).max(0) as usize;
        let hi = stops.iter().copied().max().unwrap_or(0).max(0) as usize;
        lo..hi.max(lo)
    }

    /// Calls `f` with each element `j` of `indexes`, `j` being an absolute
    /// index into the list content.
    pub(crate) fn visit<I, F>(&self, indexes: I, mut f: F) -> Result<()>
    where
        I: IntoIterator<Item = usize>,
        F: FnMut(usize, Datum<'_>) -> Result<()>,
    {
        let reader = Reader::new(&self.generator, &self.source);
        let root = reader.get(self.generator.root(), 0)?;
        let list = root.as_list()?;
        for j in indexes {
            if j < self.lo || j >= self.hi {
                return Err(Error::OutOfBounds { index: j, len: self.hi });
            }
            f(j, list.get(j - self.lo)?)?;
        }
        Ok(())
    }

    /// Every element in the window, in order.
    pub(crate) fn visit_all<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(usize, Datum<'_>) -> Result<()>,
    {
        self.visit(self.lo..self.hi, f)
    }
}
