//! Edits that derive new buffers and bind them through an `Overlay`.

use tracing::debug;

use crate::buffer::{Buffer, RoleKind};
use crate::compiler::GenId;
use crate::dtype::{DType, Scalar};
use crate::error::{Error, Result};
use crate::operations::kernel::{Kernel, Specialized};
use crate::operations::view::View;
use crate::operations::{Data, bounds, chain, descend};
use crate::proxy::{Datum, MASKED};
use crate::schema::{Kind, NodeId, Schema};

impl Data {
    /// Gives every record inside the list at `at` a pointer field `field`
    /// back to the record holding that list.
    pub fn parent(&self, field: &str, at: &str) -> Result<Data> {
        debug!("parent {:?} at {:?}", field, at);
        let mut schema = self.named()?;
        let nodes = chain(&schema, at)?;
        let (list, record) = list_of_records(&schema, nodes[0], "parent")?;
        let Some(&holder) = nodes.get(1).filter(|p| schema.node(**p).is_record()) else {
            return Err(Error::shape(format!("parent: {at:?} is not a field of a record")));
        };
        check_new_field(&schema, record, field)?;

        let (starts, stops) = bounds(&self.reader()?, list)?;
        let mut pointers = vec![0i64; content_len(&stops)];
        for (i, (start, stop)) in starts.iter().zip(&stops).enumerate() {
            for slot in &mut pointers[*start as usize..*stop as usize] {
                *slot = i as i64;
            }
        }

        let pointer = schema.pointer(Some(holder));
        schema.insert_field(record, field, pointer)?;
        let mut overlay = self.overlay()?;
        overlay.put(&mut schema, pointer, vec![Buffer::Int64(pointers)])?;
        self.finish(schema, overlay)
    }

    /// Adds an integer field `field` holding each record's position within
    /// its own list slot.
    pub fn index(&self, field: &str, at: &str) -> Result<Data> {
        debug!("index {:?} at {:?}", field, at);
        let mut schema = self.named()?;
        let nodes = chain(&schema, at)?;
        let (list, record) = list_of_records(&schema, nodes[0], "index")?;
        check_new_field(&schema, record, field)?;

        let (starts, stops) = bounds(&self.reader()?, list)?;
        let mut positions = vec![0i64; content_len(&stops)];
        for (start, stop) in starts.iter().zip(&stops) {
            for (k, slot) in positions[*start as usize..*stop as usize].iter_mut().enumerate() {
                *slot = k as i64;
            }
        }

        let column = schema.primitive(DType::Int64);
        schema.insert_field(record, field, column)?;
        let mut overlay = self.overlay()?;
        overlay.put(&mut schema, column, vec![Buffer::Int64(positions)])?;
        self.finish(schema, overlay)
    }

    /// Makes the primitive at `at` nullable and masks every element equal
    /// to `low` (NaN matches NaN), or within `[low, high]` when `high` is
    /// given.
    pub fn tomask(&self, at: &str, low: f64, high: Option<f64>) -> Result<Data> {
        debug!("tomask {:?} low={} high={:?}", at, low, high);
        if let Some(high) = high {
            if low.is_nan() || high.is_nan() {
                return Err(Error::NumericPrecondition("tomask: a range bound is NaN".into()));
            }
        }
        let selected = |x: Scalar| match high {
            None if low.is_nan() => x.is_nan(),
            None => x.as_f64() == low,
            Some(high) => low <= x.as_f64() && x.as_f64() <= high,
        };

        let mut schema = self.named()?;
        let mut nodes = chain(&schema, at)?;
        descend(&schema, &mut nodes)?;
        let id = nodes[0];
        match schema.node(id).kind() {
            Kind::Primitive { dims, .. } if dims.is_empty() => {}
            Kind::Primitive { .. } => return Err(Error::unsupported("tomask: primitives with dims")),
            other => return Err(Error::shape(format!("tomask: {at:?} is a {}, not a primitive", other.name()))),
        }

        let reader = self.reader()?;
        let gid = GenId(id.index());
        let data = reader.buffer(gid, RoleKind::Data)?;
        let mut mask: Vec<i32> = if schema.node(id).nullable() {
            reader.buffer(gid, RoleKind::Mask)?.to_indexes()?.into_iter().map(|m| m as i32).collect()
        } else {
            (0..mask_index(data.len())?).collect()
        };
        for entry in mask.iter_mut().filter(|m| **m >= 0) {
            if selected(data.scalar(*entry as usize)?) {
                *entry = MASKED;
            }
        }

        schema.set_nullable(id, true);
        let mut overlay = self.overlay()?;
        overlay.put(&mut schema, id, vec![(*data).clone(), Buffer::Int32(mask)])?;
        self.finish(schema, overlay)
    }

    /// Collapses `List(List(X))` at `at` into `List(X)`. The inner lists
    /// must be stored back to back.
    pub fn flatten(&self, at: &str) -> Result<Data> {
        debug!("flatten {:?}", at);
        self.require_root("flatten")?;
        let mut schema = self.named()?;
        let outer = chain(&schema, at)?[0];
        let Kind::List { content: inner, .. } = schema.node(outer).kind() else {
            return Err(Error::shape(format!("flatten: {at:?} is not a list")));
        };
        let inner = *inner;
        let Kind::List { content, .. } = schema.node(inner).kind() else {
            return Err(Error::shape(format!("flatten: {at:?} is not a list of lists")));
        };
        let content = *content;
        if schema.node(outer).nullable() || schema.node(inner).nullable() {
            return Err(Error::unsupported("flatten: nullable lists"));
        }

        let reader = self.reader()?;
        let (outer_starts, outer_stops) = bounds(&reader, outer)?;
        let (inner_starts, inner_stops) = bounds(&reader, inner)?;
        if inner_starts.iter().skip(1).zip(&inner_stops).any(|(next, stop)| next != stop) {
            return Err(Error::unsupported("flatten: inner lists are not contiguous"));
        }
        // Offset into the inner content where inner slot `k` begins.
        let boundary = |k: i64| -> i64 {
            match inner_starts.get(k as usize) {
                Some(start) => *start,
                None => inner_stops.last().copied().unwrap_or(0),
            }
        };
        let starts: Vec<i64> = outer_starts.iter().map(|k| boundary(*k)).collect();
        let stops: Vec<i64> = outer_stops.iter().map(|k| boundary(*k)).collect();

        schema.set_content(outer, content)?;
        let mut overlay = self.overlay()?;
        overlay.put(&mut schema, outer, vec![Buffer::Int64(starts), Buffer::Int64(stops)])?;
        self.finish(schema, overlay)
    }

    /// Keeps the elements of the list at `at` for which `predicate` holds.
    pub fn filter<F>(&self, at: &str, predicate: F) -> Result<Data>
    where
        F: Fn(&Datum<'_>) -> Result<bool>,
    {
        self.filter_with(at, &Specialized::new(move |d: &Datum<'_>, _: &()| predicate(d), ()))
    }

    /// `filter` through an explicit kernel. The list becomes a list of
    /// pointers to the surviving elements; filtering such a list again
    /// composes the indirections instead of nesting pointers.
    pub fn filter_with<K>(&self, at: &str, predicate: &K) -> Result<Data>
    where
        K: Kernel<bool> + ?Sized,
    {
        debug!("filter {:?}", at);
        self.require_root("filter")?;
        let mut schema = self.named()?;
        let list = chain(&schema, at)?[0];
        let Kind::List { content, .. } = schema.node(list).kind() else {
            return Err(Error::shape(format!("filter: {at:?} is not a list")));
        };
        let content = *content;
        if schema.node(list).nullable() {
            return Err(Error::unsupported("filter: nullable lists"));
        }

        let reader = self.reader()?;
        let (starts, stops) = bounds(&reader, list)?;
        let view = View::new(self, &schema, list, View::covering(&starts, &stops))?;
        let mut pointers: Vec<i64> = Vec::new();
        let mut offsets: Vec<i64> = Vec::with_capacity(starts.len() + 1);
        offsets.push(0);
        for (start, stop) in starts.iter().zip(&stops) {
            view.visit(*start as usize..*stop as usize, |j, datum| {
                if predicate.call(&datum)? {
                    pointers.push(j as i64);
                }
                Ok(())
            })?;
            offsets.push(pointers.len() as i64);
        }

        let target = match schema.node(content).kind() {
            Kind::Pointer { target, .. } => {
                if schema.node(content).nullable() {
                    return Err(Error::unsupported("filter: lists of nullable pointers"));
                }
                let inner = reader.buffer(GenId(content.index()), RoleKind::Positions)?;
                pointers = pointers.iter().map(|p| inner.index(*p as usize)).collect::<Result<_>>()?;
                *target
            }
            _ => Some(content),
        };

        let pointer = schema.pointer(target);
        schema.set_content(list, pointer)?;
        let n = starts.len();
        let mut overlay = self.overlay()?;
        overlay.put(
            &mut schema,
            list,
            vec![Buffer::Int64(offsets[..n].to_vec()), Buffer::Int64(offsets[1..].to_vec())],
        )?;
        overlay.put(&mut schema, pointer, vec![Buffer::Int64(pointers)])?;
        self.finish(schema, overlay)
    }

    /// Adds a field `field` of type `fieldtype` to the records inside the
    /// list at `at`, computed by `f` from each record. `None` is only
    /// allowed when `fieldtype` is nullable.
    pub fn define<F>(&self, at: &str, field: &str, f: F, fieldtype: &Schema) -> Result<Data>
    where
        F: Fn(&Datum<'_>) -> Result<Option<Scalar>>,
    {
        self.define_with(at, field, &Specialized::new(move |d: &Datum<'_>, _: &()| f(d), ()), fieldtype)
    }

    pub fn define_with<K>(&self, at: &str, field: &str, kernel: &K, fieldtype: &Schema) -> Result<Data>
    where
        K: Kernel<Option<Scalar>> + ?Sized,
    {
        debug!("define {:?} at {:?}", field, at);
        self.require_root("define")?;
        let mut schema = self.named()?;
        let mut nodes = chain(&schema, at)?;
        descend(&schema, &mut nodes)?;
        let (Some(&record), Some(&list)) = (nodes.first(), nodes.get(1)) else {
            return Err(Error::shape(format!("define: {at:?} is not a list of records")));
        };
        if !schema.node(record).is_record() || !schema.node(list).is_list() {
            return Err(Error::shape(format!("define: {at:?} is not a list of records")));
        }
        if schema.node(record).nullable() || schema.node(list).nullable() {
            return Err(Error::unsupported("define: nullable lists or records"));
        }
        check_new_field(&schema, record, field)?;
        let typeroot = fieldtype.root()?;
        let (dtype, nullable) = match fieldtype.node(typeroot).kind() {
            Kind::Primitive { dtype, dims, .. } if dims.is_empty() => (*dtype, fieldtype.node(typeroot).nullable()),
            _ => return Err(Error::unsupported("define: only scalar primitive field types")),
        };

        let (starts, stops) = bounds(&self.reader()?, list)?;
        if starts.iter().skip(1).zip(&stops).any(|(next, stop)| next != stop) {
            return Err(Error::unsupported("define: the list is not contiguous"));
        }
        let lo = starts.first().copied().unwrap_or(0).max(0) as usize;
        let hi = (stops.last().copied().unwrap_or(0).max(0) as usize).max(lo);
        let view = View::new(self, &schema, list, lo..hi)?;

        // Slots below `lo` are never read; they keep record index k at buffer slot k.
        let mut data = Buffer::zeros(dtype, if nullable { 0 } else { lo });
        let mut mask: Vec<i32> = vec![MASKED; lo];
        view.visit_all(|_, datum| {
            match (kernel.call(&datum)?, nullable) {
                (Some(value), true) => {
                    mask.push(mask_index(data.len())?);
                    data.push(value);
                }
                (Some(value), false) => data.push(value),
                (None, true) => mask.push(MASKED),
                (None, false) => {
                    return Err(Error::Callback(format!("define: no value for non-nullable field {field:?}")));
                }
            }
            Ok(())
        })?;

        let column = schema.graft(fieldtype, typeroot);
        schema.insert_field(record, field, column)?;
        let buffers = if nullable { vec![data, Buffer::Int32(mask)] } else { vec![data] };
        let mut overlay = self.overlay()?;
        overlay.put(&mut schema, column, buffers)?;
        self.finish(schema, overlay)
    }
}

/// The list at `id` and the record it holds.
fn list_of_records(schema: &Schema, id: NodeId, op: &str) -> Result<(NodeId, NodeId)> {
    let Kind::List { content, .. } = schema.node(id).kind() else {
        return Err(Error::shape(format!("{op}: expected a list")));
    };
    if !schema.node(*content).is_record() {
        return Err(Error::shape(format!("{op}: expected a list of records")));
    }
    if schema.node(id).nullable() || schema.node(*content).nullable() {
        return Err(Error::unsupported(format!("{op}: nullable lists or records")));
    }
    Ok((id, *content))
}

fn check_new_field(schema: &Schema, record: NodeId, field: &str) -> Result<()> {
    match schema.field(record, field) {
        Some(_) => Err(Error::shape(format!("record already has a field {field:?}"))),
        None => Ok(()),
    }
}

/// `n` as a mask entry. Masks are int32, so longer data cannot be masked.
fn mask_index(n: usize) -> Result<i32> {
    i32::try_from(n).map_err(|_| Error::unsupported(format!("{n} elements do not fit an int32 mask")))
}

/// Length of list content covering every slot.
fn content_len(stops: &[i64]) -> usize {
    stops.iter().copied().max().unwrap_or(0).max(0) as usize
}

// ------------------------------- Tests ------------------------------------ //
