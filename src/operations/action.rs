//! Actions: per-element callbacks whose results leave the schema behind.

use tracing::debug;

use crate::buffer::Buffer;
use crate::dtype::{DType, Scalar};
use crate::error::{Error, Result};
use crate::operations::kernel::{FoldKernel, Kernel, Specialized};
use crate::operations::view::View;
use crate::operations::{Data, bounds, chain};
use crate::proxy::Datum;
use crate::schema::{Kind, NodeId};

// ————————————————————————————————————————————————————————————————————————————
// ROWS
// ————————————————————————————————————————————————————————————————————————————

/// A scalar type with a fixed column dtype.
pub trait Column: Copy {
    const DTYPE: DType;

    fn scalar(self) -> Scalar;
}

macro_rules! column {
    ($t:ty, $dtype:ident) => {
        impl Column for $t {
            const DTYPE: DType = DType::$dtype;

            fn scalar(self) -> Scalar {
                Scalar::from(self)
            }
        }
    };
}

column!(bool, Bool);
column!(i32, Int32);
column!(i64, Int64);
column!(u64, UInt64);
column!(f32, Float32);
column!(f64, Float64);

/// One result row of `map`.
pub trait Row {
    /// Column dtypes known from the type alone; `None` means they are taken
    /// from the first row produced.
    fn layout() -> Option<Vec<DType>>;

    fn values(&self) -> Vec<Scalar>;
}

impl<A: Column> Row for A {
    fn layout() -> Option<Vec<DType>> {
        Some(vec![A::DTYPE])
    }

    fn values(&self) -> Vec<Scalar> {
        vec![self.scalar()]
    }
}

macro_rules! tuple_row {
    ($($t:ident . $i:tt),+) => {
        impl<$($t: Column),+> Row for ($($t,)+) {
            fn layout() -> Option<Vec<DType>> {
                Some(vec![$($t::DTYPE),+])
            }

            fn values(&self) -> Vec<Scalar> {
                vec![$(self.$i.scalar()),+]
            }
        }
    };
}

tuple_row!(A.0);
tuple_row!(A.0, B.1);
tuple_row!(A.0, B.1, C.2);
tuple_row!(A.0, B.1, C.2, D.3);

impl Row for Scalar {
    fn layout() -> Option<Vec<DType>> {
        None
    }

    fn values(&self) -> Vec<Scalar> {
        vec![*self]
    }
}

impl Row for Vec<Scalar> {
    fn layout() -> Option<Vec<DType>> {
        None
    }

    fn values(&self) -> Vec<Scalar> {
        self.clone()
    }
}

// ————————————————————————————————————————————————————————————————————————————
// TABLES
// ————————————————————————————————————————————————————————————————————————————

/// Named, equally long columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    names: Vec<String>,
    columns: Vec<Buffer>,
}

impl Table {
    pub fn new(names: Vec<String>, columns: Vec<Buffer>) -> Result<Table> {
        if names.len() != columns.len() {
            return Err(Error::shape(format!("{} names for {} columns", names.len(), columns.len())));
        }
        if let Some(first) = columns.first() {
            if columns.iter().any(|c| c.len() != first.len()) {
                return Err(Error::shape("table columns differ in length"));
            }
        }
        Ok(Table { names, columns })
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.columns.first().map_or(0, Buffer::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn columns(&self) -> &[Buffer] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Buffer> {
        self.names.iter().position(|n| n == name).map(|i| &self.columns[i])
    }

    /// Row-wise concatenation. Tables without columns (nothing was kept)
    /// are skipped.
    pub fn concat(parts: Vec<Table>) -> Result<Table> {
        let parts: Vec<Table> = parts.into_iter().filter(|t| !t.columns.is_empty()).collect();
        let Some(first) = parts.first() else {
            return Ok(Table::default());
        };
        let names = first.names.clone();
        if parts.iter().any(|t| t.names != names) {
            return Err(Error::shape("concatenated tables have different columns"));
        }
        let columns = (0..names.len())
            .map(|c| Buffer::concat(&parts.iter().map(|t| t.columns[c].clone()).collect::<Vec<_>>()))
            .collect::<Result<Vec<_>>>()?;
        Table::new(names, columns)
    }
}

// ————————————————————————————————————————————————————————————————————————————
// ACTIONS
// ————————————————————————————————————————————————————————————————————————————

impl Data {
    /// Calls `f` on every element of the list at `at` and stacks the rows
    /// it returns into a table. Columns are named `names` or `f0, f1, ...`.
    pub fn map<R, F>(&self, at: &str, f: F, names: Option<&[&str]>) -> Result<Table>
    where
        R: Row,
        F: Fn(&Datum<'_>) -> Result<Option<R>>,
    {
        self.map_with(at, &Specialized::new(move |d: &Datum<'_>, _: &()| f(d), ()), names)
    }

    pub fn map_with<R, K>(&self, at: &str, kernel: &K, names: Option<&[&str]>) -> Result<Table>
    where
        R: Row,
        K: Kernel<Option<R>> + ?Sized,
    {
        debug!("map {:?}", at);
        self.require_root("map")?;
        let view = self.list_view(at, "map")?;

        let mut dtypes = R::layout();
        let mut rows: Vec<Vec<Scalar>> = Vec::new();
        view.visit_all(|_, datum| {
            if let Some(row) = kernel.call(&datum)? {
                let values = row.values();
                if dtypes.is_none() {
                    dtypes = Some(values.iter().map(|v| v.natural_dtype()).collect());
                }
                rows.push(values);
            }
            Ok(())
        })?;

        let Some(dtypes) = dtypes else {
            return Ok(Table::default());
        };
        let names: Vec<String> = match names {
            Some(names) => names.iter().map(|n| n.to_string()).collect(),
            None => (0..dtypes.len()).map(|i| format!("f{i}")).collect(),
        };
        if names.len() != dtypes.len() {
            return Err(Error::shape(format!("map: {} names for {} columns", names.len(), dtypes.len())));
        }
        let mut columns: Vec<Buffer> = dtypes.iter().map(|d| Buffer::with_capacity(*d, rows.len())).collect();
        for row in rows {
            if row.len() != columns.len() {
                return Err(Error::shape(format!("map: a row has {} values, expected {}", row.len(), columns.len())));
            }
            for (column, value) in columns.iter_mut().zip(row) {
                column.push(value);
            }
        }
        Table::new(names, columns)
    }

    /// Folds `f` over every element of the list at `at`, starting from
    /// `tally`.
    pub fn reduce<T, F>(&self, at: &str, tally: T, f: F) -> Result<T>
    where
        F: Fn(&Datum<'_>, T) -> Result<T>,
    {
        self.reduce_with(at, tally, &Specialized::new_fold(move |d: &Datum<'_>, t: T, _: &()| f(d, t), ()))
    }

    pub fn reduce_with<T, K>(&self, at: &str, tally: T, kernel: &K) -> Result<T>
    where
        K: FoldKernel<T> + ?Sized,
    {
        debug!("reduce {:?}", at);
        self.require_root("reduce")?;
        let view = self.list_view(at, "reduce")?;
        let mut tally = Some(tally);
        view.visit_all(|_, datum| {
            if let Some(t) = tally.take() {
                tally = Some(kernel.fold(&datum, t)?);
            }
            Ok(())
        })?;
        tally.ok_or_else(|| Error::Callback("reduce: tally lost".into()))
    }

    fn list_view(&self, at: &str, op: &str) -> Result<View> {
        let schema = self.named()?;
        let list: NodeId = chain(&schema, at)?[0];
        if !matches!(schema.node(list).kind(), Kind::List { .. }) {
            return Err(Error::shape(format!("{op}: {at:?} is not a list")));
        }
        if schema.node(list).nullable() {
            return Err(Error::unsupported(format!("{op}: nullable lists")));
        }
        let (starts, stops) = bounds(&self.reader()?, list)?;
        View::new(self, &schema, list, View::covering(&starts, &stops))
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::kernel::{DynCallback, DynFold, Interpreted};
    use crate::operations::tests::events;

    #[test]
    fn map_with_a_static_layout() {
        let row = |m: &Datum<'_>| -> Result<Option<(f64, i32)>> {
            Ok(Some((m.field("pt")?.as_f64()?, m.field("q")?.as_i64()? as i32)))
        };
        let table = events().map("muons", row, Some(&["pt", "q"][..])).unwrap();
        assert_eq!(table.len(), 5);
        assert_eq!(table.column("pt"), Some(&Buffer::Float64(vec![10.0, 20.0, 30.0, 40.0, 50.0])));
        assert_eq!(table.column("q"), Some(&Buffer::Int32(vec![1, -1, 1, -1, -1])));
    }

    #[test]
    fn map_infers_dynamic_rows_and_skips_absent_ones() {
        let dynamic: &DynCallback<Option<Vec<Scalar>>> = &|m, args| {
            let pt = m.field("pt")?.as_f64()?;
            let positive = m.field("q")?.as_i64()? > 0;
            Ok((pt > args[0].as_f64()).then(|| vec![Scalar::from(pt), Scalar::from(positive)]))
        };
        let kernel = Interpreted::new(dynamic, vec![Scalar::from(25.0)]);
        let table = events().map_with("muons", &kernel, None).unwrap();
        assert_eq!(table.names(), ["f0", "f1"]);
        assert_eq!(table.columns(), [Buffer::Float64(vec![30.0, 40.0, 50.0]), Buffer::Bool(vec![true, false, false])]);

        let none = events().map::<Scalar, _>("muons", |_| Ok(None), None).unwrap();
        assert!(none.is_empty() && none.names().is_empty());
    }

    #[test]
    fn reduce_through_both_kernels() {
        let sum = events().reduce("muons", 0.0, |m, t| Ok(t + m.field("pt")?.as_f64()?)).unwrap();
        assert_eq!(sum, 150.0);

        let dynamic: &DynFold<i64> = &|m, t, args| Ok(t + (m.field("q")?.as_i64()? == args[0].as_i64()) as i64);
        let negatives = events().reduce_with("muons", 0, &Interpreted::new_fold(dynamic, vec![Scalar::from(-1i64)]));
        assert_eq!(negatives.unwrap(), 3);

        assert!(matches!(events().reduce("x", 0, |_, t| Ok(t)), Err(Error::Shape(_))));
        assert!(matches!(events().at(2).reduce("muons", 0, |_, t| Ok(t)), Err(Error::NotRoot("reduce"))));
    }

    #[test]
    fn tables_concatenate_in_order() {
        let a = Table::new(vec!["x".into()], vec![Buffer::Int64(vec![1])]).unwrap();
        let b = Table::new(vec!["x".into()], vec![Buffer::Int64(vec![2, 3])]).unwrap();
        let all = Table::concat(vec![a, Table::default(), b]).unwrap();
        assert_eq!(all.column("x"), Some(&Buffer::Int64(vec![1, 2, 3])));
        let other = Table::new(vec!["y".into()], vec![Buffer::Int64(vec![])]).unwrap();
        assert!(Table::concat(vec![all, other]).is_err());
    }
}
