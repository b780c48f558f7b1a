//! Per-element callbacks.
//!
//! `filter`, `define`, `map` and `reduce` never call user code directly;
//! they go through `Kernel` (one value per element) or `FoldKernel` (one
//! tally threaded through every element). `Specialized` carries its extra
//! arguments as a typed value and is monomorphized per callback signature.
//! `Interpreted` takes them as a `&[Scalar]` list through a trait object.
//! Both are driven by the same iteration.

use std::fmt;

use crate::dtype::Scalar;
use crate::error::Result;
use crate::proxy::Datum;

pub trait Kernel<O> {
    fn call(&self, datum: &Datum<'_>) -> Result<O>;
}

pub trait FoldKernel<T> {
    fn fold(&self, datum: &Datum<'_>, tally: T) -> Result<T>;
}

// ————————————————————————————————————————————————————————————————————————————
// SPECIALIZED
// ————————————————————————————————————————————————————————————————————————————

pub struct Specialized<F, A> {
    f: F,
    args: A,
}

impl<F, A> Specialized<F, A> {
    pub fn new<O>(f: F, args: A) -> Self
    where
        F: Fn(&Datum<'_>, &A) -> Result<O>,
    {
        Specialized { f, args }
    }

    pub fn new_fold<T>(f: F, args: A) -> Self
    where
        F: Fn(&Datum<'_>, T, &A) -> Result<T>,
    {
        Specialized { f, args }
    }

    pub fn args(&self) -> &A {
        &self.args
    }
}

impl<F, A, O> Kernel<O> for Specialized<F, A>
where
    F: Fn(&Datum<'_>, &A) -> Result<O>,
{
    fn call(&self, datum: &Datum<'_>) -> Result<O> {
        (self.f)(datum, &self.args)
    }
}

impl<F, A, T> FoldKernel<T> for Specialized<F, A>
where
    F: Fn(&Datum<'_>, T, &A) -> Result<T>,
{
    fn fold(&self, datum: &Datum<'_>, tally: T) -> Result<T> {
        (self.f)(datum, tally, &self.args)
    }
}

impl<F, A: fmt::Debug> fmt::Debug for Specialized<F, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Specialized").field("args", &self.args).finish_non_exhaustive()
    }
}

// ————————————————————————————————————————————————————————————————————————————
// INTERPRETED
// ————————————————————————————————————————————————————————————————————————————

pub type DynCallback<'f, O> = dyn Fn(&Datum<'_>, &[Scalar]) -> Result<O> + 'f;
pub type DynFold<'f, T> = dyn Fn(&Datum<'_>, T, &[Scalar]) -> Result<T> + 'f;

pub struct Interpreted<'f, F: ?Sized> {
    f: &'f F,
    args: Vec<Scalar>,
}

impl<'f, O> Interpreted<'f, DynCallback<'f, O>> {
    pub fn new(f: &'f DynCallback<'f, O>, args: Vec<Scalar>) -> Self {
        Interpreted { f, args }
    }
}

impl<'f, T> Interpreted<'f, DynFold<'f, T>> {
    pub fn new_fold(f: &'f DynFold<'f, T>, args: Vec<Scalar>) -> Self {
        Interpreted { f, args }
    }
}

impl<F: ?Sized> Interpreted<'_, F> {
    pub fn args(&self) -> &[Scalar] {
        &self.args
    }
}

impl<'f, O> Kernel<O> for Interpreted<'f, DynCallback<'f, O>> {
    fn call(&self, datum: &Datum<'_>) -> Result<O> {
        (self.f)(datum, &self.args)
    }
}

impl<'f, T> FoldKernel<T> for Interpreted<'f, DynFold<'f, T>> {
    fn fold(&self, datum: &Datum<'_>, tally: T) -> Result<T> {
        (self.f)(datum, tally, &self.args)
    }
}

impl<F: ?Sized> fmt::Debug for Interpreted<'_, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreted").field("args", &self.args).finish_non_exhaustive()
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_kernels_see_the_same_arguments() {
        let typed = Specialized::new(|d: &Datum<'_>, (lo,): &(f64,)| Ok(d.as_f64()? > *lo), (2.0,));
        let dynamic: &DynCallback<bool> = &|d, args| Ok(d.as_f64()? > args[0].as_f64());
        let dynamic = Interpreted::new(dynamic, vec![Scalar::from(2.0)]);

        for (x, want) in [(1.0, false), (2.0, false), (3.5, true)] {
            let d = Datum::Scalar(Scalar::from(x));
            assert_eq!(typed.call(&d).unwrap(), want);
            assert_eq!(dynamic.call(&d).unwrap(), want);
        }
    }

    #[test]
    fn folds_thread_the_tally() {
        let typed = Specialized::new_fold(|d: &Datum<'_>, t: i64, k: &i64| Ok(t + d.as_i64()? * k), 10);
        let dynamic: &DynFold<i64> = &|d, t, args| Ok(t + d.as_i64()? * args[0].as_i64());
        let dynamic = Interpreted::new_fold(dynamic, vec![Scalar::from(10i64)]);

        let items: Vec<Datum<'_>> = (1..=3i64).map(|i| Datum::Scalar(Scalar::from(i))).collect();
        let a = items.iter().try_fold(0, |t, d| typed.fold(d, t)).unwrap();
        let b = items.iter().try_fold(0, |t, d| dynamic.fold(d, t)).unwrap();
        assert_eq!((a, b), (60, 60));
    }
}
