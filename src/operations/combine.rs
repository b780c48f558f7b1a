//! Combining results computed elsewhere.
//!
//! The core never schedules work. Callers who split a `map` or `reduce`
//! across partitions hand the pending results to a combiner, which joins
//! them in submission order. `Deferred` is a ready-made pending result
//! backed by the rayon pool.

use std::ops::Add;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::operations::action::Table;

/// A result that may not be available yet.
pub trait Pending<T> {
    /// Blocks until the result is available or `timeout` elapses.
    fn result(&mut self, timeout: Option<Duration>) -> Result<T>;

    fn done(&self) -> bool;
}

/// What is left of `timeout` after `elapsed`, never quite zero.
fn remaining(timeout: Option<Duration>, elapsed: Duration) -> Option<Duration> {
    timeout.map(|t| t.saturating_sub(elapsed).max(Duration::from_micros(1)))
}

// ————————————————————————————————————————————————————————————————————————————
// COMBINERS
// ————————————————————————————————————————————————————————————————————————————

/// Concatenates `map` tables in submission order.
pub struct MapCombiner<P> {
    pending: Vec<P>,
    result: Option<Table>,
}

impl<P: Pending<Table>> MapCombiner<P> {
    pub fn new(pending: Vec<P>) -> Self {
        MapCombiner { pending, result: None }
    }
}

impl<P: Pending<Table>> Pending<Table> for MapCombiner<P> {
    fn result(&mut self, timeout: Option<Duration>) -> Result<Table> {
        if let Some(done) = &self.result {
            return Ok(done.clone());
        }
        let start = Instant::now();
        let mut parts = Vec::with_capacity(self.pending.len());
        for pending in &mut self.pending {
            parts.push(pending.result(remaining(timeout, start.elapsed()))?);
        }
        let table = Table::concat(parts)?;
        self.result = Some(table.clone());
        Ok(table)
    }

    fn done(&self) -> bool {
        self.result.is_some() || self.pending.iter().all(Pending::done)
    }
}

/// Adds up `reduce` tallies in submission order.
pub struct ReduceCombiner<P, T> {
    pending: Vec<P>,
    result: Option<T>,
}

impl<P, T> ReduceCombiner<P, T>
where
    P: Pending<T>,
    T: Add<Output = T> + Clone,
{
    pub fn new(pending: Vec<P>) -> Self {
        ReduceCombiner { pending, result: None }
    }
}

impl<P, T> Pending<T> for ReduceCombiner<P, T>
where
    P: Pending<T>,
    T: Add<Output = T> + Clone,
{
    fn result(&mut self, timeout: Option<Duration>) -> Result<T> {
        if let Some(done) = &self.result {
            return Ok(done.clone());
        }
        let start = Instant::now();
        let mut tally: Option<T> = None;
        for pending in &mut self.pending {
            let next = pending.result(remaining(timeout, start.elapsed()))?;
            tally = Some(match tally {
                Some(t) => t + next,
                None => next,
            });
        }
        let tally = tally.ok_or_else(|| Error::Cardinality("reduce combiner has no results".into()))?;
        self.result = Some(tally.clone());
        Ok(tally)
    }

    fn done(&self) -> bool {
        self.result.is_some() || self.pending.iter().all(Pending::done)
    }
}

// ————————————————————————————————————————————————————————————————————————————
// DEFERRED
// ————————————————————————————————————————————————————————————————————————————

type Slot<T> = Arc<(Mutex<Option<Result<T>>>, Condvar)>;

/// A closure running on the rayon pool.
pub struct Deferred<T> {
    slot: Slot<T>,
    taken: bool,
}

impl<T: Send + 'static> Deferred<T> {
    pub fn spawn<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let slot: Slot<T> = Arc::new((Mutex::new(None), Condvar::new()));
        let theirs = slot.clone();
        rayon::spawn(move || {
            let out = catch_unwind(AssertUnwindSafe(f))
                .unwrap_or_else(|_| Err(Error::Callback("deferred closure panicked".into())));
            let (lock, ready) = &*theirs;
            if let Ok(mut value) = lock.lock() {
                *value = Some(out);
            }
            ready.notify_all();
        });
        Deferred { slot, taken: false }
    }
}

fn poisoned<E>(_: E) -> Error {
    Error::Callback("deferred result lock poisoned".into())
}

impl<T> Pending<T> for Deferred<T> {
    fn result(&mut self, timeout: Option<Duration>) -> Result<T> {
        if self.taken {
            return Err(Error::Callback("deferred result was already taken".into()));
        }
        let (lock, ready) = &*self.slot;
        let guard = lock.lock().map_err(poisoned)?;
        let mut guard = match timeout {
            None => ready.wait_while(guard, |v| v.is_none()).map_err(poisoned)?,
            Some(t) => ready.wait_timeout_while(guard, t, |v| v.is_none()).map_err(poisoned)?.0,
        };
        match guard.take() {
            Some(out) => {
                self.taken = true;
                out
            }
            None => Err(Error::Timeout),
        }
    }

    /// A poisoned slot counts as done: `result` then fails at once with
    /// `Error::Callback` instead of blocking.
    fn done(&self) -> bool {
        self.taken || self.slot.0.lock().map(|v| v.is_some()).unwrap_or(true)
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use std::thread::sleep;

    use super::*;
    use crate::buffer::Buffer;

    fn table(tag: i64) -> Table {
        Table::new(vec!["x".into()], vec![Buffer::Int64(vec![tag])]).unwrap()
    }

    #[test]
    fn map_combiner_keeps_submission_order() {
        let pending = [30u64, 0, 10]
            .into_iter()
            .enumerate()
            .map(|(i, delay)| {
                Deferred::spawn(move || {
                    sleep(Duration::from_millis(delay));
                    Ok(table(i as i64))
                })
            })
            .collect();
        let mut combiner = MapCombiner::new(pending);
        let all = combiner.result(None).unwrap();
        assert_eq!(all.column("x"), Some(&Buffer::Int64(vec![0, 1, 2])));
        assert!(combiner.done());
        assert_eq!(combiner.result(None).unwrap(), all);
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Seq(Vec<u8>);

    impl Add for Seq {
        type Output = Seq;

        fn add(mut self, other: Seq) -> Seq {
            self.0.extend(other.0);
            self
        }
    }

    #[test]
    fn reduce_combiner_folds_in_order() {
        let pending: Vec<Deferred<Seq>> = [(1u8, 30u64), (2, 0), (3, 10)]
            .into_iter()
            .map(|(tag, delay)| {
                Deferred::spawn(move || {
                    sleep(Duration::from_millis(delay));
                    Ok(Seq(vec![tag]))
                })
            })
            .collect();
        let mut combiner = ReduceCombiner::new(pending);
        assert_eq!(combiner.result(Some(Duration::from_secs(10))).unwrap(), Seq(vec![1, 2, 3]));
    }

    #[test]
    fn errors_and_deadlines_propagate() {
        let mut failing = ReduceCombiner::new(vec![
            Deferred::spawn(|| Ok(1i64)),
            Deferred::spawn(|| Err(Error::Callback("boom".into()))),
        ]);
        assert!(matches!(failing.result(None), Err(Error::Callback(_))));

        let mut slow = Deferred::spawn(|| {
            sleep(Duration::from_millis(500));
            Ok(1i64)
        });
        assert!(matches!(slow.result(Some(Duration::from_millis(5))), Err(Error::Timeout)));
        assert_eq!(slow.result(None).unwrap(), 1);
        assert!(slow.result(None).is_err());
    }

    #[test]
    fn poisoned_slots_are_done_and_fail() {
        let slot: Slot<i64> = Arc::new((Mutex::new(None), Condvar::new()));
        let theirs = slot.clone();
        let joined = std::thread::spawn(move || {
            let _guard = theirs.0.lock().unwrap();
            panic!("holding the slot");
        })
        .join();
        assert!(joined.is_err());

        let mut deferred = Deferred { slot, taken: false };
        assert!(deferred.done());
        assert!(matches!(deferred.result(None), Err(Error::Callback(_))));
    }
}
