//! Parallel patterns built on the task runtime.
//!
//! Loop-shaped patterns ([`Handle::pfor_each`], [`Handle::preduce`],
//! [`Handle::pscan`], [`Handle::ptransform`]) run on an adaptive
//! work-stealing tree: the calling thread and one helper task per extra
//! worker start on pre-split leaves, and idle participants split the busiest
//! remaining ranges. [`Handle::pdivide_and_conquer`] maps every subproblem
//! to a task. All of them are tuned with a [`Tuner`].
//!
//! The blocking forms borrow their closures and data and return once every
//! participant is done. The `spawn_*` forms own their inputs and return the
//! task that runs the pattern.

mod dac;
mod driver;
mod for_each;
mod reduce;
mod scan;
mod transform;
mod tree;

mod tuner;
pub use tuner::{Mode, PatternProfile, TaskProfile, Tuner};

#[cfg(test)]
mod tests;

use crate::error::Result;
use crate::runtime::Handle;
use std::ops::Range;

/// [`Handle::pfor_each`] on the current runtime.
#[track_caller]
pub fn pfor_each<F>(range: Range<usize>, tuner: &Tuner, f: F) -> Result<()>
where
    F: Fn(usize) + Sync,
{
    Handle::current().pfor_each(range, tuner, f)
}

/// [`Handle::preduce`] on the current runtime.
#[track_caller]
pub fn preduce<T, F, C>(
    range: Range<usize>,
    tuner: &Tuner,
    identity: T,
    fold: F,
    combine: C,
) -> Result<T>
where
    T: Clone + Send + Sync,
    F: Fn(T, usize) -> T + Sync,
    C: Fn(T, T) -> T,
{
    Handle::current().preduce(range, tuner, identity, fold, combine)
}

/// [`Handle::pscan`] on the current runtime.
#[track_caller]
pub fn pscan<T, F>(data: &mut [T], tuner: &Tuner, op: F) -> Result<()>
where
    T: Clone + Send + Sync,
    F: Fn(&T, &T) -> T + Sync,
{
    Handle::current().pscan(data, tuner, op)
}

/// [`Handle::ptransform`] on the current runtime.
#[track_caller]
pub fn ptransform<I, O, F>(input: &[I], output: &mut [O], tuner: &Tuner, f: F) -> Result<()>
where
    I: Sync,
    O: Send,
    F: Fn(&I) -> O + Sync,
{
    Handle::current().ptransform(input, output, tuner, f)
}

/// [`Handle::pdivide_and_conquer`] on the current runtime.
#[track_caller]
pub fn pdivide_and_conquer<P, R, IB, B, S, M>(
    problem: P,
    tuner: &Tuner,
    is_base: IB,
    base: B,
    split: S,
    merge: M,
) -> Result<R>
where
    P: Send,
    R: Send,
    IB: Fn(&P) -> bool + Sync,
    B: Fn(P) -> R + Sync,
    S: Fn(P) -> Vec<P> + Sync,
    M: Fn(Vec<R>) -> R + Sync,
{
    Handle::current().pdivide_and_conquer(problem, tuner, is_base, base, split, merge)
}
