use crate::error::Result;
use crate::pattern::Tuner;
use crate::pattern::driver;
use crate::runtime::Handle;
use crate::task::Task;
use std::ops::Range;

impl Handle {
    /// Folds every index of `range` into a value, in parallel.
    ///
    /// Each leaf of the tree folds its indices with `fold`, starting from a
    /// clone of `identity`. The per-leaf values are then joined with
    /// `combine` in index order, so `combine` only has to be associative.
    /// An empty range returns `identity` without creating any task.
    ///
    /// ```
    /// # fn main() -> anyhow::Result<()> {
    /// let rt = hetflow::runtime::Builder::new().worker_threads(2).try_build()?;
    /// let sum = rt.handle().preduce(
    ///     0..1_000,
    ///     &hetflow::Tuner::new(),
    ///     0u64,
    ///     |acc, i| acc + i as u64,
    ///     |a, b| a + b,
    /// )?;
    /// assert_eq!(sum, 499_500);
    /// # Ok(())
    /// # }
    /// ```
    pub fn preduce<T, F, C>(
        &self,
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
        tuner.check()?;
        if range.is_empty() {
            return Ok(identity);
        }

        let tree = driver::run_tree(self, tuner, "preduce", range, None, |acc, chunk| {
            let init = acc.take().unwrap_or_else(|| identity.clone());
            *acc = Some(chunk.fold(init, &fold));
        })?;

        let joined = tree
            .pre_order()
            .into_iter()
            .filter_map(|node| node.take_acc())
            .fold(identity, combine);
        Ok(joined)
    }

    /// Launches [`Handle::preduce`] as a task whose output is the reduced
    /// value.
    pub fn spawn_preduce<T, F, C>(
        &self,
        range: Range<usize>,
        tuner: Tuner,
        identity: T,
        fold: F,
        combine: C,
    ) -> Result<Task<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T, usize) -> T + Send + Sync + 'static,
        C: Fn(T, T) -> T + Send + 'static,
    {
        let handle = self.clone();
        let task = self.create_task(move || {
            Ok(handle.preduce(range, &tuner, identity, fold, combine)?)
        });
        task.launch()?;
        Ok(task)
    }
}
