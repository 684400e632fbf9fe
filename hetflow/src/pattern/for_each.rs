use crate::error::Result;
use crate::pattern::Tuner;
use crate::pattern::driver;
use crate::runtime::Handle;
use crate::task::Task;
use std::ops::Range;

impl Handle {
    /// Calls `f` once for every index of `range`, in parallel.
    ///
    /// Returns once every call returned. A panic in `f` is reported as
    /// `Error::Panicked` (or re-raised when it happened on the calling
    /// thread), and cancellation of the calling task stops the loop between
    /// chunks with `Error::Canceled`.
    ///
    /// ```
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let rt = hetflow::runtime::Builder::new().worker_threads(2).try_build()?;
    /// let sum = AtomicUsize::new(0);
    /// rt.handle().pfor_each(0..100, &hetflow::Tuner::new(), |i| {
    ///     sum.fetch_add(i, Ordering::Relaxed);
    /// })?;
    /// assert_eq!(sum.into_inner(), 4950);
    /// # Ok(())
    /// # }
    /// ```
    pub fn pfor_each<F>(&self, range: Range<usize>, tuner: &Tuner, f: F) -> Result<()>
    where
        F: Fn(usize) + Sync,
    {
        tuner.check()?;
        if range.is_empty() {
            return Ok(());
        }

        driver::run_tree::<(), _>(self, tuner, "pfor_each", range, None, |_, chunk| {
            chunk.for_each(&f)
        })?;
        Ok(())
    }

    /// Launches [`Handle::pfor_each`] as a task. Canceling the task stops
    /// the loop.
    pub fn spawn_pfor_each<F>(&self, range: Range<usize>, tuner: Tuner, f: F) -> Result<Task<()>>
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let handle = self.clone();
        let task = self.create_task(move || Ok(handle.pfor_each(range, &tuner, f)?));
        task.launch()?;
        Ok(task)
    }
}
