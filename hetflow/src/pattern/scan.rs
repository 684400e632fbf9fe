use crate::error::Result;
use crate::pattern::Tuner;
use crate::pattern::driver::{self, SharedSlice};
use crate::runtime::Handle;
use crate::task::Task;

impl Handle {
    /// Inclusive prefix scan of `data` in place: `data[i]` becomes
    /// `data[0] op data[1] op .. op data[i]`. `op` must be associative.
    ///
    /// Every leaf first scans its own elements, the leaf totals are then
    /// chained serially in index order, and finally each leaf's elements are
    /// offset by the total of everything before it.
    pub fn pscan<T, F>(&self, data: &mut [T], tuner: &Tuner, op: F) -> Result<()>
    where
        T: Clone + Send + Sync,
        F: Fn(&T, &T) -> T + Sync,
    {
        tuner.check()?;
        if data.is_empty() {
            return Ok(());
        }

        let len = data.len();
        let data = SharedSlice::new(data);

        let tree = driver::run_tree(self, tuner, "pscan", 0..len, None, |acc, chunk| {
            // Safety: chunks of the tree never overlap.
            let items = unsafe { data.slice_mut(chunk) };
            for item in items {
                if let Some(total) = acc.as_ref() {
                    *item = op(total, item);
                }
                *acc = Some(item.clone());
            }
        })?;

        let mut carry: Option<T> = None;
        let mut segments = Vec::new();
        for node in tree.pre_order() {
            let Some(total) = node.take_acc() else {
                continue;
            };
            carry = Some(match carry {
                Some(prefix) => {
                    let next = op(&prefix, &total);
                    segments.push((node.own_range(), prefix));
                    next
                }
                None => total,
            });
        }
        drop(tree);

        if segments.is_empty() {
            return Ok(());
        }

        driver::run_tree::<(), _>(
            self,
            tuner,
            "pscan/apply",
            0..segments.len(),
            Some(1),
            |_, chunk| {
                for (range, prefix) in &segments[chunk] {
                    // Safety: segments are the disjoint node ranges above.
                    let items = unsafe { data.slice_mut(range.clone()) };
                    for item in items {
                        *item = op(prefix, item);
                    }
                }
            },
        )?;

        Ok(())
    }

    /// Launches [`Handle::pscan`] as a task that owns `data` and hands it
    /// back as its output.
    pub fn spawn_pscan<T, F>(&self, mut data: Vec<T>, tuner: Tuner, op: F) -> Result<Task<Vec<T>>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&T, &T) -> T + Send + Sync + 'static,
    {
        let handle = self.clone();
        let task = self.create_task(move || {
            handle.pscan(&mut data, &tuner, op)?;
            Ok(data)
        });
        task.launch()?;
        Ok(task)
    }
}
