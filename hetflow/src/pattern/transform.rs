use crate::error::{Misuse, Result};
use crate::pattern::Tuner;
use crate::pattern::driver::{self, SharedSlice};
use crate::runtime::Handle;
use crate::task::Task;

impl Handle {
    /// Writes `output[i] = f(&input[i])` for every index, in parallel.
    pub fn ptransform<I, O, F>(
        &self,
        input: &[I],
        output: &mut [O],
        tuner: &Tuner,
        f: F,
    ) -> Result<()>
    where
        I: Sync,
        O: Send,
        F: Fn(&I) -> O + Sync,
    {
        tuner.check()?;
        if input.len() != output.len() {
            return Err(Misuse::LengthMismatch {
                input: input.len(),
                output: output.len(),
            }
            .into());
        }
        if input.is_empty() {
            return Ok(());
        }

        let output = SharedSlice::new(output);
        driver::run_tree::<(), _>(self, tuner, "ptransform", 0..input.len(), None, |_, chunk| {
            // Safety: chunks of the tree never overlap.
            let dst = unsafe { output.slice_mut(chunk.clone()) };
            for (dst, src) in dst.iter_mut().zip(&input[chunk]) {
                *dst = f(src);
            }
        })?;
        Ok(())
    }

    /// Launches [`Handle::ptransform`] as a task whose output is `output`
    /// once filled.
    pub fn spawn_ptransform<I, O, F>(
        &self,
        input: Vec<I>,
        mut output: Vec<O>,
        tuner: Tuner,
        f: F,
    ) -> Result<Task<Vec<O>>>
    where
        I: Send + Sync + 'static,
        O: Send + 'static,
        F: Fn(&I) -> O + Send + Sync + 'static,
    {
        let handle = self.clone();
        let task = self.create_task(move || {
            handle.ptransform(&input, &mut output, &tuner, f)?;
            Ok(output)
        });
        task.launch()?;
        Ok(task)
    }
}
