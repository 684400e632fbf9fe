use crate::error::{Misuse, Result};
use crate::runtime::Handle;
use crate::task::Id;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Leaves per participant targeted by the automatic chunk size.
const AUTO_CHUNKS_PER_PARTICIPANT: usize = 8;

/// How a pattern spreads its range over the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Work stealing on the adaptive tree.
    #[default]
    Adaptive,
    /// The range is cut once into `degree_of_concurrency` contiguous slices,
    /// one per participant, and nothing is stolen.
    Static,
    /// Everything runs inline on the calling thread.
    Serial,
}

/// Scheduling knobs of a parallel pattern.
///
/// ```
/// use hetflow::Tuner;
///
/// let tuner = Tuner::new().chunk_size(1024).degree_of_concurrency(4).profile(true);
/// assert_eq!(tuner.mode(), hetflow::pattern::Mode::Adaptive);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Tuner {
    chunk_size: Option<usize>,
    degree_of_concurrency: Option<usize>,
    mode: Mode,
    profile: Option<Arc<Mutex<Option<PatternProfile>>>>,
}

impl Tuner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Minimum number of iterations per leaf. Defaults to a size that gives
    /// every participant a handful of leaves. Zero is rejected by the
    /// pattern with [`Misuse::ZeroChunk`].
    pub fn chunk_size(mut self, val: usize) -> Self {
        self.chunk_size = Some(val);
        self
    }

    /// Number of workers the pattern targets. Defaults to the runtime's
    /// worker count.
    #[track_caller]
    pub fn degree_of_concurrency(mut self, val: usize) -> Self {
        assert!(val > 0, "degree_of_concurrency must be greater than 0");
        self.degree_of_concurrency = Some(val);
        self
    }

    /// Records the time spent by every participating task; read it back
    /// with [`Tuner::last_profile`].
    pub fn profile(mut self, on: bool) -> Self {
        self.profile = on.then(|| Arc::new(Mutex::new(None)));
        self
    }

    /// Bypasses the scheduler. Takes precedence over `static_chunking`.
    pub fn serial(mut self, on: bool) -> Self {
        if on {
            self.mode = Mode::Serial;
        } else if self.mode == Mode::Serial {
            self.mode = Mode::Adaptive;
        }
        self
    }

    /// Uses static chunking instead of work stealing.
    pub fn static_chunking(mut self, on: bool) -> Self {
        match (on, self.mode) {
            (_, Mode::Serial) => {}
            (true, _) => self.mode = Mode::Static,
            (false, _) => self.mode = Mode::Adaptive,
        }
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Profile of the last pattern run with this tuner (or a clone of it).
    pub fn last_profile(&self) -> Option<PatternProfile> {
        self.profile.as_ref().and_then(|p| p.lock().clone())
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.chunk_size == Some(0) {
            return Err(Misuse::ZeroChunk.into());
        }
        Ok(())
    }

    pub(crate) fn degree_for(&self, handle: &Handle) -> usize {
        match self.mode {
            Mode::Serial => 1,
            _ => self
                .degree_of_concurrency
                .unwrap_or_else(|| handle.worker_threads())
                .max(1),
        }
    }

    pub(crate) fn chunk_for(&self, len: usize, degree: usize) -> usize {
        self.chunk_size
            .unwrap_or_else(|| len / (degree * AUTO_CHUNKS_PER_PARTICIPANT))
            .max(1)
    }

    pub(crate) fn recorder(&self) -> Option<ProfileRecorder> {
        self.profile.as_ref().map(|_| ProfileRecorder {
            start: Instant::now(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn store_profile(&self, profile: PatternProfile) {
        tracing::debug!(
            pattern = profile.pattern,
            elapsed = ?profile.elapsed,
            tasks = profile.tasks.len(),
            steals = profile.steals,
            nodes = profile.nodes,
            "pattern profile"
        );

        if let Some(sink) = &self.profile {
            *sink.lock() = Some(profile);
        }
    }
}

/// Time spent by one task of a pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskProfile {
    /// `None` when the participant ran outside of a task body.
    pub task: Option<Id>,
    pub elements: usize,
    pub chunks: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternProfile {
    pub pattern: &'static str,
    pub elapsed: Duration,
    pub chunk_size: usize,
    /// Successful splits of a running node.
    pub steals: usize,
    /// Tree nodes, or subproblems for divide and conquer.
    pub nodes: usize,
    pub tasks: Vec<TaskProfile>,
}

#[derive(Debug)]
pub(crate) struct ProfileRecorder {
    start: Instant,
    tasks: Mutex<Vec<TaskProfile>>,
}

impl ProfileRecorder {
    pub(crate) fn record(&self, task: TaskProfile) {
        self.tasks.lock().push(task);
    }

    pub(crate) fn finish(
        self,
        pattern: &'static str,
        chunk_size: usize,
        steals: usize,
        nodes: usize,
    ) -> PatternProfile {
        PatternProfile {
            pattern,
            elapsed: self.start.elapsed(),
            chunk_size,
            steals,
            nodes,
            tasks: self.tasks.into_inner(),
        }
    }
}
