//! The execution environment and run coordinator.
//!
//! An [`Environment`] owns the single graph being assembled and the two
//! lifecycle flags the streaming bridge synchronises on:
//!
//! * `started` flips to `true` as soon as the scheduler thread is spawned.
//!   Feeders wait for it, and for the run counter to move past the value it
//!   had when they were spawned, before pushing data.
//! * `done` flips to `true` once the engine's `run` call has returned.
//!   Drainers stop once it is set and their queue is empty.
//!
//! A run takes the assembled graph out of the environment and leaves a fresh,
//! empty one behind, so edges of a finished run can never leak into the next
//! build.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::config::Options;
use crate::core::TaskId;
use crate::engine::Engine;
use crate::error::{EngineError, Error, panic_message};
use crate::graph::{Edge, TaskGraph};

/// Lifecycle of an [`Environment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No scheduler running, the graph accepts edges.
    Idle,
    /// The scheduler is running the taken graph; wiring is refused.
    Running,
    /// The last run has returned. Wiring goes into a fresh graph.
    Finished,
}

pub struct Environment<E: Engine> {
    engine: E,
    options: Options,
    graph: Mutex<TaskGraph<E::Task>>,
    feeders: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    runs: AtomicU64,
    started: AtomicBool,
    done: AtomicBool,
}

impl<E: Engine> Environment<E> {
    pub(crate) fn new(engine: E, options: Options) -> Self {
        Self {
            engine,
            options,
            graph: Mutex::new(TaskGraph::new()),
            feeders: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            runs: AtomicU64::new(0),
            started: AtomicBool::new(false),
            done: AtomicBool::new(false),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn state(&self) -> RunState {
        match (self.is_started(), self.is_done()) {
            (_, true) => RunState::Finished,
            (true, false) => RunState::Running,
            (false, false) => RunState::Idle,
        }
    }

    /// Snapshot of the edges wired so far.
    pub fn edges(&self) -> Vec<Edge> {
        self.lock_graph().edges()
    }

    /// Number of nodes wired so far.
    pub fn node_count(&self) -> usize {
        self.lock_graph().node_count()
    }

    /// Mermaid rendering of the graph wired so far.
    pub fn render(&self) -> String {
        self.lock_graph().to_string()
    }

    /// Number of runs started so far.
    pub(crate) fn runs(&self) -> u64 {
        self.runs.load(Ordering::Acquire)
    }

    pub(crate) fn next_id(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Refuses `task` any change while a run is in progress.
    pub(crate) fn ensure_idle(&self, task: &str) -> Result<(), Error> {
        if self.state() == RunState::Running {
            return Err(Error::invocation(
                task,
                "the graph is frozen while a run is in progress",
            ));
        }

        Ok(())
    }

    /// Grants mutable access to the graph unless a run is in progress.
    pub(crate) fn wiring(&self, task: &str) -> Result<MutexGuard<'_, TaskGraph<E::Task>>, Error> {
        let graph = self.lock_graph();
        self.ensure_idle(task)?;
        Ok(graph)
    }

    /// Drops the node `id` and its edges from the pending graph.
    pub(crate) fn unwire(&self, id: TaskId) {
        if self.lock_graph().remove_task(id).is_some() {
            tracing::debug!(%id, "unwired");
        }
    }

    /// Hands a feeder thread to the next run, which joins it.
    pub(crate) fn adopt_feeder(&self, feeder: JoinHandle<()>) {
        self.feeders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(feeder);
    }

    /// Starts the scheduler on a background thread.
    ///
    /// The graph is validated first, so malformed wiring is reported here,
    /// synchronously. On success the graph is moved into the scheduler thread
    /// and replaced by an empty one.
    pub fn run(self: &Arc<Self>) -> Result<Run, Error> {
        let mut pending = self.lock_graph();

        if self.state() == RunState::Running {
            return Err(Error::invocation(
                "scheduler",
                "a run is already in progress",
            ));
        }

        pending.validate()?;

        let graph = std::mem::take(&mut *pending);
        let feeders = std::mem::take(
            &mut *self.feeders.lock().unwrap_or_else(PoisonError::into_inner),
        );

        self.started.store(false, Ordering::Release);
        self.done.store(false, Ordering::Release);

        tracing::info!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            feeders = feeders.len(),
            "starting run"
        );

        let env = self.clone();
        let scheduler = thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || {
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| env.engine.run(&graph)))
                    .unwrap_or_else(|panic| Err(EngineError::Panicked(panic_message(&*panic))));

                drop(graph);
                env.done.store(true, Ordering::Release);

                match &result {
                    Ok(()) => tracing::info!("run finished"),
                    Err(err) => tracing::error!("run failed: {err}"),
                }

                result
            })
            .map_err(|err| Error::Engine(EngineError::Io(err)))?;

        self.runs.fetch_add(1, Ordering::AcqRel);
        self.started.store(true, Ordering::Release);

        Ok(Run { scheduler, feeders })
    }

    fn lock_graph(&self) -> MutexGuard<'_, TaskGraph<E::Task>> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A run in progress.
///
/// There is no cancellation: once started, a run proceeds until the engine
/// returns. [`Run::join`] is the only way to wait for it.
#[must_use = "a run should be joined to observe engine failures"]
#[derive(Debug)]
pub struct Run {
    scheduler: JoinHandle<Result<(), EngineError>>,
    feeders: Vec<JoinHandle<()>>,
}

impl Run {
    pub fn is_finished(&self) -> bool {
        self.scheduler.is_finished()
    }

    /// Blocks until the scheduler and every feeder of this run have exited.
    pub fn join(self) -> Result<(), Error> {
        let result = match self.scheduler.join() {
            Ok(result) => result,
            Err(panic) => Err(EngineError::Panicked(panic_message(&*panic))),
        };

        for feeder in self.feeders {
            if feeder.join().is_err() {
                tracing::warn!("feeder thread panicked");
            }
        }

        result.map_err(Error::EngineFailure)
    }
}
