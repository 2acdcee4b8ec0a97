//! An in-process reference engine.
//!
//! Every node of a graph runs on its own thread and talks to its neighbours
//! through unbounded channels. Results are broadcast to every outgoing edge
//! and the end of a stream propagates by channel disconnection.

mod filter;
mod filters;
#[cfg(feature = "image")]
mod io;
mod proxy;
mod runner;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::Properties;
use crate::engine::{Engine, EngineTask};
use crate::error::EngineError;
use crate::graph::TaskGraph;

pub use filter::{Emitter, Filter, PropertyError};
pub use proxy::{LocalInput, LocalOutput};

use proxy::{InputQueues, OutputShared};

/// Constructor of a registered filter.
pub type Constructor = fn() -> Box<dyn Filter>;

pub struct LocalEngine {
    registry: BTreeMap<String, Constructor>,
}

impl LocalEngine {
    /// An engine with every built-in task registered.
    pub fn new() -> Self {
        let mut engine = Self::empty();
        filters::register(&mut engine);
        #[cfg(feature = "image")]
        io::register(&mut engine);
        engine
    }

    /// An engine without any tasks.
    pub fn empty() -> Self {
        Self {
            registry: BTreeMap::new(),
        }
    }

    /// Adds or replaces the task called `name`.
    pub fn register(&mut self, name: impl Into<String>, constructor: Constructor) -> &mut Self {
        self.registry.insert(name.into(), constructor);
        self
    }
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for LocalEngine {
    type Task = LocalTask;
    type Input = LocalInput;
    type Output = LocalOutput;

    fn task_names(&self) -> Result<BTreeSet<String>, EngineError> {
        Ok(self.registry.keys().cloned().collect())
    }

    fn create_task(&self, name: &str) -> Result<LocalTask, EngineError> {
        let constructor = self
            .registry
            .get(name)
            .ok_or_else(|| EngineError::UnknownTask(name.to_string()))?;

        Ok(LocalTask::new(name, Kind::Filter(Mutex::new(constructor()))))
    }

    fn create_input(&self) -> Result<(LocalTask, LocalInput), EngineError> {
        let queues = Arc::new(InputQueues::new());
        let task = LocalTask::new("input", Kind::Input(queues.clone()));
        Ok((task, LocalInput::new(queues)))
    }

    fn create_output(&self) -> Result<(LocalTask, LocalOutput), EngineError> {
        let shared = Arc::new(OutputShared::default());
        let task = LocalTask::new("output", Kind::Output(shared.clone()));
        Ok((task, LocalOutput::new(shared)))
    }

    fn run(&self, graph: &TaskGraph<LocalTask>) -> Result<(), EngineError> {
        runner::run(graph)
    }
}

pub(crate) enum Kind {
    Filter(Mutex<Box<dyn Filter>>),
    Input(Arc<InputQueues>),
    Output(Arc<OutputShared>),
}

struct Inner {
    name: String,
    kind: Kind,
    processed: AtomicUsize,
}

/// A task instance of the local engine. Clones share the same instance.
#[derive(Clone)]
pub struct LocalTask {
    inner: Arc<Inner>,
}

impl LocalTask {
    fn new(name: &str, kind: Kind) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                kind,
                processed: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of input sets consumed during the last run.
    pub fn num_processed(&self) -> usize {
        self.inner.processed.load(Ordering::Acquire)
    }

    pub fn num_inputs(&self) -> usize {
        match &self.inner.kind {
            Kind::Filter(filter) => lock(filter).num_inputs(),
            Kind::Input(_) => 0,
            Kind::Output(_) => 1,
        }
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    pub(crate) fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn set_processed(&self, count: usize) {
        self.inner.processed.store(count, Ordering::Release);
    }

    pub(crate) fn count_processed(&self) {
        self.inner.processed.fetch_add(1, Ordering::AcqRel);
    }
}

impl EngineTask for LocalTask {
    fn plugin_name(&self) -> &str {
        &self.inner.name
    }

    fn configure(&self, properties: &Properties) -> Result<(), EngineError> {
        let Kind::Filter(filter) = &self.inner.kind else {
            return match properties.iter().next() {
                Some((key, _)) => Err(EngineError::UnknownProperty {
                    task: self.inner.name.clone(),
                    property: key.to_string(),
                }),
                None => Ok(()),
            };
        };

        let mut filter = lock(filter);

        for (key, value) in properties.iter() {
            filter
                .set_property(&key.replace('-', "_"), value)
                .map_err(|err| match err {
                    PropertyError::Unknown => EngineError::UnknownProperty {
                        task: self.inner.name.clone(),
                        property: key.to_string(),
                    },
                    PropertyError::Invalid(reason) => EngineError::InvalidValue {
                        task: self.inner.name.clone(),
                        property: key.to_string(),
                        reason,
                    },
                })?;
        }

        Ok(())
    }
}

impl Debug for LocalTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTask")
            .field("name", &self.inner.name)
            .field("processed", &self.num_processed())
            .finish()
    }
}

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
