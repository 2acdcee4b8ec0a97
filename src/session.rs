use std::sync::Arc;

use crate::config::Options;
use crate::core::Properties;
use crate::engine::Engine;
use crate::env::Environment;
use crate::error::Error;
use crate::handle::TaskHandle;
use crate::resolve::{NameTable, TaskFactory};

/// Entry point of the fluent API.
///
/// A session owns one engine, the single [`Environment`] every handle it
/// creates is bound to, and the table of task names the engine exposed when
/// the session was created.
///
/// ```rust
/// use ufo_fluent::{Buffer, Session, local::LocalEngine};
///
/// let session = Session::new(LocalEngine::new())?;
/// let averager = session.task("ufo.Averager", ())?;
///
/// let frames = vec![Buffer::filled(&[4, 4], 1.5), Buffer::filled(&[4, 4], 2.5)];
///
/// for item in averager.call(frames)?.items()? {
///     assert!(item?.as_slice().iter().all(|&x| x == 2.0));
/// }
/// # Ok::<(), ufo_fluent::Error>(())
/// ```
pub struct Session<E: Engine> {
    env: Arc<Environment<E>>,
    names: NameTable,
}

impl<E: Engine> Session<E> {
    pub fn new(engine: E) -> Result<Self, Error> {
        Self::with_options(engine, Options::default())
    }

    pub fn with_options(engine: E, options: Options) -> Result<Self, Error> {
        let names = NameTable::new(engine.task_names()?);

        tracing::debug!(tasks = names.len(), "discovered engine tasks");

        Ok(Self {
            env: Arc::new(Environment::new(engine, options)),
            names,
        })
    }

    /// Resolves a dotted CamelCase reference such as `"ufo.FlatFieldCorrection"`.
    pub fn resolve(&self, reference: &str) -> Result<TaskFactory<E>, Error> {
        let name = self.names.lookup(reference)?;
        Ok(TaskFactory::new(self.env.clone(), name))
    }

    /// Resolves `reference` and creates a task with `properties`.
    pub fn task(
        &self,
        reference: &str,
        properties: impl Into<Properties>,
    ) -> Result<TaskHandle<E>, Error> {
        self.resolve(reference)?.create(properties)
    }

    pub fn environment(&self) -> &Arc<Environment<E>> {
        &self.env
    }

    pub fn names(&self) -> &NameTable {
        &self.names
    }
}
