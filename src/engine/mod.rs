//! The capability surface of the execution engine.
//!
//! The engine owns scheduling, buffer management and the task
//! implementations. This crate only reaches it through the traits below: it
//! discovers task names, instantiates and configures tasks, asks for proxy
//! nodes that bridge host data in and out of a graph, and hands a finished
//! [`TaskGraph`] to [`Engine::run`].

use std::collections::BTreeSet;

use crate::buffer::Buffer;
use crate::core::Properties;
use crate::error::EngineError;
use crate::graph::TaskGraph;

/// Callback invoked by an output proxy each time a result is finished.
///
/// The buffer is lent for the duration of the call and returns to the
/// engine's pool afterwards, so callbacks copy out what they want to keep.
pub type FinishedCallback = Box<dyn Fn(&Buffer) + Send + Sync>;

/// An execution engine.
pub trait Engine: Send + Sync + 'static {
    /// A cheaply clonable reference to one engine task instance.
    type Task: EngineTask;
    /// Feeding side of a synthetic input node.
    type Input: InputProxy;
    /// Consuming side of a synthetic output node.
    type Output: OutputProxy;

    /// Every task identifier the engine can currently instantiate.
    fn task_names(&self) -> Result<BTreeSet<String>, EngineError>;

    fn create_task(&self, name: &str) -> Result<Self::Task, EngineError>;

    /// Creates a synthetic input node: the graph side and the feeding side.
    fn create_input(&self) -> Result<(Self::Task, Self::Input), EngineError>;

    /// Creates a synthetic output node: the graph side and the consuming side.
    fn create_output(&self) -> Result<(Self::Task, Self::Output), EngineError>;

    /// Runs a graph to completion. Blocks the calling thread.
    fn run(&self, graph: &TaskGraph<Self::Task>) -> Result<(), EngineError>;
}

pub trait EngineTask: Clone + Send + Sync + 'static {
    /// Name of the plugin this task was created from.
    fn plugin_name(&self) -> &str;

    /// Applies keyword options. Keys the task does not know fail with
    /// [`EngineError::UnknownProperty`].
    fn configure(&self, properties: &Properties) -> Result<(), EngineError>;
}

pub trait InputProxy: Send + Sync + 'static {
    /// Blocks until the node hands back a buffer that may be overwritten and
    /// released again.
    fn current_buffer(&self) -> Result<Buffer, EngineError>;

    /// Passes ownership of a filled buffer to the node.
    fn release_buffer(&self, buffer: Buffer);

    /// Signals that no further data will arrive.
    fn stop(&self);
}

pub trait OutputProxy: Send + Sync + 'static {
    fn on_finished(&self, callback: FinishedCallback);
}
