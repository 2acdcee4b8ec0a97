//! Task handles and fluent invocation.
//!
//! A [`TaskHandle`] is a thin wrapper over one engine task. Calling it wires
//! the task into the environment's graph in one of three shapes:
//!
//! * no arguments: the task is only configured and wired by later calls,
//! * one or more handles: handle `i` feeds input slot `i`,
//! * one or more buffer sequences: a synthetic input node per sequence feeds
//!   slot `i`, and a feeder thread pushes the zipped rows once the run starts.

use std::sync::Arc;

use crate::bridge::{Items, feeder};
use crate::buffer::Buffer;
use crate::core::{Properties, TaskId};
use crate::engine::{Engine, EngineTask, OutputProxy};
use crate::env::{Environment, Run};
use crate::error::{Error, GraphError};

/// One positional argument of [`TaskHandle::call`].
pub enum Arg<'a, E: Engine> {
    Task(&'a TaskHandle<E>),
    Data(Vec<Buffer>),
}

impl<'a, E: Engine> From<&'a TaskHandle<E>> for Arg<'a, E> {
    fn from(handle: &'a TaskHandle<E>) -> Self {
        Arg::Task(handle)
    }
}

impl<E: Engine> From<Vec<Buffer>> for Arg<'_, E> {
    fn from(data: Vec<Buffer>) -> Self {
        Arg::Data(data)
    }
}

/// Anything [`TaskHandle::call`] accepts as its argument list.
pub trait Arguments<'a, E: Engine> {
    fn into_args(self) -> Vec<Arg<'a, E>>;
}

impl<'a, E: Engine> Arguments<'a, E> for () {
    fn into_args(self) -> Vec<Arg<'a, E>> {
        Vec::new()
    }
}

impl<'a, E: Engine> Arguments<'a, E> for &'a TaskHandle<E> {
    fn into_args(self) -> Vec<Arg<'a, E>> {
        vec![Arg::Task(self)]
    }
}

impl<'a, E: Engine> Arguments<'a, E> for Vec<Buffer> {
    fn into_args(self) -> Vec<Arg<'a, E>> {
        vec![Arg::Data(self)]
    }
}

impl<'a, E: Engine> Arguments<'a, E> for Vec<Arg<'a, E>> {
    fn into_args(self) -> Vec<Arg<'a, E>> {
        self
    }
}

macro_rules! impl_arguments {
    ($($A:ident),*) => {
        #[allow(non_snake_case)]
        impl<'a, E, $($A),*> Arguments<'a, E> for ($($A,)*)
        where
            E: Engine,
            $($A: Into<Arg<'a, E>>),*
        {
            fn into_args(self) -> Vec<Arg<'a, E>> {
                let ($($A,)*) = self;
                vec![$($A.into(),)*]
            }
        }
    };
}

impl_arguments!(A1);
impl_arguments!(A1, A2);
impl_arguments!(A1, A2, A3);
impl_arguments!(A1, A2, A3, A4);
impl_arguments!(A1, A2, A3, A4, A5);
impl_arguments!(A1, A2, A3, A4, A5, A6);
impl_arguments!(A1, A2, A3, A4, A5, A6, A7);
impl_arguments!(A1, A2, A3, A4, A5, A6, A7, A8);

/// The validated shape of an argument list.
enum Invocation<'a, E: Engine> {
    Bare,
    Tasks(Vec<&'a TaskHandle<E>>),
    Data(Vec<Vec<Buffer>>),
}

impl<'a, E: Engine> Invocation<'a, E> {
    fn classify(task: &str, args: Vec<Arg<'a, E>>) -> Result<Self, Error> {
        if args.is_empty() {
            return Ok(Invocation::Bare);
        }

        let mut tasks = Vec::new();
        let mut data = Vec::new();

        for arg in args {
            match arg {
                Arg::Task(handle) => tasks.push(handle),
                Arg::Data(buffers) => data.push(buffers),
            }
        }

        match (tasks.is_empty(), data.is_empty()) {
            (false, true) => Ok(Invocation::Tasks(tasks)),
            (true, false) => {
                let len = data[0].len();

                if let Some(other) = data.iter().find(|seq| seq.len() != len) {
                    return Err(Error::invocation(
                        task,
                        format!(
                            "data sequences differ in length ({len} and {})",
                            other.len()
                        ),
                    ));
                }

                Ok(Invocation::Data(data))
            }
            _ => Err(Error::invocation(
                task,
                "task handles and raw data cannot be mixed in one call",
            )),
        }
    }
}

/// A configured engine task bound to an environment.
pub struct TaskHandle<E: Engine> {
    env: Arc<Environment<E>>,
    id: TaskId,
    name: Arc<str>,
    task: E::Task,
    properties: Properties,
}

impl<E: Engine> TaskHandle<E> {
    pub(crate) fn new(
        env: Arc<Environment<E>>,
        name: Arc<str>,
        task: E::Task,
        properties: Properties,
    ) -> Self {
        let id = env.next_id();

        Self {
            env,
            id,
            name,
            task,
            properties,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying engine task.
    pub fn task(&self) -> &E::Task {
        &self.task
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn environment(&self) -> &Arc<Environment<E>> {
        &self.env
    }

    /// Applies the stored properties and wires this task according to `args`.
    ///
    /// An edge that is rejected leaves the graph exactly as it was.
    ///
    /// Returns the handle itself so calls can be nested:
    /// `write.call(&averager.call(&read.call(())?)?)?`.
    pub fn call<'a, A>(&self, args: A) -> Result<&Self, Error>
    where
        A: Arguments<'a, E>,
    {
        let invocation = Invocation::classify(&self.name, args.into_args())?;

        // Running tasks hold their own lock until the run returns.
        self.env.ensure_idle(&self.name)?;
        self.task.configure(&self.properties)?;

        match invocation {
            Invocation::Bare => {}
            Invocation::Tasks(sources) => self.connect_tasks(&sources)?,
            Invocation::Data(streams) => self.connect_data(streams)?,
        }

        Ok(self)
    }

    fn connect_tasks(&self, sources: &[&TaskHandle<E>]) -> Result<(), Error> {
        for source in sources {
            if !Arc::ptr_eq(&source.env, &self.env) {
                return Err(Error::invocation(
                    &*self.name,
                    format!("'{}' belongs to a different environment", source.name),
                ));
            }

            if source.id == self.id {
                return Err(GraphError::SelfLoop(self.name.to_string()).into());
            }
        }

        let mut graph = self.env.wiring(&self.name)?;

        // Nothing is added unless every edge of the call fits.
        for (slot, source) in sources.iter().enumerate() {
            graph.check_edge(source.id, self.id, slot)?;
        }

        let target = graph.add_task(self.id, &self.task);

        for (slot, source) in sources.iter().enumerate() {
            let index = graph.add_task(source.id, &source.task);
            graph.connect(index, target, slot)?;
        }

        Ok(())
    }

    fn connect_data(&self, streams: Vec<Vec<Buffer>>) -> Result<(), Error> {
        let mut nodes = Vec::with_capacity(streams.len());
        let mut inputs = Vec::with_capacity(streams.len());

        for _ in 0..streams.len() {
            let (node, input) = self.env.engine().create_input()?;
            nodes.push((self.env.next_id(), node));
            inputs.push(input);
        }

        {
            let mut graph = self.env.wiring(&self.name)?;

            for (slot, (id, _)) in nodes.iter().enumerate() {
                graph.check_edge(*id, self.id, slot)?;
            }

            let target = graph.add_task(self.id, &self.task);

            for (slot, (id, node)) in nodes.iter().enumerate() {
                let index = graph.add_task(*id, node);
                graph.connect(index, target, slot)?;
            }
        }

        let feeder = feeder::spawn(self.env.clone(), &self.name, inputs, streams)?;
        self.env.adopt_feeder(feeder);

        Ok(())
    }

    /// Starts the scheduler on whatever has been wired so far.
    pub fn run(&self) -> Result<Run, Error> {
        self.env.run()
    }

    /// Attaches an output node to this task, starts the run and returns an
    /// iterator over the finished results.
    pub fn items(&self) -> Result<Items<E>, Error> {
        let (node, output) = self.env.engine().create_output()?;
        let (sender, receiver) = crossbeam_channel::unbounded();

        output.on_finished(Box::new(move |buffer| {
            // The receiver is gone once the drainer has been dropped.
            let _ = sender.send(buffer.clone());
        }));

        let output_id = self.env.next_id();

        let added = {
            let mut graph = self.env.wiring(&self.name)?;
            let added = graph.index_of(self.id).is_none();
            let source = graph.add_task(self.id, &self.task);
            let target = graph.add_task(output_id, &node);
            graph.connect_default(source, target)?;
            added
        };

        let run = self.env.run().inspect_err(|_| {
            // A rejected graph stays pending as it was before this call.
            self.env.unwire(output_id);
            if added {
                self.env.unwire(self.id);
            }
        })?;

        Ok(Items::new(self.env.clone(), run, receiver, output))
    }
}

impl<E: Engine> Clone for TaskHandle<E> {
    fn clone(&self) -> Self {
        Self {
            env: self.env.clone(),
            id: self.id,
            name: self.name.clone(),
            task: self.task.clone(),
            properties: self.properties.clone(),
        }
    }
}

impl<E: Engine> std::fmt::Debug for TaskHandle<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("properties", &self.properties)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Session;
    use crate::local::LocalEngine;

    fn session() -> Session<LocalEngine> {
        Session::new(LocalEngine::new()).unwrap()
    }

    #[test]
    fn test_bare_call_only_configures() {
        let session = session();
        let generate = session.task("Generate", [("number", "many")]).unwrap();

        assert!(generate.call(()).is_err());

        let generate = session.task("Generate", [("number", 3)]).unwrap();
        generate.call(()).unwrap();

        assert_eq!(session.environment().node_count(), 0);
        assert!(session.environment().edges().is_empty());
    }

    #[test]
    fn test_cycle_rejected() {
        let session = session();
        let a = session.task("Averager", ()).unwrap();
        let b = session.task("Averager", ()).unwrap();

        b.call(&a).unwrap();

        match a.call(&b) {
            Err(Error::InvalidInvocation { reason, .. }) => assert!(reason.contains("cycle")),
            other => panic!("unexpected result: {other:?}"),
        }

        assert_eq!(session.environment().edges().len(), 1);
        assert_eq!(session.environment().node_count(), 2);
    }

    #[test]
    fn test_failed_call_adds_nothing() {
        let session = session();
        let a = session.task("Generate", ()).unwrap();
        let b = session.task("Generate", ()).unwrap();
        let null = session.task("Null", ()).unwrap();
        let ffc = session.task("FlatFieldCorrection", ()).unwrap();

        null.call(&a).unwrap();
        assert!(null.call(&b).is_err());
        assert!(ffc.call((&a, &null, &ffc)).is_err());

        assert_eq!(session.environment().node_count(), 2);
        assert_eq!(session.environment().edges().len(), 1);
    }

    #[test]
    fn test_rejected_items_leave_graph_as_it_was() {
        let session = session();
        let env = session.environment();
        let generate = session.task("Generate", ()).unwrap();
        let ffc = session.task("FlatFieldCorrection", ()).unwrap();

        {
            let mut graph = env.wiring("test").unwrap();
            let g = graph.add_task(generate.id(), generate.task());
            let f = graph.add_task(ffc.id(), ffc.task());
            graph.connect(g, f, 1).unwrap();
        }

        assert!(matches!(ffc.items(), Err(Error::InvalidInvocation { .. })));
        assert_eq!(env.node_count(), 2);
        assert_eq!(env.edges().len(), 1);
    }

    #[test]
    fn test_positional_slots() {
        let session = session();
        let a = session.task("Generate", ()).unwrap();
        let b = session.task("Generate", ()).unwrap();
        let c = session.task("FlatFieldCorrection", ()).unwrap();
        let d = session.task("Generate", ()).unwrap();

        c.call((&a, &b, &d)).unwrap();

        let edges = session.environment().edges();
        assert_eq!(edges.len(), 3);
        assert_eq!((edges[0].source, edges[0].target, edges[0].slot), (a.id(), c.id(), 0));
        assert_eq!((edges[1].source, edges[1].target, edges[1].slot), (b.id(), c.id(), 1));
        assert_eq!((edges[2].source, edges[2].target, edges[2].slot), (d.id(), c.id(), 2));
    }

    #[test]
    fn test_chained_calls_return_self() {
        let session = session();
        let generate = session.task("Generate", ()).unwrap();
        let null = session.task("Null", ()).unwrap();

        let same = null.call(generate.call(()).unwrap()).unwrap();

        assert_eq!(same.id(), null.id());
        assert_eq!(session.environment().edges().len(), 1);
    }

    #[test]
    fn test_mixed_arguments_rejected() {
        let session = session();
        let generate = session.task("Generate", ()).unwrap();
        let averager = session.task("Averager", ()).unwrap();

        let err = averager
            .call((&generate, vec![Buffer::zeros(&[2, 2])]))
            .unwrap_err();

        assert!(matches!(err, Error::InvalidInvocation { .. }));
        assert!(session.environment().edges().is_empty());
    }

    #[test]
    fn test_unequal_lengths_rejected() {
        let session = session();
        let ffc = session.task("FlatFieldCorrection", ()).unwrap();

        let err = ffc
            .call((
                vec![Buffer::zeros(&[2, 2]); 3],
                vec![Buffer::zeros(&[2, 2]); 2],
                vec![Buffer::zeros(&[2, 2]); 3],
            ))
            .unwrap_err();

        match err {
            Error::InvalidInvocation { task, reason } => {
                assert_eq!(task, "flat_field_correction");
                assert!(reason.contains("length"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(session.environment().node_count(), 0);
    }

    #[test]
    fn test_slot_conflict_rejected() {
        let session = session();
        let a = session.task("Generate", ()).unwrap();
        let b = session.task("Generate", ()).unwrap();
        let null = session.task("Null", ()).unwrap();

        null.call(&a).unwrap();
        let err = null.call(&b).unwrap_err();

        assert!(matches!(err, Error::InvalidInvocation { .. }));
        assert_eq!(session.environment().edges().len(), 1);
    }

    #[test]
    fn test_self_loop_rejected() {
        let session = session();
        let null = session.task("Null", ()).unwrap();

        assert!(matches!(
            null.call(&null),
            Err(Error::InvalidInvocation { .. })
        ));
    }

    #[test]
    fn test_unknown_property_on_call() {
        let session = session();
        let generate = session.task("Generate", [("colour", "red")]).unwrap();

        match generate.call(()) {
            Err(Error::UnknownProperty { task, property }) => {
                assert_eq!(task, "generate");
                assert_eq!(property, "colour");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_foreign_handle_rejected() {
        let first = session();
        let second = session();
        let generate = first.task("Generate", ()).unwrap();
        let null = second.task("Null", ()).unwrap();

        assert!(matches!(
            null.call(&generate),
            Err(Error::InvalidInvocation { .. })
        ));
    }
}
