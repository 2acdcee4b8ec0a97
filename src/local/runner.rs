use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};

use crate::buffer::Buffer;
use crate::error::{EngineError, panic_message};
use crate::graph::TaskGraph;

use super::filter::Emitter;
use super::{Kind, LocalTask, lock};

type Link = Arc<Buffer>;

/// Runs `graph` to completion, one thread per node.
///
/// Input nodes are closed on every exit path so no feeder blocks on a node
/// that will never run.
pub(crate) fn run(graph: &TaskGraph<LocalTask>) -> Result<(), EngineError> {
    let result = check(graph).and_then(|()| execute(graph));

    for index in graph.node_indices() {
        if let Kind::Input(queues) = graph.task(index).kind() {
            queues.close();
        }
    }

    result
}

/// Every input of every task has to be connected, and a source whose results
/// go nowhere is a mistake.
fn check(graph: &TaskGraph<LocalTask>) -> Result<(), EngineError> {
    for index in graph.node_indices() {
        let task = graph.task(index);
        let expected = task.num_inputs();
        let connected = graph.inputs(index).len();

        if connected < expected {
            return Err(EngineError::Setup(format!(
                "Not all inputs of `{}` are connected",
                task.name()
            )));
        }

        if connected > expected {
            return Err(EngineError::Setup(format!(
                "`{}` accepts {expected} inputs, {connected} are connected",
                task.name()
            )));
        }

        if expected == 0 && graph.successors(index).is_empty() {
            return Err(EngineError::Setup(format!(
                "No outgoing node for `{}`",
                task.name()
            )));
        }
    }

    Ok(())
}

fn execute(graph: &TaskGraph<LocalTask>) -> Result<(), EngineError> {
    let bound = graph.node_indices().map(|i| i.index() + 1).max().unwrap_or(0);
    let mut outputs: Vec<Vec<Sender<Link>>> = vec![Vec::new(); bound];
    let mut inputs: Vec<Vec<Receiver<Link>>> = vec![Vec::new(); bound];

    for index in graph.node_indices() {
        for source in graph.inputs(index) {
            let (tx, rx) = crossbeam_channel::unbounded();
            outputs[source.index()].push(tx);
            inputs[index.index()].push(rx);
        }
    }

    tracing::debug!(nodes = graph.node_count(), "executing graph");

    thread::scope(move |s| {
        let mut handles = Vec::with_capacity(graph.node_count());

        for index in graph.node_indices() {
            let task = graph.task(index);
            let rx = std::mem::take(&mut inputs[index.index()]);
            let tx = std::mem::take(&mut outputs[index.index()]);

            let handle = thread::Builder::new()
                .name(format!("{}-{}", task.name(), index.index()))
                .spawn_scoped(s, move || {
                    std::panic::catch_unwind(AssertUnwindSafe(|| run_node(task, rx, tx)))
                        .unwrap_or_else(|panic| Err(EngineError::Panicked(panic_message(&*panic))))
                });

            match handle {
                Ok(handle) => handles.push((index, handle)),
                // Channels of the nodes not spawned drop with this closure, so
                // the spawned ones see their streams end and exit.
                Err(err) => return Err(EngineError::Io(err)),
            }
        }

        let mut first = None;

        for (index, handle) in handles {
            let result = handle
                .join()
                .unwrap_or_else(|panic| Err(EngineError::Panicked(panic_message(&*panic))));

            if let Err(err) = result {
                tracing::error!(task = graph.task(index).name(), "{err}");
                first.get_or_insert(err);
            }
        }

        first.map_or(Ok(()), Err)
    })
}

fn run_node(
    task: &LocalTask,
    inputs: Vec<Receiver<Link>>,
    outputs: Vec<Sender<Link>>,
) -> Result<(), EngineError> {
    let mut out = Emitter::new(&outputs);
    task.set_processed(0);

    match task.kind() {
        Kind::Filter(filter) => {
            let mut filter = lock(filter);
            let failed = |source: anyhow::Error| EngineError::Task {
                task: task.name().to_string(),
                source,
            };

            filter.setup().map_err(failed)?;

            if inputs.is_empty() {
                filter.generate(&mut out).map_err(failed)?;
            } else {
                while let Some(row) = next_row(&inputs) {
                    let refs: Vec<&Buffer> = row.iter().map(|link| &**link).collect();
                    filter.process(&refs, &mut out).map_err(failed)?;
                    task.count_processed();

                    if out.is_closed() {
                        break;
                    }
                }

                if !out.is_closed() {
                    filter.flush(&mut out).map_err(failed)?;
                }
            }
        }
        Kind::Input(queues) => {
            let forwarded = queues.forward(&mut out);
            task.set_processed(forwarded);
        }
        Kind::Output(shared) => {
            while let Some(row) = next_row(&inputs) {
                shared.finish(&row[0]);
                task.count_processed();
            }
        }
    }

    tracing::debug!(
        task = task.name(),
        processed = task.num_processed(),
        emitted = out.emitted(),
        "node finished"
    );

    Ok(())
}

/// One buffer from every input, or `None` once any input has ended.
fn next_row(inputs: &[Receiver<Link>]) -> Option<Vec<Link>> {
    inputs.iter().map(|input| input.recv().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Properties, TaskId};
    use crate::engine::{Engine, EngineTask};
    use crate::local::LocalEngine;

    fn task(engine: &LocalEngine, name: &str, props: Properties) -> LocalTask {
        let task = engine.create_task(name).unwrap();
        task.configure(&props).unwrap();
        task
    }

    #[test]
    fn test_task_counts() {
        let engine = LocalEngine::new();
        let generate = task(
            &engine,
            "generate",
            Properties::new().with("number", 5).with("width", 16).with("height", 16),
        );
        let averager = task(&engine, "averager", Properties::new());
        let null = task(&engine, "null", Properties::new());

        let mut graph = TaskGraph::new();
        let a = graph.add_task(TaskId(0), &generate);
        let b = graph.add_task(TaskId(1), &averager);
        let c = graph.add_task(TaskId(2), &null);
        graph.connect_default(a, b).unwrap();
        graph.connect_default(b, c).unwrap();

        engine.run(&graph).unwrap();

        assert_eq!(generate.num_processed(), 0);
        assert_eq!(averager.num_processed(), 5);
        assert_eq!(null.num_processed(), 1);
    }

    #[test]
    fn test_broadcast() {
        let engine = LocalEngine::new();
        let generate = task(
            &engine,
            "generate",
            Properties::new().with("number", 5).with("width", 8).with("height", 8),
        );
        let first = task(&engine, "null", Properties::new());
        let second = task(&engine, "null", Properties::new());

        let mut graph = TaskGraph::new();
        let g = graph.add_task(TaskId(0), &generate);
        let a = graph.add_task(TaskId(1), &first);
        let b = graph.add_task(TaskId(2), &second);
        graph.connect_default(g, a).unwrap();
        graph.connect_default(g, b).unwrap();

        engine.run(&graph).unwrap();

        assert_eq!(first.num_processed(), 5);
        assert_eq!(second.num_processed(), 5);
    }

    #[test]
    fn test_unconnected_inputs() {
        let engine = LocalEngine::new();
        let generate = task(&engine, "generate", Properties::new());
        let ffc = task(&engine, "flat_field_correction", Properties::new());

        let mut graph = TaskGraph::new();
        let g = graph.add_task(TaskId(0), &generate);
        let f = graph.add_task(TaskId(1), &ffc);
        graph.connect_default(g, f).unwrap();

        match engine.run(&graph) {
            Err(EngineError::Setup(msg)) => {
                assert_eq!(msg, "Not all inputs of `flat_field_correction` are connected")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_no_outgoing_node() {
        let engine = LocalEngine::new();
        let generate = task(&engine, "generate", Properties::new());

        let mut graph = TaskGraph::new();
        graph.add_task(TaskId(0), &generate);

        assert!(matches!(
            engine.run(&graph),
            Err(EngineError::Setup(msg)) if msg.contains("No outgoing node")
        ));
    }

    #[test]
    fn test_task_error_is_returned() {
        let engine = LocalEngine::new();
        let small = task(&engine, "generate", Properties::new().with("width", 4).with("height", 4));
        let large = task(&engine, "generate", Properties::new().with("width", 8).with("height", 8));
        let dark = task(&engine, "generate", Properties::new().with("width", 8).with("height", 8));
        let ffc = task(&engine, "flat_field_correction", Properties::new());
        let null = task(&engine, "null", Properties::new());

        let mut graph = TaskGraph::new();
        let s = graph.add_task(TaskId(0), &small);
        let l = graph.add_task(TaskId(1), &large);
        let d = graph.add_task(TaskId(2), &dark);
        let f = graph.add_task(TaskId(3), &ffc);
        let n = graph.add_task(TaskId(4), &null);
        graph.connect(s, f, 0).unwrap();
        graph.connect(d, f, 1).unwrap();
        graph.connect(l, f, 2).unwrap();
        graph.connect_default(f, n).unwrap();

        assert!(matches!(
            engine.run(&graph),
            Err(EngineError::Task { ref task, .. }) if task == "flat_field_correction"
        ));
    }
}
