use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::buffer::Buffer;
use crate::engine::{Engine, InputProxy};
use crate::env::Environment;
use crate::error::{EngineError, Error};

/// Spawns the feeder thread for one data invocation.
///
/// The thread parks until a run starts after this call, then pushes row `k`
/// of every stream before row `k + 1` of any, and finally stops every input.
/// If the environment is never run the thread never wakes up.
pub(crate) fn spawn<E: Engine>(
    env: Arc<Environment<E>>,
    task: &str,
    inputs: Vec<E::Input>,
    streams: Vec<Vec<Buffer>>,
) -> Result<JoinHandle<()>, Error> {
    let epoch = env.runs();
    let task = task.to_string();

    thread::Builder::new()
        .name(format!("feeder-{task}"))
        .spawn(move || {
            let poll = env.options().get_start_poll();

            while !env.is_started() || env.runs() == epoch {
                thread::sleep(poll);
            }

            drop(env);
            feed(&task, &inputs, streams);
        })
        .map_err(|err| Error::Engine(EngineError::Io(err)))
}

/// Pushes the zipped rows of `streams` into `inputs`, slot by slot.
///
/// The first buffer of each input is handed over as is. Every later one is
/// written into a buffer the node gave back, so steady-state feeding does not
/// allocate.
fn feed<I: InputProxy>(task: &str, inputs: &[I], streams: Vec<Vec<Buffer>>) {
    let mut streams: Vec<_> = streams.into_iter().map(Vec::into_iter).collect();
    let mut primed = vec![false; inputs.len()];
    let mut rows = 0;

    'rows: while !inputs.is_empty() {
        for (slot, (input, stream)) in inputs.iter().zip(streams.iter_mut()).enumerate() {
            let Some(data) = stream.next() else {
                break 'rows;
            };

            let buffer = if primed[slot] {
                match input.current_buffer() {
                    Ok(mut buffer) => {
                        buffer.copy_from(&data);
                        buffer
                    }
                    Err(err) => {
                        tracing::warn!(task, slot, "feeding aborted: {err}");
                        break 'rows;
                    }
                }
            } else {
                primed[slot] = true;
                data
            };

            input.release_buffer(buffer);
        }

        rows += 1;
    }

    for input in inputs {
        input.stop();
    }

    tracing::debug!(task, rows, "feeder finished");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::config::Options;
    use crate::local::{Kind, LocalEngine};

    #[derive(Default)]
    struct Recorder {
        released: Mutex<Vec<Vec<f32>>>,
        pool: Mutex<Vec<Buffer>>,
        recycled: Mutex<usize>,
        stopped: Mutex<bool>,
        closed: bool,
    }

    impl InputProxy for Recorder {
        fn current_buffer(&self) -> Result<Buffer, EngineError> {
            if self.closed {
                return Err(EngineError::Closed);
            }

            *self.recycled.lock().unwrap() += 1;
            self.pool.lock().unwrap().pop().ok_or(EngineError::Closed)
        }

        fn release_buffer(&self, buffer: Buffer) {
            self.released.lock().unwrap().push(buffer.as_slice().to_vec());
            self.pool.lock().unwrap().push(buffer);
        }

        fn stop(&self) {
            *self.stopped.lock().unwrap() = true;
        }
    }

    fn rows(values: &[f32]) -> Vec<Buffer> {
        values.iter().map(|&v| Buffer::filled(&[1, 2], v)).collect()
    }

    #[test]
    fn test_rows_in_order_with_reuse() {
        let inputs = [Recorder::default(), Recorder::default()];

        feed("ffc", &inputs, vec![rows(&[1.0, 2.0, 3.0]), rows(&[4.0, 5.0, 6.0])]);

        let first: Vec<f32> = inputs[0].released.lock().unwrap().iter().map(|b| b[0]).collect();
        let second: Vec<f32> = inputs[1].released.lock().unwrap().iter().map(|b| b[0]).collect();

        assert_eq!(first, vec![1.0, 2.0, 3.0]);
        assert_eq!(second, vec![4.0, 5.0, 6.0]);

        for input in &inputs {
            assert_eq!(*input.recycled.lock().unwrap(), 2);
            assert!(*input.stopped.lock().unwrap());
        }
    }

    #[test]
    fn test_empty_streams_only_stop() {
        let inputs = [Recorder::default()];

        feed("averager", &inputs, vec![Vec::new()]);

        assert!(inputs[0].released.lock().unwrap().is_empty());
        assert!(*inputs[0].stopped.lock().unwrap());
    }

    #[test]
    fn test_closed_input_aborts() {
        let inputs = [Recorder {
            closed: true,
            ..Recorder::default()
        }];

        feed("averager", &inputs, vec![rows(&[1.0, 2.0, 3.0])]);

        assert_eq!(inputs[0].released.lock().unwrap().len(), 1);
        assert!(*inputs[0].stopped.lock().unwrap());
    }

    /// A feeder for one single-item stream, and a count of what it queued.
    fn feeder(env: &Arc<Environment<LocalEngine>>) -> (JoinHandle<()>, impl Fn() -> usize) {
        let (node, input) = env.engine().create_input().unwrap();
        let Kind::Input(queues) = node.kind() else {
            unreachable!("input proxies are input nodes");
        };
        let queues = queues.clone();

        let stream = vec![Buffer::filled(&[2, 2], 1.0)];
        let handle = spawn(env.clone(), "averager", vec![input], vec![stream]).unwrap();
        (handle, move || queues.queued())
    }

    #[test]
    fn test_spawned_feeder_waits_for_next_run() {
        let options = Options::default().start_poll(Duration::from_millis(1));
        let env = Arc::new(Environment::new(LocalEngine::new(), options));

        let (first, queued) = feeder(&env);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(queued(), 0);

        env.run().unwrap().join().unwrap();
        first.join().unwrap();
        assert_eq!(queued(), 1);

        // `started` is still set from the finished run.
        let (second, queued) = feeder(&env);
        thread::sleep(Duration::from_millis(50));
        assert!(env.is_started());
        assert_eq!(queued(), 0);

        env.run().unwrap().join().unwrap();
        second.join().unwrap();
        assert_eq!(queued(), 1);
    }
}
