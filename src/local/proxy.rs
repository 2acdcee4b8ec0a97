//! Synthetic input and output nodes of the local engine.
//!
//! An input node is a two-way queue: the feeder pushes filled buffers into
//! `incoming`, the node copies each one downstream and hands the original
//! back through `recycled`, where the feeder picks it up to overwrite it.
//!
//! An output node copies every result into a pooled buffer, lends it to the
//! registered callbacks and returns it to the pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::buffer::Buffer;
use crate::engine::{FinishedCallback, InputProxy, OutputProxy};
use crate::error::EngineError;

use super::filter::Emitter;

const POP_TIMEOUT: Duration = Duration::from_millis(100);

pub(crate) struct InputQueues {
    incoming: (Sender<Buffer>, Receiver<Buffer>),
    recycled: (Sender<Buffer>, Receiver<Buffer>),
    active: AtomicBool,
    closed: AtomicBool,
}

impl InputQueues {
    pub(crate) fn new() -> Self {
        Self {
            incoming: crossbeam_channel::unbounded(),
            recycled: crossbeam_channel::unbounded(),
            active: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    /// Marks the node as gone. Blocked feeders fail with `Closed`.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Buffers released by the feeder and not yet forwarded.
    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.incoming.1.len()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Node side: forwards buffers until the feeder has stopped and the
    /// queue is empty. Returns the number of buffers forwarded.
    pub(crate) fn forward(&self, out: &mut Emitter<'_>) -> usize {
        let mut forwarded = 0;

        loop {
            match self.incoming.1.recv_timeout(POP_TIMEOUT) {
                Ok(buffer) => {
                    forwarded += 1;

                    if !out.emit(buffer.clone()) {
                        break;
                    }

                    let _ = self.recycled.0.send(buffer);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !self.active.load(Ordering::Acquire) && self.incoming.1.is_empty() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.close();
        forwarded
    }
}

/// Feeding side of a local input node.
pub struct LocalInput {
    queues: Arc<InputQueues>,
}

impl LocalInput {
    pub(crate) fn new(queues: Arc<InputQueues>) -> Self {
        Self { queues }
    }
}

impl InputProxy for LocalInput {
    fn current_buffer(&self) -> Result<Buffer, EngineError> {
        loop {
            if self.queues.is_closed() {
                return Err(EngineError::Closed);
            }

            match self.queues.recycled.1.recv_timeout(POP_TIMEOUT) {
                Ok(buffer) => return Ok(buffer),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(EngineError::Closed),
            }
        }
    }

    fn release_buffer(&self, buffer: Buffer) {
        let _ = self.queues.incoming.0.send(buffer);
    }

    fn stop(&self) {
        self.queues.active.store(false, Ordering::Release);
    }
}

#[derive(Default)]
pub(crate) struct OutputShared {
    callbacks: Mutex<Vec<FinishedCallback>>,
    pool: Mutex<Vec<Buffer>>,
}

impl OutputShared {
    /// Node side: reports one finished result to every callback.
    pub(crate) fn finish(&self, result: &Buffer) {
        let mut copy = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| Buffer::zeros(&[]));

        copy.copy_from(result);

        for callback in self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            callback(&copy);
        }

        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(copy);
    }
}

/// Consuming side of a local output node.
pub struct LocalOutput {
    shared: Arc<OutputShared>,
}

impl LocalOutput {
    pub(crate) fn new(shared: Arc<OutputShared>) -> Self {
        Self { shared }
    }
}

impl OutputProxy for LocalOutput {
    fn on_finished(&self, callback: FinishedCallback) {
        self.shared
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_input_round_trip() {
        let queues = Arc::new(InputQueues::new());
        let input = LocalInput::new(queues.clone());
        let (tx, rx) = crossbeam_channel::unbounded();

        let node = {
            let queues = queues.clone();
            thread::spawn(move || {
                let outputs = [tx];
                let mut out = Emitter::new(&outputs);
                queues.forward(&mut out)
            })
        };

        input.release_buffer(Buffer::filled(&[2], 1.0));
        let mut recycled = input.current_buffer().unwrap();
        recycled.copy_from(&Buffer::filled(&[2], 2.0));
        input.release_buffer(recycled);
        input.stop();

        assert_eq!(node.join().unwrap(), 2);

        let values: Vec<f32> = rx.iter().map(|b| b.as_slice()[0]).collect();
        assert_eq!(values, vec![1.0, 2.0]);
        assert!(matches!(input.current_buffer(), Err(EngineError::Closed)));
    }

    #[test]
    fn test_output_callbacks() {
        let shared = Arc::new(OutputShared::default());
        let output = LocalOutput::new(shared.clone());
        let (tx, rx) = crossbeam_channel::unbounded();

        output.on_finished(Box::new(move |buffer| {
            tx.send(buffer.mean()).unwrap();
        }));

        shared.finish(&Buffer::filled(&[4, 4], 1.5));
        shared.finish(&Buffer::filled(&[2, 2], 2.5));

        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![1.5, 2.5]);
        assert_eq!(shared.pool.lock().unwrap().len(), 1);
    }
}
