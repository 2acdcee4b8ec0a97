use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::buffer::Buffer;
use crate::engine::Engine;
use crate::env::{Environment, Run};
use crate::error::Error;

/// Results of a run, in the order the output node finished them.
///
/// Iteration keeps going while the run is in progress or results are still
/// queued. Once the run is done it is joined; if it failed the error is
/// yielded once and iteration ends. Dropping the iterator early still waits
/// for the run to finish.
pub struct Items<E: Engine> {
    env: Arc<Environment<E>>,
    run: Option<Run>,
    results: Receiver<Buffer>,
    timeout: Duration,
    exhausted: bool,
    _output: E::Output,
}

impl<E: Engine> Items<E> {
    pub(crate) fn new(
        env: Arc<Environment<E>>,
        run: Run,
        results: Receiver<Buffer>,
        output: E::Output,
    ) -> Self {
        let timeout = env.options().get_drain_timeout();

        Self {
            env,
            run: Some(run),
            results,
            timeout,
            exhausted: false,
            _output: output,
        }
    }

    /// Whether the run behind this iterator is still going.
    pub fn is_running(&self) -> bool {
        self.run.as_ref().is_some_and(|run| !run.is_finished())
    }

    fn finish(&mut self) -> Result<(), Error> {
        match self.run.take() {
            Some(run) => run.join(),
            None => Ok(()),
        }
    }
}

impl<E: Engine> Iterator for Items<E> {
    type Item = Result<Buffer, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        loop {
            let done = match &self.run {
                Some(run) => self.env.is_done() || run.is_finished(),
                None => true,
            };

            if done {
                if let Err(err) = self.finish() {
                    self.exhausted = true;
                    return Some(Err(err));
                }

                // Every callback has fired by now, whatever is queued is all
                // there is.
                return match self.results.try_recv() {
                    Ok(buffer) => Some(Ok(buffer)),
                    Err(_) => {
                        self.exhausted = true;
                        None
                    }
                };
            }

            match self.results.recv_timeout(self.timeout) {
                Ok(buffer) => return Some(Ok(buffer)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    if let Err(err) = self.finish() {
                        self.exhausted = true;
                        return Some(Err(err));
                    }
                }
            }
        }
    }
}

impl<E: Engine> Drop for Items<E> {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            tracing::warn!("dropped results of a failed run: {err}");
        }
    }
}
