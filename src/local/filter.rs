use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::buffer::Buffer;
use crate::core::Value;

/// Why a filter refused a property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyError {
    Unknown,
    Invalid(String),
}

/// The processing logic of a task of the local engine.
///
/// Filters without inputs are sources: [`Filter::generate`] is their only
/// entry point. Every other filter gets one [`Filter::process`] call per set
/// of inputs, followed by a single [`Filter::flush`] once its inputs end.
pub trait Filter: Send {
    fn set_property(&mut self, key: &str, value: &Value) -> Result<(), PropertyError>;

    fn num_inputs(&self) -> usize;

    /// Clears per-run state. Called before every run.
    fn setup(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn generate(&mut self, _out: &mut Emitter<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn process(&mut self, inputs: &[&Buffer], out: &mut Emitter<'_>) -> anyhow::Result<()>;

    fn flush(&mut self, _out: &mut Emitter<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Broadcasts results to every outgoing edge of a node.
pub struct Emitter<'a> {
    outputs: &'a [Sender<Arc<Buffer>>],
    emitted: usize,
    closed: bool,
}

impl<'a> Emitter<'a> {
    pub(crate) fn new(outputs: &'a [Sender<Arc<Buffer>>]) -> Self {
        Self {
            outputs,
            emitted: 0,
            closed: false,
        }
    }

    /// Sends `buffer` downstream. Returns `false` once no consumer is left.
    pub fn emit(&mut self, buffer: Buffer) -> bool {
        if self.closed {
            return false;
        }

        let buffer = Arc::new(buffer);
        let delivered = self
            .outputs
            .iter()
            .filter(|output| output.send(buffer.clone()).is_ok())
            .count();

        if delivered == 0 && !self.outputs.is_empty() {
            self.closed = true;
        }

        self.emitted += 1;
        !self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }
}

pub(crate) fn uint(value: &Value) -> Result<usize, PropertyError> {
    value
        .as_u64()
        .map(|v| v as usize)
        .ok_or_else(|| invalid("an unsigned integer", value))
}

pub(crate) fn float(value: &Value) -> Result<f32, PropertyError> {
    value
        .as_f64()
        .map(|v| v as f32)
        .ok_or_else(|| invalid("a number", value))
}

pub(crate) fn boolean(value: &Value) -> Result<bool, PropertyError> {
    value.as_bool().ok_or_else(|| invalid("a boolean", value))
}

pub(crate) fn string(value: &Value) -> Result<String, PropertyError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid("a string", value))
}

fn invalid(expected: &str, value: &Value) -> PropertyError {
    PropertyError::Invalid(format!("expected {expected}, got {} `{value}`", value.kind()))
}
