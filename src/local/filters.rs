//! Built-in tasks of the local engine.

use anyhow::{bail, ensure};
use rayon::prelude::*;

use crate::buffer::Buffer;
use crate::core::Value;

use super::LocalEngine;
use super::filter::{Emitter, Filter, PropertyError, boolean, float, string, uint};

pub(crate) fn register(engine: &mut LocalEngine) {
    engine
        .register("generate", boxed::<Generate>)
        .register("null", boxed::<Null>)
        .register("averager", boxed::<Averager>)
        .register("buffer", boxed::<Collect>)
        .register("transpose", boxed::<Transpose>)
        .register("stack", boxed::<Stack>)
        .register("flatten_inplace", boxed::<FlattenInplace>)
        .register("flat_field_correction", boxed::<FlatFieldCorrection>);
}

pub(crate) fn boxed<F: Filter + Default + 'static>() -> Box<dyn Filter> {
    Box::new(F::default())
}

fn same_dims(task: &str, a: &Buffer, b: &Buffer) -> anyhow::Result<()> {
    ensure!(
        a.dims() == b.dims(),
        "{task} inputs must have the same size, got {:?} and {:?}",
        a.dims(),
        b.dims()
    );
    Ok(())
}

/// Emits `number` images of `height` x `width`, filled with `value`.
struct Generate {
    number: usize,
    width: usize,
    height: usize,
    value: f32,
}

impl Default for Generate {
    fn default() -> Self {
        Self {
            number: 1,
            width: 512,
            height: 512,
            value: 0.0,
        }
    }
}

impl Filter for Generate {
    fn set_property(&mut self, key: &str, value: &Value) -> Result<(), PropertyError> {
        match key {
            "number" => self.number = uint(value)?,
            "width" => self.width = uint(value)?,
            "height" => self.height = uint(value)?,
            "value" => self.value = float(value)?,
            _ => return Err(PropertyError::Unknown),
        }
        Ok(())
    }

    fn num_inputs(&self) -> usize {
        0
    }

    fn generate(&mut self, out: &mut Emitter<'_>) -> anyhow::Result<()> {
        for _ in 0..self.number {
            if !out.emit(Buffer::filled(&[self.height, self.width], self.value)) {
                break;
            }
        }
        Ok(())
    }

    fn process(&mut self, _: &[&Buffer], _: &mut Emitter<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Consumes and discards its input.
#[derive(Default)]
struct Null;

impl Filter for Null {
    fn set_property(&mut self, _: &str, _: &Value) -> Result<(), PropertyError> {
        Err(PropertyError::Unknown)
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn process(&mut self, _: &[&Buffer], _: &mut Emitter<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Averages a whole stream and emits the mean `number` times.
#[derive(Default)]
struct Averager {
    number: Option<usize>,
    sum: Option<Buffer>,
    count: usize,
}

impl Filter for Averager {
    fn set_property(&mut self, key: &str, value: &Value) -> Result<(), PropertyError> {
        match key {
            "number" => self.number = Some(uint(value)?),
            _ => return Err(PropertyError::Unknown),
        }
        Ok(())
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn setup(&mut self) -> anyhow::Result<()> {
        self.sum = None;
        self.count = 0;
        Ok(())
    }

    fn process(&mut self, inputs: &[&Buffer], _: &mut Emitter<'_>) -> anyhow::Result<()> {
        let input = inputs[0];

        match &mut self.sum {
            Some(sum) => {
                same_dims("averager", sum, input)?;
                sum.as_mut_slice()
                    .par_iter_mut()
                    .zip(input.as_slice().par_iter())
                    .for_each(|(acc, x)| *acc += x);
            }
            None => self.sum = Some(input.clone()),
        }

        self.count += 1;
        Ok(())
    }

    fn flush(&mut self, out: &mut Emitter<'_>) -> anyhow::Result<()> {
        let Some(mut mean) = self.sum.take() else {
            return Ok(());
        };

        let count = self.count as f32;
        mean.as_mut_slice().par_iter_mut().for_each(|x| *x /= count);

        for _ in 0..self.number.unwrap_or(1) {
            if !out.emit(mean.clone()) {
                break;
            }
        }
        Ok(())
    }
}

/// Holds back a whole stream and releases it in order once it has ended.
#[derive(Default)]
struct Collect {
    items: Vec<Buffer>,
}

impl Filter for Collect {
    fn set_property(&mut self, key: &str, value: &Value) -> Result<(), PropertyError> {
        match key {
            "number" => self.items.reserve(uint(value)?),
            _ => return Err(PropertyError::Unknown),
        }
        Ok(())
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn setup(&mut self) -> anyhow::Result<()> {
        self.items.clear();
        Ok(())
    }

    fn process(&mut self, inputs: &[&Buffer], _: &mut Emitter<'_>) -> anyhow::Result<()> {
        self.items.push(inputs[0].clone());
        Ok(())
    }

    fn flush(&mut self, out: &mut Emitter<'_>) -> anyhow::Result<()> {
        for item in self.items.drain(..) {
            if !out.emit(item) {
                break;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct Transpose;

impl Filter for Transpose {
    fn set_property(&mut self, _: &str, _: &Value) -> Result<(), PropertyError> {
        Err(PropertyError::Unknown)
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn process(&mut self, inputs: &[&Buffer], out: &mut Emitter<'_>) -> anyhow::Result<()> {
        let input = inputs[0];

        let Some((width, height)) = input.extent() else {
            bail!("transpose expects 2D input, got {:?}", input.dims());
        };

        let src = input.as_slice();
        let mut output = Buffer::zeros(&[width, height]);

        output
            .as_mut_slice()
            .par_chunks_mut(height.max(1))
            .enumerate()
            .for_each(|(x, row)| {
                for (y, value) in row.iter_mut().enumerate() {
                    *value = src[y * width + x];
                }
            });

        out.emit(output);
        Ok(())
    }
}

/// Groups `number` consecutive items into one buffer with an extra, slowest
/// varying dimension.
struct Stack {
    number: usize,
    stack: Option<Buffer>,
    current: usize,
}

impl Default for Stack {
    fn default() -> Self {
        Self {
            number: 1,
            stack: None,
            current: 0,
        }
    }
}

impl Filter for Stack {
    fn set_property(&mut self, key: &str, value: &Value) -> Result<(), PropertyError> {
        match key {
            "number" => {
                let number = uint(value)?;
                if number == 0 {
                    return Err(PropertyError::Invalid("must be at least 1".into()));
                }
                self.number = number;
            }
            _ => return Err(PropertyError::Unknown),
        }
        Ok(())
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn setup(&mut self) -> anyhow::Result<()> {
        self.stack = None;
        self.current = 0;
        Ok(())
    }

    fn process(&mut self, inputs: &[&Buffer], out: &mut Emitter<'_>) -> anyhow::Result<()> {
        let input = inputs[0];
        let size = input.len();

        let stack = self.stack.get_or_insert_with(|| {
            let mut dims = vec![self.number];
            dims.extend_from_slice(input.dims());
            Buffer::zeros(&dims)
        });

        ensure!(
            stack.dims()[1..] == *input.dims(),
            "stack inputs must have the same size, got {:?} and {:?}",
            &stack.dims()[1..],
            input.dims()
        );

        let slot = self.current % self.number;
        stack.as_mut_slice()[slot * size..(slot + 1) * size].copy_from_slice(input.as_slice());
        self.current += 1;

        if self.current % self.number == 0 {
            out.emit(stack.clone());
        }

        Ok(())
    }

    /// A partial last stack is still emitted; its tail keeps the items of the
    /// previous stack.
    fn flush(&mut self, out: &mut Emitter<'_>) -> anyhow::Result<()> {
        if self.current % self.number != 0
            && let Some(stack) = self.stack.take()
        {
            out.emit(stack);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Mode {
    #[default]
    Sum,
    Min,
    Max,
}

/// Reduces a stream element-wise into a single image.
#[derive(Default)]
struct FlattenInplace {
    mode: Mode,
    result: Option<Buffer>,
}

impl Filter for FlattenInplace {
    fn set_property(&mut self, key: &str, value: &Value) -> Result<(), PropertyError> {
        match key {
            "mode" => {
                self.mode = match string(value)?.as_str() {
                    "sum" => Mode::Sum,
                    "min" => Mode::Min,
                    "max" => Mode::Max,
                    other => {
                        return Err(PropertyError::Invalid(format!(
                            "unknown mode `{other}`, expected sum, min or max"
                        )));
                    }
                }
            }
            _ => return Err(PropertyError::Unknown),
        }
        Ok(())
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn setup(&mut self) -> anyhow::Result<()> {
        self.result = None;
        Ok(())
    }

    fn process(&mut self, inputs: &[&Buffer], _: &mut Emitter<'_>) -> anyhow::Result<()> {
        let input = inputs[0];

        let result = match &mut self.result {
            Some(result) => result,
            None => {
                self.result = Some(input.clone());
                return Ok(());
            }
        };

        same_dims("flatten_inplace", result, input)?;

        let op: fn(f32, f32) -> f32 = match self.mode {
            Mode::Sum => |acc: f32, x: f32| acc + x,
            Mode::Min => f32::min,
            Mode::Max => f32::max,
        };

        result
            .as_mut_slice()
            .par_iter_mut()
            .zip(input.as_slice().par_iter())
            .for_each(|(acc, &x)| *acc = op(*acc, x));

        Ok(())
    }

    fn flush(&mut self, out: &mut Emitter<'_>) -> anyhow::Result<()> {
        if let Some(result) = self.result.take() {
            out.emit(result);
        }
        Ok(())
    }
}

/// `(projection - dark) / (flat - dark)` over three inputs, optionally
/// followed by `-ln` for absorption images.
struct FlatFieldCorrection {
    absorption_correct: bool,
    dark_scale: f32,
    flat_scale: f32,
}

impl Default for FlatFieldCorrection {
    fn default() -> Self {
        Self {
            absorption_correct: false,
            dark_scale: 1.0,
            flat_scale: 1.0,
        }
    }
}

impl Filter for FlatFieldCorrection {
    fn set_property(&mut self, key: &str, value: &Value) -> Result<(), PropertyError> {
        match key {
            "absorption_correct" => self.absorption_correct = boolean(value)?,
            "dark_scale" => self.dark_scale = float(value)?,
            "flat_scale" => self.flat_scale = float(value)?,
            _ => return Err(PropertyError::Unknown),
        }
        Ok(())
    }

    fn num_inputs(&self) -> usize {
        3
    }

    fn process(&mut self, inputs: &[&Buffer], out: &mut Emitter<'_>) -> anyhow::Result<()> {
        let [projection, dark, flat] = inputs else {
            bail!("flat_field_correction expects 3 inputs, got {}", inputs.len());
        };

        same_dims("flat_field_correction", projection, dark)?;
        same_dims("flat_field_correction", projection, flat)?;

        let (dark_scale, flat_scale) = (self.dark_scale, self.flat_scale);
        let absorption = self.absorption_correct;
        let mut output = Buffer::zeros(projection.dims());

        output
            .as_mut_slice()
            .par_iter_mut()
            .zip(projection.as_slice().par_iter())
            .zip(dark.as_slice().par_iter().zip(flat.as_slice().par_iter()))
            .for_each(|((value, &p), (&d, &f))| {
                let d = d * dark_scale;
                let corrected = (p - d) / (f * flat_scale - d);
                *value = if absorption { -corrected.ln() } else { corrected };
            });

        out.emit(output);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crossbeam_channel::Receiver;

    use super::*;

    fn run(filter: &mut dyn Filter, stream: &[Vec<Buffer>]) -> Vec<Buffer> {
        let (tx, rx): (_, Receiver<Arc<Buffer>>) = crossbeam_channel::unbounded();
        let outputs = [tx];
        let mut out = Emitter::new(&outputs);

        filter.setup().unwrap();

        if stream.is_empty() {
            filter.generate(&mut out).unwrap();
        } else {
            for row in stream {
                let refs: Vec<&Buffer> = row.iter().collect();
                filter.process(&refs, &mut out).unwrap();
            }
            filter.flush(&mut out).unwrap();
        }

        drop(outputs);
        rx.iter().map(|b| (*b).clone()).collect()
    }

    fn single(items: &[Buffer]) -> Vec<Vec<Buffer>> {
        items.iter().map(|b| vec![b.clone()]).collect()
    }

    #[test]
    fn test_generate() {
        let mut generate = Generate::default();
        generate.set_property("number", &Value::Int(10)).unwrap();
        generate.set_property("width", &Value::Int(256)).unwrap();
        generate.set_property("height", &Value::Int(128)).unwrap();

        let result = run(&mut generate, &[]);

        assert_eq!(result.len(), 10);
        assert!(result.iter().all(|r| r.dims() == [128, 256]));
    }

    #[test]
    fn test_averager() {
        let (a, b) = (1.5, 2.5);
        let items = [Buffer::filled(&[512, 512], a), Buffer::filled(&[512, 512], b)];

        let result = run(&mut Averager::default(), &single(&items));

        assert_eq!(result.len(), 1);
        assert!(result[0].as_slice().iter().all(|&x| x == (a + b) / 2.0));
    }

    #[test]
    fn test_averager_rejects_size_change() {
        let mut averager = Averager::default();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let outputs = [tx];
        let mut out = Emitter::new(&outputs);

        averager.process(&[&Buffer::zeros(&[2, 2])], &mut out).unwrap();
        assert!(averager.process(&[&Buffer::zeros(&[3, 3])], &mut out).is_err());
    }

    #[test]
    fn test_buffer_keeps_order() {
        let items: Vec<_> = (0..10).map(|i| Buffer::filled(&[256, 512], i as f32)).collect();

        let result = run(&mut Collect::default(), &single(&items));

        assert_eq!(result, items);
    }

    #[test]
    fn test_transpose() {
        let input = Buffer::from_vec(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();

        let result = run(&mut Transpose, &single(&[input]));

        assert_eq!(result[0].dims(), &[3, 2]);
        assert_eq!(result[0].as_slice(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_stack() {
        let (a, b) = (1.5, 2.5);
        let items = [Buffer::filled(&[4, 4], a), Buffer::filled(&[4, 4], b)];

        let mut stack = Stack::default();
        stack.set_property("number", &Value::Int(2)).unwrap();
        let result = run(&mut stack, &single(&items));

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].dims(), &[2, 4, 4]);
        assert!(result[0].as_slice()[..16].iter().all(|&x| x == a));
        assert!(result[0].as_slice()[16..].iter().all(|&x| x == b));
    }

    #[test]
    fn test_stack_partial_flush() {
        let items: Vec<_> = (0..3).map(|i| Buffer::filled(&[2], i as f32)).collect();

        let mut stack = Stack::default();
        stack.set_property("number", &Value::Int(2)).unwrap();
        let result = run(&mut stack, &single(&items));

        assert_eq!(result.len(), 2);
        assert_eq!(result[1].as_slice(), &[2.0, 2.0, 1.0, 1.0]);
    }

    #[test]
    fn test_flatten_modes() {
        let items = [Buffer::filled(&[8, 8], 1.5), Buffer::filled(&[8, 8], 2.5)];

        for (mode, expected) in [("sum", 4.0), ("min", 1.5), ("max", 2.5)] {
            let mut flatten = FlattenInplace::default();
            flatten.set_property("mode", &Value::from(mode)).unwrap();

            let result = run(&mut flatten, &single(&items));
            assert!(result[0].as_slice().iter().all(|&x| x == expected), "{mode}");
        }

        let mut flatten = FlattenInplace::default();
        assert!(matches!(
            flatten.set_property("mode", &Value::from("median")),
            Err(PropertyError::Invalid(_))
        ));
    }

    #[test]
    fn test_flat_field_correction() {
        let dark = Buffer::filled(&[16, 16], 1.5);
        let flat = Buffer::filled(&[16, 16], 11.5);
        let proj = Buffer::filled(&[16, 16], 100.0);
        let expected = (100.0f32 - 1.5) / (11.5 - 1.5);
        let rows = vec![vec![proj.clone(), dark.clone(), flat.clone()]; 2];

        let result = run(&mut FlatFieldCorrection::default(), &rows);
        assert_eq!(result.len(), 2);
        assert!(result[0].as_slice().iter().all(|&x| (x - expected).abs() < 1e-4));

        let mut ffc = FlatFieldCorrection::default();
        ffc.set_property("absorption_correct", &Value::Bool(true)).unwrap();
        let result = run(&mut ffc, &rows);
        assert!(result[0].as_slice().iter().all(|&x| (x + expected.ln()).abs() < 1e-4));
    }
}
