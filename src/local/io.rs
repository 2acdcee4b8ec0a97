//! File reader and writer tasks.

use std::sync::LazyLock;

use anyhow::{Context, anyhow, bail, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use image::{ImageBuffer, Luma};
use regex::{Captures, Regex};

use crate::buffer::Buffer;
use crate::core::Value;

use super::LocalEngine;
use super::filter::{Emitter, Filter, PropertyError, boolean, string, uint};
use super::filters::boxed;

const GLOB_OPTS: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: true,
};

/// `%i`, `%5i` or `%05i` in an output file name.
static COUNTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%(0)?(\d*)i").expect("valid regex"));

pub(crate) fn register(engine: &mut LocalEngine) {
    engine
        .register("read", boxed::<Read>)
        .register("write", boxed::<Write>);
}

/// Reads single-image files as 2D buffers.
///
/// `path` is either a directory, whose files are read in name order, or a
/// glob pattern. `start` skips that many files, `step` keeps every n-th of the
/// rest and `number` caps how many are read.
struct Read {
    path: Utf8PathBuf,
    start: usize,
    step: usize,
    number: Option<usize>,
}

impl Default for Read {
    fn default() -> Self {
        Self {
            path: Utf8PathBuf::from("."),
            start: 0,
            step: 1,
            number: None,
        }
    }
}

impl Read {
    fn files(&self) -> anyhow::Result<Vec<Utf8PathBuf>> {
        let mut files = if self.path.is_dir() {
            let mut files = Vec::new();
            for entry in self.path.read_dir_utf8()? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    files.push(entry.into_path());
                }
            }
            files
        } else {
            let mut files = Vec::new();
            for path in glob::glob_with(self.path.as_str(), GLOB_OPTS)? {
                let path = Utf8PathBuf::try_from(path?)?;
                if path.is_file() {
                    files.push(path);
                }
            }
            files
        };

        files.sort();

        Ok(files
            .into_iter()
            .skip(self.start)
            .step_by(self.step)
            .take(self.number.unwrap_or(usize::MAX))
            .collect())
    }
}

impl Filter for Read {
    fn set_property(&mut self, key: &str, value: &Value) -> Result<(), PropertyError> {
        match key {
            "path" => self.path = Utf8PathBuf::from(string(value)?),
            "start" => self.start = uint(value)?,
            "number" => self.number = Some(uint(value)?),
            "step" => {
                let step = uint(value)?;
                if step == 0 {
                    return Err(PropertyError::Invalid("must be at least 1".into()));
                }
                self.step = step;
            }
            _ => return Err(PropertyError::Unknown),
        }
        Ok(())
    }

    fn num_inputs(&self) -> usize {
        0
    }

    fn generate(&mut self, out: &mut Emitter<'_>) -> anyhow::Result<()> {
        let files = self.files()?;

        if files.is_empty() {
            tracing::warn!(path = %self.path, "no files to read");
        }

        for path in files {
            if !out.emit(load(&path)?) {
                break;
            }
        }

        Ok(())
    }

    fn process(&mut self, _: &[&Buffer], _: &mut Emitter<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

fn load(path: &Utf8Path) -> anyhow::Result<Buffer> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {path}"))?;
    let image = image::load_from_memory(&bytes)
        .with_context(|| format!("decoding {path}"))?
        .to_luma32f();

    let (width, height) = image.dimensions();
    Ok(Buffer::from_vec(
        &[height as usize, width as usize],
        image.into_raw(),
    )?)
}

/// Writes every 2D slice of its input to its own file.
///
/// A counter pattern in `filename` is replaced by the running image number;
/// without one, every image overwrites the same file.
struct Write {
    filename: String,
    counter_start: usize,
    counter_step: usize,
    bits: u8,
    rescale: bool,
    counter: usize,
}

impl Default for Write {
    fn default() -> Self {
        Self {
            filename: String::from("./output-%05i.tif"),
            counter_start: 0,
            counter_step: 1,
            bits: 16,
            rescale: true,
            counter: 0,
        }
    }
}

impl Write {
    fn path(&self) -> Utf8PathBuf {
        let name = COUNTER.replace_all(&self.filename, |caps: &Captures| {
            let width = caps[2].parse::<usize>().unwrap_or(0);
            match caps.get(1) {
                Some(_) => format!("{:0width$}", self.counter),
                None => format!("{:width$}", self.counter),
            }
        });

        Utf8PathBuf::from(name.as_ref())
    }

    fn save(
        &self,
        path: &Utf8Path,
        width: usize,
        height: usize,
        data: &[f32],
    ) -> anyhow::Result<()> {
        let (min, max) = data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &x| {
                (lo.min(x), hi.max(x))
            });

        let level = |x: f32, top: f32| {
            let x = if !self.rescale {
                x
            } else if max > min {
                (x - min) / (max - min) * top
            } else {
                0.0
            };
            x.clamp(0.0, top)
        };

        let (w, h) = (width as u32, height as u32);

        match self.bits {
            8 => {
                let pixels: Vec<u8> = data
                    .iter()
                    .map(|&x| level(x, u8::MAX as f32) as u8)
                    .collect();
                ImageBuffer::<Luma<u8>, _>::from_raw(w, h, pixels)
                    .ok_or_else(|| anyhow!("{width}x{height} does not match the data"))?
                    .save(path)?;
            }
            16 => {
                let pixels: Vec<u16> = data
                    .iter()
                    .map(|&x| level(x, u16::MAX as f32) as u16)
                    .collect();
                ImageBuffer::<Luma<u16>, _>::from_raw(w, h, pixels)
                    .ok_or_else(|| anyhow!("{width}x{height} does not match the data"))?
                    .save(path)?;
            }
            bits => bail!("unsupported bit depth {bits}"),
        }

        Ok(())
    }
}

impl Filter for Write {
    fn set_property(&mut self, key: &str, value: &Value) -> Result<(), PropertyError> {
        match key {
            "filename" => self.filename = string(value)?,
            "counter_start" => self.counter_start = uint(value)?,
            "counter_step" => self.counter_step = uint(value)?,
            "rescale" => self.rescale = boolean(value)?,
            "bits" => {
                self.bits = match uint(value)? {
                    8 => 8,
                    16 => 16,
                    other => {
                        return Err(PropertyError::Invalid(format!(
                            "{other} bits are not supported, use 8 or 16"
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
        self.counter = self.counter_start;
        Ok(())
    }

    fn process(&mut self, inputs: &[&Buffer], _: &mut Emitter<'_>) -> anyhow::Result<()> {
        let input = inputs[0];

        let (slices, height, width) = match *input.dims() {
            [height, width] => (1, height, width),
            [depth, height, width] => (depth, height, width),
            ref dims => bail!("write expects 2D or 3D input, got {dims:?}"),
        };

        ensure!(
            height * width > 0,
            "cannot write an empty image of {height}x{width}"
        );

        for slice in input.as_slice().chunks(height * width).take(slices) {
            let path = self.path();

            if let Some(parent) = path.parent()
                && !parent.as_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }

            self.save(&path, width, height, slice)
                .with_context(|| format!("writing {path}"))?;

            tracing::debug!(%path, "written");
            self.counter += self.counter_step;
        }

        Ok(())
    }
}
