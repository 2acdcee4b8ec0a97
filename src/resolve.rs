//! Resolution of friendly task names.
//!
//! A reference such as `"ufo.FlatFieldCorrection"` is reduced to its last
//! segment and split on CamelCase boundaries into the engine's canonical
//! identifier, `"flat_field_correction"`. The identifier is then looked up in
//! the table of names the engine exposed when the session was created.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::core::Properties;
use crate::engine::Engine;
use crate::env::Environment;
use crate::error::Error;
use crate::handle::TaskHandle;

/// An uppercase letter starting a lowercase word, preceded by anything.
static WORD_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(.)([A-Z][a-z]+)").expect("valid regex"));

/// A lowercase letter or digit followed by an uppercase letter.
static LOWER_UPPER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([a-z0-9])([A-Z])").expect("valid regex"));

/// Converts a CamelCase identifier into a lowercase, underscore separated one.
///
/// Embedded acronyms stay together: `"FFTPlanner"` becomes `"fft_planner"`.
pub fn canonical_name(identifier: &str) -> String {
    let pass = WORD_START.replace_all(identifier, "${1}_${2}");
    let pass = LOWER_UPPER.replace_all(&pass, "${1}_${2}");
    pass.to_lowercase()
}

/// The last segment of a dotted reference.
fn last_segment(reference: &str) -> &str {
    reference.rsplit('.').next().unwrap_or(reference)
}

/// Immutable snapshot of the task identifiers an engine exposes.
#[derive(Debug, Clone, Default)]
pub struct NameTable {
    names: HashMap<String, String>,
}

impl NameTable {
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            names: names.into_iter().map(|name| (name.clone(), name)).collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Sorted identifiers.
    pub fn names(&self) -> BTreeSet<&str> {
        self.names.values().map(String::as_str).collect()
    }

    /// Maps a dotted CamelCase reference to its canonical identifier.
    pub fn lookup(&self, reference: &str) -> Result<&str, Error> {
        let canonical = canonical_name(last_segment(reference));

        match self.names.get(&canonical) {
            Some(name) => Ok(name),
            None => Err(Error::NotFound {
                reference: reference.to_string(),
                canonical,
            }),
        }
    }
}

/// Creates handles for one resolved task identifier.
pub struct TaskFactory<E: Engine> {
    env: Arc<Environment<E>>,
    name: Arc<str>,
}

impl<E: Engine> TaskFactory<E> {
    pub(crate) fn new(env: Arc<Environment<E>>, name: &str) -> Self {
        Self {
            env,
            name: Arc::from(name),
        }
    }

    /// The canonical identifier.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instantiates a new engine task. The properties are stored on the
    /// handle and only applied when it is invoked.
    pub fn create(&self, properties: impl Into<Properties>) -> Result<TaskHandle<E>, Error> {
        let task = self.env.engine().create_task(&self.name)?;
        Ok(TaskHandle::new(
            self.env.clone(),
            self.name.clone(),
            task,
            properties.into(),
        ))
    }
}

impl<E: Engine> Clone for TaskFactory<E> {
    fn clone(&self) -> Self {
        Self {
            env: self.env.clone(),
            name: self.name.clone(),
        }
    }
}
