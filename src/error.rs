use thiserror::Error;

/// Errors surfaced to users of the fluent API.
///
/// Build-time variants (`NotFound`, `InvalidInvocation`, `UnknownProperty`,
/// `Engine`) are returned synchronously, before any background thread is
/// started. `EngineFailure` only ever reaches the caller that joins a run or
/// drains its results.
#[derive(Debug, Error)]
pub enum Error {
    #[error("No task named '{reference}' (looked up as '{canonical}')")]
    NotFound { reference: String, canonical: String },

    #[error("Invalid invocation of '{task}': {reason}")]
    InvalidInvocation { task: String, reason: String },

    #[error("Task '{task}' has no property '{property}'")]
    UnknownProperty { task: String, property: String },

    #[error("Engine rejected the request:\n{0}")]
    Engine(EngineError),

    #[error("Run failed:\n{0}")]
    EngineFailure(EngineError),
}

impl Error {
    pub(crate) fn invocation(task: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidInvocation {
            task: task.into(),
            reason: reason.into(),
        }
    }
}

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::UnknownProperty { task, property } => {
                Error::UnknownProperty { task, property }
            }
            err => Error::Engine(err),
        }
    }
}

/// Errors raised across the engine boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    #[error("Task '{task}' has no property '{property}'")]
    UnknownProperty { task: String, property: String },

    #[error("Invalid value for '{task}.{property}': {reason}")]
    InvalidValue {
        task: String,
        property: String,
        reason: String,
    },

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Task '{task}':\n{source}")]
    Task {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Input node is closed")]
    Closed,

    #[error("Scheduler panicked: {0}")]
    Panicked(String),
}

/// Wiring errors reported by [`TaskGraph`](crate::TaskGraph).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("input slot {slot} of '{task}' is already connected")]
    SlotTaken { task: String, slot: usize },

    #[error("'{0}' cannot be connected to itself")]
    SelfLoop(String),

    #[error("input slot {slot} of '{task}' is not connected")]
    MissingSlot { task: String, slot: usize },

    #[error("cycle detected at '{0}'")]
    Cycle(String),
}

impl GraphError {
    pub(crate) fn task(&self) -> &str {
        match self {
            GraphError::SlotTaken { task, .. } => task,
            GraphError::SelfLoop(task) => task,
            GraphError::MissingSlot { task, .. } => task,
            GraphError::Cycle(task) => task,
        }
    }
}

impl From<GraphError> for Error {
    fn from(err: GraphError) -> Self {
        Error::invocation(err.task(), err.to_string())
    }
}

/// Formats a panic payload caught from a background thread.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_property_is_lifted() {
        let err: Error = EngineError::UnknownProperty {
            task: "generate".into(),
            property: "colour".into(),
        }
        .into();

        assert!(matches!(
            err,
            Error::UnknownProperty { ref task, ref property } if task == "generate" && property == "colour"
        ));
    }

    #[test]
    fn test_other_engine_errors_stay_wrapped() {
        let err: Error = EngineError::Setup("no devices".into()).into();
        assert!(matches!(err, Error::Engine(EngineError::Setup(_))));
    }

    #[test]
    fn test_graph_error_becomes_invalid_invocation() {
        let err: Error = GraphError::SlotTaken {
            task: "ffc".into(),
            slot: 0,
        }
        .into();

        match err {
            Error::InvalidInvocation { task, reason } => {
                assert_eq!(task, "ffc");
                assert!(reason.contains("slot 0"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");

        let payload: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown payload");
    }
}
