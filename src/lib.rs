#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod bridge;
mod buffer;
mod config;
mod core;
pub mod engine;
mod env;
mod error;
mod graph;
mod handle;
pub mod local;
mod resolve;
mod session;
#[cfg(feature = "logging")]
pub mod utils;

pub use crate::bridge::Items;
pub use crate::buffer::{Buffer, ShapeError};
pub use crate::config::Options;
pub use crate::core::{Properties, TaskId, Value};
pub use crate::engine::{Engine, EngineTask, FinishedCallback, InputProxy, OutputProxy};
pub use crate::env::{Environment, Run, RunState};
pub use crate::error::{EngineError, Error, GraphError};
pub use crate::graph::{Edge, TaskGraph};
pub use crate::handle::{Arg, Arguments, TaskHandle};
pub use crate::resolve::{NameTable, TaskFactory, canonical_name};
pub use crate::session::Session;
