//! Streaming between host code and a running graph.
//!
//! The [`feeder`] pushes host buffers into synthetic input nodes once the run
//! has started. The [`drainer`] collects the results an output node reports
//! and hands them to the caller as an iterator.

pub mod drainer;
pub mod feeder;

pub use drainer::Items;
