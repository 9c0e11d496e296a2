//! Event sinks for pipeline observability.
//!
//! Sinks are passed explicitly to the components that emit into them; there
//! is no process-wide listener.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
