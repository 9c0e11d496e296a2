//! Event sink trait and implementations.

use crate::core::{PipelineEvent, TransitionEvent};
use tracing::{info, warn};

/// Receives the events of pipeline executions.
///
/// The controller reports pipeline, stage and action transitions; the build
/// executor reports phase transitions, cache degradation and deploy
/// outcomes. Emission happens inline on the execution's task, so sinks must
/// return quickly and must never panic.
pub trait EventSink: Send + Sync {
    /// Delivers one event.
    fn emit(&self, event: &PipelineEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _event: &PipelineEvent) {}
}

/// Forwards events to `tracing`.
///
/// Failures and cache degradation are logged at warn, everything else at info.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, event: &PipelineEvent) {
        let event_type = event.event_type();
        match event {
            PipelineEvent::Transition(t) if event.is_problem() => warn!(
                event_type = %event_type,
                execution_id = %t.execution_id,
                name = %t.name,
                duration_ms = t.duration_ms,
                error = t.error.as_deref().unwrap_or_default(),
                "Event: {event_type}"
            ),
            PipelineEvent::Transition(t) => info!(
                event_type = %event_type,
                execution_id = %t.execution_id,
                name = %t.name,
                duration_ms = t.duration_ms,
                "Event: {event_type}"
            ),
            PipelineEvent::CacheUnavailable {
                execution_id,
                phase,
                operation,
                reason,
            } => warn!(
                event_type = %event_type,
                execution_id = %execution_id,
                phase = %phase,
                operation = %operation,
                reason = %reason,
                "Event: {event_type}"
            ),
            PipelineEvent::Deployed {
                execution_id,
                function,
                version,
                artifact,
            } => info!(
                event_type = %event_type,
                execution_id = %execution_id,
                function = %function,
                version = %version,
                artifact = %artifact,
                "Event: {event_type}"
            ),
            PipelineEvent::DeployFailed {
                execution_id,
                function,
                error,
            } => warn!(
                event_type = %event_type,
                execution_id = %execution_id,
                function = %function,
                error = %error,
                "Event: {event_type}"
            ),
        }
    }
}

/// Keeps every event in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<PipelineEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events, in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.read().clone()
    }

    /// Returns the collected status transitions, in emission order.
    #[must_use]
    pub fn transitions(&self) -> Vec<TransitionEvent> {
        self.events
            .read()
            .iter()
            .filter_map(|event| match event {
                PipelineEvent::Transition(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns the events whose type starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<PipelineEvent> {
        self.events
            .read()
            .iter()
            .filter(|event| event.event_type().starts_with(type_prefix))
            .cloned()
            .collect()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event: &PipelineEvent) {
        self.events.write().push(event.clone());
    }
}
