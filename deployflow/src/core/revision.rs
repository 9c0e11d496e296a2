//! Source revisions and the trigger events that carry them.

use crate::errors::SourceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A commit reference in the source repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision(String);

impl Revision {
    /// Creates a revision, rejecting empty identifiers and whitespace.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::InvalidRevision` for malformed identifiers.
    pub fn new(revision: impl Into<String>) -> Result<Self, SourceError> {
        let revision = revision.into();
        if revision.is_empty() || revision.chars().any(char::is_whitespace) {
            return Err(SourceError::InvalidRevision(revision));
        }
        Ok(Self(revision))
    }

    /// Returns the revision as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Revision {
    type Error = SourceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Revision {
    type Error = SourceError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Revision> for String {
    fn from(value: Revision) -> Self {
        value.0
    }
}

/// A request to run the pipeline for a new source revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Unique id of this trigger.
    pub id: Uuid,
    /// The revision to build.
    pub revision: Revision,
    /// When the event was received (ISO 8601).
    pub received_at: String,
    /// Who or what raised the event (e.g. "push", "manual").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl TriggerEvent {
    /// Creates a trigger event for a revision.
    #[must_use]
    pub fn new(revision: Revision) -> Self {
        Self {
            id: crate::utils::generate_uuid(),
            revision,
            received_at: crate::utils::iso_timestamp(),
            origin: None,
        }
    }

    /// Sets the origin of the event.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}
