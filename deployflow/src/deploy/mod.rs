//! The deploy API: updating a live function's code with a build artifact.

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::HttpFunctionDeployer;

use crate::core::{ArtifactLocation, Revision};
use crate::errors::DeployError;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Identity of the deployed function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionIdentity {
    /// Function name, as used by the deploy API.
    pub name: String,
    /// Resource identifier the credential scope grants access to.
    pub resource_id: String,
}

impl FunctionIdentity {
    /// Creates an identity whose resource id is `function:{name}`.
    ///
    /// # Errors
    ///
    /// Returns `DeployError::InvalidFunction` if the name is not 1-64
    /// characters of `[A-Za-z0-9_-]`.
    pub fn new(name: impl Into<String>) -> Result<Self, DeployError> {
        let name = name.into();
        if !is_valid_function_name(&name) {
            return Err(DeployError::InvalidFunction { name });
        }
        let resource_id = format!("function:{name}");
        Ok(Self { name, resource_id })
    }

    /// Overrides the resource identifier (e.g. a full ARN).
    #[must_use]
    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = resource_id.into();
        self
    }
}

impl fmt::Display for FunctionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn is_valid_function_name(name: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

/// A single `updateFunctionCode` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    /// The function to update.
    pub function: FunctionIdentity,
    /// Where the new code lives.
    pub artifact_location: ArtifactLocation,
    /// Digest of the new code bundle.
    pub artifact_digest: String,
    /// The revision the code was built from.
    pub revision: Revision,
    /// The principal making the call.
    pub principal: String,
}

/// Acknowledgement returned by the deploy API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployAck {
    /// The function that was updated.
    pub function: String,
    /// Version identifier assigned by the compute runtime.
    pub version: String,
    /// Digest of the code now live.
    pub code_digest: String,
    /// When the update was acknowledged (ISO 8601).
    pub acknowledged_at: String,
}

impl DeployAck {
    /// Creates an acknowledgement for a request.
    #[must_use]
    pub fn for_request(request: &DeployRequest, version: impl Into<String>) -> Self {
        Self {
            function: request.function.name.clone(),
            version: version.into(),
            code_digest: request.artifact_digest.clone(),
            acknowledged_at: crate::utils::iso_timestamp(),
        }
    }
}

/// What happened to the deploy step of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeployOutcome {
    /// The build declared no deploy step, or never reached it.
    #[default]
    NotAttempted,
    /// The function was updated.
    Deployed {
        /// The acknowledgement from the deploy API.
        ack: DeployAck,
    },
    /// The deploy call was made and failed.
    Failed {
        /// Why it failed.
        reason: String,
    },
}

impl DeployOutcome {
    /// Returns true if the function was updated.
    #[must_use]
    pub fn is_deployed(&self) -> bool {
        matches!(self, Self::Deployed { .. })
    }
}

/// Client for the external "update function code" API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FunctionDeployer: Send + Sync + fmt::Debug {
    /// Points the function at new code.
    async fn update_function_code(&self, request: &DeployRequest) -> Result<DeployAck, DeployError>;
}
