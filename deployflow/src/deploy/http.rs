//! HTTP client for a function deploy endpoint.

use super::{DeployAck, DeployRequest, FunctionDeployer};
use crate::errors::DeployError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Header carrying the calling principal.
pub const PRINCIPAL_HEADER: &str = "x-deploy-principal";

#[derive(Serialize)]
struct UpdateCodeBody<'a> {
    artifact_location: &'a str,
    artifact_digest: &'a str,
    revision: &'a str,
}

#[derive(Deserialize)]
struct UpdateCodeResponse {
    #[serde(default)]
    version: Option<String>,
}

/// Deploys by calling `PUT {endpoint}/functions/{name}/code`.
#[derive(Debug, Clone)]
pub struct HttpFunctionDeployer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpFunctionDeployer {
    /// Creates a deployer for `endpoint` with a request timeout.
    ///
    /// # Errors
    ///
    /// Returns `DeployError::Transport` if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, DeployError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeployError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, function: &str) -> String {
        format!("{}/functions/{function}/code", self.endpoint)
    }
}

#[async_trait]
impl FunctionDeployer for HttpFunctionDeployer {
    async fn update_function_code(&self, request: &DeployRequest) -> Result<DeployAck, DeployError> {
        let url = self.url(&request.function.name);
        let body = UpdateCodeBody {
            artifact_location: request.artifact_location.key(),
            artifact_digest: &request.artifact_digest,
            revision: request.revision.as_str(),
        };

        debug!(url = %url, function = %request.function, "Calling deploy API");
        let response = self
            .client
            .put(&url)
            .header(PRINCIPAL_HEADER, &request.principal)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeployError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(DeployError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: UpdateCodeResponse = response
            .json()
            .await
            .unwrap_or(UpdateCodeResponse { version: None });
        let version = parsed.version.unwrap_or_else(|| "$LATEST".to_string());
        info!(function = %request.function, version = %version, "Function code updated");
        Ok(DeployAck::for_request(request, version))
    }
}
