//! Least-privilege credentials for the build environment.
//!
//! A [`CredentialScope`] is a static policy: one principal, one statement.
//! A [`DeployCapability`] is the only way the build executor can reach the
//! deploy API. It can only be built from a scope that grants exactly the
//! update-code action on exactly the target function.

use crate::core::Artifact;
use crate::deploy::{DeployAck, DeployRequest, FunctionDeployer, FunctionIdentity};
use crate::errors::{CredentialError, DeployError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// The action that updates a function's code.
pub const UPDATE_FUNCTION_CODE: &str = "function:UpdateFunctionCode";

/// A single allow statement: actions on resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatement {
    /// Granted actions.
    pub actions: Vec<String>,
    /// Resources the actions apply to.
    pub resources: Vec<String>,
}

impl PolicyStatement {
    /// Creates a statement.
    #[must_use]
    pub fn new(
        actions: impl IntoIterator<Item = impl Into<String>>,
        resources: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
            resources: resources.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if the statement allows `action` on `resource`.
    ///
    /// Matching is exact; wildcards are never expanded.
    #[must_use]
    pub fn allows(&self, action: &str, resource: &str) -> bool {
        self.actions.iter().any(|a| a == action) && self.resources.iter().any(|r| r == resource)
    }
}

/// Handle that revokes a scope independently of whoever holds it.
#[derive(Debug, Clone)]
pub struct RevocationHandle {
    principal: String,
    revoked: Arc<AtomicBool>,
}

impl RevocationHandle {
    /// Revokes the scope. Every later authorization fails.
    pub fn revoke(&self) {
        if !self.revoked.swap(true, Ordering::SeqCst) {
            warn!(principal = %self.principal, "Credential scope revoked");
        }
    }

    /// Returns true if the scope has been revoked.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }
}

/// A permission grant bound to a principal at provisioning time.
#[derive(Debug, Clone)]
pub struct CredentialScope {
    principal: String,
    statement: PolicyStatement,
    revoked: Arc<AtomicBool>,
    granted_at: String,
}

impl CredentialScope {
    /// Creates a scope from a statement.
    #[must_use]
    pub fn new(principal: impl Into<String>, statement: PolicyStatement) -> Self {
        Self {
            principal: principal.into(),
            statement,
            revoked: Arc::new(AtomicBool::new(false)),
            granted_at: crate::utils::iso_timestamp(),
        }
    }

    /// Creates the single-statement grant for updating one function's code.
    #[must_use]
    pub fn for_function_update(principal: impl Into<String>, function: &FunctionIdentity) -> Self {
        Self::new(
            principal,
            PolicyStatement::new([UPDATE_FUNCTION_CODE], [function.resource_id.clone()]),
        )
    }

    /// Returns the principal.
    #[must_use]
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Returns the statement.
    #[must_use]
    pub fn statement(&self) -> &PolicyStatement {
        &self.statement
    }

    /// Returns when the scope was granted (ISO 8601).
    #[must_use]
    pub fn granted_at(&self) -> &str {
        &self.granted_at
    }

    /// Returns a handle that can revoke this scope.
    #[must_use]
    pub fn revocation_handle(&self) -> RevocationHandle {
        RevocationHandle {
            principal: self.principal.clone(),
            revoked: Arc::clone(&self.revoked),
        }
    }

    /// Returns true if the scope has been revoked.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    /// Checks that `action` on `resource` is granted.
    ///
    /// # Errors
    ///
    /// Returns `CredentialError::Revoked` after revocation and
    /// `CredentialError::NotPermitted` for anything outside the statement.
    pub fn authorize(&self, action: &str, resource: &str) -> Result<(), CredentialError> {
        if self.is_revoked() {
            return Err(CredentialError::Revoked {
                principal: self.principal.clone(),
            });
        }
        if !self.statement.allows(action, resource) {
            return Err(CredentialError::NotPermitted {
                principal: self.principal.clone(),
                action: action.to_string(),
                resource: resource.to_string(),
            });
        }
        Ok(())
    }
}

/// The capability to update exactly one function's code.
#[derive(Debug, Clone)]
pub struct DeployCapability {
    scope: CredentialScope,
    function: FunctionIdentity,
    deployer: Arc<dyn FunctionDeployer>,
}

impl DeployCapability {
    /// Binds a scope to a target function and a deploy API client.
    ///
    /// # Errors
    ///
    /// Returns `CredentialError::ScopeTooBroad` unless the scope grants
    /// exactly [`UPDATE_FUNCTION_CODE`] on exactly `function`.
    pub fn new(
        scope: CredentialScope,
        function: FunctionIdentity,
        deployer: Arc<dyn FunctionDeployer>,
    ) -> Result<Self, CredentialError> {
        let statement = scope.statement();
        let too_broad = |reason: String| CredentialError::ScopeTooBroad { reason };

        if statement.actions != [UPDATE_FUNCTION_CODE] {
            return Err(too_broad(format!(
                "expected only '{UPDATE_FUNCTION_CODE}', got {:?}",
                statement.actions
            )));
        }
        if statement.resources != [function.resource_id.as_str()] {
            return Err(too_broad(format!(
                "expected only '{}', got {:?}",
                function.resource_id, statement.resources
            )));
        }

        Ok(Self {
            scope,
            function,
            deployer,
        })
    }

    /// Returns the target function.
    #[must_use]
    pub fn function(&self) -> &FunctionIdentity {
        &self.function
    }

    /// Returns the scope backing this capability.
    #[must_use]
    pub fn scope(&self) -> &CredentialScope {
        &self.scope
    }

    /// Updates the target function's code with `artifact`.
    ///
    /// # Errors
    ///
    /// Returns `DeployError::Unauthorized` if the scope no longer permits the
    /// call, or whatever the deploy API reports.
    pub async fn update_function_code(&self, artifact: &Artifact) -> Result<DeployAck, DeployError> {
        self.scope
            .authorize(UPDATE_FUNCTION_CODE, &self.function.resource_id)?;

        let request = DeployRequest {
            function: self.function.clone(),
            artifact_location: artifact.location.clone(),
            artifact_digest: artifact.digest.clone(),
            revision: artifact.revision.clone(),
            principal: self.scope.principal().to_string(),
        };
        info!(
            function = %self.function,
            principal = self.scope.principal(),
            artifact = %artifact.location,
            "Updating function code"
        );
        self.deployer.update_function_code(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ArtifactLocation, Revision};
    use crate::deploy::MockFunctionDeployer;

    fn function() -> FunctionIdentity {
        FunctionIdentity::new("s3Read").unwrap()
    }

    fn artifact() -> Artifact {
        Artifact::new(
            "BuildOutput",
            "Build",
            ArtifactLocation::new("sha256/feed"),
            "feed",
            Revision::new("abc123").unwrap(),
        )
    }

    #[test]
    fn test_authorize_exact_grant() {
        let scope = CredentialScope::for_function_update("build-role", &function());

        assert!(scope.authorize(UPDATE_FUNCTION_CODE, "function:s3Read").is_ok());
        assert!(matches!(
            scope.authorize(UPDATE_FUNCTION_CODE, "function:other"),
            Err(CredentialError::NotPermitted { .. })
        ));
        assert!(matches!(
            scope.authorize("function:DeleteFunction", "function:s3Read"),
            Err(CredentialError::NotPermitted { .. })
        ));
    }

    #[test]
    fn test_wildcards_are_not_expanded() {
        let statement = PolicyStatement::new(["function:*"], ["*"]);
        assert!(!statement.allows(UPDATE_FUNCTION_CODE, "function:s3Read"));
    }

    #[test]
    fn test_capability_rejects_broader_scopes() {
        let deployer: Arc<dyn FunctionDeployer> = Arc::new(MockFunctionDeployer::new());

        let two_actions = CredentialScope::new(
            "build-role",
            PolicyStatement::new(
                [UPDATE_FUNCTION_CODE, "function:DeleteFunction"],
                ["function:s3Read"],
            ),
        );
        let two_resources = CredentialScope::new(
            "build-role",
            PolicyStatement::new([UPDATE_FUNCTION_CODE], ["function:s3Read", "function:other"]),
        );
        let wrong_target = CredentialScope::new(
            "build-role",
            PolicyStatement::new([UPDATE_FUNCTION_CODE], ["function:other"]),
        );

        for scope in [two_actions, two_resources, wrong_target] {
            let result = DeployCapability::new(scope, function(), Arc::clone(&deployer));
            assert!(matches!(result, Err(CredentialError::ScopeTooBroad { .. })));
        }
    }

    #[tokio::test]
    async fn test_capability_calls_deployer_with_scoped_request() {
        let mut mock = MockFunctionDeployer::new();
        mock.expect_update_function_code()
            .withf(|req| {
                req.function.name == "s3Read"
                    && req.artifact_location.key() == "sha256/feed"
                    && req.revision.as_str() == "abc123"
                    && req.principal == "build-role"
            })
            .times(1)
            .returning(|req| Ok(DeployAck::for_request(req, "7")));

        let scope = CredentialScope::for_function_update("build-role", &function());
        let capability = DeployCapability::new(scope, function(), Arc::new(mock)).unwrap();

        let ack = capability.update_function_code(&artifact()).await.unwrap();
        assert_eq!(ack.version, "7");
        assert_eq!(ack.code_digest, "feed");
    }

    #[tokio::test]
    async fn test_revoked_scope_blocks_deploy() {
        let mut mock = MockFunctionDeployer::new();
        mock.expect_update_function_code().times(0);

        let scope = CredentialScope::for_function_update("build-role", &function());
        let handle = scope.revocation_handle();
        let capability = DeployCapability::new(scope, function(), Arc::new(mock)).unwrap();

        handle.revoke();
        assert!(handle.is_revoked());
        assert!(capability.scope().is_revoked());

        let err = capability.update_function_code(&artifact()).await.unwrap_err();
        assert!(matches!(
            err,
            DeployError::Unauthorized(CredentialError::Revoked { .. })
        ));
    }
}
