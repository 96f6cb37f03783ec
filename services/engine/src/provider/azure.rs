//! Azure Resource Manager backend
//!
//! PUT a resource, then poll it with GET until it reaches a terminal
//! provisioning state. Polling stops at the configured timeout and the
//! resource is reported as still pending, never as failed.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::identity::TokenSource;
use super::{DesiredResource, ProvisionedResource, ProvisioningState, ResourceProvider};
use crate::error::ProvisionError;
use crate::topology::credentials::{CredentialKind, EncodedKubeconfig};
use crate::topology::ids::{ManagedClusterId, ResourceId, ResourceKind};

pub const DEFAULT_ENDPOINT: &str = "https://management.azure.com";

/// api-version per resource type
fn api_version(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::ResourceGroup => "2022-09-01",
        ResourceKind::VirtualNetwork | ResourceKind::Subnet | ResourceKind::VirtualNetworkPeering => {
            "2023-05-01"
        }
        ResourceKind::ManagedCluster | ResourceKind::ClusterCredentials => "2023-08-01",
        ResourceKind::RoleAssignment => "2022-04-01",
    }
}

#[derive(Debug, Clone)]
pub struct ArmSettings {
    pub endpoint: String,
    pub poll_interval: Duration,
    pub operation_timeout: Duration,
}

impl Default for ArmSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            poll_interval: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ArmErrorBody {
    error: ArmErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ArmErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct CredentialResults {
    #[serde(default)]
    kubeconfigs: Vec<EncodedKubeconfig>,
}

/// `"<code>: <message>"` from an ARM error body, or the raw body
fn error_message(body: &str) -> String {
    match serde_json::from_str::<ArmErrorBody>(body) {
        Ok(parsed) => format!("{}: {}", parsed.error.code, parsed.error.message),
        Err(_) if body.trim().is_empty() => "no response body".to_string(),
        Err(_) => body.trim().to_string(),
    }
}

pub struct ArmProvider {
    http_client: reqwest::Client,
    tokens: TokenSource,
    settings: ArmSettings,
}

impl ArmProvider {
    pub fn new(tokens: TokenSource, settings: ArmSettings) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            http_client,
            tokens,
            settings,
        })
    }

    fn url(&self, path: &str, kind: ResourceKind) -> String {
        format!(
            "{}{}?api-version={}",
            self.settings.endpoint.trim_end_matches('/'),
            path,
            api_version(kind)
        )
    }

    async fn send(
        &self,
        resource: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<(StatusCode, String), ProvisionError> {
        let token = self.tokens.token().await?;
        let response = request
            .bearer_auth(token.secret())
            .send()
            .await
            .map_err(|e| ProvisionError::Transport {
                resource: resource.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| ProvisionError::Transport {
            resource: resource.to_string(),
            message: format!("failed to read {} response body: {}", status, e),
        })?;
        Ok((status, body))
    }

    fn rejected(resource: &str, status: StatusCode, body: &str) -> ProvisionError {
        ProvisionError::Rejected {
            resource: resource.to_string(),
            status: status.as_u16(),
            message: error_message(body),
        }
    }

    fn parse(resource: &str, body: &str) -> Result<ProvisionedResource, ProvisionError> {
        let invalid = |message: String| ProvisionError::InvalidResponse {
            resource: resource.to_string(),
            message,
        };
        let value: serde_json::Value =
            serde_json::from_str(body).map_err(|e| invalid(format!("response is not JSON: {}", e)))?;
        ProvisionedResource::from_arm(&value).ok_or_else(|| invalid("response has no resource id".to_string()))
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<ProvisionedResource>, ProvisionError> {
        let resource = id.to_string();
        let url = self.url(&resource, id.kind());
        let (status, body) = self.send(&resource, self.http_client.get(&url)).await?;

        match status {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Self::parse(&resource, &body).map(Some),
            s => Err(Self::rejected(&resource, s, &body)),
        }
    }

    /// Poll until the resource reaches a terminal state or the timeout
    async fn wait_for_terminal(
        &self,
        id: &ResourceId,
        mut current: ProvisionedResource,
    ) -> Result<ProvisionedResource, ProvisionError> {
        let resource = id.to_string();
        let started = Instant::now();

        while !current.state.is_terminal() {
            if started.elapsed() >= self.settings.operation_timeout {
                warn!(resource = %resource, state = %current.state, "Operation still pending at timeout");
                return Err(ProvisionError::Pending {
                    resource,
                    state: current.state,
                    waited: started.elapsed(),
                });
            }

            tokio::time::sleep(self.settings.poll_interval).await;

            current = self.get(id).await?.ok_or_else(|| ProvisionError::InvalidResponse {
                resource: resource.clone(),
                message: "resource disappeared while provisioning".to_string(),
            })?;
            debug!(resource = %resource, state = %current.state, "Polled provisioning state");
        }

        match current.state {
            ProvisioningState::Succeeded => Ok(current),
            state => Err(ProvisionError::Failed { resource, state }),
        }
    }
}

#[async_trait]
impl ResourceProvider for ArmProvider {
    fn name(&self) -> &str {
        "azure-resource-manager"
    }

    async fn apply(&self, desired: &DesiredResource) -> Result<ProvisionedResource, ProvisionError> {
        let id = desired.id();
        let resource = id.to_string();
        let url = self.url(&resource, id.kind());

        let live = if desired.reads_before_put() {
            self.get(&id).await?
        } else {
            None
        };
        if let Some(current) = live.as_ref().filter(|current| desired.must_replace(current)) {
            warn!(resource = %resource, id = %current.id, "Replacing resource bound to a previous principal");
            self.delete(&id).await?;
        }

        info!(resource = %resource, "PUT");
        let request = self.http_client.put(&url).json(&desired.put_body(live.as_ref()));
        let (status, body) = self.send(&resource, request).await?;

        if !status.is_success() {
            return Err(Self::rejected(&resource, status, &body));
        }

        // 201/202 bodies may be empty for some resource types
        let current = match Self::parse(&resource, &body) {
            Ok(parsed) => parsed,
            Err(_) => self.get(&id).await?.ok_or_else(|| ProvisionError::InvalidResponse {
                resource: resource.clone(),
                message: "resource not found after PUT".to_string(),
            })?,
        };

        self.wait_for_terminal(&id, current).await
    }

    async fn read(&self, id: &ResourceId) -> Result<Option<ProvisionedResource>, ProvisionError> {
        self.get(id).await
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ProvisionError> {
        let resource = id.to_string();
        let url = self.url(&resource, id.kind());

        info!(resource = %resource, "DELETE");
        let (status, body) = self.send(&resource, self.http_client.delete(&url)).await?;

        if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
            return Ok(());
        }
        if !status.is_success() {
            return Err(Self::rejected(&resource, status, &body));
        }

        let started = Instant::now();
        loop {
            match self.get(id).await? {
                None => return Ok(()),
                Some(current) => {
                    if matches!(
                        current.state,
                        ProvisioningState::Failed | ProvisioningState::Canceled
                    ) {
                        return Err(ProvisionError::Failed {
                            resource,
                            state: current.state,
                        });
                    }
                    if started.elapsed() >= self.settings.operation_timeout {
                        return Err(ProvisionError::Pending {
                            resource,
                            state: current.state,
                            waited: started.elapsed(),
                        });
                    }
                }
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn list_credentials(
        &self,
        cluster: &ManagedClusterId,
        kind: CredentialKind,
    ) -> Result<Vec<EncodedKubeconfig>, ProvisionError> {
        let resource = cluster.to_string();
        let path = format!("{}/{}", resource, kind.action());
        let url = self.url(&path, ResourceKind::ClusterCredentials);

        debug!(cluster = %resource, kind = %kind, "Listing cluster credentials");
        let (status, body) = self.send(&resource, self.http_client.post(&url)).await?;

        if !status.is_success() {
            return Err(Self::rejected(&resource, status, &body));
        }

        let results: CredentialResults =
            serde_json::from_str(&body).map_err(|e| ProvisionError::InvalidResponse {
                resource: resource.clone(),
                message: format!("invalid credential listing: {}", e),
            })?;
        Ok(results.kubeconfigs)
    }
}
