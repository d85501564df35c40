//! Client for the cloud control plane that owns the pod.
//!
//! The control plane is the source of truth for whether the pod exists and
//! is running; local state is only an optimistic cache between polls. The
//! `ControlPlane` trait is the seam the monitor loops are written against,
//! so they can be exercised with a mock.

use crate::config::ControlPlaneConfig;
use crate::state::SshEndpoint;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors from control-plane operations. All of these are transient from
/// the monitor loops' point of view: logged and retried after a backoff.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("control plane request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("control plane returned {status}: {body}")]
    Api { status: u16, body: String },
}

/// A pod as reported by the control plane.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    pub id: String,
    pub name: String,
    pub desired_status: String,
    pub runtime: Option<PodRuntime>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRuntime {
    #[serde(default)]
    pub ports: Vec<PortMapping>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub ip: String,
    pub private_port: u16,
    pub public_port: u16,
}

impl Pod {
    pub fn is_running(&self) -> bool {
        self.desired_status == "RUNNING"
    }

    /// Resolve the public SSH endpoint: the runtime port mapping whose
    /// private port is 22. None until the runtime has published its ports.
    pub fn ssh_endpoint(&self) -> Option<SshEndpoint> {
        self.runtime
            .as_ref()?
            .ports
            .iter()
            .find(|p| p.private_port == 22)
            .map(|p| SshEndpoint {
                ip: p.ip.clone(),
                port: p.public_port,
            })
    }
}

/// The control-plane operations the monitor loops depend on.
pub trait ControlPlane: Send + Sync + 'static {
    /// Look up the pod by name. `Ok(None)` means it does not exist.
    fn find_pod(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<Pod>, ControlPlaneError>> + Send;

    /// Create the pod from the configured template.
    fn create_pod(
        &self,
        name: &str,
        template_id: &str,
    ) -> impl Future<Output = Result<(), ControlPlaneError>> + Send;

    /// Resume an existing stopped pod.
    fn resume_pod(&self, id: &str) -> impl Future<Output = Result<(), ControlPlaneError>> + Send;

    /// Terminate the pod. Billing stops here; this must not be graceful.
    fn terminate_pod(&self, id: &str)
        -> impl Future<Output = Result<(), ControlPlaneError>> + Send;
}

#[derive(Debug, Serialize)]
struct CreatePodRequest<'a> {
    name: &'a str,
    template_id: &'a str,
}

/// REST implementation of [`ControlPlane`].
pub struct ControlPlaneClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl ControlPlaneClient {
    pub fn new(config: &ControlPlaneConfig) -> Result<Self, ControlPlaneError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ControlPlaneError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ControlPlaneError::Api {
            status: status.as_u16(),
            body,
        })
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, ControlPlaneError> {
        let response = self
            .http
            .get(format!("{}/pods", self.api_base))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}

impl ControlPlane for ControlPlaneClient {
    fn find_pod(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<Pod>, ControlPlaneError>> + Send {
        async move {
            let pods = self.list_pods().await?;
            Ok(pods.into_iter().find(|p| p.name == name))
        }
    }

    fn create_pod(
        &self,
        name: &str,
        template_id: &str,
    ) -> impl Future<Output = Result<(), ControlPlaneError>> + Send {
        async move {
            debug!(name, template_id, "creating pod");
            let response = self
                .http
                .post(format!("{}/pods", self.api_base))
                .bearer_auth(&self.api_key)
                .json(&CreatePodRequest { name, template_id })
                .send()
                .await?;
            Self::check(response).await?;
            Ok(())
        }
    }

    fn resume_pod(&self, id: &str) -> impl Future<Output = Result<(), ControlPlaneError>> + Send {
        async move {
            debug!(id, "resuming pod");
            let response = self
                .http
                .post(format!("{}/pods/{}/start", self.api_base, id))
                .bearer_auth(&self.api_key)
                .send()
                .await?;
            Self::check(response).await?;
            Ok(())
        }
    }

    fn terminate_pod(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<(), ControlPlaneError>> + Send {
        async move {
            debug!(id, "terminating pod");
            let response = self
                .http
                .delete(format!("{}/pods/{}", self.api_base, id))
                .bearer_auth(&self.api_key)
                .send()
                .await?;
            Self::check(response).await?;
            Ok(())
        }
    }
}


#[cfg(test)]
mod tests {
    use super::mock::pod;

    #[test]
    fn test_ssh_endpoint_resolution() {
        let endpoint = pod(true, true).ssh_endpoint().unwrap();
        assert_eq!(endpoint.ip, "203.0.113.7");
        assert_eq!(endpoint.port, 41022);
    }

    #[test]
    fn test_ssh_endpoint_unavailable_without_runtime() {
        assert!(pod(true, false).ssh_endpoint().is_none());
    }

    #[test]
    fn test_is_running() {
        assert!(pod(true, false).is_running());
        assert!(!pod(false, false).is_running());
    }

    #[test]
    fn test_pod_deserialization() {
        let json = r#"{
            "id": "abc123",
            "name": "gpu-pod",
            "desiredStatus": "RUNNING",
            "runtime": {
                "ports": [
                    {"ip": "198.51.100.4", "privatePort": 22, "publicPort": 40022}
                ]
            }
        }"#;
        let pod: super::Pod = serde_json::from_str(json).unwrap();
        assert!(pod.is_running());
        let endpoint = pod.ssh_endpoint().unwrap();
        assert_eq!(endpoint.port, 40022);
    }

    #[test]
    fn test_pod_without_runtime_deserializes() {
        let json = r#"{"id": "abc123", "name": "gpu-pod", "desiredStatus": "EXITED", "runtime": null}"#;
        let pod: super::Pod = serde_json::from_str(json).unwrap();
        assert!(pod.runtime.is_none());
    }
}
