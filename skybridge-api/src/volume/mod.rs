///! RPC facade to the external Volume Daemon
///!
///! All daemon operations are asynchronous: the call returns an operation
///! handle and the caller awaits it with a bounded poll loop.

use serde::{Deserialize, Serialize};
use skybridge_common::Result;
use std::time::Duration;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Operation handle returned by every mutating daemon call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeOperation {
    pub operation_id: String,
    #[serde(default)]
    pub volume_id: Option<String>,
}

/// Polled operation state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStatus {
    pub operation_id: String,
    pub status: String,
    #[serde(default)]
    pub volume_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct CreateVolumeRequest<'a> {
    name: &'a str,
    size_gb: i64,
}

#[derive(Debug, Clone, Serialize)]
struct AttachVolumeRequest<'a> {
    vm_id: &'a str,
    device_id: i64,
}

/// Thin client for the Volume Daemon REST surface
#[derive(Clone)]
pub struct VolumeClient {
    client: reqwest::Client,
    base_url: String,
    default_timeout: Duration,
}

impl VolumeClient {
    pub fn new(base_url: &str, operation_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            default_timeout: operation_timeout,
        }
    }

    pub async fn create_volume(&self, name: &str, size_gb: i64) -> Result<VolumeOperation> {
        info!("Creating volume '{}' ({} GB)", name, size_gb);
        self.post(
            &format!("{}/volumes", self.base_url),
            &CreateVolumeRequest { name, size_gb },
        )
        .await
    }

    pub async fn attach_volume(
        &self,
        volume_id: &str,
        vm_id: &str,
        device_id: i64,
    ) -> Result<VolumeOperation> {
        info!(
            "Attaching volume {} to VM {} as device {}",
            volume_id, vm_id, device_id
        );
        self.post(
            &format!("{}/volumes/{}/attach", self.base_url, volume_id),
            &AttachVolumeRequest { vm_id, device_id },
        )
        .await
    }

    pub async fn detach_volume(&self, volume_id: &str) -> Result<VolumeOperation> {
        info!("Detaching volume {}", volume_id);
        self.post(
            &format!("{}/volumes/{}/detach", self.base_url, volume_id),
            &serde_json::json!({}),
        )
        .await
    }

    pub async fn delete_volume(&self, volume_id: &str) -> Result<VolumeOperation> {
        info!("Deleting volume {}", volume_id);
        let response = self
            .client
            .delete(format!("{}/volumes/{}", self.base_url, volume_id))
            .send()
            .await
            .map_err(|e| {
                skybridge_common::Error::RemoteUnavailable(format!(
                    "volume daemon unreachable: {}",
                    e
                ))
            })?;

        Self::decode(response).await
    }

    /// Await an operation with the daemon's default timeout
    pub async fn wait_for_completion(&self, operation_id: &str) -> Result<OperationStatus> {
        self.wait_for_completion_with_timeout(operation_id, self.default_timeout)
            .await
    }

    /// Poll the operation every 2 s until success, failure or deadline
    pub async fn wait_for_completion_with_timeout(
        &self,
        operation_id: &str,
        timeout: Duration,
    ) -> Result<OperationStatus> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let status = self.operation_status(operation_id).await?;
            debug!("Operation {} is {}", operation_id, status.status);

            match status.status.as_str() {
                "success" => return Ok(status),
                "failure" => {
                    return Err(skybridge_common::Error::System(format!(
                        "volume operation {} failed: {}",
                        operation_id,
                        status.error.unwrap_or_else(|| "unknown error".to_string())
                    )))
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(skybridge_common::Error::RemoteUnavailable(format!(
                    "volume operation {} timed out after {:?}",
                    operation_id, timeout
                )));
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn operation_status(&self, operation_id: &str) -> Result<OperationStatus> {
        let response = self
            .client
            .get(format!("{}/operations/{}", self.base_url, operation_id))
            .send()
            .await
            .map_err(|e| {
                skybridge_common::Error::RemoteUnavailable(format!(
                    "volume daemon unreachable: {}",
                    e
                ))
            })?;

        Self::decode(response).await
    }

    async fn post<B, T>(&self, url: &str, body: &B) -> Result<T>
    where
        B: Serialize,
        T: serde::de::DeserializeOwned,
    {
        let response = self.client.post(url).json(body).send().await.map_err(|e| {
            skybridge_common::Error::RemoteUnavailable(format!("volume daemon unreachable: {}", e))
        })?;

        Self::decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(skybridge_common::Error::System(format!(
                "volume daemon returned {}: {}",
                status, body
            )));
        }

        response.json().await.map_err(|e| {
            skybridge_common::Error::System(format!("invalid volume daemon response: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_decoding() {
        let op: VolumeOperation =
            serde_json::from_str(r#"{"operation_id":"op-1","volume_id":"vol-9"}"#).unwrap();
        assert_eq!(op.operation_id, "op-1");
        assert_eq!(op.volume_id.as_deref(), Some("vol-9"));

        // volume_id may be absent on detach/delete handles
        let op: VolumeOperation = serde_json::from_str(r#"{"operation_id":"op-2"}"#).unwrap();
        assert!(op.volume_id.is_none());
    }

    #[test]
    fn test_status_decoding() {
        let status: OperationStatus = serde_json::from_str(
            r#"{"operation_id":"op-1","status":"failure","error":"quota exceeded"}"#,
        )
        .unwrap();
        assert_eq!(status.status, "failure");
        assert_eq!(status.error.as_deref(), Some("quota exceeded"));
    }

    #[test]
    fn test_base_url_normalization() {
        let client = VolumeClient::new("http://localhost:8090/api/v1/", Duration::from_secs(10));
        assert_eq!(client.base_url, "http://localhost:8090/api/v1");
    }
}
