///! HTTP client for the remote Node, reached through the reverse tunnel
///!
///! The tunnel forwards a fixed local port to the Node API, so every call
///! targets localhost. Transient transport errors are retried; HTTP errors
///! from the Node are not.

use serde::{Deserialize, Serialize};
use skybridge_common::Result;
use std::time::Duration;
use tracing::{info, warn};

/// Payload for the Node's backup start endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeBackupRequest {
    pub vm_name: String,
    pub vcenter_host: String,
    pub vcenter_user: String,
    pub vcenter_password: String,
    pub vm_path: String,
    pub nbd_host: String,
    pub nbd_targets: String,
    pub job_id: String,
    pub backup_type: String,
    pub previous_change_id: String,
}

/// Payload for the Node's replication start endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReplicationRequest {
    pub vm_name: String,
    pub vcenter_host: String,
    pub vcenter_user: String,
    pub vcenter_password: String,
    pub vm_path: String,
    pub job_id: String,
    pub previous_change_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeProgress {
    #[serde(default)]
    pub bytes_transferred: i64,
    #[serde(default)]
    pub progress_percent: f64,
    #[serde(default)]
    pub current_phase: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Clone)]
pub struct NodeClient {
    client: reqwest::Client,
    base_url: String,
    retry_attempts: u32,
}

impl NodeClient {
    pub fn new(tunnel_port: u16, request_timeout: Duration, retry_attempts: u32) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .unwrap_or_default(),
            base_url: format!("http://localhost:{}/api/v1", tunnel_port),
            retry_attempts: retry_attempts.max(1),
        }
    }

    /// Instruct the Node to start streaming dirty blocks into the prepared
    /// NBD targets. Accepts 200 or 202 from the Node.
    pub async fn start_backup(&self, request: &NodeBackupRequest) -> Result<()> {
        let url = format!("{}/backup/start", self.base_url);
        info!(
            "Dispatching backup of '{}' to node ({} targets)",
            request.vm_name,
            request.nbd_targets.split(',').count()
        );

        let response = self.post_with_retry(&url, request).await?;
        let status = response.status();

        if status == reqwest::StatusCode::OK || status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(skybridge_common::Error::RemoteUnavailable(format!(
            "node rejected backup start ({}): {}",
            status, body
        )))
    }

    /// Kick off a replication sync on the Node
    pub async fn start_replication(&self, request: &NodeReplicationRequest) -> Result<()> {
        let url = format!("{}/replication/start", self.base_url);
        info!("Dispatching replication of '{}' to node", request.vm_name);

        let response = self.post_with_retry(&url, request).await?;
        let status = response.status();

        if status == reqwest::StatusCode::OK || status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(skybridge_common::Error::RemoteUnavailable(format!(
            "node rejected replication start ({}): {}",
            status, body
        )))
    }

    /// Proxy a progress lookup for a job the Node is executing
    pub async fn job_progress(&self, job_id: &str) -> Result<NodeProgress> {
        let url = format!("{}/progress/{}", self.base_url, job_id);

        let response = self.client.get(&url).send().await.map_err(|e| {
            skybridge_common::Error::RemoteUnavailable(format!("node unreachable: {}", e))
        })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(skybridge_common::Error::NotFound(format!(
                "node has no progress for job '{}'",
                job_id
            )));
        }
        if !response.status().is_success() {
            return Err(skybridge_common::Error::RemoteUnavailable(format!(
                "node progress lookup failed: {}",
                response.status()
            )));
        }

        response.json().await.map_err(|e| {
            skybridge_common::Error::System(format!("invalid node progress payload: {}", e))
        })
    }

    /// Power the source VM off ahead of a live cutover
    pub async fn power_off_source(&self, vm_name: &str, vm_path: &str) -> Result<()> {
        let url = format!("{}/vm/power-off", self.base_url);
        let body = serde_json::json!({ "vm_name": vm_name, "vm_path": vm_path });

        let response = self.post_with_retry(&url, &body).await?;
        if response.status().is_success() {
            info!("Source VM '{}' powered off", vm_name);
            return Ok(());
        }

        Err(skybridge_common::Error::RemoteUnavailable(format!(
            "node failed to power off '{}': {}",
            vm_name,
            response.status()
        )))
    }

    /// Power the source VM back on after a rollback
    pub async fn power_on_source(&self, vm_name: &str, vm_path: &str) -> Result<()> {
        let url = format!("{}/vm/power-on", self.base_url);
        let body = serde_json::json!({ "vm_name": vm_name, "vm_path": vm_path });

        let response = self.post_with_retry(&url, &body).await?;
        if response.status().is_success() {
            info!("Source VM '{}' powered on", vm_name);
            return Ok(());
        }

        Err(skybridge_common::Error::RemoteUnavailable(format!(
            "node failed to power on '{}': {}",
            vm_name,
            response.status()
        )))
    }

    /// POST with bounded retries on transport errors only; an HTTP response
    /// of any status ends the retry loop.
    async fn post_with_retry<B: Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let mut last_error = None;

        for attempt in 1..=self.retry_attempts {
            match self.client.post(url).json(body).send().await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(
                        "Node call attempt {}/{} failed: {}",
                        attempt, self.retry_attempts, e
                    );
                    last_error = Some(e);
                    if attempt < self.retry_attempts {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }

        Err(skybridge_common::Error::RemoteUnavailable(format!(
            "node unreachable after {} attempts: {}",
            self.retry_attempts,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string())
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_base_url() {
        let client = NodeClient::new(9081, Duration::from_secs(5), 3);
        assert_eq!(client.base_url, "http://localhost:9081/api/v1");
    }

    #[test]
    fn test_backup_request_serialization() {
        let request = NodeBackupRequest {
            vm_name: "pgtest1".to_string(),
            vcenter_host: "vcenter.lab".to_string(),
            vcenter_user: "administrator@vsphere.local".to_string(),
            vcenter_password: "secret".to_string(),
            vm_path: "/DC1/vm/pgtest1".to_string(),
            nbd_host: "127.0.0.1".to_string(),
            nbd_targets: "2000:nbd://127.0.0.1:10100/backup-pgtest1-disk0".to_string(),
            job_id: "backup-pgtest1-001".to_string(),
            backup_type: "full".to_string(),
            previous_change_id: "PLACEHOLDER".to_string(),
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["previous_change_id"], "PLACEHOLDER");
        assert_eq!(json["nbd_host"], "127.0.0.1");
        assert!(json["nbd_targets"].as_str().unwrap().starts_with("2000:nbd://"));
    }

    #[test]
    fn test_retry_floor() {
        let client = NodeClient::new(9081, Duration::from_secs(5), 0);
        assert_eq!(client.retry_attempts, 1);
    }
}
