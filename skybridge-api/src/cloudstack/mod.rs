///! Thin adapter for the CloudStack-class IaaS API
///!
///! Wraps zones, networks, offerings, templates, virtual machines and
///! per-volume snapshots. Mutating calls return an async job id; the adapter
///! polls queryAsyncJobResult until a per-verb timeout. VM, volume and
///! snapshot state machines are not re-implemented here: `state` strings are
///! surfaced verbatim to callers.

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use skybridge_common::Result;
use std::time::Duration;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Observed async-job status mapping: 1 = success, 2 = failure. This inverts
/// the upstream documentation but matches deployed behavior; flagged for
/// operator review. Error text lives at jobresult.errortext.
const JOB_STATUS_PENDING: i64 = 0;
const JOB_STATUS_SUCCESS: i64 = 1;
const JOB_STATUS_FAILURE: i64 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub zoneid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceOffering {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub cpunumber: Option<i64>,
    #[serde(default)]
    pub memory: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskOffering {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub disksize: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    /// The one field with a documented quirky wire encoding; see
    /// `parse_templates` for the fallback path.
    #[serde(default)]
    pub ostypeid: Option<String>,
    #[serde(default)]
    pub ostypename: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsType {
    pub id: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: String,
    pub name: String,
    /// Surfaced verbatim: `Running`, `Stopped`, `Starting`, ...
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSnapshot {
    pub id: String,
    #[serde(default)]
    pub volumeid: Option<String>,
    /// Surfaced verbatim: `Created`, `BackedUp`, `Ready`, ...
    #[serde(default)]
    pub state: Option<String>,
}

/// Parameters for destination VM materialization
#[derive(Debug, Clone)]
pub struct DeployVmRequest {
    pub name: String,
    pub service_offering_id: String,
    pub template_id: String,
    pub zone_id: String,
    pub network_ids: Vec<String>,
    pub start_vm: bool,
}

#[derive(Clone)]
pub struct CloudStackClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    secret_key: String,
    create_timeout: Duration,
    delete_timeout: Duration,
    power_timeout: Duration,
}

impl CloudStackClient {
    pub fn new(config: &crate::config::CloudStackConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            create_timeout: Duration::from_secs(config.create_timeout_secs),
            delete_timeout: Duration::from_secs(config.delete_timeout_secs),
            power_timeout: Duration::from_secs(config.power_timeout_secs),
        }
    }

    // ---- listings -------------------------------------------------------

    pub async fn list_zones(&self) -> Result<Vec<Zone>> {
        let body = self.execute("listZones", &[]).await?;
        parse_list(&body, "zone")
    }

    pub async fn list_networks(&self, zone_id: Option<&str>) -> Result<Vec<Network>> {
        let mut params = Vec::new();
        if let Some(zone) = zone_id {
            params.push(("zoneid".to_string(), zone.to_string()));
        }
        let body = self.execute("listNetworks", &params).await?;
        parse_list(&body, "network")
    }

    pub async fn list_service_offerings(&self) -> Result<Vec<ServiceOffering>> {
        let body = self.execute("listServiceOfferings", &[]).await?;
        parse_list(&body, "serviceoffering")
    }

    pub async fn list_disk_offerings(&self) -> Result<Vec<DiskOffering>> {
        let body = self.execute("listDiskOfferings", &[]).await?;
        parse_list(&body, "diskoffering")
    }

    /// Templates carry the quirky `ostypeid` field: attempt the strict
    /// parse, then fall back to the minimal hand-rolled walk.
    pub async fn list_templates(&self) -> Result<Vec<Template>> {
        let params = [("templatefilter".to_string(), "executable".to_string())];
        let body = self.execute("listTemplates", &params).await?;
        parse_templates(&body)
    }

    pub async fn list_os_types(&self) -> Result<Vec<OsType>> {
        let body = self.execute("listOsTypes", &[]).await?;
        parse_list(&body, "ostype")
    }

    /// Resolve a catalog os type from a guest description. Template
    /// selection matches the returned id against template `ostypeid`s;
    /// when no entry resolves, callers fall back to name matching.
    pub async fn find_os_type_by_name(&self, description: &str) -> Result<Option<OsType>> {
        let needle = description.to_lowercase();
        let os_types = self.list_os_types().await?;
        Ok(os_types
            .into_iter()
            .find(|t| t.description.to_lowercase().contains(&needle)))
    }

    pub async fn get_virtual_machine(&self, vm_id: &str) -> Result<VirtualMachine> {
        let params = [("id".to_string(), vm_id.to_string())];
        let body = self.execute("listVirtualMachines", &params).await?;
        let vms: Vec<VirtualMachine> = parse_list(&body, "virtualmachine")?;
        vms.into_iter().next().ok_or_else(|| {
            skybridge_common::Error::NotFound(format!("destination VM '{}' not found", vm_id))
        })
    }

    pub async fn find_virtual_machine_by_name(&self, name: &str) -> Result<Option<VirtualMachine>> {
        let params = [("name".to_string(), name.to_string())];
        let body = self.execute("listVirtualMachines", &params).await?;
        let vms: Vec<VirtualMachine> = parse_list(&body, "virtualmachine")?;
        Ok(vms.into_iter().find(|vm| vm.name == name))
    }

    // ---- mutations ------------------------------------------------------

    /// Provision a destination VM; blocks on the async job and returns the
    /// materialized VM.
    pub async fn deploy_virtual_machine(&self, request: &DeployVmRequest) -> Result<VirtualMachine> {
        info!("Deploying destination VM '{}'", request.name);

        let mut params = vec![
            ("name".to_string(), request.name.clone()),
            ("displayname".to_string(), request.name.clone()),
            ("serviceofferingid".to_string(), request.service_offering_id.clone()),
            ("templateid".to_string(), request.template_id.clone()),
            ("zoneid".to_string(), request.zone_id.clone()),
            ("startvm".to_string(), request.start_vm.to_string()),
        ];
        if !request.network_ids.is_empty() {
            params.push(("networkids".to_string(), request.network_ids.join(",")));
        }

        let body = self.execute("deployVirtualMachine", &params).await?;
        let job_id = extract_job_id(&body)?;
        let result = self.await_job(&job_id, self.create_timeout).await?;

        serde_json::from_value(result["virtualmachine"].clone()).map_err(|e| {
            skybridge_common::Error::System(format!("unparseable deploy result: {}", e))
        })
    }

    /// Destroy a destination VM, expunging its root volume
    pub async fn destroy_virtual_machine(&self, vm_id: &str) -> Result<()> {
        info!("Destroying destination VM {}", vm_id);

        let params = [
            ("id".to_string(), vm_id.to_string()),
            ("expunge".to_string(), "true".to_string()),
        ];
        let body = self.execute("destroyVirtualMachine", &params).await?;
        let job_id = extract_job_id(&body)?;
        self.await_job(&job_id, self.delete_timeout).await?;
        Ok(())
    }

    pub async fn start_virtual_machine(&self, vm_id: &str) -> Result<()> {
        info!("Starting VM {}", vm_id);

        let params = [("id".to_string(), vm_id.to_string())];
        let body = self.execute("startVirtualMachine", &params).await?;
        let job_id = extract_job_id(&body)?;
        self.await_job(&job_id, self.power_timeout).await?;
        Ok(())
    }

    pub async fn stop_virtual_machine(&self, vm_id: &str, forced: bool) -> Result<()> {
        info!("Stopping VM {} (forced: {})", vm_id, forced);

        let params = [
            ("id".to_string(), vm_id.to_string()),
            ("forced".to_string(), forced.to_string()),
        ];
        let body = self.execute("stopVirtualMachine", &params).await?;
        let job_id = extract_job_id(&body)?;
        self.await_job(&job_id, self.power_timeout).await?;
        Ok(())
    }

    /// Per-volume snapshot used as failover rollback protection
    pub async fn create_volume_snapshot(&self, volume_id: &str) -> Result<VolumeSnapshot> {
        info!("Creating snapshot of volume {}", volume_id);

        let params = [("volumeid".to_string(), volume_id.to_string())];
        let body = self.execute("createSnapshot", &params).await?;
        let job_id = extract_job_id(&body)?;
        let result = self.await_job(&job_id, self.create_timeout).await?;

        serde_json::from_value(result["snapshot"].clone()).map_err(|e| {
            skybridge_common::Error::System(format!("unparseable snapshot result: {}", e))
        })
    }

    pub async fn delete_volume_snapshot(&self, snapshot_id: &str) -> Result<()> {
        info!("Deleting volume snapshot {}", snapshot_id);

        let params = [("id".to_string(), snapshot_id.to_string())];
        let body = self.execute("deleteSnapshot", &params).await?;
        let job_id = extract_job_id(&body)?;
        self.await_job(&job_id, self.delete_timeout).await?;
        Ok(())
    }

    // ---- plumbing -------------------------------------------------------

    /// Execute a signed API call and unwrap the `<command>response` envelope
    async fn execute(
        &self,
        command: &str,
        params: &[(String, String)],
    ) -> Result<serde_json::Value> {
        let mut all: Vec<(String, String)> = vec![
            ("command".to_string(), command.to_string()),
            ("apiKey".to_string(), self.api_key.clone()),
            ("response".to_string(), "json".to_string()),
        ];
        all.extend_from_slice(params);

        let signature = sign_request(&all, &self.secret_key);
        all.push(("signature".to_string(), signature));

        debug!("CloudStack call: {}", command);

        let response = self
            .client
            .get(&self.api_url)
            .query(&all)
            .send()
            .await
            .map_err(|e| {
                skybridge_common::Error::RemoteUnavailable(format!("CloudStack unreachable: {}", e))
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            skybridge_common::Error::RemoteUnavailable(format!("CloudStack read failed: {}", e))
        })?;

        if !status.is_success() {
            return Err(skybridge_common::Error::System(format!(
                "CloudStack {} returned {}: {}",
                command, status, text
            )));
        }

        let value: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            skybridge_common::Error::System(format!("invalid CloudStack response: {}", e))
        })?;

        Ok(unwrap_envelope(value))
    }

    /// Poll queryAsyncJobResult every 2 s until the job resolves or the
    /// per-verb deadline passes. Returns the jobresult object on success.
    async fn await_job(&self, job_id: &str, timeout: Duration) -> Result<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let params = [("jobid".to_string(), job_id.to_string())];
            let body = match self.execute("queryAsyncJobResult", &params).await {
                Ok(body) => body,
                // Transient transport failures keep polling
                Err(skybridge_common::Error::RemoteUnavailable(msg)) => {
                    warn!("Async job poll transport error, retrying: {}", msg);
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match async_job_outcome(&body)? {
                AsyncJobOutcome::Success(result) => return Ok(result),
                AsyncJobOutcome::Failure(error) => {
                    return Err(skybridge_common::Error::System(format!(
                        "CloudStack job {} failed: {}",
                        job_id, error
                    )))
                }
                AsyncJobOutcome::Pending => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(skybridge_common::Error::RemoteUnavailable(format!(
                    "CloudStack job {} timed out after {:?}",
                    job_id, timeout
                )));
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Canonical-query signing: lower-case URL-encoded key=value pairs sorted
/// lexicographically, joined with `&`, lower-cased, HMAC-SHA1 with the
/// secret, base64-encoded.
pub fn sign_request(params: &[(String, String)], secret: &str) -> String {
    let canonical = canonical_query(params);

    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(canonical.as_bytes());

    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

pub fn canonical_query(params: &[(String, String)]) -> String {
    let mut pairs: Vec<String> = params
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                key.to_lowercase(),
                urlencoding::encode(value).into_owned()
            )
        })
        .collect();
    pairs.sort();
    pairs.join("&").to_lowercase()
}

/// Unwrap the single `<command>response` wrapper object
fn unwrap_envelope(value: serde_json::Value) -> serde_json::Value {
    if let serde_json::Value::Object(map) = &value {
        if map.len() == 1 {
            if let Some((key, inner)) = map.iter().next() {
                if key.ends_with("response") {
                    return inner.clone();
                }
            }
        }
    }
    value
}

fn extract_job_id(body: &serde_json::Value) -> Result<String> {
    body["jobid"]
        .as_str()
        .map(|s| s.to_string())
        .or_else(|| body["jobid"].as_i64().map(|n| n.to_string()))
        .ok_or_else(|| {
            skybridge_common::Error::System(format!(
                "CloudStack response carries no jobid: {}",
                body
            ))
        })
}

#[derive(Debug)]
enum AsyncJobOutcome {
    Pending,
    Success(serde_json::Value),
    Failure(String),
}

fn async_job_outcome(body: &serde_json::Value) -> Result<AsyncJobOutcome> {
    let status = body["jobstatus"].as_i64().ok_or_else(|| {
        skybridge_common::Error::System(format!("async job poll without jobstatus: {}", body))
    })?;

    match status {
        JOB_STATUS_PENDING => Ok(AsyncJobOutcome::Pending),
        JOB_STATUS_SUCCESS => Ok(AsyncJobOutcome::Success(body["jobresult"].clone())),
        JOB_STATUS_FAILURE => {
            let error = body["jobresult"]["errortext"]
                .as_str()
                .unwrap_or("no error text")
                .to_string();
            Ok(AsyncJobOutcome::Failure(error))
        }
        other => Err(skybridge_common::Error::System(format!(
            "unknown async jobstatus {}",
            other
        ))),
    }
}

fn parse_list<T: serde::de::DeserializeOwned>(
    body: &serde_json::Value,
    key: &str,
) -> Result<Vec<T>> {
    match &body[key] {
        serde_json::Value::Null => Ok(Vec::new()),
        list => serde_json::from_value(list.clone()).map_err(|e| {
            skybridge_common::Error::System(format!("unparseable {} listing: {}", key, e))
        }),
    }
}

/// Strict template parse with a hand-rolled fallback for the quirky
/// `ostypeid` encoding (the field sometimes arrives as a bare number).
fn parse_templates(body: &serde_json::Value) -> Result<Vec<Template>> {
    match parse_list::<Template>(body, "template") {
        Ok(templates) => Ok(templates),
        Err(strict_err) => {
            warn!(
                "Strict template parse failed ({}), using fallback walk",
                strict_err
            );
            parse_templates_fallback(body)
        }
    }
}

fn parse_templates_fallback(body: &serde_json::Value) -> Result<Vec<Template>> {
    let list = match &body["template"] {
        serde_json::Value::Null => return Ok(Vec::new()),
        serde_json::Value::Array(items) => items,
        other => {
            return Err(skybridge_common::Error::System(format!(
                "template listing is not an array: {}",
                other
            )))
        }
    };

    let mut templates = Vec::with_capacity(list.len());
    for item in list {
        let id = item["id"].as_str().map(|s| s.to_string()).ok_or_else(|| {
            skybridge_common::Error::System("template without id".to_string())
        })?;
        let name = item["name"].as_str().unwrap_or_default().to_string();
        templates.push(Template {
            id,
            name,
            ostypeid: coerce_to_string(&item["ostypeid"]),
            ostypename: item["ostypename"].as_str().map(|s| s.to_string()),
        });
    }

    Ok(templates)
}

fn coerce_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_query_is_sorted_and_lowercased() {
        let params = vec![
            ("command".to_string(), "listZones".to_string()),
            ("apiKey".to_string(), "MyKey".to_string()),
            ("response".to_string(), "json".to_string()),
        ];

        let canonical = canonical_query(&params);
        assert_eq!(canonical, "apikey=mykey&command=listzones&response=json");
    }

    #[test]
    fn test_canonical_query_encodes_values() {
        let params = vec![(
            "name".to_string(),
            "pgtest1 clone".to_string(),
        )];
        // Spaces encode as %20, and the whole string is lowercased
        assert_eq!(canonical_query(&params), "name=pgtest1%20clone");
    }

    #[test]
    fn test_signature_is_deterministic_and_keyed() {
        let params = vec![
            ("command".to_string(), "listZones".to_string()),
            ("apikey".to_string(), "key".to_string()),
        ];
        let a = sign_request(&params, "secret-1");
        let b = sign_request(&params, "secret-1");
        let c = sign_request(&params, "secret-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        // base64 of a SHA1 digest is 28 chars
        assert_eq!(a.len(), 28);
    }

    #[test]
    fn test_async_job_status_mapping() {
        // jobstatus=1 is success; 2 is failure. The inverted mapping matches
        // the deployed endpoint and must not be "fixed" to the docs.
        let pending = serde_json::json!({"jobstatus": 0});
        assert!(matches!(
            async_job_outcome(&pending).unwrap(),
            AsyncJobOutcome::Pending
        ));

        let success = serde_json::json!({
            "jobstatus": 1,
            "jobresult": {"virtualmachine": {"id": "vm-1", "name": "x", "state": "Running"}}
        });
        match async_job_outcome(&success).unwrap() {
            AsyncJobOutcome::Success(result) => {
                assert_eq!(result["virtualmachine"]["id"], "vm-1");
            }
            other => panic!("expected success, got {:?}", other),
        }

        let failure = serde_json::json!({
            "jobstatus": 2,
            "jobresult": {"errortext": "insufficient capacity"}
        });
        match async_job_outcome(&failure).unwrap() {
            AsyncJobOutcome::Failure(error) => assert_eq!(error, "insufficient capacity"),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_envelope_unwrap() {
        let raw = serde_json::json!({
            "listzonesresponse": {"count": 1, "zone": [{"id": "z1", "name": "zone1"}]}
        });
        let inner = unwrap_envelope(raw);
        assert_eq!(inner["zone"][0]["id"], "z1");
    }

    #[test]
    fn test_template_strict_parse() {
        let body = serde_json::json!({
            "template": [
                {"id": "t1", "name": "ubuntu-22.04", "ostypeid": "os-99", "ostypename": "Ubuntu"}
            ]
        });
        let templates = parse_templates(&body).unwrap();
        assert_eq!(templates[0].ostypeid.as_deref(), Some("os-99"));
    }

    #[test]
    fn test_template_fallback_coerces_numeric_ostypeid() {
        // The quirky encoding: ostypeid arrives as a number
        let body = serde_json::json!({
            "template": [
                {"id": "t1", "name": "win2022", "ostypeid": 142, "ostypename": "Windows"}
            ]
        });
        let templates = parse_templates(&body).unwrap();
        assert_eq!(templates[0].ostypeid.as_deref(), Some("142"));
        assert_eq!(templates[0].name, "win2022");
    }

    #[test]
    fn test_empty_listing_is_empty_vec() {
        let body = serde_json::json!({"count": 0});
        let zones: Vec<Zone> = parse_list(&body, "zone").unwrap();
        assert!(zones.is_empty());
    }

    #[test]
    fn test_extract_job_id_accepts_string_and_number() {
        assert_eq!(
            extract_job_id(&serde_json::json!({"jobid": "j-1"})).unwrap(),
            "j-1"
        );
        assert_eq!(
            extract_job_id(&serde_json::json!({"jobid": 17})).unwrap(),
            "17"
        );
        assert!(extract_job_id(&serde_json::json!({})).is_err());
    }
}
