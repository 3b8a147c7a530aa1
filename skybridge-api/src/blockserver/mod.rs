///! Port allocator and block-server process supervision
///!
///! One external block-server process serves one backup file on one TCP
///! port. The allocator hands out ports from a dense configurable range and
///! is the single piece of process-wide state in the hub; everything else is
///! constructor-injected.

use serde::Serialize;
use skybridge_common::Result;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Ephemeral ownership record binding a port to a backup job and a file
#[derive(Debug, Clone, Serialize)]
pub struct PortLease {
    pub port: u16,
    pub owner_job_id: String,
    pub qcow2_path: Option<PathBuf>,
    pub export_name: Option<String>,
    pub pid: Option<u32>,
    pub allocated_at: i64,
}

struct Inner {
    leases: BTreeMap<u16, PortLease>,
    children: HashMap<u16, Child>,
}

/// Supervisor for per-disk block-server processes
pub struct BlockServerSupervisor {
    binary: String,
    advertise_host: String,
    port_low: u16,
    port_high: u16,
    inner: Arc<Mutex<Inner>>,
}

/// Deterministic export name for (backup job, disk index); retries land on
/// the same export.
pub fn export_name(backup_job_id: &str, disk_index: i64) -> String {
    format!("{}-disk{}", backup_job_id, disk_index)
}

impl BlockServerSupervisor {
    pub fn new(config: &crate::config::BlockServerConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            advertise_host: config.advertise_host.clone(),
            port_low: config.port_low,
            port_high: config.port_high,
            inner: Arc::new(Mutex::new(Inner {
                leases: BTreeMap::new(),
                children: HashMap::new(),
            })),
        }
    }

    pub fn advertise_host(&self) -> &str {
        &self.advertise_host
    }

    /// Claim the lowest free port in the range
    pub async fn allocate(&self, owner_job_id: &str) -> Result<u16> {
        let mut inner = self.inner.lock().await;

        for port in self.port_low..=self.port_high {
            if !inner.leases.contains_key(&port) {
                inner.leases.insert(
                    port,
                    PortLease {
                        port,
                        owner_job_id: owner_job_id.to_string(),
                        qcow2_path: None,
                        export_name: None,
                        pid: None,
                        allocated_at: chrono::Utc::now().timestamp(),
                    },
                );
                return Ok(port);
            }
        }

        Err(skybridge_common::Error::ResourceExhausted(format!(
            "no free block-server ports in [{}, {}]",
            self.port_low, self.port_high
        )))
    }

    /// Free a lease; idempotent. Any process still bound to the port is
    /// terminated first.
    pub async fn release(&self, port: u16) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(mut child) = inner.children.remove(&port) {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill block server on port {}: {}", port, e);
            }
            let _ = child.wait().await;
        }
        if inner.leases.remove(&port).is_some() {
            info!("Released block-server port {}", port);
        }
        Ok(())
    }

    /// Launch a block server exporting `qcow2_path` on an already-leased
    /// port; records the pid in the lease.
    pub async fn start(
        &self,
        port: u16,
        qcow2_path: &PathBuf,
        export: &str,
    ) -> Result<u32> {
        let mut inner = self.inner.lock().await;

        let lease = inner.leases.get(&port).cloned().ok_or_else(|| {
            skybridge_common::Error::Conflict(format!("port {} is not leased", port))
        })?;
        if lease.pid.is_some() {
            return Err(skybridge_common::Error::Conflict(format!(
                "port {} already runs a block server (pid {})",
                port,
                lease.pid.unwrap_or_default()
            )));
        }

        let child = Command::new(&self.binary)
            .arg("-t")
            .arg("-p")
            .arg(port.to_string())
            .arg("-x")
            .arg(export)
            .arg("--format")
            .arg("qcow2")
            .arg(qcow2_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                skybridge_common::Error::System(format!(
                    "failed to launch block server '{}' on port {}: {}",
                    self.binary, port, e
                ))
            })?;

        let pid = child.id().ok_or_else(|| {
            skybridge_common::Error::System(format!(
                "block server on port {} exited before pid capture",
                port
            ))
        })?;

        if let Some(lease) = inner.leases.get_mut(&port) {
            lease.pid = Some(pid);
            lease.qcow2_path = Some(qcow2_path.clone());
            lease.export_name = Some(export.to_string());
        }
        inner.children.insert(port, child);

        info!(
            "Block server pid {} exporting {} on port {}",
            pid,
            qcow2_path.display(),
            port
        );

        Ok(pid)
    }

    /// Terminate the process on a port and free the lease. Safe to call on
    /// a port that was never started or was already stopped.
    pub async fn stop(&self, port: u16) -> Result<()> {
        self.release(port).await
    }

    /// Current leases, for introspection and tests
    pub async fn active_leases(&self) -> Vec<PortLease> {
        let inner = self.inner.lock().await;
        inner.leases.values().cloned().collect()
    }

    /// Startup reconciliation: probe every port in the range. A listener
    /// without a lease is an orphan from a previous run and gets a lease so
    /// the allocator will not double-book it; a leased port with a dead
    /// process frees its lease.
    pub async fn reconcile(&self) -> Result<()> {
        let mut orphans = 0u32;
        let mut freed = 0u32;

        for port in self.port_low..=self.port_high {
            let alive = probe_port(port).await;
            let mut inner = self.inner.lock().await;

            match (inner.leases.contains_key(&port), alive) {
                (false, true) => {
                    orphans += 1;
                    inner.leases.insert(
                        port,
                        PortLease {
                            port,
                            owner_job_id: "orphan-reconcile".to_string(),
                            qcow2_path: None,
                            export_name: None,
                            pid: None,
                            allocated_at: chrono::Utc::now().timestamp(),
                        },
                    );
                }
                (true, false) => {
                    let has_child = inner.children.contains_key(&port);
                    if !has_child {
                        inner.leases.remove(&port);
                        freed += 1;
                    }
                }
                _ => {}
            }
        }

        if orphans > 0 || freed > 0 {
            warn!(
                "Port reconciliation: {} orphan listener(s) fenced, {} dead lease(s) freed",
                orphans, freed
            );
        } else {
            info!("Port reconciliation clean");
        }

        Ok(())
    }
}

async fn probe_port(port: u16) -> bool {
    tokio::time::timeout(
        Duration::from_millis(500),
        tokio::net::TcpStream::connect(("127.0.0.1", port)),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(low: u16, high: u16) -> BlockServerSupervisor {
        BlockServerSupervisor::new(&crate::config::BlockServerConfig {
            binary: "qemu-nbd".to_string(),
            port_low: low,
            port_high: high,
            advertise_host: "127.0.0.1".to_string(),
        })
    }

    #[tokio::test]
    async fn test_dense_allocation_and_exhaustion() {
        let sup = supervisor(10100, 10101);

        let a = sup.allocate("job-1").await.unwrap();
        let b = sup.allocate("job-2").await.unwrap();
        assert_eq!(a, 10100);
        assert_eq!(b, 10101);

        match sup.allocate("job-3").await {
            Err(skybridge_common::Error::ResourceExhausted(_)) => {}
            other => panic!("expected ResourceExhausted, got {:?}", other),
        }

        assert_eq!(sup.active_leases().await.len(), 2);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let sup = supervisor(10100, 10101);
        let port = sup.allocate("job-1").await.unwrap();

        sup.release(port).await.unwrap();
        sup.release(port).await.unwrap();
        assert!(sup.active_leases().await.is_empty());

        // The port is reusable after release
        let again = sup.allocate("job-2").await.unwrap();
        assert_eq!(again, port);
    }

    #[tokio::test]
    async fn test_lease_count_never_exceeds_range() {
        let sup = supervisor(10100, 10104);
        for i in 0..5 {
            sup.allocate(&format!("job-{}", i)).await.unwrap();
        }
        assert!(sup.allocate("job-overflow").await.is_err());
        let leases = sup.active_leases().await;
        assert!(leases.len() <= 5);
    }

    #[tokio::test]
    async fn test_start_requires_lease() {
        let sup = supervisor(10100, 10101);
        let result = sup
            .start(10100, &PathBuf::from("/tmp/x.qcow2"), "exp")
            .await;
        match result {
            Err(skybridge_common::Error::Conflict(_)) => {}
            other => panic!("expected Conflict, got {:?}", other.map(|_| 0)),
        }
    }

    #[tokio::test]
    async fn test_reconcile_on_quiet_range_is_clean() {
        // Nothing listens on these ports in the test environment, so a
        // leased-but-dead port is freed.
        let sup = supervisor(10190, 10191);
        sup.allocate("job-1").await.unwrap();
        {
            // Simulate a lease whose process died without a child handle
            let mut inner = sup.inner.lock().await;
            if let Some(lease) = inner.leases.get_mut(&10190) {
                lease.pid = Some(4_000_000);
            }
        }

        sup.reconcile().await.unwrap();
        assert!(sup.active_leases().await.is_empty());
    }

    #[test]
    fn test_export_name_is_deterministic() {
        assert_eq!(
            export_name("backup-pgtest1-17", 0),
            "backup-pgtest1-17-disk0"
        );
        assert_eq!(
            export_name("backup-pgtest1-17", 0),
            export_name("backup-pgtest1-17", 0)
        );
    }
}
