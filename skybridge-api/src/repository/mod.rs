///! Named backup repositories
///!
///! Each repository hands out QCOW2 backup files and owns the backing-file
///! wiring between chain links. Callers hold paths only. Local and NFS
///! repositories share the on-disk layout; the object-store flavor stages
///! chains locally (block servers need a real file) and uploads copies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skybridge_common::{BackupType, Result};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

/// Common object contract every repository flavor exposes
#[async_trait]
pub trait BackupRepository: Send + Sync {
    fn id(&self) -> &str;

    /// Create a fresh QCOW2 file for (vm, disk). Incremental files are wired
    /// to their parent via a qcow2 backing file.
    async fn create_backup_file(
        &self,
        vm_name: &str,
        disk_index: i64,
        backup_type: BackupType,
        parent_file: Option<&Path>,
    ) -> Result<PathBuf>;

    async fn delete_backup_file(&self, path: &Path) -> Result<()>;

    async fn list_backup_files(&self, vm_name: &str) -> Result<Vec<PathBuf>>;

    /// Total bytes consumed by the repository
    async fn total_size(&self) -> Result<u64>;

    /// Import an existing chain file, used by backup copies between
    /// repositories. The source filename is preserved.
    async fn import_file(&self, source: &Path, vm_name: &str, disk_index: i64) -> Result<PathBuf>;
}

/// Filesystem layout shared by the local and NFS flavors:
/// `<root>/<vm_name>/disk<i>/<type>-<timestamp>.qcow2`
fn backup_file_path(root: &Path, vm_name: &str, disk_index: i64, backup_type: BackupType) -> PathBuf {
    let filename = format!(
        "{}-{}.qcow2",
        backup_type,
        chrono::Utc::now().format("%Y%m%d-%H%M%S%3f")
    );
    root.join(vm_name)
        .join(format!("disk{}", disk_index))
        .join(filename)
}

async fn qemu_img_create(path: &Path, parent_file: Option<&Path>) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    let mut cmd = Command::new("qemu-img");
    cmd.arg("create").arg("-f").arg("qcow2");
    if let Some(parent) = parent_file {
        cmd.arg("-b").arg(parent).arg("-F").arg("qcow2");
    }
    cmd.arg(path);

    let output = cmd.output().await.map_err(|e| {
        skybridge_common::Error::System(format!("failed to run qemu-img: {}", e))
    })?;

    if !output.status.success() {
        return Err(skybridge_common::Error::System(format!(
            "qemu-img create failed for {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    debug!("Created backup file {}", path.display());
    Ok(())
}

async fn directory_size(root: PathBuf) -> Result<u64> {
    tokio::task::spawn_blocking(move || {
        let mut total = 0u64;
        for entry in walkdir::WalkDir::new(&root).into_iter().flatten() {
            if entry.file_type().is_file() {
                if let Ok(meta) = entry.metadata() {
                    total += meta.len();
                }
            }
        }
        total
    })
    .await
    .map_err(|e| skybridge_common::Error::System(format!("size scan failed: {}", e)))
}

/// Local directory repository
pub struct LocalRepository {
    id: String,
    root: PathBuf,
}

impl LocalRepository {
    pub fn new(id: &str, root: PathBuf) -> Self {
        Self {
            id: id.to_string(),
            root,
        }
    }
}

#[async_trait]
impl BackupRepository for LocalRepository {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_backup_file(
        &self,
        vm_name: &str,
        disk_index: i64,
        backup_type: BackupType,
        parent_file: Option<&Path>,
    ) -> Result<PathBuf> {
        if backup_type == BackupType::Incremental && parent_file.is_none() {
            return Err(skybridge_common::Error::InvalidRequest(
                "incremental backup file requires a parent".to_string(),
            ));
        }

        let path = backup_file_path(&self.root, vm_name, disk_index, backup_type);
        qemu_img_create(&path, parent_file).await?;
        Ok(path)
    }

    async fn delete_backup_file(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_backup_files(&self, vm_name: &str) -> Result<Vec<PathBuf>> {
        let vm_root = self.root.join(vm_name);
        let files = tokio::task::spawn_blocking(move || {
            let mut files: Vec<PathBuf> = walkdir::WalkDir::new(&vm_root)
                .into_iter()
                .flatten()
                .filter(|e| e.file_type().is_file())
                .filter(|e| {
                    e.path()
                        .extension()
                        .map(|ext| ext == "qcow2")
                        .unwrap_or(false)
                })
                .map(|e| e.into_path())
                .collect();
            files.sort();
            files
        })
        .await
        .map_err(|e| skybridge_common::Error::System(format!("listing failed: {}", e)))?;

        Ok(files)
    }

    async fn total_size(&self) -> Result<u64> {
        directory_size(self.root.clone()).await
    }

    async fn import_file(&self, source: &Path, vm_name: &str, disk_index: i64) -> Result<PathBuf> {
        let filename = source
            .file_name()
            .ok_or_else(|| {
                skybridge_common::Error::InvalidRequest(format!(
                    "source '{}' has no filename",
                    source.display()
                ))
            })?
            .to_owned();

        let target = self
            .root
            .join(vm_name)
            .join(format!("disk{}", disk_index))
            .join(filename);
        if let Some(dir) = target.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        tokio::fs::copy(source, &target).await?;
        Ok(target)
    }
}

/// NFS repository: a local repository layered on an NFS mount that is
/// ensured before first use
pub struct NfsRepository {
    inner: LocalRepository,
    server: String,
    export: String,
    mount_point: PathBuf,
}

impl NfsRepository {
    pub fn new(id: &str, server: &str, export: &str, mount_point: PathBuf) -> Self {
        Self {
            inner: LocalRepository::new(id, mount_point.clone()),
            server: server.to_string(),
            export: export.to_string(),
            mount_point,
        }
    }

    async fn ensure_mounted(&self) -> Result<()> {
        let mounts = tokio::fs::read_to_string("/proc/mounts").await.unwrap_or_default();
        let mount_str = self.mount_point.to_string_lossy();
        if mounts.lines().any(|line| {
            line.split_whitespace()
                .nth(1)
                .map(|target| target == mount_str)
                .unwrap_or(false)
        }) {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.mount_point).await?;
        info!(
            "Mounting NFS export {}:{} at {}",
            self.server,
            self.export,
            self.mount_point.display()
        );

        let output = Command::new("mount")
            .arg("-t")
            .arg("nfs")
            .arg(format!("{}:{}", self.server, self.export))
            .arg(&self.mount_point)
            .output()
            .await?;

        if !output.status.success() {
            return Err(skybridge_common::Error::RemoteUnavailable(format!(
                "NFS mount of {}:{} failed: {}",
                self.server,
                self.export,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl BackupRepository for NfsRepository {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn create_backup_file(
        &self,
        vm_name: &str,
        disk_index: i64,
        backup_type: BackupType,
        parent_file: Option<&Path>,
    ) -> Result<PathBuf> {
        self.ensure_mounted().await?;
        self.inner
            .create_backup_file(vm_name, disk_index, backup_type, parent_file)
            .await
    }

    async fn delete_backup_file(&self, path: &Path) -> Result<()> {
        self.ensure_mounted().await?;
        self.inner.delete_backup_file(path).await
    }

    async fn list_backup_files(&self, vm_name: &str) -> Result<Vec<PathBuf>> {
        self.ensure_mounted().await?;
        self.inner.list_backup_files(vm_name).await
    }

    async fn total_size(&self) -> Result<u64> {
        self.ensure_mounted().await?;
        self.inner.total_size().await
    }

    async fn import_file(&self, source: &Path, vm_name: &str, disk_index: i64) -> Result<PathBuf> {
        self.ensure_mounted().await?;
        self.inner.import_file(source, vm_name, disk_index).await
    }
}

/// S3-compatible repository. Chains stage on local disk; `upload_object`
/// pushes copies to the bucket.
pub struct ObjectStoreRepository {
    inner: LocalRepository,
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
}

impl ObjectStoreRepository {
    pub fn new(id: &str, endpoint: &str, bucket: &str, staging: PathBuf) -> Self {
        Self {
            inner: LocalRepository::new(id, staging),
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
        }
    }

    /// Upload a staged file under an object key
    pub async fn upload_object(&self, key: &str, path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(path).await?;
        let url = format!("{}/{}/{}", self.endpoint, self.bucket, key);

        let response = self.client.put(&url).body(bytes).send().await.map_err(|e| {
            skybridge_common::Error::RemoteUnavailable(format!("object store unreachable: {}", e))
        })?;

        if !response.status().is_success() {
            return Err(skybridge_common::Error::System(format!(
                "object store PUT {} returned {}",
                key,
                response.status()
            )));
        }

        info!("Uploaded {} to bucket {}", key, self.bucket);
        Ok(())
    }
}

#[async_trait]
impl BackupRepository for ObjectStoreRepository {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn create_backup_file(
        &self,
        vm_name: &str,
        disk_index: i64,
        backup_type: BackupType,
        parent_file: Option<&Path>,
    ) -> Result<PathBuf> {
        self.inner
            .create_backup_file(vm_name, disk_index, backup_type, parent_file)
            .await
    }

    async fn delete_backup_file(&self, path: &Path) -> Result<()> {
        self.inner.delete_backup_file(path).await
    }

    async fn list_backup_files(&self, vm_name: &str) -> Result<Vec<PathBuf>> {
        self.inner.list_backup_files(vm_name).await
    }

    async fn total_size(&self) -> Result<u64> {
        self.inner.total_size().await
    }

    async fn import_file(&self, source: &Path, vm_name: &str, disk_index: i64) -> Result<PathBuf> {
        let staged = self.inner.import_file(source, vm_name, disk_index).await?;
        let key = format!(
            "{}/disk{}/{}",
            vm_name,
            disk_index,
            staged
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        );
        self.upload_object(&key, &staged).await?;
        Ok(staged)
    }
}

/// Typed repository configuration stored as JSON in the database row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RepositoryConfig {
    Local {
        path: PathBuf,
    },
    Nfs {
        server: String,
        export: String,
        mount_point: PathBuf,
    },
    ObjectStore {
        endpoint: String,
        bucket: String,
        staging_path: PathBuf,
    },
}

/// Resolves repository ids to live repository instances
#[derive(Clone)]
pub struct RepositoryManager {
    pool: SqlitePool,
    default_root: PathBuf,
}

impl RepositoryManager {
    pub fn new(pool: SqlitePool, default_root: PathBuf) -> Self {
        Self { pool, default_root }
    }

    /// Make sure the built-in local repository exists
    pub async fn ensure_default(&self) -> Result<()> {
        match crate::db::repositories::get(&self.pool, "repo-default").await {
            Ok(_) => Ok(()),
            Err(skybridge_common::Error::NotFound(_)) => {
                let config = RepositoryConfig::Local {
                    path: self.default_root.join("default"),
                };
                crate::db::repositories::create(
                    &self.pool,
                    &crate::db::repositories::RepositoryRecord {
                        id: "repo-default".to_string(),
                        name: "default".to_string(),
                        repo_type: "local".to_string(),
                        config: serde_json::to_string(&config).unwrap_or_default(),
                        enabled: true,
                        created_at: chrono::Utc::now().timestamp(),
                    },
                )
                .await?;
                info!("Created default local repository");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn resolve(&self, repository_id: &str) -> Result<Arc<dyn BackupRepository>> {
        let record = crate::db::repositories::get(&self.pool, repository_id).await?;
        if !record.enabled {
            return Err(skybridge_common::Error::PreconditionFailed(format!(
                "repository '{}' is disabled",
                record.name
            )));
        }

        let config: RepositoryConfig = serde_json::from_str(&record.config).map_err(|e| {
            skybridge_common::Error::System(format!(
                "repository '{}' has invalid config: {}",
                record.name, e
            ))
        })?;

        Ok(match config {
            RepositoryConfig::Local { path } => Arc::new(LocalRepository::new(&record.id, path)),
            RepositoryConfig::Nfs {
                server,
                export,
                mount_point,
            } => Arc::new(NfsRepository::new(&record.id, &server, &export, mount_point)),
            RepositoryConfig::ObjectStore {
                endpoint,
                bucket,
                staging_path,
            } => Arc::new(ObjectStoreRepository::new(
                &record.id,
                &endpoint,
                &bucket,
                staging_path,
            )),
        })
    }

    pub async fn list(&self) -> Result<Vec<crate::db::repositories::RepositoryRecord>> {
        crate::db::repositories::list(&self.pool).await
    }
}
