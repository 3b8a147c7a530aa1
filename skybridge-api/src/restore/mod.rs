///! Restore mount management
///!
///! Mounts a completed backup file read-only through an NBD device, exposes
///! file browsing and streaming downloads, and scavenges idle mounts past a
///! TTL. Bulk directory downloads spool into a temporary archive so the tree
///! is never buffered in memory.

use crate::db;
use serde::Serialize;
use skybridge_common::Result;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "zip" => Ok(Self::Zip),
            "tar.gz" | "targz" => Ok(Self::TarGz),
            other => Err(skybridge_common::Error::InvalidRequest(format!(
                "unknown archive format '{}', expected zip or tar.gz",
                other
            ))),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Zip => "application/zip",
            Self::TarGz => "application/gzip",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::TarGz => "tar.gz",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreResources {
    pub nbd_devices_total: u8,
    pub nbd_devices_in_use: usize,
    pub active_mounts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupStatus {
    pub mount_idle_ttl_secs: u64,
    pub last_sweep_at: Option<i64>,
    pub mounts_scavenged_total: u64,
}

pub struct RestoreMountManager {
    pool: SqlitePool,
    mount_root: PathBuf,
    nbd_device_count: u8,
    idle_ttl_secs: u64,
    sweep_state: Arc<Mutex<(Option<i64>, u64)>>,
}

impl RestoreMountManager {
    pub fn new(
        pool: SqlitePool,
        mount_root: PathBuf,
        nbd_device_count: u8,
        idle_ttl_secs: u64,
    ) -> Self {
        Self {
            pool,
            mount_root,
            nbd_device_count,
            idle_ttl_secs,
            sweep_state: Arc::new(Mutex::new((None, 0))),
        }
    }

    /// Mount one disk of a backup read-only. Re-mounting an already-mounted
    /// disk returns the existing mount.
    pub async fn mount(
        &self,
        backup_id: &str,
        disk_index: i64,
    ) -> Result<db::restore_mounts::RestoreMountRecord> {
        let parent_id = db::backups::parent_id_of(backup_id).to_string();
        let disk = db::backups::get_disk(&self.pool, &parent_id, disk_index).await?;

        if disk.status != "completed" {
            return Err(skybridge_common::Error::PreconditionFailed(format!(
                "disk {} of backup '{}' is {}, only completed disks can be mounted",
                disk_index, parent_id, disk.status
            )));
        }

        let qcow2_path = PathBuf::from(&disk.qcow2_path);
        if tokio::fs::metadata(&qcow2_path).await.is_err() {
            return Err(skybridge_common::Error::NotFound(format!(
                "backup file '{}' is missing",
                disk.qcow2_path
            )));
        }

        let existing = db::restore_mounts::list(&self.pool).await?;
        if let Some(current) = existing.iter().find(|m| m.backup_disk_id == disk.id) {
            db::restore_mounts::touch(&self.pool, &current.id).await?;
            return Ok(current.clone());
        }

        let used: Vec<String> = existing.iter().map(|m| m.nbd_device.clone()).collect();
        let device = pick_free_device(&used, self.nbd_device_count).ok_or_else(|| {
            skybridge_common::Error::ResourceExhausted(format!(
                "all {} NBD devices are in use",
                self.nbd_device_count
            ))
        })?;

        let mount_id = format!("mount-{}", uuid::Uuid::new_v4());
        let mount_path = self.mount_root.join(&mount_id);
        tokio::fs::create_dir_all(&mount_path).await?;

        self.attach_and_mount(&qcow2_path, &device, &mount_path)
            .await?;

        let record = db::restore_mounts::RestoreMountRecord {
            id: mount_id,
            backup_job_id: parent_id,
            backup_disk_id: disk.id,
            disk_index,
            mount_path: mount_path.to_string_lossy().into_owned(),
            nbd_device: device,
            created_at: chrono::Utc::now().timestamp(),
            last_accessed_at: chrono::Utc::now().timestamp(),
        };
        db::restore_mounts::insert(&self.pool, &record).await?;

        info!(
            "Mounted backup disk {} read-only at {}",
            record.backup_disk_id, record.mount_path
        );
        Ok(record)
    }

    async fn attach_and_mount(
        &self,
        qcow2_path: &Path,
        device: &str,
        mount_path: &Path,
    ) -> Result<()> {
        let connect = Command::new("qemu-nbd")
            .arg("--connect")
            .arg(device)
            .arg("--read-only")
            .arg(qcow2_path)
            .output()
            .await
            .map_err(|e| {
                skybridge_common::Error::System(format!("failed to run qemu-nbd: {}", e))
            })?;
        if !connect.status.success() {
            return Err(skybridge_common::Error::System(format!(
                "qemu-nbd connect of {} failed: {}",
                qcow2_path.display(),
                String::from_utf8_lossy(&connect.stderr)
            )));
        }

        // Prefer the first partition when the guest disk is partitioned
        let partition = format!("{}p1", device);
        let source = if tokio::fs::metadata(&partition).await.is_ok() {
            partition
        } else {
            device.to_string()
        };

        let mount = Command::new("mount")
            .arg("-o")
            .arg("ro,norecovery")
            .arg(&source)
            .arg(mount_path)
            .output()
            .await?;
        if !mount.status.success() {
            // Leave no dangling NBD attachment behind
            let _ = Command::new("qemu-nbd")
                .arg("--disconnect")
                .arg(device)
                .output()
                .await;
            return Err(skybridge_common::Error::System(format!(
                "read-only mount of {} failed: {}",
                source,
                String::from_utf8_lossy(&mount.stderr)
            )));
        }

        Ok(())
    }

    /// Tear a mount down; the record goes away with it
    pub async fn unmount(&self, mount_id: &str) -> Result<()> {
        let record = db::restore_mounts::get(&self.pool, mount_id).await?;

        let umount = Command::new("umount").arg(&record.mount_path).output().await;
        if let Ok(output) = umount {
            if !output.status.success() {
                warn!(
                    "umount of {} reported: {}",
                    record.mount_path,
                    String::from_utf8_lossy(&output.stderr)
                );
            }
        }

        let _ = Command::new("qemu-nbd")
            .arg("--disconnect")
            .arg(&record.nbd_device)
            .output()
            .await;

        let _ = tokio::fs::remove_dir(&record.mount_path).await;
        db::restore_mounts::delete(&self.pool, mount_id).await?;

        info!("Unmounted restore mount {}", mount_id);
        Ok(())
    }

    pub async fn list_mounts(&self) -> Result<Vec<db::restore_mounts::RestoreMountRecord>> {
        db::restore_mounts::list(&self.pool).await
    }

    /// Browse a directory inside a mount
    pub async fn list_files(
        &self,
        mount_id: &str,
        rel_path: &str,
        recursive: bool,
    ) -> Result<Vec<FileInfo>> {
        let record = db::restore_mounts::get(&self.pool, mount_id).await?;
        db::restore_mounts::touch(&self.pool, mount_id).await?;

        let root = PathBuf::from(&record.mount_path);
        let target = resolve_within(&root, rel_path)?;

        let files = tokio::task::spawn_blocking(move || collect_files(&root, &target, recursive))
            .await
            .map_err(|e| skybridge_common::Error::System(format!("listing failed: {}", e)))??;

        Ok(files)
    }

    pub async fn file_info(&self, mount_id: &str, rel_path: &str) -> Result<FileInfo> {
        let record = db::restore_mounts::get(&self.pool, mount_id).await?;
        db::restore_mounts::touch(&self.pool, mount_id).await?;

        let root = PathBuf::from(&record.mount_path);
        let target = resolve_within(&root, rel_path)?;

        let meta = tokio::fs::metadata(&target).await.map_err(|_| {
            skybridge_common::Error::NotFound(format!("'{}' not found in mount", rel_path))
        })?;

        Ok(file_info_from(&root, &target, &meta))
    }

    /// Resolve a file for streaming download; the handler owns the stream
    pub async fn download_path(&self, mount_id: &str, rel_path: &str) -> Result<PathBuf> {
        let record = db::restore_mounts::get(&self.pool, mount_id).await?;
        db::restore_mounts::touch(&self.pool, mount_id).await?;

        let root = PathBuf::from(&record.mount_path);
        let target = resolve_within(&root, rel_path)?;

        let meta = tokio::fs::metadata(&target).await.map_err(|_| {
            skybridge_common::Error::NotFound(format!("'{}' not found in mount", rel_path))
        })?;
        if meta.is_dir() {
            return Err(skybridge_common::Error::InvalidRequest(format!(
                "'{}' is a directory; use the directory download",
                rel_path
            )));
        }

        Ok(target)
    }

    /// Build a spooled archive of a directory and return its temp path
    pub async fn download_directory(
        &self,
        mount_id: &str,
        rel_path: &str,
        format: ArchiveFormat,
    ) -> Result<(PathBuf, String)> {
        let record = db::restore_mounts::get(&self.pool, mount_id).await?;
        db::restore_mounts::touch(&self.pool, mount_id).await?;

        let root = PathBuf::from(&record.mount_path);
        let target = resolve_within(&root, rel_path)?;

        let meta = tokio::fs::metadata(&target).await.map_err(|_| {
            skybridge_common::Error::NotFound(format!("'{}' not found in mount", rel_path))
        })?;
        if !meta.is_dir() {
            return Err(skybridge_common::Error::InvalidRequest(format!(
                "'{}' is not a directory",
                rel_path
            )));
        }

        let base_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());
        let download_name = format!("{}.{}", base_name, format.extension());

        let archive_path = tokio::task::spawn_blocking(move || build_archive(&target, format))
            .await
            .map_err(|e| skybridge_common::Error::System(format!("archive task failed: {}", e)))??;

        Ok((archive_path, download_name))
    }

    pub async fn resources(&self) -> Result<RestoreResources> {
        let mounts = db::restore_mounts::list(&self.pool).await?;
        Ok(RestoreResources {
            nbd_devices_total: self.nbd_device_count,
            nbd_devices_in_use: mounts.len(),
            active_mounts: mounts.len(),
        })
    }

    pub async fn cleanup_status(&self) -> CleanupStatus {
        let state = self.sweep_state.lock().await;
        CleanupStatus {
            mount_idle_ttl_secs: self.idle_ttl_secs,
            last_sweep_at: state.0,
            mounts_scavenged_total: state.1,
        }
    }

    /// One scavenger sweep: unmount everything idle past the TTL
    pub async fn sweep_idle_mounts(&self) -> Result<usize> {
        let cutoff = chrono::Utc::now().timestamp() - self.idle_ttl_secs as i64;
        let idle = db::restore_mounts::list_idle(&self.pool, cutoff).await?;
        let mut scavenged = 0;

        for mount in idle {
            match self.unmount(&mount.id).await {
                Ok(()) => {
                    scavenged += 1;
                    info!("Scavenged idle restore mount {}", mount.id);
                }
                Err(e) => warn!("Failed to scavenge mount {}: {}", mount.id, e),
            }
        }

        let mut state = self.sweep_state.lock().await;
        state.0 = Some(chrono::Utc::now().timestamp());
        state.1 += scavenged as u64;

        Ok(scavenged)
    }
}

/// Lowest-numbered free NBD device, or None when the pool is exhausted
fn pick_free_device(used: &[String], device_count: u8) -> Option<String> {
    (0..device_count)
        .map(|i| format!("/dev/nbd{}", i))
        .find(|candidate| !used.contains(candidate))
}

/// Join a user-supplied relative path onto the mount root, refusing any
/// component that would escape it.
fn resolve_within(root: &Path, rel_path: &str) -> Result<PathBuf> {
    let rel = rel_path.trim_start_matches('/');
    let mut resolved = root.to_path_buf();

    for component in Path::new(rel).components() {
        match component {
            std::path::Component::Normal(part) => resolved.push(part),
            std::path::Component::CurDir => {}
            _ => {
                return Err(skybridge_common::Error::InvalidRequest(format!(
                    "path '{}' escapes the mount",
                    rel_path
                )))
            }
        }
    }

    Ok(resolved)
}

fn file_info_from(root: &Path, path: &Path, meta: &std::fs::Metadata) -> FileInfo {
    let rel = path.strip_prefix(root).unwrap_or(path);
    FileInfo {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path: format!("/{}", rel.to_string_lossy()),
        size: meta.len(),
        is_dir: meta.is_dir(),
        modified_at: meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64),
    }
}

fn collect_files(root: &Path, target: &Path, recursive: bool) -> Result<Vec<FileInfo>> {
    let meta = std::fs::metadata(target).map_err(|_| {
        skybridge_common::Error::NotFound(format!(
            "'{}' not found in mount",
            target.display()
        ))
    })?;
    if !meta.is_dir() {
        return Ok(vec![file_info_from(root, target, &meta)]);
    }

    let mut files = Vec::new();
    let walker = if recursive {
        walkdir::WalkDir::new(target).min_depth(1)
    } else {
        walkdir::WalkDir::new(target).min_depth(1).max_depth(1)
    };

    for entry in walker.into_iter().flatten() {
        if let Ok(meta) = entry.metadata() {
            files.push(file_info_from(root, entry.path(), &meta));
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// Spool a directory into a temporary archive file
fn build_archive(dir: &Path, format: ArchiveFormat) -> Result<PathBuf> {
    let spool = tempfile::Builder::new()
        .prefix("skybridge-restore-")
        .suffix(&format!(".{}", format.extension()))
        .tempfile()
        .map_err(|e| skybridge_common::Error::System(format!("spool file failed: {}", e)))?;
    let (file, path) = spool
        .keep()
        .map_err(|e| skybridge_common::Error::System(format!("spool keep failed: {}", e)))?;

    match format {
        ArchiveFormat::TarGz => {
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder
                .append_dir_all(".", dir)
                .map_err(|e| skybridge_common::Error::System(format!("tar build failed: {}", e)))?;
            builder
                .into_inner()
                .and_then(|encoder| encoder.finish())
                .map_err(|e| skybridge_common::Error::System(format!("tar finish failed: {}", e)))?;
        }
        ArchiveFormat::Zip => {
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::FileOptions::default();

            for entry in walkdir::WalkDir::new(dir).min_depth(1).into_iter().flatten() {
                let rel = entry
                    .path()
                    .strip_prefix(dir)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .into_owned();

                if entry.file_type().is_dir() {
                    writer.add_directory(rel, options).map_err(|e| {
                        skybridge_common::Error::System(format!("zip dir failed: {}", e))
                    })?;
                } else if entry.file_type().is_file() {
                    writer.start_file(rel, options).map_err(|e| {
                        skybridge_common::Error::System(format!("zip entry failed: {}", e))
                    })?;
                    let mut source = std::fs::File::open(entry.path())?;
                    std::io::copy(&mut source, &mut writer)?;
                }
            }

            writer
                .finish()
                .map_err(|e| skybridge_common::Error::System(format!("zip finish failed: {}", e)))?;
        }
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_free_device() {
        assert_eq!(pick_free_device(&[], 2).as_deref(), Some("/dev/nbd0"));
        assert_eq!(
            pick_free_device(&["/dev/nbd0".to_string()], 2).as_deref(),
            Some("/dev/nbd1")
        );
        assert_eq!(
            pick_free_device(&["/dev/nbd0".to_string(), "/dev/nbd1".to_string()], 2),
            None
        );
    }

    #[test]
    fn test_resolve_within_blocks_traversal() {
        let root = Path::new("/mnt/restore/m1");
        assert_eq!(
            resolve_within(root, "var/log").unwrap(),
            PathBuf::from("/mnt/restore/m1/var/log")
        );
        assert_eq!(
            resolve_within(root, "/etc/passwd").unwrap(),
            PathBuf::from("/mnt/restore/m1/etc/passwd")
        );
        assert!(resolve_within(root, "../../../etc/shadow").is_err());
        assert!(resolve_within(root, "var/../../escape").is_err());
    }

    #[test]
    fn test_archive_format_parse() {
        assert_eq!(ArchiveFormat::parse("zip").unwrap(), ArchiveFormat::Zip);
        assert_eq!(ArchiveFormat::parse("tar.gz").unwrap(), ArchiveFormat::TarGz);
        assert!(ArchiveFormat::parse("rar").is_err());
    }

    #[test]
    fn test_collect_files_listing() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("etc/nginx")).unwrap();
        std::fs::write(tmp.path().join("etc/hostname"), b"pgtest1\n").unwrap();
        std::fs::write(tmp.path().join("etc/nginx/nginx.conf"), b"events {}\n").unwrap();

        let shallow = collect_files(tmp.path(), &tmp.path().join("etc"), false).unwrap();
        assert_eq!(shallow.len(), 2);
        assert!(shallow.iter().any(|f| f.name == "hostname" && !f.is_dir));
        assert!(shallow.iter().any(|f| f.name == "nginx" && f.is_dir));

        let deep = collect_files(tmp.path(), &tmp.path().join("etc"), true).unwrap();
        assert_eq!(deep.len(), 3);
        assert!(deep.iter().any(|f| f.path == "/etc/nginx/nginx.conf"));
    }

    #[test]
    fn test_build_tar_gz_archive() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"alpha").unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/b.txt"), b"beta").unwrap();

        let archive = build_archive(tmp.path(), ArchiveFormat::TarGz).unwrap();
        let meta = std::fs::metadata(&archive).unwrap();
        assert!(meta.len() > 0);

        // Gzip magic bytes
        let bytes = std::fs::read(&archive).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        std::fs::remove_file(archive).ok();
    }

    #[test]
    fn test_build_zip_archive() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"alpha").unwrap();

        let archive = build_archive(tmp.path(), ArchiveFormat::Zip).unwrap();
        let bytes = std::fs::read(&archive).unwrap();
        // Zip local file header magic
        assert_eq!(&bytes[..2], b"PK");
        std::fs::remove_file(archive).ok();
    }

    #[tokio::test]
    async fn test_mount_missing_backup_is_not_found() {
        let db = crate::db::Database::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let manager = RestoreMountManager::new(
            db.pool().clone(),
            std::env::temp_dir().join("skybridge-mounts"),
            8,
            3600,
        );

        match manager.mount("backup-ghost", 0).await {
            Err(skybridge_common::Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_list_files_after_unmount_is_not_found() {
        let db = crate::db::Database::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let manager = RestoreMountManager::new(
            db.pool().clone(),
            std::env::temp_dir().join("skybridge-mounts"),
            8,
            3600,
        );

        // A mount record without a live mount is enough to exercise the law:
        // once the record is gone, every file operation is NotFound.
        let record = db::restore_mounts::RestoreMountRecord {
            id: "mount-test".to_string(),
            backup_job_id: "backup-x".to_string(),
            backup_disk_id: "backup-x-disk0".to_string(),
            disk_index: 0,
            mount_path: std::env::temp_dir()
                .join("skybridge-mounts/mount-test")
                .to_string_lossy()
                .into_owned(),
            nbd_device: "/dev/nbd0".to_string(),
            created_at: chrono::Utc::now().timestamp(),
            last_accessed_at: chrono::Utc::now().timestamp(),
        };
        tokio::fs::create_dir_all(&record.mount_path).await.unwrap();
        db::restore_mounts::insert(db.pool(), &record).await.unwrap();

        assert!(manager.list_files("mount-test", "/", false).await.is_ok());

        manager.unmount("mount-test").await.unwrap();

        match manager.list_files("mount-test", "/", false).await {
            Err(skybridge_common::Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }
}
