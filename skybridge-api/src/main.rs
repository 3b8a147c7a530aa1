// Allow dead code for modules with prepared functionality for future features
#![allow(dead_code)]

mod activity;
mod backup;
mod blockserver;
mod cloudstack;
mod config;
mod credentials;
mod db;
mod enrollment;
mod error;
mod failover;
mod flows;
mod node;
mod replication;
mod repository;
mod restore;
mod scheduler;
mod shutdown;
mod telemetry;
mod tracker;
mod volume;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use activity::ActivityProjector;
use backup::BackupOrchestrator;
use blockserver::BlockServerSupervisor;
use cloudstack::CloudStackClient;
use credentials::CredentialService;
use enrollment::EnrollmentManager;
use error::ApiError;
use failover::rollback::RollbackRequest;
use failover::{FailoverEngine, UnifiedFailoverRequest};
use flows::ProtectionFlowService;
use node::NodeClient;
use replication::ReplicationService;
use repository::RepositoryManager;
use restore::{ArchiveFormat, RestoreMountManager};
use skybridge_common::{FailoverType, TelemetryUpdate};
use telemetry::TelemetryIngest;
use tracker::JobTracker;
use volume::VolumeClient;

#[derive(Clone)]
struct AppState {
    config: Arc<config::SkybridgeConfig>,
    database: Arc<db::Database>,
    tracker: JobTracker,
    repositories: RepositoryManager,
    block_servers: Arc<BlockServerSupervisor>,
    credentials: CredentialService,
    node: NodeClient,
    cloudstack: CloudStackClient,
    volumes: VolumeClient,
    backups: BackupOrchestrator,
    restore: Arc<RestoreMountManager>,
    failover: FailoverEngine,
    replications: ReplicationService,
    flows: ProtectionFlowService,
    telemetry: TelemetryIngest,
    activity: ActivityProjector,
    enrollment: Arc<EnrollmentManager>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration, then initialize tracing so the logging section
    // applies from the first line
    let skybridge_config = config::SkybridgeConfig::load();
    let _log_guard = init_tracing(&skybridge_config.logging);

    if let Err(e) = skybridge_config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(anyhow::anyhow!("Invalid configuration: {}", e));
    }
    info!("Configuration loaded successfully");
    let skybridge_config = Arc::new(skybridge_config);

    // Initialize database
    let database = Arc::new(
        db::Database::new(&skybridge_config.database.url)
            .await
            .expect("Failed to connect to database"),
    );
    database.migrate().await.expect("Failed to run migrations");
    info!("Database initialized");

    let pool = database.pool().clone();
    let tracker = JobTracker::new(pool.clone());

    let repositories =
        RepositoryManager::new(pool.clone(), skybridge_config.paths.repositories.clone());
    repositories
        .ensure_default()
        .await
        .expect("Failed to bootstrap default repository");

    let block_servers = Arc::new(BlockServerSupervisor::new(&skybridge_config.block_server));
    block_servers
        .reconcile()
        .await
        .expect("Port reconciliation failed");

    let credentials =
        CredentialService::new(pool.clone()).expect("Failed to initialize credential service");
    let node = NodeClient::new(
        skybridge_config.node.tunnel_port,
        Duration::from_secs(skybridge_config.node.request_timeout_secs),
        skybridge_config.node.retry_attempts,
    );
    let cloudstack = CloudStackClient::new(&skybridge_config.cloudstack);
    let volumes = VolumeClient::new(
        &skybridge_config.volume_daemon.api_url,
        Duration::from_secs(skybridge_config.volume_daemon.operation_timeout_secs),
    );

    let backups = BackupOrchestrator::new(
        pool.clone(),
        tracker.clone(),
        repositories.clone(),
        block_servers.clone(),
        credentials.clone(),
        node.clone(),
    );

    let restore = Arc::new(RestoreMountManager::new(
        pool.clone(),
        skybridge_config.paths.restore_mounts.clone(),
        skybridge_config.restore.nbd_device_count,
        skybridge_config.restore.mount_idle_ttl_secs,
    ));

    let failover = FailoverEngine::new(
        pool.clone(),
        tracker.clone(),
        cloudstack.clone(),
        volumes.clone(),
        node.clone(),
        backups.clone(),
        skybridge_config.cloudstack.appliance_vm_id.clone(),
    );

    let replications = ReplicationService::new(
        pool.clone(),
        tracker.clone(),
        volumes.clone(),
        node.clone(),
        credentials.clone(),
    );

    let flows = ProtectionFlowService::new(pool.clone(), backups.clone(), replications.clone());

    let enrollment = Arc::new(EnrollmentManager::new(
        pool.clone(),
        skybridge_config.enrollment.authorized_keys_path.clone(),
        skybridge_config.enrollment.pairing_code_ttl_secs,
    ));

    let state = AppState {
        config: skybridge_config.clone(),
        database: database.clone(),
        tracker,
        repositories,
        block_servers,
        credentials,
        node,
        cloudstack,
        volumes,
        backups,
        restore: restore.clone(),
        failover,
        replications,
        flows: flows.clone(),
        telemetry: TelemetryIngest::new(pool.clone()),
        activity: ActivityProjector::new(pool.clone()),
        enrollment,
    };

    // Background scheduler: cron evaluation with dynamic reload
    let sched = Arc::new(scheduler::Scheduler::new(
        pool.clone(),
        flows,
        skybridge_config.scheduler_timezone(),
        Duration::from_secs(skybridge_config.scheduler.tick_interval_secs),
    ));
    sched.spawn();

    // Background scavenger for idle restore mounts
    let scavenger = restore.clone();
    let sweep_interval = skybridge_config.restore.cleanup_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval.max(30)));
        loop {
            interval.tick().await;
            match scavenger.sweep_idle_mounts().await {
                Ok(0) => {}
                Ok(n) => info!("Restore scavenger unmounted {} idle mount(s)", n),
                Err(e) => warn!("Restore scavenger sweep failed: {}", e),
            }
        }
    });

    let shutdown = Arc::new(shutdown::ShutdownCoordinator::new());

    let app = Router::new()
        .route("/api/health", get(health_check))
        .merge(inventory_routes())
        .merge(replication_routes())
        .merge(backup_routes())
        .merge(restore_routes())
        .merge(failover_routes())
        .merge(policy_routes())
        .merge(schedule_routes())
        .merge(group_routes())
        .merge(flow_routes())
        .merge(enrollment_routes())
        .merge(telemetry_routes())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = format!(
        "{}:{}",
        skybridge_config.server.host, skybridge_config.server.port
    )
    .parse()?;
    info!("Skybridge hub listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    let shutdown_wait = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_wait.wait_for_signal().await;
        })
        .await?;

    database.close().await;
    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(
    logging: &config::LoggingConfig,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));

    if logging.file_logging_enabled {
        let appender = tracing_appender::rolling::daily(&logging.log_dir, "skybridge-api.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}

async fn health_check(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    state.database.health_check().await?;
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    })))
}

// ---------------------------------------------------------------------------
// Inventory and VM contexts
// ---------------------------------------------------------------------------

fn inventory_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/vms", get(list_vms))
        .route("/api/v1/vms/inventory", post(push_inventory))
        .route("/api/v1/vms/:id", get(get_vm))
        .route("/api/v1/vm-contexts", get(list_vm_contexts))
        .route("/api/v1/vm-contexts/:vm_name", get(get_vm_context))
        .route(
            "/api/v1/vm-contexts/:vm_name/recent-jobs",
            get(recent_jobs_for_context),
        )
        .route(
            "/api/v1/vm-contexts/:vm_name/recent-operations",
            get(recent_operations),
        )
}

#[derive(Debug, Deserialize)]
struct InventoryDisk {
    disk_index: i64,
    #[serde(default)]
    size_gb: i64,
    #[serde(default)]
    datastore: Option<String>,
    #[serde(default)]
    vmdk_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InventoryVm {
    vmware_vm_id: String,
    vm_name: String,
    vcenter_host: String,
    #[serde(default)]
    datacenter: Option<String>,
    vm_path: String,
    #[serde(default)]
    cpus: i64,
    #[serde(default)]
    memory_mb: i64,
    #[serde(default)]
    os_type: Option<String>,
    #[serde(default)]
    power_state: Option<String>,
    #[serde(default)]
    disks: Vec<InventoryDisk>,
}

#[derive(Debug, Deserialize)]
struct InventoryPush {
    vms: Vec<InventoryVm>,
}

#[derive(Debug, Serialize)]
struct InventoryResult {
    discovered: usize,
    updated: usize,
}

async fn list_vms(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let contexts = db::contexts::list(state.database.pool()).await?;
    Ok(Json(contexts))
}

async fn push_inventory(
    State(state): State<AppState>,
    Json(push): Json<InventoryPush>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = state.database.pool();
    let mut discovered = 0;
    let mut updated = 0;

    for vm in push.vms {
        let context_id = match db::contexts::get_by_vmware_id(pool, &vm.vmware_vm_id).await {
            Ok(existing) => {
                db::contexts::update_inventory(
                    pool,
                    &existing.context_id,
                    vm.cpus,
                    vm.memory_mb,
                    vm.os_type.as_deref(),
                    vm.power_state.as_deref(),
                )
                .await?;
                updated += 1;
                existing.context_id
            }
            Err(skybridge_common::Error::NotFound(_)) => {
                let context_id = format!("ctx-{}-{}", vm.vm_name, &uuid::Uuid::new_v4().to_string()[..8]);
                db::contexts::create(
                    pool,
                    &db::contexts::VmContext {
                        context_id: context_id.clone(),
                        vmware_vm_id: vm.vmware_vm_id.clone(),
                        vm_name: vm.vm_name.clone(),
                        vcenter_host: vm.vcenter_host.clone(),
                        datacenter: vm.datacenter.clone(),
                        vm_path: vm.vm_path.clone(),
                        credential_id: None,
                        cpus: vm.cpus,
                        memory_mb: vm.memory_mb,
                        os_type: vm.os_type.clone(),
                        power_state: vm.power_state.clone(),
                        scheduler_enabled: true,
                        status: "discovered".to_string(),
                        current_job_id: None,
                        created_at: chrono::Utc::now().timestamp(),
                        updated_at: chrono::Utc::now().timestamp(),
                    },
                )
                .await?;
                discovered += 1;
                context_id
            }
            Err(e) => return Err(e.into()),
        };

        for disk in &vm.disks {
            db::disks::upsert(
                pool,
                &db::disks::VmDiskRecord {
                    id: format!("disk-{}-{}", context_id, disk.disk_index),
                    context_id: context_id.clone(),
                    disk_index: disk.disk_index,
                    size_gb: disk.size_gb,
                    datastore: disk.datastore.clone(),
                    vmdk_path: disk.vmdk_path.clone(),
                    disk_change_id: String::new(),
                    updated_at: chrono::Utc::now().timestamp(),
                },
            )
            .await?;
        }
    }

    Ok(Json(InventoryResult {
        discovered,
        updated,
    }))
}

async fn get_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = state.database.pool();

    let context = match db::contexts::get(pool, &id).await {
        Ok(ctx) => ctx,
        Err(skybridge_common::Error::NotFound(_)) => {
            match db::contexts::get_by_vmware_id(pool, &id).await {
                Ok(ctx) => ctx,
                Err(skybridge_common::Error::NotFound(_)) => {
                    db::contexts::get_by_name(pool, &id).await?
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(e) => return Err(e.into()),
    };

    let disks = db::disks::list_for_context(pool, &context.context_id).await?;
    Ok(Json(serde_json::json!({
        "context": context,
        "disks": disks,
    })))
}

async fn list_vm_contexts(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let contexts = db::contexts::list(state.database.pool()).await?;
    Ok(Json(contexts))
}

async fn get_vm_context(
    State(state): State<AppState>,
    Path(vm_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = state.database.pool();
    let context = db::contexts::get_by_name(pool, &vm_name).await?;
    let disks = db::disks::list_for_context(pool, &context.context_id).await?;
    Ok(Json(serde_json::json!({
        "context": context,
        "disks": disks,
    })))
}

async fn recent_jobs_for_context(
    State(state): State<AppState>,
    Path(context_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let jobs = state.tracker.get_jobs_by_context_id(&context_id, 20).await?;
    Ok(Json(jobs))
}

async fn recent_operations(
    State(state): State<AppState>,
    Path(context_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let feed = state.activity.recent_operations(&context_id).await?;
    Ok(Json(feed))
}

// ---------------------------------------------------------------------------
// Replication
// ---------------------------------------------------------------------------

fn replication_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/replications",
            get(list_replications).post(start_replication),
        )
        .route("/api/v1/replications/changeid", get(replication_change_id))
        .route(
            "/api/v1/replications/:id",
            get(get_replication)
                .put(update_replication)
                .delete(delete_replication),
        )
        .route(
            "/api/v1/replications/:id/changeid",
            post(store_replication_change_id),
        )
        .route("/api/v1/replications/:id/progress", get(replication_progress))
        .route("/api/v1/progress/:id", get(proxy_progress))
}

#[derive(Debug, Deserialize)]
struct ReplicationListQuery {
    #[serde(default)]
    context_id: Option<String>,
}

async fn list_replications(
    State(state): State<AppState>,
    Query(query): Query<ReplicationListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let jobs = state.replications.list(query.context_id.as_deref()).await?;
    Ok(Json(jobs))
}

async fn start_replication(
    State(state): State<AppState>,
    Json(request): Json<replication::StartReplicationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.replications.start_replication(request).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_replication(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.replications.get(&id).await?))
}

async fn update_replication(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<replication::UpdateReplicationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.replications.update(&id, request).await?))
}

async fn delete_replication(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.replications.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ChangeIdQuery {
    vm_path: String,
    #[serde(default)]
    disk_id: Option<String>,
}

async fn replication_change_id(
    State(state): State<AppState>,
    Query(query): Query<ChangeIdQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let change_id = state
        .replications
        .change_id_by_path(&query.vm_path, query.disk_id.as_deref())
        .await?;
    Ok(Json(serde_json::json!({
        "vm_path": query.vm_path,
        "change_id": change_id,
    })))
}

async fn store_replication_change_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<replication::StoreChangeIdRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.replications.store_change_id(&id, request).await?;
    Ok(StatusCode::OK)
}

async fn replication_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.replications.progress(&id).await?))
}

async fn proxy_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.replications.proxy_progress(&id).await?))
}

// ---------------------------------------------------------------------------
// Backup
// ---------------------------------------------------------------------------

fn backup_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/backups", get(list_backups).post(start_backup))
        .route("/api/v1/backups/stats", get(backup_stats))
        .route("/api/v1/backups/changeid", get(backup_change_id))
        .route(
            "/api/v1/backups/:id",
            get(get_backup).delete(delete_backup),
        )
        .route("/api/v1/backups/:id/chain", get(backup_chain))
        .route("/api/v1/backups/:id/complete", post(complete_backup))
        .route("/api/v1/backups/:id/copies", get(list_backup_copies))
        .route("/api/v1/backups/:id/copy", post(copy_backup))
}

#[derive(Debug, Deserialize)]
struct BackupListQuery {
    #[serde(default)]
    vm_name: Option<String>,
    #[serde(default)]
    repository_id: Option<String>,
}

async fn list_backups(
    State(state): State<AppState>,
    Query(query): Query<BackupListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let backups = state
        .backups
        .list_backups(query.vm_name.as_deref(), query.repository_id.as_deref())
        .await?;
    Ok(Json(backups))
}

async fn start_backup(
    State(state): State<AppState>,
    Json(request): Json<backup::StartBackupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.backups.start_vm_backup(request).await?;
    Ok(Json(response))
}

async fn backup_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.backups.stats().await?))
}

#[derive(Debug, Deserialize)]
struct BackupChangeIdQuery {
    vm_name: String,
    disk_id: i64,
}

async fn backup_change_id(
    State(state): State<AppState>,
    Query(query): Query<BackupChangeIdQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let change_id = state
        .backups
        .change_id_for_disk(&query.vm_name, query.disk_id)
        .await?;
    Ok(Json(serde_json::json!({
        "vm_name": query.vm_name,
        "disk_id": query.disk_id,
        "change_id": change_id,
    })))
}

async fn get_backup(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let parent = state.backups.get_backup(&id).await?;
    let disks = state.backups.get_backup_disks(&id).await?;
    Ok(Json(serde_json::json!({
        "backup": parent,
        "disks": disks,
    })))
}

async fn delete_backup(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.backups.delete_backup(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `/backups/{vm_name}/chain`: the id segment is the VM name here
async fn backup_chain(
    State(state): State<AppState>,
    Path(vm_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.backups.chains_for_vm(&vm_name).await?))
}

#[derive(Debug, Deserialize)]
struct CompleteBackupRequest {
    disk_id: i64,
    #[serde(default)]
    change_id: Option<String>,
    #[serde(default)]
    bytes_transferred: i64,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

async fn complete_backup(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CompleteBackupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.status.as_deref() == Some("failed") {
        state
            .backups
            .fail_backup(
                &id,
                request.disk_id,
                request.error_message.as_deref().unwrap_or("transfer failed"),
            )
            .await?;
        return Ok(Json(serde_json::json!({ "status": "failed" })));
    }

    let change_id = request.change_id.unwrap_or_default();
    let disk = state
        .backups
        .complete_backup(&id, request.disk_id, &change_id, request.bytes_transferred)
        .await?;
    Ok(Json(serde_json::to_value(disk)?))
}

async fn list_backup_copies(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.backups.list_copies(&id).await?))
}

#[derive(Debug, Deserialize)]
struct CopyBackupRequest {
    #[serde(default)]
    repository_id: Option<String>,
    #[serde(default)]
    policy_id: Option<String>,
}

async fn copy_backup(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CopyBackupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // A policy binds the target repository; an explicit repository wins
    let (target_repository, policy_id) = match (&request.repository_id, &request.policy_id) {
        (Some(repo), policy) => (repo.clone(), policy.clone()),
        (None, Some(policy)) => {
            let policy_record = db::policies::get(state.database.pool(), policy).await?;
            (policy_record.copy_repository_id, Some(policy.clone()))
        }
        (None, None) => {
            return Err(ApiError::BadRequest(
                "copy requires repository_id or policy_id".to_string(),
            ))
        }
    };

    let copy = state
        .backups
        .copy_backup(&id, &target_repository, policy_id.as_deref())
        .await?;
    Ok(Json(copy))
}

// ---------------------------------------------------------------------------
// Restore
// ---------------------------------------------------------------------------

fn restore_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/restore/mount", post(mount_backup))
        .route("/api/v1/restore/mounts", get(list_restore_mounts))
        .route("/api/v1/restore/resources", get(restore_resources))
        .route("/api/v1/restore/cleanup-status", get(restore_cleanup_status))
        .route("/api/v1/restore/:id", delete(unmount_backup))
        .route("/api/v1/restore/:id/files", get(restore_list_files))
        .route("/api/v1/restore/:id/file-info", get(restore_file_info))
        .route("/api/v1/restore/:id/download", get(restore_download_file))
        .route(
            "/api/v1/restore/:id/download-directory",
            get(restore_download_directory),
        )
}

#[derive(Debug, Deserialize)]
struct MountRequest {
    backup_id: String,
    #[serde(default)]
    disk_index: i64,
}

async fn mount_backup(
    State(state): State<AppState>,
    Json(request): Json<MountRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mount = state
        .restore
        .mount(&request.backup_id, request.disk_index)
        .await?;
    Ok(Json(mount))
}

async fn list_restore_mounts(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.restore.list_mounts().await?))
}

async fn unmount_backup(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.restore.unmount(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct FilesQuery {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    recursive: bool,
}

async fn restore_list_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<FilesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let files = state
        .restore
        .list_files(&id, query.path.as_deref().unwrap_or("/"), query.recursive)
        .await?;
    Ok(Json(files))
}

#[derive(Debug, Deserialize)]
struct PathQuery {
    path: String,
}

async fn restore_file_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.restore.file_info(&id, &query.path).await?))
}

async fn restore_download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let file_path = state.restore.download_path(&id, &query.path).await?;
    let file = tokio::fs::File::open(&file_path)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to open file: {}", e)))?;

    let filename = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());

    let stream = tokio_util::io::ReaderStream::new(file);
    let body = Body::from_stream(stream);

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        body,
    ))
}

#[derive(Debug, Deserialize)]
struct DirectoryDownloadQuery {
    path: String,
    #[serde(default = "default_archive_format")]
    format: String,
}

fn default_archive_format() -> String {
    "zip".to_string()
}

async fn restore_download_directory(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DirectoryDownloadQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let format = ArchiveFormat::parse(&query.format).map_err(ApiError::from)?;
    let (archive_path, download_name) = state
        .restore
        .download_directory(&id, &query.path, format)
        .await?;

    let file = tokio::fs::File::open(&archive_path)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to open archive: {}", e)))?;
    let stream = tokio_util::io::ReaderStream::new(file);
    let body = Body::from_stream(stream);

    // The spooled archive is removed after a grace period long enough to
    // cover the slowest plausible download
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        let _ = tokio::fs::remove_file(&archive_path).await;
    });

    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", download_name),
            ),
        ],
        body,
    ))
}

async fn restore_resources(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.restore.resources().await?))
}

async fn restore_cleanup_status(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.restore.cleanup_status().await))
}

// ---------------------------------------------------------------------------
// Failover
// ---------------------------------------------------------------------------

fn failover_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/failover/live", post(live_failover))
        .route("/api/v1/failover/test", post(test_failover))
        .route("/api/v1/failover/unified", post(unified_failover))
        .route("/api/v1/failover/test/:id", delete(end_test_failover))
        .route("/api/v1/failover/cleanup/:vm_name", post(cleanup_failover))
        .route("/api/v1/failover/jobs", get(list_failover_jobs))
        .route("/api/v1/failover/rollback", post(execute_rollback))
        .route(
            "/api/v1/failover/rollback/decision/:failover_type/:vm_name",
            get(rollback_decision),
        )
        .route(
            "/api/v1/failover/preflight/config/:failover_type/:vm_name",
            get(preflight_config),
        )
        .route(
            "/api/v1/failover/preflight/validate",
            post(preflight_validate),
        )
        .route("/api/v1/failover/:id/status", get(failover_status))
        .route("/api/v1/failover/:id/readiness", get(failover_readiness))
}

async fn accept_failover(
    state: &AppState,
    mut request: UnifiedFailoverRequest,
    forced_type: Option<FailoverType>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(failover_type) = forced_type {
        request.failover_type = failover_type;
    }

    let failover_id = state.failover.execute_unified_failover(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "job_id": failover_id })),
    ))
}

async fn live_failover(
    State(state): State<AppState>,
    Json(request): Json<UnifiedFailoverRequest>,
) -> Result<impl IntoResponse, ApiError> {
    accept_failover(&state, request, Some(FailoverType::Live)).await
}

async fn test_failover(
    State(state): State<AppState>,
    Json(request): Json<UnifiedFailoverRequest>,
) -> Result<impl IntoResponse, ApiError> {
    accept_failover(&state, request, Some(FailoverType::Test)).await
}

async fn unified_failover(
    State(state): State<AppState>,
    Json(request): Json<UnifiedFailoverRequest>,
) -> Result<impl IntoResponse, ApiError> {
    accept_failover(&state, request, None).await
}

/// Tearing a test failover down is a rollback of its failover job
async fn end_test_failover(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let failover = state.failover.get_failover(&id).await?;
    if failover.failover_type != "test" {
        return Err(ApiError::BadRequest(format!(
            "failover '{}' is a {} failover",
            id, failover.failover_type
        )));
    }

    let job_id = state
        .failover
        .execute_rollback(RollbackRequest {
            vm_name: failover.vm_name,
            failover_type: FailoverType::Test,
            context_id: Some(failover.context_id),
            vmware_vm_id: Some(failover.vmware_vm_id),
            power_on_source: false,
            force_cleanup: false,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "job_id": job_id })),
    ))
}

/// Best-effort cleanup of whatever a test failover left for a VM
async fn cleanup_failover(
    State(state): State<AppState>,
    Path(vm_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = state
        .failover
        .execute_rollback(RollbackRequest {
            vm_name,
            failover_type: FailoverType::Test,
            context_id: None,
            vmware_vm_id: None,
            power_on_source: false,
            force_cleanup: true,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "job_id": job_id })),
    ))
}

async fn failover_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let failover = state.failover.get_failover(&id).await?;
    let job = state.tracker.find_job_by_any_id(&id).await.ok();
    Ok(Json(serde_json::json!({
        "failover": failover,
        "job": job,
    })))
}

async fn failover_readiness(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.failover.readiness(&id).await?))
}

async fn list_failover_jobs(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.failover.list_failovers().await?))
}

async fn execute_rollback(
    State(state): State<AppState>,
    Json(request): Json<RollbackRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = state.failover.execute_rollback(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "job_id": job_id })),
    ))
}

async fn rollback_decision(
    State(state): State<AppState>,
    Path((failover_type, vm_name)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let failover_type: FailoverType = failover_type.parse().map_err(ApiError::from)?;
    Ok(Json(
        state.failover.rollback_decision(failover_type, &vm_name).await?,
    ))
}

async fn preflight_config(
    State(_state): State<AppState>,
    Path((failover_type, vm_name)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let failover_type: FailoverType = failover_type.parse().map_err(ApiError::from)?;
    let config = failover::preflight_config(failover_type);
    Ok(Json(serde_json::json!({
        "vm_name": vm_name,
        "config": config,
    })))
}

async fn preflight_validate(
    State(state): State<AppState>,
    Json(request): Json<UnifiedFailoverRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = state.database.pool();
    let context = db::contexts::get(pool, &request.context_id).await?;
    let volumes = db::replications::list(pool, Some(&request.context_id))
        .await?
        .into_iter()
        .find(|j| j.status == "completed");
    let volume_records = match volumes {
        Some(job) => db::replications::list_volumes(pool, &job.id).await?,
        None => Vec::new(),
    };

    let checks = state
        .failover
        .preflight_checks(&request, &context, &volume_records)
        .await?;
    let passed = checks.iter().all(|c| c.status != "error");
    Ok(Json(serde_json::json!({
        "passed": passed,
        "checks": checks,
    })))
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

fn policy_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/policies", get(list_policies).post(create_policy))
        .route(
            "/api/v1/policies/:id",
            get(get_policy).delete(delete_policy),
        )
}

#[derive(Debug, Deserialize)]
struct CreatePolicyRequest {
    name: String,
    copy_repository_id: String,
    #[serde(default = "default_retention_days")]
    retention_days: i64,
    #[serde(default = "default_policy_enabled")]
    enabled: bool,
}

fn default_retention_days() -> i64 {
    30
}

fn default_policy_enabled() -> bool {
    true
}

async fn create_policy(
    State(state): State<AppState>,
    Json(request): Json<CreatePolicyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = state.database.pool();

    // The copy target must be a known repository
    db::repositories::get(pool, &request.copy_repository_id).await?;

    let policy = db::policies::PolicyRecord {
        id: format!("policy-{}", uuid::Uuid::new_v4()),
        name: request.name,
        copy_repository_id: request.copy_repository_id,
        retention_days: request.retention_days.max(1),
        enabled: request.enabled,
        created_at: chrono::Utc::now().timestamp(),
    };
    db::policies::create(pool, &policy).await?;
    Ok((StatusCode::CREATED, Json(policy)))
}

async fn list_policies(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(db::policies::list(state.database.pool()).await?))
}

async fn get_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(db::policies::get(state.database.pool(), &id).await?))
}

async fn delete_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    db::policies::delete(state.database.pool(), &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

fn schedule_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/schedules",
            get(list_schedules).post(create_schedule),
        )
        .route(
            "/api/v1/schedules/:id",
            get(get_schedule).put(update_schedule).delete(delete_schedule),
        )
        .route("/api/v1/schedules/:id/enable", post(enable_schedule))
        .route("/api/v1/schedules/:id/trigger", post(trigger_schedule))
        .route("/api/v1/schedules/:id/executions", get(schedule_executions))
}

async fn create_schedule(
    State(state): State<AppState>,
    Json(request): Json<scheduler::CreateScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let schedule = scheduler::create_schedule(state.database.pool(), request).await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

async fn list_schedules(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        db::schedules::list(state.database.pool(), false).await?,
    ))
}

async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(db::schedules::get(state.database.pool(), &id).await?))
}

#[derive(Debug, Deserialize)]
struct UpdateScheduleRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    cron_expression: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    max_concurrent_jobs: Option<i64>,
    #[serde(default)]
    retry_attempts: Option<i64>,
    #[serde(default)]
    retry_delay_minutes: Option<i64>,
    #[serde(default)]
    skip_if_running: Option<bool>,
}

async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = state.database.pool();
    let mut schedule = db::schedules::get(pool, &id).await?;

    if let Some(cron_expression) = request.cron_expression {
        scheduler::parse_cron(&cron_expression).map_err(ApiError::from)?;
        schedule.cron_expression = cron_expression;
    }
    if let Some(name) = request.name {
        schedule.name = name;
    }
    if let Some(timezone) = request.timezone {
        timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| ApiError::BadRequest(format!("unknown timezone '{}'", timezone)))?;
        schedule.timezone = Some(timezone);
    }
    if let Some(enabled) = request.enabled {
        schedule.enabled = enabled;
    }
    if let Some(cap) = request.max_concurrent_jobs {
        schedule.max_concurrent_jobs = cap.max(1);
    }
    if let Some(retries) = request.retry_attempts {
        schedule.retry_attempts = retries.max(0);
    }
    if let Some(delay) = request.retry_delay_minutes {
        schedule.retry_delay_minutes = delay.max(1);
    }
    if let Some(skip) = request.skip_if_running {
        schedule.skip_if_running = skip;
    }

    db::schedules::update(pool, &schedule).await?;
    Ok(Json(schedule))
}

async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    db::schedules::delete(state.database.pool(), &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct EnableRequest {
    #[serde(default = "default_policy_enabled")]
    enabled: bool,
}

async fn enable_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<EnableRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let enabled = body.map(|Json(r)| r.enabled).unwrap_or(true);
    db::schedules::set_enabled(state.database.pool(), &id, enabled).await?;
    Ok(StatusCode::OK)
}

/// Manual trigger: run every flow bound to the schedule right now
async fn trigger_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = state.database.pool();
    let schedule = db::schedules::get(pool, &id).await?;
    let flows = state.flows.list_for_schedule(&id).await?;

    if flows.is_empty() {
        return Err(ApiError::PreconditionFailed(format!(
            "schedule '{}' has no flows bound",
            schedule.name
        )));
    }

    let mut summaries = Vec::new();
    for flow in flows {
        let summary = state
            .flows
            .execute_flow(&flow.id, schedule.max_concurrent_jobs)
            .await?;
        summaries.push(summary);
    }

    Ok(Json(summaries))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

async fn schedule_executions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    db::schedules::get(state.database.pool(), &id).await?;
    Ok(Json(
        db::schedules::list_executions(state.database.pool(), &id, query.limit).await?,
    ))
}

// ---------------------------------------------------------------------------
// Machine groups
// ---------------------------------------------------------------------------

fn group_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/machine-groups",
            get(list_groups).post(create_group),
        )
        .route(
            "/api/v1/machine-groups/:id",
            get(get_group).put(update_group).delete(delete_group),
        )
        .route(
            "/api/v1/machine-groups/:id/members",
            get(list_group_members).post(add_group_member),
        )
        .route(
            "/api/v1/machine-groups/:id/members/:context_id",
            delete(remove_group_member),
        )
}

#[derive(Debug, Deserialize)]
struct CreateGroupRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    schedule_id: Option<String>,
}

async fn create_group(
    State(state): State<AppState>,
    Json(request): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = state.database.pool();

    if let Some(ref schedule_id) = request.schedule_id {
        db::schedules::get(pool, schedule_id).await?;
    }

    let group = db::groups::MachineGroupRecord {
        id: format!("group-{}", uuid::Uuid::new_v4()),
        name: request.name,
        description: request.description,
        schedule_id: request.schedule_id,
        created_at: chrono::Utc::now().timestamp(),
        updated_at: chrono::Utc::now().timestamp(),
    };
    db::groups::create(pool, &group).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn list_groups(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(db::groups::list(state.database.pool()).await?))
}

async fn get_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = state.database.pool();
    let group = db::groups::get(pool, &id).await?;
    let members = db::groups::list_members(pool, &id).await?;
    Ok(Json(serde_json::json!({
        "group": group,
        "members": members,
    })))
}

#[derive(Debug, Deserialize)]
struct UpdateGroupRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    schedule_id: Option<String>,
}

async fn update_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = state.database.pool();
    let mut group = db::groups::get(pool, &id).await?;

    if let Some(name) = request.name {
        group.name = name;
    }
    if request.description.is_some() {
        group.description = request.description;
    }
    if let Some(schedule_id) = request.schedule_id {
        db::schedules::get(pool, &schedule_id).await?;
        group.schedule_id = Some(schedule_id);
    }

    db::groups::update(pool, &group).await?;
    Ok(Json(group))
}

async fn delete_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    db::groups::delete(state.database.pool(), &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct AddMemberRequest {
    context_id: String,
    #[serde(default)]
    priority: i64,
}

async fn add_group_member(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AddMemberRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = state.database.pool();
    db::groups::get(pool, &id).await?;
    db::contexts::get(pool, &request.context_id).await?;

    let membership = db::groups::GroupMembershipRecord {
        id: format!("member-{}", uuid::Uuid::new_v4()),
        group_id: id,
        context_id: request.context_id,
        enabled: true,
        priority: request.priority,
        created_at: chrono::Utc::now().timestamp(),
    };
    db::groups::add_member(pool, &membership).await?;
    Ok((StatusCode::CREATED, Json(membership)))
}

async fn list_group_members(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = state.database.pool();
    db::groups::get(pool, &id).await?;
    Ok(Json(db::groups::list_members(pool, &id).await?))
}

async fn remove_group_member(
    State(state): State<AppState>,
    Path((id, context_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    db::groups::remove_member(state.database.pool(), &id, &context_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Protection flows
// ---------------------------------------------------------------------------

fn flow_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/protection-flows",
            get(list_flows).post(create_flow),
        )
        .route("/api/v1/protection-flows/summary", get(flow_summary))
        .route("/api/v1/protection-flows/bulk-enable", post(bulk_enable_flows))
        .route(
            "/api/v1/protection-flows/bulk-disable",
            post(bulk_disable_flows),
        )
        .route(
            "/api/v1/protection-flows/bulk-delete",
            post(bulk_delete_flows),
        )
        .route(
            "/api/v1/protection-flows/:id",
            get(get_flow).put(update_flow).delete(delete_flow),
        )
        .route("/api/v1/protection-flows/:id/enable", post(enable_flow))
        .route("/api/v1/protection-flows/:id/disable", post(disable_flow))
        .route("/api/v1/protection-flows/:id/execute", post(execute_flow))
        .route("/api/v1/protection-flows/:id/executions", get(flow_executions))
        .route("/api/v1/protection-flows/:id/status", get(flow_status))
        .route("/api/v1/protection-flows/:id/test", post(test_flow))
}

async fn create_flow(
    State(state): State<AppState>,
    Json(request): Json<flows::CreateFlowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let flow = state.flows.create(request).await?;
    Ok((StatusCode::CREATED, Json(flow)))
}

async fn list_flows(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.flows.list().await?))
}

async fn get_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.flows.get(&id).await?))
}

#[derive(Debug, Deserialize)]
struct UpdateFlowRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    repository_id: Option<String>,
    #[serde(default)]
    policy_id: Option<String>,
    #[serde(default)]
    schedule_id: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
}

async fn update_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateFlowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut flow = state.flows.get(&id).await?;

    if let Some(name) = request.name {
        flow.name = name;
    }
    if request.repository_id.is_some() {
        flow.repository_id = request.repository_id;
    }
    if request.policy_id.is_some() {
        flow.policy_id = request.policy_id;
    }
    if request.schedule_id.is_some() {
        flow.schedule_id = request.schedule_id;
    }
    if let Some(enabled) = request.enabled {
        flow.enabled = enabled;
    }

    state.flows.update(flow.clone()).await?;
    Ok(Json(flow))
}

async fn delete_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.flows.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn enable_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.flows.set_enabled(&id, true).await?;
    Ok(StatusCode::OK)
}

async fn disable_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.flows.set_enabled(&id, false).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct ExecuteFlowRequest {
    #[serde(default)]
    max_concurrent: Option<i64>,
}

async fn execute_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ExecuteFlowRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let flow = state.flows.get(&id).await?;

    // Cap precedence: explicit body, then the bound schedule, then 1
    let cap = match body.and_then(|Json(r)| r.max_concurrent) {
        Some(cap) => cap,
        None => match &flow.schedule_id {
            Some(schedule_id) => {
                db::schedules::get(state.database.pool(), schedule_id)
                    .await
                    .map(|s| s.max_concurrent_jobs)
                    .unwrap_or(1)
            }
            None => 1,
        },
    };

    let summary = state.flows.execute_flow(&id, cap).await?;
    Ok(Json(summary))
}

async fn flow_executions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.flows.executions(&id, query.limit).await?))
}

async fn flow_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.flows.status(&id).await?))
}

/// Dry-run: which VMs would this flow touch right now
async fn test_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let flow = state.flows.get(&id).await?;
    let targets = state.flows.resolve_targets(&flow).await?;
    Ok(Json(serde_json::json!({
        "flow_id": flow.id,
        "targets": targets,
    })))
}

async fn flow_summary(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.flows.summary().await?))
}

async fn bulk_enable_flows(
    State(state): State<AppState>,
    Json(request): Json<flows::BulkFlowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let changed = state.flows.bulk_enabled(&request.flow_ids, true).await?;
    Ok(Json(serde_json::json!({ "changed": changed })))
}

async fn bulk_disable_flows(
    State(state): State<AppState>,
    Json(request): Json<flows::BulkFlowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let changed = state.flows.bulk_enabled(&request.flow_ids, false).await?;
    Ok(Json(serde_json::json!({ "changed": changed })))
}

async fn bulk_delete_flows(
    State(state): State<AppState>,
    Json(request): Json<flows::BulkFlowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.flows.bulk_delete(&request.flow_ids).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

// ---------------------------------------------------------------------------
// Node enrollment
// ---------------------------------------------------------------------------

fn enrollment_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/node/pairing-code", post(issue_pairing_code))
        .route("/api/v1/node/enroll", post(enroll_node))
        .route("/api/v1/node/verify", post(verify_node))
        .route("/api/v1/node/enrollments", get(list_enrollments))
        .route(
            "/api/v1/node/enrollments/:id/approve",
            post(approve_enrollment),
        )
        .route(
            "/api/v1/node/enrollments/:id/reject",
            post(reject_enrollment),
        )
        .route("/api/v1/node/connections", get(list_connections))
        .route(
            "/api/v1/node/connections/:id/revoke",
            post(revoke_connection),
        )
        .route("/api/v1/node/audit", get(enrollment_audit))
}

async fn issue_pairing_code(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.enrollment.issue_pairing_code(None).await?))
}

async fn enroll_node(
    State(state): State<AppState>,
    Json(request): Json<enrollment::EnrollRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.enrollment.enroll(request).await?))
}

async fn verify_node(
    State(state): State<AppState>,
    Json(request): Json<enrollment::VerifyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.enrollment.verify(request).await?;
    Ok(StatusCode::OK)
}

async fn list_enrollments(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.enrollment.list_enrollments().await?))
}

async fn approve_enrollment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<enrollment::ApproveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.enrollment.approve(&id, request).await?))
}

#[derive(Debug, Deserialize)]
struct ActorRequest {
    #[serde(default = "default_actor")]
    actor: String,
}

fn default_actor() -> String {
    "admin".to_string()
}

async fn reject_enrollment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ActorRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.enrollment.reject(&id, &request.actor).await?;
    Ok(StatusCode::OK)
}

async fn list_connections(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.enrollment.list_connections().await?))
}

async fn revoke_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ActorRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = body
        .map(|Json(r)| r.actor)
        .unwrap_or_else(default_actor);
    state.enrollment.revoke(&id, &actor).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
}

async fn enrollment_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state
            .enrollment
            .audit_log(query.event_type.as_deref(), query.limit)
            .await?,
    ))
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

fn telemetry_routes() -> Router<AppState> {
    Router::new().route(
        "/api/v1/telemetry/:job_type/:job_id",
        post(ingest_telemetry),
    )
}

async fn ingest_telemetry(
    State(state): State<AppState>,
    Path((job_type, job_id)): Path<(String, String)>,
    Json(update): Json<TelemetryUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    state.telemetry.ingest(&job_type, &job_id, update).await?;
    Ok(StatusCode::OK)
}
