///! Database migrations

use skybridge_common::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Create migrations table
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            executed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| {
        skybridge_common::Error::System(format!("Failed to create migrations table: {}", e))
    })?;

    // Run migrations in order
    run_migration(pool, "001_create_vm_contexts", MIGRATION_001_VM_CONTEXTS).await?;
    run_migration(pool, "002_create_vm_disks", MIGRATION_002_VM_DISKS).await?;
    run_migration(pool, "003_create_job_tracking", MIGRATION_003_JOB_TRACKING).await?;
    run_migration(pool, "004_create_repositories", MIGRATION_004_REPOSITORIES).await?;
    run_migration(pool, "005_create_backups", MIGRATION_005_BACKUPS).await?;
    run_migration(pool, "006_create_replications", MIGRATION_006_REPLICATIONS).await?;
    run_migration(pool, "007_create_failovers", MIGRATION_007_FAILOVERS).await?;
    run_migration(pool, "008_create_schedules", MIGRATION_008_SCHEDULES).await?;
    run_migration(pool, "009_create_machine_groups", MIGRATION_009_MACHINE_GROUPS).await?;
    run_migration(pool, "010_create_protection_flows", MIGRATION_010_PROTECTION_FLOWS).await?;
    run_migration(pool, "011_create_policies", MIGRATION_011_POLICIES).await?;
    run_migration(pool, "012_create_credentials", MIGRATION_012_CREDENTIALS).await?;
    run_migration(pool, "013_create_enrollments", MIGRATION_013_ENROLLMENTS).await?;
    run_migration(pool, "014_create_restore_mounts", MIGRATION_014_RESTORE_MOUNTS).await?;

    Ok(())
}

async fn run_migration(pool: &SqlitePool, name: &str, sql: &str) -> Result<()> {
    use sqlx::Row;

    // Check if migration already ran
    let row = sqlx::query("SELECT COUNT(*) as count FROM migrations WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await
        .map_err(|e| skybridge_common::Error::System(format!("Migration check failed: {}", e)))?;

    let count: i64 = row.get("count");
    if count > 0 {
        tracing::debug!("Migration {} already applied", name);
        return Ok(());
    }

    tracing::info!("Running migration: {}", name);

    sqlx::query(sql)
        .execute(pool)
        .await
        .map_err(|e| {
            skybridge_common::Error::System(format!("Migration {} failed: {}", name, e))
        })?;

    sqlx::query("INSERT INTO migrations (name) VALUES (?)")
        .bind(name)
        .execute(pool)
        .await
        .map_err(|e| {
            skybridge_common::Error::System(format!("Failed to record migration: {}", e))
        })?;

    tracing::info!("Migration {} completed", name);

    Ok(())
}

const MIGRATION_001_VM_CONTEXTS: &str = "
CREATE TABLE vm_replication_contexts (
    context_id TEXT PRIMARY KEY,
    vmware_vm_id TEXT NOT NULL UNIQUE,
    vm_name TEXT NOT NULL,
    vcenter_host TEXT NOT NULL,
    datacenter TEXT,
    vm_path TEXT NOT NULL,
    credential_id TEXT,
    cpus INTEGER NOT NULL DEFAULT 0,
    memory_mb INTEGER NOT NULL DEFAULT 0,
    os_type TEXT,
    power_state TEXT,
    scheduler_enabled INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL DEFAULT 'discovered',
    current_job_id TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX idx_contexts_vm_name ON vm_replication_contexts(vm_name);
CREATE INDEX idx_contexts_status ON vm_replication_contexts(status);
";

const MIGRATION_002_VM_DISKS: &str = "
CREATE TABLE vm_disks (
    id TEXT PRIMARY KEY,
    context_id TEXT NOT NULL,
    disk_index INTEGER NOT NULL,
    size_gb INTEGER NOT NULL DEFAULT 0,
    datastore TEXT,
    vmdk_path TEXT,
    disk_change_id TEXT NOT NULL DEFAULT '',
    updated_at INTEGER NOT NULL,
    UNIQUE (context_id, disk_index),
    FOREIGN KEY (context_id) REFERENCES vm_replication_contexts(context_id)
);

CREATE INDEX idx_vm_disks_context ON vm_disks(context_id);
";

const MIGRATION_003_JOB_TRACKING: &str = "
CREATE TABLE job_tracking (
    id TEXT PRIMARY KEY,
    external_id TEXT,
    context_id TEXT,
    job_type TEXT NOT NULL,
    operation TEXT NOT NULL,
    owner TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    metadata TEXT,
    error_message TEXT,
    error_category TEXT,
    started_at INTEGER NOT NULL,
    completed_at INTEGER
);

CREATE INDEX idx_job_tracking_external ON job_tracking(external_id);
CREATE INDEX idx_job_tracking_context ON job_tracking(context_id);
CREATE INDEX idx_job_tracking_status ON job_tracking(status);

CREATE TABLE job_steps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    error_message TEXT,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    FOREIGN KEY (job_id) REFERENCES job_tracking(id) ON DELETE CASCADE
);

CREATE INDEX idx_job_steps_job ON job_steps(job_id);
";

const MIGRATION_004_REPOSITORIES: &str = "
CREATE TABLE backup_repositories (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    repo_type TEXT NOT NULL,
    config TEXT NOT NULL DEFAULT '{}',
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
);
";

const MIGRATION_005_BACKUPS: &str = "
CREATE TABLE vm_backup_contexts (
    id TEXT PRIMARY KEY,
    vm_name TEXT NOT NULL,
    repository_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (vm_name, repository_id)
);

CREATE TABLE backup_jobs (
    id TEXT PRIMARY KEY,
    vm_backup_context_id TEXT NOT NULL,
    vm_name TEXT NOT NULL,
    repository_id TEXT NOT NULL,
    backup_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    bytes_transferred INTEGER NOT NULL DEFAULT 0,
    progress_percent REAL NOT NULL DEFAULT 0,
    transfer_speed_bps INTEGER NOT NULL DEFAULT 0,
    current_phase TEXT,
    tags TEXT,
    error_message TEXT,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    FOREIGN KEY (vm_backup_context_id) REFERENCES vm_backup_contexts(id)
);

CREATE INDEX idx_backup_jobs_context ON backup_jobs(vm_backup_context_id);
CREATE INDEX idx_backup_jobs_status ON backup_jobs(status);

CREATE TABLE backup_disks (
    id TEXT PRIMARY KEY,
    backup_job_id TEXT NOT NULL,
    vm_backup_context_id TEXT NOT NULL,
    disk_index INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    qcow2_path TEXT NOT NULL,
    nbd_port INTEGER,
    export_name TEXT,
    disk_change_id TEXT NOT NULL DEFAULT '',
    bytes_transferred INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    FOREIGN KEY (backup_job_id) REFERENCES backup_jobs(id)
);

CREATE INDEX idx_backup_disks_job ON backup_disks(backup_job_id);
CREATE INDEX idx_backup_disks_chain ON backup_disks(vm_backup_context_id, disk_index, status);

CREATE TABLE backup_copies (
    id TEXT PRIMARY KEY,
    backup_job_id TEXT NOT NULL,
    policy_id TEXT,
    repository_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    error_message TEXT,
    created_at INTEGER NOT NULL,
    completed_at INTEGER,
    FOREIGN KEY (backup_job_id) REFERENCES backup_jobs(id)
);

CREATE INDEX idx_backup_copies_job ON backup_copies(backup_job_id);
";

const MIGRATION_006_REPLICATIONS: &str = "
CREATE TABLE replication_jobs (
    id TEXT PRIMARY KEY,
    context_id TEXT NOT NULL,
    vm_name TEXT NOT NULL,
    replication_type TEXT NOT NULL DEFAULT 'initial',
    status TEXT NOT NULL DEFAULT 'running',
    bytes_transferred INTEGER NOT NULL DEFAULT 0,
    progress_percent REAL NOT NULL DEFAULT 0,
    transfer_speed_bps INTEGER NOT NULL DEFAULT 0,
    current_phase TEXT,
    error_message TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    completed_at INTEGER,
    FOREIGN KEY (context_id) REFERENCES vm_replication_contexts(context_id)
);

CREATE INDEX idx_replication_jobs_context ON replication_jobs(context_id);
CREATE INDEX idx_replication_jobs_status ON replication_jobs(status);

CREATE TABLE replication_volumes (
    id TEXT PRIMARY KEY,
    replication_job_id TEXT NOT NULL,
    disk_index INTEGER NOT NULL,
    volume_id TEXT NOT NULL,
    mount_point TEXT,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (replication_job_id) REFERENCES replication_jobs(id)
);

CREATE INDEX idx_replication_volumes_job ON replication_volumes(replication_job_id);

CREATE TABLE cbt_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    replication_job_id TEXT NOT NULL,
    vm_path TEXT NOT NULL,
    disk_id TEXT NOT NULL DEFAULT 'disk-2000',
    change_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (replication_job_id) REFERENCES replication_jobs(id)
);

CREATE INDEX idx_cbt_history_job ON cbt_history(replication_job_id);
CREATE INDEX idx_cbt_history_path ON cbt_history(vm_path);
";

const MIGRATION_007_FAILOVERS: &str = "
CREATE TABLE failover_jobs (
    id TEXT PRIMARY KEY,
    context_id TEXT NOT NULL,
    replication_job_id TEXT,
    vm_name TEXT NOT NULL,
    vmware_vm_id TEXT NOT NULL,
    failover_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    destination_vm_id TEXT,
    snapshot_id TEXT,
    error_message TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    completed_at INTEGER,
    FOREIGN KEY (context_id) REFERENCES vm_replication_contexts(context_id)
);

CREATE INDEX idx_failover_jobs_context ON failover_jobs(context_id);
CREATE INDEX idx_failover_jobs_vm ON failover_jobs(vm_name);
";

const MIGRATION_008_SCHEDULES: &str = "
CREATE TABLE schedules (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    cron_expression TEXT NOT NULL,
    timezone TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    max_concurrent_jobs INTEGER NOT NULL DEFAULT 1,
    retry_attempts INTEGER NOT NULL DEFAULT 0,
    retry_delay_minutes INTEGER NOT NULL DEFAULT 5,
    skip_if_running INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE schedule_executions (
    id TEXT PRIMARY KEY,
    schedule_id TEXT NOT NULL,
    fire_minute TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    vms_selected INTEGER NOT NULL DEFAULT 0,
    details TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE (schedule_id, fire_minute),
    FOREIGN KEY (schedule_id) REFERENCES schedules(id) ON DELETE CASCADE
);

CREATE INDEX idx_schedule_executions_schedule ON schedule_executions(schedule_id);
";

const MIGRATION_009_MACHINE_GROUPS: &str = "
CREATE TABLE machine_groups (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    schedule_id TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    FOREIGN KEY (schedule_id) REFERENCES schedules(id)
);

CREATE TABLE group_memberships (
    id TEXT PRIMARY KEY,
    group_id TEXT NOT NULL,
    context_id TEXT NOT NULL UNIQUE,
    enabled INTEGER NOT NULL DEFAULT 1,
    priority INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (group_id) REFERENCES machine_groups(id) ON DELETE CASCADE,
    FOREIGN KEY (context_id) REFERENCES vm_replication_contexts(context_id)
);

CREATE INDEX idx_group_memberships_group ON group_memberships(group_id);
";

const MIGRATION_010_PROTECTION_FLOWS: &str = "
CREATE TABLE protection_flows (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    flow_type TEXT NOT NULL,
    target_type TEXT NOT NULL,
    target_id TEXT NOT NULL,
    repository_id TEXT,
    policy_id TEXT,
    schedule_id TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_execution_id TEXT,
    last_execution_status TEXT,
    last_execution_at INTEGER,
    next_execution_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE flow_executions (
    id TEXT PRIMARY KEY,
    flow_id TEXT NOT NULL,
    batch_id TEXT NOT NULL,
    context_id TEXT,
    vm_name TEXT,
    status TEXT NOT NULL DEFAULT 'queued',
    job_id TEXT,
    error_message TEXT,
    queued_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    FOREIGN KEY (flow_id) REFERENCES protection_flows(id) ON DELETE CASCADE
);

CREATE INDEX idx_flow_executions_flow ON flow_executions(flow_id);
CREATE INDEX idx_flow_executions_batch ON flow_executions(batch_id);
CREATE INDEX idx_flow_executions_queued ON flow_executions(queued_at);
";

const MIGRATION_011_POLICIES: &str = "
CREATE TABLE backup_policies (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    copy_repository_id TEXT NOT NULL,
    retention_days INTEGER NOT NULL DEFAULT 30,
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
);
";

const MIGRATION_012_CREDENTIALS: &str = "
CREATE TABLE vcenter_credentials (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    vcenter_host TEXT NOT NULL,
    username TEXT NOT NULL,
    password_enc TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
";

const MIGRATION_013_ENROLLMENTS: &str = "
CREATE TABLE node_enrollments (
    id TEXT PRIMARY KEY,
    pairing_code TEXT NOT NULL,
    node_name TEXT,
    node_version TEXT,
    node_public_key TEXT,
    node_fingerprint TEXT,
    challenge_nonce TEXT,
    status TEXT NOT NULL DEFAULT 'issued',
    expires_at INTEGER NOT NULL,
    approved_by TEXT,
    approved_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX idx_node_enrollments_status ON node_enrollments(status);

CREATE TABLE node_connections (
    id TEXT PRIMARY KEY,
    enrollment_id TEXT NOT NULL,
    node_name TEXT NOT NULL,
    node_fingerprint TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'connected',
    connected_at INTEGER NOT NULL,
    revoked_at INTEGER,
    FOREIGN KEY (enrollment_id) REFERENCES node_enrollments(id)
);

CREATE TABLE enrollment_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    enrollment_id TEXT,
    node_fingerprint TEXT,
    actor TEXT,
    details TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX idx_enrollment_audit_type ON enrollment_audit(event_type);
";

const MIGRATION_014_RESTORE_MOUNTS: &str = "
CREATE TABLE restore_mounts (
    id TEXT PRIMARY KEY,
    backup_job_id TEXT NOT NULL,
    backup_disk_id TEXT NOT NULL,
    disk_index INTEGER NOT NULL,
    mount_path TEXT NOT NULL,
    nbd_device TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    last_accessed_at INTEGER NOT NULL
);

CREATE INDEX idx_restore_mounts_backup ON restore_mounts(backup_job_id);
";
