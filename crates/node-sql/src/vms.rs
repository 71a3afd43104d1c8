use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgConnection;

use models::execution::{MachineType, VmType, VolumePersistence};

/// Common row of the `vms` table. Program-specific columns are null for
/// instances; the instance rootfs and all volumes live in side tables.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VmRow {
    pub item_hash: String,
    pub owner: String,
    #[sqlx(rename = "type")]
    pub vm_type: VmType,
    pub allow_amend: bool,
    pub metadata: Option<Json<Value>>,
    pub variables: Option<Json<Value>>,
    pub environment_reproducible: bool,
    pub environment_internet: bool,
    pub environment_aleph_api: bool,
    pub environment_shared_cache: bool,
    pub environment_trusted_execution: Option<Json<Value>>,
    pub resources_vcpus: i32,
    pub resources_memory: i32,
    pub resources_seconds: i32,
    pub cpu_architecture: Option<String>,
    pub cpu_vendor: Option<String>,
    pub node_owner: Option<String>,
    pub node_address_regex: Option<String>,
    pub replaces: Option<String>,
    pub created: DateTime<Utc>,
    pub authorized_keys: Option<Json<Vec<String>>>,
    pub program_type: Option<MachineType>,
    pub http_trigger: Option<bool>,
    pub persistent: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct RootfsVolumeRow {
    pub instance_hash: String,
    pub parent_ref: String,
    pub parent_use_latest: bool,
    pub size_mib: i64,
    pub persistence: VolumePersistence,
}

#[derive(Debug, Clone)]
pub struct CodeVolumeRow {
    pub program_hash: String,
    pub ref_: String,
    pub use_latest: bool,
    pub encoding: String,
    pub entrypoint: String,
}

#[derive(Debug, Clone)]
pub struct RuntimeVolumeRow {
    pub program_hash: String,
    pub ref_: String,
    pub use_latest: bool,
    pub comment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DataVolumeRow {
    pub program_hash: String,
    pub ref_: String,
    pub use_latest: bool,
    pub encoding: String,
    pub mount: String,
}

/// One machine volume row; `volume_type` is `immutable`, `ephemeral` or
/// `persistent` and selects which of the nullable columns apply.
#[derive(Debug, Clone)]
pub struct MachineVolumeRow {
    pub vm_hash: String,
    pub volume_type: String,
    pub ref_: Option<String>,
    pub use_latest: Option<bool>,
    pub mount: Option<String>,
    pub comment: Option<String>,
    pub size_mib: Option<i64>,
    pub persistence: Option<VolumePersistence>,
    pub name: Option<String>,
    pub parent_ref: Option<String>,
    pub parent_use_latest: Option<bool>,
}

pub async fn insert_vm(conn: &mut PgConnection, vm: &VmRow) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into vms
               (item_hash, owner, type, allow_amend, metadata, variables,
                environment_reproducible, environment_internet, environment_aleph_api,
                environment_shared_cache, environment_trusted_execution,
                resources_vcpus, resources_memory, resources_seconds,
                cpu_architecture, cpu_vendor, node_owner, node_address_regex,
                replaces, created, authorized_keys, program_type, http_trigger,
                persistent)
           values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                   $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)"#,
    )
    .bind(&vm.item_hash)
    .bind(&vm.owner)
    .bind(vm.vm_type)
    .bind(vm.allow_amend)
    .bind(&vm.metadata)
    .bind(&vm.variables)
    .bind(vm.environment_reproducible)
    .bind(vm.environment_internet)
    .bind(vm.environment_aleph_api)
    .bind(vm.environment_shared_cache)
    .bind(&vm.environment_trusted_execution)
    .bind(vm.resources_vcpus)
    .bind(vm.resources_memory)
    .bind(vm.resources_seconds)
    .bind(&vm.cpu_architecture)
    .bind(&vm.cpu_vendor)
    .bind(&vm.node_owner)
    .bind(&vm.node_address_regex)
    .bind(&vm.replaces)
    .bind(vm.created)
    .bind(&vm.authorized_keys)
    .bind(vm.program_type)
    .bind(vm.http_trigger)
    .bind(vm.persistent)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_vm(conn: &mut PgConnection, item_hash: &str) -> sqlx::Result<Option<VmRow>> {
    sqlx::query_as::<_, VmRow>(
        r#"select item_hash, owner, type, allow_amend, metadata, variables,
                  environment_reproducible, environment_internet, environment_aleph_api,
                  environment_shared_cache, environment_trusted_execution,
                  resources_vcpus, resources_memory, resources_seconds,
                  cpu_architecture, cpu_vendor, node_owner, node_address_regex,
                  replaces, created, authorized_keys, program_type, http_trigger,
                  persistent
           from vms where item_hash = $1"#,
    )
    .bind(item_hash)
    .fetch_optional(conn)
    .await
}

/// VM declarations of one owner, newest first.
pub async fn get_vms_by_owner(
    conn: &mut PgConnection,
    owner: &str,
    vm_type: Option<VmType>,
    limit: i64,
    offset: i64,
) -> sqlx::Result<Vec<VmRow>> {
    sqlx::query_as::<_, VmRow>(
        r#"select item_hash, owner, type, allow_amend, metadata, variables,
                  environment_reproducible, environment_internet, environment_aleph_api,
                  environment_shared_cache, environment_trusted_execution,
                  resources_vcpus, resources_memory, resources_seconds,
                  cpu_architecture, cpu_vendor, node_owner, node_address_regex,
                  replaces, created, authorized_keys, program_type, http_trigger,
                  persistent
           from vms
           where owner = $1 and ($2::text is null or type = $2)
           order by created desc, item_hash desc
           limit $3 offset $4"#,
    )
    .bind(owner)
    .bind(vm_type)
    .bind(limit)
    .bind(offset)
    .fetch_all(conn)
    .await
}

/// Deletes a VM declaration; the rootfs and volume rows cascade.
pub async fn delete_vm(conn: &mut PgConnection, item_hash: &str) -> sqlx::Result<()> {
    sqlx::query("delete from vms where item_hash = $1")
        .bind(item_hash)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn insert_rootfs_volume(
    conn: &mut PgConnection,
    rootfs: &RootfsVolumeRow,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into instance_rootfs
               (instance_hash, parent_ref, parent_use_latest, size_mib, persistence)
           values ($1, $2, $3, $4, $5)"#,
    )
    .bind(&rootfs.instance_hash)
    .bind(&rootfs.parent_ref)
    .bind(rootfs.parent_use_latest)
    .bind(rootfs.size_mib)
    .bind(rootfs.persistence)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn insert_code_volume(
    conn: &mut PgConnection,
    volume: &CodeVolumeRow,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into program_code_volumes
               (program_hash, ref, use_latest, encoding, entrypoint)
           values ($1, $2, $3, $4, $5)"#,
    )
    .bind(&volume.program_hash)
    .bind(&volume.ref_)
    .bind(volume.use_latest)
    .bind(&volume.encoding)
    .bind(&volume.entrypoint)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn insert_runtime_volume(
    conn: &mut PgConnection,
    volume: &RuntimeVolumeRow,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into program_runtimes (program_hash, ref, use_latest, comment)
           values ($1, $2, $3, $4)"#,
    )
    .bind(&volume.program_hash)
    .bind(&volume.ref_)
    .bind(volume.use_latest)
    .bind(&volume.comment)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn insert_data_volume(
    conn: &mut PgConnection,
    volume: &DataVolumeRow,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into program_data_volumes (program_hash, ref, use_latest, encoding, mount)
           values ($1, $2, $3, $4, $5)"#,
    )
    .bind(&volume.program_hash)
    .bind(&volume.ref_)
    .bind(volume.use_latest)
    .bind(&volume.encoding)
    .bind(&volume.mount)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn insert_machine_volume(
    conn: &mut PgConnection,
    volume: &MachineVolumeRow,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into vm_machine_volumes
               (vm_hash, type, ref, use_latest, mount, comment, size_mib, persistence,
                name, parent_ref, parent_use_latest)
           values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
    )
    .bind(&volume.vm_hash)
    .bind(&volume.volume_type)
    .bind(&volume.ref_)
    .bind(volume.use_latest)
    .bind(&volume.mount)
    .bind(&volume.comment)
    .bind(volume.size_mib)
    .bind(volume.persistence)
    .bind(&volume.name)
    .bind(&volume.parent_ref)
    .bind(volume.parent_use_latest)
    .execute(conn)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VmVersionRow {
    pub vm_hash: String,
    pub owner: String,
    pub current_version: String,
    pub last_updated: DateTime<Utc>,
}

pub async fn get_vm_version(
    conn: &mut PgConnection,
    vm_hash: &str,
) -> sqlx::Result<Option<VmVersionRow>> {
    sqlx::query_as::<_, VmVersionRow>(
        "select vm_hash, owner, current_version, last_updated from vm_versions where vm_hash = $1",
    )
    .bind(vm_hash)
    .fetch_optional(conn)
    .await
}

/// Points `vm_versions` at the newest message of the amend chain rooted at
/// `vm_hash`. When the chain is empty (everything forgotten) the pointer
/// row is removed.
pub async fn refresh_vm_version(conn: &mut PgConnection, vm_hash: &str) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into vm_versions (vm_hash, owner, current_version, last_updated)
           select $1, owner, item_hash, created
           from vms
           where item_hash = $1 or replaces = $1
           order by created desc
           limit 1
           on conflict (vm_hash) do update
           set owner = excluded.owner,
               current_version = excluded.current_version,
               last_updated = excluded.last_updated"#,
    )
    .bind(vm_hash)
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        r#"delete from vm_versions
           where vm_hash = $1
             and not exists (
                 select 1 from vms where item_hash = $1 or replaces = $1
             )"#,
    )
    .bind(vm_hash)
    .execute(conn)
    .await?;
    Ok(())
}
