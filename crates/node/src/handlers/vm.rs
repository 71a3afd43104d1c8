//! INSTANCE and PROGRAM messages: execution declarations with their
//! volume graph, version pointer and cost materialization.

use async_trait::async_trait;
use sqlx::PgConnection;

use models::execution::{InstanceContent, MachineVolume, PaymentType, ProgramContent, VmType};
use models::message::MessageContent;
use models::ErrorCode;
use node_sql::vms::{
    CodeVolumeRow, DataVolumeRow, MachineVolumeRow, RootfsVolumeRow, RuntimeVolumeRow, VmRow,
};
use node_sql::Json;

use crate::costs;
use crate::error::MessageProcessingError;

use super::{ContentHandler, ValidatedMessage};

pub struct VmHandler;

enum VmContent<'a> {
    Instance(&'a InstanceContent),
    Program(&'a ProgramContent),
}

fn vm_content(message: &ValidatedMessage) -> Result<VmContent<'_>, MessageProcessingError> {
    match &message.content {
        MessageContent::Instance(content) => Ok(VmContent::Instance(content)),
        MessageContent::Program(content) => Ok(VmContent::Program(content)),
        _ => Err(MessageProcessingError::InvalidFormat(format!(
            "unexpected content type for vm message: {}",
            message.row.item_hash
        ))),
    }
}

impl<'a> VmContent<'a> {
    fn volume_refs(&self) -> Vec<&'a str> {
        match self {
            VmContent::Instance(content) => content.volume_refs(),
            VmContent::Program(content) => content.volume_refs(),
        }
    }

    fn replaces(&self) -> Option<&'a str> {
        match self {
            VmContent::Instance(content) => content.replaces.as_deref(),
            VmContent::Program(content) => content.replaces.as_deref(),
        }
    }

    fn address(&self) -> &'a str {
        match self {
            VmContent::Instance(content) => &content.address,
            VmContent::Program(content) => &content.address,
        }
    }

    fn volumes(&self) -> &'a [MachineVolume] {
        match self {
            VmContent::Instance(content) => &content.volumes,
            VmContent::Program(content) => &content.volumes,
        }
    }
}

/// Checks that every hash a volume points at resolves to either a live
/// message file pin or a file tag.
async fn check_volume_refs(
    conn: &mut PgConnection,
    refs: &[&str],
) -> Result<(), MessageProcessingError> {
    if refs.is_empty() {
        return Ok(());
    }
    let owned: Vec<String> = refs.iter().map(|r| r.to_string()).collect();
    let pinned = node_sql::files::find_message_file_pins(conn, &owned).await?;
    let tagged = node_sql::files::find_file_tags(conn, &owned).await?;

    for ref_ in refs {
        if !pinned.iter().any(|hash| hash == ref_) && !tagged.iter().any(|tag| tag == ref_) {
            return Err(MessageProcessingError::Dependency {
                code: ErrorCode::VmVolumeNotFound,
                details: format!("volume reference {ref_} not found"),
            });
        }
    }
    Ok(())
}

/// Persistent volumes forked from a parent must be at least as large as
/// the parent file, or the data would be truncated at first boot.
async fn check_parent_volume_sizes(
    conn: &mut PgConnection,
    volumes: &[MachineVolume],
) -> Result<(), MessageProcessingError> {
    for volume in volumes {
        let MachineVolume::Persistent {
            parent: Some(parent),
            size_mib,
            name,
            ..
        } = volume
        else {
            continue;
        };

        let Some(pin) = node_sql::files::get_message_file_pin(conn, &parent.ref_).await? else {
            continue;
        };
        let Some(file) = node_sql::files::get_file(conn, &pin.file_hash).await? else {
            continue;
        };
        let parent_size_mib = (file.size as u64 + models::cost::MIB - 1) / models::cost::MIB;
        if *size_mib < parent_size_mib {
            return Err(MessageProcessingError::Dependency {
                code: ErrorCode::VmVolumeParentTooLarge,
                details: format!(
                    "volume {name}: size {size_mib} MiB is smaller than its parent ({parent_size_mib} MiB)"
                ),
            });
        }
    }
    Ok(())
}

fn vm_row(message: &ValidatedMessage) -> Result<VmRow, MessageProcessingError> {
    let row = &message.row;
    Ok(match &message.content {
        MessageContent::Instance(content) => VmRow {
            item_hash: row.item_hash.clone(),
            owner: content.address.clone(),
            vm_type: VmType::Instance,
            allow_amend: content.allow_amend,
            metadata: content.metadata.clone().map(Json),
            variables: content.variables.clone().map(Json),
            environment_reproducible: content.environment.reproducible,
            environment_internet: content.environment.internet,
            environment_aleph_api: content.environment.aleph_api,
            environment_shared_cache: content.environment.shared_cache,
            environment_trusted_execution: content.environment.trusted_execution.clone().map(Json),
            resources_vcpus: content.resources.vcpus as i32,
            resources_memory: content.resources.memory as i32,
            resources_seconds: content.resources.seconds as i32,
            cpu_architecture: content
                .requirements
                .as_ref()
                .and_then(|r| r.cpu.as_ref())
                .and_then(|cpu| cpu.architecture.map(|arch| arch.to_string())),
            cpu_vendor: content
                .requirements
                .as_ref()
                .and_then(|r| r.cpu.as_ref())
                .and_then(|cpu| cpu.vendor.clone()),
            node_owner: content
                .requirements
                .as_ref()
                .and_then(|r| r.node.as_ref())
                .and_then(|node| node.owner.clone()),
            node_address_regex: content
                .requirements
                .as_ref()
                .and_then(|r| r.node.as_ref())
                .and_then(|node| node.address_regex.clone()),
            replaces: content.replaces.clone(),
            created: row.time,
            authorized_keys: content.authorized_keys.clone().map(Json),
            program_type: None,
            http_trigger: None,
            persistent: None,
        },
        MessageContent::Program(content) => VmRow {
            item_hash: row.item_hash.clone(),
            owner: content.address.clone(),
            vm_type: VmType::Program,
            allow_amend: content.allow_amend,
            metadata: content.metadata.clone().map(Json),
            variables: content.variables.clone().map(Json),
            environment_reproducible: content.environment.reproducible,
            environment_internet: content.environment.internet,
            environment_aleph_api: content.environment.aleph_api,
            environment_shared_cache: content.environment.shared_cache,
            environment_trusted_execution: content.environment.trusted_execution.clone().map(Json),
            resources_vcpus: content.resources.vcpus as i32,
            resources_memory: content.resources.memory as i32,
            resources_seconds: content.resources.seconds as i32,
            cpu_architecture: content
                .requirements
                .as_ref()
                .and_then(|r| r.cpu.as_ref())
                .and_then(|cpu| cpu.architecture.map(|arch| arch.to_string())),
            cpu_vendor: content
                .requirements
                .as_ref()
                .and_then(|r| r.cpu.as_ref())
                .and_then(|cpu| cpu.vendor.clone()),
            node_owner: None,
            node_address_regex: None,
            replaces: content.replaces.clone(),
            created: row.time,
            authorized_keys: content.authorized_keys.clone().map(Json),
            program_type: Some(content.program_type),
            http_trigger: Some(content.on.http),
            persistent: Some(content.is_persistent()),
        },
        _ => unreachable!("vm_row is only called for instance/program messages"),
    })
}

async fn insert_machine_volumes(
    conn: &mut PgConnection,
    vm_hash: &str,
    volumes: &[MachineVolume],
) -> sqlx::Result<()> {
    for volume in volumes {
        let row = match volume {
            MachineVolume::Immutable {
                ref_,
                use_latest,
                mount,
                comment,
                estimated_size_mib,
            } => MachineVolumeRow {
                vm_hash: vm_hash.to_string(),
                volume_type: "immutable".to_string(),
                ref_: Some(ref_.clone()),
                use_latest: Some(*use_latest),
                mount: mount.clone(),
                comment: comment.clone(),
                size_mib: estimated_size_mib.map(|size| size as i64),
                persistence: None,
                name: None,
                parent_ref: None,
                parent_use_latest: None,
            },
            MachineVolume::Ephemeral {
                mount,
                size_mib,
                comment,
                ..
            } => MachineVolumeRow {
                vm_hash: vm_hash.to_string(),
                volume_type: "ephemeral".to_string(),
                ref_: None,
                use_latest: None,
                mount: Some(mount.clone()),
                comment: comment.clone(),
                size_mib: Some(*size_mib as i64),
                persistence: None,
                name: None,
                parent_ref: None,
                parent_use_latest: None,
            },
            MachineVolume::Persistent {
                persistence,
                name,
                mount,
                size_mib,
                parent,
                comment,
            } => MachineVolumeRow {
                vm_hash: vm_hash.to_string(),
                volume_type: "persistent".to_string(),
                ref_: None,
                use_latest: None,
                mount: Some(mount.clone()),
                comment: comment.clone(),
                size_mib: Some(*size_mib as i64),
                persistence: Some(*persistence),
                name: Some(name.clone()),
                parent_ref: parent.as_ref().map(|p| p.ref_.clone()),
                parent_use_latest: parent.as_ref().map(|p| p.use_latest),
            },
        };
        node_sql::vms::insert_machine_volume(conn, &row).await?;
    }
    Ok(())
}

#[async_trait]
impl ContentHandler for VmHandler {
    async fn check_dependencies(
        &self,
        conn: &mut PgConnection,
        message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        let content = vm_content(message)?;

        check_volume_refs(conn, &content.volume_refs()).await?;
        check_parent_volume_sizes(conn, content.volumes()).await?;

        if let Some(replaces) = content.replaces() {
            if node_sql::vms::get_vm(conn, replaces).await?.is_none() {
                return Err(MessageProcessingError::Dependency {
                    code: ErrorCode::VmRefNotFound,
                    details: format!("replaced vm {replaces} not found"),
                });
            }
        }
        Ok(())
    }

    async fn check_permissions(
        &self,
        conn: &mut PgConnection,
        message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        let content = vm_content(message)?;
        if content.address() != message.row.sender {
            return Err(MessageProcessingError::PermissionDenied(format!(
                "sender {} cannot declare a vm on behalf of {}",
                message.row.sender,
                content.address()
            )));
        }

        let Some(replaces) = content.replaces() else {
            return Ok(());
        };
        let Some(replaced) = node_sql::vms::get_vm(conn, replaces).await? else {
            return Err(MessageProcessingError::Dependency {
                code: ErrorCode::VmRefNotFound,
                details: format!("replaced vm {replaces} not found"),
            });
        };

        if replaced.owner != content.address() {
            return Err(MessageProcessingError::Dependency {
                code: ErrorCode::VmUpdateNotAllowed,
                details: format!("vm {replaces} belongs to another owner"),
            });
        }
        if !replaced.allow_amend {
            return Err(MessageProcessingError::Dependency {
                code: ErrorCode::VmUpdateNotAllowed,
                details: format!("vm {replaces} does not allow amendments"),
            });
        }

        // Updates must target the tip of the amend chain.
        if let Some(version) = node_sql::vms::get_vm_version(conn, replaces).await? {
            if version.current_version != replaces {
                return Err(MessageProcessingError::Dependency {
                    code: ErrorCode::VmUpdateWrongVersion,
                    details: format!(
                        "vm {replaces} was already updated by {}",
                        version.current_version
                    ),
                });
            }
        }
        Ok(())
    }

    async fn process(
        &self,
        conn: &mut PgConnection,
        message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        let row = vm_row(message)?;
        node_sql::vms::insert_vm(conn, &row).await?;

        match &message.content {
            MessageContent::Instance(content) => {
                node_sql::vms::insert_rootfs_volume(
                    conn,
                    &RootfsVolumeRow {
                        instance_hash: row.item_hash.clone(),
                        parent_ref: content.rootfs.parent.ref_.clone(),
                        parent_use_latest: content.rootfs.parent.use_latest,
                        size_mib: content.rootfs.size_mib as i64,
                        persistence: content.rootfs.persistence,
                    },
                )
                .await?;
                insert_machine_volumes(conn, &row.item_hash, &content.volumes).await?;
            }
            MessageContent::Program(content) => {
                node_sql::vms::insert_code_volume(
                    conn,
                    &CodeVolumeRow {
                        program_hash: row.item_hash.clone(),
                        ref_: content.code.ref_.clone(),
                        use_latest: content.code.use_latest,
                        encoding: content.code.encoding.clone(),
                        entrypoint: content.code.entrypoint.clone(),
                    },
                )
                .await?;
                node_sql::vms::insert_runtime_volume(
                    conn,
                    &RuntimeVolumeRow {
                        program_hash: row.item_hash.clone(),
                        ref_: content.runtime.ref_.clone(),
                        use_latest: content.runtime.use_latest,
                        comment: content.runtime.comment.clone(),
                    },
                )
                .await?;
                if let Some(data) = &content.data {
                    node_sql::vms::insert_data_volume(
                        conn,
                        &DataVolumeRow {
                            program_hash: row.item_hash.clone(),
                            ref_: data.ref_.clone(),
                            use_latest: data.use_latest,
                            encoding: data.encoding.clone(),
                            mount: data.mount.clone(),
                        },
                    )
                    .await?;
                }
                insert_machine_volumes(conn, &row.item_hash, &content.volumes).await?;
            }
            _ => unreachable!("vm process only receives instance/program messages"),
        }

        // Version pointer: the chain root is the replaced vm when this is
        // an update, the message itself otherwise.
        let chain_root = vm_content(message)?
            .replaces()
            .unwrap_or(&message.row.item_hash);
        node_sql::vms::refresh_vm_version(conn, chain_root).await?;

        // Materialize costs and enforce the hold balance.
        let cost_rows = costs::message_costs(conn, message).await?;
        let payment_type = cost_rows
            .first()
            .map(|cost| cost.payment_type)
            .unwrap_or(PaymentType::Hold);
        if payment_type == PaymentType::Hold {
            costs::check_hold_balance(conn, &message.row.sender, &cost_rows).await?;
        }
        node_sql::costs::upsert_costs(conn, &cost_rows).await?;
        Ok(())
    }

    async fn forget_message(
        &self,
        conn: &mut PgConnection,
        message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        let chain_root = node_sql::vms::get_vm(conn, &message.row.item_hash)
            .await?
            .and_then(|vm| vm.replaces)
            .unwrap_or_else(|| message.row.item_hash.clone());
        node_sql::vms::delete_vm(conn, &message.row.item_hash).await?;
        node_sql::vms::refresh_vm_version(conn, &chain_root).await?;
        Ok(())
    }
}
