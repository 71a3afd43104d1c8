//! Schemas of INSTANCE and PROGRAM messages: execution environment,
//! resources, payment and the volume graph.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Chain;

crate::text_enum! {
    PaymentType {
        Hold => "hold",
        Superfluid => "superfluid",
        Credit => "credit",
    }
}

crate::text_enum! {
    VmType {
        Instance => "instance",
        Program => "program",
    }
}

crate::text_enum! {
    MachineType {
        VmFunction => "vm-function",
        VmInstance => "vm-instance",
    }
}

crate::text_enum! {
    VolumePersistence {
        Host => "host",
        Store => "store",
    }
}

crate::text_enum! {
    CpuArchitecture {
        X86_64 => "x86_64",
        Arm64 => "arm64",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub chain: Chain,
    #[serde(rename = "type")]
    pub payment_type: PaymentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineResources {
    pub vcpus: u32,
    /// Memory in MiB.
    pub memory: u32,
    pub seconds: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionEnvironment {
    #[serde(default)]
    pub reproducible: bool,
    #[serde(default)]
    pub internet: bool,
    #[serde(default)]
    pub aleph_api: bool,
    #[serde(default)]
    pub shared_cache: bool,
    /// Present on confidential instances only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_execution: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypervisor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuRequirement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    pub model: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<CpuArchitecture>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_regex: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeRequirements>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpu: Vec<GpuRequirement>,
}

/// A reference to another stored item, resolved either by exact item hash or
/// through the file tag of its latest revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentVolume {
    #[serde(rename = "ref")]
    pub ref_: String,
    #[serde(default)]
    pub use_latest: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootfsVolume {
    pub parent: ParentVolume,
    pub size_mib: u64,
    pub persistence: VolumePersistence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeVolume {
    #[serde(rename = "ref")]
    pub ref_: String,
    pub encoding: String,
    pub entrypoint: String,
    #[serde(default)]
    pub use_latest: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_size_mib: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeVolume {
    #[serde(rename = "ref")]
    pub ref_: String,
    #[serde(default)]
    pub use_latest: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_size_mib: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataVolume {
    #[serde(rename = "ref")]
    pub ref_: String,
    pub mount: String,
    pub encoding: String,
    #[serde(default)]
    pub use_latest: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_size_mib: Option<u64>,
}

/// Machine volumes attached to an instance or program. The wire format is
/// untagged; the variants are discriminated by their distinctive required
/// fields (`ref`, `ephemeral`, `persistence`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MachineVolume {
    Immutable {
        #[serde(rename = "ref")]
        ref_: String,
        #[serde(default)]
        use_latest: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mount: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        estimated_size_mib: Option<u64>,
    },
    Ephemeral {
        ephemeral: bool,
        mount: String,
        size_mib: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    },
    Persistent {
        persistence: VolumePersistence,
        name: String,
        mount: String,
        size_mib: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<ParentVolume>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    },
}

impl MachineVolume {
    /// Item hash or tag this volume depends on, if any.
    pub fn ref_(&self) -> Option<&str> {
        match self {
            MachineVolume::Immutable { ref_, .. } => Some(ref_),
            MachineVolume::Ephemeral { .. } => None,
            MachineVolume::Persistent { parent, .. } => parent.as_ref().map(|p| p.ref_.as_str()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceContent {
    pub address: String,
    pub time: f64,
    pub rootfs: RootfsVolume,
    #[serde(default)]
    pub allow_amend: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(default)]
    pub environment: FunctionEnvironment,
    pub resources: MachineResources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<HostRequirements>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<MachineVolume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<Payment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorized_keys: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramTriggers {
    #[serde(default)]
    pub http: bool,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramContent {
    pub address: String,
    pub time: f64,
    #[serde(rename = "type")]
    pub program_type: MachineType,
    pub code: CodeVolume,
    pub runtime: RuntimeVolume,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DataVolume>,
    pub on: ProgramTriggers,
    #[serde(default)]
    pub allow_amend: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(default)]
    pub environment: FunctionEnvironment,
    pub resources: MachineResources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<HostRequirements>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<MachineVolume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<Payment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorized_keys: Option<Vec<String>>,
}

impl InstanceContent {
    pub fn payment_type(&self) -> PaymentType {
        self.payment
            .as_ref()
            .map(|p| p.payment_type)
            .unwrap_or(PaymentType::Hold)
    }

    /// All item hashes / tags this instance depends on.
    pub fn volume_refs(&self) -> Vec<&str> {
        let mut refs = vec![self.rootfs.parent.ref_.as_str()];
        refs.extend(self.volumes.iter().filter_map(MachineVolume::ref_));
        refs
    }
}

impl ProgramContent {
    pub fn payment_type(&self) -> PaymentType {
        self.payment
            .as_ref()
            .map(|p| p.payment_type)
            .unwrap_or(PaymentType::Hold)
    }

    pub fn volume_refs(&self) -> Vec<&str> {
        let mut refs = vec![self.code.ref_.as_str(), self.runtime.ref_.as_str()];
        if let Some(data) = &self.data {
            refs.push(data.ref_.as_str());
        }
        refs.extend(self.volumes.iter().filter_map(MachineVolume::ref_));
        refs
    }

    pub fn is_persistent(&self) -> bool {
        self.on.persistent
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn instance_json() -> Value {
        serde_json::json!({
            "address": "0xA07B1214bAe0D5ccAA25449C3149c0aC83658874",
            "time": 1701099523.849,
            "rootfs": {
                "parent": {
                    "ref": "6e30de68c6cedfa6b45240c2b51e52495ac6fb1bd4b36457b3d5ca307594d595",
                    "use_latest": true
                },
                "size_mib": 20480,
                "persistence": "host"
            },
            "allow_amend": false,
            "environment": {
                "internet": true,
                "aleph_api": true,
                "reproducible": false,
                "shared_cache": false
            },
            "resources": {"vcpus": 1, "memory": 2048, "seconds": 30},
            "volumes": [
                {"ephemeral": true, "mount": "/var/cache", "size_mib": 50},
                {
                    "persistence": "host",
                    "name": "sqlite-data",
                    "mount": "/var/lib/sqlite",
                    "size_mib": 100
                },
                {
                    "ref": "cafecafecafecafecafecafecafecafecafecafecafecafecafecafecafecafe",
                    "use_latest": true,
                    "mount": "/opt/data"
                }
            ],
            "payment": {"chain": "AVAX", "type": "superfluid", "receiver": "0xA07B"}
        })
    }

    #[test]
    fn machine_volumes_discriminate_by_shape() {
        let instance: InstanceContent = serde_json::from_value(instance_json()).unwrap();
        assert!(matches!(instance.volumes[0], MachineVolume::Ephemeral { .. }));
        assert!(matches!(instance.volumes[1], MachineVolume::Persistent { .. }));
        assert!(matches!(instance.volumes[2], MachineVolume::Immutable { .. }));
    }

    #[test]
    fn instance_refs_include_rootfs_and_immutable_volumes() {
        let instance: InstanceContent = serde_json::from_value(instance_json()).unwrap();
        let refs = instance.volume_refs();
        assert_eq!(refs.len(), 2);
        assert!(refs[0].starts_with("6e30de68"));
        assert!(refs[1].starts_with("cafecafe"));
    }

    #[test]
    fn payment_defaults_to_hold() {
        let mut json = instance_json();
        json.as_object_mut().unwrap().remove("payment");
        let instance: InstanceContent = serde_json::from_value(json).unwrap();
        assert_eq!(instance.payment_type(), PaymentType::Hold);
    }
}
