//! Node descriptions exchanged during handshakes and updates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    #[default]
    Compute,
    Requester,
}

/// A single GPU device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gpu {
    pub index: u64,
    pub name: String,
    pub vendor: String,
    /// Memory in MiB.
    pub memory: u64,
    pub pci_address: String,
}

/// Amount of compute resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: f64,
    /// Memory in bytes.
    pub memory: u64,
    /// Disk in bytes.
    pub disk: u64,
    /// Number of GPUs.
    pub gpu: u64,
    #[serde(default)]
    pub gpus: Vec<Gpu>,
}

impl Resources {
    /// Equality that ignores the order of the GPU list.
    pub fn same_as(&self, other: &Resources) -> bool {
        self.cpu == other.cpu
            && self.memory == other.memory
            && self.disk == other.disk
            && self.gpu == other.gpu
            && sorted(&self.gpus) == sorted(&other.gpus)
    }
}

/// Build version reported by a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildVersionInfo {
    pub major: String,
    pub minor: String,
    pub git_version: String,
}

/// Compute-specific part of a node description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeNodeInfo {
    pub execution_engines: Vec<String>,
    pub publishers: Vec<String>,
    pub storage_sources: Vec<String>,
    pub max_capacity: Resources,
    pub max_job_requirements: Resources,
    pub queue_used_capacity: Resources,
    pub available_capacity: Resources,
    pub running_executions: u64,
    pub enqueued_executions: u64,
}

/// Full description of a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub supported_protocols: Vec<String>,
    #[serde(default)]
    pub version: BuildVersionInfo,
    #[serde(default)]
    pub compute_node_info: ComputeNodeInfo,
}

impl NodeInfo {
    pub fn id(&self) -> &str {
        &self.node_id
    }

    /// Whether the static configuration differs from `other`.
    ///
    /// Live values (queue and available capacity, execution counters) are
    /// ignored, and list fields compare without regard to order.
    pub fn has_static_config_changed(&self, other: &NodeInfo) -> bool {
        let a = &self.compute_node_info;
        let b = &other.compute_node_info;

        self.node_id != other.node_id
            || self.node_type != other.node_type
            || self.labels != other.labels
            || sorted(&self.supported_protocols) != sorted(&other.supported_protocols)
            || self.version != other.version
            || sorted(&a.execution_engines) != sorted(&b.execution_engines)
            || sorted(&a.publishers) != sorted(&b.publishers)
            || sorted(&a.storage_sources) != sorted(&b.storage_sources)
            || !a.max_capacity.same_as(&b.max_capacity)
            || !a.max_job_requirements.same_as(&b.max_job_requirements)
    }
}

fn sorted<T: Ord + Clone>(items: &[T]) -> Vec<T> {
    let mut items = items.to_vec();
    items.sort();
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_info() -> NodeInfo {
        NodeInfo {
            node_id: "node-1".into(),
            node_type: NodeType::Compute,
            labels: BTreeMap::from([("zone".to_string(), "eu-west".to_string())]),
            supported_protocols: vec!["ncl/v1".into(), "bprotocol/v2".into()],
            version: BuildVersionInfo {
                major: "1".into(),
                minor: "7".into(),
                git_version: "v1.7.0".into(),
            },
            compute_node_info: ComputeNodeInfo {
                execution_engines: vec!["docker".into(), "wasm".into()],
                publishers: vec!["s3".into()],
                storage_sources: vec!["ipfs".into(), "urldownload".into()],
                max_capacity: Resources {
                    cpu: 8.0,
                    memory: 16 << 30,
                    disk: 100 << 30,
                    gpu: 2,
                    gpus: vec![
                        Gpu {
                            index: 0,
                            name: "A100".into(),
                            vendor: "NVIDIA".into(),
                            memory: 40_960,
                            pci_address: "0000:01:00.0".into(),
                        },
                        Gpu {
                            index: 1,
                            name: "A100".into(),
                            vendor: "NVIDIA".into(),
                            memory: 40_960,
                            pci_address: "0000:02:00.0".into(),
                        },
                    ],
                },
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_identical_info_unchanged() {
        let info = node_info();
        assert!(!info.has_static_config_changed(&info.clone()));
    }

    #[test]
    fn test_live_values_ignored() {
        let info = node_info();
        let mut other = info.clone();
        other.compute_node_info.available_capacity.cpu = 3.5;
        other.compute_node_info.queue_used_capacity.memory = 1024;
        other.compute_node_info.running_executions = 4;
        other.compute_node_info.enqueued_executions = 9;
        assert!(!info.has_static_config_changed(&other));
    }

    #[test]
    fn test_order_insensitive_lists() {
        let info = node_info();
        let mut other = info.clone();
        other.supported_protocols.reverse();
        other.compute_node_info.execution_engines.reverse();
        other.compute_node_info.storage_sources.reverse();
        other.compute_node_info.max_capacity.gpus.reverse();
        assert!(!info.has_static_config_changed(&other));
    }

    #[test]
    fn test_static_changes_detected() {
        let info = node_info();

        let mut labels = info.clone();
        labels.labels.insert("arch".into(), "arm64".into());
        assert!(info.has_static_config_changed(&labels));

        let mut engines = info.clone();
        engines.compute_node_info.execution_engines.pop();
        assert!(info.has_static_config_changed(&engines));

        let mut capacity = info.clone();
        capacity.compute_node_info.max_capacity.cpu = 16.0;
        assert!(info.has_static_config_changed(&capacity));

        let mut version = info.clone();
        version.version.git_version = "v1.7.1".into();
        assert!(info.has_static_config_changed(&version));
    }
}
