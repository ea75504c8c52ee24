//! In-controller representation of one virtual device placed on one
//! compute (C3).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::compute::ComputeClient;
use crate::error::Result;

/// Device kind. Closed enum mirroring the wire vocabulary used by computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Cloud,
    Nat,
    EthernetSwitch,
    EthernetHub,
    Vpcs,
    Dynamips,
    Iou,
    Qemu,
    Docker,
    Vmware,
    Virtualbox,
}

impl NodeType {
    /// Device kinds with no user-visible start/stop, preferred capture
    /// endpoints because the stream is never interrupted by user activity.
    pub const ALWAYS_RUNNING: [NodeType; 4] = [
        NodeType::Cloud,
        NodeType::Nat,
        NodeType::EthernetSwitch,
        NodeType::EthernetHub,
    ];

    pub fn is_always_running(&self) -> bool {
        Self::ALWAYS_RUNNING.contains(self)
    }

    fn wire_name(&self) -> &'static str {
        match self {
            NodeType::Cloud => "cloud",
            NodeType::Nat => "nat",
            NodeType::EthernetSwitch => "ethernet_switch",
            NodeType::EthernetHub => "ethernet_hub",
            NodeType::Vpcs => "vpcs",
            NodeType::Dynamips => "dynamips",
            NodeType::Iou => "iou",
            NodeType::Qemu => "qemu",
            NodeType::Docker => "docker",
            NodeType::Vmware => "vmware",
            NodeType::Virtualbox => "virtualbox",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Lifecycle status of a node, as reported by its compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Stopped,
    Started,
    Suspended,
}

/// A virtual device instance within a project, placed on exactly one
/// compute. Holds a non-owning (`Arc`) reference to its compute; the
/// project owns the node's lifetime.
pub struct Node {
    id: Uuid,
    project_id: Uuid,
    name: Option<String>,
    compute: Arc<ComputeClient>,
    node_type: NodeType,
    status: RwLock<NodeStatus>,
    adapters: u32,
    ports_per_adapter: u32,
}

impl Node {
    pub fn new(
        id: Uuid,
        project_id: Uuid,
        compute: Arc<ComputeClient>,
        node_type: NodeType,
        adapters: u32,
        ports_per_adapter: u32,
    ) -> Arc<Self> {
        Self::with_name(id, project_id, None, compute, node_type, adapters, ports_per_adapter)
    }

    pub fn with_name(
        id: Uuid,
        project_id: Uuid,
        name: Option<String>,
        compute: Arc<ComputeClient>,
        node_type: NodeType,
        adapters: u32,
        ports_per_adapter: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            project_id,
            name,
            compute,
            node_type,
            status: RwLock::new(NodeStatus::Stopped),
            adapters,
            ports_per_adapter,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Display name if set, otherwise the id — used for human-readable
    /// artifacts such as capture file names.
    pub fn name_or_id(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.to_string())
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    pub fn compute(&self) -> &Arc<ComputeClient> {
        &self.compute
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn adapters(&self) -> u32 {
        self.adapters
    }

    pub fn ports_per_adapter(&self) -> u32 {
        self.ports_per_adapter
    }

    pub async fn status(&self) -> NodeStatus {
        *self.status.read().await
    }

    pub async fn set_status(&self, status: NodeStatus) {
        *self.status.write().await = status;
    }

    fn scope(&self, relative_path: &str) -> String {
        format!(
            "/projects/{}/{}/nodes/{}{}",
            self.project_id, self.node_type, self.id, relative_path
        )
    }

    /// Materialize the node on its compute.
    pub async fn create(&self) -> Result<()> {
        #[derive(Serialize)]
        struct CreateBody {
            node_type: NodeType,
            adapters: u32,
            ports_per_adapter: u32,
        }
        let body = CreateBody {
            node_type: self.node_type,
            adapters: self.adapters,
            ports_per_adapter: self.ports_per_adapter,
        };
        self.compute
            .post::<_, serde_json::Value>(&self.scope(""), Some(&body), None)
            .await?;
        self.set_status(NodeStatus::Stopped).await;
        Ok(())
    }

    /// Proxy a POST to the owning compute, prefixed with this node's scope.
    pub async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        relative_path: &str,
        body: Option<&B>,
        timeout: Option<Duration>,
    ) -> Result<T> {
        self.compute
            .post(&self.scope(relative_path), body, timeout)
            .await
    }

    /// Proxy a DELETE to the owning compute, prefixed with this node's scope.
    pub async fn delete(&self, relative_path: &str, timeout: Option<Duration>) -> Result<()> {
        self.compute.delete(&self.scope(relative_path), timeout).await
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("project_id", &self.project_id)
            .field("compute", &self.compute.id())
            .field("node_type", &self.node_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_running_classification() {
        assert!(NodeType::EthernetSwitch.is_always_running());
        assert!(NodeType::Cloud.is_always_running());
        assert!(!NodeType::Qemu.is_always_running());
        assert!(!NodeType::Dynamips.is_always_running());
    }

    #[tokio::test]
    async fn scope_prefixes_relative_path() {
        let compute = ComputeClient::new("local", "http://127.0.0.1:8000");
        let node = Node::new(
            Uuid::nil(),
            Uuid::nil(),
            compute,
            NodeType::Qemu,
            1,
            4,
        );
        assert_eq!(
            node.scope("/adapters/0/ports/0/nio"),
            format!(
                "/projects/{}/qemu/nodes/{}/adapters/0/ports/0/nio",
                Uuid::nil(),
                Uuid::nil()
            )
        );
    }
}
