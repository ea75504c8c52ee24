//! The link capability interface (C4) and its state machine.
//!
//! Only one concrete variant exists today ([`crate::udp_link::UdpLink`]);
//! this trait reserves space for future transports without changing the
//! project contract.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::node::Node;

/// One endpoint of a link: a node plus the adapter/port it is attached to.
#[derive(Clone)]
pub struct LinkEndpoint {
    pub node: Arc<Node>,
    pub adapter_number: u32,
    pub port_number: u32,
}

impl PartialEq for LinkEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.node.id() == other.node.id()
            && self.adapter_number == other.adapter_number
            && self.port_number == other.port_number
    }
}

/// ```text
///   New ──add_node x2──▶ Ready ──create()──▶ Installed
///                                        ├──start_capture──▶ Capturing ──stop_capture──▶ Installed
///                                        └──delete()──▶ Deleted
///   (any state) ──delete()──▶ Deleted   (idempotent from New, Ready, Deleted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Ready,
    Installed,
    Capturing,
    Deleted,
}

/// Capture metadata recorded while a capture is active, matching the base
/// class fields `_capture_file_name` / `_data_link_type` in the source.
#[derive(Debug, Clone)]
pub struct CaptureDescriptor {
    pub capture_file_name: String,
    pub data_link_type: String,
}

pub const DEFAULT_DATA_LINK_TYPE: &str = "DLT_EN10MB";

/// Capability interface common to every link variant.
#[async_trait]
pub trait Link: Send + Sync {
    fn id(&self) -> Uuid;

    /// Current endpoints, in insertion order.
    async fn endpoints(&self) -> Vec<LinkEndpoint>;

    /// Append an endpoint. Rejects a third endpoint or a duplicate of an
    /// existing one.
    async fn add_node(&self, endpoint: LinkEndpoint) -> Result<()>;

    /// Install the link on both endpoints' computes.
    async fn create(&self) -> Result<()>;

    /// Tear down the link. Idempotent; never fails.
    async fn delete(&self);

    async fn start_capture(
        &self,
        data_link_type: Option<String>,
        capture_file_name: Option<String>,
    ) -> Result<()>;

    async fn stop_capture(&self);

    /// Deterministic, filesystem-safe name derived from endpoints and id.
    async fn default_capture_file_name(&self) -> String;

    /// Called by the project when a member node's status changes.
    async fn node_updated(&self, node: &Arc<Node>);

    async fn capture(&self) -> Option<CaptureDescriptor>;

    async fn is_created(&self) -> bool;
}

fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Shared implementation of the deterministic capture file name scheme,
/// reused by every link variant: `<nodeA>_<portA>-to-<nodeB>_<portB>.pcap`.
pub fn default_capture_file_name(endpoints: &[LinkEndpoint], link_id: Uuid) -> String {
    match endpoints {
        [a, b] => format!(
            "{}_{}-to-{}_{}.pcap",
            sanitize(&a.node.name_or_id()),
            a.port_number,
            sanitize(&b.node.name_or_id()),
            b.port_number
        ),
        _ => format!("{}.pcap", sanitize(&link_id.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_non_alphanumeric() {
        assert_eq!(sanitize("ab-cd:ef"), "ab_cd_ef");
    }
}
