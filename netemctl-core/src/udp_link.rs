//! Concrete link built as a bidirectional UDP tunnel between two node
//! ports (C5) — the central algorithm of this crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{ComputeError, Result};
use crate::link::{
    CaptureDescriptor, Link, LinkEndpoint, LinkState, DEFAULT_DATA_LINK_TYPE,
    default_capture_file_name,
};
use crate::node::{Node, NodeStatus};

/// NIO install calls are long-poll operations on the compute side.
const NIO_INSTALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Wire body for `POST /adapters/{a}/ports/{p}/nio`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NioDescriptor {
    lport: u16,
    rhost: std::net::IpAddr,
    rport: u16,
    #[serde(rename = "type")]
    kind: &'static str,
}

const NIO_UDP: &str = "nio_udp";

#[derive(Debug, Deserialize)]
struct UdpPortResponse {
    udp_port: u16,
}

#[derive(Debug, Serialize)]
struct CaptureBody<'a> {
    capture_file_name: &'a str,
    data_link_type: &'a str,
}

/// Mutable fields guarded by the per-link mutex. `create()` and `delete()`
/// are serialized through it because racing them on the same link would
/// leave its NIOs and state in an undefined mix of installed/torn-down.
struct Inner {
    state: LinkState,
    endpoints: Vec<LinkEndpoint>,
    nio_descriptors: Vec<NioDescriptor>,
    capture: Option<CaptureDescriptor>,
    capture_node_index: Option<usize>,
}

pub struct UdpLink {
    id: Uuid,
    project_id: Uuid,
    inner: Mutex<Inner>,
}

impl UdpLink {
    pub fn new(project_id: Uuid) -> Arc<Self> {
        Self::with_id(Uuid::new_v4(), project_id)
    }

    pub fn with_id(id: Uuid, project_id: Uuid) -> Arc<Self> {
        Arc::new(Self {
            id,
            project_id,
            inner: Mutex::new(Inner {
                state: LinkState::New,
                endpoints: Vec::new(),
                nio_descriptors: Vec::new(),
                capture: None,
                capture_node_index: None,
            }),
        })
    }

    fn nio_path(adapter_number: u32, port_number: u32) -> String {
        format!("/adapters/{adapter_number}/ports/{port_number}/nio")
    }

    /// Priority-ordered scan for the best capture endpoint: prefer a local,
    /// always-running node so the capture stream is never cut by the user
    /// stopping a device, then fall back to any always-running node, then
    /// any started local node, then any started node at all. Returns the
    /// index into `endpoints` of the chosen side.
    async fn choose_capture_side(endpoints: &[LinkEndpoint]) -> Result<usize> {
        // Priority 1: local + ALWAYS_RUNNING + started.
        for (i, ep) in endpoints.iter().enumerate() {
            if ep.node.compute().is_local()
                && ep.node.node_type().is_always_running()
                && ep.node.status().await == NodeStatus::Started
            {
                return Ok(i);
            }
        }
        // Priority 2: any compute + ALWAYS_RUNNING + started.
        for (i, ep) in endpoints.iter().enumerate() {
            if ep.node.node_type().is_always_running()
                && ep.node.status().await == NodeStatus::Started
            {
                return Ok(i);
            }
        }
        // Priority 3: local + started (any type).
        for (i, ep) in endpoints.iter().enumerate() {
            if ep.node.compute().is_local() && ep.node.status().await == NodeStatus::Started {
                return Ok(i);
            }
        }
        // Priority 4: any compute + started.
        for (i, ep) in endpoints.iter().enumerate() {
            if ep.node.status().await == NodeStatus::Started {
                return Ok(i);
            }
        }
        Err(ComputeError::Conflict(
            "no running device on this link".into(),
        ))
    }
}

#[async_trait]
impl Link for UdpLink {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn endpoints(&self) -> Vec<LinkEndpoint> {
        self.inner.lock().await.endpoints.clone()
    }

    async fn add_node(&self, endpoint: LinkEndpoint) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.endpoints.len() >= 2 {
            return Err(ComputeError::BadRequest(
                "link already has two endpoints".into(),
            ));
        }
        if inner.endpoints.iter().any(|e| *e == endpoint) {
            return Err(ComputeError::BadRequest(
                "endpoint already present on this link".into(),
            ));
        }
        inner.endpoints.push(endpoint);
        if inner.endpoints.len() == 2 && inner.state == LinkState::New {
            inner.state = LinkState::Ready;
        }
        Ok(())
    }

    #[instrument(level = "info", skip(self), fields(link_id = %self.id))]
    async fn create(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.endpoints.len() != 2 {
            return Err(ComputeError::BadRequest(
                "link requires exactly two endpoints to be created".into(),
            ));
        }

        let e1 = inner.endpoints[0].clone();
        let e2 = inner.endpoints[1].clone();

        // Step 1: subnet negotiation.
        let (host1, host2) = e1
            .node
            .compute()
            .get_ip_on_same_subnet(e2.node.compute())
            .await?;

        // Step 2: port reservation, one call per side.
        let port1: UdpPortResponse = e1
            .node
            .compute()
            .post::<(), _>(&format!("/projects/{}/ports/udp", self.project_id), None, None)
            .await?;
        let port2: UdpPortResponse = e2
            .node
            .compute()
            .post::<(), _>(&format!("/projects/{}/ports/udp", self.project_id), None, None)
            .await?;

        // Step 3: install NIO on side A.
        let nio1 = NioDescriptor {
            lport: port1.udp_port,
            rhost: host2,
            rport: port2.udp_port,
            kind: NIO_UDP,
        };
        e1.node
            .post::<_, serde_json::Value>(
                &Self::nio_path(e1.adapter_number, e1.port_number),
                Some(&nio1),
                Some(NIO_INSTALL_TIMEOUT),
            )
            .await?;

        // Step 4: install NIO on side B, rolling back side A on failure.
        let nio2 = NioDescriptor {
            lport: port2.udp_port,
            rhost: host1,
            rport: port1.udp_port,
            kind: NIO_UDP,
        };
        let install2 = e2
            .node
            .post::<_, serde_json::Value>(
                &Self::nio_path(e2.adapter_number, e2.port_number),
                Some(&nio2),
                Some(NIO_INSTALL_TIMEOUT),
            )
            .await;

        if let Err(err) = install2 {
            warn!(link_id = %self.id, error = %err, "NIO install failed on side B, rolling back side A");
            let rollback = e1
                .node
                .delete(
                    &Self::nio_path(e1.adapter_number, e1.port_number),
                    Some(NIO_INSTALL_TIMEOUT),
                )
                .await;
            if let Err(rollback_err) = rollback {
                if !rollback_err.is_not_found() {
                    warn!(link_id = %self.id, error = %rollback_err, "rollback of side A NIO failed");
                }
            }
            return Err(err);
        }

        inner.nio_descriptors = vec![nio1, nio2];
        inner.state = LinkState::Installed;
        info!(link_id = %self.id, "link created");
        Ok(())
    }

    #[instrument(level = "info", skip(self), fields(link_id = %self.id))]
    async fn delete(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != LinkState::Installed && inner.state != LinkState::Capturing {
            inner.state = LinkState::Deleted;
            return;
        }

        for ep in inner.endpoints.clone() {
            let result = ep
                .node
                .delete(
                    &Self::nio_path(ep.adapter_number, ep.port_number),
                    Some(NIO_INSTALL_TIMEOUT),
                )
                .await;
            if let Err(err) = result {
                if !err.is_not_found() {
                    warn!(link_id = %self.id, error = %err, "NIO delete failed, continuing teardown");
                }
            }
        }

        inner.nio_descriptors.clear();
        inner.capture = None;
        inner.capture_node_index = None;
        inner.state = LinkState::Deleted;
    }

    #[instrument(level = "info", skip(self), fields(link_id = %self.id))]
    async fn start_capture(
        &self,
        data_link_type: Option<String>,
        capture_file_name: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let data_link_type = data_link_type.unwrap_or_else(|| DEFAULT_DATA_LINK_TYPE.to_string());
        let capture_file_name = match capture_file_name {
            Some(name) => name,
            None => default_capture_file_name(&inner.endpoints, self.id),
        };

        let idx = Self::choose_capture_side(&inner.endpoints).await?;
        let ep = inner.endpoints[idx].clone();

        let body = CaptureBody {
            capture_file_name: &capture_file_name,
            data_link_type: &data_link_type,
        };
        ep.node
            .post::<_, serde_json::Value>(
                &format!(
                    "/adapters/{}/ports/{}/start_capture",
                    ep.adapter_number, ep.port_number
                ),
                Some(&body),
                None,
            )
            .await?;

        inner.capture_node_index = Some(idx);
        inner.capture = Some(CaptureDescriptor {
            capture_file_name,
            data_link_type,
        });
        inner.state = LinkState::Capturing;
        Ok(())
    }

    #[instrument(level = "info", skip(self), fields(link_id = %self.id))]
    async fn stop_capture(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(idx) = inner.capture_node_index.take() {
            if let Some(ep) = inner.endpoints.get(idx).cloned() {
                let result = ep
                    .node
                    .post::<(), serde_json::Value>(
                        &format!(
                            "/adapters/{}/ports/{}/stop_capture",
                            ep.adapter_number, ep.port_number
                        ),
                        None,
                        None,
                    )
                    .await;
                if let Err(err) = result {
                    warn!(link_id = %self.id, error = %err, "stop_capture call failed");
                }
            }
        }
        inner.capture = None;
        if inner.state == LinkState::Capturing {
            inner.state = LinkState::Installed;
        }
    }

    async fn default_capture_file_name(&self) -> String {
        let inner = self.inner.lock().await;
        default_capture_file_name(&inner.endpoints, self.id)
    }

    async fn node_updated(&self, node: &Arc<Node>) {
        let (is_capture_node, status) = {
            let inner = self.inner.lock().await;
            let is_capture_node = inner
                .capture_node_index
                .and_then(|idx| inner.endpoints.get(idx))
                .map(|ep| ep.node.id() == node.id())
                .unwrap_or(false);
            (is_capture_node, node.status().await)
        };
        if is_capture_node && status != NodeStatus::Started {
            self.stop_capture().await;
        }
    }

    async fn capture(&self) -> Option<CaptureDescriptor> {
        self.inner.lock().await.capture.clone()
    }

    async fn is_created(&self) -> bool {
        matches!(
            self.inner.lock().await.state,
            LinkState::Installed | LinkState::Capturing
        )
    }
}

impl UdpLink {
    /// Same algorithm as [`Link::create`], but step 4 (installing the NIO
    /// on side B) races against `token`. If the token fires first, side
    /// A's NIO is rolled back on a detached task so the rollback runs to
    /// completion even though this call returns `Cancelled` immediately.
    #[instrument(level = "info", skip(self, token), fields(link_id = %self.id))]
    pub async fn create_cancellable(&self, token: CancellationToken) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.endpoints.len() != 2 {
            return Err(ComputeError::BadRequest(
                "link requires exactly two endpoints to be created".into(),
            ));
        }

        let e1 = inner.endpoints[0].clone();
        let e2 = inner.endpoints[1].clone();

        let (host1, host2) = e1
            .node
            .compute()
            .get_ip_on_same_subnet(e2.node.compute())
            .await?;

        let port1: UdpPortResponse = e1
            .node
            .compute()
            .post::<(), _>(&format!("/projects/{}/ports/udp", self.project_id), None, None)
            .await?;
        let port2: UdpPortResponse = e2
            .node
            .compute()
            .post::<(), _>(&format!("/projects/{}/ports/udp", self.project_id), None, None)
            .await?;

        let nio1 = NioDescriptor {
            lport: port1.udp_port,
            rhost: host2,
            rport: port2.udp_port,
            kind: NIO_UDP,
        };
        e1.node
            .post::<_, serde_json::Value>(
                &Self::nio_path(e1.adapter_number, e1.port_number),
                Some(&nio1),
                Some(NIO_INSTALL_TIMEOUT),
            )
            .await?;

        let nio2 = NioDescriptor {
            lport: port2.udp_port,
            rhost: host1,
            rport: port1.udp_port,
            kind: NIO_UDP,
        };

        let install2 = tokio::select! {
            result = e2.node.post::<_, serde_json::Value>(
                &Self::nio_path(e2.adapter_number, e2.port_number),
                Some(&nio2),
                Some(NIO_INSTALL_TIMEOUT),
            ) => Some(result),
            _ = token.cancelled() => None,
        };

        let install2 = match install2 {
            Some(result) => result,
            None => {
                warn!(link_id = %self.id, "create cancelled during side B NIO install, rolling back side A");
                let node1 = e1.node.clone();
                let path1 = Self::nio_path(e1.adapter_number, e1.port_number);
                tokio::spawn(async move {
                    if let Err(err) = node1.delete(&path1, Some(NIO_INSTALL_TIMEOUT)).await {
                        if !err.is_not_found() {
                            warn!(error = %err, "rollback of side A NIO failed after cancellation");
                        }
                    }
                });
                return Err(ComputeError::Cancelled);
            }
        };

        if let Err(err) = install2 {
            warn!(link_id = %self.id, error = %err, "NIO install failed on side B, rolling back side A");
            let rollback = e1
                .node
                .delete(
                    &Self::nio_path(e1.adapter_number, e1.port_number),
                    Some(NIO_INSTALL_TIMEOUT),
                )
                .await;
            if let Err(rollback_err) = rollback {
                if !rollback_err.is_not_found() {
                    warn!(link_id = %self.id, error = %rollback_err, "rollback of side A NIO failed");
                }
            }
            return Err(err);
        }

        inner.nio_descriptors = vec![nio1, nio2];
        inner.state = LinkState::Installed;
        info!(link_id = %self.id, "link created");
        Ok(())
    }

    /// Lazy byte stream of the active capture, or `None` if no capture is
    /// running.
    pub async fn read_pcap_from_source(
        &self,
    ) -> Result<Option<impl futures::Stream<Item = Result<bytes::Bytes>> + Send + 'static>> {
        let inner = self.inner.lock().await;
        let Some(idx) = inner.capture_node_index else {
            return Ok(None);
        };
        let Some(capture) = inner.capture.clone() else {
            return Ok(None);
        };
        let ep = inner.endpoints[idx].clone();
        drop(inner);
        let stream = ep
            .node
            .compute()
            .stream_file(
                &self.project_id.to_string(),
                &format!("tmp/captures/{}", capture.capture_file_name),
            )
            .await?;
        Ok(Some(stream))
    }
}
