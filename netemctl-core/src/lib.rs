//! Project subsystem of a distributed network-emulation controller:
//! the link lifecycle engine and the project state coordinator, plus the
//! compute client, node handle and notification queue they depend on.

pub mod compute;
pub mod error;
pub mod link;
pub mod node;
pub mod notification;
pub mod project;
pub mod udp_link;

pub use compute::{ComputeClient, ComputeClientConfig, LOCAL_COMPUTE_ID};
pub use error::{ComputeError, Result};
pub use link::{CaptureDescriptor, Link, LinkEndpoint, LinkState, DEFAULT_DATA_LINK_TYPE};
pub use node::{Node, NodeStatus, NodeType};
pub use notification::{Notification, NotificationQueue, NotificationSender};
pub use project::{BroadcastResult, Project, ProjectJson, SubscriptionGuard, parse_project_id};
pub use udp_link::UdpLink;

pub use tokio_util::sync::CancellationToken;
