//! Project state coordinator (C6): owns the node/link/compute membership
//! inside a project and fans out lifecycle commands and notifications.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::compute::ComputeClient;
use crate::error::{ComputeError, Result};
use crate::link::{Link, LinkEndpoint};
use crate::node::{Node, NodeType};
use crate::notification::{Notification, NotificationQueue, NotificationSender};
use crate::udp_link::UdpLink;

/// Validate a caller-supplied project id: it MUST parse as a version-4 UUID.
pub fn parse_project_id(id: &str) -> Result<Uuid> {
    let uuid = Uuid::parse_str(id)
        .map_err(|e| ComputeError::BadRequest(format!("{id} is not a valid UUID: {e}")))?;
    if uuid.get_version_num() != 4 {
        return Err(ComputeError::BadRequest(format!(
            "{id} is not a valid version-4 UUID"
        )));
    }
    Ok(uuid)
}

/// JSON projection of a project: `{name, project_id, temporary, path}`.
/// Node/link lists are never inlined — they are discovered through their
/// own endpoints.
#[derive(Debug, Serialize)]
pub struct ProjectJson {
    pub name: Option<String>,
    pub project_id: Uuid,
    pub temporary: bool,
    pub path: Option<String>,
}

/// Aggregated result of a per-compute broadcast (`close`/`commit`/`delete`):
/// a failure on one compute does not abort the broadcast for the others.
#[derive(Debug, Default)]
pub struct BroadcastResult {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, ComputeError)>,
}

impl BroadcastResult {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

struct State {
    computes: HashMap<String, Arc<ComputeClient>>,
    nodes: HashMap<Uuid, Arc<Node>>,
    links: HashMap<Uuid, Arc<UdpLink>>,
}

/// Owns a set of computes, a node map, a link map, and a set of
/// subscribers for one project. Receives every dependency (computes, the
/// id it was constructed with) through its constructor; it never reaches
/// out to a controller singleton.
pub struct Project {
    id: Uuid,
    name: Option<String>,
    path: Option<String>,
    temporary: bool,
    state: RwLock<State>,
    // Subscriber bookkeeping is plain-`Mutex`-guarded rather than the
    // async `RwLock` above: `SubscriptionGuard::drop` is synchronous, and
    // the critical section here is a short, uncontended vec removal.
    subscribers: StdMutex<Vec<(u64, NotificationSender)>>,
    next_subscriber_id: AtomicU64,
}

impl Project {
    pub fn new(id: Option<Uuid>, name: Option<String>, path: Option<String>, temporary: bool) -> Arc<Self> {
        Arc::new(Self {
            id: id.unwrap_or_else(Uuid::new_v4),
            name,
            path,
            temporary,
            state: RwLock::new(State {
                computes: HashMap::new(),
                nodes: HashMap::new(),
                links: HashMap::new(),
            }),
            subscribers: StdMutex::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(0),
        })
    }

    /// Construct from a caller-supplied, externally-typed id string,
    /// enforcing that a project id is always a valid version-4 UUID.
    pub fn from_external_id(
        id: Option<&str>,
        name: Option<String>,
        path: Option<String>,
        temporary: bool,
    ) -> Result<Arc<Self>> {
        let id = id.map(parse_project_id).transpose()?;
        Ok(Self::new(id, name, path, temporary))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn to_json(&self) -> ProjectJson {
        ProjectJson {
            name: self.name.clone(),
            project_id: self.id,
            temporary: self.temporary,
            path: self.path.clone(),
        }
    }

    /// Register a compute and inform it this project exists. Idempotent
    /// on re-add.
    #[instrument(level = "info", skip(self, compute), fields(project_id = %self.id))]
    pub async fn add_compute(&self, compute: Arc<ComputeClient>) -> Result<()> {
        let already_known = {
            let state = self.state.read().await;
            state.computes.contains_key(compute.id())
        };
        if already_known {
            return Ok(());
        }
        compute
            .post::<_, serde_json::Value>("/projects", Some(&self.to_json()), None)
            .await?;
        let mut state = self.state.write().await;
        state.computes.insert(compute.id().to_string(), compute);
        Ok(())
    }

    /// Return the existing node if `node_id` is already present; otherwise
    /// construct, materialize, and insert it.
    #[instrument(level = "info", skip(self, compute), fields(project_id = %self.id))]
    pub async fn add_node(
        &self,
        compute: Arc<ComputeClient>,
        node_id: Uuid,
        name: Option<String>,
        node_type: NodeType,
        adapters: u32,
        ports_per_adapter: u32,
    ) -> Result<Arc<Node>> {
        if let Some(existing) = self.state.read().await.nodes.get(&node_id) {
            return Ok(existing.clone());
        }
        let node = Node::with_name(
            node_id,
            self.id,
            name,
            compute,
            node_type,
            adapters,
            ports_per_adapter,
        );
        node.create().await?;
        let mut state = self.state.write().await;
        state.nodes.insert(node_id, node.clone());
        drop(state);
        self.emit(
            "node.created",
            json!({"node_id": node_id}),
            Map::new(),
        )
        .await;
        Ok(node)
    }

    pub async fn get_node(&self, id: Uuid) -> Result<Arc<Node>> {
        self.state
            .read()
            .await
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| ComputeError::NotFound(format!("node {id} doesn't exist")))
    }

    /// Construct a new empty UDP link with a fresh id. Endpoints must be
    /// added by the caller before `create()`.
    pub async fn add_link(&self) -> Arc<UdpLink> {
        let link = UdpLink::new(self.id);
        self.state.write().await.links.insert(link.id(), link.clone());
        link
    }

    pub async fn get_link(&self, id: Uuid) -> Result<Arc<UdpLink>> {
        self.state
            .read()
            .await
            .links
            .get(&id)
            .cloned()
            .ok_or_else(|| ComputeError::NotFound(format!("link {id} doesn't exist")))
    }

    /// Propagate a node status change to every link that references it, so
    /// a link capturing on a node that just stopped can auto-migrate off it.
    pub async fn node_updated(&self, node: &Arc<Node>) {
        let links: Vec<Arc<UdpLink>> = self.state.read().await.links.values().cloned().collect();
        for link in links {
            let referenced = link
                .endpoints()
                .await
                .iter()
                .any(|e: &LinkEndpoint| e.node.id() == node.id());
            if referenced {
                link.node_updated(node).await;
            }
        }
    }

    async fn broadcast(&self, make_path: impl Fn(Uuid) -> String, method: BroadcastMethod) -> BroadcastResult {
        let computes: Vec<Arc<ComputeClient>> =
            self.state.read().await.computes.values().cloned().collect();
        let mut result = BroadcastResult::default();
        for compute in computes {
            let path = make_path(self.id);
            let call = match method {
                BroadcastMethod::Post => {
                    compute
                        .post::<(), serde_json::Value>(&path, None, None)
                        .await
                        .map(|_| ())
                }
                BroadcastMethod::Delete => compute.delete(&path, None).await,
            };
            match call {
                Ok(()) => result.succeeded.push(compute.id().to_string()),
                Err(err) => {
                    warn!(project_id = %self.id, compute_id = compute.id(), error = %err, "broadcast failed, continuing with remaining computes");
                    result.failed.push((compute.id().to_string(), err));
                }
            }
        }
        result
    }

    pub async fn close(&self) -> BroadcastResult {
        self.broadcast(|id| format!("/projects/{id}/close"), BroadcastMethod::Post)
            .await
    }

    pub async fn commit(&self) -> BroadcastResult {
        self.broadcast(|id| format!("/projects/{id}/commit"), BroadcastMethod::Post)
            .await
    }

    /// Destroy the project: broadcast deletion to every compute, then
    /// release nodes before links before compute associations. This order
    /// breaks the node/link/project reference cycle cleanly: links hold
    /// nodes, nodes hold a project id, and the project holds both maps.
    #[instrument(level = "info", skip(self), fields(project_id = %self.id))]
    pub async fn delete(&self) -> BroadcastResult {
        let result = self
            .broadcast(|id| format!("/projects/{id}"), BroadcastMethod::Delete)
            .await;
        let mut state = self.state.write().await;
        state.nodes.clear();
        state.links.clear();
        state.computes.clear();
        info!(project_id = %self.id, "project deleted");
        result
    }

    /// Scoped acquisition of a notification queue: the returned guard
    /// removes the queue from the subscriber set on drop, covering every
    /// exit path including panics.
    pub fn subscribe(self: &Arc<Self>) -> SubscriptionGuard {
        let (tx, rx) = NotificationQueue::channel();
        let token = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().push((token, tx));
        SubscriptionGuard {
            project: self.clone(),
            token,
            queue: Some(rx),
        }
    }

    /// Non-blocking fan-out: enqueue the event for every subscriber
    /// registered at call time. No back-pressure toward the emitter.
    pub async fn emit(&self, action: &str, event: Value, mut metadata: Map<String, Value>) {
        metadata
            .entry("project_id")
            .or_insert_with(|| Value::String(self.id.to_string()));
        let subscribers = self.subscribers.lock().unwrap();
        for (_, sender) in subscribers.iter() {
            sender.put_nowait(Notification {
                action: action.to_string(),
                event: event.clone(),
                metadata: metadata.clone(),
            });
        }
    }

    fn remove_subscriber(&self, token: u64) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|(t, _)| *t != token);
    }
}

#[derive(Clone, Copy)]
enum BroadcastMethod {
    Post,
    Delete,
}

/// RAII guard returned by [`Project::subscribe`]. On every exit path,
/// including an early return or a panic unwinding through it, `Drop`
/// removes this subscriber from the project's subscriber set — the Rust
/// counterpart of the source's `@contextmanager`-scoped queue.
pub struct SubscriptionGuard {
    project: Arc<Project>,
    token: u64,
    queue: Option<NotificationQueue>,
}

impl SubscriptionGuard {
    pub async fn get(&mut self) -> Option<Notification> {
        self.queue.as_mut()?.get().await
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.project.remove_subscriber(self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_project_id_accepts_v4() {
        let id = Uuid::new_v4();
        assert_eq!(parse_project_id(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn parse_project_id_rejects_non_v4() {
        // A v1 (time-based) UUID literal.
        let v1 = "a8098c1a-f86e-11da-bd1a-00112444be1e";
        assert!(matches!(
            parse_project_id(v1),
            Err(ComputeError::BadRequest(_))
        ));
    }

    #[test]
    fn parse_project_id_rejects_garbage() {
        assert!(matches!(
            parse_project_id("not-a-uuid"),
            Err(ComputeError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn new_project_without_id_generates_v4() {
        let project = Project::new(None, None, None, false);
        assert_eq!(project.id().get_version_num(), 4);
    }

    #[tokio::test]
    async fn get_node_not_found() {
        let project = Project::new(None, None, None, false);
        let err = project.get_node(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ComputeError::NotFound(_)));
    }

    #[tokio::test]
    async fn emit_reaches_every_subscriber_registered_at_call_time() {
        let project = Project::new(None, None, None, false);
        let mut sub_a = project.subscribe();
        let mut sub_b = project.subscribe();

        project
            .emit("ping", Value::Null, Map::new())
            .await;

        assert_eq!(sub_a.get().await.unwrap().action, "ping");
        assert_eq!(sub_b.get().await.unwrap().action, "ping");
    }

    #[tokio::test]
    async fn subscriber_scope_restores_cardinality_on_drop() {
        let project = Project::new(None, None, None, false);
        assert_eq!(project.subscribers.lock().unwrap().len(), 0);
        {
            let _sub = project.subscribe();
            assert_eq!(project.subscribers.lock().unwrap().len(), 1);
        }
        assert_eq!(project.subscribers.lock().unwrap().len(), 0);
    }
}
