//! Per-connection KV session state.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::KvService;
use crate::auth::{Permission, ScramServer};
use crate::cluster::{Bucket, Cluster, ClusterNode};
use crate::hooks::{Cancel, CancelSource, HookResult};
use crate::logging::{debug, trace};
use crate::memd::{HelloFeature, Packet};
use crate::services::ServiceError;

/// State a DCP consumer set up with DCP_OPEN_CONNECTION and DCP_CONTROL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DcpContext {
    pub name: String,
    pub flags: u32,
    pub controls: BTreeMap<String, String>,
}

/// Scratch state subsystems keep on a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientContext {
    pub dcp: Option<DcpContext>,
}

#[derive(Default)]
struct Session {
    username: Option<String>,
    bucket: Option<String>,
    features: Vec<HelloFeature>,
    scram: Option<ScramServer>,
    context: ClientContext,
}

/// A connected KV client.
pub struct KvClient {
    id: u64,
    service: Weak<KvService>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    session: Mutex<Session>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    closed: CancelSource,
}

impl std::fmt::Debug for KvClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvClient")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl KvClient {
    pub(crate) fn new(
        id: u64,
        service: Weak<KvService>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            service,
            local_addr,
            remote_addr,
            session: Mutex::new(Session::default()),
            tx,
            closed: CancelSource::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn service(&self) -> Option<Arc<KvService>> {
        self.service.upgrade()
    }

    pub fn node(&self) -> Option<Arc<ClusterNode>> {
        self.service()?.node_handle()
    }

    pub fn cluster(&self) -> Option<Cluster> {
        self.node()?.cluster()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn authenticated_user(&self) -> Option<String> {
        self.session.lock().username.clone()
    }

    pub fn set_authenticated_user(&self, username: Option<String>) {
        self.session.lock().username = username;
    }

    pub fn selected_bucket_name(&self) -> Option<String> {
        self.session.lock().bucket.clone()
    }

    pub fn set_selected_bucket(&self, bucket: Option<String>) {
        self.session.lock().bucket = bucket;
    }

    /// The selected bucket, if it still exists.
    pub fn selected_bucket(&self) -> Option<Arc<Bucket>> {
        let name = self.selected_bucket_name()?;
        self.cluster()?.get_bucket(&name)
    }

    pub fn features(&self) -> Vec<HelloFeature> {
        self.session.lock().features.clone()
    }

    pub fn set_features(&self, features: Vec<HelloFeature>) {
        self.session.lock().features = features;
    }

    pub fn has_feature(&self, feature: HelloFeature) -> bool {
        self.session.lock().features.contains(&feature)
    }

    pub fn set_scram(&self, scram: Option<ScramServer>) {
        self.session.lock().scram = scram;
    }

    pub fn take_scram(&self) -> Option<ScramServer> {
        self.session.lock().scram.take()
    }

    pub fn with_context<R>(&self, f: impl FnOnce(&mut ClientContext) -> R) -> R {
        f(&mut self.session.lock().context)
    }

    /// Whether the authenticated user holds `permission` on the selected
    /// bucket and the scope/collection `collection_id` resolves to.
    pub fn check_authenticated(&self, permission: Permission, collection_id: u32) -> bool {
        let Some(username) = self.authenticated_user() else {
            return false;
        };
        let Some(cluster) = self.cluster() else {
            return false;
        };
        let bucket = self.selected_bucket();
        let bucket_name = bucket.as_ref().map(|b| b.name().to_string()).unwrap_or_default();
        let (scope, collection) = bucket
            .as_ref()
            .and_then(|b| b.collections().get_by_id(collection_id))
            .unwrap_or_default();
        cluster
            .auth()
            .has_permission(&username, permission, &bucket_name, &scope, &collection)
    }

    /// Send a packet through the outgoing hooks and onto the connection.
    /// A packet swallowed by a hook is dropped silently.
    pub fn write_packet(self: &Arc<Self>, mut pak: Packet) -> Result<(), ServiceError> {
        if let Some(cluster) = self.cluster() {
            if cluster.hooks().kv_out.invoke_packet(self, &pak, Instant::now()).is_handled() {
                debug!(client = self.id, command = %pak.command, "outgoing kv packet swallowed by hook");
                return Ok(());
            }
        }

        if !pak.key.is_empty() && pak.command.supports_collection_id() && self.has_feature(HelloFeature::COLLECTIONS)
        {
            pak.add_collection_prefix();
        }
        trace!(client = self.id, command = %pak.command, status = %pak.status, "sending kv packet");
        let bytes = pak.encode()?;
        self.tx.send(bytes).map_err(|_| ServiceError::Closed)
    }

    /// Reply to a request, attaching the server duration when negotiated.
    pub fn reply(self: &Arc<Self>, start: Instant, mut pak: Packet) -> HookResult<()> {
        if self.has_feature(HelloFeature::DURATIONS) {
            pak.set_server_duration(start.elapsed());
        }
        if let Err(err) = self.write_packet(pak) {
            debug!(client = self.id, error = %err, "failed to write kv reply");
        }
        HookResult::Handled(())
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    pub(crate) fn closed(&self) -> Cancel {
        self.closed.token()
    }
}
