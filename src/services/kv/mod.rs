//! Binary KV listener.
//!
//! One task accepts connections; each connection gets a reader task that
//! decodes packets and runs them through the cluster's incoming hooks, and a
//! writer task draining the connection's outgoing queue.

mod client;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub use client::{ClientContext, DcpContext, KvClient};

use super::{Service, ServiceError, ServiceType};
use crate::cluster::ClusterNode;
use crate::hooks::CancelSource;
use crate::logging::{debug, info, warn};
use crate::memd::{HelloFeature, Packet, Status, read_packet};

/// A node's KV listener.
pub struct KvService {
    node: Weak<ClusterNode>,
    hostname: String,
    port: u16,
    clients: Mutex<Vec<Weak<KvClient>>>,
    next_client_id: AtomicU64,
    shutdown: CancelSource,
}

impl std::fmt::Debug for KvService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvService")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .finish()
    }
}

impl KvService {
    /// Bind an ephemeral port on `hostname`.
    pub async fn bind(hostname: &str) -> Result<TcpListener, ServiceError> {
        TcpListener::bind((hostname, 0))
            .await
            .map_err(|source| ServiceError::Bind {
                service: ServiceType::KeyValue,
                source,
            })
    }

    /// Start serving on an already bound listener.
    pub fn start(listener: TcpListener, hostname: &str, node: Weak<ClusterNode>) -> Arc<Self> {
        let port = listener.local_addr().map(|addr| addr.port()).unwrap_or_default();
        let service = Arc::new(Self {
            node,
            hostname: hostname.to_string(),
            port,
            clients: Mutex::new(Vec::new()),
            next_client_id: AtomicU64::new(1),
            shutdown: CancelSource::new(),
        });
        info!(port, "kv service listening");
        tokio::spawn(accept_loop(Arc::clone(&service), listener));
        service
    }

    pub(crate) fn node_handle(&self) -> Option<Arc<ClusterNode>> {
        self.node.upgrade()
    }

    /// Clients that are currently connected.
    pub fn clients(&self) -> Vec<Arc<KvClient>> {
        let mut clients = self.clients.lock();
        clients.retain(|c| c.strong_count() > 0);
        clients.iter().filter_map(Weak::upgrade).collect()
    }
}

impl Service for KvService {
    fn service_type(&self) -> ServiceType {
        ServiceType::KeyValue
    }

    fn node(&self) -> Option<Arc<ClusterNode>> {
        self.node_handle()
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn listen_port(&self) -> u16 {
        self.port
    }

    fn close(&self) {
        self.shutdown.cancel();
        for client in self.clients() {
            client.close();
        }
    }
}

async fn accept_loop(service: Arc<KvService>, listener: TcpListener) {
    let mut shutdown = service.shutdown.token();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tokio::spawn(serve_connection(Arc::clone(&service), stream, remote));
                }
                Err(err) => {
                    warn!(error = %err, "kv accept failed");
                    break;
                }
            },
            _ = shutdown.cancelled() => break,
        }
    }
    debug!(port = service.port, "kv accept loop stopped");
}

async fn serve_connection(service: Arc<KvService>, stream: TcpStream, remote: SocketAddr) {
    let local = stream.local_addr().unwrap_or(remote);
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let id = service.next_client_id.fetch_add(1, Ordering::Relaxed);
    let client = Arc::new(KvClient::new(id, Arc::downgrade(&service), local, remote, tx));
    service.clients.lock().push(Arc::downgrade(&client));
    debug!(client = id, remote = %remote, "kv client connected");

    let mut write_closed = client.closed();
    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(bytes) => {
                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = write_closed.cancelled() => break,
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut closed = client.closed();
    loop {
        let pak = tokio::select! {
            read = read_packet(&mut reader) => read,
            _ = closed.cancelled() => break,
        };
        match pak {
            Ok(Some(pak)) => dispatch(&client, pak),
            Ok(None) => break,
            Err(err) => {
                debug!(client = id, error = %err, "kv read failed");
                break;
            }
        }
    }

    client.close();
    let _ = writer_task.await;
    debug!(client = id, "kv client disconnected");
}

fn dispatch(client: &Arc<KvClient>, mut pak: Packet) {
    let start = Instant::now();
    if pak.magic.is_request() && pak.command.supports_collection_id() && client.has_feature(HelloFeature::COLLECTIONS)
    {
        if let Err(err) = pak.take_collection_prefix() {
            debug!(client = client.id(), error = %err, "invalid collection prefix");
            client.reply(start, Packet::response_to(&pak, Status::INVALID_ARGS));
            return;
        }
    }

    let Some(cluster) = client.cluster() else {
        client.close();
        return;
    };
    debug!(client = client.id(), command = %pak.command, opaque = pak.opaque, "received kv packet");
    if !cluster.hooks().kv_in.invoke_packet(client, &pak, start).is_handled() {
        // Nobody answered: tell the client we don't know the command
        client.reply(start, Packet::response_to(&pak, Status::UNKNOWN_COMMAND));
    }
}
