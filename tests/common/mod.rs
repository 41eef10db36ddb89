//! Common test utilities and fixtures.
//!
//! Provides cluster fixtures plus a minimal binary protocol client that
//! talks to a node's KV listener over a real socket.

#![allow(dead_code)]

use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue, header};
use axum_test::{TestRequest, TestServer};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use caves::cluster::{BucketOptions, BucketType, Cluster, ClusterNode, ClusterOptions, NodeOptions};
use caves::memd::{HelloFeature, OpCode, Packet, Status, read_packet};
use caves::services::ServiceType;
use caves::store::vbucket_for_key;

// =============================================================================
// Credentials
// =============================================================================

pub const ADMIN_USER: &str = "Administrator";
pub const ADMIN_PASSWORD: &str = "password";

/// `Authorization` header for the built-in administrator.
pub fn admin_auth() -> (HeaderName, HeaderValue) {
    (
        header::AUTHORIZATION,
        HeaderValue::from_static("Basic QWRtaW5pc3RyYXRvcjpwYXNzd29yZA=="),
    )
}

/// Attach the administrator's credentials to `req`.
pub fn as_admin(req: TestRequest) -> TestRequest {
    let (name, value) = admin_auth();
    req.add_header(name, value)
}

// =============================================================================
// Cluster Fixtures
// =============================================================================

/// Number of vbuckets the fixtures use. Small enough to iterate in tests.
pub const NUM_VBUCKETS: u16 = 64;

/// Options for a fast single node cluster.
pub fn cluster_options() -> ClusterOptions {
    ClusterOptions {
        num_vbuckets: NUM_VBUCKETS,
        replica_latency: std::time::Duration::from_millis(5),
        persist_latency: std::time::Duration::from_millis(10),
        ..ClusterOptions::default()
    }
}

/// A running cluster with a couchbase bucket `default` that has no replicas,
/// so the single node is active for every vbucket.
pub struct TestCluster {
    pub cluster: Cluster,
}

impl TestCluster {
    pub async fn new() -> anyhow::Result<Self> {
        let cluster = Cluster::new(cluster_options()).await?;
        cluster.add_bucket(BucketOptions {
            name: "default".to_string(),
            bucket_type: BucketType::Membase,
            replicas: 0,
            flush_enabled: true,
            ..BucketOptions::default()
        })?;
        Ok(Self { cluster })
    }

    /// Add a node running only `services`.
    pub async fn add_node(&self, services: Vec<ServiceType>) -> anyhow::Result<Arc<ClusterNode>> {
        Ok(self.cluster.add_node(NodeOptions { services }).await?)
    }

    pub fn node(&self) -> anyhow::Result<Arc<ClusterNode>> {
        self.cluster
            .nodes()
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("cluster has no nodes"))
    }

    /// `host:port` of the first node's KV listener.
    pub fn kv_addr(&self) -> anyhow::Result<String> {
        kv_addr_from_connstr(&self.cluster.connection_string())
    }

    /// In-memory server over the first node's management routes.
    pub fn mgmt_server(&self) -> anyhow::Result<TestServer> {
        self.http_server(ServiceType::Mgmt)
    }

    /// In-memory server over one of the first node's HTTP services.
    pub fn http_server(&self, service: ServiceType) -> anyhow::Result<TestServer> {
        let node = self.node()?;
        let http = node
            .http_service(service)
            .ok_or_else(|| anyhow::anyhow!("node does not run {service}"))?;
        Ok(TestServer::new(Arc::clone(http).router())?)
    }

    /// Connect, authenticate as the administrator and select `default`.
    pub async fn kv_client(&self) -> anyhow::Result<KvConn> {
        let mut conn = KvConn::connect(&self.kv_addr()?).await?;
        conn.hello(&[HelloFeature::SEQ_NO, HelloFeature::XERROR, HelloFeature::SELECT_BUCKET])
            .await?;
        conn.auth_plain(ADMIN_USER, ADMIN_PASSWORD).await?;
        conn.select_bucket("default").await?;
        Ok(conn)
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.cluster.close();
    }
}

/// First `host:port` of a `couchbase://` connection string.
pub fn kv_addr_from_connstr(connstr: &str) -> anyhow::Result<String> {
    connstr
        .strip_prefix("couchbase://")
        .and_then(|hosts| hosts.split(',').next())
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("bad connection string {connstr:?}"))
}

// =============================================================================
// KV Client
// =============================================================================

/// A bare binary protocol connection.
pub struct KvConn {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    next_opaque: u32,
}

impl KvConn {
    pub async fn connect(addr: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader,
            writer,
            next_opaque: 1,
        })
    }

    /// Send `pak` with a fresh opaque and return that opaque.
    pub async fn send(&mut self, mut pak: Packet) -> anyhow::Result<u32> {
        pak.opaque = self.next_opaque;
        self.next_opaque += 1;
        self.writer.write_all(&pak.encode()?).await?;
        Ok(pak.opaque)
    }

    /// Next packet off the wire, whatever it is.
    pub async fn recv(&mut self) -> anyhow::Result<Packet> {
        read_packet(&mut self.reader)
            .await?
            .ok_or_else(|| anyhow::anyhow!("connection closed"))
    }

    /// Send `pak` and wait for the response carrying its opaque.
    pub async fn request(&mut self, pak: Packet) -> anyhow::Result<Packet> {
        let opaque = self.send(pak).await?;
        loop {
            let res = self.recv().await?;
            if !res.magic.is_request() && res.opaque == opaque {
                return Ok(res);
            }
        }
    }

    /// Send `pak` and fail unless the response is SUCCESS.
    pub async fn expect_success(&mut self, pak: Packet) -> anyhow::Result<Packet> {
        let command = pak.command;
        let res = self.request(pak).await?;
        anyhow::ensure!(
            res.status == Status::SUCCESS,
            "{command:?} failed with {:?}",
            res.status.name()
        );
        Ok(res)
    }

    pub async fn hello(&mut self, features: &[HelloFeature]) -> anyhow::Result<Vec<HelloFeature>> {
        let mut pak = Packet::request(OpCode::HELLO);
        pak.key = b"caves-tests".to_vec();
        pak.value = features.iter().flat_map(|f| f.0.to_be_bytes()).collect();
        let res = self.expect_success(pak).await?;
        Ok(res
            .value
            .chunks_exact(2)
            .map(|c| HelloFeature(u16::from_be_bytes([c.first().copied().unwrap_or_default(), c.get(1).copied().unwrap_or_default()])))
            .collect())
    }

    /// SASL PLAIN. Returns the raw status so tests can check failures.
    pub async fn try_auth_plain(&mut self, username: &str, password: &str) -> anyhow::Result<Status> {
        let mut pak = Packet::request(OpCode::SASL_AUTH);
        pak.key = b"PLAIN".to_vec();
        pak.value = format!("\0{username}\0{password}").into_bytes();
        Ok(self.request(pak).await?.status)
    }

    pub async fn auth_plain(&mut self, username: &str, password: &str) -> anyhow::Result<()> {
        let status = self.try_auth_plain(username, password).await?;
        anyhow::ensure!(status == Status::SUCCESS, "authentication failed: {:?}", status.name());
        Ok(())
    }

    pub async fn select_bucket(&mut self, name: &str) -> anyhow::Result<()> {
        let mut pak = Packet::request(OpCode::SELECT_BUCKET);
        pak.key = name.as_bytes().to_vec();
        self.expect_success(pak).await?;
        Ok(())
    }

    pub async fn set(&mut self, key: &str, value: &[u8], expiry: u32) -> anyhow::Result<Packet> {
        self.request(store_packet(OpCode::SET, key, value, 0, expiry)).await
    }

    pub async fn get(&mut self, key: &str) -> anyhow::Result<Packet> {
        self.request(key_packet(OpCode::GET, key)).await
    }
}

// =============================================================================
// Packet Builders
// =============================================================================

/// Request for `key`, routed to its vbucket.
pub fn key_packet(command: OpCode, key: &str) -> Packet {
    let mut pak = Packet::request(command);
    pak.key = key.as_bytes().to_vec();
    pak.vbucket = vbucket_for_key(key.as_bytes(), NUM_VBUCKETS);
    pak
}

/// A SET/ADD/REPLACE request with flags and expiry extras.
pub fn store_packet(command: OpCode, key: &str, value: &[u8], cas: u64, expiry: u32) -> Packet {
    let mut pak = key_packet(command, key);
    pak.cas = cas;
    pak.extras.extend_from_slice(&0u32.to_be_bytes());
    pak.extras.extend_from_slice(&expiry.to_be_bytes());
    pak.value = value.to_vec();
    pak
}

/// One lookup spec of a multi lookup body.
pub fn lookup_spec(opcode: OpCode, path: &str) -> Vec<u8> {
    let mut out = vec![opcode.0, 0];
    out.extend_from_slice(&u16::try_from(path.len()).unwrap_or(u16::MAX).to_be_bytes());
    out.extend_from_slice(path.as_bytes());
    out
}

/// One mutation spec of a multi mutation body.
pub fn mutation_spec(opcode: OpCode, flags: u8, path: &str, value: &str) -> Vec<u8> {
    let mut out = vec![opcode.0, flags];
    out.extend_from_slice(&u16::try_from(path.len()).unwrap_or(u16::MAX).to_be_bytes());
    out.extend_from_slice(&u32::try_from(value.len()).unwrap_or(u32::MAX).to_be_bytes());
    out.extend_from_slice(path.as_bytes());
    out.extend_from_slice(value.as_bytes());
    out
}

/// Split a multi lookup response body into `(status, value)` pairs.
pub fn lookup_results(body: &[u8]) -> Vec<(Status, Vec<u8>)> {
    let mut out = Vec::new();
    let mut rest = body;
    while rest.len() >= 6 {
        let status = u16::from_be_bytes([rest.first().copied().unwrap_or_default(), rest.get(1).copied().unwrap_or_default()]);
        let len_bytes: [u8; 4] = rest.get(2..6).and_then(|b| b.try_into().ok()).unwrap_or_default();
        let len = u32::from_be_bytes(len_bytes) as usize;
        let value = rest.get(6..6 + len).map(<[u8]>::to_vec).unwrap_or_default();
        out.push((Status(status), value));
        rest = rest.get(6 + len..).unwrap_or_default();
    }
    out
}
