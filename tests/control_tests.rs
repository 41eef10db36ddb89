//! Integration tests for the harness control channel over TCP.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use caves::control::{self, Command, ControlHandler, read_command, write_command};
use caves::memd::{OpCode, Packet};
use common::{KvConn, kv_addr_from_connstr};

/// A harness-side connection to a serving mock.
struct Harness {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Harness {
    async fn start(handler: Arc<ControlHandler>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(control::serve(listener, handler));
        let (reader, writer) = TcpStream::connect(addr).await?.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn call(&mut self, cmd: Command) -> anyhow::Result<Command> {
        write_command(&mut self.writer, &cmd).await?;
        read_command(&mut self.reader)
            .await?
            .ok_or_else(|| anyhow::anyhow!("mock closed the control connection"))
    }
}

#[tokio::test]
async fn test_full_test_run_lifecycle() -> anyhow::Result<()> {
    let handler = Arc::new(ControlHandler::default());
    let mut harness = Harness::start(Arc::clone(&handler)).await?;

    let started = harness
        .call(Command::StartTesting {
            run: "run-1".to_string(),
            client: "rust-sdk".to_string(),
        })
        .await?;
    let Command::StartedTesting { connstr, mgmt_addrs, error } = started else {
        anyhow::bail!("unexpected reply {started:?}");
    };
    assert_eq!(error, None);
    assert_eq!(mgmt_addrs.len(), 2);
    assert!(connstr.starts_with("couchbase://"));

    let test = harness
        .call(Command::StartTest {
            run: "run-1".to_string(),
            test: "kv/crud".to_string(),
        })
        .await?;
    let Command::StartedTest { connstr: test_connstr, bucket, error, .. } = test else {
        anyhow::bail!("unexpected reply {test:?}");
    };
    assert_eq!(error, None);
    assert_eq!(bucket, "default");
    assert_eq!(test_connstr, connstr);
    assert_eq!(
        handler.current_test("run-1").map(|t| t.name),
        Some("kv/crud".to_string())
    );

    // The cluster handed out is reachable over KV
    let mut conn = KvConn::connect(&kv_addr_from_connstr(&connstr)?).await?;
    conn.auth_plain(common::ADMIN_USER, common::ADMIN_PASSWORD).await?;
    conn.select_bucket(&bucket).await?;
    conn.expect_success(Packet::request(OpCode::NOOP)).await?;

    let before = handler
        .run_cluster("run-1")
        .map(|c| c.chrono().now())
        .ok_or_else(|| anyhow::anyhow!("run has no cluster"))?;
    let travelled = harness
        .call(Command::TimeTravel {
            run: "run-1".to_string(),
            cluster: String::new(),
            amount_ms: 60_000,
        })
        .await?;
    assert_eq!(travelled, Command::TimeTravelled { error: None });
    let after = handler
        .run_cluster("run-1")
        .map(|c| c.chrono().now())
        .ok_or_else(|| anyhow::anyhow!("run has no cluster"))?;
    assert!(after.duration_since(before)? >= Duration::from_secs(60));

    let ended = harness
        .call(Command::EndTest {
            run: "run-1".to_string(),
            result: serde_json::json!({"ok": true}),
        })
        .await?;
    assert_eq!(ended, Command::EndedTest { error: String::new() });
    assert!(handler.current_test("run-1").is_none());

    let finished = harness
        .call(Command::EndTesting {
            run: "run-1".to_string(),
        })
        .await?;
    assert!(matches!(finished, Command::EndedTesting { error: None, .. }));
    assert!(handler.run_cluster("run-1").is_none());

    Ok(())
}

#[tokio::test]
async fn test_unknown_runs_are_reported() -> anyhow::Result<()> {
    let mut harness = Harness::start(Arc::new(ControlHandler::default())).await?;

    let reply = harness
        .call(Command::StartTest {
            run: "nope".to_string(),
            test: "t".to_string(),
        })
        .await?;
    assert!(matches!(reply, Command::StartedTest { error: Some(_), .. }));

    let reply = harness
        .call(Command::EndTest {
            run: "nope".to_string(),
            result: serde_json::Value::Null,
        })
        .await?;
    assert!(matches!(reply, Command::EndedTest { error } if !error.is_empty()));

    Ok(())
}

#[tokio::test]
async fn test_named_clusters_accept_new_buckets() -> anyhow::Result<()> {
    let handler = Arc::new(ControlHandler::default());
    let mut harness = Harness::start(Arc::clone(&handler)).await?;

    let created = harness
        .call(Command::CreateCluster {
            id: "c1".to_string(),
        })
        .await?;
    assert!(matches!(created, Command::CreatedCluster { error: None, .. }));

    let added = harness
        .call(Command::AddBucket {
            cluster: "c1".to_string(),
            name: "extra".to_string(),
            replicas: 0,
            bucket_type: "couchbase".to_string(),
        })
        .await?;
    assert_eq!(added, Command::AddedBucket { error: None });
    assert!(handler.cluster("c1").and_then(|c| c.get_bucket("extra")).is_some());

    let duplicate = harness
        .call(Command::AddBucket {
            cluster: "c1".to_string(),
            name: "extra".to_string(),
            replicas: 0,
            bucket_type: "couchbase".to_string(),
        })
        .await?;
    assert!(matches!(duplicate, Command::AddedBucket { error: Some(_) }));

    Ok(())
}

#[tokio::test]
async fn test_replies_from_the_harness_close_the_connection() -> anyhow::Result<()> {
    let mut harness = Harness::start(Arc::new(ControlHandler::default())).await?;

    write_command(&mut harness.writer, &Command::TimeTravelled { error: None }).await?;
    let next = tokio::time::timeout(Duration::from_secs(5), read_command(&mut harness.reader)).await??;
    assert_eq!(next, None);

    Ok(())
}
