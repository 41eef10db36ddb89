//! End-to-end tests for the binary KV listener.
//!
//! Every test starts a real cluster and talks to it over a socket, the way
//! an SDK would.

mod common;

use std::time::Duration;

use caves::hooks::{CancelSource, HookResult};
use caves::memd::{HelloFeature, OpCode, Packet, SUBDOC_DOC_FLAG_MKDOC, Status};
use caves::store::vbucket_for_key;
use common::{
    KvConn, TestCluster, key_packet, lookup_results, lookup_spec, mutation_spec, store_packet,
};

// =============================================================================
// Connection Setup
// =============================================================================

#[tokio::test]
async fn test_hello_negotiates_requested_features() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let mut conn = KvConn::connect(&app.kv_addr()?).await?;

    let enabled = conn
        .hello(&[HelloFeature::SEQ_NO, HelloFeature::XATTR, HelloFeature(0x7fff)])
        .await?;

    assert!(enabled.contains(&HelloFeature::SEQ_NO));
    assert!(enabled.contains(&HelloFeature::XATTR));
    assert!(!enabled.contains(&HelloFeature(0x7fff)));

    Ok(())
}

#[tokio::test]
async fn test_wrong_password_is_rejected() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let mut conn = KvConn::connect(&app.kv_addr()?).await?;

    let status = conn.try_auth_plain("Administrator", "wrong").await?;
    assert_eq!(status, Status::AUTH_ERROR);

    // Selecting a bucket still needs a successful login
    let mut select = Packet::request(OpCode::SELECT_BUCKET);
    select.key = b"default".to_vec();
    assert_eq!(conn.request(select).await?.status, Status::AUTH_ERROR);

    Ok(())
}

#[tokio::test]
async fn test_data_commands_need_a_selected_bucket() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let mut conn = KvConn::connect(&app.kv_addr()?).await?;
    conn.auth_plain(common::ADMIN_USER, common::ADMIN_PASSWORD).await?;

    let res = conn.get("anything").await?;
    assert_eq!(res.status, Status::NO_BUCKET);

    Ok(())
}

#[tokio::test]
async fn test_cluster_config_over_cccp() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let mut conn = app.kv_client().await?;

    let res = conn.expect_success(Packet::request(OpCode::GET_CLUSTER_CONFIG)).await?;
    let config: serde_json::Value = serde_json::from_slice(&res.value)?;

    assert_eq!(config["name"], "default");
    assert!(config["rev"].as_u64().is_some());
    assert_eq!(
        config["vBucketServerMap"]["vBucketMap"].as_array().map(Vec::len),
        Some(usize::from(common::NUM_VBUCKETS))
    );

    Ok(())
}

// =============================================================================
// Document CRUD
// =============================================================================

#[tokio::test]
async fn test_set_then_get() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let mut conn = app.kv_client().await?;

    let stored = conn.set("doc", br#"{"x":1}"#, 0).await?;
    assert_eq!(stored.status, Status::SUCCESS);
    assert_ne!(stored.cas, 0);
    // vbuuid and seqno, since SEQ_NO was negotiated
    assert_eq!(stored.extras.len(), 16);

    let fetched = conn.get("doc").await?;
    assert_eq!(fetched.status, Status::SUCCESS);
    assert_eq!(fetched.value, br#"{"x":1}"#);
    assert_eq!(fetched.cas, stored.cas);

    Ok(())
}

#[tokio::test]
async fn test_missing_documents_are_not_found() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let mut conn = app.kv_client().await?;

    assert_eq!(conn.get("ghost").await?.status, Status::KEY_NOT_FOUND);
    let res = conn.request(key_packet(OpCode::DELETE, "ghost")).await?;
    assert_eq!(res.status, Status::KEY_NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn test_cas_mismatch_is_rejected() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let mut conn = app.kv_client().await?;

    let first = conn.set("cas", b"1", 0).await?;
    let res = conn
        .request(store_packet(OpCode::REPLACE, "cas", b"2", first.cas + 1, 0))
        .await?;
    assert_eq!(res.status, Status::KEY_EXISTS);

    let res = conn
        .request(store_packet(OpCode::REPLACE, "cas", b"2", first.cas, 0))
        .await?;
    assert_eq!(res.status, Status::SUCCESS);
    assert_eq!(conn.get("cas").await?.value, b"2");

    Ok(())
}

#[tokio::test]
async fn test_add_fails_on_existing_documents() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let mut conn = app.kv_client().await?;

    let res = conn.request(store_packet(OpCode::ADD, "once", b"a", 0, 0)).await?;
    assert_eq!(res.status, Status::SUCCESS);
    let res = conn.request(store_packet(OpCode::ADD, "once", b"b", 0, 0)).await?;
    assert_eq!(res.status, Status::KEY_EXISTS);

    Ok(())
}

#[tokio::test]
async fn test_append_and_prepend() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let mut conn = app.kv_client().await?;
    conn.set("text", b"mid", 0).await?;

    let mut append = key_packet(OpCode::APPEND, "text");
    append.value = b"-end".to_vec();
    conn.expect_success(append).await?;
    let mut prepend = key_packet(OpCode::PREPEND, "text");
    prepend.value = b"start-".to_vec();
    conn.expect_success(prepend).await?;

    assert_eq!(conn.get("text").await?.value, b"start-mid-end");

    Ok(())
}

#[tokio::test]
async fn test_counters_create_then_increment() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let mut conn = app.kv_client().await?;

    let counter = |delta: u64| {
        let mut pak = key_packet(OpCode::INCREMENT, "hits");
        pak.extras.extend_from_slice(&delta.to_be_bytes());
        pak.extras.extend_from_slice(&10u64.to_be_bytes());
        pak.extras.extend_from_slice(&0u32.to_be_bytes());
        pak
    };

    let created = conn.expect_success(counter(5)).await?;
    assert_eq!(created.value, 10u64.to_be_bytes());
    let bumped = conn.expect_success(counter(5)).await?;
    assert_eq!(bumped.value, 15u64.to_be_bytes());
    assert_eq!(conn.get("hits").await?.value, b"15");

    Ok(())
}

#[tokio::test]
async fn test_locked_documents_reject_writes() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let mut conn = app.kv_client().await?;
    conn.set("lock", b"v", 0).await?;

    let mut lock = key_packet(OpCode::GET_LOCKED, "lock");
    lock.extras = 15u32.to_be_bytes().to_vec();
    let locked = conn.expect_success(lock).await?;

    let res = conn.set("lock", b"w", 0).await?;
    assert_eq!(res.status, Status::LOCKED);

    let mut unlock = key_packet(OpCode::UNLOCK, "lock");
    unlock.cas = locked.cas;
    conn.expect_success(unlock).await?;
    assert_eq!(conn.set("lock", b"w", 0).await?.status, Status::SUCCESS);

    Ok(())
}

#[tokio::test]
async fn test_expiry_follows_time_travel() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let mut conn = app.kv_client().await?;

    conn.set("short", b"lived", 10).await?;
    assert_eq!(conn.get("short").await?.status, Status::SUCCESS);

    app.cluster.chrono().time_travel(Duration::from_secs(11));
    assert_eq!(conn.get("short").await?.status, Status::KEY_NOT_FOUND);

    Ok(())
}

// =============================================================================
// Sub-Document
// =============================================================================

#[tokio::test]
async fn test_multi_lookup_reports_each_path() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let mut conn = app.kv_client().await?;
    conn.set("profile", br#"{"name":"ada","tags":["a","b"]}"#, 0).await?;

    let mut lookup = key_packet(OpCode::SUBDOC_MULTI_LOOKUP, "profile");
    lookup.value = [
        lookup_spec(OpCode::SUBDOC_GET, "name"),
        lookup_spec(OpCode::SUBDOC_GET_COUNT, "tags"),
        lookup_spec(OpCode::SUBDOC_EXISTS, "missing"),
    ]
    .concat();
    let res = conn.request(lookup).await?;

    assert_eq!(res.status, Status::SUBDOC_BAD_MULTI);
    let results = lookup_results(&res.value);
    assert_eq!(results.len(), 3);
    assert_eq!(results.first(), Some(&(Status::SUCCESS, br#""ada""#.to_vec())));
    assert_eq!(results.get(1), Some(&(Status::SUCCESS, b"2".to_vec())));
    assert_eq!(results.get(2).map(|r| r.0), Some(Status::SUBDOC_PATH_NOT_FOUND));

    Ok(())
}

#[tokio::test]
async fn test_multi_mutation_can_create_the_document() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let mut conn = app.kv_client().await?;

    let mut mutation = key_packet(OpCode::SUBDOC_MULTI_MUTATION, "fresh");
    mutation.extras = vec![SUBDOC_DOC_FLAG_MKDOC];
    mutation.value = [
        mutation_spec(OpCode::SUBDOC_DICT_UPSERT, 0, "name", r#""grace""#),
        mutation_spec(OpCode::SUBDOC_COUNTER, 0, "visits", "3"),
    ]
    .concat();
    let res = conn.expect_success(mutation).await?;
    assert_ne!(res.cas, 0);

    let doc: serde_json::Value = serde_json::from_slice(&conn.get("fresh").await?.value)?;
    assert_eq!(doc, serde_json::json!({"name": "grace", "visits": 3}));

    Ok(())
}

#[tokio::test]
async fn test_multi_mutation_is_atomic() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let mut conn = app.kv_client().await?;
    conn.set("atomic", br#"{"a":1}"#, 0).await?;

    let mut mutation = key_packet(OpCode::SUBDOC_MULTI_MUTATION, "atomic");
    mutation.value = [
        mutation_spec(OpCode::SUBDOC_DICT_UPSERT, 0, "b", "2"),
        mutation_spec(OpCode::SUBDOC_REPLACE, 0, "missing", "3"),
    ]
    .concat();
    let res = conn.request(mutation).await?;

    assert_eq!(res.status, Status::SUBDOC_BAD_MULTI);
    assert_eq!(res.value.first(), Some(&1));
    let doc: serde_json::Value = serde_json::from_slice(&conn.get("atomic").await?.value)?;
    assert_eq!(doc, serde_json::json!({"a": 1}));

    Ok(())
}

// =============================================================================
// DCP
// =============================================================================

fn stream_request(key: &str, start_seq_no: u64, vb_uuid: u64) -> Packet {
    let mut pak = key_packet(OpCode::DCP_STREAM_REQ, key);
    pak.key.clear();
    pak.extras.extend_from_slice(&0u32.to_be_bytes());
    pak.extras.extend_from_slice(&0u32.to_be_bytes());
    pak.extras.extend_from_slice(&start_seq_no.to_be_bytes());
    pak.extras.extend_from_slice(&u64::MAX.to_be_bytes());
    pak.extras.extend_from_slice(&vb_uuid.to_be_bytes());
    pak.extras.extend_from_slice(&start_seq_no.to_be_bytes());
    pak.extras.extend_from_slice(&start_seq_no.to_be_bytes());
    pak
}

async fn open_dcp(conn: &mut KvConn) -> anyhow::Result<()> {
    let mut open = Packet::request(OpCode::DCP_OPEN_CONNECTION);
    open.key = b"caves-dcp".to_vec();
    open.extras.extend_from_slice(&0u32.to_be_bytes());
    // Producer
    open.extras.extend_from_slice(&1u32.to_be_bytes());
    conn.expect_success(open).await?;
    Ok(())
}

#[tokio::test]
async fn test_dcp_stream_backfills_latest_versions() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let mut conn = app.kv_client().await?;
    conn.set("feed", b"first", 0).await?;
    conn.set("feed", b"second", 0).await?;

    let mut dcp = app.kv_client().await?;
    open_dcp(&mut dcp).await?;
    let res = dcp.request(stream_request("feed", 0, 0)).await?;
    assert_eq!(res.status, Status::SUCCESS);
    // A single failover entry: the current uuid from seqno 0
    assert_eq!(res.value.len(), 16);

    let marker = dcp.recv().await?;
    assert_eq!(marker.command, OpCode::DCP_SNAPSHOT_MARKER);
    let mutation = dcp.recv().await?;
    assert_eq!(mutation.command, OpCode::DCP_MUTATION);
    assert_eq!(mutation.key, b"feed");
    assert_eq!(mutation.value, b"second");
    let end = dcp.recv().await?;
    assert_eq!(end.command, OpCode::DCP_STREAM_END);

    Ok(())
}

#[tokio::test]
async fn test_dcp_stream_with_unknown_history_rolls_back() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let mut conn = app.kv_client().await?;
    conn.set("feed", b"v", 0).await?;

    open_dcp(&mut conn).await?;
    let res = conn.request(stream_request("feed", 1, 0xdead_beef)).await?;

    assert_eq!(res.status, Status::ROLLBACK);
    assert_eq!(res.value, 0u64.to_be_bytes());

    Ok(())
}

#[tokio::test]
async fn test_dcp_stream_from_a_rolled_back_uuid_rolls_back() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let mut conn = app.kv_client().await?;
    conn.set("feed", b"kept", 0).await?;

    let bucket = app
        .cluster
        .get_bucket("default")
        .ok_or_else(|| anyhow::anyhow!("no default bucket"))?;
    let vb = bucket
        .store()
        .vbucket(vbucket_for_key(b"feed", common::NUM_VBUCKETS))?;
    let before = vb.snapshot();
    conn.set("feed", b"dropped", 0).await?;
    vb.rollback(before)?;

    open_dcp(&mut conn).await?;
    let stale = conn.request(stream_request("feed", 1, before.vb_uuid)).await?;
    assert_eq!(stale.status, Status::ROLLBACK);
    assert_eq!(stale.value, 0u64.to_be_bytes());

    let current = conn.request(stream_request("feed", 1, vb.vb_uuid())).await?;
    assert_eq!(current.status, Status::SUCCESS);
    let mut failover_log = vb.vb_uuid().to_be_bytes().to_vec();
    failover_log.extend_from_slice(&0u64.to_be_bytes());
    assert_eq!(current.value, failover_log);
    assert_eq!(conn.recv().await?.command, OpCode::DCP_STREAM_END);

    Ok(())
}

// =============================================================================
// Hooks
// =============================================================================

#[tokio::test]
async fn test_hooks_can_answer_instead_of_the_default() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let mut conn = app.kv_client().await?;
    conn.set("busy", b"v", 0).await?;

    let hooks = app.cluster.hooks().child();
    hooks
        .kv_in
        .expect()
        .cmd(OpCode::GET)
        .key("busy")
        .times(1)
        .handler(|client, pak, start, _next| {
            client.reply(start, Packet::response_to(pak, Status::TMP_FAIL));
            HookResult::Handled(())
        });

    assert_eq!(conn.get("busy").await?.status, Status::TMP_FAIL);
    // The budget is spent, so the hook is gone and the default handler answers again
    assert!(hooks.kv_in.is_empty());
    assert_eq!(conn.get("busy").await?.status, Status::SUCCESS);

    hooks.destroy();
    Ok(())
}

#[tokio::test]
async fn test_expectations_observe_matching_packets() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let mut conn = app.kv_client().await?;

    let installed = app.cluster.hooks().kv_in.len();
    let expectation = app.cluster.hooks().kv_in.expect().cmd(OpCode::SET).key("watched");
    let source = CancelSource::new();
    let mut cancel = source.token();
    let waiter = tokio::spawn(async move { expectation.wait(&mut cancel).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    conn.set("watched", b"v", 0).await?;
    let (_, seen) = tokio::time::timeout(Duration::from_secs(5), waiter).await???;
    assert_eq!(seen.command, OpCode::SET);
    assert_eq!(seen.value, b"v");
    assert_eq!(app.cluster.hooks().kv_in.len(), installed);

    Ok(())
}
