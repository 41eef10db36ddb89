//! Integration tests for the management, views and ping HTTP services.
//!
//! These tests use axum-test to drive a node's routers in memory; the
//! cluster behind them is real.

mod common;

use axum::http::StatusCode;
use serde_json::{Value, json};

use caves::memd::Status;
use caves::services::ServiceType;
use common::{KvConn, TestCluster, as_admin};

// =============================================================================
// Buckets
// =============================================================================

#[tokio::test]
async fn test_bucket_listing_needs_credentials() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let server = app.mgmt_server()?;

    server
        .get("/pools/default/buckets")
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    let response = as_admin(server.get("/pools/default/buckets")).await;
    response.assert_status_ok();
    let buckets: Vec<Value> = response.json();
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets.first().map(|b| b["name"].clone()), Some(json!("default")));

    Ok(())
}

#[tokio::test]
async fn test_bucket_lifecycle() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let server = app.mgmt_server()?;

    as_admin(server.post("/pools/default/buckets"))
        .form(&[("name", "travel"), ("ramQuotaMB", "256"), ("replicaNumber", "0")])
        .await
        .assert_status(StatusCode::ACCEPTED);
    assert!(app.cluster.get_bucket("travel").is_some());

    let response = as_admin(server.get("/pools/default/buckets/travel")).await;
    response.assert_status_ok();
    let config: Value = response.json();
    assert_eq!(config["name"], "travel");
    assert_eq!(config["replicaNumber"], 0);

    as_admin(server.post("/pools/default/buckets/travel"))
        .form(&[("ramQuotaMB", "512"), ("flushEnabled", "1")])
        .await
        .assert_status_ok();

    as_admin(server.post("/pools/default/buckets/travel/controller/doFlush"))
        .await
        .assert_status_ok();

    as_admin(server.delete("/pools/default/buckets/travel"))
        .await
        .assert_status_ok();
    assert!(app.cluster.get_bucket("travel").is_none());

    as_admin(server.get("/pools/default/buckets/travel"))
        .await
        .assert_status(StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn test_bucket_creation_validates_replicas() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let server = app.mgmt_server()?;

    let response = as_admin(server.post("/pools/default/buckets"))
        .form(&[("name", "wide"), ("ramQuotaMB", "100"), ("replicaNumber", "9")])
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert!(body["errors"]["replicaNumber"].is_string());
    assert!(app.cluster.get_bucket("wide").is_none());

    Ok(())
}

#[tokio::test]
async fn test_terse_config_matches_the_kv_map() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let server = app.mgmt_server()?;

    let response = as_admin(server.get("/pools/default/b/default")).await;
    response.assert_status_ok();
    let config: Value = response.json();

    assert_eq!(config["nodeLocator"], "vbucket");
    let server_list = config["vBucketServerMap"]["serverList"].as_array().cloned().unwrap_or_default();
    assert_eq!(server_list, vec![json!(app.kv_addr()?)]);

    Ok(())
}

// =============================================================================
// Scopes and Collections
// =============================================================================

#[tokio::test]
async fn test_collections_are_visible_over_rest() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let server = app.mgmt_server()?;

    let created = as_admin(server.post("/pools/default/buckets/default/scopes"))
        .form(&[("name", "inventory")])
        .await;
    created.assert_status_ok();
    let uid: Value = created.json();
    assert!(uid["uid"].is_string());

    as_admin(server.post("/pools/default/buckets/default/scopes/inventory/collections"))
        .form(&[("name", "airline")])
        .await
        .assert_status_ok();

    let manifest: Value = as_admin(server.get("/pools/default/buckets/default/scopes"))
        .await
        .json();
    let scopes = manifest["scopes"].as_array().cloned().unwrap_or_default();
    let inventory = scopes
        .iter()
        .find(|scope| scope["name"] == "inventory")
        .ok_or_else(|| anyhow::anyhow!("scope missing from manifest"))?;
    assert_eq!(inventory["collections"][0]["name"], "airline");

    // A second scope with the same name is a manifest error
    as_admin(server.post("/pools/default/buckets/default/scopes"))
        .form(&[("name", "inventory")])
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    Ok(())
}

// =============================================================================
// Users
// =============================================================================

#[tokio::test]
async fn test_rest_users_can_log_in_over_kv() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let server = app.mgmt_server()?;

    as_admin(server.put("/settings/rbac/users/local/reader"))
        .form(&[("password", "secret1"), ("roles", "data_reader[default]")])
        .await
        .assert_status_ok();

    let user: Value = as_admin(server.get("/settings/rbac/users/local/reader")).await.json();
    assert_eq!(user["id"], "reader");
    assert_eq!(user["roles"][0]["role"], "data_reader");
    assert_eq!(user["roles"][0]["bucket_name"], "default");

    let mut conn = KvConn::connect(&app.kv_addr()?).await?;
    conn.auth_plain("reader", "secret1").await?;
    conn.select_bucket("default").await?;
    assert_eq!(conn.get("anything").await?.status, Status::KEY_NOT_FOUND);
    // Reading is allowed, writing is not
    assert_eq!(conn.set("anything", b"v", 0).await?.status, Status::ACCESS_ERROR);

    as_admin(server.delete("/settings/rbac/users/local/reader"))
        .await
        .assert_status_ok();
    let mut conn = KvConn::connect(&app.kv_addr()?).await?;
    assert_eq!(conn.try_auth_plain("reader", "secret1").await?, Status::AUTH_ERROR);

    Ok(())
}

#[tokio::test]
async fn test_external_domains_are_not_supported() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let server = app.mgmt_server()?;

    as_admin(server.get("/settings/rbac/users/external/someone"))
        .await
        .assert_status(StatusCode::NOT_FOUND);

    Ok(())
}

// =============================================================================
// Views and Pings
// =============================================================================

#[tokio::test]
async fn test_design_documents_round_trip() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;
    let views = app.http_server(ServiceType::Views)?;
    let mgmt = app.mgmt_server()?;

    let ddoc = json!({"views": {"by_name": {"map": "function (doc, meta) { emit(doc.name, null); }"}}});
    as_admin(views.put("/default/_design/people"))
        .json(&ddoc)
        .await
        .assert_status(StatusCode::CREATED);

    let fetched: Value = as_admin(views.get("/default/_design/people")).await.json();
    assert!(fetched["views"]["by_name"]["map"].is_string());

    let rows: Value = as_admin(mgmt.get("/pools/default/buckets/default/ddocs")).await.json();
    assert_eq!(rows["rows"][0]["doc"]["meta"]["id"], "_design/people");

    let result: Value = as_admin(views.get("/default/_design/people/_view/by_name")).await.json();
    assert_eq!(result["total_rows"], 0);

    as_admin(views.get("/default/_design/people/_view/missing"))
        .await
        .assert_status(StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn test_every_service_answers_pings() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;

    app.http_server(ServiceType::Query)?
        .get("/admin/ping")
        .await
        .assert_status_ok();
    app.http_server(ServiceType::Search)?
        .get("/api/ping")
        .await
        .assert_status_ok();
    app.http_server(ServiceType::Analytics)?
        .get("/admin/ping")
        .await
        .assert_status_ok();

    let welcome: Value = app.http_server(ServiceType::Views)?.get("/").await.json();
    assert_eq!(welcome["couchdb"], "Welcome");

    app.mgmt_server()?
        .get("/")
        .await
        .assert_status(StatusCode::MOVED_PERMANENTLY);

    Ok(())
}

#[tokio::test]
async fn test_unknown_paths_fall_through_to_404() -> anyhow::Result<()> {
    let app = TestCluster::new().await?;

    as_admin(app.mgmt_server()?.get("/not/a/route"))
        .await
        .assert_status(StatusCode::NOT_FOUND);

    Ok(())
}
