//! Cluster management REST API: pool and bucket configs, bucket admin and
//! the streaming config endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::http::header::LOCATION;
use axum::http::{HeaderValue, Method, StatusCode};
use serde_json::json;
use tokio::sync::mpsc;

use super::{capture, cluster_of, on_http, parse_flag};
use crate::auth::Permission;
use crate::cluster::{BucketOptions, BucketSettings, BucketType, ClusterError, MAX_REPLICAS};
use crate::configgen::{bucket_config, pool_config, pools_config, terse_bucket_config, terse_cluster_config};
use crate::hooks::HttpHooks;
use crate::logging::{debug, info};
use crate::services::http::ApiError;
use crate::services::{HttpRequest, HttpResponse, HttpService, ServiceType};

/// Separator the streaming endpoint writes after each config.
const STREAM_DELIMITER: &[u8] = b"\n\n\n\n";

pub(super) fn register(hooks: &HttpHooks) {
    on_http(hooks, Method::GET, "/", root);
    on_http(hooks, Method::GET, "/pools", pools);
    on_http(hooks, Method::GET, "/pools/default", pool_default);
    on_http(hooks, Method::GET, "/pools/default/nodeServices", node_services);
    on_http(hooks, Method::GET, "/pools/default/buckets", list_buckets);
    on_http(hooks, Method::GET, "/pools/default/buckets/*", get_bucket);
    on_http(hooks, Method::GET, "/pools/default/b/*", terse_bucket);
    on_http(hooks, Method::GET, "/pools/default/bs/*", streaming_bucket);
    on_http(hooks, Method::POST, "/pools/default/buckets", create_bucket);
    on_http(hooks, Method::POST, "/pools/default/buckets/*", update_bucket);
    on_http(hooks, Method::DELETE, "/pools/default/buckets/*", delete_bucket);
    on_http(hooks, Method::POST, "/pools/default/buckets/*/controller/doFlush", flush_bucket);
    on_http(hooks, Method::GET, "/pools/default/buckets/*/ddocs", list_design_documents);
}

fn root(service: &Arc<HttpService>, _req: &HttpRequest, _captures: &[String]) -> Result<HttpResponse, ApiError> {
    let (node, _) = cluster_of(service)?;
    let location = format!("http://{}:{}/ui/index.html", node.hostname(), node.port(ServiceType::Mgmt));
    let location = HeaderValue::from_str(&location).map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(HttpResponse::empty(StatusCode::MOVED_PERMANENTLY).with_header(LOCATION, location))
}

fn pools(service: &Arc<HttpService>, req: &HttpRequest, _captures: &[String]) -> Result<HttpResponse, ApiError> {
    service.require(req, Permission::Settings, "", "", "")?;
    let (_, cluster) = cluster_of(service)?;
    Ok(HttpResponse::json(StatusCode::OK, &pools_config(&cluster))?)
}

fn pool_default(service: &Arc<HttpService>, req: &HttpRequest, _captures: &[String]) -> Result<HttpResponse, ApiError> {
    service.require(req, Permission::Settings, "", "", "")?;
    let (node, cluster) = cluster_of(service)?;
    Ok(HttpResponse::json(StatusCode::OK, &pool_config(&cluster, &node))?)
}

fn node_services(service: &Arc<HttpService>, _req: &HttpRequest, _captures: &[String]) -> Result<HttpResponse, ApiError> {
    let (node, cluster) = cluster_of(service)?;
    Ok(HttpResponse::json(StatusCode::OK, &terse_cluster_config(&cluster, &node))?)
}

fn list_buckets(service: &Arc<HttpService>, req: &HttpRequest, _captures: &[String]) -> Result<HttpResponse, ApiError> {
    if req.credentials.is_none() {
        return Err(ApiError::unauthorized());
    }
    let (node, cluster) = cluster_of(service)?;
    let configs: Vec<_> = cluster
        .buckets()
        .iter()
        .filter(|bucket| service.check_authenticated(req, Permission::Settings, bucket.name(), "", ""))
        .map(|bucket| bucket_config(&cluster, bucket, &node))
        .collect();
    Ok(HttpResponse::json(StatusCode::OK, &configs)?)
}

fn get_bucket(service: &Arc<HttpService>, req: &HttpRequest, captures: &[String]) -> Result<HttpResponse, ApiError> {
    let name = capture(captures, 0);
    service.require(req, Permission::Settings, name, "", "")?;
    let (node, cluster) = cluster_of(service)?;
    let bucket = cluster
        .get_bucket(name)
        .ok_or_else(|| ApiError::not_found("Requested resource not found."))?;
    Ok(HttpResponse::json(StatusCode::OK, &bucket_config(&cluster, &bucket, &node))?)
}

fn terse_bucket(service: &Arc<HttpService>, req: &HttpRequest, captures: &[String]) -> Result<HttpResponse, ApiError> {
    let name = capture(captures, 0);
    service.require(req, Permission::Settings, name, "", "")?;
    let (node, cluster) = cluster_of(service)?;
    let bucket = cluster.get_bucket(name).ok_or_else(|| ApiError::not_found(""))?;
    Ok(HttpResponse::json(StatusCode::OK, &terse_bucket_config(&cluster, &bucket, &node))?)
}

/// Stream the bucket's config, then a fresh copy after every cluster change
/// until the client hangs up or the bucket goes away.
fn streaming_bucket(service: &Arc<HttpService>, req: &HttpRequest, captures: &[String]) -> Result<HttpResponse, ApiError> {
    let name = capture(captures, 0).to_string();
    service.require(req, Permission::Settings, &name, "", "")?;
    let (node, cluster) = cluster_of(service)?;
    if cluster.get_bucket(&name).is_none() {
        return Err(ApiError::not_found(""));
    }
    let runtime = tokio::runtime::Handle::try_current().map_err(|err| ApiError::internal(err.to_string()))?;

    let (tx, rx) = mpsc::channel::<Bytes>(4);
    let mut subscription = cluster.watch_config();
    runtime.spawn(async move {
        loop {
            let Some(bucket) = cluster.get_bucket(&name) else {
                break;
            };
            let Ok(mut chunk) = serde_json::to_vec(&terse_bucket_config(&cluster, &bucket, &node)) else {
                break;
            };
            chunk.extend_from_slice(STREAM_DELIMITER);
            if tx.send(Bytes::from(chunk)).await.is_err() {
                break;
            }
            tokio::select! {
                changed = subscription.changed() => {
                    if changed.is_none() {
                        break;
                    }
                }
                _ = tx.closed() => break,
            }
        }
        debug!(bucket = %name, "config stream closed");
    });
    Ok(HttpResponse::stream(StatusCode::OK, rx))
}

/// Bucket settings from a create or edit form.
fn parse_settings(form: &HashMap<String, String>) -> Result<BucketSettings, ApiError> {
    let defaults = BucketOptions::default();
    let replicas = match form.get("replicaNumber") {
        None => defaults.replicas,
        Some(text) => text
            .parse::<u32>()
            .map_err(|_| ApiError::field("replicaNumber", "The value must be an integer"))?,
    };
    if replicas > MAX_REPLICAS {
        return Err(ApiError::field(
            "replicaNumber",
            format!("Replica number larger than {MAX_REPLICAS} is not supported."),
        ));
    }
    let flush_enabled = match form.get("flushEnabled") {
        None => defaults.flush_enabled,
        Some(text) => {
            parse_flag(text).ok_or_else(|| ApiError::field("flushEnabled", "flushenabled can only be 1 or 0"))?
        }
    };
    let ram_quota_mb = form
        .get("ramQuotaMB")
        .and_then(|text| text.parse::<u64>().ok())
        .filter(|quota| *quota > 0)
        .ok_or_else(|| {
            ApiError::field("ramQuota", "The RAM Quota must be specified and must be a positive integer.")
        })?;
    let replica_index = match form.get("replicaIndex") {
        None => defaults.replica_index,
        Some(text) => {
            parse_flag(text).ok_or_else(|| ApiError::field("replicaIndex", "replicaIndex can only be 1 or 0"))?
        }
    };
    let compression_mode = form
        .get("compressionMode")
        .filter(|mode| !mode.is_empty())
        .cloned()
        .unwrap_or(defaults.compression_mode);

    Ok(BucketSettings {
        replicas,
        flush_enabled,
        ram_quota_mb,
        replica_index,
        compression_mode,
    })
}

fn create_bucket(service: &Arc<HttpService>, req: &HttpRequest, _captures: &[String]) -> Result<HttpResponse, ApiError> {
    service.require(req, Permission::ClusterManage, "", "", "")?;
    let (_, cluster) = cluster_of(service)?;
    let form = req.form();
    let name = form.get("name").cloned().unwrap_or_default();
    if name.is_empty() {
        return Err(ApiError::field("name", "Bucket name cannot be empty"));
    }
    let settings = parse_settings(&form)?;
    let opts = BucketOptions {
        name,
        bucket_type: form.get("bucketType").map(|t| BucketType::parse(t)).unwrap_or_default(),
        replicas: settings.replicas,
        flush_enabled: settings.flush_enabled,
        ram_quota_mb: settings.ram_quota_mb,
        replica_index: settings.replica_index,
        compression_mode: settings.compression_mode,
    };
    match cluster.add_bucket(opts) {
        Ok(bucket) => {
            info!(bucket = %bucket.name(), "bucket created over rest");
            Ok(HttpResponse::empty(StatusCode::ACCEPTED))
        }
        Err(ClusterError::InvalidReplicas(n)) => Err(ApiError::field(
            "replicaNumber",
            format!("Replica number must be between 0 and {MAX_REPLICAS}, got {n}"),
        )),
        Err(err) => Err(err.into()),
    }
}

fn update_bucket(service: &Arc<HttpService>, req: &HttpRequest, captures: &[String]) -> Result<HttpResponse, ApiError> {
    service.require(req, Permission::ClusterManage, "", "", "")?;
    let (_, cluster) = cluster_of(service)?;
    let bucket = cluster
        .get_bucket(capture(captures, 0))
        .ok_or_else(|| ApiError::not_found("Requested resource not found."))?;
    let settings = parse_settings(&req.form())?;
    bucket.update_settings(settings);
    Ok(HttpResponse::empty(StatusCode::OK))
}

fn delete_bucket(service: &Arc<HttpService>, req: &HttpRequest, captures: &[String]) -> Result<HttpResponse, ApiError> {
    service.require(req, Permission::ClusterManage, "", "", "")?;
    let (_, cluster) = cluster_of(service)?;
    match cluster.delete_bucket(capture(captures, 0)) {
        Ok(()) => Ok(HttpResponse::empty(StatusCode::OK)),
        Err(ClusterError::BucketNotFound(_)) => Err(ApiError::not_found("Requested resource not found.")),
        Err(err) => Err(err.into()),
    }
}

fn flush_bucket(service: &Arc<HttpService>, req: &HttpRequest, captures: &[String]) -> Result<HttpResponse, ApiError> {
    let name = capture(captures, 0);
    service.require(req, Permission::BucketManage, name, "", "")?;
    let (_, cluster) = cluster_of(service)?;
    let bucket = cluster
        .get_bucket(name)
        .ok_or_else(|| ApiError::not_found("Requested resource not found."))?;
    if !bucket.settings().flush_enabled {
        return Ok(HttpResponse::json(
            StatusCode::BAD_REQUEST,
            &json!({ "_": "Flush is disabled for the bucket" }),
        )?);
    }
    bucket.flush();
    Ok(HttpResponse::empty(StatusCode::OK))
}

fn list_design_documents(
    service: &Arc<HttpService>,
    req: &HttpRequest,
    captures: &[String],
) -> Result<HttpResponse, ApiError> {
    let name = capture(captures, 0);
    service.require(req, Permission::ViewsRead, name, "", "")?;
    let (_, cluster) = cluster_of(service)?;
    let bucket = cluster
        .get_bucket(name)
        .ok_or_else(|| ApiError::not_found("Requested resource not found."))?;
    let rows: Vec<_> = bucket
        .design_documents()
        .into_iter()
        .map(|(ddoc_name, ddoc)| {
            json!({
                "doc": {
                    "meta": { "id": format!("_design/{ddoc_name}") },
                    "json": ddoc,
                },
            })
        })
        .collect();
    Ok(HttpResponse::json(StatusCode::OK, &json!({ "rows": rows }))?)
}
