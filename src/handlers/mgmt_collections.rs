//! Scope and collection management over REST.

use std::sync::Arc;

use axum::http::{Method, StatusCode};
use serde_json::json;

use super::{capture, cluster_of, on_http};
use crate::auth::Permission;
use crate::cluster::Bucket;
use crate::collections::ManifestError;
use crate::hooks::HttpHooks;
use crate::services::http::ApiError;
use crate::services::{HttpRequest, HttpResponse, HttpService};

const BUCKET_PATH: &str = "/pools/default/buckets/*";

pub(super) fn register(hooks: &HttpHooks) {
    on_http(hooks, Method::GET, &format!("{BUCKET_PATH}/scopes"), get_manifest);
    on_http(hooks, Method::POST, &format!("{BUCKET_PATH}/scopes"), create_scope);
    on_http(hooks, Method::DELETE, &format!("{BUCKET_PATH}/scopes/*"), drop_scope);
    on_http(hooks, Method::POST, &format!("{BUCKET_PATH}/scopes/*/collections"), create_collection);
    on_http(hooks, Method::DELETE, &format!("{BUCKET_PATH}/scopes/*/collections/*"), drop_collection);
}

/// Authorize a manifest change on the captured bucket and resolve it.
fn managed_bucket(
    service: &Arc<HttpService>,
    req: &HttpRequest,
    captures: &[String],
    permission: Permission,
) -> Result<Arc<Bucket>, ApiError> {
    let name = capture(captures, 0);
    service.require(req, Permission::ClusterRead, "", "", "")?;
    service.require(req, permission, name, "", "")?;
    let (_, cluster) = cluster_of(service)?;
    cluster
        .get_bucket(name)
        .ok_or_else(|| ApiError::not_found("Requested resource not found."))
}

/// The manifest uid a successful change answers with.
fn uid_response(uid: u64) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::json(StatusCode::OK, &json!({ "uid": format!("{uid:x}") }))?)
}

/// Manifest failures are reported as form errors, whatever their kind.
fn manifest_error(err: ManifestError) -> ApiError {
    ApiError::field("_", err.to_string())
}

fn validate_name(name: Option<&String>) -> Result<&str, ApiError> {
    let name = name.map(String::as_str).unwrap_or_default();
    if name.is_empty() {
        return Err(ApiError::field("name", "name is required"));
    }
    if name.starts_with('_') || name.starts_with('%') {
        return Err(ApiError::field("name", "First character must not be _ or %"));
    }
    let valid = name.len() <= 251
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '%'));
    if !valid {
        return Err(ApiError::field(
            "name",
            "Can only contain characters A-Z, a-z, 0-9 and the following symbols _ - %",
        ));
    }
    Ok(name)
}

fn get_manifest(service: &Arc<HttpService>, req: &HttpRequest, captures: &[String]) -> Result<HttpResponse, ApiError> {
    let bucket = managed_bucket(service, req, captures, Permission::Settings)?;
    Ok(HttpResponse::json(StatusCode::OK, &bucket.collections().snapshot().to_json())?)
}

fn create_scope(service: &Arc<HttpService>, req: &HttpRequest, captures: &[String]) -> Result<HttpResponse, ApiError> {
    let bucket = managed_bucket(service, req, captures, Permission::BucketManage)?;
    let form = req.form();
    let name = validate_name(form.get("name"))?;
    let uid = bucket.create_scope(name).map_err(manifest_error)?;
    uid_response(uid)
}

fn drop_scope(service: &Arc<HttpService>, req: &HttpRequest, captures: &[String]) -> Result<HttpResponse, ApiError> {
    let bucket = managed_bucket(service, req, captures, Permission::BucketManage)?;
    let uid = bucket.drop_scope(capture(captures, 1)).map_err(manifest_error)?;
    uid_response(uid)
}

fn create_collection(
    service: &Arc<HttpService>,
    req: &HttpRequest,
    captures: &[String],
) -> Result<HttpResponse, ApiError> {
    let bucket = managed_bucket(service, req, captures, Permission::BucketManage)?;
    let form = req.form();
    let name = validate_name(form.get("name"))?;
    let max_ttl = match form.get("maxTTL").filter(|ttl| !ttl.is_empty()) {
        None => 0,
        Some(text) => text
            .parse::<u32>()
            .map_err(|_| ApiError::field("maxTTL", "The value must be an integer"))?,
    };
    let uid = bucket
        .create_collection(capture(captures, 1), name, max_ttl)
        .map_err(manifest_error)?;
    uid_response(uid)
}

fn drop_collection(service: &Arc<HttpService>, req: &HttpRequest, captures: &[String]) -> Result<HttpResponse, ApiError> {
    let bucket = managed_bucket(service, req, captures, Permission::BucketManage)?;
    let uid = bucket
        .drop_collection(capture(captures, 1), capture(captures, 2))
        .map_err(manifest_error)?;
    uid_response(uid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{DEFAULT_ADMIN_PASSWORD, DEFAULT_ADMIN_USER};
    use crate::cluster::{BucketOptions, Cluster, ClusterOptions};

    fn admin(method: Method, path: &str) -> HttpRequest {
        HttpRequest::new(method, path).with_credentials(DEFAULT_ADMIN_USER, DEFAULT_ADMIN_PASSWORD)
    }

    fn body_json(res: &HttpResponse) -> serde_json::Value {
        serde_json::from_slice(res.body_bytes().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn manages_scopes_and_collections() -> anyhow::Result<()> {
        let cluster = Cluster::new(ClusterOptions::default()).await?;
        let bucket = cluster.add_bucket(BucketOptions {
            name: "default".to_string(),
            ..BucketOptions::default()
        })?;
        let node = cluster.nodes().into_iter().next().unwrap();
        let mgmt = Arc::clone(node.mgmt_service().unwrap());

        let res = mgmt.dispatch(&admin(Method::POST, "/pools/default/buckets/default/scopes").with_body("name=inventory"));
        assert_eq!(res.status, StatusCode::OK);
        assert!(body_json(&res)["uid"].is_string());

        let res = mgmt.dispatch(
            &admin(Method::POST, "/pools/default/buckets/default/scopes/inventory/collections")
                .with_body("name=hotels&maxTTL=60"),
        );
        assert_eq!(res.status, StatusCode::OK);
        assert!(bucket.collections().get_collection_id("inventory", "hotels").is_ok());

        let res = mgmt.dispatch(&admin(Method::POST, "/pools/default/buckets/default/scopes").with_body("name=inventory"));
        assert_eq!(res.status, StatusCode::BAD_REQUEST);
        assert!(body_json(&res)["errors"]["_"].is_string());

        let res = mgmt.dispatch(&admin(Method::GET, "/pools/default/buckets/default/scopes"));
        let manifest = body_json(&res);
        assert!(manifest["scopes"].as_array().unwrap().iter().any(|s| s["name"] == "inventory"));

        let res = mgmt.dispatch(&admin(
            Method::DELETE,
            "/pools/default/buckets/default/scopes/inventory/collections/hotels",
        ));
        assert_eq!(res.status, StatusCode::OK);
        let res = mgmt.dispatch(&admin(Method::DELETE, "/pools/default/buckets/default/scopes/inventory"));
        assert_eq!(res.status, StatusCode::OK);
        Ok(())
    }

    #[test]
    fn names_must_not_start_with_reserved_characters() {
        assert!(validate_name(Some(&"_system".to_string())).is_err());
        assert!(validate_name(Some(&"%x".to_string())).is_err());
        assert!(validate_name(None).is_err());
        assert_eq!(validate_name(Some(&"hotels-2".to_string())).unwrap(), "hotels-2");
    }
}
