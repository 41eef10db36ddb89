//! Views service: design document management and the (empty) view query.

use std::sync::Arc;

use axum::http::{Method, StatusCode};
use serde_json::json;

use super::{capture, cluster_of, on_http, parse_flag};
use crate::auth::Permission;
use crate::cluster::{Bucket, DesignDocument};
use crate::hooks::HttpHooks;
use crate::logging::debug;
use crate::services::http::ApiError;
use crate::services::{HttpRequest, HttpResponse, HttpService};

pub(super) fn register(hooks: &HttpHooks) {
    on_http(hooks, Method::GET, "/", ping);
    on_http(hooks, Method::PUT, "/*/_design/*", upsert_design_document);
    on_http(hooks, Method::GET, "/*/_design/*", get_design_document);
    on_http(hooks, Method::DELETE, "/*/_design/*", drop_design_document);
    on_http(hooks, Method::GET, "/*/_design/*/_view/*", query_view);
}

fn ping(_service: &Arc<HttpService>, _req: &HttpRequest, _captures: &[String]) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::json(
        StatusCode::OK,
        &json!({
            "couchdb": "Welcome",
            "version": "v4.5.1-237-g63b3e06",
            "couchbase": "7.0.0-4342-enterprise",
        }),
    )?)
}

/// The error body the views engine answers for a missing document or view.
fn not_found(reason: &str) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::json(
        StatusCode::NOT_FOUND,
        &json!({ "error": "not_found", "reason": reason }),
    )?)
}

fn view_bucket(
    service: &Arc<HttpService>,
    req: &HttpRequest,
    captures: &[String],
    permission: Permission,
) -> Result<Option<Arc<Bucket>>, ApiError> {
    let name = capture(captures, 0);
    service.require(req, permission, name, "", "")?;
    let (_, cluster) = cluster_of(service)?;
    Ok(cluster.get_bucket(name))
}

fn upsert_design_document(
    service: &Arc<HttpService>,
    req: &HttpRequest,
    captures: &[String],
) -> Result<HttpResponse, ApiError> {
    let Some(bucket) = view_bucket(service, req, captures, Permission::ViewsManage)? else {
        return not_found("no_such_bucket");
    };
    let ddoc: DesignDocument = serde_json::from_slice(&req.body)
        .map_err(|err| ApiError::bad_request(format!("invalid design document: {err}")))?;
    let name = capture(captures, 1);
    debug!(bucket = %bucket.name(), ddoc = %name, views = ddoc.views.len(), "upserting design document");
    bucket.upsert_design_document(name, ddoc);
    Ok(HttpResponse::json(
        StatusCode::CREATED,
        &json!({ "ok": true, "id": format!("_design/{name}") }),
    )?)
}

fn get_design_document(
    service: &Arc<HttpService>,
    req: &HttpRequest,
    captures: &[String],
) -> Result<HttpResponse, ApiError> {
    let Some(bucket) = view_bucket(service, req, captures, Permission::ViewsRead)? else {
        return not_found("no_such_bucket");
    };
    match bucket.design_document(capture(captures, 1)) {
        Some(ddoc) => Ok(HttpResponse::json(StatusCode::OK, &ddoc)?),
        None => not_found("missing"),
    }
}

fn drop_design_document(
    service: &Arc<HttpService>,
    req: &HttpRequest,
    captures: &[String],
) -> Result<HttpResponse, ApiError> {
    let Some(bucket) = view_bucket(service, req, captures, Permission::ViewsManage)? else {
        return not_found("no_such_bucket");
    };
    let name = capture(captures, 1);
    if !bucket.drop_design_document(name) {
        return not_found("deleted");
    }
    Ok(HttpResponse::json(
        StatusCode::OK,
        &json!({ "ok": true, "id": format!("_design/{name}") }),
    )?)
}

/// Views are never indexed, so every query over a defined view is empty.
fn query_view(service: &Arc<HttpService>, req: &HttpRequest, captures: &[String]) -> Result<HttpResponse, ApiError> {
    let Some(bucket) = view_bucket(service, req, captures, Permission::ViewsRead)? else {
        return not_found("no_such_bucket");
    };
    let Some(ddoc) = bucket.design_document(capture(captures, 1)) else {
        return not_found("missing");
    };
    if !ddoc.views.contains_key(capture(captures, 2)) {
        return not_found("missing_named_view");
    }

    let params = req.query_params();
    let mut result = json!({ "total_rows": 0, "rows": [] });
    if params.get("debug").and_then(|flag| parse_flag(flag)).unwrap_or(false) {
        if let Some(obj) = result.as_object_mut() {
            obj.insert("debug_info".to_string(), json!({ "main_group": { "cleanups": 0 } }));
        }
    }
    Ok(HttpResponse::json(StatusCode::OK, &result)?)
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
    async fn design_document_lifecycle() -> anyhow::Result<()> {
        let cluster = Cluster::new(ClusterOptions::default()).await?;
        cluster.add_bucket(BucketOptions {
            name: "beer".to_string(),
            ..BucketOptions::default()
        })?;
        let node = cluster.nodes().into_iter().next().unwrap();
        let views = Arc::clone(node.views_service().unwrap());

        let ddoc = r#"{"views":{"by_name":{"map":"function (doc, meta) { emit(doc.name, null); }"}}}"#;
        let res = views.dispatch(&admin(Method::PUT, "/beer/_design/dev_beers").with_body(ddoc));
        assert_eq!(res.status, StatusCode::CREATED);

        let res = views.dispatch(&admin(Method::GET, "/beer/_design/dev_beers"));
        assert_eq!(res.status, StatusCode::OK);
        assert!(body_json(&res)["views"]["by_name"]["map"].is_string());

        let res = views.dispatch(&admin(Method::GET, "/beer/_design/dev_beers/_view/by_name?debug=true"));
        assert_eq!(res.status, StatusCode::OK);
        let result = body_json(&res);
        assert_eq!(result["total_rows"], 0);
        assert!(result["rows"].as_array().unwrap().is_empty());
        assert_eq!(result["debug_info"]["main_group"]["cleanups"], 0);

        let res = views.dispatch(&admin(Method::GET, "/beer/_design/dev_beers/_view/nope"));
        assert_eq!(res.status, StatusCode::NOT_FOUND);

        let res = views.dispatch(&admin(Method::DELETE, "/beer/_design/dev_beers"));
        assert_eq!(res.status, StatusCode::OK);
        let res = views.dispatch(&admin(Method::GET, "/beer/_design/dev_beers"));
        assert_eq!(body_json(&res)["error"], "not_found");
        Ok(())
    }

    #[tokio::test]
    async fn ping_needs_no_credentials() -> anyhow::Result<()> {
        let cluster = Cluster::new(ClusterOptions::default()).await?;
        let node = cluster.nodes().into_iter().next().unwrap();
        let views = Arc::clone(node.views_service().unwrap());
        let res = views.dispatch(&HttpRequest::new(Method::GET, "/"));
        assert_eq!(body_json(&res)["couchdb"], "Welcome");
        Ok(())
    }
}
