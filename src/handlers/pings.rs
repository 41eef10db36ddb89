//! Health endpoints of the query, search and analytics services. These
//! services have no executor behind them, so pings are all they answer.

use std::sync::Arc;

use axum::http::{Method, StatusCode};
use serde_json::json;

use super::on_http;
use crate::cluster::ClusterHooks;
use crate::services::http::ApiError;
use crate::services::{HttpRequest, HttpResponse, HttpService};

pub(super) fn register(hooks: &ClusterHooks) {
    on_http(&hooks.query, Method::GET, "/admin/ping", query_ping);
    on_http(&hooks.search, Method::GET, "/api/ping", search_ping);
    on_http(&hooks.analytics, Method::GET, "/admin/ping", analytics_ping);
}

fn query_ping(_service: &Arc<HttpService>, _req: &HttpRequest, _captures: &[String]) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::json(StatusCode::OK, &json!({}))?)
}

fn search_ping(_service: &Arc<HttpService>, _req: &HttpRequest, _captures: &[String]) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::empty(StatusCode::OK))
}

fn analytics_ping(
    _service: &Arc<HttpService>,
    _req: &HttpRequest,
    _captures: &[String],
) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::json(StatusCode::OK, &json!({ "status": "ok" }))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Cluster, ClusterOptions};

    #[tokio::test]
    async fn every_service_answers_its_ping() -> anyhow::Result<()> {
        let cluster = Cluster::new(ClusterOptions::default()).await?;
        let node = cluster.nodes().into_iter().next().unwrap();

        let query = Arc::clone(node.query_service().unwrap());
        let res = query.dispatch(&HttpRequest::new(Method::GET, "/admin/ping"));
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.body_bytes().unwrap().as_ref(), b"{}");

        let search = Arc::clone(node.search_service().unwrap());
        assert_eq!(search.dispatch(&HttpRequest::new(Method::GET, "/api/ping")).status, StatusCode::OK);

        let analytics = Arc::clone(node.analytics_service().unwrap());
        let res = analytics.dispatch(&HttpRequest::new(Method::GET, "/admin/ping"));
        assert_eq!(res.body_bytes().unwrap().as_ref(), br#"{"status":"ok"}"#);

        let res = query.dispatch(&HttpRequest::new(Method::GET, "/query/service"));
        assert_eq!(res.status, StatusCode::NOT_FOUND);
        Ok(())
    }
}
