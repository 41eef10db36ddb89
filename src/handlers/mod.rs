//! Built-in behaviour of every service, installed at the tail of the
//! cluster's hook chains.
//!
//! Each handler claims one KV opcode or one HTTP method and path template.
//! Hooks added later by tests run first and may answer, rewrite or pass
//! to these defaults.

mod kv_auth;
mod kv_crud;
mod kv_dcp;
mod kv_meta;
mod kv_subdoc;
mod mgmt;
mod mgmt_collections;
mod mgmt_users;
mod pings;
mod views;

use std::sync::Arc;
use std::time::Instant;

use axum::http::{Method, StatusCode};

use crate::auth::Permission;
use crate::cluster::{Bucket, Cluster, ClusterHooks, ClusterNode};
use crate::hooks::{HookResult, HttpHookFn, HttpHooks, KvHookFn, KvHooks, PathTemplate};
use crate::configgen::terse_bucket_config;
use crate::kvproc::{DocKey, Engine, ProcError};
use crate::memd::{HelloFeature, OpCode, Packet, Status};
use crate::services::http::ApiError;
use crate::services::{HttpRequest, HttpResponse, HttpService, KvClient, Service};
use crate::store::DATATYPE_JSON;

/// A KV request handler. It always answers, so the chain stops here.
type KvHandler = fn(&Arc<KvClient>, &Packet, Instant);

/// An HTTP route handler, given the path segments its template captured.
type HttpHandler = fn(&Arc<HttpService>, &HttpRequest, &[String]) -> Result<HttpResponse, ApiError>;

/// Install the default handlers into `hooks`.
pub(crate) fn register(hooks: &ClusterHooks) {
    kv_auth::register(&hooks.kv_in);
    kv_meta::register(&hooks.kv_in);
    kv_crud::register(&hooks.kv_in);
    kv_subdoc::register(&hooks.kv_in);
    kv_dcp::register(&hooks.kv_in);

    mgmt::register(&hooks.mgmt);
    mgmt_collections::register(&hooks.mgmt);
    mgmt_users::register(&hooks.mgmt);
    views::register(&hooks.views);
    pings::register(hooks);
}

/// Answer requests carrying `command`.
fn on_kv(hooks: &KvHooks, command: OpCode, handler: KvHandler) {
    let hook: Arc<KvHookFn> = Arc::new(
        move |client: &Arc<KvClient>, pak: &Packet, start: Instant, next: &mut dyn FnMut() -> HookResult<()>| {
            if !pak.magic.is_request() || pak.command != command {
                return next();
            }
            handler(client, pak, start);
            HookResult::Handled(())
        },
    );
    hooks.add(hook);
}

/// Answer `method` requests whose path matches `template`.
fn on_http(hooks: &HttpHooks, method: Method, template: &str, handler: HttpHandler) {
    let template = PathTemplate::new(template);
    let hook: Arc<HttpHookFn> = Arc::new(
        move |service: &Arc<HttpService>,
              req: &HttpRequest,
              next: &mut dyn FnMut() -> HookResult<HttpResponse>| {
            if req.method != method {
                return next();
            }
            let Some(captures) = template.captures(&req.path) else {
                return next();
            };
            match handler(service, req, &captures) {
                Ok(res) => HookResult::Handled(res),
                Err(err) => HookResult::Handled(err.into_response()),
            }
        },
    );
    hooks.add(hook);
}

fn reply_status(client: &Arc<KvClient>, pak: &Packet, start: Instant, status: Status) {
    client.reply(start, Packet::response_to(pak, status));
}

/// Reply with the status of a failed engine operation. NOT_MY_VBUCKET
/// carries the current bucket config so the client can refresh its map.
fn reply_proc_error(client: &Arc<KvClient>, pak: &Packet, start: Instant, err: &ProcError) {
    let mut res = Packet::response_to(pak, err.status());
    if matches!(err, ProcError::NotMyVbucket) {
        if let (Some(cluster), Some(node), Some(bucket)) = (client.cluster(), client.node(), client.selected_bucket()) {
            if let Ok(config) = serde_json::to_vec(&terse_bucket_config(&cluster, &bucket, &node)) {
                res.datatype = DATATYPE_JSON;
                res.value = config;
            }
        }
    }
    client.reply(start, res);
}

/// `n`th captured path segment.
fn capture(captures: &[String], n: usize) -> &str {
    captures.get(n).map(String::as_str).unwrap_or_default()
}

/// Mutation token extras (vbuuid, seqno) when the client negotiated them.
fn mutation_extras(client: &KvClient, vb_uuid: u64, seq_no: u64) -> Vec<u8> {
    if !client.has_feature(HelloFeature::SEQ_NO) {
        return Vec::new();
    }
    let mut extras = Vec::with_capacity(16);
    extras.extend_from_slice(&vb_uuid.to_be_bytes());
    extras.extend_from_slice(&seq_no.to_be_bytes());
    extras
}

/// Selected bucket plus the engine the client's node runs on it.
struct BucketContext {
    bucket: Arc<Bucket>,
    engine: Engine,
}

/// Resolve the bucket a data command runs against, replying with the
/// failure status when there is none or the user lacks `permission`.
fn bucket_context(
    client: &Arc<KvClient>,
    pak: &Packet,
    start: Instant,
    permission: Permission,
) -> Option<BucketContext> {
    let (Some(bucket), Some(node)) = (client.selected_bucket(), client.node()) else {
        reply_status(client, pak, start, Status::NO_BUCKET);
        return None;
    };
    if !bucket.collections().has_collection_id(pak.collection_id) {
        reply_status(client, pak, start, Status::UNKNOWN_COLLECTION);
        return None;
    }
    if !client.check_authenticated(permission, pak.collection_id) {
        reply_status(client, pak, start, Status::ACCESS_ERROR);
        return None;
    }
    let engine = bucket.engine_for(node.id());
    Some(BucketContext { bucket, engine })
}

/// The document a request addresses.
fn doc_key(pak: &Packet) -> DocKey {
    DocKey::new(pak.vbucket, pak.collection_id, pak.key.clone())
}

/// The node serving `service`, or a 503 if it has shut down.
fn node_of(service: &HttpService) -> Result<Arc<ClusterNode>, ApiError> {
    service
        .node()
        .ok_or_else(|| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "node is shutting down"))
}

/// The node serving `service` together with its cluster.
fn cluster_of(service: &HttpService) -> Result<(Arc<ClusterNode>, Cluster), ApiError> {
    let node = node_of(service)?;
    let cluster = node
        .cluster()
        .ok_or_else(|| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "cluster is shutting down"))?;
    Ok((node, cluster))
}

/// Parse a boolean form field the way the management API accepts them.
fn parse_flag(text: &str) -> Option<bool> {
    match text {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
