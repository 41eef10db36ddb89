//! Connection level commands: feature negotiation, the error map, cluster
//! config over CCCP and collection lookups.

use std::sync::Arc;
use std::time::Instant;

use super::{bucket_context, on_kv, reply_status};
use crate::auth::Permission;
use crate::cluster::BucketType;
use crate::collections::ManifestError;
use crate::configgen::{terse_bucket_config, terse_cluster_config};
use crate::hooks::KvHooks;
use crate::logging::{debug, warn};
use crate::memd::buffer::read_u16;
use crate::memd::{ErrorMap, HelloFeature, MAX_ERRMAP_VERSION, OpCode, Packet, Status, negotiate};
use crate::services::KvClient;
use crate::store::DATATYPE_JSON;

pub(super) fn register(hooks: &KvHooks) {
    on_kv(hooks, OpCode::HELLO, hello);
    on_kv(hooks, OpCode::NOOP, noop);
    on_kv(hooks, OpCode::GET_ERROR_MAP, get_error_map);
    on_kv(hooks, OpCode::GET_CLUSTER_CONFIG, get_cluster_config);
    on_kv(hooks, OpCode::COLLECTIONS_GET_MANIFEST, get_manifest);
    on_kv(hooks, OpCode::COLLECTIONS_GET_CID, get_collection_id);
}

fn hello(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let requested: Vec<HelloFeature> = pak
        .value
        .chunks_exact(2)
        .filter_map(|code| read_u16(code, 0).ok())
        .map(HelloFeature)
        .collect();
    let enabled = negotiate(&requested);
    debug!(
        client = client.id(),
        agent = %String::from_utf8_lossy(&pak.key),
        features = ?enabled,
        "hello negotiated"
    );

    let mut res = Packet::response_to(pak, Status::SUCCESS);
    res.value = enabled.iter().flat_map(|feature| feature.0.to_be_bytes()).collect();
    client.set_features(enabled);
    client.reply(start, res);
}

fn noop(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    reply_status(client, pak, start, Status::SUCCESS);
}

fn get_error_map(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let Ok(version) = read_u16(&pak.value, 0) else {
        reply_status(client, pak, start, Status::INVALID_ARGS);
        return;
    };
    if version == 0 {
        reply_status(client, pak, start, Status::INVALID_ARGS);
        return;
    }
    match ErrorMap::generate(version.min(MAX_ERRMAP_VERSION)).to_json() {
        Ok(json) => {
            let mut res = Packet::response_to(pak, Status::SUCCESS);
            res.value = json;
            client.reply(start, res);
        }
        Err(err) => {
            warn!(error = %err, "failed to encode error map");
            reply_status(client, pak, start, Status::INTERNAL_ERROR);
        }
    }
}

fn get_cluster_config(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let (Some(cluster), Some(node)) = (client.cluster(), client.node()) else {
        reply_status(client, pak, start, Status::INTERNAL_ERROR);
        return;
    };
    if !client.check_authenticated(Permission::Settings, pak.collection_id) {
        reply_status(client, pak, start, Status::AUTH_ERROR);
        return;
    }

    let encoded = match client.selected_bucket() {
        None => serde_json::to_vec(&terse_cluster_config(&cluster, &node)),
        Some(bucket) if bucket.bucket_type() == BucketType::Memcached => {
            reply_status(client, pak, start, Status::KEY_NOT_FOUND);
            return;
        }
        Some(bucket) => serde_json::to_vec(&terse_bucket_config(&cluster, &bucket, &node)),
    };
    match encoded {
        Ok(config) => {
            let mut res = Packet::response_to(pak, Status::SUCCESS);
            res.datatype = DATATYPE_JSON;
            res.value = config;
            client.reply(start, res);
        }
        Err(err) => {
            warn!(error = %err, "failed to encode cluster config");
            reply_status(client, pak, start, Status::INTERNAL_ERROR);
        }
    }
}

fn get_manifest(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let Some(ctx) = bucket_context(client, pak, start, Permission::Select) else {
        return;
    };
    match serde_json::to_vec(&ctx.bucket.collections().snapshot().to_json()) {
        Ok(manifest) => {
            let mut res = Packet::response_to(pak, Status::SUCCESS);
            res.datatype = DATATYPE_JSON;
            res.value = manifest;
            client.reply(start, res);
        }
        Err(err) => {
            warn!(error = %err, "failed to encode collection manifest");
            reply_status(client, pak, start, Status::INTERNAL_ERROR);
        }
    }
}

fn get_collection_id(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let Some(ctx) = bucket_context(client, pak, start, Permission::Select) else {
        return;
    };
    // Older clients send the path as the key, newer ones as the value
    let raw = if pak.key.is_empty() { &pak.value } else { &pak.key };
    let path = String::from_utf8_lossy(raw);
    let Some((scope, collection)) = path.split_once('.').filter(|(_, c)| !c.contains('.')) else {
        reply_status(client, pak, start, Status::INVALID_ARGS);
        return;
    };

    match ctx.bucket.collections().get_collection_id(scope, collection) {
        Ok((uid, cid)) => {
            let mut res = Packet::response_to(pak, Status::SUCCESS);
            res.extras.extend_from_slice(&uid.to_be_bytes());
            res.extras.extend_from_slice(&cid.to_be_bytes());
            client.reply(start, res);
        }
        Err(ManifestError::ScopeNotFound(_)) => reply_status(client, pak, start, Status::UNKNOWN_SCOPE),
        Err(_) => reply_status(client, pak, start, Status::UNKNOWN_COLLECTION),
    }
}
