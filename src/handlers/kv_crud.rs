//! Whole-document commands, observe and stats.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use super::{bucket_context, doc_key, mutation_extras, on_kv, reply_proc_error, reply_status};
use crate::auth::Permission;
use crate::clock::Chrono;
use crate::hooks::KvHooks;
use crate::kvproc::{CounterOptions, CounterResult, Engine, GetResult, MutationResult, ProcError, StoreOptions};
use crate::memd::buffer::{read_u32, read_u64};
use crate::memd::{OpCode, Packet, Status};
use crate::services::KvClient;

/// GET_META request extras asking for the datatype in the reply.
const GET_META_V2: u8 = 2;

pub(super) fn register(hooks: &KvHooks) {
    on_kv(hooks, OpCode::GET, get);
    on_kv(hooks, OpCode::GET_REPLICA, get_replica);
    on_kv(hooks, OpCode::GET_RANDOM, get_random);
    on_kv(hooks, OpCode::GET_META, get_meta);
    on_kv(hooks, OpCode::GAT, get_and_touch);
    on_kv(hooks, OpCode::GET_LOCKED, get_locked);
    on_kv(hooks, OpCode::UNLOCK, unlock);
    on_kv(hooks, OpCode::TOUCH, touch);
    on_kv(hooks, OpCode::ADD, add);
    on_kv(hooks, OpCode::SET, set);
    on_kv(hooks, OpCode::REPLACE, replace);
    on_kv(hooks, OpCode::APPEND, append);
    on_kv(hooks, OpCode::PREPEND, prepend);
    on_kv(hooks, OpCode::DELETE, delete);
    on_kv(hooks, OpCode::INCREMENT, increment);
    on_kv(hooks, OpCode::DECREMENT, decrement);
    on_kv(hooks, OpCode::OBSERVE_SEQNO, observe_seq_no);
    on_kv(hooks, OpCode::STAT, stat);
}

fn reply_get(client: &Arc<KvClient>, pak: &Packet, start: Instant, result: Result<GetResult, ProcError>) {
    match result {
        Ok(doc) => {
            let mut res = Packet::response_to(pak, Status::SUCCESS);
            res.cas = doc.cas;
            res.datatype = doc.datatype;
            res.extras = doc.flags.to_be_bytes().to_vec();
            res.value = doc.value;
            if pak.command == OpCode::GET_RANDOM {
                res.key = doc.key;
            }
            client.reply(start, res);
        }
        Err(err) => reply_proc_error(client, pak, start, &err),
    }
}

fn reply_mutation(client: &Arc<KvClient>, pak: &Packet, start: Instant, result: Result<MutationResult, ProcError>) {
    match result {
        Ok(mutation) => {
            let mut res = Packet::response_to(pak, Status::SUCCESS);
            res.cas = mutation.cas;
            res.extras = mutation_extras(client, mutation.vb_uuid, mutation.seq_no);
            client.reply(start, res);
        }
        Err(err) => reply_proc_error(client, pak, start, &err),
    }
}

fn get(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let Some(ctx) = bucket_context(client, pak, start, Permission::DataRead) else {
        return;
    };
    if !pak.extras.is_empty() {
        reply_status(client, pak, start, Status::INVALID_ARGS);
        return;
    }
    reply_get(client, pak, start, ctx.engine.get(&doc_key(pak)));
}

fn get_replica(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let Some(ctx) = bucket_context(client, pak, start, Permission::DataRead) else {
        return;
    };
    if !pak.extras.is_empty() {
        reply_status(client, pak, start, Status::INVALID_ARGS);
        return;
    }
    reply_get(client, pak, start, ctx.engine.get_replica(&doc_key(pak)));
}

fn get_random(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let Some(ctx) = bucket_context(client, pak, start, Permission::DataRead) else {
        return;
    };
    let collection_id = match pak.extras.len() {
        0 => pak.collection_id,
        4 => read_u32(&pak.extras, 0).unwrap_or_default(),
        _ => {
            reply_status(client, pak, start, Status::INVALID_ARGS);
            return;
        }
    };
    reply_get(client, pak, start, ctx.engine.get_random(collection_id));
}

fn get_meta(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let Some(ctx) = bucket_context(client, pak, start, Permission::DataRead) else {
        return;
    };
    let with_datatype = match pak.extras.as_slice() {
        [] => false,
        [GET_META_V2] => true,
        _ => {
            reply_status(client, pak, start, Status::INVALID_ARGS);
            return;
        }
    };
    match ctx.engine.get_meta(&doc_key(pak)) {
        Ok(meta) => {
            let mut res = Packet::response_to(pak, Status::SUCCESS);
            res.cas = meta.cas;
            res.extras.extend_from_slice(&u32::from(meta.deleted).to_be_bytes());
            res.extras.extend_from_slice(&meta.flags.to_be_bytes());
            res.extras.extend_from_slice(&meta.expiry.to_be_bytes());
            res.extras.extend_from_slice(&meta.rev_id.to_be_bytes());
            if with_datatype {
                res.extras.push(meta.datatype);
            }
            client.reply(start, res);
        }
        Err(err) => reply_proc_error(client, pak, start, &err),
    }
}

fn get_and_touch(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let Some(ctx) = bucket_context(client, pak, start, Permission::DataWrite) else {
        return;
    };
    let (4, Ok(expiry)) = (pak.extras.len(), read_u32(&pak.extras, 0)) else {
        reply_status(client, pak, start, Status::INVALID_ARGS);
        return;
    };
    reply_get(client, pak, start, ctx.engine.get_and_touch(&doc_key(pak), expiry));
}

fn get_locked(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let Some(ctx) = bucket_context(client, pak, start, Permission::DataRead) else {
        return;
    };
    let (4, Ok(lock_time)) = (pak.extras.len(), read_u32(&pak.extras, 0)) else {
        reply_status(client, pak, start, Status::INVALID_ARGS);
        return;
    };
    reply_get(client, pak, start, ctx.engine.get_locked(&doc_key(pak), lock_time));
}

fn unlock(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let Some(ctx) = bucket_context(client, pak, start, Permission::DataWrite) else {
        return;
    };
    if !pak.extras.is_empty() {
        reply_status(client, pak, start, Status::INVALID_ARGS);
        return;
    }
    reply_mutation(client, pak, start, ctx.engine.unlock(&doc_key(pak), pak.cas));
}

fn touch(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let Some(ctx) = bucket_context(client, pak, start, Permission::DataWrite) else {
        return;
    };
    let (4, Ok(expiry)) = (pak.extras.len(), read_u32(&pak.extras, 0)) else {
        reply_status(client, pak, start, Status::INVALID_ARGS);
        return;
    };
    reply_mutation(client, pak, start, ctx.engine.touch(&doc_key(pak), expiry));
}

type StoreFn = fn(&Engine, &StoreOptions) -> Result<MutationResult, ProcError>;

/// Shared body of the store commands. Full stores carry flags and expiry
/// extras, APPEND and PREPEND carry none.
fn store_with(client: &Arc<KvClient>, pak: &Packet, start: Instant, full: bool, op: StoreFn) {
    let Some(ctx) = bucket_context(client, pak, start, Permission::DataWrite) else {
        return;
    };
    let (flags, expiry) = if full {
        match (pak.extras.len(), read_u32(&pak.extras, 0), read_u32(&pak.extras, 4)) {
            (8, Ok(flags), Ok(expiry)) => (flags, expiry),
            _ => {
                reply_status(client, pak, start, Status::INVALID_ARGS);
                return;
            }
        }
    } else if pak.extras.is_empty() {
        (0, 0)
    } else {
        reply_status(client, pak, start, Status::INVALID_ARGS);
        return;
    };

    let opts = StoreOptions {
        doc: doc_key(pak),
        cas: pak.cas,
        datatype: pak.datatype,
        flags,
        expiry,
        value: pak.value.clone(),
    };
    reply_mutation(client, pak, start, op(&ctx.engine, &opts));
}

fn add(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    if pak.cas != 0 {
        reply_status(client, pak, start, Status::INVALID_ARGS);
        return;
    }
    store_with(client, pak, start, true, Engine::add);
}

fn set(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    store_with(client, pak, start, true, Engine::set);
}

fn replace(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    store_with(client, pak, start, true, Engine::replace);
}

fn append(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    store_with(client, pak, start, false, Engine::append);
}

fn prepend(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    store_with(client, pak, start, false, Engine::prepend);
}

fn delete(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let Some(ctx) = bucket_context(client, pak, start, Permission::DataWrite) else {
        return;
    };
    if !pak.extras.is_empty() {
        reply_status(client, pak, start, Status::INVALID_ARGS);
        return;
    }
    reply_mutation(client, pak, start, ctx.engine.delete(&doc_key(pak), pak.cas));
}

type CounterFn = fn(&Engine, &CounterOptions) -> Result<CounterResult, ProcError>;

fn counter_with(client: &Arc<KvClient>, pak: &Packet, start: Instant, op: CounterFn) {
    let Some(ctx) = bucket_context(client, pak, start, Permission::DataWrite) else {
        return;
    };
    let (20, Ok(delta), Ok(initial), Ok(expiry)) = (
        pak.extras.len(),
        read_u64(&pak.extras, 0),
        read_u64(&pak.extras, 8),
        read_u32(&pak.extras, 16),
    ) else {
        reply_status(client, pak, start, Status::INVALID_ARGS);
        return;
    };

    let opts = CounterOptions {
        doc: doc_key(pak),
        cas: pak.cas,
        delta,
        initial,
        expiry,
    };
    match op(&ctx.engine, &opts) {
        Ok(counter) => {
            let mut res = Packet::response_to(pak, Status::SUCCESS);
            res.cas = counter.mutation.cas;
            res.extras = mutation_extras(client, counter.mutation.vb_uuid, counter.mutation.seq_no);
            res.value = counter.value.to_be_bytes().to_vec();
            client.reply(start, res);
        }
        Err(err) => reply_proc_error(client, pak, start, &err),
    }
}

fn increment(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    counter_with(client, pak, start, Engine::increment);
}

fn decrement(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    counter_with(client, pak, start, Engine::decrement);
}

fn observe_seq_no(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let Some(ctx) = bucket_context(client, pak, start, Permission::DataRead) else {
        return;
    };
    if pak.value.len() != 8 {
        reply_status(client, pak, start, Status::INVALID_ARGS);
        return;
    }
    match ctx.engine.observe_seq_no(pak.vbucket) {
        Ok(state) => {
            // Format 0: no failover since the client's vbuuid
            let mut res = Packet::response_to(pak, Status::SUCCESS);
            res.value.push(0);
            res.value.extend_from_slice(&pak.vbucket.to_be_bytes());
            res.value.extend_from_slice(&state.vb_uuid.to_be_bytes());
            res.value.extend_from_slice(&state.persist_seq_no.to_be_bytes());
            res.value.extend_from_slice(&state.current_seq_no.to_be_bytes());
            client.reply(start, res);
        }
        Err(err) => reply_proc_error(client, pak, start, &err),
    }
}

/// General stats. `time` and `uptime` follow the bucket's logical clock, so
/// time travel shows up in them.
fn default_stats(chrono: &Chrono, started: SystemTime) -> Vec<(String, String)> {
    let now = chrono.now();
    let time = now.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default();
    let uptime = now.duration_since(started).map(|d| d.as_secs()).unwrap_or_default();
    [
        ("pid", std::process::id().to_string()),
        ("time", time.to_string()),
        ("version", env!("CARGO_PKG_VERSION").to_string()),
        ("uptime", uptime.to_string()),
        ("accepting_conns", "1".to_string()),
        ("auth_cmds", "0".to_string()),
        ("auth_errors", "0".to_string()),
        ("bucket_active_conns", "1".to_string()),
        ("curr_connections", "1".to_string()),
        ("cas_badval", "0".to_string()),
        ("cas_hits", "0".to_string()),
        ("cas_misses", "0".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn stat(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let Some(ctx) = bucket_context(client, pak, start, Permission::StatsRead) else {
        return;
    };
    let group = String::from_utf8_lossy(&pak.key).into_owned();
    let stats: Vec<(String, String)> = match group.as_str() {
        "" => default_stats(ctx.bucket.chrono(), ctx.bucket.created()),
        "uuid" => vec![("uuid".to_string(), ctx.bucket.id().to_string())],
        "config" => vec![("ep_dcp_conn_buffer_size".to_string(), "10485760".to_string())],
        "tap" => vec![("ep_tap_count".to_string(), "0".to_string())],
        "vbucket-seqno" => ctx
            .bucket
            .store()
            .vbuckets()
            .flat_map(|vb| {
                let high = vb.max_seq_no().to_string();
                [
                    (format!("vb_{}:high_seqno", vb.id()), high.clone()),
                    (format!("vb_{}:abs_high_seqno", vb.id()), high),
                    (format!("vb_{}:uuid", vb.id()), vb.vb_uuid().to_string()),
                ]
            })
            .collect(),
        // Per-key stats are accepted but report nothing
        key if key.starts_with("key ") => Vec::new(),
        _ => {
            reply_status(client, pak, start, Status::KEY_NOT_FOUND);
            return;
        }
    };

    for (key, value) in stats {
        let mut res = Packet::response_to(pak, Status::SUCCESS);
        res.key = key.into_bytes();
        res.value = value.into_bytes();
        client.reply(start, res);
    }
    // An empty packet ends the stream
    reply_status(client, pak, start, Status::SUCCESS);
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    fn stat_value(stats: &[(String, String)], key: &str) -> u64 {
        stats
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.parse().ok())
            .unwrap()
    }

    #[test]
    fn default_stats_report_pid_and_version() {
        let chrono = Chrono::new();
        let stats = default_stats(&chrono, chrono.now());
        let pid = stats.iter().find(|(k, _)| k == "pid").map(|(_, v)| v.clone());
        assert_eq!(pid, Some(std::process::id().to_string()));
        assert!(stats.iter().any(|(k, _)| k == "version"));
    }

    #[test]
    fn time_and_uptime_follow_time_travel() {
        let chrono = Chrono::new();
        let started = chrono.now();
        let before = default_stats(&chrono, started);
        assert!(stat_value(&before, "uptime") < 60);

        chrono.time_travel(Duration::from_secs(3600));
        let after = default_stats(&chrono, started);
        assert!(stat_value(&after, "uptime") >= 3600);
        assert!(stat_value(&after, "time") >= stat_value(&before, "time") + 3600);
    }
}
