//! DCP producer: stream requests with rollback negotiation and snapshot
//! framing, plus the connection setup commands around them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use super::{bucket_context, on_kv, reply_status};
use crate::auth::Permission;
use crate::hooks::KvHooks;
use crate::logging::{debug, trace};
use crate::memd::buffer::{read_u32, read_u64};
use crate::memd::{OpCode, Packet, Status};
use crate::services::KvClient;
use crate::services::kv::DcpContext;
use crate::store::{DATATYPE_XATTR, Document, FailoverEntry, Vbucket};

/// Snapshot marker type flag for in-memory snapshots.
const SNAPSHOT_MEMORY: u32 = 0x01;

pub(super) fn register(hooks: &KvHooks) {
    on_kv(hooks, OpCode::DCP_OPEN_CONNECTION, open_connection);
    on_kv(hooks, OpCode::DCP_CONTROL, control);
    on_kv(hooks, OpCode::DCP_STREAM_REQ, stream_request);
    on_kv(hooks, OpCode::DCP_CLOSE_STREAM, close_stream);
    on_kv(hooks, OpCode::DCP_GET_FAILOVER_LOG, get_failover_log);
}

fn open_connection(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    if bucket_context(client, pak, start, Permission::DcpRead).is_none() {
        return;
    }
    let (8, Ok(flags)) = (pak.extras.len(), read_u32(&pak.extras, 4)) else {
        reply_status(client, pak, start, Status::INVALID_ARGS);
        return;
    };
    let name = String::from_utf8_lossy(&pak.key).into_owned();
    debug!(client = client.id(), name = %name, flags, "dcp connection opened");
    client.with_context(|ctx| {
        ctx.dcp = Some(DcpContext {
            name,
            flags,
            controls: Default::default(),
        });
    });
    reply_status(client, pak, start, Status::SUCCESS);
}

fn control(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let key = String::from_utf8_lossy(&pak.key).into_owned();
    let value = String::from_utf8_lossy(&pak.value).into_owned();
    let opened = client.with_context(|ctx| match ctx.dcp.as_mut() {
        Some(dcp) => {
            dcp.controls.insert(key, value);
            true
        }
        None => false,
    });
    let status = if opened { Status::SUCCESS } else { Status::INVALID_ARGS };
    reply_status(client, pak, start, status);
}

fn close_stream(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    // Streams end as soon as their backlog is sent, so there is never one to close
    reply_status(client, pak, start, Status::KEY_NOT_FOUND);
}

fn encode_failover_log(log: &[FailoverEntry]) -> Vec<u8> {
    log.iter()
        .flat_map(|entry| entry.vb_uuid.to_be_bytes().into_iter().chain(entry.seq_no.to_be_bytes()))
        .collect()
}

fn get_failover_log(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let Some(ctx) = bucket_context(client, pak, start, Permission::DcpRead) else {
        return;
    };
    match ctx.bucket.store().vbucket(pak.vbucket) {
        Ok(vb) => {
            let mut res = Packet::response_to(pak, Status::SUCCESS);
            res.value = encode_failover_log(&vb.failover_log());
            client.reply(start, res);
        }
        Err(_) => reply_status(client, pak, start, Status::NOT_MY_VBUCKET),
    }
}

/// Stream request extras.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StreamRequest {
    flags: u32,
    start_seq_no: u64,
    end_seq_no: u64,
    vb_uuid: u64,
    snap_start_seq_no: u64,
    snap_end_seq_no: u64,
}

impl StreamRequest {
    fn parse(extras: &[u8]) -> Option<Self> {
        if extras.len() != 48 {
            return None;
        }
        Some(Self {
            flags: read_u32(extras, 0).ok()?,
            start_seq_no: read_u64(extras, 8).ok()?,
            end_seq_no: read_u64(extras, 16).ok()?,
            vb_uuid: read_u64(extras, 24).ok()?,
            snap_start_seq_no: read_u64(extras, 32).ok()?,
            snap_end_seq_no: read_u64(extras, 40).ok()?,
        })
    }
}

/// Seqno the consumer must roll back to before streaming, if any. A
/// consumer starting from zero has nothing to roll back; any other consumer
/// must be on the vbucket's current uuid.
fn rollback_point(vb: &Vbucket, req: &StreamRequest) -> Option<u64> {
    if req.start_seq_no == 0 || req.vb_uuid == vb.vb_uuid() {
        return None;
    }
    Some(0)
}

/// Latest version of each key in `(start, end]`, in seqno order.
fn dedup_latest(docs: Vec<Document>) -> Vec<Document> {
    let mut latest: HashMap<(u32, Vec<u8>), Document> = HashMap::new();
    for doc in docs {
        let id = (doc.collection_id, doc.key.clone());
        match latest.get(&id) {
            Some(seen) if seen.seq_no >= doc.seq_no => {}
            _ => {
                latest.insert(id, doc);
            }
        }
    }
    let mut docs: Vec<Document> = latest.into_values().collect();
    docs.sort_by_key(|doc| doc.seq_no);
    docs
}

/// Value of a DCP item: the xattr section, if any, followed by the body.
fn encode_value(doc: &Document, with_body: bool) -> (u8, Vec<u8>) {
    if doc.xattrs.is_empty() {
        let body = if with_body { doc.value.clone() } else { Vec::new() };
        return (doc.datatype & !DATATYPE_XATTR, body);
    }

    let mut section = Vec::new();
    for (key, value) in &doc.xattrs {
        let pair_len = key.len() + value.len() + 2;
        section.extend_from_slice(&u32::try_from(pair_len).unwrap_or(u32::MAX).to_be_bytes());
        section.extend_from_slice(key.as_bytes());
        section.push(0);
        section.extend_from_slice(value);
        section.push(0);
    }
    let mut out = u32::try_from(section.len()).unwrap_or(u32::MAX).to_be_bytes().to_vec();
    out.extend(section);
    if with_body {
        out.extend_from_slice(&doc.value);
    }
    (doc.datatype | DATATYPE_XATTR, out)
}

fn snapshot_marker(pak: &Packet, start: u64, end: u64) -> Packet {
    let mut marker = Packet::request(OpCode::DCP_SNAPSHOT_MARKER);
    marker.opaque = pak.opaque;
    marker.vbucket = pak.vbucket;
    marker.extras.extend_from_slice(&start.to_be_bytes());
    marker.extras.extend_from_slice(&end.to_be_bytes());
    marker.extras.extend_from_slice(&SNAPSHOT_MEMORY.to_be_bytes());
    marker
}

fn data_packet(pak: &Packet, doc: &Document) -> Packet {
    let command = if doc.is_deleted { OpCode::DCP_DELETION } else { OpCode::DCP_MUTATION };
    let mut item = Packet::request(command);
    item.opaque = pak.opaque;
    item.vbucket = doc.vb_id;
    item.cas = doc.cas;
    item.collection_id = doc.collection_id;
    item.key = doc.key.clone();

    item.extras.extend_from_slice(&doc.seq_no.to_be_bytes());
    item.extras.extend_from_slice(&doc.rev_id.to_be_bytes());
    if doc.is_deleted {
        // nmeta
        item.extras.extend_from_slice(&0u16.to_be_bytes());
    } else {
        item.extras.extend_from_slice(&doc.flags.to_be_bytes());
        item.extras.extend_from_slice(&doc.expiry_secs().to_be_bytes());
        // lock time, nmeta, nru
        item.extras.extend_from_slice(&0u32.to_be_bytes());
        item.extras.extend_from_slice(&0u16.to_be_bytes());
        item.extras.push(0);
    }

    let (datatype, value) = encode_value(doc, !doc.is_deleted);
    item.datatype = datatype;
    item.value = value;
    item
}

fn stream_end(pak: &Packet) -> Packet {
    let mut end = Packet::request(OpCode::DCP_STREAM_END);
    end.opaque = pak.opaque;
    end.vbucket = pak.vbucket;
    // Flags 0: the stream finished normally
    end.extras = 0u32.to_be_bytes().to_vec();
    end
}

fn stream_request(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let Some(ctx) = bucket_context(client, pak, start, Permission::DcpRead) else {
        return;
    };
    let Some(req) = StreamRequest::parse(&pak.extras) else {
        reply_status(client, pak, start, Status::INVALID_ARGS);
        return;
    };
    let Ok(vb) = ctx.bucket.store().vbucket(pak.vbucket) else {
        reply_status(client, pak, start, Status::NOT_MY_VBUCKET);
        return;
    };

    if let Some(point) = rollback_point(vb, &req) {
        debug!(
            client = client.id(),
            vbucket = pak.vbucket,
            vb_uuid = req.vb_uuid,
            start_seq_no = req.start_seq_no,
            rollback_to = point,
            "dcp stream needs rollback"
        );
        let mut res = Packet::response_to(pak, Status::ROLLBACK);
        res.value = point.to_be_bytes().to_vec();
        client.reply(start, res);
        return;
    }

    let mut res = Packet::response_to(pak, Status::SUCCESS);
    res.value = encode_failover_log(&[FailoverEntry {
        vb_uuid: vb.vb_uuid(),
        seq_no: 0,
    }]);
    client.reply(start, res);

    // A partially received snapshot is sent again from its beginning
    let mut from = req.start_seq_no;
    if from != req.snap_end_seq_no {
        from = req.snap_start_seq_no;
    }
    let to = req.end_seq_no.min(vb.max_seq_no());
    trace!(client = client.id(), vbucket = pak.vbucket, flags = req.flags, from, to, "dcp stream backfill");

    if from < to {
        if let Ok((docs, _)) = vb.get_all_within(from, to) {
            send(client, snapshot_marker(pak, from, to));
            for doc in dedup_latest(docs) {
                send(client, data_packet(pak, &doc));
            }
        }
    }
    send(client, stream_end(pak));
}

fn send(client: &Arc<KvClient>, pak: Packet) {
    if let Err(err) = client.write_packet(pak) {
        debug!(client = client.id(), error = %err, "failed to write dcp packet");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(key: &str, seq_no: u64) -> Document {
        let mut doc = Document::new(0, 0, key.as_bytes().to_vec());
        doc.seq_no = seq_no;
        doc.value = format!("{{\"seq\":{}}}", seq_no).into_bytes();
        doc
    }

    #[test]
    fn dedup_keeps_latest_version_per_key() {
        let docs = vec![doc("a", 1), doc("b", 2), doc("a", 3), doc("c", 4)];
        let seqs: Vec<u64> = dedup_latest(docs).iter().map(|d| d.seq_no).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    fn stream_from(start_seq_no: u64, vb_uuid: u64) -> StreamRequest {
        StreamRequest {
            flags: 0,
            start_seq_no,
            end_seq_no: u64::MAX,
            vb_uuid,
            snap_start_seq_no: start_seq_no,
            snap_end_seq_no: start_seq_no,
        }
    }

    #[test]
    fn superseded_uuids_must_roll_back() {
        let vb = Vbucket::new(0, crate::clock::Chrono::new(), Default::default(), Default::default());
        vb.insert(doc("a", 0)).unwrap();
        let before = vb.snapshot();
        vb.insert(doc("b", 0)).unwrap();
        vb.rollback(before).unwrap();

        // The old uuid is still in the failover history, but it is not current
        assert!(vb.is_in_history(before.vb_uuid, 1));
        assert_eq!(rollback_point(&vb, &stream_from(1, before.vb_uuid)), Some(0));
        assert_eq!(rollback_point(&vb, &stream_from(1, vb.vb_uuid())), None);
        assert_eq!(rollback_point(&vb, &stream_from(0, 0xbad)), None);
    }

    #[test]
    fn stream_request_extras_parse() {
        let mut extras = Vec::new();
        extras.extend_from_slice(&0u32.to_be_bytes());
        extras.extend_from_slice(&0u32.to_be_bytes());
        for value in [10u64, 20, 0xabcd, 10, 10] {
            extras.extend_from_slice(&value.to_be_bytes());
        }
        let req = StreamRequest::parse(&extras).unwrap();
        assert_eq!(req.start_seq_no, 10);
        assert_eq!(req.end_seq_no, 20);
        assert_eq!(req.vb_uuid, 0xabcd);
        assert!(StreamRequest::parse(extras.get(..40).unwrap()).is_none());
    }

    #[test]
    fn mutation_and_deletion_extras_sizes() {
        let req = Packet::request(OpCode::DCP_STREAM_REQ);
        let live = doc("k", 5);
        assert_eq!(data_packet(&req, &live).extras.len(), 31);

        let mut gone = doc("k", 6);
        gone.is_deleted = true;
        let pak = data_packet(&req, &gone);
        assert_eq!(pak.command, OpCode::DCP_DELETION);
        assert_eq!(pak.extras.len(), 18);
        assert!(pak.value.is_empty());
    }

    #[test]
    fn xattrs_prefix_the_value() {
        let mut d = doc("k", 1);
        d.value = b"{}".to_vec();
        d.xattrs.insert("meta".to_string(), b"1".to_vec());
        let (datatype, value) = encode_value(&d, true);
        assert_ne!(datatype & DATATYPE_XATTR, 0);
        // total len, pair len, "meta\01\0", body
        assert_eq!(value.len(), 4 + 4 + 7 + 2);
        assert_eq!(value.get(..4).unwrap(), &11u32.to_be_bytes());
        assert!(value.ends_with(b"{}"));
    }
}
