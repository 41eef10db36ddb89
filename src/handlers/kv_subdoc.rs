//! Multi-path sub-document commands.
//!
//! Lookup specs are `opcode:u8 flags:u8 pathlen:u16 path`, mutation specs
//! add a `valuelen:u32` after the path length and the value after the path.

use std::sync::Arc;
use std::time::Instant;

use super::{bucket_context, doc_key, mutation_extras, on_kv, reply_proc_error, reply_status};
use crate::auth::Permission;
use crate::hooks::KvHooks;
use crate::kvproc::{LookupOptions, MutateOptions, ProcError, SubDocOp};
use crate::kvproc::subdoc::MAX_OPS;
use crate::logging::debug;
use crate::memd::buffer::{read_slice, read_u8, read_u16, read_u32};
use crate::memd::{
    OpCode, Packet, PacketError, SUBDOC_DOC_FLAG_ACCESS_DELETED, SUBDOC_DOC_FLAG_ADD, SUBDOC_DOC_FLAG_CREATE_AS_DELETED,
    SUBDOC_DOC_FLAG_MKDOC, Status,
};
use crate::services::KvClient;

pub(super) fn register(hooks: &KvHooks) {
    on_kv(hooks, OpCode::SUBDOC_MULTI_LOOKUP, multi_lookup);
    on_kv(hooks, OpCode::SUBDOC_MULTI_MUTATION, multi_mutation);
}

/// Decode the op specs of a multi-path body.
fn parse_ops(body: &[u8], mutation: bool) -> Result<Vec<SubDocOp>, PacketError> {
    let header_len = if mutation { 8 } else { 4 };
    let mut ops = Vec::new();
    let mut offset = 0;
    while offset < body.len() {
        let opcode = OpCode(read_u8(body, offset)?);
        let flags = read_u8(body, offset + 1)?;
        let path_len = usize::from(read_u16(body, offset + 2)?);
        let value_len = if mutation {
            let len = read_u32(body, offset + 4)?;
            usize::try_from(len).map_err(|_| PacketError::FieldTooLong { field: "value", len: usize::MAX })?
        } else {
            0
        };
        let path = read_slice(body, offset + header_len, path_len)?;
        let value = read_slice(body, offset + header_len + path_len, value_len)?;
        ops.push(SubDocOp::new(opcode, String::from_utf8_lossy(path), value.to_vec()).with_flags(flags));
        offset += header_len + path_len + value_len;
    }
    Ok(ops)
}

fn multi_lookup(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let Some(ctx) = bucket_context(client, pak, start, Permission::DataRead) else {
        return;
    };
    let doc_flags = match pak.extras.as_slice() {
        [] => 0,
        [flags] => *flags,
        _ => {
            reply_status(client, pak, start, Status::INVALID_ARGS);
            return;
        }
    };
    let ops = match parse_ops(&pak.value, false) {
        Ok(ops) if !ops.is_empty() && ops.len() <= MAX_OPS => ops,
        Ok(_) => {
            reply_status(client, pak, start, Status::SUBDOC_BAD_COMBO);
            return;
        }
        Err(err) => {
            debug!(client = client.id(), error = %err, "malformed multi lookup");
            reply_status(client, pak, start, Status::INVALID_ARGS);
            return;
        }
    };
    if ops.iter().any(|op| !op.is_lookup()) {
        reply_status(client, pak, start, Status::NOT_SUPPORTED);
        return;
    }

    let opts = LookupOptions {
        doc: doc_key(pak),
        ops,
        access_deleted: doc_flags & SUBDOC_DOC_FLAG_ACCESS_DELETED != 0,
    };
    match ctx.engine.multi_lookup(&opts) {
        Ok(lookup) => {
            let mut failed = false;
            let mut value = Vec::new();
            for result in &lookup.results {
                let (status, body): (Status, &[u8]) = match result {
                    Ok(body) => (Status::SUCCESS, body),
                    Err(err) => {
                        failed = true;
                        (err.status(), &[])
                    }
                };
                value.extend_from_slice(&status.0.to_be_bytes());
                value.extend_from_slice(&u32::try_from(body.len()).unwrap_or(u32::MAX).to_be_bytes());
                value.extend_from_slice(body);
            }
            let status = match (failed, lookup.deleted) {
                (false, false) => Status::SUCCESS,
                (false, true) => Status::SUBDOC_SUCCESS_DELETED,
                (true, false) => Status::SUBDOC_BAD_MULTI,
                (true, true) => Status::SUBDOC_MULTI_PATH_FAILURE_DELETED,
            };
            let mut res = Packet::response_to(pak, status);
            res.cas = lookup.cas;
            res.value = value;
            client.reply(start, res);
        }
        Err(err) => reply_proc_error(client, pak, start, &err),
    }
}

fn multi_mutation(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let Some(ctx) = bucket_context(client, pak, start, Permission::DataWrite) else {
        return;
    };
    let (expiry, doc_flags) = match pak.extras.len() {
        0 => (0, 0),
        1 => (0, read_u8(&pak.extras, 0).unwrap_or_default()),
        4 => (read_u32(&pak.extras, 0).unwrap_or_default(), 0),
        5 => (
            read_u32(&pak.extras, 0).unwrap_or_default(),
            read_u8(&pak.extras, 4).unwrap_or_default(),
        ),
        _ => {
            reply_status(client, pak, start, Status::INVALID_ARGS);
            return;
        }
    };
    let ops = match parse_ops(&pak.value, true) {
        Ok(ops) if !ops.is_empty() && ops.len() <= MAX_OPS => ops,
        Ok(_) => {
            reply_status(client, pak, start, Status::SUBDOC_BAD_COMBO);
            return;
        }
        Err(err) => {
            debug!(client = client.id(), error = %err, "malformed multi mutation");
            reply_status(client, pak, start, Status::INVALID_ARGS);
            return;
        }
    };
    if ops.iter().any(|op| !op.is_mutation()) {
        reply_status(client, pak, start, Status::NOT_SUPPORTED);
        return;
    }
    let mkdoc = doc_flags & SUBDOC_DOC_FLAG_MKDOC != 0;
    // Creating a document leaves nothing to replace or insert into
    if mkdoc
        && ops
            .iter()
            .any(|op| matches!(op.opcode, OpCode::SUBDOC_REPLACE | OpCode::SUBDOC_ARRAY_INSERT))
    {
        reply_status(client, pak, start, Status::INVALID_ARGS);
        return;
    }

    let opts = MutateOptions {
        doc: doc_key(pak),
        cas: pak.cas,
        expiry,
        ops,
        access_deleted: doc_flags & SUBDOC_DOC_FLAG_ACCESS_DELETED != 0,
        create_as_deleted: doc_flags & SUBDOC_DOC_FLAG_CREATE_AS_DELETED != 0,
        mkdoc,
        add: doc_flags & SUBDOC_DOC_FLAG_ADD != 0,
    };
    match ctx.engine.multi_mutate(&opts) {
        Ok(mutated) => {
            let mut res = Packet::response_to(pak, Status::SUCCESS);
            res.cas = mutated.mutation.cas;
            res.extras = mutation_extras(client, mutated.mutation.vb_uuid, mutated.mutation.seq_no);
            for (index, body) in &mutated.values {
                res.value.push(*index);
                res.value.extend_from_slice(&Status::SUCCESS.0.to_be_bytes());
                res.value.extend_from_slice(&u32::try_from(body.len()).unwrap_or(u32::MAX).to_be_bytes());
                res.value.extend_from_slice(body);
            }
            client.reply(start, res);
        }
        Err(ProcError::MultiFailure { index, error }) => {
            let mut res = Packet::response_to(pak, Status::SUBDOC_BAD_MULTI);
            res.value.push(index);
            res.value.extend_from_slice(&error.status().0.to_be_bytes());
            client.reply(start, res);
        }
        Err(err) => reply_proc_error(client, pak, start, &err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_spec(opcode: OpCode, flags: u8, path: &str) -> Vec<u8> {
        let mut out = vec![opcode.0, flags];
        out.extend_from_slice(&u16::try_from(path.len()).unwrap().to_be_bytes());
        out.extend_from_slice(path.as_bytes());
        out
    }

    #[test]
    fn parses_lookup_specs() {
        let mut body = lookup_spec(OpCode::SUBDOC_GET, 0, "a.b");
        body.extend(lookup_spec(OpCode::SUBDOC_EXISTS, 0x04, "meta"));
        let ops = parse_ops(&body, false).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops.first().unwrap().path, "a.b");
        assert!(ops.get(1).unwrap().is_xattr());
    }

    #[test]
    fn parses_mutation_specs_with_values() {
        let mut body = vec![OpCode::SUBDOC_DICT_UPSERT.0, 0x01, 0, 1, 0, 0, 0, 2];
        body.extend_from_slice(b"x42");
        let ops = parse_ops(&body, true).unwrap();
        let op = ops.first().unwrap();
        assert_eq!(op.path, "x");
        assert_eq!(op.value, b"42".to_vec());
        assert!(op.mkdir_p());
    }

    #[test]
    fn truncated_specs_are_rejected() {
        let body = vec![OpCode::SUBDOC_GET.0, 0, 0, 9, b'a'];
        assert!(parse_ops(&body, false).is_err());
    }
}
