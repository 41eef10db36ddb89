//! SASL authentication and bucket selection.

use std::sync::Arc;
use std::time::Instant;

use super::{on_kv, reply_status};
use crate::auth::{Mechanism, Permission, SUPPORTED_MECHANISMS, ScramServer, parse_plain};
use crate::hooks::KvHooks;
use crate::logging::debug;
use crate::memd::{OpCode, Packet, Status};
use crate::services::KvClient;

pub(super) fn register(hooks: &KvHooks) {
    on_kv(hooks, OpCode::SASL_LIST_MECHS, list_mechs);
    on_kv(hooks, OpCode::SASL_AUTH, sasl_auth);
    on_kv(hooks, OpCode::SASL_STEP, sasl_step);
    on_kv(hooks, OpCode::SELECT_BUCKET, select_bucket);
}

fn list_mechs(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let mut res = Packet::response_to(pak, Status::SUCCESS);
    res.value = SUPPORTED_MECHANISMS.as_bytes().to_vec();
    client.reply(start, res);
}

fn sasl_auth(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    // A new AUTH abandons any exchange left half way
    client.set_scram(None);

    let Some(cluster) = client.cluster() else {
        reply_status(client, pak, start, Status::INTERNAL_ERROR);
        return;
    };
    let mechanism = match Mechanism::parse(&pak.key) {
        Ok(mechanism) => mechanism,
        Err(err) => {
            debug!(client = client.id(), error = %err, "rejected sasl mechanism");
            reply_status(client, pak, start, Status::AUTH_ERROR);
            return;
        }
    };

    if mechanism == Mechanism::Plain {
        let authenticated = parse_plain(&pak.value)
            .ok()
            .filter(|(username, password)| cluster.auth().check_password(username, password));
        match authenticated {
            Some((username, _)) => {
                debug!(client = client.id(), user = %username, "plain authentication succeeded");
                client.set_authenticated_user(Some(username));
                reply_status(client, pak, start, Status::SUCCESS);
            }
            None => {
                client.set_authenticated_user(None);
                reply_status(client, pak, start, Status::AUTH_ERROR);
            }
        }
        return;
    }

    match ScramServer::start(mechanism, cluster.auth(), &pak.value) {
        Ok((scram, server_first)) => {
            client.set_scram(Some(scram));
            let mut res = Packet::response_to(pak, Status::AUTH_CONTINUE);
            res.value = server_first;
            client.reply(start, res);
        }
        Err(err) => {
            debug!(client = client.id(), error = %err, "scram start failed");
            reply_status(client, pak, start, Status::AUTH_ERROR);
        }
    }
}

fn sasl_step(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let Some(scram) = client.take_scram() else {
        // PLAIN has no second step, and SCRAM needs a started exchange
        reply_status(client, pak, start, Status::AUTH_ERROR);
        return;
    };
    match scram.finish(&pak.value) {
        Ok((username, server_final)) => {
            debug!(client = client.id(), user = %username, "scram authentication succeeded");
            client.set_authenticated_user(Some(username));
            let mut res = Packet::response_to(pak, Status::SUCCESS);
            res.value = server_final;
            client.reply(start, res);
        }
        Err(err) => {
            debug!(client = client.id(), error = %err, "scram authentication failed");
            client.set_authenticated_user(None);
            reply_status(client, pak, start, Status::AUTH_ERROR);
        }
    }
}

fn select_bucket(client: &Arc<KvClient>, pak: &Packet, start: Instant) {
    let name = String::from_utf8_lossy(&pak.key).into_owned();
    let Some(cluster) = client.cluster() else {
        reply_status(client, pak, start, Status::INTERNAL_ERROR);
        return;
    };
    let Some(username) = client.authenticated_user() else {
        reply_status(client, pak, start, Status::AUTH_ERROR);
        return;
    };
    if !cluster.auth().has_permission(&username, Permission::Select, &name, "", "") {
        reply_status(client, pak, start, Status::ACCESS_ERROR);
        return;
    }
    if cluster.get_bucket(&name).is_none() {
        client.set_selected_bucket(None);
        reply_status(client, pak, start, Status::KEY_NOT_FOUND);
        return;
    }
    debug!(client = client.id(), bucket = %name, "bucket selected");
    client.set_selected_bucket(Some(name));
    reply_status(client, pak, start, Status::SUCCESS);
}
