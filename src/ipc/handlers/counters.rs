use crate::ipc::error::{err, ok, sequence_err};
use crate::ipc::helpers::param_str;
use crate::ipc::types::{AppState, Request};
use crate::sequence;
use serde_json::json;

fn handle_counters_next(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(key) = param_str(req, "key") else {
        return err(&req.id, "bad_params", "missing key", None);
    };

    match sequence::next_in_sequence(conn, &key) {
        Ok(value) => ok(&req.id, json!({ "key": key, "value": value })),
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "counter increment failed");
            sequence_err(&req.id, &e)
        }
    }
}

fn handle_counters_reserve(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(key) = param_str(req, "key") else {
        return err(&req.id, "bad_params", "missing key", None);
    };
    let Some(count) = req.params.get("count").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "count must be integer", None);
    };

    match sequence::next_block(conn, &key, count) {
        Ok(range) => ok(
            &req.id,
            json!({ "key": key, "first": range.start(), "last": range.end() }),
        ),
        Err(e) => {
            tracing::warn!(key = %key, count, error = %e, "counter reservation failed");
            sequence_err(&req.id, &e)
        }
    }
}

fn handle_counters_peek(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(key) = param_str(req, "key") else {
        return err(&req.id, "bad_params", "missing key", None);
    };

    match sequence::current_value(conn, &key) {
        Ok(value) => ok(&req.id, json!({ "key": key, "value": value })),
        Err(e) => sequence_err(&req.id, &e),
    }
}

fn handle_counters_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match sequence::list_counters(conn) {
        Ok(counters) => ok(&req.id, json!({ "counters": counters })),
        Err(e) => sequence_err(&req.id, &e),
    }
}

fn handle_registration_format(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let prefix = match req.params.get("prefix").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing prefix", None),
    };
    let year = match req.params.get("year").and_then(|v| v.as_i64()) {
        Some(y) => match i32::try_from(y) {
            Ok(y) => y,
            Err(_) => return err(&req.id, "invalid_argument", "year out of range", None),
        },
        None => return err(&req.id, "bad_params", "year must be integer", None),
    };
    let Some(seq) = req.params.get("sequence").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "sequence must be integer", None);
    };
    let Some(width) = req.params.get("width").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "width must be integer", None);
    };

    match sequence::format_registration_number(&prefix, year, seq, width) {
        Ok(reg_no) => ok(&req.id, json!({ "regNo": reg_no })),
        Err(e) => sequence_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "counters.next" => Some(handle_counters_next(state, req)),
        "counters.reserve" => Some(handle_counters_reserve(state, req)),
        "counters.peek" => Some(handle_counters_peek(state, req)),
        "counters.list" => Some(handle_counters_list(state, req)),
        "registration.format" => Some(handle_registration_format(state, req)),
        _ => None,
    }
}
