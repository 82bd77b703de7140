//! deno_core op definitions backing the script-visible `af` object.
//!
//! The `#[op2]` macro generates public items that cannot carry doc comments,
//! so `missing_docs` is relaxed for this module.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;

use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;
use serde::Deserialize;
use tokio::sync::oneshot;

use crate::bridge::{next_call_id, PendingCalls, ScriptRequest};
use crate::context::{AfContext, Field};
use crate::protocol::{LogLevel, SandboxMessage};
use crate::store::{ScriptValue, StoreName};

/// Script source waiting to be compiled by the bootstrap's runner.
pub struct PendingScript(pub String);

/// How a script run ended, as reported by the bootstrap's runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// The routine resolved.
    Success,
    /// The routine failed to compile, threw, or rejected.
    Failure {
        /// Error message.
        message: String,
        /// Stack trace, possibly empty.
        trace: String,
    },
}

/// One-shot channel the runner settles through.
pub struct SettleSignal(pub oneshot::Sender<Settlement>);

#[derive(Deserialize)]
struct SettlementWire {
    ok: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    trace: String,
}

/// Parse the runner's `{ok, message?, trace?}` report.
pub fn parse_settlement(json: &str) -> Settlement {
    match serde_json::from_str::<SettlementWire>(json) {
        Ok(wire) if wire.ok => Settlement::Success,
        Ok(wire) => Settlement::Failure {
            message: wire.message,
            trace: wire.trace,
        },
        Err(e) => Settlement::Failure {
            message: format!("malformed settlement report: {e}"),
            trace: String::new(),
        },
    }
}

fn store_name(name: &str) -> Result<StoreName, JsErrorBox> {
    StoreName::parse(name).ok_or_else(|| JsErrorBox::type_error(format!("unknown store '{name}'")))
}

fn field_name(name: &str) -> Result<Field, JsErrorBox> {
    Field::parse(name).ok_or_else(|| JsErrorBox::type_error(format!("unknown field '{name}'")))
}

/// Forward a console line to the host.
#[op2(fast)]
pub fn op_af_log(state: &mut OpState, #[string] level: &str, #[string] msg: &str) {
    let level = LogLevel::parse(level);
    tracing::debug!(target: "af::sandbox::js", ?level, "{}", msg);
    state
        .borrow::<AfContext>()
        .emitter()
        .send(SandboxMessage::Log {
            level,
            message: msg.to_string(),
        });
}

/// Report a warning raised by the bootstrap itself.
#[op2(fast)]
pub fn op_af_warn(state: &mut OpState, #[string] msg: &str) {
    state.borrow::<AfContext>().emitter().warn(msg);
}

/// Read one store entry. Returns JSON text, or an empty string when absent.
#[op2]
#[string]
pub fn op_af_store_get(
    state: &mut OpState,
    #[string] store: &str,
    #[string] key: &str,
) -> Result<String, JsErrorBox> {
    let name = store_name(store)?;
    let ctx = state.borrow::<AfContext>();
    Ok(ctx
        .store(name)
        .get(key)
        .map(|v| v.to_string())
        .unwrap_or_default())
}

/// Write one store entry from an encoded script value.
#[op2(fast)]
pub fn op_af_store_set(
    state: &mut OpState,
    #[string] store: &str,
    #[string] key: &str,
    #[string] value: &str,
) -> Result<(), JsErrorBox> {
    let name = store_name(store)?;
    let value = ScriptValue::decode(value);
    state
        .borrow_mut::<AfContext>()
        .store_mut(name)
        .set(key, value);
    Ok(())
}

/// Delete one store entry.
#[op2(fast)]
pub fn op_af_store_delete(
    state: &mut OpState,
    #[string] store: &str,
    #[string] key: &str,
) -> Result<bool, JsErrorBox> {
    let name = store_name(store)?;
    Ok(state.borrow_mut::<AfContext>().store_mut(name).remove(key))
}

/// Keys of a store as a JSON array.
#[op2]
#[string]
pub fn op_af_store_keys(state: &mut OpState, #[string] store: &str) -> Result<String, JsErrorBox> {
    let name = store_name(store)?;
    let keys = state.borrow::<AfContext>().store(name).keys();
    serde_json::to_string(&keys).map_err(|e| JsErrorBox::generic(e.to_string()))
}

/// Script view of a whole store as JSON.
#[op2]
#[string]
pub fn op_af_store_snapshot(
    state: &mut OpState,
    #[string] store: &str,
) -> Result<String, JsErrorBox> {
    let name = store_name(store)?;
    Ok(state.borrow::<AfContext>().store(name).view().to_string())
}

/// Replace a whole store from an encoded script object.
#[op2(fast)]
pub fn op_af_store_replace(
    state: &mut OpState,
    #[string] store: &str,
    #[string] value: &str,
) -> Result<(), JsErrorBox> {
    let name = store_name(store)?;
    let value = ScriptValue::decode(value);
    state
        .borrow_mut::<AfContext>()
        .store_mut(name)
        .replace_all(value);
    Ok(())
}

/// Read a non-store field as JSON.
#[op2]
#[string]
pub fn op_af_field_get(state: &mut OpState, #[string] field: &str) -> Result<String, JsErrorBox> {
    let field = field_name(field)?;
    Ok(state.borrow::<AfContext>().read_field(field).to_string())
}

/// Write a non-store field from an encoded script value.
#[op2(fast)]
pub fn op_af_field_set(
    state: &mut OpState,
    #[string] field: &str,
    #[string] value: &str,
) -> Result<(), JsErrorBox> {
    let field = field_name(field)?;
    let value = ScriptValue::decode(value);
    state.borrow_mut::<AfContext>().write_field(field, value);
    Ok(())
}

/// `af.request.replaceUrl(url)`.
#[op2(fast)]
pub fn op_af_replace_url(state: &mut OpState, #[string] value: &str) {
    let value = ScriptValue::decode(value);
    state.borrow_mut::<AfContext>().request.replace_url(value);
}

/// A script tried to delete a protected member.
#[op2(fast)]
pub fn op_af_guard_delete(state: &mut OpState, #[string] member: &str) {
    state.borrow::<AfContext>().guard_delete(member);
}

/// Script view of `af.request` as JSON.
#[op2]
#[string]
pub fn op_af_request_snapshot(state: &mut OpState) -> String {
    state.borrow::<AfContext>().request_view().to_string()
}

/// Script view of `af` as JSON.
#[op2]
#[string]
pub fn op_af_context_view(state: &mut OpState) -> String {
    state.borrow::<AfContext>().view().to_string()
}

/// Hand the pending script source to the runner. Only succeeds once per evaluation.
#[op2]
#[string]
pub fn op_af_take_script(state: &mut OpState) -> Result<String, JsErrorBox> {
    state
        .try_take::<PendingScript>()
        .map(|s| s.0)
        .ok_or_else(|| JsErrorBox::generic("no script is pending evaluation"))
}

/// Report how the script run ended.
#[op2(fast)]
pub fn op_af_settle(state: &mut OpState, #[string] report: &str) {
    let settlement = parse_settlement(report);
    match state.try_take::<SettleSignal>() {
        Some(SettleSignal(tx)) => {
            if tx.send(settlement).is_err() {
                tracing::warn!("settlement receiver dropped");
            }
        }
        None => tracing::debug!("script settled twice, later report ignored"),
    }
}

/// Issue a bridge call and wait for the host's correlated reply.
#[op2(async)]
#[string]
pub async fn op_af_http_request(
    op_state: Rc<RefCell<OpState>>,
    #[string] options: String,
) -> Result<String, JsErrorBox> {
    let request = ScriptRequest::parse(&options).map_err(|e| JsErrorBox::type_error(e))?;
    let id = next_call_id();
    let request = request.into_bridge_request(id);

    tracing::debug!(
        id,
        method = %request.method,
        target = %request.target,
        "bridge call issued"
    );

    let rx = {
        let mut st = op_state.borrow_mut();
        let rx = st.borrow_mut::<PendingCalls>().register(id);
        st.borrow::<AfContext>()
            .emitter()
            .send(SandboxMessage::HttpRequest { request });
        rx
    };

    match rx.await {
        Ok(Ok(result)) => serde_json::to_string(&result.script_view())
            .map_err(|e| JsErrorBox::generic(format!("response serialization failed: {e}"))),
        Ok(Err(message)) => Err(JsErrorBox::generic(message)),
        Err(_) => Err(JsErrorBox::generic("bridge call abandoned")),
    }
}

deno_core::extension!(
    af_ext,
    ops = [
        op_af_log,
        op_af_warn,
        op_af_store_get,
        op_af_store_set,
        op_af_store_delete,
        op_af_store_keys,
        op_af_store_snapshot,
        op_af_store_replace,
        op_af_field_get,
        op_af_field_set,
        op_af_replace_url,
        op_af_guard_delete,
        op_af_request_snapshot,
        op_af_context_view,
        op_af_take_script,
        op_af_settle,
        op_af_http_request
    ],
);
