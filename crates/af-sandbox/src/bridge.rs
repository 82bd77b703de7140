//! HTTP bridge: script-initiated calls delegated to the host.
//!
//! A call registers a waiter under a fresh correlation id, emits an
//! `http-request` message and suspends until the host relays a matching
//! `http-response` or `http-error`. If the host never answers, the waiter stays
//! registered and the script's call never settles.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::protocol::{BridgeRequest, HttpResult};

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// A process-unique correlation id.
pub fn next_call_id() -> u64 {
    NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed)
}

/// What a bridge waiter eventually receives.
pub type BridgeOutcome = Result<HttpResult, String>;

/// Open bridge calls of one sandbox instance, keyed by correlation id.
#[derive(Default)]
pub struct PendingCalls {
    waiters: HashMap<u64, oneshot::Sender<BridgeOutcome>>,
}

impl PendingCalls {
    /// Register a waiter for `id`.
    pub fn register(&mut self, id: u64) -> oneshot::Receiver<BridgeOutcome> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        rx
    }

    /// Settle the waiter for `id`. Returns false if no such call is open.
    pub fn settle(&mut self, id: u64, outcome: BridgeOutcome) -> bool {
        match self.waiters.remove(&id) {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    tracing::debug!(id, "bridge waiter dropped before settlement");
                }
                true
            }
            None => {
                tracing::debug!(id, "no open bridge call for correlation id");
                false
            }
        }
    }

    /// Number of open calls.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Whether no calls are open.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Drop every waiter; their scripts observe an abandoned call.
    pub fn abandon_all(&mut self) {
        self.waiters.clear();
    }
}

/// Options accepted by `http.request(...)`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptRequest {
    /// Target URL.
    pub url: String,
    /// HTTP method; defaults to GET.
    #[serde(default)]
    pub method: Option<String>,
    /// Headers; non-string values are stringified.
    #[serde(default)]
    pub headers: BTreeMap<String, Value>,
    /// Query parameters; non-string values are stringified.
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    /// Request body.
    #[serde(default)]
    pub body: Option<Value>,
    /// Timeout in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn stringify(map: BTreeMap<String, Value>) -> BTreeMap<String, String> {
    map.into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| match v {
            Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect()
}

impl ScriptRequest {
    /// Parse the JSON options a script passed.
    pub fn parse(json: &str) -> Result<Self, String> {
        let request: ScriptRequest =
            serde_json::from_str(json).map_err(|e| format!("invalid http request options: {e}"))?;
        if request.url.is_empty() {
            return Err("http request needs a url".into());
        }
        Ok(request)
    }

    /// Attach a correlation id and normalize into the wire form.
    pub fn into_bridge_request(self, id: u64) -> BridgeRequest {
        let method = self
            .method
            .filter(|m| !m.is_empty())
            .map(|m| m.to_ascii_uppercase())
            .unwrap_or_else(|| "GET".into());
        BridgeRequest {
            id,
            target: self.url,
            method,
            headers: stringify(self.headers),
            params: stringify(self.params),
            body: self.body,
            timeout_ms: self.timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = next_call_id();
        let b = next_call_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn settle_delivers_to_the_matching_waiter() {
        let mut pending = PendingCalls::default();
        let first = pending.register(1);
        let second = pending.register(2);
        assert_eq!(pending.len(), 2);

        // out of issuance order
        assert!(pending.settle(2, Err("boom".into())));
        assert!(pending.settle(
            1,
            Ok(HttpResult::new(200, "OK", BTreeMap::new(), "ok"))
        ));
        assert!(pending.is_empty());

        let ok = first.await.unwrap().unwrap();
        assert_eq!(ok.status, 200);
        assert_eq!(ok.body, "ok");
        assert_eq!(second.await.unwrap().unwrap_err(), "boom");
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let mut pending = PendingCalls::default();
        assert!(!pending.settle(99, Err("late".into())));
    }

    #[tokio::test]
    async fn abandoned_waiters_observe_closure() {
        let mut pending = PendingCalls::default();
        let rx = pending.register(5);
        pending.abandon_all();
        assert!(rx.await.is_err());
    }

    #[test]
    fn script_request_normalizes() {
        let req = ScriptRequest::parse(
            r#"{"url":"http://x/y","method":"post","headers":{"X-N":1,"X-S":"s","X-Null":null},"params":{"page":2},"timeout":500}"#,
        )
        .unwrap()
        .into_bridge_request(9);
        assert_eq!(req.id, 9);
        assert_eq!(req.target, "http://x/y");
        assert_eq!(req.method, "POST");
        assert_eq!(req.headers["X-N"], "1");
        assert_eq!(req.headers["X-S"], "s");
        assert!(!req.headers.contains_key("X-Null"));
        assert_eq!(req.params["page"], "2");
        assert_eq!(req.timeout_ms, Some(500));
        assert!(req.body.is_none());
    }

    #[test]
    fn script_request_defaults_to_get() {
        let req = ScriptRequest::parse(r#"{"url":"http://x"}"#)
            .unwrap()
            .into_bridge_request(1);
        assert_eq!(req.method, "GET");
    }

    #[test]
    fn script_request_requires_url() {
        assert!(ScriptRequest::parse(r#"{"method":"GET"}"#).is_err());
        assert!(ScriptRequest::parse(r#"{"url":""}"#).is_err());
    }
}
