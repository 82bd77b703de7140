//! Full sends through the orchestrator with an in-process sandbox and a
//! recording transport.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use af_error::TransportError;
use af_host::{
    MemoryStorageCache, Orchestrator, OrchestratorConfig, PreparedBody, PreparedRequest,
    RequestNode, SendError, Transport, VariableResolver,
};
use af_sandbox::audit::{AuditLogger, ScriptAuditEntry, ScriptOutcome};
use af_sandbox::{BodyType, HttpResult, VariableValue};
use serde_json::json;

type Reply = dyn Fn(&PreparedRequest) -> Result<HttpResult, TransportError> + Send + Sync;

struct RecordingTransport {
    calls: Mutex<Vec<PreparedRequest>>,
    reply: Box<Reply>,
}

impl RecordingTransport {
    fn new(
        reply: impl Fn(&PreparedRequest) -> Result<HttpResult, TransportError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            reply: Box::new(reply),
        })
    }

    fn ok() -> Arc<Self> {
        Self::new(|_| Ok(HttpResult::new(200, "OK", BTreeMap::new(), "done")))
    }

    fn calls(&self) -> Vec<PreparedRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, request: &PreparedRequest) -> Result<HttpResult, TransportError> {
        self.calls.lock().unwrap().push(request.clone());
        (self.reply)(request)
    }
}

#[derive(Default)]
struct RecordingAudit {
    entries: Mutex<Vec<ScriptAuditEntry>>,
}

#[async_trait::async_trait]
impl AuditLogger for RecordingAudit {
    async fn log(&self, entry: &ScriptAuditEntry) {
        self.entries.lock().unwrap().push(entry.clone());
    }
}

fn orchestrator(transport: Arc<RecordingTransport>) -> Orchestrator {
    Orchestrator::new(transport, OrchestratorConfig::default())
}

fn node(script: Option<&str>) -> RequestNode {
    let mut node = RequestNode::new("node-1");
    node.request.url = "https://api.test/items".into();
    node.pre_request_script = script.map(str::to_string);
    node
}

#[tokio::test]
async fn no_script_goes_straight_to_the_transport() {
    let transport = RecordingTransport::ok();
    let outcome = orchestrator(transport.clone())
        .send(&node(None))
        .await
        .unwrap();

    assert!(!outcome.script_ran);
    assert_eq!(outcome.response.unwrap().body, "done");
    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].method, "GET");
    assert_eq!(calls[0].url, "https://api.test/items");
}

#[tokio::test]
async fn script_mutations_shape_the_sent_request() {
    let transport = RecordingTransport::ok();
    let script = r#"
        af.request.method = 'POST';
        af.request.headers['X-Trace'] = 'abc';
        af.request.queryParams.page = 2;
        af.request.bodyType = 'json';
        af.request.body.json.name = 'ada';
        af.variables.ignored = true;
    "#;
    let outcome = orchestrator(transport.clone())
        .send(&node(Some(script)))
        .await
        .unwrap();

    assert!(outcome.script_ran);
    assert_eq!(outcome.mutations_applied, 5);
    assert_eq!(outcome.warnings.len(), 1, "{:?}", outcome.warnings);

    let sent = &transport.calls()[0];
    assert_eq!(sent.method, "POST");
    assert_eq!(sent.url, "https://api.test/items?page=2");
    assert_eq!(sent.header("x-trace"), Some("abc"));
    assert_eq!(sent.body, PreparedBody::Text(r#"{"name":"ada"}"#.into()));
}

#[tokio::test]
async fn script_error_aborts_without_transport() {
    let transport = RecordingTransport::ok();
    let audit = Arc::new(RecordingAudit::default());
    let err = orchestrator(transport.clone())
        .with_audit(audit.clone())
        .send(&node(Some("throw new Error('bad');")))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "pre-request script error: bad");
    assert!(matches!(err, SendError::Script { ref message, .. } if message == "bad"));
    assert!(transport.calls().is_empty());

    let entries = audit.entries.lock().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].outcome,
        ScriptOutcome::ScriptError {
            message: "bad".into()
        }
    );
    assert_eq!(entries[0].node_id.as_deref(), Some("node-1"));
}

#[tokio::test]
async fn bridge_calls_go_through_the_same_transport() {
    let transport = RecordingTransport::new(|req| {
        if req.url.starts_with("https://auth.test") {
            Ok(HttpResult::new(200, "OK", BTreeMap::new(), r#"{"token":"abc"}"#))
        } else {
            Ok(HttpResult::new(204, "No Content", BTreeMap::new(), ""))
        }
    });
    let script = r#"
        const res = await http.post('https://auth.test/token', { user: 'a' });
        af.request.headers.Authorization = 'Bearer ' + res.data.token;
    "#;
    let outcome = orchestrator(transport.clone())
        .send(&node(Some(script)))
        .await
        .unwrap();

    assert_eq!(outcome.response.unwrap().status, 204);
    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].url, "https://auth.test/token");
    assert_eq!(calls[0].method, "POST");
    assert_eq!(calls[1].url, "https://api.test/items");
    assert_eq!(calls[1].header("authorization"), Some("Bearer abc"));
}

#[tokio::test]
async fn unhandled_bridge_failure_fails_the_send() {
    let transport = RecordingTransport::new(|req| {
        Err(TransportError::Connect {
            target: req.url.clone(),
            message: "connection refused".into(),
        })
    });
    let err = orchestrator(transport.clone())
        .send(&node(Some("await http.get('https://down.test/');")))
        .await
        .unwrap_err();

    match err {
        SendError::Script { message, .. } => {
            assert!(message.contains("connection refused"), "{message}")
        }
        other => panic!("expected script error, got {other:?}"),
    }
    // only the bridge call reached the transport
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test]
async fn never_settling_script_times_out() {
    let transport = RecordingTransport::ok();
    let audit = Arc::new(RecordingAudit::default());
    let config = OrchestratorConfig {
        script_timeout: Some(Duration::from_millis(200)),
        ..OrchestratorConfig::default()
    };
    let err = Orchestrator::new(transport.clone(), config)
        .with_audit(audit.clone())
        .send(&node(Some("await new Promise(() => {});")))
        .await
        .unwrap_err();

    assert!(matches!(err, SendError::ScriptTimeout(d) if d == Duration::from_millis(200)));
    assert!(transport.calls().is_empty());
    assert_eq!(audit.entries.lock().unwrap()[0].outcome, ScriptOutcome::Timeout);
}

#[tokio::test]
async fn storage_persists_across_sends_of_a_node() {
    let transport = RecordingTransport::ok();
    let orchestrator = orchestrator(transport.clone())
        .with_storage(Arc::new(MemoryStorageCache::default()));

    orchestrator
        .send(&node(Some(
            "af.sessionStorage.token = 't-1'; af.localStorage.theme = 'dark';",
        )))
        .await
        .unwrap();
    orchestrator
        .send(&node(Some(
            "af.request.headers['X-Token'] = af.sessionStorage.token + '/' + af.localStorage.theme;",
        )))
        .await
        .unwrap();

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].header("x-token"), Some("t-1/dark"));
}

#[tokio::test]
async fn primary_transport_failure_is_an_outcome() {
    let transport = RecordingTransport::new(|req| {
        Err(TransportError::Timeout {
            target: req.url.clone(),
            timeout_ms: 10,
        })
    });
    let outcome = orchestrator(transport)
        .send(&node(Some("af.request.method = 'DELETE';")))
        .await
        .unwrap();

    let err = outcome.response.unwrap_err();
    assert_eq!(err.code(), "TIMEOUT");
    assert_eq!(outcome.request.unwrap().method, "DELETE");
}

#[tokio::test]
async fn sandbox_sees_resolved_values_only() {
    let transport = RecordingTransport::ok();
    let mut node = node(Some("af.request.headers['X-Seen'] = af.request.url;"));
    node.request.url = "https://{{host}}/v1".into();
    node.variables
        .insert("host".into(), VariableValue::infer(json!("api.test")));

    orchestrator(transport.clone())
        .with_resolver(Arc::new(VariableResolver))
        .send(&node)
        .await
        .unwrap();

    let sent = &transport.calls()[0];
    assert_eq!(sent.url, "https://api.test/v1");
    assert_eq!(sent.header("x-seen"), Some("https://api.test/v1"));
}

#[tokio::test]
async fn console_output_is_collected() {
    let transport = RecordingTransport::ok();
    let mut node = node(Some("console.warn('careful'); af.request.bodyType = 'raw'; af.request.body.raw = 'x';"));
    node.request.body_type = BodyType::None;

    let outcome = orchestrator(transport.clone()).send(&node).await.unwrap();
    assert_eq!(outcome.logs.len(), 1);
    assert_eq!(outcome.logs[0].message, "careful");
    assert_eq!(transport.calls()[0].body, PreparedBody::Text("x".into()));
}
