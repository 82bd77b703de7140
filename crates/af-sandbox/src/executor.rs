//! The sandbox message loop: one V8 isolate serving one send attempt.
//!
//! V8 isolates are `!Send`, so a [`SandboxLoop`] is built and run on a
//! dedicated thread with its own single-threaded tokio runtime (or inside the
//! worker process). It talks to its host only through [`HostMessage`]s in and
//! [`SandboxMessage`]s out.

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use crate::bridge::{BridgeOutcome, PendingCalls};
use crate::context::AfContext;
use crate::error::SandboxError;
use crate::model::InitialState;
use crate::ops::{af_ext, PendingScript, SettleSignal, Settlement};
use crate::protocol::{HostMessage, SandboxMessage};
use crate::store::{Emitter, DEFAULT_MAX_STORAGE_VALUE_SIZE};
use crate::validator::{validate_script, DEFAULT_MAX_SCRIPT_SIZE};

/// Where the sandbox isolate runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// A dedicated thread in the host process (default).
    #[default]
    InProcess,
    /// A separate `af-sandbox-worker` process per sandbox instance.
    ChildProcess,
}

/// Configuration for one sandbox instance.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum script size in bytes.
    pub max_script_size: usize,
    /// Maximum serialized size of one local/session storage value in bytes.
    pub max_storage_value_size: usize,
    /// Maximum IPC frame size in bytes (child-process mode).
    pub max_ipc_message_size: usize,
    /// In-process thread or child process.
    pub execution_mode: ExecutionMode,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_script_size: DEFAULT_MAX_SCRIPT_SIZE,
            max_storage_value_size: DEFAULT_MAX_STORAGE_VALUE_SIZE,
            max_ipc_message_size: crate::protocol::DEFAULT_MAX_IPC_MESSAGE_SIZE,
            execution_mode: ExecutionMode::default(),
        }
    }
}

/// Lifecycle of a sandbox instance. Instances are single-use: once settled they
/// never return to `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Created, not yet seeded.
    Uninitialized,
    /// Seeding stores from `initialize`.
    Initializing,
    /// Seeded and waiting for `evaluate`.
    Ready,
    /// Running a script.
    Evaluating,
    /// The script completed.
    SettledSuccess,
    /// The script failed, or evaluation was refused.
    SettledError,
}

impl SandboxState {
    /// Whether the instance has finished its single evaluation.
    pub fn is_settled(self) -> bool {
        matches!(self, SandboxState::SettledSuccess | SandboxState::SettledError)
    }
}

/// Builds the script-visible object graph, then removes every global a script
/// could use to reach past it.
const BOOTSTRAP: &str = r#"
((ops) => {
    const encode = (value) => {
        switch (typeof value) {
            case 'undefined': return '{"t":"undefined"}';
            case 'function': return '{"t":"function"}';
            case 'symbol': return '{"t":"symbol"}';
            case 'bigint': return '{"t":"bigint"}';
        }
        try {
            return JSON.stringify({ v: value });
        } catch (_) {
            return '{"t":"unserializable"}';
        }
    };
    const decode = (json) => (json === '' ? undefined : JSON.parse(json));

    const storeProxy = (store) => new Proxy({}, {
        get(_t, key) {
            if (typeof key !== 'string') return undefined;
            if (key === 'toJSON') return () => JSON.parse(ops.op_af_store_snapshot(store));
            return decode(ops.op_af_store_get(store, key));
        },
        set(_t, key, value) {
            if (typeof key === 'string') ops.op_af_store_set(store, key, encode(value));
            return true;
        },
        deleteProperty(_t, key) {
            if (typeof key === 'string') ops.op_af_store_delete(store, key);
            return true;
        },
        has(_t, key) {
            return typeof key === 'string' && ops.op_af_store_get(store, key) !== '';
        },
        ownKeys() {
            return JSON.parse(ops.op_af_store_keys(store));
        },
        getOwnPropertyDescriptor(_t, key) {
            if (typeof key !== 'string') return undefined;
            const json = ops.op_af_store_get(store, key);
            if (json === '') return undefined;
            return { value: JSON.parse(json), writable: true, enumerable: true, configurable: true };
        },
        defineProperty(_t, key, desc) {
            if (typeof key === 'string' && 'value' in desc) {
                ops.op_af_store_set(store, key, encode(desc.value));
            }
            return true;
        },
    });

    const stores = Object.create(null);
    const store = (name) => stores[name] || (stores[name] = storeProxy(name));

    // members: { name: { store } | { field } | { fixed } }
    const shapeProxy = (path, members, view) => {
        const read = (key) => {
            const m = members[key];
            if (m.store) return store(m.store);
            if (m.field) return decode(ops.op_af_field_get(m.field));
            return m.fixed;
        };
        return new Proxy({}, {
            get(_t, key) {
                if (key === 'toJSON') return view;
                if (typeof key !== 'string' || !Object.hasOwn(members, key)) return undefined;
                return read(key);
            },
            set(_t, key, value) {
                const name = String(key);
                if (typeof key !== 'string' || !Object.hasOwn(members, key)) {
                    ops.op_af_warn(`cannot add af.${path}${name}: the context shape is fixed`);
                } else if (members[key].store) {
                    ops.op_af_store_replace(members[key].store, encode(value));
                } else if (members[key].field) {
                    ops.op_af_field_set(members[key].field, encode(value));
                } else {
                    ops.op_af_warn(`af.${path}${name} cannot be reassigned`);
                }
                return true;
            },
            deleteProperty(_t, key) {
                ops.op_af_guard_delete(`${path}${String(key)}`);
                return true;
            },
            has(_t, key) {
                return typeof key === 'string' && Object.hasOwn(members, key);
            },
            ownKeys() {
                return Object.keys(members);
            },
            getOwnPropertyDescriptor(_t, key) {
                if (typeof key !== 'string' || !Object.hasOwn(members, key)) return undefined;
                return { value: read(key), writable: true, enumerable: true, configurable: true };
            },
            defineProperty() {
                return true;
            },
        });
    };

    const call = async (options) => {
        if (options === null || typeof options !== 'object') {
            throw new TypeError('http.request expects an options object');
        }
        return JSON.parse(await ops.op_af_http_request(JSON.stringify(options)));
    };
    const http = Object.freeze({
        request: (options) => call(options),
        get: (url, options) => call({ ...options, url, method: 'GET' }),
        post: (url, body, options) => call({ ...options, url, method: 'POST', body }),
        put: (url, body, options) => call({ ...options, url, method: 'PUT', body }),
        delete: (url, options) => call({ ...options, url, method: 'DELETE' }),
    });

    function File(path) {
        return Object.freeze({ kind: 'file', value: String(path) });
    }

    const body = shapeProxy('request.body.', {
        json: { store: 'json-body' },
        urlencoded: { store: 'urlencoded-body' },
        formdata: { store: 'formdata-body' },
        raw: { field: 'raw' },
        binary: { field: 'binary' },
    }, () => JSON.parse(ops.op_af_request_snapshot()).body);

    const request = shapeProxy('request.', {
        method: { field: 'method' },
        url: { field: 'url' },
        path: { field: 'path' },
        bodyType: { field: 'bodyType' },
        headers: { store: 'headers' },
        queryParams: { store: 'query-params' },
        pathParams: { store: 'path-params' },
        body: { fixed: body },
        replaceUrl: { fixed: (url) => { ops.op_af_replace_url(encode(url)); } },
    }, () => JSON.parse(ops.op_af_request_snapshot()));

    const af = shapeProxy('', {
        request: { fixed: request },
        variables: { store: 'variables' },
        cookies: { store: 'cookies' },
        localStorage: { store: 'local-storage' },
        sessionStorage: { store: 'session-storage' },
        nodeId: { field: 'nodeId' },
        projectId: { field: 'projectId' },
        http: { fixed: http },
    }, () => JSON.parse(ops.op_af_context_view()));

    const format = (args) => args.map((a) => {
        if (typeof a === 'string') return a;
        try {
            const s = JSON.stringify(a);
            return s === undefined ? String(a) : s;
        } catch (_) {
            return String(a);
        }
    }).join(' ');
    const console = Object.freeze({
        log: (...args) => ops.op_af_log('info', format(args)),
        info: (...args) => ops.op_af_log('info', format(args)),
        debug: (...args) => ops.op_af_log('debug', format(args)),
        warn: (...args) => ops.op_af_log('warn', format(args)),
        error: (...args) => ops.op_af_log('error', format(args)),
    });
    try {
        Object.defineProperty(globalThis, 'console', {
            value: console, writable: false, configurable: false, enumerable: false,
        });
    } catch (_) {
        globalThis.console = console;
    }

    const AsyncFunction = (async function () {}).constructor;
    const GeneratorFunction = (function* () {}).constructor;
    const AsyncGeneratorFunction = (async function* () {}).constructor;

    const failure = (e) => {
        let message;
        if (e !== null && typeof e === 'object' && typeof e.message === 'string') {
            message = e.message;
        } else {
            try { message = String(e); } catch (_) { message = 'uncaught non-printable exception'; }
        }
        const trace = (e !== null && typeof e === 'object' && typeof e.stack === 'string') ? e.stack : '';
        return { ok: false, message, trace };
    };

    let started = false;
    Object.defineProperty(globalThis, '__afRun', {
        value: async () => {
            if (started) throw new Error('script already evaluated');
            started = true;
            try {
                const routine = new AsyncFunction('af', 'File', 'http', ops.op_af_take_script());
                await routine(af, File, http);
                ops.op_af_settle(JSON.stringify({ ok: true }));
            } catch (e) {
                ops.op_af_settle(JSON.stringify(failure(e)));
            }
        },
        writable: false, configurable: false, enumerable: false,
    });

    Object.defineProperty(Function.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false
    });
    Object.defineProperty(AsyncFunction.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false
    });
    Object.defineProperty(GeneratorFunction.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false
    });
    Object.defineProperty(AsyncGeneratorFunction.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false
    });
    delete globalThis.Deno;
    delete globalThis.eval;
    delete globalThis.Function;
})(Deno.core.ops);
"#;

/// One sandbox instance: a fresh isolate, its AF context, and the loop that
/// feeds it host messages.
pub struct SandboxLoop {
    runtime: JsRuntime,
    inbox: UnboundedReceiver<HostMessage>,
    outbox: UnboundedSender<SandboxMessage>,
    state: SandboxState,
    config: SandboxConfig,
}

impl SandboxLoop {
    /// Create the isolate, install the AF context and run the bootstrap.
    ///
    /// Must be called on the thread that will run the loop.
    pub fn new(
        config: SandboxConfig,
        inbox: UnboundedReceiver<HostMessage>,
        outbox: UnboundedSender<SandboxMessage>,
    ) -> Result<Self, SandboxError> {
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![af_ext::init()],
            ..Default::default()
        });

        {
            let op_state = runtime.op_state();
            let mut st = op_state.borrow_mut();
            st.put(AfContext::new(
                Emitter::new(outbox.clone()),
                config.max_storage_value_size,
            ));
            st.put(PendingCalls::default());
        }

        runtime
            .execute_script("[af:bootstrap]", BOOTSTRAP)
            .map_err(|e| SandboxError::JsError {
                message: e.to_string(),
            })?;

        Ok(Self {
            runtime,
            inbox,
            outbox,
            state: SandboxState::Uninitialized,
            config,
        })
    }

    /// A handle that can terminate script execution from another thread.
    pub fn isolate_handle(&mut self) -> v8::IsolateHandle {
        self.runtime.v8_isolate().thread_safe_handle()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// Serve host messages until the single evaluation settles or the host
    /// closes the channel. Returns the final state.
    pub async fn run(mut self) -> SandboxState {
        while let Some(msg) = self.inbox.recv().await {
            tracing::debug!(kind = msg.kind(), state = ?self.state, "sandbox received message");
            match msg {
                HostMessage::Initialize { state } => self.initialize(*state),
                HostMessage::Evaluate { script } => {
                    if self.state == SandboxState::Ready {
                        self.evaluate(script).await;
                    } else {
                        let message = match self.state {
                            SandboxState::Uninitialized => "evaluate received before initialize",
                            _ => "sandbox instance already used; create a new one per send",
                        };
                        self.finish(Settlement::Failure {
                            message: message.into(),
                            trace: String::new(),
                        });
                    }
                    break;
                }
                HostMessage::HttpResponse { id, result } => self.settle_call(id, Ok(result)),
                HostMessage::HttpError { id, message } => self.settle_call(id, Err(message)),
            }
        }
        self.state
    }

    fn initialize(&mut self, seed: InitialState) {
        if !matches!(
            self.state,
            SandboxState::Uninitialized | SandboxState::Ready
        ) {
            tracing::warn!(state = ?self.state, "initialize ignored");
            self.send(SandboxMessage::Warning {
                message: format!("initialize ignored in state {:?}", self.state),
            });
            return;
        }

        self.state = SandboxState::Initializing;
        {
            let op_state = self.runtime.op_state();
            let mut st = op_state.borrow_mut();
            st.borrow_mut::<AfContext>().initialize(seed);
        }
        self.state = SandboxState::Ready;
        tracing::debug!("sandbox seeded");
        self.send(SandboxMessage::InitializationComplete);
    }

    async fn evaluate(&mut self, script: String) {
        self.state = SandboxState::Evaluating;
        tracing::info!(script_len = script.len(), "evaluate: starting");

        if let Err(e) = validate_script(&script, self.config.max_script_size) {
            self.finish(Settlement::Failure {
                message: e.to_string(),
                trace: String::new(),
            });
            return;
        }

        let (settle_tx, mut settle_rx) = oneshot::channel();
        {
            let op_state = self.runtime.op_state();
            let mut st = op_state.borrow_mut();
            st.put(SettleSignal(settle_tx));
            st.put(PendingScript(script));
        }

        if let Err(e) = self
            .runtime
            .execute_script("[af:evaluate]", "globalThis.__afRun();")
        {
            self.finish(Settlement::Failure {
                message: e.to_string(),
                trace: String::new(),
            });
            return;
        }

        // `idle` means the event loop has no pending ops; a script awaiting a
        // promise nobody resolves stays here until the host goes away.
        let mut idle = false;
        loop {
            tokio::select! {
                biased;
                settled = &mut settle_rx => {
                    let settlement = settled.unwrap_or_else(|_| Settlement::Failure {
                        message: "script runner exited without settling".into(),
                        trace: String::new(),
                    });
                    self.finish(settlement);
                    return;
                }
                polled = self.runtime.run_event_loop(PollEventLoopOptions::default()), if !idle => {
                    match polled {
                        Ok(()) => idle = true,
                        Err(e) => {
                            self.finish(Settlement::Failure {
                                message: e.to_string(),
                                trace: String::new(),
                            });
                            return;
                        }
                    }
                }
                msg = self.inbox.recv() => match msg {
                    Some(HostMessage::HttpResponse { id, result }) => {
                        self.settle_call(id, Ok(result));
                        idle = false;
                    }
                    Some(HostMessage::HttpError { id, message }) => {
                        self.settle_call(id, Err(message));
                        idle = false;
                    }
                    Some(other) => {
                        tracing::warn!(kind = other.kind(), "message ignored during evaluation");
                        self.send(SandboxMessage::Warning {
                            message: format!("{} ignored during evaluation", other.kind()),
                        });
                    }
                    None => {
                        tracing::debug!("host closed the channel during evaluation");
                        self.abandon_calls();
                        return;
                    }
                }
            }
        }
    }

    fn finish(&mut self, settlement: Settlement) {
        let abandoned = self.abandon_calls();
        match settlement {
            Settlement::Success => {
                self.state = SandboxState::SettledSuccess;
                let context = {
                    let op_state = self.runtime.op_state();
                    let st = op_state.borrow();
                    st.borrow::<AfContext>().echo()
                };
                tracing::info!(abandoned, "evaluate: complete");
                self.send(SandboxMessage::EvaluateSuccess {
                    context: Box::new(context),
                });
            }
            Settlement::Failure { message, trace } => {
                self.state = SandboxState::SettledError;
                tracing::warn!(error = %message, abandoned, "evaluate: failed");
                self.send(SandboxMessage::EvaluateError { message, trace });
            }
        }
    }

    fn settle_call(&mut self, id: u64, outcome: BridgeOutcome) {
        let op_state = self.runtime.op_state();
        let mut st = op_state.borrow_mut();
        st.borrow_mut::<PendingCalls>().settle(id, outcome);
    }

    fn abandon_calls(&mut self) -> usize {
        let op_state = self.runtime.op_state();
        let mut st = op_state.borrow_mut();
        let pending = st.borrow_mut::<PendingCalls>();
        let open = pending.len();
        pending.abandon_all();
        open
    }

    fn send(&self, msg: SandboxMessage) {
        if self.outbox.send(msg).is_err() {
            tracing::debug!("host receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc::unbounded_channel;

    /// Drive a loop on this test's own current-thread runtime.
    async fn run_script(
        seed: InitialState,
        script: &str,
    ) -> (SandboxState, Vec<SandboxMessage>) {
        let (in_tx, in_rx) = unbounded_channel();
        let (out_tx, mut out_rx) = unbounded_channel();
        let sandbox = SandboxLoop::new(SandboxConfig::default(), in_rx, out_tx).unwrap();
        in_tx
            .send(HostMessage::Initialize {
                state: Box::new(seed),
            })
            .unwrap();
        in_tx
            .send(HostMessage::Evaluate {
                script: script.into(),
            })
            .unwrap();
        let state = sandbox.run().await;
        let mut messages = Vec::new();
        while let Ok(msg) = out_rx.try_recv() {
            messages.push(msg);
        }
        (state, messages)
    }

    #[tokio::test]
    async fn empty_script_settles_successfully() {
        let (state, messages) = run_script(InitialState::default(), "").await;
        assert_eq!(state, SandboxState::SettledSuccess);
        assert_eq!(messages[0], SandboxMessage::InitializationComplete);
        assert!(matches!(
            messages.last(),
            Some(SandboxMessage::EvaluateSuccess { .. })
        ));
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn thrown_error_settles_with_message() {
        let (state, messages) =
            run_script(InitialState::default(), "throw new Error('bad');").await;
        assert_eq!(state, SandboxState::SettledError);
        match messages.last() {
            Some(SandboxMessage::EvaluateError { message, trace }) => {
                assert_eq!(message, "bad");
                assert!(trace.contains("bad"));
            }
            other => panic!("expected evaluate-error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn syntax_error_is_an_evaluate_error() {
        let (state, messages) = run_script(InitialState::default(), "let = ;").await;
        assert_eq!(state, SandboxState::SettledError);
        assert!(matches!(
            messages.last(),
            Some(SandboxMessage::EvaluateError { .. })
        ));
    }

    #[tokio::test]
    async fn echo_reflects_mutations() {
        let (_, messages) = run_script(
            InitialState::default(),
            "af.request.url = 'http://x'; af.request.queryParams.q = 'rust';",
        )
        .await;
        match messages.last() {
            Some(SandboxMessage::EvaluateSuccess { context }) => {
                assert_eq!(context.url, "http://x");
                assert_eq!(context.query_params["q"], "rust");
            }
            other => panic!("expected evaluate-success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn runtime_names_inside_strings_are_fine() {
        let (state, messages) = run_script(
            InitialState::default(),
            r#"
            // require('fs') would fail, but a comment is only a comment
            af.request.headers['X-Note'] = 'built on Deno.land';
            af.variables.hint = "use import('x') elsewhere";
            "#,
        )
        .await;
        assert_eq!(state, SandboxState::SettledSuccess, "{messages:?}");
        match messages.last() {
            Some(SandboxMessage::EvaluateSuccess { context }) => {
                assert_eq!(
                    context.headers["X-Note"],
                    crate::model::HeaderValue::Set("built on Deno.land".into())
                );
            }
            other => panic!("expected evaluate-success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn async_generator_constructor_cannot_compile_source() {
        let (state, messages) = run_script(
            InitialState::default(),
            "const G = Object.getPrototypeOf(async function* () {}).constructor; new G('return 1');",
        )
        .await;
        assert_eq!(state, SandboxState::SettledError);
        assert!(matches!(
            messages.last(),
            Some(SandboxMessage::EvaluateError { .. })
        ));
    }

    #[tokio::test]
    async fn evaluate_before_initialize_is_refused() {
        let (in_tx, in_rx) = unbounded_channel();
        let (out_tx, mut out_rx) = unbounded_channel();
        let sandbox = SandboxLoop::new(SandboxConfig::default(), in_rx, out_tx).unwrap();
        in_tx
            .send(HostMessage::Evaluate {
                script: String::new(),
            })
            .unwrap();
        assert_eq!(sandbox.run().await, SandboxState::SettledError);
        match out_rx.try_recv().unwrap() {
            SandboxMessage::EvaluateError { message, .. } => {
                assert!(message.contains("before initialize"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_script_is_refused() {
        let (in_tx, in_rx) = unbounded_channel();
        let (out_tx, mut out_rx) = unbounded_channel();
        let config = SandboxConfig {
            max_script_size: 16,
            ..SandboxConfig::default()
        };
        let sandbox = SandboxLoop::new(config, in_rx, out_tx).unwrap();
        in_tx
            .send(HostMessage::Initialize {
                state: Box::new(InitialState::default()),
            })
            .unwrap();
        in_tx
            .send(HostMessage::Evaluate {
                script: "af.request.method = 'POST';".into(),
            })
            .unwrap();
        assert_eq!(sandbox.run().await, SandboxState::SettledError);
        let last = std::iter::from_fn(|| out_rx.try_recv().ok()).last();
        match last {
            Some(SandboxMessage::EvaluateError { message, .. }) => {
                assert!(message.contains("maximum size"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn code_generation_globals_are_gone() {
        let (_, messages) = run_script(
            InitialState::default(),
            r#"
            af.variables.eval = typeof eval;
            af.variables.deno = typeof Deno;
            af.variables.fn = typeof Function;
            af.variables.ctor = typeof (() => {}).constructor;
            af.variables.asyncCtor = typeof (async () => {}).constructor;
            af.variables.genCtor = typeof Object.getPrototypeOf(function* () {}).constructor;
            af.variables.asyncGenCtor =
                typeof Object.getPrototypeOf(async function* () {}).constructor;
            "#,
        )
        .await;
        match messages.last() {
            Some(SandboxMessage::EvaluateSuccess { context }) => {
                for key in ["eval", "deno", "fn", "ctor", "asyncCtor", "genCtor", "asyncGenCtor"] {
                    assert_eq!(context.variables[key].value, json!("undefined"), "{key}");
                }
            }
            other => panic!("expected evaluate-success, got {other:?}"),
        }
    }
}
