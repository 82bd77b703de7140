//! The real transport: turning the working copy into a wire request and
//! sending it. The same [`Transport`] serves the primary send and every
//! script-initiated bridge call.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use af_error::TransportError;
use af_sandbox::{BinaryMode, BodyType, BridgeRequest, FormDataKind, HeaderValue, HttpResult, InitialState};
use regex::Regex;
use reqwest::header::{HeaderName, HeaderValue as WireHeaderValue, USER_AGENT};
use reqwest::multipart;
use reqwest::Client;
use serde_json::Value;
use url::Url;

/// `{name}` path-parameter placeholder.
static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_\-]+)\}").expect("static regex is valid"));

/// Settings for [`ReqwestTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Default per-request timeout (default: 30 seconds).
    pub timeout: Duration,
    /// `User-Agent` header (default: `af-host/<version>`).
    pub user_agent: String,
    /// Redirects followed before giving up; `0` disables following (default: 10).
    pub max_redirects: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: concat!("af-host/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 10,
        }
    }
}

/// One part of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormPart {
    /// A text field.
    Text {
        /// Field name.
        name: String,
        /// Field value.
        value: String,
    },
    /// A file read from disk at send time.
    File {
        /// Field name.
        name: String,
        /// Local path.
        path: PathBuf,
    },
}

/// The body of a prepared request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreparedBody {
    /// No body.
    Empty,
    /// Text sent verbatim.
    Text(String),
    /// Bytes sent verbatim.
    Bytes(Vec<u8>),
    /// A local file's bytes, read at send time.
    File(PathBuf),
    /// `application/x-www-form-urlencoded` pairs.
    Form(Vec<(String, String)>),
    /// `multipart/form-data` parts.
    Multipart(Vec<FormPart>),
}

/// A fully resolved request ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRequest {
    /// HTTP method.
    pub method: String,
    /// Absolute URL including the query string.
    pub url: String,
    /// Headers in send order.
    pub headers: Vec<(String, String)>,
    /// Body.
    pub body: PreparedBody,
    /// Per-request timeout overriding the transport default.
    pub timeout: Option<Duration>,
    /// Headers the seed cleared. Neither the host nor the transport fills these in.
    pub suppressed_headers: Vec<String>,
}

impl PreparedRequest {
    /// First header named `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether `name` was cleared, case-insensitively.
    pub fn is_suppressed(&self, name: &str) -> bool {
        self.suppressed_headers
            .iter()
            .any(|k| k.eq_ignore_ascii_case(name))
    }

    fn set_default_header(&mut self, name: &str, value: &str) {
        if self.header(name).is_none() && !self.is_suppressed(name) {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    /// The request for a script-initiated bridge call.
    pub fn from_bridge(call: &BridgeRequest) -> Result<Self, TransportError> {
        let url = build_url(&call.target, "", &BTreeMap::new(), &call.params)?;
        let mut prepared = Self {
            method: call.method.clone(),
            url: url.to_string(),
            headers: call
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            body: PreparedBody::Empty,
            timeout: call.timeout_ms.map(Duration::from_millis),
            suppressed_headers: Vec::new(),
        };
        match &call.body {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => prepared.body = PreparedBody::Text(text.clone()),
            Some(other) => {
                prepared.body = PreparedBody::Text(other.to_string());
                prepared.set_default_header("Content-Type", "application/json");
            }
        }
        Ok(prepared)
    }
}

/// Build the wire request from the working copy.
pub fn prepare_request(state: &InitialState) -> Result<PreparedRequest, TransportError> {
    let url = build_url(&state.url, &state.path, &state.path_params, &state.query_params)?;

    let mut headers = Vec::new();
    let mut suppressed_headers = Vec::new();
    for (name, value) in &state.headers {
        match value {
            HeaderValue::Set(v) => headers.push((name.clone(), v.clone())),
            HeaderValue::Cleared => suppressed_headers.push(name.clone()),
        }
    }

    if !state.cookies.is_empty() {
        let folded = state
            .cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ");
        match headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case("cookie"))
        {
            Some((_, existing)) => {
                existing.push_str("; ");
                existing.push_str(&folded);
            }
            None => headers.push(("Cookie".into(), folded)),
        }
    }

    let mut prepared = PreparedRequest {
        method: state.method.clone(),
        url: url.to_string(),
        headers,
        body: PreparedBody::Empty,
        timeout: None,
        suppressed_headers,
    };

    let body = &state.body;
    match state.body_type {
        BodyType::None => {}
        BodyType::Json => {
            let text = serde_json::to_string(&body.json)
                .map_err(|e| TransportError::InvalidRequest(format!("json body: {e}")))?;
            prepared.body = PreparedBody::Text(text);
            prepared.set_default_header("Content-Type", "application/json");
        }
        BodyType::Urlencoded => {
            prepared.body = PreparedBody::Form(
                body.urlencoded
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            );
        }
        BodyType::Formdata => {
            prepared.body = PreparedBody::Multipart(
                body.formdata
                    .iter()
                    .map(|(name, entry)| match entry.kind {
                        FormDataKind::Text => FormPart::Text {
                            name: name.clone(),
                            value: entry.value.clone(),
                        },
                        FormDataKind::File => FormPart::File {
                            name: name.clone(),
                            path: PathBuf::from(&entry.value),
                        },
                    })
                    .collect(),
            );
        }
        BodyType::Raw => {
            prepared.body = PreparedBody::Text(body.raw.clone());
            prepared.set_default_header("Content-Type", "text/plain");
        }
        BodyType::Binary => {
            let source = &body.binary.path;
            prepared.body = match body.binary.mode {
                BinaryMode::File if source.is_empty() => {
                    return Err(TransportError::InvalidRequest(
                        "binary body has no file selected".into(),
                    ))
                }
                BinaryMode::File => PreparedBody::File(PathBuf::from(source)),
                BinaryMode::Variable => {
                    let var = state.variables.get(source).ok_or_else(|| {
                        TransportError::InvalidRequest(format!(
                            "binary body variable '{source}' is not defined"
                        ))
                    })?;
                    match &var.value {
                        Value::String(s) => PreparedBody::Bytes(s.clone().into_bytes()),
                        other => PreparedBody::Bytes(other.to_string().into_bytes()),
                    }
                }
            };
            prepared.set_default_header("Content-Type", "application/octet-stream");
        }
    }

    Ok(prepared)
}

/// Join `base` and `path`, fill `{name}` placeholders and append the query.
fn build_url(
    base: &str,
    path: &str,
    path_params: &BTreeMap<String, String>,
    query: &BTreeMap<String, String>,
) -> Result<Url, TransportError> {
    let base = base.trim();
    if base.is_empty() {
        return Err(TransportError::InvalidRequest("request has no url".into()));
    }

    let mut raw = if base.contains("://") {
        base.to_string()
    } else {
        format!("http://{base}")
    };
    if !path.is_empty() {
        raw = format!(
            "{}/{}",
            raw.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
    }
    if !path_params.is_empty() {
        raw = PLACEHOLDER_RE
            .replace_all(&raw, |caps: &regex::Captures<'_>| match path_params.get(&caps[1]) {
                Some(value) => encode_segment(value),
                None => caps[0].to_string(),
            })
            .into_owned();
    }

    let mut url = Url::parse(&raw)
        .map_err(|e| TransportError::InvalidRequest(format!("invalid url '{raw}': {e}")))?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in query {
            pairs.append_pair(k, v);
        }
    }
    Ok(url)
}

fn encode_segment(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Sends prepared requests.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send one request and read the whole response.
    async fn send(&self, request: &PreparedRequest) -> Result<HttpResult, TransportError>;
}

/// [`Transport`] backed by a shared `reqwest` client.
pub struct ReqwestTransport {
    client: Client,
    config: TransportConfig,
    user_agent: WireHeaderValue,
}

impl ReqwestTransport {
    /// Build the client.
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let redirect = if config.max_redirects == 0 {
            reqwest::redirect::Policy::none()
        } else {
            reqwest::redirect::Policy::limited(config.max_redirects)
        };
        let user_agent = WireHeaderValue::from_str(&config.user_agent).map_err(|_| {
            TransportError::InvalidRequest(format!(
                "invalid user agent '{}'",
                config.user_agent
            ))
        })?;
        // The user agent is applied per request so a cleared header can drop it.
        let client = Client::builder()
            .timeout(config.timeout)
            .redirect(redirect)
            .build()
            .map_err(|e| TransportError::Internal(e.into()))?;
        Ok(Self {
            client,
            config,
            user_agent,
        })
    }

    fn classify(&self, err: reqwest::Error, request: &PreparedRequest) -> TransportError {
        if err.is_timeout() {
            let timeout = request.timeout.unwrap_or(self.config.timeout);
            return TransportError::Timeout {
                target: request.url.clone(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            };
        }
        if err.is_builder() {
            return TransportError::InvalidRequest(err.to_string());
        }
        if err.is_connect() {
            if is_dns_failure(&err) {
                let host = Url::parse(&request.url)
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_string))
                    .unwrap_or_default();
                return TransportError::Resolve { host };
            }
            return TransportError::Connect {
                target: request.url.clone(),
                message: error_chain(&err),
            };
        }
        TransportError::Internal(anyhow::Error::new(err))
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(": ")
}

fn is_dns_failure(err: &reqwest::Error) -> bool {
    error_chain(err).contains("dns error")
}

async fn read_body_file(path: &Path) -> Result<Vec<u8>, TransportError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| TransportError::BodyFile {
            path: path.display().to_string(),
            message: e.to_string(),
        })
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &PreparedRequest) -> Result<HttpResult, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|_| {
            TransportError::InvalidRequest(format!("invalid method '{}'", request.method))
        })?;

        let mut builder = self.client.request(method, request.url.as_str());
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| TransportError::InvalidRequest(format!("invalid header name '{name}'")))?;
            let value = WireHeaderValue::from_str(value).map_err(|_| {
                TransportError::InvalidRequest(format!("invalid value for header '{name}'"))
            })?;
            builder = builder.header(name, value);
        }
        if request.header("user-agent").is_none() && !request.is_suppressed("user-agent") {
            builder = builder.header(USER_AGENT, self.user_agent.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        builder = match &request.body {
            PreparedBody::Empty => builder,
            PreparedBody::Text(text) => builder.body(text.clone()),
            PreparedBody::Bytes(bytes) => builder.body(bytes.clone()),
            PreparedBody::File(path) => builder.body(read_body_file(path).await?),
            PreparedBody::Form(pairs) => builder.form(pairs),
            PreparedBody::Multipart(parts) => {
                let mut form = multipart::Form::new();
                for part in parts {
                    form = match part {
                        FormPart::Text { name, value } => form.text(name.clone(), value.clone()),
                        FormPart::File { name, path } => {
                            let bytes = read_body_file(path).await?;
                            let file_name = path
                                .file_name()
                                .map(|n| n.to_string_lossy().into_owned())
                                .unwrap_or_else(|| name.clone());
                            form.part(name.clone(), multipart::Part::bytes(bytes).file_name(file_name))
                        }
                    };
                }
                builder.multipart(form)
            }
        };

        tracing::debug!(method = %request.method, url = %request.url, "transport send");
        let response = builder
            .send()
            .await
            .map_err(|e| self.classify(e, request))?;

        let status = response.status();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.to_string(), v.to_string());
            }
        }
        let body = response
            .text()
            .await
            .map_err(|e| self.classify(e, request))?;

        tracing::debug!(status = status.as_u16(), url = %request.url, "transport response");
        Ok(HttpResult::new(
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
            headers,
            body,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_sandbox::{BinaryBody, FormDataValue, VariableValue};
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn state(url: &str) -> InitialState {
        InitialState {
            url: url.into(),
            ..InitialState::default()
        }
    }

    #[test]
    fn url_joins_path_params_and_query() {
        let mut s = state("https://api.test/v1/");
        s.path = "/users/{id}/files/{name}".into();
        s.path_params.insert("id".into(), "42".into());
        s.path_params.insert("name".into(), "a b/c".into());
        s.query_params.insert("q".into(), "rust lang".into());

        let prepared = prepare_request(&s).unwrap();
        assert_eq!(
            prepared.url,
            "https://api.test/v1/users/42/files/a%20b%2Fc?q=rust+lang"
        );
    }

    #[test]
    fn scheme_defaults_to_http() {
        assert_eq!(prepare_request(&state("localhost:8080/x")).unwrap().url, "http://localhost:8080/x");
    }

    #[test]
    fn missing_url_is_invalid() {
        let err = prepare_request(&state("  ")).unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[test]
    fn cleared_headers_are_suppressed_and_cookies_folded() {
        let mut s = state("https://api.test");
        s.headers.insert("Accept".into(), "*/*".into());
        s.headers.insert("User-Agent".into(), HeaderValue::Cleared);
        s.cookies.insert("a".into(), "1".into());
        s.cookies.insert("b".into(), "2".into());

        let prepared = prepare_request(&s).unwrap();
        assert_eq!(prepared.header("accept"), Some("*/*"));
        assert_eq!(prepared.header("user-agent"), None);
        assert!(prepared.is_suppressed("user-agent"));
        assert_eq!(prepared.header("cookie"), Some("a=1; b=2"));
    }

    #[test]
    fn cleared_content_type_gets_no_default() {
        let mut s = state("https://api.test");
        s.headers.insert("content-type".into(), HeaderValue::Cleared);
        s.body.raw = "raw text".into();
        s.body_type = BodyType::Raw;

        let prepared = prepare_request(&s).unwrap();
        assert_eq!(prepared.body, PreparedBody::Text("raw text".into()));
        assert_eq!(prepared.header("Content-Type"), None);
    }

    #[test]
    fn explicit_cookie_header_is_extended() {
        let mut s = state("https://api.test");
        s.headers.insert("Cookie".into(), "pre=0".into());
        s.cookies.insert("a".into(), "1".into());
        assert_eq!(prepare_request(&s).unwrap().header("Cookie"), Some("pre=0; a=1"));
    }

    #[test]
    fn body_follows_body_type() {
        let mut s = state("https://api.test");
        s.body.json.insert("n".into(), json!(1));
        s.body.urlencoded.insert("u".into(), "v".into());
        s.body.raw = "raw text".into();

        s.body_type = BodyType::None;
        assert_eq!(prepare_request(&s).unwrap().body, PreparedBody::Empty);

        s.body_type = BodyType::Json;
        let p = prepare_request(&s).unwrap();
        assert_eq!(p.body, PreparedBody::Text(r#"{"n":1}"#.into()));
        assert_eq!(p.header("content-type"), Some("application/json"));

        s.body_type = BodyType::Urlencoded;
        assert_eq!(
            prepare_request(&s).unwrap().body,
            PreparedBody::Form(vec![("u".into(), "v".into())])
        );

        s.body_type = BodyType::Raw;
        s.headers.insert("Content-Type".into(), "text/csv".into());
        let p = prepare_request(&s).unwrap();
        assert_eq!(p.body, PreparedBody::Text("raw text".into()));
        assert_eq!(p.header("content-type"), Some("text/csv"));
    }

    #[test]
    fn formdata_becomes_multipart_parts() {
        let mut s = state("https://api.test");
        s.body_type = BodyType::Formdata;
        s.body.formdata.insert("f".into(), FormDataValue::file("/tmp/a.bin"));
        s.body.formdata.insert("t".into(), FormDataValue::text("hi"));

        assert_eq!(
            prepare_request(&s).unwrap().body,
            PreparedBody::Multipart(vec![
                FormPart::File {
                    name: "f".into(),
                    path: PathBuf::from("/tmp/a.bin"),
                },
                FormPart::Text {
                    name: "t".into(),
                    value: "hi".into(),
                },
            ])
        );
    }

    #[test]
    fn binary_body_from_variable_or_file() {
        let mut s = state("https://api.test");
        s.body_type = BodyType::Binary;
        s.body.binary = BinaryBody {
            mode: BinaryMode::Variable,
            path: "payload".into(),
        };
        assert!(prepare_request(&s).is_err());

        s.variables
            .insert("payload".into(), VariableValue::infer(json!("bytes!")));
        assert_eq!(
            prepare_request(&s).unwrap().body,
            PreparedBody::Bytes(b"bytes!".to_vec())
        );

        s.body.binary = BinaryBody {
            mode: BinaryMode::File,
            path: "/tmp/blob".into(),
        };
        assert_eq!(
            prepare_request(&s).unwrap().body,
            PreparedBody::File(PathBuf::from("/tmp/blob"))
        );
    }

    #[test]
    fn bridge_request_mapping() {
        let mut params = BTreeMap::new();
        params.insert("page".into(), "2".into());
        let call = BridgeRequest {
            id: 7,
            target: "https://auth.test/token".into(),
            method: "POST".into(),
            headers: BTreeMap::new(),
            params,
            body: Some(json!({"user": "a"})),
            timeout_ms: Some(1500),
        };
        let prepared = PreparedRequest::from_bridge(&call).unwrap();
        assert_eq!(prepared.url, "https://auth.test/token?page=2");
        assert_eq!(prepared.body, PreparedBody::Text(r#"{"user":"a"}"#.into()));
        assert_eq!(prepared.header("Content-Type"), Some("application/json"));
        assert_eq!(prepared.timeout, Some(Duration::from_millis(1500)));
    }

    #[tokio::test]
    async fn invalid_method_is_rejected_before_sending() {
        let transport = ReqwestTransport::new(TransportConfig::default()).unwrap();
        let mut prepared = prepare_request(&state("http://127.0.0.1:9/")).unwrap();
        prepared.method = "GET POST".into();
        let err = transport.send(&prepared).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn missing_body_file_is_reported() {
        let transport = ReqwestTransport::new(TransportConfig::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut prepared = prepare_request(&state("http://127.0.0.1:9/")).unwrap();
        prepared.body = PreparedBody::File(dir.path().join("missing.bin"));
        let err = transport.send(&prepared).await.unwrap_err();
        assert_eq!(err.code(), "BODY_FILE");
    }

    /// Accept one connection, answer 201 and hand back the raw request head.
    async fn one_shot_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            let mut buf = [0u8; 1024];
            while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                seen.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(
                    b"HTTP/1.1 201 Created\r\nContent-Type: application/json\r\nContent-Length: 11\r\nConnection: close\r\n\r\n{\"ok\":true}",
                )
                .await
                .unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&seen).into_owned()
        });
        (addr, server)
    }

    #[tokio::test]
    async fn sends_against_a_local_server() {
        let (addr, server) = one_shot_server().await;
        let transport = ReqwestTransport::new(TransportConfig::default()).unwrap();
        let mut s = state(&format!("http://{addr}"));
        s.path = "/items".into();
        s.headers.insert("X-Trace".into(), "t-1".into());
        let result = transport.send(&prepare_request(&s).unwrap()).await.unwrap();

        assert_eq!(result.status, 201);
        assert_eq!(result.status_text, "Created");
        assert_eq!(result.parsed_body, Some(json!({"ok": true})));

        let request_text = server.await.unwrap().to_lowercase();
        assert!(request_text.starts_with("get /items http/1.1"), "{request_text}");
        assert!(request_text.contains("x-trace: t-1"));
        assert!(request_text.contains("user-agent: af-host/"));
    }

    #[tokio::test]
    async fn cleared_user_agent_is_not_sent() {
        let (addr, server) = one_shot_server().await;
        let transport = ReqwestTransport::new(TransportConfig::default()).unwrap();
        let mut s = state(&format!("http://{addr}"));
        s.headers.insert("User-Agent".into(), HeaderValue::Cleared);
        let result = transport.send(&prepare_request(&s).unwrap()).await.unwrap();
        assert_eq!(result.status, 201);

        let request_text = server.await.unwrap().to_lowercase();
        assert!(!request_text.contains("user-agent:"), "{request_text}");
    }

    #[tokio::test]
    async fn explicit_user_agent_replaces_the_default() {
        let (addr, server) = one_shot_server().await;
        let transport = ReqwestTransport::new(TransportConfig::default()).unwrap();
        let mut s = state(&format!("http://{addr}"));
        s.headers.insert("user-agent".into(), "custom/1".into());
        transport.send(&prepare_request(&s).unwrap()).await.unwrap();

        let request_text = server.await.unwrap().to_lowercase();
        assert_eq!(request_text.matches("user-agent:").count(), 1, "{request_text}");
        assert!(request_text.contains("user-agent: custom/1"));
    }
}
