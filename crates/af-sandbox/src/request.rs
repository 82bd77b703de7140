//! The request facade: scalar fields plus the request's field stores.

use serde_json::Value;

use crate::model::{BinaryBody, BodyData, BodyType, FormDataValue, HeaderValue};
use crate::protocol::{SandboxMessage, ScalarField};
use crate::store::{type_name, Emitter, FieldStore, ScriptValue, StoreName, WriteOutcome};

/// Whether `method` is a valid HTTP method token (RFC 9110 `token`).
pub fn is_http_token(method: &str) -> bool {
    !method.is_empty()
        && method.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}

fn describe(value: &ScriptValue) -> &str {
    match value {
        ScriptValue::Json(v) => type_name(v),
        ScriptValue::Unsupported(kind) => kind,
    }
}

/// The five body variants. Only the one selected by `bodyType` is sent;
/// the others keep whatever they held.
pub struct BodyStore {
    /// Top-level members of the JSON body.
    pub json: FieldStore<Value>,
    /// Url-encoded fields.
    pub urlencoded: FieldStore<String>,
    /// Form-data entries.
    pub formdata: FieldStore<FormDataValue>,
    raw: String,
    binary: BinaryBody,
    emitter: Emitter,
}

impl BodyStore {
    /// Create empty body stores.
    pub fn new(emitter: Emitter) -> Self {
        Self {
            json: FieldStore::new(StoreName::JsonBody, emitter.clone()),
            urlencoded: FieldStore::new(StoreName::UrlencodedBody, emitter.clone()),
            formdata: FieldStore::new(StoreName::FormdataBody, emitter.clone()),
            raw: String::new(),
            binary: BinaryBody::default(),
            emitter,
        }
    }

    /// Replace every variant from seed data. Never emits.
    pub fn seed(&mut self, data: BodyData) {
        self.json.seed(data.json);
        self.urlencoded.seed(data.urlencoded);
        self.formdata.seed(data.formdata);
        self.raw = data.raw;
        self.binary = data.binary;
    }

    /// The raw body text.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The binary descriptor.
    pub fn binary(&self) -> &BinaryBody {
        &self.binary
    }

    /// Write the raw body. Strings only.
    pub fn write_raw(&mut self, value: ScriptValue) -> WriteOutcome {
        match value {
            ScriptValue::Json(Value::String(s)) => {
                self.raw = s.clone();
                self.emitter.emit(SandboxMessage::RawBodyChanged { value: s });
                WriteOutcome::Applied
            }
            other => {
                self.emitter.warn(format!(
                    "request.body.raw: expected a string, got {}, write ignored",
                    describe(&other)
                ));
                WriteOutcome::Rejected
            }
        }
    }

    /// Write the binary descriptor: `{mode: "variable" | "file", path}`.
    pub fn write_binary(&mut self, value: ScriptValue) -> WriteOutcome {
        let parsed = match &value {
            ScriptValue::Json(v @ Value::Object(_)) => {
                serde_json::from_value::<BinaryBody>(v.clone()).ok()
            }
            _ => None,
        };
        match parsed {
            Some(binary) => {
                self.binary = binary.clone();
                self.emitter
                    .emit(SandboxMessage::BinaryBodyChanged { value: binary });
                WriteOutcome::Applied
            }
            None => {
                self.emitter.warn(format!(
                    "request.body.binary: expected {{mode: \"variable\" | \"file\", path}}, got {}, write ignored",
                    describe(&value)
                ));
                WriteOutcome::Rejected
            }
        }
    }

    /// Current state of every variant.
    pub fn data(&self) -> BodyData {
        BodyData {
            json: self.json.entries().clone(),
            urlencoded: self.urlencoded.entries().clone(),
            formdata: self.formdata.entries().clone(),
            raw: self.raw.clone(),
            binary: self.binary.clone(),
        }
    }
}

/// Scalar request fields plus the request's field stores.
pub struct RequestFacade {
    method: String,
    url: String,
    path: String,
    body_type: BodyType,
    /// Request headers.
    pub headers: FieldStore<HeaderValue>,
    /// Query parameters.
    pub query_params: FieldStore<String>,
    /// Path parameters.
    pub path_params: FieldStore<String>,
    /// Body variants.
    pub body: BodyStore,
    emitter: Emitter,
}

impl RequestFacade {
    /// Create an empty facade: `GET` with no url and no body.
    pub fn new(emitter: Emitter) -> Self {
        Self {
            method: "GET".into(),
            url: String::new(),
            path: String::new(),
            body_type: BodyType::None,
            headers: FieldStore::new(StoreName::Headers, emitter.clone()),
            query_params: FieldStore::new(StoreName::QueryParams, emitter.clone()),
            path_params: FieldStore::new(StoreName::PathParams, emitter.clone()),
            body: BodyStore::new(emitter.clone()),
            emitter,
        }
    }

    /// Set the scalars from seed data. Never emits.
    pub fn seed_scalars(&mut self, method: String, url: String, path: String, body_type: BodyType) {
        self.method = method;
        self.url = url;
        self.path = path;
        self.body_type = body_type;
    }

    /// HTTP method.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Target URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Active body variant.
    pub fn body_type(&self) -> BodyType {
        self.body_type
    }

    /// Current value of a scalar field.
    pub fn scalar(&self, field: ScalarField) -> String {
        match field {
            ScalarField::Method => self.method.clone(),
            ScalarField::Url => self.url.clone(),
            ScalarField::Path => self.path.clone(),
            ScalarField::BodyType => self.body_type.as_str().to_string(),
        }
    }

    /// Write a scalar field. Strings only; `method` must be an HTTP token and
    /// `bodyType` one of the closed set.
    pub fn write_scalar(&mut self, field: ScalarField, value: ScriptValue) -> WriteOutcome {
        let label = match field {
            ScalarField::Method => "method",
            ScalarField::Url => "url",
            ScalarField::Path => "path",
            ScalarField::BodyType => "bodyType",
        };
        let text = match value {
            ScriptValue::Json(Value::String(s)) => s,
            other => {
                self.emitter.warn(format!(
                    "request.{label}: expected a string, got {}, write ignored",
                    describe(&other)
                ));
                return WriteOutcome::Rejected;
            }
        };

        match field {
            ScalarField::Method => {
                if !is_http_token(&text) {
                    self.emitter.warn(format!(
                        "request.method: \"{text}\" is not a valid HTTP method, write ignored"
                    ));
                    return WriteOutcome::Rejected;
                }
                self.method = text.clone();
            }
            ScalarField::Url => self.url = text.clone(),
            ScalarField::Path => self.path = text.clone(),
            ScalarField::BodyType => match BodyType::parse(&text) {
                Some(body_type) => self.body_type = body_type,
                None => {
                    self.emitter.warn(format!(
                        "request.bodyType: \"{text}\" is not one of none, json, urlencoded, formdata, binary, raw; write ignored"
                    ));
                    return WriteOutcome::Rejected;
                }
            },
        }

        self.emitter
            .emit(SandboxMessage::FieldChanged { field, value: text });
        WriteOutcome::Applied
    }

    /// The explicit "replace URL" verb.
    pub fn replace_url(&mut self, value: ScriptValue) -> WriteOutcome {
        self.write_scalar(ScalarField::Url, value)
    }
}
