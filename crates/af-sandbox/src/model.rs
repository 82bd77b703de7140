//! Value types shared by the field stores, the message contract and the host.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The active body encoding of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    /// No body is sent.
    #[default]
    None,
    /// The JSON body store, serialized as `application/json`.
    Json,
    /// The url-encoded body store.
    Urlencoded,
    /// The form-data body store, sent as multipart.
    Formdata,
    /// The binary descriptor.
    Binary,
    /// The raw text body.
    Raw,
}

impl BodyType {
    /// All accepted body types, in declaration order.
    pub const ALL: [BodyType; 6] = [
        BodyType::None,
        BodyType::Json,
        BodyType::Urlencoded,
        BodyType::Formdata,
        BodyType::Binary,
        BodyType::Raw,
    ];

    /// The wire name of this body type.
    pub fn as_str(self) -> &'static str {
        match self {
            BodyType::None => "none",
            BodyType::Json => "json",
            BodyType::Urlencoded => "urlencoded",
            BodyType::Formdata => "formdata",
            BodyType::Binary => "binary",
            BodyType::Raw => "raw",
        }
    }

    /// Parse a wire name. Matching is exact.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl std::fmt::Display for BodyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A header value, or the clear-marker asking the transport to suppress a header
/// it would otherwise add by default.
///
/// Serialized as a JSON string, or `null` for the clear-marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum HeaderValue {
    /// A concrete header value.
    Set(String),
    /// Deliberately cleared.
    Cleared,
}

impl HeaderValue {
    /// The concrete value, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Set(v) => Some(v),
            HeaderValue::Cleared => None,
        }
    }
}

impl From<Option<String>> for HeaderValue {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(v) => HeaderValue::Set(v),
            None => HeaderValue::Cleared,
        }
    }
}

impl From<HeaderValue> for Option<String> {
    fn from(value: HeaderValue) -> Self {
        match value {
            HeaderValue::Set(v) => Some(v),
            HeaderValue::Cleared => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Set(value.to_string())
    }
}

/// Kind tag of a form-data entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormDataKind {
    /// A plain text field.
    Text,
    /// A file part; `value` is a local path.
    File,
}

/// A single form-data entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormDataValue {
    /// Text or file.
    pub kind: FormDataKind,
    /// The text, or the file path.
    pub value: String,
}

impl FormDataValue {
    /// A text entry.
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            kind: FormDataKind::Text,
            value: value.into(),
        }
    }

    /// A file entry.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            kind: FormDataKind::File,
            value: path.into(),
        }
    }
}

/// Where a binary body comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryMode {
    /// `path` names a variable whose value is the body.
    Variable,
    /// `path` is a local file.
    #[default]
    File,
}

/// The binary body descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryBody {
    /// Variable or file.
    pub mode: BinaryMode,
    /// Variable name or file path.
    pub path: String,
}

/// JSON type tag of a stored variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    /// JSON string.
    String,
    /// JSON number.
    Number,
    /// JSON boolean.
    Boolean,
    /// JSON object.
    Object,
    /// JSON array.
    Array,
    /// JSON null.
    Null,
}

/// A tagged variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableValue {
    /// Type tag derived from `value`.
    pub kind: VariableKind,
    /// The value itself.
    pub value: Value,
}

impl VariableValue {
    /// Tag a plain JSON value with its kind.
    pub fn infer(value: Value) -> Self {
        let kind = match &value {
            Value::String(_) => VariableKind::String,
            Value::Number(_) => VariableKind::Number,
            Value::Bool(_) => VariableKind::Boolean,
            Value::Object(_) => VariableKind::Object,
            Value::Array(_) => VariableKind::Array,
            Value::Null => VariableKind::Null,
        };
        Self { kind, value }
    }
}

/// Body data for every variant. Only the one selected by [`BodyType`] is sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BodyData {
    /// Top-level members of the JSON body.
    ///
    /// The root is always an object. A body whose root is an array or a scalar
    /// cannot be seeded here, and the transport only ever sends an object.
    pub json: BTreeMap<String, Value>,
    /// Url-encoded fields.
    pub urlencoded: BTreeMap<String, String>,
    /// Form-data entries.
    pub formdata: BTreeMap<String, FormDataValue>,
    /// Raw text body.
    pub raw: String,
    /// Binary descriptor.
    pub binary: BinaryBody,
}

/// The full seed snapshot carried by `initialize`, and the shape of the host's
/// working copy of a request.
///
/// All values are already template-resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitialState {
    /// HTTP method.
    pub method: String,
    /// Target URL (base).
    pub url: String,
    /// Path appended to `url`.
    pub path: String,
    /// Query parameters.
    pub query_params: BTreeMap<String, String>,
    /// Values for `{name}` placeholders in the path.
    pub path_params: BTreeMap<String, String>,
    /// Request headers.
    pub headers: BTreeMap<String, HeaderValue>,
    /// Body data for every variant.
    pub body: BodyData,
    /// The active body variant.
    pub body_type: BodyType,
    /// Project variables.
    pub variables: BTreeMap<String, VariableValue>,
    /// Cookies sent with the request.
    pub cookies: BTreeMap<String, String>,
    /// Persisted local storage.
    pub local_storage: BTreeMap<String, String>,
    /// Persisted session storage.
    pub session_storage: BTreeMap<String, String>,
    /// Identity of the request node.
    pub node_id: Option<String>,
    /// Identity of the owning project.
    pub project_id: Option<String>,
}

impl Default for InitialState {
    fn default() -> Self {
        Self {
            method: "GET".into(),
            url: String::new(),
            path: String::new(),
            query_params: BTreeMap::new(),
            path_params: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: BodyData::default(),
            body_type: BodyType::None,
            variables: BTreeMap::new(),
            cookies: BTreeMap::new(),
            local_storage: BTreeMap::new(),
            session_storage: BTreeMap::new(),
            node_id: None,
            project_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_type_parses_closed_set_only() {
        for t in BodyType::ALL {
            assert_eq!(BodyType::parse(t.as_str()), Some(t));
        }
        assert_eq!(BodyType::parse("xml"), None);
        assert_eq!(BodyType::parse("JSON"), None);
    }

    #[test]
    fn header_clear_marker_is_null() {
        let headers: BTreeMap<String, HeaderValue> =
            serde_json::from_str(r#"{"Accept":"*/*","User-Agent":null}"#).unwrap();
        assert_eq!(headers["Accept"], HeaderValue::Set("*/*".into()));
        assert_eq!(headers["User-Agent"], HeaderValue::Cleared);
        let back = serde_json::to_value(&headers).unwrap();
        assert_eq!(back["User-Agent"], Value::Null);
    }

    #[test]
    fn variable_kind_is_inferred() {
        assert_eq!(
            VariableValue::infer(serde_json::json!(3)).kind,
            VariableKind::Number
        );
        assert_eq!(
            VariableValue::infer(serde_json::json!({"a": 1})).kind,
            VariableKind::Object
        );
        assert_eq!(VariableValue::infer(Value::Null).kind, VariableKind::Null);
    }

    #[test]
    fn initial_state_uses_camel_case_and_defaults() {
        let state: InitialState = serde_json::from_str(
            r#"{"url":"http://x","queryParams":{"a":"1"},"bodyType":"raw","body":{"raw":"hi"}}"#,
        )
        .unwrap();
        assert_eq!(state.method, "GET");
        assert_eq!(state.query_params["a"], "1");
        assert_eq!(state.body_type, BodyType::Raw);
        assert_eq!(state.body.raw, "hi");
        assert_eq!(state.body.binary.mode, BinaryMode::File);
    }

    #[test]
    fn json_body_root_must_be_an_object() {
        let body: BodyData = serde_json::from_str(r#"{"json":{"items":[1,2]}}"#).unwrap();
        assert_eq!(body.json["items"], serde_json::json!([1, 2]));

        assert!(serde_json::from_str::<BodyData>(r#"{"json":[1,2]}"#).is_err());
        assert!(serde_json::from_str::<BodyData>(r#"{"json":"text"}"#).is_err());
    }
}
