//! Field stores: typed key/value mappings that validate every write and
//! broadcast each accepted mutation as a full snapshot.
//!
//! A store never shares its backing map. Each sandbox instance builds fresh
//! stores in [`AfContext::new`](crate::context::AfContext::new), and the only
//! way its contents reach the host is a [`SandboxMessage::StoreChanged`].

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::model::{FormDataKind, FormDataValue, HeaderValue, VariableValue};
use crate::protocol::SandboxMessage;

/// Default ceiling for one serialized local/session storage value: 100 KiB.
pub const DEFAULT_MAX_STORAGE_VALUE_SIZE: usize = 100 * 1024;

/// Identifies a field store on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreName {
    /// `af.request.queryParams`
    QueryParams,
    /// `af.request.pathParams`
    PathParams,
    /// `af.request.headers`
    Headers,
    /// `af.request.body.json`
    JsonBody,
    /// `af.request.body.urlencoded`
    UrlencodedBody,
    /// `af.request.body.formdata`
    FormdataBody,
    /// `af.variables`
    Variables,
    /// `af.cookies`
    Cookies,
    /// `af.localStorage`
    LocalStorage,
    /// `af.sessionStorage`
    SessionStorage,
}

impl StoreName {
    /// Every store, in wire order.
    pub const ALL: [StoreName; 10] = [
        StoreName::QueryParams,
        StoreName::PathParams,
        StoreName::Headers,
        StoreName::JsonBody,
        StoreName::UrlencodedBody,
        StoreName::FormdataBody,
        StoreName::Variables,
        StoreName::Cookies,
        StoreName::LocalStorage,
        StoreName::SessionStorage,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            StoreName::QueryParams => "query-params",
            StoreName::PathParams => "path-params",
            StoreName::Headers => "headers",
            StoreName::JsonBody => "json-body",
            StoreName::UrlencodedBody => "urlencoded-body",
            StoreName::FormdataBody => "formdata-body",
            StoreName::Variables => "variables",
            StoreName::Cookies => "cookies",
            StoreName::LocalStorage => "local-storage",
            StoreName::SessionStorage => "session-storage",
        }
    }

    /// Parse a wire name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }
}

impl std::fmt::Display for StoreName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set/delete half of a store mutation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Change {
    /// A key was written, or the whole store replaced.
    Set,
    /// A key was removed.
    Deleted,
}

/// A value handed over from script code.
///
/// Scripts may produce values JSON cannot carry; those arrive as `Unsupported`
/// naming their JavaScript type so the rejection warning can say what was written.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    /// A JSON-representable value.
    Json(Value),
    /// `undefined`, a function, a symbol, a bigint, or something that failed to serialize.
    Unsupported(String),
}

impl ScriptValue {
    /// Decode the envelope produced by the bootstrap's `encode` helper:
    /// `{"v": value}` or `{"t": "typename"}`.
    pub fn decode(raw: &str) -> Self {
        match serde_json::from_str::<serde_json::Map<String, Value>>(raw) {
            Ok(mut envelope) => {
                if let Some(value) = envelope.remove("v") {
                    ScriptValue::Json(value)
                } else {
                    let kind = envelope
                        .remove("t")
                        .and_then(|t| t.as_str().map(str::to_string))
                        .unwrap_or_else(|| "undefined".into());
                    ScriptValue::Unsupported(kind)
                }
            }
            Err(_) => ScriptValue::Unsupported("unserializable".into()),
        }
    }
}

/// JavaScript-flavoured type name of a JSON value, for warnings.
pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Result of offering a value to a store's type discipline.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission<V> {
    /// Accepted as-is.
    Accepted(V),
    /// Accepted after conversion; the string describes the conversion.
    Coerced(V, String),
    /// Refused; the string says why.
    Rejected(String),
}

/// A value type a [`FieldStore`] can hold.
pub trait FieldValue: Clone + Serialize + DeserializeOwned + 'static {
    /// Validate and convert a script-provided JSON value.
    fn admit(value: Value) -> Admission<Self>;

    /// What a script reads back for this entry.
    fn script_view(&self) -> Value;
}

fn admit_string(value: Value) -> Admission<String> {
    match value {
        Value::String(s) => Admission::Accepted(s),
        Value::Number(n) => {
            let s = n.to_string();
            let note = format!("coerced number {n} to string \"{s}\"");
            Admission::Coerced(s, note)
        }
        other => Admission::Rejected(format!(
            "expected a string, got {}",
            type_name(&other)
        )),
    }
}

impl FieldValue for String {
    fn admit(value: Value) -> Admission<Self> {
        admit_string(value)
    }

    fn script_view(&self) -> Value {
        Value::String(self.clone())
    }
}

impl FieldValue for HeaderValue {
    fn admit(value: Value) -> Admission<Self> {
        match admit_string(value) {
            Admission::Accepted(s) => Admission::Accepted(HeaderValue::Set(s)),
            Admission::Coerced(s, note) => Admission::Coerced(HeaderValue::Set(s), note),
            Admission::Rejected(reason) => Admission::Rejected(reason),
        }
    }

    fn script_view(&self) -> Value {
        match self {
            HeaderValue::Set(s) => Value::String(s.clone()),
            HeaderValue::Cleared => Value::Null,
        }
    }
}

impl FieldValue for FormDataValue {
    fn admit(value: Value) -> Admission<Self> {
        match value {
            Value::Object(ref map) if map.contains_key("kind") => {
                match serde_json::from_value::<FormDataValue>(value.clone()) {
                    Ok(entry) => Admission::Accepted(entry),
                    Err(_) => Admission::Rejected(
                        "form-data entries need kind \"text\" or \"file\" and a string value"
                            .into(),
                    ),
                }
            }
            other => match admit_string(other) {
                Admission::Accepted(s) => Admission::Accepted(FormDataValue::text(s)),
                Admission::Coerced(s, note) => Admission::Coerced(FormDataValue::text(s), note),
                Admission::Rejected(reason) => Admission::Rejected(reason),
            },
        }
    }

    fn script_view(&self) -> Value {
        let kind = match self.kind {
            FormDataKind::Text => "text",
            FormDataKind::File => "file",
        };
        serde_json::json!({ "kind": kind, "value": self.value })
    }
}

impl FieldValue for VariableValue {
    fn admit(value: Value) -> Admission<Self> {
        Admission::Accepted(VariableValue::infer(value))
    }

    fn script_view(&self) -> Value {
        self.value.clone()
    }
}

impl FieldValue for Value {
    fn admit(value: Value) -> Admission<Self> {
        Admission::Accepted(value)
    }

    fn script_view(&self) -> Value {
        self.clone()
    }
}

/// Outcome of a write, reported back to the caller after warnings were emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was applied as given.
    Applied,
    /// The write was applied after coercion, with a warning.
    Coerced,
    /// The write was refused with a warning; the store is unchanged.
    Rejected,
}

/// Sends sandbox messages on behalf of every store in one sandbox instance.
///
/// Mutation messages go through [`Emitter::emit`], which drops them while a
/// [`SeedWindow`] is open. Warnings, logs and bridge traffic are never suppressed.
#[derive(Clone)]
pub struct Emitter {
    outbox: UnboundedSender<SandboxMessage>,
    seeding: Rc<Cell<bool>>,
}

impl Emitter {
    /// Create an emitter writing to `outbox`.
    pub fn new(outbox: UnboundedSender<SandboxMessage>) -> Self {
        Self {
            outbox,
            seeding: Rc::new(Cell::new(false)),
        }
    }

    /// Emit a mutation message unless seeding is in progress.
    pub fn emit(&self, msg: SandboxMessage) {
        if self.seeding.get() {
            tracing::trace!(kind = msg.kind(), "mutation suppressed during seeding");
            return;
        }
        self.send(msg);
    }

    /// Send a message unconditionally.
    pub fn send(&self, msg: SandboxMessage) {
        if self.outbox.send(msg).is_err() {
            tracing::debug!("sandbox outbox closed, message dropped");
        }
    }

    /// Report a non-fatal validation warning.
    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(target: "af::sandbox::script", %message, "script warning");
        self.send(SandboxMessage::Warning { message });
    }

    /// Whether a seed window is currently open.
    pub fn is_seeding(&self) -> bool {
        self.seeding.get()
    }

    /// Open a seed window. Emission resumes when the guard drops.
    pub fn seeding(&self) -> SeedWindow {
        self.seeding.set(true);
        SeedWindow {
            seeding: self.seeding.clone(),
        }
    }
}

/// Guard returned by [`Emitter::seeding`].
pub struct SeedWindow {
    seeding: Rc<Cell<bool>>,
}

impl Drop for SeedWindow {
    fn drop(&mut self) {
        self.seeding.set(false);
    }
}

/// A typed key/value store with validated writes and snapshot broadcasting.
pub struct FieldStore<V> {
    name: StoreName,
    entries: BTreeMap<String, V>,
    emitter: Emitter,
    max_value_size: Option<usize>,
}

impl<V: FieldValue> FieldStore<V> {
    /// Create an empty store.
    pub fn new(name: StoreName, emitter: Emitter) -> Self {
        Self {
            name,
            entries: BTreeMap::new(),
            emitter,
            max_value_size: None,
        }
    }

    /// Reject values whose serialized size exceeds `max` bytes.
    pub fn with_max_value_size(mut self, max: usize) -> Self {
        self.max_value_size = Some(max);
        self
    }

    /// Which store this is.
    pub fn name(&self) -> StoreName {
        self.name
    }

    /// Read one entry.
    pub fn read(&self, key: &str) -> Option<&V> {
        self.entries.get(key)
    }

    /// All entries.
    pub fn entries(&self) -> &BTreeMap<String, V> {
        &self.entries
    }

    /// A deep, independent copy of the store in its wire representation.
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(&self.entries).unwrap_or(Value::Null)
    }

    /// Replace the contents from already-typed seed data. Never emits.
    pub fn seed(&mut self, entries: BTreeMap<String, V>) {
        self.entries = entries;
    }

    /// Write one key.
    pub fn write(&mut self, key: &str, value: ScriptValue) -> WriteOutcome {
        let (value, coerced) = match self.admit(key, value) {
            Some(admitted) => admitted,
            None => return WriteOutcome::Rejected,
        };
        self.entries.insert(key.to_string(), value);
        self.broadcast(Change::Set, Some(key));
        if coerced {
            WriteOutcome::Coerced
        } else {
            WriteOutcome::Applied
        }
    }

    /// Remove one key. Returns whether it was present.
    pub fn delete(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_none() {
            return false;
        }
        self.broadcast(Change::Deleted, Some(key));
        true
    }

    /// Replace the whole store from a script object.
    ///
    /// Each member is admitted as an individual write; refused members are
    /// dropped with a warning. A member equal to what the script reads for the
    /// same key is kept as stored, so spreading a store into its replacement
    /// preserves entries a script could not write itself, such as a header
    /// clear-marker. One message carries the resulting snapshot.
    pub fn replace(&mut self, value: ScriptValue) -> WriteOutcome {
        let members = match value {
            ScriptValue::Json(Value::Object(members)) => members,
            ScriptValue::Json(other) => {
                self.emitter.warn(format!(
                    "{}: cannot replace store with {}, expected an object",
                    self.name,
                    type_name(&other)
                ));
                return WriteOutcome::Rejected;
            }
            ScriptValue::Unsupported(kind) => {
                self.emitter.warn(format!(
                    "{}: cannot replace store with {kind}, expected an object",
                    self.name
                ));
                return WriteOutcome::Rejected;
            }
        };

        let mut entries = BTreeMap::new();
        let mut coerced = false;
        for (key, member) in members {
            if let Some(current) = self.entries.get(&key) {
                if current.script_view() == member {
                    entries.insert(key, current.clone());
                    continue;
                }
            }
            if let Some((value, was_coerced)) = self.admit(&key, ScriptValue::Json(member)) {
                coerced |= was_coerced;
                entries.insert(key, value);
            }
        }
        self.entries = entries;
        self.broadcast(Change::Set, None);
        if coerced {
            WriteOutcome::Coerced
        } else {
            WriteOutcome::Applied
        }
    }

    fn admit(&self, key: &str, value: ScriptValue) -> Option<(V, bool)> {
        let value = match value {
            ScriptValue::Json(value) => value,
            ScriptValue::Unsupported(kind) => {
                self.emitter
                    .warn(format!("{}[\"{key}\"]: cannot store a {kind}", self.name));
                return None;
            }
        };

        let (admitted, coerced) = match V::admit(value) {
            Admission::Accepted(v) => (v, false),
            Admission::Coerced(v, note) => {
                self.emitter.warn(format!("{}[\"{key}\"]: {note}", self.name));
                (v, true)
            }
            Admission::Rejected(reason) => {
                self.emitter
                    .warn(format!("{}[\"{key}\"]: {reason}, write ignored", self.name));
                return None;
            }
        };

        if let Some(max) = self.max_value_size {
            let size = serde_json::to_string(&admitted.script_view())
                .map(|s| s.len())
                .unwrap_or(usize::MAX);
            if size > max {
                self.emitter.warn(format!(
                    "{}[\"{key}\"]: value of {size} bytes exceeds the {max} byte limit, write ignored",
                    self.name
                ));
                return None;
            }
        }

        Some((admitted, coerced))
    }

    fn broadcast(&self, change: Change, key: Option<&str>) {
        self.emitter.emit(SandboxMessage::StoreChanged {
            store: self.name,
            change,
            key: key.map(str::to_string),
            snapshot: self.snapshot(),
        });
    }
}

/// Object-safe view over any [`FieldStore`], used by the script-facing ops.
pub trait DynStore {
    /// Which store this is.
    fn name(&self) -> StoreName;
    /// Script view of one entry.
    fn get(&self, key: &str) -> Option<Value>;
    /// Write one entry.
    fn set(&mut self, key: &str, value: ScriptValue) -> WriteOutcome;
    /// Remove one entry.
    fn remove(&mut self, key: &str) -> bool;
    /// Keys in store order.
    fn keys(&self) -> Vec<String>;
    /// Script view of the whole store.
    fn view(&self) -> Value;
    /// Replace the whole store.
    fn replace_all(&mut self, value: ScriptValue) -> WriteOutcome;
}

impl<V: FieldValue> DynStore for FieldStore<V> {
    fn name(&self) -> StoreName {
        self.name
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(FieldValue::script_view)
    }

    fn set(&mut self, key: &str, value: ScriptValue) -> WriteOutcome {
        self.write(key, value)
    }

    fn remove(&mut self, key: &str) -> bool {
        self.delete(key)
    }

    fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn view(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.script_view()))
                .collect(),
        )
    }

    fn replace_all(&mut self, value: ScriptValue) -> WriteOutcome {
        self.replace(value)
    }
}
