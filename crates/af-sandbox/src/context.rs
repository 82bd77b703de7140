//! The AF context: the single root object a script sees.

use serde_json::Value;

use crate::model::{InitialState, VariableValue};
use crate::protocol::ScalarField;
use crate::request::RequestFacade;
use crate::store::{DynStore, Emitter, FieldStore, ScriptValue, StoreName, WriteOutcome};

/// A script-visible field that is not a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// `af.request.method`
    Method,
    /// `af.request.url`
    Url,
    /// `af.request.path`
    Path,
    /// `af.request.bodyType`
    BodyType,
    /// `af.request.body.raw`
    Raw,
    /// `af.request.body.binary`
    Binary,
    /// `af.nodeId`
    NodeId,
    /// `af.projectId`
    ProjectId,
}

impl Field {
    /// Parse the script-side property name.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "method" => Field::Method,
            "url" => Field::Url,
            "path" => Field::Path,
            "bodyType" => Field::BodyType,
            "raw" => Field::Raw,
            "binary" => Field::Binary,
            "nodeId" => Field::NodeId,
            "projectId" => Field::ProjectId,
            _ => return None,
        })
    }

    fn scalar(self) -> Option<ScalarField> {
        match self {
            Field::Method => Some(ScalarField::Method),
            Field::Url => Some(ScalarField::Url),
            Field::Path => Some(ScalarField::Path),
            Field::BodyType => Some(ScalarField::BodyType),
            _ => None,
        }
    }
}

/// Root of the object graph exposed to scripts.
///
/// Built fresh for every sandbox instance; every store shares the instance's
/// [`Emitter`] and nothing else.
pub struct AfContext {
    /// The request facade.
    pub request: RequestFacade,
    /// Project variables. Mutations are broadcast but do not affect the sent request.
    pub variables: FieldStore<VariableValue>,
    /// Cookies.
    pub cookies: FieldStore<String>,
    /// Persisted local storage.
    pub local_storage: FieldStore<String>,
    /// Persisted session storage.
    pub session_storage: FieldStore<String>,
    node_id: Option<String>,
    project_id: Option<String>,
    emitter: Emitter,
}

impl AfContext {
    /// Build an empty context whose storage stores cap values at `max_storage_value_size` bytes.
    pub fn new(emitter: Emitter, max_storage_value_size: usize) -> Self {
        Self {
            request: RequestFacade::new(emitter.clone()),
            variables: FieldStore::new(StoreName::Variables, emitter.clone()),
            cookies: FieldStore::new(StoreName::Cookies, emitter.clone()),
            local_storage: FieldStore::new(StoreName::LocalStorage, emitter.clone())
                .with_max_value_size(max_storage_value_size),
            session_storage: FieldStore::new(StoreName::SessionStorage, emitter.clone())
                .with_max_value_size(max_storage_value_size),
            node_id: None,
            project_id: None,
            emitter,
        }
    }

    /// The emitter shared by every store of this context.
    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    /// Seed every store from a snapshot without emitting mutation messages.
    pub fn initialize(&mut self, state: InitialState) {
        let _window = self.emitter.seeding();
        self.request
            .seed_scalars(state.method, state.url, state.path, state.body_type);
        self.request.headers.seed(state.headers);
        self.request.query_params.seed(state.query_params);
        self.request.path_params.seed(state.path_params);
        self.request.body.seed(state.body);
        self.variables.seed(state.variables);
        self.cookies.seed(state.cookies);
        self.local_storage.seed(state.local_storage);
        self.session_storage.seed(state.session_storage);
        self.node_id = state.node_id;
        self.project_id = state.project_id;
    }

    /// Look up a store by wire name.
    pub fn store(&self, name: StoreName) -> &dyn DynStore {
        match name {
            StoreName::QueryParams => &self.request.query_params,
            StoreName::PathParams => &self.request.path_params,
            StoreName::Headers => &self.request.headers,
            StoreName::JsonBody => &self.request.body.json,
            StoreName::UrlencodedBody => &self.request.body.urlencoded,
            StoreName::FormdataBody => &self.request.body.formdata,
            StoreName::Variables => &self.variables,
            StoreName::Cookies => &self.cookies,
            StoreName::LocalStorage => &self.local_storage,
            StoreName::SessionStorage => &self.session_storage,
        }
    }

    /// Mutable lookup of a store by wire name.
    pub fn store_mut(&mut self, name: StoreName) -> &mut dyn DynStore {
        match name {
            StoreName::QueryParams => &mut self.request.query_params,
            StoreName::PathParams => &mut self.request.path_params,
            StoreName::Headers => &mut self.request.headers,
            StoreName::JsonBody => &mut self.request.body.json,
            StoreName::UrlencodedBody => &mut self.request.body.urlencoded,
            StoreName::FormdataBody => &mut self.request.body.formdata,
            StoreName::Variables => &mut self.variables,
            StoreName::Cookies => &mut self.cookies,
            StoreName::LocalStorage => &mut self.local_storage,
            StoreName::SessionStorage => &mut self.session_storage,
        }
    }

    /// Script view of a non-store field.
    pub fn read_field(&self, field: Field) -> Value {
        if let Some(scalar) = field.scalar() {
            return Value::String(self.request.scalar(scalar));
        }
        match field {
            Field::Raw => Value::String(self.request.body.raw().to_string()),
            Field::Binary => {
                serde_json::to_value(self.request.body.binary()).unwrap_or(Value::Null)
            }
            Field::NodeId => self.node_id.clone().map_or(Value::Null, Value::String),
            Field::ProjectId => self.project_id.clone().map_or(Value::Null, Value::String),
            _ => Value::Null,
        }
    }

    /// Write a non-store field. Identity fields are read-only.
    pub fn write_field(&mut self, field: Field, value: ScriptValue) -> WriteOutcome {
        if let Some(scalar) = field.scalar() {
            return self.request.write_scalar(scalar, value);
        }
        match field {
            Field::Raw => self.request.body.write_raw(value),
            Field::Binary => self.request.body.write_binary(value),
            Field::NodeId => {
                self.emitter.warn("af.nodeId is read-only, write ignored");
                WriteOutcome::Rejected
            }
            Field::ProjectId => {
                self.emitter.warn("af.projectId is read-only, write ignored");
                WriteOutcome::Rejected
            }
            _ => WriteOutcome::Rejected,
        }
    }

    /// Report an attempted structural deletion of a protected member. Never applied.
    pub fn guard_delete(&self, member: &str) {
        self.emitter.warn(format!(
            "cannot delete af.{member}: the context shape is fixed"
        ));
    }

    /// A full copy of the context, in the seed snapshot's shape.
    pub fn echo(&self) -> InitialState {
        InitialState {
            method: self.request.method().to_string(),
            url: self.request.url().to_string(),
            path: self.request.path().to_string(),
            query_params: self.request.query_params.entries().clone(),
            path_params: self.request.path_params.entries().clone(),
            headers: self.request.headers.entries().clone(),
            body: self.request.body.data(),
            body_type: self.request.body_type(),
            variables: self.variables.entries().clone(),
            cookies: self.cookies.entries().clone(),
            local_storage: self.local_storage.entries().clone(),
            session_storage: self.session_storage.entries().clone(),
            node_id: self.node_id.clone(),
            project_id: self.project_id.clone(),
        }
    }

    /// Script view of the request, used by `JSON.stringify(af.request)`.
    pub fn request_view(&self) -> Value {
        serde_json::json!({
            "method": self.request.method(),
            "url": self.request.url(),
            "path": self.request.path(),
            "bodyType": self.request.body_type(),
            "headers": self.request.headers.view(),
            "queryParams": self.request.query_params.view(),
            "pathParams": self.request.path_params.view(),
            "body": {
                "json": self.request.body.json.view(),
                "urlencoded": self.request.body.urlencoded.view(),
                "formdata": self.request.body.formdata.view(),
                "raw": self.request.body.raw(),
                "binary": self.read_field(Field::Binary),
            },
        })
    }

    /// Script view of the whole context, used by `JSON.stringify(af)`.
    pub fn view(&self) -> Value {
        serde_json::json!({
            "request": self.request_view(),
            "variables": self.variables.view(),
            "cookies": self.cookies.view(),
            "localStorage": self.local_storage.view(),
            "sessionStorage": self.session_storage.view(),
            "nodeId": self.node_id,
            "projectId": self.project_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HeaderValue;
    use crate::protocol::SandboxMessage;
    use crate::store::DEFAULT_MAX_STORAGE_VALUE_SIZE;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn context() -> (AfContext, UnboundedReceiver<SandboxMessage>) {
        let (tx, rx) = unbounded_channel();
        (
            AfContext::new(Emitter::new(tx), DEFAULT_MAX_STORAGE_VALUE_SIZE),
            rx,
        )
    }

    fn seed() -> InitialState {
        InitialState {
            method: "PUT".into(),
            url: "http://localhost:8080".into(),
            path: "/users/{id}".into(),
            path_params: BTreeMap::from([("id".into(), "7".into())]),
            headers: BTreeMap::from([
                ("Accept".into(), HeaderValue::Set("*/*".into())),
                ("User-Agent".into(), HeaderValue::Cleared),
            ]),
            cookies: BTreeMap::from([("sid".into(), "abc".into())]),
            node_id: Some("node-1".into()),
            project_id: Some("proj-1".into()),
            ..InitialState::default()
        }
    }

    #[test]
    fn initialize_is_silent_and_echo_matches_seed() {
        let (mut ctx, mut rx) = context();
        ctx.initialize(seed());
        ctx.initialize(seed());
        assert!(rx.try_recv().is_err());
        assert_eq!(ctx.echo(), seed());
        assert!(!ctx.emitter().is_seeding());
    }

    #[test]
    fn writes_after_initialize_emit() {
        let (mut ctx, mut rx) = context();
        ctx.initialize(seed());
        ctx.store_mut(StoreName::Cookies)
            .set("theme", ScriptValue::Json(json!("dark")));
        match rx.try_recv().unwrap() {
            SandboxMessage::StoreChanged {
                store, snapshot, ..
            } => {
                assert_eq!(store, StoreName::Cookies);
                assert_eq!(snapshot, json!({"sid": "abc", "theme": "dark"}));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn identity_fields_are_read_only() {
        let (mut ctx, mut rx) = context();
        ctx.initialize(seed());
        assert_eq!(ctx.read_field(Field::NodeId), json!("node-1"));
        assert_eq!(
            ctx.write_field(Field::NodeId, ScriptValue::Json(json!("other"))),
            WriteOutcome::Rejected
        );
        assert_eq!(ctx.read_field(Field::NodeId), json!("node-1"));
        assert!(matches!(
            rx.try_recv().unwrap(),
            SandboxMessage::Warning { .. }
        ));
    }

    #[test]
    fn guard_delete_only_warns() {
        let (mut ctx, mut rx) = context();
        ctx.initialize(seed());
        ctx.guard_delete("request.headers");
        match rx.try_recv().unwrap() {
            SandboxMessage::Warning { message } => assert!(message.contains("request.headers")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ctx.store(StoreName::Headers).keys().len(), 2);
    }

    #[test]
    fn views_hide_tags() {
        let (mut ctx, _rx) = context();
        let mut state = seed();
        state.variables.insert(
            "count".into(),
            VariableValue::infer(json!(2)),
        );
        ctx.initialize(state);
        let view = ctx.view();
        assert_eq!(view["variables"]["count"], json!(2));
        assert_eq!(view["request"]["headers"]["User-Agent"], Value::Null);
        assert_eq!(view["request"]["bodyType"], "none");
        assert_eq!(view["nodeId"], "node-1");
    }

    #[test]
    fn field_names_parse() {
        assert_eq!(Field::parse("bodyType"), Some(Field::BodyType));
        assert_eq!(Field::parse("raw"), Some(Field::Raw));
        assert_eq!(Field::parse("headers"), None);
    }
}
